#![forbid(unsafe_code)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]

//! In-process worker runtime for `trawler-client` (session management, job
//! leasing, UCI engine pool, analysis, result submission).

/// Public API for the worker crate.
pub mod api;

/// Queue wire contract: DTOs, the [`queue::QueueApi`] seam and its HTTP
/// implementation.
pub mod queue;

mod engine;
mod pool;
mod runner;
mod runtime;
mod session;
#[cfg(test)]
mod testutil;
mod uci;

pub use api::{
    start_worker, start_worker_with_queue, EngineSpec, JobOutcome, JobStatus, SessionState,
    StatusSnapshot, WorkerConfig, WorkerEvent, WorkerHandle,
};
