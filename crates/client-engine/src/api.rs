//! Public API types for the in-process `trawler-client` worker.

use std::time::Duration;

use reqwest::Url;
use serde::{Deserialize, Serialize};

/// How to start and size one engine subprocess.
#[derive(Debug, Clone)]
pub struct EngineSpec {
    /// Engine command (path or name resolved via `PATH`).
    pub command: String,
    /// Extra arguments passed to the engine command.
    pub args: Vec<String>,
    /// Search threads per engine process (`setoption name Threads`).
    pub threads: u32,
    /// Hash table size per engine process in MiB (`setoption name Hash`).
    pub hash_mib: u32,
    /// Additional UCI options applied after the handshake.
    pub options: Vec<(String, String)>,
    /// How long the handshake (`uci` … `uciok`, `isready` … `readyok`) may
    /// take before startup is considered failed.
    pub start_timeout: Duration,
    /// Hard cap on a single `analyze` call when the job carries no movetime
    /// limit. A call exceeding it marks the handle dead.
    pub analyze_cap: Duration,
}

impl EngineSpec {
    /// Default handshake timeout.
    pub const DEFAULT_START_TIMEOUT: Duration = Duration::from_secs(15);

    /// Default per-call analysis cap.
    pub const DEFAULT_ANALYZE_CAP: Duration = Duration::from_secs(120);

    /// Spec for `command` with library defaults everywhere else.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            threads: 1,
            hash_mib: 64,
            options: Vec::new(),
            start_timeout: Self::DEFAULT_START_TIMEOUT,
            analyze_cap: Self::DEFAULT_ANALYZE_CAP,
        }
    }
}

/// Configuration for the in-process worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Queue base URL (e.g. `https://queue.example/`).
    pub endpoint: Url,

    /// API key presented at registration.
    pub key: Option<String>,

    /// Number of engine processes to run concurrently. This is also the
    /// bound on in-flight jobs.
    pub parallel: usize,

    /// Engine subprocess spec, shared by all pool slots.
    pub engine: EngineSpec,

    /// Consecutive failed respawns after which a pool slot is retired.
    pub respawn_attempts: u32,

    /// Consecutive session rejections after which the worker halts.
    pub rejection_threshold: u32,

    /// Local retries for a failed position before the job is abandoned.
    pub position_retries: u32,

    /// Safety margin subtracted from the lease deadline; a job past
    /// `deadline - margin` is abandoned rather than submitted late.
    pub lease_margin: Duration,

    /// Maximum number of completed jobs retained in the snapshot.
    pub recent_jobs_max: usize,
}

impl WorkerConfig {
    /// Default respawn attempt budget per pool slot.
    pub const DEFAULT_RESPAWN_ATTEMPTS: u32 = 5;

    /// Default consecutive-rejection threshold before halting.
    pub const DEFAULT_REJECTION_THRESHOLD: u32 = 3;

    /// Default per-position local retry budget.
    pub const DEFAULT_POSITION_RETRIES: u32 = 2;

    /// Default lease safety margin.
    pub const DEFAULT_LEASE_MARGIN: Duration = Duration::from_secs(5);

    /// Default size of the recent-jobs ring buffer.
    pub const DEFAULT_RECENT_JOBS_MAX: usize = 100;

    /// Config for `endpoint` and `engine` with library defaults everywhere
    /// else and parallelism 1.
    pub fn new(endpoint: Url, engine: EngineSpec) -> Self {
        Self {
            endpoint,
            key: None,
            parallel: 1,
            engine,
            respawn_attempts: Self::DEFAULT_RESPAWN_ATTEMPTS,
            rejection_threshold: Self::DEFAULT_REJECTION_THRESHOLD,
            position_retries: Self::DEFAULT_POSITION_RETRIES,
            lease_margin: Self::DEFAULT_LEASE_MARGIN,
            recent_jobs_max: Self::DEFAULT_RECENT_JOBS_MAX,
        }
    }
}

/// Session lifecycle as seen by the queue.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SessionState {
    /// No session yet.
    Unregistered,
    /// Registration in progress.
    Registering,
    /// Session established; fetch/submit allowed.
    Active,
    /// Keepalive failing transiently; auto-recovers.
    Degraded,
    /// Queue rejected the worker repeatedly. Terminal.
    Halted,
}

/// Terminal status of one processed job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum JobStatus {
    /// All positions analyzed and the payload was accepted by the queue.
    Submitted,
    /// The job was given up locally (failed positions or expired lease);
    /// the queue redelivers it when the lease runs out.
    Abandoned,
    /// Analysis succeeded but submission retries were exhausted; the result
    /// is lost and the lease expires server-side.
    Lost,
}

/// Result of a completed job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobOutcome {
    /// Queue job identifier.
    pub job_id: String,
    /// Number of positions in the job.
    pub positions: usize,
    /// Terminal status.
    pub status: JobStatus,
    /// Human-readable failure detail, for abandoned/lost jobs.
    pub error: Option<String>,
    /// Submission attempts made (0 when never submitted).
    pub submit_attempts: u32,
    /// Total engine nodes searched across positions.
    pub nodes: u64,
    /// Total analysis time (milliseconds).
    pub analyze_ms: u64,
    /// Total submission time (milliseconds).
    pub submit_ms: u64,
    /// Total job time (milliseconds).
    pub total_ms: u64,
}

/// Worker event stream payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum WorkerEvent {
    /// Worker started.
    Started,
    /// Graceful shutdown requested; in-flight jobs are drained.
    StopRequested,
    /// Session state transition.
    Session {
        /// New state.
        state: SessionState,
    },
    /// A leased job began executing.
    JobStarted {
        /// Queue job identifier.
        job_id: String,
        /// Number of positions in the job.
        positions: usize,
    },
    /// One position of a job finished analyzing.
    PositionAnalyzed {
        /// Queue job identifier.
        job_id: String,
        /// Zero-based position index.
        index: usize,
        /// Number of positions in the job.
        of: usize,
    },
    /// A job reached a terminal status.
    JobFinished {
        /// Job outcome.
        outcome: JobOutcome,
    },
    /// A dead engine slot came back after a respawn.
    EngineRespawned {
        /// Pool slot index (0-based).
        slot: usize,
    },
    /// A pool slot was retired after exhausting its respawn budget.
    SlotRetired {
        /// Pool slot index (0-based).
        slot: usize,
    },
    /// A warning from the worker.
    Warning {
        /// Warning message.
        message: String,
    },
    /// A non-fatal error from the worker.
    Error {
        /// Error message.
        message: String,
    },
    /// Worker stopped.
    Stopped,
}

/// Current worker state snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusSnapshot {
    /// Whether the worker has been asked to stop.
    pub stop_requested: bool,
    /// Current session state.
    pub session: SessionState,
    /// Live engine slots (initial parallelism minus retired slots).
    pub capacity: usize,
    /// Jobs currently executing.
    pub inflight_jobs: usize,
    /// Recently completed jobs (newest last).
    pub recent_jobs: Vec<JobOutcome>,
}

/// Handle to a running in-process worker instance.
pub struct WorkerHandle {
    pub(crate) inner: std::sync::Arc<crate::runtime::WorkerInner>,
    pub(crate) join: tokio::task::JoinHandle<anyhow::Result<()>>,
}

/// Start a new in-process worker instance against the HTTP queue named in
/// the config.
pub fn start_worker(config: WorkerConfig) -> WorkerHandle {
    crate::runtime::start_worker(config)
}

/// Start a worker against a caller-supplied [`crate::queue::QueueApi`]
/// implementation instead of the HTTP queue. The config's `endpoint` is
/// ignored.
pub fn start_worker_with_queue(
    config: WorkerConfig,
    queue: std::sync::Arc<dyn crate::queue::QueueApi>,
) -> WorkerHandle {
    crate::runtime::start_worker_with_queue(config, queue)
}

impl WorkerHandle {
    /// Subscribe to the worker event stream.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<WorkerEvent> {
        self.inner.event_tx.subscribe()
    }

    /// Get the latest worker snapshot.
    pub fn snapshot(&self) -> StatusSnapshot {
        self.inner.snapshot_rx.borrow().clone()
    }

    /// Request a graceful shutdown (drain in-flight jobs, stop fetching).
    pub fn request_stop(&self) {
        self.inner.request_stop();
    }

    /// Wait for the worker to stop, returning the runtime task result.
    ///
    /// A `Halted` session or an exhausted engine pool surfaces here as an
    /// error so the process can exit non-zero.
    pub async fn wait(self) -> anyhow::Result<()> {
        match self.join.await {
            Ok(res) => res,
            Err(err) => Err(anyhow::anyhow!("worker task join error: {err}")),
        }
    }
}
