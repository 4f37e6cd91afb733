//! Shared leaf crate for `trawler-client`: on-disk worker configuration and
//! the retry/backoff policy used by the fetch, submit and session paths.

pub mod config;
pub mod retry;
