//! Queue wire contract.
//!
//! The queue service owns the exact schema; this module pins the JSON shape
//! the worker speaks and tolerates additive changes (unknown fields are
//! ignored everywhere). [`QueueApi`] is the seam the runtime talks through,
//! so tests can drive the worker against an in-memory queue.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};

/// Extra client-side slack on top of the server's advertised long-poll wait,
/// so an empty acquire is distinguishable from a stalled connection.
const LONG_POLL_MARGIN: Duration = Duration::from_secs(10);

/// Worker capability descriptor sent at registration.
#[derive(Debug, Clone, Serialize)]
pub struct Capability {
    /// Engine name/version from the UCI handshake.
    pub engine: EngineIdent,
    /// Number of engine slots (upper bound on leased jobs).
    pub concurrency: usize,
    /// Limit kinds the worker accepts (`depth`, `nodes`, `movetime`).
    pub limit_kinds: Vec<String>,
    /// Client software identity.
    pub client: ClientIdent,
}

/// Engine identity advertised to the queue.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EngineIdent {
    /// Engine name as reported by `id name`.
    pub name: String,
    /// Engine-reported version, when distinguishable from the name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// Client software identity.
#[derive(Debug, Clone, Serialize)]
pub struct ClientIdent {
    /// Client name.
    pub name: String,
    /// Client version.
    pub version: String,
}

/// An established session with the queue.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerSession {
    /// Bearer token for fetch/submit/keepalive.
    pub token: String,
    /// Keepalive interval requested by the queue.
    pub keepalive_secs: u64,
    /// Longest the acquire endpoint may block server-side before returning
    /// empty.
    pub max_wait_secs: u64,
}

/// One position to analyze: a FEN plus the moves leading to it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PositionSpec {
    /// Base position in FEN.
    pub fen: String,
    /// UCI moves applied on top of `fen`.
    #[serde(default)]
    pub moves: Vec<String>,
}

/// Search limits for the positions of a job. Any combination may be set;
/// with none set the worker falls back to a node budget plus a movetime cap.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AnalysisLimits {
    /// Search depth limit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depth: Option<u32>,
    /// Node budget.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nodes: Option<u64>,
    /// Time budget per position in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub movetime_ms: Option<u64>,
    /// Number of principal variations to report.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multipv: Option<u32>,
}

impl AnalysisLimits {
    /// Default node budget when the job carries no limits at all.
    pub const DEFAULT_NODES: u64 = 3_500_000;
    /// Movetime cap paired with the default node budget.
    pub const DEFAULT_MOVETIME_MS: u64 = 4_000;

    /// Limits with the unbounded case normalized away.
    pub fn effective(&self) -> AnalysisLimits {
        let mut limits = *self;
        if limits.depth.is_none() && limits.nodes.is_none() && limits.movetime_ms.is_none() {
            limits.nodes = Some(Self::DEFAULT_NODES);
            limits.movetime_ms = Some(Self::DEFAULT_MOVETIME_MS);
        }
        limits
    }
}

/// Job priority class.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Default class.
    #[default]
    Normal,
    /// Interactive requests; processed before normal work.
    High,
}

/// A leased unit of work.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Job {
    /// Opaque job identifier, unique per in-flight job.
    pub id: String,
    /// Priority class.
    #[serde(default)]
    pub priority: Priority,
    /// Lease duration granted with this delivery.
    pub lease_secs: u64,
    /// Chess variant; standard when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
    /// Positions to analyze, in payload order.
    pub positions: Vec<PositionSpec>,
    /// Per-position limits.
    #[serde(default)]
    pub limits: AnalysisLimits,
}

/// Engine evaluation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Score {
    /// Centipawns from the side to move.
    Cp(i32),
    /// Moves until mate (negative: getting mated).
    Mate(i32),
}

/// One additional principal variation (MultiPV > 1).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Variation {
    /// 1-based MultiPV rank.
    pub multipv: u32,
    /// Evaluation of this line.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<Score>,
    /// The line itself, UCI moves.
    pub pv: Vec<String>,
}

/// Engine output for one position. Immutable once produced.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AnalysisResult {
    /// Best move, absent for terminal positions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub best_move: Option<String>,
    /// Principal variation.
    #[serde(default)]
    pub pv: Vec<String>,
    /// Final evaluation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<Score>,
    /// Search depth reached.
    #[serde(default)]
    pub depth: u32,
    /// Selective depth, when reported.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seldepth: Option<u32>,
    /// Nodes searched.
    #[serde(default)]
    pub nodes: u64,
    /// Search time in milliseconds.
    #[serde(default)]
    pub time_ms: u64,
    /// Nodes per second, when plausible (exorbitant values are dropped).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nps: Option<u64>,
    /// Additional variations when MultiPV was requested.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variations: Option<Vec<Variation>>,
}

/// Completed-job payload posted back to the queue, results in request order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResultPayload {
    /// One result per position, matching the job's position order.
    pub results: Vec<AnalysisResult>,
}

/// Work-fetch failure.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// Network trouble or server overload; retried with backoff.
    #[error("transient fetch failure: {0}")]
    Transient(String),
    /// Malformed response or protocol mismatch; escalated to the session
    /// manager.
    #[error("fatal fetch failure: {0}")]
    Fatal(String),
    /// The queue no longer accepts this session.
    #[error("session rejected by queue")]
    Rejected,
}

/// Result-submission failure.
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    /// Network trouble or server overload; retried with backoff.
    #[error("transient submit failure: {0}")]
    Transient(String),
    /// Malformed response or protocol mismatch.
    #[error("fatal submit failure: {0}")]
    Fatal(String),
    /// The job is gone server-side (unknown, re-leased, or already done).
    /// Terminal for this job only.
    #[error("job gone: {0}")]
    Gone(String),
    /// The queue no longer accepts this session.
    #[error("session rejected by queue")]
    Rejected,
}

/// Registration/keepalive failure.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Network trouble; retried with backoff.
    #[error("transient session failure: {0}")]
    Transient(String),
    /// Malformed response or protocol mismatch.
    #[error("fatal session failure: {0}")]
    Fatal(String),
    /// Credentials refused.
    #[error("worker rejected by queue")]
    Rejected,
}

/// The queue endpoints the worker consumes.
#[async_trait]
pub trait QueueApi: Send + Sync {
    /// Exchange a capability descriptor (and optional API key) for a session.
    async fn register(
        &self,
        capability: &Capability,
        key: Option<&str>,
    ) -> Result<WorkerSession, SessionError>;

    /// Refresh the session.
    async fn keepalive(&self, token: &str) -> Result<(), SessionError>;

    /// Lease up to `max_jobs` jobs. May long-poll server-side; an empty
    /// vector means "no work right now".
    async fn acquire(&self, token: &str, max_jobs: usize) -> Result<Vec<Job>, FetchError>;

    /// Deliver a completed job payload. Idempotent per job id server-side.
    async fn submit(
        &self,
        token: &str,
        job_id: &str,
        payload: &ResultPayload,
    ) -> Result<(), SubmitError>;

    /// Return an unstarted job early so the queue can redeliver it without
    /// waiting for the lease. Best-effort.
    async fn abort(&self, token: &str, job_id: &str) -> Result<(), SubmitError>;
}

#[derive(Debug, Serialize)]
struct AcquireRequest {
    max_jobs: usize,
}

#[derive(Debug, Deserialize)]
struct AcquireResponse {
    #[serde(default)]
    jobs: Vec<Job>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    code: String,
}

/// The production queue client over HTTP.
pub struct HttpQueue {
    http: reqwest::Client,
    base: Url,
    /// Advertised acquire long-poll bound, learned at registration.
    max_wait_secs: AtomicU64,
}

impl HttpQueue {
    /// Default timeout for everything except the long-polled acquire call.
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

    /// Build a queue client for `base`.
    pub fn new(base: Url) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Self::DEFAULT_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            base,
            max_wait_secs: AtomicU64::new(0),
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, String> {
        self.base.join(path).map_err(|err| err.to_string())
    }
}

fn sniff_error_code(body: &str) -> Option<String> {
    serde_json::from_str::<ApiErrorBody>(body)
        .ok()
        .map(|e| e.code)
}

fn is_rejection(status: StatusCode) -> bool {
    status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN
}

fn is_transient(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
}

/// Statuses the submit endpoint answers for a job it no longer holds:
/// unknown, re-leased elsewhere, or already completed.
fn is_gone(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::NOT_FOUND | StatusCode::CONFLICT | StatusCode::GONE
    )
}

#[async_trait]
impl QueueApi for HttpQueue {
    async fn register(
        &self,
        capability: &Capability,
        key: Option<&str>,
    ) -> Result<WorkerSession, SessionError> {
        let url = self
            .endpoint("register")
            .map_err(SessionError::Fatal)?;
        let mut req = self.http.post(url).json(capability);
        if let Some(key) = key {
            req = req.bearer_auth(key);
        }
        let res = req
            .send()
            .await
            .map_err(|err| SessionError::Transient(format!("{err:#}")))?;

        let status = res.status();
        if is_rejection(status) {
            return Err(SessionError::Rejected);
        }
        if is_transient(status) {
            return Err(SessionError::Transient(format!("http {status}")));
        }
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(SessionError::Fatal(format!("http {status}: {body}")));
        }

        let session: WorkerSession = res
            .json()
            .await
            .map_err(|err| SessionError::Fatal(format!("bad register response: {err:#}")))?;
        self.max_wait_secs
            .store(session.max_wait_secs, Ordering::Relaxed);
        Ok(session)
    }

    async fn keepalive(&self, token: &str) -> Result<(), SessionError> {
        let url = self
            .endpoint("keepalive")
            .map_err(SessionError::Fatal)?;
        let res = self
            .http
            .post(url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|err| SessionError::Transient(format!("{err:#}")))?;

        let status = res.status();
        if is_rejection(status) {
            return Err(SessionError::Rejected);
        }
        if status.is_success() {
            return Ok(());
        }
        if is_transient(status) {
            return Err(SessionError::Transient(format!("http {status}")));
        }
        let body = res.text().await.unwrap_or_default();
        Err(SessionError::Fatal(format!("http {status}: {body}")))
    }

    async fn acquire(&self, token: &str, max_jobs: usize) -> Result<Vec<Job>, FetchError> {
        let url = self.endpoint("acquire").map_err(FetchError::Fatal)?;
        let max_wait = Duration::from_secs(self.max_wait_secs.load(Ordering::Relaxed));
        let res = self
            .http
            .post(url)
            .bearer_auth(token)
            .timeout(max_wait + LONG_POLL_MARGIN)
            .json(&AcquireRequest { max_jobs })
            .send()
            .await
            .map_err(|err| FetchError::Transient(format!("{err:#}")))?;

        let status = res.status();
        if status == StatusCode::NO_CONTENT {
            return Ok(Vec::new());
        }
        if is_rejection(status) {
            return Err(FetchError::Rejected);
        }
        if is_transient(status) {
            return Err(FetchError::Transient(format!("http {status}")));
        }
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            if sniff_error_code(&body).as_deref() == Some("unsupported_client") {
                return Err(FetchError::Fatal(
                    "queue requires a newer client version".to_string(),
                ));
            }
            return Err(FetchError::Fatal(format!("http {status}: {body}")));
        }

        let batch: AcquireResponse = res
            .json()
            .await
            .map_err(|err| FetchError::Fatal(format!("bad acquire response: {err:#}")))?;
        Ok(batch.jobs)
    }

    async fn submit(
        &self,
        token: &str,
        job_id: &str,
        payload: &ResultPayload,
    ) -> Result<(), SubmitError> {
        let url = self
            .endpoint(&format!("submit/{job_id}"))
            .map_err(SubmitError::Fatal)?;
        let res = self
            .http
            .post(url)
            .bearer_auth(token)
            .json(payload)
            .send()
            .await
            .map_err(|err| SubmitError::Transient(format!("{err:#}")))?;

        let status = res.status();
        if status.is_success() {
            return Ok(());
        }
        if is_rejection(status) {
            return Err(SubmitError::Rejected);
        }
        if is_gone(status) {
            let body = res.text().await.unwrap_or_default();
            return Err(SubmitError::Gone(format!("http {status}: {body}")));
        }
        if is_transient(status) {
            return Err(SubmitError::Transient(format!("http {status}")));
        }
        let body = res.text().await.unwrap_or_default();
        Err(SubmitError::Fatal(format!("http {status}: {body}")))
    }

    async fn abort(&self, token: &str, job_id: &str) -> Result<(), SubmitError> {
        let url = self
            .endpoint(&format!("abort/{job_id}"))
            .map_err(SubmitError::Fatal)?;
        let res = self
            .http
            .post(url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|err| SubmitError::Transient(format!("{err:#}")))?;

        if res.status().is_success() {
            Ok(())
        } else {
            Err(SubmitError::Transient(format!("http {}", res.status())))
        }
    }
}
