//! Shared fixtures for the engine/pool/runner test suites: shell-script fake
//! UCI engines and an in-memory queue.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use crate::api::EngineSpec;
use crate::queue::{
    Capability, FetchError, Job, QueueApi, ResultPayload, SessionError, SubmitError, WorkerSession,
};

/// Minimal well-behaved UCI engine as a shell loop.
pub(crate) const FAKE_ENGINE: &str = r#"
while IFS= read -r line; do
  case "$line" in
    uci)
      echo "id name FakeFish 1.0"
      echo "uciok"
      ;;
    isready) echo "readyok" ;;
    go*)
      echo "info depth 10 seldepth 12 nodes 5000 nps 100000 time 50 score cp 23 pv e2e4 e7e5"
      echo "bestmove e2e4"
      ;;
    quit) exit 0 ;;
    *) : ;;
  esac
done
"#;

/// Engine that handshakes fine and dies on the first search.
pub(crate) const CRASH_ON_GO_ENGINE: &str = r#"
while IFS= read -r line; do
  case "$line" in
    uci)
      echo "id name CrashFish 0.1"
      echo "uciok"
      ;;
    isready) echo "readyok" ;;
    go*) exit 7 ;;
    quit) exit 0 ;;
    *) : ;;
  esac
done
"#;

pub(crate) fn fake_engine_spec(script: &str) -> EngineSpec {
    let mut spec = EngineSpec::new("sh");
    spec.args = vec!["-c".to_string(), script.to_string()];
    spec.start_timeout = Duration::from_secs(5);
    spec.analyze_cap = Duration::from_secs(5);
    spec
}

/// In-memory queue double. Jobs are handed out from a scripted sequence of
/// acquire outcomes; submissions and aborts are recorded for assertions.
pub(crate) struct MockQueue {
    /// Scripted acquire results, consumed front to back; an empty deque
    /// means "no work" from then on.
    pub(crate) acquire_script: Mutex<VecDeque<Result<Vec<Job>, FetchError>>>,
    /// `(job_id, payload)` of accepted submissions.
    pub(crate) submitted: Mutex<Vec<(String, ResultPayload)>>,
    /// Job ids aborted by the worker.
    pub(crate) aborted: Mutex<Vec<String>>,
    /// Scripted submit failures, consumed before submissions succeed.
    pub(crate) submit_failures: Mutex<VecDeque<SubmitError>>,
    /// When set, every register/keepalive call is rejected.
    pub(crate) reject_sessions: std::sync::atomic::AtomicBool,
    pub(crate) fetch_calls: AtomicU32,
    pub(crate) register_calls: AtomicU32,
}

impl MockQueue {
    pub(crate) fn new() -> Self {
        Self {
            acquire_script: Mutex::new(VecDeque::new()),
            submitted: Mutex::new(Vec::new()),
            aborted: Mutex::new(Vec::new()),
            submit_failures: Mutex::new(VecDeque::new()),
            reject_sessions: std::sync::atomic::AtomicBool::new(false),
            fetch_calls: AtomicU32::new(0),
            register_calls: AtomicU32::new(0),
        }
    }

    pub(crate) fn push_jobs(&self, jobs: Vec<Job>) {
        self.acquire_script.lock().unwrap().push_back(Ok(jobs));
    }

    pub(crate) fn push_fetch_error(&self, err: FetchError) {
        self.acquire_script.lock().unwrap().push_back(Err(err));
    }
}

#[async_trait]
impl QueueApi for MockQueue {
    async fn register(
        &self,
        _capability: &Capability,
        _key: Option<&str>,
    ) -> Result<WorkerSession, SessionError> {
        self.register_calls.fetch_add(1, Ordering::SeqCst);
        if self.reject_sessions.load(Ordering::SeqCst) {
            return Err(SessionError::Rejected);
        }
        Ok(WorkerSession {
            token: "test-token".to_string(),
            keepalive_secs: 3600,
            max_wait_secs: 1,
        })
    }

    async fn keepalive(&self, _token: &str) -> Result<(), SessionError> {
        if self.reject_sessions.load(Ordering::SeqCst) {
            return Err(SessionError::Rejected);
        }
        Ok(())
    }

    async fn acquire(&self, _token: &str, _max_jobs: usize) -> Result<Vec<Job>, FetchError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        if self.reject_sessions.load(Ordering::SeqCst) {
            return Err(FetchError::Rejected);
        }
        match self.acquire_script.lock().unwrap().pop_front() {
            Some(result) => result,
            None => Ok(Vec::new()),
        }
    }

    async fn submit(
        &self,
        _token: &str,
        job_id: &str,
        payload: &ResultPayload,
    ) -> Result<(), SubmitError> {
        if let Some(err) = self.submit_failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        self.submitted
            .lock()
            .unwrap()
            .push((job_id.to_string(), payload.clone()));
        Ok(())
    }

    async fn abort(&self, _token: &str, job_id: &str) -> Result<(), SubmitError> {
        self.aborted.lock().unwrap().push(job_id.to_string());
        Ok(())
    }
}

/// A one-position job with the given id.
pub(crate) fn job(id: &str, positions: usize) -> Job {
    Job {
        id: id.to_string(),
        priority: Default::default(),
        lease_secs: 120,
        variant: None,
        positions: (0..positions)
            .map(|_| crate::queue::PositionSpec {
                fen: "rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq - 0 1".to_string(),
                moves: vec![],
            })
            .collect(),
        limits: crate::queue::AnalysisLimits {
            depth: Some(8),
            ..Default::default()
        },
    }
}
