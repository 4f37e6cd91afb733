use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use tokio::sync::{RwLock, broadcast, watch};

use trawler_client_core::retry::RetryPolicy;

use crate::api::{SessionState, WorkerEvent};
use crate::queue::{Capability, QueueApi, SessionError, WorkerSession};

/// Keepalive cadence when the queue does not advertise one.
const DEFAULT_KEEPALIVE: Duration = Duration::from_secs(30);

/// Consecutive transient registration failures tolerated before the worker
/// gives up and halts. At the session backoff cap this spans several minutes
/// of an unreachable queue.
const REGISTER_ATTEMPT_LIMIT: u32 = 15;

/// Owns the worker's identity with the queue.
///
/// State machine: Unregistered → Registering → Active ⇄ Degraded, with
/// Halted as the terminal state after repeated rejection. The current state
/// is published on a `watch` channel; the runtime renders transitions as
/// events and stops fetching once Halted.
pub(crate) struct SessionManager {
    queue: Arc<dyn QueueApi>,
    capability: Capability,
    key: Option<String>,
    policy: RetryPolicy,
    rejection_threshold: u32,
    rejections: AtomicU32,
    state_tx: watch::Sender<SessionState>,
    session: RwLock<Option<WorkerSession>>,
    event_tx: broadcast::Sender<WorkerEvent>,
}

impl SessionManager {
    pub(crate) fn new(
        queue: Arc<dyn QueueApi>,
        capability: Capability,
        key: Option<String>,
        policy: RetryPolicy,
        rejection_threshold: u32,
        event_tx: broadcast::Sender<WorkerEvent>,
    ) -> Arc<Self> {
        let (state_tx, _) = watch::channel(SessionState::Unregistered);
        Arc::new(Self {
            queue,
            capability,
            key,
            policy,
            rejection_threshold: rejection_threshold.max(1),
            rejections: AtomicU32::new(0),
            state_tx,
            session: RwLock::new(None),
            event_tx,
        })
    }

    fn emit(&self, event: WorkerEvent) {
        let _ = self.event_tx.send(event);
    }

    pub(crate) fn state(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    pub(crate) fn current_state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    pub(crate) async fn token(&self) -> Option<String> {
        self.session.read().await.as_ref().map(|s| s.token.clone())
    }

    pub(crate) async fn keepalive_interval(&self) -> Duration {
        match self.session.read().await.as_ref() {
            Some(s) if s.keepalive_secs > 0 => Duration::from_secs(s.keepalive_secs),
            _ => DEFAULT_KEEPALIVE,
        }
    }

    /// Halted is terminal; every other transition goes through here.
    fn set_state(&self, state: SessionState) {
        self.state_tx.send_if_modified(|current| {
            if *current == SessionState::Halted || *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
    }

    /// Count one rejection; returns true when the threshold is crossed and
    /// the worker halts.
    fn note_rejection(&self) -> bool {
        let seen = self.rejections.fetch_add(1, Ordering::SeqCst) + 1;
        if seen >= self.rejection_threshold {
            self.set_state(SessionState::Halted);
            true
        } else {
            false
        }
    }

    /// Any accepted call resets the rejection count and recovers Degraded.
    pub(crate) fn note_success(&self) {
        self.rejections.store(0, Ordering::SeqCst);
        if self.current_state() == SessionState::Degraded {
            self.set_state(SessionState::Active);
        }
    }

    /// Establish (or re-establish) a session. Transient failures retry under
    /// the session policy, a warning per attempt, and halt the worker once
    /// the attempt limit is spent; rejections count toward the halt
    /// threshold; a protocol-level failure halts outright.
    pub(crate) async fn register(&self) -> Result<(), SessionError> {
        if self.current_state() == SessionState::Halted {
            return Err(SessionError::Rejected);
        }
        self.set_state(SessionState::Registering);

        let mut backoff = self.policy.start();
        let mut unreachable_for = 0u32;
        loop {
            match self
                .queue
                .register(&self.capability, self.key.as_deref())
                .await
            {
                Ok(session) => {
                    *self.session.write().await = Some(session);
                    self.rejections.store(0, Ordering::SeqCst);
                    self.set_state(SessionState::Active);
                    return Ok(());
                }
                Err(SessionError::Rejected) => {
                    if self.note_rejection() {
                        return Err(SessionError::Rejected);
                    }
                }
                Err(SessionError::Fatal(msg)) => {
                    self.set_state(SessionState::Halted);
                    return Err(SessionError::Fatal(msg));
                }
                Err(SessionError::Transient(msg)) => {
                    unreachable_for += 1;
                    if unreachable_for >= REGISTER_ATTEMPT_LIMIT {
                        self.emit(WorkerEvent::Error {
                            message: format!(
                                "queue unreachable after {unreachable_for} registration \
                                 attempts ({msg}), giving up"
                            ),
                        });
                        self.set_state(SessionState::Halted);
                        return Err(SessionError::Transient(msg));
                    }
                    self.emit(WorkerEvent::Warning {
                        message: format!(
                            "registration attempt {unreachable_for} failed ({msg}), retrying"
                        ),
                    });
                }
            }

            match backoff.next_delay() {
                Some(delay) => tokio::time::sleep(delay).await,
                None => return Err(SessionError::Transient("registration retries exhausted".into())),
            }
        }
    }

    /// Called by the runtime when fetch/submit report a rejected session:
    /// count it, and unless halted try to re-register. Returns false once
    /// the worker is Halted.
    pub(crate) async fn reauthorize(&self) -> bool {
        if self.note_rejection() {
            return false;
        }
        self.register().await.is_ok()
    }

    /// Periodic keepalive. Exits once the session halts.
    pub(crate) async fn run_keepalive(self: Arc<Self>) {
        let mut state_rx = self.state();
        loop {
            let interval = self.keepalive_interval().await;
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                res = state_rx.wait_for(|s| *s == SessionState::Halted) => {
                    let _ = res;
                    return;
                }
            }

            let Some(token) = self.token().await else {
                continue;
            };
            match self.queue.keepalive(&token).await {
                Ok(()) => self.note_success(),
                Err(SessionError::Transient(_)) => {
                    if self.current_state() == SessionState::Active {
                        self.set_state(SessionState::Degraded);
                    }
                }
                Err(SessionError::Rejected) => {
                    if self.note_rejection() {
                        return;
                    }
                }
                Err(SessionError::Fatal(_)) => {
                    self.set_state(SessionState::Halted);
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::ClientIdent;
    use crate::testutil::MockQueue;

    fn capability() -> Capability {
        Capability {
            engine: Default::default(),
            concurrency: 1,
            limit_kinds: vec!["depth".to_string()],
            client: ClientIdent {
                name: "trawler".to_string(),
                version: "test".to_string(),
            },
        }
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            base: Duration::from_millis(1),
            cap: Duration::from_millis(2),
            max_attempts: None,
        }
    }

    fn events() -> broadcast::Sender<WorkerEvent> {
        broadcast::channel(64).0
    }

    /// Fails registration with a transient error `failures_left` times, then
    /// delegates to the inner mock.
    struct FlakyQueue {
        inner: MockQueue,
        failures_left: AtomicU32,
    }

    #[async_trait::async_trait]
    impl QueueApi for FlakyQueue {
        async fn register(
            &self,
            capability: &Capability,
            key: Option<&str>,
        ) -> Result<WorkerSession, SessionError> {
            if self.failures_left.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                n.checked_sub(1)
            })
            .is_ok()
            {
                return Err(SessionError::Transient("connection refused".into()));
            }
            self.inner.register(capability, key).await
        }
        async fn keepalive(&self, token: &str) -> Result<(), SessionError> {
            self.inner.keepalive(token).await
        }
        async fn acquire(
            &self,
            token: &str,
            max_jobs: usize,
        ) -> Result<Vec<crate::queue::Job>, crate::queue::FetchError> {
            self.inner.acquire(token, max_jobs).await
        }
        async fn submit(
            &self,
            token: &str,
            job_id: &str,
            payload: &crate::queue::ResultPayload,
        ) -> Result<(), crate::queue::SubmitError> {
            self.inner.submit(token, job_id, payload).await
        }
        async fn abort(
            &self,
            token: &str,
            job_id: &str,
        ) -> Result<(), crate::queue::SubmitError> {
            self.inner.abort(token, job_id).await
        }
    }

    #[tokio::test]
    async fn register_reaches_active() {
        let queue = Arc::new(MockQueue::new());
        let session = SessionManager::new(queue, capability(), None, fast_policy(), 3, events());
        session.register().await.unwrap();
        assert_eq!(session.current_state(), SessionState::Active);
        assert_eq!(session.token().await.as_deref(), Some("test-token"));
    }

    #[tokio::test]
    async fn repeated_rejection_halts_terminally() {
        let queue = Arc::new(MockQueue::new());
        queue.reject_sessions.store(true, Ordering::SeqCst);
        let session =
            SessionManager::new(queue.clone(), capability(), None, fast_policy(), 3, events());

        let err = session.register().await.unwrap_err();
        assert!(matches!(err, SessionError::Rejected));
        assert_eq!(session.current_state(), SessionState::Halted);
        assert_eq!(queue.register_calls.load(Ordering::SeqCst), 3);

        // Halted is terminal: even a now-accepting queue cannot revive it,
        // and it is not asked again.
        queue.reject_sessions.store(false, Ordering::SeqCst);
        assert!(session.register().await.is_err());
        assert_eq!(session.current_state(), SessionState::Halted);
        assert_eq!(queue.register_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn reauthorize_counts_toward_the_threshold() {
        let queue = Arc::new(MockQueue::new());
        let session =
            SessionManager::new(queue.clone(), capability(), None, fast_policy(), 2, events());
        session.register().await.unwrap();

        // First rejection: below threshold, re-registers successfully.
        assert!(session.reauthorize().await);
        assert_eq!(session.current_state(), SessionState::Active);
        // register() succeeded, so the count reset; two more cross it.
        assert!(session.reauthorize().await);
        queue.reject_sessions.store(true, Ordering::SeqCst);
        assert!(!session.reauthorize().await);
        assert_eq!(session.current_state(), SessionState::Halted);
    }

    #[tokio::test]
    async fn transient_register_failures_retry() {
        let queue = Arc::new(FlakyQueue {
            inner: MockQueue::new(),
            failures_left: AtomicU32::new(3),
        });
        let session = SessionManager::new(queue, capability(), None, fast_policy(), 3, events());
        session.register().await.unwrap();
        assert_eq!(session.current_state(), SessionState::Active);
    }

    #[tokio::test]
    async fn unreachable_queue_warns_per_attempt_then_halts() {
        let queue = Arc::new(FlakyQueue {
            inner: MockQueue::new(),
            failures_left: AtomicU32::new(u32::MAX),
        });
        let (event_tx, mut event_rx) = broadcast::channel(64);
        let session = SessionManager::new(queue, capability(), None, fast_policy(), 3, event_tx);

        let err = session.register().await.unwrap_err();
        assert!(matches!(err, SessionError::Transient(_)));
        assert_eq!(session.current_state(), SessionState::Halted);

        let mut warnings = 0u32;
        let mut errors = 0u32;
        while let Ok(event) = event_rx.try_recv() {
            match event {
                WorkerEvent::Warning { .. } => warnings += 1,
                WorkerEvent::Error { .. } => errors += 1,
                _ => {}
            }
        }
        assert_eq!(warnings, REGISTER_ATTEMPT_LIMIT - 1);
        assert_eq!(errors, 1);
    }
}
