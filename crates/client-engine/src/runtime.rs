use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinSet;

use trawler_client_core::retry::{Backoff, RetryPolicy};

use crate::api::{
    JobOutcome, SessionState, StatusSnapshot, WorkerConfig, WorkerEvent, WorkerHandle,
};
use crate::pool::{EnginePool, PoolNotice};
use crate::queue::{Capability, ClientIdent, FetchError, HttpQueue, Job, QueueApi};
use crate::runner::JobRunner;
use crate::session::SessionManager;

/// Backoff for failed engine respawns, bounded by the configured attempt
/// budget.
const RESPAWN_BASE: Duration = Duration::from_secs(1);
const RESPAWN_CAP: Duration = Duration::from_secs(10);

pub(crate) struct WorkerInner {
    pub(crate) event_tx: broadcast::Sender<WorkerEvent>,
    pub(crate) snapshot_rx: watch::Receiver<StatusSnapshot>,
    stop_requested: AtomicBool,
    notify: tokio::sync::Notify,
}

impl WorkerInner {
    pub(crate) fn request_stop(&self) {
        if !self.stop_requested.swap(true, Ordering::SeqCst) {
            let _ = self.event_tx.send(WorkerEvent::StopRequested);
            self.notify.notify_waiters();
        }
    }

    fn should_stop(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }
}

pub(crate) fn start_worker(config: WorkerConfig) -> WorkerHandle {
    spawn_worker(config, None)
}

pub(crate) fn start_worker_with_queue(
    config: WorkerConfig,
    queue: Arc<dyn QueueApi>,
) -> WorkerHandle {
    spawn_worker(config, Some(queue))
}

fn spawn_worker(config: WorkerConfig, queue: Option<Arc<dyn QueueApi>>) -> WorkerHandle {
    let (event_tx, _) = broadcast::channel::<WorkerEvent>(1024);
    let (snapshot_tx, snapshot_rx) = watch::channel(StatusSnapshot {
        stop_requested: false,
        session: SessionState::Unregistered,
        capacity: 0,
        inflight_jobs: 0,
        recent_jobs: Vec::new(),
    });

    let inner = Arc::new(WorkerInner {
        event_tx,
        snapshot_rx,
        stop_requested: AtomicBool::new(false),
        notify: tokio::sync::Notify::new(),
    });

    let join = tokio::spawn(run_worker(inner.clone(), snapshot_tx, config, queue));
    WorkerHandle { inner, join }
}

async fn run_worker(
    inner: Arc<WorkerInner>,
    snapshot_tx: watch::Sender<StatusSnapshot>,
    mut cfg: WorkerConfig,
    queue: Option<Arc<dyn QueueApi>>,
) -> anyhow::Result<()> {
    if cfg.parallel == 0 {
        cfg.parallel = 1;
    }
    if cfg.recent_jobs_max == 0 {
        cfg.recent_jobs_max = WorkerConfig::DEFAULT_RECENT_JOBS_MAX;
    }

    let fail = |message: String| {
        let _ = inner.event_tx.send(WorkerEvent::Error {
            message: message.clone(),
        });
        let _ = inner.event_tx.send(WorkerEvent::Stopped);
        anyhow::anyhow!(message)
    };

    let queue: Arc<dyn QueueApi> = match queue {
        Some(queue) => queue,
        None => match HttpQueue::new(cfg.endpoint.clone()) {
            Ok(http) => Arc::new(http),
            Err(err) => return Err(fail(format!("build queue client: {err:#}"))),
        },
    };

    let (notice_tx, notice_rx) = mpsc::unbounded_channel();
    let respawn = RetryPolicy {
        base: RESPAWN_BASE,
        cap: RESPAWN_CAP,
        max_attempts: Some(cfg.respawn_attempts.max(1)),
    };
    let pool = match EnginePool::start(cfg.engine.clone(), cfg.parallel, respawn, notice_tx).await {
        Ok(pool) => pool,
        Err(err) => return Err(fail(format!("engine startup: {err:#}"))),
    };

    // The capability descriptor carries the engine's own identity, read off
    // one freshly started handle.
    let engine_ident = match pool.acquire().await {
        Some(guard) => guard.ident().clone(),
        None => return Err(fail("engine pool closed during startup".to_string())),
    };

    let capability = Capability {
        engine: engine_ident,
        concurrency: cfg.parallel,
        limit_kinds: vec![
            "depth".to_string(),
            "nodes".to_string(),
            "movetime".to_string(),
        ],
        client: ClientIdent {
            name: "trawler".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        },
    };
    let session = SessionManager::new(
        queue.clone(),
        capability,
        cfg.key.clone(),
        RetryPolicy::SESSION,
        cfg.rejection_threshold,
        inner.event_tx.clone(),
    );

    let runtime = WorkerRuntime {
        queue,
        session,
        pool,
        cfg,
        pending: VecDeque::new(),
        fetch_task: None,
        fetch_backoff: None,
        fetch_backoff_state: RetryPolicy::FETCH.start(),
        jobs: JoinSet::new(),
        notice_rx,
        failure: None,
        recent_jobs: VecDeque::new(),
        snapshot_tx,
        inner,
    };
    runtime.run().await
}

struct WorkerRuntime {
    queue: Arc<dyn QueueApi>,
    session: Arc<SessionManager>,
    pool: EnginePool,
    cfg: WorkerConfig,

    pending: VecDeque<Job>,
    fetch_task: Option<tokio::task::JoinHandle<Result<Vec<Job>, FetchError>>>,
    fetch_backoff: Option<Pin<Box<tokio::time::Sleep>>>,
    fetch_backoff_state: Backoff,
    jobs: JoinSet<JobOutcome>,
    notice_rx: mpsc::UnboundedReceiver<PoolNotice>,

    /// First unrecoverable condition; once set the loop drains and exits
    /// with it.
    failure: Option<String>,

    recent_jobs: VecDeque<JobOutcome>,
    snapshot_tx: watch::Sender<StatusSnapshot>,
    inner: Arc<WorkerInner>,
}

impl WorkerRuntime {
    fn emit(&self, event: WorkerEvent) {
        let _ = self.inner.event_tx.send(event);
    }

    fn push_snapshot(&self) {
        let _ = self.snapshot_tx.send(StatusSnapshot {
            stop_requested: self.inner.should_stop(),
            session: self.session.current_state(),
            capacity: self.pool.capacity(),
            inflight_jobs: self.jobs.len(),
            recent_jobs: self.recent_jobs.iter().cloned().collect(),
        });
    }

    fn draining(&self) -> bool {
        self.inner.should_stop() || self.failure.is_some()
    }

    /// Room for more leased work: live slots minus running and queued jobs.
    fn fetch_budget(&self) -> usize {
        self.pool
            .capacity()
            .saturating_sub(self.jobs.len())
            .saturating_sub(self.pending.len())
    }

    fn maybe_start_fetch(&mut self) {
        if self.draining() || self.fetch_task.is_some() || self.fetch_backoff.is_some() {
            return;
        }
        if !self.pending.is_empty() {
            return;
        }
        let budget = self.fetch_budget();
        if budget == 0 {
            return;
        }
        match self.session.current_state() {
            SessionState::Active | SessionState::Degraded => {}
            _ => return,
        }

        let queue = self.queue.clone();
        let session = self.session.clone();
        self.fetch_task = Some(tokio::spawn(async move {
            let Some(token) = session.token().await else {
                return Err(FetchError::Rejected);
            };
            queue.acquire(&token, budget).await
        }));
    }

    fn assign_jobs(&mut self) {
        let mut snapshot_dirty = false;
        while self.jobs.len() < self.pool.capacity() {
            let Some(job) = self.pending.pop_front() else {
                break;
            };
            let runner = JobRunner {
                queue: self.queue.clone(),
                session: self.session.clone(),
                pool: self.pool.clone(),
                position_retries: self.cfg.position_retries,
                lease_margin: self.cfg.lease_margin,
                submit_policy: RetryPolicy::SUBMIT,
                event_tx: self.inner.event_tx.clone(),
            };
            self.jobs.spawn(runner.run(job));
            snapshot_dirty = true;
        }
        if snapshot_dirty {
            self.push_snapshot();
        }
    }

    /// Hand unstarted jobs back so the queue can redeliver them without
    /// waiting out the lease. Best-effort.
    fn abort_pending(&mut self) {
        while let Some(job) = self.pending.pop_front() {
            let queue = self.queue.clone();
            let session = self.session.clone();
            self.emit(WorkerEvent::Warning {
                message: format!("returning unstarted job {} to the queue", job.id),
            });
            tokio::spawn(async move {
                if let Some(token) = session.token().await {
                    let _ = queue.abort(&token, &job.id).await;
                }
            });
        }
    }

    async fn handle_fetch_result(
        &mut self,
        res: Result<Result<Vec<Job>, FetchError>, tokio::task::JoinError>,
    ) {
        self.fetch_task = None;

        match res {
            Ok(Ok(jobs)) => {
                self.session.note_success();
                if jobs.is_empty() {
                    // No work right now; the next fetch waits out a growing
                    // pause instead of hammering the queue.
                    self.start_fetch_backoff();
                    return;
                }
                self.fetch_backoff_state = RetryPolicy::FETCH.start();
                self.pending.extend(jobs);
                if self.draining() {
                    self.abort_pending();
                }
            }
            Ok(Err(FetchError::Transient(msg))) => {
                self.emit(WorkerEvent::Warning {
                    message: format!("work fetch failed ({msg}), backing off"),
                });
                self.start_fetch_backoff();
            }
            Ok(Err(FetchError::Rejected)) => {
                if !self.session.reauthorize().await {
                    self.failure
                        .get_or_insert("session rejected by queue".to_string());
                }
            }
            Ok(Err(FetchError::Fatal(msg))) => {
                self.failure.get_or_insert(format!("fatal fetch failure: {msg}"));
            }
            Err(err) => {
                self.emit(WorkerEvent::Error {
                    message: format!("work fetch task join error: {err:#}"),
                });
                self.start_fetch_backoff();
            }
        }
    }

    fn start_fetch_backoff(&mut self) {
        // FETCH has no attempt budget, so a delay is always available.
        let delay = self
            .fetch_backoff_state
            .next_delay()
            .unwrap_or(RetryPolicy::FETCH.cap);
        self.fetch_backoff = Some(Box::pin(tokio::time::sleep(delay)));
    }

    fn handle_job_result(&mut self, res: Result<JobOutcome, tokio::task::JoinError>) {
        match res {
            Ok(outcome) => {
                self.recent_jobs.push_back(outcome.clone());
                while self.recent_jobs.len() > self.cfg.recent_jobs_max {
                    self.recent_jobs.pop_front();
                }
                self.emit(WorkerEvent::JobFinished { outcome });
            }
            Err(err) => {
                self.emit(WorkerEvent::Error {
                    message: format!("job task join error: {err:#}"),
                });
            }
        }
        self.push_snapshot();
    }

    fn handle_pool_notice(&mut self, notice: PoolNotice) {
        match notice {
            PoolNotice::Respawned { slot } => {
                self.emit(WorkerEvent::EngineRespawned { slot });
            }
            PoolNotice::Retired { slot, error } => {
                self.emit(WorkerEvent::Warning {
                    message: format!("engine slot {slot} retired: {error}"),
                });
                self.emit(WorkerEvent::SlotRetired { slot });
                self.push_snapshot();
            }
            PoolNotice::Exhausted => {
                self.failure
                    .get_or_insert("all engine slots retired, cannot make progress".to_string());
            }
        }
    }

    async fn run(mut self) -> anyhow::Result<()> {
        self.emit(WorkerEvent::Started);
        self.push_snapshot();

        // Establish the session before touching the work endpoints; a stop
        // request during registration wins.
        tokio::select! {
            res = self.session.register() => {
                if let Err(err) = res {
                    self.failure.get_or_insert(format!("registration failed: {err}"));
                }
            }
            _ = self.inner.notify.notified() => {}
        }
        let mut session_rx = self.session.state();
        session_rx.mark_changed();
        let keepalive = tokio::spawn(self.session.clone().run_keepalive());

        loop {
            if self.draining() {
                if let Some(task) = self.fetch_task.take() {
                    task.abort();
                }
                self.fetch_backoff = None;
                self.abort_pending();
                if self.jobs.is_empty() {
                    break;
                }
            } else {
                self.assign_jobs();
                self.maybe_start_fetch();
            }

            tokio::select! {
                _ = self.inner.notify.notified() => {
                    self.push_snapshot();
                }
                changed = session_rx.changed() => {
                    if changed.is_ok() {
                        let state = *session_rx.borrow_and_update();
                        self.emit(WorkerEvent::Session { state });
                        if state == SessionState::Halted {
                            self.failure
                                .get_or_insert("session halted by queue".to_string());
                        }
                        self.push_snapshot();
                    }
                }
                Some(notice) = self.notice_rx.recv() => {
                    self.handle_pool_notice(notice);
                }
                Some(res) = self.jobs.join_next(), if !self.jobs.is_empty() => {
                    self.handle_job_result(res);
                }
                res = async {
                    match self.fetch_task.as_mut() {
                        Some(task) => task.await,
                        None => std::future::pending().await,
                    }
                } => {
                    self.handle_fetch_result(res).await;
                }
                _ = async {
                    match self.fetch_backoff.as_mut() {
                        Some(sleep) => sleep.as_mut().await,
                        None => std::future::pending().await,
                    }
                } => {
                    self.fetch_backoff = None;
                }
            }
        }

        keepalive.abort();
        if let Some(task) = self.fetch_task.take() {
            task.abort();
        }
        self.pool.shutdown().await;

        let result = match self.failure.take() {
            Some(message) => {
                self.emit(WorkerEvent::Error {
                    message: message.clone(),
                });
                Err(anyhow::anyhow!(message))
            }
            None => Ok(()),
        };
        self.emit(WorkerEvent::Stopped);
        self.push_snapshot();
        result
    }
}
