use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::broadcast;
use tokio::task::JoinSet;

use trawler_client_core::retry::RetryPolicy;

use crate::api::{JobOutcome, JobStatus, WorkerEvent};
use crate::engine::AnalysisRequest;
use crate::pool::EnginePool;
use crate::queue::{AnalysisLimits, AnalysisResult, Job, PositionSpec, QueueApi, ResultPayload, SubmitError};
use crate::session::SessionManager;

/// Below this search time the engine-reported nps is noise; drop it rather
/// than skew server-side aggregates.
const NPS_MIN_TIME_MS: u64 = 500;

/// Executes one leased job end to end: fan positions out over the engine
/// pool, reassemble results in request order, submit.
///
/// Cheap to clone; every field is a shared handle.
#[derive(Clone)]
pub(crate) struct JobRunner {
    pub(crate) queue: Arc<dyn QueueApi>,
    pub(crate) session: Arc<SessionManager>,
    pub(crate) pool: EnginePool,
    pub(crate) position_retries: u32,
    pub(crate) lease_margin: Duration,
    pub(crate) submit_policy: RetryPolicy,
    pub(crate) event_tx: broadcast::Sender<WorkerEvent>,
}

impl JobRunner {
    pub(crate) async fn run(self, job: Job) -> JobOutcome {
        let started = Instant::now();
        let positions = job.positions.len();
        let mut outcome = JobOutcome {
            job_id: job.id.clone(),
            positions,
            status: JobStatus::Lost,
            error: None,
            submit_attempts: 0,
            nodes: 0,
            analyze_ms: 0,
            submit_ms: 0,
            total_ms: 0,
        };

        self.emit(WorkerEvent::JobStarted {
            job_id: job.id.clone(),
            positions,
        });

        // Stop analyzing a margin before the lease runs out: a submit after
        // expiry races the re-lease and wastes everyone's time.
        let budget = Duration::from_secs(job.lease_secs).saturating_sub(self.lease_margin);
        let deadline = tokio::time::Instant::now() + budget;

        let analyze_started = Instant::now();
        let limits = job.limits.effective();
        let mut tasks: JoinSet<(usize, Result<AnalysisResult, String>)> = JoinSet::new();
        for (index, position) in job.positions.iter().cloned().enumerate() {
            let runner = self.clone();
            let job_id = job.id.clone();
            let variant = job.variant.clone();
            tasks.spawn(async move {
                let res = runner
                    .analyze_position(&job_id, variant.as_deref(), &position, limits)
                    .await;
                (index, res)
            });
        }

        // Completion order is arbitrary; the payload is rebuilt by index.
        let mut results: Vec<Option<AnalysisResult>> = Vec::new();
        results.resize_with(positions, || None);
        let mut failure: Option<String> = None;
        loop {
            tokio::select! {
                joined = tasks.join_next() => {
                    let Some(joined) = joined else { break };
                    match joined {
                        Ok((index, Ok(result))) => {
                            outcome.nodes += result.nodes;
                            self.emit(WorkerEvent::PositionAnalyzed {
                                job_id: job.id.clone(),
                                index,
                                of: positions,
                            });
                            results[index] = Some(result);
                        }
                        Ok((index, Err(message))) => {
                            failure.get_or_insert(format!("position {index}: {message}"));
                            tasks.abort_all();
                        }
                        Err(err) if err.is_cancelled() => {}
                        Err(err) => {
                            failure.get_or_insert(format!("position task panicked: {err}"));
                            tasks.abort_all();
                        }
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    tasks.abort_all();
                    while tasks.join_next().await.is_some() {}
                    outcome.status = JobStatus::Abandoned;
                    outcome.error = Some("lease expired before analysis finished".to_string());
                    outcome.analyze_ms = elapsed_ms(analyze_started);
                    outcome.total_ms = elapsed_ms(started);
                    return outcome;
                }
            }
        }
        outcome.analyze_ms = elapsed_ms(analyze_started);

        let payload = match (failure, collect_in_order(results)) {
            (Some(message), _) | (None, Err(message)) => {
                // Given up locally; the lease runs out server-side and the
                // queue redelivers.
                outcome.status = JobStatus::Abandoned;
                outcome.error = Some(message.clone());
                self.emit(WorkerEvent::Error {
                    message: format!("job {} abandoned: {message}", job.id),
                });
                outcome.total_ms = elapsed_ms(started);
                return outcome;
            }
            (None, Ok(results)) => ResultPayload { results },
        };

        let submit_started = Instant::now();
        self.submit(&job.id, &payload, &mut outcome).await;
        outcome.submit_ms = elapsed_ms(submit_started);
        outcome.total_ms = elapsed_ms(started);
        outcome
    }

    /// Analyze one position, retrying on a fresh handle when the engine
    /// dies or times out under it.
    async fn analyze_position(
        &self,
        job_id: &str,
        variant: Option<&str>,
        position: &PositionSpec,
        limits: AnalysisLimits,
    ) -> Result<AnalysisResult, String> {
        let req = AnalysisRequest {
            job_id,
            variant,
            position,
            limits,
        };
        let mut attempt = 0u32;
        loop {
            let Some(mut guard) = self.pool.acquire().await else {
                return Err("engine pool shut down".to_string());
            };
            match guard.analyze(&req).await {
                Ok(mut result) => {
                    if result.time_ms < NPS_MIN_TIME_MS {
                        result.nps = None;
                        if limits.movetime_ms.is_some() {
                            self.emit(WorkerEvent::Warning {
                                message: format!(
                                    "engine reported only {}ms of search for job {job_id}",
                                    result.time_ms
                                ),
                            });
                        }
                    }
                    return Ok(result);
                }
                Err(err) if attempt < self.position_retries => {
                    attempt += 1;
                    self.emit(WorkerEvent::Warning {
                        message: format!(
                            "engine failed ({err}), retrying position on a fresh engine \
                             (attempt {attempt})"
                        ),
                    });
                    // Guard drops here and routes the dead handle to the
                    // respawner; the next acquire waits for a live one.
                }
                Err(err) => return Err(err.to_string()),
            }
        }
    }

    async fn submit(&self, job_id: &str, payload: &ResultPayload, outcome: &mut JobOutcome) {
        let mut backoff = self.submit_policy.start();
        loop {
            outcome.submit_attempts += 1;
            let Some(token) = self.session.token().await else {
                outcome.error = Some("no active session".to_string());
                return;
            };
            match self.queue.submit(&token, job_id, payload).await {
                Ok(()) => {
                    self.session.note_success();
                    outcome.status = JobStatus::Submitted;
                    return;
                }
                Err(SubmitError::Gone(msg)) => {
                    // The queue re-leased or no longer knows the job. Not
                    // worth retrying, not our error either.
                    outcome.error = Some(format!("job gone: {msg}"));
                    return;
                }
                Err(SubmitError::Rejected) => {
                    if self.session.reauthorize().await {
                        continue;
                    }
                    outcome.error = Some("session halted".to_string());
                    return;
                }
                Err(SubmitError::Fatal(msg)) => {
                    outcome.error = Some(msg);
                    return;
                }
                Err(SubmitError::Transient(msg)) => match backoff.next_delay() {
                    Some(delay) => {
                        self.emit(WorkerEvent::Warning {
                            message: format!("submit of job {job_id} failed ({msg}), retrying"),
                        });
                        tokio::time::sleep(delay).await;
                    }
                    None => {
                        outcome.error = Some(format!("submit retries exhausted: {msg}"));
                        return;
                    }
                },
            }
        }
    }

    fn emit(&self, event: WorkerEvent) {
        let _ = self.event_tx.send(event);
    }
}

fn collect_in_order(results: Vec<Option<AnalysisResult>>) -> Result<Vec<AnalysisResult>, String> {
    results
        .into_iter()
        .enumerate()
        .map(|(index, res)| res.ok_or_else(|| format!("position {index} missing a result")))
        .collect()
}

fn elapsed_ms(since: Instant) -> u64 {
    since.elapsed().as_millis() as u64
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::api::SessionState;
    use crate::pool::PoolNotice;
    use crate::queue::{Capability, ClientIdent};
    use crate::testutil::{CRASH_ON_GO_ENGINE, MockQueue, fake_engine_spec, job};

    async fn runner_with(
        queue: Arc<MockQueue>,
        script: &str,
        parallel: usize,
        position_retries: u32,
    ) -> JobRunner {
        let (notice_tx, _notice_rx) = tokio::sync::mpsc::unbounded_channel::<PoolNotice>();
        let pool = EnginePool::start(
            fake_engine_spec(script),
            parallel,
            RetryPolicy {
                base: Duration::from_millis(5),
                cap: Duration::from_millis(10),
                max_attempts: Some(3),
            },
            notice_tx,
        )
        .await
        .unwrap();

        let (event_tx, _) = broadcast::channel(64);
        let session = SessionManager::new(
            queue.clone(),
            Capability {
                engine: Default::default(),
                concurrency: parallel,
                limit_kinds: vec!["depth".to_string()],
                client: ClientIdent {
                    name: "trawler".to_string(),
                    version: "test".to_string(),
                },
            },
            None,
            RetryPolicy {
                base: Duration::from_millis(1),
                cap: Duration::from_millis(2),
                max_attempts: None,
            },
            3,
            event_tx.clone(),
        );
        session.register().await.unwrap();
        assert_eq!(session.current_state(), SessionState::Active);

        JobRunner {
            queue,
            session,
            pool,
            position_retries,
            lease_margin: Duration::from_secs(0),
            submit_policy: RetryPolicy {
                base: Duration::from_millis(5),
                cap: Duration::from_millis(10),
                max_attempts: Some(4),
            },
            event_tx,
        }
    }

    /// Echoes the first FEN field back as the best move, so the submitted
    /// payload reveals which result landed at which index.
    const ECHO_ENGINE: &str = r#"
while IFS= read -r line; do
  case "$line" in
    uci) echo "id name EchoFish 1"; echo "uciok" ;;
    isready) echo "readyok" ;;
    position*) last="$line" ;;
    go*)
      set -- $last
      echo "info depth 1 score cp 0 nodes 100 time 700 pv $3"
      echo "bestmove $3"
      ;;
    quit) exit 0 ;;
    *) : ;;
  esac
done
"#;

    #[tokio::test]
    async fn results_come_back_in_request_order() {
        let queue = Arc::new(MockQueue::new());
        let runner = runner_with(queue.clone(), ECHO_ENGINE, 2, 0).await;

        let mut work = job("job-order", 3);
        for (i, position) in work.positions.iter_mut().enumerate() {
            position.fen = format!("p{i} w - - 0 1");
        }

        let outcome = runner.run(work).await;
        assert_eq!(outcome.status, JobStatus::Submitted);
        assert_eq!(outcome.positions, 3);
        assert_eq!(outcome.nodes, 300);

        let submitted = queue.submitted.lock().unwrap();
        assert_eq!(submitted.len(), 1);
        let (job_id, payload) = &submitted[0];
        assert_eq!(job_id, "job-order");
        let moves: Vec<_> = payload
            .results
            .iter()
            .map(|r| r.best_move.clone().unwrap())
            .collect();
        assert_eq!(moves, vec!["p0", "p1", "p2"]);
    }

    #[tokio::test]
    async fn engine_death_retries_on_a_fresh_engine() {
        let dir = std::env::temp_dir().join(format!("trawler-runner-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let flag = dir.join("crashed-once");
        let _ = std::fs::remove_file(&flag);

        // Crashes on the first go, behaves afterwards.
        let script = format!(
            r#"
while IFS= read -r line; do
  case "$line" in
    uci) echo "id name FlakyFish 1"; echo "uciok" ;;
    isready) echo "readyok" ;;
    go*)
      if [ ! -f {flag} ]; then touch {flag}; exit 7; fi
      echo "info depth 1 score cp 5 nodes 10 time 700 pv e2e4"
      echo "bestmove e2e4"
      ;;
    quit) exit 0 ;;
    *) : ;;
  esac
done
"#,
            flag = flag.display()
        );

        let queue = Arc::new(MockQueue::new());
        let runner = runner_with(queue.clone(), &script, 1, 2).await;

        let outcome = runner.run(job("job-flaky", 1)).await;
        assert_eq!(outcome.status, JobStatus::Submitted, "{:?}", outcome.error);
        assert_eq!(queue.submitted.lock().unwrap().len(), 1);

        let _ = std::fs::remove_file(&flag);
    }

    #[tokio::test]
    async fn failed_position_abandons_the_job() {
        let queue = Arc::new(MockQueue::new());
        let runner = runner_with(queue.clone(), CRASH_ON_GO_ENGINE, 1, 0).await;

        let outcome = runner.run(job("job-doomed", 1)).await;
        // Abandoned, not lost: analysis never produced a payload, so the
        // queue redelivers once the lease runs out.
        assert_eq!(outcome.status, JobStatus::Abandoned);
        assert!(outcome.error.is_some());
        assert_eq!(outcome.submit_attempts, 0);
        assert!(queue.submitted.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn crash_under_one_job_leaves_a_concurrent_job_unaffected() {
        let dir = std::env::temp_dir().join(format!("trawler-isolation-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let flag = dir.join("crashed-once");
        let _ = std::fs::remove_file(&flag);

        // The first go across the whole pool crashes its engine; everything
        // afterwards succeeds.
        let script = format!(
            r#"
while IFS= read -r line; do
  case "$line" in
    uci) echo "id name FlakyFish 1"; echo "uciok" ;;
    isready) echo "readyok" ;;
    go*)
      if [ ! -f {flag} ]; then touch {flag}; exit 7; fi
      sleep 0.1
      echo "info depth 1 score cp 5 nodes 10 time 700 pv e2e4"
      echo "bestmove e2e4"
      ;;
    quit) exit 0 ;;
    *) : ;;
  esac
done
"#,
            flag = flag.display()
        );

        let queue = Arc::new(MockQueue::new());
        let runner = runner_with(queue.clone(), &script, 2, 2).await;

        let (a, b) = tokio::join!(
            runner.clone().run(job("job-a", 1)),
            runner.clone().run(job("job-b", 1)),
        );
        assert_eq!(a.status, JobStatus::Submitted, "{:?}", a.error);
        assert_eq!(b.status, JobStatus::Submitted, "{:?}", b.error);
        assert_eq!(queue.submitted.lock().unwrap().len(), 2);

        let _ = std::fs::remove_file(&flag);
    }

    #[tokio::test]
    async fn lease_expiry_abandons_without_submitting() {
        const SLOW_ENGINE: &str = r#"
while IFS= read -r line; do
  case "$line" in
    uci) echo "id name SlowFish 1"; echo "uciok" ;;
    isready) echo "readyok" ;;
    go*) sleep 30 ;;
    quit) exit 0 ;;
    *) : ;;
  esac
done
"#;
        let queue = Arc::new(MockQueue::new());
        let runner = runner_with(queue.clone(), SLOW_ENGINE, 1, 0).await;

        let mut work = job("job-slow", 1);
        work.lease_secs = 1;

        let outcome = runner.run(work).await;
        assert_eq!(outcome.status, JobStatus::Abandoned);
        assert!(queue.submitted.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn transient_submit_failures_are_retried() {
        let queue = Arc::new(MockQueue::new());
        {
            let mut failures = queue.submit_failures.lock().unwrap();
            failures.push_back(SubmitError::Transient("503".to_string()));
            failures.push_back(SubmitError::Transient("503".to_string()));
        }
        let runner = runner_with(queue.clone(), ECHO_ENGINE, 1, 0).await;

        let outcome = runner.run(job("job-retry", 1)).await;
        assert_eq!(outcome.status, JobStatus::Submitted);
        assert_eq!(outcome.submit_attempts, 3);
    }

    #[tokio::test]
    async fn gone_job_is_dropped_without_retrying() {
        let queue = Arc::new(MockQueue::new());
        queue
            .submit_failures
            .lock()
            .unwrap()
            .push_back(SubmitError::Gone("re-leased".to_string()));
        let runner = runner_with(queue.clone(), ECHO_ENGINE, 1, 0).await;

        let outcome = runner.run(job("job-gone", 1)).await;
        assert_eq!(outcome.status, JobStatus::Lost);
        assert_eq!(outcome.submit_attempts, 1);
        assert!(queue.submitted.lock().unwrap().is_empty());
    }
}
