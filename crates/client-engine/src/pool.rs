use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::mpsc;

use trawler_client_core::retry::RetryPolicy;

use crate::api::EngineSpec;
use crate::engine::{EngineError, EngineHandle};

/// Out-of-band pool notifications consumed by the runtime loop.
#[derive(Debug)]
pub(crate) enum PoolNotice {
    /// A dead slot came back.
    Respawned { slot: usize },
    /// A slot exhausted its respawn budget and was retired.
    Retired { slot: usize, error: String },
    /// No live slots remain. The worker cannot make progress.
    Exhausted,
}

struct PoolInner {
    idle_tx: mpsc::Sender<EngineHandle>,
    idle_rx: tokio::sync::Mutex<mpsc::Receiver<EngineHandle>>,
    dead_tx: mpsc::UnboundedSender<usize>,
    capacity: AtomicUsize,
}

/// Fixed-size set of engine handles.
///
/// `acquire` hands out idle handles FIFO by wait order (the idle receiver
/// sits behind a fair async mutex). Handles come back through the RAII
/// guard: healthy ones rejoin the idle set, dead ones go to the respawner,
/// which retries with backoff and retires the slot once the budget is spent.
pub(crate) struct EnginePool {
    inner: Arc<PoolInner>,
}

impl EnginePool {
    /// Start `parallel` engines up front. A failure here is a startup
    /// failure for the whole worker; mid-flight engine deaths are handled
    /// by the respawner instead.
    pub(crate) async fn start(
        spec: EngineSpec,
        parallel: usize,
        respawn: RetryPolicy,
        notice_tx: mpsc::UnboundedSender<PoolNotice>,
    ) -> Result<Self, EngineError> {
        let parallel = parallel.max(1);
        let (idle_tx, idle_rx) = mpsc::channel(parallel);
        let (dead_tx, dead_rx) = mpsc::unbounded_channel();

        for slot in 0..parallel {
            let handle = EngineHandle::start(&spec, slot).await?;
            idle_tx
                .try_send(handle)
                .map_err(|_| EngineError::Start("idle channel sized below capacity".to_string()))?;
        }

        let inner = Arc::new(PoolInner {
            idle_tx: idle_tx.clone(),
            idle_rx: tokio::sync::Mutex::new(idle_rx),
            dead_tx,
            capacity: AtomicUsize::new(parallel),
        });

        tokio::spawn(run_respawner(
            spec,
            respawn,
            dead_rx,
            idle_tx,
            inner.clone(),
            notice_tx,
        ));

        Ok(Self { inner })
    }

    /// Wait for an idle handle. `None` once the pool has shut down.
    pub(crate) async fn acquire(&self) -> Option<PoolGuard> {
        let mut rx = self.inner.idle_rx.lock().await;
        let handle = rx.recv().await?;
        Some(PoolGuard {
            handle: Some(handle),
            inner: self.inner.clone(),
        })
    }

    /// Live slots (initial parallelism minus retired slots).
    pub(crate) fn capacity(&self) -> usize {
        self.inner.capacity.load(Ordering::Relaxed)
    }

    /// Quit every parked engine and close the pool. In-flight guards drop
    /// their handles on release afterwards (the subprocess dies with the
    /// handle).
    pub(crate) async fn shutdown(&self) {
        let mut rx = self.inner.idle_rx.lock().await;
        rx.close();
        while let Some(handle) = rx.recv().await {
            handle.shutdown().await;
        }
    }
}

impl Clone for EnginePool {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

/// RAII lease on one engine handle. Dropping the guard releases the handle:
/// back to the idle set when healthy, to the respawner when dead.
pub(crate) struct PoolGuard {
    handle: Option<EngineHandle>,
    inner: Arc<PoolInner>,
}

impl Deref for PoolGuard {
    type Target = EngineHandle;

    fn deref(&self) -> &EngineHandle {
        self.handle.as_ref().expect("guard holds handle until drop")
    }
}

impl DerefMut for PoolGuard {
    fn deref_mut(&mut self) -> &mut EngineHandle {
        self.handle.as_mut().expect("guard holds handle until drop")
    }
}

impl Drop for PoolGuard {
    fn drop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        if handle.is_healthy() {
            // Always fits: the channel is sized to pool capacity and only
            // ever holds released handles.
            let _ = self.inner.idle_tx.try_send(handle);
        } else {
            let slot = handle.slot();
            // The dead subprocess dies with the dropped handle.
            drop(handle);
            let _ = self.inner.dead_tx.send(slot);
        }
    }
}

async fn run_respawner(
    spec: EngineSpec,
    policy: RetryPolicy,
    mut dead_rx: mpsc::UnboundedReceiver<usize>,
    idle_tx: mpsc::Sender<EngineHandle>,
    inner: Arc<PoolInner>,
    notice_tx: mpsc::UnboundedSender<PoolNotice>,
) {
    while let Some(slot) = dead_rx.recv().await {
        let spec = spec.clone();
        let idle_tx = idle_tx.clone();
        let inner = inner.clone();
        let notice_tx = notice_tx.clone();
        tokio::spawn(async move {
            respawn_slot(spec, policy, slot, idle_tx, inner, notice_tx).await;
        });
    }
}

async fn respawn_slot(
    spec: EngineSpec,
    policy: RetryPolicy,
    slot: usize,
    idle_tx: mpsc::Sender<EngineHandle>,
    inner: Arc<PoolInner>,
    notice_tx: mpsc::UnboundedSender<PoolNotice>,
) {
    let mut backoff = policy.start();
    let mut last_error = String::new();

    loop {
        let Some(delay) = backoff.next_delay() else {
            let remaining = inner.capacity.fetch_sub(1, Ordering::SeqCst) - 1;
            let _ = notice_tx.send(PoolNotice::Retired {
                slot,
                error: last_error,
            });
            if remaining == 0 {
                let _ = notice_tx.send(PoolNotice::Exhausted);
            }
            return;
        };
        tokio::time::sleep(delay).await;

        match EngineHandle::start(&spec, slot).await {
            Ok(handle) => {
                if idle_tx.send(handle).await.is_err() {
                    // Pool shut down while we were respawning.
                    return;
                }
                let _ = notice_tx.send(PoolNotice::Respawned { slot });
                return;
            }
            Err(err) => {
                last_error = format!("{err:#}");
            }
        }
    }
}
