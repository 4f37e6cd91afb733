use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use tokio::sync::mpsc;

/// Shared signal counter: the first signal asks for a graceful stop, any
/// further one for an immediate exit.
#[derive(Debug)]
pub struct ShutdownController {
    forced: AtomicU8,
}

#[derive(Debug, Clone, Copy)]
pub enum ShutdownEvent {
    Graceful,
    Immediate,
}

impl ShutdownController {
    pub fn new() -> Self {
        Self {
            forced: AtomicU8::new(0),
        }
    }

    pub fn bump_forced(&self) -> u8 {
        self.forced.fetch_add(1, Ordering::SeqCst) + 1
    }
}

fn dispatch(shutdown: &ShutdownController, tx: &mpsc::UnboundedSender<ShutdownEvent>) -> bool {
    if shutdown.bump_forced() == 1 {
        let _ = tx.send(ShutdownEvent::Graceful);
        true
    } else {
        let _ = tx.send(ShutdownEvent::Immediate);
        false
    }
}

pub fn spawn_signal_handlers(
    shutdown: Arc<ShutdownController>,
    shutdown_tx: mpsc::UnboundedSender<ShutdownEvent>,
) {
    {
        let shutdown = shutdown.clone();
        let shutdown_tx = shutdown_tx.clone();
        tokio::spawn(async move {
            loop {
                if tokio::signal::ctrl_c().await.is_err() {
                    return;
                }
                if !dispatch(&shutdown, &shutdown_tx) {
                    return;
                }
            }
        });
    }

    #[cfg(unix)]
    tokio::spawn(async move {
        let Ok(mut sigterm) =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        else {
            return;
        };
        loop {
            if sigterm.recv().await.is_none() {
                return;
            }
            if !dispatch(&shutdown, &shutdown_tx) {
                return;
            }
        }
    });
}
