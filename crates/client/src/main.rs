mod cli;
mod format;
mod shutdown;

use std::io::IsTerminal;
use std::time::{Duration, Instant};

use clap::Parser;
use reqwest::Url;

use trawler_client_core::config::{WorkerFileConfig, ensure_config};
use trawler_client_engine::{EngineSpec, WorkerConfig, WorkerEvent, start_worker};

use crate::cli::{Cli, default_engine_threads, default_parallel};
use crate::format::{Stats, format_job_line, format_session, timestamp};
use crate::shutdown::{ShutdownController, ShutdownEvent, spawn_signal_handlers};

const DEFAULT_ENDPOINT: &str = "http://127.0.0.1:9000/";
const DEFAULT_ENGINE: &str = "stockfish";

fn resolve_config(cli: &Cli, file: WorkerFileConfig) -> anyhow::Result<WorkerConfig> {
    let endpoint = match (&cli.endpoint, &file.endpoint) {
        (Some(url), _) => url.clone(),
        (None, Some(raw)) => Url::parse(raw)
            .map_err(|err| anyhow::anyhow!("invalid endpoint in config file ({raw:?}): {err}"))?,
        (None, None) => Url::parse(DEFAULT_ENDPOINT).expect("default endpoint parses"),
    };

    let parallel = cli
        .parallel
        .or(file.parallel)
        .unwrap_or_else(default_parallel)
        .max(1) as usize;

    let mut engine = EngineSpec::new(
        cli.engine
            .clone()
            .or(file.engine_command)
            .unwrap_or_else(|| DEFAULT_ENGINE.to_string()),
    );
    engine.args = cli.engine_args.clone();
    engine.threads = cli
        .engine_threads
        .or(file.engine_threads)
        .unwrap_or_else(|| default_engine_threads(parallel));
    if let Some(hash) = cli.engine_hash_mib.or(file.engine_hash_mib) {
        engine.hash_mib = hash;
    }

    let mut cfg = WorkerConfig::new(endpoint, engine);
    cfg.key = cli.key.clone().or(file.key);
    cfg.parallel = parallel;
    Ok(cfg)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let interactive = !cli.non_interactive && std::io::stdin().is_terminal();
    let file = match ensure_config(interactive) {
        Ok(Some(cfg)) => cfg,
        Ok(None) => WorkerFileConfig::default(),
        Err(err) => {
            eprintln!("warning: failed to read/write worker config: {err:#}");
            WorkerFileConfig::default()
        }
    };

    let cfg = resolve_config(&cli, file)?;
    println!(
        "trawler {} endpoint={} engine={} threads={} hash={}MiB parallel={}",
        env!("CARGO_PKG_VERSION"),
        cfg.endpoint,
        cfg.engine.command,
        cfg.engine.threads,
        cfg.engine.hash_mib,
        cfg.parallel,
    );

    let worker = start_worker(cfg);
    let mut events = worker.subscribe();

    let shutdown = std::sync::Arc::new(ShutdownController::new());
    let (shutdown_tx, mut shutdown_rx) = tokio::sync::mpsc::unbounded_channel::<ShutdownEvent>();
    spawn_signal_handlers(shutdown, shutdown_tx);

    let started = Instant::now();
    let mut stats = Stats::default();

    let stats_every = Duration::from_secs(cli.stats_interval.max(1));
    let mut stats_tick = tokio::time::interval(stats_every);
    stats_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    stats_tick.reset(); // skip the immediate first tick

    let mut immediate_exit = false;

    loop {
        tokio::select! {
            ev_opt = shutdown_rx.recv() => {
                match ev_opt {
                    Some(ShutdownEvent::Graceful) => {
                        eprintln!(
                            "Stop requested, finishing in-flight jobs (press CTRL+C again to exit immediately)."
                        );
                        worker.request_stop();
                    }
                    Some(ShutdownEvent::Immediate) => {
                        eprintln!("Stop requested again, exiting immediately.");
                        immediate_exit = true;
                        break;
                    }
                    None => {}
                }
            }
            _ = stats_tick.tick(), if cli.stats_interval > 0 => {
                println!("{} {}", timestamp(), stats.line(started.elapsed()));
            }
            evt = events.recv() => {
                let evt = match evt {
                    Ok(v) => v,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                };

                match evt {
                    WorkerEvent::Started | WorkerEvent::StopRequested => {}
                    WorkerEvent::Session { state } => {
                        println!("{} session: {}", timestamp(), format_session(state));
                    }
                    WorkerEvent::JobStarted { .. } | WorkerEvent::PositionAnalyzed { .. } => {}
                    WorkerEvent::JobFinished { outcome } => {
                        stats.record(&outcome);
                        println!("{} {}", timestamp(), format_job_line(&outcome));
                    }
                    WorkerEvent::EngineRespawned { slot } => {
                        println!("{} engine slot {slot} respawned", timestamp());
                    }
                    WorkerEvent::SlotRetired { slot } => {
                        eprintln!("{} engine slot {slot} retired", timestamp());
                    }
                    WorkerEvent::Warning { message } => {
                        eprintln!("{} warning: {message}", timestamp());
                    }
                    WorkerEvent::Error { message } => {
                        eprintln!("{} error: {message}", timestamp());
                    }
                    WorkerEvent::Stopped => break,
                }
            }
        }
    }

    if stats.jobs > 0 {
        println!("{} {}", timestamp(), stats.line(started.elapsed()));
    }

    if immediate_exit {
        std::process::exit(130);
    }

    worker.wait().await?;
    Ok(())
}
