use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};

use crate::api::EngineSpec;
use crate::queue::{AnalysisLimits, AnalysisResult, EngineIdent, PositionSpec, Variation};
use crate::uci::{self, SearchInfo, UciMessage};

/// Grace period between `quit` and a forced kill.
const QUIT_GRACE: Duration = Duration::from_secs(2);

/// Floor for the movetime-derived analyze timeout; node-limited searches can
/// legitimately run past the movetime hint.
const MOVETIME_TIMEOUT_FLOOR: Duration = Duration::from_secs(60);

#[derive(Debug, thiserror::Error)]
pub(crate) enum EngineError {
    #[error("engine start failed: {0}")]
    Start(String),
    #[error("analysis timed out after {0:?}")]
    Timeout(Duration),
    #[error("engine process exited unexpectedly")]
    Exited,
    #[error("engine protocol violation: {0}")]
    Protocol(String),
    #[error("engine i/o: {0}")]
    Io(#[from] std::io::Error),
}

/// One position plus its limits, dispatched to a single handle.
pub(crate) struct AnalysisRequest<'a> {
    pub(crate) job_id: &'a str,
    pub(crate) variant: Option<&'a str>,
    pub(crate) position: &'a PositionSpec,
    /// Already normalized via [`AnalysisLimits::effective`].
    pub(crate) limits: AnalysisLimits,
}

/// Owns one engine subprocess and serializes analysis calls on it.
#[derive(Debug)]
pub(crate) struct EngineHandle {
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
    slot: usize,
    healthy: bool,
    analyze_cap: Duration,
    ident: EngineIdent,
    /// Job id of the last `ucinewgame` setup, to skip redundant re-setup
    /// when consecutive positions of the same job land on this handle.
    current_job: Option<String>,
    multipv: u32,
}

impl EngineHandle {
    /// Spawn the subprocess and run the UCI handshake.
    pub(crate) async fn start(spec: &EngineSpec, slot: usize) -> Result<Self, EngineError> {
        let mut child = Command::new(&spec.command)
            .args(&spec.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| EngineError::Start(format!("spawn {}: {err}", spec.command)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| EngineError::Start("engine stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::Start("engine stdout unavailable".to_string()))?;

        let mut handle = Self {
            child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
            slot,
            healthy: true,
            analyze_cap: spec.analyze_cap,
            ident: EngineIdent::default(),
            current_job: None,
            multipv: 1,
        };

        match tokio::time::timeout(spec.start_timeout, handle.handshake(spec)).await {
            Ok(Ok(())) => Ok(handle),
            Ok(Err(EngineError::Start(msg))) => Err(EngineError::Start(msg)),
            Ok(Err(err)) => Err(EngineError::Start(format!("handshake: {err}"))),
            Err(_) => Err(EngineError::Start(format!(
                "handshake timed out after {:?}",
                spec.start_timeout
            ))),
        }
    }

    async fn handshake(&mut self, spec: &EngineSpec) -> Result<(), EngineError> {
        self.send("uci").await?;
        loop {
            match uci::parse_line(&self.recv().await?) {
                UciMessage::UciOk => break,
                UciMessage::Id { field, value } if field == "name" => {
                    self.ident = ident_from_name(value);
                }
                UciMessage::Id { .. }
                | UciMessage::Option { .. }
                | UciMessage::Info(_)
                | UciMessage::Unknown(_) => {}
                other => {
                    return Err(EngineError::Protocol(format!(
                        "unexpected handshake output: {other:?}"
                    )));
                }
            }
        }
        if self.ident.name.is_empty() {
            return Err(EngineError::Start(
                "engine did not identify itself before uciok".to_string(),
            ));
        }

        self.send(&uci::setoption_command("Threads", &spec.threads.to_string()))
            .await?;
        self.send(&uci::setoption_command("Hash", &spec.hash_mib.to_string()))
            .await?;
        for (name, value) in &spec.options {
            self.send(&uci::setoption_command(name, value)).await?;
        }
        self.sync().await
    }

    /// `isready` / `readyok` barrier.
    async fn sync(&mut self) -> Result<(), EngineError> {
        self.send("isready").await?;
        loop {
            match uci::parse_line(&self.recv().await?) {
                UciMessage::ReadyOk => return Ok(()),
                UciMessage::Info(_) | UciMessage::Unknown(_) => {}
                other => {
                    return Err(EngineError::Protocol(format!(
                        "unexpected output awaiting readyok: {other:?}"
                    )));
                }
            }
        }
    }

    /// Analyze one position, blocking until the `bestmove` sentinel or the
    /// per-call timeout. Any failure marks the handle dead.
    pub(crate) async fn analyze(
        &mut self,
        req: &AnalysisRequest<'_>,
    ) -> Result<AnalysisResult, EngineError> {
        // Unhealthy for the duration of the call: if the caller is cancelled
        // mid-search the handle goes to the respawner instead of rejoining
        // the idle set with a search still running.
        self.healthy = false;
        let timeout = self.analyze_timeout(&req.limits);
        match tokio::time::timeout(timeout, self.analyze_inner(req)).await {
            Ok(Ok(result)) => {
                self.healthy = true;
                Ok(result)
            }
            Ok(Err(err)) => Err(err),
            Err(_) => {
                let _ = self.child.start_kill();
                Err(EngineError::Timeout(timeout))
            }
        }
    }

    fn analyze_timeout(&self, limits: &AnalysisLimits) -> Duration {
        match limits.movetime_ms {
            Some(mt) => Duration::from_millis(mt.saturating_mul(3)).max(MOVETIME_TIMEOUT_FLOOR),
            None => self.analyze_cap,
        }
    }

    async fn analyze_inner(
        &mut self,
        req: &AnalysisRequest<'_>,
    ) -> Result<AnalysisResult, EngineError> {
        if self.current_job.as_deref() != Some(req.job_id) {
            self.setup_job(req).await?;
            self.current_job = Some(req.job_id.to_string());
        }

        self.send(&uci::position_command(&req.position.fen, &req.position.moves))
            .await?;
        self.sync().await?;
        self.send(&uci::go_command(&req.limits)).await?;

        let mut lines: BTreeMap<u32, SearchInfo> = BTreeMap::new();
        loop {
            match uci::parse_line(&self.recv().await?) {
                UciMessage::Info(info) => {
                    let rank = info.multipv.unwrap_or(1);
                    merge_info(lines.entry(rank).or_default(), info);
                }
                UciMessage::BestMove(best) => {
                    self.sync().await?;
                    return Ok(build_result(best, lines, req.limits.multipv.unwrap_or(1)));
                }
                UciMessage::Unknown(_) => {}
                other => {
                    return Err(EngineError::Protocol(format!(
                        "unexpected output during search: {other:?}"
                    )));
                }
            }
        }
    }

    async fn setup_job(&mut self, req: &AnalysisRequest<'_>) -> Result<(), EngineError> {
        for (name, value) in uci::variant_options(req.variant.unwrap_or("standard")) {
            self.send(&uci::setoption_command(&name, &value)).await?;
        }

        let multipv = req.limits.multipv.unwrap_or(1).max(1);
        if multipv != self.multipv {
            self.send(&uci::setoption_command("MultiPV", &multipv.to_string()))
                .await?;
            self.multipv = multipv;
        }

        self.send("ucinewgame").await?;
        self.sync().await
    }

    /// Whether the handle can still serve requests. A dead handle goes back
    /// to the pool's respawner instead of the idle set.
    pub(crate) fn is_healthy(&self) -> bool {
        self.healthy
    }

    pub(crate) fn slot(&self) -> usize {
        self.slot
    }

    pub(crate) fn ident(&self) -> &EngineIdent {
        &self.ident
    }

    /// Polite quit with a grace period, then a kill.
    pub(crate) async fn shutdown(mut self) {
        let _ = self.send("quit").await;
        if tokio::time::timeout(QUIT_GRACE, self.child.wait())
            .await
            .is_err()
        {
            let _ = self.child.kill().await;
        }
    }

    async fn send(&mut self, line: &str) -> Result<(), EngineError> {
        self.stdin.write_all(line.as_bytes()).await?;
        self.stdin.write_all(b"\n").await?;
        self.stdin.flush().await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<String, EngineError> {
        loop {
            match self.stdout.next_line().await? {
                None => return Err(EngineError::Exited),
                Some(line) if line.trim().is_empty() => continue,
                Some(line) => return Ok(line),
            }
        }
    }
}

/// Engines report `id name Stockfish 17.1`; the trailing token is the
/// version when it carries a digit.
fn ident_from_name(value: String) -> EngineIdent {
    let version = value
        .rsplit(' ')
        .next()
        .filter(|tok| *tok != value && tok.chars().any(|c| c.is_ascii_digit()))
        .map(str::to_string);
    EngineIdent {
        name: value,
        version,
    }
}

fn merge_info(into: &mut SearchInfo, from: SearchInfo) {
    if from.depth.is_some() {
        into.depth = from.depth;
    }
    if from.seldepth.is_some() {
        into.seldepth = from.seldepth;
    }
    if from.nodes.is_some() {
        into.nodes = from.nodes;
    }
    if from.nps.is_some() {
        into.nps = from.nps;
    }
    if from.time_ms.is_some() {
        into.time_ms = from.time_ms;
    }
    if !from.pv.is_empty() {
        into.pv = from.pv;
    }
    // Bound scores never become the final evaluation.
    if let Some(score) = from.score {
        if !from.score_is_bound {
            into.score = Some(score);
        }
    }
}

fn build_result(
    best_move: Option<String>,
    mut lines: BTreeMap<u32, SearchInfo>,
    multipv: u32,
) -> AnalysisResult {
    let principal = lines.remove(&1).unwrap_or_default();

    let variations = if multipv > 1 {
        let extra: Vec<Variation> = lines
            .into_iter()
            .filter(|(rank, _)| *rank > 1)
            .map(|(rank, info)| Variation {
                multipv: rank,
                score: info.score,
                pv: info.pv,
            })
            .collect();
        if extra.is_empty() { None } else { Some(extra) }
    } else {
        None
    };

    AnalysisResult {
        best_move,
        pv: principal.pv,
        score: principal.score,
        depth: principal.depth.unwrap_or(0),
        seldepth: principal.seldepth,
        nodes: principal.nodes.unwrap_or(0),
        time_ms: principal.time_ms.unwrap_or(0),
        nps: principal.nps,
        variations,
    }
}
