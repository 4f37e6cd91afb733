//! UCI line protocol: command formatting and engine-output parsing.
//!
//! No I/O lives here; [`crate::engine::EngineHandle`] owns the subprocess and
//! feeds lines through [`parse_line`].

use crate::queue::{AnalysisLimits, Score};

/// One parsed line of engine output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum UciMessage {
    /// `id <field> <value>`, e.g. `id name Stockfish 16`.
    Id { field: String, value: String },
    /// `option name <name> type ...` advertised during the handshake.
    Option { name: String },
    UciOk,
    ReadyOk,
    Info(SearchInfo),
    /// `bestmove <move>`; `None` for `bestmove (none)`.
    BestMove(Option<String>),
    /// Anything we do not recognize. Logged, not fatal.
    Unknown(String),
}

/// Fields of an `info` line we care about.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct SearchInfo {
    pub(crate) depth: Option<u32>,
    pub(crate) seldepth: Option<u32>,
    pub(crate) multipv: Option<u32>,
    pub(crate) nodes: Option<u64>,
    pub(crate) nps: Option<u64>,
    pub(crate) time_ms: Option<u64>,
    pub(crate) score: Option<Score>,
    /// Whether the score carried `lowerbound`/`upperbound`.
    pub(crate) score_is_bound: bool,
    pub(crate) pv: Vec<String>,
}

const INFO_KEYWORDS: &[&str] = &[
    "depth",
    "seldepth",
    "time",
    "nodes",
    "multipv",
    "currmove",
    "currmovenumber",
    "hashfull",
    "nps",
    "tbhits",
    "cpuload",
    "refutation",
    "currline",
    "string",
    "score",
    "pv",
];

pub(crate) fn parse_line(line: &str) -> UciMessage {
    let line = line.trim();
    let (command, arg) = match line.split_once(char::is_whitespace) {
        Some((c, a)) => (c, a.trim_start()),
        None => (line, ""),
    };

    match command {
        "uciok" => UciMessage::UciOk,
        "readyok" => UciMessage::ReadyOk,
        "id" => match arg.split_once(char::is_whitespace) {
            Some((field, value)) => UciMessage::Id {
                field: field.to_string(),
                value: value.trim_start().to_string(),
            },
            None => UciMessage::Unknown(line.to_string()),
        },
        "option" => {
            // `option name <tokens...> type <...>` — the name runs until the
            // `type` keyword.
            let mut name = Vec::new();
            for token in arg.split_whitespace().skip(1) {
                if !name.is_empty() && token == "type" {
                    break;
                }
                name.push(token);
            }
            UciMessage::Option {
                name: name.join(" "),
            }
        }
        "info" => UciMessage::Info(parse_info(arg)),
        "bestmove" => {
            let best = arg.split_whitespace().next().unwrap_or("");
            if best.is_empty() || best == "(none)" {
                UciMessage::BestMove(None)
            } else {
                UciMessage::BestMove(Some(best.to_string()))
            }
        }
        _ => UciMessage::Unknown(line.to_string()),
    }
}

fn parse_info(arg: &str) -> SearchInfo {
    let mut info = SearchInfo::default();
    let mut param: Option<&str> = None;
    let mut score_kind: Option<&str> = None;
    let mut score_value: Option<i32> = None;
    let mut score_bound = false;

    for token in arg.split_whitespace() {
        if param == Some("string") {
            // Everything after `string` is free text.
            continue;
        }
        if let Some(keyword) = INFO_KEYWORDS.iter().find(|k| **k == token) {
            if *keyword == "pv" {
                info.pv.clear();
            }
            param = Some(keyword);
            continue;
        }

        match param {
            Some("depth") => info.depth = token.parse().ok(),
            Some("seldepth") => info.seldepth = token.parse().ok(),
            Some("multipv") => info.multipv = token.parse().ok(),
            Some("nodes") => info.nodes = token.parse().ok(),
            Some("nps") => info.nps = token.parse().ok(),
            Some("time") => info.time_ms = token.parse().ok(),
            Some("score") => match token {
                "cp" | "mate" => {
                    score_kind = Some(if token == "cp" { "cp" } else { "mate" });
                    score_value = None;
                }
                "lowerbound" | "upperbound" => score_bound = true,
                _ => score_value = token.parse().ok(),
            },
            Some("pv") => info.pv.push(token.to_string()),
            _ => {}
        }
    }

    if let (Some(kind), Some(value)) = (score_kind, score_value) {
        info.score = Some(match kind {
            "cp" => Score::Cp(value),
            _ => Score::Mate(value),
        });
        info.score_is_bound = score_bound;
    }

    info
}

pub(crate) fn position_command(fen: &str, moves: &[String]) -> String {
    if moves.is_empty() {
        format!("position fen {fen}")
    } else {
        format!("position fen {fen} moves {}", moves.join(" "))
    }
}

pub(crate) fn go_command(limits: &AnalysisLimits) -> String {
    let mut builder = vec!["go".to_string()];
    if let Some(depth) = limits.depth {
        builder.push("depth".to_string());
        builder.push(depth.to_string());
    }
    if let Some(nodes) = limits.nodes {
        builder.push("nodes".to_string());
        builder.push(nodes.to_string());
    }
    if let Some(movetime) = limits.movetime_ms {
        builder.push("movetime".to_string());
        builder.push(movetime.to_string());
    }
    builder.join(" ")
}

pub(crate) fn setoption_command(name: &str, value: &str) -> String {
    format!("setoption name {name} value {value}")
}

/// UCI options selecting a chess variant, following the lichess conventions
/// (`fromposition`/`chess960` play standard chess with the 960 castling
/// flag; `antichess` is spelled `giveaway` engine-side).
pub(crate) fn variant_options(variant: &str) -> Vec<(String, String)> {
    let variant = variant.to_ascii_lowercase();
    let chess960 = matches!(variant.as_str(), "fromposition" | "chess960");

    let uci_variant = match variant.as_str() {
        "standard" | "fromposition" | "chess960" => "chess",
        "antichess" => "giveaway",
        other => other,
    };

    vec![
        (
            "UCI_Chess960".to_string(),
            if chess960 { "true" } else { "false" }.to_string(),
        ),
        ("UCI_Variant".to_string(), uci_variant.to_string()),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_handshake_lines() {
        assert_eq!(
            parse_line("id name Stockfish 16.1"),
            UciMessage::Id {
                field: "name".to_string(),
                value: "Stockfish 16.1".to_string()
            }
        );
        assert_eq!(parse_line("uciok"), UciMessage::UciOk);
        assert_eq!(parse_line("readyok"), UciMessage::ReadyOk);
        assert_eq!(
            parse_line("option name Skill Level type spin default 20 min 0 max 20"),
            UciMessage::Option {
                name: "Skill Level".to_string()
            }
        );
    }

    #[test]
    fn parses_full_info_line() {
        let msg = parse_line(
            "info depth 20 seldepth 28 multipv 1 score cp 31 nodes 3500123 nps 1400000 \
             time 2500 pv e2e4 e7e5 g1f3",
        );
        let UciMessage::Info(info) = msg else {
            panic!("expected info, got {msg:?}");
        };
        assert_eq!(info.depth, Some(20));
        assert_eq!(info.seldepth, Some(28));
        assert_eq!(info.multipv, Some(1));
        assert_eq!(info.score, Some(Score::Cp(31)));
        assert!(!info.score_is_bound);
        assert_eq!(info.nodes, Some(3_500_123));
        assert_eq!(info.nps, Some(1_400_000));
        assert_eq!(info.time_ms, Some(2500));
        assert_eq!(info.pv, vec!["e2e4", "e7e5", "g1f3"]);
    }

    #[test]
    fn mate_scores_and_bounds() {
        let UciMessage::Info(info) = parse_line("info depth 12 score mate -3 pv h7h8q") else {
            panic!()
        };
        assert_eq!(info.score, Some(Score::Mate(-3)));

        let UciMessage::Info(info) = parse_line("info depth 9 score cp 55 upperbound nodes 900")
        else {
            panic!()
        };
        assert_eq!(info.score, Some(Score::Cp(55)));
        assert!(info.score_is_bound);
    }

    #[test]
    fn string_payload_does_not_pollute_fields() {
        let UciMessage::Info(info) =
            parse_line("info string NNUE evaluation using nn-5af11540bbfe.nnue")
        else {
            panic!()
        };
        assert_eq!(info, SearchInfo::default());
    }

    #[test]
    fn bestmove_variants() {
        assert_eq!(
            parse_line("bestmove e2e4 ponder e7e5"),
            UciMessage::BestMove(Some("e2e4".to_string()))
        );
        assert_eq!(parse_line("bestmove (none)"), UciMessage::BestMove(None));
    }

    #[test]
    fn builds_position_and_go_commands() {
        assert_eq!(
            position_command("rn1q1rk1/1p2bppp/8 w - - 0 1", &[]),
            "position fen rn1q1rk1/1p2bppp/8 w - - 0 1"
        );
        assert_eq!(
            position_command("startpos-fen", &["e2e4".to_string(), "c7c5".to_string()]),
            "position fen startpos-fen moves e2e4 c7c5"
        );

        let limits = AnalysisLimits {
            depth: Some(18),
            nodes: Some(3_500_000),
            movetime_ms: Some(4000),
            multipv: None,
        };
        assert_eq!(go_command(&limits), "go depth 18 nodes 3500000 movetime 4000");
    }

    #[test]
    fn variant_mapping_follows_lichess_conventions() {
        assert!(
            variant_options("standard")
                .contains(&("UCI_Chess960".to_string(), "false".to_string()))
        );
        assert!(
            variant_options("fromPosition")
                .contains(&("UCI_Chess960".to_string(), "true".to_string()))
        );
        assert!(
            variant_options("antichess")
                .contains(&("UCI_Variant".to_string(), "giveaway".to_string()))
        );
        assert!(
            variant_options("atomic").contains(&("UCI_Variant".to_string(), "atomic".to_string()))
        );
    }
}
