use std::time::Duration;

use trawler_client_engine::{JobOutcome, JobStatus, SessionState};

/// Local wall-clock prefix for log lines.
pub fn timestamp() -> String {
    chrono::Local::now().format("%H:%M:%S").to_string()
}

pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs >= 3600 {
        format!("{}h{:02}m", secs / 3600, (secs % 3600) / 60)
    } else if secs >= 60 {
        format!("{}m{:02}s", secs / 60, secs % 60)
    } else {
        format!("{:.1}s", d.as_secs_f64())
    }
}

pub fn format_nodes(nodes: u64) -> String {
    if nodes >= 1_000_000_000 {
        format!("{:.1}G", nodes as f64 / 1e9)
    } else if nodes >= 1_000_000 {
        format!("{:.1}M", nodes as f64 / 1e6)
    } else if nodes >= 1_000 {
        format!("{:.1}k", nodes as f64 / 1e3)
    } else {
        nodes.to_string()
    }
}

pub fn format_session(state: SessionState) -> &'static str {
    match state {
        SessionState::Unregistered => "unregistered",
        SessionState::Registering => "registering",
        SessionState::Active => "active",
        SessionState::Degraded => "degraded (retrying keepalive)",
        SessionState::Halted => "halted by queue",
    }
}

pub fn format_job_line(outcome: &JobOutcome) -> String {
    let status = match outcome.status {
        JobStatus::Submitted => "done".to_string(),
        JobStatus::Abandoned => "abandoned".to_string(),
        JobStatus::Lost => match &outcome.error {
            Some(err) => format!("lost ({err})"),
            None => "lost".to_string(),
        },
    };
    format!(
        "job {} {status}: {} positions, {} nodes in {}",
        outcome.job_id,
        outcome.positions,
        format_nodes(outcome.nodes),
        format_duration(Duration::from_millis(outcome.total_ms)),
    )
}

/// Cumulative stats since startup, in the shape of one log line.
#[derive(Debug, Default)]
pub struct Stats {
    pub jobs: u64,
    pub jobs_ok: u64,
    pub positions: u64,
    pub nodes: u64,
}

impl Stats {
    pub fn record(&mut self, outcome: &JobOutcome) {
        self.jobs += 1;
        if outcome.status == JobStatus::Submitted {
            self.jobs_ok += 1;
            self.positions += outcome.positions as u64;
        }
        self.nodes += outcome.nodes;
    }

    pub fn line(&self, uptime: Duration) -> String {
        let knps = if uptime.as_secs() > 0 {
            self.nodes / uptime.as_secs() / 1000
        } else {
            0
        };
        format!(
            "stats: {}/{} jobs ok, {} positions, {} nodes, {knps} knps avg, up {}",
            self.jobs_ok,
            self.jobs,
            self.positions,
            format_nodes(self.nodes),
            format_duration(uptime),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations_pick_a_sensible_unit() {
        assert_eq!(format_duration(Duration::from_millis(2_500)), "2.5s");
        assert_eq!(format_duration(Duration::from_secs(95)), "1m35s");
        assert_eq!(format_duration(Duration::from_secs(3_720)), "1h02m");
    }

    #[test]
    fn node_counts_are_humanized() {
        assert_eq!(format_nodes(950), "950");
        assert_eq!(format_nodes(3_500_000), "3.5M");
        assert_eq!(format_nodes(2_000_000_000), "2.0G");
    }

    #[test]
    fn stats_only_count_submitted_positions() {
        let mut stats = Stats::default();
        stats.record(&JobOutcome {
            job_id: "a".to_string(),
            positions: 10,
            status: JobStatus::Submitted,
            error: None,
            submit_attempts: 1,
            nodes: 1000,
            analyze_ms: 1,
            submit_ms: 1,
            total_ms: 2,
        });
        stats.record(&JobOutcome {
            job_id: "b".to_string(),
            positions: 10,
            status: JobStatus::Abandoned,
            error: Some("lease expired".to_string()),
            submit_attempts: 0,
            nodes: 500,
            analyze_ms: 1,
            submit_ms: 0,
            total_ms: 1,
        });
        assert_eq!(stats.jobs, 2);
        assert_eq!(stats.jobs_ok, 1);
        assert_eq!(stats.positions, 10);
        assert_eq!(stats.nodes, 1500);
    }
}
