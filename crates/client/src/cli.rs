use clap::Parser;
use reqwest::Url;

/// Command-line flags. Everything here overrides the config file; the config
/// file covers what is not given on the command line.
#[derive(Debug, Clone, Parser)]
#[command(name = "trawler", version, about = "Distributed chess analysis worker")]
pub struct Cli {
    /// Queue endpoint base URL.
    #[arg(long, env = "TRAWLER_ENDPOINT")]
    pub endpoint: Option<Url>,

    /// API key presented at registration.
    #[arg(long, env = "TRAWLER_KEY")]
    pub key: Option<String>,

    /// UCI engine command (binary path or name resolved via PATH).
    #[arg(long, env = "TRAWLER_ENGINE")]
    pub engine: Option<String>,

    /// Extra argument passed to the engine command (repeatable).
    #[arg(long = "engine-arg", value_name = "ARG")]
    pub engine_args: Vec<String>,

    /// Search threads per engine process. Defaults to the cores left over
    /// after dividing by --parallel.
    #[arg(long, env = "TRAWLER_ENGINE_THREADS")]
    pub engine_threads: Option<u32>,

    /// Hash table size per engine process, in MiB.
    #[arg(long = "engine-hash", env = "TRAWLER_ENGINE_HASH_MIB", value_name = "MIB")]
    pub engine_hash_mib: Option<u32>,

    /// Number of engine processes to run in parallel.
    #[arg(
        short = 'p',
        long,
        env = "TRAWLER_PARALLEL",
        value_parser = clap::value_parser!(u16).range(1..=64)
    )]
    pub parallel: Option<u16>,

    /// Seconds between cumulative stats lines (0 disables them).
    #[arg(long, env = "TRAWLER_STATS_INTERVAL", default_value_t = 60)]
    pub stats_interval: u64,

    /// Never prompt, even on a terminal; first-run setup is skipped.
    #[arg(long, env = "TRAWLER_NON_INTERACTIVE", default_value_t = false)]
    pub non_interactive: bool,
}

pub fn default_parallel() -> u16 {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .min(64) as u16
}

/// Threads per engine when no explicit value is given: spread the machine's
/// cores over the engine processes, at least one each.
pub fn default_engine_threads(parallel: usize) -> u32 {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    (cores / parallel.max(1)).max(1) as u32
}
