use crate::build_info;
use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    about = "Continuous token-range repair for Cassandra-style clusters",
    version = build_info::VERSION_WITH_COMMIT,
    long_version = build_info::VERSION_WITH_COMMIT
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the repair loop until stopped
    Run(RunArgs),
    /// Print how a ring would be split into repair ranges
    Segments(SegmentsArgs),
    /// Print the stored progress snapshot
    Status(StatusArgs),
}

/// Where progress is kept. Shared by `run` and `status`.
#[derive(Args, Debug, Clone, Default)]
pub struct StoreArgs {
    /// `consul`, `postgres` or `memory`
    #[arg(long)]
    pub store: Option<String>,
    #[arg(long = "consul-url")]
    pub consul_url: Option<String>,
    #[arg(long = "database-url")]
    pub database_url: Option<String>,
    /// Defaults to `ring_repair/<cluster>/progress`
    #[arg(long = "progress-key")]
    pub progress_key: Option<String>,
}

#[derive(Args, Debug, Clone, Default)]
pub struct RunArgs {
    #[arg(long)]
    pub cluster: Option<String>,
    /// Comma separated, repaired in this order
    #[arg(long)]
    pub keyspaces: Option<String>,
    #[arg(long = "interval-secs")]
    pub interval_secs: Option<u64>,
    #[arg(long = "retry-delay-secs")]
    pub retry_delay_secs: Option<u64>,
    #[arg(long = "service-host")]
    pub service_host: Option<String>,

    #[command(flatten)]
    pub store: StoreArgs,

    #[arg(long = "seed-agent-url")]
    pub seed_agent_url: Option<String>,
    /// Node agent per ring endpoint, as `endpoint=url,...`
    #[arg(long)]
    pub nodes: Option<String>,
    /// Skip asking the seed agent for the partitioner
    #[arg(long)]
    pub partitioner: Option<String>,
    /// Requested segment count per table ring
    #[arg(long)]
    pub slices: Option<u64>,
    /// `proportional` or `per-arc`
    #[arg(long = "segment-policy")]
    pub segment_policy: Option<String>,
    /// `sequential`, `parallel` or `dc_parallel`
    #[arg(long)]
    pub parallelism: Option<String>,
    /// Incremental repair; `REPAIR_INCREMENTAL` accepts 1/0, true/false, yes/no, on/off
    #[arg(long)]
    pub incremental: bool,
    #[arg(long = "completion-timeout-secs")]
    pub completion_timeout_secs: Option<u64>,
    #[arg(long = "poll-interval-ms")]
    pub poll_interval_ms: Option<u64>,

    #[arg(long)]
    pub bind: Option<String>,
    #[arg(long = "log-level", default_value = "info")]
    pub log_level: String,
}

#[derive(Args, Debug, Clone)]
pub struct SegmentsArgs {
    /// Partitioner class name, e.g. `Murmur3Partitioner`
    #[arg(long)]
    pub partitioner: String,
    /// Ring tokens in ring order, comma separated
    #[arg(long, allow_hyphen_values = true)]
    pub tokens: String,
    #[arg(long, default_value_t = 1)]
    pub count: u64,
    #[arg(long = "segment-policy", default_value = "proportional")]
    pub segment_policy: String,
    /// Print JSON instead of one range per line
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug, Clone, Default)]
pub struct StatusArgs {
    #[arg(long)]
    pub cluster: Option<String>,
    #[command(flatten)]
    pub store: StoreArgs,
    #[arg(long = "log-level", default_value = "warn")]
    pub log_level: String,
}

pub fn parse_args() -> Cli {
    Cli::parse()
}
