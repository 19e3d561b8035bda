use clap::Parser;
use market_core::tasks::TaskDefaults;

/// Coordinator configuration.
///
/// Idiomatic Rust notes:
/// - Prefer explicit types over loosely-typed maps for config.
/// - Parse once at startup; pass `&CoordinatorConfig` through.
/// - Avoid global mutable state.
#[derive(Parser, Debug, Clone)]
pub struct CoordinatorConfig {
    /// Database location, e.g. `sqlite://coordinator.db` or `sqlite::memory:`.
    #[arg(long, env = "COORDINATOR_DATABASE_URL", default_value = "sqlite://coordinator.db")]
    pub database_url: String,

    /// HTTP bind address.
    #[arg(long, env = "COORDINATOR_BIND", default_value = "127.0.0.1:8000")]
    pub bind: String,

    /// Seconds without a heartbeat before a worker counts as stale.
    #[arg(long, env = "HEARTBEAT_TTL_SECONDS", default_value_t = 75)]
    pub heartbeat_ttl_secs: u64,

    /// Lease window granted per claim. Kept below the heartbeat TTL so a
    /// live worker heartbeats at least twice within one lease.
    #[arg(long, env = "LEASE_SECONDS", default_value_t = 50)]
    pub lease_secs: u64,

    /// Reaper tick interval.
    #[arg(long, env = "REQUEUE_SWEEP_SECONDS", default_value_t = 10)]
    pub requeue_sweep_secs: u64,

    /// Attempt budget for tasks that don't specify one.
    #[arg(long, env = "MAX_ATTEMPTS_DEFAULT", default_value_t = 5)]
    pub max_attempts_default: i64,

    /// Quorum size for tasks that don't specify one.
    #[arg(long, env = "REQUIRED_SUBMISSIONS_DEFAULT", default_value_t = 3)]
    pub required_submissions_default: i64,
}

impl CoordinatorConfig {
    /// Parse config from environment only (no CLI parsing).
    ///
    /// We intentionally parse from a single fake argv element so clap doesn't
    /// try to interpret the coordinator subcommand flags here.
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self::parse_from(["market-coordinator"]))
    }

    pub fn lease(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.lease_secs.min(i64::MAX as u64) as i64)
    }

    pub fn heartbeat_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.heartbeat_ttl_secs.min(i64::MAX as u64) as i64)
    }

    pub fn task_defaults(&self) -> TaskDefaults {
        TaskDefaults {
            required_submissions: self.required_submissions_default,
            max_attempts: self.max_attempts_default,
        }
    }
}
