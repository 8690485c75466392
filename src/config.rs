use std::time::Duration;

use clap::Args;

/// Timing knobs for the readiness and upgrade waits.
#[derive(Args, Clone, Debug, PartialEq, Eq)]
pub struct WaitArgs {
    /// Give up once nothing observable has changed for this many seconds
    #[arg(long, default_value_t = 30 * 60)]
    pub operation_timeout_secs: u64,

    /// Poll interval of the stall-detecting waits, in seconds
    #[arg(long, default_value_t = 15)]
    pub stall_poll_interval_secs: u64,

    /// Poll interval of the bounded waits, in seconds
    #[arg(long, default_value_t = 10)]
    pub check_interval_secs: u64,

    /// Pause before the first upgrade check, in seconds
    #[arg(long, default_value_t = 60)]
    pub upgrade_settle_delay_secs: u64,

    /// How long a managed cluster may stay unreachable, in seconds
    #[arg(long, default_value_t = 120)]
    pub unreachable_grace_secs: u64,

    /// Hard ceiling on a stall-detecting wait, in seconds
    #[arg(long)]
    pub max_operation_timeout_secs: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WaitConfig {
    pub operation_timeout: Duration,
    pub stall_poll_interval: Duration,
    pub check_interval: Duration,
    pub upgrade_settle_delay: Duration,
    pub unreachable_grace: Duration,
    pub max_operation_timeout: Option<Duration>,
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self {
            operation_timeout: Duration::from_secs(30 * 60),
            stall_poll_interval: Duration::from_secs(15),
            check_interval: Duration::from_secs(10),
            upgrade_settle_delay: Duration::from_secs(60),
            unreachable_grace: Duration::from_secs(2 * 60),
            max_operation_timeout: None,
        }
    }
}

impl From<WaitArgs> for WaitConfig {
    fn from(args: WaitArgs) -> Self {
        Self {
            operation_timeout: Duration::from_secs(args.operation_timeout_secs),
            stall_poll_interval: Duration::from_secs(args.stall_poll_interval_secs),
            check_interval: Duration::from_secs(args.check_interval_secs),
            upgrade_settle_delay: Duration::from_secs(args.upgrade_settle_delay_secs),
            unreachable_grace: Duration::from_secs(args.unreachable_grace_secs),
            max_operation_timeout: args.max_operation_timeout_secs.map(Duration::from_secs),
        }
    }
}

#[derive(Args, Clone, Debug, PartialEq, Eq)]
pub struct ReplicatorArgs {
    /// Attempts at an ownership update before a conflict is surfaced
    #[arg(long, default_value_t = 5)]
    pub conflict_retry_attempts: u32,

    /// Pause between conflicting ownership updates, in milliseconds
    #[arg(long, default_value_t = 10)]
    pub conflict_retry_delay_ms: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReplicatorConfig {
    pub conflict_retry_attempts: u32,
    pub conflict_retry_delay: Duration,
}

impl Default for ReplicatorConfig {
    fn default() -> Self {
        Self {
            conflict_retry_attempts: 5,
            conflict_retry_delay: Duration::from_millis(10),
        }
    }
}

impl From<ReplicatorArgs> for ReplicatorConfig {
    fn from(args: ReplicatorArgs) -> Self {
        Self {
            conflict_retry_attempts: args.conflict_retry_attempts.max(1),
            conflict_retry_delay: Duration::from_millis(args.conflict_retry_delay_ms),
        }
    }
}
