//! Tunable constants and runtime configuration.

use embassy_time::Duration;

/// Period of the broadcast PA/BIG pipeline's drain tick. The original
/// `bluez` `bap.c` plugin this engine is modeled on names this
/// `PA_IDLE_TIMEOUT` and hard-codes it to 2 seconds.
pub const DEFAULT_PA_TICK_PERIOD: Duration = Duration::from_secs(2);

/// Default ISO sync timeout: how long a pending PA-sync/BIG-sync request is
/// allowed to stay outstanding before it is treated as a transport error
/// (handled identically to a disconnect).
pub const DEFAULT_ISO_SYNC_TIMEOUT: Duration = Duration::from_secs(20);

/// Default defer-timeout used when listening for a BIS accept.
pub const DEFAULT_BIS_DEFER_TIMEOUT: Duration = Duration::from_secs(5);

/// Bound on the broadcast pipeline's per-adapter FIFO of broadcast requests.
/// A real adapter never has more than a handful of peers syncing
/// concurrently; this keeps the queue a fixed-capacity `heapless::Deque`
/// rather than an unbounded allocation.
pub const MAX_PENDING_BROADCAST_REQUESTS: usize = 8;

/// Runtime-overridable knobs for the broadcast pipeline and group scheduler.
/// Constructed endpoints may override these at `Engine` construction time;
/// [`Default`] reproduces the constants above.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PaPipelineConfig {
    pub tick_period: Duration,
    pub iso_sync_timeout: Duration,
    pub bis_defer_timeout: Duration,
}

impl Default for PaPipelineConfig {
    fn default() -> Self {
        Self {
            tick_period: DEFAULT_PA_TICK_PERIOD,
            iso_sync_timeout: DEFAULT_ISO_SYNC_TIMEOUT,
            bis_defer_timeout: DEFAULT_BIS_DEFER_TIMEOUT,
        }
    }
}
