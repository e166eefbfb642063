use std::convert::TryFrom;
use tokio::time::Duration;

#[derive(Clone, Default)]
pub struct ZabOptions {
    /// Base unit for all liveness timing. Pings and timeout windows are
    /// multiples of this.
    pub tick_time: Option<Duration>,
    /// Ticks a learner gets to connect and finish syncing with the leader.
    pub init_limit_ticks: Option<u32>,
    /// Ticks of silence after which a live leader/learner link is presumed dead.
    pub sync_limit_ticks: Option<u32>,
    /// How long an election winner waits for a last-moment better ballot
    /// before finalizing.
    pub election_finalize_wait: Option<Duration>,
    /// Cap on the exponential backoff between ballot rebroadcasts while
    /// waiting for unreachable peers.
    pub election_max_notification_interval: Option<Duration>,
}

pub(super) struct ZabOptionsValidated {
    pub tick_time: Duration,
    pub init_limit_ticks: u32,
    pub sync_limit_ticks: u32,
    pub election_finalize_wait: Duration,
    pub election_max_notification_interval: Duration,
}

impl ZabOptionsValidated {
    fn validate(&self) -> Result<(), &'static str> {
        if self.tick_time.is_zero() {
            return Err("Tick time must be non-zero");
        }
        if self.sync_limit_ticks == 0 {
            return Err("Sync limit must be at least one tick");
        }
        if self.init_limit_ticks < self.sync_limit_ticks {
            return Err("Init limit must be at least the sync limit; syncing includes staying alive");
        }
        if self.election_finalize_wait.is_zero() {
            return Err("Election finalize wait must be non-zero");
        }
        if self.election_finalize_wait >= self.election_max_notification_interval {
            return Err("Election finalize wait must be less than the max notification interval");
        }

        Ok(())
    }
}

impl TryFrom<ZabOptions> for ZabOptionsValidated {
    type Error = &'static str;

    fn try_from(options: ZabOptions) -> Result<Self, Self::Error> {
        let values = ZabOptionsValidated {
            tick_time: options.tick_time.unwrap_or(Duration::from_millis(100)),
            init_limit_ticks: options.init_limit_ticks.unwrap_or(10),
            sync_limit_ticks: options.sync_limit_ticks.unwrap_or(5),
            election_finalize_wait: options.election_finalize_wait.unwrap_or(Duration::from_millis(200)),
            election_max_notification_interval: options
                .election_max_notification_interval
                .unwrap_or(Duration::from_secs(60)),
        };

        values.validate()?;
        Ok(values)
    }
}
