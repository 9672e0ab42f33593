//! Keepalive pings and stall detection for an open connection.

use std::time::Duration;

use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};

pub struct LivenessMonitor {
    ticker: Interval,
    stall_after: Duration,
    last_activity: Instant,
}

impl LivenessMonitor {
    /// Starts ticking every `period` from `now`, treating `now` as the last
    /// inbound activity.
    pub fn start(now: Instant, period: Duration, stall_after: Duration) -> Self {
        let mut ticker = interval_at(now + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self {
            ticker,
            stall_after,
            last_activity: now,
        }
    }

    pub fn record_activity(&mut self, now: Instant) {
        self.last_activity = now;
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity)
    }

    pub fn is_stalled(&self, now: Instant) -> bool {
        self.idle_for(now) > self.stall_after
    }

    /// Cancel safe.
    pub async fn tick(&mut self) -> Instant {
        self.ticker.tick().await
    }
}
