//! Missed-history replay decision.

use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::stream::proto::ReplayRequest;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReplayPolicy {
    /// Longest gap since the previous connection for which the server is
    /// asked to resend history.
    pub max_gap: Duration,
}

impl ReplayPolicy {
    pub fn new(max_gap: Duration) -> Self {
        Self { max_gap }
    }

    /// Builds the replay request for a freshly resynced connection, or
    /// `None` when replay does not apply.
    pub fn evaluate(
        &self,
        channels: Vec<String>,
        last_seen_id: Option<&str>,
        previous_connected_at: Option<Instant>,
        now: Instant,
    ) -> Option<ReplayRequest> {
        let Some(start) = last_seen_id else {
            debug!(event = "push_replay_skipped", reason = "no_last_seen_id");
            return None;
        };
        let Some(previous) = previous_connected_at else {
            debug!(event = "push_replay_skipped", reason = "first_connection");
            return None;
        };

        let gap = now.saturating_duration_since(previous);
        if gap >= self.max_gap {
            debug!(
                event = "push_replay_skipped",
                reason = "gap_exceeds_window",
                gap_ms = gap.as_millis() as u64,
                max_gap_ms = self.max_gap.as_millis() as u64
            );
            return None;
        }

        Some(ReplayRequest {
            channels,
            start: start.to_string(),
        })
    }
}
