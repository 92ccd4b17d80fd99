//! Protocol tuning parameters.

use std::fmt;
use std::time::Duration;

/// Configuration for an LSP client or server endpoint.
///
/// The defaults match the reference protocol: a stop-and-wait window with a
/// two-second epoch and retransmission on every epoch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Params {
    /// Consecutive epochs with no message from the peer before the
    /// connection is declared lost.
    pub epoch_limit: u32,

    /// Milliseconds between epoch ticks.
    pub epoch_millis: u64,

    /// Span of the sliding window, in sequence numbers.
    pub window_size: u32,

    /// Maximum per-message retransmission back-off, in epochs. Zero means
    /// retransmit every epoch with no growth.
    pub max_back_off_interval: u32,

    /// Cap on concurrently unacknowledged messages within the window.
    pub max_unacked_messages: u32,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            epoch_limit: 5,
            epoch_millis: 2000,
            window_size: 1,
            max_back_off_interval: 0,
            max_unacked_messages: 1,
        }
    }
}

impl Params {
    /// Effective cap on in-flight messages: `min(window_size, max_unacked_messages)`.
    pub fn max_in_flight(&self) -> usize {
        self.window_size.min(self.max_unacked_messages) as usize
    }

    pub(crate) fn epoch(&self) -> Duration {
        Duration::from_millis(self.epoch_millis)
    }

    /// Largest allowed gap between two transmissions of the same message.
    pub(crate) fn back_off_cap(&self) -> u32 {
        self.max_back_off_interval.max(1)
    }
}

impl fmt::Display for Params {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[EpochLimit: {}, EpochMillis: {}, WindowSize: {}, MaxBackOffInterval: {}, MaxUnackedMessages: {}]",
            self.epoch_limit,
            self.epoch_millis,
            self.window_size,
            self.max_back_off_interval,
            self.max_unacked_messages
        )
    }
}
