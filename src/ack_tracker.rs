//! Per-flow bookkeeping shared by every algorithm: cumulative ack tracking
//! across 32-bit sequence wraparound, and drop debouncing.

use std::time::Duration;

use tokio::time::Instant;

/// Acks that land this many packets past the top of the sequence space are
/// taken as wraparound rather than reordering.
pub const WRAP_WINDOW_PKTS: u32 = 10;

/// Tracks the highest cumulative ack seen for a flow.
#[derive(Debug, Clone)]
pub struct AckTracker {
    last_ack: u32,
    wrap_window: u32,
}

impl AckTracker {
    pub fn new(start_seq: u32, packet_size: u32) -> Self {
        Self {
            last_ack: start_seq.saturating_sub(1),
            wrap_window: packet_size.saturating_mul(WRAP_WINDOW_PKTS),
        }
    }

    pub fn last_ack(&self) -> u32 {
        self.last_ack
    }

    /// Record `ack` and return the number of newly acknowledged bytes.
    ///
    /// An ack numerically below `last_ack` counts as progress only when its
    /// wrapped distance from `last_ack` is within one flight (ten packets);
    /// anything else is stale and leaves the tracker untouched.
    pub fn observe(&mut self, ack: u32) -> Option<u32> {
        let acked = ack.wrapping_sub(self.last_ack);
        if ack < self.last_ack && acked > self.wrap_window {
            return None;
        }

        self.last_ack = ack;
        Some(acked)
    }
}

/// Suppresses repeated loss signals from one congestion episode.
#[derive(Debug, Clone, Default)]
pub struct DropDebounce {
    last_drop: Option<Instant>,
}

impl DropDebounce {
    /// Returns true if a drop at `now` should be acted on, and records it.
    /// A drop less than one `rtt` after the last applied drop is ignored.
    pub fn admit(&mut self, now: Instant, rtt: Duration) -> bool {
        if let Some(last) = self.last_drop {
            if now.saturating_duration_since(last) < rtt {
                return false;
            }
        }

        self.last_drop = Some(now);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_seq_sets_last_ack() {
        assert_eq!(AckTracker::new(0, 1460).last_ack(), 0);
        assert_eq!(AckTracker::new(1000, 1460).last_ack(), 999);
    }

    #[test]
    fn in_order_acks_advance() {
        let mut t = AckTracker::new(0, 1462);
        assert_eq!(t.observe(292_400), Some(292_400));
        assert_eq!(t.observe(292_400), Some(0));
        assert_eq!(t.observe(300_000), Some(7_600));
        assert_eq!(t.last_ack(), 300_000);
    }

    #[test]
    fn wraparound_within_flight_is_accepted() {
        let mut t = AckTracker::new(u32::MAX - 999, 1462);
        assert_eq!(t.last_ack(), u32::MAX - 1000);
        // 1001 bytes up to the wrap, then 1999 more
        assert_eq!(t.observe(1999), Some(3000));
        assert_eq!(t.last_ack(), 1999);
    }

    #[test]
    fn reordered_ack_is_rejected() {
        let mut t = AckTracker::new(0, 1462);
        t.observe(292_400);
        assert_eq!(t.observe(292_400 - 1462), None);
        assert_eq!(t.observe(0), None);
        assert_eq!(t.last_ack(), 292_400);
    }

    #[test]
    fn wrap_past_flight_is_rejected() {
        let mut t = AckTracker::new(u32::MAX - 999, 1462);
        assert_eq!(t.observe(14_620), None);
        assert_eq!(t.last_ack(), u32::MAX - 1000);
    }

    #[tokio::test(start_paused = true)]
    async fn debounce_within_rtt() {
        let mut d = DropDebounce::default();
        let rtt = Duration::from_millis(10);
        assert!(d.admit(Instant::now(), rtt));
        tokio::time::advance(Duration::from_millis(5)).await;
        assert!(!d.admit(Instant::now(), rtt));
        tokio::time::advance(Duration::from_millis(5)).await;
        assert!(d.admit(Instant::now(), rtt));
    }

    #[tokio::test(start_paused = true)]
    async fn zero_rtt_never_debounces() {
        let mut d = DropDebounce::default();
        assert!(d.admit(Instant::now(), Duration::ZERO));
        assert!(d.admit(Instant::now(), Duration::ZERO));
    }
}
