//! Delay-based window control (Vegas)
//!
//! Estimates how many of the flow's packets sit in bottleneck queues from
//! the gap between the current RTT and the lowest RTT seen, and steers the
//! window to keep that number between `ALPHA` and `BETA`.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info};

use super::install_pattern;
use crate::ack_tracker::{AckTracker, DropDebounce};
use crate::pattern::Pattern;
use crate::{DropEvent, Flow, Measurement, PatternSender};

/// Queued packets below which the window grows
const ALPHA: f64 = 2.0;
/// Queued packets above which the window shrinks
const BETA: f64 = 4.0;

struct Vegas {
    flow_id: u32,
    sender: Option<PatternSender>,
    pkt_size: f64,

    // bytes
    cwnd: f64,

    acks: AckTracker,
    drops: DropDebounce,
    rtt: Duration,
    base_rtt: Option<Duration>,
}

pub fn new_flow() -> Box<dyn Flow> {
    Box::new(Vegas {
        flow_id: 0,
        sender: None,
        pkt_size: f64::from(crate::DEFAULT_PACKET_SIZE),
        cwnd: 0.0,
        acks: AckTracker::new(0, crate::DEFAULT_PACKET_SIZE),
        drops: DropDebounce::default(),
        rtt: Duration::ZERO,
        base_rtt: None,
    })
}

impl Vegas {
    fn curr_cwnd(&self) -> u32 {
        self.cwnd as u32
    }

    /// Packets this flow has queued, given the latest RTT sample.
    fn in_queue(&self, rtt: Duration) -> f64 {
        let base = self.base_rtt.unwrap_or(rtt);
        if rtt.is_zero() {
            return 0.0;
        }
        let rtt = rtt.as_secs_f64();
        (self.cwnd * (rtt - base.as_secs_f64())) / (rtt * self.pkt_size)
    }

    // Never below one packet.
    fn shrink(&mut self) {
        self.cwnd = (self.cwnd - self.pkt_size).max(self.pkt_size);
    }

    fn new_pattern(&self) {
        install_pattern(
            self.sender.as_ref(),
            Pattern::builder()
                .set_window(self.curr_cwnd())
                .wait_rtts(0.5)
                .report()
                .compile(),
        );
    }
}

impl Flow for Vegas {
    fn name(&self) -> &'static str {
        "vegas"
    }

    fn create(
        &mut self,
        flow_id: u32,
        sender: PatternSender,
        packet_size: u32,
        start_seq: u32,
        init_cwnd: u32,
    ) {
        self.flow_id = flow_id;
        self.sender = Some(sender);
        self.pkt_size = f64::from(packet_size);
        self.cwnd = f64::from(packet_size) * f64::from(init_cwnd);
        self.acks = AckTracker::new(start_seq, packet_size);
        self.drops = DropDebounce::default();
        self.rtt = Duration::ZERO;
        self.base_rtt = None;

        info!(flow_id, cwnd = self.curr_cwnd(), "[vegas] created flow");
        self.new_pattern();
    }

    fn on_measurement(&mut self, m: Measurement) {
        let Some(acked) = self.acks.observe(m.ack) else {
            debug!(flow_id = self.flow_id, ack = m.ack, "[vegas] ignoring stale ack");
            return;
        };
        self.rtt = m.rtt;
        if self.base_rtt.map_or(true, |base| m.rtt < base) {
            self.base_rtt = Some(m.rtt);
        }

        let in_queue = self.in_queue(m.rtt);
        if in_queue <= ALPHA {
            self.cwnd += self.pkt_size;
        } else if in_queue >= BETA {
            self.shrink();
        }

        debug!(
            flow_id = self.flow_id,
            ack = m.ack,
            acked,
            in_queue,
            base_rtt = ?self.base_rtt,
            cwnd = self.curr_cwnd(),
            "[vegas] got ack"
        );
        self.new_pattern();
    }

    fn on_drop(&mut self, event: DropEvent) {
        if !self.drops.admit(Instant::now(), self.rtt) {
            debug!(flow_id = self.flow_id, %event, "[vegas] drop within one rtt, ignoring");
            return;
        }

        // both kinds of loss back off by a single packet
        self.shrink();

        info!(
            flow_id = self.flow_id,
            %event,
            cwnd = self.curr_cwnd(),
            "[vegas] drop"
        );
        self.new_pattern();
    }
}
