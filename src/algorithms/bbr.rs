//! Rate-based prober (BBR-style)
//!
//! Tracks the highest egress rate the datapath has reported and installs a
//! pacing loop around it: one pulse above, one drain below, then six cruise
//! steps at the estimate. The loop is rebuilt at most once per
//! `REFRESH_INTERVAL`, or immediately on loss.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info};

use super::install_pattern;
use crate::ack_tracker::{AckTracker, DropDebounce};
use crate::pattern::Pattern;
use crate::{DropEvent, Flow, Measurement, PatternSender};

const REFRESH_INTERVAL: Duration = Duration::from_millis(160);

/// Gain schedule for one probing cycle.
const PULSES: [f64; 8] = [1.25, 0.75, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0];

/// Headroom under the estimated bottleneck rate.
const TARGET_GAIN: f64 = 0.95;

/// Starting rate, and the rate after a timeout, in packets per second.
const INIT_RATE_PKTS: f64 = 100.0;

struct Bbr {
    flow_id: u32,
    sender: Option<PatternSender>,
    pkt_size: u32,

    acks: AckTracker,
    drops: DropDebounce,
    rtt: Duration,

    /// bytes/sec
    rate: f64,
    last_update: Instant,
}

pub fn new_flow() -> Box<dyn Flow> {
    Box::new(Bbr {
        flow_id: 0,
        sender: None,
        pkt_size: crate::DEFAULT_PACKET_SIZE,
        acks: AckTracker::new(0, crate::DEFAULT_PACKET_SIZE),
        drops: DropDebounce::default(),
        rtt: Duration::ZERO,
        rate: 0.0,
        last_update: Instant::now(),
    })
}

impl Bbr {
    fn init_rate(&self) -> f64 {
        f64::from(self.pkt_size) * INIT_RATE_PKTS
    }

    fn send_pattern(&mut self) {
        let base = TARGET_GAIN * self.rate;
        let step = REFRESH_INTERVAL / PULSES.len() as u32;
        let builder = PULSES.iter().fold(Pattern::builder(), |b, gain| {
            b.set_rate((gain * base) as f32).wait(step).report()
        });

        install_pattern(self.sender.as_ref(), builder.compile());
        self.last_update = Instant::now();
    }
}

impl Flow for Bbr {
    fn name(&self) -> &'static str {
        "bbr"
    }

    fn create(
        &mut self,
        flow_id: u32,
        sender: PatternSender,
        packet_size: u32,
        start_seq: u32,
        _init_cwnd: u32,
    ) {
        self.flow_id = flow_id;
        self.sender = Some(sender);
        self.pkt_size = packet_size;
        self.acks = AckTracker::new(start_seq, packet_size);
        self.drops = DropDebounce::default();
        self.rtt = Duration::ZERO;
        self.rate = self.init_rate();

        info!(flow_id, rate = self.rate, "[bbr] created flow");
        self.send_pattern();
    }

    fn on_measurement(&mut self, m: Measurement) {
        let Some(acked) = self.acks.observe(m.ack) else {
            debug!(flow_id = self.flow_id, ack = m.ack, "[bbr] ignoring stale ack");
            return;
        };
        self.rtt = m.rtt;

        let rate_out = m.rate_out as f64;
        if rate_out > self.rate {
            self.rate = rate_out;
        }

        debug!(
            flow_id = self.flow_id,
            ack = m.ack,
            acked,
            rate = self.rate,
            "[bbr] got ack"
        );

        if self.last_update.elapsed() >= REFRESH_INTERVAL {
            self.send_pattern();
        }
    }

    fn on_drop(&mut self, event: DropEvent) {
        if !self.drops.admit(Instant::now(), self.rtt) {
            debug!(flow_id = self.flow_id, %event, "[bbr] drop within one rtt, ignoring");
            return;
        }

        let old_rate = self.rate;
        match event {
            DropEvent::DupAck => self.rate /= 2.0,
            DropEvent::Timeout => self.rate = self.init_rate(),
        }

        info!(
            flow_id = self.flow_id,
            %event,
            old_rate,
            rate = self.rate,
            "[bbr] drop"
        );
        self.send_pattern();
    }
}
