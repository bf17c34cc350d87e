//! AIMD window control (Reno)

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info};

use super::install_pattern;
use crate::ack_tracker::{AckTracker, DropDebounce};
use crate::pattern::Pattern;
use crate::{DropEvent, Flow, Measurement, PatternSender, DEFAULT_SS_THRESH};

/// Floor for the window after a loss, in packets.
const MIN_CWND_PKTS: u32 = 10;

/// Reports are requested every half RTT.
const REPORT_RTTS: f32 = 0.5;

pub struct Reno {
    flow_id: u32,
    sender: Option<PatternSender>,
    pkt_size: u32,

    // bytes
    init_cwnd: f64,
    cwnd: f64,
    ssthresh: f64,

    acks: AckTracker,
    drops: DropDebounce,
    rtt: Duration,
}

impl Default for Reno {
    fn default() -> Self {
        Self {
            flow_id: 0,
            sender: None,
            pkt_size: crate::DEFAULT_PACKET_SIZE,
            init_cwnd: 0.0,
            cwnd: 0.0,
            ssthresh: f64::from(DEFAULT_SS_THRESH),
            acks: AckTracker::new(0, crate::DEFAULT_PACKET_SIZE),
            drops: DropDebounce::default(),
            rtt: Duration::ZERO,
        }
    }
}

pub fn new_flow() -> Box<dyn Flow> {
    Box::new(Reno::default())
}

impl Reno {
    /// Current congestion window in bytes
    pub fn curr_cwnd(&self) -> u32 {
        self.cwnd as u32
    }

    pub fn ssthresh(&self) -> u32 {
        self.ssthresh as u32
    }

    pub fn last_ack(&self) -> u32 {
        self.acks.last_ack()
    }

    fn new_pattern(&self) {
        install_pattern(
            self.sender.as_ref(),
            Pattern::builder()
                .set_window(self.curr_cwnd())
                .wait_rtts(REPORT_RTTS)
                .report()
                .compile(),
        );
    }
}

impl Flow for Reno {
    fn name(&self) -> &'static str {
        "reno"
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
        self.pkt_size = packet_size;
        self.init_cwnd = f64::from(packet_size) * f64::from(MIN_CWND_PKTS);
        self.cwnd = f64::from(packet_size) * f64::from(init_cwnd);
        self.ssthresh = f64::from(DEFAULT_SS_THRESH);
        self.acks = AckTracker::new(start_seq, packet_size);
        self.drops = DropDebounce::default();
        self.rtt = Duration::ZERO;

        info!(flow_id, cwnd = self.curr_cwnd(), "[reno] created flow");
        self.new_pattern();
    }

    fn on_measurement(&mut self, m: Measurement) {
        let last_ack = self.acks.last_ack();
        let Some(acked) = self.acks.observe(m.ack) else {
            debug!(
                flow_id = self.flow_id,
                ack = m.ack,
                last_ack,
                "[reno] ignoring stale ack"
            );
            return;
        };
        self.rtt = m.rtt;

        let acked_pkts = acked / self.pkt_size.max(1);
        let acked = f64::from(acked);
        if self.cwnd < self.ssthresh {
            // slow start: one packet per whole packet acked
            let grown = f64::from(acked_pkts) * f64::from(self.pkt_size);
            self.cwnd = (self.cwnd + grown).min(self.ssthresh);
        } else {
            // congestion avoidance: one packet per window acked
            self.cwnd += f64::from(self.pkt_size) * (acked / self.cwnd);
        }

        debug!(
            flow_id = self.flow_id,
            ack = m.ack,
            acked,
            cwnd = self.curr_cwnd(),
            "[reno] got ack"
        );
        self.new_pattern();
    }

    fn on_drop(&mut self, event: DropEvent) {
        if !self.drops.admit(Instant::now(), self.rtt) {
            debug!(flow_id = self.flow_id, %event, "[reno] drop within one rtt, ignoring");
            return;
        }

        let old_cwnd = self.curr_cwnd();
        self.ssthresh = self.cwnd / 2.0;
        match event {
            DropEvent::DupAck => {
                self.cwnd = (self.cwnd / 2.0).max(self.init_cwnd);
            }
            DropEvent::Timeout => {
                self.cwnd = self.init_cwnd;
            }
        }

        info!(
            flow_id = self.flow_id,
            %event,
            old_cwnd,
            cwnd = self.curr_cwnd(),
            "[reno] drop"
        );
        self.new_pattern();
    }
}
