//! CUBIC congestion control algorithm implementation
//!
//! The window is kept in packets and only converted to bytes when a pattern
//! is built.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info};

use super::install_pattern;
use crate::ack_tracker::{AckTracker, DropDebounce};
use crate::pattern::Pattern;
use crate::{DropEvent, Flow, Measurement, PatternSender};

const BETA: f64 = 0.2;
const C: f64 = 0.4;
const INIT_SS_THRESH_PKTS: f64 = 100.0;
const MIN_CWND_PKTS: f64 = 10.0;

/// Reports are requested on a fixed clock rather than per RTT.
const REPORT_INTERVAL: Duration = Duration::from_millis(10);

struct Cubic {
    flow_id: u32,
    sender: Option<PatternSender>,
    pkt_size: u32,

    acks: AckTracker,
    drops: DropDebounce,
    rtt: Duration,

    // packets
    init_cwnd: f64,
    cwnd: f64,
    ssthresh: f64,

    cwnd_cnt: f64,
    tcp_friendliness: bool,
    beta: f64,
    fast_convergence: bool,
    c: f64,
    wlast_max: f64,
    epoch_start: Option<Instant>,
    origin_point: f64,
    d_min: Option<Duration>,
    wtcp: f64,
    k: f64,
    ack_cnt: f64,
    cnt: f64,
}

pub fn new_flow() -> Box<dyn Flow> {
    Box::new(Cubic {
        flow_id: 0,
        sender: None,
        pkt_size: crate::DEFAULT_PACKET_SIZE,
        acks: AckTracker::new(0, crate::DEFAULT_PACKET_SIZE),
        drops: DropDebounce::default(),
        rtt: Duration::ZERO,
        init_cwnd: MIN_CWND_PKTS,
        cwnd: MIN_CWND_PKTS,
        ssthresh: INIT_SS_THRESH_PKTS,
        cwnd_cnt: 0.0,
        tcp_friendliness: true,
        beta: BETA,
        fast_convergence: true,
        c: C,
        wlast_max: 0.0,
        epoch_start: None,
        origin_point: 0.0,
        d_min: None,
        wtcp: 0.0,
        k: 0.0,
        ack_cnt: 0.0,
        cnt: 0.0,
    })
}

impl Cubic {
    fn curr_cwnd(&self) -> u32 {
        (self.cwnd * f64::from(self.pkt_size)) as u32
    }

    fn cubic_update(&mut self) {
        let now = Instant::now();
        self.ack_cnt += 1.0;
        let epoch_start = match self.epoch_start {
            Some(start) => start,
            None => {
                if self.cwnd < self.wlast_max {
                    let temp = (self.wlast_max - self.cwnd) / self.c;
                    self.k = temp.max(0.0).cbrt();
                    self.origin_point = self.wlast_max;
                } else {
                    self.k = 0.0;
                    self.origin_point = self.cwnd;
                }

                self.ack_cnt = 1.0;
                self.wtcp = self.cwnd;
                self.epoch_start = Some(now);
                now
            }
        };

        let d_min = self.d_min.unwrap_or(Duration::ZERO);
        let t = (now + d_min)
            .saturating_duration_since(epoch_start)
            .as_secs_f64();
        let target = self.origin_point + self.c * ((t - self.k) * (t - self.k) * (t - self.k));
        if target > self.cwnd {
            self.cnt = self.cwnd / (target - self.cwnd);
        } else {
            self.cnt = 100.0 * self.cwnd;
        }

        if self.tcp_friendliness {
            self.cubic_tcp_friendliness();
        }
    }

    fn cubic_tcp_friendliness(&mut self) {
        self.wtcp += ((3.0 * self.beta) / (2.0 - self.beta)) * (self.ack_cnt / self.cwnd);
        self.ack_cnt = 0.0;
        if self.wtcp > self.cwnd {
            let max_cnt = self.cwnd / (self.wtcp - self.cwnd);
            if self.cnt > max_cnt {
                self.cnt = max_cnt;
            }
        }
    }

    fn cubic_reset(&mut self) {
        self.wlast_max = 0.0;
        self.epoch_start = None;
        self.origin_point = 0.0;
        self.d_min = None;
        self.wtcp = 0.0;
        self.k = 0.0;
        self.ack_cnt = 0.0;
    }

    fn new_pattern(&self) {
        install_pattern(
            self.sender.as_ref(),
            Pattern::builder()
                .set_window(self.curr_cwnd())
                .wait(REPORT_INTERVAL)
                .report()
                .compile(),
        );
    }
}

impl Flow for Cubic {
    fn name(&self) -> &'static str {
        "cubic"
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
        self.acks = AckTracker::new(start_seq, packet_size);
        self.drops = DropDebounce::default();
        self.rtt = Duration::ZERO;
        self.init_cwnd = MIN_CWND_PKTS;
        self.cwnd = f64::from(init_cwnd);
        self.ssthresh = INIT_SS_THRESH_PKTS;
        self.cwnd_cnt = 0.0;
        self.cnt = 0.0;
        self.cubic_reset();

        info!(flow_id, cwnd = self.curr_cwnd(), "[cubic] created flow");
        self.new_pattern();
    }

    fn on_measurement(&mut self, m: Measurement) {
        let Some(acked) = self.acks.observe(m.ack) else {
            debug!(flow_id = self.flow_id, ack = m.ack, "[cubic] ignoring stale ack");
            return;
        };
        self.rtt = m.rtt;

        let no_of_acks = acked / self.pkt_size.max(1);
        for _ in 0..no_of_acks {
            match self.d_min {
                Some(d_min) if m.rtt >= d_min => {}
                _ => self.d_min = Some(m.rtt),
            }

            if self.cwnd <= self.ssthresh {
                self.cwnd += 1.0;
            } else {
                self.cubic_update();
                if self.cwnd_cnt > self.cnt {
                    self.cwnd += 1.0;
                    self.cwnd_cnt = 0.0;
                } else {
                    self.cwnd_cnt += 1.0;
                }
            }
        }

        debug!(
            flow_id = self.flow_id,
            ack = m.ack,
            acked,
            cwnd = self.curr_cwnd(),
            "[cubic] got ack"
        );
        self.new_pattern();
    }

    fn on_drop(&mut self, event: DropEvent) {
        if !self.drops.admit(Instant::now(), self.rtt) {
            debug!(flow_id = self.flow_id, %event, "[cubic] drop within one rtt, ignoring");
            return;
        }

        match event {
            DropEvent::DupAck => {
                self.epoch_start = None;
                if self.cwnd < self.wlast_max && self.fast_convergence {
                    self.wlast_max = self.cwnd * ((2.0 - self.beta) / 2.0);
                } else {
                    self.wlast_max = self.cwnd;
                }

                self.cwnd *= 1.0 - self.beta;
                self.ssthresh = self.cwnd;
            }
            DropEvent::Timeout => {
                self.cwnd = self.init_cwnd;
                self.cubic_reset();
            }
        }

        info!(
            flow_id = self.flow_id,
            %event,
            cwnd = self.curr_cwnd(),
            "[cubic] drop"
        );
        self.new_pattern();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithms::testing::{assert_no_pattern, next_pattern, sender};
    use crate::pattern::PatternEvent;
    use crate::wire::Message;
    use tokio::sync::mpsc;

    const PKT: u32 = 1460;

    fn ack(ack: u32) -> Measurement {
        Measurement {
            ack,
            rtt: Duration::from_millis(1),
            rate_in: 0,
            rate_out: 0,
        }
    }

    fn created() -> (Box<dyn Flow>, mpsc::Receiver<Message>) {
        let (tx, mut rx) = sender(5);
        let mut flow = new_flow();
        flow.create(5, tx, PKT, 0, 10);
        let p = next_pattern(&mut rx);
        assert_eq!(
            p.events(),
            &[
                PatternEvent::SetCwndAbs(14_600),
                PatternEvent::WaitAbs(Duration::from_millis(10)),
                PatternEvent::Report
            ]
        );
        (flow, rx)
    }

    #[tokio::test(start_paused = true)]
    async fn slow_start_adds_one_packet_per_ack() {
        let (mut flow, mut rx) = created();
        flow.on_measurement(ack(5 * PKT));
        assert_eq!(next_pattern(&mut rx).cwnd(), Some(15 * PKT));

        // partial packet: no growth, but the pattern is refreshed
        flow.on_measurement(ack(5 * PKT + 100));
        assert_eq!(next_pattern(&mut rx).cwnd(), Some(15 * PKT));
    }

    #[tokio::test(start_paused = true)]
    async fn dupack_shrinks_by_beta() {
        let (mut flow, mut rx) = created();
        flow.on_measurement(ack(5 * PKT));
        next_pattern(&mut rx);

        flow.on_drop(DropEvent::DupAck);
        assert_eq!(next_pattern(&mut rx).cwnd(), Some(12 * PKT));

        // within one rtt of the last drop
        flow.on_drop(DropEvent::DupAck);
        assert_no_pattern(&mut rx);
    }

    #[tokio::test(start_paused = true)]
    async fn dupack_shrinks_small_window() {
        let (mut flow, mut rx) = created();
        flow.on_drop(DropEvent::DupAck);
        assert_eq!(next_pattern(&mut rx).cwnd(), Some(8 * PKT));

        // the reduced window is the new threshold: slow start is over
        flow.on_measurement(ack(PKT));
        assert_eq!(next_pattern(&mut rx).cwnd(), Some(9 * PKT));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_resets_window() {
        let (mut flow, mut rx) = created();
        flow.on_measurement(ack(40 * PKT));
        assert_eq!(next_pattern(&mut rx).cwnd(), Some(50 * PKT));

        flow.on_drop(DropEvent::Timeout);
        assert_eq!(next_pattern(&mut rx).cwnd(), Some(10 * PKT));
    }

    #[tokio::test(start_paused = true)]
    async fn avoidance_grows_along_cubic_curve() {
        let (mut flow, mut rx) = created();
        flow.on_measurement(ack(5 * PKT));
        flow.on_drop(DropEvent::DupAck);
        // cwnd 12 == ssthresh, so one more slow start step
        flow.on_measurement(ack(6 * PKT));
        while rx.try_recv().is_ok() {}

        // just after the loss the curve is flat below the old maximum
        let mut acked = 6 * PKT;
        for _ in 0..10 {
            acked += PKT;
            flow.on_measurement(ack(acked));
        }
        let mut last = None;
        while let Ok(Message::Pattern { pattern, .. }) = rx.try_recv() {
            last = pattern.cwnd();
        }
        assert_eq!(last, Some(13 * PKT));

        // past K the curve climbs above the old maximum
        tokio::time::advance(Duration::from_secs(2)).await;
        for _ in 0..20 {
            acked += PKT;
            flow.on_measurement(ack(acked));
        }
        let mut last = None;
        while let Ok(Message::Pattern { pattern, .. }) = rx.try_recv() {
            last = pattern.cwnd();
        }
        let cwnd = last.unwrap();
        assert!(cwnd > 13 * PKT, "cwnd {cwnd}");
        assert!(cwnd < 33 * PKT, "cwnd {cwnd}");
    }

    #[tokio::test(start_paused = true)]
    async fn stale_ack_is_ignored() {
        let (mut flow, mut rx) = created();
        flow.on_measurement(ack(5 * PKT));
        next_pattern(&mut rx);

        flow.on_measurement(ack(4 * PKT));
        assert_no_pattern(&mut rx);
    }
}
