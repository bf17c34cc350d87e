//! Compound TCP: a loss-based window plus a delay-based window
//!
//! The sending window is `cwnd + dwnd`. `cwnd` follows Reno avoidance;
//! `dwnd` grows while the estimated queue is below `gamma` packets and
//! drains once it is above. `gamma` is retuned from the queue estimate seen
//! at each isolated loss.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info};

use super::install_pattern;
use crate::ack_tracker::{AckTracker, DropDebounce};
use crate::pattern::Pattern;
use crate::{DropEvent, Flow, Measurement, PatternSender};

const ALPHA: f64 = 0.125;
const BETA: f64 = 0.5;
const K: f64 = 0.8;
const ETA: f64 = 1.0;
const GAMMA_LOW: f64 = 5.0;
const GAMMA_HIGH: f64 = 30.0;
/// Weight of the previous gamma when retuning
const LAMBDA: f64 = 0.8;
const MIN_CWND_PKTS: f64 = 10.0;

const REPORT_INTERVAL: Duration = Duration::from_millis(10);

struct Compound {
    flow_id: u32,
    sender: Option<PatternSender>,
    pkt_size: f64,

    // bytes
    init_cwnd: f64,
    wnd: f64,
    cwnd: f64,
    dwnd: f64,

    acks: AckTracker,
    drops: DropDebounce,
    rtt: Duration,
    base_rtt: Option<Duration>,

    /// Queue target, packets
    gamma: f64,
    /// Queue estimate (bytes) from the last ack, consumed by the next dupack
    diff_reno: Option<f64>,
}

impl Compound {
    fn new() -> Self {
        let pkt_size = f64::from(crate::DEFAULT_PACKET_SIZE);
        Self {
            flow_id: 0,
            sender: None,
            pkt_size,
            init_cwnd: pkt_size * MIN_CWND_PKTS,
            wnd: 0.0,
            cwnd: 0.0,
            dwnd: 0.0,
            acks: AckTracker::new(0, crate::DEFAULT_PACKET_SIZE),
            drops: DropDebounce::default(),
            rtt: Duration::ZERO,
            base_rtt: None,
            gamma: GAMMA_HIGH,
            diff_reno: None,
        }
    }

    fn curr_wnd(&self) -> u32 {
        self.wnd as u32
    }

    fn new_pattern(&self) {
        install_pattern(
            self.sender.as_ref(),
            Pattern::builder()
                .set_window(self.curr_wnd())
                .wait(REPORT_INTERVAL)
                .report()
                .compile(),
        );
    }

    /// Bytes this flow keeps queued, from the gap between expected and
    /// actual throughput.
    fn queued(&self, rtt: Duration) -> f64 {
        let Some(base) = self.base_rtt else {
            return 0.0;
        };
        if rtt.is_zero() || base.is_zero() {
            return 0.0;
        }

        let base = base.as_secs_f64();
        let expected = self.wnd / base;
        let actual = self.wnd / rtt.as_secs_f64();
        (expected - actual) * base
    }

    fn retune_gamma(&mut self) {
        let Some(diff) = self.diff_reno.take() else {
            return;
        };
        if diff < 0.0 {
            return;
        }

        let sample = 0.75 * (diff / self.pkt_size);
        self.gamma = (LAMBDA * self.gamma + (1.0 - LAMBDA) * sample).clamp(GAMMA_LOW, GAMMA_HIGH);
    }
}

pub fn new_flow() -> Box<dyn Flow> {
    Box::new(Compound::new())
}

impl Flow for Compound {
    fn name(&self) -> &'static str {
        "compound"
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
        self.init_cwnd = self.pkt_size * MIN_CWND_PKTS;
        self.cwnd = self.pkt_size * f64::from(init_cwnd);
        self.wnd = self.cwnd;
        self.dwnd = 0.0;
        self.acks = AckTracker::new(start_seq, packet_size);
        self.drops = DropDebounce::default();
        self.rtt = Duration::ZERO;
        self.base_rtt = None;
        self.gamma = GAMMA_HIGH;
        self.diff_reno = None;

        info!(flow_id, wnd = self.curr_wnd(), "[compound] created flow");
        self.new_pattern();
    }

    fn on_measurement(&mut self, m: Measurement) {
        let Some(acked) = self.acks.observe(m.ack) else {
            debug!(flow_id = self.flow_id, ack = m.ack, "[compound] ignoring stale ack");
            return;
        };
        self.rtt = m.rtt;
        if self.base_rtt.map_or(true, |base| m.rtt < base) {
            self.base_rtt = Some(m.rtt);
        }

        let share = f64::from(acked) / self.wnd;
        self.cwnd += self.pkt_size * share;

        let diff = self.queued(m.rtt);
        self.diff_reno = Some(diff);
        let increment = if diff < self.gamma * self.pkt_size {
            (self.pkt_size * (ALPHA * (self.wnd / self.pkt_size).powf(K) - 1.0)).max(0.0)
        } else {
            -ETA * diff
        };
        self.dwnd = (self.dwnd + increment * share).max(0.0);
        self.wnd = self.cwnd + self.dwnd;

        debug!(
            flow_id = self.flow_id,
            ack = m.ack,
            acked,
            cwnd = self.cwnd,
            dwnd = self.dwnd,
            wnd = self.curr_wnd(),
            "[compound] got ack"
        );
        self.new_pattern();
    }

    fn on_drop(&mut self, event: DropEvent) {
        if !self.drops.admit(Instant::now(), self.rtt) {
            debug!(flow_id = self.flow_id, %event, "[compound] drop within one rtt, ignoring");
            return;
        }

        let old_wnd = self.curr_wnd();
        match event {
            DropEvent::DupAck => {
                self.cwnd = (self.cwnd / 2.0).max(self.init_cwnd);
                self.dwnd = (self.wnd * (1.0 - BETA) - self.cwnd).max(0.0);
                self.wnd = self.cwnd + self.dwnd;
                self.retune_gamma();
            }
            DropEvent::Timeout => {
                self.cwnd = self.init_cwnd;
                self.dwnd = 0.0;
                self.wnd = self.init_cwnd;
                self.gamma = GAMMA_HIGH;
            }
        }

        info!(
            flow_id = self.flow_id,
            %event,
            old_wnd,
            wnd = self.curr_wnd(),
            gamma = self.gamma,
            "[compound] drop"
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

    fn measurement(ack: u32, rtt_ms: u64) -> Measurement {
        Measurement {
            ack,
            rtt: Duration::from_millis(rtt_ms),
            rate_in: 0,
            rate_out: 0,
        }
    }

    fn created(init_cwnd: u32) -> (Compound, mpsc::Receiver<Message>) {
        let (tx, mut rx) = sender(6);
        let mut flow = Compound::new();
        flow.create(6, tx, PKT, 0, init_cwnd);
        let p = next_pattern(&mut rx);
        assert_eq!(
            p.events(),
            &[
                PatternEvent::SetCwndAbs(init_cwnd * PKT),
                PatternEvent::WaitAbs(Duration::from_millis(10)),
                PatternEvent::Report
            ]
        );
        (flow, rx)
    }

    #[tokio::test(start_paused = true)]
    async fn small_window_grows_like_reno() {
        let (mut flow, mut rx) = created(10);
        // alpha * 10^k < 1, so the delay window stays empty
        flow.on_measurement(measurement(10 * PKT, 10));
        assert_eq!(next_pattern(&mut rx).cwnd(), Some(11 * PKT));
        assert_eq!(flow.dwnd, 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn delay_window_adds_on_top() {
        let (mut flow, mut rx) = created(20);
        flow.on_measurement(measurement(20 * PKT, 10));
        assert_eq!(flow.cwnd, 30_660.0);
        assert!((flow.dwnd - 544.873).abs() < 0.01, "dwnd {}", flow.dwnd);
        assert_eq!(next_pattern(&mut rx).cwnd(), Some(31_204));

        flow.on_drop(DropEvent::DupAck);
        assert_eq!(flow.cwnd, 15_330.0);
        assert_eq!(next_pattern(&mut rx).cwnd(), Some(15_602));
        // no queueing was seen: gamma moves toward zero and stays in range
        assert_eq!(flow.gamma, 24.0);
    }

    #[tokio::test(start_paused = true)]
    async fn queueing_drains_delay_window() {
        let (mut flow, mut rx) = created(100);
        flow.on_measurement(measurement(PKT, 10));
        assert!(flow.dwnd > 0.0);
        next_pattern(&mut rx);

        // rtt doubled: half the window is queued, far above gamma
        flow.on_measurement(measurement(2 * PKT, 20));
        assert_eq!(flow.dwnd, 0.0);
        assert_eq!(next_pattern(&mut rx).cwnd(), Some(146_029));
    }

    #[tokio::test(start_paused = true)]
    async fn gamma_is_retuned_once_per_sample() {
        let (mut flow, mut rx) = created(20);
        flow.on_measurement(measurement(20 * PKT, 10));
        flow.on_measurement(measurement(21 * PKT, 20));
        while rx.try_recv().is_ok() {}

        flow.on_drop(DropEvent::DupAck);
        assert!((flow.gamma - 25.603).abs() < 0.001, "gamma {}", flow.gamma);

        tokio::time::advance(Duration::from_millis(20)).await;
        flow.on_drop(DropEvent::DupAck);
        assert!((flow.gamma - 25.603).abs() < 0.001, "gamma {}", flow.gamma);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_resets_everything() {
        let (mut flow, mut rx) = created(20);
        flow.on_measurement(measurement(20 * PKT, 10));
        flow.on_drop(DropEvent::DupAck);
        tokio::time::advance(Duration::from_millis(10)).await;
        while rx.try_recv().is_ok() {}

        flow.on_drop(DropEvent::Timeout);
        assert_eq!(next_pattern(&mut rx).cwnd(), Some(10 * PKT));
        assert_eq!(flow.dwnd, 0.0);
        assert_eq!(flow.gamma, GAMMA_HIGH);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_ack_is_ignored() {
        let (mut flow, mut rx) = created(10);
        flow.on_measurement(measurement(10 * PKT, 10));
        next_pattern(&mut rx);

        flow.on_measurement(measurement(5 * PKT, 10));
        assert_no_pattern(&mut rx);
    }
}
