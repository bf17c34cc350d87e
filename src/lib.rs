//! Userspace congestion control plane.
//!
//! A datapath (kernel module, simulator, userspace transport) reports
//! measurements and drop events for each of its flows. This crate decodes
//! those reports, hands them to a per-flow congestion control algorithm and
//! ships the algorithm's decision back as a compiled [`pattern::Pattern`]:
//! a small loop of set-rate/set-window/wait/report instructions that the
//! datapath runs until it is replaced.
//!
//! ```text
//!  datapath ──frames──▶ Backend ──▶ wire::Message::decode ──▶ Supervisor
//!                                                               │ by flow id
//!                                                    flow actor (Box<dyn Flow>)
//!                                                               │ Pattern
//!  datapath ◀──frames── Backend ◀── wire::Message::encode ◀─────┘
//! ```

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

pub mod ack_tracker;
pub mod algorithms;
pub mod datapath;
pub mod pattern;
pub mod supervisor;
pub mod wire;

pub use datapath::PatternSender;

pub const DEFAULT_SS_THRESH: u32 = 0x7fff_ffff;

/// Packet size assumed for flows when the datapath does not say otherwise.
pub const DEFAULT_PACKET_SIZE: u32 = 1460;

/// Initial congestion window, in packets.
pub const DEFAULT_INIT_CWND_PKTS: u32 = 10;

/// One report from the datapath for a single flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Measurement {
    /// Cumulative ack number (wrapping 32-bit sequence space)
    pub ack: u32,
    /// Latest RTT estimate
    pub rtt: Duration,
    /// Ingress rate in bytes/sec
    pub rate_in: u64,
    /// Egress rate in bytes/sec
    pub rate_out: u64,
}

/// Loss signal classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DropEvent {
    /// Three duplicate acks: isolated loss
    DupAck,
    /// Retransmission timeout: complete loss of the flight
    Timeout,
}

impl DropEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            DropEvent::DupAck => "dupack",
            DropEvent::Timeout => "timeout",
        }
    }
}

impl fmt::Display for DropEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a drop event string is neither `dupack` nor `timeout`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown drop event {0:?}")]
pub struct UnknownDropEvent(pub String);

impl FromStr for DropEvent {
    type Err = UnknownDropEvent;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "dupack" => Ok(DropEvent::DupAck),
            "timeout" => Ok(DropEvent::Timeout),
            other => Err(UnknownDropEvent(other.to_string())),
        }
    }
}

/// Per-flow congestion control algorithm.
///
/// An instance is owned by exactly one flow actor and is never shared, so
/// implementations keep plain (non-atomic) state. Every callback may send at
/// most one compiled pattern through the [`PatternSender`] handed over in
/// [`Flow::create`].
pub trait Flow: Send {
    /// Name the algorithm is registered under
    fn name(&self) -> &'static str;

    /// Initialize state for a new flow and install the first pattern.
    ///
    /// `init_cwnd` is in packets.
    fn create(
        &mut self,
        flow_id: u32,
        sender: PatternSender,
        packet_size: u32,
        start_seq: u32,
        init_cwnd: u32,
    );

    /// Handle a measurement report
    fn on_measurement(&mut self, m: Measurement);

    /// Handle a loss signal
    fn on_drop(&mut self, event: DropEvent);
}
