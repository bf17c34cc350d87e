//! Control patterns: the instruction loops installed on the datapath.
//!
//! A [`Pattern`] is built with [`PatternBuilder`] and is immutable once
//! compiled. The datapath executes the events in order and loops back to
//! the first one until a newer pattern for the same flow arrives; a new
//! pattern cancels whatever wait is in progress.
//!
//! ```
//! use std::time::Duration;
//! use ccp_agent::pattern::Pattern;
//!
//! let p = Pattern::builder()
//!     .set_window(14_600)
//!     .wait(Duration::from_millis(10))
//!     .report()
//!     .compile()
//!     .unwrap();
//! assert_eq!(p.len(), 3);
//! ```

use std::time::Duration;

use thiserror::Error;

/// Hold time appended after a lone event so a one-shot setting is not
/// immediately re-applied by the datapath looping the program.
pub const ONE_SHOT_HOLD: Duration = Duration::from_secs(1);

/// A single datapath instruction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PatternEvent {
    /// Set the sending rate, bytes/sec
    SetRateAbs(f32),
    /// Set the congestion window, bytes
    SetCwndAbs(u32),
    /// Scale the current sending rate
    SetRateRel(f32),
    /// Sleep for a fixed duration
    WaitAbs(Duration),
    /// Sleep for a multiple of the datapath's current RTT estimate
    WaitRel(f32),
    /// Send a measurement upstream now
    Report,
}

impl PatternEvent {
    /// Wire tag of this event.
    pub fn kind(&self) -> u8 {
        match self {
            PatternEvent::SetRateAbs(_) => 0,
            PatternEvent::SetCwndAbs(_) => 1,
            PatternEvent::SetRateRel(_) => 2,
            PatternEvent::WaitAbs(_) => 3,
            PatternEvent::WaitRel(_) => 4,
            PatternEvent::Report => 5,
        }
    }

    pub fn is_wait(&self) -> bool {
        matches!(self, PatternEvent::WaitAbs(_) | PatternEvent::WaitRel(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PatternError {
    #[error("wait cannot start a pattern")]
    LeadingWait,
    #[error("pattern has no events")]
    Empty,
    #[error("invalid {what} value {value}")]
    InvalidValue { what: &'static str, value: String },
}

/// A compiled, non-empty event sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct Pattern {
    events: Vec<PatternEvent>,
}

impl Pattern {
    pub fn builder() -> PatternBuilder {
        PatternBuilder::default()
    }

    pub fn events(&self) -> &[PatternEvent] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Always false for a compiled pattern.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// First window setting in the pattern, if any.
    pub fn cwnd(&self) -> Option<u32> {
        self.events.iter().find_map(|ev| match ev {
            PatternEvent::SetCwndAbs(cwnd) => Some(*cwnd),
            _ => None,
        })
    }

    /// First absolute rate setting in the pattern, if any.
    pub fn rate(&self) -> Option<f32> {
        self.events.iter().find_map(|ev| match ev {
            PatternEvent::SetRateAbs(rate) => Some(*rate),
            _ => None,
        })
    }
}

/// Chaining builder for [`Pattern`].
///
/// The first misuse latches an error; later calls become no-ops and
/// [`PatternBuilder::compile`] returns the latched error.
#[derive(Debug, Default)]
pub struct PatternBuilder {
    events: Vec<PatternEvent>,
    err: Option<PatternError>,
}

impl PatternBuilder {
    pub fn set_rate(self, rate: f32) -> Self {
        self.push_checked("rate", rate, PatternEvent::SetRateAbs(rate))
    }

    pub fn set_window(self, cwnd: u32) -> Self {
        self.push(PatternEvent::SetCwndAbs(cwnd))
    }

    pub fn set_relative_rate(self, factor: f32) -> Self {
        self.push_checked("rate factor", factor, PatternEvent::SetRateRel(factor))
    }

    pub fn wait(self, wait: Duration) -> Self {
        self.push(PatternEvent::WaitAbs(wait))
    }

    pub fn wait_rtts(self, factor: f32) -> Self {
        self.push_checked("rtt factor", factor, PatternEvent::WaitRel(factor))
    }

    pub fn report(self) -> Self {
        self.push(PatternEvent::Report)
    }

    /// Append an already-constructed event, applying the same checks as the
    /// typed methods.
    pub fn event(self, ev: PatternEvent) -> Self {
        match ev {
            PatternEvent::SetRateAbs(rate) => self.set_rate(rate),
            PatternEvent::SetCwndAbs(cwnd) => self.set_window(cwnd),
            PatternEvent::SetRateRel(factor) => self.set_relative_rate(factor),
            PatternEvent::WaitAbs(wait) => self.wait(wait),
            PatternEvent::WaitRel(factor) => self.wait_rtts(factor),
            PatternEvent::Report => self.report(),
        }
    }

    pub fn compile(mut self) -> Result<Pattern, PatternError> {
        if let Some(err) = self.err {
            return Err(err);
        }

        match self.events.len() {
            0 => Err(PatternError::Empty),
            1 => {
                self.events.push(PatternEvent::WaitAbs(ONE_SHOT_HOLD));
                Ok(Pattern {
                    events: self.events,
                })
            }
            _ => Ok(Pattern {
                events: self.events,
            }),
        }
    }

    fn push_checked(mut self, what: &'static str, value: f32, ev: PatternEvent) -> Self {
        if self.err.is_none() && !(value.is_finite() && value >= 0.0) {
            self.err = Some(PatternError::InvalidValue {
                what,
                value: value.to_string(),
            });
        }
        self.push(ev)
    }

    fn push(mut self, ev: PatternEvent) -> Self {
        if self.err.is_some() {
            return self;
        }

        if ev.is_wait() && self.events.is_empty() {
            self.err = Some(PatternError::LeadingWait);
            return self;
        }

        self.events.push(ev);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leading_wait_is_rejected() {
        let err = Pattern::builder()
            .wait(Duration::from_millis(5))
            .compile()
            .unwrap_err();
        assert_eq!(err, PatternError::LeadingWait);

        let err = Pattern::builder().wait_rtts(1.0).compile().unwrap_err();
        assert_eq!(err, PatternError::LeadingWait);
    }

    #[test]
    fn error_latches_over_later_calls() {
        let err = Pattern::builder()
            .wait(Duration::from_millis(5))
            .set_window(1000)
            .report()
            .compile()
            .unwrap_err();
        assert_eq!(err, PatternError::LeadingWait);
    }

    #[test]
    fn single_event_gets_trailing_hold() {
        let p = Pattern::builder().set_window(1000).compile().unwrap();
        assert_eq!(
            p.events(),
            &[
                PatternEvent::SetCwndAbs(1000),
                PatternEvent::WaitAbs(ONE_SHOT_HOLD)
            ]
        );
    }

    #[test]
    fn multi_event_pattern_is_kept_as_built() {
        let p = Pattern::builder()
            .set_window(1000)
            .wait(Duration::from_millis(10))
            .report()
            .compile()
            .unwrap();
        assert_eq!(p.len(), 3);
        assert_eq!(p.cwnd(), Some(1000));
        assert_eq!(p.events()[2], PatternEvent::Report);

        let p = Pattern::builder()
            .set_window(42)
            .wait_rtts(1.0)
            .compile()
            .unwrap();
        assert_eq!(p.len(), 2);
    }

    #[test]
    fn empty_builder_does_not_compile() {
        assert_eq!(
            Pattern::builder().compile().unwrap_err(),
            PatternError::Empty
        );
    }

    #[test]
    fn invalid_factor_latches() {
        let err = Pattern::builder()
            .set_rate(1000.0)
            .wait_rtts(f32::NAN)
            .report()
            .compile()
            .unwrap_err();
        assert!(matches!(
            err,
            PatternError::InvalidValue {
                what: "rtt factor",
                ..
            }
        ));

        let err = Pattern::builder()
            .set_relative_rate(-0.5)
            .compile()
            .unwrap_err();
        assert!(matches!(err, PatternError::InvalidValue { .. }));
    }

    #[test]
    fn rate_accessor_finds_first_rate() {
        let p = Pattern::builder()
            .set_rate(125.0)
            .wait(Duration::from_millis(20))
            .set_rate(75.0)
            .compile()
            .unwrap();
        assert_eq!(p.rate(), Some(125.0));
        assert_eq!(p.cwnd(), None);
    }
}
