//! Wire format for messages exchanged with the datapath.
//!
//! No I/O happens here. All integers are little-endian and nothing is
//! padded.
//!
//! ```text
//! +----------+----------+----------------------+--------------------
//! | type: u8 | len: u8  | flow_id: u32         | payload ...
//! +----------+----------+----------------------+--------------------
//! ```
//!
//! `len` is the length of the whole frame, header included, so a receiver
//! can cut a byte stream into frames without delimiters (see [`FrameIter`]).
//!
//! | type | message     | payload                                        |
//! |------|-------------|------------------------------------------------|
//! | 0    | Create      | start_seq u32, algorithm name (trailing NUL ok) |
//! | 1    | Measurement | ack u32, rtt_ns u32, rate_in u64, rate_out u64 |
//! | 2    | Drop        | event name (`dupack` or `timeout`)             |
//! | 3    | Pattern     | event count u32, event stream                  |
//!
//! Pattern events are `[kind: u8][len: u8]` followed by a 4-byte value for
//! every kind except `Report` (len 2). Rates and factors travel as
//! `value * 100` rounded to an integer, absolute waits in microseconds.

use std::time::Duration;

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;

use crate::pattern::{Pattern, PatternError, PatternEvent};
use crate::{DropEvent, Measurement};

/// type + len + flow_id
pub const HEADER_LEN: usize = 6;

/// Measurement frames have a fixed size: header + 2 * u32 + 2 * u64.
pub const MEASURE_LEN: usize = 30;

/// The length field is a single byte.
pub const MAX_FRAME_LEN: usize = u8::MAX as usize;

const CREATE: u8 = 0;
const MEASURE: u8 = 1;
const DROP: u8 = 2;
const PATTERN: u8 = 3;

const EVENT_HEADER_LEN: u8 = 2;
const EVENT_VALUE_LEN: u8 = 6;
const FIXED_POINT_SCALE: f32 = 100.0;

/// A decoded frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Create {
        flow_id: u32,
        start_seq: u32,
        alg: String,
    },
    Measure {
        flow_id: u32,
        measurement: Measurement,
    },
    Drop {
        flow_id: u32,
        event: DropEvent,
    },
    Pattern {
        flow_id: u32,
        pattern: Pattern,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("buffer of {0} bytes is too short for a frame header")]
    Truncated(usize),
    #[error("unknown message type {0}")]
    UnknownType(u8),
    #[error("length field says {declared} bytes but frame has {actual}")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("message type {typ} cannot be {len} bytes long")]
    BadLength { typ: u8, len: usize },
    #[error("string field is not valid utf-8")]
    InvalidString,
    #[error("unknown drop event {0:?}")]
    UnknownDropEvent(String),
    #[error("pattern event {index} is malformed (kind {kind}, len {len})")]
    BadEvent { index: u32, kind: u8, len: u8 },
    #[error("pattern event stream ended after {0} events")]
    EventsTruncated(u32),
    #[error("{0} trailing bytes after pattern events")]
    TrailingBytes(usize),
    #[error("invalid pattern: {0}")]
    Pattern(#[from] PatternError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodeError {
    #[error("frame of {0} bytes exceeds the 255 byte limit")]
    TooLong(usize),
    #[error("string field must not be empty")]
    EmptyString,
}

impl Message {
    pub fn flow_id(&self) -> u32 {
        match self {
            Message::Create { flow_id, .. }
            | Message::Measure { flow_id, .. }
            | Message::Drop { flow_id, .. }
            | Message::Pattern { flow_id, .. } => *flow_id,
        }
    }

    fn type_tag(&self) -> u8 {
        match self {
            Message::Create { .. } => CREATE,
            Message::Measure { .. } => MEASURE,
            Message::Drop { .. } => DROP,
            Message::Pattern { .. } => PATTERN,
        }
    }

    /// Serialise into a single frame.
    pub fn encode(&self) -> Result<Vec<u8>, EncodeError> {
        let mut payload = BytesMut::with_capacity(MAX_FRAME_LEN - HEADER_LEN);
        match self {
            Message::Create { start_seq, alg, .. } => {
                if alg.is_empty() {
                    return Err(EncodeError::EmptyString);
                }
                payload.put_u32_le(*start_seq);
                payload.put_slice(alg.as_bytes());
            }
            Message::Measure { measurement, .. } => {
                let rtt_ns = u32::try_from(measurement.rtt.as_nanos()).unwrap_or(u32::MAX);
                payload.put_u32_le(measurement.ack);
                payload.put_u32_le(rtt_ns);
                payload.put_u64_le(measurement.rate_in);
                payload.put_u64_le(measurement.rate_out);
            }
            Message::Drop { event, .. } => {
                payload.put_slice(event.as_str().as_bytes());
            }
            Message::Pattern { pattern, .. } => {
                payload.put_u32_le(pattern.len() as u32);
                for ev in pattern.events() {
                    put_event(&mut payload, ev);
                }
            }
        }

        let len = HEADER_LEN + payload.len();
        if len > MAX_FRAME_LEN {
            return Err(EncodeError::TooLong(len));
        }

        let mut buf = BytesMut::with_capacity(len);
        buf.put_u8(self.type_tag());
        buf.put_u8(len as u8);
        buf.put_u32_le(self.flow_id());
        buf.put_slice(&payload);
        Ok(buf.to_vec())
    }

    /// Parse exactly one frame.
    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        if buf.len() < HEADER_LEN {
            return Err(DecodeError::Truncated(buf.len()));
        }

        let mut hdr = &buf[..HEADER_LEN];
        let typ = hdr.get_u8();
        let declared = usize::from(hdr.get_u8());
        let flow_id = hdr.get_u32_le();

        if declared != buf.len() {
            return Err(DecodeError::LengthMismatch {
                declared,
                actual: buf.len(),
            });
        }

        let mut payload = &buf[HEADER_LEN..];
        let bad_length = || DecodeError::BadLength {
            typ,
            len: buf.len(),
        };

        match typ {
            CREATE => {
                if payload.len() < 4 {
                    return Err(bad_length());
                }
                let start_seq = payload.get_u32_le();
                let alg = read_string(payload)?;
                Ok(Message::Create {
                    flow_id,
                    start_seq,
                    alg,
                })
            }
            MEASURE => {
                if buf.len() != MEASURE_LEN {
                    return Err(bad_length());
                }
                let ack = payload.get_u32_le();
                let rtt = Duration::from_nanos(u64::from(payload.get_u32_le()));
                let rate_in = payload.get_u64_le();
                let rate_out = payload.get_u64_le();
                Ok(Message::Measure {
                    flow_id,
                    measurement: Measurement {
                        ack,
                        rtt,
                        rate_in,
                        rate_out,
                    },
                })
            }
            DROP => {
                let name = read_string(payload)?;
                let event = name
                    .parse::<DropEvent>()
                    .map_err(|e| DecodeError::UnknownDropEvent(e.0))?;
                Ok(Message::Drop { flow_id, event })
            }
            PATTERN => {
                if payload.len() < 4 {
                    return Err(bad_length());
                }
                let count = payload.get_u32_le();
                let pattern = read_events(payload, count)?;
                Ok(Message::Pattern { flow_id, pattern })
            }
            other => Err(DecodeError::UnknownType(other)),
        }
    }
}

/// Iterates over the frames packed into one buffer.
///
/// Iteration stops after the first framing error since the stream cannot
/// be resynchronised past a bad length byte.
pub struct FrameIter<'a> {
    buf: &'a [u8],
    failed: bool,
}

impl<'a> FrameIter<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, failed: false }
    }
}

impl<'a> Iterator for FrameIter<'a> {
    type Item = Result<&'a [u8], DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.buf.is_empty() {
            return None;
        }

        if self.buf.len() < HEADER_LEN {
            self.failed = true;
            return Some(Err(DecodeError::Truncated(self.buf.len())));
        }

        let len = usize::from(self.buf[1]);
        if len < HEADER_LEN || len > self.buf.len() {
            self.failed = true;
            return Some(Err(DecodeError::LengthMismatch {
                declared: len,
                actual: self.buf.len(),
            }));
        }

        let (frame, rest) = self.buf.split_at(len);
        self.buf = rest;
        Some(Ok(frame))
    }
}

fn read_string(raw: &[u8]) -> Result<String, DecodeError> {
    let raw = match raw.split_last() {
        Some((&0, head)) => head,
        _ => raw,
    };
    String::from_utf8(raw.to_vec()).map_err(|_| DecodeError::InvalidString)
}

fn to_fixed_point(v: f32) -> u32 {
    // float -> int casts saturate
    (v * FIXED_POINT_SCALE).round() as u32
}

fn from_fixed_point(v: u32) -> f32 {
    v as f32 / FIXED_POINT_SCALE
}

fn put_event(buf: &mut BytesMut, ev: &PatternEvent) {
    let value = match *ev {
        PatternEvent::SetRateAbs(rate) => to_fixed_point(rate),
        PatternEvent::SetCwndAbs(cwnd) => cwnd,
        PatternEvent::SetRateRel(factor) | PatternEvent::WaitRel(factor) => to_fixed_point(factor),
        PatternEvent::WaitAbs(wait) => u32::try_from(wait.as_micros()).unwrap_or(u32::MAX),
        PatternEvent::Report => {
            buf.put_u8(ev.kind());
            buf.put_u8(EVENT_HEADER_LEN);
            return;
        }
    };

    buf.put_u8(ev.kind());
    buf.put_u8(EVENT_VALUE_LEN);
    buf.put_u32_le(value);
}

fn read_events(mut buf: &[u8], count: u32) -> Result<Pattern, DecodeError> {
    let mut builder = Pattern::builder();
    for index in 0..count {
        if buf.remaining() < usize::from(EVENT_HEADER_LEN) {
            return Err(DecodeError::EventsTruncated(index));
        }

        let kind = buf.get_u8();
        let len = buf.get_u8();
        let bad_event = DecodeError::BadEvent { index, kind, len };

        if len == EVENT_HEADER_LEN {
            if kind != PatternEvent::Report.kind() {
                return Err(bad_event);
            }
            builder = builder.report();
            continue;
        }

        if len != EVENT_VALUE_LEN {
            return Err(bad_event);
        }
        if buf.remaining() < 4 {
            return Err(DecodeError::EventsTruncated(index));
        }

        let value = buf.get_u32_le();
        let ev = match kind {
            0 => PatternEvent::SetRateAbs(from_fixed_point(value)),
            1 => PatternEvent::SetCwndAbs(value),
            2 => PatternEvent::SetRateRel(from_fixed_point(value)),
            3 => PatternEvent::WaitAbs(Duration::from_micros(u64::from(value))),
            4 => PatternEvent::WaitRel(from_fixed_point(value)),
            _ => return Err(bad_event),
        };
        builder = builder.event(ev);
    }

    if buf.has_remaining() {
        return Err(DecodeError::TrailingBytes(buf.remaining()));
    }

    Ok(builder.compile()?)
}
