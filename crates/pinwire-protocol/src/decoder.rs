//! Edge timing decoder for pulse-width encoded one-wire protocols.
//!
//! The decoder is a pure state machine: it is fed `(level, elapsed)` pairs,
//! one per observed edge, and turns them into protocol bits. It knows nothing
//! about pins or threads; [`crate::capture`] connects it to a live pin.
//!
//! Every edge reports the level the line changed *to*. The duration since the
//! previous edge therefore measures how long the line stayed at the *prior*
//! level, so each edge yields one sample `(prior_level, elapsed)`.
//!
//! # State Machine
//!
//! ```text
//! ┌──────────────────┐ preamble matched ┌───────────┐ frame_bits ┌──────────┐
//! │ AwaitingPreamble │─────────────────>│ Capturing │───────────>│ Complete │
//! └──────────────────┘                  └───────────┘            └──────────┘
//!       │ │  mismatch (lenient):               │
//!       │ └─ restart at step 0                 │ repeated level,
//!       │                                      │ bit or separator out of range
//!       │ repeated level,                      ▼
//!       │ mismatch (strict)               ┌──────────┐
//!       └────────────────────────────────>│  Failed  │
//!                                         └──────────┘
//! ```
//!
//! [`EdgeDecoder::cancel`] moves any phase to `Stopped`. Terminal phases
//! ignore further edges until [`EdgeDecoder::reset`].
//!
//! # Example
//!
//! ```
//! use pinwire_core::Level;
//! use pinwire_protocol::decoder::{CapturePhase, CaptureProfile, EdgeDecoder, Feed};
//! use std::time::Duration;
//!
//! let mut decoder = EdgeDecoder::new(CaptureProfile::dht22());
//! let us = Duration::from_micros;
//!
//! // Response preamble: 80 µs low, 80 µs high.
//! decoder.feed(Level::Low, us(20));
//! decoder.feed(Level::High, us(80));
//! decoder.feed(Level::Low, us(80));
//! assert_eq!(decoder.phase(), CapturePhase::Capturing);
//!
//! // One `1` bit: 50 µs separator, 70 µs high.
//! decoder.feed(Level::High, us(50));
//! assert!(matches!(decoder.feed(Level::Low, us(70)), Feed::Bit(true)));
//! ```

use pinwire_core::constants::{
    DHT22_FRAME_BITS, DHT22_ONE_MAX_US, DHT22_ONE_MIN_US, DHT22_RESPONSE_MAX_US,
    DHT22_RESPONSE_MIN_US, DHT22_ZERO_MAX_US, DHT22_ZERO_MIN_US,
};
use pinwire_core::{DesyncReason, DurationRange, Error, Level, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::trace;

/// Decoder phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CapturePhase {
    /// Matching the fixed response sequence that precedes the data bits.
    AwaitingPreamble,

    /// Classifying data bits.
    Capturing,

    /// A full frame was collected.
    Complete,

    /// Synchronisation was lost; the partial frame was discarded.
    Failed,

    /// Cancelled by the caller; the partial frame was discarded.
    Stopped,
}

impl CapturePhase {
    /// Whether the phase accepts no further edges.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed | Self::Stopped)
    }
}

impl fmt::Display for CapturePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AwaitingPreamble => write!(f, "awaiting preamble"),
            Self::Capturing => write!(f, "capturing"),
            Self::Complete => write!(f, "complete"),
            Self::Failed => write!(f, "failed"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// One expected `(level, duration)` pair of a preamble.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreambleStep {
    pub level: Level,
    /// Accepted duration; `None` accepts any.
    pub range: Option<DurationRange>,
}

impl PreambleStep {
    pub fn any(level: Level) -> Self {
        Self { level, range: None }
    }

    pub fn within(level: Level, range: DurationRange) -> Self {
        Self {
            level,
            range: Some(range),
        }
    }

    pub fn matches(&self, level: Level, elapsed: Duration) -> bool {
        self.level == level && self.range.is_none_or(|range| range.contains(elapsed))
    }
}

/// How data bits are encoded on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BitTiming {
    pub zero: DurationRange,
    pub one: DurationRange,
    /// Level whose duration carries the bit value.
    pub data_level: Level,
    /// Allowed duration of the pulses between data pulses; unchecked if `None`.
    pub separator: Option<DurationRange>,
}

impl BitTiming {
    /// Classify a data pulse. `zero` wins if the ranges overlap.
    pub fn classify(&self, duration: Duration) -> Option<bool> {
        if self.zero.contains(duration) {
            Some(false)
        } else if self.one.contains(duration) {
            Some(true)
        } else {
            None
        }
    }
}

/// Parameters describing one pulse-width protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureProfile {
    pub preamble: Vec<PreambleStep>,
    pub bits: BitTiming,
    pub frame_bits: usize,
    /// Treat a preamble mismatch as desync instead of noise.
    #[serde(default)]
    pub strict_preamble: bool,
}

impl CaptureProfile {
    pub fn new(preamble: Vec<PreambleStep>, bits: BitTiming, frame_bits: usize) -> Self {
        Self {
            preamble,
            bits,
            frame_bits,
            strict_preamble: false,
        }
    }

    /// DHT22/AM2302 response: 80 µs low, 80 µs high, then 40 high-encoded bits.
    pub fn dht22() -> Self {
        Self::new(
            vec![
                PreambleStep::any(Level::Low),
                PreambleStep::within(
                    Level::High,
                    DurationRange::from_micros(DHT22_RESPONSE_MIN_US, DHT22_RESPONSE_MAX_US),
                ),
            ],
            BitTiming {
                zero: DurationRange::from_micros(DHT22_ZERO_MIN_US, DHT22_ZERO_MAX_US),
                one: DurationRange::from_micros(DHT22_ONE_MIN_US, DHT22_ONE_MAX_US),
                data_level: Level::High,
                separator: None,
            },
            DHT22_FRAME_BITS,
        )
    }

    pub fn with_strict_preamble(mut self, strict: bool) -> Self {
        self.strict_preamble = strict;
        self
    }

    pub fn with_separator(mut self, separator: DurationRange) -> Self {
        self.bits.separator = Some(separator);
        self
    }

    /// Check the profile can decode anything at all.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` for an empty frame or overlapping bit ranges.
    pub fn validate(&self) -> Result<()> {
        if self.frame_bits == 0 {
            return Err(Error::Config("frame must contain at least one bit".into()));
        }
        if self.bits.zero.overlaps(&self.bits.one) {
            return Err(Error::Config(format!(
                "bit ranges overlap: zero {} and one {}",
                self.bits.zero, self.bits.one
            )));
        }
        Ok(())
    }
}

/// Bits decoded so far, bounded by the frame length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureBuffer {
    bits: Vec<bool>,
    capacity: usize,
}

impl CaptureBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            bits: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a bit. Returns `false` if the buffer is already full.
    pub fn push(&mut self, bit: bool) -> bool {
        if self.is_full() {
            return false;
        }
        self.bits.push(bit);
        true
    }

    pub fn len(&self) -> usize {
        self.bits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_full(&self) -> bool {
        self.bits.len() >= self.capacity
    }

    pub fn clear(&mut self) {
        self.bits.clear();
    }

    pub fn bits(&self) -> &[bool] {
        &self.bits
    }

    /// Pack the bits MSB-first. A trailing partial byte is zero-padded.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.bits
            .chunks(8)
            .map(|chunk| {
                chunk
                    .iter()
                    .enumerate()
                    .fold(0u8, |byte, (i, &bit)| byte | (u8::from(bit) << (7 - i)))
            })
            .collect()
    }
}

impl fmt::Display for CaptureBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, bit) in self.bits.iter().enumerate() {
            if i > 0 && i % 8 == 0 {
                write!(f, " ")?;
            }
            write!(f, "{}", u8::from(*bit))?;
        }
        Ok(())
    }
}

/// Result of feeding one edge to the decoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Feed {
    /// Edge consumed; nothing new to report.
    Pending,

    /// A data bit was decoded.
    Bit(bool),

    /// The final bit was decoded; the frame is handed over.
    Complete(CaptureBuffer),

    /// Synchronisation was lost.
    Desync(DesyncReason),

    /// The decoder is in a terminal phase and ignored the edge.
    Ignored,
}

/// Pulse-width decoder for one capture attempt.
#[derive(Debug, Clone)]
pub struct EdgeDecoder {
    profile: CaptureProfile,
    phase: CapturePhase,
    preamble_index: usize,
    buffer: CaptureBuffer,
    last_level: Option<Level>,
}

impl EdgeDecoder {
    pub fn new(profile: CaptureProfile) -> Self {
        let buffer = CaptureBuffer::with_capacity(profile.frame_bits);
        let mut decoder = Self {
            profile,
            phase: CapturePhase::AwaitingPreamble,
            preamble_index: 0,
            buffer,
            last_level: None,
        };
        decoder.reset();
        decoder
    }

    /// Start over for a new capture attempt.
    pub fn reset(&mut self) {
        self.preamble_index = 0;
        self.buffer.clear();
        self.last_level = None;
        self.phase = if self.profile.preamble.is_empty() {
            CapturePhase::Capturing
        } else {
            CapturePhase::AwaitingPreamble
        };
    }

    /// Abandon the attempt and discard collected bits.
    pub fn cancel(&mut self) {
        self.buffer.clear();
        self.phase = CapturePhase::Stopped;
    }

    pub fn profile(&self) -> &CaptureProfile {
        &self.profile
    }

    pub fn phase(&self) -> CapturePhase {
        self.phase
    }

    pub fn preamble_index(&self) -> usize {
        self.preamble_index
    }

    /// Bits collected in the current attempt.
    pub fn bit_index(&self) -> usize {
        self.buffer.len()
    }

    pub fn buffer(&self) -> &CaptureBuffer {
        &self.buffer
    }

    /// Process one edge: the line changed to `level` after `elapsed` at the
    /// prior level.
    pub fn feed(&mut self, level: Level, elapsed: Duration) -> Feed {
        if self.phase.is_terminal() {
            return Feed::Ignored;
        }
        if self.last_level == Some(level) {
            return self.fail(DesyncReason::RepeatedLevel { level });
        }
        self.last_level = Some(level);
        let prior = !level;

        match self.phase {
            CapturePhase::AwaitingPreamble => self.match_preamble(prior, elapsed),
            CapturePhase::Capturing => self.capture(prior, elapsed),
            CapturePhase::Complete | CapturePhase::Failed | CapturePhase::Stopped => Feed::Ignored,
        }
    }

    fn match_preamble(&mut self, level: Level, elapsed: Duration) -> Feed {
        let step = self.preamble_index;
        if !self.profile.preamble[step].matches(level, elapsed) {
            if self.profile.strict_preamble {
                return self.fail(DesyncReason::PreambleMismatch {
                    step,
                    level,
                    duration: elapsed,
                });
            }
            trace!(step, %level, ?elapsed, "Preamble mismatch, restarting");
            self.preamble_index = 0;
            if !self.profile.preamble[0].matches(level, elapsed) {
                return Feed::Pending;
            }
        }

        self.preamble_index += 1;
        if self.preamble_index == self.profile.preamble.len() {
            trace!("Preamble matched");
            self.phase = CapturePhase::Capturing;
        }
        Feed::Pending
    }

    fn capture(&mut self, level: Level, elapsed: Duration) -> Feed {
        let bits = self.profile.bits;
        let bit_index = self.buffer.len();

        if level != bits.data_level {
            return match bits.separator {
                Some(range) if !range.contains(elapsed) => {
                    self.fail(DesyncReason::SeparatorOutOfRange {
                        bit_index,
                        duration: elapsed,
                    })
                }
                _ => Feed::Pending,
            };
        }

        let Some(bit) = bits.classify(elapsed) else {
            return self.fail(DesyncReason::BitOutOfRange {
                bit_index,
                duration: elapsed,
            });
        };
        self.buffer.push(bit);

        if self.buffer.is_full() {
            self.phase = CapturePhase::Complete;
            let frame = std::mem::replace(
                &mut self.buffer,
                CaptureBuffer::with_capacity(self.profile.frame_bits),
            );
            Feed::Complete(frame)
        } else {
            Feed::Bit(bit)
        }
    }

    fn fail(&mut self, reason: DesyncReason) -> Feed {
        trace!(phase = %self.phase, reason = %reason, "Capture desync");
        self.phase = CapturePhase::Failed;
        self.buffer.clear();
        Feed::Desync(reason)
    }
}
