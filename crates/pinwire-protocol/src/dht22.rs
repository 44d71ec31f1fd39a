//! DHT22/AM2302 temperature and humidity sensor codec.
//!
//! A read wakes the sensor with a host-driven start signal, then hands the
//! line to an [`EdgeTimingCapture`] configured for the sensor's response.
//! The resulting 40-bit frame is checksummed and decoded into a [`Reading`].
//!
//! Results are delivered asynchronously to a [`ReadingListener`] from the
//! backend's edge thread:
//!
//! ```text
//! Idle ──read()──> Triggering ──> Capturing ──frame──> Decoding ──> Idle
//!   ^                  │               │                              │
//!   └── error ─────────┘               └──── desync / cancel() ───────┘
//! ```
//!
//! # Example
//!
//! ```
//! use pinwire_protocol::dht22::decode_frame;
//!
//! let reading = decode_frame([0x02, 0x8C, 0x01, 0x5F, 0xEE]);
//! assert!(reading.checksum_valid());
//! assert_eq!(reading.humidity(), 65.2);
//! assert_eq!(reading.temperature(), 35.1);
//! ```

use chrono::{DateTime, Utc};
use pinwire_core::constants::{
    DHT22_DEBOUNCE_US, DHT22_FRAME_BYTES, DHT22_RELEASE_PULSE_US, DHT22_START_HOLD_MS,
    DHT22_TEMPERATURE_SIGN_MASK, DHT22_WAKE_HOLD_MS,
};
use pinwire_core::{Edges, Error, Level, LineId, Mode, Pull, Result};
use pinwire_hardware::Pin;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::capture::{CaptureSession, EdgeTimingCapture};
use crate::decoder::{CaptureBuffer, CaptureProfile};
use crate::lock;

/// Raw DHT22 frame: humidity high/low, temperature high/low, checksum.
pub type Frame = [u8; DHT22_FRAME_BYTES];

/// Low byte of the sum of the four data bytes.
pub fn checksum(frame: &Frame) -> u8 {
    frame[..4].iter().fold(0u8, |sum, byte| sum.wrapping_add(*byte))
}

/// Decode a frame without rejecting a bad checksum.
pub fn decode_frame(frame: Frame) -> Reading {
    let humidity_tenths = u16::from_be_bytes([frame[0], frame[1]]);
    let magnitude = i16::from_be_bytes([frame[2] & !DHT22_TEMPERATURE_SIGN_MASK, frame[3]]);
    let temperature_tenths = if frame[2] & DHT22_TEMPERATURE_SIGN_MASK != 0 {
        -magnitude
    } else {
        magnitude
    };

    Reading {
        humidity_tenths,
        temperature_tenths,
        checksum_valid: checksum(&frame) == frame[4],
        raw: frame,
        captured_at: Utc::now(),
    }
}

/// One decoded sensor frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    humidity_tenths: u16,
    temperature_tenths: i16,
    checksum_valid: bool,
    raw: Frame,
    captured_at: DateTime<Utc>,
}

impl Reading {
    /// Relative humidity in %RH.
    pub fn humidity(&self) -> f64 {
        f64::from(self.humidity_tenths) / 10.0
    }

    /// Temperature in °C.
    pub fn temperature(&self) -> f64 {
        f64::from(self.temperature_tenths) / 10.0
    }

    pub fn humidity_tenths(&self) -> u16 {
        self.humidity_tenths
    }

    pub fn temperature_tenths(&self) -> i16 {
        self.temperature_tenths
    }

    pub fn checksum_valid(&self) -> bool {
        self.checksum_valid
    }

    pub fn raw(&self) -> Frame {
        self.raw
    }

    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }
}

impl fmt::Display for Reading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.1}°C {:.1}%RH", self.temperature(), self.humidity())
    }
}

/// Host-driven start signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TriggerTiming {
    /// High hold before the start signal.
    pub wake_hold: Duration,
    /// Low hold that starts a conversion.
    pub start_hold: Duration,
    /// High pulse before the line is released to the sensor.
    pub release_pulse: Duration,
}

impl TriggerTiming {
    /// No delays; for simulated sensors.
    pub const fn immediate() -> Self {
        Self {
            wake_hold: Duration::ZERO,
            start_hold: Duration::ZERO,
            release_pulse: Duration::ZERO,
        }
    }

    pub fn total(&self) -> Duration {
        self.wake_hold + self.start_hold + self.release_pulse
    }
}

impl Default for TriggerTiming {
    fn default() -> Self {
        Self {
            wake_hold: Duration::from_millis(DHT22_WAKE_HOLD_MS),
            start_hold: Duration::from_millis(DHT22_START_HOLD_MS),
            release_pulse: Duration::from_micros(DHT22_RELEASE_PULSE_US),
        }
    }
}

/// Codec settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Dht22Config {
    pub trigger: TriggerTiming,
    /// Debounce applied to the data line while capturing.
    pub debounce: Option<Duration>,
    pub profile: CaptureProfile,
}

impl Default for Dht22Config {
    fn default() -> Self {
        Self {
            trigger: TriggerTiming::default(),
            debounce: Some(Duration::from_micros(DHT22_DEBOUNCE_US)),
            profile: CaptureProfile::dht22(),
        }
    }
}

impl Dht22Config {
    pub fn with_trigger(mut self, trigger: TriggerTiming) -> Self {
        self.trigger = trigger;
        self
    }

    pub fn with_debounce(mut self, debounce: Option<Duration>) -> Self {
        self.debounce = debounce;
        self
    }

    pub fn with_strict_preamble(mut self, strict: bool) -> Self {
        self.profile.strict_preamble = strict;
        self
    }
}

/// Receives decoded frames and failures.
///
/// Called from the backend's edge thread with no codec lock held; a
/// listener may start the next [`Dht22::read`] from inside a callback.
pub trait ReadingListener: Send + Sync {
    fn on_reading(&self, reading: Reading);

    /// Called once per frame whose checksum does not match.
    ///
    /// Return `true` if the mismatch was handled (typically by scheduling
    /// another read). Otherwise it is reported through [`Self::on_error`].
    fn on_invalid_checksum(&self, _expected: u8, _actual: u8) -> bool {
        false
    }

    fn on_error(&self, _error: Error) {}
}

/// Codec state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Dht22State {
    Idle,
    Triggering,
    Capturing,
    Decoding,
}

impl fmt::Display for Dht22State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Triggering => write!(f, "triggering"),
            Self::Capturing => write!(f, "capturing"),
            Self::Decoding => write!(f, "decoding"),
        }
    }
}

struct Slot {
    state: Dht22State,
    session: Option<CaptureSession>,
    /// Bumped on every read and cancel so stale completions are ignored.
    generation: u64,
}

struct Dht22Inner {
    pin: Pin,
    config: Dht22Config,
    capture: EdgeTimingCapture,
    slot: Mutex<Slot>,
    listener: Mutex<Option<Weak<dyn ReadingListener>>>,
}

impl Dht22Inner {
    fn trigger(&self) -> Result<()> {
        let timing = self.config.trigger;
        self.pin.configure(Mode::Output, Pull::Floating)?;
        self.pin.write(Level::High)?;
        thread::sleep(timing.wake_hold);
        self.pin.write(Level::Low)?;
        thread::sleep(timing.start_hold);
        self.pin.write(Level::High)?;
        thread::sleep(timing.release_pulse);
        self.pin.configure(Mode::Input, Pull::Up)?;
        // Bit widths are measured between consecutive edges of either kind.
        self.pin.set_edges(Edges::Both)?;
        self.pin.set_bounce(self.config.debounce)
    }

    fn reset_if(&self, generation: u64) {
        let mut slot = lock(&self.slot);
        if slot.generation == generation {
            slot.state = Dht22State::Idle;
        }
    }

    fn listener(&self) -> Option<Arc<dyn ReadingListener>> {
        lock(&self.listener).as_ref().and_then(Weak::upgrade)
    }

    fn finish(&self, generation: u64, outcome: Result<CaptureBuffer>) {
        let session = {
            let mut slot = lock(&self.slot);
            if slot.generation != generation || slot.state != Dht22State::Capturing {
                return;
            }
            slot.state = Dht22State::Decoding;
            slot.session.take()
        };
        drop(session);

        let result = outcome.and_then(|buffer| {
            let frame: Frame = buffer.to_bytes().try_into().map_err(|bytes: Vec<u8>| {
                Error::InvalidValue(format!("expected a 5-byte frame, got {} bytes", bytes.len()))
            })?;
            Ok(decode_frame(frame))
        });
        self.reset_if(generation);

        let listener = self.listener();
        let line = self.pin.line();
        match result {
            Ok(reading) if reading.checksum_valid() => {
                info!(line = %line, temperature = reading.temperature(), humidity = reading.humidity(), "DHT22 reading");
                if let Some(listener) = listener {
                    listener.on_reading(reading);
                }
            }
            Ok(reading) => {
                let expected = checksum(&reading.raw);
                let actual = reading.raw[4];
                warn!(line = %line, expected, actual, "DHT22 checksum mismatch");
                let handled = listener
                    .as_ref()
                    .is_some_and(|listener| listener.on_invalid_checksum(expected, actual));
                if !handled && let Some(listener) = listener {
                    listener.on_error(Error::ChecksumMismatch { expected, actual });
                }
            }
            Err(e) => {
                warn!(line = %line, error = %e, "DHT22 read failed");
                if let Some(listener) = listener {
                    listener.on_error(e);
                }
            }
        }
    }
}

/// DHT22 sensor attached to one pin.
///
/// Clones share the same sensor and state.
#[derive(Clone)]
pub struct Dht22 {
    inner: Arc<Dht22Inner>,
}

impl Dht22 {
    /// Wrap `pin`, which the codec drives as both output and input.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the capture profile is unusable.
    pub fn new(pin: Pin, config: Dht22Config) -> Result<Self> {
        let capture = EdgeTimingCapture::new(config.profile.clone())?;
        Ok(Self {
            inner: Arc::new(Dht22Inner {
                pin,
                config,
                capture,
                slot: Mutex::new(Slot {
                    state: Dht22State::Idle,
                    session: None,
                    generation: 0,
                }),
                listener: Mutex::new(None),
            }),
        })
    }

    pub fn pin(&self) -> &Pin {
        &self.inner.pin
    }

    pub fn line(&self) -> LineId {
        self.inner.pin.line()
    }

    pub fn config(&self) -> &Dht22Config {
        &self.inner.config
    }

    pub fn state(&self) -> Dht22State {
        lock(&self.inner.slot).state
    }

    /// Register the listener, or clear it with `None`. Held weakly.
    pub fn set_listener(&self, listener: Option<&Arc<dyn ReadingListener>>) {
        *lock(&self.inner.listener) = listener.map(Arc::downgrade);
    }

    /// Start one read.
    ///
    /// Blocks for the start signal only; the outcome goes to the listener.
    ///
    /// # Errors
    ///
    /// - `Error::AlreadyInProgress` unless the codec is idle
    /// - any pin error raised while triggering; the codec is idle again
    pub fn read(&self) -> Result<()> {
        let inner = &self.inner;
        let generation = {
            let mut slot = lock(&inner.slot);
            if slot.state != Dht22State::Idle {
                return Err(Error::AlreadyInProgress);
            }
            slot.state = Dht22State::Triggering;
            slot.generation = slot.generation.wrapping_add(1);
            slot.generation
        };

        if let Err(e) = inner.trigger() {
            inner.reset_if(generation);
            return Err(e);
        }

        {
            let mut slot = lock(&inner.slot);
            if slot.generation != generation {
                debug!(line = %self.line(), "Read cancelled while triggering");
                return Ok(());
            }
            slot.state = Dht22State::Capturing;
        }

        let weak = Arc::downgrade(inner);
        let started = inner.capture.start(&inner.pin, move |outcome| {
            if let Some(inner) = weak.upgrade() {
                inner.finish(generation, outcome);
            }
        });
        let session = match started {
            Ok(session) => session,
            Err(e) => {
                inner.reset_if(generation);
                return Err(e);
            }
        };

        let leftover = {
            let mut slot = lock(&inner.slot);
            if slot.generation == generation && slot.state == Dht22State::Capturing {
                slot.session = Some(session);
                None
            } else {
                Some(session)
            }
        };
        drop(leftover);

        debug!(line = %self.line(), "DHT22 capture armed");
        Ok(())
    }

    /// Abandon an in-flight read. Returns whether one was running.
    pub fn cancel(&self) -> bool {
        let (session, was_busy) = {
            let mut slot = lock(&self.inner.slot);
            let was_busy = slot.state != Dht22State::Idle;
            slot.state = Dht22State::Idle;
            slot.generation = slot.generation.wrapping_add(1);
            (slot.session.take(), was_busy)
        };
        if let Some(session) = session {
            session.stop();
        }
        if was_busy {
            debug!(line = %self.line(), "DHT22 read cancelled");
        }
        was_busy
    }

    /// Cancel any read and release the pin.
    pub fn close(&self) -> Result<()> {
        self.cancel();
        self.inner.pin.close()
    }
}

impl fmt::Debug for Dht22 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dht22")
            .field("line", &self.line())
            .field("state", &self.state())
            .finish()
    }
}
