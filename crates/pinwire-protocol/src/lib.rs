//! Pulse-width protocol decoding on top of `pinwire-hardware` pins.
//!
//! Layers, leaf first:
//!
//! - [`decoder`]: pure `(level, duration)` state machine with a
//!   parameterised preamble, bit timing and frame length
//! - [`capture`]: binds a decoder to a live pin for one capture session
//! - [`dht22`]: DHT22/AM2302 start signal, frame checksum and value decoding
//! - [`poller`]: periodic reads with retry and timeout on the tokio runtime
//!
//! New one-wire style sensors only need a new [`CaptureProfile`].

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod capture;
pub mod decoder;
pub mod dht22;
pub mod poller;

pub use capture::{CaptureSession, EdgeTimingCapture, FrameConsumer};
pub use decoder::{
    BitTiming, CaptureBuffer, CapturePhase, CaptureProfile, EdgeDecoder, Feed, PreambleStep,
};
pub use dht22::{
    Dht22, Dht22Config, Dht22State, Reading, ReadingListener, TriggerTiming, decode_frame,
};
pub use poller::{Dht22Poller, PollEvent, PollerConfig, PollerHandle};

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
