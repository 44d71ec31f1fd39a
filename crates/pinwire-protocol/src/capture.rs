//! Live edge capture bound to a pin.
//!
//! [`EdgeTimingCapture`] subscribes an [`EdgeDecoder`] to a pin's edge
//! notifications and reports exactly one outcome per session: the complete
//! frame or the desync that ended it. Edge detection is switched off as soon
//! as the session reaches a terminal phase.
//!
//! Edges arrive on the backend's delivery thread. The session state sits
//! behind one mutex; once [`CaptureSession::stop`] has begun, edges that find
//! the lock taken are dropped instead of waiting for the teardown.
//!
//! A session never times out on its own. A sensor that stops sending edges
//! leaves the session in `Capturing` until it is stopped.

use pinwire_core::{Error, Level, Result, TickClock};
use pinwire_hardware::{EdgeHandler, Pin};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError, Weak};
use tracing::{debug, trace, warn};

use crate::decoder::{CaptureBuffer, CapturePhase, CaptureProfile, EdgeDecoder, Feed};
use crate::lock;

/// Receives the outcome of a capture session.
pub type FrameConsumer = Box<dyn FnOnce(Result<CaptureBuffer>) + Send>;

/// Capture engine for one protocol profile.
#[derive(Debug, Clone)]
pub struct EdgeTimingCapture {
    profile: CaptureProfile,
}

impl EdgeTimingCapture {
    /// # Errors
    ///
    /// Returns `Error::Config` if the profile cannot decode a frame.
    pub fn new(profile: CaptureProfile) -> Result<Self> {
        profile.validate()?;
        Ok(Self { profile })
    }

    pub fn profile(&self) -> &CaptureProfile {
        &self.profile
    }

    /// Start capturing edges from `pin`.
    ///
    /// The elapsed time of the first edge is measured from the pin's current
    /// tick. `consumer` is called at most once, from the delivery thread,
    /// with no session lock held. It is never called after [`CaptureSession::stop`].
    pub fn start(
        &self,
        pin: &Pin,
        consumer: impl FnOnce(Result<CaptureBuffer>) + Send + 'static,
    ) -> Result<CaptureSession> {
        let last_tick = pin.ticks()?;
        let inner = Arc::new(SessionInner {
            pin: pin.clone(),
            clock: pin.clock(),
            stopping: AtomicBool::new(false),
            state: Mutex::new(SessionState {
                decoder: EdgeDecoder::new(self.profile.clone()),
                last_tick,
                active: true,
                consumer: Some(Box::new(consumer)),
            }),
        });

        let handler: Arc<dyn EdgeHandler> = {
            let weak: Weak<SessionInner> = Arc::downgrade(&inner);
            Arc::new(move |tick: u64, level: Level| {
                if let Some(inner) = weak.upgrade() {
                    inner.on_edge(tick, level);
                }
            })
        };
        pin.set_when_changed(Some(&handler))?;

        debug!(line = %pin.line(), frame_bits = self.profile.frame_bits, "Capture started");
        Ok(CaptureSession {
            inner,
            _handler: handler,
        })
    }
}

struct SessionState {
    decoder: EdgeDecoder,
    last_tick: u64,
    active: bool,
    consumer: Option<FrameConsumer>,
}

struct SessionInner {
    pin: Pin,
    clock: TickClock,
    stopping: AtomicBool,
    state: Mutex<SessionState>,
}

impl SessionInner {
    fn lock(&self) -> MutexGuard<'_, SessionState> {
        lock(&self.state)
    }

    fn on_edge(&self, tick: u64, level: Level) {
        let mut state = match self.state.try_lock() {
            Ok(state) => state,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => {
                if self.stopping.load(Ordering::Acquire) {
                    trace!(tick, "Edge dropped during teardown");
                    return;
                }
                self.lock()
            }
        };
        if !state.active {
            return;
        }

        let elapsed = self.clock.diff(tick, state.last_tick);
        state.last_tick = tick;

        let outcome = match state.decoder.feed(level, elapsed) {
            Feed::Complete(frame) => Ok(frame),
            Feed::Desync(reason) => Err(Error::Desync(reason)),
            Feed::Pending | Feed::Bit(_) | Feed::Ignored => return,
        };
        state.active = false;
        let consumer = state.consumer.take();
        drop(state);

        self.release_pin();
        match &outcome {
            Ok(frame) => debug!(line = %self.pin.line(), bits = frame.len(), "Capture complete"),
            Err(e) => debug!(line = %self.pin.line(), error = %e, "Capture failed"),
        }
        if let Some(consumer) = consumer {
            consumer(outcome);
        }
    }

    fn release_pin(&self) {
        match self.pin.set_when_changed(None) {
            Ok(()) | Err(Error::Closed(_)) => {}
            Err(e) => warn!(line = %self.pin.line(), error = %e, "Failed to disable edge detection"),
        }
    }
}

/// One in-flight capture.
///
/// Dropping the session stops it.
pub struct CaptureSession {
    inner: Arc<SessionInner>,
    // Keeps the pin subscription alive; the pin only holds it weakly.
    _handler: Arc<dyn EdgeHandler>,
}

impl CaptureSession {
    pub fn phase(&self) -> CapturePhase {
        self.inner.lock().decoder.phase()
    }

    /// Whether the session is still waiting for edges.
    pub fn is_active(&self) -> bool {
        self.inner.lock().active
    }

    /// Bits collected so far.
    pub fn bits_collected(&self) -> usize {
        self.inner.lock().decoder.bit_index()
    }

    /// Cancel the capture.
    ///
    /// Disables the pin's edge callback and discards any partial frame. The
    /// consumer is dropped without being called. Safe to call repeatedly,
    /// after completion, and from inside the consumer.
    pub fn stop(&self) {
        self.inner.stopping.store(true, Ordering::Release);
        let (was_active, consumer) = {
            let mut state = self.inner.lock();
            let was_active = std::mem::replace(&mut state.active, false);
            if was_active {
                state.decoder.cancel();
            }
            (was_active, state.consumer.take())
        };
        drop(consumer);

        if was_active {
            self.inner.release_pin();
            debug!(line = %self.inner.pin.line(), "Capture stopped");
        }
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for CaptureSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaptureSession")
            .field("line", &self.inner.pin.line())
            .field("phase", &self.phase())
            .field("active", &self.is_active())
            .finish()
    }
}
