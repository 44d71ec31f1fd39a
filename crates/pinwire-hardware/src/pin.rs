//! Capability-oriented GPIO pin over any backend.
//!
//! A [`Pin`] owns one physical line from [`Pin::open`] until [`Pin::close`]
//! (or until the last clone is dropped). All setters run under the pin's
//! state lock. Edge notifications are forwarded to a subscriber held by
//! weak reference: a dropped subscriber is never called and hardware edge
//! detection is switched off the next time an edge finds it gone.
//!
//! ```text
//! Unbound --open--> Bound(input|output) --set_frequency(Some)--> PWM
//!                        ^                                        |
//!                        +---------set_frequency(None)-----------+
//!                   any state --close--> Closed
//! ```
//!
//! # Examples
//!
//! ```
//! use pinwire_core::{Level, LineId, PinValue};
//! use pinwire_hardware::devices::Backend;
//! use pinwire_hardware::mock::MockBackend;
//! use pinwire_hardware::pin::{Pin, PinConfig};
//! use pinwire_hardware::registry::PinRegistry;
//! use std::sync::Arc;
//!
//! let (mock, _handle) = MockBackend::new();
//! let backend = Backend::Mock(mock);
//! let registry = Arc::new(PinRegistry::new());
//!
//! let pin = Pin::open_in(&registry, &backend, PinConfig::output(LineId::new(17))).unwrap();
//! pin.write(Level::High).unwrap();
//! assert_eq!(pin.read().unwrap(), PinValue::Digital(Level::High));
//! pin.close().unwrap();
//! ```

use pinwire_core::{Edges, Error, Level, LineId, Mode, PinValue, Pull, Result, TickClock};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tracing::{debug, warn};

use crate::backend::{Capabilities, EdgeSink, LineConfig, LineHandle};
use crate::devices::{AnyLine, Backend};
use crate::lock;
use crate::registry::PinRegistry;

/// Receives edge notifications from a pin.
///
/// Called on the backend's delivery thread with no pin lock held, so a
/// handler may call back into the pin, including [`Pin::close`].
pub trait EdgeHandler: Send + Sync {
    fn on_edge(&self, tick: u64, level: Level);
}

impl<F> EdgeHandler for F
where
    F: Fn(u64, Level) + Send + Sync,
{
    fn on_edge(&self, tick: u64, level: Level) {
        self(tick, level)
    }
}

/// Settings applied when a pin is opened.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PinConfig {
    pub line: LineId,
    pub mode: Mode,
    pub pull: Pull,
    pub bounce: Option<Duration>,
    pub edges: Edges,
    /// PWM frequency in Hz; enables PWM right after connect.
    pub frequency: Option<u32>,
    /// Level driven on an output, or full/zero duty under PWM.
    pub initial: Level,
}

impl PinConfig {
    pub fn input(line: LineId) -> Self {
        Self {
            line,
            mode: Mode::Input,
            pull: Pull::Floating,
            bounce: None,
            edges: Edges::Both,
            frequency: None,
            initial: Level::Low,
        }
    }

    pub fn output(line: LineId) -> Self {
        Self {
            mode: Mode::Output,
            ..Self::input(line)
        }
    }

    pub fn with_pull(mut self, pull: Pull) -> Self {
        self.pull = pull;
        self
    }

    pub fn with_bounce(mut self, bounce: Duration) -> Self {
        self.bounce = Some(bounce);
        self
    }

    pub fn with_edges(mut self, edges: Edges) -> Self {
        self.edges = edges;
        self
    }

    pub fn with_frequency(mut self, frequency: u32) -> Self {
        self.frequency = Some(frequency);
        self
    }

    pub fn with_initial(mut self, initial: Level) -> Self {
        self.initial = initial;
        self
    }

    fn line_config(&self) -> LineConfig {
        LineConfig {
            line: self.line,
            mode: self.mode,
            pull: self.pull,
            initial: self.initial,
        }
    }
}

struct PinState {
    handle: Option<AnyLine>,
    mode: Mode,
    pull: Pull,
    bounce: Option<Duration>,
    edges: Edges,
    frequency: Option<u32>,
    /// Last written value; the duty ratio while PWM is enabled.
    value: PinValue,
    edge_detect: bool,
    capabilities: Capabilities,
}

impl PinState {
    fn handle(&mut self, line: LineId) -> Result<&mut AnyLine> {
        self.handle.as_mut().ok_or(Error::Closed(line))
    }

    fn line_config(&self, line: LineId) -> LineConfig {
        let initial = match self.value {
            PinValue::Digital(level) => level,
            PinValue::Duty(_) => Level::Low,
        };
        LineConfig {
            line,
            mode: self.mode,
            pull: self.pull,
            initial,
        }
    }
}

struct PinShared {
    line: LineId,
    registry: Arc<PinRegistry>,
    clock: TickClock,
    closed: AtomicBool,
    state: Mutex<PinState>,
    handler: Mutex<Option<Weak<dyn EdgeHandler>>>,
}

impl PinShared {
    fn lock_state(&self) -> Result<MutexGuard<'_, PinState>> {
        let state = lock(&self.state);
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed(self.line));
        }
        Ok(state)
    }

    fn arm(self: &Arc<Self>, state: &mut PinState) -> Result<()> {
        let weak = Arc::downgrade(self);
        let sink: EdgeSink = Arc::new(move |tick, level| {
            if let Some(shared) = weak.upgrade() {
                shared.dispatch(tick, level);
            }
        });
        let (edges, bounce) = (state.edges, state.bounce);
        state.handle(self.line)?.enable_edge_detect(edges, bounce, sink)?;
        state.edge_detect = true;
        debug!(line = %self.line, edges = %edges, ?bounce, "Edge detection enabled");
        Ok(())
    }

    fn disarm(&self, state: &mut PinState) -> Result<()> {
        state.handle(self.line)?.disable_edge_detect()?;
        state.edge_detect = false;
        debug!(line = %self.line, "Edge detection disabled");
        Ok(())
    }

    fn rearm(self: &Arc<Self>, state: &mut PinState) -> Result<()> {
        if state.edge_detect {
            self.disarm(state)?;
            self.arm(state)?;
        }
        Ok(())
    }

    fn dispatch(&self, tick: u64, level: Level) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let handler = lock(&self.handler).as_ref().and_then(Weak::upgrade);
        match handler {
            Some(handler) => handler.on_edge(tick, level),
            None => self.disarm_orphaned(),
        }
    }

    /// Switch edge detection off after the subscriber was dropped.
    fn disarm_orphaned(&self) {
        let mut state = lock(&self.state);
        if self.closed.load(Ordering::Acquire) || !state.edge_detect {
            return;
        }
        {
            let mut handler = lock(&self.handler);
            if handler.as_ref().is_some_and(|weak| weak.strong_count() > 0) {
                return;
            }
            *handler = None;
        }
        match self.disarm(&mut state) {
            Ok(()) => debug!(line = %self.line, "Edge subscriber dropped"),
            Err(e) => warn!(line = %self.line, error = %e, "Failed to disable orphaned edge detection"),
        }
    }

    fn shutdown(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        *lock(&self.handler) = None;

        let mut first_error: Option<Error> = None;
        {
            let mut state = lock(&self.state);
            if let Some(mut handle) = state.handle.take() {
                let mut record = |result: crate::Result<()>| {
                    if let Err(e) = result {
                        warn!(line = %self.line, error = %e, "Error while closing pin");
                        first_error.get_or_insert(e.into());
                    }
                };
                if state.frequency.take().is_some() {
                    record(handle.set_pwm(None));
                }
                if std::mem::take(&mut state.edge_detect) {
                    record(handle.disable_edge_detect());
                }
                record(handle.close());
            }
        }

        self.registry.release(self.line);
        debug!(line = %self.line, "Pin closed");
        first_error.map_or(Ok(()), Err)
    }
}

impl Drop for PinShared {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!(line = %self.line, error = %e, "Error while dropping pin");
        }
    }
}

/// One GPIO line bound to a backend.
///
/// Clones share the same line.
#[derive(Clone)]
pub struct Pin {
    shared: Arc<PinShared>,
}

impl Pin {
    /// Open a pin using the process-wide registry.
    ///
    /// # Errors
    ///
    /// - `Error::LineBusy` if another pin holds the line (nothing is connected)
    /// - `Error::BackendUnavailable` if the backend cannot provide the line
    /// - `Error::UnsupportedOnInput` if a frequency is set on an input
    pub fn open(backend: &Backend, config: PinConfig) -> Result<Pin> {
        Self::open_in(&PinRegistry::global(), backend, config)
    }

    /// Open a pin claimed in `registry`.
    pub fn open_in(
        registry: &Arc<PinRegistry>,
        backend: &Backend,
        config: PinConfig,
    ) -> Result<Pin> {
        if config.frequency == Some(0) {
            return Err(Error::InvalidValue("PWM frequency must be positive".into()));
        }
        if config.frequency.is_some() && config.mode == Mode::Input {
            return Err(Error::UnsupportedOnInput(config.line));
        }

        registry.claim(config.line)?;
        let pin = match Self::connect(registry, backend, &config) {
            Ok(pin) => pin,
            Err(e) => {
                registry.release(config.line);
                return Err(e);
            }
        };
        registry.attach(config.line, pin.downgrade());

        debug!(
            line = %config.line,
            backend = backend.name(),
            mode = %config.mode,
            pull = %config.pull,
            "Pin opened"
        );
        Ok(pin)
    }

    fn connect(registry: &Arc<PinRegistry>, backend: &Backend, config: &PinConfig) -> Result<Pin> {
        let mut handle = backend.connect(&config.line_config())?;

        let mut value = PinValue::Digital(match config.mode {
            Mode::Output => config.initial,
            Mode::Input => Level::Low,
        });
        if let Some(frequency) = config.frequency {
            let duty = f64::from(config.initial.as_u8());
            let enabled = handle
                .set_pwm(Some(frequency))
                .and_then(|()| handle.set_pwm_duty(duty));
            if let Err(e) = enabled {
                if let Err(close_error) = handle.close() {
                    warn!(
                        line = %config.line,
                        error = %close_error,
                        "Failed to release line after PWM setup error"
                    );
                }
                return Err(e.into());
            }
            value = PinValue::Duty(duty);
        }

        let clock = handle.clock();
        let capabilities = handle.capabilities();
        let state = PinState {
            handle: Some(handle),
            mode: config.mode,
            pull: config.pull,
            bounce: config.bounce,
            edges: config.edges,
            frequency: config.frequency,
            value,
            edge_detect: false,
            capabilities,
        };

        Ok(Pin {
            shared: Arc::new(PinShared {
                line: config.line,
                registry: Arc::clone(registry),
                clock,
                closed: AtomicBool::new(false),
                state: Mutex::new(state),
                handler: Mutex::new(None),
            }),
        })
    }

    pub fn line(&self) -> LineId {
        self.shared.line
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Current level, or the last duty ratio written while PWM is enabled.
    ///
    /// # Errors
    ///
    /// Returns `Error::WrongMode` for an output whose backend cannot read
    /// back the driven level.
    pub fn read(&self) -> Result<PinValue> {
        let mut state = self.shared.lock_state()?;
        if state.frequency.is_some() {
            return Ok(state.value);
        }
        if state.mode == Mode::Output && !state.capabilities.output_readback {
            return Err(Error::wrong_mode(self.line(), "read"));
        }
        let level = state.handle(self.line())?.read()?;
        Ok(PinValue::Digital(level))
    }

    /// Drive the pin.
    ///
    /// Under PWM a digital level maps to duty `0.0`/`1.0`.
    ///
    /// # Errors
    ///
    /// - `Error::WrongMode` on an input, or a duty written without PWM
    /// - `Error::InvalidValue` for a duty outside `0.0..=1.0`
    pub fn write(&self, value: impl Into<PinValue>) -> Result<()> {
        let line = self.line();
        let mut state = self.shared.lock_state()?;
        if state.mode == Mode::Input {
            return Err(Error::wrong_mode(line, "write"));
        }

        let value: PinValue = value.into();
        match (value, state.frequency) {
            (PinValue::Digital(level), None) => {
                state.handle(line)?.write(level)?;
                state.value = PinValue::Digital(level);
            }
            (PinValue::Digital(level), Some(_)) => {
                let duty = f64::from(level.as_u8());
                state.handle(line)?.set_pwm_duty(duty)?;
                state.value = PinValue::Duty(duty);
            }
            (PinValue::Duty(ratio), Some(_)) => {
                let value = PinValue::duty(ratio)?;
                state.handle(line)?.set_pwm_duty(ratio)?;
                state.value = value;
            }
            (PinValue::Duty(_), None) => return Err(Error::wrong_mode(line, "duty write")),
        }
        Ok(())
    }

    pub fn frequency(&self) -> Option<u32> {
        lock(&self.shared.state).frequency
    }

    /// Enable, retune or disable PWM.
    ///
    /// Enabling starts at duty zero. Retuning keeps the duty and the running
    /// signal. Disabling drives the line low and reverts to digital output.
    ///
    /// # Errors
    ///
    /// - `Error::UnsupportedOnInput` when enabling on an input (nothing changes)
    /// - `Error::InvalidValue` for a zero frequency
    pub fn set_frequency(&self, frequency: Option<u32>) -> Result<()> {
        let line = self.line();
        let mut state = self.shared.lock_state()?;

        match (frequency, state.frequency) {
            (Some(0), _) => {
                return Err(Error::InvalidValue("PWM frequency must be positive".into()));
            }
            (Some(_), _) if state.mode == Mode::Input => {
                return Err(Error::UnsupportedOnInput(line));
            }
            (Some(hz), None) => {
                let handle = state.handle(line)?;
                handle.set_pwm(Some(hz))?;
                if let Err(e) = handle.set_pwm_duty(0.0) {
                    if let Err(off_error) = handle.set_pwm(None) {
                        warn!(line = %line, error = %off_error, "Failed to switch PWM back off");
                    }
                    return Err(e.into());
                }
                state.value = PinValue::Duty(0.0);
                debug!(line = %line, frequency = hz, "PWM enabled");
            }
            (Some(hz), Some(current)) if hz != current => {
                state.handle(line)?.set_pwm(Some(hz))?;
                debug!(line = %line, frequency = hz, "PWM retuned");
            }
            (Some(_), Some(_)) | (None, None) => return Ok(()),
            (None, Some(_)) => {
                state.handle(line)?.set_pwm(None)?;
                state.value = PinValue::Digital(Level::Low);
                debug!(line = %line, "PWM disabled");
            }
        }
        state.frequency = frequency;
        Ok(())
    }

    pub fn mode(&self) -> Mode {
        lock(&self.shared.state).mode
    }

    pub fn pull(&self) -> Pull {
        lock(&self.shared.state).pull
    }

    /// Apply direction and pull together.
    ///
    /// Switching to input disables PWM first. Active edge detection is
    /// re-armed with the new configuration.
    pub fn configure(&self, mode: Mode, pull: Pull) -> Result<()> {
        let line = self.line();
        let mut state = self.shared.lock_state()?;
        if state.mode == mode && state.pull == pull {
            return Ok(());
        }

        if mode == Mode::Input && state.frequency.take().is_some() {
            state.handle(line)?.set_pwm(None)?;
            state.value = PinValue::Digital(Level::Low);
        }
        state.mode = mode;
        state.pull = pull;
        let config = state.line_config(line);
        state.handle(line)?.reconfigure(&config)?;
        self.shared.rearm(&mut state)?;

        debug!(line = %line, mode = %mode, pull = %pull, "Pin reconfigured");
        Ok(())
    }

    pub fn set_mode(&self, mode: Mode) -> Result<()> {
        self.configure(mode, self.pull())
    }

    pub fn set_pull(&self, pull: Pull) -> Result<()> {
        self.configure(self.mode(), pull)
    }

    pub fn bounce(&self) -> Option<Duration> {
        lock(&self.shared.state).bounce
    }

    pub fn set_bounce(&self, bounce: Option<Duration>) -> Result<()> {
        let mut state = self.shared.lock_state()?;
        if state.bounce != bounce {
            state.bounce = bounce;
            self.shared.rearm(&mut state)?;
        }
        Ok(())
    }

    pub fn edges(&self) -> Edges {
        lock(&self.shared.state).edges
    }

    pub fn set_edges(&self, edges: Edges) -> Result<()> {
        let mut state = self.shared.lock_state()?;
        if state.edges != edges {
            state.edges = edges;
            self.shared.rearm(&mut state)?;
        }
        Ok(())
    }

    /// Whether hardware edge detection is currently on.
    pub fn edge_detection_active(&self) -> bool {
        lock(&self.shared.state).edge_detect
    }

    /// Subscribe to edges, or unsubscribe with `None`.
    ///
    /// Only a weak reference is kept; the caller owns the handler. Hardware
    /// edge detection is enabled with the first subscriber and disabled with
    /// `None`. If the backend refuses, the previous subscriber stays in place.
    pub fn set_when_changed(&self, handler: Option<&Arc<dyn EdgeHandler>>) -> Result<()> {
        let mut state = self.shared.lock_state()?;
        // Installed before arming so edges delivered during arming find it.
        let previous = std::mem::replace(
            &mut *lock(&self.shared.handler),
            handler.map(Arc::downgrade),
        );

        let result = match (handler.is_some(), state.edge_detect) {
            (true, false) => self.shared.arm(&mut state),
            (false, true) => self.shared.disarm(&mut state),
            _ => Ok(()),
        };
        if result.is_err() {
            *lock(&self.shared.handler) = previous;
        }
        result
    }

    /// Current backend tick.
    pub fn ticks(&self) -> Result<u64> {
        let line = self.line();
        let mut state = self.shared.lock_state()?;
        Ok(state.handle(line)?.ticks()?)
    }

    /// Clock used to interpret [`Pin::ticks`] and edge ticks.
    pub fn clock(&self) -> TickClock {
        self.shared.clock
    }

    pub fn capabilities(&self) -> Capabilities {
        lock(&self.shared.state).capabilities
    }

    /// Release the line.
    ///
    /// Disables PWM and edge detection, closes the backend handle and frees
    /// the line in the registry. Idempotent, and safe to call from an edge
    /// handler.
    pub fn close(&self) -> Result<()> {
        self.shared.shutdown()
    }

    pub fn downgrade(&self) -> WeakPin {
        WeakPin {
            shared: Arc::downgrade(&self.shared),
        }
    }
}

impl fmt::Debug for Pin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pin")
            .field("line", &self.line())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Non-owning reference to a [`Pin`].
#[derive(Clone, Default)]
pub struct WeakPin {
    shared: Weak<PinShared>,
}

impl WeakPin {
    pub fn upgrade(&self) -> Option<Pin> {
        self.shared.upgrade().map(|shared| Pin { shared })
    }

    /// Whether the pin has been dropped.
    pub fn is_dead(&self) -> bool {
        self.shared.strong_count() == 0
    }
}

impl fmt::Debug for WeakPin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakPin")
            .field("alive", &!self.is_dead())
            .finish()
    }
}
