//! Mock GPIO backend for testing and development.
//!
//! This module provides an in-memory backend whose lines can be driven and
//! inspected programmatically. Edges are injected through a
//! [`MockBackendHandle`] and delivered synchronously on the caller's thread,
//! which makes capture and decode tests fully deterministic.

use pinwire_core::{Edges, Level, LineId, Mode, Pull, TickClock};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::backend::{Capabilities, EdgeSink, LineConfig, LineHandle};
use crate::{BackendError, Result, lock};

/// Everything a mock line was asked to do, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum MockEvent {
    Configured { mode: Mode, pull: Pull },
    Wrote(Level),
    Pwm(Option<u32>),
    Duty(f64),
    EdgeDetect(bool),
    Closed,
}

#[derive(Debug)]
struct MockLineState {
    mode: Mode,
    pull: Pull,
    driven: Level,
    external: Level,
    pwm: Option<u32>,
    duty: f64,
    edges: Edges,
    debounce: Option<Duration>,
    sink: Option<EdgeSinkSlot>,
    history: Vec<MockEvent>,
    open: bool,
}

struct EdgeSinkSlot(EdgeSink);

impl std::fmt::Debug for EdgeSinkSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("EdgeSink")
    }
}

#[derive(Debug)]
struct MockState {
    clock: TickClock,
    now: u64,
    lines: HashMap<LineId, MockLineState>,
    connect_failure: Option<String>,
    edge_detect_failure: Option<String>,
    duty_failure: Option<String>,
    output_readback: bool,
    connects: usize,
}

impl MockState {
    fn line_mut(&mut self, line: LineId) -> Result<&mut MockLineState> {
        self.lines
            .get_mut(&line)
            .filter(|state| state.open)
            .ok_or(BackendError::Closed)
    }
}

/// Mock backend factory.
///
/// Cloning the backend shares the simulated hardware.
///
/// # Examples
///
/// ```
/// use pinwire_core::{Level, LineId};
/// use pinwire_hardware::backend::{LineConfig, LineHandle};
/// use pinwire_hardware::mock::MockBackend;
///
/// let (backend, handle) = MockBackend::new();
/// let mut line = backend.connect(&LineConfig::output(LineId::new(17), Level::Low)).unwrap();
///
/// line.write(Level::High).unwrap();
/// assert_eq!(handle.driven_level(LineId::new(17)), Some(Level::High));
/// ```
#[derive(Debug, Clone)]
pub struct MockBackend {
    state: Arc<Mutex<MockState>>,
}

impl MockBackend {
    /// Create a mock backend with a 32-bit microsecond clock.
    ///
    /// Returns a tuple of (MockBackend, MockBackendHandle) where the handle
    /// drives inputs and inspects outputs.
    pub fn new() -> (Self, MockBackendHandle) {
        Self::with_clock(TickClock::micros32())
    }

    /// Create a mock backend counting ticks with `clock`.
    pub fn with_clock(clock: TickClock) -> (Self, MockBackendHandle) {
        let state = Arc::new(Mutex::new(MockState {
            clock,
            now: 0,
            lines: HashMap::new(),
            connect_failure: None,
            edge_detect_failure: None,
            duty_failure: None,
            output_readback: true,
            connects: 0,
        }));

        let handle = MockBackendHandle {
            state: Arc::clone(&state),
        };

        (Self { state }, handle)
    }

    /// Request a line.
    ///
    /// # Errors
    ///
    /// Returns `BackendError::Unavailable` when a connect failure was scripted
    /// through [`MockBackendHandle::set_connect_failure`].
    pub fn connect(&self, config: &LineConfig) -> Result<MockLine> {
        let mut state = lock(&self.state);
        if let Some(reason) = &state.connect_failure {
            return Err(BackendError::unavailable("mock", reason.clone()));
        }
        state.connects += 1;

        let driven = match config.mode {
            Mode::Output => config.initial,
            Mode::Input => Level::Low,
        };
        let external = match config.pull {
            Pull::Up => Level::High,
            Pull::Down | Pull::Floating => Level::Low,
        };
        state.lines.insert(
            config.line,
            MockLineState {
                mode: config.mode,
                pull: config.pull,
                driven,
                external,
                pwm: None,
                duty: 0.0,
                edges: Edges::None,
                debounce: None,
                sink: None,
                history: vec![MockEvent::Configured {
                    mode: config.mode,
                    pull: config.pull,
                }],
                open: true,
            },
        );

        Ok(MockLine {
            line: config.line,
            state: Arc::clone(&self.state),
        })
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new().0
    }
}

/// One line requested from a [`MockBackend`].
#[derive(Debug)]
pub struct MockLine {
    line: LineId,
    state: Arc<Mutex<MockState>>,
}

impl LineHandle for MockLine {
    fn line(&self) -> LineId {
        self.line
    }

    fn reconfigure(&mut self, config: &LineConfig) -> Result<()> {
        let mut state = lock(&self.state);
        let line = state.line_mut(self.line)?;
        line.mode = config.mode;
        line.pull = config.pull;
        if config.mode == Mode::Output {
            line.driven = config.initial;
        } else if config.pull == Pull::Up {
            line.external = Level::High;
        }
        line.history.push(MockEvent::Configured {
            mode: config.mode,
            pull: config.pull,
        });
        Ok(())
    }

    fn read(&mut self) -> Result<Level> {
        let mut state = lock(&self.state);
        let line = state.line_mut(self.line)?;
        Ok(match line.mode {
            Mode::Input => line.external,
            Mode::Output => line.driven,
        })
    }

    fn write(&mut self, level: Level) -> Result<()> {
        let mut state = lock(&self.state);
        let line = state.line_mut(self.line)?;
        if line.mode == Mode::Input {
            return Err(BackendError::unsupported("write on an input line"));
        }
        line.driven = level;
        line.history.push(MockEvent::Wrote(level));
        Ok(())
    }

    fn set_pwm(&mut self, frequency: Option<u32>) -> Result<()> {
        let mut state = lock(&self.state);
        let line = state.line_mut(self.line)?;
        line.pwm = frequency;
        if frequency.is_none() {
            line.duty = 0.0;
            line.driven = Level::Low;
        }
        line.history.push(MockEvent::Pwm(frequency));
        Ok(())
    }

    fn set_pwm_duty(&mut self, ratio: f64) -> Result<()> {
        let mut state = lock(&self.state);
        if let Some(reason) = &state.duty_failure {
            return Err(BackendError::communication(reason.clone()));
        }
        let line = state.line_mut(self.line)?;
        if line.pwm.is_none() {
            return Err(BackendError::unsupported("duty without PWM enabled"));
        }
        line.duty = ratio;
        line.history.push(MockEvent::Duty(ratio));
        Ok(())
    }

    fn enable_edge_detect(
        &mut self,
        edges: Edges,
        debounce: Option<Duration>,
        sink: EdgeSink,
    ) -> Result<()> {
        let mut state = lock(&self.state);
        if let Some(reason) = &state.edge_detect_failure {
            return Err(BackendError::communication(reason.clone()));
        }
        let line = state.line_mut(self.line)?;
        line.edges = edges;
        line.debounce = debounce;
        line.sink = Some(EdgeSinkSlot(sink));
        line.history.push(MockEvent::EdgeDetect(true));
        Ok(())
    }

    fn disable_edge_detect(&mut self) -> Result<()> {
        let mut state = lock(&self.state);
        let line = state.line_mut(self.line)?;
        if line.sink.take().is_some() {
            line.history.push(MockEvent::EdgeDetect(false));
        }
        Ok(())
    }

    fn ticks(&mut self) -> Result<u64> {
        Ok(lock(&self.state).now)
    }

    fn clock(&self) -> TickClock {
        lock(&self.state).clock
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            hardware_pwm: true,
            output_readback: lock(&self.state).output_readback,
            pull: true,
            native_debounce: true,
        }
    }

    fn close(&mut self) -> Result<()> {
        let mut state = lock(&self.state);
        let line = state.line_mut(self.line)?;
        line.sink = None;
        line.open = false;
        line.history.push(MockEvent::Closed);
        Ok(())
    }
}

/// Handle for driving and inspecting a mock backend.
///
/// The handle can be cloned and shared across threads.
#[derive(Debug, Clone)]
pub struct MockBackendHandle {
    state: Arc<Mutex<MockState>>,
}

impl MockBackendHandle {
    /// Advance the clock by `after`, set the external level of `line` and
    /// deliver the edge if detection is enabled and the filter accepts it.
    ///
    /// The level is not compared with the previous one, so repeated levels
    /// (a dropped transition) can be simulated. Returns whether a sink was
    /// called.
    pub fn emit(&self, line: LineId, level: Level, after: Duration) -> bool {
        let delivery = {
            let mut state = lock(&self.state);
            state.now = state.clock.advance(state.now, after);
            let tick = state.now;
            match state.lines.get_mut(&line) {
                Some(line_state) if line_state.open => {
                    line_state.external = level;
                    line_state
                        .sink
                        .as_ref()
                        .map(|slot| (Arc::clone(&slot.0), line_state.edges, tick))
                }
                _ => None,
            }
        };

        match delivery {
            Some((sink, edges, tick)) if edges.accepts(level) => {
                sink(tick, level);
                true
            }
            _ => false,
        }
    }

    /// Emit a sequence of `(level, delay before the edge)` pairs.
    pub fn emit_all(&self, line: LineId, edges: &[(Level, Duration)]) -> usize {
        edges
            .iter()
            .filter(|(level, after)| self.emit(line, *level, *after))
            .count()
    }

    /// Set the external level of an input without generating an edge.
    pub fn set_input(&self, line: LineId, level: Level) {
        let mut state = lock(&self.state);
        if let Some(line_state) = state.lines.get_mut(&line) {
            line_state.external = level;
        }
    }

    /// Advance the clock without generating an edge.
    pub fn advance(&self, duration: Duration) {
        let mut state = lock(&self.state);
        state.now = state.clock.advance(state.now, duration);
    }

    /// Jump the clock to a raw tick value, e.g. just before a wrap.
    pub fn set_ticks(&self, tick: u64) {
        let mut state = lock(&self.state);
        state.now = tick & state.clock.max_tick();
    }

    pub fn ticks(&self) -> u64 {
        lock(&self.state).now
    }

    /// Make every following connect fail with `reason`, or succeed again with `None`.
    pub fn set_connect_failure(&self, reason: Option<&str>) {
        lock(&self.state).connect_failure = reason.map(str::to_string);
    }

    /// Make enabling edge detection fail with `reason` until cleared with `None`.
    pub fn set_edge_detect_failure(&self, reason: Option<&str>) {
        lock(&self.state).edge_detect_failure = reason.map(str::to_string);
    }

    /// Make duty updates fail with `reason` until cleared with `None`.
    pub fn set_duty_failure(&self, reason: Option<&str>) {
        lock(&self.state).duty_failure = reason.map(str::to_string);
    }

    /// Control whether reading an output returns the driven level.
    pub fn set_output_readback(&self, supported: bool) {
        lock(&self.state).output_readback = supported;
    }

    /// Number of successful connects so far.
    pub fn connect_count(&self) -> usize {
        lock(&self.state).connects
    }

    pub fn history(&self, line: LineId) -> Vec<MockEvent> {
        self.inspect(line, |state| state.history.clone())
            .unwrap_or_default()
    }

    /// Levels written to `line` in order.
    pub fn writes(&self, line: LineId) -> Vec<Level> {
        self.history(line)
            .into_iter()
            .filter_map(|event| match event {
                MockEvent::Wrote(level) => Some(level),
                _ => None,
            })
            .collect()
    }

    pub fn driven_level(&self, line: LineId) -> Option<Level> {
        self.inspect(line, |state| state.driven)
    }

    pub fn mode(&self, line: LineId) -> Option<Mode> {
        self.inspect(line, |state| state.mode)
    }

    pub fn pull(&self, line: LineId) -> Option<Pull> {
        self.inspect(line, |state| state.pull)
    }

    pub fn pwm_frequency(&self, line: LineId) -> Option<u32> {
        self.inspect(line, |state| state.pwm).flatten()
    }

    pub fn pwm_duty(&self, line: LineId) -> Option<f64> {
        self.inspect(line, |state| state.pwm.map(|_| state.duty))
            .flatten()
    }

    pub fn edge_detect_enabled(&self, line: LineId) -> bool {
        self.inspect(line, |state| state.open && state.sink.is_some())
            .unwrap_or(false)
    }

    pub fn edge_filter(&self, line: LineId) -> Option<Edges> {
        self.inspect(line, |state| state.edges)
    }

    pub fn debounce(&self, line: LineId) -> Option<Duration> {
        self.inspect(line, |state| state.debounce).flatten()
    }

    /// Whether `line` is currently requested.
    pub fn is_open(&self, line: LineId) -> bool {
        self.inspect(line, |state| state.open).unwrap_or(false)
    }

    fn inspect<T>(&self, line: LineId, f: impl FnOnce(&MockLineState) -> T) -> Option<T> {
        lock(&self.state).lines.get(&line).map(f)
    }
}
