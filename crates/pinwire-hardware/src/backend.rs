//! Backend driver contract.
//!
//! Every physical GPIO driver is wrapped in an adapter implementing
//! [`LineHandle`]. A handle owns exactly one line for its lifetime and is
//! released through [`LineHandle::close`].
//!
//! # Edge delivery
//!
//! Edge notifications are delivered through an [`EdgeSink`] on a thread owned
//! by the backend (a notification reader, a poll loop, or the caller's thread
//! for the mock). Sinks receive the raw backend tick and the level the line
//! changed to. Adapters never hold their own locks while calling a sink, and
//! [`LineHandle::disable_edge_detect`] never joins the delivery thread, so it
//! is safe to call from inside a sink.
//!
//! # Ticks
//!
//! Tick units are local to each backend and are only comparable through the
//! backend's [`TickClock`].

use pinwire_core::{Edges, Level, LineId, Mode, Pull, TickClock};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::Result;

/// Callback invoked by a backend for every accepted edge.
pub type EdgeSink = Arc<dyn Fn(u64, Level) + Send + Sync>;

/// Hardware configuration applied when a line is requested or reconfigured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineConfig {
    pub line: LineId,
    pub mode: Mode,
    pub pull: Pull,
    /// Level driven immediately when the line is an output.
    pub initial: Level,
}

impl LineConfig {
    pub fn input(line: LineId) -> Self {
        Self {
            line,
            mode: Mode::Input,
            pull: Pull::Floating,
            initial: Level::Low,
        }
    }

    pub fn output(line: LineId, initial: Level) -> Self {
        Self {
            line,
            mode: Mode::Output,
            pull: Pull::Floating,
            initial,
        }
    }

    pub fn with_pull(mut self, pull: Pull) -> Self {
        self.pull = pull;
        self
    }
}

/// What a backend adapter can do natively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Capabilities {
    /// PWM is generated by a hardware or daemon timer rather than a thread.
    pub hardware_pwm: bool,
    /// Reading an output line returns the driven level.
    pub output_readback: bool,
    /// Pull resistors can be configured.
    pub pull: bool,
    /// Debounce is applied by the driver rather than in software.
    pub native_debounce: bool,
}

/// Operations every backend adapter provides for one requested line.
pub trait LineHandle: Send {
    /// Line owned by this handle.
    fn line(&self) -> LineId;

    /// Apply a new direction, pull or initial level without releasing the line.
    fn reconfigure(&mut self, config: &LineConfig) -> Result<()>;

    fn read(&mut self) -> Result<Level>;

    fn write(&mut self, level: Level) -> Result<()>;

    /// Enable PWM at `frequency` Hz, retune it if already enabled, or disable
    /// it with `None`. Disabling leaves the line driven low.
    fn set_pwm(&mut self, frequency: Option<u32>) -> Result<()>;

    /// Set the PWM duty ratio (`0.0..=1.0`). PWM must be enabled.
    fn set_pwm_duty(&mut self, ratio: f64) -> Result<()>;

    /// Start delivering edges matching `edges` to `sink`.
    ///
    /// Replaces any sink registered before.
    fn enable_edge_detect(
        &mut self,
        edges: Edges,
        debounce: Option<Duration>,
        sink: EdgeSink,
    ) -> Result<()>;

    /// Stop edge delivery. A no-op when detection is not active.
    fn disable_edge_detect(&mut self) -> Result<()>;

    /// Current value of the backend's monotonic tick counter.
    fn ticks(&mut self) -> Result<u64>;

    fn clock(&self) -> TickClock;

    fn capabilities(&self) -> Capabilities;

    /// Release the line. Further operations fail with [`BackendError::Closed`].
    ///
    /// [`BackendError::Closed`]: crate::BackendError::Closed
    fn close(&mut self) -> Result<()>;
}

/// Drop a sink call for levels the edge filter rejects.
pub(crate) fn deliver(sink: &EdgeSink, edges: Edges, tick: u64, level: Level) {
    if edges.accepts(level) {
        sink(tick, level);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_line_config_builders() {
        let config = LineConfig::input(LineId::new(4)).with_pull(Pull::Up);
        assert_eq!(config.mode, Mode::Input);
        assert_eq!(config.pull, Pull::Up);

        let config = LineConfig::output(LineId::new(17), Level::High);
        assert_eq!(config.mode, Mode::Output);
        assert_eq!(config.initial, Level::High);
    }

    #[test]
    fn test_deliver_applies_edge_filter() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink: EdgeSink = {
            let seen = Arc::clone(&seen);
            Arc::new(move |tick, level| seen.lock().unwrap().push((tick, level)))
        };

        deliver(&sink, Edges::Rising, 1, Level::High);
        deliver(&sink, Edges::Rising, 2, Level::Low);
        deliver(&sink, Edges::None, 3, Level::High);

        assert_eq!(*seen.lock().unwrap(), vec![(1, Level::High)]);
    }

    #[test]
    fn test_line_config_serialization() {
        let config = LineConfig::output(LineId::new(22), Level::Low);
        let json = serde_json::to_string(&config).unwrap();
        let back: LineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config, back);
    }
}
