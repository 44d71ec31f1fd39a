//! Linux GPIO character device adapter built on `gpiocdev`.
//!
//! Edge detection and debounce are configured in the kernel. Events are
//! timestamped with the realtime clock so they can be compared with
//! [`LineHandle::ticks`]. PWM is generated in software.

use gpiocdev::Request;
use gpiocdev::line::{Bias, EdgeDetection, EdgeKind, EventClock, Value};
use pinwire_core::constants::LINE_CONSUMER;
use pinwire_core::{Edges, Level, LineId, Mode, Pull, TickClock};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

use super::softpwm::SoftPwm;
use crate::backend::{Capabilities, EdgeSink, LineConfig, LineHandle, deliver};
use crate::{BackendError, Result};

const EVENT_WAIT: Duration = Duration::from_millis(100);

fn driver_error(e: gpiocdev::Error) -> BackendError {
    BackendError::communication(e.to_string())
}

fn to_value(level: Level) -> Value {
    if level.is_high() {
        Value::Active
    } else {
        Value::Inactive
    }
}

fn to_bias(pull: Pull) -> Bias {
    match pull {
        Pull::Floating => Bias::Disabled,
        Pull::Up => Bias::PullUp,
        Pull::Down => Bias::PullDown,
    }
}

fn to_detection(edges: Edges) -> Option<EdgeDetection> {
    match edges {
        Edges::None => None,
        Edges::Rising => Some(EdgeDetection::RisingEdge),
        Edges::Falling => Some(EdgeDetection::FallingEdge),
        Edges::Both => Some(EdgeDetection::BothEdges),
    }
}

fn realtime_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

/// Factory for lines on one GPIO chip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CdevBackend {
    chip: PathBuf,
}

impl CdevBackend {
    pub fn new(chip: impl Into<PathBuf>) -> Self {
        Self { chip: chip.into() }
    }

    pub fn chip(&self) -> &Path {
        &self.chip
    }

    pub fn is_available(&self) -> bool {
        self.chip.exists()
    }

    pub fn connect(&self, config: &LineConfig) -> Result<CdevLine> {
        let offset = config.line.as_u32();
        let mut builder = Request::builder();
        builder
            .on_chip(&self.chip)
            .with_consumer(LINE_CONSUMER)
            .with_line(offset)
            .with_event_clock(EventClock::Realtime)
            .with_bias(to_bias(config.pull));
        match config.mode {
            Mode::Input => builder.as_input(),
            Mode::Output => builder.as_output(to_value(config.initial)),
        };
        let request = builder
            .request()
            .map_err(|e| BackendError::unavailable("cdev", format!("{}: {e}", self.chip.display())))?;

        info!(line = %config.line, chip = %self.chip.display(), mode = %config.mode, "cdev line requested");
        Ok(CdevLine {
            line: config.line,
            request: Some(Arc::new(request)),
            config: *config,
            pwm: None,
            watcher: None,
        })
    }
}

/// One line requested from a GPIO chip.
#[derive(Debug)]
pub struct CdevLine {
    line: LineId,
    request: Option<Arc<Request>>,
    config: LineConfig,
    pwm: Option<SoftPwm>,
    watcher: Option<Arc<AtomicBool>>,
}

impl CdevLine {
    fn request(&self) -> Result<&Arc<Request>> {
        self.request.as_ref().ok_or(BackendError::Closed)
    }

    fn apply(&self, edges: Option<(Edges, Option<Duration>)>) -> Result<()> {
        let request = self.request()?;
        let offset = self.line.as_u32();
        let mut config = request.config();
        config.with_line(offset).with_bias(to_bias(self.config.pull));
        match self.config.mode {
            Mode::Input => config.as_input(),
            Mode::Output => config.as_output(to_value(self.config.initial)),
        };
        match edges {
            Some((edges, debounce)) => {
                config.with_edge_detection(to_detection(edges));
                if let Some(period) = debounce {
                    config.with_debounce_period(period);
                }
            }
            None => {
                config.with_edge_detection(None::<EdgeDetection>);
            }
        }
        request
            .reconfigure(&config)
            .map(|_| ())
            .map_err(driver_error)
    }

    fn stop_watcher(&mut self) {
        if let Some(stop) = self.watcher.take() {
            stop.store(true, Ordering::Release);
        }
    }
}

impl LineHandle for CdevLine {
    fn line(&self) -> LineId {
        self.line
    }

    fn reconfigure(&mut self, config: &LineConfig) -> Result<()> {
        self.config = *config;
        self.apply(None)
    }

    fn read(&mut self) -> Result<Level> {
        let value = self
            .request()?
            .value(self.line.as_u32())
            .map_err(driver_error)?;
        Ok(Level::from(value == Value::Active))
    }

    fn write(&mut self, level: Level) -> Result<()> {
        if self.config.mode == Mode::Input {
            return Err(BackendError::unsupported("write on an input line"));
        }
        self.request()?
            .set_value(self.line.as_u32(), to_value(level))
            .map_err(driver_error)?;
        Ok(())
    }

    fn set_pwm(&mut self, frequency: Option<u32>) -> Result<()> {
        match (frequency, self.pwm.as_mut()) {
            (Some(hz), Some(pwm)) => pwm.retune(hz),
            (Some(hz), None) => {
                if self.config.mode == Mode::Input {
                    return Err(BackendError::unsupported("PWM on an input line"));
                }
                let request = Arc::clone(self.request()?);
                let offset = self.line.as_u32();
                let writer = Box::new(move |level| {
                    request
                        .set_value(offset, to_value(level))
                        .map(|_| ())
                        .map_err(driver_error)
                });
                self.pwm = Some(SoftPwm::start(self.line, hz, writer)?);
            }
            (None, _) => {
                if let Some(pwm) = self.pwm.take() {
                    pwm.stop();
                    self.write(Level::Low)?;
                }
            }
        }
        Ok(())
    }

    fn set_pwm_duty(&mut self, ratio: f64) -> Result<()> {
        self.pwm
            .as_ref()
            .ok_or_else(|| BackendError::unsupported("duty without PWM enabled"))?
            .set_duty(ratio);
        Ok(())
    }

    fn enable_edge_detect(
        &mut self,
        edges: Edges,
        debounce: Option<Duration>,
        sink: EdgeSink,
    ) -> Result<()> {
        self.stop_watcher();
        self.apply(Some((edges, debounce)))?;

        let request = Arc::clone(self.request()?);
        let stop = Arc::new(AtomicBool::new(false));
        let line = self.line;
        {
            let stop = Arc::clone(&stop);
            thread::Builder::new()
                .name(format!("edge-gpio{line}"))
                .spawn(move || {
                    while !stop.load(Ordering::Acquire) {
                        match request.wait_edge_event(EVENT_WAIT) {
                            Ok(true) => {}
                            Ok(false) => continue,
                            Err(e) => {
                                warn!(line = %line, error = %e, "edge reader stopped");
                                return;
                            }
                        }
                        let event = match request.read_edge_event() {
                            Ok(event) => event,
                            Err(e) => {
                                warn!(line = %line, error = %e, "edge reader stopped");
                                return;
                            }
                        };
                        if stop.load(Ordering::Acquire) {
                            return;
                        }
                        let level = Level::from(event.kind == EdgeKind::Rising);
                        deliver(&sink, edges, event.timestamp_ns, level);
                    }
                })?;
        }

        self.watcher = Some(stop);
        debug!(line = %self.line, edges = %edges, ?debounce, "cdev edge detection enabled");
        Ok(())
    }

    fn disable_edge_detect(&mut self) -> Result<()> {
        if self.watcher.is_some() {
            self.stop_watcher();
            self.apply(None)?;
            debug!(line = %self.line, "cdev edge detection disabled");
        }
        Ok(())
    }

    fn ticks(&mut self) -> Result<u64> {
        Ok(realtime_nanos())
    }

    fn clock(&self) -> TickClock {
        TickClock::nanos64()
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            hardware_pwm: false,
            output_readback: true,
            pull: true,
            native_debounce: true,
        }
    }

    fn close(&mut self) -> Result<()> {
        self.request()?;
        self.stop_watcher();
        if let Some(pwm) = self.pwm.take() {
            pwm.stop();
        }
        self.request = None;
        info!(line = %self.line, "cdev line released");
        Ok(())
    }
}

impl Drop for CdevLine {
    fn drop(&mut self) {
        self.stop_watcher();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_and_pull_mapping() {
        assert_eq!(to_value(Level::High), Value::Active);
        assert_eq!(to_bias(Pull::Up), Bias::PullUp);
        assert_eq!(to_detection(Edges::None), None);
        assert_eq!(to_detection(Edges::Both), Some(EdgeDetection::BothEdges));
    }

    #[test]
    fn test_missing_chip_is_unavailable() {
        let backend = CdevBackend::new("/dev/pinwire-no-such-chip");
        assert!(!backend.is_available());
        assert!(matches!(
            backend.connect(&LineConfig::input(LineId::new(4))),
            Err(BackendError::Unavailable { .. })
        ));
    }
}
