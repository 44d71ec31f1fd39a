//! Legacy sysfs GPIO adapter (`/sys/class/gpio`).
//!
//! Lines are exported on connect and unexported on close when this adapter
//! did the export. Edges are detected by polling the `value` file from a
//! dedicated thread; ticks are nanoseconds since the line was connected.
//! PWM is generated in software.

use pinwire_core::constants::SYSFS_POLL_INTERVAL_US;
use pinwire_core::{Edges, Level, LineId, Mode, Pull, TickClock};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::softpwm::SoftPwm;
use crate::backend::{Capabilities, EdgeSink, LineConfig, LineHandle, deliver};
use crate::{BackendError, Result};

const EXPORT_TIMEOUT: Duration = Duration::from_millis(500);

/// Factory for sysfs lines rooted at a GPIO class directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SysfsBackend {
    root: PathBuf,
}

impl SysfsBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Whether the GPIO class directory exists.
    pub fn is_available(&self) -> bool {
        self.root.is_dir()
    }

    /// Export (if needed) and configure a line.
    pub fn connect(&self, config: &LineConfig) -> Result<SysfsLine> {
        if !self.is_available() {
            return Err(BackendError::unavailable(
                "sysfs",
                format!("{} not found", self.root.display()),
            ));
        }

        let dir = self.root.join(format!("gpio{}", config.line));
        let exported = if dir.exists() {
            false
        } else {
            fs::write(self.root.join("export"), config.line.to_string())?;
            wait_for_export(&dir)?;
            true
        };

        let mut line = SysfsLine {
            line: config.line,
            root: self.root.clone(),
            dir,
            exported,
            mode: config.mode,
            epoch: Instant::now(),
            pwm: None,
            watcher: None,
            closed: false,
        };
        line.apply(config)?;

        info!(line = %config.line, mode = %config.mode, exported, "sysfs line connected");
        Ok(line)
    }
}

fn wait_for_export(dir: &Path) -> Result<()> {
    let deadline = Instant::now() + EXPORT_TIMEOUT;
    while !dir.exists() {
        if Instant::now() >= deadline {
            return Err(BackendError::unavailable(
                "sysfs",
                format!("{} did not appear after export", dir.display()),
            ));
        }
        thread::sleep(Duration::from_millis(5));
    }
    Ok(())
}

fn read_level(path: &Path) -> Result<Level> {
    let raw = fs::read_to_string(path)?;
    match raw.trim() {
        "0" => Ok(Level::Low),
        "1" => Ok(Level::High),
        other => Err(BackendError::invalid_data(format!(
            "unexpected value '{other}' in {}",
            path.display()
        ))),
    }
}

fn write_level(path: &Path, level: Level) -> Result<()> {
    fs::write(path, if level.is_high() { "1" } else { "0" })?;
    Ok(())
}

/// One exported sysfs line.
#[derive(Debug)]
pub struct SysfsLine {
    line: LineId,
    root: PathBuf,
    dir: PathBuf,
    exported: bool,
    mode: Mode,
    epoch: Instant,
    pwm: Option<SoftPwm>,
    watcher: Option<Arc<AtomicBool>>,
    closed: bool,
}

impl SysfsLine {
    fn value_path(&self) -> PathBuf {
        self.dir.join("value")
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            Err(BackendError::Closed)
        } else {
            Ok(())
        }
    }

    fn apply(&mut self, config: &LineConfig) -> Result<()> {
        let direction = match (config.mode, config.initial) {
            (Mode::Input, _) => "in",
            (Mode::Output, Level::High) => "high",
            (Mode::Output, Level::Low) => "low",
        };
        fs::write(self.dir.join("direction"), direction)?;
        if config.pull != Pull::Floating {
            warn!(line = %self.line, pull = %config.pull, "sysfs cannot configure pull resistors, ignoring");
        }
        self.mode = config.mode;
        Ok(())
    }

    fn stop_watcher(&mut self) {
        if let Some(stop) = self.watcher.take() {
            stop.store(true, Ordering::Release);
        }
    }
}

impl LineHandle for SysfsLine {
    fn line(&self) -> LineId {
        self.line
    }

    fn reconfigure(&mut self, config: &LineConfig) -> Result<()> {
        self.ensure_open()?;
        self.apply(config)
    }

    fn read(&mut self) -> Result<Level> {
        self.ensure_open()?;
        read_level(&self.value_path())
    }

    fn write(&mut self, level: Level) -> Result<()> {
        self.ensure_open()?;
        if self.mode == Mode::Input {
            return Err(BackendError::unsupported("write on an input line"));
        }
        write_level(&self.value_path(), level)
    }

    fn set_pwm(&mut self, frequency: Option<u32>) -> Result<()> {
        self.ensure_open()?;
        match (frequency, self.pwm.as_mut()) {
            (Some(hz), Some(pwm)) => pwm.retune(hz),
            (Some(hz), None) => {
                if self.mode == Mode::Input {
                    return Err(BackendError::unsupported("PWM on an input line"));
                }
                let path = self.value_path();
                let writer = Box::new(move |level| write_level(&path, level));
                self.pwm = Some(SoftPwm::start(self.line, hz, writer)?);
            }
            (None, _) => {
                if let Some(pwm) = self.pwm.take() {
                    pwm.stop();
                    write_level(&self.value_path(), Level::Low)?;
                }
            }
        }
        Ok(())
    }

    fn set_pwm_duty(&mut self, ratio: f64) -> Result<()> {
        self.ensure_open()?;
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
        self.ensure_open()?;
        self.stop_watcher();

        if let Err(e) = fs::write(self.dir.join("edge"), edges.to_string()) {
            debug!(line = %self.line, error = %e, "edge file not writable, polling only");
        }

        let stop = Arc::new(AtomicBool::new(false));
        let path = self.value_path();
        let epoch = self.epoch;
        let line = self.line;
        {
            let stop = Arc::clone(&stop);
            thread::Builder::new()
                .name(format!("edge-gpio{line}"))
                .spawn(move || {
                    let poll = Duration::from_micros(SYSFS_POLL_INTERVAL_US);
                    let mut last = read_level(&path).ok();
                    let mut last_accepted: Option<Instant> = None;

                    while !stop.load(Ordering::Acquire) {
                        thread::sleep(poll);
                        let level = match read_level(&path) {
                            Ok(level) => level,
                            // partially written value file
                            Err(BackendError::InvalidData { .. }) => continue,
                            Err(e) => {
                                warn!(line = %line, error = %e, "edge watcher stopped");
                                return;
                            }
                        };
                        if last == Some(level) {
                            continue;
                        }
                        last = Some(level);

                        let now = Instant::now();
                        if let (Some(bounce), Some(previous)) = (debounce, last_accepted)
                            && now.duration_since(previous) < bounce
                        {
                            continue;
                        }
                        last_accepted = Some(now);

                        let tick =
                            u64::try_from(now.duration_since(epoch).as_nanos()).unwrap_or(u64::MAX);
                        deliver(&sink, edges, tick, level);
                    }
                })?;
        }

        self.watcher = Some(stop);
        debug!(line = %self.line, edges = %edges, ?debounce, "sysfs edge detection enabled");
        Ok(())
    }

    fn disable_edge_detect(&mut self) -> Result<()> {
        self.ensure_open()?;
        if self.watcher.is_some() {
            self.stop_watcher();
            if let Err(e) = fs::write(self.dir.join("edge"), "none") {
                debug!(line = %self.line, error = %e, "edge file not writable");
            }
            debug!(line = %self.line, "sysfs edge detection disabled");
        }
        Ok(())
    }

    fn ticks(&mut self) -> Result<u64> {
        Ok(u64::try_from(self.epoch.elapsed().as_nanos()).unwrap_or(u64::MAX))
    }

    fn clock(&self) -> TickClock {
        TickClock::nanos64()
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            hardware_pwm: false,
            output_readback: true,
            pull: false,
            native_debounce: false,
        }
    }

    fn close(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.stop_watcher();
        if let Some(pwm) = self.pwm.take() {
            pwm.stop();
        }
        self.closed = true;

        if self.exported {
            fs::write(self.root.join("unexport"), self.line.to_string())?;
        }
        info!(line = %self.line, "sysfs line closed");
        Ok(())
    }
}

impl Drop for SysfsLine {
    fn drop(&mut self) {
        self.stop_watcher();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use tempfile::TempDir;

    fn fake_root(line: u32) -> TempDir {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join(format!("gpio{line}"));
        fs::create_dir(&dir).unwrap();
        fs::write(dir.join("direction"), "in").unwrap();
        fs::write(dir.join("value"), "0\n").unwrap();
        fs::write(dir.join("edge"), "none").unwrap();
        root
    }

    fn direction(root: &TempDir, line: u32) -> String {
        fs::read_to_string(root.path().join(format!("gpio{line}/direction"))).unwrap()
    }

    fn value(root: &TempDir, line: u32) -> String {
        fs::read_to_string(root.path().join(format!("gpio{line}/value")))
            .unwrap()
            .trim()
            .to_string()
    }

    #[test]
    fn test_missing_root_is_unavailable() {
        let backend = SysfsBackend::new("/nonexistent/pinwire/gpio");
        let result = backend.connect(&LineConfig::input(LineId::new(4)));
        assert!(matches!(result, Err(BackendError::Unavailable { .. })));
    }

    #[test]
    fn test_output_initial_level_and_write() {
        let root = fake_root(17);
        let backend = SysfsBackend::new(root.path());
        let mut line = backend
            .connect(&LineConfig::output(LineId::new(17), Level::High))
            .unwrap();

        assert_eq!(direction(&root, 17), "high");

        line.write(Level::High).unwrap();
        assert_eq!(value(&root, 17), "1");
        assert_eq!(line.read().unwrap(), Level::High);

        line.write(Level::Low).unwrap();
        assert_eq!(value(&root, 17), "0");
    }

    #[test]
    fn test_input_reads_value_file() {
        let root = fake_root(4);
        let backend = SysfsBackend::new(root.path());
        let mut line = backend.connect(&LineConfig::input(LineId::new(4))).unwrap();

        assert_eq!(direction(&root, 4), "in");
        fs::write(root.path().join("gpio4/value"), "1\n").unwrap();
        assert_eq!(line.read().unwrap(), Level::High);
        assert!(line.write(Level::High).is_err());
    }

    #[test]
    fn test_invalid_value_content() {
        let root = fake_root(4);
        let backend = SysfsBackend::new(root.path());
        let mut line = backend.connect(&LineConfig::input(LineId::new(4))).unwrap();

        fs::write(root.path().join("gpio4/value"), "x").unwrap();
        assert!(matches!(line.read(), Err(BackendError::InvalidData { .. })));
    }

    #[test]
    fn test_polled_edge_delivery() {
        let root = fake_root(4);
        let backend = SysfsBackend::new(root.path());
        let mut line = backend.connect(&LineConfig::input(LineId::new(4))).unwrap();

        let (tx, rx) = mpsc::channel();
        let sink: EdgeSink = Arc::new(move |tick, level| {
            let _ = tx.send((tick, level));
        });
        line.enable_edge_detect(Edges::Both, None, sink).unwrap();
        assert_eq!(
            fs::read_to_string(root.path().join("gpio4/edge")).unwrap(),
            "both"
        );

        thread::sleep(Duration::from_millis(10));
        fs::write(root.path().join("gpio4/value"), "1\n").unwrap();

        let (tick, level) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(level, Level::High);
        assert!(tick > 0);

        line.disable_edge_detect().unwrap();
        assert_eq!(
            fs::read_to_string(root.path().join("gpio4/edge")).unwrap(),
            "none"
        );
    }

    #[test]
    fn test_software_pwm_disable_drives_low() {
        let root = fake_root(18);
        let backend = SysfsBackend::new(root.path());
        let mut line = backend
            .connect(&LineConfig::output(LineId::new(18), Level::Low))
            .unwrap();

        line.set_pwm(Some(500)).unwrap();
        line.set_pwm_duty(0.5).unwrap();
        line.set_pwm(Some(1_000)).unwrap();
        thread::sleep(Duration::from_millis(5));
        line.set_pwm(None).unwrap();

        assert_eq!(value(&root, 18), "0");
        assert!(line.set_pwm_duty(0.5).is_err());
    }

    #[test]
    fn test_close_then_operations_fail() {
        let root = fake_root(4);
        let backend = SysfsBackend::new(root.path());
        let mut line = backend.connect(&LineConfig::input(LineId::new(4))).unwrap();

        line.close().unwrap();
        assert!(matches!(line.read(), Err(BackendError::Closed)));
        assert!(!root.path().join("unexport").exists());
    }
}
