//! Enum wrappers for backend dispatch.
//!
//! A [`Backend`] is selected at runtime from a [`BackendConfig`] and hands out
//! [`AnyLine`] handles. Both are plain enums over the concrete adapters, so
//! adding a backend means adding a variant, not a trait object.
//!
//! # Examples
//!
//! ```
//! use pinwire_core::{Level, LineId};
//! use pinwire_hardware::backend::{LineConfig, LineHandle};
//! use pinwire_hardware::devices::Backend;
//! use pinwire_hardware::mock::MockBackend;
//!
//! let (mock, _handle) = MockBackend::new();
//! let backend = Backend::Mock(mock);
//!
//! let mut line = backend.connect(&LineConfig::output(LineId::new(17), Level::Low)).unwrap();
//! line.write(Level::High).unwrap();
//! ```

use pinwire_core::constants::{
    DEFAULT_DAEMON_HOST, DEFAULT_DAEMON_PORT, DEFAULT_GPIO_CHIP, DEFAULT_SYSFS_ROOT,
    DEVICE_TREE_MODEL_PATH, PI5_GPIO_CHIP,
};
use pinwire_core::{Edges, Level, LineId, TickClock};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

#[cfg(feature = "backend-cdev")]
use crate::backends::{CdevBackend, CdevLine};
use crate::backend::{Capabilities, EdgeSink, LineConfig, LineHandle};
use crate::backends::{DaemonBackend, DaemonLine, SysfsBackend, SysfsLine};
use crate::mock::{MockBackend, MockLine};
use crate::{BackendError, Result};

/// Which backend to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Interface {
    /// Try the daemon, then the character device, then sysfs.
    #[default]
    Auto,
    Daemon,
    Sysfs,
    Cdev,
    Mock,
}

impl fmt::Display for Interface {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Interface::Auto => "auto",
            Interface::Daemon => "daemon",
            Interface::Sysfs => "sysfs",
            Interface::Cdev => "cdev",
            Interface::Mock => "mock",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for Interface {
    type Err = BackendError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(Interface::Auto),
            "daemon" | "pigpio" => Ok(Interface::Daemon),
            "sysfs" => Ok(Interface::Sysfs),
            "cdev" | "gpiod" => Ok(Interface::Cdev),
            "mock" => Ok(Interface::Mock),
            other => Err(BackendError::configuration(format!(
                "unknown interface '{other}'"
            ))),
        }
    }
}

/// Backend selection and connection settings.
///
/// Every field has a default, so partial JSON documents are accepted:
///
/// ```
/// use pinwire_hardware::devices::{BackendConfig, Interface};
///
/// let config: BackendConfig = serde_json::from_str(r#"{"interface": "daemon", "daemon_port": 9999}"#).unwrap();
/// assert_eq!(config.interface, Interface::Daemon);
/// assert_eq!(config.daemon_host, "localhost");
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub interface: Interface,
    pub daemon_host: String,
    pub daemon_port: u16,
    /// Connect timeout for the daemon, in milliseconds.
    pub daemon_timeout_ms: u64,
    /// Character device to use; detected from the board model when unset.
    pub chip: Option<PathBuf>,
    pub sysfs_root: PathBuf,
    /// Device tree file consulted for board detection.
    pub model_path: PathBuf,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            interface: Interface::Auto,
            daemon_host: DEFAULT_DAEMON_HOST.to_string(),
            daemon_port: DEFAULT_DAEMON_PORT,
            daemon_timeout_ms: 1_000,
            chip: None,
            sysfs_root: PathBuf::from(DEFAULT_SYSFS_ROOT),
            model_path: PathBuf::from(DEVICE_TREE_MODEL_PATH),
        }
    }
}

impl BackendConfig {
    pub fn with_interface(mut self, interface: Interface) -> Self {
        self.interface = interface;
        self
    }

    pub fn with_daemon(mut self, host: impl Into<String>, port: u16) -> Self {
        self.daemon_host = host.into();
        self.daemon_port = port;
        self
    }

    pub fn with_chip(mut self, chip: impl Into<PathBuf>) -> Self {
        self.chip = Some(chip.into());
        self
    }

    pub fn with_sysfs_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.sysfs_root = root.into();
        self
    }

    pub fn with_model_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.model_path = path.into();
        self
    }

    /// Character device to request lines from.
    ///
    /// An explicit chip wins. Otherwise a Raspberry Pi 5 (identified by the
    /// device tree model) uses its RP1 header chip, everything else chip 0.
    pub fn resolve_chip(&self) -> PathBuf {
        if let Some(chip) = &self.chip {
            return chip.clone();
        }
        if is_raspberry_pi_5(&self.model_path) {
            PathBuf::from(PI5_GPIO_CHIP)
        } else {
            PathBuf::from(DEFAULT_GPIO_CHIP)
        }
    }

    fn daemon(&self) -> DaemonBackend {
        DaemonBackend::new(&self.daemon_host, self.daemon_port)
            .with_timeout(Duration::from_millis(self.daemon_timeout_ms))
    }
}

fn is_raspberry_pi_5(model_path: &Path) -> bool {
    fs::read_to_string(model_path)
        .map(|model| model.trim_end_matches('\0').contains("Raspberry Pi 5"))
        .unwrap_or(false)
}

/// Backend factory dispatch.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum Backend {
    Daemon(DaemonBackend),
    Sysfs(SysfsBackend),
    #[cfg(feature = "backend-cdev")]
    Cdev(CdevBackend),
    Mock(MockBackend),
}

impl Backend {
    /// Build the backend named by `config`, probing when the interface is `auto`.
    ///
    /// # Errors
    ///
    /// Returns `BackendError::Unavailable` when auto-detection finds nothing
    /// or the requested backend was compiled out.
    pub fn from_config(config: &BackendConfig) -> Result<Self> {
        match config.interface {
            Interface::Daemon => Ok(Backend::Daemon(config.daemon())),
            Interface::Sysfs => Ok(Backend::Sysfs(SysfsBackend::new(&config.sysfs_root))),
            Interface::Cdev => Self::cdev(config),
            Interface::Mock => Ok(Backend::Mock(MockBackend::default())),
            Interface::Auto => Self::detect(config),
        }
    }

    #[cfg(feature = "backend-cdev")]
    fn cdev(config: &BackendConfig) -> Result<Self> {
        Ok(Backend::Cdev(CdevBackend::new(config.resolve_chip())))
    }

    #[cfg(not(feature = "backend-cdev"))]
    fn cdev(_config: &BackendConfig) -> Result<Self> {
        Err(BackendError::unavailable(
            "cdev",
            "built without the backend-cdev feature",
        ))
    }

    fn detect(config: &BackendConfig) -> Result<Self> {
        let daemon = config.daemon();
        if daemon.is_available() {
            info!(addr = daemon.addr(), "Using GPIO daemon backend");
            return Ok(Backend::Daemon(daemon));
        }
        warn!(addr = daemon.addr(), "GPIO daemon not reachable, trying character device");

        #[cfg(feature = "backend-cdev")]
        {
            let cdev = CdevBackend::new(config.resolve_chip());
            if cdev.is_available() {
                info!(chip = %cdev.chip().display(), "Using character device backend");
                return Ok(Backend::Cdev(cdev));
            }
            warn!(chip = %cdev.chip().display(), "GPIO chip not found, trying sysfs");
        }

        let sysfs = SysfsBackend::new(&config.sysfs_root);
        if sysfs.is_available() {
            info!(root = %sysfs.root().display(), "Using sysfs backend");
            return Ok(Backend::Sysfs(sysfs));
        }

        Err(BackendError::unavailable(
            "auto",
            "no GPIO backend detected",
        ))
    }

    pub fn name(&self) -> &'static str {
        match self {
            Backend::Daemon(_) => "daemon",
            Backend::Sysfs(_) => "sysfs",
            #[cfg(feature = "backend-cdev")]
            Backend::Cdev(_) => "cdev",
            Backend::Mock(_) => "mock",
        }
    }

    /// Request one line.
    pub fn connect(&self, config: &LineConfig) -> Result<AnyLine> {
        match self {
            Backend::Daemon(backend) => backend.connect(config).map(AnyLine::Daemon),
            Backend::Sysfs(backend) => backend.connect(config).map(AnyLine::Sysfs),
            #[cfg(feature = "backend-cdev")]
            Backend::Cdev(backend) => backend.connect(config).map(AnyLine::Cdev),
            Backend::Mock(backend) => backend.connect(config).map(AnyLine::Mock),
        }
    }
}

impl From<MockBackend> for Backend {
    fn from(backend: MockBackend) -> Self {
        Backend::Mock(backend)
    }
}

/// Line handle dispatch.
#[derive(Debug)]
#[non_exhaustive]
pub enum AnyLine {
    Daemon(DaemonLine),
    Sysfs(SysfsLine),
    #[cfg(feature = "backend-cdev")]
    Cdev(CdevLine),
    Mock(MockLine),
}

macro_rules! dispatch {
    ($self:expr, $line:ident => $body:expr) => {
        match $self {
            AnyLine::Daemon($line) => $body,
            AnyLine::Sysfs($line) => $body,
            #[cfg(feature = "backend-cdev")]
            AnyLine::Cdev($line) => $body,
            AnyLine::Mock($line) => $body,
        }
    };
}

impl LineHandle for AnyLine {
    fn line(&self) -> LineId {
        dispatch!(self, line => line.line())
    }

    fn reconfigure(&mut self, config: &LineConfig) -> Result<()> {
        dispatch!(self, line => line.reconfigure(config))
    }

    fn read(&mut self) -> Result<Level> {
        dispatch!(self, line => line.read())
    }

    fn write(&mut self, level: Level) -> Result<()> {
        dispatch!(self, line => line.write(level))
    }

    fn set_pwm(&mut self, frequency: Option<u32>) -> Result<()> {
        dispatch!(self, line => line.set_pwm(frequency))
    }

    fn set_pwm_duty(&mut self, ratio: f64) -> Result<()> {
        dispatch!(self, line => line.set_pwm_duty(ratio))
    }

    fn enable_edge_detect(
        &mut self,
        edges: Edges,
        debounce: Option<Duration>,
        sink: EdgeSink,
    ) -> Result<()> {
        dispatch!(self, line => line.enable_edge_detect(edges, debounce, sink))
    }

    fn disable_edge_detect(&mut self) -> Result<()> {
        dispatch!(self, line => line.disable_edge_detect())
    }

    fn ticks(&mut self) -> Result<u64> {
        dispatch!(self, line => line.ticks())
    }

    fn clock(&self) -> TickClock {
        dispatch!(self, line => line.clock())
    }

    fn capabilities(&self) -> Capabilities {
        dispatch!(self, line => line.capabilities())
    }

    fn close(&mut self) -> Result<()> {
        dispatch!(self, line => line.close())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("auto", Interface::Auto)]
    #[case("pigpio", Interface::Daemon)]
    #[case("gpiod", Interface::Cdev)]
    #[case("SYSFS", Interface::Sysfs)]
    #[case("mock", Interface::Mock)]
    fn test_interface_from_str(#[case] input: &str, #[case] expected: Interface) {
        assert_eq!(input.parse::<Interface>().unwrap(), expected);
    }

    #[test]
    fn test_unknown_interface() {
        assert!(matches!(
            "rpigpio".parse::<Interface>(),
            Err(BackendError::Configuration { .. })
        ));
    }

    #[test]
    fn test_config_json_round_trip() {
        let config = BackendConfig::default()
            .with_interface(Interface::Sysfs)
            .with_sysfs_root("/tmp/gpio");
        let json = serde_json::to_string(&config).unwrap();
        let back: BackendConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config, back);
    }

    #[test]
    fn test_resolve_chip_pi5() {
        let dir = tempfile::tempdir().unwrap();
        let model = dir.path().join("model");
        fs::write(&model, "Raspberry Pi 5 Model B Rev 1.0\0").unwrap();

        let config = BackendConfig::default().with_model_path(&model);
        assert_eq!(config.resolve_chip(), PathBuf::from(PI5_GPIO_CHIP));

        fs::write(&model, "Raspberry Pi 4 Model B Rev 1.4\0").unwrap();
        assert_eq!(config.resolve_chip(), PathBuf::from(DEFAULT_GPIO_CHIP));
    }

    #[test]
    fn test_resolve_chip_explicit_wins() {
        let config = BackendConfig::default()
            .with_model_path("/nonexistent/model")
            .with_chip("/dev/gpiochip2");
        assert_eq!(config.resolve_chip(), PathBuf::from("/dev/gpiochip2"));
    }

    #[test]
    fn test_auto_falls_back_to_sysfs() {
        let root = tempfile::tempdir().unwrap();
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let config = BackendConfig {
            daemon_timeout_ms: 200,
            ..BackendConfig::default()
        }
        .with_daemon("127.0.0.1", port)
        .with_chip("/dev/pinwire-no-such-chip")
        .with_sysfs_root(root.path());

        let backend = Backend::from_config(&config).unwrap();
        assert_eq!(backend.name(), "sysfs");
    }

    #[test]
    fn test_auto_with_nothing_available() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let config = BackendConfig {
            daemon_timeout_ms: 200,
            ..BackendConfig::default()
        }
        .with_daemon("127.0.0.1", port)
        .with_chip("/dev/pinwire-no-such-chip")
        .with_sysfs_root("/nonexistent/pinwire/gpio");

        assert!(matches!(
            Backend::from_config(&config),
            Err(BackendError::Unavailable { .. })
        ));
    }

    #[test]
    fn test_mock_dispatch() {
        let (mock, handle) = MockBackend::new();
        let backend = Backend::from(mock);
        let mut line = backend
            .connect(&LineConfig::output(LineId::new(5), Level::Low))
            .unwrap();

        line.write(Level::High).unwrap();
        assert_eq!(line.line(), LineId::new(5));
        assert_eq!(handle.writes(LineId::new(5)), vec![Level::High]);
        assert_eq!(line.clock(), TickClock::micros32());
    }
}
