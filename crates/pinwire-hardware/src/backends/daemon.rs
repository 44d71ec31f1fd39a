//! GPIO daemon adapter speaking the pigpio socket protocol.
//!
//! # Wire format
//!
//! Commands are 16-byte little-endian frames `(cmd, p1, p2, p3)`; `p3` is the
//! length of an optional extension, always zero here. The daemon answers with
//! a 16-byte frame whose last word is the signed result. Negative results are
//! error codes.
//!
//! Edge notifications use a second socket switched into notification mode
//! with `NOIB`. It then streams 12-byte reports:
//!
//! ```text
//! +--------+--------+----------------+----------------+
//! | seqno  | flags  |      tick      |     levels     |
//! |  u16   |  u16   |  u32 (µs)      |  u32 bitmask   |
//! +--------+--------+----------------+----------------+
//! ```
//!
//! Reports with the watchdog, keep-alive or event flag set carry no level
//! change and are skipped.

use pinwire_core::constants::DAEMON_PWM_RANGE;
use pinwire_core::{Edges, Level, LineId, Mode, Pull, TickClock};
use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

use crate::backend::{Capabilities, EdgeSink, LineConfig, LineHandle, deliver};
use crate::{BackendError, Result};

/// Daemon command codes.
pub mod command {
    pub const MODES: u32 = 0;
    pub const PUD: u32 = 2;
    pub const READ: u32 = 3;
    pub const WRITE: u32 = 4;
    pub const PWM: u32 = 5;
    pub const PRS: u32 = 6;
    pub const PFS: u32 = 7;
    pub const TICK: u32 = 16;
    pub const NB: u32 = 19;
    pub const NC: u32 = 21;
    pub const FG: u32 = 97;
    pub const NOIB: u32 = 99;
}

pub const FRAME_SIZE: usize = 16;
pub const REPORT_SIZE: usize = 12;

const FLAG_WATCHDOG: u16 = 1 << 5;
const FLAG_ALIVE: u16 = 1 << 6;
const FLAG_EVENT: u16 = 1 << 7;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

/// Encode a command frame.
pub fn encode_command(cmd: u32, p1: u32, p2: u32, p3: u32) -> [u8; FRAME_SIZE] {
    let mut frame = [0u8; FRAME_SIZE];
    for (chunk, word) in frame.chunks_exact_mut(4).zip([cmd, p1, p2, p3]) {
        chunk.copy_from_slice(&word.to_le_bytes());
    }
    frame
}

/// Extract the signed result word from a response frame.
pub fn decode_result(frame: &[u8; FRAME_SIZE]) -> i32 {
    i32::from_le_bytes([frame[12], frame[13], frame[14], frame[15]])
}

/// One notification report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Report {
    pub seqno: u16,
    pub flags: u16,
    pub tick: u32,
    pub levels: u32,
}

impl Report {
    pub fn parse(raw: &[u8; REPORT_SIZE]) -> Self {
        Self {
            seqno: u16::from_le_bytes([raw[0], raw[1]]),
            flags: u16::from_le_bytes([raw[2], raw[3]]),
            tick: u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]),
            levels: u32::from_le_bytes([raw[8], raw[9], raw[10], raw[11]]),
        }
    }

    /// Whether this report carries a level change rather than a status flag.
    pub fn is_level_change(&self) -> bool {
        self.flags & (FLAG_WATCHDOG | FLAG_ALIVE | FLAG_EVENT) == 0
    }

    pub fn level_of(&self, line: LineId) -> Level {
        Level::from((self.levels >> line.as_u32()) & 1 == 1)
    }
}

#[derive(Debug)]
struct DaemonClient {
    stream: TcpStream,
}

impl DaemonClient {
    fn connect(addr: &str, timeout: Duration) -> Result<Self> {
        let unavailable = |reason: String| BackendError::unavailable("daemon", reason);

        let socket_addr = addr
            .to_socket_addrs()
            .map_err(|e| unavailable(format!("{addr}: {e}")))?
            .next()
            .ok_or_else(|| unavailable(format!("{addr}: no address")))?;
        let stream = TcpStream::connect_timeout(&socket_addr, timeout)
            .map_err(|e| unavailable(format!("{addr}: {e}")))?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(timeout))?;

        Ok(Self { stream })
    }

    /// Send a command and return the raw result word.
    fn command(&mut self, cmd: u32, p1: u32, p2: u32) -> Result<i32> {
        self.stream
            .write_all(&encode_command(cmd, p1, p2, 0))
            .map_err(|e| BackendError::communication(format!("command {cmd}: {e}")))?;

        let mut response = [0u8; FRAME_SIZE];
        self.stream
            .read_exact(&mut response)
            .map_err(|e| BackendError::communication(format!("response to {cmd}: {e}")))?;

        let result = decode_result(&response);
        trace!(cmd, p1, p2, result, "daemon command");
        Ok(result)
    }

    /// Send a command, treating negative results as errors.
    fn checked(&mut self, cmd: u32, p1: u32, p2: u32) -> Result<u32> {
        let result = self.command(cmd, p1, p2)?;
        u32::try_from(result).map_err(|_| BackendError::Command {
            command: cmd,
            code: result,
        })
    }
}

/// Factory for daemon-backed lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonBackend {
    addr: String,
    timeout: Duration,
}

impl DaemonBackend {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            addr: format!("{host}:{port}"),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Whether the daemon accepts connections.
    pub fn is_available(&self) -> bool {
        DaemonClient::connect(&self.addr, self.timeout).is_ok()
    }

    pub fn connect(&self, config: &LineConfig) -> Result<DaemonLine> {
        let client = DaemonClient::connect(&self.addr, self.timeout)?;
        let mut line = DaemonLine {
            line: config.line,
            addr: self.addr.clone(),
            timeout: self.timeout,
            client,
            mode: config.mode,
            pwm: None,
            notifier: None,
            closed: false,
        };
        line.apply(config)?;

        info!(line = %config.line, addr = %self.addr, mode = %config.mode, "daemon line connected");
        Ok(line)
    }
}

#[derive(Debug)]
struct Notifier {
    handle: u32,
    stream: TcpStream,
    stop: Arc<AtomicBool>,
}

/// One line driven through the GPIO daemon.
#[derive(Debug)]
pub struct DaemonLine {
    line: LineId,
    addr: String,
    timeout: Duration,
    client: DaemonClient,
    mode: Mode,
    pwm: Option<u32>,
    notifier: Option<Notifier>,
    closed: bool,
}

impl DaemonLine {
    fn gpio(&self) -> u32 {
        self.line.as_u32()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            Err(BackendError::Closed)
        } else {
            Ok(())
        }
    }

    fn apply(&mut self, config: &LineConfig) -> Result<()> {
        let gpio = self.gpio();
        let mode = match config.mode {
            Mode::Input => 0,
            Mode::Output => 1,
        };
        let pud = match config.pull {
            Pull::Floating => 0,
            Pull::Down => 1,
            Pull::Up => 2,
        };

        self.client.checked(command::MODES, gpio, mode)?;
        self.client.checked(command::PUD, gpio, pud)?;
        if config.mode == Mode::Output {
            self.client
                .checked(command::WRITE, gpio, u32::from(config.initial.as_u8()))?;
        }
        self.mode = config.mode;
        Ok(())
    }

    fn stop_notifier(&mut self) {
        let Some(notifier) = self.notifier.take() else {
            return;
        };
        notifier.stop.store(true, Ordering::Release);
        if let Err(e) = self.client.command(command::NC, notifier.handle, 0) {
            warn!(line = %self.line, error = %e, "failed to close notification handle");
        }
        let _ = notifier.stream.shutdown(Shutdown::Both);
    }
}

impl LineHandle for DaemonLine {
    fn line(&self) -> LineId {
        self.line
    }

    fn reconfigure(&mut self, config: &LineConfig) -> Result<()> {
        self.ensure_open()?;
        self.apply(config)
    }

    fn read(&mut self) -> Result<Level> {
        self.ensure_open()?;
        let level = self.client.checked(command::READ, self.gpio(), 0)?;
        Ok(Level::from(level != 0))
    }

    fn write(&mut self, level: Level) -> Result<()> {
        self.ensure_open()?;
        self.client
            .checked(command::WRITE, self.gpio(), u32::from(level.as_u8()))?;
        Ok(())
    }

    fn set_pwm(&mut self, frequency: Option<u32>) -> Result<()> {
        self.ensure_open()?;
        let gpio = self.gpio();
        match (frequency, self.pwm) {
            (Some(hz), Some(_)) => {
                self.client.checked(command::PFS, gpio, hz)?;
            }
            (Some(hz), None) => {
                self.client.checked(command::PRS, gpio, DAEMON_PWM_RANGE)?;
                self.client.checked(command::PFS, gpio, hz)?;
                self.client.checked(command::PWM, gpio, 0)?;
            }
            (None, Some(_)) => {
                self.client.checked(command::PWM, gpio, 0)?;
                self.client.checked(command::WRITE, gpio, 0)?;
            }
            (None, None) => {}
        }
        self.pwm = frequency;
        Ok(())
    }

    fn set_pwm_duty(&mut self, ratio: f64) -> Result<()> {
        self.ensure_open()?;
        if self.pwm.is_none() {
            return Err(BackendError::unsupported("duty without PWM enabled"));
        }
        let duty = (ratio.clamp(0.0, 1.0) * f64::from(DAEMON_PWM_RANGE)).round() as u32;
        self.client.checked(command::PWM, self.gpio(), duty)?;
        Ok(())
    }

    fn enable_edge_detect(
        &mut self,
        edges: Edges,
        debounce: Option<Duration>,
        sink: EdgeSink,
    ) -> Result<()> {
        self.ensure_open()?;
        self.stop_notifier();

        let gpio = self.gpio();
        let bits = 1u32
            .checked_shl(gpio)
            .ok_or_else(|| BackendError::unsupported(format!("notifications on GPIO {gpio}")))?;

        let steady_us = debounce.map_or(0, |d| u32::try_from(d.as_micros()).unwrap_or(u32::MAX));
        self.client.checked(command::FG, gpio, steady_us)?;

        let mut notify = DaemonClient::connect(&self.addr, self.timeout)?;
        let handle = notify.checked(command::NOIB, 0, 0)?;
        self.client.checked(command::NB, handle, bits)?;

        let mut stream = notify.stream;
        stream.set_read_timeout(None)?;
        let shutdown = stream.try_clone()?;
        let stop = Arc::new(AtomicBool::new(false));
        let line = self.line;

        {
            let stop = Arc::clone(&stop);
            thread::Builder::new()
                .name(format!("notify-gpio{line}"))
                .spawn(move || {
                    let mut raw = [0u8; REPORT_SIZE];
                    loop {
                        if let Err(e) = stream.read_exact(&mut raw) {
                            if !stop.load(Ordering::Acquire) {
                                warn!(line = %line, error = %e, "notification stream closed");
                            }
                            return;
                        }
                        if stop.load(Ordering::Acquire) {
                            return;
                        }
                        let report = Report::parse(&raw);
                        if !report.is_level_change() {
                            continue;
                        }
                        deliver(&sink, edges, u64::from(report.tick), report.level_of(line));
                    }
                })?;
        }

        self.notifier = Some(Notifier {
            handle,
            stream: shutdown,
            stop,
        });
        debug!(line = %self.line, edges = %edges, steady_us, handle, "daemon notifications enabled");
        Ok(())
    }

    fn disable_edge_detect(&mut self) -> Result<()> {
        self.ensure_open()?;
        if self.notifier.is_some() {
            self.stop_notifier();
            self.client.checked(command::FG, self.gpio(), 0)?;
            debug!(line = %self.line, "daemon notifications disabled");
        }
        Ok(())
    }

    fn ticks(&mut self) -> Result<u64> {
        self.ensure_open()?;
        // The tick is an unsigned counter; the sign bit is not an error here.
        let raw = self.client.command(command::TICK, 0, 0)?;
        Ok(u64::from(raw as u32))
    }

    fn clock(&self) -> TickClock {
        TickClock::micros32()
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            hardware_pwm: true,
            output_readback: true,
            pull: true,
            native_debounce: true,
        }
    }

    fn close(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.stop_notifier();
        if self.pwm.is_some() {
            self.set_pwm(None)?;
        }
        self.closed = true;
        let _ = self.client.stream.shutdown(Shutdown::Both);
        info!(line = %self.line, "daemon line closed");
        Ok(())
    }
}

impl Drop for DaemonLine {
    fn drop(&mut self) {
        if let Some(notifier) = self.notifier.take() {
            notifier.stop.store(true, Ordering::Release);
            let _ = notifier.stream.shutdown(Shutdown::Both);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::sync::{Mutex, mpsc};

    type Commands = Arc<Mutex<Vec<(u32, u32, u32)>>>;

    fn encode_report(flags: u16, tick: u32, levels: u32) -> [u8; REPORT_SIZE] {
        let mut raw = [0u8; REPORT_SIZE];
        raw[2..4].copy_from_slice(&flags.to_le_bytes());
        raw[4..8].copy_from_slice(&tick.to_le_bytes());
        raw[8..12].copy_from_slice(&levels.to_le_bytes());
        raw
    }

    fn serve(mut stream: TcpStream, commands: Commands, reports: Vec<[u8; REPORT_SIZE]>) {
        let mut frame = [0u8; FRAME_SIZE];
        while stream.read_exact(&mut frame).is_ok() {
            let word = |i: usize| {
                u32::from_le_bytes([frame[i], frame[i + 1], frame[i + 2], frame[i + 3]])
            };
            let (cmd, p1, p2) = (word(0), word(4), word(8));
            commands.lock().unwrap().push((cmd, p1, p2));

            let result: i32 = match (cmd, p1) {
                (command::MODES, 99) => -2,
                (command::READ, _) => 1,
                (command::TICK, _) => -10,
                (command::NOIB, _) => 7,
                _ => 0,
            };
            let mut response = encode_command(cmd, p1, p2, 0);
            response[12..16].copy_from_slice(&result.to_le_bytes());
            if stream.write_all(&response).is_err() {
                return;
            }
            if cmd == command::NOIB {
                for report in &reports {
                    let _ = stream.write_all(report);
                }
            }
        }
    }

    fn fake_daemon(reports: Vec<[u8; REPORT_SIZE]>) -> (DaemonBackend, Commands) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let commands: Commands = Arc::new(Mutex::new(Vec::new()));

        let recorded = Arc::clone(&commands);
        thread::spawn(move || {
            for stream in listener.incoming().flatten() {
                let recorded = Arc::clone(&recorded);
                let reports = reports.clone();
                thread::spawn(move || serve(stream, recorded, reports));
            }
        });

        (DaemonBackend::new("127.0.0.1", port), commands)
    }

    #[test]
    fn test_frame_encoding() {
        let frame = encode_command(command::WRITE, 17, 1, 0);
        assert_eq!(&frame[0..4], &[4, 0, 0, 0]);
        assert_eq!(&frame[4..8], &[17, 0, 0, 0]);
        assert_eq!(&frame[8..12], &[1, 0, 0, 0]);

        let mut response = [0u8; FRAME_SIZE];
        response[12..16].copy_from_slice(&(-8i32).to_le_bytes());
        assert_eq!(decode_result(&response), -8);
    }

    #[test]
    fn test_report_parsing() {
        let report = Report::parse(&encode_report(0, 1_000, 1 << 4));
        assert_eq!(report.tick, 1_000);
        assert!(report.is_level_change());
        assert_eq!(report.level_of(LineId::new(4)), Level::High);
        assert_eq!(report.level_of(LineId::new(5)), Level::Low);

        let keepalive = Report::parse(&encode_report(FLAG_ALIVE, 0, 0));
        assert!(!keepalive.is_level_change());
    }

    #[test]
    fn test_connect_configures_output() {
        let (backend, commands) = fake_daemon(Vec::new());
        let mut line = backend
            .connect(&LineConfig::output(LineId::new(17), Level::High))
            .unwrap();

        assert_eq!(
            *commands.lock().unwrap(),
            vec![
                (command::MODES, 17, 1),
                (command::PUD, 17, 0),
                (command::WRITE, 17, 1),
            ]
        );
        assert_eq!(line.read().unwrap(), Level::High);
    }

    #[test]
    fn test_negative_result_is_command_error() {
        let (backend, _commands) = fake_daemon(Vec::new());
        let result = backend.connect(&LineConfig::input(LineId::new(99)));
        assert!(matches!(
            result,
            Err(BackendError::Command {
                command: command::MODES,
                code: -2
            })
        ));
    }

    #[test]
    fn test_pwm_enable_retune_and_disable() {
        let (backend, commands) = fake_daemon(Vec::new());
        let mut line = backend
            .connect(&LineConfig::output(LineId::new(18), Level::Low))
            .unwrap();
        commands.lock().unwrap().clear();

        line.set_pwm(Some(800)).unwrap();
        line.set_pwm_duty(0.5).unwrap();
        line.set_pwm(Some(1_000)).unwrap();
        line.set_pwm(None).unwrap();

        assert_eq!(
            *commands.lock().unwrap(),
            vec![
                (command::PRS, 18, DAEMON_PWM_RANGE),
                (command::PFS, 18, 800),
                (command::PWM, 18, 0),
                (command::PWM, 18, 5_000),
                (command::PFS, 18, 1_000),
                (command::PWM, 18, 0),
                (command::WRITE, 18, 0),
            ]
        );
    }

    #[test]
    fn test_ticks_are_unsigned() {
        let (backend, _commands) = fake_daemon(Vec::new());
        let mut line = backend
            .connect(&LineConfig::input(LineId::new(4)))
            .unwrap();

        assert_eq!(line.ticks().unwrap(), u64::from(u32::MAX) - 9);
    }

    #[test]
    fn test_notifications_delivered_to_sink() {
        let reports = vec![
            encode_report(FLAG_ALIVE, 50, 0),
            encode_report(0, 100, 1 << 4),
            encode_report(0, 150, 0),
        ];
        let (backend, commands) = fake_daemon(reports);
        let mut line = backend
            .connect(&LineConfig::input(LineId::new(4)).with_pull(Pull::Up))
            .unwrap();

        let (tx, rx) = mpsc::channel();
        let sink: EdgeSink = Arc::new(move |tick, level| {
            let _ = tx.send((tick, level));
        });
        line.enable_edge_detect(Edges::Both, Some(Duration::from_micros(5)), sink)
            .unwrap();

        let timeout = Duration::from_secs(2);
        assert_eq!(rx.recv_timeout(timeout).unwrap(), (100, Level::High));
        assert_eq!(rx.recv_timeout(timeout).unwrap(), (150, Level::Low));

        line.disable_edge_detect().unwrap();
        let recorded = commands.lock().unwrap().clone();
        assert!(recorded.contains(&(command::FG, 4, 5)));
        assert!(recorded.contains(&(command::NB, 7, 1 << 4)));
        assert!(recorded.contains(&(command::NC, 7, 0)));
    }

    #[test]
    fn test_unreachable_daemon_is_unavailable() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let backend =
            DaemonBackend::new("127.0.0.1", port).with_timeout(Duration::from_millis(200));

        assert!(!backend.is_available());
        assert!(matches!(
            backend.connect(&LineConfig::input(LineId::new(4))),
            Err(BackendError::Unavailable { .. })
        ));
    }
}
