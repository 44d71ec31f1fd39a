//! Periodic DHT22 polling on the tokio runtime.
//!
//! The poller owns a [`Dht22`] and reads it on a fixed interval from a
//! spawned task. Every cycle produces exactly one [`PollEvent`]:
//!
//! ```text
//! ┌───────────┐  read()   ┌──────────┐ outcome  ┌───────────────┐
//! │ interval  │──────────►│  Dht22   │─────────►│ Event Channel │──► PollerHandle::recv()
//! │ task      │◄──────────│ listener │          │ (mpsc)        │
//! └───────────┘  retry on └──────────┘          └───────────────┘
//!                checksum
//! ```
//!
//! Checksum mismatches are retried at once, up to
//! [`PollerConfig::max_checksum_retries`] extra attempts. Desyncs are not
//! retried. Each attempt is bounded by [`PollerConfig::read_timeout`]; a
//! sensor that stops answering mid-frame is cancelled and reported as
//! `Error::Timeout`.
//!
//! # Examples
//!
//! ```no_run
//! use pinwire_protocol::dht22::Dht22;
//! use pinwire_protocol::poller::{Dht22Poller, PollEvent, PollerConfig};
//!
//! # async fn example(sensor: Dht22) -> pinwire_core::Result<()> {
//! let mut handle = Dht22Poller::new(sensor, PollerConfig::default()).start();
//!
//! while let Some(event) = handle.recv().await {
//!     match event {
//!         PollEvent::Reading(reading) => println!("{reading}"),
//!         PollEvent::Failed { error, .. } => eprintln!("read failed: {error}"),
//!     }
//! }
//!
//! handle.shutdown().await
//! # }
//! ```

use pinwire_core::constants::{
    DEFAULT_MAX_CHECKSUM_RETRIES, DEFAULT_POLL_INTERVAL_SECS, DEFAULT_READ_TIMEOUT_MS,
};
use pinwire_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::dht22::{Dht22, Reading, ReadingListener};

/// Result of one polling cycle.
#[derive(Debug)]
pub enum PollEvent {
    /// A reading with a valid checksum.
    Reading(Reading),

    /// The cycle gave up.
    Failed {
        error: Error,
        /// Reads attempted in this cycle.
        attempts: u32,
    },
}

/// Poller settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollerConfig {
    /// Time between the start of consecutive cycles.
    pub interval: Duration,

    /// Time allowed for one read attempt, trigger included.
    pub read_timeout: Duration,

    /// Extra attempts after a checksum mismatch within one cycle.
    pub max_checksum_retries: u32,

    /// Stop after this many cycles; run until shutdown if `None`.
    pub max_cycles: Option<u64>,

    /// Capacity of the event channel.
    pub channel_capacity: usize,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            read_timeout: Duration::from_millis(DEFAULT_READ_TIMEOUT_MS),
            max_checksum_retries: DEFAULT_MAX_CHECKSUM_RETRIES,
            max_cycles: None,
            channel_capacity: 16,
        }
    }
}

impl PollerConfig {
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn with_max_checksum_retries(mut self, retries: u32) -> Self {
        self.max_checksum_retries = retries;
        self
    }

    pub fn with_max_cycles(mut self, cycles: u64) -> Self {
        self.max_cycles = Some(cycles);
        self
    }
}

/// Outcome of a single read attempt, as seen by the listener.
#[derive(Debug)]
enum Outcome {
    Reading(Reading),
    Checksum { expected: u8, actual: u8 },
    Error(Error),
}

/// Forwards codec callbacks into the poller task.
struct ChannelListener {
    tx: mpsc::UnboundedSender<Outcome>,
}

impl ReadingListener for ChannelListener {
    fn on_reading(&self, reading: Reading) {
        let _ = self.tx.send(Outcome::Reading(reading));
    }

    fn on_invalid_checksum(&self, expected: u8, actual: u8) -> bool {
        self.tx.send(Outcome::Checksum { expected, actual }).is_ok()
    }

    fn on_error(&self, error: Error) {
        let _ = self.tx.send(Outcome::Error(error));
    }
}

/// Periodic reader for one sensor.
#[derive(Debug)]
pub struct Dht22Poller {
    sensor: Dht22,
    config: PollerConfig,
}

impl Dht22Poller {
    pub fn new(sensor: Dht22, config: PollerConfig) -> Self {
        Self { sensor, config }
    }

    pub fn config(&self) -> &PollerConfig {
        &self.config
    }

    /// Spawn the polling task. Must be called from within a tokio runtime.
    pub fn start(self) -> PollerHandle {
        let (event_tx, event_rx) = mpsc::channel(self.config.channel_capacity.max(1));
        let sensor = self.sensor.clone();
        let task = tokio::spawn(self.run(event_tx));

        PollerHandle {
            event_rx,
            task,
            sensor,
        }
    }

    async fn run(self, events: mpsc::Sender<PollEvent>) {
        let (outcome_tx, mut outcomes) = mpsc::unbounded_channel();
        let listener: Arc<dyn ReadingListener> = Arc::new(ChannelListener { tx: outcome_tx });
        self.sensor.set_listener(Some(&listener));

        let mut interval = time::interval(self.config.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut cycles = 0u64;

        info!(line = %self.sensor.line(), interval = ?self.config.interval, "DHT22 poller started");
        loop {
            if self.config.max_cycles.is_some_and(|max| cycles >= max) {
                break;
            }
            interval.tick().await;
            cycles += 1;

            let event = self.cycle(&mut outcomes).await;
            if events.send(event).await.is_err() {
                debug!("Event receiver dropped, stopping poller");
                break;
            }
        }

        self.sensor.set_listener(None);
        info!(line = %self.sensor.line(), cycles, "DHT22 poller stopped");
    }

    /// Read until a reading arrives, a non-retryable error occurs or the
    /// checksum retries run out.
    async fn cycle(&self, outcomes: &mut mpsc::UnboundedReceiver<Outcome>) -> PollEvent {
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            while outcomes.try_recv().is_ok() {}

            let outcome = match self.attempt(outcomes).await {
                Ok(outcome) => outcome,
                Err(error) => return PollEvent::Failed { error, attempts },
            };

            match outcome {
                Outcome::Reading(reading) => return PollEvent::Reading(reading),
                Outcome::Checksum { expected, actual } => {
                    if attempts > self.config.max_checksum_retries {
                        return PollEvent::Failed {
                            error: Error::ChecksumMismatch { expected, actual },
                            attempts,
                        };
                    }
                    warn!(line = %self.sensor.line(), attempts, "Checksum mismatch, retrying");
                }
                Outcome::Error(error) => return PollEvent::Failed { error, attempts },
            }
        }
    }

    async fn attempt(&self, outcomes: &mut mpsc::UnboundedReceiver<Outcome>) -> Result<Outcome> {
        let timeout = self.config.read_timeout;
        let sensor = self.sensor.clone();
        let read = async move {
            tokio::task::spawn_blocking(move || sensor.read())
                .await
                .map_err(|e| Error::Backend(format!("read task failed: {e}")))??;
            outcomes
                .recv()
                .await
                .ok_or_else(|| Error::Backend("listener channel closed".into()))
        };

        match time::timeout(timeout, read).await {
            Ok(result) => result,
            Err(_) => {
                self.sensor.cancel();
                warn!(line = %self.sensor.line(), ?timeout, "DHT22 read timed out");
                Err(Error::timeout(timeout))
            }
        }
    }
}

/// Handle for receiving poll events.
pub struct PollerHandle {
    event_rx: mpsc::Receiver<PollEvent>,
    task: JoinHandle<()>,
    sensor: Dht22,
}

impl PollerHandle {
    /// Next event; `None` once the poller has stopped.
    pub async fn recv(&mut self) -> Option<PollEvent> {
        self.event_rx.recv().await
    }

    /// Stop polling and cancel any read in flight.
    ///
    /// # Errors
    ///
    /// Returns `Error::Backend` if the polling task panicked.
    pub async fn shutdown(self) -> Result<()> {
        self.task.abort();
        let result = match self.task.await {
            Ok(()) => Ok(()),
            Err(e) if e.is_cancelled() => Ok(()),
            Err(e) => Err(Error::Backend(format!("poller task panicked: {e}"))),
        };
        self.sensor.cancel();
        self.sensor.set_listener(None);
        result
    }
}
