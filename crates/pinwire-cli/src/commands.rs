//! Subcommand implementations.

use anyhow::{Context, Result, bail};
use pinwire_core::{Edges, Level, LineId, PinValue, Pull};
use pinwire_hardware::{Backend, EdgeHandler, Pin, PinConfig};
use pinwire_protocol::dht22::{Dht22, Dht22Config};
use pinwire_protocol::poller::{Dht22Poller, PollEvent, PollerConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{debug, info};

pub fn read(backend: &Backend, line: LineId, pull: Pull) -> Result<()> {
    let pin = Pin::open(backend, PinConfig::input(line).with_pull(pull))
        .with_context(|| format!("opening GPIO{line}"))?;
    let value = pin.read()?;
    println!("GPIO{line}: {value}");
    pin.close()?;
    Ok(())
}

pub fn write(backend: &Backend, line: LineId, high: bool) -> Result<()> {
    let level = Level::from(high);
    let pin = Pin::open(backend, PinConfig::output(line).with_initial(level))
        .with_context(|| format!("opening GPIO{line}"))?;
    pin.write(level)?;
    println!("GPIO{line}: {level}");
    pin.close()?;
    Ok(())
}

pub async fn pwm(
    backend: &Backend,
    line: LineId,
    frequency: u32,
    duty: f64,
    duration: Option<u64>,
) -> Result<()> {
    let duty = PinValue::duty(duty)?;
    let pin = Pin::open(backend, PinConfig::output(line).with_frequency(frequency))
        .with_context(|| format!("opening GPIO{line}"))?;
    pin.write(duty)?;
    info!(line = %line, frequency, %duty, "PWM running");

    match duration {
        Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
        None => {
            println!("GPIO{line}: PWM {frequency} Hz at {duty}, Ctrl-C to stop");
            signal::ctrl_c().await?;
        }
    }

    pin.close()?;
    Ok(())
}

pub struct WatchOptions {
    pub edges: Edges,
    pub pull: Pull,
    pub bounce_us: Option<u64>,
    pub count: Option<u64>,
}

/// Print every edge with its tick and the time spent at the previous level.
pub async fn watch(backend: &Backend, line: LineId, options: WatchOptions) -> Result<()> {
    let mut config = PinConfig::input(line)
        .with_pull(options.pull)
        .with_edges(options.edges);
    if let Some(us) = options.bounce_us {
        config = config.with_bounce(Duration::from_micros(us));
    }
    let pin = Pin::open(backend, config).with_context(|| format!("opening GPIO{line}"))?;
    let clock = pin.clock();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let handler: Arc<dyn EdgeHandler> = Arc::new(move |tick: u64, level: Level| {
        let _ = tx.send((tick, level));
    });
    pin.set_when_changed(Some(&handler))?;

    let mut last = pin.ticks()?;
    let mut seen = 0u64;
    loop {
        tokio::select! {
            edge = rx.recv() => {
                let Some((tick, level)) = edge else { break };
                println!("{tick:>12}  {level:<4}  +{:?}", clock.diff(tick, last));
                last = tick;
                seen += 1;
                if options.count.is_some_and(|max| seen >= max) {
                    break;
                }
            }
            _ = signal::ctrl_c() => break,
        }
    }

    debug!(line = %line, seen, "Watch finished");
    pin.close()?;
    Ok(())
}

pub struct Dht22Options {
    pub interval: u64,
    pub count: Option<u64>,
    pub timeout_ms: u64,
    pub retries: u32,
    pub json: bool,
}

pub async fn dht22(backend: &Backend, line: LineId, options: Dht22Options) -> Result<()> {
    let pin = Pin::open(backend, PinConfig::output(line))
        .with_context(|| format!("opening GPIO{line}"))?;
    let sensor = Dht22::new(pin, Dht22Config::default())?;

    let mut config = PollerConfig::default()
        .with_interval(Duration::from_secs(options.interval.max(1)))
        .with_read_timeout(Duration::from_millis(options.timeout_ms))
        .with_max_checksum_retries(options.retries);
    if let Some(count) = options.count {
        config = config.with_max_cycles(count);
    }

    let mut handle = Dht22Poller::new(sensor.clone(), config).start();
    let mut readings = 0u64;
    let mut failures = 0u64;
    loop {
        tokio::select! {
            event = handle.recv() => match event {
                Some(PollEvent::Reading(reading)) => {
                    readings += 1;
                    if options.json {
                        println!("{}", serde_json::to_string(&reading)?);
                    } else {
                        println!("GPIO{line}: {reading}");
                    }
                }
                Some(PollEvent::Failed { error, attempts }) => {
                    failures += 1;
                    eprintln!("GPIO{line}: read failed after {attempts} attempt(s): {error}");
                }
                None => break,
            },
            _ = signal::ctrl_c() => break,
        }
    }

    handle.shutdown().await?;
    sensor.close()?;

    if readings == 0 && failures > 0 {
        bail!("no valid reading from GPIO{line} in {failures} cycle(s)");
    }
    Ok(())
}
