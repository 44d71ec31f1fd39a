//! `pinwire` command-line tool.
//!
//! Drives single pins and polls DHT22 sensors from the shell:
//!
//! ```bash
//! pinwire read 17
//! pinwire write 17 1
//! pinwire pwm 18 1000 0.25 --duration 5
//! pinwire watch 27 --edges falling --pull up
//! pinwire dht22 4 --interval 2 --count 10 --json
//! ```
//!
//! The backend is auto-detected unless `--interface` is given. Logging goes
//! to stderr and is controlled with `RUST_LOG`.

mod commands;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use pinwire_core::{Edges, LineId, Pull};
use pinwire_hardware::{Backend, BackendConfig, Interface};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "pinwire")]
#[command(about = "GPIO pins and DHT22 sensors from the command line", long_about = None)]
#[command(version)]
struct Cli {
    #[command(flatten)]
    backend: BackendArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug, Default)]
struct BackendArgs {
    /// Backend to use: auto, daemon, cdev, sysfs or mock
    #[arg(long, global = true)]
    interface: Option<Interface>,

    /// GPIO daemon address as host:port
    #[arg(long, global = true)]
    daemon_addr: Option<String>,

    /// GPIO character device, e.g. /dev/gpiochip0
    #[arg(long, global = true)]
    chip: Option<PathBuf>,

    /// Root of the sysfs GPIO tree
    #[arg(long, global = true)]
    sysfs_root: Option<PathBuf>,

    /// JSON file with backend settings; flags override its fields
    #[arg(long, global = true)]
    backend_config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Read the level of a line
    Read {
        line: LineId,

        #[arg(long, value_enum, default_value_t = PullArg::Floating)]
        pull: PullArg,
    },

    /// Drive a line high (1) or low (0)
    Write {
        line: LineId,

        #[arg(value_parser = clap::value_parser!(u8).range(0..=1))]
        value: u8,
    },

    /// Run PWM on a line
    Pwm {
        line: LineId,

        /// Frequency in Hz
        #[arg(value_parser = clap::value_parser!(u32).range(1..))]
        frequency: u32,

        /// Duty ratio between 0.0 and 1.0
        duty: f64,

        /// Seconds to keep PWM running; until Ctrl-C if omitted
        #[arg(long)]
        duration: Option<u64>,
    },

    /// Print edges on a line as they happen
    Watch {
        line: LineId,

        #[arg(long, value_enum, default_value_t = EdgesArg::Both)]
        edges: EdgesArg,

        #[arg(long, value_enum, default_value_t = PullArg::Floating)]
        pull: PullArg,

        /// Debounce interval in microseconds
        #[arg(long)]
        bounce_us: Option<u64>,

        /// Exit after this many edges
        #[arg(long)]
        count: Option<u64>,
    },

    /// Poll a DHT22 sensor
    Dht22 {
        line: LineId,

        /// Seconds between readings
        #[arg(long, default_value = "5")]
        interval: u64,

        /// Stop after this many polling cycles; runs until Ctrl-C if omitted
        #[arg(long)]
        count: Option<u64>,

        /// Time allowed for one read, in milliseconds
        #[arg(long, default_value = "500")]
        timeout_ms: u64,

        /// Extra attempts after a checksum mismatch
        #[arg(long, default_value = "2")]
        retries: u32,

        /// Print readings as JSON lines
        #[arg(long)]
        json: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum PullArg {
    Floating,
    Up,
    Down,
}

impl From<PullArg> for Pull {
    fn from(pull: PullArg) -> Self {
        match pull {
            PullArg::Floating => Pull::Floating,
            PullArg::Up => Pull::Up,
            PullArg::Down => Pull::Down,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum EdgesArg {
    Rising,
    Falling,
    Both,
}

impl From<EdgesArg> for Edges {
    fn from(edges: EdgesArg) -> Self {
        match edges {
            EdgesArg::Rising => Edges::Rising,
            EdgesArg::Falling => Edges::Falling,
            EdgesArg::Both => Edges::Both,
        }
    }
}

impl BackendArgs {
    /// Backend settings from the JSON file (if any) with flags applied on top.
    fn config(&self) -> Result<BackendConfig> {
        let mut config = match &self.backend_config {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("reading {}", path.display()))?;
                serde_json::from_str(&text)
                    .with_context(|| format!("parsing {}", path.display()))?
            }
            None => BackendConfig::default(),
        };

        if let Some(interface) = self.interface {
            config = config.with_interface(interface);
        }
        if let Some(addr) = &self.daemon_addr {
            let (host, port) = parse_daemon_addr(addr)?;
            config = config.with_daemon(host, port);
        }
        if let Some(chip) = &self.chip {
            config = config.with_chip(chip);
        }
        if let Some(root) = &self.sysfs_root {
            config = config.with_sysfs_root(root);
        }
        Ok(config)
    }

    fn backend(&self) -> Result<Backend> {
        let config = self.config()?;
        let backend = Backend::from_config(&config).context("selecting GPIO backend")?;
        tracing::info!(backend = backend.name(), "Backend ready");
        Ok(backend)
    }
}

/// Split `host:port`; a bare host keeps the default port.
fn parse_daemon_addr(addr: &str) -> Result<(String, u16)> {
    match addr.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse()
                .with_context(|| format!("invalid daemon port in '{addr}'"))?;
            Ok((host.to_string(), port))
        }
        None => Ok((
            addr.to_string(),
            pinwire_core::constants::DEFAULT_DAEMON_PORT,
        )),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let backend = cli.backend.backend()?;

    match cli.command {
        Commands::Read { line, pull } => commands::read(&backend, line, pull.into()),
        Commands::Write { line, value } => commands::write(&backend, line, value == 1),
        Commands::Pwm {
            line,
            frequency,
            duty,
            duration,
        } => commands::pwm(&backend, line, frequency, duty, duration).await,
        Commands::Watch {
            line,
            edges,
            pull,
            bounce_us,
            count,
        } => {
            let options = commands::WatchOptions {
                edges: edges.into(),
                pull: pull.into(),
                bounce_us,
                count,
            };
            commands::watch(&backend, line, options).await
        }
        Commands::Dht22 {
            line,
            interval,
            count,
            timeout_ms,
            retries,
            json,
        } => {
            let options = commands::Dht22Options {
                interval,
                count,
                timeout_ms,
                retries,
                json,
            };
            commands::dht22(&backend, line, options).await
        }
    }
}
