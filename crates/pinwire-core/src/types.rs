use crate::{Result, error::Error};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Not;
use std::time::Duration;

/// Physical GPIO line number (BCM numbering on Raspberry Pi boards).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LineId(u32);

impl LineId {
    pub const fn new(line: u32) -> Self {
        LineId(line)
    }

    #[must_use]
    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for LineId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for LineId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let line = s
            .trim()
            .trim_start_matches("GPIO")
            .parse::<u32>()
            .map_err(|_| Error::InvalidValue(format!("Invalid line number: {s}")))?;
        Ok(LineId(line))
    }
}

impl From<u32> for LineId {
    fn from(line: u32) -> Self {
        LineId(line)
    }
}

/// Electrical level of a digital line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Level {
    Low,
    High,
}

impl Level {
    #[must_use]
    pub fn is_high(self) -> bool {
        self == Level::High
    }

    #[must_use]
    pub fn is_low(self) -> bool {
        self == Level::Low
    }

    /// Numeric form used by most drivers (`0` or `1`).
    #[must_use]
    pub fn as_u8(self) -> u8 {
        match self {
            Level::Low => 0,
            Level::High => 1,
        }
    }
}

impl From<bool> for Level {
    fn from(high: bool) -> Self {
        if high { Level::High } else { Level::Low }
    }
}

impl From<Level> for bool {
    fn from(level: Level) -> Self {
        level.is_high()
    }
}

impl Not for Level {
    type Output = Level;

    fn not(self) -> Level {
        match self {
            Level::Low => Level::High,
            Level::High => Level::Low,
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Level::Low => write!(f, "low"),
            Level::High => write!(f, "high"),
        }
    }
}

/// Direction of a line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    #[default]
    Input,
    Output,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Mode::Input => write!(f, "input"),
            Mode::Output => write!(f, "output"),
        }
    }
}

/// Internal pull resistor setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Pull {
    #[default]
    Floating,
    Up,
    Down,
}

impl fmt::Display for Pull {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Pull::Floating => write!(f, "floating"),
            Pull::Up => write!(f, "up"),
            Pull::Down => write!(f, "down"),
        }
    }
}

/// Which transitions fire the change callback.
///
/// ```text
///   HIGH - - - - >           ,--------------.
///                            |              |
///   LOW  --------------------'              `--------------
///                            :              :
///   fires when edges is   both/rising    both/falling
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Edges {
    None,
    Rising,
    Falling,
    #[default]
    Both,
}

impl Edges {
    /// Whether a transition that ends at `level` passes this filter.
    #[must_use]
    pub fn accepts(self, level: Level) -> bool {
        match self {
            Edges::None => false,
            Edges::Rising => level.is_high(),
            Edges::Falling => level.is_low(),
            Edges::Both => true,
        }
    }
}

impl fmt::Display for Edges {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Edges::None => write!(f, "none"),
            Edges::Rising => write!(f, "rising"),
            Edges::Falling => write!(f, "falling"),
            Edges::Both => write!(f, "both"),
        }
    }
}

/// State of a pin: a digital level, or a duty ratio while PWM is enabled.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PinValue {
    Digital(Level),
    Duty(f64),
}

impl PinValue {
    /// Numeric view: `0.0`/`1.0` for digital levels, the ratio for duty values.
    #[must_use]
    pub fn as_f64(&self) -> f64 {
        match self {
            PinValue::Digital(level) => f64::from(level.as_u8()),
            PinValue::Duty(ratio) => *ratio,
        }
    }

    /// Validate and build a duty ratio.
    ///
    /// # Errors
    /// Returns `Error::InvalidValue` when the ratio is not within `0.0..=1.0`.
    pub fn duty(ratio: f64) -> Result<Self> {
        if !(0.0..=1.0).contains(&ratio) {
            return Err(Error::InvalidValue(format!(
                "Duty ratio must be within 0.0..=1.0, got {ratio}"
            )));
        }
        Ok(PinValue::Duty(ratio))
    }
}

impl From<Level> for PinValue {
    fn from(level: Level) -> Self {
        PinValue::Digital(level)
    }
}

impl From<bool> for PinValue {
    fn from(high: bool) -> Self {
        PinValue::Digital(high.into())
    }
}

impl fmt::Display for PinValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PinValue::Digital(level) => write!(f, "{}", level.as_u8()),
            PinValue::Duty(ratio) => write!(f, "{ratio:.4}"),
        }
    }
}

/// Inclusive range of pulse durations used to classify timing samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DurationRange {
    min: Duration,
    max: Duration,
}

impl DurationRange {
    /// Create a new range with validation.
    ///
    /// # Errors
    /// Returns `Error::InvalidValue` if `min` is greater than `max`.
    pub fn new(min: Duration, max: Duration) -> Result<Self> {
        if min > max {
            return Err(Error::InvalidValue(format!(
                "Duration range minimum {min:?} exceeds maximum {max:?}"
            )));
        }
        Ok(Self { min, max })
    }

    /// Range in whole microseconds. Bounds are swapped if given in reverse.
    #[must_use]
    pub const fn from_micros(min_us: u64, max_us: u64) -> Self {
        let (lo, hi) = if min_us <= max_us {
            (min_us, max_us)
        } else {
            (max_us, min_us)
        };
        Self {
            min: Duration::from_micros(lo),
            max: Duration::from_micros(hi),
        }
    }

    #[must_use]
    pub fn min(&self) -> Duration {
        self.min
    }

    #[must_use]
    pub fn max(&self) -> Duration {
        self.max
    }

    #[must_use]
    pub fn contains(&self, duration: Duration) -> bool {
        self.min <= duration && duration <= self.max
    }

    /// Whether two ranges share any duration.
    #[must_use]
    pub fn overlaps(&self, other: &DurationRange) -> bool {
        self.min <= other.max && other.min <= self.max
    }
}

impl fmt::Display for DurationRange {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}..={:?}", self.min, self.max)
    }
}

/// Converts raw backend ticks into durations.
///
/// Every backend counts time in its own unit and with its own counter
/// width (the GPIO daemon uses a 32-bit microsecond counter that wraps
/// roughly every 72 minutes). Differences are taken modulo the counter
/// width so a wrap between two edges still yields the true interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TickClock {
    nanos_per_tick: u64,
    width_bits: u32,
}

impl TickClock {
    /// Build a clock description.
    ///
    /// `width_bits` is clamped to `1..=64`.
    #[must_use]
    pub const fn new(nanos_per_tick: u64, width_bits: u32) -> Self {
        let width_bits = if width_bits == 0 {
            1
        } else if width_bits > 64 {
            64
        } else {
            width_bits
        };
        Self {
            nanos_per_tick,
            width_bits,
        }
    }

    /// 32-bit microsecond counter.
    #[must_use]
    pub const fn micros32() -> Self {
        Self::new(1_000, 32)
    }

    /// 64-bit nanosecond counter.
    #[must_use]
    pub const fn nanos64() -> Self {
        Self::new(1, 64)
    }

    #[must_use]
    pub fn width_bits(&self) -> u32 {
        self.width_bits
    }

    /// Largest raw tick value before the counter wraps to zero.
    #[must_use]
    pub fn max_tick(&self) -> u64 {
        if self.width_bits >= 64 {
            u64::MAX
        } else {
            (1u64 << self.width_bits) - 1
        }
    }

    /// Elapsed time from `earlier` to `later`, modulo the counter width.
    #[must_use]
    pub fn diff(&self, later: u64, earlier: u64) -> Duration {
        let ticks = later.wrapping_sub(earlier) & self.max_tick();
        Duration::from_nanos(ticks.saturating_mul(self.nanos_per_tick))
    }

    /// Number of ticks covering `duration`, truncated to the counter width.
    #[must_use]
    pub fn ticks_for(&self, duration: Duration) -> u64 {
        let nanos = u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX);
        (nanos / self.nanos_per_tick.max(1)) & self.max_tick()
    }

    /// Advance a raw tick by `duration`, wrapping at the counter width.
    #[must_use]
    pub fn advance(&self, tick: u64, duration: Duration) -> u64 {
        tick.wrapping_add(self.ticks_for(duration)) & self.max_tick()
    }
}
