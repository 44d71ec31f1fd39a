//! Timing and backend constants shared across the pinwire crates.
//!
//! # DHT22 bus timing
//!
//! The host wakes the sensor, holds the line low long enough for the sensor
//! to notice, releases it, and then listens. The sensor answers with a
//! response preamble followed by 40 data bits. Every bit starts with a
//! ~50 µs low separator; the length of the following high pulse is the bit.
//!
//! ```text
//!  host:   ‾‾‾‾‾‾‾‾\__________________/‾‾
//!          wake 10ms  start 18ms       release 40µs
//!  sensor:                                \_____/‾‾‾‾‾\__/‾‾\__/‾‾‾‾‾\ ...
//!                                          80µs   80µs    0      1
//! ```
//!
//! Bits are transmitted MSB-first in five bytes:
//! humidity high, humidity low, temperature high (bit 7 is the sign),
//! temperature low, checksum.
//!
//! # Usage
//!
//! ```
//! use pinwire_core::constants::*;
//! use std::time::Duration;
//!
//! let hold = Duration::from_millis(DHT22_START_HOLD_MS);
//! assert!(hold < Duration::from_millis(50));
//! assert_eq!(DHT22_FRAME_BITS, DHT22_FRAME_BYTES * 8);
//! ```

// ============================================================================
// DHT22 Frame Layout
// ============================================================================

/// Number of bytes in one DHT22 frame (including the checksum byte).
pub const DHT22_FRAME_BYTES: usize = 5;

/// Number of data bits in one DHT22 frame.
pub const DHT22_FRAME_BITS: usize = 40;

/// Sign bit inside the temperature high byte.
pub const DHT22_TEMPERATURE_SIGN_MASK: u8 = 0x80;

// ============================================================================
// DHT22 Trigger Timing (host side)
// ============================================================================

/// High hold before the start signal, in milliseconds.
pub const DHT22_WAKE_HOLD_MS: u64 = 10;

/// Low hold that asks the sensor to start a conversion, in milliseconds.
pub const DHT22_START_HOLD_MS: u64 = 18;

/// Short high pulse after the start signal, in microseconds.
pub const DHT22_RELEASE_PULSE_US: u64 = 40;

// ============================================================================
// DHT22 Response Timing (sensor side, all inclusive, in microseconds)
// ============================================================================

/// Shortest high pulse classified as a `0` bit.
pub const DHT22_ZERO_MIN_US: u64 = 20;

/// Longest high pulse classified as a `0` bit.
pub const DHT22_ZERO_MAX_US: u64 = 35;

/// Shortest high pulse classified as a `1` bit.
pub const DHT22_ONE_MIN_US: u64 = 55;

/// Longest high pulse classified as a `1` bit.
pub const DHT22_ONE_MAX_US: u64 = 85;

/// Shortest high half of the response preamble.
pub const DHT22_RESPONSE_MIN_US: u64 = 60;

/// Longest high half of the response preamble.
pub const DHT22_RESPONSE_MAX_US: u64 = 100;

/// Debounce applied to the data line while capturing.
pub const DHT22_DEBOUNCE_US: u64 = 5;

// ============================================================================
// DHT22 Polling
// ============================================================================

/// Checksum failures retried within one polling cycle before giving up.
pub const DEFAULT_MAX_CHECKSUM_RETRIES: u32 = 2;

/// Default interval between polled readings, in seconds.
///
/// The sensor needs about two seconds between conversions.
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 5;

/// Default time allowed for one complete read, in milliseconds.
pub const DEFAULT_READ_TIMEOUT_MS: u64 = 500;

// ============================================================================
// Backend Defaults
// ============================================================================

/// Host running the GPIO daemon.
pub const DEFAULT_DAEMON_HOST: &str = "localhost";

/// TCP port of the GPIO daemon socket interface.
pub const DEFAULT_DAEMON_PORT: u16 = 8888;

/// PWM range programmed into the GPIO daemon; duty ratios are scaled to it.
pub const DAEMON_PWM_RANGE: u32 = 10_000;

/// Root of the sysfs GPIO class directory.
pub const DEFAULT_SYSFS_ROOT: &str = "/sys/class/gpio";

/// Polling period of the sysfs edge watcher, in microseconds.
pub const SYSFS_POLL_INTERVAL_US: u64 = 100;

/// GPIO character device used on most boards.
pub const DEFAULT_GPIO_CHIP: &str = "/dev/gpiochip0";

/// GPIO character device carrying the header pins on a Raspberry Pi 5.
pub const PI5_GPIO_CHIP: &str = "/dev/gpiochip4";

/// Device tree node naming the board model.
pub const DEVICE_TREE_MODEL_PATH: &str = "/sys/firmware/devicetree/base/model";

/// Consumer label attached to line requests.
pub const LINE_CONSUMER: &str = "pinwire";
