//! GPIO pin abstraction over interchangeable backends.
//!
//! This crate exposes a single [`Pin`] type that drives one GPIO line through
//! whichever backend is available on the host:
//!
//! - **daemon**: a pigpio-compatible daemon reached over TCP, with hardware
//!   timestamps and hardware PWM
//! - **cdev**: the Linux GPIO character device via `gpiocdev`
//!   (feature `backend-cdev`)
//! - **sysfs**: the legacy `/sys/class/gpio` interface
//! - **mock**: a scripted in-memory backend for tests
//!
//! # Architecture
//!
//! ```text
//! ┌───────────┐   claim/release   ┌─────────────┐
//! │    Pin    │◄─────────────────►│ PinRegistry │
//! └─────┬─────┘                   └─────────────┘
//!       │ LineHandle
//!       ▼
//! ┌───────────┐   enum dispatch   ┌──────────────────────────┐
//! │  AnyLine  │──────────────────►│ Daemon │ Cdev │ Sysfs │ Mock
//! └───────────┘                   └──────────────────────────┘
//! ```
//!
//! Backends are selected through [`BackendConfig`]; with
//! [`Interface::Auto`] the first reachable driver wins.
//!
//! # Examples
//!
//! ```
//! use pinwire_core::{Level, LineId};
//! use pinwire_hardware::mock::MockBackend;
//! use pinwire_hardware::{Backend, EdgeHandler, Pin, PinConfig, PinRegistry};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let (mock, handle) = MockBackend::new();
//! let backend = Backend::from(mock);
//! let registry = Arc::new(PinRegistry::new());
//!
//! let pin = Pin::open_in(&registry, &backend, PinConfig::input(LineId::new(4))).unwrap();
//! let handler: Arc<dyn EdgeHandler> = Arc::new(|tick: u64, level: Level| {
//!     println!("{level} at {tick}");
//! });
//! pin.set_when_changed(Some(&handler)).unwrap();
//!
//! handle.emit(LineId::new(4), Level::High, Duration::from_micros(80));
//! pin.close().unwrap();
//! ```
//!
//! # Error Handling
//!
//! Adapters return [`BackendError`]. Everything on [`Pin`] returns
//! [`pinwire_core::Result`], with backend failures converted on the way out.

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod backend;
pub mod backends;
pub mod devices;
pub mod error;
pub mod mock;
pub mod pin;
pub mod registry;

// Re-export commonly used types for convenience
pub use backend::{Capabilities, EdgeSink, LineConfig, LineHandle};
pub use devices::{AnyLine, Backend, BackendConfig, Interface};
pub use error::{BackendError, Result};
pub use pin::{EdgeHandler, Pin, PinConfig, WeakPin};
pub use registry::PinRegistry;

/// Lock a mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
