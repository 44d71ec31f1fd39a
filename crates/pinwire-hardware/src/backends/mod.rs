//! Backend adapters for real GPIO drivers.

#[cfg(feature = "backend-cdev")]
pub mod cdev;
pub mod daemon;
mod softpwm;
pub mod sysfs;

#[cfg(feature = "backend-cdev")]
pub use cdev::{CdevBackend, CdevLine};
pub use daemon::{DaemonBackend, DaemonLine};
pub use sysfs::{SysfsBackend, SysfsLine};
