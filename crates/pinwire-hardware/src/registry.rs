//! Table of claimed GPIO lines.
//!
//! A line can be bound to at most one [`Pin`] at a time. Pins claim their
//! line before any hardware is touched and release it when closed or dropped.
//! Most code uses the process-wide [`PinRegistry::global`]; tests inject their
//! own instance through [`Pin::open_in`].
//!
//! [`Pin`]: crate::pin::Pin
//! [`Pin::open_in`]: crate::pin::Pin::open_in

use pinwire_core::{Error, LineId, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};
use tracing::{debug, info, warn};

use crate::lock;
use crate::pin::WeakPin;

static GLOBAL: OnceLock<Arc<PinRegistry>> = OnceLock::new();

#[derive(Debug, Default)]
pub struct PinRegistry {
    /// `None` while the owning pin is still being opened.
    lines: Mutex<HashMap<LineId, Option<WeakPin>>>,
}

impl PinRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide registry, created on first use.
    pub fn global() -> Arc<PinRegistry> {
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(PinRegistry::new())))
    }

    /// Reserve `line`.
    ///
    /// # Errors
    ///
    /// Returns `Error::LineBusy` if another pin holds the line.
    pub fn claim(&self, line: LineId) -> Result<()> {
        let mut lines = lock(&self.lines);
        if lines.contains_key(&line) {
            debug!(line = %line, "Line already claimed");
            return Err(Error::LineBusy(line));
        }
        lines.insert(line, None);
        Ok(())
    }

    pub(crate) fn attach(&self, line: LineId, pin: WeakPin) {
        lock(&self.lines).insert(line, Some(pin));
    }

    /// Free `line`. Returns whether it was claimed.
    pub fn release(&self, line: LineId) -> bool {
        lock(&self.lines).remove(&line).is_some()
    }

    pub fn is_claimed(&self, line: LineId) -> bool {
        lock(&self.lines).contains_key(&line)
    }

    /// Claimed lines in ascending order.
    pub fn claimed(&self) -> Vec<LineId> {
        let mut lines: Vec<LineId> = lock(&self.lines).keys().copied().collect();
        lines.sort();
        lines
    }

    pub fn len(&self) -> usize {
        lock(&self.lines).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.lines).is_empty()
    }

    /// Close every pin bound through this registry.
    ///
    /// Returns the number of pins closed. Pins close outside the table lock,
    /// so they release their own entries as usual.
    pub fn close_all(&self) -> usize {
        let pins: Vec<(LineId, Option<WeakPin>)> = lock(&self.lines)
            .iter()
            .map(|(line, pin)| (*line, pin.clone()))
            .collect();

        let mut closed = 0;
        for (line, pin) in pins {
            match pin.and_then(|weak| weak.upgrade()) {
                Some(pin) => {
                    if let Err(e) = pin.close() {
                        warn!(line = %line, error = %e, "Error while closing pin");
                    }
                    closed += 1;
                }
                None => {
                    // The pin is gone or still opening; only drop stale entries.
                    let mut lines = lock(&self.lines);
                    if matches!(lines.get(&line), Some(Some(weak)) if weak.is_dead()) {
                        lines.remove(&line);
                    }
                }
            }
        }

        info!(closed, "Closed all pins");
        closed
    }
}
