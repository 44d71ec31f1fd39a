//! Thread-driven PWM for backends without a hardware timer.
//!
//! The worker re-reads period and duty at the start of every cycle, so
//! retuning takes effect within one period and never restarts the signal.
//! Stopping wakes the worker out of its current hold.

use pinwire_core::{Level, LineId};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, warn};

use crate::{Result, lock};

/// Sets the line level from the PWM worker.
pub(crate) type LevelWriter = Box<dyn FnMut(Level) -> Result<()> + Send>;

#[derive(Debug, Clone, Copy)]
struct PwmSettings {
    period: Duration,
    duty: f64,
    stopped: bool,
}

type Shared = Arc<(Mutex<PwmSettings>, Condvar)>;

#[derive(Debug)]
pub(crate) struct SoftPwm {
    line: LineId,
    shared: Shared,
    worker: Option<JoinHandle<()>>,
}

fn period_for(frequency: u32) -> Duration {
    Duration::from_secs_f64(1.0 / f64::from(frequency.max(1)))
}

/// Wait up to `hold` unless stopped first. Returns whether to keep running.
fn hold_level(shared: &Shared, hold: Duration) -> bool {
    let (settings, wake) = &**shared;
    let (guard, _) = wake
        .wait_timeout_while(lock(settings), hold, |s| !s.stopped)
        .unwrap_or_else(PoisonError::into_inner);
    !guard.stopped
}

impl SoftPwm {
    /// Start a PWM worker at `frequency` Hz with a duty of zero.
    pub(crate) fn start(line: LineId, frequency: u32, mut writer: LevelWriter) -> Result<Self> {
        let shared: Shared = Arc::new((
            Mutex::new(PwmSettings {
                period: period_for(frequency),
                duty: 0.0,
                stopped: false,
            }),
            Condvar::new(),
        ));

        let worker = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name(format!("pwm-gpio{line}"))
                .spawn(move || {
                    loop {
                        let PwmSettings {
                            period,
                            duty,
                            stopped,
                        } = *lock(&shared.0);
                        if stopped {
                            return;
                        }
                        let high = period.mul_f64(duty.clamp(0.0, 1.0));
                        let low = period.saturating_sub(high);

                        for (level, hold) in [(Level::High, high), (Level::Low, low)] {
                            if hold.is_zero() {
                                continue;
                            }
                            if let Err(e) = writer(level) {
                                warn!(line = %line, error = %e, "PWM worker stopped");
                                return;
                            }
                            if !hold_level(&shared, hold) {
                                return;
                            }
                        }
                    }
                })?
        };

        debug!(line = %line, frequency, "Software PWM started");
        Ok(Self {
            line,
            shared,
            worker: Some(worker),
        })
    }

    pub(crate) fn retune(&mut self, frequency: u32) {
        lock(&self.shared.0).period = period_for(frequency);
        debug!(line = %self.line, frequency, "Software PWM retuned");
    }

    pub(crate) fn set_duty(&self, ratio: f64) {
        lock(&self.shared.0).duty = ratio;
    }

    fn signal_stop(&self) {
        let (settings, wake) = &*self.shared;
        lock(settings).stopped = true;
        wake.notify_all();
    }

    /// Stop the worker and wait for it to exit.
    ///
    /// The caller may drive the line afterwards without racing the worker.
    pub(crate) fn stop(mut self) {
        self.signal_stop();
        if let Some(worker) = self.worker.take()
            && worker.join().is_err()
        {
            warn!(line = %self.line, "PWM worker panicked");
        }
    }
}

impl Drop for SoftPwm {
    fn drop(&mut self) {
        self.signal_stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Instant;

    #[test]
    fn test_soft_pwm_toggles_and_stops() {
        let (tx, rx) = mpsc::channel();
        let writer: LevelWriter = Box::new(move |level| {
            let _ = tx.send(level);
            Ok(())
        });

        let pwm = SoftPwm::start(LineId::new(18), 2_000, writer).unwrap();
        pwm.set_duty(0.5);

        let mut seen_high = false;
        for _ in 0..200 {
            if rx.recv_timeout(Duration::from_secs(1)).unwrap() == Level::High {
                seen_high = true;
                break;
            }
        }
        assert!(seen_high);

        pwm.stop();
        while rx.try_recv().is_ok() {}
        thread::sleep(Duration::from_millis(5));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_soft_pwm_retune_keeps_duty() {
        let writer: LevelWriter = Box::new(|_| Ok(()));
        let mut pwm = SoftPwm::start(LineId::new(18), 100, writer).unwrap();
        pwm.set_duty(0.75);
        pwm.retune(250);

        let settings = *lock(&pwm.shared.0);
        assert_eq!(settings.duty, 0.75);
        assert_eq!(settings.period, period_for(250));
        assert!(period_for(250) < period_for(100));
        pwm.stop();
    }

    #[test]
    fn test_soft_pwm_stop_interrupts_long_hold() {
        let (tx, rx) = mpsc::channel();
        let writer: LevelWriter = Box::new(move |level| {
            let _ = tx.send(level);
            Ok(())
        });

        // One cycle lasts a second; the worker is mid-hold when stopped.
        let pwm = SoftPwm::start(LineId::new(18), 1, writer).unwrap();
        pwm.set_duty(0.5);
        rx.recv_timeout(Duration::from_secs(2)).unwrap();

        let started = Instant::now();
        pwm.stop();
        assert!(started.elapsed() < Duration::from_millis(200));
    }
}
