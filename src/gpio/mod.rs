use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard,
    },
    thread,
    time::{Duration, Instant},
};

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::{lock, Error, Result};

#[cfg(feature = "pi")]
pub mod rpi;
pub mod sim;

/// BCM numbered GPIO line
pub type BcmPin = u8;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Level {
    Low,
    High,
}

impl Level {
    pub fn from_bit(bit: bool) -> Self {
        if bit {
            Level::High
        } else {
            Level::Low
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Pull {
    None,
    Up,
    Down,
}

/// Shortest LOW phase the A4988 accepts between two STEP pulses
pub const MIN_LOW_PHASE: Duration = Duration::from_micros(1);

/// One phase of a waveform: hold `level` for `duration`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Pulse {
    pub level: Level,
    pub duration: Duration,
}

/// The set of pin operations the motor core needs from the platform.
pub trait GpioBackend: Send {
    fn configure_output(&mut self, pin: BcmPin, initial: Level) -> Result<()>;

    fn configure_input(&mut self, pin: BcmPin, pull: Pull) -> Result<()>;

    fn write(&mut self, pin: BcmPin, level: Level) -> Result<()>;

    fn read(&mut self, pin: BcmPin) -> Result<Level>;

    /// Emit one precomputed batch of pulses on an output pin, blocking until
    /// the last phase has elapsed. Returns the time the batch took.
    fn transmit(&mut self, pin: BcmPin, pulses: &[Pulse]) -> Result<Duration>;

    /// Average cost of the shortest wait this backend can perform between
    /// pulse phases, measured over `samples` calls.
    fn wait_overhead(&mut self, samples: u32) -> Duration {
        let start = Instant::now();
        for _ in 0..samples {
            thread::sleep(Duration::from_nanos(1));
        }
        start.elapsed() / samples.max(1)
    }

    /// Whether `transmit` schedules phases against absolute deadlines. The
    /// wait overhead then never accumulates and must not be taken off the
    /// LOW phase.
    fn paces_by_deadline(&self) -> bool {
        false
    }

    /// Return every pin this backend touched to its power-on state.
    fn release(&mut self);
}

/// Handle to the one hardware context of the process. Clones share the same
/// backend; the backend is released when the last handle goes away or when
/// [`Hardware::release`] is called.
#[derive(Clone)]
pub struct Hardware {
    shared: Arc<Shared>,
}

struct Shared {
    backend: Mutex<Box<dyn GpioBackend>>,
    released: AtomicBool,
}

impl Drop for Shared {
    fn drop(&mut self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            lock(&self.backend).release();
        }
    }
}

impl Hardware {
    pub fn new(backend: impl GpioBackend + 'static) -> Self {
        Self {
            shared: Arc::new(Shared {
                backend: Mutex::new(Box::new(backend)),
                released: AtomicBool::new(false),
            }),
        }
    }

    fn backend(&self) -> Result<MutexGuard<'_, Box<dyn GpioBackend>>> {
        if self.shared.released.load(Ordering::SeqCst) {
            return Err(Error::hardware("hardware context has been released"));
        }
        Ok(lock(&self.shared.backend))
    }

    pub fn configure_output(&self, pin: BcmPin, initial: Level) -> Result<()> {
        debug!("GPIO {}: configuring as output, initial {:?}", pin, initial);
        self.backend()?.configure_output(pin, initial)
    }

    pub fn configure_input(&self, pin: BcmPin, pull: Pull) -> Result<()> {
        debug!("GPIO {}: configuring as input, pull {:?}", pin, pull);
        self.backend()?.configure_input(pin, pull)
    }

    pub fn write(&self, pin: BcmPin, level: Level) -> Result<()> {
        self.backend()?.write(pin, level)
    }

    pub fn read(&self, pin: BcmPin) -> Result<Level> {
        self.backend()?.read(pin)
    }

    pub fn transmit(&self, pin: BcmPin, pulses: &[Pulse]) -> Result<Duration> {
        self.backend()?.transmit(pin, pulses)
    }

    pub fn wait_overhead(&self, samples: u32) -> Result<Duration> {
        Ok(self.backend()?.wait_overhead(samples))
    }

    pub fn paces_by_deadline(&self) -> Result<bool> {
        Ok(self.backend()?.paces_by_deadline())
    }

    pub fn is_released(&self) -> bool {
        self.shared.released.load(Ordering::SeqCst)
    }

    pub fn release(&self) {
        if !self.shared.released.swap(true, Ordering::SeqCst) {
            info!("Releasing GPIO");
            lock(&self.shared.backend).release();
        }
    }
}

/// Deadline at which the phase written at `written_at` ends. Phases follow
/// on from `previous` so a small delay is caught up, but a late HIGH phase
/// is never cut short and a LOW phase keeps [`MIN_LOW_PHASE`].
pub fn phase_deadline(previous: Instant, written_at: Instant, pulse: &Pulse) -> Instant {
    let floor = match pulse.level {
        Level::High => pulse.duration,
        Level::Low => pulse.duration.min(MIN_LOW_PHASE),
    };
    (previous + pulse.duration).max(written_at + floor)
}

#[cfg(test)]
mod tests {
    use super::sim::SimGpio;
    use super::*;

    #[test]
    fn test_release_once() {
        let sim = SimGpio::new();
        let probe = sim.probe();
        let hardware = Hardware::new(sim);

        hardware.configure_output(4, Level::High).unwrap();
        assert_eq!(probe.level(4), Some(Level::High));

        hardware.release();
        hardware.release();
        assert!(probe.released());
        assert!(matches!(
            hardware.write(4, Level::Low),
            Err(Error::Hardware(_))
        ));
    }

    #[test]
    fn test_release_on_last_drop() {
        let sim = SimGpio::new();
        let probe = sim.probe();
        let hardware = Hardware::new(sim);
        let clone = hardware.clone();

        drop(hardware);
        assert!(!probe.released());
        drop(clone);
        assert!(probe.released());
    }

    fn pulse(level: Level, micros: u64) -> Pulse {
        Pulse {
            level,
            duration: Duration::from_micros(micros),
        }
    }

    #[test]
    fn test_phase_deadline_on_schedule() {
        let start = Instant::now();
        let high = pulse(Level::High, 10);

        assert_eq!(
            phase_deadline(start, start, &high),
            start + Duration::from_micros(10)
        );
    }

    #[test]
    fn test_late_phase_catches_up() {
        let start = Instant::now();
        let written_at = start + Duration::from_micros(300);
        let low = pulse(Level::Low, 490);

        assert_eq!(
            phase_deadline(start, written_at, &low),
            start + Duration::from_micros(490)
        );
    }

    #[test]
    fn test_overrun_keeps_full_high_phase() {
        let start = Instant::now();
        // The previous LOW wait woke 1 ms late
        let written_at = start + Duration::from_millis(1);
        let high = pulse(Level::High, 10);

        let deadline = phase_deadline(start, written_at, &high);

        assert_eq!(deadline - written_at, Duration::from_micros(10));
    }

    #[test]
    fn test_overrun_keeps_minimum_low_phase() {
        let start = Instant::now();
        let written_at = start + Duration::from_millis(1);
        let low = pulse(Level::Low, 490);

        let deadline = phase_deadline(start, written_at, &low);

        assert_eq!(deadline - written_at, MIN_LOW_PHASE);
    }
}
