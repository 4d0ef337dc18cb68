//! Step pulse generation.
//!
//! A move is emitted as one precomputed waveform of HIGH/LOW phases on the
//! STEP line. Long moves are split into fixed-size batches that the backend
//! plays back to back, so memory stays bounded no matter how many steps are
//! requested.

use std::time::Duration;

use log::{debug, error, info};

use crate::{
    gpio::{BcmPin, Hardware, Level, Pulse},
    Error, Result,
};

/// Number of minimal waits timed when measuring the wait overhead
pub const CALIBRATION_SAMPLES: u32 = 10_000;

/// Pulses per waveform batch
pub const DEFAULT_BATCH_SIZE: usize = 50;

/// HIGH and LOW phase lengths of a single step pulse.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StepTiming {
    pub high: Duration,
    pub low: Duration,
}

impl StepTiming {
    /// Timing for a motor turning at `speed_rps` revolutions per second with
    /// `steps_per_revolution` effective (microstepped) steps.
    ///
    /// The per-step period is `1 / (speed_rps * steps_per_revolution)`.
    /// `overhead` is taken off the LOW phase, which never drops below
    /// `min_width`.
    pub fn for_speed(
        speed_rps: f64,
        steps_per_revolution: u32,
        high: Duration,
        min_width: Duration,
        overhead: Duration,
    ) -> Result<Self> {
        if !(speed_rps.is_finite() && speed_rps > 0.0) {
            return Err(Error::invalid(format!(
                "speed must be a positive number of revolutions per second, got {speed_rps}"
            )));
        }
        if steps_per_revolution == 0 {
            return Err(Error::invalid("steps per revolution must be non-zero"));
        }

        let period =
            Duration::try_from_secs_f64(1.0 / (speed_rps * steps_per_revolution as f64))
                .map_err(|e| Error::invalid(format!("speed {speed_rps} rev/s: {e}")))?;

        let high = high.max(min_width);
        let low = period
            .saturating_sub(high)
            .saturating_sub(overhead)
            .max(min_width);

        Ok(Self { high, low })
    }

    pub fn period(&self) -> Duration {
        self.high + self.low
    }
}

/// Lazily built batches of a pulse train.
struct Batches {
    remaining: u64,
    batch_size: u64,
    timing: StepTiming,
}

impl Iterator for Batches {
    type Item = Vec<Pulse>;

    fn next(&mut self) -> Option<Vec<Pulse>> {
        if self.remaining == 0 {
            return None;
        }
        let count = self.remaining.min(self.batch_size);
        self.remaining -= count;

        let mut pulses = Vec::with_capacity(count as usize * 2);
        for _ in 0..count {
            pulses.push(Pulse {
                level: Level::High,
                duration: self.timing.high,
            });
            pulses.push(Pulse {
                level: Level::Low,
                duration: self.timing.low,
            });
        }
        Some(pulses)
    }
}

pub struct PulseTimer {
    hardware: Hardware,
    batch_size: usize,
}

impl PulseTimer {
    pub fn new(hardware: Hardware) -> Self {
        Self {
            hardware,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Emit exactly `pulse_count` pulses on `pin` and block until the last
    /// one has finished. Returns the wall time the train took.
    ///
    /// If the backend fails part way the pin is driven LOW before the error
    /// is returned.
    pub fn run(
        &self,
        pin: BcmPin,
        pulse_count: u64,
        high: Duration,
        low: Duration,
    ) -> Result<Duration> {
        if pulse_count == 0 {
            return Err(Error::invalid("pulse count must be greater than zero"));
        }
        if high.is_zero() || low.is_zero() {
            return Err(Error::invalid("pulse phases must be longer than zero"));
        }

        let batches = Batches {
            remaining: pulse_count,
            batch_size: self.batch_size as u64,
            timing: StepTiming { high, low },
        };

        debug!(
            "GPIO {}: {} pulses, high {:?}, low {:?}",
            pin, pulse_count, high, low
        );

        let mut elapsed = Duration::ZERO;
        for batch in batches {
            match self.hardware.transmit(pin, &batch) {
                Ok(batch_time) => elapsed += batch_time,
                Err(e) => {
                    error!("GPIO {}: pulse train failed: {}", pin, e);
                    if let Err(e) = self.hardware.write(pin, Level::Low) {
                        error!("GPIO {}: could not force LOW: {}", pin, e);
                    }
                    return Err(match e {
                        Error::Hardware(_) => e,
                        other => Error::hardware(other.to_string()),
                    });
                }
            }
        }

        Ok(elapsed)
    }

    /// Measure the average cost of the backend's minimal wait.
    pub fn calibrate_sleep_overhead(&self) -> Result<Duration> {
        let overhead = self.hardware.wait_overhead(CALIBRATION_SAMPLES)?;
        info!(
            "Wait overhead is ~{:?} per call ({} samples)",
            overhead, CALIBRATION_SAMPLES
        );
        Ok(overhead)
    }
}
