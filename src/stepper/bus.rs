use std::{
    fmt::{self, Display},
    time::Duration,
};

use log::info;
use serde::{Deserialize, Serialize};

use super::{
    microstep::{MicrostepController, MicrostepMode},
    pins::BusPins,
};
use crate::{
    gpio::{Hardware, Level},
    pulse::{PulseTimer, StepTiming},
    Error, Result,
};

/// Rotation direction of the motor shaft. CW drives DIRECTION high.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Clockwise,
    CounterClockwise,
}

impl Direction {
    pub fn level(self) -> Level {
        match self {
            Direction::Clockwise => Level::High,
            Direction::CounterClockwise => Level::Low,
        }
    }

    /// Sign applied to position changes: CCW counts up, CW counts down.
    pub fn sign(self) -> i64 {
        match self {
            Direction::Clockwise => -1,
            Direction::CounterClockwise => 1,
        }
    }

    pub fn reverse(self) -> Self {
        match self {
            Direction::Clockwise => Direction::CounterClockwise,
            Direction::CounterClockwise => Direction::Clockwise,
        }
    }
}

impl Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Clockwise => f.write_str("CW"),
            Direction::CounterClockwise => f.write_str("CCW"),
        }
    }
}

/// Position relative to power-up, in sixteenth steps so that moves in any
/// microstep mode are counted exactly.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Position(i64);

impl Position {
    const UNITS_PER_STEP: i64 = 16;

    pub fn sixteenths(self) -> i64 {
        self.0
    }

    pub fn full_steps(self) -> f64 {
        self.0 as f64 / Self::UNITS_PER_STEP as f64
    }

    pub fn revolutions(self, native_steps_per_revolution: u32) -> f64 {
        self.full_steps() / native_steps_per_revolution as f64
    }

    pub(crate) fn advance(&mut self, direction: Direction, steps: u64, mode: MicrostepMode) {
        let units = steps as i64 * (Self::UNITS_PER_STEP / mode.factor() as i64);
        self.0 += direction.sign() * units;
    }
}

/// Effective steps for `revolutions` turns in `mode`, rounded to the nearest
/// step.
pub fn revolutions_to_steps(revolutions: f64, native_spr: u32, mode: MicrostepMode) -> u64 {
    let steps = revolutions * (native_spr * mode.factor()) as f64;
    steps.round().max(0.0) as u64
}

pub fn steps_to_revolutions(steps: u64, native_spr: u32, mode: MicrostepMode) -> f64 {
    steps as f64 / (native_spr * mode.factor()) as f64
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Amount {
    Revolutions(f64),
    Steps(u64),
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MoveRequest {
    pub amount: Amount,
    pub mode: MicrostepMode,
    pub direction: Direction,
    /// Revolutions per second
    pub speed: f64,
}

impl MoveRequest {
    /// Exactly one of `revolutions` and `steps` must be given. Steps are in
    /// the units of `mode`.
    pub fn new(
        revolutions: Option<f64>,
        steps: Option<i64>,
        mode: MicrostepMode,
        direction: Direction,
        speed: f64,
    ) -> Result<Self> {
        let amount = match (revolutions, steps) {
            (Some(revolutions), None) => {
                if !(revolutions.is_finite() && revolutions > 0.0) {
                    return Err(Error::invalid(format!(
                        "revolutions must be positive, got {revolutions}"
                    )));
                }
                Amount::Revolutions(revolutions)
            }
            (None, Some(steps)) => {
                if steps <= 0 {
                    return Err(Error::invalid(format!(
                        "steps must be positive, got {steps}"
                    )));
                }
                Amount::Steps(steps as u64)
            }
            _ => {
                return Err(Error::invalid(
                    "give exactly one of revolutions or steps",
                ))
            }
        };

        if !(speed.is_finite() && speed > 0.0) {
            return Err(Error::invalid(format!("speed must be positive, got {speed}")));
        }

        Ok(Self {
            amount,
            mode,
            direction,
            speed,
        })
    }

    pub fn revolutions(
        revolutions: f64,
        mode: MicrostepMode,
        direction: Direction,
        speed: f64,
    ) -> Result<Self> {
        Self::new(Some(revolutions), None, mode, direction, speed)
    }

    pub fn steps(steps: i64, mode: MicrostepMode, direction: Direction, speed: f64) -> Result<Self> {
        Self::new(None, Some(steps), mode, direction, speed)
    }
}

/// What a finished move did, for diagnostics.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct MoveReport {
    pub steps: u64,
    pub mode: MicrostepMode,
    pub direction: Direction,
    pub revolutions: f64,
    pub elapsed: Duration,
    pub measured_rps: f64,
}

/// Timing and motor parameters shared by every driver on a board.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MotorSettings {
    /// Native full steps per revolution
    pub steps_per_revolution: u32,
    /// STEP high time
    pub pulse_width: Duration,
    /// Shortest HIGH or LOW phase the driver accepts
    pub min_pulse_width: Duration,
    /// Pulses per waveform batch
    pub batch_size: usize,
}

impl Default for MotorSettings {
    fn default() -> Self {
        Self {
            steps_per_revolution: 200,
            pulse_width: Duration::from_micros(10),
            min_pulse_width: Duration::from_micros(10),
            batch_size: crate::pulse::DEFAULT_BATCH_SIZE,
        }
    }
}

/// Measured wait overhead plus the step timing it gives at the calibration
/// speed.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct Calibration {
    pub sleep_overhead: Duration,
    /// Taken off every LOW phase. Zero when the backend waits on deadlines.
    pub low_correction: Duration,
    pub pulse_width: Duration,
    pub speed: f64,
    pub step_delay: Duration,
}

pub(crate) struct PreparedMove {
    pub steps: u64,
    pub mode: MicrostepMode,
    pub direction: Direction,
    pub timing: StepTiming,
    steps_per_revolution: u32,
}

impl PreparedMove {
    pub fn report(&self, elapsed: Duration) -> MoveReport {
        let revolutions = self.steps as f64 / self.steps_per_revolution as f64;
        let measured_rps = if elapsed.is_zero() {
            0.0
        } else {
            revolutions / elapsed.as_secs_f64()
        };
        MoveReport {
            steps: self.steps,
            mode: self.mode,
            direction: self.direction,
            revolutions,
            elapsed,
            measured_rps,
        }
    }
}

/// DIRECTION, STEP and mode-select lines with the pulse timer behind them.
/// A standalone driver owns one; a cluster shares one between all members.
pub(crate) struct StepBus {
    hardware: Hardware,
    pins: BusPins,
    microstep: MicrostepController,
    pulse: PulseTimer,
    settings: MotorSettings,
    direction: Option<Direction>,
}

impl StepBus {
    pub fn new(hardware: Hardware, pins: BusPins, settings: MotorSettings) -> Self {
        Self {
            microstep: MicrostepController::new(hardware.clone(), pins.mode_select_pins()),
            pulse: PulseTimer::new(hardware.clone()).with_batch_size(settings.batch_size),
            hardware,
            pins,
            settings,
            direction: None,
        }
    }

    /// Configure every line at its initial level, then select full steps.
    pub fn configure(&mut self) -> Result<()> {
        for spec in self.pins.specs() {
            self.hardware.configure_output(spec.pin, spec.init)?;
        }
        self.microstep.set(MicrostepMode::Full)?;
        self.direction = None;
        Ok(())
    }

    pub fn settings(&self) -> &MotorSettings {
        &self.settings
    }

    pub fn mode(&self) -> MicrostepMode {
        self.microstep.get_mode()
    }

    pub fn direction(&self) -> Option<Direction> {
        self.direction
    }

    pub fn steps_per_revolution(&self, mode: MicrostepMode) -> u32 {
        self.settings.steps_per_revolution * mode.factor()
    }

    pub fn set_mode(&mut self, mode: MicrostepMode) -> Result<u32> {
        self.microstep.set(mode)
    }

    pub fn set_direction(&mut self, direction: Direction) -> Result<()> {
        self.hardware
            .write(self.pins.direction.pin, direction.level())?;
        if self.direction != Some(direction) {
            info!("Direction set to {}", direction);
        }
        self.direction = Some(direction);
        Ok(())
    }

    /// Measure the wait overhead and the step delay it gives at `speed` in
    /// the current mode.
    pub fn calibrate(&mut self, speed: f64, pulse_width: Duration) -> Result<Calibration> {
        let sleep_overhead = self.pulse.calibrate_sleep_overhead()?;
        let low_correction = if self.hardware.paces_by_deadline()? {
            Duration::ZERO
        } else {
            sleep_overhead
        };
        let timing = StepTiming::for_speed(
            speed,
            self.steps_per_revolution(self.mode()),
            pulse_width,
            self.settings.min_pulse_width,
            low_correction,
        )?;
        Ok(Calibration {
            sleep_overhead,
            low_correction,
            pulse_width: timing.high,
            speed,
            step_delay: timing.low,
        })
    }

    /// Select the mode and work out step count and timing. Nothing moves yet.
    pub fn prepare(
        &mut self,
        request: &MoveRequest,
        calibration: &Calibration,
    ) -> Result<PreparedMove> {
        self.microstep.set(request.mode)?;
        let spr = self.steps_per_revolution(request.mode);

        let steps = match request.amount {
            Amount::Revolutions(revolutions) => {
                revolutions_to_steps(revolutions, self.settings.steps_per_revolution, request.mode)
            }
            Amount::Steps(steps) => steps,
        };
        if steps == 0 {
            return Err(Error::invalid(format!(
                "{:?} rounds to zero {} steps",
                request.amount, request.mode
            )));
        }

        let timing = StepTiming::for_speed(
            request.speed,
            spr,
            calibration.pulse_width,
            self.settings.min_pulse_width,
            calibration.low_correction,
        )?;

        Ok(PreparedMove {
            steps,
            mode: request.mode,
            direction: request.direction,
            timing,
            steps_per_revolution: spr,
        })
    }

    pub fn pulse(&self, prepared: &PreparedMove) -> Result<Duration> {
        self.pulse.run(
            self.pins.step.pin,
            prepared.steps,
            prepared.timing.high,
            prepared.timing.low,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sixteenth_mode_step_count() {
        assert_eq!(
            revolutions_to_steps(4.0, 200, MicrostepMode::Sixteenth),
            12_800
        );
    }

    #[test]
    fn test_rounds_to_nearest_step() {
        assert_eq!(revolutions_to_steps(0.0026, 200, MicrostepMode::Full), 1);
        assert_eq!(revolutions_to_steps(0.0024, 200, MicrostepMode::Full), 0);
    }

    #[test]
    fn test_position_sign_convention() {
        let mut position = Position::default();
        position.advance(Direction::CounterClockwise, 200, MicrostepMode::Full);
        assert_eq!(position.full_steps(), 200.0);

        position.advance(Direction::Clockwise, 1600, MicrostepMode::Eighth);
        assert_eq!(position.full_steps(), 0.0);

        position.advance(Direction::Clockwise, 1, MicrostepMode::Sixteenth);
        assert_eq!(position.sixteenths(), -1);
    }

    #[test]
    fn test_move_request_needs_exactly_one_amount() {
        let mode = MicrostepMode::Full;
        let dir = Direction::Clockwise;

        assert!(MoveRequest::new(Some(1.0), None, mode, dir, 1.0).is_ok());
        assert!(MoveRequest::new(None, Some(10), mode, dir, 1.0).is_ok());
        for (revolutions, steps) in [(None, None), (Some(1.0), Some(10))] {
            assert!(matches!(
                MoveRequest::new(revolutions, steps, mode, dir, 1.0),
                Err(Error::InvalidArgument(_))
            ));
        }
        assert!(MoveRequest::steps(0, mode, dir, 1.0).is_err());
        assert!(MoveRequest::revolutions(-2.0, mode, dir, 1.0).is_err());
        assert!(MoveRequest::revolutions(1.0, mode, dir, 0.0).is_err());
    }
}
