use std::time::Duration;

use log::{error, info, warn};
use serde::Serialize;

use super::{
    bus::{Calibration, Direction, MotorSettings, MoveReport, MoveRequest, Position, StepBus},
    microstep::MicrostepMode,
    pins::{DriverPins, PinSpec},
    Motor,
};
use crate::{
    gpio::{Hardware, Level},
    Error, Result,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum DriverState {
    /// Pin setup failed; every operation returns [`Error::NotReady`]
    Uninitialized,
    /// Pins are at their initial levels and the motor is unpowered
    PinsConfigured,
    Disabled,
    Enabled,
}

/// One A4988 with its own ENABLE line.
pub struct StepperDriver {
    name: String,
    hardware: Hardware,
    enable_pin: PinSpec,
    bus: StepBus,
    state: DriverState,
    position: Position,
    calibration: Option<Calibration>,
}

impl StepperDriver {
    /// Configure every line of the driver. A failure is logged and leaves the
    /// driver `Uninitialized`; [`StepperDriver::reset`] retries.
    pub fn new(
        name: impl Into<String>,
        hardware: Hardware,
        pins: DriverPins,
        settings: MotorSettings,
    ) -> Self {
        let mut driver = Self {
            name: name.into(),
            bus: StepBus::new(hardware.clone(), pins.bus, settings),
            hardware,
            enable_pin: pins.enable,
            state: DriverState::Uninitialized,
            position: Position::default(),
            calibration: None,
        };
        driver.setup_pins();
        driver
    }

    fn setup_pins(&mut self) {
        // ENABLE goes first so nothing else can energize the coils
        let result = self
            .hardware
            .configure_output(self.enable_pin.pin, self.enable_pin.init)
            .and_then(|_| self.bus.configure());

        match result {
            Ok(()) => {
                info!("{}: pins configured", self.name);
                self.state = DriverState::PinsConfigured;
            }
            Err(e) => {
                error!(
                    "{}: pin setup failed: {}. Disconnect motor power before retrying.",
                    self.name, e
                );
                self.state = DriverState::Uninitialized;
            }
        }
    }

    fn require_ready(&self) -> Result<()> {
        match self.state {
            DriverState::Uninitialized => Err(Error::NotReady),
            _ => Ok(()),
        }
    }

    fn require_enabled(&self) -> Result<()> {
        self.require_ready()?;
        match self.state {
            DriverState::Enabled => Ok(()),
            _ => Err(Error::NotEnabled),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> DriverState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state != DriverState::Uninitialized
    }

    pub fn is_enabled(&self) -> bool {
        self.state == DriverState::Enabled
    }

    pub fn direction(&self) -> Option<Direction> {
        self.bus.direction()
    }

    pub fn mode(&self) -> MicrostepMode {
        self.bus.mode()
    }

    pub fn relative_position(&self) -> Position {
        self.position
    }

    pub fn calibration(&self) -> Option<Calibration> {
        self.calibration
    }

    pub fn settings(&self) -> &MotorSettings {
        self.bus.settings()
    }

    /// Energize the coils (ENABLE low).
    pub fn enable(&mut self) -> Result<()> {
        self.require_ready()?;
        self.hardware.write(self.enable_pin.pin, Level::Low)?;
        if self.state != DriverState::Enabled {
            info!("{}: enabled", self.name);
        }
        self.state = DriverState::Enabled;
        Ok(())
    }

    /// De-energize the coils (ENABLE high). Safe to call repeatedly.
    pub fn disable(&mut self) -> Result<()> {
        self.require_ready()?;
        self.hardware.write(self.enable_pin.pin, Level::High)?;
        if self.state == DriverState::Enabled {
            info!("{}: disabled", self.name);
        }
        self.state = DriverState::Disabled;
        Ok(())
    }

    /// Only allowed while enabled, so the driver is never commanded while its
    /// logic state is unknown.
    pub fn set_direction(&mut self, direction: Direction) -> Result<()> {
        self.require_enabled()?;
        self.bus.set_direction(direction)
    }

    pub fn set_step_mode(&mut self, mode: MicrostepMode) -> Result<u32> {
        self.require_ready()?;
        self.bus.set_mode(mode)
    }

    /// Measure the wait overhead used to correct step timing. Has to run,
    /// while enabled, before the first move.
    pub fn calibrate(&mut self, speed: f64, pulse_width: Duration) -> Result<Calibration> {
        self.require_enabled()?;
        let calibration = self.bus.calibrate(speed, pulse_width)?;
        info!(
            "{}: calibrated, overhead {:?}, step delay {:?} at {} rev/s",
            self.name, calibration.sleep_overhead, calibration.step_delay, speed
        );
        self.calibration = Some(calibration);
        Ok(calibration)
    }

    /// Move by `revolutions` or by `steps` (in units of `mode`), but not
    /// both.
    pub fn move_motor(
        &mut self,
        revolutions: Option<f64>,
        steps: Option<i64>,
        mode: MicrostepMode,
        direction: Direction,
        speed: f64,
    ) -> Result<MoveReport> {
        let request = MoveRequest::new(revolutions, steps, mode, direction, speed)?;
        self.move_by(&request)
    }

    /// Enable, turn, disable. The driver ends disabled whether or not the
    /// move succeeded.
    pub fn move_by(&mut self, request: &MoveRequest) -> Result<MoveReport> {
        self.require_ready()?;
        let calibration = self.calibration.ok_or(Error::NotCalibrated)?;

        let result = self.run_move(request, &calibration);
        let disabled = self.disable();

        match (result, disabled) {
            (Ok(report), Ok(())) => Ok(report),
            (Ok(_), Err(e)) => {
                error!("{}: could not disable after move: {}", self.name, e);
                Err(e)
            }
            (Err(e), disabled) => {
                if let Err(disable_error) = disabled {
                    error!(
                        "{}: could not disable after failed move: {}",
                        self.name, disable_error
                    );
                }
                Err(e)
            }
        }
    }

    fn run_move(&mut self, request: &MoveRequest, calibration: &Calibration) -> Result<MoveReport> {
        let prepared = self.bus.prepare(request, calibration)?;
        info!(
            "{}: moving {} {} steps {} at {} rev/s",
            self.name, prepared.steps, prepared.mode, prepared.direction, request.speed
        );

        self.enable()?;
        self.set_direction(request.direction)?;
        let elapsed = self.bus.pulse(&prepared)?;
        self.position
            .advance(prepared.direction, prepared.steps, prepared.mode);

        let report = prepared.report(elapsed);
        info!(
            "{}: moved {:.3} rev in {:?}, measured {:.3} rev/s",
            self.name, report.revolutions, report.elapsed, report.measured_rps
        );
        Ok(report)
    }

    /// Disable if needed and run pin setup again.
    pub fn reset(&mut self) -> Result<()> {
        if self.is_enabled() {
            if let Err(e) = self.disable() {
                warn!("{}: disable before reset failed: {}", self.name, e);
            }
        }
        self.setup_pins();
        self.require_ready()
    }
}

impl Motor for StepperDriver {
    fn label(&self) -> String {
        self.name.clone()
    }

    fn enable(&mut self) -> Result<()> {
        StepperDriver::enable(self)
    }

    fn disable(&mut self) -> Result<()> {
        StepperDriver::disable(self)
    }

    fn is_enabled(&self) -> bool {
        StepperDriver::is_enabled(self)
    }

    fn is_calibrated(&self) -> bool {
        self.calibration.is_some()
    }

    fn auto_calibrate(&mut self, speed: f64) -> Result<()> {
        let pulse_width = self.bus.settings().pulse_width;
        let result = self
            .enable()
            .and_then(|_| self.calibrate(speed, pulse_width));
        let disabled = StepperDriver::disable(self);
        result?;
        disabled
    }

    fn steps_per_revolution(&self, mode: MicrostepMode) -> u32 {
        self.bus.steps_per_revolution(mode)
    }

    fn move_by(&mut self, request: &MoveRequest) -> Result<MoveReport> {
        StepperDriver::move_by(self, request)
    }

    fn position(&self) -> Position {
        self.position
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        gpio::sim::{SimEvent, SimGpio, SimProbe},
        stepper::pins::tests::roles,
    };

    const ENABLE: u8 = 22;
    const DIR: u8 = 20;
    const STEP: u8 = 21;

    fn driver_with(sim: SimGpio) -> (StepperDriver, SimProbe) {
        let probe = sim.probe();
        let pins = DriverPins::from_roles(&roles(Some(ENABLE))).unwrap();
        let driver = StepperDriver::new(
            "test",
            Hardware::new(sim),
            pins,
            MotorSettings::default(),
        );
        (driver, probe)
    }

    fn calibrated() -> (StepperDriver, SimProbe) {
        let (mut driver, probe) = driver_with(SimGpio::new());
        driver.enable().unwrap();
        driver.calibrate(1.0, Duration::from_micros(10)).unwrap();
        driver.disable().unwrap();
        probe.clear_events();
        (driver, probe)
    }

    #[test]
    fn test_setup_configures_pins_disabled() {
        let (driver, probe) = driver_with(SimGpio::new());

        assert_eq!(driver.state(), DriverState::PinsConfigured);
        assert!(!driver.is_enabled());
        assert_eq!(probe.level(ENABLE), Some(Level::High));
        assert_eq!(
            probe.events()[0],
            SimEvent::Output {
                pin: ENABLE,
                level: Level::High
            }
        );
    }

    #[test]
    fn test_failed_setup_is_not_ready() {
        let sim = SimGpio::new();
        sim.probe().fail_configure(STEP, true);
        let (mut driver, _probe) = driver_with(sim);

        assert_eq!(driver.state(), DriverState::Uninitialized);
        assert_eq!(driver.enable(), Err(Error::NotReady));
        assert_eq!(driver.disable(), Err(Error::NotReady));
        assert_eq!(
            driver.move_motor(Some(1.0), None, MicrostepMode::Full, Direction::Clockwise, 1.0),
            Err(Error::NotReady)
        );
    }

    #[test]
    fn test_disable_is_idempotent() {
        let (mut driver, probe) = driver_with(SimGpio::new());

        driver.disable().unwrap();
        assert!(!driver.is_enabled());
        driver.disable().unwrap();
        assert!(!driver.is_enabled());
        assert_eq!(probe.level(ENABLE), Some(Level::High));
    }

    #[test]
    fn test_direction_requires_enable() {
        let (mut driver, probe) = driver_with(SimGpio::new());

        assert_eq!(
            driver.set_direction(Direction::Clockwise),
            Err(Error::NotEnabled)
        );

        driver.enable().unwrap();
        driver.set_direction(Direction::Clockwise).unwrap();
        assert_eq!(probe.level(DIR), Some(Level::High));
        driver.set_direction(Direction::CounterClockwise).unwrap();
        assert_eq!(probe.level(DIR), Some(Level::Low));
    }

    #[test]
    fn test_calibrate_requires_enable() {
        let (mut driver, _probe) = driver_with(SimGpio::new());
        assert_eq!(
            driver.calibrate(1.0, Duration::from_micros(10)),
            Err(Error::NotEnabled)
        );
    }

    #[test]
    fn test_move_requires_calibration() {
        let (mut driver, probe) = driver_with(SimGpio::new());

        assert_eq!(
            driver.move_motor(Some(1.0), None, MicrostepMode::Full, Direction::Clockwise, 1.0),
            Err(Error::NotCalibrated)
        );
        assert_eq!(probe.pulse_count(STEP), 0);
    }

    #[test]
    fn test_move_revolutions_in_sixteenth_mode() {
        let (mut driver, probe) = calibrated();

        let report = driver
            .move_motor(
                Some(4.0),
                None,
                MicrostepMode::Sixteenth,
                Direction::CounterClockwise,
                2.0,
            )
            .unwrap();

        assert_eq!(report.steps, 12_800);
        assert_eq!(probe.pulse_count(STEP), 12_800);
        assert!((report.revolutions - 4.0).abs() < 1e-9);
        assert!(report.measured_rps > 0.0);
        assert_eq!(driver.relative_position().full_steps(), 800.0);
        assert_eq!(driver.mode(), MicrostepMode::Sixteenth);
        assert!(!driver.is_enabled());
    }

    #[test]
    fn test_move_sequence_enables_then_disables() {
        let (mut driver, probe) = calibrated();

        driver
            .move_motor(None, Some(10), MicrostepMode::Full, Direction::Clockwise, 1.0)
            .unwrap();

        let events = probe.events();
        let enable_at = events
            .iter()
            .position(|e| *e == SimEvent::Write { pin: ENABLE, level: Level::Low })
            .unwrap();
        let direction_at = events
            .iter()
            .position(|e| *e == SimEvent::Write { pin: DIR, level: Level::High })
            .unwrap();
        let pulses_at = events
            .iter()
            .position(|e| matches!(e, SimEvent::Pulses { pin: STEP, .. }))
            .unwrap();
        let disable_at = events
            .iter()
            .rposition(|e| *e == SimEvent::Write { pin: ENABLE, level: Level::High })
            .unwrap();

        assert!(enable_at < direction_at);
        assert!(direction_at < pulses_at);
        assert!(pulses_at < disable_at);
        assert_eq!(driver.relative_position().full_steps(), -10.0);
    }

    #[test]
    fn test_failed_move_leaves_driver_disabled() {
        let (mut driver, probe) = calibrated();
        probe.fail_transmit(true);

        let result =
            driver.move_motor(Some(1.0), None, MicrostepMode::Full, Direction::Clockwise, 1.0);

        assert!(matches!(result, Err(Error::Hardware(_))));
        assert!(!driver.is_enabled());
        assert_eq!(probe.level(ENABLE), Some(Level::High));
        assert_eq!(probe.level(STEP), Some(Level::Low));
        assert_eq!(driver.relative_position(), Position::default());
    }

    #[test]
    fn test_move_rounding_to_zero_is_rejected() {
        let (mut driver, probe) = calibrated();

        let result =
            driver.move_motor(Some(0.001), None, MicrostepMode::Full, Direction::Clockwise, 1.0);

        assert!(matches!(result, Err(Error::InvalidArgument(_))));
        assert_eq!(probe.pulse_count(STEP), 0);
        assert!(!driver.is_enabled());
    }

    #[test]
    fn test_reset_from_enabled() {
        let (mut driver, probe) = calibrated();
        driver.enable().unwrap();

        driver.reset().unwrap();

        assert_eq!(driver.state(), DriverState::PinsConfigured);
        assert_eq!(driver.direction(), None);
        assert_eq!(probe.level(ENABLE), Some(Level::High));
    }

    #[test]
    fn test_reset_recovers_after_fault_clears() {
        let sim = SimGpio::new();
        let probe = sim.probe();
        probe.fail_configure(STEP, true);
        let (mut driver, _) = driver_with(sim);
        assert_eq!(driver.state(), DriverState::Uninitialized);
        assert_eq!(driver.enable(), Err(Error::NotReady));

        assert_eq!(driver.reset(), Err(Error::NotReady));
        assert_eq!(driver.state(), DriverState::Uninitialized);

        probe.fail_configure(STEP, false);
        driver.reset().unwrap();

        assert_eq!(driver.state(), DriverState::PinsConfigured);
        assert_eq!(probe.level(STEP), Some(Level::Low));
        driver.enable().unwrap();
        assert!(driver.is_enabled());
    }

    #[test]
    fn test_deadline_paced_move_keeps_requested_speed() {
        let (mut driver, probe) = driver_with(SimGpio::new().deadline_paced());
        probe.set_wait_overhead(Duration::from_micros(56));
        driver.enable().unwrap();
        let calibration = driver.calibrate(1.0, Duration::from_micros(10)).unwrap();
        driver.disable().unwrap();

        assert_eq!(calibration.sleep_overhead, Duration::from_micros(56));
        assert_eq!(calibration.low_correction, Duration::ZERO);

        let report = driver
            .move_motor(
                Some(0.5),
                None,
                MicrostepMode::Sixteenth,
                Direction::CounterClockwise,
                1.0,
            )
            .unwrap();

        // 3200 steps per revolution at 1 rev/s is a 312.5 µs period
        assert_eq!(report.steps, 1600);
        assert_eq!(report.elapsed, Duration::from_micros(500_000));
        assert!((report.measured_rps - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_sleep_paced_move_takes_overhead_off_low_phase() {
        let (mut driver, probe) = driver_with(SimGpio::new());
        probe.set_wait_overhead(Duration::from_micros(50));
        driver.enable().unwrap();
        let calibration = driver.calibrate(1.0, Duration::from_micros(10)).unwrap();

        assert_eq!(calibration.low_correction, Duration::from_micros(50));
        // Full steps at 1 rev/s: 5 ms period less the HIGH phase and overhead
        assert_eq!(calibration.step_delay, Duration::from_micros(4940));
    }

    #[test]
    fn test_auto_calibrate_leaves_motor_disabled() {
        let (mut driver, _probe) = driver_with(SimGpio::new());

        Motor::auto_calibrate(&mut driver, 1.0).unwrap();

        assert!(Motor::is_calibrated(&driver));
        assert!(!driver.is_enabled());
    }
}
