//! Syringe pumps on top of a [`Motor`].
//!
//! A move is a series of draw/push cycles: the plunger draws liquid in, then
//! pushes it out, as many times as the syringe capacity requires.

use std::{
    fmt::{self, Display},
    sync::Arc,
};

use chrono::{DateTime, Utc};
use log::info;
use serde::{Deserialize, Serialize};

use crate::{
    lock,
    stepper::{Direction, MicrostepMode, Motor, MoveRequest, SharedMotor},
    Error, Result,
};

pub mod calibration;
pub mod registry;

pub use calibration::{CalibrationPlan, LinearFit};
pub use registry::ActivePumpRegistry;

/// Movements kept in [`PumpInfo`]
const RECENT_MOVEMENTS: usize = 5;

/// How a volume becomes motor motion.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum VolumeConversion {
    /// Millilitres moved per motor revolution
    MlPerRotation(f64),
    /// Weighed steps to mass line; `None` until the calibration tool has run
    Regression(Option<LinearFit>),
}

impl Display for VolumeConversion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VolumeConversion::MlPerRotation(ml) => write!(f, "{} mL per rotation", ml),
            VolumeConversion::Regression(Some(fit)) => write!(
                f,
                "regression, {:.4} mg/step + {:.2} mg (R² {:.4})",
                fit.slope, fit.intercept, fit.r_squared
            ),
            VolumeConversion::Regression(None) => f.write_str("regression, not calibrated"),
        }
    }
}

impl VolumeConversion {
    /// Both conversions have to dispense more with more steps.
    fn check(&self, pump: &str) -> Result<()> {
        match self {
            VolumeConversion::MlPerRotation(ml) if !(ml.is_finite() && *ml > 0.0) => {
                Err(Error::invalid(format!(
                    "pump {pump}: mL per rotation must be positive, got {ml}"
                )))
            }
            VolumeConversion::Regression(Some(fit))
                if !(fit.slope.is_finite() && fit.slope > 0.0) =>
            {
                Err(Error::invalid(format!(
                    "pump {pump}: calibration slope must be positive, got {} mg/step",
                    fit.slope
                )))
            }
            _ => Ok(()),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Stroke {
    Draw,
    Push,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct MovementRecord {
    pub volume_ml: f64,
    pub stroke: Stroke,
    pub timestamp: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PumpSettings {
    pub syringe_volume_ml: f64,
    pub volume: VolumeConversion,
    pub step_mode: MicrostepMode,
    /// Direction that pulls the plunger back. Pushing runs the other way.
    pub draw_direction: Direction,
}

/// Leftovers smaller than this are float noise, not a cycle
const VOLUME_EPSILON_ML: f64 = 1e-9;

/// Volume of each draw/push cycle needed to move `volume_ml` with a syringe
/// holding `capacity_ml`.
///
/// Anything that fits is moved in one cycle. Up to two syringes' worth is
/// split into two equal cycles so neither is nearly empty. Beyond that, full
/// syringes are moved with the remainder last.
pub fn plan_cycles(volume_ml: f64, capacity_ml: f64) -> Vec<f64> {
    if volume_ml <= 0.0 || capacity_ml <= 0.0 {
        return Vec::new();
    }
    if volume_ml <= capacity_ml {
        return vec![volume_ml];
    }
    if volume_ml <= 2.0 * capacity_ml {
        return vec![volume_ml / 2.0; 2];
    }

    let mut cycles = Vec::new();
    let mut remaining = volume_ml;
    while remaining > capacity_ml {
        cycles.push(capacity_ml);
        remaining -= capacity_ml;
    }
    if remaining > VOLUME_EPSILON_ML {
        cycles.push(remaining);
    }
    cycles
}

pub struct Pump {
    name: String,
    motor: SharedMotor,
    registry: Option<Arc<ActivePumpRegistry>>,
    settings: PumpSettings,
    retracted: bool,
    history: Vec<MovementRecord>,
}

impl Pump {
    pub fn new(name: impl Into<String>, motor: SharedMotor, settings: PumpSettings) -> Result<Self> {
        let name = name.into();
        if !(settings.syringe_volume_ml.is_finite() && settings.syringe_volume_ml > 0.0) {
            return Err(Error::invalid(format!(
                "pump {}: syringe volume must be positive, got {}",
                name, settings.syringe_volume_ml
            )));
        }
        settings.volume.check(&name)?;

        Ok(Self {
            name,
            motor,
            registry: None,
            settings,
            retracted: false,
            history: Vec::new(),
        })
    }

    /// Share the motor resource with other pumps. Moves then need this pump
    /// to be the active one.
    pub fn with_registry(mut self, registry: Arc<ActivePumpRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn settings(&self) -> &PumpSettings {
        &self.settings
    }

    pub fn motor(&self) -> &SharedMotor {
        &self.motor
    }

    pub fn is_retracted(&self) -> bool {
        self.retracted
    }

    pub fn history(&self) -> &[MovementRecord] {
        &self.history
    }

    /// Store a new regression line, e.g. after running the calibration tool.
    pub fn set_volume_conversion(&mut self, volume: VolumeConversion) -> Result<()> {
        volume.check(&self.name)?;
        self.settings.volume = volume;
        Ok(())
    }

    /// Whether this pump may move. Without a registry the motor is never
    /// shared, so the answer is always yes.
    pub fn is_active(&self) -> bool {
        self.registry
            .as_ref()
            .map_or(true, |registry| registry.is_active(&self.name))
    }

    pub fn is_enabled(&self) -> bool {
        lock(&self.motor).is_enabled()
    }

    pub fn enable(&mut self) -> Result<()> {
        match &self.registry {
            Some(registry) => registry.activate(&self.name, &self.motor),
            None => lock(&self.motor).enable(),
        }
    }

    pub fn disable(&mut self) -> Result<()> {
        match &self.registry {
            Some(registry) => registry.deactivate(&self.name, &self.motor),
            None => lock(&self.motor).disable(),
        }
    }

    /// Dispense `volume_ml` at `speed` mL/s, cycling the syringe as often as
    /// needed. Each push is added to the history.
    pub fn move_volume(&mut self, volume_ml: f64, speed: f64) -> Result<()> {
        if !(volume_ml.is_finite() && volume_ml > 0.0) {
            return Err(Error::invalid(format!(
                "volume must be positive, got {volume_ml}"
            )));
        }
        if !(speed.is_finite() && speed > 0.0) {
            return Err(Error::invalid(format!("speed must be positive, got {speed}")));
        }
        if self.settings.volume == VolumeConversion::Regression(None) {
            return Err(Error::NotCalibrated);
        }

        match self.registry.clone() {
            Some(registry) => {
                let name = self.name.clone();
                registry.run_exclusive(&name, || self.run_cycles(volume_ml, speed))
            }
            None => self.run_cycles(volume_ml, speed),
        }
    }

    /// One full-syringe cycle to push air out of the lines.
    pub fn prime(&mut self, speed: f64) -> Result<()> {
        info!("Pump {}: priming", self.name);
        self.move_volume(self.settings.syringe_volume_ml, speed)
    }

    /// Draw and push exactly `steps` (in the pump's step mode) at `speed`
    /// rev/s. Used while calibrating, so nothing goes into the history.
    pub fn dispense_steps(&mut self, steps: u64, speed: f64) -> Result<()> {
        let steps = i64::try_from(steps)
            .map_err(|_| Error::invalid(format!("{steps} steps is too many")))?;
        let mode = self.settings.step_mode;
        let draw = MoveRequest::steps(steps, mode, self.settings.draw_direction, speed)?;
        let push = MoveRequest::steps(steps, mode, self.settings.draw_direction.reverse(), speed)?;

        let cycle = |pump: &mut Self| -> Result<()> {
            if !pump.retracted {
                lock(&pump.motor).move_by(&draw)?;
                pump.retracted = true;
            }
            lock(&pump.motor).move_by(&push)?;
            pump.retracted = false;
            Ok(())
        };

        match self.registry.clone() {
            Some(registry) => {
                let name = self.name.clone();
                registry.run_exclusive(&name, || cycle(self))
            }
            None => cycle(self),
        }
    }

    fn run_cycles(&mut self, volume_ml: f64, speed: f64) -> Result<()> {
        let cycles = plan_cycles(volume_ml, self.settings.syringe_volume_ml);
        info!(
            "Pump {}: moving {} mL at {} mL/s in {} cycles",
            self.name,
            volume_ml,
            speed,
            cycles.len()
        );

        for (i, cycle) in cycles.iter().enumerate() {
            if !self.retracted {
                self.stroke(Stroke::Draw, *cycle, speed)?;
                self.retracted = true;
            }
            self.stroke(Stroke::Push, *cycle, speed)?;
            self.retracted = false;

            self.history.push(MovementRecord {
                volume_ml: *cycle,
                stroke: Stroke::Push,
                timestamp: Utc::now(),
            });
            info!(
                "Pump {}: cycle {}/{} pushed {:.3} mL",
                self.name,
                i + 1,
                cycles.len(),
                cycle
            );
        }
        Ok(())
    }

    fn stroke(&self, stroke: Stroke, volume_ml: f64, speed: f64) -> Result<()> {
        let direction = match stroke {
            Stroke::Draw => self.settings.draw_direction,
            Stroke::Push => self.settings.draw_direction.reverse(),
        };
        let mut motor = lock(&self.motor);
        let request = self.request(&*motor, volume_ml, speed, direction)?;
        motor.move_by(&request)?;
        Ok(())
    }

    /// Turn a volume and flow rate into a motor move.
    fn request(
        &self,
        motor: &dyn Motor,
        volume_ml: f64,
        speed: f64,
        direction: Direction,
    ) -> Result<MoveRequest> {
        let mode = self.settings.step_mode;
        match self.settings.volume {
            VolumeConversion::MlPerRotation(ml) => {
                MoveRequest::revolutions(volume_ml / ml, mode, direction, speed / ml)
            }
            VolumeConversion::Regression(Some(fit)) => {
                let steps = fit.steps_for_volume(volume_ml).round();
                if steps < 1.0 {
                    return Err(Error::invalid(format!(
                        "{} mL is below what the calibration can dispense",
                        volume_ml
                    )));
                }
                let steps_per_second = speed / fit.ml_per_step();
                let rps = steps_per_second / motor.steps_per_revolution(mode) as f64;
                MoveRequest::steps(steps as i64, mode, direction, rps)
            }
            VolumeConversion::Regression(None) => Err(Error::NotCalibrated),
        }
    }

    pub fn print_info(&self) -> PumpInfo {
        let active = self.is_active();
        let motor = lock(&self.motor);
        let skip = self.history.len().saturating_sub(RECENT_MOVEMENTS);
        PumpInfo {
            name: self.name.clone(),
            motor: motor.label(),
            syringe_volume_ml: self.settings.syringe_volume_ml,
            volume: self.settings.volume,
            step_mode: self.settings.step_mode,
            retracted: self.retracted,
            active,
            enabled: motor.is_enabled(),
            calibrated: motor.is_calibrated(),
            position_steps: motor.position().full_steps(),
            recent_movements: self.history[skip..].to_vec(),
        }
    }
}

/// Snapshot of a pump for display.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PumpInfo {
    pub name: String,
    pub motor: String,
    pub syringe_volume_ml: f64,
    pub volume: VolumeConversion,
    pub step_mode: MicrostepMode,
    pub retracted: bool,
    pub active: bool,
    pub enabled: bool,
    pub calibrated: bool,
    /// Full steps from power-up, CCW positive
    pub position_steps: f64,
    pub recent_movements: Vec<MovementRecord>,
}

impl Display for PumpInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Pump {} on {}", self.name, self.motor)?;
        writeln!(f, "  Syringe:    {} mL", self.syringe_volume_ml)?;
        writeln!(f, "  Conversion: {}", self.volume)?;
        writeln!(f, "  Step mode:  {}", self.step_mode)?;
        writeln!(f, "  Retracted:  {}", self.retracted)?;
        writeln!(f, "  Active:     {}", self.active)?;
        writeln!(f, "  Enabled:    {}", self.enabled)?;
        writeln!(f, "  Calibrated: {}", self.calibrated)?;
        writeln!(f, "  Position:   {:.2} steps", self.position_steps)?;
        if self.recent_movements.is_empty() {
            writeln!(f, "  No movements yet")?;
        } else {
            writeln!(f, "  Recent movements:")?;
            for record in &self.recent_movements {
                writeln!(
                    f,
                    "    {} {:?} {:.3} mL",
                    record.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    record.stroke,
                    record.volume_ml
                )?;
            }
        }
        Ok(())
    }
}
