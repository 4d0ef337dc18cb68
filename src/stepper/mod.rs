//! A4988 stepper drivers: pin maps, step resolution, single drivers and
//! clusters sharing one STEP/DIRECTION bus.

use std::sync::{Arc, Mutex};

pub mod bus;
pub mod cluster;
pub mod driver;
pub mod microstep;
pub mod pins;

pub use bus::{
    revolutions_to_steps, steps_to_revolutions, Amount, Calibration, Direction, MotorSettings,
    MoveReport, MoveRequest, Position,
};
pub use cluster::{ClusterMember, DriverCluster};
pub use driver::{DriverState, StepperDriver};
pub use microstep::{MicrostepController, MicrostepMode};
pub use pins::{BusPins, DriverPins, PinRole, PinSpec};

use crate::Result;

/// Anything a pump can turn: a standalone driver or one member of a cluster.
pub trait Motor: Send {
    /// Name used in log lines
    fn label(&self) -> String;

    fn enable(&mut self) -> Result<()>;

    fn disable(&mut self) -> Result<()>;

    fn is_enabled(&self) -> bool;

    fn is_calibrated(&self) -> bool;

    /// Enable, calibrate at `speed` rev/s with the configured pulse width,
    /// then disable again.
    fn auto_calibrate(&mut self, speed: f64) -> Result<()>;

    /// Effective steps per revolution in `mode`
    fn steps_per_revolution(&self, mode: MicrostepMode) -> u32;

    /// Run a move; the motor is disabled afterwards whatever the outcome.
    fn move_by(&mut self, request: &MoveRequest) -> Result<MoveReport>;

    fn position(&self) -> Position;
}

pub type SharedMotor = Arc<Mutex<dyn Motor>>;
