//! Several A4988s on one STEP/DIRECTION/mode-select bus, each with its own
//! ENABLE line. Only the enabled driver reacts to STEP, so at most one may be
//! enabled at any time.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use log::{error, info};

use super::{
    bus::{Calibration, Direction, MotorSettings, MoveReport, MoveRequest, Position, StepBus},
    microstep::MicrostepMode,
    pins::{check_enable, BusPins, PinSpec},
    Motor,
};
use crate::{
    gpio::{Hardware, Level},
    lock, Error, Result,
};

pub struct DriverCluster {
    name: String,
    hardware: Hardware,
    enable_pins: Vec<PinSpec>,
    bus: StepBus,
    ready: bool,
    active: Option<usize>,
    positions: Vec<Position>,
    calibration: Option<Calibration>,
}

impl DriverCluster {
    /// Every ENABLE line is checked to start HIGH; pin setup failures leave
    /// the cluster not ready, as for a single driver.
    pub fn new(
        name: impl Into<String>,
        hardware: Hardware,
        pins: BusPins,
        enable_pins: Vec<PinSpec>,
        settings: MotorSettings,
    ) -> Result<Self> {
        if enable_pins.is_empty() {
            return Err(Error::invalid("a cluster needs at least one ENABLE line"));
        }
        for enable in &enable_pins {
            check_enable(enable)?;
            if pins.specs().iter().any(|spec| spec.pin == enable.pin) {
                return Err(Error::invalid(format!(
                    "GPIO {} is both a shared line and an ENABLE line",
                    enable.pin
                )));
            }
        }
        for (i, enable) in enable_pins.iter().enumerate() {
            if enable_pins[..i].iter().any(|other| other.pin == enable.pin) {
                return Err(Error::invalid(format!(
                    "GPIO {} is used for two ENABLE lines",
                    enable.pin
                )));
            }
        }

        let mut cluster = Self {
            name: name.into(),
            bus: StepBus::new(hardware.clone(), pins, settings),
            hardware,
            positions: vec![Position::default(); enable_pins.len()],
            enable_pins,
            ready: false,
            active: None,
            calibration: None,
        };
        cluster.setup_pins();
        Ok(cluster)
    }

    fn setup_pins(&mut self) {
        let mut result = Ok(());
        for enable in &self.enable_pins {
            result = result.and_then(|_| self.hardware.configure_output(enable.pin, enable.init));
        }
        let result = result.and_then(|_| self.bus.configure());

        match result {
            Ok(()) => {
                info!(
                    "{}: pins configured for {} drivers",
                    self.name,
                    self.enable_pins.len()
                );
                self.ready = true;
            }
            Err(e) => {
                error!(
                    "{}: pin setup failed: {}. Disconnect motor power before retrying.",
                    self.name, e
                );
                self.ready = false;
            }
        }
        self.active = None;
    }

    fn require_ready(&self) -> Result<()> {
        if self.ready {
            Ok(())
        } else {
            Err(Error::NotReady)
        }
    }

    fn check_index(&self, index: usize) -> Result<()> {
        if index < self.enable_pins.len() {
            Ok(())
        } else {
            Err(Error::invalid(format!(
                "driver {} does not exist, {} has {} drivers",
                index,
                self.name,
                self.enable_pins.len()
            )))
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.enable_pins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.enable_pins.is_empty()
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// The driver currently enabled, if any
    pub fn active(&self) -> Option<usize> {
        self.active
    }

    pub fn calibration(&self) -> Option<Calibration> {
        self.calibration
    }

    pub fn steps_per_revolution(&self, mode: MicrostepMode) -> u32 {
        self.bus.steps_per_revolution(mode)
    }

    pub fn position(&self, index: usize) -> Result<Position> {
        self.check_index(index)?;
        Ok(self.positions[index])
    }

    /// Disable every other driver, then enable `index`.
    pub fn enable(&mut self, index: usize) -> Result<()> {
        self.require_ready()?;
        self.check_index(index)?;

        for (i, enable) in self.enable_pins.iter().enumerate() {
            if i != index {
                self.hardware.write(enable.pin, Level::High)?;
            }
        }
        if self.active != Some(index) {
            self.active = None;
        }
        self.hardware
            .write(self.enable_pins[index].pin, Level::Low)?;

        if self.active != Some(index) {
            info!("{}: driver {} enabled", self.name, index);
        }
        self.active = Some(index);
        Ok(())
    }

    pub fn disable(&mut self, index: usize) -> Result<()> {
        self.require_ready()?;
        self.check_index(index)?;

        self.hardware
            .write(self.enable_pins[index].pin, Level::High)?;
        if self.active == Some(index) {
            info!("{}: driver {} disabled", self.name, index);
            self.active = None;
        }
        Ok(())
    }

    /// Drive every ENABLE line HIGH. Keeps going past a failed line and
    /// reports the first error.
    pub fn disable_all(&mut self) -> Result<()> {
        self.require_ready()?;

        let mut first_error = None;
        for enable in &self.enable_pins {
            if let Err(e) = self.hardware.write(enable.pin, Level::High) {
                error!("{}: GPIO {} failed to disable: {}", self.name, enable.pin, e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => {
                if self.active.take().is_some() {
                    info!("{}: all drivers disabled", self.name);
                }
                Ok(())
            }
        }
    }

    pub fn set_direction(&mut self, direction: Direction) -> Result<()> {
        self.require_ready()?;
        if self.active.is_none() {
            return Err(Error::NotEnabled);
        }
        self.bus.set_direction(direction)
    }

    /// Calibration is shared by the whole bus. A driver has to be enabled.
    pub fn calibrate(&mut self, speed: f64, pulse_width: Duration) -> Result<Calibration> {
        self.require_ready()?;
        if self.active.is_none() {
            return Err(Error::NotEnabled);
        }
        let calibration = self.bus.calibrate(speed, pulse_width)?;
        info!(
            "{}: calibrated, overhead {:?}, step delay {:?} at {} rev/s",
            self.name, calibration.sleep_overhead, calibration.step_delay, speed
        );
        self.calibration = Some(calibration);
        Ok(calibration)
    }

    pub fn move_motor(
        &mut self,
        index: Option<usize>,
        revolutions: Option<f64>,
        steps: Option<i64>,
        mode: MicrostepMode,
        direction: Direction,
        speed: f64,
    ) -> Result<MoveReport> {
        let request = MoveRequest::new(revolutions, steps, mode, direction, speed)?;
        self.move_by(index, &request)
    }

    /// Move driver `index`. Without an index nothing moves and every driver
    /// is disabled, since the STEP line would reach whichever one happened to
    /// be enabled.
    pub fn move_by(&mut self, index: Option<usize>, request: &MoveRequest) -> Result<MoveReport> {
        self.require_ready()?;

        let Some(index) = index else {
            error!("{}: move without a driver index, disabling all", self.name);
            self.disable_all()?;
            return Err(Error::NotReady);
        };
        if let Err(e) = self.check_index(index) {
            self.disable_all()?;
            return Err(e);
        }
        let calibration = self.calibration.ok_or(Error::NotCalibrated)?;

        let result = self.run_move(index, request, &calibration);
        let disabled = self.disable_all();

        match (result, disabled) {
            (Ok(report), Ok(())) => Ok(report),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), _) => Err(e),
        }
    }

    fn run_move(
        &mut self,
        index: usize,
        request: &MoveRequest,
        calibration: &Calibration,
    ) -> Result<MoveReport> {
        let prepared = self.bus.prepare(request, calibration)?;
        info!(
            "{}: driver {} moving {} {} steps {}, position {:.2}",
            self.name,
            index,
            prepared.steps,
            prepared.mode,
            prepared.direction,
            self.positions[index].full_steps()
        );

        self.enable(index)?;
        self.set_direction(request.direction)?;
        let elapsed = self.bus.pulse(&prepared)?;
        self.positions[index].advance(prepared.direction, prepared.steps, prepared.mode);

        let report = prepared.report(elapsed);
        info!(
            "{}: driver {} now at {:.2}, measured {:.3} rev/s",
            self.name,
            index,
            self.positions[index].full_steps(),
            report.measured_rps
        );
        Ok(report)
    }

    /// Disable everything and run pin setup again.
    pub fn reset(&mut self) -> Result<()> {
        if self.ready {
            if let Err(e) = self.disable_all() {
                error!("{}: disable before reset failed: {}", self.name, e);
            }
        }
        self.setup_pins();
        self.require_ready()
    }
}

/// One driver of a shared cluster, usable wherever a [`Motor`] is expected.
pub struct ClusterMember {
    cluster: Arc<Mutex<DriverCluster>>,
    index: usize,
}

impl ClusterMember {
    pub fn new(cluster: Arc<Mutex<DriverCluster>>, index: usize) -> Result<Self> {
        lock(&cluster).check_index(index)?;
        Ok(Self { cluster, index })
    }

    pub fn index(&self) -> usize {
        self.index
    }
}

impl Motor for ClusterMember {
    fn label(&self) -> String {
        format!("{}[{}]", lock(&self.cluster).name(), self.index)
    }

    fn enable(&mut self) -> Result<()> {
        lock(&self.cluster).enable(self.index)
    }

    fn disable(&mut self) -> Result<()> {
        lock(&self.cluster).disable(self.index)
    }

    fn is_enabled(&self) -> bool {
        lock(&self.cluster).active() == Some(self.index)
    }

    fn is_calibrated(&self) -> bool {
        lock(&self.cluster).calibration().is_some()
    }

    fn auto_calibrate(&mut self, speed: f64) -> Result<()> {
        let mut cluster = lock(&self.cluster);
        let pulse_width = cluster.bus.settings().pulse_width;
        let result = cluster
            .enable(self.index)
            .and_then(|_| cluster.calibrate(speed, pulse_width));
        let disabled = cluster.disable_all();
        result?;
        disabled
    }

    fn steps_per_revolution(&self, mode: MicrostepMode) -> u32 {
        lock(&self.cluster).steps_per_revolution(mode)
    }

    fn move_by(&mut self, request: &MoveRequest) -> Result<MoveReport> {
        lock(&self.cluster).move_by(Some(self.index), request)
    }

    fn position(&self) -> Position {
        lock(&self.cluster).positions[self.index]
    }
}
