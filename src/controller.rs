use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
};

use log::{error, info, warn};

use crate::{
    config::{pin_specs, Config, MotorLayout},
    gpio::{GpioBackend, Hardware},
    lock,
    pump::{ActivePumpRegistry, Pump},
    stepper::{
        BusPins, ClusterMember, DriverCluster, DriverPins, SharedMotor, StepperDriver,
    },
    Error, Result,
};

/// Owns everything built from a [`Config`]: the hardware handle, the motors,
/// the pumps and, when pumps share a motor resource, the registry deciding
/// which of them may move.
///
/// Dropping the controller disables every motor and releases the hardware.
pub struct PumpController {
    hardware: Hardware,
    motors: Vec<SharedMotor>,
    registry: Option<Arc<ActivePumpRegistry>>,
    pumps: BTreeMap<String, Arc<Mutex<Pump>>>,
    shut_down: bool,
}

impl PumpController {
    /// Configure every driver, calibrate it at the configured speed and
    /// build the pumps.
    pub fn init(config: &Config, backend: impl GpioBackend + 'static) -> Result<Self> {
        config.validate()?;
        let hardware = Hardware::new(backend);
        let settings = config.motor.settings();

        let motors: Vec<SharedMotor> = match &config.layout {
            MotorLayout::Independent(drivers) => {
                let mut motors: Vec<SharedMotor> = Vec::new();
                for (i, map) in drivers.iter().enumerate() {
                    let pins = DriverPins::from_roles(&pin_specs(map))?;
                    let driver =
                        StepperDriver::new(format!("driver{i}"), hardware.clone(), pins, settings);
                    motors.push(Arc::new(Mutex::new(driver)));
                }
                motors
            }
            MotorLayout::Cluster { shared, enable } => {
                let pins = BusPins::from_roles(&pin_specs(shared))?;
                let enable_pins = enable.iter().map(|pin| pin.spec()).collect();
                let cluster = Arc::new(Mutex::new(DriverCluster::new(
                    "cluster",
                    hardware.clone(),
                    pins,
                    enable_pins,
                    settings,
                )?));

                let mut motors: Vec<SharedMotor> = Vec::new();
                for i in 0..enable.len() {
                    motors.push(Arc::new(Mutex::new(ClusterMember::new(cluster.clone(), i)?)));
                }
                motors
            }
        };

        let mut controller = Self {
            hardware,
            motors,
            registry: None,
            pumps: BTreeMap::new(),
            shut_down: false,
        };

        for motor in &controller.motors {
            let mut motor = lock(motor);
            motor.auto_calibrate(config.motor.calibration_speed)?;
            info!("{}: ready", motor.label());
        }

        if shares_motors(config) {
            controller.registry = Some(ActivePumpRegistry::new());
        }

        for pump_config in &config.pumps {
            let motor = controller.motors[pump_config.driver].clone();
            let mut pump = Pump::new(&pump_config.name, motor, pump_config.settings())?;
            if let Some(registry) = &controller.registry {
                pump = pump.with_registry(registry.clone());
            }
            info!(
                "Pump {}: {} mL syringe on driver {}, {}",
                pump_config.name,
                pump_config.syringe_volume_ml,
                pump_config.driver,
                pump_config.volume
            );
            controller
                .pumps
                .insert(pump_config.name.clone(), Arc::new(Mutex::new(pump)));
        }

        Ok(controller)
    }

    pub fn pump(&self, name: &str) -> Result<Arc<Mutex<Pump>>> {
        self.pumps
            .get(name)
            .cloned()
            .ok_or_else(|| Error::invalid(format!("no pump named {name}")))
    }

    pub fn pump_names(&self) -> impl Iterator<Item = &str> {
        self.pumps.keys().map(String::as_str)
    }

    pub fn registry(&self) -> Option<&Arc<ActivePumpRegistry>> {
        self.registry.as_ref()
    }

    pub fn hardware(&self) -> &Hardware {
        &self.hardware
    }

    /// Disable every motor and release the hardware. Runs once; later calls
    /// do nothing.
    pub fn shutdown(&mut self) -> Result<()> {
        if self.shut_down {
            return Ok(());
        }
        self.shut_down = true;
        info!("Shutting down");

        let mut first_error = None;
        if let Some(registry) = &self.registry {
            if let Err(e) = registry.shutdown() {
                first_error.get_or_insert(e);
            }
        }
        for motor in &self.motors {
            let mut motor = lock(motor);
            match motor.disable() {
                Ok(()) | Err(Error::NotReady) => {}
                Err(e) => {
                    error!("{}: failed to disable: {}", motor.label(), e);
                    first_error.get_or_insert(e);
                }
            }
        }
        self.hardware.release();

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for PumpController {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!("Shutdown on drop failed: {}", e);
        }
    }
}

/// Pumps need the registry when they could step each other's motors: on a
/// cluster the STEP line is shared, otherwise only if two pumps sit on the
/// same driver.
fn shares_motors(config: &Config) -> bool {
    if matches!(config.layout, MotorLayout::Cluster { .. }) {
        return true;
    }
    config
        .pumps
        .iter()
        .enumerate()
        .any(|(i, pump)| config.pumps[..i].iter().any(|other| other.driver == pump.driver))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{MotorConfig, Pin, PinConfig, PumpConfig},
        gpio::{
            sim::{SimGpio, SimProbe},
            Level,
        },
        pump::VolumeConversion,
        stepper::{Direction, MicrostepMode, PinRole},
    };
    use pi_pinout::GpioPin;

    fn pin(bcm: u8, init: Level) -> PinConfig {
        PinConfig {
            pin: Pin::Gpio(GpioPin(bcm)),
            init,
        }
    }

    fn shared_pins() -> BTreeMap<PinRole, PinConfig> {
        BTreeMap::from([
            (PinRole::Direction, pin(20, Level::Low)),
            (PinRole::Step, pin(21, Level::Low)),
            (PinRole::ModeSelect1, pin(4, Level::Low)),
            (PinRole::ModeSelect2, pin(5, Level::Low)),
            (PinRole::ModeSelect3, pin(6, Level::Low)),
        ])
    }

    fn pump_config(name: &str, driver: usize) -> PumpConfig {
        PumpConfig {
            name: name.to_string(),
            driver,
            syringe_volume_ml: 5.0,
            step_mode: MicrostepMode::Half,
            volume: VolumeConversion::MlPerRotation(1.0),
            draw_direction: Direction::CounterClockwise,
        }
    }

    fn cluster_config() -> Config {
        Config {
            motor: MotorConfig::default(),
            layout: MotorLayout::Cluster {
                shared: shared_pins(),
                enable: vec![pin(19, Level::High), pin(26, Level::High)],
            },
            pumps: vec![pump_config("left", 0), pump_config("right", 1)],
        }
    }

    fn controller(config: &Config) -> (PumpController, SimProbe) {
        let sim = SimGpio::new();
        let probe = sim.probe();
        (PumpController::init(config, sim).unwrap(), probe)
    }

    #[test]
    fn test_cluster_pumps_take_turns() {
        let (controller, probe) = controller(&cluster_config());
        let left = controller.pump("left").unwrap();
        let right = controller.pump("right").unwrap();

        lock(&left).enable().unwrap();
        lock(&left).move_volume(1.0, 1.0).unwrap();
        assert_eq!(
            lock(&right).move_volume(1.0, 1.0),
            Err(Error::NotActive("right".to_string()))
        );

        lock(&right).enable().unwrap();
        assert_eq!(probe.level(19), Some(Level::High));
        assert_eq!(probe.level(26), Some(Level::Low));
        assert!(!lock(&left).is_active());

        lock(&right).move_volume(2.0, 1.0).unwrap();
        // 1 mL and 2 mL, each drawn and pushed, at 400 half steps per mL
        assert_eq!(probe.pulse_count(21), 2 * 400 * 3);
    }

    #[test]
    fn test_independent_drivers_without_registry() {
        let mut second = shared_pins();
        for (role, bcm) in [
            (PinRole::Direction, 12),
            (PinRole::Step, 13),
            (PinRole::ModeSelect1, 16),
            (PinRole::ModeSelect2, 17),
            (PinRole::ModeSelect3, 18),
        ] {
            second.insert(role, pin(bcm, Level::Low));
        }
        second.insert(PinRole::Enable, pin(23, Level::High));
        let mut first = shared_pins();
        first.insert(PinRole::Enable, pin(22, Level::High));

        let config = Config {
            motor: MotorConfig::default(),
            layout: MotorLayout::Independent(vec![first, second]),
            pumps: vec![pump_config("a", 0), pump_config("b", 1)],
        };
        let (controller, probe) = controller(&config);

        assert!(controller.registry().is_none());
        lock(&controller.pump("b").unwrap())
            .move_volume(0.5, 1.0)
            .unwrap();
        assert_eq!(probe.pulse_count(13), 400);
        assert_eq!(probe.pulse_count(21), 0);
    }

    #[test]
    fn test_unknown_pump() {
        let (controller, _probe) = controller(&cluster_config());
        assert!(matches!(
            controller.pump("middle"),
            Err(Error::InvalidArgument(_))
        ));
        assert_eq!(controller.pump_names().collect::<Vec<_>>(), vec!["left", "right"]);
    }

    #[test]
    fn test_shutdown_disables_and_releases() {
        let (mut controller, probe) = controller(&cluster_config());
        lock(&controller.pump("left").unwrap()).enable().unwrap();

        controller.shutdown().unwrap();

        assert_eq!(probe.writes(19).last(), Some(&Level::High));
        assert_eq!(probe.level(19), Some(Level::High));
        assert_eq!(probe.level(26), Some(Level::High));
        assert!(probe.released());
        assert!(controller.shutdown().is_ok());
    }

    #[test]
    fn test_drop_releases_hardware() {
        let (controller, probe) = controller(&cluster_config());
        drop(controller);
        assert!(probe.released());
    }

    #[test]
    fn test_missing_role_fails_init() {
        let mut config = cluster_config();
        if let MotorLayout::Cluster { shared, .. } = &mut config.layout {
            shared.remove(&PinRole::Step);
        }
        assert!(matches!(
            PumpController::init(&config, SimGpio::new()),
            Err(Error::InvalidArgument(_))
        ));
    }
}
