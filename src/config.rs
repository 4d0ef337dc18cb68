use std::{collections::BTreeMap, path::Path, time::Duration};

use pi_pinout::{GpioPin, PhysicalPin, WiringPiPin};
use serde::{Deserialize, Serialize};

use crate::{
    gpio::{BcmPin, Level},
    pump::{PumpSettings, VolumeConversion},
    stepper::{Direction, MicrostepMode, MotorSettings, PinRole, PinSpec},
    Error, Result,
};

pub const CONFIG_PATH: &str = "config.ron";

#[derive(Debug, Deserialize, Serialize, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub motor: MotorConfig,
    pub layout: MotorLayout,
    pub pumps: Vec<PumpConfig>,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct MotorConfig {
    /// Native full steps per revolution
    pub steps_per_revolution: u32,
    /// STEP high time in microseconds
    pub pulse_width_us: u64,
    /// Shortest phase the driver accepts, in microseconds
    pub min_pulse_width_us: u64,
    /// Pulses per waveform batch
    pub batch_size: usize,
    /// Speed in rev/s used for the start-up calibration
    pub calibration_speed: f64,
}

impl Default for MotorConfig {
    fn default() -> Self {
        Self {
            steps_per_revolution: 200,
            pulse_width_us: 10,
            min_pulse_width_us: 10,
            batch_size: crate::pulse::DEFAULT_BATCH_SIZE,
            calibration_speed: 1.0,
        }
    }
}

impl MotorConfig {
    pub fn settings(&self) -> MotorSettings {
        MotorSettings {
            steps_per_revolution: self.steps_per_revolution,
            pulse_width: Duration::from_micros(self.pulse_width_us),
            min_pulse_width: Duration::from_micros(self.min_pulse_width_us),
            batch_size: self.batch_size,
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq)]
pub enum Pin {
    Physical(PhysicalPin),
    Gpio(GpioPin),
    WiringPi(WiringPiPin),
}

impl Pin {
    /// BCM number of the line
    pub fn bcm(&self) -> BcmPin {
        let pin: GpioPin = match *self {
            Pin::Physical(pin) => pin.into(),
            Pin::Gpio(pin) => pin,
            Pin::WiringPi(pin) => pin.into(),
        };
        pin.0
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq)]
pub struct PinConfig {
    pub pin: Pin,
    #[serde(default = "default_init")]
    pub init: Level,
}

fn default_init() -> Level {
    Level::Low
}

impl PinConfig {
    pub fn spec(&self) -> PinSpec {
        PinSpec {
            pin: self.pin.bcm(),
            init: self.init,
        }
    }
}

pub type PinMap = BTreeMap<PinRole, PinConfig>;

pub fn pin_specs(map: &PinMap) -> BTreeMap<PinRole, PinSpec> {
    map.iter().map(|(role, pin)| (*role, pin.spec())).collect()
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub enum MotorLayout {
    /// One complete pin map per driver
    Independent(Vec<PinMap>),
    /// Drivers sharing DIRECTION, STEP and mode selects, each with its own
    /// ENABLE line
    Cluster {
        shared: PinMap,
        enable: Vec<PinConfig>,
    },
}

impl MotorLayout {
    pub fn driver_count(&self) -> usize {
        match self {
            MotorLayout::Independent(drivers) => drivers.len(),
            MotorLayout::Cluster { enable, .. } => enable.len(),
        }
    }
}

fn default_draw_direction() -> Direction {
    Direction::CounterClockwise
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct PumpConfig {
    pub name: String,
    /// Index into the layout's drivers
    pub driver: usize,
    pub syringe_volume_ml: f64,
    #[serde(default)]
    pub step_mode: MicrostepMode,
    pub volume: VolumeConversion,
    #[serde(default = "default_draw_direction")]
    pub draw_direction: Direction,
}

impl PumpConfig {
    pub fn settings(&self) -> PumpSettings {
        PumpSettings {
            syringe_volume_ml: self.syringe_volume_ml,
            volume: self.volume,
            step_mode: self.step_mode,
            draw_direction: self.draw_direction,
        }
    }
}

impl Config {
    pub fn load() -> Result<Config> {
        Self::load_from(CONFIG_PATH)
    }

    pub fn load_from(path: impl AsRef<Path>) -> Result<Config> {
        let path = path.as_ref();
        let config = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        let config: Config = ron::from_str(&config)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let text = ron::ser::to_string_pretty(self, ron::ser::PrettyConfig::default())
            .map_err(|e| Error::Config(e.to_string()))?;
        std::fs::write(path, text)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))
    }

    /// Checks that don't need hardware. Pin maps themselves are validated
    /// when the drivers are built.
    pub fn validate(&self) -> Result<()> {
        let drivers = self.layout.driver_count();
        if drivers == 0 {
            return Err(Error::Config("layout has no drivers".into()));
        }
        for (i, pump) in self.pumps.iter().enumerate() {
            if pump.driver >= drivers {
                return Err(Error::Config(format!(
                    "pump {} uses driver {}, but only {} are configured",
                    pump.name, pump.driver, drivers
                )));
            }
            if self.pumps[..i].iter().any(|other| other.name == pump.name) {
                return Err(Error::Config(format!(
                    "pump name {} is used twice",
                    pump.name
                )));
            }
        }
        Ok(())
    }

    pub fn pump(&self, name: &str) -> Option<&PumpConfig> {
        self.pumps.iter().find(|pump| pump.name == name)
    }

    pub fn pump_mut(&mut self, name: &str) -> Option<&mut PumpConfig> {
        self.pumps.iter_mut().find(|pump| pump.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pump::LinearFit;

    const EXAMPLE: &str = r#"(
    layout: Cluster(
        shared: {
            Direction: (pin: Gpio(GpioPin(20))),
            Step: (pin: Gpio(GpioPin(21))),
            ModeSelect1: (pin: Gpio(GpioPin(4))),
            ModeSelect2: (pin: Gpio(GpioPin(5))),
            ModeSelect3: (pin: Gpio(GpioPin(6))),
        },
        enable: [
            (pin: Gpio(GpioPin(19)), init: High),
            (pin: Gpio(GpioPin(26)), init: High),
        ],
    ),
    pumps: [
        (
            name: "left",
            driver: 0,
            syringe_volume_ml: 5.0,
            step_mode: Sixteenth,
            volume: MlPerRotation(0.25),
        ),
        (
            name: "right",
            driver: 1,
            syringe_volume_ml: 10.0,
            volume: Regression(None),
            draw_direction: Clockwise,
        ),
    ],
)"#;

    fn temp_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("syringe-pump-{}-{}", std::process::id(), name))
    }

    #[test]
    fn test_load() {
        let path = temp_path("load.ron");
        std::fs::write(&path, EXAMPLE).unwrap();

        let config = Config::load_from(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(config.motor, MotorConfig::default());
        assert_eq!(config.layout.driver_count(), 2);
        assert_eq!(config.pumps[0].step_mode, MicrostepMode::Sixteenth);
        assert_eq!(config.pumps[0].draw_direction, Direction::CounterClockwise);
        assert_eq!(config.pumps[1].step_mode, MicrostepMode::Full);
        assert_eq!(config.pumps[1].draw_direction, Direction::Clockwise);

        let MotorLayout::Cluster { shared, enable } = &config.layout else {
            panic!("expected a cluster layout");
        };
        assert_eq!(shared[&PinRole::Step].spec(), PinSpec { pin: 21, init: Level::Low });
        assert_eq!(enable[1].spec(), PinSpec { pin: 26, init: Level::High });
    }

    #[test]
    fn test_save_and_reload() {
        let path = temp_path("save.ron");
        std::fs::write(&path, EXAMPLE).unwrap();
        let mut config = Config::load_from(&path).unwrap();

        let fit = LinearFit {
            slope: 4.5,
            intercept: 12.0,
            r_squared: 0.998,
        };
        config.pump_mut("right").unwrap().volume = VolumeConversion::Regression(Some(fit));
        config.save_to(&path).unwrap();

        let reloaded = Config::load_from(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(reloaded, config);
    }

    #[test]
    fn test_pump_on_missing_driver() {
        let path = temp_path("missing.ron");
        std::fs::write(&path, EXAMPLE.replace("driver: 1", "driver: 2")).unwrap();

        let result = Config::load_from(&path);
        std::fs::remove_file(&path).ok();
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_gpio_pins_are_bcm() {
        assert_eq!(Pin::Gpio(GpioPin(17)).bcm(), 17);
    }
}
