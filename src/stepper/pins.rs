use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::{
    gpio::{BcmPin, Level},
    Error, Result,
};

/// Logical function of a driver line.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PinRole {
    Direction,
    Step,
    Enable,
    ModeSelect1,
    ModeSelect2,
    ModeSelect3,
}

impl PinRole {
    pub const ALL: [PinRole; 6] = [
        PinRole::Direction,
        PinRole::Step,
        PinRole::Enable,
        PinRole::ModeSelect1,
        PinRole::ModeSelect2,
        PinRole::ModeSelect3,
    ];
}

/// A physical line and the level it is driven to at setup.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PinSpec {
    pub pin: BcmPin,
    pub init: Level,
}

/// Lines that can be shared by several drivers: DIRECTION, STEP and the
/// three mode selects.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BusPins {
    pub direction: PinSpec,
    pub step: PinSpec,
    pub mode_select: [PinSpec; 3],
}

/// Every line of one standalone driver.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DriverPins {
    pub bus: BusPins,
    pub enable: PinSpec,
}

fn take(pins: &BTreeMap<PinRole, PinSpec>, role: PinRole) -> Result<PinSpec> {
    pins.get(&role)
        .copied()
        .ok_or_else(|| Error::invalid(format!("no pin bound to {role:?}")))
}

/// ENABLE is active low; it has to start HIGH so the coils stay unpowered
/// until something asks for them.
pub(crate) fn check_enable(enable: &PinSpec) -> Result<()> {
    if enable.init != Level::High {
        return Err(Error::invalid(format!(
            "ENABLE on GPIO {} must start HIGH (disabled)",
            enable.pin
        )));
    }
    Ok(())
}

fn check_distinct<'a>(pins: impl IntoIterator<Item = &'a PinSpec>) -> Result<()> {
    let mut seen = HashSet::new();
    for spec in pins {
        if !seen.insert(spec.pin) {
            return Err(Error::invalid(format!(
                "GPIO {} is bound to more than one role",
                spec.pin
            )));
        }
    }
    Ok(())
}

impl BusPins {
    pub fn from_roles(pins: &BTreeMap<PinRole, PinSpec>) -> Result<Self> {
        if pins.contains_key(&PinRole::Enable) {
            return Err(Error::invalid(
                "shared pins cannot include ENABLE, each driver has its own",
            ));
        }
        let bus = Self::collect(pins)?;
        check_distinct(&bus.specs())?;
        Ok(bus)
    }

    fn collect(pins: &BTreeMap<PinRole, PinSpec>) -> Result<Self> {
        Ok(Self {
            direction: take(pins, PinRole::Direction)?,
            step: take(pins, PinRole::Step)?,
            mode_select: [
                take(pins, PinRole::ModeSelect1)?,
                take(pins, PinRole::ModeSelect2)?,
                take(pins, PinRole::ModeSelect3)?,
            ],
        })
    }

    pub fn specs(&self) -> [PinSpec; 5] {
        [
            self.direction,
            self.step,
            self.mode_select[0],
            self.mode_select[1],
            self.mode_select[2],
        ]
    }

    pub fn mode_select_pins(&self) -> [BcmPin; 3] {
        self.mode_select.map(|spec| spec.pin)
    }
}

impl DriverPins {
    /// Build from a role map, rejecting missing roles, reused lines and an
    /// ENABLE line that would start energized.
    pub fn from_roles(pins: &BTreeMap<PinRole, PinSpec>) -> Result<Self> {
        let bus = BusPins::collect(pins)?;
        let enable = take(pins, PinRole::Enable)?;
        check_enable(&enable)?;

        let driver = Self { bus, enable };
        check_distinct(&driver.specs())?;
        Ok(driver)
    }

    pub fn specs(&self) -> Vec<PinSpec> {
        let mut specs = vec![self.enable];
        specs.extend(self.bus.specs());
        specs
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn roles(enable: Option<BcmPin>) -> BTreeMap<PinRole, PinSpec> {
        let mut pins = BTreeMap::from([
            (PinRole::Direction, PinSpec { pin: 20, init: Level::Low }),
            (PinRole::Step, PinSpec { pin: 21, init: Level::Low }),
            (PinRole::ModeSelect1, PinSpec { pin: 4, init: Level::Low }),
            (PinRole::ModeSelect2, PinSpec { pin: 5, init: Level::Low }),
            (PinRole::ModeSelect3, PinSpec { pin: 6, init: Level::Low }),
        ]);
        if let Some(pin) = enable {
            pins.insert(PinRole::Enable, PinSpec { pin, init: Level::High });
        }
        pins
    }

    #[test]
    fn test_driver_pins_from_roles() {
        let pins = DriverPins::from_roles(&roles(Some(22))).unwrap();
        assert_eq!(pins.enable.pin, 22);
        assert_eq!(pins.bus.step.pin, 21);
        assert_eq!(pins.bus.mode_select_pins(), [4, 5, 6]);
    }

    #[test]
    fn test_missing_role_rejected() {
        let mut pins = roles(Some(22));
        pins.remove(&PinRole::ModeSelect2);
        assert!(matches!(
            DriverPins::from_roles(&pins),
            Err(Error::InvalidArgument(_))
        ));

        assert!(matches!(
            DriverPins::from_roles(&roles(None)),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_enable_must_start_disabled() {
        let mut pins = roles(None);
        pins.insert(PinRole::Enable, PinSpec { pin: 22, init: Level::Low });
        assert!(matches!(
            DriverPins::from_roles(&pins),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_reused_line_rejected() {
        let mut pins = roles(Some(22));
        pins.insert(PinRole::Step, PinSpec { pin: 20, init: Level::Low });
        assert!(matches!(
            DriverPins::from_roles(&pins),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_bus_pins_refuse_enable() {
        assert!(BusPins::from_roles(&roles(None)).is_ok());
        assert!(matches!(
            BusPins::from_roles(&roles(Some(22))),
            Err(Error::InvalidArgument(_))
        ));
    }
}
