use std::sync::{Arc, Mutex};

use log::{error, info};

use crate::{lock, stepper::SharedMotor, Error, Result};

struct ActivePump {
    name: String,
    motor: SharedMotor,
}

/// Tracks which pump may drive a shared motor resource. Switching the active
/// pump happens under one lock: the previous motor is disabled before the
/// next is enabled, and no move can start in between.
///
/// Lock order is always registry, then motor.
#[derive(Default)]
pub struct ActivePumpRegistry {
    active: Mutex<Option<ActivePump>>,
}

impl ActivePumpRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make `name` the active pump and enable its motor, disabling whichever
    /// pump held the slot before. If the old motor cannot be disabled the new
    /// one is left alone.
    pub fn activate(&self, name: &str, motor: &SharedMotor) -> Result<()> {
        let mut active = lock(&self.active);

        if let Some(current) = active.as_ref() {
            if current.name != name {
                lock(&current.motor).disable()?;
                info!("Pump {} deactivated", current.name);
                *active = None;
            }
        }

        lock(motor).enable()?;
        if active.is_none() {
            info!("Pump {} is now active", name);
        }
        *active = Some(ActivePump {
            name: name.to_string(),
            motor: motor.clone(),
        });
        Ok(())
    }

    /// Disable `motor`, and clear the slot if `name` held it.
    pub fn deactivate(&self, name: &str, motor: &SharedMotor) -> Result<()> {
        let mut active = lock(&self.active);
        lock(motor).disable()?;
        if active.as_ref().is_some_and(|current| current.name == name) {
            info!("Pump {} deactivated", name);
            *active = None;
        }
        Ok(())
    }

    pub fn active(&self) -> Option<String> {
        lock(&self.active)
            .as_ref()
            .map(|current| current.name.clone())
    }

    pub fn is_active(&self, name: &str) -> bool {
        lock(&self.active)
            .as_ref()
            .is_some_and(|current| current.name == name)
    }

    /// Run `f` while holding the registry, provided `name` is the active
    /// pump. Nothing else can be activated until `f` returns.
    pub fn run_exclusive<T>(&self, name: &str, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let active = lock(&self.active);
        if !active.as_ref().is_some_and(|current| current.name == name) {
            return Err(Error::NotActive(name.to_string()));
        }
        f()
    }

    /// Disable the active motor and empty the slot.
    pub fn shutdown(&self) -> Result<()> {
        let Some(current) = lock(&self.active).take() else {
            return Ok(());
        };
        let result = lock(&current.motor).disable().map_err(|e| {
            error!("Pump {}: failed to disable on shutdown: {}", current.name, e);
            e
        });
        result
    }
}
