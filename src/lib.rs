use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod config;
pub mod controller;
pub mod error;
pub mod gpio;
pub mod program;
pub mod pulse;
pub mod pump;
pub mod stepper;

pub use error::{Error, Result};

pub mod prelude {
    pub use crate::{
        config::*,
        controller::PumpController,
        gpio::{sim::SimGpio, GpioBackend, Hardware, Level},
        program::{ProgramHandle, ProgramRunner, RunState},
        pump::*,
        stepper::*,
        Error, Result,
    };
    pub use common::{parse_program, Command, Program};
}

/// Lock a mutex, carrying on if a previous holder panicked. A panic in one
/// move must not stop a later disable from reaching the pins.
pub fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
