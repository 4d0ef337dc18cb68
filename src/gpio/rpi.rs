use std::{
    collections::HashMap,
    hint, thread,
    time::{Duration, Instant},
};

use log::{debug, info};
use rppal::gpio::{Gpio, InputPin, OutputPin};

use super::{phase_deadline, BcmPin, GpioBackend, Level, Pull, Pulse};
use crate::{Error, Result};

/// Gaps longer than this are slept through, the rest is spun.
const SPIN_MARGIN: Duration = Duration::from_micros(150);

impl From<Level> for rppal::gpio::Level {
    fn from(level: Level) -> Self {
        match level {
            Level::Low => rppal::gpio::Level::Low,
            Level::High => rppal::gpio::Level::High,
        }
    }
}

impl From<rppal::gpio::Level> for Level {
    fn from(level: rppal::gpio::Level) -> Self {
        match level {
            rppal::gpio::Level::Low => Level::Low,
            rppal::gpio::Level::High => Level::High,
        }
    }
}

impl From<rppal::gpio::Error> for Error {
    fn from(e: rppal::gpio::Error) -> Self {
        Error::Hardware(e.to_string())
    }
}

/// Raspberry Pi GPIO through `/dev/gpiomem`.
pub struct RppalGpio {
    gpio: Gpio,
    outputs: HashMap<BcmPin, OutputPin>,
    inputs: HashMap<BcmPin, InputPin>,
}

impl RppalGpio {
    pub fn new() -> Result<Self> {
        let gpio = Gpio::new()?;
        info!("GPIO opened");

        Ok(Self {
            gpio,
            outputs: HashMap::new(),
            inputs: HashMap::new(),
        })
    }

    fn output(&mut self, pin: BcmPin) -> Result<&mut OutputPin> {
        self.outputs
            .get_mut(&pin)
            .ok_or_else(|| Error::hardware(format!("GPIO {pin} is not configured as an output")))
    }
}

fn wait_until(deadline: Instant) {
    loop {
        let now = Instant::now();
        if now >= deadline {
            return;
        }
        let left = deadline - now;
        if left > SPIN_MARGIN {
            thread::sleep(left - SPIN_MARGIN);
        } else {
            hint::spin_loop();
        }
    }
}

impl GpioBackend for RppalGpio {
    fn configure_output(&mut self, pin: BcmPin, initial: Level) -> Result<()> {
        // Drop any previous handle before claiming the line again
        self.inputs.remove(&pin);
        self.outputs.remove(&pin);

        let line = self.gpio.get(pin)?;
        let output = match initial {
            Level::Low => line.into_output_low(),
            Level::High => line.into_output_high(),
        };
        self.outputs.insert(pin, output);
        Ok(())
    }

    fn configure_input(&mut self, pin: BcmPin, pull: Pull) -> Result<()> {
        self.inputs.remove(&pin);
        self.outputs.remove(&pin);

        let line = self.gpio.get(pin)?;
        let input = match pull {
            Pull::None => line.into_input(),
            Pull::Up => line.into_input_pullup(),
            Pull::Down => line.into_input_pulldown(),
        };
        self.inputs.insert(pin, input);
        Ok(())
    }

    fn write(&mut self, pin: BcmPin, level: Level) -> Result<()> {
        self.output(pin)?.write(level.into());
        Ok(())
    }

    fn read(&mut self, pin: BcmPin) -> Result<Level> {
        if let Some(input) = self.inputs.get(&pin) {
            return Ok(input.read().into());
        }
        if let Some(output) = self.outputs.get(&pin) {
            return Ok(if output.is_set_high() {
                Level::High
            } else {
                Level::Low
            });
        }
        Err(Error::hardware(format!("GPIO {pin} is not configured")))
    }

    fn transmit(&mut self, pin: BcmPin, pulses: &[Pulse]) -> Result<Duration> {
        let output = self.output(pin)?;

        let start = Instant::now();
        let mut deadline = start;
        for pulse in pulses {
            output.write(pulse.level.into());
            deadline = phase_deadline(deadline, Instant::now(), pulse);
            wait_until(deadline);
        }
        output.set_low();

        Ok(start.elapsed())
    }

    fn paces_by_deadline(&self) -> bool {
        true
    }

    fn release(&mut self) {
        // A floating ENABLE line is pulled low by the A4988 and energizes the
        // coils, so outputs keep their last (disabled) level after exit.
        for (pin, mut output) in self.outputs.drain() {
            debug!("GPIO {}: leaving at {:?}", pin, output.is_set_high());
            output.set_reset_on_drop(false);
        }
        self.inputs.clear();
        info!("GPIO released");
    }
}
