use std::fmt::{self, Display};

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::{
    gpio::{BcmPin, Hardware, Level},
    Result,
};

/// A4988 step resolution, selected through MS1/MS2/MS3.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MicrostepMode {
    #[default]
    Full,
    Half,
    Quarter,
    Eighth,
    Sixteenth,
}

impl MicrostepMode {
    pub const ALL: [MicrostepMode; 5] = [
        MicrostepMode::Full,
        MicrostepMode::Half,
        MicrostepMode::Quarter,
        MicrostepMode::Eighth,
        MicrostepMode::Sixteenth,
    ];

    /// Multiplier applied to the motor's native steps per revolution
    pub fn factor(self) -> u32 {
        match self {
            MicrostepMode::Full => 1,
            MicrostepMode::Half => 2,
            MicrostepMode::Quarter => 4,
            MicrostepMode::Eighth => 8,
            MicrostepMode::Sixteenth => 16,
        }
    }

    /// MS1, MS2, MS3
    pub fn pattern(self) -> [Level; 3] {
        let bits = match self {
            MicrostepMode::Full => [false, false, false],
            MicrostepMode::Half => [true, false, false],
            MicrostepMode::Quarter => [false, true, false],
            MicrostepMode::Eighth => [true, true, false],
            MicrostepMode::Sixteenth => [true, true, true],
        };
        bits.map(Level::from_bit)
    }

    pub fn name(self) -> &'static str {
        match self {
            MicrostepMode::Full => "full",
            MicrostepMode::Half => "half",
            MicrostepMode::Quarter => "quarter",
            MicrostepMode::Eighth => "eighth",
            MicrostepMode::Sixteenth => "sixteenth",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        let name = name.trim();
        Self::ALL
            .into_iter()
            .find(|mode| mode.name().eq_ignore_ascii_case(name))
    }

    /// Like [`MicrostepMode::parse`], but unknown names fall back to full
    /// stepping.
    pub fn resolve(name: &str) -> Self {
        Self::parse(name).unwrap_or_else(|| {
            warn!("Unknown step mode '{}', using full steps", name);
            MicrostepMode::Full
        })
    }

    /// Every mode with its select pattern, for display
    pub fn table() -> String {
        let mut table = String::from("Mode       | MS1   | MS2   | MS3   | Factor\n");
        table.push_str("-----------|-------|-------|-------|-------\n");
        for mode in Self::ALL {
            let [ms1, ms2, ms3] = mode.pattern().map(|level| match level {
                Level::High => "HIGH",
                Level::Low => "LOW",
            });
            table.push_str(&format!(
                "{:<10} | {:<5} | {:<5} | {:<5} | {}\n",
                mode.name(),
                ms1,
                ms2,
                ms3,
                mode.factor()
            ));
        }
        table
    }
}

impl Display for MicrostepMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Drives the three mode-select lines of one driver (or of a whole cluster
/// sharing them).
pub struct MicrostepController {
    hardware: Hardware,
    pins: [BcmPin; 3],
    mode: MicrostepMode,
}

impl MicrostepController {
    /// The lines must already be configured as outputs. The controller
    /// assumes full stepping until the first [`MicrostepController::set`].
    pub fn new(hardware: Hardware, pins: [BcmPin; 3]) -> Self {
        Self {
            hardware,
            pins,
            mode: MicrostepMode::Full,
        }
    }

    /// Select a mode by name, returning the factor now in effect. Unknown
    /// names select full stepping.
    pub fn set_mode(&mut self, name: &str) -> Result<u32> {
        self.set(MicrostepMode::resolve(name))
    }

    /// Drive all three select lines. If a write fails the lines already
    /// changed are put back, so the pins always match [`Self::get_mode`].
    pub fn set(&mut self, mode: MicrostepMode) -> Result<u32> {
        let previous = self.mode.pattern();

        for (i, (pin, level)) in self.pins.iter().zip(mode.pattern()).enumerate() {
            if let Err(e) = self.hardware.write(*pin, level) {
                for (pin, level) in self.pins.iter().zip(previous).take(i) {
                    if let Err(e) = self.hardware.write(*pin, level) {
                        warn!("GPIO {}: could not restore mode select: {}", pin, e);
                    }
                }
                return Err(e);
            }
        }

        if mode != self.mode {
            info!("Step mode set to {} (x{})", mode, mode.factor());
        }
        self.mode = mode;
        Ok(mode.factor())
    }

    pub fn get_mode(&self) -> MicrostepMode {
        self.mode
    }

    pub fn get_factor(&self) -> u32 {
        self.mode.factor()
    }
}
