//! Volume calibration by weighing.
//!
//! The pump dispenses a handful of known step counts, the operator weighs
//! each sample, and a least squares line maps steps to milligrams. Water is
//! assumed, so one millilitre weighs 1000 mg.

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

pub const MG_PER_ML: f64 = 1000.0;

/// Evenly spaced calibration volumes across one syringe.
#[derive(Clone, Debug, PartialEq)]
pub struct CalibrationPlan {
    pub syringe_volume_ml: f64,
    pub volumes_ml: Vec<f64>,
}

impl CalibrationPlan {
    pub fn new(syringe_volume_ml: f64, points: usize) -> Result<Self> {
        if !(syringe_volume_ml.is_finite() && syringe_volume_ml > 0.0) {
            return Err(Error::invalid(format!(
                "syringe volume must be positive, got {syringe_volume_ml}"
            )));
        }
        if points < 3 {
            return Err(Error::invalid(format!(
                "a calibration needs at least 3 points, got {points}"
            )));
        }

        let volumes_ml = (1..=points)
            .map(|i| syringe_volume_ml * i as f64 / points as f64)
            .collect();
        Ok(Self {
            syringe_volume_ml,
            volumes_ml,
        })
    }
}

/// `mass_mg = slope * steps + intercept`
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct LinearFit {
    pub slope: f64,
    pub intercept: f64,
    pub r_squared: f64,
}

impl LinearFit {
    /// Least squares over `(steps, mass_mg)` samples.
    pub fn fit(samples: &[(f64, f64)]) -> Result<Self> {
        if samples.len() < 2 {
            return Err(Error::invalid(format!(
                "need at least 2 samples to fit a line, got {}",
                samples.len()
            )));
        }

        let n = samples.len() as f64;
        let mean_x = samples.iter().map(|(x, _)| x).sum::<f64>() / n;
        let mean_y = samples.iter().map(|(_, y)| y).sum::<f64>() / n;

        let mut sxx = 0.0;
        let mut sxy = 0.0;
        let mut syy = 0.0;
        for (x, y) in samples {
            sxx += (x - mean_x).powi(2);
            sxy += (x - mean_x) * (y - mean_y);
            syy += (y - mean_y).powi(2);
        }

        if sxx == 0.0 {
            return Err(Error::invalid("all samples use the same step count"));
        }

        let slope = sxy / sxx;
        if !(slope.is_finite() && slope > 0.0) {
            return Err(Error::invalid(format!(
                "mass has to grow with step count, fitted slope is {slope} mg/step"
            )));
        }
        let intercept = mean_y - slope * mean_x;

        let residual: f64 = samples
            .iter()
            .map(|(x, y)| (y - (slope * x + intercept)).powi(2))
            .sum();
        let r_squared = if syy == 0.0 { 1.0 } else { 1.0 - residual / syy };

        Ok(Self {
            slope,
            intercept,
            r_squared,
        })
    }

    pub fn mass_for_steps(&self, steps: f64) -> f64 {
        self.slope * steps + self.intercept
    }

    /// Steps needed to dispense `volume_ml`, before rounding.
    pub fn steps_for_volume(&self, volume_ml: f64) -> f64 {
        (volume_ml * MG_PER_ML - self.intercept) / self.slope
    }

    /// Millilitres per step, ignoring the intercept. Used to turn a flow
    /// rate into a step rate.
    pub fn ml_per_step(&self) -> f64 {
        self.slope / MG_PER_ML
    }
}
