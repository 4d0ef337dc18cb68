//! Weigh dispensed samples and fit a steps to mass line for one pump.
//!
//! The pump dispenses evenly spaced volumes across the syringe using a
//! nominal mL per rotation. After each sample the operator enters the weight
//! in milligrams. The fitted line is written back into the config file.

use std::{
    io::{self, BufRead, Write},
    path::PathBuf,
};

use anyhow::{bail, Context, Error};
use clap::Parser;
use log::{info, warn};

use syringe_pump::{lock, prelude::*};

#[derive(Parser, Debug)]
#[command(name = "calibrate-volume", version, about = "Regression volume calibration")]
struct Args {
    /// Path to the config file
    #[arg(short = 'c', long = "config", value_name = "PATH", default_value_os = "config.ron")]
    config: PathBuf,

    #[arg(short, long)]
    pump: String,

    /// Number of samples, at least 3
    #[arg(long, default_value_t = 5)]
    points: usize,

    /// Rough mL per motor rotation, used only to pick step counts
    #[arg(long, default_value_t = 0.1)]
    ml_per_rotation: f64,

    /// rev/s
    #[arg(long, default_value_t = 0.5)]
    speed: f64,
}

#[cfg(feature = "pi")]
fn backend() -> Result<impl GpioBackend, Error> {
    Ok(syringe_pump::gpio::rpi::RppalGpio::new()?)
}

#[cfg(not(feature = "pi"))]
fn backend() -> Result<impl GpioBackend, Error> {
    warn!("Built without the pi feature, using simulated GPIO");
    Ok(SimGpio::new())
}

fn read_mass(lines: &mut impl Iterator<Item = io::Result<String>>) -> Result<f64, Error> {
    loop {
        print!("Sample weight in mg: ");
        io::stdout().flush()?;

        let Some(line) = lines.next() else {
            bail!("input closed before calibration finished");
        };
        match line?.trim().parse::<f64>() {
            Ok(mass) if mass.is_finite() && mass >= 0.0 => return Ok(mass),
            _ => println!("Enter a number of milligrams"),
        }
    }
}

fn main() -> Result<(), Error> {
    let args = Args::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if !(args.ml_per_rotation.is_finite() && args.ml_per_rotation > 0.0) {
        bail!("--ml-per-rotation must be positive");
    }

    let mut config = Config::load_from(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    let pump_config = config
        .pump(&args.pump)
        .with_context(|| format!("no pump named {} in the config", args.pump))?
        .clone();
    let plan = CalibrationPlan::new(pump_config.syringe_volume_ml, args.points)?;

    let mut controller = PumpController::init(&config, backend()?)?;
    let pump = controller.pump(&args.pump)?;
    let native_spr = config.motor.steps_per_revolution;

    lock(&pump).enable()?;
    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();
    let mut samples = Vec::new();

    for (i, volume) in plan.volumes_ml.iter().enumerate() {
        let revolutions = volume / args.ml_per_rotation;
        let steps = revolutions_to_steps(revolutions, native_spr, pump_config.step_mode);

        println!(
            "Sample {}/{}: about {:.3} mL ({} steps). Place an empty container and press enter.",
            i + 1,
            plan.volumes_ml.len(),
            volume,
            steps
        );
        if lines.next().transpose()?.is_none() {
            bail!("input closed before calibration finished");
        }

        lock(&pump).dispense_steps(steps, args.speed)?;
        let mass = read_mass(&mut lines)?;
        info!("{} steps gave {} mg", steps, mass);
        samples.push((steps as f64, mass));
    }
    lock(&pump).disable()?;

    let fit = LinearFit::fit(&samples)?;
    println!(
        "mass = {:.5} mg/step * steps + {:.3} mg, R² {:.5}",
        fit.slope, fit.intercept, fit.r_squared
    );
    if fit.r_squared < 0.99 {
        warn!("Poor fit, check the scale and the tubing for air");
    }

    if let Some(pump_config) = config.pump_mut(&args.pump) {
        pump_config.volume = VolumeConversion::Regression(Some(fit));
    }
    config.save_to(&args.config)?;
    println!("Saved to {}", args.config.display());

    controller.shutdown()?;
    Ok(())
}
