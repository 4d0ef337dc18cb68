use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Error};
use clap::{Parser, Subcommand};
use log::{error, info, warn};
use tokio::io::{AsyncBufReadExt, BufReader};

use syringe_pump::{
    gpio::GpioBackend,
    lock,
    prelude::*,
    program::{Outcome, ProgramSummary},
};

/// Syringe pump control
#[derive(Parser, Debug)]
#[command(name = "syringe-pump", version, about = "Syringe pump control")]
struct Args {
    /// Path to the config file
    #[arg(short = 'c', long = "config", value_name = "PATH", default_value_os = "config.ron")]
    config: PathBuf,

    /// Increase verbosity (-v, -vv)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    verbosity_level: u8,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Run a program file. Type pause, resume or stop while it runs.
    Run {
        program: PathBuf,
        #[arg(short, long)]
        pump: String,
    },
    /// Dispense a volume
    Move {
        #[arg(short, long)]
        pump: String,
        /// mL
        #[arg(long)]
        volume: f64,
        /// mL/s
        #[arg(long)]
        speed: f64,
    },
    /// One full syringe cycle to clear air from the lines
    Prime {
        #[arg(short, long)]
        pump: String,
        /// mL/s
        #[arg(long, default_value_t = 0.5)]
        speed: f64,
    },
    /// Show pump status
    Info {
        /// Only this pump
        #[arg(short, long)]
        pump: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// List microstep modes and their select pin levels
    Modes,
}

#[cfg(feature = "pi")]
fn backend() -> Result<impl GpioBackend, Error> {
    Ok(syringe_pump::gpio::rpi::RppalGpio::new()?)
}

#[cfg(not(feature = "pi"))]
fn backend() -> Result<impl GpioBackend, Error> {
    warn!("Built without the pi feature, using simulated GPIO");
    Ok(SimGpio::new().realtime())
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let args = Args::parse();

    let level = match args.verbosity_level {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    if let Cmd::Modes = args.command {
        print!("{}", MicrostepMode::table());
        return Ok(());
    }

    let config = Config::load_from(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    let mut controller = PumpController::init(&config, backend()?)?;

    let result = match args.command {
        Cmd::Run { program, pump } => run(&controller, &program, &pump).await,
        Cmd::Move {
            pump,
            volume,
            speed,
        } => {
            let pump = controller.pump(&pump)?;
            blocking(pump, move |pump| {
                pump.enable()?;
                let result = pump.move_volume(volume, speed);
                pump.disable()?;
                result
            })
            .await
        }
        Cmd::Prime { pump, speed } => {
            let pump = controller.pump(&pump)?;
            blocking(pump, move |pump| {
                pump.enable()?;
                let result = pump.prime(speed);
                pump.disable()?;
                result
            })
            .await
        }
        Cmd::Info { pump, json } => info(&controller, pump.as_deref(), json),
        Cmd::Modes => Ok(()),
    };

    if let Err(e) = &result {
        error!("{:#}", e);
    }
    controller.shutdown()?;
    result
}

async fn blocking<F>(pump: Arc<std::sync::Mutex<Pump>>, f: F) -> Result<(), Error>
where
    F: FnOnce(&mut Pump) -> syringe_pump::Result<()> + Send + 'static,
{
    tokio::task::spawn_blocking(move || f(&mut lock(&pump))).await??;
    Ok(())
}

fn info(controller: &PumpController, only: Option<&str>, json: bool) -> Result<(), Error> {
    let names: Vec<String> = match only {
        Some(name) => vec![name.to_string()],
        None => controller.pump_names().map(str::to_string).collect(),
    };

    let mut infos = Vec::new();
    for name in names {
        let pump = controller.pump(&name)?;
        infos.push(lock(&pump).print_info());
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&infos)?);
    } else {
        for info in infos {
            print!("{}", info);
        }
    }
    Ok(())
}

async fn run(controller: &PumpController, path: &Path, pump: &str) -> Result<(), Error> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let program = parse_program(&text);
    info!(
        "Loaded {} commands from {} ({} lines skipped)",
        program.commands.len(),
        path.display(),
        program.rejected.len()
    );

    let handle = ProgramRunner::new(controller.pump(pump)?).spawn(program);
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    while !handle.is_finished() {
        tokio::select! {
            line = stdin.next_line(), if stdin_open => match line {
                Ok(Some(line)) => match line.trim().to_ascii_lowercase().as_str() {
                    "pause" => handle.pause(),
                    "resume" => handle.resume(),
                    "stop" => handle.stop(),
                    "" => {}
                    other => warn!("Unknown control '{}', use pause, resume or stop", other),
                },
                Ok(None) => stdin_open = false,
                Err(e) => {
                    warn!("Could not read stdin: {}", e);
                    stdin_open = false;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, stopping program");
                handle.stop();
            },
            _ = tokio::time::sleep(std::time::Duration::from_millis(100)) => {}
        }
    }

    let ProgramSummary {
        outcome,
        commands_run,
        dispensed_ml,
    } = handle.join().await?;
    match outcome {
        Outcome::Stopped => println!("Stopped after {commands_run} commands, {dispensed_ml:.3} mL"),
        _ => println!("Done: {commands_run} commands, {dispensed_ml:.3} mL"),
    }
    Ok(())
}
