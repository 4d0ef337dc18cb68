//! Runs stored programs (`MOVE`, `PAUSE`, `END`) against one pump.
//!
//! The runner lives on its own task so that pause, resume and stop requests
//! from the controlling side are seen between commands. Moves block, so each
//! one is handed to the blocking pool.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use common::{Command, Program};
use log::{error, info, warn};
use serde::Serialize;
use tokio::{sync::watch, task::JoinHandle, time::sleep};

use crate::{lock, pump::Pump, Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum RunState {
    Running,
    Paused,
    Stopped,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum Outcome {
    /// Every command ran
    Completed,
    /// An `END` command was reached
    Ended,
    /// Stopped from outside
    Stopped,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ProgramSummary {
    pub outcome: Outcome,
    pub commands_run: usize,
    pub dispensed_ml: f64,
}

/// Control side of a running program.
pub struct ProgramHandle {
    control: watch::Sender<RunState>,
    task: JoinHandle<Result<ProgramSummary>>,
}

impl ProgramHandle {
    /// Hold before the next command. A move already under way finishes.
    pub fn pause(&self) {
        self.set(RunState::Paused);
    }

    pub fn resume(&self) {
        self.set(RunState::Running);
    }

    /// Stop before the next command, or during a `PAUSE`.
    pub fn stop(&self) {
        self.set(RunState::Stopped);
    }

    pub fn state(&self) -> RunState {
        *self.control.borrow()
    }

    fn set(&self, state: RunState) {
        self.control.send_if_modified(|current| {
            // Stopped is final
            if *current == state || *current == RunState::Stopped {
                return false;
            }
            info!("Program {:?}", state);
            *current = state;
            true
        });
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the program to end. The pump is disabled by then, whatever
    /// the result.
    pub async fn join(self) -> Result<ProgramSummary> {
        self.task
            .await
            .map_err(|e| Error::hardware(format!("program task failed: {e}")))?
    }
}

pub struct ProgramRunner {
    pump: Arc<Mutex<Pump>>,
}

impl ProgramRunner {
    pub fn new(pump: Arc<Mutex<Pump>>) -> Self {
        Self { pump }
    }

    /// Start `program` on a new task. Lines that failed to parse are logged
    /// and skipped.
    pub fn spawn(&self, program: Program) -> ProgramHandle {
        for rejected in &program.rejected {
            warn!(
                "Skipping line {} '{}': {}",
                rejected.line_number, rejected.text, rejected.reason
            );
        }

        let (control, receiver) = watch::channel(RunState::Running);
        let pump = self.pump.clone();
        let task = tokio::spawn(run(pump, program.commands, receiver));

        ProgramHandle { control, task }
    }
}

async fn run(
    pump: Arc<Mutex<Pump>>,
    commands: Vec<Command>,
    mut control: watch::Receiver<RunState>,
) -> Result<ProgramSummary> {
    let result = match blocking(&pump, |pump| pump.enable()).await {
        Ok(()) => execute(&pump, &commands, &mut control).await,
        Err(e) => Err(e),
    };

    let disabled = blocking(&pump, |pump| pump.disable()).await;
    if let Err(e) = &disabled {
        error!("Failed to disable pump after program: {}", e);
    }

    match &result {
        Ok(summary) => info!(
            "Program finished: {:?} after {} commands, {:.3} mL dispensed",
            summary.outcome, summary.commands_run, summary.dispensed_ml
        ),
        Err(e) => error!("Program failed: {}", e),
    }

    let summary = result?;
    disabled?;
    Ok(summary)
}

async fn execute(
    pump: &Arc<Mutex<Pump>>,
    commands: &[Command],
    control: &mut watch::Receiver<RunState>,
) -> Result<ProgramSummary> {
    let mut summary = ProgramSummary {
        outcome: Outcome::Completed,
        commands_run: 0,
        dispensed_ml: 0.0,
    };

    for (i, command) in commands.iter().enumerate() {
        if !checkpoint(control).await {
            summary.outcome = Outcome::Stopped;
            return Ok(summary);
        }

        info!("Command {}/{}: {}", i + 1, commands.len(), command);
        match *command {
            Command::Move {
                volume_ml,
                speed_ml_per_s,
            } => {
                blocking(pump, move |pump| pump.move_volume(volume_ml, speed_ml_per_s)).await?;
                summary.dispensed_ml += volume_ml;
            }
            Command::Pause { seconds } => {
                let duration = Duration::try_from_secs_f64(seconds)
                    .map_err(|e| Error::invalid(format!("PAUSE {seconds}: {e}")))?;
                let stopped = tokio::select! {
                    _ = sleep(duration) => false,
                    _ = stop_requested(control) => true,
                };
                if stopped {
                    summary.outcome = Outcome::Stopped;
                    return Ok(summary);
                }
            }
            Command::End => {
                summary.commands_run += 1;
                summary.outcome = Outcome::Ended;
                return Ok(summary);
            }
        }
        summary.commands_run += 1;
    }
    Ok(summary)
}

/// Block while paused. Returns false once stopped.
async fn checkpoint(control: &mut watch::Receiver<RunState>) -> bool {
    loop {
        let state = *control.borrow_and_update();
        match state {
            RunState::Running => return true,
            RunState::Stopped => return false,
            RunState::Paused => {
                if control.changed().await.is_err() {
                    // Nobody left to resume us
                    return false;
                }
            }
        }
    }
}

async fn stop_requested(control: &mut watch::Receiver<RunState>) {
    loop {
        if *control.borrow_and_update() == RunState::Stopped {
            return;
        }
        if control.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

async fn blocking<T, F>(pump: &Arc<Mutex<Pump>>, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&mut Pump) -> Result<T> + Send + 'static,
{
    let pump = pump.clone();
    tokio::task::spawn_blocking(move || f(&mut lock(&pump)))
        .await
        .map_err(|e| Error::hardware(format!("pump task failed: {e}")))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        gpio::{
            sim::{SimGpio, SimProbe},
            Hardware,
        },
        pump::{PumpSettings, VolumeConversion},
        stepper::{
            pins::tests::roles, Direction, DriverPins, MicrostepMode, Motor, MotorSettings,
            SharedMotor, StepperDriver,
        },
    };
    use common::parse_program;

    fn pump() -> (Arc<Mutex<Pump>>, SimProbe) {
        let sim = SimGpio::new();
        let probe = sim.probe();
        let mut driver = StepperDriver::new(
            "motor",
            Hardware::new(sim),
            DriverPins::from_roles(&roles(Some(22))).unwrap(),
            MotorSettings::default(),
        );
        Motor::auto_calibrate(&mut driver, 1.0).unwrap();
        let motor: SharedMotor = Arc::new(Mutex::new(driver));
        let settings = PumpSettings {
            syringe_volume_ml: 5.0,
            volume: VolumeConversion::MlPerRotation(1.0),
            step_mode: MicrostepMode::Full,
            draw_direction: Direction::CounterClockwise,
        };
        let pump = Pump::new("p1", motor, settings).unwrap();
        (Arc::new(Mutex::new(pump)), probe)
    }

    fn pushed(pump: &Arc<Mutex<Pump>>) -> Vec<f64> {
        lock(pump).history().iter().map(|r| r.volume_ml).collect()
    }

    #[tokio::test]
    async fn test_runs_commands_in_order() {
        let (pump, _probe) = pump();
        let program = parse_program("MOVE 1 SPEED 2\nPAUSE 0.01\nmove 2ml speed 2ml/s\n");

        let summary = ProgramRunner::new(pump.clone())
            .spawn(program)
            .join()
            .await
            .unwrap();

        assert_eq!(summary.outcome, Outcome::Completed);
        assert_eq!(summary.commands_run, 3);
        assert_eq!(summary.dispensed_ml, 3.0);
        assert_eq!(pushed(&pump), vec![1.0, 2.0]);
        assert!(!lock(&pump).is_enabled());
    }

    #[tokio::test]
    async fn test_end_stops_execution() {
        let (pump, _probe) = pump();
        let program = parse_program("MOVE 1 SPEED 1\nEND\nMOVE 2 SPEED 1\n");

        let summary = ProgramRunner::new(pump.clone())
            .spawn(program)
            .join()
            .await
            .unwrap();

        assert_eq!(summary.outcome, Outcome::Ended);
        assert_eq!(pushed(&pump), vec![1.0]);
    }

    #[tokio::test]
    async fn test_unknown_lines_are_skipped() {
        let (pump, _probe) = pump();
        let program = parse_program("SPIN 3\nMOVE 1 SPEED 1\n");
        assert_eq!(program.rejected.len(), 1);

        let summary = ProgramRunner::new(pump.clone())
            .spawn(program)
            .join()
            .await
            .unwrap();

        assert_eq!(summary.commands_run, 1);
        assert_eq!(pushed(&pump), vec![1.0]);
    }

    #[tokio::test]
    async fn test_pause_holds_until_resume() {
        let (pump, _probe) = pump();
        let handle = ProgramRunner::new(pump.clone()).spawn(parse_program("MOVE 1 SPEED 1"));
        // The current-thread runtime has not polled the task yet
        handle.pause();

        sleep(Duration::from_millis(50)).await;
        assert!(pushed(&pump).is_empty());
        assert_eq!(handle.state(), RunState::Paused);

        handle.resume();
        let summary = handle.join().await.unwrap();
        assert_eq!(summary.outcome, Outcome::Completed);
        assert_eq!(pushed(&pump), vec![1.0]);
    }

    #[tokio::test]
    async fn test_stop_interrupts_pause() {
        let (pump, _probe) = pump();
        let handle =
            ProgramRunner::new(pump.clone()).spawn(parse_program("PAUSE 30\nMOVE 1 SPEED 1"));

        sleep(Duration::from_millis(50)).await;
        handle.stop();
        handle.resume();

        let summary = tokio::time::timeout(Duration::from_secs(5), handle.join())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(summary.outcome, Outcome::Stopped);
        assert!(pushed(&pump).is_empty());
        assert!(!lock(&pump).is_enabled());
    }

    #[tokio::test]
    async fn test_failed_move_disables_pump() {
        let (pump, probe) = pump();
        probe.fail_transmit(true);

        let result = ProgramRunner::new(pump.clone())
            .spawn(parse_program("MOVE 1 SPEED 1\nMOVE 1 SPEED 1"))
            .join()
            .await;

        assert!(matches!(result, Err(Error::Hardware(_))));
        assert!(!lock(&pump).is_enabled());
        assert!(pushed(&pump).is_empty());
    }
}
