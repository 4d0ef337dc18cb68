//! In-memory GPIO backend.
//!
//! Used by the tests and when the binaries run on a machine without the `pi`
//! feature. Every write is recorded so callers can check the order in which
//! lines changed, and individual operations can be made to fail.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{Arc, Mutex},
    thread,
    time::Duration,
};

use log::trace;

use super::{BcmPin, GpioBackend, Level, Pull, Pulse};
use crate::{lock, Error, Result};

/// Oldest events are dropped past this many
pub const EVENT_LOG_LIMIT: usize = 4096;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SimEvent {
    Output { pin: BcmPin, level: Level },
    Input { pin: BcmPin },
    Write { pin: BcmPin, level: Level },
    Pulses { pin: BcmPin, count: u64 },
}

#[derive(Default)]
struct SimState {
    outputs: HashMap<BcmPin, Level>,
    inputs: HashMap<BcmPin, Level>,
    events: VecDeque<SimEvent>,
    pulses: HashMap<BcmPin, u64>,
    fail_configure: HashSet<BcmPin>,
    fail_write: HashSet<BcmPin>,
    fail_transmit: bool,
    wait_overhead: Duration,
    released: bool,
}

impl SimState {
    fn record(&mut self, event: SimEvent) {
        if self.events.len() == EVENT_LOG_LIMIT {
            self.events.pop_front();
        }
        self.events.push_back(event);
    }
}

pub struct SimGpio {
    state: Arc<Mutex<SimState>>,
    realtime: bool,
    deadline_paced: bool,
}

/// Observer and fault injector for a [`SimGpio`] that has been handed off.
#[derive(Clone)]
pub struct SimProbe {
    state: Arc<Mutex<SimState>>,
}

impl Default for SimGpio {
    fn default() -> Self {
        Self::new()
    }
}

impl SimGpio {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState::default())),
            realtime: false,
            deadline_paced: false,
        }
    }

    /// Sleep for the nominal length of every transmitted waveform instead of
    /// returning immediately.
    pub fn realtime(mut self) -> Self {
        self.realtime = true;
        self
    }

    /// Report waveforms as scheduled on absolute deadlines, like the Pi
    /// backend.
    pub fn deadline_paced(mut self) -> Self {
        self.deadline_paced = true;
        self
    }

    pub fn probe(&self) -> SimProbe {
        SimProbe {
            state: self.state.clone(),
        }
    }
}

impl GpioBackend for SimGpio {
    fn configure_output(&mut self, pin: BcmPin, initial: Level) -> Result<()> {
        let mut state = lock(&self.state);
        if state.fail_configure.contains(&pin) {
            return Err(Error::hardware(format!("GPIO {pin} refused configuration")));
        }
        state.inputs.remove(&pin);
        state.outputs.insert(pin, initial);
        state.record(SimEvent::Output {
            pin,
            level: initial,
        });
        Ok(())
    }

    fn configure_input(&mut self, pin: BcmPin, pull: Pull) -> Result<()> {
        let mut state = lock(&self.state);
        if state.fail_configure.contains(&pin) {
            return Err(Error::hardware(format!("GPIO {pin} refused configuration")));
        }
        let level = match pull {
            Pull::Up => Level::High,
            Pull::None | Pull::Down => Level::Low,
        };
        state.outputs.remove(&pin);
        state.inputs.entry(pin).or_insert(level);
        state.record(SimEvent::Input { pin });
        Ok(())
    }

    fn write(&mut self, pin: BcmPin, level: Level) -> Result<()> {
        let mut state = lock(&self.state);
        if state.fail_write.contains(&pin) {
            return Err(Error::hardware(format!("GPIO {pin} write failed")));
        }
        match state.outputs.get_mut(&pin) {
            Some(current) => *current = level,
            None => {
                return Err(Error::hardware(format!(
                    "GPIO {pin} is not configured as an output"
                )))
            }
        }
        trace!("GPIO {}: {:?}", pin, level);
        state.record(SimEvent::Write { pin, level });
        Ok(())
    }

    fn read(&mut self, pin: BcmPin) -> Result<Level> {
        let state = lock(&self.state);
        state
            .inputs
            .get(&pin)
            .or_else(|| state.outputs.get(&pin))
            .copied()
            .ok_or_else(|| Error::hardware(format!("GPIO {pin} is not configured")))
    }

    fn transmit(&mut self, pin: BcmPin, pulses: &[Pulse]) -> Result<Duration> {
        let elapsed: Duration = pulses.iter().map(|pulse| pulse.duration).sum();
        {
            let mut state = lock(&self.state);
            if !state.outputs.contains_key(&pin) {
                return Err(Error::hardware(format!(
                    "GPIO {pin} is not configured as an output"
                )));
            }
            if state.fail_transmit {
                state.outputs.insert(pin, Level::Low);
                return Err(Error::hardware("waveform creation failed"));
            }

            let count = pulses
                .iter()
                .filter(|pulse| pulse.level == Level::High)
                .count() as u64;
            *state.pulses.entry(pin).or_default() += count;
            let last = pulses.last().map_or(Level::Low, |pulse| pulse.level);
            state.outputs.insert(pin, last);
            state.record(SimEvent::Pulses { pin, count });
        }

        if self.realtime {
            thread::sleep(elapsed);
        }
        Ok(elapsed)
    }

    fn wait_overhead(&mut self, _samples: u32) -> Duration {
        lock(&self.state).wait_overhead
    }

    fn paces_by_deadline(&self) -> bool {
        self.deadline_paced
    }

    fn release(&mut self) {
        // Lines keep their last level, as on the Pi
        lock(&self.state).released = true;
    }
}

impl SimProbe {
    /// Current level of a configured pin
    pub fn level(&self, pin: BcmPin) -> Option<Level> {
        let state = lock(&self.state);
        state
            .outputs
            .get(&pin)
            .or_else(|| state.inputs.get(&pin))
            .copied()
    }

    pub fn events(&self) -> Vec<SimEvent> {
        lock(&self.state).events.iter().cloned().collect()
    }

    /// Only the level changes of one pin, in order
    pub fn writes(&self, pin: BcmPin) -> Vec<Level> {
        lock(&self.state)
            .events
            .iter()
            .filter_map(|event| match event {
                SimEvent::Write { pin: p, level } if *p == pin => Some(*level),
                _ => None,
            })
            .collect()
    }

    pub fn clear_events(&self) {
        lock(&self.state).events.clear();
    }

    /// Total HIGH pulses emitted on a pin
    pub fn pulse_count(&self, pin: BcmPin) -> u64 {
        lock(&self.state).pulses.get(&pin).copied().unwrap_or(0)
    }

    pub fn set_input(&self, pin: BcmPin, level: Level) {
        lock(&self.state).inputs.insert(pin, level);
    }

    pub fn fail_configure(&self, pin: BcmPin, fail: bool) {
        let mut state = lock(&self.state);
        if fail {
            state.fail_configure.insert(pin);
        } else {
            state.fail_configure.remove(&pin);
        }
    }

    pub fn fail_write(&self, pin: BcmPin, fail: bool) {
        let mut state = lock(&self.state);
        if fail {
            state.fail_write.insert(pin);
        } else {
            state.fail_write.remove(&pin);
        }
    }

    pub fn fail_transmit(&self, fail: bool) {
        lock(&self.state).fail_transmit = fail;
    }

    pub fn set_wait_overhead(&self, overhead: Duration) {
        lock(&self.state).wait_overhead = overhead;
    }

    pub fn released(&self) -> bool {
        lock(&self.state).released
    }
}
