/* Controller
 *
 *   POWER_OFF --power_on--> STANDBY
 *   STANDBY/READY --set_frequency--> CONFIGURING --> READY | ERROR
 *   READY --disable_rf--> STANDBY (frequency kept)
 *   STANDBY --enable_rf--> READY (re-applies the kept frequency)
 *   * --power_off--> POWER_OFF
 *   * --reset--> STANDBY
 *
 * Every command is checked against the states it is legal in before any
 * hardware is touched. RF is on exactly when the state is READY. The last
 * fault is kept until the next successful power_on or reset.
 * */
use bitflags::bitflags;
use log::{error, info, warn};
use std::fmt;
use thiserror::Error;

use crate::defaults::Defaults;
use crate::device::{Device, ProgramError};
use crate::hal::{Clock, Gpio, Transport};
use crate::plan::{Hz, PlanError, Planner, SynthesisPlan};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    PowerOff,
    Standby,
    Configuring,
    Ready,
    Error,
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct States: u8 {
        const POWER_OFF   = 0x01;
        const STANDBY     = 0x02;
        const CONFIGURING = 0x04;
        const READY       = 0x08;
        const ERROR       = 0x10;
    }
}

#[rustfmt::skip]
impl From<State> for States {
    fn from(s: State) -> States {
        match s {
            State::PowerOff    => States::POWER_OFF,
            State::Standby     => States::STANDBY,
            State::Configuring => States::CONFIGURING,
            State::Ready       => States::READY,
            State::Error       => States::ERROR,
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            State::PowerOff => "POWER_OFF",
            State::Standby => "STANDBY",
            State::Configuring => "CONFIGURING",
            State::Ready => "READY",
            State::Error => "ERROR",
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Command {
    PowerOn,
    PowerOff,
    Reset,
    SetFrequency,
    EnableRf,
    DisableRf,
    ReadLock,
}

#[rustfmt::skip]
impl Command {
    pub fn allowed(self) -> States {
        match self {
            Command::PowerOn      => States::POWER_OFF,
            Command::PowerOff     => States::all(),
            Command::Reset        => States::all(),
            Command::SetFrequency => States::STANDBY | States::READY,
            Command::EnableRf     => States::STANDBY | States::READY,
            Command::DisableRf    => States::STANDBY | States::READY,
            Command::ReadLock     => States::STANDBY | States::READY | States::ERROR,
        }
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("{command:?} not allowed in {state}")]
pub struct StateError {
    pub command: Command,
    pub state: State,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    Plan(#[from] PlanError),
    #[error(transparent)]
    Program(#[from] ProgramError),
    #[error("No frequency to enable RF at")]
    NoFrequency,
}

type Result<T> = std::result::Result<T, Error>;

/// Why the controller is in ERROR.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Fault {
    Plan(PlanError),
    Program(String),
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fault::Plan(e) => write!(f, "planning failed: {}", e),
            Fault::Program(e) => write!(f, "programming failed: {}", e),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Status {
    pub state: State,
    pub frequency_hz: Option<Hz>,
    pub plan: Option<SynthesisPlan>,
    pub last_error: Option<Fault>,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "state: {}", self.state)?;
        if let Some(hz) = self.frequency_hz {
            write!(f, "\nfrequency: {} Hz", hz)?;
        }
        if let Some(plan) = &self.plan {
            write!(
                f,
                "\nband: {:?}, VCO {} Hz, N {}",
                plan.band, plan.vco_hz, plan.n
            )?;
            if let Some(frac) = plan.fraction {
                write!(f, " + {}/{}", frac.num, frac.den)?;
            }
            if let Some(div) = plan.chdiv {
                write!(f, ", CHDIV {}", div.ratio())?;
            }
        }
        if let Some(fault) = &self.last_error {
            write!(f, "\nerror: {}", fault)?;
        }
        Ok(())
    }
}

pub struct Controller<T, G, C> {
    device: Device<T, G, C>,
    planner: Planner,
    defaults: Defaults,
    state: State,
    frequency: Option<Hz>,
    plan: Option<SynthesisPlan>,
    last_error: Option<Fault>,
}

impl<T: Transport, G: Gpio, C: Clock> Controller<T, G, C> {
    pub fn new(device: Device<T, G, C>, planner: Planner, defaults: Defaults) -> Self {
        Self {
            device,
            planner,
            defaults,
            state: State::PowerOff,
            frequency: None,
            plan: None,
            last_error: None,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn frequency(&self) -> Option<Hz> {
        self.frequency
    }

    pub fn last_error(&self) -> Option<&Fault> {
        self.last_error.as_ref()
    }

    pub fn device(&self) -> &Device<T, G, C> {
        &self.device
    }

    pub fn status(&self) -> Status {
        Status {
            state: self.state,
            frequency_hz: self.frequency,
            plan: self.plan,
            last_error: self.last_error.clone(),
        }
    }

    fn check(&self, command: Command) -> std::result::Result<(), StateError> {
        if command.allowed().contains(self.state.into()) {
            Ok(())
        } else {
            Err(StateError {
                command,
                state: self.state,
            })
        }
    }

    fn transition(&mut self, to: State) {
        if self.state != to {
            info!("{} -> {}", self.state, to);
            self.state = to;
        }
    }

    fn fail(&mut self, fault: Fault) {
        if let Err(e) = self.device.rf_enable(false) {
            warn!("could not force RF off: {}", e);
        }
        error!("{}", fault);
        self.frequency = None;
        self.plan = None;
        self.last_error = Some(fault);
        self.transition(State::Error);
    }

    fn fail_program(&mut self, e: ProgramError) -> Error {
        self.fail(Fault::Program(e.to_string()));
        e.into()
    }

    fn bring_up(&mut self) -> std::result::Result<(), ProgramError> {
        self.device.power_on()?;
        self.device.initialize_registers(&self.defaults)
    }

    pub fn power_on(&mut self) -> Result<()> {
        self.check(Command::PowerOn)?;
        match self.bring_up() {
            Ok(()) => {
                self.last_error = None;
                self.transition(State::Standby);
                Ok(())
            }
            Err(e) => Err(self.fail_program(e)),
        }
    }

    /// Powers the chip down from any state, ERROR included. `last_error` is
    /// left for `status` to report.
    pub fn power_off(&mut self) -> Result<()> {
        self.check(Command::PowerOff)?;
        self.frequency = None;
        self.plan = None;
        if let Err(e) = self.device.power_off() {
            return Err(self.fail_program(e));
        }
        self.transition(State::PowerOff);
        Ok(())
    }

    /// Power cycle and reinitialize.
    pub fn reset(&mut self) -> Result<()> {
        self.check(Command::Reset)?;
        let cycle = self.device.power_off().and_then(|()| self.bring_up());
        if let Err(e) = cycle {
            return Err(self.fail_program(e));
        }
        self.frequency = None;
        self.plan = None;
        self.last_error = None;
        self.transition(State::Standby);
        Ok(())
    }

    pub fn set_frequency(&mut self, freq_hz: Hz) -> Result<()> {
        self.check(Command::SetFrequency)?;
        self.transition(State::Configuring);
        let plan = match self.planner.compute_plan(freq_hz) {
            Ok(plan) => plan,
            Err(e) => {
                self.fail(Fault::Plan(e.clone()));
                return Err(e.into());
            }
        };
        self.apply(plan)
    }

    fn apply(&mut self, plan: SynthesisPlan) -> Result<()> {
        if let Err(e) = self.device.apply_plan(&plan) {
            return Err(self.fail_program(e));
        }
        self.frequency = Some(plan.freq_hz);
        self.plan = Some(plan);
        self.transition(State::Ready);
        Ok(())
    }

    /// Turn RF back on at the last commanded frequency.
    pub fn enable_rf(&mut self) -> Result<()> {
        self.check(Command::EnableRf)?;
        if self.state == State::Ready {
            return Ok(());
        }
        let plan = self.plan.ok_or(Error::NoFrequency)?;
        self.transition(State::Configuring);
        self.apply(plan)
    }

    pub fn disable_rf(&mut self) -> Result<()> {
        self.check(Command::DisableRf)?;
        if let Err(e) = self.device.rf_enable(false) {
            return Err(self.fail_program(e));
        }
        self.transition(State::Standby);
        Ok(())
    }

    pub fn is_locked(&mut self) -> Result<bool> {
        self.check(Command::ReadLock)?;
        Ok(self.device.is_locked()?)
    }
}
