//! Simulated hardware.
//!
//! A [`Bench`] holds one shared record of everything the driver did. The
//! transport, GPIO and clock handed out by it all append to that record, so a
//! test (or `lmx2820 --mock`) can give the parts to a [`crate::Device`] and
//! still inspect the exact sequence of writes and pin changes afterwards.
//! Time is virtual: sleeping advances the clock instantly.
use log::{debug, trace};
use std::{cell::RefCell, collections::VecDeque, rc::Rc, time::Duration};

use crate::hal::{BandSwitch, Clock, Error, Gpio, Result, Transport};
use crate::registers::{fields, N_REGS};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Event {
    Write(u8, u16),
    Power(bool),
    Reset,
    Rf(bool),
    Band(BandSwitch),
    Doubler(bool),
}

struct State {
    events: Vec<Event>,
    regs: Vec<u16>,
    attempts: usize,
    fail_write_at: Option<usize>,
    fail_gpio: bool,
    lock_script: VecDeque<bool>,
    lock_default: bool,
    lock_reads: usize,
    now: Duration,
}

#[derive(Clone)]
pub struct Bench {
    state: Rc<RefCell<State>>,
}

impl Default for Bench {
    fn default() -> Self {
        Self::new()
    }
}

impl Bench {
    /// A chip that locks on every sample.
    pub fn new() -> Self {
        Self {
            state: Rc::new(RefCell::new(State {
                events: Vec::new(),
                regs: vec![0; N_REGS],
                attempts: 0,
                fail_write_at: None,
                fail_gpio: false,
                lock_script: VecDeque::new(),
                lock_default: true,
                lock_reads: 0,
                now: Duration::ZERO,
            })),
        }
    }

    pub fn transport(&self) -> MockTransport {
        MockTransport { bench: self.clone() }
    }

    pub fn gpio(&self) -> MockGpio {
        MockGpio { bench: self.clone() }
    }

    pub fn clock(&self) -> MockClock {
        MockClock { bench: self.clone() }
    }

    /// Lock-detect samples to return in order, then `then` forever.
    pub fn script_lock(&self, samples: &[bool], then: bool) {
        let mut s = self.state.borrow_mut();
        s.lock_script = samples.iter().copied().collect();
        s.lock_default = then;
    }

    /// Fail the `n`th register write (counting from zero, including failed ones).
    pub fn fail_write_at(&self, n: usize) {
        self.state.borrow_mut().fail_write_at = Some(n);
    }

    /// Make every GPIO output operation fail.
    pub fn fail_gpio(&self, fail: bool) {
        self.state.borrow_mut().fail_gpio = fail;
    }

    pub fn events(&self) -> Vec<Event> {
        self.state.borrow().events.clone()
    }

    pub fn writes(&self) -> Vec<(u8, u16)> {
        self.state
            .borrow()
            .events
            .iter()
            .filter_map(|e| match *e {
                Event::Write(a, v) => Some((a, v)),
                _ => None,
            })
            .collect()
    }

    /// Writes to R0 with FCAL_EN set.
    pub fn calibrations(&self) -> usize {
        self.writes()
            .iter()
            .filter(|&&(a, v)| a == fields::FCAL_EN.addr && fields::FCAL_EN.extract(v) == 1)
            .count()
    }

    /// Current level of the RF enable line.
    pub fn rf_enabled(&self) -> bool {
        self.state
            .borrow()
            .events
            .iter()
            .rev()
            .find_map(|e| match *e {
                Event::Rf(on) => Some(on),
                _ => None,
            })
            .unwrap_or(false)
    }

    pub fn lock_reads(&self) -> usize {
        self.state.borrow().lock_reads
    }

    /// Register contents as the chip sees them.
    pub fn register(&self, addr: u8) -> u16 {
        self.state.borrow().regs[usize::from(addr)]
    }

    pub fn now(&self) -> Duration {
        self.state.borrow().now
    }

    pub fn clear(&self) {
        self.state.borrow_mut().events.clear();
    }

    fn output(&self, event: Event) -> Result<()> {
        let mut s = self.state.borrow_mut();
        if s.fail_gpio {
            return Err(Error::Injected("gpio"));
        }
        trace!("{:?}", event);
        s.events.push(event);
        Ok(())
    }
}

pub struct MockTransport {
    bench: Bench,
}

impl Transport for MockTransport {
    fn write(&mut self, addr: u8, value: u16) -> Result<()> {
        let mut s = self.bench.state.borrow_mut();
        let attempt = s.attempts;
        s.attempts += 1;
        if s.fail_write_at == Some(attempt) {
            debug!("mock: failing write {} (R{})", attempt, addr);
            return Err(Error::Injected("spi write"));
        }
        let reg = s
            .regs
            .get_mut(usize::from(addr))
            .ok_or(Error::Injected("address outside register file"))?;
        *reg = value;
        s.events.push(Event::Write(addr, value));
        Ok(())
    }

    fn read(&mut self, addr: u8) -> Result<u16> {
        self.bench
            .state
            .borrow()
            .regs
            .get(usize::from(addr))
            .copied()
            .ok_or(Error::Injected("address outside register file"))
    }
}

pub struct MockGpio {
    bench: Bench,
}

impl Gpio for MockGpio {
    fn power_enable(&mut self, enable: bool) -> Result<()> {
        self.bench.output(Event::Power(enable))
    }

    fn reset_pulse(&mut self) -> Result<()> {
        self.bench.output(Event::Reset)?;
        self.bench.state.borrow_mut().regs.fill(0);
        Ok(())
    }

    fn rf_enable(&mut self, enable: bool) -> Result<()> {
        self.bench.output(Event::Rf(enable))
    }

    fn set_band_switch(&mut self, position: BandSwitch) -> Result<()> {
        self.bench.output(Event::Band(position))
    }

    fn external_doubler_enable(&mut self, enable: bool) -> Result<()> {
        self.bench.output(Event::Doubler(enable))
    }

    fn read_lock_detect(&mut self) -> Result<bool> {
        let mut s = self.bench.state.borrow_mut();
        s.lock_reads += 1;
        let default = s.lock_default;
        Ok(s.lock_script.pop_front().unwrap_or(default))
    }
}

pub struct MockClock {
    bench: Bench,
}

impl Clock for MockClock {
    fn now(&self) -> Duration {
        self.bench.now()
    }

    fn sleep(&mut self, duration: Duration) {
        self.bench.state.borrow_mut().now += duration;
    }
}

#[test]
fn lock_script_then_default() {
    let bench = Bench::new();
    bench.script_lock(&[false, true], false);
    let mut gpio = bench.gpio();
    let reads: Vec<_> = (0..4).map(|_| gpio.read_lock_detect().unwrap()).collect();
    assert_eq!(vec![false, true, false, false], reads);
    assert_eq!(4, bench.lock_reads());
}

#[test]
fn injected_write_failure() {
    let bench = Bench::new();
    let mut bus = bench.transport();
    bench.fail_write_at(1);
    bus.write(1, 0x57A0).unwrap();
    assert!(bus.write(2, 0x81F4).is_err());
    bus.write(2, 0x81F4).unwrap();
    assert_eq!(vec![(1, 0x57A0), (2, 0x81F4)], bench.writes());
    assert_eq!(0x81F4, bus.read(2).unwrap());
}

#[test]
fn clock_is_virtual() {
    let bench = Bench::new();
    let mut clock = bench.clock();
    clock.sleep(Duration::from_millis(250));
    assert_eq!(Duration::from_millis(250), clock.now());
}
