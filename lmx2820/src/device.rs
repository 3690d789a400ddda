/* Device programmer
 *
 * Applies a SynthesisPlan to the chip:
 *
 *   1. RF off (GPIO low, OUTA_PD set)
 *   2. band switch, external doubler
 *   3. MASH, N, NUM, DEN, CHDIV, OUTA_MUX
 *   4. calibrate (FCAL_EN)
 *   5. debounced lock poll, back to 4 on timeout until attempts run out
 *   6. OUTA_PWR, OUTA_PD, then RF on
 *
 * RF is only asserted at the very end; any failure on the way forces it off.
 * */
use log::{info, warn};
use std::time::Duration;
use thiserror::Error;

use crate::defaults::Defaults;
use crate::hal::{self, Clock, Gpio, Transport};
use crate::image::{RegisterError, RegisterImage};
use crate::plan::{ChannelDivider, SynthesisPlan};
use crate::registers::{fields, Field};

const MIN_POLL_INTERVAL: Duration = Duration::from_micros(100);

#[derive(Error, Debug)]
pub enum ProgramError {
    #[error("Inconsistent plan: {0}")]
    InconsistentPlan(&'static str),
    #[error(transparent)]
    Register(#[from] RegisterError),
    #[error(transparent)]
    Hal(#[from] hal::Error),
    #[error("No PLL lock within {timeout:?} (attempt {attempt})")]
    LockTimeout { attempt: u32, timeout: Duration },
    #[error("PLL failed to lock after {attempts} calibration attempts")]
    PllLock { attempts: u32 },
}

type Result<T> = std::result::Result<T, ProgramError>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LockSettings {
    /// Time between lock-detect samples.
    pub interval: Duration,
    /// Consecutive locked samples needed.
    pub debounce: u32,
    /// Per calibration attempt.
    pub timeout: Duration,
    pub attempts: u32,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(1),
            debounce: 3,
            timeout: Duration::from_millis(100),
            attempts: 3,
        }
    }
}

/// How FCAL_EN starts a calibration.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Calibration {
    /// A single write with FCAL_EN set.
    #[default]
    Edge,
    /// Set, wait `settle`, clear.
    Pulse { settle: Duration },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockPoll {
    Pending,
    Locked,
    TimedOut,
}

/// Counts consecutive locked samples; any unlocked sample starts over.
#[derive(Clone, Debug)]
pub struct LockDebouncer {
    required: u32,
    timeout: Duration,
    consecutive: u32,
}

impl LockDebouncer {
    pub fn new(required: u32, timeout: Duration) -> Self {
        Self {
            required: required.max(1),
            timeout,
            consecutive: 0,
        }
    }

    pub fn sample(&mut self, locked: bool, elapsed: Duration) -> LockPoll {
        self.consecutive = if locked { self.consecutive + 1 } else { 0 };
        if self.consecutive >= self.required {
            LockPoll::Locked
        } else if elapsed >= self.timeout {
            LockPoll::TimedOut
        } else {
            LockPoll::Pending
        }
    }
}

pub struct Device<T, G, C> {
    bus: T,
    gpio: G,
    clock: C,
    image: RegisterImage,
    lock: LockSettings,
    calibration: Calibration,
}

impl<T: Transport, G: Gpio, C: Clock> Device<T, G, C> {
    pub fn new(bus: T, gpio: G, clock: C) -> Self {
        Self {
            bus,
            gpio,
            clock,
            image: RegisterImage::default(),
            lock: LockSettings::default(),
            calibration: Calibration::default(),
        }
    }

    pub fn with_lock(mut self, lock: LockSettings) -> Self {
        self.lock = lock;
        self
    }

    pub fn with_calibration(mut self, calibration: Calibration) -> Self {
        self.calibration = calibration;
        self
    }

    pub fn registers(&self) -> &RegisterImage {
        &self.image
    }

    /// Supply on and a reset pulse; the chip comes up with cleared registers.
    pub fn power_on(&mut self) -> Result<()> {
        self.gpio.rf_enable(false)?;
        self.gpio.power_enable(true)?;
        self.gpio.reset_pulse()?;
        self.image.clear();
        info!("power on");
        Ok(())
    }

    pub fn power_off(&mut self) -> Result<()> {
        let rf = self.rf_off();
        self.gpio.power_enable(false)?;
        self.image.clear();
        info!("power off");
        rf?;
        Ok(())
    }

    /// Writes the static image, then powers the output buffer down.
    pub fn initialize_registers(&mut self, defaults: &Defaults) -> Result<()> {
        for (addr, value) in defaults.iter() {
            self.image.write_through(&mut self.bus, addr, u32::from(value))?;
        }
        self.image.set_field(&mut self.bus, &fields::OUTA_PD, 1)?;
        info!("{} static registers written", defaults.len());
        Ok(())
    }

    /// Off drops the GPIO line and sets OUTA_PD; on clears OUTA_PD, then raises the line.
    pub fn rf_enable(&mut self, enable: bool) -> Result<()> {
        if enable {
            self.image.set_field(&mut self.bus, &fields::OUTA_PD, 0)?;
            self.gpio.rf_enable(true)?;
            Ok(())
        } else {
            self.rf_off()
        }
    }

    // The line goes low even when the register write fails
    fn rf_off(&mut self) -> Result<()> {
        let line = self.gpio.rf_enable(false);
        self.image.set_field(&mut self.bus, &fields::OUTA_PD, 1)?;
        line?;
        Ok(())
    }

    pub fn is_locked(&mut self) -> Result<bool> {
        Ok(self.gpio.read_lock_detect()?)
    }

    /// Read a register back from the chip, if the transport supports it.
    pub fn read_back(&mut self, addr: u8) -> Result<u16> {
        self.image.check(addr, 0)?;
        Ok(self.bus.read(addr)?)
    }

    pub fn apply_plan(&mut self, plan: &SynthesisPlan) -> Result<()> {
        plan.validate().map_err(ProgramError::InconsistentPlan)?;
        let writes = frequency_writes(plan)?;

        let result = self.program(plan, &writes);
        if let Err(e) = &result {
            warn!("programming {} Hz failed: {}", plan.freq_hz, e);
            if let Err(e) = self.rf_off() {
                warn!("could not force RF off: {}", e);
            }
        }
        result
    }

    fn program(&mut self, plan: &SynthesisPlan, writes: &[(&'static Field, u32)]) -> Result<()> {
        self.rf_off()?;
        self.gpio.set_band_switch(plan.band.switch())?;
        self.gpio.external_doubler_enable(plan.external_doubler)?;

        for &(field, value) in writes {
            self.image.set_field(&mut self.bus, field, value)?;
        }

        self.acquire_lock()?;

        self.image
            .set_field(&mut self.bus, &fields::OUTA_PWR, u32::from(plan.power))?;
        self.rf_enable(true)?;
        info!("RF on at {} Hz", plan.freq_hz);
        Ok(())
    }

    fn acquire_lock(&mut self) -> Result<()> {
        let attempts = self.lock.attempts.max(1);
        for attempt in 1..=attempts {
            self.calibrate()?;
            match self.wait_for_lock(attempt) {
                Ok(()) => {
                    info!("PLL locked (attempt {})", attempt);
                    return Ok(());
                }
                Err(e @ ProgramError::LockTimeout { .. }) => warn!("{}", e),
                Err(e) => return Err(e),
            }
        }
        Err(ProgramError::PllLock { attempts })
    }

    fn calibrate(&mut self) -> Result<()> {
        self.image.set_field(&mut self.bus, &fields::FCAL_EN, 1)?;
        if let Calibration::Pulse { settle } = self.calibration {
            self.clock.sleep(settle);
            self.image.set_field(&mut self.bus, &fields::FCAL_EN, 0)?;
        }
        Ok(())
    }

    fn wait_for_lock(&mut self, attempt: u32) -> Result<()> {
        let start = self.clock.now();
        let mut debouncer = LockDebouncer::new(self.lock.debounce, self.lock.timeout);
        loop {
            let locked = self.gpio.read_lock_detect()?;
            let elapsed = self.clock.now().saturating_sub(start);
            match debouncer.sample(locked, elapsed) {
                LockPoll::Locked => return Ok(()),
                LockPoll::TimedOut => {
                    return Err(ProgramError::LockTimeout {
                        attempt,
                        timeout: self.lock.timeout,
                    })
                }
                LockPoll::Pending => self.clock.sleep(self.lock.interval.max(MIN_POLL_INTERVAL)),
            }
        }
    }
}

/// Frequency-defining field writes in bus order, all range-checked up front.
fn frequency_writes(plan: &SynthesisPlan) -> Result<Vec<(&'static Field, u32)>> {
    let mut writes = vec![
        (&fields::MASH_ORDER, u32::from(u8::from(plan.mash))),
        (&fields::PLL_N, plan.n),
    ];
    // Integer mode still clears a stale numerator
    let (num, den) = plan.fraction.map_or((0, None), |f| (f.num, Some(f.den)));
    writes.push((&fields::PLL_NUM_MSB, num >> 16));
    writes.push((&fields::PLL_NUM_LSB, num & 0xFFFF));
    if let Some(den) = den {
        writes.push((&fields::PLL_DEN_MSB, den >> 16));
        writes.push((&fields::PLL_DEN_LSB, den & 0xFFFF));
    }
    if let Some(div) = plan.chdiv {
        writes.push((&fields::CHDIV, u32::from(ChannelDivider::code(div))));
    }
    writes.push((&fields::OUTA_MUX, u32::from(u8::from(plan.path))));

    let output = (&fields::OUTA_PWR, u32::from(plan.power));
    for &(field, value) in writes.iter().chain([&output]) {
        if !field.fits(value) {
            return Err(RegisterError::FieldValueOutOfRange {
                field: field.name,
                value,
            }
            .into());
        }
    }
    Ok(writes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{Bench, Event, MockClock, MockGpio, MockTransport};
    use crate::plan::{compute_plan, Planner, PlannerConfig};
    use crate::registers::FREQUENCY_ORDER;
    use itertools::Itertools;
    use proptest::prelude::*;

    type MockDevice = Device<MockTransport, MockGpio, MockClock>;

    fn device(bench: &Bench) -> MockDevice {
        let mut dev = Device::new(bench.transport(), bench.gpio(), bench.clock());
        dev.power_on().unwrap();
        dev.initialize_registers(&Defaults::builtin()).unwrap();
        bench.clear();
        dev
    }

    #[test]
    fn debounce_ignores_glitches() {
        let mut d = LockDebouncer::new(3, Duration::from_millis(100));
        let samples = [false, true, true, false, true, true, true];
        let polls: Vec<_> = samples
            .iter()
            .map(|&s| d.sample(s, Duration::ZERO))
            .collect();
        assert_eq!(LockPoll::Locked, polls[6]);
        assert!(polls[..6].iter().all(|&p| p == LockPoll::Pending));
    }

    #[test]
    fn debounce_times_out() {
        let mut d = LockDebouncer::new(3, Duration::from_millis(10));
        assert_eq!(LockPoll::Pending, d.sample(true, Duration::from_millis(9)));
        assert_eq!(LockPoll::TimedOut, d.sample(false, Duration::from_millis(10)));
        // Lock on the deadline still counts
        let mut d = LockDebouncer::new(1, Duration::from_millis(10));
        assert_eq!(LockPoll::Locked, d.sample(true, Duration::from_millis(50)));
    }

    #[test]
    fn glitch_needs_seventh_read() {
        let bench = Bench::new();
        let mut dev = device(&bench);
        bench.script_lock(&[false, true, true, false, true, true, true], true);
        dev.apply_plan(&compute_plan(1_000_000_000).unwrap()).unwrap();
        assert_eq!(7, bench.lock_reads());
        assert_eq!(1, bench.calibrations());
        assert!(bench.rf_enabled());
    }

    #[test]
    fn protocol_order() {
        let bench = Bench::new();
        let mut dev = device(&bench);
        let plan = compute_plan(1_000_000_000).unwrap();
        dev.apply_plan(&plan).unwrap();

        let events = bench.events();
        assert_eq!(
            &[
                Event::Rf(false),
                Event::Write(78, 0x0040),
                Event::Band(plan.band.switch()),
                Event::Doubler(false)
            ],
            &events[..4]
        );
        assert_eq!(Some(&Event::Rf(true)), events.last());

        let addrs: Vec<u8> = bench.writes().iter().map(|&(a, _)| a).collect();
        // Output buffer down, then MASH, N, NUM; no DEN in integer mode
        assert_eq!(vec![78, 35, 36, 42, 43, 32, 78, 0, 79, 78], addrs);
        let freq: Vec<u8> = addrs[1..].iter().copied().take_while(|&a| a != 0).collect();
        assert!(freq
            .iter()
            .map(|a| FREQUENCY_ORDER.iter().position(|o| o == a).unwrap())
            .tuple_windows()
            .all(|(a, b)| a < b));

        let regs = dev.registers();
        assert_eq!(80, regs.field(&fields::PLL_N).unwrap());
        assert_eq!(3, regs.field(&fields::CHDIV).unwrap());
        assert_eq!(0, regs.field(&fields::OUTA_MUX).unwrap());
        assert_eq!(0, regs.field(&fields::OUTA_PD).unwrap());
        assert_eq!(7, regs.field(&fields::OUTA_PWR).unwrap());
        assert_eq!(1, regs.field(&fields::FCAL_EN).unwrap());
        // Static configuration of the shared registers survives
        assert_eq!(0x6470, regs.get(0).unwrap());
    }

    #[test]
    fn fractional_writes_denominator() {
        let bench = Bench::new();
        let mut dev = device(&bench);
        let planner = Planner::new(PlannerConfig::fractional()).unwrap();
        let plan = planner.compute_plan(10_650_000_000).unwrap();
        dev.apply_plan(&plan).unwrap();

        let writes = bench.writes();
        let addrs: Vec<u8> = writes.iter().map(|&(a, _)| a).collect();
        assert_eq!(vec![78, 35, 36, 42, 43, 38, 39, 78, 0, 79, 78], addrs);
        assert_eq!((42, 0x0040), writes[3]);
        assert_eq!((43, 0x0000), writes[4]);
        assert_eq!((38, 0x0100), writes[5]);
        // Mux selected with the buffer still down
        assert_eq!((78, 0x0041), writes[7]);
        assert_eq!(2, dev.registers().field(&fields::MASH_ORDER).unwrap());
        assert_eq!(1, dev.registers().field(&fields::OUTA_MUX).unwrap());
    }

    #[test]
    fn external_doubler_band() {
        let bench = Bench::new();
        let mut dev = device(&bench);
        let plan = compute_plan(24_000_000_000).unwrap();
        dev.apply_plan(&plan).unwrap();
        let events = bench.events();
        assert_eq!(Event::Band(hal::BandSwitch::P3), events[2]);
        assert_eq!(Event::Doubler(true), events[3]);
        assert_eq!(2, dev.registers().field(&fields::OUTA_MUX).unwrap());
    }

    #[test]
    fn retry_budget_then_fatal() {
        let bench = Bench::new();
        let mut dev = device(&bench);
        bench.script_lock(&[], false);
        let err = dev.apply_plan(&compute_plan(11_000_000_000).unwrap()).unwrap_err();
        assert!(matches!(err, ProgramError::PllLock { attempts: 3 }));
        assert_eq!(3, bench.calibrations());
        assert!(!bench.events().contains(&Event::Rf(true)));
        assert!(!bench.rf_enabled());
        // Output registers are never touched without lock
        assert!(!bench.writes().iter().any(|&(a, _)| a == 79));
        assert!(bench
            .writes()
            .iter()
            .filter(|&&(a, _)| a == 78)
            .all(|&(_, v)| fields::OUTA_PD.extract(v) == 1));
        assert_eq!(1, fields::OUTA_PD.extract(bench.register(78)));
        // Three full timeouts of virtual time
        assert!(bench.now() >= Duration::from_millis(300));
    }

    #[test]
    fn second_attempt_locks() {
        let bench = Bench::new();
        let mut dev = device(&bench).with_lock(LockSettings {
            timeout: Duration::from_millis(5),
            ..LockSettings::default()
        });
        // 5 ms at 1 ms per sample is six reads for the first attempt
        bench.script_lock(&[false; 6], true);
        dev.apply_plan(&compute_plan(2_000_000_000).unwrap()).unwrap();
        assert_eq!(2, bench.calibrations());
        assert!(bench.rf_enabled());
    }

    #[test]
    fn pulse_calibration_sets_then_clears() {
        let bench = Bench::new();
        let settle = Duration::from_micros(500);
        let mut dev = device(&bench).with_calibration(Calibration::Pulse { settle });
        dev.apply_plan(&compute_plan(1_000_000_000).unwrap()).unwrap();
        let r0: Vec<u16> = bench
            .writes()
            .iter()
            .filter(|&&(a, _)| a == 0)
            .map(|&(_, v)| fields::FCAL_EN.extract(v))
            .collect();
        assert_eq!(vec![1, 0], r0);
        assert!(bench.now() >= settle);
    }

    #[test]
    fn edge_calibration_single_write() {
        let bench = Bench::new();
        let mut dev = device(&bench);
        dev.apply_plan(&compute_plan(1_000_000_000).unwrap()).unwrap();
        assert_eq!(1, bench.writes().iter().filter(|&&(a, _)| a == 0).count());
    }

    #[test]
    fn inconsistent_plan_touches_nothing() {
        let bench = Bench::new();
        let mut dev = device(&bench);
        let mut plan = compute_plan(11_000_000_000).unwrap();
        plan.external_doubler = true;
        assert!(matches!(
            dev.apply_plan(&plan),
            Err(ProgramError::InconsistentPlan(_))
        ));
        assert!(bench.events().is_empty());
    }

    #[test]
    fn oversized_field_touches_nothing() {
        let bench = Bench::new();
        let mut dev = device(&bench);
        let mut plan = compute_plan(11_000_000_000).unwrap();
        plan.power = 9;
        assert!(matches!(
            dev.apply_plan(&plan),
            Err(ProgramError::Register(RegisterError::FieldValueOutOfRange { .. }))
        ));
        assert!(bench.events().is_empty());
    }

    #[test]
    fn failed_write_leaves_rf_off_and_shadow_intact() {
        let bench = Bench::new();
        let mut dev = device(&bench);
        let before = dev.registers().clone();
        // Static registers and OUTA_PD so far; next is OUTA_PD again, MASH, then N
        bench.fail_write_at(Defaults::builtin().len() + 3);
        let err = dev.apply_plan(&compute_plan(1_000_000_000).unwrap()).unwrap_err();
        assert!(matches!(err, ProgramError::Register(RegisterError::Transport(_))));
        assert!(!bench.rf_enabled());
        assert_eq!(1, fields::OUTA_PD.extract(bench.register(78)));
        let diff = before.diff(dev.registers()).unwrap();
        assert!(diff.iter().all(|d| d.addr == 35));
        assert_eq!(0, dev.registers().field(&fields::PLL_N).unwrap());
    }

    #[test]
    fn read_back_from_chip() {
        let bench = Bench::new();
        let mut dev = device(&bench);
        assert_eq!(0x81F4, dev.read_back(2).unwrap());
        assert!(matches!(
            dev.read_back(200),
            Err(ProgramError::Register(RegisterError::InvalidAddress(200)))
        ));
    }

    #[test]
    fn power_off_drops_rf_first() {
        let bench = Bench::new();
        let mut dev = device(&bench);
        dev.apply_plan(&compute_plan(1_000_000_000).unwrap()).unwrap();
        bench.clear();
        dev.power_off().unwrap();
        assert_eq!(
            vec![Event::Rf(false), Event::Write(78, 0x0040), Event::Power(false)],
            bench.events()
        );
        assert!(dev.registers().values().iter().all(|&v| v == 0));
    }

    #[test]
    fn output_buffer_down_until_locked() {
        let bench = Bench::new();
        let mut dev = Device::new(bench.transport(), bench.gpio(), bench.clock());
        dev.power_on().unwrap();
        dev.initialize_registers(&Defaults::builtin()).unwrap();
        assert_eq!(1, fields::OUTA_PD.extract(bench.register(78)));

        bench.clear();
        dev.apply_plan(&compute_plan(15_000_000_000).unwrap()).unwrap();
        let writes = bench.writes();
        let cal = writes.iter().position(|&(a, _)| a == 0).unwrap();
        assert!(writes[..cal]
            .iter()
            .filter(|&&(a, _)| a == 78)
            .all(|&(_, v)| fields::OUTA_PD.extract(v) == 1));
        assert_eq!(0, fields::OUTA_PD.extract(bench.register(78)));

        dev.rf_enable(false).unwrap();
        assert!(!bench.rf_enabled());
        assert_eq!(1, fields::OUTA_PD.extract(bench.register(78)));
        // Mux survives the power-down
        assert_eq!(2, fields::OUTA_MUX.extract(bench.register(78)));
    }

    #[test]
    fn rf_off_drops_line_despite_bus_fault() {
        let bench = Bench::new();
        let mut dev = device(&bench);
        dev.apply_plan(&compute_plan(1_000_000_000).unwrap()).unwrap();
        // Every write so far, counting the static image and its OUTA_PD
        bench.fail_write_at(Defaults::builtin().len() + 1 + bench.writes().len());
        assert!(dev.rf_enable(false).is_err());
        assert!(!bench.rf_enabled());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn apply_is_idempotent(k in 10u64..=400) {
            let Ok(plan) = compute_plan(k * 100_000_000) else { return Ok(()) };
            let bench = Bench::new();
            let mut dev = device(&bench);
            dev.apply_plan(&plan).unwrap();
            let image = dev.registers().clone();
            // The first pass starts from OUTA_MUX at its reset value
            bench.clear();
            dev.apply_plan(&plan).unwrap();
            let second = bench.events();
            bench.clear();
            dev.apply_plan(&plan).unwrap();
            prop_assert_eq!(second, bench.events());
            prop_assert_eq!(&image, dev.registers());
        }

        #[test]
        fn shadow_matches_chip(k in 10u64..=400) {
            let Ok(plan) = compute_plan(k * 100_000_000) else { return Ok(()) };
            let bench = Bench::new();
            let mut dev = device(&bench);
            dev.apply_plan(&plan).unwrap();
            for (addr, &v) in dev.registers().values().iter().enumerate() {
                prop_assert_eq!(bench.register(addr as u8), v);
            }
        }
    }
}
