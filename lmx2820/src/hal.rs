//! Hardware capabilities the driver is written against.
//!
//! The core only ever talks to a [`Transport`] (register writes, optional
//! readback), a [`Gpio`] surface (power, reset, RF path, lock detect) and a
//! [`Clock`]. Real backends live in [`crate::spi`] and [`crate::gpio`],
//! simulated ones in [`crate::mock`].
use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("SPI communication failed")]
    Io(#[from] std::io::Error),
    #[error("GPIO access failed")]
    Gpio(#[from] gpiocdev::Error),
    #[error("Register readback not supported by this transport")]
    Unsupported,
    #[error("Simulated fault: {0}")]
    Injected(&'static str),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Register transport. Values are exactly one register wide.
pub trait Transport {
    fn write(&mut self, addr: u8, value: u16) -> Result<()>;

    fn read(&mut self, _addr: u8) -> Result<u16> {
        Err(Error::Unsupported)
    }
}

/// SP4T band-select switch position.
#[derive(Clone, Copy, Debug, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
#[rustfmt::skip]
pub enum BandSwitch {
    P0 = 0,
    P1 = 1,
    P2 = 2,
    P3 = 3,
}

impl BandSwitch {
    /// Select line levels, least significant first.
    pub fn lines(self) -> [bool; 2] {
        let p = u8::from(self);
        [p & 0x1 != 0, p & 0x2 != 0]
    }
}

pub trait Gpio {
    fn power_enable(&mut self, enable: bool) -> Result<()>;
    fn reset_pulse(&mut self) -> Result<()>;
    fn rf_enable(&mut self, enable: bool) -> Result<()>;
    fn set_band_switch(&mut self, position: BandSwitch) -> Result<()>;
    fn external_doubler_enable(&mut self, enable: bool) -> Result<()>;
    fn read_lock_detect(&mut self) -> Result<bool>;
}

/// Time source for lock polling, so tests can run on virtual time.
pub trait Clock {
    /// Monotonic time since an arbitrary origin.
    fn now(&self) -> Duration;
    fn sleep(&mut self, duration: Duration);
}

pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    fn sleep(&mut self, duration: Duration) {
        std::thread::sleep(duration)
    }
}

#[test]
fn band_switch_lines() {
    assert_eq!([false, false], BandSwitch::P0.lines());
    assert_eq!([true, false], BandSwitch::P1.lines());
    assert_eq!([false, true], BandSwitch::P2.lines());
    assert_eq!([true, true], BandSwitch::P3.lines());
    assert!(BandSwitch::try_from(4u8).is_err());
}
