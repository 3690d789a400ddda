use gpiocdev::{line::Value, Request};
use std::{thread, time::Duration};

use crate::config::GpioConfig;
use crate::hal::{BandSwitch, Gpio, Result};

const RESET_PULSE: Duration = Duration::from_millis(10);

fn level(active: bool) -> Value {
    if active {
        Value::Active
    } else {
        Value::Inactive
    }
}

/// Board control lines on a Linux GPIO character device.
pub struct Pins {
    req: Request,
    pins: GpioConfig,
}

impl Pins {
    pub fn new(pins: &GpioConfig) -> Result<Self> {
        let req = Request::builder()
            .on_chip(&pins.chip)
            .with_consumer("lmx2820")
            .with_lines(&[
                pins.power,
                pins.reset,
                pins.rf_enable,
                pins.doubler,
                pins.band_select[0],
                pins.band_select[1],
            ])
            .as_output(Value::Inactive)
            .with_line(pins.lock_detect)
            .as_input()
            .request()?;
        Ok(Self {
            req,
            pins: pins.clone(),
        })
    }

    fn set(&mut self, offset: u32, active: bool) -> Result<()> {
        self.req.set_value(offset, level(active))?;
        Ok(())
    }
}

impl Gpio for Pins {
    fn power_enable(&mut self, enable: bool) -> Result<()> {
        self.set(self.pins.power, enable)
    }

    fn reset_pulse(&mut self) -> Result<()> {
        self.set(self.pins.reset, true)?;
        thread::sleep(RESET_PULSE);
        self.set(self.pins.reset, false)
    }

    fn rf_enable(&mut self, enable: bool) -> Result<()> {
        self.set(self.pins.rf_enable, enable)
    }

    fn set_band_switch(&mut self, position: BandSwitch) -> Result<()> {
        let [b0, b1] = position.lines();
        self.set(self.pins.band_select[0], b0)?;
        self.set(self.pins.band_select[1], b1)
    }

    fn external_doubler_enable(&mut self, enable: bool) -> Result<()> {
        self.set(self.pins.doubler, enable)
    }

    fn read_lock_detect(&mut self) -> Result<bool> {
        Ok(self.req.value(self.pins.lock_detect)? == Value::Active)
    }
}
