/* Register shadow
 *
 * Mirrors what was last sent to the chip. The only way a value reaches the
 * bus is write_through(), and the shadow is updated after the bus accepted
 * it, so a failed transfer never leaves a demanded-but-unsent value behind.
 * */
use log::debug;
use std::fmt;
use thiserror::Error;

use crate::hal::{self, Transport};
use crate::registers::{Field, RegisterMap, LMX2820};

#[derive(Error, Debug)]
pub enum RegisterError {
    #[error("Register R{0} does not exist")]
    InvalidAddress(usize),
    #[error("Value {value:#x} does not fit {width}-bit register R{addr}")]
    RegisterValueOutOfRange { addr: u8, value: u32, width: u32 },
    #[error("Value {value:#x} does not fit field {field}")]
    FieldValueOutOfRange { field: &'static str, value: u32 },
    #[error("Images describe different register maps")]
    LayoutMismatch,
    #[error(transparent)]
    Transport(#[from] hal::Error),
}

type Result<T> = std::result::Result<T, RegisterError>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegisterDiff {
    pub addr: u8,
    pub old: u16,
    pub new: u16,
}

impl fmt::Display for RegisterDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "R{:03}: {:#06X} -> {:#06X}", self.addr, self.old, self.new)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegisterImage {
    map: &'static RegisterMap,
    values: Vec<u16>,
}

impl Default for RegisterImage {
    fn default() -> Self {
        Self::new(&LMX2820)
    }
}

impl RegisterImage {
    /// All-zero image, the state after a power cycle.
    pub fn new(map: &'static RegisterMap) -> Self {
        Self {
            map,
            values: vec![0; map.len],
        }
    }

    pub fn map(&self) -> &'static RegisterMap {
        self.map
    }

    pub fn values(&self) -> &[u16] {
        &self.values
    }

    pub fn get(&self, addr: u8) -> Result<u16> {
        self.values
            .get(usize::from(addr))
            .copied()
            .ok_or(RegisterError::InvalidAddress(usize::from(addr)))
    }

    pub fn field(&self, field: &Field) -> Result<u16> {
        Ok(field.extract(self.get(field.addr)?))
    }

    pub fn clear(&mut self) {
        self.values.fill(0);
    }

    /// Check a register write without performing it.
    pub fn check(&self, addr: u8, value: u32) -> Result<()> {
        if !self.map.contains(usize::from(addr)) {
            return Err(RegisterError::InvalidAddress(usize::from(addr)));
        }
        if value > self.map.max_value() {
            return Err(RegisterError::RegisterValueOutOfRange {
                addr,
                value,
                width: self.map.width,
            });
        }
        Ok(())
    }

    /// Send `value` to register `addr` and record it in the shadow.
    pub fn write_through<T: Transport + ?Sized>(
        &mut self,
        bus: &mut T,
        addr: u8,
        value: u32,
    ) -> Result<()> {
        self.check(addr, value)?;
        let value = value as u16;
        bus.write(addr, value)?;
        debug!("R{} <- {:#06x}", addr, value);
        self.values[usize::from(addr)] = value;
        Ok(())
    }

    /// Read-modify-write of one field; other bits of the register are kept.
    pub fn set_field<T: Transport + ?Sized>(
        &mut self,
        bus: &mut T,
        field: &Field,
        value: u32,
    ) -> Result<()> {
        if !field.fits(value) {
            return Err(RegisterError::FieldValueOutOfRange {
                field: field.name,
                value,
            });
        }
        let reg = self.get(field.addr)?;
        let merged = field.insert(reg, value as u16);
        self.write_through(bus, field.addr, u32::from(merged))
    }

    pub fn diff(&self, other: &RegisterImage) -> Result<Vec<RegisterDiff>> {
        if self.map != other.map {
            return Err(RegisterError::LayoutMismatch);
        }
        Ok(self
            .values
            .iter()
            .zip(&other.values)
            .enumerate()
            .filter(|(_, (old, new))| old != new)
            .map(|(addr, (&old, &new))| RegisterDiff {
                addr: addr as u8,
                old,
                new,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{Bench, Event};
    use crate::registers::fields;
    use proptest::prelude::*;

    #[test]
    fn write_through_updates_shadow() {
        let bench = Bench::new();
        let mut bus = bench.transport();
        let mut image = RegisterImage::default();
        image.write_through(&mut bus, 36, 80).unwrap();
        assert_eq!(80, image.get(36).unwrap());
        assert_eq!(vec![Event::Write(36, 80)], bench.events());
    }

    #[test]
    fn oversized_value_never_reaches_bus() {
        let bench = Bench::new();
        let mut bus = bench.transport();
        let mut image = RegisterImage::default();
        assert!(matches!(
            image.write_through(&mut bus, 36, 0x1_0000),
            Err(RegisterError::RegisterValueOutOfRange { addr: 36, .. })
        ));
        assert!(matches!(
            image.write_through(&mut bus, 123, 0),
            Err(RegisterError::InvalidAddress(123))
        ));
        assert!(bench.events().is_empty());
        assert_eq!(0, image.get(36).unwrap());
    }

    #[test]
    fn failed_send_keeps_shadow() {
        let bench = Bench::new();
        let mut bus = bench.transport();
        let mut image = RegisterImage::default();
        image.write_through(&mut bus, 78, 0x0001).unwrap();
        bench.fail_write_at(bench.writes().len());
        assert!(matches!(
            image.set_field(&mut bus, &fields::OUTA_PD, 1),
            Err(RegisterError::Transport(_))
        ));
        assert_eq!(0x0001, image.get(78).unwrap());
    }

    #[test]
    fn field_range_checked() {
        let bench = Bench::new();
        let mut bus = bench.transport();
        let mut image = RegisterImage::default();
        assert!(matches!(
            image.set_field(&mut bus, &fields::CHDIV, 8),
            Err(RegisterError::FieldValueOutOfRange { field: "CHDIV", value: 8 })
        ));
        assert!(bench.events().is_empty());
    }

    #[test]
    fn diff_lists_changed_registers() {
        let bench = Bench::new();
        let mut bus = bench.transport();
        let before = RegisterImage::default();
        let mut after = before.clone();
        after.write_through(&mut bus, 36, 0x50).unwrap();
        after.set_field(&mut bus, &fields::OUTA_MUX, 2).unwrap();
        let diff = before.diff(&after).unwrap();
        assert_eq!(
            vec![
                RegisterDiff { addr: 36, old: 0, new: 0x50 },
                RegisterDiff { addr: 78, old: 0, new: 0x02 },
            ],
            diff
        );
        assert_eq!("R036: 0x0000 -> 0x0050", diff[0].to_string());
        assert!(after.diff(&after).unwrap().is_empty());
    }

    proptest! {
        #[test]
        fn set_field_preserves_neighbours(initial: u16, pd: bool, mux in 0u32..4) {
            let bench = Bench::new();
            let mut bus = bench.transport();
            let mut image = RegisterImage::default();
            image.write_through(&mut bus, 78, u32::from(initial)).unwrap();
            image.set_field(&mut bus, &fields::OUTA_MUX, mux).unwrap();
            image.set_field(&mut bus, &fields::OUTA_PD, u32::from(pd)).unwrap();
            let reg = image.get(78).unwrap();
            let touched = 0x3 | 0x40;
            prop_assert_eq!(initial & !touched, reg & !touched);
            prop_assert_eq!(mux as u16, fields::OUTA_MUX.extract(reg));
            prop_assert_eq!(u16::from(pd), fields::OUTA_PD.extract(reg));
        }
    }
}
