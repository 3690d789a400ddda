/* LMX2820 register map
 *
 * One canonical layout: 123 registers (R0..R122), 16 data bits each.
 * 32-bit quantities (PLL_NUM, PLL_DEN) are split across a register pair,
 * most significant half first. Only the fields the driver touches are
 * described; everything else is carried opaquely from the default image.
 * */
use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::Deserialize;
#[cfg(test)] use proptest::prelude::*;
#[cfg(test)] use proptest_derive::Arbitrary;

pub const N_REGS: usize = 123;
pub const REG_WIDTH: u32 = 16;

/// A sub-field of one register: `(reg >> shift) & mask`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Field {
    pub name: &'static str,
    pub addr: u8,
    pub mask: u16,
    pub shift: u8,
}

impl Field {
    pub fn extract(&self, reg: u16) -> u16 {
        (reg >> self.shift) & self.mask
    }

    pub fn insert(&self, reg: u16, value: u16) -> u16 {
        merge(reg, self.mask, self.shift, value)
    }

    pub fn fits(&self, value: u32) -> bool {
        value <= u32::from(self.mask)
    }
}

/// Clear the bits under `mask << shift` and OR in `(value & mask) << shift`.
pub fn merge(reg: u16, mask: u16, shift: u8, value: u16) -> u16 {
    let field = u32::from(mask) << shift;
    let reg = u32::from(reg);
    let value = u32::from(value & mask) << shift;
    // Anything shifted past bit 15 is not part of the register
    ((reg & !field) | (value & field) & 0xFFFF) as u16
}

#[derive(Debug, PartialEq, Eq)]
pub struct RegisterMap {
    pub len: usize,
    pub width: u32,
    pub fields: &'static [Field],
}

impl RegisterMap {
    pub fn max_value(&self) -> u32 {
        (1u32 << self.width) - 1
    }

    pub fn contains(&self, addr: usize) -> bool {
        addr < self.len
    }

    pub fn field(&self, name: &str) -> Option<&'static Field> {
        self.fields.iter().find(|f| f.name.eq_ignore_ascii_case(name))
    }
}

#[rustfmt::skip]
pub mod fields {
    use super::Field;

    pub const POWERDOWN:    Field = Field { name: "POWERDOWN",    addr:   0, mask: 0x0001, shift: 0 };
    pub const RESET:        Field = Field { name: "RESET",        addr:   0, mask: 0x0001, shift: 1 };
    pub const FCAL_EN:      Field = Field { name: "FCAL_EN",      addr:   0, mask: 0x0001, shift: 4 };
    pub const CHDIV:        Field = Field { name: "CHDIV",        addr:  32, mask: 0x0007, shift: 6 };
    pub const MASH_ORDER:   Field = Field { name: "MASH_ORDER",   addr:  35, mask: 0x0003, shift: 7 };
    pub const PLL_N:        Field = Field { name: "PLL_N",        addr:  36, mask: 0x7FFF, shift: 0 };
    pub const PLL_DEN_MSB:  Field = Field { name: "PLL_DEN_MSB",  addr:  38, mask: 0xFFFF, shift: 0 };
    pub const PLL_DEN_LSB:  Field = Field { name: "PLL_DEN_LSB",  addr:  39, mask: 0xFFFF, shift: 0 };
    pub const PLL_NUM_MSB:  Field = Field { name: "PLL_NUM_MSB",  addr:  42, mask: 0xFFFF, shift: 0 };
    pub const PLL_NUM_LSB:  Field = Field { name: "PLL_NUM_LSB",  addr:  43, mask: 0xFFFF, shift: 0 };
    pub const OUTA_MUX:     Field = Field { name: "OUTA_MUX",     addr:  78, mask: 0x0003, shift: 0 };
    pub const OUTA_PD:      Field = Field { name: "OUTA_PD",      addr:  78, mask: 0x0001, shift: 6 };
    pub const OUTA_PWR:     Field = Field { name: "OUTA_PWR",     addr:  79, mask: 0x0007, shift: 1 };
    pub const LD_TYPE:      Field = Field { name: "LD_TYPE",      addr: 110, mask: 0x0003, shift: 6 };
}

pub static LMX2820: RegisterMap = RegisterMap {
    len: N_REGS,
    width: REG_WIDTH,
    fields: &[
        fields::POWERDOWN,
        fields::RESET,
        fields::FCAL_EN,
        fields::CHDIV,
        fields::MASH_ORDER,
        fields::PLL_N,
        fields::PLL_DEN_MSB,
        fields::PLL_DEN_LSB,
        fields::PLL_NUM_MSB,
        fields::PLL_NUM_LSB,
        fields::OUTA_MUX,
        fields::OUTA_PD,
        fields::OUTA_PWR,
        fields::LD_TYPE,
    ],
};

// Static power-up configuration, written once after every power-on in this order.
// R0 has POWERDOWN and FCAL_EN cleared: the core must stay up and calibration
// only starts once dividers are programmed.
#[rustfmt::skip]
pub const STATIC_DEFAULTS: &[(u8, u16)] = &[
    (  0, 0x6460), // FCAL_HPFD_ADJ, FCAL_LPFD_ADJ, DBLR_CAL_EN
    (  1, 0x57A0), // PHASE_SYNC_EN off, LD_VTUNE_EN
    (  2, 0x81F4), // CAL_CLK_DIV
    ( 10, 0x0000), // OSC_2X off
    ( 11, 0x0612), // PLL_R_PRE = 1
    ( 50, 0x0080), // VCO bias
    ( 51, 0x203F), // VCO gain
    ( 71, 0x0000), // SYSREF off
    (110, 0x00C0), // digital lock detect
];

// Frequency-defining registers, in the order a plan is written.
pub const FREQUENCY_ORDER: &[u8] = &[35, 36, 42, 43, 38, 39, 32, 78];
// Written after lock, RF enable last.
pub const OUTPUT_ORDER: &[u8] = &[79, 78];

/// OUTA_MUX selector.
#[derive(Clone, Copy, Debug, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[cfg_attr(test, derive(Arbitrary))]
#[repr(u8)]
#[rustfmt::skip]
pub enum OutputPath {
    Divider = 0,
    Direct  = 1,
    Doubler = 2,
}

/// Sigma-delta modulator order; `Integer` disables the fractional engine.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, IntoPrimitive, TryFromPrimitive, Deserialize)]
#[cfg_attr(test, derive(Arbitrary))]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
#[rustfmt::skip]
pub enum MashOrder {
    #[default]
    Integer = 0,
    First   = 1,
    Second  = 2,
    Third   = 3,
}

#[cfg(test)]
proptest! {
    #[test]
    fn merge_leaves_other_bits(reg: u16, value: u16, shift in 0u8..16, width in 1u32..=16) {
        let mask = ((1u32 << width) - 1) as u16;
        let merged = merge(reg, mask, shift, value);
        let field = (u32::from(mask) << shift) as u16;
        assert_eq!(reg & !field, merged & !field);
        assert_eq!(value & mask & (field >> shift), (merged >> shift) & mask);
    }

    #[test]
    fn mux_inverse(path: OutputPath) {
        assert_eq!(path, OutputPath::try_from(u8::from(path)).unwrap());
    }
}

#[test]
fn fields_fit_register() {
    for f in LMX2820.fields {
        assert!(LMX2820.contains(usize::from(f.addr)), "{}", f.name);
        assert!(u32::from(f.mask) << f.shift <= LMX2820.max_value(), "{}", f.name);
    }
}

#[test]
fn fields_in_same_register_do_not_overlap() {
    for a in LMX2820.fields {
        for b in LMX2820.fields {
            if a.addr == b.addr && a.name != b.name {
                let fa = u32::from(a.mask) << a.shift;
                let fb = u32::from(b.mask) << b.shift;
                assert_eq!(0, fa & fb, "{} overlaps {}", a.name, b.name);
            }
        }
    }
}

#[test]
fn field_lookup_ignores_case() {
    assert_eq!(Some(&fields::PLL_N), LMX2820.field("pll_n"));
    assert_eq!(None, LMX2820.field("OUTB_MUX"));
}

#[test]
fn insert_masks_oversized_value() {
    assert_eq!(0x00C3, fields::OUTA_MUX.insert(0x00C0, 0xFF));
    assert_eq!(0x0040, fields::OUTA_PD.insert(0x0000, 1));
    assert_eq!(2, fields::OUTA_MUX.extract(0x0042));
}
