/* Default register image
 *
 * Registers written once after every power-on, before any frequency is
 * programmed. Either the built-in static configuration or a text dump:
 *
 *   # comment
 *   R0 0x6460
 *   R36 0x0050
 *
 * TICS Pro exports (`R36 0x240050`, address in the top byte) are accepted as
 * long as the embedded address matches the register name.
 * */
use std::{collections::BTreeMap, fs, path::Path};
use thiserror::Error;

use crate::registers::{RegisterMap, STATIC_DEFAULTS};

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("Failed to read register image")]
    Io(#[from] std::io::Error),
    #[error("line {0}: expected `R<n> 0x<value>`")]
    Format(usize),
    #[error("line {0}: `{1}` is not a register name")]
    RegisterName(usize, String),
    #[error("line {0}: `{1}` is not a register number")]
    RegisterNumber(usize, String),
    #[error("line {0}: register R{1} out of range")]
    OutOfRange(usize, usize),
    #[error("line {0}: `{1}` is not a hex value")]
    HexValue(usize, String),
    #[error("line {0}: value {1:#x} too wide for R{2}")]
    ValueTooWide(usize, u32, usize),
}

type Result<T> = std::result::Result<T, LoadError>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Defaults {
    regs: BTreeMap<u8, u16>,
}

impl Defaults {
    pub fn builtin() -> Self {
        Self {
            regs: STATIC_DEFAULTS.iter().copied().collect(),
        }
    }

    pub fn parse(text: &str, map: &RegisterMap) -> Result<Self> {
        let mut regs = BTreeMap::new();
        for (i, line) in text.lines().enumerate() {
            let line_no = i + 1;
            let line = match line.split_once('#') {
                Some((content, _)) => content,
                None => line,
            }
            .trim();
            if line.is_empty() {
                continue;
            }

            let mut parts = line.split_whitespace();
            let (Some(name), Some(value), None) = (parts.next(), parts.next(), parts.next()) else {
                return Err(LoadError::Format(line_no));
            };

            let number = name
                .strip_prefix('R')
                .or_else(|| name.strip_prefix('r'))
                .ok_or_else(|| LoadError::RegisterName(line_no, name.to_string()))?;
            let addr: usize = number
                .parse()
                .map_err(|_| LoadError::RegisterNumber(line_no, name.to_string()))?;
            if !map.contains(addr) {
                return Err(LoadError::OutOfRange(line_no, addr));
            }

            let digits = value
                .strip_prefix("0x")
                .or_else(|| value.strip_prefix("0X"))
                .unwrap_or(value);
            let mut value = u32::from_str_radix(digits, 16)
                .map_err(|_| LoadError::HexValue(line_no, value.to_string()))?;
            if value > map.max_value() && (value >> map.width) as usize == addr {
                value &= map.max_value();
            }
            if value > map.max_value() {
                return Err(LoadError::ValueTooWide(line_no, value, addr));
            }

            // addr < map.len and value <= max_value, both checked above
            regs.insert(addr as u8, value as u16);
        }
        Ok(Self { regs })
    }

    pub fn load<P: AsRef<Path>>(path: P, map: &RegisterMap) -> Result<Self> {
        Self::parse(&fs::read_to_string(path)?, map)
    }

    pub fn len(&self) -> usize {
        self.regs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regs.is_empty()
    }

    pub fn get(&self, addr: u8) -> Option<u16> {
        self.regs.get(&addr).copied()
    }

    /// Ascending address order.
    pub fn iter(&self) -> impl Iterator<Item = (u8, u16)> + '_ {
        self.regs.iter().map(|(&a, &v)| (a, v))
    }
}

impl Default for Defaults {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registers::LMX2820;

    #[test]
    fn parses_dump() {
        let text = "\
# LMX2820 power-up image
R0 0x6460
R36   0x0050   # N = 80

r110 00C0
R11 0x0612
";
        let d = Defaults::parse(text, &LMX2820).unwrap();
        assert_eq!(
            vec![(0, 0x6460), (11, 0x0612), (36, 0x0050), (110, 0x00C0)],
            d.iter().collect::<Vec<_>>()
        );
    }

    #[test]
    fn accepts_tics_composite() {
        let d = Defaults::parse("R36 0x240050\nR122 0x7A0001", &LMX2820).unwrap();
        assert_eq!(Some(0x0050), d.get(36));
        assert_eq!(Some(0x0001), d.get(122));
    }

    #[test]
    fn errors_carry_line_numbers() {
        let cases = [
            ("R0 0x1\nR1", 2),
            ("\n\nX3 0x1", 3),
            ("R0 0x1\nRx 0x2", 2),
            ("R123 0x0", 1),
            ("R1 0xZZ", 1),
            ("R1 0x1\n\nR36 0x250050", 3),
            ("R1 0x1 0x2", 1),
        ];
        for (text, line) in cases {
            let err = Defaults::parse(text, &LMX2820).unwrap_err();
            assert!(
                err.to_string().starts_with(&format!("line {}:", line)),
                "{:?} -> {}",
                text,
                err
            );
        }
    }

    #[test]
    fn builtin_matches_static_table() {
        let d = Defaults::builtin();
        assert_eq!(STATIC_DEFAULTS.len(), d.len());
        assert_eq!(Some(0x6460), d.get(0));
        assert_eq!(None, d.get(36));
    }
}
