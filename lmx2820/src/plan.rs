/*
 * Frequency planning
 *
 * Turns a requested output frequency into a synthesis plan: band and output
 * path, VCO frequency, channel divider, integer divider N and (in fractional
 * mode) NUM/DEN. Pure computation, no hardware access.
 *
 *   band             output path       VCO
 *   ---------------  ----------------  -----------------
 *   Divider          CHDIV             f * chdiv
 *   Direct           VCO               f
 *   Doubler          internal x2       f / 2
 *   ExternalDoubler  internal x2, +x2  f / 4
 */
use log::info;
use serde::Deserialize;
use thiserror::Error;

use crate::hal::BandSwitch;
use crate::registers::{MashOrder, OutputPath};
#[cfg(test)] use proptest_derive::Arbitrary;

pub type Hz = u64;

const GHZ: Hz = 1_000_000_000;
const MHZ: Hz = 1_000_000;

fn div_nearest(dividend: u128, divisor: u128) -> u128 {
    (dividend + (divisor >> 1)) / divisor
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlanError {
    #[error("{0} Hz is outside the {1}..={2} Hz operating range")]
    InvalidFrequency(Hz, Hz, Hz),
    #[error("{0} Hz is not a multiple of the {1} Hz integer-N step")]
    UnalignedStep(Hz, Hz),
    #[error("No channel divider puts {0} Hz inside the VCO range")]
    NoValidDivider(Hz),
    #[error("VCO frequency {0} Hz outside {1}..={2} Hz")]
    VcoOutOfRange(Hz, Hz, Hz),
    #[error("PLL N {0} outside {1}..={2}")]
    DividerOutOfRange(u64, u32, u32),
    #[error("VCO {vco_hz} Hz is not an integer multiple of the {reference_hz} Hz reference")]
    NonIntegerDivision { vco_hz: Hz, reference_hz: Hz },
    #[error("Invalid planner configuration: {0}")]
    InvalidConfig(&'static str),
}

type Result<T> = std::result::Result<T, PlanError>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(test, derive(Arbitrary))]
pub enum Band {
    Divider,
    Direct,
    Doubler,
    ExternalDoubler,
}

#[rustfmt::skip]
impl Band {
    pub fn path(self) -> OutputPath {
        match self {
            Band::Divider         => OutputPath::Divider,
            Band::Direct          => OutputPath::Direct,
            Band::Doubler         => OutputPath::Doubler,
            Band::ExternalDoubler => OutputPath::Doubler,
        }
    }

    pub fn switch(self) -> BandSwitch {
        match self {
            Band::Divider         => BandSwitch::P0,
            Band::Direct          => BandSwitch::P1,
            Band::Doubler         => BandSwitch::P2,
            Band::ExternalDoubler => BandSwitch::P3,
        }
    }

    /// Output frequency per VCO Hz, ahead of the channel divider.
    pub fn multiplier(self) -> u64 {
        match self {
            Band::Divider | Band::Direct => 1,
            Band::Doubler                => 2,
            Band::ExternalDoubler        => 4,
        }
    }
}

/// Post-VCO divider, a power of two from 1 to 128.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChannelDivider(u8);

impl ChannelDivider {
    pub fn new(ratio: u8) -> Option<Self> {
        ratio.is_power_of_two().then_some(Self(ratio))
    }

    pub fn ratio(self) -> u8 {
        self.0
    }

    /// CHDIV field encoding, log2 of the ratio.
    pub fn code(self) -> u16 {
        self.0.trailing_zeros() as u16
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Fraction {
    pub num: u32,
    pub den: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Integer,
    Fractional,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SynthesisPlan {
    pub freq_hz: Hz,
    pub reference_hz: Hz,
    pub band: Band,
    pub vco_hz: Hz,
    pub path: OutputPath,
    pub chdiv: Option<ChannelDivider>,
    pub n: u32,
    pub fraction: Option<Fraction>,
    pub mash: MashOrder,
    pub external_doubler: bool,
    pub power: u8,
}

impl SynthesisPlan {
    pub fn is_fractional(&self) -> bool {
        self.fraction.is_some()
    }

    /// Output frequency this plan actually synthesizes, rounded to the nearest Hz.
    pub fn output_hz(&self) -> Hz {
        let Fraction { num, den } = self.fraction.unwrap_or(Fraction { num: 0, den: 1 });
        let div = u128::from(self.chdiv.map_or(1, ChannelDivider::ratio));
        let n = u128::from(self.n) * u128::from(den) + u128::from(num);
        let out = u128::from(self.reference_hz) * n * u128::from(self.band.multiplier());
        div_nearest(out, u128::from(den) * div) as Hz
    }

    /// Internal consistency check, independent of how the plan was built.
    pub fn validate(&self) -> std::result::Result<(), &'static str> {
        if self.external_doubler != (self.band == Band::ExternalDoubler) {
            return Err("external doubler flag does not match band");
        }
        if self.path != self.band.path() {
            return Err("output path does not match band");
        }
        if self.chdiv.is_some() != (self.path == OutputPath::Divider) {
            return Err("channel divider is only valid on the divider path");
        }
        if let Some(Fraction { num, den }) = self.fraction {
            if num == 0 || num >= den {
                return Err("fractional numerator outside 1..denominator");
            }
            if self.mash == MashOrder::Integer {
                return Err("fractional numerator with integer-N modulator");
            }
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PlannerConfig {
    pub reference_hz: Hz,
    pub step_hz: Hz,
    pub min_hz: Hz,
    pub max_hz: Hz,
    pub vco_min_hz: Hz,
    pub vco_max_hz: Hz,
    /// Top of the channel-divider band.
    pub divider_max_hz: Hz,
    /// Tried in ascending order, first fit wins.
    pub dividers: Vec<u8>,
    pub n_min: u32,
    pub n_max: u32,
    pub mode: Mode,
    pub denominator: u32,
    pub mash: MashOrder,
    pub power: u8,
}

impl PlannerConfig {
    /// 100 MHz reference, 100 MHz integer-N raster.
    pub fn integer() -> Self {
        Self {
            reference_hz: 100 * MHZ,
            step_hz: 100 * MHZ,
            min_hz: GHZ,
            max_hz: 40 * GHZ,
            vco_min_hz: 5_650 * MHZ,
            vco_max_hz: 11_300 * MHZ,
            divider_max_hz: 10 * GHZ,
            dividers: vec![1, 2, 4, 8, 16],
            n_min: 12,
            n_max: 32767,
            mode: Mode::Integer,
            denominator: 1,
            mash: MashOrder::Integer,
            power: 7,
        }
    }

    /// 200 MHz reference, 24-bit fractional resolution.
    pub fn fractional() -> Self {
        Self {
            reference_hz: 200 * MHZ,
            dividers: vec![1, 2, 4, 8, 16, 32, 64, 128],
            mode: Mode::Fractional,
            denominator: 1 << 24,
            mash: MashOrder::Second,
            ..Self::integer()
        }
    }
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self::integer()
    }
}

#[derive(Clone, Debug)]
pub struct Planner {
    config: PlannerConfig,
    dividers: Vec<ChannelDivider>,
}

impl Planner {
    pub fn new(config: PlannerConfig) -> Result<Self> {
        if config.reference_hz == 0 {
            return Err(PlanError::InvalidConfig("reference frequency is zero"));
        }
        if config.mode == Mode::Integer && config.step_hz == 0 {
            return Err(PlanError::InvalidConfig("integer-N step is zero"));
        }
        if config.vco_min_hz > config.vco_max_hz || config.min_hz > config.max_hz {
            return Err(PlanError::InvalidConfig("empty frequency range"));
        }
        if config.mode == Mode::Fractional {
            if config.denominator < 2 {
                return Err(PlanError::InvalidConfig("fractional denominator below 2"));
            }
            if config.mash == MashOrder::Integer {
                return Err(PlanError::InvalidConfig("fractional mode needs a MASH order"));
            }
        }
        if config.power > 7 {
            return Err(PlanError::InvalidConfig("output power above 7"));
        }
        let mut dividers = config
            .dividers
            .iter()
            .map(|&r| ChannelDivider::new(r))
            .collect::<Option<Vec<_>>>()
            .ok_or(PlanError::InvalidConfig("channel dividers must be powers of two"))?;
        dividers.sort_by_key(|d| d.ratio());
        dividers.dedup();
        Ok(Self { config, dividers })
    }

    pub fn config(&self) -> &PlannerConfig {
        &self.config
    }

    fn vco_in_range(&self, vco_num: u64, vco_den: u64) -> bool {
        let c = &self.config;
        u128::from(vco_num) >= u128::from(c.vco_min_hz) * u128::from(vco_den)
            && u128::from(vco_num) <= u128::from(c.vco_max_hz) * u128::from(vco_den)
    }

    pub fn compute_plan(&self, freq_hz: Hz) -> Result<SynthesisPlan> {
        let c = &self.config;
        if freq_hz < c.min_hz || freq_hz > c.max_hz {
            return Err(PlanError::InvalidFrequency(freq_hz, c.min_hz, c.max_hz));
        }
        if c.mode == Mode::Integer && freq_hz % c.step_hz != 0 {
            return Err(PlanError::UnalignedStep(freq_hz, c.step_hz));
        }

        // VCO frequency as the exact ratio vco_num / vco_den
        let (band, chdiv, vco_num, vco_den) = if freq_hz <= c.divider_max_hz {
            // A product past u64 is past any VCO window too
            let (div, vco_hz) = self
                .dividers
                .iter()
                .find_map(|&d| {
                    freq_hz
                        .checked_mul(u64::from(d.ratio()))
                        .filter(|&vco| self.vco_in_range(vco, 1))
                        .map(|vco| (d, vco))
                })
                .ok_or(PlanError::NoValidDivider(freq_hz))?;
            (Band::Divider, Some(div), vco_hz, 1)
        } else if freq_hz <= c.vco_max_hz {
            (Band::Direct, None, freq_hz, 1)
        } else if freq_hz <= c.vco_max_hz.saturating_mul(2) {
            (Band::Doubler, None, freq_hz, 2)
        } else {
            (Band::ExternalDoubler, None, freq_hz, 4)
        };

        let vco_hz = vco_num / vco_den;
        if !self.vco_in_range(vco_num, vco_den) {
            return Err(PlanError::VcoOutOfRange(vco_hz, c.vco_min_hz, c.vco_max_hz));
        }

        let divisor = u128::from(vco_den) * u128::from(c.reference_hz);
        let mut n = u128::from(vco_num) / divisor;
        let remainder = u128::from(vco_num) % divisor;
        let fraction = match c.mode {
            Mode::Integer if remainder != 0 => {
                return Err(PlanError::NonIntegerDivision {
                    vco_hz,
                    reference_hz: c.reference_hz,
                });
            }
            Mode::Integer => None,
            Mode::Fractional => {
                let den = u128::from(c.denominator);
                let mut num = div_nearest(remainder * den, divisor);
                if num == den {
                    n += 1;
                    num = 0;
                }
                // num < den here, so it fits the denominator's width
                (num != 0).then_some(Fraction {
                    num: num as u32,
                    den: c.denominator,
                })
            }
        };

        let n = u32::try_from(n)
            .ok()
            .filter(|n| (c.n_min..=c.n_max).contains(n))
            .ok_or(PlanError::DividerOutOfRange(
                u64::try_from(n).unwrap_or(u64::MAX),
                c.n_min,
                c.n_max,
            ))?;

        let plan = SynthesisPlan {
            freq_hz,
            reference_hz: c.reference_hz,
            band,
            vco_hz,
            path: band.path(),
            chdiv,
            n,
            fraction,
            mash: if fraction.is_some() {
                c.mash
            } else {
                MashOrder::Integer
            },
            external_doubler: band == Band::ExternalDoubler,
            power: c.power,
        };
        info!(
            "plan {} Hz: {:?} VCO {} Hz N {} {:?} CHDIV {:?}",
            freq_hz,
            band,
            vco_hz,
            n,
            fraction,
            chdiv.map(ChannelDivider::ratio)
        );
        Ok(plan)
    }
}

/// Plan with the default integer-N configuration.
pub fn compute_plan(freq_hz: Hz) -> Result<SynthesisPlan> {
    Planner::new(PlannerConfig::default())?.compute_plan(freq_hz)
}
