//! Driver for the TI LMX2820 wideband synthesizer on a Linux SPI/GPIO board.
//!
//! [`plan::Planner`] turns a frequency into a [`SynthesisPlan`],
//! [`Device`] programs it (register ordering, calibration, debounced lock,
//! RF enable last) and [`Controller`] gates it all behind a fail-safe state
//! machine.

pub mod config;
pub mod controller;
pub mod defaults;
pub mod device;
pub mod gpio;
pub mod hal;
pub mod image;
pub mod mock;
pub mod plan;
pub mod registers;
pub mod spi;

pub use controller::{Controller, State, Status};
pub use defaults::Defaults;
pub use device::Device;
pub use image::RegisterImage;
pub use plan::{compute_plan, Planner, PlannerConfig, SynthesisPlan};
