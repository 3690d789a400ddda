// Bring up the LMX2820, optionally tune it, and print where it ended up
use anyhow::{bail, Context, Result};
use clap::Parser;
use lmx2820::config::Config;
use lmx2820::hal::{Clock, Gpio, SystemClock, Transport};
use lmx2820::{gpio::Pins, mock::Bench, registers::LMX2820, spi::Spi};
use lmx2820::{Controller, Defaults, Device, Planner};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

fn parse_frequency(s: &str) -> std::result::Result<u64, String> {
    let s: String = s.chars().filter(|&c| c != '_').collect();
    let (mantissa, exp) = match s.split_once(|c: char| c == 'e' || c == 'E') {
        Some((m, e)) => (m, e.parse::<u32>().map_err(|_| format!("bad exponent in `{}`", s))?),
        None => (s.as_str(), 0),
    };
    let (int, frac) = mantissa.split_once('.').unwrap_or((mantissa, ""));
    let frac = frac.trim_end_matches('0');
    let shift = exp
        .checked_sub(frac.len() as u32)
        .ok_or_else(|| format!("`{}` is not a whole number of Hz", s))?;
    let digits: u64 = format!("{}{}", int, frac)
        .parse()
        .map_err(|_| format!("`{}` is not a frequency", s))?;
    10u64
        .checked_pow(shift)
        .and_then(|p| digits.checked_mul(p))
        .ok_or_else(|| format!("`{}` is out of range", s))
}

#[derive(Parser, Debug)]
/// Control an LMX2820 synthesizer
struct Args {
    /// Board configuration (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Simulated hardware instead of spidev/gpiochip
    #[arg(long)]
    mock: bool,
    /// Register image written after power-on
    #[arg(long)]
    defaults: Option<PathBuf>,
    /// Output frequency in Hz, e.g. 15e9
    #[arg(short, long, value_parser = parse_frequency)]
    freq: Option<u64>,
    /// Turn RF off after everything else
    #[arg(long)]
    disable: bool,
    /// Power cycle before tuning
    #[arg(long)]
    reset: bool,
    /// Print the frequency plan and exit without touching hardware
    #[arg(long)]
    plan_only: bool,
    #[arg(short, long)]
    verbose: bool,
}

fn run<T: Transport, G: Gpio, C: Clock>(
    mut controller: Controller<T, G, C>,
    args: &Args,
) -> Result<()> {
    let result = (|| -> Result<()> {
        controller.power_on().context("power on")?;
        if args.reset {
            controller.reset().context("reset")?;
        }
        if let Some(freq) = args.freq {
            controller
                .set_frequency(freq)
                .with_context(|| format!("tuning to {} Hz", freq))?;
        }
        if args.disable {
            controller.disable_rf().context("RF disable")?;
        }
        Ok(())
    })();
    println!("{}", controller.status());
    result
}

fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with_writer(std::io::stderr)
        .init();

    let config = match &args.config {
        Some(path) => {
            Config::load(path).with_context(|| format!("loading {}", path.display()))?
        }
        None => Config::default(),
    };
    let planner = Planner::new(config.planner.clone()).context("planner configuration")?;

    if args.plan_only {
        let Some(freq) = args.freq else {
            bail!("--plan-only needs --freq");
        };
        let plan = planner.compute_plan(freq)?;
        println!("{:#?}", plan);
        println!("output: {} Hz", plan.output_hz());
        return Ok(());
    }

    let defaults = match args.defaults.as_ref().or(config.defaults.as_ref()) {
        Some(path) => Defaults::load(path, &LMX2820)
            .with_context(|| format!("loading register image {}", path.display()))?,
        None => Defaults::builtin(),
    };

    if args.mock {
        let bench = Bench::new();
        let device = Device::new(bench.transport(), bench.gpio(), bench.clock())
            .with_lock((&config.lock).into())
            .with_calibration((&config.calibration).into());
        let result = run(Controller::new(device, planner, defaults), &args);
        println!("{} register writes", bench.writes().len());
        result
    } else {
        let spi = Spi::open(&config.spi.path, config.spi.speed_hz)
            .with_context(|| format!("opening {}", config.spi.path.display()))?;
        let pins = Pins::new(&config.gpio)
            .with_context(|| format!("requesting lines on {}", config.gpio.chip.display()))?;
        let device = Device::new(spi, pins, SystemClock::new())
            .with_lock((&config.lock).into())
            .with_calibration((&config.calibration).into());
        run(Controller::new(device, planner, defaults), &args)
    }
}

#[test]
fn frequency_notation() {
    assert_eq!(Ok(15_000_000_000), parse_frequency("15e9"));
    assert_eq!(Ok(2_400_000_000), parse_frequency("2.4e9"));
    assert_eq!(Ok(15_000_000_000), parse_frequency("15_000_000_000"));
    assert_eq!(Ok(1_000_000_000), parse_frequency("1000000000"));
    assert!(parse_frequency("1.5").is_err());
    assert!(parse_frequency("1e30").is_err());
    assert!(parse_frequency("ten").is_err());
}
