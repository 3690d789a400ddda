use anyhow::Result;
use clap::Parser;
use lmx2820::mock::Bench;
use lmx2820::plan::Mode;
use lmx2820::{Controller, Defaults, Device, Planner, PlannerConfig};

#[derive(Parser)]
///Steps a simulated LMX2820 through a list of frequencies and shows which registers change
struct Args {
    #[arg(long)]
    fractional: bool,
    #[arg(default_values_t = [1_000_000_000, 9_800_000_000, 11_000_000_000, 15_000_000_000, 24_000_000_000])]
    freqs: Vec<u64>,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let config = if args.fractional {
        PlannerConfig::fractional()
    } else {
        PlannerConfig::integer()
    };
    println!("{:?} mode, {} Hz reference", config.mode, config.reference_hz);
    let fractional = config.mode == Mode::Fractional;

    let bench = Bench::new();
    let device = Device::new(bench.transport(), bench.gpio(), bench.clock());
    let mut radio = Controller::new(device, Planner::new(config)?, Defaults::builtin());
    radio.power_on()?;

    for freq in args.freqs {
        let before = radio.device().registers().clone();
        match radio.set_frequency(freq) {
            Ok(()) => {
                let status = radio.status();
                println!("\n{}", status);
                if fractional {
                    if let Some(plan) = status.plan {
                        println!("synthesized: {} Hz", plan.output_hz());
                    }
                }
                for change in before.diff(radio.device().registers())? {
                    println!("  {}", change);
                }
            }
            Err(e) => {
                println!("\n{} Hz: {}", freq, e);
                radio.reset()?;
            }
        }
    }
    Ok(())
}
