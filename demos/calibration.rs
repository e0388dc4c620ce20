// Calibration readout example
//
// Reads the per-channel slope and offset a DAQFlex device stores for a voltage range
// and shows what they do to a few raw codes.

use clap::Parser;
use daqflex_rs::calibration::scale_and_calibrate;
use daqflex_rs::{DaqProduct, DaqScanner, DaqTerminal, SimulatedDevice, VoltageRange};

#[derive(Parser)]
#[command(name = "calibration")]
#[command(version = "1.0")]
#[command(about = "Show the calibration a DAQFlex device reports")]
struct Args {
    /// Product to connect to
    #[arg(short, long, default_value = "USB-1208-FS-PLUS")]
    product: DaqProduct,

    /// First channel
    #[arg(long, default_value_t = 0)]
    low: u8,

    /// Last channel
    #[arg(long, default_value_t = 3)]
    high: u8,

    /// Voltage range, e.g. BIP5V or BIP10V
    #[arg(short, long, default_value = "BIP5V")]
    range: VoltageRange,

    /// Use a simulated device instead of real hardware
    #[arg(long)]
    simulate: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    if args.verbose {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Debug)
            .init();
    } else {
        env_logger::init();
    }

    println!("DAQFlex Calibration Example");
    println!("===========================\n");

    let mut scanner = if args.simulate {
        let device = SimulatedDevice::new(args.product)
            .with_calibration(args.low, 1.0021, -2.5)
            .with_calibration(args.high, 0.9987, 1.75);
        DaqScanner::from_terminal(DaqTerminal::new(Box::new(device)), args.product)
    } else {
        DaqScanner::connect(args.product)?
    };
    println!("Connected to {}\n", scanner.product());

    let store = scanner.fetch_calibration(args.low, args.high, args.range)?;
    println!("Calibration for {}:", store.range());
    println!("  {:>7} {:>12} {:>12}", "channel", "slope", "offset");
    for entry in store.entries() {
        println!("  {:>7} {:>12.6} {:>12.4}", entry.channel, entry.scale, entry.offset);
    }

    let max_counts = scanner
        .max_counts()
        .unwrap_or_else(|| u32::from(u16::MAX));
    let quarter = (max_counts / 4) as u16;
    let min = args.range.min_voltage();
    let max = args.range.max_voltage();

    println!("\nRaw code to volts (max counts {}):", max_counts);
    for entry in store.entries() {
        let readings: Vec<String> = [0, quarter, 2 * quarter, 3 * quarter, max_counts as u16]
            .iter()
            .map(|&raw| {
                let volts = scale_and_calibrate(raw, min, max, entry.scale, entry.offset, max_counts);
                format!("{raw}={volts:.4}V")
            })
            .collect();
        println!("  ch{}: {}", entry.channel, readings.join("  "));
    }

    scanner.close();
    Ok(())
}
