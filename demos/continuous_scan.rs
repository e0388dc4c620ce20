// Continuous scan example
//
// Streams calibrated voltages from a DAQFlex device, prints running statistics and
// optionally writes every drained block to a CSV file.

use clap::Parser;
use daqflex_rs::{
    CalibratedBlock, DaqProduct, DaqScanner, DaqTerminal, ScanConfig, Signal, SimulatedDevice,
    VoltageRange,
};
use polars::prelude::*;
use std::fs::File;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Parser)]
#[command(name = "continuous_scan")]
#[command(version = "1.0")]
#[command(about = "Continuous multi-channel acquisition from a DAQFlex device")]
#[command(long_about = "Scan a range of analog channels continuously, drain the ring half by half and report calibrated voltages. Use --simulate to try it without hardware.")]
struct Args {
    /// Product to connect to
    #[arg(short, long, default_value = "USB-1208-FS-PLUS")]
    product: DaqProduct,

    /// Scan rate per channel in Hz
    #[arg(short = 'f', long, default_value_t = 2048)]
    rate: u32,

    /// First channel
    #[arg(long, default_value_t = 0)]
    low: u8,

    /// Last channel
    #[arg(long, default_value_t = 3)]
    high: u8,

    /// Voltage range, e.g. BIP5V or BIP10V
    #[arg(short, long, default_value = "BIP5V")]
    range: VoltageRange,

    /// How long to scan
    #[arg(short, long, default_value_t = 5.0, help = "Scan duration in seconds")]
    seconds: f64,

    /// Write calibrated data to this CSV file
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Use a simulated device instead of real hardware
    #[arg(long)]
    simulate: bool,

    /// Enable verbose logging
    #[arg(short, long, help = "Show debug information and detailed logs")]
    verbose: bool,

    /// Display only statistics (no voltage values)
    #[arg(long, help = "Show only throughput statistics, not voltage readings")]
    stats_only: bool,
}

fn print_status(block: &CalibratedBlock, start: Instant, blocks: u64, ticks: u64, stats_only: bool) -> io::Result<()> {
    let elapsed = start.elapsed();
    let ticks_per_sec = ticks as f64 / elapsed.as_secs_f64();

    print!(
        "\r[{:>6.1}s] {} blocks | {} ticks | {:.0} ticks/s",
        elapsed.as_secs_f64(),
        blocks,
        ticks,
        ticks_per_sec
    );
    if !stats_only {
        if let Some(first) = block.tick(0) {
            print!(" | tick {}: [", block.first_tick);
            for (i, volts) in first.iter().enumerate() {
                if i > 0 {
                    print!(", ");
                }
                print!("{:.3}V", volts);
            }
            print!("]");
        }
    }
    if block.possibly_torn {
        print!(" (torn)");
    }
    io::stdout().flush()
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

    let config = ScanConfig::builder()
        .channels(args.low, args.high)
        .rate(args.rate)
        .range(args.range)
        .build()?;

    println!("DAQFlex Continuous Scan");
    println!("=======================");
    println!("Device: {}{}", args.product, if args.simulate { " (simulated)" } else { "" });
    println!("Channels: {}..={}", args.low, args.high);
    println!("Rate: {} Hz", args.rate);
    println!("Range: {}", args.range);
    println!("Duration: {}s\n", args.seconds);

    let scanner = if args.simulate {
        let device = SimulatedDevice::new(args.product)
            .with_signal(Signal::Sine { hz: 5.0 })
            .paced(true);
        DaqScanner::from_terminal(DaqTerminal::new(Box::new(device)), args.product)
    } else {
        DaqScanner::connect(args.product)?
    };

    let mut scan = scanner.start_scan(config)?;
    let rate = scan.config().rate();
    println!(
        "✓ Scanning at {} Hz, {} samples per half, reading every {:?}\n",
        rate,
        scan.config().half_len(),
        scan.config().read_delay()
    );

    let stop = Arc::new(AtomicBool::new(false));
    let timer_stop = Arc::clone(&stop);
    let duration = Duration::from_secs_f64(args.seconds.max(0.0));
    std::thread::spawn(move || {
        std::thread::sleep(duration);
        timer_stop.store(true, Ordering::Release);
    });

    let mut output = args.output.as_ref().map(File::create).transpose()?;
    let start = Instant::now();
    let mut blocks = 0u64;
    let mut ticks = 0u64;

    scan.run(&stop, |block| -> Result<(), Box<dyn std::error::Error>> {
        blocks += 1;
        ticks += block.ticks() as u64;
        print_status(&block, start, blocks, ticks, args.stats_only)?;

        if let Some(file) = output.as_mut() {
            let mut df = block.to_dataframe(rate)?;
            CsvWriter::new(file)
                .include_header(blocks == 1)
                .finish(&mut df)?;
        }
        Ok(())
    })?;
    println!();

    let (scanner, summary) = scan.stop()?;
    println!("\nScan finished, device reports {}", summary.status);
    println!("  Bulk reads: {}", summary.report.iterations);
    println!("  Bytes received: {}", summary.report.bytes_received);
    println!("  Timeouts: {}", summary.report.timeouts);
    println!("  Transfer errors: {}", summary.report.transfer_errors);
    println!("  Lost samples: {}", summary.lost_samples);
    if let Some(path) = &args.output {
        println!("  Data written to {}", path.display());
    }

    scanner.close();
    Ok(())
}
