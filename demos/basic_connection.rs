// Basic device discovery and connection example
//
// This example shows how to discover DAQFlex devices and exchange a few messages.

use daqflex_rs::{DaqConnector, DaqScanner};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    println!("DAQFlex Device Discovery Example");
    println!("================================\n");

    println!("1. Discovering attached DAQFlex devices...");
    let devices = DaqConnector::get_available_devices(None)?;

    if devices.is_empty() {
        println!("No DAQFlex devices found. Please connect a device and try again.");
        return Ok(());
    }

    println!("Found {} device(s):", devices.len());
    for (i, device) in devices.iter().enumerate() {
        println!(
            "  {}. {} on bus {} address {} (serial {})",
            i + 1,
            device.name(),
            device.bus,
            device.address,
            device.serial.as_deref().unwrap_or("unknown")
        );
    }
    println!();

    println!("2. Connecting to the first device...");
    let mut scanner = DaqScanner::connect(devices[0].product)?;
    println!("Successfully connected to {}", scanner.product());

    println!("\n3. Querying the device:");
    for command in ["?DEV:MFGSER", "?AI:RES", "?AISCAN:RATE", "?AISCAN:STATUS"] {
        match scanner.request(command) {
            Ok(reply) => println!("  {:<16} -> {}", command, reply),
            Err(e) => println!("  {:<16} failed: {}", command, e),
        }
    }

    scanner.close();
    println!("\n4. Connection test completed successfully!");

    Ok(())
}
