//! # DAQFlex RS
//!
//! A Rust library for continuous analog acquisition from Measurement Computing
//! DAQFlex USB devices (USB-1208-FS-Plus, USB-1608-FS-Plus, USB-7202, USB-7204,
//! USB-1608GX and friends).
//!
//! The device is driven through its ASCII message protocol over USB control
//! transfers, while a background thread keeps a double-buffered ring filled from
//! the bulk endpoint. The caller drains whichever half the producer has just left
//! and gets calibrated voltages back.
//!
//! ## Features
//!
//! - **Device discovery**: Uses `nusb` to find and claim DAQFlex devices by product id
//! - **Message protocol**: 64-byte request/response frames with typed errors
//! - **Scan configuration**: Builder for channels, rate, range and transfer mode, with
//!   ring sizing derived from the rate the device actually accepts
//! - **Calibration**: Per-channel slope and offset read from the device
//! - **Lock-free handoff**: One producer thread, one consumer, no mutex on the data path
//! - **DataFrame output**: Drained blocks convert to `polars` DataFrames
//! - **Simulation**: A simulated device for tests and demos without hardware
//!
//! ## Examples
//!
//! ### Continuous Scan
//!
//! ```rust,no_run
//! use daqflex_rs::{DaqProduct, DaqScanner, ScanConfig, VoltageRange};
//! use std::sync::atomic::AtomicBool;
//!
//! let scanner = DaqScanner::connect(DaqProduct::Usb1208FsPlus)?;
//! let config = ScanConfig::builder()
//!     .channels(0, 3)
//!     .rate(2048)
//!     .range(VoltageRange::Bip5V)
//!     .build()?;
//!
//! let mut scan = scanner.start_scan(config)?;
//! let stop = AtomicBool::new(false);
//! scan.run(&stop, |block| {
//!     println!("tick {}: {:?}", block.first_tick, block.tick(0));
//!     Ok::<_, std::io::Error>(())
//! })?;
//!
//! let (scanner, summary) = scan.stop()?;
//! println!("Lost {} samples", summary.lost_samples);
//! scanner.close();
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ### Without Hardware
//!
//! ```rust
//! use daqflex_rs::{DaqProduct, DaqScanner, DaqTerminal, ScanConfig, SimulatedDevice};
//!
//! let device = SimulatedDevice::new(DaqProduct::Usb1608FsPlus);
//! let scanner = DaqScanner::from_terminal(DaqTerminal::new(Box::new(device)), DaqProduct::Usb1608FsPlus);
//!
//! let scan = scanner.start_scan(ScanConfig::builder().channels(0, 1).build()?)?;
//! assert_eq!(scan.config().rate(), 2048);
//! let (scanner, summary) = scan.stop()?;
//! assert_eq!(summary.status, "IDLE");
//! scanner.close();
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ### Device Discovery
//!
//! ```rust,no_run
//! use daqflex_rs::DaqConnector;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! for device in DaqConnector::get_available_devices(None)? {
//!     println!("Found {} on bus {} address {}", device.name(), device.bus, device.address);
//! }
//! # Ok(())
//! # }
//! ```

pub mod acquisition;
pub mod calibration;
pub mod consumer;
pub mod daq_connector;
pub mod daq_scanner;
pub mod daq_terminal;
pub mod sample_ring;
pub mod scan_config;
pub mod simulated;
pub mod usb_transport;

// Re-export the main types for convenience
pub use scan_config::{ChannelMode, ScanConfig, ScanConfigBuilder, ScanConfigError, TransferMode, VoltageRange};

pub use daq_terminal::{DaqTerminal, DaqTerminalError};

pub use daq_connector::{DaqConnector, DaqConnectorError, DaqDevice, DaqProduct};

pub use daq_scanner::{DaqScanner, DaqScannerError, RunningScan, ScanSummary};

pub use calibration::{CalibrationEntry, CalibrationError, CalibrationStore};

pub use consumer::{CalibratedBlock, HalfBufferConsumer};

pub use acquisition::{AcquisitionState, CancellationToken};

pub use simulated::{Signal, SimulatedDevice};

pub use usb_transport::{TransferError, Transport};
