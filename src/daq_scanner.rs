use crate::acquisition::{
    AcquisitionError, AcquisitionLoop, AcquisitionReport, AcquisitionSettings, AcquisitionState,
    CancellationToken,
};
use crate::calibration::{CalibrationError, CalibrationStore, VoltageScale};
use crate::consumer::{CalibratedBlock, HalfBufferConsumer};
use crate::daq_connector::{DaqConnector, DaqConnectorError, DaqProduct};
use crate::daq_terminal::{reply_value, DaqTerminal, DaqTerminalError};
use crate::sample_ring::SampleRing;
use crate::scan_config::{ScanConfig, ScanConfigError, VoltageRange};
use std::sync::atomic::{AtomicBool, Ordering};

const REJECTED_REPLY: &str = "NAK";

#[derive(Debug, thiserror::Error)]
pub enum DaqScannerError {
    #[error("Connecting failed: {0}")]
    Connect(#[from] DaqConnectorError),

    #[error("Configuring the scan failed: {0}")]
    Configure(#[source] DaqTerminalError),

    #[error("Device rejected '{command}'")]
    Rejected { command: String },

    #[error("Could not make sense of reply '{reply}' to '{command}'")]
    Negotiation { command: String, reply: String },

    #[error("Reading calibration failed: {0}")]
    Calibration(#[from] CalibrationError),

    #[error("Invalid scan buffer: {0}")]
    BufferConfig(#[from] ScanConfigError),

    #[error("Acquisition failed: {0}")]
    Acquisition(#[from] AcquisitionError),

    #[error("Streaming stopped: {0}")]
    Streaming(#[source] DaqTerminalError),
}

/// An opened DAQFlex device that is not scanning.
#[derive(Debug)]
pub struct DaqScanner {
    terminal: DaqTerminal,
    product: DaqProduct,
    max_counts: Option<u32>,
}

impl DaqScanner {
    /// Connect to the first attached `product`.
    pub fn connect(product: DaqProduct) -> Result<Self, DaqScannerError> {
        let terminal = DaqConnector::connect(product)?;
        Ok(Self::from_terminal(terminal, product))
    }

    /// Wrap an already opened terminal, e.g. one over a simulated device.
    pub fn from_terminal(terminal: DaqTerminal, product: DaqProduct) -> Self {
        Self {
            terminal,
            max_counts: product.max_counts(),
            product,
        }
    }

    pub fn product(&self) -> DaqProduct {
        self.product
    }

    /// Full-scale raw code. Known up front for some models, otherwise after the first scan.
    pub fn max_counts(&self) -> Option<u32> {
        self.max_counts
    }

    /// Send a raw message and return the reply.
    pub fn request(&mut self, command: &str) -> Result<String, DaqTerminalError> {
        self.terminal.request(command)
    }

    /// Select `range` and read the calibration of `low..=high` without starting a scan.
    pub fn fetch_calibration(
        &mut self,
        low: u8,
        high: u8,
        range: VoltageRange,
    ) -> Result<CalibrationStore, DaqScannerError> {
        self.send(&format!("AISCAN:RANGE={}", range.as_str()))?;
        Ok(CalibrationStore::fetch(&mut self.terminal, low, high, range)?)
    }

    fn send(&mut self, command: &str) -> Result<String, DaqScannerError> {
        let reply = self
            .terminal
            .request(command)
            .map_err(DaqScannerError::Configure)?;
        if reply == REJECTED_REPLY {
            return Err(DaqScannerError::Rejected {
                command: command.to_string(),
            });
        }
        Ok(reply)
    }

    fn query<T: std::str::FromStr>(&mut self, command: &str) -> Result<T, DaqScannerError> {
        let reply = self.send(command)?;
        reply_value(command, &reply)
            .and_then(|value| value.parse().ok())
            .ok_or_else(|| DaqScannerError::Negotiation {
                command: command.to_string(),
                reply,
            })
    }

    fn resolve_max_counts(&mut self) -> Result<u32, DaqScannerError> {
        if let Some(max_counts) = self.product.max_counts() {
            let reply = self.send("?AI:RES")?;
            log::debug!("{} resolution: {}", self.product, reply);
            return Ok(max_counts);
        }
        let bits: u32 = self.query("?AI:RES")?;
        log::debug!("{} resolution: {} bits", self.product, bits);
        if !(1..=24).contains(&bits) {
            return Err(DaqScannerError::Negotiation {
                command: "?AI:RES".to_string(),
                reply: format!("AI:RES={bits}"),
            });
        }
        Ok((1 << bits) - 1)
    }

    /// Sends the setup commands and returns the scan as the device accepted it.
    fn configure(&mut self, config: &ScanConfig) -> Result<ScanConfig, DaqScannerError> {
        if config.high_channel() >= self.product.channels() {
            return Err(ScanConfigError::InvalidChannelRange {
                low: config.low_channel(),
                high: config.high_channel(),
            }
            .into());
        }

        let flushed = self.terminal.flush_stale();
        if flushed > 0 {
            log::info!("Discarded {} stale bytes", flushed);
        }
        self.send("AISCAN:STOP")?;
        self.max_counts = Some(self.resolve_max_counts()?);

        for command in config.commands() {
            self.send(&command)?;
        }

        let rate: f64 = self.query("?AISCAN:RATE")?;
        let rate = rate.round() as u32;
        if rate != config.rate() {
            log::info!("Requested {} Hz, device runs at {} Hz", config.rate(), rate);
        }
        let packet_size = self.terminal.bulk_packet_size();
        if packet_size != config.packet_size() {
            log::debug!("Sizing reads for {}-byte packets", packet_size);
        }
        let config = config.with_rate(rate)?.with_packet_size(packet_size)?;

        self.send("AISCAN:SAMPLES=0")?;
        Ok(config)
    }

    /// Configure the device, read its calibration and start streaming on a background thread.
    pub fn start_scan(mut self, config: ScanConfig) -> Result<RunningScan, DaqScannerError> {
        let config = self.configure(&config)?;
        let max_counts = self.max_counts.unwrap_or(u32::from(u16::MAX));

        let calibration = CalibrationStore::fetch(
            &mut self.terminal,
            config.low_channel(),
            config.high_channel(),
            config.range(),
        )?;
        let entries =
            calibration.for_scan(config.range(), config.low_channel(), config.high_channel())?;

        let (writer, reader) = SampleRing::split(config.num_points())?;
        let consumer =
            HalfBufferConsumer::new(reader, entries, VoltageScale::new(config.range(), max_counts))?;
        log::info!(
            "Scanning channels {}..={} at {} Hz, {} samples per half",
            config.low_channel(),
            config.high_channel(),
            config.rate(),
            config.half_len()
        );
        self.send("AISCAN:START")?;

        let acquisition = AcquisitionLoop::start(
            self.terminal,
            writer,
            AcquisitionSettings::from(&config),
            CancellationToken::new(),
        )?;
        Ok(RunningScan {
            acquisition,
            consumer,
            config,
            calibration,
            product: self.product,
            max_counts,
        })
    }

    pub fn close(self) {
        self.terminal.close();
    }
}

/// Totals of a finished scan.
#[derive(Debug)]
pub struct ScanSummary {
    pub config: ScanConfig,
    pub report: AcquisitionReport,
    pub lost_samples: u64,
    /// Value of `?AISCAN:STATUS` after stopping, e.g. `IDLE`.
    pub status: String,
}

/// A scan in progress. Drain it with [`RunningScan::run`] or [`RunningScan::poll`].
#[derive(Debug)]
pub struct RunningScan {
    acquisition: AcquisitionLoop,
    consumer: HalfBufferConsumer,
    config: ScanConfig,
    calibration: CalibrationStore,
    product: DaqProduct,
    max_counts: u32,
}

impl RunningScan {
    /// The scan as negotiated with the device.
    pub fn config(&self) -> &ScanConfig {
        &self.config
    }

    pub fn calibration(&self) -> &CalibrationStore {
        &self.calibration
    }

    pub fn max_counts(&self) -> u32 {
        self.max_counts
    }

    pub fn state(&self) -> AcquisitionState {
        self.acquisition.state()
    }

    pub fn lost_samples(&self) -> u64 {
        self.consumer.lost_samples()
    }

    pub fn poll(&mut self) -> Option<CalibratedBlock> {
        self.consumer.poll()
    }

    /// Emit every drained half until `stop` is set or the acquisition thread gives up.
    pub fn run<E>(
        &mut self,
        stop: &AtomicBool,
        emit: impl FnMut(CalibratedBlock) -> Result<(), E>,
    ) -> Result<(), E> {
        let acquisition = &self.acquisition;
        self.consumer.run_until(
            self.config.read_delay(),
            || stop.load(Ordering::Acquire) || acquisition.is_finished(),
            emit,
        )?;
        if acquisition.is_finished() {
            log::warn!("Acquisition ended before the stop signal");
        }
        Ok(())
    }

    /// Join the acquisition thread and stop the device scan.
    pub fn stop(self) -> Result<(DaqScanner, ScanSummary), DaqScannerError> {
        let lost_samples = self.consumer.lost_samples();
        let (terminal, mut report) = self.acquisition.stop()?;
        let mut scanner = DaqScanner {
            terminal,
            product: self.product,
            max_counts: Some(self.max_counts),
        };

        if let Some(fatal) = report.fatal.take() {
            if let Err(e) = scanner.send("AISCAN:STOP") {
                log::warn!("Could not stop the scan: {}", e);
            }
            return Err(DaqScannerError::Streaming(fatal));
        }

        scanner.send("AISCAN:STOP")?;
        let reply = scanner.send("?AISCAN:STATUS")?;
        let status = reply_value("?AISCAN:STATUS", &reply)
            .unwrap_or(&reply)
            .to_string();
        log::info!("Scan status: {}", status);

        Ok((
            scanner,
            ScanSummary {
                config: self.config,
                report,
                lost_samples,
                status,
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulated::{SimulatedDevice, SimulatedHandle};
    use crate::usb_transport::TransferError;
    use std::time::{Duration, Instant};

    fn scanner(device: SimulatedDevice) -> (DaqScanner, SimulatedHandle) {
        let product = device.product();
        let handle = device.handle();
        let terminal = DaqTerminal::new(Box::new(device));
        (DaqScanner::from_terminal(terminal, product), handle)
    }

    fn wait_for_blocks(scan: &mut RunningScan, count: usize) -> Vec<CalibratedBlock> {
        let deadline = Instant::now() + Duration::from_secs(10);
        let mut blocks = Vec::new();
        while blocks.len() < count && Instant::now() < deadline {
            blocks.extend(scan.poll());
            std::thread::sleep(Duration::from_millis(1));
        }
        blocks
    }

    #[test]
    fn test_full_session() {
        let device = SimulatedDevice::new(DaqProduct::Usb1208FsPlus)
            .with_stale_bytes(256)
            .with_calibration(1, 1.5, 2.0);
        let (scanner, handle) = scanner(device);
        let config = ScanConfig::builder().channels(0, 3).rate(2048).build().unwrap();

        let mut scan = scanner.start_scan(config).unwrap();
        assert_eq!(scan.max_counts(), 4095);
        assert_eq!(scan.calibration().get(1).unwrap().scale, 1.5);
        assert_eq!(scan.config().num_points(), 8192);

        let blocks = wait_for_blocks(&mut scan, 2);
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].first_tick, 0);
        assert_eq!(blocks[0].channels, 4);
        assert_eq!(blocks[0].ticks(), 1024);
        if !blocks[0].possibly_torn {
            // ramp sample 1 is channel 1 of tick 0
            let expected = VoltageScale::new(VoltageRange::Bip5V, 4095).to_volts(1.0 * 1.5 + 2.0);
            assert_eq!(blocks[0].values[1], expected);
        }

        let (scanner, summary) = scan.stop().unwrap();
        assert_eq!(summary.status, "IDLE");
        assert!(summary.report.bytes_received >= 8192);
        assert!(summary.report.fatal.is_none());
        scanner.close();

        let commands = handle.commands();
        assert_eq!(
            commands[..9],
            [
                "AISCAN:STOP",
                "?AI:RES",
                "AISCAN:XFRMODE=BLOCKIO",
                "AISCAN:RANGE=BIP5V",
                "AISCAN:LOWCHAN=0",
                "AISCAN:HIGHCHAN=3",
                "AISCAN:RATE=2048",
                "?AISCAN:RATE",
                "AISCAN:SAMPLES=0",
            ]
        );
        assert_eq!(commands[9], "?AI{0}:SLOPE");
        assert_eq!(commands[17], "AISCAN:START");
        assert_eq!(commands[18..], ["AISCAN:STOP", "?AISCAN:STATUS"]);
    }

    #[test]
    fn test_negotiated_rate_resizes_ring() {
        let (scanner, _handle) = scanner(SimulatedDevice::new(DaqProduct::Usb1608FsPlus));
        let config = ScanConfig::builder().channels(0, 0).rate(80_000).build().unwrap();
        let scan = scanner.start_scan(config).unwrap();
        assert_eq!(scan.config().rate(), crate::simulated::SIMULATED_MAX_RATE);
        assert_eq!(scan.config().num_points(), 50_048);
        scan.stop().unwrap();
    }

    #[test]
    fn test_resolution_from_device() {
        let (scanner, _handle) = scanner(SimulatedDevice::new(DaqProduct::Usb1608Gx));
        assert_eq!(scanner.max_counts(), None);
        let scan = scanner.start_scan(ScanConfig::builder().build().unwrap()).unwrap();
        assert_eq!(scan.max_counts(), 0xffff);
        let (scanner, _summary) = scan.stop().unwrap();
        assert_eq!(scanner.max_counts(), Some(0xffff));
    }

    #[test]
    fn test_resolution_reply_ignored_for_fixed_products() {
        let device =
            SimulatedDevice::new(DaqProduct::Usb1208FsPlus).with_reply("?AI:RES", "AI:RES=12BITS");
        let (fixed, _handle) = scanner(device);
        let scan = fixed.start_scan(ScanConfig::builder().build().unwrap()).unwrap();
        assert_eq!(scan.max_counts(), 4095);
        scan.stop().unwrap();

        let device = SimulatedDevice::new(DaqProduct::Usb1608Gx).with_reply("?AI:RES", "AI:RES=16BITS");
        let (variable, _handle) = scanner(device);
        let err = variable.start_scan(ScanConfig::builder().build().unwrap()).unwrap_err();
        assert!(matches!(err, DaqScannerError::Negotiation { command, .. } if command == "?AI:RES"));
    }

    #[test]
    fn test_high_speed_endpoint_reads_whole_packets() {
        let device = SimulatedDevice::new(DaqProduct::Usb1608Gx).with_packet_size(512);
        let (scanner, _handle) = scanner(device);
        let config = ScanConfig::builder().channels(0, 0).rate(1000).build().unwrap();
        let mut scan = scanner.start_scan(config).unwrap();
        assert_eq!(scan.config().packet_size(), 512);
        assert_eq!(scan.config().per_tick_bytes() % 512, 0);

        let blocks = wait_for_blocks(&mut scan, 2);
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[1].first_tick, blocks[0].first_tick + blocks[0].ticks() as u64);

        let (_scanner, summary) = scan.stop().unwrap();
        assert_eq!(summary.report.transfer_errors, 0);
        assert_eq!(summary.report.bytes_received % 512, 0);
        assert_eq!(summary.lost_samples, 0);
    }

    #[test]
    fn test_channel_range_checked_before_io() {
        let (scanner, handle) = scanner(SimulatedDevice::new(DaqProduct::Usb2001Tc));
        let config = ScanConfig::builder().channels(0, 3).build().unwrap();
        assert!(matches!(
            scanner.start_scan(config),
            Err(DaqScannerError::BufferConfig(ScanConfigError::InvalidChannelRange { .. }))
        ));
        assert!(handle.commands().is_empty());
    }

    #[test]
    fn test_rejected_command() {
        let device = SimulatedDevice::new(DaqProduct::Usb2001Tc);
        let handle = device.handle();
        let scanner =
            DaqScanner::from_terminal(DaqTerminal::new(Box::new(device)), DaqProduct::Usb1608Gx);
        let config = ScanConfig::builder().channels(0, 3).build().unwrap();
        let err = scanner.start_scan(config).unwrap_err();
        assert!(matches!(&err, DaqScannerError::Rejected { command } if command == "AISCAN:HIGHCHAN=3"));
        assert!(!handle.commands().contains(&"AISCAN:START".to_string()));
    }

    #[test]
    fn test_stall_reported_after_device_stop() {
        let (scanner, handle) = scanner(SimulatedDevice::new(DaqProduct::Usb1208FsPlus));
        handle.inject_fault(TransferError::Stalled);
        let mut scan = scanner.start_scan(ScanConfig::builder().build().unwrap()).unwrap();

        let stop = AtomicBool::new(false);
        let mut blocks = 0;
        scan.run(&stop, |_| {
            blocks += 1;
            Ok::<_, ()>(())
        })
        .unwrap();
        assert_eq!(blocks, 0);

        assert!(matches!(scan.stop(), Err(DaqScannerError::Streaming(e)) if e.is_fatal()));
        assert_eq!(handle.commands().last().map(String::as_str), Some("AISCAN:STOP"));
    }

    #[test]
    fn test_fetch_calibration() {
        let device = SimulatedDevice::new(DaqProduct::Usb7204).with_calibration(2, 0.98, 1.25);
        let (mut scanner, handle) = scanner(device);
        let store = scanner.fetch_calibration(2, 3, VoltageRange::Bip10V).unwrap();
        assert_eq!(store.range(), VoltageRange::Bip10V);
        assert_eq!(store.entries().len(), 2);
        assert_eq!(store.get(2).unwrap().offset, 1.25);
        assert_eq!(handle.commands()[0], "AISCAN:RANGE=BIP10V");
    }
}
