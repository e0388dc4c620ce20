//! A stand-in DAQFlex device that speaks the message protocol and streams synthetic samples.
//!
//! Useful for running the full pipeline without hardware:
//!
//! ```rust
//! use daqflex_rs::{DaqProduct, DaqTerminal, SimulatedDevice};
//!
//! let device = SimulatedDevice::new(DaqProduct::Usb1208FsPlus);
//! let mut terminal = DaqTerminal::new(Box::new(device));
//! assert_eq!(terminal.request("?AI:RES").unwrap(), "AI:RES=12");
//! ```

use crate::daq_connector::DaqProduct;
use crate::daq_terminal::decode_frame;
use crate::scan_config::MAX_CHANNELS;
use crate::usb_transport::{Endpoints, TransferError, Transport, FRAME_LEN};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Highest rate the simulated device accepts; faster requests are clamped.
pub const SIMULATED_MAX_RATE: u32 = 50_000;

const DEFAULT_PACKET_SIZE: u16 = 64;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Signal {
    /// Raw code equal to the running sample index, wrapping at full scale.
    Ramp,
    /// Sine around mid-scale, each channel shifted by a quarter period.
    Sine { hz: f32 },
    Constant(u16),
}

#[derive(Debug, Default)]
struct Shared {
    commands: Vec<String>,
    faults: VecDeque<TransferError>,
}

/// Observes and steers a [`SimulatedDevice`] after it has been moved into a terminal.
#[derive(Debug, Clone, Default)]
pub struct SimulatedHandle {
    shared: Arc<Mutex<Shared>>,
}

impl SimulatedHandle {
    fn with<T>(&self, f: impl FnOnce(&mut Shared) -> T) -> T {
        let mut shared = self.shared.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut shared)
    }

    /// Every command received so far, in order.
    pub fn commands(&self) -> Vec<String> {
        self.with(|shared| shared.commands.clone())
    }

    /// Makes one of the next bulk reads of a running scan fail with `error`.
    pub fn inject_fault(&self, error: TransferError) {
        self.with(|shared| shared.faults.push_back(error));
    }
}

#[derive(Debug)]
pub struct SimulatedDevice {
    product: DaqProduct,
    max_counts: u32,
    signal: Signal,
    paced: bool,
    packet_size: u16,
    serial: String,
    slopes: [f32; MAX_CHANNELS as usize],
    offsets: [f32; MAX_CHANNELS as usize],
    stale: Vec<u8>,
    low_channel: u8,
    high_channel: u8,
    rate: u32,
    settings: Vec<(String, String)>,
    overrides: Vec<(String, String)>,
    scan_start: Option<Instant>,
    next_sample: u64,
    reply: Option<String>,
    handle: SimulatedHandle,
}

impl SimulatedDevice {
    pub fn new(product: DaqProduct) -> Self {
        Self {
            product,
            max_counts: product.max_counts().unwrap_or(0xffff),
            signal: Signal::Ramp,
            paced: false,
            packet_size: DEFAULT_PACKET_SIZE,
            serial: "01D2A8F3".to_string(),
            slopes: [1.0; MAX_CHANNELS as usize],
            offsets: [0.0; MAX_CHANNELS as usize],
            stale: Vec::new(),
            low_channel: 0,
            high_channel: 0,
            rate: 1000,
            settings: Vec::new(),
            overrides: Vec::new(),
            scan_start: None,
            next_sample: 0,
            reply: None,
            handle: SimulatedHandle::default(),
        }
    }

    pub fn with_signal(mut self, signal: Signal) -> Self {
        self.signal = signal;
        self
    }

    pub fn with_calibration(mut self, channel: u8, slope: f32, offset: f32) -> Self {
        let index = usize::from(channel);
        if index < self.slopes.len() {
            self.slopes[index] = slope;
            self.offsets[index] = offset;
        }
        self
    }

    /// Leftover bytes from an earlier session, readable before the first `AISCAN:START`.
    pub fn with_stale_bytes(mut self, count: usize) -> Self {
        self.stale = vec![0xee; count];
        self
    }

    /// Release samples no faster than the configured rate, like real hardware.
    pub fn paced(mut self, paced: bool) -> Self {
        self.paced = paced;
        self
    }

    /// Bulk IN packet size reported by the endpoint descriptor. Full-speed models use 64.
    pub fn with_packet_size(mut self, packet_size: u16) -> Self {
        self.packet_size = packet_size.max(1);
        self
    }

    /// Answer `command` with `reply` instead of the built-in response.
    pub fn with_reply(mut self, command: &str, reply: &str) -> Self {
        self.overrides.push((command.to_string(), reply.to_string()));
        self
    }

    pub fn handle(&self) -> SimulatedHandle {
        self.handle.clone()
    }

    pub fn product(&self) -> DaqProduct {
        self.product
    }

    fn channels(&self) -> u64 {
        u64::from(self.high_channel.saturating_sub(self.low_channel)) + 1
    }

    fn resolution_bits(&self) -> u32 {
        u32::BITS - self.max_counts.leading_zeros()
    }

    fn setting(&self, key: &str) -> Option<&str> {
        self.settings
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    fn calibration_query(&self, key: &str) -> Option<String> {
        let rest = key.strip_prefix("AI{")?;
        let (channel, field) = rest.split_once("}:")?;
        let channel: usize = channel.parse().ok()?;
        let value = match field {
            "SLOPE" => self.slopes.get(channel)?,
            "OFFSET" => self.offsets.get(channel)?,
            _ => return None,
        };
        Some(format!("{key}={value}"))
    }

    fn handle_query(&self, key: &str) -> String {
        match key {
            "AI:RES" => format!("AI:RES={}", self.resolution_bits()),
            "AISCAN:RATE" => format!("AISCAN:RATE={:.3}", f64::from(self.rate)),
            "AISCAN:STATUS" => {
                let status = if self.scan_start.is_some() { "RUNNING" } else { "IDLE" };
                format!("AISCAN:STATUS={status}")
            }
            "DEV:MFGSER" => format!("DEV:MFGSER={}", self.serial),
            _ => match self.setting(key) {
                Some(value) => format!("{key}={value}"),
                None => self.calibration_query(key).unwrap_or_else(|| "NAK".to_string()),
            },
        }
    }

    fn handle_set(&mut self, key: &str, value: &str) -> String {
        let accepted = match key {
            "AISCAN:LOWCHAN" | "AISCAN:HIGHCHAN" => match value.parse::<u8>() {
                Ok(channel) if channel < self.product.channels() => {
                    if key == "AISCAN:LOWCHAN" {
                        self.low_channel = channel;
                    } else {
                        self.high_channel = channel;
                    }
                    true
                }
                _ => false,
            },
            "AISCAN:RATE" => value
                .parse::<u32>()
                .map(|rate| self.rate = rate.clamp(1, SIMULATED_MAX_RATE))
                .is_ok(),
            "AISCAN:XFRMODE" | "AISCAN:RANGE" | "AISCAN:SAMPLES" | "AI:CHMODE" => true,
            _ => false,
        };
        if !accepted {
            return "NAK".to_string();
        }
        self.settings.retain(|(k, _)| k != key);
        self.settings.push((key.to_string(), value.to_string()));
        format!("{key}={value}")
    }

    fn handle_command(&mut self, command: &str) -> String {
        self.handle.with(|shared| shared.commands.push(command.to_string()));
        if let Some((_, reply)) = self.overrides.iter().find(|(c, _)| c == command) {
            return reply.clone();
        }
        if let Some(key) = command.strip_prefix('?') {
            return self.handle_query(key);
        }
        match command {
            "AISCAN:START" => {
                self.stale.clear();
                self.next_sample = 0;
                self.scan_start = Some(Instant::now());
                command.to_string()
            }
            "AISCAN:STOP" => {
                self.scan_start = None;
                command.to_string()
            }
            _ => match command.split_once('=') {
                Some((key, value)) => self.handle_set(key, value),
                None => "NAK".to_string(),
            },
        }
    }

    fn sample(&self, index: u64) -> u16 {
        match self.signal {
            Signal::Ramp => (index % (u64::from(self.max_counts) + 1)) as u16,
            Signal::Constant(raw) => raw,
            Signal::Sine { hz } => {
                let channels = self.channels();
                let tick = index / channels;
                let phase = (index % channels) as f32 * std::f32::consts::FRAC_PI_2;
                let t = tick as f32 / self.rate as f32;
                let mid = self.max_counts as f32 / 2.0;
                let value = mid + 0.8 * mid * (std::f32::consts::TAU * hz * t + phase).sin();
                value as u16
            }
        }
    }

    /// Samples the scan has produced by now.
    fn available(&self, start: Instant) -> u64 {
        let ticks = start.elapsed().as_secs_f64() * f64::from(self.rate);
        ticks as u64 * self.channels()
    }

    fn stream(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransferError> {
        if let Some(fault) = self.handle.with(|shared| shared.faults.pop_front()) {
            return Err(match fault {
                TransferError::Timeout { transferred } => {
                    let filled = transferred.min(buf.len());
                    TransferError::Timeout {
                        transferred: self.fill(&mut buf[..filled]),
                    }
                }
                other => other,
            });
        }

        let wanted = (buf.len() / 2) as u64;
        if !self.paced {
            return Ok(self.fill(buf));
        }

        let Some(start) = self.scan_start else {
            return Err(TransferError::Timeout { transferred: 0 });
        };
        let target = self.next_sample + wanted;
        if self.available(start) < target {
            let due = Duration::from_secs_f64((target / self.channels()) as f64 / f64::from(self.rate));
            std::thread::sleep(due.saturating_sub(start.elapsed()).min(timeout));
        }

        let ready = self.available(start).saturating_sub(self.next_sample).min(wanted) as usize;
        if ready as u64 == wanted {
            return Ok(self.fill(buf));
        }
        let packet = usize::from(self.packet_size);
        let partial = (ready * 2) / packet * packet;
        let transferred = self.fill(&mut buf[..partial]);
        Err(TransferError::Timeout { transferred })
    }

    fn fill(&mut self, buf: &mut [u8]) -> usize {
        for pair in buf.chunks_exact_mut(2) {
            pair.copy_from_slice(&self.sample(self.next_sample).to_le_bytes());
            self.next_sample += 1;
        }
        buf.len() / 2 * 2
    }
}

impl Transport for SimulatedDevice {
    fn endpoints(&self) -> Endpoints {
        Endpoints {
            bulk_in: 0x81,
            bulk_out: Some(0x02),
            bulk_packet_size: self.packet_size,
        }
    }

    fn send_frame(&mut self, frame: &[u8; FRAME_LEN], _timeout: Duration) -> Result<(), TransferError> {
        let command = decode_frame(frame);
        let reply = self.handle_command(&command);
        self.reply = Some(reply);
        Ok(())
    }

    fn recv_frame(&mut self, frame: &mut [u8; FRAME_LEN], _timeout: Duration) -> Result<usize, TransferError> {
        let reply = self
            .reply
            .take()
            .ok_or_else(|| TransferError::Failed("no message pending".to_string()))?;
        let bytes = reply.as_bytes();
        let len = bytes.len().min(FRAME_LEN);
        frame.fill(0);
        frame[..len].copy_from_slice(&bytes[..len]);
        Ok(FRAME_LEN)
    }

    fn bulk_read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransferError> {
        if self.scan_start.is_some() {
            let packet = usize::from(self.packet_size);
            if buf.is_empty() || buf.len() % packet != 0 {
                return Err(TransferError::Unaligned {
                    len: buf.len(),
                    packet,
                });
            }
            return self.stream(buf, timeout);
        }
        if self.stale.is_empty() {
            return Err(TransferError::Timeout { transferred: 0 });
        }
        let len = buf.len().min(self.stale.len());
        buf[..len].copy_from_slice(&self.stale[..len]);
        self.stale.drain(..len);
        Ok(len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daq_terminal::{DaqTerminal, DaqTerminalError};

    #[test]
    fn test_queries() {
        let device = SimulatedDevice::new(DaqProduct::Usb1608FsPlus).with_calibration(2, 1.02, -3.0);
        let mut terminal = DaqTerminal::new(Box::new(device));
        assert_eq!(terminal.request("?AI:RES").unwrap(), "AI:RES=16");
        assert_eq!(terminal.request("?AI{2}:SLOPE").unwrap(), "AI{2}:SLOPE=1.02");
        assert_eq!(terminal.request("?AI{2}:OFFSET").unwrap(), "AI{2}:OFFSET=-3");
        assert_eq!(terminal.request("?AISCAN:STATUS").unwrap(), "AISCAN:STATUS=IDLE");
        assert_eq!(terminal.request("FOO").unwrap(), "NAK");
    }

    #[test]
    fn test_rate_is_clamped() {
        let mut terminal = DaqTerminal::new(Box::new(SimulatedDevice::new(DaqProduct::Usb7204)));
        terminal.request("AISCAN:RATE=90000").unwrap();
        assert_eq!(terminal.request("?AISCAN:RATE").unwrap(), "AISCAN:RATE=50000.000");
        assert_eq!(terminal.request("AISCAN:RATE=fast").unwrap(), "NAK");
        assert_eq!(terminal.request("AISCAN:HIGHCHAN=8").unwrap(), "NAK");
    }

    #[test]
    fn test_stale_bytes_then_ramp() {
        let device = SimulatedDevice::new(DaqProduct::Usb1208FsPlus).with_stale_bytes(100);
        let handle = device.handle();
        let mut terminal = DaqTerminal::new(Box::new(device));
        assert_eq!(terminal.flush_stale(), 100);

        terminal.request("AISCAN:START").unwrap();
        let mut buf = [0u8; 64];
        assert_eq!(terminal.bulk_read(&mut buf, Duration::from_millis(10)).unwrap(), 64);
        assert_eq!(buf[..8], [0, 0, 1, 0, 2, 0, 3, 0]);
        assert_eq!(handle.commands(), vec!["AISCAN:START"]);
    }

    #[test]
    fn test_injected_fault() {
        let device = SimulatedDevice::new(DaqProduct::Usb1208FsPlus);
        let handle = device.handle();
        let mut terminal = DaqTerminal::new(Box::new(device));
        terminal.request("AISCAN:START").unwrap();
        handle.inject_fault(TransferError::Stalled);
        let mut buf = [0u8; 64];
        assert!(terminal.bulk_read(&mut buf, Duration::from_millis(10)).unwrap_err().is_fatal());
        assert_eq!(terminal.bulk_read(&mut buf, Duration::from_millis(10)).unwrap(), 64);
    }

    #[test]
    fn test_partial_fault_larger_than_buffer() {
        let device = SimulatedDevice::new(DaqProduct::Usb1208FsPlus);
        let handle = device.handle();
        let mut terminal = DaqTerminal::new(Box::new(device));
        terminal.request("AISCAN:START").unwrap();
        handle.inject_fault(TransferError::Timeout { transferred: 4096 });
        let mut buf = [0u8; 64];
        assert_eq!(terminal.bulk_read(&mut buf, Duration::from_millis(10)).unwrap(), 64);
        assert_eq!(buf[2], 1);
    }

    #[test]
    fn test_unaligned_stream_read_is_refused() {
        let device = SimulatedDevice::new(DaqProduct::Usb1608Gx).with_packet_size(512);
        let mut terminal = DaqTerminal::new(Box::new(device));
        assert_eq!(terminal.bulk_packet_size(), 512);
        terminal.request("AISCAN:START").unwrap();
        let mut buf = vec![0u8; 64];
        assert!(matches!(
            terminal.bulk_read(&mut buf, Duration::from_millis(10)),
            Err(DaqTerminalError::Bulk(TransferError::Unaligned { len: 64, packet: 512 }))
        ));
        let mut buf = vec![0u8; 1024];
        assert_eq!(terminal.bulk_read(&mut buf, Duration::from_millis(10)).unwrap(), 1024);
    }

    #[test]
    fn test_reply_override() {
        let device = SimulatedDevice::new(DaqProduct::Usb7202).with_reply("?AI:RES", "AI:RES=16BITS");
        let mut terminal = DaqTerminal::new(Box::new(device));
        assert_eq!(terminal.request("?AI:RES").unwrap(), "AI:RES=16BITS");
        assert_eq!(terminal.request("?DEV:MFGSER").unwrap(), "DEV:MFGSER=01D2A8F3");
    }

    #[test]
    fn test_paced_stream_times_out_partially() {
        let device = SimulatedDevice::new(DaqProduct::Usb1208FsPlus).paced(true);
        let mut terminal = DaqTerminal::new(Box::new(device));
        terminal.request("AISCAN:RATE=1000").unwrap();
        terminal.request("AISCAN:START").unwrap();
        // 10 s worth of data cannot arrive within 50 ms
        let mut buf = vec![0u8; 20_480];
        let received = terminal.bulk_read(&mut buf, Duration::from_millis(50)).unwrap_or(0);
        assert!(received < buf.len());
        assert_eq!(received % 64, 0);
    }
}
