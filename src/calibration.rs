use crate::daq_terminal::{reply_value, DaqTerminal, DaqTerminalError};
use crate::scan_config::VoltageRange;

#[derive(Debug, thiserror::Error)]
pub enum CalibrationError {
    #[error("Could not parse reply '{reply}' to '{command}'")]
    ProtocolParse { command: String, reply: String },

    #[error("Failed to query calibration: {0}")]
    Request(#[from] DaqTerminalError),

    #[error("Calibration was read for {fetched}, the scan uses {requested}")]
    RangeMismatch {
        fetched: VoltageRange,
        requested: VoltageRange,
    },

    #[error("No calibration for channel {channel}")]
    ChannelOutOfRange { channel: u8 },

    #[error("No channels to calibrate")]
    Empty,
}

/// Linear correction of one channel, in raw-count units.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CalibrationEntry {
    pub channel: u8,
    pub scale: f32,
    pub offset: f32,
}

impl CalibrationEntry {
    pub fn calibrate(&self, raw: u16) -> f32 {
        f32::from(raw) * self.scale + self.offset
    }
}

/// Maps calibrated counts onto the voltage span of a range.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VoltageScale {
    pub min: f32,
    pub max: f32,
    pub max_counts: u32,
}

impl VoltageScale {
    pub fn new(range: VoltageRange, max_counts: u32) -> Self {
        Self {
            min: range.min_voltage(),
            max: range.max_voltage(),
            max_counts,
        }
    }

    pub fn to_volts(&self, calibrated: f32) -> f32 {
        (calibrated / self.max_counts as f32) * (self.max - self.min) + self.min
    }
}

/// Calibrate one raw count and convert it to volts.
pub fn scale_and_calibrate(
    raw: u16,
    min_voltage: f32,
    max_voltage: f32,
    scale: f32,
    offset: f32,
    max_counts: u32,
) -> f32 {
    let calibrated = f32::from(raw) * scale + offset;
    (calibrated / max_counts as f32) * (max_voltage - min_voltage) + min_voltage
}

/// Per-channel slope and offset, valid for the range they were read under.
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationStore {
    range: VoltageRange,
    low_channel: u8,
    entries: Vec<CalibrationEntry>,
}

impl CalibrationStore {
    /// Query `?AI{ch}:SLOPE` and `?AI{ch}:OFFSET` for every channel in `low..=high`.
    /// The device must already be set to `range`.
    pub fn fetch(
        terminal: &mut DaqTerminal,
        low: u8,
        high: u8,
        range: VoltageRange,
    ) -> Result<Self, CalibrationError> {
        let mut entries = Vec::with_capacity(usize::from(high.saturating_sub(low)) + 1);
        for channel in low..=high {
            let scale = Self::query(terminal, &format!("?AI{{{channel}}}:SLOPE"))?;
            let offset = Self::query(terminal, &format!("?AI{{{channel}}}:OFFSET"))?;
            log::info!(
                "Channel {} calibration slope: {} offset: {}",
                channel,
                scale,
                offset
            );
            entries.push(CalibrationEntry {
                channel,
                scale,
                offset,
            });
        }
        Ok(Self {
            range,
            low_channel: low,
            entries,
        })
    }

    fn query(terminal: &mut DaqTerminal, command: &str) -> Result<f32, CalibrationError> {
        let reply = terminal.request(command)?;
        parse_reply(command, &reply)
    }

    /// Build a store from known values, e.g. ones saved from an earlier session.
    pub fn from_entries(range: VoltageRange, entries: Vec<CalibrationEntry>) -> Self {
        let low_channel = entries.iter().map(|e| e.channel).min().unwrap_or(0);
        let mut entries = entries;
        entries.sort_by_key(|e| e.channel);
        Self {
            range,
            low_channel,
            entries,
        }
    }

    pub fn range(&self) -> VoltageRange {
        self.range
    }

    pub fn entries(&self) -> &[CalibrationEntry] {
        &self.entries
    }

    pub fn get(&self, channel: u8) -> Result<&CalibrationEntry, CalibrationError> {
        channel
            .checked_sub(self.low_channel)
            .and_then(|index| self.entries.get(usize::from(index)))
            .filter(|entry| entry.channel == channel)
            .ok_or(CalibrationError::ChannelOutOfRange { channel })
    }

    /// Entries for `low..=high`, for use with a scan in `range`.
    pub fn for_scan(
        &self,
        range: VoltageRange,
        low: u8,
        high: u8,
    ) -> Result<Vec<CalibrationEntry>, CalibrationError> {
        if range != self.range {
            return Err(CalibrationError::RangeMismatch {
                fetched: self.range,
                requested: range,
            });
        }
        (low..=high).map(|channel| self.get(channel).copied()).collect()
    }
}

fn parse_reply(command: &str, reply: &str) -> Result<f32, CalibrationError> {
    reply_value(command, reply)
        .and_then(|value| value.parse().ok())
        .ok_or_else(|| CalibrationError::ProtocolParse {
            command: command.to_string(),
            reply: reply.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scaling_endpoints() {
        let volts = |raw| scale_and_calibrate(raw, -5.0, 5.0, 1.0, 0.0, 4095);
        assert_eq!(volts(0), -5.0);
        assert_eq!(volts(4095), 5.0);
        assert!(volts(2047).abs() < 2e-3);
    }

    #[test]
    fn test_calibration_order() {
        let entry = CalibrationEntry {
            channel: 0,
            scale: 1.02,
            offset: -3.0,
        };
        assert_eq!(entry.calibrate(1000), 1017.0);

        let scale = VoltageScale::new(VoltageRange::Bip5V, 4095);
        let expected = (1017.0f32 / 4095.0) * 10.0 - 5.0;
        assert_eq!(scale.to_volts(entry.calibrate(1000)), expected);
        assert_eq!(scale_and_calibrate(1000, -5.0, 5.0, 1.02, -3.0, 4095), expected);
    }

    #[test]
    fn test_parse_reply() {
        assert_eq!(parse_reply("?AI{0}:SLOPE", "AI{0}:SLOPE=1.023").unwrap(), 1.023);
        assert_eq!(parse_reply("?AI{12}:OFFSET", "AI{12}:OFFSET=-3.5").unwrap(), -3.5);
        assert!(matches!(
            parse_reply("?AI{0}:SLOPE", "AI{0}:OFFSET=1.0"),
            Err(CalibrationError::ProtocolParse { .. })
        ));
        assert!(matches!(
            parse_reply("?AI{0}:SLOPE", "AI{0}:SLOPE=abc"),
            Err(CalibrationError::ProtocolParse { .. })
        ));
    }

    #[test]
    fn test_store_lookup() {
        let entry = |channel| CalibrationEntry {
            channel,
            scale: 1.0,
            offset: f32::from(channel),
        };
        let store = CalibrationStore::from_entries(VoltageRange::Bip5V, vec![entry(3), entry(2)]);
        assert_eq!(store.get(3).unwrap().offset, 3.0);
        assert!(matches!(store.get(1), Err(CalibrationError::ChannelOutOfRange { channel: 1 })));
        assert!(matches!(store.get(4), Err(CalibrationError::ChannelOutOfRange { channel: 4 })));

        assert_eq!(store.for_scan(VoltageRange::Bip5V, 2, 3).unwrap().len(), 2);
        assert!(matches!(
            store.for_scan(VoltageRange::Bip10V, 2, 3),
            Err(CalibrationError::RangeMismatch { .. })
        ));
    }
}
