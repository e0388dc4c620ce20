use std::time::Duration;

/// Channels addressable by `AISCAN:LOWCHAN`/`AISCAN:HIGHCHAN` on the largest supported model.
pub const MAX_CHANNELS: u8 = 16;

/// Bulk packet size of the full-speed models, used until a device reports its own.
pub const TRANSFER_BLOCK: usize = 64;

// Per-tick reads are a quarter of the ring, and must stay whole packets.
const READS_PER_RING: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VoltageRange {
    Bip20V,
    Bip10V,
    #[default]
    Bip5V,
    Bip4V,
    Bip2Pt5V,
    Bip2V,
    Bip1Pt25V,
    Bip1V,
}

impl VoltageRange {
    pub fn as_str(&self) -> &'static str {
        match self {
            VoltageRange::Bip20V => "BIP20V",
            VoltageRange::Bip10V => "BIP10V",
            VoltageRange::Bip5V => "BIP5V",
            VoltageRange::Bip4V => "BIP4V",
            VoltageRange::Bip2Pt5V => "BIP2PT5V",
            VoltageRange::Bip2V => "BIP2V",
            VoltageRange::Bip1Pt25V => "BIP1PT25V",
            VoltageRange::Bip1V => "BIP1V",
        }
    }

    /// Voltage at raw code 0.
    pub fn min_voltage(&self) -> f32 {
        -self.max_voltage()
    }

    /// Voltage at full scale.
    pub fn max_voltage(&self) -> f32 {
        match self {
            VoltageRange::Bip20V => 20.0,
            VoltageRange::Bip10V => 10.0,
            VoltageRange::Bip5V => 5.0,
            VoltageRange::Bip4V => 4.0,
            VoltageRange::Bip2Pt5V => 2.5,
            VoltageRange::Bip2V => 2.0,
            VoltageRange::Bip1Pt25V => 1.25,
            VoltageRange::Bip1V => 1.0,
        }
    }
}

impl std::fmt::Display for VoltageRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for VoltageRange {
    type Err = ScanConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        [
            VoltageRange::Bip20V,
            VoltageRange::Bip10V,
            VoltageRange::Bip5V,
            VoltageRange::Bip4V,
            VoltageRange::Bip2Pt5V,
            VoltageRange::Bip2V,
            VoltageRange::Bip1Pt25V,
            VoltageRange::Bip1V,
        ]
        .into_iter()
        .find(|range| range.as_str().eq_ignore_ascii_case(s))
        .ok_or_else(|| ScanConfigError::UnknownRange(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransferMode {
    #[default]
    BlockIo,
    SingleIo,
    BurstIo,
}

impl TransferMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferMode::BlockIo => "BLOCKIO",
            TransferMode::SingleIo => "SINGLEIO",
            TransferMode::BurstIo => "BURSTIO",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelMode {
    SingleEnded,
    Differential,
}

impl ChannelMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelMode::SingleEnded => "SE",
            ChannelMode::Differential => "DIFF",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScanConfigError {
    #[error("Invalid channel range {low}..={high} (channels 0 to {} available)", MAX_CHANNELS - 1)]
    InvalidChannelRange { low: u8, high: u8 },

    #[error("Scan rate must be at least 1 Hz")]
    ZeroRate,

    #[error("Buffer of {num_points} samples cannot be split into two halves")]
    InvalidBufferSize { num_points: usize },

    #[error("Unknown voltage range '{0}'")]
    UnknownRange(String),

    #[error("Bulk packet size must be at least 1 byte")]
    ZeroPacketSize,
}

#[derive(Debug)]
pub struct ScanConfigBuilder {
    low_channel: u8,
    high_channel: u8,
    rate: u32,
    range: VoltageRange,
    transfer_mode: TransferMode,
    channel_mode: Option<ChannelMode>,
    packet_size: usize,
}

impl ScanConfigBuilder {
    pub fn new() -> Self {
        Self {
            low_channel: 0,
            high_channel: 3,
            rate: 2048,
            range: VoltageRange::default(),
            transfer_mode: TransferMode::default(),
            channel_mode: None,
            packet_size: TRANSFER_BLOCK,
        }
    }

    /// Scan channels `low..=high`.
    pub fn channels(mut self, low: u8, high: u8) -> Self {
        self.low_channel = low;
        self.high_channel = high;
        self
    }

    /// Requested rate per channel in Hz. The device may settle on a different one.
    pub fn rate(mut self, rate: u32) -> Self {
        self.rate = rate;
        self
    }

    pub fn range(mut self, range: VoltageRange) -> Self {
        self.range = range;
        self
    }

    pub fn transfer_mode(mut self, mode: TransferMode) -> Self {
        self.transfer_mode = mode;
        self
    }

    /// Leave unset to keep whatever mode the device is in.
    pub fn channel_mode(mut self, mode: ChannelMode) -> Self {
        self.channel_mode = Some(mode);
        self
    }

    /// Bulk IN packet size of the device. Every acquisition read is a multiple of it.
    pub fn packet_size(mut self, packet_size: usize) -> Self {
        self.packet_size = packet_size;
        self
    }

    pub fn build(self) -> Result<ScanConfig, ScanConfigError> {
        if self.low_channel > self.high_channel || self.high_channel >= MAX_CHANNELS {
            return Err(ScanConfigError::InvalidChannelRange {
                low: self.low_channel,
                high: self.high_channel,
            });
        }
        if self.rate == 0 {
            return Err(ScanConfigError::ZeroRate);
        }
        if self.packet_size == 0 {
            return Err(ScanConfigError::ZeroPacketSize);
        }

        let channels = usize::from(self.high_channel - self.low_channel) + 1;
        let num_points = ScanConfig::buffer_points(self.rate, channels, self.packet_size);
        Ok(ScanConfig {
            low_channel: self.low_channel,
            high_channel: self.high_channel,
            rate: self.rate,
            range: self.range,
            transfer_mode: self.transfer_mode,
            channel_mode: self.channel_mode,
            packet_size: self.packet_size,
            num_points,
        })
    }
}

impl Default for ScanConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Parameters of one continuous scan, and the ring sizing derived from them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanConfig {
    low_channel: u8,
    high_channel: u8,
    rate: u32,
    range: VoltageRange,
    transfer_mode: TransferMode,
    channel_mode: Option<ChannelMode>,
    packet_size: usize,
    num_points: usize,
}

fn gcd(a: usize, b: usize) -> usize {
    if b == 0 {
        a
    } else {
        gcd(b, a % b)
    }
}

impl ScanConfig {
    pub fn builder() -> ScanConfigBuilder {
        ScanConfigBuilder::new()
    }

    /// Ring size in samples: one second of data, grown until a quarter of the ring
    /// is a whole number of packets and of ticks.
    fn buffer_points(rate: u32, channels: usize, packet_size: usize) -> usize {
        let one_second = rate as usize * channels * 2;
        let block = READS_PER_RING * packet_size;
        let tick_quad = 2 * channels * READS_PER_RING;
        let alignment = block / gcd(block, tick_quad) * tick_quad;
        let bytes = one_second.max(packet_size).next_multiple_of(alignment);
        bytes / 2
    }

    /// Same scan at the rate the device actually accepted; the ring is resized to match.
    pub fn with_rate(&self, rate: u32) -> Result<Self, ScanConfigError> {
        if rate == 0 {
            return Err(ScanConfigError::ZeroRate);
        }
        Ok(Self {
            rate,
            num_points: Self::buffer_points(rate, self.channel_count(), self.packet_size),
            ..self.clone()
        })
    }

    /// Same scan for an endpoint with `packet_size` byte packets; the ring is resized to match.
    pub fn with_packet_size(&self, packet_size: usize) -> Result<Self, ScanConfigError> {
        if packet_size == 0 {
            return Err(ScanConfigError::ZeroPacketSize);
        }
        Ok(Self {
            packet_size,
            num_points: Self::buffer_points(self.rate, self.channel_count(), packet_size),
            ..self.clone()
        })
    }

    pub fn low_channel(&self) -> u8 {
        self.low_channel
    }

    pub fn high_channel(&self) -> u8 {
        self.high_channel
    }

    pub fn channel_count(&self) -> usize {
        usize::from(self.high_channel - self.low_channel) + 1
    }

    pub fn rate(&self) -> u32 {
        self.rate
    }

    pub fn range(&self) -> VoltageRange {
        self.range
    }

    pub fn transfer_mode(&self) -> TransferMode {
        self.transfer_mode
    }

    pub fn channel_mode(&self) -> Option<ChannelMode> {
        self.channel_mode
    }

    pub fn packet_size(&self) -> usize {
        self.packet_size
    }

    /// Total ring slots.
    pub fn num_points(&self) -> usize {
        self.num_points
    }

    pub fn half_len(&self) -> usize {
        self.num_points / 2
    }

    pub fn buffer_bytes(&self) -> usize {
        self.num_points * 2
    }

    /// Samples requested by each bulk read of the acquisition loop.
    pub fn per_tick_samples(&self) -> usize {
        self.num_points / READS_PER_RING
    }

    pub fn per_tick_bytes(&self) -> usize {
        self.per_tick_samples() * 2
    }

    /// Pause between bulk reads, also used as the consumer's poll interval.
    pub fn read_delay(&self) -> Duration {
        let ticks = (self.num_points / self.channel_count()) as u64;
        let divisor = self.channel_count() as u64 * u64::from(self.rate) * 2;
        Duration::from_micros(ticks * 100_000 / divisor)
    }

    /// Setup commands that select this scan, in the order they are sent.
    pub fn commands(&self) -> Vec<String> {
        let mut commands = vec![format!("AISCAN:XFRMODE={}", self.transfer_mode.as_str())];
        if let Some(mode) = self.channel_mode {
            commands.push(format!("AI:CHMODE={}", mode.as_str()));
        }
        commands.push(format!("AISCAN:RANGE={}", self.range.as_str()));
        commands.push(format!("AISCAN:LOWCHAN={}", self.low_channel));
        commands.push(format!("AISCAN:HIGHCHAN={}", self.high_channel));
        commands.push(format!("AISCAN:RATE={}", self.rate));
        commands
    }
}
