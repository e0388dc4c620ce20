use crate::calibration::{CalibrationEntry, CalibrationError, VoltageScale};
use crate::sample_ring::{Half, RingReader};
use polars::prelude::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

const TICK_COLUMN_NAME: &str = "tick";
const TIME_COLUMN_NAME: &str = "time";

/// Calibrated voltages of one drained half, tick-major with channels interleaved.
#[derive(Debug, Clone, PartialEq)]
pub struct CalibratedBlock {
    pub first_tick: u64,
    pub low_channel: u8,
    pub channels: usize,
    pub values: Vec<f32>,
    /// The producer reached these slots again while they were being copied.
    pub possibly_torn: bool,
}

impl CalibratedBlock {
    pub fn ticks(&self) -> usize {
        self.values.len() / self.channels
    }

    /// All channels of one tick, `index` counted from the start of the block.
    pub fn tick(&self, index: usize) -> Option<&[f32]> {
        self.values.chunks_exact(self.channels).nth(index)
    }

    /// The values of the `index`-th scanned channel.
    pub fn channel(&self, index: usize) -> impl Iterator<Item = f32> + '_ {
        self.values
            .iter()
            .skip(index)
            .step_by(self.channels)
            .copied()
    }

    /// One row per tick: `tick`, `time` in seconds since the scan started, and `ch{n}` in volts.
    pub fn to_dataframe(&self, rate: u32) -> Result<DataFrame, PolarsError> {
        let ticks: Vec<u64> = (self.first_tick..self.first_tick + self.ticks() as u64).collect();
        let times: Vec<f64> = ticks.iter().map(|&t| t as f64 / f64::from(rate)).collect();

        let mut columns: Vec<Column> = vec![
            Series::new(TICK_COLUMN_NAME.into(), ticks).into(),
            Series::new(TIME_COLUMN_NAME.into(), times).into(),
        ];
        for index in 0..self.channels {
            let name = format!("ch{}", usize::from(self.low_channel) + index);
            let values: Vec<f32> = self.channel(index).collect();
            columns.push(Series::new(name.into(), values).into());
        }
        DataFrame::new(columns)
    }
}

/// Drains whichever half of the ring the producer has just left.
#[derive(Debug)]
pub struct HalfBufferConsumer {
    reader: RingReader,
    calibration: Vec<CalibrationEntry>,
    scale: VoltageScale,
    low_channel: u8,
    last_half_read: Half,
    next_expected: u64,
    lost_samples: u64,
    scratch: Vec<u16>,
}

impl HalfBufferConsumer {
    /// `calibration` holds one entry per scanned channel, lowest first.
    pub fn new(
        reader: RingReader,
        calibration: Vec<CalibrationEntry>,
        scale: VoltageScale,
    ) -> Result<Self, CalibrationError> {
        let low_channel = calibration.first().ok_or(CalibrationError::Empty)?.channel;
        Ok(Self {
            scratch: Vec::with_capacity(reader.half_len()),
            reader,
            calibration,
            scale,
            low_channel,
            last_half_read: Half::Second,
            next_expected: 0,
            lost_samples: 0,
        })
    }

    pub fn channels(&self) -> usize {
        self.calibration.len()
    }

    /// Samples overwritten before they could be drained.
    pub fn lost_samples(&self) -> u64 {
        self.lost_samples
    }

    pub fn last_half_read(&self) -> Half {
        self.last_half_read
    }

    /// Drains a half if the cursor has moved out of it, otherwise returns `None`.
    pub fn poll(&mut self) -> Option<CalibratedBlock> {
        let total = self.reader.total_written();
        let len = self.reader.len() as u64;
        let half_len = self.reader.half_len() as u64;
        let position = total % len;
        let lap_start = total - position;

        let (half, start) = if position > half_len && self.last_half_read == Half::Second {
            (Half::First, lap_start)
        } else if position < half_len && self.last_half_read == Half::First {
            (Half::Second, lap_start.saturating_sub(half_len))
        } else {
            return None;
        };

        let claimed = self.reader.read_half(half, &mut self.scratch);
        self.last_half_read = half;

        if start > self.next_expected {
            let lost = start - self.next_expected;
            log::warn!("Consumer fell behind, {} samples overwritten", lost);
            self.lost_samples += lost;
        }
        self.next_expected = start + half_len;

        let possibly_torn = claimed > start + len;
        if possibly_torn {
            log::warn!("Half starting at sample {} was overwritten while reading", start);
        }

        let channels = self.channels();
        let values = self
            .scratch
            .iter()
            .enumerate()
            .map(|(i, &raw)| self.scale.to_volts(self.calibration[i % channels].calibrate(raw)))
            .collect();

        Some(CalibratedBlock {
            first_tick: start / channels as u64,
            low_channel: self.low_channel,
            channels,
            values,
            possibly_torn,
        })
    }

    /// Polls every `interval` until `should_stop` returns true or `emit` fails.
    pub fn run_until<E>(
        &mut self,
        interval: Duration,
        mut should_stop: impl FnMut() -> bool,
        mut emit: impl FnMut(CalibratedBlock) -> Result<(), E>,
    ) -> Result<(), E> {
        while !should_stop() {
            if let Some(block) = self.poll() {
                emit(block)?;
            }
            std::thread::sleep(interval);
        }
        Ok(())
    }

    /// Polls every `interval` until `stop` is set.
    pub fn run<E>(
        &mut self,
        stop: &AtomicBool,
        interval: Duration,
        emit: impl FnMut(CalibratedBlock) -> Result<(), E>,
    ) -> Result<(), E> {
        self.run_until(interval, || stop.load(Ordering::Acquire), emit)
    }
}
