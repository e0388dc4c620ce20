use crate::scan_config::ScanConfigError;
use std::sync::atomic::{fence, AtomicU16, AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Half {
    First,
    Second,
}

impl Half {
    pub fn other(self) -> Self {
        match self {
            Half::First => Half::Second,
            Half::Second => Half::First,
        }
    }
}

#[derive(Debug)]
struct Shared {
    slots: Box<[AtomicU16]>,
    // Samples committed so far. Published with release once the slots are written.
    written: AtomicU64,
    // Upper bound of what the writer may be touching right now.
    claimed: AtomicU64,
}

/// Fixed ring of raw sample slots shared by exactly one writer and one reader.
pub struct SampleRing;

impl SampleRing {
    /// Allocates `num_points` zeroed slots and hands out the two ends.
    pub fn split(num_points: usize) -> Result<(RingWriter, RingReader), ScanConfigError> {
        if num_points == 0 || num_points % 2 != 0 {
            return Err(ScanConfigError::InvalidBufferSize { num_points });
        }
        let shared = Arc::new(Shared {
            slots: (0..num_points).map(|_| AtomicU16::new(0)).collect(),
            written: AtomicU64::new(0),
            claimed: AtomicU64::new(0),
        });
        Ok((
            RingWriter {
                shared: Arc::clone(&shared),
                total: 0,
            },
            RingReader { shared },
        ))
    }
}

/// Producer end. Owned by the acquisition thread.
#[derive(Debug)]
pub struct RingWriter {
    shared: Arc<Shared>,
    total: u64,
}

impl RingWriter {
    pub fn len(&self) -> usize {
        self.shared.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.slots.is_empty()
    }

    /// Slot the next sample goes to.
    pub fn cursor(&self) -> usize {
        (self.total % self.len() as u64) as usize
    }

    pub fn total_written(&self) -> u64 {
        self.total
    }

    /// Appends the little-endian u16 samples in `bytes`. A trailing odd byte is dropped.
    pub fn append_le_bytes(&mut self, bytes: &[u8]) -> usize {
        let count = bytes.len() / 2;
        self.commit(count, |offset, slots| {
            let len = slots.len();
            for (i, pair) in bytes.chunks_exact(2).enumerate() {
                slots[(offset + i) % len].store(u16::from_le_bytes([pair[0], pair[1]]), Ordering::Relaxed);
            }
        });
        count
    }

    pub fn append(&mut self, samples: &[u16]) {
        self.commit(samples.len(), |offset, slots| write_at(slots, offset, samples));
    }

    fn commit(&mut self, count: usize, write: impl FnOnce(usize, &[AtomicU16])) {
        if count == 0 {
            return;
        }
        let end = self.total + count as u64;
        self.shared.claimed.store(end, Ordering::Relaxed);
        fence(Ordering::Release);
        write(self.cursor(), &self.shared.slots);
        self.shared.written.store(end, Ordering::Release);
        self.total = end;
    }
}

/// Copies `samples` into the ring starting at `offset`, wrapping at the end.
fn write_at(slots: &[AtomicU16], offset: usize, samples: &[u16]) {
    let len = slots.len();
    for (i, &sample) in samples.iter().enumerate() {
        slots[(offset + i) % len].store(sample, Ordering::Relaxed);
    }
}

/// Consumer end.
#[derive(Debug)]
pub struct RingReader {
    shared: Arc<Shared>,
}

impl RingReader {
    pub fn len(&self) -> usize {
        self.shared.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.slots.is_empty()
    }

    pub fn half_len(&self) -> usize {
        self.len() / 2
    }

    /// Samples committed by the writer, ever.
    pub fn total_written(&self) -> u64 {
        self.shared.written.load(Ordering::Acquire)
    }

    /// Latest committed cursor. Everything before it is visible to this reader.
    pub fn current_write_position(&self) -> usize {
        (self.total_written() % self.len() as u64) as usize
    }

    /// Copies `half` into `out` and returns how far the writer had claimed once the
    /// copy was done. A claim beyond the next lap of the half means it may be torn.
    pub fn read_half(&self, half: Half, out: &mut Vec<u16>) -> u64 {
        let start = match half {
            Half::First => 0,
            Half::Second => self.half_len(),
        };
        out.clear();
        out.extend(
            self.shared.slots[start..start + self.half_len()]
                .iter()
                .map(|slot| slot.load(Ordering::Relaxed)),
        );
        fence(Ordering::Acquire);
        self.shared.claimed.load(Ordering::Relaxed)
    }
}
