use crate::daq_terminal::{DaqTerminal, DaqTerminalError};
use crate::sample_ring::RingWriter;
use crate::scan_config::ScanConfig;
use crate::usb_transport::TransferError;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Consecutive reads without data before a stall is reported.
pub const STALL_WARN_ITERATIONS: u32 = 100;

/// Bulk read timeout while streaming.
pub const STREAM_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AcquisitionState {
    Idle,
    Running,
    Stopping,
    Stopped,
}

impl AcquisitionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Idle,
            1 => Self::Running,
            2 => Self::Stopping,
            _ => Self::Stopped,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AcquisitionError {
    #[error("Could not spawn the acquisition thread: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("The acquisition thread panicked")]
    Panicked,
}

/// Tells the acquisition thread to finish its current read and exit.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcquisitionSettings {
    pub chunk_bytes: usize,
    pub delay: Duration,
    pub timeout: Duration,
}

impl From<&ScanConfig> for AcquisitionSettings {
    fn from(config: &ScanConfig) -> Self {
        Self {
            chunk_bytes: config.per_tick_bytes(),
            delay: config.read_delay(),
            timeout: STREAM_TIMEOUT,
        }
    }
}

/// What the acquisition thread did before it stopped.
#[derive(Debug, Default)]
pub struct AcquisitionReport {
    pub iterations: u64,
    pub bytes_received: u64,
    pub timeouts: u64,
    pub transfer_errors: u64,
    pub fatal: Option<DaqTerminalError>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Continue,
    Fatal,
}

/// One bulk read per [`Producer::step`], appended to the ring.
#[derive(Debug)]
pub struct Producer {
    terminal: DaqTerminal,
    writer: RingWriter,
    settings: AcquisitionSettings,
    scratch: Vec<u8>,
    stall_streak: u32,
    report: AcquisitionReport,
}

impl Producer {
    pub fn new(terminal: DaqTerminal, writer: RingWriter, settings: AcquisitionSettings) -> Self {
        Self {
            terminal,
            writer,
            scratch: vec![0; settings.chunk_bytes],
            settings,
            stall_streak: 0,
            report: AcquisitionReport::default(),
        }
    }

    pub fn step(&mut self) -> Step {
        self.report.iterations += 1;
        let received = match self.terminal.bulk_read(&mut self.scratch, self.settings.timeout) {
            Ok(received) => received,
            Err(e) if e.is_fatal() => {
                log::error!("Stopping acquisition: {}", e);
                self.report.fatal = Some(e);
                return Step::Fatal;
            }
            Err(DaqTerminalError::Bulk(TransferError::Timeout { .. })) => {
                self.report.timeouts += 1;
                0
            }
            Err(e) => {
                log::debug!("Bulk read failed: {}", e);
                self.report.transfer_errors += 1;
                0
            }
        };

        if received == 0 {
            self.stall_streak += 1;
            if self.stall_streak == STALL_WARN_ITERATIONS {
                log::warn!(
                    "No data from the device for {} consecutive reads",
                    STALL_WARN_ITERATIONS
                );
            }
        } else {
            self.stall_streak = 0;
            self.report.bytes_received += received as u64;
            self.writer.append_le_bytes(&self.scratch[..received]);
        }
        Step::Continue
    }

    pub fn writer(&self) -> &RingWriter {
        &self.writer
    }

    pub fn report(&self) -> &AcquisitionReport {
        &self.report
    }

    pub fn into_parts(self) -> (DaqTerminal, AcquisitionReport) {
        (self.terminal, self.report)
    }
}

/// The background thread that keeps the ring filled.
#[derive(Debug)]
pub struct AcquisitionLoop {
    handle: JoinHandle<Producer>,
    state: Arc<AtomicU8>,
    token: CancellationToken,
}

impl AcquisitionLoop {
    /// Moves `terminal` and `writer` onto a new thread; both come back from [`Self::stop`].
    pub fn start(
        terminal: DaqTerminal,
        writer: RingWriter,
        settings: AcquisitionSettings,
        token: CancellationToken,
    ) -> Result<Self, AcquisitionError> {
        let state = Arc::new(AtomicU8::new(AcquisitionState::Idle as u8));
        let mut producer = Producer::new(terminal, writer, settings);

        let thread_state = Arc::clone(&state);
        let thread_token = token.clone();
        let handle = thread::Builder::new()
            .name("daqflex-acquisition".to_string())
            .spawn(move || {
                thread_state.store(AcquisitionState::Running as u8, Ordering::Release);
                log::info!("Acquisition started, {} bytes per read", settings.chunk_bytes);
                while !thread_token.is_cancelled() {
                    thread::sleep(settings.delay);
                    if thread_token.is_cancelled() {
                        break;
                    }
                    if producer.step() == Step::Fatal {
                        thread_state.store(AcquisitionState::Stopping as u8, Ordering::Release);
                        break;
                    }
                }
                producer
            })?;

        Ok(Self {
            handle,
            state,
            token,
        })
    }

    pub fn state(&self) -> AcquisitionState {
        AcquisitionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// True once the thread has exited, whether cancelled or after a fatal error.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Cancels and joins the thread. Nothing is written to the ring after this returns.
    pub fn stop(self) -> Result<(DaqTerminal, AcquisitionReport), AcquisitionError> {
        self.token.cancel();
        self.state.store(AcquisitionState::Stopping as u8, Ordering::Release);
        let producer = self.handle.join().map_err(|_| AcquisitionError::Panicked)?;
        self.state.store(AcquisitionState::Stopped as u8, Ordering::Release);

        let (terminal, report) = producer.into_parts();
        log::info!(
            "Acquisition stopped after {} reads, {} bytes",
            report.iterations,
            report.bytes_received
        );
        Ok((terminal, report))
    }
}
