use crate::usb_transport::{Endpoints, TransferError, Transport, CONTROL_TIMEOUT, FRAME_LEN};
use std::time::Duration;

/// Timeout used while discarding stale bulk data.
const FLUSH_TIMEOUT: Duration = Duration::from_millis(200);

#[derive(Debug, thiserror::Error)]
pub enum DaqTerminalError {
    #[error("Command '{command}' is {len} bytes, a message frame holds {max}", max = FRAME_LEN)]
    CommandTooLong { command: String, len: usize },

    #[error("Command '{command}' contains non-ASCII characters")]
    NonAscii { command: String },

    #[error("Request '{command}' failed: {source}")]
    Request {
        command: String,
        #[source]
        source: TransferError,
    },

    #[error("Bulk transfer failed: {0}")]
    Bulk(#[from] TransferError),
}

impl DaqTerminalError {
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Request { source, .. } | Self::Bulk(source) => source.is_fatal(),
            Self::CommandTooLong { .. } | Self::NonAscii { .. } => false,
        }
    }
}

/// Pads `command` into a wire frame.
pub fn encode_frame(command: &str) -> Result<[u8; FRAME_LEN], DaqTerminalError> {
    if !command.is_ascii() {
        return Err(DaqTerminalError::NonAscii {
            command: command.to_string(),
        });
    }
    let bytes = command.as_bytes();
    if bytes.len() > FRAME_LEN {
        return Err(DaqTerminalError::CommandTooLong {
            command: command.to_string(),
            len: bytes.len(),
        });
    }
    let mut frame = [0u8; FRAME_LEN];
    frame[..bytes.len()].copy_from_slice(bytes);
    Ok(frame)
}

/// Reads a response frame up to its first NUL.
pub fn decode_frame(frame: &[u8]) -> String {
    let end = frame.iter().position(|&b| b == 0).unwrap_or(frame.len());
    String::from_utf8_lossy(&frame[..end]).trim().to_string()
}

/// Payload of a reply to `command`, e.g. `"2048.000"` for `?AISCAN:RATE` answered with
/// `AISCAN:RATE=2048.000`. `None` unless the reply echoes the queried key.
pub fn reply_value<'a>(command: &str, reply: &'a str) -> Option<&'a str> {
    let key = command.strip_prefix('?').unwrap_or(command);
    let value = reply.strip_prefix(key)?.strip_prefix('=')?;
    Some(value.trim())
}

/// Message and streaming channel to one opened DAQFlex device.
pub struct DaqTerminal {
    transport: Box<dyn Transport>,
    endpoints: Endpoints,
}

impl std::fmt::Debug for DaqTerminal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DaqTerminal")
            .field("endpoints", &self.endpoints)
            .finish_non_exhaustive()
    }
}

impl DaqTerminal {
    /// Wraps an already opened transport. Endpoints are read once, here.
    pub fn new(transport: Box<dyn Transport>) -> Self {
        let endpoints = transport.endpoints();
        Self {
            transport,
            endpoints,
        }
    }

    pub fn endpoints(&self) -> Endpoints {
        self.endpoints
    }

    pub fn bulk_packet_size(&self) -> usize {
        self.endpoints.bulk_packet_size as usize
    }

    /// Sends one command and returns the device's reply.
    pub fn request(&mut self, command: &str) -> Result<String, DaqTerminalError> {
        let frame = encode_frame(command)?;
        log::debug!("Sending: {}", command);

        let request_error = |source| DaqTerminalError::Request {
            command: command.to_string(),
            source,
        };
        self.transport
            .send_frame(&frame, CONTROL_TIMEOUT)
            .map_err(request_error)?;

        let mut reply = [0u8; FRAME_LEN];
        let len = self
            .transport
            .recv_frame(&mut reply, CONTROL_TIMEOUT)
            .map_err(request_error)?;
        let response = decode_frame(&reply[..len]);
        log::debug!("Got: {}", response);
        Ok(response)
    }

    /// One bulk transfer into `buf`. A timeout that still delivered data counts as success.
    pub fn bulk_read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, DaqTerminalError> {
        match self.transport.bulk_read(buf, timeout) {
            Ok(transferred) | Err(TransferError::Timeout { transferred }) if transferred > 0 => {
                Ok(transferred)
            }
            Ok(_) => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    /// Discards anything left on the bulk IN pipe, e.g. from a previous run.
    pub fn flush_stale(&mut self) -> usize {
        let mut packet = vec![0u8; self.bulk_packet_size().max(1)];
        let mut discarded = 0;
        loop {
            match self.bulk_read(&mut packet, FLUSH_TIMEOUT) {
                Ok(0) | Err(_) => break,
                Ok(n) => discarded += n,
            }
        }
        if discarded > 0 {
            log::debug!("Flushed {} stale bytes", discarded);
        }
        discarded
    }

    /// Releases the interface and closes the device.
    pub fn close(self) {
        log::debug!("Closing device");
        drop(self.transport);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    struct EchoTransport {
        last: Option<[u8; FRAME_LEN]>,
        bulk: VecDeque<Result<Vec<u8>, TransferError>>,
        fail_send: Option<TransferError>,
    }

    impl EchoTransport {
        fn new() -> Self {
            Self {
                last: None,
                bulk: VecDeque::new(),
                fail_send: None,
            }
        }
    }

    impl Transport for EchoTransport {
        fn endpoints(&self) -> Endpoints {
            Endpoints {
                bulk_in: 0x81,
                bulk_out: Some(0x02),
                bulk_packet_size: 64,
            }
        }

        fn send_frame(&mut self, frame: &[u8; FRAME_LEN], _timeout: Duration) -> Result<(), TransferError> {
            if let Some(e) = self.fail_send.take() {
                return Err(e);
            }
            self.last = Some(*frame);
            Ok(())
        }

        fn recv_frame(&mut self, frame: &mut [u8; FRAME_LEN], _timeout: Duration) -> Result<usize, TransferError> {
            let last = self.last.take().ok_or(TransferError::Stalled)?;
            *frame = last;
            Ok(FRAME_LEN)
        }

        fn bulk_read(&mut self, buf: &mut [u8], _timeout: Duration) -> Result<usize, TransferError> {
            match self.bulk.pop_front() {
                Some(Ok(data)) => {
                    buf[..data.len()].copy_from_slice(&data);
                    Ok(data.len())
                }
                Some(Err(TransferError::Timeout { transferred })) => {
                    buf[..transferred].fill(0xaa);
                    Err(TransferError::Timeout { transferred })
                }
                Some(Err(e)) => Err(e),
                None => Err(TransferError::Timeout { transferred: 0 }),
            }
        }
    }

    #[test]
    fn test_encode_frame() {
        let frame = encode_frame("AISCAN:START").unwrap();
        assert_eq!(&frame[..12], b"AISCAN:START");
        assert!(frame[12..].iter().all(|&b| b == 0));

        let exact = "X".repeat(FRAME_LEN);
        assert_eq!(encode_frame(&exact).unwrap(), [b'X'; FRAME_LEN]);

        assert!(matches!(
            encode_frame(&"X".repeat(FRAME_LEN + 1)),
            Err(DaqTerminalError::CommandTooLong { len: 65, .. })
        ));
        assert!(matches!(encode_frame("AI:RANGE=±5V"), Err(DaqTerminalError::NonAscii { .. })));
    }

    #[test]
    fn test_decode_frame() {
        let mut frame = [0u8; FRAME_LEN];
        frame[..16].copy_from_slice(b"AI{0}:SLOPE=1.02");
        frame[20] = b'Z'; // garbage after the terminator is ignored
        assert_eq!(decode_frame(&frame), "AI{0}:SLOPE=1.02");
        assert_eq!(decode_frame(b" AISCAN:STATUS=IDLE \r\n"), "AISCAN:STATUS=IDLE");
    }

    #[test]
    fn test_reply_value() {
        assert_eq!(reply_value("?AI{3}:SLOPE", "AI{3}:SLOPE=1.0021"), Some("1.0021"));
        assert_eq!(reply_value("?AISCAN:RATE", "AISCAN:RATE=2048.000"), Some("2048.000"));
        assert_eq!(reply_value("?AI{3}:SLOPE", "AI{2}:SLOPE=1.0021"), None);
        assert_eq!(reply_value("?AI:RES", "AI:RES"), None);
        assert_eq!(reply_value("?AI:RES", "AI:RESOLUTION=16"), None);
    }

    #[test]
    fn test_request_round_trip() {
        let mut terminal = DaqTerminal::new(Box::new(EchoTransport::new()));
        assert_eq!(terminal.request("?AI:RES").unwrap(), "?AI:RES");
        assert_eq!(terminal.endpoints().bulk_in, 0x81);
    }

    #[test]
    fn test_request_reports_command() {
        let mut transport = EchoTransport::new();
        transport.fail_send = Some(TransferError::Stalled);
        let mut terminal = DaqTerminal::new(Box::new(transport));
        let err = terminal.request("AISCAN:STOP").unwrap_err();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("AISCAN:STOP"));
    }

    #[test]
    fn test_bulk_read_partial_timeout() {
        let mut transport = EchoTransport::new();
        transport.bulk.push_back(Err(TransferError::Timeout { transferred: 32 }));
        transport.bulk.push_back(Err(TransferError::Timeout { transferred: 0 }));
        transport.bulk.push_back(Err(TransferError::NoDevice));
        let mut terminal = DaqTerminal::new(Box::new(transport));
        let mut buf = [0u8; 128];

        assert_eq!(terminal.bulk_read(&mut buf, FLUSH_TIMEOUT).unwrap(), 32);
        assert_eq!(buf[31], 0xaa);
        let err = terminal.bulk_read(&mut buf, FLUSH_TIMEOUT).unwrap_err();
        assert!(!err.is_fatal());
        assert!(terminal.bulk_read(&mut buf, FLUSH_TIMEOUT).unwrap_err().is_fatal());
    }

    #[test]
    fn test_flush_stale() {
        let mut transport = EchoTransport::new();
        transport.bulk.push_back(Ok(vec![1; 64]));
        transport.bulk.push_back(Ok(vec![2; 10]));
        transport.bulk.push_back(Ok(Vec::new()));
        transport.bulk.push_back(Ok(vec![3; 64])); // after the empty read, must stay queued
        let mut terminal = DaqTerminal::new(Box::new(transport));
        assert_eq!(terminal.flush_stale(), 74);
        let mut buf = [0u8; 64];
        assert_eq!(terminal.bulk_read(&mut buf, FLUSH_TIMEOUT).unwrap(), 64);
        assert_eq!(buf[0], 3);
    }
}
