use nusb::transfer::{Bulk, ControlIn, ControlOut, ControlType, In, Recipient};
use nusb::{Endpoint, Interface, MaybeFuture};
use std::time::Duration;

/// Size of one DAQFlex message frame, in both directions.
pub const FRAME_LEN: usize = 64;

/// Vendor request code carrying DAQFlex string messages.
const STRING_MESSAGE: u8 = 0x80;

const GET_DESCRIPTOR: u8 = 0x06;
const CONFIGURATION_DESCRIPTOR: u16 = 0x02 << 8;
const DESCRIPTOR_LEN: u16 = 64;
const ENDPOINT_DESCRIPTOR: u8 = 0x05;

/// How long a cancelled bulk transfer gets to report what it already received.
const CANCEL_GRACE: Duration = Duration::from_millis(100);

/// Timeout for every control transfer of the message protocol.
pub const CONTROL_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransferError {
    #[error("transfer timed out after {transferred} bytes")]
    Timeout { transferred: usize },

    #[error("endpoint stalled")]
    Stalled,

    #[error("device disconnected")]
    NoDevice,

    #[error("transfer failed: {0}")]
    Failed(String),

    #[error("read of {len} bytes is not a whole number of {packet}-byte packets")]
    Unaligned { len: usize, packet: usize },
}

impl TransferError {
    /// Stalls and disconnects end a stream; everything else is jitter.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Stalled | Self::NoDevice)
    }
}

impl From<nusb::transfer::TransferError> for TransferError {
    fn from(error: nusb::transfer::TransferError) -> Self {
        match error {
            nusb::transfer::TransferError::Stall => Self::Stalled,
            nusb::transfer::TransferError::Disconnected => Self::NoDevice,
            nusb::transfer::TransferError::Cancelled => Self::Timeout { transferred: 0 },
            other => Self::Failed(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoints {
    pub bulk_in: u8,
    pub bulk_out: Option<u8>,
    pub bulk_packet_size: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EndpointDiscoveryError {
    #[error("configuration descriptor has no bulk IN endpoint")]
    NoBulkIn,

    #[error("malformed descriptor at byte {offset}")]
    Malformed { offset: usize },

    #[error("bulk IN endpoint reports a zero packet size")]
    ZeroPacketSize,
}

/// Walks a raw configuration descriptor and picks the first bulk IN and bulk OUT
/// endpoints. The packet size is taken from the bulk IN entry.
pub fn parse_endpoints(descriptor: &[u8]) -> Result<Endpoints, EndpointDiscoveryError> {
    let mut bulk_in = None;
    let mut bulk_out = None;
    let mut index = 0;

    while index + 1 < descriptor.len() {
        let length = descriptor[index] as usize;
        if length == 0 {
            break;
        }
        if descriptor[index + 1] == ENDPOINT_DESCRIPTOR {
            let entry = descriptor
                .get(index..index + 7)
                .ok_or(EndpointDiscoveryError::Malformed { offset: index })?;
            let address = entry[2];
            let is_bulk = entry[3] & 0x03 == 0x02;
            if is_bulk && address & 0x80 != 0 && bulk_in.is_none() {
                bulk_in = Some((address, u16::from_le_bytes([entry[4], entry[5]])));
            } else if is_bulk && address & 0x80 == 0 && bulk_out.is_none() {
                bulk_out = Some(address);
            }
        }
        index += length;
    }

    let (bulk_in, bulk_packet_size) = bulk_in.ok_or(EndpointDiscoveryError::NoBulkIn)?;
    if bulk_packet_size == 0 {
        return Err(EndpointDiscoveryError::ZeroPacketSize);
    }
    Ok(Endpoints {
        bulk_in,
        bulk_out,
        bulk_packet_size,
    })
}

/// The wire underneath a [`crate::DaqTerminal`].
///
/// `bulk_read` reports a timeout that still moved data as
/// `Err(TransferError::Timeout { transferred })` with those bytes already in `buf`.
pub trait Transport: Send {
    fn endpoints(&self) -> Endpoints;

    fn send_frame(&mut self, frame: &[u8; FRAME_LEN], timeout: Duration) -> Result<(), TransferError>;

    fn recv_frame(&mut self, frame: &mut [u8; FRAME_LEN], timeout: Duration) -> Result<usize, TransferError>;

    fn bulk_read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransferError>;
}

/// Transfers submitted on an endpoint and not yet reaped.
trait TransferQueue {
    fn pending(&self) -> usize;

    /// Waits up to `timeout` for the oldest transfer and discards it.
    fn reap(&mut self, timeout: Duration) -> bool;
}

impl TransferQueue for Endpoint<Bulk, In> {
    fn pending(&self) -> usize {
        Endpoint::pending(self)
    }

    fn reap(&mut self, timeout: Duration) -> bool {
        self.wait_next_complete(timeout).is_some()
    }
}

/// Clears transfers a timed-out read left behind, so every read owns exactly one.
fn drain_leftovers(queue: &mut impl TransferQueue) -> Result<usize, TransferError> {
    let mut reaped = 0;
    while queue.pending() > 0 {
        if !queue.reap(CANCEL_GRACE) {
            return Err(TransferError::Timeout { transferred: 0 });
        }
        reaped += 1;
    }
    Ok(reaped)
}

pub struct UsbTransport {
    interface: Interface,
    bulk_in: Endpoint<Bulk, In>,
    endpoints: Endpoints,
}

impl UsbTransport {
    /// Discovers the endpoints of a claimed interface and opens its bulk IN pipe.
    pub fn new(interface: Interface) -> Result<Self, crate::DaqConnectorError> {
        let descriptor = interface
            .control_in(
                ControlIn {
                    control_type: ControlType::Standard,
                    recipient: Recipient::Device,
                    request: GET_DESCRIPTOR,
                    value: CONFIGURATION_DESCRIPTOR,
                    index: 0,
                    length: DESCRIPTOR_LEN,
                },
                CONTROL_TIMEOUT,
            )
            .wait()
            .map_err(|e| crate::DaqConnectorError::Descriptor(TransferError::from(e)))?;

        let endpoints = parse_endpoints(&descriptor)?;
        log::debug!(
            "Endpoints: in={:#04x} out={:?} packet={}",
            endpoints.bulk_in,
            endpoints.bulk_out,
            endpoints.bulk_packet_size
        );

        let bulk_in = interface
            .endpoint::<Bulk, In>(endpoints.bulk_in)
            .map_err(|e| crate::DaqConnectorError::Usb(e.into()))?;

        Ok(Self {
            interface,
            bulk_in,
            endpoints,
        })
    }
}

impl Transport for UsbTransport {
    fn endpoints(&self) -> Endpoints {
        self.endpoints
    }

    fn send_frame(&mut self, frame: &[u8; FRAME_LEN], timeout: Duration) -> Result<(), TransferError> {
        self.interface
            .control_out(
                ControlOut {
                    control_type: ControlType::Vendor,
                    recipient: Recipient::Device,
                    request: STRING_MESSAGE,
                    value: 0,
                    index: 0,
                    data: frame,
                },
                timeout,
            )
            .wait()?;
        Ok(())
    }

    fn recv_frame(&mut self, frame: &mut [u8; FRAME_LEN], timeout: Duration) -> Result<usize, TransferError> {
        let data = self
            .interface
            .control_in(
                ControlIn {
                    control_type: ControlType::Vendor,
                    recipient: Recipient::Device,
                    request: STRING_MESSAGE,
                    value: 0,
                    index: 0,
                    length: FRAME_LEN as u16,
                },
                timeout,
            )
            .wait()?;
        let len = data.len().min(FRAME_LEN);
        frame[..len].copy_from_slice(&data[..len]);
        frame[len..].fill(0);
        Ok(len)
    }

    fn bulk_read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransferError> {
        // IN transfers must be whole packets, anything shorter could not hold what arrives
        let packet = self.bulk_in.max_packet_size().max(1);
        if buf.is_empty() || buf.len() % packet != 0 {
            return Err(TransferError::Unaligned {
                len: buf.len(),
                packet,
            });
        }

        let reaped = drain_leftovers(&mut self.bulk_in)?;
        if reaped > 0 {
            log::warn!("Discarded {} transfer(s) that completed after their timeout", reaped);
        }
        self.bulk_in.submit(self.bulk_in.allocate(buf.len()));

        let completion = match self.bulk_in.wait_next_complete(timeout) {
            Some(completion) => completion,
            None => {
                self.bulk_in.cancel_all();
                match self.bulk_in.wait_next_complete(CANCEL_GRACE) {
                    Some(completion) => completion,
                    None => return Err(TransferError::Timeout { transferred: 0 }),
                }
            }
        };

        let received = completion.actual_len.min(buf.len());
        buf[..received].copy_from_slice(&completion.buffer[..received]);
        log::trace!("bulk_read({}) = {}", buf.len(), received);

        match completion.status {
            Ok(()) => Ok(received),
            Err(nusb::transfer::TransferError::Cancelled) => Err(TransferError::Timeout {
                transferred: received,
            }),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // config(9) + interface(9) + bulk IN 0x81/64 + bulk OUT 0x02/64, as a 1208FS-Plus reports it
    const DESCRIPTOR: [u8; 32] = [
        0x09, 0x02, 0x20, 0x00, 0x01, 0x01, 0x00, 0x80, 0x32, //
        0x09, 0x04, 0x00, 0x00, 0x02, 0xff, 0x00, 0x00, 0x00, //
        0x07, 0x05, 0x81, 0x02, 0x40, 0x00, 0x01, //
        0x07, 0x05, 0x02, 0x02, 0x40, 0x00, 0x01,
    ];

    #[test]
    fn test_parse_endpoints() {
        let endpoints = parse_endpoints(&DESCRIPTOR).unwrap();
        assert_eq!(endpoints.bulk_in, 0x81);
        assert_eq!(endpoints.bulk_out, Some(0x02));
        assert_eq!(endpoints.bulk_packet_size, 64);
    }

    #[test]
    fn test_parse_endpoints_skips_interrupt() {
        let mut descriptor = DESCRIPTOR.to_vec();
        // turn the first IN endpoint into an interrupt endpoint and append a bulk IN 0x83/512
        descriptor[21] = 0x03;
        descriptor.extend_from_slice(&[0x07, 0x05, 0x83, 0x02, 0x00, 0x02, 0x00]);
        let endpoints = parse_endpoints(&descriptor).unwrap();
        assert_eq!(endpoints.bulk_in, 0x83);
        assert_eq!(endpoints.bulk_packet_size, 512);
    }

    #[test]
    fn test_parse_endpoints_errors() {
        assert_eq!(parse_endpoints(&DESCRIPTOR[..18]), Err(EndpointDiscoveryError::NoBulkIn));
        assert_eq!(
            parse_endpoints(&DESCRIPTOR[..22]),
            Err(EndpointDiscoveryError::Malformed { offset: 18 })
        );
        // zero-length entry terminates the walk instead of looping forever
        assert_eq!(parse_endpoints(&[0u8; 64]), Err(EndpointDiscoveryError::NoBulkIn));
    }

    struct FakeQueue {
        pending: usize,
        late: usize,
    }

    impl TransferQueue for FakeQueue {
        fn pending(&self) -> usize {
            self.pending
        }

        fn reap(&mut self, _timeout: Duration) -> bool {
            if self.late > 0 {
                self.late -= 1;
                return false;
            }
            self.pending -= 1;
            true
        }
    }

    #[test]
    fn test_drain_leftovers() {
        let mut queue = FakeQueue { pending: 0, late: 0 };
        assert_eq!(drain_leftovers(&mut queue), Ok(0));

        let mut queue = FakeQueue { pending: 2, late: 0 };
        assert_eq!(drain_leftovers(&mut queue), Ok(2));
        assert_eq!(queue.pending, 0);

        // still outstanding: the next read must not stack another transfer on top
        let mut queue = FakeQueue { pending: 1, late: 1 };
        assert_eq!(drain_leftovers(&mut queue), Err(TransferError::Timeout { transferred: 0 }));
        assert_eq!(queue.pending, 1);
        assert_eq!(drain_leftovers(&mut queue), Ok(1));
    }

    #[test]
    fn test_transfer_error_fatality() {
        assert!(TransferError::Stalled.is_fatal());
        assert!(TransferError::NoDevice.is_fatal());
        assert!(!TransferError::Timeout { transferred: 12 }.is_fatal());
        assert!(!TransferError::Failed("overflow".into()).is_fatal());
        assert!(!TransferError::Unaligned { len: 64, packet: 512 }.is_fatal());
    }
}
