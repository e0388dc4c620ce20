use crate::daq_terminal::DaqTerminal;
use crate::usb_transport::{EndpointDiscoveryError, TransferError, UsbTransport};
use nusb::{ErrorKind, MaybeFuture};
use std::io;

/// Measurement Computing's USB vendor id.
pub const MCC_VENDOR_ID: u16 = 0x09db;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DaqProduct {
    Usb2001Tc,
    Usb7202,
    Usb7204,
    Usb1608Gx,
    Usb1608Gx2Ao,
    Usb1608FsPlus,
    Usb1208FsPlus,
}

impl DaqProduct {
    pub const ALL: [Self; 7] = [
        Self::Usb2001Tc,
        Self::Usb7202,
        Self::Usb7204,
        Self::Usb1608Gx,
        Self::Usb1608Gx2Ao,
        Self::Usb1608FsPlus,
        Self::Usb1208FsPlus,
    ];

    pub fn product_id(self) -> u16 {
        match self {
            Self::Usb2001Tc => 0x00f9,
            Self::Usb7202 => 0x00f2,
            Self::Usb7204 => 0x00f0,
            Self::Usb1608Gx => 0x0111,
            Self::Usb1608Gx2Ao => 0x0112,
            Self::Usb1608FsPlus => 0x00ea,
            Self::Usb1208FsPlus => 0x00e8,
        }
    }

    pub fn from_product_id(product_id: u16) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.product_id() == product_id)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Usb2001Tc => "USB-2001-TC",
            Self::Usb7202 => "USB-7202",
            Self::Usb7204 => "USB-7204",
            Self::Usb1608Gx => "USB-1608GX",
            Self::Usb1608Gx2Ao => "USB-1608GX-2AO",
            Self::Usb1608FsPlus => "USB-1608-FS-PLUS",
            Self::Usb1208FsPlus => "USB-1208-FS-PLUS",
        }
    }

    /// Analog input channels in single-ended mode.
    pub fn channels(self) -> u8 {
        match self {
            Self::Usb2001Tc => 1,
            Self::Usb7202 | Self::Usb7204 | Self::Usb1608FsPlus | Self::Usb1208FsPlus => 8,
            Self::Usb1608Gx | Self::Usb1608Gx2Ao => 16,
        }
    }

    /// Raw code at full scale, for the models where it is fixed. Others report it via `?AI:RES`.
    pub fn max_counts(self) -> Option<u32> {
        match self {
            Self::Usb7202 | Self::Usb1608FsPlus => Some(0xffff),
            Self::Usb7204 | Self::Usb1208FsPlus => Some(0x0fff),
            Self::Usb2001Tc | Self::Usb1608Gx | Self::Usb1608Gx2Ao => None,
        }
    }
}

impl std::fmt::Display for DaqProduct {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for DaqProduct {
    type Err = DaqConnectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|p| p.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| DaqConnectorError::UnknownProduct(s.to_string()))
    }
}

#[derive(Debug, Clone)]
pub struct DaqDevice {
    pub product: DaqProduct,
    pub bus: String,
    pub address: u8,
    pub serial: Option<String>,
}

impl DaqDevice {
    pub fn name(&self) -> &'static str {
        self.product.name()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DaqConnectorError {
    #[error("USB error: {0}")]
    Usb(#[from] io::Error),

    #[error("Unknown product '{0}'")]
    UnknownProduct(String),

    #[error("No {name} device found. Please connect one and try again")]
    DeviceNotFound { name: &'static str },

    #[error("Permission denied opening {name}")]
    PermissionDenied {
        name: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("Could not open {name}: {source}")]
    OpenFailed {
        name: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("Could not claim the interface of {name}; is it in use by another process?")]
    ClaimFailed {
        name: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("Reading the configuration descriptor failed: {0}")]
    Descriptor(TransferError),

    #[error("Endpoint discovery failed: {0}")]
    EndpointDiscovery(#[from] EndpointDiscoveryError),
}

impl DaqConnectorError {
    fn from_usb(name: &'static str, error: nusb::Error) -> Self {
        Self::classify(name, error.kind(), error.into())
    }

    fn classify(name: &'static str, kind: ErrorKind, source: io::Error) -> Self {
        match kind {
            ErrorKind::PermissionDenied => Self::PermissionDenied { name, source },
            ErrorKind::Busy => Self::ClaimFailed { name, source },
            _ => Self::OpenFailed { name, source },
        }
    }
}

/// Returns the first candidate `claim` succeeds on. When none does, the last failure
/// is reported, or `DeviceNotFound` if there were no candidates.
fn claim_first<T, R>(
    name: &'static str,
    candidates: impl IntoIterator<Item = T>,
    mut claim: impl FnMut(&T) -> Result<R, DaqConnectorError>,
) -> Result<R, DaqConnectorError> {
    let mut last_error = None;
    for candidate in candidates {
        match claim(&candidate) {
            Ok(claimed) => return Ok(claimed),
            Err(e) => {
                log::info!("Skipping {}: {}", name, e);
                last_error = Some(e);
            }
        }
    }
    Err(last_error.unwrap_or(DaqConnectorError::DeviceNotFound { name }))
}

pub struct DaqConnector;

impl DaqConnector {
    /// Opens the first attached `product` whose interface is not claimed yet.
    pub fn connect(product: DaqProduct) -> Result<DaqTerminal, DaqConnectorError> {
        let name = product.name();
        log::debug!("Searching for {} ({:04x}:{:04x})", name, MCC_VENDOR_ID, product.product_id());

        let candidates: Vec<_> = nusb::list_devices()
            .wait()
            .map_err(|e| DaqConnectorError::Usb(e.into()))?
            .filter(|d| d.vendor_id() == MCC_VENDOR_ID && d.product_id() == product.product_id())
            .collect();
        log::debug!("Found {} {} device(s)", candidates.len(), name);

        let interface = claim_first(name, candidates, |info| {
            let device = info
                .open()
                .wait()
                .map_err(|e| DaqConnectorError::from_usb(name, e))?;
            device
                .claim_interface(0)
                .wait()
                .map_err(|e| DaqConnectorError::from_usb(name, e))
        })?;
        log::info!("Claimed {}", name);

        let transport = UsbTransport::new(interface)?;
        Ok(DaqTerminal::new(Box::new(transport)))
    }

    /// Get all attached DAQFlex devices, optionally of one product only.
    pub fn get_available_devices(
        product: Option<DaqProduct>,
    ) -> Result<Vec<DaqDevice>, DaqConnectorError> {
        let devices = nusb::list_devices()
            .wait()
            .map_err(|e| DaqConnectorError::Usb(e.into()))?
            .filter(|d| d.vendor_id() == MCC_VENDOR_ID)
            .filter_map(|d| {
                let found = DaqProduct::from_product_id(d.product_id())?;
                if product.is_some_and(|wanted| wanted != found) {
                    return None;
                }
                Some(DaqDevice {
                    product: found,
                    bus: d.bus_id().to_string(),
                    address: d.device_address(),
                    serial: d.serial_number().map(str::to_string),
                })
            })
            .collect();
        Ok(devices)
    }
}
