/// USB byte transport for ANT+ radio sticks, built on rusb. Finds the
/// device by vendor/product id, claims interface 0, and discovers the
/// first bulk IN and OUT endpoints on alternate setting 0.
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

pub use rusb::{Context, UsbContext};
use rusb::{DeviceHandle, Direction, TransferType};

use crate::error::TransportError;
use crate::transport::Transport;

const USB_INTERFACE: u8 = 0;
const WRITE_TIMEOUT: Duration = Duration::from_secs(1);

/// Vendor and product ids identifying a transceiver stick on the bus.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct UsbIdentity {
    pub vendor: u16,
    pub product: u16,
}

/// The Dynastream ANT USB-m stick.
pub const ANT_USB_M: UsbIdentity = UsbIdentity {
    vendor: 0x0FCF,
    product: 0x1009,
};

/// The older ANT USB2 stick.
pub const ANT_USB_2: UsbIdentity = UsbIdentity {
    vendor: 0x0FCF,
    product: 0x1008,
};

/// An open handle to the transceiver's bulk endpoints.
pub struct UsbTransport<T: UsbContext> {
    handle: DeviceHandle<T>,
    endpoint_in: u8,
    endpoint_out: u8,
    closed: AtomicBool,
}

impl<T: UsbContext> UsbTransport<T> {
    /// Find the first device matching `identity`, claim its interface,
    /// and locate the bulk endpoints.
    pub fn open(ctx: &mut T, identity: UsbIdentity) -> Result<UsbTransport<T>, TransportError> {
        for device in ctx.devices()?.iter() {
            let desc = device.device_descriptor()?;
            if desc.vendor_id() != identity.vendor || desc.product_id() != identity.product {
                continue;
            }
            log::debug!(
                "Using USB device {:04x}:{:04x} on bus {}",
                identity.vendor,
                identity.product,
                device.bus_number()
            );
            let mut handle = device.open()?;
            // Some backends cannot reset; carry on with the handle we have.
            if let Err(e) = handle.reset() {
                log::warn!("Could not reset the USB device: {}", e);
            }
            handle.claim_interface(USB_INTERFACE)?;

            let config = device.active_config_descriptor()?;
            let (endpoint_in, endpoint_out) = bulk_endpoints(&config)?;
            log::debug!(
                "USB endpoints in: {:#04x} out: {:#04x}",
                endpoint_in,
                endpoint_out
            );
            return Ok(UsbTransport {
                handle,
                endpoint_in,
                endpoint_out,
                closed: AtomicBool::new(false),
            });
        }
        Err(TransportError::Io(rusb::Error::NoDevice))
    }

    fn check_open(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::DeviceClosed);
        }
        Ok(())
    }
}

/// First bulk IN and first bulk OUT endpoint on interface 0, alternate
/// setting 0.
fn bulk_endpoints(config: &rusb::ConfigDescriptor) -> Result<(u8, u8), TransportError> {
    let mut endpoint_in = None;
    let mut endpoint_out = None;
    let interface = config
        .interfaces()
        .next()
        .ok_or(TransportError::EndpointNotFound)?;
    let descriptor = interface
        .descriptors()
        .next()
        .ok_or(TransportError::EndpointNotFound)?;
    for endpoint in descriptor.endpoint_descriptors() {
        if endpoint.transfer_type() != TransferType::Bulk {
            continue;
        }
        match endpoint.direction() {
            Direction::In => endpoint_in.get_or_insert(endpoint.address()),
            Direction::Out => endpoint_out.get_or_insert(endpoint.address()),
        };
    }
    match (endpoint_in, endpoint_out) {
        (Some(i), Some(o)) => Ok((i, o)),
        _ => Err(TransportError::EndpointNotFound),
    }
}

impl<T: UsbContext> Transport for UsbTransport<T> {
    fn read(&self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError> {
        self.check_open()?;
        Ok(self.handle.read_bulk(self.endpoint_in, buf, timeout)?)
    }

    fn write(&self, data: &[u8]) -> Result<usize, TransportError> {
        self.check_open()?;
        Ok(self.handle.write_bulk(self.endpoint_out, data, WRITE_TIMEOUT)?)
    }

    fn close(&self) -> Result<(), TransportError> {
        // The claimed interface and handle are released when the transport
        // drops; closing only fences further i/o.
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
