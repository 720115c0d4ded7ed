/// Continuous-scan channel that demultiplexes broadcasts by client
/// identity. One channel receives from every ANT+ device in range; the
/// scanner parses each frame's extended device-id trailer, reports a
/// client the first time it is seen, and keeps per-client common data
/// accumulated from the background pages every profile transmits.
use std::collections::HashMap;
use std::time::Instant;

use log::debug;

use crate::channel::{Channel, ChannelHandler, Config};
use crate::device::ANTPLUS_FREQUENCY;
use crate::error::ProtocolError;
use crate::message::{bytes_to_u16, bytes_to_u32, extended_client_id};
use crate::node::Node;

const PAGE_MANUFACTURER_INFO: u8 = 0x50;
const PAGE_PRODUCT_INFO: u8 = 0x51;
const PAGE_BATTERY_STATUS: u8 = 0x52;

/// Identity of a physical client device, fixed once observed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ClientId {
    pub device_id: u16,
    pub device_type: u8,
    pub transmission_type: u8,
}

/// Fields from the common background pages, filled in as the client
/// transmits them.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CommonData {
    pub manufacturer_id: Option<u16>,
    pub model_number: Option<u16>,
    pub hardware_revision: Option<u8>,
    pub software_revision: Option<u8>,
    pub serial_number: Option<u32>,
    pub battery_voltage_fractional: Option<u8>,
    pub battery_status_field: Option<u8>,
}

impl CommonData {
    /// Fold one eight-byte data page into the accumulated fields. Pages
    /// other than the common trio leave the data untouched.
    fn update(&mut self, page: &[u8]) {
        if page.len() < 8 {
            return;
        }
        match page[0] {
            PAGE_MANUFACTURER_INFO => {
                self.hardware_revision = Some(page[3]);
                self.manufacturer_id = Some(bytes_to_u16(&page[4..6]));
                self.model_number = Some(bytes_to_u16(&page[6..8]));
            }
            PAGE_PRODUCT_INFO => {
                self.software_revision = Some(page[3]);
                self.serial_number = Some(bytes_to_u32(&page[4..8]));
            }
            PAGE_BATTERY_STATUS => {
                self.battery_voltage_fractional = Some(page[6]);
                self.battery_status_field = Some(page[7]);
            }
            _ => {}
        }
    }
}

/// Callbacks the scanner invokes from the dispatch thread.
pub trait ScanHandler: Send {
    /// A client transmitted for the first time this session.
    fn on_found(&mut self, client: &ClientId);

    /// Every broadcast, with whatever common data has accumulated so far.
    fn on_update(&mut self, client: &ClientId, common: &CommonData);
}

/// Channel handler that turns raw scan broadcasts into found/update
/// callbacks keyed by client identity.
pub(crate) struct ScanRouter<H: ScanHandler> {
    handler: H,
    seen: HashMap<ClientId, Instant>,
    common: HashMap<ClientId, CommonData>,
}

impl<H: ScanHandler> ScanRouter<H> {
    pub(crate) fn new(handler: H) -> Self {
        ScanRouter {
            handler,
            seen: HashMap::new(),
            common: HashMap::new(),
        }
    }
}

impl<H: ScanHandler> ChannelHandler for ScanRouter<H> {
    fn on_broadcast(&mut self, payload: &[u8]) {
        let client = match extended_client_id(payload) {
            Some((device_id, device_type, transmission_type)) => ClientId {
                device_id,
                device_type,
                transmission_type,
            },
            None => {
                debug!("Scan broadcast without a client identity, dropping");
                return;
            }
        };
        if self.seen.insert(client, Instant::now()).is_none() {
            debug!(
                "Found client {:#06x} type {:#04x}",
                client.device_id, client.device_type
            );
            self.handler.on_found(&client);
        }
        let common = self.common.entry(client).or_default();
        common.update(payload);
        self.handler.on_update(&client, common);
    }
}

/// A scanner owns channel 0 in continuous scan mode for its lifetime.
pub struct Scanner<'a> {
    channel: Channel<'a>,
}

impl<'a> Scanner<'a> {
    /// Open the scan channel. Scan mode claims the whole receive path, so
    /// this requires channel 0 to be free.
    pub fn open<H: ScanHandler + 'static>(
        node: &'a Node,
        handler: H,
    ) -> Result<Scanner<'a>, ProtocolError> {
        let mut channel = node.channel(Config::new().frequency(ANTPLUS_FREQUENCY))?;
        if channel.number() != 0 {
            return Err(ProtocolError::NoFreeChannel);
        }
        channel.open_scan(Box::new(ScanRouter::new(handler)))?;
        Ok(Scanner { channel })
    }

    pub fn close(&mut self) -> Result<(), ProtocolError> {
        self.channel.close()
    }
}
