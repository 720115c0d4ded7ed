/// A channel is a means of communication with an ANT+ client device. The
/// transceiver supports up to eight; each maps to a single device (or, in
/// scan mode, to every device in range). A `Channel` is a thin handle over
/// the node's command set: it owns the channel number, tracks local state,
/// and carries the handler that receives the channel's broadcast data.
use log::{debug, warn};

use crate::error::ProtocolError;
use crate::message::{ChannelResponseCode, CHANNEL_IN_WRONG_STATE};
use crate::node::Node;

/// Receive (slave) channel type.
pub const CHANNEL_TYPE_RECEIVE: u8 = 0x00;

const DEFAULT_SEARCH_TIMEOUT: u8 = 30;

/// Callbacks a channel delivers from the dispatch thread. Implementations
/// must not block unboundedly; they hold up every other channel's delivery
/// while they run.
pub trait ChannelHandler: Send {
    /// Broadcast payload for this channel: the eight-byte data page plus
    /// the extended trailer when extended messages are enabled.
    fn on_broadcast(&mut self, payload: &[u8]);

    /// Unsolicited channel event (search timeout, rx fail, closed, ...).
    fn on_event(&mut self, _code: ChannelResponseCode) {}
}

/// RF and identity parameters for a channel, builder style.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Config {
    pub(crate) device_id: u16,
    pub(crate) device_type: u8,
    pub(crate) transmission_type: u8,
    pub(crate) channel_type: u8,
    pub(crate) network: u8,
    pub(crate) frequency: u8,
    pub(crate) period: u16,
    pub(crate) timeout: u8,
}

impl Config {
    pub fn new() -> Self {
        Config {
            channel_type: CHANNEL_TYPE_RECEIVE,
            timeout: DEFAULT_SEARCH_TIMEOUT,
            ..Default::default()
        }
    }

    pub fn device_id(mut self, device_id: u16) -> Self {
        self.device_id = device_id;
        self
    }

    pub fn device_type(mut self, device_type: u8) -> Self {
        self.device_type = device_type;
        self
    }

    pub fn transmission_type(mut self, transmission_type: u8) -> Self {
        self.transmission_type = transmission_type;
        self
    }

    pub fn channel_type(mut self, channel_type: u8) -> Self {
        self.channel_type = channel_type;
        self
    }

    pub fn network(mut self, network: u8) -> Self {
        self.network = network;
        self
    }

    pub fn frequency(mut self, frequency: u8) -> Self {
        self.frequency = frequency;
        self
    }

    pub fn period(mut self, period: u16) -> Self {
        self.period = period;
        self
    }

    pub fn timeout(mut self, timeout: u8) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Local view of the channel lifecycle. Transitions are driven only by
/// acknowledged commands on this handle.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ChannelState {
    Closed,
    Assigned,
    Opening,
    Open,
    Closing,
}

pub struct Channel<'a> {
    node: &'a Node,
    number: u8,
    state: ChannelState,
    config: Config,
    released: bool,
}

impl<'a> Channel<'a> {
    pub(crate) fn new(node: &'a Node, number: u8, config: Config) -> Channel<'a> {
        Channel {
            node,
            number,
            state: ChannelState::Closed,
            config,
            released: false,
        }
    }

    pub fn number(&self) -> u8 {
        self.number
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    /// Configure and open the channel for its paired device: assign, set
    /// id, set period, set frequency, open — in that order, each step
    /// acknowledged before the next is sent. The first failure aborts and
    /// leaves the state at whatever the device last acknowledged.
    pub fn open(&mut self, handler: Box<dyn ChannelHandler>) -> Result<(), ProtocolError> {
        self.check_closed()?;
        if !self.node.network_keyed(self.config.network) {
            return Err(ProtocolError::NetworkNotKeyed(self.config.network));
        }
        self.node
            .assign_channel(self.number, self.config.channel_type, self.config.network)?;
        self.state = ChannelState::Assigned;
        self.node.set_channel_id(
            self.number,
            self.config.device_id,
            self.config.device_type,
            self.config.transmission_type,
        )?;
        self.node.set_channel_period(self.number, self.config.period)?;
        self.node
            .set_channel_frequency(self.number, self.config.frequency)?;
        // Broadcasts may arrive as soon as the open is acknowledged, so
        // the handler goes in first.
        self.node.register_handler(self.number, handler);
        self.state = ChannelState::Opening;
        self.node.open_channel(self.number)?;
        self.state = ChannelState::Open;
        debug!("Channel {} open", self.number);
        Ok(())
    }

    /// Open the channel in continuous scan mode: wildcard id, extended
    /// broadcasts enabled so each frame carries the transmitting client's
    /// identity. Scan mode takes over the radio's receive path entirely.
    pub fn open_scan(&mut self, handler: Box<dyn ChannelHandler>) -> Result<(), ProtocolError> {
        self.check_closed()?;
        if !self.node.network_keyed(self.config.network) {
            return Err(ProtocolError::NetworkNotKeyed(self.config.network));
        }
        self.node
            .assign_channel(self.number, self.config.channel_type, self.config.network)?;
        self.state = ChannelState::Assigned;
        self.node.set_channel_id(self.number, 0, 0, 0)?;
        self.node
            .set_channel_frequency(self.number, self.config.frequency)?;
        self.node.enable_extended_messages(true)?;
        self.node.register_handler(self.number, handler);
        self.state = ChannelState::Opening;
        self.node.open_rx_scan_mode()?;
        self.state = ChannelState::Open;
        debug!("Channel {} scanning", self.number);
        Ok(())
    }

    /// Configure the high-priority search timeout (units of 2.5s) on an
    /// assigned channel.
    pub fn set_search_timeout(&mut self, timeout: u8) -> Result<(), ProtocolError> {
        self.node.set_hp_search_timeout(self.number, timeout)?;
        self.config.timeout = timeout;
        Ok(())
    }

    /// Close the channel. Local state always ends `Closed` and the channel
    /// number returns to the pool; a device-side error surfaces only while
    /// the engine is still running, otherwise it is logged and swallowed.
    pub fn close(&mut self) -> Result<(), ProtocolError> {
        if self.state == ChannelState::Closed {
            self.release();
            return Ok(());
        }
        let was_open = matches!(self.state, ChannelState::Opening | ChannelState::Open);
        self.state = ChannelState::Closing;
        let mut result = Ok(());
        if was_open {
            if let Err(e) = self.node.close_channel(self.number) {
                if self.node.is_running() {
                    result = Err(e);
                } else {
                    warn!("Error closing channel {} during teardown: {}", self.number, e);
                }
            }
        }
        if let Err(e) = self.node.unassign_channel(self.number) {
            debug!("Error unassigning channel {}: {}", self.number, e);
        }
        self.state = ChannelState::Closed;
        self.release();
        result
    }

    fn check_closed(&self) -> Result<(), ProtocolError> {
        if self.state != ChannelState::Closed || self.released {
            // Mirrors the code the device itself reports for this.
            return Err(ProtocolError::DeviceRejected(CHANNEL_IN_WRONG_STATE));
        }
        Ok(())
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.node.release_channel(self.number);
        }
    }
}

impl Drop for Channel<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("Error closing channel {}: {}", self.number, e);
        }
    }
}
