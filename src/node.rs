/// The node protocol engine turns the pump's raw frame stream into a
/// synchronous command API plus an asynchronous broadcast/event stream.
///
/// One command is in flight at a time: callers serialize behind the command
/// gate and park on a one-slot reply channel while the dispatch worker
/// correlates incoming frames against the pending command. Everything that
/// is not an awaited reply — broadcast data, unsolicited channel events —
/// is routed by channel number to the registered handler on the dispatch
/// thread, never on the read worker.
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, error, trace};

use crate::channel::{Channel, ChannelHandler, Config};
use crate::device::ANTPLUS_NETWORK_KEY;
use crate::error::{ProtocolError, TransportError};
use crate::message::{
    self, BroadcastDataMessage, ChannelResponseMessage, Message, StartupMessage, StartupReason,
    MESG_BROADCAST_DATA_ID, MESG_RESPONSE_EVENT_ID, MESG_STARTUP_MESG_ID, RESPONSE_NO_ERROR,
};
use crate::pump::Pump;
use crate::usb::{Context, UsbContext, UsbIdentity, UsbTransport};

pub const MAX_CHANNELS: usize = 8;
pub const MAX_NETWORKS: usize = 8;

const RESPONSE_TIMEOUT: Duration = Duration::from_secs(2);
const DISPATCH_POLL: Duration = Duration::from_millis(50);

/// Correlation for the single outstanding command.
enum Expected {
    /// A reply frame with this message id (requested messages, startup).
    Reply(u8),
    /// A channel-response frame acknowledging this command on this channel.
    ChannelAck { channel: u8, msg_id: u8 },
}

struct PendingCommand {
    expected: Expected,
    reply: Sender<Message>,
}

impl PendingCommand {
    fn matches(&self, mesg: &Message) -> bool {
        match self.expected {
            Expected::Reply(id) => mesg.id == id,
            Expected::ChannelAck { channel, msg_id } => {
                mesg.id == MESG_RESPONSE_EVENT_ID
                    && mesg.data.len() >= 3
                    && mesg.data[0] == channel
                    && mesg.data[1] == msg_id
            }
        }
    }
}

struct Shared {
    running: AtomicBool,
    pending: Mutex<Option<PendingCommand>>,
    handlers: Mutex<HashMap<u8, Box<dyn ChannelHandler>>>,
}

pub struct Node {
    pump: Pump,
    shared: Arc<Shared>,
    dispatch: Mutex<Option<JoinHandle<()>>>,
    dispatch_thread: ThreadId,
    command_gate: Mutex<()>,
    response_timeout: Duration,
    channels_in_use: Mutex<[bool; MAX_CHANNELS]>,
    networks_keyed: Mutex<[bool; MAX_NETWORKS]>,
}

impl Node {
    /// Take ownership of a pump and its frame queue and start the dispatch
    /// worker.
    pub fn new(pump: Pump, frames: Receiver<Message>) -> Node {
        let shared = Arc::new(Shared {
            running: AtomicBool::new(true),
            pending: Mutex::new(None),
            handlers: Mutex::new(HashMap::new()),
        });
        let dispatch = {
            let shared = shared.clone();
            thread::spawn(move || dispatch_loop(&shared, frames))
        };
        let dispatch_thread = dispatch.thread().id();
        Node {
            pump,
            shared,
            dispatch: Mutex::new(Some(dispatch)),
            dispatch_thread,
            command_gate: Mutex::new(()),
            response_timeout: RESPONSE_TIMEOUT,
            channels_in_use: Mutex::new([false; MAX_CHANNELS]),
            networks_keyed: Mutex::new([false; MAX_NETWORKS]),
        }
    }

    /// Find the transceiver on the USB bus and bring the whole stack up:
    /// transport, pump, engine, a device reset, and the ANT+ network key
    /// programmed into slot 0. Tears back down on a partial failure.
    pub fn open(identity: UsbIdentity) -> Result<Node, ProtocolError> {
        let mut ctx = Context::new().map_err(TransportError::from)?;
        let transport = UsbTransport::open(&mut ctx, identity)?;
        let (pump, frames) = Pump::new(Box::new(transport));
        let node = Node::new(pump, frames);
        let bring_up = node
            .reset_system()
            .and_then(|_| node.set_network_key(0, &ANTPLUS_NETWORK_KEY));
        if let Err(e) = bring_up {
            if let Err(stop_err) = node.stop() {
                debug!("Teardown after failed bring-up: {}", stop_err);
            }
            return Err(e);
        }
        Ok(node)
    }

    /// How long a synchronous command waits for its reply.
    pub fn set_response_timeout(&mut self, timeout: Duration) {
        self.response_timeout = timeout;
    }

    /// Reset the device and wait for its startup message.
    pub fn reset_system(&self) -> Result<StartupReason, ProtocolError> {
        let reply = self.command(message::reset(), Expected::Reply(MESG_STARTUP_MESG_ID))?;
        let startup = StartupMessage(reply.data.first().copied().unwrap_or(0));
        debug!("Device restarted: {:?}", startup.reason());
        Ok(startup.reason())
    }

    /// Request a message from the device and return the reply payload.
    /// The reply is correlated by the requested message id.
    pub fn request_message(&self, channel: u8, id: u8) -> Result<Vec<u8>, ProtocolError> {
        let reply = self.command(message::request_message(channel, id), Expected::Reply(id))?;
        Ok(reply.data)
    }

    /// Program an eight-byte network key into one of the device's network
    /// slots. Channels assigned to that network may open afterwards.
    pub fn set_network_key(&self, network: u8, key: &[u8; 8]) -> Result<(), ProtocolError> {
        if network as usize >= MAX_NETWORKS {
            return Err(ProtocolError::InvalidNetwork(network));
        }
        self.channel_command(message::set_network_key(network, key))?;
        self.networks_keyed.lock().unwrap()[network as usize] = true;
        Ok(())
    }

    pub fn assign_channel(
        &self,
        channel: u8,
        channel_type: u8,
        network: u8,
    ) -> Result<(), ProtocolError> {
        self.channel_command(message::assign_channel(channel, channel_type, network))
    }

    pub fn unassign_channel(&self, channel: u8) -> Result<(), ProtocolError> {
        self.channel_command(message::unassign_channel(channel))
    }

    pub fn set_channel_id(
        &self,
        channel: u8,
        device_id: u16,
        device_type: u8,
        transmission_type: u8,
    ) -> Result<(), ProtocolError> {
        self.channel_command(message::set_channel_id(
            channel,
            device_id,
            device_type,
            transmission_type,
        ))
    }

    pub fn set_channel_period(&self, channel: u8, period: u16) -> Result<(), ProtocolError> {
        self.channel_command(message::set_channel_period(channel, period))
    }

    pub fn set_channel_frequency(&self, channel: u8, frequency: u8) -> Result<(), ProtocolError> {
        self.channel_command(message::set_channel_frequency(channel, frequency))
    }

    pub fn set_hp_search_timeout(&self, channel: u8, timeout: u8) -> Result<(), ProtocolError> {
        self.channel_command(message::set_hp_search_timeout(channel, timeout))
    }

    /// Open a configured channel. Returns once the device acknowledges the
    /// command; broadcast data follows asynchronously.
    pub fn open_channel(&self, channel: u8) -> Result<(), ProtocolError> {
        self.channel_command(message::open_channel(channel))
    }

    pub fn close_channel(&self, channel: u8) -> Result<(), ProtocolError> {
        self.channel_command(message::close_channel(channel))
    }

    /// Put the radio in continuous scan mode on channel 0, receiving from
    /// every client in range.
    pub fn open_rx_scan_mode(&self) -> Result<(), ProtocolError> {
        self.channel_command(message::open_rx_scan_mode())
    }

    /// Toggle extended broadcasts carrying the transmitting client's id.
    pub fn enable_extended_messages(&self, enable: bool) -> Result<(), ProtocolError> {
        self.channel_command(message::enable_extended_messages(enable))
    }

    /// Allocate the lowest free channel number. The channel is configured
    /// and opened through the returned handle.
    pub fn channel(&self, config: Config) -> Result<Channel<'_>, ProtocolError> {
        let mut in_use = self.channels_in_use.lock().unwrap();
        let number = in_use
            .iter()
            .position(|used| !used)
            .ok_or(ProtocolError::NoFreeChannel)? as u8;
        in_use[number as usize] = true;
        Ok(Channel::new(self, number, config))
    }

    /// Stop the engine: cancel any blocked command waiter, join the
    /// dispatch worker, then stop the pump and close the transport. Every
    /// step runs regardless of earlier failures. Idempotent.
    pub fn stop(&self) -> Result<(), ProtocolError> {
        self.shared.running.store(false, Ordering::SeqCst);
        // Dropping the pending slot wakes a parked caller with Cancelled.
        self.shared.pending.lock().unwrap().take();
        let dispatch = self.dispatch.lock().unwrap().take();
        if let Some(worker) = dispatch {
            if thread::current().id() == self.dispatch_thread {
                // stop() from inside a handler runs on the dispatch thread;
                // the loop exits on its own once the handler returns.
                debug!("stop() on the dispatch thread, skipping join");
            } else if worker.join().is_err() {
                error!("Dispatch worker panicked");
            }
        }
        self.pump.stop()?;
        Ok(())
    }

    pub(crate) fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    pub(crate) fn network_keyed(&self, network: u8) -> bool {
        (network as usize) < MAX_NETWORKS && self.networks_keyed.lock().unwrap()[network as usize]
    }

    pub(crate) fn register_handler(&self, channel: u8, handler: Box<dyn ChannelHandler>) {
        self.shared.handlers.lock().unwrap().insert(channel, handler);
    }

    pub(crate) fn release_channel(&self, channel: u8) {
        self.shared.handlers.lock().unwrap().remove(&channel);
        if let Some(used) = self
            .channels_in_use
            .lock()
            .unwrap()
            .get_mut(channel as usize)
        {
            *used = false;
        }
    }

    /// Send a channel-scoped command and check the acknowledgement code.
    fn channel_command(&self, mesg: Message) -> Result<(), ProtocolError> {
        let channel = mesg.data.first().copied().unwrap_or(0);
        let msg_id = mesg.id;
        let reply = self.command(mesg, Expected::ChannelAck { channel, msg_id })?;
        match reply.data.get(2) {
            Some(&RESPONSE_NO_ERROR) => Ok(()),
            Some(&code) => Err(ProtocolError::DeviceRejected(code)),
            None => Err(ProtocolError::UnexpectedResponse(reply.id)),
        }
    }

    /// Send one command and wait for its correlated reply. Commands are
    /// strictly serialized; the pending slot holds at most one waiter.
    fn command(&self, mesg: Message, expected: Expected) -> Result<Message, ProtocolError> {
        let _gate = self.command_gate.lock().unwrap();
        if !self.is_running() {
            return Err(ProtocolError::Cancelled);
        }
        let (reply_tx, reply_rx) = bounded(1);
        *self.shared.pending.lock().unwrap() = Some(PendingCommand {
            expected,
            reply: reply_tx,
        });
        if let Err(e) = self.pump.send(&mesg) {
            self.shared.pending.lock().unwrap().take();
            return Err(e.into());
        }
        match reply_rx.recv_timeout(self.response_timeout) {
            Ok(reply) => Ok(reply),
            Err(RecvTimeoutError::Timeout) => {
                self.shared.pending.lock().unwrap().take();
                if !self.is_running() {
                    return Err(ProtocolError::Cancelled);
                }
                Err(ProtocolError::Timeout)
            }
            Err(RecvTimeoutError::Disconnected) => Err(ProtocolError::Cancelled),
        }
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            debug!("Error during engine teardown: {}", e);
        }
    }
}

fn dispatch_loop(shared: &Shared, frames: Receiver<Message>) {
    while shared.running.load(Ordering::SeqCst) {
        let mesg = match frames.recv_timeout(DISPATCH_POLL) {
            Ok(mesg) => mesg,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };
        route(shared, mesg);
    }
    // Unblock a caller still parked on a reply.
    shared.pending.lock().unwrap().take();
    debug!("Dispatch worker exited");
}

fn route(shared: &Shared, mesg: Message) {
    trace!("Routing frame: {:?}", mesg);
    match mesg.id {
        MESG_BROADCAST_DATA_ID => match BroadcastDataMessage::from(&mesg.data) {
            Some(broadcast) => {
                let channel = broadcast.channel();
                match shared.handlers.lock().unwrap().get_mut(&channel) {
                    Some(handler) => handler.on_broadcast(broadcast.payload()),
                    None => debug!("Broadcast on unhandled channel {}", channel),
                }
            }
            None => debug!("Short broadcast frame: {:?}", mesg),
        },
        MESG_RESPONSE_EVENT_ID => match ChannelResponseMessage::from(&mesg.data) {
            Some(response) if response.is_event() => {
                let channel = response.channel();
                match shared.handlers.lock().unwrap().get_mut(&channel) {
                    Some(handler) => handler.on_event(response.code()),
                    None => debug!(
                        "Event {:?} on unhandled channel {}",
                        response.code(),
                        channel
                    ),
                }
            }
            Some(_) => deliver_reply(shared, mesg),
            None => debug!("Short channel response: {:?}", mesg),
        },
        _ => deliver_reply(shared, mesg),
    }
}

/// Hand a frame to the pending command if it matches the expected
/// correlation; otherwise drop it. A stray frame never fulfils a wait.
fn deliver_reply(shared: &Shared, mesg: Message) {
    let mut pending = shared.pending.lock().unwrap();
    match pending.take() {
        Some(waiter) if waiter.matches(&mesg) => {
            let _ = waiter.reply.send(mesg);
        }
        Some(waiter) => {
            *pending = Some(waiter);
            debug!("Dropping unmatched frame: {:?}", mesg);
        }
        None => debug!("Dropping frame with no waiter: {:?}", mesg),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::message::{MESG_CAPABILITIES_ID, MESG_OPEN_CHANNEL_ID};

    fn pending(expected: Expected) -> (PendingCommand, Receiver<Message>) {
        let (reply, rx) = bounded(1);
        (PendingCommand { expected, reply }, rx)
    }

    #[test]
    fn reply_correlation_is_by_message_id() {
        let (waiter, _rx) = pending(Expected::Reply(MESG_CAPABILITIES_ID));
        assert!(waiter.matches(&Message::new(MESG_CAPABILITIES_ID, &[8, 8])));
        assert!(!waiter.matches(&Message::new(MESG_STARTUP_MESG_ID, &[0])));
    }

    #[test]
    fn channel_ack_correlation_checks_channel_and_command() {
        let (waiter, _rx) = pending(Expected::ChannelAck {
            channel: 2,
            msg_id: MESG_OPEN_CHANNEL_ID,
        });
        assert!(waiter.matches(&Message::new(
            MESG_RESPONSE_EVENT_ID,
            &[2, MESG_OPEN_CHANNEL_ID, 0]
        )));
        // Wrong channel.
        assert!(!waiter.matches(&Message::new(
            MESG_RESPONSE_EVENT_ID,
            &[1, MESG_OPEN_CHANNEL_ID, 0]
        )));
        // Wrong initiating command.
        assert!(!waiter.matches(&Message::new(
            MESG_RESPONSE_EVENT_ID,
            &[2, MESG_CAPABILITIES_ID, 0]
        )));
        // Broadcast data is never an acknowledgement.
        assert!(!waiter.matches(&Message::new(
            MESG_BROADCAST_DATA_ID,
            &[2, MESG_OPEN_CHANNEL_ID, 0]
        )));
    }
}
