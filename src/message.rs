/// Message module provides the ANT wire framing: encoding messages to send
/// to the ANT+ USB device, and incrementally decoding frames back out of the
/// raw byte stream the device produces. USB bulk reads return arbitrary
/// chunk boundaries, so `decode` reports how many bytes it consumed and
/// whether it needs more, letting the pump slide its buffer window.
use std::fmt;

use crate::error::DecodeError;

pub const MESG_TX_SYNC: u8 = 0xA4;
pub const MESG_RX_SYNC: u8 = 0xA5;
pub const MESG_SYNC_SIZE: usize = 1;
pub const MESG_SIZE_SIZE: usize = 1;
pub const MESG_ID_SIZE: usize = 1;
pub const MESG_CHANNEL_NUM_SIZE: usize = 1;
pub const MESG_EXT_MESG_BF_SIZE: usize = 1;
pub const MESG_CHECKSUM_SIZE: usize = 1;

pub const MESG_ANT_MAX_PAYLOAD_SIZE: usize = 8;
pub const MESG_EXT_DEVICE_ID_SIZE: usize = 4;
pub const MESG_EXT_STRING_SIZE: usize = 27;
pub const MESG_MAX_EXT_DATA_SIZE: usize = MESG_EXT_DEVICE_ID_SIZE + MESG_EXT_STRING_SIZE;
pub const MESG_MAX_DATA_SIZE: usize = MESG_CHANNEL_NUM_SIZE
    + MESG_ANT_MAX_PAYLOAD_SIZE
    + MESG_EXT_MESG_BF_SIZE
    + MESG_MAX_EXT_DATA_SIZE;
pub const MESG_HEADER_SIZE: usize = MESG_SYNC_SIZE + MESG_SIZE_SIZE + MESG_ID_SIZE;
pub const MESG_MAX_SIZE: usize = MESG_HEADER_SIZE + MESG_MAX_DATA_SIZE + MESG_CHECKSUM_SIZE;
pub const MESG_SIZE_OFFSET: usize = MESG_SYNC_SIZE;
pub const MESG_ID_OFFSET: usize = MESG_SYNC_SIZE + MESG_SIZE_SIZE;
pub const MESG_DATA_OFFSET: usize = MESG_HEADER_SIZE;

pub const RESPONSE_NO_ERROR: u8 = 0x00;
pub const MESG_EVENT_ID: u8 = 0x01;
pub const MESG_RESPONSE_EVENT_ID: u8 = 0x40;
pub const MESG_UNASSIGN_CHANNEL_ID: u8 = 0x41;
pub const MESG_ASSIGN_CHANNEL_ID: u8 = 0x42;
pub const MESG_CHANNEL_MESG_PERIOD_ID: u8 = 0x43;
pub const MESG_CHANNEL_SEARCH_TIMEOUT_ID: u8 = 0x44;
pub const MESG_CHANNEL_RADIO_FREQ_ID: u8 = 0x45;
pub const MESG_NETWORK_KEY_ID: u8 = 0x46;
pub const MESG_RESET: u8 = 0x4A;
pub const MESG_OPEN_CHANNEL_ID: u8 = 0x4B;
pub const MESG_CLOSE_CHANNEL_ID: u8 = 0x4C;
pub const MESG_REQUEST: u8 = 0x4D;
pub const MESG_BROADCAST_DATA_ID: u8 = 0x4E;
pub const MESG_ACKNOWLEDGE_DATA_ID: u8 = 0x4F;
pub const MESG_CHANNEL_ID_ID: u8 = 0x51;
pub const MESG_CAPABILITIES_ID: u8 = 0x54;
pub const MESG_OPEN_RX_SCAN_MODE_ID: u8 = 0x5B;
pub const MESG_ENABLE_EXT_RX_MESGS_ID: u8 = 0x66;
pub const MESG_STARTUP_MESG_ID: u8 = 0x6F;

pub const EVENT_RX_SEARCH_TIMEOUT: u8 = 0x01;
pub const EVENT_RX_FAIL: u8 = 0x02;
pub const EVENT_CHANNEL_CLOSED: u8 = 0x07;
pub const CHANNEL_IN_WRONG_STATE: u8 = 0x15;

// Extended broadcast flag byte indicating the device id trails the payload.
const EXT_FLAG_DEVICE_ID: u8 = 0x80;

/// A single ANT message: one byte id plus the unframed data bytes.
#[derive(Clone, PartialEq)]
pub struct Message {
    pub id: u8,
    pub data: Vec<u8>,
}

impl Message {
    pub fn new(id: u8, data: &[u8]) -> Message {
        Message {
            id,
            data: data.to_vec(),
        }
    }

    /// Frames the message for the wire: sync, length, id, data, then an
    /// XOR checksum over everything before it.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(MESG_HEADER_SIZE + self.data.len() + MESG_CHECKSUM_SIZE);
        buf.push(MESG_TX_SYNC);
        buf.push(self.data.len() as u8);
        buf.push(self.id);
        buf.extend_from_slice(&self.data);
        let checksum = buf.iter().fold(0, |acc, b| acc ^ b);
        buf.push(checksum);
        buf
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self.id {
            MESG_STARTUP_MESG_ID => "Startup",
            MESG_CAPABILITIES_ID => "Capabilities",
            MESG_RESPONSE_EVENT_ID => "ChannelResponse",
            MESG_BROADCAST_DATA_ID => "BroadcastData",
            MESG_CHANNEL_ID_ID => "ChannelId",
            _ => "Message",
        };
        write!(f, "{}({:#04x}) {:x?}", name, self.id, self.data)
    }
}

/// Decode one frame from the front of `buf`.
///
/// Scans for the sync byte, discarding any garbage before it: a successful
/// decode consumes garbage plus frame. Returns `NeedMoreData` while the
/// frame is incomplete. A checksum mismatch or an impossible length byte
/// reports how many bytes to skip so the stream resyncs one byte past the
/// offending sync byte.
pub fn decode(buf: &[u8]) -> Result<(Message, usize), DecodeError> {
    let start = match buf.iter().position(|&b| b == MESG_TX_SYNC) {
        Some(i) => i,
        // No sync byte anywhere means no partial frame either.
        None if buf.is_empty() => return Err(DecodeError::NeedMoreData),
        None => return Err(DecodeError::Malformed { skip: buf.len() }),
    };
    let frame = &buf[start..];
    if frame.len() < MESG_HEADER_SIZE {
        return Err(DecodeError::NeedMoreData);
    }
    let len = frame[MESG_SIZE_OFFSET] as usize;
    if len > MESG_MAX_DATA_SIZE {
        return Err(DecodeError::Malformed { skip: start + 1 });
    }
    let total = MESG_HEADER_SIZE + len + MESG_CHECKSUM_SIZE;
    if frame.len() < total {
        return Err(DecodeError::NeedMoreData);
    }
    // XOR over the whole frame including the checksum byte comes out zero
    // when the checksum is good.
    if frame[..total].iter().fold(0, |acc, b| acc ^ b) != 0 {
        return Err(DecodeError::Checksum { skip: start + 1 });
    }
    let message = Message::new(
        frame[MESG_ID_OFFSET],
        &frame[MESG_DATA_OFFSET..total - MESG_CHECKSUM_SIZE],
    );
    Ok((message, start + total))
}

/// Reason reported by the device in a startup message.
#[derive(Debug, PartialEq)]
pub enum StartupReason {
    PowerOnReset,
    HardwareResetLine,
    WatchDogReset,
    CommandReset,
    SynchronousReset,
    SuspendReset,
    Error,
}

#[derive(Debug, PartialEq)]
pub struct StartupMessage(pub u8);

impl StartupMessage {
    pub fn reason(&self) -> StartupReason {
        match self.0 {
            0x00 => StartupReason::PowerOnReset,
            0x01 => StartupReason::HardwareResetLine,
            0x02 => StartupReason::WatchDogReset,
            0x20 => StartupReason::CommandReset,
            0x40 => StartupReason::SynchronousReset,
            0x80 => StartupReason::SuspendReset,
            _ => StartupReason::Error,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ChannelResponseCode {
    ResponseNoError,
    EventRxSearchTimeout,
    EventRxFail,
    EventTx,
    EventTransferTxCompleted,
    EventTransferTxFailed,
    EventChannelClosed,
    EventRxFailGoToSearch,
    ChannelCollision,
    ChannelInWrongState,
    Other(u8),
}

impl ChannelResponseCode {
    pub fn from_code(code: u8) -> Self {
        match code {
            0x00 => ChannelResponseCode::ResponseNoError,
            0x01 => ChannelResponseCode::EventRxSearchTimeout,
            0x02 => ChannelResponseCode::EventRxFail,
            0x03 => ChannelResponseCode::EventTx,
            0x05 => ChannelResponseCode::EventTransferTxCompleted,
            0x06 => ChannelResponseCode::EventTransferTxFailed,
            0x07 => ChannelResponseCode::EventChannelClosed,
            0x08 => ChannelResponseCode::EventRxFailGoToSearch,
            0x09 => ChannelResponseCode::ChannelCollision,
            0x15 => ChannelResponseCode::ChannelInWrongState,
            code => ChannelResponseCode::Other(code),
        }
    }
}

/// Channel response or event frame: [channel, initiating message id, code].
/// An initiating id of `MESG_EVENT_ID` marks an unsolicited channel event
/// rather than a command acknowledgement.
#[derive(Debug, PartialEq)]
pub struct ChannelResponseMessage([u8; 3]);

impl ChannelResponseMessage {
    pub fn from(mesg: &[u8]) -> Option<Self> {
        if mesg.len() < 3 {
            return None;
        }
        Some(Self([mesg[0], mesg[1], mesg[2]]))
    }

    pub fn channel(&self) -> u8 {
        self.0[0]
    }

    pub fn message_id(&self) -> u8 {
        self.0[1]
    }

    pub fn is_event(&self) -> bool {
        self.0[1] == MESG_EVENT_ID
    }

    pub fn raw_code(&self) -> u8 {
        self.0[2]
    }

    pub fn code(&self) -> ChannelResponseCode {
        ChannelResponseCode::from_code(self.0[2])
    }
}

/// Broadcast data frame: channel number, eight data bytes, and in extended
/// mode a flag byte plus the transmitting client's id.
#[derive(Clone, Debug, PartialEq)]
pub struct BroadcastDataMessage(Vec<u8>);

impl BroadcastDataMessage {
    pub fn from(mesg: &[u8]) -> Option<Self> {
        if mesg.len() < MESG_CHANNEL_NUM_SIZE + MESG_ANT_MAX_PAYLOAD_SIZE {
            return None;
        }
        Some(Self(mesg.to_vec()))
    }

    pub fn channel(&self) -> u8 {
        self.0[0]
    }

    /// The eight-byte data page.
    pub fn data(&self) -> &[u8] {
        &self.0[1..=MESG_ANT_MAX_PAYLOAD_SIZE]
    }

    /// Everything past the channel byte, extended trailer included.
    pub fn payload(&self) -> &[u8] {
        &self.0[1..]
    }

    /// The transmitting client's (device id, device type, transmission
    /// type) when the extended device-id trailer is present.
    pub fn extended_device_id(&self) -> Option<(u16, u8, u8)> {
        extended_client_id(self.payload())
    }
}

/// Parse the extended device-id trailer out of a channel-stripped
/// broadcast payload: eight data bytes, a flag byte, then the four id
/// bytes when the flag marks them present.
pub fn extended_client_id(payload: &[u8]) -> Option<(u16, u8, u8)> {
    let ext = payload.get(MESG_ANT_MAX_PAYLOAD_SIZE..)?;
    if ext.len() < MESG_EXT_MESG_BF_SIZE + MESG_EXT_DEVICE_ID_SIZE
        || ext[0] & EXT_FLAG_DEVICE_ID == 0
    {
        return None;
    }
    Some((bytes_to_u16(&ext[1..3]), ext[3], ext[4]))
}

pub fn reset() -> Message {
    Message::new(MESG_RESET, &[0])
}

pub fn set_network_key(network: u8, key: &[u8; 8]) -> Message {
    let mut data = vec![network];
    data.extend_from_slice(key);
    Message::new(MESG_NETWORK_KEY_ID, &data)
}

pub fn request_message(channel: u8, id: u8) -> Message {
    Message::new(MESG_REQUEST, &[channel, id])
}

pub fn assign_channel(channel: u8, channel_type: u8, network: u8) -> Message {
    Message::new(MESG_ASSIGN_CHANNEL_ID, &[channel, channel_type, network])
}

pub fn unassign_channel(channel: u8) -> Message {
    Message::new(MESG_UNASSIGN_CHANNEL_ID, &[channel])
}

pub fn set_channel_id(
    channel: u8,
    device_id: u16,
    device_type: u8,
    transmission_type: u8,
) -> Message {
    Message::new(
        MESG_CHANNEL_ID_ID,
        &[
            channel,
            (device_id & 0xFF) as u8,
            ((device_id >> 8) & 0xFF) as u8,
            device_type,
            transmission_type,
        ],
    )
}

pub fn set_hp_search_timeout(channel: u8, timeout: u8) -> Message {
    Message::new(MESG_CHANNEL_SEARCH_TIMEOUT_ID, &[channel, timeout])
}

pub fn set_channel_period(channel: u8, period: u16) -> Message {
    Message::new(
        MESG_CHANNEL_MESG_PERIOD_ID,
        &[channel, (period & 0xFF) as u8, ((period >> 8) & 0xFF) as u8],
    )
}

pub fn set_channel_frequency(channel: u8, frequency: u8) -> Message {
    Message::new(MESG_CHANNEL_RADIO_FREQ_ID, &[channel, frequency])
}

pub fn open_channel(channel: u8) -> Message {
    Message::new(MESG_OPEN_CHANNEL_ID, &[channel])
}

pub fn close_channel(channel: u8) -> Message {
    Message::new(MESG_CLOSE_CHANNEL_ID, &[channel])
}

pub fn open_rx_scan_mode() -> Message {
    Message::new(MESG_OPEN_RX_SCAN_MODE_ID, &[0])
}

pub fn enable_extended_messages(enable: bool) -> Message {
    Message::new(MESG_ENABLE_EXT_RX_MESGS_ID, &[0, enable as u8])
}

// bytes_to_u16 takes a byte slice formatted in [LSB, MSB] and combines the
// two fields together into a single u16.
pub(crate) fn bytes_to_u16(b: &[u8]) -> u16 {
    match b.len() {
        0 => 0,
        1 => b[0] as u16,
        _ => (b[0] as u16) + ((b[1] as u16) << 8),
    }
}

// bytes_to_u32 takes a byte slice of up to four [LSB..MSB] bytes and
// returns the combined u32 value.
pub(crate) fn bytes_to_u32(b: &[u8]) -> u32 {
    b.iter()
        .take(4)
        .enumerate()
        .fold(0, |acc, (i, &byte)| acc + ((byte as u32) << (8 * i)))
}
