use thiserror::Error;

/// Errors from the byte transport underneath the message pump.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("transfer timed out")]
    Timeout,
    #[error("no bulk endpoint found on interface 0")]
    EndpointNotFound,
    #[error("device is closed")]
    DeviceClosed,
    #[error("usb i/o error: {0}")]
    Io(rusb::Error),
}

impl From<rusb::Error> for TransportError {
    fn from(e: rusb::Error) -> Self {
        match e {
            rusb::Error::Timeout => TransportError::Timeout,
            e => TransportError::Io(e),
        }
    }
}

/// Errors from decoding frames out of a raw byte stream. `NeedMoreData` is
/// not a failure: the caller keeps what it has and reads again. The other
/// variants carry the number of bytes to discard so the stream resyncs on
/// the next sync byte instead of wedging.
#[derive(Error, Debug, PartialEq)]
pub enum DecodeError {
    #[error("incomplete frame")]
    NeedMoreData,
    #[error("checksum mismatch")]
    Checksum { skip: usize },
    #[error("malformed frame")]
    Malformed { skip: usize },
}

/// Errors surfaced by synchronous protocol operations on the node.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("timed out waiting for a response from the device")]
    Timeout,
    #[error("unexpected response {0:#04x} from the device")]
    UnexpectedResponse(u8),
    #[error("device rejected the command with code {0:#04x}")]
    DeviceRejected(u8),
    #[error("operation cancelled by shutdown")]
    Cancelled,
    #[error("network number {0} out of range 0-7")]
    InvalidNetwork(u8),
    #[error("no network key set for network {0}")]
    NetworkNotKeyed(u8),
    #[error("all channels are assigned")]
    NoFreeChannel,
    #[error(transparent)]
    Transport(#[from] TransportError),
}
