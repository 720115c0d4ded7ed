//! Host-side driver stack for ANT+ USB radio transceivers.
//!
//! The stack is layered the way the hardware is: a byte [`transport`]
//! over the stick's bulk endpoints, the [`message`] framing on top of it,
//! a background [`pump`] that turns the byte stream into a frame queue,
//! and the [`node`] protocol engine that correlates command replies and
//! dispatches broadcast data to [`channel`] handlers. [`scanner`] and
//! [`device`] build the two common applications on top: discovering
//! nearby clients and reading a paired sensor.

pub mod channel;
pub mod device;
pub mod error;
pub mod message;
pub mod node;
pub mod pump;
pub mod scanner;
pub mod transport;
pub mod usb;

pub use channel::{Channel, ChannelHandler, ChannelState, Config};
pub use error::{DecodeError, ProtocolError, TransportError};
pub use node::Node;
pub use pump::Pump;
pub use scanner::{ClientId, CommonData, ScanHandler, Scanner};
pub use transport::Transport;
pub use usb::{Context, UsbContext, UsbIdentity, UsbTransport, ANT_USB_2, ANT_USB_M};
