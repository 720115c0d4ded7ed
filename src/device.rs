/// Device profiles supported by the library. Each profile knows its
/// channel parameters and how to decode its broadcast pages; everything
/// else rides on the generic channel machinery.
pub mod hrm;

pub use hrm::{HeartRate, HeartRateData};

/// RF frequency shared by every ANT+ profile (2457 MHz).
pub const ANTPLUS_FREQUENCY: u8 = 0x39;

/// The ANT+ managed network key. Programmed into a network slot before
/// any ANT+ channel on that slot opens.
pub const ANTPLUS_NETWORK_KEY: [u8; 8] = [0xB9, 0xA5, 0x21, 0xFB, 0xBD, 0x72, 0xC3, 0x45];
