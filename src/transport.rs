/// The byte-transport seam between the message pump and a physical device.
/// The pump's read worker and callers issuing writes run on different
/// threads, so both directions take `&self` and implementations keep the
/// two independent. Tests substitute a scripted in-memory device here.
use std::sync::Arc;
use std::time::Duration;

use crate::error::TransportError;

pub trait Transport: Send + Sync {
    /// Read whatever bytes are available into `buf`, waiting at most
    /// `timeout`. A timeout is reported as `TransportError::Timeout`, not
    /// as a zero-length read.
    fn read(&self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError>;

    /// Blocking bulk write of a complete encoded frame.
    fn write(&self, data: &[u8]) -> Result<usize, TransportError>;

    /// Mark the transport closed. Idempotent; subsequent reads and writes
    /// fail with `DeviceClosed`.
    fn close(&self) -> Result<(), TransportError>;
}

/// A shared transport behaves like the transport it wraps. The seam uses
/// `&self` on both directions precisely so a single device can be shared
/// across the pump and its owner behind an `Arc`.
impl<T: Transport + ?Sized> Transport for Arc<T> {
    fn read(&self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError> {
        (**self).read(buf, timeout)
    }

    fn write(&self, data: &[u8]) -> Result<usize, TransportError> {
        (**self).write(data)
    }

    fn close(&self) -> Result<(), TransportError> {
        (**self).close()
    }
}
