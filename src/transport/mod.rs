//! Transport layer for serial I/O abstraction

use crate::error::Result;

mod mock;
mod serial;

pub use mock::MockTransport;
pub use serial::{device_name, SerialTransport};

/// Transport trait for tracker communication
pub trait Transport: Send {
    /// Read data into buffer, returns number of bytes read (0 on timeout)
    fn read(&mut self, buffer: &mut [u8]) -> Result<usize>;

    /// Write data from buffer, returns number of bytes written
    fn write(&mut self, data: &[u8]) -> Result<usize>;

    /// Flush any pending writes
    fn flush(&mut self) -> Result<()>;

    /// Reconfigure the line speed, where the transport supports it
    fn set_baud_rate(&mut self, _baud: u32) -> Result<()> {
        Ok(())
    }
}
