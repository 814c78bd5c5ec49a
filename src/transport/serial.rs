//! Serial transport implementation

use super::Transport;
use crate::error::Result;
use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};
use std::io::{Read, Write};
use std::time::Duration;

/// Map a zero-based port index to the platform device path.
pub fn device_name(index: usize) -> String {
    #[cfg(unix)]
    {
        format!("/dev/ttyUSB{}", index)
    }
    #[cfg(not(unix))]
    {
        format!("COM{}", index + 1)
    }
}

/// Serial transport for the tracker's UART link
pub struct SerialTransport {
    port: Box<dyn SerialPort>,
}

impl SerialTransport {
    /// Open a serial port at 8N1 with no flow control.
    ///
    /// The tracker always wakes up at 9600 baud; the driver raises the line
    /// speed afterwards with `set_baud_rate` once `COMM:` is acknowledged.
    pub fn open(path: &str, baud_rate: u32) -> Result<Self> {
        let port = serialport::new(path, baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(Duration::from_millis(10))
            .open()?;

        log::info!("Opened serial port: {} at {} baud", path, baud_rate);

        Ok(SerialTransport { port })
    }
}

impl Transport for SerialTransport {
    fn read(&mut self, buffer: &mut [u8]) -> Result<usize> {
        match self.port.read(buffer) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&mut self, data: &[u8]) -> Result<usize> {
        Ok(self.port.write(data)?)
    }

    fn flush(&mut self) -> Result<()> {
        self.port.flush()?;
        Ok(())
    }

    fn set_baud_rate(&mut self, baud: u32) -> Result<()> {
        self.port.set_baud_rate(baud)?;
        Ok(())
    }
}
