//! Serial port implementation of [`Link`]
//!
//! Thin adapter over the `serialport` crate. The port is opened with a
//! short read timeout so the listener's polling loop never blocks long on
//! a quiet wire.

use std::io::Read;
use std::time::Duration;

use crate::config::SerialConfig;
use crate::error::{Result, XcpError};
use crate::transport::Link;

const READ_TIMEOUT: Duration = Duration::from_millis(20);

/// A [`Link`] over a physical serial port
pub struct SerialLink {
    port: Box<dyn serialport::SerialPort>,
}

impl SerialLink {
    /// Open and configure the port described by `config`
    pub fn open(config: &SerialConfig) -> Result<Self> {
        let data_bits = match config.byte_size {
            5 => serialport::DataBits::Five,
            6 => serialport::DataBits::Six,
            7 => serialport::DataBits::Seven,
            8 => serialport::DataBits::Eight,
            other => {
                return Err(XcpError::Config(format!(
                    "unsupported byte size {}",
                    other
                )))
            }
        };
        let parity = match config.parity.to_ascii_uppercase() {
            'N' => serialport::Parity::None,
            'E' => serialport::Parity::Even,
            'O' => serialport::Parity::Odd,
            other => return Err(XcpError::Config(format!("unsupported parity '{}'", other))),
        };
        let stop_bits = match config.stop_bits {
            1 => serialport::StopBits::One,
            2 => serialport::StopBits::Two,
            other => {
                return Err(XcpError::Config(format!(
                    "unsupported stop bits {}",
                    other
                )))
            }
        };

        let port = serialport::new(&config.port, config.bitrate)
            .data_bits(data_bits)
            .parity(parity)
            .stop_bits(stop_bits)
            .timeout(READ_TIMEOUT)
            .open()?;
        tracing::info!(
            port = %config.port,
            bitrate = config.bitrate,
            "serial port opened"
        );
        Ok(Self { port })
    }
}

impl Link for SerialLink {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        match self.port.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(XcpError::Link(format!("serial read failed: {}", e))),
        }
    }

    fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        std::io::Write::write_all(&mut self.port, buf)
            .map_err(|e| XcpError::Link(format!("serial write failed: {}", e)))
    }

    fn bytes_available(&mut self) -> Result<usize> {
        Ok(self.port.bytes_to_read()? as usize)
    }

    fn flush(&mut self) -> Result<()> {
        std::io::Write::flush(&mut self.port)
            .map_err(|e| XcpError::Link(format!("serial flush failed: {}", e)))
    }
}
