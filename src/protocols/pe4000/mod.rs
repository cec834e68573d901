//! CoolLED pE-4000 four-channel LED illuminator.
//!
//! The device speaks a line-oriented ASCII protocol over a USB serial
//! port: commands are short strings terminated with a carriage return,
//! replies are single lines. [`protocol`] builds and parses those lines,
//! [`session`] drives them over a [`LineTransport`].

pub mod protocol;
pub mod session;

pub use protocol::ChannelStatus;
pub use session::IlluminatorSession;

use crate::error::Result;

/// Baud rate most units ship with.
pub const PRIMARY_BAUD: u32 = 57_600;
/// Baud rate of older firmware; tried when the primary gets no answer.
pub const FALLBACK_BAUD: u32 = 38_400;

/// Line-oriented exchange with the illuminator.
///
/// Implementations handle terminators: `write_line` appends the carriage
/// return, `read_line` strips it.
pub trait LineTransport: Send {
    /// Send one command line.
    fn write_line(&mut self, line: &str) -> Result<()>;

    /// Receive one reply line, blocking until the transport times out.
    fn read_line(&mut self) -> Result<String>;
}

#[cfg(feature = "serial")]
mod serial {
    use std::io::{Read, Write};
    use std::time::Duration;

    use crate::error::{Error, Result};

    use super::LineTransport;

    const READ_TIMEOUT: Duration = Duration::from_millis(500);

    /// Serial-port transport to a physical illuminator.
    pub struct SerialTransport {
        port: Box<dyn serialport::SerialPort>,
    }

    impl SerialTransport {
        /// Open a port at the given baud rate.
        pub fn open(path: &str, baud: u32) -> Result<Self> {
            let port = serialport::new(path, baud)
                .timeout(READ_TIMEOUT)
                .open()
                .map_err(|e| Error::connection(format!("{}: {}", path, e)))?;
            Ok(SerialTransport { port })
        }
    }

    impl LineTransport for SerialTransport {
        fn write_line(&mut self, line: &str) -> Result<()> {
            self.port.write_all(line.as_bytes())?;
            self.port.write_all(b"\r")?;
            self.port.flush()?;
            Ok(())
        }

        fn read_line(&mut self) -> Result<String> {
            let mut out = Vec::new();
            let mut byte = [0u8; 1];
            loop {
                match self.port.read(&mut byte) {
                    Ok(0) => break,
                    Ok(_) => {
                        if byte[0] == b'\r' || byte[0] == b'\n' {
                            if out.is_empty() {
                                continue;
                            }
                            break;
                        }
                        out.push(byte[0]);
                    }
                    // A timeout with data already in hand ends the line.
                    Err(ref e) if e.kind() == std::io::ErrorKind::TimedOut && !out.is_empty() => {
                        break;
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            String::from_utf8(out)
                .map_err(|_| Error::format("illuminator reply is not valid UTF-8"))
        }
    }
}

#[cfg(feature = "serial")]
pub use serial::SerialTransport;
