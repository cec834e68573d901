//! Device discovery and connection.
//!
//! Both connect functions walk a caller-supplied candidate list in
//! order, take the first device that answers, log the ones that do not,
//! and report a connection error only once every candidate is
//! exhausted.

#[cfg(any(feature = "usb", feature = "serial"))]
use log::{info, warn};

use crate::error::{Error, Result};
use crate::protocols::pe4000::{protocol, IlluminatorSession};

#[cfg(feature = "usb")]
use crate::protocols::dlp6500::{ProjectorSession, UsbTransport};
#[cfg(feature = "serial")]
use crate::protocols::pe4000::{SerialTransport, FALLBACK_BAUD, PRIMARY_BAUD};

/// A fixed position on the USB bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsbAddress {
    pub bus: u8,
    pub address: u8,
}

/// Connect to the first projector that opens.
///
/// An empty candidate list means "scan the bus for the first controller".
#[cfg(feature = "usb")]
pub fn connect_projector(addresses: &[UsbAddress]) -> Result<ProjectorSession> {
    if addresses.is_empty() {
        let transport = UsbTransport::open()?;
        info!("connected to projector via bus scan");
        return Ok(ProjectorSession::new(Box::new(transport)));
    }

    for addr in addresses {
        match UsbTransport::open_at(addr.bus, addr.address) {
            Ok(transport) => {
                info!(
                    "connected to projector at bus {} address {}",
                    addr.bus, addr.address
                );
                return Ok(ProjectorSession::new(Box::new(transport)));
            }
            Err(e) => {
                warn!(
                    "projector candidate bus {} address {}: {}",
                    addr.bus, addr.address, e
                );
            }
        }
    }
    Err(Error::connection(format!(
        "no projector answered on any of {} candidate addresses",
        addresses.len()
    )))
}

/// Connect to the first illuminator that answers a version query.
///
/// Each port is tried at the primary baud rate, then the fallback used
/// by older firmware. Opening a port is not enough; plenty of serial
/// devices open happily and say nothing, so only an `XVER` reply counts.
#[cfg(feature = "serial")]
pub fn connect_illuminator(ports: &[&str]) -> Result<IlluminatorSession> {
    for port in ports {
        for baud in [PRIMARY_BAUD, FALLBACK_BAUD] {
            let transport = match SerialTransport::open(port, baud) {
                Ok(t) => t,
                Err(e) => {
                    warn!("illuminator candidate {} @ {} baud: {}", port, baud, e);
                    continue;
                }
            };
            let mut session = IlluminatorSession::new(Box::new(transport));
            match verify_illuminator(&mut session) {
                Ok(version) => {
                    info!(
                        "connected to illuminator on {} @ {} baud (firmware {})",
                        port, baud, version
                    );
                    return Ok(session);
                }
                Err(e) => {
                    warn!("illuminator candidate {} @ {} baud: {}", port, baud, e);
                }
            }
        }
    }
    Err(Error::connection(format!(
        "no illuminator answered on any of {} candidate ports",
        ports.len()
    )))
}

/// Confirm a session is talking to a real illuminator by querying its
/// firmware version. Returns the parsed version, or the raw reply when
/// the device answered in an unexpected shape.
pub fn verify_illuminator(session: &mut IlluminatorSession) -> Result<String> {
    let reply = session.version()?;
    if reply.trim().is_empty() {
        return Err(Error::connection("no response to version query"));
    }
    Ok(protocol::parse_version(&reply)
        .map(str::to_string)
        .unwrap_or(reply))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockIlluminator;

    #[test]
    fn test_verify_accepts_version_reply() {
        let (transport, handle) = MockIlluminator::new();
        let mut session = IlluminatorSession::new(Box::new(transport));
        handle.push_reply("XFW_VER=2.04 XHW_VER=1");
        assert_eq!(verify_illuminator(&mut session).unwrap(), "2.04");
        assert_eq!(handle.lines()[0], "XVER");
    }

    #[test]
    fn test_verify_keeps_unparsed_reply() {
        let (transport, handle) = MockIlluminator::new();
        let mut session = IlluminatorSession::new(Box::new(transport));
        handle.push_reply("pE-4000 ready");
        assert_eq!(verify_illuminator(&mut session).unwrap(), "pE-4000 ready");
    }

    #[test]
    fn test_verify_rejects_silence() {
        let (transport, _handle) = MockIlluminator::new();
        let mut session = IlluminatorSession::new(Box::new(transport));
        // Default mock reply is an empty line.
        assert!(verify_illuminator(&mut session)
            .unwrap_err()
            .is_connection());
    }
}
