//! pE-4000 ASCII command set.
//!
//! Commands are terse fixed-format strings. The channel select/switch
//! commands read as `CSS<channel><select><switch><intensity>`: select is
//! `S` (selected) or `X`, switch is `N` (on) or `F` (off), intensity is
//! three decimal digits. The status reply to `CSS?` echoes the same
//! grouping for all four channels.

use crate::error::{Error, Result};
use crate::types::Channel;

/// Switch every channel off.
pub const ALL_OFF: &str = "CSF";
/// Switch every selected channel back on at its stored intensity.
pub const ALL_ON: &str = "CSN";
/// Query the state of all four channels.
pub const STATUS_QUERY: &str = "CSS?";
/// Query firmware version.
pub const VERSION_QUERY: &str = "XVER";
/// Query the wavelengths currently loaded per channel.
pub const LOADED_QUERY: &str = "LAMS";
/// Query every wavelength the unit can load.
pub const AVAILABLE_QUERY: &str = "LAMBDAS";
/// Lock out the front control pod during automated runs.
pub const FRONT_PANEL_OFF: &str = "PORT:P=OFF";
/// Hand control back to the front pod.
pub const FRONT_PANEL_ON: &str = "PORT:P=ON";

/// Load a wavelength; the unit routes it to the owning channel.
pub fn load(wavelength_nm: u16) -> String {
    format!("LOAD:{}", wavelength_nm)
}

/// Switch a channel on at an intensity (0-100%).
pub fn channel_on(channel: Channel, intensity_pct: u8) -> String {
    format!("CSS{}SN{:03}", channel.letter(), intensity_pct)
}

/// Switch a channel off.
pub fn channel_off(channel: Channel) -> String {
    format!("CSS{}SF", channel.letter())
}

/// Parsed state of one channel from a `CSS?` reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelStatus {
    pub channel: Channel,
    /// Channel is selected on the control pod.
    pub selected: bool,
    /// Emission is switched on.
    pub on: bool,
    /// Stored intensity, 0-100%.
    pub intensity_pct: u8,
}

/// Parse a `CSS?` reply.
///
/// The reply is `CSS` followed by one six-character group per channel,
/// e.g. `CSSASN050BSF000CSF000DSF000`. Any deviation is a format error;
/// guessing at a malformed status is worse than failing.
pub fn parse_status(reply: &str) -> Result<Vec<ChannelStatus>> {
    let body = reply
        .trim()
        .strip_prefix("CSS")
        .ok_or_else(|| Error::format(format!("status reply {:?} lacks CSS prefix", reply)))?;
    let bytes = body.as_bytes();
    if bytes.is_empty() || bytes.len() % 6 != 0 {
        return Err(Error::format(format!(
            "status body {:?} is not a multiple of six characters",
            body
        )));
    }

    let mut out = Vec::with_capacity(bytes.len() / 6);
    for group in bytes.chunks(6) {
        let channel = Channel::from_letter(group[0] as char).ok_or_else(|| {
            Error::format(format!("unknown channel letter {:?}", group[0] as char))
        })?;
        let selected = match group[1] {
            b'S' => true,
            b'X' => false,
            other => {
                return Err(Error::format(format!(
                    "unknown select flag {:?} for channel {}",
                    other as char, channel
                )));
            }
        };
        let on = match group[2] {
            b'N' => true,
            b'F' => false,
            other => {
                return Err(Error::format(format!(
                    "unknown switch flag {:?} for channel {}",
                    other as char, channel
                )));
            }
        };
        let digits = std::str::from_utf8(&group[3..6])
            .ok()
            .and_then(|s| s.parse::<u8>().ok())
            .ok_or_else(|| {
                Error::format(format!("bad intensity digits for channel {}", channel))
            })?;
        out.push(ChannelStatus {
            channel,
            selected,
            on,
            intensity_pct: digits,
        });
    }
    Ok(out)
}

/// Pull the firmware version out of an `XVER` reply, which looks like
/// `XFW_VER=2.04 ...` possibly with surrounding noise.
pub fn parse_version(reply: &str) -> Option<&str> {
    let start = reply.find("XFW_VER=")? + "XFW_VER=".len();
    let rest = &reply[start..];
    let end = rest
        .find(|c: char| c.is_whitespace())
        .unwrap_or(rest.len());
    let version = &rest[..end];
    (!version.is_empty()).then_some(version)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_formatting() {
        assert_eq!(load(470), "LOAD:470");
        assert_eq!(channel_on(Channel::B, 50), "CSSBSN050");
        assert_eq!(channel_on(Channel::D, 100), "CSSDSN100");
        assert_eq!(channel_off(Channel::A), "CSSASF");
    }

    #[test]
    fn test_intensity_always_three_digits() {
        assert_eq!(channel_on(Channel::C, 5), "CSSCSN005");
        assert_eq!(channel_on(Channel::C, 0), "CSSCSN000");
    }

    #[test]
    fn test_parse_status_full_reply() {
        let status = parse_status("CSSASN050BSF000CXF020DSF000").unwrap();
        assert_eq!(status.len(), 4);
        assert_eq!(
            status[0],
            ChannelStatus {
                channel: Channel::A,
                selected: true,
                on: true,
                intensity_pct: 50,
            }
        );
        assert!(!status[1].on);
        assert!(!status[2].selected);
        assert_eq!(status[2].intensity_pct, 20);
    }

    #[test]
    fn test_parse_status_rejects_garbage() {
        assert!(parse_status("OK").unwrap_err().is_format());
        assert!(parse_status("CSSASN05").unwrap_err().is_format());
        assert!(parse_status("CSSQSN050").unwrap_err().is_format());
        assert!(parse_status("CSSAZN050").unwrap_err().is_format());
    }

    #[test]
    fn test_parse_version() {
        assert_eq!(parse_version("XFW_VER=2.04 XHW_VER=1"), Some("2.04"));
        assert_eq!(parse_version("noise XFW_VER=3.1"), Some("3.1"));
        assert_eq!(parse_version("no version here"), None);
    }
}
