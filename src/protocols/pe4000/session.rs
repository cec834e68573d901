//! Illuminator session.
//!
//! Validation happens host-side before anything reaches the wire: the
//! device silently ignores wavelengths it cannot load, so sending an
//! unchecked value would fail without any symptom beyond a dark sample.
//!
//! The device answers most commands with a line the session does not
//! need; those replies are drained but read failures on them are not
//! fatal. Queries propagate read failures.

use log::{debug, warn};

use crate::error::{Error, Result};
use crate::types::{Channel, LedAssignment};

use super::protocol::{self, ChannelStatus};
use super::LineTransport;

/// Session handle for one illuminator.
pub struct IlluminatorSession {
    transport: Box<dyn LineTransport>,
}

impl IlluminatorSession {
    pub fn new(transport: Box<dyn LineTransport>) -> Self {
        IlluminatorSession { transport }
    }

    /// Load a wavelength into its owning channel.
    ///
    /// The wavelength must belong to some channel's fixed set; nearby
    /// values are rejected, never rounded.
    pub fn load(&mut self, wavelength_nm: u16) -> Result<Channel> {
        let channel = Channel::owning(wavelength_nm).ok_or_else(|| {
            Error::config(format!(
                "no channel can load {}nm",
                wavelength_nm
            ))
        })?;
        self.command(&protocol::load(wavelength_nm))?;
        Ok(channel)
    }

    /// Switch a channel on at the given intensity (0-100%).
    pub fn set_intensity(&mut self, channel: Channel, intensity_pct: u8) -> Result<()> {
        if intensity_pct > 100 {
            return Err(Error::config(format!(
                "intensity {}% out of range 0-100",
                intensity_pct
            )));
        }
        self.command(&protocol::channel_on(channel, intensity_pct))
    }

    /// Load an assignment's wavelength and switch its channel on. This is
    /// the one-call path the orchestrator uses per pattern.
    pub fn apply(&mut self, led: &LedAssignment) -> Result<()> {
        self.command(&protocol::load(led.wavelength_nm()))?;
        self.command(&protocol::channel_on(led.channel(), led.intensity_pct()))
    }

    /// Switch one channel off.
    pub fn turn_off(&mut self, channel: Channel) -> Result<()> {
        self.command(&protocol::channel_off(channel))
    }

    /// Switch every channel off. This is the safety path; callers treat
    /// it as best-effort and it stays a single short command so it has
    /// the best possible chance of getting through.
    pub fn all_off(&mut self) -> Result<()> {
        self.command(protocol::ALL_OFF)
    }

    /// Switch selected channels back on at their stored intensities.
    pub fn all_on(&mut self) -> Result<()> {
        self.command(protocol::ALL_ON)
    }

    /// Query the state of all four channels.
    pub fn query_status(&mut self) -> Result<Vec<ChannelStatus>> {
        let reply = self.query(protocol::STATUS_QUERY)?;
        protocol::parse_status(&reply)
    }

    /// Query the raw firmware version line.
    pub fn version(&mut self) -> Result<String> {
        self.query(protocol::VERSION_QUERY)
    }

    /// Query the raw list of wavelengths currently loaded per channel.
    pub fn loaded_wavelengths(&mut self) -> Result<String> {
        self.query(protocol::LOADED_QUERY)
    }

    /// Query the raw list of every wavelength the unit can load.
    pub fn available_wavelengths(&mut self) -> Result<String> {
        self.query(protocol::AVAILABLE_QUERY)
    }

    /// Lock or unlock the front control pod. Locked during automated
    /// runs so nobody can switch a channel on by hand mid-sequence.
    pub fn set_front_panel(&mut self, enabled: bool) -> Result<()> {
        self.command(if enabled {
            protocol::FRONT_PANEL_ON
        } else {
            protocol::FRONT_PANEL_OFF
        })
    }

    /// Tear the session down, extinguishing every channel first.
    pub fn disconnect(mut self) -> Result<()> {
        self.all_off()
    }

    /// Send a command and drain its reply line.
    fn command(&mut self, line: &str) -> Result<()> {
        self.transport.write_line(line)?;
        if let Err(e) = self.transport.read_line() {
            debug!("no reply to {}: {}", line, e);
        }
        Ok(())
    }

    /// Send a query and return its reply line.
    fn query(&mut self, line: &str) -> Result<String> {
        self.transport.write_line(line)?;
        self.transport.read_line()
    }
}

impl Drop for IlluminatorSession {
    fn drop(&mut self) {
        // Never leave LEDs burning with nobody holding the session.
        if let Err(e) = self.all_off() {
            warn!("failed to extinguish illuminator on drop: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockIlluminator;

    fn session() -> (IlluminatorSession, crate::mock::IlluminatorHandle) {
        let (transport, handle) = MockIlluminator::new();
        (IlluminatorSession::new(Box::new(transport)), handle)
    }

    #[test]
    fn test_load_routes_to_owning_channel() {
        let (mut s, handle) = session();
        assert_eq!(s.load(470).unwrap(), Channel::B);
        assert_eq!(handle.lines(), vec!["LOAD:470"]);
    }

    #[test]
    fn test_load_rejects_unknown_wavelength_before_wire() {
        let (mut s, handle) = session();
        assert!(s.load(468).unwrap_err().is_config());
        assert!(handle.lines().is_empty());
        drop(s);
    }

    #[test]
    fn test_apply_loads_then_switches_on() {
        let (mut s, handle) = session();
        let led = LedAssignment::new(Channel::C, 550, 35).unwrap();
        s.apply(&led).unwrap();
        assert_eq!(handle.lines(), vec!["LOAD:550", "CSSCSN035"]);
    }

    #[test]
    fn test_intensity_validation() {
        let (mut s, handle) = session();
        assert!(s.set_intensity(Channel::A, 101).unwrap_err().is_config());
        s.set_intensity(Channel::A, 100).unwrap();
        assert_eq!(handle.lines(), vec!["CSSASN100"]);
    }

    #[test]
    fn test_query_status_parses_reply() {
        let (mut s, handle) = session();
        handle.push_reply("CSSASN050BSF000CSF000DSF000");
        let status = s.query_status().unwrap();
        assert_eq!(status.len(), 4);
        assert!(status[0].on);
        assert_eq!(status[0].intensity_pct, 50);
    }

    #[test]
    fn test_wavelength_queries() {
        let (mut s, handle) = session();
        handle.push_reply("LAMS:A=405,B=470,C=550,D=660");
        handle.push_reply("LAMBDAS:365,385,395,405,425,445,460,470");
        assert_eq!(
            s.loaded_wavelengths().unwrap(),
            "LAMS:A=405,B=470,C=550,D=660"
        );
        assert!(s.available_wavelengths().unwrap().starts_with("LAMBDAS"));
        assert_eq!(handle.lines(), vec!["LAMS", "LAMBDAS"]);
    }

    #[test]
    fn test_drop_extinguishes() {
        let (s, handle) = session();
        drop(s);
        assert_eq!(handle.lines(), vec!["CSF"]);
    }

    #[test]
    fn test_front_panel_lockout() {
        let (mut s, handle) = session();
        s.set_front_panel(false).unwrap();
        s.set_front_panel(true).unwrap();
        assert_eq!(handle.lines(), vec!["PORT:P=OFF", "PORT:P=ON"]);
    }
}
