//! Projector session: sequence definition and playback over a transport.
//!
//! The session tracks a small state machine (idle, sequence defined,
//! playing, paused) and refuses operations that the firmware would
//! mishandle in the wrong state. Sequence definition is all-or-nothing:
//! every frame is validated and encoded before the first byte goes out,
//! and any wire failure mid-upload drops the session back to idle so a
//! half-defined sequence can never be started.

use std::fmt;
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};

use crate::error::{Error, Result};
use crate::types::{ExposureLimits, FrameKind, SequencePlan};

use super::codec;
use super::protocol::{self, DisplayMode, PatternControl, PatternEntry, PowerMode, Report};
use super::Transport;

/// Patterns per 24-bit upload image in 1-bit mode.
const BINARY_BATCH: usize = 24;
/// Bit planes of one grayscale pattern.
const GRADED_PLANES: usize = 8;
/// LUT repeat value meaning "cycle forever".
const REPEAT_FOREVER: u32 = 0xFFFF_FFFF;
/// Largest value a 24-bit timing field can carry, in microseconds.
const MAX_FIELD_US: u32 = 0x00FF_FFFF;

// ============================================================================
// Configuration
// ============================================================================

/// Tunables for a projector session.
///
/// The settle durations mirror what the firmware needs on real hardware;
/// tests drive them to zero.
#[derive(Debug, Clone)]
pub struct ProjectorConfig {
    /// Expected frame resolution.
    pub width: usize,
    pub height: usize,
    /// Exposure ceilings applied when a sequence is defined.
    pub limits: ExposureLimits,
    /// Most 1-bit patterns one sequence may hold.
    pub max_binary_patterns: usize,
    /// Most 8-bit patterns one sequence may hold (buffer-limited).
    pub max_graded_patterns: usize,
    /// Pause after each display-mode change command.
    pub mode_settle: Duration,
    /// Pause after a stop command while the firmware clears buffers.
    pub stop_settle: Duration,
    /// Reboot window after a reset command.
    pub reset_settle: Duration,
    /// Processing window after the final image-data chunk, which the
    /// firmware does not acknowledge.
    pub upload_settle: Duration,
}

impl Default for ProjectorConfig {
    fn default() -> Self {
        ProjectorConfig {
            width: codec::DMD_WIDTH,
            height: codec::DMD_HEIGHT,
            limits: ExposureLimits::default(),
            max_binary_patterns: 400,
            max_graded_patterns: 25,
            mode_settle: Duration::from_millis(50),
            stop_settle: Duration::from_millis(150),
            reset_settle: Duration::from_secs(2),
            upload_settle: Duration::from_secs(2),
        }
    }
}

// ============================================================================
// Session state
// ============================================================================

/// Where the session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Connected, no sequence on the device.
    Idle,
    /// A sequence is uploaded and ready to start.
    SequenceDefined,
    /// The sequence is running.
    Playing,
    /// The sequence is paused mid-run.
    Paused,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::SequenceDefined => "sequence defined",
            SessionState::Playing => "playing",
            SessionState::Paused => "paused",
        };
        f.write_str(name)
    }
}

/// Session handle for one projector.
pub struct ProjectorSession {
    transport: Box<dyn Transport>,
    config: ProjectorConfig,
    state: SessionState,
    pattern_count: usize,
}

impl ProjectorSession {
    /// Create a session with default (hardware) configuration.
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self::with_config(transport, ProjectorConfig::default())
    }

    pub fn with_config(transport: Box<dyn Transport>, config: ProjectorConfig) -> Self {
        ProjectorSession {
            transport,
            config,
            state: SessionState::Idle,
            pattern_count: 0,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn config(&self) -> &ProjectorConfig {
        &self.config
    }

    /// Number of patterns in the currently defined sequence.
    pub fn pattern_count(&self) -> usize {
        self.pattern_count
    }

    // ------------------------------------------------------------------------
    // Sequence definition
    // ------------------------------------------------------------------------

    /// Validate, encode, and upload a sequence plan.
    ///
    /// Nothing is written to the device until the whole plan has passed
    /// validation and every frame is encoded. Images upload in reverse
    /// index order; the firmware rejects sequences uploaded forward.
    ///
    /// On a transport failure the device sequence is in an unknown state,
    /// so the session falls back to [`SessionState::Idle`] and the plan
    /// must be defined again.
    pub fn define_sequence(&mut self, plan: &SequencePlan) -> Result<()> {
        if matches!(self.state, SessionState::Playing | SessionState::Paused) {
            return Err(Error::state(format!(
                "cannot define a sequence while {}",
                self.state
            )));
        }

        plan.validate()?;
        let kind = plan
            .frame_kind()
            .ok_or_else(|| Error::config("sequence plan holds no descriptors"))?;
        self.check_limits(plan, kind)?;
        let entries = lut_entries(plan, kind);
        let images = self.encode_images(plan, kind)?;
        let repeats = lut_repeats(plan);

        info!(
            "defining sequence: {} patterns, {} images, repeats {:#x}",
            plan.len(),
            images.len(),
            repeats
        );

        let result = self.upload(plan.len(), &entries, &images, repeats);
        match result {
            Ok(()) => {
                self.pattern_count = plan.len();
                self.state = SessionState::SequenceDefined;
                Ok(())
            }
            Err(e) => {
                self.pattern_count = 0;
                self.state = SessionState::Idle;
                Err(e)
            }
        }
    }

    fn check_limits(&self, plan: &SequencePlan, kind: FrameKind) -> Result<()> {
        let limits = &self.config.limits;
        for (i, d) in plan.descriptors.iter().enumerate() {
            // The hard ceiling binds where the device paces the exposure;
            // host-paced plans reach the device as short held sequences.
            if plan.mode.device_timed() && d.exposure_us > limits.max_safe_us {
                return Err(Error::timing(format!(
                    "pattern {} exposure {} us exceeds the safe maximum of {} us",
                    i, d.exposure_us, limits.max_safe_us
                )));
            }
            if d.exposure_us > MAX_FIELD_US {
                return Err(Error::limit(format!(
                    "pattern {} exposure {} us does not fit the 24-bit field",
                    i, d.exposure_us
                )));
            }
            if d.exposure_us > limits.recommended_us {
                warn!(
                    "pattern {} exposure {} us exceeds the recommended {} us",
                    i, d.exposure_us, limits.recommended_us
                );
            }
            if d.dark_us > MAX_FIELD_US {
                return Err(Error::limit(format!(
                    "pattern {} dark time {} us does not fit the 24-bit field",
                    i, d.dark_us
                )));
            }
        }

        let (max, label) = match kind {
            FrameKind::Binary => (self.config.max_binary_patterns, "1-bit"),
            FrameKind::Graded => (self.config.max_graded_patterns, "8-bit"),
        };
        if plan.len() > max {
            return Err(Error::limit(format!(
                "{} {} patterns, device accepts at most {}",
                plan.len(),
                label,
                max
            )));
        }
        Ok(())
    }

    /// Encode every upload image up front. 1-bit patterns batch 24 to an
    /// image; each 8-bit pattern occupies the low eight planes of its own
    /// image.
    fn encode_images(&self, plan: &SequencePlan, kind: FrameKind) -> Result<Vec<Vec<u8>>> {
        let (w, h) = (self.config.width, self.config.height);
        match kind {
            FrameKind::Binary => plan
                .descriptors
                .chunks(BINARY_BATCH)
                .map(|batch| {
                    for d in batch {
                        check_frame_size(d.frame.width(), d.frame.height(), w, h)?;
                    }
                    let planes: Vec<&[u8]> = batch.iter().map(|d| d.frame.data()).collect();
                    let raster = codec::pack_planes(&planes, w, h)?;
                    Ok(codec::encode_raster(&raster, w, h))
                })
                .collect(),
            FrameKind::Graded => plan
                .descriptors
                .iter()
                .map(|d| {
                    check_frame_size(d.frame.width(), d.frame.height(), w, h)?;
                    let planes = codec::bit_planes(&d.frame);
                    debug_assert_eq!(planes.len(), GRADED_PLANES);
                    let refs: Vec<&[u8]> = planes.iter().map(|p| p.as_slice()).collect();
                    let raster = codec::pack_planes(&refs, w, h)?;
                    Ok(codec::encode_raster(&raster, w, h))
                })
                .collect(),
        }
    }

    fn upload(
        &mut self,
        pattern_count: usize,
        entries: &[PatternEntry],
        images: &[Vec<u8>],
        repeats: u32,
    ) -> Result<()> {
        self.enter_pattern_mode()?;

        for entry in entries {
            self.send_checked(&protocol::define_pattern(entry))?;
        }
        self.send_checked(&protocol::configure_lut(pattern_count as u16, repeats))?;

        // Reverse order: the firmware wants the highest-indexed image first.
        for index in (0..images.len()).rev() {
            let image = &images[index];
            debug!("uploading image {} ({} bytes)", index, image.len());
            self.send_checked(&protocol::init_image_load(index as u16, image.len() as u32))?;

            let chunks: Vec<&[u8]> = protocol::image_chunks(image).collect();
            for (k, chunk) in chunks.iter().enumerate() {
                self.send(&protocol::image_data(chunk))?;
                if k + 1 < chunks.len() {
                    self.fail_on_firmware_error("image data")?;
                } else {
                    // The firmware is busy ingesting the final chunk and
                    // will not answer a status read.
                    thread::sleep(self.config.upload_settle);
                }
            }
        }
        Ok(())
    }

    /// Stop, switch to pattern-on-the-fly, stop again. The double stop is
    /// required around the mode change.
    fn enter_pattern_mode(&mut self) -> Result<()> {
        self.send_checked(&protocol::pattern_control(PatternControl::Stop))?;
        thread::sleep(self.config.mode_settle);
        self.send_checked(&protocol::set_display_mode(DisplayMode::PatternOnTheFly))?;
        thread::sleep(self.config.mode_settle);
        self.send_checked(&protocol::pattern_control(PatternControl::Stop))?;
        thread::sleep(self.config.mode_settle);
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Playback
    // ------------------------------------------------------------------------

    /// Start (or resume) the defined sequence. Idempotent while playing.
    pub fn start(&mut self) -> Result<()> {
        match self.state {
            SessionState::Playing => return Ok(()),
            SessionState::Idle => {
                return Err(Error::state("no sequence defined"));
            }
            SessionState::SequenceDefined | SessionState::Paused => {}
        }
        self.send_checked(&protocol::set_input_source(0x00))?;
        self.send_checked(&protocol::set_trigger_mode(0x00))?;
        self.send_checked(&protocol::pattern_control(PatternControl::Start))?;
        self.state = SessionState::Playing;
        Ok(())
    }

    /// Pause the running sequence. Idempotent while paused.
    pub fn pause(&mut self) -> Result<()> {
        match self.state {
            SessionState::Paused => return Ok(()),
            SessionState::Playing => {}
            other => {
                return Err(Error::state(format!("cannot pause while {}", other)));
            }
        }
        self.send_checked(&protocol::pattern_control(PatternControl::Pause))?;
        self.state = SessionState::Paused;
        Ok(())
    }

    /// Stop playback. Safe to call in any state; nothing goes out on the
    /// wire unless the sequence is actually playing or paused, so repeated
    /// stops are free. The defined sequence stays resident.
    pub fn stop(&mut self) -> Result<()> {
        if matches!(self.state, SessionState::Playing | SessionState::Paused) {
            self.send_checked(&protocol::pattern_control(PatternControl::Stop))?;
            thread::sleep(self.config.stop_settle);
        }
        self.state = if self.pattern_count > 0 {
            SessionState::SequenceDefined
        } else {
            SessionState::Idle
        };
        Ok(())
    }

    /// Tear the session down, stopping playback first if needed.
    pub fn disconnect(mut self) -> Result<()> {
        self.stop()
    }

    // ------------------------------------------------------------------------
    // Power management
    // ------------------------------------------------------------------------

    pub fn wakeup(&mut self) -> Result<()> {
        self.send_checked(&protocol::power_control(PowerMode::Wakeup))
    }

    pub fn standby(&mut self) -> Result<()> {
        self.send_checked(&protocol::power_control(PowerMode::Standby))
    }

    /// Reboot the controller. Uploaded sequences do not survive, so the
    /// session returns to idle after the reboot window.
    pub fn reset(&mut self) -> Result<()> {
        self.send(&protocol::power_control(PowerMode::Reset))?;
        thread::sleep(self.config.reset_settle);
        self.pattern_count = 0;
        self.state = SessionState::Idle;
        Ok(())
    }

    pub fn set_idle_mode(&mut self, enabled: bool) -> Result<()> {
        self.send_checked(&protocol::set_idle_mode(enabled))
    }

    // ------------------------------------------------------------------------
    // Wire helpers
    // ------------------------------------------------------------------------

    /// Read the firmware error code (zero means healthy).
    pub fn error_code(&mut self) -> Result<u8> {
        for report in protocol::read_error_status() {
            self.transport.write_report(&report)?;
        }
        let reply = self.transport.read_report()?;
        Ok(protocol::parse_error_reply(&reply))
    }

    /// Write one command and drain the acknowledgement report the
    /// firmware sends for every command.
    fn send(&mut self, reports: &[Report]) -> Result<()> {
        for report in reports {
            self.transport.write_report(report)?;
        }
        self.transport.read_report()?;
        Ok(())
    }

    /// Send a command and poll the firmware error status afterwards.
    /// Non-zero codes outside the upload path are logged, not fatal.
    fn send_checked(&mut self, reports: &[Report]) -> Result<()> {
        self.send(reports)?;
        let code = self.error_code()?;
        if code != 0 {
            warn!("firmware reports error code {:#04x}", code);
        }
        Ok(())
    }

    /// Upload-path error check: a non-zero code here means the image data
    /// was rejected and the sequence cannot be trusted.
    fn fail_on_firmware_error(&mut self, context: &str) -> Result<()> {
        let code = self.error_code()?;
        if code != 0 {
            return Err(Error::io(format!(
                "firmware rejected {} with error code {:#04x}",
                context, code
            )));
        }
        Ok(())
    }
}

impl Drop for ProjectorSession {
    fn drop(&mut self) {
        // Leaving mirrors running with nobody in control is the one thing
        // this must prevent; errors are unreportable here.
        if matches!(self.state, SessionState::Playing | SessionState::Paused) {
            if let Err(e) = self.stop() {
                warn!("failed to stop projector on drop: {}", e);
            }
        }
    }
}

fn check_frame_size(fw: usize, fh: usize, w: usize, h: usize) -> Result<()> {
    if fw != w || fh != h {
        return Err(Error::format(format!(
            "frame is {}x{}, device expects {}x{}",
            fw, fh, w, h
        )));
    }
    Ok(())
}

/// LUT entries for a plan. Binary patterns occupy one bit each, 24 to an
/// image; grayscale patterns start at bit 0 of their own image and the
/// firmware walks the eight planes itself.
fn lut_entries(plan: &SequencePlan, kind: FrameKind) -> Vec<PatternEntry> {
    plan.descriptors
        .iter()
        .enumerate()
        .map(|(i, d)| {
            let (image_index, bit_position) = match kind {
                FrameKind::Binary => ((i / BINARY_BATCH) as u16, (i % BINARY_BATCH) as u8),
                FrameKind::Graded => (i as u16, 0),
            };
            PatternEntry {
                index: i as u16,
                exposure_us: d.exposure_us,
                dark_us: d.dark_us,
                bit_depth: kind.bit_depth(),
                trigger_in: d.trigger_in,
                trigger_out: d.trigger_out,
                image_index,
                bit_position,
            }
        })
        .collect()
}

/// LUT repeat count: the firmware counts individual pattern displays, the
/// plan counts full cycles. Zero cycles means run until stopped.
fn lut_repeats(plan: &SequencePlan) -> u32 {
    if plan.repeat == 0 {
        REPEAT_FOREVER
    } else {
        plan.repeat.saturating_mul(plan.len() as u32)
    }
}
