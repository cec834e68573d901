//! Core data types shared across the crate.
//!
//! Frames and pattern descriptors are built by the caller before a run
//! starts and are read-only during execution; descriptors share frames via
//! `Arc` so a plan can reference the same raster more than once without
//! copying it.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Error, Result};

// =============================================================================
// Frames
// =============================================================================

/// Pixel depth of a raster frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum FrameKind {
    /// Each pixel is 0 or 1.
    Binary,
    /// Each pixel is 0..=255, displayed via bit-plane pulse-width modulation.
    Graded,
}

impl FrameKind {
    /// Bit depth the firmware is told for patterns of this kind.
    pub fn bit_depth(&self) -> u8 {
        match self {
            FrameKind::Binary => 1,
            FrameKind::Graded => 8,
        }
    }
}

/// A fixed-resolution raster of pixel intensities.
///
/// Immutable once constructed. Pixel data is stored row-major, one byte per
/// pixel regardless of kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    width: usize,
    height: usize,
    kind: FrameKind,
    data: Vec<u8>,
}

impl Frame {
    /// Create a binary frame (pixels 0/1).
    ///
    /// Fails if the buffer length does not match `width * height`.
    pub fn binary(width: usize, height: usize, data: Vec<u8>) -> Result<Self> {
        Self::new(width, height, FrameKind::Binary, data)
    }

    /// Create a graded frame (pixels 0..=255).
    pub fn graded(width: usize, height: usize, data: Vec<u8>) -> Result<Self> {
        Self::new(width, height, FrameKind::Graded, data)
    }

    fn new(width: usize, height: usize, kind: FrameKind, data: Vec<u8>) -> Result<Self> {
        if data.len() != width * height {
            return Err(Error::format(format!(
                "pixel buffer holds {} bytes, expected {} for {}x{}",
                data.len(),
                width * height,
                width,
                height
            )));
        }
        Ok(Self {
            width,
            height,
            kind,
            data,
        })
    }

    /// Frame width in pixels.
    pub fn width(&self) -> usize {
        self.width
    }

    /// Frame height in pixels.
    pub fn height(&self) -> usize {
        self.height
    }

    /// The declared pixel depth.
    pub fn kind(&self) -> FrameKind {
        self.kind
    }

    /// Row-major pixel data, one byte per pixel.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// One row of pixels.
    pub fn row(&self, y: usize) -> &[u8] {
        &self.data[y * self.width..(y + 1) * self.width]
    }
}

/// One encoded bit-plane of a graded frame.
///
/// `weight` is the plane's exposure multiplier (1, 2, 4, ... 128 for planes
/// 0..8); the weighted sum of all eight decoded planes reconstructs the
/// original 8-bit value exactly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedPlane {
    /// Exposure weight, `1 << plane_index`.
    pub weight: u8,
    /// Full encoded byte stream (header + run-length body).
    pub bytes: Vec<u8>,
}

/// Output of the frame codec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodedFrame {
    /// A single encoded binary raster.
    Binary(Vec<u8>),
    /// Eight encoded bit-planes, least significant first.
    Graded(Vec<EncodedPlane>),
}

// =============================================================================
// LED assignments
// =============================================================================

/// One of the illuminator's four LED channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Channel {
    A,
    B,
    C,
    D,
}

impl Channel {
    /// All channels in order.
    pub fn all() -> &'static [Channel] {
        &[Channel::A, Channel::B, Channel::C, Channel::D]
    }

    /// The channel letter used on the wire.
    pub fn letter(&self) -> char {
        match self {
            Channel::A => 'A',
            Channel::B => 'B',
            Channel::C => 'C',
            Channel::D => 'D',
        }
    }

    /// Parse a channel letter.
    pub fn from_letter(c: char) -> Option<Channel> {
        match c {
            'A' => Some(Channel::A),
            'B' => Some(Channel::B),
            'C' => Some(Channel::C),
            'D' => Some(Channel::D),
            _ => None,
        }
    }

    /// The four wavelengths (nm) this channel can load. Fixed per hardware;
    /// anything else is rejected rather than rounded to nearest.
    pub fn wavelengths(&self) -> [u16; 4] {
        match self {
            Channel::A => [365, 385, 395, 405],
            Channel::B => [425, 445, 460, 470],
            Channel::C => [500, 525, 550, 575],
            Channel::D => [635, 660, 740, 770],
        }
    }

    /// Returns true if this channel can load the given wavelength.
    pub fn supports(&self, wavelength_nm: u16) -> bool {
        self.wavelengths().contains(&wavelength_nm)
    }

    /// Find the channel that owns a wavelength, if any.
    pub fn owning(wavelength_nm: u16) -> Option<Channel> {
        Channel::all()
            .iter()
            .copied()
            .find(|ch| ch.supports(wavelength_nm))
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.letter())
    }
}

/// A validated LED channel/wavelength/intensity selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct LedAssignment {
    channel: Channel,
    wavelength_nm: u16,
    intensity_pct: u8,
}

impl LedAssignment {
    /// Create an assignment, validating the wavelength against the channel's
    /// fixed set and the intensity against 0..=100.
    pub fn new(channel: Channel, wavelength_nm: u16, intensity_pct: u8) -> Result<Self> {
        if !channel.supports(wavelength_nm) {
            return Err(Error::config(format!(
                "channel {} does not support {}nm (available: {:?})",
                channel,
                wavelength_nm,
                channel.wavelengths()
            )));
        }
        if intensity_pct > 100 {
            return Err(Error::config(format!(
                "intensity {}% out of range 0-100",
                intensity_pct
            )));
        }
        Ok(Self {
            channel,
            wavelength_nm,
            intensity_pct,
        })
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }

    pub fn wavelength_nm(&self) -> u16 {
        self.wavelength_nm
    }

    pub fn intensity_pct(&self) -> u8 {
        self.intensity_pct
    }
}

// =============================================================================
// Pattern descriptors and plans
// =============================================================================

/// One scheduled unit of a sequence: a frame plus its timing, trigger and
/// illumination settings. Index order in the plan is playback order.
#[derive(Debug, Clone)]
pub struct PatternDescriptor {
    /// The raster to display.
    pub frame: Arc<Frame>,
    /// Exposure duration in microseconds.
    pub exposure_us: u32,
    /// Dark period after the exposure, in microseconds.
    pub dark_us: u32,
    /// Wait for an external trigger before displaying.
    pub trigger_in: bool,
    /// Trigger output value (0-3).
    pub trigger_out: u8,
    /// LED assignment governing this pattern, or `None` for no illumination.
    pub led: Option<LedAssignment>,
}

impl PatternDescriptor {
    /// Create a descriptor with no triggers and no LED assignment.
    pub fn new(frame: Arc<Frame>, exposure_us: u32, dark_us: u32) -> Self {
        Self {
            frame,
            exposure_us,
            dark_us,
            trigger_in: false,
            trigger_out: 1,
            led: None,
        }
    }

    /// Attach an LED assignment.
    pub fn with_led(mut self, led: LedAssignment) -> Self {
        self.led = Some(led);
        self
    }

    /// Set the trigger output value.
    pub fn with_trigger_out(mut self, value: u8) -> Self {
        self.trigger_out = value;
        self
    }

    /// Host-side hold duration for this pattern (exposure + dark period).
    pub fn hold(&self) -> Duration {
        Duration::from_micros(u64::from(self.exposure_us) + u64::from(self.dark_us))
    }
}

/// Synchronization mode of a sequence plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum SyncMode {
    /// Upload the whole plan once and let the device cycle it; the first
    /// descriptor's LED assignment holds for the entire run.
    Cycling,
    /// A single pattern held continuously. Cycling with one descriptor.
    Hold,
    /// Host-paced: each descriptor is uploaded on demand, its LED applied,
    /// held, then extinguished before advancing.
    Pulsing,
    /// Externally paced: an outside collaborator decides when to start,
    /// stop, and advance.
    ExternalTrigger,
}

impl SyncMode {
    /// Whether pattern timing is enforced by device exposure (and therefore
    /// subject to the hardware-safe exposure ceiling).
    pub fn device_timed(&self) -> bool {
        matches!(self, SyncMode::Cycling | SyncMode::Hold)
    }

    /// Which descriptor's LED assignment governs illumination while
    /// descriptor `current` is active.
    ///
    /// Cycling and Hold illuminate with the first descriptor's assignment
    /// for the whole run; Pulsing and ExternalTrigger apply each
    /// descriptor's own.
    pub fn governing_led_index(&self, current: usize) -> usize {
        match self {
            SyncMode::Cycling | SyncMode::Hold => 0,
            SyncMode::Pulsing | SyncMode::ExternalTrigger => current,
        }
    }
}

/// An ordered list of pattern descriptors with a repetition count and a
/// declared synchronization mode.
#[derive(Debug, Clone)]
pub struct SequencePlan {
    /// Descriptors in playback order.
    pub descriptors: Vec<PatternDescriptor>,
    /// Number of cycles through the plan; 0 means infinite.
    pub repeat: u32,
    /// Declared synchronization mode.
    pub mode: SyncMode,
}

impl SequencePlan {
    /// Create a plan.
    pub fn new(descriptors: Vec<PatternDescriptor>, repeat: u32, mode: SyncMode) -> Self {
        Self {
            descriptors,
            repeat,
            mode,
        }
    }

    /// Number of descriptors.
    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    /// Returns true if the plan holds no descriptors.
    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// The shared pixel depth of all frames in the plan.
    pub fn frame_kind(&self) -> Option<FrameKind> {
        self.descriptors.first().map(|d| d.frame.kind())
    }

    /// The LED assignment governing illumination while descriptor `current`
    /// is active.
    pub fn governing_led(&self, current: usize) -> Option<&LedAssignment> {
        let idx = self.mode.governing_led_index(current);
        self.descriptors.get(idx).and_then(|d| d.led.as_ref())
    }

    /// Structural validation, independent of any session state.
    pub fn validate(&self) -> Result<()> {
        if self.descriptors.is_empty() {
            return Err(Error::config("sequence plan holds no descriptors"));
        }
        if self.mode == SyncMode::Hold && self.descriptors.len() != 1 {
            return Err(Error::config(format!(
                "hold mode takes exactly one descriptor, got {}",
                self.descriptors.len()
            )));
        }
        let kind = self.descriptors[0].frame.kind();
        if self.descriptors.iter().any(|d| d.frame.kind() != kind) {
            return Err(Error::config(
                "all frames in a plan must share one pixel depth",
            ));
        }
        Ok(())
    }

    /// Total host-side duration of one cycle through the plan.
    pub fn cycle_duration(&self) -> Duration {
        self.descriptors.iter().map(PatternDescriptor::hold).sum()
    }
}

// =============================================================================
// Limits and run state
// =============================================================================

/// Hardware exposure limits, supplied as configuration to the projector
/// session.
///
/// The DLPC900 in Pattern On-The-Fly mode terminates exposures beyond a
/// hardware-dependent ceiling; exposures over `max_safe_us` are rejected in
/// device-timed modes, exposures over `recommended_us` are logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ExposureLimits {
    /// Hard ceiling in microseconds; exceeding it is an error.
    pub max_safe_us: u32,
    /// Conservative recommendation in microseconds; exceeding it warns.
    pub recommended_us: u32,
}

impl Default for ExposureLimits {
    fn default() -> Self {
        Self {
            max_safe_us: 5_000_000,
            recommended_us: 3_000_000,
        }
    }
}

/// Observable state of a run, readable concurrently with orchestrator entry
/// points (e.g. by a UI showing the active pattern).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct RunState {
    /// Whether projection is currently running.
    pub running: bool,
    /// Index of the active descriptor, if any.
    pub current_index: Option<usize>,
}

/// How a blocking run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The plan ran to completion.
    Completed,
    /// A cancellation signal stopped the run early.
    Cancelled,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame() -> Arc<Frame> {
        Arc::new(Frame::binary(4, 2, vec![0; 8]).unwrap())
    }

    #[test]
    fn test_frame_rejects_wrong_buffer_length() {
        let err = Frame::binary(4, 2, vec![0; 7]).unwrap_err();
        assert!(err.is_format());
    }

    #[test]
    fn test_channel_wavelength_ownership() {
        assert_eq!(Channel::owning(470), Some(Channel::B));
        assert_eq!(Channel::owning(740), Some(Channel::D));
        assert_eq!(Channel::owning(999), None);
        assert!(Channel::C.supports(525));
        assert!(!Channel::C.supports(470));
    }

    #[test]
    fn test_led_assignment_rejects_foreign_wavelength() {
        let err = LedAssignment::new(Channel::A, 470, 50).unwrap_err();
        assert!(err.is_config());
    }

    #[test]
    fn test_led_assignment_rejects_intensity_over_100() {
        let err = LedAssignment::new(Channel::A, 365, 101).unwrap_err();
        assert!(err.is_config());
    }

    #[test]
    fn test_governing_led_index_per_mode() {
        assert_eq!(SyncMode::Cycling.governing_led_index(3), 0);
        assert_eq!(SyncMode::Hold.governing_led_index(0), 0);
        assert_eq!(SyncMode::Pulsing.governing_led_index(3), 3);
        assert_eq!(SyncMode::ExternalTrigger.governing_led_index(2), 2);
    }

    #[test]
    fn test_plan_validate_rejects_empty() {
        let plan = SequencePlan::new(vec![], 1, SyncMode::Cycling);
        assert!(plan.validate().unwrap_err().is_config());
    }

    #[test]
    fn test_plan_validate_rejects_multi_descriptor_hold() {
        let d = PatternDescriptor::new(frame(), 1000, 0);
        let plan = SequencePlan::new(vec![d.clone(), d], 1, SyncMode::Hold);
        assert!(plan.validate().unwrap_err().is_config());
    }

    #[test]
    fn test_plan_validate_rejects_mixed_depths() {
        let b = PatternDescriptor::new(frame(), 1000, 0);
        let g = PatternDescriptor::new(
            Arc::new(Frame::graded(4, 2, vec![0; 8]).unwrap()),
            1000,
            0,
        );
        let plan = SequencePlan::new(vec![b, g], 1, SyncMode::Cycling);
        assert!(plan.validate().unwrap_err().is_config());
    }

    #[test]
    fn test_descriptor_hold_sums_exposure_and_dark() {
        let d = PatternDescriptor::new(frame(), 1_000_000, 500_000);
        assert_eq!(d.hold(), Duration::from_micros(1_500_000));
    }
}
