//! Synchronized control of a DMD pattern projector and an LED
//! illuminator for structured illumination experiments.
//!
//! The crate drives two instruments in lock-step: a DLPC900-class DMD
//! pattern projector over USB HID and a CoolLED pE-4000 four-channel
//! illuminator over a serial line. Frames are compiled into the
//! projector's compressed upload format, sequences of patterns are
//! scheduled with per-pattern exposure, dark time and LED assignment,
//! and the [`orchestrator::Orchestrator`] keeps the two devices
//! synchronized under one safety rule: illumination is off before any
//! run exits, however it exits.
//!
//! # Quick tour
//!
//! - [`types`]: frames, pattern descriptors, sequence plans, sync modes.
//! - [`protocols::dlp6500`]: projector codec, command protocol, session.
//! - [`protocols::pe4000`]: illuminator command set and session.
//! - [`orchestrator`]: blocking runs and externally triggered runs.
//! - [`discovery`]: candidate-list connection helpers.
//! - [`mock`]: in-memory device doubles for tests and dry runs.
//!
//! Hardware transports are feature-gated: `usb` pulls in the projector's
//! USB transport, `serial` the illuminator's serial transport,
//! `all-devices` both. Everything above the transport traits works
//! without them.
//!
//! ```no_run
//! use std::sync::Arc;
//! use lumisync::orchestrator::Orchestrator;
//! use lumisync::types::{Frame, PatternDescriptor, SequencePlan, SyncMode};
//! # fn connect() -> lumisync::Result<lumisync::ProjectorSession> { unimplemented!() }
//!
//! # fn main() -> lumisync::Result<()> {
//! let projector = connect()?;
//! let frame = Arc::new(Frame::binary(1920, 1080, vec![1; 1920 * 1080])?);
//! let pattern = PatternDescriptor::new(frame, 500_000, 10_000);
//! let plan = SequencePlan::new(vec![pattern], 3, SyncMode::Cycling);
//!
//! let mut orchestrator = Orchestrator::new(projector, None);
//! orchestrator.run(&plan)?;
//! # Ok(())
//! # }
//! ```

pub mod discovery;
pub mod error;
pub mod mock;
pub mod orchestrator;
pub mod protocols;
pub mod trigger;
pub mod types;

pub use error::{Error, Result};
pub use orchestrator::{CancelToken, Orchestrator, RunWatch};
pub use protocols::dlp6500::{ProjectorConfig, ProjectorSession, SessionState};
pub use protocols::pe4000::IlluminatorSession;
pub use types::{
    Channel, Frame, FrameKind, LedAssignment, PatternDescriptor, RunOutcome, RunState,
    SequencePlan, SyncMode,
};
