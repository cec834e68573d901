//! In-memory device doubles.
//!
//! These stand in for the USB projector and the serial illuminator in
//! tests: they journal everything written to them, serve scripted
//! replies, and can inject transport failures at a chosen point. They
//! live in the crate proper (not behind `cfg(test)`) so integration
//! tests and downstream dry-runs can drive full sessions without
//! hardware.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{Error, Result};
use crate::protocols::dlp6500::protocol::{Report, REPORT_LEN};
use crate::protocols::dlp6500::Transport;
use crate::protocols::pe4000::LineTransport;

/// Shared, ordered journal of events across several mock devices. Lets a
/// test assert cross-device ordering (e.g. illumination off before the
/// projector stops).
pub type EventLog = Arc<Mutex<Vec<String>>>;

/// Create an empty event log.
pub fn event_log() -> EventLog {
    Arc::new(Mutex::new(Vec::new()))
}

fn push_event(log: &Option<EventLog>, event: String) {
    if let Some(log) = log {
        log.lock().unwrap().push(event);
    }
}

// ============================================================================
// Projector double
// ============================================================================

/// One parsed command as seen by the projector double.
#[derive(Debug, Clone)]
pub struct RecordedCommand {
    pub flags: u8,
    pub seq: u8,
    pub opcode: u16,
    pub payload: Vec<u8>,
}

#[derive(Default)]
struct ProjectorInner {
    reports: Vec<Report>,
    replies: VecDeque<Report>,
    /// Continuation reports still expected for the current command.
    pending_continuations: usize,
    commands_seen: usize,
    fail_after: Option<usize>,
    fail_on: Option<(u16, usize)>,
    opcode_counts: Vec<(u16, usize)>,
}

impl ProjectorInner {
    fn count_opcode(&mut self, opcode: u16) -> usize {
        for entry in &mut self.opcode_counts {
            if entry.0 == opcode {
                entry.1 += 1;
                return entry.1;
            }
        }
        self.opcode_counts.push((opcode, 1));
        1
    }
}

/// Scripted stand-in for the projector's HID transport.
pub struct MockProjector {
    inner: Arc<Mutex<ProjectorInner>>,
    log: Option<EventLog>,
}

/// Test-side handle to a [`MockProjector`]'s journal and scripting.
pub struct ProjectorHandle {
    inner: Arc<Mutex<ProjectorInner>>,
}

impl MockProjector {
    /// Create a transport/handle pair.
    pub fn new() -> (MockProjector, ProjectorHandle) {
        Self::build(None)
    }

    /// As [`MockProjector::new`], recording `dmd <opcode>` events into a
    /// shared log.
    pub fn with_log(log: EventLog) -> (MockProjector, ProjectorHandle) {
        Self::build(Some(log))
    }

    fn build(log: Option<EventLog>) -> (MockProjector, ProjectorHandle) {
        let inner = Arc::new(Mutex::new(ProjectorInner::default()));
        (
            MockProjector {
                inner: Arc::clone(&inner),
                log,
            },
            ProjectorHandle { inner },
        )
    }
}

impl Transport for MockProjector {
    fn write_report(&mut self, report: &Report) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.pending_continuations > 0 {
            inner.pending_continuations -= 1;
            inner.reports.push(*report);
            return Ok(());
        }

        // Command header report.
        let opcode = LittleEndian::read_u16(&report[4..6]);
        inner.commands_seen += 1;
        let occurrence = inner.count_opcode(opcode);

        if let Some(limit) = inner.fail_after {
            if inner.commands_seen > limit {
                return Err(Error::io("injected transport failure"));
            }
        }
        if let Some((op, at)) = inner.fail_on {
            if op == opcode && occurrence >= at {
                return Err(Error::io(format!(
                    "injected failure on opcode {:#06x}",
                    op
                )));
            }
        }

        inner.pending_continuations = continuation_reports(report);
        inner.reports.push(*report);
        push_event(&self.log, format!("dmd {:04x}", opcode));
        Ok(())
    }

    fn read_report(&mut self) -> Result<Report> {
        let mut inner = self.inner.lock().unwrap();
        Ok(inner.replies.pop_front().unwrap_or([0; REPORT_LEN]))
    }
}

impl ProjectorHandle {
    /// Every raw report written so far.
    pub fn reports(&self) -> Vec<Report> {
        self.inner.lock().unwrap().reports.clone()
    }

    /// The journal parsed back into commands.
    pub fn commands(&self) -> Vec<RecordedCommand> {
        let reports = self.reports();
        let mut commands = Vec::new();
        let mut i = 0;
        while i < reports.len() {
            let header = &reports[i];
            let declared = LittleEndian::read_u16(&header[2..4]) as usize;
            let payload_len = declared.saturating_sub(2);
            let mut payload = Vec::with_capacity(payload_len);
            let head = payload_len.min(REPORT_LEN - 6);
            payload.extend_from_slice(&header[6..6 + head]);

            let continuations = continuation_reports(header);
            for k in 0..continuations {
                let chunk = &reports[i + 1 + k];
                let take = (payload_len - payload.len()).min(REPORT_LEN);
                payload.extend_from_slice(&chunk[..take]);
            }
            commands.push(RecordedCommand {
                flags: header[0],
                seq: header[1],
                opcode: LittleEndian::read_u16(&header[4..6]),
                payload,
            });
            i += 1 + continuations;
        }
        commands
    }

    /// Opcode of every command, in order.
    pub fn opcodes(&self) -> Vec<u16> {
        self.commands().iter().map(|c| c.opcode).collect()
    }

    /// Queue a reply report for the next read.
    pub fn push_reply(&self, report: Report) {
        self.inner.lock().unwrap().replies.push_back(report);
    }

    /// Queue a status reply carrying a firmware error code.
    pub fn push_error_code(&self, code: u8) {
        let mut report: Report = [0; REPORT_LEN];
        report[6] = code;
        self.push_reply(report);
    }

    /// Let `n` commands through, then fail every further write.
    pub fn fail_after_commands(&self, n: usize) {
        self.inner.lock().unwrap().fail_after = Some(n);
    }

    /// Fail the write of the `occurrence`-th command with this opcode
    /// (1-based) and every matching one after it.
    pub fn fail_on_opcode(&self, opcode: u16, occurrence: usize) {
        self.inner.lock().unwrap().fail_on = Some((opcode, occurrence));
    }
}

/// How many raw continuation reports follow a command header.
fn continuation_reports(header: &Report) -> usize {
    let declared = LittleEndian::read_u16(&header[2..4]) as usize;
    let payload_len = declared.saturating_sub(2);
    let spill = payload_len.saturating_sub(REPORT_LEN - 6);
    spill.div_ceil(REPORT_LEN)
}

// ============================================================================
// Illuminator double
// ============================================================================

#[derive(Default)]
struct IlluminatorInner {
    lines: Vec<String>,
    replies: VecDeque<String>,
    lines_seen: usize,
    fail_after: Option<usize>,
}

/// Scripted stand-in for the illuminator's serial line transport.
pub struct MockIlluminator {
    inner: Arc<Mutex<IlluminatorInner>>,
    log: Option<EventLog>,
}

/// Test-side handle to a [`MockIlluminator`]'s journal and scripting.
pub struct IlluminatorHandle {
    inner: Arc<Mutex<IlluminatorInner>>,
}

impl MockIlluminator {
    /// Create a transport/handle pair.
    pub fn new() -> (MockIlluminator, IlluminatorHandle) {
        Self::build(None)
    }

    /// As [`MockIlluminator::new`], recording `led <command>` events into
    /// a shared log.
    pub fn with_log(log: EventLog) -> (MockIlluminator, IlluminatorHandle) {
        Self::build(Some(log))
    }

    fn build(log: Option<EventLog>) -> (MockIlluminator, IlluminatorHandle) {
        let inner = Arc::new(Mutex::new(IlluminatorInner::default()));
        (
            MockIlluminator {
                inner: Arc::clone(&inner),
                log,
            },
            IlluminatorHandle { inner },
        )
    }
}

impl LineTransport for MockIlluminator {
    fn write_line(&mut self, line: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.lines_seen += 1;
        if let Some(limit) = inner.fail_after {
            if inner.lines_seen > limit {
                return Err(Error::io("injected serial failure"));
            }
        }
        inner.lines.push(line.to_string());
        push_event(&self.log, format!("led {}", line));
        Ok(())
    }

    fn read_line(&mut self) -> Result<String> {
        let mut inner = self.inner.lock().unwrap();
        Ok(inner.replies.pop_front().unwrap_or_default())
    }
}

impl IlluminatorHandle {
    /// Every command line written so far.
    pub fn lines(&self) -> Vec<String> {
        self.inner.lock().unwrap().lines.clone()
    }

    /// Queue a reply line for the next read.
    pub fn push_reply(&self, line: impl Into<String>) {
        self.inner.lock().unwrap().replies.push_back(line.into());
    }

    /// Let `n` lines through, then fail every further write.
    pub fn fail_after_lines(&self, n: usize) {
        self.inner.lock().unwrap().fail_after = Some(n);
    }
}
