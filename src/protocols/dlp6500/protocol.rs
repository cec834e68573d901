//! DLPC900 command protocol.
//!
//! Every command travels as one or more 64-byte HID reports. The first
//! report carries a four-byte framing header plus the 16-bit opcode; any
//! payload that does not fit continues raw in follow-up reports, zero
//! padded to the report length. These builders are pure: they produce the
//! exact bytes for a command and never touch a transport, which keeps the
//! packet layout testable without hardware.

use byteorder::{ByteOrder, LittleEndian};

// ============================================================================
// Report framing
// ============================================================================

/// Fixed HID report length.
pub const REPORT_LEN: usize = 64;

/// A single raw HID report.
pub type Report = [u8; REPORT_LEN];

/// First-report flag byte for a host-to-device write.
pub const FLAG_WRITE: u8 = 0x40;
/// First-report flag byte for a command expecting a reply.
pub const FLAG_READ: u8 = 0xC0;

/// Sequence byte tagging image-data reports.
pub const SEQ_IMAGE_DATA: u8 = 0x11;
/// Sequence byte tagging status reads.
pub const SEQ_STATUS: u8 = 0x22;

/// Payload capacity of the first report: 64 minus flags, sequence,
/// length (2) and opcode (2).
const FIRST_REPORT_PAYLOAD: usize = REPORT_LEN - 6;

// ============================================================================
// Opcodes
// ============================================================================

pub const OP_POWER_CONTROL: u16 = 0x0200;
pub const OP_IDLE_MODE: u16 = 0x0201;
pub const OP_DISPLAY_MODE: u16 = 0x1A1B;
pub const OP_INPUT_SOURCE: u16 = 0x1A22;
pub const OP_TRIGGER_MODE: u16 = 0x1A23;
pub const OP_PATTERN_CONTROL: u16 = 0x1A24;
pub const OP_IMAGE_LOAD_INIT: u16 = 0x1A2A;
pub const OP_IMAGE_DATA: u16 = 0x1A2B;
pub const OP_PATTERN_LUT: u16 = 0x1A31;
pub const OP_PATTERN_DEFINE: u16 = 0x1A34;
pub const OP_ERROR_CODE: u16 = 0x0100;

/// Largest image slice a single data command may carry. The 2-byte length
/// prefix plus this amount exactly fills eight reports.
pub const MAX_IMAGE_CHUNK: usize = 504;

// ============================================================================
// Command parameters
// ============================================================================

/// Power control argument (opcode 0x0200).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerMode {
    Wakeup = 0,
    Standby = 1,
    Reset = 2,
}

/// Display mode argument (opcode 0x1A1B). Pattern sequences require
/// [`DisplayMode::PatternOnTheFly`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayMode {
    Video = 0,
    PreStoredPattern = 1,
    VideoPattern = 2,
    PatternOnTheFly = 3,
}

/// Pattern sequence control argument (opcode 0x1A24).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternControl {
    Stop = 0,
    Pause = 1,
    Start = 2,
}

/// Everything the firmware needs to slot one pattern into the sequence
/// lookup table (opcode 0x1A34).
#[derive(Debug, Clone, Copy)]
pub struct PatternEntry {
    /// Position in the running sequence.
    pub index: u16,
    /// Exposure time in microseconds (24-bit field).
    pub exposure_us: u32,
    /// Dark time after the exposure in microseconds (24-bit field).
    pub dark_us: u32,
    /// Bit depth of the pattern, 1 to 8.
    pub bit_depth: u8,
    /// Wait for an external trigger edge before exposing.
    pub trigger_in: bool,
    /// Trigger-out behavior byte.
    pub trigger_out: u8,
    /// Which uploaded image the pattern reads from.
    pub image_index: u16,
    /// Bit position within the 24-bit image where the pattern starts.
    pub bit_position: u8,
}

// ============================================================================
// Builders
// ============================================================================

/// Frame an opcode and payload into HID reports.
pub fn frame_command(flags: u8, seq: u8, opcode: u16, payload: &[u8]) -> Vec<Report> {
    let mut first: Report = [0; REPORT_LEN];
    first[0] = flags;
    first[1] = seq;
    // Declared length counts the opcode bytes as part of the data.
    LittleEndian::write_u16(&mut first[2..4], (payload.len() + 2) as u16);
    LittleEndian::write_u16(&mut first[4..6], opcode);

    let head_len = payload.len().min(FIRST_REPORT_PAYLOAD);
    first[6..6 + head_len].copy_from_slice(&payload[..head_len]);

    let mut reports = vec![first];
    for chunk in payload[head_len..].chunks(REPORT_LEN) {
        let mut cont: Report = [0; REPORT_LEN];
        cont[..chunk.len()].copy_from_slice(chunk);
        reports.push(cont);
    }
    reports
}

fn write_command(opcode: u16, payload: &[u8]) -> Vec<Report> {
    frame_command(FLAG_WRITE, 0x00, opcode, payload)
}

/// Power control: wake, standby, or reset the controller.
pub fn power_control(mode: PowerMode) -> Vec<Report> {
    write_command(OP_POWER_CONTROL, &[mode as u8])
}

/// Enter or leave DMD idle mode (mirror-saving 50/50 duty cycle).
pub fn set_idle_mode(enabled: bool) -> Vec<Report> {
    write_command(OP_IDLE_MODE, &[u8::from(enabled)])
}

/// Select the display mode.
pub fn set_display_mode(mode: DisplayMode) -> Vec<Report> {
    write_command(OP_DISPLAY_MODE, &[mode as u8])
}

/// Select the pattern input source (0 = video port, 3 = flash/on-the-fly).
pub fn set_input_source(source: u8) -> Vec<Report> {
    write_command(OP_INPUT_SOURCE, &[source])
}

/// Select pattern trigger mode (0 = VSYNC, 1 = internal/external).
pub fn set_trigger_mode(mode: u8) -> Vec<Report> {
    write_command(OP_TRIGGER_MODE, &[mode])
}

/// Start, pause, or stop the running pattern sequence.
pub fn pattern_control(control: PatternControl) -> Vec<Report> {
    write_command(OP_PATTERN_CONTROL, &[control as u8])
}

/// Configure the sequence LUT: how many entries it holds and how many
/// pattern displays to run (0xFFFFFFFF = repeat forever).
pub fn configure_lut(entries: u16, repeats: u32) -> Vec<Report> {
    let mut payload = [0u8; 6];
    LittleEndian::write_u16(&mut payload[0..2], entries);
    LittleEndian::write_u32(&mut payload[2..6], repeats);
    write_command(OP_PATTERN_LUT, &payload)
}

/// Define one LUT entry.
pub fn define_pattern(entry: &PatternEntry) -> Vec<Report> {
    debug_assert!(entry.exposure_us < (1 << 24));
    debug_assert!(entry.dark_us < (1 << 24));
    debug_assert!((1..=8).contains(&entry.bit_depth));
    debug_assert!(entry.bit_position < 24);
    debug_assert!(entry.image_index < (1 << 11));

    let mut payload = [0u8; 12];
    LittleEndian::write_u16(&mut payload[0..2], entry.index);
    LittleEndian::write_u24(&mut payload[2..5], entry.exposure_us);
    // Bit 0: clear DMD after exposure. Bits 1-3: depth - 1. Bits 4-6: LED
    // select, all three enables set so external illumination is untouched.
    // Bit 7: wait for trigger.
    payload[5] = 0x01
        | ((entry.bit_depth - 1) << 1)
        | (0b111 << 4)
        | (u8::from(entry.trigger_in) << 7);
    LittleEndian::write_u24(&mut payload[6..9], entry.dark_us);
    payload[9] = entry.trigger_out;
    LittleEndian::write_u16(
        &mut payload[10..12],
        (u16::from(entry.bit_position) << 11) | entry.image_index,
    );
    write_command(OP_PATTERN_DEFINE, &payload)
}

/// Announce an image upload: which image slot and how many compressed
/// bytes will follow.
pub fn init_image_load(image_index: u16, total_bytes: u32) -> Vec<Report> {
    let mut payload = [0u8; 6];
    LittleEndian::write_u16(&mut payload[0..2], image_index);
    LittleEndian::write_u32(&mut payload[2..6], total_bytes);
    write_command(OP_IMAGE_LOAD_INIT, &payload)
}

/// One image-data command carrying a slice of the compressed stream.
/// `chunk` must not exceed [`MAX_IMAGE_CHUNK`] bytes.
pub fn image_data(chunk: &[u8]) -> Vec<Report> {
    debug_assert!(chunk.len() <= MAX_IMAGE_CHUNK);
    let mut payload = Vec::with_capacity(chunk.len() + 2);
    payload.extend_from_slice(&(chunk.len() as u16).to_le_bytes());
    payload.extend_from_slice(chunk);
    frame_command(FLAG_WRITE, SEQ_IMAGE_DATA, OP_IMAGE_DATA, &payload)
}

/// Split a compressed image into maximal data-command chunks.
pub fn image_chunks(image: &[u8]) -> impl Iterator<Item = &[u8]> {
    image.chunks(MAX_IMAGE_CHUNK)
}

/// Query the firmware error code.
pub fn read_error_status() -> Vec<Report> {
    frame_command(FLAG_READ, SEQ_STATUS, OP_ERROR_CODE, &[])
}

/// Pull the error code out of a status reply. Zero means no error.
pub fn parse_error_reply(report: &Report) -> u8 {
    report[6]
}
