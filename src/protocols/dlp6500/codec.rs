//! Run-length image codec for the DLPC900 pattern upload format.
//!
//! The firmware consumes rasters as a fixed 52-byte header followed by a
//! run-length encoded stream of 24-bit packed colors. Up to 24 one-bit
//! planes ride in the 24 bits of each pixel, which is how both 24-pattern
//! upload batches and the eight bit-planes of a grayscale pattern are
//! carried in a single image.
//!
//! Header fields must match the device resolution and the compression tag
//! exactly; a mismatch is a protocol error, not a warning.

use byteorder::{LittleEndian, WriteBytesExt};

use crate::error::{Error, Result};
use crate::types::{EncodedFrame, EncodedPlane, Frame, FrameKind};

/// Native micromirror array width in pixels.
pub const DMD_WIDTH: usize = 1920;
/// Native micromirror array height in pixels.
pub const DMD_HEIGHT: usize = 1080;

/// Image header signature, "Spld".
pub const SIGNATURE: [u8; 4] = [0x53, 0x70, 0x6C, 0x64];
/// Fixed header length in bytes.
pub const HEADER_LEN: usize = 52;
/// Compression tag for the run-length variant the firmware expects.
pub const COMPRESSION_RLE: u8 = 0x02;
/// Maximum repeat count of a single run record; longer runs are split.
pub const MAX_RUN_LEN: usize = 0x7FFF;

/// Maximum number of one-bit planes a single 24-bit image can carry.
pub const MAX_PLANES: usize = 24;

/// Pixel value used for a set pixel in a standalone binary encoding (white).
const WHITE: u32 = 0x00FF_FFFF;

/// Encode a frame into the firmware wire format.
///
/// `width`/`height` are the device resolution the session is configured
/// for; a frame of any other size is rejected before encoding, never
/// cropped or padded. Binary frames with pixels outside {0, 1} and graded
/// frames declared binary are likewise rejected.
///
/// A graded frame encodes as eight independent binary planes, least
/// significant bit first, each tagged with its exposure weight `1 << i`.
pub fn encode(frame: &Frame, width: usize, height: usize) -> Result<EncodedFrame> {
    check_resolution(frame, width, height)?;
    match frame.kind() {
        FrameKind::Binary => {
            let raster = binary_raster(frame, WHITE)?;
            Ok(EncodedFrame::Binary(encode_raster(&raster, width, height)))
        }
        FrameKind::Graded => {
            let planes = bit_planes(frame);
            let encoded = planes
                .iter()
                .enumerate()
                .map(|(i, plane)| {
                    let raster: Vec<u32> = plane
                        .iter()
                        .map(|&bit| if bit != 0 { WHITE } else { 0 })
                        .collect();
                    EncodedPlane {
                        weight: 1 << i,
                        bytes: encode_raster(&raster, width, height),
                    }
                })
                .collect();
            Ok(EncodedFrame::Graded(encoded))
        }
    }
}

/// Split a graded frame into its eight bit-planes (bit 0 first).
///
/// Each plane is a row-major buffer of 0/1 bytes. Displaying plane i for a
/// duration proportional to `1 << i` reconstructs the original intensity;
/// nothing here rounds or clips.
pub fn bit_planes(frame: &Frame) -> Vec<Vec<u8>> {
    (0..8)
        .map(|bit| {
            frame
                .data()
                .iter()
                .map(|&px| (px >> bit) & 1)
                .collect::<Vec<u8>>()
        })
        .collect()
}

/// Pack up to 24 one-bit planes into a single 24-bit raster.
///
/// Bit j of every pixel carries plane j. All planes must hold
/// `width * height` 0/1 bytes.
pub fn pack_planes(planes: &[&[u8]], width: usize, height: usize) -> Result<Vec<u32>> {
    if planes.is_empty() || planes.len() > MAX_PLANES {
        return Err(Error::format(format!(
            "{} planes, expected 1-{}",
            planes.len(),
            MAX_PLANES
        )));
    }
    let len = width * height;
    for (j, plane) in planes.iter().enumerate() {
        if plane.len() != len {
            return Err(Error::format(format!(
                "plane {} holds {} pixels, expected {}",
                j,
                plane.len(),
                len
            )));
        }
    }

    let mut raster = vec![0u32; len];
    for (j, plane) in planes.iter().enumerate() {
        for (px, &bit) in raster.iter_mut().zip(plane.iter()) {
            if bit > 1 {
                return Err(Error::format(format!(
                    "plane {} holds a pixel value {} outside 0/1",
                    j, bit
                )));
            }
            *px |= u32::from(bit) << j;
        }
    }
    Ok(raster)
}

/// Run-length encode a 24-bit raster, header included.
///
/// Records:
/// - `count, color`: `color` repeated `count` times (count >= 1);
/// - `0x00, count, colors...`: `count` literal pixels (count >= 2);
/// - `0x00 0x00`: end of line;
/// - `0x00 0x01`: end of image.
///
/// Counts below 0x80 are one byte; larger counts are two bytes
/// (`0x80 | low7, high8`), capped at [`MAX_RUN_LEN`] with longer runs
/// split into multiple records.
pub fn encode_raster(pixels: &[u32], width: usize, height: usize) -> Vec<u8> {
    debug_assert_eq!(pixels.len(), width * height);

    let mut out = header_stub(width, height);
    for row in pixels.chunks(width) {
        encode_row(row, &mut out);
        out.push(0x00);
        out.push(0x00);
    }
    out.push(0x00);
    out.push(0x01);

    patch_payload_len(&mut out);
    out
}

fn encode_row(row: &[u32], out: &mut Vec<u8>) {
    let mut literal: Vec<u32> = Vec::new();
    let mut i = 0;
    while i < row.len() {
        let color = row[i];
        let mut run = 1;
        while i + run < row.len() && row[i + run] == color {
            run += 1;
        }
        if run >= 2 {
            flush_literal(&mut literal, out);
            let mut remaining = run;
            while remaining > 0 {
                let n = remaining.min(MAX_RUN_LEN);
                write_count(n, out);
                write_color(color, out);
                remaining -= n;
            }
        } else {
            literal.push(color);
        }
        i += run;
    }
    flush_literal(&mut literal, out);
}

fn flush_literal(literal: &mut Vec<u32>, out: &mut Vec<u8>) {
    match literal.len() {
        0 => {}
        // A lone pixel is shorter as a repeat-1 record than as a literal.
        1 => {
            write_count(1, out);
            write_color(literal[0], out);
        }
        _ => {
            for chunk in literal.chunks(MAX_RUN_LEN) {
                // A 1-pixel tail left by the split must not encode as a
                // literal: `0x00 0x01` is the end-of-image marker.
                if chunk.len() == 1 {
                    write_count(1, out);
                    write_color(chunk[0], out);
                    continue;
                }
                out.push(0x00);
                write_count(chunk.len(), out);
                for &color in chunk {
                    write_color(color, out);
                }
            }
        }
    }
    literal.clear();
}

fn write_count(n: usize, out: &mut Vec<u8>) {
    debug_assert!(n >= 1 && n <= MAX_RUN_LEN);
    if n < 0x80 {
        out.push(n as u8);
    } else {
        out.push(0x80 | (n & 0x7F) as u8);
        out.push((n >> 7) as u8);
    }
}

fn write_color(color: u32, out: &mut Vec<u8>) {
    // 24-bit packed color, blue byte first.
    out.push((color & 0xFF) as u8);
    out.push(((color >> 8) & 0xFF) as u8);
    out.push(((color >> 16) & 0xFF) as u8);
}

fn header_stub(width: usize, height: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + width);
    out.extend_from_slice(&SIGNATURE);
    // Writes to a Vec cannot fail.
    let _ = out.write_u16::<LittleEndian>(width as u16);
    let _ = out.write_u16::<LittleEndian>(height as u16);
    let _ = out.write_u32::<LittleEndian>(0); // payload length, patched below
    out.extend_from_slice(&[0xFF; 8]); // background color
    out.push(0x00);
    out.push(COMPRESSION_RLE);
    out.push(0x01);
    out.resize(HEADER_LEN, 0x00);
    out
}

fn patch_payload_len(out: &mut Vec<u8>) {
    let payload = (out.len() - HEADER_LEN) as u32;
    out[8..12].copy_from_slice(&payload.to_le_bytes());
}

/// Decode an encoded raster back into 24-bit pixels.
///
/// This is the reference decoder used to validate what would reach the
/// firmware: header fields are checked exactly against the expected
/// resolution and compression tag, and every row must decode to exactly
/// `width` pixels.
pub fn decode(bytes: &[u8], width: usize, height: usize) -> Result<Vec<u32>> {
    if bytes.len() < HEADER_LEN {
        return Err(Error::format(format!(
            "encoded stream of {} bytes is shorter than the {}-byte header",
            bytes.len(),
            HEADER_LEN
        )));
    }
    if bytes[0..4] != SIGNATURE {
        return Err(Error::format("bad header signature"));
    }
    let w = u16::from_le_bytes([bytes[4], bytes[5]]) as usize;
    let h = u16::from_le_bytes([bytes[6], bytes[7]]) as usize;
    if w != width || h != height {
        return Err(Error::format(format!(
            "header resolution {}x{} does not match device {}x{}",
            w, h, width, height
        )));
    }
    let payload = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]) as usize;
    if payload != bytes.len() - HEADER_LEN {
        return Err(Error::format(format!(
            "header payload length {} does not match {} body bytes",
            payload,
            bytes.len() - HEADER_LEN
        )));
    }
    if bytes[21] != COMPRESSION_RLE {
        return Err(Error::format(format!(
            "compression tag 0x{:02X}, expected 0x{:02X}",
            bytes[21],
            COMPRESSION_RLE
        )));
    }

    let mut pixels = Vec::with_capacity(width * height);
    let mut row_len = 0usize;
    let mut rows = 0usize;
    let mut pos = HEADER_LEN;
    loop {
        let first = *bytes
            .get(pos)
            .ok_or_else(|| Error::format("truncated run-length stream"))?;
        pos += 1;
        if first == 0x00 {
            let second = *bytes
                .get(pos)
                .ok_or_else(|| Error::format("truncated control record"))?;
            pos += 1;
            match second {
                0x00 => {
                    if row_len != width {
                        return Err(Error::format(format!(
                            "row {} decoded to {} pixels, expected {}",
                            rows, row_len, width
                        )));
                    }
                    rows += 1;
                    row_len = 0;
                }
                0x01 => break,
                _ => {
                    let (count, used) = read_count_tail(second, &bytes[pos..])?;
                    pos += used;
                    for _ in 0..count {
                        let color = read_color(&bytes[pos..])?;
                        pos += 3;
                        pixels.push(color);
                    }
                    row_len += count;
                }
            }
        } else {
            let (count, used) = read_count_tail(first, &bytes[pos..])?;
            pos += used;
            let color = read_color(&bytes[pos..])?;
            pos += 3;
            for _ in 0..count {
                pixels.push(color);
            }
            row_len += count;
        }
        if row_len > width {
            return Err(Error::format(format!(
                "row {} overflows device width {}",
                rows, width
            )));
        }
    }

    if rows != height {
        return Err(Error::format(format!(
            "{} rows decoded, expected {}",
            rows, height
        )));
    }
    Ok(pixels)
}

/// Finish reading a count whose first byte has already been consumed.
/// Returns the count and how many further bytes were used.
fn read_count_tail(first: u8, rest: &[u8]) -> Result<(usize, usize)> {
    if first < 0x80 {
        Ok((first as usize, 0))
    } else {
        let high = *rest
            .first()
            .ok_or_else(|| Error::format("truncated run count"))?;
        Ok((((high as usize) << 7) | (first & 0x7F) as usize, 1))
    }
}

fn read_color(bytes: &[u8]) -> Result<u32> {
    if bytes.len() < 3 {
        return Err(Error::format("truncated color record"));
    }
    Ok(u32::from(bytes[0]) | (u32::from(bytes[1]) << 8) | (u32::from(bytes[2]) << 16))
}

fn check_resolution(frame: &Frame, width: usize, height: usize) -> Result<()> {
    if frame.width() != width || frame.height() != height {
        return Err(Error::format(format!(
            "frame is {}x{}, device expects {}x{}",
            frame.width(),
            frame.height(),
            width,
            height
        )));
    }
    Ok(())
}

fn binary_raster(frame: &Frame, set: u32) -> Result<Vec<u32>> {
    frame
        .data()
        .iter()
        .map(|&px| match px {
            0 => Ok(0),
            1 => Ok(set),
            other => Err(Error::format(format!(
                "binary frame holds pixel value {}, expected 0 or 1",
                other
            ))),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_bits(bytes: &[u8], width: usize, height: usize) -> Vec<u8> {
        decode(bytes, width, height)
            .unwrap()
            .iter()
            .map(|&px| u8::from(px != 0))
            .collect()
    }

    #[test]
    fn test_binary_round_trip() {
        let data: Vec<u8> = (0..16 * 8).map(|i| ((i * 7) % 3 == 0) as u8).collect();
        let frame = Frame::binary(16, 8, data.clone()).unwrap();
        let EncodedFrame::Binary(bytes) = encode(&frame, 16, 8).unwrap() else {
            panic!("binary frame encoded as graded");
        };
        assert_eq!(decode_bits(&bytes, 16, 8), data);
    }

    #[test]
    fn test_graded_planes_reconstruct_exactly() {
        let data: Vec<u8> = (0..=255).collect();
        let frame = Frame::graded(16, 16, data.clone()).unwrap();
        let EncodedFrame::Graded(planes) = encode(&frame, 16, 16).unwrap() else {
            panic!("graded frame encoded as binary");
        };
        assert_eq!(planes.len(), 8);

        let mut reconstructed = vec![0u16; 256];
        for (i, plane) in planes.iter().enumerate() {
            assert_eq!(plane.weight, 1 << i);
            for (acc, bit) in reconstructed
                .iter_mut()
                .zip(decode_bits(&plane.bytes, 16, 16))
            {
                *acc += u16::from(bit) * u16::from(plane.weight);
            }
        }
        let expected: Vec<u16> = data.iter().map(|&v| u16::from(v)).collect();
        assert_eq!(reconstructed, expected);
    }

    #[test]
    fn test_header_fields() {
        let frame = Frame::binary(16, 8, vec![0; 128]).unwrap();
        let EncodedFrame::Binary(bytes) = encode(&frame, 16, 8).unwrap() else {
            unreachable!()
        };
        assert_eq!(&bytes[0..4], &SIGNATURE);
        assert_eq!(u16::from_le_bytes([bytes[4], bytes[5]]), 16);
        assert_eq!(u16::from_le_bytes([bytes[6], bytes[7]]), 8);
        assert_eq!(bytes[21], COMPRESSION_RLE);
        let payload = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
        assert_eq!(payload as usize, bytes.len() - HEADER_LEN);
    }

    #[test]
    fn test_uniform_row_is_one_record() {
        let raster = vec![0u32; 1920];
        let bytes = encode_raster(&raster, 1920, 1);
        // count (2 bytes, 1920 >= 0x80) + color (3) + EOL (2) + EOI (2)
        assert_eq!(bytes.len() - HEADER_LEN, 9);
        assert_eq!(decode(&bytes, 1920, 1).unwrap(), raster);
    }

    #[test]
    fn test_long_runs_split_at_cap() {
        let width = MAX_RUN_LEN + 100;
        let raster = vec![0x00AB_CDEFu32; width];
        let bytes = encode_raster(&raster, width, 1);
        assert_eq!(decode(&bytes, width, 1).unwrap(), raster);
        // Two repeat records: one at the cap, one for the remainder.
        let body = &bytes[HEADER_LEN..];
        let (first, _) = read_count_tail(body[0], &body[1..]).unwrap();
        assert_eq!(first, MAX_RUN_LEN);
    }

    #[test]
    fn test_literal_runs_for_alternating_pixels() {
        let raster: Vec<u32> = (0..64).map(|i| i as u32).collect();
        let bytes = encode_raster(&raster, 64, 1);
        assert_eq!(decode(&bytes, 64, 1).unwrap(), raster);
        // All-distinct row should use one literal record, not 64 repeats.
        let body = &bytes[HEADER_LEN..];
        assert_eq!(body[0], 0x00);
        assert_eq!(body[1], 64);
    }

    #[test]
    fn test_literal_split_tail_avoids_end_of_image_marker() {
        // One literal span a single pixel past the cap: the split leaves a
        // 1-pixel tail that must round-trip, not terminate the stream.
        let width = MAX_RUN_LEN + 1;
        let raster: Vec<u32> = (0..width).map(|i| 1 + (i as u32 & 1)).collect();
        let bytes = encode_raster(&raster, width, 1);
        assert_eq!(decode(&bytes, width, 1).unwrap(), raster);
    }

    #[test]
    fn test_wrong_resolution_rejected_before_encoding() {
        let frame = Frame::binary(8, 8, vec![0; 64]).unwrap();
        let err = encode(&frame, 16, 8).unwrap_err();
        assert!(err.is_format());
    }

    #[test]
    fn test_binary_frame_with_graded_pixels_rejected() {
        let frame = Frame::binary(4, 1, vec![0, 1, 2, 1]).unwrap();
        let err = encode(&frame, 4, 1).unwrap_err();
        assert!(err.is_format());
    }

    #[test]
    fn test_decode_rejects_tampered_compression_tag() {
        let frame = Frame::binary(4, 1, vec![0, 1, 0, 1]).unwrap();
        let EncodedFrame::Binary(mut bytes) = encode(&frame, 4, 1).unwrap() else {
            unreachable!()
        };
        bytes[21] = 0x01;
        assert!(decode(&bytes, 4, 1).unwrap_err().is_format());
    }

    #[test]
    fn test_pack_planes_assigns_bit_positions() {
        let p0 = [1u8, 0, 1, 0];
        let p1 = [1u8, 1, 0, 0];
        let raster = pack_planes(&[&p0, &p1], 4, 1).unwrap();
        assert_eq!(raster, vec![0b11, 0b10, 0b01, 0b00]);
    }

    #[test]
    fn test_pack_planes_rejects_over_24() {
        let plane = vec![0u8; 4];
        let refs: Vec<&[u8]> = (0..25).map(|_| plane.as_slice()).collect();
        assert!(pack_planes(&refs, 4, 1).unwrap_err().is_format());
    }

    #[test]
    fn test_bit_planes_cover_all_bits() {
        let frame = Frame::graded(2, 1, vec![0b1010_0101, 0xFF]).unwrap();
        let planes = bit_planes(&frame);
        assert_eq!(planes[0], vec![1, 1]);
        assert_eq!(planes[1], vec![0, 1]);
        assert_eq!(planes[7], vec![1, 1]);
    }
}
