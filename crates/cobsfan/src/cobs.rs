// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Consistent-overhead-byte-stuffing frame decoder.
//!
//! The wire reserves the zero byte as a frame terminator. A frame is a
//! sequence of blocks, each a count byte `k` (1..=255) followed by `k - 1`
//! non-zero data bytes; every block except a maximal one (`k = 0xFF`)
//! implies a single zero byte after its data. A lone zero byte ends the
//! frame.
//!
//! Decoding writes straight into the caller's buffer with one bulk read per
//! block, so a frame travels kernel buffer -> destination in a single copy.
//! The ingest pipeline points `dst` at a shared-memory slot and publishes it
//! without further copying.

use std::io::{self, Read};
use tracing::warn;

/// Decode one frame from `source` into `dst`.
///
/// Returns the number of decoded payload bytes; zero for an empty frame
/// (two consecutive zero bytes on the wire).
///
/// A frame that would overflow `dst` is abandoned with a warning: input is
/// discarded up to the next zero byte and decoding restarts on the frame
/// after it, so a corrupted stream costs frames, not the pipeline.
///
/// # Errors
///
/// Source errors propagate unchanged. End of stream surfaces as
/// [`io::ErrorKind::UnexpectedEof`], including mid-frame (the partial frame
/// is dropped).
pub fn read_frame<R: Read + ?Sized>(dst: &mut [u8], source: &mut R) -> io::Result<usize> {
    let capacity = dst.len();
    let mut pos = 0usize;
    // Whether the previous block implied a zero that a terminator would
    // retroactively cancel.
    let mut trailing_zero = false;

    loop {
        let code = read_byte(source)? as usize;

        if code == 0 {
            return Ok(if trailing_zero { pos - 1 } else { pos });
        }

        // Too long without an end byte: resynchronize on the next one.
        if pos + code > capacity {
            warn!("frame exceeds {capacity} bytes with no end byte, resynchronizing");
            while read_byte(source)? != 0 {}
            pos = 0;
            trailing_zero = false;
            continue;
        }

        source.read_exact(&mut dst[pos..pos + code - 1])?;
        pos += code - 1;

        // A count of 0xFF means a maximal run with no implied zero.
        if code != 0xFF {
            dst[pos] = 0;
            pos += 1;
            trailing_zero = true;
        } else {
            trailing_zero = false;
        }
    }
}

fn read_byte<R: Read + ?Sized>(source: &mut R) -> io::Result<u8> {
    let mut byte = [0u8; 1];
    source.read_exact(&mut byte)?;
    Ok(byte[0])
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Reference encoder for round-trip checks.
    fn encode(payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(payload.len() + payload.len() / 254 + 2);
        let mut block: Vec<u8> = Vec::with_capacity(254);
        for &byte in payload {
            if byte == 0 {
                out.push(block.len() as u8 + 1);
                out.extend_from_slice(&block);
                block.clear();
            } else {
                block.push(byte);
                if block.len() == 254 {
                    out.push(0xFF);
                    out.extend_from_slice(&block);
                    block.clear();
                }
            }
        }
        out.push(block.len() as u8 + 1);
        out.extend_from_slice(&block);
        out.push(0);
        out
    }

    fn decode_all(wire: &[u8], capacity: usize) -> io::Result<Vec<u8>> {
        let mut dst = vec![0u8; capacity];
        let mut source = wire;
        let n = read_frame(&mut dst, &mut source)?;
        dst.truncate(n);
        Ok(dst)
    }

    #[test]
    fn test_two_byte_frame() {
        let decoded = decode_all(&[0x03, b'A', b'B', 0x00], 64).expect("decode");
        assert_eq!(decoded, b"AB");
    }

    #[test]
    fn test_single_zero_payload() {
        // One implied zero between two length-1 blocks.
        let decoded = decode_all(&[0x01, 0x01, 0x00], 64).expect("decode");
        assert_eq!(decoded, &[0x00]);
    }

    #[test]
    fn test_maximal_run_has_no_trailing_zero() {
        let mut wire = vec![0xFF];
        wire.extend(std::iter::repeat(0xAA).take(254));
        wire.push(0x00);
        let decoded = decode_all(&wire, 512).expect("decode");
        assert_eq!(decoded.len(), 254);
        assert!(decoded.iter().all(|&b| b == 0xAA));
    }

    #[test]
    fn test_empty_frame() {
        let mut source: &[u8] = &[0x00, 0x00];
        let mut dst = [0u8; 16];
        assert_eq!(read_frame(&mut dst, &mut source).expect("decode"), 0);
        assert_eq!(read_frame(&mut dst, &mut source).expect("decode"), 0);
    }

    #[test]
    fn test_eof_is_unexpected_eof() {
        let mut source: &[u8] = &[];
        let mut dst = [0u8; 16];
        let err = read_frame(&mut dst, &mut source).expect_err("eof");
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_mid_frame_eof_is_unexpected_eof() {
        let mut source: &[u8] = &[0x05, b'a', b'b'];
        let mut dst = [0u8; 16];
        let err = read_frame(&mut dst, &mut source).expect_err("eof");
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_oversize_frame_resynchronizes() {
        // First frame needs 9 bytes of room, dst only has 4; the decoder
        // must skip to the terminator and decode the following frame.
        let mut wire = encode(b"longlong");
        wire.extend_from_slice(&encode(b"ok"));
        let mut source: &[u8] = &wire;
        let mut dst = [0u8; 4];
        let n = read_frame(&mut dst, &mut source).expect("decode");
        assert_eq!(&dst[..n], b"ok");
    }

    #[test]
    fn test_round_trip_identity() {
        let cases: Vec<Vec<u8>> = vec![
            vec![],
            vec![0x00],
            vec![0x00, 0x00, 0x00],
            vec![0x01],
            b"hello world".to_vec(),
            vec![0x11, 0x22, 0x00, 0x33],
            (1..=253u8).collect(),
            (0..=254u8).cycle().take(253).collect(),
            std::iter::repeat(0x42).take(254).collect(),
            std::iter::repeat(0x42).take(255).collect(),
            std::iter::repeat(0x42).take(508).collect(),
            (0..2000u32).map(|i| (i % 256) as u8).collect(),
        ];
        for payload in cases {
            let wire = encode(&payload);
            let decoded = decode_all(&wire, 4096).expect("decode");
            assert_eq!(decoded, payload, "payload len {}", payload.len());
        }
    }

    #[test]
    fn test_back_to_back_frames() {
        let mut wire = encode(b"hi");
        wire.extend_from_slice(&encode(b"world"));
        let mut source: &[u8] = &wire;
        let mut dst = [0u8; 64];
        let n = read_frame(&mut dst, &mut source).expect("first");
        assert_eq!(&dst[..n], b"hi");
        let n = read_frame(&mut dst, &mut source).expect("second");
        assert_eq!(&dst[..n], b"world");
    }
}
