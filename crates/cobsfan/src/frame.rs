// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Frame header codec shared by the ring slots and the on-disk log format.
//!
//! Every published frame is prefixed with one little-endian 64-bit word:
//!
//! ```text
//! bits  0..16   payload length in bytes (<= 65528)
//! bits 16..64   unix wall-clock time at arrival, in units of 16 us
//! ```
//!
//! On disk a frame is the header word, the payload, and zero padding up to
//! the next 8-byte boundary, so consumers read 8 bytes, extract the size,
//! read `round_up_8(size)` more, and process the first `size`.

use byteorder::{ByteOrder, LittleEndian};

/// Size of the packed header in bytes.
pub const HEADER_SIZE: usize = 8;

/// Largest payload a header can describe.
pub const MAX_PAYLOAD: usize = 65528;

/// Timestamp granularity of the header, in microseconds.
pub const TICK_MICROS: u64 = 16;

/// Round `n` up to the next multiple of 8.
#[inline]
#[must_use]
pub const fn round_up_8(n: usize) -> usize {
    (n + 7) & !7
}

/// One decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Unpadded payload length in bytes.
    pub payload_len: u16,
    /// Arrival time in 16-microsecond units since the unix epoch.
    pub time_ticks: u64,
}

impl FrameHeader {
    /// Build a header for a payload received at `unix_micros`.
    ///
    /// The timestamp is truncated to 16 us granularity; the 48-bit field
    /// holds dates well past the year 2100.
    #[must_use]
    pub fn stamp(payload_len: usize, unix_micros: u64) -> Self {
        debug_assert!(payload_len <= MAX_PAYLOAD);
        Self {
            payload_len: payload_len as u16,
            time_ticks: (unix_micros / TICK_MICROS) & 0xFFFF_FFFF_FFFF,
        }
    }

    /// Arrival time in microseconds since the unix epoch, at header
    /// granularity.
    #[must_use]
    pub fn unix_micros(&self) -> u64 {
        self.time_ticks * TICK_MICROS
    }

    /// Pack into the 64-bit wire word.
    #[must_use]
    pub fn pack(&self) -> u64 {
        (self.time_ticks << 16) | u64::from(self.payload_len)
    }

    /// Unpack from the 64-bit wire word.
    #[must_use]
    pub fn unpack(word: u64) -> Self {
        Self {
            payload_len: (word & 0xFFFF) as u16,
            time_ticks: word >> 16,
        }
    }

    /// Write the packed little-endian header into `dst[..8]`.
    pub fn write_to(&self, dst: &mut [u8]) {
        LittleEndian::write_u64(&mut dst[..HEADER_SIZE], self.pack());
    }

    /// Read a packed little-endian header from `src[..8]`.
    #[must_use]
    pub fn read_from(src: &[u8]) -> Self {
        Self::unpack(LittleEndian::read_u64(&src[..HEADER_SIZE]))
    }
}
