// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Shared-memory fanout ring for same-host, zero-copy datagram distribution.
//!
//! One writer process owns a named POSIX shared-memory segment and publishes
//! variable-size slots into it; any number of reader processes map the same
//! segment read-only and consume at their own pace. There is no backpressure
//! channel: the writer never inspects reader state, so a slow or crashed
//! reader cannot block the writer or other readers. Readers detect that they
//! have been lapped and discard the affected slot.
//!
//! # Architecture
//!
//! ```text
//! +------------------+              +------------------+
//! |  ingest process  |   Shared     |  subscriber(s)   |
//! |    RingWriter   -+--- memory ---+->  RingReader    |
//! +------------------+   (mmap)     +------------------+
//! ```
//!
//! # Synchronization Protocol
//!
//! Writer commit:
//! 1. Write payload bytes into the pending slot
//! 2. Write the slot size prefix
//! 3. Advance `writer_cursor` (Release)
//!
//! Reader recv:
//! 1. Load `writer_cursor` (Acquire); equal to own cursor means empty
//! 2. Read the size prefix at the own-cursor slot
//! 3. Re-load `writer_cursor` and reject the slot if it could have been
//!    overwritten while the prefix was read
//! 4. Advance the own cursor and hand out a payload view
//! 5. Caller consumes the view, then calls [`RingReader::kept_up`] before
//!    acting on what it read

mod ring;
mod segment;

pub use ring::{Recv, RingReader, RingWriter};
pub use segment::ShmSegment;

use std::io;
use thiserror::Error;

/// Segment name used by the ingest binaries and their subscribers.
pub const SEGMENT_NAME: &str = "/cobs_to_shm";

/// Default logical ring capacity in bytes (4 MiB).
pub const DEFAULT_RING_CAPACITY: usize = 4 * 1024 * 1024;

/// Size of the per-slot prefix. The first 8 bytes hold the unpadded payload
/// size; the remainder pads the payload out to the next 16-byte boundary.
pub const SLOT_PREFIX: usize = 16;

/// Errors that can occur in shared-memory ring operations.
#[derive(Debug, Error)]
pub enum ShmError {
    /// Shared memory segment creation failed.
    #[error("shared memory segment creation failed: {0}")]
    SegmentCreate(#[source] io::Error),

    /// Shared memory segment open failed.
    #[error("shared memory segment open failed: {0}")]
    SegmentOpen(#[source] io::Error),

    /// Sizing an existing segment failed.
    #[error("fstat on shared memory segment failed: {0}")]
    SegmentStat(#[source] io::Error),

    /// Memory mapping failed.
    #[error("memory mapping failed: {0}")]
    Mmap(#[source] io::Error),

    /// Invalid segment name.
    #[error("invalid segment name: {0}")]
    InvalidName(String),

    /// Segment not found.
    #[error("segment not found: {0}")]
    NotFound(String),

    /// Invalid ring capacity.
    #[error("invalid ring capacity {0}: must be a nonzero power of two")]
    InvalidCapacity(usize),

    /// Invalid per-slot payload bound.
    #[error("invalid max payload size {0}: must be a nonzero multiple of 16")]
    InvalidMaxPayload(usize),

    /// Ring capacity cannot hold even a single maximum-size slot.
    #[error("ring capacity {capacity} is smaller than the maximum slot size {max_slot_size}")]
    CapacityTooSmall {
        capacity: usize,
        max_slot_size: usize,
    },

    /// Mapped segment is smaller than its own declared layout.
    #[error("shared memory segment is truncated ({0} bytes)")]
    Truncated(usize),

    /// Probing the writer process for liveness failed.
    #[error("writer liveness probe failed: {0}")]
    Probe(#[source] io::Error),
}

/// Result type for shared-memory ring operations.
pub type Result<T> = std::result::Result<T, ShmError>;
