// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Single-writer / N-reader ring buffer over a shared memory segment.
//!
//! # Memory Layout
//!
//! ```text
//! +--------------------------------------------------------------+
//! | SegmentHeader (32 bytes, 16-byte aligned)                    |
//! |   cursor_wrap | max_slot_size | writer_cursor | writer_pid   |
//! +--------------------------------------------------------------+
//! | data[cursor_wrap + max_slot_size]                            |
//! |   packed slots: [size prefix (16) | payload | pad to 16] ... |
//! +--------------------------------------------------------------+
//! ```
//!
//! Cursors are monotonically increasing byte counts; a cursor's position in
//! the data region is its value modulo `cursor_wrap` (a power of two). The
//! data region is over-provisioned by `max_slot_size` so that a slot never
//! straddles the wrap point; the decoder can therefore fill a payload with
//! one contiguous write and readers get one contiguous view.
//!
//! `writer_cursor` is the sole synchronization variable for data: the
//! release store in [`RingWriter::commit`] pairs with the acquire loads in
//! [`RingReader::recv`] and [`RingReader::kept_up`]. `writer_pid` gates
//! segment validity: until it is published nonzero (release, the last store
//! of initialization) readers treat the segment as absent, and a zero or
//! dead pid means the writer is gone.
//!
//! There is no reader-visible backpressure. The writer never waits and never
//! retries; a reader that falls behind detects the overrun itself, after the
//! fact, and discards the affected slot.

use super::segment::ShmSegment;
use super::{Result, ShmError, SLOT_PREFIX};
use std::io;
use std::slice;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use tracing::warn;

/// Shared control block at the start of the segment.
///
/// All fields are constants after initialization except the two atomics,
/// which are stored only by the writer.
#[repr(C, align(16))]
struct SegmentHeader {
    /// Logical capacity of the data region in bytes; a power of two.
    cursor_wrap: u64,
    /// Upper bound on the byte span of any committed slot.
    max_slot_size: u64,
    /// Monotonically increasing count of committed bytes.
    writer_cursor: AtomicU64,
    /// Pid of the writing process; zero means not ready or shut down.
    writer_pid: AtomicI64,
}

/// Byte offset of the data region; keeps slots 16-byte aligned.
const HEADER_SIZE: usize = std::mem::size_of::<SegmentHeader>();

const _: () = assert!(HEADER_SIZE == 32);
const _: () = assert!(HEADER_SIZE % 16 == 0);

#[inline]
const fn round_up_16(n: usize) -> usize {
    (n + 15) & !15
}

/// Probe whether a process exists, without signalling it.
///
/// `EPERM` means the process exists but belongs to someone else, which
/// counts as alive.
fn process_alive(pid: i64) -> Result<bool> {
    // SAFETY: signal 0 performs the permission and existence checks only;
    // no signal is delivered
    let ret = unsafe { libc::kill(pid as libc::pid_t, 0) };
    if ret == 0 {
        return Ok(true);
    }
    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::ESRCH) => Ok(false),
        Some(libc::EPERM) => Ok(true),
        _ => Err(ShmError::Probe(err)),
    }
}

/// The writing side of the ring. Owns the segment lifecycle.
///
/// Dropping the writer clears `writer_pid` (readers see EOF) and unmaps.
pub struct RingWriter {
    segment: ShmSegment,
    cursor_wrap: u64,
    max_slot_size: u64,
    /// Local shadow of `writer_cursor`; this process is its only writer.
    cursor: u64,
    /// Cursor value preceding the most recent commit.
    last_commit: u64,
}

impl RingWriter {
    /// Create the ring, replacing any preexisting segment of the same name.
    ///
    /// `capacity` is the logical data-region size in bytes and must be a
    /// nonzero power of two; `max_payload` bounds the payload of a single
    /// slot and must be a nonzero multiple of 16. The mapped object is sized
    /// `header + capacity + max_payload + prefix` so no slot ever wraps.
    ///
    /// Publishing the writer pid is the last store of initialization and
    /// carries release ordering; a reader that observes the pid therefore
    /// observes the fully initialized header.
    ///
    /// # Errors
    ///
    /// Returns an error on invalid sizing or any segment/mapping failure.
    pub fn create(name: &str, capacity: usize, max_payload: usize) -> Result<Self> {
        if capacity == 0 || !capacity.is_power_of_two() {
            return Err(ShmError::InvalidCapacity(capacity));
        }
        if max_payload == 0 || max_payload % 16 != 0 {
            return Err(ShmError::InvalidMaxPayload(max_payload));
        }

        let max_slot_size = SLOT_PREFIX + max_payload;
        if capacity < max_slot_size {
            return Err(ShmError::CapacityTooSmall {
                capacity,
                max_slot_size,
            });
        }

        let total = HEADER_SIZE + capacity + max_slot_size;
        let segment = ShmSegment::create(name, total)?;

        // SAFETY:
        // - the segment was just created with at least HEADER_SIZE bytes
        // - mmap returns page-aligned memory, satisfying the 16-byte
        //   alignment of SegmentHeader
        // - the segment is zero-initialized and not yet visible to readers
        //   (writer_pid is still zero), so exclusive access holds
        let header = unsafe { &mut *(segment.as_ptr() as *mut SegmentHeader) };
        header.cursor_wrap = capacity as u64;
        header.max_slot_size = max_slot_size as u64;

        // Last store of initialization: readers gate on this.
        // SAFETY: getpid never fails
        let pid = unsafe { libc::getpid() } as i64;
        header.writer_pid.store(pid, Ordering::Release);

        Ok(Self {
            segment,
            cursor_wrap: capacity as u64,
            max_slot_size: max_slot_size as u64,
            cursor: 0,
            last_commit: 0,
        })
    }

    #[inline]
    fn header(&self) -> &SegmentHeader {
        // SAFETY: the segment holds a valid, initialized SegmentHeader at
        // offset 0 for the lifetime of the mapping (established in create)
        unsafe { &*(self.segment.as_ptr() as *const SegmentHeader) }
    }

    /// Mutable view of the pending slot's payload region.
    ///
    /// Pure computation: no cursor moves until [`commit`](Self::commit), so
    /// calling this repeatedly before a commit returns the same region. The
    /// view spans the full per-slot payload bound; the caller may scribble
    /// anywhere in it.
    pub fn acquire(&mut self) -> &mut [u8] {
        let off = HEADER_SIZE + (self.cursor % self.cursor_wrap) as usize + SLOT_PREFIX;
        let len = self.max_slot_size as usize - SLOT_PREFIX;
        // SAFETY:
        // - off + len <= HEADER_SIZE + cursor_wrap + max_slot_size, the
        //   mapped size, because (cursor % cursor_wrap) < cursor_wrap and the
        //   data region carries a max_slot_size tail past the wrap point
        // - the writer is the only process that stores to the data region,
        //   and &mut self guarantees no aliasing writer-side view
        unsafe { slice::from_raw_parts_mut(self.segment.as_ptr().add(off), len) }
    }

    /// Publish the pending slot with an `n`-byte payload.
    ///
    /// Writes the size prefix, then release-stores the advanced
    /// `writer_cursor`, making the slot visible to readers.
    ///
    /// # Panics
    ///
    /// Panics if the padded slot span would exceed the per-slot bound.
    pub fn commit(&mut self, n: usize) {
        let span = round_up_16(SLOT_PREFIX + n) as u64;
        assert!(span <= self.max_slot_size, "slot span {span} exceeds bound");

        let slot = HEADER_SIZE + (self.cursor % self.cursor_wrap) as usize;
        // SAFETY:
        // - slot is in bounds and 16-byte aligned (HEADER_SIZE and every
        //   committed span are multiples of 16)
        // - readers access the prefix with volatile loads; this is the only
        //   process storing it
        unsafe {
            (self.segment.as_ptr().add(slot) as *mut u64).write_volatile(n as u64);
        }

        self.last_commit = self.cursor;
        self.cursor = self.cursor.wrapping_add(span);
        self.header().writer_cursor.store(self.cursor, Ordering::Release);
    }

    /// Read-only view of the first `len` payload bytes of the most recently
    /// committed slot.
    ///
    /// The ingest pipeline uses this to append the exact published bytes to
    /// the log file after the commit. Only meaningful after at least one
    /// [`commit`](Self::commit).
    pub fn last_committed(&self, len: usize) -> &[u8] {
        debug_assert!(len <= self.max_slot_size as usize - SLOT_PREFIX);
        let off = HEADER_SIZE + (self.last_commit % self.cursor_wrap) as usize + SLOT_PREFIX;
        // SAFETY: same bounds argument as acquire(); the writer owns these
        // bytes and nothing overwrites them until the ring laps, which only
        // this writer can cause
        unsafe { slice::from_raw_parts(self.segment.as_ptr().add(off), len) }
    }

    /// Segment name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.segment.name()
    }
}

impl Drop for RingWriter {
    fn drop(&mut self) {
        // Tell readers no more data is coming; the mapping itself is torn
        // down by the segment's own drop.
        self.header().writer_pid.store(0, Ordering::Release);
    }
}

/// Outcome of a single non-blocking [`RingReader::recv`] call.
#[derive(Debug)]
pub enum Recv<'a> {
    /// The reader is caught up with the writer.
    Empty,
    /// The writer lapped this reader; the slot at the cursor is gone.
    Overrun,
    /// One committed payload. Valid only until the next call on the reader;
    /// confirm with [`RingReader::kept_up`] before acting on the contents.
    Payload(&'a [u8]),
}

/// The reading side of the ring.
///
/// Each reader is private state over its own read-only mapping; the writer
/// does no accounting of readers, and readers are invisible to each other.
pub struct RingReader {
    segment: ShmSegment,
    cursor_wrap: u64,
    max_slot_size: u64,
    /// Next slot to consume.
    cursor: u64,
    /// Cursor value preceding the most recent advance, for the keep-up check.
    last_recv: u64,
}

impl RingReader {
    /// Attach to the ring at its live tail.
    ///
    /// Returns `Ok(None)` when there is nothing to attach to: the segment
    /// does not exist, the writer has not yet published its pid, or the
    /// published pid no longer names a live process. Backlog committed before
    /// the attach is never replayed.
    ///
    /// # Errors
    ///
    /// Returns an error for OS failures other than plain absence.
    pub fn attach(name: &str) -> Result<Option<Self>> {
        let segment = match ShmSegment::open_read_only(name) {
            Ok(segment) => segment,
            Err(ShmError::NotFound(_)) => return Ok(None),
            Err(err) => return Err(err),
        };

        if segment.size() < HEADER_SIZE {
            return Err(ShmError::Truncated(segment.size()));
        }

        // SAFETY: the mapping is at least HEADER_SIZE bytes and page-aligned;
        // the header's atomics make cross-process reads well-defined
        let header = unsafe { &*(segment.as_ptr() as *const SegmentHeader) };

        // Must be the first field examined: until the pid is published, no
        // other field of the segment is meaningful.
        let pid = header.writer_pid.load(Ordering::Acquire);
        if pid == 0 {
            return Ok(None);
        }
        if !process_alive(pid)? {
            return Ok(None);
        }

        let cursor_wrap = header.cursor_wrap;
        let max_slot_size = header.max_slot_size;
        let expected = HEADER_SIZE as u64 + cursor_wrap + max_slot_size;
        if (segment.size() as u64) < expected {
            return Err(ShmError::Truncated(segment.size()));
        }

        let cursor = header.writer_cursor.load(Ordering::Acquire);

        Ok(Some(Self {
            segment,
            cursor_wrap,
            max_slot_size,
            cursor,
            last_recv: cursor,
        }))
    }

    #[inline]
    fn header(&self) -> &SegmentHeader {
        // SAFETY: validated in attach(); the header outlives the mapping
        unsafe { &*(self.segment.as_ptr() as *const SegmentHeader) }
    }

    /// Non-blocking consume of the next committed slot.
    ///
    /// The payload view is computed fresh on every call; nothing is copied.
    /// After consuming the view, call [`kept_up`](Self::kept_up) before
    /// publishing any result derived from it.
    pub fn recv(&mut self) -> Recv<'_> {
        let header = self.header();

        let writer_cursor = header.writer_cursor.load(Ordering::Acquire);
        if writer_cursor == self.cursor {
            return Recv::Empty;
        }

        let slot = HEADER_SIZE + (self.cursor % self.cursor_wrap) as usize;
        // SAFETY: slot is in bounds (cursor % cursor_wrap plus the tail) and
        // 16-byte aligned; volatile because the writer may be storing
        // concurrently in the lapped case, which the check below rejects
        let size = unsafe { (self.segment.as_ptr().add(slot) as *const u64).read_volatile() };

        // The prefix is only trustworthy if the slot is still entirely
        // behind the writer's safety window, assuming the writer may be
        // mid-way through a maximum-size slot right now.
        let after = header.writer_cursor.load(Ordering::Acquire);
        let lag = after.wrapping_sub(self.cursor);
        if lag + self.max_slot_size - SLOT_PREFIX as u64 > self.cursor_wrap {
            return Recv::Overrun;
        }

        // A size beyond the per-slot bound can only be a torn read from the
        // overrun race; never advance the cursor by it.
        if size > self.max_slot_size - SLOT_PREFIX as u64 {
            return Recv::Overrun;
        }

        self.last_recv = self.cursor;
        self.cursor = self
            .cursor
            .wrapping_add(round_up_16(SLOT_PREFIX + size as usize) as u64);

        // SAFETY: prefix + size fits the slot, which fits the mapping
        // (bounds as in the writer); the keep-up check is the caller's
        // correctness gate for concurrent overwrites
        let payload = unsafe {
            slice::from_raw_parts(self.segment.as_ptr().add(slot + SLOT_PREFIX), size as usize)
        };
        Recv::Payload(payload)
    }

    /// Whether the slot returned by the last [`recv`](Self::recv) was still
    /// intact when this is called.
    ///
    /// Call it after finishing with the payload view and before releasing
    /// any result computed from it; `false` means the writer may have
    /// overwritten the bytes mid-read and the result must be discarded.
    #[must_use]
    pub fn kept_up(&self) -> bool {
        let writer_cursor = self.header().writer_cursor.load(Ordering::Acquire);
        let lag = writer_cursor.wrapping_sub(self.last_recv);
        lag + self.max_slot_size <= self.cursor_wrap
    }

    /// Abandon everything behind the writer and resume at its live tail.
    ///
    /// The recovery move after [`Recv::Overrun`] for readers that prefer to
    /// keep consuming the stream rather than detach: every slot between the
    /// old cursor and the tail is given up as lost.
    pub fn skip_to_tail(&mut self) {
        let writer_cursor = self.header().writer_cursor.load(Ordering::Acquire);
        self.cursor = writer_cursor;
        self.last_recv = writer_cursor;
    }

    /// Whether the writer has gone away.
    ///
    /// True when the pid has been cleared or no longer names a live process.
    /// A probe failure other than "no such process" is logged and treated as
    /// EOF.
    #[must_use]
    pub fn eof(&self) -> bool {
        let pid = self.header().writer_pid.load(Ordering::Acquire);
        if pid == 0 {
            return true;
        }
        match process_alive(pid) {
            Ok(alive) => !alive,
            Err(err) => {
                warn!("writer liveness probe failed, treating as eof: {err}");
                true
            }
        }
    }
}
