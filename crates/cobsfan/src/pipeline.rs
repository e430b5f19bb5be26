// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The ingest loop: source -> ring slot -> subscribers and rolling files.
//!
//! Each iteration decodes one datagram directly into the pending ring slot
//! (after the 8-byte header position), stamps the header, publishes the slot
//! to subscribers, and appends the identical bytes to the current log file.
//! Publication always precedes the file write, so a slow disk delays the log
//! but never the fanout.
//!
//! ```text
//! source bytes -> [header | payload | pad] in ring slot -> commit
//!                                                  \-> current log file
//! ```
//!
//! Frames arrive either from a byte stream carrying COBS frames
//! ([`CobsSource`], stamped on arrival) or from the on-disk record format
//! ([`ReplaySource`], recorded timestamps preserved).

use crate::cobs;
use crate::frame::{round_up_8, FrameHeader, HEADER_SIZE, MAX_PAYLOAD};
use crate::rotation::RotatingLog;
use crate::shm::RingWriter;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Output latency above which a warning is emitted, in microseconds.
const SLOW_OUTPUT_MICROS: u64 = 100_000;

/// Errors that terminate the pipeline with a nonzero exit.
///
/// Source-side failures are not in here: end of stream and read errors shut
/// the pipeline down gracefully (logged, exit zero), matching the contract
/// that a vanished device is a normal way for a capture to end.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Writing a log file failed; frames would be lost silently otherwise.
    #[error("log file write failed: {0}")]
    Log(#[source] io::Error),

    /// Writing the control output failed.
    #[error("control output write failed: {0}")]
    Control(#[source] io::Error),
}

/// Wall-clock source for frame arrival stamps.
pub trait Clock: Send {
    /// Microseconds since the unix epoch.
    fn unix_micros(&self) -> u64;
}

/// The system realtime clock.
pub struct SystemClock;

impl Clock for SystemClock {
    fn unix_micros(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0)
    }
}

/// One frame delivered by a [`FrameSource`].
#[derive(Debug, Clone, Copy)]
pub struct FrameMeta {
    /// Decoded payload length now sitting in the caller's buffer.
    pub len: usize,
    /// Timestamp carried by the source, if it has one; otherwise the
    /// pipeline stamps the frame with its own clock.
    pub unix_micros: Option<u64>,
}

/// Something that can fill a buffer with the next datagram payload.
pub trait FrameSource {
    /// Write the next payload into `dst`. `Ok(None)` means the stream ended
    /// cleanly and no more frames will arrive.
    ///
    /// # Errors
    ///
    /// Source read failures propagate; the pipeline logs them and shuts
    /// down.
    fn next_frame(&mut self, dst: &mut [u8]) -> io::Result<Option<FrameMeta>>;
}

/// COBS-framed byte stream; frames are stamped by the pipeline clock.
pub struct CobsSource<R> {
    inner: R,
}

impl<R: Read> CobsSource<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }
}

impl<R: Read> FrameSource for CobsSource<R> {
    fn next_frame(&mut self, dst: &mut [u8]) -> io::Result<Option<FrameMeta>> {
        match cobs::read_frame(dst, &mut self.inner) {
            Ok(len) => Ok(Some(FrameMeta {
                len,
                unix_micros: None,
            })),
            // End of the byte stream; a partial frame is dropped.
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => Ok(None),
            Err(err) => Err(err),
        }
    }
}

/// Pre-decoded frames in the on-disk record format (8-byte header, payload,
/// zero padding to 8 bytes). Recorded timestamps are carried through.
pub struct ReplaySource<R> {
    inner: R,
}

impl<R: Read> ReplaySource<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }
}

impl<R: Read> FrameSource for ReplaySource<R> {
    fn next_frame(&mut self, dst: &mut [u8]) -> io::Result<Option<FrameMeta>> {
        let mut word = [0u8; HEADER_SIZE];
        loop {
            match self.inner.read_exact(&mut word) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
                Err(err) => return Err(err),
            }
            // An all-zero word is filler, not a record.
            if word.iter().any(|&b| b != 0) {
                break;
            }
        }

        let header = FrameHeader::read_from(&word);
        let len = header.payload_len as usize;
        let padded = round_up_8(len);
        if len > MAX_PAYLOAD || padded > dst.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("record claims {len} payload bytes, maximum is {MAX_PAYLOAD}"),
            ));
        }

        match self.inner.read_exact(&mut dst[..padded]) {
            Ok(()) => {}
            // A truncated final record ends the stream.
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(err) => return Err(err),
        }

        Ok(Some(FrameMeta {
            len,
            unix_micros: Some(header.unix_micros()),
        }))
    }
}

/// Adapts a reader whose `read` can time out (a serial port with a receive
/// timeout) into a blocking one, while honoring the shutdown latch.
///
/// Timeouts and EINTR wakeups retry; once the latch is set, the next read
/// fails with an error the pipeline recognizes as a shutdown, so
/// `read_exact`'s internal retry on `Interrupted` cannot swallow it.
pub struct BlockingReader<R> {
    inner: R,
    shutdown: Arc<AtomicBool>,
}

impl<R: Read> BlockingReader<R> {
    pub fn new(inner: R, shutdown: Arc<AtomicBool>) -> Self {
        Self { inner, shutdown }
    }
}

impl<R: Read> Read for BlockingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                return Err(io::Error::new(io::ErrorKind::Other, "shutdown requested"));
            }
            match self.inner.read(buf) {
                Err(err)
                    if matches!(
                        err.kind(),
                        io::ErrorKind::TimedOut
                            | io::ErrorKind::WouldBlock
                            | io::ErrorKind::Interrupted
                    ) =>
                {
                    continue;
                }
                result => return result,
            }
        }
    }
}

/// The single-threaded ingest loop.
///
/// Owns the ring writer for its whole life; dropping the pipeline clears the
/// writer pid, which subscribers observe as EOF.
pub struct Pipeline {
    ring: RingWriter,
    log: Option<RotatingLog>,
    clock: Box<dyn Clock>,
    control: Box<dyn Write + Send>,
    shutdown: Arc<AtomicBool>,
    prev_micros: u64,
}

impl Pipeline {
    /// Build a pipeline over a ring, with logging disabled, the system
    /// clock, and stdout as the control output.
    pub fn new(ring: RingWriter, shutdown: Arc<AtomicBool>) -> Self {
        Self {
            ring,
            log: None,
            clock: Box::new(SystemClock),
            control: Box::new(io::stdout()),
            shutdown,
            prev_micros: 0,
        }
    }

    /// Enable logging into `staging_dir`.
    pub fn with_staging_dir(mut self, staging_dir: impl Into<PathBuf>) -> Self {
        self.log = Some(RotatingLog::new(staging_dir));
        self
    }

    /// Replace the arrival clock.
    pub fn with_clock(mut self, clock: Box<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replace the control output.
    pub fn with_control(mut self, control: Box<dyn Write + Send>) -> Self {
        self.control = control;
        self
    }

    /// Run until the source ends, a source error occurs, or the shutdown
    /// latch is set.
    ///
    /// # Errors
    ///
    /// Only log-file and control-output failures are errors; everything
    /// source-side shuts down gracefully.
    pub fn run(&mut self, source: &mut dyn FrameSource) -> Result<(), PipelineError> {
        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                info!("shutdown requested, leaving ingest loop");
                break;
            }

            // Decode straight into the pending slot, leaving room for the
            // header. The slot is re-acquired every pass; it only moves on
            // commit.
            let slot = self.ring.acquire();
            let meta = match source.next_frame(&mut slot[HEADER_SIZE..]) {
                Ok(Some(meta)) => meta,
                Ok(None) => {
                    info!("source stream ended");
                    break;
                }
                Err(err) => {
                    if self.shutdown.load(Ordering::Relaxed) {
                        info!("shutdown requested, leaving ingest loop");
                    } else if err.raw_os_error() == Some(libc::ENXIO) {
                        info!("source device went away");
                    } else {
                        error!("source read failed: {err}");
                    }
                    break;
                }
            };

            if self.shutdown.load(Ordering::Relaxed) {
                info!("shutdown requested, dropping frame in flight");
                break;
            }
            if meta.len == 0 {
                continue;
            }

            let t = meta
                .unix_micros
                .unwrap_or_else(|| self.clock.unix_micros());
            if t < self.prev_micros {
                warn!(
                    "time jumped backwards by {} us, new time is {t}",
                    self.prev_micros - t
                );
            }
            self.prev_micros = t;

            self.rotate_and_open(t)?;
            self.publish(meta.len, t)?;

            // Replayed frames carry historical stamps; latency is only
            // meaningful against the live clock.
            if meta.unix_micros.is_none() {
                let elapsed = self.clock.unix_micros().saturating_sub(t);
                if elapsed >= SLOW_OUTPUT_MICROS {
                    warn!("output took {} ms", elapsed / 1000);
                }
            }
        }

        self.finish()
    }

    /// Steps 5 and 6: close a finished bucket (reporting its path) and make
    /// sure a file is open for this frame's bucket.
    fn rotate_and_open(&mut self, t: u64) -> Result<(), PipelineError> {
        let closed = match &mut self.log {
            Some(log) => log.maybe_close(t).map_err(PipelineError::Log)?,
            None => None,
        };
        if let Some(path) = closed {
            emit_path(&mut self.control, &path)?;
        }
        if let Some(log) = &mut self.log {
            log.ensure_open(t).map_err(PipelineError::Log)?;
        }
        Ok(())
    }

    /// Steps 7 through 10: stamp, pad, commit, append.
    fn publish(&mut self, len: usize, t: u64) -> Result<(), PipelineError> {
        let padded = round_up_8(len);

        let slot = self.ring.acquire();
        FrameHeader::stamp(len, t).write_to(slot);
        slot[HEADER_SIZE + len..HEADER_SIZE + padded].fill(0);

        if let Some(text) = printable_prefix(&slot[HEADER_SIZE..HEADER_SIZE + len]) {
            debug!("text frame: \"{text}\"");
        }

        self.ring.commit(HEADER_SIZE + len);

        if let Some(log) = &mut self.log {
            let record = self.ring.last_committed(HEADER_SIZE + padded);
            log.append(record).map_err(PipelineError::Log)?;
        }
        Ok(())
    }

    /// Close out the current file on the way down.
    fn finish(&mut self) -> Result<(), PipelineError> {
        let closed = match &mut self.log {
            Some(log) => log.close().map_err(PipelineError::Log)?,
            None => None,
        };
        if let Some(path) = closed {
            emit_path(&mut self.control, &path)?;
        }
        Ok(())
    }
}

/// Report a closed file on the control output, one absolute path per line,
/// flushed immediately so a piped consumer sees it right away.
fn emit_path(control: &mut (dyn Write + Send), path: &Path) -> Result<(), PipelineError> {
    writeln!(control, "{}", path.display()).map_err(PipelineError::Control)?;
    control.flush().map_err(PipelineError::Control)
}

/// The leading run of printable characters, up to the first line break, if
/// the run covers the whole payload up to that break.
fn printable_prefix(payload: &[u8]) -> Option<&str> {
    let mut end = 0;
    for &byte in payload {
        if byte == b'\r' || byte == b'\n' {
            break;
        }
        if !byte.is_ascii_graphic() && byte != b' ' {
            return None;
        }
        end += 1;
    }
    if end == 0 {
        return None;
    }
    std::str::from_utf8(&payload[..end]).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_printable_prefix() {
        assert_eq!(printable_prefix(b"hello world\r\n"), Some("hello world"));
        assert_eq!(printable_prefix(b"GPS,12.5,7"), Some("GPS,12.5,7"));
        assert_eq!(printable_prefix(&[0x01, 0x02]), None);
        assert_eq!(printable_prefix(b"ok\x00junk"), None);
        assert_eq!(printable_prefix(b""), None);
        assert_eq!(printable_prefix(b"\n"), None);
    }

    #[test]
    fn test_cobs_source_end_of_stream() {
        let mut source = CobsSource::new(Cursor::new(vec![0x03, b'h', b'i', 0x00]));
        let mut dst = [0u8; 64];

        let meta = source
            .next_frame(&mut dst)
            .expect("read")
            .expect("one frame");
        assert_eq!(meta.len, 2);
        assert_eq!(meta.unix_micros, None);
        assert_eq!(&dst[..2], b"hi");

        assert!(source.next_frame(&mut dst).expect("read").is_none());
    }

    #[test]
    fn test_replay_source_carries_timestamps() {
        let mut record = Vec::new();
        // Zero filler word first; it must be skipped.
        record.extend_from_slice(&[0u8; 8]);
        let mut header = [0u8; 8];
        FrameHeader::stamp(3, 1_600_000_000_000_000).write_to(&mut header);
        record.extend_from_slice(&header);
        record.extend_from_slice(b"abc\0\0\0\0\0"); // 3 bytes + pad to 8

        let mut source = ReplaySource::new(Cursor::new(record));
        let mut dst = [0u8; 64];
        let meta = source
            .next_frame(&mut dst)
            .expect("read")
            .expect("one frame");
        assert_eq!(meta.len, 3);
        assert_eq!(meta.unix_micros, Some(1_600_000_000_000_000));
        assert_eq!(&dst[..3], b"abc");

        assert!(source.next_frame(&mut dst).expect("read").is_none());
    }

    #[test]
    fn test_replay_source_rejects_oversize_record() {
        let mut record = Vec::new();
        let word = (1u64 << 16) | 0xFFFF; // size 65535, some timestamp
        record.extend_from_slice(&word.to_le_bytes());
        let mut source = ReplaySource::new(Cursor::new(record));
        let mut dst = [0u8; 64];
        let err = source.next_frame(&mut dst).expect_err("oversize");
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_blocking_reader_retries_timeouts() {
        struct FlakyReader {
            timeouts_left: u32,
            payload: Vec<u8>,
        }
        impl Read for FlakyReader {
            fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
                if self.timeouts_left > 0 {
                    self.timeouts_left -= 1;
                    return Err(io::Error::new(io::ErrorKind::TimedOut, "timeout"));
                }
                (&self.payload[..]).read(buf)
            }
        }

        let shutdown = Arc::new(AtomicBool::new(false));
        let mut reader = BlockingReader::new(
            FlakyReader {
                timeouts_left: 3,
                payload: b"x".to_vec(),
            },
            shutdown,
        );
        let mut buf = [0u8; 1];
        assert_eq!(reader.read(&mut buf).expect("read"), 1);
        assert_eq!(buf[0], b'x');
    }

    #[test]
    fn test_blocking_reader_honors_shutdown() {
        let shutdown = Arc::new(AtomicBool::new(true));
        let mut reader = BlockingReader::new(Cursor::new(vec![1u8, 2, 3]), shutdown);
        let mut buf = [0u8; 1];
        let err = reader.read(&mut buf).expect_err("shutdown");
        assert_ne!(err.kind(), io::ErrorKind::Interrupted);
    }
}
