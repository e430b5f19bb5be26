// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Rolling log files on 10-second wall-clock buckets.
//!
//! Frames are appended to a file named for the UTC second of the first frame
//! in its bucket (`YYYYMMDDTHHMMSSZ.bin`). The file is opened lazily on that
//! first frame and closed on the first frame belonging to a different
//! bucket; the caller reports each closed path on the control output so a
//! downstream mover can pick it up.
//!
//! The staging directory is expected to live on fast volatile storage
//! (tmpfs); moving finished files to their final home is someone else's job.

use chrono::{DateTime, Utc};
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Width of one rotation bucket in microseconds.
pub const BUCKET_MICROS: u64 = 10_000_000;

/// The bucket a timestamp belongs to: its value rounded down to the bucket
/// width.
#[inline]
#[must_use]
pub const fn bucket_of(unix_micros: u64) -> u64 {
    unix_micros - unix_micros % BUCKET_MICROS
}

/// File name for a bucket whose first frame arrived at `unix_micros`:
/// ISO-8601 basic format, UTC, rounded down to seconds.
#[must_use]
pub fn file_name(unix_micros: u64) -> String {
    let when = DateTime::<Utc>::from_timestamp((unix_micros / 1_000_000) as i64, 0)
        .unwrap_or(DateTime::UNIX_EPOCH);
    format!("{}.bin", when.format("%Y%m%dT%H%M%SZ"))
}

struct OpenFile {
    file: BufWriter<File>,
    path: PathBuf,
    bucket: u64,
}

/// Bucket-rotated frame log.
pub struct RotatingLog {
    staging_dir: PathBuf,
    current: Option<OpenFile>,
}

impl RotatingLog {
    pub fn new(staging_dir: impl Into<PathBuf>) -> Self {
        Self {
            staging_dir: staging_dir.into(),
            current: None,
        }
    }

    /// Close the current file if a frame at `unix_micros` belongs to a
    /// different bucket. Returns the closed path, which the caller must
    /// report on the control output.
    pub fn maybe_close(&mut self, unix_micros: u64) -> io::Result<Option<PathBuf>> {
        let rotated = self
            .current
            .as_ref()
            .is_some_and(|open| open.bucket != bucket_of(unix_micros));
        if rotated {
            self.close()
        } else {
            Ok(None)
        }
    }

    /// Open a file for the bucket of `unix_micros` if none is open.
    pub fn ensure_open(&mut self, unix_micros: u64) -> io::Result<()> {
        if self.current.is_some() {
            return Ok(());
        }
        let path = self.staging_dir.join(file_name(unix_micros));
        let file = File::create(&path)?;
        debug!("opened {}", path.display());
        self.current = Some(OpenFile {
            file: BufWriter::new(file),
            path,
            bucket: bucket_of(unix_micros),
        });
        Ok(())
    }

    /// Append one on-disk record (header plus padded payload) to the
    /// current file. A file must be open.
    pub fn append(&mut self, record: &[u8]) -> io::Result<()> {
        match &mut self.current {
            Some(open) => open.file.write_all(record),
            None => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "no log file open",
            )),
        }
    }

    /// Close the current file, if any, returning its path.
    pub fn close(&mut self) -> io::Result<Option<PathBuf>> {
        match self.current.take() {
            Some(mut open) => {
                open.file.flush()?;
                debug!("closed {}", open.path.display());
                Ok(Some(open.path))
            }
            None => Ok(None),
        }
    }

    /// Whether a file is currently open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.current.is_some()
    }

    /// The configured staging directory.
    #[must_use]
    pub fn staging_dir(&self) -> &Path {
        &self.staging_dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_bucket_of() {
        assert_eq!(bucket_of(0), 0);
        assert_eq!(bucket_of(9_999_999), 0);
        assert_eq!(bucket_of(10_000_000), 10_000_000);
        assert_eq!(bucket_of(123_456_789_012), 123_450_000_000);
    }

    #[test]
    fn test_file_name_epoch() {
        assert_eq!(file_name(0), "19700101T000000Z.bin");
    }

    #[test]
    fn test_file_name_rounds_down_to_seconds() {
        // 2023-11-14T22:13:20.999999Z
        assert_eq!(file_name(1_700_000_000_999_999), "20231114T221320Z.bin");
    }

    #[test]
    fn test_lazy_open_and_rotate() {
        let dir = tempdir().expect("tempdir");
        let mut log = RotatingLog::new(dir.path());
        assert!(!log.is_open());

        // Same bucket: no close, one file.
        assert_eq!(log.maybe_close(1_000_000).expect("maybe_close"), None);
        log.ensure_open(1_000_000).expect("open");
        log.append(b"aaaaaaaa").expect("append");
        assert_eq!(log.maybe_close(9_000_000).expect("maybe_close"), None);
        assert!(log.is_open());

        // Next bucket: the old file closes and its path comes back.
        let closed = log
            .maybe_close(10_000_001)
            .expect("maybe_close")
            .expect("closed path");
        assert_eq!(
            closed.file_name().and_then(|n| n.to_str()),
            Some("19700101T000000Z.bin")
        );
        assert!(!log.is_open());

        log.ensure_open(10_000_001).expect("reopen");
        let closed = log.close().expect("close").expect("closed path");
        assert_eq!(
            closed.file_name().and_then(|n| n.to_str()),
            Some("19700101T000010Z.bin")
        );
        assert_eq!(std::fs::read(dir.path().join("19700101T000000Z.bin")).expect("read"), b"aaaaaaaa");
    }

    #[test]
    fn test_append_without_open_fails() {
        let dir = tempdir().expect("tempdir");
        let mut log = RotatingLog::new(dir.path());
        assert!(log.append(b"nope").is_err());
    }
}
