// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! POSIX shared memory segment management.
//!
//! Safe wrappers around `shm_open`, `ftruncate`, and `mmap` for the two ends
//! of the fanout ring: the writer creates and maps read-write, readers open
//! and map read-only.
//!
//! # Segment Lifecycle
//!
//! 1. Writer creates the segment with [`ShmSegment::create`] (any stale
//!    segment of the same name is unlinked first)
//! 2. Readers map it with [`ShmSegment::open_read_only`]
//! 3. Each mapping is unmapped on drop
//! 4. The name persists in the OS namespace until the next writer unlinks
//!    and recreates it

use super::{Result, ShmError};
use std::ffi::CString;
use std::io;
use std::ptr;

/// A mapped POSIX shared memory segment.
///
/// Automatically unmaps the memory region on drop. Does NOT automatically
/// unlink the segment name; the next writer unlink-and-recreates it.
pub struct ShmSegment {
    /// Pointer to the mapped memory region
    ptr: *mut u8,
    /// Size of the mapping
    size: usize,
    /// Segment name
    name: String,
}

// SAFETY: ShmSegment points to shared memory accessed from multiple
// threads/processes. All cross-process coordination goes through the atomic
// fields of the ring header; the segment itself is just the mapping.
unsafe impl Send for ShmSegment {}
unsafe impl Sync for ShmSegment {}

impl ShmSegment {
    /// Create a new shared memory segment, replacing any existing segment of
    /// the same name, and map it read-write, zero-initialized.
    ///
    /// The segment is created mode 0o644 so that subscriber processes under
    /// other accounts can map it read-only.
    ///
    /// # Errors
    ///
    /// Returns an error if segment creation, sizing, or mapping fails.
    pub fn create(name: &str, size: usize) -> Result<Self> {
        let c_name = Self::validated_name(name)?;

        // SAFETY:
        // - c_name is a valid null-terminated CString
        // - shm_unlink of a stale segment is safe; errors are ignored
        // - shm_open with O_CREAT | O_EXCL creates a fresh object or fails
        // - returns a valid fd on success or -1 on error (checked below)
        let fd = unsafe {
            libc::shm_unlink(c_name.as_ptr());

            libc::shm_open(
                c_name.as_ptr(),
                libc::O_CREAT | libc::O_RDWR | libc::O_EXCL,
                0o644, // owner read/write, group and others read-only
            )
        };

        if fd < 0 {
            return Err(ShmError::SegmentCreate(io::Error::last_os_error()));
        }

        // SAFETY:
        // - fd is a valid descriptor from the successful shm_open above
        // - size as off_t cannot overflow for any ring this crate will size
        let ret = unsafe { libc::ftruncate(fd, size as libc::off_t) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            // SAFETY: fd is still valid; we are on the error path and will
            // not reuse it
            unsafe { libc::close(fd) };
            return Err(ShmError::SegmentCreate(err));
        }

        // SAFETY:
        // - null addr lets the kernel choose the mapping address
        // - PROT_READ | PROT_WRITE with MAP_SHARED is the writer mapping
        // - fd is valid from shm_open and was just sized by ftruncate
        // - mmap returns MAP_FAILED on error (checked below)
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };

        // SAFETY: the mapping (if any) holds its own reference; fd is not
        // used past this point
        unsafe { libc::close(fd) };

        if ptr == libc::MAP_FAILED {
            return Err(ShmError::Mmap(io::Error::last_os_error()));
        }

        // SAFETY:
        // - ptr points to exactly `size` freshly mapped writable bytes
        // - no other reference to this memory exists yet
        unsafe {
            ptr::write_bytes(ptr as *mut u8, 0, size);
        }

        Ok(Self {
            ptr: ptr as *mut u8,
            size,
            name: name.to_string(),
        })
    }

    /// Open an existing shared memory segment read-only.
    ///
    /// The mapping size is taken from the segment itself (`fstat`).
    ///
    /// # Errors
    ///
    /// Returns [`ShmError::NotFound`] if no segment of this name exists, and
    /// other variants for OS failures.
    pub fn open_read_only(name: &str) -> Result<Self> {
        let c_name = Self::validated_name(name)?;

        // SAFETY: c_name is a valid null-terminated CString; O_RDONLY opens
        // the existing object or fails with -1 (checked below)
        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDONLY, 0) };

        if fd < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::NotFound {
                return Err(ShmError::NotFound(name.to_string()));
            }
            return Err(ShmError::SegmentOpen(err));
        }

        // SAFETY: fd is valid; fstat writes into the zeroed stat buffer
        let mut stat: libc::stat = unsafe { std::mem::zeroed() };
        let ret = unsafe { libc::fstat(fd, &mut stat) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            // SAFETY: fd is still valid on this error path
            unsafe { libc::close(fd) };
            return Err(ShmError::SegmentStat(err));
        }
        let size = stat.st_size as usize;

        // SAFETY:
        // - null addr lets the kernel choose the mapping address
        // - PROT_READ with MAP_SHARED is the reader mapping; readers never
        //   store to the segment
        // - fd is valid and `size` is the object's own size from fstat
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };

        // SAFETY: the mapping (if any) holds its own reference
        unsafe { libc::close(fd) };

        if ptr == libc::MAP_FAILED {
            return Err(ShmError::Mmap(io::Error::last_os_error()));
        }

        Ok(Self {
            ptr: ptr as *mut u8,
            size,
            name: name.to_string(),
        })
    }

    /// Validate a segment name against POSIX rules and return it C-shaped.
    fn validated_name(name: &str) -> Result<CString> {
        if !name.starts_with('/') {
            return Err(ShmError::InvalidName(format!(
                "segment name must start with '/': {name}"
            )));
        }
        if name.len() > 1 && name[1..].contains('/') {
            return Err(ShmError::InvalidName(format!(
                "segment name cannot contain '/' after the prefix: {name}"
            )));
        }
        if name.len() > 255 {
            return Err(ShmError::InvalidName(format!(
                "segment name too long (max 255): {name}"
            )));
        }
        CString::new(name).map_err(|_| ShmError::InvalidName(name.to_string()))
    }

    /// Unlink (delete) a shared memory segment by name.
    ///
    /// Existing mappings stay valid; the name is removed from the namespace.
    /// A missing segment is not an error.
    pub fn unlink(name: &str) -> Result<()> {
        let c_name = Self::validated_name(name)?;

        // SAFETY: c_name is a valid null-terminated CString; shm_unlink only
        // touches the filesystem namespace
        let ret = unsafe { libc::shm_unlink(c_name.as_ptr()) };

        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::NotFound {
                return Err(ShmError::SegmentOpen(err));
            }
        }

        Ok(())
    }

    /// Raw pointer to the mapped memory.
    #[inline]
    #[must_use]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    /// Size of the mapping in bytes.
    #[inline]
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Segment name.
    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for ShmSegment {
    fn drop(&mut self) {
        // SAFETY:
        // - self.ptr came from a successful mmap of exactly self.size bytes
        // - Drop runs at most once, so the region is not unmapped twice
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.size);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_must_start_with_slash() {
        assert!(matches!(
            ShmSegment::create("no_slash", 4096),
            Err(ShmError::InvalidName(_))
        ));
    }

    #[test]
    fn test_name_rejects_inner_slash() {
        assert!(matches!(
            ShmSegment::create("/a/b", 4096),
            Err(ShmError::InvalidName(_))
        ));
    }

    #[test]
    fn test_open_missing_is_not_found() {
        ShmSegment::unlink("/cobsfan_test_missing").expect("unlink");
        assert!(matches!(
            ShmSegment::open_read_only("/cobsfan_test_missing"),
            Err(ShmError::NotFound(_))
        ));
    }

    #[test]
    fn test_create_zeroes_and_sizes() {
        let seg = ShmSegment::create("/cobsfan_test_segment", 8192).expect("create");
        assert_eq!(seg.size(), 8192);
        // SAFETY: freshly created mapping of 8192 bytes, exclusive access
        let bytes = unsafe { std::slice::from_raw_parts(seg.as_ptr(), 8192) };
        assert!(bytes.iter().all(|&b| b == 0));
        drop(seg);
        ShmSegment::unlink("/cobsfan_test_segment").expect("unlink");
    }
}
