//! Shared transfer region: a memfd-backed mapping handed to the device peer
//! so bulk payloads move without crossing the socket.
//!
//! The handle and mapping are created together and destroyed together.
//! `len` is the single source of truth for valid offsets; every access is
//! bounds-checked against it. The region cannot be resized in place; a
//! larger region means a fresh memfd and a fresh handshake (see
//! [`crate::connection::ChannelConnection::ensure_region`]).

use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd};
use std::ptr::NonNull;

use crate::error::TransportError;

const MEMFD_NAME: &std::ffi::CStr = c"lumen-transfer";

pub struct SharedTransferRegion {
    fd: OwnedFd,
    ptr: NonNull<u8>,
    len: usize,
}

// The mapping is plain bytes; exclusive access is enforced by &mut on writes
// and by the request/response discipline towards the peer.
unsafe impl Send for SharedTransferRegion {}
unsafe impl Sync for SharedTransferRegion {}

impl SharedTransferRegion {
    /// Create an anonymously-backed memory object of exactly `len` bytes and
    /// map it read-write. Creation, sizing, and mapping failures are
    /// distinct and non-retryable.
    pub fn create(len: usize) -> Result<Self, TransportError> {
        if len == 0 {
            return Err(TransportError::EmptyRegion);
        }

        let raw = unsafe { libc::memfd_create(MEMFD_NAME.as_ptr(), libc::MFD_CLOEXEC) };
        if raw == -1 {
            return Err(TransportError::RegionCreate(io::Error::last_os_error()));
        }
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        if unsafe { libc::ftruncate(fd.as_raw_fd(), len as libc::off_t) } == -1 {
            return Err(TransportError::RegionSize(io::Error::last_os_error()));
        }

        let mapped = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd.as_raw_fd(),
                0,
            )
        };
        if mapped == libc::MAP_FAILED {
            return Err(TransportError::RegionMap(io::Error::last_os_error()));
        }

        Ok(SharedTransferRegion {
            fd,
            // SAFETY: mmap success is never null
            ptr: unsafe { NonNull::new_unchecked(mapped.cast()) },
            len,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The backing handle, borrowed for the handshake.
    pub fn fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }

    /// Stage bytes into the region before a command header is sent.
    pub fn write_at(&mut self, offset: usize, bytes: &[u8]) -> Result<(), TransportError> {
        self.check_bounds(offset, bytes.len())?;
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                self.ptr.as_ptr().add(offset),
                bytes.len(),
            );
        }
        Ok(())
    }

    /// Pull bytes out of the region after a completion has been consumed.
    pub fn read_into(&self, offset: usize, buf: &mut [u8]) -> Result<(), TransportError> {
        self.check_bounds(offset, buf.len())?;
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.ptr.as_ptr().add(offset),
                buf.as_mut_ptr(),
                buf.len(),
            );
        }
        Ok(())
    }

    fn check_bounds(&self, offset: usize, len: usize) -> Result<(), TransportError> {
        match offset.checked_add(len) {
            Some(end) if end <= self.len => Ok(()),
            _ => Err(TransportError::RegionBounds {
                offset,
                len,
                region: self.len,
            }),
        }
    }
}

impl Drop for SharedTransferRegion {
    fn drop(&mut self) {
        unsafe {
            let _ = libc::munmap(self.ptr.as_ptr().cast(), self.len);
        }
    }
}
