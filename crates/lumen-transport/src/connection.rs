//! Blocking channel to the device simulator.
//!
//! A connection is one Unix-domain stream plus one shared transfer region
//! whose fd has been handed to the peer via SCM_RIGHTS ancillary data. All
//! header traffic is blocking and strictly request/response: one 16-byte
//! send is paired with one 6-byte receive before the next send.

use std::io::{self, Read, Write};
use std::mem;
use std::os::fd::{AsRawFd, BorrowedFd, RawFd};
use std::os::unix::net::UnixStream;

use tracing::{debug, info};

use lumen_protocol::wire::{COMMAND_HEADER_LEN, RESPONSE_LEN};

use crate::error::TransportError;
use crate::shmem::SharedTransferRegion;

/// Region growth granularity. Anything smaller than a page is pointless to
/// map on its own.
const REGION_ALIGN: usize = 4096;

pub struct ChannelConnection {
    stream: UnixStream,
    region: SharedTransferRegion,
}

impl ChannelConnection {
    /// Connect to the simulator's socket, create the shared transfer region,
    /// and hand its fd to the peer. Any failure here is fatal; the caller
    /// retries from scratch.
    pub fn connect(socket_path: &str, region_bytes: usize) -> Result<Self, TransportError> {
        let stream = UnixStream::connect(socket_path).map_err(TransportError::Connect)?;
        let region = SharedTransferRegion::create(region_bytes)?;
        send_fd(&stream, region.fd())?;
        info!(
            socket = socket_path,
            region_bytes = region.len(),
            "connected to device simulator"
        );
        Ok(ChannelConnection { stream, region })
    }

    /// Send exactly one command header. Interrupted writes are retried;
    /// a broken pipe or closed peer fails hard.
    pub fn send_header(&mut self, header: &[u8; COMMAND_HEADER_LEN]) -> Result<(), TransportError> {
        match self.stream.write_all(header) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => Err(TransportError::PeerClosed),
            Err(e) => Err(e.into()),
        }
    }

    /// Block until one completion response has been read. A zero-length read
    /// is peer-initiated shutdown, reported as [`TransportError::PeerClosed`]
    /// rather than an IO error.
    pub fn recv_response(&mut self) -> Result<[u8; RESPONSE_LEN], TransportError> {
        let mut buf = [0u8; RESPONSE_LEN];
        match self.stream.read_exact(&mut buf) {
            Ok(()) => Ok(buf),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(TransportError::PeerClosed),
            Err(e) => Err(e.into()),
        }
    }

    pub fn region(&self) -> &SharedTransferRegion {
        &self.region
    }

    pub fn region_mut(&mut self) -> &mut SharedTransferRegion {
        &mut self.region
    }

    /// Make sure the shared region holds at least `min_bytes`. Shared memory
    /// cannot be resized under an already-connected peer, so growth replaces
    /// the region wholesale: new memfd, new mapping, new fd handshake; the
    /// old mapping is torn down once the replacement is in place.
    pub fn ensure_region(&mut self, min_bytes: usize) -> Result<(), TransportError> {
        if min_bytes <= self.region.len() {
            return Ok(());
        }
        let new_len = min_bytes
            .checked_next_multiple_of(REGION_ALIGN)
            .unwrap_or(min_bytes);
        debug!(
            old_bytes = self.region.len(),
            new_bytes = new_len,
            "re-establishing shared transfer region"
        );
        let region = SharedTransferRegion::create(new_len)?;
        send_fd(&self.stream, region.fd())?;
        self.region = region;
        Ok(())
    }
}

/// Transfer a file descriptor to the peer as SCM_RIGHTS ancillary data on a
/// one-byte control message. This is the only way both processes end up
/// observing the same physical pages.
fn send_fd(stream: &UnixStream, fd: BorrowedFd<'_>) -> Result<(), TransportError> {
    const CMSG_BUFFER_LEN: usize =
        unsafe { libc::CMSG_SPACE(mem::size_of::<RawFd>() as u32) as usize };

    let mut data = [0u8; 1];
    let mut iov = libc::iovec {
        iov_base: data.as_mut_ptr().cast(),
        iov_len: data.len(),
    };

    let mut cmsg_buffer = [0u8; CMSG_BUFFER_LEN];
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buffer.as_mut_ptr().cast();
    msg.msg_controllen = cmsg_buffer.len() as _;

    let raw_fd = fd.as_raw_fd();
    unsafe {
        let cmsg = libc::CMSG_FIRSTHDR(&msg);
        (*cmsg).cmsg_level = libc::SOL_SOCKET;
        (*cmsg).cmsg_type = libc::SCM_RIGHTS;
        (*cmsg).cmsg_len = libc::CMSG_LEN(mem::size_of::<RawFd>() as u32) as _;
        std::ptr::copy_nonoverlapping(
            (&raw_fd as *const RawFd).cast::<u8>(),
            libc::CMSG_DATA(cmsg),
            mem::size_of::<RawFd>(),
        );
    }

    loop {
        let sent = unsafe { libc::sendmsg(stream.as_raw_fd(), &msg, 0) };
        if sent != -1 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            continue;
        }
        return Err(TransportError::Handshake(err));
    }
}
