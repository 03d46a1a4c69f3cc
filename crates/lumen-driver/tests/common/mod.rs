//! Scripted device-simulator peer.
//!
//! Speaks the same wire protocol as the real simulator frontend: accepts one
//! Unix-socket connection, receives the shared-region fd via SCM_RIGHTS,
//! then services 16-byte command headers against a flat byte-array DRAM
//! model. Kernel execution is scripted per test through a closure instead of
//! an instruction interpreter.

use std::io::{self, Read, Write};
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;
use std::thread::{self, JoinHandle};

const DRAM_LEN: usize = 4 << 20;

/// Scripted kernel execution: called once per KERNEL command with the launch
/// index (0-based) and a view of device memory. `Err(pc)` makes the peer
/// report an execution fault at that device program counter.
pub type KernelScript = Box<dyn FnMut(usize, &mut LaunchView<'_>) -> Result<(), u32> + Send>;

/// Device memory as one launched kernel sees it.
pub struct LaunchView<'a> {
    pub entry_pc: u32,
    pub params_base: u32,
    dram: &'a mut [u8],
}

impl LaunchView<'_> {
    /// Read the n-th 32-bit launch parameter (device addresses are passed as
    /// 32-bit words).
    pub fn param_u32(&self, index: usize) -> u32 {
        self.read_u32(self.params_base + 4 * index as u32)
    }

    pub fn read_u32(&self, addr: u32) -> u32 {
        let addr = addr as usize;
        u32::from_le_bytes(self.dram[addr..addr + 4].try_into().unwrap())
    }

    pub fn write_u32(&mut self, addr: u32, value: u32) {
        let addr = addr as usize;
        self.dram[addr..addr + 4].copy_from_slice(&value.to_le_bytes());
    }
}

#[derive(Default)]
pub struct PeerOptions {
    /// Inject one response naming a never-issued command id ahead of the
    /// first real response.
    pub bogus_first_response: bool,
    /// Report every device-to-host copy as an execution fault without
    /// writing the shared region.
    pub fail_d2h: bool,
}

pub struct SimPeer {
    handle: Option<JoinHandle<()>>,
}

impl SimPeer {
    pub fn spawn(socket_path: &Path, kernels: KernelScript) -> SimPeer {
        Self::spawn_with(socket_path, kernels, PeerOptions::default())
    }

    pub fn spawn_with(socket_path: &Path, kernels: KernelScript, options: PeerOptions) -> SimPeer {
        // bind before returning so the driver can connect immediately
        let listener = UnixListener::bind(socket_path).expect("bind peer socket");
        let handle = thread::spawn(move || {
            let (stream, _) = listener.accept().expect("accept");
            serve(stream, kernels, options);
        });
        SimPeer {
            handle: Some(handle),
        }
    }
}

impl Drop for SimPeer {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.join().expect("peer thread");
        }
    }
}

fn serve(mut stream: UnixStream, mut kernels: KernelScript, mut options: PeerOptions) {
    let mut dram = vec![0u8; DRAM_LEN];
    let mut region: Option<PeerRegion> = None;
    let mut launches = 0usize;

    loop {
        match recv_byte(&stream) {
            Message::Closed => return,
            Message::Fd(fd) => {
                region = Some(PeerRegion::map(&fd).expect("map shared region"));
            }
            Message::Data(first) => {
                let mut header = [0u8; 16];
                header[0] = first;
                stream.read_exact(&mut header[1..]).expect("read header");
                let shared = region.as_mut().expect("region before commands");

                let response = match header[1] {
                    0 => run_kernel(&header, shared, &mut dram, &mut kernels, &mut launches),
                    1 => run_copy(&header, shared, &mut dram, options.fail_d2h),
                    other => panic!("unexpected command type byte {other}"),
                };
                if options.bogus_first_response {
                    options.bogus_first_response = false;
                    stream
                        .write_all(&[0xee, 0, 0, 0, 0, 0])
                        .expect("write bogus response");
                }
                stream.write_all(&response).expect("write response");
            }
        }
    }
}

fn run_kernel(
    header: &[u8; 16],
    region: &mut PeerRegion,
    dram: &mut [u8],
    kernels: &mut KernelScript,
    launches: &mut usize,
) -> [u8; 6] {
    let payload_offset = read_u32(header, 2) as usize;
    let payload_len = read_u32(header, 6) as usize;
    let device_base = read_u32(header, 10) as usize;

    let blob = &region.bytes()[payload_offset..payload_offset + payload_len];
    dram[device_base..device_base + payload_len].copy_from_slice(blob);

    let entry_pc = u32::from_le_bytes(dram[device_base + 4..device_base + 8].try_into().unwrap());
    let params_base =
        u32::from_le_bytes(dram[device_base + 24..device_base + 28].try_into().unwrap());

    let mut view = LaunchView {
        entry_pc,
        params_base,
        dram,
    };
    let index = *launches;
    *launches += 1;

    match kernels(index, &mut view) {
        Ok(()) => response(header[0], 0, entry_pc),
        Err(pc) => response(header[0], 1, pc),
    }
}

fn run_copy(header: &[u8; 16], region: &mut PeerRegion, dram: &mut [u8], fail_d2h: bool) -> [u8; 6] {
    assert_eq!(header[2], 0, "only COPY mem commands are expected");
    let src = read_u32(header, 3) as usize;
    let dst = read_u32(header, 7) as usize;
    let len = read_u32(header, 11) as usize;

    match header[15] {
        0 => dram[dst..dst + len].copy_from_slice(&region.bytes()[src..src + len]),
        1 if fail_d2h => return response(header[0], 1, 0),
        1 => region.bytes_mut()[dst..dst + len].copy_from_slice(&dram[src..src + len]),
        other => panic!("unexpected copy direction byte {other}"),
    }
    response(header[0], 0, 0)
}

fn response(command_id: u8, error: u8, pc: u32) -> [u8; 6] {
    let mut bytes = [0u8; 6];
    bytes[0] = command_id;
    bytes[1] = error;
    bytes[2..6].copy_from_slice(&pc.to_le_bytes());
    bytes
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(bytes[offset..offset + 4].try_into().unwrap())
}

enum Message {
    Closed,
    Fd(OwnedFd),
    Data(u8),
}

/// Receive one byte plus any SCM_RIGHTS ancillary data. Fd handshakes are
/// single-byte messages carrying a cmsg; command header bytes carry none, so
/// one byte is enough to tell them apart.
fn recv_byte(stream: &UnixStream) -> Message {
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

    let received = unsafe { libc::recvmsg(stream.as_raw_fd(), &mut msg, 0) };
    if received < 0 {
        panic!("recvmsg: {}", io::Error::last_os_error());
    }
    if received == 0 {
        return Message::Closed;
    }

    let cmsg = unsafe { libc::CMSG_FIRSTHDR(&msg) };
    if !cmsg.is_null() && unsafe { (*cmsg).cmsg_type } == libc::SCM_RIGHTS {
        let fd = unsafe { *(libc::CMSG_DATA(cmsg) as *const RawFd) };
        return Message::Fd(unsafe { OwnedFd::from_raw_fd(fd) });
    }
    Message::Data(data[0])
}

/// The peer's mapping of the driver's shared transfer region.
struct PeerRegion {
    ptr: *mut u8,
    len: usize,
}

impl PeerRegion {
    fn map(fd: &OwnedFd) -> io::Result<PeerRegion> {
        let mut stat: libc::stat = unsafe { mem::zeroed() };
        if unsafe { libc::fstat(fd.as_raw_fd(), &mut stat) } != 0 {
            return Err(io::Error::last_os_error());
        }
        let len = stat.st_size as usize;
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd.as_raw_fd(),
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(PeerRegion {
            ptr: ptr.cast(),
            len,
        })
    }

    fn bytes(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }
}

impl Drop for PeerRegion {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr.cast(), self.len);
        }
    }
}
