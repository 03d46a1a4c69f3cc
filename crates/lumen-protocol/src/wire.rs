//! Fixed-layout command and response headers exchanged with the device
//! simulator.
//!
//! Every command is exactly [`COMMAND_HEADER_LEN`] bytes on the wire, with
//! little-endian fields and zeroed reserved bytes. Host-side locations in a
//! header are always byte offsets into the shared transfer region; device-side
//! locations are always device DRAM addresses. Host virtual addresses never
//! cross the wire.

/// Command header size in bytes, regardless of command type.
pub const COMMAND_HEADER_LEN: usize = 16;

/// Completion response size in bytes: id(1) + error(1) + pc(4).
pub const RESPONSE_LEN: usize = 6;

/// Top-level command families understood by the device frontend.
///
/// The driver only emits KERNEL and MEM; CSR and FENCE exist in the device's
/// dispatch queues and are kept here so decoded headers can name them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmdType {
    Kernel,
    Mem,
    Csr,
    Fence,
    Undefined,
}

impl CmdType {
    pub fn from_wire(byte: u8) -> Self {
        match byte {
            0 => CmdType::Kernel,
            1 => CmdType::Mem,
            2 => CmdType::Csr,
            3 => CmdType::Fence,
            _ => CmdType::Undefined,
        }
    }

    pub fn to_wire(self) -> u8 {
        match self {
            CmdType::Kernel => 0,
            CmdType::Mem => 1,
            CmdType::Csr => 2,
            CmdType::Fence => 3,
            CmdType::Undefined => 0xff,
        }
    }
}

/// MEM command subtype byte. Only COPY is emitted by the driver.
const MEM_SUBTYPE_COPY: u8 = 0;

/// Direction byte of a copy command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyDirection {
    HostToDevice,
    DeviceToHost,
}

impl CopyDirection {
    fn from_wire(byte: u8) -> Result<Self, WireError> {
        match byte {
            0 => Ok(CopyDirection::HostToDevice),
            1 => Ok(CopyDirection::DeviceToHost),
            other => Err(WireError::UnknownDirection(other)),
        }
    }

    fn to_wire(self) -> u8 {
        match self {
            CopyDirection::HostToDevice => 0,
            CopyDirection::DeviceToHost => 1,
        }
    }
}

/// A decoded 16-byte command header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandHeader {
    /// Kernel launch. The blob described by `payload_offset`/`payload_len`
    /// has been staged in the shared transfer region and is to be loaded at
    /// `device_base` in device DRAM.
    Kernel {
        command_id: u8,
        payload_offset: u32,
        payload_len: u32,
        device_base: u32,
    },
    /// Memory copy. For host-to-device, `src` is a shared-region offset and
    /// `dst` a device address; for device-to-host the roles are mirrored.
    Copy {
        command_id: u8,
        src: u32,
        dst: u32,
        len: u32,
        direction: CopyDirection,
    },
}

impl CommandHeader {
    pub fn command_id(&self) -> u8 {
        match *self {
            CommandHeader::Kernel { command_id, .. } => command_id,
            CommandHeader::Copy { command_id, .. } => command_id,
        }
    }

    pub fn cmd_type(&self) -> CmdType {
        match self {
            CommandHeader::Kernel { .. } => CmdType::Kernel,
            CommandHeader::Copy { .. } => CmdType::Mem,
        }
    }

    /// Serialize to the 16-byte wire representation.
    pub fn encode(&self) -> [u8; COMMAND_HEADER_LEN] {
        let mut bytes = [0u8; COMMAND_HEADER_LEN];
        bytes[0] = self.command_id();
        bytes[1] = self.cmd_type().to_wire();
        match *self {
            CommandHeader::Kernel {
                payload_offset,
                payload_len,
                device_base,
                ..
            } => {
                bytes[2..6].copy_from_slice(&payload_offset.to_le_bytes());
                bytes[6..10].copy_from_slice(&payload_len.to_le_bytes());
                bytes[10..14].copy_from_slice(&device_base.to_le_bytes());
                // bytes 14..16 reserved, already zero
            }
            CommandHeader::Copy {
                src,
                dst,
                len,
                direction,
                ..
            } => {
                bytes[2] = MEM_SUBTYPE_COPY;
                bytes[3..7].copy_from_slice(&src.to_le_bytes());
                bytes[7..11].copy_from_slice(&dst.to_le_bytes());
                bytes[11..15].copy_from_slice(&len.to_le_bytes());
                bytes[15] = direction.to_wire();
            }
        }
        bytes
    }

    /// Decode a 16-byte wire header. Unknown type, subtype, or direction
    /// bytes and non-zero reserved bytes are all rejected.
    pub fn decode(bytes: &[u8; COMMAND_HEADER_LEN]) -> Result<Self, WireError> {
        let command_id = bytes[0];
        match CmdType::from_wire(bytes[1]) {
            CmdType::Kernel => {
                if bytes[14] != 0 || bytes[15] != 0 {
                    return Err(WireError::NonZeroReserved);
                }
                Ok(CommandHeader::Kernel {
                    command_id,
                    payload_offset: read_u32(bytes, 2),
                    payload_len: read_u32(bytes, 6),
                    device_base: read_u32(bytes, 10),
                })
            }
            CmdType::Mem => {
                if bytes[2] != MEM_SUBTYPE_COPY {
                    return Err(WireError::UnsupportedMemOp(bytes[2]));
                }
                Ok(CommandHeader::Copy {
                    command_id,
                    src: read_u32(bytes, 3),
                    dst: read_u32(bytes, 7),
                    len: read_u32(bytes, 11),
                    direction: CopyDirection::from_wire(bytes[15])?,
                })
            }
            ty @ (CmdType::Csr | CmdType::Fence) => Err(WireError::UnsupportedCommand(ty)),
            CmdType::Undefined => Err(WireError::UnknownCommandType(bytes[1])),
        }
    }
}

/// Error code reported by the device in a completion response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    None,
    Execution,
}

impl ErrorCode {
    fn from_wire(byte: u8) -> Result<Self, WireError> {
        match byte {
            0 => Ok(ErrorCode::None),
            1 => Ok(ErrorCode::Execution),
            other => Err(WireError::UnknownErrorCode(other)),
        }
    }

    fn to_wire(self) -> u8 {
        match self {
            ErrorCode::None => 0,
            ErrorCode::Execution => 1,
        }
    }
}

/// Completion notice produced by the device, consumed exactly once per
/// command. `program_counter` is a raw device address; translating it back
/// into a kernel-image offset is the completion handler's job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseHeader {
    pub command_id: u8,
    pub error: ErrorCode,
    pub program_counter: u32,
}

impl ResponseHeader {
    pub fn encode(&self) -> [u8; RESPONSE_LEN] {
        let mut bytes = [0u8; RESPONSE_LEN];
        bytes[0] = self.command_id;
        bytes[1] = self.error.to_wire();
        bytes[2..6].copy_from_slice(&self.program_counter.to_le_bytes());
        bytes
    }

    pub fn decode(bytes: &[u8; RESPONSE_LEN]) -> Result<Self, WireError> {
        Ok(ResponseHeader {
            command_id: bytes[0],
            error: ErrorCode::from_wire(bytes[1])?,
            program_counter: u32::from_le_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]),
        })
    }
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("unknown command type byte: {0:#04x}")]
    UnknownCommandType(u8),

    #[error("command type {0:?} is not valid on this connection")]
    UnsupportedCommand(CmdType),

    #[error("unsupported MEM subtype byte: {0:#04x}")]
    UnsupportedMemOp(u8),

    #[error("unknown copy direction byte: {0:#04x}")]
    UnknownDirection(u8),

    #[error("unknown error code byte: {0:#04x}")]
    UnknownErrorCode(u8),

    #[error("reserved header bytes are not zero")]
    NonZeroReserved,
}
