//! Kernel launch ABI blob layout.
//!
//! A launch payload is laid out as: 64-byte ABI header, parameter bytes,
//! alignment padding, then the raw loadable kernel machine code. The device
//! reads the header at the blob's device base address and jumps to the PCs
//! recorded inside it, so every address field here is a device DRAM address.

use bitflags::bitflags;

/// Fixed size of the ABI header preceding the parameter bytes.
pub const ABI_HEADER_LEN: usize = 64;

/// Reserved tail of the ABI header (fields occupy 62 of the 64 bytes).
const ABI_RESERVED_LEN: usize = 2;

pub const DEFAULT_REGS_PER_THREAD: u8 = 1;
pub const DEFAULT_SMEM_PER_BLOCK: u32 = 1;

bitflags! {
    /// Launch flags byte of the ABI header.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct LaunchFlags: u8 {
        /// Device-side printf is wired up (printf_host_addr is meaningful).
        const PRINTF_ENABLED = 0b0000_0001;
    }
}

/// Grid or block dimensions. Stored as u32 in the ABI header but each
/// component is individually bounded to 16 bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dim3 {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl Dim3 {
    pub const ONE: Dim3 = Dim3 { x: 1, y: 1, z: 1 };

    pub fn new(x: u32, y: u32, z: u32) -> Self {
        Dim3 { x, y, z }
    }

    /// Dimension components wider than 16 bits are a hard validation failure,
    /// checked before any device memory is reserved.
    pub fn validate(&self) -> Result<(), LaunchError> {
        for value in [self.x, self.y, self.z] {
            if value > u16::MAX as u32 {
                return Err(LaunchError::DimensionTooLarge(value));
            }
        }
        Ok(())
    }
}

/// Where the kernel machine code lands relative to the header + params.
///
/// The policy is fixed for the lifetime of a connection; mixing the two
/// conventions breaks program-counter translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlacementPolicy {
    /// Code starts at the first 4-byte-aligned offset after the params.
    #[default]
    Aligned,
    /// Code is pinned to this exact device address; the blob is padded so the
    /// first code byte lands there. Layout fails if header + params do not
    /// fit below the target.
    FixedAddress(u32),
}

/// Computed placement of one launch blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchLayout {
    /// Zero bytes appended after the params to reach 4-byte alignment.
    pub params_pad: u32,
    /// Additional zero bytes to reach a fixed code address (zero when the
    /// policy is `Aligned`).
    pub code_pad: u32,
    /// Offset of the first code byte within the blob.
    pub code_offset: u32,
    /// Total blob size in bytes.
    pub total_len: u32,
}

impl LaunchLayout {
    /// Compute the blob layout for a launch whose blob will be placed at
    /// device address `blob_base`. Pure: no allocation side effects, so a
    /// layout failure leaves the caller's allocator untouched.
    pub fn compute(
        params_len: usize,
        code_len: usize,
        blob_base: u32,
        policy: PlacementPolicy,
    ) -> Result<Self, LaunchError> {
        let params_len = u32::try_from(params_len)
            .map_err(|_| LaunchError::ParamsTooLarge(params_len as u64))?;

        let prefix = ABI_HEADER_LEN as u64 + params_len as u64;
        let params_pad = ((4 - prefix % 4) % 4) as u32;
        let aligned_prefix = prefix + params_pad as u64;

        let (code_pad, code_offset) = match policy {
            PlacementPolicy::Aligned => (0u32, aligned_prefix),
            PlacementPolicy::FixedAddress(target) => {
                let code_addr = blob_base as u64 + aligned_prefix;
                if code_addr > target as u64 {
                    return Err(LaunchError::FixedTargetOverrun {
                        target,
                        required: code_addr,
                    });
                }
                let pad = target as u64 - code_addr;
                (pad as u32, aligned_prefix + pad)
            }
        };

        let total = code_offset + code_len as u64;
        if total > u32::MAX as u64 {
            return Err(LaunchError::BlobTooLarge(total));
        }

        Ok(LaunchLayout {
            params_pad,
            code_pad,
            code_offset: code_offset as u32,
            total_len: total as u32,
        })
    }
}

/// The fixed ABI header written at the front of every launch blob.
/// All address fields are device DRAM addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AbiHeader {
    pub start_pc: u32,
    pub entry_pc: u32,
    /// Parameter bytes including alignment padding.
    pub params_size: u32,
    pub image_size: u32,
    pub stack_base: u32,
    pub tls_base: u32,
    pub params_base: u32,
    pub grid: Dim3,
    pub block: Dim3,
    pub printf_host_addr: u32,
    pub regs_per_thread: u8,
    pub smem_per_block: u32,
    pub flags: LaunchFlags,
}

impl AbiHeader {
    pub fn encode(&self) -> [u8; ABI_HEADER_LEN] {
        let mut bytes = [0u8; ABI_HEADER_LEN];
        let mut w = FieldWriter {
            buf: &mut bytes,
            cursor: 0,
        };
        w.u32(self.start_pc);
        w.u32(self.entry_pc);
        w.u32(self.params_size);
        w.u32(self.image_size);
        w.u32(self.stack_base);
        w.u32(self.tls_base);
        w.u32(self.params_base);
        w.u32(self.grid.x);
        w.u32(self.grid.y);
        w.u32(self.grid.z);
        w.u32(self.block.x);
        w.u32(self.block.y);
        w.u32(self.block.z);
        w.u32(self.printf_host_addr);
        w.u8(self.regs_per_thread);
        w.u32(self.smem_per_block);
        w.u8(self.flags.bits());
        debug_assert_eq!(w.cursor + ABI_RESERVED_LEN, ABI_HEADER_LEN);
        bytes
    }
}

struct FieldWriter<'a> {
    buf: &'a mut [u8],
    cursor: usize,
}

impl FieldWriter<'_> {
    fn u32(&mut self, value: u32) {
        self.buf[self.cursor..self.cursor + 4].copy_from_slice(&value.to_le_bytes());
        self.cursor += 4;
    }

    fn u8(&mut self, value: u8) {
        self.buf[self.cursor] = value;
        self.cursor += 1;
    }
}

/// Assemble the full launch blob: header, params, padding, code.
pub fn build_blob(
    header: &AbiHeader,
    params: &[u8],
    code: &[u8],
    layout: &LaunchLayout,
) -> Vec<u8> {
    let mut blob = Vec::with_capacity(layout.total_len as usize);
    blob.extend_from_slice(&header.encode());
    blob.extend_from_slice(params);
    blob.resize(blob.len() + layout.params_pad as usize, 0);
    blob.resize(blob.len() + layout.code_pad as usize, 0);
    debug_assert_eq!(blob.len(), layout.code_offset as usize);
    blob.extend_from_slice(code);
    debug_assert_eq!(blob.len(), layout.total_len as usize);
    blob
}

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("grid/block dimension component {0} exceeds 16-bit limit")]
    DimensionTooLarge(u32),

    #[error("parameter payload of {0} bytes does not fit a 32-bit size field")]
    ParamsTooLarge(u64),

    #[error("header + params end at {required:#x}, past fixed code target {target:#x}")]
    FixedTargetOverrun { target: u32, required: u64 },

    #[error("launch blob of {0} bytes exceeds the 32-bit device address space")]
    BlobTooLarge(u64),
}
