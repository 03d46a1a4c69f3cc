//! The consumed kernel-compiler interface and parameter packing.
//!
//! Compiling a kernel name into a loadable image (ELF parsing, linking,
//! symbol lookup) happens outside this crate; the driver only needs the
//! image bytes plus the entry metadata below.

use crate::error::DriverError;

/// A compiled kernel ready to be placed in device memory.
///
/// `start_pc` and `entry_pc` are file offsets into `bytes`; `load_offset` is
/// the file offset of the first loadable (PT_LOAD) byte. Only
/// `bytes[load_offset..]` is copied to the device, and PCs are rebased
/// accordingly at launch time.
#[derive(Debug, Clone)]
pub struct KernelImage {
    pub name: String,
    pub bytes: Vec<u8>,
    pub start_pc: u32,
    pub entry_pc: u32,
    pub load_offset: u32,
}

impl KernelImage {
    /// The bytes actually copied into device memory.
    pub fn loadable(&self) -> &[u8] {
        &self.bytes[self.load_offset as usize..]
    }

    /// Check the entry metadata is internally consistent before anything is
    /// allocated on its behalf.
    pub fn validate(&self) -> Result<(), DriverError> {
        let len = self.bytes.len() as u64;
        if (self.load_offset as u64) > len {
            return Err(DriverError::InvalidKernelImage {
                name: self.name.clone(),
                reason: "load offset past end of image",
            });
        }
        for pc in [self.start_pc, self.entry_pc] {
            if pc < self.load_offset || (pc as u64) >= len {
                return Err(DriverError::InvalidKernelImage {
                    name: self.name.clone(),
                    reason: "entry PC outside the loadable image",
                });
            }
        }
        Ok(())
    }
}

/// External collaborator: given a kernel name, produce a loadable image and
/// its entry program counters.
pub trait KernelCompiler {
    fn compile(&self, kernel_name: &str) -> Result<KernelImage, DriverError>;
}

/// Packs kernel parameters into the byte blob that lands behind the ABI
/// header, respecting each value's natural alignment.
#[derive(Debug, Default, Clone)]
pub struct ParamBuffer {
    storage: Vec<u8>,
}

impl ParamBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_u32(&mut self, value: u32) {
        self.align_to(4);
        self.storage.extend_from_slice(&value.to_le_bytes());
    }

    pub fn push_u64(&mut self, value: u64) {
        self.align_to(8);
        self.storage.extend_from_slice(&value.to_le_bytes());
    }

    /// Push a device address as the 32-bit pointer the kernel will see.
    pub fn push_device_addr(&mut self, addr: lumen_core::DeviceAddress) {
        self.push_u32(addr.0);
    }

    pub fn push_bytes(&mut self, bytes: &[u8]) {
        self.storage.extend_from_slice(bytes);
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.storage
    }

    pub fn len(&self) -> usize {
        self.storage.len()
    }

    pub fn is_empty(&self) -> bool {
        self.storage.is_empty()
    }

    pub fn clear(&mut self) {
        self.storage.clear();
    }

    fn align_to(&mut self, align: usize) {
        let rem = self.storage.len() % align;
        if rem != 0 {
            self.storage.resize(self.storage.len() + align - rem, 0);
        }
    }
}
