//! In-flight command tracking.
//!
//! Maps a single-byte correlation id to the metadata needed to interpret that
//! command's eventual completion. Lookup is id-keyed: completions are matched
//! by the id the device echoes back, never by submission order.

use std::sync::atomic::{AtomicU8, Ordering};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use lumen_protocol::wire::CopyDirection;

use crate::dram::DeviceAddress;
use crate::error::CoreError;

/// Metadata for a launched kernel, kept until its completion arrives so the
/// reported program counter can be translated back into an offset inside the
/// original compiled image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelMeta {
    /// Device address the first kernel code byte was placed at.
    pub code_base: DeviceAddress,
    /// File offset of the first loadable byte within the compiled image.
    pub load_offset: u32,
}

impl KernelMeta {
    /// Translate a raw device program counter into an offset inside the
    /// compiled kernel image. Returns `None` for PCs below the code base
    /// (e.g. faults outside the kernel's code region) or so far above it
    /// that the offset leaves the 32-bit space.
    pub fn translate_pc(&self, pc: u32) -> Option<u32> {
        pc.checked_sub(self.code_base.0)?
            .checked_add(self.load_offset)
    }
}

/// Metadata for a memory copy. For device-to-host, `region_offset` records
/// where in the shared transfer region the bytes will land; the host buffer
/// is only filled from there once the completion is consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyMeta {
    pub device_addr: DeviceAddress,
    pub region_offset: u32,
    pub len: u32,
    pub direction: CopyDirection,
}

/// What a command will need at completion time. Tagged union, matched on by
/// the completion handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandMeta {
    Kernel(KernelMeta),
    Copy(CopyMeta),
}

/// Table of commands that have been sent but not yet acknowledged.
///
/// Ids are unique among outstanding commands and may be reused once the
/// prior command with that id has been resolved. At most 256 commands can be
/// outstanding (the id is one byte on the wire).
pub struct InFlightCommandTable {
    outstanding: DashMap<u8, CommandMeta>,
    // Rotating hint so ids are not reused immediately after resolution.
    next_id: AtomicU8,
}

impl InFlightCommandTable {
    pub fn new() -> Self {
        InFlightCommandTable {
            outstanding: DashMap::new(),
            next_id: AtomicU8::new(0),
        }
    }

    /// Register a command and return its correlation id. Fails once all 256
    /// ids are outstanding.
    pub fn register(&self, meta: CommandMeta) -> Result<u8, CoreError> {
        let start = self.next_id.fetch_add(1, Ordering::Relaxed);
        for step in 0u16..=u8::MAX as u16 {
            let candidate = start.wrapping_add(step as u8);
            match self.outstanding.entry(candidate) {
                Entry::Vacant(slot) => {
                    slot.insert(meta);
                    return Ok(candidate);
                }
                Entry::Occupied(_) => continue,
            }
        }
        Err(CoreError::CommandSlotsExhausted)
    }

    /// Consume the entry for an acknowledged command. `None` means the
    /// device referenced an id we never sent (or one already resolved); the
    /// caller treats that as a protocol error and discards the response.
    pub fn resolve(&self, command_id: u8) -> Option<CommandMeta> {
        self.outstanding.remove(&command_id).map(|(_, meta)| meta)
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }

    /// Drain every unresolved command, e.g. when the connection drops and
    /// their outcomes become permanently unknown.
    pub fn drain_unresolved(&self) -> Vec<u8> {
        let ids: Vec<u8> = self.outstanding.iter().map(|e| *e.key()).collect();
        self.outstanding.clear();
        ids
    }
}

impl Default for InFlightCommandTable {
    fn default() -> Self {
        Self::new()
    }
}
