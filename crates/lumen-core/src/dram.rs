//! Bump allocator over the simulated device's DRAM range.
//!
//! Arena semantics: allocations live for the life of the connection and there
//! is no freeing. Every region backing a launch (blob, stack, TLS) and every
//! `alloc` handed to callers comes from this single cursor, so device
//! addresses never collide.

use std::fmt;

use crate::error::CoreError;

/// An address in the simulated device's flat address space. Zero is a valid
/// allocated address; addresses never wrap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceAddress(pub u32);

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

#[derive(Debug)]
pub struct DeviceAddressSpace {
    base: u32,
    capacity: u64,
    used: u64,
}

impl DeviceAddressSpace {
    /// `base` is the lowest usable DRAM address; `capacity` the number of
    /// allocatable bytes above it. A capacity reaching past the 32-bit
    /// address space is clamped to the addressable span so the cursor can
    /// never wrap.
    pub fn new(base: u32, capacity: u64) -> Self {
        let span = u32::MAX as u64 - base as u64 + 1;
        DeviceAddressSpace {
            base,
            capacity: capacity.min(span),
            used: 0,
        }
    }

    /// Reserve `bytes` (rounded up to 4-byte alignment) and return the start
    /// address. Fails without mutating the cursor when the rounded request
    /// does not fit the remaining capacity.
    pub fn allocate(&mut self, bytes: u64) -> Result<DeviceAddress, CoreError> {
        let aligned = bytes
            .checked_add(3)
            .map(|b| b & !3)
            .ok_or(CoreError::DeviceMemoryExhausted {
                requested: bytes,
                remaining: self.remaining(),
            })?;
        if aligned > self.remaining() {
            return Err(CoreError::DeviceMemoryExhausted {
                requested: bytes,
                remaining: self.remaining(),
            });
        }
        let addr = DeviceAddress(self.base.wrapping_add(self.used as u32));
        self.used += aligned;
        Ok(addr)
    }

    /// Address the next allocation would start at. The launch codec peeks
    /// this to compute fixed-address padding before committing anything.
    pub fn cursor(&self) -> DeviceAddress {
        DeviceAddress(self.base.wrapping_add(self.used as u32))
    }

    pub fn used(&self) -> u64 {
        self.used
    }

    pub fn remaining(&self) -> u64 {
        self.capacity - self.used
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocations_are_monotonic_and_aligned() {
        let mut dram = DeviceAddressSpace::new(0x8000, 1024);
        let a = dram.allocate(1).expect("alloc");
        let b = dram.allocate(8).expect("alloc");
        let c = dram.allocate(3).expect("alloc");
        assert_eq!(a, DeviceAddress(0x8000));
        assert_eq!(b, DeviceAddress(0x8004)); // 1 rounds up to 4
        assert_eq!(c, DeviceAddress(0x800c));
        assert_eq!(dram.used(), 16);
    }

    #[test]
    fn used_never_exceeds_capacity() {
        let mut dram = DeviceAddressSpace::new(0, 64);
        let mut last_used = 0;
        for _ in 0..32 {
            match dram.allocate(8) {
                Ok(_) => {
                    assert!(dram.used() >= last_used);
                    assert!(dram.used() <= dram.capacity());
                    last_used = dram.used();
                }
                Err(_) => break,
            }
        }
        assert_eq!(dram.used(), 64);
    }

    #[test]
    fn failed_allocation_leaves_cursor_untouched() {
        let mut dram = DeviceAddressSpace::new(0x8000, 16);
        dram.allocate(12).expect("alloc");
        let used_before = dram.used();
        let cursor_before = dram.cursor();
        assert!(dram.allocate(8).is_err());
        assert_eq!(dram.used(), used_before);
        assert_eq!(dram.cursor(), cursor_before);
        // a fitting request still succeeds afterwards
        assert!(dram.allocate(4).is_ok());
    }

    #[test]
    fn zero_byte_allocation_is_valid() {
        let mut dram = DeviceAddressSpace::new(0, 8);
        let a = dram.allocate(0).expect("alloc");
        let b = dram.allocate(0).expect("alloc");
        assert_eq!(a, b);
        assert_eq!(dram.used(), 0);
    }

    #[test]
    fn capacity_is_clamped_to_the_addressable_span() {
        let mut dram = DeviceAddressSpace::new(0x8000, 5 * 1024 * 1024 * 1024);
        assert_eq!(dram.capacity(), u32::MAX as u64 + 1 - 0x8000);

        let a = dram.allocate(u32::MAX as u64 - 0x10000).expect("alloc");
        assert_eq!(a, DeviceAddress(0x8000));
        // the top of the span is still handed out without wrapping
        let b = dram.allocate(16).expect("alloc");
        assert!(b > a);
        assert!(dram.allocate(0x10000).is_err());
    }

    #[test]
    fn request_larger_than_capacity_fails() {
        let mut dram = DeviceAddressSpace::new(0, 16);
        assert!(matches!(
            dram.allocate(17),
            Err(CoreError::DeviceMemoryExhausted {
                requested: 17,
                remaining: 16
            })
        ));
    }
}
