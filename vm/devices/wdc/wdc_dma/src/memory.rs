// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Memory shared between the CPU and a device.
//!
//! Bytes are accessed through atomics because the device may touch the same
//! memory at any time while it is locked for DMA.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::Ordering;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;

/// A mapping of memory that can be targeted by DMA.
pub trait MappedDmaTarget: Send + Sync {
    /// The mapped bytes.
    fn as_slice(&self) -> &[AtomicU8];

    /// The user-mode virtual address of the first byte.
    fn virtual_address(&self) -> u64;
}

/// A cloneable reference to a range of a [`MappedDmaTarget`].
#[derive(Clone)]
pub struct MemoryBlock {
    target: Arc<dyn MappedDmaTarget>,
    offset: usize,
    len: usize,
}

impl fmt::Debug for MemoryBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryBlock")
            .field("virtual_address", &format_args!("{:#x}", self.virtual_address()))
            .field("len", &self.len)
            .finish()
    }
}

impl MemoryBlock {
    /// Wraps a mapping.
    pub fn new<T: 'static + MappedDmaTarget>(target: T) -> Self {
        let len = target.as_slice().len();
        Self {
            target: Arc::new(target),
            offset: 0,
            len,
        }
    }

    /// Returns a block referencing `len` bytes at `offset` within this
    /// block.
    ///
    /// Panics if the range is out of bounds.
    pub fn subblock(&self, offset: usize, len: usize) -> Self {
        assert!(
            offset <= self.len && len <= self.len - offset,
            "subblock {offset:#x}+{len:#x} out of range for {:#x} bytes",
            self.len
        );
        Self {
            target: self.target.clone(),
            offset: self.offset + offset,
            len,
        }
    }

    /// The length of the block in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// The virtual address of the first byte of the block.
    pub fn virtual_address(&self) -> u64 {
        self.target.virtual_address() + self.offset as u64
    }

    /// The bytes of the block.
    pub fn as_slice(&self) -> &[AtomicU8] {
        &self.target.as_slice()[self.offset..][..self.len]
    }

    /// Returns true if both blocks reference the same bytes of the same
    /// mapping.
    pub fn same_memory(&self, other: &MemoryBlock) -> bool {
        std::ptr::addr_eq(Arc::as_ptr(&self.target), Arc::as_ptr(&other.target))
            && self.offset == other.offset
            && self.len == other.len
    }

    /// Reads `data.len()` bytes at `offset`.
    pub fn read_at(&self, offset: usize, data: &mut [u8]) {
        let src = &self.as_slice()[offset..][..data.len()];
        for (d, s) in data.iter_mut().zip(src) {
            *d = s.load(Ordering::Relaxed);
        }
    }

    /// Writes `data` at `offset`.
    pub fn write_at(&self, offset: usize, data: &[u8]) {
        let dest = &self.as_slice()[offset..][..data.len()];
        for (d, s) in dest.iter().zip(data) {
            d.store(*s, Ordering::Relaxed);
        }
    }

    /// Reads an object at `offset`.
    pub fn read_obj<T: FromBytes + IntoBytes>(&self, offset: usize) -> T {
        let mut obj = T::new_zeroed();
        self.read_at(offset, obj.as_mut_bytes());
        obj
    }

    /// Writes an object at `offset`.
    pub fn write_obj<T: IntoBytes + Immutable>(&self, offset: usize, obj: &T) {
        self.write_at(offset, obj.as_bytes());
    }

    /// Sets `len` bytes at `offset` to `value`.
    pub fn fill_at(&self, offset: usize, value: u8, len: usize) {
        for b in &self.as_slice()[offset..][..len] {
            b.store(value, Ordering::Relaxed);
        }
    }
}

/// Zero-initialized memory allocated from the process heap.
///
/// This is the kind of memory callers hand to a scatter/gather lock.
pub struct HeapMemory {
    data: Box<[AtomicU8]>,
}

impl HeapMemory {
    /// Allocates `len` zeroed bytes.
    pub fn new(len: usize) -> Self {
        Self {
            data: (0..len).map(|_| AtomicU8::new(0)).collect(),
        }
    }
}

impl MappedDmaTarget for HeapMemory {
    fn as_slice(&self) -> &[AtomicU8] {
        &self.data
    }

    fn virtual_address(&self) -> u64 {
        self.data.as_ptr().addr() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::HeapMemory;
    use super::MemoryBlock;
    use test_with_tracing::test;

    #[test]
    fn read_write_objects() {
        let block = MemoryBlock::new(HeapMemory::new(64));
        block.write_obj(8, &0x1122_3344_u32);
        assert_eq!(block.read_obj::<u32>(8), 0x1122_3344);

        let mut bytes = [0; 4];
        block.read_at(8, &mut bytes);
        assert_eq!(bytes, 0x1122_3344_u32.to_le_bytes());
    }

    #[test]
    fn subblocks_share_memory() {
        let block = MemoryBlock::new(HeapMemory::new(0x100));
        let sub = block.subblock(0x10, 0x20);
        assert_eq!(sub.len(), 0x20);
        assert_eq!(sub.virtual_address(), block.virtual_address() + 0x10);

        sub.fill_at(0, 0xa5, 0x20);
        assert_eq!(block.read_obj::<u8>(0x10), 0xa5);
        assert_eq!(block.read_obj::<u8>(0x30), 0);
        assert!(sub.same_memory(&block.subblock(0x10, 0x20)));
        assert!(!sub.same_memory(&block));
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn subblock_out_of_range() {
        let block = MemoryBlock::new(HeapMemory::new(0x100));
        block.subblock(0xf0, 0x20);
    }
}
