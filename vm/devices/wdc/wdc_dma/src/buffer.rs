// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The DMA buffer record.

use crate::DmaConfig;
use crate::memory::MemoryBlock;
use crate::service::DmaService;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use wdc_defs::BufferToken;
use wdc_defs::DmaOptions;
use wdc_defs::GlobalHandle;
use wdc_defs::PhysicalSegment;

/// Returns the number of page descriptors needed to describe `byte_count`
/// bytes of arbitrarily aligned memory.
///
/// An unaligned start can cross into one extra page.
pub fn segments_needed(byte_count: usize, page_size: usize) -> usize {
    byte_count.div_ceil(page_size) + 1
}

/// How the memory behind a [`DmaBuffer`] was obtained.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BufferMode {
    /// Physically contiguous memory allocated by the driver.
    Contiguous,
    /// Caller memory described page by page.
    ScatterGather,
    /// Reserved physical memory supplied by the caller.
    Reserved,
}

/// What the driver must do to release the record's pin.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum PinKind {
    Lock,
    Transaction,
}

/// Keeps the owning context's record count accurate.
pub(crate) struct RecordGuard(Arc<AtomicUsize>);

impl RecordGuard {
    pub(crate) fn new(records: &Arc<AtomicUsize>) -> Self {
        records.fetch_add(1, Ordering::Relaxed);
        Self(records.clone())
    }
}

impl Drop for RecordGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// A buffer whose memory is pinned for DMA.
///
/// The page descriptors are valid until the buffer is unlocked. Dropping the
/// buffer without calling [`DmaBuffer::unlock`] still releases the pin, but
/// the driver status is lost.
pub struct DmaBuffer {
    pub(crate) service: Arc<dyn DmaService>,
    pub(crate) config: DmaConfig,
    pub(crate) token: BufferToken,
    pub(crate) pinned: bool,
    pub(crate) kind: PinKind,
    pub(crate) mode: BufferMode,
    pub(crate) options: DmaOptions,
    pub(crate) byte_count: usize,
    pub(crate) memory: MemoryBlock,
    pub(crate) segments: Vec<PhysicalSegment>,
    pub(crate) segment_capacity: usize,
    pub(crate) global_handle: GlobalHandle,
    pub(crate) attached: bool,
    pub(crate) _record: RecordGuard,
}

impl fmt::Debug for DmaBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DmaBuffer")
            .field("token", &self.token)
            .field("mode", &self.mode)
            .field("options", &self.options)
            .field("byte_count", &self.byte_count)
            .field("segments", &self.segments.len())
            .field("segment_capacity", &self.segment_capacity)
            .field("global_handle", &self.global_handle)
            .field("attached", &self.attached)
            .finish()
    }
}

impl DmaBuffer {
    /// The driver's handle for this buffer.
    pub fn token(&self) -> BufferToken {
        self.token
    }

    /// How the buffer's memory was obtained.
    pub fn mode(&self) -> BufferMode {
        self.mode
    }

    /// The options the buffer was locked with, including bits set by the
    /// library.
    pub fn options(&self) -> DmaOptions {
        self.options
    }

    /// The requested size in bytes.
    pub fn byte_count(&self) -> usize {
        self.byte_count
    }

    /// The physical page descriptors, in logical order.
    ///
    /// For transactions these describe only the chunk currently in flight.
    pub fn segments(&self) -> &[PhysicalSegment] {
        &self.segments
    }

    /// The size of the page descriptor array.
    pub fn segment_capacity(&self) -> usize {
        self.segment_capacity
    }

    /// The CPU mapping of the buffer.
    ///
    /// For scatter/gather buffers this is the caller's own memory.
    pub fn memory(&self) -> &MemoryBlock {
        &self.memory
    }

    /// The user-mode virtual address of the buffer.
    pub fn user_address(&self) -> u64 {
        self.memory.virtual_address()
    }

    /// Returns true if the buffer was obtained by attaching to another
    /// process's buffer.
    pub fn is_attached(&self) -> bool {
        self.attached
    }

    /// Returns the handle another process can attach to this buffer with.
    /// Only contiguous buffers can be shared.
    pub fn shared_handle(&self) -> Option<GlobalHandle> {
        (self.mode == BufferMode::Contiguous && !self.global_handle.is_none())
            .then_some(self.global_handle)
    }

    /// Marks the pin as released by the caller and returns its token.
    pub(crate) fn disarm(&mut self) -> BufferToken {
        self.pinned = false;
        self.token
    }
}

impl Drop for DmaBuffer {
    fn drop(&mut self) {
        if !self.pinned {
            return;
        }
        tracing::warn!(
            token = %self.token,
            mode = ?self.mode,
            "dma buffer dropped while still locked"
        );
        let result = match self.kind {
            PinKind::Lock => self.service.unpin(self.token),
            PinKind::Transaction => self.service.end_transaction(self.token),
        };
        if let Err(status) = result {
            tracing::error!(token = %self.token, %status, "failed to release dropped dma buffer");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::segments_needed;
    use test_with_tracing::test;

    #[test]
    fn descriptor_sizing_boundaries() {
        assert_eq!(segments_needed(4096, 4096), 2);
        assert_eq!(segments_needed(4095, 4096), 2);
        assert_eq!(segments_needed(4097, 4096), 3);
        assert_eq!(segments_needed(1, 4096), 2);
        assert_eq!(segments_needed(10000, 4096), 4);
        assert_eq!(segments_needed(4096 * 127, 4096), 128);
    }
}
