// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! User-mode DMA buffer and transaction management for WDC devices.
//!
//! A [`DmaContext`] connects the library to the privileged driver service
//! ([`DmaService`]). Through it, callers lock buffers for one-shot DMA
//! ([`DmaBuffer`]) or set up chunked transactions ([`DmaTransaction`]) whose
//! page descriptors are programmed into the device by a [`ChunkBuilder`].
//!
//! Locked memory stays pinned by the driver until the matching
//! [`DmaBuffer::unlock`] or [`DmaTransaction::uninit`] call. Both always
//! free the local record, even when the driver fails to release its side.

#![forbid(unsafe_code)]

mod buffer;
pub mod device;
pub mod emulated;
mod error;
mod lock;
pub mod memory;
pub mod service;
mod sync;
mod transaction;

#[cfg(test)]
mod tests;

pub use buffer::BufferMode;
pub use buffer::DmaBuffer;
pub use buffer::segments_needed;
pub use error::DmaError;
pub use error::DmaOperation;
pub use transaction::ChunkBuilder;
pub use transaction::DmaChunk;
pub use transaction::DmaTransaction;
pub use transaction::TransactionState;
pub use transaction::TransferStatus;

use service::DmaService;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use wdc_defs::DmaOptions;
use wdc_defs::INLINE_SEGMENT_CAPACITY;
use wdc_defs::PAGE_SIZE;
use wdc_defs::PhysicalSegment;

/// Tunables for a [`DmaContext`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DmaConfig {
    /// The system page size. Must be a power of two.
    pub page_size: usize,
    /// Number of page descriptors that fit without setting
    /// [`DmaOptions::large_buffer`].
    pub inline_segment_capacity: usize,
}

impl Default for DmaConfig {
    fn default() -> Self {
        Self {
            page_size: PAGE_SIZE,
            inline_segment_capacity: INLINE_SEGMENT_CAPACITY,
        }
    }
}

/// The entry point for all DMA operations.
///
/// Cloning a context shares the driver connection and the record count.
#[derive(Clone)]
pub struct DmaContext {
    service: Arc<dyn DmaService>,
    config: DmaConfig,
    records: Arc<AtomicUsize>,
}

impl fmt::Debug for DmaContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DmaContext")
            .field("config", &self.config)
            .field("records", &self.outstanding_records())
            .finish_non_exhaustive()
    }
}

impl DmaContext {
    /// Creates a context with the default configuration.
    pub fn new(service: Arc<dyn DmaService>) -> Self {
        Self {
            service,
            config: DmaConfig::default(),
            records: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Creates a context with a custom configuration.
    pub fn with_config(service: Arc<dyn DmaService>, config: DmaConfig) -> Result<Self, DmaError> {
        if !config.page_size.is_power_of_two() {
            return Err(DmaError::InvalidParameter(
                "page size must be a power of two",
            ));
        }
        Ok(Self {
            service,
            config,
            records: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// The configuration in use.
    pub fn config(&self) -> &DmaConfig {
        &self.config
    }

    /// The number of buffer and transaction records created through this
    /// context that have not been freed yet.
    pub fn outstanding_records(&self) -> usize {
        self.records.load(Ordering::Relaxed)
    }

    /// Computes the descriptor count for `byte_count` bytes, flagging
    /// `options` when it does not fit inline.
    fn size_descriptors(&self, byte_count: usize, options: &mut DmaOptions) -> usize {
        let needed = segments_needed(byte_count, self.config.page_size);
        if needed > self.config.inline_segment_capacity {
            tracing::debug!(
                needed,
                inline = self.config.inline_segment_capacity,
                "using large buffer descriptor array"
            );
            options.set_large_buffer(true);
        }
        needed
    }

    fn reserve_segments(&self, needed: usize) -> Result<Vec<PhysicalSegment>, DmaError> {
        let mut segments = Vec::new();
        segments
            .try_reserve_exact(needed)
            .map_err(|_| DmaError::InsufficientResources { segments: needed })?;
        Ok(segments)
    }
}
