// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The interface to the privileged driver service that pins memory and
//! tracks DMA transactions.
//!
//! Every method reports failure with the driver's own [`WdStatus`]; the
//! library forwards these to callers without reinterpreting them.
//!
//! Methods that produce page descriptors write them into a caller-provided
//! vector and must never store more than the segment capacity passed in the
//! request. Exceeding it is reported as
//! [`WdStatus::INSUFFICIENT_RESOURCES`].

use crate::memory::MemoryBlock;
use wdc_defs::BufferToken;
use wdc_defs::CardHandle;
use wdc_defs::DmaOptions;
use wdc_defs::GlobalHandle;
use wdc_defs::PhysicalSegment;
use wdc_defs::WdStatus;

/// Request to allocate and pin a physically contiguous buffer.
#[derive(Debug, Clone)]
pub struct ContiguousRequest {
    /// The card the buffer is used with.
    pub card: CardHandle,
    /// Lock options. `kernel_buffer_alloc` is always set.
    pub options: DmaOptions,
    /// Size of the buffer in bytes.
    pub byte_count: usize,
}

/// Request to pin caller memory as a scatter/gather list.
#[derive(Debug, Clone)]
pub struct ScatterGatherRequest<'a> {
    /// The card the buffer is used with.
    pub card: CardHandle,
    /// Lock options.
    pub options: DmaOptions,
    /// The caller's memory. At least `byte_count` bytes long.
    pub memory: &'a MemoryBlock,
    /// Number of bytes to pin, starting at the beginning of `memory`.
    pub byte_count: usize,
    /// Size of the page descriptor array.
    pub segment_capacity: usize,
    /// Descriptors the caller's record holds inline. A larger
    /// `segment_capacity` requires [`DmaOptions::large_buffer`].
    pub inline_capacity: usize,
}

/// Request to map caller-known reserved physical memory.
#[derive(Debug, Clone)]
pub struct ReservedRequest {
    /// The card the buffer is used with.
    pub card: CardHandle,
    /// Lock options. `kernel_buffer_alloc` and `reserved_mem` are set.
    pub options: DmaOptions,
    /// Physical address of the first byte.
    pub physical_address: u64,
    /// Size of the range in bytes.
    pub byte_count: usize,
}

/// The memory backing a transaction.
#[derive(Debug, Clone)]
pub enum TransactionBacking<'a> {
    /// The driver allocates a contiguous buffer.
    Contiguous {
        /// Required physical alignment in bytes, or zero for page alignment.
        alignment: usize,
    },
    /// The caller's memory is pinned and transferred in chunks.
    ScatterGather {
        /// The caller's memory.
        memory: &'a MemoryBlock,
        /// Largest number of bytes described by one chunk.
        max_transfer_size: usize,
        /// Size of one device descriptor element.
        element_size: usize,
    },
}

/// Request to initialize a DMA transaction.
#[derive(Debug, Clone)]
pub struct TransactionRequest<'a> {
    /// The card the transaction targets.
    pub card: CardHandle,
    /// Transaction options. `transaction` is always set.
    pub options: DmaOptions,
    /// Total size of the transfer in bytes.
    pub byte_count: usize,
    /// Size of the page descriptor array for one chunk.
    pub segment_capacity: usize,
    /// Memory backing the transfer.
    pub backing: TransactionBacking<'a>,
}

/// A successful pin.
#[derive(Debug)]
pub struct Pinned {
    /// The driver's handle for the pinning.
    pub token: BufferToken,
    /// The user mapping of driver-allocated memory. `None` when the caller
    /// supplied the memory.
    pub memory: Option<MemoryBlock>,
    /// System-wide name of the buffer, for contiguous buffers.
    pub global_handle: GlobalHandle,
}

/// A successful attach to another process's contiguous buffer.
#[derive(Debug)]
pub struct Attached {
    /// The driver's handle for this process's reference.
    pub token: BufferToken,
    /// The mapping of the shared buffer in this process.
    pub memory: MemoryBlock,
    /// Size of the shared buffer.
    pub byte_count: usize,
    /// The options the buffer was allocated with.
    pub options: DmaOptions,
}

/// Progress of a transaction after the driver has been told that the
/// current chunk finished.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ChunkProgress {
    /// The whole transfer is done.
    Complete {
        /// Total bytes transferred.
        bytes_transferred: usize,
    },
    /// Another chunk was mapped and must be programmed into the device.
    More {
        /// Bytes transferred before the newly mapped chunk.
        bytes_transferred: usize,
    },
}

/// The privileged service that owns physical memory on behalf of the
/// library.
pub trait DmaService: Send + Sync {
    /// Allocates, pins and maps a contiguous buffer. Writes its single page
    /// descriptor into `segments`.
    fn pin_contiguous(
        &self,
        request: &ContiguousRequest,
        segments: &mut Vec<PhysicalSegment>,
    ) -> Result<Pinned, WdStatus>;

    /// Pins caller memory and describes it page by page in `segments`.
    fn pin_scatter_gather(
        &self,
        request: &ScatterGatherRequest<'_>,
        segments: &mut Vec<PhysicalSegment>,
    ) -> Result<Pinned, WdStatus>;

    /// Maps reserved physical memory into the process.
    fn pin_reserved(
        &self,
        request: &ReservedRequest,
        segments: &mut Vec<PhysicalSegment>,
    ) -> Result<Pinned, WdStatus>;

    /// Takes a reference on a contiguous buffer by its global handle.
    fn attach_existing(
        &self,
        handle: GlobalHandle,
        segments: &mut Vec<PhysicalSegment>,
    ) -> Result<Attached, WdStatus>;

    /// Releases a pin or attach reference.
    fn unpin(&self, token: BufferToken) -> Result<(), WdStatus>;

    /// Pins the memory of a new transaction. No chunk is mapped yet.
    fn begin_transaction(&self, request: &TransactionRequest<'_>) -> Result<Pinned, WdStatus>;

    /// Maps the next chunk of the transaction into `segments`, restarting
    /// from the beginning if the transaction was released. Returns the
    /// number of bytes already transferred.
    fn begin_transaction_chunk(
        &self,
        token: BufferToken,
        segments: &mut Vec<PhysicalSegment>,
        segment_capacity: usize,
    ) -> Result<usize, WdStatus>;

    /// Records that the in-flight chunk finished and, if bytes remain, maps
    /// the following chunk into `segments`.
    fn poll_chunk_complete(
        &self,
        token: BufferToken,
        segments: &mut Vec<PhysicalSegment>,
        segment_capacity: usize,
    ) -> Result<ChunkProgress, WdStatus>;

    /// Stops expecting completions for the transaction. Fails with
    /// [`WdStatus::OPERATION_ALREADY_DONE`] if it is already released.
    fn release_transaction(&self, token: BufferToken) -> Result<(), WdStatus>;

    /// Tears down the transaction and unpins its memory.
    fn end_transaction(&self, token: BufferToken) -> Result<(), WdStatus>;

    /// Makes device writes to the buffer visible to the CPU.
    fn flush_for_cpu(&self, token: BufferToken) -> Result<(), WdStatus>;

    /// Makes CPU writes to the buffer visible to the device.
    fn flush_for_device(&self, token: BufferToken) -> Result<(), WdStatus>;
}
