// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! DMA for the Altera Avalon-MM PCIe descriptor controller.
//!
//! The controller reads up to [`MAX_DESCRIPTORS`] descriptors from a table
//! in host memory. [`AvalonMmDma`] keeps that table in a contiguous DMA
//! buffer and moves the caller's memory through a scatter/gather
//! transaction, programming one table per chunk from the transaction's
//! chunk builder.

#![forbid(unsafe_code)]

mod descriptor;
pub mod registers;

#[cfg(test)]
mod tests;

pub use descriptor::Descriptor;
pub use descriptor::DescriptorControl;
pub use descriptor::DescriptorStatus;
pub use descriptor::DescriptorTable;
pub use descriptor::MAX_DESCRIPTORS;
pub use descriptor::MAX_TRANSFER_SIZE;
pub use descriptor::descriptor_offset;
pub use descriptor::status_offset;

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;
use thiserror::Error;
use tracing::instrument;
use wdc_defs::DmaDirection;
use wdc_defs::DmaOptions;
use wdc_dma::ChunkBuilder;
use wdc_dma::DmaBuffer;
use wdc_dma::DmaChunk;
use wdc_dma::DmaContext;
use wdc_dma::DmaError;
use wdc_dma::DmaTransaction;
use wdc_dma::TransactionState;
use wdc_dma::TransferStatus;
use wdc_dma::device::DeviceRegisterIo;
use wdc_dma::device::DmaDevice;
use wdc_dma::memory::MemoryBlock;

/// How long to wait for the controller to finish a chunk by default.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Direction of a transfer, relative to the device.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TransferDirection {
    /// Host memory to the endpoint.
    ToDevice,
    /// Endpoint to host memory.
    FromDevice,
}

impl TransferDirection {
    fn control_block(self) -> usize {
        match self {
            TransferDirection::ToDevice => registers::TO_DEVICE_CONTROL,
            TransferDirection::FromDevice => registers::FROM_DEVICE_CONTROL,
        }
    }

    fn endpoint_fifo(self) -> u64 {
        match self {
            TransferDirection::ToDevice => registers::ENDPOINT_READ_FIFO,
            TransferDirection::FromDevice => registers::ENDPOINT_WRITE_FIFO,
        }
    }

    fn options(self) -> DmaOptions {
        DmaOptions::new().with_direction(match self {
            TransferDirection::ToDevice => DmaDirection::ToDevice,
            TransferDirection::FromDevice => DmaDirection::FromDevice,
        })
    }
}

/// An Avalon-MM DMA error.
#[derive(Debug, Error)]
pub enum AvalonError {
    /// A buffer or transaction operation failed.
    #[error(transparent)]
    Dma(#[from] DmaError),
    /// The controller moves whole dwords; the buffer must start on a dword
    /// boundary and be a nonzero number of dwords long.
    #[error("cannot transfer {byte_count:#x} bytes at {address:#x}: not whole dwords")]
    InvalidTransfer {
        /// Virtual address of the buffer.
        address: u64,
        /// Requested length.
        byte_count: usize,
    },
    /// A chunk has more page descriptors than the table can hold.
    #[error("chunk needs {0} descriptors, the table holds fewer")]
    TooManySegments(usize),
    /// The controller did not mark the last descriptor done in time.
    #[error("transfer did not complete within {0:?}")]
    Timeout(Duration),
    /// Host and endpoint memory differ after a transfer.
    #[error("data mismatch at offset {offset:#x}: host {host:#x}, endpoint {endpoint:#x}")]
    Mismatch {
        /// Byte offset within the transfer.
        offset: usize,
        /// The dword in host memory.
        host: u32,
        /// The dword in endpoint memory.
        endpoint: u32,
    },
}

/// Writes descriptor tables and the controller registers that point at them.
struct TableProgrammer<R> {
    registers: Arc<R>,
    table: DmaBuffer,
    direction: TransferDirection,
    fpga_offset: u64,
    failure: Mutex<Option<AvalonError>>,
}

impl<R: DeviceRegisterIo> TableProgrammer<R> {
    fn program(&self, chunk: &DmaChunk<'_>) -> Result<(), AvalonError> {
        let segments = chunk.segments();
        if segments.len() >= MAX_DESCRIPTORS {
            return Err(AvalonError::TooManySegments(segments.len()));
        }

        let memory = self.table.memory();
        memory.fill_at(0, 0, size_of::<DescriptorTable>());
        let mut device_offset = self.fpga_offset + chunk.offset() as u64;
        for (index, segment) in segments.iter().enumerate() {
            let (src, dst) = match self.direction {
                TransferDirection::ToDevice => (segment.physical_address, device_offset),
                TransferDirection::FromDevice => (device_offset, segment.physical_address),
            };
            let descriptor = Descriptor::new(src, dst, segment.byte_count, index as u8);
            memory.write_obj(descriptor_offset(index), &descriptor);
            device_offset += u64::from(segment.byte_count);
        }
        self.table.sync_for_device()?;

        let base = self.direction.control_block();
        let table_address = self.table.segments()[0].physical_address;
        let fifo = self.direction.endpoint_fifo();
        self.registers
            .write_u32(base + registers::DESCRIPTORS_LOW, table_address as u32);
        self.registers
            .write_u32(base + registers::DESCRIPTORS_HIGH, (table_address >> 32) as u32);
        self.registers
            .write_u32(base + registers::FIFO_LOW, fifo as u32);
        self.registers
            .write_u32(base + registers::FIFO_HIGH, (fifo >> 32) as u32);
        self.registers
            .write_u32(base + registers::TABLE_SIZE, segments.len() as u32 - 1);
        Ok(())
    }
}

/// The chunk builder registered with the transaction.
struct BuildTable<R>(Arc<TableProgrammer<R>>);

impl<R: DeviceRegisterIo> ChunkBuilder for BuildTable<R> {
    fn build_chunk(&mut self, chunk: &DmaChunk<'_>) {
        tracing::trace!(
            index = chunk.index(),
            offset = chunk.offset(),
            segments = chunk.segments().len(),
            "programming descriptor table"
        );
        if let Err(err) = self.0.program(chunk) {
            tracing::error!(
                error = &err as &dyn std::error::Error,
                "failed to program descriptor table"
            );
            *self.0.failure.lock() = Some(err);
        }
    }
}

/// A DMA transfer between caller memory and the endpoint.
pub struct AvalonMmDma<R> {
    programmer: Arc<TableProgrammer<R>>,
    transaction: DmaTransaction,
    timeout: Duration,
}

impl<R: DeviceRegisterIo + 'static> AvalonMmDma<R> {
    /// Locks a descriptor table and initializes a transaction over the
    /// first `byte_count` bytes of `memory`. Endpoint addresses start at
    /// `fpga_offset`.
    ///
    /// `memory` must be dword aligned and `byte_count` a nonzero multiple of
    /// four.
    pub fn new(
        context: &DmaContext,
        device: &mut dyn DmaDevice,
        registers: Arc<R>,
        memory: &MemoryBlock,
        byte_count: usize,
        direction: TransferDirection,
        fpga_offset: u64,
    ) -> Result<Self, AvalonError> {
        const DWORD: usize = size_of::<u32>();
        let address = memory.virtual_address();
        if byte_count == 0
            || !byte_count.is_multiple_of(DWORD)
            || !address.is_multiple_of(DWORD as u64)
        {
            return Err(AvalonError::InvalidTransfer {
                address,
                byte_count,
            });
        }

        let options = direction.options();
        let table = context.lock_contiguous(
            Some(&*device),
            options,
            size_of::<DescriptorTable>(),
        )?;
        let transaction = match context.init_transaction_scatter_gather(
            device,
            memory,
            options,
            byte_count,
            None,
            MAX_TRANSFER_SIZE,
            size_of::<Descriptor>(),
        ) {
            Ok(transaction) => transaction,
            Err(err) => {
                if let Err(unlock_err) = table.unlock() {
                    tracing::warn!(
                        error = &unlock_err as &dyn std::error::Error,
                        "failed to unlock descriptor table"
                    );
                }
                return Err(err.into());
            }
        };

        tracing::debug!(?direction, byte_count, fpga_offset, "avalon-mm dma initialized");
        Ok(Self {
            programmer: Arc::new(TableProgrammer {
                registers,
                table,
                direction,
                fpga_offset,
                failure: Mutex::new(None),
            }),
            transaction,
            timeout: DEFAULT_TIMEOUT,
        })
    }

    /// Sets how long to wait for each chunk.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// The transfer direction.
    pub fn direction(&self) -> TransferDirection {
        self.programmer.direction
    }

    /// The underlying transaction.
    pub fn transaction(&self) -> &DmaTransaction {
        &self.transaction
    }

    /// The descriptor table buffer.
    pub fn descriptor_table(&self) -> &DmaBuffer {
        &self.programmer.table
    }

    /// Moves the whole buffer, chunk by chunk, and waits for completion.
    #[instrument(skip_all, fields(direction = ?self.programmer.direction))]
    pub fn run_transaction(&mut self) -> Result<(), AvalonError> {
        let direction = self.programmer.direction;
        if direction == TransferDirection::ToDevice {
            self.transaction.sync_for_device()?;
        }

        self.transaction
            .execute(BuildTable(self.programmer.clone()))?;
        loop {
            self.take_failure()?;
            self.start();
            self.poll_completion()?;
            match self.transaction.check_completion_and_advance(true)? {
                TransferStatus::Complete => break,
                TransferStatus::MoreProcessingRequired => {}
            }
        }

        if direction == TransferDirection::FromDevice {
            self.transaction.sync_for_cpu()?;
        }
        tracing::debug!(
            bytes = self.transaction.bytes_transferred(),
            chunks = self.transaction.chunk_index() + 1,
            "avalon-mm transfer finished"
        );
        Ok(())
    }

    /// Releases the transaction so it can be run again.
    pub fn release(&mut self) -> Result<(), AvalonError> {
        self.transaction.release()?;
        Ok(())
    }

    /// Compares everything transferred so far with endpoint memory, read
    /// through `endpoint` at the transfer's FPGA offset.
    pub fn verify(&self, endpoint: &impl DeviceRegisterIo) -> Result<(), AvalonError> {
        let memory = self.transaction.buffer().memory();
        let base = self.programmer.fpga_offset as usize;
        for offset in (0..self.transaction.bytes_transferred()).step_by(4) {
            let host = memory.read_obj::<u32>(offset);
            let endpoint = endpoint.read_u32(base + offset);
            if host != endpoint {
                return Err(AvalonError::Mismatch {
                    offset,
                    host,
                    endpoint,
                });
            }
        }
        Ok(())
    }

    /// Tears down the transaction and unlocks the descriptor table.
    ///
    /// Both steps are attempted; the first failure is returned.
    pub fn free(self) -> Result<(), AvalonError> {
        let Self {
            programmer,
            mut transaction,
            timeout: _,
        } = self;

        let mut result = Ok(());
        if matches!(
            transaction.state(),
            TransactionState::Executing | TransactionState::Complete
        ) {
            result = transaction.release().map_err(AvalonError::from);
        }
        let uninit = transaction.uninit().map_err(AvalonError::from);
        result = result.and(uninit);

        // The transaction held the builder's reference.
        match Arc::try_unwrap(programmer) {
            Ok(programmer) => {
                result = result.and(programmer.table.unlock().map_err(AvalonError::from));
            }
            Err(_) => tracing::warn!("descriptor table still referenced, dropping"),
        }
        if let Err(err) = &result {
            tracing::error!(
                error = err as &dyn std::error::Error,
                "failed to free avalon-mm dma"
            );
        }
        result
    }

    fn take_failure(&self) -> Result<(), AvalonError> {
        self.programmer.failure.lock().take().map_or(Ok(()), Err)
    }

    /// Writes the last descriptor pointer, which starts the transfer.
    fn start(&self) {
        let last = self.transaction.segments().len().saturating_sub(1);
        tracing::trace!(last, "starting transfer");
        self.programmer.registers.write_u32(
            self.programmer.direction.control_block() + registers::LAST_PTR,
            last as u32,
        );
    }

    /// Waits for the controller to mark the last descriptor done.
    fn poll_completion(&self) -> Result<(), AvalonError> {
        let last = self.transaction.segments().len().saturating_sub(1);
        let table = self.programmer.table.memory();
        let deadline = Instant::now() + self.timeout;
        loop {
            if table.read_obj::<DescriptorStatus>(status_offset(last)).done() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                tracing::error!(last, timeout = ?self.timeout, "descriptor controller timed out");
                return Err(AvalonError::Timeout(self.timeout));
            }
            std::thread::yield_now();
        }
    }
}
