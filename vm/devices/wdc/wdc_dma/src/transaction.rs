// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Multi-phase DMA transactions.
//!
//! A transaction moves a buffer in chunks of at most `max_transfer_size`
//! bytes. The required call order is
//!
//! ```text
//! init -> execute -> check_completion_and_advance* -> release -> uninit
//! ```
//!
//! [`DmaTransaction::execute`] maps the first chunk and hands it to the
//! caller's [`ChunkBuilder`]. After the device signals completion, the caller
//! calls [`DmaTransaction::check_completion_and_advance`] until it returns
//! [`TransferStatus::Complete`]; every intermediate result maps the next
//! chunk and, if requested, hands it to the builder again.
//!
//! Calls out of order are rejected with [`DmaError::InvalidState`]. A second
//! `execute` without an intervening release is rejected even for
//! single-chunk transfers.

use crate::DmaContext;
use crate::buffer::BufferMode;
use crate::buffer::DmaBuffer;
use crate::buffer::PinKind;
use crate::buffer::RecordGuard;
use crate::device::DmaDevice;
use crate::device::InterruptParameters;
use crate::error::DmaError;
use crate::error::DmaOperation;
use crate::error::service_failed;
use crate::lock::card_of;
use crate::lock::covered_bytes;
use crate::lock::validate_common;
use crate::memory::MemoryBlock;
use crate::service::ChunkProgress;
use crate::service::TransactionBacking;
use crate::service::TransactionRequest;
use std::fmt;
use tracing::instrument;
use wdc_defs::BufferToken;
use wdc_defs::DmaOptions;
use wdc_defs::PhysicalSegment;
use wdc_defs::WdStatus;

/// The lifecycle state of a [`DmaTransaction`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TransactionState {
    /// Memory is pinned; nothing has been executed.
    Initialized,
    /// A chunk is mapped and owned by the device.
    Executing,
    /// Every byte has been transferred.
    Complete,
    /// The driver no longer expects completions. Can be executed again.
    Released,
}

/// The result of a successful completion check.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TransferStatus {
    /// The transfer is finished.
    Complete,
    /// Another chunk was mapped and must be programmed and started.
    MoreProcessingRequired,
}

impl TransferStatus {
    /// The status code equivalent.
    pub fn status(&self) -> WdStatus {
        match self {
            TransferStatus::Complete => WdStatus::SUCCESS,
            TransferStatus::MoreProcessingRequired => WdStatus::MORE_PROCESSING_REQUIRED,
        }
    }
}

/// Programs one chunk of a transaction into the device.
///
/// Called synchronously on the caller's thread, once per chunk. The chunk's
/// page descriptors are only valid for the duration of the call.
pub trait ChunkBuilder: Send {
    /// Programs `chunk` into the device.
    fn build_chunk(&mut self, chunk: &DmaChunk<'_>);
}

impl<F: FnMut(&DmaChunk<'_>) + Send> ChunkBuilder for F {
    fn build_chunk(&mut self, chunk: &DmaChunk<'_>) {
        self(chunk)
    }
}

/// The chunk of a transaction that is ready to be programmed.
pub struct DmaChunk<'a> {
    buffer: &'a DmaBuffer,
    index: usize,
    offset: usize,
}

impl<'a> DmaChunk<'a> {
    /// Zero-based chunk number within the current execution.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Logical offset of the chunk, i.e. the number of bytes transferred
    /// before it.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// The chunk's physical page descriptors.
    pub fn segments(&self) -> &'a [PhysicalSegment] {
        &self.buffer.segments
    }

    /// The size of the chunk in bytes.
    pub fn len(&self) -> usize {
        covered_bytes(&self.buffer.segments)
    }

    /// The transaction's buffer.
    pub fn buffer(&self) -> &'a DmaBuffer {
        self.buffer
    }
}

/// A buffer locked for a chunked DMA transaction.
pub struct DmaTransaction {
    buffer: DmaBuffer,
    max_transfer_size: usize,
    element_size: usize,
    alignment: usize,
    state: TransactionState,
    bytes_transferred: usize,
    chunk_index: usize,
    builder: Option<Box<dyn ChunkBuilder>>,
}

impl fmt::Debug for DmaTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DmaTransaction")
            .field("buffer", &self.buffer)
            .field("max_transfer_size", &self.max_transfer_size)
            .field("element_size", &self.element_size)
            .field("alignment", &self.alignment)
            .field("state", &self.state)
            .field("bytes_transferred", &self.bytes_transferred)
            .field("chunk_index", &self.chunk_index)
            .field("builder", &self.builder.is_some())
            .finish()
    }
}

/// Parameters of a transaction that has passed local validation.
struct PendingTransaction<'a> {
    mode: BufferMode,
    options: DmaOptions,
    byte_count: usize,
    memory: Option<&'a MemoryBlock>,
    segment_capacity: usize,
    max_transfer_size: usize,
    element_size: usize,
    alignment: usize,
}

impl DmaContext {
    /// Initializes a transaction over a driver-allocated contiguous buffer.
    ///
    /// The whole buffer is transferred as one chunk. `alignment` is the
    /// required physical alignment in bytes, or zero for the default.
    ///
    /// If `interrupt` is given and the device's interrupts are disabled,
    /// they are enabled first. They are disabled again if the transaction
    /// cannot be created.
    pub fn init_transaction_contiguous(
        &self,
        device: &mut dyn DmaDevice,
        options: DmaOptions,
        byte_count: usize,
        interrupt: Option<&InterruptParameters>,
        alignment: usize,
    ) -> Result<DmaTransaction, DmaError> {
        validate_common(options, byte_count)?;
        if options.reserved_mem() {
            return Err(DmaError::InvalidParameter(
                "transactions cannot use reserved memory",
            ));
        }
        if alignment != 0 && !alignment.is_power_of_two() {
            return Err(DmaError::InvalidParameter(
                "alignment must be zero or a power of two",
            ));
        }

        self.init_transaction(
            device,
            interrupt,
            PendingTransaction {
                mode: BufferMode::Contiguous,
                options: options.with_transaction(true).with_kernel_buffer_alloc(true),
                byte_count,
                memory: None,
                segment_capacity: 1,
                max_transfer_size: byte_count,
                element_size: 0,
                alignment,
            },
        )
    }

    /// Initializes a transaction over the first `byte_count` bytes of
    /// caller memory, transferred in chunks of at most `max_transfer_size`
    /// bytes. `element_size` is the size of one device descriptor.
    ///
    /// Interrupts are handled as for
    /// [`DmaContext::init_transaction_contiguous`].
    pub fn init_transaction_scatter_gather(
        &self,
        device: &mut dyn DmaDevice,
        memory: &MemoryBlock,
        options: DmaOptions,
        byte_count: usize,
        interrupt: Option<&InterruptParameters>,
        max_transfer_size: usize,
        element_size: usize,
    ) -> Result<DmaTransaction, DmaError> {
        validate_common(options, byte_count)?;
        if options.kernel_buffer_alloc() || options.reserved_mem() {
            return Err(DmaError::InvalidParameter(
                "scatter/gather transactions use caller memory",
            ));
        }
        if memory.len() < byte_count {
            return Err(DmaError::InvalidParameter(
                "user buffer is smaller than the requested size",
            ));
        }
        if max_transfer_size == 0 {
            return Err(DmaError::InvalidParameter(
                "max transfer size must be nonzero",
            ));
        }

        let mut options = options.with_transaction(true);
        let segment_capacity = self.size_descriptors(max_transfer_size, &mut options);
        self.init_transaction(
            device,
            interrupt,
            PendingTransaction {
                mode: BufferMode::ScatterGather,
                options,
                byte_count,
                memory: Some(memory),
                segment_capacity,
                max_transfer_size,
                element_size,
                alignment: 0,
            },
        )
    }

    fn init_transaction(
        &self,
        device: &mut dyn DmaDevice,
        interrupt: Option<&InterruptParameters>,
        pending: PendingTransaction<'_>,
    ) -> Result<DmaTransaction, DmaError> {
        let op = DmaOperation::TransactionInit;
        let segments = self.reserve_segments(pending.segment_capacity)?;

        let mut enabled_interrupts = false;
        if let Some(params) = interrupt {
            if device.interrupts_enabled() {
                tracing::trace!("interrupts already enabled");
            } else {
                device.enable_interrupts(params).map_err(|status| {
                    tracing::error!(%status, "failed to enable interrupts for dma transaction");
                    DmaError::InterruptEnable(status)
                })?;
                enabled_interrupts = true;
            }
        }

        let backing = match pending.memory {
            Some(memory) => TransactionBacking::ScatterGather {
                memory,
                max_transfer_size: pending.max_transfer_size,
                element_size: pending.element_size,
            },
            None => TransactionBacking::Contiguous {
                alignment: pending.alignment,
            },
        };
        let request = TransactionRequest {
            card: card_of(Some(&*device)),
            options: pending.options,
            byte_count: pending.byte_count,
            segment_capacity: pending.segment_capacity,
            backing,
        };

        let pinned = match self.service.begin_transaction(&request) {
            Ok(pinned) => pinned,
            Err(status) => {
                if enabled_interrupts {
                    roll_back_interrupts(device);
                }
                return Err(service_failed(op, BufferToken::NONE, status));
            }
        };

        let Some(memory) = pending.memory.cloned().or(pinned.memory) else {
            tracing::error!(token = %pinned.token, "driver did not map the transaction buffer");
            if let Err(status) = self.service.end_transaction(pinned.token) {
                tracing::error!(token = %pinned.token, %status, "failed to undo transaction init");
            }
            if enabled_interrupts {
                roll_back_interrupts(device);
            }
            return Err(DmaError::Service {
                op,
                status: WdStatus::OPERATION_FAILED,
            });
        };

        tracing::debug!(
            token = %pinned.token,
            mode = ?pending.mode,
            byte_count = pending.byte_count,
            max_transfer_size = pending.max_transfer_size,
            "dma transaction initialized"
        );
        Ok(DmaTransaction {
            buffer: DmaBuffer {
                service: self.service.clone(),
                config: self.config,
                token: pinned.token,
                pinned: true,
                kind: PinKind::Transaction,
                mode: pending.mode,
                options: pending.options,
                byte_count: pending.byte_count,
                memory,
                segments,
                segment_capacity: pending.segment_capacity,
                global_handle: pinned.global_handle,
                attached: false,
                _record: RecordGuard::new(&self.records),
            },
            max_transfer_size: pending.max_transfer_size,
            element_size: pending.element_size,
            alignment: pending.alignment,
            state: TransactionState::Initialized,
            bytes_transferred: 0,
            chunk_index: 0,
            builder: None,
        })
    }
}

fn roll_back_interrupts(device: &mut dyn DmaDevice) {
    tracing::debug!("disabling interrupts enabled for a failed transaction init");
    if let Err(status) = device.disable_interrupts() {
        tracing::warn!(%status, "failed to disable interrupts after transaction init failure");
    }
}

fn is_valid_transition(from: TransactionState, to: TransactionState) -> bool {
    use TransactionState::*;
    matches!(
        (from, to),
        (Initialized, Executing)
            | (Released, Executing)
            | (Executing, Complete)
            | (Executing, Released)
            | (Complete, Released)
    )
}

impl DmaTransaction {
    /// The current state.
    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// The underlying buffer.
    pub fn buffer(&self) -> &DmaBuffer {
        &self.buffer
    }

    /// The page descriptors of the chunk in flight.
    pub fn segments(&self) -> &[PhysicalSegment] {
        self.buffer.segments()
    }

    /// Bytes transferred before the chunk in flight, or in total once
    /// complete.
    pub fn bytes_transferred(&self) -> usize {
        self.bytes_transferred
    }

    /// Zero-based number of the chunk in flight.
    pub fn chunk_index(&self) -> usize {
        self.chunk_index
    }

    /// Largest chunk size in bytes.
    pub fn max_transfer_size(&self) -> usize {
        self.max_transfer_size
    }

    /// Size of one device descriptor, for scatter/gather transactions.
    pub fn element_size(&self) -> usize {
        self.element_size
    }

    /// Required physical alignment, for contiguous transactions.
    pub fn alignment(&self) -> usize {
        self.alignment
    }

    /// See [`DmaBuffer::sync_for_cpu`].
    pub fn sync_for_cpu(&self) -> Result<(), DmaError> {
        self.buffer.sync_for_cpu()
    }

    /// See [`DmaBuffer::sync_for_device`].
    pub fn sync_for_device(&self) -> Result<(), DmaError> {
        self.buffer.sync_for_device()
    }

    /// Maps the first chunk and passes it to `builder`, which is kept for
    /// later chunks.
    ///
    /// The builder is not called if the driver fails to map the chunk.
    #[instrument(skip_all, fields(token = %self.buffer.token))]
    pub fn execute(&mut self, builder: impl ChunkBuilder + 'static) -> Result<(), DmaError> {
        self.start(Some(Box::new(builder)))
    }

    /// Maps the first chunk without registering a builder. The caller reads
    /// the descriptors from [`DmaTransaction::segments`].
    #[instrument(skip_all, fields(token = %self.buffer.token))]
    pub fn execute_without_builder(&mut self) -> Result<(), DmaError> {
        self.start(None)
    }

    /// Tells the driver the chunk in flight is finished.
    ///
    /// Returns [`TransferStatus::MoreProcessingRequired`] after mapping the
    /// next chunk, in which case the builder is called for it if
    /// `run_builder_if_more` is set. The builder is never called when the
    /// transfer completes.
    #[instrument(skip_all, fields(token = %self.buffer.token))]
    pub fn check_completion_and_advance(
        &mut self,
        run_builder_if_more: bool,
    ) -> Result<TransferStatus, DmaError> {
        let op = DmaOperation::TransferCompletedAndCheck;
        match self.state {
            TransactionState::Executing => {}
            TransactionState::Complete => return Err(DmaError::AlreadyDone { op }),
            state => {
                tracing::debug!(?state, "completion check on idle transaction");
                return Err(DmaError::InvalidState { op, state });
            }
        }

        let token = self.buffer.token;
        let progress = self
            .buffer
            .service
            .poll_chunk_complete(
                token,
                &mut self.buffer.segments,
                self.buffer.segment_capacity,
            )
            .map_err(|status| service_failed(op, token, status))?;

        match progress {
            ChunkProgress::Complete { bytes_transferred } => {
                self.bytes_transferred = bytes_transferred;
                self.transition_to(TransactionState::Complete);
                tracing::debug!(
                    bytes_transferred,
                    chunks = self.chunk_index + 1,
                    "dma transaction complete"
                );
                Ok(TransferStatus::Complete)
            }
            ChunkProgress::More { bytes_transferred } => {
                self.bytes_transferred = bytes_transferred;
                self.chunk_index += 1;
                if run_builder_if_more {
                    self.build_chunk();
                }
                Ok(TransferStatus::MoreProcessingRequired)
            }
        }
    }

    /// Stops the transfer. The transaction can be executed again or
    /// uninitialized.
    ///
    /// Releasing a completed transaction succeeds. Releasing twice fails with
    /// [`DmaError::AlreadyDone`].
    #[instrument(skip_all, fields(token = %self.buffer.token))]
    pub fn release(&mut self) -> Result<(), DmaError> {
        let op = DmaOperation::TransactionRelease;
        if self.state == TransactionState::Released {
            tracing::debug!("transaction already released");
            return Err(DmaError::AlreadyDone { op });
        }
        self.check_transition(op, TransactionState::Released)?;

        let token = self.buffer.token;
        self.buffer
            .service
            .release_transaction(token)
            .map_err(|status| service_failed(op, token, status))?;
        self.transition_to(TransactionState::Released);
        tracing::debug!(
            bytes_transferred = self.bytes_transferred,
            "dma transaction released"
        );
        Ok(())
    }

    /// Tears down the transaction and frees its record.
    ///
    /// Uninitializing a transaction that was executed but not released is a
    /// caller error; it is released implicitly. The record is freed even if
    /// the driver fails; that failure is still returned.
    pub fn uninit(mut self) -> Result<(), DmaError> {
        if matches!(
            self.state,
            TransactionState::Executing | TransactionState::Complete
        ) {
            tracing::warn!(
                token = %self.buffer.token,
                state = ?self.state,
                "uninitializing a transaction that was not released"
            );
            if let Err(err) = self.release() {
                tracing::warn!(
                    error = &err as &dyn std::error::Error,
                    "implicit release failed"
                );
            }
        }

        let token = self.buffer.disarm();
        self.buffer
            .service
            .end_transaction(token)
            .map_err(|status| service_failed(DmaOperation::TransactionUninit, token, status))?;
        tracing::debug!(%token, "dma transaction uninitialized");
        Ok(())
    }

    fn start(&mut self, builder: Option<Box<dyn ChunkBuilder>>) -> Result<(), DmaError> {
        let op = DmaOperation::TransactionExecute;
        self.check_transition(op, TransactionState::Executing)?;
        self.builder = builder;

        let token = self.buffer.token;
        let bytes_transferred = self
            .buffer
            .service
            .begin_transaction_chunk(
                token,
                &mut self.buffer.segments,
                self.buffer.segment_capacity,
            )
            .map_err(|status| service_failed(op, token, status))?;

        self.bytes_transferred = bytes_transferred;
        self.chunk_index = 0;
        self.transition_to(TransactionState::Executing);
        self.build_chunk();
        Ok(())
    }

    fn build_chunk(&mut self) {
        let chunk = DmaChunk {
            buffer: &self.buffer,
            index: self.chunk_index,
            offset: self.bytes_transferred,
        };
        match &mut self.builder {
            Some(builder) => {
                tracing::trace!(
                    index = chunk.index,
                    offset = chunk.offset,
                    segments = chunk.segments().len(),
                    "building chunk"
                );
                builder.build_chunk(&chunk);
            }
            None => tracing::trace!("no chunk builder registered"),
        }
    }

    fn check_transition(
        &self,
        op: DmaOperation,
        new_state: TransactionState,
    ) -> Result<(), DmaError> {
        if is_valid_transition(self.state, new_state) {
            Ok(())
        } else {
            tracing::debug!(
                %op,
                from = ?self.state,
                to = ?new_state,
                "invalid transaction transition"
            );
            Err(DmaError::InvalidState {
                op,
                state: self.state,
            })
        }
    }

    fn transition_to(&mut self, new_state: TransactionState) {
        tracing::trace!(from = ?self.state, to = ?new_state, "transaction state change");
        self.state = new_state;
    }
}
