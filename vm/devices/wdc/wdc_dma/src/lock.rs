// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Locking and unlocking of DMA buffers.

use crate::DmaContext;
use crate::buffer::BufferMode;
use crate::buffer::DmaBuffer;
use crate::buffer::PinKind;
use crate::buffer::RecordGuard;
use crate::device::DmaDevice;
use crate::error::DmaError;
use crate::error::DmaOperation;
use crate::error::service_failed;
use crate::memory::MemoryBlock;
use crate::service::ContiguousRequest;
use crate::service::ReservedRequest;
use crate::service::ScatterGatherRequest;
use wdc_defs::BufferToken;
use wdc_defs::CardHandle;
use wdc_defs::DmaOptions;
use wdc_defs::GlobalHandle;
use wdc_defs::PhysicalSegment;
use wdc_defs::WdStatus;

pub(crate) fn card_of(device: Option<&dyn DmaDevice>) -> CardHandle {
    device.map_or(CardHandle::NONE, |device| device.card_handle())
}

/// Checks option bits that every request must satisfy.
pub(crate) fn validate_common(options: DmaOptions, byte_count: usize) -> Result<(), DmaError> {
    if byte_count == 0 {
        return Err(DmaError::InvalidParameter("buffer size must be nonzero"));
    }
    if options.reserved_bits() != 0 {
        return Err(DmaError::InvalidParameter("reserved option bits are set"));
    }
    if options.get_existing_buf() {
        return Err(DmaError::InvalidParameter(
            "existing buffers are attached by global handle",
        ));
    }
    if options.kbuf_alloc_specify_address_width() {
        if !(1..=64).contains(&options.address_width()) {
            return Err(DmaError::InvalidParameter(
                "address width must be between 1 and 64 bits",
            ));
        }
    } else if options.address_width() != 0 {
        return Err(DmaError::InvalidParameter(
            "address width requires kbuf_alloc_specify_address_width",
        ));
    }
    Ok(())
}

fn validate_lock(options: DmaOptions, byte_count: usize) -> Result<(), DmaError> {
    validate_common(options, byte_count)?;
    if options.transaction() {
        return Err(DmaError::InvalidParameter(
            "transaction buffers must be created with a transaction init",
        ));
    }
    Ok(())
}

pub(crate) fn covered_bytes(segments: &[PhysicalSegment]) -> usize {
    segments.iter().map(|s| s.byte_count as usize).sum()
}

/// The memory of a lock that the engine has not accepted yet.
struct PendingLock {
    op: DmaOperation,
    mode: BufferMode,
    options: DmaOptions,
    byte_count: usize,
    token: BufferToken,
    memory: Option<MemoryBlock>,
    segments: Vec<PhysicalSegment>,
    segment_capacity: usize,
    global_handle: GlobalHandle,
    attached: bool,
}

impl DmaContext {
    /// Allocates and locks a physically contiguous buffer of `byte_count`
    /// bytes. The returned buffer's memory is mapped by the driver.
    pub fn lock_contiguous(
        &self,
        device: Option<&dyn DmaDevice>,
        options: DmaOptions,
        byte_count: usize,
    ) -> Result<DmaBuffer, DmaError> {
        validate_lock(options, byte_count)?;
        if options.reserved_mem() {
            return Err(DmaError::InvalidParameter(
                "reserved memory is locked with lock_reserved",
            ));
        }
        let options = options.with_kernel_buffer_alloc(true);
        let mut segments = self.reserve_segments(1)?;
        let request = ContiguousRequest {
            card: card_of(device),
            options,
            byte_count,
        };
        let pinned = self
            .service
            .pin_contiguous(&request, &mut segments)
            .map_err(|status| {
                service_failed(DmaOperation::ContigBufLock, BufferToken::NONE, status)
            })?;

        self.accept_lock(PendingLock {
            op: DmaOperation::ContigBufLock,
            mode: BufferMode::Contiguous,
            options,
            byte_count,
            token: pinned.token,
            memory: pinned.memory,
            segments,
            segment_capacity: 1,
            global_handle: pinned.global_handle,
            attached: false,
        })
    }

    /// Locks the first `byte_count` bytes of caller memory for
    /// scatter/gather DMA.
    ///
    /// The memory stays owned by the caller; the returned buffer keeps a
    /// reference to it until unlocked.
    pub fn lock_scatter_gather(
        &self,
        device: Option<&dyn DmaDevice>,
        memory: &MemoryBlock,
        options: DmaOptions,
        byte_count: usize,
    ) -> Result<DmaBuffer, DmaError> {
        validate_lock(options, byte_count)?;
        if options.kernel_buffer_alloc() {
            return Err(DmaError::InvalidParameter(
                "kernel_buffer_alloc cannot be used with a scatter/gather lock",
            ));
        }
        if options.reserved_mem() {
            return Err(DmaError::InvalidParameter(
                "reserved_mem cannot be used with a scatter/gather lock",
            ));
        }
        if memory.len() < byte_count {
            return Err(DmaError::InvalidParameter(
                "user buffer is smaller than the requested size",
            ));
        }

        let mut options = options;
        let segment_capacity = self.size_descriptors(byte_count, &mut options);
        let mut segments = self.reserve_segments(segment_capacity)?;
        let request = ScatterGatherRequest {
            card: card_of(device),
            options,
            memory,
            byte_count,
            segment_capacity,
            inline_capacity: self.config.inline_segment_capacity,
        };
        let pinned = self
            .service
            .pin_scatter_gather(&request, &mut segments)
            .map_err(|status| service_failed(DmaOperation::SgBufLock, BufferToken::NONE, status))?;

        self.accept_lock(PendingLock {
            op: DmaOperation::SgBufLock,
            mode: BufferMode::ScatterGather,
            options,
            byte_count,
            token: pinned.token,
            memory: Some(memory.clone()),
            segments,
            segment_capacity,
            global_handle: GlobalHandle::NONE,
            attached: false,
        })
    }

    /// Maps `byte_count` bytes of reserved physical memory starting at
    /// `physical_address`.
    pub fn lock_reserved(
        &self,
        device: Option<&dyn DmaDevice>,
        physical_address: u64,
        options: DmaOptions,
        byte_count: usize,
    ) -> Result<DmaBuffer, DmaError> {
        validate_lock(options, byte_count)?;
        let options = options
            .with_reserved_mem(true)
            .with_kernel_buffer_alloc(true);
        let mut segments = self.reserve_segments(1)?;
        let request = ReservedRequest {
            card: card_of(device),
            options,
            physical_address,
            byte_count,
        };
        let pinned = self
            .service
            .pin_reserved(&request, &mut segments)
            .map_err(|status| {
                service_failed(DmaOperation::ReservedBufLock, BufferToken::NONE, status)
            })?;

        self.accept_lock(PendingLock {
            op: DmaOperation::ReservedBufLock,
            mode: BufferMode::Reserved,
            options,
            byte_count,
            token: pinned.token,
            memory: pinned.memory,
            segments,
            segment_capacity: 1,
            global_handle: GlobalHandle::NONE,
            attached: false,
        })
    }

    /// Attaches to a contiguous buffer locked by another process, given the
    /// buffer's [`DmaBuffer::shared_handle`].
    ///
    /// The attached buffer must be unlocked like any other.
    pub fn attach_shared_buffer(&self, handle: GlobalHandle) -> Result<DmaBuffer, DmaError> {
        if handle.is_none() {
            tracing::debug!("attach with null global handle");
            return Err(DmaError::InvalidHandle(handle));
        }
        let mut segments = self.reserve_segments(1)?;
        let attached = self
            .service
            .attach_existing(handle, &mut segments)
            .map_err(|status| service_failed(DmaOperation::BufGet, BufferToken::NONE, status))?;

        tracing::debug!(%handle, token = %attached.token, "attached to shared dma buffer");
        self.accept_lock(PendingLock {
            op: DmaOperation::BufGet,
            mode: BufferMode::Contiguous,
            options: attached.options,
            byte_count: attached.byte_count,
            token: attached.token,
            memory: Some(attached.memory),
            segments,
            segment_capacity: 1,
            global_handle: handle,
            attached: true,
        })
    }

    /// Builds the buffer record for a pin, or undoes the pin if the driver's
    /// response is unusable.
    fn accept_lock(&self, pending: PendingLock) -> Result<DmaBuffer, DmaError> {
        let PendingLock {
            op,
            mode,
            options,
            byte_count,
            token,
            memory,
            segments,
            segment_capacity,
            global_handle,
            attached,
        } = pending;

        let reason = if memory.is_none() {
            Some("driver did not map the buffer")
        } else if segments.len() > segment_capacity {
            Some("driver overran the page descriptor array")
        } else if covered_bytes(&segments) != byte_count {
            Some("page descriptors do not cover the buffer")
        } else {
            None
        };
        let Some(memory) = memory.filter(|_| reason.is_none()) else {
            tracing::error!(%op, %token, reason, "inconsistent driver response");
            if let Err(status) = self.service.unpin(token) {
                tracing::error!(%op, %token, %status, "failed to undo pin");
            }
            return Err(DmaError::Service {
                op,
                status: WdStatus::OPERATION_FAILED,
            });
        };

        tracing::debug!(
            %op,
            %token,
            byte_count,
            segments = segments.len(),
            "dma buffer locked"
        );
        Ok(DmaBuffer {
            service: self.service.clone(),
            config: self.config,
            token,
            pinned: true,
            kind: PinKind::Lock,
            mode,
            options,
            byte_count,
            memory,
            segments,
            segment_capacity,
            global_handle,
            attached,
            _record: RecordGuard::new(&self.records),
        })
    }
}

impl DmaBuffer {
    /// Unlocks the buffer and frees its record.
    ///
    /// The record is freed even if the driver fails to unpin; that failure is
    /// still returned.
    pub fn unlock(mut self) -> Result<(), DmaError> {
        let token = self.disarm();
        self.service
            .unpin(token)
            .map_err(|status| service_failed(DmaOperation::BufUnlock, token, status))?;
        tracing::debug!(%token, attached = self.attached, "dma buffer unlocked");
        Ok(())
    }
}
