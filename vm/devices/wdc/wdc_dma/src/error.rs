// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! DMA error types.

use crate::transaction::TransactionState;
use std::fmt;
use thiserror::Error;
use wdc_defs::BufferToken;
use wdc_defs::GlobalHandle;
use wdc_defs::WdStatus;

/// The library operation that produced an error.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DmaOperation {
    /// Locking a driver-allocated contiguous buffer.
    ContigBufLock,
    /// Locking caller memory as a scatter/gather list.
    SgBufLock,
    /// Locking reserved physical memory.
    ReservedBufLock,
    /// Unlocking any locked buffer.
    BufUnlock,
    /// Attaching to another process's contiguous buffer.
    BufGet,
    /// Initializing a transaction.
    TransactionInit,
    /// Starting the first chunk of a transaction.
    TransactionExecute,
    /// Checking for completion and advancing to the next chunk.
    TransferCompletedAndCheck,
    /// Releasing an in-flight transaction.
    TransactionRelease,
    /// Tearing down a transaction.
    TransactionUninit,
    /// Synchronizing caches for CPU access.
    SyncCpu,
    /// Synchronizing caches for device access.
    SyncIo,
}

impl fmt::Display for DmaOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DmaOperation::ContigBufLock => "ContigBufLock",
            DmaOperation::SgBufLock => "SGBufLock",
            DmaOperation::ReservedBufLock => "ReservedBufLock",
            DmaOperation::BufUnlock => "BufUnlock",
            DmaOperation::BufGet => "BufGet",
            DmaOperation::TransactionInit => "TransactionInit",
            DmaOperation::TransactionExecute => "TransactionExecute",
            DmaOperation::TransferCompletedAndCheck => "TransferCompletedAndCheck",
            DmaOperation::TransactionRelease => "TransactionRelease",
            DmaOperation::TransactionUninit => "TransactionUninit",
            DmaOperation::SyncCpu => "SyncCpu",
            DmaOperation::SyncIo => "SyncIo",
        };
        f.write_str(name)
    }
}

/// An error from a DMA buffer or transaction operation.
#[derive(Debug, Error)]
pub enum DmaError {
    /// An argument or option combination was rejected before contacting the
    /// driver.
    #[error("invalid parameter: {0}")]
    InvalidParameter(&'static str),
    /// The page descriptor array could not be allocated.
    #[error("failed to allocate {segments} page descriptors")]
    InsufficientResources {
        /// Number of descriptors requested.
        segments: usize,
    },
    /// The driver rejected the operation. The status is the driver's,
    /// unmodified.
    #[error("{op} failed: {status}")]
    Service {
        /// The operation being performed.
        op: DmaOperation,
        /// The driver's status.
        status: WdStatus,
    },
    /// Interrupts could not be enabled for a new transaction.
    #[error("failed to enable interrupts: {0}")]
    InterruptEnable(WdStatus),
    /// The operation has already been performed on this transaction.
    #[error("{op}: operation already done")]
    AlreadyDone {
        /// The repeated operation.
        op: DmaOperation,
    },
    /// The global handle does not name a buffer.
    #[error("invalid global handle {0}")]
    InvalidHandle(GlobalHandle),
    /// The transaction is not in a state that allows the operation.
    #[error("{op} is not valid while the transaction is {state:?}")]
    InvalidState {
        /// The rejected operation.
        op: DmaOperation,
        /// The transaction state at the time of the call.
        state: TransactionState,
    },
}

impl DmaError {
    /// Returns the status code equivalent of this error.
    pub fn status(&self) -> WdStatus {
        match self {
            DmaError::InvalidParameter(_) | DmaError::InvalidState { .. } => {
                WdStatus::INVALID_PARAMETER
            }
            DmaError::InsufficientResources { .. } => WdStatus::INSUFFICIENT_RESOURCES,
            DmaError::Service { status, .. } | DmaError::InterruptEnable(status) => *status,
            DmaError::AlreadyDone { .. } => WdStatus::OPERATION_ALREADY_DONE,
            DmaError::InvalidHandle(_) => WdStatus::INVALID_HANDLE,
        }
    }
}

/// Logs a driver failure and wraps it with the operation that caused it.
pub(crate) fn service_failed(op: DmaOperation, token: BufferToken, status: WdStatus) -> DmaError {
    tracing::error!(%op, %token, %status, "driver rejected dma operation");
    DmaError::Service { op, status }
}
