// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Every driver call failure surfaces as the operation that made the call,
//! with the driver's status unchanged.

use super::setup;
use super::user_memory;
use crate::DmaContext;
use crate::DmaError;
use crate::DmaOperation;
use crate::TransferStatus;
use crate::emulated::EmulatedDevice;
use crate::emulated::EmulatedService;
use crate::emulated::ServiceCall;
use std::sync::Arc;
use test_with_tracing::test;
use wdc_defs::CardHandle;
use wdc_defs::DmaOptions;
use wdc_defs::PAGE_SIZE;
use wdc_defs::WdStatus;

const RESERVED_BASE: u64 = 0x8000_0000;

/// Not one of the named codes, to show it is passed through untouched.
const INJECTED: WdStatus = WdStatus(0x2000_00ee);

/// Runs one of everything: each buffer kind through lock, sync and unlock,
/// then a two-chunk transaction through its whole lifecycle.
fn lifecycle(context: &DmaContext) -> Result<(), DmaError> {
    let buffer = context.lock_contiguous(None, DmaOptions::new(), 2 * PAGE_SIZE)?;
    let handle = buffer.shared_handle().unwrap();
    let attached = context.attach_shared_buffer(handle)?;
    attached.unlock()?;
    buffer.sync_for_device()?;
    buffer.sync_for_cpu()?;
    buffer.unlock()?;

    let memory = user_memory(3 * PAGE_SIZE);
    let buffer = context.lock_scatter_gather(None, &memory, DmaOptions::new(), 3 * PAGE_SIZE)?;
    buffer.unlock()?;

    let buffer = context.lock_reserved(None, RESERVED_BASE, DmaOptions::new(), PAGE_SIZE)?;
    buffer.unlock()?;

    let mut device = EmulatedDevice::new(CardHandle(1));
    let mut transaction = context.init_transaction_scatter_gather(
        &mut device,
        &memory,
        DmaOptions::new(),
        2 * PAGE_SIZE,
        None,
        PAGE_SIZE,
        16,
    )?;
    transaction.execute_without_builder()?;
    while transaction.check_completion_and_advance(false)? == TransferStatus::MoreProcessingRequired
    {}
    transaction.release()?;
    transaction.uninit()
}

fn fixture() -> (Arc<EmulatedService>, DmaContext) {
    let (service, context) = setup();
    service
        .add_reserved_range(RESERVED_BASE, 4 * PAGE_SIZE)
        .unwrap();
    (service, context)
}

#[test]
fn lifecycle_succeeds_without_faults() {
    let (service, context) = fixture();
    lifecycle(&context).unwrap();
    assert_eq!(service.outstanding_pins(), 0);
    assert_eq!(context.outstanding_records(), 0);
    assert_eq!(service.call_count(ServiceCall::PollChunkComplete), 2);
}

#[test]
fn every_service_failure_names_its_operation() {
    let cases = [
        (ServiceCall::PinContiguous, DmaOperation::ContigBufLock),
        (ServiceCall::AttachExisting, DmaOperation::BufGet),
        (ServiceCall::Unpin, DmaOperation::BufUnlock),
        (ServiceCall::FlushForDevice, DmaOperation::SyncIo),
        (ServiceCall::FlushForCpu, DmaOperation::SyncCpu),
        (ServiceCall::PinScatterGather, DmaOperation::SgBufLock),
        (ServiceCall::PinReserved, DmaOperation::ReservedBufLock),
        (ServiceCall::BeginTransaction, DmaOperation::TransactionInit),
        (
            ServiceCall::BeginTransactionChunk,
            DmaOperation::TransactionExecute,
        ),
        (
            ServiceCall::PollChunkComplete,
            DmaOperation::TransferCompletedAndCheck,
        ),
        (
            ServiceCall::ReleaseTransaction,
            DmaOperation::TransactionRelease,
        ),
        (ServiceCall::EndTransaction, DmaOperation::TransactionUninit),
    ];

    for (call, expected) in cases {
        let (service, context) = fixture();
        service.fail_next(call, INJECTED);
        match lifecycle(&context) {
            Err(DmaError::Service { op, status }) => {
                assert_eq!(op, expected, "{call:?}");
                assert_eq!(status, INJECTED, "{call:?}");
            }
            other => panic!("{call:?}: unexpected result {other:?}"),
        }
        assert_eq!(context.outstanding_records(), 0, "{call:?}");
    }
}
