// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Cache synchronization around device access.
//!
//! Unless a buffer is mapped coherently (contiguous buffers without
//! `allow_cache`, on most platforms), the CPU and the device can observe
//! different contents for the same bytes. The caller is responsible for
//! bracketing device access:
//!
//! * call [`DmaBuffer::sync_for_device`] after the CPU writes data the device
//!   will read, and before starting the transfer;
//! * call [`DmaBuffer::sync_for_cpu`] after the device has written data and
//!   before the CPU reads it.
//!
//! Skipping either results in stale data, not an error.

use crate::buffer::DmaBuffer;
use crate::error::DmaError;
use crate::error::DmaOperation;
use crate::error::service_failed;

impl DmaBuffer {
    /// Makes data written by the device visible to the CPU.
    pub fn sync_for_cpu(&self) -> Result<(), DmaError> {
        tracing::trace!(token = %self.token, "sync for cpu");
        self.service
            .flush_for_cpu(self.token)
            .map_err(|status| service_failed(DmaOperation::SyncCpu, self.token, status))
    }

    /// Makes data written by the CPU visible to the device.
    pub fn sync_for_device(&self) -> Result<(), DmaError> {
        tracing::trace!(token = %self.token, "sync for device");
        self.service
            .flush_for_device(self.token)
            .map_err(|status| service_failed(DmaOperation::SyncIo, self.token, status))
    }
}
