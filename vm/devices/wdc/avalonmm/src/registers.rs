// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! BAR0 register map of the descriptor controller.
//!
//! The controller has one block of control registers per direction. Reads
//! from the host (to-device transfers) are controlled at
//! [`TO_DEVICE_CONTROL`], writes to the host at [`FROM_DEVICE_CONTROL`].

/// Base of the to-device (RD_*) control block.
pub const TO_DEVICE_CONTROL: usize = 0x0;
/// Base of the from-device (WR_*) control block.
pub const FROM_DEVICE_CONTROL: usize = 0x100;

/// Host address of the descriptor table, low dword.
pub const DESCRIPTORS_LOW: usize = 0x0;
/// Host address of the descriptor table, high dword.
pub const DESCRIPTORS_HIGH: usize = 0x4;
/// Endpoint address of the descriptor FIFO, low dword.
pub const FIFO_LOW: usize = 0x8;
/// Endpoint address of the descriptor FIFO, high dword.
pub const FIFO_HIGH: usize = 0xc;
/// Index of the last valid descriptor. Writing it starts the transfer.
pub const LAST_PTR: usize = 0x10;
/// Number of valid descriptors minus one.
pub const TABLE_SIZE: usize = 0x14;
/// Control register.
pub const CONTROL: usize = 0x18;

/// Endpoint descriptor FIFO for to-device transfers.
pub const ENDPOINT_READ_FIFO: u64 = 0x8000_0000;
/// Endpoint descriptor FIFO for from-device transfers.
pub const ENDPOINT_WRITE_FIFO: u64 = 0x8000_2000;

/// Size of the register space covering both control blocks.
pub const CONTROL_SPACE_SIZE: usize = 0x200;
