// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Device-side collaborators of the DMA library.

use bitfield_struct::bitfield;
use std::fmt;
use std::sync::Arc;
use wdc_defs::CardHandle;
use wdc_defs::WdStatus;

/// An opened device that DMA buffers and transactions are associated with.
pub trait DmaDevice: Send {
    /// The driver's handle for the card.
    fn card_handle(&self) -> CardHandle;

    /// Returns true if interrupts are currently enabled.
    fn interrupts_enabled(&self) -> bool;

    /// Enables interrupt delivery.
    fn enable_interrupts(&mut self, params: &InterruptParameters) -> Result<(), WdStatus>;

    /// Disables interrupt delivery.
    fn disable_interrupts(&mut self) -> Result<(), WdStatus>;
}

/// Access to device registers.
pub trait DeviceRegisterIo: Send + Sync {
    /// Returns the length of the register space.
    fn len(&self) -> usize;
    /// Reads a `u32` register.
    fn read_u32(&self, offset: usize) -> u32;
    /// Reads a `u64` register.
    fn read_u64(&self, offset: usize) -> u64;
    /// Writes a `u32` register.
    fn write_u32(&self, offset: usize, data: u32);
    /// Writes a `u64` register.
    fn write_u64(&self, offset: usize, data: u64);
}

/// Interrupt enable options.
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct InterruptOptions {
    /// Level sensitive interrupt.
    pub level_sensitive: bool,
    /// Copy the values read by the transfer commands back to the caller.
    pub cmd_copy: bool,
    /// Windows CE interrupt id.
    pub ce_int_id: bool,
    /// Return the value of the last read command.
    pub cmd_return_value: bool,
    #[bits(1)]
    _reserved: u8,
    /// Message signaled interrupt.
    pub message: bool,
    /// Extended message signaled interrupt.
    pub message_x: bool,
    /// Do not query the MSI message data.
    pub dont_get_msi_message: bool,
    #[bits(24)]
    _reserved2: u32,
}

/// The access performed by a [`TransferCommand`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TransferKind {
    /// Read a 32-bit register.
    ReadU32,
    /// Write a 32-bit register.
    WriteU32,
    /// Read a 64-bit register.
    ReadU64,
    /// Write a 64-bit register.
    WriteU64,
}

/// A register access the driver performs at interrupt time, typically to
/// acknowledge the interrupt.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TransferCommand {
    /// The access to perform.
    pub kind: TransferKind,
    /// The BAR holding the register.
    pub bar: u8,
    /// Register offset within the BAR.
    pub offset: u64,
    /// Value written by write commands.
    pub value: u64,
}

/// Called by the driver for each delivered interrupt.
pub type InterruptHandler = Arc<dyn Fn() + Send + Sync>;

/// Parameters for enabling interrupts alongside a DMA transaction.
#[derive(Clone, Default)]
pub struct InterruptParameters {
    /// Enable options.
    pub options: InterruptOptions,
    /// Commands run by the driver when the interrupt fires.
    pub transfer_commands: Vec<TransferCommand>,
    /// Handle the interrupt in a kernel plugin.
    pub use_kernel_plugin: bool,
    /// Handler invoked in user mode for each interrupt.
    pub handler: Option<InterruptHandler>,
}

impl fmt::Debug for InterruptParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterruptParameters")
            .field("options", &self.options)
            .field("transfer_commands", &self.transfer_commands)
            .field("use_kernel_plugin", &self.use_kernel_plugin)
            .field("handler", &self.handler.is_some())
            .finish()
    }
}
