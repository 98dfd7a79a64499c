// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Host-memory layout of the descriptor table.

use bitfield_struct::bitfield;
use static_assertions::const_assert_eq;
use std::mem::offset_of;
use std::mem::size_of;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// Number of entries in the descriptor table.
pub const MAX_DESCRIPTORS: usize = 128;

/// Largest chunk the transaction engine maps at once.
pub const MAX_TRANSFER_SIZE: usize = 4096 * (MAX_DESCRIPTORS - 1);

/// Completion status written by the controller for each descriptor.
#[bitfield(u32)]
#[derive(PartialEq, Eq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct DescriptorStatus {
    /// Set by the controller when the descriptor has been processed.
    pub done: bool,
    #[bits(31)]
    _reserved: u32,
}

/// The control-and-length dword of a [`Descriptor`].
#[bitfield(u32)]
#[derive(PartialEq, Eq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct DescriptorControl {
    /// Transfer size in dwords. Must be nonzero.
    #[bits(18)]
    pub size_dwords: u32,
    /// Descriptor index.
    #[bits(7)]
    pub id: u8,
    #[bits(7)]
    _reserved: u8,
}

/// One read or write descriptor.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct Descriptor {
    /// Source address, low dword.
    pub src_low: u32,
    /// Source address, high dword.
    pub src_high: u32,
    /// Destination address, low dword.
    pub dst_low: u32,
    /// Destination address, high dword.
    pub dst_high: u32,
    /// Size and id.
    pub control: DescriptorControl,
    /// Must be zero.
    pub reserved: [u32; 3],
}

impl Descriptor {
    /// Builds a descriptor moving `byte_count` bytes from `src` to `dst`.
    pub fn new(src: u64, dst: u64, byte_count: u32, id: u8) -> Self {
        Self {
            src_low: src as u32,
            src_high: (src >> 32) as u32,
            dst_low: dst as u32,
            dst_high: (dst >> 32) as u32,
            control: DescriptorControl::new()
                .with_size_dwords(byte_count / 4)
                .with_id(id),
            reserved: [0; 3],
        }
    }

    /// The source address.
    pub fn src(&self) -> u64 {
        (u64::from(self.src_high) << 32) | u64::from(self.src_low)
    }

    /// The destination address.
    pub fn dst(&self) -> u64 {
        (u64::from(self.dst_high) << 32) | u64::from(self.dst_low)
    }

    /// The transfer size in bytes.
    pub fn byte_count(&self) -> usize {
        self.control.size_dwords() as usize * 4
    }
}

/// The table shared with the controller: status dwords first, then the
/// descriptors they report on.
#[repr(C)]
#[derive(Debug, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct DescriptorTable {
    /// One status dword per descriptor.
    pub status: [DescriptorStatus; MAX_DESCRIPTORS],
    /// The descriptors.
    pub descriptors: [Descriptor; MAX_DESCRIPTORS],
}

const_assert_eq!(size_of::<Descriptor>(), 32);
const_assert_eq!(size_of::<DescriptorTable>(), 4608);

/// Byte offset of the status dword of descriptor `index`.
pub const fn status_offset(index: usize) -> usize {
    offset_of!(DescriptorTable, status) + index * size_of::<DescriptorStatus>()
}

/// Byte offset of descriptor `index`.
pub const fn descriptor_offset(index: usize) -> usize {
    offset_of!(DescriptorTable, descriptors) + index * size_of::<Descriptor>()
}
