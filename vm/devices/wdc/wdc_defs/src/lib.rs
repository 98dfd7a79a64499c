// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Definitions shared between the WDC DMA library and the privileged driver
//! service: DMA option bits, page descriptors, handles and status codes.
//!
//! Layouts in this crate match the driver's ABI. Nothing here talks to the
//! driver.

#![forbid(unsafe_code)]

mod status;

pub use status::WdStatus;

use bitfield_struct::bitfield;
use static_assertions::const_assert_eq;
use std::fmt;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// The page size assumed when the caller does not configure one.
pub const PAGE_SIZE: usize = 4096;
/// [`PAGE_SIZE`] as a `u64`.
pub const PAGE_SIZE64: u64 = PAGE_SIZE as u64;

/// Number of page descriptors that fit in the driver's fixed-size DMA
/// record. Larger buffers must set [`DmaOptions::large_buffer`].
pub const INLINE_SEGMENT_CAPACITY: usize = 256;

/// Option bits passed to every DMA lock and transaction request.
#[bitfield(u32)]
#[derive(PartialEq, Eq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct DmaOptions {
    /// The driver allocates a physically contiguous kernel buffer. When
    /// clear, the caller's memory is locked as a scatter/gather list.
    pub kernel_buffer_alloc: bool,
    /// Allocate the contiguous buffer below 16MB.
    pub kbuf_below_16m: bool,
    /// The page descriptor array extends past [`INLINE_SEGMENT_CAPACITY`].
    pub large_buffer: bool,
    /// Map the buffer cached. Requires explicit cache synchronization.
    pub allow_cache: bool,
    /// Only map the buffer into kernel space.
    pub kernel_only_map: bool,
    /// The device writes into the buffer.
    pub from_device: bool,
    /// The device reads from the buffer.
    pub to_device: bool,
    /// Physical addresses may be above 4GB.
    pub allow_64bit_address: bool,
    /// The request is not associated with a card.
    pub allow_no_hcard: bool,
    /// Attach to a contiguous buffer allocated by another process.
    pub get_existing_buf: bool,
    /// The buffer lives in reserved physical memory supplied by the caller.
    pub reserved_mem: bool,
    /// [`Self::address_width`] constrains the contiguous allocation.
    pub kbuf_alloc_specify_address_width: bool,
    /// Only satisfy the allocation from buffers preallocated at boot.
    pub get_preallocated_buffers_only: bool,
    /// The buffer backs a multi-phase DMA transaction.
    pub transaction: bool,
    /// The buffer is GPU memory.
    pub gpudirect: bool,
    /// Report every page as its own descriptor, even when physically
    /// adjacent pages could be merged.
    pub disable_merge_adjacent_pages: bool,
    #[bits(8)]
    _reserved: u8,
    /// Device address width in bits, honored when
    /// [`Self::kbuf_alloc_specify_address_width`] is set.
    #[bits(7)]
    pub address_width: u8,
    #[bits(1)]
    _reserved2: u8,
}

impl DmaOptions {
    /// Bits that have no defined meaning and must be zero.
    pub const RESERVED_MASK: u32 = 0x80ff_0000;

    /// Returns the reserved bits that are set, if any.
    pub const fn reserved_bits(&self) -> u32 {
        self.into_bits() & Self::RESERVED_MASK
    }

    /// Returns the transfer direction encoded in the option bits.
    pub const fn direction(&self) -> DmaDirection {
        match (self.from_device(), self.to_device()) {
            (false, false) => DmaDirection::None,
            (true, false) => DmaDirection::FromDevice,
            (false, true) => DmaDirection::ToDevice,
            (true, true) => DmaDirection::Bidirectional,
        }
    }

    /// Returns a copy of these options with the direction bits replaced.
    pub const fn with_direction(self, direction: DmaDirection) -> Self {
        let (from, to) = match direction {
            DmaDirection::None => (false, false),
            DmaDirection::FromDevice => (true, false),
            DmaDirection::ToDevice => (false, true),
            DmaDirection::Bidirectional => (true, true),
        };
        self.with_from_device(from).with_to_device(to)
    }
}

/// The direction bits of [`DmaOptions`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DmaDirection {
    /// No direction specified.
    None,
    /// Device to host.
    FromDevice,
    /// Host to device.
    ToDevice,
    /// Both directions.
    Bidirectional,
}

/// One physically contiguous piece of a locked buffer.
///
/// Segments of a buffer are stored in ascending logical-offset order and
/// together cover the whole locked range.
#[repr(C)]
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct PhysicalSegment {
    /// Physical (bus) address of the first byte.
    pub physical_address: u64,
    /// Length of the segment in bytes.
    pub byte_count: u32,
    /// Must be zero.
    pub reserved: u32,
}

const_assert_eq!(size_of::<PhysicalSegment>(), 16);

impl PhysicalSegment {
    /// Creates a segment.
    pub const fn new(physical_address: u64, byte_count: u32) -> Self {
        Self {
            physical_address,
            byte_count,
            reserved: 0,
        }
    }

    /// The physical address one past the last byte.
    pub const fn end(&self) -> u64 {
        self.physical_address + self.byte_count as u64
    }
}

macro_rules! handle_type {
    ($(#[$attr:meta])* $name:ident) => {
        $(#[$attr])*
        #[repr(transparent)]
        #[derive(Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(pub u32);

        impl $name {
            /// The null handle.
            pub const NONE: Self = Self(0);

            /// Returns true if this is the null handle.
            pub const fn is_none(&self) -> bool {
                self.0 == 0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({:#x})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:#x}", self.0)
            }
        }
    };
}

handle_type! {
    /// Identifies an opened card to the driver.
    CardHandle
}

handle_type! {
    /// A system-wide name for a contiguous DMA buffer that other processes
    /// can attach to.
    GlobalHandle
}

handle_type! {
    /// The driver's handle for one pinned buffer or transaction.
    BufferToken
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_with_tracing::test;

    #[test]
    fn option_bit_positions() {
        let check = |opts: DmaOptions, bits: u32| assert_eq!(opts.into_bits(), bits, "{opts:?}");
        check(DmaOptions::new().with_kernel_buffer_alloc(true), 0x1);
        check(DmaOptions::new().with_large_buffer(true), 0x4);
        check(DmaOptions::new().with_allow_cache(true), 0x8);
        check(
            DmaOptions::new().with_direction(DmaDirection::Bidirectional),
            0x60,
        );
        check(DmaOptions::new().with_get_existing_buf(true), 0x200);
        check(DmaOptions::new().with_reserved_mem(true), 0x400);
        check(DmaOptions::new().with_transaction(true), 0x2000);
        check(
            DmaOptions::new().with_disable_merge_adjacent_pages(true),
            0x8000,
        );
        check(DmaOptions::new().with_address_width(0x7f), 0x7f00_0000);
    }

    #[test]
    fn reserved_bits_are_reported() {
        assert_eq!(DmaOptions::new().reserved_bits(), 0);
        assert_eq!(DmaOptions::from(0x0001_0020).reserved_bits(), 0x0001_0000);
        assert_eq!(DmaOptions::from(0x8000_0000).reserved_bits(), 0x8000_0000);
    }

    #[test]
    fn direction_round_trips_through_bits() {
        for direction in [
            DmaDirection::None,
            DmaDirection::FromDevice,
            DmaDirection::ToDevice,
            DmaDirection::Bidirectional,
        ] {
            let opts = DmaOptions::new()
                .with_allow_cache(true)
                .with_direction(direction);
            assert_eq!(opts.direction(), direction);
            assert!(opts.allow_cache());
        }
    }

    #[test]
    fn segment_layout() {
        let segment = PhysicalSegment::new(0x1_2345_6000, 0x800);
        assert_eq!(segment.end(), 0x1_2345_6800);
        assert_eq!(
            segment.as_bytes(),
            [0x00, 0x60, 0x45, 0x23, 0x01, 0, 0, 0, 0x00, 0x08, 0, 0, 0, 0, 0, 0]
        );
    }

    #[test]
    fn handle_formatting() {
        assert!(GlobalHandle::NONE.is_none());
        assert!(!BufferToken(3).is_none());
        assert_eq!(format!("{:?}", CardHandle(0x10)), "CardHandle(0x10)");
        assert_eq!(BufferToken(0x2a).to_string(), "0x2a");
    }
}
