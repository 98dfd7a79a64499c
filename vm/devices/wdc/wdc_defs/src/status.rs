// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Driver status codes.

use std::fmt;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// A status code returned by the driver or the WDC library.
///
/// Codes that are not known to this crate are carried through unchanged.
#[repr(transparent)]
#[derive(Copy, Clone, PartialEq, Eq, Hash, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct WdStatus(pub u32);

macro_rules! status_codes {
    ($($(#[$attr:meta])* $name:ident = $value:literal => $description:literal,)*) => {
        impl WdStatus {
            $(
                $(#[$attr])*
                pub const $name: Self = Self($value);
            )*

            /// Returns the name of the status code, if known.
            pub const fn name(&self) -> Option<&'static str> {
                match self.0 {
                    $($value => Some(stringify!($name)),)*
                    _ => None,
                }
            }

            /// Returns a human readable description of the status code.
            pub const fn description(&self) -> &'static str {
                match self.0 {
                    $($value => $description,)*
                    _ => "Unrecognized error code",
                }
            }
        }
    };
}

status_codes! {
    /// The operation completed successfully.
    SUCCESS = 0x0 => "Success",
    /// Generic driver failure.
    WINDRIVER_STATUS_ERROR = 0x2000_0000 => "Error",
    /// The handle is not recognized by the driver.
    INVALID_HANDLE = 0x2000_0001 => "Invalid handle",
    /// Not enough memory or descriptors to satisfy the request.
    INSUFFICIENT_RESOURCES = 0x2000_0005 => "Insufficient resources",
    /// The driver does not implement the request.
    NOT_IMPLEMENTED = 0x2000_000a => "Function not implemented",
    /// The operation was already performed.
    OPERATION_ALREADY_DONE = 0x2000_0011 => "Operation already done",
    /// A wait for the device timed out.
    TIME_OUT_EXPIRED = 0x2000_0015 => "Timeout expired",
    /// A parameter is invalid or the option combination is not supported.
    INVALID_PARAMETER = 0x2000_001b => "Invalid parameter",
    /// The operation failed.
    OPERATION_FAILED = 0x2000_0020 => "Operation failed",
    /// The transfer is not finished; program the next chunk and continue.
    MORE_PROCESSING_REQUIRED = 0xc000_0016 => "More processing required",
}

impl WdStatus {
    /// Returns true for [`WdStatus::SUCCESS`].
    pub const fn is_success(&self) -> bool {
        self.0 == Self::SUCCESS.0
    }
}

impl fmt::Debug for WdStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => write!(f, "WdStatus({:#x})", self.0),
        }
    }
}

impl fmt::Display for WdStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x} - {}", self.0, self.description())
    }
}

impl From<WdStatus> for u32 {
    fn from(status: WdStatus) -> Self {
        status.0
    }
}
