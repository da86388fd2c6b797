// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt::{Display, Formatter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// An argument is invalid.
    ///
    /// Example: a misaligned address, a zero or overflowing size, or an offset past the end of the
    /// backing memory object.
    InvalidArgument,
    /// The requested address range is already (partially) occupied by another region.
    AddressInUse,
    /// The system was not able to find enough free virtual address space or allocate a resource
    /// needed for the operation.
    NoMemory,
    /// The caller did not have permission to perform the specified operation.
    ///
    /// Example: unmapping a region that was not created through `mmap` or that has been sealed.
    PermissionDenied,
    /// The address or range falls outside the addressable bounds of the address space.
    Fault,
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::InvalidArgument => write!(f, "An argument is invalid"),
            Error::AddressInUse => write!(
                f,
                "The requested address range is already occupied by another region"
            ),
            Error::NoMemory => write!(
                f,
                "The system was not able to allocate some resource needed for the operation"
            ),
            Error::PermissionDenied => write!(
                f,
                "The caller did not have permission to perform the specified operation"
            ),
            Error::Fault => write!(
                f,
                "The address range lies outside the bounds of the address space"
            ),
        }
    }
}

impl core::error::Error for Error {}
