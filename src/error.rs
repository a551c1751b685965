// Copyright © 2022 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

use core::fmt;

use crate::memory::Pfn;

/// Errors surfaced by the physical-memory layer.
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum MmError {
    /// No free page could be produced for the request.
    OutOfMemory,
    /// The PFN is outside the zone span or falls into a memory hole.
    InvalidPfn { pfn: Pfn },
    /// The PFN does not have the alignment the operation requires.
    Unaligned { pfn: Pfn },
}

pub type MmResult<T> = Result<T, MmError>;

impl fmt::Display for MmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MmError::OutOfMemory => write!(f, "Ran out of free pages for the request"),
            MmError::InvalidPfn { pfn } => {
                write!(f, "PFN {:#x} is not backed by valid memory", pfn)
            }
            MmError::Unaligned { pfn } => write!(f, "PFN {:#x} is not suitably aligned", pfn),
        }
    }
}
