//! Errors surfaced by the simulator's public operations.

use core::fmt;

use crate::FrameNumber;

/// Errors returned by [`ProcessManager`](crate::ProcessManager) operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    /// The physical frame pool is exhausted.
    OutOfMemory,
    /// The address space or thread does not exist, or has been terminated.
    NotFound,
    /// The requested mapping collides with an existing region.
    Overlap,
    /// The access violated the page's permissions. Fatal to the address space.
    ProtectionViolation,
    /// The access touched an address with no mapping. Fatal to the address space.
    SegmentationFault,
    /// The range is empty, unaligned, or leaves the user address space.
    InvalidRange,
    /// A share asked for more access than the source mapping grants.
    PermissionDenied,
}

impl VmError {
    /// Returns true if this error terminates the address space that caused it.
    pub const fn is_fatal(self) -> bool {
        matches!(self, Self::ProtectionViolation | Self::SegmentationFault)
    }
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let message = match self {
            Self::OutOfMemory => "out of physical memory",
            Self::NotFound => "no such address space or thread",
            Self::Overlap => "region overlaps an existing mapping",
            Self::ProtectionViolation => "protection violation",
            Self::SegmentationFault => "segmentation fault",
            Self::InvalidRange => "invalid address range",
            Self::PermissionDenied => "permissions exceed the source mapping",
        };
        f.write_str(message)
    }
}

impl core::error::Error for VmError {}

/// A frame whose reference count disagrees with the page tables referencing it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccountingError {
    pub frame: FrameNumber,
    /// Number of present page table entries referencing the frame.
    pub expected: usize,
    /// The frame's reference count.
    pub actual: usize,
}

impl fmt::Display for AccountingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} has reference count {} but {} mappings",
            self.frame, self.actual, self.expected
        )
    }
}

impl core::error::Error for AccountingError {}
