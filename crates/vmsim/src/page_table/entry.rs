//! Page table entry.

use crate::{FrameNumber, PageNumber};

use super::flags::{PageFlags, Permissions};

/// A single page table entry mapping one virtual page to one physical frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageTableEntry {
    page: PageNumber,
    frame: FrameNumber,
    flags: PageFlags,
}

impl PageTableEntry {
    /// Creates a present entry.
    pub const fn new(page: PageNumber, frame: FrameNumber, permissions: Permissions) -> Self {
        Self {
            page,
            frame,
            flags: PageFlags::present(permissions),
        }
    }

    pub const fn page(&self) -> PageNumber {
        self.page
    }

    pub const fn frame(&self) -> FrameNumber {
        self.frame
    }

    pub const fn flags(&self) -> PageFlags {
        self.flags
    }

    pub const fn permissions(&self) -> Permissions {
        self.flags.permissions()
    }

    pub fn flags_mut(&mut self) -> &mut PageFlags {
        &mut self.flags
    }

    pub const fn is_present(&self) -> bool {
        self.flags.is_present()
    }

    pub const fn is_copy_on_write(&self) -> bool {
        self.flags.is_copy_on_write()
    }

    pub const fn is_shared(&self) -> bool {
        self.flags.is_shared()
    }
}
