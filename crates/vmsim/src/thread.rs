//! Thread records.
//!
//! Threads carry no execution state. A thread only owns a private stack range inside the
//! address space it belongs to; heap and global mappings are shared through that address
//! space. The address space is referenced by id, never owned.

use core::fmt;

use crate::{AddressSpaceId, VirtualAddress};

/// Identifies a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct ThreadId(usize);

impl ThreadId {
    pub const fn new(id: usize) -> Self {
        Self(id)
    }

    pub const fn as_usize(self) -> usize {
        self.0
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Thread {
    id: ThreadId,
    space: AddressSpaceId,
    stack_base: VirtualAddress,
    stack_size: usize,
}

impl Thread {
    pub const fn new(
        id: ThreadId,
        space: AddressSpaceId,
        stack_base: VirtualAddress,
        stack_size: usize,
    ) -> Self {
        Self {
            id,
            space,
            stack_base,
            stack_size,
        }
    }

    pub const fn id(&self) -> ThreadId {
        self.id
    }

    /// Returns the address space this thread runs in.
    pub const fn space(&self) -> AddressSpaceId {
        self.space
    }

    /// Lowest address of the stack.
    pub const fn stack_base(&self) -> VirtualAddress {
        self.stack_base
    }

    /// First address above the stack; the initial stack pointer.
    pub fn stack_top(&self) -> VirtualAddress {
        self.stack_base + self.stack_size
    }

    pub const fn stack_size(&self) -> usize {
        self.stack_size
    }

    pub fn stack_contains(&self, addr: VirtualAddress) -> bool {
        addr >= self.stack_base && addr < self.stack_top()
    }
}
