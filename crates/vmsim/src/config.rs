//! Simulator-wide constants and runtime configuration.

use crate::VirtualAddress;

/// Number of bits in a page offset (4 KiB pages).
pub const PAGE_SHIFT: usize = 12;

/// Page size in bytes.
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// Maximum number of bits in a user virtual address.
pub const MAX_VIRTUAL_BITS: usize = 47;

/// Highest valid user virtual address (inclusive).
pub const USER_ADDRESS_LIMIT: usize = (1 << MAX_VIRTUAL_BITS) - 1;

/// Number of times an access is retried after a repaired fault before giving up.
///
/// A single access can take at most two repairs (demand allocation followed by a
/// copy-on-write break), so anything beyond this indicates a handler bug.
pub const MAX_FAULT_RETRIES: usize = 3;

/// Runtime configuration for a [`ProcessManager`](crate::ProcessManager).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimulatorConfig {
    /// Number of physical frames in the simulated machine.
    pub frame_count: usize,
    /// Number of entries in each address space's translation cache.
    pub tlb_capacity: usize,
    /// Address just above the first thread stack; stacks grow down from here.
    pub stack_top: VirtualAddress,
    /// Unmapped pages left between consecutive thread stacks.
    pub stack_guard_pages: usize,
}

impl SimulatorConfig {
    pub const DEFAULT_FRAME_COUNT: usize = 1024;
    pub const DEFAULT_TLB_CAPACITY: usize = 64;
    pub const DEFAULT_STACK_TOP: usize = 0x7FFF_FFFF_F000;

    /// Creates the default configuration.
    pub const fn new() -> Self {
        Self {
            frame_count: Self::DEFAULT_FRAME_COUNT,
            tlb_capacity: Self::DEFAULT_TLB_CAPACITY,
            stack_top: VirtualAddress::new(Self::DEFAULT_STACK_TOP),
            stack_guard_pages: 1,
        }
    }

    pub const fn with_frame_count(mut self, frame_count: usize) -> Self {
        self.frame_count = frame_count;
        self
    }

    /// Sets the translation cache capacity.
    ///
    /// # Panics
    /// Panics if `tlb_capacity` is zero.
    pub const fn with_tlb_capacity(mut self, tlb_capacity: usize) -> Self {
        assert!(tlb_capacity > 0, "translation cache needs at least one entry");
        self.tlb_capacity = tlb_capacity;
        self
    }

    /// Sets the top of the thread stack area.
    ///
    /// # Panics
    /// Panics if `stack_top` is not page-aligned.
    pub const fn with_stack_top(mut self, stack_top: VirtualAddress) -> Self {
        assert!(
            stack_top.is_aligned(PAGE_SIZE),
            "stack top must be page-aligned"
        );
        self.stack_top = stack_top;
        self
    }

    pub const fn with_stack_guard_pages(mut self, pages: usize) -> Self {
        self.stack_guard_pages = pages;
        self
    }
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self::new()
    }
}
