#![cfg_attr(not(test), no_std)]

//! # vmsim
//!
//! A software model of a virtual-memory subsystem. It provides:
//!
//! - A reference-counted physical frame allocator backed by simulated memory.
//! - Per-process page tables with present, copy-on-write, dirty, accessed and shared bits.
//! - A bounded, address-space-tagged translation cache with LRU eviction.
//! - An MMU that translates accesses and a fault handler that repairs demand-allocation
//!   and copy-on-write faults.
//! - A process manager with fork, threads with private stacks, and explicit shared memory.
//!
//! Nothing executes instructions; every access is requested through the
//! [`ProcessManager`].

extern crate alloc;

mod address;
mod address_space;
mod config;
mod error;
mod fault;
mod frame;
mod frame_allocator;
mod human_size;
mod mmu;
mod numbers;
mod page_table;
mod process_manager;
mod shared_memory;
mod thread;
mod translation_cache;

#[cfg(test)]
mod test_logger;

pub use address::{PhysicalAddress, VirtualAddress};
pub use address_space::{
    AddressSpace, AddressSpaceId, AddressSpaceState, Region, RegionKind, TranslationStats,
};
pub use config::{
    MAX_FAULT_RETRIES, MAX_VIRTUAL_BITS, PAGE_SHIFT, PAGE_SIZE, SimulatorConfig,
    USER_ADDRESS_LIMIT,
};
pub use error::{AccountingError, VmError};
pub use fault::{FaultHandler, Repair};
pub use frame::{Frame, FrameFlag, FrameFlags};
pub use frame_allocator::FrameAllocator;
pub use human_size::HumanSize;
pub use mmu::{AccessType, Fault, check_access, resolve, translate};
pub use numbers::{FrameNumber, PageNumber};
pub use page_table::{NotMapped, PageFlags, PageTable, PageTableEntry, Permissions};
pub use process_manager::ProcessManager;
pub use shared_memory::{ShareKind, SharedMemoryRegistry, SharedRegion};
pub use thread::{Thread, ThreadId};
pub use translation_cache::{CacheStats, TlbEntry, TranslationCache};
