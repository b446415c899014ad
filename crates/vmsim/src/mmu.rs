//! Address translation.
//!
//! [`translate`] models the MMU: it consults the address space's translation cache and
//! falls back to a page table walk on a miss. It never repairs anything; faults are
//! reported to the caller. [`resolve`] wraps it in the fault-and-retry loop that hands
//! each fault to the [`FaultHandler`].

use core::fmt;

use crate::config::MAX_FAULT_RETRIES;
use crate::page_table::PageFlags;
use crate::{AddressSpace, FaultHandler, PhysicalAddress, VirtualAddress, VmError};

/// The kind of memory access being translated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessType {
    Read,
    Write,
    Execute,
}

impl AccessType {
    pub const fn is_write(self) -> bool {
        matches!(self, Self::Write)
    }
}

impl fmt::Display for AccessType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Execute => "execute",
        })
    }
}

/// A translation failure, handed to the fault handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// No entry maps the page.
    NotPresent,
    /// The entry's permissions forbid the access.
    ProtectionViolation,
    /// A write hit a copy-on-write entry.
    CowWrite,
}

/// Checks an access against an entry's flags.
pub fn check_access(flags: PageFlags, access: AccessType) -> Result<(), Fault> {
    if !flags.permissions().allows(access) {
        return Err(Fault::ProtectionViolation);
    }
    if access.is_write() && flags.is_copy_on_write() {
        return Err(Fault::CowWrite);
    }
    Ok(())
}

/// Translates a virtual address in `space` without handling faults.
///
/// A cache hit is checked against the cached copy of the entry's flags, which the page
/// table keeps identical to the entry itself. A protection violation on a hit is reported
/// directly. A write through a clean or copy-on-write cached entry takes the table walk so
/// the dirty bit gets set or the copy-on-write fault raised.
pub fn translate(
    space: &AddressSpace,
    address: VirtualAddress,
    access: AccessType,
) -> Result<PhysicalAddress, Fault> {
    let page = address.page_number();
    let offset = address.page_offset();

    let cached = space.tlb().lock().lookup(space.id(), page);
    if let Some(cached) = cached {
        match check_access(cached.flags(), access) {
            Err(Fault::ProtectionViolation) => return Err(Fault::ProtectionViolation),
            Ok(()) if !access.is_write() || cached.flags().is_dirty() => {
                return Ok(cached.frame().start() + offset);
            }
            _ => {}
        }
    }

    let mut state = space.state_mut();
    space.record_walk();

    let entry = state.table.lookup(page).map_err(|_| Fault::NotPresent)?;
    check_access(entry.flags(), access)?;
    let entry = state
        .table
        .record_access(page, access.is_write())
        .map_err(|_| Fault::NotPresent)?;

    let physical = entry.frame().start() + offset;
    log::trace!("{}: {access} {address} -> {physical}", space.id());
    Ok(physical)
}

/// Translates an address, handing faults to `handler` and retrying after each repair.
///
/// Fatal faults are returned as [`VmError::SegmentationFault`] or
/// [`VmError::ProtectionViolation`]; the handler has already marked the address space
/// terminated by then.
pub fn resolve(
    space: &AddressSpace,
    handler: &FaultHandler<'_>,
    address: VirtualAddress,
    access: AccessType,
) -> Result<PhysicalAddress, VmError> {
    let mut repairs = 0;
    loop {
        let fault = match translate(space, address, access) {
            Ok(physical) => return Ok(physical),
            Err(fault) => fault,
        };

        if repairs == MAX_FAULT_RETRIES {
            log::error!(
                "{}: {access} {address} still faulting ({fault:?}) after {repairs} repairs",
                space.id()
            );
            space.mark_terminated();
            return Err(VmError::SegmentationFault);
        }

        handler.handle(space, address, access, fault)?;
        repairs += 1;
    }
}
