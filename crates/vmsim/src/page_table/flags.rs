//! Page permissions and page table entry flags.

use core::{fmt, ops::BitOr};

use crate::AccessType;

/// A set of access permissions for a mapping.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Permissions(u8);

impl Permissions {
    pub const NONE: Self = Self(0);
    pub const READ: Self = Self(1 << 0);
    pub const WRITE: Self = Self(1 << 1);
    pub const EXECUTE: Self = Self(1 << 2);
    pub const READ_WRITE: Self = Self(Self::READ.0 | Self::WRITE.0);
    pub const READ_EXECUTE: Self = Self(Self::READ.0 | Self::EXECUTE.0);

    const MASK: u8 = 0b111;

    /// Returns true if every permission in `other` is also in `self`.
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns true if these permissions allow the given access.
    pub const fn allows(self, access: AccessType) -> bool {
        match access {
            AccessType::Read => self.contains(Self::READ),
            AccessType::Write => self.contains(Self::WRITE),
            AccessType::Execute => self.contains(Self::EXECUTE),
        }
    }

    pub const fn is_writable(self) -> bool {
        self.contains(Self::WRITE)
    }
}

impl BitOr for Permissions {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Debug for Permissions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Permissions({self})")
    }
}

/// Formats as the familiar `rwx` triple.
impl fmt::Display for Permissions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let r = if self.contains(Self::READ) { 'r' } else { '-' };
        let w = if self.contains(Self::WRITE) { 'w' } else { '-' };
        let x = if self.contains(Self::EXECUTE) { 'x' } else { '-' };
        write!(f, "{r}{w}{x}")
    }
}

/// Page table entry flags.
///
/// The low three bits hold the entry's [`Permissions`]; the remaining bits track
/// presence, copy-on-write, explicit sharing, and the hardware-style accessed/dirty bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PageFlags(u8);

impl PageFlags {
    /// Present bit (bit 3).
    const PRESENT: u8 = 1 << 3;

    /// Copy-on-write bit (bit 4). Writes fault until the page is made private.
    const COPY_ON_WRITE: u8 = 1 << 4;

    /// Dirty bit (bit 5). Set by the first write translated through this entry.
    const DIRTY: u8 = 1 << 5;

    /// Accessed bit (bit 6). Set by any translation through this entry.
    const ACCESSED: u8 = 1 << 6;

    /// Shared bit (bit 7). The frame is explicitly shared between address spaces.
    const SHARED: u8 = 1 << 7;

    /// Creates present flags carrying the given permissions.
    pub const fn present(permissions: Permissions) -> Self {
        Self((permissions.0 & Permissions::MASK) | Self::PRESENT)
    }

    /// Returns the permission bits.
    pub const fn permissions(self) -> Permissions {
        Permissions(self.0 & Permissions::MASK)
    }

    pub const fn is_present(self) -> bool {
        (self.0 & Self::PRESENT) != 0
    }

    pub const fn is_copy_on_write(self) -> bool {
        (self.0 & Self::COPY_ON_WRITE) != 0
    }

    pub fn set_copy_on_write(&mut self, cow: bool) {
        self.set_bit(Self::COPY_ON_WRITE, cow);
    }

    pub const fn is_dirty(self) -> bool {
        (self.0 & Self::DIRTY) != 0
    }

    pub fn set_dirty(&mut self, dirty: bool) {
        self.set_bit(Self::DIRTY, dirty);
    }

    pub const fn is_accessed(self) -> bool {
        (self.0 & Self::ACCESSED) != 0
    }

    pub fn set_accessed(&mut self, accessed: bool) {
        self.set_bit(Self::ACCESSED, accessed);
    }

    pub const fn is_shared(self) -> bool {
        (self.0 & Self::SHARED) != 0
    }

    pub fn set_shared(&mut self, shared: bool) {
        self.set_bit(Self::SHARED, shared);
    }

    /// Returns whether a write through this entry would succeed without a fault.
    pub const fn is_writable(self) -> bool {
        self.permissions().is_writable() && !self.is_copy_on_write()
    }

    fn set_bit(&mut self, bit: u8, value: bool) {
        if value {
            self.0 |= bit;
        } else {
            self.0 &= !bit;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod permissions {
        use super::*;

        #[test]
        fn allows_matches_bits() {
            let rw = Permissions::READ_WRITE;
            assert!(rw.allows(AccessType::Read));
            assert!(rw.allows(AccessType::Write));
            assert!(!rw.allows(AccessType::Execute));
            assert!(!Permissions::NONE.allows(AccessType::Read));
        }

        #[test]
        fn contains_and_union() {
            let rx = Permissions::READ | Permissions::EXECUTE;
            assert_eq!(rx, Permissions::READ_EXECUTE);
            assert!(Permissions::READ_WRITE.contains(Permissions::READ));
            assert!(!Permissions::READ.contains(Permissions::READ_WRITE));
        }

        #[test]
        fn display() {
            assert_eq!(Permissions::READ_WRITE.to_string(), "rw-");
            assert_eq!(Permissions::READ_EXECUTE.to_string(), "r-x");
            assert_eq!(Permissions::NONE.to_string(), "---");
        }
    }

    mod page_flags {
        use super::*;

        #[test]
        fn present_keeps_permissions() {
            let flags = PageFlags::present(Permissions::READ_WRITE);
            assert!(flags.is_present());
            assert_eq!(flags.permissions(), Permissions::READ_WRITE);
            assert!(!flags.is_copy_on_write());
        }

        #[test]
        fn copy_on_write_blocks_writes() {
            let mut flags = PageFlags::present(Permissions::READ_WRITE);
            assert!(flags.is_writable());
            flags.set_copy_on_write(true);
            assert!(!flags.is_writable());
            assert_eq!(flags.permissions(), Permissions::READ_WRITE);
        }

        #[test]
        fn bits_are_independent() {
            let mut flags = PageFlags::present(Permissions::READ);
            flags.set_dirty(true);
            flags.set_accessed(true);
            flags.set_shared(true);
            flags.set_accessed(false);

            assert!(flags.is_dirty());
            assert!(!flags.is_accessed());
            assert!(flags.is_shared());
            assert_eq!(flags.permissions(), Permissions::READ);
        }
    }
}
