//! Address types for simulated physical and virtual memory.
//!
//! Both types are thin newtypes over `usize`. Virtual addresses are restricted to the
//! user half of a 47-bit address space; physical addresses index the simulated frame
//! pool and are bounds-checked by the [`FrameAllocator`](crate::FrameAllocator).

use core::fmt;
use core::ops::{Add, Sub};

use crate::config::{PAGE_SIZE, USER_ADDRESS_LIMIT};
use crate::{FrameNumber, PageNumber};

/// Macro to define common address type functionality.
macro_rules! impl_address_common {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[repr(transparent)]
        pub struct $name(usize);

        impl $name {
            /// Returns the raw address value.
            #[inline]
            pub const fn as_usize(self) -> usize {
                self.0
            }

            /// Checks if the address is aligned to the given alignment.
            ///
            /// # Panics
            ///
            /// Panics if `align` is not a power of two.
            #[inline]
            pub const fn is_aligned(self, align: usize) -> bool {
                assert!(align.is_power_of_two(), "alignment must be a power of two");
                self.0 & (align - 1) == 0
            }

            /// Aligns the address down to the given alignment.
            ///
            /// # Panics
            ///
            /// Panics if `align` is not a power of two.
            #[inline]
            pub const fn align_down(self, align: usize) -> Self {
                assert!(align.is_power_of_two(), "alignment must be a power of two");
                Self(self.0 & !(align - 1))
            }

            /// Returns the offset of this address within its page.
            #[inline]
            pub const fn page_offset(self) -> usize {
                self.0 & (PAGE_SIZE - 1)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({:#x})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:#x}", self.0)
            }
        }

        impl From<usize> for $name {
            #[inline]
            fn from(addr: usize) -> Self {
                Self::new(addr)
            }
        }

        impl Add<usize> for $name {
            type Output = Self;

            #[inline]
            fn add(self, rhs: usize) -> Self::Output {
                Self::new(self.0 + rhs)
            }
        }

        impl Sub<usize> for $name {
            type Output = Self;

            #[inline]
            fn sub(self, rhs: usize) -> Self::Output {
                Self::new(self.0 - rhs)
            }
        }

        impl Sub<$name> for $name {
            type Output = usize;

            #[inline]
            fn sub(self, rhs: $name) -> Self::Output {
                self.0 - rhs.0
            }
        }
    };
}

impl_address_common!(
    PhysicalAddress,
    "A simulated physical memory address.\n\n\
     Physical addresses are `frame * PAGE_SIZE + offset` inside the simulated frame pool."
);

impl PhysicalAddress {
    /// Creates a new physical address.
    #[inline]
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    /// Returns the frame containing this address.
    #[inline]
    pub const fn frame_number(self) -> FrameNumber {
        FrameNumber::new(self.0 / PAGE_SIZE)
    }
}

impl_address_common!(
    VirtualAddress,
    "A user virtual address.\n\n\
     Valid virtual addresses lie in `0..=USER_ADDRESS_LIMIT`."
);

impl VirtualAddress {
    /// Creates a new virtual address.
    ///
    /// # Panics
    ///
    /// Panics if the address is above the user address limit.
    #[inline]
    pub const fn new(addr: usize) -> Self {
        assert!(
            addr <= USER_ADDRESS_LIMIT,
            "address is not a valid user address"
        );
        Self(addr)
    }

    /// Creates a new virtual address, returning `None` if it is out of range.
    #[inline]
    pub const fn try_new(addr: usize) -> Option<Self> {
        if addr <= USER_ADDRESS_LIMIT {
            Some(Self(addr))
        } else {
            None
        }
    }

    /// Adds `rhs` bytes, returning `None` on overflow or when leaving user space.
    #[inline]
    pub const fn checked_add(self, rhs: usize) -> Option<Self> {
        match self.0.checked_add(rhs) {
            Some(addr) => Self::try_new(addr),
            None => None,
        }
    }

    /// Returns the page containing this address.
    #[inline]
    pub const fn page_number(self) -> PageNumber {
        PageNumber::new(self.0 / PAGE_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod physical_address {
        use super::*;

        #[test]
        fn frame_number_truncates_offset() {
            let addr = PhysicalAddress::new(PAGE_SIZE * 3 + 10);
            assert_eq!(addr.frame_number(), FrameNumber::new(3));
            assert_eq!(addr.page_offset(), 10);
        }

        #[test]
        fn alignment_check() {
            let addr = PhysicalAddress::new(PAGE_SIZE * 4);
            assert!(addr.is_aligned(PAGE_SIZE));
            assert!(addr.is_aligned(1));
            assert!(!addr.is_aligned(PAGE_SIZE * 8));
        }

        #[test]
        fn align_down() {
            let addr = PhysicalAddress::new(0x1234);
            assert_eq!(addr.align_down(PAGE_SIZE), PhysicalAddress::new(0x1000));
        }

        #[test]
        #[should_panic(expected = "alignment must be a power of two")]
        fn align_non_power_of_two() {
            PhysicalAddress::new(0x1000).is_aligned(3);
        }

        #[test]
        fn operators() {
            let addr = PhysicalAddress::new(0x1000);
            assert_eq!((addr + 0x50).as_usize(), 0x1050);
            assert_eq!((addr - 0x50).as_usize(), 0x0FB0);
            assert_eq!(PhysicalAddress::new(0x1050) - addr, 0x50);
        }

        #[test]
        fn formatting() {
            let addr = PhysicalAddress::new(0x1000);
            assert_eq!(format!("{:?}", addr), "PhysicalAddress(0x1000)");
            assert_eq!(format!("{}", addr), "0x1000");
        }
    }

    mod virtual_address {
        use super::*;

        #[test]
        fn accepts_highest_user_address() {
            let addr = VirtualAddress::new(USER_ADDRESS_LIMIT);
            assert_eq!(addr.as_usize(), 0x7FFF_FFFF_FFFF);
        }

        #[test]
        #[should_panic(expected = "address is not a valid user address")]
        fn rejects_kernel_half() {
            VirtualAddress::new(USER_ADDRESS_LIMIT + 1);
        }

        #[test]
        fn try_new_bounds() {
            assert!(VirtualAddress::try_new(0).is_some());
            assert!(VirtualAddress::try_new(USER_ADDRESS_LIMIT + 1).is_none());
        }

        #[test]
        fn checked_add_leaving_user_space() {
            let addr = VirtualAddress::new(USER_ADDRESS_LIMIT);
            assert_eq!(addr.checked_add(0), Some(addr));
            assert_eq!(addr.checked_add(1), None);
            assert_eq!(VirtualAddress::new(0x1000).checked_add(usize::MAX), None);
        }

        #[test]
        fn page_number_and_offset() {
            let addr = VirtualAddress::new(0x5123);
            assert_eq!(addr.page_number(), PageNumber::new(5));
            assert_eq!(addr.page_offset(), 0x123);
        }

        #[test]
        fn page_offset_at_boundary() {
            let addr = VirtualAddress::new(PAGE_SIZE);
            assert_eq!(addr.page_offset(), 0);
        }
    }
}
