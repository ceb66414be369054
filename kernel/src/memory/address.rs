// =============================================================================
// ShardMem — Physical Addresses
// =============================================================================
//
// Confusing a page address with an arbitrary integer is how allocators end up
// freeing half a page. `PhysAddr` is a newtype so that the page allocator's
// interface only ever deals in addresses, and rounding/alignment checks have
// one home.
//
// The kernel core assumes physical memory is directly mapped: the address of
// a page is also a pointer the kernel can dereference.
//
// =============================================================================

use core::fmt;

use crate::param::PGSIZE;

const PAGE_MASK: u64 = PGSIZE as u64 - 1;

/// A physical memory address.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct PhysAddr(u64);

impl PhysAddr {
    #[inline]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// The address as a pointer, through the direct map.
    #[inline]
    pub const fn as_ptr<T>(self) -> *const T {
        self.0 as usize as *const T
    }

    #[inline]
    pub const fn as_mut_ptr<T>(self) -> *mut T {
        self.0 as usize as *mut T
    }

    /// Returns true if this address is aligned to a page boundary.
    #[inline]
    pub const fn is_page_aligned(self) -> bool {
        self.0 & PAGE_MASK == 0
    }

    /// Aligns this address down to the nearest page boundary.
    ///
    /// ```
    /// # use shardmem_kernel::memory::PhysAddr;
    /// assert_eq!(PhysAddr::new(0x1234).page_round_down(), PhysAddr::new(0x1000));
    /// assert_eq!(PhysAddr::new(0x1000).page_round_down(), PhysAddr::new(0x1000));
    /// ```
    #[inline]
    pub const fn page_round_down(self) -> Self {
        Self(self.0 & !PAGE_MASK)
    }

    /// Aligns this address up to the nearest page boundary.
    ///
    /// # Panics
    /// Panics if the result does not fit in 64 bits.
    #[inline]
    pub const fn page_round_up(self) -> Self {
        match self.0.checked_add(PAGE_MASK) {
            Some(v) => Self(v & !PAGE_MASK),
            None => panic!("PhysAddr::page_round_up overflow"),
        }
    }
}

// Log lines name pages as `P:0x...`, never as bare integers.
impl fmt::Display for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "P:{:#010X}", self.0)
    }
}

impl fmt::Debug for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl core::ops::Add<u64> for PhysAddr {
    type Output = Self;
    #[inline]
    fn add(self, offset: u64) -> Self {
        Self::new(self.0 + offset)
    }
}

/// Distance in bytes between two physical addresses.
impl core::ops::Sub<PhysAddr> for PhysAddr {
    type Output = u64;
    #[inline]
    fn sub(self, other: PhysAddr) -> u64 {
        self.0 - other.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounding() {
        let pg = PGSIZE as u64;
        assert_eq!(PhysAddr::new(1).page_round_up(), PhysAddr::new(pg));
        assert_eq!(PhysAddr::new(pg).page_round_up(), PhysAddr::new(pg));
        assert_eq!(PhysAddr::new(pg + 1).page_round_down(), PhysAddr::new(pg));
        assert!(PhysAddr::new(3 * pg).is_page_aligned());
        assert!(!PhysAddr::new(3 * pg + 8).is_page_aligned());
    }

    #[test]
    fn arithmetic() {
        let a = PhysAddr::new(0x8000);
        assert_eq!(a + 0x1000, PhysAddr::new(0x9000));
        assert_eq!(PhysAddr::new(0x9000) - a, 0x1000);
        assert_eq!(std::format!("{}", a), "P:0x00008000");
    }
}
