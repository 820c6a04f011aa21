//! Physical and virtual address, frame, and page types.
//!
//! These are the vocabulary types used across every other crate in the
//! memory management core: the boot memory map and region reserver deal in
//! [`PhysicalAddress`] and [`PhysicalMemoryArea`]; the buddy allocator, slab
//! allocator, and page-metadata table deal in [`Frame`] and [`FrameRange`];
//! the virtual memory manager deals in [`VirtualAddress`] and [`Page`].

#![no_std]

use core::{
    fmt,
    ops::{Deref, RangeInclusive},
};
use derive_more::{Add, AddAssign, Binary, Display, Octal, Sub, SubAssign};

/// Page size in bytes; re-exported here so downstream crates that only
/// depend on `memory_structs` don't additionally need `kernel_config`
/// just to align an address.
pub const PAGE_SIZE: usize = 4096;

/// Rounds `value` up to the nearest multiple of `alignment`, which must be a power of two.
pub const fn align_up(value: usize, alignment: usize) -> usize {
    (value + alignment - 1) & !(alignment - 1)
}

/// Rounds `value` down to the nearest multiple of `alignment`, which must be a power of two.
pub const fn align_down(value: usize, alignment: usize) -> usize {
    value & !(alignment - 1)
}

macro_rules! address_type {
    ($TypeName:ident, $canonicalize:expr) => {
        #[derive(
            Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default,
            Add, AddAssign, Sub, SubAssign, Binary, Octal,
        )]
        #[repr(transparent)]
        pub struct $TypeName(usize);

        impl $TypeName {
            pub const fn zero() -> $TypeName {
                $TypeName(0)
            }

            /// Creates a new address, truncating (rather than rejecting) any bits
            /// above the canonical address width.
            pub const fn new_canonical(addr: usize) -> $TypeName {
                $TypeName(($canonicalize)(addr))
            }

            /// Creates a new address, returning `None` if `addr` is not canonical.
            pub fn new(addr: usize) -> Option<$TypeName> {
                let canonical = Self::new_canonical(addr);
                if canonical.0 == addr {
                    Some(canonical)
                } else {
                    None
                }
            }

            pub const fn value(&self) -> usize {
                self.0
            }

            pub const fn is_aligned(&self, alignment: usize) -> bool {
                self.0 & (alignment - 1) == 0
            }

            pub const fn align_up(&self, alignment: usize) -> $TypeName {
                $TypeName(align_up(self.0, alignment))
            }

            pub const fn align_down(&self, alignment: usize) -> $TypeName {
                $TypeName(align_down(self.0, alignment))
            }

            pub const fn offset_from_alignment(&self, alignment: usize) -> usize {
                self.0 & (alignment - 1)
            }
        }

        impl fmt::Debug for $TypeName {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, concat!(stringify!($TypeName), "({:#X})"), self.0)
            }
        }

        impl fmt::LowerHex for $TypeName {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                fmt::LowerHex::fmt(&self.0, f)
            }
        }
    };
}

/// Physical addresses have no sign-extension concept; only the low 52 bits
/// (the widest physical address width x86_64 defines) are meaningful.
const fn canonicalize_physical(addr: usize) -> usize {
    addr & 0x000F_FFFF_FFFF_FFFF
}

/// Virtual addresses must have bits 48-63 equal to bit 47 (sign-extended).
const fn canonicalize_virtual(addr: usize) -> usize {
    ((addr << 16) as isize >> 16) as usize
}

address_type!(PhysicalAddress, canonicalize_physical);
address_type!(VirtualAddress, canonicalize_virtual);

/// One physical page frame: a page-aligned chunk of physical memory, identified by its page number.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Frame {
    number: usize,
}

/// One virtual page: a page-aligned chunk of virtual address space, identified by its page number.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Page {
    number: usize,
}

macro_rules! page_type {
    ($TypeName:ident, $AddrType:ident) => {
        impl $TypeName {
            pub const fn containing_address(addr: $AddrType) -> $TypeName {
                $TypeName { number: addr.value() / PAGE_SIZE }
            }

            pub const fn start_address(&self) -> $AddrType {
                $AddrType::new_canonical(self.number * PAGE_SIZE)
            }

            pub const fn number(&self) -> usize {
                self.number
            }

            pub const fn from_number(number: usize) -> $TypeName {
                $TypeName { number }
            }
        }

        impl fmt::Debug for $TypeName {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, concat!(stringify!($TypeName), "(c{:#X})"), self.start_address().value())
            }
        }

        impl core::ops::Add<usize> for $TypeName {
            type Output = $TypeName;
            fn add(self, rhs: usize) -> $TypeName {
                $TypeName { number: self.number + rhs }
            }
        }

        impl core::ops::Sub<usize> for $TypeName {
            type Output = $TypeName;
            fn sub(self, rhs: usize) -> $TypeName {
                $TypeName { number: self.number - rhs }
            }
        }
    };
}

page_type!(Frame, PhysicalAddress);
page_type!(Page, VirtualAddress);

macro_rules! range_type {
    ($TypeName:ident, $UnitType:ident, $AddrType:ident) => {
        /// An inclusive range of contiguous pages/frames.
        #[derive(Clone, PartialEq, Eq)]
        pub struct $TypeName(RangeInclusive<$UnitType>);

        impl $TypeName {
            pub const fn new(start: $UnitType, end: $UnitType) -> $TypeName {
                $TypeName(RangeInclusive::new(start, end))
            }

            /// An empty range, with `start` one past `end`, matching the convention
            /// used by [`RangeInclusive`] for empty ranges.
            pub const fn empty() -> $TypeName {
                $TypeName(RangeInclusive::new($UnitType { number: 1 }, $UnitType { number: 0 }))
            }

            pub fn from_addr(start: $AddrType, size_in_bytes: usize) -> $TypeName {
                if size_in_bytes == 0 {
                    return Self::empty();
                }
                let start = $UnitType::containing_address(start);
                let end = $UnitType::containing_address($AddrType::new_canonical(
                    start.start_address().value() + size_in_bytes - 1,
                ));
                $TypeName::new(start, end)
            }

            pub fn start(&self) -> &$UnitType {
                self.0.start()
            }

            pub fn end(&self) -> &$UnitType {
                self.0.end()
            }

            pub fn is_empty(&self) -> bool {
                self.0.start() > self.0.end()
            }

            pub fn size_in_pages(&self) -> usize {
                if self.is_empty() {
                    0
                } else {
                    self.0.end().number() - self.0.start().number() + 1
                }
            }

            pub fn size_in_bytes(&self) -> usize {
                self.size_in_pages() * PAGE_SIZE
            }

            pub fn contains_range(&self, other: &$TypeName) -> bool {
                !other.is_empty() && !self.is_empty()
                    && self.start() <= other.start()
                    && self.end() >= other.end()
            }

            pub fn overlaps(&self, other: &$TypeName) -> bool {
                !self.is_empty() && !other.is_empty()
                    && self.start() <= other.end()
                    && other.start() <= self.end()
            }

            pub fn to_range_inclusive(&self) -> RangeInclusive<usize> {
                self.0.start().number()..=self.0.end().number()
            }
        }

        impl fmt::Debug for $TypeName {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, concat!(stringify!($TypeName), "({:?} ..= {:?})"), self.0.start(), self.0.end())
            }
        }

        impl Deref for $TypeName {
            type Target = RangeInclusive<$UnitType>;
            fn deref(&self) -> &Self::Target {
                &self.0
            }
        }
    };
}

range_type!(FrameRange, Frame, PhysicalAddress);
range_type!(PageRange, Page, VirtualAddress);

/// The classification of a physical memory region, as reported by the bootloader.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display)]
pub enum MemoryRegionType {
    /// Free, general-purpose RAM usable by the kernel.
    Free,
    /// Reserved for firmware, MMIO, or other hardware use; never handed out.
    Reserved,
}

/// One entry of the bootloader-provided physical memory map.
#[derive(Clone, Copy, Debug)]
pub struct PhysicalMemoryArea {
    pub base_addr: PhysicalAddress,
    pub size_in_bytes: usize,
    pub typ: MemoryRegionType,
}

impl PhysicalMemoryArea {
    pub const fn new(base_addr: PhysicalAddress, size_in_bytes: usize, typ: MemoryRegionType) -> PhysicalMemoryArea {
        PhysicalMemoryArea { base_addr, size_in_bytes, typ }
    }

    pub fn start(&self) -> PhysicalAddress {
        self.base_addr
    }

    pub fn end(&self) -> PhysicalAddress {
        PhysicalAddress::new_canonical(self.base_addr.value() + self.size_in_bytes)
    }
}

#[cfg(test)]
mod tests {
    extern crate std;
    use super::*;

    #[test]
    fn canonical_physical_address_truncates() {
        let addr = PhysicalAddress::new_canonical(0xFFFF_FFFF_FFFF_FFFF);
        assert_eq!(addr.value(), 0x000F_FFFF_FFFF_FFFF);
    }

    #[test]
    fn frame_round_trips_through_address() {
        let addr = PhysicalAddress::new_canonical(0x1234_5000);
        let frame = Frame::containing_address(addr);
        assert_eq!(frame.start_address(), addr);
    }

    #[test]
    fn frame_range_from_addr_is_inclusive() {
        let range = FrameRange::from_addr(PhysicalAddress::new_canonical(0x1000), 2 * PAGE_SIZE);
        assert_eq!(range.size_in_pages(), 2);
        assert_eq!(range.start().number(), 1);
        assert_eq!(range.end().number(), 2);
    }

    #[test]
    fn empty_range_has_zero_size() {
        let range = FrameRange::empty();
        assert!(range.is_empty());
        assert_eq!(range.size_in_pages(), 0);
    }
}
