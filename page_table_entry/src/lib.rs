//! A page table entry: 64 bits combining a hardware-defined access-flag set
//! (`entryflags_x86_64::EntryFlags`), the physical address of the frame the
//! entry refers to, and a handful of software-reserved bits recording the
//! *provenance* of the allocation that filled the entry (§3).
//!
//! x86_64 page table entries reserve bits 9-11 and bits 52-58 for software
//! use; the hardware MMU ignores them entirely. This crate packs the
//! provenance flags of §4.6 into those bits so that tearing down a page
//! table or a data mapping never needs an external side table to learn how
//! the memory underneath it was obtained.

#![no_std]

#[macro_use]
extern crate bitflags;

use entryflags_x86_64::EntryFlags;
use kernel_config::memory::PAGE_SHIFT;
use memory_structs::{Frame, PhysicalAddress};

/// Mask selecting bits 12-51, the physical frame address carried by an entry.
const ADDRESS_MASK: u64 = 0x000F_FFFF_FFFF_F000;

bitflags! {
    /// Software-reserved bits recording how the frame behind an entry was
    /// obtained, so that unmapping it can route the frame back to the
    /// allocator that produced it without consulting any other metadata.
    ///
    /// The first three bits live in the range the hardware leaves free below
    /// the address field (bits 9-11); the rest live above it (bits 52-55).
    #[derive(Default)]
    pub struct Provenance: u64 {
        /// This entry's frame was allocated contiguously with the frame one
        /// index below it in the same table (both came from one multi-page
        /// allocation), so the two can be torn down as a unit.
        const CONTIGUOUS_WITH_PREVIOUS = 1 << 9;
        /// This entry's frame was allocated contiguously with the frame one
        /// index above it in the same table.
        const CONTIGUOUS_WITH_NEXT     = 1 << 10;
        /// This entry's frame came from the boot-time region reserver
        /// (§4.1) rather than the buddy allocator, and must never be passed
        /// to [`frame_allocator`]'s free path.
        const REGION_RESERVED          = 1 << 11;
        /// This entry is a PML4 slot shared by every address space (the
        /// kernel-half mappings), so unmapping it in one `VmSpace` must not
        /// free the table it points to.
        const GLOBALLY_SHARED          = 1 << 52;
    }
}

/// A single 64-bit page table entry.
///
/// Bits 0-8 and 63 are `EntryFlags`; bits 12-51 are the physical address of
/// the referenced frame (or, for a non-leaf entry, of the next-level table);
/// bits 9-11 and 52-55 are [`Provenance`].
#[derive(Clone, Copy)]
#[repr(transparent)]
pub struct PageTableEntry(u64);

impl PageTableEntry {
    /// An entry with no flags, no address, and no provenance set.
    pub const fn unused() -> PageTableEntry {
        PageTableEntry(0)
    }

    pub fn is_unused(&self) -> bool {
        self.0 == 0
    }

    pub fn set_unused(&mut self) {
        self.0 = 0;
    }

    /// The hardware-defined access flags carried by this entry.
    pub fn flags(&self) -> EntryFlags {
        EntryFlags::from_bits_truncate(self.0)
    }

    /// The physical frame this entry points to, if it is present.
    pub fn frame(&self) -> Option<Frame> {
        if self.flags().contains(EntryFlags::PRESENT) {
            Some(Frame::containing_address(PhysicalAddress::new_canonical(
                (self.0 & ADDRESS_MASK) as usize,
            )))
        } else {
            None
        }
    }

    /// The provenance bits stamped on this entry.
    pub fn provenance(&self) -> Provenance {
        Provenance::from_bits_truncate(self.0)
    }

    /// Overwrites this entry's provenance bits, leaving its flags and
    /// address untouched.
    pub fn set_provenance(&mut self, provenance: Provenance) {
        self.0 = (self.0 & !Provenance::all().bits()) | provenance.bits();
    }

    /// Points this entry at `frame` with the given `flags`, preserving
    /// whatever provenance bits were already present in the slot (§4.6: a
    /// remap must not lose the record of how the underlying table or page
    /// was originally allocated).
    pub fn set(&mut self, frame: Frame, flags: EntryFlags) {
        let provenance = self.0 & Provenance::all().bits();
        let addr = (frame.start_address().value() as u64) & ADDRESS_MASK;
        self.0 = addr | flags.bits() | provenance;
    }

    /// Points this entry at `frame` with `flags` and a fresh `provenance`,
    /// discarding whatever was in the slot before.
    pub fn set_with_provenance(&mut self, frame: Frame, flags: EntryFlags, provenance: Provenance) {
        let addr = (frame.start_address().value() as u64) & ADDRESS_MASK;
        self.0 = addr | flags.bits() | provenance.bits();
    }

    /// The raw 64-bit value, for the handful of callers (table dumps,
    /// `CR3` loads) that need it.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl core::fmt::Debug for PageTableEntry {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.debug_struct("PageTableEntry")
            .field("frame", &self.frame())
            .field("flags", &self.flags())
            .field("provenance", &self.provenance())
            .finish()
    }
}

/// Number of entries in one page table at any level, derived from the
/// page size: each table occupies exactly one page of 8-byte entries.
pub const ENTRIES_PER_PAGE_TABLE: usize = 1 << (PAGE_SHIFT - 3);

/// A full page table: one page's worth of entries.
#[repr(align(4096))]
pub struct Table {
    entries: [PageTableEntry; ENTRIES_PER_PAGE_TABLE],
}

impl Table {
    pub fn zeroed() -> Table {
        Table { entries: [PageTableEntry::unused(); ENTRIES_PER_PAGE_TABLE] }
    }
}

impl core::ops::Index<usize> for Table {
    type Output = PageTableEntry;
    fn index(&self, index: usize) -> &PageTableEntry {
        &self.entries[index]
    }
}

impl core::ops::IndexMut<usize> for Table {
    fn index_mut(&mut self, index: usize) -> &mut PageTableEntry {
        &mut self.entries[index]
    }
}

#[cfg(test)]
mod tests {
    extern crate std;
    use super::*;

    #[test]
    fn set_then_read_back_roundtrips_frame_and_flags() {
        let mut entry = PageTableEntry::unused();
        assert!(entry.is_unused());

        let frame = Frame::containing_address(PhysicalAddress::new_canonical(0x20_3000));
        entry.set(frame, EntryFlags::PRESENT | EntryFlags::WRITABLE);

        assert_eq!(entry.frame(), Some(frame));
        assert!(entry.flags().contains(EntryFlags::WRITABLE));
        assert!(entry.provenance().is_empty());
    }

    #[test]
    fn remap_preserves_existing_provenance() {
        let mut entry = PageTableEntry::unused();
        let frame_a = Frame::containing_address(PhysicalAddress::new_canonical(0x1000));
        entry.set_with_provenance(
            frame_a,
            EntryFlags::PRESENT,
            Provenance::REGION_RESERVED | Provenance::CONTIGUOUS_WITH_NEXT,
        );

        let frame_b = Frame::containing_address(PhysicalAddress::new_canonical(0x9000));
        entry.set(frame_b, EntryFlags::PRESENT | EntryFlags::WRITABLE);

        assert_eq!(entry.frame(), Some(frame_b));
        assert!(entry.provenance().contains(Provenance::REGION_RESERVED));
        assert!(entry.provenance().contains(Provenance::CONTIGUOUS_WITH_NEXT));
    }

    #[test]
    fn set_provenance_does_not_disturb_flags_or_address() {
        let mut entry = PageTableEntry::unused();
        let frame = Frame::containing_address(PhysicalAddress::new_canonical(0x4000));
        entry.set(frame, EntryFlags::PRESENT | EntryFlags::GLOBAL);

        entry.set_provenance(Provenance::GLOBALLY_SHARED);

        assert_eq!(entry.frame(), Some(frame));
        assert!(entry.flags().contains(EntryFlags::GLOBAL));
        assert!(entry.provenance().contains(Provenance::GLOBALLY_SHARED));
        assert!(!entry.provenance().contains(Provenance::REGION_RESERVED));
    }

    #[test]
    fn unused_entry_has_no_frame() {
        let entry = PageTableEntry::unused();
        assert!(entry.frame().is_none());
    }
}
