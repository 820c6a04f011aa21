//! Hardware-defined flag bits of an x86_64 page table entry.
//!
//! The software-reserved provenance bits layered on top of these (§3) live
//! in the `page_table_entry` crate, which combines an `EntryFlags` value
//! with a physical frame address and those provenance bits into one 64-bit
//! entry.

#![no_std]

#[macro_use]
extern crate bitflags;

bitflags! {
    /// Hardware-defined access flag bits, occupying bits 0-7 and bit 63 of a page table entry.
    #[derive(Default)]
    pub struct EntryFlags: u64 {
        const PRESENT           = 1 << 0;
        const WRITABLE          = 1 << 1;
        const USER_ACCESSIBLE   = 1 << 2;
        const WRITE_THROUGH     = 1 << 3;
        const NO_CACHE          = 1 << 4;
        const ACCESSED          = 1 << 5;
        const DIRTY             = 1 << 6;
        const HUGE_PAGE         = 1 << 7;
        const GLOBAL            = 1 << 8;
        const NO_EXECUTE        = 1 << 63;
    }
}

impl EntryFlags {
    /// Returns true if the page the entry points to is a huge page.
    pub fn is_huge(&self) -> bool {
        self.contains(EntryFlags::HUGE_PAGE)
    }

    /// The flags that must be set for an accessible page: `PRESENT`.
    pub fn present() -> EntryFlags {
        EntryFlags::PRESENT
    }

    /// The flags of an accessible, writable page: `PRESENT | WRITABLE`.
    pub fn writable_page() -> EntryFlags {
        EntryFlags::present() | EntryFlags::WRITABLE
    }

    /// Returns true if the page is accessible and is not huge.
    pub fn is_regular_page(&self) -> bool {
        self.contains(EntryFlags::PRESENT) && !self.contains(EntryFlags::HUGE_PAGE)
    }

    /// Sets `PRESENT` and `WRITABLE` and returns the result.
    pub fn as_writable_page(self) -> EntryFlags {
        self | EntryFlags::writable_page()
    }

    /// Returns true if the page is writable.
    pub fn is_writable(&self) -> bool {
        self.intersects(EntryFlags::WRITABLE)
    }

    /// Returns true if these flags are executable, i.e. `NO_EXECUTE` is *not* set.
    pub fn is_executable(&self) -> bool {
        !self.intersects(EntryFlags::NO_EXECUTE)
    }
}
