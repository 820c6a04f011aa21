//! Serves page-aligned bump allocations from the bootloader's usable
//! physical regions before the buddy allocator exists.
//!
//! This is the very first allocator the kernel has: the bitmap backing the
//! buddy allocator, the freelist-node slab pool, and the root page tables
//! for each virtual zone are all handed out by [`reserve`] before anything
//! else is live. Nothing reserved here is ever freed (§4.1) — there are few
//! such allocations and none of them are meant to be returned.

#![no_std]

use boot_info::{BootInformation, MemoryArea};
use kernel_config::memory::PAGE_SIZE;
use log::{debug, trace, warn};
use memory_structs::PhysicalAddress;
use spin::Mutex;

/// Upper bound on the number of disjoint usable regions we expect a
/// bootloader memory map to report. Real machines rarely report more than a
/// handful; this is generous headroom, mirroring the fixed-size arrays the
/// rest of the bootstrap path uses before heap allocation is available.
const MAX_REGIONS: usize = 32;

/// A single page-aligned, monotonically-shrinking usable physical region.
#[derive(Clone, Copy, Debug)]
pub struct UsableRegion {
    free_start: PhysicalAddress,
    end: PhysicalAddress,
}

impl UsableRegion {
    fn remaining_bytes(&self) -> usize {
        self.end.value().saturating_sub(self.free_start.value())
    }

    pub fn free_start(&self) -> PhysicalAddress {
        self.free_start
    }

    pub fn end(&self) -> PhysicalAddress {
        self.end
    }
}

/// The fixed-capacity stand-in for the "linked list of usable regions" of
/// §3: regions are kept sorted by `free_start` and never overlap, which is
/// exactly the invariant a real linked list would maintain, but a flat
/// array needs no allocator to build.
struct RegionList {
    regions: [Option<UsableRegion>; MAX_REGIONS],
    len: usize,
}

impl RegionList {
    const fn empty() -> RegionList {
        RegionList { regions: [None; MAX_REGIONS], len: 0 }
    }

    fn push(&mut self, region: UsableRegion) -> Result<(), &'static str> {
        if region.free_start >= region.end {
            return Ok(()); // zero-length after clipping; silently drop
        }
        if self.len >= MAX_REGIONS {
            return Err("region_reserver: exceeded MAX_REGIONS usable regions");
        }
        self.regions[self.len] = Some(region);
        self.len += 1;
        Ok(())
    }

    fn iter(&self) -> impl Iterator<Item = &UsableRegion> {
        self.regions[..self.len].iter().filter_map(|r| r.as_ref())
    }

    fn iter_mut(&mut self) -> impl Iterator<Item = &mut UsableRegion> {
        self.regions[..self.len].iter_mut().filter_map(|r| r.as_mut())
    }
}

static REGIONS: Mutex<RegionList> = Mutex::new(RegionList::empty());

/// Parses the bootloader's memory map into the initial list of usable
/// regions, clipped as described in §4.1:
/// * the 0th page is never included (address 0 is reserved for null);
/// * regions are page-aligned inward;
/// * a region overlapping the kernel image has its `free_start` raised to
///   the first page strictly past the kernel's end.
pub fn init(boot_info: &dyn BootInformation) -> Result<(), &'static str> {
    let kernel_extent = boot_info.kernel_extent()?;
    let kernel_end_page = PhysicalAddress::new_canonical(kernel_extent.end.value()).align_up(PAGE_SIZE);

    let mut regions = REGIONS.lock();
    let mut err = None;
    boot_info.for_each_memory_area(&mut |area: &dyn MemoryArea| {
        if err.is_some() || !area.area_type().is_usable() {
            return;
        }

        let mut start = area.start().align_up(PAGE_SIZE);
        let end = area.end().align_down(PAGE_SIZE);

        // Never hand out page 0.
        if start.value() == 0 {
            start = PhysicalAddress::new_canonical(PAGE_SIZE);
        }

        // Clip around the kernel image: if this region overlaps the kernel,
        // its usable window begins only after the kernel's end.
        let start = if start < kernel_extent.end && end > kernel_extent.start {
            kernel_end_page.max(start)
        } else {
            start
        };

        if start >= end {
            return;
        }

        trace!("region_reserver: usable region [{:?}, {:?})", start, end);
        if let Err(e) = regions.push(UsableRegion { free_start: start, end }) {
            err = Some(e);
        }
    });

    if let Some(e) = err {
        return Err(e);
    }

    debug!("region_reserver: initialized with {} usable region(s)", regions.len);
    Ok(())
}

/// Serves a page-aligned bump allocation of `n_pages` pages, first-fit over
/// the usable regions. Returns `None` if no region can satisfy the request.
/// There is no corresponding free: region-reserved memory is never returned.
pub fn reserve(n_pages: usize) -> Option<PhysicalAddress> {
    if n_pages == 0 {
        return None;
    }
    let bytes = n_pages * PAGE_SIZE;
    let mut regions = REGIONS.lock();
    for region in regions.iter_mut() {
        if region.remaining_bytes() >= bytes {
            let base = region.free_start;
            region.free_start = PhysicalAddress::new_canonical(base.value() + bytes);
            trace!("region_reserver: reserved {} page(s) at {:?}", n_pages, base);
            return Some(base);
        }
    }
    warn!("region_reserver: failed to reserve {} page(s), no region large enough", n_pages);
    None
}

/// Returns true iff `[base, base + bytes)` lies entirely within the
/// currently-reclaimable window (`[free_start, end)`) of some usable
/// region. Used by the buddy allocator at initialization to reject blocks
/// that straddle a reserved hole.
pub fn is_block_usable(base: PhysicalAddress, bytes: usize) -> bool {
    if bytes == 0 {
        return true;
    }
    let end = PhysicalAddress::new_canonical(base.value() + bytes);
    REGIONS
        .lock()
        .iter()
        .any(|region| region.free_start <= base && end <= region.end)
}
