//! Bootstraps the memory management core in the one order it can run in
//! (§2, "Data flow at boot"): the logger goes up first so every later step
//! is traceable, then the region reserver serves the bump allocations every
//! other allocator needs before it can stand up on its own, then the page
//! metadata table, the buddy allocator, the named virtual zones, and
//! finally the small-object front end that becomes `#[global_allocator]`.

#![no_std]

use kernel_config::memory::{phys_to_kvirt, PAGE_SIZE};
use log::{debug, LevelFilter};
use memory_structs::PhysicalAddress;
use page_metadata::PageRecord;

/// Runs the full bootstrap sequence described in §2. Must be called exactly
/// once, as early as possible, with the bootloader's parsed tag list.
pub fn init(boot_info: &dyn boot_info::BootInformation, log_level: LevelFilter) -> Result<(), &'static str> {
    logger::init(log_level).map_err(|_| "heap_init: logger already installed")?;

    region_reserver::init(boot_info)?;

    let total_pages = highest_reported_frame(boot_info)?;
    let phys_end = PhysicalAddress::new_canonical(total_pages * PAGE_SIZE);
    let phys_base = PhysicalAddress::new_canonical(0);

    let kernel_extent = boot_info.kernel_extent()?;
    init_page_metadata(total_pages, kernel_extent.start)?;
    init_buddy_allocator(total_pages, phys_base, phys_end)?;

    memory::vmspace_init(memory::current_pml4_root(), true).map_err(|_| "heap_init: failed to initialize virtual zones")?;
    heap::init()?;

    debug!("heap_init: memory management core fully bootstrapped");
    Ok(())
}

/// The highest frame number any reported memory area (usable or not) ends
/// at, which sizes both the page-metadata table and the buddy allocator's
/// managed range; neither can be "just the usable regions" since both need
/// to address every frame by number, holes included.
fn highest_reported_frame(boot_info: &dyn boot_info::BootInformation) -> Result<usize, &'static str> {
    let mut highest_end = 0usize;
    boot_info.for_each_memory_area(&mut |area: &dyn boot_info::MemoryArea| {
        highest_end = highest_end.max(area.end().value());
    })?;
    Ok((highest_end + PAGE_SIZE - 1) / PAGE_SIZE)
}

fn reserve_and_map(n_pages: usize) -> Result<*mut u8, &'static str> {
    let phys = region_reserver::reserve(n_pages).ok_or("heap_init: region reserver exhausted")?;
    let virt = phys_to_kvirt(phys.value()).ok_or("heap_init: reservation fell outside the boot identity window")?;
    Ok(virt as *mut u8)
}

/// Reserves and zeroes the page-metadata table, then initializes it to
/// cover `[0, num_frames)` (§4.2).
fn init_page_metadata(num_frames: usize, kernel_start: PhysicalAddress) -> Result<(), &'static str> {
    let table_bytes = num_frames * core::mem::size_of::<PageRecord>();
    let table_pages = (table_bytes + PAGE_SIZE - 1) / PAGE_SIZE;
    let table_start = region_reserver::reserve(table_pages).ok_or("heap_init: no room for the page-metadata table")?;
    let table_virt = phys_to_kvirt(table_start.value()).ok_or("heap_init: page-metadata table fell outside the boot identity window")?;
    let table_end = PhysicalAddress::new_canonical(table_start.value() + table_pages * PAGE_SIZE);

    let is_usable = |frame_number: usize| region_reserver::is_block_usable(PhysicalAddress::new_canonical(frame_number * PAGE_SIZE), PAGE_SIZE);
    // Read-only kernel sections aren't modeled yet; every frame is treated as writable.
    let is_read_only = |_frame_number: usize| false;

    unsafe { page_metadata::init(table_virt as *mut PageRecord, num_frames, kernel_start, table_end, is_usable, is_read_only) }
}

/// Reserves the buddy-state bitmap and initializes the buddy allocator
/// over `[base, end)` (§4.3).
fn init_buddy_allocator(total_pages: usize, base: PhysicalAddress, end: PhysicalAddress) -> Result<(), &'static str> {
    let bitmap_bytes = frame_allocator::bitmap_bytes_needed(total_pages);
    let bitmap_pages = (bitmap_bytes + PAGE_SIZE - 1) / PAGE_SIZE;
    let bitmap_virt = reserve_and_map(bitmap_pages)?;
    unsafe { frame_allocator::init(bitmap_virt, base, end) }
}
