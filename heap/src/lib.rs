//! The small-object front end (§4.5): the kernel's `#[global_allocator]`.
//!
//! Ten fixed size classes, each its own [`SlabCache`], chosen for low
//! fragmentation at 8-byte alignment. A request picks its class in O(1)
//! through a lookup table built once at compile time; a request larger than
//! the biggest class (2040 bytes) skips the slab layer entirely and is
//! satisfied as a dedicated mapping in the `KERNEL_HEAP` virtual zone,
//! backed directly by the buddy allocator.

#![no_std]

extern crate alloc;

use alloc::alloc::{GlobalAlloc, Layout};
use core::ptr::{self, NonNull};

use kernel_config::memory::PAGE_SIZE;
use log::{error, trace};
use memory::{vmzone_alloc_block, vmzone_extend, vmzone_shrink, MapFlags, ZoneId};
use memory_structs::VirtualAddress;
use slabmalloc::SlabCache;
use spin::{Mutex, Once};

/// Fixed size classes chosen for low fragmentation at 8-byte alignment (§4.5).
const SIZE_CLASSES: [usize; 10] = [8, 16, 24, 48, 96, 120, 240, 480, 1016, 2040];

/// Uniform cell alignment across every class.
const CLASS_ALIGN: usize = 8;

/// Slabs each class starts with, so the first few allocations never have to
/// wait on `vmzone_alloc_block`.
const INITIAL_SLABS_PER_CLASS: usize = 2;

/// Largest request the slab classes satisfy; anything bigger takes the
/// dedicated virtual-zone path.
pub const MAX_SLAB_SIZE: usize = SIZE_CLASSES[SIZE_CLASSES.len() - 1];

/// Maps `ceil(size / 8)` to a size-class index, `u8::MAX` for "no class fits".
const fn build_lookup() -> [u8; (MAX_SLAB_SIZE / 8) + 1] {
    let mut table = [u8::MAX; (MAX_SLAB_SIZE / 8) + 1];
    let mut bucket = 0usize;
    while bucket < table.len() {
        let mut class = 0usize;
        while class < SIZE_CLASSES.len() && SIZE_CLASSES[class] < bucket * 8 {
            class += 1;
        }
        table[bucket] = if class < SIZE_CLASSES.len() { class as u8 } else { u8::MAX };
        bucket += 1;
    }
    table
}

static CLASS_LOOKUP: [u8; (MAX_SLAB_SIZE / 8) + 1] = build_lookup();

/// The size-class index a request of `size` bytes belongs to, or `None` if
/// it exceeds [`MAX_SLAB_SIZE`].
fn class_for(size: usize) -> Option<usize> {
    let bucket = (size + 7) / 8;
    match CLASS_LOOKUP.get(bucket) {
        Some(&u8::MAX) | None => None,
        Some(&class) => Some(class as usize),
    }
}

/// Obtains one fresh slab-order region of virtual memory from the
/// `KERNEL_SLAB` zone, backed by freshly allocated physical pages (§4.6's
/// block-allocation zones). This is the `obtain_slab` closure every
/// `SlabCache::reserve` call here is given.
fn obtain_slab() -> Option<VirtualAddress> {
    vmzone_alloc_block(slabmalloc::slab_size_in_pages(), MapFlags::WRITABLE, ZoneId::KernelSlab).ok()
}

struct SmallObjectFrontEnd {
    classes: Once<[Mutex<SlabCache>; SIZE_CLASSES.len()]>,
}

impl SmallObjectFrontEnd {
    const fn empty() -> SmallObjectFrontEnd {
        SmallObjectFrontEnd { classes: Once::new() }
    }
}

#[global_allocator]
static ALLOCATOR: SmallObjectFrontEnd = SmallObjectFrontEnd::empty();

/// Builds the ten size-class caches and pre-reserves each with a few slabs,
/// registering this crate as the live backing for `#[global_allocator]`.
///
/// Must run after `memory::vmspace_init` has linked `KERNEL_SLAB` into the
/// kernel's address space, and exactly once; a second call fails without
/// disturbing the first.
pub fn init() -> Result<(), &'static str> {
    if ALLOCATOR.classes.get().is_some() {
        return Err("heap: small-object front end already initialized");
    }

    let mut reserve_err = None;
    let classes: [Mutex<SlabCache>; SIZE_CLASSES.len()] = core::array::from_fn(|i| {
        let mut cache = SlabCache::new(SIZE_CLASSES[i], CLASS_ALIGN, i as u16);
        if reserve_err.is_none() {
            let objects = INITIAL_SLABS_PER_CLASS * cache.objects_per_slab();
            if let Err(e) = cache.reserve(objects, obtain_slab) {
                reserve_err = Some(e);
            }
        }
        Mutex::new(cache)
    });

    if let Some(e) = reserve_err {
        return Err(e);
    }

    ALLOCATOR.classes.call_once(|| classes);
    trace!("heap: initialized {} size classes", SIZE_CLASSES.len());
    Ok(())
}

/// Bookkeeping written just past the end of every large allocation (§4.5),
/// so `dealloc` can shrink the right number of pages back off `KERNEL_HEAP`
/// without the caller having to remember the allocation's size.
#[repr(C)]
struct LargeAllocHeader {
    pages: usize,
}

/// Satisfies a request above [`MAX_SLAB_SIZE`] directly as a `KERNEL_HEAP`
/// zone mapping of freshly allocated physical pages (§4.5). The pointer
/// returned by `vmzone_extend` is always the start of the newly mapped
/// range, so it doubles as the allocation's base address.
fn allocate_large(layout: Layout) -> Result<NonNull<u8>, &'static str> {
    let needed = layout.size() + core::mem::size_of::<LargeAllocHeader>();
    let pages = (needed + PAGE_SIZE - 1) / PAGE_SIZE;
    let virt = vmzone_extend(pages, MapFlags::WRITABLE, ZoneId::KernelHeap)
        .map_err(|_| "heap: out of memory mapping a large allocation")?;
    let base = virt.value() as *mut u8;
    unsafe {
        (base.add(layout.size()) as *mut LargeAllocHeader).write(LargeAllocHeader { pages });
    }
    trace!("heap: mapped a {}-byte large allocation at {:#x} ({} pages)", layout.size(), virt.value(), pages);
    NonNull::new(base).ok_or("heap: could not construct a non-null pointer")
}

/// Reverses [`allocate_large`]: reads the page count written just past the
/// allocation and retreats `KERNEL_HEAP`'s cursor by that many pages.
///
/// Because `vmzone_shrink` only ever releases pages off the zone's current
/// cursor, large allocations on `KERNEL_HEAP` must be freed in the reverse
/// order they were made — the same LIFO discipline `vmzone_extend`/
/// `vmzone_shrink` impose on every other contiguous-zone caller (§4.6).
fn deallocate_large(ptr: *mut u8, layout: Layout) {
    let pages = unsafe { (*(ptr.add(layout.size()) as *const LargeAllocHeader)).pages };
    if let Err(e) = vmzone_shrink(pages, ZoneId::KernelHeap) {
        error!("heap: failed to shrink KERNEL_HEAP while freeing a large allocation: {:?}", e);
    }
}

unsafe impl GlobalAlloc for SmallObjectFrontEnd {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.size() > MAX_SLAB_SIZE {
            return allocate_large(layout).map_or(ptr::null_mut(), |p| p.as_ptr());
        }
        let Some(class) = class_for(layout.size()) else {
            return ptr::null_mut();
        };
        let Some(classes) = self.classes.get() else {
            error!("heap: alloc called before init()");
            return ptr::null_mut();
        };
        match classes[class].lock().allocate() {
            Ok(p) => p.as_ptr(),
            Err(_) => ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        if layout.size() > MAX_SLAB_SIZE {
            return deallocate_large(ptr, layout);
        }
        let Some(nn) = NonNull::new(ptr) else { return };
        let Some(classes) = self.classes.get() else {
            error!("heap: dealloc called before init()");
            return;
        };
        let cache_id = SlabCache::cache_id_of(nn) as usize;
        classes[cache_id].lock().free(nn);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn class_for_picks_the_smallest_class_that_fits() {
        assert_eq!(class_for(1), Some(0));
        assert_eq!(class_for(8), Some(0));
        assert_eq!(class_for(9), Some(1));
        assert_eq!(class_for(17), Some(2));
        assert_eq!(class_for(240), Some(6));
        assert_eq!(class_for(241), Some(7));
        assert_eq!(class_for(2040), Some(9));
    }

    #[test]
    fn class_for_rejects_anything_above_the_largest_class() {
        assert_eq!(class_for(2041), None);
        assert_eq!(class_for(usize::MAX), None);
    }
}
