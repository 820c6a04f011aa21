//! The buddy allocator (§4.3): power-of-two physical block allocation with
//! splitting, coalescing, and partial-block shrinking.
//!
//! This is the allocator everything else in the core eventually rests on.
//! It bootstraps over memory the [`region_reserver`] handed out before it
//! existed (its bitmap and its freelist-node slab pool both come from
//! there), and it registers itself with [`page_metadata`] so that
//! reference-counted frames can route their last-drop back here without
//! `page_metadata` needing to depend on this crate (§9, "Bootstrapping
//! cycle").

#![no_std]

mod bitmap;

use core::ptr::NonNull;
use kernel_config::memory::{MAX_ORDER, PAGE_SIZE, SLAB_SIZE_IN_PAGES};
use log::{debug, trace, warn};
use memory_structs::{Frame, PhysicalAddress};
use page_metadata::PageFlags;
use slabmalloc::SlabCache;
use spin::Mutex;

use bitmap::Bitmap;

/// Cache id stamped into the slab cache backing the buddy's own freelist
/// nodes. Production size-class caches (in `heap`) start numbering above
/// this reserved id.
const FREELIST_NODE_CACHE_ID: u16 = 0;

/// A node in one order's freelist: a free block's page offset, plus the
/// intrusive singly-linked pointer to the next free block at that order.
struct FreeNode {
    offset: usize,
    next: Option<NonNull<FreeNode>>,
}

/// The buddy allocator's full state (§3).
struct BuddyAllocator {
    base: PhysicalAddress,
    total_pages: usize,
    bitmap: Bitmap,
    freelists: [Option<NonNull<FreeNode>>; MAX_ORDER as usize + 1],
    node_pool: SlabCache,
    free_bytes: usize,
    allocated_bytes: usize,
    /// Whether `[addr, addr+bytes)` is still reclaimable boot memory,
    /// consulted at init placement time and when deciding whether a freed
    /// block's buddy is eligible to coalesce. Kept as an injected function
    /// pointer, not a direct call to [`region_reserver`], so the allocator's
    /// core logic can be exercised without that crate's global state (the
    /// same decoupling `slabmalloc::SlabCache::reserve` uses for its slab
    /// source).
    is_usable: fn(PhysicalAddress, usize) -> bool,
}

// SAFETY: access is always through `BUDDY`'s `Mutex`; raw pointers here
// never escape a locked critical section.
unsafe impl Send for BuddyAllocator {}

static BUDDY: Mutex<Option<BuddyAllocator>> = Mutex::new(None);

/// Obtains one fresh slab-order region for the freelist-node pool directly
/// from the region reserver's low-memory, identity-mapped window (§9: the
/// node pool is small and only ever grows during bootstrap-era splits, so
/// it never needs the full virtual-zone machinery that the general-purpose
/// small-object front end uses).
fn obtain_node_pool_slab() -> Option<memory_structs::VirtualAddress> {
    let phys = region_reserver::reserve(SLAB_SIZE_IN_PAGES)?;
    let kvirt = kernel_config::memory::phys_to_kvirt(phys.value())?;
    Some(memory_structs::VirtualAddress::new_canonical(kvirt))
}

impl BuddyAllocator {
    fn addr_of(&self, offset: usize) -> PhysicalAddress {
        PhysicalAddress::new_canonical(self.base.value() + offset * PAGE_SIZE)
    }

    fn offset_of(&self, addr: PhysicalAddress) -> usize {
        (addr.value() - self.base.value()) / PAGE_SIZE
    }

    fn ensure_node_headroom(&mut self) {
        if self.node_pool.free_object_capacity() < MAX_ORDER as usize + 1 {
            if self.node_pool.reserve(self.node_pool.objects_per_slab(), obtain_node_pool_slab).is_err() {
                warn!("frame_allocator: failed to grow freelist-node pool, allocations may start failing");
            }
        }
    }

    /// Links a fresh node for `(order, offset)` onto that order's freelist
    /// and toggles the pair bit, reflecting the block's individual
    /// allocated/free state flipping (§4.3: used by every path except
    /// initialization, which establishes the all-free baseline instead).
    fn insert_freelist(&mut self, order: u8, offset: usize) {
        self.ensure_node_headroom();
        match self.node_pool.allocate() {
            Ok(raw) => unsafe {
                let node = raw.as_ptr().cast::<FreeNode>();
                core::ptr::write(node, FreeNode { offset, next: self.freelists[order as usize] });
                self.freelists[order as usize] = Some(NonNull::new_unchecked(node));
            },
            Err(e) => warn!("frame_allocator: could not install freelist node: {}", e),
        }
        self.bitmap.toggle(offset, order);
    }

    /// Like [`Self::insert_freelist`] but used only by [`Self::init`]: the
    /// bitmap starts zeroed, which already correctly represents "neither
    /// buddy allocated" for every never-yet-split pair, so initial
    /// placement must not toggle it.
    fn install_initial_entry(&mut self, order: u8, offset: usize) {
        self.ensure_node_headroom();
        match self.node_pool.allocate() {
            Ok(raw) => unsafe {
                let node = raw.as_ptr().cast::<FreeNode>();
                core::ptr::write(node, FreeNode { offset, next: self.freelists[order as usize] });
                self.freelists[order as usize] = Some(NonNull::new_unchecked(node));
            },
            Err(e) => warn!("frame_allocator: could not install initial freelist node: {}", e),
        }
    }

    fn take_freelist_head(&mut self, order: u8) -> Option<usize> {
        let node = self.freelists[order as usize]?;
        self.freelists[order as usize] = unsafe { node.as_ref().next };
        let offset = unsafe { node.as_ref().offset };
        unsafe { self.node_pool.free(node.cast()) };
        Some(offset)
    }

    /// Unlinks the node for exactly `(order, offset)` from that order's
    /// freelist. Used when coalescing removes a specific buddy's entry,
    /// which need not be the list head.
    fn remove_freelist_entry(&mut self, order: u8, offset: usize) {
        let mut cursor = self.freelists[order as usize];
        let mut prev: Option<NonNull<FreeNode>> = None;
        while let Some(node) = cursor {
            let node_offset = unsafe { node.as_ref().offset };
            let next = unsafe { node.as_ref().next };
            if node_offset == offset {
                match prev {
                    Some(mut p) => unsafe { p.as_mut().next = next },
                    None => self.freelists[order as usize] = next,
                }
                unsafe { self.node_pool.free(node.cast()) };
                return;
            }
            prev = Some(node);
            cursor = next;
        }
        warn!("frame_allocator: coalesce could not find buddy's freelist entry at order {} offset {}", order, offset);
    }

    fn place_initial_blocks(&mut self, start: usize, end: usize) {
        let mut offset = start;
        while offset < end {
            let mut order = MAX_ORDER;
            loop {
                let size = 1usize << order;
                let fits = offset + size <= end;
                let usable = fits && (self.is_usable)(self.addr_of(offset), size * PAGE_SIZE);
                if usable {
                    self.install_initial_entry(order, offset);
                    self.free_bytes += size * PAGE_SIZE;
                    offset += size;
                    break;
                }
                if order == 0 {
                    // This single page is unusable (straddles a reserved hole); skip it.
                    offset += 1;
                    break;
                }
                order -= 1;
            }
        }
    }

    fn allocate(&mut self, k: u8) -> Option<PhysicalAddress> {
        if k as usize >= self.freelists.len() {
            return None;
        }

        if let Some(offset) = self.take_freelist_head(k) {
            self.bitmap.toggle(offset, k);
            self.free_bytes -= (PAGE_SIZE << k);
            self.allocated_bytes += (PAGE_SIZE << k);
            return Some(self.addr_of(offset));
        }

        let mut m = k + 1;
        while (m as usize) < self.freelists.len() && self.freelists[m as usize].is_none() {
            m += 1;
        }
        if (m as usize) >= self.freelists.len() {
            warn!("frame_allocator: out of memory servicing alloc(order={})", k);
            return None;
        }

        let offset = self.take_freelist_head(m)?;
        let mut order = m;
        while order > k {
            order -= 1;
            let upper = offset + (1usize << order);
            // Splitting a block makes its two halves differ in status (one
            // stays behind for further splitting or allocation, the other
            // goes back on the freelist), so the pair bit at this order
            // must flip just as it would on a single-level free.
            self.bitmap.toggle(offset, order);
            self.insert_freelist(order, upper);
        }

        self.free_bytes -= (PAGE_SIZE << k);
        self.allocated_bytes += (PAGE_SIZE << k);
        Some(self.addr_of(offset))
    }

    fn free(&mut self, addr: PhysicalAddress, k: u8) {
        self.allocated_bytes -= (PAGE_SIZE << k);
        self.free_bytes += (PAGE_SIZE << k);

        let mut offset = self.offset_of(addr);
        let mut order = k;
        self.bitmap.toggle(offset, order);

        // The pair bit at `order` now reads 0 exactly when both buddies are
        // free, which is the signal to coalesce. Each merge folds two
        // blocks into one at `order + 1`, so that level's own pair bit must
        // be toggled too before it's consulted on the next iteration.
        while order < MAX_ORDER && !self.bitmap.get(offset, order) {
            let buddy_offset = offset ^ (1usize << order);
            let buddy_addr = self.addr_of(buddy_offset);
            let buddy_usable = (self.is_usable)(buddy_addr, (1usize << order) * PAGE_SIZE);
            if !buddy_usable {
                break;
            }
            self.remove_freelist_entry(order, buddy_offset);
            offset = offset.min(buddy_offset);
            order += 1;
            self.bitmap.toggle(offset, order);
        }

        self.insert_freelist(order, offset);
    }

    fn shrink(&mut self, block_base: PhysicalAddress, b: u8, n: usize) -> Result<(), &'static str> {
        if n == 0 || n >= (1usize << b) {
            return Err("frame_allocator: shrink target must be in [1, 2^order)");
        }

        let freed_pages = (1usize << b) - n;
        self.allocated_bytes -= freed_pages * PAGE_SIZE;
        self.free_bytes += freed_pages * PAGE_SIZE;

        let mut examine_offset = self.offset_of(block_base);
        let mut examine_order = b;
        let mut target = n;

        loop {
            if (1usize << examine_order) == target {
                break;
            }
            let half_order = examine_order - 1;
            let half = 1usize << half_order;
            if target > half {
                examine_offset += half;
                target -= half;
                examine_order = half_order;
            } else {
                let right_offset = examine_offset + half;
                self.insert_freelist(half_order, right_offset);
                examine_order = half_order;
            }
        }
        Ok(())
    }
}

/// Bytes the caller must reserve for `init`'s `bitmap_memory`, covering
/// `total_pages` pages. Exposed so bootstrap code can size a region-reserver
/// allocation before the buddy allocator exists to size it itself.
pub fn bitmap_bytes_needed(total_pages: usize) -> usize {
    bitmap::bytes_needed(total_pages)
}

/// Initializes the buddy allocator to manage `[base, end)`.
///
/// `bitmap_memory` must point to at least [`bitmap_bytes_needed`] bytes,
/// obtained from the region reserver. Walks the region in super-blocks of
/// `2^(MAX_ORDER+1)` pages, greedily placing the largest usable block at
/// each offset (§4.3).
///
/// # Safety
/// `bitmap_memory` must be valid for `'static` writes of at least
/// [`bitmap_bytes_needed`]`(end, base)` bytes and not aliased elsewhere.
pub unsafe fn init(bitmap_memory: *mut u8, base: PhysicalAddress, end: PhysicalAddress) -> Result<(), &'static str> {
    let mut guard = BUDDY.lock();
    if guard.is_some() {
        return Err("frame_allocator: already initialized");
    }

    let total_pages = (end.value() - base.value()) / PAGE_SIZE;
    let bitmap = Bitmap::new(bitmap_memory, total_pages);

    let mut node_pool = SlabCache::new(
        core::mem::size_of::<FreeNode>(),
        core::mem::align_of::<FreeNode>(),
        FREELIST_NODE_CACHE_ID,
    );
    node_pool
        .reserve(node_pool.objects_per_slab().max(MAX_ORDER as usize + 1), obtain_node_pool_slab)
        .map_err(|_| "frame_allocator: could not obtain a slab for the freelist-node pool")?;

    let mut allocator = BuddyAllocator {
        base,
        total_pages,
        bitmap,
        freelists: [None; MAX_ORDER as usize + 1],
        node_pool,
        free_bytes: 0,
        allocated_bytes: 0,
        is_usable: region_reserver::is_block_usable,
    };
    allocator.place_initial_blocks(0, total_pages);

    debug!(
        "frame_allocator: initialized buddy allocator over [{:?}, {:?}), {} free bytes",
        base, end, allocator.free_bytes
    );
    *guard = Some(allocator);
    drop(guard);

    page_metadata::register_buddy_free_callback(buddy_free_block);
    Ok(())
}

/// Allocates a block of `2^order` pages, returning its physical base
/// address, or `None` if no block of that order is free and none can be
/// split from a larger one (§4.3, "Allocate").
pub fn allocate_frames(order: u8) -> Option<PhysicalAddress> {
    BUDDY.lock().as_mut()?.allocate(order)
}

/// Frees a block of `2^order` pages previously returned by
/// [`allocate_frames`] with the same `order`, coalescing with its buddy
/// where possible (§4.3, "Free").
pub fn free_frames(base: PhysicalAddress, order: u8) {
    if let Some(allocator) = BUDDY.lock().as_mut() {
        allocator.free(base, order);
    } else {
        warn!("frame_allocator: free_frames called before init");
    }
}

/// Shrinks a `2^b`-page block down to exactly `n` contiguous pages at its
/// low end, freeing the remainder as a sequence of smaller blocks (§4.3,
/// "Shrink").
pub fn shrink_frames(base: PhysicalAddress, b: u8, n: usize) -> Result<(), &'static str> {
    BUDDY.lock().as_mut().ok_or("frame_allocator: shrink_frames called before init")?.shrink(base, b, n)
}

/// The callback registered with [`page_metadata::register_buddy_free_callback`]:
/// invoked once a buddy-managed block's reference count reaches zero.
fn buddy_free_block(base: PhysicalAddress, order: u8) {
    trace!("frame_allocator: releasing fully-dereferenced block {:?} order {}", base, order);
    free_frames(base, order);
}

/// Allocates a block and marks it buddy-managed in the page-metadata
/// table with an initial live-page count, for callers (the virtual memory
/// manager) that want the block's lifetime governed by per-page reference
/// counts rather than a single explicit `free_frames` call.
pub fn allocate_frames_refcounted(order: u8) -> Option<PhysicalAddress> {
    let addr = allocate_frames(order)?;
    let base_frame = Frame::containing_address(addr);
    page_metadata::init_buddy_block(base_frame, order, 1u16 << order);
    for i in 0..(1usize << order) {
        page_metadata::reference_page(base_frame + i);
    }
    page_metadata::set_page_flags(base_frame, PageFlags::BUDDY_MANAGED);
    Some(addr)
}

/// Current totals, for diagnostics and tests (§3: `free_space + allocated == manageable_bytes`).
pub fn accounting() -> (usize, usize) {
    match BUDDY.lock().as_ref() {
        Some(a) => (a.free_bytes, a.allocated_bytes),
        None => (0, 0),
    }
}

#[cfg(test)]
mod tests {
    extern crate alloc;
    extern crate std;
    use super::*;
    use alloc::vec;
    use std::sync::Mutex as StdMutex;

    // `BUDDY`/`page_metadata`'s statics are process-global, so tests that
    // call `init` must not run concurrently with each other.
    static TEST_LOCK: StdMutex<()> = StdMutex::new(());

    fn always_usable(_: PhysicalAddress, _: usize) -> bool {
        true
    }

    /// Builds an allocator over a single flat, hole-free region, with
    /// `is_usable` stubbed to `always_usable` rather than going through
    /// `region_reserver`'s global state.
    fn flat_allocator(order: u8) -> BuddyAllocator {
        let _guard = TEST_LOCK.lock().unwrap();
        let pages = 1usize << order;
        let bitmap_bytes = bitmap::bytes_needed(pages);
        let bitmap_mem = vec![0u8; bitmap_bytes.max(1)].leak().as_mut_ptr();
        let bitmap = unsafe { Bitmap::new(bitmap_mem, pages) };
        let mut node_pool = SlabCache::new(core::mem::size_of::<FreeNode>(), core::mem::align_of::<FreeNode>(), 99);
        let layout = std::alloc::Layout::from_size_align(
            kernel_config::memory::SLAB_SIZE_IN_BYTES,
            kernel_config::memory::SLAB_SIZE_IN_BYTES,
        )
        .unwrap();
        node_pool
            .reserve(node_pool.objects_per_slab() * 4, || {
                let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
                Some(memory_structs::VirtualAddress::new_canonical(ptr as usize))
            })
            .unwrap();
        let mut allocator = BuddyAllocator {
            base: PhysicalAddress::zero(),
            total_pages: pages,
            bitmap,
            freelists: [None; MAX_ORDER as usize + 1],
            node_pool,
            free_bytes: 0,
            allocated_bytes: 0,
            is_usable: always_usable,
        };
        allocator.install_initial_entry(order, 0);
        allocator.free_bytes = pages * PAGE_SIZE;
        allocator
    }

    #[test]
    fn alloc_free_round_trip_every_order() {
        for order in 0..=MAX_ORDER {
            let mut a = flat_allocator(MAX_ORDER);
            let before_free = a.free_bytes;
            let addr = a.allocate(order).expect("alloc should succeed");
            a.free(addr, order);
            assert_eq!(a.free_bytes, before_free, "order {} round trip", order);
            assert_eq!(a.allocated_bytes, 0);
        }
    }

    #[test]
    fn split_then_coalesce_restores_single_top_entry() {
        let mut a = flat_allocator(2); // one order-2 block (4 pages)
        let low = a.allocate(0).unwrap();
        assert_eq!(a.freelists[1].is_some(), true, "splitting order 2 should leave a free order-1 buddy");

        a.free(low, 0);
        // Back to a single order-2 entry, nothing at orders 0/1.
        assert!(a.freelists[0].is_none());
        assert!(a.freelists[1].is_none());
        assert!(a.freelists[2].is_some());
        assert_eq!(a.allocated_bytes, 0);
    }

    #[test]
    fn shrink_produces_expected_offsets_and_orders() {
        let mut a = flat_allocator(MAX_ORDER);
        let base = a.allocate(MAX_ORDER).unwrap();
        a.shrink(base, MAX_ORDER, 33).unwrap();

        let mut seen = vec![];
        for order in 0..=MAX_ORDER {
            let mut cursor = a.freelists[order as usize];
            while let Some(node) = cursor {
                seen.push((order, unsafe { node.as_ref().offset }));
                cursor = unsafe { node.as_ref().next };
            }
        }
        seen.sort();
        let mut expected = vec![(0usize, 33usize), (1, 34), (2, 36), (3, 40), (4, 48), (6, 64)];
        expected.sort();
        let expected: vec::Vec<(u8, usize)> = expected.into_iter().map(|(o, off)| (o as u8, off)).collect();
        assert_eq!(seen, expected);
    }

    #[test]
    fn out_of_memory_at_max_order_fails_cleanly() {
        let mut a = flat_allocator(MAX_ORDER);
        assert!(a.allocate(MAX_ORDER).is_some());
        assert!(a.allocate(MAX_ORDER).is_none());
    }
}
