//! Named virtual zones, `vmzone_extend`/`vmzone_shrink`, and `vmspace_init` (§4.6).
//!
//! Each zone owns a disjoint slice of the address space (the layout table
//! documented on [`kernel_config::memory`]) and a monotonic bump cursor. A
//! contiguous zone only ever grows or shrinks at that cursor; nothing in
//! this module supports punching a hole in the middle of one.
//!
//! `vmzone_extend` never asks the buddy allocator for a single block bigger
//! than `2^MAX_ORDER` pages: a request for more is satisfied by one
//! physically-contiguous piece per descending power of two, the same
//! decomposition `shrink_frames` itself produces when splitting a larger
//! block. Every piece therefore maps as its own run of page-table entries,
//! `CONTIGUOUS_WITH_PREVIOUS`/`CONTIGUOUS_WITH_NEXT` inside itself only, and
//! `vmzone_shrink` walks those runs backwards off the cursor: a run that
//! fits entirely within the pages being released is freed whole, and a run
//! straddling the boundary is trimmed with `shrink_frames` instead of freed,
//! matching the "left-hand block kept, right-hand tail released" shape of a
//! buddy shrink.
//!
//! Block zones (`KERNEL_SLAB`, `KERNEL_STACK`, `USER_SHARED`) don't share
//! that cursor-retreats-backward shape: their blocks are freed individually,
//! by address, in whatever order callers happen to drop them, so
//! `vmzone_alloc_block`/`vmzone_free_block` only ever grow the cursor and
//! release physical memory one block at a time.

use kernel_config::memory::{self as cfg, PAGE_SIZE};
use memory_structs::{Frame, PhysicalAddress, VirtualAddress};
use page_table_entry::Provenance;
use spin::{Mutex, Once};

use crate::table::{self, MapFlags, PageTableOps, VmError};

bitflags! {
    /// Zone-kind flags from the layout table: how a zone may grow, and
    /// whether it has been wired into at least one address space yet.
    #[derive(Default)]
    pub struct ZoneKind: u8 {
        /// `vmzone_extend`/`vmzone_shrink` operate at a single bump cursor.
        const CONTIGUOUS  = 1 << 0;
        /// Backed by independently-placed pages (slabs, stacks); extend/shrink don't apply.
        const BLOCK       = 1 << 1;
        const ALLOW_EXECUTE = 1 << 2;
        /// Unmapped out of every address space but the kernel's own.
        const SENSITIVE   = 1 << 3;
        /// `vmspace_init` has linked this zone's P4 entry at least once.
        const INITIALIZED = 1 << 4;
    }
}

/// The five named zones of the layout table.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ZoneId {
    KernelHeap,
    KernelSlab,
    KernelStack,
    BuddyMem,
    UserShared,
}

const ZONE_IDS: [ZoneId; 5] = [ZoneId::KernelHeap, ZoneId::KernelSlab, ZoneId::KernelStack, ZoneId::BuddyMem, ZoneId::UserShared];

struct ZoneLayout {
    start: usize,
    size: usize,
    p4_index: usize,
    kind: ZoneKind,
}

fn layout_of(id: ZoneId) -> ZoneLayout {
    match id {
        ZoneId::KernelHeap => ZoneLayout {
            start: cfg::KERNEL_HEAP_START,
            size: cfg::KERNEL_HEAP_WINDOW_SIZE,
            p4_index: cfg::KERNEL_HEAP_P4_INDEX,
            kind: ZoneKind::from_bits_truncate(ZoneKind::CONTIGUOUS.bits() | ZoneKind::SENSITIVE.bits()),
        },
        ZoneId::KernelSlab => ZoneLayout {
            start: cfg::KERNEL_SLAB_START,
            size: cfg::KERNEL_SLAB_WINDOW_SIZE,
            p4_index: cfg::KERNEL_SLAB_P4_INDEX,
            kind: ZoneKind::from_bits_truncate(ZoneKind::BLOCK.bits() | ZoneKind::SENSITIVE.bits()),
        },
        ZoneId::KernelStack => ZoneLayout {
            start: cfg::KERNEL_STACK_START,
            size: cfg::KERNEL_STACK_WINDOW_SIZE,
            p4_index: cfg::KERNEL_STACK_P4_INDEX,
            kind: ZoneKind::BLOCK,
        },
        ZoneId::BuddyMem => ZoneLayout {
            start: cfg::BUDDY_MEM_START,
            size: cfg::BUDDY_MEM_WINDOW_SIZE,
            p4_index: cfg::BUDDY_MEM_P4_INDEX,
            kind: ZoneKind::CONTIGUOUS,
        },
        ZoneId::UserShared => ZoneLayout {
            start: cfg::USER_SHARED_START,
            size: cfg::USER_SHARED_WINDOW_SIZE,
            p4_index: cfg::USER_SHARED_P4_INDEX,
            kind: ZoneKind::from_bits_truncate(ZoneKind::BLOCK.bits() | ZoneKind::ALLOW_EXECUTE.bits()),
        },
    }
}

fn index_of(id: ZoneId) -> usize {
    ZONE_IDS.iter().position(|z| *z == id).expect("every ZoneId has a slot")
}

#[derive(Clone, Copy)]
struct ZoneState {
    /// Next free byte address, or 0 until the zone has extended at least once.
    cursor: usize,
    kind: ZoneKind,
    /// The physical PDPT shared by every address space this zone is linked into.
    shared_pdpt: Option<PhysicalAddress>,
}

impl ZoneState {
    const fn empty() -> ZoneState {
        ZoneState { cursor: 0, kind: ZoneKind::empty(), shared_pdpt: None }
    }
}

static ZONES: Mutex<[ZoneState; 5]> = Mutex::new([ZoneState::empty(); 5]);

/// Serializes whole `vmzone_extend`/`vmzone_shrink` calls against each
/// other. `ZONES` itself is only ever held for single-field reads/writes;
/// this is the lock that makes "read cursor, map pages, advance cursor"
/// atomic as a unit.
static ZONE_OP_LOCK: Mutex<()> = Mutex::new(());

/// The physical-block half of the decoupling, mirroring [`PageTableOps`]:
/// production code goes through the real buddy allocator, tests inject a
/// host-side stand-in (§9, "Bootstrapping cycle" applies here too — the
/// zone layer must not hard-wire `frame_allocator`'s global state into code
/// that also needs to run against a host-backed arena).
#[derive(Clone, Copy)]
pub struct ZoneOps {
    pub table: PageTableOps,
    pub alloc_block: fn(order: u8) -> Option<PhysicalAddress>,
    pub free_block: fn(base: PhysicalAddress, order: u8),
    pub shrink_block: fn(base: PhysicalAddress, order: u8, n: usize) -> Result<(), &'static str>,
}

impl ZoneOps {
    pub const fn production() -> ZoneOps {
        ZoneOps {
            table: PageTableOps::production(),
            alloc_block: frame_allocator::allocate_frames,
            free_block: frame_allocator::free_frames,
            shrink_block: frame_allocator::shrink_frames,
        }
    }
}

static KERNEL_OPS: ZoneOps = ZoneOps::production();
static KERNEL_PML4: Once<PhysicalAddress> = Once::new();

/// Splits `pages` into the descending run of power-of-two pieces a buddy
/// allocator would hand out for it, each capped at `2^MAX_ORDER`. Calls `f`
/// once per piece with `(page_offset_from_start, order)`, highest offset
/// last, mirroring the layout `shrink_frames` itself produces.
fn for_each_piece(mut pages: usize, mut f: impl FnMut(usize, u8)) {
    let mut offset = 0usize;
    while pages > 0 {
        let order = core::cmp::min(cfg::MAX_ORDER, (usize::BITS - 1 - pages.leading_zeros()) as u8);
        let piece = 1usize << order;
        f(offset, order);
        offset += piece;
        pages -= piece;
    }
}

/// Links `zone`'s P4 entry in the page table rooted at `pml4_root` to a
/// physical PDPT shared across every address space this zone is installed
/// into, allocating that PDPT on first use (§4.6, "vmspace_init").
fn link_zone(ops: &ZoneOps, pml4_root: PhysicalAddress, id: ZoneId, early: bool) -> Result<(), VmError> {
    let layout = layout_of(id);
    let mut zones = ZONES.lock();
    let state = &mut zones[index_of(id)];
    let pdpt_phys = match state.shared_pdpt {
        Some(phys) => phys,
        None => {
            let phys = ops.table.alloc_table_frame(early).ok_or(VmError::OutOfMemory)?;
            state.shared_pdpt = Some(phys);
            state.cursor = layout.start;
            state.kind = layout.kind;
            phys
        }
    };
    drop(zones);

    let root = unsafe { ops.table.table_at(pml4_root) };
    let entry = &mut root[layout.p4_index];
    if entry.frame().is_none() {
        let mut flags = entryflags_x86_64::EntryFlags::PRESENT | entryflags_x86_64::EntryFlags::WRITABLE;
        if layout.kind.contains(ZoneKind::ALLOW_EXECUTE) {
            flags |= entryflags_x86_64::EntryFlags::USER_ACCESSIBLE;
        }
        entry.set_with_provenance(Frame::containing_address(pdpt_phys), flags, Provenance::GLOBALLY_SHARED);
    }

    let mut zones = ZONES.lock();
    zones[index_of(id)].kind.insert(ZoneKind::INITIALIZED);
    Ok(())
}

/// Maps the first [`cfg::KERNEL_VMA_WINDOW_SIZE`] bytes of physical memory
/// at [`cfg::KERNEL_VMA`] using 2 MiB huge pages, the one-shot identity
/// window every later traversal in this crate relies on for dereferencing
/// page-table frames (§4.6, "vmspace_init").
fn install_kernel_vma_window(ops: &ZoneOps, pml4_root: PhysicalAddress, early: bool) -> Result<(), VmError> {
    const HUGE_PAGE_SIZE: usize = 2 * 1024 * 1024;
    let mut offset = 0usize;
    while offset < cfg::KERNEL_VMA_WINDOW_SIZE {
        let virt = VirtualAddress::new_canonical(cfg::KERNEL_VMA + offset);
        let pd_phys = table::ensure_child(&ops.table, pml4_root, virt, crate::translate::Level::P2, early)?;
        let table = unsafe { ops.table.table_at(pd_phys) };
        let idx = crate::translate::index_at(virt, crate::translate::Level::P2);
        let entry = &mut table[idx];
        if entry.frame().is_none() {
            let phys = PhysicalAddress::new_canonical(offset);
            let flags = entryflags_x86_64::EntryFlags::PRESENT
                | entryflags_x86_64::EntryFlags::WRITABLE
                | entryflags_x86_64::EntryFlags::HUGE_PAGE
                | entryflags_x86_64::EntryFlags::GLOBAL;
            entry.set(Frame::containing_address(phys), flags);
        }
        offset += HUGE_PAGE_SIZE;
    }
    Ok(())
}

fn vmspace_init_with(ops: &ZoneOps, pml4_root: PhysicalAddress, early: bool) -> Result<(), VmError> {
    install_kernel_vma_window(ops, pml4_root, early)?;
    for id in ZONE_IDS {
        link_zone(ops, pml4_root, id, early)?;
    }
    Ok(())
}

/// Installs the `KERNEL_VMA` identity window and links every named zone's
/// P4 entry into the page table rooted at `pml4_root` (§4.6, "vmspace_init").
/// The first address space to call this becomes the kernel's own, and is
/// the implicit target of [`vmzone_extend`]/[`vmzone_shrink`] thereafter.
pub fn vmspace_init(pml4_root: PhysicalAddress, early: bool) -> Result<(), VmError> {
    vmspace_init_with(&KERNEL_OPS, pml4_root, early)?;
    KERNEL_PML4.call_once(|| pml4_root);
    Ok(())
}

fn kernel_root() -> Result<PhysicalAddress, VmError> {
    KERNEL_PML4.get().copied().ok_or(VmError::Unmapped)
}

/// Adds `extra` to the provenance already recorded on the leaf entry for
/// `virt`, leaving its frame and flags untouched.
fn extend_leaf_provenance(ops: &PageTableOps, root: PhysicalAddress, virt: VirtualAddress, extra: Provenance) -> Result<(), VmError> {
    let pt_phys = table::ensure_child(ops, root, virt, crate::translate::Level::P1, false)?;
    let table = unsafe { ops.table_at(pt_phys) };
    let idx = crate::translate::index_at(virt, crate::translate::Level::P1);
    let entry = &mut table[idx];
    let current = entry.provenance();
    entry.set_provenance(current | extra);
    Ok(())
}

/// Maps one `for_each_piece` piece, splitting it at P1 (leaf page table)
/// boundaries first. A piece can be up to `2^MAX_ORDER` pages, but
/// `map_pages` refuses any single call whose range crosses a P1 boundary
/// (§4.6, "Map"); a zone's bump cursor has no reason to land on a
/// `cfg::ENTRIES_PER_PAGE_TABLE`-page boundary between extends, so a piece
/// straddling one is the common case, not the exception.
///
/// The piece is still one physically- and virtually-contiguous run even
/// when split across several `map_pages` calls, but `map_pages` only
/// threads `CONTIGUOUS_WITH_PREVIOUS`/`CONTIGUOUS_WITH_NEXT` within its own
/// call. The chunk boundaries are stitched by hand afterward so
/// `measure_run_ending_at`'s backward walk still sees one run spanning the
/// whole piece, not one run per chunk.
fn map_piece_in_p1_chunks(ops: &PageTableOps, root: PhysicalAddress, phys_base: PhysicalAddress, n_pages: usize, virt_base: VirtualAddress, flags: MapFlags) -> Result<(), VmError> {
    let mut mapped = 0usize;
    while mapped < n_pages {
        let virt = VirtualAddress::new_canonical(virt_base.value() + mapped * PAGE_SIZE);
        let page_in_p1 = (virt.value() / PAGE_SIZE) % cfg::ENTRIES_PER_PAGE_TABLE;
        let room_in_p1 = cfg::ENTRIES_PER_PAGE_TABLE - page_in_p1;
        let chunk = core::cmp::min(room_in_p1, n_pages - mapped);
        let phys = PhysicalAddress::new_canonical(phys_base.value() + mapped * PAGE_SIZE);
        table::map_pages(ops, root, phys, chunk, virt, flags, false)?;

        if mapped > 0 {
            extend_leaf_provenance(ops, root, virt, Provenance::CONTIGUOUS_WITH_PREVIOUS)?;
        }
        if mapped + chunk < n_pages {
            let last_virt = VirtualAddress::new_canonical(virt.value() + (chunk - 1) * PAGE_SIZE);
            extend_leaf_provenance(ops, root, last_virt, Provenance::CONTIGUOUS_WITH_NEXT)?;
        }

        mapped += chunk;
    }
    Ok(())
}

fn vmzone_extend_with(ops: &ZoneOps, root: PhysicalAddress, n_pages: usize, flags: MapFlags, zone: ZoneId) -> Result<VirtualAddress, VmError> {
    let _op_guard = ZONE_OP_LOCK.lock();
    let layout = layout_of(zone);
    if !layout.kind.contains(ZoneKind::CONTIGUOUS) {
        return Err(VmError::Contiguous);
    }
    let start_cursor = {
        let zones = ZONES.lock();
        zones[index_of(zone)].cursor
    };
    if start_cursor + n_pages * PAGE_SIZE > layout.start + layout.size {
        return Err(VmError::OutOfMemory);
    }

    let mut piece_err = None;
    let mut virt_cursor = start_cursor;
    for_each_piece(n_pages, |_offset, order| {
        if piece_err.is_some() {
            return;
        }
        let result = (|| {
            let base = (ops.alloc_block)(order).ok_or(VmError::OutOfMemory)?;
            map_piece_in_p1_chunks(&ops.table, root, base, 1usize << order, VirtualAddress::new_canonical(virt_cursor), flags)
        })();
        match result {
            Ok(()) => virt_cursor += (1usize << order) * PAGE_SIZE,
            Err(e) => piece_err = Some(e),
        }
    });
    if let Some(e) = piece_err {
        return Err(e);
    }

    ZONES.lock()[index_of(zone)].cursor = virt_cursor;
    Ok(VirtualAddress::new_canonical(start_cursor))
}

/// Extends `zone`'s bump cursor by `n_pages`, mapping freshly allocated
/// physical memory at the old cursor with `flags`, and returns the
/// virtual address the new region starts at (§4.6, "vmzone_extend").
///
/// `zone` must be [`ZoneKind::CONTIGUOUS`]; anything else fails with
/// [`VmError::Contiguous`].
pub fn vmzone_extend(n_pages: usize, flags: MapFlags, zone: ZoneId) -> Result<VirtualAddress, VmError> {
    let root = kernel_root()?;
    vmzone_extend_with(&KERNEL_OPS, root, n_pages, flags, zone)
}

/// The extent of the contiguous run of mapped pages ending (exclusive) at
/// `end`, found by walking provenance backwards while
/// `CONTIGUOUS_WITH_PREVIOUS` holds.
fn measure_run_ending_at(ops: &ZoneOps, root: PhysicalAddress, end: usize) -> (usize, usize) {
    let mut base = end;
    loop {
        let virt = VirtualAddress::new_canonical(base - PAGE_SIZE);
        let Some((_, provenance)) = table::leaf_entry(&ops.table, root, virt) else {
            break;
        };
        base -= PAGE_SIZE;
        if !provenance.contains(Provenance::CONTIGUOUS_WITH_PREVIOUS) {
            break;
        }
    }
    (base, (end - base) / PAGE_SIZE)
}

fn unmap_range(ops: &ZoneOps, root: PhysicalAddress, start: usize, pages: usize) {
    for i in 0..pages {
        table::unmap_one(&ops.table, root, VirtualAddress::new_canonical(start + i * PAGE_SIZE));
    }
}

fn vmzone_shrink_with(ops: &ZoneOps, root: PhysicalAddress, n_pages: usize, zone: ZoneId) -> Result<(), VmError> {
    let _op_guard = ZONE_OP_LOCK.lock();
    let layout = layout_of(zone);
    if !layout.kind.contains(ZoneKind::CONTIGUOUS) {
        return Err(VmError::Contiguous);
    }
    let cursor = {
        let zones = ZONES.lock();
        zones[index_of(zone)].cursor
    };
    if n_pages * PAGE_SIZE > cursor - layout.start {
        return Err(VmError::OutOfMemory);
    }

    let mut remaining = n_pages;
    let mut probe = cursor;
    while remaining > 0 {
        let (run_base, run_len) = measure_run_ending_at(ops, root, probe);
        let (base_frame, _) = table::leaf_entry(&ops.table, root, VirtualAddress::new_canonical(run_base)).ok_or(VmError::Unmapped)?;
        let order = run_len.trailing_zeros() as u8;
        if remaining >= run_len {
            unmap_range(ops, root, run_base, run_len);
            (ops.free_block)(base_frame.start_address(), order);
            probe = run_base;
            remaining -= run_len;
        } else {
            let kept = run_len - remaining;
            let removed_base = run_base + kept * PAGE_SIZE;
            unmap_range(ops, root, removed_base, remaining);
            (ops.shrink_block)(base_frame.start_address(), order, kept).map_err(|_| VmError::OutOfMemory)?;
            probe = removed_base;
            remaining = 0;
        }
    }

    ZONES.lock()[index_of(zone)].cursor = probe;
    Ok(())
}

/// Retreats `zone`'s bump cursor by `n_pages`, releasing the physical
/// memory behind them back to the buddy allocator (§4.6, "vmzone_shrink").
///
/// A run of mapped pages (one physically-contiguous piece from a prior
/// `vmzone_extend`) that falls entirely within the pages being released is
/// freed whole; a run straddling the boundary is trimmed in place with a
/// buddy shrink instead of freed, so only its tail is returned to the buddy.
pub fn vmzone_shrink(n_pages: usize, zone: ZoneId) -> Result<(), VmError> {
    let root = kernel_root()?;
    vmzone_shrink_with(&KERNEL_OPS, root, n_pages, zone)
}

fn vmzone_alloc_block_with(ops: &ZoneOps, root: PhysicalAddress, n_pages: usize, flags: MapFlags, zone: ZoneId) -> Result<VirtualAddress, VmError> {
    let _op_guard = ZONE_OP_LOCK.lock();
    let layout = layout_of(zone);
    if !layout.kind.contains(ZoneKind::BLOCK) {
        return Err(VmError::Contiguous);
    }
    let order = n_pages.next_power_of_two().trailing_zeros() as u8;
    if order > cfg::MAX_ORDER {
        return Err(VmError::OutOfMemory);
    }
    let piece = 1usize << order;
    let start_cursor = {
        let zones = ZONES.lock();
        zones[index_of(zone)].cursor
    };
    if start_cursor + piece * PAGE_SIZE > layout.start + layout.size {
        return Err(VmError::OutOfMemory);
    }

    let base = (ops.alloc_block)(order).ok_or(VmError::OutOfMemory)?;
    table::map_pages(&ops.table, root, base, piece, VirtualAddress::new_canonical(start_cursor), flags, false)?;
    ZONES.lock()[index_of(zone)].cursor = start_cursor + piece * PAGE_SIZE;
    Ok(VirtualAddress::new_canonical(start_cursor))
}

/// Allocates one block of `n_pages.next_power_of_two()` pages at `zone`'s
/// cursor and maps it with `flags`, returning its starting address. Unlike
/// `vmzone_extend`, the cursor only ever grows here: a block zone's blocks
/// (slabs, kernel stacks) are released individually by address rather than
/// in bulk off the cursor, so there is no backward walk to reclaim the
/// virtual range a freed block leaves behind — only its physical memory
/// goes back to the buddy.
///
/// `zone` must be [`ZoneKind::BLOCK`]; anything else fails with
/// [`VmError::Contiguous`].
pub fn vmzone_alloc_block(n_pages: usize, flags: MapFlags, zone: ZoneId) -> Result<VirtualAddress, VmError> {
    let root = kernel_root()?;
    vmzone_alloc_block_with(&KERNEL_OPS, root, n_pages, flags, zone)
}

fn vmzone_free_block_with(ops: &ZoneOps, root: PhysicalAddress, virt_base: VirtualAddress, n_pages: usize, zone: ZoneId) -> Result<(), VmError> {
    let _op_guard = ZONE_OP_LOCK.lock();
    let layout = layout_of(zone);
    if !layout.kind.contains(ZoneKind::BLOCK) {
        return Err(VmError::Contiguous);
    }
    let order = n_pages.next_power_of_two().trailing_zeros() as u8;
    let (base_frame, _) = table::leaf_entry(&ops.table, root, virt_base).ok_or(VmError::Unmapped)?;
    unmap_range(ops, root, virt_base.value(), 1usize << order);
    (ops.free_block)(base_frame.start_address(), order);
    Ok(())
}

/// Unmaps the block at `virt_base` (as returned by a prior
/// `vmzone_alloc_block` of the same `n_pages`) and frees its physical
/// memory back to the buddy allocator.
pub fn vmzone_free_block(virt_base: VirtualAddress, n_pages: usize, zone: ZoneId) -> Result<(), VmError> {
    let root = kernel_root()?;
    vmzone_free_block_with(&KERNEL_OPS, root, virt_base, n_pages, zone)
}

#[cfg(test)]
mod tests {
    use super::*;
    extern crate std;
    use std::alloc::{alloc_zeroed, dealloc, Layout};
    use std::sync::Mutex as StdMutex;

    // `ZONES` is a plain (resettable) global, unlike `frame_allocator`'s or
    // `page_metadata`'s `Once`-based singletons, so each test gets a clean
    // slate; this lock only serializes access to the shared host arena.
    static TEST_LOCK: StdMutex<()> = StdMutex::new(());

    struct Arena {
        base: *mut u8,
        len: usize,
        next_table_free: usize,
        next_block_free: usize,
    }
    unsafe impl Send for Arena {}
    static ARENA: StdMutex<Option<Arena>> = StdMutex::new(None);

    const ARENA_PAGES: usize = 1024;

    fn reset_zones() {
        let mut zones = ZONES.lock();
        for z in zones.iter_mut() {
            *z = ZoneState::empty();
        }
    }

    fn test_mapper(phys: PhysicalAddress) -> Option<usize> {
        let guard = ARENA.lock().unwrap();
        let arena = guard.as_ref()?;
        if phys.value() < arena.len {
            Some(arena.base as usize + phys.value())
        } else {
            None
        }
    }

    fn test_alloc_frame(_early: bool) -> Option<PhysicalAddress> {
        let mut guard = ARENA.lock().unwrap();
        let arena = guard.as_mut()?;
        if arena.next_table_free + PAGE_SIZE > arena.next_block_free {
            return None;
        }
        let addr = arena.next_table_free;
        arena.next_table_free += PAGE_SIZE;
        Some(PhysicalAddress::new_canonical(addr))
    }

    fn test_alloc_block(order: u8) -> Option<PhysicalAddress> {
        let mut guard = ARENA.lock().unwrap();
        let arena = guard.as_mut()?;
        let size = PAGE_SIZE << order;
        let aligned = (arena.next_block_free + size - 1) & !(size - 1);
        if aligned + size > arena.len {
            return None;
        }
        arena.next_block_free = aligned + size;
        Some(PhysicalAddress::new_canonical(aligned))
    }

    fn test_free_block(_base: PhysicalAddress, _order: u8) {}
    fn test_shrink_block(_base: PhysicalAddress, _order: u8, _n: usize) -> Result<(), &'static str> {
        Ok(())
    }

    /// A host-backed arena standing in for physical memory, split into a
    /// low region for page-table frames and a high region for zone data
    /// blocks so the two allocators (`PageTableOps::alloc_frame` and
    /// `ZoneOps::alloc_block`) never hand out overlapping addresses.
    fn with_harness<R>(f: impl FnOnce(&ZoneOps, PhysicalAddress) -> R) -> R {
        let _guard = TEST_LOCK.lock().unwrap();
        reset_zones();
        let layout = Layout::from_size_align(ARENA_PAGES * PAGE_SIZE, PAGE_SIZE).unwrap();
        let base = unsafe { alloc_zeroed(layout) };
        *ARENA.lock().unwrap() = Some(Arena { base, len: ARENA_PAGES * PAGE_SIZE, next_table_free: PAGE_SIZE, next_block_free: 512 * PAGE_SIZE });

        let ops = ZoneOps {
            table: PageTableOps { mapper: test_mapper, alloc_frame: test_alloc_frame },
            alloc_block: test_alloc_block,
            free_block: test_free_block,
            shrink_block: test_shrink_block,
        };
        let root = PhysicalAddress::new_canonical(0);
        let result = f(&ops, root);

        let arena = ARENA.lock().unwrap().take().unwrap();
        unsafe { dealloc(arena.base, layout) };
        result
    }

    #[test]
    fn extend_returns_the_zone_start_and_advances_the_cursor() {
        with_harness(|ops, root| {
            vmspace_init_with(ops, root, true).unwrap();
            let a = vmzone_extend_with(ops, root, 4, MapFlags::WRITABLE, ZoneId::KernelHeap).unwrap();
            assert_eq!(a.value(), cfg::KERNEL_HEAP_START);
            let b = vmzone_extend_with(ops, root, 4, MapFlags::WRITABLE, ZoneId::KernelHeap).unwrap();
            assert_eq!(b.value(), cfg::KERNEL_HEAP_START + 4 * PAGE_SIZE);
        });
    }

    #[test]
    fn extend_past_the_zone_window_fails_out_of_memory() {
        with_harness(|ops, root| {
            vmspace_init_with(ops, root, true).unwrap();
            let err = vmzone_extend_with(ops, root, cfg::KERNEL_HEAP_WINDOW_SIZE / PAGE_SIZE + 1, MapFlags::WRITABLE, ZoneId::KernelHeap).unwrap_err();
            assert_eq!(err, VmError::OutOfMemory);
        });
    }

    #[test]
    fn extend_on_a_block_zone_fails_contiguous() {
        with_harness(|ops, root| {
            vmspace_init_with(ops, root, true).unwrap();
            let err = vmzone_extend_with(ops, root, 1, MapFlags::WRITABLE, ZoneId::KernelStack).unwrap_err();
            assert_eq!(err, VmError::Contiguous);
        });
    }

    #[test]
    fn shrinking_the_entire_zone_unmaps_every_page() {
        with_harness(|ops, root| {
            vmspace_init_with(ops, root, true).unwrap();
            vmzone_extend_with(ops, root, 8, MapFlags::WRITABLE, ZoneId::BuddyMem).unwrap();
            vmzone_shrink_with(ops, root, 8, ZoneId::BuddyMem).unwrap();
            for i in 0..8 {
                let virt = VirtualAddress::new_canonical(cfg::BUDDY_MEM_START + i * PAGE_SIZE);
                assert!(table::leaf_entry(&ops.table, root, virt).is_none());
            }
            assert_eq!(ZONES.lock()[index_of(ZoneId::BuddyMem)].cursor, cfg::BUDDY_MEM_START);
        });
    }

    /// Two 64-page extends followed by a 72-page shrink: the second
    /// (most recent) allocation is freed whole, and the first is
    /// trimmed in place down to its leading 56 pages.
    #[test]
    fn shrink_crossing_an_allocation_boundary_frees_one_and_trims_the_other() {
        with_harness(|ops, root| {
            vmspace_init_with(ops, root, true).unwrap();
            vmzone_extend_with(ops, root, 64, MapFlags::WRITABLE, ZoneId::KernelHeap).unwrap();
            vmzone_extend_with(ops, root, 64, MapFlags::WRITABLE, ZoneId::KernelHeap).unwrap();
            vmzone_shrink_with(ops, root, 72, ZoneId::KernelHeap).unwrap();

            for i in 0..56 {
                let virt = VirtualAddress::new_canonical(cfg::KERNEL_HEAP_START + i * PAGE_SIZE);
                assert!(table::leaf_entry(&ops.table, root, virt).is_some(), "page {i} should still be mapped");
            }
            for i in 56..128 {
                let virt = VirtualAddress::new_canonical(cfg::KERNEL_HEAP_START + i * PAGE_SIZE);
                assert!(table::leaf_entry(&ops.table, root, virt).is_none(), "page {i} should have been unmapped");
            }
            assert_eq!(ZONES.lock()[index_of(ZoneId::KernelHeap)].cursor, cfg::KERNEL_HEAP_START + 56 * PAGE_SIZE);
        });
    }

    #[test]
    fn shrink_past_the_live_cursor_fails_out_of_memory() {
        with_harness(|ops, root| {
            vmspace_init_with(ops, root, true).unwrap();
            vmzone_extend_with(ops, root, 4, MapFlags::WRITABLE, ZoneId::KernelHeap).unwrap();
            let err = vmzone_shrink_with(ops, root, 5, ZoneId::KernelHeap).unwrap_err();
            assert_eq!(err, VmError::OutOfMemory);
        });
    }

    #[test]
    fn alloc_block_rounds_up_and_advances_the_cursor() {
        with_harness(|ops, root| {
            vmspace_init_with(ops, root, true).unwrap();
            let a = vmzone_alloc_block_with(ops, root, 2, MapFlags::WRITABLE, ZoneId::KernelSlab).unwrap();
            assert_eq!(a.value(), cfg::KERNEL_SLAB_START);
            // 3 pages rounds up to a 4-page block.
            let b = vmzone_alloc_block_with(ops, root, 3, MapFlags::WRITABLE, ZoneId::KernelSlab).unwrap();
            assert_eq!(b.value(), cfg::KERNEL_SLAB_START + 2 * PAGE_SIZE);
            assert_eq!(ZONES.lock()[index_of(ZoneId::KernelSlab)].cursor, cfg::KERNEL_SLAB_START + 6 * PAGE_SIZE);
        });
    }

    #[test]
    fn alloc_block_on_a_contiguous_zone_fails_contiguous() {
        with_harness(|ops, root| {
            vmspace_init_with(ops, root, true).unwrap();
            let err = vmzone_alloc_block_with(ops, root, 1, MapFlags::WRITABLE, ZoneId::KernelHeap).unwrap_err();
            assert_eq!(err, VmError::Contiguous);
        });
    }

    #[test]
    fn free_block_unmaps_without_disturbing_the_cursor() {
        with_harness(|ops, root| {
            vmspace_init_with(ops, root, true).unwrap();
            let a = vmzone_alloc_block_with(ops, root, 2, MapFlags::WRITABLE, ZoneId::KernelSlab).unwrap();
            let cursor_before = ZONES.lock()[index_of(ZoneId::KernelSlab)].cursor;
            vmzone_free_block_with(ops, root, a, 2, ZoneId::KernelSlab).unwrap();
            assert!(table::leaf_entry(&ops.table, root, a).is_none());
            assert_eq!(ZONES.lock()[index_of(ZoneId::KernelSlab)].cursor, cursor_before);
        });
    }
}
