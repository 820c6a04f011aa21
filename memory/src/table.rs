//! Page-table traversal, allocate-or-traverse, and the `Map` operation (§4.6).

use entryflags_x86_64::EntryFlags;
use kernel_config::memory::{phys_to_kvirt, PAGE_SIZE};
use log::trace;
use memory_structs::{Frame, PhysicalAddress, VirtualAddress};
use page_table_entry::{Provenance, Table};
use x86_64::{instructions::tlb, VirtAddr};

use crate::translate::{self, Level};

bitflags! {
    /// Requested mapping permissions, translated into hardware [`EntryFlags`]
    /// at the leaf entry (§4.6, "Map").
    #[derive(Default)]
    pub struct MapFlags: u8 {
        const WRITABLE     = 1 << 0;
        const USER         = 1 << 1;
        const EXECUTABLE   = 1 << 2;
        const HUGE_PAGE    = 1 << 3;
        /// Emit one extra read-only guard entry past the end of the mapping.
        const WRITE_GUARD  = 1 << 4;
    }
}

/// The typed VM error codes of §6. `OK = 0` is represented by `Result::Ok`
/// rather than a constructible variant here. [`VmError::OutOfMemory`] is an
/// addition beyond the six wire values of §6's table: it gives every
/// fallible operation in this crate one shared error type instead of
/// splitting callers between `Result<_, VmError>` and `Result<_, &'static str>`.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u32)]
pub enum VmError {
    Unmapped = 1,
    Privilege = 2,
    Boundary = 3,
    AlreadyMapped = 4,
    Contiguous = 5,
    OutOfMemory = 6,
}

impl VmError {
    /// The numeric discriminant, matching §6's table for variants 1-5.
    pub fn code(self) -> u32 {
        self as u32
    }
}

/// Translates a page-table physical address into something dereferenceable,
/// and obtains a fresh zeroed page-table frame. Production code goes through
/// the low-2GiB identity window and the region reserver/buddy allocator;
/// host-side tests inject a backing arena instead, the same way
/// `frame_allocator`'s buddy decouples from `region_reserver`'s global state
/// for its own tests.
#[derive(Clone, Copy)]
pub struct PageTableOps {
    pub mapper: fn(PhysicalAddress) -> Option<usize>,
    pub alloc_frame: fn(early: bool) -> Option<PhysicalAddress>,
}

fn production_mapper(phys: PhysicalAddress) -> Option<usize> {
    phys_to_kvirt(phys.value())
}

fn production_alloc_frame(early: bool) -> Option<PhysicalAddress> {
    if early {
        region_reserver::reserve(1)
    } else {
        frame_allocator::allocate_frames(0)
    }
}

impl PageTableOps {
    /// The real, boot-time implementation: the low-2GiB identity window for
    /// access, the region reserver or buddy allocator for fresh tables.
    pub const fn production() -> PageTableOps {
        PageTableOps { mapper: production_mapper, alloc_frame: production_alloc_frame }
    }

    /// Reinterprets the page-table frame at `phys` as a `Table`.
    ///
    /// # Safety
    /// `phys` must be the physical address of a page exclusively used as a
    /// page table for as long as the returned reference is live.
    pub(crate) unsafe fn table_at(&self, phys: PhysicalAddress) -> &'static mut Table {
        let virt = (self.mapper)(phys).expect("page table frame outside the addressable window");
        &mut *(virt as *mut Table)
    }

    pub(crate) fn alloc_table_frame(&self, early: bool) -> Option<PhysicalAddress> {
        let base = (self.alloc_frame)(early)?;
        let virt = (self.mapper)(base)?;
        unsafe {
            core::ptr::write_bytes(virt as *mut u8, 0, PAGE_SIZE);
        }
        Some(base)
    }
}

/// True iff a present entry with `actual` flags satisfies a `requested` access.
fn permissions_compatible(actual: EntryFlags, requested: MapFlags) -> bool {
    if requested.contains(MapFlags::WRITABLE) && !actual.is_writable() {
        return false;
    }
    if requested.contains(MapFlags::USER) && !actual.contains(EntryFlags::USER_ACCESSIBLE) {
        return false;
    }
    true
}

fn entry_flags_for(flags: MapFlags) -> EntryFlags {
    let mut f = EntryFlags::PRESENT;
    if flags.contains(MapFlags::WRITABLE) {
        f |= EntryFlags::WRITABLE;
    }
    if flags.contains(MapFlags::USER) {
        f |= EntryFlags::USER_ACCESSIBLE;
    }
    if flags.contains(MapFlags::HUGE_PAGE) {
        f |= EntryFlags::HUGE_PAGE;
    }
    if !flags.contains(MapFlags::EXECUTABLE) {
        f |= EntryFlags::NO_EXECUTE;
    }
    f
}

/// Walks from the table at `root` down to (and including) `target`, checking
/// presence and `requested` permission compatibility at every intermediate
/// level. On success, returns the physical address the entry at `target`
/// points to. On failure, reports the level at which the walk stopped and
/// why (§4.6, "Traversal primitive").
pub fn traverse(ops: &PageTableOps, root: PhysicalAddress, virt: VirtualAddress, target: Level, requested: MapFlags) -> Result<PhysicalAddress, (Level, VmError)> {
    let mut table_phys = root;
    let mut level = Level::P4;
    loop {
        let table = unsafe { ops.table_at(table_phys) };
        let idx = translate::index_at(virt, level);
        let entry = &table[idx];
        let Some(frame) = entry.frame() else {
            return Err((level, VmError::Unmapped));
        };
        if !permissions_compatible(entry.flags(), requested) {
            return Err((level, VmError::Privilege));
        }
        if level == target {
            return Ok(frame.start_address());
        }
        table_phys = frame.start_address();
        level = level.next().expect("walked past P1 before reaching target level");
    }
}

/// Allocate-or-traverse (§4.6): walks from `root` to the table one level
/// above `level`, then ensures the entry for `virt` at `level` points at a
/// table, allocating and linking a fresh one if it was unmapped. Returns
/// the physical address of the table at `level`.
///
/// Each freshly allocated table's provenance records whether it came from
/// the region reserver (`early`), so a future teardown never tries to
/// return region-reserved memory to the buddy (§9, "Bootstrapping cycle").
pub fn ensure_child(ops: &PageTableOps, root: PhysicalAddress, virt: VirtualAddress, level: Level, early: bool) -> Result<PhysicalAddress, VmError> {
    let mut table_phys = root;
    let mut current = Level::P4;
    while current != level {
        let table = unsafe { ops.table_at(table_phys) };
        let idx = translate::index_at(virt, current);
        let entry = &mut table[idx];
        table_phys = match entry.frame() {
            Some(frame) => frame.start_address(),
            None => {
                let new_frame = ops.alloc_table_frame(early).ok_or(VmError::OutOfMemory)?;
                let provenance = if early { Provenance::REGION_RESERVED } else { Provenance::empty() };
                entry.set_with_provenance(
                    Frame::containing_address(new_frame),
                    EntryFlags::PRESENT | EntryFlags::WRITABLE | EntryFlags::USER_ACCESSIBLE,
                    provenance,
                );
                trace!("memory: allocated a level-{:?} page table at {:?} (early={})", current, new_frame, early);
                new_frame
            }
        };
        current = current.next().expect("walked past P1 while descending to a child level");
    }
    Ok(table_phys)
}

fn flush(virt: VirtualAddress) {
    tlb::flush(VirtAddr::new(virt.value() as u64));
}

/// The physical address of the PML4 the CPU is currently using, read out of
/// `CR3`. Paging is already active by the time any Rust code runs (the
/// bootloader's assembly stub sets up an initial page table), so this is the
/// root `vmspace_init` links the named zones into rather than one the kernel
/// allocates itself.
pub fn current_pml4_root() -> PhysicalAddress {
    let (frame, _flags) = x86_64::registers::control::Cr3::read();
    PhysicalAddress::new_canonical(frame.start_address().as_u64() as usize)
}

/// `Map(phys_base, n_pages, virt_base, flags)` (§4.6): maps `n_pages`
/// physically-contiguous pages starting at `phys_base` to the `n_pages`
/// virtually-contiguous pages starting at `virt_base`. The whole range must
/// fall within a single leaf (P1) page table, else this fails with
/// [`VmError::Boundary`] without mapping anything.
pub fn map_pages(ops: &PageTableOps, root: PhysicalAddress, phys_base: PhysicalAddress, n_pages: usize, virt_base: VirtualAddress, flags: MapFlags, early: bool) -> Result<(), VmError> {
    if n_pages == 0 {
        return Ok(());
    }
    let first = translate::decompose(virt_base);
    let last_addr = VirtualAddress::new_canonical(virt_base.value() + (n_pages - 1) * PAGE_SIZE);
    let last = translate::decompose(last_addr);
    if (first.p4, first.p3, first.p2) != (last.p4, last.p3, last.p2) {
        return Err(VmError::Boundary);
    }

    let pt_phys = ensure_child(ops, root, virt_base, Level::P1, early)?;
    let entry_flags = entry_flags_for(flags);

    for i in 0..n_pages {
        let virt = VirtualAddress::new_canonical(virt_base.value() + i * PAGE_SIZE);
        let phys = PhysicalAddress::new_canonical(phys_base.value() + i * PAGE_SIZE);
        let table = unsafe { ops.table_at(pt_phys) };
        let idx = translate::index_at(virt, Level::P1);
        let entry = &mut table[idx];
        if entry.frame().is_some() {
            return Err(VmError::AlreadyMapped);
        }
        let mut provenance = Provenance::empty();
        if i > 0 {
            provenance |= Provenance::CONTIGUOUS_WITH_PREVIOUS;
        }
        if i + 1 < n_pages {
            provenance |= Provenance::CONTIGUOUS_WITH_NEXT;
        }
        entry.set_with_provenance(Frame::containing_address(phys), entry_flags, provenance);
        flush(virt);
    }

    if flags.contains(MapFlags::WRITE_GUARD) {
        let guard_virt = VirtualAddress::new_canonical(virt_base.value() + n_pages * PAGE_SIZE);
        let guard_first = translate::decompose(guard_virt);
        if (guard_first.p4, guard_first.p3, guard_first.p2) == (first.p4, first.p3, first.p2) {
            let guard_phys = PhysicalAddress::new_canonical(phys_base.value() + (n_pages - 1) * PAGE_SIZE);
            let table = unsafe { ops.table_at(pt_phys) };
            let idx = translate::index_at(guard_virt, Level::P1);
            let entry = &mut table[idx];
            if entry.frame().is_none() {
                entry.set(Frame::containing_address(guard_phys), EntryFlags::PRESENT);
                flush(guard_virt);
            }
        }
    }

    Ok(())
}

/// Looks up the leaf (P1) entry mapping `virt`, if any, without checking permissions.
pub fn leaf_entry(ops: &PageTableOps, root: PhysicalAddress, virt: VirtualAddress) -> Option<(Frame, Provenance)> {
    let pt_phys = traverse(ops, root, virt, Level::P2, MapFlags::empty()).ok()?;
    let table = unsafe { ops.table_at(pt_phys) };
    let entry = &table[translate::index_at(virt, Level::P1)];
    entry.frame().map(|f| (f, entry.provenance()))
}

/// Clears the leaf entry mapping `virt` (unsets `PRESENT` and provenance) and flushes the TLB.
pub fn unmap_one(ops: &PageTableOps, root: PhysicalAddress, virt: VirtualAddress) {
    if let Ok(pt_phys) = traverse(ops, root, virt, Level::P2, MapFlags::empty()) {
        let table = unsafe { ops.table_at(pt_phys) };
        let entry = &mut table[translate::index_at(virt, Level::P1)];
        entry.set_unused();
        flush(virt);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    extern crate std;
    use std::alloc::{alloc_zeroed, dealloc, Layout};
    use std::sync::Mutex as StdMutex;

    /// A host-backed arena standing in for physical memory: "physical
    /// addresses" in these tests are simply byte offsets into it, and the
    /// injected mapper resolves them to real host pointers.
    struct Arena {
        base: *mut u8,
        len: usize,
        next_free: usize,
    }
    unsafe impl Send for Arena {}

    static ARENA: StdMutex<Option<Arena>> = StdMutex::new(None);

    const ARENA_PAGES: usize = 64;

    fn with_arena<R>(f: impl FnOnce(&PageTableOps) -> R) -> R {
        let layout = Layout::from_size_align(ARENA_PAGES * PAGE_SIZE, PAGE_SIZE).unwrap();
        let base = unsafe { alloc_zeroed(layout) };
        *ARENA.lock().unwrap() = Some(Arena { base, len: ARENA_PAGES * PAGE_SIZE, next_free: PAGE_SIZE });

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
            if arena.next_free + PAGE_SIZE > arena.len {
                return None;
            }
            let addr = arena.next_free;
            arena.next_free += PAGE_SIZE;
            Some(PhysicalAddress::new_canonical(addr))
        }

        let ops = PageTableOps { mapper: test_mapper, alloc_frame: test_alloc_frame };
        let result = f(&ops);

        let arena = ARENA.lock().unwrap().take().unwrap();
        unsafe { dealloc(arena.base, layout) };
        result
    }

    fn root_addr() -> PhysicalAddress {
        PhysicalAddress::new_canonical(0)
    }

    #[test]
    fn unmapped_root_entry_fails_at_p4() {
        with_arena(|ops| {
            let virt = VirtualAddress::new_canonical(kernel_config::memory::KERNEL_HEAP_START);
            let err = traverse(ops, root_addr(), virt, Level::P1, MapFlags::empty()).unwrap_err();
            assert_eq!(err, (Level::P4, VmError::Unmapped));
        });
    }

    #[test]
    fn ensure_child_then_traverse_to_p1_succeeds() {
        with_arena(|ops| {
            let virt = VirtualAddress::new_canonical(kernel_config::memory::KERNEL_HEAP_START);
            let pt_phys = ensure_child(ops, root_addr(), virt, Level::P1, true).unwrap();
            let found = traverse(ops, root_addr(), virt, Level::P1, MapFlags::empty()).unwrap();
            assert_eq!(found, pt_phys);
        });
    }

    #[test]
    fn mapping_crossing_a_pt_boundary_fails_as_boundary() {
        with_arena(|ops| {
            let virt = VirtualAddress::new_canonical(kernel_config::memory::KERNEL_HEAP_START + 511 * PAGE_SIZE);
            let phys = PhysicalAddress::new_canonical(8 * PAGE_SIZE);
            let err = map_pages(ops, root_addr(), phys, 2, virt, MapFlags::WRITABLE, true).unwrap_err();
            assert_eq!(err, VmError::Boundary);
        });
    }

    #[test]
    fn mapping_then_traversal_yields_requested_frame() {
        with_arena(|ops| {
            let virt = VirtualAddress::new_canonical(kernel_config::memory::KERNEL_HEAP_START);
            let phys = PhysicalAddress::new_canonical(8 * PAGE_SIZE);
            map_pages(ops, root_addr(), phys, 4, virt, MapFlags::WRITABLE, true).unwrap();
            for i in 0..4 {
                let v = VirtualAddress::new_canonical(virt.value() + i * PAGE_SIZE);
                let found = traverse(ops, root_addr(), v, Level::P1, MapFlags::WRITABLE).unwrap();
                assert_eq!(found.value(), phys.value() + i * PAGE_SIZE);
            }
        });
    }

    #[test]
    fn remapping_an_already_present_page_fails() {
        with_arena(|ops| {
            let virt = VirtualAddress::new_canonical(kernel_config::memory::KERNEL_HEAP_START);
            let phys = PhysicalAddress::new_canonical(8 * PAGE_SIZE);
            map_pages(ops, root_addr(), phys, 1, virt, MapFlags::WRITABLE, true).unwrap();
            let err = map_pages(ops, root_addr(), phys, 1, virt, MapFlags::WRITABLE, true).unwrap_err();
            assert_eq!(err, VmError::AlreadyMapped);
        });
    }

    #[test]
    fn requesting_write_on_a_read_only_mapping_fails_privilege() {
        with_arena(|ops| {
            let virt = VirtualAddress::new_canonical(kernel_config::memory::KERNEL_HEAP_START);
            let phys = PhysicalAddress::new_canonical(8 * PAGE_SIZE);
            map_pages(ops, root_addr(), phys, 1, virt, MapFlags::empty(), true).unwrap();
            let err = traverse(ops, root_addr(), virt, Level::P1, MapFlags::WRITABLE).unwrap_err();
            assert_eq!(err, (Level::P1, VmError::Privilege));
        });
    }
}
