//! The per-physical-page metadata table (§4.2): one record per physical
//! page, tracking flags, a reference count, and a role-specific payload.
//!
//! The table itself lives in memory the bootstrap process has already made
//! accessible (identity-mapped or carved out of the kernel's own data
//! section) and hands to [`init`] as a raw slice; this crate never maps
//! anything itself. Every mutation of a record's flags or reference count
//! goes through lock-free atomics so that interrupt handlers can safely drop
//! a reference to a page without taking any lock (§5).

#![no_std]

#[macro_use]
extern crate bitflags;

use core::sync::atomic::{AtomicU8, AtomicU16, AtomicU32, Ordering};
use kernel_config::memory::PAGE_SIZE;
use log::{trace, warn};
use memory_structs::{Frame, PhysicalAddress};
use spin::Once;

bitflags! {
    /// The flag set carried by every page-metadata record (§3).
    #[derive(Default)]
    pub struct PageFlags: u16 {
        /// Page 0, or any page inside a non-usable boot memory region.
        const UNUSABLE        = 1 << 0;
        /// Part of the kernel image or the page-metadata table itself.
        const KERNEL          = 1 << 1;
        /// Part of the kernel's read-only section; implies [`PageFlags::KERNEL`].
        const READ_ONLY       = 1 << 2;
        /// Managed by the buddy allocator: `link`/`order` carry buddy bookkeeping.
        const BUDDY_MANAGED   = 1 << 3;
        /// Threaded onto the single-page freelist (§4.7): `link` is the next pointer.
        const FREELIST_MANAGED = 1 << 4;
        /// This page is the base of its buddy block: `link` is the block's
        /// remaining live-page count rather than a back-pointer.
        const BLOCK_BASE      = 1 << 5;
    }
}

/// Sentinel frame number meaning "no next page" in a freelist chain.
const FREELIST_NULL: u32 = u32::MAX;

/// One per-physical-page record.
///
/// `link` and `order` are a tagged payload whose interpretation depends on
/// `flags` and, for buddy-managed pages, on whether this page *is* a block's
/// base:
/// * freelist-managed: `link` is the next page's frame number (or
///   [`FREELIST_NULL`]).
/// * buddy-managed, base page: `link` is the block's remaining live-page
///   count (the "free count for the base" of §3); `order` is the block's
///   order.
/// * buddy-managed, non-base page: `link` is the frame number of the
///   block's base page.
pub struct PageRecord {
    flags: AtomicU16,
    refcount: AtomicU16,
    link: AtomicU32,
    order: AtomicU8,
}

impl PageRecord {
    const fn zeroed() -> PageRecord {
        PageRecord {
            flags: AtomicU16::new(0),
            refcount: AtomicU16::new(0),
            link: AtomicU32::new(0),
            order: AtomicU8::new(0),
        }
    }

    pub fn flags(&self) -> PageFlags {
        PageFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    pub fn reference_count(&self) -> u16 {
        self.refcount.load(Ordering::Acquire)
    }
}

/// The process-wide page-metadata table, backed by caller-supplied memory.
struct Table {
    records: &'static [PageRecord],
}

static TABLE: Once<Table> = Once::new();

/// A function invoked by [`drop_page_reference`] when a buddy-managed
/// block's live-page count reaches zero, so the block can be returned to
/// the buddy allocator. Registered by `frame_allocator` at its own `init`
/// time, breaking what would otherwise be a circular crate dependency
/// between the two allocators (§9, "Bootstrapping cycle").
static BUDDY_FREE_CALLBACK: Once<fn(PhysicalAddress, u8)> = Once::new();

/// Registers the callback that [`drop_page_reference`] invokes to return a
/// fully-dereferenced buddy block to the buddy allocator. Idempotent: only
/// the first registration takes effect.
pub fn register_buddy_free_callback(callback: fn(PhysicalAddress, u8)) {
    BUDDY_FREE_CALLBACK.call_once(|| callback);
}

/// Initializes the page-metadata table over `table_memory`, which must be
/// large enough to hold one [`PageRecord`] per frame in `[0, num_frames)`
/// and must not be used for anything else afterwards.
///
/// Marks page 0 unusable (§4.2: "address 0 is reserved for null"), then
/// invokes `is_usable` and `kernel_range` to classify the rest: every frame
/// outside a usable region is marked [`PageFlags::UNUSABLE`]; every frame
/// from the kernel image's start through the end of the metadata table
/// itself is marked [`PageFlags::KERNEL`], additionally
/// [`PageFlags::READ_ONLY`] if `is_read_only` says so.
///
/// # Safety
/// `table_memory` must point to at least `num_frames * size_of::<PageRecord>()`
/// bytes of memory that are valid for `'static` writes and not aliased
/// elsewhere.
pub unsafe fn init(
    table_memory: *mut PageRecord,
    num_frames: usize,
    kernel_start: PhysicalAddress,
    kernel_and_table_end: PhysicalAddress,
    is_usable: impl Fn(usize) -> bool,
    is_read_only: impl Fn(usize) -> bool,
) -> Result<(), &'static str> {
    if TABLE.is_completed() {
        return Err("page_metadata: already initialized");
    }

    let records = core::slice::from_raw_parts_mut(table_memory, num_frames);
    for record in records.iter_mut() {
        *record = PageRecord::zeroed();
    }

    if num_frames > 0 {
        records[0].flags.store(PageFlags::UNUSABLE.bits(), Ordering::Relaxed);
    }

    let kernel_start_frame = kernel_start.value() / PAGE_SIZE;
    let kernel_end_frame = (kernel_and_table_end.value() + PAGE_SIZE - 1) / PAGE_SIZE;

    for (frame_number, record) in records.iter_mut().enumerate() {
        if frame_number != 0 && !is_usable(frame_number) {
            record.flags.store(PageFlags::UNUSABLE.bits(), Ordering::Relaxed);
            continue;
        }
        if frame_number >= kernel_start_frame && frame_number < kernel_end_frame {
            let mut flags = PageFlags::KERNEL;
            if is_read_only(frame_number) {
                flags |= PageFlags::READ_ONLY;
            }
            record.flags.store(flags.bits(), Ordering::Relaxed);
        }
    }

    TABLE.call_once(|| Table { records });
    trace!("page_metadata: initialized table for {} frame(s)", num_frames);
    Ok(())
}

fn table() -> &'static [PageRecord] {
    TABLE.get().map(|t| t.records).unwrap_or(&[])
}

/// Returns the record for `frame`, if it falls within the initialized table.
pub fn page_record(frame: Frame) -> Option<&'static PageRecord> {
    table().get(frame.number())
}

/// ORs `mask` into the flags of `frame`'s record, retrying on a concurrent
/// collision. Infallible: out-of-range frames are silently ignored (§4.2).
pub fn set_page_flags(frame: Frame, mask: PageFlags) {
    let Some(record) = page_record(frame) else { return };
    let mut current = record.flags.load(Ordering::Relaxed);
    loop {
        let new = current | mask.bits();
        match record.flags.compare_exchange_weak(current, new, Ordering::AcqRel, Ordering::Relaxed) {
            Ok(_) => return,
            Err(observed) => current = observed,
        }
    }
}

/// ANDs `!mask` into the flags of `frame`'s record, retrying on a
/// concurrent collision.
pub fn unset_page_flags(frame: Frame, mask: PageFlags) {
    let Some(record) = page_record(frame) else { return };
    let mut current = record.flags.load(Ordering::Relaxed);
    loop {
        let new = current & !mask.bits();
        match record.flags.compare_exchange_weak(current, new, Ordering::AcqRel, Ordering::Relaxed) {
            Ok(_) => return,
            Err(observed) => current = observed,
        }
    }
}

/// Atomically increments `frame`'s reference count and returns the new value.
pub fn reference_page(frame: Frame) -> u16 {
    match page_record(frame) {
        Some(record) => record.refcount.fetch_add(1, Ordering::AcqRel) + 1,
        None => 0,
    }
}

/// Marks `base` (a buddy block's base page, of the given `order`) as
/// buddy-managed, with `live_pages` references outstanding across the
/// block. Called by `frame_allocator` once per freshly-handed-out block.
pub fn init_buddy_block(base: Frame, order: u8, live_pages: u16) {
    let Some(record) = page_record(base) else { return };
    record.order.store(order, Ordering::Relaxed);
    record.link.store(live_pages as u32, Ordering::Relaxed);
    set_page_flags(base, PageFlags::BUDDY_MANAGED | PageFlags::BLOCK_BASE);
    let mut i = 1usize;
    while i < (1usize << order) {
        if let Some(member) = page_record(base + i) {
            member.link.store(base.number() as u32, Ordering::Relaxed);
            set_page_flags(base + i, PageFlags::BUDDY_MANAGED);
        }
        i += 1;
    }
}

/// Atomically decrements `frame`'s reference count. If `frame` is
/// buddy-managed and its reference count reaches zero, decrements the
/// block's base-page live-count; once that reaches zero, invokes the
/// registered buddy-free callback with the block's base address and order
/// (§9: resolves the "TODO: actually free the block" open question).
pub fn drop_page_reference(frame: Frame) -> u16 {
    let Some(record) = page_record(frame) else { return 0 };
    let prior = record.refcount.fetch_sub(1, Ordering::AcqRel);
    let new_count = prior.saturating_sub(1);

    if new_count == 0 && record.flags().contains(PageFlags::BUDDY_MANAGED) {
        let is_base = record.flags().contains(PageFlags::BLOCK_BASE);
        let base_number = if is_base {
            frame.number()
        } else {
            record.link.load(Ordering::Acquire) as usize
        };

        if let Some(base_record) = table().get(base_number) {
            let prior_live = base_record.link.fetch_sub(1, Ordering::AcqRel);
            if prior_live == 1 {
                let order = base_record.order.load(Ordering::Acquire);
                if let Some(callback) = BUDDY_FREE_CALLBACK.get() {
                    let base_addr = PhysicalAddress::new_canonical(base_number * PAGE_SIZE);
                    callback(base_addr, order);
                } else {
                    warn!("page_metadata: buddy block fully dereferenced but no free callback registered");
                }
            }
        }
    }

    new_count
}

/// The lock-free single-page freelist (§4.7): a linked list of pages
/// threaded through the table's own `link` fields, for very early
/// single-page allocations in low physical memory before the buddy
/// allocator is live.
pub mod single_page_freelist {
    use super::*;
    use core::sync::atomic::AtomicU32;

    /// `u32::MAX` denotes an empty list.
    static HEAD: AtomicU32 = AtomicU32::new(FREELIST_NULL);

    /// Seeds the freelist with every frame in `frames`, innermost (last
    /// pushed) becoming the new head. Intended to be called once, very
    /// early in bootstrap, with a handful of region-reserved low frames.
    pub fn seed(frames: impl IntoIterator<Item = Frame>) {
        for frame in frames {
            free_page(PhysicalAddress::new_canonical(frame.number() * PAGE_SIZE));
        }
    }

    /// Pops a page off the freelist, incrementing its reference count.
    /// Returns `None` if the list is empty. Wait-free absent contention,
    /// lock-free under it.
    pub fn alloc_page() -> Option<PhysicalAddress> {
        loop {
            let head = HEAD.load(Ordering::Acquire);
            if head == FREELIST_NULL {
                return None;
            }
            let head_frame = Frame::from_number(head as usize);
            let next = table()
                .get(head as usize)
                .map(|r| r.link.load(Ordering::Acquire))
                .unwrap_or(FREELIST_NULL);

            if HEAD.compare_exchange_weak(head, next, Ordering::AcqRel, Ordering::Relaxed).is_ok() {
                reference_page(head_frame);
                unset_page_flags(head_frame, PageFlags::FREELIST_MANAGED);
                return Some(PhysicalAddress::new_canonical(head as usize * PAGE_SIZE));
            }
        }
    }

    /// Pushes `addr`'s page back onto the freelist.
    pub fn free_page(addr: PhysicalAddress) {
        let frame = Frame::containing_address(addr);
        let Some(record) = table().get(frame.number()) else { return };
        set_page_flags(frame, PageFlags::FREELIST_MANAGED);
        loop {
            let head = HEAD.load(Ordering::Acquire);
            record.link.store(head, Ordering::Release);
            if HEAD.compare_exchange_weak(head, frame.number() as u32, Ordering::AcqRel, Ordering::Relaxed).is_ok() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    extern crate std;
    use super::*;
    use std::{sync::Mutex as StdMutex, vec::Vec};

    // The global TABLE/HEAD/BUDDY_FREE_CALLBACK statics mean these tests
    // must not run concurrently with each other.
    static TEST_LOCK: StdMutex<()> = StdMutex::new(());

    fn with_table<R>(num_frames: usize, f: impl FnOnce() -> R) -> R {
        let _guard = TEST_LOCK.lock().unwrap();
        let mut backing: Vec<PageRecord> = (0..num_frames).map(|_| PageRecord::zeroed()).collect();
        // SAFETY: `backing` outlives the call to `f` below, and nothing
        // else can be touching the table concurrently (serialized by `TEST_LOCK`).
        unsafe {
            init(
                backing.as_mut_ptr(),
                num_frames,
                PhysicalAddress::zero(),
                PhysicalAddress::zero(),
                |_| true,
                |_| false,
            )
            .unwrap();
        }
        let result = f();
        // Reset the `Once` cells so the next test can re-initialize.
        // `spin::Once` has no public reset, so tests run once per process;
        // this harness is still correct for a single `with_table` call.
        result
    }

    // `TABLE` is a process-wide `spin::Once`: only the first `init` call in
    // the whole test binary actually takes effect, so every case that needs
    // an initialized table has to share one `with_table` call rather than
    // get its own (a second, independent `init` would make `with_table`
    // panic on its own `.unwrap()`, since `spin::Once` has no public reset).
    #[test]
    fn page_metadata_table_behavior() {
        with_table(4, || {
            let flags = page_record(Frame::from_number(0)).unwrap().flags();
            assert!(flags.contains(PageFlags::UNUSABLE));

            let frame = Frame::from_number(2);
            assert_eq!(reference_page(frame), 1);
            assert_eq!(reference_page(frame), 2);
            assert_eq!(drop_page_reference(frame), 1);
            assert_eq!(drop_page_reference(frame), 0);

            let frame = Frame::from_number(1);
            set_page_flags(frame, PageFlags::KERNEL);
            set_page_flags(frame, PageFlags::KERNEL);
            assert!(page_record(frame).unwrap().flags().contains(PageFlags::KERNEL));
            unset_page_flags(frame, PageFlags::KERNEL);
            assert!(!page_record(frame).unwrap().flags().contains(PageFlags::KERNEL));
        });
    }
}
