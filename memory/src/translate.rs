//! Virtual address decomposition into the four page-table indices (§4.6).

use kernel_config::memory::{ENTRIES_PER_PAGE_TABLE, PAGE_SHIFT, P1_INDEX_SHIFT, P2_INDEX_SHIFT, P3_INDEX_SHIFT, P4_INDEX_SHIFT};
use memory_structs::VirtualAddress;

/// One level of the 4-level x86_64 page table hierarchy, PML4 first.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Level {
    P4,
    P3,
    P2,
    P1,
}

impl Level {
    /// The level one step closer to a leaf entry, or `None` from [`Level::P1`].
    pub fn next(self) -> Option<Level> {
        match self {
            Level::P4 => Some(Level::P3),
            Level::P3 => Some(Level::P2),
            Level::P2 => Some(Level::P1),
            Level::P1 => None,
        }
    }
}

const INDEX_MASK: usize = ENTRIES_PER_PAGE_TABLE - 1;

/// The four page-table indices and final page offset packed into one virtual address.
#[derive(Clone, Copy, Debug)]
pub struct Indices {
    pub p4: usize,
    pub p3: usize,
    pub p2: usize,
    pub p1: usize,
    pub page_offset: usize,
}

/// Decomposes `addr` into PML4/PDPT/PDT/PT indices and a page offset (§4.6).
pub fn decompose(addr: VirtualAddress) -> Indices {
    let v = addr.value();
    Indices {
        p4: (v >> (PAGE_SHIFT + P4_INDEX_SHIFT)) & INDEX_MASK,
        p3: (v >> (PAGE_SHIFT + P3_INDEX_SHIFT)) & INDEX_MASK,
        p2: (v >> (PAGE_SHIFT + P2_INDEX_SHIFT)) & INDEX_MASK,
        p1: (v >> (PAGE_SHIFT + P1_INDEX_SHIFT)) & INDEX_MASK,
        page_offset: v & ((1 << PAGE_SHIFT) - 1),
    }
}

/// The table index `addr` occupies at `level`.
pub fn index_at(addr: VirtualAddress, level: Level) -> usize {
    let indices = decompose(addr);
    match level {
        Level::P4 => indices.p4,
        Level::P3 => indices.p3,
        Level::P2 => indices.p2,
        Level::P1 => indices.p1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_config::memory::{BUDDY_MEM_P4_INDEX, KERNEL_HEAP_P4_INDEX, KERNEL_SLAB_P4_INDEX, KERNEL_STACK_P4_INDEX, KERNEL_VMA, KERNEL_VMA_P4_INDEX, USER_SHARED_P4_INDEX};

    #[test]
    fn kernel_vma_decomposes_to_its_documented_p4_index() {
        let indices = decompose(VirtualAddress::new_canonical(KERNEL_VMA));
        assert_eq!(indices.p4, KERNEL_VMA_P4_INDEX);
        assert_eq!(indices.p3, 0);
        assert_eq!(indices.p2, 0);
        assert_eq!(indices.p1, 0);
        assert_eq!(indices.page_offset, 0);
    }

    #[test]
    fn each_named_zone_gets_a_distinct_p4_index() {
        let indices = [
            KERNEL_VMA_P4_INDEX,
            KERNEL_HEAP_P4_INDEX,
            KERNEL_SLAB_P4_INDEX,
            KERNEL_STACK_P4_INDEX,
            BUDDY_MEM_P4_INDEX,
            USER_SHARED_P4_INDEX,
        ];
        for (i, a) in indices.iter().enumerate() {
            for (j, b) in indices.iter().enumerate() {
                if i != j {
                    assert_ne!(a, b);
                }
            }
        }
    }

    #[test]
    fn offset_within_a_page_is_preserved() {
        let indices = decompose(VirtualAddress::new_canonical(KERNEL_VMA + 0x123));
        assert_eq!(indices.page_offset, 0x123);
    }
}
