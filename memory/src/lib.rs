//! Four-level x86_64 page table traversal and mapping, and the named
//! virtual-address-space zones built on top of them (§4.6).
//!
//! [`table`] and [`translate`] are the mechanism: decomposing a virtual
//! address into its four page-table indices, walking or extending a page
//! table, and writing a leaf entry with the software provenance bits the
//! rest of the core relies on for teardown. [`zone`] is the policy built on
//! that mechanism: the fixed layout of named zones, their bump-allocated
//! `vmzone_extend`/`vmzone_shrink` operations, and `vmspace_init`, which
//! installs the `KERNEL_VMA` identity window and links every zone into a
//! fresh PML4.

#![no_std]

#[macro_use]
extern crate bitflags;

pub mod table;
pub mod translate;
pub mod zone;

pub use table::{current_pml4_root, ensure_child, leaf_entry, map_pages, traverse, unmap_one, MapFlags, PageTableOps, VmError};
pub use translate::{decompose, index_at, Indices, Level};
pub use zone::{vmspace_init, vmzone_alloc_block, vmzone_extend, vmzone_free_block, vmzone_shrink, ZoneId, ZoneKind, ZoneOps};
