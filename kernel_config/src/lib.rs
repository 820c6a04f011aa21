//! Architectural constants for the x86_64 memory management core.
//!
//! Every other crate in the subsystem derives its geometry (page size, page
//! table index shifts, zone address windows) from this crate rather than
//! re-declaring magic numbers.

#![no_std]

pub mod memory;
