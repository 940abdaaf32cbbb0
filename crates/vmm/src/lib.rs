#![cfg_attr(not(test), no_std)]

//! # Virtual Memory Manager (VMM)
//!
//! Tracks which ranges of an address space are backed by which memory objects,
//! resolves page faults by binding frames on demand, and duplicates address spaces
//! when a process is created from an existing one.
//!
//! The layering is:
//!
//! - [`VmObject`]: a backing object that supplies frames for page offsets.
//! - [`Segment`]: a page-aligned virtual range bound to one object and one protection.
//! - [`Map`]: an ordered, non-overlapping set of segments plus its [`pmm::Pmap`].
//! - [`fault::resolve`]: the page fault entry point.
//! - [`clone_map`]: duplication of a whole address space.
//! - [`SpaceRegistry`] and [`CpuSpace`]: which map owns an address on a given core.

extern crate alloc;

mod clone;
mod error;
pub mod fault;
mod map;
mod object;
mod registry;
mod segment;

pub use clone::clone_map;
pub use error::{Result, VmError};
pub use fault::{Access, resolve};
pub use map::{Map, MapFlags, MapReadGuard};
pub use object::{Pager, VmObject};
pub use registry::{CpuSpace, SpaceRegistry, init_registry, registry};
pub use segment::{Segment, SegmentInfo};

pub use pmm::{PAGE_SIZE, Pmap, PmapKind, Protection, VirtualAddress};
