#![no_std]

//! A best-fit, boundary-tag memory allocator.
//!
//! The heap is a single contiguous region obtained piecewise from a
//! [`HeapGrower`](allocators::HeapGrower). Every block in it carries its
//! size and an allocated bit in identical header and footer words, so
//! physical neighbors are reachable in constant time and freed blocks
//! coalesce eagerly in both directions. Free blocks are chained into a
//! doubly-linked [`FreeList`](freelist::FreeList) threaded through their
//! own payloads; allocation picks the snuggest fitting block and splits
//! off any surplus that can stand on its own.
//!
//! The single-threaded core is [`RawAlloc`](allocators::RawAlloc); the
//! spin-locked [`UnixAllocator`](allocators::UnixAllocator) (feature
//! `use_libc`, on by default) grows the data segment with `sbrk` and can
//! be installed as the global allocator:
//!
//! ```rust,ignore
//! use tagfit_allocator::UnixAllocator;
//!
//! #[global_allocator]
//! static ALLOCATOR: UnixAllocator = UnixAllocator::new();
//! ```
//!
//! Heap consistency can be audited at any time through
//! [`check`](allocators::RawAlloc::check), which walks every block and
//! the free list and reports anything out of order.

pub mod allocators;
pub mod block;
pub mod freelist;

pub use allocators::{GenericAllocator, HeapGrower, RawAlloc, Stats, ToyHeap, Validity};
pub use block::{Block, ALIGNMENT, BLOCK_MIN, INNER_MIN};
pub use freelist::FreeList;

#[cfg(feature = "use_libc")]
pub use allocators::{LibcHeapGrower, UnixAllocator};
