//! Allocator types, from the raw single-threaded core to a global
//! allocator.
//!
//! ## Basic Types
//!
//! ### [`RawAlloc`](struct.RawAlloc.html)
//!
//! A `RawAlloc` is the single-threaded allocator core: best-fit search
//! over the free list, splitting of over-large fits, eager boundary-tag
//! coalescing on free, and tail-merging heap extension. It is not
//! thread-safe and cannot be used as the global allocator directly.
//!
//! ### [`GenericAllocator`](struct.GenericAllocator.html) and [`UnixAllocator`](struct.UnixAllocator.html)
//!
//! A `GenericAllocator` wraps a `RawAlloc` in a spin lock with a
//! once-only initialization state machine, which is exactly the external
//! synchronization the core demands. `UnixAllocator` pairs that with the
//! [`LibcHeapGrower`](struct.LibcHeapGrower.html) so it can serve as
//! `#[global_allocator]`.
//!
//! ### [`HeapGrower`](trait.HeapGrower.html)
//!
//! `HeapGrower` abstracts the provider of the underlying byte region.
//! Unlike a page allocator, a grower hands out *contiguous* extents:
//! every extension starts exactly where the previous one ended, which is
//! what lets boundary tags reach any neighbor by pure address arithmetic.
//!
//! ### [`ToyHeap`](struct.ToyHeap.html)
//!
//! `ToyHeap` is a fixed array pretending to be a heap, for tests.

#[cfg(feature = "use_libc")]
use core::alloc::{GlobalAlloc, Layout};
use core::cmp;
use core::mem::MaybeUninit;
use core::ptr::{self, null_mut, NonNull};
use core::sync::atomic::{AtomicU8, Ordering};

#[cfg(feature = "use_libc")]
use errno::Errno;
use log::{debug, warn};
use spin::{Mutex, MutexGuard};

use crate::block::{self, Block, ALIGNMENT, BLOCK_MIN, PAD, WORD};
use crate::freelist::{FreeIter, FreeList};

/// Provider of the raw heap region.
///
/// The contract differs from an `mmap`-style page source: all extents are
/// contiguous, so the managed region is always the single byte range
/// `[lo, lo + size)`.
pub trait HeapGrower {
    type Err;

    /// Grow the heap by exactly `delta` bytes, returning the first new
    /// byte. The new extent starts where the previous one ended; the
    /// very first extent starts [`ALIGNMENT`]-aligned.
    ///
    /// # Safety
    ///
    /// On success the returned memory must be writable, unused by any
    /// other code, and must stay put for the provider's lifetime.
    unsafe fn extend(&mut self, delta: usize) -> Result<NonNull<u8>, Self::Err>;

    /// Lowest address of the managed region. Only meaningful once
    /// `size() > 0`.
    fn lo(&self) -> *mut u8;

    /// Total bytes obtained so far.
    fn size(&self) -> usize;
}

/// Grows the heap with `sbrk`, the classic contiguous data-segment break.
///
/// The first call rounds the program break up to [`ALIGNMENT`] before
/// claiming anything, so the managed region always starts aligned. The
/// break must not be moved by anyone else while this grower is live.
#[cfg(feature = "use_libc")]
pub struct LibcHeapGrower {
    base: *mut u8,
    size: usize,
    // Just for tracking, not really needed
    growths: usize,
}

// The base pointer is only a remembered address into the process's own
// data segment.
#[cfg(feature = "use_libc")]
unsafe impl Send for LibcHeapGrower {}

#[cfg(feature = "use_libc")]
impl Default for LibcHeapGrower {
    fn default() -> Self {
        LibcHeapGrower {
            base: null_mut(),
            size: 0,
            growths: 0,
        }
    }
}

#[cfg(feature = "use_libc")]
impl HeapGrower for LibcHeapGrower {
    type Err = Errno;

    unsafe fn extend(&mut self, delta: usize) -> Result<NonNull<u8>, Errno> {
        if self.base.is_null() {
            let brk = libc::sbrk(0);
            if brk as isize == -1 {
                return Err(errno::errno());
            }
            let misalignment = (brk as *mut u8).align_offset(ALIGNMENT);
            if misalignment > 0
                && libc::sbrk(misalignment as libc::intptr_t) as isize == -1
            {
                return Err(errno::errno());
            }
            self.base = (brk as *mut u8).add(misalignment);
        }

        let start = libc::sbrk(delta as libc::intptr_t);
        if start as isize == -1 {
            return Err(errno::errno());
        }
        self.size += delta;
        self.growths += 1;
        Ok(NonNull::new_unchecked(start as *mut u8))
    }

    fn lo(&self) -> *mut u8 {
        self.base
    }

    fn size(&self) -> usize {
        self.size
    }
}

const TOY_HEAP_SIZE: usize = 256 * 1024;

/// A fixed array on the stack that can pretend to be a heap; mainly
/// useful for testing.
///
/// The array comes first and the struct is over-aligned so the first
/// byte is a valid block start. Like any grower, it must not move once
/// the first extent has been handed out.
#[repr(C, align(16))]
pub struct ToyHeap {
    heap: [u8; TOY_HEAP_SIZE],
    size: usize,
}

impl Default for ToyHeap {
    fn default() -> Self {
        ToyHeap {
            heap: [0; TOY_HEAP_SIZE],
            size: 0,
        }
    }
}

/// The toy heap ran out of array.
#[derive(Debug)]
pub struct ToyHeapOverflowError;

impl HeapGrower for ToyHeap {
    type Err = ToyHeapOverflowError;

    unsafe fn extend(&mut self, delta: usize) -> Result<NonNull<u8>, Self::Err> {
        if self.size + delta > self.heap.len() {
            return Err(ToyHeapOverflowError);
        }
        let start = self.heap.as_mut_ptr().add(self.size);
        self.size += delta;
        Ok(NonNull::new_unchecked(start))
    }

    fn lo(&self) -> *mut u8 {
        self.heap.as_ptr() as *mut u8
    }

    fn size(&self) -> usize {
        self.size
    }
}

/// Everything [`RawAlloc::check`] found wrong with the heap.
///
/// Counters cover the physical walk (tags, sizes, alignment, adjacency)
/// and the free list (membership, link symmetry, cycles). All zero means
/// the invariants hold.
#[derive(Default, Debug)]
pub struct Validity {
    /// Blocks whose header and footer words disagree.
    pub tag_mismatches: usize,
    /// Blocks whose payload is not [`ALIGNMENT`]-aligned.
    pub misaligned_payloads: usize,
    /// Blocks smaller than [`BLOCK_MIN`].
    pub undersized_blocks: usize,
    /// Free blocks whose physical neighbor is also free; coalescing is
    /// eager, so this should never happen.
    pub adjacent_free: usize,
    /// Free-list defects: a free block missing from the list (or on it
    /// more than once), a linked block with the allocated bit set or
    /// outside the heap, asymmetric links, or a cycle.
    pub list_errors: usize,
    /// The physical walk hit a garbage size word (or overshot the heap
    /// end) and was halted early.
    pub broken_walk: bool,
}

impl Validity {
    /// Returns a boolean - a simple check if all cases are 0
    pub fn is_valid(&self) -> bool {
        self.tag_mismatches == 0
            && self.misaligned_payloads == 0
            && self.undersized_blocks == 0
            && self.adjacent_free == 0
            && self.list_errors == 0
            && !self.broken_walk
    }
}

impl From<Validity> for bool {
    fn from(v: Validity) -> bool {
        v.is_valid()
    }
}

#[derive(Default, Debug)]
pub struct Stats {
    /// Blocks seen on the physical walk, allocated or not.
    pub blocks: usize,
    /// Free blocks seen on the physical walk.
    pub free_blocks: usize,
    /// Bytes held by free blocks, tag words included.
    pub free_bytes: usize,
    /// Total bytes obtained from the grower.
    pub heap_bytes: usize,
}

/// The allocator core: a grower plus the free-list head.
///
/// Single-threaded; callers needing concurrency wrap it in a
/// [`GenericAllocator`]. Memory is never returned to the grower.
pub struct RawAlloc<G> {
    pub grower: G,
    free: FreeList,
}

impl<G: HeapGrower + Default> Default for RawAlloc<G> {
    fn default() -> Self {
        RawAlloc::new(G::default())
    }
}

impl<G: HeapGrower> RawAlloc<G> {
    /// Create a new `RawAlloc` with an empty free list. Construction
    /// cannot fail; grower exhaustion surfaces as a null payload from
    /// [`alloc`](RawAlloc::alloc).
    pub fn new(grower: G) -> Self {
        RawAlloc {
            grower,
            free: FreeList::new(),
        }
    }

    /// The free blocks, head first.
    pub fn free_blocks(&self) -> FreeIter<'_> {
        self.free.iter()
    }

    /// One past the last managed byte.
    fn heap_end(&self) -> *mut u8 {
        unsafe { self.grower.lo().add(self.grower.size()) }
    }

    /// The lowest block, sitting just after the alignment pad; `None`
    /// until the first extension.
    fn first_block(&self) -> Option<Block> {
        if self.grower.size() <= PAD {
            return None;
        }
        unsafe {
            Some(Block::from_raw(NonNull::new_unchecked(
                self.grower.lo().add(PAD),
            )))
        }
    }

    /// The highest block, found through the footer word that ends the
    /// heap; `None` until the first extension.
    fn last_block(&self) -> Option<Block> {
        if self.grower.size() <= PAD {
            return None;
        }
        unsafe { Some(Block::ending_at(NonNull::new_unchecked(self.heap_end()))) }
    }

    /// Obtain a block able to hold `request` payload bytes by growing
    /// the heap.
    ///
    /// If the heap's last block is free, only the missing tail is
    /// requested from the grower, formatted as a stub, and merged into
    /// that block - which keeps whatever free-list position it already
    /// held, so the second tuple field reports `true`. Otherwise a fresh
    /// block of the full size is formatted and returned unlinked
    /// (`false`); the caller is about to allocate it, so listing it
    /// first would be wasted motion.
    ///
    /// The very first extension also claims the [`PAD`] bytes that keep
    /// the first payload aligned.
    unsafe fn extend(&mut self, request: usize) -> Result<(Block, bool), G::Err> {
        if let Some(last) = self.last_block() {
            if !last.is_allocated() {
                debug_assert!(last.inner_size() < request);
                let deficit = block::align_up(request + 2 * WORD - last.size());
                debug!(
                    "widening free tail {:?} ({} bytes) by {}",
                    last,
                    last.size(),
                    deficit
                );
                let region = self.grower.extend(deficit)?;
                let stub = Block::from_raw(region);
                stub.format(deficit);
                last.merge(stub);
                return Ok((last, true));
            }
        }

        let bsize = block::block_size_for(request);
        let first = self.grower.size() == 0;
        let delta = if first { bsize + PAD } else { bsize };
        debug!("growing heap by {} for a fresh block of {}", delta, bsize);
        let region = self.grower.extend(delta)?;
        let start = if first {
            NonNull::new_unchecked(region.as_ptr().add(PAD))
        } else {
            region
        };
        let b = Block::from_raw(start);
        b.format(bsize);
        Ok((b, false))
    }

    /// Allocate `size` bytes, returning an [`ALIGNMENT`]-aligned payload
    /// pointer, or null when `size` is zero or the grower is exhausted.
    ///
    /// Policy: best fit over the free list; a winning block is split
    /// when the surplus can stand as a block of its own, with the
    /// remainder going back to the head of the list.
    ///
    /// # Safety
    ///
    /// The returned memory is untracked by Rust; the usual raw-allocator
    /// obligations apply.
    pub unsafe fn alloc(&mut self, size: usize) -> *mut u8 {
        if size == 0 {
            return null_mut();
        }

        if let Some(best) = self.free.best_fit(size) {
            let split_size = block::block_size_for(size);
            // best_fit guarantees the payload fits, and block sizes are
            // aligned, so best is at least split_size long.
            let leftover = best.size() - split_size;
            self.free.unlink(best);
            if leftover < BLOCK_MIN {
                debug!("allocating {:?} whole ({} bytes)", best, best.size());
            } else {
                let rest = best.split(split_size);
                self.free.push_front(rest);
                debug!(
                    "split {:?} into {} + {} back on the list",
                    best, split_size, leftover
                );
            }
            best.set_allocated();
            return best.payload().as_ptr();
        }

        let (b, linked) = match self.extend(size) {
            Ok(got) => got,
            Err(_) => {
                debug!("grower exhausted on request for {} bytes", size);
                return null_mut();
            }
        };
        if linked {
            self.free.unlink(b);
        }
        b.set_allocated();
        b.payload().as_ptr()
    }

    /// Return `ptr`'s block to the free list, eagerly coalescing with
    /// whichever physical neighbors are free. Null is a no-op; freeing
    /// an already-free block is a warned no-op.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a payload pointer previously returned by
    /// this allocator and not freed since.
    pub unsafe fn free(&mut self, ptr: *mut u8) {
        let payload = match NonNull::new(ptr) {
            None => return,
            Some(p) => p,
        };
        let b = Block::from_payload(payload);
        if !b.is_allocated() {
            warn!("ignoring free of unallocated block {:?}", b);
            return;
        }
        debug!("freeing {:?} ({} bytes)", b, b.size());
        b.set_free();

        // Successor first: the freed block takes over the successor's
        // list slot, so the surviving lower address is the one the list
        // keeps pointing at.
        let mut linked = false;
        if b.end() < self.heap_end() {
            let right = b.next();
            if !right.is_allocated() {
                debug!("absorbing free successor {:?}", right);
                self.free.replace(right, b);
                b.merge(right);
                linked = true;
            }
        }

        // Then the predecessor, which keeps its own slot. The first
        // block has no predecessor - the word before it is pad, not a
        // footer - so compare addresses before reaching back.
        if let Some(first) = self.first_block() {
            if b != first {
                let left = b.prev();
                if !left.is_allocated() {
                    debug!("absorbed by free predecessor {:?}", left);
                    if linked {
                        self.free.unlink(b);
                    }
                    left.merge(b);
                    return;
                }
            }
        }

        if !linked {
            self.free.push_front(b);
        }
    }

    /// Resize `ptr`'s allocation to `size` bytes by allocate-copy-free,
    /// preserving the leading `min(old payload, size)` bytes. Null `ptr`
    /// behaves as [`alloc`](RawAlloc::alloc); zero `size` behaves as
    /// [`free`](RawAlloc::free) and returns null. On grower exhaustion
    /// the old allocation is left untouched and null is returned.
    ///
    /// # Safety
    ///
    /// As for [`alloc`](RawAlloc::alloc) and [`free`](RawAlloc::free).
    pub unsafe fn realloc(&mut self, ptr: *mut u8, size: usize) -> *mut u8 {
        let payload = match NonNull::new(ptr) {
            None => return self.alloc(size),
            Some(p) => p,
        };
        if size == 0 {
            self.free(ptr);
            return null_mut();
        }
        let old = Block::from_payload(payload);
        let new_ptr = self.alloc(size);
        if new_ptr.is_null() {
            return null_mut();
        }
        let keep = cmp::min(old.inner_size(), size);
        ptr::copy_nonoverlapping(ptr, new_ptr, keep);
        self.free(ptr);
        new_ptr
    }

    /// Walk the heap and the free list, verifying every structural
    /// invariant, and report what was found. Each block is also dumped
    /// at debug log level.
    ///
    /// The physical walk halts early on a zero or unaligned size word
    /// rather than looping forever over garbage.
    pub fn check(&self) -> (Validity, Stats) {
        let mut validity = Validity::default();
        let mut stats = Stats {
            heap_bytes: self.grower.size(),
            ..Stats::default()
        };

        let first = match self.first_block() {
            None => {
                if !self.free.is_empty() {
                    validity.list_errors += 1;
                }
                return (validity, stats);
            }
            Some(first) => first,
        };
        let end = self.heap_end();
        // No heap of this size can hold more blocks than this; it bounds
        // both walks even when links or tags are corrupt.
        let max_blocks = stats.heap_bytes / BLOCK_MIN + 1;

        // List pass: every node free and in bounds, links symmetric, no
        // cycle.
        let mut list_len = 0usize;
        let mut prev: Option<Block> = None;
        let mut cursor = self.free.head();
        while let Some(b) = cursor {
            if list_len == max_blocks {
                validity.list_errors += 1;
                break;
            }
            list_len += 1;
            if b.is_allocated() {
                validity.list_errors += 1;
            }
            if (b.as_ptr() as usize) < (first.as_ptr() as usize) || b.end() > end {
                validity.list_errors += 1;
            }
            if unsafe { b.prev_free() } != prev {
                validity.list_errors += 1;
            }
            prev = Some(b);
            cursor = unsafe { b.next_free() };
        }

        // Physical pass: step block to block and land exactly on the
        // heap end.
        let mut cursor = first;
        let mut prev_was_free = false;
        loop {
            let size = cursor.size();
            debug!(
                "block {:?}: {} bytes, {}",
                cursor,
                size,
                if cursor.is_allocated() {
                    "allocated"
                } else {
                    "free"
                },
            );
            if size == 0 || size % ALIGNMENT != 0 {
                validity.broken_walk = true;
                break;
            }
            stats.blocks += 1;
            if cursor.header_tag() != cursor.footer_tag() {
                validity.tag_mismatches += 1;
            }
            if size < BLOCK_MIN {
                validity.undersized_blocks += 1;
            }
            if (cursor.payload().as_ptr() as usize) % ALIGNMENT != 0 {
                validity.misaligned_payloads += 1;
            }
            if cursor.is_allocated() {
                prev_was_free = false;
            } else {
                stats.free_blocks += 1;
                stats.free_bytes += size;
                if prev_was_free {
                    validity.adjacent_free += 1;
                }
                prev_was_free = true;
                let on_list = self
                    .free
                    .iter()
                    .take(max_blocks)
                    .filter(|&b| b == cursor)
                    .count();
                if on_list != 1 {
                    validity.list_errors += 1;
                }
            }
            let next = cursor.end();
            if next == end {
                break;
            }
            if next > end || stats.blocks == max_blocks {
                validity.broken_walk = true;
                break;
            }
            cursor = unsafe { cursor.next() };
        }

        if list_len != stats.free_blocks {
            validity.list_errors += 1;
        }

        (validity, stats)
    }
}

/// A thread-safe allocator: a spin lock around a [`RawAlloc`].
///
/// Thread-safety is what the global-allocator position requires, and the
/// lock is the external synchronization the core's contract asks for.
pub struct GenericAllocator<G> {
    // Values:
    // - 0: Untouched
    // - 1: Initialization in progress
    // - 2: Initialized
    init: AtomicU8,
    raw: MaybeUninit<Mutex<RawAlloc<G>>>,
}

impl<G: HeapGrower + Default> Default for GenericAllocator<G> {
    fn default() -> Self {
        Self::new()
    }
}

impl<G> GenericAllocator<G> {
    pub const fn new() -> Self {
        GenericAllocator {
            init: AtomicU8::new(0),
            raw: MaybeUninit::uninit(),
        }
    }
}

impl<G: HeapGrower + Default> GenericAllocator<G> {
    /// Get a reference to the underlying RawAlloc, initializing it on
    /// first use.
    ///
    /// # Safety
    ///
    /// This is unsafe because it blocks allocation while the mutex guard
    /// is in place.
    pub unsafe fn get_raw(&self) -> MutexGuard<'_, RawAlloc<G>> {
        // The plan:
        // - Check if initialization hasn't started (0)
        // - If initializing hasn't yet started (0):
        //   - Mark it as initializing (1), then initialize, then mark it
        //     as fully initialized (2)
        // - If it has started but not completed (1):
        //   - Enter a spin loop until it is fully initialized (2)
        // - If it finished initializing (2):
        //   - Continue
        //
        // The ordering here is SeqCst because that's the safest, if not
        // the most efficient. This could probably be downgraded, but
        // would require some analysis and understanding to do so.
        let state = self
            .init
            .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst);

        match state {
            Err(2) => {
                // This is fully initialized, no need to do anything
            }
            Ok(0) => {
                // We haven't initialized, so we do that now.
                let raw_loc: *const Mutex<RawAlloc<G>> = self.raw.as_ptr();
                let raw_mut: *mut Mutex<RawAlloc<G>> = raw_loc as *mut Mutex<RawAlloc<G>>;
                raw_mut.write(Mutex::new(RawAlloc::default()));
                let mx: &mut Mutex<RawAlloc<G>> = raw_mut.as_mut().unwrap();

                // Let other threads know that the mutex and raw allocator
                // are now initialized, and they are free to use the mutex
                // to access the raw allocator
                self.init.store(2, Ordering::SeqCst);
                return mx.lock();
            }
            Err(1) => {
                // Some other thread is currently initializing. We wait
                // for it, spinning until the state becomes 2.
                loop {
                    core::hint::spin_loop();
                    match self.init.load(Ordering::SeqCst) {
                        1 => continue,
                        2 => break,
                        state => panic!("Unexpected state {}", state),
                    }
                }
            }
            Ok(v) => panic!("Unexpected OK state loaded: {}", v),
            Err(v) => panic!("Unexpected Err state loaded: {}", v),
        }

        let ptr = self.raw.as_ptr().as_ref().unwrap();
        ptr.lock()
    }

    pub fn check(&self) -> (Validity, Stats) {
        unsafe { self.get_raw().check() }
    }
}

/// A global allocator over the process data segment.
///
/// Serves layouts aligned to at most [`ALIGNMENT`] bytes; anything more
/// demanding is refused with a null return, since payloads sit exactly
/// one word past an aligned block start.
///
/// When installed globally, an allocating log sink can re-enter the
/// allocator from inside its own lock if verbose levels are enabled, so
/// keep debug filtering off in that configuration.
#[cfg(feature = "use_libc")]
#[derive(Default)]
pub struct UnixAllocator {
    alloc: GenericAllocator<LibcHeapGrower>,
}

#[cfg(feature = "use_libc")]
impl UnixAllocator {
    pub const fn new() -> Self {
        UnixAllocator {
            alloc: GenericAllocator::new(),
        }
    }

    pub fn check(&self) -> (Validity, Stats) {
        self.alloc.check()
    }
}

#[cfg(feature = "use_libc")]
unsafe impl GlobalAlloc for UnixAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > ALIGNMENT {
            return null_mut();
        }
        self.alloc.get_raw().alloc(layout.size())
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        self.alloc.get_raw().free(ptr)
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() > ALIGNMENT {
            return null_mut();
        }
        self.alloc.get_raw().realloc(ptr, new_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{block_size_for, INNER_MIN};

    use test_log::test;

    fn assert_valid(allocator: &RawAlloc<ToyHeap>) {
        let (validity, stats) = allocator.check();
        log::info!("validity: {:?}, stats: {:?}", validity, stats);
        assert!(validity.is_valid(), "{:?}", validity);
    }

    fn new_toy() -> RawAlloc<ToyHeap> {
        RawAlloc::new(ToyHeap::default())
    }

    #[test]
    fn alloc_zero_and_free_null() {
        let mut allocator = new_toy();
        unsafe {
            assert!(allocator.alloc(0).is_null());
            assert_eq!(allocator.grower.size(), 0);
            allocator.free(null_mut());
        }
        assert_valid(&allocator);
    }

    #[test]
    fn single_alloc_free_roundtrip() {
        let mut allocator = new_toy();
        unsafe {
            let p = allocator.alloc(1);
            assert!(!p.is_null());
            assert_eq!(p as usize % ALIGNMENT, 0);

            let b = Block::from_payload(NonNull::new_unchecked(p));
            assert_eq!(b.size(), BLOCK_MIN);
            assert!(b.is_allocated());
            assert_valid(&allocator);

            // The payload is ours to scribble on.
            ptr::write_bytes(p, 0xAB, 1);

            allocator.free(p);
            assert_eq!(allocator.free_blocks().next(), Some(b));
            let (validity, stats) = allocator.check();
            assert!(validity.is_valid());
            assert_eq!(stats.blocks, 1);
            assert_eq!(stats.free_blocks, 1);
            assert_eq!(stats.free_bytes, BLOCK_MIN);
        }
    }

    #[test]
    fn small_requests_share_a_block_size() {
        let mut allocator = new_toy();
        unsafe {
            let p = allocator.alloc(1);
            let q = allocator.alloc(INNER_MIN);
            for ptr in [p, q] {
                let b = Block::from_payload(NonNull::new_unchecked(ptr));
                assert_eq!(b.size(), BLOCK_MIN);
            }
        }
        assert_valid(&allocator);
    }

    #[test]
    fn coalesce_both_neighbors() {
        let mut allocator = new_toy();
        unsafe {
            let pa = allocator.alloc(INNER_MIN);
            let pb = allocator.alloc(INNER_MIN);
            let pc = allocator.alloc(INNER_MIN);
            assert_valid(&allocator);

            allocator.free(pa);
            allocator.free(pc);
            let (validity, stats) = allocator.check();
            assert!(validity.is_valid(), "{:?}", validity);
            assert_eq!(stats.blocks, 3);
            assert_eq!(stats.free_blocks, 2);

            // Freeing the middle block fuses the whole heap into one
            // free block.
            allocator.free(pb);
            let (validity, stats) = allocator.check();
            assert!(validity.is_valid(), "{:?}", validity);
            assert_eq!(stats.blocks, 1);
            assert_eq!(stats.free_blocks, 1);
            assert_eq!(stats.free_bytes, 3 * BLOCK_MIN);

            // And the survivor is the lowest block.
            let head = allocator.free_blocks().next().unwrap();
            assert_eq!(head.payload().as_ptr(), pa);
        }
    }

    #[test]
    fn split_on_reuse() {
        let mut allocator = new_toy();
        unsafe {
            let p = allocator.alloc(200);
            let old_block_size = Block::from_payload(NonNull::new_unchecked(p)).size();
            allocator.free(p);

            let q = allocator.alloc(32);
            // Best fit lands on the freed block and splits it.
            assert_eq!(q, p);
            let b = Block::from_payload(NonNull::new_unchecked(q));
            assert_eq!(b.size(), block_size_for(32));

            let rest = allocator.free_blocks().next().unwrap();
            assert_eq!(rest.size(), old_block_size - block_size_for(32));
            assert!(rest.size() >= BLOCK_MIN);
        }
        assert_valid(&allocator);
    }

    #[test]
    fn reuse_without_growth() {
        let mut allocator = new_toy();
        unsafe {
            let _a = allocator.alloc(100);
            let b = allocator.alloc(100);
            let grown = allocator.grower.size();

            allocator.free(b);
            let c = allocator.alloc(50);
            assert_eq!(c, b);
            assert_eq!(allocator.grower.size(), grown);

            let (validity, stats) = allocator.check();
            assert!(validity.is_valid(), "{:?}", validity);
            assert_eq!(stats.free_blocks, 1);
        }
    }

    #[test]
    fn best_fit_prefers_the_snuggest_block() {
        let mut allocator = new_toy();
        unsafe {
            let big = allocator.alloc(120);
            let _gap1 = allocator.alloc(INNER_MIN);
            let small = allocator.alloc(40);
            let _gap2 = allocator.alloc(INNER_MIN);

            allocator.free(big);
            allocator.free(small);
            assert_valid(&allocator);

            // Both free blocks fit, but the snugger one wins even though
            // the other was freed first.
            let p = allocator.alloc(40);
            assert_eq!(p, small);

            // And a request only the big block can hold still finds it,
            // wherever it sits in the list.
            let q = allocator.alloc(100);
            assert_eq!(q, big);
        }
        assert_valid(&allocator);
    }

    #[test]
    fn exact_fit_is_not_split() {
        let mut allocator = new_toy();
        unsafe {
            let p = allocator.alloc(40);
            let _guard = allocator.alloc(INNER_MIN);
            allocator.free(p);

            let q = allocator.alloc(40);
            assert_eq!(q, p);
            // Nothing left over: the remainder would have been zero.
            assert!(allocator.free_blocks().next().is_none());
        }
        assert_valid(&allocator);
    }

    #[test]
    fn barely_oversized_fit_is_not_split() {
        let mut allocator = new_toy();
        unsafe {
            // A block whose surplus over the next request is positive
            // but too small to stand alone.
            let p = allocator.alloc(40 + ALIGNMENT);
            let _guard = allocator.alloc(INNER_MIN);
            allocator.free(p);

            let q = allocator.alloc(40);
            assert_eq!(q, p);
            let b = Block::from_payload(NonNull::new_unchecked(q));
            // The whole block was handed over, slack included.
            assert_eq!(b.size(), block_size_for(40 + ALIGNMENT));
            assert!(allocator.free_blocks().next().is_none());
        }
        assert_valid(&allocator);
    }

    #[test]
    fn extend_merges_free_tail() {
        let mut allocator = new_toy();
        unsafe {
            let _a = allocator.alloc(INNER_MIN);
            let b = allocator.alloc(INNER_MIN);
            allocator.free(b);
            let before = allocator.grower.size();

            // Nothing on the list fits, but the free tail only needs
            // widening, not a whole fresh block.
            let p = allocator.alloc(64);
            assert_eq!(p, b);
            let deficit = block_size_for(64) - BLOCK_MIN;
            assert_eq!(allocator.grower.size(), before + deficit);

            let block = Block::from_payload(NonNull::new_unchecked(p));
            assert_eq!(block.size(), block_size_for(64));
            assert!(allocator.free_blocks().next().is_none());
        }
        assert_valid(&allocator);
    }

    #[test]
    fn realloc_preserves_prefix() {
        let mut allocator = new_toy();
        unsafe {
            let p = allocator.alloc(32);
            for i in 0..32 {
                p.add(i).write(0xAB_u8.wrapping_add(i as u8));
            }

            let q = allocator.realloc(p, 64);
            assert!(!q.is_null());
            for i in 0..32 {
                assert_eq!(q.add(i).read(), 0xAB_u8.wrapping_add(i as u8));
            }
            assert_valid(&allocator);

            // Shrinking copies only what the new size keeps.
            let r = allocator.realloc(q, 8);
            assert!(!r.is_null());
            for i in 0..8 {
                assert_eq!(r.add(i).read(), 0xAB_u8.wrapping_add(i as u8));
            }
        }
        assert_valid(&allocator);
    }

    #[test]
    fn realloc_null_and_zero() {
        let mut allocator = new_toy();
        unsafe {
            let p = allocator.realloc(null_mut(), 24);
            assert!(!p.is_null());
            assert_valid(&allocator);

            let q = allocator.realloc(p, 0);
            assert!(q.is_null());
            let (validity, stats) = allocator.check();
            assert!(validity.is_valid(), "{:?}", validity);
            assert_eq!(stats.free_blocks, 1);
        }
    }

    #[test]
    fn double_free_is_tolerated() {
        let mut allocator = new_toy();
        unsafe {
            let p = allocator.alloc(INNER_MIN);
            allocator.free(p);
            allocator.free(p);

            let (validity, stats) = allocator.check();
            assert!(validity.is_valid(), "{:?}", validity);
            assert_eq!(stats.free_blocks, 1);
        }
    }

    #[test]
    fn grower_exhaustion_returns_null() {
        let mut allocator = new_toy();
        unsafe {
            assert!(allocator.alloc(TOY_HEAP_SIZE + 1).is_null());
            assert_eq!(allocator.grower.size(), 0);

            // The allocator is still serviceable afterwards.
            let p = allocator.alloc(INNER_MIN);
            assert!(!p.is_null());
        }
        assert_valid(&allocator);
    }

    #[test]
    fn check_spots_a_clobbered_footer() {
        let mut allocator = new_toy();
        unsafe {
            let p = allocator.alloc(INNER_MIN);
            assert_valid(&allocator);

            // Stomp the footer the way an overflowing client would.
            (p.add(INNER_MIN) as *mut usize).write(0xDEAD);
            let (validity, _) = allocator.check();
            assert!(!validity.is_valid());
            assert!(validity.tag_mismatches > 0 || validity.broken_walk);
        }
    }
}
