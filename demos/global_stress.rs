//! Installs the allocator as the global allocator and walks it through
//! the behaviors that define it: stripe the heap with same-sized holes,
//! refill them best-fit without growing the heap, free everything and
//! watch the stripes coalesce away, then widen the free tail for an
//! oversized request instead of claiming a whole fresh extent. Heap
//! consistency is audited between phases.

use tagfit_allocator::{Stats, UnixAllocator};

#[global_allocator]
static ALLOCATOR: UnixAllocator = UnixAllocator::new();

// How many hole/survivor pairs to interleave.
const PAIRS: usize = 512;
// u64s per hole object and per survivor object.
const HOLE_WORDS: usize = 32;
const SURVIVOR_WORDS: usize = 96;

fn audit(phase: &str) -> Stats {
    let (validity, stats) = ALLOCATOR.check();
    println!(
        "{}: {} blocks ({} free, {} bytes free) in a {}-byte heap",
        phase, stats.blocks, stats.free_blocks, stats.free_bytes, stats.heap_bytes,
    );
    assert!(validity.is_valid(), "{:?}", validity);
    stats
}

fn words(n: usize, seed: usize) -> Vec<u64> {
    (0..n).map(|i| (seed * n + i) as u64).collect()
}

fn main() {
    env_logger::init();
    audit("fresh heap");

    // Interleave two size classes. The allocations land back to back, so
    // dropping one class will leave the heap striped with same-sized
    // holes, each fenced in by a live survivor.
    let mut holes: Vec<Vec<u64>> = Vec::with_capacity(PAIRS);
    let mut survivors: Vec<Vec<u64>> = Vec::with_capacity(PAIRS);
    for i in 0..PAIRS {
        holes.push(words(HOLE_WORDS, i));
        survivors.push(words(SURVIVOR_WORDS, i));
    }
    let filled = audit("interleaved fill");

    drop(holes);
    let holed = audit("holes punched");
    assert!(holed.free_blocks > filled.free_blocks + PAIRS / 2);

    // Refill with the same size class: best fit drops each object into
    // one of the holes, so the heap does not grow by a single byte.
    let mut refill: Vec<Vec<u64>> = Vec::with_capacity(PAIRS);
    for i in 0..PAIRS {
        refill.push(words(HOLE_WORDS, PAIRS + i));
    }
    let refilled = audit("holes refilled");
    assert_eq!(
        refilled.heap_bytes, holed.heap_bytes,
        "a best-fit refill must not grow the heap",
    );

    // Drop everything: eager coalescing fuses the stripes back into a
    // handful of big free blocks around whatever the runtime itself
    // still holds on to.
    drop(survivors);
    drop(refill);
    let coalesced = audit("everything freed");
    assert!(coalesced.free_blocks < PAIRS / 4);
    assert!(coalesced.free_bytes * 10 >= coalesced.heap_bytes * 9);

    // One request bigger than the whole heap: the free tail is only
    // widened by the missing bytes, not abandoned for a fresh extent.
    let huge = 2 * coalesced.heap_bytes / 8;
    let big: Vec<u64> = words(huge, 0);
    let widened = audit("tail widened for an oversized request");
    let grown = widened.heap_bytes - coalesced.heap_bytes;
    println!(
        "    {}-byte request grew the heap by only {} bytes",
        huge * 8,
        grown,
    );
    assert!(grown < huge * 8);
    drop(big);

    let done = audit("final");
    println!("\nFinished; {} bytes retained for reuse.", done.free_bytes);
}
