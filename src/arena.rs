//! Two-block circular arena over a fixed byte range.
//!
//! CAD scenes allocate and release small records at high rates but with
//! coarse temporal locality: objects are created during a load and released
//! at shutdown. A bump allocator with deferred block retirement matches this
//! pattern and keeps allocation cost O(1) amortized without fragmentation
//! pathologies.
//!
//! The arena manages the range `[buffer_start, buffer_end)` with four
//! markers, ordered at all times as
//!
//! ```text
//! buffer_start <= block2_start <= block2_end <= block1_start <= block1_end <= buffer_end
//! ```
//!
//! Block 1 is the current region; block 2 is the wrapped region created once
//! block 1 reaches the end of the buffer. Allocation records are stored
//! inline in fixed-capacity allocation blocks and are retired strictly FIFO
//! within each region: a fully dead block is popped only once it reaches the
//! head of its list, rewinding the region's start marker. When block 1
//! becomes empty it collapses onto block 2, which then restarts empty at the
//! buffer start.

use {ash::vk, std::collections::VecDeque};

/// Rounds `value` up to the next multiple of `granularity`.
///
/// Granularities are not required to be powers of two; the data storage
/// places 33..=48-byte records on a 48-byte grid.
fn round_up(value: vk::DeviceSize, granularity: vk::DeviceSize) -> vk::DeviceSize {
    value.div_ceil(granularity) * granularity
}

/// Identifies one record inside one [`CircularArena`].
///
/// Ids are arena-local sequence numbers; they are never reused.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct RecordId(u64);

/// One allocation carved out of the arena.
#[derive(Debug)]
pub struct ArenaRecord<T> {
    /// Address of the first byte of the allocation.
    pub address: vk::DeviceAddress,

    /// Byte count of the allocation as requested by the caller.
    pub size: vk::DeviceSize,

    /// Caller data; `None` once the record has been freed.
    pub payload: Option<T>,
}

#[derive(Debug)]
struct AllocationBlock<T, const N: usize> {
    base_seq: u64,
    live: usize,
    records: Vec<ArenaRecord<T>>,
}

impl<T, const N: usize> AllocationBlock<T, N> {
    fn new(base_seq: u64) -> Self {
        Self {
            base_seq,
            live: 0,
            records: Vec::with_capacity(N),
        }
    }
}

/// Two-block circular bump allocator with per-record bookkeeping.
///
/// `N` is the fixed capacity of one allocation block: 200 records for data
/// memories, 32 for image memories.
#[derive(Debug)]
pub struct CircularArena<T, const N: usize> {
    buffer_start: vk::DeviceAddress,
    buffer_end: vk::DeviceAddress,
    block1_start: vk::DeviceAddress,
    block1_end: vk::DeviceAddress,
    block2_start: vk::DeviceAddress,
    block2_end: vk::DeviceAddress,
    list1: VecDeque<AllocationBlock<T, N>>,
    list2: VecDeque<AllocationBlock<T, N>>,
    next_seq: u64,
    used_bytes: vk::DeviceSize,
}

impl<T, const N: usize> CircularArena<T, N> {
    /// Creates an arena over `[buffer_start, buffer_start + size)`.
    ///
    /// A zero-sized arena is valid; every allocation from it fails.
    pub fn new(buffer_start: vk::DeviceAddress, size: vk::DeviceSize) -> Self {
        Self {
            buffer_start,
            buffer_end: buffer_start + size,
            block1_start: buffer_start,
            block1_end: buffer_start,
            block2_start: buffer_start,
            block2_end: buffer_start,
            list1: VecDeque::new(),
            list2: VecDeque::new(),
            next_seq: 0,
            used_bytes: 0,
        }
    }

    /// Address of the first byte managed by the arena.
    pub fn buffer_start(&self) -> vk::DeviceAddress {
        self.buffer_start
    }

    /// Address one past the last byte managed by the arena.
    pub fn buffer_end(&self) -> vk::DeviceAddress {
        self.buffer_end
    }

    /// Sum of the sizes of all live allocations.
    pub fn used_bytes(&self) -> vk::DeviceSize {
        self.used_bytes
    }

    /// Returns `true` when no live allocations remain and all allocation
    /// blocks have been retired.
    pub fn is_empty(&self) -> bool {
        self.list1.is_empty() && self.list2.is_empty()
    }

    /// Allocates `size` bytes placed on the `granularity` grid (relative to
    /// the buffer start).
    ///
    /// Tries block 1 first; when the allocation would cross the buffer end it
    /// wraps into block 2. Returns `None` when neither block has room; no
    /// partial state is published on failure.
    #[profiling::function]
    pub fn alloc(
        &mut self,
        size: vk::DeviceSize,
        granularity: vk::DeviceSize,
        payload: T,
    ) -> Option<(RecordId, vk::DeviceAddress)> {
        debug_assert_ne!(size, 0, "size must be non-zero");
        debug_assert_ne!(granularity, 0);

        let candidate =
            self.buffer_start + round_up(self.block1_end - self.buffer_start, granularity);
        if candidate + size <= self.buffer_end {
            self.block1_end = candidate + size;
            let seq = self.push_record(Region::Block1, candidate, size, payload);

            return Some((RecordId(seq), candidate));
        }

        let candidate =
            self.buffer_start + round_up(self.block2_end - self.buffer_start, granularity);
        if candidate + size <= self.block1_start {
            self.block2_end = candidate + size;
            let seq = self.push_record(Region::Block2, candidate, size, payload);

            return Some((RecordId(seq), candidate));
        }

        None
    }

    /// Marks the record dead and returns its payload.
    ///
    /// The record's slot is not compacted; fully dead allocation blocks are
    /// retired once they reach the head of their region.
    #[profiling::function]
    pub fn free(&mut self, id: RecordId) -> T {
        let record = self
            .record_mut(id)
            .expect("free of an unknown allocation record");
        let payload = record.payload.take().expect("double free of an allocation record");
        let size = record.size;

        let block = Self::block_of(&mut self.list1, id.0)
            .or_else(|| Self::block_of(&mut self.list2, id.0))
            .unwrap();
        debug_assert!(block.live > 0);
        block.live -= 1;

        self.used_bytes -= size;
        self.retire();

        payload
    }

    /// Borrows a record by id.
    pub fn record(&self, id: RecordId) -> Option<&ArenaRecord<T>> {
        Self::block_of_ref(&self.list1, id.0)
            .or_else(|| Self::block_of_ref(&self.list2, id.0))
            .map(|block| &block.records[(id.0 - block.base_seq) as usize])
    }

    /// Mutably borrows a record by id.
    pub fn record_mut(&mut self, id: RecordId) -> Option<&mut ArenaRecord<T>> {
        let list = if Self::block_of_ref(&self.list1, id.0).is_some() {
            &mut self.list1
        } else {
            &mut self.list2
        };

        Self::block_of(list, id.0)
            .map(|block| {
                let idx = (id.0 - block.base_seq) as usize;
                &mut block.records[idx]
            })
    }

    /// Visits every live record.
    pub fn for_each_live(&mut self, mut f: impl FnMut(RecordId, &mut ArenaRecord<T>)) {
        for block in self.list1.iter_mut().chain(self.list2.iter_mut()) {
            for (idx, record) in block.records.iter_mut().enumerate() {
                if record.payload.is_some() {
                    f(RecordId(block.base_seq + idx as u64), record);
                }
            }
        }
    }

    fn push_record(
        &mut self,
        region: Region,
        address: vk::DeviceAddress,
        size: vk::DeviceSize,
        payload: T,
    ) -> u64 {
        let list = match region {
            Region::Block1 => &mut self.list1,
            Region::Block2 => &mut self.list2,
        };

        let needs_block = list
            .back()
            .map(|block| block.records.len() == N)
            .unwrap_or(true);
        if needs_block {
            list.push_back(AllocationBlock::new(self.next_seq));
        }

        let block = list.back_mut().unwrap();
        debug_assert_eq!(block.base_seq + block.records.len() as u64, self.next_seq);
        block.records.push(ArenaRecord {
            address,
            size,
            payload: Some(payload),
        });
        block.live += 1;

        self.used_bytes += size;
        let seq = self.next_seq;
        self.next_seq += 1;

        seq
    }

    fn block_of_ref<'a>(
        list: &'a VecDeque<AllocationBlock<T, N>>,
        seq: u64,
    ) -> Option<&'a AllocationBlock<T, N>> {
        let idx = list.partition_point(|block| block.base_seq <= seq);
        if idx == 0 {
            return None;
        }

        let block = &list[idx - 1];
        (seq - block.base_seq < block.records.len() as u64).then_some(block)
    }

    fn block_of<'a>(
        list: &'a mut VecDeque<AllocationBlock<T, N>>,
        seq: u64,
    ) -> Option<&'a mut AllocationBlock<T, N>> {
        let idx = list.partition_point(|block| block.base_seq <= seq);
        if idx == 0 {
            return None;
        }

        let block = &mut list[idx - 1];
        (seq - block.base_seq < block.records.len() as u64).then_some(block)
    }

    /// Pops fully dead blocks from the heads of both regions, rewinding the
    /// start markers, and collapses block 1 onto block 2 when block 1 runs
    /// out of records entirely.
    fn retire(&mut self) {
        loop {
            while let Some(front) = self.list1.front() {
                if front.live == 0 {
                    self.list1.pop_front();
                } else {
                    break;
                }
            }

            if let Some(front) = self.list1.front() {
                self.block1_start = front.records[0].address;
                break;
            }

            if self.list2.is_empty() {
                debug_assert_eq!(self.used_bytes, 0);

                self.block1_start = self.buffer_start;
                self.block1_end = self.buffer_start;
                self.block2_start = self.buffer_start;
                self.block2_end = self.buffer_start;

                return;
            }

            // Block 1 is empty: block 2 becomes the new block 1 and a fresh
            // empty block 2 restarts at the buffer start
            self.block1_start = self.block2_start;
            self.block1_end = self.block2_end;
            self.block2_start = self.buffer_start;
            self.block2_end = self.buffer_start;
            self.list1 = std::mem::take(&mut self.list2);
        }

        while let Some(front) = self.list2.front() {
            if front.live == 0 {
                self.list2.pop_front();
            } else {
                break;
            }
        }

        if let Some(front) = self.list2.front() {
            self.block2_start = front.records[0].address;
        } else {
            self.block2_start = self.buffer_start;
            self.block2_end = self.buffer_start;
        }
    }

    #[cfg(test)]
    fn assert_invariants(&self) {
        assert!(self.buffer_start <= self.block2_start);
        assert!(self.block2_start <= self.block2_end);
        assert!(self.block2_end <= self.block1_start);
        assert!(self.block1_start <= self.block1_end);
        assert!(self.block1_end <= self.buffer_end);

        let mut live = vec![];
        let mut total = 0;
        for block in self.list1.iter().chain(self.list2.iter()) {
            for record in &block.records {
                if record.payload.is_some() {
                    live.push((record.address, record.size));
                    total += record.size;
                }
            }
        }

        assert_eq!(total, self.used_bytes);

        live.sort_unstable();
        for pair in live.windows(2) {
            assert!(
                pair[0].0 + pair[0].1 <= pair[1].0,
                "live allocations overlap: {pair:?}"
            );
        }
    }
}

enum Region {
    Block1,
    Block2,
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        rand::{Rng, SeedableRng, rngs::SmallRng},
    };

    const BASE: vk::DeviceAddress = 0x1_0000;

    #[test]
    pub fn small_alloc_stress() {
        let mut arena: CircularArena<(), 200> = CircularArena::new(BASE, 64 * 1024);
        let mut ids = vec![];

        let mut prev = None;
        for _ in 0..1000 {
            let (id, addr) = arena.alloc(16, 16, ()).unwrap();

            assert_eq!(addr % 16, 0);
            if let Some(prev) = prev {
                assert!(addr > prev, "addresses must be strictly increasing");
            }

            prev = Some(addr);
            ids.push(id);
        }

        assert_eq!(arena.used_bytes(), 16_000);

        for id in ids {
            arena.free(id);
        }

        assert_eq!(arena.used_bytes(), 0);
        assert!(arena.is_empty());

        // After a full drain the next allocation restarts at the buffer start
        let (_, addr) = arena.alloc(16, 16, ()).unwrap();
        assert_eq!(addr, BASE);
    }

    #[test]
    pub fn exact_fit_and_wrap() {
        let mut arena: CircularArena<(), 2> = CircularArena::new(BASE, 1024);

        let (a, a_addr) = arena.alloc(256, 16, ()).unwrap();
        let (b, b_addr) = arena.alloc(256, 16, ()).unwrap();
        assert_eq!(a_addr, BASE);
        assert_eq!(b_addr, BASE + 256);

        // Exactly reaches buffer_end: must succeed
        let (c, c_addr) = arena.alloc(512, 16, ()).unwrap();
        assert_eq!(c_addr, BASE + 512);

        // One more byte does not fit block 1, and block 2 has no room while
        // block1_start is still at the buffer start
        assert!(arena.alloc(16, 16, ()).is_none());
        arena.assert_invariants();

        // Retiring the first allocation block rewinds block1_start and opens
        // room for block 2
        arena.free(a);
        arena.free(b);
        arena.assert_invariants();

        let (d, d_addr) = arena.alloc(16, 16, ()).unwrap();
        assert_eq!(d_addr, BASE, "wrapped allocation lands at the buffer start");
        arena.assert_invariants();

        // Freeing c empties block 1, which collapses onto block 2
        arena.free(c);
        arena.assert_invariants();

        let (e, e_addr) = arena.alloc(256, 16, ()).unwrap();
        assert_eq!(e_addr, BASE + 16, "block 1 continues above the collapsed block 2");

        arena.free(d);
        arena.free(e);
        assert!(arena.is_empty());
        assert_eq!(arena.used_bytes(), 0);
        arena.assert_invariants();

        let (_, addr) = arena.alloc(16, 16, ()).unwrap();
        assert_eq!(addr, BASE);
    }

    #[test]
    pub fn adversarial_free_order() {
        let mut arena: CircularArena<(), 2> = CircularArena::new(BASE, 4096);

        let ids = (0..6)
            .map(|_| arena.alloc(64, 16, ()).unwrap().0)
            .collect::<Vec<_>>();

        // Free a middle block first; it must stay queued until it becomes the
        // head of its list
        arena.free(ids[2]);
        arena.free(ids[3]);
        arena.assert_invariants();
        assert_eq!(arena.used_bytes(), 4 * 64);

        arena.free(ids[0]);
        arena.free(ids[1]);
        arena.assert_invariants();

        arena.free(ids[5]);
        arena.free(ids[4]);
        assert!(arena.is_empty());
        assert_eq!(arena.used_bytes(), 0);
        arena.assert_invariants();
    }

    #[test]
    pub fn zero_sized_arena_refuses() {
        let mut arena: CircularArena<(), 200> = CircularArena::new(0, 0);

        assert!(arena.alloc(1, 1, ()).is_none());
        assert!(arena.is_empty());
    }

    #[test]
    pub fn payload_returned_on_free() {
        let mut arena: CircularArena<u32, 200> = CircularArena::new(BASE, 1024);

        let (id, _) = arena.alloc(16, 16, 42).unwrap();
        assert_eq!(arena.record(id).unwrap().payload, Some(42));
        assert_eq!(arena.free(id), 42);
    }

    #[test]
    pub fn fuzz_alloc_free() {
        let mut rng = SmallRng::seed_from_u64(42);
        let mut arena: CircularArena<(), 8> = CircularArena::new(BASE, 1 << 16);
        let mut live = vec![];

        for _ in 0..10_000 {
            if live.is_empty() || (rng.random_range(0..100) < 60 && live.len() < 512) {
                let size = 16 * rng.random_range(1..9) as vk::DeviceSize;
                if let Some((id, _)) = arena.alloc(size, 16, ()) {
                    live.push(id);
                }
            } else {
                let idx = rng.random_range(0..live.len());
                let id = live.swap_remove(idx);
                arena.free(id);
            }

            arena.assert_invariants();
        }

        for id in live {
            arena.free(id);
        }

        assert!(arena.is_empty());
        assert_eq!(arena.used_bytes(), 0);
        arena.assert_invariants();
    }
}
