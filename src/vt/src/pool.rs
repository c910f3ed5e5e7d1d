//! Physical page pool and the page-table update expansion engine.
//!
//! The pool owns every physical slot of the backing texture. Residency is a
//! hash from `(space, level, address)` to slot; reuse order is a min-heap
//! keyed `(frame << 4) | level`, so older pages evict first and, within a
//! frame, finer pages are taken before the coarser pages that may still be
//! standing in for them.
//!
//! A sorted index of every mapped page (key `space[56..64] | level[48..56] |
//! address[0..48]`) supports the update expansion: turning one map or unmap
//! event into the minimal set of rectangular page-table writes that leave
//! already-mapped descendants intact.

use std::mem;
use std::ops::Range;

use index_collections::{radix_sort_u32, BinaryHeap, HashTable};
use vtx_hal::addr::hash_page;
use vtx_hal::{Backend, PageTableUpdate};

use crate::space::{PageUpdate, SpaceTable, INVALID_SPACE};

/// One physical slot's current mapping.
#[derive(Clone, Copy, Debug)]
pub struct Page {
    /// Morton address, relative to mip 0.
    pub v_address: u64,
    /// The slot index itself.
    pub p_address: u16,
    /// Mip level this slot is mapped at.
    pub v_level: u8,
    /// Owning space, `INVALID_SPACE` while unmapped.
    pub space_id: u8,
}

#[inline]
fn encode_sort_key(space_id: u8, v_level: u8, v_address: u64) -> u64 {
    v_address | ((v_level as u64) << 48) | ((space_id as u64) << 56)
}

#[inline]
fn decode_sort_key(key: u64) -> (u8, u8, u64) {
    (
        (key >> 56) as u8,
        ((key >> 48) & 0xf) as u8,
        key & 0xffff_ffff_ffff,
    )
}

/// Fixed-size physical page allocator with LRU reuse.
pub struct PagePool {
    dimensions: u8,
    pages: Vec<Page>,
    hash: HashTable,
    free_heap: BinaryHeap<u32>,

    unsorted_keys: Vec<u64>,
    unsorted_indexes: Vec<u16>,
    sorted_keys: Vec<u64>,
    sorted_indexes: Vec<u16>,
    sorted_dirty: bool,

    // Pending edits against the sorted index: high 16 bits are the sorted
    // position at queue time, low 16 the slot.
    sub_pending: Vec<u32>,
    add_pending: Vec<u32>,
    sort_scratch: Vec<u32>,

    // Ping-pong scratch for the masked quadtree split.
    loop_input: Vec<PageUpdate>,
    loop_output: Vec<PageUpdate>,
    split_stack: Vec<PageUpdate>,
}

impl PagePool {
    /// A pool of `size` slots for `dimensions`-dimensional addresses.
    pub fn new(size: u32, dimensions: u8) -> Self {
        assert!(size <= 0x10000);

        let mut free_heap = BinaryHeap::new(size, size);
        let pages = (0..size)
            .map(|i| {
                free_heap.add(0, i);
                Page {
                    v_address: 0,
                    p_address: i as u16,
                    v_level: 0,
                    space_id: INVALID_SPACE,
                }
            })
            .collect();

        PagePool {
            dimensions,
            pages,
            hash: HashTable::new(2048, size),
            free_heap,
            unsorted_keys: Vec::with_capacity(size as usize),
            unsorted_indexes: Vec::with_capacity(size as usize),
            sorted_keys: Vec::with_capacity(size as usize),
            sorted_indexes: Vec::with_capacity(size as usize),
            sorted_dirty: false,
            sub_pending: Vec::new(),
            add_pending: Vec::new(),
            sort_scratch: Vec::new(),
            loop_input: Vec::new(),
            loop_output: Vec::new(),
            split_stack: Vec::new(),
        }
    }

    pub fn size(&self) -> u32 {
        self.pages.len() as u32
    }

    pub fn page(&self, p_address: u16) -> &Page {
        &self.pages[p_address as usize]
    }

    /// Whether a slot can be taken this frame. Slots freed or touched this
    /// frame are off limits: their content may still be sampled.
    pub fn any_free_available(&self, frame: u32) -> bool {
        if self.free_heap.is_empty() {
            return false;
        }
        // Keys mix in the level to keep parents behind their children.
        let page_frame = self.free_heap.get_key(self.free_heap.top()) >> 4;
        page_frame != frame
    }

    /// Takes the least recently used slot, or `None` if everything was
    /// touched this frame. The caller must `unmap` the slot before mapping
    /// it to a new tuple.
    pub fn alloc(&mut self, frame: u32) -> Option<u16> {
        if !self.any_free_available(frame) {
            return None;
        }
        Some(self.free_heap.pop() as u16)
    }

    /// Returns a slot to the reuse heap, stamped with `frame`.
    pub fn free(&mut self, frame: u32, p_address: u16) {
        let level = self.pages[p_address as usize].v_level;
        self.free_heap
            .add((frame << 4) + (level & 0xf) as u32, p_address as u32);
    }

    /// Re-stamps a resident slot to `frame` without changing its mapping.
    pub fn update_usage(&mut self, frame: u32, p_address: u16) {
        let level = self.pages[p_address as usize].v_level;
        self.free_heap
            .update((frame << 4) + (level & 0xf) as u32, p_address as u32);
    }

    /// Exact-match residency lookup.
    pub fn find_page(&self, space_id: u8, v_level: u8, v_address: u64) -> Option<u16> {
        let key = hash_page(v_level, v_address, self.dimensions);
        for index in self.hash.iter(key) {
            let page = &self.pages[index as usize];
            if page.space_id == space_id && page.v_level == v_level && page.v_address == v_address {
                return Some(index as u16);
            }
        }
        None
    }

    /// Walks up the mip chain from `(v_level, v_address)` until a mapped
    /// ancestor is found.
    pub fn find_nearest_page(&self, space_id: u8, v_level: u8, v_address: u64) -> Option<u16> {
        let mut v_level = v_level;
        let mut v_address = v_address;
        while v_level < 16 {
            if let Some(p_address) = self.find_page(space_id, v_level, v_address) {
                return Some(p_address);
            }
            v_level += 1;
            v_address &= !0u64 << (self.dimensions as u32 * v_level as u32);
        }
        None
    }

    /// Unmaps a slot. If it was mapped, queues a page-table rewrite on the
    /// owning space resolving the vacated region to its nearest mapped
    /// ancestor (or to a clear if there is none).
    pub fn unmap<B: Backend>(&mut self, p_address: u16, spaces: &mut SpaceTable<B>) {
        let page = self.pages[p_address as usize];

        if page.space_id != INVALID_SPACE {
            self.hash.remove(
                hash_page(page.v_level, page.v_address, self.dimensions),
                p_address as u32,
            );

            let ancestor = self.find_nearest_page(page.space_id, page.v_level, page.v_address);
            let ancestor_level = ancestor.map_or(0xff, |p| self.pages[p as usize].v_level);
            let ancestor_p_address = ancestor.unwrap_or(!0u16);
            if let Some(space) = spaces.get_mut(page.space_id) {
                space.queue_update(
                    page.v_level,
                    page.v_address,
                    ancestor_level,
                    ancestor_p_address,
                );
            }
            trace!(
                "unmap slot {} from space {} level {} addr {:#x}",
                p_address,
                page.space_id,
                page.v_level,
                page.v_address
            );

            let old_key = encode_sort_key(page.space_id, page.v_level, page.v_address);
            let old_index = self.lower_bound(0, self.sorted_keys.len(), old_key, !0u64);
            self.sub_pending
                .push(((old_index as u32) << 16) | p_address as u32);
        }

        let page = &mut self.pages[p_address as usize];
        page.v_level = 0;
        page.v_address = 0;
        page.space_id = INVALID_SPACE;

        self.sorted_dirty = true;
    }

    /// Maps a slot to `(space_id, v_level, v_address)` and queues the
    /// page-table rewrite for the newly resolved region. The slot must be
    /// unmapped.
    pub fn map<B: Backend>(
        &mut self,
        space_id: u8,
        v_level: u8,
        v_address: u64,
        p_address: u16,
        spaces: &mut SpaceTable<B>,
    ) {
        debug_assert_eq!(self.pages[p_address as usize].space_id, INVALID_SPACE);

        {
            let page = &mut self.pages[p_address as usize];
            page.v_level = v_level;
            page.v_address = v_address;
            page.space_id = space_id;
        }

        let new_key = encode_sort_key(space_id, v_level, v_address);
        let new_index = self.upper_bound(0, self.sorted_keys.len(), new_key, !0u64);
        self.add_pending
            .push(((new_index as u32) << 16) | p_address as u32);

        self.hash.add(
            hash_page(v_level, v_address, self.dimensions),
            p_address as u32,
        );
        if let Some(space) = spaces.get_mut(space_id) {
            space.queue_update(v_level, v_address, v_level, p_address);
        }
        trace!(
            "map slot {} to space {} level {} addr {:#x}",
            p_address,
            space_id,
            v_level,
            v_address
        );

        self.sorted_dirty = true;
    }

    /// Merges the pending edits into a fresh sorted index. Runs lazily on
    /// the first query after pool mutations.
    fn build_sorted_keys(&mut self) {
        // Removals sort by position alone; insertions by the encoded key of
        // the newly mapped page, which also orders their positions.
        if self.sort_scratch.len() < self.sub_pending.len() {
            self.sort_scratch.resize(self.sub_pending.len(), 0);
        }
        radix_sort_u32(&mut self.sub_pending, &mut self.sort_scratch);
        let pages = &self.pages;
        self.add_pending.sort_unstable_by_key(|&entry| {
            let page = &pages[(entry & 0xffff) as usize];
            encode_sort_key(page.space_id, page.v_level, page.v_address)
        });

        mem::swap(&mut self.sorted_keys, &mut self.unsorted_keys);
        mem::swap(&mut self.sorted_indexes, &mut self.unsorted_indexes);

        let num_unsorted = self.unsorted_keys.len();
        let num_sorted = num_unsorted + self.add_pending.len() - self.sub_pending.len();
        self.sorted_keys.clear();
        self.sorted_keys.reserve(num_sorted);
        self.sorted_indexes.clear();
        self.sorted_indexes.reserve(num_sorted);

        let mut sub_i = 0;
        let mut add_i = 0;
        let mut unsorted_i = 0;

        while self.sorted_keys.len() < num_sorted {
            let sub_index = self
                .sub_pending
                .get(sub_i)
                .map_or(num_unsorted, |&entry| (entry >> 16) as usize);
            let add_index = self
                .add_pending
                .get(add_i)
                .map_or(num_unsorted, |&entry| (entry >> 16) as usize);

            let interval = sub_index.min(add_index) - unsorted_i;
            if interval > 0 {
                let range = unsorted_i..unsorted_i + interval;
                self.sorted_keys
                    .extend_from_slice(&self.unsorted_keys[range.clone()]);
                self.sorted_indexes
                    .extend_from_slice(&self.unsorted_indexes[range]);
                unsorted_i += interval;

                if self.sorted_keys.len() >= num_sorted {
                    break;
                }
            }

            if sub_index < add_index {
                // Skip the hole left by the removed entry.
                unsorted_i += 1;
                sub_i += 1;
            } else {
                let p_address = (self.add_pending[add_i] & 0xffff) as u16;
                let page = &self.pages[p_address as usize];
                self.sorted_keys
                    .push(encode_sort_key(page.space_id, page.v_level, page.v_address));
                self.sorted_indexes.push(p_address);
                add_i += 1;
            }
        }

        self.sub_pending.clear();
        self.add_pending.clear();
        self.sorted_dirty = false;
    }

    // Binary searches over `sorted_keys & mask`, range [min, max).

    fn lower_bound(&self, mut min: usize, mut max: usize, search_key: u64, mask: u64) -> usize {
        while min != max {
            let mid = min + (max - min) / 2;
            let key = self.sorted_keys[mid] & mask;
            if search_key <= key {
                max = mid;
            } else {
                min = mid + 1;
            }
        }
        min
    }

    fn upper_bound(&self, mut min: usize, mut max: usize, search_key: u64, mask: u64) -> usize {
        while min != max {
            let mid = min + (max - min) / 2;
            let key = self.sorted_keys[mid] & mask;
            if search_key < key {
                max = mid;
            } else {
                min = mid + 1;
            }
        }
        min
    }

    fn equal_range(
        &self,
        mut min: usize,
        mut max: usize,
        search_key: u64,
        mask: u64,
    ) -> Option<Range<usize>> {
        while min != max {
            let mid = min + (max - min) / 2;
            let key = self.sorted_keys[mid] & mask;
            if search_key < key {
                max = mid;
            } else if search_key > key {
                min = mid + 1;
            } else {
                // Range straddles mid; search both sides.
                let lo = self.lower_bound(min, mid, search_key, mask);
                let hi = self.upper_bound(mid + 1, max, search_key, mask);
                return Some(lo..hi);
            }
        }
        None
    }

    /// Emits every mapped page of `space_id` into every mip it covers,
    /// coarsest first: a full page-table rebuild.
    pub fn refresh_entire_page_table(&mut self, space_id: u8, output: &mut [Vec<PageTableUpdate>]) {
        if self.sorted_dirty {
            self.build_sorted_keys();
        }

        for i in (0..self.sorted_keys.len()).rev() {
            let (id, v_level, v_address) = decode_sort_key(self.sorted_keys[i]);
            if id != space_id {
                continue;
            }
            let update = PageUpdate {
                v_address,
                p_address: self.sorted_indexes[i],
                v_level,
                v_log_size: v_level,
            };
            for mip in 0..=v_level {
                output[mip as usize].push(update.into());
            }
        }
    }

    /// Expands one rewrite into per-mip writes, painter's style: the input
    /// rectangle first, then every mapped descendant drawn over it in
    /// ascending address order. The consumer applies writes in order.
    pub fn expand_painters(
        &mut self,
        space_id: u8,
        update: PageUpdate,
        output: &mut [Vec<PageTableUpdate>],
    ) {
        if self.sorted_dirty {
            self.build_sorted_keys();
        }

        let mut loop_output = mem::replace(&mut self.loop_output, Vec::new());
        loop_output.clear();

        let v_log_size = update.v_log_size;
        let v_address = update.v_address;

        output[v_log_size as usize].push(update.into());
        loop_output.push(update);

        let mask = !0u64 << (self.dimensions as u32 * v_log_size as u32);
        let mut search_range = self.sorted_keys.len();

        for mip in (0..v_log_size).rev() {
            let search_key = encode_sort_key(space_id, mip, v_address);

            if let Some(descendants) = self.equal_range(0, search_range, search_key, mask) {
                // Sorted by level, so anything coarser sits before this run.
                search_range = descendants.start;

                for i in descendants {
                    debug_assert_eq!(search_key, self.sorted_keys[i] & mask);
                    let (_, _, descendant_address) = decode_sort_key(self.sorted_keys[i]);

                    loop_output.push(PageUpdate {
                        v_address: descendant_address,
                        p_address: self.sorted_indexes[i],
                        v_level: mip,
                        v_log_size: mip,
                    });
                }
            }

            output[mip as usize].extend(loop_output.iter().map(|&u| PageTableUpdate::from(u)));
        }

        self.loop_output = loop_output;
    }

    /// Expands one rewrite into per-mip writes, masked style: at each mip
    /// the emitted rectangles exactly cover the input region minus every
    /// mapped descendant, found by quadtree-splitting the working set
    /// against the descendants in ascending address order.
    pub fn expand_masked(
        &mut self,
        space_id: u8,
        update: PageUpdate,
        output: &mut [Vec<PageTableUpdate>],
    ) {
        if self.sorted_dirty {
            self.build_sorted_keys();
        }

        let dimensions = self.dimensions;
        let mut loop_input = mem::replace(&mut self.loop_input, Vec::new());
        let mut loop_output = mem::replace(&mut self.loop_output, Vec::new());
        let mut stack = mem::replace(&mut self.split_stack, Vec::new());
        loop_input.clear();
        loop_output.clear();
        debug_assert!(stack.is_empty());

        let v_log_size = update.v_log_size;
        let v_address = update.v_address;

        output[v_log_size as usize].push(update.into());
        loop_output.push(update);

        let mask = !0u64 << (dimensions as u32 * v_log_size as u32);
        let mut search_range = self.sorted_keys.len();

        for mip in (0..v_log_size).rev() {
            let search_key = encode_sort_key(space_id, mip, v_address);

            if let Some(descendants) = self.equal_range(0, search_range, search_key, mask) {
                search_range = descendants.start;

                // Ping pong input and output.
                mem::swap(&mut loop_input, &mut loop_output);
                loop_output.clear();
                let mut input_index = 1;
                let mut current = Some(loop_input[0]);

                let mut i = descendants.start;
                while i < descendants.end {
                    debug_assert_eq!(search_key, self.sorted_keys[i] & mask);
                    let (_, _, descendant_address) = decode_sort_key(self.sorted_keys[i]);
                    let descendant = PageUpdate {
                        v_address: descendant_address,
                        p_address: self.sorted_indexes[i],
                        v_level: mip,
                        v_log_size: mip,
                    };

                    let mut working = match current {
                        Some(working) => working,
                        None => break,
                    };
                    working.check(dimensions);
                    descendant.check(dimensions);
                    debug_assert!(working.v_log_size >= mip);

                    let working_size = 1u64 << (dimensions as u32 * working.v_log_size as u32);
                    let descendant_size =
                        1u64 << (dimensions as u32 * descendant.v_log_size as u32);

                    if working.v_address > descendant.v_address {
                        // Working quad is past this descendant.
                        debug_assert!(
                            working.v_address >= descendant.v_address + descendant_size
                        );
                        i += 1;
                        continue;
                    } else if working.v_address + working_size <= descendant.v_address {
                        // Entirely before the descendant: emit as is.
                        loop_output.push(working);
                    } else if working.v_address == descendant.v_address
                        && working.v_log_size == descendant.v_log_size
                    {
                        // Exactly covered: drop the quad.
                        i += 1;
                    } else {
                        debug_assert!(working.v_log_size > mip);

                        // Intersects but isn't cell-sized yet: split into
                        // 2^D children. Reverse push keeps the leftmost
                        // child (the working quad itself) first.
                        working.v_log_size -= 1;
                        for sibling in (1..(1u64 << dimensions)).rev() {
                            stack.push(working.child(sibling, dimensions));
                        }
                        current = Some(working);
                        continue;
                    }

                    // Fetch the next working quad.
                    current = stack.pop().or_else(|| {
                        let next = loop_input.get(input_index).copied();
                        input_index += 1;
                        next
                    });
                }

                if let Some(working) = current {
                    loop_output.push(working);
                }
                while let Some(working) = stack.pop() {
                    loop_output.push(working);
                }
                if input_index < loop_input.len() {
                    loop_output.extend_from_slice(&loop_input[input_index..]);
                }
            }

            if loop_output.is_empty() {
                // Completely masked out by descendants.
                break;
            }
            output[mip as usize].extend(loop_output.iter().map(|&u| PageTableUpdate::from(u)));
        }

        self.loop_input = loop_input;
        self.loop_output = loop_output;
        self.split_stack = stack;
    }

    #[cfg(test)]
    pub(crate) fn sorted_keys(&mut self) -> &[u64] {
        if self.sorted_dirty {
            self.build_sorted_keys();
        }
        &self.sorted_keys
    }

    #[cfg(test)]
    pub(crate) fn free_heap_len(&self) -> u32 {
        self.free_heap.num()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::space::SpaceTable;
    use vtx_backend_soft::Backend as Soft;

    fn spaces() -> SpaceTable<Soft> {
        SpaceTable::new()
    }

    #[test]
    fn test_map_find_unmap() {
        let mut spaces = spaces();
        let mut pool = PagePool::new(8, 2);

        let p = pool.alloc(1).unwrap();
        pool.unmap(p, &mut spaces);
        pool.map(0, 0, 5, p, &mut spaces);

        assert_eq!(pool.find_page(0, 0, 5), Some(p));
        assert_eq!(pool.find_page(0, 0, 6), None);
        assert_eq!(pool.find_page(1, 0, 5), None);

        pool.unmap(p, &mut spaces);
        assert_eq!(pool.find_page(0, 0, 5), None);
        assert_eq!(pool.page(p).space_id, INVALID_SPACE);
    }

    #[test]
    fn test_find_nearest_walks_ancestors() {
        let mut spaces = spaces();
        let mut pool = PagePool::new(8, 2);

        let p = pool.alloc(1).unwrap();
        pool.unmap(p, &mut spaces);
        pool.map(0, 2, 0, p, &mut spaces);

        // (level 0, addr 3) has ancestors (1, 0) and (2, 0).
        assert_eq!(pool.find_nearest_page(0, 0, 3), Some(p));
        assert_eq!(pool.find_nearest_page(0, 0, 16), None);
        assert_eq!(pool.find_nearest_page(1, 0, 3), None);
    }

    #[test]
    fn test_eviction_prefers_child_within_frame() {
        let mut spaces = spaces();
        let mut pool = PagePool::new(2, 2);

        // Frame 1: the level-1 parent streams in.
        let parent = pool.alloc(1).unwrap();
        pool.unmap(parent, &mut spaces);
        pool.map(0, 1, 0, parent, &mut spaces);
        pool.free(1, parent);

        // Frame 2: the level-0 child streams in; request expansion touches
        // the parent in the same frame.
        let child = pool.alloc(2).unwrap();
        pool.unmap(child, &mut spaces);
        pool.map(0, 0, 0, child, &mut spaces);
        pool.free(2, child);
        pool.update_usage(2, parent);

        // Frame 3: the key (frame << 4) | level orders the child first.
        assert_eq!(pool.alloc(3), Some(child));
    }

    #[test]
    fn test_exhaustion_within_frame() {
        let mut spaces = spaces();
        let mut pool = PagePool::new(1, 2);

        let p = pool.alloc(7).unwrap();
        pool.unmap(p, &mut spaces);
        pool.map(0, 0, 0, p, &mut spaces);
        pool.free(7, p);

        // The only slot was touched this frame.
        assert!(!pool.any_free_available(7));
        assert_eq!(pool.alloc(7), None);
        assert!(pool.any_free_available(8));
    }

    #[test]
    fn test_sorted_keys_strictly_ascending() {
        let mut spaces = spaces();
        let mut pool = PagePool::new(16, 2);

        let mapped = [(0u8, 0u8, 12u64), (0, 1, 4), (0, 0, 3), (1, 0, 3), (0, 2, 16)];
        let mut slots = Vec::new();
        for &(id, level, addr) in &mapped {
            let p = pool.alloc(1).unwrap();
            pool.unmap(p, &mut spaces);
            pool.map(id, level, addr, p, &mut spaces);
            slots.push(p);
        }

        {
            let keys = pool.sorted_keys();
            assert_eq!(keys.len(), mapped.len());
            assert!(keys.windows(2).all(|w| w[0] < w[1]));
        }

        // Interleave removals and additions against the stale positions.
        pool.unmap(slots[1], &mut spaces);
        pool.unmap(slots[3], &mut spaces);
        let p = pool.alloc(2).unwrap();
        pool.unmap(p, &mut spaces);
        pool.map(0, 1, 8, p, &mut spaces);
        let q = pool.alloc(2).unwrap();
        pool.unmap(q, &mut spaces);
        pool.map(2, 0, 1, q, &mut spaces);

        let keys = pool.sorted_keys();
        assert_eq!(keys.len(), mapped.len());
        assert!(keys.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_free_heap_tracks_every_slot() {
        let mut spaces = spaces();
        let mut pool = PagePool::new(4, 2);
        assert_eq!(pool.free_heap_len(), 4);

        let p = pool.alloc(1).unwrap();
        assert_eq!(pool.free_heap_len(), 3);
        pool.unmap(p, &mut spaces);
        pool.map(0, 0, 0, p, &mut spaces);
        pool.free(1, p);
        assert_eq!(pool.free_heap_len(), 4);
    }
}
