//! Virtual address allocation within one space.

use index_collections::HashTable;

/// No producer / no free link.
const INVALID: u16 = 0xffff;

#[derive(Clone, Copy, Debug)]
struct AddressBlock {
    producer: u16,
    v_address: u64,
    next_free: u16,
    prev_free: u16,
    v_log_size: u8,
    mip_bias: u8,
}

impl AddressBlock {
    fn new(v_log_size: u8) -> Self {
        AddressBlock {
            producer: INVALID,
            v_address: 0,
            next_free: INVALID,
            prev_free: INVALID,
            v_log_size,
            mip_bias: 0,
        }
    }

    fn sibling(&self, offset: u64, dimensions: u8) -> Self {
        AddressBlock {
            producer: INVALID,
            v_address: self.v_address + (offset << (dimensions as u32 * self.v_log_size as u32)),
            next_free: INVALID,
            prev_free: INVALID,
            v_log_size: self.v_log_size,
            mip_bias: 0,
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct SortedBlock {
    v_address: u64,
    index: u16,
}

/// Buddy allocator over the Morton address square of one space.
///
/// Power-of-two blocks subdivide on demand; a block is either wholly free
/// (linked into its size class's free list) or wholly owned by one
/// producer. The union of all blocks is the full square and blocks are
/// disjoint.
pub struct AddressAllocator {
    dimensions: u8,
    blocks: Vec<AddressBlock>,
    free_list: Vec<u16>,
    sorted_blocks: Vec<SortedBlock>,
    hash: HashTable,
}

impl AddressAllocator {
    /// An allocator over a square of side `size` pages.
    pub fn new(size: u32, dimensions: u8) -> Self {
        let log_size = size.next_power_of_two().trailing_zeros() as u8;

        // One empty block covering everything; free lists per size class.
        let mut free_list = vec![INVALID; log_size as usize + 1];
        free_list[log_size as usize] = 0;

        AddressAllocator {
            dimensions,
            blocks: vec![AddressBlock::new(log_size)],
            free_list,
            sorted_blocks: vec![SortedBlock {
                v_address: 0,
                index: 0,
            }],
            hash: HashTable::new(256, 16),
        }
    }

    // Index of the greatest sorted block with address <= v_address.
    fn find_sorted(&self, v_address: u64) -> usize {
        let mut min = 0;
        let mut max = self.sorted_blocks.len();
        while min != max {
            let mid = min + (max - min) / 2;
            if v_address < self.sorted_blocks[mid].v_address {
                max = mid;
            } else {
                min = mid + 1;
            }
        }
        min - 1
    }

    /// Resolves an address to the owning producer and the producer-local
    /// address. `None` if the address falls in a free block.
    pub fn find(&self, v_address: u64) -> Option<(u16, u64)> {
        let sorted = self.sorted_blocks[self.find_sorted(v_address)];
        let block = &self.blocks[sorted.index as usize];
        debug_assert_eq!(sorted.v_address, block.v_address);

        let block_size = 1u64 << (self.dimensions as u32 * block.v_log_size as u32);
        if block.producer != INVALID
            && v_address >= block.v_address
            && v_address < block.v_address + block_size
        {
            // TODO mip bias
            Some((block.producer, v_address - block.v_address))
        } else {
            None
        }
    }

    fn unlink_free(&mut self, index: u16) {
        let (prev, next, log_size) = {
            let block = &self.blocks[index as usize];
            (block.prev_free, block.next_free, block.v_log_size)
        };
        if prev != INVALID {
            self.blocks[prev as usize].next_free = next;
        } else {
            self.free_list[log_size as usize] = next;
        }
        if next != INVALID {
            self.blocks[next as usize].prev_free = prev;
        }
        let block = &mut self.blocks[index as usize];
        block.prev_free = INVALID;
        block.next_free = INVALID;
    }

    fn push_free(&mut self, index: u16) {
        let log_size = self.blocks[index as usize].v_log_size;
        let head = self.free_list[log_size as usize];
        self.blocks[index as usize].next_free = head;
        self.blocks[index as usize].prev_free = INVALID;
        if head != INVALID {
            self.blocks[head as usize].prev_free = index;
        }
        self.free_list[log_size as usize] = index;
    }

    /// Carves out the smallest free block that fits a producer of
    /// `size_in_pages` pages on its longest side. Returns the block's base
    /// address, or `None` if no free block is large enough.
    pub fn alloc(&mut self, producer: u16, size_in_pages: u32) -> Option<u64> {
        let v_log_size = size_in_pages.next_power_of_two().trailing_zeros() as u8;

        // Smallest free size class that fits.
        let mut free_index = INVALID;
        for class in v_log_size as usize..self.free_list.len() {
            if self.free_list[class] != INVALID {
                free_index = self.free_list[class];
                break;
            }
        }
        if free_index == INVALID {
            return None;
        }

        debug_assert_eq!(self.blocks[free_index as usize].producer, INVALID);
        self.unlink_free(free_index);
        self.blocks[free_index as usize].producer = producer;
        self.hash.add(producer, free_index as u32);

        // Subdivide until the block is the right size; every split spawns
        // 2^D - 1 free siblings.
        let mut new_blocks = Vec::new();
        while self.blocks[free_index as usize].v_log_size > v_log_size {
            self.blocks[free_index as usize].v_log_size -= 1;
            let parent = self.blocks[free_index as usize];
            for sibling in (1..(1u64 << self.dimensions)).rev() {
                let index = self.blocks.len() as u16;
                self.blocks.push(parent.sibling(sibling, self.dimensions));
                new_blocks.push(index);
                self.push_free(index);
            }
        }

        let v_address = self.blocks[free_index as usize].v_address;

        if !new_blocks.is_empty() {
            // Splice the new siblings into the sorted list, ascending.
            let blocks = &self.blocks;
            new_blocks.sort_unstable_by_key(|&index| blocks[index as usize].v_address);

            let sorted_index = self.find_sorted(v_address) + 1;
            debug_assert_eq!(self.sorted_blocks[sorted_index - 1].v_address, v_address);
            let entries = new_blocks.iter().map(|&index| SortedBlock {
                v_address: blocks[index as usize].v_address,
                index,
            });
            self.sorted_blocks
                .splice(sorted_index..sorted_index, entries.collect::<Vec<_>>());
        }

        Some(v_address)
    }

    /// Returns a producer's block to its size class's free list.
    pub fn free(&mut self, producer: u16) {
        let mut found = !0u32;
        for index in self.hash.iter(producer) {
            if self.blocks[index as usize].producer == producer {
                found = index;
                break;
            }
        }
        if found == !0u32 {
            return;
        }

        self.hash.remove(producer, found);
        let index = found as u16;
        debug_assert_eq!(self.blocks[index as usize].next_free, INVALID);
        debug_assert_eq!(self.blocks[index as usize].prev_free, INVALID);
        self.blocks[index as usize].producer = INVALID;

        // TODO: coalesce free sibling blocks back into their parent.

        self.push_free(index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_block() {
        let mut alloc = AddressAllocator::new(16, 2);
        assert_eq!(alloc.alloc(0, 16), Some(0));
        assert_eq!(alloc.find(0), Some((0, 0)));
        assert_eq!(alloc.find(255), Some((0, 255)));
        // Full.
        assert_eq!(alloc.alloc(1, 1), None);
    }

    #[test]
    fn test_subdivision() {
        let mut alloc = AddressAllocator::new(16, 2);
        // An 8-page texture takes one quadrant of the 16-page square.
        let a = alloc.alloc(0, 8).unwrap();
        let b = alloc.alloc(1, 8).unwrap();
        assert_eq!(a, 0);
        assert_eq!(b, 64);

        // Local addresses are block-relative.
        assert_eq!(alloc.find(64 + 5), Some((1, 5)));
        assert_eq!(alloc.find(3), Some((0, 3)));
        // The remaining two quadrants are free.
        assert_eq!(alloc.find(128), None);
    }

    #[test]
    fn test_smallest_fit_and_reuse() {
        let mut alloc = AddressAllocator::new(16, 2);
        let small = alloc.alloc(0, 2).unwrap();
        assert_eq!(small, 0);

        // Frees go back to their own size class.
        alloc.free(0);
        assert_eq!(alloc.find(small), None);
        assert_eq!(alloc.alloc(1, 2), Some(small));
    }

    #[test]
    fn test_sorted_lookup_across_sizes() {
        let mut alloc = AddressAllocator::new(16, 2);
        let a = alloc.alloc(0, 4).unwrap();
        let b = alloc.alloc(1, 2).unwrap();
        let c = alloc.alloc(2, 8).unwrap();
        assert_ne!(a, b);
        assert_ne!(b, c);

        for (producer, base, size) in [(0u16, a, 4u64), (1, b, 2), (2, c, 8)].iter() {
            let block_len = size * size;
            assert_eq!(alloc.find(*base), Some((*producer, 0)));
            assert_eq!(
                alloc.find(*base + block_len - 1),
                Some((*producer, block_len - 1))
            );
        }
    }
}
