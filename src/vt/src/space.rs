//! Virtual address spaces and their page-table update queues.

use std::mem;

use vtx_hal::format::{Extent2d, Format};
use vtx_hal::{Backend, BackendError, Device, PageProducer, PageTableUpdate, TextureFlags};

use crate::allocator::AddressAllocator;
use crate::pool::PagePool;
use crate::system::UpdateVariant;

/// Maximum number of simultaneously registered spaces; ids are reused.
pub const MAX_SPACES: usize = 16;

/// Maximum page-table mip levels a space can carry.
pub const MAX_LEVELS: usize = 16;

/// Unregistered space id.
pub const INVALID_SPACE: u8 = 0xff;

/// One queued page-table rewrite, before expansion against mapped
/// descendants.
///
/// `v_level` is the mip level of the page `p_address` resolves to;
/// `v_log_size` is the log2 side of the rewritten square in cells of the
/// queue-time mip. An unmap with no mapped ancestor queues `v_level == 0xff`
/// and `p_address == 0xffff`, which the consumer treats as a clear.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageUpdate {
    /// Morton address of the region's min corner.
    pub v_address: u64,
    /// Physical slot the covered cells resolve to.
    pub p_address: u16,
    /// Mip level of the resolved page.
    pub v_level: u8,
    /// Log2 side length of the rewritten square.
    pub v_log_size: u8,
}

impl PageUpdate {
    /// Sibling quadrant `offset` of this update at its own size.
    pub fn child(&self, offset: u64, dimensions: u8) -> Self {
        PageUpdate {
            v_address: self.v_address + (offset << (dimensions as u32 * self.v_log_size as u32)),
            ..*self
        }
    }

    pub(crate) fn check(&self, dimensions: u8) {
        let low_bit_mask = (1u64 << (dimensions as u32 * self.v_log_size as u32)) - 1;
        debug_assert_eq!(self.v_address & low_bit_mask, 0);
        debug_assert!(self.v_log_size <= self.v_level);
    }
}

impl From<PageUpdate> for PageTableUpdate {
    fn from(update: PageUpdate) -> Self {
        PageTableUpdate {
            v_address: update.v_address as u32,
            p_address: update.p_address,
            v_level: update.v_level,
            v_log_size: update.v_log_size,
        }
    }
}

/// Parameters for registering a [`Space`].
#[derive(Clone, Copy, Debug)]
pub struct SpaceDesc {
    /// Page-table side length in pages; rounded up to a power of two.
    pub size: u32,
    /// Address dimensionality; 2 for 2D textures.
    pub dimensions: u8,
    /// Pixel format of the indirection codes.
    pub format: Format,
}

/// A virtual address space: one page-table texture, one buddy allocator
/// handing out address ranges to producers, and the queue of page-table
/// rewrites accumulated since the last `apply_updates`.
pub struct Space<B: Backend> {
    /// Id assigned at registration, `INVALID_SPACE` outside of it.
    pub id: u8,
    /// Page-table side length in pages.
    pub page_table_size: u32,
    /// Number of mip levels in the page table.
    pub levels: u8,
    /// Indirection code format.
    pub format: Format,
    /// Address dimensionality.
    pub dimensions: u8,
    /// Virtual address allocator for this space.
    pub allocator: AddressAllocator,

    producers: Vec<Option<Box<dyn PageProducer<B>>>>,
    pending_updates: Vec<PageUpdate>,
    update_buckets: Vec<Vec<PageTableUpdate>>,
    page_table: Option<B::Texture>,
}

impl<B: Backend> Space<B> {
    /// Creates the space and its page-table texture.
    pub fn new(device: &mut B::Device, desc: SpaceDesc) -> Result<Self, BackendError> {
        let size = desc.size.next_power_of_two();
        let levels = size.trailing_zeros() as u8 + 1;

        let page_table = device.create_pooled_rt_2d(
            Extent2d {
                width: size,
                height: size,
            },
            desc.format,
            TextureFlags::UAV,
        )?;

        Ok(Space {
            id: INVALID_SPACE,
            page_table_size: size,
            levels,
            format: desc.format,
            dimensions: desc.dimensions,
            allocator: AddressAllocator::new(size, desc.dimensions),
            producers: Vec::new(),
            pending_updates: Vec::new(),
            update_buckets: (0..MAX_LEVELS).map(|_| Vec::new()).collect(),
            page_table: Some(page_table),
        })
    }

    /// Returns the page-table texture, if the space is live.
    pub fn page_table(&self) -> Option<&B::Texture> {
        self.page_table.as_ref()
    }

    /// Gives a producer a block of this space's address range. Returns the
    /// block's base address at mip 0, or `None` if the space is full.
    pub fn allocate_texture(&mut self, producer: Box<dyn PageProducer<B>>) -> Option<u64> {
        let size = producer.size_in_pages();
        let handle = self.producers.len() as u16;
        let v_address = self
            .allocator
            .alloc(handle, size.width.max(size.height))?;
        self.producers.push(Some(producer));
        Some(v_address)
    }

    /// Releases a producer's block. Its pages age out of the pool through
    /// LRU reuse; the caller stops sampling the range first.
    pub fn free_texture(&mut self, handle: u16) -> Option<Box<dyn PageProducer<B>>> {
        self.allocator.free(handle);
        self.producers.get_mut(handle as usize)?.take()
    }

    pub(crate) fn producer(&self, handle: u16) -> Option<&dyn PageProducer<B>> {
        match self.producers.get(handle as usize) {
            Some(Some(producer)) => Some(&**producer),
            _ => None,
        }
    }

    pub(crate) fn producer_mut(&mut self, handle: u16) -> Option<&mut dyn PageProducer<B>> {
        match self.producers.get_mut(handle as usize) {
            Some(Some(producer)) => Some(&mut **producer),
            _ => None,
        }
    }

    /// Queues one page-table rewrite. Argument order mirrors the event:
    /// the changed region, then the page the region now resolves to.
    pub fn queue_update(&mut self, v_log_size: u8, v_address: u64, v_level: u8, p_address: u16) {
        self.pending_updates.push(PageUpdate {
            v_address,
            p_address,
            v_level,
            v_log_size,
        });
    }

    /// Number of rewrites queued since the last `apply_updates`.
    pub fn num_pending_updates(&self) -> usize {
        self.pending_updates.len()
    }

    /// Expands every queued rewrite into per-mip rectangle batches and
    /// dispatches them. Batches preserve queue order, so an unmap queued
    /// before a map of the same slot lands first.
    pub fn apply_updates(
        &mut self,
        pool: &mut PagePool,
        device: &mut B::Device,
        variant: UpdateVariant,
    ) {
        if self.pending_updates.is_empty() {
            return;
        }

        let mut updates = mem::replace(&mut self.pending_updates, Vec::new());
        for update in &updates {
            match variant {
                UpdateVariant::Painters => {
                    pool.expand_painters(self.id, *update, &mut self.update_buckets)
                }
                UpdateVariant::Masked => {
                    pool.expand_masked(self.id, *update, &mut self.update_buckets)
                }
            }
        }
        updates.clear();
        self.pending_updates = updates;

        for mip in 0..self.levels {
            let bucket = &mut self.update_buckets[mip as usize];
            if !bucket.is_empty() {
                device.dispatch_update_page_table(self.id, mip, bucket);
                bucket.clear();
            }
        }
    }

    /// Destroys the page-table texture. Called by the system on
    /// unregistration.
    pub fn release(&mut self, device: &mut B::Device) {
        if let Some(texture) = self.page_table.take() {
            device.destroy_texture(texture);
        }
    }
}

/// The process-wide table of registered spaces.
pub struct SpaceTable<B: Backend> {
    spaces: [Option<Space<B>>; MAX_SPACES],
}

impl<B: Backend> SpaceTable<B> {
    pub fn new() -> Self {
        SpaceTable {
            spaces: Default::default(),
        }
    }

    /// Assigns the lowest free id. Panics if all 16 are taken.
    pub fn register(&mut self, mut space: Space<B>) -> u8 {
        for id in 0..MAX_SPACES {
            if self.spaces[id].is_none() {
                space.id = id as u8;
                self.spaces[id] = Some(space);
                return id as u8;
            }
        }
        panic!("all {} space ids are in use", MAX_SPACES);
    }

    /// Removes a space; its id becomes reusable.
    pub fn unregister(&mut self, id: u8) -> Option<Space<B>> {
        let mut space = self.spaces[id as usize].take()?;
        space.id = INVALID_SPACE;
        Some(space)
    }

    pub fn get(&self, id: u8) -> Option<&Space<B>> {
        self.spaces.get(id as usize)?.as_ref()
    }

    pub fn get_mut(&mut self, id: u8) -> Option<&mut Space<B>> {
        self.spaces.get_mut(id as usize)?.as_mut()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Space<B>> {
        self.spaces.iter_mut().filter_map(|space| space.as_mut())
    }
}
