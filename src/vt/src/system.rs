//! Per-frame orchestration: feedback drain, request prioritization, upload
//! budget, page-table maintenance.

use std::slice;

use index_collections::BinaryHeap;
use vtx_hal::addr::{decode_feedback, decode_page, encode_page, morton2, FEEDBACK_SENTINEL};
use vtx_hal::{Backend, BackendError, FeatureLevel};

use crate::feedback::{FeedbackMap, FeedbackRing};
use crate::pool::PagePool;
use crate::space::{Space, SpaceDesc, SpaceTable, MAX_SPACES};
use crate::unique_page_list::{UniquePageList, MAX_UNIQUE_PAGES};

/// How one map/unmap event is expanded into page-table writes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpdateVariant {
    /// Emit the full rectangle, then overpaint each mapped descendant.
    /// Simple; write volume grows with the covered area.
    Painters,
    /// Emit non-overlapping rectangles covering exactly the region minus
    /// its mapped descendants. Fewer writes, more CPU.
    Masked,
}

/// Tunables. A plain struct owned by the caller; there is no global
/// configuration state.
#[derive(Clone, Copy, Debug)]
pub struct SystemConfig {
    /// Page uploads allowed per `update` call.
    pub max_uploads_per_frame: i32,
    /// Ancestor mips requested in addition to each feedback request.
    pub num_mips_to_expand_requests: i32,
    /// Page-table expansion strategy.
    pub page_table_update_variant: UpdateVariant,
}

impl Default for SystemConfig {
    fn default() -> Self {
        SystemConfig {
            max_uploads_per_frame: 16,
            num_mips_to_expand_requests: 3,
            page_table_update_variant: UpdateVariant::Masked,
        }
    }
}

/// Counters for one `update` call.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemStats {
    /// Distinct pages seen in feedback before mip expansion.
    pub num_pages_visible: u32,
    /// Requests after mip expansion.
    pub num_page_requests: u32,
    /// Requests already resident.
    pub num_page_requests_resident: u32,
    /// Requests needing an upload.
    pub num_page_requests_not_resident: u32,
    /// Uploads performed.
    pub num_page_uploads: u32,
}

/// The streaming engine. One per device; drives all registered spaces from
/// a single thread.
pub struct VirtualTextureSystem<B: Backend> {
    frame: u32,
    config: SystemConfig,
    stats: SystemStats,
    pool: PagePool,
    spaces: SpaceTable<B>,
    feedback: FeedbackRing<B>,
    // Persists across frames to keep the hot path allocation-free.
    request_heap: BinaryHeap<u32>,
}

impl<B: Backend> VirtualTextureSystem<B> {
    /// A system with `pool_size` physical slots for `dimensions`-dimensional
    /// spaces.
    pub fn new(pool_size: u32, dimensions: u8, config: SystemConfig) -> Self {
        VirtualTextureSystem {
            // Slots start with frame key 0, so frame 0 stands for "never
            // used" and counting begins at 1.
            frame: 1,
            config,
            stats: SystemStats::default(),
            pool: PagePool::new(pool_size, dimensions),
            spaces: SpaceTable::new(),
            feedback: FeedbackRing::new(),
            request_heap: BinaryHeap::new(MAX_UNIQUE_PAGES as u32, MAX_UNIQUE_PAGES as u32),
        }
    }

    /// Frame counter, incremented by every `update`.
    pub fn frame(&self) -> u32 {
        self.frame
    }

    pub fn config(&self) -> &SystemConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut SystemConfig {
        &mut self.config
    }

    /// Counters from the most recent `update`.
    pub fn stats(&self) -> &SystemStats {
        &self.stats
    }

    pub fn pool(&self) -> &PagePool {
        &self.pool
    }

    pub fn pool_mut(&mut self) -> &mut PagePool {
        &mut self.pool
    }

    pub fn feedback(&mut self) -> &mut FeedbackRing<B> {
        &mut self.feedback
    }

    /// Creates and registers a space, returning its id.
    pub fn register_space(
        &mut self,
        device: &mut B::Device,
        desc: SpaceDesc,
    ) -> Result<u8, BackendError> {
        let space = Space::new(device, desc)?;
        Ok(self.spaces.register(space))
    }

    /// Tears a space down: unmaps its pool pages, releases its page table,
    /// and frees the id for reuse.
    pub fn unregister_space(&mut self, device: &mut B::Device, id: u8) {
        for p_address in 0..self.pool.size() as u16 {
            if self.pool.page(p_address).space_id == id {
                self.pool.unmap(p_address, &mut self.spaces);
            }
        }
        if let Some(mut space) = self.spaces.unregister(id) {
            space.release(device);
        }
    }

    pub fn space(&self, id: u8) -> Option<&Space<B>> {
        self.spaces.get(id)
    }

    pub fn space_mut(&mut self, id: u8) -> Option<&mut Space<B>> {
        self.spaces.get_mut(id)
    }

    /// Collapses horizontal runs of identical requests and merges the
    /// decoded pages into `requests`.
    fn feedback_analysis(requests: &mut UniquePageList, map: &FeedbackMap) {
        let texels = map.pitch * map.height as usize;
        let buffer = unsafe { slice::from_raw_parts(map.ptr, texels) };

        let mut last_pixel = FEEDBACK_SENTINEL;
        let mut last_page = FEEDBACK_SENTINEL;
        let mut last_count = 0u32;

        for y in 0..map.height as usize {
            for x in 0..map.width as usize {
                let pixel = buffer[x + y * map.pitch];

                if pixel == FEEDBACK_SENTINEL {
                    continue;
                }
                if pixel == last_pixel {
                    last_count += 1;
                    continue;
                }

                let (space_id, level, page_x, page_y) = decode_feedback(pixel);
                let max_level = requests.num_levels[space_id as usize] - 1;
                let v_level = level.min(max_level);
                let dimensions = requests.dimensions[space_id as usize];

                let v_address = morton2(page_x, page_y)
                    & (!0u64 << (dimensions as u32 * v_level as u32)) as u32;

                let page = encode_page(space_id, v_level, v_address);
                if page == last_page {
                    last_count += 1;
                    continue;
                }

                if last_page != FEEDBACK_SENTINEL {
                    requests.add(last_page, last_count.min(u16::max_value() as u32) as u16);
                }

                last_pixel = pixel;
                last_page = page;
                last_count = 1;
            }
        }

        if last_page != FEEDBACK_SENTINEL {
            requests.add(last_page, last_count.min(u16::max_value() as u32) as u16);
        }
    }

    /// One frame of streaming work. Drains feedback, prioritizes missing
    /// pages by how coarse their current stand-in is, uploads up to the
    /// configured budget, and flushes page-table updates for every space.
    pub fn update(&mut self, device: &mut B::Device, feature_level: FeatureLevel) {
        self.stats = SystemStats::default();

        let mut requests = UniquePageList::new();
        for id in 0..MAX_SPACES as u8 {
            let space = self.spaces.get(id);
            requests.num_levels[id as usize] = space.map_or(16, |space| space.levels);
            requests.dimensions[id as usize] = space.map_or(2, |space| space.dimensions);
        }

        if let Some(map) = self.feedback.map(device) {
            Self::feedback_analysis(&mut requests, &map);
            self.feedback.unmap(device);
        }

        self.stats.num_pages_visible = requests.num();

        // Other request sources would merge here.

        requests.expand_by_mips(self.config.num_mips_to_expand_requests.max(0) as u32);
        self.stats.num_page_requests = requests.num();

        self.request_heap.clear();
        for i in 0..requests.num() {
            let (space_id, v_level, v_position) = decode_page(requests.page(i));
            let v_address = v_position as u64;

            let space = match self.spaces.get(space_id) {
                Some(space) => space,
                None => continue,
            };

            if let Some(p_address) = self.pool.find_page(space_id, v_level, v_address) {
                self.pool.update_usage(self.frame, p_address);
            } else {
                // Requests whose current proxy is far coarser than asked
                // resolve the most visible detail per upload, so they go
                // first.
                let parent_level = v_level + 1;
                let parent_address =
                    v_address & (!0u64 << (space.dimensions as u32 * parent_level as u32));

                let ancestor =
                    self.pool
                        .find_nearest_page(space_id, parent_level, parent_address);
                let ancestor_level =
                    ancestor.map_or(space.levels - 1, |p| self.pool.page(p).v_level);

                let count = requests.count(i) as u32;
                let priority = count << (ancestor_level as u32 - v_level as u32);

                // Bitwise NOT turns the min-heap into a max-heap.
                self.request_heap.add(!priority, i);
            }
        }

        self.stats.num_page_requests_resident = requests.num() - self.request_heap.num();
        self.stats.num_page_requests_not_resident = self.request_heap.num();

        let mut uploads_left = self.config.max_uploads_per_frame;
        while !self.request_heap.is_empty() && uploads_left > 0 {
            let index = self.request_heap.pop();
            let (space_id, v_level, v_position) = decode_page(requests.page(index));
            let v_address = v_position as u64;

            let located = match self.spaces.get(space_id) {
                Some(space) => match space.allocator.find(v_address) {
                    Some((handle, local_address)) => space
                        .producer(handle)
                        .and_then(|producer| producer.locate_page_data(v_level, local_address))
                        .map(|data| (handle, local_address, data)),
                    // Mip expansion can walk above every allocated block.
                    None => None,
                },
                None => None,
            };

            let (handle, local_address, data) = match located {
                Some(located) => located,
                None => continue,
            };

            let p_address = match self.pool.alloc(self.frame) {
                Some(p_address) => p_address,
                None => continue,
            };

            self.pool.unmap(p_address, &mut self.spaces);

            if let Some(producer) = self
                .spaces
                .get_mut(space_id)
                .and_then(|space| space.producer_mut(handle))
            {
                producer.produce_page_data(
                    device,
                    feature_level,
                    v_level,
                    local_address,
                    p_address,
                    data,
                );
            }

            self.pool
                .map(space_id, v_level, v_address, p_address, &mut self.spaces);
            self.pool.free(self.frame, p_address);

            uploads_left -= 1;
            self.stats.num_page_uploads += 1;
        }

        // Pool mutations are done; flush every space's page table.
        {
            let VirtualTextureSystem {
                ref mut spaces,
                ref mut pool,
                ref config,
                ..
            } = *self;
            for space in spaces.iter_mut() {
                space.apply_updates(pool, device, config.page_table_update_variant);
            }
        }

        debug!(
            "vt frame {}: {} visible, {} requests, {} resident, {} uploads",
            self.frame,
            self.stats.num_pages_visible,
            self.stats.num_page_requests,
            self.stats.num_page_requests_resident,
            self.stats.num_page_uploads,
        );

        self.frame += 1;
    }
}
