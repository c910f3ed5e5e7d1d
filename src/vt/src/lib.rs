//! Demand-paged virtual texture streaming.
//!
//! The GPU writes per-pixel feedback naming the virtual texture pages it
//! sampled; once a frame, [`system::VirtualTextureSystem::update`] drains
//! that feedback, decides which pages to upload and which physical slots to
//! reuse, and rewrites the GPU-resident page-table indirection so sampling
//! stays coherent while residency changes underneath it.
//!
//! The crate is backend-agnostic: all GPU work goes through the traits in
//! `vtx-hal`, and page contents come from caller-supplied
//! [`vtx_hal::PageProducer`] implementations. There are no internal threads;
//! the system expects to be driven by a single render thread.

#[macro_use]
extern crate log;

pub mod allocator;
pub mod feedback;
pub mod pool;
pub mod space;
pub mod system;
pub mod unique_page_list;

pub use self::pool::{Page, PagePool};
pub use self::space::{PageUpdate, Space, SpaceDesc, SpaceTable};
pub use self::system::{SystemConfig, SystemStats, UpdateVariant, VirtualTextureSystem};
