#![deny(missing_docs)]

//! Backend abstraction for the vtx virtual texture streamer.
//!
//! The streaming core drives the GPU through two narrow traits: [`Device`]
//! for resource and command work, and [`PageProducer`] for filling physical
//! pages with texel data. Everything else — command list batching, resource
//! pooling, format support — is the backend's business.

#[macro_use]
extern crate bitflags;

#[cfg(feature = "serde")]
#[macro_use]
extern crate serde;

use std::any::Any;
use std::fmt::Debug;

pub mod addr;
pub mod format;
pub mod producer;

pub use self::producer::{FeatureLevel, PageProducer};

use self::format::{Extent2d, Format};

bitflags! {
    /// Creation flags for pooled textures.
    pub struct TextureFlags: u32 {
        /// Written by shaders as an unordered access view.
        const UAV = 1 << 0;
        /// CPU-readable staging resource.
        const CPU_READBACK = 1 << 1;
        /// Bound as a render target.
        const RENDER_TARGET = 1 << 2;
    }
}

/// Errors surfaced by a backend. The streamer logs these and drops the
/// frame's remaining work; nothing on the hot path is retried synchronously.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum BackendError {
    /// Allocation failed on the host or device.
    #[error("Out of memory")]
    OutOfMemory,
    /// A staging resource could not be mapped.
    #[error("Staging map failed")]
    MapFailed,
    /// A copy or resolve operation failed.
    #[error("Copy failed")]
    CopyFailed,
    /// The device was lost; all resources are invalid.
    #[error("Device lost")]
    DeviceLost,
}

/// A mapped staging resource.
///
/// `pitch` is in texels of the mapped format, so row `y` starts at
/// `ptr + y * pitch * bytes_per_texel`.
#[derive(Clone, Copy, Debug)]
pub struct MappedStaging {
    /// Base address of the mapped memory.
    pub ptr: *const u8,
    /// Row pitch in texels.
    pub pitch: usize,
}

/// One rectangular write into a page-table texture mip.
///
/// `vAddress` is Morton-interleaved in the space's dimension. `vLevel` is
/// the mip level of the page whose `pAddress` this write resolves to (the
/// consumer derives the UV scale from it); `vLogSize` is the log2 side of
/// the written square, in cells of the mip the update was queued at. A
/// single page table cannot exceed 32-bit addressing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[repr(C)]
pub struct PageTableUpdate {
    /// Morton address of the region's min corner.
    pub v_address: u32,
    /// Physical slot written into the covered cells.
    pub p_address: u16,
    /// Mip level of the resolved page.
    pub v_level: u8,
    /// Log2 side length of the written square.
    pub v_log_size: u8,
}

/// Associated types of a concrete graphics backend.
pub trait Backend: 'static + Sized {
    /// Device half of the backend.
    type Device: Device<Self>;
    /// Opaque texture resource.
    type Texture: Debug + Any;
}

/// Resource creation and command submission, as far as the streamer needs
/// them. All work lands on a single command stream in call order; there are
/// no ordering guarantees against other streams.
pub trait Device<B: Backend> {
    /// Allocates (or reuses from a pool) a 2D render target.
    fn create_pooled_rt_2d(
        &mut self,
        size: Extent2d,
        format: Format,
        flags: TextureFlags,
    ) -> Result<B::Texture, BackendError>;

    /// Maps a CPU-readback texture. Blocks until pending GPU writes to it
    /// have completed; callers budget this wait against frame time.
    fn map_staging(&mut self, texture: &B::Texture) -> Result<MappedStaging, BackendError>;

    /// Releases a mapping obtained from [`Device::map_staging`].
    fn unmap_staging(&mut self, texture: &B::Texture);

    /// Copies `src` into the resolve target `dst`.
    fn copy_to_resolve(&mut self, src: &B::Texture, dst: &B::Texture);

    /// Clears a UAV texture to `clear_value`.
    fn clear_uav(&mut self, texture: &B::Texture, clear_value: [u32; 4]);

    /// Returns a texture to the backend's pool.
    fn destroy_texture(&mut self, texture: B::Texture);

    /// Applies a batch of rectangular writes to one mip of the page-table
    /// texture of `space_id`.
    fn dispatch_update_page_table(&mut self, space_id: u8, mip: u8, writes: &[PageTableUpdate]);

    /// Uploads one page of texel data into physical slot `p_address`.
    fn upload_page_region(
        &mut self,
        p_address: u16,
        src: &[u8],
        size: u32,
        format: Format,
    ) -> Result<(), BackendError>;
}
