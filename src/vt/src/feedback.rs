//! GPU to CPU feedback ring.
//!
//! Two textures alternate roles across a frame: the render pass writes
//! packed page requests into a UAV target, the result is copied into a
//! CPU-readback staging texture, and the next frame's consumer maps the
//! staging copy. Mapping blocks until the copy is GPU-complete, which is
//! the one deliberate stall in the system; callers budget it against frame
//! time.

use vtx_hal::addr::FEEDBACK_SENTINEL;
use vtx_hal::format::{Extent2d, Format};
use vtx_hal::{Backend, BackendError, Device, TextureFlags};

/// A mapped feedback buffer: `width * height` R32Uint texels with a row
/// pitch of `pitch` texels.
#[derive(Clone, Copy, Debug)]
pub struct FeedbackMap {
    pub ptr: *const u32,
    pub width: u32,
    pub height: u32,
    pub pitch: usize,
}

/// Owns the two feedback textures across their GPU round trip.
pub struct FeedbackRing<B: Backend> {
    size: Extent2d,
    texture_gpu: Option<B::Texture>,
    texture_cpu: Option<B::Texture>,
}

impl<B: Backend> FeedbackRing<B> {
    pub fn new() -> Self {
        FeedbackRing {
            size: Extent2d {
                width: 0,
                height: 0,
            },
            texture_gpu: None,
            texture_cpu: None,
        }
    }

    /// Feedback target size, zero until `create_gpu`.
    pub fn size(&self) -> Extent2d {
        self.size
    }

    /// The UAV target the render pass writes requests into, if live.
    pub fn target(&self) -> Option<&B::Texture> {
        self.texture_gpu.as_ref()
    }

    /// Allocates this frame's feedback target and clears it to the
    /// "no request" sentinel.
    pub fn create_gpu(
        &mut self,
        device: &mut B::Device,
        width: u32,
        height: u32,
    ) -> Result<(), BackendError> {
        self.size = Extent2d { width, height };

        let texture = device.create_pooled_rt_2d(self.size, Format::R32Uint, TextureFlags::UAV)?;
        device.clear_uav(&texture, [FEEDBACK_SENTINEL; 4]);
        self.texture_gpu = Some(texture);
        Ok(())
    }

    /// Queues the copy of the feedback target into a fresh staging texture
    /// and releases the target back to the pool.
    pub fn transfer_gpu_to_cpu(&mut self, device: &mut B::Device) -> Result<(), BackendError> {
        let gpu = match self.texture_gpu.take() {
            Some(texture) => texture,
            None => return Ok(()),
        };

        let cpu =
            device.create_pooled_rt_2d(self.size, Format::R32Uint, TextureFlags::CPU_READBACK)?;
        device.copy_to_resolve(&gpu, &cpu);
        device.destroy_texture(gpu);
        self.texture_cpu = Some(cpu);
        Ok(())
    }

    /// Maps the staging copy, blocking until the GPU finished writing it.
    /// Returns `None` if there is nothing to read or the map failed.
    pub fn map(&mut self, device: &mut B::Device) -> Option<FeedbackMap> {
        if self.size.width == 0 || self.size.height == 0 {
            return None;
        }
        let texture = self.texture_cpu.as_ref()?;

        match device.map_staging(texture) {
            Ok(mapped) => Some(FeedbackMap {
                ptr: mapped.ptr as *const u32,
                width: self.size.width,
                height: self.size.height,
                pitch: mapped.pitch,
            }),
            Err(error) => {
                warn!("feedback map failed: {}", error);
                None
            }
        }
    }

    /// Releases the mapping and the staging texture.
    pub fn unmap(&mut self, device: &mut B::Device) {
        debug_assert!(self.size.width > 0 && self.size.height > 0);
        if let Some(texture) = self.texture_cpu.take() {
            device.unmap_staging(&texture);
            device.destroy_texture(texture);
        }
        self.size = Extent2d {
            width: 0,
            height: 0,
        };
    }
}
