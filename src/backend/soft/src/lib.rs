//! Software reference backend.
//!
//! Executes every `vtx-hal` operation on the CPU: textures are byte
//! buffers, page-table dispatches are applied to an in-memory mirror of
//! each space's mip chain, and uploads are recorded. Exists for tests and
//! for diffing real backends against known-good page-table contents.

use std::cell::RefCell;
use std::collections::HashMap;

use vtx_hal::format::{Extent2d, Format};
use vtx_hal::{BackendError, MappedStaging, PageTableUpdate, TextureFlags};

/// Cleared/unmapped page-table cell.
pub const UNMAPPED: u16 = 0xffff;

/// The backend type itself; carries no state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Backend;

impl vtx_hal::Backend for Backend {
    type Device = Device;
    type Texture = Texture;
}

/// A CPU-side texture.
#[derive(Debug)]
pub struct Texture {
    size: Extent2d,
    format: Format,
    flags: TextureFlags,
    data: RefCell<Vec<u8>>,
}

impl Texture {
    /// Stores an R32Uint texel; stands in for the render pass that writes
    /// feedback requests.
    pub fn write_u32(&self, x: u32, y: u32, value: u32) {
        debug_assert_eq!(self.format, Format::R32Uint);
        let offset = ((x + y * self.size.width) * 4) as usize;
        self.data.borrow_mut()[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    /// Reads an R32Uint texel back.
    pub fn read_u32(&self, x: u32, y: u32) -> u32 {
        let offset = ((x + y * self.size.width) * 4) as usize;
        let data = self.data.borrow();
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&data[offset..offset + 4]);
        u32::from_le_bytes(bytes)
    }
}

/// In-memory mirror of one space's page-table mip chain. Each mip stores
/// one `u16` slot index per cell, addressed by Morton code, so a
/// rectangular Morton-aligned write is a contiguous fill.
#[derive(Debug)]
pub struct PageTableMirror {
    dimensions: u8,
    mips: Vec<Vec<u16>>,
}

impl PageTableMirror {
    fn new(size: u32, dimensions: u8) -> Self {
        let levels = size.next_power_of_two().trailing_zeros() + 1;
        let mips = (0..levels)
            .map(|mip| {
                let side = (size >> mip).max(1) as usize;
                vec![UNMAPPED; side.pow(dimensions as u32)]
            })
            .collect();
        PageTableMirror { dimensions, mips }
    }

    /// Cell contents at `(mip, morton_address)`.
    pub fn get(&self, mip: u8, address: u32) -> u16 {
        self.mips[mip as usize][address as usize]
    }

    /// All cells of one mip, Morton-ordered.
    pub fn mip(&self, mip: u8) -> &[u16] {
        &self.mips[mip as usize]
    }

    pub fn num_mips(&self) -> usize {
        self.mips.len()
    }

    fn apply(&mut self, mip: u8, write: &PageTableUpdate) {
        let shift = self.dimensions as u32 * mip as u32;
        let base = (write.v_address >> shift) as usize;
        let count = 1usize << (self.dimensions as u32 * (write.v_log_size - mip) as u32);

        let cells = &mut self.mips[mip as usize];
        debug_assert!(base + count <= cells.len());
        for cell in &mut cells[base..base + count] {
            *cell = write.p_address;
        }
    }
}

/// One recorded `upload_page_region` call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UploadRecord {
    pub p_address: u16,
    pub size: u32,
    pub format: Format,
}

/// The software device.
#[derive(Debug, Default)]
pub struct Device {
    page_tables: HashMap<u8, PageTableMirror>,
    uploads: Vec<UploadRecord>,
    num_dispatches: u32,
}

impl Device {
    pub fn new() -> Self {
        Device::default()
    }

    /// Attaches a page-table mirror for `space_id`, so dispatches against
    /// it take effect. Mirrors for unknown spaces are ignored with a log.
    pub fn register_page_table(&mut self, space_id: u8, size: u32, dimensions: u8) {
        self.page_tables
            .insert(space_id, PageTableMirror::new(size, dimensions));
    }

    /// The mirrored page table for `space_id`.
    pub fn page_table(&self, space_id: u8) -> Option<&PageTableMirror> {
        self.page_tables.get(&space_id)
    }

    /// Recorded uploads, in order.
    pub fn uploads(&self) -> &[UploadRecord] {
        &self.uploads
    }

    pub fn clear_uploads(&mut self) {
        self.uploads.clear();
    }

    /// Number of `dispatch_update_page_table` calls so far.
    pub fn num_dispatches(&self) -> u32 {
        self.num_dispatches
    }
}

impl vtx_hal::Device<Backend> for Device {
    fn create_pooled_rt_2d(
        &mut self,
        size: Extent2d,
        format: Format,
        flags: TextureFlags,
    ) -> Result<Texture, BackendError> {
        let bytes = size.width as usize * size.height as usize * format.texel_size();
        Ok(Texture {
            size,
            format,
            flags,
            data: RefCell::new(vec![0; bytes]),
        })
    }

    fn map_staging(&mut self, texture: &Texture) -> Result<MappedStaging, BackendError> {
        if !texture.flags.contains(TextureFlags::CPU_READBACK) {
            return Err(BackendError::MapFailed);
        }
        // CPU copies are complete by construction; the blocking contract is
        // trivially satisfied.
        Ok(MappedStaging {
            ptr: texture.data.borrow().as_ptr(),
            pitch: texture.size.width as usize,
        })
    }

    fn unmap_staging(&mut self, _texture: &Texture) {}

    fn copy_to_resolve(&mut self, src: &Texture, dst: &Texture) {
        dst.data.borrow_mut().copy_from_slice(&src.data.borrow());
    }

    fn clear_uav(&mut self, texture: &Texture, clear_value: [u32; 4]) {
        let mut data = texture.data.borrow_mut();
        for chunk in data.chunks_exact_mut(4) {
            chunk.copy_from_slice(&clear_value[0].to_le_bytes());
        }
    }

    fn destroy_texture(&mut self, _texture: Texture) {}

    fn dispatch_update_page_table(&mut self, space_id: u8, mip: u8, writes: &[PageTableUpdate]) {
        self.num_dispatches += 1;
        match self.page_tables.get_mut(&space_id) {
            Some(mirror) => {
                for write in writes {
                    mirror.apply(mip, write);
                }
            }
            None => {
                log::warn!("page table dispatch for unregistered space {}", space_id);
            }
        }
    }

    fn upload_page_region(
        &mut self,
        p_address: u16,
        _src: &[u8],
        size: u32,
        format: Format,
    ) -> Result<(), BackendError> {
        self.uploads.push(UploadRecord {
            p_address,
            size,
            format,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vtx_hal::Device as _;

    #[test]
    fn test_clear_and_readback() {
        let mut device = Device::new();
        let texture = device
            .create_pooled_rt_2d(
                Extent2d {
                    width: 4,
                    height: 2,
                },
                Format::R32Uint,
                TextureFlags::UAV,
            )
            .unwrap();
        device.clear_uav(&texture, [!0u32; 4]);
        assert_eq!(texture.read_u32(3, 1), !0u32);

        texture.write_u32(2, 1, 1234);
        assert_eq!(texture.read_u32(2, 1), 1234);
    }

    #[test]
    fn test_page_table_write() {
        let mut device = Device::new();
        device.register_page_table(0, 4, 2);
        device.dispatch_update_page_table(
            0,
            0,
            &[PageTableUpdate {
                v_address: 4,
                p_address: 9,
                v_level: 1,
                v_log_size: 1,
            }],
        );
        let mirror = device.page_table(0).unwrap();
        // A log-size-1 write covers 4 Morton-contiguous cells at mip 0.
        assert_eq!(&mirror.mip(0)[4..8], &[9, 9, 9, 9]);
        assert_eq!(mirror.get(0, 0), UNMAPPED);
    }

    #[test]
    fn test_map_requires_readback_flag() {
        let mut device = Device::new();
        let texture = device
            .create_pooled_rt_2d(
                Extent2d {
                    width: 1,
                    height: 1,
                },
                Format::R32Uint,
                TextureFlags::UAV,
            )
            .unwrap();
        match device.map_staging(&texture) {
            Err(BackendError::MapFailed) => (),
            other => panic!("expected MapFailed, got {:?}", other.map(|_| ())),
        }
    }
}
