//! Page-table expansion against the software backend's mirror.

use vtx::pool::PagePool;
use vtx::space::{Space, SpaceDesc, SpaceTable};
use vtx::system::UpdateVariant;
use vtx_backend_soft::{Backend as Soft, Device, UNMAPPED};
use vtx_hal::format::Format;
use vtx_hal::Device as _;

struct Fixture {
    device: Device,
    pool: PagePool,
    spaces: SpaceTable<Soft>,
    id: u8,
}

fn fixture(page_table_size: u32) -> Fixture {
    let mut device = Device::new();
    let space = Space::new(
        &mut device,
        SpaceDesc {
            size: page_table_size,
            dimensions: 2,
            format: Format::R16Uint,
        },
    )
    .unwrap();
    let mut spaces = SpaceTable::new();
    let id = spaces.register(space);
    device.register_page_table(id, page_table_size, 2);

    Fixture {
        device,
        pool: PagePool::new(64, 2),
        spaces,
        id,
    }
}

impl Fixture {
    fn map(&mut self, v_level: u8, v_address: u64) -> u16 {
        let p = self.pool.alloc(1).unwrap();
        self.pool.unmap(p, &mut self.spaces);
        self.pool
            .map(self.id, v_level, v_address, p, &mut self.spaces);
        p
    }

    fn apply(&mut self, variant: UpdateVariant) {
        let space = self.spaces.get_mut(self.id).unwrap();
        space.apply_updates(&mut self.pool, &mut self.device, variant);
    }

    fn mirror(&self) -> &vtx_backend_soft::PageTableMirror {
        self.device.page_table(self.id).unwrap()
    }
}

// Scenario: a 4-mip region mapped at (level 2, addr 0) with one mapped
// descendant at (level 0, addr 0); the level-2 page is then unmapped with
// no ancestor behind it.
fn run_unmap_with_descendant(variant: UpdateVariant) -> Fixture {
    let mut f = fixture(16);

    let coarse = f.map(2, 0);
    let fine = f.map(0, 0);
    f.apply(variant);

    // After the maps: the fine page wins its own cell, the coarse page
    // everything else it covers.
    assert_eq!(f.mirror().get(0, 0), fine);
    for cell in 1..16 {
        assert_eq!(f.mirror().get(0, cell), coarse);
    }
    for cell in 0..4 {
        assert_eq!(f.mirror().get(1, cell), coarse);
    }
    assert_eq!(f.mirror().get(2, 0), coarse);

    f.pool.unmap(coarse, &mut f.spaces);
    f.apply(variant);

    // The descendant survives; everything else clears.
    assert_eq!(f.mirror().get(0, 0), fine);
    for cell in 1..16 {
        assert_eq!(f.mirror().get(0, cell), UNMAPPED);
    }
    for cell in 0..4 {
        assert_eq!(f.mirror().get(1, cell), UNMAPPED);
    }
    assert_eq!(f.mirror().get(2, 0), UNMAPPED);

    f
}

#[test]
fn test_masked_unmap_with_descendant() {
    run_unmap_with_descendant(UpdateVariant::Masked);
}

#[test]
fn test_painters_unmap_with_descendant() {
    run_unmap_with_descendant(UpdateVariant::Painters);
}

#[test]
fn test_variants_agree() {
    // A denser arrangement: two descendants at different levels, then an
    // unmap over them. Both variants must leave identical page tables.
    let build = |variant: UpdateVariant| {
        let mut f = fixture(16);
        let _coarse = f.map(3, 0);
        let _mid = f.map(1, 16);
        let _fine = f.map(0, 5);
        f.apply(variant);

        let victim = f.pool.find_page(f.id, 3, 0).unwrap();
        f.pool.unmap(victim, &mut f.spaces);
        f.apply(variant);
        f
    };

    let masked = build(UpdateVariant::Masked);
    let painters = build(UpdateVariant::Painters);

    for mip in 0..masked.mirror().num_mips() {
        assert_eq!(
            masked.mirror().mip(mip as u8),
            painters.mirror().mip(mip as u8),
            "page tables diverge at mip {}",
            mip
        );
    }
}

#[test]
fn test_unmap_resolves_to_ancestor() {
    let mut f = fixture(16);

    let coarse = f.map(2, 0);
    let fine = f.map(0, 3);
    f.apply(UpdateVariant::Masked);
    assert_eq!(f.mirror().get(0, 3), fine);

    // Unmapping the fine page repaints its cell with the live ancestor.
    f.pool.unmap(fine, &mut f.spaces);
    f.apply(UpdateVariant::Masked);
    assert_eq!(f.mirror().get(0, 3), coarse);
}

#[test]
fn test_refresh_entire_page_table() {
    let mut f = fixture(16);
    let coarse = f.map(2, 0);
    let fine = f.map(0, 0);

    let mut output: Vec<Vec<vtx_hal::PageTableUpdate>> = (0..16).map(|_| Vec::new()).collect();
    f.pool.refresh_entire_page_table(f.id, &mut output);

    for (mip, writes) in output.iter().enumerate().take(3) {
        for write in writes {
            f.device
                .dispatch_update_page_table(f.id, mip as u8, std::slice::from_ref(write));
        }
    }

    assert_eq!(f.mirror().get(0, 0), fine);
    for cell in 1..16 {
        assert_eq!(f.mirror().get(0, cell), coarse);
    }
    assert_eq!(f.mirror().get(2, 0), coarse);
}
