//! Texture formats and extents.

/// Size of a 2D texture.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Extent2d {
    /// Width in texels.
    pub width: u32,
    /// Height in texels.
    pub height: u32,
}

/// Size of a 3D texture, or of a virtual texture in pages.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Extent3d {
    /// Width.
    pub width: u32,
    /// Height.
    pub height: u32,
    /// Depth; 1 for 2D content.
    pub depth: u32,
}

/// The formats the streamer traffics in. Backends may support more; these
/// are the ones crossing the trait boundary.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[repr(u8)]
pub enum Format {
    /// Single 8-bit channel.
    R8,
    /// Four 8-bit channels.
    Rgba8,
    /// Single 16-bit unsigned integer channel; page-table indirection codes.
    R16Uint,
    /// Single 32-bit unsigned integer channel; feedback pixels.
    R32Uint,
    /// BC1 block compression; typical page payload.
    Bc1,
}

impl Format {
    /// Bytes per texel, or per 4x4 block for compressed formats.
    pub fn texel_size(&self) -> usize {
        match *self {
            Format::R8 => 1,
            Format::Rgba8 => 4,
            Format::R16Uint => 2,
            Format::R32Uint => 4,
            Format::Bc1 => 8,
        }
    }
}
