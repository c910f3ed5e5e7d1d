//! Page producers: the things a virtual texture streams out of.

use crate::format::Extent3d;
use crate::Backend;

/// Shader feature level forwarded to producers that generate their pages.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FeatureLevel {
    /// GLES 3.1 class hardware.
    Es31,
    /// Shader model 5 class hardware.
    Sm5,
}

/// One virtual texture: a source of page data addressed in producer-local
/// Morton coordinates. Implementations may back onto disk, procedural
/// generation, or transcoding; the streamer only ever calls the two methods
/// below, once per upload.
pub trait PageProducer<B: Backend> {
    /// Size of the texture in pages at mip 0.
    fn size_in_pages(&self) -> Extent3d;

    /// Non-blocking residency probe. Returns a pointer to the source data
    /// for the page if it is already in RAM, `None` otherwise; the streamer
    /// retries on a later frame via LRU aging. The pointer must stay valid
    /// until the matching [`PageProducer::produce_page_data`] call returns.
    fn locate_page_data(&self, v_level: u8, v_address: u64) -> Option<*const u8>;

    /// Performs the GPU upload of one page into physical slot `p_address`.
    /// `data` is the pointer returned by `locate_page_data`.
    fn produce_page_data(
        &mut self,
        device: &mut B::Device,
        feature_level: FeatureLevel,
        v_level: u8,
        v_address: u64,
        p_address: u16,
        data: *const u8,
    );
}
