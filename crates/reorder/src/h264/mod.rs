//! H.264 display-order tracking.

mod dpb;
pub mod params;
mod picture;
mod reorder;

pub use dpb::{Dpb, MAX_DPB_FRAMES};
pub use picture::{Field, PicId, Picture, Reference};
pub use reorder::H264Reorder;
