//! H.265 display-order tracking.

mod dpb;
pub mod params;
mod reorder;

pub use dpb::{Dpb, Picture, MAX_DPB_SIZE};
pub use reorder::H265Reorder;
