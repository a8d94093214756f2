//! Decode-order to display-order tracking for H.264 and H.265 access units.
//!
//! A [`Reorder`] engine consumes one coded access unit per [`Frame`] in
//! decode order. It parses parameter sets and slice headers, runs the
//! codec's reference marking and DPB bumping process on picture metadata
//! only, and hands every frame back once the buffer that belongs in its
//! display slot is known.
//!
//! | Codec | Module | Reference |
//! |-------|--------|-----------|
//! | H.264 | [`h264`] | ITU-T H.264 8.2.1, 8.2.5, C.4 |
//! | H.265 | [`h265`] | ITU-T H.265 8.3.1, 8.3.2, C.5.2 |
//!
//! ```no_run
//! use reorder::{Caps, Codec, Frame};
//!
//! # fn run(access_units: Vec<Vec<u8>>) -> reorder::Result<()> {
//! let mut engine = reorder::new(Codec::H264, true);
//! engine.set_caps(&Caps::default())?;
//! for au in access_units {
//!     if let Err(e) = engine.push(Frame::new(au)) {
//!         eprintln!("dropped frame: {e}");
//!     }
//!     while let Some(frame) = engine.pop() {
//!         println!("{} -> {:?}", frame.system_frame_number, frame.presentation_frame_number);
//!     }
//! }
//! engine.drain();
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod frame;
pub mod h264;
pub mod h265;
pub mod scanner;
pub mod sei;

use std::str::FromStr;
use std::time::Duration;

use bytes::Bytes;

pub use error::{ReorderError, Result};
pub use frame::{Frame, FrameQueue};
pub use h264::H264Reorder;
pub use h265::H265Reorder;
pub use sei::SeiMessage;

const DEFAULT_FRAMERATE: (u32, u32) = (25, 1);

/// Video coding standard of the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    H264,
    H265,
}

impl FromStr for Codec {
    type Err = ReorderError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "h264" | "avc" => Ok(Codec::H264),
            "h265" | "hevc" => Ok(Codec::H265),
            _ => Err(ReorderError::Unsupported("codec")),
        }
    }
}

/// How access units delimit their NAL units.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StreamFormat {
    /// Annex-B start codes.
    #[default]
    ByteStream,
    /// Length prefixes (`avc`, `avc3`, `hvc1`, `hev1`); the prefix size
    /// comes from the codec data, 4 bytes otherwise.
    Packetized,
}

impl StreamFormat {
    /// Maps a caps `stream-format` string. Unknown names are treated as
    /// byte-stream.
    pub fn from_name(name: &str) -> Self {
        match name {
            "avc" | "avc3" | "hvc1" | "hev1" => StreamFormat::Packetized,
            _ => StreamFormat::ByteStream,
        }
    }
}

/// Stream description given to [`Reorder::set_caps`].
#[derive(Debug, Clone, Default)]
pub struct Caps {
    pub stream_format: StreamFormat,
    /// Frame rate as `(numerator, denominator)`.
    pub framerate: Option<(u32, u32)>,
    /// `avcC` or `hvcC` decoder configuration record.
    pub codec_data: Option<Bytes>,
}

impl Caps {
    /// The frame rate, falling back to 25/1 when absent or degenerate.
    pub fn framerate_or_default(&self) -> (u32, u32) {
        match self.framerate {
            Some((n, d)) if n > 0 && d > 0 => (n, d),
            _ => DEFAULT_FRAMERATE,
        }
    }
}

/// Time spanned by `frames` pictures at `framerate`.
pub(crate) fn frames_to_duration(frames: u32, framerate: (u32, u32)) -> Duration {
    let (n, d) = framerate;
    if n == 0 {
        return Duration::ZERO;
    }
    let nanos = u128::from(frames) * 1_000_000_000 * u128::from(d) / u128::from(n);
    Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
}

/// Display-order restoration engine.
///
/// Calls are synchronous: `push` fully resolves one access unit's effect on
/// the DPB and the frame queues before returning.
pub trait Reorder: Send {
    /// Applies stream format, frame rate and codec data. Returns the latency
    /// the engine adds, zero when reordering is disabled.
    fn set_caps(&mut self, caps: &Caps) -> Result<Duration>;

    /// Queues one access unit. On error the frame is dropped and no state
    /// refers to it.
    fn push(&mut self, frame: Frame) -> Result<()>;

    /// Next frame, in decode order, whose output buffer is resolved.
    fn pop(&mut self) -> Option<Frame>;

    /// Outputs every buffered picture and flushes the frame queue.
    fn drain(&mut self);

    /// Frames held in the pending and output queues.
    fn num_buffered(&self) -> usize;

    /// Latency derived from the active SPS and frame rate.
    fn latency(&self) -> Duration;

    /// Inserts an SEI NAL carrying `messages` before the first slice of
    /// `au`, in this stream's framing.
    fn insert_sei(&self, au: &[u8], messages: &[SeiMessage]) -> Result<Vec<u8>>;
}

/// Creates an engine for `codec`. With `need_reorder` false frames pass
/// straight through in decode order.
pub fn new(codec: Codec, need_reorder: bool) -> Box<dyn Reorder> {
    match codec {
        Codec::H264 => Box::new(H264Reorder::new(need_reorder)),
        Codec::H265 => Box::new(H265Reorder::new(need_reorder)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codec_from_str() {
        assert_eq!("H264".parse::<Codec>().unwrap(), Codec::H264);
        assert_eq!("hevc".parse::<Codec>().unwrap(), Codec::H265);
        assert!("vp9".parse::<Codec>().is_err());
    }

    #[test]
    fn stream_format_names() {
        assert_eq!(StreamFormat::from_name("avc3"), StreamFormat::Packetized);
        assert_eq!(StreamFormat::from_name("hvc1"), StreamFormat::Packetized);
        assert_eq!(StreamFormat::from_name("byte-stream"), StreamFormat::ByteStream);
    }

    #[test]
    fn framerate_falls_back() {
        let mut caps = Caps::default();
        assert_eq!(caps.framerate_or_default(), (25, 1));
        caps.framerate = Some((0, 1));
        assert_eq!(caps.framerate_or_default(), (25, 1));
        caps.framerate = Some((30000, 1001));
        assert_eq!(caps.framerate_or_default(), (30000, 1001));
    }

    #[test]
    fn latency_from_frames() {
        assert_eq!(frames_to_duration(4, (25, 1)), Duration::from_millis(160));
        assert_eq!(frames_to_duration(0, (25, 1)), Duration::ZERO);
    }
}
