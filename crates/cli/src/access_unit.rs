//! Grouping of an Annex-B elementary stream into access units.

use reorder::Codec;
use reorder::scanner::{self, Framing};

/// Splits a byte-stream into access units. A new unit starts at the first
/// slice of a picture, or at a non-VCL NAL that may only precede one once
/// the current unit already holds a picture.
pub fn split(data: &[u8], codec: Codec) -> reorder::Result<Vec<Vec<u8>>> {
    let mut units = Vec::new();
    let mut current = Vec::new();
    let mut has_picture = false;

    for nal in scanner::split(data, Framing::AnnexB)? {
        let kind = classify(nal.data, codec);
        let starts_unit = match kind {
            Kind::FirstSlice | Kind::Prefix => has_picture,
            Kind::Slice | Kind::Other => false,
        };
        if starts_unit {
            units.push(std::mem::take(&mut current));
            has_picture = false;
        }
        if matches!(kind, Kind::FirstSlice | Kind::Slice) {
            has_picture = true;
        }
        scanner::write_nal(&mut current, Framing::AnnexB, nal.data)?;
    }
    if !current.is_empty() {
        units.push(current);
    }
    Ok(units)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    FirstSlice,
    Slice,
    /// Parameter sets, delimiters and prefix SEI.
    Prefix,
    Other,
}

fn classify(nal: &[u8], codec: Codec) -> Kind {
    match codec {
        Codec::H264 => {
            let Some(&header) = nal.first() else {
                return Kind::Other;
            };
            match header & 0x1f {
                // first_mb_in_slice == 0 encodes as a single 1 bit
                1 | 5 => match nal.get(1) {
                    Some(b) if b & 0x80 != 0 => Kind::FirstSlice,
                    _ => Kind::Slice,
                },
                6..=9 | 14 | 15 => Kind::Prefix,
                _ => Kind::Other,
            }
        }
        Codec::H265 => {
            let Some(&header) = nal.first() else {
                return Kind::Other;
            };
            match (header >> 1) & 0x3f {
                0..=31 => match nal.get(2) {
                    Some(b) if b & 0x80 != 0 => Kind::FirstSlice,
                    _ => Kind::Slice,
                },
                32..=35 | 39 => Kind::Prefix,
                _ => Kind::Other,
            }
        }
    }
}
