//! Access-unit scanning: NAL splitting, re-framing and decoder configuration
//! records.
//!
//! Two framings are supported:
//!
//! | Framing | Caps `stream-format` | Prefix |
//! |---------|----------------------|--------|
//! | [`Framing::AnnexB`] | `byte-stream` | `00 00 01` or `00 00 00 01` |
//! | [`Framing::LengthPrefixed`] | `avc`, `avc3`, `hvc1`, `hev1` | big-endian length, 1 to 4 bytes |

use crate::error::{ReorderError, Result};

/// How NAL units are delimited inside an access unit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Framing {
    /// Start-code delimited (ITU-T H.264 / H.265 Annex B).
    #[default]
    AnnexB,
    /// Each unit is preceded by its length in the given number of bytes.
    LengthPrefixed(u8),
}

/// One NAL unit located inside an access unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NalUnit<'a> {
    /// Start code or length prefix preceding the unit.
    pub prefix: &'a [u8],
    /// NAL header and payload, still carrying emulation prevention bytes.
    pub data: &'a [u8],
}

/// Splits an access unit into its NAL units.
pub fn split(data: &[u8], framing: Framing) -> Result<Vec<NalUnit<'_>>> {
    match framing {
        Framing::AnnexB => split_annex_b(data),
        Framing::LengthPrefixed(size) => split_length_prefixed(data, size),
    }
}

fn split_annex_b(data: &[u8]) -> Result<Vec<NalUnit<'_>>> {
    // (prefix start, payload start) for every start code
    let mut starts = Vec::new();
    let mut i = 0;
    while i + 2 < data.len() {
        if data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1 {
            let prefix_start = if i > 0 && data[i - 1] == 0 { i - 1 } else { i };
            starts.push((prefix_start, i + 3));
            i += 3;
        } else {
            i += 1;
        }
    }

    if starts.is_empty() {
        return Err(ReorderError::Framing("no start code in byte-stream access unit".into()));
    }

    let mut units = Vec::with_capacity(starts.len());
    for (n, &(prefix_start, payload_start)) in starts.iter().enumerate() {
        let mut end = starts.get(n + 1).map_or(data.len(), |&(next, _)| next);
        // trailing_zero_8bits
        while end > payload_start && data[end - 1] == 0 {
            end -= 1;
        }
        if end == payload_start {
            continue;
        }
        units.push(NalUnit {
            prefix: &data[prefix_start..payload_start],
            data: &data[payload_start..end],
        });
    }
    Ok(units)
}

fn split_length_prefixed(data: &[u8], size: u8) -> Result<Vec<NalUnit<'_>>> {
    let size = usize::from(size);
    if !(1..=4).contains(&size) {
        return Err(ReorderError::Framing(format!("invalid NAL length size {size}")));
    }

    let mut units = Vec::new();
    let mut pos = 0;
    while pos < data.len() {
        let header_end = pos + size;
        let prefix = data.get(pos..header_end).ok_or_else(|| {
            ReorderError::Framing(format!("truncated length prefix at offset {pos}"))
        })?;
        let len = prefix.iter().fold(0usize, |acc, &b| (acc << 8) | usize::from(b));
        let end = header_end + len;
        let payload = data.get(header_end..end).ok_or_else(|| {
            ReorderError::Framing(format!(
                "NAL length {len} at offset {pos} exceeds access unit of {} bytes",
                data.len()
            ))
        })?;
        if !payload.is_empty() {
            units.push(NalUnit { prefix, data: payload });
        }
        pos = end;
    }
    Ok(units)
}

/// Appends `nal` to `out` with the prefix `framing` requires.
pub fn write_nal(out: &mut Vec<u8>, framing: Framing, nal: &[u8]) -> Result<()> {
    match framing {
        Framing::AnnexB => out.extend_from_slice(&[0, 0, 0, 1]),
        Framing::LengthPrefixed(size) => {
            let size = u32::from(size);
            let len = u32::try_from(nal.len())
                .ok()
                .filter(|&len| size >= 4 || len < (1u32 << (8 * size)))
                .ok_or_else(|| {
                    ReorderError::Framing(format!(
                        "NAL of {} bytes does not fit a {size}-byte length prefix",
                        nal.len()
                    ))
                })?;
            let bytes = len.to_be_bytes();
            out.extend_from_slice(&bytes[4 - size as usize..]);
        }
    }
    out.extend_from_slice(nal);
    Ok(())
}

/// Parameter sets and NAL length size carried out of band in the caps.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecoderConfig {
    /// Size in bytes of each NAL length prefix.
    pub length_size: u8,
    /// Parameter set NAL units, in record order.
    pub nal_units: Vec<Vec<u8>>,
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn u8(&mut self, what: &str) -> Result<u8> {
        let b = *self
            .data
            .get(self.pos)
            .ok_or_else(|| ReorderError::CodecData(format!("truncated before {what}")))?;
        self.pos += 1;
        Ok(b)
    }

    fn u16(&mut self, what: &str) -> Result<u16> {
        let hi = self.u8(what)?;
        let lo = self.u8(what)?;
        Ok(u16::from_be_bytes([hi, lo]))
    }

    fn bytes(&mut self, len: usize, what: &str) -> Result<&'a [u8]> {
        let slice = self
            .data
            .get(self.pos..self.pos + len)
            .ok_or_else(|| ReorderError::CodecData(format!("truncated {what}")))?;
        self.pos += len;
        Ok(slice)
    }
}

/// Parses an `AVCDecoderConfigurationRecord` (ISO/IEC 14496-15 §5.3.3.1).
pub fn parse_avcc(data: &[u8]) -> Result<DecoderConfig> {
    let mut c = Cursor { data, pos: 0 };
    let version = c.u8("configurationVersion")?;
    if version != 1 {
        return Err(ReorderError::CodecData(format!("unknown avcC version {version}")));
    }
    c.bytes(3, "profile and level")?;
    let length_size = (c.u8("lengthSizeMinusOne")? & 0b11) + 1;

    let mut nal_units = Vec::new();
    let num_sps = c.u8("numOfSequenceParameterSets")? & 0b1_1111;
    for _ in 0..num_sps {
        let len = c.u16("sequenceParameterSetLength")?;
        nal_units.push(c.bytes(usize::from(len), "SPS")?.to_vec());
    }
    let num_pps = c.u8("numOfPictureParameterSets")?;
    for _ in 0..num_pps {
        let len = c.u16("pictureParameterSetLength")?;
        nal_units.push(c.bytes(usize::from(len), "PPS")?.to_vec());
    }

    Ok(DecoderConfig { length_size, nal_units })
}

/// Parses an `HEVCDecoderConfigurationRecord` (ISO/IEC 14496-15 §8.3.3.1).
pub fn parse_hvcc(data: &[u8]) -> Result<DecoderConfig> {
    let mut c = Cursor { data, pos: 0 };
    let version = c.u8("configurationVersion")?;
    if version != 1 {
        return Err(ReorderError::CodecData(format!("unknown hvcC version {version}")));
    }
    c.bytes(20, "profile, level and stream fields")?;
    let length_size = (c.u8("lengthSizeMinusOne")? & 0b11) + 1;

    let mut nal_units = Vec::new();
    let num_arrays = c.u8("numOfArrays")?;
    for _ in 0..num_arrays {
        c.u8("NAL_unit_type")?;
        let num_nalus = c.u16("numNalus")?;
        for _ in 0..num_nalus {
            let len = c.u16("nalUnitLength")?;
            nal_units.push(c.bytes(usize::from(len), "parameter set")?.to_vec());
        }
    }

    Ok(DecoderConfig { length_size, nal_units })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_annex_b_mixed_start_codes() {
        let au = [0, 0, 0, 1, 0x67, 0xAA, 0, 0, 1, 0x68, 0xBB, 0, 0, 0, 1, 0x65, 0xCC];
        let units = split(&au, Framing::AnnexB).unwrap();
        assert_eq!(units.len(), 3);
        assert_eq!(units[0].data, &[0x67, 0xAA]);
        assert_eq!(units[0].prefix, &[0, 0, 0, 1]);
        assert_eq!(units[1].data, &[0x68, 0xBB]);
        assert_eq!(units[1].prefix, &[0, 0, 1]);
        assert_eq!(units[2].data, &[0x65, 0xCC]);
    }

    #[test]
    fn split_annex_b_strips_trailing_zeros() {
        let au = [0, 0, 1, 0x41, 0x9A, 0, 0];
        let units = split(&au, Framing::AnnexB).unwrap();
        assert_eq!(units[0].data, &[0x41, 0x9A]);
    }

    #[test]
    fn split_annex_b_without_start_code_fails() {
        assert!(split(&[0x65, 0x88], Framing::AnnexB).is_err());
    }

    #[test]
    fn split_length_prefixed() {
        let au = [0, 0, 0, 2, 0x67, 0xAA, 0, 0, 0, 1, 0x68];
        let units = split(&au, Framing::LengthPrefixed(4)).unwrap();
        assert_eq!(units.len(), 2);
        assert_eq!(units[1].data, &[0x68]);
    }

    #[test]
    fn split_length_prefixed_truncated() {
        let au = [0, 0, 0, 9, 0x67];
        assert!(split(&au, Framing::LengthPrefixed(4)).is_err());
    }

    #[test]
    fn write_nal_with_two_byte_prefix() {
        let mut out = Vec::new();
        write_nal(&mut out, Framing::LengthPrefixed(2), &[0x06, 0x01]).unwrap();
        assert_eq!(out, vec![0, 2, 0x06, 0x01]);
        assert!(write_nal(&mut out, Framing::LengthPrefixed(1), &[0u8; 300]).is_err());
    }

    #[test]
    fn parse_avcc_record() {
        let record = [
            1, 0x64, 0x00, 0x1F, 0xFF, 0xE1, 0, 2, 0x67, 0x64, 1, 0, 2, 0x68, 0xEE,
        ];
        let config = parse_avcc(&record).unwrap();
        assert_eq!(config.length_size, 4);
        assert_eq!(config.nal_units, vec![vec![0x67, 0x64], vec![0x68, 0xEE]]);
    }

    #[test]
    fn parse_hvcc_record() {
        let mut record = vec![1u8];
        record.extend_from_slice(&[0; 20]);
        record.push(0x0F); // lengthSizeMinusOne = 3
        record.push(1); // one array
        record.extend_from_slice(&[0x21, 0, 1, 0, 2, 0x42, 0x01]);
        let config = parse_hvcc(&record).unwrap();
        assert_eq!(config.length_size, 4);
        assert_eq!(config.nal_units, vec![vec![0x42, 0x01]]);
    }

    #[test]
    fn parse_avcc_rejects_bad_version() {
        assert!(parse_avcc(&[0, 0, 0, 0, 0xFF, 0xE0, 0]).is_err());
    }
}
