//! Caption SEI handling: detection of CEA-708 user data, removal of caption
//! messages from pushed access units, and insertion of new SEI NAL units.
//!
//! Captions travel in `user_data_registered_itu_t_t35` SEI messages
//! (payload type 4). A payload is treated as a caption when it matches one of:
//!
//! | Country | Provider | Identifier | Type code |
//! |---------|----------|------------|-----------|
//! | US/UK (`0xB5`/`0xB4`) | ATSC (`0x0031`) | `GA94` | `0x03` (cc_data) |
//! | US/UK | DirecTV (`0x002F`) | none | `0x03` |
//!
//! `DTG1` and SCTE-20 payloads are recognised as ATSC user data but are not
//! captions for this purpose.

use crate::Codec;
use crate::error::{ReorderError, Result};
use crate::scanner::{self, Framing};

/// SEI payload type of `user_data_registered_itu_t_t35`.
pub const PAYLOAD_TYPE_REGISTERED_USER_DATA: u32 = 4;

const COUNTRY_CODE_UK: u8 = 0xB4;
const COUNTRY_CODE_US: u8 = 0xB5;
const COUNTRY_CODE_EXTENSION: u8 = 0xFF;

const PROVIDER_US_ATSC: u16 = 0x31;
const PROVIDER_US_DIRECTV: u16 = 0x2F;

const USER_DATA_ID_GA94: u32 = 0x4741_3934;
const USER_DATA_ID_DTG1: u32 = 0x4454_4731;
const USER_DATA_ID_SCTE_20_CC: u32 = 0xFFFF_FFFE;
const USER_DATA_ID_DIRECTV_CC: u32 = 0xFFFF_FFFF;

const USER_DATA_TYPE_CODE_CC_DATA: u8 = 0x03;

/// One SEI message: payload type and raw payload bytes (unescaped).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeiMessage {
    pub payload_type: u32,
    pub payload: Vec<u8>,
}

impl SeiMessage {
    /// Builds a registered user data message from its T.35 country code and
    /// the bytes that follow it.
    pub fn registered_user_data(country_code: u8, data: &[u8]) -> Self {
        let mut payload = Vec::with_capacity(data.len() + 1);
        payload.push(country_code);
        payload.extend_from_slice(data);
        SeiMessage {
            payload_type: PAYLOAD_TYPE_REGISTERED_USER_DATA,
            payload,
        }
    }

    fn is_caption(&self) -> bool {
        if self.payload_type != PAYLOAD_TYPE_REGISTERED_USER_DATA {
            return false;
        }
        match self.payload.as_slice() {
            [COUNTRY_CODE_EXTENSION, _, data @ ..] => is_cea708_sei(COUNTRY_CODE_EXTENSION, data),
            [country_code, data @ ..] => is_cea708_sei(*country_code, data),
            [] => false,
        }
    }
}

/// Returns true if a registered user data payload carries CEA-708 captions.
///
/// `data` is the payload following the country code.
pub fn is_cea708_sei(country_code: u8, data: &[u8]) -> bool {
    if country_code != COUNTRY_CODE_UK && country_code != COUNTRY_CODE_US {
        return false;
    }

    let [p0, p1, rest @ ..] = data else {
        return false;
    };
    let mut rest = rest;

    let user_data_id = match u16::from_be_bytes([*p0, *p1]) {
        PROVIDER_US_ATSC => {
            let Some(&[a, b, c, d]) = rest.get(..4) else {
                return false;
            };
            let id = u32::from_be_bytes([a, b, c, d]);
            match id {
                USER_DATA_ID_DTG1 | USER_DATA_ID_GA94 => {
                    rest = &rest[4..];
                    id
                }
                _ if (id >> 24) as u8 == USER_DATA_TYPE_CODE_CC_DATA => {
                    rest = &rest[1..];
                    USER_DATA_ID_SCTE_20_CC
                }
                _ => id,
            }
        }
        PROVIDER_US_DIRECTV => USER_DATA_ID_DIRECTV_CC,
        _ => return false,
    };

    match user_data_id {
        USER_DATA_ID_DIRECTV_CC | USER_DATA_ID_GA94 => {
            rest.first() == Some(&USER_DATA_TYPE_CODE_CC_DATA)
        }
        _ => false,
    }
}

/// Removes emulation prevention bytes.
pub(crate) fn unescape(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut zeros = 0;
    for &b in data {
        if zeros >= 2 && b == 0x03 {
            zeros = 0;
            continue;
        }
        zeros = if b == 0 { zeros + 1 } else { 0 };
        out.push(b);
    }
    out
}

/// Inserts emulation prevention bytes.
pub(crate) fn escape(rbsp: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(rbsp.len() + rbsp.len() / 64);
    let mut zeros = 0;
    for &b in rbsp {
        if zeros >= 2 && b <= 0x03 {
            out.push(0x03);
            zeros = 0;
        }
        zeros = if b == 0 { zeros + 1 } else { 0 };
        out.push(b);
    }
    out
}

fn read_sei_value(rbsp: &[u8], pos: &mut usize) -> Result<u32> {
    let mut value = 0u32;
    loop {
        let b = *rbsp
            .get(*pos)
            .ok_or_else(|| ReorderError::Bitstream("truncated SEI message header".into()))?;
        *pos += 1;
        value = value.saturating_add(u32::from(b));
        if b != 0xFF {
            return Ok(value);
        }
    }
}

/// Parses the messages of an SEI RBSP (NAL header already removed).
pub(crate) fn parse_messages(rbsp: &[u8]) -> Result<Vec<SeiMessage>> {
    let mut messages = Vec::new();
    let mut pos = 0;
    // more_rbsp_data(): stop at rbsp_trailing_bits
    while pos < rbsp.len() && !(rbsp[pos] == 0x80 && rbsp[pos + 1..].iter().all(|&b| b == 0)) {
        let payload_type = read_sei_value(rbsp, &mut pos)?;
        let payload_size = read_sei_value(rbsp, &mut pos)? as usize;
        let payload = rbsp.get(pos..pos + payload_size).ok_or_else(|| {
            ReorderError::Bitstream(format!(
                "SEI payload type {payload_type} of {payload_size} bytes is truncated"
            ))
        })?;
        messages.push(SeiMessage {
            payload_type,
            payload: payload.to_vec(),
        });
        pos += payload_size;
    }
    Ok(messages)
}

fn write_sei_value(out: &mut Vec<u8>, mut value: usize) {
    while value >= 0xFF {
        out.push(0xFF);
        value -= 0xFF;
    }
    out.push(value as u8);
}

/// Serialises messages into an escaped SEI NAL unit behind `header`.
pub(crate) fn serialize_messages(header: &[u8], messages: &[SeiMessage]) -> Vec<u8> {
    let mut rbsp = Vec::new();
    for message in messages {
        write_sei_value(&mut rbsp, message.payload_type as usize);
        write_sei_value(&mut rbsp, message.payload.len());
        rbsp.extend_from_slice(&message.payload);
    }
    rbsp.push(0x80);

    let mut nal = header.to_vec();
    nal.extend_from_slice(&escape(&rbsp));
    nal
}

impl Codec {
    fn nal_header_len(self) -> usize {
        match self {
            Codec::H264 => 1,
            Codec::H265 => 2,
        }
    }

    fn is_sei(self, nal: &[u8]) -> bool {
        match (self, nal) {
            (Codec::H264, [b, ..]) => b & 0x1F == 6,
            (Codec::H265, [b, _, ..]) => matches!((b >> 1) & 0x3F, 39 | 40),
            _ => false,
        }
    }

    fn is_vcl(self, nal: &[u8]) -> bool {
        match (self, nal) {
            (Codec::H264, [b, ..]) => matches!(b & 0x1F, 1..=5),
            (Codec::H265, [b, _, ..]) => (b >> 1) & 0x3F < 32,
            _ => false,
        }
    }

    fn sei_header(self) -> &'static [u8] {
        match self {
            Codec::H264 => &[0x06],
            // PREFIX_SEI_NUT, nuh_layer_id 0, nuh_temporal_id_plus1 1
            Codec::H265 => &[39 << 1, 0x01],
        }
    }
}

/// Strips caption SEI messages from an access unit.
///
/// Returns `None` when the access unit carries no caption SEI and can be used
/// as is. SEI NAL units that only carried captions are dropped entirely.
pub fn strip_caption_sei(codec: Codec, framing: Framing, au: &[u8]) -> Result<Option<Vec<u8>>> {
    let units = scanner::split(au, framing)?;
    if !units.iter().any(|u| codec.is_sei(u.data)) {
        return Ok(None);
    }

    let header_len = codec.nal_header_len();
    let mut changed = false;
    let mut out = Vec::with_capacity(au.len());
    for unit in &units {
        if codec.is_sei(unit.data) {
            let header = &unit.data[..header_len];
            let messages = match parse_messages(&unescape(&unit.data[header_len..])) {
                Ok(messages) => messages,
                Err(e) => {
                    tracing::debug!(error = %e, "keeping unparsable SEI NAL unit");
                    out.extend_from_slice(unit.prefix);
                    out.extend_from_slice(unit.data);
                    continue;
                }
            };

            let total = messages.len();
            let kept: Vec<SeiMessage> = messages.into_iter().filter(|m| !m.is_caption()).collect();
            if kept.len() != total {
                tracing::trace!(removed = total - kept.len(), "found CEA-708 caption SEI");
                changed = true;
                if !kept.is_empty() {
                    scanner::write_nal(&mut out, framing, &serialize_messages(header, &kept))?;
                }
                continue;
            }
        }
        out.extend_from_slice(unit.prefix);
        out.extend_from_slice(unit.data);
    }

    Ok(changed.then_some(out))
}

/// Inserts an SEI NAL unit holding `messages` ahead of the first slice of
/// the access unit.
pub fn insert_sei(
    codec: Codec,
    framing: Framing,
    au: &[u8],
    messages: &[SeiMessage],
) -> Result<Vec<u8>> {
    let units = scanner::split(au, framing)?;
    let first_vcl = units
        .iter()
        .position(|u| codec.is_vcl(u.data))
        .ok_or(ReorderError::NoSlice)?;

    let sei = serialize_messages(codec.sei_header(), messages);
    let mut out = Vec::with_capacity(au.len() + sei.len() + 4);
    for (i, unit) in units.iter().enumerate() {
        if i == first_vcl {
            scanner::write_nal(&mut out, framing, &sei)?;
        }
        out.extend_from_slice(unit.prefix);
        out.extend_from_slice(unit.data);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ga94_cc() -> Vec<u8> {
        // provider 0x0031, "GA94", user_data_type_code 3, a few cc bytes
        vec![0x00, 0x31, 0x47, 0x41, 0x39, 0x34, 0x03, 0xC1, 0xFF, 0xFC, 0x80, 0x80]
    }

    #[test]
    fn detects_atsc_ga94_captions() {
        assert!(is_cea708_sei(0xB5, &ga94_cc()));
        assert!(is_cea708_sei(0xB4, &ga94_cc()));
    }

    #[test]
    fn rejects_other_country_and_short_payloads() {
        assert!(!is_cea708_sei(0x26, &ga94_cc()));
        assert!(!is_cea708_sei(0xB5, &[0x00]));
        assert!(!is_cea708_sei(0xB5, &[0x00, 0x31, 0x47]));
    }

    #[test]
    fn dtg1_and_bar_data_are_not_captions() {
        assert!(!is_cea708_sei(0xB5, &[0x00, 0x31, 0x44, 0x54, 0x47, 0x31, 0x03]));
        assert!(!is_cea708_sei(0xB5, &[0x00, 0x31, 0x47, 0x41, 0x39, 0x34, 0x06]));
    }

    #[test]
    fn scte20_is_recognised_but_not_a_caption() {
        assert!(!is_cea708_sei(0xB5, &[0x00, 0x31, 0x03, 0x81, 0x22, 0x33]));
    }

    #[test]
    fn detects_directv_captions() {
        assert!(is_cea708_sei(0xB5, &[0x00, 0x2F, 0x03, 0x00]));
        assert!(!is_cea708_sei(0xB5, &[0x00, 0x2F, 0x04]));
    }

    #[test]
    fn escape_inserts_prevention_bytes() {
        assert_eq!(escape(&[0, 0, 1, 0, 0, 0]), vec![0, 0, 3, 1, 0, 0, 3, 0]);
        assert_eq!(unescape(&[0, 0, 3, 1, 0, 0, 3, 0]), vec![0, 0, 1, 0, 0, 0]);
    }

    #[test]
    fn parse_messages_stops_at_trailing_bits() {
        let messages = parse_messages(&[5, 2, 0xAA, 0xBB, 0x80]).unwrap();
        assert_eq!(
            messages,
            vec![SeiMessage {
                payload_type: 5,
                payload: vec![0xAA, 0xBB]
            }]
        );
    }

    #[test]
    fn strip_removes_caption_only_sei() {
        let caption = SeiMessage::registered_user_data(0xB5, &ga94_cc());
        let sei = serialize_messages(&[0x06], &[caption]);
        let mut au = vec![0, 0, 0, 1];
        au.extend_from_slice(&sei);
        au.extend_from_slice(&[0, 0, 0, 1, 0x65, 0x88, 0x84]);

        let stripped = strip_caption_sei(Codec::H264, Framing::AnnexB, &au)
            .unwrap()
            .unwrap();
        assert_eq!(stripped, vec![0, 0, 0, 1, 0x65, 0x88, 0x84]);
    }

    #[test]
    fn strip_keeps_other_messages() {
        let caption = SeiMessage::registered_user_data(0xB5, &ga94_cc());
        let other = SeiMessage {
            payload_type: 5,
            payload: vec![1, 2, 3],
        };
        let sei = serialize_messages(&[0x06], &[other.clone(), caption]);
        let mut au = vec![0, 0, 0, 1];
        au.extend_from_slice(&sei);
        au.extend_from_slice(&[0, 0, 0, 1, 0x65, 0x88]);

        let stripped = strip_caption_sei(Codec::H264, Framing::AnnexB, &au)
            .unwrap()
            .unwrap();
        let units = scanner::split(&stripped, Framing::AnnexB).unwrap();
        assert_eq!(units.len(), 2);
        let kept = parse_messages(&unescape(&units[0].data[1..])).unwrap();
        assert_eq!(kept, vec![other]);
    }

    #[test]
    fn strip_without_sei_is_untouched() {
        let au = [0, 0, 0, 1, 0x65, 0x88];
        assert!(strip_caption_sei(Codec::H264, Framing::AnnexB, &au).unwrap().is_none());
    }

    #[test]
    fn insert_sei_goes_before_first_slice() {
        let au = [0, 0, 0, 1, 0x09, 0xF0, 0, 0, 0, 1, 0x65, 0x88];
        let message = SeiMessage {
            payload_type: 5,
            payload: vec![7],
        };
        let out = insert_sei(Codec::H264, Framing::AnnexB, &au, &[message]).unwrap();
        let units = scanner::split(&out, Framing::AnnexB).unwrap();
        let types: Vec<u8> = units.iter().map(|u| u.data[0] & 0x1F).collect();
        assert_eq!(types, vec![9, 6, 5]);
    }

    #[test]
    fn insert_sei_h265_uses_prefix_sei() {
        let au = [0, 0, 1, 0x26, 0x01, 0xAF];
        let out = insert_sei(Codec::H265, Framing::AnnexB, &au, &[]).unwrap();
        let units = scanner::split(&out, Framing::AnnexB).unwrap();
        assert_eq!(units[0].data[..2], [0x4E, 0x01]);
    }

    #[test]
    fn insert_sei_without_slice_fails() {
        let au = [0, 0, 0, 1, 0x67, 0x42];
        assert!(insert_sei(Codec::H264, Framing::AnnexB, &au, &[]).is_err());
    }
}
