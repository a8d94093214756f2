//! Bitstream builders for the reorder integration tests.
//!
//! Parameter sets and slice headers are written field by field; slices carry
//! no slice data beyond the header since nothing after it is parsed.

#![allow(dead_code)]

/// MSB-first bit writer with Exp-Golomb codes.
#[derive(Default)]
pub struct BitWriter {
    bytes: Vec<u8>,
    bits: usize,
}

impl BitWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn flag(&mut self, b: bool) -> &mut Self {
        if self.bits % 8 == 0 {
            self.bytes.push(0);
        }
        if b {
            let last = self.bytes.len() - 1;
            self.bytes[last] |= 0x80 >> (self.bits % 8);
        }
        self.bits += 1;
        self
    }

    pub fn u(&mut self, n: u32, v: u64) -> &mut Self {
        for i in (0..n).rev() {
            self.flag((v >> i) & 1 == 1);
        }
        self
    }

    pub fn ue(&mut self, v: u32) -> &mut Self {
        let v = u64::from(v) + 1;
        let len = u64::BITS - v.leading_zeros();
        self.u(len - 1, 0);
        self.u(len, v)
    }

    pub fn se(&mut self, v: i32) -> &mut Self {
        let mapped = if v > 0 { 2 * v as u32 - 1 } else { 2 * v.unsigned_abs() };
        self.ue(mapped)
    }

    /// Appends `rbsp_trailing_bits` and returns the RBSP.
    pub fn finish(&mut self) -> Vec<u8> {
        self.flag(true);
        std::mem::take(&mut self.bytes)
    }
}

/// Prefixes `header` and inserts emulation prevention bytes into `rbsp`.
pub fn nal(header: &[u8], rbsp: &[u8]) -> Vec<u8> {
    let mut out = header.to_vec();
    let mut zeros = 0;
    for &b in rbsp {
        if zeros >= 2 && b <= 3 {
            out.push(3);
            zeros = 0;
        }
        out.push(b);
        zeros = if b == 0 { zeros + 1 } else { 0 };
    }
    out
}

pub fn annex_b(nals: &[Vec<u8>]) -> Vec<u8> {
    let mut out = Vec::new();
    for n in nals {
        out.extend_from_slice(&[0, 0, 0, 1]);
        out.extend_from_slice(n);
    }
    out
}

pub fn length_prefixed(nals: &[Vec<u8>]) -> Vec<u8> {
    let mut out = Vec::new();
    for n in nals {
        out.extend_from_slice(&(n.len() as u32).to_be_bytes());
        out.extend_from_slice(n);
    }
    out
}

pub mod h264 {
    use super::{nal, BitWriter};

    /// Main profile, 320x240, POC type 0 with 6-bit LSBs, 4-bit frame_num,
    /// two reference frames, one frame of reordering (VUI).
    pub fn sps(width_mbs: u32, height_mbs: u32, gaps_allowed: bool) -> Vec<u8> {
        let mut w = BitWriter::new();
        w.u(8, 77).u(8, 0).u(8, 40);
        w.ue(0); // seq_parameter_set_id
        w.ue(0); // log2_max_frame_num_minus4
        w.ue(0); // pic_order_cnt_type
        w.ue(2); // log2_max_pic_order_cnt_lsb_minus4
        w.ue(2); // max_num_ref_frames
        w.flag(gaps_allowed);
        w.ue(width_mbs - 1).ue(height_mbs - 1);
        w.flag(true); // frame_mbs_only_flag
        w.flag(true); // direct_8x8_inference_flag
        w.flag(false); // frame_cropping_flag
        w.flag(true); // vui_parameters_present_flag
        for _ in 0..5 {
            // aspect ratio, overscan, video signal, chroma loc, timing
            w.flag(false);
        }
        w.flag(false).flag(false); // HRD
        w.flag(false); // pic_struct_present_flag
        w.flag(true); // bitstream_restriction_flag
        w.flag(true);
        w.ue(0).ue(0).ue(16).ue(16);
        w.ue(1); // max_num_reorder_frames
        w.ue(2); // max_dec_frame_buffering
        nal(&[0x67], &w.finish())
    }

    pub fn pps() -> Vec<u8> {
        let mut w = BitWriter::new();
        w.ue(0).ue(0);
        w.flag(false).flag(false); // entropy coding, bottom field POC
        w.ue(0); // num_slice_groups_minus1
        w.ue(0).ue(0);
        w.flag(false).u(2, 0);
        w.se(0).se(0).se(0);
        w.flag(true).flag(false).flag(false);
        nal(&[0x68], &w.finish())
    }

    pub fn idr(idr_pic_id: u32) -> Vec<u8> {
        let mut w = BitWriter::new();
        w.ue(0).ue(7).ue(0); // first_mb, slice_type I, pps
        w.u(4, 0); // frame_num
        w.ue(idr_pic_id);
        w.u(6, 0); // pic_order_cnt_lsb
        w.flag(false).flag(false); // dec_ref_pic_marking
        w.ue(0); // slice_qp_delta
        nal(&[0x65], &w.finish())
    }

    pub fn p(frame_num: u64, poc_lsb: u64) -> Vec<u8> {
        let mut w = BitWriter::new();
        w.ue(0).ue(5).ue(0);
        w.u(4, frame_num);
        w.u(6, poc_lsb);
        w.flag(false); // num_ref_idx_active_override_flag
        w.flag(false); // ref_pic_list_modification_flag_l0
        w.flag(false); // adaptive_ref_pic_marking_mode_flag
        w.ue(0);
        nal(&[0x41], &w.finish())
    }

    /// Non-reference B slice.
    pub fn b(frame_num: u64, poc_lsb: u64) -> Vec<u8> {
        let mut w = BitWriter::new();
        w.ue(0).ue(6).ue(0);
        w.u(4, frame_num);
        w.u(6, poc_lsb);
        w.flag(true); // direct_spatial_mv_pred_flag
        w.flag(false);
        w.flag(false).flag(false);
        w.ue(0);
        nal(&[0x01], &w.finish())
    }

    /// AUD with primary_pic_type 7.
    pub fn aud() -> Vec<u8> {
        vec![0x09, 0xF0]
    }

    pub fn avcc(sps: &[u8], pps: &[u8]) -> Vec<u8> {
        let mut out = vec![1, sps[1], sps[2], sps[3], 0xFF, 0xE1];
        out.extend_from_slice(&(sps.len() as u16).to_be_bytes());
        out.extend_from_slice(sps);
        out.push(1);
        out.extend_from_slice(&(pps.len() as u16).to_be_bytes());
        out.extend_from_slice(pps);
        out
    }
}

pub mod h265 {
    use super::{nal, BitWriter};

    pub const IDR_W_RADL: u8 = 19;
    pub const CRA: u8 = 21;
    pub const TRAIL_N: u8 = 0;
    pub const TRAIL_R: u8 = 1;
    pub const RASL_N: u8 = 8;

    fn header(nal_type: u8) -> [u8; 2] {
        [nal_type << 1, 0x01]
    }

    /// Main profile, 320x240 with 16x16 CTBs, 8-bit POC LSBs, three
    /// decoded pictures buffered and one of reordering.
    pub fn sps() -> Vec<u8> {
        sps_with_short_term_sets(|w| {
            w.ue(0);
        })
    }

    /// Like [`sps`], with two short-term RPS: set 0 is `{-1}` and set 1 is
    /// predicted from it with deltaRps = -1, giving `{-1, -2}`.
    pub fn sps_inter_rps() -> Vec<u8> {
        sps_with_short_term_sets(|w| {
            w.ue(2); // num_short_term_ref_pic_sets
            // set 0
            w.ue(1).ue(0); // one negative, no positive
            w.ue(0).flag(true); // -1, used
            // set 1
            w.flag(true); // inter_ref_pic_set_prediction_flag
            w.flag(true); // delta_rps_sign
            w.ue(0); // abs_delta_rps_minus1
            w.flag(true); // used_by_curr_pic_flag for -1 - 1
            w.flag(true); // used_by_curr_pic_flag for deltaRps
        })
    }

    fn sps_with_short_term_sets(rps: impl FnOnce(&mut BitWriter)) -> Vec<u8> {
        let mut w = BitWriter::new();
        w.u(4, 0).u(3, 0).flag(true);
        // profile_tier_level
        w.u(2, 0).flag(false).u(5, 1);
        w.u(32, 0x6000_0000);
        w.flag(true).flag(false).flag(false).flag(true);
        w.u(43, 0).flag(false);
        w.u(8, 63);
        w.ue(0); // sps_seq_parameter_set_id
        w.ue(1); // chroma_format_idc
        w.ue(320).ue(240);
        w.flag(false); // conformance_window_flag
        w.ue(0).ue(0);
        w.ue(4); // log2_max_pic_order_cnt_lsb_minus4
        w.flag(true);
        w.ue(2).ue(1).ue(0); // dec buffering, reorder, latency
        w.ue(0).ue(1).ue(0).ue(2).ue(0).ue(0);
        w.flag(false); // scaling_list_enabled_flag
        w.flag(false).flag(false); // amp, sao
        w.flag(false); // pcm
        rps(&mut w);
        w.flag(false); // long_term_ref_pics_present_flag
        w.flag(false); // sps_temporal_mvp_enabled_flag
        w.flag(false); // strong_intra_smoothing_enabled_flag
        w.flag(false); // vui_parameters_present_flag
        w.flag(false); // sps_extension_present_flag
        nal(&[0x42, 0x01], &w.finish())
    }

    pub fn pps() -> Vec<u8> {
        let mut w = BitWriter::new();
        w.ue(0).ue(0);
        w.flag(false).flag(false).u(3, 0);
        w.flag(false).flag(false);
        nal(&[0x44, 0x01], &w.finish())
    }

    pub fn idr() -> Vec<u8> {
        let mut w = BitWriter::new();
        w.flag(true); // first_slice_segment_in_pic_flag
        w.flag(false); // no_output_of_prior_pics_flag
        w.ue(0); // slice_pic_parameter_set_id
        w.ue(2); // slice_type I
        w.ue(0);
        nal(&header(IDR_W_RADL), &w.finish())
    }

    /// A slice with an explicit short-term RPS given as POC deltas.
    pub fn slice(nal_type: u8, poc_lsb: u64, negative: &[i32], positive: &[i32]) -> Vec<u8> {
        let mut w = BitWriter::new();
        w.flag(true);
        if (16..=23).contains(&nal_type) {
            w.flag(false);
        }
        w.ue(0);
        w.ue(if nal_type >= 16 { 2 } else { 1 });
        w.u(8, poc_lsb);
        w.flag(false); // short_term_ref_pic_set_sps_flag
        w.ue(negative.len() as u32).ue(positive.len() as u32);
        let mut prev = 0;
        for &d in negative {
            w.ue((prev - d - 1) as u32).flag(true);
            prev = d;
        }
        prev = 0;
        for &d in positive {
            w.ue((d - prev - 1) as u32).flag(true);
            prev = d;
        }
        w.ue(0);
        nal(&header(nal_type), &w.finish())
    }

    /// A P slice using short-term RPS `idx` of a two-set SPS.
    pub fn slice_sps_rps(nal_type: u8, poc_lsb: u64, idx: u64) -> Vec<u8> {
        let mut w = BitWriter::new();
        w.flag(true);
        w.ue(0);
        w.ue(1);
        w.u(8, poc_lsb);
        w.flag(true); // short_term_ref_pic_set_sps_flag
        w.u(1, idx);
        w.ue(0);
        nal(&header(nal_type), &w.finish())
    }

    pub fn end_of_sequence() -> Vec<u8> {
        vec![36 << 1, 0x01]
    }

    pub fn aud() -> Vec<u8> {
        vec![35 << 1, 0x01, 0x50]
    }

    pub fn hvcc(sps: &[u8], pps: &[u8]) -> Vec<u8> {
        let mut out = vec![1];
        out.extend_from_slice(&[0; 20]);
        out.push(0x0F); // lengthSizeMinusOne = 3
        out.push(2); // numOfArrays
        for (nal_type, unit) in [(33u8, sps), (34, pps)] {
            out.push(0x80 | nal_type);
            out.extend_from_slice(&1u16.to_be_bytes());
            out.extend_from_slice(&(unit.len() as u16).to_be_bytes());
            out.extend_from_slice(unit);
        }
        out
    }
}
