//! H.265 parameter sets and slice segment headers.
//!
//! The SPS is read through `sps_temporal_mvp_enabled_flag`, the PPS through
//! `num_extra_slice_header_bits` and the slice segment header through the
//! long-term reference pictures; nothing after that affects output order.
//! VPS units are not parsed.

use std::collections::HashMap;
use std::sync::Arc;

use h264_reader::rbsp::{BitRead, BitReader, ByteReader};

use crate::error::{ParameterSetKind, ReorderError, Result};

pub const NAL_TRAIL_N: u8 = 0;
pub const NAL_RADL_N: u8 = 6;
pub const NAL_RADL_R: u8 = 7;
pub const NAL_RASL_N: u8 = 8;
pub const NAL_RASL_R: u8 = 9;
pub const NAL_BLA_W_LP: u8 = 16;
pub const NAL_BLA_N_LP: u8 = 18;
pub const NAL_IDR_W_RADL: u8 = 19;
pub const NAL_IDR_N_LP: u8 = 20;
pub const NAL_CRA: u8 = 21;
pub const NAL_RSV_IRAP_23: u8 = 23;
pub const NAL_VPS: u8 = 32;
pub const NAL_SPS: u8 = 33;
pub const NAL_PPS: u8 = 34;
pub const NAL_EOS: u8 = 36;
pub const NAL_EOB: u8 = 37;

const MAX_SPS_ID: u32 = 15;
const MAX_PPS_ID: u32 = 63;
const MAX_SHORT_TERM_REF_PIC_SETS: u32 = 64;
const MAX_LONG_TERM_REF_PICS_SPS: u32 = 32;

pub fn is_idr(nal_type: u8) -> bool {
    matches!(nal_type, NAL_IDR_W_RADL | NAL_IDR_N_LP)
}

pub fn is_bla(nal_type: u8) -> bool {
    (NAL_BLA_W_LP..=NAL_BLA_N_LP).contains(&nal_type)
}

pub fn is_cra(nal_type: u8) -> bool {
    nal_type == NAL_CRA
}

pub fn is_irap(nal_type: u8) -> bool {
    (NAL_BLA_W_LP..=NAL_RSV_IRAP_23).contains(&nal_type)
}

pub fn is_rasl(nal_type: u8) -> bool {
    matches!(nal_type, NAL_RASL_N | NAL_RASL_R)
}

pub fn is_radl(nal_type: u8) -> bool {
    matches!(nal_type, NAL_RADL_N | NAL_RADL_R)
}

/// Sub-layer non-reference pictures (`TRAIL_N`, `TSA_N`, ... `RSV_VCL_N14`).
pub fn is_sub_layer_ref(nal_type: u8) -> bool {
    !(nal_type <= 14 && nal_type % 2 == 0)
}

fn ceil_log2(v: u32) -> u32 {
    if v <= 1 {
        0
    } else {
        u32::BITS - (v - 1).leading_zeros()
    }
}

/// `nal_unit_type` and `nuh_temporal_id_plus1` from the two header bytes.
pub fn nal_header(nal: &[u8]) -> Result<(u8, u8)> {
    let [b0, b1, ..] = *nal else {
        return Err(ReorderError::Bitstream("NAL unit too short".into()));
    };
    if b0 & 0x80 != 0 {
        return Err(ReorderError::Bitstream("forbidden_zero_bit set".into()));
    }
    let temporal_id_plus1 = b1 & 0b111;
    if temporal_id_plus1 == 0 {
        return Err(ReorderError::Bitstream("nuh_temporal_id_plus1 is zero".into()));
    }
    Ok(((b0 >> 1) & 0x3F, temporal_id_plus1))
}

fn rbsp(nal: &[u8]) -> BitReader<ByteReader<&[u8]>> {
    BitReader::new(ByteReader::without_skip(nal.get(2..).unwrap_or_default()))
}

/// A short-term reference picture set with its deltas resolved (7.4.8).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShortTermRefPicSet {
    /// `DeltaPocS0`, decreasing.
    pub delta_poc_s0: Vec<i32>,
    pub used_by_curr_pic_s0: Vec<bool>,
    /// `DeltaPocS1`, increasing.
    pub delta_poc_s1: Vec<i32>,
    pub used_by_curr_pic_s1: Vec<bool>,
}

impl ShortTermRefPicSet {
    pub fn num_delta_pocs(&self) -> usize {
        self.delta_poc_s0.len() + self.delta_poc_s1.len()
    }

    /// `st_ref_pic_set(idx)` of an SPS carrying `num_sets` sets. `sets` holds
    /// the SPS sets decoded so far. Only a slice header reads a set with
    /// `idx == num_sets`, and only there is `delta_idx_minus1` present.
    fn read<R: BitRead>(
        r: &mut R,
        idx: usize,
        num_sets: usize,
        sets: &[ShortTermRefPicSet],
    ) -> Result<Self> {
        let inter_ref_pic_set_prediction_flag =
            idx != 0 && r.read_bool("inter_ref_pic_set_prediction_flag")?;
        if inter_ref_pic_set_prediction_flag {
            return Self::read_predicted(r, idx, num_sets, sets);
        }

        let num_negative_pics = r.read_ue("num_negative_pics")?;
        let num_positive_pics = r.read_ue("num_positive_pics")?;
        if num_negative_pics > 16 || num_positive_pics > 16 {
            return Err(ReorderError::Bitstream("too many pictures in short-term RPS".into()));
        }

        let mut set = ShortTermRefPicSet::default();
        let mut poc = 0i32;
        for _ in 0..num_negative_pics {
            let delta = r.read_ue("delta_poc_s0_minus1")?;
            if delta > 0x7FFF {
                return Err(ReorderError::Bitstream("delta_poc_s0_minus1 out of range".into()));
            }
            poc -= delta as i32 + 1;
            set.delta_poc_s0.push(poc);
            set.used_by_curr_pic_s0.push(r.read_bool("used_by_curr_pic_s0_flag")?);
        }
        poc = 0;
        for _ in 0..num_positive_pics {
            let delta = r.read_ue("delta_poc_s1_minus1")?;
            if delta > 0x7FFF {
                return Err(ReorderError::Bitstream("delta_poc_s1_minus1 out of range".into()));
            }
            poc += delta as i32 + 1;
            set.delta_poc_s1.push(poc);
            set.used_by_curr_pic_s1.push(r.read_bool("used_by_curr_pic_s1_flag")?);
        }
        Ok(set)
    }

    // (7-61), (7-62)
    fn read_predicted<R: BitRead>(
        r: &mut R,
        idx: usize,
        num_sets: usize,
        sets: &[ShortTermRefPicSet],
    ) -> Result<Self> {
        let delta_idx_minus1 = if idx == num_sets {
            r.read_ue("delta_idx_minus1")? as usize
        } else {
            0
        };
        let ref_idx = idx
            .checked_sub(delta_idx_minus1 + 1)
            .ok_or_else(|| ReorderError::Bitstream("delta_idx_minus1 out of range".into()))?;
        let reference = sets
            .get(ref_idx)
            .ok_or_else(|| ReorderError::Bitstream("reference RPS index out of range".into()))?;

        let delta_rps_sign = r.read_bool("delta_rps_sign")?;
        let abs_delta_rps_minus1 = r.read_ue("abs_delta_rps_minus1")?;
        if abs_delta_rps_minus1 > 0x7FFF {
            return Err(ReorderError::Bitstream("abs_delta_rps_minus1 out of range".into()));
        }
        let delta_rps = (abs_delta_rps_minus1 as i32 + 1) * if delta_rps_sign { -1 } else { 1 };

        let num_delta_pocs = reference.num_delta_pocs();
        let mut used_by_curr_pic = Vec::with_capacity(num_delta_pocs + 1);
        let mut use_delta = Vec::with_capacity(num_delta_pocs + 1);
        for _ in 0..=num_delta_pocs {
            let used = r.read_bool("used_by_curr_pic_flag")?;
            used_by_curr_pic.push(used);
            use_delta.push(used || r.read_bool("use_delta_flag")?);
        }

        let num_negative = reference.delta_poc_s0.len();
        let mut set = ShortTermRefPicSet::default();

        for (j, &d) in reference.delta_poc_s1.iter().enumerate().rev() {
            let d_poc = d + delta_rps;
            if d_poc < 0 && use_delta[num_negative + j] {
                set.delta_poc_s0.push(d_poc);
                set.used_by_curr_pic_s0.push(used_by_curr_pic[num_negative + j]);
            }
        }
        if delta_rps < 0 && use_delta[num_delta_pocs] {
            set.delta_poc_s0.push(delta_rps);
            set.used_by_curr_pic_s0.push(used_by_curr_pic[num_delta_pocs]);
        }
        for (j, &d) in reference.delta_poc_s0.iter().enumerate() {
            let d_poc = d + delta_rps;
            if d_poc < 0 && use_delta[j] {
                set.delta_poc_s0.push(d_poc);
                set.used_by_curr_pic_s0.push(used_by_curr_pic[j]);
            }
        }

        for (j, &d) in reference.delta_poc_s0.iter().enumerate().rev() {
            let d_poc = d + delta_rps;
            if d_poc > 0 && use_delta[j] {
                set.delta_poc_s1.push(d_poc);
                set.used_by_curr_pic_s1.push(used_by_curr_pic[j]);
            }
        }
        if delta_rps > 0 && use_delta[num_delta_pocs] {
            set.delta_poc_s1.push(delta_rps);
            set.used_by_curr_pic_s1.push(used_by_curr_pic[num_delta_pocs]);
        }
        for (j, &d) in reference.delta_poc_s1.iter().enumerate() {
            let d_poc = d + delta_rps;
            if d_poc > 0 && use_delta[num_negative + j] {
                set.delta_poc_s1.push(d_poc);
                set.used_by_curr_pic_s1.push(used_by_curr_pic[num_negative + j]);
            }
        }

        if set.delta_poc_s0.len() > 16 || set.delta_poc_s1.len() > 16 {
            return Err(ReorderError::Bitstream("predicted RPS too large".into()));
        }
        Ok(set)
    }
}

/// Sequence parameter set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sps {
    pub id: u32,
    pub max_sub_layers_minus1: u8,
    pub progressive_source_flag: bool,
    pub interlaced_source_flag: bool,
    pub general_level_idc: u8,
    pub separate_colour_plane_flag: bool,
    pub width: u32,
    pub height: u32,
    pub log2_max_pic_order_cnt_lsb: u32,
    /// Ordering info of the highest sub-layer.
    pub max_dec_pic_buffering_minus1: u32,
    pub max_num_reorder_pics: u32,
    pub max_latency_increase_plus1: u32,
    /// `PicSizeInCtbsY`.
    pub pic_size_in_ctbs: u32,
    pub short_term_ref_pic_sets: Vec<ShortTermRefPicSet>,
    pub long_term_ref_pics_present_flag: bool,
    pub lt_ref_pic_poc_lsb_sps: Vec<u32>,
    pub used_by_curr_pic_lt_sps_flag: Vec<bool>,
    pub temporal_mvp_enabled_flag: bool,
}

impl Sps {
    /// Parses an SPS NAL unit, header bytes included.
    pub fn parse(nal: &[u8]) -> Result<Sps> {
        let mut r = rbsp(nal);

        r.skip(4, "sps_video_parameter_set_id")?;
        let max_sub_layers_minus1: u8 = r.read(3, "sps_max_sub_layers_minus1")?;
        if max_sub_layers_minus1 > 6 {
            return Err(ReorderError::Bitstream("sps_max_sub_layers_minus1 out of range".into()));
        }
        r.read_bool("sps_temporal_id_nesting_flag")?;
        let ptl = ProfileTierLevel::read(&mut r, max_sub_layers_minus1)?;

        let id = r.read_ue("sps_seq_parameter_set_id")?;
        if id > MAX_SPS_ID {
            return Err(ReorderError::Bitstream(format!("sps_seq_parameter_set_id {id} out of range")));
        }
        let chroma_format_idc = r.read_ue("chroma_format_idc")?;
        if chroma_format_idc > 3 {
            return Err(ReorderError::Bitstream("chroma_format_idc out of range".into()));
        }
        let separate_colour_plane_flag =
            chroma_format_idc == 3 && r.read_bool("separate_colour_plane_flag")?;
        let width = r.read_ue("pic_width_in_luma_samples")?;
        let height = r.read_ue("pic_height_in_luma_samples")?;
        if width == 0 || height == 0 {
            return Err(ReorderError::Bitstream("zero picture size".into()));
        }
        if r.read_bool("conformance_window_flag")? {
            r.read_ue("conf_win_left_offset")?;
            r.read_ue("conf_win_right_offset")?;
            r.read_ue("conf_win_top_offset")?;
            r.read_ue("conf_win_bottom_offset")?;
        }
        r.read_ue("bit_depth_luma_minus8")?;
        r.read_ue("bit_depth_chroma_minus8")?;
        let log2_max_pic_order_cnt_lsb_minus4 = r.read_ue("log2_max_pic_order_cnt_lsb_minus4")?;
        if log2_max_pic_order_cnt_lsb_minus4 > 12 {
            return Err(ReorderError::Bitstream(
                "log2_max_pic_order_cnt_lsb_minus4 out of range".into(),
            ));
        }

        let ordering_info_present = r.read_bool("sps_sub_layer_ordering_info_present_flag")?;
        let first = if ordering_info_present { 0 } else { max_sub_layers_minus1 };
        let mut max_dec_pic_buffering_minus1 = 0;
        let mut max_num_reorder_pics = 0;
        let mut max_latency_increase_plus1 = 0;
        for _ in first..=max_sub_layers_minus1 {
            max_dec_pic_buffering_minus1 = r.read_ue("sps_max_dec_pic_buffering_minus1")?;
            max_num_reorder_pics = r.read_ue("sps_max_num_reorder_pics")?;
            max_latency_increase_plus1 = r.read_ue("sps_max_latency_increase_plus1")?;
        }
        if max_dec_pic_buffering_minus1 > 15 || max_num_reorder_pics > max_dec_pic_buffering_minus1 {
            return Err(ReorderError::Bitstream("sub-layer ordering info out of range".into()));
        }

        let log2_min_cb_size = r.read_ue("log2_min_luma_coding_block_size_minus3")? + 3;
        let log2_ctb_size = log2_min_cb_size + r.read_ue("log2_diff_max_min_luma_coding_block_size")?;
        if log2_ctb_size > 6 {
            return Err(ReorderError::Bitstream("coding tree block size out of range".into()));
        }
        let ctb_size = 1u32 << log2_ctb_size;
        let pic_size_in_ctbs = width.div_ceil(ctb_size) * height.div_ceil(ctb_size);

        r.read_ue("log2_min_luma_transform_block_size_minus2")?;
        r.read_ue("log2_diff_max_min_luma_transform_block_size")?;
        r.read_ue("max_transform_hierarchy_depth_inter")?;
        r.read_ue("max_transform_hierarchy_depth_intra")?;
        if r.read_bool("scaling_list_enabled_flag")?
            && r.read_bool("sps_scaling_list_data_present_flag")?
        {
            skip_scaling_list_data(&mut r)?;
        }
        r.read_bool("amp_enabled_flag")?;
        r.read_bool("sample_adaptive_offset_enabled_flag")?;
        if r.read_bool("pcm_enabled_flag")? {
            r.skip(4, "pcm_sample_bit_depth_luma_minus1")?;
            r.skip(4, "pcm_sample_bit_depth_chroma_minus1")?;
            r.read_ue("log2_min_pcm_luma_coding_block_size_minus3")?;
            r.read_ue("log2_diff_max_min_pcm_luma_coding_block_size")?;
            r.read_bool("pcm_loop_filter_disabled_flag")?;
        }

        let num_short_term_ref_pic_sets = r.read_ue("num_short_term_ref_pic_sets")?;
        if num_short_term_ref_pic_sets > MAX_SHORT_TERM_REF_PIC_SETS {
            return Err(ReorderError::Bitstream("num_short_term_ref_pic_sets out of range".into()));
        }
        let mut short_term_ref_pic_sets = Vec::with_capacity(num_short_term_ref_pic_sets as usize);
        for i in 0..num_short_term_ref_pic_sets as usize {
            let set = ShortTermRefPicSet::read(
                &mut r,
                i,
                num_short_term_ref_pic_sets as usize,
                &short_term_ref_pic_sets,
            )?;
            short_term_ref_pic_sets.push(set);
        }

        let mut lt_ref_pic_poc_lsb_sps = Vec::new();
        let mut used_by_curr_pic_lt_sps_flag = Vec::new();
        let long_term_ref_pics_present_flag = r.read_bool("long_term_ref_pics_present_flag")?;
        if long_term_ref_pics_present_flag {
            let num = r.read_ue("num_long_term_ref_pics_sps")?;
            if num > MAX_LONG_TERM_REF_PICS_SPS {
                return Err(ReorderError::Bitstream("num_long_term_ref_pics_sps out of range".into()));
            }
            for _ in 0..num {
                lt_ref_pic_poc_lsb_sps.push(
                    r.read::<u32>(log2_max_pic_order_cnt_lsb_minus4 + 4, "lt_ref_pic_poc_lsb_sps")?,
                );
                used_by_curr_pic_lt_sps_flag.push(r.read_bool("used_by_curr_pic_lt_sps_flag")?);
            }
        }
        let temporal_mvp_enabled_flag = r.read_bool("sps_temporal_mvp_enabled_flag")?;

        Ok(Sps {
            id,
            max_sub_layers_minus1,
            progressive_source_flag: ptl.progressive_source_flag,
            interlaced_source_flag: ptl.interlaced_source_flag,
            general_level_idc: ptl.general_level_idc,
            separate_colour_plane_flag,
            width,
            height,
            log2_max_pic_order_cnt_lsb: log2_max_pic_order_cnt_lsb_minus4 + 4,
            max_dec_pic_buffering_minus1,
            max_num_reorder_pics,
            max_latency_increase_plus1,
            pic_size_in_ctbs,
            short_term_ref_pic_sets,
            long_term_ref_pics_present_flag,
            lt_ref_pic_poc_lsb_sps,
            used_by_curr_pic_lt_sps_flag,
            temporal_mvp_enabled_flag,
        })
    }

    pub fn max_pic_order_cnt_lsb(&self) -> i32 {
        1 << self.log2_max_pic_order_cnt_lsb
    }

    /// `SpsMaxLatencyPictures`, or `None` when no latency limit is signalled.
    pub fn max_latency_pictures(&self) -> Option<u32> {
        (self.max_latency_increase_plus1 != 0)
            .then(|| self.max_num_reorder_pics + self.max_latency_increase_plus1 - 1)
    }
}

struct ProfileTierLevel {
    progressive_source_flag: bool,
    interlaced_source_flag: bool,
    general_level_idc: u8,
}

impl ProfileTierLevel {
    // 7.3.3, profile_tier_level(1, sps_max_sub_layers_minus1)
    fn read<R: BitRead>(r: &mut R, max_sub_layers_minus1: u8) -> Result<Self> {
        r.skip(2, "general_profile_space")?;
        r.skip(1, "general_tier_flag")?;
        r.skip(5, "general_profile_idc")?;
        r.skip(32, "general_profile_compatibility_flags")?;
        let progressive_source_flag = r.read_bool("general_progressive_source_flag")?;
        let interlaced_source_flag = r.read_bool("general_interlaced_source_flag")?;
        r.skip(1, "general_non_packed_constraint_flag")?;
        r.skip(1, "general_frame_only_constraint_flag")?;
        r.skip(43, "general_reserved_zero_43bits")?;
        r.skip(1, "general_inbld_flag")?;
        let general_level_idc: u8 = r.read(8, "general_level_idc")?;

        let mut present = [(false, false); 7];
        for flags in present.iter_mut().take(usize::from(max_sub_layers_minus1)) {
            flags.0 = r.read_bool("sub_layer_profile_present_flag")?;
            flags.1 = r.read_bool("sub_layer_level_present_flag")?;
        }
        if max_sub_layers_minus1 > 0 {
            for _ in max_sub_layers_minus1..8 {
                r.skip(2, "reserved_zero_2bits")?;
            }
        }
        for &(profile_present, level_present) in &present[..usize::from(max_sub_layers_minus1)] {
            if profile_present {
                r.skip(88, "sub_layer_profile")?;
            }
            if level_present {
                r.skip(8, "sub_layer_level_idc")?;
            }
        }

        Ok(ProfileTierLevel {
            progressive_source_flag,
            interlaced_source_flag,
            general_level_idc,
        })
    }
}

// 7.3.4
fn skip_scaling_list_data<R: BitRead>(r: &mut R) -> Result<()> {
    for size_id in 0..4u32 {
        let step = if size_id == 3 { 3 } else { 1 };
        for _ in (0..6).step_by(step) {
            if !r.read_bool("scaling_list_pred_mode_flag")? {
                r.read_ue("scaling_list_pred_matrix_id_delta")?;
                continue;
            }
            let coef_num = 64.min(1 << (4 + (size_id << 1)));
            if size_id > 1 {
                r.read_se("scaling_list_dc_coef_minus8")?;
            }
            for _ in 0..coef_num {
                r.read_se("scaling_list_delta_coef")?;
            }
        }
    }
    Ok(())
}

/// Picture parameter set, up to the fields the slice header depends on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pps {
    pub id: u32,
    pub sps_id: u32,
    pub dependent_slice_segments_enabled_flag: bool,
    pub output_flag_present_flag: bool,
    pub num_extra_slice_header_bits: u32,
}

impl Pps {
    pub fn parse(nal: &[u8]) -> Result<Pps> {
        let mut r = rbsp(nal);
        let id = r.read_ue("pps_pic_parameter_set_id")?;
        if id > MAX_PPS_ID {
            return Err(ReorderError::Bitstream(format!("pps_pic_parameter_set_id {id} out of range")));
        }
        let sps_id = r.read_ue("pps_seq_parameter_set_id")?;
        if sps_id > MAX_SPS_ID {
            return Err(ReorderError::Bitstream(format!("pps_seq_parameter_set_id {sps_id} out of range")));
        }
        Ok(Pps {
            id,
            sps_id,
            dependent_slice_segments_enabled_flag: r
                .read_bool("dependent_slice_segments_enabled_flag")?,
            output_flag_present_flag: r.read_bool("output_flag_present_flag")?,
            num_extra_slice_header_bits: r.read::<u32>(3, "num_extra_slice_header_bits")?,
        })
    }
}

/// One long-term entry of a slice header, with SPS candidates resolved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LongTermRef {
    pub poc_lsb_lt: u32,
    pub used_by_curr_pic_lt: bool,
    pub delta_poc_msb_present_flag: bool,
    pub delta_poc_msb_cycle_lt: u32,
}

/// Slice segment header fields (7.3.6.1) up to the long-term pictures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SliceHeader {
    pub first_slice_segment_in_pic_flag: bool,
    pub no_output_of_prior_pics_flag: bool,
    pub pps_id: u32,
    pub dependent_slice_segment_flag: bool,
    pub slice_type: u32,
    pub pic_output_flag: bool,
    pub pic_order_cnt_lsb: u32,
    pub short_term_ref_pic_set_sps_flag: bool,
    pub short_term_ref_pic_set_idx: u32,
    /// The set coded in the header when `short_term_ref_pic_set_sps_flag` is
    /// unset.
    pub short_term_ref_pic_set: ShortTermRefPicSet,
    pub num_long_term_sps: u32,
    pub long_term_refs: Vec<LongTermRef>,
}

impl Default for SliceHeader {
    fn default() -> Self {
        SliceHeader {
            first_slice_segment_in_pic_flag: false,
            no_output_of_prior_pics_flag: false,
            pps_id: 0,
            dependent_slice_segment_flag: false,
            slice_type: 0,
            pic_output_flag: true,
            pic_order_cnt_lsb: 0,
            short_term_ref_pic_set_sps_flag: false,
            short_term_ref_pic_set_idx: 0,
            short_term_ref_pic_set: ShortTermRefPicSet::default(),
            num_long_term_sps: 0,
            long_term_refs: Vec::new(),
        }
    }
}

/// A parsed slice segment with the parameter sets it activates.
#[derive(Debug, Clone)]
pub struct Slice {
    pub nal_type: u8,
    pub temporal_id_plus1: u8,
    pub header: SliceHeader,
    pub pps: Arc<Pps>,
    pub sps: Arc<Sps>,
}

impl Slice {
    fn parse(nal: &[u8], nal_type: u8, temporal_id_plus1: u8, sets: &ParameterSets) -> Result<Slice> {
        let mut r = rbsp(nal);
        let mut hdr = SliceHeader {
            first_slice_segment_in_pic_flag: r.read_bool("first_slice_segment_in_pic_flag")?,
            ..SliceHeader::default()
        };
        if is_irap(nal_type) {
            hdr.no_output_of_prior_pics_flag = r.read_bool("no_output_of_prior_pics_flag")?;
        }
        hdr.pps_id = r.read_ue("slice_pic_parameter_set_id")?;
        let pps = sets.pps(hdr.pps_id)?;
        let sps = sets.sps(pps.sps_id)?;

        if !hdr.first_slice_segment_in_pic_flag {
            if pps.dependent_slice_segments_enabled_flag {
                hdr.dependent_slice_segment_flag = r.read_bool("dependent_slice_segment_flag")?;
            }
            r.skip(ceil_log2(sps.pic_size_in_ctbs), "slice_segment_address")?;
        }

        if !hdr.dependent_slice_segment_flag {
            hdr.read_independent(&mut r, nal_type, &sps, &pps)?;
        }

        Ok(Slice {
            nal_type,
            temporal_id_plus1,
            header: hdr,
            pps,
            sps,
        })
    }
}

impl SliceHeader {
    fn read_independent<R: BitRead>(&mut self, r: &mut R, nal_type: u8, sps: &Sps, pps: &Pps) -> Result<()> {
        r.skip(pps.num_extra_slice_header_bits, "slice_reserved_flag")?;
        self.slice_type = r.read_ue("slice_type")?;
        if self.slice_type > 2 {
            return Err(ReorderError::Bitstream(format!("slice_type {} out of range", self.slice_type)));
        }
        if pps.output_flag_present_flag {
            self.pic_output_flag = r.read_bool("pic_output_flag")?;
        }
        if sps.separate_colour_plane_flag {
            r.skip(2, "colour_plane_id")?;
        }
        if is_idr(nal_type) {
            return Ok(());
        }

        self.pic_order_cnt_lsb = r.read::<u32>(sps.log2_max_pic_order_cnt_lsb, "slice_pic_order_cnt_lsb")?;
        self.short_term_ref_pic_set_sps_flag = r.read_bool("short_term_ref_pic_set_sps_flag")?;
        let num_sets = sps.short_term_ref_pic_sets.len();
        if !self.short_term_ref_pic_set_sps_flag {
            self.short_term_ref_pic_set =
                ShortTermRefPicSet::read(r, num_sets, num_sets, &sps.short_term_ref_pic_sets)?;
        } else if num_sets > 1 {
            self.short_term_ref_pic_set_idx =
                r.read::<u32>(ceil_log2(num_sets as u32), "short_term_ref_pic_set_idx")?;
        }

        if sps.long_term_ref_pics_present_flag {
            let num_lt_sps = sps.lt_ref_pic_poc_lsb_sps.len() as u32;
            if num_lt_sps > 0 {
                self.num_long_term_sps = r.read_ue("num_long_term_sps")?;
                if self.num_long_term_sps > num_lt_sps {
                    return Err(ReorderError::Bitstream("num_long_term_sps out of range".into()));
                }
            }
            let num_long_term_pics = r.read_ue("num_long_term_pics")?;
            if self.num_long_term_sps + num_long_term_pics > 32 {
                return Err(ReorderError::Bitstream("too many long-term pictures".into()));
            }
            for i in 0..self.num_long_term_sps + num_long_term_pics {
                let mut lt = LongTermRef::default();
                if i < self.num_long_term_sps {
                    let idx = if num_lt_sps > 1 {
                        r.read::<u32>(ceil_log2(num_lt_sps), "lt_idx_sps")? as usize
                    } else {
                        0
                    };
                    let (Some(&lsb), Some(&used)) = (
                        sps.lt_ref_pic_poc_lsb_sps.get(idx),
                        sps.used_by_curr_pic_lt_sps_flag.get(idx),
                    ) else {
                        return Err(ReorderError::Bitstream("lt_idx_sps out of range".into()));
                    };
                    lt.poc_lsb_lt = lsb;
                    lt.used_by_curr_pic_lt = used;
                } else {
                    lt.poc_lsb_lt = r.read::<u32>(sps.log2_max_pic_order_cnt_lsb, "poc_lsb_lt")?;
                    lt.used_by_curr_pic_lt = r.read_bool("used_by_curr_pic_lt_flag")?;
                }
                lt.delta_poc_msb_present_flag = r.read_bool("delta_poc_msb_present_flag")?;
                if lt.delta_poc_msb_present_flag {
                    lt.delta_poc_msb_cycle_lt = r.read_ue("delta_poc_msb_cycle_lt")?;
                }
                self.long_term_refs.push(lt);
            }
        }
        Ok(())
    }
}

/// Latest SPS and PPS per id.
#[derive(Debug, Default)]
pub struct ParameterSets {
    sps: HashMap<u32, Arc<Sps>>,
    pps: HashMap<u32, Arc<Pps>>,
}

impl ParameterSets {
    pub fn sps(&self, id: u32) -> Result<Arc<Sps>> {
        self.sps.get(&id).cloned().ok_or(ReorderError::MissingParameterSet {
            kind: ParameterSetKind::Sps,
            id,
        })
    }

    pub fn pps(&self, id: u32) -> Result<Arc<Pps>> {
        self.pps.get(&id).cloned().ok_or(ReorderError::MissingParameterSet {
            kind: ParameterSetKind::Pps,
            id,
        })
    }

    pub fn insert_sps(&mut self, sps: Sps) {
        self.sps.insert(sps.id, Arc::new(sps));
    }

    pub fn insert_pps(&mut self, pps: Pps) {
        self.pps.insert(pps.id, Arc::new(pps));
    }
}

#[derive(Debug, Clone)]
pub enum Nal {
    Sps(Sps),
    Pps(Pps),
    Slice(Slice),
    EndOfSequence,
    EndOfBitstream,
    Other(u8),
}

impl Nal {
    pub fn parse(nal: &[u8], sets: &ParameterSets) -> Result<Nal> {
        let (nal_type, temporal_id_plus1) = nal_header(nal)?;
        Ok(match nal_type {
            NAL_SPS => Nal::Sps(Sps::parse(nal)?),
            NAL_PPS => Nal::Pps(Pps::parse(nal)?),
            NAL_TRAIL_N..=NAL_RASL_R | NAL_BLA_W_LP..=NAL_CRA => {
                Nal::Slice(Slice::parse(nal, nal_type, temporal_id_plus1, sets)?)
            }
            NAL_EOS => Nal::EndOfSequence,
            NAL_EOB => Nal::EndOfBitstream,
            other => Nal::Other(other),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nal_type_classes() {
        assert!(is_irap(NAL_CRA));
        assert!(is_irap(NAL_IDR_N_LP));
        assert!(!is_irap(NAL_RASL_R));
        assert!(is_bla(17));
        assert!(!is_sub_layer_ref(NAL_TRAIL_N));
        assert!(!is_sub_layer_ref(NAL_RASL_N));
        assert!(is_sub_layer_ref(1));
        assert!(is_sub_layer_ref(NAL_CRA));
    }

    #[test]
    fn header_fields() {
        // CRA_NUT, layer 0, temporal_id_plus1 1
        assert_eq!(nal_header(&[0x2A, 0x01]).unwrap(), (NAL_CRA, 1));
        assert!(nal_header(&[0x2A, 0x00]).is_err());
        assert!(nal_header(&[0x2A]).is_err());
    }

    #[test]
    fn ceil_log2_values() {
        assert_eq!(ceil_log2(1), 0);
        assert_eq!(ceil_log2(2), 1);
        assert_eq!(ceil_log2(3), 2);
        assert_eq!(ceil_log2(510), 9);
    }

    /// Minimal MSB-first writer for RPS syntax.
    struct Bits {
        bytes: Vec<u8>,
        len: usize,
    }

    impl Bits {
        fn new() -> Self {
            Bits { bytes: Vec::new(), len: 0 }
        }

        fn bit(&mut self, b: bool) {
            if self.len % 8 == 0 {
                self.bytes.push(0);
            }
            if b {
                let last = self.bytes.len() - 1;
                self.bytes[last] |= 0x80 >> (self.len % 8);
            }
            self.len += 1;
        }

        fn ue(&mut self, v: u32) {
            let v = v + 1;
            let bits = u32::BITS - v.leading_zeros();
            for _ in 1..bits {
                self.bit(false);
            }
            for i in (0..bits).rev() {
                self.bit(v >> i & 1 == 1);
            }
        }

        fn finish(mut self) -> Vec<u8> {
            self.bit(true);
            self.bytes
        }
    }

    #[test]
    fn explicit_short_term_rps() {
        let mut w = Bits::new();
        w.ue(2); // num_negative_pics
        w.ue(1); // num_positive_pics
        w.ue(0); // -1
        w.bit(true);
        w.ue(1); // -3
        w.bit(false);
        w.ue(1); // +2
        w.bit(true);
        let data = w.finish();

        let mut r = BitReader::new(ByteReader::without_skip(&data[..]));
        let set = ShortTermRefPicSet::read(&mut r, 0, 1, &[]).unwrap();
        assert_eq!(set.delta_poc_s0, vec![-1, -3]);
        assert_eq!(set.used_by_curr_pic_s0, vec![true, false]);
        assert_eq!(set.delta_poc_s1, vec![2]);
        assert_eq!(set.num_delta_pocs(), 3);
    }

    #[test]
    fn predicted_short_term_rps() {
        // reference set: S0 = [-1], S1 = [1]
        let reference = ShortTermRefPicSet {
            delta_poc_s0: vec![-1],
            used_by_curr_pic_s0: vec![true],
            delta_poc_s1: vec![1],
            used_by_curr_pic_s1: vec![true],
        };

        let mut w = Bits::new();
        w.bit(true); // inter_ref_pic_set_prediction_flag
        w.bit(true); // delta_rps_sign: negative
        w.ue(1); // abs_delta_rps_minus1: deltaRps = -2
        // j = 0 (S0 -1 -> -3), j = 1 (S1 +1 -> -1), j = 2 (deltaRps itself)
        w.bit(true);
        w.bit(true);
        w.bit(false);
        w.bit(true); // use_delta_flag for deltaRps
        let data = w.finish();

        let mut r = BitReader::new(ByteReader::without_skip(&data[..]));
        let set = ShortTermRefPicSet::read(&mut r, 1, 2, &[reference]).unwrap();
        assert_eq!(set.delta_poc_s0, vec![-1, -2, -3]);
        assert_eq!(set.used_by_curr_pic_s0, vec![true, false, true]);
        assert!(set.delta_poc_s1.is_empty());
    }

    #[test]
    fn slice_header_rps_reads_delta_idx() {
        let sets = [
            ShortTermRefPicSet {
                delta_poc_s0: vec![-4],
                used_by_curr_pic_s0: vec![true],
                ..ShortTermRefPicSet::default()
            },
            ShortTermRefPicSet {
                delta_poc_s0: vec![-1],
                used_by_curr_pic_s0: vec![true],
                ..ShortTermRefPicSet::default()
            },
        ];

        let mut w = Bits::new();
        w.bit(true); // inter_ref_pic_set_prediction_flag
        w.ue(1); // delta_idx_minus1: predict from set 0
        w.bit(true); // delta_rps_sign: negative
        w.ue(0); // deltaRps = -1
        w.bit(true); // -4 -> -5
        w.bit(true); // deltaRps itself
        let data = w.finish();

        let mut r = BitReader::new(ByteReader::without_skip(&data[..]));
        let set = ShortTermRefPicSet::read(&mut r, 2, 2, &sets).unwrap();
        assert_eq!(set.delta_poc_s0, vec![-1, -5]);
    }
}
