//! H.264 parameter sets and slice headers, as far as decode-order tracking
//! needs them.
//!
//! Parsing follows ITU-T H.264 sections 7.3.2.1.1 (SPS), 7.3.2.2 (PPS) and
//! 7.3.3 (slice header up to `dec_ref_pic_marking`). Fields past the point of
//! interest are left unread.

use std::collections::HashMap;
use std::sync::Arc;

use h264_reader::rbsp::{BitRead, BitReader, ByteReader};

use crate::error::{ParameterSetKind, ReorderError, Result};

pub const NAL_SLICE: u8 = 1;
pub const NAL_SLICE_DPA: u8 = 2;
pub const NAL_SLICE_DPB: u8 = 3;
pub const NAL_SLICE_DPC: u8 = 4;
pub const NAL_SLICE_IDR: u8 = 5;
pub const NAL_SEI: u8 = 6;
pub const NAL_SPS: u8 = 7;
pub const NAL_PPS: u8 = 8;
pub const NAL_SLICE_EXT: u8 = 20;

const MAX_SPS_ID: u32 = 31;
const MAX_PPS_ID: u32 = 255;

/// `max_num_reorder_frames` / `max_dec_frame_buffering` from the VUI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitstreamRestriction {
    pub max_num_reorder_frames: u32,
    pub max_dec_frame_buffering: u32,
}

/// Sequence parameter set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sps {
    pub id: u32,
    pub profile_idc: u8,
    pub constraint_set3_flag: bool,
    pub level_idc: u8,
    pub chroma_format_idc: u32,
    pub separate_colour_plane_flag: bool,
    pub log2_max_frame_num: u32,
    pub pic_order_cnt_type: u32,
    pub log2_max_pic_order_cnt_lsb: u32,
    pub delta_pic_order_always_zero_flag: bool,
    pub offset_for_non_ref_pic: i32,
    pub offset_for_top_to_bottom_field: i32,
    pub offset_for_ref_frame: Vec<i32>,
    pub num_ref_frames: u32,
    pub gaps_in_frame_num_value_allowed_flag: bool,
    pub frame_mbs_only_flag: bool,
    /// Coded width in luma samples (no cropping applied).
    pub width: u32,
    /// Coded height in luma samples (no cropping applied).
    pub height: u32,
    pub bitstream_restriction: Option<BitstreamRestriction>,
}

impl Sps {
    /// Parses an SPS NAL unit, header byte included.
    pub fn parse(nal: &[u8]) -> Result<Sps> {
        let mut r = BitReader::new(ByteReader::skipping_h264_header(nal));

        let profile_idc: u8 = r.read(8, "profile_idc")?;
        let constraint_flags: u8 = r.read(8, "constraint_flags")?;
        let level_idc: u8 = r.read(8, "level_idc")?;
        let id = r.read_ue("seq_parameter_set_id")?;
        if id > MAX_SPS_ID {
            return Err(ReorderError::Bitstream(format!("seq_parameter_set_id {id} out of range")));
        }

        let mut chroma_format_idc = 1;
        let mut separate_colour_plane_flag = false;
        if matches!(
            profile_idc,
            100 | 110 | 122 | 244 | 44 | 83 | 86 | 118 | 128 | 138 | 139 | 134 | 135
        ) {
            chroma_format_idc = r.read_ue("chroma_format_idc")?;
            if chroma_format_idc > 3 {
                return Err(ReorderError::Bitstream(format!(
                    "chroma_format_idc {chroma_format_idc} out of range"
                )));
            }
            if chroma_format_idc == 3 {
                separate_colour_plane_flag = r.read_bool("separate_colour_plane_flag")?;
            }
            r.read_ue("bit_depth_luma_minus8")?;
            r.read_ue("bit_depth_chroma_minus8")?;
            r.read_bool("qpprime_y_zero_transform_bypass_flag")?;
            if r.read_bool("seq_scaling_matrix_present_flag")? {
                let count = if chroma_format_idc != 3 { 8 } else { 12 };
                for i in 0..count {
                    if r.read_bool("seq_scaling_list_present_flag")? {
                        skip_scaling_list(&mut r, if i < 6 { 16 } else { 64 })?;
                    }
                }
            }
        }

        let log2_max_frame_num_minus4 = r.read_ue("log2_max_frame_num_minus4")?;
        if log2_max_frame_num_minus4 > 12 {
            return Err(ReorderError::Bitstream(format!(
                "log2_max_frame_num_minus4 {log2_max_frame_num_minus4} out of range"
            )));
        }

        let pic_order_cnt_type = r.read_ue("pic_order_cnt_type")?;
        let mut log2_max_pic_order_cnt_lsb = 0;
        let mut delta_pic_order_always_zero_flag = false;
        let mut offset_for_non_ref_pic = 0;
        let mut offset_for_top_to_bottom_field = 0;
        let mut offset_for_ref_frame = Vec::new();
        match pic_order_cnt_type {
            0 => {
                let minus4 = r.read_ue("log2_max_pic_order_cnt_lsb_minus4")?;
                if minus4 > 12 {
                    return Err(ReorderError::Bitstream(format!(
                        "log2_max_pic_order_cnt_lsb_minus4 {minus4} out of range"
                    )));
                }
                log2_max_pic_order_cnt_lsb = minus4 + 4;
            }
            1 => {
                delta_pic_order_always_zero_flag =
                    r.read_bool("delta_pic_order_always_zero_flag")?;
                offset_for_non_ref_pic = r.read_se("offset_for_non_ref_pic")?;
                offset_for_top_to_bottom_field = r.read_se("offset_for_top_to_bottom_field")?;
                let cycle = r.read_ue("num_ref_frames_in_pic_order_cnt_cycle")?;
                if cycle > 255 {
                    return Err(ReorderError::Bitstream(format!(
                        "num_ref_frames_in_pic_order_cnt_cycle {cycle} out of range"
                    )));
                }
                for _ in 0..cycle {
                    offset_for_ref_frame.push(r.read_se("offset_for_ref_frame")?);
                }
            }
            2 => {}
            other => {
                return Err(ReorderError::Bitstream(format!(
                    "pic_order_cnt_type {other} out of range"
                )));
            }
        }

        let num_ref_frames = r.read_ue("max_num_ref_frames")?;
        let gaps_in_frame_num_value_allowed_flag =
            r.read_bool("gaps_in_frame_num_value_allowed_flag")?;
        let pic_width_in_mbs_minus1 = r.read_ue("pic_width_in_mbs_minus1")?;
        let pic_height_in_map_units_minus1 = r.read_ue("pic_height_in_map_units_minus1")?;
        let frame_mbs_only_flag = r.read_bool("frame_mbs_only_flag")?;
        if !frame_mbs_only_flag {
            r.read_bool("mb_adaptive_frame_field_flag")?;
        }
        r.read_bool("direct_8x8_inference_flag")?;
        if r.read_bool("frame_cropping_flag")? {
            r.read_ue("frame_crop_left_offset")?;
            r.read_ue("frame_crop_right_offset")?;
            r.read_ue("frame_crop_top_offset")?;
            r.read_ue("frame_crop_bottom_offset")?;
        }

        let bitstream_restriction = if r.read_bool("vui_parameters_present_flag")? {
            read_vui(&mut r)?
        } else {
            None
        };

        let width = (pic_width_in_mbs_minus1 + 1)
            .checked_mul(16)
            .ok_or(ReorderError::Bitstream("picture width overflows".into()))?;
        let height = (pic_height_in_map_units_minus1 + 1)
            .checked_mul(16 * (2 - u32::from(frame_mbs_only_flag)))
            .ok_or(ReorderError::Bitstream("picture height overflows".into()))?;

        Ok(Sps {
            id,
            profile_idc,
            constraint_set3_flag: constraint_flags & 0x10 != 0,
            level_idc,
            chroma_format_idc,
            separate_colour_plane_flag,
            log2_max_frame_num: log2_max_frame_num_minus4 + 4,
            pic_order_cnt_type,
            log2_max_pic_order_cnt_lsb,
            delta_pic_order_always_zero_flag,
            offset_for_non_ref_pic,
            offset_for_top_to_bottom_field,
            offset_for_ref_frame,
            num_ref_frames,
            gaps_in_frame_num_value_allowed_flag,
            frame_mbs_only_flag,
            width,
            height,
            bitstream_restriction,
        })
    }

    pub fn max_frame_num(&self) -> u32 {
        1 << self.log2_max_frame_num
    }

    pub fn max_pic_order_cnt_lsb(&self) -> i32 {
        1 << self.log2_max_pic_order_cnt_lsb
    }

    /// `ChromaArrayType` (7.4.2.1.1).
    pub fn chroma_array_type(&self) -> u32 {
        if self.separate_colour_plane_flag {
            0
        } else {
            self.chroma_format_idc
        }
    }
}

fn skip_scaling_list<R: BitRead>(r: &mut R, size: usize) -> Result<()> {
    let mut last_scale = 8i32;
    let mut next_scale = 8i32;
    for _ in 0..size {
        if next_scale != 0 {
            let delta_scale = r.read_se("delta_scale")?;
            next_scale = (last_scale + delta_scale + 256) % 256;
        }
        if next_scale != 0 {
            last_scale = next_scale;
        }
    }
    Ok(())
}

// E.1.1, vui_parameters; only the bitstream restriction is kept.
fn read_vui<R: BitRead>(r: &mut R) -> Result<Option<BitstreamRestriction>> {
    if r.read_bool("aspect_ratio_info_present_flag")? {
        let aspect_ratio_idc: u8 = r.read(8, "aspect_ratio_idc")?;
        if aspect_ratio_idc == 255 {
            r.skip(16, "sar_width")?;
            r.skip(16, "sar_height")?;
        }
    }
    if r.read_bool("overscan_info_present_flag")? {
        r.read_bool("overscan_appropriate_flag")?;
    }
    if r.read_bool("video_signal_type_present_flag")? {
        r.skip(3, "video_format")?;
        r.read_bool("video_full_range_flag")?;
        if r.read_bool("colour_description_present_flag")? {
            r.skip(8, "colour_primaries")?;
            r.skip(8, "transfer_characteristics")?;
            r.skip(8, "matrix_coefficients")?;
        }
    }
    if r.read_bool("chroma_loc_info_present_flag")? {
        r.read_ue("chroma_sample_loc_type_top_field")?;
        r.read_ue("chroma_sample_loc_type_bottom_field")?;
    }
    if r.read_bool("timing_info_present_flag")? {
        r.skip(32, "num_units_in_tick")?;
        r.skip(32, "time_scale")?;
        r.read_bool("fixed_frame_rate_flag")?;
    }
    let nal_hrd = r.read_bool("nal_hrd_parameters_present_flag")?;
    if nal_hrd {
        skip_hrd_parameters(r)?;
    }
    let vcl_hrd = r.read_bool("vcl_hrd_parameters_present_flag")?;
    if vcl_hrd {
        skip_hrd_parameters(r)?;
    }
    if nal_hrd || vcl_hrd {
        r.read_bool("low_delay_hrd_flag")?;
    }
    r.read_bool("pic_struct_present_flag")?;
    if !r.read_bool("bitstream_restriction_flag")? {
        return Ok(None);
    }
    r.read_bool("motion_vectors_over_pic_boundaries_flag")?;
    r.read_ue("max_bytes_per_pic_denom")?;
    r.read_ue("max_bits_per_mb_denom")?;
    r.read_ue("log2_max_mv_length_horizontal")?;
    r.read_ue("log2_max_mv_length_vertical")?;
    let max_num_reorder_frames = r.read_ue("max_num_reorder_frames")?;
    let max_dec_frame_buffering = r.read_ue("max_dec_frame_buffering")?;
    Ok(Some(BitstreamRestriction {
        max_num_reorder_frames,
        max_dec_frame_buffering,
    }))
}

fn skip_hrd_parameters<R: BitRead>(r: &mut R) -> Result<()> {
    let cpb_cnt_minus1 = r.read_ue("cpb_cnt_minus1")?;
    if cpb_cnt_minus1 > 31 {
        return Err(ReorderError::Bitstream(format!("cpb_cnt_minus1 {cpb_cnt_minus1} out of range")));
    }
    r.skip(4, "bit_rate_scale")?;
    r.skip(4, "cpb_size_scale")?;
    for _ in 0..=cpb_cnt_minus1 {
        r.read_ue("bit_rate_value_minus1")?;
        r.read_ue("cpb_size_value_minus1")?;
        r.read_bool("cbr_flag")?;
    }
    r.skip(5, "initial_cpb_removal_delay_length_minus1")?;
    r.skip(5, "cpb_removal_delay_length_minus1")?;
    r.skip(5, "dpb_output_delay_length_minus1")?;
    r.skip(5, "time_offset_length")?;
    Ok(())
}

/// Picture parameter set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pps {
    pub id: u32,
    pub sps_id: u32,
    pub bottom_field_pic_order_in_frame_present_flag: bool,
    pub num_ref_idx_l0_default_active_minus1: u32,
    pub num_ref_idx_l1_default_active_minus1: u32,
    pub weighted_pred_flag: bool,
    pub weighted_bipred_idc: u8,
    pub redundant_pic_cnt_present_flag: bool,
}

impl Pps {
    /// Parses a PPS NAL unit. The SPS it names must already be known.
    pub fn parse(nal: &[u8], sets: &ParameterSets) -> Result<Pps> {
        let mut r = BitReader::new(ByteReader::skipping_h264_header(nal));

        let id = r.read_ue("pic_parameter_set_id")?;
        if id > MAX_PPS_ID {
            return Err(ReorderError::Bitstream(format!("pic_parameter_set_id {id} out of range")));
        }
        let sps_id = r.read_ue("seq_parameter_set_id")?;
        sets.sps(sps_id)?;

        r.read_bool("entropy_coding_mode_flag")?;
        let bottom_field_pic_order_in_frame_present_flag =
            r.read_bool("bottom_field_pic_order_in_frame_present_flag")?;
        let num_slice_groups_minus1 = r.read_ue("num_slice_groups_minus1")?;
        if num_slice_groups_minus1 > 7 {
            return Err(ReorderError::Bitstream(format!(
                "num_slice_groups_minus1 {num_slice_groups_minus1} out of range"
            )));
        }
        if num_slice_groups_minus1 > 0 {
            skip_slice_group_map(&mut r, num_slice_groups_minus1)?;
        }
        let num_ref_idx_l0_default_active_minus1 =
            r.read_ue("num_ref_idx_l0_default_active_minus1")?;
        let num_ref_idx_l1_default_active_minus1 =
            r.read_ue("num_ref_idx_l1_default_active_minus1")?;
        if num_ref_idx_l0_default_active_minus1 > 31 || num_ref_idx_l1_default_active_minus1 > 31 {
            return Err(ReorderError::Bitstream("num_ref_idx_default_active out of range".into()));
        }
        let weighted_pred_flag = r.read_bool("weighted_pred_flag")?;
        let weighted_bipred_idc: u8 = r.read(2, "weighted_bipred_idc")?;
        r.read_se("pic_init_qp_minus26")?;
        r.read_se("pic_init_qs_minus26")?;
        r.read_se("chroma_qp_index_offset")?;
        r.read_bool("deblocking_filter_control_present_flag")?;
        r.read_bool("constrained_intra_pred_flag")?;
        let redundant_pic_cnt_present_flag = r.read_bool("redundant_pic_cnt_present_flag")?;

        Ok(Pps {
            id,
            sps_id,
            bottom_field_pic_order_in_frame_present_flag,
            num_ref_idx_l0_default_active_minus1,
            num_ref_idx_l1_default_active_minus1,
            weighted_pred_flag,
            weighted_bipred_idc,
            redundant_pic_cnt_present_flag,
        })
    }
}

fn skip_slice_group_map<R: BitRead>(r: &mut R, num_slice_groups_minus1: u32) -> Result<()> {
    match r.read_ue("slice_group_map_type")? {
        0 => {
            for _ in 0..=num_slice_groups_minus1 {
                r.read_ue("run_length_minus1")?;
            }
        }
        2 => {
            for _ in 0..num_slice_groups_minus1 {
                r.read_ue("top_left")?;
                r.read_ue("bottom_right")?;
            }
        }
        3..=5 => {
            r.read_bool("slice_group_change_direction_flag")?;
            r.read_ue("slice_group_change_rate_minus1")?;
        }
        6 => {
            let pic_size_in_map_units_minus1 = r.read_ue("pic_size_in_map_units_minus1")?;
            let bits = u32::BITS - num_slice_groups_minus1.leading_zeros();
            for _ in 0..=pic_size_in_map_units_minus1 {
                r.skip(bits, "slice_group_id")?;
            }
        }
        _ => {}
    }
    Ok(())
}

/// One `memory_management_control_operation` (7.4.3.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mmco {
    /// 1: unmark a short-term picture.
    ShortTermUnused { difference_of_pic_nums_minus1: u32 },
    /// 2: unmark a long-term picture.
    LongTermUnused { long_term_pic_num: u32 },
    /// 3: turn a short-term picture into a long-term one.
    ShortTermToLongTerm {
        difference_of_pic_nums_minus1: u32,
        long_term_frame_idx: u32,
    },
    /// 4: shrink the long-term index range.
    MaxLongTermFrameIdx { max_long_term_frame_idx_plus1: u32 },
    /// 5: unmark everything.
    AllUnused,
    /// 6: mark the current picture long-term.
    CurrentToLongTerm { long_term_frame_idx: u32 },
}

impl Mmco {
    pub fn operation(&self) -> u32 {
        match self {
            Mmco::ShortTermUnused { .. } => 1,
            Mmco::LongTermUnused { .. } => 2,
            Mmco::ShortTermToLongTerm { .. } => 3,
            Mmco::MaxLongTermFrameIdx { .. } => 4,
            Mmco::AllUnused => 5,
            Mmco::CurrentToLongTerm { .. } => 6,
        }
    }
}

/// `dec_ref_pic_marking` (7.3.3.3).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecRefPicMarking {
    pub no_output_of_prior_pics_flag: bool,
    pub long_term_reference_flag: bool,
    pub adaptive_ref_pic_marking_mode_flag: bool,
    pub operations: Vec<Mmco>,
}

impl DecRefPicMarking {
    fn read<R: BitRead>(r: &mut R, idr: bool) -> Result<Self> {
        let mut marking = DecRefPicMarking::default();
        if idr {
            marking.no_output_of_prior_pics_flag = r.read_bool("no_output_of_prior_pics_flag")?;
            marking.long_term_reference_flag = r.read_bool("long_term_reference_flag")?;
            return Ok(marking);
        }

        marking.adaptive_ref_pic_marking_mode_flag =
            r.read_bool("adaptive_ref_pic_marking_mode_flag")?;
        if !marking.adaptive_ref_pic_marking_mode_flag {
            return Ok(marking);
        }
        loop {
            let op = match r.read_ue("memory_management_control_operation")? {
                0 => break,
                1 => Mmco::ShortTermUnused {
                    difference_of_pic_nums_minus1: r.read_ue("difference_of_pic_nums_minus1")?,
                },
                2 => Mmco::LongTermUnused {
                    long_term_pic_num: r.read_ue("long_term_pic_num")?,
                },
                3 => Mmco::ShortTermToLongTerm {
                    difference_of_pic_nums_minus1: r.read_ue("difference_of_pic_nums_minus1")?,
                    long_term_frame_idx: r.read_ue("long_term_frame_idx")?,
                },
                4 => Mmco::MaxLongTermFrameIdx {
                    max_long_term_frame_idx_plus1: r.read_ue("max_long_term_frame_idx_plus1")?,
                },
                5 => Mmco::AllUnused,
                6 => Mmco::CurrentToLongTerm {
                    long_term_frame_idx: r.read_ue("long_term_frame_idx")?,
                },
                other => {
                    return Err(ReorderError::Bitstream(format!(
                        "memory_management_control_operation {other} out of range"
                    )));
                }
            };
            if marking.operations.len() >= 66 {
                return Err(ReorderError::Bitstream("too many memory management operations".into()));
            }
            marking.operations.push(op);
        }
        Ok(marking)
    }
}

/// Slice header fields up to `dec_ref_pic_marking`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SliceHeader {
    pub first_mb_in_slice: u32,
    pub slice_type: u32,
    pub pps_id: u32,
    pub frame_num: u32,
    pub field_pic_flag: bool,
    pub bottom_field_flag: bool,
    pub idr_pic_id: u32,
    pub pic_order_cnt_lsb: u32,
    pub delta_pic_order_cnt_bottom: i32,
    pub delta_pic_order_cnt: [i32; 2],
    pub dec_ref_pic_marking: DecRefPicMarking,
}

/// A parsed slice with the parameter sets it activates.
#[derive(Debug, Clone)]
pub struct Slice {
    pub nal_type: u8,
    pub nal_ref_idc: u8,
    pub header: SliceHeader,
    pub pps: Arc<Pps>,
    pub sps: Arc<Sps>,
}

impl Slice {
    pub fn is_idr(&self) -> bool {
        self.nal_type == NAL_SLICE_IDR
    }

    fn parse(nal: &[u8], nal_type: u8, nal_ref_idc: u8, sets: &ParameterSets) -> Result<Slice> {
        let mut r = BitReader::new(ByteReader::skipping_h264_header(nal));
        let idr = nal_type == NAL_SLICE_IDR;

        let mut hdr = SliceHeader {
            first_mb_in_slice: r.read_ue("first_mb_in_slice")?,
            slice_type: r.read_ue("slice_type")?,
            pps_id: r.read_ue("pic_parameter_set_id")?,
            ..SliceHeader::default()
        };
        if hdr.slice_type > 9 {
            return Err(ReorderError::Bitstream(format!("slice_type {} out of range", hdr.slice_type)));
        }
        let pps = sets.pps(hdr.pps_id)?;
        let sps = sets.sps(pps.sps_id)?;

        if sps.separate_colour_plane_flag {
            r.skip(2, "colour_plane_id")?;
        }
        hdr.frame_num = r.read::<u32>(sps.log2_max_frame_num, "frame_num")?;
        if !sps.frame_mbs_only_flag {
            hdr.field_pic_flag = r.read_bool("field_pic_flag")?;
            if hdr.field_pic_flag {
                hdr.bottom_field_flag = r.read_bool("bottom_field_flag")?;
            }
        }
        if idr {
            hdr.idr_pic_id = r.read_ue("idr_pic_id")?;
        }
        let bottom_present =
            pps.bottom_field_pic_order_in_frame_present_flag && !hdr.field_pic_flag;
        if sps.pic_order_cnt_type == 0 {
            hdr.pic_order_cnt_lsb = r.read::<u32>(sps.log2_max_pic_order_cnt_lsb, "pic_order_cnt_lsb")?;
            if bottom_present {
                hdr.delta_pic_order_cnt_bottom = r.read_se("delta_pic_order_cnt_bottom")?;
            }
        }
        if sps.pic_order_cnt_type == 1 && !sps.delta_pic_order_always_zero_flag {
            hdr.delta_pic_order_cnt[0] = r.read_se("delta_pic_order_cnt[0]")?;
            if bottom_present {
                hdr.delta_pic_order_cnt[1] = r.read_se("delta_pic_order_cnt[1]")?;
            }
        }
        if pps.redundant_pic_cnt_present_flag {
            r.read_ue("redundant_pic_cnt")?;
        }

        let kind = hdr.slice_type % 5;
        let is_p = kind == 0 || kind == 3;
        let is_b = kind == 1;
        if is_b {
            r.read_bool("direct_spatial_mv_pred_flag")?;
        }
        let mut num_ref_idx_l0_active_minus1 = pps.num_ref_idx_l0_default_active_minus1;
        let mut num_ref_idx_l1_active_minus1 = pps.num_ref_idx_l1_default_active_minus1;
        if is_p || is_b {
            if r.read_bool("num_ref_idx_active_override_flag")? {
                num_ref_idx_l0_active_minus1 = r.read_ue("num_ref_idx_l0_active_minus1")?;
                if is_b {
                    num_ref_idx_l1_active_minus1 = r.read_ue("num_ref_idx_l1_active_minus1")?;
                }
            }
            if num_ref_idx_l0_active_minus1 > 31 || num_ref_idx_l1_active_minus1 > 31 {
                return Err(ReorderError::Bitstream("num_ref_idx_active out of range".into()));
            }
        }

        // ref_pic_list_modification
        if kind != 2 && kind != 4 {
            skip_ref_pic_list_modification(&mut r)?;
        }
        if is_b {
            skip_ref_pic_list_modification(&mut r)?;
        }

        if (pps.weighted_pred_flag && is_p) || (pps.weighted_bipred_idc == 1 && is_b) {
            let chroma = sps.chroma_array_type() != 0;
            r.read_ue("luma_log2_weight_denom")?;
            if chroma {
                r.read_ue("chroma_log2_weight_denom")?;
            }
            skip_pred_weights(&mut r, num_ref_idx_l0_active_minus1, chroma)?;
            if is_b {
                skip_pred_weights(&mut r, num_ref_idx_l1_active_minus1, chroma)?;
            }
        }

        if nal_ref_idc != 0 {
            hdr.dec_ref_pic_marking = DecRefPicMarking::read(&mut r, idr)?;
        }

        Ok(Slice {
            nal_type,
            nal_ref_idc,
            header: hdr,
            pps,
            sps,
        })
    }
}

fn skip_ref_pic_list_modification<R: BitRead>(r: &mut R) -> Result<()> {
    if !r.read_bool("ref_pic_list_modification_flag")? {
        return Ok(());
    }
    for _ in 0..=32 {
        match r.read_ue("modification_of_pic_nums_idc")? {
            0 | 1 => {
                r.read_ue("abs_diff_pic_num_minus1")?;
            }
            2 => {
                r.read_ue("long_term_pic_num")?;
            }
            3 => return Ok(()),
            other => {
                return Err(ReorderError::Bitstream(format!(
                    "modification_of_pic_nums_idc {other} out of range"
                )));
            }
        }
    }
    Err(ReorderError::Bitstream("unterminated ref_pic_list_modification".into()))
}

fn skip_pred_weights<R: BitRead>(r: &mut R, num_active_minus1: u32, chroma: bool) -> Result<()> {
    for _ in 0..=num_active_minus1 {
        if r.read_bool("luma_weight_flag")? {
            r.read_se("luma_weight")?;
            r.read_se("luma_offset")?;
        }
        if chroma && r.read_bool("chroma_weight_flag")? {
            for _ in 0..2 {
                r.read_se("chroma_weight")?;
                r.read_se("chroma_offset")?;
            }
        }
    }
    Ok(())
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

/// A NAL unit, by type, with the payload this engine consumes.
#[derive(Debug, Clone)]
pub enum Nal {
    Sps(Sps),
    Pps(Pps),
    Slice(Slice),
    /// Slice data partitions B/C and MVC extension slices carry no header
    /// this engine needs.
    SliceData(u8),
    Other(u8),
}

/// `nal_ref_idc` and `nal_unit_type` from the header byte.
pub fn nal_header(nal: &[u8]) -> Result<(u8, u8)> {
    let &b = nal
        .first()
        .ok_or(ReorderError::Bitstream("empty NAL unit".into()))?;
    if b & 0x80 != 0 {
        return Err(ReorderError::Bitstream("forbidden_zero_bit set".into()));
    }
    Ok(((b >> 5) & 0x3, b & 0x1f))
}

impl Nal {
    pub fn parse(nal: &[u8], sets: &ParameterSets) -> Result<Nal> {
        let (nal_ref_idc, nal_type) = nal_header(nal)?;
        Ok(match nal_type {
            NAL_SPS => Nal::Sps(Sps::parse(nal)?),
            NAL_PPS => Nal::Pps(Pps::parse(nal, sets)?),
            NAL_SLICE | NAL_SLICE_DPA | NAL_SLICE_IDR => {
                Nal::Slice(Slice::parse(nal, nal_type, nal_ref_idc, sets)?)
            }
            NAL_SLICE_DPB | NAL_SLICE_DPC | NAL_SLICE_EXT => Nal::SliceData(nal_type),
            other => Nal::Other(other),
        })
    }
}
