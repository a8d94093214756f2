use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use super::dpb::{Dpb, MAX_DPB_FRAMES};
use super::params::{
    nal_header, Nal, ParameterSets, SliceHeader, Slice, Sps, NAL_PPS, NAL_SPS,
};
use super::picture::{Field, PicId, Picture, Reference};
use crate::error::{ReorderError, Result};
use crate::frame::{Frame, FrameQueue};
use crate::scanner::{self, Framing};
use crate::sei::{self, SeiMessage};
use crate::{frames_to_duration, Caps, Codec, Reorder, StreamFormat};

const STALE: ReorderError = ReorderError::Picture("stale picture reference");

/// `MaxDpbMbs` per level (Table A-1). Level 1b is signalled as 9.
fn level_to_max_dpb_mbs(level_idc: u8) -> Option<u32> {
    Some(match level_idc {
        9 | 10 => 396,
        11 => 900,
        12 | 13 | 20 => 2376,
        21 => 4752,
        22 | 30 => 8100,
        31 => 18000,
        32 => 20480,
        40 | 41 => 32768,
        42 => 34816,
        50 => 110400,
        51 | 52 => 184320,
        60..=62 => 696320,
        _ => return None,
    })
}

fn max_num_reorder_frames(sps: &Sps, max_dpb_size: u32) -> u32 {
    if let Some(restriction) = sps.bitstream_restriction {
        if restriction.max_num_reorder_frames > max_dpb_size {
            tracing::warn!(
                max_num_reorder_frames = restriction.max_num_reorder_frames,
                max_dpb_size,
                "max_num_reorder_frames larger than the DPB"
            );
            return max_dpb_size;
        }
        return restriction.max_num_reorder_frames;
    }
    if sps.constraint_set3_flag && matches!(sps.profile_idc, 44 | 86 | 100 | 110 | 122 | 244) {
        return 0;
    }
    // baseline and scalable baseline carry I/P pictures only
    if matches!(sps.profile_idc, 66 | 83) {
        return 0;
    }
    max_dpb_size
}

fn slice_field(header: &SliceHeader) -> Field {
    match (header.field_pic_flag, header.bottom_field_flag) {
        (false, _) => Field::Frame,
        (true, false) => Field::Top,
        (true, true) => Field::Bottom,
    }
}

/// H.264 reorder engine.
pub struct H264Reorder {
    need_reorder: bool,
    framing: Framing,
    framerate: (u32, u32),
    width: u32,
    height: u32,

    params: ParameterSets,
    active_sps: Option<Arc<Sps>>,
    dpb: Dpb,
    current_picture: Option<PicId>,
    current_frame: Option<u32>,
    last_field: Option<PicId>,

    max_frame_num: i32,
    prev_frame_num: i32,
    prev_frame_num_offset: i32,
    prev_has_memmgmnt5: bool,
    prev_ref_frame_num: i32,
    prev_ref_has_memmgmnt5: bool,
    prev_ref_top_field_order_cnt: i32,
    prev_ref_pic_order_cnt_msb: i32,
    prev_ref_pic_order_cnt_lsb: i32,
    prev_ref_field: Field,

    frames: FrameQueue,
}

impl H264Reorder {
    pub fn new(need_reorder: bool) -> Self {
        H264Reorder {
            need_reorder,
            framing: Framing::AnnexB,
            framerate: Caps::default().framerate_or_default(),
            width: 0,
            height: 0,
            params: ParameterSets::default(),
            active_sps: None,
            dpb: Dpb::new(),
            current_picture: None,
            current_frame: None,
            last_field: None,
            max_frame_num: 0,
            prev_frame_num: 0,
            prev_frame_num_offset: 0,
            prev_has_memmgmnt5: false,
            prev_ref_frame_num: 0,
            prev_ref_has_memmgmnt5: false,
            prev_ref_top_field_order_cnt: 0,
            prev_ref_pic_order_cnt_msb: 0,
            prev_ref_pic_order_cnt_lsb: 0,
            prev_ref_field: Field::Frame,
            frames: FrameQueue::new(),
        }
    }

    /// The decoded picture buffer, for inspection.
    pub fn dpb(&self) -> &Dpb {
        &self.dpb
    }

    fn pic(&self, id: PicId) -> Result<&Picture> {
        self.dpb.pic(id).ok_or(STALE)
    }

    fn process_sps(&mut self, sps: &Sps) {
        let interlaced = !sps.frame_mbs_only_flag;

        // A.3.1/A.3.2: level_idc 11 with constraint_set3 means level 1b
        let mut level = sps.level_idc;
        if level == 11 && matches!(sps.profile_idc, 66 | 77) && sps.constraint_set3_flag {
            level = 9;
        }

        let mut max_dpb_frames = MAX_DPB_FRAMES;
        if let Some(max_dpb_mbs) = level_to_max_dpb_mbs(level) {
            let frame_mbs = (u64::from(sps.width / 16) * u64::from(sps.height / 16)).max(1);
            let frames = u64::from(max_dpb_mbs) / frame_mbs;
            max_dpb_frames = frames.min(u64::from(MAX_DPB_FRAMES)) as u32;
        }
        if let Some(restriction) = sps.bitstream_restriction {
            max_dpb_frames = restriction.max_dec_frame_buffering.max(1);
        }

        let mut max_dpb_size = max_dpb_frames.max(sps.num_ref_frames);
        if max_dpb_size > MAX_DPB_FRAMES {
            tracing::warn!(max_dpb_size, "calculated DPB size too large");
            max_dpb_size = MAX_DPB_FRAMES;
        }
        let max_reorder = max_num_reorder_frames(sps, max_dpb_size);

        if self.width != sps.width
            || self.height != sps.height
            || self.dpb.max_num_frames() != max_dpb_size
            || self.dpb.interlaced() != interlaced
            || self.dpb.max_num_reorder_frames() != max_reorder
        {
            tracing::debug!(
                old_width = self.width,
                old_height = self.height,
                width = sps.width,
                height = sps.height,
                old_dpb_size = self.dpb.max_num_frames(),
                dpb_size = max_dpb_size,
                interlaced,
                max_reorder,
                "SPS updated"
            );

            self.drain_pictures();

            self.width = sps.width;
            self.height = sps.height;
            self.dpb.set_max_num_frames(max_dpb_size);
            self.dpb.set_interlaced(interlaced);
            self.dpb.set_max_num_reorder_frames(max_reorder);
        }
    }

    fn parse_codec_data(&mut self, data: &[u8]) -> Result<()> {
        let config = scanner::parse_avcc(data)?;
        if let Framing::LengthPrefixed(_) = self.framing {
            self.framing = Framing::LengthPrefixed(config.length_size);
        }
        for nal in &config.nal_units {
            let (_, nal_type) = nal_header(nal)?;
            match nal_type {
                NAL_SPS => {
                    let sps = Sps::parse(nal)?;
                    self.process_sps(&sps);
                    self.params.insert_sps(sps);
                }
                NAL_PPS => {
                    let pps = super::params::Pps::parse(nal, &self.params)?;
                    self.params.insert_pps(pps);
                }
                other => tracing::debug!(nal_type = other, "ignoring NAL in codec data"),
            }
        }
        Ok(())
    }

    fn decode_access_unit(&mut self, au: &[u8]) -> Result<()> {
        for unit in scanner::split(au, self.framing)? {
            self.decode_nal(unit.data)?;
        }
        Ok(())
    }

    fn decode_nal(&mut self, data: &[u8]) -> Result<()> {
        let (_, nal_type) = nal_header(data)?;
        tracing::trace!(nal_type, size = data.len(), "parsed NAL unit");

        match Nal::parse(data, &self.params) {
            Ok(Nal::Sps(sps)) => {
                self.process_sps(&sps);
                self.params.insert_sps(sps);
            }
            Ok(Nal::Pps(pps)) => self.params.insert_pps(pps),
            Ok(Nal::Slice(slice)) => self.parse_slice(&slice)?,
            Ok(Nal::SliceData(t)) => tracing::trace!(nal_type = t, "slice data without header"),
            Ok(Nal::Other(_)) => {}
            Err(e) if matches!(nal_type, NAL_SPS | NAL_PPS) => {
                tracing::warn!(nal_type, error = %e, "failed to parse parameter set");
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }

    fn parse_slice(&mut self, slice: &Slice) -> Result<()> {
        self.active_sps = Some(slice.sps.clone());

        // An upstream that packs both fields of a frame into one buffer shows
        // up as a field boundary inside the access unit.
        if self.dpb.interlaced() {
            if let Some(current) = self.current_picture {
                let p = self.pic(current)?;
                if !p.is_frame() && !p.second_field && slice_field(&slice.header) != p.field {
                    tracing::trace!("new field picture, finishing the first field");
                    self.current_picture = None;
                    self.finish_picture(current);
                }
            }
        }

        if self.current_picture.is_none() {
            let first_field = self.find_first_field_picture(slice)?;
            let mut picture = Picture {
                system_frame_number: self.current_frame,
                ..Picture::default()
            };
            if let Some(first) = first_field {
                picture.other_field = Some(first);
                picture.second_field = true;
            }
            let id = self.dpb.alloc(picture);
            self.current_picture = Some(id);
            self.start_current_picture(id, slice)?;
        }
        Ok(())
    }

    fn find_first_field_picture(&mut self, slice: &Slice) -> Result<Option<PicId>> {
        let mut prev_field = None;
        let mut in_dpb = false;
        if self.dpb.interlaced() {
            if let Some(last) = self.last_field {
                prev_field = Some(last);
            } else if let Some(&prev) = self.dpb.pictures().last() {
                let p = self.pic(prev)?;
                if !p.is_frame() && p.other_field.is_none() {
                    prev_field = Some(prev);
                    in_dpb = true;
                }
            }
        }

        let Some(prev_id) = prev_field else {
            return Ok(None);
        };
        let prev = self.pic(prev_id)?;
        let hdr = &slice.header;
        let complete = if !hdr.field_pic_flag {
            tracing::warn!(poc = prev.pic_order_cnt, "previous field picture is not complete");
            false
        } else if prev.frame_num != hdr.frame_num as i32 {
            tracing::warn!(poc = prev.pic_order_cnt, "previous field picture is not complete");
            false
        } else if slice_field(hdr) == prev.field {
            tracing::warn!(field = ?prev.field, "current and previous picture have the same parity");
            false
        } else {
            true
        };

        if complete {
            return Ok(Some(prev_id));
        }
        if !in_dpb {
            self.last_field = None;
        }
        Err(ReorderError::Picture("unpaired field picture"))
    }

    fn start_current_picture(&mut self, id: PicId, slice: &Slice) -> Result<()> {
        let sps = self.active_sps.clone().ok_or(ReorderError::NoActiveSps)?;
        self.max_frame_num = sps.max_frame_num() as i32;
        let frame_num = slice.header.frame_num as i32;
        if slice.is_idr() {
            self.prev_ref_frame_num = 0;
        }

        self.handle_frame_num_gap(frame_num)?;
        self.fill_picture_from_slice(id, slice)?;
        self.calculate_poc(id)?;

        // no_output_of_prior_pics_flag is ignored; nothing is decoded here
        if self.pic(id)?.idr {
            self.drain_pictures();
        }

        self.update_pic_nums(id, frame_num);
        Ok(())
    }

    fn fill_picture_from_slice(&mut self, id: PicId, slice: &Slice) -> Result<()> {
        let hdr = &slice.header;
        let p = self.dpb.pic_mut(id).ok_or(STALE)?;

        p.idr = slice.is_idr();
        p.dec_ref_pic_marking = hdr.dec_ref_pic_marking.clone();
        p.field_pic_flag = hdr.field_pic_flag;
        if p.idr {
            p.idr_pic_id = hdr.idr_pic_id;
        }
        p.field = slice_field(hdr);
        p.nal_ref_idc = slice.nal_ref_idc;
        if slice.nal_ref_idc != 0 {
            p.reference = Reference::ShortTerm;
            p.ref_pic = true;
        }

        p.frame_num = hdr.frame_num as i32;
        // 7.4.3
        p.pic_num = if hdr.field_pic_flag {
            2 * p.frame_num + 1
        } else {
            p.frame_num
        };

        p.pic_order_cnt_type = slice.sps.pic_order_cnt_type;
        match p.pic_order_cnt_type {
            0 => {
                p.pic_order_cnt_lsb = hdr.pic_order_cnt_lsb as i32;
                p.delta_pic_order_cnt_bottom = hdr.delta_pic_order_cnt_bottom;
            }
            1 => {
                p.delta_pic_order_cnt0 = hdr.delta_pic_order_cnt[0];
                p.delta_pic_order_cnt1 = hdr.delta_pic_order_cnt[1];
            }
            _ => {}
        }
        Ok(())
    }

    /// Picture order count, 8.2.1.
    fn calculate_poc(&mut self, id: PicId) -> Result<()> {
        let sps = self.active_sps.clone().ok_or(ReorderError::NoActiveSps)?;
        let p = self.dpb.pic_mut(id).ok_or(STALE)?;

        match p.pic_order_cnt_type {
            0 => {
                // 8.2.1.1
                let (prev_msb, prev_lsb) = if p.idr {
                    (0, 0)
                } else if self.prev_ref_has_memmgmnt5 {
                    if self.prev_ref_field != Field::Bottom {
                        (0, self.prev_ref_top_field_order_cnt)
                    } else {
                        (0, 0)
                    }
                } else {
                    (self.prev_ref_pic_order_cnt_msb, self.prev_ref_pic_order_cnt_lsb)
                };

                let max_lsb = sps.max_pic_order_cnt_lsb();
                let lsb = p.pic_order_cnt_lsb;
                p.pic_order_cnt_msb = if lsb < prev_lsb && prev_lsb - lsb >= max_lsb / 2 {
                    prev_msb + max_lsb
                } else if lsb > prev_lsb && lsb - prev_lsb > max_lsb / 2 {
                    prev_msb - max_lsb
                } else {
                    prev_msb
                };

                match p.field {
                    Field::Frame => {
                        p.top_field_order_cnt = p.pic_order_cnt_msb + lsb;
                        p.bottom_field_order_cnt =
                            p.top_field_order_cnt + p.delta_pic_order_cnt_bottom;
                    }
                    Field::Top => p.top_field_order_cnt = p.pic_order_cnt_msb + lsb,
                    Field::Bottom => p.bottom_field_order_cnt = p.pic_order_cnt_msb + lsb,
                }
            }
            1 => {
                // 8.2.1.2
                if self.prev_has_memmgmnt5 {
                    self.prev_frame_num_offset = 0;
                }
                p.frame_num_offset = if p.idr {
                    0
                } else if self.prev_frame_num > p.frame_num {
                    self.prev_frame_num_offset + self.max_frame_num
                } else {
                    self.prev_frame_num_offset
                };

                let cycle = sps.offset_for_ref_frame.len() as i32;
                let mut abs_frame_num = if cycle != 0 {
                    p.frame_num_offset + p.frame_num
                } else {
                    0
                };
                if p.nal_ref_idc == 0 && abs_frame_num > 0 {
                    abs_frame_num -= 1;
                }

                let mut expected = 0i32;
                if abs_frame_num > 0 {
                    let cycle_cnt = (abs_frame_num - 1) / cycle;
                    let in_cycle = ((abs_frame_num - 1) % cycle) as usize;
                    let delta_per_cycle = sps
                        .offset_for_ref_frame
                        .iter()
                        .fold(0i32, |acc, &o| acc.wrapping_add(o));
                    expected = cycle_cnt.wrapping_mul(delta_per_cycle);
                    for &offset in &sps.offset_for_ref_frame[..=in_cycle] {
                        expected = expected.wrapping_add(offset);
                    }
                }
                if p.nal_ref_idc == 0 {
                    expected = expected.wrapping_add(sps.offset_for_non_ref_pic);
                }

                match p.field {
                    Field::Frame => {
                        p.top_field_order_cnt = expected + p.delta_pic_order_cnt0;
                        p.bottom_field_order_cnt = p.top_field_order_cnt
                            + sps.offset_for_top_to_bottom_field
                            + p.delta_pic_order_cnt1;
                    }
                    Field::Top => p.top_field_order_cnt = expected + p.delta_pic_order_cnt0,
                    Field::Bottom => {
                        p.bottom_field_order_cnt =
                            expected + sps.offset_for_top_to_bottom_field + p.delta_pic_order_cnt0;
                    }
                }
            }
            2 => {
                // 8.2.1.3
                if self.prev_has_memmgmnt5 {
                    self.prev_frame_num_offset = 0;
                }
                p.frame_num_offset = if p.idr {
                    0
                } else if self.prev_frame_num > p.frame_num {
                    self.prev_frame_num_offset + self.max_frame_num
                } else {
                    self.prev_frame_num_offset
                };

                let temp = if p.idr {
                    0
                } else if p.nal_ref_idc == 0 {
                    2 * (p.frame_num_offset + p.frame_num) - 1
                } else {
                    2 * (p.frame_num_offset + p.frame_num)
                };

                match p.field {
                    Field::Frame => {
                        p.top_field_order_cnt = temp;
                        p.bottom_field_order_cnt = temp;
                    }
                    Field::Top => p.top_field_order_cnt = temp,
                    Field::Bottom => p.bottom_field_order_cnt = temp,
                }
            }
            other => {
                return Err(ReorderError::Bitstream(format!("pic_order_cnt_type {other}")));
            }
        }

        p.pic_order_cnt = match p.field {
            Field::Frame => p.top_field_order_cnt.min(p.bottom_field_order_cnt),
            Field::Top => p.top_field_order_cnt,
            Field::Bottom => p.bottom_field_order_cnt,
        };
        Ok(())
    }

    /// FrameNumWrap, PicNum and LongTermPicNum relative to `current`
    /// (8.2.4.1).
    fn update_pic_nums(&mut self, current: PicId, frame_num: i32) {
        let Some(current_field) = self.dpb.pic(current).map(|p| p.field) else {
            return;
        };
        let max_frame_num = self.max_frame_num;
        let ids = self.dpb.pictures().to_vec();
        for id in ids {
            let Some(p) = self.dpb.pic_mut(id) else {
                continue;
            };
            if !p.is_ref() {
                continue;
            }
            if p.is_long_term_ref() {
                p.long_term_pic_num = if current_field == Field::Frame {
                    p.long_term_frame_idx
                } else if current_field == p.field {
                    2 * p.long_term_frame_idx + 1
                } else {
                    2 * p.long_term_frame_idx
                };
            } else {
                p.frame_num_wrap = if p.frame_num > frame_num {
                    p.frame_num - max_frame_num
                } else {
                    p.frame_num
                };
                p.pic_num = if current_field == Field::Frame {
                    p.frame_num_wrap
                } else if current_field == p.field {
                    2 * p.frame_num_wrap + 1
                } else {
                    2 * p.frame_num_wrap
                };
            }
        }
    }

    /// 8.2.5.3
    fn sliding_window_picture_marking(&mut self, id: PicId) -> Result<()> {
        if self.pic(id)?.second_field {
            return Ok(());
        }
        let sps = self.active_sps.as_ref().ok_or(ReorderError::NoActiveSps)?;
        let max_num_ref_frames = sps.num_ref_frames.max(1);

        let mut num_ref_frames = self.dpb.num_ref_frames();
        while num_ref_frames >= max_num_ref_frames {
            if num_ref_frames > max_num_ref_frames {
                tracing::warn!(num_ref_frames, max_num_ref_frames, "too many reference frames");
            }
            let Some(to_unmark) = self.dpb.lowest_frame_num_short_ref() else {
                tracing::warn!("no short-term reference picture to unmark");
                return Err(ReorderError::Picture("sliding window found no short-term reference"));
            };
            if let Some(p) = self.dpb.pic(to_unmark) {
                tracing::trace!(frame_num = p.frame_num, poc = p.pic_order_cnt, "unmarking reference");
            }
            self.dpb.set_reference(to_unmark, Reference::None, true);
            num_ref_frames -= 1;
        }
        Ok(())
    }

    /// 8.2.5.1
    fn reference_picture_marking(&mut self, id: PicId) -> Result<()> {
        let p = self.pic(id)?;
        let marking = p.dec_ref_pic_marking.clone();

        if p.idr {
            self.dpb.mark_all_non_ref();
            if marking.long_term_reference_flag {
                self.dpb.set_reference(id, Reference::LongTerm, false);
                if let Some(p) = self.dpb.pic_mut(id) {
                    p.long_term_frame_idx = 0;
                }
            } else {
                self.dpb.set_reference(id, Reference::ShortTerm, false);
            }
            return Ok(());
        }

        if marking.adaptive_ref_pic_marking_mode_flag {
            if p.nonexisting {
                tracing::warn!(frame_num = p.frame_num, "memory management on non-existing picture");
            }
            for op in &marking.operations {
                tracing::trace!(operation = op.operation(), "memory management operation");
                if !self.dpb.perform_mmco(op, id) {
                    tracing::warn!(operation = op.operation(), "memory management operation failed");
                }
            }
            return Ok(());
        }

        self.sliding_window_picture_marking(id)
    }

    fn finish_picture(&mut self, id: PicId) {
        if self.dpb.pic(id).is_some_and(Picture::is_ref) {
            if let Err(e) = self.reference_picture_marking(id) {
                tracing::warn!(error = %e, "reference picture marking failed");
            }
            if let Some(p) = self.dpb.pic_mut(id) {
                if p.mem_mgmt_5 {
                    // 8.2.1: after mmco 5 the picture counts as frame_num 0
                    // with its POC rebased to 0
                    let temp = p.pic_order_cnt;
                    match p.field {
                        Field::Frame => {
                            p.top_field_order_cnt -= temp;
                            p.bottom_field_order_cnt -= temp;
                        }
                        Field::Top => p.top_field_order_cnt -= temp,
                        Field::Bottom => p.bottom_field_order_cnt -= temp,
                    }
                    p.pic_order_cnt = 0;
                    p.frame_num = 0;
                }
            }
            if let Some(p) = self.dpb.pic(id) {
                self.prev_ref_has_memmgmnt5 = p.mem_mgmt_5;
                self.prev_ref_top_field_order_cnt = p.top_field_order_cnt;
                self.prev_ref_pic_order_cnt_msb = p.pic_order_cnt_msb;
                self.prev_ref_pic_order_cnt_lsb = p.pic_order_cnt_lsb;
                self.prev_ref_field = p.field;
                self.prev_ref_frame_num = p.frame_num;
            }
        }

        let Some(p) = self.dpb.pic(id) else {
            return;
        };
        self.prev_frame_num = p.frame_num;
        self.prev_has_memmgmnt5 = p.mem_mgmt_5;
        self.prev_frame_num_offset = p.frame_num_offset;
        let mem_mgmt_5 = p.mem_mgmt_5;

        self.dpb.delete_unused();

        // C.4.4
        if mem_mgmt_5 {
            tracing::trace!("memory management operation 5, draining");
            self.drain_pictures();
        }

        self.bump_dpb(id);

        let Some(p) = self.dpb.pic(id) else {
            return;
        };
        let (frame_num, poc) = (p.frame_num, p.pic_order_cnt);
        let pairs_with_ref = p.second_field
            && p
                .other_field
                .and_then(|o| self.dpb.pic(o))
                .is_some_and(Picture::is_ref);
        let split = self.dpb.interlaced() && p.is_frame();

        // C.4.5.1, C.4.5.2
        if pairs_with_ref || p.is_ref() || self.dpb.has_empty_frame_buffer() {
            if split {
                // reference fields need their own pic nums if the next
                // picture is a field
                let other = self.split_frame(id);
                self.add_to_dpb(id);
                match other {
                    Some(other) => self.add_to_dpb(other),
                    None => tracing::warn!("could not split frame into a field pair"),
                }
            } else {
                self.add_to_dpb(id);
            }
        } else {
            self.output_picture_directly(id);
        }

        tracing::trace!(frame_num, poc, dpb_size = self.dpb.len(), "finished picture");
    }

    fn output_picture_directly(&mut self, id: PicId) {
        let Some(p) = self.dpb.pic(id) else {
            return;
        };

        let out = if p.is_frame() {
            Some(id)
        } else if let Some(last) = self.last_field {
            if p.second_field && p.other_field == Some(last) {
                self.last_field = None;
                if let Some(first) = self.dpb.pic_mut(last) {
                    first.other_field = Some(id);
                }
                Some(last)
            } else {
                tracing::warn!(poc = p.pic_order_cnt, "last field is not the pair of this field");
                self.last_field = None;
                None
            }
        } else if p.second_field {
            tracing::warn!(poc = p.pic_order_cnt, "second field without a first field");
            None
        } else {
            self.last_field = Some(id);
            None
        };

        if let Some(out) = out {
            self.output_picture(out);
        }
    }

    fn output_picture(&mut self, id: PicId) {
        let Some(p) = self.dpb.pic(id) else {
            return;
        };
        let frame_number = p.system_frame_number;
        let other = p.other_field.and_then(|o| self.dpb.pic(o));

        if let Some(n) = frame_number {
            self.frames.set_output_buffer(n);
        }
        if let Some(o) = other {
            if !o.nonexisting && o.system_frame_number != frame_number {
                if let Some(n) = o.system_frame_number {
                    tracing::trace!(frame = n, "second field in a separate frame");
                    self.frames.set_output_buffer(n);
                }
            }
        }

        self.frames.promote();
    }

    fn bump_dpb(&mut self, current: PicId) {
        while self.dpb.needs_bump(current) {
            let Some(to_output) = self.dpb.bump(false) else {
                tracing::warn!("bumping is needed but no picture to output");
                break;
            };
            self.output_picture(to_output);
        }
    }

    fn split_frame(&mut self, id: PicId) -> Option<PicId> {
        let p = self.dpb.pic_mut(id)?;
        let (top, bottom) = (p.top_field_order_cnt, p.bottom_field_order_cnt);
        tracing::trace!(poc = p.pic_order_cnt, frame_num = p.frame_num, "splitting frame");

        let mut other = Picture {
            other_field: Some(id),
            second_field: true,
            top_field_order_cnt: top,
            bottom_field_order_cnt: bottom,
            frame_num: p.frame_num,
            reference: p.reference,
            ref_pic: p.ref_pic,
            nonexisting: p.nonexisting,
            system_frame_number: p.system_frame_number,
            field_pic_flag: p.field_pic_flag,
            ..Picture::default()
        };
        // TODO: use picture timing SEI to decide field order when the POCs tie
        if top < bottom {
            p.field = Field::Top;
            p.pic_order_cnt = top;
            other.field = Field::Bottom;
            other.pic_order_cnt = bottom;
        } else {
            p.field = Field::Bottom;
            p.pic_order_cnt = bottom;
            other.field = Field::Top;
            other.pic_order_cnt = top;
        }
        Some(self.dpb.alloc(other))
    }

    fn add_to_dpb(&mut self, id: PicId) {
        if !self.dpb.interlaced() {
            self.dpb.add(id);
            return;
        }

        // a non-reference first field waits in last_field; it enters the
        // DPB together with its second field
        if let Some(last) = self.last_field {
            if self.dpb.pic(id).is_some_and(|p| p.other_field == Some(last)) {
                self.dpb.add(last);
                self.last_field = None;
            }
        }
        self.dpb.add(id);
    }

    fn handle_frame_num_gap(&mut self, frame_num: i32) -> Result<()> {
        let sps = self.active_sps.clone().ok_or(ReorderError::NoActiveSps)?;

        if self.prev_ref_frame_num == frame_num {
            return Ok(());
        }
        if (self.prev_ref_frame_num + 1) % self.max_frame_num == frame_num {
            return Ok(());
        }
        if self.dpb.is_empty() {
            return Ok(());
        }
        if !sps.gaps_in_frame_num_value_allowed_flag {
            // most likely dropped frames upstream; keep going
            tracing::warn!(frame_num, prev_ref_frame_num = self.prev_ref_frame_num, "unexpected frame_num");
            return Ok(());
        }

        tracing::debug!(
            prev_ref_frame_num = self.prev_ref_frame_num,
            frame_num,
            max_frame_num = self.max_frame_num,
            "handling frame_num gap"
        );

        // 7.4.3, 8.2.5.2
        let mut unused = (self.prev_ref_frame_num + 1) % self.max_frame_num;
        while unused != frame_num {
            let id = self.dpb.alloc(Picture::nonexisting(unused));
            self.calculate_poc(id)?;
            self.update_pic_nums(id, unused);
            self.sliding_window_picture_marking(id)?;
            self.dpb.delete_unused();
            self.bump_dpb(id);

            if self.dpb.interlaced() {
                let other = self.split_frame(id);
                self.add_to_dpb(id);
                if let Some(other) = other {
                    self.add_to_dpb(other);
                }
            } else {
                self.add_to_dpb(id);
            }

            unused = (unused + 1) % self.max_frame_num;
        }
        Ok(())
    }

    /// Bumps everything out of the DPB and flushes all queued frames except
    /// the one being decoded.
    fn drain_pictures(&mut self) {
        while let Some(id) = self.dpb.bump(true) {
            self.output_picture(id);
        }
        self.last_field = None;
        self.dpb.clear();
        self.frames.flush(self.current_frame);
    }

    fn collect(&mut self) {
        self.dpb.collect(&[self.last_field, self.current_picture]);
    }
}

impl Reorder for H264Reorder {
    fn set_caps(&mut self, caps: &Caps) -> Result<Duration> {
        tracing::debug!(format = ?caps.stream_format, framerate = ?caps.framerate, "set caps");

        self.framing = match caps.stream_format {
            StreamFormat::ByteStream => Framing::AnnexB,
            StreamFormat::Packetized => Framing::LengthPrefixed(4),
        };
        self.framerate = caps.framerate_or_default();

        if let Some(data) = &caps.codec_data {
            let result = self.parse_codec_data(data);
            self.collect();
            result?;
        }
        Ok(self.latency())
    }

    fn push(&mut self, mut frame: Frame) -> Result<()> {
        self.frames.number(&mut frame);
        let system = frame.system_frame_number;
        tracing::trace!(
            frame = system,
            queued = self.frames.pending_len(),
            "push frame"
        );

        match sei::strip_caption_sei(Codec::H264, self.framing, &frame.input) {
            Ok(Some(stripped)) => frame.input = Bytes::from(stripped),
            Ok(None) => {}
            Err(e) => tracing::debug!(error = %e, "caption SEI scan failed"),
        }

        if !self.need_reorder {
            self.frames.pass_through(frame);
            return Ok(());
        }

        let input = frame.input.clone();
        self.frames.enqueue(frame);
        self.current_frame = Some(system);

        if let Err(e) = self.decode_access_unit(&input) {
            tracing::error!(frame = system, error = %e, "couldn't decode frame");
            self.current_picture = None;
            self.current_frame = None;
            self.frames.rollback(system);
            self.collect();
            return Err(e);
        }

        let Some(picture) = self.current_picture.take() else {
            tracing::debug!(frame = system, "access unit without slice data");
            self.current_frame = None;
            self.frames.rollback(system);
            self.collect();
            return Err(ReorderError::NoSlice);
        };

        self.finish_picture(picture);
        self.current_frame = None;
        self.collect();
        Ok(())
    }

    fn pop(&mut self) -> Option<Frame> {
        self.frames.pop()
    }

    fn drain(&mut self) {
        self.drain_pictures();
        self.collect();
    }

    fn num_buffered(&self) -> usize {
        self.frames.len()
    }

    fn latency(&self) -> Duration {
        if !self.need_reorder {
            return Duration::ZERO;
        }
        frames_to_duration(self.dpb.max_num_frames(), self.framerate)
    }

    fn insert_sei(&self, au: &[u8], messages: &[SeiMessage]) -> Result<Vec<u8>> {
        sei::insert_sei(Codec::H264, self.framing, au, messages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_table() {
        assert_eq!(level_to_max_dpb_mbs(9), Some(396));
        assert_eq!(level_to_max_dpb_mbs(31), Some(18000));
        assert_eq!(level_to_max_dpb_mbs(41), Some(32768));
        assert_eq!(level_to_max_dpb_mbs(62), Some(696320));
        assert_eq!(level_to_max_dpb_mbs(14), None);
    }

    fn sps(profile_idc: u8) -> Sps {
        Sps {
            id: 0,
            profile_idc,
            constraint_set3_flag: false,
            level_idc: 40,
            chroma_format_idc: 1,
            separate_colour_plane_flag: false,
            log2_max_frame_num: 4,
            pic_order_cnt_type: 0,
            log2_max_pic_order_cnt_lsb: 4,
            delta_pic_order_always_zero_flag: false,
            offset_for_non_ref_pic: 0,
            offset_for_top_to_bottom_field: 0,
            offset_for_ref_frame: Vec::new(),
            num_ref_frames: 2,
            gaps_in_frame_num_value_allowed_flag: false,
            frame_mbs_only_flag: true,
            width: 1920,
            height: 1088,
            bitstream_restriction: None,
        }
    }

    #[test]
    fn reorder_frames_inference() {
        assert_eq!(max_num_reorder_frames(&sps(66), 4), 0);
        assert_eq!(max_num_reorder_frames(&sps(100), 4), 4);

        let mut intra = sps(100);
        intra.constraint_set3_flag = true;
        assert_eq!(max_num_reorder_frames(&intra, 4), 0);

        let mut restricted = sps(100);
        restricted.bitstream_restriction = Some(super::super::params::BitstreamRestriction {
            max_num_reorder_frames: 9,
            max_dec_frame_buffering: 4,
        });
        assert_eq!(max_num_reorder_frames(&restricted, 4), 4);
    }

    #[test]
    fn process_sps_sizes_dpb_from_level() {
        let mut engine = H264Reorder::new(true);
        // level 4.0, 1080p: 32768 / (120 * 68) = 4
        engine.process_sps(&sps(100));
        assert_eq!(engine.dpb.max_num_frames(), 4);
        assert_eq!(engine.dpb.max_num_reorder_frames(), 4);
        assert_eq!(engine.latency(), Duration::from_millis(160));
    }

    #[test]
    fn pass_through_when_disabled() {
        let mut engine = H264Reorder::new(false);
        engine
            .push(Frame::new(vec![0, 0, 0, 1, 0x09, 0xF0]))
            .unwrap();
        let out = engine.pop().unwrap();
        assert_eq!(out.system_frame_number, 0);
        assert_eq!(out.output, Some(out.input.clone()));
        assert_eq!(engine.latency(), Duration::ZERO);
    }

    #[test]
    fn access_unit_without_slice_is_rejected() {
        let mut engine = H264Reorder::new(true);
        let err = engine.push(Frame::new(vec![0, 0, 0, 1, 0x09, 0xF0])).unwrap_err();
        assert!(matches!(err, ReorderError::NoSlice));
        assert_eq!(engine.num_buffered(), 0);
    }
}
