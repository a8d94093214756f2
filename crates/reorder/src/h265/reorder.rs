use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use super::dpb::{Dpb, Picture, MAX_DPB_SIZE};
use super::params::{
    self, nal_header, Nal, ParameterSets, Pps, Slice, SliceHeader, Sps, NAL_PPS, NAL_SPS, NAL_VPS,
};
use crate::error::{ReorderError, Result};
use crate::frame::{Frame, FrameQueue};
use crate::scanner::{self, Framing};
use crate::sei::{self, SeiMessage};
use crate::{frames_to_duration, Caps, Codec, Reorder, StreamFormat};

/// `MaxDpbSize` for a picture of `pic_size` luma samples (A.4.2), with
/// `MaxLumaPs` of the highest level.
fn max_dpb_size(pic_size: u64) -> u32 {
    const MAX_LUMA_PS: u64 = 35_651_584;
    const MAX_DPB_PIC_BUF: u32 = 6;

    let size = if pic_size <= MAX_LUMA_PS >> 2 {
        MAX_DPB_PIC_BUF * 4
    } else if pic_size <= MAX_LUMA_PS >> 1 {
        MAX_DPB_PIC_BUF * 2
    } else if pic_size <= (3 * MAX_LUMA_PS) >> 2 {
        MAX_DPB_PIC_BUF * 4 / 3
    } else {
        MAX_DPB_PIC_BUF
    };
    size.min(MAX_DPB_SIZE)
}

/// Reference picture set of the current picture, as POC values (8.3.2).
#[derive(Debug, Default)]
struct RefPicSet {
    st_curr_before: Vec<i32>,
    st_curr_after: Vec<i32>,
    st_foll: Vec<i32>,
    /// `(poc, delta_poc_msb_present_flag)`
    lt_curr: Vec<(i32, bool)>,
    lt_foll: Vec<(i32, bool)>,
}

/// H.265 reorder engine.
pub struct H265Reorder {
    need_reorder: bool,
    framing: Framing,
    framerate: (u32, u32),
    width: u32,
    height: u32,
    progressive_source: bool,
    interlaced_source: bool,

    params: ParameterSets,
    active_sps: Option<Arc<Sps>>,
    dpb: Dpb,
    current_picture: Option<Picture>,
    current_frame: Option<u32>,
    /// The current access unit's picture was dropped (RASL after a random
    /// access point).
    current_dropped: bool,
    prev_independent_slice: Option<SliceHeader>,

    new_bitstream: bool,
    prev_nal_is_eos: bool,
    associated_irap_no_rasl_output_flag: bool,
    sps_max_latency_pictures: u32,
    poc_msb: i32,
    poc_lsb: i32,
    prev_tid0_pic_poc_msb: i32,
    prev_tid0_pic_poc_lsb: i32,
    last_output_poc: Option<i32>,

    frames: FrameQueue,
}

impl H265Reorder {
    pub fn new(need_reorder: bool) -> Self {
        H265Reorder {
            need_reorder,
            framing: Framing::AnnexB,
            framerate: Caps::default().framerate_or_default(),
            width: 0,
            height: 0,
            progressive_source: false,
            interlaced_source: false,
            params: ParameterSets::default(),
            active_sps: None,
            dpb: Dpb::new(),
            current_picture: None,
            current_frame: None,
            current_dropped: false,
            prev_independent_slice: None,
            new_bitstream: true,
            prev_nal_is_eos: false,
            associated_irap_no_rasl_output_flag: false,
            sps_max_latency_pictures: 0,
            poc_msb: 0,
            poc_lsb: 0,
            prev_tid0_pic_poc_msb: 0,
            prev_tid0_pic_poc_lsb: 0,
            last_output_poc: None,
            frames: FrameQueue::new(),
        }
    }

    /// The decoded picture buffer, for inspection.
    pub fn dpb(&self) -> &Dpb {
        &self.dpb
    }

    fn process_sps(&mut self, sps: &Sps) {
        let max_dpb_size = max_dpb_size(u64::from(sps.width) * u64::from(sps.height));

        if self.width != sps.width
            || self.height != sps.height
            || self.dpb.max_num_pics() != max_dpb_size
            || self.progressive_source != sps.progressive_source_flag
            || self.interlaced_source != sps.interlaced_source_flag
        {
            tracing::debug!(
                old_width = self.width,
                old_height = self.height,
                width = sps.width,
                height = sps.height,
                old_dpb_size = self.dpb.max_num_pics(),
                dpb_size = max_dpb_size,
                interlaced = sps.interlaced_source_flag,
                "SPS updated"
            );

            self.drain_pictures();

            self.width = sps.width;
            self.height = sps.height;
            self.progressive_source = sps.progressive_source_flag;
            self.interlaced_source = sps.interlaced_source_flag;
            self.dpb.set_max_num_pics(max_dpb_size);
        }

        self.sps_max_latency_pictures = sps.max_latency_pictures().unwrap_or(0);
    }

    fn parse_codec_data(&mut self, data: &[u8]) -> Result<()> {
        let config = scanner::parse_hvcc(data)?;
        if let Framing::LengthPrefixed(_) = self.framing {
            self.framing = Framing::LengthPrefixed(config.length_size);
        }
        for nal in &config.nal_units {
            let (nal_type, _) = nal_header(nal)?;
            match nal_type {
                NAL_VPS => {}
                NAL_SPS => {
                    let sps = Sps::parse(nal)?;
                    self.process_sps(&sps);
                    self.params.insert_sps(sps);
                }
                NAL_PPS => self.params.insert_pps(Pps::parse(nal)?),
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
        let (nal_type, _) = nal_header(data)?;
        tracing::trace!(nal_type, size = data.len(), "parsed NAL unit");

        match Nal::parse(data, &self.params) {
            Ok(Nal::Sps(sps)) => {
                self.process_sps(&sps);
                self.params.insert_sps(sps);
            }
            Ok(Nal::Pps(pps)) => self.params.insert_pps(pps),
            Ok(Nal::Slice(slice)) => {
                self.parse_slice(&slice)?;
                self.new_bitstream = false;
                self.prev_nal_is_eos = false;
            }
            Ok(Nal::EndOfSequence) => self.prev_nal_is_eos = true,
            Ok(Nal::EndOfBitstream) => self.new_bitstream = true,
            Ok(Nal::Other(_)) => {}
            Err(e) if matches!(nal_type, NAL_SPS | NAL_PPS) => {
                tracing::warn!(nal_type, error = %e, "failed to parse parameter set");
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }

    fn parse_slice(&mut self, slice: &Slice) -> Result<()> {
        let header = if slice.header.dependent_slice_segment_flag {
            let Some(prev) = &self.prev_independent_slice else {
                return Err(ReorderError::Picture("dependent slice segment without independent slice"));
            };
            SliceHeader {
                first_slice_segment_in_pic_flag: slice.header.first_slice_segment_in_pic_flag,
                no_output_of_prior_pics_flag: slice.header.no_output_of_prior_pics_flag,
                pps_id: slice.header.pps_id,
                dependent_slice_segment_flag: true,
                ..prev.clone()
            }
        } else {
            self.prev_independent_slice = Some(slice.header.clone());
            slice.header.clone()
        };

        if self.current_picture.is_some() && header.first_slice_segment_in_pic_flag {
            tracing::warn!("first slice segment of a new picture before the current one finished");
            return Err(ReorderError::Picture("picture not finished at first slice segment"));
        }

        self.active_sps = Some(slice.sps.clone());

        if self.current_picture.is_none() && !self.current_dropped {
            self.start_current_picture(slice, &header)?;
        }
        Ok(())
    }

    fn start_current_picture(&mut self, slice: &Slice, header: &SliceHeader) -> Result<()> {
        let mut picture = Picture {
            system_frame_number: self.current_frame.unwrap_or_default(),
            ..Picture::default()
        };
        self.fill_picture_from_slice(&mut picture, slice.nal_type, header);
        self.calculate_poc(&mut picture, slice, header);

        if params::is_rasl(slice.nal_type) && self.associated_irap_no_rasl_output_flag {
            tracing::debug!(poc = picture.pic_order_cnt, "dropping RASL picture");
            self.current_dropped = true;
            return Ok(());
        }

        self.prepare_rps(slice, header, &picture)?;
        self.dpb_init(&mut picture, slice, header);
        self.current_picture = Some(picture);
        Ok(())
    }

    fn fill_picture_from_slice(&mut self, picture: &mut Picture, nal_type: u8, header: &SliceHeader) {
        picture.no_rasl_output_flag = params::is_idr(nal_type)
            || params::is_bla(nal_type)
            || (params::is_cra(nal_type) && self.new_bitstream)
            || self.prev_nal_is_eos;

        if params::is_irap(nal_type) {
            self.associated_irap_no_rasl_output_flag = picture.no_rasl_output_flag;
        }

        picture.output_flag = if params::is_rasl(nal_type) && self.associated_irap_no_rasl_output_flag {
            false
        } else {
            header.pic_output_flag
        };
    }

    /// Picture order count, 8.3.1.
    fn calculate_poc(&mut self, picture: &mut Picture, slice: &Slice, header: &SliceHeader) {
        let nal_type = slice.nal_type;
        let irap_no_rasl = params::is_irap(nal_type) && picture.no_rasl_output_flag;

        let (prev_poc_msb, prev_poc_lsb) = if irap_no_rasl {
            (self.poc_msb, self.poc_lsb)
        } else {
            (self.prev_tid0_pic_poc_msb, self.prev_tid0_pic_poc_lsb)
        };

        let max_lsb = slice.sps.max_pic_order_cnt_lsb();
        let lsb = header.pic_order_cnt_lsb as i32;
        self.poc_lsb = lsb;
        self.poc_msb = if irap_no_rasl {
            0
        } else if lsb < prev_poc_lsb && prev_poc_lsb - lsb >= max_lsb / 2 {
            prev_poc_msb + max_lsb
        } else if lsb > prev_poc_lsb && lsb - prev_poc_lsb > max_lsb / 2 {
            prev_poc_msb - max_lsb
        } else {
            prev_poc_msb
        };

        picture.pic_order_cnt = self.poc_msb + self.poc_lsb;
        picture.pic_order_cnt_msb = self.poc_msb;
        picture.pic_order_cnt_lsb = self.poc_lsb;

        if params::is_idr(nal_type) {
            picture.pic_order_cnt = 0;
            picture.pic_order_cnt_msb = 0;
            picture.pic_order_cnt_lsb = 0;
            self.poc_msb = 0;
            self.poc_lsb = 0;
            self.prev_tid0_pic_poc_msb = 0;
            self.prev_tid0_pic_poc_lsb = 0;
        }

        if slice.temporal_id_plus1 == 1
            && !params::is_rasl(nal_type)
            && !params::is_radl(nal_type)
            && params::is_sub_layer_ref(nal_type)
        {
            self.prev_tid0_pic_poc_msb = picture.pic_order_cnt_msb;
            self.prev_tid0_pic_poc_lsb = picture.pic_order_cnt_lsb;
        }

        tracing::trace!(
            poc = picture.pic_order_cnt,
            msb = picture.pic_order_cnt_msb,
            lsb = picture.pic_order_cnt_lsb,
            "picture order count"
        );
    }

    /// Derives the RPS of the current picture and marks the DPB (8.3.2).
    fn prepare_rps(&mut self, slice: &Slice, header: &SliceHeader, picture: &Picture) -> Result<()> {
        let nal_type = slice.nal_type;
        let sps = &slice.sps;

        if params::is_irap(nal_type) && picture.no_rasl_output_flag {
            self.dpb.mark_all_non_ref();
        }

        let mut rps = RefPicSet::default();
        if !params::is_idr(nal_type) {
            let st = if header.short_term_ref_pic_set_sps_flag {
                sps.short_term_ref_pic_sets
                    .get(header.short_term_ref_pic_set_idx as usize)
                    .ok_or_else(|| {
                        ReorderError::Bitstream(format!(
                            "short_term_ref_pic_set_idx {} out of range",
                            header.short_term_ref_pic_set_idx
                        ))
                    })?
            } else {
                &header.short_term_ref_pic_set
            };

            let poc = picture.pic_order_cnt;
            for (&delta, &used) in st.delta_poc_s0.iter().zip(&st.used_by_curr_pic_s0) {
                if used {
                    rps.st_curr_before.push(poc + delta);
                } else {
                    rps.st_foll.push(poc + delta);
                }
            }
            for (&delta, &used) in st.delta_poc_s1.iter().zip(&st.used_by_curr_pic_s1) {
                if used {
                    rps.st_curr_after.push(poc + delta);
                } else {
                    rps.st_foll.push(poc + delta);
                }
            }

            // (7-52)
            let max_lsb = sps.max_pic_order_cnt_lsb();
            let mut msb_cycle = 0i32;
            for (i, lt) in header.long_term_refs.iter().enumerate() {
                if i == 0 || i as u32 == header.num_long_term_sps {
                    msb_cycle = lt.delta_poc_msb_cycle_lt as i32;
                } else {
                    msb_cycle += lt.delta_poc_msb_cycle_lt as i32;
                }

                let mut poc_lt = lt.poc_lsb_lt as i32;
                if lt.delta_poc_msb_present_flag {
                    poc_lt += poc - msb_cycle * max_lsb - header.pic_order_cnt_lsb as i32;
                }
                let entry = (poc_lt, lt.delta_poc_msb_present_flag);
                if lt.used_by_curr_pic_lt {
                    rps.lt_curr.push(entry);
                } else {
                    rps.lt_foll.push(entry);
                }
            }
        }

        self.derive_and_mark_rps(&rps);
        Ok(())
    }

    fn derive_and_mark_rps(&mut self, rps: &RefPicSet) {
        let mut in_rps = Vec::new();

        for &(poc, msb_present) in rps.lt_curr.iter().chain(&rps.lt_foll) {
            let found = if msb_present {
                self.dpb.ref_by_poc(poc)
            } else {
                self.dpb.ref_by_poc_lsb(poc)
            };
            match found.and_then(|i| self.dpb.get_mut(i)) {
                Some(p) => {
                    p.reference = true;
                    p.long_term = true;
                    in_rps.push(p.pic_order_cnt);
                }
                None => tracing::trace!(poc, "long-term reference missing from DPB"),
            }
        }

        let short = rps
            .st_curr_before
            .iter()
            .chain(&rps.st_curr_after)
            .chain(&rps.st_foll);
        for &poc in short {
            match self.dpb.short_ref_by_poc(poc) {
                Some(_) => in_rps.push(poc),
                None => tracing::trace!(poc, "short-term reference missing from DPB"),
            }
        }

        for i in 0..self.dpb.len() {
            if let Some(p) = self.dpb.get_mut(i) {
                if !in_rps.contains(&p.pic_order_cnt) {
                    p.reference = false;
                    p.long_term = false;
                }
            }
        }
    }

    /// Output and removal of pictures before the current one is decoded
    /// (C.5.2.2).
    fn dpb_init(&mut self, picture: &mut Picture, slice: &Slice, header: &SliceHeader) {
        let nal_type = slice.nal_type;
        let sps = &slice.sps;

        if params::is_irap(nal_type) && picture.no_rasl_output_flag && !self.new_bitstream {
            picture.no_output_of_prior_pics_flag =
                params::is_cra(nal_type) || header.no_output_of_prior_pics_flag;

            if picture.no_output_of_prior_pics_flag {
                // prior pictures still leave in display order; nothing here
                // holds samples that could be discarded
                tracing::debug!("no output of prior pictures, draining");
                self.drain_pictures();
            } else {
                self.dpb.delete_unused();
                while let Some(p) = self.dpb.bump(false) {
                    self.output_picture(&p);
                }
                if !self.dpb.is_empty() {
                    tracing::warn!(len = self.dpb.len(), "pictures left in DPB after flushing output");
                }
            }
            return;
        }

        self.dpb.delete_unused();
        while self.dpb.needs_bump(
            sps.max_num_reorder_pics,
            self.sps_max_latency_pictures,
            sps.max_dec_pic_buffering_minus1 + 1,
        ) {
            let Some(p) = self.dpb.bump(false) else {
                tracing::warn!("bumping is needed but no picture to output");
                break;
            };
            self.output_picture(&p);
        }
    }

    /// Picture bumping after the current picture is stored (C.5.2.3).
    fn finish_picture(&mut self, picture: Picture) {
        let (frame, poc, output_flag) = (
            picture.system_frame_number,
            picture.pic_order_cnt,
            picture.output_flag,
        );

        self.dpb.delete_unused();
        self.dpb.add(picture);
        if !output_flag {
            tracing::debug!(frame, poc, "picture not for output");
            self.output_frame(frame);
        }

        let max_num_reorder = self
            .active_sps
            .as_ref()
            .map_or(0, |sps| sps.max_num_reorder_pics);
        while self.dpb.needs_bump(max_num_reorder, self.sps_max_latency_pictures, 0) {
            let Some(p) = self.dpb.bump(false) else {
                tracing::warn!("bumping is needed but no picture to output");
                break;
            };
            self.output_picture(&p);
        }

        tracing::trace!(frame, poc, dpb_size = self.dpb.len(), "finished picture");
    }

    fn output_picture(&mut self, picture: &Picture) {
        if let Some(last) = self.last_output_poc {
            if picture.pic_order_cnt < last {
                tracing::warn!(poc = picture.pic_order_cnt, last, "picture output out of order");
            }
        }
        self.last_output_poc = Some(picture.pic_order_cnt);
        self.output_frame(picture.system_frame_number);
    }

    fn output_frame(&mut self, system_frame_number: u32) {
        self.frames.set_output_buffer(system_frame_number);
        self.frames.promote();
    }

    /// Bumps everything out of the DPB and flushes all queued frames except
    /// the one being decoded.
    fn drain_pictures(&mut self) {
        while let Some(p) = self.dpb.bump(true) {
            self.output_picture(&p);
        }
        self.dpb.clear();
        self.last_output_poc = None;
        self.frames.flush(self.current_frame);
    }
}

impl Reorder for H265Reorder {
    fn set_caps(&mut self, caps: &Caps) -> Result<Duration> {
        tracing::debug!(format = ?caps.stream_format, framerate = ?caps.framerate, "set caps");

        self.framing = match caps.stream_format {
            StreamFormat::ByteStream => Framing::AnnexB,
            StreamFormat::Packetized => Framing::LengthPrefixed(4),
        };
        self.framerate = caps.framerate_or_default();

        if let Some(data) = &caps.codec_data {
            self.parse_codec_data(data)?;
        }
        Ok(self.latency())
    }

    fn push(&mut self, mut frame: Frame) -> Result<()> {
        self.frames.number(&mut frame);
        let system = frame.system_frame_number;
        tracing::trace!(frame = system, queued = self.frames.pending_len(), "push frame");

        match sei::strip_caption_sei(Codec::H265, self.framing, &frame.input) {
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
        self.current_dropped = false;

        let result = self.decode_access_unit(&input);
        let picture = self.current_picture.take();
        let dropped = std::mem::take(&mut self.current_dropped);

        if let Err(e) = result {
            tracing::error!(frame = system, error = %e, "couldn't decode frame");
            self.current_frame = None;
            self.frames.rollback(system);
            return Err(e);
        }

        match picture {
            Some(picture) => self.finish_picture(picture),
            None if dropped => self.output_frame(system),
            None => {
                tracing::debug!(frame = system, "access unit without slice data");
                self.current_frame = None;
                self.frames.rollback(system);
                return Err(ReorderError::NoSlice);
            }
        }
        self.current_frame = None;
        Ok(())
    }

    fn pop(&mut self) -> Option<Frame> {
        self.frames.pop()
    }

    fn drain(&mut self) {
        self.drain_pictures();
    }

    fn num_buffered(&self) -> usize {
        self.frames.len()
    }

    fn latency(&self) -> Duration {
        if !self.need_reorder {
            return Duration::ZERO;
        }
        frames_to_duration(self.dpb.max_num_pics(), self.framerate)
    }

    fn insert_sei(&self, au: &[u8], messages: &[SeiMessage]) -> Result<Vec<u8>> {
        sei::insert_sei(Codec::H265, self.framing, au, messages)
    }
}
