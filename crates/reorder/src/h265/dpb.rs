//! H.265 decoded picture buffer (C.5.2). Pictures carry no links to each
//! other, so the buffer owns them directly.

/// Picture metadata tracked for reference marking and output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Picture {
    pub system_frame_number: u32,
    pub pic_order_cnt: i32,
    pub pic_order_cnt_lsb: i32,
    pub pic_order_cnt_msb: i32,
    pub reference: bool,
    pub long_term: bool,
    pub output_flag: bool,
    pub needed_for_output: bool,
    /// `PicLatencyCount`.
    pub pic_latency_cnt: u32,
    pub no_rasl_output_flag: bool,
    pub no_output_of_prior_pics_flag: bool,
}

/// Upper bound on `MaxDpbSize` (A.4.2).
pub const MAX_DPB_SIZE: u32 = 16;

#[derive(Debug, Default)]
pub struct Dpb {
    list: Vec<Picture>,
    max_num_pics: u32,
}

impl Dpb {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_num_pics(&self) -> u32 {
        self.max_num_pics
    }

    pub fn set_max_num_pics(&mut self, n: u32) {
        self.max_num_pics = n;
    }

    pub fn pictures(&self) -> &[Picture] {
        &self.list
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    /// Stores the current picture as a short-term reference (C.5.2.3).
    pub fn add(&mut self, mut picture: Picture) {
        if picture.output_flag {
            for p in self.list.iter_mut().filter(|p| p.needed_for_output) {
                p.pic_latency_cnt += 1;
            }
            picture.needed_for_output = true;
            picture.pic_latency_cnt = 0;
        } else {
            picture.needed_for_output = false;
        }
        picture.reference = true;
        picture.long_term = false;
        self.list.push(picture);
    }

    pub fn clear(&mut self) {
        self.list.clear();
    }

    /// Removes pictures neither needed for output nor used for reference.
    pub fn delete_unused(&mut self) {
        self.list.retain(|p| p.needed_for_output || p.reference);
    }

    pub fn num_pics_needed_for_output(&self) -> u32 {
        self.list.iter().filter(|p| p.needed_for_output).count() as u32
    }

    pub fn mark_all_non_ref(&mut self) {
        for p in &mut self.list {
            p.reference = false;
        }
    }

    pub fn ref_by_poc(&self, poc: i32) -> Option<usize> {
        self.list
            .iter()
            .position(|p| p.reference && p.pic_order_cnt == poc)
    }

    pub fn ref_by_poc_lsb(&self, poc_lsb: i32) -> Option<usize> {
        self.list
            .iter()
            .position(|p| p.reference && p.pic_order_cnt_lsb == poc_lsb)
    }

    pub fn short_ref_by_poc(&self, poc: i32) -> Option<usize> {
        self.list
            .iter()
            .position(|p| p.reference && !p.long_term && p.pic_order_cnt == poc)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut Picture> {
        self.list.get_mut(index)
    }

    /// Whether a picture has to be output before the next one is decoded
    /// or stored. Zero limits are not enforced.
    pub fn needs_bump(&self, max_num_reorder: u32, max_latency: u32, max_dec_pic_buffering: u32) -> bool {
        let len = self.list.len() as u32;
        if len > self.max_num_pics {
            tracing::trace!(len, max = self.max_num_pics, "DPB is full");
            return true;
        }

        let needed = self.num_pics_needed_for_output();
        if needed > max_num_reorder {
            tracing::trace!(needed, max_num_reorder, "too many pictures waiting for output");
            return true;
        }

        if max_latency != 0
            && self
                .list
                .iter()
                .any(|p| p.needed_for_output && p.pic_latency_cnt >= max_latency)
        {
            tracing::trace!(max_latency, "picture latency limit reached");
            return true;
        }

        if max_dec_pic_buffering != 0 && len >= max_dec_pic_buffering {
            tracing::trace!(len, max_dec_pic_buffering, "decoder buffering limit reached");
            return true;
        }

        false
    }

    /// Outputs the lowest-POC picture waiting for output. Reference
    /// pictures stay in the buffer unless draining.
    pub fn bump(&mut self, drain: bool) -> Option<Picture> {
        let index = self
            .list
            .iter()
            .enumerate()
            .filter(|(_, p)| p.needed_for_output)
            .min_by_key(|(_, p)| p.pic_order_cnt)
            .map(|(i, _)| i)?;

        let picture = &mut self.list[index];
        picture.needed_for_output = false;
        if !picture.reference || drain {
            return Some(self.list.remove(index));
        }
        Some(picture.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pic(sfn: u32, poc: i32) -> Picture {
        Picture {
            system_frame_number: sfn,
            pic_order_cnt: poc,
            output_flag: true,
            ..Picture::default()
        }
    }

    #[test]
    fn add_counts_latency() {
        let mut dpb = Dpb::new();
        dpb.set_max_num_pics(6);
        dpb.add(pic(0, 0));
        dpb.add(pic(1, 4));
        dpb.add(pic(2, 2));
        let counts: Vec<u32> = dpb.pictures().iter().map(|p| p.pic_latency_cnt).collect();
        assert_eq!(counts, vec![2, 1, 0]);
        assert!(dpb.pictures().iter().all(|p| p.reference && p.needed_for_output));

        assert!(dpb.needs_bump(0, 0, 0));
        assert!(!dpb.needs_bump(3, 0, 0));
        assert!(dpb.needs_bump(3, 2, 0));
        assert!(dpb.needs_bump(3, 0, 3));
    }

    #[test]
    fn bump_in_poc_order() {
        let mut dpb = Dpb::new();
        dpb.set_max_num_pics(6);
        dpb.add(pic(0, 0));
        dpb.add(pic(1, 8));
        dpb.add(pic(2, 4));

        let first = dpb.bump(false).unwrap();
        assert_eq!(first.pic_order_cnt, 0);
        // still a reference, so it stays
        assert_eq!(dpb.len(), 3);
        assert_eq!(dpb.bump(false).unwrap().pic_order_cnt, 4);
        assert_eq!(dpb.bump(true).unwrap().pic_order_cnt, 8);
        assert_eq!(dpb.len(), 2);
        assert!(dpb.bump(true).is_none());

        dpb.mark_all_non_ref();
        dpb.delete_unused();
        assert!(dpb.is_empty());
    }

    #[test]
    fn lookups_respect_marking() {
        let mut dpb = Dpb::new();
        let mut a = pic(0, 17);
        a.pic_order_cnt_lsb = 1;
        dpb.add(a);
        assert_eq!(dpb.ref_by_poc_lsb(1), Some(0));
        assert_eq!(dpb.short_ref_by_poc(17), Some(0));
        if let Some(p) = dpb.get_mut(0) {
            p.long_term = true;
        }
        assert_eq!(dpb.short_ref_by_poc(17), None);
        assert_eq!(dpb.ref_by_poc(17), Some(0));
    }

    #[test]
    fn non_output_picture_is_not_waiting() {
        let mut dpb = Dpb::new();
        let mut p = pic(0, 0);
        p.output_flag = false;
        dpb.add(p);
        assert_eq!(dpb.num_pics_needed_for_output(), 0);
        assert!(dpb.bump(false).is_none());
    }
}
