//! H.264 decoded picture buffer: reference marking and output bumping
//! (C.4.5.3), without any sample data.

use std::collections::HashSet;

use super::params::Mmco;
use super::picture::{Arena, PicId, Picture, Reference};

/// Upper bound on DPB frames for every level (A.3.1).
pub const MAX_DPB_FRAMES: u32 = 16;

#[derive(Debug, Default)]
pub struct Dpb {
    arena: Arena,
    list: Vec<PicId>,
    max_num_frames: u32,
    max_num_reorder_frames: u32,
    interlaced: bool,
}

impl Dpb {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a picture that is not (yet) part of the buffer.
    pub fn alloc(&mut self, picture: Picture) -> PicId {
        self.arena.insert(picture)
    }

    pub fn pic(&self, id: PicId) -> Option<&Picture> {
        self.arena.get(id)
    }

    pub fn pic_mut(&mut self, id: PicId) -> Option<&mut Picture> {
        self.arena.get_mut(id)
    }

    pub fn max_num_frames(&self) -> u32 {
        self.max_num_frames
    }

    pub fn set_max_num_frames(&mut self, n: u32) {
        self.max_num_frames = n;
    }

    pub fn max_num_reorder_frames(&self) -> u32 {
        self.max_num_reorder_frames
    }

    pub fn set_max_num_reorder_frames(&mut self, n: u32) {
        self.max_num_reorder_frames = n;
    }

    pub fn interlaced(&self) -> bool {
        self.interlaced
    }

    pub fn set_interlaced(&mut self, interlaced: bool) {
        self.interlaced = interlaced;
    }

    /// Pictures in insertion order.
    pub fn pictures(&self) -> &[PicId] {
        &self.list
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    pub fn add(&mut self, id: PicId) {
        let Some(picture) = self.arena.get_mut(id) else {
            tracing::warn!("adding a collected picture to the DPB");
            return;
        };
        picture.needed_for_output = !picture.nonexisting;
        let link = if picture.second_field {
            picture.other_field
        } else {
            None
        };
        if let Some(first) = link.and_then(|first| self.arena.get_mut(first)) {
            first.other_field = Some(id);
        }

        self.list.push(id);

        let capacity = self.max_num_frames as usize * (usize::from(self.interlaced) + 1);
        if self.list.len() > capacity {
            tracing::error!(size = self.list.len(), capacity, "DPB exceeds its maximum size");
        }
    }

    pub fn clear(&mut self) {
        self.list.clear();
    }

    /// Removes pictures neither needed for output nor used for reference.
    pub fn delete_unused(&mut self) {
        let arena = &self.arena;
        self.list.retain(|&id| {
            arena
                .get(id)
                .is_some_and(|p| p.needed_for_output || p.is_ref())
        });
    }

    /// Reference frames, counting a field pair once.
    pub fn num_ref_frames(&self) -> u32 {
        self.iter()
            .filter(|(_, p)| p.is_ref() && !p.second_field)
            .count() as u32
    }

    /// Frames or completed field pairs still waiting for output.
    pub fn num_output_needed(&self) -> u32 {
        self.iter()
            .filter(|(_, p)| p.needed_for_output && (p.is_frame() || p.second_field))
            .count() as u32
    }

    pub fn mark_all_non_ref(&mut self) {
        for &id in &self.list {
            if let Some(p) = self.arena.get_mut(id) {
                p.reference = Reference::None;
            }
        }
    }

    /// Marks `id`, and with `other_field` its complementary field too.
    pub fn set_reference(&mut self, id: PicId, reference: Reference, other_field: bool) {
        let Some(p) = self.arena.get_mut(id) else {
            return;
        };
        p.reference = reference;
        if reference != Reference::None {
            p.ref_pic = true;
        }
        let other = p.other_field;
        if !other_field {
            return;
        }
        if let Some(o) = other.and_then(|o| self.arena.get_mut(o)) {
            o.reference = reference;
            if reference != Reference::None {
                o.ref_pic = true;
            }
        }
    }

    pub fn lowest_frame_num_short_ref(&self) -> Option<PicId> {
        self.iter()
            .filter(|(_, p)| p.is_short_term_ref())
            .min_by_key(|(_, p)| p.frame_num_wrap)
            .map(|(id, _)| id)
    }

    fn short_ref_by_pic_num(&self, pic_num: i32) -> Option<PicId> {
        self.iter()
            .find(|(_, p)| p.is_short_term_ref() && p.pic_num == pic_num)
            .map(|(id, _)| id)
    }

    fn long_ref_by_long_term_pic_num(&self, long_term_pic_num: i32) -> Option<PicId> {
        self.iter()
            .find(|(_, p)| p.is_long_term_ref() && p.long_term_pic_num == long_term_pic_num)
            .map(|(id, _)| id)
    }

    pub fn has_empty_frame_buffer(&self) -> bool {
        let used = if self.interlaced {
            self.iter().filter(|(_, p)| !p.second_field).count()
        } else {
            self.list.len()
        };
        used < self.max_num_frames as usize
    }

    fn iter(&self) -> impl Iterator<Item = (PicId, &Picture)> + '_ {
        self.list
            .iter()
            .filter_map(|&id| self.arena.get(id).map(|p| (id, p)))
    }

    /// The output candidate with the lowest POC; single fields wait for
    /// their pair.
    fn lowest_poc(&self) -> Option<(usize, PicId)> {
        let mut lowest: Option<(usize, PicId, i32)> = None;
        for (index, &id) in self.list.iter().enumerate() {
            let Some(p) = self.arena.get(id) else {
                continue;
            };
            if !p.needed_for_output {
                continue;
            }
            if !p.is_frame() && (p.other_field.is_none() || p.second_field) {
                continue;
            }
            if lowest.is_none_or(|(_, _, poc)| p.pic_order_cnt < poc) {
                lowest = Some((index, id, p.pic_order_cnt));
            }
        }
        lowest.map(|(index, id, _)| (index, id))
    }

    /// Whether a picture must be output before `to_insert` can be stored
    /// (C.4.5.3).
    pub fn needs_bump(&self, to_insert: PicId) -> bool {
        let Some(current) = self.arena.get(to_insert) else {
            return false;
        };

        if current.second_field
            && current
                .other_field
                .is_some_and(|first| self.list.contains(&first))
        {
            tracing::trace!("second field shares the frame buffer of its first field");
            return false;
        }

        let Some((_, lowest)) = self.lowest_poc() else {
            return false;
        };
        let lowest_poc = self.arena.get(lowest).map_or(i32::MAX, |p| p.pic_order_cnt);

        let num_output_needed = self.num_output_needed();
        if num_output_needed > self.max_num_reorder_frames {
            tracing::trace!(
                num_output_needed,
                max_num_reorder_frames = self.max_num_reorder_frames,
                "too many pictures waiting for output"
            );
            return true;
        }

        if self.has_empty_frame_buffer() {
            return false;
        }

        if current.ref_pic {
            tracing::trace!("no empty frame buffer for reference picture");
            return true;
        }

        current.pic_order_cnt > lowest_poc
    }

    /// Takes the lowest-POC picture out of the output set. Reference
    /// pictures stay in the buffer unless draining.
    pub fn bump(&mut self, drain: bool) -> Option<PicId> {
        let (index, id) = self.lowest_poc()?;

        let picture = self.arena.get_mut(id)?;
        picture.needed_for_output = false;
        let remove = !picture.is_ref() || drain;
        let other = picture.other_field;

        if remove {
            self.list.remove(index);
        }

        if let Some(other) = other {
            if let Some(o) = self.arena.get_mut(other) {
                o.needed_for_output = false;
                if !o.is_ref() {
                    self.list.retain(|&x| x != other);
                }
            }
        }

        Some(id)
    }

    /// Applies one memory management control operation for `current`
    /// (8.2.5.4). Returns false when the target picture is missing.
    pub fn perform_mmco(&mut self, op: &Mmco, current: PicId) -> bool {
        let Some(cur) = self.arena.get(current) else {
            return false;
        };
        let cur_is_frame = cur.is_frame();
        let cur_pic_num = cur.pic_num;

        match *op {
            Mmco::ShortTermUnused {
                difference_of_pic_nums_minus1,
            } => {
                let pic_num_x = cur_pic_num - (difference_of_pic_nums_minus1 as i32 + 1);
                let Some(target) = self.short_ref_by_pic_num(pic_num_x) else {
                    tracing::warn!(pic_num_x, "no short-term reference to unmark");
                    return false;
                };
                self.set_reference(target, Reference::None, cur_is_frame);
            }
            Mmco::LongTermUnused { long_term_pic_num } => {
                let Some(target) = self.long_ref_by_long_term_pic_num(long_term_pic_num as i32)
                else {
                    tracing::warn!(long_term_pic_num, "no long-term reference to unmark");
                    return false;
                };
                self.set_reference(target, Reference::None, false);
            }
            Mmco::ShortTermToLongTerm {
                difference_of_pic_nums_minus1,
                long_term_frame_idx,
            } => {
                let pic_num_x = cur_pic_num - (difference_of_pic_nums_minus1 as i32 + 1);
                let Some(target) = self.short_ref_by_pic_num(pic_num_x) else {
                    tracing::warn!(pic_num_x, "no short-term reference to convert");
                    return false;
                };
                self.release_long_term_frame_idx(long_term_frame_idx as i32, target);
                self.set_reference(target, Reference::LongTerm, cur_is_frame);
                self.assign_long_term_frame_idx(target, long_term_frame_idx as i32);
            }
            Mmco::MaxLongTermFrameIdx {
                max_long_term_frame_idx_plus1,
            } => {
                let max = max_long_term_frame_idx_plus1 as i32 - 1;
                let stale: Vec<PicId> = self
                    .iter()
                    .filter(|(_, p)| p.is_long_term_ref() && p.long_term_frame_idx > max)
                    .map(|(id, _)| id)
                    .collect();
                for id in stale {
                    self.set_reference(id, Reference::None, false);
                }
            }
            Mmco::AllUnused => {
                self.mark_all_non_ref();
                if let Some(cur) = self.arena.get_mut(current) {
                    cur.mem_mgmt_5 = true;
                }
            }
            Mmco::CurrentToLongTerm {
                long_term_frame_idx,
            } => {
                self.release_long_term_frame_idx(long_term_frame_idx as i32, current);
                self.set_reference(current, Reference::LongTerm, cur_is_frame);
                self.assign_long_term_frame_idx(current, long_term_frame_idx as i32);
            }
        }
        true
    }

    // Frees LongTermFrameIdx `idx` unless it belongs to `keep`'s field pair.
    fn release_long_term_frame_idx(&mut self, idx: i32, keep: PicId) {
        let holder = self
            .iter()
            .find(|(_, p)| p.is_long_term_ref() && p.long_term_frame_idx == idx)
            .map(|(id, p)| (id, p.other_field));
        if let Some((id, other)) = holder {
            if id != keep && other != Some(keep) {
                self.set_reference(id, Reference::None, true);
            }
        }
    }

    fn assign_long_term_frame_idx(&mut self, id: PicId, idx: i32) {
        let Some(p) = self.arena.get_mut(id) else {
            return;
        };
        p.long_term_frame_idx = idx;
        let other = p.other_field;
        if let Some(o) = other.and_then(|o| self.arena.get_mut(o)) {
            if o.is_long_term_ref() {
                o.long_term_frame_idx = idx;
            }
        }
    }

    /// Frees every picture not reachable from the buffer or `roots`.
    pub fn collect(&mut self, roots: &[Option<PicId>]) {
        let mut live: HashSet<PicId> = self.list.iter().copied().collect();
        live.extend(roots.iter().flatten().copied());
        let linked: Vec<PicId> = live
            .iter()
            .filter_map(|&id| self.arena.get(id).and_then(|p| p.other_field))
            .collect();
        live.extend(linked);
        self.arena.retain(|id| live.contains(&id));
    }

    #[cfg(test)]
    fn arena_len(&self) -> usize {
        self.arena.len()
    }
}
