//! H.264 picture metadata and the arena that owns it.
//!
//! Complementary fields point at each other through [`PicId`]s. An id is a
//! slot index plus the generation the slot had when the picture was stored,
//! so a link to a picture that has since been collected resolves to `None`
//! instead of to whatever reused the slot.

use super::params::DecRefPicMarking;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Field {
    #[default]
    Frame,
    Top,
    Bottom,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Reference {
    #[default]
    None,
    ShortTerm,
    LongTerm,
}

/// Ordering metadata of one coded frame or field.
#[derive(Debug, Clone, Default)]
pub struct Picture {
    /// Decode number of the frame that carried this picture; `None` for
    /// pictures inferred from a frame_num gap.
    pub system_frame_number: Option<u32>,

    pub field: Field,
    pub field_pic_flag: bool,
    pub second_field: bool,
    pub other_field: Option<PicId>,

    pub idr: bool,
    pub idr_pic_id: u32,
    pub nonexisting: bool,
    pub nal_ref_idc: u8,
    pub reference: Reference,
    /// Set once the picture was ever marked as a reference.
    pub ref_pic: bool,
    pub needed_for_output: bool,
    pub mem_mgmt_5: bool,
    pub dec_ref_pic_marking: DecRefPicMarking,

    pub frame_num: i32,
    pub frame_num_wrap: i32,
    pub frame_num_offset: i32,
    pub pic_num: i32,
    pub long_term_pic_num: i32,
    pub long_term_frame_idx: i32,

    pub pic_order_cnt_type: u32,
    pub pic_order_cnt: i32,
    pub pic_order_cnt_msb: i32,
    pub pic_order_cnt_lsb: i32,
    pub delta_pic_order_cnt_bottom: i32,
    pub delta_pic_order_cnt0: i32,
    pub delta_pic_order_cnt1: i32,
    pub top_field_order_cnt: i32,
    pub bottom_field_order_cnt: i32,
}

impl Picture {
    /// A short-term reference frame standing in for a skipped frame_num
    /// (8.2.5.2).
    pub fn nonexisting(frame_num: i32) -> Self {
        Picture {
            nonexisting: true,
            nal_ref_idc: 1,
            frame_num,
            pic_num: frame_num,
            reference: Reference::ShortTerm,
            ref_pic: true,
            field: Field::Frame,
            ..Picture::default()
        }
    }

    pub fn is_frame(&self) -> bool {
        self.field == Field::Frame
    }

    pub fn is_ref(&self) -> bool {
        self.reference != Reference::None
    }

    pub fn is_short_term_ref(&self) -> bool {
        self.reference == Reference::ShortTerm
    }

    pub fn is_long_term_ref(&self) -> bool {
        self.reference == Reference::LongTerm
    }
}

/// Handle to a picture stored in an [`Arena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PicId {
    index: u32,
    generation: u32,
}

#[derive(Debug, Default)]
struct Slot {
    generation: u32,
    picture: Option<Picture>,
}

/// Owner of every live picture.
#[derive(Debug, Default)]
pub struct Arena {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

impl Arena {
    pub fn insert(&mut self, picture: Picture) -> PicId {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.picture = Some(picture);
            return PicId {
                index,
                generation: slot.generation,
            };
        }
        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            picture: Some(picture),
        });
        PicId {
            index,
            generation: 0,
        }
    }

    pub fn get(&self, id: PicId) -> Option<&Picture> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.picture.as_ref())
    }

    pub fn get_mut(&mut self, id: PicId) -> Option<&mut Picture> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.picture.as_mut())
    }

    /// Drops every picture for which `keep` is false.
    pub fn retain(&mut self, mut keep: impl FnMut(PicId) -> bool) {
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if slot.picture.is_none() {
                continue;
            }
            let id = PicId {
                index: index as u32,
                generation: slot.generation,
            };
            if !keep(id) {
                slot.picture = None;
                slot.generation = slot.generation.wrapping_add(1);
                self.free.push(index as u32);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.picture.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_id_does_not_resolve() {
        let mut arena = Arena::default();
        let a = arena.insert(Picture::nonexisting(1));
        arena.retain(|_| false);
        let b = arena.insert(Picture::nonexisting(2));
        assert!(arena.get(a).is_none());
        assert_eq!(arena.get(b).unwrap().frame_num, 2);
        assert_eq!(arena.len(), 1);
    }

    #[test]
    fn retain_keeps_selected() {
        let mut arena = Arena::default();
        let a = arena.insert(Picture::default());
        let b = arena.insert(Picture::default());
        arena.retain(|id| id == b);
        assert!(arena.get(a).is_none());
        assert!(arena.get(b).is_some());
    }

    #[test]
    fn nonexisting_is_short_term_frame() {
        let p = Picture::nonexisting(7);
        assert!(p.is_short_term_ref());
        assert!(p.is_frame());
        assert!(p.ref_pic);
        assert_eq!(p.pic_num, 7);
        assert_eq!(p.system_frame_number, None);
    }
}
