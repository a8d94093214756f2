//! H.265 decode-order to display-order scenarios on synthetic streams.

mod support;

use std::time::Duration;

use bytes::Bytes;
use reorder::{Caps, Codec, Frame, H265Reorder, Reorder, ReorderError, StreamFormat};
use support::h265::{self, CRA, RASL_N, TRAIL_N, TRAIL_R};
use support::{annex_b, length_prefixed};

fn pop_all(engine: &mut dyn Reorder) -> Vec<Frame> {
    std::iter::from_fn(|| engine.pop()).collect()
}

fn numbers(frames: &[Frame]) -> Vec<(u32, Option<u32>)> {
    frames
        .iter()
        .map(|f| (f.system_frame_number, f.presentation_frame_number))
        .collect()
}

/// IDR(0) P(6) b(2) b(4), the B pictures predicting from both sides.
fn ipbb() -> Vec<Vec<u8>> {
    vec![
        annex_b(&[h265::sps(), h265::pps(), h265::idr()]),
        annex_b(&[h265::slice(TRAIL_R, 6, &[-6], &[])]),
        annex_b(&[h265::slice(TRAIL_N, 2, &[-2], &[4])]),
        annex_b(&[h265::slice(TRAIL_N, 4, &[-4], &[2])]),
    ]
}

#[test]
fn b_pictures_resolve_in_display_order() {
    let mut engine = H265Reorder::new(true);
    engine.set_caps(&Caps::default()).unwrap();
    let aus = ipbb();

    engine.push(Frame::new(aus[0].clone())).unwrap();
    assert!(engine.pop().is_none());

    // two pictures waiting exceeds sps_max_num_reorder_pics
    engine.push(Frame::new(aus[1].clone())).unwrap();
    let f0 = engine.pop().unwrap();
    assert_eq!(f0.system_frame_number, 0);
    assert_eq!(f0.presentation_frame_number, Some(0));

    engine.push(Frame::new(aus[2].clone())).unwrap();
    engine.push(Frame::new(aus[3].clone())).unwrap();
    assert!(engine.pop().is_none());
    assert_eq!(engine.num_buffered(), 3);

    // the first B picture dropped out of the RPS of the second
    let pocs: Vec<i32> = engine.dpb().pictures().iter().map(|p| p.pic_order_cnt).collect();
    assert_eq!(pocs, vec![0, 6, 4]);

    engine.drain();
    let rest = pop_all(&mut engine);
    assert_eq!(numbers(&rest), vec![(1, Some(3)), (2, Some(1)), (3, Some(2))]);
    assert_eq!(rest[0].output.as_deref(), Some(&aus[3][..]));
    assert!(engine.dpb().is_empty());

    engine.drain();
    assert!(engine.pop().is_none());
}

#[test]
fn rasl_after_leading_cra_is_dropped() {
    let mut engine = H265Reorder::new(true);
    engine.set_caps(&Caps::default()).unwrap();

    engine
        .push(Frame::new(annex_b(&[h265::sps(), h265::pps(), h265::slice(CRA, 8, &[], &[])])))
        .unwrap();
    // references a picture from before the CRA
    engine
        .push(Frame::new(annex_b(&[h265::slice(RASL_N, 4, &[-4], &[4])])))
        .unwrap();
    assert!(engine.dpb().pictures().iter().all(|p| p.pic_order_cnt != 4));

    engine
        .push(Frame::new(annex_b(&[h265::slice(TRAIL_R, 16, &[-8], &[])])))
        .unwrap();
    let out = pop_all(&mut engine);
    assert_eq!(numbers(&out), vec![(0, Some(1)), (1, Some(0))]);
    assert!(out.iter().all(|f| f.output.is_some()));

    engine.drain();
    assert_eq!(numbers(&pop_all(&mut engine)), vec![(2, Some(2))]);
}

#[test]
fn cra_after_end_of_sequence_flushes_prior_pictures() {
    let mut engine = H265Reorder::new(true);
    engine.set_caps(&Caps::default()).unwrap();
    let aus = ipbb();

    engine.push(Frame::new(aus[0].clone())).unwrap();
    engine
        .push(Frame::new(annex_b(&[
            h265::slice(TRAIL_R, 6, &[-6], &[]),
            h265::end_of_sequence(),
        ])))
        .unwrap();
    assert_eq!(numbers(&pop_all(&mut engine)), vec![(0, Some(0))]);

    engine
        .push(Frame::new(annex_b(&[h265::slice(CRA, 2, &[], &[])])))
        .unwrap();
    assert_eq!(numbers(&pop_all(&mut engine)), vec![(1, Some(1))]);
    assert_eq!(engine.dpb().len(), 1);
}

#[test]
fn access_unit_without_slice_is_rejected() {
    let mut engine = reorder::new(Codec::H265, true);
    engine.set_caps(&Caps::default()).unwrap();
    engine
        .push(Frame::new(annex_b(&[h265::sps(), h265::pps(), h265::idr()])))
        .unwrap();

    let err = engine.push(Frame::new(annex_b(&[h265::aud()]))).unwrap_err();
    assert!(matches!(err, ReorderError::NoSlice));

    engine
        .push(Frame::new(annex_b(&[h265::slice(TRAIL_R, 2, &[-2], &[])])))
        .unwrap();
    engine.drain();
    let frames = pop_all(engine.as_mut());
    assert_eq!(numbers(&frames), vec![(0, Some(0)), (1, Some(1))]);
}

#[test]
fn slice_before_parameter_sets_fails() {
    let mut engine = reorder::new(Codec::H265, true);
    engine.set_caps(&Caps::default()).unwrap();
    let err = engine.push(Frame::new(annex_b(&[h265::idr()]))).unwrap_err();
    assert!(matches!(err, ReorderError::MissingParameterSet { .. }));
    assert_eq!(engine.num_buffered(), 0);
}

#[test]
fn packetized_stream_with_codec_data() {
    let mut engine = reorder::new(Codec::H265, true);
    let latency = engine
        .set_caps(&Caps {
            stream_format: StreamFormat::Packetized,
            framerate: None,
            codec_data: Some(Bytes::from(h265::hvcc(&h265::sps(), &h265::pps()))),
        })
        .unwrap();
    // 16 pictures at the default 25 fps
    assert_eq!(latency, Duration::from_millis(640));

    engine.push(Frame::new(length_prefixed(&[h265::idr()]))).unwrap();
    engine
        .push(Frame::new(length_prefixed(&[h265::slice(TRAIL_R, 2, &[-2], &[])])))
        .unwrap();
    engine.drain();
    assert_eq!(pop_all(engine.as_mut()).len(), 2);
}

#[test]
fn sps_with_predicted_short_term_sets() {
    let sps = reorder::h265::params::Sps::parse(&h265::sps_inter_rps()).unwrap();
    let sets = &sps.short_term_ref_pic_sets;
    assert_eq!(sets.len(), 2);
    assert_eq!(sets[0].delta_poc_s0, vec![-1]);
    assert_eq!(sets[1].delta_poc_s0, vec![-1, -2]);
    assert_eq!(sets[1].used_by_curr_pic_s0, vec![true, true]);
    assert!(sets[1].delta_poc_s1.is_empty());
    assert!(!sps.long_term_ref_pics_present_flag);
}

#[test]
fn slices_select_predicted_sps_sets() {
    let mut engine = H265Reorder::new(true);
    engine.set_caps(&Caps::default()).unwrap();

    engine
        .push(Frame::new(annex_b(&[h265::sps_inter_rps(), h265::pps(), h265::idr()])))
        .unwrap();
    engine
        .push(Frame::new(annex_b(&[h265::slice_sps_rps(TRAIL_R, 1, 0)])))
        .unwrap();
    assert_eq!(numbers(&pop_all(&mut engine)), vec![(0, Some(0))]);

    // set 1 still references the IDR two pictures back
    engine
        .push(Frame::new(annex_b(&[h265::slice_sps_rps(TRAIL_R, 2, 1)])))
        .unwrap();
    let mut pocs: Vec<i32> = engine.dpb().pictures().iter().map(|p| p.pic_order_cnt).collect();
    pocs.sort_unstable();
    assert_eq!(pocs, vec![0, 1, 2]);

    engine.drain();
    assert_eq!(numbers(&pop_all(&mut engine)), vec![(1, Some(1)), (2, Some(2))]);
}

#[test]
fn display_poc_never_decreases() {
    let mut engine = H265Reorder::new(true);
    engine.set_caps(&Caps::default()).unwrap();
    engine
        .push(Frame::new(annex_b(&[h265::sps(), h265::pps(), h265::idr()])))
        .unwrap();

    let mut pocs = vec![0i32];
    let mut frames = Vec::new();
    for k in 1..=4i32 {
        let p = 6 * k;
        let prev = p - 6;
        engine
            .push(Frame::new(annex_b(&[h265::slice(TRAIL_R, p as u64, &[-6], &[])])))
            .unwrap();
        engine
            .push(Frame::new(annex_b(&[h265::slice(TRAIL_N, (p - 4) as u64, &[prev - p + 4], &[4])])))
            .unwrap();
        engine
            .push(Frame::new(annex_b(&[h265::slice(TRAIL_N, (p - 2) as u64, &[prev - p + 2], &[2])])))
            .unwrap();
        pocs.extend([p, p - 4, p - 2]);
        frames.extend(pop_all(&mut engine));
    }
    engine.drain();
    frames.extend(pop_all(&mut engine));
    assert_eq!(frames.len(), pocs.len());

    let mut shown: Vec<(u32, i32)> = frames
        .iter()
        .map(|f| (f.presentation_frame_number.unwrap(), pocs[f.system_frame_number as usize]))
        .collect();
    shown.sort_unstable();
    let shown: Vec<i32> = shown.into_iter().map(|(_, poc)| poc).collect();
    assert!(shown.windows(2).all(|w| w[0] <= w[1]), "{shown:?}");
}
