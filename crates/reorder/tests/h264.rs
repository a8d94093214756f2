//! H.264 decode-order to display-order scenarios on synthetic streams.

mod support;

use std::time::Duration;

use bytes::Bytes;
use reorder::{Caps, Codec, Frame, Reorder, ReorderError, StreamFormat};
use support::{annex_b, h264, length_prefixed};

fn engine() -> Box<dyn Reorder> {
    let mut engine = reorder::new(Codec::H264, true);
    engine.set_caps(&Caps::default()).unwrap();
    engine
}

fn pop_all(engine: &mut dyn Reorder) -> Vec<Frame> {
    std::iter::from_fn(|| engine.pop()).collect()
}

/// I0 P6 b2 b4 in decode order: one frame of reordering.
fn ipbb() -> Vec<Vec<u8>> {
    vec![
        annex_b(&[h264::sps(20, 15, false), h264::pps(), h264::idr(0)]),
        annex_b(&[h264::p(1, 6)]),
        annex_b(&[h264::b(2, 2)]),
        annex_b(&[h264::b(2, 4)]),
    ]
}

#[test]
fn b_frames_resolve_in_display_order() {
    let mut engine = engine();
    let aus = ipbb();

    engine.push(Frame::new(aus[0].clone())).unwrap();
    engine.push(Frame::new(aus[1].clone())).unwrap();
    assert!(engine.pop().is_none());

    // the first B frame pushes the IDR out
    engine.push(Frame::new(aus[2].clone())).unwrap();
    let f0 = engine.pop().unwrap();
    assert_eq!(f0.system_frame_number, 0);
    assert_eq!(f0.presentation_frame_number, Some(0));
    assert_eq!(f0.output.as_deref(), Some(&aus[0][..]));

    engine.push(Frame::new(aus[3].clone())).unwrap();
    // frame 1 (the P picture) is still waiting, and holds frames 2 and 3
    assert!(engine.pop().is_none());
    assert_eq!(engine.num_buffered(), 3);

    engine.drain();
    let rest = pop_all(engine.as_mut());
    let order: Vec<(u32, Option<u32>)> = rest
        .iter()
        .map(|f| (f.system_frame_number, f.presentation_frame_number))
        .collect();
    assert_eq!(order, vec![(1, Some(3)), (2, Some(1)), (3, Some(2))]);
    assert_eq!(rest[0].output.as_deref(), Some(&aus[3][..]));
    assert_eq!(rest[1].output.as_deref(), Some(&aus[1][..]));
    assert_eq!(rest[2].output.as_deref(), Some(&aus[2][..]));
    assert_eq!(engine.num_buffered(), 0);
}

#[test]
fn second_drain_outputs_nothing() {
    let mut engine = engine();
    for au in ipbb() {
        engine.push(Frame::new(au)).unwrap();
    }
    engine.drain();
    assert_eq!(pop_all(engine.as_mut()).len(), 4);

    engine.drain();
    assert!(engine.pop().is_none());
    assert_eq!(engine.num_buffered(), 0);
}

#[test]
fn frame_num_gap_fills_reference_slots() {
    let mut engine = engine();
    engine
        .push(Frame::new(annex_b(&[h264::sps(20, 15, true), h264::pps(), h264::idr(0)])))
        .unwrap();
    assert!(engine.pop().is_none());

    // frame_num jumps from 0 to 3; the two missing reference frames evict
    // the IDR from the two-frame buffer
    engine.push(Frame::new(annex_b(&[h264::p(3, 6)]))).unwrap();
    let f0 = engine.pop().unwrap();
    assert_eq!(f0.system_frame_number, 0);
    assert_eq!(f0.presentation_frame_number, Some(0));

    engine.drain();
    let f1 = engine.pop().unwrap();
    assert_eq!(f1.system_frame_number, 1);
    assert_eq!(f1.presentation_frame_number, Some(1));
    assert_eq!(f1.output, Some(f1.input.clone()));
}

#[test]
fn resolution_change_drains_prior_pictures() {
    let mut engine = engine();
    let aus = ipbb();
    engine.push(Frame::new(aus[0].clone())).unwrap();
    engine.push(Frame::new(aus[1].clone())).unwrap();
    assert!(engine.pop().is_none());

    engine
        .push(Frame::new(annex_b(&[h264::sps(40, 30, false), h264::pps(), h264::idr(1)])))
        .unwrap();
    let drained = pop_all(engine.as_mut());
    let numbers: Vec<u32> = drained.iter().map(|f| f.system_frame_number).collect();
    assert_eq!(numbers, vec![0, 1]);
    assert_eq!(engine.num_buffered(), 1);

    engine.drain();
    let f2 = engine.pop().unwrap();
    assert_eq!(f2.system_frame_number, 2);
    assert_eq!(f2.presentation_frame_number, Some(2));
}

#[test]
fn undecodable_frame_is_dropped_without_consuming_a_number() {
    let mut engine = engine();
    let aus = ipbb();
    engine.push(Frame::new(aus[0].clone())).unwrap();

    let err = engine.push(Frame::new(annex_b(&[h264::aud()]))).unwrap_err();
    assert!(matches!(err, ReorderError::NoSlice));

    // slice header cut off after the NAL header
    let err = engine.push(Frame::new(annex_b(&[vec![0x41]]))).unwrap_err();
    assert!(matches!(err, ReorderError::Bitstream(_)));

    engine.push(Frame::new(aus[1].clone())).unwrap();
    engine.drain();
    let numbers: Vec<u32> = pop_all(engine.as_mut())
        .iter()
        .map(|f| f.system_frame_number)
        .collect();
    assert_eq!(numbers, vec![0, 1]);
}

#[test]
fn packetized_stream_with_codec_data() {
    let sps = h264::sps(20, 15, false);
    let pps = h264::pps();
    let mut engine = reorder::new(Codec::H264, true);
    let latency = engine
        .set_caps(&Caps {
            stream_format: StreamFormat::Packetized,
            framerate: Some((30, 1)),
            codec_data: Some(Bytes::from(h264::avcc(&sps, &pps))),
        })
        .unwrap();
    assert_eq!(latency, Duration::from_nanos(66_666_666));

    engine.push(Frame::new(length_prefixed(&[h264::idr(0)]))).unwrap();
    engine.push(Frame::new(length_prefixed(&[h264::p(1, 2)]))).unwrap();
    engine.drain();
    assert_eq!(pop_all(engine.as_mut()).len(), 2);
}

#[test]
fn disabled_engine_passes_frames_through() {
    let mut engine = reorder::new(Codec::H264, false);
    let latency = engine.set_caps(&Caps::default()).unwrap();
    assert_eq!(latency, Duration::ZERO);

    for au in ipbb() {
        engine.push(Frame::new(au)).unwrap();
    }
    let frames = pop_all(engine.as_mut());
    assert_eq!(frames.len(), 4);
    for f in frames {
        assert_eq!(f.presentation_frame_number, Some(f.system_frame_number));
        assert_eq!(f.output, Some(f.input));
    }
}

/// Display-order POCs of `frames`, given the POC of every pushed frame in
/// decode order.
fn display_pocs(frames: &[Frame], pocs: &[i32]) -> Vec<i32> {
    let mut by_slot: Vec<(u32, i32)> = frames
        .iter()
        .map(|f| {
            let slot = f.presentation_frame_number.expect("frame left without a display slot");
            (slot, pocs[f.system_frame_number as usize])
        })
        .collect();
    by_slot.sort_unstable();
    by_slot.into_iter().map(|(_, poc)| poc).collect()
}

#[test]
fn one_frame_of_reordering_sorts_by_poc() {
    let mut engine = engine();
    let aus = [
        annex_b(&[h264::sps(20, 15, false), h264::pps(), h264::idr(0)]),
        annex_b(&[h264::p(1, 4)]),
        annex_b(&[h264::b(2, 2)]),
        annex_b(&[h264::p(2, 6)]),
    ];
    for au in aus {
        engine.push(Frame::new(au)).unwrap();
    }
    engine.drain();

    let frames = pop_all(engine.as_mut());
    assert_eq!(frames.len(), 4);
    let order: Vec<(u32, Option<u32>)> = frames
        .iter()
        .map(|f| (f.system_frame_number, f.presentation_frame_number))
        .collect();
    assert_eq!(order, vec![(0, Some(0)), (1, Some(2)), (2, Some(1)), (3, Some(3))]);
    assert_eq!(display_pocs(&frames, &[0, 4, 2, 6]), vec![0, 2, 4, 6]);
}

#[test]
fn display_poc_never_decreases() {
    let mut engine = engine();
    let mut pocs = vec![0];
    engine
        .push(Frame::new(annex_b(&[h264::sps(20, 15, false), h264::pps(), h264::idr(0)])))
        .unwrap();

    let mut frames = Vec::new();
    for k in 1..=4u64 {
        let p = 6 * k;
        engine.push(Frame::new(annex_b(&[h264::p(k, p)]))).unwrap();
        engine.push(Frame::new(annex_b(&[h264::b(k + 1, p - 4)]))).unwrap();
        engine.push(Frame::new(annex_b(&[h264::b(k + 1, p - 2)]))).unwrap();
        pocs.extend([p as i32, p as i32 - 4, p as i32 - 2]);
        frames.extend(pop_all(engine.as_mut()));
    }
    engine.drain();
    frames.extend(pop_all(engine.as_mut()));

    assert_eq!(frames.len(), pocs.len());
    let shown = display_pocs(&frames, &pocs);
    assert!(shown.windows(2).all(|w| w[0] <= w[1]), "{shown:?}");
    let mut sorted = pocs.clone();
    sorted.sort_unstable();
    assert_eq!(shown, sorted);
}

#[test]
fn frame_num_gap_keeps_every_frame_in_place() {
    let mut engine = engine();
    let aus = [
        annex_b(&[h264::sps(20, 15, true), h264::pps(), h264::idr(0)]),
        annex_b(&[h264::p(1, 2)]),
        annex_b(&[h264::p(3, 6)]),
    ];
    for au in aus {
        engine.push(Frame::new(au)).unwrap();
    }
    engine.drain();

    let frames = pop_all(engine.as_mut());
    assert_eq!(frames.len(), 3);
    for f in frames {
        assert_eq!(f.presentation_frame_number, Some(f.system_frame_number));
        assert_eq!(f.output, Some(f.input));
    }
}
