//! Coded frames and the queues that hold them while their display slot is
//! resolved.
//!
//! Frames enter the pending queue in decode order. When the DPB bumps a
//! picture, the frame that produced it receives the next presentation
//! number `p`, and its output buffer becomes the input buffer of the frame
//! whose decode number is `p`. Frames leave the pending queue for the output
//! queue strictly from the head, once their output buffer is known.

use std::collections::VecDeque;

use bytes::Bytes;

/// One coded access unit travelling through the reorder engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Decode-order number, assigned on push.
    pub system_frame_number: u32,
    /// Display-order number, assigned when the frame's picture is bumped.
    pub presentation_frame_number: Option<u32>,
    /// Access unit as pushed (caption SEI already removed).
    pub input: Bytes,
    /// Buffer occupying this frame's slot on output.
    pub output: Option<Bytes>,
}

impl Frame {
    pub fn new(input: impl Into<Bytes>) -> Self {
        Frame {
            system_frame_number: 0,
            presentation_frame_number: None,
            input: input.into(),
            output: None,
        }
    }
}

/// Pending and output queues with their decode and display counters.
#[derive(Debug, Default)]
pub struct FrameQueue {
    pending: VecDeque<Frame>,
    output: VecDeque<Frame>,
    system_num: u32,
    present_num: u32,
}

impl FrameQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stamps the next decode-order number on `frame`.
    pub fn number(&mut self, frame: &mut Frame) {
        frame.system_frame_number = self.system_num;
        self.system_num = self.system_num.wrapping_add(1);
    }

    /// Queues a frame that waits for its display slot.
    pub fn enqueue(&mut self, frame: Frame) {
        self.pending.push_back(frame);
    }

    /// Hands a frame straight to the output queue (reordering disabled).
    pub fn pass_through(&mut self, mut frame: Frame) {
        frame.presentation_frame_number = Some(frame.system_frame_number);
        frame.output = Some(frame.input.clone());
        self.output.push_back(frame);
    }

    /// Removes a frame whose access unit could not be tracked and gives its
    /// decode number back.
    pub fn rollback(&mut self, system_frame_number: u32) {
        if let Some(idx) = self
            .pending
            .iter()
            .position(|f| f.system_frame_number == system_frame_number)
        {
            self.pending.remove(idx);
        }
        self.system_num = self.system_num.wrapping_sub(1);
    }

    /// Assigns the next presentation slot to the frame with the given decode
    /// number.
    pub fn set_output_buffer(&mut self, system_frame_number: u32) {
        let Some(idx) = self
            .pending
            .iter()
            .position(|f| f.system_frame_number == system_frame_number)
        else {
            return;
        };
        if self.pending[idx].output.is_some() {
            return;
        }

        let present = self.present_num;
        tracing::trace!(
            decode = system_frame_number,
            display = present,
            "presentation slot assigned"
        );
        self.pending[idx].presentation_frame_number = Some(present);
        self.present_num = self.present_num.wrapping_add(1);

        let source = self
            .pending
            .iter()
            .find(|f| f.system_frame_number == present)
            .map(|f| f.input.clone());
        if let Some(source) = source {
            self.pending[idx].output = Some(source);
        }
    }

    /// Moves frames whose output buffer is known from the head of the
    /// pending queue to the output queue.
    pub fn promote(&mut self) {
        while self.pending.front().is_some_and(|f| f.output.is_some()) {
            if let Some(frame) = self.pending.pop_front() {
                self.output.push_back(frame);
            }
        }
    }

    /// Flushes every pending frame except `current` after the DPB was
    /// drained, and rebases the presentation counter.
    pub fn flush(&mut self, current: Option<u32>) {
        while let Some(front) = self.pending.front() {
            if Some(front.system_frame_number) == current {
                break;
            }
            let Some(mut frame) = self.pending.pop_front() else {
                break;
            };
            if frame.output.is_none() {
                tracing::warn!(
                    decode = frame.system_frame_number,
                    "remaining frame after drain"
                );
                frame.output = Some(frame.input.clone());
            }
            self.output.push_back(frame);
        }

        self.present_num = current.unwrap_or(self.system_num);
    }

    /// Returns the next frame whose output buffer is resolved.
    pub fn pop(&mut self) -> Option<Frame> {
        let frame = self.output.pop_front();
        if frame.is_none() {
            tracing::trace!(pending = self.pending.len(), "empty output queue");
        }
        frame
    }

    /// Frames held in either queue.
    pub fn len(&self) -> usize {
        self.pending.len() + self.output.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue_with(n: u32) -> FrameQueue {
        let mut q = FrameQueue::new();
        for i in 0..n {
            let mut frame = Frame::new(vec![i as u8]);
            q.number(&mut frame);
            q.enqueue(frame);
        }
        q
    }

    #[test]
    fn output_buffer_comes_from_presentation_slot() {
        let mut q = queue_with(3);
        q.set_output_buffer(0);
        q.set_output_buffer(2);
        q.promote();

        let first = q.pop().unwrap();
        assert_eq!(first.presentation_frame_number, Some(0));
        assert_eq!(first.output.as_deref(), Some(&[0u8][..]));
        // frame 1 has no slot yet, so frame 2 stays behind it
        assert!(q.pop().is_none());
        assert_eq!(q.len(), 2);

        q.set_output_buffer(1);
        q.promote();
        let second = q.pop().unwrap();
        assert_eq!(second.system_frame_number, 1);
        assert_eq!(second.presentation_frame_number, Some(2));
        assert_eq!(second.output.as_deref(), Some(&[2u8][..]));
        let third = q.pop().unwrap();
        assert_eq!(third.output.as_deref(), Some(&[1u8][..]));
    }

    #[test]
    fn set_output_buffer_is_applied_once() {
        let mut q = queue_with(2);
        q.set_output_buffer(0);
        q.set_output_buffer(0);
        q.set_output_buffer(1);
        q.promote();
        assert_eq!(q.pop().unwrap().presentation_frame_number, Some(0));
        assert_eq!(q.pop().unwrap().presentation_frame_number, Some(1));
    }

    #[test]
    fn flush_keeps_current_frame() {
        let mut q = queue_with(3);
        q.flush(Some(2));
        assert_eq!(q.pending_len(), 1);
        let a = q.pop().unwrap();
        assert_eq!(a.output, Some(a.input.clone()));
        q.pop().unwrap();
        assert!(q.pop().is_none());
    }

    #[test]
    fn rollback_returns_decode_number() {
        let mut q = queue_with(2);
        q.rollback(1);
        let mut frame = Frame::new(vec![9]);
        q.number(&mut frame);
        assert_eq!(frame.system_frame_number, 1);
        assert_eq!(q.pending_len(), 1);
    }

    #[test]
    fn pass_through_outputs_immediately() {
        let mut q = FrameQueue::new();
        let mut frame = Frame::new(vec![1, 2]);
        q.number(&mut frame);
        q.pass_through(frame);
        let out = q.pop().unwrap();
        assert_eq!(out.output.as_deref(), Some(&[1u8, 2][..]));
        assert!(q.is_empty());
    }
}
