//! Mux - many child lines over one parent line
//!
//! ```text
//!   child A ─┐                              ┌─ child A'
//!   child B ─┼─ MuxClient ══ parent ══ MuxServer ─┼─ child B'
//!   child C ─┘    (Open/Data/Close/FlowPause/FlowResume frames)   └─ child C'
//! ```
//!
//! The client admits children onto a per-worker "unsatisfied" parent until
//! the parent is exhausted by its concurrency policy, then opens a new one.
//! The server recreates each child as its own line towards the tail.

mod children;
mod client;
pub mod frame;
mod server;

pub use children::{Arena, ChildKey, Children};
pub use client::{MuxClient, MuxPolicy};
pub use server::MuxServer;

use tokio::time::Instant;

use crate::app::metrics::MUX_FRAMES_SENT;
use crate::buffer::{Buffer, BufferStream};
use crate::tunnel::{Hop, Line, PauseReason};

use frame::FrameFlag;

/// State of a parent line
pub(crate) struct ParentState {
    pub children: Children,
    pub stream: BufferStream,
    /// Last connection id handed out (client side)
    pub last_cid: u32,
    pub created_at: Instant,
    /// No longer the worker's unsatisfied parent (client side)
    pub retired: bool,
    /// The next stage asked the parent to stop writing (client side)
    pub paused: bool,
    /// Child whose frame is being written right now (client side)
    pub last_writer: Option<Line>,
}

impl ParentState {
    pub fn new() -> Self {
        Self {
            children: Children::default(),
            stream: BufferStream::new(),
            last_cid: 0,
            created_at: Instant::now(),
            retired: false,
            paused: false,
            last_writer: None,
        }
    }
}

/// State of a child line
pub(crate) struct ChildState {
    pub parent: Line,
    pub cid: u32,
    pub key: ChildKey,
    /// A FlowPause frame was sent for this child and not yet undone
    pub flow_paused: bool,
}

#[derive(Clone, Copy)]
pub(crate) enum Direction {
    Upstream,
    Downstream,
}

/// Write frames on `parent` in order, recording `writer` as the last writer
/// while they are in flight. Returns false if the parent died meanwhile.
pub(crate) fn write_frames(
    hop: Hop<'_>,
    direction: Direction,
    parent: &Line,
    writer: Option<&Line>,
    flag: FrameFlag,
    frames: Vec<Buffer>,
) -> bool {
    if !parent.is_alive() {
        frames.into_iter().for_each(|f| parent.pool().release(f));
        return false;
    }

    let slot = hop.index();
    let _guard = parent.lock();
    parent.with_state(slot, |p: &mut ParentState| p.last_writer = writer.cloned());

    let counter = MUX_FRAMES_SENT.with_label_values(&[hop.tag(), flag.as_str()]);
    for frame in frames {
        counter.inc();
        match direction {
            Direction::Upstream => hop.next_payload(parent, frame),
            Direction::Downstream => hop.prev_payload(parent, frame),
        }
    }

    if !parent.is_alive() {
        return false;
    }
    parent.with_state(slot, |p: &mut ParentState| p.last_writer = None);
    true
}

/// Add (`pause`) or clear one pause reason on the child with `cid`.
/// True only when the child's source must hear about it: the first reason
/// in or the last reason out.
pub(crate) fn mark_child(
    parent: &Line,
    slot: usize,
    cid: u32,
    reason: PauseReason,
    pause: bool,
) -> bool {
    parent
        .with_state(slot, |p: &mut ParentState| {
            p.children.get_mut(cid).map(|c| match pause {
                true => c.paused.pause(reason),
                false => c.paused.resume(reason),
            })
        })
        .flatten()
        .unwrap_or(false)
}

/// Decode a byte run into (flag, cid, payload) triples
#[cfg(test)]
pub(crate) fn decode_frames(mut bytes: &[u8]) -> Vec<(Option<FrameFlag>, u32, Vec<u8>)> {
    use frame::{FrameHeader, FRAME_HEADER_LEN};

    let mut out = Vec::new();
    while let Some(header) = FrameHeader::decode(bytes) {
        let total = FRAME_HEADER_LEN + header.length as usize;
        if bytes.len() < total {
            break;
        }
        out.push((header.flag(), header.cid, bytes[FRAME_HEADER_LEN..total].to_vec()));
        bytes = &bytes[total..];
    }
    out
}

/// Encode one frame as raw bytes
#[cfg(test)]
pub(crate) fn raw_frame(flag: FrameFlag, cid: u32, payload: &[u8]) -> Vec<u8> {
    let header = frame::FrameHeader::new(flag, cid, payload.len() as u16);
    let mut out = header.encode().to_vec();
    out.extend_from_slice(payload);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::testing::{Probe, Recorded};
    use crate::tunnel::Chain;
    use crate::worker::WorkerLoop;

    fn setup(capacity: usize) -> (WorkerLoop, Probe, Probe, Arc<Chain>) {
        let wl = WorkerLoop::standalone();
        let head = Probe::head();
        let tail = Probe::tail().auto_establish();
        let chain = Chain::builder("mux-pair")
            .stage(head.clone())
            .stage(MuxClient::new("mux-client", MuxPolicy::Counter { capacity }))
            .stage(MuxServer::new("mux-server"))
            .stage(tail.clone())
            .build()
            .unwrap();
        (wl, head, tail, chain)
    }

    #[test]
    fn test_round_trip_single_and_multi_frame() {
        let (wl, head, tail, chain) = setup(8);
        let a = head.open(&chain, wl.worker());
        let far = tail.last_line(&chain, wl.worker()).unwrap();

        let big: Vec<u8> = (0..frame::MAX_FRAME_PAYLOAD + 4_000).map(|i| (i % 251) as u8).collect();
        head.send(&chain, &a, b"hello");
        head.send(&chain, &a, &big);

        let mut expected = b"hello".to_vec();
        expected.extend_from_slice(&big);
        assert_eq!(tail.payload_bytes_for(far.id()), expected);

        let reply: Vec<u8> = (0..100_000).map(|i| (i % 13) as u8).collect();
        tail.send(&chain, &far, &reply);
        assert_eq!(head.payload_bytes_for(a.id()), reply);
        assert_eq!(wl.worker().pool().in_use(), 0);
    }

    #[test]
    fn test_closing_one_child_keeps_sibling() {
        let (wl, head, tail, chain) = setup(8);
        let a = head.open(&chain, wl.worker());
        let b = head.open(&chain, wl.worker());
        let far = tail.lines(&chain, wl.worker());
        assert_eq!(far.len(), 2);
        let (far_a, far_b) = (far[0].clone(), far[1].clone());

        head.send(&chain, &a, b"on a");
        head.send(&chain, &b, b"on b");
        head.finish(&chain, &a);

        assert!(!far_a.is_alive());
        assert!(far_b.is_alive());
        assert_eq!(tail.count(|e| *e == Recorded::Finish(far_a.id())), 1);
        assert_eq!(tail.count(|e| *e == Recorded::Finish(far_b.id())), 0);

        let parent = b
            .with_state(1, |c: &mut ChildState| c.parent.clone())
            .unwrap();
        assert!(parent.is_alive());
        assert!(parent.is_established());
        let server_children = parent
            .with_state(2, |p: &mut ParentState| p.children.len())
            .unwrap();
        assert_eq!(server_children, 1);

        head.send(&chain, &b, b" again");
        assert_eq!(tail.payload_bytes_for(far_b.id()), b"on b again".to_vec());
        tail.send(&chain, &far_b, b"back");
        assert_eq!(head.payload_bytes_for(b.id()), b"back".to_vec());
    }

    #[test]
    fn test_flow_control_crosses_the_pair() {
        let (wl, head, tail, chain) = setup(8);
        let a = head.open(&chain, wl.worker());
        let far = tail.last_line(&chain, wl.worker()).unwrap();

        tail.pause(&chain, &far);
        tail.pause(&chain, &far);
        assert_eq!(head.count(|e| *e == Recorded::Pause(a.id())), 1);
        tail.resume(&chain, &far);
        assert_eq!(head.count(|e| *e == Recorded::Resume(a.id())), 1);

        head.pause(&chain, &a);
        assert_eq!(tail.count(|e| *e == Recorded::Pause(far.id())), 1);
        head.resume(&chain, &a);
        assert_eq!(tail.count(|e| *e == Recorded::Resume(far.id())), 1);
    }

    #[test]
    fn test_target_close_while_flow_paused_resumes_first() {
        let (wl, head, tail, chain) = setup(8);
        let a = head.open(&chain, wl.worker());
        let far = tail.last_line(&chain, wl.worker()).unwrap();

        tail.pause(&chain, &far);
        tail.finish(&chain, &far);

        let seen: Vec<Recorded> = head
            .events()
            .into_iter()
            .filter(|e| !matches!(e, Recorded::Establish(_)))
            .collect();
        assert_eq!(
            seen,
            vec![
                Recorded::Pause(a.id()),
                Recorded::Resume(a.id()),
                Recorded::Finish(a.id()),
            ]
        );
        assert!(!a.is_alive());
        assert!(!far.is_alive());
    }

    #[test]
    fn test_children_spread_over_parents_by_capacity() {
        let (wl, head, tail, chain) = setup(2);
        let children: Vec<_> = (0..5).map(|_| head.open(&chain, wl.worker())).collect();
        assert_eq!(tail.lines(&chain, wl.worker()).len(), 5);

        let parents: Vec<Line> = children
            .iter()
            .map(|c| c.with_state(1, |s: &mut ChildState| s.parent.clone()).unwrap())
            .collect();
        assert!(parents[0].ptr_eq(&parents[1]));
        assert!(!parents[1].ptr_eq(&parents[2]));
        assert!(parents[2].ptr_eq(&parents[3]));
        assert!(!parents[3].ptr_eq(&parents[4]));

        for (i, child) in children.iter().enumerate() {
            head.send(&chain, child, format!("child {}", i).as_bytes());
        }
        for (i, far) in tail.lines(&chain, wl.worker()).iter().enumerate() {
            assert_eq!(tail.payload_bytes_for(far.id()), format!("child {}", i).into_bytes());
        }
    }
}
