//! Mux server - turns parent frames back into child lines

use tracing::{debug, trace, warn};

use crate::app::metrics::{MUX_CHILDREN_ACTIVE, MUX_PARENTS_ACTIVE, MUX_PARENT_OVERFLOWS};
use crate::buffer::Buffer;
use crate::tunnel::{Event, Hop, Line, PauseReason, Tunnel};

use super::frame::{self, FrameFlag, FrameHeader, MAX_READ_BUFFER};
use super::{mark_child, write_frames, ChildState, Direction, ParentState};

/// Server half of the mux pair
pub struct MuxServer {
    tag: String,
}

impl MuxServer {
    pub fn new(tag: impl Into<String>) -> Self {
        Self { tag: tag.into() }
    }

    /// Finish every child of a parent; the parent itself belongs to the previous stage
    fn teardown_parent(&self, hop: Hop<'_>, parent: &Line, notify_prev: bool) {
        let slot = hop.index();
        let Some(mut state) = parent.take_state::<ParentState>(slot) else {
            return;
        };
        MUX_PARENTS_ACTIVE.with_label_values(&[&self.tag]).dec();
        debug!(
            "[{}] parent {} gone, finishing {} children",
            self.tag,
            parent,
            state.children.len()
        );

        let _guard = parent.lock();
        for child in state.children.drain() {
            if child.take_state::<ChildState>(slot).is_some() {
                MUX_CHILDREN_ACTIVE.with_label_values(&[&self.tag]).dec();
                hop.next_finish(&child);
                child.destroy();
            }
        }
        drop(state);
        if notify_prev && parent.is_alive() {
            hop.prev_finish(parent);
        }
    }

    fn open_child(&self, hop: Hop<'_>, parent: &Line, cid: u32) {
        let slot = hop.index();
        let child = hop.create_line(parent.worker());
        *child.routing_mut() = parent.routing().clone();

        let key = parent
            .with_state(slot, |p: &mut ParentState| p.children.attach(cid, child.clone()))
            .flatten();
        let Some(key) = key else {
            warn!("[{}] duplicate open for cid {} on {}", self.tag, cid, parent);
            child.destroy();
            return;
        };
        child.set_state(
            slot,
            ChildState {
                parent: parent.clone(),
                cid,
                key,
                flow_paused: false,
            },
        );
        MUX_CHILDREN_ACTIVE.with_label_values(&[&self.tag]).inc();
        trace!("[{}] cid {} on {} opened as {}", self.tag, cid, parent, child);

        let _guard = child.lock();
        hop.next_init(&child);
    }

    fn close_child(&self, hop: Hop<'_>, parent: &Line, child: &Line) {
        let slot = hop.index();
        let Some(state) = child.take_state::<ChildState>(slot) else {
            return;
        };
        parent.with_state(slot, |p: &mut ParentState| p.children.detach(state.key));
        MUX_CHILDREN_ACTIVE.with_label_values(&[&self.tag]).dec();
        hop.next_finish(child);
        child.destroy();
    }

    fn dispatch_frame(&self, hop: Hop<'_>, parent: &Line, header: FrameHeader, payload: Buffer) {
        let slot = hop.index();
        if header.flag() == Some(FrameFlag::Open) {
            parent.pool().release(payload);
            self.open_child(hop, parent, header.cid);
            return;
        }

        let child = parent
            .with_state(slot, |p: &mut ParentState| p.children.line(header.cid))
            .flatten();
        let Some(child) = child else {
            trace!("[{}] frame for unknown cid {}", self.tag, header.cid);
            parent.pool().release(payload);
            return;
        };

        match header.flag() {
            Some(FrameFlag::Data) => hop.next_payload(&child, payload),
            Some(FrameFlag::FlowPause) => {
                parent.pool().release(payload);
                if mark_child(parent, slot, header.cid, PauseReason::Flow, true) {
                    hop.next_pause(&child);
                }
            }
            Some(FrameFlag::FlowResume) => {
                parent.pool().release(payload);
                if mark_child(parent, slot, header.cid, PauseReason::Flow, false) {
                    hop.next_resume(&child);
                }
            }
            Some(FrameFlag::Close) => {
                parent.pool().release(payload);
                self.close_child(hop, parent, &child);
            }
            Some(FrameFlag::Open) | None => {
                warn!(
                    "[{}] unexpected frame flag {} for cid {}",
                    self.tag, header.flags, header.cid
                );
                parent.pool().release(payload);
            }
        }
    }

    /// Fan a parent-level signal out to every child whose pause state flips
    fn fan_out(&self, hop: Hop<'_>, parent: &Line, pause: bool, event: Event) {
        let children = parent.with_state(hop.index(), |p: &mut ParentState| {
            p.children
                .iter_mut()
                .filter_map(|c| {
                    let flipped = match pause {
                        true => c.paused.pause(PauseReason::Peer),
                        false => c.paused.resume(PauseReason::Peer),
                    };
                    flipped.then(|| c.line.clone())
                })
                .collect::<Vec<_>>()
        });
        let Some(children) = children else {
            hop.violation(event);
        };

        let _guard = parent.lock();
        for child in children {
            if !parent.is_alive() {
                break;
            }
            if !child.is_alive() {
                continue;
            }
            if pause {
                hop.next_pause(&child);
            } else {
                hop.next_resume(&child);
            }
        }
    }

    fn send_control(&self, hop: Hop<'_>, child: &Line, flag: FrameFlag, pause: bool) {
        let target = child.with_state(hop.index(), |c: &mut ChildState| {
            if c.flow_paused == pause {
                return None;
            }
            c.flow_paused = pause;
            Some((c.parent.clone(), c.cid))
        });
        let target = match target {
            Some(Some(target)) => target,
            Some(None) => return,
            None if child.has_state::<ParentState>(hop.index()) => hop.violation(if pause {
                Event::DownstreamPause
            } else {
                Event::DownstreamResume
            }),
            None => return,
        };
        let (parent, cid) = target;
        let frames = vec![frame::control_frame(child.pool(), flag, cid)];
        write_frames(hop, Direction::Downstream, &parent, Some(child), flag, frames);
    }
}

impl Tunnel for MuxServer {
    fn tag(&self) -> &str {
        &self.tag
    }

    fn upstream_init(&self, hop: Hop<'_>, line: &Line) {
        line.set_state(hop.index(), ParentState::new());
        MUX_PARENTS_ACTIVE.with_label_values(&[&self.tag]).inc();
        debug!("[{}] parent {} accepted", self.tag, line);
        hop.prev_establish(line);
    }

    fn upstream_establish(&self, hop: Hop<'_>, _line: &Line) {
        hop.violation(Event::UpstreamEstablish);
    }

    fn upstream_payload(&self, hop: Hop<'_>, line: &Line, buf: Buffer) {
        let slot = hop.index();
        if !line.has_state::<ParentState>(slot) {
            if line.has_state::<ChildState>(slot) {
                hop.violation(Event::UpstreamPayload);
            }
            line.pool().release(buf);
            return;
        }

        let pool = line.pool();
        let overflow = line.with_state(slot, |p: &mut ParentState| {
            p.stream.push(pool, buf);
            p.stream.len() > MAX_READ_BUFFER
        });
        if overflow == Some(true) {
            warn!("[{}] parent {} read buffer overflow", self.tag, line);
            MUX_PARENT_OVERFLOWS.inc();
            self.teardown_parent(hop, line, true);
            return;
        }

        let _guard = line.lock();
        while line.is_alive() {
            let next = line
                .with_state(slot, |p: &mut ParentState| frame::next_frame(&mut p.stream, pool))
                .flatten();
            let Some((header, payload)) = next else {
                break;
            };
            self.dispatch_frame(hop, line, header, payload);
        }
    }

    fn upstream_pause(&self, hop: Hop<'_>, line: &Line) {
        self.fan_out(hop, line, true, Event::UpstreamPause);
    }

    fn upstream_resume(&self, hop: Hop<'_>, line: &Line) {
        self.fan_out(hop, line, false, Event::UpstreamResume);
    }

    fn upstream_finish(&self, hop: Hop<'_>, line: &Line) {
        if line.has_state::<ChildState>(hop.index()) {
            hop.violation(Event::UpstreamFinish);
        }
        self.teardown_parent(hop, line, false);
    }

    fn downstream_init(&self, hop: Hop<'_>, _line: &Line) {
        hop.violation(Event::DownstreamInit);
    }

    fn downstream_establish(&self, hop: Hop<'_>, line: &Line) {
        if !line.has_state::<ChildState>(hop.index()) {
            hop.violation(Event::DownstreamEstablish);
        }
        line.mark_established();
    }

    fn downstream_payload(&self, hop: Hop<'_>, line: &Line, buf: Buffer) {
        let target = line.with_state(hop.index(), |c: &mut ChildState| (c.parent.clone(), c.cid));
        let Some((parent, cid)) = target else {
            line.pool().release(buf);
            return;
        };
        let frames = frame::data_frames(line.pool(), cid, buf);
        write_frames(hop, Direction::Downstream, &parent, Some(line), FrameFlag::Data, frames);
    }

    fn downstream_pause(&self, hop: Hop<'_>, line: &Line) {
        self.send_control(hop, line, FrameFlag::FlowPause, true);
    }

    fn downstream_resume(&self, hop: Hop<'_>, line: &Line) {
        self.send_control(hop, line, FrameFlag::FlowResume, false);
    }

    fn downstream_finish(&self, hop: Hop<'_>, line: &Line) {
        let slot = hop.index();
        let Some(child) = line.take_state::<ChildState>(slot) else {
            if line.has_state::<ParentState>(slot) {
                hop.violation(Event::DownstreamFinish);
            }
            return;
        };
        MUX_CHILDREN_ACTIVE.with_label_values(&[&self.tag]).dec();
        let parent = child.parent;
        parent.with_state(slot, |p: &mut ParentState| p.children.detach(child.key));
        trace!("[{}] {} (cid {}) closed by target", self.tag, line, child.cid);

        let _guard = line.lock();
        let mut open = true;
        if child.flow_paused {
            let resume = vec![frame::control_frame(line.pool(), FrameFlag::FlowResume, child.cid)];
            open = write_frames(hop, Direction::Downstream, &parent, None, FrameFlag::FlowResume, resume);
        }
        if open {
            let close = vec![frame::control_frame(line.pool(), FrameFlag::Close, child.cid)];
            write_frames(hop, Direction::Downstream, &parent, None, FrameFlag::Close, close);
        }
        line.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::mux::{decode_frames, raw_frame};
    use crate::testing::{Probe, Recorded};
    use crate::tunnel::Chain;
    use crate::worker::WorkerLoop;

    fn setup() -> (WorkerLoop, Probe, Probe, Arc<Chain>) {
        let wl = WorkerLoop::standalone();
        let head = Probe::head();
        let tail = Probe::tail().auto_establish();
        let chain = Chain::builder("mux-server")
            .stage(head.clone())
            .stage(MuxServer::new("mux"))
            .stage(tail.clone())
            .build()
            .unwrap();
        (wl, head, tail, chain)
    }

    fn frames(parts: &[Vec<u8>]) -> Vec<u8> {
        parts.concat()
    }

    fn child_count(parent: &Line) -> usize {
        parent
            .with_state(1, |p: &mut ParentState| p.children.len())
            .unwrap_or(0)
    }

    #[test]
    fn test_open_creates_children_and_parent_finish_closes_them() {
        let (wl, head, tail, chain) = setup();
        let parent = head.open(&chain, wl.worker());
        assert_eq!(head.events(), vec![Recorded::Establish(parent.id())]);

        head.send(
            &chain,
            &parent,
            &frames(&[
                raw_frame(FrameFlag::Open, 1, b""),
                raw_frame(FrameFlag::Open, 2, b""),
                raw_frame(FrameFlag::Data, 1, b"x"),
            ]),
        );
        let children = tail.lines(&chain, wl.worker());
        assert_eq!(children.len(), 2);
        assert!(children.iter().all(|c| c.is_established()));
        assert_eq!(tail.payload_bytes_for(children[0].id()), b"x".to_vec());
        assert_eq!(child_count(&parent), 2);

        tail.send(&chain, &children[1], b"yo");
        assert_eq!(
            decode_frames(&head.payload_bytes_for(parent.id())),
            vec![(Some(FrameFlag::Data), 2, b"yo".to_vec())]
        );

        head.finish(&chain, &parent);
        assert!(children.iter().all(|c| !c.is_alive()));
        assert_eq!(tail.count(|e| matches!(e, Recorded::Finish(_))), 2);
        assert!(tail.lines(&chain, wl.worker()).is_empty());
        assert_eq!(wl.worker().pool().in_use(), 0);
    }

    #[test]
    fn test_parent_pause_fans_out() {
        let (wl, head, tail, chain) = setup();
        let parent = head.open(&chain, wl.worker());
        head.send(
            &chain,
            &parent,
            &frames(&[raw_frame(FrameFlag::Open, 1, b""), raw_frame(FrameFlag::Open, 2, b"")]),
        );
        let children = tail.lines(&chain, wl.worker());

        head.pause(&chain, &parent);
        head.resume(&chain, &parent);
        for child in &children {
            assert_eq!(tail.count(|e| *e == Recorded::Pause(child.id())), 1);
            assert_eq!(tail.count(|e| *e == Recorded::Resume(child.id())), 1);
        }
    }

    #[test]
    fn test_duplicate_open_and_unknown_cid_are_ignored() {
        let (wl, head, tail, chain) = setup();
        let parent = head.open(&chain, wl.worker());
        head.send(
            &chain,
            &parent,
            &frames(&[
                raw_frame(FrameFlag::Open, 1, b""),
                raw_frame(FrameFlag::Open, 1, b""),
                raw_frame(FrameFlag::Data, 7, b"lost"),
                raw_frame(FrameFlag::Close, 7, b""),
            ]),
        );

        assert_eq!(tail.lines(&chain, wl.worker()).len(), 1);
        assert_eq!(child_count(&parent), 1);
        assert!(tail.payloads().is_empty());
        assert!(parent.is_alive());
        assert_eq!(wl.worker().pool().in_use(), 0);
    }

    #[test]
    fn test_refused_child_sends_close() {
        let (wl, head, tail, chain) = setup();
        let parent = head.open(&chain, wl.worker());
        tail.reject_next_inits(1);

        head.send(&chain, &parent, &raw_frame(FrameFlag::Open, 1, b""));
        assert_eq!(
            decode_frames(&head.payload_bytes_for(parent.id())),
            vec![(Some(FrameFlag::Close), 1, vec![])]
        );
        assert_eq!(child_count(&parent), 0);
        assert!(parent.is_alive());
    }

    #[test]
    fn test_target_pause_then_close() {
        let (wl, head, tail, chain) = setup();
        let parent = head.open(&chain, wl.worker());
        head.send(&chain, &parent, &raw_frame(FrameFlag::Open, 3, b""));
        let child = tail.last_line(&chain, wl.worker()).unwrap();

        tail.pause(&chain, &child);
        tail.pause(&chain, &child);
        tail.finish(&chain, &child);

        assert!(!child.is_alive());
        assert_eq!(
            decode_frames(&head.payload_bytes_for(parent.id())),
            vec![
                (Some(FrameFlag::FlowPause), 3, vec![]),
                (Some(FrameFlag::FlowResume), 3, vec![]),
                (Some(FrameFlag::Close), 3, vec![]),
            ]
        );
        assert_eq!(child_count(&parent), 0);
    }

    #[test]
    fn test_flow_frames_reach_target() {
        let (wl, head, tail, chain) = setup();
        let parent = head.open(&chain, wl.worker());
        head.send(&chain, &parent, &raw_frame(FrameFlag::Open, 1, b""));
        let child = tail.last_line(&chain, wl.worker()).unwrap();

        head.send(
            &chain,
            &parent,
            &frames(&[
                raw_frame(FrameFlag::FlowPause, 1, b""),
                raw_frame(FrameFlag::FlowResume, 1, b""),
                raw_frame(FrameFlag::Close, 1, b""),
            ]),
        );
        let events: Vec<Recorded> = tail
            .events()
            .into_iter()
            .filter(|e| !matches!(e, Recorded::Init(_)))
            .collect();
        assert_eq!(
            events,
            vec![
                Recorded::Pause(child.id()),
                Recorded::Resume(child.id()),
                Recorded::Finish(child.id()),
            ]
        );
        assert!(!child.is_alive());
    }

    #[test]
    fn test_flow_resume_keeps_child_paused_while_parent_stalled() {
        let (wl, head, tail, chain) = setup();
        let parent = head.open(&chain, wl.worker());
        head.send(&chain, &parent, &raw_frame(FrameFlag::Open, 1, b""));
        let child = tail.last_line(&chain, wl.worker()).unwrap();

        head.pause(&chain, &parent);
        head.send(&chain, &parent, &raw_frame(FrameFlag::FlowPause, 1, b""));
        head.send(&chain, &parent, &raw_frame(FrameFlag::FlowResume, 1, b""));
        assert!(child.is_read_paused());
        assert_eq!(tail.count(|e| *e == Recorded::Pause(child.id())), 1);
        assert_eq!(tail.count(|e| *e == Recorded::Resume(child.id())), 0);

        head.resume(&chain, &parent);
        assert!(!child.is_read_paused());
        assert_eq!(tail.count(|e| *e == Recorded::Resume(child.id())), 1);
    }

    #[test]
    fn test_parent_resume_keeps_flow_paused_child() {
        let (wl, head, tail, chain) = setup();
        let parent = head.open(&chain, wl.worker());
        head.send(&chain, &parent, &raw_frame(FrameFlag::Open, 1, b""));
        let child = tail.last_line(&chain, wl.worker()).unwrap();

        head.send(&chain, &parent, &raw_frame(FrameFlag::FlowPause, 1, b""));
        head.pause(&chain, &parent);
        head.resume(&chain, &parent);
        assert!(child.is_read_paused());
        assert_eq!(tail.count(|e| *e == Recorded::Pause(child.id())), 1);
        assert_eq!(tail.count(|e| *e == Recorded::Resume(child.id())), 0);

        head.send(&chain, &parent, &raw_frame(FrameFlag::FlowResume, 1, b""));
        assert!(!child.is_read_paused());
        assert_eq!(tail.count(|e| *e == Recorded::Resume(child.id())), 1);
    }

    #[test]
    fn test_read_overflow_finishes_parent() {
        let (wl, head, tail, chain) = setup();
        let parent = head.open(&chain, wl.worker());
        head.send(&chain, &parent, &raw_frame(FrameFlag::Open, 1, b""));
        let child = tail.last_line(&chain, wl.worker()).unwrap();

        head.send(&chain, &parent, &vec![0u8; MAX_READ_BUFFER + 1]);
        assert!(!child.is_alive());
        assert!(!parent.is_alive());
        assert_eq!(head.count(|e| *e == Recorded::Finish(parent.id())), 1);
        assert_eq!(wl.worker().pool().in_use(), 0);
    }
}
