//! Mux client - admits child lines onto shared parent lines

use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::app::metrics::{MUX_CHILDREN_ACTIVE, MUX_PARENTS_ACTIVE, MUX_PARENT_OVERFLOWS};
use crate::buffer::Buffer;
use crate::tunnel::{Event, Hop, Line, PauseReason, Tunnel};

use super::frame::{self, FrameFlag, FrameHeader, MAX_READ_BUFFER};
use super::{mark_child, write_frames, ChildState, Direction, ParentState};

/// When a parent stops accepting new children
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MuxPolicy {
    /// At most `capacity` live children per parent
    Counter { capacity: usize },
    /// New children only during the first `duration` of a parent's life
    Timer { duration: Duration },
}

/// Per-worker admission state
#[derive(Default)]
struct ClientLocal {
    unsatisfied: Option<Line>,
}

/// Client half of the mux pair
pub struct MuxClient {
    tag: String,
    policy: MuxPolicy,
}

impl MuxClient {
    pub fn new(tag: impl Into<String>, policy: MuxPolicy) -> Self {
        Self {
            tag: tag.into(),
            policy,
        }
    }

    fn is_exhausted(&self, parent: &ParentState) -> bool {
        if parent.last_cid == u32::MAX {
            return true;
        }
        match self.policy {
            MuxPolicy::Counter { capacity } => parent.children.len() >= capacity,
            MuxPolicy::Timer { duration } => parent.created_at.elapsed() >= duration,
        }
    }

    fn should_close(&self, parent: &ParentState) -> bool {
        parent.children.is_empty() && (parent.retired || self.is_exhausted(parent))
    }

    fn forget_unsatisfied(&self, hop: Hop<'_>, parent: &Line) {
        hop.worker_local::<ClientLocal, _>(parent.worker(), |local| {
            if local.unsatisfied.as_ref().is_some_and(|u| u.ptr_eq(parent)) {
                local.unsatisfied = None;
            }
        });
    }

    /// Create a parent and run its Init; `None` if the next stage refused it
    fn open_parent(&self, hop: Hop<'_>, child: &Line) -> Option<Line> {
        let slot = hop.index();
        let parent = hop.create_line(child.worker());
        *parent.routing_mut() = child.routing().clone();
        parent.set_state(slot, ParentState::new());
        MUX_PARENTS_ACTIVE.with_label_values(&[&self.tag]).inc();
        debug!("[{}] opening parent {}", self.tag, parent);

        {
            let _guard = parent.lock();
            hop.next_init(&parent);
            if !parent.is_alive() {
                return None;
            }
        }

        hop.worker_local::<ClientLocal, _>(child.worker(), |local| {
            local.unsatisfied = Some(parent.clone())
        });
        Some(parent)
    }

    /// Retire a parent that can no longer take children, closing it if empty
    fn retire(&self, hop: Hop<'_>, parent: &Line) {
        parent.with_state(hop.index(), |p: &mut ParentState| p.retired = true);
        self.close_if_done(hop, parent);
    }

    /// Close a parent that is exhausted or retired and has no children left
    fn close_if_done(&self, hop: Hop<'_>, parent: &Line) {
        let slot = hop.index();
        if !parent.is_alive() {
            return;
        }
        let done = parent
            .with_state(slot, |p: &mut ParentState| self.should_close(p))
            .unwrap_or(false);
        if !done {
            return;
        }

        self.forget_unsatisfied(hop, parent);
        if parent.take_state::<ParentState>(slot).is_none() {
            return;
        }
        MUX_PARENTS_ACTIVE.with_label_values(&[&self.tag]).dec();
        debug!("[{}] closing idle parent {}", self.tag, parent);
        hop.next_finish(parent);
        parent.destroy();
    }

    /// Finish a parent and every child it carries
    fn teardown_parent(&self, hop: Hop<'_>, parent: &Line, notify_next: bool) {
        let slot = hop.index();
        self.forget_unsatisfied(hop, parent);
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
        if notify_next {
            hop.next_finish(parent);
        }
        for child in state.children.drain() {
            if child.take_state::<ChildState>(slot).is_some() {
                MUX_CHILDREN_ACTIVE.with_label_values(&[&self.tag]).dec();
                hop.prev_finish(&child);
            }
        }
        drop(state);
        parent.destroy();
    }

    /// Pause a child's source because the parent is stalled
    fn pause_for_parent(&self, hop: Hop<'_>, parent: &Line, child: &Line) {
        let cid = child.with_state(hop.index(), |c: &mut ChildState| c.cid);
        let Some(cid) = cid else {
            return;
        };
        if mark_child(parent, hop.index(), cid, PauseReason::Peer, true) {
            hop.prev_pause(child);
        }
    }

    fn dispatch_frame(&self, hop: Hop<'_>, parent: &Line, header: FrameHeader, payload: Buffer) {
        let slot = hop.index();
        let child = parent
            .with_state(slot, |p: &mut ParentState| p.children.line(header.cid))
            .flatten();
        let Some(child) = child else {
            trace!("[{}] frame for unknown cid {}", self.tag, header.cid);
            parent.pool().release(payload);
            return;
        };

        match header.flag() {
            Some(FrameFlag::Data) => hop.prev_payload(&child, payload),
            Some(FrameFlag::FlowPause) => {
                parent.pool().release(payload);
                if mark_child(parent, slot, header.cid, PauseReason::Flow, true) {
                    hop.prev_pause(&child);
                }
            }
            Some(FrameFlag::FlowResume) => {
                parent.pool().release(payload);
                if mark_child(parent, slot, header.cid, PauseReason::Flow, false) {
                    hop.prev_resume(&child);
                }
            }
            Some(FrameFlag::Close) => {
                parent.pool().release(payload);
                if let Some(state) = child.take_state::<ChildState>(slot) {
                    parent.with_state(slot, |p: &mut ParentState| p.children.detach(state.key));
                    MUX_CHILDREN_ACTIVE.with_label_values(&[&self.tag]).dec();
                    hop.prev_finish(&child);
                }
                self.close_if_done(hop, parent);
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

    fn send_control(&self, hop: Hop<'_>, child: &Line, flag: FrameFlag, pause: bool) {
        let target = child.with_state(hop.index(), |c: &mut ChildState| {
            if c.flow_paused == pause {
                return None;
            }
            c.flow_paused = pause;
            Some((c.parent.clone(), c.cid))
        });
        let Some(Some((parent, cid))) = target else {
            return;
        };
        let frames = vec![frame::control_frame(child.pool(), flag, cid)];
        write_frames(hop, Direction::Upstream, &parent, Some(child), flag, frames);
    }
}

impl Tunnel for MuxClient {
    fn tag(&self) -> &str {
        &self.tag
    }

    fn upstream_init(&self, hop: Hop<'_>, line: &Line) {
        let slot = hop.index();
        let current = hop.worker_local::<ClientLocal, _>(line.worker(), |l| l.unsatisfied.clone());

        let reusable = current.as_ref().is_some_and(|p| {
            p.is_alive()
                && p.with_state(slot, |s: &mut ParentState| !self.is_exhausted(s))
                    .unwrap_or(false)
        });
        let parent = match (reusable, current) {
            (true, Some(parent)) => parent,
            (_, stale) => {
                if let Some(stale) = stale {
                    self.forget_unsatisfied(hop, &stale);
                    self.retire(hop, &stale);
                }
                match self.open_parent(hop, line) {
                    Some(parent) => parent,
                    None => {
                        debug!("[{}] parent refused, failing {}", self.tag, line);
                        hop.prev_finish(line);
                        return;
                    }
                }
            }
        };

        let admitted = parent
            .with_state(slot, |p: &mut ParentState| {
                p.last_cid += 1;
                let cid = p.last_cid;
                p.children.attach(cid, line.clone()).map(|key| (cid, key))
            })
            .flatten();
        let Some((cid, key)) = admitted else {
            warn!("[{}] could not admit {} on {}", self.tag, line, parent);
            hop.prev_finish(line);
            return;
        };
        line.set_state(
            slot,
            ChildState {
                parent: parent.clone(),
                cid,
                key,
                flow_paused: false,
            },
        );
        MUX_CHILDREN_ACTIVE.with_label_values(&[&self.tag]).inc();
        trace!("[{}] {} joined {} as cid {}", self.tag, line, parent, cid);

        let _guard = line.lock();
        let open = vec![frame::control_frame(line.pool(), FrameFlag::Open, cid)];
        if !write_frames(hop, Direction::Upstream, &parent, Some(line), FrameFlag::Open, open) {
            return;
        }
        if line.is_alive() && line.has_state::<ChildState>(slot) {
            hop.prev_establish(line);
        }
    }

    fn upstream_establish(&self, hop: Hop<'_>, _line: &Line) {
        hop.violation(Event::UpstreamEstablish);
    }

    fn upstream_payload(&self, hop: Hop<'_>, line: &Line, buf: Buffer) {
        let slot = hop.index();
        let target = line.with_state(slot, |c: &mut ChildState| (c.parent.clone(), c.cid));
        let Some((parent, cid)) = target else {
            line.pool().release(buf);
            return;
        };

        let frames = frame::data_frames(line.pool(), cid, buf);
        if !write_frames(hop, Direction::Upstream, &parent, Some(line), FrameFlag::Data, frames) {
            return;
        }

        // Anyone who writes into a stalled parent is paused as well
        let stalled = parent
            .with_state(slot, |p: &mut ParentState| p.paused)
            .unwrap_or(false);
        if stalled && line.is_alive() {
            self.pause_for_parent(hop, &parent, line);
        }
    }

    fn upstream_pause(&self, hop: Hop<'_>, line: &Line) {
        self.send_control(hop, line, FrameFlag::FlowPause, true);
    }

    fn upstream_resume(&self, hop: Hop<'_>, line: &Line) {
        self.send_control(hop, line, FrameFlag::FlowResume, false);
    }

    fn upstream_finish(&self, hop: Hop<'_>, line: &Line) {
        let slot = hop.index();
        let Some(child) = line.take_state::<ChildState>(slot) else {
            return;
        };
        MUX_CHILDREN_ACTIVE.with_label_values(&[&self.tag]).dec();
        let parent = child.parent;
        parent.with_state(slot, |p: &mut ParentState| p.children.detach(child.key));
        trace!("[{}] {} (cid {}) left {}", self.tag, line, child.cid, parent);

        if child.flow_paused {
            let resume = vec![frame::control_frame(line.pool(), FrameFlag::FlowResume, child.cid)];
            if !write_frames(hop, Direction::Upstream, &parent, None, FrameFlag::FlowResume, resume) {
                return;
            }
        }
        let close = vec![frame::control_frame(line.pool(), FrameFlag::Close, child.cid)];
        if !write_frames(hop, Direction::Upstream, &parent, None, FrameFlag::Close, close) {
            return;
        }
        self.close_if_done(hop, &parent);
    }

    fn downstream_init(&self, hop: Hop<'_>, _line: &Line) {
        hop.violation(Event::DownstreamInit);
    }

    fn downstream_establish(&self, hop: Hop<'_>, line: &Line) {
        if !line.has_state::<ParentState>(hop.index()) {
            hop.violation(Event::DownstreamEstablish);
        }
        if line.mark_established() {
            debug!("[{}] parent {} established", self.tag, line);
        }
    }

    fn downstream_payload(&self, hop: Hop<'_>, line: &Line, buf: Buffer) {
        let slot = hop.index();
        if line.has_state::<ChildState>(slot) {
            hop.violation(Event::DownstreamPayload);
        }
        if !line.has_state::<ParentState>(slot) {
            line.pool().release(buf);
            return;
        }
        let pool = line.pool();
        let overflow = line.with_state(slot, |p: &mut ParentState| {
            p.stream.push(pool, buf);
            p.stream.len() > MAX_READ_BUFFER
        });
        match overflow {
            Some(true) => {
                warn!("[{}] parent {} read buffer overflow", self.tag, line);
                MUX_PARENT_OVERFLOWS.inc();
                self.teardown_parent(hop, line, true);
                return;
            }
            _ => {}
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

    fn downstream_pause(&self, hop: Hop<'_>, line: &Line) {
        let slot = hop.index();
        let targets = line.with_state(slot, |p: &mut ParentState| {
            p.paused = true;
            match &p.last_writer {
                Some(writer) if writer.is_alive() => vec![writer.clone()],
                _ => p.children.lines(),
            }
        });
        let Some(targets) = targets else {
            hop.violation(Event::DownstreamPause);
        };

        debug!("[{}] parent {} stalled, pausing {} children", self.tag, line, targets.len());
        let _guard = line.lock();
        for child in targets {
            if !line.is_alive() {
                break;
            }
            if child.is_alive() {
                self.pause_for_parent(hop, line, &child);
            }
        }
    }

    fn downstream_resume(&self, hop: Hop<'_>, line: &Line) {
        let slot = hop.index();
        let targets = line.with_state(slot, |p: &mut ParentState| {
            p.paused = false;
            // Children still held by a FlowPause stay stopped
            p.children
                .iter_mut()
                .filter_map(|c| c.paused.resume(PauseReason::Peer).then(|| c.line.clone()))
                .collect::<Vec<_>>()
        });
        let Some(targets) = targets else {
            hop.violation(Event::DownstreamResume);
        };

        let _guard = line.lock();
        for child in targets {
            if !line.is_alive() {
                break;
            }
            if child.is_alive() {
                hop.prev_resume(&child);
            }
        }
    }

    fn downstream_finish(&self, hop: Hop<'_>, line: &Line) {
        if line.has_state::<ChildState>(hop.index()) {
            hop.violation(Event::DownstreamFinish);
        }
        self.teardown_parent(hop, line, false);
    }
}
