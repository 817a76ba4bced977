//! Tunnel layer - stages, chains and the six-event contract
//!
//! A [`Chain`] is an immutable list of [`Tunnel`] stages. Events travel
//! between neighbors through a [`Hop`], the position of the stage that is
//! currently handling the event:
//!
//! ```text
//!            upstream (head -> tail)
//!   head ── Init/Establish/Payload/Pause/Resume/Finish ──▶ tail
//!   head ◀── Init/Establish/Payload/Pause/Resume/Finish ── tail
//!            downstream (tail -> head)
//! ```
//!
//! Every event method has a default that forwards to the neighbor, so a
//! stage only overrides what it transforms or absorbs.

mod chain;
mod line;
mod pause;

pub use chain::{Chain, ChainBuilder};
pub use line::{Line, LineGuard};
pub use pause::{PauseReason, PauseState};

use std::fmt;
use std::rc::Rc;
use std::time::Duration;

use tracing::{error, trace};

use crate::buffer::Buffer;
use crate::worker::{LocalKey, TimerHandle, Worker};

// ============================================================================
// Events
// ============================================================================

/// The twelve events of the dispatch contract
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    UpstreamInit,
    UpstreamEstablish,
    UpstreamPayload,
    UpstreamPause,
    UpstreamResume,
    UpstreamFinish,
    DownstreamInit,
    DownstreamEstablish,
    DownstreamPayload,
    DownstreamPause,
    DownstreamResume,
    DownstreamFinish,
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Event::UpstreamInit => "upstream init",
            Event::UpstreamEstablish => "upstream establish",
            Event::UpstreamPayload => "upstream payload",
            Event::UpstreamPause => "upstream pause",
            Event::UpstreamResume => "upstream resume",
            Event::UpstreamFinish => "upstream finish",
            Event::DownstreamInit => "downstream init",
            Event::DownstreamEstablish => "downstream establish",
            Event::DownstreamPayload => "downstream payload",
            Event::DownstreamPause => "downstream pause",
            Event::DownstreamResume => "downstream resume",
            Event::DownstreamFinish => "downstream finish",
        };
        f.write_str(name)
    }
}

/// Log a mis-wired chain and terminate the process.
///
/// Reaching an event a stage can never legally receive means the chain was
/// composed wrongly; there is no safe way to continue.
pub fn contract_violation(tag: &str, what: impl fmt::Display) -> ! {
    error!("[{}] contract violation: {}", tag, what);
    std::process::exit(1)
}

// ============================================================================
// Tunnel trait
// ============================================================================

/// One processing stage of a chain.
///
/// Stages are shared by every worker, so per-flow state lives in the line's
/// slot for this stage (`hop.index()`) and per-worker state in
/// [`Hop::worker_local`].
#[allow(unused_variables)]
pub trait Tunnel: Send + Sync {
    /// Tag used in log lines
    fn tag(&self) -> &str;

    fn upstream_init(&self, hop: Hop<'_>, line: &Line) {
        hop.next_init(line)
    }

    fn upstream_establish(&self, hop: Hop<'_>, line: &Line) {
        hop.next_establish(line)
    }

    fn upstream_payload(&self, hop: Hop<'_>, line: &Line, buf: Buffer) {
        hop.next_payload(line, buf)
    }

    fn upstream_pause(&self, hop: Hop<'_>, line: &Line) {
        hop.next_pause(line)
    }

    fn upstream_resume(&self, hop: Hop<'_>, line: &Line) {
        hop.next_resume(line)
    }

    fn upstream_finish(&self, hop: Hop<'_>, line: &Line) {
        hop.next_finish(line)
    }

    fn downstream_init(&self, hop: Hop<'_>, line: &Line) {
        hop.prev_init(line)
    }

    fn downstream_establish(&self, hop: Hop<'_>, line: &Line) {
        hop.prev_establish(line)
    }

    fn downstream_payload(&self, hop: Hop<'_>, line: &Line, buf: Buffer) {
        hop.prev_payload(line, buf)
    }

    fn downstream_pause(&self, hop: Hop<'_>, line: &Line) {
        hop.prev_pause(line)
    }

    fn downstream_resume(&self, hop: Hop<'_>, line: &Line) {
        hop.prev_resume(line)
    }

    fn downstream_finish(&self, hop: Hop<'_>, line: &Line) {
        hop.prev_finish(line)
    }
}

// ============================================================================
// Hop
// ============================================================================

/// A stage's position in its chain, handed to every event.
#[derive(Clone, Copy)]
pub struct Hop<'a> {
    chain: &'a Chain,
    index: usize,
}

impl<'a> Hop<'a> {
    pub(crate) fn new(chain: &'a Chain, index: usize) -> Self {
        Self { chain, index }
    }

    /// Position in the chain, also the line state slot of this stage
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn chain(&self) -> &'a Chain {
        self.chain
    }

    pub fn tag(&self) -> &'a str {
        self.chain.stage(self.index).tag()
    }

    /// Create a line sized for this chain, owned by the caller
    pub fn create_line(&self, worker: &Rc<Worker>) -> Line {
        Line::new(worker, self.chain.len())
    }

    /// Key of this stage's worker-local state
    pub fn local_key(&self) -> LocalKey {
        (self.chain.id(), self.index)
    }

    /// Access this stage's state on `worker`; `f` must not dispatch events
    pub fn worker_local<T, R>(&self, worker: &Worker, f: impl FnOnce(&mut T) -> R) -> R
    where
        T: Default + 'static,
    {
        worker.with_local(self.local_key(), f)
    }

    /// Run `task` at this position on `worker` once the current call stack
    /// has unwound
    pub fn defer(&self, worker: &Worker, task: impl FnOnce(Hop<'_>) + 'static) {
        let chain = self.chain.handle();
        let index = self.index;
        worker.defer(move |_| task(Hop::new(&chain, index)));
    }

    /// Schedule `callback` at this position on `worker`
    pub fn schedule(
        &self,
        worker: &Worker,
        delay: Duration,
        repeat: bool,
        mut callback: impl FnMut(Hop<'_>) + 'static,
    ) -> TimerHandle {
        let chain = self.chain.handle();
        let index = self.index;
        worker.schedule(delay, repeat, move |_| callback(Hop::new(&chain, index)))
    }

    /// Abort on an event this stage cannot receive
    pub fn violation(&self, event: Event) -> ! {
        contract_violation(self.tag(), format_args!("unexpected {}", event))
    }

    fn next(&self, event: Event) -> Hop<'a> {
        if self.index + 1 >= self.chain.len() {
            contract_violation(self.tag(), format_args!("{} past the chain tail", event));
        }
        Hop::new(self.chain, self.index + 1)
    }

    fn prev(&self, event: Event) -> Hop<'a> {
        if self.index == 0 {
            contract_violation(self.tag(), format_args!("{} past the chain head", event));
        }
        Hop::new(self.chain, self.index - 1)
    }

    fn stage(&self) -> &'a dyn Tunnel {
        self.chain.stage(self.index)
    }

    // ------------------------------------------------------------------------
    // Upstream forwarding (towards the tail)
    // ------------------------------------------------------------------------

    pub fn next_init(&self, line: &Line) {
        let next = self.next(Event::UpstreamInit);
        next.stage().upstream_init(next, line)
    }

    pub fn next_establish(&self, line: &Line) {
        let next = self.next(Event::UpstreamEstablish);
        next.stage().upstream_establish(next, line)
    }

    /// Forward a payload; a payload for a dead line goes back to the pool
    pub fn next_payload(&self, line: &Line, buf: Buffer) {
        if !line.is_alive() {
            trace!("[{}] dropping payload for dead {}", self.tag(), line);
            line.pool().release(buf);
            return;
        }
        let next = self.next(Event::UpstreamPayload);
        next.stage().upstream_payload(next, line, buf)
    }

    pub fn next_pause(&self, line: &Line) {
        let next = self.next(Event::UpstreamPause);
        next.stage().upstream_pause(next, line)
    }

    pub fn next_resume(&self, line: &Line) {
        let next = self.next(Event::UpstreamResume);
        next.stage().upstream_resume(next, line)
    }

    pub fn next_finish(&self, line: &Line) {
        let next = self.next(Event::UpstreamFinish);
        next.stage().upstream_finish(next, line)
    }

    // ------------------------------------------------------------------------
    // Downstream forwarding (towards the head)
    // ------------------------------------------------------------------------

    pub fn prev_init(&self, line: &Line) {
        let prev = self.prev(Event::DownstreamInit);
        prev.stage().downstream_init(prev, line)
    }

    pub fn prev_establish(&self, line: &Line) {
        let prev = self.prev(Event::DownstreamEstablish);
        prev.stage().downstream_establish(prev, line)
    }

    /// Forward a payload; a payload for a dead line goes back to the pool
    pub fn prev_payload(&self, line: &Line, buf: Buffer) {
        if !line.is_alive() {
            trace!("[{}] dropping payload for dead {}", self.tag(), line);
            line.pool().release(buf);
            return;
        }
        let prev = self.prev(Event::DownstreamPayload);
        prev.stage().downstream_payload(prev, line, buf)
    }

    pub fn prev_pause(&self, line: &Line) {
        let prev = self.prev(Event::DownstreamPause);
        prev.stage().downstream_pause(prev, line)
    }

    pub fn prev_resume(&self, line: &Line) {
        let prev = self.prev(Event::DownstreamResume);
        prev.stage().downstream_resume(prev, line)
    }

    pub fn prev_finish(&self, line: &Line) {
        let prev = self.prev(Event::DownstreamFinish);
        prev.stage().downstream_finish(prev, line)
    }
}
