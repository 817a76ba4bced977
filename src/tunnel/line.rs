//! Line - per-flow state shared by every stage of a chain
//!
//! A line lives on exactly one worker. It is an `Rc` handle, so the type
//! system keeps it on that worker's thread. On top of the `Rc`, a line keeps
//! an explicit reference count: any call that may reentrantly finish the
//! line is bracketed by [`Line::lock`], and the caller re-checks
//! [`Line::is_alive`] once the call returns.

use std::any::Any;
use std::cell::{Cell, Ref, RefCell, RefMut};
use std::fmt;
use std::rc::Rc;

use tracing::trace;

use crate::app::metrics::{LINES_ACTIVE, LINES_CREATED};
use crate::buffer::BufferPool;
use crate::common::RoutingContext;
use crate::worker::{Worker, WorkerId};

use super::contract_violation;
use super::pause::{PauseReason, PauseState};

struct LineInner {
    id: u64,
    worker: Rc<Worker>,
    alive: Cell<bool>,
    established: Cell<bool>,
    refs: Cell<u32>,
    slots: RefCell<Vec<Option<Box<dyn Any>>>>,
    routing: RefCell<RoutingContext>,
    read_pause: Cell<PauseState>,
    write_pause: Cell<PauseState>,
}

/// Handle to one flow
#[derive(Clone)]
pub struct Line(Rc<LineInner>);

impl Line {
    /// Create a live line holding one reference, owned by its creator
    pub fn new(worker: &Rc<Worker>, slots: usize) -> Self {
        LINES_CREATED.inc();
        LINES_ACTIVE.inc();
        let line = Line(Rc::new(LineInner {
            id: worker.allocate_line_id(),
            worker: worker.clone(),
            alive: Cell::new(true),
            established: Cell::new(false),
            refs: Cell::new(1),
            slots: RefCell::new((0..slots).map(|_| None).collect()),
            routing: RefCell::new(RoutingContext::default()),
            read_pause: Cell::new(PauseState::default()),
            write_pause: Cell::new(PauseState::default()),
        }));
        trace!("{} created", line);
        line
    }

    pub fn id(&self) -> u64 {
        self.0.id
    }

    pub fn worker(&self) -> &Rc<Worker> {
        &self.0.worker
    }

    pub fn worker_id(&self) -> WorkerId {
        self.0.worker.id()
    }

    pub fn pool(&self) -> &BufferPool {
        self.0.worker.pool()
    }

    pub fn ptr_eq(&self, other: &Line) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    pub fn is_alive(&self) -> bool {
        self.0.alive.get()
    }

    pub fn is_established(&self) -> bool {
        self.0.established.get()
    }

    /// Mark the line established; false if it already was
    pub fn mark_established(&self) -> bool {
        !self.0.established.replace(true)
    }

    /// Current reference count
    pub fn refs(&self) -> u32 {
        self.0.refs.get()
    }

    /// Take a reference for the duration of a call that may finish the line
    pub fn lock(&self) -> LineGuard {
        if !self.is_alive() {
            contract_violation("line", format_args!("{} locked after destroy", self));
        }
        self.0.refs.set(self.0.refs.get() + 1);
        LineGuard { line: self.clone() }
    }

    /// Tear the line down and drop its creation reference.
    ///
    /// Called once, by the stage that created the line, after Finish has
    /// propagated and every stage state slot has been cleared.
    pub fn destroy(&self) {
        if !self.0.alive.replace(false) {
            contract_violation("line", format_args!("{} destroyed twice", self));
        }
        trace!("{} destroyed (refs={})", self, self.refs());
        self.release();
    }

    fn release(&self) {
        let refs = self.0.refs.get();
        if refs == 0 {
            contract_violation("line", format_args!("{} released below zero", self));
        }
        self.0.refs.set(refs - 1);
        if refs > 1 {
            return;
        }
        if self.is_alive() {
            contract_violation("line", format_args!("{} released while alive", self));
        }
        if let Some(slot) = self.0.slots.borrow().iter().position(Option::is_some) {
            contract_violation(
                "line",
                format_args!("{} freed with state left in slot {}", self, slot),
            );
        }
        LINES_ACTIVE.dec();
        trace!("{} freed", self);
    }

    // ------------------------------------------------------------------------
    // Per-stage state
    // ------------------------------------------------------------------------

    fn check_slot(&self, slot: usize) {
        let len = self.0.slots.borrow().len();
        if slot >= len {
            contract_violation(
                "line",
                format_args!("{} has {} slots, slot {} requested", self, len, slot),
            );
        }
    }

    /// Install a stage's state
    pub fn set_state<T: 'static>(&self, slot: usize, state: T) {
        self.check_slot(slot);
        self.0.slots.borrow_mut()[slot] = Some(Box::new(state));
    }

    /// True if `slot` holds a `T`
    pub fn has_state<T: 'static>(&self, slot: usize) -> bool {
        self.check_slot(slot);
        matches!(&self.0.slots.borrow()[slot], Some(state) if state.is::<T>())
    }

    /// Borrow a stage's state for the duration of `f`.
    ///
    /// Returns `None` if the slot is empty or holds another type. `f` must
    /// not dispatch events.
    pub fn with_state<T: 'static, R>(&self, slot: usize, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        self.check_slot(slot);
        let mut slots = self.0.slots.borrow_mut();
        let state = slots[slot].as_mut()?.downcast_mut::<T>()?;
        Some(f(state))
    }

    /// Remove a stage's state, leaving the slot empty
    pub fn take_state<T: 'static>(&self, slot: usize) -> Option<T> {
        self.check_slot(slot);
        let mut slots = self.0.slots.borrow_mut();
        if !matches!(&slots[slot], Some(state) if state.is::<T>()) {
            return None;
        }
        slots[slot]
            .take()
            .and_then(|state| state.downcast::<T>().ok())
            .map(|state| *state)
    }

    // ------------------------------------------------------------------------
    // Routing and flow control
    // ------------------------------------------------------------------------

    pub fn routing(&self) -> Ref<'_, RoutingContext> {
        self.0.routing.borrow()
    }

    pub fn routing_mut(&self) -> RefMut<'_, RoutingContext> {
        self.0.routing.borrow_mut()
    }

    /// Stop reading from this line's source; true on the running → paused edge
    pub fn pause_read(&self, reason: PauseReason) -> bool {
        Self::update(&self.0.read_pause, |s| s.pause(reason))
    }

    /// True when the last read pause reason cleared
    pub fn resume_read(&self, reason: PauseReason) -> bool {
        Self::update(&self.0.read_pause, |s| s.resume(reason))
    }

    pub fn is_read_paused(&self) -> bool {
        self.0.read_pause.get().is_paused()
    }

    /// Stop writing towards this line's sink; true on the running → paused edge
    pub fn pause_write(&self, reason: PauseReason) -> bool {
        Self::update(&self.0.write_pause, |s| s.pause(reason))
    }

    /// True when the last write pause reason cleared
    pub fn resume_write(&self, reason: PauseReason) -> bool {
        Self::update(&self.0.write_pause, |s| s.resume(reason))
    }

    pub fn is_write_paused(&self) -> bool {
        self.0.write_pause.get().is_paused()
    }

    fn update(cell: &Cell<PauseState>, f: impl FnOnce(&mut PauseState) -> bool) -> bool {
        let mut state = cell.get();
        let edge = f(&mut state);
        cell.set(state);
        edge
    }
}

impl fmt::Display for Line {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}:{}", self.worker_id(), self.id())
    }
}

impl fmt::Debug for Line {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Line")
            .field("worker", &self.worker_id())
            .field("id", &self.id())
            .field("alive", &self.is_alive())
            .field("refs", &self.refs())
            .finish()
    }
}

/// Scoped reference on a line, released when dropped
#[must_use = "the reference is released as soon as the guard is dropped"]
pub struct LineGuard {
    line: Line,
}

impl LineGuard {
    pub fn line(&self) -> &Line {
        &self.line
    }
}

impl Drop for LineGuard {
    fn drop(&mut self) {
        self.line.release();
    }
}
