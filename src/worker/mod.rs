//! Workers - single-threaded run loops that own lines
//!
//! A [`Worker`] is the explicit "this thread" context handed to every line.
//! It owns the buffer pool, a queue of deferred local tasks, timers, and
//! worker-local state for stages. Other threads reach a worker only by
//! posting a message through [`Mailboxes`]; the message is drained on the
//! worker's own loop.

mod timer;

pub use timer::TimerHandle;

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, Notify};
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::buffer::{BufferPool, PoolConfig};
use crate::error::{Error, Result};

use timer::Timers;

/// Index of a worker, fixed for the life of every line it owns
pub type WorkerId = usize;

/// Cross-thread message executed on the target worker
pub type Message = Box<dyn FnOnce(&Rc<Worker>) + Send>;

type LocalTask = Box<dyn FnOnce(&Rc<Worker>)>;

/// Key for worker-local stage storage: (chain id, stage index)
pub type LocalKey = (u64, usize);

// ============================================================================
// Mailboxes
// ============================================================================

/// One message queue per worker
#[derive(Clone)]
pub struct Mailboxes {
    senders: Arc<Vec<mpsc::UnboundedSender<Message>>>,
}

impl Mailboxes {
    /// Create `count` mailboxes, returning the receiving ends in worker order
    pub fn new(count: usize) -> (Self, Vec<mpsc::UnboundedReceiver<Message>>) {
        let (senders, receivers): (Vec<_>, Vec<_>) =
            (0..count).map(|_| mpsc::unbounded_channel()).unzip();
        (
            Self {
                senders: Arc::new(senders),
            },
            receivers,
        )
    }

    pub fn len(&self) -> usize {
        self.senders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.senders.is_empty()
    }

    /// Queue `f` to run on worker `target`
    pub fn post<F>(&self, target: WorkerId, f: F) -> Result<()>
    where
        F: FnOnce(&Rc<Worker>) + Send + 'static,
    {
        let sender = self
            .senders
            .get(target)
            .ok_or(Error::WorkerGone(target))?;
        sender
            .send(Box::new(f))
            .map_err(|_| Error::WorkerGone(target))
    }

    /// Queue `f` on every worker
    pub fn broadcast<F>(&self, f: F) -> Result<()>
    where
        F: Fn(&Rc<Worker>) + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        for target in 0..self.senders.len() {
            let f = f.clone();
            self.post(target, move |w| (*f)(w))?;
        }
        Ok(())
    }
}

// ============================================================================
// Worker
// ============================================================================

/// Per-thread context owning lines, buffers and timers
pub struct Worker {
    id: WorkerId,
    pool: BufferPool,
    mailboxes: Mailboxes,
    deferred: RefCell<VecDeque<LocalTask>>,
    timers: RefCell<Timers>,
    locals: RefCell<HashMap<LocalKey, Box<dyn Any>>>,
    wake: Notify,
    next_line_id: Cell<u64>,
}

impl Worker {
    fn new(id: WorkerId, mailboxes: Mailboxes, pool: PoolConfig) -> Rc<Self> {
        Rc::new(Self {
            id,
            pool: BufferPool::new(id, pool),
            mailboxes,
            deferred: RefCell::new(VecDeque::new()),
            timers: RefCell::new(Timers::default()),
            locals: RefCell::new(HashMap::new()),
            wake: Notify::new(),
            next_line_id: Cell::new(1),
        })
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    pub fn mailboxes(&self) -> &Mailboxes {
        &self.mailboxes
    }

    pub(crate) fn allocate_line_id(&self) -> u64 {
        let id = self.next_line_id.get();
        self.next_line_id.set(id + 1);
        id
    }

    /// Run `task` on this worker once the current call stack has unwound
    pub fn defer<F>(&self, task: F)
    where
        F: FnOnce(&Rc<Worker>) + 'static,
    {
        self.deferred.borrow_mut().push_back(Box::new(task));
        self.wake.notify_one();
    }

    /// Schedule `callback` after `delay`, and every `delay` after that if `repeat`.
    /// Repeating periods are at least one millisecond.
    pub fn schedule<F>(&self, delay: Duration, repeat: bool, callback: F) -> TimerHandle
    where
        F: FnMut(&Rc<Worker>) + 'static,
    {
        let handle = self
            .timers
            .borrow_mut()
            .insert(Instant::now() + delay, repeat.then_some(delay), Box::new(callback));
        self.wake.notify_one();
        handle
    }

    /// Cancel a scheduled timer; returns false if it already fired or was cancelled
    pub fn cancel(&self, handle: TimerHandle) -> bool {
        self.timers.borrow_mut().cancel(handle)
    }

    /// Access worker-local state for one stage, creating it on first use.
    ///
    /// The closure must not dispatch events: the local table is borrowed
    /// for its duration.
    pub fn with_local<T, R>(&self, key: LocalKey, f: impl FnOnce(&mut T) -> R) -> R
    where
        T: Default + 'static,
    {
        let mut locals = self.locals.borrow_mut();
        let slot = locals
            .entry(key)
            .or_insert_with(|| Box::new(T::default()));
        if !slot.is::<T>() {
            *slot = Box::new(T::default());
        }
        match slot.downcast_mut::<T>() {
            Some(state) => f(state),
            None => unreachable!("worker local type replaced above"),
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.timers.borrow().next_deadline()
    }

    /// Run one deferred task; false if the queue was empty
    fn run_deferred(self: &Rc<Self>) -> bool {
        let task = self.deferred.borrow_mut().pop_front();
        match task {
            Some(task) => {
                task(self);
                true
            }
            None => false,
        }
    }

    /// Fire every timer that is due; returns how many fired
    fn run_timers(self: &Rc<Self>) -> usize {
        let now = Instant::now();
        let mut fired = 0;
        loop {
            let due = self.timers.borrow_mut().pop_due(now);
            let Some((handle, mut callback)) = due else {
                break;
            };
            callback(self);
            self.timers.borrow_mut().rearm(handle, callback);
            fired += 1;
        }
        fired
    }

    fn shutdown(&self) {
        let tasks = self.deferred.borrow_mut().len();
        self.deferred.borrow_mut().clear();
        self.timers.borrow_mut().clear();
        // Worker-local state may hold lines that reference this worker
        let locals = std::mem::take(&mut *self.locals.borrow_mut());
        drop(locals);
        debug!("worker {} stopped ({} deferred tasks dropped)", self.id, tasks);
    }
}

// ============================================================================
// WorkerLoop
// ============================================================================

/// The run loop of one worker: deferred tasks, inbox messages and timers
pub struct WorkerLoop {
    worker: Rc<Worker>,
    inbox: mpsc::UnboundedReceiver<Message>,
}

impl WorkerLoop {
    pub fn new(
        id: WorkerId,
        mailboxes: Mailboxes,
        inbox: mpsc::UnboundedReceiver<Message>,
        pool: PoolConfig,
    ) -> Self {
        Self {
            worker: Worker::new(id, mailboxes, pool),
            inbox,
        }
    }

    /// A lone worker with its own single mailbox
    pub fn standalone() -> Self {
        let (mailboxes, mut receivers) = Mailboxes::new(1);
        let inbox = receivers.remove(0);
        Self::new(0, mailboxes, inbox, PoolConfig::default())
    }

    pub fn worker(&self) -> &Rc<Worker> {
        &self.worker
    }

    /// Drain deferred tasks, pending messages and due timers until nothing
    /// is runnable; returns the number of callbacks executed
    pub fn run_until_idle(&mut self) -> usize {
        let mut executed = 0;
        loop {
            let mut progressed = false;
            while self.worker.run_deferred() {
                executed += 1;
                progressed = true;
            }
            while let Ok(message) = self.inbox.try_recv() {
                message(&self.worker);
                executed += 1;
                progressed = true;
            }
            let fired = self.worker.run_timers();
            if fired > 0 {
                executed += fired;
                progressed = true;
            }
            if !progressed {
                return executed;
            }
        }
    }

    /// Async run loop; must be driven inside a `LocalSet` on the worker thread
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        debug!("worker {} running", self.worker.id);
        loop {
            self.run_until_idle();

            let deadline = self.worker.next_deadline();
            let timer = async move {
                match deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                message = self.inbox.recv() => match message {
                    Some(message) => message(&self.worker),
                    None => break,
                },
                _ = self.worker.wake.notified() => {
                    trace!("worker {} woken", self.worker.id);
                }
                _ = timer => {}
                _ = shutdown.recv() => break,
            }
        }
        self.worker.shutdown();
    }
}
