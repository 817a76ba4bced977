//! Probe stages for driving chains in unit tests

use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::buffer::Buffer;
use crate::tunnel::{Chain, Event, Hop, Line, PauseReason, Tunnel};
use crate::worker::Worker;

/// One observed event, keyed by line id
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recorded {
    Init(u64),
    Establish(u64),
    Payload(u64, Vec<u8>),
    Pause(u64),
    Resume(u64),
    Finish(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Head,
    Tail,
}

struct ProbeLine;

#[derive(Default)]
struct TailLines(Vec<Line>);

struct ProbeInner {
    role: Role,
    events: Mutex<Vec<Recorded>>,
    auto_establish: bool,
    reject_inits: AtomicUsize,
}

/// A head or tail stage that records everything it receives
#[derive(Clone)]
pub struct Probe {
    inner: Arc<ProbeInner>,
}

impl Probe {
    fn with_role(role: Role) -> Self {
        Self {
            inner: Arc::new(ProbeInner {
                role,
                events: Mutex::new(Vec::new()),
                auto_establish: false,
                reject_inits: AtomicUsize::new(0),
            }),
        }
    }

    pub fn head() -> Self {
        Self::with_role(Role::Head)
    }

    pub fn tail() -> Self {
        Self::with_role(Role::Tail)
    }

    /// Tail answers every accepted Init with Establish
    pub fn auto_establish(self) -> Self {
        let inner = Arc::try_unwrap(self.inner).unwrap_or_else(|_| panic!("probe already shared"));
        Self {
            inner: Arc::new(ProbeInner {
                auto_establish: true,
                ..inner
            }),
        }
    }

    /// Tail answers the next `count` Inits with Finish
    pub fn reject_next_inits(&self, count: usize) {
        self.inner.reject_inits.store(count, Ordering::SeqCst);
    }

    fn record(&self, event: Recorded) {
        self.inner.events.lock().push(event);
    }

    pub fn events(&self) -> Vec<Recorded> {
        self.inner.events.lock().clone()
    }

    pub fn clear(&self) {
        self.inner.events.lock().clear();
    }

    /// Concatenated payload bytes, in arrival order
    pub fn payload_bytes(&self) -> Vec<u8> {
        self.payloads().into_iter().flat_map(|(_, p)| p).collect()
    }

    pub fn payloads(&self) -> Vec<(u64, Vec<u8>)> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Recorded::Payload(id, bytes) => Some((id, bytes)),
                _ => None,
            })
            .collect()
    }

    pub fn payload_bytes_for(&self, line: u64) -> Vec<u8> {
        self.payloads()
            .into_iter()
            .filter(|(id, _)| *id == line)
            .flat_map(|(_, p)| p)
            .collect()
    }

    pub fn count(&self, f: impl Fn(&Recorded) -> bool) -> usize {
        self.events().iter().filter(|e| f(*e)).count()
    }

    fn end<'a>(&self, chain: &'a Chain) -> Hop<'a> {
        match self.inner.role {
            Role::Head => chain.head(),
            Role::Tail => chain.hop(chain.len() - 1),
        }
    }

    /// Create a line at the head and send Init
    pub fn open(&self, chain: &Chain, worker: &Rc<Worker>) -> Line {
        assert_eq!(self.inner.role, Role::Head);
        let hop = chain.head();
        let line = hop.create_line(worker);
        line.set_state(0, ProbeLine);
        hop.next_init(&line);
        line
    }

    pub fn send(&self, chain: &Chain, line: &Line, bytes: &[u8]) {
        let buf = line.pool().acquire_from(bytes);
        match self.inner.role {
            Role::Head => chain.head().next_payload(line, buf),
            Role::Tail => self.end(chain).prev_payload(line, buf),
        }
    }

    pub fn pause(&self, chain: &Chain, line: &Line) {
        match self.inner.role {
            Role::Head => chain.head().next_pause(line),
            Role::Tail => self.end(chain).prev_pause(line),
        }
    }

    pub fn resume(&self, chain: &Chain, line: &Line) {
        match self.inner.role {
            Role::Head => chain.head().next_resume(line),
            Role::Tail => self.end(chain).prev_resume(line),
        }
    }

    /// Finish a line this probe still holds
    pub fn finish(&self, chain: &Chain, line: &Line) {
        let hop = self.end(chain);
        if line.take_state::<ProbeLine>(hop.index()).is_none() {
            return;
        }
        match self.inner.role {
            Role::Head => {
                hop.next_finish(line);
                line.destroy();
            }
            Role::Tail => {
                Self::forget(hop, line);
                hop.prev_finish(line);
            }
        }
    }

    /// Live lines that reached this tail on `worker`
    pub fn lines(&self, chain: &Chain, worker: &Worker) -> Vec<Line> {
        self.end(chain)
            .worker_local::<TailLines, _>(worker, |l| l.0.clone())
    }

    pub fn last_line(&self, chain: &Chain, worker: &Worker) -> Option<Line> {
        self.lines(chain, worker).pop()
    }

    fn forget(hop: Hop<'_>, line: &Line) {
        hop.worker_local::<TailLines, _>(line.worker(), |l| l.0.retain(|x| !x.ptr_eq(line)));
    }
}

impl Tunnel for Probe {
    fn tag(&self) -> &str {
        match self.inner.role {
            Role::Head => "probe-head",
            Role::Tail => "probe-tail",
        }
    }

    // Tail side

    fn upstream_init(&self, hop: Hop<'_>, line: &Line) {
        if self.inner.role != Role::Tail {
            hop.violation(Event::UpstreamInit);
        }
        self.record(Recorded::Init(line.id()));
        let rejected = self
            .inner
            .reject_inits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if rejected {
            hop.prev_finish(line);
            return;
        }
        line.set_state(hop.index(), ProbeLine);
        hop.worker_local::<TailLines, _>(line.worker(), |l| l.0.push(line.clone()));
        if self.inner.auto_establish {
            hop.prev_establish(line);
        }
    }

    fn upstream_establish(&self, _hop: Hop<'_>, line: &Line) {
        self.record(Recorded::Establish(line.id()));
    }

    fn upstream_payload(&self, _hop: Hop<'_>, line: &Line, buf: Buffer) {
        self.record(Recorded::Payload(line.id(), buf.as_slice().to_vec()));
        line.pool().release(buf);
    }

    fn upstream_pause(&self, _hop: Hop<'_>, line: &Line) {
        self.record(Recorded::Pause(line.id()));
        line.pause_read(PauseReason::Peer);
    }

    fn upstream_resume(&self, _hop: Hop<'_>, line: &Line) {
        self.record(Recorded::Resume(line.id()));
        line.resume_read(PauseReason::Peer);
    }

    fn upstream_finish(&self, hop: Hop<'_>, line: &Line) {
        self.record(Recorded::Finish(line.id()));
        line.take_state::<ProbeLine>(hop.index());
        Self::forget(hop, line);
    }

    // Head side

    fn downstream_init(&self, hop: Hop<'_>, _line: &Line) {
        hop.violation(Event::DownstreamInit);
    }

    fn downstream_establish(&self, _hop: Hop<'_>, line: &Line) {
        self.record(Recorded::Establish(line.id()));
        line.mark_established();
    }

    fn downstream_payload(&self, _hop: Hop<'_>, line: &Line, buf: Buffer) {
        self.record(Recorded::Payload(line.id(), buf.as_slice().to_vec()));
        line.pool().release(buf);
    }

    fn downstream_pause(&self, _hop: Hop<'_>, line: &Line) {
        self.record(Recorded::Pause(line.id()));
        line.pause_read(PauseReason::Peer);
    }

    fn downstream_resume(&self, _hop: Hop<'_>, line: &Line) {
        self.record(Recorded::Resume(line.id()));
        line.resume_read(PauseReason::Peer);
    }

    fn downstream_finish(&self, hop: Hop<'_>, line: &Line) {
        self.record(Recorded::Finish(line.id()));
        if line.take_state::<ProbeLine>(hop.index()).is_some() {
            line.destroy();
        }
    }
}
