//! Socket plumbing shared by the TCP adapters
//!
//! A socket line owns a [`SocketLink`] in its adapter slot. Event handlers
//! push outgoing buffers onto the link's write queue; two local tasks move
//! bytes between the socket and the chain. A queue above
//! [`HIGH_WATERMARK`] pauses whoever feeds it until it drains below
//! [`LOW_WATERMARK`].

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tracing::{debug, trace};

use crate::app::metrics::ConnectionMetrics;
use crate::buffer::Buffer;
use crate::tunnel::{Chain, Hop, Line, PauseReason};

/// Bytes requested per socket read
const READ_SIZE: usize = 16 * 1024;

/// Queued bytes at which the data source is paused
pub const HIGH_WATERMARK: usize = 1024 * 1024;

/// Queued bytes at which a paused data source is resumed
pub const LOW_WATERMARK: usize = 256 * 1024;

/// Which end of the chain the socket sits on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Side {
    /// First stage: socket reads travel upstream
    Head,
    /// Last stage: socket reads travel downstream
    Tail,
}

/// Shared between a line's event handlers and its socket tasks
pub(crate) struct SocketLink {
    tag: String,
    side: Side,
    queue: RefCell<VecDeque<Buffer>>,
    queued: Cell<usize>,
    closing: Cell<bool>,
    source_paused: Cell<bool>,
    wake_writer: Notify,
    wake_reader: Notify,
    closed: Notify,
    metrics: ConnectionMetrics,
}

impl SocketLink {
    fn new(tag: &str, side: Side) -> Self {
        Self {
            tag: tag.to_string(),
            side,
            queue: RefCell::new(VecDeque::new()),
            queued: Cell::new(0),
            closing: Cell::new(false),
            source_paused: Cell::new(false),
            wake_writer: Notify::new(),
            wake_reader: Notify::new(),
            closed: Notify::new(),
            metrics: ConnectionMetrics::new(tag),
        }
    }

    /// Bytes waiting to be written
    pub fn queued(&self) -> usize {
        self.queued.get()
    }

    fn shut(&self, line: &Line, discard: bool) {
        self.closing.set(true);
        if discard {
            let dropped: Vec<Buffer> = self.queue.borrow_mut().drain(..).collect();
            for buf in dropped {
                line.pool().release(buf);
            }
            self.queued.set(0);
        }
        self.closed.notify_one();
        self.wake_writer.notify_one();
        self.wake_reader.notify_one();
    }
}

struct SocketState {
    link: Rc<SocketLink>,
}

fn link_of(hop: Hop<'_>, line: &Line) -> Option<Rc<SocketLink>> {
    line.with_state(hop.index(), |s: &mut SocketState| s.link.clone())
}

/// Install a socket link in this stage's slot of `line`
pub(crate) fn open(hop: Hop<'_>, line: &Line, side: Side) -> Rc<SocketLink> {
    let link = Rc::new(SocketLink::new(hop.tag(), side));
    line.set_state(hop.index(), SocketState { link: link.clone() });
    link
}

/// Start moving bytes between `stream` and the chain
pub(crate) fn start(hop: Hop<'_>, line: &Line, stream: TcpStream) {
    let Some(link) = link_of(hop, line) else {
        return;
    };
    if let Err(e) = stream.set_nodelay(true) {
        trace!("[{}] set_nodelay failed: {}", link.tag, e);
    }
    let (read_half, write_half) = stream.into_split();
    let chain = hop.chain().handle();
    let index = hop.index();

    tokio::task::spawn_local(write_loop(
        chain.clone(),
        index,
        line.clone(),
        link.clone(),
        write_half,
    ));
    tokio::task::spawn_local(read_loop(chain, index, line.clone(), link, read_half));
}

/// Queue a payload for the socket, pausing the source above the high watermark
pub(crate) fn write(hop: Hop<'_>, line: &Line, buf: Buffer) {
    let Some(link) = link_of(hop, line) else {
        line.pool().release(buf);
        return;
    };
    link.queued.set(link.queued.get() + buf.len());
    link.queue.borrow_mut().push_back(buf);
    link.wake_writer.notify_one();

    if link.queued.get() > HIGH_WATERMARK && !link.source_paused.replace(true) {
        debug!("[{}] {} write queue above high watermark", link.tag, line);
        match link.side {
            Side::Head => hop.next_pause(line),
            Side::Tail => hop.prev_pause(line),
        }
    }
}

/// Stop reading from the socket
pub(crate) fn pause_reading(line: &Line) {
    line.pause_read(PauseReason::Peer);
}

/// Resume reading once every pause reason has cleared
pub(crate) fn resume_reading(hop: Hop<'_>, line: &Line) {
    if line.resume_read(PauseReason::Peer) {
        if let Some(link) = link_of(hop, line) {
            link.wake_reader.notify_one();
        }
    }
}

/// Let a waiting head reader start once the line is established
pub(crate) fn wake_reader(hop: Hop<'_>, line: &Line) {
    if let Some(link) = link_of(hop, line) {
        link.wake_reader.notify_one();
    }
}

/// The chain finished the line: flush what is queued, then close the socket.
/// Returns false if the socket was already gone.
pub(crate) fn close(hop: Hop<'_>, line: &Line) -> bool {
    let Some(state) = line.take_state::<SocketState>(hop.index()) else {
        return false;
    };
    trace!("[{}] {} closing socket", state.link.tag, line);
    state.link.shut(line, false);
    true
}

/// True while this stage still holds a socket for `line`
pub(crate) fn is_open(hop: Hop<'_>, line: &Line) -> bool {
    line.has_state::<SocketState>(hop.index())
}

/// Drop the socket and its queue without notifying the chain
pub(crate) fn abort(hop: Hop<'_>, line: &Line) {
    if let Some(state) = line.take_state::<SocketState>(hop.index()) {
        state.link.shut(line, true);
    }
}

/// The socket failed or hit EOF: drop the queue and finish the line
fn fail(chain: &Chain, index: usize, line: &Line, why: &str) {
    let hop = chain.hop(index);
    let Some(state) = line.take_state::<SocketState>(index) else {
        return;
    };
    let link = state.link;
    debug!("[{}] {} socket closed: {}", link.tag, line, why);
    link.shut(line, true);

    if !line.is_alive() {
        return;
    }
    match link.side {
        Side::Head => {
            hop.next_finish(line);
            line.destroy();
        }
        Side::Tail => hop.prev_finish(line),
    }
}

async fn read_loop(
    chain: Arc<Chain>,
    index: usize,
    line: Line,
    link: Rc<SocketLink>,
    mut half: OwnedReadHalf,
) {
    loop {
        while !link.closing.get()
            && (line.is_read_paused() || (link.side == Side::Head && !line.is_established()))
        {
            link.wake_reader.notified().await;
        }
        if link.closing.get() || !line.is_alive() {
            return;
        }

        let mut buf = line.pool().acquire(READ_SIZE);
        let result = tokio::select! {
            result = half.read_buf(buf.bytes_mut()) => Some(result),
            _ = link.closed.notified() => None,
        };
        let Some(result) = result else {
            line.pool().release(buf);
            return;
        };
        match result {
            Ok(0) => {
                line.pool().release(buf);
                fail(&chain, index, &line, "eof");
                return;
            }
            Ok(n) => {
                link.metrics.record_read(n);
                let hop = chain.hop(index);
                match link.side {
                    Side::Head => hop.next_payload(&line, buf),
                    Side::Tail => hop.prev_payload(&line, buf),
                }
            }
            Err(e) => {
                line.pool().release(buf);
                fail(&chain, index, &line, &e.to_string());
                return;
            }
        }
    }
}

async fn write_loop(
    chain: Arc<Chain>,
    index: usize,
    line: Line,
    link: Rc<SocketLink>,
    mut half: OwnedWriteHalf,
) {
    loop {
        let next = link.queue.borrow_mut().pop_front();
        let Some(buf) = next else {
            if link.closing.get() {
                let _ = half.shutdown().await;
                return;
            }
            link.wake_writer.notified().await;
            continue;
        };

        let len = buf.len();
        let result = half.write_all(buf.as_slice()).await;
        line.pool().release(buf);
        link.queued.set(link.queued.get().saturating_sub(len));
        if let Err(e) = result {
            link.shut(&line, true);
            fail(&chain, index, &line, &e.to_string());
            return;
        }
        link.metrics.record_written(len);

        let drained = link.queued.get() <= LOW_WATERMARK;
        if drained && link.source_paused.replace(false) && line.is_alive() {
            trace!("[{}] {} write queue drained", link.tag, line);
            let hop = chain.hop(index);
            match link.side {
                Side::Head => hop.next_resume(&line),
                Side::Tail => hop.prev_resume(&line),
            }
        }
    }
}
