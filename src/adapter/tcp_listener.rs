//! TcpListener - the chain head that accepts client connections
//!
//! Accepting happens on the shared runtime. Each accepted socket is posted
//! to one worker, which creates the line and drives the socket from then on.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::buffer::Buffer;
use crate::common::Address;
use crate::error::{Error, Result};
use crate::tunnel::{Chain, Event, Hop, Line, Tunnel};
use crate::worker::{Mailboxes, WorkerId};

use super::socket::{self, Side};

/// How accepted connections are spread over workers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Balance {
    #[default]
    RoundRobin,
    /// Every connection from one client address lands on the same worker
    SourceIp,
}

/// Inbound TCP socket at the start of a chain
pub struct TcpListener {
    tag: String,
    address: SocketAddr,
    balance: Balance,
    next: AtomicUsize,
}

impl TcpListener {
    pub fn new(tag: impl Into<String>, address: SocketAddr, balance: Balance) -> Self {
        Self {
            tag: tag.into(),
            address,
            balance,
            next: AtomicUsize::new(0),
        }
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Bind the configured address
    pub async fn bind(&self) -> Result<tokio::net::TcpListener> {
        let listener = tokio::net::TcpListener::bind(self.address).await?;
        info!("[{}] listening on {}", self.tag, listener.local_addr()?);
        Ok(listener)
    }

    fn pick(&self, peer: &SocketAddr, workers: usize) -> WorkerId {
        match self.balance {
            Balance::RoundRobin => self.next.fetch_add(1, Ordering::Relaxed) % workers,
            Balance::SourceIp => {
                let mut hasher = DefaultHasher::new();
                peer.ip().hash(&mut hasher);
                (hasher.finish() % workers as u64) as usize
            }
        }
    }

    /// Accept until shutdown, handing each connection to a worker of `chain`
    pub async fn serve(
        &self,
        listener: tokio::net::TcpListener,
        chain: Arc<Chain>,
        mailboxes: Mailboxes,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<()> {
        if mailboxes.is_empty() {
            return Err(Error::Config(format!("[{}] no workers to serve", self.tag)));
        }
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            warn!("[{}] accept failed: {}", self.tag, e);
                            continue;
                        }
                    };
                    if let Err(e) = self.dispatch(stream, peer, &chain, &mailboxes) {
                        error!("[{}] dropping connection from {}: {}", self.tag, peer, e);
                    }
                }
                _ = shutdown.recv() => {
                    info!("[{}] stopped accepting", self.tag);
                    return Ok(());
                }
            }
        }
    }

    fn dispatch(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        chain: &Arc<Chain>,
        mailboxes: &Mailboxes,
    ) -> Result<()> {
        let target = self.pick(&peer, mailboxes.len());
        debug!("[{}] accepted {} for worker {}", self.tag, peer, target);
        // A tokio socket is bound to the runtime that registered it
        let stream = stream.into_std()?;
        let chain = chain.clone();
        mailboxes.post(target, move |worker| {
            let hop = chain.head();
            let stream = match TcpStream::from_std(stream) {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("[{}] cannot adopt socket from {}: {}", hop.tag(), peer, e);
                    return;
                }
            };
            let line = hop.create_line(worker);
            line.routing_mut().source = Address::Socket(peer);
            socket::open(hop, &line, Side::Head);
            socket::start(hop, &line, stream);

            let _guard = line.lock();
            hop.next_init(&line);
        })
    }
}

impl Tunnel for TcpListener {
    fn tag(&self) -> &str {
        &self.tag
    }

    fn upstream_init(&self, hop: Hop<'_>, _line: &Line) {
        hop.violation(Event::UpstreamInit)
    }

    fn upstream_establish(&self, hop: Hop<'_>, _line: &Line) {
        hop.violation(Event::UpstreamEstablish)
    }

    fn upstream_payload(&self, hop: Hop<'_>, line: &Line, buf: Buffer) {
        line.pool().release(buf);
        hop.violation(Event::UpstreamPayload)
    }

    fn upstream_pause(&self, hop: Hop<'_>, _line: &Line) {
        hop.violation(Event::UpstreamPause)
    }

    fn upstream_resume(&self, hop: Hop<'_>, _line: &Line) {
        hop.violation(Event::UpstreamResume)
    }

    fn upstream_finish(&self, hop: Hop<'_>, _line: &Line) {
        hop.violation(Event::UpstreamFinish)
    }

    fn downstream_init(&self, hop: Hop<'_>, _line: &Line) {
        hop.violation(Event::DownstreamInit)
    }

    fn downstream_establish(&self, hop: Hop<'_>, line: &Line) {
        if line.mark_established() {
            socket::wake_reader(hop, line);
        }
    }

    fn downstream_payload(&self, hop: Hop<'_>, line: &Line, buf: Buffer) {
        socket::write(hop, line, buf)
    }

    fn downstream_pause(&self, _hop: Hop<'_>, line: &Line) {
        socket::pause_reading(line)
    }

    fn downstream_resume(&self, hop: Hop<'_>, line: &Line) {
        socket::resume_reading(hop, line)
    }

    fn downstream_finish(&self, hop: Hop<'_>, line: &Line) {
        if socket::close(hop, line) {
            line.destroy();
        }
    }
}
