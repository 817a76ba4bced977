//! TcpConnector - the chain tail that dials the target

use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::buffer::Buffer;
use crate::common::Address;
use crate::tunnel::{Event, Hop, Line, Tunnel};

use super::socket::{self, Side};

/// Outbound TCP socket at the end of a chain
pub struct TcpConnector {
    tag: String,
    address: Option<Address>,
}

impl TcpConnector {
    /// Dial `address`, or each line's routing destination when `None`
    pub fn new(tag: impl Into<String>, address: Option<Address>) -> Self {
        Self {
            tag: tag.into(),
            address,
        }
    }

    fn target(&self, line: &Line) -> Option<Address> {
        match &self.address {
            Some(address) => Some(address.clone()),
            None => {
                let destination = line.routing().destination.clone();
                (!destination.is_unspecified()).then_some(destination)
            }
        }
    }
}

async fn connect(address: &Address) -> std::io::Result<TcpStream> {
    match address {
        Address::Socket(addr) => TcpStream::connect(addr).await,
        Address::Domain(domain, port) => TcpStream::connect((domain.as_str(), *port)).await,
    }
}

impl Tunnel for TcpConnector {
    fn tag(&self) -> &str {
        &self.tag
    }

    fn upstream_init(&self, hop: Hop<'_>, line: &Line) {
        let Some(target) = self.target(line) else {
            warn!("[{}] {} has no destination", self.tag, line);
            hop.prev_finish(line);
            return;
        };
        debug!("[{}] {} connecting to {}", self.tag, line, target);
        socket::open(hop, line, Side::Tail);

        let chain = hop.chain().handle();
        let index = hop.index();
        let line = line.clone();
        tokio::task::spawn_local(async move {
            let result = connect(&target).await;
            let hop = chain.hop(index);
            if !socket::is_open(hop, &line) {
                // The chain gave up on the line while we were dialing
                return;
            }
            match result {
                Ok(stream) => {
                    debug!("[{}] {} connected to {}", hop.tag(), line, target);
                    socket::start(hop, &line, stream);
                    hop.prev_establish(&line);
                }
                Err(e) => {
                    warn!("[{}] {} connect to {} failed: {}", hop.tag(), line, target, e);
                    socket::abort(hop, &line);
                    hop.prev_finish(&line);
                }
            }
        });
    }

    fn upstream_establish(&self, hop: Hop<'_>, _line: &Line) {
        hop.violation(Event::UpstreamEstablish)
    }

    fn upstream_payload(&self, hop: Hop<'_>, line: &Line, buf: Buffer) {
        socket::write(hop, line, buf)
    }

    fn upstream_pause(&self, _hop: Hop<'_>, line: &Line) {
        socket::pause_reading(line)
    }

    fn upstream_resume(&self, hop: Hop<'_>, line: &Line) {
        socket::resume_reading(hop, line)
    }

    fn upstream_finish(&self, hop: Hop<'_>, line: &Line) {
        socket::close(hop, line);
    }

    fn downstream_init(&self, hop: Hop<'_>, _line: &Line) {
        hop.violation(Event::DownstreamInit)
    }

    fn downstream_establish(&self, hop: Hop<'_>, _line: &Line) {
        hop.violation(Event::DownstreamEstablish)
    }

    fn downstream_payload(&self, hop: Hop<'_>, line: &Line, buf: Buffer) {
        line.pool().release(buf);
        hop.violation(Event::DownstreamPayload)
    }

    fn downstream_pause(&self, hop: Hop<'_>, _line: &Line) {
        hop.violation(Event::DownstreamPause)
    }

    fn downstream_resume(&self, hop: Hop<'_>, _line: &Line) {
        hop.violation(Event::DownstreamResume)
    }

    fn downstream_finish(&self, hop: Hop<'_>, _line: &Line) {
        hop.violation(Event::DownstreamFinish)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::task::LocalSet;

    use crate::testing::{Probe, Recorded};
    use crate::tunnel::Chain;
    use crate::worker::WorkerLoop;

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_connects_and_relays_both_ways() {
        LocalSet::new()
            .run_until(async {
                let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
                let addr = server.local_addr().unwrap();

                let wl = WorkerLoop::standalone();
                let head = Probe::head();
                let chain = Chain::builder("connector")
                    .stage(head.clone())
                    .stage(TcpConnector::new("out", Some(Address::Socket(addr))))
                    .build()
                    .unwrap();

                let line = head.open(&chain, wl.worker());
                let (mut peer, _) = server.accept().await.unwrap();
                settle().await;
                assert!(line.is_established());

                head.send(&chain, &line, b"ping");
                let mut got = [0u8; 4];
                peer.read_exact(&mut got).await.unwrap();
                assert_eq!(&got, b"ping");

                peer.write_all(b"pong").await.unwrap();
                settle().await;
                assert_eq!(head.payload_bytes_for(line.id()), b"pong".to_vec());

                // Peer closes: the head sees Finish and the line is gone
                drop(peer);
                settle().await;
                assert_eq!(head.count(|e| *e == Recorded::Finish(line.id())), 1);
                assert!(!line.is_alive());
            })
            .await;
    }

    #[tokio::test]
    async fn test_refused_connect_finishes_line() {
        LocalSet::new()
            .run_until(async {
                let addr = {
                    let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
                    probe.local_addr().unwrap()
                };

                let wl = WorkerLoop::standalone();
                let head = Probe::head();
                let chain = Chain::builder("connector")
                    .stage(head.clone())
                    .stage(TcpConnector::new("out", Some(Address::Socket(addr))))
                    .build()
                    .unwrap();

                let line = head.open(&chain, wl.worker());
                settle().await;
                assert!(!line.is_alive());
                assert_eq!(head.count(|e| *e == Recorded::Finish(line.id())), 1);
                assert_eq!(head.count(|e| matches!(e, Recorded::Establish(_))), 0);
            })
            .await;
    }

    #[tokio::test]
    async fn test_missing_destination_finishes_immediately() {
        LocalSet::new()
            .run_until(async {
                let wl = WorkerLoop::standalone();
                let head = Probe::head();
                let chain = Chain::builder("connector")
                    .stage(head.clone())
                    .stage(TcpConnector::new("out", None))
                    .build()
                    .unwrap();

                let line = head.open(&chain, wl.worker());
                assert!(!line.is_alive());
                assert_eq!(head.events(), vec![Recorded::Finish(line.id())]);
            })
            .await;
    }

    #[tokio::test]
    async fn test_routing_destination_is_dialed() {
        LocalSet::new()
            .run_until(async {
                let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
                let addr = server.local_addr().unwrap();

                let wl = WorkerLoop::standalone();
                let chain = Chain::builder("connector")
                    .stage(Probe::head())
                    .stage(TcpConnector::new("out", None))
                    .build()
                    .unwrap();

                let hop = chain.head();
                let line = hop.create_line(wl.worker());
                line.routing_mut().destination = Address::Socket(addr);
                hop.next_init(&line);

                let (_peer, _) = server.accept().await.unwrap();
                settle().await;
                assert!(socket::is_open(chain.hop(1), &line));
                hop.next_finish(&line);
                line.destroy();
            })
            .await;
    }

    #[tokio::test]
    async fn test_finish_flushes_queued_bytes() {
        LocalSet::new()
            .run_until(async {
                let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
                let addr = server.local_addr().unwrap();

                let wl = WorkerLoop::standalone();
                let head = Probe::head();
                let chain = Chain::builder("connector")
                    .stage(head.clone())
                    .stage(TcpConnector::new("out", Some(Address::Socket(addr))))
                    .build()
                    .unwrap();

                let line = head.open(&chain, wl.worker());
                let (mut peer, _) = server.accept().await.unwrap();
                settle().await;

                head.send(&chain, &line, b"last words");
                head.finish(&chain, &line);

                let mut got = Vec::new();
                peer.read_to_end(&mut got).await.unwrap();
                assert_eq!(got, b"last words".to_vec());
                settle().await;
                assert_eq!(wl.worker().pool().in_use(), 0);
            })
            .await;
    }
}
