//! HalfDuplex client - splits a main line into an upload and a download leg

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, trace};

use crate::buffer::Buffer;
use crate::tunnel::{Event, Hop, Line, Tunnel};

use super::encode_intro;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Main,
    Upload,
    Download,
}

/// Lines of one logical connection; cleared field by field on teardown
#[derive(Default)]
struct Link {
    main: Option<Line>,
    upload: Option<Line>,
    download: Option<Line>,
    first_packet_sent: bool,
    established: bool,
}

struct ClientState {
    link: Rc<RefCell<Link>>,
    role: Role,
}

/// Client half of the half-duplex pair
pub struct HalfDuplexClient {
    tag: String,
    identifier: AtomicU64,
}

impl HalfDuplexClient {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            identifier: AtomicU64::new(rand::random::<u64>() >> 1),
        }
    }

    fn state(&self, hop: Hop<'_>, line: &Line) -> Option<(Rc<RefCell<Link>>, Role)> {
        line.with_state(hop.index(), |s: &mut ClientState| (s.link.clone(), s.role))
    }

    /// Create one leg and send its Init; false if it died on the way
    fn open_leg(&self, hop: Hop<'_>, main: &Line, link: &Rc<RefCell<Link>>, role: Role) -> bool {
        let leg = hop.create_line(main.worker());
        *leg.routing_mut() = main.routing().clone();
        leg.set_state(
            hop.index(),
            ClientState {
                link: link.clone(),
                role,
            },
        );
        {
            let mut link = link.borrow_mut();
            match role {
                Role::Upload => link.upload = Some(leg.clone()),
                _ => link.download = Some(leg.clone()),
            }
        }
        trace!("[{}] {} opened {:?} leg {}", self.tag, main, role, leg);

        let _guard = leg.lock();
        hop.next_init(&leg);
        leg.is_alive()
    }

    /// First payload: announce the identifier on both legs
    fn send_intros(&self, hop: Hop<'_>, main: &Line, upload: &Line, download: &Line, mut buf: Buffer) {
        let id = self.identifier.fetch_add(1, Ordering::Relaxed);
        debug!("[{}] {} pairing as {:016x}", self.tag, main, id);

        let intro = main.pool().acquire_from(&encode_intro(id, true));
        {
            let _guard = download.lock();
            hop.next_payload(download, intro);
            if !download.is_alive() {
                main.pool().release(buf);
                return;
            }
        }

        buf.prepend(&encode_intro(id, false));
        hop.next_payload(upload, buf);
    }

    /// Finish `leg`'s sibling after the current call stack unwinds
    fn close_later(&self, hop: Hop<'_>, leg: Line) {
        let guard = leg.lock();
        hop.defer(leg.worker(), move |hop| {
            let leg = guard.line();
            if leg.is_alive() && leg.take_state::<ClientState>(hop.index()).is_some() {
                hop.next_finish(leg);
                leg.destroy();
            }
        });
    }
}

impl Tunnel for HalfDuplexClient {
    fn tag(&self) -> &str {
        &self.tag
    }

    fn upstream_init(&self, hop: Hop<'_>, line: &Line) {
        let link = Rc::new(RefCell::new(Link {
            main: Some(line.clone()),
            ..Link::default()
        }));
        line.set_state(
            hop.index(),
            ClientState {
                link: link.clone(),
                role: Role::Main,
            },
        );

        let _guard = line.lock();
        // A dead upload leg has already finished the main line
        if !self.open_leg(hop, line, &link, Role::Upload) || !line.is_alive() {
            return;
        }
        self.open_leg(hop, line, &link, Role::Download);
    }

    fn upstream_establish(&self, hop: Hop<'_>, _line: &Line) {
        hop.violation(Event::UpstreamEstablish);
    }

    fn upstream_payload(&self, hop: Hop<'_>, line: &Line, buf: Buffer) {
        let Some((link, _)) = self.state(hop, line) else {
            line.pool().release(buf);
            return;
        };
        let (upload, download, first) = {
            let mut link = link.borrow_mut();
            let first = !link.first_packet_sent;
            link.first_packet_sent = true;
            (link.upload.clone(), link.download.clone(), first)
        };

        match (upload, download) {
            (Some(upload), Some(download)) if first => {
                self.send_intros(hop, line, &upload, &download, buf)
            }
            (Some(upload), _) => hop.next_payload(&upload, buf),
            _ => line.pool().release(buf),
        }
    }

    fn upstream_pause(&self, hop: Hop<'_>, line: &Line) {
        let download = self
            .state(hop, line)
            .and_then(|(link, _)| link.borrow().download.clone());
        if let Some(download) = download {
            hop.next_pause(&download);
        }
    }

    fn upstream_resume(&self, hop: Hop<'_>, line: &Line) {
        let download = self
            .state(hop, line)
            .and_then(|(link, _)| link.borrow().download.clone());
        if let Some(download) = download {
            hop.next_resume(&download);
        }
    }

    fn upstream_finish(&self, hop: Hop<'_>, line: &Line) {
        let Some(state) = line.take_state::<ClientState>(hop.index()) else {
            return;
        };
        let (upload, download) = {
            let mut link = state.link.borrow_mut();
            link.main = None;
            (link.upload.take(), link.download.take())
        };
        debug!("[{}] {} finished by source", self.tag, line);

        for leg in [upload, download].into_iter().flatten() {
            if leg.take_state::<ClientState>(hop.index()).is_some() {
                let _guard = leg.lock();
                hop.next_finish(&leg);
                leg.destroy();
            }
        }
    }

    fn downstream_init(&self, hop: Hop<'_>, _line: &Line) {
        hop.violation(Event::DownstreamInit);
    }

    fn downstream_establish(&self, hop: Hop<'_>, line: &Line) {
        let Some((link, role)) = self.state(hop, line) else {
            return;
        };
        if role == Role::Main {
            hop.violation(Event::DownstreamEstablish);
        }
        line.mark_established();

        let main = {
            let mut link = link.borrow_mut();
            let ready = !link.established
                && link.upload.as_ref().is_some_and(Line::is_established)
                && link.download.as_ref().is_some_and(Line::is_established);
            if ready {
                link.established = true;
                link.main.clone()
            } else {
                None
            }
        };
        if let Some(main) = main {
            debug!("[{}] {} established over both legs", self.tag, main);
            hop.prev_establish(&main);
        }
    }

    fn downstream_payload(&self, hop: Hop<'_>, line: &Line, buf: Buffer) {
        let target = self.state(hop, line).and_then(|(link, role)| match role {
            Role::Download => link.borrow().main.clone(),
            _ => None,
        });
        match target {
            Some(main) => hop.prev_payload(&main, buf),
            None => {
                trace!("[{}] dropping downstream payload on {}", self.tag, line);
                line.pool().release(buf);
            }
        }
    }

    fn downstream_pause(&self, hop: Hop<'_>, line: &Line) {
        let target = self.state(hop, line).and_then(|(link, role)| match role {
            Role::Upload => link.borrow().main.clone(),
            _ => None,
        });
        if let Some(main) = target {
            hop.prev_pause(&main);
        }
    }

    fn downstream_resume(&self, hop: Hop<'_>, line: &Line) {
        let target = self.state(hop, line).and_then(|(link, role)| match role {
            Role::Upload => link.borrow().main.clone(),
            _ => None,
        });
        if let Some(main) = target {
            hop.prev_resume(&main);
        }
    }

    fn downstream_finish(&self, hop: Hop<'_>, line: &Line) {
        let Some(state) = line.take_state::<ClientState>(hop.index()) else {
            return;
        };
        if state.role == Role::Main {
            hop.violation(Event::DownstreamFinish);
        }
        let (main, sibling) = {
            let mut link = state.link.borrow_mut();
            let sibling = match state.role {
                Role::Upload => {
                    link.upload = None;
                    link.download.take()
                }
                _ => {
                    link.download = None;
                    link.upload.take()
                }
            };
            (link.main.take(), sibling)
        };
        debug!("[{}] {:?} leg {} closed", self.tag, state.role, line);

        if let Some(sibling) = sibling {
            self.close_later(hop, sibling);
        }
        if let Some(main) = main {
            if main.take_state::<ClientState>(hop.index()).is_some() {
                hop.prev_finish(&main);
            }
        }
        line.destroy();
    }
}
