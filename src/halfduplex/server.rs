//! HalfDuplex server - pairs an upload and a download leg into a main line

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::app::metrics::{HALFDUPLEX_PAIRS_ACTIVE, HALFDUPLEX_UNPAIRED_DROPPED};
use crate::buffer::Buffer;
use crate::tunnel::{Event, Hop, Line, Tunnel};
use crate::worker::TimerHandle;

use super::{decode_intro, INTRO_LEN, MAX_UNPAIRED_BUFFER};

/// Lines of one paired connection
struct Pair {
    id: u64,
    main: Option<Line>,
    upload: Option<Line>,
    download: Option<Line>,
    /// The upload leg was paused on behalf of the main line
    upload_paused: bool,
    /// The main line was paused on behalf of the download leg
    main_paused: bool,
}

enum Phase {
    /// Collecting the intro
    Unknown(Option<Buffer>),
    UploadWaiting { id: u64, pending: Option<Buffer> },
    DownloadWaiting { id: u64 },
    Upload(Rc<RefCell<Pair>>),
    Download(Rc<RefCell<Pair>>),
    Main(Rc<RefCell<Pair>>),
}

struct ServerState {
    phase: Phase,
    timer: Option<TimerHandle>,
}

/// Pairing tables of one worker
#[derive(Default)]
struct ServerLocal {
    uploads: HashMap<u64, Line>,
    downloads: HashMap<u64, Line>,
    paired: HashSet<u64>,
}

/// What to do with a leg whose intro is complete
enum Intro {
    Wait,
    Pair {
        id: u64,
        upload: Line,
        download: Line,
        pending: Option<Buffer>,
    },
    Reject(&'static str),
}

/// Outcome of a payload on a leg
enum Step {
    Intro(Buffer),
    Forward(Line, Buffer),
    Overflow,
    Drop(Buffer),
    Done,
}

/// Release everything an unpaired leg holds and remove it from the tables
fn forget_unpaired(hop: Hop<'_>, line: &Line, state: ServerState) {
    if let Some(timer) = state.timer {
        line.worker().cancel(timer);
    }
    match state.phase {
        Phase::Unknown(pending) | Phase::UploadWaiting { pending, .. } => {
            if let Some(buf) = pending {
                line.pool().release(buf);
            }
        }
        _ => {}
    }
    hop.worker_local::<ServerLocal, _>(line.worker(), |local| {
        local.uploads.retain(|_, l| !l.ptr_eq(line));
        local.downloads.retain(|_, l| !l.ptr_eq(line));
    });
}

/// Fail a leg that never got paired
fn reject(tag: &str, hop: Hop<'_>, line: &Line, reason: &'static str) {
    let Some(state) = line.take_state::<ServerState>(hop.index()) else {
        return;
    };
    warn!("[{}] dropping unpaired leg {}: {}", tag, line, reason);
    HALFDUPLEX_UNPAIRED_DROPPED
        .with_label_values(&[tag, reason])
        .inc();
    forget_unpaired(hop, line, state);
    hop.prev_finish(line);
}

/// Pairing timer of one leg
fn expire(tag: &str, hop: Hop<'_>, line: &Line) {
    let unpaired = line
        .with_state(hop.index(), |s: &mut ServerState| {
            s.timer = None;
            matches!(
                s.phase,
                Phase::Unknown(_) | Phase::UploadWaiting { .. } | Phase::DownloadWaiting { .. }
            )
        })
        .unwrap_or(false);
    if unpaired && line.is_alive() {
        reject(tag, hop, line, "timeout");
    }
}

/// Server half of the half-duplex pair
pub struct HalfDuplexServer {
    tag: String,
    pairing_timeout: Duration,
}

impl HalfDuplexServer {
    pub fn new(tag: impl Into<String>, pairing_timeout: Duration) -> Self {
        Self {
            tag: tag.into(),
            pairing_timeout,
        }
    }

    fn pair_of(&self, hop: Hop<'_>, line: &Line) -> Option<Rc<RefCell<Pair>>> {
        line.with_state(hop.index(), |s: &mut ServerState| match &s.phase {
            Phase::Upload(pair) | Phase::Download(pair) | Phase::Main(pair) => Some(pair.clone()),
            _ => None,
        })
        .flatten()
    }

    /// Decide what a leg with a complete intro turns into
    fn register(&self, hop: Hop<'_>, line: &Line, mut buf: Buffer) -> Intro {
        let Some((id, download)) = decode_intro(buf.as_slice()) else {
            line.pool().release(buf);
            return Intro::Reject("bad-intro");
        };
        buf.advance(INTRO_LEN);
        let pending = if download || buf.is_empty() {
            line.pool().release(buf);
            None
        } else {
            Some(buf)
        };

        let outcome = hop.worker_local::<ServerLocal, _>(line.worker(), |local| {
            if local.paired.contains(&id) {
                return Err("already-paired");
            }
            let (own, other) = if download {
                (&mut local.downloads, &mut local.uploads)
            } else {
                (&mut local.uploads, &mut local.downloads)
            };
            if let Some(sibling) = other.remove(&id) {
                local.paired.insert(id);
                return Ok(Some(sibling));
            }
            if own.contains_key(&id) {
                return Err("duplicate");
            }
            own.insert(id, line.clone());
            Ok(None)
        });

        match outcome {
            Err(reason) => {
                if let Some(buf) = pending {
                    line.pool().release(buf);
                }
                Intro::Reject(reason)
            }
            Ok(None) => {
                trace!("[{}] {} waiting for its sibling as {:016x}", self.tag, line, id);
                line.with_state(hop.index(), |s: &mut ServerState| {
                    s.phase = if download {
                        Phase::DownloadWaiting { id }
                    } else {
                        Phase::UploadWaiting { id, pending }
                    };
                });
                Intro::Wait
            }
            Ok(Some(sibling)) if download => {
                let pending = sibling
                    .with_state(hop.index(), |s: &mut ServerState| match &mut s.phase {
                        Phase::UploadWaiting { pending, .. } => pending.take(),
                        _ => None,
                    })
                    .flatten();
                Intro::Pair {
                    id,
                    upload: sibling,
                    download: line.clone(),
                    pending,
                }
            }
            Ok(Some(sibling)) => Intro::Pair {
                id,
                upload: line.clone(),
                download: sibling,
                pending,
            },
        }
    }

    /// Join two legs and open the main line towards the next stage
    fn pair(&self, hop: Hop<'_>, id: u64, upload: Line, download: Line, pending: Option<Buffer>) {
        let slot = hop.index();
        let main = hop.create_line(upload.worker());
        *main.routing_mut() = upload.routing().clone();
        let pair = Rc::new(RefCell::new(Pair {
            id,
            main: Some(main.clone()),
            upload: Some(upload.clone()),
            download: Some(download.clone()),
            upload_paused: false,
            main_paused: false,
        }));

        for (leg, phase) in [
            (&upload, Phase::Upload(pair.clone())),
            (&download, Phase::Download(pair.clone())),
        ] {
            let timer = leg.with_state(slot, |s: &mut ServerState| {
                s.phase = phase;
                s.timer.take()
            });
            if let Some(Some(timer)) = timer {
                leg.worker().cancel(timer);
            }
        }
        main.set_state(
            slot,
            ServerState {
                phase: Phase::Main(pair),
                timer: None,
            },
        );
        HALFDUPLEX_PAIRS_ACTIVE.with_label_values(&[&self.tag]).inc();
        debug!(
            "[{}] paired {} and {} as {} ({:016x})",
            self.tag, upload, download, main, id
        );

        let _guard = main.lock();
        hop.next_init(&main);
        match pending {
            Some(buf) if main.is_alive() => hop.next_payload(&main, buf),
            Some(buf) => main.pool().release(buf),
            None => {}
        }
    }

    /// Forget a pair once; returns false if it was already torn down
    fn unpair(&self, hop: Hop<'_>, line: &Line, id: u64) -> bool {
        let removed =
            hop.worker_local::<ServerLocal, _>(line.worker(), |local| local.paired.remove(&id));
        if removed {
            HALFDUPLEX_PAIRS_ACTIVE.with_label_values(&[&self.tag]).dec();
        }
        removed
    }

    /// Finish `leg` after the current call stack unwinds
    fn close_later(&self, hop: Hop<'_>, leg: Line) {
        let guard = leg.lock();
        hop.defer(leg.worker(), move |hop| {
            let leg = guard.line();
            if leg.is_alive() && leg.take_state::<ServerState>(hop.index()).is_some() {
                hop.prev_finish(leg);
            }
        });
    }

    /// A paired leg went away: resume its sibling, finish main, close the sibling
    fn finish_direct(&self, hop: Hop<'_>, line: &Line, pair: Rc<RefCell<Pair>>, upload: bool) {
        let (id, main, sibling, sibling_paused) = {
            let mut pair = pair.borrow_mut();
            if upload {
                pair.upload = None;
            } else {
                pair.download = None;
            }
            let sibling = if upload {
                pair.download.take()
            } else {
                pair.upload.take()
            };
            let sibling_paused = !upload && std::mem::take(&mut pair.upload_paused);
            (pair.id, pair.main.take(), sibling, sibling_paused)
        };
        self.unpair(hop, line, id);
        debug!("[{}] leg {} of {:016x} closed", self.tag, line, id);

        if let Some(sibling) = &sibling {
            if sibling_paused {
                hop.prev_resume(sibling);
            }
        }
        if let Some(main) = main {
            if main.take_state::<ServerState>(hop.index()).is_some() {
                let _guard = main.lock();
                hop.next_finish(&main);
                main.destroy();
            }
        }
        if let Some(sibling) = sibling {
            if sibling.is_alive() {
                self.close_later(hop, sibling);
            }
        }
    }
}

impl Tunnel for HalfDuplexServer {
    fn tag(&self) -> &str {
        &self.tag
    }

    fn upstream_init(&self, hop: Hop<'_>, line: &Line) {
        let tag = self.tag.clone();
        let leg = line.clone();
        let timer = hop.schedule(line.worker(), self.pairing_timeout, false, move |hop| {
            trace!("[{}] pairing timer fired for {}", tag, leg);
            expire(&tag, hop, &leg);
        });
        line.set_state(
            hop.index(),
            ServerState {
                phase: Phase::Unknown(None),
                timer: Some(timer),
            },
        );
        trace!("[{}] leg {} accepted", self.tag, line);
        hop.prev_establish(line);
    }

    fn upstream_establish(&self, hop: Hop<'_>, _line: &Line) {
        hop.violation(Event::UpstreamEstablish);
    }

    fn upstream_payload(&self, hop: Hop<'_>, line: &Line, buf: Buffer) {
        let slot = hop.index();
        let pool = line.pool();
        if !line.has_state::<ServerState>(slot) {
            pool.release(buf);
            return;
        }

        let step = line.with_state(slot, |s: &mut ServerState| match &mut s.phase {
            Phase::Unknown(pending) => {
                let merged = match pending.take() {
                    Some(mut head) => {
                        head.extend_from_slice(buf.as_slice());
                        pool.release(buf);
                        head
                    }
                    None => buf,
                };
                if merged.len() < INTRO_LEN {
                    *pending = Some(merged);
                    Step::Done
                } else {
                    Step::Intro(merged)
                }
            }
            Phase::UploadWaiting { pending, .. } => {
                let total = match pending {
                    Some(head) => {
                        head.extend_from_slice(buf.as_slice());
                        pool.release(buf);
                        head.len()
                    }
                    None => {
                        let len = buf.len();
                        *pending = Some(buf);
                        len
                    }
                };
                if total > MAX_UNPAIRED_BUFFER {
                    Step::Overflow
                } else {
                    Step::Done
                }
            }
            Phase::Upload(pair) => match pair.borrow().main.clone() {
                Some(main) => Step::Forward(main, buf),
                None => Step::Drop(buf),
            },
            Phase::DownloadWaiting { .. } | Phase::Download(_) | Phase::Main(_) => Step::Drop(buf),
        });

        match step {
            None | Some(Step::Done) => {}
            Some(Step::Drop(buf)) => pool.release(buf),
            Some(Step::Forward(main, buf)) => hop.next_payload(&main, buf),
            Some(Step::Overflow) => reject(&self.tag, hop, line, "overflow"),
            Some(Step::Intro(buf)) => match self.register(hop, line, buf) {
                Intro::Wait => {}
                Intro::Reject(reason) => reject(&self.tag, hop, line, reason),
                Intro::Pair {
                    id,
                    upload,
                    download,
                    pending,
                } => self.pair(hop, id, upload, download, pending),
            },
        }
    }

    fn upstream_pause(&self, hop: Hop<'_>, line: &Line) {
        let Some(pair) = self.pair_of(hop, line) else {
            return;
        };
        let main = {
            let mut pair = pair.borrow_mut();
            match &pair.download {
                Some(download) if download.ptr_eq(line) && !pair.main_paused => {
                    pair.main_paused = true;
                    pair.main.clone()
                }
                _ => None,
            }
        };
        if let Some(main) = main {
            hop.next_pause(&main);
        }
    }

    fn upstream_resume(&self, hop: Hop<'_>, line: &Line) {
        let Some(pair) = self.pair_of(hop, line) else {
            return;
        };
        let main = {
            let mut pair = pair.borrow_mut();
            match &pair.download {
                Some(download) if download.ptr_eq(line) && pair.main_paused => {
                    pair.main_paused = false;
                    pair.main.clone()
                }
                _ => None,
            }
        };
        if let Some(main) = main {
            hop.next_resume(&main);
        }
    }

    fn upstream_finish(&self, hop: Hop<'_>, line: &Line) {
        let Some(mut state) = line.take_state::<ServerState>(hop.index()) else {
            return;
        };
        if let Some(timer) = state.timer.take() {
            line.worker().cancel(timer);
        }
        match state.phase {
            Phase::Upload(pair) => self.finish_direct(hop, line, pair, true),
            Phase::Download(pair) => self.finish_direct(hop, line, pair, false),
            Phase::Main(_) => hop.violation(Event::UpstreamFinish),
            phase => {
                trace!("[{}] unpaired leg {} closed", self.tag, line);
                forget_unpaired(hop, line, ServerState { phase, timer: None });
            }
        }
    }

    fn downstream_init(&self, hop: Hop<'_>, _line: &Line) {
        hop.violation(Event::DownstreamInit);
    }

    fn downstream_establish(&self, hop: Hop<'_>, line: &Line) {
        if self.pair_of(hop, line).is_none() {
            hop.violation(Event::DownstreamEstablish);
        }
        line.mark_established();
    }

    fn downstream_payload(&self, hop: Hop<'_>, line: &Line, buf: Buffer) {
        let download = self
            .pair_of(hop, line)
            .and_then(|pair| pair.borrow().download.clone());
        match download {
            Some(download) => hop.prev_payload(&download, buf),
            None => line.pool().release(buf),
        }
    }

    fn downstream_pause(&self, hop: Hop<'_>, line: &Line) {
        let Some(pair) = self.pair_of(hop, line) else {
            return;
        };
        let upload = {
            let mut pair = pair.borrow_mut();
            if pair.upload_paused {
                None
            } else {
                pair.upload_paused = pair.upload.is_some();
                pair.upload.clone()
            }
        };
        if let Some(upload) = upload {
            hop.prev_pause(&upload);
        }
    }

    fn downstream_resume(&self, hop: Hop<'_>, line: &Line) {
        let Some(pair) = self.pair_of(hop, line) else {
            return;
        };
        let upload = {
            let mut pair = pair.borrow_mut();
            if std::mem::take(&mut pair.upload_paused) {
                pair.upload.clone()
            } else {
                None
            }
        };
        if let Some(upload) = upload {
            hop.prev_resume(&upload);
        }
    }

    fn downstream_finish(&self, hop: Hop<'_>, line: &Line) {
        let slot = hop.index();
        let Some(state) = line.take_state::<ServerState>(slot) else {
            return;
        };
        let Phase::Main(pair) = state.phase else {
            hop.violation(Event::DownstreamFinish);
        };
        let (id, upload, download, upload_paused) = {
            let mut pair = pair.borrow_mut();
            pair.main = None;
            (
                pair.id,
                pair.upload.take(),
                pair.download.take(),
                std::mem::take(&mut pair.upload_paused),
            )
        };
        self.unpair(hop, line, id);
        debug!("[{}] {} ({:016x}) closed by target", self.tag, line, id);

        let _guard = line.lock();
        if let Some(upload) = &upload {
            if upload_paused {
                hop.prev_resume(upload);
            }
        }
        if let Some(download) = download {
            if download.take_state::<ServerState>(slot).is_some() {
                hop.prev_finish(&download);
            }
        }
        if let Some(upload) = upload {
            if upload.is_alive() {
                self.close_later(hop, upload);
            }
        }
        line.destroy();
    }
}
