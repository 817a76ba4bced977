//! HalfDuplex - one logical line over two physical legs
//!
//! ```text
//!                 ┌─ upload leg ───(intro + payload)──▶┐
//!   main ─ HalfDuplexClient                         HalfDuplexServer ─ main
//!                 └─ download leg ◀──(payload)─────────┘
//! ```
//!
//! Every leg starts with an 8-byte big-endian identifier. The top bit of the
//! first byte is set on the download leg and cleared on the upload leg; the
//! server pairs the two legs carrying the same identifier.

mod client;
mod server;

pub use client::HalfDuplexClient;
pub use server::HalfDuplexServer;

use std::time::Duration;

/// Length of the identifier that opens each leg
pub const INTRO_LEN: usize = 8;

/// Marks the download leg in the first identifier byte
const DOWNLOAD_BIT: u8 = 0x80;

/// Bytes an unpaired upload leg may hold before it is dropped
pub const MAX_UNPAIRED_BUFFER: usize = 65535 * 2;

/// How long a leg may wait for its sibling by default
pub const DEFAULT_PAIRING_TIMEOUT: Duration = Duration::from_secs(10);

/// Encode the intro of one leg
pub fn encode_intro(id: u64, download: bool) -> [u8; INTRO_LEN] {
    let mut bytes = id.to_be_bytes();
    if download {
        bytes[0] |= DOWNLOAD_BIT;
    } else {
        bytes[0] &= !DOWNLOAD_BIT;
    }
    bytes
}

/// Decode an intro into the pairing identifier and whether it opens the download leg
pub fn decode_intro(bytes: &[u8]) -> Option<(u64, bool)> {
    let intro: [u8; INTRO_LEN] = bytes.get(..INTRO_LEN)?.try_into().ok()?;
    let download = intro[0] & DOWNLOAD_BIT != 0;
    let id = u64::from_be_bytes(intro) & !((DOWNLOAD_BIT as u64) << 56);
    Some((id, download))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::testing::{Probe, Recorded};
    use crate::tunnel::Chain;
    use crate::worker::WorkerLoop;

    #[test]
    fn test_intro_marks_direction() {
        let id = 0x8123_4567_89ab_cdef;
        let down = encode_intro(id, true);
        let up = encode_intro(id, false);
        assert_eq!(down[0], 0x81);
        assert_eq!(up[0], 0x01);
        assert_eq!(&down[1..], &up[1..]);

        assert_eq!(decode_intro(&down), Some((0x0123_4567_89ab_cdef, true)));
        assert_eq!(decode_intro(&up), Some((0x0123_4567_89ab_cdef, false)));
        assert_eq!(decode_intro(&up[..7]), None);
    }

    fn setup() -> (WorkerLoop, Probe, Probe, Arc<Chain>) {
        let wl = WorkerLoop::standalone();
        let head = Probe::head();
        let tail = Probe::tail().auto_establish();
        let chain = Chain::builder("halfduplex-pair")
            .stage(head.clone())
            .stage(HalfDuplexClient::new("hd-client"))
            .stage(HalfDuplexServer::new("hd-server", DEFAULT_PAIRING_TIMEOUT))
            .stage(tail.clone())
            .build()
            .unwrap();
        (wl, head, tail, chain)
    }

    #[test]
    fn test_round_trip_through_both_legs() {
        let (mut wl, head, tail, chain) = setup();
        let main = head.open(&chain, wl.worker());
        assert_eq!(head.events(), vec![Recorded::Establish(main.id())]);
        // The far side only sees a main line once the intros arrive
        assert!(tail.lines(&chain, wl.worker()).is_empty());

        head.send(&chain, &main, b"request");
        head.send(&chain, &main, b" more");
        let far = tail.last_line(&chain, wl.worker()).unwrap();
        assert!(far.is_established());
        assert_eq!(tail.payload_bytes_for(far.id()), b"request more".to_vec());

        tail.send(&chain, &far, b"response");
        assert_eq!(head.payload_bytes_for(main.id()), b"response".to_vec());

        head.finish(&chain, &main);
        wl.run_until_idle();
        assert!(!far.is_alive());
        assert_eq!(tail.count(|e| *e == Recorded::Finish(far.id())), 1);
        assert_eq!(wl.worker().pool().in_use(), 0);
    }

    #[test]
    fn test_far_finish_tears_down_main() {
        let (mut wl, head, tail, chain) = setup();
        let main = head.open(&chain, wl.worker());
        head.send(&chain, &main, b"hi");
        let far = tail.last_line(&chain, wl.worker()).unwrap();

        tail.finish(&chain, &far);
        wl.run_until_idle();
        assert!(!far.is_alive());
        assert!(!main.is_alive());
        assert_eq!(head.count(|e| *e == Recorded::Finish(main.id())), 1);
    }

    #[test]
    fn test_backpressure_crosses_the_pair() {
        let (wl, head, tail, chain) = setup();
        let main = head.open(&chain, wl.worker());
        head.send(&chain, &main, b"hi");
        let far = tail.last_line(&chain, wl.worker()).unwrap();

        // Far target stalls: the client main stops producing
        tail.pause(&chain, &far);
        assert_eq!(head.count(|e| *e == Recorded::Pause(main.id())), 1);
        tail.resume(&chain, &far);
        assert_eq!(head.count(|e| *e == Recorded::Resume(main.id())), 1);

        // Originator stalls: the far main stops producing
        head.pause(&chain, &main);
        assert_eq!(tail.count(|e| *e == Recorded::Pause(far.id())), 1);
        head.resume(&chain, &main);
        assert_eq!(tail.count(|e| *e == Recorded::Resume(far.id())), 1);
    }
}
