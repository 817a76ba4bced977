//! Chain - an ordered, immutable list of stages

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use tracing::debug;

use crate::error::{Error, Result};

use super::{contract_violation, Hop, Tunnel};

static NEXT_CHAIN_ID: AtomicU64 = AtomicU64::new(1);

/// One route: stage 0 is the head, the last stage is the tail
pub struct Chain {
    id: u64,
    tag: String,
    stages: Vec<Arc<dyn Tunnel>>,
    this: Weak<Chain>,
}

impl Chain {
    pub fn builder(tag: impl Into<String>) -> ChainBuilder {
        ChainBuilder {
            tag: tag.into(),
            stages: Vec::new(),
        }
    }

    /// Process-unique id, used to key worker-local stage state
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn stage(&self, index: usize) -> &dyn Tunnel {
        match self.stages.get(index) {
            Some(stage) => stage.as_ref(),
            None => contract_violation(
                &self.tag,
                format_args!("stage {} of a {}-stage chain", index, self.stages.len()),
            ),
        }
    }

    /// Position of stage `index`, for code running outside an event
    pub fn hop(&self, index: usize) -> Hop<'_> {
        self.stage(index);
        Hop::new(self, index)
    }

    pub fn head(&self) -> Hop<'_> {
        self.hop(0)
    }

    /// Owned handle, for callbacks that outlive the current event
    pub fn handle(&self) -> Arc<Chain> {
        match self.this.upgrade() {
            Some(chain) => chain,
            None => contract_violation(&self.tag, "chain used after drop"),
        }
    }
}

impl std::fmt::Debug for Chain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tags: Vec<&str> = self.stages.iter().map(|s| s.tag()).collect();
        f.debug_struct("Chain")
            .field("id", &self.id)
            .field("tag", &self.tag)
            .field("stages", &tags)
            .finish()
    }
}

/// Builder for [`Chain`]
pub struct ChainBuilder {
    tag: String,
    stages: Vec<Arc<dyn Tunnel>>,
}

impl ChainBuilder {
    /// Append a stage
    pub fn stage(mut self, stage: impl Tunnel + 'static) -> Self {
        self.stages.push(Arc::new(stage));
        self
    }

    /// Append an already shared stage
    pub fn shared_stage(mut self, stage: Arc<dyn Tunnel>) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn build(self) -> Result<Arc<Chain>> {
        if self.stages.is_empty() {
            return Err(Error::Config(format!("chain '{}' has no stages", self.tag)));
        }
        let chain = Arc::new_cyclic(|this| Chain {
            id: NEXT_CHAIN_ID.fetch_add(1, Ordering::Relaxed),
            tag: self.tag,
            stages: self.stages,
            this: this.clone(),
        });
        debug!("[{}] built {:?}", chain.tag, chain);
        Ok(chain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Probe, Recorded};
    use crate::worker::WorkerLoop;

    struct Passthrough;

    impl Tunnel for Passthrough {
        fn tag(&self) -> &str {
            "pass"
        }
    }

    #[test]
    fn test_empty_chain_rejected() {
        assert!(matches!(
            Chain::builder("empty").build(),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_chain_ids_unique() {
        let a = Chain::builder("a").stage(Passthrough).build().unwrap();
        let b = Chain::builder("b").stage(Passthrough).build().unwrap();
        assert_ne!(a.id(), b.id());
        assert_eq!(a.len(), 1);
    }

    #[test]
    fn test_default_stage_forwards_every_event() {
        let mut wl = WorkerLoop::standalone();
        let head = Probe::head();
        let tail = Probe::tail().auto_establish();
        let chain = Chain::builder("pass")
            .stage(head.clone())
            .stage(Passthrough)
            .stage(Passthrough)
            .stage(tail.clone())
            .build()
            .unwrap();

        let line = head.open(&chain, wl.worker());
        head.send(&chain, &line, b"ping");
        head.pause(&chain, &line);
        head.resume(&chain, &line);

        let far = tail.last_line(&chain, wl.worker()).unwrap();
        tail.send(&chain, &far, b"pong");
        tail.pause(&chain, &far);
        tail.resume(&chain, &far);
        head.finish(&chain, &line);
        wl.run_until_idle();

        assert_eq!(
            tail.events(),
            vec![
                Recorded::Init(line.id()),
                Recorded::Payload(line.id(), b"ping".to_vec()),
                Recorded::Pause(line.id()),
                Recorded::Resume(line.id()),
                Recorded::Finish(line.id()),
            ]
        );
        assert_eq!(
            head.events(),
            vec![
                Recorded::Establish(line.id()),
                Recorded::Payload(line.id(), b"pong".to_vec()),
                Recorded::Pause(line.id()),
                Recorded::Resume(line.id()),
            ]
        );
        assert!(!line.is_alive());
        assert_eq!(wl.worker().pool().in_use(), 0);
    }

    #[test]
    fn test_payload_to_dead_line_is_released() {
        let wl = WorkerLoop::standalone();
        let head = Probe::head();
        let tail = Probe::tail();
        let chain = Chain::builder("dead")
            .stage(head.clone())
            .stage(tail.clone())
            .build()
            .unwrap();

        let line = head.open(&chain, wl.worker());
        let guard = line.lock();
        head.finish(&chain, &line);
        assert!(!line.is_alive());

        let buf = wl.worker().pool().acquire_from(b"late");
        chain.head().next_payload(&line, buf);
        drop(guard);

        assert_eq!(tail.payload_bytes(), Vec::<u8>::new());
        assert_eq!(wl.worker().pool().in_use(), 0);
    }
}
