//! Runtime - Configuration-driven chain construction
//!
//! The runtime is responsible for:
//! - Building a chain of stages per configured chain
//! - Spawning the worker threads that own every line
//! - Starting listeners and the optional stats API
//! - Shutting everything down on Ctrl+C

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::LocalSet;
use tracing::{debug, error, info, warn};

use crate::adapter::{TcpConnector, TcpListener};
use crate::buffer::PoolConfig;
use crate::config::{ChainConfig, Config, Node};
use crate::error::{Error, Result};
use crate::halfduplex::{HalfDuplexClient, HalfDuplexServer};
use crate::mux::{MuxClient, MuxServer};
use crate::tunnel::Chain;
use crate::worker::{Mailboxes, WorkerLoop};

use super::metrics::{LINES_ACTIVE, LINES_CREATED};
use super::stats_api::start_api_server;

/// A built chain and the listener at its head
struct ChainEntry {
    chain: Arc<Chain>,
    listener: Arc<TcpListener>,
}

/// Owns the chains, worker threads and shutdown signal
pub struct Runtime {
    workers: usize,
    api: Option<SocketAddr>,
    chains: Vec<ChainEntry>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Runtime {
    /// Create runtime from config
    pub fn from_config(config: &Config) -> Result<Self> {
        config.validate()?;
        let api = config
            .api
            .as_ref()
            .map(|api| {
                api.listen
                    .parse::<SocketAddr>()
                    .map_err(|_| Error::Config(format!("Invalid api listen address: {}", api.listen)))
            })
            .transpose()?;

        let chains = config
            .chains
            .iter()
            .map(Self::build_chain)
            .collect::<Result<Vec<_>>>()?;

        let (shutdown_tx, _) = broadcast::channel(1);
        Ok(Self {
            workers: config.workers,
            api,
            chains,
            threads: Mutex::new(Vec::new()),
            shutdown_tx,
        })
    }

    fn build_chain(config: &ChainConfig) -> Result<ChainEntry> {
        let nodes = config.nodes()?;
        let mut builder = Chain::builder(config.tag.clone());
        let mut listener = None;

        for (node, raw) in nodes.into_iter().zip(&config.nodes) {
            let tag = raw
                .tag
                .clone()
                .unwrap_or_else(|| format!("{}/{:?}", config.tag, raw.node_type));
            debug!("Building node [{}]", tag);

            builder = match node {
                Node::TcpListener(settings) => {
                    let stage = Arc::new(TcpListener::new(tag, settings.address, settings.balance));
                    listener = Some(stage.clone());
                    builder.shared_stage(stage)
                }
                Node::TcpConnector(settings) => builder.stage(TcpConnector::new(tag, settings.address)),
                Node::MuxClient(policy) => builder.stage(MuxClient::new(tag, policy)),
                Node::MuxServer => builder.stage(MuxServer::new(tag)),
                Node::HalfDuplexClient => builder.stage(HalfDuplexClient::new(tag)),
                Node::HalfDuplexServer(settings) => {
                    builder.stage(HalfDuplexServer::new(tag, settings.pairing_timeout()))
                }
            };
        }

        let listener = listener
            .ok_or_else(|| Error::Config(format!("chain '{}' has no listener", config.tag)))?;
        let chain = builder.build()?;
        info!("Chain [{}] built with {} stages", chain.tag(), chain.len());
        Ok(ChainEntry { chain, listener })
    }

    /// Built chains, in configuration order
    pub fn chains(&self) -> impl Iterator<Item = &Arc<Chain>> {
        self.chains.iter().map(|entry| &entry.chain)
    }

    /// Sender that stops the runtime when signalled
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Run the runtime until Ctrl+C
    pub async fn run(&self) -> Result<()> {
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for Ctrl+C: {}", e);
            }
        })
        .await
    }

    /// Run the runtime until `stop` completes or the shutdown handle fires
    pub async fn run_until(&self, stop: impl Future<Output = ()>) -> Result<()> {
        let mailboxes = self.spawn_workers()?;

        let mut handles = Vec::new();
        for entry in &self.chains {
            let socket = match entry.listener.bind().await {
                Ok(socket) => socket,
                Err(e) => {
                    let _ = self.shutdown_tx.send(());
                    self.join_workers().await;
                    return Err(e);
                }
            };
            let listener = entry.listener.clone();
            let chain = entry.chain.clone();
            let mailboxes = mailboxes.clone();
            let shutdown_rx = self.shutdown_tx.subscribe();
            handles.push(tokio::spawn(async move {
                if let Err(e) = listener.serve(socket, chain, mailboxes, shutdown_rx).await {
                    error!("Listener error: {}", e);
                }
            }));
        }

        if let Some(addr) = self.api {
            handles.push(tokio::spawn(start_api_server(addr, self.shutdown_tx.subscribe())));
        }

        let mut stats_shutdown_rx = self.shutdown_tx.subscribe();
        handles.push(tokio::spawn(async move {
            stats_reporter(&mut stats_shutdown_rx).await;
        }));

        info!(
            "Runtime started with {} chains on {} workers",
            self.chains.len(),
            self.workers
        );

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::select! {
            _ = stop => {}
            _ = shutdown_rx.recv() => {}
        }
        info!("Shutting down...");
        log_stats();

        let _ = self.shutdown_tx.send(());
        for handle in handles {
            let _ = handle.await;
        }
        self.join_workers().await;
        Ok(())
    }

    /// One thread per worker, each a current-thread runtime driving a `LocalSet`
    fn spawn_workers(&self) -> Result<Mailboxes> {
        let (mailboxes, inboxes) = Mailboxes::new(self.workers);
        let mut threads = self.threads.lock();

        for (id, inbox) in inboxes.into_iter().enumerate() {
            let mailboxes = mailboxes.clone();
            let shutdown_rx = self.shutdown_tx.subscribe();
            let thread = std::thread::Builder::new()
                .name(format!("netchain-worker-{}", id))
                .spawn(move || {
                    let rt = match tokio::runtime::Builder::new_current_thread()
                        .enable_all()
                        .build()
                    {
                        Ok(rt) => rt,
                        Err(e) => {
                            error!("worker {} failed to start: {}", id, e);
                            return;
                        }
                    };
                    let worker = WorkerLoop::new(id, mailboxes, inbox, PoolConfig::default());
                    LocalSet::new().block_on(&rt, worker.run(shutdown_rx));
                })?;
            threads.push(thread);
        }
        Ok(mailboxes)
    }

    async fn join_workers(&self) {
        let threads: Vec<_> = self.threads.lock().drain(..).collect();
        let joined = tokio::task::spawn_blocking(move || {
            for thread in threads {
                if thread.join().is_err() {
                    warn!("worker thread panicked");
                }
            }
        })
        .await;
        if let Err(e) = joined {
            warn!("failed to join workers: {}", e);
        }
    }
}

/// Stats reporter task - logs line counts periodically
async fn stats_reporter(shutdown_rx: &mut broadcast::Receiver<()>) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // The first tick completes immediately
    interval.tick().await;

    loop {
        tokio::select! {
            _ = interval.tick() => log_stats(),
            _ = shutdown_rx.recv() => break,
        }
    }
}

fn log_stats() {
    info!(
        "Lines: {} active, {} created",
        LINES_ACTIVE.get(),
        LINES_CREATED.get()
    );
}
