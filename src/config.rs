//! Configuration module for Netchain
//!
//! A JSON document lists chains; each chain is an ordered list of nodes,
//! head first. Node settings are checked when the document is loaded.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::adapter::Balance;
use crate::common::Address;
use crate::error::{Error, Result};
use crate::mux::MuxPolicy;

/// Shortest mux timer window accepted
pub const MIN_MUX_DURATION_MS: u64 = 60;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Log configuration
    #[serde(default)]
    pub log: LogConfig,

    /// Number of worker threads
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// API configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api: Option<ApiConfig>,

    /// Chains, each served by its own listener
    #[serde(default)]
    pub chains: Vec<ChainConfig>,
}

/// API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Listen address for stats API (e.g., "127.0.0.1:9090")
    pub listen: String,
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

impl Config {
    /// Load configuration from a JSON file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;
        Self::from_json(&content)
    }

    /// Parse and validate configuration from JSON string
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(json)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check every chain and node
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(Error::Config("workers must be at least 1".into()));
        }
        if self.chains.is_empty() {
            return Err(Error::Config("no chains configured".into()));
        }
        for chain in &self.chains {
            let nodes = chain.nodes()?;
            // Half-duplex legs only pair on one worker; keep a client's
            // connections together
            let pairs = nodes.iter().any(|n| matches!(n, Node::HalfDuplexServer(_)));
            let sticky = matches!(
                nodes.first(),
                Some(Node::TcpListener(l)) if l.balance == Balance::SourceIp
            );
            if pairs && !sticky && self.workers > 1 {
                return Err(Error::Config(format!(
                    "chain '{}' has a HalfDuplexServer and {} workers; its TcpListener needs \"balance\": \"source-ip\"",
                    chain.tag, self.workers
                )));
            }
        }
        Ok(())
    }

    /// Sample client: local connections multiplexed over half-duplex legs
    pub fn default_client() -> Self {
        Config {
            log: LogConfig::default(),
            workers: default_workers(),
            api: None,
            chains: vec![ChainConfig {
                tag: "client".to_string(),
                nodes: vec![
                    NodeConfig::new(
                        NodeType::TcpListener,
                        serde_json::json!({ "address": "127.0.0.1:1080", "balance": "round-robin" }),
                    ),
                    NodeConfig::new(
                        NodeType::MuxClient,
                        serde_json::json!({ "mode": "counter", "connection-capacity": 8 }),
                    ),
                    NodeConfig::new(NodeType::HalfDuplexClient, serde_json::Value::Null),
                    NodeConfig::new(
                        NodeType::TcpConnector,
                        serde_json::json!({ "address": "server.example.com:443" }),
                    ),
                ],
            }],
        }
    }

    /// Sample server: pair the legs, split the mux, forward to a local service
    pub fn default_server() -> Self {
        Config {
            log: LogConfig::default(),
            workers: default_workers(),
            api: Some(ApiConfig {
                listen: "127.0.0.1:9090".to_string(),
            }),
            chains: vec![ChainConfig {
                tag: "server".to_string(),
                nodes: vec![
                    NodeConfig::new(
                        NodeType::TcpListener,
                        serde_json::json!({ "address": "0.0.0.0:443", "balance": "source-ip" }),
                    ),
                    NodeConfig::new(
                        NodeType::HalfDuplexServer,
                        serde_json::json!({ "pairing-timeout": 10000 }),
                    ),
                    NodeConfig::new(NodeType::MuxServer, serde_json::Value::Null),
                    NodeConfig::new(
                        NodeType::TcpConnector,
                        serde_json::json!({ "address": "127.0.0.1:8080" }),
                    ),
                ],
            }],
        }
    }
}

/// Log configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// One chain: nodes from head to tail
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainConfig {
    pub tag: String,
    pub nodes: Vec<NodeConfig>,
}

impl ChainConfig {
    /// Parse every node's settings
    pub fn nodes(&self) -> Result<Vec<Node>> {
        if self.nodes.len() < 2 {
            return Err(Error::Config(format!(
                "chain '{}' needs at least two nodes",
                self.tag
            )));
        }
        let nodes = self
            .nodes
            .iter()
            .map(|n| n.parse())
            .collect::<Result<Vec<_>>>()
            .map_err(|e| match e {
                Error::Config(msg) => Error::Config(format!("chain '{}': {}", self.tag, msg)),
                other => other,
            })?;

        if !matches!(nodes.first(), Some(Node::TcpListener(_))) {
            return Err(Error::Config(format!(
                "chain '{}' must start with a TcpListener",
                self.tag
            )));
        }
        if nodes[1..].iter().any(|n| matches!(n, Node::TcpListener(_))) {
            return Err(Error::Config(format!(
                "chain '{}' has a TcpListener after its head",
                self.tag
            )));
        }
        Ok(nodes)
    }
}

/// Node kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeType {
    TcpListener,
    TcpConnector,
    MuxClient,
    MuxServer,
    HalfDuplexClient,
    HalfDuplexServer,
}

/// A node as written in the config file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(rename = "type")]
    pub node_type: NodeType,

    /// Optional name used in logs; defaults to the chain tag plus node type
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,

    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub settings: serde_json::Value,
}

/// A node with typed, validated settings
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    TcpListener(TcpListenerSettings),
    TcpConnector(TcpConnectorSettings),
    MuxClient(MuxPolicy),
    MuxServer,
    HalfDuplexClient,
    HalfDuplexServer(HalfDuplexServerSettings),
}

impl NodeConfig {
    pub fn new(node_type: NodeType, settings: serde_json::Value) -> Self {
        Self {
            node_type,
            tag: None,
            settings,
        }
    }

    fn settings<T: serde::de::DeserializeOwned + Default>(&self) -> Result<T> {
        if self.settings.is_null() {
            return Ok(T::default());
        }
        serde_json::from_value(self.settings.clone())
            .map_err(|e| Error::Config(format!("{:?} settings: {}", self.node_type, e)))
    }

    /// Parse and check the settings for this node type
    pub fn parse(&self) -> Result<Node> {
        Ok(match self.node_type {
            NodeType::TcpListener => {
                if self.settings.is_null() {
                    return Err(Error::Config("TcpListener needs an address".into()));
                }
                let settings: TcpListenerSettings = serde_json::from_value(self.settings.clone())
                    .map_err(|e| Error::Config(format!("TcpListener settings: {}", e)))?;
                Node::TcpListener(settings)
            }
            NodeType::TcpConnector => {
                let raw: RawConnectorSettings = self.settings()?;
                let address = raw.address.as_deref().map(Address::parse).transpose()?;
                Node::TcpConnector(TcpConnectorSettings { address })
            }
            NodeType::MuxClient => {
                let raw: MuxClientSettings = self.settings()?;
                Node::MuxClient(raw.policy()?)
            }
            NodeType::MuxServer => Node::MuxServer,
            NodeType::HalfDuplexClient => Node::HalfDuplexClient,
            NodeType::HalfDuplexServer => {
                let settings: HalfDuplexServerSettings = self.settings()?;
                if settings.pairing_timeout == 0 {
                    return Err(Error::Config("pairing-timeout must be positive".into()));
                }
                Node::HalfDuplexServer(settings)
            }
        })
    }
}

/// TcpListener settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TcpListenerSettings {
    pub address: SocketAddr,
    #[serde(default)]
    pub balance: Balance,
}

#[derive(Debug, Default, Deserialize)]
struct RawConnectorSettings {
    #[serde(default)]
    address: Option<String>,
}

/// TcpConnector settings; without an address each line's destination is used
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TcpConnectorSettings {
    pub address: Option<Address>,
}

/// Mux client admission mode
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MuxMode {
    #[default]
    Counter,
    Timer,
}

/// MuxClient settings as written
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct MuxClientSettings {
    #[serde(default)]
    pub mode: MuxMode,
    #[serde(default = "default_connection_capacity")]
    pub connection_capacity: usize,
    /// Milliseconds
    #[serde(default = "default_connection_duration")]
    pub connection_duration: u64,
}

fn default_connection_capacity() -> usize {
    8
}

fn default_connection_duration() -> u64 {
    60_000
}

impl Default for MuxClientSettings {
    fn default() -> Self {
        Self {
            mode: MuxMode::default(),
            connection_capacity: default_connection_capacity(),
            connection_duration: default_connection_duration(),
        }
    }
}

impl MuxClientSettings {
    pub fn policy(&self) -> Result<MuxPolicy> {
        match self.mode {
            MuxMode::Counter => {
                if self.connection_capacity == 0 {
                    return Err(Error::Config(
                        "MuxClient connection-capacity must be greater than 0".into(),
                    ));
                }
                Ok(MuxPolicy::Counter {
                    capacity: self.connection_capacity,
                })
            }
            MuxMode::Timer => {
                if self.connection_duration <= MIN_MUX_DURATION_MS {
                    return Err(Error::Config(format!(
                        "MuxClient connection-duration must exceed {} ms",
                        MIN_MUX_DURATION_MS
                    )));
                }
                Ok(MuxPolicy::Timer {
                    duration: Duration::from_millis(self.connection_duration),
                })
            }
        }
    }
}

/// HalfDuplexServer settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct HalfDuplexServerSettings {
    /// Milliseconds an unpaired leg may wait
    #[serde(default = "default_pairing_timeout")]
    pub pairing_timeout: u64,
}

fn default_pairing_timeout() -> u64 {
    10_000
}

impl Default for HalfDuplexServerSettings {
    fn default() -> Self {
        Self {
            pairing_timeout: default_pairing_timeout(),
        }
    }
}

impl HalfDuplexServerSettings {
    pub fn pairing_timeout(&self) -> Duration {
        Duration::from_millis(self.pairing_timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain_json(nodes: &str) -> String {
        format!(r#"{{ "workers": 2, "chains": [ {{ "tag": "c", "nodes": {} }} ] }}"#, nodes)
    }

    #[test]
    fn test_parse_full_chain() {
        let json = r#"{
            "log": { "level": "debug" },
            "workers": 4,
            "api": { "listen": "127.0.0.1:9090" },
            "chains": [{
                "tag": "edge",
                "nodes": [
                    { "type": "TcpListener", "settings": { "address": "0.0.0.0:443", "balance": "source-ip" } },
                    { "type": "HalfDuplexServer", "settings": { "pairing-timeout": 5000 } },
                    { "type": "MuxServer" },
                    { "type": "TcpConnector", "tag": "backend", "settings": { "address": "127.0.0.1:8080" } }
                ]
            }]
        }"#;
        let config = Config::from_json(json).unwrap();
        assert_eq!(config.log.level, "debug");
        assert_eq!(config.workers, 4);
        assert_eq!(config.api.unwrap().listen, "127.0.0.1:9090");

        let chain = &config.chains[0];
        assert_eq!(chain.nodes[3].tag.as_deref(), Some("backend"));
        let nodes = chain.nodes().unwrap();
        assert_eq!(
            nodes[0],
            Node::TcpListener(TcpListenerSettings {
                address: "0.0.0.0:443".parse().unwrap(),
                balance: Balance::SourceIp,
            })
        );
        assert_eq!(
            nodes[1],
            Node::HalfDuplexServer(HalfDuplexServerSettings {
                pairing_timeout: 5000
            })
        );
        assert_eq!(nodes[2], Node::MuxServer);
        assert_eq!(
            nodes[3],
            Node::TcpConnector(TcpConnectorSettings {
                address: Some(Address::Socket("127.0.0.1:8080".parse().unwrap())),
            })
        );
    }

    #[test]
    fn test_mux_client_modes() {
        let json = chain_json(
            r#"[
                { "type": "TcpListener", "settings": { "address": "127.0.0.1:1080" } },
                { "type": "MuxClient", "settings": { "mode": "timer", "connection-duration": 2000 } },
                { "type": "TcpConnector" }
            ]"#,
        );
        let nodes = Config::from_json(&json).unwrap().chains[0].nodes().unwrap();
        assert_eq!(
            nodes[1],
            Node::MuxClient(MuxPolicy::Timer {
                duration: Duration::from_millis(2000)
            })
        );
        assert_eq!(nodes[2], Node::TcpConnector(TcpConnectorSettings { address: None }));

        let defaults = MuxClientSettings::default().policy().unwrap();
        assert_eq!(defaults, MuxPolicy::Counter { capacity: 8 });
    }

    #[test]
    fn test_rejects_short_mux_timer() {
        let json = chain_json(
            r#"[
                { "type": "TcpListener", "settings": { "address": "127.0.0.1:1080" } },
                { "type": "MuxClient", "settings": { "mode": "timer", "connection-duration": 60 } },
                { "type": "TcpConnector" }
            ]"#,
        );
        let err = Config::from_json(&json).unwrap_err();
        assert!(err.to_string().contains("must exceed 60 ms"));
    }

    #[test]
    fn test_rejects_zero_capacity() {
        let json = chain_json(
            r#"[
                { "type": "TcpListener", "settings": { "address": "127.0.0.1:1080" } },
                { "type": "MuxClient", "settings": { "connection-capacity": 0 } },
                { "type": "TcpConnector" }
            ]"#,
        );
        assert!(matches!(Config::from_json(&json), Err(Error::Config(_))));
    }

    #[test]
    fn test_rejects_short_chain() {
        let json = chain_json(
            r#"[ { "type": "TcpListener", "settings": { "address": "127.0.0.1:1080" } } ]"#,
        );
        let err = Config::from_json(&json).unwrap_err();
        assert!(err.to_string().contains("at least two nodes"));
    }

    #[test]
    fn test_rejects_chain_without_listener_head() {
        let json = chain_json(r#"[ { "type": "MuxServer" }, { "type": "TcpConnector" } ]"#);
        let err = Config::from_json(&json).unwrap_err();
        assert!(err.to_string().contains("must start with a TcpListener"));
    }

    #[test]
    fn test_halfduplex_server_needs_sticky_balance() {
        let nodes = |balance: &str| {
            format!(
                r#"[
                    {{ "type": "TcpListener", "settings": {{ "address": "0.0.0.0:443", "balance": "{}" }} }},
                    {{ "type": "HalfDuplexServer" }},
                    {{ "type": "TcpConnector", "settings": {{ "address": "127.0.0.1:8080" }} }}
                ]"#,
                balance
            )
        };

        let err = Config::from_json(&chain_json(&nodes("round-robin"))).unwrap_err();
        assert!(err.to_string().contains("source-ip"));
        assert!(Config::from_json(&chain_json(&nodes("source-ip"))).is_ok());

        // A single worker pairs everything anyway
        let single = format!(
            r#"{{ "workers": 1, "chains": [ {{ "tag": "c", "nodes": {} }} ] }}"#,
            nodes("round-robin")
        );
        assert!(Config::from_json(&single).is_ok());
    }

    #[test]
    fn test_rejects_unknown_node_type() {
        let json = chain_json(r#"[ { "type": "Socks5" }, { "type": "TcpConnector" } ]"#);
        assert!(matches!(Config::from_json(&json), Err(Error::Config(_))));
    }

    #[test]
    fn test_default_configs_validate() {
        for config in [Config::default_client(), Config::default_server()] {
            let json = serde_json::to_string_pretty(&config).unwrap();
            let parsed = Config::from_json(&json).unwrap();
            assert_eq!(parsed.chains[0].nodes.len(), 4);
        }
    }
}
