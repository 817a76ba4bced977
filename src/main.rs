//! Netchain - chained tunnel engine

use std::path::PathBuf;

use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use netchain::app::Runtime;
use netchain::config::{ApiConfig, Config};
use netchain::error::{Error, Result};

fn main() -> Result<()> {
    let args = Args::parse();

    if args.version {
        print_version();
        return Ok(());
    }

    if let Some(config_type) = args.gen_config {
        let config = match config_type.as_str() {
            "client" => Config::default_client(),
            "server" => Config::default_server(),
            _ => {
                eprintln!("Unknown config type: {}. Use 'client' or 'server'", config_type);
                std::process::exit(1);
            }
        };
        let json = serde_json::to_string_pretty(&config)
            .map_err(|e| Error::Config(format!("Failed to render config: {}", e)))?;
        println!("{}", json);
        return Ok(());
    }

    // Load configuration
    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => {
            eprintln!("No config file specified, using default client config");
            Config::default_client()
        }
    };

    // Command line API address wins over the config file
    if let Some(listen) = args.api_listen {
        config.api = Some(ApiConfig { listen });
    }

    // Initialize logging: RUST_LOG, then the config's level, then INFO
    let log_level = std::env::var("RUST_LOG")
        .ok()
        .and_then(|s| s.parse().ok())
        .or_else(|| config.log.level.parse().ok())
        .unwrap_or(Level::INFO);

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
    }

    info!("Netchain v{} starting...", env!("CARGO_PKG_VERSION"));

    // The main runtime only accepts; lines live on worker threads
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let runtime = Runtime::from_config(&config)?;
        runtime.run().await
    })?;

    info!("Goodbye!");
    Ok(())
}

/// Command line arguments
struct Args {
    config: Option<PathBuf>,
    gen_config: Option<String>,
    version: bool,
    api_listen: Option<String>,
}

impl Args {
    fn parse() -> Self {
        let args: Vec<String> = std::env::args().collect();
        let mut config = None;
        let mut gen_config = None;
        let mut version = false;
        let mut api_listen = None;

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "-c" | "--config" => {
                    if i + 1 < args.len() {
                        config = Some(PathBuf::from(&args[i + 1]));
                        i += 1;
                    }
                }
                "--gen-config" => {
                    if i + 1 < args.len() {
                        gen_config = Some(args[i + 1].clone());
                        i += 1;
                    }
                }
                "--api" => {
                    if i + 1 < args.len() {
                        api_listen = Some(args[i + 1].clone());
                        i += 1;
                    }
                }
                "-v" | "--version" => version = true,
                "-h" | "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                arg if !arg.starts_with('-') && config.is_none() => {
                    // Positional argument: treat as config file
                    config = Some(PathBuf::from(arg));
                }
                _ => {}
            }
            i += 1;
        }

        Self { config, gen_config, version, api_listen }
    }
}

fn print_help() {
    println!(r#"Netchain - chained tunnel engine

USAGE:
    netchain [OPTIONS]

OPTIONS:
    -c, --config <FILE>     Path to configuration file
    --gen-config <TYPE>     Generate example config (client/server)
    --api <ADDR>            Metrics API listen address (e.g., 127.0.0.1:9090)
    -v, --version           Print version information
    -h, --help              Print help information

EXAMPLES:
    netchain -c client.json
    netchain -c server.json --api 127.0.0.1:9090
    netchain --gen-config client > client.json
    netchain --gen-config server > server.json

STATS API ENDPOINTS:
    GET /metrics             Prometheus metrics (lines, mux, halfduplex, sockets)
"#);
}

fn print_version() {
    println!("Netchain v{}", env!("CARGO_PKG_VERSION"));
    println!("Chained tunnels with connection multiplexing and half-duplex pairing");
}
