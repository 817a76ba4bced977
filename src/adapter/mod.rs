//! Socket adapters - the stages at either end of a chain
//!
//! - `TcpListener`: head stage, turns accepted connections into lines
//! - `TcpConnector`: tail stage, dials the target for every line

mod socket;
mod tcp_connector;
mod tcp_listener;

pub use socket::{HIGH_WATERMARK, LOW_WATERMARK};
pub use tcp_connector::TcpConnector;
pub use tcp_listener::{Balance, TcpListener};
