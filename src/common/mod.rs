//! Common types shared by every stage
//!
//! - Address: network address representation
//! - RoutingContext: per-line source/destination metadata

mod address;
mod routing;

pub use address::Address;
pub use routing::RoutingContext;

// Re-export error types from crate root
pub use crate::error::{Error, Result};
