//! Routing context - the address metadata a line carries through a chain

use super::Address;

/// Source/destination metadata attached to every line.
///
/// Stages that spawn new lines (mux children, half-duplex legs) copy the
/// context of the line that caused them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoutingContext {
    /// Where the flow came from
    pub source: Address,
    /// Where the flow wants to go
    pub destination: Address,
}

impl RoutingContext {
    pub fn new(source: Address, destination: Address) -> Self {
        Self { source, destination }
    }

    /// Builder: set source address
    pub fn with_source(mut self, source: Address) -> Self {
        self.source = source;
        self
    }

    /// Builder: set destination address
    pub fn with_destination(mut self, destination: Address) -> Self {
        self.destination = destination;
        self
    }
}

impl std::fmt::Display for RoutingContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} -> {}", self.source, self.destination)
    }
}
