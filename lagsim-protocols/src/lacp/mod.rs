//! LACP - Link Aggregation Control Protocol (IEEE 802.1AX)
//!
//! The Link Aggregation sublayer binds physical ports (AggPorts) to
//! logical Aggregators so that one or more links between two systems
//! appear as a single link. Per port, four machines run every tick in
//! fixed order (Receive, Periodic, Mux, Transmit) with the shim-level
//! Selection Logic between Receive and Mux choosing which Aggregator
//! each port should attach to.

pub mod aggregator;
pub mod distribution;
pub mod mux;
pub mod port;
pub mod selection;
pub mod shim;

#[cfg(test)]
mod tests;

pub use aggregator::Aggregator;
pub use distribution::{conversation_id, ConvLinkMap};
pub use mux::MuxState;
pub use port::{AggPort, PeriodicState, RxState, Selected};
pub use shim::LinkAgg;
