//! LagSim simulator
//!
//! The outermost crate: MAC endpoints with bounded queues, Links that
//! carry frames with a configurable propagation delay, Devices composing
//! MACs + a Link Aggregation shim + an optional Bridge or End Station,
//! and the Simulation driver that advances everything one global tick at
//! a time in the fixed phase order of the protocol engines.

pub mod device;
pub mod driver;
pub mod mac;

pub use device::{Bridge, Device, EndStation, PortBinding};
pub use driver::{SimClock, Simulation};
pub use mac::Mac;
