//! LagSim Core Library
//!
//! This crate provides the fundamental types, error handling, the Ethernet
//! frame model and the ISS service interface shared by every layer of the
//! LagSim 802.1AX Link Aggregation simulator.

pub mod bitmap;
pub mod error;
pub mod frame;
pub mod iss;
pub mod timer;
pub mod types;

// Re-export commonly used types
pub use bitmap::CidBitmap;
pub use error::{Error, Result};
pub use frame::{Frame, VlanTag};
pub use iss::Iss;
pub use timer::Timer;
pub use types::*;
