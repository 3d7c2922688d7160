//! DRCP - Distributed Relay Control Protocol (IEEE 802.1AX DRNI)
//!
//! A Distributed Relay virtualizes one Aggregator of its shim so that
//! two cooperating DR systems present a single LACP system identity to
//! remote partners, and partitions conversation gateways between the
//! peers. DRCPDUs travel over the Intra-Relay-Port Connection (IPP).

pub mod gateway;
pub mod ipp;
pub mod relay;


pub use gateway::GatewayOwner;
pub use ipp::{Ipp, IppRxState};
pub use relay::{DistributedRelay, DrAction, DrConfig, DrState, FrameOrigin};
