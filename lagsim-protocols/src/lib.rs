//! LagSim protocol engines
//!
//! Two cooperating engines drive the simulator:
//!
//! - [`lacp`]: the Link Aggregation sublayer: per-port Receive, Periodic,
//!   Mux and Transmit machines, the shim-level Selection Logic, and the
//!   conversation-to-link distribution maps
//! - [`drcp`]: the Distributed Relay: the IPP state machine, the
//!   emulated-system consensus and per-conversation gateway ownership
//!
//! Every machine is an explicit state enum plus a step function; the
//! driver in `lagsim-sim` advances them in a fixed per-tick order.

pub mod drcp;
pub mod lacp;
