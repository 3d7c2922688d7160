//! Internal Sublayer Service
//!
//! The uniform send/receive interface offered by every layer that can
//! carry frames: MAC endpoints, Aggregators and Distributed Relays all
//! expose ISS to the layer above. Reception is pull-style; the discrete
//! driver polls each consumer once per tick, so no callback plumbing is
//! needed and ownership stays strictly top-down.

use crate::frame::Frame;

/// The Internal Sublayer Service interface
pub trait Iss {
    /// Queue a frame for transmission through this service
    fn transmit(&mut self, frame: Frame);

    /// Take the next received frame, if any
    fn poll_receive(&mut self) -> Option<Frame>;

    /// True while the underlying service can carry frames
    fn operational(&self) -> bool;
}
