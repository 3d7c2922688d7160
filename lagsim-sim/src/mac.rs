//! MAC endpoints
//!
//! A Mac is one end of a point-to-point link: bounded transmit and
//! receive queues plus an operational flag driven by the Simulation's
//! connect/disconnect calls. The wire itself (delay line) lives in the
//! driver.

use std::collections::VecDeque;

use tracing::warn;

use lagsim_core::{Frame, Iss, MacAddr};

/// Frames held per direction before overflow drops
pub const MAC_QUEUE_DEPTH: usize = 64;

/// One link endpoint
#[derive(Debug)]
pub struct Mac {
    pub index: usize,
    pub addr: MacAddr,
    pub operational: bool,
    tx_queue: VecDeque<Frame>,
    rx_queue: VecDeque<Frame>,
}

impl Mac {
    pub fn new(index: usize, addr: MacAddr) -> Self {
        Self {
            index,
            addr,
            operational: false,
            tx_queue: VecDeque::new(),
            rx_queue: VecDeque::new(),
        }
    }

    /// Drop anything queued in either direction (a link reset loses
    /// frames in transit through this endpoint)
    pub fn reset(&mut self) {
        self.tx_queue.clear();
        self.rx_queue.clear();
    }

    /// Wire side: take every frame awaiting transmission
    pub fn drain_tx(&mut self) -> Vec<Frame> {
        self.tx_queue.drain(..).collect()
    }

    /// Wire side: a frame arrived after its propagation delay
    pub fn deliver(&mut self, frame: Frame) {
        if self.rx_queue.len() >= MAC_QUEUE_DEPTH {
            warn!(mac = self.index, "receive queue overflow, dropping frame");
            return;
        }
        self.rx_queue.push_back(frame);
    }
}

impl Iss for Mac {
    fn transmit(&mut self, frame: Frame) {
        if !self.operational {
            return;
        }
        if self.tx_queue.len() >= MAC_QUEUE_DEPTH {
            warn!(mac = self.index, "transmit queue overflow, dropping frame");
            return;
        }
        self.tx_queue.push_back(frame);
    }

    fn poll_receive(&mut self) -> Option<Frame> {
        self.rx_queue.pop_front()
    }

    fn operational(&self) -> bool {
        self.operational
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lagsim_core::ethertypes;

    fn frame() -> Frame {
        Frame::new(MacAddr::broadcast(), MacAddr::zero(), ethertypes::IPV4, vec![0; 4])
    }

    #[test]
    fn test_down_mac_drops_transmit() {
        let mut mac = Mac::new(0, MacAddr::zero());
        mac.transmit(frame());
        assert!(mac.drain_tx().is_empty());

        mac.operational = true;
        mac.transmit(frame());
        assert_eq!(mac.drain_tx().len(), 1);
    }

    #[test]
    fn test_queue_depth_bounded() {
        let mut mac = Mac::new(0, MacAddr::zero());
        mac.operational = true;
        for _ in 0..MAC_QUEUE_DEPTH + 5 {
            mac.transmit(frame());
        }
        assert_eq!(mac.drain_tx().len(), MAC_QUEUE_DEPTH);
    }

    #[test]
    fn test_reset_clears_both_directions() {
        let mut mac = Mac::new(0, MacAddr::zero());
        mac.operational = true;
        mac.transmit(frame());
        mac.deliver(frame());
        mac.reset();
        assert!(mac.drain_tx().is_empty());
        assert!(mac.poll_receive().is_none());
    }
}
