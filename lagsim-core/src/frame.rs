//! Ethernet frame model
//!
//! Frames are plain values: they carry source, destination, a VLAN tag
//! stack (outermost first), an EtherType and an opaque payload. They are
//! moved between queues by the layers that own them and never shared.

use std::fmt;

use crate::types::{ethertypes, MacAddr};

/// A single VLAN tag (C-tag or S-tag)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VlanTag {
    /// Tag EtherType: 0x8100 for a C-tag, 0x88A8 for an S-tag
    pub tpid: u16,
    /// VLAN identifier, 0-4095
    pub vid: u16,
}

impl VlanTag {
    /// Create a customer (802.1Q) tag
    pub fn customer(vid: u16) -> Self {
        Self {
            tpid: ethertypes::CVLAN,
            vid: vid & 0x0fff,
        }
    }

    /// Create a service (802.1ad) tag
    pub fn service(vid: u16) -> Self {
        Self {
            tpid: ethertypes::SVLAN,
            vid: vid & 0x0fff,
        }
    }
}

/// An Ethernet PDU value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Destination MAC address
    pub dst: MacAddr,
    /// Source MAC address
    pub src: MacAddr,
    /// VLAN tag stack, outermost tag first
    pub tags: Vec<VlanTag>,
    /// EtherType of the innermost payload
    pub ethertype: u16,
    /// Payload bytes (protocol PDUs travel here)
    pub payload: Vec<u8>,
}

impl Frame {
    /// Create an untagged frame
    pub fn new(dst: MacAddr, src: MacAddr, ethertype: u16, payload: Vec<u8>) -> Self {
        Self {
            dst,
            src,
            tags: Vec::new(),
            ethertype,
            payload,
        }
    }

    /// Push a tag onto the outside of the tag stack
    pub fn push_tag(mut self, tag: VlanTag) -> Self {
        self.tags.insert(0, tag);
        self
    }

    /// Outermost customer VLAN ID, if the outer tag is a C-tag
    pub fn outer_cvid(&self) -> Option<u16> {
        self.tags
            .first()
            .filter(|t| t.tpid == ethertypes::CVLAN)
            .map(|t| t.vid)
    }

    /// Outermost service VLAN ID, if the outer tag is an S-tag
    pub fn outer_svid(&self) -> Option<u16> {
        self.tags
            .first()
            .filter(|t| t.tpid == ethertypes::SVLAN)
            .map(|t| t.vid)
    }

    /// True for Slow Protocols frames (LACPDUs and DRCPDUs)
    pub fn is_slow_protocols(&self) -> bool {
        self.ethertype == ethertypes::SLOW_PROTOCOLS
    }

    /// Slow Protocols subtype (first payload byte) if applicable
    pub fn slow_protocols_subtype(&self) -> Option<u8> {
        if self.is_slow_protocols() {
            self.payload.first().copied()
        } else {
            None
        }
    }

    /// Total bytes on the wire, excluding preamble and FCS
    pub fn len(&self) -> usize {
        14 + 4 * self.tags.len() + self.payload.len()
    }

    /// True when the payload is empty
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {} type 0x{:04x}", self.src, self.dst, self.ethertype)?;
        for tag in &self.tags {
            write!(f, " [vid {}]", tag.vid)?;
        }
        write!(f, " ({} bytes)", self.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_stack_order() {
        let frame = Frame::new(
            MacAddr::broadcast(),
            MacAddr::zero(),
            ethertypes::IPV4,
            vec![0; 46],
        )
        .push_tag(VlanTag::customer(7))
        .push_tag(VlanTag::service(100));

        // last push is outermost
        assert_eq!(frame.outer_svid(), Some(100));
        assert_eq!(frame.outer_cvid(), None);
        assert_eq!(frame.len(), 14 + 8 + 46);
    }

    #[test]
    fn test_slow_protocols_subtype() {
        let frame = Frame::new(
            crate::types::protocol_constants::SLOW_PROTOCOLS_DA,
            MacAddr::zero(),
            ethertypes::SLOW_PROTOCOLS,
            vec![0x01, 0x01],
        );
        assert!(frame.is_slow_protocols());
        assert_eq!(frame.slow_protocols_subtype(), Some(0x01));
    }

    #[test]
    fn test_vid_masked_to_12_bits() {
        assert_eq!(VlanTag::customer(0xffff).vid, 0x0fff);
    }
}
