//! Conversation distribution
//!
//! An Aggregator converts every frame to a Conversation ID (0-4095) with
//! its port algorithm, then maps the CID to one of its distributing link
//! numbers. Both ends of a LAG forward a conversation over a link only
//! when they agree on the mapping, which is compared through the 128-bit
//! digest carried in version 2 LACPDUs.

use lagsim_core::{ConversationId, Frame, LagAlgorithm, LinkNumber, CONVERSATION_ID_COUNT};
use lagsim_packet::{admin_table_digest, fixed_map_digest};

/// Conversation-ID to link-number mapping algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum ConvLinkMap {
    /// CID modulo the number of distributing links
    #[default]
    Default = 0,
    /// Even CIDs on the lowest link, odd CIDs on the second
    EvenOdd = 1,
    /// Every CID on the lowest distributing link
    ActiveStandby = 2,
    /// Fixed 8x8 slot-priority spread, usable with link numbers above 8
    EightLinkSpread = 3,
    /// Per-CID ordered admin preference lists; unmatched CIDs drop
    AdminTable = 4,
}

/// Slot preference rows for [`ConvLinkMap::EightLinkSpread`]: row
/// `cid % 8` is scanned left to right and the first slot holding a
/// distributing link wins. A link occupies slot `(link - 1) % 8`, so
/// link numbers above 8 fold onto the same eight slots. Each row is a
/// stride walk (+4, +2, +6, ...) from a per-row origin, spreading
/// consecutive CIDs across distant slots.
const EIGHT_LINK_SPREAD_ROWS: [[u8; 8]; 8] = [
    [2, 6, 4, 0, 3, 7, 5, 1],
    [0, 4, 2, 6, 1, 5, 3, 7],
    [6, 2, 0, 4, 7, 3, 1, 5],
    [2, 6, 4, 0, 3, 7, 5, 1],
    [3, 7, 5, 1, 4, 0, 6, 2],
    [6, 2, 0, 4, 7, 3, 1, 5],
    [4, 0, 6, 2, 5, 1, 7, 3],
    [0, 4, 2, 6, 1, 5, 3, 7],
];

/// Derive the Conversation ID of a frame under a port algorithm.
///
/// The MAC-hash algorithms fold the 48-bit address into 12 bits by
/// XOR-ing four 12-bit chunks.
pub fn conversation_id(algorithm: LagAlgorithm, frame: &Frame) -> ConversationId {
    match algorithm {
        LagAlgorithm::Unspecified => 0,
        LagAlgorithm::CVid => frame.outer_cvid().unwrap_or(0),
        LagAlgorithm::SVid => frame.outer_svid().unwrap_or(0),
        // simulated frames carry no backbone service instance tag
        LagAlgorithm::ISid => 0,
        LagAlgorithm::DestMac => fold48(frame.dst.to_u64()),
        LagAlgorithm::SourceDestMac => fold48(frame.src.to_u64() ^ frame.dst.to_u64()),
    }
}

fn fold48(addr: u64) -> ConversationId {
    ((addr ^ (addr >> 12) ^ (addr >> 24) ^ (addr >> 36)) & 0xfff) as ConversationId
}

/// Build the CID -> link-number array for the given distributing links.
///
/// `links` must be sorted ascending and hold the link numbers currently
/// distributing; entries of 0 in the result mean "no link, drop".
pub fn build_conversation_link_map(
    algorithm: ConvLinkMap,
    links: &[LinkNumber],
    admin_table: &[Vec<LinkNumber>],
) -> Box<[LinkNumber; CONVERSATION_ID_COUNT]> {
    let mut map = Box::new([0u16; CONVERSATION_ID_COUNT]);
    if links.is_empty() && algorithm != ConvLinkMap::AdminTable {
        return map;
    }
    for cid in 0..CONVERSATION_ID_COUNT {
        map[cid] = match algorithm {
            ConvLinkMap::Default => links[cid % links.len()],
            ConvLinkMap::EvenOdd => {
                if links.len() == 1 || cid % 2 == 0 {
                    links[0]
                } else {
                    links[1]
                }
            }
            ConvLinkMap::ActiveStandby => links[0],
            ConvLinkMap::EightLinkSpread => eight_link_spread(cid, links),
            ConvLinkMap::AdminTable => admin_table[cid]
                .iter()
                .copied()
                .find(|l| links.contains(l))
                .unwrap_or(0),
        };
    }
    map
}

fn eight_link_spread(cid: usize, links: &[LinkNumber]) -> LinkNumber {
    for slot in EIGHT_LINK_SPREAD_ROWS[cid % 8] {
        // lowest link number wins a slot collision
        if let Some(link) = links
            .iter()
            .copied()
            .filter(|l| *l > 0 && ((l - 1) % 8) as u8 == slot)
            .min()
        {
            return link;
        }
    }
    0
}

/// Digest of the active conversation-to-link policy, as advertised in the
/// Port-Conversation-ID-Digest TLV
pub fn policy_digest(algorithm: ConvLinkMap, admin_table: &[Vec<LinkNumber>]) -> [u8; 16] {
    match algorithm {
        ConvLinkMap::AdminTable => admin_table_digest(admin_table),
        fixed => fixed_map_digest(fixed as u8),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lagsim_core::{ethertypes, Frame, MacAddr, VlanTag};

    fn empty_table() -> Vec<Vec<LinkNumber>> {
        vec![Vec::new(); CONVERSATION_ID_COUNT]
    }

    #[test]
    fn test_cvid_conversation_id() {
        let frame = Frame::new(MacAddr::broadcast(), MacAddr::zero(), ethertypes::IPV4, vec![])
            .push_tag(VlanTag::customer(7));
        assert_eq!(conversation_id(LagAlgorithm::CVid, &frame), 7);
        assert_eq!(conversation_id(LagAlgorithm::SVid, &frame), 0);
        assert_eq!(conversation_id(LagAlgorithm::Unspecified, &frame), 0);
    }

    #[test]
    fn test_dest_mac_fold() {
        let dst = MacAddr([0x00, 0x00, 0x00, 0x00, 0x06, 0x6b]);
        let frame = Frame::new(dst, MacAddr::zero(), ethertypes::IPV4, vec![]);
        assert_eq!(conversation_id(LagAlgorithm::DestMac, &frame), 0x66b);
    }

    #[test]
    fn test_default_map_covers_all_cids() {
        let map = build_conversation_link_map(ConvLinkMap::Default, &[2, 3], &empty_table());
        assert_eq!(map[0], 2);
        assert_eq!(map[1], 3);
        assert_eq!(map[4094], 2);
        assert_eq!(map[4095], 3);
        assert!(map.iter().all(|&l| l == 2 || l == 3));
    }

    #[test]
    fn test_even_odd_and_active_standby() {
        let eo = build_conversation_link_map(ConvLinkMap::EvenOdd, &[1, 5, 9], &empty_table());
        assert_eq!(eo[0], 1);
        assert_eq!(eo[1], 5);
        assert_eq!(eo[2], 1);

        let asb = build_conversation_link_map(ConvLinkMap::ActiveStandby, &[4, 7], &empty_table());
        assert!(asb.iter().all(|&l| l == 4));
    }

    #[test]
    fn test_eight_link_spread_large_link_numbers() {
        // links 17 and 25 fold onto slot 0, 3 onto slot 2, 4 onto slot 3
        let map =
            build_conversation_link_map(ConvLinkMap::EightLinkSpread, &[3, 4, 17, 25], &empty_table());
        let got: Vec<LinkNumber> = (0..8).map(|cid| map[cid]).collect();
        assert_eq!(got, vec![3, 17, 3, 3, 4, 3, 17, 17]);
    }

    #[test]
    fn test_admin_table_scan() {
        let mut table = empty_table();
        table[0] = vec![3, 2, 1];
        table[1] = vec![2, 1, 0];
        table[2] = vec![2, 0];
        table[3] = vec![2];
        table[4] = vec![0];
        table[5] = vec![1];
        table[6] = vec![1, 0];
        table[7] = vec![3, 1, 2];

        let map = build_conversation_link_map(ConvLinkMap::AdminTable, &[1, 2], &table);
        let got: Vec<LinkNumber> = (0..8).map(|cid| map[cid]).collect();
        // first distributing link in each preference list; CID 4 has none
        assert_eq!(got, vec![2, 2, 2, 2, 0, 1, 1, 1]);
        // CIDs without an admin entry drop
        assert_eq!(map[100], 0);
    }

    #[test]
    fn test_empty_links() {
        let map = build_conversation_link_map(ConvLinkMap::Default, &[], &empty_table());
        assert!(map.iter().all(|&l| l == 0));
    }

    #[test]
    fn test_policy_digest_changes_with_table() {
        let mut table = empty_table();
        let fixed = policy_digest(ConvLinkMap::Default, &table);
        table[0x66b] = vec![8, 3];
        let admin = policy_digest(ConvLinkMap::AdminTable, &table);
        assert_ne!(fixed, admin);
        assert_eq!(admin, policy_digest(ConvLinkMap::AdminTable, &table));
    }
}
