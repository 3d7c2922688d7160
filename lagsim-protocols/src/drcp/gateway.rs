//! Gateway conversation ownership
//!
//! For every conversation ID the paired DR systems must agree which
//! peer's gateway carries it. Ownership is a pure function of the two
//! systems' enable and preference vectors, computed identically on both
//! peers:
//!
//! - neither enabled: no owner
//! - exactly one enabled: that system
//! - both enabled, exactly one prefers itself: the preferring system
//! - both enabled, neither prefers itself: the lower system id
//! - both enabled, both prefer themselves: both would claim, so the
//!   previously agreed owner is retained and the conversation is marked
//!   inconsistent until an administrator resolves the clash
//!
//! Either peer plugs in its own vectors as "home" and the other's as
//! "peer"; the function is symmetric under that swap.

use lagsim_core::{CidBitmap, ConversationId, CONVERSATION_ID_COUNT};

/// Which DR system's gateway carries a conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GatewayOwner {
    #[default]
    None,
    Home,
    Peer,
}

impl GatewayOwner {
    /// The same owner as seen from the other peer
    pub fn flipped(self) -> Self {
        match self {
            GatewayOwner::Home => GatewayOwner::Peer,
            GatewayOwner::Peer => GatewayOwner::Home,
            GatewayOwner::None => GatewayOwner::None,
        }
    }
}

/// Inputs for one peer's view of the ownership computation
pub struct OwnerInputs<'a> {
    pub home_enable: &'a CidBitmap,
    pub home_preference: &'a CidBitmap,
    pub peer_enable: &'a CidBitmap,
    pub peer_preference: &'a CidBitmap,
    /// True when the home system id is numerically lower than the peer's
    pub home_is_lower: bool,
}

/// Compute the owner of a single conversation. `previous` is the last
/// agreed owner; it only matters in the both-claim case. The second
/// return value flags that case as inconsistent.
pub fn owner_of(
    cid: ConversationId,
    inputs: &OwnerInputs<'_>,
    previous: GatewayOwner,
) -> (GatewayOwner, bool) {
    let home = inputs.home_enable.get(cid);
    let peer = inputs.peer_enable.get(cid);
    let tie_break = if inputs.home_is_lower {
        GatewayOwner::Home
    } else {
        GatewayOwner::Peer
    };
    match (home, peer) {
        (false, false) => (GatewayOwner::None, false),
        (true, false) => (GatewayOwner::Home, false),
        (false, true) => (GatewayOwner::Peer, false),
        (true, true) => {
            let home_pref = inputs.home_preference.get(cid);
            let peer_pref = inputs.peer_preference.get(cid);
            match (home_pref, peer_pref) {
                (true, false) => (GatewayOwner::Home, false),
                (false, true) => (GatewayOwner::Peer, false),
                (false, false) => (tie_break, false),
                (true, true) => match previous {
                    GatewayOwner::None => (tie_break, true),
                    kept => (kept, true),
                },
            }
        }
    }
}

/// Recompute the full ownership vector, carrying previous owners into
/// the both-claim case. Returns the set of inconsistent conversations.
pub fn compute_owners(
    inputs: &OwnerInputs<'_>,
    owners: &mut [GatewayOwner; CONVERSATION_ID_COUNT],
) -> CidBitmap {
    let mut inconsistent = CidBitmap::new();
    for cid in 0..CONVERSATION_ID_COUNT as u16 {
        let (owner, clash) = owner_of(cid, inputs, owners[usize::from(cid)]);
        owners[usize::from(cid)] = owner;
        if clash {
            inconsistent.set(cid, true);
        }
    }
    inconsistent
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bitmaps(rule: impl Fn(u16) -> bool) -> CidBitmap {
        let mut map = CidBitmap::new();
        for cid in 0..4096u16 {
            map.set(cid, rule(cid));
        }
        map
    }

    /// The two peers must derive mirrored owners from swapped inputs
    #[test]
    fn test_symmetric_between_peers() {
        // the §gateway-selection bit rules of the original driver
        let en0 = bitmaps(|c| c & 0x4 == 0);
        let en1 = bitmaps(|c| c & 0x8 == 0);
        let pref0 = bitmaps(|c| c & 0x1 != 0);
        let pref1 = bitmaps(|c| c & 0x2 != 0);

        let from_a = OwnerInputs {
            home_enable: &en0,
            home_preference: &pref0,
            peer_enable: &en1,
            peer_preference: &pref1,
            home_is_lower: true,
        };
        let from_b = OwnerInputs {
            home_enable: &en1,
            home_preference: &pref1,
            peer_enable: &en0,
            peer_preference: &pref0,
            home_is_lower: false,
        };

        let mut owners_a = Box::new([GatewayOwner::None; CONVERSATION_ID_COUNT]);
        let mut owners_b = Box::new([GatewayOwner::None; CONVERSATION_ID_COUNT]);
        compute_owners(&from_a, &mut owners_a);
        compute_owners(&from_b, &mut owners_b);

        for cid in 0..CONVERSATION_ID_COUNT {
            assert_eq!(
                owners_a[cid],
                owners_b[cid].flipped(),
                "owner mismatch at cid {cid}"
            );
        }
    }

    #[test]
    fn test_single_enable_wins() {
        let en_home = bitmaps(|c| c == 5);
        let none = CidBitmap::new();
        let inputs = OwnerInputs {
            home_enable: &en_home,
            home_preference: &none,
            peer_enable: &none,
            peer_preference: &none,
            home_is_lower: false,
        };
        assert_eq!(owner_of(5, &inputs, GatewayOwner::None).0, GatewayOwner::Home);
        assert_eq!(owner_of(6, &inputs, GatewayOwner::None).0, GatewayOwner::None);
    }

    #[test]
    fn test_both_claim_retains_previous_and_flags() {
        let all = CidBitmap::full();
        let inputs = OwnerInputs {
            home_enable: &all,
            home_preference: &all,
            peer_enable: &all,
            peer_preference: &all,
            home_is_lower: false,
        };
        let (owner, clash) = owner_of(9, &inputs, GatewayOwner::Home);
        assert_eq!(owner, GatewayOwner::Home, "last agreed owner retained");
        assert!(clash);
        // with no history the tie-break decides
        let (owner, clash) = owner_of(9, &inputs, GatewayOwner::None);
        assert_eq!(owner, GatewayOwner::Peer);
        assert!(clash);
    }

    #[test]
    fn test_preference_decides_when_split() {
        let all = CidBitmap::full();
        let none = CidBitmap::new();
        let inputs = OwnerInputs {
            home_enable: &all,
            home_preference: &none,
            peer_enable: &all,
            peer_preference: &all,
            home_is_lower: true,
        };
        assert_eq!(owner_of(0, &inputs, GatewayOwner::None).0, GatewayOwner::Peer);

        let neither = OwnerInputs {
            home_enable: &all,
            home_preference: &none,
            peer_enable: &all,
            peer_preference: &none,
            home_is_lower: true,
        };
        assert_eq!(
            owner_of(0, &neither, GatewayOwner::None).0,
            GatewayOwner::Home,
            "lower system id breaks the no-preference tie"
        );
    }
}
