//! Conversation-list digests
//!
//! Both ends of an aggregation agree to distribute a conversation only
//! when their selection policies match, and the comparison travels as a
//! 128-bit MD5 digest in the Port-Conversation-ID-Digest TLV (and in the
//! DRCPDU gateway-vector digests). The digest is computed over a
//! canonical serialization so it is a deterministic function of the
//! policy alone:
//!
//! ```text
//! "lag-conv-map:v1" || kind byte                      (fixed algorithms)
//! "lag-conv-map:v1" || 0xff || cid u16 || n u8 || n*link u16 ...
//!                                                     (admin table)
//! ```
//!
//! Only non-empty admin entries are serialized, in ascending CID order,
//! so writes that do not change the table do not change the digest.

use md5::{Digest, Md5};

use lagsim_core::{CidBitmap, LinkNumber};

const DIGEST_SEED: &[u8] = b"lag-conv-map:v1";
const ADMIN_TABLE_KIND: u8 = 0xff;

/// Digest of a fixed (table-driven) conversation-to-link algorithm,
/// identified by its discriminant
pub fn fixed_map_digest(kind: u8) -> [u8; 16] {
    let mut hasher = Md5::new();
    hasher.update(DIGEST_SEED);
    hasher.update([kind]);
    hasher.finalize().into()
}

/// Digest of a per-CID admin link-preference table
pub fn admin_table_digest(table: &[Vec<LinkNumber>]) -> [u8; 16] {
    let mut hasher = Md5::new();
    hasher.update(DIGEST_SEED);
    hasher.update([ADMIN_TABLE_KIND]);
    for (cid, prefs) in table.iter().enumerate() {
        if prefs.is_empty() {
            continue;
        }
        hasher.update((cid as u16).to_be_bytes());
        hasher.update([prefs.len() as u8]);
        for link in prefs {
            hasher.update(link.to_be_bytes());
        }
    }
    hasher.finalize().into()
}

/// Digest of a 4096-bit conversation vector (used for the DRCPDU gateway
/// enable/preference digests)
pub fn vector_digest(vector: &CidBitmap) -> [u8; 16] {
    let mut hasher = Md5::new();
    hasher.update(DIGEST_SEED);
    hasher.update(vector.to_bytes());
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_digests_distinct() {
        assert_ne!(fixed_map_digest(0), fixed_map_digest(1));
        assert_eq!(fixed_map_digest(3), fixed_map_digest(3));
    }

    #[test]
    fn test_admin_table_digest_is_function_of_table() {
        let mut table: Vec<Vec<LinkNumber>> = vec![Vec::new(); 4096];
        table[0] = vec![3, 2, 1];
        table[1] = vec![2, 1, 0];
        let a = admin_table_digest(&table);
        // same content, fresh allocation
        let mut table2: Vec<Vec<LinkNumber>> = vec![Vec::new(); 4096];
        table2[0] = vec![3, 2, 1];
        table2[1] = vec![2, 1, 0];
        assert_eq!(a, admin_table_digest(&table2));

        table2[7] = vec![3, 1, 2];
        assert_ne!(a, admin_table_digest(&table2));
    }

    #[test]
    fn test_preference_order_matters() {
        let mut a: Vec<Vec<LinkNumber>> = vec![Vec::new(); 4096];
        let mut b: Vec<Vec<LinkNumber>> = vec![Vec::new(); 4096];
        a[5] = vec![1, 2];
        b[5] = vec![2, 1];
        assert_ne!(admin_table_digest(&a), admin_table_digest(&b));
    }

    #[test]
    fn test_vector_digest_tracks_bits() {
        let mut v = CidBitmap::new();
        let empty = vector_digest(&v);
        v.set(11, true);
        assert_ne!(empty, vector_digest(&v));
    }
}
