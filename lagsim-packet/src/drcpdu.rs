//! DRCPDU packet structure and parsing
//!
//! The Distributed Relay Control Protocol PDU (Slow Protocols subtype
//! 0x02) carries each DR system's view of the portal:
//!
//! ```text
//! Subtype: 0x02 (DRCP)
//! Version: 0x01
//! Home-Portal TLV     (type=1, len=24): home system, admin DRNI system,
//!                                       DRNI key, home aggregator key,
//!                                       gateway algorithm
//! DRCP-State TLV      (type=2, len=3):  state bits
//! Neighbor-Portal TLV (type=3, len=10): last heard neighbor system
//! Home-Ports TLV      (type=4, len=2+2n): active aggregator link numbers
//! Gateway-Vector TLVs (type=5/6, len=2+512): enable / preference bitsets
//! Gateway-Digest TLV  (type=7, len=34): enable digest, preference digest
//! Sequence TLV        (type=8, len=10): sequence, acknowledgement
//! Terminator TLV      (type=0, len=0)
//! ```
//!
//! The full 512-octet gateway vectors ride in every PDU the home sends
//! after an admin edit; between edits only the digest TLV is required,
//! and a receiver treats a digest match as confirmation that its stored
//! copy of the neighbor vectors is current.

use bytes::{BufMut, BytesMut};

use lagsim_core::types::protocol_constants::DRCP_SUBTYPE;
use lagsim_core::{CidBitmap, Error, LagAlgorithm, LinkNumber, Result, SystemId};

const TLV_TERMINATOR: u8 = 0;
const TLV_HOME_PORTAL: u8 = 1;
const TLV_DRCP_STATE: u8 = 2;
const TLV_NEIGHBOR_PORTAL: u8 = 3;
const TLV_HOME_PORTS: u8 = 4;
const TLV_GATEWAY_ENABLE: u8 = 5;
const TLV_GATEWAY_PREFERENCE: u8 = 6;
const TLV_GATEWAY_DIGEST: u8 = 7;
const TLV_SEQUENCE: u8 = 8;

/// DRCP state bits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DrcpState(pub u8);

impl DrcpState {
    /// Home runs DRCP actively on this IPP
    pub const ACTIVITY: u8 = 0x01;
    /// Short timeouts requested
    pub const TIMEOUT: u8 = 0x02;
    /// Home's gateway vectors agree with the neighbor's last report
    pub const GATEWAY_SYNC: u8 = 0x04;
    /// Home's port conversations agree with the neighbor's last report
    pub const PORT_SYNC: u8 = 0x08;
    /// Neighbor information has expired
    pub const EXPIRED: u8 = 0x10;
    /// Neighbor information is administrative defaults
    pub const DEFAULTED: u8 = 0x20;
    /// Home requests conversation-sensitive gateway control
    pub const CSCD_GATEWAY: u8 = 0x40;

    pub fn new(bits: u8) -> Self {
        Self(bits)
    }

    pub fn activity(&self) -> bool {
        self.0 & Self::ACTIVITY != 0
    }

    pub fn timeout(&self) -> bool {
        self.0 & Self::TIMEOUT != 0
    }

    pub fn gateway_sync(&self) -> bool {
        self.0 & Self::GATEWAY_SYNC != 0
    }

    pub fn port_sync(&self) -> bool {
        self.0 & Self::PORT_SYNC != 0
    }

    pub fn expired(&self) -> bool {
        self.0 & Self::EXPIRED != 0
    }

    pub fn defaulted(&self) -> bool {
        self.0 & Self::DEFAULTED != 0
    }

    pub fn cscd_gateway(&self) -> bool {
        self.0 & Self::CSCD_GATEWAY != 0
    }

    pub fn with(mut self, bit: u8, value: bool) -> Self {
        if value {
            self.0 |= bit;
        } else {
            self.0 &= !bit;
        }
        self
    }
}

/// A parsed or to-be-built DRCPDU
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Drcpdu {
    /// Home DR system identity
    pub home_system: SystemId,
    /// Administratively configured DRNI system id (zero = derive from the
    /// lowest paired home id)
    pub admin_drni_system: SystemId,
    /// DRNI aggregator key presented outward while paired
    pub drni_key: u16,
    /// Home aggregator's own admin key
    pub home_aggregator_key: u16,
    /// Home admin gateway algorithm
    pub gateway_algorithm: LagAlgorithm,
    pub state: DrcpState,
    /// The neighbor the home currently believes it is talking to (zero
    /// before the first DRCPDU arrives)
    pub neighbor_system: SystemId,
    /// Link numbers of the home's active aggregator links
    pub home_ports: Vec<LinkNumber>,
    /// Home gateway enable vector; omitted when unchanged since the last
    /// acknowledged PDU
    pub gateway_enable: Option<CidBitmap>,
    /// Home gateway preference vector; same carriage rule
    pub gateway_preference: Option<CidBitmap>,
    /// Digest of the home gateway enable vector
    pub enable_digest: [u8; 16],
    /// Digest of the home gateway preference vector
    pub preference_digest: [u8; 16],
    pub sequence: u32,
    pub ack: u32,
}

impl Drcpdu {
    /// Serialize to the wire format
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(128);
        buf.put_u8(DRCP_SUBTYPE);
        buf.put_u8(0x01);

        buf.put_u8(TLV_HOME_PORTAL);
        buf.put_u8(24);
        buf.put_slice(&self.home_system.to_bytes());
        buf.put_slice(&self.admin_drni_system.to_bytes());
        buf.put_u16(self.drni_key);
        buf.put_u16(self.home_aggregator_key);
        buf.put_slice(&self.gateway_algorithm.to_bytes()[2..4]);

        buf.put_u8(TLV_DRCP_STATE);
        buf.put_u8(3);
        buf.put_u8(self.state.0);

        buf.put_u8(TLV_NEIGHBOR_PORTAL);
        buf.put_u8(10);
        buf.put_slice(&self.neighbor_system.to_bytes());

        buf.put_u8(TLV_HOME_PORTS);
        buf.put_u8(2 + 2 * self.home_ports.len() as u8);
        for link in &self.home_ports {
            buf.put_u16(*link);
        }

        if let Some(enable) = &self.gateway_enable {
            buf.put_u8(TLV_GATEWAY_ENABLE);
            buf.put_u8(2); // 512-octet body length does not fit one octet
            buf.put_slice(&enable.to_bytes());
        }
        if let Some(pref) = &self.gateway_preference {
            buf.put_u8(TLV_GATEWAY_PREFERENCE);
            buf.put_u8(2);
            buf.put_slice(&pref.to_bytes());
        }

        buf.put_u8(TLV_GATEWAY_DIGEST);
        buf.put_u8(34);
        buf.put_slice(&self.enable_digest);
        buf.put_slice(&self.preference_digest);

        buf.put_u8(TLV_SEQUENCE);
        buf.put_u8(10);
        buf.put_u32(self.sequence);
        buf.put_u32(self.ack);

        buf.put_u8(TLV_TERMINATOR);
        buf.put_u8(0);
        buf.to_vec()
    }

    /// Parse from the wire format
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < 2 {
            return Err(Error::malformed("DRCPDU too short"));
        }
        if data[0] != DRCP_SUBTYPE {
            return Err(Error::malformed("Not a DRCP slow-protocols subtype"));
        }
        if data[1] != 0x01 {
            return Err(Error::malformed("Unsupported DRCP version"));
        }

        let mut pdu = Drcpdu {
            home_system: SystemId::default(),
            admin_drni_system: SystemId::default(),
            drni_key: 0,
            home_aggregator_key: 0,
            gateway_algorithm: LagAlgorithm::Unspecified,
            state: DrcpState::default(),
            neighbor_system: SystemId::default(),
            home_ports: Vec::new(),
            gateway_enable: None,
            gateway_preference: None,
            enable_digest: [0; 16],
            preference_digest: [0; 16],
            sequence: 0,
            ack: 0,
        };

        let mut at = 2;
        loop {
            if at + 2 > data.len() {
                return Err(Error::malformed("Truncated TLV header"));
            }
            let tlv_type = data[at];
            let tlv_len = usize::from(data[at + 1]);
            if tlv_type == TLV_TERMINATOR {
                if tlv_len != 0 {
                    return Err(Error::malformed("Terminator with non-zero length"));
                }
                break;
            }
            // the two vector TLVs carry a fixed 512-octet body that does
            // not fit the one-octet length field
            let body_len = match tlv_type {
                TLV_GATEWAY_ENABLE | TLV_GATEWAY_PREFERENCE => 512,
                _ => {
                    if tlv_len < 2 {
                        return Err(Error::malformed("TLV length out of range"));
                    }
                    tlv_len - 2
                }
            };
            if at + 2 + body_len > data.len() {
                return Err(Error::malformed("TLV length out of range"));
            }
            let info = &data[at + 2..at + 2 + body_len];
            match tlv_type {
                TLV_HOME_PORTAL => {
                    Self::expect_len(tlv_len, 24, "home portal")?;
                    pdu.home_system = SystemId::from_bytes(&info[0..8])?;
                    pdu.admin_drni_system = SystemId::from_bytes(&info[8..16])?;
                    pdu.drni_key = u16::from_be_bytes([info[16], info[17]]);
                    pdu.home_aggregator_key = u16::from_be_bytes([info[18], info[19]]);
                    if info[20] != 0xc2 {
                        return Err(Error::malformed("Unknown gateway algorithm OUI"));
                    }
                    pdu.gateway_algorithm = LagAlgorithm::from(info[21]);
                }
                TLV_DRCP_STATE => {
                    Self::expect_len(tlv_len, 3, "drcp state")?;
                    pdu.state = DrcpState::new(info[0]);
                }
                TLV_NEIGHBOR_PORTAL => {
                    Self::expect_len(tlv_len, 10, "neighbor portal")?;
                    pdu.neighbor_system = SystemId::from_bytes(info)?;
                }
                TLV_HOME_PORTS => {
                    if tlv_len % 2 != 0 {
                        return Err(Error::malformed("Odd home-ports TLV length"));
                    }
                    pdu.home_ports = info
                        .chunks_exact(2)
                        .map(|c| u16::from_be_bytes([c[0], c[1]]))
                        .collect();
                }
                TLV_GATEWAY_ENABLE => {
                    let mut bytes = [0u8; 512];
                    bytes.copy_from_slice(info);
                    pdu.gateway_enable = Some(CidBitmap::from_bytes(&bytes));
                }
                TLV_GATEWAY_PREFERENCE => {
                    let mut bytes = [0u8; 512];
                    bytes.copy_from_slice(info);
                    pdu.gateway_preference = Some(CidBitmap::from_bytes(&bytes));
                }
                TLV_GATEWAY_DIGEST => {
                    Self::expect_len(tlv_len, 34, "gateway digest")?;
                    pdu.enable_digest.copy_from_slice(&info[0..16]);
                    pdu.preference_digest.copy_from_slice(&info[16..32]);
                }
                TLV_SEQUENCE => {
                    Self::expect_len(tlv_len, 10, "sequence")?;
                    pdu.sequence = u32::from_be_bytes([info[0], info[1], info[2], info[3]]);
                    pdu.ack = u32::from_be_bytes([info[4], info[5], info[6], info[7]]);
                }
                other => {
                    return Err(Error::malformed(format!("Unknown DRCPDU TLV type {other}")));
                }
            }
            at += 2 + body_len;
        }
        Ok(pdu)
    }

    fn expect_len(got: usize, want: usize, what: &str) -> Result<()> {
        if got != want {
            return Err(Error::malformed(format!(
                "Bad {what} TLV length {got}, expected {want}"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lagsim_core::MacAddr;

    fn sample_pdu() -> Drcpdu {
        let mut enable = CidBitmap::new();
        let mut pref = CidBitmap::new();
        for cid in 0u16..4096 {
            enable.set(cid, cid & 0x4 == 0);
            pref.set(cid, cid & 0x1 != 0);
        }
        Drcpdu {
            home_system: SystemId::new(0x8000, MacAddr([0, 0x55, 0, 0, 0, 0x01])),
            admin_drni_system: SystemId::default(),
            drni_key: 0x0505,
            home_aggregator_key: 0x0105,
            gateway_algorithm: LagAlgorithm::CVid,
            state: DrcpState::new(DrcpState::ACTIVITY | DrcpState::TIMEOUT),
            neighbor_system: SystemId::new(0x8000, MacAddr([0, 0x55, 0, 0, 0, 0x02])),
            home_ports: vec![1, 2],
            gateway_enable: Some(enable.clone()),
            gateway_preference: Some(pref.clone()),
            enable_digest: crate::digest::vector_digest(&enable),
            preference_digest: crate::digest::vector_digest(&pref),
            sequence: 42,
            ack: 41,
        }
    }

    #[test]
    fn test_round_trip_with_vectors() {
        let pdu = sample_pdu();
        let parsed = Drcpdu::from_bytes(&pdu.to_bytes()).unwrap();
        assert_eq!(parsed, pdu);
    }

    #[test]
    fn test_round_trip_digest_only() {
        let mut pdu = sample_pdu();
        pdu.gateway_enable = None;
        pdu.gateway_preference = None;
        let parsed = Drcpdu::from_bytes(&pdu.to_bytes()).unwrap();
        assert_eq!(parsed, pdu);
        assert!(parsed.gateway_enable.is_none());
    }

    #[test]
    fn test_wrong_subtype_rejected() {
        let mut bytes = sample_pdu().to_bytes();
        bytes[0] = 0x01;
        assert!(Drcpdu::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_truncated_rejected() {
        let bytes = sample_pdu().to_bytes();
        assert!(Drcpdu::from_bytes(&bytes[..bytes.len() / 2]).is_err());
    }
}
