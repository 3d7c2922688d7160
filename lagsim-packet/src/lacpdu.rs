//! LACPDU packet structure and parsing
//!
//! Implements the IEEE 802.1AX LACPDU, versions 1 and 2:
//!
//! ```text
//! Subtype: 0x01 (LACP)
//! Version: 0x01 or 0x02
//! Actor TLV    (type=1, len=20): sys_priority, sys_mac, key,
//!                                port_priority, port, state, 3 reserved
//! Partner TLV  (type=2, len=20): same layout
//! Collector TLV(type=3, len=16): max_delay, 12 reserved
//! -- version 2 only --
//! Port-Algorithm TLV              (type=4, len=6)
//! Port-Conversation-ID-Digest TLV (type=5, len=18)
//! Port-Conversation-Mask TLVs     (type=6..9, len=130 each, 1024 bits)
//! Admin-Link-Number TLV           (type=10, len=4)
//! -- end version 2 --
//! Terminator TLV (type=0, len=0), zero padding to 110 octets
//! ```
//!
//! TLV lengths count the type and length octets, as on the wire.

use bytes::{BufMut, BytesMut};
use std::fmt;

use lagsim_core::types::protocol_constants::LACP_SUBTYPE;
use lagsim_core::{CidBitmap, Error, LagAlgorithm, PortId, Result, SystemId};

/// Minimum (version 1) LACPDU body length, subtype through padding
pub const LACPDU_V1_LEN: usize = 110;

const TLV_TERMINATOR: u8 = 0;
const TLV_ACTOR: u8 = 1;
const TLV_PARTNER: u8 = 2;
const TLV_COLLECTOR: u8 = 3;
const TLV_PORT_ALGORITHM: u8 = 4;
const TLV_CONVERSATION_DIGEST: u8 = 5;
const TLV_CONVERSATION_MASK_FIRST: u8 = 6;
const TLV_CONVERSATION_MASK_LAST: u8 = 9;
const TLV_ADMIN_LINK_NUMBER: u8 = 10;

/// LACP state bits, in wire order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LacpState(pub u8);

impl LacpState {
    pub const ACTIVITY: u8 = 0x01;
    pub const TIMEOUT: u8 = 0x02;
    pub const AGGREGATION: u8 = 0x04;
    pub const SYNCHRONIZATION: u8 = 0x08;
    pub const COLLECTING: u8 = 0x10;
    pub const DISTRIBUTING: u8 = 0x20;
    pub const DEFAULTED: u8 = 0x40;
    pub const EXPIRED: u8 = 0x80;

    pub fn new(bits: u8) -> Self {
        Self(bits)
    }

    pub fn activity(&self) -> bool {
        self.0 & Self::ACTIVITY != 0
    }

    /// True for short (fast) timeouts
    pub fn timeout(&self) -> bool {
        self.0 & Self::TIMEOUT != 0
    }

    /// True for aggregatable ports, false for individual
    pub fn aggregation(&self) -> bool {
        self.0 & Self::AGGREGATION != 0
    }

    pub fn synchronization(&self) -> bool {
        self.0 & Self::SYNCHRONIZATION != 0
    }

    pub fn collecting(&self) -> bool {
        self.0 & Self::COLLECTING != 0
    }

    pub fn distributing(&self) -> bool {
        self.0 & Self::DISTRIBUTING != 0
    }

    pub fn defaulted(&self) -> bool {
        self.0 & Self::DEFAULTED != 0
    }

    pub fn expired(&self) -> bool {
        self.0 & Self::EXPIRED != 0
    }

    /// Set or clear one of the bit constants
    pub fn with(mut self, bit: u8, value: bool) -> Self {
        if value {
            self.0 |= bit;
        } else {
            self.0 &= !bit;
        }
        self
    }

    pub fn set(&mut self, bit: u8, value: bool) {
        *self = self.with(bit, value);
    }
}

impl fmt::Display for LacpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (Self::ACTIVITY, "Act"),
            (Self::TIMEOUT, "Short"),
            (Self::AGGREGATION, "Agg"),
            (Self::SYNCHRONIZATION, "Sync"),
            (Self::COLLECTING, "Col"),
            (Self::DISTRIBUTING, "Dist"),
            (Self::DEFAULTED, "Def"),
            (Self::EXPIRED, "Exp"),
        ];
        let mut first = true;
        for (bit, name) in names {
            if self.0 & bit != 0 {
                if !first {
                    write!(f, "+")?;
                }
                write!(f, "{name}")?;
                first = false;
            }
        }
        if first {
            write!(f, "-")?;
        }
        Ok(())
    }
}

/// One party's information set (actor or partner TLV)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PortInfo {
    pub system: SystemId,
    pub key: u16,
    pub port: PortId,
    pub state: LacpState,
}

impl PortInfo {
    fn put(&self, buf: &mut BytesMut, tlv_type: u8) {
        buf.put_u8(tlv_type);
        buf.put_u8(20);
        buf.put_u16(self.system.priority);
        buf.put_slice(self.system.addr.as_bytes());
        buf.put_u16(self.key);
        buf.put_u16(self.port.priority);
        buf.put_u16(self.port.number);
        buf.put_u8(self.state.0);
        buf.put_bytes(0, 3);
    }

    fn parse(info: &[u8]) -> Result<Self> {
        // 18 info bytes follow the two TLV header bytes
        let system = SystemId::from_bytes(&info[0..8])?;
        let key = u16::from_be_bytes([info[8], info[9]]);
        let port = PortId::new(
            u16::from_be_bytes([info[10], info[11]]),
            u16::from_be_bytes([info[12], info[13]]),
        );
        let state = LacpState::new(info[14]);
        Ok(Self {
            system,
            key,
            port,
            state,
        })
    }
}

/// A parsed or to-be-built LACPDU
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lacpdu {
    /// Protocol version, 1 or 2
    pub version: u8,
    pub actor: PortInfo,
    pub partner: PortInfo,
    /// Collector max delay, tens of microseconds
    pub collector_max_delay: u16,
    /// Version 2: actor's frame distribution algorithm
    pub port_algorithm: Option<LagAlgorithm>,
    /// Version 2: digest of the actor's conversation-to-link policy
    pub conversation_digest: Option<[u8; 16]>,
    /// Version 2: conversation IDs the actor is willing to distribute,
    /// present only in conversation-sensitive mode
    pub conversation_mask: Option<CidBitmap>,
    /// Version 2: administratively assigned link number of the actor port
    pub admin_link_number: Option<u16>,
}

impl Lacpdu {
    /// Build a version 1 PDU
    pub fn v1(actor: PortInfo, partner: PortInfo) -> Self {
        Self {
            version: 1,
            actor,
            partner,
            collector_max_delay: 0,
            port_algorithm: None,
            conversation_digest: None,
            conversation_mask: None,
            admin_link_number: None,
        }
    }

    /// Build a version 2 PDU carrying the distribution TLVs
    pub fn v2(
        actor: PortInfo,
        partner: PortInfo,
        port_algorithm: LagAlgorithm,
        conversation_digest: [u8; 16],
        admin_link_number: u16,
    ) -> Self {
        Self {
            version: 2,
            actor,
            partner,
            collector_max_delay: 0,
            port_algorithm: Some(port_algorithm),
            conversation_digest: Some(conversation_digest),
            conversation_mask: None,
            admin_link_number: Some(admin_link_number),
        }
    }

    /// Serialize to the wire format
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(LACPDU_V1_LEN);
        buf.put_u8(LACP_SUBTYPE);
        buf.put_u8(self.version);
        self.actor.put(&mut buf, TLV_ACTOR);
        self.partner.put(&mut buf, TLV_PARTNER);

        buf.put_u8(TLV_COLLECTOR);
        buf.put_u8(16);
        buf.put_u16(self.collector_max_delay);
        buf.put_bytes(0, 12);

        if self.version >= 2 {
            if let Some(alg) = self.port_algorithm {
                buf.put_u8(TLV_PORT_ALGORITHM);
                buf.put_u8(6);
                buf.put_slice(&alg.to_bytes());
            }
            if let Some(digest) = &self.conversation_digest {
                buf.put_u8(TLV_CONVERSATION_DIGEST);
                buf.put_u8(18);
                buf.put_slice(digest);
            }
            if let Some(mask) = &self.conversation_mask {
                let bytes = mask.to_bytes();
                for (i, chunk) in bytes.chunks(128).enumerate() {
                    buf.put_u8(TLV_CONVERSATION_MASK_FIRST + i as u8);
                    buf.put_u8(130);
                    buf.put_slice(chunk);
                }
            }
            if let Some(link) = self.admin_link_number {
                buf.put_u8(TLV_ADMIN_LINK_NUMBER);
                buf.put_u8(4);
                buf.put_u16(link);
            }
        }

        buf.put_u8(TLV_TERMINATOR);
        buf.put_u8(0);
        if buf.len() < LACPDU_V1_LEN {
            buf.put_bytes(0, LACPDU_V1_LEN - buf.len());
        }
        buf.to_vec()
    }

    /// Parse from the wire format. Padding after the terminator is
    /// ignored; an unknown TLV type or a wrong TLV length discards the
    /// PDU.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < 2 {
            return Err(Error::malformed("LACPDU too short"));
        }
        if data[0] != LACP_SUBTYPE {
            return Err(Error::malformed("Not a LACP slow-protocols subtype"));
        }
        let version = data[1];
        if version == 0 {
            return Err(Error::malformed("LACPDU version 0"));
        }

        let mut pdu = Lacpdu {
            version,
            actor: PortInfo::default(),
            partner: PortInfo::default(),
            collector_max_delay: 0,
            port_algorithm: None,
            conversation_digest: None,
            conversation_mask: None,
            admin_link_number: None,
        };
        let mut mask_bytes = [0u8; 512];
        let mut mask_seen = 0u8;

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
            if tlv_len < 2 || at + tlv_len > data.len() {
                return Err(Error::malformed("TLV length out of range"));
            }
            let info = &data[at + 2..at + tlv_len];
            match tlv_type {
                TLV_ACTOR => {
                    Self::expect_len(tlv_len, 20, "actor")?;
                    pdu.actor = PortInfo::parse(info)?;
                }
                TLV_PARTNER => {
                    Self::expect_len(tlv_len, 20, "partner")?;
                    pdu.partner = PortInfo::parse(info)?;
                }
                TLV_COLLECTOR => {
                    Self::expect_len(tlv_len, 16, "collector")?;
                    pdu.collector_max_delay = u16::from_be_bytes([info[0], info[1]]);
                }
                TLV_PORT_ALGORITHM => {
                    Self::expect_len(tlv_len, 6, "port algorithm")?;
                    pdu.port_algorithm = Some(LagAlgorithm::from_bytes(info)?);
                }
                TLV_CONVERSATION_DIGEST => {
                    Self::expect_len(tlv_len, 18, "conversation digest")?;
                    let mut digest = [0u8; 16];
                    digest.copy_from_slice(info);
                    pdu.conversation_digest = Some(digest);
                }
                TLV_CONVERSATION_MASK_FIRST..=TLV_CONVERSATION_MASK_LAST => {
                    Self::expect_len(tlv_len, 130, "conversation mask")?;
                    let index = usize::from(tlv_type - TLV_CONVERSATION_MASK_FIRST);
                    mask_bytes[index * 128..(index + 1) * 128].copy_from_slice(info);
                    mask_seen |= 1 << index;
                }
                TLV_ADMIN_LINK_NUMBER => {
                    Self::expect_len(tlv_len, 4, "admin link number")?;
                    pdu.admin_link_number = Some(u16::from_be_bytes([info[0], info[1]]));
                }
                other => {
                    return Err(Error::malformed(format!("Unknown LACPDU TLV type {other}")));
                }
            }
            at += tlv_len;
        }

        if mask_seen == 0x0f {
            pdu.conversation_mask = Some(CidBitmap::from_bytes(&mask_bytes));
        } else if mask_seen != 0 {
            return Err(Error::malformed("Incomplete conversation mask TLV set"));
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
