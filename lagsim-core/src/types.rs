//! Common types used throughout LagSim

use std::fmt;
use std::str::FromStr;

/// MAC Address (6 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    /// Create a new MAC address
    pub const fn new(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    /// Broadcast MAC address (ff:ff:ff:ff:ff:ff)
    pub const fn broadcast() -> Self {
        Self([0xff, 0xff, 0xff, 0xff, 0xff, 0xff])
    }

    /// Zero MAC address (00:00:00:00:00:00)
    pub const fn zero() -> Self {
        Self([0x00, 0x00, 0x00, 0x00, 0x00, 0x00])
    }

    /// Get bytes as slice
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Convert to array
    pub fn octets(&self) -> [u8; 6] {
        self.0
    }

    /// Numeric value of the address (big-endian, 48 bits)
    pub fn to_u64(&self) -> u64 {
        let mut v = 0u64;
        for b in self.0 {
            v = (v << 8) | u64::from(b);
        }
        v
    }

    /// Build an address from the low 48 bits of a numeric value
    pub fn from_u64(value: u64) -> Self {
        let mut bytes = [0u8; 6];
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = ((value >> (8 * (5 - i))) & 0xff) as u8;
        }
        Self(bytes)
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

impl FromStr for MacAddr {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 6 {
            return Err(crate::Error::config("Invalid MAC address format"));
        }

        let mut bytes = [0u8; 6];
        for (i, part) in parts.iter().enumerate() {
            bytes[i] = u8::from_str_radix(part, 16)
                .map_err(|_| crate::Error::config("Invalid MAC address hex"))?;
        }

        Ok(MacAddr(bytes))
    }
}

/// System identifier: 16-bit priority concatenated with a 48-bit MAC
/// address. Ordering follows the 64-bit concatenated value, lower wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SystemId {
    /// System priority (0-65535, lower is better)
    pub priority: u16,
    /// System MAC address
    pub addr: MacAddr,
}

impl SystemId {
    /// Create a new system identifier
    pub fn new(priority: u16, addr: MacAddr) -> Self {
        Self { priority, addr }
    }

    /// The 64-bit priority||MAC value
    pub fn to_u64(&self) -> u64 {
        (u64::from(self.priority) << 48) | self.addr.to_u64()
    }

    /// Build a system identifier from a 64-bit priority||MAC value
    pub fn from_u64(value: u64) -> Self {
        Self {
            priority: (value >> 48) as u16,
            addr: MacAddr::from_u64(value & 0xffff_ffff_ffff),
        }
    }

    /// True for the all-zero identifier (used as "unknown")
    pub fn is_zero(&self) -> bool {
        self.to_u64() == 0
    }

    /// Parse from 8 bytes (priority big-endian, then MAC)
    pub fn from_bytes(bytes: &[u8]) -> crate::Result<Self> {
        if bytes.len() < 8 {
            return Err(crate::Error::malformed("System ID requires 8 bytes"));
        }
        let priority = u16::from_be_bytes([bytes[0], bytes[1]]);
        let addr = MacAddr([bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7]]);
        Ok(Self { priority, addr })
    }

    /// Serialize to 8 bytes
    pub fn to_bytes(&self) -> [u8; 8] {
        let mut bytes = [0u8; 8];
        bytes[0..2].copy_from_slice(&self.priority.to_be_bytes());
        bytes[2..8].copy_from_slice(&self.addr.0);
        bytes
    }
}

impl PartialOrd for SystemId {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SystemId {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.to_u64().cmp(&other.to_u64())
    }
}

impl fmt::Display for SystemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}.{}", self.priority, self.addr)
    }
}

/// Port identifier: 16-bit priority plus 16-bit port number
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PortId {
    pub priority: u16,
    pub number: u16,
}

impl PortId {
    pub fn new(priority: u16, number: u16) -> Self {
        Self { priority, number }
    }
}

impl fmt::Display for PortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}:{}", self.priority, self.number)
    }
}

/// Conversation identifier, 0-4095, derived from a frame by the port
/// algorithm
pub type ConversationId = u16;

/// Number of distinct conversation identifiers
pub const CONVERSATION_ID_COUNT: usize = 4096;

/// Link number carried in v2 LACPDUs and used by the conversation-to-link
/// maps; 0 means "no link"
pub type LinkNumber = u16;

/// Link Aggregation Group identifier. Two AggPorts may share an Aggregator
/// exactly when their LAGIDs compare equal. Individual ports carry their
/// port numbers; aggregatable ports zero them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct LagId {
    pub actor_system: SystemId,
    pub actor_key: u16,
    pub actor_port: u16,
    pub partner_system: SystemId,
    pub partner_key: u16,
    pub partner_port: u16,
}

impl LagId {
    /// LAGID of a port whose partner is unknown or defaulted: derived from
    /// the actor's own identity with the port component set to its own port
    /// number, keeping the port solitary until it learns a partner.
    pub fn solitary(actor_system: SystemId, actor_key: u16, port_number: u16) -> Self {
        Self {
            actor_system,
            actor_key,
            actor_port: port_number,
            partner_system: SystemId::default(),
            partner_key: 0,
            partner_port: port_number,
        }
    }
}

impl fmt::Display for LagId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{},{:04x},{}|{},{:04x},{}]",
            self.actor_system,
            self.actor_key,
            self.actor_port,
            self.partner_system,
            self.partner_key,
            self.partner_port
        )
    }
}

/// Frame distribution algorithms advertised in the Port-Algorithm TLV
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum LagAlgorithm {
    /// No algorithm agreed; every frame maps to conversation 0
    #[default]
    Unspecified = 0,
    /// Outermost customer VLAN ID
    CVid = 1,
    /// Outermost service VLAN ID
    SVid = 2,
    /// Backbone service instance (not carried by simulated frames)
    ISid = 3,
    /// 12-bit fold of the destination MAC address
    DestMac = 4,
    /// 12-bit fold of source XOR destination MAC addresses
    SourceDestMac = 5,
}

impl From<u8> for LagAlgorithm {
    fn from(value: u8) -> Self {
        match value {
            1 => LagAlgorithm::CVid,
            2 => LagAlgorithm::SVid,
            3 => LagAlgorithm::ISid,
            4 => LagAlgorithm::DestMac,
            5 => LagAlgorithm::SourceDestMac,
            _ => LagAlgorithm::Unspecified,
        }
    }
}

impl LagAlgorithm {
    /// Four-byte wire encoding: the 802.1 OUI followed by the algorithm
    /// discriminant
    pub fn to_bytes(self) -> [u8; 4] {
        [0x00, 0x80, 0xc2, self as u8]
    }

    /// Decode the four-byte wire encoding
    pub fn from_bytes(bytes: &[u8]) -> crate::Result<Self> {
        if bytes.len() < 4 {
            return Err(crate::Error::malformed("Port algorithm requires 4 bytes"));
        }
        if bytes[0..3] != [0x00, 0x80, 0xc2] {
            return Err(crate::Error::malformed("Unknown port algorithm OUI"));
        }
        Ok(LagAlgorithm::from(bytes[3]))
    }
}

/// Ethertype constants
pub mod ethertypes {
    /// Customer VLAN tag (802.1Q)
    pub const CVLAN: u16 = 0x8100;
    /// Service VLAN tag (802.1ad)
    pub const SVLAN: u16 = 0x88A8;
    /// Slow Protocols (LACP, DRCP, OAM...)
    pub const SLOW_PROTOCOLS: u16 = 0x8809;
    /// IPv4, used for generated test payloads
    pub const IPV4: u16 = 0x0800;
}

/// Protocol group addresses and slow-protocol subtypes
pub mod protocol_constants {
    use super::MacAddr;

    /// Slow Protocols group address, the default LACPDU destination
    pub const SLOW_PROTOCOLS_DA: MacAddr = MacAddr([0x01, 0x80, 0xC2, 0x00, 0x00, 0x02]);

    /// Nearest Customer Bridge group address, the alternative LACPDU
    /// destination for hierarchical aggregation
    pub const NEAREST_CUSTOMER_BRIDGE_DA: MacAddr = MacAddr([0x01, 0x80, 0xC2, 0x00, 0x00, 0x00]);

    /// DRCP group address
    pub const DRCP_DA: MacAddr = MacAddr([0x01, 0x80, 0xC2, 0x00, 0x00, 0x03]);

    /// Slow Protocols subtype for LACP
    pub const LACP_SUBTYPE: u8 = 0x01;

    /// Slow Protocols subtype for DRCP
    pub const DRCP_SUBTYPE: u8 = 0x02;
}

/// 802.1AX timer values, in simulation ticks (one tick is one protocol
/// second)
pub mod timers {
    /// Interval between periodic LACPDUs when the partner asks for fast
    /// timeouts
    pub const FAST_PERIODIC_TIME: u32 = 1;
    /// Interval between periodic LACPDUs when the partner asks for slow
    /// timeouts
    pub const SLOW_PERIODIC_TIME: u32 = 30;
    /// current_while when the received Timeout bit asks for short timeouts
    pub const SHORT_TIMEOUT_TIME: u32 = 3;
    /// current_while when the received Timeout bit asks for long timeouts
    pub const LONG_TIMEOUT_TIME: u32 = 90;
    /// wait_while delay before a selected port may attach
    pub const AGGREGATE_WAIT_TIME: u32 = 2;
    /// Maximum LACPDUs transmitted per fast-periodic interval
    pub const TX_LIMIT: u32 = 3;
}
