//! LagSim wire formats
//!
//! Byte-exact encoders and parsers for the two Slow Protocols PDUs the
//! simulator exchanges:
//!
//! - **LACPDU** (subtype 0x01), versions 1 and 2 with the conversation
//!   distribution TLVs
//! - **DRCPDU** (subtype 0x02) carrying portal information and gateway
//!   vectors
//!
//! plus the 128-bit conversation-list digest both PDUs advertise.

pub mod digest;
pub mod drcpdu;
pub mod lacpdu;

pub use digest::{admin_table_digest, fixed_map_digest, vector_digest};
pub use drcpdu::{Drcpdu, DrcpState};
pub use lacpdu::{Lacpdu, LacpState, PortInfo};
