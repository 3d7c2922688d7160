//! Distributed Relay
//!
//! One DistributedRelay virtualizes a chosen Aggregator of its shim:
//! while paired with its neighbor DR system over the IPP it overwrites
//! the aggregator's (and its DRNI ports') actor identity with the
//! emulated DRNI system id and key, so both peers present one LACP
//! system to the outside. It also partitions conversation gateways
//! between home and peer, and with CSCD enabled forwards peer-gateway
//! conversations across the IPP.

use std::collections::{HashMap, VecDeque};

use tracing::{debug, info, warn};

use lagsim_core::{
    CidBitmap, ConversationId, Frame, LagAlgorithm, LinkNumber, SystemId,
    CONVERSATION_ID_COUNT,
};
use lagsim_packet::{vector_digest, DrcpState, Drcpdu};

use crate::lacp::distribution::conversation_id;
use crate::lacp::port::Selected;
use crate::lacp::{AggPort, Aggregator};

use super::gateway::{self, GatewayOwner, OwnerInputs};
use super::ipp::Ipp;

/// Distributed Relay states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DrState {
    /// No neighbor; the aggregator keeps its own identity
    #[default]
    Solo,
    /// Neighbor current and compatible; emulated identity presented
    Paired,
    /// Neighbor current but reporting a conflicting configuration
    Suspend,
}

/// Static configuration of a Distributed Relay
#[derive(Debug, Clone)]
pub struct DrConfig {
    /// Aggregator arena index this relay virtualizes
    pub aggregator_index: usize,
    /// AggPort arena indices presented outward under the emulated
    /// identity
    pub drni_ports: Vec<usize>,
    /// AggPort arena indices carrying the IPP
    pub ipp_ports: Vec<usize>,
    /// Non-zero: the emulated system id; zero: derive from the lowest
    /// paired home system id
    pub admin_drni_system: SystemId,
    /// Key presented outward while paired
    pub drni_key: u16,
    /// First link number of the DRNI port range
    pub first_link_number: LinkNumber,
}

/// Where a frame entered the relay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOrigin {
    /// From the bridge port or end station above
    Client,
    /// Up from the virtualized aggregator
    Lag,
    /// Across the IPP from the neighbor
    Ipp,
}

/// Forwarding decision for a frame passing through the relay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrAction {
    DeliverUp,
    ForwardToLag,
    ForwardToIpp,
    Discard,
}

/// Last received neighbor state
#[derive(Debug, Clone)]
struct NeighborView {
    system: SystemId,
    admin_drni_system: SystemId,
    drni_key: u16,
    gateway_algorithm: LagAlgorithm,
    cscd: bool,
    enable: CidBitmap,
    preference: CidBitmap,
    enable_digest: [u8; 16],
    preference_digest: [u8; 16],
}

/// One administrative edit of the gateway vectors, kept for race
/// diagnosis
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GatewayEdit {
    /// Sequence number assigned to the edit
    pub sequence: u32,
    pub enable: Option<bool>,
    pub preference: Option<bool>,
}

/// Edits remembered per conversation
const EDIT_HISTORY_DEPTH: usize = 3;

/// The per-system Distributed Relay agent
#[derive(Debug)]
pub struct DistributedRelay {
    pub config: DrConfig,
    pub home_system: SystemId,
    pub state: DrState,
    pub ipps: Vec<Ipp>,

    // home administration
    pub gateway_algorithm: LagAlgorithm,
    pub admin_gateway_enable: CidBitmap,
    pub admin_gateway_preference: CidBitmap,
    pub cscd_gateway_control: bool,

    // consensus state
    neighbor: Option<NeighborView>,
    pub gateway_owner: Box<[GatewayOwner; CONVERSATION_ID_COUNT]>,
    pub inconsistent: CidBitmap,
    edit_history: HashMap<ConversationId, VecDeque<GatewayEdit>>,
    sequence: u32,
    neighbor_sequence: u32,
    acked: bool,

    /// Frames headed up to the client, drained through the ISS
    pub up_rx: VecDeque<Frame>,
}

impl DistributedRelay {
    pub fn new(home_system: SystemId, config: DrConfig) -> Self {
        let ipps = config.ipp_ports.iter().map(|&p| Ipp::new(p)).collect();
        let mut relay = Self {
            config,
            home_system,
            state: DrState::Solo,
            ipps,
            gateway_algorithm: LagAlgorithm::CVid,
            admin_gateway_enable: CidBitmap::full(),
            admin_gateway_preference: CidBitmap::new(),
            cscd_gateway_control: false,
            neighbor: None,
            gateway_owner: Box::new([GatewayOwner::None; CONVERSATION_ID_COUNT]),
            inconsistent: CidBitmap::new(),
            edit_history: HashMap::new(),
            // starts above the zero a fresh neighbor acks by default, so
            // the first vectors always go out in full
            sequence: 1,
            neighbor_sequence: 0,
            acked: false,
            up_rx: VecDeque::new(),
        };
        relay.recompute_owners();
        relay
    }

    /// The system id the relay presents outward while paired: the admin
    /// id when configured, otherwise the lowest paired home system id
    pub fn emulated_system(&self) -> SystemId {
        if !self.config.admin_drni_system.is_zero() {
            return self.config.admin_drni_system;
        }
        match &self.neighbor {
            Some(n) => self.home_system.min(n.system),
            None => self.home_system,
        }
    }

    /// The key presented outward while paired. With a derived system id
    /// the lower system's key comes with it, so both peers advertise one
    /// (id, key) pair.
    pub fn emulated_key(&self) -> u16 {
        if !self.config.admin_drni_system.is_zero() {
            return self.config.drni_key;
        }
        match &self.neighbor {
            Some(n) if n.system < self.home_system => n.drni_key,
            _ => self.config.drni_key,
        }
    }

    pub fn is_paired(&self) -> bool {
        self.state == DrState::Paired
    }

    // ---- administrative surface ----------------------------------------

    pub fn set_gateway_enable(&mut self, enable: CidBitmap) {
        self.apply_edit(&enable, false);
        self.admin_gateway_enable = enable;
        self.after_admin_edit();
    }

    pub fn set_gateway_preference(&mut self, preference: CidBitmap) {
        self.apply_edit(&preference, true);
        self.admin_gateway_preference = preference;
        self.after_admin_edit();
    }

    pub fn set_gateway_algorithm(&mut self, algorithm: LagAlgorithm) {
        self.gateway_algorithm = algorithm;
        self.after_admin_edit();
    }

    pub fn set_cscd_gateway_control(&mut self, enabled: bool) {
        self.cscd_gateway_control = enabled;
        self.after_admin_edit();
    }

    /// Record per-CID history entries for every bit the edit changes
    fn apply_edit(&mut self, new_bits: &CidBitmap, is_preference: bool) {
        let old = if is_preference {
            &self.admin_gateway_preference
        } else {
            &self.admin_gateway_enable
        };
        let sequence = self.sequence + 1;
        for cid in 0..CONVERSATION_ID_COUNT as u16 {
            let before = old.get(cid);
            let after = new_bits.get(cid);
            if before == after {
                continue;
            }
            let entry = if is_preference {
                GatewayEdit {
                    sequence,
                    enable: None,
                    preference: Some(after),
                }
            } else {
                GatewayEdit {
                    sequence,
                    enable: Some(after),
                    preference: None,
                }
            };
            let history = self.edit_history.entry(cid).or_default();
            if history.len() == EDIT_HISTORY_DEPTH {
                history.pop_front();
            }
            history.push_back(entry);
            // the edit is unconfirmed until the neighbor acknowledges it
            self.inconsistent.set(cid, true);
        }
    }

    fn after_admin_edit(&mut self) {
        self.sequence += 1;
        self.acked = false;
        for ipp in &mut self.ipps {
            ipp.ntt = true;
        }
        self.recompute_owners();
    }

    /// Recent admin edits of one conversation, oldest first
    pub fn edit_history(&self, cid: ConversationId) -> Vec<GatewayEdit> {
        self.edit_history
            .get(&cid)
            .map(|h| h.iter().copied().collect())
            .unwrap_or_default()
    }

    // ---- DRCPDU receive ------------------------------------------------

    /// Handle a DRCPDU arriving on `port_index`. Invalid or foreign PDUs
    /// are counted as silence.
    pub fn receive_drcpdu(&mut self, port_index: usize, pdu: &Drcpdu) {
        let Some(ipp) = self.ipps.iter_mut().find(|i| i.port_index == port_index) else {
            return;
        };
        if pdu.home_system == self.home_system {
            warn!("DRCPDU from our own system id, ignoring");
            return;
        }
        ipp.rx_step(true);

        let mut stale = false;
        let (enable, preference) = match (&pdu.gateway_enable, &pdu.gateway_preference) {
            (Some(e), Some(p)) => (e.clone(), p.clone()),
            _ => match &self.neighbor {
                // digest-only PDU: keep the stored vectors if they still
                // match, otherwise flag them stale and ask for a resend
                Some(n) => {
                    if n.enable_digest != pdu.enable_digest
                        || n.preference_digest != pdu.preference_digest
                    {
                        stale = true;
                    }
                    (n.enable.clone(), n.preference.clone())
                }
                None => {
                    stale = true;
                    (CidBitmap::new(), CidBitmap::new())
                }
            },
        };

        self.neighbor = Some(NeighborView {
            system: pdu.home_system,
            admin_drni_system: pdu.admin_drni_system,
            drni_key: pdu.drni_key,
            gateway_algorithm: pdu.gateway_algorithm,
            cscd: pdu.state.cscd_gateway(),
            enable,
            preference,
            enable_digest: pdu.enable_digest,
            preference_digest: pdu.preference_digest,
        });
        // an ack claims "I hold your vectors for this sequence", so a
        // stale view must not advance what we acknowledge
        if !stale {
            self.neighbor_sequence = pdu.sequence;
        }
        if pdu.ack == self.sequence {
            if !self.acked {
                // consensus restored: confirmed edits stop discarding
                self.inconsistent = CidBitmap::new();
            }
            self.acked = true;
        }
        if stale {
            for ipp in &mut self.ipps {
                ipp.ntt = true;
            }
        }
        self.recompute_owners();
    }

    // ---- per-tick operation --------------------------------------------

    pub fn tick_timers(&mut self) {
        for ipp in &mut self.ipps {
            ipp.tick_timers();
        }
    }

    /// Phase 5 of the driver: age neighbor state, update pairing, apply
    /// or revert the emulated identity, recompute gateway owners and
    /// decide DRCPDU transmission. Returns (port index, PDU payload)
    /// pairs to emit.
    pub fn run(
        &mut self,
        ports: &mut [AggPort],
        aggregators: &mut [Aggregator],
    ) -> Vec<(usize, Vec<u8>)> {
        // IPP carrier follows the underlying AggPort
        for ipp in &mut self.ipps {
            ipp.set_enabled(ports[ipp.port_index].port_enabled);
        }
        let mut lost = false;
        for ipp in &mut self.ipps {
            lost |= ipp.rx_step(false);
        }
        if lost || !self.any_ipp_current() {
            if self.neighbor.take().is_some() {
                debug!(system = %self.home_system, "neighbor lost");
            }
        }

        let new_state = self.evaluate_state();
        if new_state != self.state {
            info!(system = %self.home_system, from = ?self.state, to = ?new_state, "relay state change");
            let was_paired = self.state == DrState::Paired;
            self.state = new_state;
            match (was_paired, new_state == DrState::Paired) {
                (false, true) => {
                    // "last agreed" only means anything within a paired
                    // epoch; both peers start the epoch from a clean
                    // slate so their tie-breaks line up
                    self.gateway_owner = Box::new([GatewayOwner::None; CONVERSATION_ID_COUNT]);
                    self.apply_identity(ports, aggregators);
                }
                (true, false) => self.revert_identity(ports, aggregators),
                _ => {}
            }
        } else if self.state == DrState::Paired {
            // a neighbor id change (re-pairing) can move the derived
            // emulated id even while paired
            self.apply_identity(ports, aggregators);
        }

        self.recompute_owners();

        // transmit phase: periodic cadence or explicit need
        let mut out = Vec::new();
        for i in 0..self.ipps.len() {
            let due = self.ipps[i].periodic_step();
            if (due || self.ipps[i].ntt) && self.ipps[i].enabled {
                self.ipps[i].ntt = false;
                let pdu = self.build_drcpdu(aggregators);
                out.push((self.ipps[i].port_index, pdu.to_bytes()));
            }
        }
        out
    }

    fn any_ipp_current(&self) -> bool {
        self.ipps
            .iter()
            .any(|i| i.state == super::ipp::IppRxState::Current)
    }

    fn evaluate_state(&self) -> DrState {
        if !self.any_ipp_current() {
            return DrState::Solo;
        }
        let Some(n) = &self.neighbor else {
            return DrState::Solo;
        };
        // both sides must name the same portal; with an explicit portal
        // id the keys must match too, with a derived id the lower
        // system's key wins
        let compatible = n.admin_drni_system == self.config.admin_drni_system
            && (self.config.admin_drni_system.is_zero() || n.drni_key == self.config.drni_key);
        if !compatible {
            return DrState::Solo;
        }
        // a live neighbor with a conflicting gateway view suspends
        // forwarding instead of splitting the portal
        if n.gateway_algorithm != self.gateway_algorithm {
            return DrState::Suspend;
        }
        DrState::Paired
    }

    fn apply_identity(&self, ports: &mut [AggPort], aggregators: &mut [Aggregator]) {
        let emulated = self.emulated_system();
        let key = self.emulated_key();
        let agg = &mut aggregators[self.config.aggregator_index];
        let changed = agg.actor_oper_system != emulated || agg.oper_key != key;
        agg.actor_oper_system = emulated;
        agg.oper_key = key;
        for (slot, &p) in self.config.drni_ports.iter().enumerate() {
            let port = &mut ports[p];
            port.actor_oper_system = emulated;
            port.actor_oper_key = key;
            port.oper_link_number = self.config.first_link_number + slot as u16;
            if changed {
                // the LAGID this port advertised is gone; reselect and
                // tell the partner
                port.selected = Selected::Unselected;
                port.ntt = true;
            }
        }
        if changed {
            info!(system = %self.home_system, emulated = %emulated, "presenting emulated identity");
        }
    }

    fn revert_identity(&self, ports: &mut [AggPort], aggregators: &mut [Aggregator]) {
        let agg = &mut aggregators[self.config.aggregator_index];
        agg.actor_oper_system = agg.actor_admin_system;
        agg.oper_key = agg.admin_key;
        for &p in &self.config.drni_ports {
            let port = &mut ports[p];
            port.restore_admin_identity();
            port.selected = Selected::Unselected;
            port.ntt = true;
        }
        info!(system = %self.home_system, "reverted to home identity");
    }

    fn recompute_owners(&mut self) {
        match (&self.neighbor, self.state) {
            (Some(n), DrState::Paired) => {
                let inputs = OwnerInputs {
                    home_enable: &self.admin_gateway_enable,
                    home_preference: &self.admin_gateway_preference,
                    peer_enable: &n.enable,
                    peer_preference: &n.preference,
                    home_is_lower: self.home_system < n.system,
                };
                let clashes = gateway::compute_owners(&inputs, &mut self.gateway_owner);
                // unacknowledged edits stay inconsistent on top of any
                // both-claim clashes
                if self.acked {
                    self.inconsistent = clashes;
                } else {
                    for cid in 0..CONVERSATION_ID_COUNT as u16 {
                        if clashes.get(cid) {
                            self.inconsistent.set(cid, true);
                        }
                    }
                }
            }
            _ => {
                // solo or suspended: home gateways everything it has
                // enabled, nothing is in dispute
                for cid in 0..CONVERSATION_ID_COUNT as u16 {
                    self.gateway_owner[usize::from(cid)] = if self.admin_gateway_enable.get(cid) {
                        GatewayOwner::Home
                    } else {
                        GatewayOwner::None
                    };
                }
                self.inconsistent = CidBitmap::new();
            }
        }
    }

    fn build_drcpdu(&self, aggregators: &[Aggregator]) -> Drcpdu {
        let agg = &aggregators[self.config.aggregator_index];
        let state = DrcpState::new(DrcpState::ACTIVITY | DrcpState::TIMEOUT)
            .with(DrcpState::CSCD_GATEWAY, self.cscd_gateway_control)
            .with(DrcpState::GATEWAY_SYNC, self.inconsistent.is_empty())
            .with(
                DrcpState::DEFAULTED,
                self.neighbor.is_none(),
            );
        // carry the full vectors until the neighbor acknowledges the
        // current sequence
        let carry_vectors = !self.acked;
        Drcpdu {
            home_system: self.home_system,
            admin_drni_system: self.config.admin_drni_system,
            drni_key: self.config.drni_key,
            home_aggregator_key: agg.admin_key,
            gateway_algorithm: self.gateway_algorithm,
            state,
            neighbor_system: self.neighbor.as_ref().map(|n| n.system).unwrap_or_default(),
            home_ports: agg.active_links.clone(),
            gateway_enable: carry_vectors.then(|| self.admin_gateway_enable.clone()),
            gateway_preference: carry_vectors.then(|| self.admin_gateway_preference.clone()),
            enable_digest: vector_digest(&self.admin_gateway_enable),
            preference_digest: vector_digest(&self.admin_gateway_preference),
            sequence: self.sequence,
            ack: self.neighbor_sequence,
        }
    }

    // ---- frame relay ---------------------------------------------------

    /// Forwarding decision for a frame entering the relay. Conversations
    /// without consensus are not forwarded at all.
    pub fn classify(&self, origin: FrameOrigin, frame: &Frame) -> DrAction {
        let cid = conversation_id(self.gateway_algorithm, frame);
        if self.state == DrState::Suspend {
            return DrAction::Discard;
        }
        if self.inconsistent.get(cid) {
            return DrAction::Discard;
        }
        let owner = self.gateway_owner[usize::from(cid)];
        let cscd = self.cscd_active();
        match (owner, origin) {
            (GatewayOwner::None, _) => DrAction::Discard,
            (GatewayOwner::Home, FrameOrigin::Client) => DrAction::ForwardToLag,
            (GatewayOwner::Home, FrameOrigin::Lag) => DrAction::DeliverUp,
            // the neighbor collected this on its LAG links and handed it
            // to our gateway
            (GatewayOwner::Home, FrameOrigin::Ipp) => DrAction::DeliverUp,
            (GatewayOwner::Peer, FrameOrigin::Client) => {
                if cscd {
                    DrAction::ForwardToIpp
                } else {
                    DrAction::Discard
                }
            }
            (GatewayOwner::Peer, FrameOrigin::Lag) => {
                if cscd {
                    DrAction::ForwardToIpp
                } else {
                    DrAction::Discard
                }
            }
            // peer-gateway traffic arriving over the IPP leaves through
            // our aggregator links
            (GatewayOwner::Peer, FrameOrigin::Ipp) => DrAction::ForwardToLag,
        }
    }

    fn cscd_active(&self) -> bool {
        self.state == DrState::Paired
            && self.cscd_gateway_control
            && self.neighbor.as_ref().map(|n| n.cscd).unwrap_or(false)
    }
}
