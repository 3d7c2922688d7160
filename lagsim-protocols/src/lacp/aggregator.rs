//! Aggregator
//!
//! A logical bundle endpoint. Zero or more AggPorts attach to an
//! Aggregator; it exposes one ISS upward and owns the conversation-ID
//! to link-number map used to distribute frames over its links, plus the
//! discard-wrong-conversation enforcement on receive.
//!
//! Attachment is by arena index; the shim applies Mux attach/detach
//! events here and refreshes the distribution state whenever the set of
//! distributing links changes.

use std::collections::VecDeque;

use tracing::{debug, warn};

use lagsim_core::{
    ConversationId, Frame, Iss, LagAlgorithm, LagId, LinkNumber, SystemId,
    CONVERSATION_ID_COUNT,
};

use super::distribution::{self, ConvLinkMap};

/// A logical aggregation of links
#[derive(Debug)]
pub struct Aggregator {
    /// Arena index within the owning shim
    pub index: usize,
    /// Aggregator identifier carried on the management surface (first
    /// aggregator of a shim is 200)
    pub aggregator_id: u16,
    pub actor_admin_system: SystemId,
    pub actor_oper_system: SystemId,
    pub admin_key: u16,
    pub oper_key: u16,
    /// A disabled aggregator is never chosen by Selection
    pub enabled: bool,

    /// Partner identity of the LAG currently bound here
    pub partner_system: SystemId,
    pub partner_key: u16,
    /// LAGID of the attached ports (None while free)
    pub lag_id: Option<LagId>,
    /// Attached port arena indices, kept sorted by port number
    pub attached_ports: Vec<usize>,

    // distribution
    pub port_algorithm: LagAlgorithm,
    pub partner_port_algorithm: LagAlgorithm,
    pub conv_link_map: ConvLinkMap,
    /// Per-CID ordered link preference lists for [`ConvLinkMap::AdminTable`]
    pub admin_conv_links: Vec<Vec<LinkNumber>>,
    pub oper_digest: [u8; 16],
    /// Last digest reported by the partner, if any
    pub partner_digest: Option<[u8; 16]>,
    pub admin_discard_wrong_conversation: bool,
    pub oper_discard_wrong_conversation: bool,
    /// CID to link-number map over the currently distributing links
    pub conversation_link: Box<[LinkNumber; CONVERSATION_ID_COUNT]>,
    /// Distributing link numbers, sorted ascending
    pub active_links: Vec<LinkNumber>,
    /// link number -> attached port arena index
    link_ports: Vec<(LinkNumber, usize)>,

    // ISS plumbing: frames headed up to the client and down to ports
    up_rx: VecDeque<Frame>,
    /// (port arena index, frame) pairs drained by the device each tick
    pub down_tx: VecDeque<(usize, Frame)>,
    /// Distribution decisions of the current tick, for inspection
    pub tx_trace: Vec<(ConversationId, LinkNumber)>,
}

impl Aggregator {
    pub fn new(index: usize, system: SystemId, aggregator_id: u16, admin_key: u16) -> Self {
        Self {
            index,
            aggregator_id,
            actor_admin_system: system,
            actor_oper_system: system,
            admin_key,
            oper_key: admin_key,
            enabled: true,
            partner_system: SystemId::default(),
            partner_key: 0,
            lag_id: None,
            attached_ports: Vec::new(),
            port_algorithm: LagAlgorithm::DestMac,
            partner_port_algorithm: LagAlgorithm::DestMac,
            conv_link_map: ConvLinkMap::default(),
            admin_conv_links: vec![Vec::new(); CONVERSATION_ID_COUNT],
            oper_digest: distribution::policy_digest(ConvLinkMap::default(), &[]),
            partner_digest: None,
            admin_discard_wrong_conversation: false,
            oper_discard_wrong_conversation: false,
            conversation_link: Box::new([0; CONVERSATION_ID_COUNT]),
            active_links: Vec::new(),
            link_ports: Vec::new(),
            up_rx: VecDeque::new(),
            down_tx: VecDeque::new(),
            tx_trace: Vec::new(),
        }
    }

    /// True while at least one link is distributing
    pub fn is_operational(&self) -> bool {
        !self.active_links.is_empty()
    }

    /// True while no port has selected or attached to this aggregator
    pub fn is_free(&self) -> bool {
        self.attached_ports.is_empty() && self.lag_id.is_none()
    }

    pub fn attach(&mut self, port_index: usize) {
        if !self.attached_ports.contains(&port_index) {
            self.attached_ports.push(port_index);
            self.attached_ports.sort_unstable();
        }
    }

    pub fn detach(&mut self, port_index: usize) {
        self.attached_ports.retain(|&p| p != port_index);
    }

    /// Replace the distributing link set. `links` pairs link numbers with
    /// their port arena indices; duplicates are a configuration error
    /// that drops the duplicate link.
    pub fn set_active_links(&mut self, mut links: Vec<(LinkNumber, usize)>) {
        links.sort_unstable();
        let mut seen = Vec::new();
        links.retain(|(l, _)| {
            if seen.contains(l) {
                warn!(
                    aggregator = self.aggregator_id,
                    link = l,
                    "duplicate link number, dropping duplicate"
                );
                false
            } else {
                seen.push(*l);
                true
            }
        });
        self.link_ports = links;
        self.active_links = self.link_ports.iter().map(|(l, _)| *l).collect();
        self.refresh_distribution();
    }

    /// Rebuild the conversation map and digest after any policy or link
    /// change
    pub fn refresh_distribution(&mut self) {
        self.conversation_link = distribution::build_conversation_link_map(
            self.conv_link_map,
            &self.active_links,
            &self.admin_conv_links,
        );
        self.oper_digest =
            distribution::policy_digest(self.conv_link_map, &self.admin_conv_links);
        self.update_agreement();
    }

    /// Record the partner's advertised distribution policy from a
    /// version 2 LACPDU
    pub fn record_partner_policy(
        &mut self,
        algorithm: Option<LagAlgorithm>,
        digest: Option<[u8; 16]>,
    ) {
        if let Some(alg) = algorithm {
            self.partner_port_algorithm = alg;
        }
        self.partner_digest = digest;
        self.update_agreement();
    }

    /// Both ends distribute a conversation only if they agree: shared
    /// port algorithm and matching digests. Disagreement turns on
    /// discard-wrong-conversation until re-agreement.
    fn update_agreement(&mut self) {
        let agree = match self.partner_digest {
            Some(d) => {
                d == self.oper_digest && self.partner_port_algorithm == self.port_algorithm
            }
            None => true,
        };
        let dwc = self.admin_discard_wrong_conversation || !agree;
        if dwc != self.oper_discard_wrong_conversation {
            debug!(
                aggregator = self.aggregator_id,
                dwc, "discard-wrong-conversation changed"
            );
        }
        self.oper_discard_wrong_conversation = dwc;
    }

    /// Link number a received frame arrived on -> accept or discard,
    /// then queue upward
    pub fn receive_from_link(&mut self, link: LinkNumber, frame: Frame) {
        if self.oper_discard_wrong_conversation {
            let cid = distribution::conversation_id(self.port_algorithm, &frame);
            if self.conversation_link[usize::from(cid)] != link {
                debug!(
                    aggregator = self.aggregator_id,
                    cid, link, "discarding wrong-conversation frame"
                );
                return;
            }
        }
        self.up_rx.push_back(frame);
    }

    /// The port arena index serving a link number
    pub fn port_for_link(&self, link: LinkNumber) -> Option<usize> {
        self.link_ports
            .iter()
            .find(|(l, _)| *l == link)
            .map(|(_, p)| *p)
    }

    /// Clear the association when the last port leaves
    pub fn release_if_empty(&mut self) {
        if self.attached_ports.is_empty() {
            self.lag_id = None;
            self.partner_system = SystemId::default();
            self.partner_key = 0;
        }
    }
}

impl Iss for Aggregator {
    /// Distribute a frame from the client over the member links
    fn transmit(&mut self, frame: Frame) {
        let cid = distribution::conversation_id(self.port_algorithm, &frame);
        let link = self.conversation_link[usize::from(cid)];
        self.tx_trace.push((cid, link));
        if link == 0 {
            debug!(aggregator = self.aggregator_id, cid, "no link for conversation");
            return;
        }
        if let Some(port) = self.port_for_link(link) {
            self.down_tx.push_back((port, frame));
        }
    }

    fn poll_receive(&mut self) -> Option<Frame> {
        self.up_rx.pop_front()
    }

    fn operational(&self) -> bool {
        self.is_operational()
    }
}
