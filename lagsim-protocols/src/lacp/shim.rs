//! Link Aggregation shim
//!
//! The per-system container: arenas of AggPorts and Aggregators (one of
//! each per underlying MAC), the optional Distributed Relays, and the
//! per-tick sequencing of the protocol machines. The driver calls the
//! phase methods in the fixed §order: timers, receive+periodic,
//! selection, mux+transmit, distributed relays.
//!
//! Port numbers start at 100 and aggregator identifiers at 200, so port
//! 10x pairs with aggregator 20x on a fresh shim.

use tracing::warn;

use lagsim_core::types::protocol_constants::{DRCP_SUBTYPE, LACP_SUBTYPE};
use lagsim_core::{ethertypes, Frame, Iss, LinkNumber, MacAddr, SystemId};
use lagsim_packet::{Lacpdu, LacpState};

use crate::drcp::{DistributedRelay, DrConfig};

use super::aggregator::Aggregator;
use super::mux::{mux_step, MuxEvent};
use super::port::{AggPort, RxState};
use super::selection;

/// First port number assigned by a shim
pub const FIRST_PORT_NUMBER: u16 = 100;
/// First aggregator identifier assigned by a shim
pub const FIRST_AGGREGATOR_ID: u16 = 200;

/// The Link Aggregation sublayer of one system
#[derive(Debug)]
pub struct LinkAgg {
    pub system: SystemId,
    pub ports: Vec<AggPort>,
    pub aggregators: Vec<Aggregator>,
    /// At most one relay per aggregator index
    pub dist_relays: Vec<Option<DistributedRelay>>,
}

impl LinkAgg {
    /// Build a shim with one port and one aggregator per MAC
    pub fn new(system: SystemId, num_ports: usize) -> Self {
        let ports = (0..num_ports)
            .map(|i| AggPort::new(i, system, FIRST_PORT_NUMBER + i as u16))
            .collect();
        let aggregators = (0..num_ports)
            .map(|i| {
                Aggregator::new(
                    i,
                    system,
                    FIRST_AGGREGATOR_ID + i as u16,
                    super::port::DEFAULT_ACTOR_KEY,
                )
            })
            .collect();
        let dist_relays = (0..num_ports).map(|_| None).collect();
        Self {
            system,
            ports,
            aggregators,
            dist_relays,
        }
    }

    // ---- driver phases -------------------------------------------------

    /// Phase 1: decrement every timer
    pub fn tick_timers(&mut self) {
        for port in &mut self.ports {
            port.tick_timers();
        }
        for relay in self.dist_relays.iter_mut().flatten() {
            relay.tick_timers();
        }
    }

    /// Carrier change from the MAC under a port
    pub fn set_port_enabled(&mut self, port: usize, enabled: bool) {
        self.ports[port].set_port_enabled(enabled);
    }

    /// Phase 2, PDU path: a Slow Protocols frame arrived on a port.
    /// Malformed PDUs are logged and discarded with no state change.
    pub fn receive_slow_protocol(&mut self, port: usize, frame: &Frame) {
        match frame.slow_protocols_subtype() {
            Some(LACP_SUBTYPE) => {
                if frame.dst != self.ports[port].protocol_da {
                    warn!(port, dst = %frame.dst, "LACPDU to a foreign group address");
                    return;
                }
                match Lacpdu::from_bytes(&frame.payload) {
                    Ok(pdu) => self.receive_lacpdu(port, &pdu),
                    Err(err) => warn!(port, %err, "discarding LACPDU"),
                }
            }
            Some(DRCP_SUBTYPE) => match lagsim_packet::Drcpdu::from_bytes(&frame.payload) {
                Ok(pdu) => {
                    for relay in self.dist_relays.iter_mut().flatten() {
                        if relay.config.ipp_ports.contains(&port) {
                            relay.receive_drcpdu(port, &pdu);
                            return;
                        }
                    }
                    warn!(port, "DRCPDU on a port that is no IPP");
                }
                Err(err) => warn!(port, %err, "discarding DRCPDU"),
            },
            _ => warn!(port, "unknown slow-protocols subtype"),
        }
    }

    fn receive_lacpdu(&mut self, port: usize, pdu: &Lacpdu) {
        // CHECK_MOVED: the same partner port talking on a new AggPort
        // re-initializes the port that believed it owned that partner
        for (qi, q) in self.ports.iter_mut().enumerate() {
            if qi != port
                && q.rx_state == RxState::Current
                && q.partner.system == pdu.actor.system
                && q.partner.port.number == pdu.actor.port.number
            {
                warn!(
                    port = q.port_number,
                    "partner moved to another port, re-initializing"
                );
                q.rx_state = RxState::Initialize;
                q.rx_step(None);
            }
        }

        self.ports[port].rx_step(Some(pdu));

        if pdu.version >= 2 {
            // link-number agreement: the end with the lower system id
            // dictates, the other adopts the partner's assignment
            let partner_link = pdu.admin_link_number.unwrap_or(0);
            let adopt = partner_link != 0 && pdu.actor.system < self.ports[port].actor_oper_system;
            let want = if adopt {
                partner_link
            } else {
                self.ports[port].admin_link_number
            };
            if self.ports[port].oper_link_number != want {
                self.ports[port].oper_link_number = want;
                self.ports[port].ntt = true;
                if let Some(ai) = self.ports[port].attached_aggregator {
                    self.refresh_aggregator_links(ai);
                }
            }

            // distribution policy lands on the port's aggregator
            let target = self.ports[port]
                .attached_aggregator
                .or(self.ports[port].selected_aggregator);
            if let Some(ai) = target {
                self.aggregators[ai]
                    .record_partner_policy(pdu.port_algorithm, pdu.conversation_digest);
            }
        }
    }

    /// Phase 2, timer path: run Receive (for expiry) and Periodic on
    /// every port
    pub fn run_receive_periodic(&mut self) {
        for port in &mut self.ports {
            port.rx_step(None);
            port.periodic_step();
        }
    }

    /// Phase 3: Selection Logic
    pub fn run_selection(&mut self) {
        selection::run_selection(&mut self.ports, &mut self.aggregators);
    }

    /// Phase 4: Mux then Transmit per port, in index order. Returns the
    /// LACPDUs to put on the wire as (port index, frame) pairs.
    pub fn run_mux_transmit(&mut self) -> Vec<(usize, Frame)> {
        let mut refresh: Vec<usize> = Vec::new();
        for i in 0..self.ports.len() {
            let mut events = Vec::new();
            mux_step(&mut self.ports[i], &mut events);
            for event in events {
                match event {
                    MuxEvent::Attach => {
                        if let Some(ai) = self.ports[i].attached_aggregator {
                            self.aggregators[ai].attach(i);
                        }
                    }
                    MuxEvent::Detach => {
                        for agg in &mut self.aggregators {
                            agg.detach(i);
                            agg.release_if_empty();
                        }
                        refresh.extend(0..self.aggregators.len());
                    }
                    MuxEvent::StartDistributing | MuxEvent::StopDistributing => {
                        if let Some(ai) = self
                            .ports[i]
                            .attached_aggregator
                            .or(self.ports[i].last_aggregator)
                        {
                            refresh.push(ai);
                        }
                    }
                }
            }
        }
        refresh.sort_unstable();
        refresh.dedup();
        for ai in refresh {
            self.refresh_aggregator_links(ai);
        }

        let mut out = Vec::new();
        for i in 0..self.ports.len() {
            if self.ports[i].ntt
                && self.ports[i].port_enabled
                && self.ports[i].lacp_enabled
                && self.ports[i].tx_permit()
            {
                self.ports[i].ntt = false;
                out.push((i, self.build_lacpdu_frame(i)));
            }
        }
        out
    }

    /// Phase 5: Distributed Relays. Returns DRCPDU frames as (port
    /// index, frame) pairs.
    pub fn run_dist_relays(&mut self) -> Vec<(usize, Frame)> {
        let mut out = Vec::new();
        let mut relays = std::mem::take(&mut self.dist_relays);
        for relay in relays.iter_mut().flatten() {
            for (port, payload) in relay.run(&mut self.ports, &mut self.aggregators) {
                let frame = Frame::new(
                    lagsim_core::types::protocol_constants::DRCP_DA,
                    self.system.addr,
                    ethertypes::SLOW_PROTOCOLS,
                    payload,
                );
                out.push((port, frame));
            }
        }
        self.dist_relays = relays;
        out
    }

    /// Rebuild an aggregator's distributing-link set from its attached
    /// ports
    pub fn refresh_aggregator_links(&mut self, ai: usize) {
        let links: Vec<(LinkNumber, usize)> = self.aggregators[ai]
            .attached_ports
            .iter()
            .map(|&pi| (&self.ports[pi]))
            .filter(|p| p.actor_oper_state.distributing())
            .map(|p| (p.oper_link_number, p.index))
            .collect();
        self.aggregators[ai].set_active_links(links);
    }

    fn build_lacpdu_frame(&mut self, port: usize) -> Frame {
        let p = &self.ports[port];
        let pdu = if p.lacp_version >= 2 {
            let ai = p
                .attached_aggregator
                .or(p.selected_aggregator)
                .unwrap_or(p.index.min(self.aggregators.len() - 1));
            let agg = &self.aggregators[ai];
            let mut pdu = Lacpdu::v2(
                p.actor_info(),
                p.partner,
                agg.port_algorithm,
                agg.oper_digest,
                p.oper_link_number,
            );
            if agg.oper_discard_wrong_conversation {
                // conversation-sensitive mode: advertise the CIDs this
                // link would carry
                let mut mask = lagsim_core::CidBitmap::new();
                for (cid, &link) in agg.conversation_link.iter().enumerate() {
                    if link == p.oper_link_number && link != 0 {
                        mask.set(cid as u16, true);
                    }
                }
                pdu.conversation_mask = Some(mask);
            }
            pdu
        } else {
            Lacpdu::v1(p.actor_info(), p.partner)
        };
        Frame::new(
            p.protocol_da,
            self.system.addr,
            ethertypes::SLOW_PROTOCOLS,
            pdu.to_bytes(),
        )
    }

    /// Data path: a non-PDU frame arrived on a port; run it through the
    /// port's aggregator (discard-wrong-conversation applies there)
    pub fn deliver_data(&mut self, port: usize, frame: Frame) {
        let link = self.ports[port].oper_link_number;
        if let Some(ai) = self.ports[port].attached_aggregator {
            self.aggregators[ai].receive_from_link(link, frame);
        }
    }

    // ---- administrative surface ----------------------------------------

    pub fn set_port_admin_key(&mut self, port: usize, key: u16) {
        self.ports[port].actor_admin_key = key;
        self.ports[port].actor_oper_key = key;
    }

    pub fn set_port_wtr_time(&mut self, port: usize, wtr: u16) {
        self.ports[port].wtr_time = wtr;
        if wtr & super::port::WTR_NON_REVERTIVE == 0 {
            self.ports[port].non_revertive = false;
        }
    }

    pub fn set_port_link_number(&mut self, port: usize, link: LinkNumber) {
        self.ports[port].admin_link_number = link;
        self.ports[port].oper_link_number = link;
        if let Some(ai) = self.ports[port].attached_aggregator {
            self.refresh_aggregator_links(ai);
        }
        self.ports[port].ntt = true;
    }

    pub fn set_port_protocol_da(&mut self, port: usize, da: MacAddr) {
        self.ports[port].protocol_da = da;
    }

    /// Administrative state bits; the ambient Activity, Timeout and
    /// Aggregation bits flow straight into the operational state
    pub fn set_port_admin_state(&mut self, port: usize, state: LacpState) {
        let ambient = LacpState::ACTIVITY | LacpState::TIMEOUT | LacpState::AGGREGATION;
        let p = &mut self.ports[port];
        p.actor_admin_state = state;
        p.actor_oper_state =
            LacpState::new((p.actor_oper_state.0 & !ambient) | (state.0 & ambient));
        p.ntt = true;
    }

    pub fn set_aggregator_admin_key(&mut self, agg: usize, key: u16) {
        self.aggregators[agg].admin_key = key;
        self.aggregators[agg].oper_key = key;
    }

    pub fn set_aggregator_enabled(&mut self, agg: usize, enabled: bool) {
        self.aggregators[agg].enabled = enabled;
    }

    pub fn set_aggregator_system(&mut self, agg: usize, system: SystemId) {
        self.aggregators[agg].actor_admin_system = system;
        if self.dist_relays[agg].as_ref().map(|r| r.is_paired()) != Some(true) {
            self.aggregators[agg].actor_oper_system = system;
        }
    }

    pub fn set_port_algorithm(&mut self, agg: usize, algorithm: lagsim_core::LagAlgorithm) {
        self.aggregators[agg].port_algorithm = algorithm;
        self.aggregators[agg].refresh_distribution();
        self.mark_members_ntt(agg);
    }

    pub fn set_conv_link_map(&mut self, agg: usize, map: super::distribution::ConvLinkMap) {
        self.aggregators[agg].conv_link_map = map;
        self.aggregators[agg].refresh_distribution();
        self.mark_members_ntt(agg);
    }

    pub fn set_conversation_admin_link(
        &mut self,
        agg: usize,
        cid: u16,
        preferences: Vec<LinkNumber>,
    ) {
        self.aggregators[agg].admin_conv_links[usize::from(cid)] = preferences;
        self.aggregators[agg].refresh_distribution();
        self.mark_members_ntt(agg);
    }

    pub fn set_admin_discard_wrong_conversation(&mut self, agg: usize, dwc: bool) {
        self.aggregators[agg].admin_discard_wrong_conversation = dwc;
        self.aggregators[agg].refresh_distribution();
    }

    /// A policy change must be announced to the partner
    fn mark_members_ntt(&mut self, agg: usize) {
        for i in 0..self.ports.len() {
            if self.ports[i].attached_aggregator == Some(agg)
                || self.ports[i].selected_aggregator == Some(agg)
            {
                self.ports[i].ntt = true;
            }
        }
    }

    /// Install a Distributed Relay virtualizing `config.aggregator_index`.
    /// The IPP ports run DRCP instead of LACP.
    pub fn configure_dist_relay(&mut self, config: DrConfig) {
        for &ipp in &config.ipp_ports {
            self.ports[ipp].lacp_enabled = false;
        }
        let ai = config.aggregator_index;
        self.dist_relays[ai] = Some(DistributedRelay::new(self.system, config));
    }

    pub fn dist_relay(&self, agg: usize) -> Option<&DistributedRelay> {
        self.dist_relays[agg].as_ref()
    }

    pub fn dist_relay_mut(&mut self, agg: usize) -> Option<&mut DistributedRelay> {
        self.dist_relays[agg].as_mut()
    }

    /// Reset every port and aggregator to administrative defaults,
    /// dropping all learned state
    pub fn reset(&mut self) {
        for i in 0..self.ports.len() {
            let p = &self.ports[i];
            let mut fresh = AggPort::new(i, self.system, p.port_number);
            fresh.actor_admin_key = p.actor_admin_key;
            fresh.actor_oper_key = p.actor_admin_key;
            fresh.actor_admin_state = p.actor_admin_state;
            fresh.admin_link_number = p.admin_link_number;
            fresh.oper_link_number = p.admin_link_number;
            fresh.wtr_time = p.wtr_time;
            fresh.protocol_da = p.protocol_da;
            fresh.lacp_version = p.lacp_version;
            self.ports[i] = fresh;
        }
        for i in 0..self.aggregators.len() {
            let a = &self.aggregators[i];
            let mut fresh = Aggregator::new(i, self.system, a.aggregator_id, a.admin_key);
            fresh.enabled = a.enabled;
            fresh.port_algorithm = a.port_algorithm;
            fresh.partner_port_algorithm = a.port_algorithm;
            fresh.conv_link_map = a.conv_link_map;
            fresh.admin_conv_links = a.admin_conv_links.clone();
            fresh.admin_discard_wrong_conversation = a.admin_discard_wrong_conversation;
            fresh.refresh_distribution();
            self.aggregators[i] = fresh;
        }
    }

    /// Aggregator accessors for the layers above
    pub fn aggregator(&self, agg: usize) -> &Aggregator {
        &self.aggregators[agg]
    }

    pub fn aggregator_mut(&mut self, agg: usize) -> &mut Aggregator {
        &mut self.aggregators[agg]
    }

    /// Send a client frame down through an aggregator's ISS
    pub fn transmit_on_aggregator(&mut self, agg: usize, frame: Frame) {
        self.aggregators[agg].transmit(frame);
    }
}
