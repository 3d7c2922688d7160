//! Two-system convergence tests for the LACP engine
//!
//! These wire two shims back to back with an in-memory pump (one tick of
//! store-and-forward per direction, no propagation delay) and check the
//! protocol-level properties; the full wire model with delays lives in
//! the simulator crate.

use lagsim_core::{ethertypes, Frame, LagAlgorithm, MacAddr, SystemId, VlanTag};

use super::distribution::ConvLinkMap;
use super::mux::MuxState;
use super::port::Selected;
use super::shim::LinkAgg;

struct Pair {
    a: LinkAgg,
    b: LinkAgg,
    /// (a port, b port, up); frames queued last tick deliver this tick
    links: Vec<(usize, usize, bool)>,
    a_out: Vec<(usize, Frame)>,
    b_out: Vec<(usize, Frame)>,
}

impl Pair {
    fn new(ports: usize) -> Self {
        let sys_a = SystemId::new(0x8000, MacAddr([0, 0x55, 0, 0, 0, 0x01]));
        let sys_b = SystemId::new(0x8000, MacAddr([0, 0x55, 0, 0, 0, 0x02]));
        Self {
            a: LinkAgg::new(sys_a, ports),
            b: LinkAgg::new(sys_b, ports),
            links: Vec::new(),
            a_out: Vec::new(),
            b_out: Vec::new(),
        }
    }

    fn connect(&mut self, a_port: usize, b_port: usize) {
        self.links.push((a_port, b_port, true));
        self.a.set_port_enabled(a_port, true);
        self.b.set_port_enabled(b_port, true);
    }

    fn disconnect_a(&mut self, a_port: usize) {
        for (ap, bp, up) in self.links.iter_mut() {
            if *ap == a_port && *up {
                *up = false;
                self.a.set_port_enabled(*ap, false);
                self.b.set_port_enabled(*bp, false);
            }
        }
    }

    fn peer_port(links: &[(usize, usize, bool)], from_a: bool, port: usize) -> Option<usize> {
        links.iter().find_map(|&(ap, bp, up)| {
            if !up {
                return None;
            }
            if from_a && ap == port {
                Some(bp)
            } else if !from_a && bp == port {
                Some(ap)
            } else {
                None
            }
        })
    }

    fn tick(&mut self) {
        self.a.tick_timers();
        self.b.tick_timers();

        // deliver last tick's frames
        for (port, frame) in std::mem::take(&mut self.a_out) {
            if let Some(peer) = Self::peer_port(&self.links, true, port) {
                if frame.is_slow_protocols() {
                    self.b.receive_slow_protocol(peer, &frame);
                } else {
                    self.b.deliver_data(peer, frame);
                }
            }
        }
        for (port, frame) in std::mem::take(&mut self.b_out) {
            if let Some(peer) = Self::peer_port(&self.links, false, port) {
                if frame.is_slow_protocols() {
                    self.a.receive_slow_protocol(peer, &frame);
                } else {
                    self.a.deliver_data(peer, frame);
                }
            }
        }

        self.a.run_receive_periodic();
        self.b.run_receive_periodic();
        self.a.run_selection();
        self.b.run_selection();
        self.a_out = self.a.run_mux_transmit();
        self.b_out = self.b.run_mux_transmit();
    }

    fn run(&mut self, ticks: usize) {
        for _ in 0..ticks {
            self.tick();
        }
    }
}

fn assert_invariants(shim: &LinkAgg) {
    for port in &shim.ports {
        // collecting or distributing implies an aggregator and a
        // synchronized partner
        if matches!(port.mux_state, MuxState::Collecting | MuxState::Distributing) {
            assert!(port.attached_aggregator.is_some());
            assert!(port.partner.state.synchronization());
        }
    }
    for agg in &shim.aggregators {
        // no two attached ports with distinct LAGIDs
        let ids: Vec<_> = agg
            .attached_ports
            .iter()
            .map(|&p| shim.ports[p].lag_id())
            .collect();
        assert!(ids.windows(2).all(|w| w[0] == w[1]));
        // conversation map names only distributing links
        assert!(agg
            .conversation_link
            .iter()
            .all(|&l| l == 0 || agg.active_links.contains(&l)));
    }
}

#[test]
fn test_single_link_converges_to_distributing() {
    let mut pair = Pair::new(2);
    pair.connect(0, 0);
    pair.run(20);

    assert_eq!(pair.a.ports[0].mux_state, MuxState::Distributing);
    assert_eq!(pair.b.ports[0].mux_state, MuxState::Distributing);
    assert_eq!(pair.a.ports[0].attached_aggregator, Some(0));
    assert!(pair.a.aggregators[0].is_operational());
    assert_invariants(&pair.a);
    assert_invariants(&pair.b);
}

#[test]
fn test_three_links_one_lag() {
    let mut pair = Pair::new(4);
    pair.connect(0, 0);
    pair.run(15);
    pair.connect(1, 1);
    pair.run(15);
    pair.connect(2, 2);
    pair.run(15);

    for i in 0..3 {
        assert_eq!(pair.a.ports[i].mux_state, MuxState::Distributing, "port {i}");
        assert_eq!(pair.a.ports[i].attached_aggregator, Some(0));
        assert_eq!(pair.b.ports[i].attached_aggregator, Some(0));
    }
    assert_eq!(pair.a.aggregators[0].active_links, vec![1, 2, 3]);
    assert_invariants(&pair.a);
    assert_invariants(&pair.b);
}

#[test]
fn test_link_drop_redistributes_immediately() {
    let mut pair = Pair::new(4);
    pair.connect(0, 0);
    pair.connect(1, 1);
    pair.connect(2, 2);
    pair.run(25);
    assert_eq!(pair.a.aggregators[0].active_links, vec![1, 2, 3]);

    pair.disconnect_a(0);
    pair.tick();

    // survivors keep distributing and the map now names links 2 and 3
    assert_eq!(pair.a.ports[1].mux_state, MuxState::Distributing);
    assert_eq!(pair.a.ports[2].mux_state, MuxState::Distributing);
    assert_eq!(pair.a.aggregators[0].active_links, vec![2, 3]);
    assert!(pair
        .a
        .aggregators[0]
        .conversation_link
        .iter()
        .all(|&l| l == 2 || l == 3));
    assert_invariants(&pair.a);
}

#[test]
fn test_partner_reconverges_after_quiescence() {
    let mut pair = Pair::new(2);
    pair.connect(0, 0);
    pair.run(20);

    // selection has reached a fixed point: another pass changes nothing
    let before: Vec<_> = pair
        .a
        .ports
        .iter()
        .map(|p| (p.selected, p.selected_aggregator, p.mux_state))
        .collect();
    pair.a.run_selection();
    let after: Vec<_> = pair
        .a
        .ports
        .iter()
        .map(|p| (p.selected, p.selected_aggregator, p.mux_state))
        .collect();
    assert_eq!(before, after);
}

#[test]
fn test_admin_table_digest_disagreement_sets_dwc() {
    let mut pair = Pair::new(2);
    pair.connect(0, 0);
    pair.run(20);
    assert!(!pair.b.aggregators[0].oper_discard_wrong_conversation);

    // one side switches to an admin table: its digest changes and the
    // peer must discard wrong conversations until it matches
    pair.a
        .set_conversation_admin_link(0, 7, vec![1]);
    pair.a.set_conv_link_map(0, ConvLinkMap::AdminTable);
    pair.run(5);
    assert!(pair.b.aggregators[0].oper_discard_wrong_conversation);
    assert!(pair.a.aggregators[0].oper_discard_wrong_conversation);

    // matching the policy on the peer restores agreement
    pair.b
        .set_conversation_admin_link(0, 7, vec![1]);
    pair.b.set_conv_link_map(0, ConvLinkMap::AdminTable);
    pair.run(5);
    assert!(!pair.b.aggregators[0].oper_discard_wrong_conversation);
    assert!(!pair.a.aggregators[0].oper_discard_wrong_conversation);
}

#[test]
fn test_tx_rate_never_exceeds_three_per_interval() {
    let mut pair = Pair::new(2);
    pair.connect(0, 0);
    for _ in 0..30 {
        pair.tick();
        let from_port0 = pair.a_out.iter().filter(|(p, _)| *p == 0).count();
        assert!(from_port0 <= 3, "{from_port0} LACPDUs in one interval");
    }
}

#[test]
fn test_admin_writes_within_a_tick_commute() {
    let build = |first_link_number: bool| {
        let sys = SystemId::new(0x8000, MacAddr([0, 0x55, 0, 0, 0, 0x01]));
        let mut shim = LinkAgg::new(sys, 2);
        if first_link_number {
            shim.set_port_link_number(0, 17);
            shim.set_conv_link_map(0, ConvLinkMap::EightLinkSpread);
        } else {
            shim.set_conv_link_map(0, ConvLinkMap::EightLinkSpread);
            shim.set_port_link_number(0, 17);
        }
        shim
    };
    let x = build(true);
    let y = build(false);
    assert_eq!(x.aggregators[0].conv_link_map, y.aggregators[0].conv_link_map);
    assert_eq!(x.aggregators[0].oper_digest, y.aggregators[0].oper_digest);
    assert_eq!(x.ports[0].oper_link_number, y.ports[0].oper_link_number);
}

#[test]
fn test_data_frames_follow_conversation_map() {
    let mut pair = Pair::new(4);
    pair.connect(0, 0);
    pair.connect(1, 1);
    pair.run(25);
    pair.a.set_port_algorithm(0, LagAlgorithm::CVid);
    pair.b.set_port_algorithm(0, LagAlgorithm::CVid);
    pair.run(5);

    let frame = |vid| {
        Frame::new(
            MacAddr::broadcast(),
            MacAddr([0, 0, 0, 0, 0, 0x11]),
            ethertypes::IPV4,
            vec![0; 8],
        )
        .push_tag(VlanTag::customer(vid))
    };
    pair.a.aggregators[0].tx_trace.clear();
    pair.a.transmit_on_aggregator(0, frame(0));
    pair.a.transmit_on_aggregator(0, frame(1));
    pair.a.transmit_on_aggregator(0, frame(2));
    assert_eq!(
        pair.a.aggregators[0].tx_trace,
        vec![(0, 1), (1, 2), (2, 1)],
        "default map is cid % n over links {{1, 2}}"
    );
}

#[test]
fn test_standby_port_stays_out_until_group_reverts() {
    let mut pair = Pair::new(3);
    for p in 0..3 {
        pair.a.set_port_wtr_time(p, 5 | super::port::WTR_NON_REVERTIVE);
    }
    pair.connect(0, 0);
    pair.connect(1, 1);
    pair.connect(2, 2);
    pair.run(25);
    assert_eq!(pair.a.ports[1].mux_state, MuxState::Distributing);

    // flap ports 1 and 2: they come back armed and stand by
    pair.disconnect_a(1);
    pair.disconnect_a(2);
    pair.run(3);
    pair.connect(1, 1);
    pair.connect(2, 2);
    pair.run(30);
    assert_eq!(pair.a.ports[1].selected, Selected::Standby);
    assert_eq!(pair.a.ports[2].selected, Selected::Standby);
    assert_ne!(pair.a.ports[1].mux_state, MuxState::Distributing);

    // the last active port drops: everyone is non-revertive, the group
    // reverts and the survivors rejoin
    pair.disconnect_a(0);
    pair.run(30);
    assert_eq!(pair.a.ports[1].mux_state, MuxState::Distributing);
    assert_eq!(pair.a.ports[2].mux_state, MuxState::Distributing);
}
