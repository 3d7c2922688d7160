//! Selection Logic
//!
//! Runs once per tick per shim, after every port's Receive machine.
//! Groups ports by LAGID and binds each group to an Aggregator.
//!
//! Selection is edge-triggered: it acts only on groups holding at least
//! one UNSELECTED port, so an established LAG keeps its aggregator when
//! members leave. When a group does (re)select, its home is the
//! aggregator indexed by its lowest member port, so a lower-numbered
//! port joining an existing LAG migrates the whole group, and a port
//! whose LAGID changed commandeers its preferred aggregator, evicting
//! any different-LAGID squatters.
//!
//! Determinism: groups are processed in order of their lowest port
//! index, and the free-aggregator fallback scans ascending indices.

use tracing::{debug, warn};

use lagsim_core::{LagId, SystemId};

use super::aggregator::Aggregator;
use super::mux::MuxState;
use super::port::{AggPort, Selected};

/// Run the Selection Logic to a per-tick fixed point
pub fn run_selection(ports: &mut [AggPort], aggregators: &mut [Aggregator]) {
    let mut settled = false;
    for _ in 0..8 {
        if selection_pass(ports, aggregators) {
            settled = true;
            break;
        }
    }
    if !settled {
        warn!("selection did not settle within the per-tick iteration bound");
    }
    compute_ready(ports);
}

/// One pass; returns true when nothing changed
fn selection_pass(ports: &mut [AggPort], aggregators: &mut [Aggregator]) -> bool {
    let mut changed = false;

    // ports without carrier or without LACP take no part
    for port in ports.iter_mut() {
        if !port.port_enabled || !port.lacp_enabled {
            if port.selected != Selected::Unselected || port.selected_aggregator.is_some() {
                changed = true;
            }
            port.selected = Selected::Unselected;
            port.selected_aggregator = None;
        }
        // a standby port whose arming was released joins for real
        if port.selected == Selected::Standby && !port.non_revertive {
            port.selected = Selected::Selected;
            changed = true;
        }
    }

    let groups = group_by_lagid(ports);
    let mut claimed: Vec<bool> = vec![false; aggregators.len()];

    for (lagid, members) in &groups {
        if members
            .iter()
            .all(|&m| ports[m].selected != Selected::Unselected)
        {
            // nothing to (re)select; the group keeps what it has
            continue;
        }
        let lead = members[0];
        let key = ports[lead].actor_oper_key;
        // a group of armed non-revertive ports never commandeers
        let blocked = members.iter().all(|&m| ports[m].non_revertive);

        // the group's home: the aggregator indexed by its lowest member
        let mut chosen: Option<usize> = None;
        if lead < aggregators.len() {
            let agg = &aggregators[lead];
            let foreign_holder = ports.iter().enumerate().any(|(qi, q)| {
                !members.contains(&qi)
                    && (q.selected_aggregator == Some(lead) || q.attached_aggregator == Some(lead))
            });
            if agg.enabled && agg.oper_key == key && !claimed[lead] && !(blocked && foreign_holder)
            {
                chosen = Some(lead);
            }
        }
        // fallback: lowest-index enabled aggregator with a matching key
        // that is free or already holds only members of this group
        if chosen.is_none() {
            chosen = (0..aggregators.len()).find(|&ai| {
                !claimed[ai]
                    && aggregators[ai].enabled
                    && aggregators[ai].oper_key == key
                    && ports.iter().enumerate().all(|(qi, q)| {
                        members.contains(&qi)
                            || (q.selected_aggregator != Some(ai)
                                && q.attached_aggregator != Some(ai))
                    })
            });
        }

        let Some(ai) = chosen else {
            // aggregator starvation: the unselected members stay out;
            // members already selected elsewhere are left alone
            for &m in members {
                let port = &mut ports[m];
                if port.selected == Selected::Unselected && port.selected_aggregator.is_some() {
                    changed = true;
                }
                if port.selected == Selected::Unselected {
                    debug!(port = port.port_number, "no aggregator available");
                    port.selected_aggregator = None;
                }
            }
            continue;
        };

        // evict a different LAG squatting on this group's home
        for (qi, squatter) in ports.iter_mut().enumerate() {
            if members.contains(&qi) {
                continue;
            }
            if squatter.selected_aggregator == Some(ai) || squatter.attached_aggregator == Some(ai)
            {
                debug!(
                    port = squatter.port_number,
                    aggregator = ai,
                    "evicted for a preferred group"
                );
                squatter.selected = Selected::Unselected;
                squatter.selected_aggregator = None;
                changed = true;
            }
        }

        claimed[ai] = true;
        let agg = &mut aggregators[ai];
        agg.lag_id = Some(*lagid);
        agg.partner_system = lagid.partner_system;
        agg.partner_key = lagid.partner_key;

        for &m in members {
            let port = &mut ports[m];
            // a port still attached elsewhere detaches before it follows
            // the group
            if port.attached_aggregator.is_some() && port.attached_aggregator != Some(ai) {
                if port.selected != Selected::Unselected {
                    changed = true;
                }
                port.selected = Selected::Unselected;
                port.selected_aggregator = None;
                continue;
            }
            let want = if port.non_revertive {
                Selected::Standby
            } else {
                Selected::Selected
            };
            if port.selected != want || port.selected_aggregator != Some(ai) {
                changed = true;
            }
            port.selected = want;
            port.selected_aggregator = Some(ai);
        }
    }

    // aggregators nobody selects or attaches to fall free
    for (ai, agg) in aggregators.iter_mut().enumerate() {
        if agg.lag_id.is_some()
            && agg.attached_ports.is_empty()
            && ports
                .iter()
                .all(|p| p.selected_aggregator != Some(ai))
        {
            agg.lag_id = None;
            agg.partner_system = SystemId::default();
            agg.partner_key = 0;
        }
    }

    if release_non_revertive(ports, aggregators.len()) {
        changed = true;
    }

    !changed
}

/// When every port associated with an aggregator has armed
/// non-revertive wait-to-restore, the stand-off is pointless: all
/// revert together, and ports whose link is still down re-arm.
///
/// Membership is judged by the last attachment, not the current
/// selection: a freshly restored port passes through a solitary
/// defaulted window, and counting that one-port group would release it
/// the moment it reappeared.
fn release_non_revertive(ports: &mut [AggPort], aggregator_count: usize) -> bool {
    let mut changed = false;
    for ai in 0..aggregator_count {
        let assoc: Vec<usize> = ports
            .iter()
            .enumerate()
            .filter(|(_, p)| p.last_aggregator == Some(ai))
            .map(|(i, _)| i)
            .collect();
        if assoc.is_empty() || !assoc.iter().all(|&i| ports[i].non_revertive) {
            continue;
        }
        for &i in &assoc {
            let port = &mut ports[i];
            port.non_revertive = !port.port_enabled;
            debug!(
                port = port.port_number,
                rearmed = port.non_revertive,
                "non-revertive group released"
            );
        }
        changed = true;
    }
    changed
}

fn group_by_lagid(ports: &[AggPort]) -> Vec<(LagId, Vec<usize>)> {
    let mut groups: Vec<(LagId, Vec<usize>)> = Vec::new();
    for (i, port) in ports.iter().enumerate() {
        if !port.port_enabled || !port.lacp_enabled {
            continue;
        }
        let id = port.lag_id();
        match groups.iter_mut().find(|(g, _)| *g == id) {
            Some((_, members)) => members.push(i),
            None => groups.push((id, vec![i])),
        }
    }
    // members are in ascending index order by construction; order the
    // groups the same way
    groups.sort_by_key(|(_, members)| members[0]);
    groups
}

/// Group-wide ready: every waiting selected port of a group has its
/// wait-while (and wait-to-restore) expired
fn compute_ready(ports: &mut [AggPort]) {
    let groups = group_by_lagid(ports);
    for port in ports.iter_mut() {
        port.ready = false;
    }
    for (_, members) in &groups {
        let waiting: Vec<usize> = members
            .iter()
            .copied()
            .filter(|&m| {
                ports[m].mux_state == MuxState::Waiting && ports[m].selected == Selected::Selected
            })
            .collect();
        if waiting.is_empty() {
            continue;
        }
        let all_ready = waiting.iter().all(|&m| ports[m].ready_n());
        for &m in &waiting {
            ports[m].ready = all_ready;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lagsim_core::{MacAddr, PortId, SystemId};
    use lagsim_packet::{LacpState, PortInfo};

    fn shim_parts(n: usize) -> (Vec<AggPort>, Vec<Aggregator>) {
        let system = SystemId::new(0x8000, MacAddr([0, 0, 0, 0, 0, 1]));
        let ports = (0..n)
            .map(|i| {
                let mut p = AggPort::new(i, system, 100 + i as u16);
                p.set_port_enabled(true);
                p.rx_step(None);
                p
            })
            .collect();
        let aggregators = (0..n)
            .map(|i| {
                Aggregator::new(
                    i,
                    system,
                    200 + i as u16,
                    super::super::port::DEFAULT_ACTOR_KEY,
                )
            })
            .collect();
        (ports, aggregators)
    }

    fn learn_partner(port: &mut AggPort, partner_port: u16) {
        let partner_system = SystemId::new(0x8000, MacAddr([0, 0, 0, 0, 0, 2]));
        let actor = PortInfo {
            system: partner_system,
            key: super::super::port::DEFAULT_ACTOR_KEY,
            port: PortId::new(0x100, partner_port),
            state: LacpState::new(
                LacpState::ACTIVITY | LacpState::TIMEOUT | LacpState::AGGREGATION,
            ),
        };
        let pdu = lagsim_packet::Lacpdu::v1(actor, port.actor_info());
        port.rx_step(Some(&pdu));
    }

    #[test]
    fn test_solitary_ports_select_own_aggregator() {
        let (mut ports, mut aggs) = shim_parts(3);
        run_selection(&mut ports, &mut aggs);
        assert_eq!(ports[0].selected_aggregator, Some(0));
        assert_eq!(ports[1].selected_aggregator, Some(1));
        assert_eq!(ports[2].selected_aggregator, Some(2));
        assert!(ports.iter().all(|p| p.selected == Selected::Selected));
    }

    #[test]
    fn test_same_partner_ports_share_lowest_aggregator() {
        let (mut ports, mut aggs) = shim_parts(3);
        for (i, port) in ports.iter_mut().enumerate() {
            learn_partner(port, 100 + i as u16);
        }
        run_selection(&mut ports, &mut aggs);
        assert!(ports.iter().all(|p| p.selected_aggregator == Some(0)));
        assert_eq!(aggs[0].lag_id, Some(ports[0].lag_id()));
    }

    #[test]
    fn test_preferred_aggregator_of_lowest_member() {
        let (mut ports, mut aggs) = shim_parts(4);
        ports[0].set_port_enabled(false);
        for i in 1..4 {
            learn_partner(&mut ports[i], 100 + i as u16);
        }
        run_selection(&mut ports, &mut aggs);
        // lowest live member is port index 1, so aggregator 1 hosts the LAG
        for i in 1..4 {
            assert_eq!(ports[i].selected_aggregator, Some(1));
        }
        assert_eq!(ports[0].selected, Selected::Unselected);
    }

    #[test]
    fn test_survivors_keep_aggregator_when_lowest_leaves() {
        let (mut ports, mut aggs) = shim_parts(3);
        for (i, port) in ports.iter_mut().enumerate() {
            learn_partner(port, 100 + i as u16);
        }
        run_selection(&mut ports, &mut aggs);
        assert!(ports.iter().all(|p| p.selected_aggregator == Some(0)));

        ports[0].set_port_enabled(false);
        run_selection(&mut ports, &mut aggs);
        // no member is unselected, so the survivors stay put
        assert_eq!(ports[1].selected_aggregator, Some(0));
        assert_eq!(ports[2].selected_aggregator, Some(0));
    }

    #[test]
    fn test_lower_port_joining_migrates_the_group() {
        let (mut ports, mut aggs) = shim_parts(3);
        ports[0].set_port_enabled(false);
        learn_partner(&mut ports[1], 101);
        learn_partner(&mut ports[2], 102);
        run_selection(&mut ports, &mut aggs);
        assert_eq!(ports[1].selected_aggregator, Some(1));

        // the lower port comes up into the same LAG: everyone moves to
        // its preferred aggregator
        ports[0].set_port_enabled(true);
        learn_partner(&mut ports[0], 100);
        run_selection(&mut ports, &mut aggs);
        assert!(ports.iter().all(|p| p.selected_aggregator == Some(0)));
    }

    #[test]
    fn test_new_lag_commandeers_preferred_aggregator() {
        let (mut ports, mut aggs) = shim_parts(3);
        // ports 1 and 2 hold aggregator 1 as one LAG
        learn_partner(&mut ports[1], 101);
        learn_partner(&mut ports[2], 102);
        run_selection(&mut ports, &mut aggs);
        assert_eq!(ports[1].selected_aggregator, Some(1));
        assert_eq!(ports[2].selected_aggregator, Some(1));

        // port 1 learns a partner from a different system: new LAGID,
        // same preferred aggregator
        let other_system = SystemId::new(0x8000, MacAddr([0, 0, 0, 0, 0, 9]));
        let actor = PortInfo {
            system: other_system,
            key: super::super::port::DEFAULT_ACTOR_KEY,
            port: PortId::new(0x100, 100),
            state: LacpState::new(
                LacpState::ACTIVITY | LacpState::TIMEOUT | LacpState::AGGREGATION,
            ),
        };
        let pdu = lagsim_packet::Lacpdu::v1(actor, ports[1].actor_info());
        ports[1].rx_step(Some(&pdu));

        run_selection(&mut ports, &mut aggs);
        assert_eq!(ports[1].selected_aggregator, Some(1), "kept its preferred");
        // the evicted LAG re-homed on its own preferred
        assert_eq!(ports[2].selected_aggregator, Some(2));
    }

    #[test]
    fn test_key_mismatch_starves() {
        let (mut ports, mut aggs) = shim_parts(2);
        ports[1].actor_admin_key = 0x0999;
        ports[1].actor_oper_key = 0x0999;
        run_selection(&mut ports, &mut aggs);
        assert_eq!(ports[1].selected, Selected::Unselected);
        assert_eq!(ports[1].selected_aggregator, None);

        // giving one aggregator the key resolves the starvation
        aggs[1].admin_key = 0x0999;
        aggs[1].oper_key = 0x0999;
        run_selection(&mut ports, &mut aggs);
        assert_eq!(ports[1].selected_aggregator, Some(1));
    }

    #[test]
    fn test_disabled_aggregator_not_chosen() {
        let (mut ports, mut aggs) = shim_parts(1);
        aggs[0].enabled = false;
        run_selection(&mut ports, &mut aggs);
        assert_eq!(ports[0].selected, Selected::Unselected);
    }

    #[test]
    fn test_dual_homing_starvation() {
        let (mut ports, mut aggs) = shim_parts(2);
        // both ports share one key, but only aggregator 0 carries it
        aggs[1].enabled = false;
        learn_partner(&mut ports[0], 100);
        run_selection(&mut ports, &mut aggs);
        assert_eq!(ports[0].selected_aggregator, Some(0));

        // port 1 talks to a different partner: different LAGID, and the
        // only matching aggregator belongs to the other LAG
        let other_system = SystemId::new(0x8000, MacAddr([0, 0, 0, 0, 0, 9]));
        let actor = PortInfo {
            system: other_system,
            key: super::super::port::DEFAULT_ACTOR_KEY,
            port: PortId::new(0x100, 100),
            state: LacpState::new(
                LacpState::ACTIVITY | LacpState::TIMEOUT | LacpState::AGGREGATION,
            ),
        };
        let pdu = lagsim_packet::Lacpdu::v1(actor, ports[1].actor_info());
        ports[1].rx_step(Some(&pdu));
        run_selection(&mut ports, &mut aggs);
        assert_eq!(ports[1].selected, Selected::Unselected, "starved, not an error");
        assert_eq!(ports[0].selected_aggregator, Some(0), "holder undisturbed");
    }

    #[test]
    fn test_group_ready_waits_for_all_members() {
        let (mut ports, mut aggs) = shim_parts(2);
        for (i, port) in ports.iter_mut().enumerate() {
            learn_partner(port, 100 + i as u16);
        }
        run_selection(&mut ports, &mut aggs);
        let mut events = Vec::new();
        super::super::mux::mux_step(&mut ports[0], &mut events);
        super::super::mux::mux_step(&mut ports[1], &mut events);
        assert!(ports.iter().all(|p| p.mux_state == MuxState::Waiting));

        // only port 0's wait-while has expired
        for _ in 0..lagsim_core::timers::AGGREGATE_WAIT_TIME {
            ports[0].tick_timers();
        }
        run_selection(&mut ports, &mut aggs);
        assert!(!ports[0].ready, "one member still waiting holds the group");

        for _ in 0..lagsim_core::timers::AGGREGATE_WAIT_TIME {
            ports[1].tick_timers();
        }
        run_selection(&mut ports, &mut aggs);
        assert!(ports[0].ready && ports[1].ready);
    }

    #[test]
    fn test_non_revertive_standby_and_release() {
        let (mut ports, mut aggs) = shim_parts(2);
        for (i, port) in ports.iter_mut().enumerate() {
            learn_partner(port, 100 + i as u16);
            port.wtr_time = 30 | super::super::port::WTR_NON_REVERTIVE;
        }
        run_selection(&mut ports, &mut aggs);
        ports[0].last_aggregator = Some(0);
        ports[1].last_aggregator = Some(0);

        // port 1 flaps: armed, comes back as standby
        ports[1].set_port_enabled(false);
        run_selection(&mut ports, &mut aggs);
        ports[1].set_port_enabled(true);
        learn_partner(&mut ports[1], 101);
        run_selection(&mut ports, &mut aggs);
        assert_eq!(ports[1].selected, Selected::Standby);

        // the remaining active port drops too: everyone is non-revertive,
        // so all revert, and the still-down port re-arms
        ports[0].set_port_enabled(false);
        run_selection(&mut ports, &mut aggs);
        assert!(!ports[1].non_revertive);
        assert_eq!(ports[1].selected, Selected::Selected);
        assert!(ports[0].non_revertive, "down port re-armed");
    }
}
