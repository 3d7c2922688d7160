//! Mux machine (coupled control)
//!
//! The per-port attach/collect/distribute lifecycle. States progress
//! monotonically on a given SELECTED assertion and collapse back to
//! DETACHED the moment Selection withdraws the port.
//!
//! Attach and detach have side effects on the owning Aggregator, so the
//! step function reports them as events for the shim to apply; the
//! actor state bits are updated here.

use tracing::trace;

use lagsim_core::timers;
use lagsim_packet::LacpState;

use super::port::{AggPort, Selected};

/// Mux machine states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MuxState {
    #[default]
    Detached,
    Waiting,
    Attached,
    Collecting,
    Distributing,
}

/// Aggregator side effects of a Mux transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MuxEvent {
    /// Bind the port to its selected aggregator
    Attach,
    /// Unbind the port from its attached aggregator
    Detach,
    /// The port starts distributing; conversation maps must rebuild
    StartDistributing,
    /// The port stops distributing; conversation maps must rebuild
    StopDistributing,
}

/// Run the Mux machine to a fixed point for this tick, collecting the
/// aggregator side effects in order.
pub fn mux_step(port: &mut AggPort, events: &mut Vec<MuxEvent>) {
    // a handful of iterations reaches any reachable fixed point; the
    // coupled machine can legally fall through several states per tick
    for _ in 0..8 {
        let before = port.mux_state;
        match port.mux_state {
            MuxState::Detached => {
                if port.selected != Selected::Unselected {
                    port.wait_while.start(timers::AGGREGATE_WAIT_TIME);
                    port.mux_state = MuxState::Waiting;
                }
            }
            MuxState::Waiting => {
                if port.selected == Selected::Unselected {
                    port.wait_while.stop();
                    port.mux_state = MuxState::Detached;
                } else if port.selected == Selected::Selected && port.ready {
                    events.push(MuxEvent::Attach);
                    port.attached_aggregator = port.selected_aggregator;
                    port.last_aggregator = port.selected_aggregator;
                    port.actor_oper_state.set(LacpState::SYNCHRONIZATION, true);
                    port.ntt = true;
                    port.mux_state = MuxState::Attached;
                }
            }
            MuxState::Attached => {
                if port.selected == Selected::Unselected {
                    detach(port, events);
                } else if port.selected == Selected::Selected
                    && port.partner.state.synchronization()
                {
                    port.actor_oper_state.set(LacpState::COLLECTING, true);
                    port.ntt = true;
                    port.mux_state = MuxState::Collecting;
                }
            }
            MuxState::Collecting => {
                if port.selected == Selected::Unselected {
                    detach(port, events);
                } else if !port.partner.state.synchronization() {
                    port.actor_oper_state.set(LacpState::COLLECTING, false);
                    port.ntt = true;
                    port.mux_state = MuxState::Attached;
                } else if port.partner.state.collecting() {
                    port.actor_oper_state.set(LacpState::DISTRIBUTING, true);
                    events.push(MuxEvent::StartDistributing);
                    port.ntt = true;
                    port.mux_state = MuxState::Distributing;
                }
            }
            MuxState::Distributing => {
                if port.selected == Selected::Unselected {
                    detach(port, events);
                } else if !port.partner.state.synchronization()
                    || !port.partner.state.collecting()
                {
                    port.actor_oper_state.set(LacpState::DISTRIBUTING, false);
                    events.push(MuxEvent::StopDistributing);
                    port.ntt = true;
                    port.mux_state = MuxState::Collecting;
                }
            }
        }
        if before == port.mux_state {
            break;
        }
        trace!(
            port = port.port_number,
            from = ?before,
            to = ?port.mux_state,
            "mux transition"
        );
    }
}

fn detach(port: &mut AggPort, events: &mut Vec<MuxEvent>) {
    if port.actor_oper_state.distributing() {
        events.push(MuxEvent::StopDistributing);
    }
    events.push(MuxEvent::Detach);
    port.attached_aggregator = None;
    port.actor_oper_state.set(LacpState::SYNCHRONIZATION, false);
    port.actor_oper_state.set(LacpState::COLLECTING, false);
    port.actor_oper_state.set(LacpState::DISTRIBUTING, false);
    port.ntt = true;
    port.mux_state = MuxState::Detached;
}

#[cfg(test)]
mod tests {
    use super::*;
    use lagsim_core::{MacAddr, SystemId};

    fn waiting_port() -> AggPort {
        let system = SystemId::new(0x8000, MacAddr([0, 0, 0, 0, 0, 1]));
        let mut port = AggPort::new(0, system, 100);
        port.set_port_enabled(true);
        port.selected = Selected::Selected;
        port.selected_aggregator = Some(0);
        port
    }

    fn run(port: &mut AggPort) -> Vec<MuxEvent> {
        let mut events = Vec::new();
        mux_step(port, &mut events);
        events
    }

    #[test]
    fn test_detached_to_waiting_starts_wait_while() {
        let mut port = waiting_port();
        run(&mut port);
        assert_eq!(port.mux_state, MuxState::Waiting);
        assert!(port.wait_while.running());
    }

    #[test]
    fn test_waiting_holds_until_ready() {
        let mut port = waiting_port();
        run(&mut port);
        for _ in 0..lagsim_core::timers::AGGREGATE_WAIT_TIME {
            port.tick_timers();
        }
        assert!(port.ready_n());

        // group-wide ready not yet granted by Selection
        run(&mut port);
        assert_eq!(port.mux_state, MuxState::Waiting);

        port.ready = true;
        let events = run(&mut port);
        assert_eq!(port.mux_state, MuxState::Attached);
        assert_eq!(events, vec![MuxEvent::Attach]);
        assert_eq!(port.attached_aggregator, Some(0));
        assert!(port.actor_oper_state.synchronization());
    }

    #[test]
    fn test_standby_never_attaches() {
        let mut port = waiting_port();
        port.selected = Selected::Standby;
        run(&mut port);
        for _ in 0..lagsim_core::timers::AGGREGATE_WAIT_TIME {
            port.tick_timers();
        }
        port.ready = true;
        run(&mut port);
        assert_eq!(port.mux_state, MuxState::Waiting);
    }

    #[test]
    fn test_full_progression_and_fallback() {
        let mut port = waiting_port();
        run(&mut port);
        for _ in 0..lagsim_core::timers::AGGREGATE_WAIT_TIME {
            port.tick_timers();
        }
        port.ready = true;
        run(&mut port);

        // partner syncs: collect in the same tick
        port.partner.state.set(LacpState::SYNCHRONIZATION, true);
        run(&mut port);
        assert_eq!(port.mux_state, MuxState::Collecting);
        assert!(port.actor_oper_state.collecting());

        // partner collects: distribute
        port.partner.state.set(LacpState::COLLECTING, true);
        let events = run(&mut port);
        assert_eq!(port.mux_state, MuxState::Distributing);
        assert_eq!(events, vec![MuxEvent::StartDistributing]);

        // partner loses sync: drop straight back to Attached
        port.partner.state.set(LacpState::SYNCHRONIZATION, false);
        let events = run(&mut port);
        assert_eq!(port.mux_state, MuxState::Attached);
        assert_eq!(
            events,
            vec![MuxEvent::StopDistributing],
            "collecting clears without an aggregator event"
        );
        assert!(!port.actor_oper_state.distributing());
        assert!(!port.actor_oper_state.collecting());
    }

    #[test]
    fn test_unselect_detaches_from_any_state() {
        let mut port = waiting_port();
        run(&mut port);
        for _ in 0..lagsim_core::timers::AGGREGATE_WAIT_TIME {
            port.tick_timers();
        }
        port.ready = true;
        port.partner.state.set(LacpState::SYNCHRONIZATION, true);
        port.partner.state.set(LacpState::COLLECTING, true);
        run(&mut port);
        assert_eq!(port.mux_state, MuxState::Distributing);

        port.selected = Selected::Unselected;
        let events = run(&mut port);
        assert_eq!(port.mux_state, MuxState::Detached);
        assert_eq!(events, vec![MuxEvent::StopDistributing, MuxEvent::Detach]);
        assert!(port.ntt);
        assert_eq!(port.attached_aggregator, None);
    }
}
