//! Aggregation Port
//!
//! One AggPort is one LACP port: the actor/partner operational state,
//! the Receive and Periodic Transmit machines, the transmit rate
//! limiter, and the wait-to-restore bookkeeping. The Mux machine lives
//! in [`super::mux`] and the Selection Logic in [`super::selection`];
//! both operate on this struct.

use tracing::{debug, trace};

use lagsim_core::types::protocol_constants::SLOW_PROTOCOLS_DA;
use lagsim_core::{timers, LagId, LinkNumber, MacAddr, SystemId, Timer};
use lagsim_packet::{Lacpdu, LacpState, PortInfo};

use super::mux::MuxState;

/// Default administrative key shared by the ports and aggregators of a
/// freshly built shim
pub const DEFAULT_ACTOR_KEY: u16 = 0x0101;

/// Non-revertive flag in the 16-bit wait-to-restore admin value
pub const WTR_NON_REVERTIVE: u16 = 0x8000;

/// Receive machine states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RxState {
    #[default]
    Initialize,
    PortDisabled,
    Expired,
    LacpDisabled,
    Defaulted,
    Current,
}

/// Periodic Transmit machine states (the transient PERIODIC_TX state is
/// folded into the expiry action)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PeriodicState {
    #[default]
    NoPeriodic,
    Fast,
    Slow,
}

/// Selection result for a port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Selected {
    #[default]
    Unselected,
    Selected,
    Standby,
}

/// One LACP port
#[derive(Debug)]
pub struct AggPort {
    /// Arena index within the owning shim
    pub index: usize,
    /// Port number carried in LACPDUs (first port of a shim is 100)
    pub port_number: u16,
    pub port_priority: u16,

    // administrative
    pub actor_admin_system: SystemId,
    pub actor_admin_key: u16,
    pub actor_admin_state: LacpState,
    pub admin_link_number: LinkNumber,
    /// Wait-to-restore time in ticks; bit 15 selects non-revertive mode
    pub wtr_time: u16,
    pub protocol_da: MacAddr,
    pub lacp_version: u8,

    // operational (the DR overwrites system/key/link while paired)
    pub actor_oper_system: SystemId,
    pub actor_oper_key: u16,
    pub actor_oper_state: LacpState,
    pub oper_link_number: LinkNumber,
    pub partner: PortInfo,
    pub partner_link_number: LinkNumber,

    // machine state
    pub port_enabled: bool,
    pub lacp_enabled: bool,
    pub rx_state: RxState,
    pub periodic_state: PeriodicState,
    pub mux_state: MuxState,
    pub selected: Selected,
    /// Aggregator chosen by Selection (may not be attached yet)
    pub selected_aggregator: Option<usize>,
    /// Aggregator the Mux machine is attached to
    pub attached_aggregator: Option<usize>,
    /// Most recent aggregator association, persisting through carrier
    /// loss; scopes the non-revertive release rule
    pub last_aggregator: Option<usize>,
    /// Group-wide ready flag, set by Selection
    pub ready: bool,
    pub ntt: bool,
    /// Armed non-revertive wait-to-restore
    pub non_revertive: bool,

    // timers
    pub current_while: Timer,
    pub periodic_timer: Timer,
    pub wait_while: Timer,
    pub wtr_timer: Timer,
    tx_window: Timer,
    tx_count: u32,
}

impl AggPort {
    pub fn new(index: usize, system: SystemId, port_number: u16) -> Self {
        let admin_state = LacpState::default()
            .with(LacpState::ACTIVITY, true)
            .with(LacpState::TIMEOUT, true)
            .with(LacpState::AGGREGATION, true);
        let mut port = Self {
            index,
            port_number,
            port_priority: 0x100,
            actor_admin_system: system,
            actor_admin_key: DEFAULT_ACTOR_KEY,
            actor_admin_state: admin_state,
            admin_link_number: index as u16 + 1,
            wtr_time: 0,
            protocol_da: SLOW_PROTOCOLS_DA,
            lacp_version: 2,
            actor_oper_system: system,
            actor_oper_key: DEFAULT_ACTOR_KEY,
            actor_oper_state: admin_state,
            oper_link_number: index as u16 + 1,
            partner: PortInfo::default(),
            partner_link_number: 0,
            port_enabled: false,
            lacp_enabled: true,
            rx_state: RxState::Initialize,
            periodic_state: PeriodicState::NoPeriodic,
            mux_state: MuxState::Detached,
            selected: Selected::Unselected,
            selected_aggregator: None,
            attached_aggregator: None,
            last_aggregator: None,
            ready: false,
            ntt: false,
            non_revertive: false,
            current_while: Timer::stopped(),
            periodic_timer: Timer::stopped(),
            wait_while: Timer::stopped(),
            wtr_timer: Timer::stopped(),
            tx_window: Timer::stopped(),
            tx_count: 0,
        };
        port.record_default();
        port
    }

    /// Advance every timer owned by this port by one tick
    pub fn tick_timers(&mut self) {
        self.current_while.tick();
        self.periodic_timer.tick();
        self.wait_while.tick();
        self.wtr_timer.tick();
        self.tx_window.tick();
    }

    /// Carrier change from the underlying MAC
    pub fn set_port_enabled(&mut self, enabled: bool) {
        if self.port_enabled == enabled {
            return;
        }
        self.port_enabled = enabled;
        if enabled {
            let wtr = self.wtr_time & !WTR_NON_REVERTIVE;
            if wtr > 0 {
                self.wtr_timer.start(u32::from(wtr));
            }
            debug!(port = self.port_number, "carrier up");
        } else {
            if self.wtr_time & WTR_NON_REVERTIVE != 0 {
                self.non_revertive = true;
            }
            self.wtr_timer.stop();
            self.selected = Selected::Unselected;
            debug!(port = self.port_number, "carrier down");
        }
    }

    /// The LAGID this port belongs to, given its current partner view.
    /// A defaulted partner keeps the port solitary.
    pub fn lag_id(&self) -> LagId {
        if self.actor_oper_state.defaulted() {
            return LagId::solitary(self.actor_oper_system, self.actor_oper_key, self.port_number);
        }
        let individual =
            !self.actor_oper_state.aggregation() || !self.partner.state.aggregation();
        LagId {
            actor_system: self.actor_oper_system,
            actor_key: self.actor_oper_key,
            actor_port: if individual { self.port_number } else { 0 },
            partner_system: self.partner.system,
            partner_key: self.partner.key,
            partner_port: if individual { self.partner.port.number } else { 0 },
        }
    }

    /// ready_n: true while the port is waiting with its wait-while (and
    /// any wait-to-restore) expired
    pub fn ready_n(&self) -> bool {
        self.mux_state == MuxState::Waiting
            && !self.wait_while.running()
            && !self.wtr_timer.running()
    }

    /// Actor information set as carried in LACPDUs
    pub fn actor_info(&self) -> PortInfo {
        PortInfo {
            system: self.actor_oper_system,
            key: self.actor_oper_key,
            port: lagsim_core::PortId::new(self.port_priority, self.port_number),
            state: self.actor_oper_state,
        }
    }

    // ---- Receive machine ----------------------------------------------

    /// One Receive machine pass. `pdu` is a LACPDU that arrived this
    /// tick, if any; timer-driven transitions run on every call.
    pub fn rx_step(&mut self, pdu: Option<&Lacpdu>) {
        // carrier loss dominates everything but re-initialization
        if !self.port_enabled && self.rx_state != RxState::Initialize {
            self.enter_port_disabled();
        }

        let before = self.rx_state;
        match self.rx_state {
            RxState::Initialize => {
                self.selected = Selected::Unselected;
                self.record_default();
                self.actor_oper_state.set(LacpState::EXPIRED, false);
                self.enter_port_disabled();
                // evaluate PortDisabled exits on the same pass
                self.rx_step(pdu);
                return;
            }
            RxState::PortDisabled => {
                if self.port_enabled && self.lacp_enabled {
                    self.enter_expired();
                } else if self.port_enabled {
                    self.enter_lacp_disabled();
                }
            }
            RxState::Expired => {
                if let Some(pdu) = pdu {
                    self.enter_current(pdu);
                } else if self.current_while.expired() {
                    self.enter_defaulted();
                }
            }
            RxState::Defaulted => {
                if let Some(pdu) = pdu {
                    self.enter_current(pdu);
                }
            }
            RxState::LacpDisabled => {
                if self.lacp_enabled {
                    self.enter_port_disabled();
                }
            }
            RxState::Current => {
                if let Some(pdu) = pdu {
                    self.enter_current(pdu);
                } else if self.current_while.expired() {
                    self.enter_expired();
                }
            }
        }
        if before != self.rx_state {
            trace!(
                port = self.port_number,
                from = ?before,
                to = ?self.rx_state,
                "rx transition"
            );
        }
    }

    fn enter_port_disabled(&mut self) {
        self.partner.state.set(LacpState::SYNCHRONIZATION, false);
        self.rx_state = RxState::PortDisabled;
    }

    fn enter_expired(&mut self) {
        self.partner.state.set(LacpState::SYNCHRONIZATION, false);
        self.partner.state.set(LacpState::TIMEOUT, true);
        self.actor_oper_state.set(LacpState::EXPIRED, true);
        self.current_while.start(timers::SHORT_TIMEOUT_TIME);
        self.rx_state = RxState::Expired;
    }

    fn enter_lacp_disabled(&mut self) {
        self.selected = Selected::Unselected;
        self.record_default();
        self.partner.state.set(LacpState::AGGREGATION, false);
        self.actor_oper_state.set(LacpState::EXPIRED, false);
        self.rx_state = RxState::LacpDisabled;
    }

    fn enter_defaulted(&mut self) {
        // a defaulted partner changes the LAGID, so reselect
        self.selected = Selected::Unselected;
        self.record_default();
        self.actor_oper_state.set(LacpState::EXPIRED, false);
        self.rx_state = RxState::Defaulted;
        debug!(port = self.port_number, "partner defaulted");
    }

    fn enter_current(&mut self, pdu: &Lacpdu) {
        self.update_selected(pdu);
        self.update_ntt(pdu);
        self.record_pdu(pdu);
        let timeout = if pdu.actor.state.timeout() {
            timers::SHORT_TIMEOUT_TIME
        } else {
            timers::LONG_TIMEOUT_TIME
        };
        self.current_while.start(timeout);
        self.actor_oper_state.set(LacpState::EXPIRED, false);
        self.actor_oper_state.set(LacpState::DEFAULTED, false);
        self.rx_state = RxState::Current;
    }

    /// A changed partner LAGID invalidates the current selection
    fn update_selected(&mut self, pdu: &Lacpdu) {
        let p = &pdu.actor;
        if p.system != self.partner.system
            || p.key != self.partner.key
            || p.port.number != self.partner.port.number
            || p.state.aggregation() != self.partner.state.aggregation()
        {
            if self.selected == Selected::Selected {
                debug!(port = self.port_number, "partner LAGID changed, unselecting");
            }
            self.selected = Selected::Unselected;
        }
    }

    /// Transmit when the partner's view of us is stale
    fn update_ntt(&mut self, pdu: &Lacpdu) {
        let view = &pdu.partner;
        let relevant = LacpState::ACTIVITY
            | LacpState::TIMEOUT
            | LacpState::AGGREGATION
            | LacpState::SYNCHRONIZATION
            | LacpState::COLLECTING
            | LacpState::DISTRIBUTING;
        if view.system != self.actor_oper_system
            || view.key != self.actor_oper_key
            || view.port.number != self.port_number
            || view.state.0 & relevant != self.actor_oper_state.0 & relevant
        {
            self.ntt = true;
        }
    }

    fn record_pdu(&mut self, pdu: &Lacpdu) {
        self.partner = pdu.actor;
        self.partner_link_number = pdu.admin_link_number.unwrap_or(0);
        self.actor_oper_state.set(LacpState::DEFAULTED, false);
    }

    /// Install the administrative default partner: unknown system, the
    /// port alone in its LAG, and a partner assumed in sync so a
    /// partner-less port can still carry traffic.
    fn record_default(&mut self) {
        self.partner = PortInfo {
            system: SystemId::default(),
            key: 0,
            port: lagsim_core::PortId::new(0, self.port_number),
            state: LacpState::default()
                .with(LacpState::TIMEOUT, true)
                .with(LacpState::AGGREGATION, true)
                .with(LacpState::SYNCHRONIZATION, true)
                .with(LacpState::COLLECTING, true)
                .with(LacpState::DISTRIBUTING, true),
        };
        self.partner_link_number = 0;
        // any adopted link number lapses with the partner
        self.oper_link_number = self.admin_link_number;
        self.actor_oper_state.set(LacpState::DEFAULTED, true);
    }

    // ---- Periodic Transmit machine -------------------------------------

    pub fn periodic_step(&mut self) {
        let active = self.port_enabled
            && self.lacp_enabled
            && (self.actor_oper_state.activity() || self.partner.state.activity());
        if !active {
            self.periodic_state = PeriodicState::NoPeriodic;
            self.periodic_timer.stop();
            return;
        }

        // the partner's Timeout bit chooses our rate
        let (want, interval) = if self.partner.state.timeout() {
            (PeriodicState::Fast, timers::FAST_PERIODIC_TIME)
        } else {
            (PeriodicState::Slow, timers::SLOW_PERIODIC_TIME)
        };
        if self.periodic_state != want {
            self.periodic_state = want;
            self.periodic_timer.start(interval);
        }
        if self.periodic_timer.expired() {
            self.ntt = true;
            self.periodic_timer.start(interval);
        }
    }

    // ---- Transmit rate limiter -----------------------------------------

    /// True when an LACPDU may leave this tick; accounts one transmission.
    /// At most `TX_LIMIT` PDUs leave per fast-periodic interval.
    pub fn tx_permit(&mut self) -> bool {
        if !self.tx_window.running() {
            self.tx_window.start(timers::FAST_PERIODIC_TIME);
            self.tx_count = 0;
        }
        if self.tx_count < timers::TX_LIMIT {
            self.tx_count += 1;
            true
        } else {
            false
        }
    }

    /// Reset operational values to administrative ones (DR release or
    /// shim reset)
    pub fn restore_admin_identity(&mut self) {
        self.actor_oper_system = self.actor_admin_system;
        self.actor_oper_key = self.actor_admin_key;
        self.oper_link_number = self.admin_link_number;
    }
}
