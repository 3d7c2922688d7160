//! Devices and their client components
//!
//! A Device owns its MACs, one Link Aggregation shim (an AggPort and an
//! Aggregator per MAC), and at most one client component: a Bridge that
//! floods frames between its ports, or an End Station that generates and
//! collects test frames. Both clients talk to the world through ISS
//! handles only: an aggregator, or a Distributed Relay when one
//! virtualizes the aggregator a port is bound to.

use lagsim_core::{ethertypes, Frame, Iss, MacAddr, SystemId, VlanTag};
use lagsim_protocols::drcp::{DrAction, DrConfig, FrameOrigin};
use lagsim_protocols::lacp::LinkAgg;

/// What a bridge port (or the end-station port) is wired to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortBinding {
    /// The aggregator of the same index
    Aggregator,
    /// The Distributed Relay virtualizing that aggregator
    Relay,
    /// Not wired (MACs consumed by DRNI ports or IPPs)
    Detached,
}

/// Flood relay between bridge ports; no learning, no filtering
#[derive(Debug)]
pub struct Bridge {
    pub bindings: Vec<PortBinding>,
}

impl Bridge {
    fn new(ports: usize) -> Self {
        Self {
            bindings: vec![PortBinding::Aggregator; ports],
        }
    }
}

/// Test-frame source and sink bound to one aggregator
#[derive(Debug)]
pub struct EndStation {
    pub binding: PortBinding,
    pub received: Vec<Frame>,
    pending: Vec<Frame>,
}

impl EndStation {
    fn new() -> Self {
        Self {
            binding: PortBinding::Aggregator,
            received: Vec::new(),
            pending: Vec::new(),
        }
    }

    /// Queue a test frame, optionally C-tagged, for the next relay phase
    pub fn generate_test_frame(&mut self, src: MacAddr, dst: MacAddr, vid: Option<u16>) {
        let mut frame = Frame::new(dst, src, ethertypes::IPV4, vec![0u8; 46]);
        if let Some(vid) = vid {
            frame = frame.push_tag(VlanTag::customer(vid));
        }
        self.pending.push(frame);
    }
}

/// One simulated box
#[derive(Debug)]
pub struct Device {
    pub index: usize,
    pub system: SystemId,
    pub macs: Vec<crate::mac::Mac>,
    pub lag: LinkAgg,
    pub bridge: Option<Bridge>,
    pub end_station: Option<EndStation>,
    /// Data frames parked between the receive phase and the relay phase
    data_in: Vec<(usize, Frame)>,
}

impl Device {
    fn new(index: usize, num_macs: usize) -> Self {
        // device addresses follow the 00:55:00:00:0d:xx convention of the
        // test driver, one per device
        let base = MacAddr([0x00, 0x55, 0x00, 0x00, 0x0d, index as u8 + 1]);
        let system = SystemId::new(0x8000, base);
        let macs = (0..num_macs)
            .map(|m| {
                let mut addr = base.octets();
                addr[4] = 0x0e;
                addr[5] = (index as u8) << 4 | m as u8;
                crate::mac::Mac::new(m, MacAddr(addr))
            })
            .collect();
        Self {
            index,
            system,
            macs,
            lag: LinkAgg::new(system, num_macs),
            bridge: None,
            end_station: None,
            data_in: Vec::new(),
        }
    }

    /// A device with a flood-relay bridge component
    pub fn new_bridge(index: usize, num_macs: usize) -> Self {
        let mut dev = Self::new(index, num_macs);
        dev.bridge = Some(Bridge::new(num_macs));
        dev
    }

    /// A device with an end-station component bound to aggregator 0
    pub fn new_end_station(index: usize, num_macs: usize) -> Self {
        let mut dev = Self::new(index, num_macs);
        dev.end_station = Some(EndStation::new());
        dev
    }

    /// Install a Distributed Relay and rebind the client ports: the
    /// virtualized aggregator's port talks to the relay, the remaining
    /// DRNI and IPP MACs leave the client's view.
    pub fn configure_dist_relay(&mut self, config: DrConfig) {
        let ai = config.aggregator_index;
        let consumed: Vec<usize> = config
            .drni_ports
            .iter()
            .chain(&config.ipp_ports)
            .copied()
            .collect();
        if let Some(bridge) = &mut self.bridge {
            bridge.bindings[ai] = PortBinding::Relay;
            for p in consumed {
                if p != ai {
                    bridge.bindings[p] = PortBinding::Detached;
                }
            }
        }
        if let Some(station) = &mut self.end_station {
            if ai == 0 {
                station.binding = PortBinding::Relay;
            }
        }
        self.lag.configure_dist_relay(config);
    }

    // ---- tick phases, called by the Simulation -------------------------

    pub(crate) fn phase_timers(&mut self) {
        self.lag.tick_timers();
    }

    /// Phase 2: sync carrier, take delivered frames apart into PDUs
    /// (handled now) and data (parked for the relay phase), then run
    /// Receive and Periodic
    pub(crate) fn phase_receive(&mut self) {
        for m in 0..self.macs.len() {
            self.lag.set_port_enabled(m, self.macs[m].operational);
        }
        for m in 0..self.macs.len() {
            while let Some(frame) = self.macs[m].poll_receive() {
                if frame.is_slow_protocols() {
                    self.lag.receive_slow_protocol(m, &frame);
                } else {
                    self.data_in.push((m, frame));
                }
            }
        }
        self.lag.run_receive_periodic();
    }

    pub(crate) fn phase_selection(&mut self) {
        self.lag.run_selection();
    }

    pub(crate) fn phase_mux_transmit(&mut self) {
        for (port, frame) in self.lag.run_mux_transmit() {
            self.macs[port].transmit(frame);
        }
    }

    pub(crate) fn phase_dist_relay(&mut self) {
        for (port, frame) in self.lag.run_dist_relays() {
            self.macs[port].transmit(frame);
        }
    }

    /// Data plane: route parked frames through aggregators and relays,
    /// run the client component, then push aggregator output down to the
    /// MACs
    pub(crate) fn phase_relay(&mut self) {
        // inbound data into aggregators (or across a relay's IPP)
        for (port, frame) in std::mem::take(&mut self.data_in) {
            if let Some(ai) = self.ipp_relay_for_port(port) {
                let action = self
                    .lag
                    .dist_relay(ai)
                    .map(|dr| dr.classify(FrameOrigin::Ipp, &frame))
                    .unwrap_or(DrAction::Discard);
                match action {
                    DrAction::DeliverUp => {
                        if let Some(dr) = self.lag.dist_relay_mut(ai) {
                            dr.up_rx.push_back(frame);
                        }
                    }
                    DrAction::ForwardToLag => self.lag.transmit_on_aggregator(ai, frame),
                    _ => {}
                }
            } else {
                self.lag.deliver_data(port, frame);
            }
        }

        // relays pull what their aggregators collected
        for ai in 0..self.lag.aggregators.len() {
            if self.lag.dist_relay(ai).is_none() {
                continue;
            }
            while let Some(frame) = self.lag.aggregator_mut(ai).poll_receive() {
                let action = self
                    .lag
                    .dist_relay(ai)
                    .map(|dr| dr.classify(FrameOrigin::Lag, &frame))
                    .unwrap_or(DrAction::Discard);
                match action {
                    DrAction::DeliverUp => {
                        if let Some(dr) = self.lag.dist_relay_mut(ai) {
                            dr.up_rx.push_back(frame);
                        }
                    }
                    DrAction::ForwardToIpp => self.transmit_on_ipp(ai, frame),
                    _ => {}
                }
            }
        }

        self.run_client();

        // aggregator output down to the wire
        for ai in 0..self.lag.aggregators.len() {
            while let Some((port, frame)) = self.lag.aggregators[ai].down_tx.pop_front() {
                self.macs[port].transmit(frame);
            }
        }
    }

    fn run_client(&mut self) {
        // collect (ingress, frame) from every bound port
        let mut collected: Vec<(usize, Frame)> = Vec::new();
        let bindings: Vec<PortBinding> = match (&self.bridge, &self.end_station) {
            (Some(bridge), _) => bridge.bindings.clone(),
            (None, Some(station)) => {
                let mut b = vec![PortBinding::Detached; self.lag.aggregators.len()];
                b[0] = station.binding;
                b
            }
            (None, None) => return,
        };
        for (i, binding) in bindings.iter().enumerate() {
            match binding {
                PortBinding::Aggregator => {
                    while let Some(frame) = self.lag.aggregator_mut(i).poll_receive() {
                        collected.push((i, frame));
                    }
                }
                PortBinding::Relay => {
                    while let Some(frame) = self
                        .lag
                        .dist_relay_mut(i)
                        .and_then(|dr| dr.up_rx.pop_front())
                    {
                        collected.push((i, frame));
                    }
                }
                PortBinding::Detached => {}
            }
        }

        if let Some(station) = self.end_station.as_mut() {
            station.received.extend(collected.into_iter().map(|(_, f)| f));
            let pending = std::mem::take(&mut station.pending);
            for frame in pending {
                self.client_transmit(0, bindings[0], frame);
            }
            return;
        }

        // bridge: flood to every other bound port
        for (ingress, frame) in collected {
            for (egress, binding) in bindings.iter().enumerate() {
                if egress == ingress || *binding == PortBinding::Detached {
                    continue;
                }
                self.client_transmit(egress, *binding, frame.clone());
            }
        }
    }

    fn client_transmit(&mut self, index: usize, binding: PortBinding, frame: Frame) {
        match binding {
            PortBinding::Aggregator => {
                if self.lag.aggregators[index].is_operational() {
                    self.lag.transmit_on_aggregator(index, frame);
                }
            }
            PortBinding::Relay => {
                let action = self
                    .lag
                    .dist_relay(index)
                    .map(|dr| dr.classify(FrameOrigin::Client, &frame))
                    .unwrap_or(DrAction::Discard);
                match action {
                    DrAction::ForwardToLag => self.lag.transmit_on_aggregator(index, frame),
                    DrAction::ForwardToIpp => self.transmit_on_ipp(index, frame),
                    _ => {}
                }
            }
            PortBinding::Detached => {}
        }
    }

    /// The relay at aggregator `ai` sends a data frame to its neighbor;
    /// with several live IPP links the conversation ID spreads them the
    /// same way the aggregator's default map would
    fn transmit_on_ipp(&mut self, ai: usize, frame: Frame) {
        let Some(dr) = self.lag.dist_relay(ai) else {
            return;
        };
        let live: Vec<usize> = dr
            .config
            .ipp_ports
            .iter()
            .copied()
            .filter(|&p| self.macs[p].operational)
            .collect();
        if live.is_empty() {
            return;
        }
        let cid = lagsim_protocols::lacp::conversation_id(dr.gateway_algorithm, &frame);
        let port = live[usize::from(cid) % live.len()];
        self.macs[port].transmit(frame);
    }

    /// The relay whose IPP set contains this port, if any
    fn ipp_relay_for_port(&self, port: usize) -> Option<usize> {
        (0..self.lag.aggregators.len()).find(|&ai| {
            self.lag
                .dist_relay(ai)
                .map(|dr| dr.config.ipp_ports.contains(&port))
                .unwrap_or(false)
        })
    }
}
