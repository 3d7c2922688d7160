//! The discrete-time driver
//!
//! One global tick advances every Device through the fixed phase order:
//!
//! 1. timer decrement
//! 2. Receive + Periodic (DRCPDU receive shares this phase)
//! 3. Selection Logic
//! 4. Mux + Transmit
//! 5. Distributed Relays
//! 6. data relay, then every Link advances in-flight frames by one tick
//!    and delivers the ones whose propagation delay reached zero
//!
//! Nothing suspends mid-tick; convergence relies purely on this
//! ordering. Time is an explicit context value, not process state.

use tracing::debug;

use crate::device::Device;
use lagsim_core::Frame;

/// Explicit simulation clock threaded through the driver
#[derive(Debug, Clone, Copy, Default)]
pub struct SimClock {
    pub now: u64,
}

impl SimClock {
    fn advance(&mut self) {
        self.now += 1;
    }
}

/// A MAC endpoint reference: (device index, MAC index)
pub type Endpoint = (usize, usize);

#[derive(Debug)]
struct Link {
    a: Endpoint,
    b: Endpoint,
    delay: u32,
    /// (frame, travelling a->b, ticks remaining)
    in_flight: Vec<(Frame, bool, u32)>,
}

/// The whole simulated network
#[derive(Debug, Default)]
pub struct Simulation {
    pub clock: SimClock,
    pub devices: Vec<Device>,
    links: Vec<Link>,
}

impl Simulation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_device(&mut self, device: Device) -> usize {
        self.devices.push(device);
        self.devices.len() - 1
    }

    /// Connect two MACs with a propagation delay, replacing any existing
    /// link on either endpoint
    pub fn connect(&mut self, a: Endpoint, b: Endpoint, delay: u32) {
        self.disconnect(a);
        self.disconnect(b);
        self.devices[a.0].macs[a.1].operational = true;
        self.devices[b.0].macs[b.1].operational = true;
        debug!(?a, ?b, delay, t = self.clock.now, "link connected");
        self.links.push(Link {
            a,
            b,
            delay: delay.max(1),
            in_flight: Vec::new(),
        });
    }

    /// Tear down the link touching this endpoint; frames in flight are
    /// lost
    pub fn disconnect(&mut self, end: Endpoint) {
        let devices = &mut self.devices;
        self.links.retain(|link| {
            if link.a != end && link.b != end {
                return true;
            }
            devices[link.a.0].macs[link.a.1].operational = false;
            devices[link.b.0].macs[link.b.1].operational = false;
            devices[link.a.0].macs[link.a.1].reset();
            devices[link.b.0].macs[link.b.1].reset();
            false
        });
    }

    /// Tear down every link
    pub fn disconnect_all(&mut self) {
        let ends: Vec<Endpoint> = self.links.iter().map(|l| l.a).collect();
        for end in ends {
            self.disconnect(end);
        }
    }

    /// Advance the whole network one tick
    pub fn tick(&mut self) {
        for dev in &mut self.devices {
            dev.phase_timers();
        }
        for dev in &mut self.devices {
            dev.phase_receive();
        }
        for dev in &mut self.devices {
            dev.phase_selection();
        }
        for dev in &mut self.devices {
            dev.phase_mux_transmit();
        }
        for dev in &mut self.devices {
            dev.phase_dist_relay();
        }
        for dev in &mut self.devices {
            dev.phase_relay();
        }
        self.advance_links();
        self.clock.advance();
    }

    /// Run `ticks` ticks
    pub fn run(&mut self, ticks: u64) {
        for _ in 0..ticks {
            self.tick();
        }
    }

    /// Run until the clock reads `t`
    pub fn run_until(&mut self, t: u64) {
        while self.clock.now < t {
            self.tick();
        }
    }

    fn advance_links(&mut self) {
        let devices = &mut self.devices;
        for link in &mut self.links {
            // pick up freshly queued frames at both ends
            for frame in devices[link.a.0].macs[link.a.1].drain_tx() {
                link.in_flight.push((frame, true, link.delay));
            }
            for frame in devices[link.b.0].macs[link.b.1].drain_tx() {
                link.in_flight.push((frame, false, link.delay));
            }
            // one tick of propagation; deliver what has arrived
            for (_, _, remaining) in link.in_flight.iter_mut() {
                *remaining -= 1;
            }
            let mut keep = Vec::with_capacity(link.in_flight.len());
            for (frame, from_a, remaining) in link.in_flight.drain(..) {
                if remaining == 0 {
                    let dst = if from_a { link.b } else { link.a };
                    devices[dst.0].macs[dst.1].deliver(frame);
                } else {
                    keep.push((frame, from_a, remaining));
                }
            }
            link.in_flight = keep;
        }
    }
}
