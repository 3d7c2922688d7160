//! Intra-Relay Port state machine
//!
//! Each IPP mirrors the LACP Receive machine over DRCPDUs: neighbor
//! information is Current while PDUs keep arriving, ages out through
//! Expired into Defaulted when they stop. DRCP always runs fast
//! periodic transmission on the IPP, so peer loss is detected within
//! three periodic intervals.

use tracing::{debug, trace};

use lagsim_core::{timers, Timer};

/// IPP receive states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IppRxState {
    #[default]
    Init,
    Expired,
    Defaulted,
    Current,
}

/// Per-IPP state
#[derive(Debug)]
pub struct Ipp {
    /// AggPort arena index carrying this IPP
    pub port_index: usize,
    pub state: IppRxState,
    pub enabled: bool,
    pub current_while: Timer,
    pub periodic: Timer,
    pub ntt: bool,
}

impl Ipp {
    pub fn new(port_index: usize) -> Self {
        Self {
            port_index,
            state: IppRxState::Init,
            enabled: false,
            current_while: Timer::stopped(),
            periodic: Timer::stopped(),
            ntt: false,
        }
    }

    pub fn tick_timers(&mut self) {
        self.current_while.tick();
        self.periodic.tick();
    }

    /// Carrier change on the underlying MAC
    pub fn set_enabled(&mut self, enabled: bool) {
        if self.enabled == enabled {
            return;
        }
        self.enabled = enabled;
        if !enabled {
            self.state = IppRxState::Init;
            self.current_while.stop();
            self.periodic.stop();
        }
    }

    /// One receive pass; `heard` is true when a valid DRCPDU arrived
    /// this tick. Returns true when the neighbor information was lost
    /// (the caller unpairs the relay).
    pub fn rx_step(&mut self, heard: bool) -> bool {
        let before = self.state;
        match self.state {
            IppRxState::Init => {
                if self.enabled {
                    self.state = IppRxState::Expired;
                    self.current_while.start(timers::SHORT_TIMEOUT_TIME);
                    self.ntt = true;
                }
            }
            IppRxState::Expired => {
                if heard {
                    self.enter_current();
                } else if self.current_while.expired() {
                    self.state = IppRxState::Defaulted;
                    debug!(ipp = self.port_index, "neighbor defaulted");
                }
            }
            IppRxState::Defaulted => {
                if heard {
                    self.enter_current();
                }
            }
            IppRxState::Current => {
                if heard {
                    self.enter_current();
                } else if self.current_while.expired() {
                    self.state = IppRxState::Expired;
                    self.current_while.start(timers::SHORT_TIMEOUT_TIME);
                    self.ntt = true;
                }
            }
        }
        if before != self.state {
            trace!(ipp = self.port_index, from = ?before, to = ?self.state, "ipp transition");
        }
        // losing Current means the stored neighbor view is suspect
        matches!(before, IppRxState::Current) && !matches!(self.state, IppRxState::Current)
    }

    fn enter_current(&mut self) {
        self.state = IppRxState::Current;
        // DRCP runs short timeouts on the IPP
        self.current_while
            .start(timers::SHORT_TIMEOUT_TIME);
    }

    /// Fast periodic transmission; returns true when a PDU is due
    pub fn periodic_step(&mut self) -> bool {
        if !self.enabled {
            return false;
        }
        if !self.periodic.running() {
            self.periodic.start(timers::FAST_PERIODIC_TIME);
        }
        if self.periodic.expired() {
            self.periodic.start(timers::FAST_PERIODIC_TIME);
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ipp_ages_out() {
        let mut ipp = Ipp::new(6);
        ipp.set_enabled(true);
        assert!(!ipp.rx_step(false));
        assert_eq!(ipp.state, IppRxState::Expired);

        assert!(!ipp.rx_step(true));
        assert_eq!(ipp.state, IppRxState::Current);

        // three short-timeout ticks of silence expires the neighbor
        let mut lost = false;
        for _ in 0..timers::SHORT_TIMEOUT_TIME {
            ipp.tick_timers();
            lost |= ipp.rx_step(false);
        }
        assert!(lost);
        assert_eq!(ipp.state, IppRxState::Expired);

        for _ in 0..timers::SHORT_TIMEOUT_TIME {
            ipp.tick_timers();
            ipp.rx_step(false);
        }
        assert_eq!(ipp.state, IppRxState::Defaulted);
    }

    #[test]
    fn test_disable_reinitializes() {
        let mut ipp = Ipp::new(6);
        ipp.set_enabled(true);
        ipp.rx_step(false);
        ipp.rx_step(true);
        ipp.set_enabled(false);
        assert_eq!(ipp.state, IppRxState::Init);
        assert!(!ipp.rx_step(false));
        assert_eq!(ipp.state, IppRxState::Init);
    }

    #[test]
    fn test_periodic_cadence() {
        let mut ipp = Ipp::new(6);
        ipp.set_enabled(true);
        assert!(!ipp.periodic_step());
        ipp.tick_timers();
        assert!(ipp.periodic_step());
        ipp.tick_timers();
        assert!(ipp.periodic_step());
    }
}
