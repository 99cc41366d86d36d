//! Demand Assigned Multiple Access: the terminal-side agent generating
//! capacity requests and the gateway-side controller turning them into
//! per-superframe allocations.

pub mod agent;
pub mod ctrl;

use std::collections::VecDeque;

/// Sliding record of the last capacity requests, sized to the number of
/// requests in flight (minimum scheduling latency over the SYNC period).
///
/// With a zero size only the last value is remembered and the sum stays 0.
#[derive(Debug, Clone)]
pub struct RequestHistory {
    values: VecDeque<u32>,
    size: usize,
    previous: u32,
}

impl RequestHistory {
    pub fn new(size: usize) -> Self {
        RequestHistory { values: VecDeque::with_capacity(size), size, previous: 0 }
    }

    pub fn update(&mut self, value: u32) {
        self.previous = value;
        if self.size == 0 {
            return;
        }
        if self.values.len() == self.size {
            self.values.pop_front();
        }
        self.values.push_back(value);
    }

    pub fn previous_value(&self) -> u32 {
        self.previous
    }

    pub fn sum(&self) -> u32 {
        self.values.iter().sum()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::time::Duration;

    use crate::carrier::{AccessType, CarriersGroup, TerminalCategory};
    use crate::dama::ctrl::{CtrlConfig, DamaCtrl};
    use crate::fmt::sts::StFmtList;
    use crate::fmt::{FmtGroup, RCS2_MODCODS};
    use crate::frame::{CrType, LogonRequest, Sac};

    /// A simulated terminal logs on, requests capacity and logs off; every
    /// grant stays within its envelopes and the carrier.
    #[test]
    fn simulated_terminal_lifecycle() {
        // 25000 symbols and 250-symbol QPSK 1/2 bursts: 100 timeslots
        let mut carriers = CarriersGroup::new(
            5,
            FmtGroup::new(vec![4]),
            10,
            500_000,
            AccessType::DamaRbdc,
        );
        carriers.set_capacity_sym(25_000);
        let mut category = TerminalCategory::new("Standard");
        category.add_carriers_group(carriers);
        let mut categories = BTreeMap::new();
        categories.insert("Standard".to_string(), category);

        let mut ctrl = DamaCtrl::new(
            CtrlConfig {
                spot_id: 1,
                group_id: 1,
                frame_duration: Duration::from_millis(50),
                rbdc_timeout_sf: 16,
                fca_kbps: 0,
                enable_rbdc: true,
                enable_vbdc: true,
                burst_length_sym: 250,
                simulated: true,
            },
            categories,
            BTreeMap::new(),
            Some("Standard".to_string()),
            Arc::new(RCS2_MODCODS.clone()),
            Arc::new(StFmtList::new()),
        )
        .unwrap();

        // SF10: logon of simulated terminal 32
        ctrl.here_is_logon(&LogonRequest::new(32, 100, 500, 2000))
            .unwrap();
        ctrl.run_on_superframe_change(10).unwrap();

        // SF12: a 300 kbit/s RBDC request
        let mut sac = Sac::new(32, 1);
        sac.acm_cni_db = 3.0;
        sac.add_request(0, CrType::Rbdc, 300);
        ctrl.here_is_sac(&sac);
        ctrl.run_on_superframe_change(12).unwrap();

        let terminal = ctrl.terminal(32).unwrap();
        assert_eq!(terminal.cra_alloc_kbps, 100);
        assert_eq!(terminal.rbdc_alloc_kbps, 300);
        assert!(
            terminal.rbdc_alloc_kbps
                <= terminal.max_rbdc_kbps - terminal.cra_kbps
        );
        // CRA (20 slots) + RBDC (60 slots) fit the 100-slot carrier
        let remaining = ctrl.categories()["Standard"].carriers_groups()[0]
            .remaining_capacity();
        assert_eq!(remaining, 20);

        let ttp = ctrl.build_ttp();
        assert_eq!(ttp.plans_for(32).len(), 1);

        // SF14: logoff, the terminal vanishes from the plans
        assert!(ctrl.here_is_logoff(32));
        ctrl.run_on_superframe_change(14).unwrap();
        assert!(ctrl.build_ttp().plans_for(32).is_empty());
    }

    #[test]
    fn history_slides() {
        let mut hist = RequestHistory::new(3);
        for value in [10, 20, 30] {
            hist.update(value);
        }
        assert_eq!(hist.sum(), 60);
        assert_eq!(hist.previous_value(), 30);

        hist.update(40);
        assert_eq!(hist.sum(), 90);
        assert_eq!(hist.previous_value(), 40);
    }

    #[test]
    fn zero_size_keeps_only_last_value() {
        let mut hist = RequestHistory::new(0);
        hist.update(10);
        hist.update(20);
        assert_eq!(hist.previous_value(), 20);
        assert_eq!(hist.sum(), 0);
    }
}
