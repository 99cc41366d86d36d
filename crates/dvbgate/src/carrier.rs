//! Carrier groups and terminal categories.
//!
//! A terminal category owns one or more carrier groups; each group carries an
//! ordered MODCOD set, a per-frame symbol capacity and the two capacity
//! ledgers used by the schedulers: `remaining` (consumed while scheduling)
//! and `previous` (capacity carried over to exactly one later superframe).
//! A group may be split into VCM sub-carriers, each with its own MODCOD set
//! and a share of the parent capacity proportional to its ratio.

use serde::{Deserialize, Serialize};

use crate::fmt::FmtGroup;
use crate::{CarrierId, FmtId, TalId, TimeSf, VolSym};

/// How a MAC FIFO or carrier group is accessed.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
pub enum AccessType {
    /// Adaptive coding and modulation (one sub-carrier, MODCOD per terminal).
    Acm,
    /// Variable coding and modulation sub-carrier with the given index.
    Vcm(u8),
    /// Rate-based dynamic capacity (return link).
    DamaRbdc,
    /// Volume-based dynamic capacity (return link).
    DamaVbdc,
    /// Slotted Aloha random access, never scheduled by DAMA.
    Saloha,
}

#[derive(Debug, Clone)]
pub struct CarriersGroup {
    id: CarrierId,
    fmt_group: FmtGroup,
    /// Share of the category band, used to split capacity among VCM children.
    ratio: u32,
    symbol_rate_symps: u32,
    carriers_number: u32,
    access_type: AccessType,
    /// Total capacity for one frame, in symbols.
    total_capacity_sym: VolSym,
    remaining_capacity: u32,
    previous_capacity: u32,
    previous_sf: TimeSf,
    vcm_carriers: Vec<CarriersGroup>,
}

impl CarriersGroup {
    pub fn new(
        id: CarrierId,
        fmt_group: FmtGroup,
        ratio: u32,
        symbol_rate_symps: u32,
        access_type: AccessType,
    ) -> Self {
        CarriersGroup {
            id,
            fmt_group,
            ratio,
            symbol_rate_symps,
            carriers_number: 1,
            access_type,
            total_capacity_sym: 0,
            remaining_capacity: 0,
            previous_capacity: 0,
            previous_sf: 0,
            vcm_carriers: Vec::new(),
        }
    }

    pub fn id(&self) -> CarrierId {
        self.id
    }

    pub fn access_type(&self) -> AccessType {
        self.access_type
    }

    pub fn fmt_group(&self) -> &FmtGroup {
        &self.fmt_group
    }

    pub fn ratio(&self) -> u32 {
        self.ratio
    }

    pub fn symbol_rate_symps(&self) -> u32 {
        self.symbol_rate_symps
    }

    pub fn set_symbol_rate_symps(&mut self, symbol_rate_symps: u32) {
        self.symbol_rate_symps = symbol_rate_symps;
        for vcm in &mut self.vcm_carriers {
            vcm.symbol_rate_symps = symbol_rate_symps;
        }
    }

    pub fn carriers_number(&self) -> u32 {
        self.carriers_number
    }

    pub fn set_carriers_number(&mut self, carriers_number: u32) {
        self.carriers_number = carriers_number;
        for vcm in &mut self.vcm_carriers {
            vcm.carriers_number = carriers_number;
        }
    }

    pub fn total_capacity_sym(&self) -> VolSym {
        self.total_capacity_sym
    }

    /// Set the per-frame symbol capacity and redistribute it to the VCM
    /// children proportionally to their ratios.
    pub fn set_capacity_sym(&mut self, capacity_sym: VolSym) {
        self.total_capacity_sym = capacity_sym;
        let total_ratio = self.ratio.max(1);
        for vcm in &mut self.vcm_carriers {
            vcm.set_capacity_sym(
                (vcm.ratio as u64 * capacity_sym as u64 / total_ratio as u64)
                    as VolSym,
            );
        }
    }

    pub fn remaining_capacity(&self) -> u32 {
        self.remaining_capacity
    }

    pub fn set_remaining_capacity(&mut self, remaining: u32) {
        self.remaining_capacity = remaining;
    }

    /// Record capacity valid for `superframe_sf` only.
    pub fn set_previous_capacity(
        &mut self,
        previous: u32,
        superframe_sf: TimeSf,
    ) {
        self.previous_capacity = previous;
        self.previous_sf = superframe_sf;
    }

    /// Capacity carried over from the previous superframe, 0 unless it was
    /// recorded for exactly this one.
    pub fn previous_capacity(&self, superframe_sf: TimeSf) -> u32 {
        if self.previous_sf != superframe_sf {
            return 0;
        }
        self.previous_capacity
    }

    pub fn nearest_fmt(&self, requested: FmtId) -> FmtId {
        self.fmt_group.nearest(requested)
    }

    /// Add a VCM sub-carrier. The first call turns the group into a VCM
    /// group; subsequent ratios widen the parent's total ratio.
    pub fn add_vcm(&mut self, fmt_group: FmtGroup, ratio: u32) {
        if !self.vcm_carriers.is_empty() {
            self.ratio += ratio;
        }
        let mut vcm = CarriersGroup::new(
            self.id,
            fmt_group,
            ratio,
            self.symbol_rate_symps,
            self.access_type,
        );
        vcm.carriers_number = self.carriers_number;
        self.vcm_carriers.push(vcm);
    }

    /// The VCM sub-carriers, or the group itself when it is not split.
    pub fn vcm_carriers_mut(&mut self) -> &mut [CarriersGroup] {
        if self.vcm_carriers.is_empty() {
            std::slice::from_mut(self)
        } else {
            &mut self.vcm_carriers
        }
    }

    pub fn vcm_count(&self) -> usize {
        self.vcm_carriers.len().max(1)
    }
}

/// A set of carrier groups sharing a band, plus the terminals logged on them.
#[derive(Debug, Clone, Default)]
pub struct TerminalCategory {
    label: String,
    carriers: Vec<CarriersGroup>,
    terminals: Vec<TalId>,
}

impl TerminalCategory {
    pub fn new(label: &str) -> Self {
        TerminalCategory {
            label: label.to_string(),
            ..Default::default()
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn add_carriers_group(&mut self, carriers: CarriersGroup) {
        self.carriers.push(carriers);
    }

    pub fn carriers_groups(&self) -> &[CarriersGroup] {
        &self.carriers
    }

    pub fn carriers_groups_mut(&mut self) -> &mut [CarriersGroup] {
        &mut self.carriers
    }

    pub fn carriers_group_mut(
        &mut self,
        id: CarrierId,
    ) -> Option<&mut CarriersGroup> {
        self.carriers.iter_mut().find(|c| c.id() == id)
    }

    pub fn add_terminal(&mut self, tal_id: TalId) {
        if !self.terminals.contains(&tal_id) {
            self.terminals.push(tal_id);
        }
    }

    pub fn remove_terminal(&mut self, tal_id: TalId) -> bool {
        match self.terminals.iter().position(|t| *t == tal_id) {
            Some(pos) => {
                self.terminals.remove(pos);
                true
            }
            None => false,
        }
    }

    pub fn terminals(&self) -> &[TalId] {
        &self.terminals
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn group() -> CarriersGroup {
        CarriersGroup::new(
            5,
            FmtGroup::new(vec![4, 7, 13]),
            10,
            7_500_000,
            AccessType::Acm,
        )
    }

    #[test]
    fn previous_capacity_is_tagged_with_superframe() {
        let mut carriers = group();
        carriers.set_previous_capacity(800, 42);
        assert_eq!(carriers.previous_capacity(42), 800);
        assert_eq!(carriers.previous_capacity(41), 0);
        assert_eq!(carriers.previous_capacity(43), 0);
    }

    #[test]
    fn vcm_split_follows_ratios() {
        let mut carriers = group();
        carriers.add_vcm(FmtGroup::new(vec![4]), 6);
        carriers.add_vcm(FmtGroup::new(vec![13]), 4);
        // 10 (initial) + 4 added by the second VCM
        assert_eq!(carriers.ratio(), 14);

        carriers.set_capacity_sym(14_000);
        let vcm = carriers.vcm_carriers_mut();
        assert_eq!(vcm.len(), 2);
        assert_eq!(vcm[0].total_capacity_sym(), 6_000);
        assert_eq!(vcm[1].total_capacity_sym(), 4_000);
    }

    #[test]
    fn plain_group_iterates_as_itself() {
        let mut carriers = group();
        carriers.set_capacity_sym(1_000);
        assert_eq!(carriers.vcm_count(), 1);
        let vcm = carriers.vcm_carriers_mut();
        assert_eq!(vcm.len(), 1);
        assert_eq!(vcm[0].total_capacity_sym(), 1_000);
    }

    #[test]
    fn category_terminal_membership() {
        let mut category = TerminalCategory::new("Standard");
        category.add_terminal(3);
        category.add_terminal(3);
        assert_eq!(category.terminals(), &[3]);
        assert!(category.remove_terminal(3));
        assert!(!category.remove_terminal(3));
    }
}
