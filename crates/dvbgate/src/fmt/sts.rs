//! Per-terminal MODCOD bookkeeping shared between the two event loops.
//!
//! The upward loop feeds C/N+I reports extracted from SACs, the downward loop
//! reads the resulting MODCODs while scheduling. This is the only state both
//! loops touch, so every access is a point lock on the inner mutex.

use std::collections::BTreeMap;
use std::sync::Mutex;

use tracing::warn;

use crate::fmt::FmtDefinitionTable;
use crate::{FmtId, TalId};

#[derive(Debug, Clone, Default)]
struct StFmt {
    fmt_id: FmtId,
    cni_db: f64,
    cni_has_changed: bool,
}

/// Terminal list with their current MODCOD, derived from reported C/N+I.
#[derive(Debug, Default)]
pub struct StFmtList {
    sts: Mutex<BTreeMap<TalId, StFmt>>,
}

impl StFmtList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a terminal with the most robust usable MODCOD until a report
    /// arrives.
    pub fn add_terminal(
        &self,
        tal_id: TalId,
        cni_db: f64,
        modcod_def: &FmtDefinitionTable,
    ) {
        let fmt_id = modcod_def.required_fmt(cni_db);
        let mut sts = self.sts.lock().unwrap();
        sts.insert(
            tal_id,
            StFmt { fmt_id, cni_db, cni_has_changed: true },
        );
    }

    pub fn del_terminal(&self, tal_id: TalId) {
        self.sts.lock().unwrap().remove(&tal_id);
    }

    pub fn is_present(&self, tal_id: TalId) -> bool {
        self.sts.lock().unwrap().contains_key(&tal_id)
    }

    /// Record a new C/N+I report and recompute the terminal's MODCOD.
    pub fn update_cni(
        &self,
        tal_id: TalId,
        cni_db: f64,
        modcod_def: &FmtDefinitionTable,
    ) {
        let mut sts = self.sts.lock().unwrap();
        match sts.get_mut(&tal_id) {
            Some(st) => {
                if (st.cni_db - cni_db).abs() > f64::EPSILON {
                    st.cni_has_changed = true;
                }
                st.cni_db = cni_db;
                st.fmt_id = modcod_def.required_fmt(cni_db);
            }
            None => {
                warn!("C/N+I report for unknown terminal {tal_id}");
            }
        }
    }

    pub fn current_modcod(&self, tal_id: TalId) -> FmtId {
        self.sts
            .lock()
            .unwrap()
            .get(&tal_id)
            .map(|st| st.fmt_id)
            .unwrap_or(0)
    }

    pub fn cni(&self, tal_id: TalId) -> Option<f64> {
        self.sts.lock().unwrap().get(&tal_id).map(|st| st.cni_db)
    }

    /// True when the last report changed the terminal's C/N+I; clears the
    /// flag.
    pub fn take_cni_changed(&self, tal_id: TalId) -> bool {
        let mut sts = self.sts.lock().unwrap();
        match sts.get_mut(&tal_id) {
            Some(st) => std::mem::take(&mut st.cni_has_changed),
            None => false,
        }
    }

    /// The terminal every other one can decode, i.e. the one with the lowest
    /// MODCOD. Used to route broadcast traffic.
    pub fn tal_id_with_lowest_modcod(&self) -> Option<TalId> {
        self.sts
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, st)| st.fmt_id != 0)
            .min_by_key(|(tal_id, st)| (st.fmt_id, **tal_id))
            .map(|(tal_id, _)| *tal_id)
    }

    pub fn len(&self) -> usize {
        self.sts.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sts.lock().unwrap().is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::fmt::S2_MODCODS;

    #[test]
    fn lowest_modcod_for_broadcast() {
        let sts = StFmtList::new();
        sts.add_terminal(1, 20.0, &S2_MODCODS); // MODCOD 28
        sts.add_terminal(2, 4.5, &S2_MODCODS); // MODCOD 7
        sts.add_terminal(3, 9.0, &S2_MODCODS); // MODCOD 18
        assert_eq!(sts.tal_id_with_lowest_modcod(), Some(2));

        sts.del_terminal(2);
        assert_eq!(sts.tal_id_with_lowest_modcod(), Some(3));
    }

    #[test]
    fn empty_list_has_no_broadcast_target() {
        let sts = StFmtList::new();
        assert_eq!(sts.tal_id_with_lowest_modcod(), None);
        sts.add_terminal(1, -10.0, &S2_MODCODS); // unservable, MODCOD 0
        assert_eq!(sts.tal_id_with_lowest_modcod(), None);
    }

    #[test]
    fn cni_update_tracks_changes() {
        let sts = StFmtList::new();
        sts.add_terminal(5, 6.0, &S2_MODCODS);
        assert!(sts.take_cni_changed(5));
        assert!(!sts.take_cni_changed(5));

        sts.update_cni(5, 6.0, &S2_MODCODS);
        assert!(!sts.take_cni_changed(5));
        sts.update_cni(5, 12.0, &S2_MODCODS);
        assert!(sts.take_cni_changed(5));
        assert_eq!(sts.current_modcod(5), S2_MODCODS.required_fmt(12.0));
    }
}
