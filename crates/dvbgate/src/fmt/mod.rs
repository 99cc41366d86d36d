//! MODCOD (modulation + coding) definitions and lookup tables.
//!
//! Every carrier advertises an ordered set of MODCOD identifiers; terminals
//! report a C/N+I from which the gateway derives the most efficient MODCOD
//! they can decode. The definitions below carry everything the schedulers
//! need: spectral efficiency (symbols to bits), coding rate (net to gross
//! FEC scaling) and the BBFrame payload associated with the coding rate.

pub mod sts;

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::{FmtId, RateKbps, VolSym};

/// Payload in bytes of a normal FECFRAME for a given coding rate,
/// from ETSI EN 302 307 v1.2.1 Table 5a.
pub fn bbframe_payload_bytes(coding_rate: &str) -> usize {
    match coding_rate {
        "1/4" => 2001,
        "1/3" => 2676,
        "2/5" => 3216,
        "1/2" => 4026,
        "3/5" => 4836,
        "2/3" => 5380,
        "3/4" => 6051,
        "4/5" => 6456,
        "5/6" => 6730,
        "8/9" => 7184,
        "9/10" => 7274,
        // size of a normal FECFRAME
        _ => 8100,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FmtDefinition {
    pub id: FmtId,
    /// Modulation name, e.g. "QPSK", "8PSK", "16APSK", "32APSK".
    pub modulation: String,
    /// Coding rate as a fraction string, e.g. "3/4".
    pub coding_rate: String,
    /// Bits per symbol after coding.
    pub spectral_efficiency: f64,
    /// Minimum Es/N0 (dB) required to decode this MODCOD.
    pub required_es_n0_db: f64,
}

impl FmtDefinition {
    pub fn new(
        id: FmtId,
        modulation: &str,
        coding_rate: &str,
        spectral_efficiency: f64,
        required_es_n0_db: f64,
    ) -> Self {
        FmtDefinition {
            id,
            modulation: modulation.to_string(),
            coding_rate: coding_rate.to_string(),
            spectral_efficiency,
            required_es_n0_db,
        }
    }

    /// Bits per symbol of the raw modulation (before coding).
    pub fn modulation_efficiency(&self) -> u32 {
        match self.modulation.as_str() {
            "BPSK" => 1,
            "QPSK" => 2,
            "8PSK" => 3,
            "16APSK" | "16QAM" => 4,
            "32APSK" => 5,
            _ => 0,
        }
    }

    fn coding_fraction(&self) -> Option<(u64, u64)> {
        let (num, den) = self.coding_rate.split_once('/')?;
        let num = num.parse().ok()?;
        let den = den.parse().ok()?;
        if num == 0 || den == 0 {
            return None;
        }
        Some((num, den))
    }

    /// Coding rate as a float, 0.0 when the rate string is invalid.
    pub fn coding_rate_value(&self) -> f64 {
        match self.coding_fraction() {
            Some((num, den)) => num as f64 / den as f64,
            None => 0.0,
        }
    }

    /// Scale a net volume or rate up to its gross (FEC included) value.
    pub fn add_fec(&self, value: u32) -> u32 {
        match self.coding_fraction() {
            Some((num, den)) => (value as u64 * den / num) as u32,
            None => value,
        }
    }

    /// Scale a gross volume or rate down to its net value.
    pub fn remove_fec(&self, value: u32) -> u32 {
        match self.coding_fraction() {
            Some((num, den)) => (value as u64 * num / den) as u32,
            None => value,
        }
    }

    /// Payload of a BBFrame built with this MODCOD, in bytes.
    pub fn payload_bytes(&self) -> usize {
        bbframe_payload_bytes(&self.coding_rate)
    }
}

/// The set of MODCOD definitions in use on one link direction.
#[derive(Debug, Clone, Default)]
pub struct FmtDefinitionTable {
    definitions: BTreeMap<FmtId, FmtDefinition>,
}

impl FmtDefinitionTable {
    pub fn new(definitions: Vec<FmtDefinition>) -> Self {
        FmtDefinitionTable {
            definitions: definitions.into_iter().map(|d| (d.id, d)).collect(),
        }
    }

    pub fn get(&self, id: FmtId) -> Option<&FmtDefinition> {
        self.definitions.get(&id)
    }

    pub fn exists(&self, id: FmtId) -> bool {
        self.definitions.contains_key(&id)
    }

    pub fn max_id(&self) -> FmtId {
        self.definitions.keys().next_back().copied().unwrap_or(0)
    }

    pub fn ids(&self) -> impl Iterator<Item = FmtId> + '_ {
        self.definitions.keys().copied()
    }

    /// Convert a volume in symbols to kilobits under a given MODCOD.
    pub fn sym_to_kbits(&self, id: FmtId, vol_sym: VolSym) -> RateKbps {
        match self.get(id) {
            Some(def) => {
                (vol_sym as f64 * def.spectral_efficiency / 1000.0) as RateKbps
            }
            None => 0,
        }
    }

    /// The most efficient MODCOD decodable at the reported C/N+I, 0 when even
    /// the most robust one is out of reach.
    pub fn required_fmt(&self, cni_db: f64) -> FmtId {
        self.definitions
            .values()
            .filter(|def| def.required_es_n0_db <= cni_db)
            .max_by(|a, b| {
                a.spectral_efficiency.total_cmp(&b.spectral_efficiency)
            })
            .map(|def| def.id)
            .unwrap_or(0)
    }
}

/// DVB-S2 MODCODs of EN 302 307 v1.2.1, Table 13 (normal FECFRAME).
pub static S2_MODCODS: Lazy<FmtDefinitionTable> = Lazy::new(|| {
    FmtDefinitionTable::new(vec![
        FmtDefinition::new(1, "QPSK", "1/4", 0.490243, -2.35),
        FmtDefinition::new(2, "QPSK", "1/3", 0.656448, -1.24),
        FmtDefinition::new(3, "QPSK", "2/5", 0.789412, -0.30),
        FmtDefinition::new(4, "QPSK", "1/2", 0.988858, 1.00),
        FmtDefinition::new(5, "QPSK", "3/5", 1.188304, 2.23),
        FmtDefinition::new(6, "QPSK", "2/3", 1.322253, 3.10),
        FmtDefinition::new(7, "QPSK", "3/4", 1.487473, 4.03),
        FmtDefinition::new(8, "QPSK", "4/5", 1.587196, 4.68),
        FmtDefinition::new(9, "QPSK", "5/6", 1.654663, 5.18),
        FmtDefinition::new(10, "QPSK", "8/9", 1.766451, 6.20),
        FmtDefinition::new(11, "QPSK", "9/10", 1.788612, 6.42),
        FmtDefinition::new(12, "8PSK", "3/5", 1.779991, 5.50),
        FmtDefinition::new(13, "8PSK", "2/3", 1.980636, 6.62),
        FmtDefinition::new(14, "8PSK", "3/4", 2.228124, 7.91),
        FmtDefinition::new(15, "8PSK", "5/6", 2.478562, 9.35),
        FmtDefinition::new(16, "8PSK", "8/9", 2.646012, 10.69),
        FmtDefinition::new(17, "8PSK", "9/10", 2.679207, 10.98),
        FmtDefinition::new(18, "16APSK", "2/3", 2.637201, 8.97),
        FmtDefinition::new(19, "16APSK", "3/4", 2.966728, 10.21),
        FmtDefinition::new(20, "16APSK", "4/5", 3.165623, 11.03),
        FmtDefinition::new(21, "16APSK", "5/6", 3.300184, 11.61),
        FmtDefinition::new(22, "16APSK", "8/9", 3.523143, 12.89),
        FmtDefinition::new(23, "16APSK", "9/10", 3.567342, 13.13),
        FmtDefinition::new(24, "32APSK", "3/4", 3.703295, 12.73),
        FmtDefinition::new(25, "32APSK", "4/5", 3.951571, 13.64),
        FmtDefinition::new(26, "32APSK", "5/6", 4.119540, 14.28),
        FmtDefinition::new(27, "32APSK", "8/9", 4.397854, 15.69),
        FmtDefinition::new(28, "32APSK", "9/10", 4.453027, 16.05),
    ])
});

/// A selection of DVB-RCS2 return-link waveforms.
pub static RCS2_MODCODS: Lazy<FmtDefinitionTable> = Lazy::new(|| {
    FmtDefinitionTable::new(vec![
        FmtDefinition::new(3, "QPSK", "1/3", 0.66, 0.22),
        FmtDefinition::new(4, "QPSK", "1/2", 0.99, 2.34),
        FmtDefinition::new(5, "QPSK", "2/3", 1.32, 4.29),
        FmtDefinition::new(6, "QPSK", "3/4", 1.49, 5.36),
        FmtDefinition::new(7, "QPSK", "5/6", 1.65, 6.68),
        FmtDefinition::new(8, "8PSK", "2/3", 1.98, 8.08),
        FmtDefinition::new(9, "8PSK", "3/4", 2.23, 9.31),
        FmtDefinition::new(10, "8PSK", "5/6", 2.48, 10.82),
        FmtDefinition::new(11, "16QAM", "3/4", 2.97, 11.17),
        FmtDefinition::new(12, "16QAM", "5/6", 3.30, 12.56),
    ])
});

/// An ordered set of MODCOD ids supported by a carrier.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FmtGroup {
    ids: Vec<FmtId>,
}

impl FmtGroup {
    pub fn new(mut ids: Vec<FmtId>) -> Self {
        ids.sort_unstable();
        ids.dedup();
        FmtGroup { ids }
    }

    pub fn ids(&self) -> &[FmtId] {
        &self.ids
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn contains(&self, id: FmtId) -> bool {
        self.ids.binary_search(&id).is_ok()
    }

    pub fn highest(&self) -> FmtId {
        self.ids.last().copied().unwrap_or(0)
    }

    /// The smallest supported id at least as robust as the requested one;
    /// falls back to the largest id below it, then to 0 when the group is
    /// empty.
    pub fn nearest(&self, requested: FmtId) -> FmtId {
        match self.ids.binary_search(&requested) {
            Ok(_) => requested,
            Err(pos) => {
                if pos < self.ids.len() {
                    self.ids[pos]
                } else {
                    self.ids.last().copied().unwrap_or(0)
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn payload_table() {
        assert_eq!(bbframe_payload_bytes("1/4"), 2001);
        assert_eq!(bbframe_payload_bytes("9/10"), 7274);
        assert_eq!(bbframe_payload_bytes("7/8"), 8100);
    }

    #[test]
    fn fec_roundtrip() {
        for def in [
            FmtDefinition::new(1, "QPSK", "1/2", 0.99, 1.0),
            FmtDefinition::new(2, "8PSK", "3/4", 2.23, 7.9),
            FmtDefinition::new(3, "16APSK", "9/10", 3.57, 13.1),
        ] {
            for value in [0u32, 1000, 16320, 100_000] {
                let roundtrip = def.remove_fec(def.add_fec(value));
                assert!(roundtrip.abs_diff(value) <= 1);
            }
        }
    }

    #[test]
    fn add_fec_grows() {
        let def = FmtDefinition::new(1, "QPSK", "2/3", 1.32, 3.1);
        assert_eq!(def.add_fec(1000), 1500);
        assert_eq!(def.remove_fec(1500), 1000);
    }

    #[test]
    fn modulation_efficiency() {
        assert_eq!(S2_MODCODS.get(4).unwrap().modulation_efficiency(), 2);
        assert_eq!(S2_MODCODS.get(14).unwrap().modulation_efficiency(), 3);
        assert_eq!(S2_MODCODS.get(28).unwrap().modulation_efficiency(), 5);
    }

    #[test]
    fn sym_to_kbits() {
        assert_eq!(S2_MODCODS.sym_to_kbits(4, 1_000_000), 988);
        assert_eq!(S2_MODCODS.sym_to_kbits(200, 1_000_000), 0);
    }

    #[test]
    fn required_fmt_from_cni() {
        // high C/N+I reaches the top MODCOD
        assert_eq!(S2_MODCODS.required_fmt(20.0), 28);
        // between QPSK 3/4 (4.03) and QPSK 4/5 (4.68)
        assert_eq!(S2_MODCODS.required_fmt(4.5), 7);
        // below the most robust definition
        assert_eq!(S2_MODCODS.required_fmt(-10.0), 0);
    }

    #[test]
    fn nearest_fmt() {
        let group = FmtGroup::new(vec![5, 7, 10]);
        assert_eq!(group.nearest(7), 7);
        assert_eq!(group.nearest(6), 7);
        assert_eq!(group.nearest(1), 5);
        assert_eq!(group.nearest(12), 10);
        assert_eq!(FmtGroup::new(vec![]).nearest(4), 0);
    }

    #[test]
    fn coding_rate_value() {
        let def = FmtDefinition::new(1, "QPSK", "3/4", 1.49, 4.0);
        assert_relative_eq!(def.coding_rate_value(), 0.75);
        let bad = FmtDefinition::new(1, "QPSK", "x", 1.0, 0.0);
        assert_relative_eq!(bad.coding_rate_value(), 0.0);
    }
}
