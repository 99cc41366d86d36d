//! Conversions between the volume and rate units used across the MAC layer.
//!
//! Allocations travel through three unit systems: kilobits per second in
//! requests and TTPs, packets (timeslots) per frame inside the DAMA
//! computations, and symbols on the carriers. The converter binds them
//! together for a given frame duration and packet length.
//!
//! Two packet length models exist:
//!
//! - a fixed length in *bits* (DVB-RCS), independent of the modulation;
//! - a fixed length in *symbols* (DVB-RCS2 bursts), whose bit length follows
//!   the modulation efficiency of the MODCOD in effect.
//!
//! For the latter, [`UnitConverter::set_modulation_efficiency`] must be called
//! with the current MODCOD before converting; the DAMA controller does so for
//! each terminal inside its per-carrier loops.

use std::time::Duration;

use crate::{RateKbps, RatePktpf, RateSymps, VolB, VolKb, VolPkt, VolSym};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PacketLength {
    /// Constant bit length per packet.
    Bits(u32),
    /// Constant symbol length per burst, bit length depends on the modulation.
    Symbols(u32),
}

#[derive(Debug, Clone)]
pub struct UnitConverter {
    frame_duration: Duration,
    length: PacketLength,
    /// Bits per symbol of the MODCOD in effect (0 until set for
    /// symbol-length converters).
    modulation_efficiency: u32,
}

impl UnitConverter {
    /// Converter for a constant packet bit length.
    pub fn fixed_bit_length(frame_duration: Duration, length_b: u32) -> Self {
        UnitConverter {
            frame_duration,
            length: PacketLength::Bits(length_b),
            modulation_efficiency: 1,
        }
    }

    /// Converter for a constant burst symbol length.
    pub fn fixed_symbol_length(
        frame_duration: Duration,
        length_sym: u32,
    ) -> Self {
        UnitConverter {
            frame_duration,
            length: PacketLength::Symbols(length_sym),
            modulation_efficiency: 0,
        }
    }

    pub fn frame_duration(&self) -> Duration {
        self.frame_duration
    }

    fn frame_ms(&self) -> u64 {
        self.frame_duration.as_millis() as u64
    }

    pub fn modulation_efficiency(&self) -> u32 {
        self.modulation_efficiency
    }

    /// Set the modulation efficiency (bits per symbol) of the MODCOD in
    /// effect. Affects the packet bit length of symbol-length converters.
    pub fn set_modulation_efficiency(&mut self, efficiency: u32) {
        self.modulation_efficiency = efficiency;
    }

    /// Packet length in bits under the current modulation.
    pub fn packet_bit_length(&self) -> u32 {
        match self.length {
            PacketLength::Bits(b) => b,
            PacketLength::Symbols(s) => s * self.modulation_efficiency,
        }
    }

    /// Packet length in symbols under the current modulation.
    pub fn packet_symbol_length(&self) -> u32 {
        match self.length {
            PacketLength::Bits(b) => {
                if self.modulation_efficiency == 0 {
                    0
                } else {
                    b / self.modulation_efficiency
                }
            }
            PacketLength::Symbols(s) => s,
        }
    }

    /// kbit/s to packets per frame, quantised down to whole timeslots.
    pub fn kbps_to_pktpf(&self, rate_kbps: RateKbps) -> RatePktpf {
        let length_b = self.packet_bit_length() as u64;
        if length_b == 0 {
            return 0;
        }
        // kbit/s equals bit/ms, so rate * frame_ms is a volume in bits
        (rate_kbps as u64 * self.frame_ms() / length_b) as RatePktpf
    }

    /// Packets per frame back to kbit/s.
    pub fn pktpf_to_kbps(&self, rate_pktpf: RatePktpf) -> RateKbps {
        let frame_ms = self.frame_ms();
        if frame_ms == 0 {
            return 0;
        }
        (rate_pktpf as u64 * self.packet_bit_length() as u64 / frame_ms)
            as RateKbps
    }

    /// Symbols to whole packets.
    pub fn sym_to_pkt(&self, vol_sym: VolSym) -> VolPkt {
        let length_b = self.packet_bit_length() as u64;
        if length_b == 0 {
            return 0;
        }
        (vol_sym as u64 * self.modulation_efficiency as u64 / length_b)
            as VolPkt
    }

    /// Packets to symbols.
    pub fn pkt_to_sym(&self, vol_pkt: VolPkt) -> VolSym {
        if self.modulation_efficiency == 0 {
            return 0;
        }
        (vol_pkt as u64 * self.packet_bit_length() as u64
            / self.modulation_efficiency as u64) as VolSym
    }

    /// Kilobits to whole packets.
    pub fn kbits_to_pkt(&self, vol_kb: VolKb) -> VolPkt {
        let length_b = self.packet_bit_length() as u64;
        if length_b == 0 {
            return 0;
        }
        (vol_kb as u64 * 1000 / length_b) as VolPkt
    }

    /// Packets to kilobits (rounded down).
    pub fn pkt_to_kbits(&self, vol_pkt: VolPkt) -> VolKb {
        (vol_pkt as u64 * self.packet_bit_length() as u64 / 1000) as VolKb
    }

    /// Packets per frame to symbols per second.
    pub fn pktpf_to_symps(&self, rate_pktpf: RatePktpf) -> RateSymps {
        self.pf_to_ps(self.pkt_to_sym(rate_pktpf))
    }

    /// Any per-frame quantity to the equivalent per-second quantity.
    pub fn pf_to_ps(&self, per_frame: u32) -> u32 {
        let frame_ms = self.frame_ms();
        if frame_ms == 0 {
            return 0;
        }
        (per_frame as u64 * 1000 / frame_ms) as u32
    }

    /// Per-second back to per-frame.
    pub fn ps_to_pf(&self, per_second: u32) -> u32 {
        (per_second as u64 * self.frame_ms() / 1000) as u32
    }

    /// Bits to kilobits, rounded up (a partial kilobit still needs capacity).
    pub fn b_to_kb_ceil(vol_b: VolB) -> VolKb {
        vol_b.div_ceil(1000) as VolKb
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn converter() -> UnitConverter {
        // 53 ms frames, 536 symbol bursts, QPSK
        let mut c = UnitConverter::fixed_symbol_length(
            Duration::from_millis(53),
            536,
        );
        c.set_modulation_efficiency(2);
        c
    }

    #[test]
    fn packet_length_follows_modulation() {
        let mut c = converter();
        assert_eq!(c.packet_bit_length(), 1072);
        assert_eq!(c.packet_symbol_length(), 536);
        c.set_modulation_efficiency(3);
        assert_eq!(c.packet_bit_length(), 1608);
    }

    #[test]
    fn kbps_pktpf_roundtrip_quantises_down() {
        let c = converter();
        for rate in [0u32, 100, 1000, 2048, 16320] {
            let pktpf = c.kbps_to_pktpf(rate);
            let back = c.pktpf_to_kbps(pktpf);
            assert!(back <= rate, "{back} > {rate}");
            // quantised value maps back to the same timeslot count
            assert_eq!(c.kbps_to_pktpf(back), pktpf);
        }
    }

    #[test]
    fn sym_pkt_conversions() {
        let c = converter();
        assert_eq!(c.sym_to_pkt(536), 1);
        assert_eq!(c.sym_to_pkt(535), 0);
        assert_eq!(c.pkt_to_sym(3), 1608);
        assert_eq!(c.sym_to_pkt(c.pkt_to_sym(7)), 7);
    }

    #[test]
    fn per_frame_per_second() {
        let c = UnitConverter::fixed_bit_length(
            Duration::from_millis(50),
            1000,
        );
        assert_eq!(c.pf_to_ps(5), 100);
        assert_eq!(c.ps_to_pf(100), 5);
    }

    #[test]
    fn fixed_bit_length_ignores_modulation_for_bits() {
        let mut c = UnitConverter::fixed_bit_length(
            Duration::from_millis(50),
            8 * 188,
        );
        c.set_modulation_efficiency(4);
        assert_eq!(c.packet_bit_length(), 8 * 188);
        assert_eq!(c.packet_symbol_length(), 8 * 188 / 4);
    }

    #[test]
    fn kb_ceil() {
        assert_eq!(UnitConverter::b_to_kb_ceil(0), 0);
        assert_eq!(UnitConverter::b_to_kb_ceil(1), 1);
        assert_eq!(UnitConverter::b_to_kb_ceil(1000), 1);
        assert_eq!(UnitConverter::b_to_kb_ceil(1001), 2);
    }
}
