//! DVB-S2 forward-link scheduling.
//!
//! Packets leave the MAC FIFOs and are packed into BBFrames, one per MODCOD,
//! sized by the MODCOD's payload. Each carrier group is filled up to its
//! symbol capacity for the frame; a finalised BBFrame that does not fit is
//! deferred to the next invocation together with the capacity it could not
//! use (carried over through the `previous` ledger, valid one superframe
//! only).
//!
//! Carrier admission: FIFOs marked ACM emit on single sub-carrier groups,
//! VCM-marked FIFOs only on the VCM sub-carrier with their index.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::carrier::{AccessType, CarriersGroup, TerminalCategory};
use crate::encap::{NetPacket, PacketHandler};
use crate::fifo::MacFifo;
use crate::fmt::sts::StFmtList;
use crate::fmt::FmtDefinitionTable;
use crate::frame::{BbFrame, DvbFrame};
use crate::schedule::{SchedStatus, ScheduleError};
use crate::{CarrierId, FmtId, SpotId, TimeSf, VolSym, BROADCAST_TAL_ID};

pub struct ForwardScheduling {
    spot_id: SpotId,
    packet_handler: Arc<dyn PacketHandler>,
    modcod_def: Arc<FmtDefinitionTable>,
    sts: Arc<StFmtList>,
    /// BBFrames being filled, one per MODCOD, with their creation order.
    incomplete: BTreeMap<FmtId, BbFrame>,
    incomplete_order: Vec<FmtId>,
    /// Finalised BBFrames that did not fit in their carrier last time.
    pending: Vec<BbFrame>,
    /// Remainder of a partially encapsulated packet, consumed first.
    carryover: Option<NetPacket>,
}

impl ForwardScheduling {
    pub fn new(
        spot_id: SpotId,
        packet_handler: Arc<dyn PacketHandler>,
        modcod_def: Arc<FmtDefinitionTable>,
        sts: Arc<StFmtList>,
        category: &TerminalCategory,
    ) -> Self {
        check_bbframe_sizes(category, &modcod_def);
        ForwardScheduling {
            spot_id,
            packet_handler,
            modcod_def,
            sts,
            incomplete: BTreeMap::new(),
            incomplete_order: Vec::new(),
            pending: Vec::new(),
            carryover: None,
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Schedule one forward frame over every carrier group of the category.
    ///
    /// Returns the total capacity left unused, in symbols.
    pub fn schedule(
        &mut self,
        superframe_sf: TimeSf,
        fifos: &mut [MacFifo],
        category: &mut TerminalCategory,
        complete: &mut Vec<DvbFrame>,
    ) -> Result<VolSym, ScheduleError> {
        // FIFO visit order: ascending priority value, highest priority first
        let mut fifo_order: Vec<usize> = (0..fifos.len()).collect();
        fifo_order.sort_by_key(|&i| fifos[i].priority());

        for carriers in category.carriers_groups_mut() {
            let is_vcm_group = carriers.vcm_count() > 1;
            let carrier_id = carriers.id();

            for (vcm_id, vcm) in
                carriers.vcm_carriers_mut().iter_mut().enumerate()
            {
                self.schedule_carrier(
                    superframe_sf,
                    fifos,
                    &fifo_order,
                    vcm,
                    carrier_id,
                    is_vcm_group,
                    vcm_id as u8,
                    complete,
                )?;
            }
        }

        // release the per-frame ledgers: leftovers are worth exactly one
        // more frame, through the previous-capacity carry
        let mut remaining_total = 0;
        for carriers in category.carriers_groups_mut() {
            for vcm in carriers.vcm_carriers_mut() {
                let remain = vcm.remaining_capacity();
                remaining_total += remain;
                vcm.set_previous_capacity(remain, superframe_sf.wrapping_add(1));
                vcm.set_remaining_capacity(0);
            }
        }

        info!(
            sf = superframe_sf,
            frames = complete.len(),
            remaining_sym = remaining_total,
            pending = self.pending.len(),
            "forward scheduling done"
        );
        Ok(remaining_total)
    }

    #[allow(clippy::too_many_arguments)]
    fn schedule_carrier(
        &mut self,
        superframe_sf: TimeSf,
        fifos: &mut [MacFifo],
        fifo_order: &[usize],
        vcm: &mut CarriersGroup,
        carrier_id: CarrierId,
        is_vcm_group: bool,
        vcm_id: u8,
        complete: &mut Vec<DvbFrame>,
    ) -> Result<(), ScheduleError> {
        let init_capacity =
            vcm.total_capacity_sym() + vcm.remaining_capacity();
        vcm.set_remaining_capacity(init_capacity);
        let mut capacity =
            init_capacity + vcm.previous_capacity(superframe_sf);

        for &idx in fifo_order {
            let admitted = match (is_vcm_group, fifos[idx].access_type()) {
                (false, AccessType::Acm) => true,
                (true, AccessType::Vcm(id)) => id == vcm_id,
                _ => false,
            };
            if !admitted {
                debug!(
                    fifo = fifos[idx].name(),
                    carrier = carrier_id,
                    "access type does not match this carrier"
                );
                continue;
            }

            self.schedule_fifo(
                &mut fifos[idx],
                superframe_sf,
                vcm,
                carrier_id,
                &mut capacity,
                init_capacity,
                complete,
            )?;

            if fifos[idx].current_size_pkt() > 0 {
                // carrier exhausted, do not starve-check lower QoS
                break;
            }
        }

        vcm.set_previous_capacity(capacity, superframe_sf.wrapping_add(1));

        // opportunistically finalise leftovers, oldest BBFrame first
        while let Some(&modcod_id) = self.incomplete_order.first() {
            if capacity == 0 {
                break;
            }
            let frame = match self.incomplete.remove(&modcod_id) {
                Some(frame) => frame,
                None => {
                    self.incomplete_order.remove(0);
                    continue;
                }
            };
            match self.try_complete(frame, carrier_id, &mut capacity, complete)?
            {
                None => {
                    self.incomplete_order.remove(0);
                }
                Some(frame) => {
                    // back in the builder, carrier is full
                    self.incomplete.insert(modcod_id, frame);
                    vcm.set_previous_capacity(
                        capacity.min(init_capacity),
                        superframe_sf.wrapping_add(1),
                    );
                    break;
                }
            }
        }

        vcm.set_remaining_capacity(capacity.min(init_capacity));
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn schedule_fifo(
        &mut self,
        fifo: &mut MacFifo,
        superframe_sf: TimeSf,
        vcm: &mut CarriersGroup,
        carrier_id: CarrierId,
        capacity: &mut VolSym,
        init_capacity: VolSym,
        complete: &mut Vec<DvbFrame>,
    ) -> Result<(), ScheduleError> {
        if fifo.current_size_pkt() == 0
            && self.pending.is_empty()
            && self.carryover.is_none()
        {
            return Ok(());
        }

        debug!(
            sf = superframe_sf,
            fifo = fifo.name(),
            carrier = carrier_id,
            capacity_sym = *capacity,
            "scheduling FIFO on carrier group"
        );

        // deferred BBFrames first: they already consumed their packets
        self.schedule_pending(vcm, carrier_id, capacity, complete)?;

        // unused carry-over only benefits frames already under construction
        if self.incomplete.is_empty() {
            *capacity = (*capacity).min(init_capacity);
        }

        if let Some(packet) = self.carryover.take() {
            if self.schedule_packet(
                packet,
                superframe_sf,
                vcm,
                carrier_id,
                capacity,
                complete,
            )? == SchedStatus::Full
            {
                return Ok(());
            }
        }

        while let Some(packet) = fifo.pop() {
            let status = self.schedule_packet(
                packet,
                superframe_sf,
                vcm,
                carrier_id,
                capacity,
                complete,
            )?;
            if status == SchedStatus::Full {
                break;
            }
        }
        Ok(())
    }

    /// Pack one packet (and the tail of a split packet) into per-MODCOD
    /// BBFrames, finalising frames as they fill.
    fn schedule_packet(
        &mut self,
        packet: NetPacket,
        superframe_sf: TimeSf,
        vcm: &mut CarriersGroup,
        carrier_id: CarrierId,
        capacity: &mut VolSym,
        complete: &mut Vec<DvbFrame>,
    ) -> Result<SchedStatus, ScheduleError> {
        let mut current = Some(packet);

        while let Some(packet) = current.take() {
            let modcod_id = match self.modcod_for_packet(&packet, vcm) {
                Some(id) => id,
                None => continue, // dropped, already logged
            };

            if !self.incomplete.contains_key(&modcod_id) {
                let payload = self
                    .modcod_def
                    .get(modcod_id)
                    .map(|def| def.payload_bytes())
                    .unwrap_or_else(|| crate::fmt::bbframe_payload_bytes(""));
                self.incomplete.insert(modcod_id, BbFrame::new(modcod_id, payload));
                self.incomplete_order.push(modcod_id);
            }
            let frame = self
                .incomplete
                .get_mut(&modcod_id)
                .expect("frame was just inserted");

            let (chunk, remainder) = self.packet_handler.encap_next_packet(
                packet,
                frame.free_space_bytes(),
                frame.packets.is_empty(),
            )?;
            let partial = remainder.is_some();

            if let Some(chunk) = chunk {
                if !frame.add_packet(chunk) {
                    return Err(ScheduleError::FrameOverflow);
                }
            } else if frame.packets.is_empty() {
                // nothing fit in a brand new frame: undecodable packet
                warn!(
                    sf = superframe_sf,
                    modcod = modcod_id,
                    "packet larger than an empty BBFrame, dropped"
                );
                continue;
            }

            let finalise = frame.free_space_bytes() == 0 || partial;
            if finalise {
                let frame = self
                    .incomplete
                    .remove(&modcod_id)
                    .expect("frame is being finalised");
                self.incomplete_order.retain(|id| *id != modcod_id);

                match self.try_complete(frame, carrier_id, capacity, complete)?
                {
                    None => {}
                    Some(frame) => {
                        // carrier full: defer the frame, keep the capacity
                        // for the next superframe
                        vcm.set_previous_capacity(*capacity, superframe_sf.wrapping_add(1));
                        self.pending.push(frame);
                        self.carryover = remainder;
                        return Ok(SchedStatus::Full);
                    }
                }
            }

            current = remainder;
        }

        Ok(SchedStatus::Ok)
    }

    /// Resolve the MODCOD to encode a packet with on the given carrier,
    /// dropping the packet (with a log) when it has no servable destination.
    fn modcod_for_packet(
        &self,
        packet: &NetPacket,
        vcm: &CarriersGroup,
    ) -> Option<FmtId> {
        let tal_id = if packet.dst_tal_id == BROADCAST_TAL_ID {
            // lowest MODCOD so every terminal can decode the frame
            match self.sts.tal_id_with_lowest_modcod() {
                Some(id) => id,
                None => {
                    warn!("no terminal to carry broadcast traffic, dropped");
                    return None;
                }
            }
        } else {
            packet.dst_tal_id
        };

        if !self.sts.is_present(tal_id) {
            warn!(tal_id, "packet for an unregistered terminal, dropped");
            return None;
        }
        let desired = self.sts.current_modcod(tal_id);
        if desired == 0 {
            debug!(tal_id, "terminal has no usable MODCOD, packet dropped");
            return None;
        }
        let modcod_id = vcm.nearest_fmt(desired);
        if modcod_id == 0 {
            warn!(
                tal_id,
                desired,
                carrier = vcm.id(),
                "no MODCOD can serve this terminal on the carrier"
            );
            return None;
        }
        Some(modcod_id)
    }

    /// Re-probe deferred BBFrames against this carrier's MODCOD set.
    fn schedule_pending(
        &mut self,
        vcm: &CarriersGroup,
        carrier_id: CarrierId,
        capacity: &mut VolSym,
        complete: &mut Vec<DvbFrame>,
    ) -> Result<(), ScheduleError> {
        if self.pending.is_empty() {
            return Ok(());
        }

        let mut still_pending = Vec::new();
        for frame in std::mem::take(&mut self.pending) {
            if !vcm.fmt_group().contains(frame.modcod_id) {
                still_pending.push(frame);
                continue;
            }
            if let Some(frame) =
                self.try_complete(frame, carrier_id, capacity, complete)?
            {
                still_pending.push(frame);
            }
        }
        if !still_pending.is_empty() {
            info!(
                kept = still_pending.len(),
                "deferred BBFrames still waiting for capacity"
            );
        }
        self.pending = still_pending;
        Ok(())
    }

    /// Emit `frame` if its symbol cost fits in `capacity`; hand it back
    /// otherwise.
    fn try_complete(
        &self,
        mut frame: BbFrame,
        carrier_id: CarrierId,
        capacity: &mut VolSym,
        complete: &mut Vec<DvbFrame>,
    ) -> Result<Option<BbFrame>, ScheduleError> {
        let size_sym =
            bbframe_size_sym(&self.modcod_def, frame.modcod_id, frame.max_size_bytes)?;

        if *capacity < size_sym {
            info!(
                capacity_sym = *capacity,
                frame_sym = size_sym,
                modcod = frame.modcod_id,
                "not enough capacity for the BBFrame"
            );
            return Ok(Some(frame));
        }

        *capacity -= size_sym;
        frame.header.spot_id = self.spot_id;
        frame.header.carrier_id = carrier_id;
        complete.push(DvbFrame::BbFrame(frame));
        Ok(None)
    }
}

/// Symbol cost of a BBFrame: its full payload over the MODCOD's spectral
/// efficiency, rounded down.
pub fn bbframe_size_sym(
    modcod_def: &FmtDefinitionTable,
    modcod_id: FmtId,
    size_bytes: usize,
) -> Result<VolSym, ScheduleError> {
    let def = modcod_def
        .get(modcod_id)
        .ok_or(ScheduleError::UnknownModcod(modcod_id))?;
    Ok(((size_bytes * 8) as f64 / def.spectral_efficiency) as VolSym)
}

/// Warn for every carrier too small to ever carry a BBFrame of one of its
/// advertised MODCODs.
fn check_bbframe_sizes(
    category: &TerminalCategory,
    modcod_def: &FmtDefinitionTable,
) {
    for carriers in category.carriers_groups() {
        let carrier_size_sym = carriers.total_capacity_sym()
            / carriers.carriers_number().max(1);
        for &fmt_id in carriers.fmt_group().ids() {
            let payload = match modcod_def.get(fmt_id) {
                Some(def) => def.payload_bytes(),
                None => continue,
            };
            match bbframe_size_sym(modcod_def, fmt_id, payload) {
                Ok(size) if size > carrier_size_sym => warn!(
                    category = category.label(),
                    carrier = carriers.id(),
                    modcod = fmt_id,
                    frame_sym = size,
                    carrier_sym = carrier_size_sym,
                    "BBFrame larger than the carrier, this MODCOD will not work"
                ),
                _ => {}
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::encap::BasicHandler;
    use crate::fifo::test_packet;
    use crate::fmt::{FmtGroup, S2_MODCODS};

    fn category(carrier_capacity_sym: VolSym) -> TerminalCategory {
        let mut category = TerminalCategory::new("Standard");
        let mut carriers = CarriersGroup::new(
            1,
            FmtGroup::new(vec![4, 7, 10, 11, 12, 14]),
            10,
            4_000_000,
            AccessType::Acm,
        );
        carriers.set_capacity_sym(carrier_capacity_sym);
        category.add_carriers_group(carriers);
        category
    }

    fn scheduler(
        sts: Arc<StFmtList>,
        category: &TerminalCategory,
    ) -> ForwardScheduling {
        ForwardScheduling::new(
            1,
            Arc::new(BasicHandler),
            Arc::new(S2_MODCODS.clone()),
            sts,
            category,
        )
    }

    fn acm_fifo() -> MacFifo {
        MacFifo::new("EF", 0, 0, AccessType::Acm, 1000)
    }

    #[test]
    fn lone_packet_leaves_in_a_padded_bbframe() {
        let sts = Arc::new(StFmtList::new());
        sts.add_terminal(3, 20.0, &S2_MODCODS);
        let mut category = category(200_000);
        let mut sched = scheduler(sts, &category);

        let mut fifos = vec![acm_fifo()];
        fifos[0].push(test_packet(3, 500)).unwrap();

        let mut complete = Vec::new();
        let remaining = sched
            .schedule(0, &mut fifos, &mut category, &mut complete)
            .unwrap();

        // the half-empty frame is finalised once the FIFOs are drained,
        // and it costs its full payload in symbols
        assert_eq!(complete.len(), 1);
        assert!(sched.incomplete.is_empty());
        assert_eq!(fifos[0].current_size_pkt(), 0);
        assert!(remaining < 200_000);
    }

    #[test]
    fn full_bbframe_is_emitted() {
        let sts = Arc::new(StFmtList::new());
        sts.add_terminal(3, 20.0, &S2_MODCODS); // MODCOD 28, payload 7274
        let mut category = category(200_000);
        let mut sched = scheduler(sts, &category);

        let mut fifos = vec![acm_fifo()];
        // more than one payload worth of data
        for _ in 0..4 {
            fifos[0].push(test_packet(3, 2500)).unwrap();
        }

        let mut complete = Vec::new();
        sched
            .schedule(0, &mut fifos, &mut category, &mut complete)
            .unwrap();

        assert!(!complete.is_empty());
        match &complete[0] {
            DvbFrame::BbFrame(frame) => {
                let nearest = category.carriers_groups()[0].nearest_fmt(28);
                assert_eq!(frame.modcod_id, nearest);
                assert_eq!(frame.header.carrier_id, 1);
                assert!(frame.free_space_bytes() < 3 + 2500);
            }
            other => panic!("expected a BBFrame, got {other:?}"),
        }
    }

    #[test]
    fn oversized_bbframe_goes_pending_then_out() {
        let sts = Arc::new(StFmtList::new());
        // MODCOD 4 (QPSK 1/2): payload 4026 bytes, ~32573 symbols
        sts.add_terminal(3, 1.5, &S2_MODCODS);
        assert_eq!(sts.current_modcod(3), 4);

        let frame_sym =
            bbframe_size_sym(&S2_MODCODS, 4, 4026).unwrap();
        // carrier smaller than one BBFrame for one frame, but enough with
        // the previous-capacity carry
        let carrier_sym = frame_sym * 3 / 4;
        let mut category = category(carrier_sym);
        let mut sched = scheduler(sts, &category);

        let mut fifos = vec![acm_fifo()];
        // exactly fill MODCOD 4's payload so the frame finalises
        fifos[0].push(test_packet(3, 4026 - 3)).unwrap();

        let mut complete = Vec::new();
        sched
            .schedule(0, &mut fifos, &mut category, &mut complete)
            .unwrap();
        assert!(complete.is_empty());
        assert_eq!(sched.pending_count(), 1);
        // the unused capacity was carried over to superframe 1
        assert_eq!(
            category.carriers_groups()[0].previous_capacity(1),
            carrier_sym
        );

        // next superframe: carry + fresh capacity fit the pending frame
        let mut complete = Vec::new();
        sched
            .schedule(1, &mut fifos, &mut category, &mut complete)
            .unwrap();
        assert_eq!(complete.len(), 1);
        assert_eq!(sched.pending_count(), 0);
        // leftover clamped to at most one frame of headroom
        let leftover = 2 * carrier_sym - frame_sym;
        assert_eq!(
            category.carriers_groups()[0].previous_capacity(2),
            leftover.min(carrier_sym)
        );
    }

    #[test]
    fn broadcast_uses_lowest_modcod() {
        let sts = Arc::new(StFmtList::new());
        sts.add_terminal(1, 20.0, &S2_MODCODS); // 28
        sts.add_terminal(2, 6.5, &S2_MODCODS); // 10
        sts.add_terminal(4, 12.0, &S2_MODCODS); // 22
        let mut category = category(500_000);
        let mut sched = scheduler(sts, &category);

        let mut fifos = vec![acm_fifo()];
        for _ in 0..4 {
            fifos[0]
                .push(test_packet(BROADCAST_TAL_ID, 2000))
                .unwrap();
        }

        let mut complete = Vec::new();
        sched
            .schedule(0, &mut fifos, &mut category, &mut complete)
            .unwrap();

        let modcods: Vec<FmtId> = complete
            .iter()
            .filter_map(|f| match f {
                DvbFrame::BbFrame(frame) => Some(frame.modcod_id),
                _ => None,
            })
            .collect();
        assert!(!modcods.is_empty());
        // terminal 2's MODCOD (10) bounds every broadcast frame
        assert!(modcods.iter().all(|&m| m == 10));
    }

    #[test]
    fn broadcast_without_terminals_is_dropped() {
        let sts = Arc::new(StFmtList::new());
        let mut category = category(500_000);
        let mut sched = scheduler(sts, &category);

        let mut fifos = vec![acm_fifo()];
        fifos[0].push(test_packet(BROADCAST_TAL_ID, 200)).unwrap();

        let mut complete = Vec::new();
        sched
            .schedule(0, &mut fifos, &mut category, &mut complete)
            .unwrap();
        assert!(complete.is_empty());
        assert_eq!(fifos[0].current_size_pkt(), 0);
        assert_eq!(sched.incomplete.len(), 0);
    }

    #[test]
    fn vcm_fifo_is_not_admitted_on_acm_carrier() {
        let sts = Arc::new(StFmtList::new());
        sts.add_terminal(3, 20.0, &S2_MODCODS);
        let mut category = category(200_000);
        let mut sched = scheduler(sts.clone(), &category);

        let mut fifos =
            vec![MacFifo::new("BE", 1, 1, AccessType::Vcm(0), 1000)];
        fifos[0].push(test_packet(3, 500)).unwrap();

        let mut complete = Vec::new();
        sched
            .schedule(0, &mut fifos, &mut category, &mut complete)
            .unwrap();
        // the packet stayed in the FIFO
        assert_eq!(fifos[0].current_size_pkt(), 1);
    }
}
