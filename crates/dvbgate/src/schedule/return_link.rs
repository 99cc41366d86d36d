//! DVB-RCS2 return-link scheduling.
//!
//! Runs on the terminal each frame: MAC FIFOs are drained in priority order
//! into fixed-length bursts until the allocation granted by the last TTP is
//! spent. The walk is an explicit state machine; a partial encapsulation
//! puts the remainder back at the FIFO front so nothing is lost between
//! frames.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::carrier::AccessType;
use crate::encap::{NetPacket, PacketHandler};
use crate::fifo::MacFifo;
use crate::frame::{DvbFrame, DvbRcs2Frame};
use crate::schedule::ScheduleError;
use crate::{TimeSf, VolB};

/// Upper bound of a DVB-RCS2 frame on the wire, in bytes.
pub const DVB_RCS2_FRAME_MAX_BYTES: usize = 1208;

/// Grants are bounded by the TTP assignment-count field.
const MAX_ALLOCATION_B: VolB = (u16::MAX as VolB + 1) * 1000;

enum State {
    NextFifo,
    NextPacket,
    GetChunk(NetPacket),
    FinalizeFrame,
    End,
}

pub struct ReturnScheduling {
    packet_handler: Arc<dyn PacketHandler>,
    /// Burst payload in bits, set each frame from the MODCOD in effect.
    max_burst_length_b: u32,
}

impl ReturnScheduling {
    pub fn new(packet_handler: Arc<dyn PacketHandler>) -> Self {
        ReturnScheduling { packet_handler, max_burst_length_b: 0 }
    }

    pub fn max_burst_length_b(&self) -> u32 {
        self.max_burst_length_b
    }

    pub fn set_max_burst_length_b(&mut self, length_b: u32) {
        self.max_burst_length_b = length_b;
        debug!(
            burst_b = length_b,
            burst_bytes = length_b >> 3,
            "return frame max burst length"
        );
    }

    /// Drain the FIFOs into DVB-RCS2 frames within `remaining_allocation_b`
    /// bits. The spent budget is subtracted in place.
    pub fn schedule(
        &mut self,
        superframe_sf: TimeSf,
        fifos: &mut [MacFifo],
        complete: &mut Vec<DvbFrame>,
        remaining_allocation_b: &mut VolB,
    ) -> Result<(), ScheduleError> {
        if *remaining_allocation_b > MAX_ALLOCATION_B {
            info!(
                allocation_b = *remaining_allocation_b,
                "allocation exceeds the grant field, truncated"
            );
            *remaining_allocation_b = MAX_ALLOCATION_B;
        }
        if self.max_burst_length_b == 0 {
            info!("burst length does not allow sending data");
            return Ok(());
        }

        let mut fifo_order: Vec<usize> = (0..fifos.len()).collect();
        fifo_order.sort_by_key(|&i| fifos[i].priority());

        let max_size_bytes =
            ((self.max_burst_length_b >> 3) as usize)
                .min(DVB_RCS2_FRAME_MAX_BYTES);
        let mut frame = DvbRcs2Frame::new(max_size_bytes);
        let mut frame_length_b: VolB = 0;
        let mut sent_packets = 0u32;
        let mut complete_count = 0u32;

        let mut order = fifo_order.iter();
        let mut current: Option<usize> = None;
        let mut state = State::NextFifo;

        loop {
            state = match state {
                State::NextFifo => match order.next() {
                    None => State::End,
                    Some(&idx) => {
                        if fifos[idx].access_type() == AccessType::Saloha {
                            debug!(
                                fifo = fifos[idx].name(),
                                "random access FIFO, not scheduled here"
                            );
                            State::NextFifo
                        } else {
                            current = Some(idx);
                            State::NextPacket
                        }
                    }
                },

                State::NextPacket => {
                    let idx = current.expect("a FIFO is being drained");
                    match fifos[idx].pop() {
                        None => State::NextFifo,
                        Some(packet) => State::GetChunk(packet),
                    }
                }

                State::GetChunk(packet) => {
                    let idx = current.expect("a FIFO is being drained");
                    match self.packet_handler.encap_next_packet(
                        packet,
                        frame.free_space_bytes(),
                        frame.packets.is_empty(),
                    ) {
                        Err(error) => {
                            warn!(
                                sf = superframe_sf,
                                %error,
                                "encapsulation failed, packet dropped"
                            );
                            State::NextPacket
                        }
                        Ok((chunk, remainder)) => {
                            if let Some(rest) = remainder {
                                fifos[idx].push_front(rest);
                            }
                            match chunk {
                                Some(data) => {
                                    let len_b = data.len_bits();
                                    if !frame.add_packet(data) {
                                        return Err(
                                            ScheduleError::FrameOverflow,
                                        );
                                    }
                                    frame_length_b += len_b;
                                    sent_packets += 1;

                                    if frame.free_space_bytes() == 0
                                        || *remaining_allocation_b
                                            <= frame_length_b
                                    {
                                        State::FinalizeFrame
                                    } else {
                                        State::NextPacket
                                    }
                                }
                                None => State::FinalizeFrame,
                            }
                        }
                    }
                }

                State::FinalizeFrame => {
                    if frame.packets.is_empty() {
                        warn!(
                            sf = superframe_sf,
                            free_bytes = frame.free_space_bytes(),
                            "finalising an empty return frame"
                        );
                        return Err(ScheduleError::EmptyFrame);
                    }
                    complete.push(DvbFrame::DvbBurst(std::mem::replace(
                        &mut frame,
                        DvbRcs2Frame::new(max_size_bytes),
                    )));
                    complete_count += 1;
                    *remaining_allocation_b =
                        remaining_allocation_b.saturating_sub(frame_length_b);
                    frame_length_b = 0;

                    if *remaining_allocation_b == 0 {
                        State::End
                    } else {
                        State::NextPacket
                    }
                }

                State::End => break,
            }
        }

        // a started frame still goes out, the grant covers it
        if !frame.packets.is_empty() {
            *remaining_allocation_b =
                remaining_allocation_b.saturating_sub(frame_length_b);
            complete.push(DvbFrame::DvbBurst(frame));
            complete_count += 1;
        }

        info!(
            sf = superframe_sf,
            packets = sent_packets,
            frames = complete_count,
            remaining_kb = *remaining_allocation_b / 1000,
            "return scheduling done"
        );
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::encap::BasicHandler;
    use crate::fifo::test_packet;

    fn fifos() -> Vec<MacFifo> {
        vec![
            MacFifo::new("EF", 0, 0, AccessType::DamaRbdc, 100),
            MacFifo::new("BE", 1, 1, AccessType::DamaVbdc, 100),
        ]
    }

    fn scheduler(burst_b: u32) -> ReturnScheduling {
        let mut sched = ReturnScheduling::new(Arc::new(BasicHandler));
        sched.set_max_burst_length_b(burst_b);
        sched
    }

    #[test]
    fn drains_in_priority_order_within_budget() {
        let mut sched = scheduler(8 * 200);
        let mut fifos = fifos();
        fifos[1].push(NetPacket::new(0, 1, 1, vec![0; 100])).unwrap();
        fifos[0].push(NetPacket::new(0, 1, 0, vec![0; 100])).unwrap();

        // budget for roughly one frame
        let mut allocation_b: VolB = 8 * 150;
        let mut complete = Vec::new();
        sched
            .schedule(0, &mut fifos, &mut complete, &mut allocation_b)
            .unwrap();

        assert_eq!(complete.len(), 1);
        match &complete[0] {
            DvbFrame::DvbBurst(frame) => {
                // the EF packet went first
                assert_eq!(frame.packets[0].qos, 0);
            }
            other => panic!("expected a return frame, got {other:?}"),
        }
        // BE data still queued for the next grant
        assert!(
            fifos[0].current_size_pkt() + fifos[1].current_size_pkt() > 0
        );
    }

    #[test]
    fn zero_burst_length_sends_nothing() {
        let mut sched = scheduler(0);
        let mut fifos = fifos();
        fifos[0].push(test_packet(1, 100)).unwrap();

        let mut allocation_b: VolB = 100_000;
        let mut complete = Vec::new();
        sched
            .schedule(0, &mut fifos, &mut complete, &mut allocation_b)
            .unwrap();
        assert!(complete.is_empty());
        assert_eq!(fifos[0].current_size_pkt(), 1);
    }

    #[test]
    fn saloha_fifos_are_skipped() {
        let mut sched = scheduler(8 * 200);
        let mut fifos =
            vec![MacFifo::new("RA", 0, 0, AccessType::Saloha, 100)];
        fifos[0].push(test_packet(1, 50)).unwrap();

        let mut allocation_b: VolB = 100_000;
        let mut complete = Vec::new();
        sched
            .schedule(0, &mut fifos, &mut complete, &mut allocation_b)
            .unwrap();
        assert!(complete.is_empty());
        assert_eq!(fifos[0].current_size_pkt(), 1);
    }

    #[test]
    fn long_packet_spans_several_frames() {
        // 64-byte bursts, one 200-byte packet
        let mut sched = scheduler(8 * 64);
        let mut fifos = fifos();
        fifos[0].push(test_packet(1, 200)).unwrap();

        let mut allocation_b: VolB = 100_000;
        let mut complete = Vec::new();
        sched
            .schedule(0, &mut fifos, &mut complete, &mut allocation_b)
            .unwrap();

        // 200 bytes + 3-byte headers over 64-byte frames
        assert_eq!(complete.len(), 4);
        let chunks: Vec<NetPacket> = complete
            .iter()
            .flat_map(|f| match f {
                DvbFrame::DvbBurst(frame) => frame.packets.clone(),
                _ => vec![],
            })
            .collect();
        let rebuilt = BasicHandler
            .encapsulated_packets(&chunks, false)
            .unwrap();
        assert_eq!(rebuilt.len(), 1);
        assert_eq!(rebuilt[0].data.len(), 200);
    }

    #[test]
    fn budget_is_consumed() {
        let mut sched = scheduler(8 * 1000);
        let mut fifos = fifos();
        for _ in 0..10 {
            fifos[0].push(test_packet(1, 97)).unwrap();
        }

        let mut allocation_b: VolB = 8 * 500;
        let mut complete = Vec::new();
        sched
            .schedule(0, &mut fifos, &mut complete, &mut allocation_b)
            .unwrap();

        assert_eq!(allocation_b, 0);
        // 5 packets of 100 encoded bytes fit the 500-byte budget
        assert_eq!(fifos[0].current_size_pkt(), 5);
    }
}
