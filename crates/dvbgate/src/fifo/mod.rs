//! MAC FIFOs: per-QoS queues between the encapsulation layer and the
//! schedulers.
//!
//! A FIFO owns its packets. Producers enqueue through a non-blocking
//! [`MacFifo::push`] which refuses (and drops) when the queue is full; the
//! scheduler pops from the front and may push a remainder back after a
//! partial encapsulation. Byte counters distinguish total backlog from
//! arrivals since the last capacity request, which is what the RBDC
//! computation feeds on.

pub mod delay;

use std::collections::VecDeque;

use thiserror::Error;
use tracing::debug;

use crate::carrier::AccessType;
use crate::encap::NetPacket;
use crate::{Qos, TalId, VolBytes, VolPkt};

#[derive(Debug, Error)]
#[error("MAC FIFO {name} full ({max_size_pkt} packets), packet dropped")]
pub struct FifoFull {
    pub name: String,
    pub max_size_pkt: VolPkt,
}

/// Counters exposed to the statistics period.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FifoStats {
    pub current_pkt: VolPkt,
    pub current_bytes: VolBytes,
    pub in_pkt: VolPkt,
    pub in_bytes: VolBytes,
    pub out_pkt: VolPkt,
    pub out_bytes: VolBytes,
    pub drop_pkt: VolPkt,
    pub drop_bytes: VolBytes,
}

#[derive(Debug)]
pub struct MacFifo {
    name: String,
    qos: Qos,
    priority: u8,
    access_type: AccessType,
    max_size_pkt: VolPkt,
    queue: VecDeque<NetPacket>,
    current_bytes: VolBytes,
    /// Bytes arrived since the last capacity request was built.
    new_bytes: VolBytes,
    stats: FifoStats,
}

impl MacFifo {
    pub fn new(
        name: &str,
        qos: Qos,
        priority: u8,
        access_type: AccessType,
        max_size_pkt: VolPkt,
    ) -> Self {
        MacFifo {
            name: name.to_string(),
            qos,
            priority,
            access_type,
            max_size_pkt,
            queue: VecDeque::new(),
            current_bytes: 0,
            new_bytes: 0,
            stats: FifoStats::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn qos(&self) -> Qos {
        self.qos
    }

    pub fn priority(&self) -> u8 {
        self.priority
    }

    pub fn access_type(&self) -> AccessType {
        self.access_type
    }

    /// VCM sub-carrier index this FIFO may emit on, if any.
    pub fn vcm_id(&self) -> Option<u8> {
        match self.access_type {
            AccessType::Vcm(id) => Some(id),
            _ => None,
        }
    }

    pub fn max_size_pkt(&self) -> VolPkt {
        self.max_size_pkt
    }

    pub fn current_size_pkt(&self) -> VolPkt {
        self.queue.len() as VolPkt
    }

    pub fn current_data_bytes(&self) -> VolBytes {
        self.current_bytes
    }

    pub fn new_data_bytes(&self) -> VolBytes {
        self.new_bytes
    }

    /// Forget arrivals accounted so far; called right after a capacity
    /// request was emitted for this FIFO's access type.
    pub fn reset_new(&mut self) {
        self.new_bytes = 0;
    }

    /// Enqueue a packet; on overflow the packet is dropped and counted.
    pub fn push(&mut self, packet: NetPacket) -> Result<(), FifoFull> {
        if self.queue.len() as VolPkt >= self.max_size_pkt {
            self.stats.drop_pkt += 1;
            self.stats.drop_bytes += packet.len_bytes() as VolBytes;
            debug!(fifo = %self.name, "overflow, packet dropped");
            return Err(FifoFull {
                name: self.name.clone(),
                max_size_pkt: self.max_size_pkt,
            });
        }
        let len = packet.len_bytes() as VolBytes;
        self.current_bytes += len;
        self.new_bytes += len;
        self.stats.in_pkt += 1;
        self.stats.in_bytes += len;
        self.queue.push_back(packet);
        Ok(())
    }

    pub fn pop(&mut self) -> Option<NetPacket> {
        let packet = self.queue.pop_front()?;
        let len = packet.len_bytes() as VolBytes;
        self.current_bytes -= len;
        self.stats.out_pkt += 1;
        self.stats.out_bytes += len;
        Some(packet)
    }

    /// Put a packet back at the front (remainder of a partial
    /// encapsulation); not an arrival, so `new_bytes` is left alone.
    pub fn push_front(&mut self, packet: NetPacket) {
        self.current_bytes += packet.len_bytes() as VolBytes;
        self.queue.push_front(packet);
    }

    pub fn front(&self) -> Option<&NetPacket> {
        self.queue.front()
    }

    /// Replace the first packet matching `pred` with `replace(packet)`,
    /// fixing the byte accounting by the length difference. Returns the
    /// signed delta in bytes when a replacement happened.
    pub fn replace_first_where(
        &mut self,
        pred: impl Fn(&NetPacket) -> bool,
        replace: impl FnOnce(NetPacket) -> NetPacket,
    ) -> Option<i64> {
        let pos = self.queue.iter().position(pred)?;
        let packet = self.queue.remove(pos)?;
        let old_len = packet.len_bytes() as i64;
        let packet = replace(packet);
        let delta = packet.len_bytes() as i64 - old_len;
        self.current_bytes = (self.current_bytes as i64 + delta) as VolBytes;
        self.queue.insert(pos, packet);
        Some(delta)
    }

    pub fn iter(&self) -> impl Iterator<Item = &NetPacket> {
        self.queue.iter()
    }

    /// Snapshot and reset the periodic counters; current sizes are
    /// preserved.
    pub fn take_stats(&mut self) -> FifoStats {
        let mut stats = self.stats;
        stats.current_pkt = self.current_size_pkt();
        stats.current_bytes = self.current_bytes;
        self.stats = FifoStats::default();
        stats
    }

    /// Sum of queued bytes over the FIFOs with the given access type.
    pub fn data_bytes_for_access(
        fifos: &[MacFifo],
        access_type: AccessType,
    ) -> VolBytes {
        fifos
            .iter()
            .filter(|fifo| fifo.access_type == access_type)
            .map(|fifo| fifo.current_bytes)
            .sum()
    }

    /// Sum of newly arrived bytes over the FIFOs with the given access type.
    pub fn new_bytes_for_access(
        fifos: &[MacFifo],
        access_type: AccessType,
    ) -> VolBytes {
        fifos
            .iter()
            .filter(|fifo| fifo.access_type == access_type)
            .map(|fifo| fifo.new_bytes)
            .sum()
    }
}

/// A packet destined to a terminal, used by tests and the emulator.
pub fn test_packet(dst_tal_id: TalId, len: usize) -> NetPacket {
    NetPacket::new(0, dst_tal_id, 0, vec![0u8; len])
}

#[cfg(test)]
mod test {
    use super::*;

    fn fifo() -> MacFifo {
        MacFifo::new("EF", 0, 0, AccessType::DamaRbdc, 3)
    }

    #[test]
    fn bounded_push_drops_on_overflow() {
        let mut fifo = fifo();
        for _ in 0..3 {
            assert!(fifo.push(test_packet(1, 100)).is_ok());
        }
        assert!(fifo.push(test_packet(1, 100)).is_err());
        assert_eq!(fifo.current_size_pkt(), 3);

        let stats = fifo.take_stats();
        assert_eq!(stats.in_pkt, 3);
        assert_eq!(stats.drop_pkt, 1);
        assert_eq!(stats.drop_bytes, 100);
    }

    #[test]
    fn new_bytes_reset_independently_of_backlog() {
        let mut fifo = fifo();
        fifo.push(test_packet(1, 100)).unwrap();
        fifo.push(test_packet(1, 50)).unwrap();
        assert_eq!(fifo.new_data_bytes(), 150);
        assert_eq!(fifo.current_data_bytes(), 150);

        fifo.reset_new();
        assert_eq!(fifo.new_data_bytes(), 0);
        assert_eq!(fifo.current_data_bytes(), 150);

        fifo.push(test_packet(1, 25)).unwrap();
        assert_eq!(fifo.new_data_bytes(), 25);
    }

    #[test]
    fn push_front_is_not_an_arrival() {
        let mut fifo = fifo();
        fifo.push(test_packet(1, 100)).unwrap();
        fifo.reset_new();

        let packet = fifo.pop().unwrap();
        assert_eq!(fifo.current_data_bytes(), 0);
        fifo.push_front(packet);
        assert_eq!(fifo.current_data_bytes(), 100);
        assert_eq!(fifo.new_data_bytes(), 0);
    }

    #[test]
    fn replace_adjusts_byte_accounting() {
        let mut fifo = fifo();
        fifo.push(test_packet(1, 10)).unwrap();
        fifo.push(test_packet(2, 10)).unwrap();

        let delta = fifo.replace_first_where(
            |p| p.dst_tal_id == 2,
            |mut p| {
                p.data.extend_from_slice(&[0; 8]);
                p
            },
        );
        assert_eq!(delta, Some(8));
        assert_eq!(fifo.current_data_bytes(), 28);

        let missing =
            fifo.replace_first_where(|p| p.dst_tal_id == 9, |p| p);
        assert!(missing.is_none());
    }

    #[test]
    fn access_type_sums() {
        let mut fifos = vec![
            MacFifo::new("EF", 0, 0, AccessType::DamaRbdc, 10),
            MacFifo::new("BE", 1, 1, AccessType::DamaVbdc, 10),
        ];
        fifos[0].push(test_packet(1, 100)).unwrap();
        fifos[1].push(test_packet(1, 40)).unwrap();

        assert_eq!(
            MacFifo::data_bytes_for_access(&fifos, AccessType::DamaRbdc),
            100
        );
        assert_eq!(
            MacFifo::data_bytes_for_access(&fifos, AccessType::DamaVbdc),
            40
        );
    }
}
