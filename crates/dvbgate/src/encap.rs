//! Encapsulation packet contract.
//!
//! The schedulers never look inside upper-layer packets; they hand them to a
//! [`PacketHandler`] which encodes as much as fits in the frame free space
//! and returns the remainder, if any. [`BasicHandler`] is a self-contained
//! length-prefixed implementation used by the emulator and the tests; real
//! deployments plug their own (GSE, MPEG2-TS, ...).

use serde::Serialize;
use thiserror::Error;

use crate::{Qos, TalId};

#[derive(Debug, Error)]
pub enum EncapError {
    #[error("encapsulation returned neither a chunk nor a remainder")]
    NoOutput,
    #[error("truncated encapsulation header")]
    Truncated,
    #[error("interleaved fragments for terminal {0}")]
    Interleaved(TalId),
}

/// An upper-layer packet travelling through the MAC layer.
///
/// The payload is opaque. Ownership follows the packet: producers hand it to
/// a MAC FIFO, the scheduler takes it to encode, and either returns a
/// remainder to the FIFO front or moves the encoded chunk into the frame
/// being built.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NetPacket {
    pub src_tal_id: TalId,
    pub dst_tal_id: TalId,
    pub qos: Qos,
    pub data: Vec<u8>,
    /// C/N+I value piggybacked on the packet (SCPC inline reporting).
    pub cni_ext: Option<f64>,
    /// Tail of a packet already partially encoded in an earlier frame.
    pub fragment: bool,
}

impl NetPacket {
    pub fn new(
        src_tal_id: TalId,
        dst_tal_id: TalId,
        qos: Qos,
        data: Vec<u8>,
    ) -> Self {
        NetPacket {
            src_tal_id,
            dst_tal_id,
            qos,
            data,
            cni_ext: None,
            fragment: false,
        }
    }

    pub fn len_bytes(&self) -> usize {
        self.data.len()
    }

    pub fn len_bits(&self) -> u64 {
        (self.len_bytes() as u64) << 3
    }
}

/// Bytes added to a packet by the inline C/N+I extension.
pub const CNI_EXT_BYTES: usize = 8;

/// One encoding step: the chunk that fit, and what is left of the packet.
pub type EncapStep = (Option<NetPacket>, Option<NetPacket>);

pub trait PacketHandler: Send + Sync {
    fn name(&self) -> &str;

    /// Constant packet length in bits, 0 for variable-length encapsulation.
    fn fixed_length_bits(&self) -> u32;

    /// Encode as much of `packet` as fits within `free_space_bytes`.
    ///
    /// Returns the encoded chunk (when anything fit) and the remainder (when
    /// the packet was split or nothing fit). Returning neither is a contract
    /// violation reported as [`EncapError::NoOutput`].
    fn encap_next_packet(
        &self,
        packet: NetPacket,
        free_space_bytes: usize,
        is_first_in_frame: bool,
    ) -> Result<EncapStep, EncapError>;

    /// Reverse operation: rebuild upper-layer packets from the chunks of a
    /// received frame. `partial` allows an unterminated trailing fragment.
    fn encapsulated_packets(
        &self,
        chunks: &[NetPacket],
        partial: bool,
    ) -> Result<Vec<NetPacket>, EncapError>;

    /// Attach the inline C/N+I extension to a packet, growing it by
    /// [`CNI_EXT_BYTES`].
    fn with_cni_extension(&self, mut packet: NetPacket, cni_db: f64) -> NetPacket {
        packet.cni_ext = Some(cni_db);
        packet.data.extend_from_slice(&cni_db.to_be_bytes());
        packet
    }
}

const HEADER_BYTES: usize = 3;
const FLAG_START: u8 = 0x01;
const FLAG_END: u8 = 0x02;

/// Length-prefixed encapsulation with two-flag fragmentation.
///
/// Chunk layout: one flag byte (start/end of the original packet) followed by
/// a big-endian 16-bit fragment length, then the fragment bytes.
#[derive(Debug, Default)]
pub struct BasicHandler;

impl PacketHandler for BasicHandler {
    fn name(&self) -> &str {
        "basic"
    }

    fn fixed_length_bits(&self) -> u32 {
        0
    }

    fn encap_next_packet(
        &self,
        packet: NetPacket,
        free_space_bytes: usize,
        _is_first_in_frame: bool,
    ) -> Result<EncapStep, EncapError> {
        // nothing useful fits in less than a header plus one byte
        if free_space_bytes <= HEADER_BYTES {
            return Ok((None, Some(packet)));
        }

        let room = free_space_bytes - HEADER_BYTES;
        let payload_len = packet.data.len();
        let fragment_len = payload_len.min(room).min(u16::MAX as usize);
        let complete = fragment_len == payload_len;

        let mut flags = if packet.fragment { 0 } else { FLAG_START };
        if complete {
            flags |= FLAG_END;
        }
        let mut data = Vec::with_capacity(HEADER_BYTES + fragment_len);
        data.push(flags);
        data.extend_from_slice(&(fragment_len as u16).to_be_bytes());
        data.extend_from_slice(&packet.data[..fragment_len]);

        let chunk = NetPacket::new(
            packet.src_tal_id,
            packet.dst_tal_id,
            packet.qos,
            data,
        );

        let remainder = if complete {
            None
        } else {
            let mut rest = packet;
            rest.data.drain(..fragment_len);
            rest.fragment = true;
            Some(rest)
        };

        Ok((Some(chunk), remainder))
    }

    fn encapsulated_packets(
        &self,
        chunks: &[NetPacket],
        partial: bool,
    ) -> Result<Vec<NetPacket>, EncapError> {
        let mut packets = Vec::new();
        let mut pending: Option<NetPacket> = None;

        for chunk in chunks {
            if chunk.data.len() < HEADER_BYTES {
                return Err(EncapError::Truncated);
            }
            let flags = chunk.data[0];
            let len = u16::from_be_bytes([chunk.data[1], chunk.data[2]])
                as usize;
            if chunk.data.len() < HEADER_BYTES + len {
                return Err(EncapError::Truncated);
            }
            let fragment = &chunk.data[HEADER_BYTES..HEADER_BYTES + len];

            if flags & FLAG_START != 0 {
                if pending.is_some() {
                    return Err(EncapError::Interleaved(chunk.dst_tal_id));
                }
                pending = Some(NetPacket::new(
                    chunk.src_tal_id,
                    chunk.dst_tal_id,
                    chunk.qos,
                    fragment.to_vec(),
                ));
            } else {
                match pending.as_mut() {
                    Some(packet) => packet.data.extend_from_slice(fragment),
                    None => {
                        return Err(EncapError::Interleaved(chunk.dst_tal_id))
                    }
                }
            }

            if flags & FLAG_END != 0 {
                if let Some(packet) = pending.take() {
                    packets.push(packet);
                }
            }
        }

        if pending.is_some() && !partial {
            return Err(EncapError::Truncated);
        }
        Ok(packets)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn whole_packet_fits() {
        let handler = BasicHandler;
        let packet = NetPacket::new(0, 3, 1, vec![0xAA; 100]);
        let (chunk, remainder) =
            handler.encap_next_packet(packet, 1000, true).unwrap();
        let chunk = chunk.unwrap();
        assert!(remainder.is_none());
        assert_eq!(chunk.len_bytes(), 100 + HEADER_BYTES);
        assert_eq!(chunk.dst_tal_id, 3);
    }

    #[test]
    fn packet_is_split_and_reassembled() {
        let handler = BasicHandler;
        let payload: Vec<u8> = (0..200u8).collect();
        let packet = NetPacket::new(0, 3, 1, payload.clone());

        let (first, remainder) =
            handler.encap_next_packet(packet, 83, true).unwrap();
        let first = first.unwrap();
        assert_eq!(first.len_bytes(), 83);
        let remainder = remainder.unwrap();
        assert_eq!(remainder.data.len(), 120);

        let (second, rest) =
            handler.encap_next_packet(remainder, 1000, false).unwrap();
        assert!(rest.is_none());

        let packets = handler
            .encapsulated_packets(&[first, second.unwrap()], false)
            .unwrap();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].data, payload);
    }

    #[test]
    fn no_room_returns_packet_untouched() {
        let handler = BasicHandler;
        let packet = NetPacket::new(0, 3, 1, vec![1, 2, 3]);
        let (chunk, remainder) =
            handler.encap_next_packet(packet.clone(), HEADER_BYTES, true).unwrap();
        assert!(chunk.is_none());
        assert_eq!(remainder, Some(packet));
    }

    #[test]
    fn cni_extension_grows_the_packet() {
        let handler = BasicHandler;
        let packet = NetPacket::new(0, 3, 1, vec![0; 10]);
        let before = packet.len_bytes();
        let extended = handler.with_cni_extension(packet, 7.5);
        assert_eq!(extended.len_bytes(), before + CNI_EXT_BYTES);
        assert_eq!(extended.cni_ext, Some(7.5));
    }
}
