#![doc = include_str!("../readme.md")]
pub mod carrier;
pub mod dama;
pub mod encap;
pub mod fifo;
pub mod fmt;
pub mod frame;
pub mod schedule;
pub mod units;

/// Terminal identifier. Values up to [`BROADCAST_TAL_ID`] are reserved for
/// emulated terminals, greater values for simulated ones.
pub type TalId = u16;
/// Logon group identifier carried in TTPs.
pub type GroupId = u8;
/// Spot (coverage area) identifier.
pub type SpotId = u8;
/// Carrier identifier inside a spot.
pub type CarrierId = u8;
/// QoS class / MAC FIFO identifier.
pub type Qos = u8;
/// MODCOD identifier.
pub type FmtId = u8;

/// Superframe counter (wraps).
pub type TimeSf = u16;
/// Frame index inside a superframe.
pub type TimeFrame = u8;

/// Volume in symbols.
pub type VolSym = u32;
/// Volume in bits.
pub type VolB = u64;
/// Volume in bytes.
pub type VolBytes = u64;
/// Volume in kilobits.
pub type VolKb = u32;
/// Volume in packets.
pub type VolPkt = u32;
/// Rate in symbols per second.
pub type RateSymps = u32;
/// Rate in kilobits per second.
pub type RateKbps = u32;
/// Rate in packets per frame.
pub type RatePktpf = u32;

/// Destination id used for broadcast/multicast traffic, also the boundary
/// between emulated (≤) and simulated (>) terminal ids.
pub const BROADCAST_TAL_ID: TalId = 31;

pub mod prelude {
    pub use deku::prelude::*;

    pub use crate::carrier::{AccessType, CarriersGroup, TerminalCategory};
    pub use crate::dama::agent::DamaAgent;
    pub use crate::dama::ctrl::DamaCtrl;
    pub use crate::encap::{NetPacket, PacketHandler};
    pub use crate::fifo::delay::DelayFifo;
    pub use crate::fifo::MacFifo;
    pub use crate::fmt::{FmtDefinition, FmtDefinitionTable, FmtGroup};
    pub use crate::frame::{DvbFrame, MessageType, Sac, Ttp};
    pub use crate::schedule::forward::ForwardScheduling;
    pub use crate::schedule::return_link::ReturnScheduling;
    pub use crate::units::UnitConverter;

    pub use crate::BROADCAST_TAL_ID;
}
