//! MAC FIFO scheduling toward the radio: DVB-S2 BBFrames on the forward
//! link, DVB-RCS2 bursts on the return link.

pub mod forward;
pub mod return_link;

use thiserror::Error;

use crate::encap::EncapError;
use crate::FmtId;

/// Outcome of trying to place a frame on a carrier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedStatus {
    Ok,
    /// The carrier has no room left this frame.
    Full,
}

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error(transparent)]
    Encap(#[from] EncapError),
    #[error("no definition for MODCOD {0}")]
    UnknownModcod(FmtId),
    #[error("frame refused a packet that was sized to fit")]
    FrameOverflow,
    #[error("built an empty frame")]
    EmptyFrame,
}
