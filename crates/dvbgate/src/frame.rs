//! DVB frames exchanged between gateway, satellite and terminals.
//!
//! Frames are a tagged sum type dispatched on [`MessageType`] by the
//! orchestration layer. Signalling payloads (SAC, TTP, logon) are deku
//! structures so their wire fields stay bit-exact; data frames (BBFrame,
//! DVB-RCS2 frame) carry encapsulation packets plus the MODCOD the physical
//! layer needs.

use deku::prelude::*;
use serde::Serialize;

use crate::encap::NetPacket;
use crate::{
    CarrierId, FmtId, GroupId, RateKbps, SpotId, TalId, TimeSf, VolKb,
};

/// Highest RBDC rate a SAC can carry, from the CR value field size.
pub const MAX_RBDC_IN_SAC_KBPS: RateKbps = 16_320;
/// Highest VBDC volume a SAC can carry, from the CR value field size.
pub const MAX_VBDC_IN_SAC_KB: VolKb = 4_080;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, DekuRead, DekuWrite, Serialize,
)]
#[deku(id_type = "u8")]
pub enum MessageType {
    #[deku(id = 0x01)]
    Sof,
    #[deku(id = 0x02)]
    BbFrame,
    #[deku(id = 0x03)]
    DvbBurst,
    #[deku(id = 0x04)]
    Sac,
    #[deku(id = 0x05)]
    Ttp,
    #[deku(id = 0x06)]
    SessionLogonReq,
    #[deku(id = 0x07)]
    SessionLogonResp,
    #[deku(id = 0x08)]
    SessionLogoff,
    #[deku(id = 0x09)]
    SalohaData,
    #[deku(id = 0x0A)]
    SalohaCtrl,
}

/// Fields common to every DVB frame on the wire.
#[derive(Debug, Clone, PartialEq, DekuRead, DekuWrite, Serialize)]
pub struct DvbHeader {
    pub message_type: MessageType,
    pub spot_id: SpotId,
    pub carrier_id: CarrierId,
    #[deku(bits = 1)]
    pub is_corrupted: bool,
    #[deku(bits = 7)]
    #[serde(skip)]
    reserved: u8,
}

impl DvbHeader {
    pub fn new(message_type: MessageType) -> Self {
        DvbHeader {
            message_type,
            spot_id: 0,
            carrier_id: 0,
            is_corrupted: false,
            reserved: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, DekuRead, DekuWrite, Serialize)]
pub struct Sof {
    #[deku(skip, default = "DvbHeader::new(MessageType::Sof)")]
    pub header: DvbHeader,
    pub superframe_nr: TimeSf,
}

impl Sof {
    pub fn new(superframe_nr: TimeSf) -> Self {
        Sof { header: DvbHeader::new(MessageType::Sof), superframe_nr }
    }
}

/// A capacity request inside a SAC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, DekuRead, DekuWrite, Serialize)]
#[deku(id_type = "u8")]
pub enum CrType {
    #[deku(id = 0x00)]
    Rbdc,
    #[deku(id = 0x01)]
    Vbdc,
}

#[derive(Debug, Clone, PartialEq, DekuRead, DekuWrite, Serialize)]
pub struct CapacityRequest {
    pub priority: u8,
    pub kind: CrType,
    /// kbit/s for RBDC, kbit for VBDC.
    pub value: u32,
}

#[derive(Debug, Clone, PartialEq, DekuRead, DekuWrite, Serialize)]
pub struct Sac {
    #[deku(skip, default = "DvbHeader::new(MessageType::Sac)")]
    pub header: DvbHeader,
    pub tal_id: TalId,
    pub group_id: GroupId,
    /// C/N+I report for ACM, in dB.
    pub acm_cni_db: f64,
    #[deku(update = "self.requests.len()")]
    request_count: u8,
    #[deku(count = "request_count")]
    pub requests: Vec<CapacityRequest>,
}

impl Sac {
    pub fn new(tal_id: TalId, group_id: GroupId) -> Self {
        Sac {
            header: DvbHeader::new(MessageType::Sac),
            tal_id,
            group_id,
            acm_cni_db: 0.0,
            request_count: 0,
            requests: Vec::new(),
        }
    }

    pub fn add_request(&mut self, priority: u8, kind: CrType, value: u32) {
        self.requests.push(CapacityRequest { priority, kind, value });
        self.request_count = self.requests.len() as u8;
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}

/// One terminal's slice of a superframe.
#[derive(Debug, Clone, PartialEq, DekuRead, DekuWrite, Serialize)]
pub struct TimePlan {
    pub tal_id: TalId,
    /// Frame index within the superframe the grant applies to.
    pub frame_id: u8,
    pub offset: u16,
    pub assignment_count_kb: u16,
    pub fmt_id: FmtId,
    pub priority: u8,
}

/// Terminal burst-time plan, gateway to terminals.
#[derive(Debug, Clone, PartialEq, DekuRead, DekuWrite, Serialize)]
pub struct Ttp {
    #[deku(skip, default = "DvbHeader::new(MessageType::Ttp)")]
    pub header: DvbHeader,
    pub superframe_count: TimeSf,
    pub group_id: GroupId,
    #[deku(update = "self.plans.len()")]
    plan_count: u16,
    #[deku(count = "plan_count")]
    pub plans: Vec<TimePlan>,
}

impl Ttp {
    pub fn new(group_id: GroupId, superframe_count: TimeSf) -> Self {
        Ttp {
            header: DvbHeader::new(MessageType::Ttp),
            superframe_count,
            group_id,
            plan_count: 0,
            plans: Vec::new(),
        }
    }

    pub fn add_time_plan(&mut self, plan: TimePlan) {
        self.plans.push(plan);
        self.plan_count = self.plans.len() as u16;
    }

    /// Time plans addressed to one terminal.
    pub fn plans_for(&self, tal_id: TalId) -> Vec<&TimePlan> {
        self.plans.iter().filter(|tp| tp.tal_id == tal_id).collect()
    }
}

#[derive(Debug, Clone, PartialEq, DekuRead, DekuWrite, Serialize)]
pub struct LogonRequest {
    #[deku(skip, default = "DvbHeader::new(MessageType::SessionLogonReq)")]
    pub header: DvbHeader,
    pub tal_id: TalId,
    /// Continuous rate assignment, kbit/s.
    pub rt_bandwidth_kbps: u16,
    pub max_rbdc_kbps: u16,
    pub max_vbdc_kb: u16,
}

impl LogonRequest {
    pub fn new(
        tal_id: TalId,
        rt_bandwidth_kbps: u16,
        max_rbdc_kbps: u16,
        max_vbdc_kb: u16,
    ) -> Self {
        LogonRequest {
            header: DvbHeader::new(MessageType::SessionLogonReq),
            tal_id,
            rt_bandwidth_kbps,
            max_rbdc_kbps,
            max_vbdc_kb,
        }
    }
}

#[derive(Debug, Clone, PartialEq, DekuRead, DekuWrite, Serialize)]
pub struct LogonResponse {
    #[deku(skip, default = "DvbHeader::new(MessageType::SessionLogonResp)")]
    pub header: DvbHeader,
    pub tal_id: TalId,
    pub group_id: GroupId,
    pub logon_id: TalId,
}

#[derive(Debug, Clone, PartialEq, DekuRead, DekuWrite, Serialize)]
pub struct Logoff {
    #[deku(skip, default = "DvbHeader::new(MessageType::SessionLogoff)")]
    pub header: DvbHeader,
    pub tal_id: TalId,
}

impl Logoff {
    pub fn new(tal_id: TalId) -> Self {
        Logoff { header: DvbHeader::new(MessageType::SessionLogoff), tal_id }
    }
}

/// DVB-S2 baseband frame under construction or in flight.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BbFrame {
    pub header: DvbHeader,
    pub modcod_id: FmtId,
    /// Payload limit for this MODCOD, in bytes.
    pub max_size_bytes: usize,
    pub size_bytes: usize,
    pub packets: Vec<NetPacket>,
}

impl BbFrame {
    pub fn new(modcod_id: FmtId, max_size_bytes: usize) -> Self {
        BbFrame {
            header: DvbHeader::new(MessageType::BbFrame),
            modcod_id,
            max_size_bytes,
            size_bytes: 0,
            packets: Vec::new(),
        }
    }

    pub fn free_space_bytes(&self) -> usize {
        self.max_size_bytes.saturating_sub(self.size_bytes)
    }

    pub fn add_packet(&mut self, packet: NetPacket) -> bool {
        let len = packet.len_bytes();
        if len > self.free_space_bytes() {
            return false;
        }
        self.size_bytes += len;
        self.packets.push(packet);
        true
    }
}

/// DVB-RCS2 return-link frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DvbRcs2Frame {
    pub header: DvbHeader,
    pub modcod_id: FmtId,
    pub max_size_bytes: usize,
    pub size_bytes: usize,
    pub packets: Vec<NetPacket>,
}

impl DvbRcs2Frame {
    pub fn new(max_size_bytes: usize) -> Self {
        DvbRcs2Frame {
            header: DvbHeader::new(MessageType::DvbBurst),
            modcod_id: 0,
            max_size_bytes,
            size_bytes: 0,
            packets: Vec::new(),
        }
    }

    pub fn free_space_bytes(&self) -> usize {
        self.max_size_bytes.saturating_sub(self.size_bytes)
    }

    pub fn add_packet(&mut self, packet: NetPacket) -> bool {
        let len = packet.len_bytes();
        if len > self.free_space_bytes() {
            return false;
        }
        self.size_bytes += len;
        self.packets.push(packet);
        true
    }
}

/// Slotted Aloha frame, forwarded untouched by the resource management.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SalohaFrame {
    pub header: DvbHeader,
    pub packets: Vec<NetPacket>,
}

/// Any frame travelling on a DVB carrier, dispatched by message type.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum DvbFrame {
    Sof(Sof),
    BbFrame(BbFrame),
    DvbBurst(DvbRcs2Frame),
    Sac(Sac),
    Ttp(Ttp),
    LogonReq(LogonRequest),
    LogonResp(LogonResponse),
    Logoff(Logoff),
    SalohaData(SalohaFrame),
    SalohaCtrl(SalohaFrame),
}

impl DvbFrame {
    pub fn message_type(&self) -> MessageType {
        self.header().message_type
    }

    pub fn header(&self) -> &DvbHeader {
        match self {
            DvbFrame::Sof(f) => &f.header,
            DvbFrame::BbFrame(f) => &f.header,
            DvbFrame::DvbBurst(f) => &f.header,
            DvbFrame::Sac(f) => &f.header,
            DvbFrame::Ttp(f) => &f.header,
            DvbFrame::LogonReq(f) => &f.header,
            DvbFrame::LogonResp(f) => &f.header,
            DvbFrame::Logoff(f) => &f.header,
            DvbFrame::SalohaData(f) => &f.header,
            DvbFrame::SalohaCtrl(f) => &f.header,
        }
    }

    pub fn header_mut(&mut self) -> &mut DvbHeader {
        match self {
            DvbFrame::Sof(f) => &mut f.header,
            DvbFrame::BbFrame(f) => &mut f.header,
            DvbFrame::DvbBurst(f) => &mut f.header,
            DvbFrame::Sac(f) => &mut f.header,
            DvbFrame::Ttp(f) => &mut f.header,
            DvbFrame::LogonReq(f) => &mut f.header,
            DvbFrame::LogonResp(f) => &mut f.header,
            DvbFrame::Logoff(f) => &mut f.header,
            DvbFrame::SalohaData(f) => &mut f.header,
            DvbFrame::SalohaCtrl(f) => &mut f.header,
        }
    }

    pub fn is_corrupted(&self) -> bool {
        self.header().is_corrupted
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn sac_wire_roundtrip() {
        let mut sac = Sac::new(12, 1);
        sac.acm_cni_db = 8.25;
        sac.add_request(0, CrType::Rbdc, 300);
        sac.add_request(0, CrType::Vbdc, 50);

        let bytes = sac.to_bytes().unwrap();
        let (_, decoded) = Sac::from_bytes((&bytes, 0)).unwrap();
        assert_eq!(decoded.tal_id, 12);
        assert_eq!(decoded.requests, sac.requests);
        assert_eq!(decoded.acm_cni_db, 8.25);
    }

    #[test]
    fn ttp_wire_roundtrip() {
        let mut ttp = Ttp::new(1, 42);
        ttp.add_time_plan(TimePlan {
            tal_id: 7,
            frame_id: 0,
            offset: 0,
            assignment_count_kb: 120,
            fmt_id: 13,
            priority: 0,
        });

        let bytes = ttp.to_bytes().unwrap();
        let (_, decoded) = Ttp::from_bytes((&bytes, 0)).unwrap();
        assert_eq!(decoded.superframe_count, 42);
        assert_eq!(decoded.plans_for(7).len(), 1);
        assert_eq!(decoded.plans_for(8).len(), 0);
        assert_eq!(decoded.plans_for(7)[0].assignment_count_kb, 120);
    }

    #[test]
    fn bbframe_respects_its_payload_limit() {
        let mut frame = BbFrame::new(13, 100);
        assert!(frame.add_packet(NetPacket::new(0, 1, 0, vec![0; 60])));
        assert_eq!(frame.free_space_bytes(), 40);
        assert!(!frame.add_packet(NetPacket::new(0, 1, 0, vec![0; 41])));
        assert!(frame.add_packet(NetPacket::new(0, 1, 0, vec![0; 40])));
        assert_eq!(frame.free_space_bytes(), 0);
    }

    #[test]
    fn frames_serialise_to_json() {
        let frame = DvbFrame::Sof(Sof::new(3));
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains("superframe_nr"));
    }

    #[test]
    fn frame_dispatch_by_message_type() {
        let frame = DvbFrame::Sof(Sof::new(3));
        assert_eq!(frame.message_type(), MessageType::Sof);

        let mut frame = DvbFrame::Logoff(Logoff::new(9));
        frame.header_mut().spot_id = 2;
        assert_eq!(frame.header().spot_id, 2);
        assert_eq!(frame.message_type(), MessageType::SessionLogoff);
    }
}
