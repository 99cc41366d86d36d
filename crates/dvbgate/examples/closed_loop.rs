use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use dvbgate::carrier::{AccessType, CarriersGroup};
use dvbgate::dama::agent::{AgentConfig, DamaAgent};
use dvbgate::dama::ctrl::{CtrlConfig, DamaCtrl};
use dvbgate::encap::BasicHandler;
use dvbgate::fifo::MacFifo;
use dvbgate::fmt::sts::StFmtList;
use dvbgate::fmt::RCS2_MODCODS;
use dvbgate::prelude::*;

// One gateway, one terminal, no radio: drive the request/allocation loop by
// hand for a few superframes and print the grants.
fn main() {
    let modcod_def = Arc::new(RCS2_MODCODS.clone());
    let frame_duration = Duration::from_millis(53);

    let mut carriers = CarriersGroup::new(
        5,
        FmtGroup::new(vec![7]),
        10,
        7_500_000,
        AccessType::DamaRbdc,
    );
    carriers.set_capacity_sym(7_500_000 / 1000 * 53);
    let mut category = TerminalCategory::new("Standard");
    category.add_carriers_group(carriers);
    let mut categories = BTreeMap::new();
    categories.insert("Standard".to_string(), category);

    let mut ctrl = DamaCtrl::new(
        CtrlConfig {
            spot_id: 1,
            group_id: 1,
            frame_duration,
            rbdc_timeout_sf: 16,
            fca_kbps: 0,
            enable_rbdc: true,
            enable_vbdc: true,
            burst_length_sym: 536,
            simulated: false,
        },
        categories,
        BTreeMap::new(),
        Some("Standard".to_string()),
        modcod_def.clone(),
        Arc::new(StFmtList::new()),
    )
    .expect("controller configuration");

    let mut agent = DamaAgent::new(
        AgentConfig {
            tal_id: 1,
            group_id: 1,
            frame_duration,
            cra_kbps: 100,
            max_rbdc_kbps: 2048,
            rbdc_timeout_sf: 16,
            max_vbdc_kb: 4000,
            msl_sf: 23,
            sync_period_sf: 1,
            rbdc_enabled: true,
            vbdc_enabled: true,
            burst_length_sym: 536,
        },
        modcod_def,
        Arc::new(BasicHandler),
        vec![
            MacFifo::new("EF", 0, 0, AccessType::DamaRbdc, 1000),
            MacFifo::new("BE", 1, 1, AccessType::DamaVbdc, 1000),
        ],
    )
    .expect("agent configuration");

    ctrl.here_is_logon(&dvbgate::frame::LogonRequest::new(1, 100, 2048, 4000))
        .expect("logon");

    for sf in 1..=5u16 {
        // the terminal queues traffic and asks for capacity
        for _ in 0..20 {
            let packet = NetPacket::new(1, 0, 0, vec![0; 1024]);
            agent.push_packet(0, packet).expect("queue");
        }
        agent.here_is_sof(sf);
        if let Some(sac) = agent.build_sac(8.0) {
            ctrl.here_is_sac(&sac);
        }

        // the gateway allocates and answers with a burst-time plan
        ctrl.run_on_superframe_change(sf).expect("allocation");
        let ttp = ctrl.build_ttp();
        agent.here_is_ttp(&ttp);

        let terminal = ctrl.terminal(1).expect("registered terminal");
        println!(
            "SF#{sf}: cra={} kb/s rbdc={} kb/s vbdc={} kb",
            terminal.cra_alloc_kbps,
            terminal.rbdc_alloc_kbps,
            terminal.vbdc_alloc_kb,
        );

        // next superframe the grant is spendable
        agent.here_is_sof(sf + 1);
        agent.on_frame_tick().expect("frame tick");
        let mut frames = Vec::new();
        agent.return_schedule(&mut frames).expect("return scheduling");
        println!("SF#{}: {} return frames sent", sf + 1, frames.len());
    }
}
