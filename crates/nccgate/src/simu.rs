//! Simulated capacity requests injected into the DAMA controller.
//!
//! Two sources: a trace file replayed superframe by superframe, and a random
//! generator. Simulated terminal ids live above `BROADCAST_TAL_ID`; trace
//! lines targeting reserved ids are ignored with a warning.
//!
//! Trace format, sorted by superframe:
//!
//! ```text
//! SF10 LOGON st32 rt=100 rbdc=500 vbdc=2000
//! SF12 CR st32 cr=300 type=0
//! SF14 LOGOFF st32
//! ```

use std::io::{BufRead, BufReader};

use once_cell::sync::Lazy;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use regex::Regex;
use tracing::{info, warn};

use dvbgate::{TalId, TimeSf, BROADCAST_TAL_ID};

/// One event produced by a simulator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimEvent {
    Logon { tal_id: TalId, rt_kbps: u16, max_rbdc_kbps: u16, max_vbdc_kb: u16 },
    Request { tal_id: TalId, value: u32, kind: u8 },
    Logoff { tal_id: TalId },
}

pub trait RequestSimulator: Send {
    /// Events to inject at the given superframe.
    fn simulation(&mut self, superframe_sf: TimeSf) -> Vec<SimEvent>;
}

static CR_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^SF(\d+) CR st(\d+) cr=(\d+) type=(\d+)$").unwrap()
});
static LOGON_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^SF(\d+) LOGON st(\d+) rt=(\d+) rbdc=(\d+) vbdc=(\d+)$")
        .unwrap()
});
static LOGOFF_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^SF(\d+) LOGOFF st(\d+)$").unwrap());

#[derive(Debug, Clone, PartialEq, Eq)]
struct TraceEvent {
    superframe_sf: TimeSf,
    event: SimEvent,
}

/// Replays a request trace, one buffered line of lookahead so events beyond
/// the current superframe stay queued.
pub struct FileSimulator {
    reader: Box<dyn BufRead + Send>,
    lookahead: Option<TraceEvent>,
    eof: bool,
}

impl FileSimulator {
    pub fn new(path: &str) -> std::io::Result<Self> {
        let reader: Box<dyn BufRead + Send> = if path == "stdin" {
            Box::new(BufReader::new(std::io::stdin()))
        } else {
            Box::new(BufReader::new(std::fs::File::open(path)?))
        };
        info!(path, "events simulated from trace");
        Ok(FileSimulator { reader, lookahead: None, eof: false })
    }

    #[cfg(test)]
    fn from_reader(reader: impl BufRead + Send + 'static) -> Self {
        FileSimulator { reader: Box::new(reader), lookahead: None, eof: false }
    }

    fn parse_line(line: &str) -> Option<TraceEvent> {
        if let Some(caps) = CR_LINE.captures(line) {
            return Some(TraceEvent {
                superframe_sf: caps[1].parse().ok()?,
                event: SimEvent::Request {
                    tal_id: caps[2].parse().ok()?,
                    value: caps[3].parse().ok()?,
                    kind: caps[4].parse().ok()?,
                },
            });
        }
        if let Some(caps) = LOGON_LINE.captures(line) {
            return Some(TraceEvent {
                superframe_sf: caps[1].parse().ok()?,
                event: SimEvent::Logon {
                    tal_id: caps[2].parse().ok()?,
                    rt_kbps: caps[3].parse().ok()?,
                    max_rbdc_kbps: caps[4].parse().ok()?,
                    max_vbdc_kb: caps[5].parse().ok()?,
                },
            });
        }
        if let Some(caps) = LOGOFF_LINE.captures(line) {
            return Some(TraceEvent {
                superframe_sf: caps[1].parse().ok()?,
                event: SimEvent::Logoff { tal_id: caps[2].parse().ok()? },
            });
        }
        None
    }

    fn next_event(&mut self) -> Option<TraceEvent> {
        if let Some(event) = self.lookahead.take() {
            return Some(event);
        }
        while !self.eof {
            let mut line = String::new();
            match self.reader.read_line(&mut line) {
                Ok(0) => {
                    self.eof = true;
                    return None;
                }
                Ok(_) => {}
                Err(error) => {
                    warn!(%error, "trace read failed, simulation stopped");
                    self.eof = true;
                    return None;
                }
            }
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match Self::parse_line(line) {
                Some(event) => return Some(event),
                None => warn!(line, "unreadable trace line skipped"),
            }
        }
        None
    }
}

fn event_tal_id(event: &SimEvent) -> TalId {
    match event {
        SimEvent::Logon { tal_id, .. }
        | SimEvent::Request { tal_id, .. }
        | SimEvent::Logoff { tal_id } => *tal_id,
    }
}

impl RequestSimulator for FileSimulator {
    fn simulation(&mut self, superframe_sf: TimeSf) -> Vec<SimEvent> {
        let mut events = Vec::new();
        while let Some(entry) = self.next_event() {
            if entry.superframe_sf > superframe_sf {
                self.lookahead = Some(entry);
                break;
            }
            let tal_id = event_tal_id(&entry.event);
            if tal_id <= BROADCAST_TAL_ID {
                warn!(
                    tal_id,
                    "simulated terminal ignored, ids up to {} are reserved \
                     for emulated terminals",
                    BROADCAST_TAL_ID
                );
                continue;
            }
            if entry.superframe_sf == superframe_sf {
                events.push(entry.event);
            }
            // stale events (lines behind the current superframe) fall out
        }
        events
    }
}

/// Generates a fixed population of terminals issuing noisy RBDC requests.
pub struct RandomSimulator {
    terminals: u32,
    rt_kbps: u16,
    max_rbdc_kbps: u16,
    max_vbdc_kb: u16,
    mean_request_kbps: u32,
    amplitude_kbps: u32,
    rng: StdRng,
    logged_on: bool,
}

impl RandomSimulator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        terminals: u32,
        rt_kbps: u16,
        max_rbdc_kbps: u16,
        max_vbdc_kb: u16,
        mean_request_kbps: u32,
        amplitude_kbps: u32,
        seed: u64,
    ) -> Self {
        info!(
            terminals,
            rt_kbps,
            max_rbdc_kbps,
            max_vbdc_kb,
            mean_request_kbps,
            amplitude_kbps,
            "random request simulation"
        );
        RandomSimulator {
            terminals,
            rt_kbps,
            max_rbdc_kbps,
            max_vbdc_kb,
            mean_request_kbps,
            amplitude_kbps,
            rng: StdRng::seed_from_u64(seed),
            logged_on: false,
        }
    }

    fn first_tal_id() -> TalId {
        BROADCAST_TAL_ID + 1
    }
}

impl RequestSimulator for RandomSimulator {
    fn simulation(&mut self, _superframe_sf: TimeSf) -> Vec<SimEvent> {
        let mut events = Vec::new();

        if !self.logged_on {
            for index in 0..self.terminals {
                events.push(SimEvent::Logon {
                    tal_id: Self::first_tal_id() + index as TalId,
                    rt_kbps: self.rt_kbps,
                    max_rbdc_kbps: self.max_rbdc_kbps,
                    max_vbdc_kb: self.max_vbdc_kb,
                });
            }
            self.logged_on = true;
        }

        for index in 0..self.terminals {
            let value = if self.amplitude_kbps > 0 {
                let offset =
                    self.rng.gen_range(0..self.amplitude_kbps);
                (self.mean_request_kbps + offset)
                    .saturating_sub(self.amplitude_kbps / 2)
            } else {
                self.mean_request_kbps
            };
            events.push(SimEvent::Request {
                tal_id: Self::first_tal_id() + index as TalId,
                value,
                kind: 0,
            });
        }
        events
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Cursor;

    const TRACE: &str = "\
SF10 LOGON st32 rt=100 rbdc=500 vbdc=2000
SF12 CR st32 cr=300 type=0
SF14 LOGOFF st32
";

    #[test]
    fn trace_is_replayed_at_the_right_superframes() {
        let mut simu = FileSimulator::from_reader(Cursor::new(TRACE));

        assert!(simu.simulation(9).is_empty());
        assert_eq!(
            simu.simulation(10),
            vec![SimEvent::Logon {
                tal_id: 32,
                rt_kbps: 100,
                max_rbdc_kbps: 500,
                max_vbdc_kb: 2000,
            }]
        );
        assert!(simu.simulation(11).is_empty());
        assert_eq!(
            simu.simulation(12),
            vec![SimEvent::Request { tal_id: 32, value: 300, kind: 0 }]
        );
        assert_eq!(
            simu.simulation(14),
            vec![SimEvent::Logoff { tal_id: 32 }]
        );
        assert!(simu.simulation(15).is_empty());
    }

    #[test]
    fn reserved_ids_are_ignored() {
        let trace = "SF1 LOGON st7 rt=100 rbdc=500 vbdc=2000\n";
        let mut simu = FileSimulator::from_reader(Cursor::new(trace));
        assert!(simu.simulation(1).is_empty());
    }

    #[test]
    fn garbage_lines_are_skipped() {
        let trace = "\
# comment
SF1 NONSENSE st40
SF1 CR st40 cr=250 type=0
";
        let mut simu = FileSimulator::from_reader(Cursor::new(trace));
        assert_eq!(
            simu.simulation(1),
            vec![SimEvent::Request { tal_id: 40, value: 250, kind: 0 }]
        );
    }

    #[test]
    fn random_simulator_logs_on_once_then_requests() {
        let mut simu = RandomSimulator::new(3, 100, 500, 2000, 300, 0, 7);
        let first = simu.simulation(0);
        let logons = first
            .iter()
            .filter(|e| matches!(e, SimEvent::Logon { .. }))
            .count();
        assert_eq!(logons, 3);
        assert_eq!(first.len(), 6);

        let second = simu.simulation(1);
        assert_eq!(second.len(), 3);
        for event in &second {
            match event {
                SimEvent::Request { tal_id, value, kind } => {
                    assert!(*tal_id > BROADCAST_TAL_ID);
                    assert_eq!(*value, 300);
                    assert_eq!(*kind, 0);
                }
                other => panic!("unexpected event {other:?}"),
            }
        }
    }
}
