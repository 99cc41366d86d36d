//! TOML configuration of the NCC emulator.

use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use dvbgate::carrier::{AccessType, CarriersGroup, TerminalCategory};
use dvbgate::fmt::FmtGroup;
use dvbgate::{CarrierId, FmtId, Qos, RateKbps, TalId, VolPkt};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Frame duration in milliseconds.
    pub frame_duration_ms: u64,
    /// Frames per superframe; the frame duration divides the superframe.
    pub frames_per_superframe: u32,
    /// DVB-RCS2 burst length in symbols.
    pub rcs2_burst_length: u32,
    /// Free capacity assignment cap, kbit/s (0 disables FCA).
    pub fca: RateKbps,
    /// DAMA variant; only "Legacy" is implemented.
    pub dama_algorithm: String,
    /// Period between two capacity requests, ms.
    pub sync_period_ms: u64,
    /// MODCOD refresh period, ms.
    pub acm_refresh_period_ms: u64,
    /// Delay applied to PEP Allocate requests, ms.
    pub pep_allocation_delay_ms: u64,
    /// TCP ports of the external NCC interfaces (0 disables).
    pub pep_port: u16,
    pub svno_port: u16,

    /// One-way propagation delay, ms.
    pub sat_delay_ms: u64,
    /// Delay FIFO bound, packets.
    pub delay_buffer: VolPkt,
    /// Delay FIFO poll period, ms.
    pub delay_timer_ms: u64,

    pub spot_id: u8,
    pub group_id: u8,

    /// Single Carrier Per Channel mode: C/N+I reports ride as packet
    /// extensions on the forward link instead of SACs.
    pub scpc: bool,

    pub rbdc_enabled: bool,
    pub vbdc_enabled: bool,
    pub rbdc_timeout_sf: u16,
    pub msl_sf: u16,

    /// Gateway forward-link MAC FIFOs.
    pub gw_fifos: Vec<FifoConfig>,
    /// Terminal return-link MAC FIFOs.
    pub st_fifos: Vec<FifoConfig>,
    /// QoS value to FIFO name mapping.
    pub qos_classes: Vec<QosClass>,

    pub forward_category: CategoryConfig,
    pub return_category: CategoryConfig,

    /// Emulated terminals logging on at startup.
    pub terminals: Vec<TerminalConfig>,

    pub simulation: SimulationConfig,

    /// File recording simulated logon/logoff events (disabled when empty).
    pub event_trace: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            frame_duration_ms: 53,
            frames_per_superframe: 1,
            rcs2_burst_length: 536,
            fca: 0,
            dama_algorithm: "Legacy".to_string(),
            sync_period_ms: 1000,
            acm_refresh_period_ms: 1000,
            pep_allocation_delay_ms: 1000,
            pep_port: 0,
            svno_port: 0,
            sat_delay_ms: 250,
            delay_buffer: 10_000,
            delay_timer_ms: 10,
            spot_id: 1,
            group_id: 1,
            scpc: false,
            rbdc_enabled: true,
            vbdc_enabled: true,
            rbdc_timeout_sf: 16,
            msl_sf: 23,
            gw_fifos: vec![
                FifoConfig {
                    name: "NM".into(),
                    priority: 0,
                    capacity: 1000,
                    access_type: "ACM".into(),
                },
                FifoConfig {
                    name: "EF".into(),
                    priority: 1,
                    capacity: 3000,
                    access_type: "ACM".into(),
                },
                FifoConfig {
                    name: "BE".into(),
                    priority: 2,
                    capacity: 6000,
                    access_type: "ACM".into(),
                },
            ],
            st_fifos: vec![
                FifoConfig {
                    name: "EF".into(),
                    priority: 0,
                    capacity: 1000,
                    access_type: "RBDC".into(),
                },
                FifoConfig {
                    name: "BE".into(),
                    priority: 1,
                    capacity: 3000,
                    access_type: "VBDC".into(),
                },
            ],
            qos_classes: vec![
                QosClass { qos: 0, fifo: "EF".into() },
                QosClass { qos: 1, fifo: "BE".into() },
            ],
            forward_category: CategoryConfig {
                label: "Standard".into(),
                carriers: vec![CarrierConfig {
                    // data outputs carry odd ids
                    id: 9,
                    symbol_rate_symps: 28_000_000,
                    modcods: vec![4, 7, 13, 17, 23, 28],
                    ratio: 10,
                    vcm: vec![],
                }],
            },
            return_category: CategoryConfig {
                label: "Standard".into(),
                carriers: vec![CarrierConfig {
                    id: 5,
                    symbol_rate_symps: 7_500_000,
                    modcods: vec![7],
                    ratio: 10,
                    vcm: vec![],
                }],
            },
            terminals: vec![],
            simulation: SimulationConfig::None,
            event_trace: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FifoConfig {
    pub name: String,
    pub priority: u8,
    pub capacity: VolPkt,
    /// "ACM", "VCM0".."VCM3", "RBDC", "VBDC" or "SALOHA".
    pub access_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QosClass {
    pub qos: Qos,
    pub fifo: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CarrierConfig {
    pub id: CarrierId,
    pub symbol_rate_symps: u32,
    pub modcods: Vec<FmtId>,
    pub ratio: u32,
    /// VCM sub-carriers: (modcods, ratio) pairs.
    #[serde(default)]
    pub vcm: Vec<VcmConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VcmConfig {
    pub modcods: Vec<FmtId>,
    pub ratio: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoryConfig {
    pub label: String,
    pub carriers: Vec<CarrierConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminalConfig {
    pub tal_id: TalId,
    pub cra_kbps: u16,
    pub max_rbdc_kbps: u16,
    pub max_vbdc_kb: u16,
    /// Offered traffic toward the gateway, kbit/s.
    #[serde(default)]
    pub return_load_kbps: u32,
    /// Offered traffic toward the terminal, kbit/s.
    #[serde(default)]
    pub forward_load_kbps: u32,
    /// Reported C/N+I, dB.
    #[serde(default = "default_cni_db")]
    pub cni_db: f64,
}

fn default_cni_db() -> f64 {
    8.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "mode")]
pub enum SimulationConfig {
    None,
    /// Replay a request trace; "stdin" reads standard input.
    File { path: String },
    Random {
        terminals: u32,
        rt_kbps: u16,
        max_rbdc_kbps: u16,
        max_vbdc_kb: u16,
        mean_request_kbps: u32,
        amplitude_kbps: u32,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: Box<toml::de::Error>,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl Config {
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        let text =
            std::fs::read_to_string(path).map_err(|source| {
                ConfigError::Io {
                    path: path.display().to_string(),
                    source,
                }
            })?;
        let config: Config =
            toml::from_str(&text).map_err(|source| ConfigError::Parse {
                path: path.display().to_string(),
                source: Box::new(source),
            })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.frame_duration_ms == 0 {
            return Err(ConfigError::Invalid(
                "frame_duration_ms must be positive".into(),
            ));
        }
        if self.frames_per_superframe == 0 {
            return Err(ConfigError::Invalid(
                "frames_per_superframe must be positive".into(),
            ));
        }
        if self.rcs2_burst_length == 0 {
            return Err(ConfigError::Invalid(
                "rcs2_burst_length must be positive".into(),
            ));
        }
        if self.dama_algorithm != "Legacy" {
            return Err(ConfigError::Invalid(format!(
                "unknown DAMA algorithm {}",
                self.dama_algorithm
            )));
        }
        for fifo in self.gw_fifos.iter().chain(&self.st_fifos) {
            parse_access_type(&fifo.access_type).ok_or_else(|| {
                ConfigError::Invalid(format!(
                    "FIFO {}: unknown access type {}",
                    fifo.name, fifo.access_type
                ))
            })?;
        }
        for class in &self.qos_classes {
            let known = self
                .gw_fifos
                .iter()
                .chain(&self.st_fifos)
                .any(|f| f.name == class.fifo);
            if !known {
                return Err(ConfigError::Invalid(format!(
                    "QoS {} mapped to unknown FIFO {}",
                    class.qos, class.fifo
                )));
            }
        }
        Ok(())
    }

    pub fn frame_duration(&self) -> Duration {
        Duration::from_millis(self.frame_duration_ms)
    }

    pub fn superframe_duration(&self) -> Duration {
        self.frame_duration() * self.frames_per_superframe
    }

    /// SYNC period in superframes, at least one.
    pub fn sync_period_sf(&self) -> u16 {
        (self.sync_period_ms / self.superframe_duration().as_millis().max(1) as u64)
            .max(1) as u16
    }

    /// QoS value for a FIFO name, used when mapping upper-layer traffic.
    pub fn qos_for_fifo(&self, name: &str) -> Option<Qos> {
        self.qos_classes
            .iter()
            .find(|class| class.fifo == name)
            .map(|class| class.qos)
    }

    pub fn build_category(
        config: &CategoryConfig,
        frame_ms: u64,
    ) -> TerminalCategory {
        let mut category = TerminalCategory::new(&config.label);
        for carrier in &config.carriers {
            let mut group = CarriersGroup::new(
                carrier.id,
                FmtGroup::new(carrier.modcods.clone()),
                carrier.ratio,
                carrier.symbol_rate_symps,
                AccessType::Acm,
            );
            for vcm in &carrier.vcm {
                group.add_vcm(FmtGroup::new(vcm.modcods.clone()), vcm.ratio);
            }
            // per-frame symbol budget from the symbol rate
            group.set_capacity_sym(
                (carrier.symbol_rate_symps as u64 * frame_ms / 1000) as u32,
            );
            category.add_carriers_group(group);
        }
        category
    }

    pub fn build_fifos(configs: &[FifoConfig], qos_of: &BTreeMap<String, Qos>) -> Vec<dvbgate::fifo::MacFifo> {
        configs
            .iter()
            .map(|fifo| {
                let access = parse_access_type(&fifo.access_type)
                    .expect("validated at load time");
                let qos =
                    qos_of.get(&fifo.name).copied().unwrap_or(fifo.priority);
                dvbgate::fifo::MacFifo::new(
                    &fifo.name,
                    qos,
                    fifo.priority,
                    access,
                    fifo.capacity,
                )
            })
            .collect()
    }
}

pub fn parse_access_type(value: &str) -> Option<AccessType> {
    match value {
        "ACM" => Some(AccessType::Acm),
        "RBDC" => Some(AccessType::DamaRbdc),
        "VBDC" => Some(AccessType::DamaVbdc),
        "SALOHA" => Some(AccessType::Saloha),
        other => {
            let id = other.strip_prefix("VCM")?;
            u8::from_str(id).ok().filter(|id| *id <= 3).map(AccessType::Vcm)
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn access_types() {
        assert_eq!(parse_access_type("ACM"), Some(AccessType::Acm));
        assert_eq!(parse_access_type("VCM2"), Some(AccessType::Vcm(2)));
        assert_eq!(parse_access_type("VCM4"), None);
        assert_eq!(parse_access_type("RBDC"), Some(AccessType::DamaRbdc));
        assert_eq!(parse_access_type("bogus"), None);
    }

    #[test]
    fn toml_roundtrip() {
        let toml_data = r#"
            frame_duration_ms = 26
            frames_per_superframe = 2
            rcs2_burst_length = 536
            fca = 100

            [[gw_fifos]]
            name = "EF"
            priority = 0
            capacity = 500
            access_type = "ACM"

            [[st_fifos]]
            name = "EF"
            priority = 0
            capacity = 500
            access_type = "RBDC"

            [[qos_classes]]
            qos = 0
            fifo = "EF"

            [simulation]
            mode = "File"
            path = "requests.trace"
        "#;
        let config: Config = toml::from_str(toml_data).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.frame_duration_ms, 26);
        assert_eq!(config.superframe_duration().as_millis(), 52);
        assert_eq!(config.fca, 100);
        match config.simulation {
            SimulationConfig::File { ref path } => {
                assert_eq!(path, "requests.trace")
            }
            ref other => panic!("unexpected simulation mode {other:?}"),
        }
    }

    #[test]
    fn bad_algorithm_is_fatal() {
        let config = Config {
            dama_algorithm: "Greedy".into(),
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn unknown_fifo_in_qos_class_is_fatal() {
        let config = Config {
            qos_classes: vec![QosClass { qos: 0, fifo: "missing".into() }],
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }
}
