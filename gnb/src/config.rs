//! YAML Configuration Structures for the MAC simulator
//!
//! Every section and field has a default, so an empty file (or no file at all)
//! runs a single-UE cell.

use anyhow::Context;
use common::types::{Bandwidth, CellId, Rnti, SubcarrierSpacing};
use layers::mac::{AccessMode, MacConfig, PolicyKind, SchedulerConfig};
use layers::phy::{Combining, ErrorModelConfig};
use serde::{Deserialize, Serialize};

/// Main configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SimConfig {
    /// Carrier configuration
    #[serde(default)]
    pub cell: CellConfig,
    /// Scheduler configuration
    #[serde(default)]
    pub scheduler: SchedulerSection,
    /// Error model configuration
    #[serde(default)]
    pub error_model: ErrorModelSection,
    /// Emulated radio channel
    #[serde(default)]
    pub channel: ChannelConfig,
    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,
    /// Emulated UEs
    #[serde(default = "default_ues")]
    pub ues: Vec<UeProfile>,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            cell: CellConfig::default(),
            scheduler: SchedulerSection::default(),
            error_model: ErrorModelSection::default(),
            channel: ChannelConfig::default(),
            log: LogConfig::default(),
            ues: default_ues(),
        }
    }
}

/// Cell configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CellConfig {
    /// Cell ID
    #[serde(default = "default_cell_id")]
    pub cell_id: u16,
    /// Carrier center frequency in MHz
    #[serde(default = "default_center_frequency_mhz")]
    pub center_frequency_mhz: f64,
    /// Channel bandwidth in MHz
    #[serde(rename = "channel_bandwidth_MHz", default = "default_bandwidth_mhz")]
    pub channel_bandwidth_mhz: u32,
    /// Common subcarrier spacing in kHz
    #[serde(default = "default_common_scs")]
    pub common_scs: u32,
    /// Maximum number of UEs
    #[serde(default = "default_max_ues")]
    pub max_ues: u16,
}

impl Default for CellConfig {
    fn default() -> Self {
        Self {
            cell_id: default_cell_id(),
            center_frequency_mhz: default_center_frequency_mhz(),
            channel_bandwidth_mhz: default_bandwidth_mhz(),
            common_scs: default_common_scs(),
            max_ues: default_max_ues(),
        }
    }
}

fn default_cell_id() -> u16 {
    1
}

fn default_center_frequency_mhz() -> f64 {
    3500.0  // n78
}

fn default_bandwidth_mhz() -> u32 {
    20
}

fn default_common_scs() -> u32 {
    30
}

fn default_max_ues() -> u16 {
    32
}

/// Scheduler section
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SchedulerSection {
    /// rr, pf, mr or random
    #[serde(default = "default_policy")]
    pub policy: String,
    /// tdma or ofdma
    #[serde(default = "default_access")]
    pub access: String,
    /// RBs per RBG
    #[serde(default = "default_rbg_size")]
    pub rbg_size: u16,
    /// Downlink data symbols per slot
    #[serde(default = "default_data_symbols")]
    pub dl_symbols: u8,
    /// Uplink data symbols per slot
    #[serde(default = "default_data_symbols")]
    pub ul_symbols: u8,
    /// HARQ processes per UE and direction
    #[serde(default = "default_max_harq_processes")]
    pub max_harq_processes: u8,
    /// Retransmissions before a block is dropped
    #[serde(default = "default_max_retx")]
    pub max_retx: u8,
    /// Slots a process may wait for feedback
    #[serde(default = "default_harq_timeout_slots")]
    pub harq_timeout_slots: u64,
    /// Proportional-fair averaging window in slots
    #[serde(default = "default_pf_time_window")]
    pub pf_time_window: f64,
    /// Proportional-fair fairness exponent
    #[serde(default = "default_pf_fairness_alpha")]
    pub pf_fairness_alpha: f64,
    /// Random policy seed
    #[serde(default = "default_seed")]
    pub random_seed: u64,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            policy: default_policy(),
            access: default_access(),
            rbg_size: default_rbg_size(),
            dl_symbols: default_data_symbols(),
            ul_symbols: default_data_symbols(),
            max_harq_processes: default_max_harq_processes(),
            max_retx: default_max_retx(),
            harq_timeout_slots: default_harq_timeout_slots(),
            pf_time_window: default_pf_time_window(),
            pf_fairness_alpha: default_pf_fairness_alpha(),
            random_seed: default_seed(),
        }
    }
}

fn default_policy() -> String {
    "rr".to_string()
}

fn default_access() -> String {
    "ofdma".to_string()
}

fn default_rbg_size() -> u16 {
    4
}

fn default_data_symbols() -> u8 {
    12  // 14 minus PDCCH/DMRS
}

fn default_max_harq_processes() -> u8 {
    16
}

fn default_max_retx() -> u8 {
    3
}

fn default_harq_timeout_slots() -> u64 {
    32
}

fn default_pf_time_window() -> f64 {
    99.0
}

fn default_pf_fairness_alpha() -> f64 {
    1.0
}

fn default_seed() -> u64 {
    1
}

/// Error model section
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ErrorModelSection {
    /// chase or ir
    #[serde(default = "default_combining")]
    pub combining: String,
    /// Target BLER for link adaptation
    #[serde(default = "default_bler_target")]
    pub bler_target: f64,
    /// Seed of the decoding draws
    #[serde(default = "default_seed")]
    pub decode_seed: u64,
}

impl Default for ErrorModelSection {
    fn default() -> Self {
        Self {
            combining: default_combining(),
            bler_target: default_bler_target(),
            decode_seed: default_seed(),
        }
    }
}

fn default_combining() -> String {
    "chase".to_string()
}

fn default_bler_target() -> f64 {
    0.1
}

/// Emulated channel
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChannelConfig {
    /// Per-RB SINR spread around each UE's mean, in dB
    #[serde(default = "default_fading_db")]
    pub fading_db: f64,
    /// Seed of the channel draws
    #[serde(default = "default_channel_seed")]
    pub seed: u64,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            fading_db: default_fading_db(),
            seed: default_channel_seed(),
        }
    }
}

fn default_fading_db() -> f64 {
    3.0
}

fn default_channel_seed() -> u64 {
    7
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogConfig {
    /// Level used when neither RUST_LOG nor --log-level is given
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self { level: default_log_level() }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// One emulated UE
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct UeProfile {
    /// C-RNTI
    pub rnti: u16,
    /// Serving beam
    #[serde(default)]
    pub beam: u16,
    /// Mean SINR in dB
    #[serde(default = "default_sinr_db")]
    pub sinr_db: f64,
    /// CQI before the first report
    #[serde(default = "default_initial_cqi")]
    pub initial_cqi: u8,
    /// Downlink bytes arriving every slot
    #[serde(default)]
    pub dl_bytes_per_slot: u32,
    /// Uplink bytes arriving every slot
    #[serde(default)]
    pub ul_bytes_per_slot: u32,
}

impl UeProfile {
    /// RNTI of the UE
    pub fn rnti(&self) -> Rnti {
        Rnti(self.rnti)
    }
}

fn default_sinr_db() -> f64 {
    15.0
}

fn default_initial_cqi() -> u8 {
    7
}

fn default_ues() -> Vec<UeProfile> {
    vec![UeProfile {
        rnti: 0x4601,
        beam: 0,
        sinr_db: default_sinr_db(),
        initial_cqi: default_initial_cqi(),
        dl_bytes_per_slot: 1500,
        ul_bytes_per_slot: 300,
    }]
}

impl SimConfig {
    /// Load configuration from YAML file
    pub fn from_yaml_file(path: &str) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Reading configuration file {}", path))?;
        Self::from_yaml_str(&contents)
    }

    /// Parse configuration from YAML text
    pub fn from_yaml_str(contents: &str) -> anyhow::Result<Self> {
        let config: SimConfig = serde_yaml::from_str(contents)?;
        Ok(config)
    }

    /// Typed MAC configuration
    pub fn to_mac_config(&self) -> anyhow::Result<MacConfig> {
        let scheduler = SchedulerConfig {
            policy: self.scheduler.policy.parse::<PolicyKind>()?,
            access: self.scheduler.access.parse::<AccessMode>()?,
            rbg_size: self.scheduler.rbg_size,
            dl_symbols: self.scheduler.dl_symbols,
            ul_symbols: self.scheduler.ul_symbols,
            max_harq_processes: self.scheduler.max_harq_processes,
            max_retx: self.scheduler.max_retx,
            harq_timeout_slots: self.scheduler.harq_timeout_slots,
            pf_time_window: self.scheduler.pf_time_window,
            pf_fairness_alpha: self.scheduler.pf_fairness_alpha,
            random_seed: self.scheduler.random_seed,
        };
        let error_model = ErrorModelConfig {
            combining: self.error_model.combining.parse::<Combining>()?,
            bler_target: self.error_model.bler_target,
            decode_seed: self.error_model.decode_seed,
        };

        let config = MacConfig {
            cell_id: CellId(self.cell.cell_id),
            center_frequency_hz: self.cell.center_frequency_mhz * 1e6,
            scs: SubcarrierSpacing::from_khz(self.cell.common_scs)?,
            bandwidth: Bandwidth::from_mhz(self.cell.channel_bandwidth_mhz)?,
            max_ues: self.cell.max_ues,
            scheduler,
            error_model,
        };
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_yaml_uses_defaults() {
        let config = SimConfig::from_yaml_str("{}").unwrap();
        assert_eq!(config.cell.channel_bandwidth_mhz, 20);
        assert_eq!(config.ues.len(), 1);
        assert_eq!(config.ues, SimConfig::default().ues);
        assert_eq!(config.ues[0].rnti(), Rnti(0x4601));

        let mac = config.to_mac_config().unwrap();
        assert_eq!(mac.scheduler.policy, PolicyKind::RoundRobin);
        assert_eq!(mac.scheduler.access, AccessMode::Ofdma);
        assert_eq!(mac.error_model.combining, Combining::Chase);
        assert_eq!(mac.center_frequency_hz, 3.5e9);
    }

    #[test]
    fn test_parse_full_yaml() {
        let yaml = r#"
cell:
  cell_id: 3
  center_frequency_mhz: 1842.5
  channel_bandwidth_MHz: 10
  common_scs: 15
scheduler:
  policy: pf
  access: tdma
  rbg_size: 2
  ul_symbols: 0
  pf_fairness_alpha: 0.5
error_model:
  combining: ir
  bler_target: 0.05
ues:
  - rnti: 17
    beam: 1
    sinr_db: 22.5
    dl_bytes_per_slot: 4000
  - rnti: 18
"#;
        let config = SimConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.ues.len(), 2);
        assert_eq!(config.ues[1].sinr_db, 15.0);
        assert_eq!(config.ues[1].dl_bytes_per_slot, 0);

        let mac = config.to_mac_config().unwrap();
        assert_eq!(mac.cell_id, CellId(3));
        assert_eq!(mac.scs, SubcarrierSpacing::Scs15);
        assert_eq!(mac.bandwidth, Bandwidth::Bw10);
        assert_eq!(mac.num_rbs(), 55);
        assert_eq!(mac.scheduler.policy, PolicyKind::ProportionalFair);
        assert_eq!(mac.scheduler.access, AccessMode::Tdma);
        assert_eq!(mac.scheduler.ul_symbols, 0);
        assert_eq!(mac.scheduler.pf_fairness_alpha, 0.5);
        assert_eq!(mac.error_model.combining, Combining::IncrementalRedundancy);
        assert_eq!(mac.error_model.bler_target, 0.05);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut config = SimConfig::default();
        config.scheduler.policy = "fifo".to_string();
        assert!(config.to_mac_config().is_err());

        let mut config = SimConfig::default();
        config.cell.common_scs = 45;
        assert!(config.to_mac_config().is_err());

        let mut config = SimConfig::default();
        config.cell.channel_bandwidth_mhz = 7;
        assert!(config.to_mac_config().is_err());

        let mut config = SimConfig::default();
        config.scheduler.rbg_size = 0;
        assert!(config.to_mac_config().is_err());
    }
}
