//! Medium Access Control (MAC) Layer Implementation
//!
//! Downlink and uplink resource scheduling for the gNB MAC (3GPP TS 38.321),
//! with HARQ process management and link adaptation driven by the error model.

pub mod allocation;
pub mod amc;
pub mod harq;
pub mod policy;
pub mod scheduler;
pub mod ue;

use crate::phy::ErrorModelConfig;
use crate::LayerError;
use async_trait::async_trait;
use common::types::{Bandwidth, CellId, Direction, Rnti, SubcarrierSpacing};
use common::utils::calculate_nrb;
use interfaces::message_types::{
    BufferStatusReport, CqiReport, DecodeResult, HarqFeedback, HarqOutcome, SinrReport,
    SlotAllocation, SlotIndication, UeConfigRequest,
};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

pub use allocation::AccessMode;
pub use amc::Amc;
pub use harq::{HarqError, HarqId, HarqProcess, HarqProcessVector, HarqStatus, HARQ_ID_UNAVAILABLE};
pub use policy::{PfParams, PolicyKind, SchedulingPolicy};
pub use scheduler::MacScheduler;
pub use ue::{LinkState, LinkStats, UeMetric, UeRecord};

/// Symbols in one slot with normal cyclic prefix
pub const SYMBOLS_PER_SLOT: u8 = 14;

/// Scheduler configuration
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    /// Ordering policy
    pub policy: PolicyKind,
    /// TDMA or OFDMA sharing
    pub access: AccessMode,
    /// RBs per RBG
    pub rbg_size: u16,
    /// Data symbols per slot in downlink, 0 disables the direction
    pub dl_symbols: u8,
    /// Data symbols per slot in uplink, 0 disables the direction
    pub ul_symbols: u8,
    /// HARQ processes per UE and direction
    pub max_harq_processes: u8,
    /// Retransmissions before a block is dropped
    pub max_retx: u8,
    /// Slots a process may wait for feedback, 0 waits forever
    pub harq_timeout_slots: u64,
    /// Proportional-fair averaging window in slots
    pub pf_time_window: f64,
    /// Proportional-fair fairness exponent
    pub pf_fairness_alpha: f64,
    /// Seed of the random policy
    pub random_seed: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            policy: PolicyKind::RoundRobin,
            access: AccessMode::Ofdma,
            rbg_size: 4,
            dl_symbols: 12,
            ul_symbols: 12,
            max_harq_processes: 16,
            max_retx: 3,
            harq_timeout_slots: 32,
            pf_time_window: 99.0,
            pf_fairness_alpha: 1.0,
            random_seed: 1,
        }
    }
}

impl SchedulerConfig {
    /// Check the values against a carrier of `num_rbs` RBs
    pub fn validate(&self, num_rbs: u16) -> Result<(), LayerError> {
        if self.rbg_size == 0 || self.rbg_size > num_rbs {
            return Err(LayerError::InvalidConfiguration(
                format!("RBG size {} invalid for a carrier of {} RBs", self.rbg_size, num_rbs)
            ));
        }
        for (direction, symbols) in [
            (Direction::Downlink, self.dl_symbols),
            (Direction::Uplink, self.ul_symbols),
        ] {
            if symbols > SYMBOLS_PER_SLOT {
                return Err(LayerError::InvalidConfiguration(
                    format!("{} symbols {} exceed the {} of a slot", direction, symbols, SYMBOLS_PER_SLOT)
                ));
            }
        }
        if self.max_harq_processes == 0 || self.max_harq_processes == u8::MAX {
            return Err(LayerError::InvalidConfiguration(
                format!("HARQ processes must be 1-254, got {}", self.max_harq_processes)
            ));
        }
        if !(self.pf_time_window >= 1.0) {
            return Err(LayerError::InvalidConfiguration(
                format!("PF time window must be at least 1 slot, got {}", self.pf_time_window)
            ));
        }
        if !(self.pf_fairness_alpha >= 0.0 && self.pf_fairness_alpha.is_finite()) {
            return Err(LayerError::InvalidConfiguration(
                format!("PF fairness exponent must be non-negative, got {}", self.pf_fairness_alpha)
            ));
        }
        Ok(())
    }

    /// Proportional-fair parameters
    pub fn pf_params(&self) -> PfParams {
        PfParams {
            time_window: self.pf_time_window,
            fairness_alpha: self.pf_fairness_alpha,
        }
    }

    /// Symbol budget of a direction
    pub fn symbols(&self, direction: Direction) -> u8 {
        match direction {
            Direction::Downlink => self.dl_symbols,
            Direction::Uplink => self.ul_symbols,
        }
    }
}

/// MAC layer configuration
#[derive(Debug, Clone, PartialEq)]
pub struct MacConfig {
    /// Cell ID
    pub cell_id: CellId,
    /// Carrier center frequency in Hz
    pub center_frequency_hz: f64,
    /// Subcarrier spacing
    pub scs: SubcarrierSpacing,
    /// Bandwidth
    pub bandwidth: Bandwidth,
    /// Maximum number of UEs
    pub max_ues: u16,
    /// Scheduler settings
    pub scheduler: SchedulerConfig,
    /// Error model settings
    pub error_model: ErrorModelConfig,
}

impl Default for MacConfig {
    fn default() -> Self {
        Self {
            cell_id: CellId(1),
            center_frequency_hz: 3.5e9,
            scs: SubcarrierSpacing::Scs30,
            bandwidth: Bandwidth::Bw20,
            max_ues: 32,
            scheduler: SchedulerConfig::default(),
            error_model: ErrorModelConfig::default(),
        }
    }
}

impl MacConfig {
    /// Resource blocks of the carrier
    pub fn num_rbs(&self) -> u16 {
        calculate_nrb(self.bandwidth.as_hz(), self.scs.khz() as u16)
    }

    /// Resource block groups of the carrier, the last one possibly partial
    pub fn num_rbg(&self) -> u16 {
        let rbg_size = self.scheduler.rbg_size.max(1);
        self.num_rbs().div_ceil(rbg_size)
    }

    /// Reject configurations the scheduler cannot run with
    pub fn validate(&self) -> Result<(), LayerError> {
        if self.max_ues == 0 {
            return Err(LayerError::InvalidConfiguration("max_ues must be positive".into()));
        }
        self.scheduler.validate(self.num_rbs())?;
        self.error_model.validate()
    }
}

/// Upper MAC service access point
#[async_trait]
pub trait MacSchedInterface: Send + Sync {
    /// Add a UE with its initial buffers
    async fn configure_ue(&self, request: UeConfigRequest) -> Result<(), LayerError>;

    /// Remove a UE; false when it was not configured
    async fn release_ue(&self, rnti: Rnti) -> Result<bool, LayerError>;

    /// Update pending bytes of one LCG
    async fn buffer_status(&self, report: BufferStatusReport) -> Result<(), LayerError>;
}

/// PHY service access point
#[async_trait]
pub trait MacPhyInterface: Send + Sync {
    /// Run one scheduling cycle
    async fn slot_indication(&self, indication: SlotIndication) -> Result<SlotAllocation, LayerError>;

    /// Evaluate a received transport block
    async fn sinr_report(&self, report: SinrReport) -> Result<DecodeResult, LayerError>;

    /// Apply explicit decoder feedback
    async fn harq_feedback(&self, feedback: HarqFeedback) -> Result<HarqOutcome, LayerError>;

    /// Apply a channel quality report
    async fn cqi_report(&self, report: CqiReport) -> Result<(), LayerError>;
}

/// MAC layer shared between the driver tasks
pub struct MacLayer {
    config: MacConfig,
    scheduler: Arc<Mutex<MacScheduler>>,
    initialized: bool,
}

impl MacLayer {
    /// Create a new MAC layer instance
    pub fn new(config: MacConfig) -> Result<Self, LayerError> {
        let scheduler = MacScheduler::new(config.clone())?;

        Ok(Self {
            config,
            scheduler: Arc::new(Mutex::new(scheduler)),
            initialized: false,
        })
    }

    /// Start accepting requests
    pub async fn initialize(&mut self) -> Result<(), LayerError> {
        info!("Initializing MAC layer");
        debug!("MAC config: cell_id={}, scs={:?}, bandwidth={:?}, policy={}, access={}",
               self.config.cell_id.0,
               self.config.scs,
               self.config.bandwidth,
               self.config.scheduler.policy,
               self.config.scheduler.access);

        self.initialized = true;
        info!("MAC layer initialized successfully");
        Ok(())
    }

    /// Stop accepting requests
    pub async fn shutdown(&mut self) -> Result<(), LayerError> {
        info!("Shutting down MAC layer");
        self.initialized = false;
        Ok(())
    }

    /// Layer configuration
    pub fn config(&self) -> &MacConfig {
        &self.config
    }

    /// Shared handle on the scheduler
    pub fn scheduler(&self) -> Arc<Mutex<MacScheduler>> {
        Arc::clone(&self.scheduler)
    }

    fn ensure_initialized(&self) -> Result<(), LayerError> {
        if !self.initialized {
            return Err(LayerError::NotInitialized);
        }
        Ok(())
    }
}

#[async_trait]
impl MacSchedInterface for MacLayer {
    async fn configure_ue(&self, request: UeConfigRequest) -> Result<(), LayerError> {
        self.ensure_initialized()?;
        self.scheduler.lock().await.add_ue(&request)
    }

    async fn release_ue(&self, rnti: Rnti) -> Result<bool, LayerError> {
        self.ensure_initialized()?;
        Ok(self.scheduler.lock().await.remove_ue(rnti))
    }

    async fn buffer_status(&self, report: BufferStatusReport) -> Result<(), LayerError> {
        self.ensure_initialized()?;
        self.scheduler.lock().await.update_buffer(&report)
    }
}

#[async_trait]
impl MacPhyInterface for MacLayer {
    async fn slot_indication(&self, indication: SlotIndication) -> Result<SlotAllocation, LayerError> {
        self.ensure_initialized()?;
        let mut scheduler = self.scheduler.lock().await;
        Ok(scheduler.schedule_slot(indication.slot))
    }

    async fn sinr_report(&self, report: SinrReport) -> Result<DecodeResult, LayerError> {
        self.ensure_initialized()?;
        Ok(self.scheduler.lock().await.on_sinr_report(report))
    }

    async fn harq_feedback(&self, feedback: HarqFeedback) -> Result<HarqOutcome, LayerError> {
        self.ensure_initialized()?;
        Ok(self.scheduler.lock().await.on_harq_feedback(&feedback))
    }

    async fn cqi_report(&self, report: CqiReport) -> Result<(), LayerError> {
        self.ensure_initialized()?;
        self.scheduler.lock().await.on_cqi_report(&report)
    }
}
