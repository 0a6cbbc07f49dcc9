//! Per-UE scheduling state
//!
//! Every configured UE has one [`UeRecord`] in the scheduler arena, holding a
//! [`LinkState`] per direction: buffer occupancy, link adaptation state, the
//! policy metric and the HARQ process table.

use super::harq::HarqProcessVector;
use common::mcs::mcs_from_cqi;
use common::types::{BeamId, Direction, Rnti};
use interfaces::message_types::{LcgBufferStatus, UeConfigRequest};
use std::collections::BTreeMap;

/// Pending bytes per logical channel group
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LcgBuffers(BTreeMap<u8, u32>);

impl LcgBuffers {
    /// Buffers from a list of per-LCG statuses
    pub fn from_statuses(statuses: &[LcgBufferStatus]) -> Self {
        let mut buffers = Self::default();
        for status in statuses {
            buffers.set(status.lcg, status.bytes);
        }
        buffers
    }

    /// Replace the pending bytes of an LCG
    pub fn set(&mut self, lcg: u8, bytes: u32) {
        if bytes == 0 {
            self.0.remove(&lcg);
        } else {
            self.0.insert(lcg, bytes);
        }
    }

    /// Pending bytes of an LCG
    pub fn get(&self, lcg: u8) -> u32 {
        self.0.get(&lcg).copied().unwrap_or(0)
    }

    /// Pending bytes over all LCGs
    pub fn total(&self) -> u64 {
        self.0.values().map(|&b| b as u64).sum()
    }

    /// True when nothing is pending
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Remove up to `bytes` from the buffers, lowest LCG first.
    ///
    /// Returns the bytes taken per LCG.
    pub fn drain(&mut self, mut bytes: u32) -> Vec<LcgBufferStatus> {
        let mut taken = Vec::new();
        for (&lcg, pending) in self.0.iter_mut() {
            if bytes == 0 {
                break;
            }
            let amount = (*pending).min(bytes);
            *pending -= amount;
            bytes -= amount;
            taken.push(LcgBufferStatus { lcg, bytes: amount });
        }
        self.0.retain(|_, pending| *pending > 0);
        taken
    }
}

/// Proportional-fair bookkeeping
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PfMetric {
    /// Exponentially averaged served throughput in bit/s
    pub avg_tput: f64,
    /// Average at the start of the current cycle
    pub last_avg_tput: f64,
    /// Throughput achievable with the current MCS on one RBG
    pub potential_tput: f64,
}

/// Policy-specific metric of one UE in one direction
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UeMetric {
    /// Service stamp of the latest grain, 0 when never served
    RoundRobin { last_served: u64 },
    /// Average and potential throughput
    ProportionalFair(PfMetric),
    /// Ordered by MCS only
    MaxRate,
    /// Ordered by a per-cycle shuffle
    Random,
}

/// Resources assigned during the cycle being scheduled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Assignment {
    /// Frequency grains
    pub num_rbg: u16,
    /// Time grains
    pub num_sym: u8,
}

impl Assignment {
    /// True when nothing was assigned
    pub fn is_empty(&self) -> bool {
        self.num_rbg == 0 || self.num_sym == 0
    }
}

/// Per-direction counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LinkStats {
    /// New transport blocks sent
    pub new_tx: u64,
    /// Retransmissions sent
    pub retx: u64,
    /// Blocks acknowledged
    pub acks: u64,
    /// Negative acknowledgements received
    pub nacks: u64,
    /// Blocks abandoned after the last retransmission or a feedback timeout
    pub drops: u64,
    /// Bytes acknowledged
    pub delivered_bytes: u64,
    /// Bytes abandoned
    pub dropped_bytes: u64,
    /// Cycles skipped because the HARQ table was full
    pub harq_full_skips: u64,
}

/// Scheduling state of one UE in one direction
#[derive(Debug, Clone)]
pub struct LinkState {
    /// Pending bytes
    pub buffers: LcgBuffers,
    /// Latest channel quality indicator
    pub cqi: u8,
    /// Coding level used for new data
    pub mcs: u8,
    /// Policy metric
    pub metric: UeMetric,
    /// HARQ processes
    pub harq: HarqProcessVector,
    /// Counters
    pub stats: LinkStats,
    /// Resources assigned in the cycle being scheduled
    pub assigned: Assignment,
    /// Slot of the last transport block sent
    pub last_scheduled_slot: Option<u64>,
}

impl LinkState {
    fn new(buffers: &[LcgBufferStatus], cqi: u8, metric: UeMetric, harq_size: u8) -> Self {
        Self {
            buffers: LcgBuffers::from_statuses(buffers),
            cqi,
            mcs: mcs_from_cqi(cqi),
            metric,
            harq: HarqProcessVector::new(harq_size),
            stats: LinkStats::default(),
            assigned: Assignment::default(),
            last_scheduled_slot: None,
        }
    }

    /// Update the CQI and derive the MCS from it
    pub fn set_cqi(&mut self, cqi: u8) {
        self.cqi = cqi;
        self.mcs = mcs_from_cqi(cqi);
    }
}

/// Scheduling record of one UE
#[derive(Debug, Clone)]
pub struct UeRecord {
    /// C-RNTI
    pub rnti: Rnti,
    /// Serving beam
    pub beam_id: BeamId,
    /// Downlink state
    pub dl: LinkState,
    /// Uplink state
    pub ul: LinkState,
}

impl UeRecord {
    /// Build a record from a configuration request
    pub fn new(request: &UeConfigRequest, metric: UeMetric, harq_size: u8) -> Self {
        Self {
            rnti: request.rnti,
            beam_id: request.beam_id,
            dl: LinkState::new(&request.dl_buffers, request.initial_cqi, metric, harq_size),
            ul: LinkState::new(&request.ul_buffers, request.initial_cqi, metric, harq_size),
        }
    }

    /// State of one direction
    pub fn link(&self, direction: Direction) -> &LinkState {
        match direction {
            Direction::Downlink => &self.dl,
            Direction::Uplink => &self.ul,
        }
    }

    /// Mutable state of one direction
    pub fn link_mut(&mut self, direction: Direction) -> &mut LinkState {
        match direction {
            Direction::Downlink => &mut self.dl,
            Direction::Uplink => &mut self.ul,
        }
    }
}
