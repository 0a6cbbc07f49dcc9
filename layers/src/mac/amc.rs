//! Adaptive modulation and coding
//!
//! Link adaptation on top of the error model: picks the highest MCS meeting the
//! BLER target for a measured SINR, converts between CQI and MCS, and sizes
//! transport blocks.

use crate::phy::error_model::{bler, sinr_eff, SinrAttempt};
use common::mcs::{cqi_from_mcs, mcs_entry, MAX_MCS};
use common::utils::SUBCARRIERS_PER_RB;
use std::time::Duration;

/// CRC attached to every transport block, in bits
const TB_CRC_BITS: u64 = 24;

/// Link adaptation helper
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Amc {
    bler_target: f64,
}

impl Amc {
    /// Create an AMC module for a BLER target
    pub fn new(bler_target: f64) -> Self {
        Self { bler_target }
    }

    /// Highest MCS whose BLER at the attempt's SINR meets the target.
    ///
    /// Returns `None` for an attempt without resources.
    pub fn mcs_from_attempt(&self, attempt: &SinrAttempt) -> Option<u8> {
        if attempt.map().is_empty() {
            return None;
        }
        let mcs = (0..=MAX_MCS)
            .rev()
            .find(|&mcs| {
                sinr_eff(attempt.sinr(), attempt.map(), mcs)
                    .is_some_and(|eff| bler(eff, mcs) <= self.bler_target)
            })
            .unwrap_or(0);
        Some(mcs)
    }

    /// CQI to report for an attempt; 0 when even MCS 0 misses the target
    pub fn cqi_from_attempt(&self, attempt: &SinrAttempt) -> Option<u8> {
        let mcs = self.mcs_from_attempt(attempt)?;
        if mcs == 0 {
            let eff = sinr_eff(attempt.sinr(), attempt.map(), 0)?;
            if bler(eff, 0) > self.bler_target {
                return Some(0);
            }
        }
        Some(cqi_from_mcs(mcs))
    }

    /// Transport block size in bytes for a resource assignment
    pub fn tbs_bytes(&self, mcs: u8, num_rbs: usize, num_sym: u8) -> u32 {
        let entry = mcs_entry(mcs);
        let num_re = SUBCARRIERS_PER_RB as u64 * num_sym as u64 * num_rbs as u64;
        let ninfo = (num_re as f64 * entry.code_rate() * entry.qm as f64).floor() as u64;
        let bits = (ninfo / 8) * 8;
        (bits.saturating_sub(TB_CRC_BITS) / 8) as u32
    }

    /// Resource elements of an assignment
    pub fn re_count(&self, num_rbs: usize, num_sym: u8) -> u32 {
        SUBCARRIERS_PER_RB * num_rbs as u32 * num_sym as u32
    }

    /// Bit rate of an assignment repeated every slot; 0 for a zero-length slot
    pub fn achievable_rate_bps(
        &self,
        mcs: u8,
        num_rbs: usize,
        num_sym: u8,
        slot_duration: Duration,
    ) -> f64 {
        let secs = slot_duration.as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        self.tbs_bytes(mcs, num_rbs, num_sym) as f64 * 8.0 / secs
    }
}
