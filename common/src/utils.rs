//! Common Utilities
//!
//! Provides utility functions used across the scheduler implementation

use crate::types::SubcarrierSpacing;
use tracing::trace;

/// Number of subcarriers in one resource block
pub const SUBCARRIERS_PER_RB: u32 = 12;

/// Calculate resource blocks from bandwidth and subcarrier spacing
pub fn calculate_nrb(bandwidth_hz: u32, scs_khz: u16) -> u16 {
    let scs_hz = scs_khz as u32 * 1000;
    let total_subcarriers = bandwidth_hz / scs_hz;
    let nrb = total_subcarriers / SUBCARRIERS_PER_RB;

    trace!("Calculated {} RBs for {}Hz bandwidth with {}kHz SCS",
           nrb, bandwidth_hz, scs_khz);

    nrb as u16
}

/// Convert a linear power ratio to dB
pub fn linear_to_db(linear: f64) -> f64 {
    10.0 * linear.log10()
}

/// Convert a dB value to a linear power ratio
pub fn db_to_linear(db: f64) -> f64 {
    10f64.powf(db / 10.0)
}

/// Time utilities for slot/frame calculations
pub mod time {
    use super::SubcarrierSpacing;

    /// Number of slots per frame (10ms)
    pub fn slots_per_frame(scs: SubcarrierSpacing) -> u64 {
        10u64 << scs.numerology()
    }

    /// Split an absolute slot counter into (SFN, slot in frame)
    pub fn sfn_slot(abs_slot: u64, scs: SubcarrierSpacing) -> (u16, u16) {
        let per_frame = slots_per_frame(scs);
        let sfn = (abs_slot / per_frame) % 1024;
        (sfn as u16, (abs_slot % per_frame) as u16)
    }
}
