//! Link-to-system error model
//!
//! Maps the per-RB SINR of one or more transmissions of a transport block to a
//! single effective SINR (EESM), and that value to a block error probability
//! through a fitted curve per MCS. HARQ soft combining is modelled in two
//! flavours:
//!
//! * Chase combining: every retransmission carries the same coded bits, the
//!   SINR of all attempts is summed per resource.
//! * Incremental redundancy: every retransmission carries new parity bits, the
//!   resources of all attempts are pooled and the block is evaluated at the
//!   lower effective code rate.

use crate::LayerError;
use common::mcs::{mcs_entry, MAX_MCS};
use common::utils::linear_to_db;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tracing::{debug, trace};

/// EESM calibration factor per MCS of table 1
static EESM_BETA: [f64; 29] = [
    1.60, 1.61, 1.63, 1.65, 1.67, 1.70, 1.73, 1.76, 1.79, 1.82,
    3.97, 4.27, 4.71, 5.16, 5.66, 6.16, 6.50,
    9.95, 10.97, 12.92, 14.96, 17.06, 19.33, 21.85, 24.51, 27.14, 29.94, 32.05, 34.28,
];

/// Fraction of the Shannon capacity reached by the fitted receiver
const IMPLEMENTATION_EFFICIENCY: f64 = 0.75;

/// BLER curve slope around the 10% point, per dB
const BLER_SLOPE_PER_DB: f64 = 2.0;

/// HARQ soft-combining strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Combining {
    /// Same redundancy version, SINR summed per resource
    Chase,
    /// New redundancy versions, resources pooled at a lower code rate
    IncrementalRedundancy,
}

impl FromStr for Combining {
    type Err = LayerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cc" | "chase" => Ok(Combining::Chase),
            "ir" | "incremental-redundancy" => Ok(Combining::IncrementalRedundancy),
            _ => Err(LayerError::InvalidConfiguration(
                format!("Unknown HARQ combining: {}", s)
            )),
        }
    }
}

/// Error model configuration
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorModelConfig {
    /// Soft-combining strategy
    pub combining: Combining,
    /// Target BLER used by link adaptation
    pub bler_target: f64,
    /// Seed of the decoding draws
    pub decode_seed: u64,
}

impl Default for ErrorModelConfig {
    fn default() -> Self {
        Self {
            combining: Combining::Chase,
            bler_target: 0.1,
            decode_seed: 1,
        }
    }
}

impl ErrorModelConfig {
    /// Reject values the model cannot work with
    pub fn validate(&self) -> Result<(), LayerError> {
        if !(self.bler_target > 0.0 && self.bler_target < 1.0) {
            return Err(LayerError::InvalidConfiguration(
                format!("BLER target must be in (0, 1), got {}", self.bler_target)
            ));
        }
        Ok(())
    }
}

/// One transmission attempt of a transport block
#[derive(Debug, Clone, PartialEq)]
pub struct SinrAttempt {
    sinr: Vec<f64>,
    map: Vec<usize>,
    mcs: u8,
    re_count: u32,
}

impl SinrAttempt {
    /// Create an attempt from per-RB linear SINR and the RBs used.
    ///
    /// # Panics
    /// If the map is longer than the SINR vector or addresses an RB outside it.
    pub fn new(sinr: Vec<f64>, map: Vec<usize>, mcs: u8, re_count: u32) -> Self {
        assert!(
            map.len() <= sinr.len(),
            "RB map of {} entries exceeds the {} RBs of the model",
            map.len(), sinr.len()
        );
        if let Some(&bad) = map.iter().find(|&&rb| rb >= sinr.len()) {
            panic!("RB map index {} outside the {} RBs of the model", bad, sinr.len());
        }
        Self { sinr, map, mcs, re_count }
    }

    /// Per-RB linear SINR
    pub fn sinr(&self) -> &[f64] {
        &self.sinr
    }

    /// RBs used by the attempt
    pub fn map(&self) -> &[usize] {
        &self.map
    }

    /// MCS the attempt was sent with
    pub fn mcs(&self) -> u8 {
        self.mcs
    }

    /// Resource elements carrying data
    pub fn re_count(&self) -> u32 {
        self.re_count
    }

    fn coded_bits(&self) -> u64 {
        self.re_count as u64 * mcs_entry(self.mcs).qm as u64
    }
}

/// SINR vector produced by Chase combining
#[derive(Debug, Clone, PartialEq)]
pub struct CombinedSinr {
    /// Unified resource indices, `0..max map length`
    pub map: Vec<usize>,
    /// Summed linear SINR per unified index
    pub values: Vec<f64>,
}

/// Chase-combine a set of attempts.
///
/// The unified map is as long as the longest attempt map. Entry `j` sums, over
/// all attempts, the SINR at `map[j % map.len()]` of that attempt, so attempts
/// that used fewer RBs wrap around their own map. This is an approximation for
/// irregular retransmission patterns and is kept as is.
pub fn chase_combine<'a, I>(attempts: I) -> Option<CombinedSinr>
where
    I: IntoIterator<Item = &'a SinrAttempt>,
{
    let attempts: Vec<&SinrAttempt> = attempts
        .into_iter()
        .filter(|a| !a.map.is_empty())
        .collect();
    let len = attempts.iter().map(|a| a.map.len()).max()?;

    let values = (0..len)
        .map(|j| {
            attempts
                .iter()
                .map(|a| a.sinr[a.map[j % a.map.len()]])
                .sum()
        })
        .collect();

    Some(CombinedSinr {
        map: (0..len).collect(),
        values,
    })
}

/// Exponential effective SINR mapping over the mapped entries, linear in and out.
///
/// Returns `None` for an empty map.
pub fn sinr_eff(values: &[f64], map: &[usize], mcs: u8) -> Option<f64> {
    if map.is_empty() {
        return None;
    }
    let beta = EESM_BETA[mcs.min(MAX_MCS) as usize];

    // Shift by the minimum so every exponent is <= 0 and the sum is >= 1.
    let min = map.iter().map(|&i| values[i]).fold(f64::INFINITY, f64::min);
    let sum: f64 = map.iter().map(|&i| (-(values[i] - min) / beta).exp()).sum();
    let mean = sum / map.len() as f64;

    Some(min - beta * mean.ln())
}

/// SINR threshold in dB at which an MCS reaches 10% BLER
pub fn bler_threshold_db(mcs: u8) -> f64 {
    let se = mcs_entry(mcs).spectral_efficiency();
    linear_to_db(2f64.powf(se / IMPLEMENTATION_EFFICIENCY) - 1.0)
}

/// Fitted block error probability for a linear effective SINR
pub fn bler(sinr_eff: f64, mcs: u8) -> f64 {
    let x_db = linear_to_db(sinr_eff.max(1e-30));
    let exponent = BLER_SLOPE_PER_DB * (x_db - bler_threshold_db(mcs));
    1.0 / (1.0 + 9.0 * exponent.exp())
}

/// Effective SINR of a transport block
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EffectiveSinr {
    /// Linear effective SINR
    pub linear: f64,
    /// MCS the value must be evaluated against
    pub mcs: u8,
}

impl EffectiveSinr {
    /// Effective SINR in dB
    pub fn db(&self) -> f64 {
        linear_to_db(self.linear)
    }
}

/// Decoding statistics of one transport block
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TbStats {
    /// Effective SINR after combining
    pub sinr_eff: EffectiveSinr,
    /// Block error probability
    pub bler: f64,
}

/// Error model with its decoding random stream
#[derive(Debug)]
pub struct ErrorModel {
    config: ErrorModelConfig,
    rng: StdRng,
}

impl ErrorModel {
    /// Create an error model
    pub fn new(config: ErrorModelConfig) -> Result<Self, LayerError> {
        config.validate()?;
        let rng = StdRng::seed_from_u64(config.decode_seed);
        Ok(Self { config, rng })
    }

    /// Model configuration
    pub fn config(&self) -> &ErrorModelConfig {
        &self.config
    }

    /// Combine the current attempt with the earlier ones of the same block.
    ///
    /// Returns `None` when no attempt carries any resource.
    pub fn compute_effective_sinr(
        &self,
        current: &SinrAttempt,
        history: &[SinrAttempt],
        tbs_bytes: u32,
    ) -> Option<EffectiveSinr> {
        if current.map.is_empty() {
            debug!("Empty RB map, no effective SINR");
            return None;
        }
        if history.is_empty() {
            let linear = sinr_eff(&current.sinr, &current.map, current.mcs)?;
            return Some(EffectiveSinr { linear, mcs: current.mcs });
        }

        match self.config.combining {
            Combining::Chase => {
                let combined = chase_combine(history.iter().chain(std::iter::once(current)))?;
                trace!("Chase combined {} attempts over {} resources",
                       history.len() + 1, combined.map.len());
                let linear = sinr_eff(&combined.values, &combined.map, current.mcs)?;
                Some(EffectiveSinr { linear, mcs: current.mcs })
            }
            Combining::IncrementalRedundancy => {
                let attempts = || history.iter().chain(std::iter::once(current));
                let pooled: Vec<f64> = attempts()
                    .flat_map(|a| a.map.iter().map(move |&rb| a.sinr[rb]))
                    .collect();
                let coded_bits: u64 = attempts().map(SinrAttempt::coded_bits).sum();
                let mcs = if coded_bits == 0 {
                    current.mcs
                } else {
                    let ecr = (tbs_bytes as f64 * 8.0) / coded_bits as f64;
                    equivalent_mcs(current.mcs, ecr)
                };
                trace!("IR pooled {} resources of {} attempts, equivalent MCS {}",
                       pooled.len(), history.len() + 1, mcs);
                let map: Vec<usize> = (0..pooled.len()).collect();
                let linear = sinr_eff(&pooled, &map, mcs)?;
                Some(EffectiveSinr { linear, mcs })
            }
        }
    }

    /// Effective SINR and BLER of a transport block
    pub fn evaluate(
        &self,
        current: &SinrAttempt,
        history: &[SinrAttempt],
        tbs_bytes: u32,
    ) -> Option<TbStats> {
        let sinr_eff = self.compute_effective_sinr(current, history, tbs_bytes)?;
        Some(TbStats {
            sinr_eff,
            bler: bler(sinr_eff.linear, sinr_eff.mcs),
        })
    }

    /// Draw the decoding outcome; true when the block is decoded
    pub fn decode(&mut self, bler: f64) -> bool {
        let draw: f64 = self.rng.gen();
        draw >= bler
    }
}

/// Lowest MCS with the modulation of `mcs` whose code rate reaches `ecr`
fn equivalent_mcs(mcs: u8, ecr: f64) -> u8 {
    let qm = mcs_entry(mcs).qm;
    let same_modulation: Vec<u8> = (0..=MAX_MCS).filter(|&m| mcs_entry(m).qm == qm).collect();
    same_modulation
        .iter()
        .copied()
        .find(|&m| mcs_entry(m).code_rate() >= ecr)
        .or_else(|| same_modulation.last().copied())
        .unwrap_or(mcs)
}
