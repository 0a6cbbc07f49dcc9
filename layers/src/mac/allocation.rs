//! Grain layout helpers
//!
//! Splitting of the symbol budget across beams for OFDMA and contiguous
//! placement of the grains a UE won.

use crate::LayerError;
use common::types::BeamId;
use interfaces::message_types::ResourceGrant;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// How grains are shared between UEs in one slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessMode {
    /// Whole band per symbol, one UE per symbol
    Tdma,
    /// RBGs shared between UEs of a beam within the beam's symbols
    Ofdma,
}

impl FromStr for AccessMode {
    type Err = LayerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tdma" => Ok(AccessMode::Tdma),
            "ofdma" => Ok(AccessMode::Ofdma),
            _ => Err(LayerError::InvalidConfiguration(
                format!("Unknown access mode: {}", s)
            )),
        }
    }
}

impl fmt::Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccessMode::Tdma => f.write_str("tdma"),
            AccessMode::Ofdma => f.write_str("ofdma"),
        }
    }
}

/// Symbols reserved for one beam
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BeamWindow {
    /// Beam served in the window
    pub beam: BeamId,
    /// First symbol
    pub sym_start: u8,
    /// Number of symbols
    pub num_sym: u8,
}

/// Split `num_sym` symbols starting at `first_sym` across beams in proportion
/// to their number of UEs.
///
/// Beams with more UEs, then lower beam id, come first and get at least one
/// symbol each while symbols last. Windows are consecutive.
pub fn split_symbols_by_beam(beams: &[(BeamId, usize)], first_sym: u8, num_sym: u8) -> Vec<BeamWindow> {
    let mut order: Vec<(BeamId, usize)> = beams.iter().copied().filter(|&(_, n)| n > 0).collect();
    order.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    order.truncate(num_sym as usize);
    if order.is_empty() {
        return Vec::new();
    }

    let total_ues: usize = order.iter().map(|&(_, n)| n).sum();
    let quota: Vec<f64> = order
        .iter()
        .map(|&(_, n)| num_sym as f64 * n as f64 / total_ues as f64)
        .collect();
    let mut share: Vec<u8> = quota.iter().map(|q| (q.floor() as u8).max(1)).collect();

    // Minimum shares may overshoot: take back from the largest, latest beam
    while share.iter().map(|&s| s as u32).sum::<u32>() > num_sym as u32 {
        let Some(idx) = (0..share.len()).filter(|&i| share[i] > 1).max_by_key(|&i| share[i]) else {
            break;
        };
        share[idx] -= 1;
    }
    // Hand out what flooring left over, largest shortfall first
    while share.iter().map(|&s| s as u32).sum::<u32>() < num_sym as u32 {
        let mut best = 0;
        for i in 1..share.len() {
            if quota[i] - share[i] as f64 > quota[best] - share[best] as f64 {
                best = i;
            }
        }
        share[best] += 1;
    }

    let mut next = first_sym;
    order
        .iter()
        .zip(share)
        .map(|(&(beam, _), num_sym)| {
            let window = BeamWindow { beam, sym_start: next, num_sym };
            next += num_sym;
            window
        })
        .collect()
}

/// Grant of `num_rbg` RBGs from `first_rbg` over a symbol range
pub fn contiguous_grant(first_rbg: u16, num_rbg: u16, sym_start: u8, num_sym: u8) -> ResourceGrant {
    ResourceGrant {
        rbgs: (first_rbg..first_rbg + num_rbg).collect(),
        sym_start,
        num_sym,
    }
}
