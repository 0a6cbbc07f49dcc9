//! Scheduling policies
//!
//! Closed set of policies selected by configuration. Each provides the same
//! three operations: a metric factory for new UEs, a comparison deciding who is
//! served first, and hooks updating the metric once per grain assigned (and
//! once per cycle for UEs left without resources).

use super::amc::Amc;
use super::ue::{LinkState, PfMetric, UeMetric, UeRecord};
use crate::LayerError;
use common::types::Direction;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Available policies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PolicyKind {
    /// Longest time since last served first
    RoundRobin,
    /// Highest ratio of achievable to average throughput first
    ProportionalFair,
    /// Highest MCS first
    MaxRate,
    /// Seeded shuffle every cycle
    Random,
}

impl FromStr for PolicyKind {
    type Err = LayerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "rr" | "round-robin" => Ok(PolicyKind::RoundRobin),
            "pf" | "proportional-fair" => Ok(PolicyKind::ProportionalFair),
            "mr" | "max-rate" => Ok(PolicyKind::MaxRate),
            "random" => Ok(PolicyKind::Random),
            _ => Err(LayerError::InvalidConfiguration(
                format!("Unknown scheduling policy: {}", s)
            )),
        }
    }
}

impl fmt::Display for PolicyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PolicyKind::RoundRobin => "round-robin",
            PolicyKind::ProportionalFair => "proportional-fair",
            PolicyKind::MaxRate => "max-rate",
            PolicyKind::Random => "random",
        };
        f.write_str(name)
    }
}

/// Proportional-fair parameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PfParams {
    /// Averaging window in slots
    pub time_window: f64,
    /// Exponent applied to the average throughput
    pub fairness_alpha: f64,
}

impl Default for PfParams {
    fn default() -> Self {
        Self {
            time_window: 99.0,
            fairness_alpha: 1.0,
        }
    }
}

/// What the hooks need to know about the cycle being scheduled
#[derive(Debug, Clone, Copy)]
pub struct CycleContext {
    /// Link adaptation helper
    pub amc: Amc,
    /// Duration of one slot
    pub slot_duration: Duration,
    /// RBs per RBG
    pub rbg_size: u16,
    /// RBs of the carrier
    pub carrier_rbs: u16,
    /// Symbols one frequency grain spans
    pub symbols: u8,
}

impl CycleContext {
    /// RBs that `num_rbg` RBGs cover wherever they sit in the carrier.
    ///
    /// The last RBG may be partial, so its shortfall is always deducted.
    pub fn guaranteed_rbs(&self, num_rbg: u16) -> usize {
        let rbg_size = self.rbg_size as usize;
        let carrier_rbs = self.carrier_rbs as usize;
        if rbg_size == 0 {
            return 0;
        }
        let shortfall = carrier_rbs.div_ceil(rbg_size) * rbg_size - carrier_rbs;
        (num_rbg as usize * rbg_size)
            .saturating_sub(shortfall)
            .min(carrier_rbs)
    }

    fn served_tput(&self, link: &LinkState) -> Option<f64> {
        let secs = self.slot_duration.as_secs_f64();
        if secs <= 0.0 {
            return None;
        }
        let num_rbs = self.guaranteed_rbs(link.assigned.num_rbg);
        let bytes = self.amc.tbs_bytes(link.mcs, num_rbs, link.assigned.num_sym);
        Some(bytes as f64 * 8.0 / secs)
    }
}

/// Policy strategy table
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SchedulingPolicy {
    kind: PolicyKind,
    pf: PfParams,
}

impl SchedulingPolicy {
    /// Create a policy
    pub fn new(kind: PolicyKind, pf: PfParams) -> Self {
        Self { kind, pf }
    }

    /// Initial metric of a new UE
    pub fn new_metric(&self) -> UeMetric {
        match self.kind {
            PolicyKind::RoundRobin => UeMetric::RoundRobin { last_served: 0 },
            PolicyKind::ProportionalFair => UeMetric::ProportionalFair(PfMetric::default()),
            PolicyKind::MaxRate => UeMetric::MaxRate,
            PolicyKind::Random => UeMetric::Random,
        }
    }

    /// Snapshot state before grains are handed out
    pub fn begin_cycle(&self, link: &mut LinkState, ctx: &CycleContext) {
        if let UeMetric::ProportionalFair(pf) = &mut link.metric {
            pf.last_avg_tput = pf.avg_tput;
            pf.potential_tput = ctx.amc.achievable_rate_bps(
                link.mcs,
                ctx.rbg_size as usize,
                ctx.symbols,
                ctx.slot_duration,
            );
        }
    }

    /// Order the candidates before the first grain of a cycle
    pub fn prepare_order<T>(&self, candidates: &mut [T], rng: &mut StdRng) {
        if self.kind == PolicyKind::Random {
            candidates.shuffle(rng);
        }
    }

    /// `Less` when `a` must be served before `b`
    pub fn compare(&self, a: &UeRecord, b: &UeRecord, direction: Direction) -> Ordering {
        let la = a.link(direction);
        let lb = b.link(direction);
        let by_policy = match (&la.metric, &lb.metric) {
            (
                UeMetric::RoundRobin { last_served: sa },
                UeMetric::RoundRobin { last_served: sb },
            ) => sa.cmp(sb),
            (UeMetric::ProportionalFair(pa), UeMetric::ProportionalFair(pb)) => {
                self.pf_metric(pb).total_cmp(&self.pf_metric(pa))
            }
            (UeMetric::MaxRate, UeMetric::MaxRate) => lb.mcs.cmp(&la.mcs),
            // Shuffled order is kept as is
            (UeMetric::Random, UeMetric::Random) => return Ordering::Equal,
            _ => unreachable!("UE metrics of different policies in one scheduler"),
        };
        by_policy.then(a.rnti.cmp(&b.rnti))
    }

    /// Hook after a grain was given to the UE; `stamp` increases with every grain
    pub fn on_assigned(&self, link: &mut LinkState, stamp: u64, ctx: &CycleContext) {
        let served = ctx.served_tput(link);
        match &mut link.metric {
            UeMetric::RoundRobin { last_served } => *last_served = stamp,
            UeMetric::ProportionalFair(pf) => {
                if let Some(tput) = served {
                    let w = self.pf.time_window;
                    pf.avg_tput = (1.0 - 1.0 / w) * pf.last_avg_tput + tput / w;
                }
            }
            UeMetric::MaxRate | UeMetric::Random => {}
        }
    }

    /// Hook at the end of a cycle for eligible UEs that got nothing
    pub fn on_not_assigned(&self, link: &mut LinkState, ctx: &CycleContext) {
        if ctx.slot_duration.is_zero() {
            return;
        }
        if let UeMetric::ProportionalFair(pf) = &mut link.metric {
            pf.avg_tput = (1.0 - 1.0 / self.pf.time_window) * pf.last_avg_tput;
        }
    }

    fn pf_metric(&self, pf: &PfMetric) -> f64 {
        pf.potential_tput / pf.avg_tput.max(1e-9).powf(self.pf.fairness_alpha)
    }
}
