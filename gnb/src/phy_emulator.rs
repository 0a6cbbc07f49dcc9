//! PHY emulator
//!
//! Stands in for the radio: offers traffic to the MAC as buffer status reports
//! and answers every scheduled transport block with a per-RB SINR report drawn
//! around the UE's mean SINR.

use crate::config::UeProfile;
use common::types::{Direction, Rnti};
use common::utils::db_to_linear;
use interfaces::message_types::{BufferStatusReport, SinrReport, SlotAllocation};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use tracing::{debug, trace};

/// LCG the emulated traffic is reported on
const TRAFFIC_LCG: u8 = 0;

#[derive(Debug, Clone)]
struct EmulatedUe {
    sinr_db: f64,
    dl_bytes_per_slot: u32,
    ul_bytes_per_slot: u32,
    dl_pending: u64,
    ul_pending: u64,
}

impl EmulatedUe {
    fn pending_mut(&mut self, direction: Direction) -> &mut u64 {
        match direction {
            Direction::Downlink => &mut self.dl_pending,
            Direction::Uplink => &mut self.ul_pending,
        }
    }

    fn arrival(&self, direction: Direction) -> u32 {
        match direction {
            Direction::Downlink => self.dl_bytes_per_slot,
            Direction::Uplink => self.ul_bytes_per_slot,
        }
    }
}

/// Channel and traffic emulator
pub struct PhyEmulator {
    num_rbs: u16,
    rbg_size: u16,
    fading_db: f64,
    rng: StdRng,
    ues: BTreeMap<Rnti, EmulatedUe>,
}

impl PhyEmulator {
    /// Create an emulator for a carrier of `num_rbs` RBs
    pub fn new(num_rbs: u16, rbg_size: u16, fading_db: f64, seed: u64) -> Self {
        Self {
            num_rbs,
            rbg_size,
            fading_db: fading_db.abs(),
            rng: StdRng::seed_from_u64(seed),
            ues: BTreeMap::new(),
        }
    }

    /// Start emulating a UE
    pub fn add_ue(&mut self, profile: &UeProfile) {
        self.ues.insert(profile.rnti(), EmulatedUe {
            sinr_db: profile.sinr_db,
            dl_bytes_per_slot: profile.dl_bytes_per_slot,
            ul_bytes_per_slot: profile.ul_bytes_per_slot,
            dl_pending: 0,
            ul_pending: 0,
        });
    }

    /// Add one slot of traffic and report the new buffer levels
    pub fn traffic_arrivals(&mut self) -> Vec<BufferStatusReport> {
        let mut reports = Vec::new();
        for (&rnti, ue) in self.ues.iter_mut() {
            for direction in Direction::ALL {
                let arrival = ue.arrival(direction);
                if arrival == 0 {
                    continue;
                }
                let pending = ue.pending_mut(direction);
                *pending += arrival as u64;
                reports.push(BufferStatusReport {
                    rnti,
                    direction,
                    lcg: TRAFFIC_LCG,
                    bytes: (*pending).min(u32::MAX as u64) as u32,
                });
            }
        }
        reports
    }

    /// Transmit the scheduled blocks and measure them
    pub fn transmit(&mut self, allocation: &SlotAllocation) -> Vec<SinrReport> {
        let mut reports = Vec::with_capacity(allocation.allocations.len());
        for alloc in &allocation.allocations {
            let Some(ue) = self.ues.get_mut(&alloc.rnti) else {
                debug!("Allocation for RNTI {} not emulated", alloc.rnti);
                continue;
            };
            if !alloc.is_retx {
                let pending = ue.pending_mut(alloc.direction);
                *pending = pending.saturating_sub(alloc.tbs_bytes as u64);
            }

            let mean_db = ue.sinr_db;
            let sinr_per_rb: Vec<f64> = (0..self.num_rbs)
                .map(|_| {
                    let fade = if self.fading_db > 0.0 {
                        self.rng.gen_range(-self.fading_db..=self.fading_db)
                    } else {
                        0.0
                    };
                    db_to_linear(mean_db + fade)
                })
                .collect();
            trace!("RNTI {} {} HARQ {}: channel around {:.1} dB",
                   alloc.rnti, alloc.direction, alloc.harq_id, mean_db);

            reports.push(SinrReport {
                rnti: alloc.rnti,
                direction: alloc.direction,
                harq_id: alloc.harq_id,
                rv: alloc.rv,
                sinr_per_rb,
                rb_map: alloc.grant.rb_indices(self.rbg_size, self.num_rbs),
            });
        }
        reports
    }
}
