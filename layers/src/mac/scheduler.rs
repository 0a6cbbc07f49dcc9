//! MAC Scheduler Implementation
//!
//! Runs one scheduling cycle per slot and direction: pending HARQ
//! retransmissions first, then new data for the UEs the policy ranks highest,
//! shared over symbols (TDMA) or over RBGs within per-beam symbol windows
//! (OFDMA). SINR reports and decoder feedback drive the HARQ processes and
//! link adaptation.

use super::allocation::{contiguous_grant, split_symbols_by_beam, AccessMode};
use super::amc::Amc;
use super::harq::{HarqId, HarqProcess, HarqStatus};
use super::policy::{CycleContext, SchedulingPolicy};
use super::ue::{Assignment, UeMetric, UeRecord};
use super::MacConfig;
use crate::phy::{get_or_create_spectrum_model, ErrorModel, SinrAttempt, SpectrumModel};
use crate::LayerError;
use common::types::{BeamId, Direction, Rnti};
use common::utils::SUBCARRIERS_PER_RB;
use interfaces::message_types::{
    BufferStatusReport, CqiReport, DecodeResult, HarqFeedback, HarqOutcome, ResourceAllocation,
    ResourceGrant, SinrReport, SlotAllocation, UeConfigRequest,
};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

/// MAC scheduler
pub struct MacScheduler {
    /// Layer configuration
    config: MacConfig,
    /// Resource blocks of the carrier
    num_rbs: u16,
    /// Resource block groups of the carrier
    num_rbg: u16,
    /// Frequency layout the SINR reports refer to
    spectrum: Arc<SpectrumModel>,
    /// Ordering policy
    policy: SchedulingPolicy,
    /// Link adaptation
    amc: Amc,
    /// Decoding outcome model
    error_model: ErrorModel,
    /// Random policy stream
    rng: StdRng,
    /// Configured UEs
    ues: BTreeMap<Rnti, UeRecord>,
    /// Incremented on every grain handed out
    service_stamp: u64,
    /// Latest slot scheduled
    last_slot: Option<u64>,
}

impl MacScheduler {
    /// Create a new MAC scheduler
    pub fn new(config: MacConfig) -> Result<Self, LayerError> {
        config.validate()?;

        let num_rbs = config.num_rbs();
        let num_rbg = config.num_rbg();
        let spectrum = get_or_create_spectrum_model(
            config.center_frequency_hz,
            num_rbs,
            config.scs.hz(),
            SUBCARRIERS_PER_RB,
        )?;

        let policy = SchedulingPolicy::new(config.scheduler.policy, config.scheduler.pf_params());
        let amc = Amc::new(config.error_model.bler_target);
        let error_model = ErrorModel::new(config.error_model.clone())?;
        let rng = StdRng::seed_from_u64(config.scheduler.random_seed);

        info!("MAC scheduler created: cell {}, {} RBs in {} RBGs of {}, policy {}, access {}, combining {:?}",
              config.cell_id.0,
              num_rbs,
              num_rbg,
              config.scheduler.rbg_size,
              config.scheduler.policy,
              config.scheduler.access,
              config.error_model.combining);

        Ok(Self {
            config,
            num_rbs,
            num_rbg,
            spectrum,
            policy,
            amc,
            error_model,
            rng,
            ues: BTreeMap::new(),
            service_stamp: 0,
            last_slot: None,
        })
    }

    /// Scheduler configuration
    pub fn config(&self) -> &MacConfig {
        &self.config
    }

    /// Resource blocks of the carrier
    pub fn num_rbs(&self) -> u16 {
        self.num_rbs
    }

    /// Resource block groups of the carrier
    pub fn num_rbg(&self) -> u16 {
        self.num_rbg
    }

    /// Frequency layout of the carrier
    pub fn spectrum_model(&self) -> &Arc<SpectrumModel> {
        &self.spectrum
    }

    /// Number of configured UEs
    pub fn num_ues(&self) -> usize {
        self.ues.len()
    }

    /// Scheduling record of a UE
    pub fn ue(&self, rnti: Rnti) -> Option<&UeRecord> {
        self.ues.get(&rnti)
    }

    /// All UEs, ascending RNTI
    pub fn ues(&self) -> impl Iterator<Item = &UeRecord> {
        self.ues.values()
    }

    /// Add a UE
    pub fn add_ue(&mut self, request: &UeConfigRequest) -> Result<(), LayerError> {
        request.validate()?;
        if self.ues.contains_key(&request.rnti) {
            return Err(LayerError::UeAlreadyExists(request.rnti));
        }
        if self.ues.len() >= self.config.max_ues as usize {
            return Err(LayerError::CapacityExceeded(
                format!("{} UEs already configured", self.ues.len())
            ));
        }

        let record = UeRecord::new(
            request,
            self.policy.new_metric(),
            self.config.scheduler.max_harq_processes,
        );
        info!("Added UE RNTI {} on beam {}, CQI {}, DL {} bytes, UL {} bytes",
              request.rnti,
              request.beam_id.0,
              request.initial_cqi,
              record.dl.buffers.total(),
              record.ul.buffers.total());
        self.ues.insert(request.rnti, record);
        Ok(())
    }

    /// Remove a UE and its HARQ processes; false when it was not configured
    pub fn remove_ue(&mut self, rnti: Rnti) -> bool {
        match self.ues.remove(&rnti) {
            Some(record) => {
                info!("Removed UE RNTI {} with {} DL and {} UL HARQ processes pending",
                      rnti,
                      record.dl.harq.used_size(),
                      record.ul.harq.used_size());
                true
            }
            None => {
                debug!("UE RNTI {} already released", rnti);
                false
            }
        }
    }

    /// Replace the pending bytes of one LCG
    pub fn update_buffer(&mut self, report: &BufferStatusReport) -> Result<(), LayerError> {
        report.validate()?;
        let ue = self.ues.get_mut(&report.rnti).ok_or(LayerError::UnknownUe(report.rnti))?;
        let link = ue.link_mut(report.direction);
        link.buffers.set(report.lcg, report.bytes);
        trace!("RNTI {} {} LCG {}: {} bytes pending, {} total",
               report.rnti, report.direction, report.lcg, report.bytes, link.buffers.total());
        Ok(())
    }

    /// Apply a CQI report; reports for unknown UEs are ignored
    pub fn on_cqi_report(&mut self, report: &CqiReport) -> Result<(), LayerError> {
        report.validate()?;
        let Some(ue) = self.ues.get_mut(&report.rnti) else {
            warn!("CQI report for unknown RNTI {}", report.rnti);
            return Ok(());
        };
        let link = ue.link_mut(report.direction);
        link.set_cqi(report.cqi);
        debug!("RNTI {} {}: CQI {} -> MCS {}", report.rnti, report.direction, link.cqi, link.mcs);
        Ok(())
    }

    /// Run the scheduling cycle of a slot
    pub fn schedule_slot(&mut self, slot: u64) -> SlotAllocation {
        if let Some(last) = self.last_slot {
            if slot <= last {
                warn!("Slot {} scheduled after slot {}", slot, last);
            }
        }
        self.last_slot = Some(slot);

        self.expire_harq_processes(slot);

        let mut result = SlotAllocation::new(slot);
        for direction in Direction::ALL {
            let symbols = self.config.scheduler.symbols(direction);
            if symbols == 0 {
                continue;
            }
            self.schedule_direction(slot, direction, symbols, &mut result.allocations);
        }

        if !result.is_empty() {
            debug!("Slot {}: {} transport blocks scheduled", slot, result.allocations.len());
        }
        result
    }

    /// Evaluate a received transport block and apply the decoding outcome.
    ///
    /// # Panics
    /// If the SINR vector does not cover every RB of the carrier, or the RB
    /// map addresses RBs outside it.
    pub fn on_sinr_report(&mut self, report: SinrReport) -> DecodeResult {
        let SinrReport { rnti, direction, harq_id, rv, sinr_per_rb, rb_map } = report;
        assert_eq!(
            sinr_per_rb.len(),
            self.spectrum.num_bands(),
            "SINR report of RNTI {} carries {} values for a {} RB carrier",
            rnti, sinr_per_rb.len(), self.spectrum.num_bands()
        );

        let mut result = DecodeResult {
            rnti,
            direction,
            harq_id,
            sinr_eff_db: None,
            bler: None,
            outcome: HarqOutcome::Ignored,
        };

        let rbg_size = self.config.scheduler.rbg_size;
        let carrier_rbs = self.num_rbs;
        let Some(ue) = self.ues.get_mut(&rnti) else {
            warn!("SINR report for unknown RNTI {}", rnti);
            return result;
        };
        let link = ue.link_mut(direction);
        let Some(process) = link.harq.get_mut(harq_id) else {
            warn!("SINR report for inactive HARQ {} of RNTI {} {}", harq_id, rnti, direction);
            return result;
        };
        if process.status != HarqStatus::WaitingFeedback {
            warn!("SINR report for HARQ {} of RNTI {} {} not awaiting feedback",
                  harq_id, rnti, direction);
            return result;
        }
        if rv != process.rv {
            debug!("RNTI {} {} HARQ {}: report rv {} but process rv {}",
                   rnti, direction, harq_id, rv, process.rv);
        }

        let re_count = self.amc.re_count(
            process.grant.num_rbs(rbg_size, carrier_rbs),
            process.grant.num_sym,
        );
        let attempt = SinrAttempt::new(sinr_per_rb, rb_map, process.mcs, re_count);

        let Some(stats) = self.error_model.evaluate(&attempt, &process.history, process.tbs_bytes) else {
            warn!("RNTI {} {} HARQ {}: no usable SINR in report", rnti, direction, harq_id);
            return result;
        };
        let decoded = self.error_model.decode(stats.bler);

        if let (Some(mcs), Some(cqi)) = (
            self.amc.mcs_from_attempt(&attempt),
            self.amc.cqi_from_attempt(&attempt),
        ) {
            link.mcs = mcs;
            link.cqi = cqi;
        }

        debug!("RNTI {} {} HARQ {}: SINR eff {:.2} dB (MCS {}), BLER {:.3e}, {} after {} attempts",
               rnti, direction, harq_id,
               stats.sinr_eff.db(), stats.sinr_eff.mcs, stats.bler,
               if decoded { "decoded" } else { "failed" },
               process.history.len() + 1);

        if !decoded {
            process.history.push(attempt);
        }

        result.sinr_eff_db = Some(stats.sinr_eff.db());
        result.bler = Some(stats.bler);
        result.outcome = self.apply_feedback(rnti, direction, harq_id, decoded);
        result
    }

    /// Apply explicit decoder feedback
    pub fn on_harq_feedback(&mut self, feedback: &HarqFeedback) -> HarqOutcome {
        self.apply_feedback(feedback.rnti, feedback.direction, feedback.harq_id, feedback.ack)
    }

    fn apply_feedback(&mut self, rnti: Rnti, direction: Direction, harq_id: HarqId, ack: bool) -> HarqOutcome {
        let max_retx = self.config.scheduler.max_retx;
        let Some(ue) = self.ues.get_mut(&rnti) else {
            warn!("HARQ feedback for unknown RNTI {}", rnti);
            return HarqOutcome::Ignored;
        };
        let link = ue.link_mut(direction);
        let Some(process) = link.harq.get_mut(harq_id) else {
            warn!("HARQ feedback for inactive process {} of RNTI {} {}", harq_id, rnti, direction);
            return HarqOutcome::Ignored;
        };
        if process.status != HarqStatus::WaitingFeedback {
            warn!("HARQ feedback for process {} of RNTI {} {} not awaiting feedback",
                  harq_id, rnti, direction);
            return HarqOutcome::Ignored;
        }

        if ack {
            let process = link.harq.erase(harq_id);
            link.stats.acks += 1;
            link.stats.delivered_bytes += process.payload_bytes();
            debug!("RNTI {} {} HARQ {}: ACK after {} retransmissions",
                   rnti, direction, harq_id, process.retx_count);
            return HarqOutcome::Acked;
        }

        link.stats.nacks += 1;
        if process.retx_count >= max_retx {
            let process = link.harq.erase(harq_id);
            link.stats.drops += 1;
            link.stats.dropped_bytes += process.payload_bytes();
            warn!("RNTI {} {} HARQ {}: dropped after {} retransmissions, {} bytes lost",
                  rnti, direction, harq_id, process.retx_count, process.payload_bytes());
            return HarqOutcome::Dropped;
        }

        process.mark_for_retx();
        debug!("RNTI {} {} HARQ {}: NACK, retransmission {} with rv {}",
               rnti, direction, harq_id, process.retx_count, process.rv);
        HarqOutcome::Retransmit { retx_count: process.retx_count }
    }

    fn expire_harq_processes(&mut self, slot: u64) {
        let timeout = self.config.scheduler.harq_timeout_slots;
        if timeout == 0 {
            return;
        }

        for ue in self.ues.values_mut() {
            let rnti = ue.rnti;
            for direction in Direction::ALL {
                let link = ue.link_mut(direction);
                let expired: Vec<HarqId> = link
                    .harq
                    .iter()
                    .filter(|(_, p)| {
                        p.status == HarqStatus::WaitingFeedback
                            && slot.saturating_sub(p.last_tx_slot) > timeout
                    })
                    .map(|(id, _)| id)
                    .collect();

                for harq_id in expired {
                    let process = link.harq.erase(harq_id);
                    link.stats.drops += 1;
                    link.stats.dropped_bytes += process.payload_bytes();
                    warn!("RNTI {} {} HARQ {}: no feedback since slot {}, dropped",
                          rnti, direction, harq_id, process.last_tx_slot);
                }
            }
        }
    }

    fn schedule_direction(
        &mut self,
        slot: u64,
        direction: Direction,
        symbols: u8,
        out: &mut Vec<ResourceAllocation>,
    ) {
        for ue in self.ues.values_mut() {
            ue.link_mut(direction).assigned = Assignment::default();
        }

        let mut served = BTreeSet::new();
        let used = self.schedule_retransmissions(slot, direction, symbols, &mut served, out);
        let remaining = symbols - used;
        if remaining == 0 {
            trace!("Slot {} {}: retransmissions use every symbol", slot, direction);
            return;
        }

        let ctx = CycleContext {
            amc: self.amc,
            slot_duration: self.config.scs.slot_duration(),
            rbg_size: self.config.scheduler.rbg_size,
            carrier_rbs: self.num_rbs,
            symbols: remaining,
        };

        let eligible = self.eligible_ues(direction, &served, &ctx);
        if eligible.is_empty() {
            return;
        }

        let grants = match self.config.scheduler.access {
            AccessMode::Tdma => self.assign_tdma(direction, eligible.clone(), used, remaining, &ctx),
            AccessMode::Ofdma => self.assign_ofdma(direction, &eligible, used, remaining, &ctx),
        };
        for (rnti, grant) in grants {
            if let Some(allocation) = self.create_grant(slot, direction, rnti, grant) {
                out.push(allocation);
            }
        }

        for rnti in &eligible {
            if let Some(ue) = self.ues.get_mut(rnti) {
                let link = ue.link_mut(direction);
                if link.assigned.is_empty() {
                    self.policy.on_not_assigned(link, &ctx);
                }
            }
        }
    }

    /// Place pending retransmissions on consecutive symbols; returns the symbols used
    fn schedule_retransmissions(
        &mut self,
        slot: u64,
        direction: Direction,
        symbols: u8,
        served: &mut BTreeSet<Rnti>,
        out: &mut Vec<ResourceAllocation>,
    ) -> u8 {
        let mut pending: Vec<(u64, Rnti, HarqId)> = self
            .ues
            .values()
            .flat_map(|ue| {
                ue.link(direction)
                    .harq
                    .iter()
                    .filter(|(_, p)| p.status == HarqStatus::NeedsRetx)
                    .map(move |(id, p)| (p.created_slot, ue.rnti, id))
            })
            .collect();
        pending.sort_unstable();

        let mut next_sym = 0u8;
        for (_, rnti, harq_id) in pending {
            if served.contains(&rnti) {
                continue;
            }
            let Some(ue) = self.ues.get_mut(&rnti) else {
                continue;
            };
            let link = ue.link_mut(direction);
            let Some(process) = link.harq.get_mut(harq_id) else {
                continue;
            };

            let num_sym = process.grant.num_sym;
            if num_sym > symbols - next_sym {
                trace!("RNTI {} {} HARQ {}: {} symbols needed, {} left, retransmission deferred",
                       rnti, direction, harq_id, num_sym, symbols - next_sym);
                continue;
            }

            process.grant.sym_start = next_sym;
            process.status = HarqStatus::WaitingFeedback;
            process.last_tx_slot = slot;
            out.push(ResourceAllocation {
                rnti,
                direction,
                harq_id,
                ndi: process.ndi,
                rv: process.rv,
                mcs: process.mcs,
                tbs_bytes: process.tbs_bytes,
                grant: process.grant.clone(),
                is_retx: true,
            });
            debug!("RNTI {} {} HARQ {}: retransmission {} rv {} on {} RBGs x {} symbols",
                   rnti, direction, harq_id, process.retx_count, process.rv,
                   process.grant.num_rbg(), num_sym);

            link.stats.retx += 1;
            link.last_scheduled_slot = Some(slot);
            next_sym += num_sym;
            served.insert(rnti);
        }
        next_sym
    }

    /// UEs that may get new data this cycle, in the policy's initial order
    fn eligible_ues(&mut self, direction: Direction, served: &BTreeSet<Rnti>, ctx: &CycleContext) -> Vec<Rnti> {
        let mut eligible = Vec::new();
        for ue in self.ues.values_mut() {
            let rnti = ue.rnti;
            if served.contains(&rnti) {
                continue;
            }
            let link = ue.link_mut(direction);
            if link.buffers.is_empty() {
                continue;
            }
            if !link.harq.can_insert() {
                link.stats.harq_full_skips += 1;
                debug!("RNTI {} {}: all {} HARQ processes busy, skipped",
                       rnti, direction, link.harq.capacity());
                continue;
            }
            self.policy.begin_cycle(link, ctx);
            eligible.push(rnti);
        }
        self.policy.prepare_order(&mut eligible, &mut self.rng);
        eligible
    }

    fn sort_candidates(&self, order: &mut [Rnti], direction: Direction) {
        let ues = &self.ues;
        let policy = &self.policy;
        order.sort_by(|a, b| match (ues.get(a), ues.get(b)) {
            (Some(x), Some(y)) => policy.compare(x, y, direction),
            _ => a.cmp(b),
        });
    }

    /// Hand out `grains` grains one by one to the head of the re-sorted list.
    ///
    /// A UE keeps the head until its block carries at least one byte. A UE
    /// still unable to carry anything when the grains run out gives them back,
    /// its metric is restored and the grains go to the remaining candidates.
    ///
    /// Returns the UEs served, in the order of their first grain.
    fn assign_grains(
        &mut self,
        direction: Direction,
        mut order: Vec<Rnti>,
        grains: usize,
        grow: impl Fn(&mut Assignment),
        ctx: &CycleContext,
    ) -> Vec<Rnti> {
        let mut winners = Vec::new();
        let mut left = grains;
        // Head UE whose block is still empty: metric before its first grain, grains held
        let mut unusable: Option<(Rnti, UeMetric, usize)> = None;

        loop {
            if left == 0 {
                let Some((rnti, metric, held)) = unusable.take() else {
                    break;
                };
                if let Some(ue) = self.ues.get_mut(&rnti) {
                    let link = ue.link_mut(direction);
                    link.metric = metric;
                    link.assigned = Assignment::default();
                    trace!("RNTI {} {}: {} grains carry no byte at MCS {}, handed back",
                           rnti, direction, held, link.mcs);
                }
                winners.retain(|r| *r != rnti);
                order.retain(|r| *r != rnti);
                left = held;
                continue;
            }

            if unusable.is_none() {
                self.sort_candidates(&mut order, direction);
            }
            let Some(&rnti) = order.first() else {
                break;
            };
            let Some(ue) = self.ues.get_mut(&rnti) else {
                order.remove(0);
                unusable = None;
                continue;
            };
            let link = ue.link_mut(direction);
            let (metric_before, held) = match unusable {
                Some((head, metric, held)) if head == rnti => (metric, held),
                _ => (link.metric, 0),
            };
            if link.assigned.is_empty() {
                winners.push(rnti);
            }
            grow(&mut link.assigned);
            left -= 1;
            self.service_stamp += 1;
            self.policy.on_assigned(link, self.service_stamp, ctx);

            let num_rbs = ctx.guaranteed_rbs(link.assigned.num_rbg);
            let tbs = self.amc.tbs_bytes(link.mcs, num_rbs, link.assigned.num_sym);
            trace!("RNTI {} {}: grain {}, {} RBGs x {} symbols, TBS {} of {} bytes",
                   rnti, direction, self.service_stamp,
                   link.assigned.num_rbg, link.assigned.num_sym, tbs, link.buffers.total());
            unusable = (tbs == 0).then_some((rnti, metric_before, held + 1));
            if tbs as u64 >= link.buffers.total() {
                order.remove(0);
            }
        }
        winners
    }

    /// Whole band per symbol
    fn assign_tdma(
        &mut self,
        direction: Direction,
        eligible: Vec<Rnti>,
        first_sym: u8,
        num_sym: u8,
        ctx: &CycleContext,
    ) -> Vec<(Rnti, ResourceGrant)> {
        let num_rbg = self.num_rbg;
        let winners = self.assign_grains(
            direction,
            eligible,
            num_sym as usize,
            |assigned| {
                assigned.num_rbg = num_rbg;
                assigned.num_sym += 1;
            },
            ctx,
        );

        let mut next_sym = first_sym;
        winners
            .into_iter()
            .filter_map(|rnti| {
                let assigned = self.ues.get(&rnti)?.link(direction).assigned;
                let grant = contiguous_grant(0, assigned.num_rbg, next_sym, assigned.num_sym);
                next_sym += assigned.num_sym;
                Some((rnti, grant))
            })
            .collect()
    }

    /// RBGs per beam window
    fn assign_ofdma(
        &mut self,
        direction: Direction,
        eligible: &[Rnti],
        first_sym: u8,
        num_sym: u8,
        ctx: &CycleContext,
    ) -> Vec<(Rnti, ResourceGrant)> {
        let mut by_beam: BTreeMap<BeamId, Vec<Rnti>> = BTreeMap::new();
        for rnti in eligible {
            if let Some(ue) = self.ues.get(rnti) {
                by_beam.entry(ue.beam_id).or_default().push(*rnti);
            }
        }
        let counts: Vec<(BeamId, usize)> = by_beam.iter().map(|(beam, ues)| (*beam, ues.len())).collect();
        let windows = split_symbols_by_beam(&counts, first_sym, num_sym);

        let mut grants = Vec::new();
        for window in windows {
            let Some(members) = by_beam.remove(&window.beam) else {
                continue;
            };
            let winners = self.assign_grains(
                direction,
                members,
                self.num_rbg as usize,
                |assigned| {
                    assigned.num_rbg += 1;
                    assigned.num_sym = window.num_sym;
                },
                ctx,
            );
            trace!("Beam {}: symbols {}..{} shared by {} UEs",
                   window.beam.0, window.sym_start, window.sym_start + window.num_sym, winners.len());

            let mut next_rbg = 0u16;
            for rnti in winners {
                let Some(ue) = self.ues.get(&rnti) else {
                    continue;
                };
                let assigned = ue.link(direction).assigned;
                grants.push((
                    rnti,
                    contiguous_grant(next_rbg, assigned.num_rbg, window.sym_start, window.num_sym),
                ));
                next_rbg += assigned.num_rbg;
            }
        }
        grants
    }

    /// Size the block, open a HARQ process and drain the buffers
    fn create_grant(
        &mut self,
        slot: u64,
        direction: Direction,
        rnti: Rnti,
        grant: ResourceGrant,
    ) -> Option<ResourceAllocation> {
        let num_rbs = grant.num_rbs(self.config.scheduler.rbg_size, self.num_rbs);
        let ue = self.ues.get_mut(&rnti)?;
        let link = ue.link_mut(direction);
        let mcs = link.mcs;
        let tbs_bytes = self.amc.tbs_bytes(mcs, num_rbs, grant.num_sym);
        if tbs_bytes == 0 {
            debug!("RNTI {} {}: MCS {} on {} RBs x {} symbols carries nothing, no grant",
                   rnti, direction, mcs, num_rbs, grant.num_sym);
            link.assigned = Assignment::default();
            return None;
        }

        let harq_id = match link.harq.insert(HarqProcess::new(grant.clone(), mcs, tbs_bytes, slot)) {
            Ok(id) => id,
            Err(e) => {
                warn!("RNTI {} {}: grant dropped: {}", rnti, direction, e);
                link.assigned = Assignment::default();
                return None;
            }
        };
        let carried = link.buffers.drain(tbs_bytes);
        let process = link.harq.get_mut(harq_id)?;
        process.lcg_bytes = carried;
        let (ndi, rv) = (process.ndi, process.rv);

        link.stats.new_tx += 1;
        link.last_scheduled_slot = Some(slot);
        debug!("RNTI {} {} HARQ {}: MCS {} TBS {} bytes on RBGs {:?} symbols {}..{}, {} bytes left",
               rnti, direction, harq_id, mcs, tbs_bytes, grant.rbgs,
               grant.sym_start, grant.sym_start + grant.num_sym, link.buffers.total());

        Some(ResourceAllocation {
            rnti,
            direction,
            harq_id,
            ndi,
            rv,
            mcs,
            tbs_bytes,
            grant,
            is_retx: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mac::policy::PolicyKind;
    use crate::mac::SchedulerConfig;
    use common::utils::db_to_linear;
    use interfaces::message_types::ResourceUnit;
    use std::collections::HashSet;

    fn config(policy: PolicyKind, access: AccessMode) -> MacConfig {
        MacConfig {
            scheduler: SchedulerConfig {
                policy,
                access,
                ul_symbols: 0,
                ..SchedulerConfig::default()
            },
            ..MacConfig::default()
        }
    }

    fn add(s: &mut MacScheduler, rnti: u16, beam: u16, cqi: u8, dl_bytes: u32) {
        let request = UeConfigRequest::new(Rnti(rnti), BeamId(beam))
            .with_cqi(cqi)
            .with_buffer(Direction::Downlink, 0, dl_bytes);
        s.add_ue(&request).unwrap();
    }

    fn report(s: &MacScheduler, alloc: &ResourceAllocation, sinr_db: f64) -> SinrReport {
        SinrReport {
            rnti: alloc.rnti,
            direction: alloc.direction,
            harq_id: alloc.harq_id,
            rv: alloc.rv,
            sinr_per_rb: vec![db_to_linear(sinr_db); s.num_rbs() as usize],
            rb_map: alloc.grant.rb_indices(s.config().scheduler.rbg_size, s.num_rbs()),
        }
    }

    fn nack(alloc: &ResourceAllocation) -> HarqFeedback {
        HarqFeedback {
            rnti: alloc.rnti,
            direction: alloc.direction,
            harq_id: alloc.harq_id,
            ack: false,
        }
    }

    #[test]
    fn test_no_ues_no_allocation() {
        let mut s = MacScheduler::new(config(PolicyKind::RoundRobin, AccessMode::Ofdma)).unwrap();
        assert!(s.schedule_slot(0).is_empty());
        add(&mut s, 1, 0, 10, 0);
        assert!(s.schedule_slot(1).is_empty());
    }

    #[test]
    fn test_round_robin_serves_each_ue_once() {
        let mut cfg = config(PolicyKind::RoundRobin, AccessMode::Tdma);
        cfg.scheduler.dl_symbols = 1;
        let mut s = MacScheduler::new(cfg).unwrap();
        for rnti in 1..=4 {
            add(&mut s, rnti, 0, 10, 100_000);
        }

        let mut served = Vec::new();
        for slot in 0..4 {
            let allocation = s.schedule_slot(slot);
            assert_eq!(allocation.allocations.len(), 1);
            let grant = &allocation.allocations[0];
            assert_eq!(grant.grant.num_sym, 1);
            assert_eq!(grant.grant.num_rbg(), s.num_rbg() as usize);
            served.push(grant.rnti);
        }
        assert_eq!(served, vec![Rnti(1), Rnti(2), Rnti(3), Rnti(4)]);
    }

    #[test]
    fn test_max_rate_serves_best_channel_first() {
        let mut s = MacScheduler::new(config(PolicyKind::MaxRate, AccessMode::Tdma)).unwrap();
        add(&mut s, 1, 0, 5, 2000);
        add(&mut s, 2, 0, 15, 2000);

        let allocation = s.schedule_slot(0);
        let best = allocation.for_rnti(Rnti(2)).next().unwrap();
        let other = allocation.for_rnti(Rnti(1)).next().unwrap();
        assert_eq!(best.mcs, 28);
        assert_eq!(best.grant.sym_start, 0);
        assert!(best.tbs_bytes >= 2000);
        assert_eq!(other.grant.sym_start, best.grant.num_sym);
        assert_eq!(best.grant.num_sym + other.grant.num_sym, 12);
        assert!(s.ue(Rnti(2)).unwrap().dl.buffers.is_empty());
    }

    #[test]
    fn test_proportional_fair_alternates() {
        let mut cfg = config(PolicyKind::ProportionalFair, AccessMode::Tdma);
        cfg.scheduler.dl_symbols = 1;
        let mut s = MacScheduler::new(cfg).unwrap();
        add(&mut s, 1, 0, 10, 1_000_000);
        add(&mut s, 2, 0, 10, 1_000_000);

        let mut count = BTreeMap::new();
        for slot in 0..10 {
            for alloc in s.schedule_slot(slot).allocations {
                *count.entry(alloc.rnti).or_insert(0) += 1;
            }
        }
        assert_eq!(count[&Rnti(1)], 5);
        assert_eq!(count[&Rnti(2)], 5);
    }

    #[test]
    fn test_random_policy_reproducible() {
        let run = || {
            let mut cfg = config(PolicyKind::Random, AccessMode::Tdma);
            cfg.scheduler.dl_symbols = 4;
            cfg.scheduler.random_seed = 42;
            let mut s = MacScheduler::new(cfg).unwrap();
            for rnti in 1..=6 {
                add(&mut s, rnti, 0, 8, 50_000);
            }
            (0..10).map(|slot| s.schedule_slot(slot)).collect::<Vec<_>>()
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn test_retransmission_first() {
        let mut s = MacScheduler::new(config(PolicyKind::RoundRobin, AccessMode::Tdma)).unwrap();
        add(&mut s, 1, 0, 15, 500);
        add(&mut s, 2, 0, 15, 100_000);

        let first = s.schedule_slot(0);
        let original = first.for_rnti(Rnti(1)).next().unwrap().clone();
        assert_eq!(original.grant.sym_start, 0);
        assert_eq!(
            s.on_harq_feedback(&nack(&original)),
            HarqOutcome::Retransmit { retx_count: 1 }
        );

        // New data arrives but the retransmission takes the UE's slot
        s.update_buffer(&BufferStatusReport {
            rnti: Rnti(1),
            direction: Direction::Downlink,
            lcg: 0,
            bytes: 5000,
        })
        .unwrap();

        let second = s.schedule_slot(1);
        let retx: Vec<_> = second.for_rnti(Rnti(1)).collect();
        assert_eq!(retx.len(), 1);
        let retx = retx[0];
        assert!(retx.is_retx);
        assert!(!retx.ndi);
        assert_eq!(retx.rv, 2);
        assert_eq!(retx.harq_id, original.harq_id);
        assert_eq!(retx.grant.rbgs, original.grant.rbgs);
        assert_eq!(retx.grant.num_sym, original.grant.num_sym);
        assert_eq!(retx.grant.sym_start, 0);

        let other = second.for_rnti(Rnti(2)).next().unwrap();
        assert_eq!(other.grant.sym_start, retx.grant.num_sym);
        assert_eq!(s.ue(Rnti(1)).unwrap().dl.stats.retx, 1);
    }

    #[test]
    fn test_drop_after_max_retx() {
        let mut cfg = config(PolicyKind::RoundRobin, AccessMode::Tdma);
        cfg.scheduler.max_retx = 1;
        let mut s = MacScheduler::new(cfg).unwrap();
        add(&mut s, 1, 0, 10, 300);

        let alloc = s.schedule_slot(0).allocations[0].clone();
        assert_eq!(s.on_harq_feedback(&nack(&alloc)), HarqOutcome::Retransmit { retx_count: 1 });
        let retx = s.schedule_slot(1).allocations[0].clone();
        assert!(retx.is_retx);
        assert_eq!(s.on_harq_feedback(&nack(&retx)), HarqOutcome::Dropped);

        let ue = s.ue(Rnti(1)).unwrap();
        assert!(ue.dl.harq.is_empty());
        assert_eq!(ue.dl.stats.drops, 1);
        assert_eq!(ue.dl.stats.nacks, 2);
        assert_eq!(ue.dl.stats.dropped_bytes, 300);
        assert!(s.schedule_slot(2).is_empty());
    }

    #[test]
    fn test_feedback_timeout() {
        let mut cfg = config(PolicyKind::RoundRobin, AccessMode::Tdma);
        cfg.scheduler.harq_timeout_slots = 2;
        let mut s = MacScheduler::new(cfg).unwrap();
        add(&mut s, 1, 0, 10, 300);

        let alloc = s.schedule_slot(0).allocations[0].clone();
        s.schedule_slot(1);
        s.schedule_slot(2);
        assert_eq!(s.ue(Rnti(1)).unwrap().dl.harq.used_size(), 1);
        s.schedule_slot(3);
        let ue = s.ue(Rnti(1)).unwrap();
        assert!(ue.dl.harq.is_empty());
        assert_eq!(ue.dl.stats.drops, 1);

        // Late feedback finds nothing
        assert_eq!(s.on_harq_feedback(&nack(&alloc)), HarqOutcome::Ignored);
    }

    #[test]
    fn test_full_harq_table_skips_ue() {
        let mut cfg = config(PolicyKind::RoundRobin, AccessMode::Tdma);
        cfg.scheduler.max_harq_processes = 2;
        cfg.scheduler.dl_symbols = 1;
        let mut s = MacScheduler::new(cfg).unwrap();
        add(&mut s, 1, 0, 10, 1_000_000);

        assert_eq!(s.schedule_slot(0).allocations[0].harq_id, 0);
        assert_eq!(s.schedule_slot(1).allocations[0].harq_id, 1);
        assert!(s.schedule_slot(2).is_empty());
        assert_eq!(s.ue(Rnti(1)).unwrap().dl.stats.harq_full_skips, 1);
    }

    #[test]
    fn test_partial_grant_keeps_remaining_bytes() {
        let mut s = MacScheduler::new(config(PolicyKind::RoundRobin, AccessMode::Tdma)).unwrap();
        add(&mut s, 1, 0, 10, 1_000_000);

        let allocation = s.schedule_slot(0);
        let alloc = &allocation.allocations[0];
        assert_eq!(alloc.grant.num_sym, 12);
        let ue = s.ue(Rnti(1)).unwrap();
        assert_eq!(ue.dl.buffers.total(), 1_000_000 - alloc.tbs_bytes as u64);
        let process = ue.dl.harq.get(alloc.harq_id).unwrap();
        assert_eq!(process.payload_bytes(), alloc.tbs_bytes as u64);
    }

    #[test]
    fn test_ofdma_beams_share_symbols() {
        let mut s = MacScheduler::new(config(PolicyKind::RoundRobin, AccessMode::Ofdma)).unwrap();
        add(&mut s, 1, 0, 10, 100_000);
        add(&mut s, 2, 0, 10, 100_000);
        add(&mut s, 3, 1, 10, 100_000);

        let allocation = s.schedule_slot(0);
        assert_eq!(allocation.allocations.len(), 3);

        let a = allocation.for_rnti(Rnti(1)).next().unwrap();
        let b = allocation.for_rnti(Rnti(2)).next().unwrap();
        let c = allocation.for_rnti(Rnti(3)).next().unwrap();
        assert_eq!((a.grant.sym_start, a.grant.num_sym), (0, 8));
        assert_eq!((b.grant.sym_start, b.grant.num_sym), (0, 8));
        assert_eq!(a.grant.rbgs, (0..7).collect::<Vec<u16>>());
        assert_eq!(b.grant.rbgs, (7..14).collect::<Vec<u16>>());
        assert_eq!((c.grant.sym_start, c.grant.num_sym), (8, 4));
        assert_eq!(c.grant.num_rbg(), 14);

        let mut seen: HashSet<ResourceUnit> = HashSet::new();
        for alloc in &allocation.allocations {
            for unit in alloc.grant.resource_units() {
                assert!(seen.insert(unit), "grain {:?} granted twice", unit);
            }
        }
    }

    #[test]
    fn test_uplink_scheduled_separately() {
        let mut cfg = config(PolicyKind::RoundRobin, AccessMode::Ofdma);
        cfg.scheduler.ul_symbols = 10;
        let mut s = MacScheduler::new(cfg).unwrap();
        let request = UeConfigRequest::new(Rnti(7), BeamId(0))
            .with_cqi(9)
            .with_buffer(Direction::Uplink, 2, 800);
        s.add_ue(&request).unwrap();

        let allocation = s.schedule_slot(0);
        assert_eq!(allocation.for_direction(Direction::Downlink).count(), 0);
        let ul = allocation.for_direction(Direction::Uplink).next().unwrap();
        assert_eq!(ul.rnti, Rnti(7));
        assert!(ul.grant.num_sym <= 10);
    }

    #[test]
    fn test_sinr_report_ack_and_link_adaptation() {
        let mut s = MacScheduler::new(config(PolicyKind::RoundRobin, AccessMode::Tdma)).unwrap();
        add(&mut s, 1, 0, 10, 400);

        let alloc = s.schedule_slot(0).allocations[0].clone();
        let result = s.on_sinr_report(report(&s, &alloc, 30.0));
        assert_eq!(result.outcome, HarqOutcome::Acked);
        assert!(result.bler.unwrap() < 1e-6);
        assert!((result.sinr_eff_db.unwrap() - 30.0).abs() < 1e-9);

        let ue = s.ue(Rnti(1)).unwrap();
        assert_eq!(ue.dl.stats.delivered_bytes, 400);
        assert_eq!(ue.dl.mcs, 28);
        assert_eq!(ue.dl.cqi, 15);
    }

    #[test]
    fn test_sinr_report_failure_keeps_history() {
        let mut s = MacScheduler::new(config(PolicyKind::RoundRobin, AccessMode::Tdma)).unwrap();
        add(&mut s, 1, 0, 12, 400);

        let alloc = s.schedule_slot(0).allocations[0].clone();
        let result = s.on_sinr_report(report(&s, &alloc, -10.0));
        assert_eq!(result.outcome, HarqOutcome::Retransmit { retx_count: 1 });

        let ue = s.ue(Rnti(1)).unwrap();
        let process = ue.dl.harq.get(alloc.harq_id).unwrap();
        assert_eq!(process.history.len(), 1);
        assert_eq!(process.status, HarqStatus::NeedsRetx);
        assert_eq!(ue.dl.cqi, 0);

        // A report for a process not on air is ignored
        let again = s.on_sinr_report(report(&s, &alloc, 30.0));
        assert_eq!(again.outcome, HarqOutcome::Ignored);

        // Chase combining of both attempts clears the block
        let retx = s.schedule_slot(1).allocations[0].clone();
        let result = s.on_sinr_report(report(&s, &retx, 30.0));
        assert_eq!(result.outcome, HarqOutcome::Acked);
        assert!(s.ue(Rnti(1)).unwrap().dl.harq.is_empty());
    }

    #[test]
    #[should_panic(expected = "carries")]
    fn test_sinr_report_length_mismatch_panics() {
        let mut s = MacScheduler::new(config(PolicyKind::RoundRobin, AccessMode::Tdma)).unwrap();
        add(&mut s, 1, 0, 10, 400);
        let alloc = s.schedule_slot(0).allocations[0].clone();
        let mut bad = report(&s, &alloc, 10.0);
        bad.sinr_per_rb.pop();
        s.on_sinr_report(bad);
    }

    #[test]
    fn test_remove_ue_with_pending_processes() {
        let mut s = MacScheduler::new(config(PolicyKind::RoundRobin, AccessMode::Tdma)).unwrap();
        add(&mut s, 1, 0, 10, 400);
        let alloc = s.schedule_slot(0).allocations[0].clone();

        assert!(s.remove_ue(Rnti(1)));
        assert!(!s.remove_ue(Rnti(1)));
        assert_eq!(s.num_ues(), 0);
        assert_eq!(s.on_harq_feedback(&nack(&alloc)), HarqOutcome::Ignored);
        let result = s.on_sinr_report(report(&s, &alloc, 20.0));
        assert_eq!(result.outcome, HarqOutcome::Ignored);
        assert!(s.schedule_slot(1).is_empty());
    }

    #[test]
    fn test_add_ue_rejections() {
        let mut cfg = config(PolicyKind::RoundRobin, AccessMode::Tdma);
        cfg.max_ues = 1;
        let mut s = MacScheduler::new(cfg).unwrap();
        add(&mut s, 1, 0, 10, 0);

        let second = UeConfigRequest::new(Rnti(2), BeamId(0));
        assert!(matches!(s.add_ue(&second), Err(LayerError::CapacityExceeded(_))));
        let duplicate = UeConfigRequest::new(Rnti(1), BeamId(0));
        assert!(matches!(s.add_ue(&duplicate), Err(LayerError::UeAlreadyExists(_))));
        s.remove_ue(Rnti(1));
        let bad_cqi = UeConfigRequest::new(Rnti(3), BeamId(0)).with_cqi(16);
        assert!(matches!(s.add_ue(&bad_cqi), Err(LayerError::InvalidMessage(_))));
    }

    #[test]
    fn test_buffer_and_cqi_updates() {
        let mut s = MacScheduler::new(config(PolicyKind::RoundRobin, AccessMode::Tdma)).unwrap();
        add(&mut s, 1, 0, 3, 0);

        let bsr = BufferStatusReport { rnti: Rnti(9), direction: Direction::Downlink, lcg: 0, bytes: 10 };
        assert!(matches!(s.update_buffer(&bsr), Err(LayerError::UnknownUe(_))));
        let bsr = BufferStatusReport { rnti: Rnti(1), direction: Direction::Downlink, lcg: 9, bytes: 10 };
        assert!(matches!(s.update_buffer(&bsr), Err(LayerError::InvalidMessage(_))));

        let cqi = CqiReport { rnti: Rnti(1), direction: Direction::Downlink, cqi: 15 };
        s.on_cqi_report(&cqi).unwrap();
        assert_eq!(s.ue(Rnti(1)).unwrap().dl.mcs, 28);
        let unknown = CqiReport { rnti: Rnti(5), ..cqi };
        assert!(s.on_cqi_report(&unknown).is_ok());
    }

    #[test]
    fn test_ofdma_low_cqi_ues_not_starved() {
        let mut cfg = config(PolicyKind::RoundRobin, AccessMode::Ofdma);
        cfg.scheduler.dl_symbols = 1;
        let mut s = MacScheduler::new(cfg).unwrap();
        // MCS 0 on one symbol needs several RBGs before a block carries a byte
        for rnti in 1..=14 {
            add(&mut s, rnti, 0, 1, 10_000);
        }

        let mut served = BTreeSet::new();
        for slot in 0..10 {
            let allocation = s.schedule_slot(slot);
            assert!(!allocation.is_empty(), "slot {} granted nothing", slot);
            let mut seen: HashSet<ResourceUnit> = HashSet::new();
            for alloc in &allocation.allocations {
                assert!(alloc.tbs_bytes > 0);
                for unit in alloc.grant.resource_units() {
                    assert!(seen.insert(unit), "grain {:?} granted twice", unit);
                }
                served.insert(alloc.rnti);
            }
            assert_eq!(seen.len(), s.num_rbg() as usize);

            // UEs that got nothing keep their place in the round
            for ue in s.ues() {
                if allocation.for_rnti(ue.rnti).next().is_none() && ue.dl.last_scheduled_slot.is_none() {
                    assert_eq!(ue.dl.metric, UeMetric::RoundRobin { last_served: 0 });
                    assert!(ue.dl.assigned.is_empty());
                }
            }
        }
        assert_eq!(served.len(), 14);
    }

    #[test]
    fn test_ofdma_max_rate_serves_best_channel_first() {
        let mut s = MacScheduler::new(config(PolicyKind::MaxRate, AccessMode::Ofdma)).unwrap();
        add(&mut s, 1, 0, 5, 2000);
        add(&mut s, 2, 0, 15, 2000);

        let allocation = s.schedule_slot(0);
        let best = allocation.for_rnti(Rnti(2)).next().unwrap();
        let other = allocation.for_rnti(Rnti(1)).next().unwrap();
        assert_eq!(best.mcs, 28);
        assert_eq!(best.grant.rbgs[0], 0);
        assert!(best.tbs_bytes >= 2000);
        assert!(s.ue(Rnti(2)).unwrap().dl.buffers.is_empty());
        // The lower MCS only gets what the best channel left over
        assert_eq!(other.grant.rbgs[0] as usize, best.grant.num_rbg());
        assert_eq!(best.grant.num_rbg() + other.grant.num_rbg(), s.num_rbg() as usize);
        assert_eq!(best.grant.num_sym, other.grant.num_sym);
    }

    #[test]
    fn test_ofdma_proportional_fair_ordering() {
        let mut s = MacScheduler::new(config(PolicyKind::ProportionalFair, AccessMode::Ofdma)).unwrap();
        add(&mut s, 1, 0, 10, 1_000_000);
        add(&mut s, 2, 0, 10, 1_000_000);

        // Equal channels split the band grain by grain
        let first = s.schedule_slot(0);
        let a = first.for_rnti(Rnti(1)).next().unwrap();
        let b = first.for_rnti(Rnti(2)).next().unwrap();
        assert_eq!(a.grant.num_rbg(), 7);
        assert_eq!(b.grant.num_rbg(), 7);

        // A newcomer with no history outranks the UE served so far
        add(&mut s, 3, 0, 10, 1_000_000);
        s.remove_ue(Rnti(2));
        let second = s.schedule_slot(1);
        let newcomer = second.for_rnti(Rnti(3)).next().unwrap();
        assert_eq!(newcomer.grant.rbgs[0], 0);
        assert!(newcomer.grant.num_rbg() > 7);
    }

    #[test]
    fn test_grant_dropped_when_block_carries_nothing() {
        let mut s = MacScheduler::new(config(PolicyKind::RoundRobin, AccessMode::Ofdma)).unwrap();
        add(&mut s, 1, 0, 1, 500);
        s.ues.get_mut(&Rnti(1)).unwrap().dl.assigned = Assignment { num_rbg: 1, num_sym: 1 };

        // MCS 0 on 4 RBs and 1 symbol is below the CRC size
        let grant = contiguous_grant(0, 1, 0, 1);
        assert!(s.create_grant(0, Direction::Downlink, Rnti(1), grant).is_none());

        let ue = s.ue(Rnti(1)).unwrap();
        assert!(ue.dl.assigned.is_empty());
        assert!(ue.dl.harq.is_empty());
        assert_eq!(ue.dl.buffers.total(), 500);
        assert_eq!(ue.dl.stats.new_tx, 0);
    }

    #[test]
    fn test_grant_dropped_when_harq_table_full() {
        let mut cfg = config(PolicyKind::RoundRobin, AccessMode::Tdma);
        cfg.scheduler.max_harq_processes = 1;
        cfg.scheduler.dl_symbols = 1;
        let mut s = MacScheduler::new(cfg).unwrap();
        add(&mut s, 1, 0, 10, 1_000_000);
        assert_eq!(s.schedule_slot(0).allocations.len(), 1);
        let before = s.ue(Rnti(1)).unwrap().dl.buffers.total();

        s.ues.get_mut(&Rnti(1)).unwrap().dl.assigned = Assignment { num_rbg: 14, num_sym: 1 };
        let grant = contiguous_grant(0, 14, 0, 1);
        assert!(s.create_grant(1, Direction::Downlink, Rnti(1), grant).is_none());

        let ue = s.ue(Rnti(1)).unwrap();
        assert!(ue.dl.assigned.is_empty());
        assert_eq!(ue.dl.harq.used_size(), 1);
        assert_eq!(ue.dl.buffers.total(), before);
        assert_eq!(ue.dl.stats.new_tx, 1);
    }
}
