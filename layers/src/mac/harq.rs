//! HARQ process table
//!
//! Fixed-capacity store of the stop-and-wait HARQ processes of one UE in one
//! direction (3GPP TS 38.321 Section 5.3.2 / 5.4.2). Process ids are 8 bit;
//! id 255 is never handed out.

use crate::phy::SinrAttempt;
use interfaces::message_types::{LcgBufferStatus, ResourceGrant};
use thiserror::Error;
use tracing::error;

/// HARQ process identifier
pub type HarqId = u8;

/// Id that never names a process
pub const HARQ_ID_UNAVAILABLE: HarqId = 255;

/// Redundancy version order for retransmissions
pub const RV_SEQUENCE: [u8; 4] = [0, 2, 3, 1];

/// Reasons a process could not be stored
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum HarqError {
    #[error("All {capacity} HARQ processes in use")]
    CapacityExhausted { capacity: usize },

    #[error("No HARQ process id available")]
    NoIdAvailable,
}

/// Where a process is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HarqStatus {
    /// Transmitted, decoder outcome pending
    WaitingFeedback,
    /// NACKed, waiting for a retransmission opportunity
    NeedsRetx,
}

/// One HARQ process
#[derive(Debug, Clone)]
pub struct HarqProcess {
    /// Lifecycle state
    pub status: HarqStatus,
    /// Resources of the initial transmission
    pub grant: ResourceGrant,
    /// MCS of the initial transmission
    pub mcs: u8,
    /// Transport block size in bytes
    pub tbs_bytes: u32,
    /// Redundancy version of the latest transmission
    pub rv: u8,
    /// New data indicator of the latest transmission
    pub ndi: bool,
    /// Retransmissions performed
    pub retx_count: u8,
    /// Slot of the initial transmission
    pub created_slot: u64,
    /// Slot of the latest transmission
    pub last_tx_slot: u64,
    /// Bytes carried per logical channel group
    pub lcg_bytes: Vec<LcgBufferStatus>,
    /// Earlier failed attempts of this block
    pub history: Vec<SinrAttempt>,
}

impl HarqProcess {
    /// New-data process transmitted in `slot`
    pub fn new(grant: ResourceGrant, mcs: u8, tbs_bytes: u32, slot: u64) -> Self {
        Self {
            status: HarqStatus::WaitingFeedback,
            grant,
            mcs,
            tbs_bytes,
            rv: RV_SEQUENCE[0],
            ndi: true,
            retx_count: 0,
            created_slot: slot,
            last_tx_slot: slot,
            lcg_bytes: Vec::new(),
            history: Vec::new(),
        }
    }

    /// Buffer bytes carried by the block
    pub fn payload_bytes(&self) -> u64 {
        self.lcg_bytes.iter().map(|s| s.bytes as u64).sum()
    }

    /// Prepare the process for its next retransmission
    pub fn mark_for_retx(&mut self) {
        self.retx_count = self.retx_count.saturating_add(1);
        self.rv = RV_SEQUENCE[self.retx_count as usize % RV_SEQUENCE.len()];
        self.ndi = false;
        self.status = HarqStatus::NeedsRetx;
    }
}

/// Bounded table of HARQ processes
#[derive(Debug, Clone)]
pub struct HarqProcessVector {
    slots: Vec<Option<HarqProcess>>,
    used: usize,
}

impl HarqProcessVector {
    /// Create a table with room for `max_size` processes
    pub fn new(max_size: u8) -> Self {
        assert!(max_size > 0, "HARQ table needs at least one process");
        Self {
            slots: vec![None; max_size as usize],
            used: 0,
        }
    }

    /// Maximum number of processes
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of active processes
    pub fn used_size(&self) -> usize {
        self.used
    }

    /// True when no process is active
    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    /// True when another process fits
    pub fn can_insert(&self) -> bool {
        self.used < self.capacity()
    }

    /// Store a process under the lowest free id
    pub fn insert(&mut self, process: HarqProcess) -> Result<HarqId, HarqError> {
        if !self.can_insert() {
            return Err(HarqError::CapacityExhausted { capacity: self.capacity() });
        }

        let Some(id) = self.first_available_id() else {
            error!("HARQ table reports {} of {} used but has no free id",
                   self.used, self.capacity());
            return Err(HarqError::NoIdAvailable);
        };

        self.slots[id as usize] = Some(process);
        self.used += 1;
        Ok(id)
    }

    /// Release a process.
    ///
    /// # Panics
    /// If the id is not active, or if the table bookkeeping is inconsistent
    /// afterwards.
    pub fn erase(&mut self, id: HarqId) -> HarqProcess {
        let Some(process) = self.slots.get_mut(id as usize).and_then(Option::take) else {
            panic!("Erasing inactive HARQ process {} ({} of {} used)",
                   id, self.used, self.capacity());
        };
        self.used -= 1;
        self.check_consistency();
        process
    }

    /// Active process with the given id
    pub fn get(&self, id: HarqId) -> Option<&HarqProcess> {
        self.slots.get(id as usize).and_then(Option::as_ref)
    }

    /// Mutable access to an active process
    pub fn get_mut(&mut self, id: HarqId) -> Option<&mut HarqProcess> {
        self.slots.get_mut(id as usize).and_then(Option::as_mut)
    }

    /// Active processes, lowest id first
    pub fn iter(&self) -> impl Iterator<Item = (HarqId, &HarqProcess)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(id, slot)| slot.as_ref().map(|p| (id as HarqId, p)))
    }

    fn first_available_id(&self) -> Option<HarqId> {
        self.slots
            .iter()
            .position(Option::is_none)
            .map(|id| id as HarqId)
    }

    fn check_consistency(&self) {
        let active = self.slots.iter().filter(|s| s.is_some()).count();
        assert_eq!(
            active, self.used,
            "HARQ table corrupted: {} active processes but used size {}",
            active, self.used
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn process(slot: u64) -> HarqProcess {
        HarqProcess::new(ResourceGrant { rbgs: vec![0], sym_start: 0, num_sym: 1 }, 5, 100, slot)
    }

    #[test]
    fn test_insert_lowest_free_id() {
        let mut harq = HarqProcessVector::new(4);
        assert_eq!(harq.insert(process(0)), Ok(0));
        assert_eq!(harq.insert(process(1)), Ok(1));
        assert_eq!(harq.insert(process(2)), Ok(2));
        harq.erase(1);
        // Erased id is reusable straight away
        assert_eq!(harq.insert(process(3)), Ok(1));
        assert_eq!(harq.used_size(), 3);
        assert_eq!(harq.get(1).unwrap().created_slot, 3);
    }

    #[test]
    fn test_capacity_exhausted() {
        let mut harq = HarqProcessVector::new(2);
        harq.insert(process(0)).unwrap();
        harq.insert(process(0)).unwrap();
        assert!(!harq.can_insert());
        assert_eq!(
            harq.insert(process(1)),
            Err(HarqError::CapacityExhausted { capacity: 2 })
        );
        // Rejection has no side effect
        assert_eq!(harq.used_size(), 2);
        assert_eq!(harq.iter().count(), 2);
    }

    #[test]
    #[should_panic(expected = "inactive")]
    fn test_erase_inactive_panics() {
        let mut harq = HarqProcessVector::new(2);
        harq.erase(0);
    }

    #[test]
    #[should_panic(expected = "inactive")]
    fn test_erase_out_of_range_panics() {
        let mut harq = HarqProcessVector::new(2);
        harq.erase(HARQ_ID_UNAVAILABLE);
    }

    #[test]
    fn test_random_insert_erase_keeps_invariants() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        let mut harq = HarqProcessVector::new(16);

        for step in 0..5_000u64 {
            let active: Vec<HarqId> = harq.iter().map(|(id, _)| id).collect();
            if rng.gen_bool(0.55) {
                match harq.insert(process(step)) {
                    Ok(id) => assert!(!active.contains(&id), "id {} handed out twice", id),
                    Err(e) => {
                        assert_eq!(e, HarqError::CapacityExhausted { capacity: 16 });
                        assert_eq!(active.len(), 16);
                    }
                }
            } else if !active.is_empty() {
                let id = active[rng.gen_range(0..active.len())];
                harq.erase(id);
                assert!(harq.get(id).is_none());
            }

            let count = harq.iter().count();
            assert!(count <= harq.capacity());
            assert_eq!(count, harq.used_size());
        }
    }

    #[test]
    fn test_rv_sequence() {
        let mut p = process(0);
        assert_eq!(p.rv, 0);
        assert!(p.ndi);
        let rvs: Vec<u8> = (0..4).map(|_| { p.mark_for_retx(); p.rv }).collect();
        assert_eq!(rvs, vec![2, 3, 1, 0]);
        assert_eq!(p.retx_count, 4);
        assert!(!p.ndi);
        assert_eq!(p.status, HarqStatus::NeedsRetx);
    }

    #[test]
    fn test_iter_skips_erased() {
        let mut harq = HarqProcessVector::new(3);
        for _ in 0..3 {
            harq.insert(process(0)).unwrap();
        }
        harq.get_mut(2).unwrap().mark_for_retx();
        harq.erase(1);
        let ids: Vec<HarqId> = harq.iter().map(|(id, _)| id).collect();
        assert_eq!(ids, vec![0, 2]);
        assert_eq!(harq.get(2).unwrap().status, HarqStatus::NeedsRetx);
        assert_eq!(harq.insert(process(1)), Ok(1));
    }
}
