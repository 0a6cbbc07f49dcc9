//! Message Types for the MAC scheduler boundary
//!
//! Defines the primitives exchanged with the upper MAC (UE configuration, buffer
//! status) and with the PHY (slot indication, allocation, SINR report, HARQ
//! feedback, CQI report).

use crate::InterfaceError;
use common::mcs::MAX_CQI;
use common::types::{BeamId, Direction, Rnti};
use serde::{Deserialize, Serialize};

/// Number of logical channel groups a UE may report
pub const MAX_LCG: u8 = 8;

/// Pending bytes of one logical channel group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LcgBufferStatus {
    /// Logical channel group id (0-7)
    pub lcg: u8,
    /// Bytes waiting for transmission
    pub bytes: u32,
}

/// UE configuration request from the upper MAC
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UeConfigRequest {
    /// C-RNTI of the UE
    pub rnti: Rnti,
    /// Beam serving the UE
    pub beam_id: BeamId,
    /// Wideband CQI to start link adaptation from
    pub initial_cqi: u8,
    /// Downlink buffer status per LCG
    pub dl_buffers: Vec<LcgBufferStatus>,
    /// Uplink buffer status per LCG
    pub ul_buffers: Vec<LcgBufferStatus>,
}

impl UeConfigRequest {
    /// Create a request with empty buffers and the lowest usable CQI
    pub fn new(rnti: Rnti, beam_id: BeamId) -> Self {
        Self {
            rnti,
            beam_id,
            initial_cqi: 1,
            dl_buffers: Vec::new(),
            ul_buffers: Vec::new(),
        }
    }

    /// Set the initial CQI
    pub fn with_cqi(mut self, cqi: u8) -> Self {
        self.initial_cqi = cqi;
        self
    }

    /// Add pending bytes for an LCG in the given direction
    pub fn with_buffer(mut self, direction: Direction, lcg: u8, bytes: u32) -> Self {
        let status = LcgBufferStatus { lcg, bytes };
        match direction {
            Direction::Downlink => self.dl_buffers.push(status),
            Direction::Uplink => self.ul_buffers.push(status),
        }
        self
    }

    /// Check the request before it reaches the scheduler
    pub fn validate(&self) -> Result<(), InterfaceError> {
        if self.initial_cqi > MAX_CQI {
            return Err(InterfaceError::InvalidMessage(
                format!("RNTI {}: CQI {} out of range", self.rnti, self.initial_cqi)
            ));
        }
        for buffers in [&self.dl_buffers, &self.ul_buffers] {
            for (i, status) in buffers.iter().enumerate() {
                if status.lcg >= MAX_LCG {
                    return Err(InterfaceError::InvalidMessage(
                        format!("RNTI {}: LCG {} out of range", self.rnti, status.lcg)
                    ));
                }
                if buffers[..i].iter().any(|s| s.lcg == status.lcg) {
                    return Err(InterfaceError::InvalidMessage(
                        format!("RNTI {}: duplicate LCG {}", self.rnti, status.lcg)
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Buffer status update (RLC for downlink, BSR for uplink)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferStatusReport {
    /// UE the report belongs to
    pub rnti: Rnti,
    /// Direction of the buffer
    pub direction: Direction,
    /// Logical channel group
    pub lcg: u8,
    /// Absolute number of bytes pending
    pub bytes: u32,
}

impl BufferStatusReport {
    /// Check the LCG range
    pub fn validate(&self) -> Result<(), InterfaceError> {
        if self.lcg >= MAX_LCG {
            return Err(InterfaceError::InvalidMessage(
                format!("RNTI {}: LCG {} out of range", self.rnti, self.lcg)
            ));
        }
        Ok(())
    }
}

/// Scheduling trigger from the timing layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotIndication {
    /// Absolute slot counter
    pub slot: u64,
}

/// One frequency-time grain
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResourceUnit {
    /// Resource block group index
    pub rbg: u16,
    /// OFDM symbol index within the slot
    pub symbol: u8,
}

/// Resources granted to one UE in one slot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ResourceGrant {
    /// Resource block groups, ascending
    pub rbgs: Vec<u16>,
    /// First symbol
    pub sym_start: u8,
    /// Number of consecutive symbols
    pub num_sym: u8,
}

impl ResourceGrant {
    /// Number of frequency grains
    pub fn num_rbg(&self) -> usize {
        self.rbgs.len()
    }

    /// Number of resource blocks covered on a carrier of `carrier_rbs` RBs
    pub fn num_rbs(&self, rbg_size: u16, carrier_rbs: u16) -> usize {
        self.rb_indices(rbg_size, carrier_rbs).len()
    }

    /// Every (RBG, symbol) grain of the grant
    pub fn resource_units(&self) -> impl Iterator<Item = ResourceUnit> + '_ {
        let symbols = self.sym_start..self.sym_start + self.num_sym;
        symbols.flat_map(move |symbol| {
            self.rbgs.iter().map(move |&rbg| ResourceUnit { rbg, symbol })
        })
    }

    /// Resource block indices covered by the grant.
    ///
    /// The last RBG of a carrier may be partial; RBs past `carrier_rbs` are left out.
    pub fn rb_indices(&self, rbg_size: u16, carrier_rbs: u16) -> Vec<usize> {
        let end = carrier_rbs as usize;
        self.rbgs
            .iter()
            .flat_map(|&rbg| {
                let start = rbg as usize * rbg_size as usize;
                start.min(end)..(start + rbg_size as usize).min(end)
            })
            .collect()
    }
}

/// Allocation for one transport block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceAllocation {
    /// Scheduled UE
    pub rnti: Rnti,
    /// Direction of the transport block
    pub direction: Direction,
    /// HARQ process carrying the block
    pub harq_id: u8,
    /// New data indicator
    pub ndi: bool,
    /// Redundancy version
    pub rv: u8,
    /// Coding level
    pub mcs: u8,
    /// Transport block size in bytes
    pub tbs_bytes: u32,
    /// Granted resources
    pub grant: ResourceGrant,
    /// True when this is a HARQ retransmission
    pub is_retx: bool,
}

/// Output of one scheduling cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlotAllocation {
    /// Slot the allocation applies to
    pub slot: u64,
    /// Transport blocks scheduled in the slot
    pub allocations: Vec<ResourceAllocation>,
}

impl SlotAllocation {
    /// Create an empty allocation
    pub fn new(slot: u64) -> Self {
        Self {
            slot,
            allocations: Vec::new(),
        }
    }

    /// True when nothing was scheduled
    pub fn is_empty(&self) -> bool {
        self.allocations.is_empty()
    }

    /// Allocations of one UE
    pub fn for_rnti(&self, rnti: Rnti) -> impl Iterator<Item = &ResourceAllocation> {
        self.allocations.iter().filter(move |a| a.rnti == rnti)
    }

    /// Allocations of one direction
    pub fn for_direction(&self, direction: Direction) -> impl Iterator<Item = &ResourceAllocation> {
        self.allocations.iter().filter(move |a| a.direction == direction)
    }

    /// JSON rendering for trace dumps
    pub fn to_json(&self) -> Result<String, InterfaceError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Per-RB SINR measured for one transport block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SinrReport {
    /// UE the block belongs to
    pub rnti: Rnti,
    /// Direction of the block
    pub direction: Direction,
    /// HARQ process of the block
    pub harq_id: u8,
    /// Redundancy version transmitted
    pub rv: u8,
    /// Linear SINR for every RB of the carrier
    pub sinr_per_rb: Vec<f64>,
    /// RBs actually used by the transmission
    pub rb_map: Vec<usize>,
}

/// Decoder feedback for one HARQ process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HarqFeedback {
    /// UE the feedback belongs to
    pub rnti: Rnti,
    /// Direction of the acknowledged block
    pub direction: Direction,
    /// HARQ process id
    pub harq_id: u8,
    /// True for ACK, false for NACK
    pub ack: bool,
}

/// Channel quality report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CqiReport {
    /// Reporting UE
    pub rnti: Rnti,
    /// Direction the CQI applies to
    pub direction: Direction,
    /// Wideband CQI (0-15)
    pub cqi: u8,
}

impl CqiReport {
    /// Check the CQI range
    pub fn validate(&self) -> Result<(), InterfaceError> {
        if self.cqi > MAX_CQI {
            return Err(InterfaceError::InvalidMessage(
                format!("RNTI {}: CQI {} out of range", self.rnti, self.cqi)
            ));
        }
        Ok(())
    }
}

/// What happened to a HARQ process after feedback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HarqOutcome {
    /// Block decoded, process released
    Acked,
    /// Block failed, process kept for retransmission
    Retransmit {
        /// Retransmissions performed so far including the upcoming one
        retx_count: u8,
    },
    /// Block failed after the last allowed retransmission, process released
    Dropped,
    /// Feedback did not match an active process
    Ignored,
}

/// Result of evaluating a SINR report
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DecodeResult {
    /// UE the block belongs to
    pub rnti: Rnti,
    /// Direction of the block
    pub direction: Direction,
    /// HARQ process id
    pub harq_id: u8,
    /// Effective SINR in dB, when an estimate was possible
    pub sinr_eff_db: Option<f64>,
    /// Block error probability used for the decision
    pub bler: Option<f64>,
    /// HARQ state transition applied
    pub outcome: HarqOutcome,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_request_validation() {
        let req = UeConfigRequest::new(Rnti(0x4601), BeamId(0))
            .with_cqi(9)
            .with_buffer(Direction::Downlink, 1, 1500)
            .with_buffer(Direction::Uplink, 0, 200);
        assert!(req.validate().is_ok());

        let dup = req.clone().with_buffer(Direction::Downlink, 1, 10);
        assert!(matches!(dup.validate(), Err(InterfaceError::InvalidMessage(_))));

        let bad_lcg = UeConfigRequest::new(Rnti(1), BeamId(0)).with_buffer(Direction::Uplink, 8, 1);
        assert!(bad_lcg.validate().is_err());

        let bad_cqi = UeConfigRequest::new(Rnti(1), BeamId(0)).with_cqi(16);
        assert!(bad_cqi.validate().is_err());
    }

    #[test]
    fn test_grant_resource_units() {
        let grant = ResourceGrant { rbgs: vec![2, 3], sym_start: 4, num_sym: 2 };
        let units: Vec<_> = grant.resource_units().collect();
        assert_eq!(units, vec![
            ResourceUnit { rbg: 2, symbol: 4 },
            ResourceUnit { rbg: 3, symbol: 4 },
            ResourceUnit { rbg: 2, symbol: 5 },
            ResourceUnit { rbg: 3, symbol: 5 },
        ]);
        assert_eq!(grant.rb_indices(4, 52), vec![8, 9, 10, 11, 12, 13, 14, 15]);
        assert_eq!(grant.num_rbs(4, 52), 8);
        // Partial last RBG
        assert_eq!(grant.rb_indices(4, 14), vec![8, 9, 10, 11, 12, 13]);
    }

    #[test]
    fn test_allocation_serialization() {
        let mut alloc = SlotAllocation::new(42);
        alloc.allocations.push(ResourceAllocation {
            rnti: Rnti(17),
            direction: Direction::Downlink,
            harq_id: 3,
            ndi: true,
            rv: 0,
            mcs: 12,
            tbs_bytes: 340,
            grant: ResourceGrant { rbgs: vec![0, 1], sym_start: 1, num_sym: 12 },
            is_retx: false,
        });

        let json = alloc.to_json().unwrap();
        let decoded: SlotAllocation = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, alloc);
        assert_eq!(decoded.for_rnti(Rnti(17)).count(), 1);
        assert_eq!(decoded.for_direction(Direction::Uplink).count(), 0);
    }
}
