//! Modulation and coding tables
//!
//! MCS index table 1 for PDSCH/PUSCH (3GPP TS 38.214 Table 5.1.3.1-1) and
//! the 4-bit CQI table 1 (3GPP TS 38.214 Table 5.2.2.1-2).

/// Highest MCS index of table 1
pub const MAX_MCS: u8 = 28;

/// Highest CQI index of table 1
pub const MAX_CQI: u8 = 15;

/// One row of an MCS table
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct McsEntry {
    /// Modulation order (bits per symbol)
    pub qm: u8,
    /// Target code rate multiplied by 1024
    pub rate_x1024: u16,
}

impl McsEntry {
    /// Code rate as a fraction
    pub fn code_rate(&self) -> f64 {
        self.rate_x1024 as f64 / 1024.0
    }

    /// Spectral efficiency in bit/s/Hz
    pub fn spectral_efficiency(&self) -> f64 {
        self.qm as f64 * self.code_rate()
    }
}

const fn entry(qm: u8, rate_x1024: u16) -> McsEntry {
    McsEntry { qm, rate_x1024 }
}

static MCS_TABLE1: [McsEntry; 29] = [
    entry(2, 120), entry(2, 157), entry(2, 193), entry(2, 251), entry(2, 308),
    entry(2, 379), entry(2, 449), entry(2, 526), entry(2, 602), entry(2, 679),
    entry(4, 340), entry(4, 378), entry(4, 434), entry(4, 490), entry(4, 553),
    entry(4, 616), entry(4, 658),
    entry(6, 438), entry(6, 466), entry(6, 517), entry(6, 567), entry(6, 616),
    entry(6, 666), entry(6, 719), entry(6, 772), entry(6, 822), entry(6, 873),
    entry(6, 910), entry(6, 948),
];

// Index 0 is "out of range".
static CQI_TABLE1: [McsEntry; 16] = [
    entry(0, 0),
    entry(2, 78), entry(2, 120), entry(2, 193), entry(2, 308), entry(2, 449),
    entry(2, 602),
    entry(4, 378), entry(4, 490), entry(4, 616),
    entry(6, 466), entry(6, 567), entry(6, 666), entry(6, 772), entry(6, 873),
    entry(6, 948),
];

/// Look up an MCS entry, clamping to the highest index
pub fn mcs_entry(mcs: u8) -> McsEntry {
    MCS_TABLE1[mcs.min(MAX_MCS) as usize]
}

/// Look up a CQI entry, clamping to the highest index
pub fn cqi_entry(cqi: u8) -> McsEntry {
    CQI_TABLE1[cqi.min(MAX_CQI) as usize]
}

/// Highest MCS whose spectral efficiency does not exceed the CQI's
pub fn mcs_from_cqi(cqi: u8) -> u8 {
    if cqi == 0 {
        return 0;
    }
    let target = cqi_entry(cqi).spectral_efficiency();
    (0..=MAX_MCS)
        .rev()
        .find(|&m| mcs_entry(m).spectral_efficiency() <= target)
        .unwrap_or(0)
}

/// Highest CQI whose spectral efficiency does not exceed the MCS's
pub fn cqi_from_mcs(mcs: u8) -> u8 {
    let target = mcs_entry(mcs).spectral_efficiency();
    (1..=MAX_CQI)
        .rev()
        .find(|&c| cqi_entry(c).spectral_efficiency() <= target)
        .unwrap_or(1)
}
