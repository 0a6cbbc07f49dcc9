//! Resource-block spectrum model
//!
//! Discretises a carrier into resource blocks, each described by its low, centre
//! and high frequency. Models are expensive to build and shared by every UE on
//! the same carrier, so they are memoised by (centre frequency, RB count).
//! The subcarrier spacing is not part of the key: two carriers with the same
//! centre and RB count but a different spacing share the first model built.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock, Mutex, PoisonError};
use thiserror::Error;
use tracing::debug;

/// Errors raised while building a spectrum model
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SpectrumError {
    #[error("Invalid center frequency: {0} Hz")]
    InvalidCenterFrequency(f64),

    #[error("Resource block count must be non-zero")]
    ZeroResourceBlocks,

    #[error("Invalid subcarrier spacing: {0} Hz")]
    InvalidSubcarrierSpacing(f64),

    #[error("Subcarriers per resource block must be non-zero")]
    ZeroSubcarriersPerRb,
}

/// Frequency edges of one resource block
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BandInfo {
    /// Lower edge in Hz
    pub fl: f64,
    /// Centre in Hz
    pub fc: f64,
    /// Upper edge in Hz
    pub fh: f64,
}

/// Ordered resource blocks of one carrier
#[derive(Debug, PartialEq)]
pub struct SpectrumModel {
    uid: u32,
    bands: Vec<BandInfo>,
}

impl SpectrumModel {
    fn build(
        uid: u32,
        center_frequency: f64,
        num_rbs: u16,
        subcarrier_spacing: f64,
        subcarriers_per_rb: u32,
    ) -> Self {
        let rb_width = subcarrier_spacing * subcarriers_per_rb as f64;
        let half = rb_width / 2.0;

        let mut f = center_frequency - num_rbs as f64 * rb_width / 2.0;
        let mut bands = Vec::with_capacity(num_rbs as usize);
        for _ in 0..num_rbs {
            let fl = f;
            f += half;
            let fc = f;
            f += half;
            bands.push(BandInfo { fl, fc, fh: f });
        }

        Self { uid, bands }
    }

    /// Identifier unique within the cache that built the model
    pub fn uid(&self) -> u32 {
        self.uid
    }

    /// Number of resource blocks
    pub fn num_bands(&self) -> usize {
        self.bands.len()
    }

    /// Resource blocks, lowest frequency first
    pub fn bands(&self) -> &[BandInfo] {
        &self.bands
    }
}

fn validate(
    center_frequency: f64,
    num_rbs: u16,
    subcarrier_spacing: f64,
    subcarriers_per_rb: u32,
) -> Result<(), SpectrumError> {
    if !center_frequency.is_finite() || center_frequency <= 0.0 {
        return Err(SpectrumError::InvalidCenterFrequency(center_frequency));
    }
    if num_rbs == 0 {
        return Err(SpectrumError::ZeroResourceBlocks);
    }
    if !subcarrier_spacing.is_finite() || subcarrier_spacing <= 0.0 {
        return Err(SpectrumError::InvalidSubcarrierSpacing(subcarrier_spacing));
    }
    if subcarriers_per_rb == 0 {
        return Err(SpectrumError::ZeroSubcarriersPerRb);
    }
    Ok(())
}

/// Memoised spectrum models keyed by (centre frequency, RB count)
#[derive(Debug, Default)]
pub struct SpectrumModelCache {
    models: HashMap<(u64, u16), Arc<SpectrumModel>>,
    next_uid: u32,
}

impl SpectrumModelCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached model for the key, building it on first use
    pub fn get_or_create(
        &mut self,
        center_frequency: f64,
        num_rbs: u16,
        subcarrier_spacing: f64,
        subcarriers_per_rb: u32,
    ) -> Result<Arc<SpectrumModel>, SpectrumError> {
        validate(center_frequency, num_rbs, subcarrier_spacing, subcarriers_per_rb)?;

        let key = (center_frequency.to_bits(), num_rbs);
        if let Some(model) = self.models.get(&key) {
            return Ok(Arc::clone(model));
        }

        self.next_uid += 1;
        let model = Arc::new(SpectrumModel::build(
            self.next_uid,
            center_frequency,
            num_rbs,
            subcarrier_spacing,
            subcarriers_per_rb,
        ));
        debug!("Created spectrum model {} with {} RBs around {} Hz",
               model.uid(), num_rbs, center_frequency);
        self.models.insert(key, Arc::clone(&model));
        Ok(model)
    }

    /// Number of distinct models built so far
    pub fn len(&self) -> usize {
        self.models.len()
    }

    /// True when nothing has been built yet
    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}

static SPECTRUM_MODELS: LazyLock<Mutex<SpectrumModelCache>> =
    LazyLock::new(|| Mutex::new(SpectrumModelCache::new()));

/// Process-wide lookup-or-insert into the spectrum model cache
pub fn get_or_create_spectrum_model(
    center_frequency: f64,
    num_rbs: u16,
    subcarrier_spacing: f64,
    subcarriers_per_rb: u32,
) -> Result<Arc<SpectrumModel>, SpectrumError> {
    // The cache holds no invariant a panicking holder could break.
    let mut cache = SPECTRUM_MODELS.lock().unwrap_or_else(PoisonError::into_inner);
    cache.get_or_create(center_frequency, num_rbs, subcarrier_spacing, subcarriers_per_rb)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_band_edges() {
        let mut cache = SpectrumModelCache::new();
        let model = cache.get_or_create(1.0e9, 4, 15e3, 12).unwrap();

        assert_eq!(model.num_bands(), 4);
        let bands = model.bands();
        // 4 RBs of 180 kHz centred on 1 GHz
        assert_eq!(bands[0].fl, 1.0e9 - 360e3);
        assert_eq!(bands[0].fc, 1.0e9 - 270e3);
        assert_eq!(bands[0].fh, 1.0e9 - 180e3);
        assert_eq!(bands[3].fh, 1.0e9 + 360e3);
        for pair in bands.windows(2) {
            assert_eq!(pair[0].fh, pair[1].fl);
        }
    }

    #[test]
    fn test_cache_returns_same_instance() {
        let mut cache = SpectrumModelCache::new();
        let a = cache.get_or_create(3.5e9, 106, 30e3, 12).unwrap();
        let b = cache.get_or_create(3.5e9, 106, 30e3, 12).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.len(), 1);

        let c = cache.get_or_create(3.5e9, 52, 30e3, 12).unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(c.num_bands(), 52);
        assert_ne!(a.uid(), c.uid());
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_spacing_not_part_of_key() {
        let mut cache = SpectrumModelCache::new();
        let a = cache.get_or_create(2.0e9, 24, 15e3, 12).unwrap();
        let b = cache.get_or_create(2.0e9, 24, 30e3, 12).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!((b.bands()[0].fh - b.bands()[0].fl - 180e3).abs() < 1e-6);
    }

    #[test]
    fn test_invalid_parameters() {
        let mut cache = SpectrumModelCache::new();
        assert_eq!(
            cache.get_or_create(0.0, 10, 15e3, 12),
            Err(SpectrumError::InvalidCenterFrequency(0.0))
        );
        assert_eq!(cache.get_or_create(1e9, 0, 15e3, 12), Err(SpectrumError::ZeroResourceBlocks));
        assert!(cache.get_or_create(1e9, 10, 0.0, 12).is_err());
        assert!(cache.get_or_create(1e9, 10, 15e3, 0).is_err());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_global_cache() {
        let a = get_or_create_spectrum_model(28.0e9, 66, 120e3, 12).unwrap();
        let b = get_or_create_spectrum_model(28.0e9, 66, 120e3, 12).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }
}
