//! Physical Layer Abstractions
//! 
//! The parts of the PHY the MAC scheduler needs: the resource-block spectrum model
//! and the link-to-system error model.

pub mod spectrum;
pub mod error_model;

pub use spectrum::{get_or_create_spectrum_model, BandInfo, SpectrumError, SpectrumModel, SpectrumModelCache};
pub use error_model::{Combining, EffectiveSinr, ErrorModel, ErrorModelConfig, SinrAttempt};
