//! gNB MAC Scheduling Library
//! 
//! This crate implements the MAC resource scheduler, the HARQ process manager and
//! the link-to-system error model that gates HARQ success.

pub mod phy;
pub mod mac;

use common::types::Rnti;
use thiserror::Error;

/// Common errors for the scheduling layers
#[derive(Error, Debug)]
pub enum LayerError {
    #[error("Layer not initialized")]
    NotInitialized,
    
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
    
    #[error("Unknown UE: RNTI {0}")]
    UnknownUe(Rnti),
    
    #[error("UE already configured: RNTI {0}")]
    UeAlreadyExists(Rnti),
    
    #[error("Capacity exceeded: {0}")]
    CapacityExceeded(String),
    
    #[error("Invalid message: {0}")]
    InvalidMessage(#[from] interfaces::InterfaceError),
    
    #[error("Spectrum model error: {0}")]
    Spectrum(#[from] phy::spectrum::SpectrumError),
}
