//! MAC Scheduler Boundary Interfaces Library
//! 
//! This crate provides the message types exchanged between the upper MAC, the PHY
//! and the MAC scheduler.

pub mod message_types;

use thiserror::Error;

/// Interface errors
#[derive(Error, Debug)]
pub enum InterfaceError {
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
    
    #[error("Invalid message: {0}")]
    InvalidMessage(String),
}
