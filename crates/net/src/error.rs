//! Network error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum NetError {
    #[error("Transfer error: {0}")]
    Transfer(#[from] std::io::Error),

    #[error("Cannot resolve address: {0}")]
    Resolve(String),

    #[error("Invalid ack packet: 0x{0:08X}")]
    InvalidAck(u32),

    #[error("Invalid bootstrap magic (root/worker binary mismatch)")]
    BadBootstrapMagic,

    #[error("Unsupported bootstrap version {0} (root/worker binary mismatch)")]
    BadBootstrapVersion(u32),

    #[error("Config decode error: {0}")]
    ConfigDecode(String),
}

pub type Result<T> = std::result::Result<T, NetError>;
