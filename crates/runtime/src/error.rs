//! Executor error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("No kernel registered for op {op} with quant {quant} ({name})")]
    OpInit {
        op: &'static str,
        quant: &'static str,
        name: String,
    },

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Transfer error: {0}")]
    Transfer(#[from] std::io::Error),

    #[error(transparent)]
    Core(#[from] latticelm_core::CoreError),
}

pub type Result<T> = std::result::Result<T, RuntimeError>;
