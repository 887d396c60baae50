//! Model loading error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unsupported model: {0}")]
    UnsupportedModel(String),

    #[error("Weight stream misaligned at layer {layer}: expected {expected} bytes, consumed {actual}")]
    WeightStreamMisaligned {
        layer: u32,
        expected: usize,
        actual: usize,
    },

    #[error("Weight stream misaligned: file cursor drifted by {0} bytes")]
    WeightStreamDrift(i64),

    #[error(transparent)]
    Core(#[from] latticelm_core::CoreError),

    #[error(transparent)]
    Net(#[from] latticelm_net::NetError),
}

pub type Result<T> = std::result::Result<T, ModelError>;
