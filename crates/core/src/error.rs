//! Planner and graph error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Bad topology: {0}")]
    BadTopology(String),

    #[error("Too many nodes: the model has {n_kv_heads} KV heads but the cluster has {n_nodes} nodes")]
    TooManyNodes { n_kv_heads: u32, n_nodes: u32 },

    #[error("Unknown float type tag: {0}")]
    UnknownFloatType(u32),

    #[error("Unsupported op quant combination: {input}/{weight}/{output}")]
    UnsupportedQuant {
        input: &'static str,
        weight: &'static str,
        output: &'static str,
    },

    #[error("Unknown wire tag {value} for {what}")]
    UnknownWireTag { what: &'static str, value: u32 },
}

pub type Result<T> = std::result::Result<T, CoreError>;
