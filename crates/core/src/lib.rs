//! Core data model for LatticeLM: float types, partition planning,
//! tensor slicing, and the typed dataflow graph executed on every node.
//!
//! This crate is leafmost. The planner (`plan`, `topology`) turns a
//! cluster ratio string into a [`plan::PartitionPlan`]; `slice` derives
//! per-node weight shards from it; `graph` holds the pipe/buffer/op
//! configuration that the runtime executes and the network layer ships
//! to workers.

pub mod buffer;
pub mod error;
pub mod graph;
pub mod plan;
pub mod quant;
pub mod rope;
pub mod size;
pub mod slice;
pub mod topology;

pub use buffer::AlignedBuf;
pub use error::{CoreError, Result};
pub use graph::{
    BufferConfig, NetConfig, NetConfigBuilder, NodeConfig, NodeConfigBuilder, OpCode, OpConfig,
    OpParams, PipeConfig, PointerConfig, PointerKind, PointerSource, SegmentBuilder,
    SegmentConfig, SyncConfig, SyncKind, Synchronizer, WeightSink,
};
pub use plan::{DimSplit, ModelDims, PartitionPlan, StageConfig, StageDef};
pub use quant::{FloatType, OpQuantType};
pub use rope::{RopeScaling, RopeType};
pub use size::TensorSize;
pub use slice::{
    ColMatmulSlice, KvCacheSlice, MultiheadAttSlice, RopeSlice, RowMatmulSlice, ShardDescriptor,
};
