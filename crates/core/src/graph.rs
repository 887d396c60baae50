//! Typed dataflow graph: pipes, buffers, ops, sync directives.
//!
//! A node's work is a list of segments. Each segment is an ordered op
//! list followed by an ordered sync-directive list; all ops complete
//! before any sync fires, and all syncs complete before the next
//! segment begins. The same structures are shipped to workers over the
//! config-push wire protocol, so everything here is plain data.

use std::io;

use crate::buffer::AlignedBuf;
use crate::error::{CoreError, Result};
use crate::rope::{RopeScaling, RopeType};
use crate::size::TensorSize;
use crate::slice::RopeSlice;

/// The closed op set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpCode {
    Embed,
    MergeAdd,
    MergeSum,
    InvRms,
    RmsNorm,
    Matmul,
    Rope,
    MultiheadAtt,
    Silu,
    Gelu,
    Mul,
    Scale,
    Cast,
    RepeatZ,
    Shift,
    Softmax,
    MoeGate,
}

impl OpCode {
    pub fn as_str(self) -> &'static str {
        match self {
            OpCode::Embed => "EMBED",
            OpCode::MergeAdd => "MERGE_ADD",
            OpCode::MergeSum => "MERGE_SUM",
            OpCode::InvRms => "INV_RMS",
            OpCode::RmsNorm => "RMS_NORM",
            OpCode::Matmul => "MATMUL",
            OpCode::Rope => "ROPE",
            OpCode::MultiheadAtt => "MULTIHEAD_ATT",
            OpCode::Silu => "SILU",
            OpCode::Gelu => "GELU",
            OpCode::Mul => "MUL",
            OpCode::Scale => "SCALE",
            OpCode::Cast => "CAST",
            OpCode::RepeatZ => "REPEAT_Z",
            OpCode::Shift => "SHIFT",
            OpCode::Softmax => "SOFTMAX",
            OpCode::MoeGate => "MOE_GATE",
        }
    }

    pub fn to_wire(self) -> u32 {
        match self {
            OpCode::Embed => 0,
            OpCode::MergeAdd => 1,
            OpCode::MergeSum => 2,
            OpCode::InvRms => 3,
            OpCode::RmsNorm => 4,
            OpCode::Matmul => 5,
            OpCode::Rope => 6,
            OpCode::MultiheadAtt => 7,
            OpCode::Silu => 8,
            OpCode::Gelu => 9,
            OpCode::Mul => 10,
            OpCode::Scale => 11,
            OpCode::Cast => 12,
            OpCode::RepeatZ => 13,
            OpCode::Shift => 14,
            OpCode::Softmax => 15,
            OpCode::MoeGate => 16,
        }
    }

    pub fn from_wire(value: u32) -> Result<Self> {
        Ok(match value {
            0 => OpCode::Embed,
            1 => OpCode::MergeAdd,
            2 => OpCode::MergeSum,
            3 => OpCode::InvRms,
            4 => OpCode::RmsNorm,
            5 => OpCode::Matmul,
            6 => OpCode::Rope,
            7 => OpCode::MultiheadAtt,
            8 => OpCode::Silu,
            9 => OpCode::Gelu,
            10 => OpCode::Mul,
            11 => OpCode::Scale,
            12 => OpCode::Cast,
            13 => OpCode::RepeatZ,
            14 => OpCode::Shift,
            15 => OpCode::Softmax,
            16 => OpCode::MoeGate,
            other => {
                return Err(CoreError::UnknownWireTag {
                    what: "op code",
                    value: other,
                })
            }
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointerSource {
    Pipe,
    Buffer,
}

/// How an op addresses its input/output memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointerKind {
    /// The whole region, no per-batch view.
    Raw,
    /// One row per batch entry.
    Batch,
    /// One row per batch entry, narrowed to this node's dimension slice.
    BatchedSlice,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PointerConfig {
    pub source: PointerSource,
    pub index: u32,
    pub kind: PointerKind,
}

impl PointerConfig {
    pub fn raw(source: PointerSource, index: u32) -> Self {
        PointerConfig {
            source,
            index,
            kind: PointerKind::Raw,
        }
    }

    pub fn batch(source: PointerSource, index: u32) -> Self {
        PointerConfig {
            source,
            index,
            kind: PointerKind::Batch,
        }
    }

    pub fn batched_slice(source: PointerSource, index: u32) -> Self {
        PointerConfig {
            source,
            index,
            kind: PointerKind::BatchedSlice,
        }
    }

    /// True when consecutive elements of the view are adjacent in
    /// memory for the whole batch.
    pub fn contiguous(&self) -> bool {
        !matches!(self.kind, PointerKind::BatchedSlice)
    }
}

/// Inter-node synchronization primitives (§4.5 of the design).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncKind {
    /// Stage root broadcasts the full pipe to its TP group.
    WithRoot,
    /// All-gather: every node sends its slice to every peer.
    NodeSlices,
    /// Workers send their slice to the root only.
    NodeSlicesExceptRoot,
    /// Stage root sends the pipe to the next stage's root.
    PpSend,
    /// Stage root receives the pipe from the prior stage's root.
    PpRecv,
}

impl SyncKind {
    pub fn to_wire(self) -> u32 {
        match self {
            SyncKind::WithRoot => 0,
            SyncKind::NodeSlices => 1,
            SyncKind::NodeSlicesExceptRoot => 2,
            SyncKind::PpSend => 3,
            SyncKind::PpRecv => 4,
        }
    }

    pub fn from_wire(value: u32) -> Result<Self> {
        Ok(match value {
            0 => SyncKind::WithRoot,
            1 => SyncKind::NodeSlices,
            2 => SyncKind::NodeSlicesExceptRoot,
            3 => SyncKind::PpSend,
            4 => SyncKind::PpRecv,
            other => {
                return Err(CoreError::UnknownWireTag {
                    what: "sync kind",
                    value: other,
                })
            }
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncConfig {
    pub pipe_index: u32,
    pub kind: SyncKind,
}

/// Per-op parameters. Serialized field-by-field in declaration order
/// over the config push.
#[derive(Debug, Clone, PartialEq)]
pub enum OpParams {
    None,
    InvRms {
        epsilon: f32,
        n_columns: u32,
    },
    RmsNorm {
        inv_rms_buffer: u32,
        n_columns: u32,
    },
    Matmul {
        n_experts: u32,
        n_active_experts: u32,
        expert_index_buffer: u32,
    },
    Rope {
        kind: RopeType,
        is_q: bool,
        position_pipe: u32,
        cache_buffer: u32,
        scaling: RopeScaling,
        slice: RopeSlice,
    },
    MultiheadAtt {
        n_heads: u32,
        n_heads0: u32,
        n_kv_heads: u32,
        head_dim: u32,
        seq_len: u32,
        q_len: u32,
        kv_len: u32,
        position_pipe: u32,
        query_buffer: u32,
        key_cache_buffer: u32,
        value_cache_buffer: u32,
        att_buffer: u32,
    },
    Mul {
        multiplier_buffer: u32,
    },
    Scale {
        scale_buffer: u32,
    },
    Shift {
        position_pipe: u32,
    },
    MoeGate {
        k: u32,
        norm_topk: bool,
        index_buffer: u32,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct OpConfig {
    pub code: OpCode,
    /// Stable op name; weight uploads address ops by `(name, index)`.
    pub name: String,
    /// Instance index, usually the layer number.
    pub index: u32,
    pub input: PointerConfig,
    pub output: PointerConfig,
    /// Zero-size for weightless ops.
    pub weight_size: TensorSize,
    pub params: OpParams,
}

impl OpConfig {
    pub fn weight_float(&self) -> Option<crate::quant::FloatType> {
        if self.weight_size.is_empty() {
            None
        } else {
            Some(self.weight_size.float_type)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct SegmentConfig {
    pub ops: Vec<OpConfig>,
    pub syncs: Vec<SyncConfig>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipeConfig {
    pub name: String,
    pub size: TensorSize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BufferConfig {
    pub name: String,
    pub size: TensorSize,
}

/// Cluster-global graph configuration, identical on every node.
#[derive(Debug, Clone, PartialEq)]
pub struct NetConfig {
    pub n_batches: u32,
    pub n_nodes: u32,
    pub pipes: Vec<PipeConfig>,
    /// Pipes the root replicates to all workers before segment 0.
    pub pre_syncs: Vec<u32>,
}

/// One node's private graph: its buffers and segments.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeConfig {
    pub node_index: u32,
    pub buffers: Vec<BufferConfig>,
    pub segments: Vec<SegmentConfig>,
}

impl NodeConfig {
    /// Bytes this node's buffers and weights require.
    pub fn required_memory(&self, net: &NetConfig) -> usize {
        let pipes: usize = net.pipes.iter().map(|p| p.size.n_bytes).sum();
        let buffers: usize = self.buffers.iter().map(|b| b.size.n_bytes).sum();
        let weights: usize = self
            .segments
            .iter()
            .flat_map(|s| s.ops.iter())
            .map(|op| op.weight_size.n_bytes)
            .sum();
        pipes + buffers + weights
    }
}

pub struct NetConfigBuilder {
    n_batches: u32,
    n_nodes: u32,
    pipes: Vec<PipeConfig>,
    pre_syncs: Vec<u32>,
}

impl NetConfigBuilder {
    pub fn new(n_nodes: u32, n_batches: u32) -> Self {
        NetConfigBuilder {
            n_batches,
            n_nodes,
            pipes: Vec::new(),
            pre_syncs: Vec::new(),
        }
    }

    pub fn add_pipe(&mut self, name: &str, size: TensorSize) -> u32 {
        self.pipes.push(PipeConfig {
            name: name.to_string(),
            size,
        });
        self.pipes.len() as u32 - 1
    }

    pub fn add_pre_sync(&mut self, pipe_index: u32) {
        self.pre_syncs.push(pipe_index);
    }

    pub fn build(self) -> NetConfig {
        NetConfig {
            n_batches: self.n_batches,
            n_nodes: self.n_nodes,
            pipes: self.pipes,
            pre_syncs: self.pre_syncs,
        }
    }
}

pub struct NodeConfigBuilder {
    node_index: u32,
    buffers: Vec<BufferConfig>,
    segments: Vec<SegmentConfig>,
}

impl NodeConfigBuilder {
    pub fn new(node_index: u32) -> Self {
        NodeConfigBuilder {
            node_index,
            buffers: Vec::new(),
            segments: Vec::new(),
        }
    }

    pub fn add_buffer(&mut self, name: &str, size: TensorSize) -> u32 {
        self.buffers.push(BufferConfig {
            name: name.to_string(),
            size,
        });
        self.buffers.len() as u32 - 1
    }

    pub fn add_segment(&mut self, segment: SegmentConfig) {
        self.segments.push(segment);
    }

    pub fn build(self) -> NodeConfig {
        NodeConfig {
            node_index: self.node_index,
            buffers: self.buffers,
            segments: self.segments,
        }
    }
}

#[derive(Default)]
pub struct SegmentBuilder {
    segment: SegmentConfig,
}

impl SegmentBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    #[allow(clippy::too_many_arguments)]
    pub fn add_op(
        &mut self,
        code: OpCode,
        name: &str,
        index: u32,
        input: PointerConfig,
        output: PointerConfig,
        weight_size: TensorSize,
        params: OpParams,
    ) -> &mut Self {
        self.segment.ops.push(OpConfig {
            code,
            name: name.to_string(),
            index,
            input,
            output,
            weight_size,
            params,
        });
        self
    }

    pub fn add_sync(&mut self, pipe_index: u32, kind: SyncKind) -> &mut Self {
        self.segment.syncs.push(SyncConfig { pipe_index, kind });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.segment.ops.is_empty() && self.segment.syncs.is_empty()
    }

    pub fn build(self) -> SegmentConfig {
        self.segment
    }
}

/// Receives tensor bytes for a named op instance during weight loading.
/// Implemented by the executor. Addressing a nonexistent op or writing
/// past the weight buffer is a graph/loader mismatch and panics.
pub trait WeightSink {
    fn upload(&mut self, name: &str, index: u32, offset: usize, data: &[u8]);
}

/// Executes the sync directives of one segment, in order. Implemented
/// by the network layer; a no-op implementation serves single-node
/// runs. Socket failures surface as `io::Error` and terminate the
/// session.
pub trait Synchronizer {
    fn sync_segment(
        &mut self,
        segment: &SegmentConfig,
        pipes: &mut [AlignedBuf],
        batch_size: u32,
    ) -> io::Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quant::FloatType;

    #[test]
    fn test_builders_assign_indices_in_order() {
        let mut net = NetConfigBuilder::new(2, 4);
        let pos = net.add_pipe("POS", TensorSize::d2(FloatType::F32, 4, 1));
        let tok = net.add_pipe("TOK", TensorSize::d2(FloatType::F32, 4, 1));
        assert_eq!((pos, tok), (0, 1));
        net.add_pre_sync(pos);
        let net = net.build();
        assert_eq!(net.pipes.len(), 2);
        assert_eq!(net.pre_syncs, vec![0]);
    }

    #[test]
    fn test_op_code_wire_roundtrip() {
        for tag in 0..17 {
            let code = OpCode::from_wire(tag).unwrap();
            assert_eq!(code.to_wire(), tag);
        }
        assert!(OpCode::from_wire(17).is_err());
    }

    #[test]
    fn test_required_memory_counts_weights() {
        let mut net = NetConfigBuilder::new(1, 1);
        net.add_pipe("X", TensorSize::d2(FloatType::F32, 1, 8));
        let net = net.build();

        let mut node = NodeConfigBuilder::new(0);
        node.add_buffer("x", TensorSize::d2(FloatType::F32, 1, 8));
        let mut seg = SegmentBuilder::new();
        seg.add_op(
            OpCode::Matmul,
            "block_matmul_q",
            0,
            PointerConfig::batch(PointerSource::Buffer, 0),
            PointerConfig::batch(PointerSource::Buffer, 0),
            TensorSize::d2(FloatType::F32, 8, 8),
            OpParams::Matmul {
                n_experts: 0,
                n_active_experts: 0,
                expert_index_buffer: 0,
            },
        );
        node.add_segment(seg.build());
        let node = node.build();
        assert_eq!(node.required_memory(&net), 32 + 32 + 256);
    }
}
