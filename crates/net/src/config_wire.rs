//! Config push: the root serializes the net graph and each worker's
//! node graph field-by-field, little-endian, with length-prefixed
//! strings, bracketed by ACKs so both sides stay in step.

use byteorder::{ByteOrder, LittleEndian};

use latticelm_core::graph::{
    BufferConfig, NetConfig, NodeConfig, OpCode, OpConfig, OpParams, PipeConfig, PointerConfig,
    PointerKind, PointerSource, SegmentConfig, SyncConfig, SyncKind,
};
use latticelm_core::rope::{RopeScaling, RopeType};
use latticelm_core::size::TensorSize;
use latticelm_core::slice::RopeSlice;
use latticelm_core::FloatType;

use crate::error::{NetError, Result};
use crate::socket::Network;

/// Growable little-endian writer.
#[derive(Default)]
pub struct WireWriter {
    buf: Vec<u8>,
}

impl WireWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn f32(&mut self, value: f32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn string(&mut self, value: &str) {
        self.u32(value.len() as u32);
        self.buf.extend_from_slice(value.as_bytes());
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// Cursor-based little-endian reader.
pub struct WireReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        WireReader { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.buf.len() {
            return Err(NetError::ConfigDecode(format!(
                "config truncated at byte {}",
                self.pos
            )));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn u32(&mut self) -> Result<u32> {
        Ok(LittleEndian::read_u32(self.take(4)?))
    }

    pub fn f32(&mut self) -> Result<f32> {
        Ok(LittleEndian::read_f32(self.take(4)?))
    }

    pub fn bool(&mut self) -> Result<bool> {
        Ok(self.u32()? != 0)
    }

    pub fn string(&mut self) -> Result<String> {
        let len = self.u32()? as usize;
        String::from_utf8(self.take(len)?.to_vec())
            .map_err(|_| NetError::ConfigDecode("string is not utf-8".into()))
    }

    pub fn finished(&self) -> bool {
        self.pos == self.buf.len()
    }
}

fn write_size(w: &mut WireWriter, size: &TensorSize) {
    w.u32(size.float_type.to_wire());
    w.u32(size.z);
    w.u32(size.y);
    w.u32(size.x);
}

fn read_size(r: &mut WireReader<'_>) -> Result<TensorSize> {
    let float_type = FloatType::from_wire(r.u32()?)
        .map_err(|e| NetError::ConfigDecode(e.to_string()))?;
    let (z, y, x) = (r.u32()?, r.u32()?, r.u32()?);
    Ok(TensorSize::d3(float_type, z, y, x))
}

fn write_pointer(w: &mut WireWriter, pointer: &PointerConfig) {
    w.u32(match pointer.source {
        PointerSource::Pipe => 0,
        PointerSource::Buffer => 1,
    });
    w.u32(pointer.index);
    w.u32(match pointer.kind {
        PointerKind::Raw => 0,
        PointerKind::Batch => 1,
        PointerKind::BatchedSlice => 2,
    });
}

fn read_pointer(r: &mut WireReader<'_>) -> Result<PointerConfig> {
    let source = match r.u32()? {
        0 => PointerSource::Pipe,
        1 => PointerSource::Buffer,
        other => {
            return Err(NetError::ConfigDecode(format!(
                "unknown pointer source {other}"
            )))
        }
    };
    let index = r.u32()?;
    let kind = match r.u32()? {
        0 => PointerKind::Raw,
        1 => PointerKind::Batch,
        2 => PointerKind::BatchedSlice,
        other => {
            return Err(NetError::ConfigDecode(format!(
                "unknown pointer kind {other}"
            )))
        }
    };
    Ok(PointerConfig { source, index, kind })
}

fn write_rope_slice(w: &mut WireWriter, slice: &RopeSlice) {
    w.u32(slice.q_dim_start);
    w.u32(slice.q_dim_len);
    w.u32(slice.q_shift);
    w.u32(slice.kv_dim);
    w.u32(slice.kv_dim_start);
    w.u32(slice.kv_dim_len);
    w.u32(slice.slice_dim);
    w.u32(slice.seq_len);
    w.u32(slice.head_dim);
    w.u32(slice.n_kv_heads);
    w.f32(slice.rope_theta);
    write_size(w, &slice.cache_size);
}

fn read_rope_slice(r: &mut WireReader<'_>) -> Result<RopeSlice> {
    Ok(RopeSlice {
        q_dim_start: r.u32()?,
        q_dim_len: r.u32()?,
        q_shift: r.u32()?,
        kv_dim: r.u32()?,
        kv_dim_start: r.u32()?,
        kv_dim_len: r.u32()?,
        slice_dim: r.u32()?,
        seq_len: r.u32()?,
        head_dim: r.u32()?,
        n_kv_heads: r.u32()?,
        rope_theta: r.f32()?,
        cache_size: read_size(r)?,
    })
}

fn write_params(w: &mut WireWriter, params: &OpParams) {
    match params {
        OpParams::None => w.u32(0),
        OpParams::InvRms { epsilon, n_columns } => {
            w.u32(1);
            w.f32(*epsilon);
            w.u32(*n_columns);
        }
        OpParams::RmsNorm {
            inv_rms_buffer,
            n_columns,
        } => {
            w.u32(2);
            w.u32(*inv_rms_buffer);
            w.u32(*n_columns);
        }
        OpParams::Matmul {
            n_experts,
            n_active_experts,
            expert_index_buffer,
        } => {
            w.u32(3);
            w.u32(*n_experts);
            w.u32(*n_active_experts);
            w.u32(*expert_index_buffer);
        }
        OpParams::Rope {
            kind,
            is_q,
            position_pipe,
            cache_buffer,
            scaling,
            slice,
        } => {
            w.u32(4);
            w.u32(kind.to_wire());
            w.u32(u32::from(*is_q));
            w.u32(*position_pipe);
            w.u32(*cache_buffer);
            w.f32(scaling.factor);
            w.f32(scaling.low_freq_factor);
            w.f32(scaling.high_freq_factor);
            w.u32(scaling.orig_max_seq_len);
            write_rope_slice(w, slice);
        }
        OpParams::MultiheadAtt {
            n_heads,
            n_heads0,
            n_kv_heads,
            head_dim,
            seq_len,
            q_len,
            kv_len,
            position_pipe,
            query_buffer,
            key_cache_buffer,
            value_cache_buffer,
            att_buffer,
        } => {
            w.u32(5);
            for value in [
                n_heads,
                n_heads0,
                n_kv_heads,
                head_dim,
                seq_len,
                q_len,
                kv_len,
                position_pipe,
                query_buffer,
                key_cache_buffer,
                value_cache_buffer,
                att_buffer,
            ] {
                w.u32(*value);
            }
        }
        OpParams::Mul { multiplier_buffer } => {
            w.u32(6);
            w.u32(*multiplier_buffer);
        }
        OpParams::Scale { scale_buffer } => {
            w.u32(7);
            w.u32(*scale_buffer);
        }
        OpParams::Shift { position_pipe } => {
            w.u32(8);
            w.u32(*position_pipe);
        }
        OpParams::MoeGate {
            k,
            norm_topk,
            index_buffer,
        } => {
            w.u32(9);
            w.u32(*k);
            w.u32(u32::from(*norm_topk));
            w.u32(*index_buffer);
        }
    }
}

fn read_params(r: &mut WireReader<'_>) -> Result<OpParams> {
    Ok(match r.u32()? {
        0 => OpParams::None,
        1 => OpParams::InvRms {
            epsilon: r.f32()?,
            n_columns: r.u32()?,
        },
        2 => OpParams::RmsNorm {
            inv_rms_buffer: r.u32()?,
            n_columns: r.u32()?,
        },
        3 => OpParams::Matmul {
            n_experts: r.u32()?,
            n_active_experts: r.u32()?,
            expert_index_buffer: r.u32()?,
        },
        4 => OpParams::Rope {
            kind: RopeType::from_wire(r.u32()?)
                .ok_or_else(|| NetError::ConfigDecode("unknown rope type".into()))?,
            is_q: r.bool()?,
            position_pipe: r.u32()?,
            cache_buffer: r.u32()?,
            scaling: RopeScaling {
                factor: r.f32()?,
                low_freq_factor: r.f32()?,
                high_freq_factor: r.f32()?,
                orig_max_seq_len: r.u32()?,
            },
            slice: read_rope_slice(r)?,
        },
        5 => OpParams::MultiheadAtt {
            n_heads: r.u32()?,
            n_heads0: r.u32()?,
            n_kv_heads: r.u32()?,
            head_dim: r.u32()?,
            seq_len: r.u32()?,
            q_len: r.u32()?,
            kv_len: r.u32()?,
            position_pipe: r.u32()?,
            query_buffer: r.u32()?,
            key_cache_buffer: r.u32()?,
            value_cache_buffer: r.u32()?,
            att_buffer: r.u32()?,
        },
        6 => OpParams::Mul {
            multiplier_buffer: r.u32()?,
        },
        7 => OpParams::Scale {
            scale_buffer: r.u32()?,
        },
        8 => OpParams::Shift {
            position_pipe: r.u32()?,
        },
        9 => OpParams::MoeGate {
            k: r.u32()?,
            norm_topk: r.bool()?,
            index_buffer: r.u32()?,
        },
        other => {
            return Err(NetError::ConfigDecode(format!(
                "unknown op params tag {other}"
            )))
        }
    })
}

/// Serializes the cluster-global net config.
pub fn encode_net_config(config: &NetConfig) -> Vec<u8> {
    let mut w = WireWriter::new();
    w.u32(config.n_batches);
    w.u32(config.n_nodes);
    w.u32(config.pipes.len() as u32);
    for pipe in &config.pipes {
        write_size(&mut w, &pipe.size);
        w.string(&pipe.name);
    }
    w.u32(config.pre_syncs.len() as u32);
    for &pipe_index in &config.pre_syncs {
        w.u32(pipe_index);
    }
    w.into_bytes()
}

pub fn decode_net_config(buf: &[u8]) -> Result<NetConfig> {
    let mut r = WireReader::new(buf);
    let n_batches = r.u32()?;
    let n_nodes = r.u32()?;
    let n_pipes = r.u32()?;
    let mut pipes = Vec::with_capacity(n_pipes as usize);
    for _ in 0..n_pipes {
        let size = read_size(&mut r)?;
        let name = r.string()?;
        pipes.push(PipeConfig { name, size });
    }
    let n_pre_syncs = r.u32()?;
    let mut pre_syncs = Vec::with_capacity(n_pre_syncs as usize);
    for _ in 0..n_pre_syncs {
        pre_syncs.push(r.u32()?);
    }
    Ok(NetConfig {
        n_batches,
        n_nodes,
        pipes,
        pre_syncs,
    })
}

/// Serializes one node's graph.
pub fn encode_node_config(config: &NodeConfig) -> Vec<u8> {
    let mut w = WireWriter::new();
    w.u32(config.node_index);
    w.u32(config.buffers.len() as u32);
    w.u32(config.segments.len() as u32);
    for buffer in &config.buffers {
        write_size(&mut w, &buffer.size);
        w.string(&buffer.name);
    }
    for segment in &config.segments {
        w.u32(segment.syncs.len() as u32);
        w.u32(segment.ops.len() as u32);
        for sync in &segment.syncs {
            w.u32(sync.pipe_index);
            w.u32(sync.kind.to_wire());
        }
        for op in &segment.ops {
            w.u32(op.code.to_wire());
            w.u32(op.index);
            write_size(&mut w, &op.weight_size);
            w.string(&op.name);
            write_pointer(&mut w, &op.input);
            write_pointer(&mut w, &op.output);
            write_params(&mut w, &op.params);
        }
    }
    w.into_bytes()
}

pub fn decode_node_config(buf: &[u8]) -> Result<NodeConfig> {
    let mut r = WireReader::new(buf);
    let node_index = r.u32()?;
    let n_buffers = r.u32()?;
    let n_segments = r.u32()?;
    let mut buffers = Vec::with_capacity(n_buffers as usize);
    for _ in 0..n_buffers {
        let size = read_size(&mut r)?;
        let name = r.string()?;
        buffers.push(BufferConfig { name, size });
    }
    let mut segments = Vec::with_capacity(n_segments as usize);
    for _ in 0..n_segments {
        let n_syncs = r.u32()?;
        let n_ops = r.u32()?;
        let mut syncs = Vec::with_capacity(n_syncs as usize);
        for _ in 0..n_syncs {
            let pipe_index = r.u32()?;
            let kind = SyncKind::from_wire(r.u32()?)
                .map_err(|e| NetError::ConfigDecode(e.to_string()))?;
            syncs.push(SyncConfig { pipe_index, kind });
        }
        let mut ops = Vec::with_capacity(n_ops as usize);
        for _ in 0..n_ops {
            let code = OpCode::from_wire(r.u32()?)
                .map_err(|e| NetError::ConfigDecode(e.to_string()))?;
            let index = r.u32()?;
            let weight_size = read_size(&mut r)?;
            let name = r.string()?;
            let input = read_pointer(&mut r)?;
            let output = read_pointer(&mut r)?;
            let params = read_params(&mut r)?;
            ops.push(OpConfig {
                code,
                name,
                index,
                input,
                output,
                weight_size,
                params,
            });
        }
        segments.push(SegmentConfig { ops, syncs });
    }
    Ok(NodeConfig {
        node_index,
        buffers,
        segments,
    })
}

/// Serializes the partition plan. The plan rides the config push so
/// every node slices pipes and weights from the same authority instead
/// of re-deriving it.
pub fn encode_plan(plan: &latticelm_core::plan::PartitionPlan) -> Vec<u8> {
    let mut w = WireWriter::new();
    w.u32(plan.n_nodes);
    w.u32(plan.stages.len() as u32);
    for stage in &plan.stages {
        w.u32(stage.stage_index);
        w.u32(stage.start_layer);
        w.u32(stage.end_layer);
        w.u32(stage.root_node_index);
        w.u32(stage.node_indices.len() as u32);
        for &node in &stage.node_indices {
            w.u32(node);
        }
    }
    for split in [
        &plan.head_split,
        &plan.kv_head_split,
        &plan.vocab_split,
        &plan.ffn_split,
        &plan.dim_split,
    ] {
        for &start in &split.starts {
            w.u32(start);
        }
        for &length in &split.lengths {
            w.u32(length);
        }
    }
    w.into_bytes()
}

pub fn decode_plan(buf: &[u8]) -> Result<latticelm_core::plan::PartitionPlan> {
    use latticelm_core::plan::{DimSplit, PartitionPlan, StageConfig};
    let mut r = WireReader::new(buf);
    let n_nodes = r.u32()?;
    let n_stages = r.u32()?;
    let mut stages = Vec::with_capacity(n_stages as usize);
    for _ in 0..n_stages {
        let stage_index = r.u32()?;
        let start_layer = r.u32()?;
        let end_layer = r.u32()?;
        let root_node_index = r.u32()?;
        let n_members = r.u32()?;
        let mut node_indices = Vec::with_capacity(n_members as usize);
        for _ in 0..n_members {
            node_indices.push(r.u32()?);
        }
        stages.push(StageConfig {
            stage_index,
            start_layer,
            end_layer,
            n_layers: end_layer - start_layer,
            root_node_index,
            node_indices,
        });
    }
    let mut read_split = |r: &mut WireReader<'_>| -> Result<DimSplit> {
        let mut starts = Vec::with_capacity(n_nodes as usize);
        for _ in 0..n_nodes {
            starts.push(r.u32()?);
        }
        let mut lengths = Vec::with_capacity(n_nodes as usize);
        for _ in 0..n_nodes {
            lengths.push(r.u32()?);
        }
        Ok(DimSplit { starts, lengths })
    };
    let head_split = read_split(&mut r)?;
    let kv_head_split = read_split(&mut r)?;
    let vocab_split = read_split(&mut r)?;
    let ffn_split = read_split(&mut r)?;
    let dim_split = read_split(&mut r)?;
    Ok(PartitionPlan {
        n_nodes,
        stages,
        head_split,
        kv_head_split,
        vocab_split,
        ffn_split,
        dim_split,
    })
}

/// Root side of the config push: ACK, length-prefixed payload, ACK back.
pub fn push_config(network: &Network, socket_index: usize, payload: &[u8]) -> Result<()> {
    network.write_ack(socket_index)?;
    network.write(socket_index, &(payload.len() as u32).to_le_bytes())?;
    network.write(socket_index, payload)?;
    network.read_ack(socket_index)?;
    Ok(())
}

/// Worker side of the config push.
pub fn pull_config(network: &Network, socket_index: usize) -> Result<Vec<u8>> {
    network.read_ack(socket_index)?;
    let mut len_buf = [0u8; 4];
    network.read(socket_index, &mut len_buf)?;
    let len = LittleEndian::read_u32(&len_buf) as usize;
    let mut payload = vec![0u8; len];
    network.read(socket_index, &mut payload)?;
    network.write_ack(socket_index)?;
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use latticelm_core::graph::{NetConfigBuilder, NodeConfigBuilder, SegmentBuilder};

    #[test]
    fn test_net_config_roundtrip() {
        let mut builder = NetConfigBuilder::new(4, 8);
        builder.add_pipe("POS", TensorSize::d2(FloatType::F32, 8, 1));
        builder.add_pipe("ZQ", TensorSize::d2(FloatType::Q80, 8, 4096));
        builder.add_pre_sync(0);
        let config = builder.build();

        let decoded = decode_net_config(&encode_net_config(&config)).unwrap();
        assert_eq!(decoded, config);
    }

    #[test]
    fn test_node_config_roundtrip() {
        let mut node = NodeConfigBuilder::new(2);
        let x = node.add_buffer("x", TensorSize::d2(FloatType::F32, 8, 1024));
        let mut segment = SegmentBuilder::new();
        segment.add_op(
            OpCode::Matmul,
            "block_matmul_q",
            3,
            PointerConfig::batch(PointerSource::Buffer, x),
            PointerConfig::batch(PointerSource::Buffer, x),
            TensorSize::d2(FloatType::Q40, 1024, 512),
            OpParams::Matmul {
                n_experts: 0,
                n_active_experts: 0,
                expert_index_buffer: 0,
            },
        );
        segment.add_sync(4, SyncKind::NodeSlices);
        node.add_segment(segment.build());
        let config = node.build();

        let decoded = decode_node_config(&encode_node_config(&config)).unwrap();
        assert_eq!(decoded, config);
    }

    #[test]
    fn test_plan_roundtrip() {
        use latticelm_core::plan::{ModelDims, PartitionPlan, StageDef};
        let plan = PartitionPlan::new(
            &[
                StageDef {
                    n_layers: 2,
                    tp_ratios: vec![1.0, 1.0],
                },
                StageDef {
                    n_layers: 6,
                    tp_ratios: vec![2.0, 3.0],
                },
            ],
            ModelDims {
                n_layers: 8,
                n_heads: 16,
                n_kv_heads: 8,
                vocab_size: 32_000,
                ffn_dim: 2048,
                dim: 1024,
            },
        )
        .unwrap();
        let decoded = decode_plan(&encode_plan(&plan)).unwrap();
        assert_eq!(decoded, plan);
    }

    #[test]
    fn test_truncated_config_is_rejected() {
        let mut builder = NetConfigBuilder::new(1, 1);
        builder.add_pipe("X", TensorSize::d2(FloatType::F32, 1, 16));
        let bytes = encode_net_config(&builder.build());
        assert!(decode_net_config(&bytes[..bytes.len() - 2]).is_err());
    }
}
