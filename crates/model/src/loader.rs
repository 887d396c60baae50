//! Weight loading.
//!
//! The tensor stream is a fixed-order walk (embedding, per-layer
//! attention/FFN/norm tensors, final norm, lm-head). The walker drives
//! one of two [`WeightLoader`] implementations:
//!
//! - [`LocalWeightLoader`]: every node memory-maps the model file and
//!   extracts its own shards; row shards copy one contiguous range,
//!   column shards reassemble strided rows.
//! - [`RootWeightDistributor`]: legacy mode for uniform partitions;
//!   the root extracts every node's shard and pushes it over the mesh.
//!
//! After each layer the consumed byte count is checked against the
//! precomputed layer footprint; a mismatch aborts with
//! `WeightStreamMisaligned`.

use latticelm_core::graph::WeightSink;
use latticelm_core::plan::PartitionPlan;
use latticelm_core::size::TensorSize;
use latticelm_core::slice::{ColMatmulSlice, RowMatmulSlice};
use latticelm_core::FloatType;
use latticelm_net::weight_wire;
use latticelm_net::Network;

use crate::error::{ModelError, Result};
use crate::header::ModelHeader;
use crate::mmap::ModelFile;

/// Which nodes a walk loads weights for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadScope {
    /// Legacy root-distribution: every node's shard is produced.
    AllNodes,
    /// Local loading: only this node's shards; everything else is
    /// skipped by advancing the cursor.
    Node(u32),
}

/// The loading interface shared by both distribution modes. Each
/// method receives the full global tensor bytes; implementations pick
/// out what they need.
pub trait WeightLoader {
    fn load_root(&mut self, name: &str, index: u32, data: &[u8]) -> Result<()>;
    fn load_all(&mut self, name: &str, index: u32, data: &[u8]) -> Result<()>;
    fn load_row_shard(
        &mut self,
        name: &str,
        index: u32,
        expert: u32,
        slicer: &dyn Fn(u32) -> RowMatmulSlice,
        data: &[u8],
    ) -> Result<()>;
    fn load_col_shard(
        &mut self,
        name: &str,
        index: u32,
        expert: u32,
        slicer: &dyn Fn(u32) -> ColMatmulSlice,
        data: &[u8],
    ) -> Result<()>;
    fn finish(&mut self) -> Result<()>;
}

/// Per-layer tensor footprint in bytes, used both to skip foreign
/// layers and to verify stream alignment.
pub fn layer_bytes(h: &ModelHeader) -> usize {
    let wt = h.weight_type;
    let ffn = h.ffn_dim();
    let mut bytes = 0usize;
    bytes += TensorSize::d2(wt, h.dim, h.q_dim).n_bytes;
    bytes += TensorSize::d2(wt, h.dim, h.kv_dim).n_bytes * 2;
    bytes += TensorSize::d2(wt, h.q_dim, h.dim).n_bytes;
    if h.n_experts > 0 {
        bytes += TensorSize::d2(FloatType::F32, h.dim, h.n_experts).n_bytes;
        bytes += h.n_experts as usize
            * (TensorSize::d2(wt, h.dim, ffn).n_bytes * 2 + TensorSize::d2(wt, ffn, h.dim).n_bytes);
    } else {
        bytes += TensorSize::d2(wt, h.dim, ffn).n_bytes * 2;
        bytes += TensorSize::d2(wt, ffn, h.dim).n_bytes;
    }
    if h.arch.is_qwen() {
        bytes += TensorSize::d1(FloatType::F32, h.head_dim).n_bytes * 2;
    }
    bytes += TensorSize::d1(FloatType::F32, h.dim).n_bytes * 2;
    bytes
}

/// Bytes of the final norm plus lm-head.
pub fn final_bytes(h: &ModelHeader) -> usize {
    TensorSize::d1(FloatType::F32, h.dim).n_bytes
        + TensorSize::d2(h.weight_type, h.dim, h.vocab_size).n_bytes
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
    layer: u32,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n_bytes: usize) -> Result<&'a [u8]> {
        if self.pos + n_bytes > self.data.len() {
            return Err(ModelError::WeightStreamMisaligned {
                layer: self.layer,
                expected: n_bytes,
                actual: self.data.len() - self.pos,
            });
        }
        let out = &self.data[self.pos..self.pos + n_bytes];
        self.pos += n_bytes;
        Ok(out)
    }

    fn skip(&mut self, n_bytes: usize) -> Result<()> {
        self.take(n_bytes).map(|_| ())
    }
}

/// Walks the whole tensor stream, loading or skipping according to
/// `scope`, and verifies byte accounting layer by layer.
pub fn load_model_weights(
    file: &ModelFile,
    h: &ModelHeader,
    plan: &PartitionPlan,
    scope: LoadScope,
    loader: &mut dyn WeightLoader,
) -> Result<()> {
    let (start_layer, end_layer, is_first_stage, is_last_stage) = match scope {
        LoadScope::AllNodes => (0, h.n_layers, true, true),
        LoadScope::Node(node_index) => {
            let stage = plan.stage_for_node(node_index).ok_or_else(|| {
                ModelError::UnsupportedModel(format!("node {node_index} is not in the plan"))
            })?;
            (
                stage.start_layer,
                stage.end_layer,
                stage.stage_index == 0,
                stage.stage_index as usize == plan.stages.len() - 1,
            )
        }
    };
    tracing::info!(
        start_layer,
        end_layer,
        "loading weights for layers [{start_layer}, {end_layer})"
    );

    let wt = h.weight_type;
    let ffn = h.ffn_dim();
    let mut cursor = Cursor {
        data: file.tensor_data(h.header_size),
        pos: 0,
        layer: 0,
    };

    // Embedding lives on the first stage only.
    let embedding_size = TensorSize::d2(FloatType::F32, h.vocab_size, h.dim);
    let embedding = cursor.take(embedding_size.n_bytes)?;
    if is_first_stage {
        loader.load_root("embedding", 0, embedding)?;
    }

    let head_dim = h.head_dim;
    let dim = h.dim;
    let q_dim = h.q_dim;
    let kv_dim = h.kv_dim;
    let expected_layer_bytes = layer_bytes(h);
    let rms_size = TensorSize::d1(FloatType::F32, h.dim);
    let qk_norm_size = TensorSize::d1(FloatType::F32, h.head_dim);

    for layer in 0..h.n_layers {
        cursor.layer = layer;
        if layer < start_layer || layer >= end_layer {
            cursor.skip(expected_layer_bytes)?;
            continue;
        }
        let layer_start = cursor.pos;

        let q_slicer =
            |node: u32| RowMatmulSlice::for_heads(wt, dim, head_dim, &plan.head_split, q_dim, node);
        let kv_slicer = |node: u32| {
            RowMatmulSlice::for_heads(wt, dim, head_dim, &plan.kv_head_split, kv_dim, node)
        };
        let wo_slicer = |node: u32| ColMatmulSlice::for_heads(wt, q_dim, dim, head_dim, plan, node);
        let w13_slicer = |node: u32| RowMatmulSlice::for_ffn(wt, dim, ffn, plan, node);
        let w2_slicer = |node: u32| ColMatmulSlice::for_ffn(wt, ffn, dim, plan, node);

        let q_bytes = cursor.take(TensorSize::d2(wt, dim, q_dim).n_bytes)?;
        loader.load_row_shard("block_matmul_q", layer, 0, &q_slicer, q_bytes)?;
        let k_bytes = cursor.take(TensorSize::d2(wt, dim, kv_dim).n_bytes)?;
        loader.load_row_shard("block_matmul_k", layer, 0, &kv_slicer, k_bytes)?;
        let v_bytes = cursor.take(TensorSize::d2(wt, dim, kv_dim).n_bytes)?;
        loader.load_row_shard("block_matmul_v", layer, 0, &kv_slicer, v_bytes)?;
        let wo_bytes = cursor.take(TensorSize::d2(wt, q_dim, dim).n_bytes)?;
        loader.load_col_shard("block_matmul_wo", layer, 0, &wo_slicer, wo_bytes)?;

        if h.n_experts > 0 {
            let gate_bytes =
                cursor.take(TensorSize::d2(FloatType::F32, dim, h.n_experts).n_bytes)?;
            loader.load_all("block_moe_gate", layer, gate_bytes)?;
            for expert in 0..h.n_experts {
                let w1 = cursor.take(TensorSize::d2(wt, dim, ffn).n_bytes)?;
                loader.load_row_shard("block_matmul_w1", layer, expert, &w13_slicer, w1)?;
                let w2 = cursor.take(TensorSize::d2(wt, ffn, dim).n_bytes)?;
                loader.load_col_shard("block_matmul_w2", layer, expert, &w2_slicer, w2)?;
                let w3 = cursor.take(TensorSize::d2(wt, dim, ffn).n_bytes)?;
                loader.load_row_shard("block_matmul_w3", layer, expert, &w13_slicer, w3)?;
            }
        } else {
            let w1 = cursor.take(TensorSize::d2(wt, dim, ffn).n_bytes)?;
            loader.load_row_shard("block_matmul_w1", layer, 0, &w13_slicer, w1)?;
            let w2 = cursor.take(TensorSize::d2(wt, ffn, dim).n_bytes)?;
            loader.load_col_shard("block_matmul_w2", layer, 0, &w2_slicer, w2)?;
            let w3 = cursor.take(TensorSize::d2(wt, dim, ffn).n_bytes)?;
            loader.load_row_shard("block_matmul_w3", layer, 0, &w13_slicer, w3)?;
        }

        if h.arch.is_qwen() {
            let q_norm = cursor.take(qk_norm_size.n_bytes)?;
            loader.load_all("block_norm_q", layer, q_norm)?;
            let k_norm = cursor.take(qk_norm_size.n_bytes)?;
            loader.load_all("block_norm_k", layer, k_norm)?;
        }
        let attn_norm = cursor.take(rms_size.n_bytes)?;
        loader.load_all("block_norm_0", layer, attn_norm)?;
        let ffn_norm = cursor.take(rms_size.n_bytes)?;
        loader.load_all("block_norm_1", layer, ffn_norm)?;

        let consumed = cursor.pos - layer_start;
        if consumed != expected_layer_bytes {
            return Err(ModelError::WeightStreamMisaligned {
                layer,
                expected: expected_layer_bytes,
                actual: consumed,
            });
        }
    }

    cursor.layer = h.n_layers;
    if is_last_stage {
        let final_norm = cursor.take(rms_size.n_bytes)?;
        loader.load_all("final_norm", 0, final_norm)?;
        let wcls_slicer = |node: u32| RowMatmulSlice::for_logits(wt, dim, h.vocab_size, plan, node);
        let head = cursor.take(TensorSize::d2(wt, dim, h.vocab_size).n_bytes)?;
        loader.load_row_shard("final_matmul_logits", 0, 0, &wcls_slicer, head)?;
    } else {
        cursor.skip(final_bytes(h))?;
    }

    let drift = cursor.data.len() as i64 - cursor.pos as i64;
    if drift != 0 {
        return Err(ModelError::WeightStreamDrift(drift));
    }

    loader.finish()?;
    tracing::info!("weights loaded");
    Ok(())
}

/// Loads this node's shards straight out of the memory map.
pub struct LocalWeightLoader<'a> {
    node_index: u32,
    sink: &'a mut dyn WeightSink,
    scratch: Vec<u8>,
}

impl<'a> LocalWeightLoader<'a> {
    pub fn new(node_index: u32, sink: &'a mut dyn WeightSink) -> Self {
        LocalWeightLoader {
            node_index,
            sink,
            scratch: Vec::new(),
        }
    }
}

impl WeightLoader for LocalWeightLoader<'_> {
    fn load_root(&mut self, name: &str, index: u32, data: &[u8]) -> Result<()> {
        self.sink.upload(name, index, 0, data);
        Ok(())
    }

    fn load_all(&mut self, name: &str, index: u32, data: &[u8]) -> Result<()> {
        self.sink.upload(name, index, 0, data);
        Ok(())
    }

    fn load_row_shard(
        &mut self,
        name: &str,
        index: u32,
        expert: u32,
        slicer: &dyn Fn(u32) -> RowMatmulSlice,
        data: &[u8],
    ) -> Result<()> {
        let slice = slicer(self.node_index);
        let shard = slice.shard();
        let offset = expert as usize * slice.slice_size.n_bytes;
        // Row shards are contiguous on disk: hand the mapped range to
        // the sink without staging.
        let src = &data[shard.src_offset()..shard.src_offset() + shard.packed_len()];
        self.sink.upload(name, index, offset, src);
        Ok(())
    }

    fn load_col_shard(
        &mut self,
        name: &str,
        index: u32,
        expert: u32,
        slicer: &dyn Fn(u32) -> ColMatmulSlice,
        data: &[u8],
    ) -> Result<()> {
        let slice = slicer(self.node_index);
        let offset = expert as usize * slice.slice_size.n_bytes;
        self.scratch.resize(slice.slice_size.n_bytes, 0);
        slice.copy_into(data, &mut self.scratch);
        self.sink.upload(name, index, offset, &self.scratch);
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.scratch = Vec::new();
        Ok(())
    }
}

/// Legacy root distributor: the root keeps its own shard and pushes
/// every worker's shard over the mesh.
pub struct RootWeightDistributor<'a> {
    network: Option<&'a Network>,
    n_nodes: u32,
    sink: &'a mut dyn WeightSink,
    scratch: Vec<u8>,
}

impl<'a> RootWeightDistributor<'a> {
    pub fn new(network: Option<&'a Network>, n_nodes: u32, sink: &'a mut dyn WeightSink) -> Self {
        RootWeightDistributor {
            network,
            n_nodes,
            sink,
            scratch: Vec::new(),
        }
    }

    fn push(
        &self,
        node: u32,
        name: &str,
        index: u32,
        offset: usize,
        payload: &[u8],
    ) -> Result<()> {
        let network = self
            .network
            .expect("distributing weights requires a network");
        weight_wire::write_weight_chunk(
            network,
            (node - 1) as usize,
            name,
            index,
            offset as u64,
            payload,
        )?;
        Ok(())
    }
}

impl WeightLoader for RootWeightDistributor<'_> {
    fn load_root(&mut self, name: &str, index: u32, data: &[u8]) -> Result<()> {
        self.sink.upload(name, index, 0, data);
        Ok(())
    }

    fn load_all(&mut self, name: &str, index: u32, data: &[u8]) -> Result<()> {
        self.sink.upload(name, index, 0, data);
        for node in 1..self.n_nodes {
            self.push(node, name, index, 0, data)?;
        }
        Ok(())
    }

    fn load_row_shard(
        &mut self,
        name: &str,
        index: u32,
        expert: u32,
        slicer: &dyn Fn(u32) -> RowMatmulSlice,
        data: &[u8],
    ) -> Result<()> {
        for node in 0..self.n_nodes {
            let slice = slicer(node);
            let shard = slice.shard();
            let offset = expert as usize * slice.slice_size.n_bytes;
            let src = &data[shard.src_offset()..shard.src_offset() + shard.packed_len()];
            if node == 0 {
                self.sink.upload(name, index, offset, src);
            } else {
                self.push(node, name, index, offset, src)?;
            }
        }
        Ok(())
    }

    fn load_col_shard(
        &mut self,
        name: &str,
        index: u32,
        expert: u32,
        slicer: &dyn Fn(u32) -> ColMatmulSlice,
        data: &[u8],
    ) -> Result<()> {
        for node in 0..self.n_nodes {
            let slice = slicer(node);
            let offset = expert as usize * slice.slice_size.n_bytes;
            self.scratch.resize(slice.slice_size.n_bytes, 0);
            slice.copy_into(data, &mut self.scratch);
            if node == 0 {
                self.sink.upload(name, index, offset, &self.scratch);
            } else {
                let payload = std::mem::take(&mut self.scratch);
                self.push(node, name, index, offset, &payload)?;
                self.scratch = payload;
            }
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        if let Some(network) = self.network {
            for socket_index in 0..self.n_nodes as usize - 1 {
                weight_wire::finish_weight_stream(network, socket_index)?;
            }
        }
        self.scratch = Vec::new();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::encode_header;
    use std::collections::HashMap;
    use std::io::Write;

    struct RecordingSink {
        uploads: HashMap<(String, u32), Vec<(usize, usize)>>,
        total: usize,
    }

    impl RecordingSink {
        fn new() -> Self {
            RecordingSink {
                uploads: HashMap::new(),
                total: 0,
            }
        }
    }

    impl WeightSink for RecordingSink {
        fn upload(&mut self, name: &str, index: u32, offset: usize, data: &[u8]) {
            self.uploads
                .entry((name.to_string(), index))
                .or_default()
                .push((offset, data.len()));
            self.total += data.len();
        }
    }

    /// Ranges every node reads (including skips) must tile the whole
    /// tensor section.
    struct CoverageLoader {
        loaded: usize,
    }

    impl WeightLoader for CoverageLoader {
        fn load_root(&mut self, _: &str, _: u32, data: &[u8]) -> Result<()> {
            self.loaded += data.len();
            Ok(())
        }
        fn load_all(&mut self, _: &str, _: u32, data: &[u8]) -> Result<()> {
            self.loaded += data.len();
            Ok(())
        }
        fn load_row_shard(
            &mut self,
            _: &str,
            _: u32,
            _: u32,
            _: &dyn Fn(u32) -> RowMatmulSlice,
            data: &[u8],
        ) -> Result<()> {
            self.loaded += data.len();
            Ok(())
        }
        fn load_col_shard(
            &mut self,
            _: &str,
            _: u32,
            _: u32,
            _: &dyn Fn(u32) -> ColMatmulSlice,
            data: &[u8],
        ) -> Result<()> {
            self.loaded += data.len();
            Ok(())
        }
        fn finish(&mut self) -> Result<()> {
            Ok(())
        }
    }

    fn tiny_model_file() -> (tempfile::NamedTempFile, ModelHeader) {
        let pairs = vec![
            (0, 1),  // VERSION
            (1, 0),  // ARCH_TYPE llama
            (2, 8),  // DIM
            (3, 16), // HIDDEN_DIM
            (4, 2),  // N_LAYERS
            (5, 2),  // N_HEADS
            (6, 2),  // N_KV_HEADS
            (9, 32), // VOCAB_SIZE
            (10, 16), // SEQ_LEN
            (13, 0), // WEIGHT_FLOAT_TYPE f32
        ];
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&encode_header(&pairs)).unwrap();

        // Tensor section: embedding + 2 layers + final norm + lm head,
        // filled with a counting pattern.
        let header = {
            // Sizes must match ModelHeader::load on this file.
            file.flush().unwrap();
            ModelHeader::load(file.path(), 0, FloatType::F32).unwrap()
        };
        let tensor_bytes = TensorSize::d2(FloatType::F32, header.vocab_size, header.dim).n_bytes
            + layer_bytes(&header) * header.n_layers as usize
            + final_bytes(&header);
        let payload: Vec<u8> = (0..tensor_bytes).map(|i| (i % 251) as u8).collect();
        file.write_all(&payload).unwrap();
        file.flush().unwrap();
        let header = ModelHeader::load(file.path(), 0, FloatType::F32).unwrap();
        (file, header)
    }

    #[test]
    fn test_local_load_covers_stream_exactly() {
        let (file, header) = tiny_model_file();
        let plan = PartitionPlan::uniform(2, header.dims()).unwrap();
        let model = ModelFile::open(file.path()).unwrap();

        for node in 0..2 {
            let mut loader = CoverageLoader { loaded: 0 };
            load_model_weights(&model, &header, &plan, LoadScope::Node(node), &mut loader)
                .unwrap();
            assert!(loader.loaded > 0);
        }
    }

    #[test]
    fn test_local_loader_uploads_expected_ops() {
        let (file, header) = tiny_model_file();
        let plan = PartitionPlan::uniform(1, header.dims()).unwrap();
        let model = ModelFile::open(file.path()).unwrap();

        let mut sink = RecordingSink::new();
        let mut loader = LocalWeightLoader::new(0, &mut sink);
        load_model_weights(&model, &header, &plan, LoadScope::Node(0), &mut loader).unwrap();

        for name in [
            "embedding",
            "block_matmul_q",
            "block_matmul_wo",
            "block_matmul_w2",
            "block_norm_0",
            "final_norm",
            "final_matmul_logits",
        ] {
            let key_count = sink
                .uploads
                .keys()
                .filter(|(n, _)| n == name)
                .count();
            assert!(key_count > 0, "missing uploads for {name}");
        }
        // Single node: everything in the file is uploaded exactly once.
        assert_eq!(
            sink.total,
            model.tensor_data(header.header_size).len()
        );
    }

    #[test]
    fn test_truncated_layer_misaligns() {
        let (file, header) = tiny_model_file();
        let plan = PartitionPlan::uniform(1, header.dims()).unwrap();

        // Rewrite the file one f32 short of the full stream.
        let bytes = std::fs::read(file.path()).unwrap();
        let mut truncated = tempfile::NamedTempFile::new().unwrap();
        truncated.write_all(&bytes[..bytes.len() - 4]).unwrap();
        truncated.flush().unwrap();

        let header = ModelHeader {
            file_size: bytes.len() - 4,
            ..header
        };
        let model = ModelFile::open(truncated.path()).unwrap();
        let mut loader = CoverageLoader { loaded: 0 };
        let err = load_model_weights(&model, &header, &plan, LoadScope::Node(0), &mut loader)
            .unwrap_err();
        assert!(matches!(
            err,
            ModelError::WeightStreamMisaligned { .. } | ModelError::WeightStreamDrift(_)
        ));
    }

    #[test]
    fn test_pp_node_skips_foreign_layers() {
        let (file, header) = tiny_model_file();
        let plan = PartitionPlan::new(
            &[
                latticelm_core::plan::StageDef {
                    n_layers: 1,
                    tp_ratios: vec![1.0],
                },
                latticelm_core::plan::StageDef {
                    n_layers: 1,
                    tp_ratios: vec![1.0],
                },
            ],
            header.dims(),
        )
        .unwrap();
        let model = ModelFile::open(file.path()).unwrap();

        let mut sink = RecordingSink::new();
        let mut loader = LocalWeightLoader::new(1, &mut sink);
        load_model_weights(&model, &header, &plan, LoadScope::Node(1), &mut loader).unwrap();

        // Node 1 is the last stage: it owns layer 1 plus the final
        // block, but not the embedding or layer 0.
        assert!(sink.uploads.contains_key(&("block_matmul_q".into(), 1)));
        assert!(!sink.uploads.contains_key(&("block_matmul_q".into(), 0)));
        assert!(!sink.uploads.contains_key(&("embedding".into(), 0)));
        assert!(sink.uploads.contains_key(&("final_matmul_logits".into(), 0)));
    }
}
