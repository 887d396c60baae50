//! Per-node tensor slices and weight shard byte math.
//!
//! Every copy out of the model file goes through a [`ShardDescriptor`]:
//! a row range with a stride, so that contiguous row shards and strided
//! column shards share one arithmetic path instead of scattering offset
//! math across the loaders.

use crate::plan::{DimSplit, PartitionPlan};
use crate::quant::FloatType;
use crate::rope::RopeType;
use crate::size::TensorSize;

/// A rectangular byte region of a row-major matrix on disk:
/// `n_rows` rows of `row_bytes`, starting at `start_row`, with
/// consecutive source rows `row_stride` bytes apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardDescriptor {
    pub row_bytes: usize,
    pub row_stride: usize,
    pub start_row: usize,
    pub n_rows: usize,
}

impl ShardDescriptor {
    /// True when the shard occupies one contiguous byte range and a
    /// single copy suffices.
    pub fn contiguous(&self) -> bool {
        self.row_bytes == self.row_stride
    }

    /// Byte offset of the shard's first row in the source tensor.
    pub fn src_offset(&self) -> usize {
        self.start_row * self.row_stride
    }

    /// Bytes the shard occupies once packed densely.
    pub fn packed_len(&self) -> usize {
        self.n_rows * self.row_bytes
    }

    /// Copies the shard out of `src` (the full tensor bytes) into `dst`
    /// (densely packed). One copy for contiguous shards, one per row
    /// otherwise.
    pub fn copy_into(&self, src: &[u8], dst: &mut [u8]) {
        assert_eq!(dst.len(), self.packed_len());
        if self.contiguous() {
            let offset = self.start_row * self.row_stride;
            dst.copy_from_slice(&src[offset..offset + self.packed_len()]);
            return;
        }
        for row in 0..self.n_rows {
            let src_start = (self.start_row + row) * self.row_stride;
            let dst_start = row * self.row_bytes;
            dst[dst_start..dst_start + self.row_bytes]
                .copy_from_slice(&src[src_start..src_start + self.row_bytes]);
        }
    }
}

/// A node's share of a row-sharded matmul weight: rows
/// `[in_start, in_start + in_len)` of a `d × n` matrix, contiguous on
/// disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowMatmulSlice {
    pub float_type: FloatType,
    /// First owned output row (global).
    pub in_start: u32,
    /// Owned output rows.
    pub in_len: u32,
    /// Full input dimension (matrix width).
    pub n: u32,
    /// Full tensor size on disk.
    pub size: TensorSize,
    /// This node's packed shard size.
    pub slice_size: TensorSize,
}

impl RowMatmulSlice {
    /// Slice for a head-partitioned projection (Q, K or V): the split
    /// counts heads, each `head_dim` rows wide.
    pub fn for_heads(
        float_type: FloatType,
        global_in_dim: u32,
        head_dim: u32,
        split: &DimSplit,
        global_out_dim: u32,
        node_index: u32,
    ) -> Self {
        let in_start = split.starts[node_index as usize] * head_dim;
        let in_len = split.lengths[node_index as usize] * head_dim;
        RowMatmulSlice {
            float_type,
            in_start,
            in_len,
            n: global_in_dim,
            size: TensorSize::d2(float_type, global_in_dim, global_out_dim),
            slice_size: TensorSize::d2(float_type, global_in_dim, in_len),
        }
    }

    /// Slice for an FFN up/gate projection partitioned by the FFN split.
    pub fn for_ffn(
        float_type: FloatType,
        global_in_dim: u32,
        global_ffn_dim: u32,
        plan: &PartitionPlan,
        node_index: u32,
    ) -> Self {
        let in_start = plan.ffn_split.starts[node_index as usize];
        let in_len = plan.ffn_split.lengths[node_index as usize];
        RowMatmulSlice {
            float_type,
            in_start,
            in_len,
            n: global_in_dim,
            size: TensorSize::d2(float_type, global_in_dim, global_ffn_dim),
            slice_size: TensorSize::d2(float_type, global_in_dim, in_len),
        }
    }

    /// Slice of the lm-head, partitioned by the vocab split.
    pub fn for_logits(
        float_type: FloatType,
        global_in_dim: u32,
        global_vocab_size: u32,
        plan: &PartitionPlan,
        node_index: u32,
    ) -> Self {
        let in_start = plan.vocab_split.starts[node_index as usize];
        let in_len = plan.vocab_split.lengths[node_index as usize];
        RowMatmulSlice {
            float_type,
            in_start,
            in_len,
            n: global_in_dim,
            size: TensorSize::d2(float_type, global_in_dim, global_vocab_size),
            slice_size: TensorSize::d2(float_type, global_in_dim, in_len),
        }
    }

    /// The byte region of this shard. Row shards are row-contiguous on
    /// disk so the descriptor collapses to a single range.
    pub fn shard(&self) -> ShardDescriptor {
        let block = self.float_type.block_size() as u32;
        assert_eq!(self.n % block, 0, "matmul width not block-aligned");
        let row_bytes = self.float_type.bytes_for(self.n as usize);
        ShardDescriptor {
            row_bytes,
            row_stride: row_bytes,
            start_row: self.in_start as usize,
            n_rows: self.in_len as usize,
        }
    }
}

/// A node's share of a column-sharded matmul weight (Wo, W2): columns
/// `[out_start, out_start + out_len)` of every row of a `d × n` matrix;
/// strided on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColMatmulSlice {
    pub float_type: FloatType,
    /// First owned input column (global).
    pub out_start: u32,
    /// Owned input columns.
    pub out_len: u32,
    /// Full input dimension.
    pub n: u32,
    /// Local input dimension (equals `out_len`).
    pub n0: u32,
    /// Full output dimension.
    pub d: u32,
    pub size: TensorSize,
    pub slice_size: TensorSize,
}

impl ColMatmulSlice {
    /// Slice of the attention output projection, partitioned by heads.
    pub fn for_heads(
        float_type: FloatType,
        global_in_dim: u32,
        global_out_dim: u32,
        head_dim: u32,
        plan: &PartitionPlan,
        node_index: u32,
    ) -> Self {
        let out_start = plan.head_split.starts[node_index as usize] * head_dim;
        let out_len = plan.head_split.lengths[node_index as usize] * head_dim;
        Self::with_range(float_type, global_in_dim, global_out_dim, out_start, out_len)
    }

    /// Slice of the FFN down projection, partitioned by the FFN split.
    pub fn for_ffn(
        float_type: FloatType,
        global_ffn_dim: u32,
        global_out_dim: u32,
        plan: &PartitionPlan,
        node_index: u32,
    ) -> Self {
        let out_start = plan.ffn_split.starts[node_index as usize];
        let out_len = plan.ffn_split.lengths[node_index as usize];
        Self::with_range(float_type, global_ffn_dim, global_out_dim, out_start, out_len)
    }

    fn with_range(
        float_type: FloatType,
        global_in_dim: u32,
        global_out_dim: u32,
        out_start: u32,
        out_len: u32,
    ) -> Self {
        ColMatmulSlice {
            float_type,
            out_start,
            out_len,
            n: global_in_dim,
            n0: out_len,
            d: global_out_dim,
            size: TensorSize::d2(float_type, global_in_dim, global_out_dim),
            slice_size: TensorSize::d2(float_type, out_len, global_out_dim),
        }
    }

    /// The byte region of this shard: for each of the `d` output rows,
    /// one `out_len`-wide subrange of the `n`-wide source row.
    pub fn shard(&self) -> ShardDescriptor {
        let block = self.float_type.block_size() as u32;
        assert_eq!(self.n % block, 0, "matmul height not block-aligned");
        assert_eq!(self.out_start % block, 0, "shard start not block-aligned");
        assert_eq!(self.out_len % block, 0, "shard length not block-aligned");
        // Treat each output row as a "shard row"; the start offset into
        // the row is folded into start_row-relative arithmetic by the
        // caller via `col_offset`.
        ShardDescriptor {
            row_bytes: self.float_type.bytes_for(self.out_len as usize),
            row_stride: self.float_type.bytes_for(self.n as usize),
            start_row: 0,
            n_rows: self.d as usize,
        }
    }

    /// Byte offset of the owned columns inside each source row.
    pub fn col_offset(&self) -> usize {
        self.float_type.bytes_for(self.out_start as usize)
    }

    /// Copies the strided shard into a dense buffer.
    pub fn copy_into(&self, src: &[u8], dst: &mut [u8]) {
        let shard = self.shard();
        let col = self.col_offset();
        assert_eq!(dst.len(), shard.packed_len());
        for row in 0..shard.n_rows {
            let src_start = row * shard.row_stride + col;
            let dst_start = row * shard.row_bytes;
            dst[dst_start..dst_start + shard.row_bytes]
                .copy_from_slice(&src[src_start..src_start + shard.row_bytes]);
        }
    }
}

/// A node's KV-cache slab dimensions for one layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KvCacheSlice {
    /// First owned KV dimension (global).
    pub kv_start: u32,
    /// Owned KV dimensions.
    pub kv_len: u32,
    pub key_size: TensorSize,
    pub value_size: TensorSize,
}

impl KvCacheSlice {
    pub fn new(seq_len: u32, head_dim: u32, plan: &PartitionPlan, node_index: u32) -> Self {
        let kv_start = plan.kv_head_split.starts[node_index as usize] * head_dim;
        let kv_len = plan.kv_head_split.lengths[node_index as usize] * head_dim;
        KvCacheSlice {
            kv_start,
            kv_len,
            key_size: TensorSize::d2(FloatType::F32, seq_len, kv_len),
            value_size: TensorSize::d2(FloatType::F32, seq_len, kv_len),
        }
    }
}

/// RoPE rotation geometry for one node: the contiguous dimension range
/// `[kv_dim_start, q_dim_start + q_dim_len)` the node rotates, and the
/// cache sized to it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RopeSlice {
    pub q_dim_start: u32,
    pub q_dim_len: u32,
    /// Offset of the Q range relative to the cache origin.
    pub q_shift: u32,
    pub kv_dim: u32,
    pub kv_dim_start: u32,
    pub kv_dim_len: u32,
    /// Width of the cached rotation table row.
    pub slice_dim: u32,
    pub seq_len: u32,
    pub head_dim: u32,
    pub n_kv_heads: u32,
    pub rope_theta: f32,
    pub cache_size: TensorSize,
}

impl RopeSlice {
    pub fn new(
        kind: RopeType,
        seq_len: u32,
        global_kv_dim: u32,
        global_n_kv_heads: u32,
        head_dim: u32,
        rope_theta: f32,
        plan: &PartitionPlan,
        node_index: u32,
    ) -> Self {
        let i = node_index as usize;
        let q_dim_start = plan.head_split.starts[i] * head_dim;
        let q_dim_len = plan.head_split.lengths[i] * head_dim;
        let kv_dim_start = plan.kv_head_split.starts[i] * head_dim;
        let kv_dim_len = plan.kv_head_split.lengths[i] * head_dim;

        let (slice_dim, cache_size) = match kind {
            RopeType::Llama | RopeType::Llama31 => {
                let q_dim_end = q_dim_start + q_dim_len;
                let slice_dim = q_dim_end - kv_dim_start;
                assert_eq!(slice_dim % 2, 0, "rope slice dimension must be even");
                (slice_dim, TensorSize::d2(FloatType::F32, seq_len, slice_dim))
            }
            RopeType::Falcon => (head_dim, TensorSize::d2(FloatType::F32, seq_len, head_dim)),
        };

        RopeSlice {
            q_dim_start,
            q_dim_len,
            q_shift: q_dim_start - kv_dim_start,
            kv_dim: global_kv_dim,
            kv_dim_start,
            kv_dim_len,
            slice_dim,
            seq_len,
            head_dim,
            n_kv_heads: global_n_kv_heads,
            rope_theta,
            cache_size,
        }
    }
}

/// A node's attention-head assignment and score scratch size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MultiheadAttSlice {
    pub head_start: u32,
    pub head_len: u32,
    /// Global head count.
    pub n_heads: u32,
    pub att_size: TensorSize,
}

impl MultiheadAttSlice {
    pub fn new(
        n_batches: u32,
        global_n_heads: u32,
        seq_len: u32,
        plan: &PartitionPlan,
        node_index: u32,
    ) -> Self {
        let head_start = plan.head_split.starts[node_index as usize];
        let head_len = plan.head_split.lengths[node_index as usize];
        MultiheadAttSlice {
            head_start,
            head_len,
            n_heads: global_n_heads,
            att_size: TensorSize::d2(FloatType::F32, n_batches, head_len * seq_len),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{ModelDims, PartitionPlan};

    fn plan2() -> PartitionPlan {
        PartitionPlan::uniform(
            2,
            ModelDims {
                n_layers: 2,
                n_heads: 4,
                n_kv_heads: 2,
                vocab_size: 64,
                ffn_dim: 64,
                dim: 32,
            },
        )
        .unwrap()
    }

    #[test]
    fn test_row_shard_is_contiguous() {
        let plan = plan2();
        let s = RowMatmulSlice::for_ffn(FloatType::F32, 32, 64, &plan, 1);
        let shard = s.shard();
        assert!(shard.contiguous());
        assert_eq!(shard.start_row, 32);
        assert_eq!(shard.n_rows, 32);
        assert_eq!(shard.packed_len(), s.slice_size.n_bytes);
    }

    #[test]
    fn test_row_shard_single_copy_matches_strided_reference() {
        let plan = plan2();
        let s = RowMatmulSlice::for_ffn(FloatType::F32, 32, 64, &plan, 0);
        let src: Vec<u8> = (0..s.size.n_bytes).map(|i| (i % 251) as u8).collect();

        let mut fast = vec![0u8; s.slice_size.n_bytes];
        s.shard().copy_into(&src, &mut fast);

        // Reference: copy row by row.
        let row_bytes = s.shard().row_bytes;
        let mut slow = vec![0u8; s.slice_size.n_bytes];
        for row in 0..s.in_len as usize {
            let src_start = (s.in_start as usize + row) * row_bytes;
            slow[row * row_bytes..(row + 1) * row_bytes]
                .copy_from_slice(&src[src_start..src_start + row_bytes]);
        }
        assert_eq!(fast, slow);
    }

    #[test]
    fn test_col_shard_strided_copy() {
        let plan = plan2();
        let s = ColMatmulSlice::for_ffn(FloatType::F32, 64, 32, &plan, 1);
        assert_eq!(s.out_start, 32);
        assert_eq!(s.n0, 32);

        let src: Vec<u8> = (0..s.size.n_bytes).map(|i| (i % 249) as u8).collect();
        let mut dst = vec![0u8; s.slice_size.n_bytes];
        s.copy_into(&src, &mut dst);

        // Row 1 of the shard must equal columns [32..64) of source row 1.
        let full_row = s.float_type.bytes_for(64);
        let shard_row = s.float_type.bytes_for(32);
        assert_eq!(
            &dst[shard_row..2 * shard_row],
            &src[full_row + s.col_offset()..full_row + s.col_offset() + shard_row]
        );
    }

    #[test]
    fn test_rope_slice_geometry() {
        let plan = plan2();
        // head_dim = 8, node 1 owns heads [2,4) and kv heads [1,2).
        let rope = RopeSlice::new(RopeType::Llama, 16, 16, 2, 8, 10000.0, &plan, 1);
        assert_eq!(rope.q_dim_start, 16);
        assert_eq!(rope.q_dim_len, 16);
        assert_eq!(rope.kv_dim_start, 8);
        assert_eq!(rope.q_shift, 8);
        assert_eq!(rope.slice_dim, 24);
    }

    #[test]
    fn test_shards_cover_tensor() {
        let plan = plan2();
        let mut covered = 0usize;
        for node in 0..2 {
            let s = RowMatmulSlice::for_logits(FloatType::F32, 32, 64, &plan, node);
            covered += s.shard().packed_len();
        }
        assert_eq!(
            covered,
            RowMatmulSlice::for_logits(FloatType::F32, 32, 64, &plan, 0)
                .size
                .n_bytes
        );
    }
}
