//! Per-node dataflow graph construction for the transformer.
//!
//! Every layer becomes two segments: the attention segment ending in a
//! `NODE_SLICES` exchange of the attention output partials over the ZQ
//! pipe, and the FFN segment ending the same way. Stage boundaries add
//! PP send/recv segments; the last stage finishes with the logits
//! gather toward node 0.

use latticelm_core::graph::{
    NetConfig, NetConfigBuilder, NodeConfig, NodeConfigBuilder, OpCode, OpParams, PointerConfig,
    PointerSource, SegmentBuilder, SyncKind,
};
use latticelm_core::plan::PartitionPlan;
use latticelm_core::size::TensorSize;
use latticelm_core::slice::{ColMatmulSlice, KvCacheSlice, MultiheadAttSlice, RopeSlice, RowMatmulSlice};
use latticelm_core::FloatType;

use crate::error::Result;
use crate::header::{ArchType, HiddenAct, ModelHeader};

/// The built graph: one global net config plus one node config per
/// cluster member, and the pipe indices the driver needs at runtime.
pub struct LlmNet {
    pub net_config: NetConfig,
    pub node_configs: Vec<NodeConfig>,
    pub position_pipe: u32,
    pub token_pipe: u32,
    pub x_pipe: u32,
    pub logits_pipe: u32,
    pub zq_pipe: u32,
    pub token_embedding_size: TensorSize,
    pub rms_norm_size: TensorSize,
    pub qk_rms_norm_size: TensorSize,
    pub moe_gate_size: TensorSize,
}

struct PipeSet {
    position: u32,
    token: u32,
    x: u32,
    logits: u32,
    zq: u32,
}

pub fn build_llm_net(h: &ModelHeader, plan: &PartitionPlan, n_batches: u32) -> Result<LlmNet> {
    let n_nodes = plan.n_nodes;

    let mut net = NetConfigBuilder::new(n_nodes, n_batches);
    let pipes = PipeSet {
        position: net.add_pipe("POS", TensorSize::d2(FloatType::F32, n_batches, 1)),
        token: net.add_pipe("TOK", TensorSize::d2(FloatType::F32, n_batches, 1)),
        x: net.add_pipe("X", TensorSize::d2(FloatType::F32, n_batches, h.dim)),
        logits: net.add_pipe("LG", TensorSize::d2(FloatType::F32, n_batches, h.vocab_size)),
        // Provisioned so that every node's full-width partial lands at
        // a disjoint slot regardless of the stage layout.
        zq: net.add_pipe(
            "ZQ",
            TensorSize::d2(h.sync_type, n_batches, h.dim * n_nodes),
        ),
    };
    net.add_pre_sync(pipes.position);
    let net_config = net.build();

    let mut node_configs = Vec::with_capacity(n_nodes as usize);
    for node_index in 0..n_nodes {
        node_configs.push(build_node(h, plan, n_batches, node_index, &pipes)?);
    }

    Ok(LlmNet {
        net_config,
        node_configs,
        position_pipe: pipes.position,
        token_pipe: pipes.token,
        x_pipe: pipes.x,
        logits_pipe: pipes.logits,
        zq_pipe: pipes.zq,
        token_embedding_size: TensorSize::d2(FloatType::F32, h.vocab_size, h.dim),
        rms_norm_size: TensorSize::d1(FloatType::F32, h.dim),
        qk_rms_norm_size: TensorSize::d1(FloatType::F32, h.head_dim),
        moe_gate_size: TensorSize::d2(FloatType::F32, h.dim, h.n_experts.max(1)),
    })
}

fn build_node(
    h: &ModelHeader,
    plan: &PartitionPlan,
    n_batches: u32,
    node_index: u32,
    pipes: &PipeSet,
) -> Result<NodeConfig> {
    let stage = plan
        .stage_for_node(node_index)
        .expect("every node belongs to a stage");
    let is_first_stage = stage.stage_index == 0;
    let is_last_stage = stage.stage_index as usize == plan.stages.len() - 1;
    let (start_layer, end_layer) = (stage.start_layer, stage.end_layer);

    let n_experts_or1 = h.n_experts.max(1);
    let n_active_or1 = h.n_active_experts.max(1);
    let ffn_dim = h.ffn_dim();
    let wt = h.weight_type;
    let sync = h.sync_type;

    let kv_cache = KvCacheSlice::new(h.seq_len, h.head_dim, plan, node_index);
    let att_slice = MultiheadAttSlice::new(n_batches, h.n_heads, h.seq_len, plan, node_index);
    let q_slice = RowMatmulSlice::for_heads(wt, h.dim, h.head_dim, &plan.head_split, h.q_dim, node_index);
    let k_slice =
        RowMatmulSlice::for_heads(wt, h.dim, h.head_dim, &plan.kv_head_split, h.kv_dim, node_index);
    let v_slice =
        RowMatmulSlice::for_heads(wt, h.dim, h.head_dim, &plan.kv_head_split, h.kv_dim, node_index);
    let wo_slice = ColMatmulSlice::for_heads(wt, h.q_dim, h.dim, h.head_dim, plan, node_index);
    let w1_slice = RowMatmulSlice::for_ffn(wt, h.dim, ffn_dim, plan, node_index);
    let w2_slice = ColMatmulSlice::for_ffn(wt, ffn_dim, h.dim, plan, node_index);
    let w3_slice = RowMatmulSlice::for_ffn(wt, h.dim, ffn_dim, plan, node_index);
    let wcls_slice = RowMatmulSlice::for_logits(wt, h.dim, h.vocab_size, plan, node_index);
    let rope_slice = RopeSlice::new(
        h.rope_type,
        h.seq_len,
        h.kv_dim,
        h.n_kv_heads,
        h.head_dim,
        h.rope_theta,
        plan,
        node_index,
    );

    let (n_q_norm_cols, n_k_norm_cols) = if h.arch.is_qwen() {
        (q_slice.in_len / h.head_dim, k_slice.in_len / h.head_dim)
    } else {
        (1, 1)
    };
    let n_inv_cols = n_q_norm_cols.max(n_k_norm_cols);

    let mut node = NodeConfigBuilder::new(node_index);

    let x_buf = node.add_buffer("x", TensorSize::d2(FloatType::F32, n_batches, h.dim));
    let y_buf = node.add_buffer("y", TensorSize::d2(FloatType::F32, n_batches, h.dim));
    let yq_buf = if sync == FloatType::F32 {
        y_buf
    } else {
        node.add_buffer("q_y", TensorSize::d2(sync, n_batches, h.dim))
    };

    let mha_out_buf = node.add_buffer(
        "mha_out",
        TensorSize::d2(FloatType::F32, n_batches, q_slice.in_len),
    );
    let mha_out_q_buf = if sync == FloatType::F32 {
        mha_out_buf
    } else {
        node.add_buffer("q_mha_out", TensorSize::d2(sync, n_batches, q_slice.in_len))
    };

    let q_buf = node.add_buffer("q", TensorSize::d2(FloatType::F32, n_batches, q_slice.in_len));
    let k_temp_buf = node.add_buffer(
        "k_temp",
        TensorSize::d2(FloatType::F32, n_batches, k_slice.in_len),
    );
    let v_temp_buf = node.add_buffer(
        "v_temp",
        TensorSize::d2(FloatType::F32, n_batches, v_slice.in_len),
    );
    let inv_rms_buf = node.add_buffer(
        "inv_rms",
        TensorSize::d2(FloatType::F32, n_batches, n_inv_cols),
    );
    let rope_cache_buf = node.add_buffer("rope_cache", rope_slice.cache_size);
    let att_buf = node.add_buffer("att", att_slice.att_size);
    let logits_buf = node.add_buffer(
        "lg",
        TensorSize::d2(FloatType::F32, n_batches, wcls_slice.in_len),
    );

    let d_buf = node.add_buffer("d", TensorSize::d2(FloatType::F32, n_batches, w1_slice.in_len));
    let dq_buf = if sync == FloatType::F32 {
        d_buf
    } else {
        node.add_buffer("q_d", TensorSize::d2(sync, n_batches, w1_slice.in_len))
    };
    let l_buf = node.add_buffer("l", TensorSize::d2(FloatType::F32, n_batches, w3_slice.in_len));

    let is_moe = h.arch == ArchType::Qwen3Moe;
    let gt_buf = node.add_buffer("gt", TensorSize::d2(FloatType::F32, n_batches, n_experts_or1));
    let expert_ix_buf = node.add_buffer(
        "act_exp_ix",
        TensorSize::d2(FloatType::F32, n_batches, n_active_or1),
    );
    let moe_y_buf = node.add_buffer(
        "moe_y",
        TensorSize::d3(FloatType::F32, n_active_or1, n_batches, h.dim),
    );
    let moe_yq_buf = if sync == FloatType::F32 {
        moe_y_buf
    } else {
        node.add_buffer("q_moe_y", TensorSize::d3(sync, n_active_or1, n_batches, h.dim))
    };
    let moe_d_buf = node.add_buffer(
        "moe_d",
        TensorSize::d3(FloatType::F32, n_active_or1, n_batches, w1_slice.in_len),
    );
    let moe_dq_buf = if sync == FloatType::F32 {
        moe_d_buf
    } else {
        node.add_buffer(
            "q_moe_d",
            TensorSize::d3(sync, n_active_or1, n_batches, w1_slice.in_len),
        )
    };
    let moe_l_buf = node.add_buffer(
        "moe_l",
        TensorSize::d3(FloatType::F32, n_active_or1, n_batches, w3_slice.in_len),
    );
    let moe_s_buf = node.add_buffer(
        "moe_s",
        TensorSize::d3(FloatType::F32, n_active_or1, n_batches, 1),
    );

    let matmul_params = OpParams::Matmul {
        n_experts: 0,
        n_active_experts: 0,
        expert_index_buffer: expert_ix_buf,
    };
    let act_code = match h.hidden_act {
        HiddenAct::Silu => OpCode::Silu,
        HiddenAct::Gelu => OpCode::Gelu,
    };

    // Start segment: the global root embeds tokens and broadcasts the
    // hidden state to its stage.
    let mut start = SegmentBuilder::new();
    if is_first_stage && node_index == 0 {
        start.add_op(
            OpCode::Embed,
            "embedding",
            0,
            PointerConfig::batch(PointerSource::Pipe, pipes.token),
            PointerConfig::batch(PointerSource::Pipe, pipes.x),
            TensorSize::d2(FloatType::F32, h.vocab_size, h.dim),
            OpParams::None,
        );
    }
    if is_first_stage {
        start.add_sync(pipes.x, SyncKind::WithRoot);
    }
    if !start.is_empty() {
        node.add_segment(start.build());
    }

    // Stage entry: the stage root receives the hidden state from the
    // prior stage and fans it out within the TP group.
    if !is_first_stage {
        let mut pp_recv = SegmentBuilder::new();
        pp_recv.add_sync(pipes.x, SyncKind::PpRecv);
        pp_recv.add_sync(pipes.x, SyncKind::WithRoot);
        node.add_segment(pp_recv.build());
    }

    let mut kv_buffers = Vec::new();
    for _ in start_layer..end_layer {
        let k_buf = node.add_buffer("k", kv_cache.key_size);
        let v_buf = node.add_buffer("v", kv_cache.value_size);
        kv_buffers.push((k_buf, v_buf));
    }

    for layer in start_layer..end_layer {
        let (k_buf, v_buf) = kv_buffers[(layer - start_layer) as usize];
        let mut att = SegmentBuilder::new();

        if layer == 0 {
            att.add_op(
                OpCode::Cast,
                "block_cast_x",
                layer,
                PointerConfig::batch(PointerSource::Pipe, pipes.x),
                PointerConfig::batch(PointerSource::Buffer, x_buf),
                TensorSize::zero(),
                OpParams::None,
            );
        } else if layer == start_layer && !is_first_stage {
            att.add_op(
                OpCode::Cast,
                "block_cast_x_pp",
                layer,
                PointerConfig::batch(PointerSource::Pipe, pipes.x),
                PointerConfig::batch(PointerSource::Buffer, x_buf),
                TensorSize::zero(),
                OpParams::None,
            );
        } else {
            att.add_op(
                OpCode::MergeAdd,
                "block_merge_add",
                layer,
                PointerConfig::batch(PointerSource::Pipe, pipes.zq),
                PointerConfig::batch(PointerSource::Buffer, x_buf),
                TensorSize::zero(),
                OpParams::None,
            );
        }

        att.add_op(
            OpCode::InvRms,
            "block_norm_pre_0",
            layer,
            PointerConfig::batch(PointerSource::Buffer, x_buf),
            PointerConfig::batch(PointerSource::Buffer, inv_rms_buf),
            TensorSize::zero(),
            OpParams::InvRms {
                epsilon: h.norm_epsilon,
                n_columns: 1,
            },
        );
        att.add_op(
            OpCode::RmsNorm,
            "block_norm_0",
            layer,
            PointerConfig::batch(PointerSource::Buffer, x_buf),
            PointerConfig::batch(PointerSource::Buffer, y_buf),
            TensorSize::d1(FloatType::F32, h.dim),
            OpParams::RmsNorm {
                inv_rms_buffer: inv_rms_buf,
                n_columns: 1,
            },
        );
        if y_buf != yq_buf {
            att.add_op(
                OpCode::Cast,
                "block_cast_y",
                layer,
                PointerConfig::batch(PointerSource::Buffer, y_buf),
                PointerConfig::batch(PointerSource::Buffer, yq_buf),
                TensorSize::zero(),
                OpParams::None,
            );
        }

        att.add_op(
            OpCode::Matmul,
            "block_matmul_q",
            layer,
            PointerConfig::batch(PointerSource::Buffer, yq_buf),
            PointerConfig::batch(PointerSource::Buffer, q_buf),
            q_slice.slice_size,
            matmul_params.clone(),
        );
        att.add_op(
            OpCode::Matmul,
            "block_matmul_k",
            layer,
            PointerConfig::batch(PointerSource::Buffer, yq_buf),
            PointerConfig::batch(PointerSource::Buffer, k_temp_buf),
            k_slice.slice_size,
            matmul_params.clone(),
        );
        att.add_op(
            OpCode::Matmul,
            "block_matmul_v",
            layer,
            PointerConfig::batch(PointerSource::Buffer, yq_buf),
            PointerConfig::batch(PointerSource::Buffer, v_temp_buf),
            v_slice.slice_size,
            matmul_params.clone(),
        );

        if h.arch.is_qwen() {
            att.add_op(
                OpCode::InvRms,
                "block_norm_pre_q",
                layer,
                PointerConfig::batch(PointerSource::Buffer, q_buf),
                PointerConfig::batch(PointerSource::Buffer, inv_rms_buf),
                TensorSize::zero(),
                OpParams::InvRms {
                    epsilon: h.norm_epsilon,
                    n_columns: n_q_norm_cols,
                },
            );
            att.add_op(
                OpCode::RmsNorm,
                "block_norm_q",
                layer,
                PointerConfig::batch(PointerSource::Buffer, q_buf),
                PointerConfig::batch(PointerSource::Buffer, q_buf),
                TensorSize::d2(FloatType::F32, 1, h.head_dim),
                OpParams::RmsNorm {
                    inv_rms_buffer: inv_rms_buf,
                    n_columns: n_q_norm_cols,
                },
            );
            att.add_op(
                OpCode::InvRms,
                "block_norm_pre_k",
                layer,
                PointerConfig::batch(PointerSource::Buffer, k_temp_buf),
                PointerConfig::batch(PointerSource::Buffer, inv_rms_buf),
                TensorSize::zero(),
                OpParams::InvRms {
                    epsilon: h.norm_epsilon,
                    n_columns: n_k_norm_cols,
                },
            );
            att.add_op(
                OpCode::RmsNorm,
                "block_norm_k",
                layer,
                PointerConfig::batch(PointerSource::Buffer, k_temp_buf),
                PointerConfig::batch(PointerSource::Buffer, k_temp_buf),
                TensorSize::d2(FloatType::F32, 1, h.head_dim),
                OpParams::RmsNorm {
                    inv_rms_buffer: inv_rms_buf,
                    n_columns: n_k_norm_cols,
                },
            );
        }

        let rope_params = |is_q: bool| OpParams::Rope {
            kind: h.rope_type,
            is_q,
            position_pipe: pipes.position,
            cache_buffer: rope_cache_buf,
            scaling: h.rope_scaling,
            slice: rope_slice,
        };
        att.add_op(
            OpCode::Rope,
            "block_rope_q",
            layer,
            PointerConfig::batch(PointerSource::Buffer, q_buf),
            PointerConfig::batch(PointerSource::Buffer, q_buf),
            TensorSize::zero(),
            rope_params(true),
        );
        att.add_op(
            OpCode::Rope,
            "block_rope_k",
            layer,
            PointerConfig::batch(PointerSource::Buffer, k_temp_buf),
            PointerConfig::batch(PointerSource::Buffer, k_temp_buf),
            TensorSize::zero(),
            rope_params(false),
        );
        att.add_op(
            OpCode::Shift,
            "block_shift_k",
            layer,
            PointerConfig::batch(PointerSource::Buffer, k_temp_buf),
            PointerConfig::raw(PointerSource::Buffer, k_buf),
            TensorSize::zero(),
            OpParams::Shift {
                position_pipe: pipes.position,
            },
        );
        att.add_op(
            OpCode::Shift,
            "block_shift_v",
            layer,
            PointerConfig::batch(PointerSource::Buffer, v_temp_buf),
            PointerConfig::raw(PointerSource::Buffer, v_buf),
            TensorSize::zero(),
            OpParams::Shift {
                position_pipe: pipes.position,
            },
        );
        att.add_op(
            OpCode::MultiheadAtt,
            "block_multihead_att",
            layer,
            PointerConfig::batch(PointerSource::Buffer, mha_out_buf),
            PointerConfig::batch(PointerSource::Buffer, mha_out_buf),
            TensorSize::zero(),
            OpParams::MultiheadAtt {
                n_heads: h.n_heads,
                n_heads0: att_slice.head_len,
                n_kv_heads: h.n_kv_heads,
                head_dim: h.head_dim,
                seq_len: h.seq_len,
                q_len: q_slice.in_len,
                kv_len: kv_cache.kv_len,
                position_pipe: pipes.position,
                query_buffer: q_buf,
                key_cache_buffer: k_buf,
                value_cache_buffer: v_buf,
                att_buffer: att_buf,
            },
        );
        if mha_out_buf != mha_out_q_buf {
            att.add_op(
                OpCode::Cast,
                "block_cast_y2",
                layer,
                PointerConfig::batch(PointerSource::Buffer, mha_out_buf),
                PointerConfig::batch(PointerSource::Buffer, mha_out_q_buf),
                TensorSize::zero(),
                OpParams::None,
            );
        }
        att.add_op(
            OpCode::Matmul,
            "block_matmul_wo",
            layer,
            PointerConfig::batch(PointerSource::Buffer, mha_out_q_buf),
            PointerConfig::batch(PointerSource::Buffer, y_buf),
            wo_slice.slice_size,
            matmul_params.clone(),
        );
        att.add_op(
            OpCode::Cast,
            "block_cast_d",
            layer,
            PointerConfig::batch(PointerSource::Buffer, y_buf),
            PointerConfig::batched_slice(PointerSource::Pipe, pipes.zq),
            TensorSize::zero(),
            OpParams::None,
        );
        att.add_sync(pipes.zq, SyncKind::NodeSlices);
        node.add_segment(att.build());

        // FFN segment.
        let mut ff = SegmentBuilder::new();
        ff.add_op(
            OpCode::MergeAdd,
            "block_merge_add2",
            layer,
            PointerConfig::batch(PointerSource::Pipe, pipes.zq),
            PointerConfig::batch(PointerSource::Buffer, x_buf),
            TensorSize::zero(),
            OpParams::None,
        );
        ff.add_op(
            OpCode::InvRms,
            "block_norm_pre_1",
            layer,
            PointerConfig::batch(PointerSource::Buffer, x_buf),
            PointerConfig::batch(PointerSource::Buffer, inv_rms_buf),
            TensorSize::zero(),
            OpParams::InvRms {
                epsilon: h.norm_epsilon,
                n_columns: 1,
            },
        );
        ff.add_op(
            OpCode::RmsNorm,
            "block_norm_1",
            layer,
            PointerConfig::batch(PointerSource::Buffer, x_buf),
            PointerConfig::batch(PointerSource::Buffer, y_buf),
            TensorSize::d1(FloatType::F32, h.dim),
            OpParams::RmsNorm {
                inv_rms_buffer: inv_rms_buf,
                n_columns: 1,
            },
        );

        if is_moe {
            ff.add_op(
                OpCode::RepeatZ,
                "block_moe_y_repeat",
                layer,
                PointerConfig::batch(PointerSource::Buffer, y_buf),
                PointerConfig::batch(PointerSource::Buffer, moe_yq_buf),
                TensorSize::zero(),
                OpParams::None,
            );
            ff.add_op(
                OpCode::Matmul,
                "block_moe_gate",
                layer,
                PointerConfig::batch(PointerSource::Buffer, y_buf),
                PointerConfig::batch(PointerSource::Buffer, gt_buf),
                TensorSize::d2(FloatType::F32, h.dim, h.n_experts),
                matmul_params.clone(),
            );
            ff.add_op(
                OpCode::Softmax,
                "block_moe_softmax",
                layer,
                PointerConfig::batch(PointerSource::Buffer, gt_buf),
                PointerConfig::batch(PointerSource::Buffer, gt_buf),
                TensorSize::zero(),
                OpParams::None,
            );
            ff.add_op(
                OpCode::MoeGate,
                "block_moe_gate2",
                layer,
                PointerConfig::batch(PointerSource::Buffer, gt_buf),
                PointerConfig::batch(PointerSource::Buffer, moe_s_buf),
                TensorSize::zero(),
                OpParams::MoeGate {
                    k: h.n_active_experts,
                    norm_topk: true,
                    index_buffer: expert_ix_buf,
                },
            );
            let expert_params = OpParams::Matmul {
                n_experts: h.n_experts,
                n_active_experts: h.n_active_experts,
                expert_index_buffer: expert_ix_buf,
            };
            ff.add_op(
                OpCode::Matmul,
                "block_matmul_w1",
                layer,
                PointerConfig::batch(PointerSource::Buffer, moe_yq_buf),
                PointerConfig::batch(PointerSource::Buffer, moe_d_buf),
                TensorSize::d3(wt, h.n_experts, w1_slice.n, w1_slice.in_len),
                expert_params.clone(),
            );
            ff.add_op(
                OpCode::Matmul,
                "block_matmul_w3",
                layer,
                PointerConfig::batch(PointerSource::Buffer, moe_yq_buf),
                PointerConfig::batch(PointerSource::Buffer, moe_l_buf),
                TensorSize::d3(wt, h.n_experts, w3_slice.n, w3_slice.in_len),
                expert_params.clone(),
            );
            ff.add_op(
                OpCode::Silu,
                "block_act",
                layer,
                PointerConfig::batch(PointerSource::Buffer, moe_d_buf),
                PointerConfig::batch(PointerSource::Buffer, moe_d_buf),
                TensorSize::zero(),
                OpParams::None,
            );
            ff.add_op(
                OpCode::Mul,
                "block_mul",
                layer,
                PointerConfig::batch(PointerSource::Buffer, moe_d_buf),
                PointerConfig::batch(PointerSource::Buffer, moe_d_buf),
                TensorSize::zero(),
                OpParams::Mul {
                    multiplier_buffer: moe_l_buf,
                },
            );
            if moe_d_buf != moe_dq_buf {
                ff.add_op(
                    OpCode::Cast,
                    "block_cast_d2",
                    layer,
                    PointerConfig::batch(PointerSource::Buffer, moe_d_buf),
                    PointerConfig::batch(PointerSource::Buffer, moe_dq_buf),
                    TensorSize::zero(),
                    OpParams::None,
                );
            }
            ff.add_op(
                OpCode::Matmul,
                "block_matmul_w2",
                layer,
                PointerConfig::batch(PointerSource::Buffer, moe_dq_buf),
                PointerConfig::batch(PointerSource::Buffer, moe_y_buf),
                TensorSize::d3(wt, h.n_experts, w2_slice.n0, w2_slice.d),
                expert_params,
            );
            ff.add_op(
                OpCode::Scale,
                "block_moe_scale",
                layer,
                PointerConfig::batch(PointerSource::Buffer, moe_y_buf),
                PointerConfig::batch(PointerSource::Buffer, moe_y_buf),
                TensorSize::zero(),
                OpParams::Scale {
                    scale_buffer: moe_s_buf,
                },
            );
            ff.add_op(
                OpCode::MergeSum,
                "block_moe_merge_sum",
                layer,
                PointerConfig::batch(PointerSource::Buffer, moe_y_buf),
                PointerConfig::batch(PointerSource::Buffer, y_buf),
                TensorSize::zero(),
                OpParams::None,
            );
        } else {
            if y_buf != yq_buf {
                ff.add_op(
                    OpCode::Cast,
                    "block_cast_y3",
                    layer,
                    PointerConfig::batch(PointerSource::Buffer, y_buf),
                    PointerConfig::batch(PointerSource::Buffer, yq_buf),
                    TensorSize::zero(),
                    OpParams::None,
                );
            }
            ff.add_op(
                OpCode::Matmul,
                "block_matmul_w1",
                layer,
                PointerConfig::batch(PointerSource::Buffer, yq_buf),
                PointerConfig::batch(PointerSource::Buffer, d_buf),
                w1_slice.slice_size,
                matmul_params.clone(),
            );
            ff.add_op(
                OpCode::Matmul,
                "block_matmul_w3",
                layer,
                PointerConfig::batch(PointerSource::Buffer, yq_buf),
                PointerConfig::batch(PointerSource::Buffer, l_buf),
                w3_slice.slice_size,
                matmul_params.clone(),
            );
            ff.add_op(
                act_code,
                "block_act",
                layer,
                PointerConfig::batch(PointerSource::Buffer, d_buf),
                PointerConfig::batch(PointerSource::Buffer, d_buf),
                TensorSize::zero(),
                OpParams::None,
            );
            ff.add_op(
                OpCode::Mul,
                "block_mul",
                layer,
                PointerConfig::batch(PointerSource::Buffer, d_buf),
                PointerConfig::batch(PointerSource::Buffer, d_buf),
                TensorSize::zero(),
                OpParams::Mul {
                    multiplier_buffer: l_buf,
                },
            );
            if d_buf != dq_buf {
                ff.add_op(
                    OpCode::Cast,
                    "block_cast_d2",
                    layer,
                    PointerConfig::batch(PointerSource::Buffer, d_buf),
                    PointerConfig::batch(PointerSource::Buffer, dq_buf),
                    TensorSize::zero(),
                    OpParams::None,
                );
            }
            ff.add_op(
                OpCode::Matmul,
                "block_matmul_w2",
                layer,
                PointerConfig::batch(PointerSource::Buffer, dq_buf),
                PointerConfig::batch(PointerSource::Buffer, y_buf),
                w2_slice.slice_size,
                matmul_params.clone(),
            );
        }

        ff.add_op(
            OpCode::Cast,
            "block_cast_d3",
            layer,
            PointerConfig::batch(PointerSource::Buffer, y_buf),
            PointerConfig::batched_slice(PointerSource::Pipe, pipes.zq),
            TensorSize::zero(),
            OpParams::None,
        );
        ff.add_sync(pipes.zq, SyncKind::NodeSlices);
        node.add_segment(ff.build());
    }

    // Stage exit: merge the last layer's partials into a complete
    // hidden state and hand it to the next stage's root.
    if !is_last_stage {
        let mut pp_send = SegmentBuilder::new();
        pp_send.add_op(
            OpCode::MergeAdd,
            "pp_stage_merge",
            end_layer - 1,
            PointerConfig::batch(PointerSource::Pipe, pipes.zq),
            PointerConfig::batch(PointerSource::Buffer, x_buf),
            TensorSize::zero(),
            OpParams::None,
        );
        pp_send.add_op(
            OpCode::Cast,
            "pp_cast_out",
            end_layer - 1,
            PointerConfig::batch(PointerSource::Buffer, x_buf),
            PointerConfig::batch(PointerSource::Pipe, pipes.x),
            TensorSize::zero(),
            OpParams::None,
        );
        pp_send.add_sync(pipes.x, SyncKind::PpSend);
        node.add_segment(pp_send.build());
    }

    if is_last_stage {
        let mut end = SegmentBuilder::new();
        end.add_op(
            OpCode::MergeAdd,
            "final_merge_add",
            0,
            PointerConfig::batch(PointerSource::Pipe, pipes.zq),
            PointerConfig::batch(PointerSource::Buffer, x_buf),
            TensorSize::zero(),
            OpParams::None,
        );
        end.add_op(
            OpCode::InvRms,
            "final_norm_pre",
            0,
            PointerConfig::batch(PointerSource::Buffer, x_buf),
            PointerConfig::batch(PointerSource::Buffer, inv_rms_buf),
            TensorSize::zero(),
            OpParams::InvRms {
                epsilon: h.norm_epsilon,
                n_columns: 1,
            },
        );
        end.add_op(
            OpCode::RmsNorm,
            "final_norm",
            0,
            PointerConfig::batch(PointerSource::Buffer, x_buf),
            PointerConfig::batch(PointerSource::Buffer, y_buf),
            TensorSize::d1(FloatType::F32, h.dim),
            OpParams::RmsNorm {
                inv_rms_buffer: inv_rms_buf,
                n_columns: 1,
            },
        );
        if y_buf != yq_buf {
            end.add_op(
                OpCode::Cast,
                "final_cast_y",
                0,
                PointerConfig::batch(PointerSource::Buffer, y_buf),
                PointerConfig::batch(PointerSource::Buffer, yq_buf),
                TensorSize::zero(),
                OpParams::None,
            );
        }
        end.add_op(
            OpCode::Matmul,
            "final_matmul_logits",
            0,
            PointerConfig::batch(PointerSource::Buffer, yq_buf),
            PointerConfig::batch(PointerSource::Buffer, logits_buf),
            wcls_slice.slice_size,
            matmul_params,
        );
        end.add_op(
            OpCode::Cast,
            "final_cast_logits",
            0,
            PointerConfig::batch(PointerSource::Buffer, logits_buf),
            PointerConfig::batched_slice(PointerSource::Pipe, pipes.logits),
            TensorSize::zero(),
            OpParams::None,
        );
        end.add_sync(pipes.logits, SyncKind::NodeSlicesExceptRoot);
        node.add_segment(end.build());
    } else if node_index == 0 {
        // The driver lives on node 0; when it is not in the last stage
        // it still waits for the logits gather.
        let mut wait = SegmentBuilder::new();
        wait.add_sync(pipes.logits, SyncKind::NodeSlicesExceptRoot);
        node.add_segment(wait.build());
    }

    Ok(node.build())
}

#[cfg(test)]
mod tests {
    use super::*;
    use latticelm_core::plan::{ModelDims, StageDef};
    use latticelm_core::rope::RopeScaling;
    use latticelm_core::rope::RopeType;

    fn tiny_header() -> ModelHeader {
        ModelHeader {
            version: 1,
            arch: ArchType::Llama,
            dim: 8,
            hidden_dim: 16,
            n_layers: 2,
            n_heads: 2,
            n_kv_heads: 2,
            n_experts: 0,
            n_active_experts: 0,
            vocab_size: 32,
            seq_len: 16,
            orig_seq_len: 16,
            hidden_act: HiddenAct::Silu,
            rope_type: RopeType::Llama,
            rope_theta: 10_000.0,
            rope_scaling: RopeScaling::default(),
            norm_epsilon: 1e-5,
            moe_hidden_dim: 0,
            head_dim: 4,
            q_dim: 8,
            kv_dim: 8,
            weight_type: FloatType::F32,
            sync_type: FloatType::F32,
            header_size: 8,
            file_size: 0,
        }
    }

    fn dims(h: &ModelHeader) -> ModelDims {
        h.dims()
    }

    #[test]
    fn test_single_node_graph_shape() {
        let h = tiny_header();
        let plan = PartitionPlan::uniform(1, dims(&h)).unwrap();
        let net = build_llm_net(&h, &plan, 1).unwrap();
        assert_eq!(net.node_configs.len(), 1);
        let node = &net.node_configs[0];

        // start + (att, ff) per layer + end.
        assert_eq!(node.segments.len(), 1 + 2 * 2 + 1);
        let end = node.segments.last().unwrap();
        assert_eq!(end.syncs[0].kind, SyncKind::NodeSlicesExceptRoot);
        assert_eq!(end.ops.last().unwrap().name, "final_cast_logits");
    }

    #[test]
    fn test_pure_pp_graph_boundaries() {
        let h = tiny_header();
        let plan = PartitionPlan::new(
            &[
                StageDef {
                    n_layers: 1,
                    tp_ratios: vec![1.0],
                },
                StageDef {
                    n_layers: 1,
                    tp_ratios: vec![1.0],
                },
            ],
            dims(&h),
        )
        .unwrap();
        let net = build_llm_net(&h, &plan, 1).unwrap();

        let node0 = &net.node_configs[0];
        let node1 = &net.node_configs[1];

        // Node 0: exactly one PP_SEND; node 1: exactly one PP_RECV and
        // one logits gather back to node 0.
        let count = |node: &NodeConfig, kind: SyncKind| {
            node.segments
                .iter()
                .flat_map(|s| s.syncs.iter())
                .filter(|s| s.kind == kind)
                .count()
        };
        assert_eq!(count(node0, SyncKind::PpSend), 1);
        assert_eq!(count(node0, SyncKind::PpRecv), 0);
        assert_eq!(count(node0, SyncKind::NodeSlicesExceptRoot), 1);
        assert_eq!(count(node1, SyncKind::PpRecv), 1);
        assert_eq!(count(node1, SyncKind::NodeSlicesExceptRoot), 1);

        // Node 1 owns layer 1 only: its first att op consumes the X
        // pipe delivered by PP_RECV.
        let att = node1
            .segments
            .iter()
            .find(|s| s.ops.iter().any(|op| op.name == "block_cast_x_pp"))
            .expect("pp entry cast");
        assert_eq!(att.ops[0].index, 1);
    }

    #[test]
    fn test_tp_zq_slices_cover_hidden_dim() {
        let h = tiny_header();
        let plan = PartitionPlan::uniform(2, dims(&h)).unwrap();
        let net = build_llm_net(&h, &plan, 1).unwrap();

        let zq = &net.net_config.pipes[net.zq_pipe as usize];
        assert_eq!(zq.size.x, h.dim * 2);

        let group: Vec<u32> = vec![0, 1];
        let table = latticelm_core::plan::group_slices(
            Some(&plan),
            &group,
            2,
            zq.size.row_bytes(),
        );
        assert_eq!(table.size(0) + table.size(1), zq.size.row_bytes());
        assert_eq!(table.offset(1), table.size(0));
    }

    #[test]
    fn test_qwen_graph_has_qk_norms() {
        let mut h = tiny_header();
        h.arch = ArchType::Qwen3;
        h.rope_type = RopeType::Falcon;
        let plan = PartitionPlan::uniform(1, dims(&h)).unwrap();
        let net = build_llm_net(&h, &plan, 1).unwrap();
        let names: Vec<&str> = net.node_configs[0]
            .segments
            .iter()
            .flat_map(|s| s.ops.iter())
            .map(|op| op.name.as_str())
            .collect();
        assert!(names.contains(&"block_norm_q"));
        assert!(names.contains(&"block_norm_k"));
    }
}
