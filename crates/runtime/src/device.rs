//! CPU device: buffer allocation and pointer resolution.
//!
//! Every op is compiled into an [`OpContext`] holding raw per-row
//! pointers into the node's buffers and the shared pipes. The pointers
//! are captured once at construction; `AlignedBuf` allocations never
//! move, so they stay valid for the session. Kernels receive disjoint
//! work ranges from the dispatcher, which is what makes the aliasing
//! sound: exactly one op runs at a time, and its threads partition the
//! output.

use latticelm_core::graph::{
    NetConfig, NodeConfig, OpCode, OpConfig, OpParams, PointerConfig, PointerKind, PointerSource,
};
use latticelm_core::plan::{group_slices, PartitionPlan};
use latticelm_core::rope::fill_rope_cache;
use latticelm_core::size::TensorSize;
use latticelm_core::AlignedBuf;

use crate::error::{Result, RuntimeError};
use crate::kernels::{resolve_kernel, Kernel};

/// A raw pointer that may cross thread boundaries. Dereferencing is
/// only valid under the executor's one-op-at-a-time discipline.
#[derive(Clone, Copy)]
pub struct SendPtr(pub *mut u8);

unsafe impl Send for SendPtr {}
unsafe impl Sync for SendPtr {}

/// Everything a kernel needs to run one op.
pub struct OpContext {
    pub code: OpCode,
    pub name: String,
    pub index: u32,
    pub params: OpParams,
    /// One pointer per (z, batch) row; a single entry for raw views.
    pub input: Vec<SendPtr>,
    pub input_size: TensorSize,
    pub output: Vec<SendPtr>,
    pub output_size: TensorSize,
    pub weight: AlignedBuf,
    pub weight_size: TensorSize,
    pub n_batches: u32,
    /// Base pointers of every node buffer and pipe, for ops that
    /// address scratch memory by index (attention, shift, mul, scale).
    pub buffers: Vec<SendPtr>,
    pub buffer_sizes: Vec<TensorSize>,
    pub pipes: Vec<SendPtr>,
    pub pipe_sizes: Vec<TensorSize>,
}

pub struct CompiledOp {
    pub kernel: Kernel,
    pub ctx: OpContext,
}

/// The node's scratch memory.
pub struct CpuDevice {
    pub buffers: Vec<AlignedBuf>,
    buffer_sizes: Vec<TensorSize>,
}

impl CpuDevice {
    pub fn new(node_config: &NodeConfig) -> Self {
        let buffers = node_config
            .buffers
            .iter()
            .map(|b| AlignedBuf::zeroed(b.size.n_bytes))
            .collect();
        CpuDevice {
            buffers,
            buffer_sizes: node_config.buffers.iter().map(|b| b.size).collect(),
        }
    }

    fn resolve_pointer(
        &self,
        pointer: &PointerConfig,
        net_config: &NetConfig,
        pipes: &[AlignedBuf],
        plan: Option<&PartitionPlan>,
        node_index: u32,
    ) -> (Vec<SendPtr>, TensorSize) {
        let (base, size) = match pointer.source {
            PointerSource::Buffer => (
                self.buffers[pointer.index as usize].as_ptr(),
                self.buffer_sizes[pointer.index as usize],
            ),
            PointerSource::Pipe => (
                pipes[pointer.index as usize].as_ptr(),
                net_config.pipes[pointer.index as usize].size,
            ),
        };

        match pointer.kind {
            PointerKind::Raw => (
                vec![SendPtr(base)],
                TensorSize::d1(size.float_type, size.len as u32),
            ),
            PointerKind::Batch | PointerKind::BatchedSlice => {
                assert_eq!(size.y, net_config.n_batches, "batched view of {size:?}");
                let row_bytes = size.row_bytes();
                let mut rows = Vec::with_capacity((size.z * size.y) as usize);
                for row in 0..(size.z * size.y) as usize {
                    rows.push(SendPtr(unsafe { base.add(row * row_bytes) }));
                }

                if pointer.kind == PointerKind::Batch {
                    return (rows, size);
                }

                // Narrow each row to this node's window, matching the
                // same slice table the synchronizer uses.
                let group: Vec<u32> = plan
                    .and_then(|p| p.stage_for_node(node_index))
                    .map(|s| s.node_indices.clone())
                    .unwrap_or_else(|| (0..net_config.n_nodes).collect());
                let table = group_slices(
                    plan,
                    &group,
                    net_config.n_nodes as usize,
                    row_bytes,
                );
                let offset = table.offset(node_index);
                let window_bytes = table.size(node_index);
                for row in rows.iter_mut() {
                    *row = SendPtr(unsafe { row.0.add(offset) });
                }
                let window_x = size.float_type.elements_for(window_bytes) as u32;
                (rows, TensorSize::d3(size.float_type, size.z, size.y, window_x))
            }
        }
    }

    /// Compiles one op: resolves pointers, allocates the weight
    /// buffer, fills the RoPE cache, and looks up the kernel.
    #[allow(clippy::too_many_arguments)]
    pub fn compile_op(
        &mut self,
        op: &OpConfig,
        net_config: &NetConfig,
        pipes: &[AlignedBuf],
        plan: Option<&PartitionPlan>,
        node_index: u32,
    ) -> Result<CompiledOp> {
        let (input, input_size) =
            self.resolve_pointer(&op.input, net_config, pipes, plan, node_index);
        let (output, mut output_size) =
            self.resolve_pointer(&op.output, net_config, pipes, plan, node_index);

        // A cast into a sliced pipe trusts the producing buffer's
        // width; the pipe window is only required to be large enough.
        if op.code == OpCode::Cast && op.output.kind == PointerKind::BatchedSlice {
            assert!(
                input_size.x <= output_size.x,
                "cast source wider than its pipe window ({} > {})",
                input_size.x,
                output_size.x
            );
            output_size =
                TensorSize::d3(output_size.float_type, output_size.z, output_size.y, input_size.x);
        }

        let quant = latticelm_core::quant::op_quant_type(
            input_size.float_type,
            op.weight_float(),
            output_size.float_type,
        )?;
        let kernel = resolve_kernel(op.code, quant).ok_or_else(|| RuntimeError::OpInit {
            op: op.code.as_str(),
            quant: quant.as_str(),
            name: op.name.clone(),
        })?;

        let weight = AlignedBuf::zeroed(op.weight_size.n_bytes);

        let ctx = OpContext {
            code: op.code,
            name: op.name.clone(),
            index: op.index,
            params: op.params.clone(),
            input,
            input_size,
            output,
            output_size,
            weight,
            weight_size: op.weight_size,
            n_batches: net_config.n_batches,
            buffers: self.buffers.iter().map(|b| SendPtr(b.as_ptr())).collect(),
            buffer_sizes: self.buffer_sizes.clone(),
            pipes: pipes.iter().map(|p| SendPtr(p.as_ptr())).collect(),
            pipe_sizes: net_config.pipes.iter().map(|p| p.size).collect(),
        };

        if let OpParams::Rope {
            kind,
            cache_buffer,
            scaling,
            slice,
            ..
        } = &op.params
        {
            let cache = &mut self.buffers[*cache_buffer as usize];
            let floats = unsafe {
                std::slice::from_raw_parts_mut(cache.as_ptr() as *mut f32, cache.len() / 4)
            };
            fill_rope_cache(*kind, slice, scaling, floats);
        }

        Ok(CompiledOp { kernel, ctx })
    }
}
