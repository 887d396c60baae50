//! CPU op kernels.
//!
//! Every kernel has the signature `(n_threads, thread_index,
//! batch_size, ctx)`. Threads partition the hot dimension (output rows
//! for matmuls, elements for elementwise ops, heads for attention);
//! the dispatcher barriers between ops, so a kernel may freely read
//! anything written by earlier ops of the same segment.

use latticelm_core::graph::{OpCode, OpParams};
use latticelm_core::quant::{
    dequantize_q80_row, q40_blocks, q80_blocks, q80_blocks_mut, quantize_q80_row, BlockQ40,
    BlockQ80, OpQuantType, Q_BLOCK_SIZE,
};
use latticelm_core::rope::RopeType;

use crate::device::{OpContext, SendPtr};
use crate::dispatcher::thread_range;

pub type Kernel = fn(n_threads: u32, thread_index: u32, batch_size: u32, ctx: &OpContext);

/// Forms an f32 view of `len` elements at `ptr`. Sound because op
/// buffers are 64-byte aligned and each thread works a disjoint range.
unsafe fn f32_view<'a>(ptr: SendPtr, len: usize) -> &'a mut [f32] {
    std::slice::from_raw_parts_mut(ptr.0 as *mut f32, len)
}

unsafe fn byte_view<'a>(ptr: SendPtr, len: usize) -> &'a mut [u8] {
    std::slice::from_raw_parts_mut(ptr.0, len)
}

fn input_row<'a>(ctx: &OpContext, row: usize) -> &'a [f32] {
    unsafe { f32_view(ctx.input[row], ctx.input_size.x as usize) }
}

fn output_row<'a>(ctx: &OpContext, row: usize) -> &'a mut [f32] {
    unsafe { f32_view(ctx.output[row], ctx.output_size.x as usize) }
}

fn position_of(ctx: &OpContext, position_pipe: u32, batch: usize) -> usize {
    let pipe = ctx.pipes[position_pipe as usize];
    unsafe { f32_view(pipe, ctx.n_batches as usize)[batch] as usize }
}

fn buffer_row<'a>(ctx: &OpContext, buffer: u32, row: usize, width: usize) -> &'a mut [f32] {
    let base = ctx.buffers[buffer as usize];
    unsafe { f32_view(SendPtr(base.0.add(row * width * 4)), width) }
}

// ---------------------------------------------------------------------
// Elementwise and reduction ops
// ---------------------------------------------------------------------

fn embed_f32(_n: u32, thread_index: u32, batch_size: u32, ctx: &OpContext) {
    if thread_index != 0 {
        return;
    }
    let dim = ctx.output_size.x as usize;
    let weight = unsafe { f32_view(SendPtr(ctx.weight.as_ptr()), ctx.weight_size.len) };
    for batch in 0..batch_size as usize {
        let token = input_row(ctx, batch)[0] as usize;
        let out = output_row(ctx, batch);
        out.copy_from_slice(&weight[token * dim..(token + 1) * dim]);
    }
}

/// Accumulates the `input.x / output.x` chunks of each input row into
/// the output: the residual stream picks up the gathered partials.
fn merge_add_f32(n_threads: u32, thread_index: u32, batch_size: u32, ctx: &OpContext) {
    let out_x = ctx.output_size.x as usize;
    let parts = ctx.input_size.x as usize / out_x;
    let (start, end) = thread_range(out_x, n_threads, thread_index);
    for batch in 0..batch_size as usize {
        let input = input_row(ctx, batch);
        let out = output_row(ctx, batch);
        for i in start..end {
            let mut sum = 0.0f32;
            for part in 0..parts {
                sum += input[part * out_x + i];
            }
            out[i] += sum;
        }
    }
}

/// Q80 variant: the shared pipe holds quantized chunks.
fn merge_add_q80_f32(n_threads: u32, thread_index: u32, batch_size: u32, ctx: &OpContext) {
    let out_x = ctx.output_size.x as usize;
    let in_x = ctx.input_size.x as usize;
    let parts = in_x / out_x;
    let blocks_per_chunk = out_x / Q_BLOCK_SIZE;
    let (start_block, end_block) = thread_range(blocks_per_chunk, n_threads, thread_index);
    let mut scratch = [0.0f32; Q_BLOCK_SIZE];
    for batch in 0..batch_size as usize {
        let row_bytes = ctx.input_size.float_type.bytes_for(in_x);
        let blocks = q80_blocks(unsafe { byte_view(ctx.input[batch], row_bytes) });
        let out = output_row(ctx, batch);
        for block_index in start_block..end_block {
            let out_chunk =
                &mut out[block_index * Q_BLOCK_SIZE..(block_index + 1) * Q_BLOCK_SIZE];
            for part in 0..parts {
                let block = &blocks[part * blocks_per_chunk + block_index];
                dequantize_q80_row(std::slice::from_ref(block), &mut scratch);
                for (o, s) in out_chunk.iter_mut().zip(scratch.iter()) {
                    *o += s;
                }
            }
        }
    }
}

/// Sums the z planes of the input into the 2D output.
fn merge_sum_f32(n_threads: u32, thread_index: u32, batch_size: u32, ctx: &OpContext) {
    let x = ctx.output_size.x as usize;
    let planes = ctx.input_size.z as usize;
    let (start, end) = thread_range(x, n_threads, thread_index);
    for batch in 0..batch_size as usize {
        let out = output_row(ctx, batch);
        out[start..end].fill(0.0);
        for plane in 0..planes {
            let input = input_row(ctx, plane * ctx.n_batches as usize + batch);
            for i in start..end {
                out[i] += input[i];
            }
        }
    }
}

fn inv_rms_f32(_n: u32, thread_index: u32, batch_size: u32, ctx: &OpContext) {
    if thread_index != 0 {
        return;
    }
    let OpParams::InvRms { epsilon, n_columns } = ctx.params else {
        unreachable!("inv_rms params");
    };
    let width = ctx.input_size.x as usize / n_columns as usize;
    for batch in 0..batch_size as usize {
        let input = input_row(ctx, batch);
        let out = output_row(ctx, batch);
        for col in 0..n_columns as usize {
            let segment = &input[col * width..(col + 1) * width];
            let mean_sq = segment.iter().map(|v| v * v).sum::<f32>() / width as f32;
            out[col] = 1.0 / (mean_sq + epsilon).sqrt();
        }
    }
}

fn rms_norm_f32(n_threads: u32, thread_index: u32, batch_size: u32, ctx: &OpContext) {
    let OpParams::RmsNorm {
        inv_rms_buffer,
        n_columns,
    } = ctx.params
    else {
        unreachable!("rms_norm params");
    };
    let x = ctx.input_size.x as usize;
    let width = x / n_columns as usize;
    let weight = unsafe { f32_view(SendPtr(ctx.weight.as_ptr()), ctx.weight_size.len) };
    let inv_cols = ctx.buffer_sizes[inv_rms_buffer as usize].x as usize;
    let (start, end) = thread_range(x, n_threads, thread_index);
    for batch in 0..batch_size as usize {
        let input = input_row(ctx, batch);
        let out = output_row(ctx, batch);
        let inv = buffer_row(ctx, inv_rms_buffer, batch, inv_cols);
        for i in start..end {
            let col = i / width;
            out[i] = input[i] * inv[col] * weight[i % weight.len()];
        }
    }
}

fn silu_f32(n_threads: u32, thread_index: u32, batch_size: u32, ctx: &OpContext) {
    let rows = ctx.input_size.z as usize * batch_size as usize;
    let x = ctx.input_size.x as usize;
    let (start, end) = thread_range(x, n_threads, thread_index);
    for row in row_indices(ctx, rows, batch_size) {
        let input = input_row(ctx, row);
        let out = output_row(ctx, row);
        for i in start..end {
            let v = input[i];
            out[i] = v / (1.0 + (-v).exp());
        }
    }
}

fn gelu_f32(n_threads: u32, thread_index: u32, batch_size: u32, ctx: &OpContext) {
    const SQRT_2_OVER_PI: f32 = 0.797_884_6;
    let rows = ctx.input_size.z as usize * batch_size as usize;
    let x = ctx.input_size.x as usize;
    let (start, end) = thread_range(x, n_threads, thread_index);
    for row in row_indices(ctx, rows, batch_size) {
        let input = input_row(ctx, row);
        let out = output_row(ctx, row);
        for i in start..end {
            let v = input[i];
            out[i] = 0.5 * v * (1.0 + (SQRT_2_OVER_PI * (v + 0.044715 * v * v * v)).tanh());
        }
    }
}

/// Maps logical row counts onto the z-major pointer table: plane rows
/// live `n_batches` apart regardless of the current batch size.
fn row_indices(ctx: &OpContext, rows: usize, batch_size: u32) -> impl Iterator<Item = usize> {
    let n_batches = ctx.n_batches as usize;
    let planes = rows.div_ceil(batch_size.max(1) as usize);
    let batch = batch_size as usize;
    (0..planes).flat_map(move |plane| (0..batch).map(move |b| plane * n_batches + b))
}

fn mul_f32(n_threads: u32, thread_index: u32, batch_size: u32, ctx: &OpContext) {
    let OpParams::Mul { multiplier_buffer } = ctx.params else {
        unreachable!("mul params");
    };
    let x = ctx.input_size.x as usize;
    let rows = ctx.input_size.z as usize * batch_size as usize;
    let (start, end) = thread_range(x, n_threads, thread_index);
    for row in row_indices(ctx, rows, batch_size) {
        let input = input_row(ctx, row);
        let out = output_row(ctx, row);
        let multiplier = buffer_row(ctx, multiplier_buffer, row, x);
        for i in start..end {
            out[i] = input[i] * multiplier[i];
        }
    }
}

fn scale_f32(n_threads: u32, thread_index: u32, batch_size: u32, ctx: &OpContext) {
    let OpParams::Scale { scale_buffer } = ctx.params else {
        unreachable!("scale params");
    };
    let x = ctx.input_size.x as usize;
    let rows = ctx.input_size.z as usize * batch_size as usize;
    let (start, end) = thread_range(x, n_threads, thread_index);
    for row in row_indices(ctx, rows, batch_size) {
        let input = input_row(ctx, row);
        let out = output_row(ctx, row);
        let scale = buffer_row(ctx, scale_buffer, row, 1)[0];
        for i in start..end {
            out[i] = input[i] * scale;
        }
    }
}

fn softmax_row(values: &mut [f32]) {
    let max = values.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));
    let mut sum = 0.0f32;
    for v in values.iter_mut() {
        *v = (*v - max).exp();
        sum += *v;
    }
    if sum > 0.0 {
        for v in values.iter_mut() {
            *v /= sum;
        }
    }
}

fn softmax_f32(_n: u32, thread_index: u32, batch_size: u32, ctx: &OpContext) {
    if thread_index != 0 {
        return;
    }
    for batch in 0..batch_size as usize {
        let out = output_row(ctx, batch);
        if ctx.input[batch].0 != ctx.output[batch].0 {
            out.copy_from_slice(input_row(ctx, batch));
        }
        softmax_row(out);
    }
}

fn repeat_z_f32(_n: u32, thread_index: u32, batch_size: u32, ctx: &OpContext) {
    if thread_index != 0 {
        return;
    }
    let planes = ctx.output_size.z as usize;
    for batch in 0..batch_size as usize {
        let input = input_row(ctx, batch);
        for plane in 0..planes {
            output_row(ctx, plane * ctx.n_batches as usize + batch).copy_from_slice(input);
        }
    }
}

fn repeat_z_f32_to_q80(_n: u32, thread_index: u32, batch_size: u32, ctx: &OpContext) {
    if thread_index != 0 {
        return;
    }
    let planes = ctx.output_size.z as usize;
    let row_bytes = ctx.output_size.row_bytes();
    for batch in 0..batch_size as usize {
        let input = input_row(ctx, batch);
        for plane in 0..planes {
            let row = plane * ctx.n_batches as usize + batch;
            let out = q80_blocks_mut(unsafe { byte_view(ctx.output[row], row_bytes) });
            quantize_q80_row(input, out);
        }
    }
}

// ---------------------------------------------------------------------
// Cast
// ---------------------------------------------------------------------

fn cast_copy_f32(n_threads: u32, thread_index: u32, batch_size: u32, ctx: &OpContext) {
    let x = ctx.input_size.x as usize;
    let rows = ctx.input_size.z as usize * batch_size as usize;
    let (start, end) = thread_range(x, n_threads, thread_index);
    for row in row_indices(ctx, rows, batch_size) {
        let input = input_row(ctx, row);
        let out = unsafe { f32_view(ctx.output[row], x) };
        out[start..end].copy_from_slice(&input[start..end]);
    }
}

fn cast_f32_to_q80(_n: u32, thread_index: u32, batch_size: u32, ctx: &OpContext) {
    if thread_index != 0 {
        return;
    }
    let x = ctx.input_size.x as usize;
    let rows = ctx.input_size.z as usize * batch_size as usize;
    for row in row_indices(ctx, rows, batch_size) {
        let input = input_row(ctx, row);
        let out_bytes = ctx.output_size.float_type.bytes_for(x);
        let out = q80_blocks_mut(unsafe { byte_view(ctx.output[row], out_bytes) });
        quantize_q80_row(input, out);
    }
}

fn cast_q80_to_f32(_n: u32, thread_index: u32, batch_size: u32, ctx: &OpContext) {
    if thread_index != 0 {
        return;
    }
    let x = ctx.input_size.x as usize;
    let rows = ctx.input_size.z as usize * batch_size as usize;
    let in_bytes = ctx.input_size.row_bytes();
    for row in row_indices(ctx, rows, batch_size) {
        let blocks = q80_blocks(unsafe { byte_view(ctx.input[row], in_bytes) });
        let out = unsafe { f32_view(ctx.output[row], x) };
        dequantize_q80_row(blocks, out);
    }
}

// ---------------------------------------------------------------------
// Matmul
// ---------------------------------------------------------------------

fn dot_f32(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

fn dot_f32_q40(input: &[f32], blocks: &[BlockQ40]) -> f32 {
    let mut sum = 0.0f32;
    for (block_index, block) in blocks.iter().enumerate() {
        let d = block.d.to_f32();
        let base = block_index * Q_BLOCK_SIZE;
        for j in 0..Q_BLOCK_SIZE / 2 {
            let byte = block.qs[j];
            let lo = ((byte & 0x0F) as i32 - 8) as f32;
            let hi = ((byte >> 4) as i32 - 8) as f32;
            sum += input[base + j] * lo * d;
            sum += input[base + j + Q_BLOCK_SIZE / 2] * hi * d;
        }
    }
    sum
}

fn dot_q80_q40(input: &[BlockQ80], weight: &[BlockQ40]) -> f32 {
    let mut sum = 0.0f32;
    for (a, b) in input.iter().zip(weight.iter()) {
        let mut acc = 0i32;
        for j in 0..Q_BLOCK_SIZE / 2 {
            let byte = b.qs[j];
            let lo = (byte & 0x0F) as i32 - 8;
            let hi = (byte >> 4) as i32 - 8;
            acc += a.qs[j] as i32 * lo;
            acc += a.qs[j + Q_BLOCK_SIZE / 2] as i32 * hi;
        }
        sum += acc as f32 * a.d.to_f32() * b.d.to_f32();
    }
    sum
}

fn dot_q80_f32(input: &[BlockQ80], weight: &[f32]) -> f32 {
    let mut sum = 0.0f32;
    for (block_index, block) in input.iter().enumerate() {
        let d = block.d.to_f32();
        let base = block_index * Q_BLOCK_SIZE;
        for j in 0..Q_BLOCK_SIZE {
            sum += block.qs[j] as f32 * d * weight[base + j];
        }
    }
    sum
}

/// Resolves the active expert for a MoE matmul plane, or 0 for dense.
fn expert_for_plane(ctx: &OpContext, n_active: u32, index_buffer: u32, plane: usize, batch: usize) -> usize {
    if n_active == 0 {
        return 0;
    }
    let row = buffer_row(ctx, index_buffer, batch, n_active as usize);
    row[plane] as usize
}

fn matmul_generic(
    n_threads: u32,
    thread_index: u32,
    batch_size: u32,
    ctx: &OpContext,
    quant: OpQuantType,
) {
    let OpParams::Matmul {
        n_experts,
        n_active_experts,
        expert_index_buffer,
    } = ctx.params
    else {
        unreachable!("matmul params");
    };
    let n = ctx.input_size.x as usize;
    let d = ctx.output_size.x as usize;
    let planes = ctx.output_size.z.max(1) as usize;
    let (start, end) = thread_range(d, n_threads, thread_index);
    // Per-expert weight plane size, in weight elements laid out [d][n].
    let expert_stride = if n_experts > 0 { n * d } else { 0 };

    for plane in 0..planes {
        for batch in 0..batch_size as usize {
            let row = if planes > 1 {
                plane * ctx.n_batches as usize + batch
            } else {
                batch
            };
            let expert = if n_experts > 0 {
                expert_for_plane(ctx, n_active_experts, expert_index_buffer, plane, batch)
            } else {
                0
            };
            let out = output_row(ctx, row);
            match quant {
                OpQuantType::F32F32F32 => {
                    let input = input_row(ctx, row);
                    let weight =
                        unsafe { f32_view(SendPtr(ctx.weight.as_ptr()), ctx.weight_size.len) };
                    let weight = &weight[expert * expert_stride..];
                    for di in start..end {
                        out[di] = dot_f32(input, &weight[di * n..di * n + n]);
                    }
                }
                OpQuantType::F32Q40F32 => {
                    let input = input_row(ctx, row);
                    let weight = q40_blocks(ctx.weight.as_slice());
                    let blocks_per_row = n / Q_BLOCK_SIZE;
                    let expert_blocks = expert * expert_stride / Q_BLOCK_SIZE;
                    for di in start..end {
                        let row_blocks = &weight
                            [expert_blocks + di * blocks_per_row..expert_blocks + (di + 1) * blocks_per_row];
                        out[di] = dot_f32_q40(input, row_blocks);
                    }
                }
                OpQuantType::Q80Q40F32 => {
                    let in_bytes = ctx.input_size.row_bytes();
                    let input = q80_blocks(unsafe { byte_view(ctx.input[row], in_bytes) });
                    let weight = q40_blocks(ctx.weight.as_slice());
                    let blocks_per_row = n / Q_BLOCK_SIZE;
                    let expert_blocks = expert * expert_stride / Q_BLOCK_SIZE;
                    for di in start..end {
                        let row_blocks = &weight
                            [expert_blocks + di * blocks_per_row..expert_blocks + (di + 1) * blocks_per_row];
                        out[di] = dot_q80_q40(input, row_blocks);
                    }
                }
                OpQuantType::Q80F32F32 => {
                    let in_bytes = ctx.input_size.row_bytes();
                    let input = q80_blocks(unsafe { byte_view(ctx.input[row], in_bytes) });
                    let weight =
                        unsafe { f32_view(SendPtr(ctx.weight.as_ptr()), ctx.weight_size.len) };
                    let weight = &weight[expert * expert_stride..];
                    for di in start..end {
                        out[di] = dot_q80_f32(input, &weight[di * n..di * n + n]);
                    }
                }
                _ => unreachable!("unregistered matmul quant"),
            }
        }
    }
}

fn matmul_f32(n: u32, t: u32, b: u32, ctx: &OpContext) {
    matmul_generic(n, t, b, ctx, OpQuantType::F32F32F32);
}

fn matmul_f32_q40(n: u32, t: u32, b: u32, ctx: &OpContext) {
    matmul_generic(n, t, b, ctx, OpQuantType::F32Q40F32);
}

fn matmul_q80_q40(n: u32, t: u32, b: u32, ctx: &OpContext) {
    matmul_generic(n, t, b, ctx, OpQuantType::Q80Q40F32);
}

fn matmul_q80_f32(n: u32, t: u32, b: u32, ctx: &OpContext) {
    matmul_generic(n, t, b, ctx, OpQuantType::Q80F32F32);
}

// ---------------------------------------------------------------------
// Attention
// ---------------------------------------------------------------------

fn rope_f32(n_threads: u32, thread_index: u32, batch_size: u32, ctx: &OpContext) {
    let OpParams::Rope {
        kind,
        is_q,
        position_pipe,
        cache_buffer,
        ref slice,
        ..
    } = ctx.params
    else {
        unreachable!("rope params");
    };
    let (start_batch, end_batch) = thread_range(batch_size as usize, n_threads, thread_index);
    let cache_width = match kind {
        RopeType::Llama | RopeType::Llama31 => slice.slice_dim as usize,
        RopeType::Falcon => slice.head_dim as usize,
    };

    for batch in start_batch..end_batch {
        let pos = position_of(ctx, position_pipe, batch);
        let cache = buffer_row(ctx, cache_buffer, pos, cache_width);
        let values = output_row(ctx, batch);
        match kind {
            RopeType::Llama | RopeType::Llama31 => {
                let shift = if is_q { slice.q_shift as usize } else { 0 };
                let mut i = 0usize;
                while i < values.len() {
                    let fcr = cache[shift + i];
                    let fci = cache[shift + i + 1];
                    let v0 = values[i];
                    let v1 = values[i + 1];
                    values[i] = v0 * fcr - v1 * fci;
                    values[i + 1] = v0 * fci + v1 * fcr;
                    i += 2;
                }
            }
            RopeType::Falcon => {
                let head_dim = slice.head_dim as usize;
                let half = head_dim / 2;
                for head in values.chunks_mut(head_dim) {
                    for j in 0..half {
                        let fcr = cache[j];
                        let fci = cache[half + j];
                        let v0 = head[j];
                        let v1 = head[j + half];
                        head[j] = v0 * fcr - v1 * fci;
                        head[j + half] = v0 * fci + v1 * fcr;
                    }
                }
            }
        }
    }
}

/// Writes the freshly projected K/V rows into the cache slab at the
/// row given by the position pipe.
fn shift_f32(_n: u32, thread_index: u32, batch_size: u32, ctx: &OpContext) {
    if thread_index != 0 {
        return;
    }
    let OpParams::Shift { position_pipe } = ctx.params else {
        unreachable!("shift params");
    };
    let width = ctx.input_size.x as usize;
    let cache = unsafe { f32_view(ctx.output[0], ctx.output_size.len) };
    for batch in 0..batch_size as usize {
        let pos = position_of(ctx, position_pipe, batch);
        let input = input_row(ctx, batch);
        cache[pos * width..(pos + 1) * width].copy_from_slice(input);
    }
}

fn multihead_att_f32(n_threads: u32, thread_index: u32, batch_size: u32, ctx: &OpContext) {
    let OpParams::MultiheadAtt {
        n_heads,
        n_heads0,
        n_kv_heads,
        head_dim,
        seq_len,
        kv_len,
        position_pipe,
        query_buffer,
        key_cache_buffer,
        value_cache_buffer,
        att_buffer,
        ..
    } = ctx.params
    else {
        unreachable!("multihead att params");
    };
    let head_dim = head_dim as usize;
    let kv_len = kv_len as usize;
    let gqa_group = (n_heads / n_kv_heads) as usize;
    let scale = 1.0 / (head_dim as f32).sqrt();
    let (start_head, end_head) = thread_range(n_heads0 as usize, n_threads, thread_index);
    let q_width = ctx.input_size.x as usize;
    let att_width = n_heads0 as usize * seq_len as usize;

    for batch in 0..batch_size as usize {
        let pos = position_of(ctx, position_pipe, batch);
        let query = buffer_row(ctx, query_buffer, batch, q_width);
        let att_row = buffer_row(ctx, att_buffer, batch, att_width);
        let keys = unsafe {
            f32_view(
                ctx.buffers[key_cache_buffer as usize],
                ctx.buffer_sizes[key_cache_buffer as usize].len,
            )
        };
        let values = unsafe {
            f32_view(
                ctx.buffers[value_cache_buffer as usize],
                ctx.buffer_sizes[value_cache_buffer as usize].len,
            )
        };
        let out = output_row(ctx, batch);

        for head in start_head..end_head {
            let q = &query[head * head_dim..(head + 1) * head_dim];
            let kv_head = head / gqa_group;
            let kv_offset = kv_head * head_dim;
            let att = &mut att_row[head * seq_len as usize..head * seq_len as usize + pos + 1];
            for (t, score) in att.iter_mut().enumerate() {
                let key = &keys[t * kv_len + kv_offset..t * kv_len + kv_offset + head_dim];
                *score = dot_f32(q, key) * scale;
            }
            softmax_row(att);
            let out_head = &mut out[head * head_dim..(head + 1) * head_dim];
            out_head.fill(0.0);
            for (t, &weight) in att.iter().enumerate() {
                let value = &values[t * kv_len + kv_offset..t * kv_len + kv_offset + head_dim];
                for (o, v) in out_head.iter_mut().zip(value.iter()) {
                    *o += weight * v;
                }
            }
        }
    }
}

// ---------------------------------------------------------------------
// MoE gating
// ---------------------------------------------------------------------

fn moe_gate_f32(_n: u32, thread_index: u32, batch_size: u32, ctx: &OpContext) {
    if thread_index != 0 {
        return;
    }
    let OpParams::MoeGate {
        k,
        norm_topk,
        index_buffer,
    } = ctx.params
    else {
        unreachable!("moe gate params");
    };
    let k = k as usize;
    let n_experts = ctx.input_size.x as usize;
    for batch in 0..batch_size as usize {
        let probs = input_row(ctx, batch);
        let indices = buffer_row(ctx, index_buffer, batch, k);

        // Select the k highest-probability experts.
        let mut order: Vec<usize> = (0..n_experts).collect();
        order.sort_by(|&a, &b| probs[b].partial_cmp(&probs[a]).unwrap_or(std::cmp::Ordering::Equal));
        let top = &order[..k];
        let total: f32 = top.iter().map(|&e| probs[e]).sum();

        for (slot, &expert) in top.iter().enumerate() {
            indices[slot] = expert as f32;
            let mut weight = probs[expert];
            if norm_topk && total > 0.0 {
                weight /= total;
            }
            // moe_s is laid out (plane, batch, 1).
            let out = output_row(ctx, slot * ctx.n_batches as usize + batch);
            out[0] = weight;
        }
    }
}

// ---------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------

/// Looks up the kernel for an `(op, quant)` pair. `None` at executor
/// construction is the fatal op-init error.
pub fn resolve_kernel(code: OpCode, quant: OpQuantType) -> Option<Kernel> {
    use OpCode::*;
    use OpQuantType::*;
    Some(match (code, quant) {
        (Embed, F32F32F32) => embed_f32,
        (MergeAdd, F32F32F32) => merge_add_f32,
        (MergeAdd, Q80Q80F32) => merge_add_q80_f32,
        (MergeSum, F32F32F32) => merge_sum_f32,
        (InvRms, F32F32F32) => inv_rms_f32,
        (RmsNorm, F32F32F32) => rms_norm_f32,
        (Matmul, F32F32F32) => matmul_f32,
        (Matmul, F32Q40F32) => matmul_f32_q40,
        (Matmul, Q80Q40F32) => matmul_q80_q40,
        (Matmul, Q80F32F32) => matmul_q80_f32,
        (Rope, F32F32F32) => rope_f32,
        (MultiheadAtt, F32F32F32) => multihead_att_f32,
        (Silu, F32F32F32) => silu_f32,
        (Gelu, F32F32F32) => gelu_f32,
        (Mul, F32F32F32) => mul_f32,
        (Scale, F32F32F32) => scale_f32,
        (Cast, F32F32F32) => cast_copy_f32,
        (Cast, F32F32Q80) => cast_f32_to_q80,
        (Cast, Q80Q80F32) => cast_q80_to_f32,
        (RepeatZ, F32F32F32) => repeat_z_f32,
        (RepeatZ, F32F32Q80) => repeat_z_f32_to_q80,
        (Shift, F32F32F32) => shift_f32,
        (Softmax, F32F32F32) => softmax_f32,
        (MoeGate, F32F32F32) => moe_gate_f32,
        _ => return None,
    })
}
