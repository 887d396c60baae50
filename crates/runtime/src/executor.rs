//! Segment executor.
//!
//! One forward: for every segment, fan each op out across the worker
//! pool and join, then hand the segment's sync directives to the
//! synchronizer. Ops and syncs within a segment are serial; nothing
//! overlaps across segments.

use std::sync::Arc;
use std::time::Instant;

use latticelm_core::graph::{
    NetConfig, NodeConfig, SegmentConfig, SyncConfig, SyncKind, Synchronizer, WeightSink,
};
use latticelm_core::plan::PartitionPlan;
use latticelm_core::AlignedBuf;

use crate::device::{CompiledOp, CpuDevice};
use crate::dispatcher::Dispatcher;
use crate::error::Result;

/// Shared pipe memory plus the current batch size.
pub struct NetExecution {
    pub pipes: Vec<AlignedBuf>,
    pub batch_size: u32,
    pub n_batches: u32,
}

impl NetExecution {
    pub fn new(net_config: &NetConfig) -> Self {
        NetExecution {
            pipes: net_config
                .pipes
                .iter()
                .map(|p| AlignedBuf::zeroed(p.size.n_bytes))
                .collect(),
            batch_size: 1,
            n_batches: net_config.n_batches,
        }
    }
}

/// Timing buckets for the profile packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    ExecuteOp,
    SyncNodes,
}

/// Single-node synchronizer: every directive is a no-op because there
/// are no peers.
pub struct FakeSynchronizer;

impl Synchronizer for FakeSynchronizer {
    fn sync_segment(
        &mut self,
        _segment: &SegmentConfig,
        _pipes: &mut [AlignedBuf],
        _batch_size: u32,
    ) -> std::io::Result<()> {
        Ok(())
    }
}

struct CompiledSegment {
    ops: Vec<CompiledOp>,
    /// Sync directives of this segment, kept in wire form for the
    /// synchronizer.
    directives: SegmentConfig,
}

pub struct Executor {
    device: CpuDevice,
    execution: NetExecution,
    segments: Vec<CompiledSegment>,
    synchronizer: Box<dyn Synchronizer>,
    dispatcher: Dispatcher,
    /// Synthetic segment carrying the pre-forward pipe replications.
    pre_sync: SegmentConfig,
    exec_us: u32,
    sync_us: u32,
    profile: bool,
}

impl Executor {
    pub fn new(
        net_config: &NetConfig,
        node_config: &NodeConfig,
        plan: Option<&Arc<PartitionPlan>>,
        n_threads: u32,
        synchronizer: Box<dyn Synchronizer>,
        profile: bool,
    ) -> Result<Self> {
        let execution = NetExecution::new(net_config);
        let mut device = CpuDevice::new(node_config);
        let plan_ref = plan.map(|p| p.as_ref());

        let mut segments = Vec::with_capacity(node_config.segments.len());
        for segment in &node_config.segments {
            let mut ops = Vec::with_capacity(segment.ops.len());
            for op in &segment.ops {
                ops.push(device.compile_op(
                    op,
                    net_config,
                    &execution.pipes,
                    plan_ref,
                    node_config.node_index,
                )?);
            }
            segments.push(CompiledSegment {
                ops,
                directives: SegmentConfig {
                    ops: Vec::new(),
                    syncs: segment.syncs.clone(),
                },
            });
        }

        let pre_sync = SegmentConfig {
            ops: Vec::new(),
            syncs: net_config
                .pre_syncs
                .iter()
                .map(|&pipe_index| SyncConfig {
                    pipe_index,
                    kind: SyncKind::WithRoot,
                })
                .collect(),
        };

        Ok(Executor {
            device,
            execution,
            segments,
            synchronizer,
            dispatcher: Dispatcher::new(n_threads),
            pre_sync,
            exec_us: 0,
            sync_us: 0,
            profile,
        })
    }

    pub fn set_batch_size(&mut self, batch_size: u32) {
        assert!(batch_size <= self.execution.n_batches);
        self.execution.batch_size = batch_size;
    }

    pub fn batch_size(&self) -> u32 {
        self.execution.batch_size
    }

    /// Read access to a pipe (tokens, positions, logits).
    pub fn pipe(&self, pipe_index: u32) -> &[u8] {
        self.execution.pipes[pipe_index as usize].as_slice()
    }

    pub fn pipe_mut(&mut self, pipe_index: u32) -> &mut [u8] {
        self.execution.pipes[pipe_index as usize].as_mut_slice()
    }

    pub fn pipe_f32(&self, pipe_index: u32) -> &[f32] {
        let bytes = self.pipe(pipe_index);
        unsafe { std::slice::from_raw_parts(bytes.as_ptr() as *const f32, bytes.len() / 4) }
    }

    pub fn pipe_f32_mut(&mut self, pipe_index: u32) -> &mut [f32] {
        let bytes = self.pipe_mut(pipe_index);
        unsafe { std::slice::from_raw_parts_mut(bytes.as_mut_ptr() as *mut f32, bytes.len() / 4) }
    }

    /// Accumulated microseconds for the current forward.
    pub fn total_time(&self, step: StepKind) -> u32 {
        match step {
            StepKind::ExecuteOp => self.exec_us,
            StepKind::SyncNodes => self.sync_us,
        }
    }

    /// Runs one forward over all segments. Timings reset at entry so
    /// the profile packets are per-forward.
    pub fn forward(&mut self) -> Result<()> {
        self.exec_us = 0;
        self.sync_us = 0;
        let batch_size = self.execution.batch_size;
        let n_threads = self.dispatcher.n_threads();

        let sync_start = Instant::now();
        self.synchronizer
            .sync_segment(&self.pre_sync, &mut self.execution.pipes, batch_size)?;
        self.sync_us += sync_start.elapsed().as_micros() as u32;

        for segment in &self.segments {
            let exec_start = Instant::now();
            for op in &segment.ops {
                let kernel = op.kernel;
                let ctx = &op.ctx;
                self.dispatcher
                    .parallel(&|thread_index| kernel(n_threads, thread_index, batch_size, ctx));
            }
            self.exec_us += exec_start.elapsed().as_micros() as u32;

            if !segment.directives.syncs.is_empty() {
                let sync_start = Instant::now();
                self.synchronizer.sync_segment(
                    &segment.directives,
                    &mut self.execution.pipes,
                    batch_size,
                )?;
                self.sync_us += sync_start.elapsed().as_micros() as u32;
            }
        }

        if self.profile {
            tracing::debug!(
                exec_us = self.exec_us,
                sync_us = self.sync_us,
                batch_size,
                "forward complete"
            );
        }
        Ok(())
    }

    /// Buffers are exposed for tests that poke at intermediate state.
    pub fn device(&self) -> &CpuDevice {
        &self.device
    }
}

impl WeightSink for Executor {
    fn upload(&mut self, name: &str, index: u32, offset: usize, data: &[u8]) {
        for segment in &mut self.segments {
            for op in &mut segment.ops {
                if op.ctx.name == name && op.ctx.index == index {
                    let weight = op.ctx.weight.as_mut_slice();
                    assert!(
                        offset + data.len() <= weight.len(),
                        "weight upload overflows op {name}[{index}]: {} > {}",
                        offset + data.len(),
                        weight.len()
                    );
                    weight[offset..offset + data.len()].copy_from_slice(data);
                    return;
                }
            }
        }
        panic!("weight upload for unknown op {name}[{index}]");
    }
}
