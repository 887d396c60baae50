//! Inter-node synchronization primitives.
//!
//! Executed once per sync directive per batch row. Byte windows into a
//! shared pipe row come from [`group_slices`], which matches the pipe
//! width against the partition plan's dimension splits (vocab, ffn,
//! dim, head, kvHead, then a uniform fallback) so the network layer and
//! the device pointer resolution always agree on offsets.

use std::io;
use std::sync::Arc;

use latticelm_core::graph::{NetConfig, NodeConfig, SegmentConfig, SyncKind, Synchronizer};
use latticelm_core::plan::{group_slices, PartitionPlan, StageConfig};
use latticelm_core::AlignedBuf;

use crate::socket::{Network, ReadIo, WriteIo};

fn io_err(e: crate::error::NetError) -> io::Error {
    match e {
        crate::error::NetError::Transfer(inner) => inner,
        other => io::Error::new(io::ErrorKind::Other, other.to_string()),
    }
}

/// Drives the sync directives of one node over the mesh.
pub struct NetworkSynchronizer {
    network: Arc<Network>,
    net_config: NetConfig,
    node_index: u32,
    plan: Option<Arc<PartitionPlan>>,
    my_stage: Option<StageConfig>,
}

impl NetworkSynchronizer {
    pub fn new(
        network: Arc<Network>,
        net_config: NetConfig,
        node_config: &NodeConfig,
        plan: Option<Arc<PartitionPlan>>,
    ) -> Self {
        let my_stage = plan
            .as_deref()
            .and_then(|p| p.stage_for_node(node_config.node_index))
            .cloned();
        NetworkSynchronizer {
            network,
            net_config,
            node_index: node_config.node_index,
            plan,
            my_stage,
        }
    }

    fn all_nodes(&self) -> Vec<u32> {
        (0..self.net_config.n_nodes).collect()
    }

    /// Stage root broadcasts the pipe row to its group; members read.
    /// Without a stage the broadcast is cluster-global from node 0.
    fn sync_with_root(&self, stage: Option<&StageConfig>, row: &mut [u8]) -> io::Result<()> {
        let root = stage.map_or(0, |s| s.root_node_index);
        if self.node_index == root {
            let targets: Vec<usize> = match stage {
                Some(stage) => stage
                    .node_indices
                    .iter()
                    .filter(|&&n| n != self.node_index)
                    .map(|&n| self.network.socket_index_for_node(n))
                    .collect(),
                None => (0..self.network.n_sockets()).collect(),
            };
            if targets.is_empty() {
                return Ok(());
            }
            let data: &[u8] = row;
            let mut ios: Vec<WriteIo<'_>> = targets
                .into_iter()
                .map(|socket_index| WriteIo { socket_index, data })
                .collect();
            self.network.write_many(&mut ios).map_err(io_err)
        } else {
            let socket_index = self.network.socket_index_for_node(root);
            self.network.read(socket_index, row).map_err(io_err)
        }
    }

    /// All-gather within the TP group: every member writes its window
    /// to every peer and reads each peer's window into place.
    fn sync_node_slices(&self, row: &mut [u8]) -> io::Result<()> {
        let group = match self.my_stage.as_ref() {
            Some(stage) => stage.node_indices.clone(),
            None => self.all_nodes(),
        };
        let peers: Vec<u32> = group
            .iter()
            .copied()
            .filter(|&n| n != self.node_index)
            .collect();
        if peers.is_empty() {
            return Ok(());
        }

        let table = group_slices(
            self.plan.as_deref(),
            &group,
            self.net_config.n_nodes as usize,
            row.len(),
        );

        let my_offset = table.offset(self.node_index);
        let my_size = table.size(self.node_index);
        {
            let my_slice = &row[my_offset..my_offset + my_size];
            let mut ios: Vec<WriteIo<'_>> = peers
                .iter()
                .map(|&node| WriteIo {
                    socket_index: self.network.socket_index_for_node(node),
                    data: my_slice,
                })
                .collect();
            self.network.write_many(&mut ios).map_err(io_err)?;
        }

        let mut ios = split_row_windows(&self.network, row, &peers, &table);
        self.network.read_many(&mut ios).map_err(io_err)
    }

    /// Logits gather: the last stage's members send their vocab slice
    /// to node 0; node 0 only reads. Members of other stages skip,
    /// except node 0's wait segment.
    fn sync_slices_to_root(&self, row: &mut [u8]) -> io::Result<()> {
        let group = match self.plan.as_deref() {
            Some(plan) => plan.stages[plan.stages.len() - 1].node_indices.clone(),
            None => self.all_nodes(),
        };
        let table = group_slices(
            self.plan.as_deref(),
            &group,
            self.net_config.n_nodes as usize,
            row.len(),
        );

        if self.node_index == 0 {
            let senders: Vec<u32> = group.iter().copied().filter(|&n| n != 0).collect();
            if senders.is_empty() {
                return Ok(());
            }
            let mut ios = split_row_windows(&self.network, row, &senders, &table);
            self.network.read_many(&mut ios).map_err(io_err)
        } else if group.contains(&self.node_index) {
            let my_offset = table.offset(self.node_index);
            let my_size = table.size(self.node_index);
            let my_slice = &row[my_offset..my_offset + my_size];
            let socket_index = self.network.socket_index_for_node(0);
            let mut ios = [WriteIo {
                socket_index,
                data: my_slice,
            }];
            self.network.write_many(&mut ios).map_err(io_err)
        } else {
            Ok(())
        }
    }

    /// Point-to-point hidden-state transfer between stage roots. Only
    /// the stage root participates; other members skip.
    fn sync_pp(&self, send: bool, row: &mut [u8]) -> io::Result<()> {
        let (Some(plan), Some(stage)) = (self.plan.as_deref(), self.my_stage.as_ref()) else {
            return Ok(());
        };
        if stage.root_node_index != self.node_index {
            return Ok(());
        }
        if send {
            let Some(next) = plan.stages.get(stage.stage_index as usize + 1) else {
                return Ok(());
            };
            let socket_index = self.network.socket_index_for_node(next.root_node_index);
            self.network.write(socket_index, row).map_err(io_err)
        } else {
            if stage.stage_index == 0 {
                return Ok(());
            }
            let prev = &plan.stages[stage.stage_index as usize - 1];
            let socket_index = self.network.socket_index_for_node(prev.root_node_index);
            self.network.read(socket_index, row).map_err(io_err)
        }
    }
}

/// Splits one pipe row into the disjoint windows of `nodes`, paired
/// with the socket each window is read from.
fn split_row_windows<'a>(
    network: &Network,
    row: &'a mut [u8],
    nodes: &[u32],
    table: &latticelm_core::plan::GroupSlices,
) -> Vec<ReadIo<'a>> {
    let mut ordered: Vec<u32> = nodes.to_vec();
    ordered.sort_by_key(|&node| table.offset(node));

    let mut ios = Vec::with_capacity(ordered.len());
    let mut rest: &'a mut [u8] = row;
    let mut consumed = 0usize;
    for &node in &ordered {
        let start = table.offset(node) - consumed;
        let size = table.size(node);
        let tail = std::mem::take(&mut rest);
        let (_, tail) = tail.split_at_mut(start);
        let (window, tail) = tail.split_at_mut(size);
        consumed = table.offset(node) + size;
        rest = tail;
        ios.push(ReadIo {
            socket_index: network.socket_index_for_node(node),
            data: window,
        });
    }
    ios
}

impl Synchronizer for NetworkSynchronizer {
    fn sync_segment(
        &mut self,
        segment: &SegmentConfig,
        pipes: &mut [AlignedBuf],
        batch_size: u32,
    ) -> io::Result<()> {
        for sync in &segment.syncs {
            let pipe_config = &self.net_config.pipes[sync.pipe_index as usize];
            let row_bytes = pipe_config.size.row_bytes();
            let pipe = &mut pipes[sync.pipe_index as usize];
            for batch_index in 0..batch_size as usize {
                let row = &mut pipe.as_mut_slice()[batch_index * row_bytes..][..row_bytes];
                match sync.kind {
                    SyncKind::WithRoot => self.sync_with_root(self.my_stage.as_ref(), row)?,
                    SyncKind::NodeSlices => self.sync_node_slices(row)?,
                    SyncKind::NodeSlicesExceptRoot => self.sync_slices_to_root(row)?,
                    SyncKind::PpSend => self.sync_pp(true, row)?,
                    SyncKind::PpRecv => self.sync_pp(false, row)?,
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use latticelm_core::plan::{group_slices, ModelDims, StageDef};

    fn plan_2stage() -> PartitionPlan {
        PartitionPlan::new(
            &[
                StageDef {
                    n_layers: 1,
                    tp_ratios: vec![1.0, 1.0],
                },
                StageDef {
                    n_layers: 1,
                    tp_ratios: vec![1.0, 1.0],
                },
            ],
            ModelDims {
                n_layers: 2,
                n_heads: 8,
                n_kv_heads: 4,
                vocab_size: 320,
                ffn_dim: 256,
                dim: 128,
            },
        )
        .unwrap()
    }

    #[test]
    fn test_logits_windows_match_last_stage_vocab_split() {
        let plan = plan_2stage();
        let group = plan.stages[1].node_indices.clone();
        // 320 f32 logits.
        let table = group_slices(Some(&plan), &group, 4, 320 * 4);
        assert_eq!(table.size(2), plan.vocab_split.lengths[2] as usize * 4);
        assert_eq!(table.size(3), plan.vocab_split.lengths[3] as usize * 4);
        assert_eq!(table.offset(2), 0);
        assert_eq!(
            table.offset(3),
            plan.vocab_split.starts[3] as usize * 4
        );
        // Disjoint cover of the full vocab row.
        assert_eq!(table.size(2) + table.size(3), 320 * 4);
        assert_eq!(table.size(0) + table.size(1), 0);
    }

    #[test]
    fn test_zq_windows_are_disjoint_within_stage() {
        let plan = plan_2stage();
        let group = plan.stages[0].node_indices.clone();
        // ZQ row: dim * nNodes floats.
        let row = 128 * 4 * 4;
        let table = group_slices(Some(&plan), &group, 4, row);
        assert_eq!(table.size(0) + table.size(1), row);
        assert_eq!(table.offset(1), table.size(0));
    }

    #[test]
    fn test_uniform_fallback_absorbs_rounding() {
        let group = [0u32, 1, 2];
        let table = group_slices(None, &group, 3, 100);
        assert_eq!(
            (table.size(0), table.size(1), table.size(2)),
            (33, 33, 34)
        );
        assert_eq!(table.offset(2), 66);
    }
}
