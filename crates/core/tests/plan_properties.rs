//! Property tests for the partition planner.

use latticelm_core::plan::{ModelDims, PartitionPlan};
use latticelm_core::topology::parse_stage_defs;
use proptest::prelude::*;

fn arb_dims() -> impl Strategy<Value = ModelDims> {
    (1u32..6, 1u32..5, 1u32..33).prop_map(|(kv_mult, gqa, layers_per)| {
        let n_kv_heads = kv_mult * 4;
        ModelDims {
            n_layers: layers_per * 2,
            n_heads: n_kv_heads * gqa,
            n_kv_heads,
            vocab_size: 32_000,
            ffn_dim: 2048,
            dim: 768,
        }
    })
}

fn arb_topology() -> impl Strategy<Value = (String, u32)> {
    // Up to 3 stages of up to 2 nodes each, ratios in 1..=4.
    prop::collection::vec(prop::collection::vec(1u32..=4, 1..=2), 1..=3).prop_map(|stages| {
        let n_nodes: u32 = stages.iter().map(|s| s.len() as u32).sum();
        let text = stages
            .iter()
            .map(|s| {
                s.iter()
                    .map(|r| r.to_string())
                    .collect::<Vec<_>>()
                    .join(",")
            })
            .collect::<Vec<_>>()
            .join("*");
        (text, n_nodes)
    })
}

proptest! {
    #[test]
    fn prop_plan_invariants((topology, n_nodes) in arb_topology(), dims in arb_dims()) {
        prop_assume!(dims.n_kv_heads >= n_nodes);
        let defs = parse_stage_defs(&topology, n_nodes, dims.n_layers).unwrap();
        let plan = PartitionPlan::new(&defs, dims).unwrap();

        // Layer assignment: contiguous cover of [0, n_layers).
        let mut layer = 0;
        for stage in &plan.stages {
            prop_assert_eq!(stage.start_layer, layer);
            prop_assert_eq!(stage.end_layer - stage.start_layer, stage.n_layers);
            layer = stage.end_layer;
        }
        prop_assert_eq!(layer, dims.n_layers);

        for stage in &plan.stages {
            // Every split covers the full dimension within each stage,
            // all lengths positive, starts contiguous from zero.
            for (split, total, alignment) in [
                (&plan.kv_head_split, dims.n_kv_heads, 1u32),
                (&plan.head_split, dims.n_heads, 1),
                (&plan.dim_split, dims.dim, 32),
                (&plan.ffn_split, dims.ffn_dim, 32),
                (&plan.vocab_split, dims.vocab_size, 32),
            ] {
                let mut sum = 0;
                for (pos, &node) in stage.node_indices.iter().enumerate() {
                    let i = node as usize;
                    prop_assert!(split.lengths[i] > 0);
                    prop_assert_eq!(split.starts[i], sum);
                    // Non-terminal nodes are aligned; the last node
                    // absorbs rounding.
                    if pos + 1 < stage.node_indices.len() && total >= stage.n_nodes() * alignment {
                        prop_assert_eq!(split.lengths[i] % alignment, 0);
                    }
                    sum += split.lengths[i];
                }
                prop_assert_eq!(sum, total);
            }

            // GQA coupling: Q heads derive from KV heads.
            let gqa = dims.n_heads / dims.n_kv_heads;
            for &node in &stage.node_indices {
                let i = node as usize;
                prop_assert_eq!(
                    plan.head_split.lengths[i],
                    plan.kv_head_split.lengths[i] * gqa
                );
                prop_assert_eq!(
                    plan.head_split.starts[i],
                    plan.kv_head_split.starts[i] * gqa
                );
            }
        }
    }
}

#[test]
fn test_hybrid_topology_scenario() {
    // "1:2*1:1*2:3", 4 nodes, 4 layers: stage weights 1:2 over two
    // stages; stage 0 nodes {0,1} ratios 1:1; stage 1 nodes {2,3}
    // ratios 2:3.
    let dims = ModelDims {
        n_layers: 4,
        n_heads: 20,
        n_kv_heads: 20,
        vocab_size: 32_000,
        ffn_dim: 2048,
        dim: 640,
    };
    let defs = parse_stage_defs("1:2*1:1*2:3", 4, dims.n_layers).unwrap();
    let plan = PartitionPlan::new(&defs, dims).unwrap();

    assert_eq!(plan.stages[0].n_layers, 1);
    assert_eq!(plan.stages[0].node_indices, vec![0, 1]);
    assert_eq!(plan.stages[1].start_layer, 1);
    assert_eq!(plan.stages[1].end_layer, 4);
    assert_eq!(plan.stages[1].node_indices, vec![2, 3]);

    // Stage-1 hidden dim split: 2/5 and 3/5 of 640, rounded to 32.
    let ideal: f64 = 640.0 * 2.0 / 5.0;
    let rounded = ((ideal / 32.0).round() as u32) * 32;
    assert_eq!(plan.dim_split.lengths[2], rounded);
    assert_eq!(plan.dim_split.lengths[3], 640 - rounded);
}

#[test]
fn test_topology_node_mismatch_scenario() {
    let err = parse_stage_defs("1,1*1,1", 3, 4).unwrap_err();
    assert_eq!(
        err.to_string(),
        "Bad topology: Ratios defined 4 nodes, but expected 3"
    );
}
