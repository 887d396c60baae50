//! Cluster topology grammar.
//!
//! A ratio string describes stages and the TP ratios inside each stage.
//! Stages are separated by `*`, `;` or `|`; ratios within a stage by
//! `,` or `:`. Two forms are accepted and auto-detected:
//!
//! - **Legacy:** `tp0*tp1*...` where each segment lists one stage's
//!   node ratios. The stage weight for layer assignment is the sum of
//!   its ratios. Example: `"1,1*1,1"`.
//! - **Two-level:** `stageWeights*tpStage0*tpStage1*...` where the
//!   first segment weights the stages. Example: `"1:2*1:1*2:3"`.
//!
//! A stage may pin its layer count with `@N` (any separator style) or,
//! legacy only, with a trailing `:N` when its ratios used commas.
//! Layers not pinned are distributed proportionally to stage weight;
//! the last auto-assigned stage absorbs rounding.

use crate::error::{CoreError, Result};
use crate::plan::StageDef;

fn split_stages(raw: &str) -> Vec<&str> {
    raw.split(['*', ';', '|'])
        .filter(|s| !s.is_empty())
        .collect()
}

fn is_all_digits(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

/// Parses one stage segment into `(ratios, explicit_layers)` where
/// `explicit_layers == 0` means "assign automatically".
fn parse_ratios_and_layers(segment: &str) -> Result<(Vec<f32>, u32)> {
    let mut explicit_layers = 0u32;
    let mut ratio_part = segment;

    // Preferred, unambiguous layer syntax: "...@<int>".
    if let Some(at) = segment.rfind('@') {
        let tail = &segment[at + 1..];
        if is_all_digits(tail) {
            explicit_layers = tail.parse().unwrap_or(0);
            ratio_part = &segment[..at];
        }
    }

    // Legacy layer syntax "1,1:10", only when ratios use commas: a
    // trailing ":N" after colon-separated ratios would be ambiguous.
    if explicit_layers == 0 && segment.contains(',') {
        if let Some(colon) = segment.rfind(':') {
            let tail = &segment[colon + 1..];
            if is_all_digits(tail) {
                explicit_layers = tail.parse().unwrap_or(0);
                ratio_part = &segment[..colon];
            }
        }
    }

    let mut ratios = Vec::new();
    for item in ratio_part.split([',', ':']).filter(|s| !s.is_empty()) {
        let value: f32 = item
            .parse()
            .map_err(|_| CoreError::BadTopology(format!("Invalid ratio value: {item}")))?;
        ratios.push(value);
    }
    if ratios.is_empty() {
        return Err(CoreError::BadTopology(format!(
            "Empty ratio list in segment: {segment}"
        )));
    }
    Ok((ratios, explicit_layers))
}

/// Distributes the layers left after explicit assignments in proportion
/// to stage weight; the last auto stage absorbs the rounding error.
fn assign_layers(stages: &mut [StageDef], stage_weights: &[f32], n_layers: u32) -> Result<()> {
    let mut explicit_total = 0u32;
    let mut auto_indices = Vec::new();
    for (i, stage) in stages.iter().enumerate() {
        if stage.n_layers == 0 {
            auto_indices.push(i);
        } else {
            explicit_total += stage.n_layers;
        }
    }

    if explicit_total > n_layers {
        return Err(CoreError::BadTopology(format!(
            "Explicit layers ({explicit_total}) exceed total model layers ({n_layers})"
        )));
    }
    let remaining = n_layers - explicit_total;

    if auto_indices.is_empty() {
        if remaining != 0 {
            return Err(CoreError::BadTopology(format!(
                "Explicit layers sum to {explicit_total}, model has {n_layers}"
            )));
        }
        return Ok(());
    }

    let weights: Vec<f32> = auto_indices
        .iter()
        .map(|&i| stage_weights.get(i).copied().unwrap_or(0.0))
        .collect();
    let total_weight: f32 = weights.iter().sum();

    if total_weight <= 1e-6 {
        // Degenerate weights: fall back to a uniform assignment.
        let base = remaining / auto_indices.len() as u32;
        let rem = remaining % auto_indices.len() as u32;
        for (pos, &i) in auto_indices.iter().enumerate() {
            stages[i].n_layers = base + u32::from((pos as u32) < rem);
        }
        return Ok(());
    }

    let mut allocated = 0u32;
    for (pos, &i) in auto_indices.iter().enumerate() {
        let layers = if pos + 1 == auto_indices.len() {
            remaining - allocated
        } else {
            let ideal = remaining as f64 * (weights[pos] / total_weight) as f64;
            (ideal.round() as u32).min(remaining - allocated)
        };
        stages[i].n_layers = layers;
        allocated += layers;
    }
    Ok(())
}

/// Parses a topology string into stage definitions with resolved layer
/// counts. The node count across all stages must equal `n_nodes`.
pub fn parse_stage_defs(ratios: &str, n_nodes: u32, n_layers: u32) -> Result<Vec<StageDef>> {
    let parts = split_stages(ratios);
    if parts.is_empty() {
        return Err(CoreError::BadTopology("Ratios string is empty".into()));
    }

    // Pass 1: legacy form, every segment is a stage.
    let legacy_nodes;
    {
        let mut stages = Vec::with_capacity(parts.len());
        for segment in &parts {
            let (tp_ratios, n_layers) = parse_ratios_and_layers(segment)?;
            stages.push(StageDef { n_layers, tp_ratios });
        }
        let parsed_nodes: u32 = stages.iter().map(|s| s.tp_ratios.len() as u32).sum();
        if parsed_nodes == n_nodes {
            let stage_weights: Vec<f32> =
                stages.iter().map(|s| s.tp_ratios.iter().sum()).collect();
            assign_layers(&mut stages, &stage_weights, n_layers)?;
            return Ok(stages);
        }
        legacy_nodes = parsed_nodes;
    }

    // The legacy read did not match the cluster; the mismatch message
    // below is only used when the string is not two-level either.
    let node_mismatch = || {
        CoreError::BadTopology(format!(
            "Ratios defined {legacy_nodes} nodes, but expected {n_nodes}"
        ))
    };

    // Pass 2: two-level form, the first segment weights the stages.
    if parts.len() < 2 {
        return Err(node_mismatch());
    }
    let (stage_weights, layers) = parse_ratios_and_layers(parts[0])?;
    if layers != 0 {
        return Err(CoreError::BadTopology(format!(
            "Stage-weights segment must not specify layers: {}",
            parts[0]
        )));
    }
    let n_stages = stage_weights.len();
    if parts.len() != 1 + n_stages {
        return Err(node_mismatch());
    }

    let mut stages = Vec::with_capacity(n_stages);
    for segment in &parts[1..] {
        let (tp_ratios, n_layers) = parse_ratios_and_layers(segment)?;
        stages.push(StageDef { n_layers, tp_ratios });
    }
    let parsed_nodes: u32 = stages.iter().map(|s| s.tp_ratios.len() as u32).sum();
    if parsed_nodes != n_nodes {
        return Err(CoreError::BadTopology(format!(
            "Ratios defined {parsed_nodes} nodes, but expected {n_nodes}"
        )));
    }
    assign_layers(&mut stages, &stage_weights, n_layers)?;
    Ok(stages)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_legacy_two_stages() {
        let stages = parse_stage_defs("1,1*1,1", 4, 28).unwrap();
        assert_eq!(stages.len(), 2);
        assert_eq!(stages[0].tp_ratios, vec![1.0, 1.0]);
        assert_eq!(stages[0].n_layers + stages[1].n_layers, 28);
        assert_eq!(stages[0].n_layers, 14);
    }

    #[test]
    fn test_legacy_explicit_layers() {
        let stages = parse_stage_defs("1,1:10*1,1", 4, 28).unwrap();
        assert_eq!(stages[0].n_layers, 10);
        assert_eq!(stages[1].n_layers, 18);
    }

    #[test]
    fn test_at_layer_syntax() {
        let stages = parse_stage_defs("1:1@10*1:1@18", 4, 28).unwrap();
        assert_eq!(stages[0].n_layers, 10);
        assert_eq!(stages[1].n_layers, 18);
    }

    #[test]
    fn test_two_level_form() {
        // Stage weights 1:2; stage 0 nodes 1:1; stage 1 nodes 2:3.
        let stages = parse_stage_defs("1:2*1:1*2:3", 4, 27).unwrap();
        assert_eq!(stages.len(), 2);
        assert_eq!(stages[0].tp_ratios, vec![1.0, 1.0]);
        assert_eq!(stages[1].tp_ratios, vec![2.0, 3.0]);
        assert_eq!(stages[0].n_layers, 9);
        assert_eq!(stages[1].n_layers, 18);
    }

    #[test]
    fn test_node_count_mismatch_message() {
        let err = parse_stage_defs("1,1*1,1", 3, 28).unwrap_err();
        let message = err.to_string();
        assert!(
            message.contains("Ratios defined 4 nodes, but expected 3"),
            "unexpected message: {message}"
        );
    }

    #[test]
    fn test_explicit_layers_overflow() {
        assert!(parse_stage_defs("1,1:20*1,1:20", 4, 28).is_err());
    }

    #[test]
    fn test_single_stage_pure_tp() {
        let stages = parse_stage_defs("1,1", 2, 2).unwrap();
        assert_eq!(stages.len(), 1);
        assert_eq!(stages[0].n_layers, 2);
    }

    #[test]
    fn test_alternate_separators() {
        let a = parse_stage_defs("1,1;1,1", 4, 28).unwrap();
        let b = parse_stage_defs("1,1|1,1", 4, 28).unwrap();
        assert_eq!(a, b);
    }
}
