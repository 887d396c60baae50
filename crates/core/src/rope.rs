//! RoPE rotation tables.
//!
//! The cache holds cos/sin pairs for every position of the node's
//! rotated dimension range so the rotation kernel is a table lookup.

use crate::slice::RopeSlice;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RopeType {
    Llama,
    /// NeoX-style half rotation (Qwen family).
    Falcon,
    /// Llama with 3.1 frequency scaling.
    Llama31,
}

impl RopeType {
    pub fn to_wire(self) -> u32 {
        match self {
            RopeType::Llama => 0,
            RopeType::Falcon => 1,
            RopeType::Llama31 => 2,
        }
    }

    pub fn from_wire(value: u32) -> Option<Self> {
        match value {
            0 => Some(RopeType::Llama),
            1 => Some(RopeType::Falcon),
            2 => Some(RopeType::Llama31),
            _ => None,
        }
    }
}

/// Llama 3.1 frequency scaling parameters. `factor == 1.0` disables
/// scaling.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RopeScaling {
    pub factor: f32,
    pub low_freq_factor: f32,
    pub high_freq_factor: f32,
    pub orig_max_seq_len: u32,
}

impl Default for RopeScaling {
    fn default() -> Self {
        RopeScaling {
            factor: 1.0,
            low_freq_factor: 1.0,
            high_freq_factor: 1.0,
            orig_max_seq_len: 0,
        }
    }
}

fn scale_frequency(freq: f32, scaling: &RopeScaling) -> f32 {
    let wave_len = 2.0 * std::f32::consts::PI / freq;
    let high_freq_wavelen = scaling.orig_max_seq_len as f32 / scaling.high_freq_factor;
    if wave_len < high_freq_wavelen {
        return freq;
    }
    let low_freq_wavelen = scaling.orig_max_seq_len as f32 / scaling.low_freq_factor;
    if wave_len > low_freq_wavelen {
        return freq / scaling.factor;
    }
    let smooth = (scaling.orig_max_seq_len as f32 / wave_len - scaling.low_freq_factor)
        / (scaling.high_freq_factor - scaling.low_freq_factor);
    (1.0 - smooth) * freq / scaling.factor + smooth * freq
}

fn fill_llama_cache(slice: &RopeSlice, scaling: &RopeScaling, cache: &mut [f32]) {
    let apply_scaling = scaling.factor != 1.0;
    let q_dim_end = slice.q_dim_start + slice.q_dim_len;
    for pos in 0..slice.seq_len {
        let mut i = slice.kv_dim_start;
        while i < q_dim_end {
            let h = i % slice.head_dim;
            let mut freq = 1.0 / slice.rope_theta.powf(h as f32 / slice.head_dim as f32);
            if apply_scaling {
                freq = scale_frequency(freq, scaling);
            }
            let val = pos as f32 * freq;
            let base = (pos * slice.slice_dim + (i - slice.kv_dim_start)) as usize;
            cache[base] = val.cos();
            cache[base + 1] = val.sin();
            i += 2;
        }
    }
}

fn fill_falcon_cache(slice: &RopeSlice, cache: &mut [f32]) {
    let half = slice.head_dim / 2;
    for pos in 0..slice.seq_len {
        for j in 0..half {
            let freq =
                1.0 / slice
                    .rope_theta
                    .powf(2.0 * j as f32 / slice.head_dim as f32);
            let val = pos as f32 * freq;
            let base = (pos * slice.head_dim) as usize;
            cache[base + j as usize] = val.cos();
            cache[base + (j + half) as usize] = val.sin();
        }
    }
}

/// Fills the rotation cache for one node. `cache` must hold
/// `slice.cache_size.len` floats.
pub fn fill_rope_cache(
    kind: RopeType,
    slice: &RopeSlice,
    scaling: &RopeScaling,
    cache: &mut [f32],
) {
    assert_eq!(cache.len(), slice.cache_size.len);
    match kind {
        RopeType::Llama | RopeType::Llama31 => fill_llama_cache(slice, scaling, cache),
        RopeType::Falcon => fill_falcon_cache(slice, cache),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{ModelDims, PartitionPlan};

    #[test]
    fn test_llama_cache_first_position_is_identity() {
        let plan = PartitionPlan::uniform(
            1,
            ModelDims {
                n_layers: 1,
                n_heads: 2,
                n_kv_heads: 2,
                vocab_size: 32,
                ffn_dim: 32,
                dim: 8,
            },
        )
        .unwrap();
        let slice = RopeSlice::new(RopeType::Llama, 4, 8, 2, 4, 10000.0, &plan, 0);
        let mut cache = vec![0.0f32; slice.cache_size.len];
        fill_rope_cache(RopeType::Llama, &slice, &RopeScaling::default(), &mut cache);
        // Position 0 rotates by zero: cos 1, sin 0.
        for pair in cache[..slice.slice_dim as usize].chunks(2) {
            assert!((pair[0] - 1.0).abs() < 1e-6);
            assert!(pair[1].abs() < 1e-6);
        }
    }

    #[test]
    fn test_falcon_cache_layout() {
        let plan = PartitionPlan::uniform(
            1,
            ModelDims {
                n_layers: 1,
                n_heads: 2,
                n_kv_heads: 2,
                vocab_size: 32,
                ffn_dim: 32,
                dim: 8,
            },
        )
        .unwrap();
        let slice = RopeSlice::new(RopeType::Falcon, 4, 8, 2, 4, 10000.0, &plan, 0);
        let mut cache = vec![0.0f32; slice.cache_size.len];
        fill_rope_cache(RopeType::Falcon, &slice, &RopeScaling::default(), &mut cache);
        // cos at [0, half), sin at [half, head_dim) per position.
        assert!((cache[0] - 1.0).abs() < 1e-6);
        assert!(cache[2].abs() < 1e-6);
    }
}
