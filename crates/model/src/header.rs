//! Model file header.
//!
//! Layout: `magic: u32`, `header_size: u32` (bytes, including these
//! eight), then `(header_size - 8) / 8` little-endian `(key, value)`
//! i32 pairs. The tensor stream starts at byte `header_size` and runs
//! to the end of the file.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use byteorder::{ByteOrder, LittleEndian};

use latticelm_core::rope::{RopeScaling, RopeType};
use latticelm_core::FloatType;

use crate::error::{ModelError, Result};

pub const MODEL_MAGIC: u32 = 0x0A00_ABCD;
/// Obsolete format magics, rejected with a dedicated message.
const OBSOLETE_MAGICS: [u32; 2] = [0x00AB_CD00, 0x00AB_CD01];

mod keys {
    pub const VERSION: i32 = 0;
    pub const ARCH_TYPE: i32 = 1;
    pub const DIM: i32 = 2;
    pub const HIDDEN_DIM: i32 = 3;
    pub const N_LAYERS: i32 = 4;
    pub const N_HEADS: i32 = 5;
    pub const N_KV_HEADS: i32 = 6;
    pub const N_EXPERTS: i32 = 7;
    pub const N_ACTIVE_EXPERTS: i32 = 8;
    pub const VOCAB_SIZE: i32 = 9;
    pub const SEQ_LEN: i32 = 10;
    pub const HIDDEN_ACT: i32 = 11;
    pub const ROPE_THETA: i32 = 12;
    pub const WEIGHT_FLOAT_TYPE: i32 = 13;
    pub const ROPE_SCALING_FACTOR: i32 = 14;
    pub const ROPE_SCALING_LOW_FREQ_FACTOR: i32 = 15;
    pub const ROPE_SCALING_HIGH_FREQ_FACTOR: i32 = 16;
    pub const ROPE_SCALING_ORIG_MAX_SEQ_LEN: i32 = 17;
    pub const ROPE_TYPE: i32 = 18;
    pub const HEAD_DIM: i32 = 19;
    pub const NORM_EPSILON: i32 = 20;
    pub const MOE_HIDDEN_DIM: i32 = 21;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchType {
    Llama,
    Qwen3,
    Qwen3Moe,
}

impl ArchType {
    pub fn as_str(self) -> &'static str {
        match self {
            ArchType::Llama => "Llama",
            ArchType::Qwen3 => "Qwen3",
            ArchType::Qwen3Moe => "Qwen3 MoE",
        }
    }

    /// Qwen-family models carry per-head Q/K norms and NeoX rotation.
    pub fn is_qwen(self) -> bool {
        matches!(self, ArchType::Qwen3 | ArchType::Qwen3Moe)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HiddenAct {
    Gelu,
    Silu,
}

/// Decoded header plus derived dimensions.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelHeader {
    pub version: u32,
    pub arch: ArchType,
    pub dim: u32,
    pub hidden_dim: u32,
    pub n_layers: u32,
    pub n_heads: u32,
    pub n_kv_heads: u32,
    pub n_experts: u32,
    pub n_active_experts: u32,
    pub vocab_size: u32,
    /// Effective sequence length, possibly capped by the CLI.
    pub seq_len: u32,
    pub orig_seq_len: u32,
    pub hidden_act: HiddenAct,
    pub rope_type: RopeType,
    pub rope_theta: f32,
    pub rope_scaling: RopeScaling,
    pub norm_epsilon: f32,
    pub moe_hidden_dim: u32,
    pub head_dim: u32,
    pub q_dim: u32,
    pub kv_dim: u32,
    pub weight_type: FloatType,
    /// Float type of inter-node transfer buffers.
    pub sync_type: FloatType,
    pub header_size: usize,
    pub file_size: usize,
}

fn convert_norm_epsilon(value: i32) -> Result<f32> {
    match value {
        5 => Ok(1e-5),
        6 => Ok(1e-6),
        other => Err(ModelError::UnsupportedModel(format!(
            "unsupported norm epsilon code {other}"
        ))),
    }
}

impl ModelHeader {
    /// Reads and validates the header. `max_seq_len == 0` keeps the
    /// model's own sequence length.
    pub fn load(path: &Path, max_seq_len: u32, sync_type: FloatType) -> Result<Self> {
        let mut file = File::open(path).map_err(|e| {
            ModelError::UnsupportedModel(format!("cannot open model file {path:?}: {e}"))
        })?;
        let file_size = file.metadata()?.len() as usize;

        let mut word = [0u8; 4];
        file.read_exact(&mut word)?;
        let magic = LittleEndian::read_u32(&word);
        if OBSOLETE_MAGICS.contains(&magic) {
            return Err(ModelError::UnsupportedModel(
                "old model format is not supported".into(),
            ));
        }
        if magic != MODEL_MAGIC {
            return Err(ModelError::UnsupportedModel(format!(
                "unsupported magic number 0x{magic:08X}"
            )));
        }

        file.read_exact(&mut word)?;
        let header_size = LittleEndian::read_u32(&word) as usize;
        if header_size < 8 || (header_size - 8) % 8 != 0 || header_size > file_size {
            return Err(ModelError::UnsupportedModel(format!(
                "invalid header size {header_size}"
            )));
        }
        let mut kv_bytes = vec![0u8; header_size - 8];
        file.read_exact(&mut kv_bytes)?;

        let mut version = 0u32;
        let mut arch = None;
        let mut dim = 0u32;
        let mut hidden_dim = 0u32;
        let mut n_layers = 0u32;
        let mut n_heads = 0u32;
        let mut n_kv_heads = 0u32;
        let mut n_experts = 0u32;
        let mut n_active_experts = 0u32;
        let mut vocab_size = 0u32;
        let mut seq_len = 0u32;
        let mut hidden_act = HiddenAct::Silu;
        let mut rope_type = RopeType::Llama;
        let mut rope_theta = 10_000.0f32;
        let mut rope_scaling = RopeScaling::default();
        let mut norm_epsilon = 1e-5f32;
        let mut moe_hidden_dim = 0u32;
        let mut head_dim = 0u32;
        let mut weight_type = None;

        for pair in kv_bytes.chunks_exact(8) {
            let key = LittleEndian::read_i32(&pair[0..4]);
            let value = LittleEndian::read_i32(&pair[4..8]);
            match key {
                keys::VERSION => version = value as u32,
                keys::ARCH_TYPE => {
                    arch = Some(match value {
                        0 => ArchType::Llama,
                        1 => ArchType::Qwen3,
                        2 => ArchType::Qwen3Moe,
                        other => {
                            return Err(ModelError::UnsupportedModel(format!(
                                "unsupported architecture {other}"
                            )))
                        }
                    })
                }
                keys::DIM => dim = value as u32,
                keys::HIDDEN_DIM => hidden_dim = value as u32,
                keys::N_LAYERS => n_layers = value as u32,
                keys::N_HEADS => n_heads = value as u32,
                keys::N_KV_HEADS => n_kv_heads = value as u32,
                keys::N_EXPERTS => n_experts = value as u32,
                keys::N_ACTIVE_EXPERTS => n_active_experts = value as u32,
                keys::VOCAB_SIZE => vocab_size = value as u32,
                keys::SEQ_LEN => seq_len = value as u32,
                keys::HIDDEN_ACT => {
                    hidden_act = match value {
                        0 => HiddenAct::Gelu,
                        1 => HiddenAct::Silu,
                        other => {
                            return Err(ModelError::UnsupportedModel(format!(
                                "unsupported hidden activation {other}"
                            )))
                        }
                    }
                }
                keys::ROPE_THETA => rope_theta = value as f32,
                keys::WEIGHT_FLOAT_TYPE => {
                    weight_type = Some(FloatType::from_wire(value as u32).map_err(|_| {
                        ModelError::UnsupportedModel(format!("unsupported weight type {value}"))
                    })?)
                }
                keys::ROPE_SCALING_FACTOR => rope_scaling.factor = value as f32,
                keys::ROPE_SCALING_LOW_FREQ_FACTOR => {
                    rope_scaling.low_freq_factor = value as f32
                }
                keys::ROPE_SCALING_HIGH_FREQ_FACTOR => {
                    rope_scaling.high_freq_factor = value as f32
                }
                keys::ROPE_SCALING_ORIG_MAX_SEQ_LEN => {
                    rope_scaling.orig_max_seq_len = value as u32
                }
                keys::ROPE_TYPE => {
                    rope_type = RopeType::from_wire(value as u32).ok_or_else(|| {
                        ModelError::UnsupportedModel(format!("unsupported rope type {value}"))
                    })?
                }
                keys::HEAD_DIM => head_dim = value as u32,
                keys::NORM_EPSILON => norm_epsilon = convert_norm_epsilon(value)?,
                keys::MOE_HIDDEN_DIM => moe_hidden_dim = value as u32,
                other => {
                    return Err(ModelError::UnsupportedModel(format!(
                        "unsupported header key {other}"
                    )))
                }
            }
        }

        let arch = arch
            .ok_or_else(|| ModelError::UnsupportedModel("model does not specify arch".into()))?;
        let weight_type = weight_type.ok_or_else(|| {
            ModelError::UnsupportedModel("model does not specify weight type".into())
        })?;

        let orig_seq_len = seq_len;
        if max_seq_len > 0 && seq_len > max_seq_len {
            seq_len = max_seq_len;
        }
        if head_dim == 0 {
            head_dim = dim / n_heads;
        }
        if arch.is_qwen() {
            rope_type = RopeType::Falcon;
        }

        Ok(ModelHeader {
            version,
            arch,
            dim,
            hidden_dim,
            n_layers,
            n_heads,
            n_kv_heads,
            n_experts,
            n_active_experts,
            vocab_size,
            seq_len,
            orig_seq_len,
            hidden_act,
            rope_type,
            rope_theta,
            rope_scaling,
            norm_epsilon,
            moe_hidden_dim,
            head_dim,
            q_dim: head_dim * n_heads,
            kv_dim: head_dim * n_kv_heads,
            weight_type,
            sync_type,
            header_size,
            file_size,
        })
    }

    /// FFN width used by the per-layer projections; MoE models use the
    /// expert hidden dim.
    pub fn ffn_dim(&self) -> u32 {
        if self.arch == ArchType::Qwen3Moe {
            self.moe_hidden_dim
        } else {
            self.hidden_dim
        }
    }

    pub fn dims(&self) -> latticelm_core::plan::ModelDims {
        latticelm_core::plan::ModelDims {
            n_layers: self.n_layers,
            n_heads: self.n_heads,
            n_kv_heads: self.n_kv_heads,
            vocab_size: self.vocab_size,
            ffn_dim: self.ffn_dim(),
            dim: self.dim,
        }
    }

    pub fn log_summary(&self) {
        tracing::info!(arch = self.arch.as_str(), "model architecture");
        tracing::info!(
            dim = self.dim,
            head_dim = self.head_dim,
            q_dim = self.q_dim,
            kv_dim = self.kv_dim,
            hidden_dim = self.hidden_dim,
            vocab = self.vocab_size,
            layers = self.n_layers,
            heads = self.n_heads,
            kv_heads = self.n_kv_heads,
            seq_len = self.seq_len,
            "model dimensions"
        );
        if self.n_experts > 0 {
            tracing::info!(
                experts = self.n_experts,
                active = self.n_active_experts,
                moe_hidden = self.moe_hidden_dim,
                "mixture of experts"
            );
        }
    }
}

/// Helper for tests and tools: serializes a header block.
pub fn encode_header(pairs: &[(i32, i32)]) -> Vec<u8> {
    let header_size = 8 + pairs.len() * 8;
    let mut out = Vec::with_capacity(header_size);
    out.extend_from_slice(&MODEL_MAGIC.to_le_bytes());
    out.extend_from_slice(&(header_size as u32).to_le_bytes());
    for &(key, value) in pairs {
        out.extend_from_slice(&key.to_le_bytes());
        out.extend_from_slice(&value.to_le_bytes());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_model(pairs: &[(i32, i32)], tensor_bytes: usize) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&encode_header(pairs)).unwrap();
        file.write_all(&vec![0u8; tensor_bytes]).unwrap();
        file.flush().unwrap();
        file
    }

    fn base_pairs() -> Vec<(i32, i32)> {
        vec![
            (keys::VERSION, 1),
            (keys::ARCH_TYPE, 0),
            (keys::DIM, 8),
            (keys::HIDDEN_DIM, 16),
            (keys::N_LAYERS, 2),
            (keys::N_HEADS, 2),
            (keys::N_KV_HEADS, 2),
            (keys::VOCAB_SIZE, 32),
            (keys::SEQ_LEN, 16),
            (keys::WEIGHT_FLOAT_TYPE, 0),
        ]
    }

    #[test]
    fn test_header_roundtrip() {
        let file = write_model(&base_pairs(), 64);
        let header = ModelHeader::load(file.path(), 0, FloatType::F32).unwrap();
        assert_eq!(header.dim, 8);
        assert_eq!(header.head_dim, 4);
        assert_eq!(header.q_dim, 8);
        assert_eq!(header.kv_dim, 8);
        assert_eq!(header.seq_len, 16);
        assert_eq!(header.weight_type, FloatType::F32);
    }

    #[test]
    fn test_bad_magic_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&0xDEADBEEFu32.to_le_bytes()).unwrap();
        file.write_all(&8u32.to_le_bytes()).unwrap();
        file.flush().unwrap();
        assert!(matches!(
            ModelHeader::load(file.path(), 0, FloatType::F32),
            Err(ModelError::UnsupportedModel(_))
        ));
    }

    #[test]
    fn test_obsolete_magic_message() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&0x00ABCD00u32.to_le_bytes()).unwrap();
        file.flush().unwrap();
        let err = ModelHeader::load(file.path(), 0, FloatType::F32).unwrap_err();
        assert!(err.to_string().contains("old model format"));
    }

    #[test]
    fn test_unknown_key_fails() {
        let mut pairs = base_pairs();
        pairs.push((99, 7));
        let file = write_model(&pairs, 64);
        assert!(ModelHeader::load(file.path(), 0, FloatType::F32).is_err());
    }

    #[test]
    fn test_max_seq_len_caps() {
        let file = write_model(&base_pairs(), 64);
        let header = ModelHeader::load(file.path(), 4, FloatType::F32).unwrap();
        assert_eq!(header.seq_len, 4);
        assert_eq!(header.orig_seq_len, 16);
    }
}
