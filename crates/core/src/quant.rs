//! Float types and block quantization formats.
//!
//! Two block formats are supported besides plain floats: Q40 (4-bit
//! weights, 32 elements per block, shared f16 scale) and Q80 (8-bit,
//! 32 elements per block, shared f16 scale). Any tensor of a quantized
//! type must have its innermost dimension divisible by the block size.

use half::f16;

use crate::error::{CoreError, Result};

/// Elements per quantized block, shared by Q40 and Q80.
pub const Q_BLOCK_SIZE: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FloatType {
    F32,
    F16,
    Q40,
    Q80,
}

/// A 4-bit quantization block: f16 scale + 32 nibbles packed two per byte.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct BlockQ40 {
    pub d: f16,
    pub qs: [u8; Q_BLOCK_SIZE / 2],
}

/// An 8-bit quantization block: f16 scale + 32 signed bytes.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct BlockQ80 {
    pub d: f16,
    pub qs: [i8; Q_BLOCK_SIZE],
}

const _: () = assert!(std::mem::size_of::<BlockQ40>() == 18);
const _: () = assert!(std::mem::size_of::<BlockQ80>() == 34);

impl FloatType {
    /// Elements per block: 1 for float types, 32 for quantized types.
    pub fn block_size(self) -> usize {
        match self {
            FloatType::F32 | FloatType::F16 => 1,
            FloatType::Q40 | FloatType::Q80 => Q_BLOCK_SIZE,
        }
    }

    /// Bytes occupied by one block.
    pub fn block_bytes(self) -> usize {
        match self {
            FloatType::F32 => 4,
            FloatType::F16 => 2,
            FloatType::Q40 => std::mem::size_of::<BlockQ40>(),
            FloatType::Q80 => std::mem::size_of::<BlockQ80>(),
        }
    }

    /// Bytes occupied by `n` elements.
    ///
    /// Panics if `n` is not block-aligned for a quantized type; that is
    /// a graph-construction bug, not a runtime condition.
    pub fn bytes_for(self, n: usize) -> usize {
        let block = self.block_size();
        assert!(
            n % block == 0,
            "{n} elements not aligned to {block}-element blocks of {self:?}"
        );
        (n / block) * self.block_bytes()
    }

    /// Elements represented by `n_bytes`; the inverse of
    /// [`FloatType::bytes_for`].
    pub fn elements_for(self, n_bytes: usize) -> usize {
        let block_bytes = self.block_bytes();
        assert!(
            n_bytes % block_bytes == 0,
            "{n_bytes} bytes not aligned to {block_bytes}-byte blocks of {self:?}"
        );
        (n_bytes / block_bytes) * self.block_size()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FloatType::F32 => "f32",
            FloatType::F16 => "f16",
            FloatType::Q40 => "q40",
            FloatType::Q80 => "q80",
        }
    }

    pub fn to_wire(self) -> u32 {
        match self {
            FloatType::F32 => 0,
            FloatType::F16 => 1,
            FloatType::Q40 => 2,
            FloatType::Q80 => 3,
        }
    }

    pub fn from_wire(value: u32) -> Result<Self> {
        match value {
            0 => Ok(FloatType::F32),
            1 => Ok(FloatType::F16),
            2 => Ok(FloatType::Q40),
            3 => Ok(FloatType::Q80),
            other => Err(CoreError::UnknownFloatType(other)),
        }
    }
}

impl std::str::FromStr for FloatType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "f32" => Ok(FloatType::F32),
            "f16" => Ok(FloatType::F16),
            "q40" => Ok(FloatType::Q40),
            "q80" => Ok(FloatType::Q80),
            _ => Err(CoreError::BadTopology(format!("Invalid float type: {s}"))),
        }
    }
}

/// The `<input>_<weight>_<output>` combination an op kernel is compiled
/// for. Weightless ops collapse the middle slot to the input type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpQuantType {
    F32F32F32,
    F32Q40F32,
    F32Q40Q80,
    F32F32Q80,
    Q80Q80Q80,
    Q80Q80F32,
    Q80Q40F32,
    Q80F32F32,
}

impl OpQuantType {
    pub fn as_str(self) -> &'static str {
        match self {
            OpQuantType::F32F32F32 => "f32_f32_f32",
            OpQuantType::F32Q40F32 => "f32_q40_f32",
            OpQuantType::F32Q40Q80 => "f32_q40_q80",
            OpQuantType::F32F32Q80 => "f32_f32_q80",
            OpQuantType::Q80Q80Q80 => "q80_q80_q80",
            OpQuantType::Q80Q80F32 => "q80_q80_f32",
            OpQuantType::Q80Q40F32 => "q80_q40_f32",
            OpQuantType::Q80F32F32 => "q80_f32_f32",
        }
    }
}

/// Resolves the quant combination for an op. `weight = None` means the
/// op carries no weights and the combination is `<input>_<input>_<output>`.
pub fn op_quant_type(
    input: FloatType,
    weight: Option<FloatType>,
    output: FloatType,
) -> Result<OpQuantType> {
    use FloatType::*;
    match (input, output) {
        (F32, F32) => match weight {
            None | Some(F32) => return Ok(OpQuantType::F32F32F32),
            Some(Q40) => return Ok(OpQuantType::F32Q40F32),
            _ => {}
        },
        (F32, Q80) => match weight {
            None | Some(F32) => return Ok(OpQuantType::F32F32Q80),
            Some(Q40) => return Ok(OpQuantType::F32Q40Q80),
            _ => {}
        },
        (Q80, F32) => match weight {
            None | Some(Q80) => return Ok(OpQuantType::Q80Q80F32),
            Some(F32) => return Ok(OpQuantType::Q80F32F32),
            Some(Q40) => return Ok(OpQuantType::Q80Q40F32),
            _ => {}
        },
        (Q80, Q80) => {
            if matches!(weight, None | Some(Q80)) {
                return Ok(OpQuantType::Q80Q80Q80);
            }
        }
        _ => {}
    }
    Err(CoreError::UnsupportedQuant {
        input: input.as_str(),
        weight: weight.map_or("-", FloatType::as_str),
        output: output.as_str(),
    })
}

/// Quantizes one row of f32 values into Q80 blocks.
pub fn quantize_q80_row(src: &[f32], dst: &mut [BlockQ80]) {
    assert_eq!(src.len(), dst.len() * Q_BLOCK_SIZE);
    for (block_index, block) in dst.iter_mut().enumerate() {
        let chunk = &src[block_index * Q_BLOCK_SIZE..(block_index + 1) * Q_BLOCK_SIZE];
        let max_abs = chunk.iter().fold(0.0f32, |acc, v| acc.max(v.abs()));
        let d = max_abs / 127.0;
        let inv = if d > 0.0 { 1.0 / d } else { 0.0 };
        block.d = f16::from_f32(d);
        for (q, &v) in block.qs.iter_mut().zip(chunk) {
            *q = (v * inv).round().clamp(-127.0, 127.0) as i8;
        }
    }
}

/// Dequantizes Q80 blocks into one row of f32 values.
pub fn dequantize_q80_row(src: &[BlockQ80], dst: &mut [f32]) {
    assert_eq!(dst.len(), src.len() * Q_BLOCK_SIZE);
    for (block_index, block) in src.iter().enumerate() {
        let d = block.d.to_f32();
        let out = &mut dst[block_index * Q_BLOCK_SIZE..(block_index + 1) * Q_BLOCK_SIZE];
        for (o, &q) in out.iter_mut().zip(block.qs.iter()) {
            *o = q as f32 * d;
        }
    }
}

/// Dequantizes Q40 blocks into one row of f32 values.
pub fn dequantize_q40_row(src: &[BlockQ40], dst: &mut [f32]) {
    assert_eq!(dst.len(), src.len() * Q_BLOCK_SIZE);
    for (block_index, block) in src.iter().enumerate() {
        let d = block.d.to_f32();
        let out = &mut dst[block_index * Q_BLOCK_SIZE..(block_index + 1) * Q_BLOCK_SIZE];
        for j in 0..Q_BLOCK_SIZE / 2 {
            let byte = block.qs[j];
            out[j] = ((byte & 0x0F) as i32 - 8) as f32 * d;
            out[j + Q_BLOCK_SIZE / 2] = ((byte >> 4) as i32 - 8) as f32 * d;
        }
    }
}

/// Quantizes one row of f32 values into Q40 blocks.
pub fn quantize_q40_row(src: &[f32], dst: &mut [BlockQ40]) {
    assert_eq!(src.len(), dst.len() * Q_BLOCK_SIZE);
    for (block_index, block) in dst.iter_mut().enumerate() {
        let chunk = &src[block_index * Q_BLOCK_SIZE..(block_index + 1) * Q_BLOCK_SIZE];
        let max_abs = chunk.iter().fold(0.0f32, |acc, v| acc.max(v.abs()));
        let d = max_abs / 8.0;
        let inv = if d > 0.0 { 1.0 / d } else { 0.0 };
        block.d = f16::from_f32(d);
        for j in 0..Q_BLOCK_SIZE / 2 {
            let lo = (chunk[j] * inv + 8.5).clamp(0.0, 15.0) as u8;
            let hi = (chunk[j + Q_BLOCK_SIZE / 2] * inv + 8.5).clamp(0.0, 15.0) as u8;
            block.qs[j] = lo | (hi << 4);
        }
    }
}

/// Reinterprets a byte slice as Q80 blocks. The slice must be exactly
/// block-sized; alignment is guaranteed by the 64-byte buffer allocator.
pub fn q80_blocks(bytes: &[u8]) -> &[BlockQ80] {
    assert_eq!(bytes.len() % std::mem::size_of::<BlockQ80>(), 0);
    unsafe {
        std::slice::from_raw_parts(
            bytes.as_ptr() as *const BlockQ80,
            bytes.len() / std::mem::size_of::<BlockQ80>(),
        )
    }
}

pub fn q80_blocks_mut(bytes: &mut [u8]) -> &mut [BlockQ80] {
    assert_eq!(bytes.len() % std::mem::size_of::<BlockQ80>(), 0);
    unsafe {
        std::slice::from_raw_parts_mut(
            bytes.as_mut_ptr() as *mut BlockQ80,
            bytes.len() / std::mem::size_of::<BlockQ80>(),
        )
    }
}

pub fn q40_blocks(bytes: &[u8]) -> &[BlockQ40] {
    assert_eq!(bytes.len() % std::mem::size_of::<BlockQ40>(), 0);
    unsafe {
        std::slice::from_raw_parts(
            bytes.as_ptr() as *const BlockQ40,
            bytes.len() / std::mem::size_of::<BlockQ40>(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bytes_for_float_types() {
        assert_eq!(FloatType::F32.bytes_for(64), 256);
        assert_eq!(FloatType::F16.bytes_for(64), 128);
        assert_eq!(FloatType::Q40.bytes_for(64), 36);
        assert_eq!(FloatType::Q80.bytes_for(64), 68);
    }

    #[test]
    #[should_panic]
    fn test_quantized_bytes_require_block_alignment() {
        FloatType::Q40.bytes_for(31);
    }

    #[test]
    fn test_q80_roundtrip_close() {
        let src: Vec<f32> = (0..64).map(|i| (i as f32 - 32.0) * 0.37).collect();
        let mut blocks = vec![
            BlockQ80 {
                d: f16::from_f32(0.0),
                qs: [0; Q_BLOCK_SIZE]
            };
            2
        ];
        let mut out = vec![0.0f32; 64];
        quantize_q80_row(&src, &mut blocks);
        dequantize_q80_row(&blocks, &mut out);
        for (a, b) in src.iter().zip(out.iter()) {
            assert!((a - b).abs() < 0.1, "{a} vs {b}");
        }
    }

    #[test]
    fn test_op_quant_resolution() {
        assert_eq!(
            op_quant_type(FloatType::F32, None, FloatType::F32).unwrap(),
            OpQuantType::F32F32F32
        );
        assert_eq!(
            op_quant_type(FloatType::Q80, Some(FloatType::Q40), FloatType::F32).unwrap(),
            OpQuantType::Q80Q40F32
        );
        assert!(op_quant_type(FloatType::F16, None, FloatType::F32).is_err());
    }
}
