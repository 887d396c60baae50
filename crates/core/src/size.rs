//! Tensor extents with derived byte counts.

use crate::quant::FloatType;

/// A (z, y, x) tensor extent. Byte counts are derived once from the
/// triple and the float type so that every consumer agrees on sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TensorSize {
    pub float_type: FloatType,
    pub z: u32,
    pub y: u32,
    pub x: u32,
    /// Total number of elements (`z * y * x`).
    pub len: usize,
    /// Total byte count.
    pub n_bytes: usize,
    /// Bytes per z-plane (`y * x` elements).
    pub n_bytes_xy: usize,
}

impl TensorSize {
    pub fn d3(float_type: FloatType, z: u32, y: u32, x: u32) -> Self {
        let len = z as usize * y as usize * x as usize;
        let len_xy = y as usize * x as usize;
        TensorSize {
            float_type,
            z,
            y,
            x,
            len,
            n_bytes: float_type.bytes_for(len),
            n_bytes_xy: float_type.bytes_for(len_xy),
        }
    }

    pub fn d2(float_type: FloatType, y: u32, x: u32) -> Self {
        Self::d3(float_type, 1, y, x)
    }

    pub fn d1(float_type: FloatType, x: u32) -> Self {
        Self::d3(float_type, 1, 1, x)
    }

    /// The empty size used by weightless ops.
    pub fn zero() -> Self {
        Self::d3(FloatType::F32, 0, 0, 0)
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Bytes per row (`x` elements).
    pub fn row_bytes(&self) -> usize {
        self.float_type.bytes_for(self.x as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derived_byte_counts() {
        let s = TensorSize::d3(FloatType::F32, 2, 3, 4);
        assert_eq!(s.len, 24);
        assert_eq!(s.n_bytes, 96);
        assert_eq!(s.n_bytes_xy, 48);
        assert_eq!(s.row_bytes(), 16);
    }

    #[test]
    fn test_quantized_size() {
        let s = TensorSize::d2(FloatType::Q80, 2, 64);
        assert_eq!(s.n_bytes, 2 * 2 * 34);
    }
}
