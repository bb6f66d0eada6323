//! Element types for GEMM operands and collective buffers

use std::fmt;
use std::str::FromStr;

use bytemuck::{Pod, Zeroable};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Largest finite magnitude representable in FP8 E4M3.
pub const FP8_E4M3_MAX: f32 = 448.0;

/// Supported element types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    /// 32-bit floating point
    F32,
    /// 16-bit floating point (IEEE 754)
    F16,
    /// Brain floating point (16-bit)
    BF16,
    /// 8-bit floating point, 4 exponent bits, 3 mantissa bits
    F8E4M3,
}

impl DType {
    /// Size of the dtype in bytes
    #[must_use]
    pub const fn size_in_bytes(self) -> usize {
        match self {
            Self::F32 => 4,
            Self::F16 | Self::BF16 => 2,
            Self::F8E4M3 => 1,
        }
    }

    /// Whether this is an 8-bit float that needs a scale to recover range.
    #[must_use]
    pub const fn is_fp8(self) -> bool {
        matches!(self, Self::F8E4M3)
    }

    /// Whether this is a 16-bit float.
    #[must_use]
    pub const fn is_16bit(self) -> bool {
        matches!(self, Self::F16 | Self::BF16)
    }

    /// Relative tolerance when comparing against an fp32/f64 reference.
    #[must_use]
    pub const fn tolerance(self) -> f32 {
        match self {
            Self::F32 => 1e-5,
            Self::F16 => 1e-2,
            Self::BF16 => 3e-2,
            Self::F8E4M3 => 1.25e-1,
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::F32 => write!(f, "f32"),
            Self::F16 => write!(f, "f16"),
            Self::BF16 => write!(f, "bf16"),
            Self::F8E4M3 => write!(f, "f8e4m3"),
        }
    }
}

impl FromStr for DType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "f32" | "fp32" | "float32" => Ok(Self::F32),
            "f16" | "fp16" | "float16" => Ok(Self::F16),
            "bf16" | "bfloat16" => Ok(Self::BF16),
            "f8e4m3" | "fp8" | "e4m3" => Ok(Self::F8E4M3),
            other => Err(Error::invalid(format!("unknown dtype '{other}'"))),
        }
    }
}

/// Trait for types that can be stored in device buffers
pub trait TensorDType: Pod + Default + Send + Sync + 'static {
    /// The corresponding `DType` enum value
    const DTYPE: DType;

    /// Widen to f32 for accumulation.
    fn to_f32(self) -> f32;

    /// Narrow from an f32 accumulator (round to nearest even).
    fn from_f32(value: f32) -> Self;
}

impl TensorDType for f32 {
    const DTYPE: DType = DType::F32;

    fn to_f32(self) -> f32 {
        self
    }

    fn from_f32(value: f32) -> Self {
        value
    }
}

impl TensorDType for half::f16 {
    const DTYPE: DType = DType::F16;

    fn to_f32(self) -> f32 {
        half::f16::to_f32(self)
    }

    fn from_f32(value: f32) -> Self {
        half::f16::from_f32(value)
    }
}

impl TensorDType for half::bf16 {
    const DTYPE: DType = DType::BF16;

    fn to_f32(self) -> f32 {
        half::bf16::to_f32(self)
    }

    fn from_f32(value: f32) -> Self {
        half::bf16::from_f32(value)
    }
}

/// FP8 E4M3 value stored as its raw byte.
///
/// Bias 7, no infinities, `0x7f`/`0xff` are NaN. Conversions saturate at
/// [`FP8_E4M3_MAX`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(transparent)]
pub struct F8E4M3(pub u8);

impl TensorDType for F8E4M3 {
    const DTYPE: DType = DType::F8E4M3;

    fn to_f32(self) -> f32 {
        fp8_e4m3_decode(self.0)
    }

    fn from_f32(value: f32) -> Self {
        Self(fp8_e4m3_encode(value))
    }
}

/// Encode an f32 to FP8 E4M3 with round-to-nearest-even and saturation.
#[must_use]
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_possible_wrap
)]
pub fn fp8_e4m3_encode(value: f32) -> u8 {
    if value.is_nan() {
        return 0x7f;
    }
    let sign: u8 = if value.is_sign_negative() { 0x80 } else { 0 };
    let abs = value.abs().min(FP8_E4M3_MAX);

    // Subnormals: exponent field 0, value = m * 2^-9. A rounded mantissa of 8
    // lands exactly on the smallest normal encoding (0x08).
    if abs < 2f32.powi(-6) {
        let m = (abs * 2f32.powi(9)).round_ties_even() as u8;
        return sign | m;
    }

    let exp = abs.log2().floor() as i32;
    let frac = abs / 2f32.powi(exp) - 1.0;
    let mut mantissa = (frac * 8.0).round_ties_even() as u32;
    let mut biased = exp + 7;
    if mantissa == 8 {
        mantissa = 0;
        biased += 1;
    }
    // 0x7f is NaN: the largest finite encoding is exponent 15, mantissa 6 (448).
    if biased > 15 || (biased == 15 && mantissa > 6) {
        biased = 15;
        mantissa = 6;
    }
    sign | ((biased as u8) << 3) | mantissa as u8
}

/// Decode an FP8 E4M3 byte to f32.
#[must_use]
pub fn fp8_e4m3_decode(byte: u8) -> f32 {
    let sign = if byte & 0x80 != 0 { -1.0 } else { 1.0 };
    let exp = i32::from((byte >> 3) & 0x0f);
    let mantissa = f32::from(byte & 0x07);
    if exp == 15 && byte & 0x07 == 7 {
        return f32::NAN;
    }
    if exp == 0 {
        sign * mantissa * 2f32.powi(-9)
    } else {
        sign * (1.0 + mantissa / 8.0) * 2f32.powi(exp - 7)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dtype_size_in_bytes() {
        assert_eq!(DType::F32.size_in_bytes(), 4);
        assert_eq!(DType::F16.size_in_bytes(), 2);
        assert_eq!(DType::BF16.size_in_bytes(), 2);
        assert_eq!(DType::F8E4M3.size_in_bytes(), 1);
    }

    #[test]
    fn test_dtype_from_str() {
        assert_eq!("fp16".parse::<DType>().unwrap(), DType::F16);
        assert_eq!("BF16".parse::<DType>().unwrap(), DType::BF16);
        assert_eq!("e4m3".parse::<DType>().unwrap(), DType::F8E4M3);
        assert!("i32".parse::<DType>().is_err());
    }

    #[test]
    fn test_dtype_display_matches_serde() {
        for dtype in [DType::F32, DType::F16, DType::BF16, DType::F8E4M3] {
            let json = serde_json::to_string(&dtype).unwrap();
            assert_eq!(json, format!("\"{dtype}\""));
        }
    }

    #[test]
    fn test_fp8_exact_values() {
        for v in [0.0f32, 1.0, -1.0, 0.5, 1.75, 448.0, -448.0, 2f32.powi(-9)] {
            assert_eq!(fp8_e4m3_decode(fp8_e4m3_encode(v)), v, "value {v}");
        }
    }

    #[test]
    fn test_fp8_saturates_and_nan() {
        assert_eq!(fp8_e4m3_decode(fp8_e4m3_encode(1e6)), 448.0);
        assert_eq!(fp8_e4m3_decode(fp8_e4m3_encode(-1e6)), -448.0);
        assert!(fp8_e4m3_decode(fp8_e4m3_encode(f32::NAN)).is_nan());
        assert_eq!(fp8_e4m3_encode(2f32.powi(-6)), 0x08);
    }

    #[test]
    fn test_fp8_rounds_to_nearest() {
        // 1.0625 sits exactly between 1.0 and 1.125: ties go to the even mantissa.
        assert_eq!(fp8_e4m3_decode(fp8_e4m3_encode(1.0625)), 1.0);
        assert_eq!(fp8_e4m3_decode(fp8_e4m3_encode(1.1)), 1.125);
    }

    #[test]
    fn test_tensor_dtype_trait() {
        assert_eq!(f32::DTYPE, DType::F32);
        assert_eq!(half::f16::DTYPE, DType::F16);
        assert_eq!(half::bf16::DTYPE, DType::BF16);
        assert_eq!(F8E4M3::DTYPE, DType::F8E4M3);
        assert_eq!(<half::bf16 as TensorDType>::from_f32(2.0).to_f32(), 2.0);
    }
}
