//! Affine quantization model shared by every integer kernel.
//!
//! A quantized value `q` stands for the real value `scale * (q - zero_point)`. Integer kernels
//! accumulate in `i32` and rescale the accumulator to the output's quantization through a
//! fixed-point multiplier/shift pair, so no floating point is touched on the hot path.
//!
//! Rounding policy, applied identically by every kernel in the workspace:
//!
//! * a non-negative `shift` is a saturating left shift of the accumulator, followed by the
//!   saturating rounding doubling high multiply with the Q0.31 multiplier;
//! * a negative `shift` is the high multiply followed by a rounding divide by `2^-shift` that
//!   rounds halfway cases away from zero;
//! * the output zero-point is added last and the result saturates to the destination range.

use serde::{Deserialize, Serialize};

use crate::backend::spec::{KernelError, KernelResult};
use crate::tensor::{DType, TensorDesc};

/// Fixed-point approximation of a positive real scale: `multiplier / 2^31 * 2^shift`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FixedMultiplier {
    pub multiplier: i32,
    pub shift: i32,
}

impl FixedMultiplier {
    pub fn from_real(real_scale: f64) -> Self {
        let (multiplier, shift) = quantize_multiplier(real_scale);
        FixedMultiplier { multiplier, shift }
    }

    pub fn to_real(self) -> f64 {
        dequantize_multiplier(self.multiplier, self.shift)
    }

    /// Rescales an accumulator without zero-point or saturation.
    #[inline]
    pub fn apply(self, acc: i32) -> i32 {
        multiply_by_quantized_multiplier(acc, self.multiplier, self.shift)
    }
}

/// One quantization record: scale and zero-point, plus an optional precomputed multiplier.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QuantInfo {
    pub scale: f32,
    pub zero_point: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fixed: Option<FixedMultiplier>,
}

impl QuantInfo {
    pub fn new(scale: f32, zero_point: i32) -> Self {
        QuantInfo {
            scale,
            zero_point,
            fixed: None,
        }
    }

    /// Asymmetric parameters covering `[min, max]` for an integer dtype.
    ///
    /// The range is widened to include zero so that real zero is exactly representable, which
    /// padding relies on.
    pub fn from_min_max(min: f32, max: f32, dtype: DType) -> KernelResult<Self> {
        let (qmin, qmax) = dtype
            .int_range()
            .filter(|_| dtype.is_quantized_storage())
            .ok_or_else(|| {
                KernelError::unsupported_dtype(format!("{dtype} has no affine quantization"))
            })?;
        if !min.is_finite() || !max.is_finite() || min > max {
            return Err(KernelError::failure(format!(
                "invalid calibration range [{min}, {max}]"
            )));
        }
        let min = min.min(0.0);
        let max = max.max(0.0);
        if max == min {
            return Ok(QuantInfo::new(1.0, 0));
        }
        let scale = (max - min) / (qmax - qmin) as f32;
        let zero_point = (qmin as f32 - min / scale).round() as i32;
        Ok(QuantInfo::new(scale, zero_point.clamp(qmin, qmax)))
    }

    /// Symmetric parameters (`zero_point == 0`) for values bounded by `abs_max`.
    pub fn symmetric(abs_max: f32, dtype: DType) -> KernelResult<Self> {
        let (_, qmax) = dtype
            .int_range()
            .filter(|_| dtype.is_quantized_storage() && dtype != DType::U8)
            .ok_or_else(|| {
                KernelError::unsupported_dtype(format!("{dtype} has no symmetric quantization"))
            })?;
        let abs_max = abs_max.abs();
        let scale = if abs_max == 0.0 {
            1.0
        } else {
            abs_max / qmax as f32
        };
        Ok(QuantInfo::new(scale, 0))
    }

    #[inline]
    pub fn quantize(&self, value: f32, qmin: i32, qmax: i32) -> i32 {
        let q = (value / self.scale).round() as i64 + self.zero_point as i64;
        q.clamp(qmin as i64, qmax as i64) as i32
    }

    #[inline]
    pub fn dequantize(&self, q: i32) -> f32 {
        self.scale * (q - self.zero_point) as f32
    }
}

/// Quantization records attached to a tensor.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub enum Quantization {
    #[default]
    None,
    PerTensor(QuantInfo),
    /// One record per slice of the leading dimension.
    PerChannel(Vec<QuantInfo>),
}

impl Quantization {
    pub fn count(&self) -> usize {
        match self {
            Quantization::None => 0,
            Quantization::PerTensor(_) => 1,
            Quantization::PerChannel(records) => records.len(),
        }
    }

    /// Record governing leading-dimension slice `index`.
    pub fn get(&self, index: usize) -> Option<&QuantInfo> {
        match self {
            Quantization::None => None,
            Quantization::PerTensor(info) => Some(info),
            Quantization::PerChannel(records) => records.get(index),
        }
    }

    pub fn per_tensor(&self) -> Option<&QuantInfo> {
        match self {
            Quantization::PerTensor(info) => Some(info),
            Quantization::PerChannel(records) if records.len() == 1 => records.first(),
            _ => None,
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Quantization::None)
    }

    pub fn zero_points_are_zero(&self) -> bool {
        match self {
            Quantization::None => true,
            Quantization::PerTensor(info) => info.zero_point == 0,
            Quantization::PerChannel(records) => records.iter().all(|r| r.zero_point == 0),
        }
    }

    /// Checks the record count against the leading dimension: it must be 1 or `leading`.
    pub fn validate(&self, leading: usize) -> Result<(), String> {
        match self {
            Quantization::PerChannel(records) if records.len() != 1 && records.len() != leading => {
                Err(format!(
                    "per-channel quantization has {} records for {leading} channels",
                    records.len()
                ))
            }
            Quantization::PerChannel(records) if records.is_empty() => {
                Err("per-channel quantization without records".to_string())
            }
            _ => Ok(()),
        }
    }
}

fn frexp(x: f64) -> (f64, i32) {
    if x == 0.0 || !x.is_finite() {
        return (x, 0);
    }
    let bits = x.to_bits();
    let exponent = ((bits >> 52) & 0x7ff) as i32;
    if exponent == 0 {
        let (mantissa, exp) = frexp(x * 2f64.powi(64));
        return (mantissa, exp - 64);
    }
    let mantissa = f64::from_bits((bits & !(0x7ffu64 << 52)) | (1022u64 << 52));
    (mantissa, exponent - 1022)
}

/// Approximates `real_scale` as a Q0.31 `multiplier` and a power-of-two `shift`.
///
/// The multiplier lies in `[2^30, 2^31)` so that `multiplier / 2^31 * 2^shift` is within
/// `2^-31` relative error of `real_scale`. Zero maps to `(0, 0)`, as do scales too small to be
/// represented with a right shift of at most 31. Negative or non-finite scales are caller bugs.
pub fn quantize_multiplier(real_scale: f64) -> (i32, i32) {
    debug_assert!(
        real_scale.is_finite() && real_scale >= 0.0,
        "quantize_multiplier expects a finite non-negative scale, got {real_scale}"
    );
    if real_scale == 0.0 {
        return (0, 0);
    }
    let (significand, mut shift) = frexp(real_scale);
    let mut q_fixed = (significand * (1i64 << 31) as f64).round() as i64;
    if q_fixed == 1i64 << 31 {
        q_fixed /= 2;
        shift += 1;
    }
    if shift < -31 {
        return (0, 0);
    }
    (q_fixed as i32, shift)
}

/// Real value represented by a multiplier/shift pair.
pub fn dequantize_multiplier(multiplier: i32, shift: i32) -> f64 {
    multiplier as f64 / (1i64 << 31) as f64 * 2f64.powi(shift)
}

/// `round(a * b / 2^31)` with ties toward positive infinity, saturating the single overflow case.
#[inline]
pub fn saturating_rounding_doubling_high_mul(a: i32, b: i32) -> i32 {
    if a == i32::MIN && b == i32::MIN {
        return i32::MAX;
    }
    let ab = a as i64 * b as i64;
    let nudge = if ab >= 0 { 1i64 << 30 } else { 1 - (1i64 << 30) };
    ((ab + nudge) / (1i64 << 31)) as i32
}

/// `x / 2^exponent`, rounding halfway cases away from zero.
#[inline]
pub fn rounding_divide_by_pot(x: i32, exponent: i32) -> i32 {
    debug_assert!((0..=31).contains(&exponent));
    let x = x as i64;
    let mask = (1i64 << exponent) - 1;
    let remainder = x & mask;
    let threshold = (mask >> 1) + i64::from(x < 0);
    ((x >> exponent) + i64::from(remainder > threshold)) as i32
}

/// Rescales `acc` by `multiplier / 2^31 * 2^shift` without zero-point or final saturation.
#[inline]
pub fn multiply_by_quantized_multiplier(acc: i32, multiplier: i32, shift: i32) -> i32 {
    let left_shift = shift.max(0);
    let right_shift = (-shift).max(0);
    let shifted = if left_shift == 0 {
        acc
    } else {
        (acc as i64)
            .saturating_mul(1i64 << left_shift.min(32))
            .clamp(i32::MIN as i64, i32::MAX as i64) as i32
    };
    rounding_divide_by_pot(
        saturating_rounding_doubling_high_mul(shifted, multiplier),
        right_shift.min(31),
    )
}

/// Rescales an accumulator into `[qmin, qmax]` around `zero_point`.
#[inline]
pub fn requantize_to(
    acc: i32,
    multiplier: i32,
    shift: i32,
    zero_point: i32,
    qmin: i32,
    qmax: i32,
) -> i32 {
    let scaled = multiply_by_quantized_multiplier(acc, multiplier, shift) as i64;
    (scaled + zero_point as i64).clamp(qmin as i64, qmax as i64) as i32
}

/// Rescales an accumulator into an `i8` output.
#[inline]
pub fn requantize(acc: i32, multiplier: i32, shift: i32, zero_point: i32) -> i8 {
    requantize_to(
        acc,
        multiplier,
        shift,
        zero_point,
        i8::MIN as i32,
        i8::MAX as i32,
    ) as i8
}

/// Cached output rescaling for one operator instance.
///
/// Holds one multiplier/shift per output channel (a single entry broadcasts to every
/// channel) so executors never recompute them per call.
#[derive(Debug, Clone, PartialEq)]
pub struct Requantizer {
    channels: Vec<FixedMultiplier>,
    zero_point: i32,
    qmin: i32,
    qmax: i32,
}

impl Requantizer {
    pub fn new(channels: Vec<FixedMultiplier>, output: &QuantInfo, dtype: DType) -> KernelResult<Self> {
        let (qmin, qmax) = dtype.int_range().ok_or_else(|| {
            KernelError::unsupported_dtype(format!("cannot requantize into {dtype}"))
        })?;
        if channels.is_empty() {
            return Err(KernelError::failure("requantizer needs at least one multiplier"));
        }
        Ok(Requantizer {
            channels,
            zero_point: output.zero_point,
            qmin,
            qmax,
        })
    }

    /// Builds the per-channel table for a product `input * weight` rescaled into `output`.
    ///
    /// A record carrying a precomputed multiplier is trusted as-is.
    pub fn for_product(
        input: &QuantInfo,
        weights: &Quantization,
        output: &QuantInfo,
        out_channels: usize,
        dtype: DType,
    ) -> KernelResult<Self> {
        weights
            .validate(out_channels)
            .map_err(KernelError::shape_mismatch)?;
        let count = if weights.count() == 1 { 1 } else { out_channels };
        let mut channels = Vec::with_capacity(count);
        for channel in 0..count {
            let weight = weights.get(channel).ok_or_else(|| {
                KernelError::unsupported_dtype("integer weights carry no quantization records")
            })?;
            let multiplier = match weight.fixed {
                Some(fixed) => fixed,
                None => {
                    let real = input.scale as f64 * weight.scale as f64 / output.scale as f64;
                    FixedMultiplier::from_real(real)
                }
            };
            channels.push(multiplier);
        }
        Requantizer::new(channels, output, dtype)
    }

    /// Clamps the lower bound at the output zero-point, the quantized form of a fused ReLU.
    pub fn with_relu(mut self) -> Self {
        self.qmin = self.qmin.max(self.zero_point).min(self.qmax);
        self
    }

    pub fn channel(&self, channel: usize) -> FixedMultiplier {
        if self.channels.len() == 1 {
            self.channels[0]
        } else {
            self.channels[channel]
        }
    }

    pub fn zero_point(&self) -> i32 {
        self.zero_point
    }

    #[inline]
    pub fn apply(&self, acc: i32, channel: usize) -> i32 {
        let fixed = self.channel(channel);
        requantize_to(
            acc,
            fixed.multiplier,
            fixed.shift,
            self.zero_point,
            self.qmin,
            self.qmax,
        )
    }
}

/// Re-expresses int8 activations of one quantization in another, for shape-preserving ops
/// whose declared output record may differ from the input's.
#[derive(Debug, Clone, PartialEq)]
pub struct Rescale {
    input_zero_point: i32,
    requant: Requantizer,
    relu: bool,
}

impl Rescale {
    pub fn new(input: &QuantInfo, output: &QuantInfo, dtype: DType) -> KernelResult<Self> {
        if !(input.scale > 0.0 && output.scale > 0.0) {
            return Err(KernelError::unsupported_dtype(format!(
                "rescaling needs positive scales, found {} -> {}",
                input.scale, output.scale
            ))
            .with_dtype(dtype));
        }
        let real = input.scale as f64 / output.scale as f64;
        Ok(Rescale {
            input_zero_point: input.zero_point,
            requant: Requantizer::new(vec![FixedMultiplier::from_real(real)], output, dtype)?,
            relu: false,
        })
    }

    /// Drops negative real values before rescaling.
    pub fn with_relu(mut self) -> Self {
        self.relu = true;
        self
    }

    /// Code in the output quantization for input code `q`, saturated.
    #[inline]
    pub fn apply(&self, q: i32) -> i32 {
        let centered = q - self.input_zero_point;
        let centered = if self.relu { centered.max(0) } else { centered };
        self.requant.apply(centered, 0)
    }

    /// Input code standing for real zero, saturated into `[lo, hi]`.
    pub fn input_zero(&self, lo: i32, hi: i32) -> i32 {
        self.input_zero_point.clamp(lo, hi)
    }
}

/// Returns a bias with the input zero-point contribution folded in.
///
/// For every output channel `oc`, `bias[oc] - input_zp * sum(weights[oc * inner..][..inner])`.
/// The accumulation of raw inputs against `weights` plus the folded bias then equals the
/// accumulation of `(input - input_zp)` against `weights` plus the original bias.
pub fn fold_input_zero_point(bias: &[i32], weights: &[i8], inner: usize, input_zp: i32) -> Vec<i32> {
    bias.iter()
        .enumerate()
        .map(|(oc, &b)| {
            let row = &weights[oc * inner..(oc + 1) * inner];
            let sum: i32 = row.iter().map(|&w| w as i32).sum();
            b.wrapping_sub(sum.wrapping_mul(input_zp))
        })
        .collect()
}

/// Per-tensor record of an integer activation operand.
pub fn activation_quant<'a>(desc: &'a TensorDesc, role: &str) -> KernelResult<&'a QuantInfo> {
    desc.quant.per_tensor().ok_or_else(|| {
        KernelError::unsupported_dtype(format!(
            "{} {role} needs exactly one quantization record, found {}",
            desc.dtype,
            desc.quant.count()
        ))
        .with_dtype(desc.dtype)
    })
}

/// Zero-point of each of `channels` weight slices; a single record broadcasts.
pub fn weight_zero_points(quant: &Quantization, channels: usize) -> Vec<i32> {
    let broadcast = quant.count() <= 1;
    (0..channels)
        .map(|c| {
            quant
                .get(if broadcast { 0 } else { c })
                .map_or(0, |info| info.zero_point)
        })
        .collect()
}

/// Quantizes `values` along the leading dimension of `dims` using `quant`.
pub fn quantize_f32(values: &[f32], dims: &[usize], quant: &Quantization) -> KernelResult<Vec<i8>> {
    let leading = dims.first().copied().unwrap_or(1);
    quant.validate(leading).map_err(KernelError::shape_mismatch)?;
    let slice = if leading == 0 { 0 } else { values.len() / leading };
    values
        .iter()
        .enumerate()
        .map(|(idx, &v)| {
            let channel = if slice == 0 { 0 } else { idx / slice };
            let info = quant.get(channel).ok_or_else(|| {
                KernelError::unsupported_dtype("quantizing without quantization records")
            })?;
            Ok(info.quantize(v, i8::MIN as i32, i8::MAX as i32) as i8)
        })
        .collect()
}

/// Inverse of [`quantize_f32`].
pub fn dequantize_i8(values: &[i8], dims: &[usize], quant: &Quantization) -> KernelResult<Vec<f32>> {
    let leading = dims.first().copied().unwrap_or(1);
    quant.validate(leading).map_err(KernelError::shape_mismatch)?;
    let slice = if leading == 0 { 0 } else { values.len() / leading };
    values
        .iter()
        .enumerate()
        .map(|(idx, &q)| {
            let channel = if slice == 0 { 0 } else { idx / slice };
            let info = quant.get(channel).ok_or_else(|| {
                KernelError::unsupported_dtype("dequantizing without quantization records")
            })?;
            Ok(info.dequantize(q as i32))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multiplier_of_one_half() {
        assert_eq!(quantize_multiplier(0.5), (1 << 30, 0));
        assert_eq!(quantize_multiplier(1.0), (1 << 30, 1));
        assert_eq!(quantize_multiplier(0.0), (0, 0));
    }

    #[test]
    fn tiny_scales_flush_to_zero() {
        assert_eq!(quantize_multiplier(2f64.powi(-40)), (0, 0));
    }

    #[test]
    fn rounding_divide_rounds_half_away_from_zero() {
        assert_eq!(rounding_divide_by_pot(3, 1), 2);
        assert_eq!(rounding_divide_by_pot(-3, 1), -2);
        assert_eq!(rounding_divide_by_pot(5, 2), 1);
        assert_eq!(rounding_divide_by_pot(-5, 2), -1);
        assert_eq!(rounding_divide_by_pot(6, 2), 2);
        assert_eq!(rounding_divide_by_pot(-6, 2), -2);
        assert_eq!(rounding_divide_by_pot(7, 0), 7);
    }

    #[test]
    fn high_mul_saturates_on_min_times_min() {
        assert_eq!(
            saturating_rounding_doubling_high_mul(i32::MIN, i32::MIN),
            i32::MAX
        );
        assert_eq!(saturating_rounding_doubling_high_mul(1 << 20, 1 << 30), 1 << 19);
    }

    #[test]
    fn fold_matches_manual_sum() {
        let weights: Vec<i8> = vec![1, -2, 3, 4, 5, -6];
        let folded = fold_input_zero_point(&[10, 20], &weights, 3, 7);
        assert_eq!(folded, vec![10 - 7 * 2, 20 - 7 * 3]);
    }

    #[test]
    fn per_channel_count_is_validated() {
        let quant = Quantization::PerChannel(vec![QuantInfo::new(0.1, 0); 3]);
        assert!(quant.validate(3).is_ok());
        assert!(quant.validate(4).is_err());
        let single = Quantization::PerChannel(vec![QuantInfo::new(0.1, 0)]);
        assert!(single.validate(4).is_ok());
    }

    #[test]
    fn equal_records_rescale_exactly() {
        let info = QuantInfo::new(0.07, -9);
        let identity = Rescale::new(&info, &info, DType::I8).unwrap();
        for q in -128..=127 {
            assert_eq!(identity.apply(q), q);
        }
        let relu = identity.with_relu();
        assert_eq!(relu.apply(-20), -9);
        assert_eq!(relu.apply(40), 40);
    }

    #[test]
    fn rescale_moves_zero_point_and_scale() {
        let input = QuantInfo::new(0.1, 0);
        let output = QuantInfo::new(0.2, 5);
        let rescale = Rescale::new(&input, &output, DType::I8).unwrap().with_relu();
        let codes: Vec<i32> = [-10, 0, 20, 100, 127].iter().map(|&q| rescale.apply(q)).collect();
        assert_eq!(codes, vec![5, 5, 15, 55, 69]);
        assert!(Rescale::new(&input, &QuantInfo::new(0.0, 0), DType::I8).is_err());
    }

    #[test]
    fn relu_bound_never_exceeds_range() {
        let requant = Requantizer::new(vec![FixedMultiplier::from_real(0.5)], &QuantInfo::new(1.0, 300), DType::I8)
            .unwrap()
            .with_relu();
        assert_eq!(requant.apply(0, 0), 127);
    }

    #[test]
    fn min_max_keeps_zero_exact() {
        let info = QuantInfo::from_min_max(-1.0, 3.0, DType::I8).unwrap();
        assert_eq!(info.dequantize(info.zero_point), 0.0);
        assert!(info.quantize(3.0, -128, 127) <= 127);
    }
}
