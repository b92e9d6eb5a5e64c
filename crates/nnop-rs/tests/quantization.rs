use nnop_rs::quant::{
    dequantize_multiplier, quantize_multiplier, requantize, QuantInfo, Quantization, Requantizer,
};
use nnop_rs::tensor::DType;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

#[test]
fn multiplier_normalizes_and_approximates_scale() {
    let mut rng = StdRng::seed_from_u64(0x5eed);
    for _ in 0..2_000 {
        let exponent = rng.gen_range(-20.0f64..10.0);
        let real = 2f64.powf(exponent);
        let (multiplier, shift) = quantize_multiplier(real);
        assert!(
            (1 << 30..=i32::MAX).contains(&multiplier),
            "multiplier {multiplier} for {real}"
        );
        let approx = dequantize_multiplier(multiplier, shift);
        assert!(
            ((approx - real) / real).abs() <= 2f64.powi(-30),
            "{real} approximated as {approx}"
        );
    }
}

#[test]
fn requantize_tracks_real_rescale_within_one_step() {
    let mut rng = StdRng::seed_from_u64(7);
    for _ in 0..5_000 {
        let real = rng.gen_range(1e-4f64..1.0);
        let acc = rng.gen_range(-200_000i32..200_000);
        let zero_point = rng.gen_range(-20i32..20);
        let (multiplier, shift) = quantize_multiplier(real);
        let expected = ((acc as f64 * real).round() as i64 + zero_point as i64).clamp(-128, 127);
        let actual = requantize(acc, multiplier, shift, zero_point) as i64;
        assert!(
            (actual - expected).abs() <= 1,
            "acc {acc} scale {real} zp {zero_point}: {actual} vs {expected}"
        );
    }
}

#[test]
fn halfway_cases_follow_gemmlowp_rounding() {
    // 0.5 is representable with a zero shift: the high multiply alone rounds ties upward.
    let (half, shift) = quantize_multiplier(0.5);
    assert_eq!((half, shift), (1 << 30, 0));
    assert_eq!(requantize(3, half, shift, 0), 2);
    assert_eq!(requantize(-3, half, shift, 0), -1);

    // 0.25 needs a right shift, which rounds ties away from zero.
    let (quarter, shift) = quantize_multiplier(0.25);
    assert_eq!((quarter, shift), (1 << 30, -1));
    assert_eq!(requantize(2, quarter, shift, 0), 1);
    assert_eq!(requantize(-2, quarter, shift, 0), -1);
    assert_eq!(requantize(6, quarter, shift, 0), 2);
    assert_eq!(requantize(-6, quarter, shift, 0), -2);
}

#[test]
fn requantize_saturates_to_int8() {
    let (multiplier, shift) = quantize_multiplier(0.5);
    assert_eq!(requantize(1_000_000, multiplier, shift, 0), 127);
    assert_eq!(requantize(-1_000_000, multiplier, shift, 0), -128);
    assert_eq!(requantize(240, multiplier, shift, 10), 127);
    assert_eq!(requantize(i32::MAX, multiplier, shift, -128), 127);
    assert_eq!(requantize(i32::MIN, multiplier, shift, 127), -128);
}

#[test]
fn large_scales_shift_left_without_wrapping() {
    let (multiplier, shift) = quantize_multiplier(3.0);
    assert_eq!(shift, 2);
    assert_eq!(requantize(10, multiplier, shift, 0), 30);
    assert_eq!(requantize(i32::MAX / 2, multiplier, shift, 0), 127);
}

#[test]
fn requantizer_clamps_relu_at_the_output_zero_point() {
    let input = QuantInfo::new(0.5, 0);
    let weights = Quantization::PerChannel(vec![QuantInfo::new(0.5, 0), QuantInfo::new(1.0, 0)]);
    let output = QuantInfo::new(1.0, -4);
    let plain = Requantizer::for_product(&input, &weights, &output, 2, DType::I8).unwrap();
    assert_eq!(plain.apply(-40, 0), -14);
    assert_eq!(plain.apply(-40, 1), -24);
    assert_eq!(plain.apply(8, 1), 0);

    let relu = plain.clone().with_relu();
    assert_eq!(relu.apply(-40, 0), -4);
    assert_eq!(relu.apply(8, 1), 0);
    assert_eq!(relu.zero_point(), -4);
}

#[test]
fn per_channel_records_must_cover_every_channel() {
    let input = QuantInfo::new(0.1, 0);
    let output = QuantInfo::new(0.2, 0);
    let weights = Quantization::PerChannel(vec![QuantInfo::new(0.5, 0); 3]);
    assert!(Requantizer::for_product(&input, &weights, &output, 4, DType::I8).is_err());
    assert!(Requantizer::for_product(&input, &weights, &output, 3, DType::I8).is_ok());
}
