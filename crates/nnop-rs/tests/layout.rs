use half::f16;
use nnop_rs::layout::{
    from_packed, from_packed_into, nchw_to_nhwc, nhwc_to_nchw, packed_desc, to_packed, RemainderPolicy,
};
use nnop_rs::quant::QuantInfo;
use nnop_rs::tensor::{DType, Shape, Tensor, TensorData, TensorDesc};
use nnop_rs::{Layout, Status};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn random_tensor(rng: &mut StdRng, dtype: DType, dims: &[usize]) -> Tensor {
    let count: usize = dims.iter().product();
    let desc = TensorDesc::new(dtype, Shape::new(dims));
    let data = match dtype {
        DType::F32 => TensorData::F32((0..count).map(|_| rng.gen_range(-4.0f32..4.0)).collect()),
        DType::F16 => TensorData::F16((0..count).map(|_| f16::from_f32(rng.gen_range(-4.0f32..4.0))).collect()),
        DType::I8 => TensorData::I8((0..count).map(|_| rng.gen()).collect()),
        DType::I32 => TensorData::I32((0..count).map(|_| rng.gen_range(-1000..1000)).collect()),
        other => panic!("no generator for {other}"),
    };
    Tensor::new(desc, data).unwrap()
}

#[test]
fn packing_round_trips_across_dtypes_and_channel_counts() {
    let mut rng = StdRng::seed_from_u64(11);
    for dtype in [DType::F32, DType::F16, DType::I8, DType::I32] {
        for channels in [1, 3, 4, 8, 10] {
            for policy in [RemainderPolicy::ZeroPad, RemainderPolicy::PackOne] {
                let src = random_tensor(&mut rng, dtype, &[2, channels, 3, 5]);
                let packed = to_packed(&src, 4, policy).unwrap();
                assert!(packed.layout().is_packed());
                assert_eq!(packed.desc().logical_dims().as_slice(), src.shape().dims());
                let restored = from_packed(&packed).unwrap();
                assert_eq!(restored, src, "{dtype} C={channels} {policy:?}");
            }
        }
    }
}

#[test]
fn zero_pad_fills_the_last_group_with_zero_lanes() {
    let src = Tensor::from_f32([1, 3, 2], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
    let packed = to_packed(&src, 4, RemainderPolicy::ZeroPad).unwrap();
    assert_eq!(packed.layout(), Layout::Packed { factor: 4, channels: 3 });
    assert_eq!(packed.shape().dims(), &[1, 1, 2, 4]);
    assert_eq!(
        packed.f32_values().unwrap(),
        &[1.0, 3.0, 5.0, 0.0, 2.0, 4.0, 6.0, 0.0]
    );
}

#[test]
fn divisible_channels_pack_without_padding_under_either_policy() {
    let desc = TensorDesc::new(DType::I8, [1, 8, 4, 4]);
    for policy in [RemainderPolicy::ZeroPad, RemainderPolicy::PackOne] {
        let packed = packed_desc(&desc, 4, policy).unwrap();
        assert_eq!(packed.shape.dims(), &[1, 2, 4, 4, 4]);
        assert_eq!(packed.storage_elements(), desc.storage_elements());
    }
}

#[test]
fn packing_keeps_quantization_records() {
    let quant = nnop_rs::quant::Quantization::PerTensor(QuantInfo::new(0.1, -3));
    let src = Tensor::from_i8([1, 5, 2], (0..10).collect(), quant.clone()).unwrap();
    let packed = to_packed(&src, 4, RemainderPolicy::ZeroPad).unwrap();
    assert_eq!(packed.quant(), &quant);
    assert_eq!(from_packed(&packed).unwrap().quant(), &quant);
}

#[test]
fn repacking_with_a_new_factor_goes_through_canonical() {
    let mut rng = StdRng::seed_from_u64(12);
    let src = random_tensor(&mut rng, DType::F32, &[1, 8, 3, 3]);
    let by_four = to_packed(&src, 4, RemainderPolicy::ZeroPad).unwrap();
    let by_eight = to_packed(&by_four, 8, RemainderPolicy::ZeroPad).unwrap();
    assert_eq!(by_eight.layout(), Layout::Packed { factor: 8, channels: 8 });
    assert_eq!(from_packed(&by_eight).unwrap(), src);
    assert_eq!(to_packed(&by_four, 4, RemainderPolicy::ZeroPad).unwrap(), by_four);
}

#[test]
fn conversion_errors_carry_statuses() {
    let canonical = Tensor::from_f32([1, 2, 2], vec![0.0; 4]).unwrap();
    let err = from_packed(&canonical).unwrap_err();
    assert_eq!(err.status(), Status::UnsupportedLayout);

    let packed = to_packed(&canonical, 2, RemainderPolicy::ZeroPad).unwrap();
    let mut wrong = Tensor::zeros(TensorDesc::new(DType::I8, [1, 2, 2]));
    let err = from_packed_into(&packed, &mut wrong).unwrap_err();
    assert_eq!(err.status(), Status::ShapeMismatch);

    let nhwc = TensorDesc::new(DType::F32, [1, 2, 2, 3]).with_layout(Layout::ChannelLast);
    assert_eq!(
        packed_desc(&nhwc, 4, RemainderPolicy::ZeroPad).unwrap_err().status(),
        Status::UnsupportedLayout
    );
}

#[test]
fn channel_last_permutation_round_trips() {
    let mut rng = StdRng::seed_from_u64(13);
    let src = random_tensor(&mut rng, DType::I8, &[2, 3, 4, 5]);
    let nhwc = nchw_to_nhwc(&src).unwrap();
    assert_eq!(nhwc.shape().dims(), &[2, 4, 5, 3]);
    assert_eq!(nhwc.layout(), Layout::ChannelLast);
    assert_eq!(nhwc_to_nchw(&nhwc).unwrap(), src);
}
