use std::sync::Arc;

use anyhow::{ensure, Result};
use nnop_rs::backend::spec::{InitContext, Initializer};
use nnop_rs::ops::{Conv2dParams, OpKind, OpParams};
use nnop_rs::session::{Session, SessionOptions};
use nnop_rs::tensor::{DType, TensorDesc};
use nnop_rs::{Layout, Status};
use nnop_rs_backend_tests::conformance::reference_of;
use nnop_rs_backend_tests::fixtures::{self, OpCase};
use nnop_rs_backend_tests::{init_test_logging, RecordingTable};
use nnop_rs_backend_vector::{
    registry_with, vector_registry, vector_table, VectorConfig, DOT_BACKEND, VECTOR_BACKEND,
};

/// int8 packs four channels per 64-bit register.
fn four_lane_vector() -> Result<Arc<nnop_rs::KernelRegistry>> {
    Ok(Arc::new(vector_registry(VectorConfig::with_vlen_bits(64))?))
}

/// Runs `case` through `registry` and checks it against the float computation on the
/// dequantized operands, allowing one output quantization step.
fn run_against_float(registry: &Arc<nnop_rs::KernelRegistry>, case: OpCase, expected_path: &str) -> Result<()> {
    let reference = reference_of(registry)?;
    let case = case.calibrate(&reference)?;
    let (actual, bound) = fixtures::run_graph(registry, &case)?;
    ensure!(bound.backend == VECTOR_BACKEND, "bound to {}", bound.backend);
    ensure!(bound.executor == expected_path, "selected {}", bound.executor);

    let (float, _) = fixtures::run_graph(&reference, &case.float_twin()?)?;
    let step = case
        .output
        .quant
        .per_tensor()
        .map(|q| q.scale)
        .ok_or_else(|| anyhow::anyhow!("calibrated output has no record"))?;
    let diff = fixtures::max_abs_diff(&fixtures::dequantize(&actual)?, &float)?;
    ensure!(diff <= step * 1.001, "differs from float by {diff}, step {step}");
    Ok(())
}

#[test]
fn pointwise_int8_four_channels_takes_packed_path() -> Result<()> {
    init_test_logging();
    let registry = four_lane_vector()?;
    let mut rng = fixtures::seeded(40);
    let case = fixtures::conv_case(
        &mut rng,
        DType::I8,
        OpKind::Conv2d,
        [1, 4, 6, 5],
        4,
        1,
        Conv2dParams::default(),
    )?;
    run_against_float(&registry, case, "conv1x1s1_packn")
}

#[test]
fn pointwise_int8_six_channels_falls_back_to_im2col() -> Result<()> {
    init_test_logging();
    let registry = four_lane_vector()?;
    let mut rng = fixtures::seeded(41);
    let case = fixtures::conv_case(
        &mut rng,
        DType::I8,
        OpKind::Conv2d,
        [1, 6, 6, 5],
        4,
        1,
        Conv2dParams::default(),
    )?;
    run_against_float(&registry, case, "im2col_gemm")
}

#[test]
fn padded_int8_conv_takes_packed_im2col() -> Result<()> {
    init_test_logging();
    let registry = four_lane_vector()?;
    let mut rng = fixtures::seeded(42);
    let params = Conv2dParams::default().with_padding(1);
    let case = fixtures::conv_case(&mut rng, DType::I8, OpKind::Conv2dRelu, [1, 8, 5, 5], 4, 3, params)?;
    run_against_float(&registry, case, "im2col_gemm_packn")
}

#[test]
fn nonzero_weight_zero_point_falls_back_to_reference() -> Result<()> {
    init_test_logging();
    let registry = Arc::new(registry_with(VectorConfig::with_vlen_bits(64))?);
    let mut rng = fixtures::seeded(43);
    let mut case = fixtures::conv_case(
        &mut rng,
        DType::I8,
        OpKind::Conv2d,
        [1, 4, 4, 4],
        4,
        1,
        Conv2dParams::default(),
    )?;
    let asymmetric = nnop_rs::Tensor::from_i8(
        case.operands[0].shape().clone(),
        case.operands[0].i8_values()?.to_vec(),
        fixtures::activation(0.01, 3),
    )?;
    case.operands[0] = asymmetric;
    let case = case.calibrate(&reference_of(&registry)?)?;
    let (_, bound) = fixtures::run_graph(&registry, &case)?;
    ensure!(bound.backend == "ref", "bound to {}::{}", bound.backend, bound.executor);
    Ok(())
}

#[test]
fn dot_backend_claims_pointwise_int8_only() -> Result<()> {
    init_test_logging();
    let registry = Arc::new(registry_with(VectorConfig::default())?);
    let mut rng = fixtures::seeded(44);
    let pointwise = fixtures::conv_case(
        &mut rng,
        DType::I8,
        OpKind::Conv2d,
        [1, 8, 3, 3],
        8,
        1,
        Conv2dParams::default(),
    )?
    .calibrate(&reference_of(&registry)?)?;
    let (_, bound) = fixtures::run_graph(&registry, &pointwise)?;
    ensure!(bound.backend == DOT_BACKEND && bound.executor == "dot4_conv1x1", "{bound:?}");

    let spatial = fixtures::conv_case(
        &mut rng,
        DType::I8,
        OpKind::Conv2d,
        [1, 8, 5, 5],
        8,
        3,
        Conv2dParams::default(),
    )?
    .calibrate(&reference_of(&registry)?)?;
    let (_, bound) = fixtures::run_graph(&registry, &spatial)?;
    ensure!(bound.backend == VECTOR_BACKEND, "{bound:?}");
    Ok(())
}

#[test]
fn packed_values_flow_between_vector_operators() -> Result<()> {
    init_test_logging();
    let recording = RecordingTable::new();
    let table = recording.wrap(&vector_table(VectorConfig::with_vlen_bits(64))?, "recorded-vector")?;
    let registry = Arc::new(
        nnop_rs::KernelRegistry::builder(nnop_rs_backend_ref_cpu::reference_table()?)
            .layer(table)
            .build()?,
    );
    let mut rng = fixtures::seeded(45);
    let input = fixtures::random_f32(&mut rng, &[1, 4, 5, 5])?;
    let weights = fixtures::random_f32(&mut rng, &[4, 4, 1, 1])?;

    let mut session = Session::new(Arc::clone(&registry), SessionOptions::default().with_keep_intermediates(true))?;
    session.set_input_number(1)?;
    session.set_output_number(1)?;
    let x = session.set_input(0, input.desc().clone())?;
    let w = session.add_constant(weights)?;
    let shape = TensorDesc::new(DType::F32, [1, 4, 5, 5]);
    let conv = session.declare(
        OpKind::Conv2d,
        OpParams::Conv2d(Conv2dParams::default()),
        &[x, w],
        vec![shape.clone()],
    )?;
    let relu = session.declare(OpKind::Relu, OpParams::None, &conv, vec![shape])?;
    session.set_output(0, relu[0])?;
    session.setup()?;
    session.update_input(0, input)?;
    session.run()?;

    let conv_value = session.value(conv[0])?;
    ensure!(
        conv_value.layout() == Layout::Packed { factor: 2, channels: 4 },
        "conv produced {}",
        conv_value.layout()
    );
    let relu_value = session.value(relu[0])?;
    ensure!(relu_value.layout() == conv_value.layout(), "relu repacked to {}", relu_value.layout());
    ensure!(session.output(0)?.layout() == Layout::ChannelFirst, "outputs are canonical");
    let executors: Vec<_> = recording.invocations().into_iter().map(|call| call.executor).collect();
    ensure!(executors == ["conv1x1s1_packn", "relu_any_layout"], "{executors:?}");
    Ok(())
}

#[test]
fn grouped_convolution_is_declined_with_a_layout_status() -> Result<()> {
    let registry = Arc::new(vector_registry(VectorConfig::default())?);
    let mut rng = fixtures::seeded(46);
    let case = fixtures::conv_case(
        &mut rng,
        DType::F32,
        OpKind::Conv2d,
        [1, 4, 4, 4],
        4,
        1,
        Conv2dParams::default().with_group(2),
    )?;
    let (_, bound) = fixtures::run_graph(&registry, &case)?;
    ensure!(bound.backend == "ref", "{bound:?}");

    let record = registry
        .backend(VECTOR_BACKEND)
        .and_then(|table| table.get(OpKind::Conv2d, DType::F32))
        .and_then(|record| record.init.clone())
        .ok_or_else(|| anyhow::anyhow!("vector conv initializer missing"))?;
    let inputs = [
        case.input.desc().clone(),
        case.operands[0].desc().clone(),
        case.operands[1].desc().clone(),
    ];
    let constants = [None, Some(&case.operands[0]), Some(&case.operands[1])];
    let ctx = InitContext {
        op: OpKind::Conv2d,
        params: &case.params,
        inputs: &inputs,
        constants: &constants,
        graph_inputs: &[true, false, false],
        outputs: std::slice::from_ref(&case.output),
    };
    let status = Status::of(&record.initialize(&ctx).map(|_| ()));
    ensure!(status == Status::UnsupportedLayout, "status {status}");
    Ok(())
}
