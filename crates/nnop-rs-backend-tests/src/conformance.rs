//! Backend-agnostic checks: every function runs one scenario through the registry under test
//! and compares it with the registry's terminal reference backend.

use std::sync::Arc;

use anyhow::{ensure, Context, Result};
use nnop_rs::backend::registry::KernelRegistry;
use nnop_rs::ops::{Conv2dParams, OpKind, OpParams};
use nnop_rs::quant::QuantInfo;
use nnop_rs::session::{Session, SessionOptions};
use nnop_rs::tensor::{DType, TensorDesc};

use crate::fixtures::{self, OpCase};
use crate::recording::RecordingTable;

/// Absolute tolerance for f32 results; accumulation order differs between backends.
pub const F32_TOLERANCE: f32 = 1e-4;

/// A chain holding only `registry`'s reference backend.
pub fn reference_of(registry: &KernelRegistry) -> Result<Arc<KernelRegistry>> {
    Ok(Arc::new(
        KernelRegistry::builder(registry.reference().clone()).build()?,
    ))
}

fn tolerance(dtype: DType, magnitude: f32) -> f32 {
    match dtype {
        DType::F32 => F32_TOLERANCE * magnitude.max(1.0),
        // Integer kernels accumulate exactly and share one requantization routine.
        _ => 0.0,
    }
}

/// Runs `case` through `registry` and through the reference backend and compares outputs.
pub fn check_against_reference(registry: &Arc<KernelRegistry>, case: OpCase) -> Result<()> {
    let reference = reference_of(registry)?;
    let case = case.calibrate(&reference)?;
    let (actual, bound) = fixtures::run_graph(registry, &case)?;
    let (expected, _) = fixtures::run_graph(&reference, &case)?;
    let magnitude = match expected.as_f32() {
        Some(values) => values.iter().fold(0.0f32, |m, v| m.max(v.abs())),
        None => 1.0,
    };
    let diff = fixtures::max_abs_diff(&actual, &expected)?;
    ensure!(
        diff <= tolerance(case.dtype(), magnitude),
        "{}/{} via {}::{} differs from reference by {diff}",
        case.op,
        case.dtype(),
        bound.backend,
        bound.executor
    );
    Ok(())
}

pub fn every_advertised_pair_binds(registry: &Arc<KernelRegistry>) -> Result<()> {
    let mut rng = fixtures::seeded(1);
    let reference = reference_of(registry)?;
    for (op, dtype) in registry.advertised() {
        let case = fixtures::default_case(&mut rng, op, dtype)?.calibrate(&reference)?;
        let (output, bound) =
            fixtures::run_graph(registry, &case).with_context(|| format!("binding {op}/{dtype}"))?;
        ensure!(bound.op == op && bound.dtype == dtype, "bound {bound:?} for {op}/{dtype}");
        ensure!(
            output.desc().logical_dims() == case.output.logical_dims(),
            "{op}/{dtype} produced {:?}",
            output.shape().dims()
        );
    }
    Ok(())
}

pub fn conv2d_f32_matches_reference(registry: &Arc<KernelRegistry>) -> Result<()> {
    let mut rng = fixtures::seeded(2);
    let params = Conv2dParams::default().with_padding(1);
    let case = fixtures::conv_case(&mut rng, DType::F32, OpKind::Conv2d, [1, 4, 7, 6], 8, 3, params)?;
    check_against_reference(registry, case)
}

pub fn conv2d_i8_pointwise_matches_reference(registry: &Arc<KernelRegistry>) -> Result<()> {
    let mut rng = fixtures::seeded(3);
    let case = fixtures::conv_case(
        &mut rng,
        DType::I8,
        OpKind::Conv2d,
        [1, 8, 5, 5],
        16,
        1,
        Conv2dParams::default(),
    )?;
    check_against_reference(registry, case)
}

pub fn conv2d_i8_odd_channels_matches_reference(registry: &Arc<KernelRegistry>) -> Result<()> {
    let mut rng = fixtures::seeded(4);
    let params = Conv2dParams::default().with_padding(1).with_stride(2);
    let case = fixtures::conv_case(&mut rng, DType::I8, OpKind::Conv2d, [2, 6, 7, 7], 5, 3, params)?;
    check_against_reference(registry, case)
}

pub fn conv2d_relu_i8_matches_reference(registry: &Arc<KernelRegistry>) -> Result<()> {
    let mut rng = fixtures::seeded(5);
    let params = Conv2dParams::default().with_padding(1);
    let case = fixtures::conv_case(&mut rng, DType::I8, OpKind::Conv2dRelu, [1, 8, 6, 6], 8, 3, params)?;
    check_against_reference(registry, case)
}

pub fn grouped_conv2d_matches_reference(registry: &Arc<KernelRegistry>) -> Result<()> {
    let mut rng = fixtures::seeded(6);
    let params = Conv2dParams::default().with_group(2).with_padding(1);
    let case = fixtures::conv_case(&mut rng, DType::F32, OpKind::Conv2d, [1, 8, 5, 5], 8, 3, params)?;
    check_against_reference(registry, case)
}

pub fn depthwise_i8_matches_reference(registry: &Arc<KernelRegistry>) -> Result<()> {
    let mut rng = fixtures::seeded(7);
    for stride in [1, 2] {
        let params = Conv2dParams::default().with_padding(1).with_stride(stride);
        let case = fixtures::conv_case(
            &mut rng,
            DType::I8,
            OpKind::DepthwiseConv2d,
            [1, 8, 9, 9],
            8,
            3,
            params,
        )?;
        check_against_reference(registry, case)?;
    }
    Ok(())
}

pub fn depthwise_f32_large_kernel_matches_reference(registry: &Arc<KernelRegistry>) -> Result<()> {
    let mut rng = fixtures::seeded(8);
    let params = Conv2dParams::default().with_padding(2);
    let case = fixtures::conv_case(
        &mut rng,
        DType::F32,
        OpKind::DepthwiseConv2d,
        [1, 4, 8, 8],
        4,
        5,
        params,
    )?;
    check_against_reference(registry, case)
}

pub fn fully_connected_matches_reference(registry: &Arc<KernelRegistry>) -> Result<()> {
    let mut rng = fixtures::seeded(9);
    for dtype in [DType::F32, DType::I8] {
        check_against_reference(registry, fixtures::fc_case(&mut rng, dtype, 3, 20, 7)?)?;
    }
    Ok(())
}

pub fn elementwise_ops_match_reference(registry: &Arc<KernelRegistry>) -> Result<()> {
    let mut rng = fixtures::seeded(10);
    for dtype in [DType::F32, DType::I8] {
        let relu = fixtures::unary_case(&mut rng, dtype, OpKind::Relu, OpParams::None, &[2, 6, 4, 4])?;
        check_against_reference(registry, relu)?;
        check_against_reference(registry, fixtures::add_case(&mut rng, dtype, &[2, 6, 4, 4])?)?;
    }
    Ok(())
}

pub fn max_pool_matches_reference(registry: &Arc<KernelRegistry>) -> Result<()> {
    let mut rng = fixtures::seeded(11);
    for dtype in [DType::F32, DType::I8] {
        let mut case = fixtures::default_case(&mut rng, OpKind::MaxPool2d, dtype)?;
        check_against_reference(registry, case.clone())?;
        case.params = OpParams::Pool2d(nnop_rs::ops::Pool2dParams {
            window: [3, 3],
            stride: [2, 2],
            padding: [1, 1, 1, 1],
        });
        let case = OpCase::new(case.op, case.params, case.input, Vec::new())?;
        check_against_reference(registry, case)?;
    }
    Ok(())
}

/// Int8 ReLU and max pooling into output records that differ from the input's, checked
/// against the float computation and against the reference backend.
pub fn rescaled_activations_track_float(registry: &Arc<KernelRegistry>) -> Result<()> {
    let mut rng = fixtures::seeded(14);
    let reference = reference_of(registry)?;
    let fixed = nnop_rs::tensor::Tensor::from_i8(
        [1, 4],
        vec![-10, 0, 20, 100],
        fixtures::activation(0.1, 0),
    )?;
    let halved = OpCase::new(OpKind::Relu, OpParams::None, fixed, Vec::new())?
        .with_output_quant(QuantInfo::new(0.2, 0));
    let (output, _) = fixtures::run_graph(registry, &halved)?;
    ensure!(output.i8_values()? == [0i8, 0, 10, 50], "relu produced {:?}", output.i8_values()?);

    let pooling = OpParams::Pool2d(nnop_rs::ops::Pool2dParams::square(2, 2));
    for (op, params) in [(OpKind::Relu, OpParams::None), (OpKind::MaxPool2d, pooling)] {
        for out_q in [QuantInfo::new(0.05, 7), QuantInfo::new(0.04, -30)] {
            let case = fixtures::unary_case(&mut rng, DType::I8, op, params.clone(), &[1, 4, 6, 6])?
                .with_output_quant(out_q);
            let steps = case.steps_from_float(registry, &reference)?;
            ensure!(steps <= 1.001, "{op} into {out_q:?} is {steps} steps from float");
            let (actual, bound) = fixtures::run_graph(registry, &case)?;
            let (expected, _) = fixtures::run_graph(&reference, &case)?;
            ensure!(
                actual.i8_values()? == expected.i8_values()?,
                "{op} via {}::{} differs from reference",
                bound.backend,
                bound.executor
            );
        }
    }
    Ok(())
}

/// `conv -> relu -> conv` where the second convolution reads an intermediate value.
pub fn chained_graph_matches_reference(registry: &Arc<KernelRegistry>) -> Result<()> {
    let mut rng = fixtures::seeded(12);
    let reference = reference_of(registry)?;
    let input = fixtures::random_f32(&mut rng, &[1, 8, 6, 6])?;
    let first = fixtures::random_f32(&mut rng, &[8, 8, 1, 1])?;
    let second = fixtures::random_f32(&mut rng, &[8, 8, 3, 3])?;

    let run = |registry: &Arc<KernelRegistry>| -> Result<nnop_rs::tensor::Tensor> {
        let mut session = Session::new(Arc::clone(registry), SessionOptions::default())?;
        session.set_input_number(1)?;
        session.set_output_number(1)?;
        let x = session.set_input(0, input.desc().clone())?;
        let w1 = session.add_constant(first.clone())?;
        let w2 = session.add_constant(second.clone())?;
        let pointwise = OpParams::Conv2d(Conv2dParams::default());
        let padded = OpParams::Conv2d(Conv2dParams::default().with_padding(1));
        let shape = TensorDesc::new(DType::F32, [1, 8, 6, 6]);
        let a = session.declare(OpKind::Conv2d, pointwise, &[x, w1], vec![shape.clone()])?;
        let b = session.declare(OpKind::Relu, OpParams::None, &[a[0]], vec![shape.clone()])?;
        let c = session.declare(OpKind::Conv2d, padded, &[b[0], w2], vec![shape])?;
        session.set_output(0, c[0])?;
        session.setup()?;
        session.update_input(0, input.clone())?;
        session.run()?;
        // A second run reuses conversion scratch buffers.
        session.run()?;
        session.output(0)
    };

    let actual = run(registry)?;
    let expected = run(&reference)?;
    let diff = fixtures::max_abs_diff(&actual, &expected)?;
    ensure!(diff <= 1e-3, "chained graph differs from reference by {diff}");
    Ok(())
}

/// Operators execute in declaration order, each exactly once per run.
pub fn execution_follows_declaration_order(registry: &Arc<KernelRegistry>) -> Result<()> {
    let recording = RecordingTable::new();
    let recorded = Arc::new(
        KernelRegistry::builder(recording.wrap(registry.reference(), "recording")?).build()?,
    );
    let mut rng = fixtures::seeded(13);
    let input = fixtures::random_f32(&mut rng, &[1, 4, 4, 4])?;
    let weights = fixtures::random_f32(&mut rng, &[4, 4, 1, 1])?;

    let mut session = Session::new(recorded, SessionOptions::default())?;
    session.set_input_number(1)?;
    session.set_output_number(1)?;
    let x = session.set_input(0, input.desc().clone())?;
    let w = session.add_constant(weights)?;
    let a = session.declare(
        OpKind::Conv2d,
        OpParams::Conv2d(Conv2dParams::default()),
        &[x, w],
        vec![TensorDesc::new(DType::F32, [1, 4, 4, 4])],
    )?;
    let b = session.declare(
        OpKind::MaxPool2d,
        OpParams::Pool2d(nnop_rs::ops::Pool2dParams::square(2, 2)),
        &a,
        vec![TensorDesc::new(DType::F32, [1, 4, 2, 2])],
    )?;
    let c = session.declare(OpKind::Relu, OpParams::None, &b, vec![TensorDesc::new(DType::F32, [1, 4, 2, 2])])?;
    session.set_output(0, c[0])?;
    session.setup()?;
    ensure!(recording.ops().is_empty(), "setup must not execute kernels");

    session.update_input(0, input)?;
    session.run()?;
    session.run()?;
    let expected = [OpKind::Conv2d, OpKind::MaxPool2d, OpKind::Relu];
    let recorded = recording.ops();
    ensure!(
        recorded == [expected, expected].concat(),
        "execution order was {recorded:?}"
    );
    Ok(())
}
