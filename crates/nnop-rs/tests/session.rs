use std::sync::Arc;

use nnop_rs::backend::registry::{BackendTable, KernelRegistry};
use nnop_rs::backend::spec::{
    ExecContext, Executor, InitContext, InitFn, KernelError, KernelRecord, KernelResult,
};
use nnop_rs::ops::{self, OpKind, OpParams};
use nnop_rs::session::{RunMode, Session, SessionOptions};
use nnop_rs::tensor::{DType, Tensor, TensorData, TensorDesc};
use nnop_rs::{NodeId, Status};

fn relu(ctx: &ExecContext<'_>) -> KernelResult<Vec<Tensor>> {
    let values = ctx.input(0)?.f32_values()?;
    if values.iter().any(|v| v.is_nan()) {
        return Err(KernelError::failure("relu input holds NaN"));
    }
    let out = values.iter().map(|v| v.max(0.0)).collect();
    Ok(vec![Tensor::new(ctx.output(0)?.canonical(), TensorData::F32(out))?])
}

fn add(ctx: &ExecContext<'_>) -> KernelResult<Vec<Tensor>> {
    let lhs = ctx.input(0)?.f32_values()?;
    let rhs = ctx.input(1)?.f32_values()?;
    let out = lhs.iter().zip(rhs).map(|(a, b)| a + b).collect();
    Ok(vec![Tensor::new(ctx.output(0)?.canonical(), TensorData::F32(out))?])
}

fn base_table() -> BackendTable {
    let mut table = BackendTable::new("base");
    table
        .register(
            OpKind::Relu,
            DType::F32,
            KernelRecord::new().exec_fn("base_relu", relu).est_fn(ops::infer_outputs),
        )
        .unwrap();
    table
        .register(
            OpKind::Add,
            DType::F32,
            KernelRecord::new().exec_fn("base_add", add).est_fn(ops::infer_outputs),
        )
        .unwrap();
    table
}

fn decline_relu(_: &InitContext<'_>) -> KernelResult<Arc<dyn Executor>> {
    Err(KernelError::unsupported_layout("picky backend only takes packed tensors"))
}

fn reject_relu(_: &InitContext<'_>) -> KernelResult<Arc<dyn Executor>> {
    Err(KernelError::shape_mismatch("broken backend rejects every shape"))
}

fn layered(init: InitFn) -> Arc<KernelRegistry> {
    let mut picky = BackendTable::new("picky");
    picky
        .register(OpKind::Relu, DType::F32, KernelRecord::new().init_fn(init))
        .unwrap();
    Arc::new(KernelRegistry::builder(base_table()).layer(picky).build().unwrap())
}

fn base() -> Arc<KernelRegistry> {
    Arc::new(KernelRegistry::builder(base_table()).build().unwrap())
}

fn desc() -> TensorDesc {
    TensorDesc::new(DType::F32, [1, 2, 2])
}

fn input(values: [f32; 4]) -> Tensor {
    Tensor::from_f32([1, 2, 2], values.to_vec()).unwrap()
}

/// `x -> relu -> a -> relu -> b`, with `b` as the only output.
fn two_relus(registry: Arc<KernelRegistry>, options: SessionOptions) -> (Session, [NodeId; 2]) {
    let mut session = Session::new(registry, options).unwrap();
    session.set_input_number(1).unwrap();
    session.set_output_number(1).unwrap();
    let x = session.set_input(0, desc()).unwrap();
    let a = session.declare(OpKind::Relu, OpParams::None, &[x], vec![desc()]).unwrap()[0];
    let b = session.declare(OpKind::Relu, OpParams::None, &[a], vec![desc()]).unwrap()[0];
    session.set_output(0, b).unwrap();
    session.setup().unwrap();
    (session, [a, b])
}

fn status_of(err: &anyhow::Error) -> Option<Status> {
    err.downcast_ref::<KernelError>().map(KernelError::status)
}

#[test]
fn runs_operators_in_declaration_order() {
    let mut session = Session::new(base(), SessionOptions::default()).unwrap();
    session.set_input_number(2).unwrap();
    session.set_output_number(1).unwrap();
    let x = session.set_input(0, desc()).unwrap();
    let y = session.set_input(1, desc()).unwrap();
    let sum = session.declare(OpKind::Add, OpParams::None, &[x, y], vec![desc()]).unwrap();
    let out = session.declare(OpKind::Relu, OpParams::None, &sum, vec![desc()]).unwrap();
    session.set_output(0, out[0]).unwrap();
    session.setup().unwrap();

    let executors: Vec<_> = session.bound_kernels().into_iter().map(|k| k.executor).collect();
    assert_eq!(executors, ["base_add", "base_relu"]);

    session.update_input(0, input([1.0, -2.0, 3.0, -4.0])).unwrap();
    session.update_input(1, input([0.5, 0.5, -5.0, 5.0])).unwrap();
    session.run().unwrap();
    assert_eq!(session.output(0).unwrap().f32_values().unwrap(), &[1.5, 0.0, 0.0, 1.0]);
}

#[test]
fn inferred_outputs_come_from_the_estimator() {
    let mut session = Session::new(base(), SessionOptions::default()).unwrap();
    session.set_input_number(1).unwrap();
    let x = session.set_input(0, desc()).unwrap();
    let inferred = session.infer_outputs(OpKind::Relu, &OpParams::None, &[x]).unwrap();
    assert_eq!(inferred, vec![desc()]);
}

#[test]
fn declined_initializer_falls_back_along_the_chain() {
    let (mut session, _) = two_relus(layered(decline_relu), SessionOptions::default());
    for kernel in session.bound_kernels() {
        assert_eq!(kernel.backend, "base");
    }
    session.update_input(0, input([-1.0, 2.0, -3.0, 4.0])).unwrap();
    session.run().unwrap();
    assert_eq!(session.output(0).unwrap().f32_values().unwrap(), &[0.0, 2.0, 0.0, 4.0]);
}

#[test]
fn non_decline_initializer_errors_are_fatal() {
    let registry = layered(reject_relu);
    let mut session = Session::new(registry, SessionOptions::default()).unwrap();
    session.set_input_number(1).unwrap();
    session.set_output_number(1).unwrap();
    let x = session.set_input(0, desc()).unwrap();
    let out = session.declare(OpKind::Relu, OpParams::None, &[x], vec![desc()]).unwrap();
    session.set_output(0, out[0]).unwrap();
    let err = session.setup().unwrap_err();
    assert_eq!(status_of(&err), Some(Status::ShapeMismatch), "{err:#}");
}

#[test]
fn backend_option_skips_earlier_layers() {
    let options = SessionOptions::default().with_backend("base");
    let (session, _) = two_relus(layered(reject_relu), options);
    assert_eq!(session.registry().backend_names(), vec!["base"]);
    assert!(Session::new(base(), SessionOptions::default().with_backend("missing")).is_err());
}

#[test]
fn intermediates_are_released_unless_kept() {
    let (mut session, [a, b]) = two_relus(base(), SessionOptions::default());
    session.update_input(0, input([1.0, -1.0, 2.0, -2.0])).unwrap();
    session.run().unwrap();
    assert!(session.value(a).is_err());
    assert!(session.value(b).is_ok());

    let (mut session, [a, _]) = two_relus(base(), SessionOptions::default().with_keep_intermediates(true));
    session.update_input(0, input([1.0, -1.0, 2.0, -2.0])).unwrap();
    session.run().unwrap();
    assert_eq!(session.value(a).unwrap().f32_values().unwrap(), &[1.0, 0.0, 2.0, 0.0]);
}

#[test]
fn a_failed_run_poisons_the_session() {
    let (mut session, _) = two_relus(base(), SessionOptions::default());
    session.update_input(0, input([f32::NAN, 0.0, 0.0, 0.0])).unwrap();
    let err = session.run().unwrap_err();
    assert_eq!(status_of(&err), Some(Status::GenericFailure), "{err:#}");
    assert!(session.output(0).is_err());

    session.update_input(0, input([1.0, 1.0, 1.0, 1.0])).unwrap();
    let err = session.run().unwrap_err();
    assert!(format!("{err:#}").contains("rebuilt"), "{err:#}");
}

#[test]
fn mismatched_input_is_rejected() {
    let (mut session, _) = two_relus(base(), SessionOptions::default());
    let wrong = Tensor::from_f32([1, 4], vec![0.0; 4]).unwrap();
    let err = session.update_input(0, wrong).unwrap_err();
    assert_eq!(status_of(&err), Some(Status::ShapeMismatch));
    assert!(session.update_input(3, input([0.0; 4])).is_err());
}

#[test]
fn lifecycle_order_is_enforced() {
    let mut session = Session::new(base(), SessionOptions::default()).unwrap();
    session.set_input_number(1).unwrap();
    session.set_output_number(1).unwrap();
    assert!(session.run().is_err());
    assert!(session.setup().is_err(), "undeclared input");
    let x = session.set_input(0, desc()).unwrap();
    assert!(session.set_input(0, desc()).is_err());
    let out = session.declare(OpKind::Relu, OpParams::None, &[x], vec![desc()]).unwrap();
    session.set_output(0, out[0]).unwrap();
    session.setup().unwrap();
    assert!(session.declare(OpKind::Relu, OpParams::None, &[x], vec![desc()]).is_err());
    assert!(session.run().is_err(), "input never fed");
}

#[test]
fn declare_checks_arity_and_params() {
    let mut session = Session::new(base(), SessionOptions::default()).unwrap();
    session.set_input_number(1).unwrap();
    let x = session.set_input(0, desc()).unwrap();
    assert!(session.declare(OpKind::Add, OpParams::None, &[x], vec![desc()]).is_err());
    assert!(session
        .declare(OpKind::Relu, OpParams::Pool2d(ops::Pool2dParams::square(2, 2)), &[x], vec![desc()])
        .is_err());
}

#[test]
fn layer_mode_runs_one_operator_at_a_time() {
    let mut session = Session::new(base(), SessionOptions::layer()).unwrap();
    assert!(session.set_input_number(1).is_err());
    let lhs = input([1.0, 2.0, 3.0, 4.0]);
    let rhs = input([-1.0, -1.0, -1.0, -1.0]);
    let out = session.run_operator(OpKind::Add, &OpParams::None, &[&lhs, &rhs], None).unwrap();
    assert_eq!(out[0].f32_values().unwrap(), &[0.0, 1.0, 2.0, 3.0]);
    let kernel = session.last_layer_kernel().unwrap();
    assert_eq!((kernel.backend.as_str(), kernel.executor.as_str()), ("base", "base_add"));
    assert!(session.run_operator(OpKind::Add, &OpParams::None, &[&lhs], None).is_err());
}

#[test]
fn options_parse_from_json_with_defaults() {
    let options = SessionOptions::from_json(r#"{"run_mode": "layer", "backend": "vector"}"#).unwrap();
    assert_eq!(options, SessionOptions::layer().with_backend("vector"));
    assert_eq!(options.run_mode, RunMode::Layer);
    assert!(!options.keep_intermediates);
    assert_eq!(SessionOptions::from_json("{}").unwrap(), SessionOptions::default());
    assert!(SessionOptions::from_json(r#"{"run_mode": "eager"}"#).is_err());
}
