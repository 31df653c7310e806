mod common;

use common::RecordingBackend;
use flux_rs::generator::{Intent, KernelArg, PointwiseSpec};
use flux_rs::kernel::{ArgValue, Kernel};
use flux_rs::matrix::{DType, Matrix, MatrixTraits};
use flux_rs::pointwise::KernelOperands;
use flux_rs::runtime::Runtime;
use flux_rs::template::{TemplateArgs, TemplateContext};
use flux_rs::BackendResult;

fn touch(ctx: &TemplateContext<'_>) -> BackendResult<PointwiseSpec> {
    let label = ctx.args.str("label")?;
    Ok(PointwiseSpec::new(
        label,
        1,
        vec![KernelArg::array("u", ctx.fpdtype, Intent::InOut)],
        "u_v[_x] += 1;",
    ))
}

fn gain(ctx: &TemplateContext<'_>) -> BackendResult<PointwiseSpec> {
    Ok(PointwiseSpec::new(
        "gain",
        1,
        vec![
            KernelArg::scalar("g", ctx.fpdtype),
            KernelArg::array("u", ctx.fpdtype, Intent::InOut),
        ],
        "u_v[_x] *= g;",
    ))
}

fn runtime() -> Runtime<RecordingBackend> {
    let runtime = Runtime::new(RecordingBackend::shared());
    runtime.register("tests.kernels.touch", touch);
    runtime.register("tests.kernels.gain", gain);
    runtime
}

/// Member that never hands back a completion event.
struct Silent;

impl Kernel<RecordingBackend> for Silent {
    fn run(&self, _queue: &(), _wait_for: &[u64], _ret_evt: bool) -> BackendResult<Option<u64>> {
        Ok(None)
    }
}

type Member = Box<dyn Kernel<RecordingBackend> + Send>;

fn touch_kernel(runtime: &Runtime<RecordingBackend>, label: &str) -> Member {
    let u = Matrix::new(0x100, MatrixTraits::new(32, 1, DType::F64));
    let kernel = runtime
        .kernel(
            "touch",
            &TemplateArgs::new().with("label", label),
            &[32],
            &KernelOperands::new().matrix("u", u),
        )
        .expect("touch kernel builds");
    Box::new(kernel)
}

#[test]
fn ordered_composite_chains_each_member_on_its_predecessor() -> anyhow::Result<()> {
    let rt = runtime();
    let composite = rt.ordered(vec![
        touch_kernel(&rt, "k1"),
        touch_kernel(&rt, "k2"),
        touch_kernel(&rt, "k3"),
    ]);

    let done = composite.run(&(), &[42], true)?;
    let subs = rt.backend().submissions();
    let labels: Vec<&str> = subs.iter().map(|s| s.label.as_str()).collect();
    assert_eq!(labels, ["k1", "k2", "k3"]);

    assert_eq!(subs[0].waited_on, [42]);
    assert_eq!(subs[1].waited_on, [subs[0].event.unwrap()]);
    assert_eq!(subs[2].waited_on, [subs[1].event.unwrap()]);
    assert_eq!(done, subs[2].event);
    Ok(())
}

#[test]
fn ordered_composite_without_event_returns_none() -> anyhow::Result<()> {
    let rt = runtime();
    let composite = rt.ordered(vec![touch_kernel(&rt, "k1"), touch_kernel(&rt, "k2")]);
    assert_eq!(composite.run(&(), &[], false)?, None);
    let subs = rt.backend().submissions();
    assert!(subs[0].event.is_some());
    assert_eq!(subs[1].event, None);
    Ok(())
}

#[test]
fn unordered_composite_shares_one_wait_set_and_joins_with_a_marker() -> anyhow::Result<()> {
    let rt = runtime();
    let composite = rt.unordered(vec![touch_kernel(&rt, "k1"), touch_kernel(&rt, "k2")]);

    let joined = composite.run(&(), &[7, 8], true)?;
    let subs = rt.backend().submissions();
    assert_eq!(subs.len(), 3);
    assert_eq!(subs[0].waited_on, [7, 8]);
    assert_eq!(subs[1].waited_on, [7, 8]);

    let marker = &subs[2];
    assert_eq!(marker.label, "marker");
    assert_eq!(
        marker.waited_on,
        [subs[0].event.unwrap(), subs[1].event.unwrap()]
    );
    assert_eq!(joined, marker.event);
    Ok(())
}

#[test]
fn unordered_composite_without_event_adds_no_marker() -> anyhow::Result<()> {
    let rt = runtime();
    let composite = rt.unordered(vec![touch_kernel(&rt, "k1"), touch_kernel(&rt, "k2")]);
    assert_eq!(composite.run(&(), &[3], false)?, None);
    let subs = rt.backend().submissions();
    assert_eq!(subs.len(), 2);
    assert!(subs.iter().all(|s| s.waited_on == [3] && s.event.is_none()));
    Ok(())
}

#[test]
#[should_panic(expected = "at least one kernel")]
fn empty_ordered_composite_panics() {
    let rt = runtime();
    let _ = rt.ordered(Vec::new());
}

#[test]
#[should_panic(expected = "at least one kernel")]
fn empty_unordered_composite_panics() {
    let rt = runtime();
    let _ = rt.unordered(Vec::new());
}

#[test]
fn identical_instantiations_share_one_program() {
    let rt = runtime();
    let _a = touch_kernel(&rt, "same");
    let _b = touch_kernel(&rt, "same");
    assert_eq!(rt.backend().builds(), 1);
    let _c = touch_kernel(&rt, "other");
    assert_eq!(rt.backend().builds(), 2);
}

#[test]
fn composite_bind_hands_each_member_its_own_slice() -> anyhow::Result<()> {
    let rt = runtime();
    let traits = MatrixTraits::new(32, 1, DType::F64);
    let x0 = Matrix::new(0x100, traits);
    let x1 = Matrix::new(0x200, traits);
    let gain = rt.kernel(
        "gain",
        &TemplateArgs::new(),
        &[32],
        &KernelOperands::new().runtime("g").matrix("u", x0),
    )?;
    let axnpby = rt.axnpby(&[&x0, &x1], None)?;

    let members: Vec<Member> = vec![Box::new(gain), touch_kernel(&rt, "k1"), Box::new(axnpby)];
    let mut composite = rt.ordered(members);
    assert_eq!(composite.runtime_arity(), 3);
    composite.bind(&[0.5, 2.0, -1.0]);
    composite.run(&(), &[], false)?;
    composite.bind(&[4.0, 1.0, 0.0]);
    composite.run(&(), &[], false)?;

    let subs = rt.backend().submissions();
    let scalars = |index: usize| -> Vec<ArgValue> {
        let args = subs[index].args.as_ref().expect("launch records arguments");
        args.values()
            .iter()
            .copied()
            .filter(|value| matches!(value, ArgValue::F64(_)))
            .collect()
    };
    assert_eq!(scalars(0), [ArgValue::F64(0.5)]);
    assert_eq!(scalars(2), [ArgValue::F64(2.0), ArgValue::F64(-1.0)]);
    assert_eq!(scalars(3), [ArgValue::F64(4.0)]);
    assert_eq!(scalars(5), [ArgValue::F64(1.0), ArgValue::F64(0.0)]);
    Ok(())
}

#[test]
fn unordered_bind_follows_member_order() -> anyhow::Result<()> {
    let rt = runtime();
    let traits = MatrixTraits::new(32, 1, DType::F64);
    let x0 = Matrix::new(0x100, traits);
    let members: Vec<Member> = vec![
        Box::new(rt.axnpby(&[&x0], None)?),
        Box::new(rt.axnpby(&[&x0], None)?),
    ];
    let mut composite = rt.unordered(members);
    composite.bind(&[3.0, 5.0]);
    composite.run(&(), &[], false)?;

    let subs = rt.backend().submissions();
    let weight = |index: usize| subs[index].args.as_ref().map(|args| args.values()[4]);
    assert_eq!(weight(0), Some(ArgValue::F64(3.0)));
    assert_eq!(weight(1), Some(ArgValue::F64(5.0)));
    Ok(())
}

#[test]
#[should_panic(expected = "composite expects 2 runtime arguments, got 1")]
fn composite_bind_checks_the_total_count() {
    let rt = runtime();
    let x0 = Matrix::new(0x100, MatrixTraits::new(32, 1, DType::F64));
    let x1 = Matrix::new(0x200, MatrixTraits::new(32, 1, DType::F64));
    let members: Vec<Member> = vec![
        touch_kernel(&rt, "k1"),
        Box::new(rt.axnpby(&[&x0, &x1], None).expect("axnpby builds")),
    ];
    let mut composite = rt.ordered(members);
    composite.bind(&[1.0]);
}

#[test]
fn members_without_events_fail_both_composites() {
    let rt = runtime();
    let members: Vec<Member> = vec![Box::new(Silent), touch_kernel(&rt, "k1")];
    let ordered = rt.ordered(members);
    let err = ordered.run(&(), &[], false).err().expect("ordered run fails");
    assert!(err.to_string().contains("completion event"), "{err}");

    let members: Vec<Member> = vec![touch_kernel(&rt, "k2"), Box::new(Silent)];
    let unordered = rt.unordered(members);
    let err = unordered.run(&(), &[], true).err().expect("unordered run fails");
    assert!(err.to_string().contains("completion event"), "{err}");
    assert!(rt.backend().submissions().iter().all(|s| s.label != "marker"));
}
