mod common;

use common::{backend, buffer, random_values};
use flux_rs::backend::Backend;
use flux_rs::generator::{Intent, KernelArg, PointwiseSpec};
use flux_rs::kernel::Kernel;
use flux_rs::matrix::{DType, MatrixTraits, View};
use flux_rs::pointwise::KernelOperands;
use flux_rs::runtime::Runtime;
use flux_rs::template::{TemplateArgs, TemplateContext};
use flux_rs::{BackendError, BackendResult};
use flux_rs_backend_c::{HostBackend, HostBuffer};

fn affine(ctx: &TemplateContext<'_>) -> BackendResult<PointwiseSpec> {
    let nvars = ctx.args.usize("nvars")?;
    Ok(PointwiseSpec::new(
        "affine",
        1,
        vec![
            KernelArg::scalar("a", ctx.fpdtype),
            KernelArg::scalar("t", ctx.fpdtype),
            KernelArg::array("u", ctx.fpdtype, Intent::InOut),
        ],
        format!(
            "for (int v = 0; v < {nvars}; ++v)\n    u_v[X_IDX_AOSOA(v, {nvars})] = a*u_v[X_IDX_AOSOA(v, {nvars})] + t;"
        ),
    ))
}

fn shift_rows(ctx: &TemplateContext<'_>) -> BackendResult<PointwiseSpec> {
    Ok(PointwiseSpec::new(
        "shift_rows",
        2,
        vec![
            KernelArg::array("src", ctx.fpdtype, Intent::In),
            KernelArg::array("dst", ctx.fpdtype, Intent::Out),
        ],
        "dst_v[_y*lddst + _x] = src_v[_y*ldsrc + _x] + _y;",
    ))
}

fn gather(ctx: &TemplateContext<'_>) -> BackendResult<PointwiseSpec> {
    Ok(PointwiseSpec::new(
        "gather",
        1,
        vec![
            KernelArg::view("f", ctx.fpdtype, Intent::In, 1),
            KernelArg::array_nd("out", ctx.fpdtype, Intent::Out, 1),
        ],
        "for (int v = 0; v < 2; ++v)\n    out_v[ldout*v + _x] = f_v[f_vix[_x] + f_vcstri[_x]*v];",
    ))
}

fn runtime(backend: std::sync::Arc<HostBackend>) -> Runtime<HostBackend> {
    let rt = Runtime::new(backend);
    rt.register("solver.kernels.affine", affine);
    rt.register("solver.kernels.shift_rows", shift_rows);
    rt.register("solver.kernels.gather", gather);
    rt
}

#[test]
fn runtime_scalars_are_rebound_between_runs() -> anyhow::Result<()> {
    let Some(backend) = backend() else {
        return Ok(());
    };
    let rt = runtime(backend);
    let soa = rt.backend().config().soa_size;
    let npts = 2 * soa + 5;
    let nvars = 3;
    let len = npts.div_ceil(soa) * soa * nvars;
    let u = buffer(DType::F64, &vec![1.0; len]);
    let traits = MatrixTraits::new(1, len, DType::F64);

    let mut kernel = rt.kernel(
        "affine",
        &TemplateArgs::new().with("nvars", nvars),
        &[npts],
        &KernelOperands::new()
            .scalar("a", 2.0)
            .runtime("t")
            .matrix("u", u.matrix(traits)),
    )?;
    let queue = rt.backend().create_queue()?;

    kernel.bind(&[1.0]);
    kernel.run(&queue, &[], false)?;
    kernel.bind(&[-3.0]);
    kernel.run(&queue, &[], false)?;
    queue.finish()?;

    let values = u.read_values(DType::F64);
    for x in 0..npts {
        for v in 0..nvars {
            let idx = ((x / soa) * nvars + v) * soa + x % soa;
            assert_eq!(values[idx], 2.0 * (2.0 * 1.0 + 1.0) - 3.0, "point {x} var {v}");
        }
    }
    let touched = npts * nvars;
    assert_eq!(values.iter().filter(|v| **v == 3.0).count(), touched);
    Ok(())
}

#[test]
fn two_dimensional_kernels_cover_every_row() -> anyhow::Result<()> {
    let Some(backend) = backend() else {
        return Ok(());
    };
    let rt = runtime(backend);
    let (ny, nx) = (4, 9);
    let src_traits = MatrixTraits::new(ny, nx, DType::F64).with_leaddim(11);
    let dst_traits = MatrixTraits::new(ny, nx, DType::F64).with_leaddim(10);
    let src_vals = random_values(30, ny * 11);
    let src = buffer(DType::F64, &src_vals);
    let dst = HostBuffer::zeroed(dst_traits.nbytes())?;

    let kernel = rt.kernel(
        "shift_rows",
        &TemplateArgs::new(),
        &[ny, nx],
        &KernelOperands::new()
            .matrix("src", src.matrix(src_traits))
            .matrix("dst", dst.matrix(dst_traits)),
    )?;
    let queue = rt.backend().create_queue()?;
    kernel.run(&queue, &[], false)?;
    queue.finish()?;

    let out = dst.read_values(DType::F64);
    for y in 0..ny {
        for x in 0..nx {
            assert_eq!(out[y * 10 + x], src_vals[y * 11 + x] + y as f64);
        }
    }
    Ok(())
}

#[test]
fn views_gather_through_index_and_stride_arrays() -> anyhow::Result<()> {
    let Some(backend) = backend() else {
        return Ok(());
    };
    let rt = runtime(backend);
    let data: Vec<f64> = (0..20).map(f64::from).collect();
    let f_data = buffer(DType::F64, &data);
    let vix = HostBuffer::from_i32(&[7, 0, 3])?;
    let vcstri = HostBuffer::from_i32(&[10, 1, 5])?;
    let out_traits = MatrixTraits::new(2, 3, DType::F64).with_leaddim(4);
    let out = HostBuffer::zeroed(out_traits.nbytes())?;

    let view = View::new(f_data.addr(), vix.addr(), DType::F64).with_col_strides(vcstri.addr());
    let kernel = rt.kernel(
        "gather",
        &TemplateArgs::new(),
        &[3],
        &KernelOperands::new()
            .view("f", view)
            .matrix("out", out.matrix(out_traits)),
    )?;
    let queue = rt.backend().create_queue()?;
    kernel.run(&queue, &[], false)?;
    queue.finish()?;

    let values = out.read_values(DType::F64);
    assert_eq!(&values[0..3], &[7.0, 0.0, 3.0]);
    assert_eq!(&values[4..7], &[17.0, 1.0, 8.0]);
    Ok(())
}

#[test]
fn repeated_instantiation_compiles_once() -> anyhow::Result<()> {
    let Some(backend) = backend() else {
        return Ok(());
    };
    let rt = runtime(backend);
    let u = buffer(DType::F64, &vec![0.0; 64]);
    let traits = MatrixTraits::new(1, 64, DType::F64);
    let operands = KernelOperands::new()
        .scalar("a", 1.0)
        .scalar("t", 0.0)
        .matrix("u", u.matrix(traits));

    for _ in 0..3 {
        rt.kernel("affine", &TemplateArgs::new().with("nvars", 1), &[16], &operands)?;
    }
    assert_eq!(rt.backend().programs_built(), 1);

    rt.kernel("affine", &TemplateArgs::new().with("nvars", 2), &[16], &operands)?;
    assert_eq!(rt.backend().programs_built(), 2);
    Ok(())
}

#[test]
fn unknown_template_is_reported() {
    let Some(backend) = backend() else {
        return;
    };
    let rt = runtime(backend);
    let err = rt
        .kernel("missing", &TemplateArgs::new(), &[4], &KernelOperands::new())
        .err()
        .expect("unknown template");
    assert!(matches!(err, BackendError::Template { .. }));
}

#[test]
fn compile_errors_surface_as_execution_errors() {
    let Some(backend) = backend() else {
        return;
    };
    let rt = runtime(backend);
    rt.register("broken", |ctx: &TemplateContext<'_>| {
        Ok(PointwiseSpec::new(
            "broken",
            1,
            vec![KernelArg::scalar("a", ctx.fpdtype)],
            "this is not C;",
        ))
    });
    let err = rt
        .kernel("broken", &TemplateArgs::new(), &[4], &KernelOperands::new().scalar("a", 1.0))
        .err()
        .expect("compile failure");
    assert!(matches!(err, BackendError::Execution { .. }));
}
