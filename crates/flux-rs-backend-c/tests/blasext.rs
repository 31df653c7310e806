mod common;

use common::{assert_close, backend, buffer, random_values};
use flux_rs::backend::Backend;
use flux_rs::blasext::{Norm, ReductionMethod};
use flux_rs::kernel::Kernel;
use flux_rs::matrix::{DType, MatrixTraits};
use flux_rs::runtime::Runtime;
use flux_rs_backend_c::HostBuffer;

#[test]
fn axnpby_with_unit_and_zero_weights_leaves_destination_unchanged() -> anyhow::Result<()> {
    let Some(backend) = backend() else {
        return Ok(());
    };
    let rt = Runtime::new(backend);
    let traits = MatrixTraits::new(37, 3, DType::F64).with_leaddim(4);
    let x0_vals = random_values(1, 37 * 4);
    let x0 = buffer(DType::F64, &x0_vals);
    let x1 = buffer(DType::F64, &random_values(2, 37 * 4));

    let mut kernel = rt.axnpby(&[&x0.matrix(traits), &x1.matrix(traits)], None)?;
    kernel.bind(&[1.0, 0.0]);
    let queue = rt.backend().create_queue()?;
    kernel.run(&queue, &[], false)?;
    queue.finish()?;

    assert_eq!(x0.read_values(DType::F64), x0_vals);
    Ok(())
}

#[test]
fn axnpby_matches_host_weighted_sum() -> anyhow::Result<()> {
    let Some(backend) = backend() else {
        return Ok(());
    };
    let rt = Runtime::new(backend);
    let traits = MatrixTraits::new(300, 5, DType::F64);
    let n = traits.rows * traits.leaddim;
    let vals: Vec<Vec<f64>> = (0..3).map(|i| random_values(10 + i, n)).collect();
    let bufs: Vec<HostBuffer> = vals.iter().map(|v| buffer(DType::F64, v)).collect();
    let mats: Vec<_> = bufs.iter().map(|b| b.matrix(traits)).collect();

    let weights = [0.5, 2.0, -1.0];
    let mut kernel = rt.axnpby(&[&mats[0], &mats[1], &mats[2]], None)?;
    kernel.bind(&weights);
    let queue = rt.backend().create_queue()?;
    kernel.run(&queue, &[], false)?;
    queue.finish()?;

    let expected: Vec<f64> = (0..n)
        .map(|i| weights[0] * vals[0][i] + weights[1] * vals[1][i] + weights[2] * vals[2][i])
        .collect();
    assert_close(&bufs[0].read_values(DType::F64), &expected, 1e-12);
    Ok(())
}

#[test]
fn axnpby_column_subset_leaves_other_columns_untouched() -> anyhow::Result<()> {
    let Some(backend) = backend() else {
        return Ok(());
    };
    let rt = Runtime::new(backend);
    let traits = MatrixTraits::new(50, 3, DType::F32);
    let n = traits.rows * traits.leaddim;
    let before = buffer(DType::F32, &random_values(3, n)).read_values(DType::F32);
    let x0 = buffer(DType::F32, &before);
    let x1 = buffer(DType::F32, &vec![1.0; n]);

    let mut kernel = rt.axnpby(&[&x0.matrix(traits), &x1.matrix(traits)], Some(&[1]))?;
    kernel.bind(&[2.0, 3.0]);
    let queue = rt.backend().create_queue()?;
    kernel.run(&queue, &[], false)?;
    queue.finish()?;

    let after = x0.read_values(DType::F32);
    for row in 0..traits.rows {
        for col in 0..traits.cols {
            let idx = traits.offset(row, col);
            if col == 1 {
                assert_close(&[after[idx]], &[2.0 * before[idx] + 3.0], 1e-6);
            } else {
                assert_eq!(after[idx].to_bits(), before[idx].to_bits());
            }
        }
    }
    Ok(())
}

#[test]
fn axnpby_with_zero_first_weight_ignores_destination_contents() -> anyhow::Result<()> {
    let Some(backend) = backend() else {
        return Ok(());
    };
    let rt = Runtime::new(backend);
    let traits = MatrixTraits::new(8, 2, DType::F64);
    let x0 = buffer(DType::F64, &[f64::NAN; 16]);
    let x1_vals = random_values(4, 16);
    let x1 = buffer(DType::F64, &x1_vals);

    let mut kernel = rt.axnpby(&[&x0.matrix(traits), &x1.matrix(traits)], None)?;
    kernel.bind(&[0.0, 1.0]);
    let queue = rt.backend().create_queue()?;
    kernel.run(&queue, &[], false)?;
    queue.finish()?;
    assert_eq!(x0.read_values(DType::F64), x1_vals);
    Ok(())
}

#[test]
fn copy_is_bit_identical_and_idempotent_for_every_element_type() -> anyhow::Result<()> {
    let Some(backend) = backend() else {
        return Ok(());
    };
    let rt = Runtime::new(backend);
    let queue = rt.backend().create_queue()?;
    for (seed, dtype) in [(5, DType::F32), (6, DType::F64), (7, DType::I32)] {
        let traits = MatrixTraits::new(13, 3, dtype).with_leaddim(5);
        let values: Vec<f64> = random_values(seed, 13 * 5)
            .iter()
            .map(|v| v * 1000.0)
            .collect();
        let src = buffer(dtype, &values);
        let dst = HostBuffer::zeroed(traits.nbytes())?;

        let kernel = rt.copy(&dst.matrix(traits), &src.matrix(traits))?;
        kernel.run(&queue, &[], false)?;
        queue.finish()?;
        assert_eq!(dst.read(), src.read());

        kernel.run(&queue, &[], false)?;
        queue.finish()?;
        assert_eq!(dst.read(), src.read());
    }
    Ok(())
}

#[test]
fn uniform_reduction_of_a_constant_field_returns_the_constant() -> anyhow::Result<()> {
    let Some(backend) = backend() else {
        return Ok(());
    };
    let rt = Runtime::new(backend);
    let traits = MatrixTraits::new(300, 4, DType::F64).with_leaddim(6);
    let n = traits.rows * traits.leaddim;
    let cur = buffer(DType::F64, &vec![2.5; n]);
    let prev = buffer(DType::F64, &vec![0.0; n]);

    let mut kernel = rt.reduction(
        &[&cur.matrix(traits), &prev.matrix(traits)],
        ReductionMethod::Resid,
        Norm::Uniform,
        None,
    )?;
    kernel.bind(&[1.0]);
    let queue = rt.backend().create_queue()?;
    kernel.run(&queue, &[], false)?;
    queue.finish()?;
    assert_eq!(kernel.retval()?, vec![2.5; 4]);
    Ok(())
}

#[test]
fn sum_reduction_over_ones_returns_row_count() -> anyhow::Result<()> {
    let Some(backend) = backend() else {
        return Ok(());
    };
    let rt = Runtime::new(backend);
    let traits = MatrixTraits::new(257, 3, DType::F32);
    let n = traits.rows * traits.leaddim;
    let cur = buffer(DType::F32, &vec![1.0; n]);
    let prev = buffer(DType::F32, &vec![0.0; n]);

    let mut kernel = rt.reduction(
        &[&cur.matrix(traits), &prev.matrix(traits)],
        ReductionMethod::Resid,
        Norm::L2,
        None,
    )?;
    assert_eq!(kernel.nblocks(), 3);
    kernel.bind(&[1.0]);
    let queue = rt.backend().create_queue()?;
    kernel.run(&queue, &[], false)?;
    queue.finish()?;
    assert_eq!(kernel.retval()?, vec![257.0; 3]);
    Ok(())
}

#[test]
fn errest_reduction_scales_by_tolerances() -> anyhow::Result<()> {
    let Some(backend) = backend() else {
        return Ok(());
    };
    let rt = Runtime::new(backend);
    let traits = MatrixTraits::new(130, 2, DType::F64);
    let n = traits.rows * traits.leaddim;
    let err = random_values(20, n);
    let cur = random_values(21, n);
    let prev = random_values(22, n);
    let (atol, rtol) = (1e-3, 1e-2);

    let bufs = [
        buffer(DType::F64, &err),
        buffer(DType::F64, &cur),
        buffer(DType::F64, &prev),
    ];
    let mut kernel = rt.reduction(
        &[
            &bufs[0].matrix(traits),
            &bufs[1].matrix(traits),
            &bufs[2].matrix(traits),
        ],
        ReductionMethod::Errest,
        Norm::L2,
        None,
    )?;
    kernel.bind(&[atol, rtol]);
    let queue = rt.backend().create_queue()?;
    kernel.run(&queue, &[], false)?;
    queue.finish()?;

    let expected: Vec<f64> = (0..traits.cols)
        .map(|col| {
            (0..traits.rows)
                .map(|row| {
                    let i = traits.offset(row, col);
                    let e = err[i] / (atol + rtol * cur[i].abs().max(prev[i].abs()));
                    e * e
                })
                .sum()
        })
        .collect();
    assert_close(&kernel.retval()?, &expected, 1e-9);
    Ok(())
}

#[test]
fn resid_reduction_divides_by_timestep_matrix() -> anyhow::Result<()> {
    let Some(backend) = backend() else {
        return Ok(());
    };
    let rt = Runtime::new(backend);
    let traits = MatrixTraits::new(20, 2, DType::F64);
    let n = traits.rows * traits.leaddim;
    let cur = buffer(DType::F64, &vec![3.0; n]);
    let prev = buffer(DType::F64, &vec![1.0; n]);
    let dt = buffer(DType::F64, &vec![4.0; n]);

    let mut kernel = rt.reduction(
        &[&cur.matrix(traits), &prev.matrix(traits)],
        ReductionMethod::Resid,
        Norm::Uniform,
        Some(&dt.matrix(traits)),
    )?;
    kernel.bind(&[0.5]);
    let queue = rt.backend().create_queue()?;
    kernel.run(&queue, &[], false)?;
    queue.finish()?;
    assert_eq!(kernel.retval()?, vec![1.0; 2]);
    Ok(())
}
