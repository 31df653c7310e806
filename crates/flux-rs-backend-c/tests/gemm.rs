mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use common::{assert_close, backend, buffer, random_values};
use flux_rs::backend::Backend;
use flux_rs::gemm::{GemmArgs, RecipeKey, RecipeMultiply, RecipeRuntime, ScalarType};
use flux_rs::kernel::Kernel;
use flux_rs::matrix::{DType, MatrixTraits};
use flux_rs::{BackendError, BackendResult};
use flux_rs_backend_c::{HostBackend, HostEvent, HostQueue};

/// Column-major reference multiply queued on the host backend.
struct NaiveRecipes {
    backend: Arc<HostBackend>,
    recipes: AtomicUsize,
    submits: AtomicUsize,
}

impl NaiveRecipes {
    fn new(backend: Arc<HostBackend>) -> Arc<Self> {
        Arc::new(Self {
            backend,
            recipes: AtomicUsize::new(0),
            submits: AtomicUsize::new(0),
        })
    }
}

impl RecipeRuntime for NaiveRecipes {
    type Backend = HostBackend;
    type Recipe = RecipeKey;
    type Handler = Mutex<Option<GemmArgs>>;

    fn backend(&self) -> &Arc<HostBackend> {
        &self.backend
    }

    fn create_recipe(&self, key: RecipeKey) -> BackendResult<RecipeKey> {
        if key.scalar != ScalarType::F64 {
            return Err(BackendError::recipe("naive_recipe_create", 1));
        }
        self.recipes.fetch_add(1, Ordering::Relaxed);
        Ok(key)
    }

    fn release_recipe(&self, _recipe: &RecipeKey) {}

    fn create_handler(&self, _recipe: &RecipeKey) -> BackendResult<Self::Handler> {
        Ok(Mutex::new(None))
    }

    fn release_handler(&self, _handler: &Self::Handler) {}

    fn set_args(&self, handler: &Self::Handler, args: &GemmArgs) -> BackendResult<()> {
        *handler.lock().unwrap() = Some(*args);
        Ok(())
    }

    fn submit(
        &self,
        handler: &Self::Handler,
        queue: &HostQueue,
        wait_for: &[HostEvent],
        ret_evt: bool,
    ) -> BackendResult<Option<HostEvent>> {
        self.submits.fetch_add(1, Ordering::Relaxed);
        let g = handler.lock().unwrap().expect("arguments set before submit");
        let event = queue.submit(
            "gemm",
            wait_for,
            Box::new(move || {
                let a = g.a as *const f64;
                let b = g.b as *const f64;
                let c = g.c as *mut f64;
                for j in 0..g.n {
                    for i in 0..g.m {
                        let mut acc = 0.0;
                        for p in 0..g.k {
                            // SAFETY: Operands are live host buffers sized by their traits.
                            acc += unsafe { *a.add(i + p * g.lda) * *b.add(p + j * g.ldb) };
                        }
                        // SAFETY: As above.
                        unsafe {
                            let dst = c.add(i + j * g.ldc);
                            *dst = g.alpha * acc + g.beta * *dst;
                        }
                    }
                }
            }),
        )?;
        Ok(ret_evt.then_some(event))
    }
}

fn reference(a: &[f64], b: &[f64], c: &[f64], (m, k, n): (usize, usize, usize), alpha: f64, beta: f64) -> Vec<f64> {
    let mut out = c.to_vec();
    for i in 0..m {
        for j in 0..n {
            let dot: f64 = (0..k).map(|p| a[i * k + p] * b[p * n + j]).sum();
            out[i * n + j] = alpha * dot + beta * c[i * n + j];
        }
    }
    out
}

#[test]
fn multiply_matches_host_reference_and_restores_destination() -> anyhow::Result<()> {
    let Some(backend) = backend() else {
        return Ok(());
    };
    let (m, k, n) = (37, 6, 5);
    let a_vals = random_values(50, m * k);
    let b_vals = random_values(51, k * n);
    let c_vals = random_values(52, m * n);
    let a = buffer(DType::F64, &a_vals);
    let b = buffer(DType::F64, &b_vals);
    let c = buffer(DType::F64, &c_vals);

    let recipes = NaiveRecipes::new(Arc::clone(&backend));
    let gemm = RecipeMultiply::new(Arc::clone(&recipes));
    let kernel = gemm.mul(
        &a.matrix(MatrixTraits::new(m, k, DType::F64)),
        &b.matrix(MatrixTraits::new(k, n, DType::F64)),
        &c.matrix(MatrixTraits::new(m, n, DType::F64)),
        1.5,
        -0.5,
    )?;

    assert_eq!(recipes.submits.load(Ordering::Relaxed), 1);
    assert_eq!(c.read_values(DType::F64), c_vals);

    let queue = backend.create_queue()?;
    kernel.run(&queue, &[], false)?;
    queue.finish()?;
    assert_close(
        &c.read_values(DType::F64),
        &reference(&a_vals, &b_vals, &c_vals, (m, k, n), 1.5, -0.5),
        1e-12,
    );
    Ok(())
}

#[test]
fn recipes_are_shared_across_data_widths() -> anyhow::Result<()> {
    let Some(backend) = backend() else {
        return Ok(());
    };
    let (m, k) = (3, 4);
    let a = buffer(DType::F64, &random_values(60, m * k));
    let recipes = NaiveRecipes::new(Arc::clone(&backend));
    let gemm = RecipeMultiply::new(Arc::clone(&recipes));

    let mut keep = Vec::new();
    for n in [8, 16, 8] {
        let b = buffer(DType::F64, &random_values(61, k * n));
        let c = buffer(DType::F64, &vec![0.0; m * n]);
        keep.push(gemm.mul(
            &a.matrix(MatrixTraits::new(m, k, DType::F64)),
            &b.matrix(MatrixTraits::new(k, n, DType::F64)),
            &c.matrix(MatrixTraits::new(m, n, DType::F64)),
            1.0,
            0.0,
        )?);
    }

    // The data width is the recipe's free dimension.
    assert_eq!(recipes.recipes.load(Ordering::Relaxed), 1);
    assert_eq!(gemm.recipe_count(), 1);
    assert_eq!(gemm.benchmark_count(), 2);
    assert_eq!(recipes.submits.load(Ordering::Relaxed), 2);
    Ok(())
}

#[test]
fn recipe_failures_propagate() {
    let Some(backend) = backend() else {
        return;
    };
    let a = buffer(DType::F32, &[1.0; 4]);
    let recipes = NaiveRecipes::new(Arc::clone(&backend));
    let gemm = RecipeMultiply::new(recipes);
    let traits = MatrixTraits::new(2, 2, DType::F32);
    let err = gemm
        .mul(&a.matrix(traits), &a.matrix(traits), &a.matrix(traits), 1.0, 0.0)
        .err()
        .expect("recipe creation fails");
    assert!(matches!(err, BackendError::Recipe { status: 1, .. }));
}
