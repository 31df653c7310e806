//! Matrix multiply through an external autotuned recipe library.
//!
//! Recipes are compiled once per `(scalar type, n, k)` and shared across
//! output widths. Every distinct full call signature is timed once with a
//! real submission; the destination is saved beforehand and restored
//! afterwards because the timed run overwrites it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::backend::Backend;
use crate::error::{BackendError, BackendResult};
use crate::kernel::Kernel;
use crate::matrix::{DType, Matrix};
use crate::profiling;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScalarType {
    F32,
    F64,
}

impl ScalarType {
    pub fn from_dtype(dtype: DType) -> BackendResult<Self> {
        match dtype {
            DType::F32 => Ok(ScalarType::F32),
            DType::F64 => Ok(ScalarType::F64),
            DType::I32 => Err(BackendError::incompatible(
                "matrix multiply needs floating point operands",
            )),
        }
    }

    pub fn size_bytes(self) -> usize {
        match self {
            ScalarType::F32 => 4,
            ScalarType::F64 => 8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RecipeKey {
    pub scalar: ScalarType,
    pub n: usize,
    pub k: usize,
}

/// Everything that can change the runtime of a multiply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MulSignature {
    dtype: DType,
    alpha_bits: u64,
    beta_bits: u64,
    m: usize,
    n: usize,
    k: usize,
    lda: usize,
    ldb: usize,
    ldc: usize,
}

impl MulSignature {
    fn of(args: &GemmArgs) -> Self {
        Self {
            dtype: match args.scalar {
                ScalarType::F32 => DType::F32,
                ScalarType::F64 => DType::F64,
            },
            alpha_bits: args.alpha.to_bits(),
            beta_bits: args.beta.to_bits(),
            m: args.m,
            n: args.n,
            k: args.k,
            lda: args.lda,
            ldb: args.ldb,
            ldc: args.ldc,
        }
    }
}

/// Arguments handed to a recipe handler, in the library's column-major
/// convention.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GemmArgs {
    pub scalar: ScalarType,
    pub m: usize,
    pub n: usize,
    pub k: usize,
    pub alpha: f64,
    pub beta: f64,
    pub a: u64,
    pub lda: usize,
    pub b: u64,
    pub ldb: usize,
    pub c: u64,
    pub ldc: usize,
}

/// Vendor recipe library bound to one backend device.
pub trait RecipeRuntime: Send + Sync + Sized + 'static {
    type Backend: Backend;
    type Recipe: Send + Sync;
    type Handler: Send + Sync;

    fn backend(&self) -> &Arc<Self::Backend>;

    fn create_recipe(&self, key: RecipeKey) -> BackendResult<Self::Recipe>;

    fn release_recipe(&self, recipe: &Self::Recipe);

    fn create_handler(&self, recipe: &Self::Recipe) -> BackendResult<Self::Handler>;

    fn release_handler(&self, handler: &Self::Handler);

    fn set_args(&self, handler: &Self::Handler, args: &GemmArgs) -> BackendResult<()>;

    fn submit(
        &self,
        handler: &Self::Handler,
        queue: &<Self::Backend as Backend>::Queue,
        wait_for: &[<Self::Backend as Backend>::Event],
        ret_evt: bool,
    ) -> BackendResult<Option<<Self::Backend as Backend>::Event>>;
}

/// A recipe released when the last owner drops it.
pub struct OwnedRecipe<R: RecipeRuntime> {
    runtime: Arc<R>,
    recipe: R::Recipe,
}

impl<R: RecipeRuntime> OwnedRecipe<R> {
    pub fn get(&self) -> &R::Recipe {
        &self.recipe
    }
}

impl<R: RecipeRuntime> Drop for OwnedRecipe<R> {
    fn drop(&mut self) {
        self.runtime.release_recipe(&self.recipe);
    }
}

/// A handler released on every exit path, including failures between
/// creation and submission.
pub struct OwnedHandler<R: RecipeRuntime> {
    runtime: Arc<R>,
    handler: R::Handler,
}

impl<R: RecipeRuntime> OwnedHandler<R> {
    pub fn get(&self) -> &R::Handler {
        &self.handler
    }
}

impl<R: RecipeRuntime> Drop for OwnedHandler<R> {
    fn drop(&mut self) {
        self.runtime.release_handler(&self.handler);
    }
}

pub struct RecipeMultiply<R: RecipeRuntime> {
    runtime: Arc<R>,
    recipes: Mutex<HashMap<RecipeKey, Arc<OwnedRecipe<R>>>>,
    timings: Mutex<HashMap<MulSignature, Duration>>,
    benchmarks: AtomicUsize,
}

impl<R: RecipeRuntime> RecipeMultiply<R> {
    pub fn new(runtime: Arc<R>) -> Self {
        Self {
            runtime,
            recipes: Mutex::new(HashMap::new()),
            timings: Mutex::new(HashMap::new()),
            benchmarks: AtomicUsize::new(0),
        }
    }

    pub fn runtime(&self) -> &Arc<R> {
        &self.runtime
    }

    pub fn recipe_count(&self) -> usize {
        self.recipes.lock().expect("recipe cache poisoned").len()
    }

    pub fn benchmark_count(&self) -> usize {
        self.benchmarks.load(Ordering::Relaxed)
    }

    fn recipe(&self, key: RecipeKey) -> BackendResult<Arc<OwnedRecipe<R>>> {
        let mut recipes = self.recipes.lock().expect("recipe cache poisoned");
        if let Some(found) = recipes.get(&key) {
            profiling::cache_event("gemm.recipe_hit");
            return Ok(Arc::clone(found));
        }
        profiling::cache_event("gemm.recipe_miss");
        let _scope = profiling::compile_scope("gemm.recipe_create");
        let recipe = Arc::new(OwnedRecipe {
            runtime: Arc::clone(&self.runtime),
            recipe: self.runtime.create_recipe(key)?,
        });
        recipes.insert(key, Arc::clone(&recipe));
        Ok(recipe)
    }

    /// Builds a kernel computing `out = alpha*a*b + beta*out`.
    pub fn mul(
        &self,
        a: &Matrix,
        b: &Matrix,
        out: &Matrix,
        alpha: f64,
        beta: f64,
    ) -> BackendResult<MulKernel<R>> {
        if a.rows() != out.rows() || a.cols() != b.rows() || b.cols() != out.cols() {
            return Err(BackendError::incompatible(format!(
                "cannot multiply {}x{} by {}x{} into {}x{}",
                a.rows(),
                a.cols(),
                b.rows(),
                b.cols(),
                out.rows(),
                out.cols()
            )));
        }
        if a.dtype() != b.dtype() || a.dtype() != out.dtype() {
            return Err(BackendError::incompatible(format!(
                "mixed element types in multiply: {:?}, {:?}, {:?}",
                a.dtype(),
                b.dtype(),
                out.dtype()
            )));
        }
        let scalar = ScalarType::from_dtype(a.dtype())?;

        // Row-major out = a*b is column-major out^T = b^T * a^T.
        let args = GemmArgs {
            scalar,
            m: b.cols(),
            n: a.rows(),
            k: a.cols(),
            alpha,
            beta,
            a: b.addr(),
            lda: b.leaddim(),
            b: a.addr(),
            ldb: a.leaddim(),
            c: out.addr(),
            ldc: out.leaddim(),
        };

        let recipe = self.recipe(RecipeKey {
            scalar,
            n: args.n,
            k: args.k,
        })?;

        let handler = OwnedHandler {
            runtime: Arc::clone(&self.runtime),
            handler: self.runtime.create_handler(recipe.get())?,
        };
        self.runtime.set_args(handler.get(), &args)?;

        let duration = self.expected_duration(&handler, &args, out)?;

        Ok(MulKernel {
            runtime: Arc::clone(&self.runtime),
            handler,
            _recipe: recipe,
            duration,
        })
    }

    fn expected_duration(
        &self,
        handler: &OwnedHandler<R>,
        args: &GemmArgs,
        out: &Matrix,
    ) -> BackendResult<Duration> {
        let signature = MulSignature::of(args);
        let mut timings = self.timings.lock().expect("multiply timing cache poisoned");
        if let Some(found) = timings.get(&signature) {
            profiling::cache_event("gemm.timing_hit");
            return Ok(*found);
        }
        profiling::cache_event("gemm.timing_miss");

        let backend = self.runtime.backend();
        let saved = backend.read_matrix(out)?;
        let timed = self.dry_run(handler);
        backend.write_matrix(out, &saved)?;
        let duration = timed?;

        self.benchmarks.fetch_add(1, Ordering::Relaxed);
        timings.insert(signature, duration);
        Ok(duration)
    }

    fn dry_run(&self, handler: &OwnedHandler<R>) -> BackendResult<Duration> {
        let backend = self.runtime.backend();
        let queue = backend.create_queue()?;
        let start = Instant::now();
        self.runtime.submit(handler.get(), &queue, &[], false)?;
        backend.synchronize(&queue)?;
        Ok(start.elapsed())
    }
}

/// A bound multiply; `run` resubmits the captured handler.
pub struct MulKernel<R: RecipeRuntime> {
    runtime: Arc<R>,
    handler: OwnedHandler<R>,
    _recipe: Arc<OwnedRecipe<R>>,
    duration: Duration,
}

impl<R: RecipeRuntime> MulKernel<R> {
    /// Wall time of the timed run for this call signature.
    pub fn expected_duration(&self) -> Duration {
        self.duration
    }
}

impl<R: RecipeRuntime> Kernel<R::Backend> for MulKernel<R> {
    fn run(
        &self,
        queue: &<R::Backend as Backend>::Queue,
        wait_for: &[<R::Backend as Backend>::Event],
        ret_evt: bool,
    ) -> BackendResult<Option<<R::Backend as Backend>::Event>> {
        self.runtime
            .submit(self.handler.get(), queue, wait_for, ret_evt)
    }
}
