//! Canned linear-algebra kernels: weighted combination, copy and column
//! reductions.

use std::sync::Arc;

use crate::backend::{Backend, StagingBuffer};
use crate::error::{BackendError, BackendResult};
use crate::kernel::{ArgType, ArgValue, ComputeKernel, Kernel, KernelArgs, LaunchConfig, RuntimeSlots};
use crate::matrix::{ensure_compatible, DType, Matrix, MatrixTraits};
use crate::pointwise::to_i32;

/// Threads per block for every BLAS-extension kernel.
pub const BLAS_BLOCK: u32 = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReductionMethod {
    /// Scaled error estimate over `[err, cur, prev]` with `(atol, rtol)`.
    Errest,
    /// Residual over `[cur, prev]` scaled by `dt_fac` and optionally a
    /// timestep matrix.
    Resid,
}

impl ReductionMethod {
    pub fn operand_count(self) -> usize {
        match self {
            ReductionMethod::Errest => 3,
            ReductionMethod::Resid => 2,
        }
    }

    pub fn factor_count(self) -> usize {
        match self {
            ReductionMethod::Errest => 2,
            ReductionMethod::Resid => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Norm {
    /// Maximum absolute value.
    Uniform,
    /// Sum of squares.
    L2,
}

impl Norm {
    /// `"uniform"` selects the max norm; every other name sums squares.
    pub fn from_name(name: &str) -> Self {
        if name.eq_ignore_ascii_case("uniform") {
            Norm::Uniform
        } else {
            Norm::L2
        }
    }

    fn fold(self, partials: &[f64]) -> f64 {
        match self {
            Norm::Uniform => partials.iter().copied().fold(0.0, f64::max),
            Norm::L2 => partials.iter().sum(),
        }
    }
}

/// Generation parameters of a BLAS-extension kernel. Everything here is
/// baked into the rendered source.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BlasTemplate {
    Axnpby {
        nv: usize,
        subdims: Vec<usize>,
        dtype: DType,
    },
    Reduction {
        method: ReductionMethod,
        norm: Norm,
        dt_matrix: bool,
        dtype: DType,
    },
}

impl BlasTemplate {
    pub fn name(&self) -> &'static str {
        match self {
            BlasTemplate::Axnpby { .. } => "axnpby",
            BlasTemplate::Reduction { .. } => "reduction",
        }
    }

    pub fn dtype(&self) -> DType {
        match self {
            BlasTemplate::Axnpby { dtype, .. } | BlasTemplate::Reduction { dtype, .. } => *dtype,
        }
    }

    /// `[nrow, ncol, ldim]` followed by pointers and then scalars.
    pub fn arg_types(&self) -> Vec<ArgType> {
        let mut types = vec![ArgType::Int32; 3];
        match self {
            BlasTemplate::Axnpby { nv, dtype, .. } => {
                types.extend(std::iter::repeat(ArgType::Pointer).take(*nv));
                types.extend(std::iter::repeat(ArgType::Scalar(*dtype)).take(*nv));
            }
            BlasTemplate::Reduction {
                method,
                dt_matrix,
                dtype,
                ..
            } => {
                let pointers = 1 + method.operand_count() + usize::from(*dt_matrix);
                types.extend(std::iter::repeat(ArgType::Pointer).take(pointers));
                types.extend(std::iter::repeat(ArgType::Scalar(*dtype)).take(method.factor_count()));
            }
        }
        types
    }

    /// Index of the first runtime scale factor.
    pub fn factor_offset(&self) -> usize {
        self.arg_types()
            .iter()
            .position(|ty| matches!(ty, ArgType::Scalar(_)))
            .unwrap_or(0)
    }
}

/// Names of the pointer and scalar parameters of a reduction kernel, in
/// marshalling order after `reduced`.
pub fn reduction_operands(
    method: ReductionMethod,
    dt_matrix: bool,
) -> (Vec<&'static str>, Vec<&'static str>) {
    match method {
        ReductionMethod::Errest => (vec!["rerr", "rcur", "rprev"], vec!["atol", "rtol"]),
        ReductionMethod::Resid if dt_matrix => (vec!["rcur", "rprev", "dt_mat"], vec!["dt_fac"]),
        ReductionMethod::Resid => (vec!["rcur", "rprev"], vec!["dt_fac"]),
    }
}

/// C-family expression for the error of element `idx`.
pub fn reduction_term(method: ReductionMethod, dt_matrix: bool, idx: &str) -> String {
    match method {
        ReductionMethod::Errest => format!(
            "rerr[{idx}] / (atol + rtol*fmax(fabs(rcur[{idx}]), fabs(rprev[{idx}])))"
        ),
        ReductionMethod::Resid if dt_matrix => {
            format!("(rcur[{idx}] - rprev[{idx}]) / (dt_fac*dt_mat[{idx}])")
        }
        ReductionMethod::Resid => format!("(rcur[{idx}] - rprev[{idx}]) / dt_fac"),
    }
}

/// C-family statement folding `e` into the accumulator `acc`.
pub fn reduction_accumulate(norm: Norm, acc: &str, e: &str) -> String {
    match norm {
        Norm::Uniform => format!("{acc} = fmax({acc}, fabs({e}));"),
        Norm::L2 => format!("{acc} += {e}*{e};"),
    }
}

/// C-family statement merging two partial accumulators, as used by
/// tree reductions in work-group local memory.
pub fn reduction_combine(norm: Norm, lhs: &str, rhs: &str) -> String {
    match norm {
        Norm::Uniform => format!("{lhs} = fmax({lhs}, {rhs});"),
        Norm::L2 => format!("{lhs} += {rhs};"),
    }
}

/// C-family statements for one column of a weighted combination. The
/// destination is not read when `a0` is zero.
pub fn axnpby_column(nv: usize, idx: &str) -> String {
    let rest: String = (1..nv).map(|i| format!(" + a{i}*x{i}[{idx}]")).collect();
    let others = if nv > 1 {
        rest.trim_start_matches(" + ").to_string()
    } else {
        "0".to_string()
    };
    format!(
        "if (a0 == 0) x0[{idx}] = {others};\n\
         else if (a0 == 1) x0[{idx}] = x0[{idx}]{rest};\n\
         else x0[{idx}] = a0*x0[{idx}]{rest};\n"
    )
}

fn float_traits<'a, I>(operands: I) -> BackendResult<MatrixTraits>
where
    I: IntoIterator<Item = &'a MatrixTraits>,
{
    let traits = ensure_compatible(operands)?;
    if !traits.dtype.is_float() {
        return Err(BackendError::incompatible(format!(
            "operation needs floating point operands, got {:?}",
            traits.dtype
        )));
    }
    Ok(traits)
}

fn dims_args(types: Vec<ArgType>, traits: &MatrixTraits) -> BackendResult<KernelArgs> {
    let mut args = KernelArgs::new(types);
    args.set(0, to_i32(traits.rows, "row count")?);
    args.set(1, to_i32(traits.cols, "column count")?);
    args.set(2, to_i32(traits.leaddim, "leading dimension")?);
    Ok(args)
}

/// In-place `x0 = a0*x0 + a1*x1 + ...` over the columns in `subdims`
/// (all columns when `None`). Bind the weights with [`Kernel::bind`].
pub fn axnpby<B: Backend>(
    backend: &Arc<B>,
    arr: &[&Matrix],
    subdims: Option<&[usize]>,
) -> BackendResult<ComputeKernel<B>> {
    if arr.is_empty() {
        return Err(BackendError::incompatible("axnpby needs at least one operand"));
    }
    let traits = float_traits(arr.iter().map(|m| m.traits()))?;
    let subdims: Vec<usize> = match subdims {
        Some(cols) => cols.to_vec(),
        None => (0..traits.cols).collect(),
    };
    if let Some(bad) = subdims.iter().find(|&&col| col >= traits.cols) {
        return Err(BackendError::incompatible(format!(
            "axnpby column {bad} out of range for {} columns",
            traits.cols
        )));
    }
    if let Some(dup) = subdims
        .iter()
        .enumerate()
        .find_map(|(i, col)| subdims[..i].contains(col).then_some(*col))
    {
        return Err(BackendError::incompatible(format!(
            "axnpby column {dup} listed more than once"
        )));
    }

    let nv = arr.len();
    let template = BlasTemplate::Axnpby {
        nv,
        subdims,
        dtype: traits.dtype,
    };
    let source = backend.blas_source(&template);
    let mut args = dims_args(template.arg_types(), &traits)?;
    let function = backend.build(template.name(), &source, args.types())?;

    let pointers: Vec<ArgValue> = arr.iter().map(|m| ArgValue::Pointer(m.addr())).collect();
    args.set_from(3, &pointers);

    let launch = LaunchConfig::for_block((BLAS_BLOCK, 1, 1), traits.rows, 1);
    Ok(ComputeKernel::new(
        Arc::clone(backend),
        function,
        launch,
        args,
        RuntimeSlots::new(3 + nv, nv),
    ))
}

/// Asynchronous byte copy between two matrices of identical traits.
pub struct CopyKernel<B: Backend> {
    backend: Arc<B>,
    dst: u64,
    src: u64,
    nbytes: usize,
}

pub fn copy<B: Backend>(backend: &Arc<B>, dst: &Matrix, src: &Matrix) -> BackendResult<CopyKernel<B>> {
    ensure_compatible([dst.traits(), src.traits()])?;
    Ok(CopyKernel {
        backend: Arc::clone(backend),
        dst: dst.addr(),
        src: src.addr(),
        nbytes: dst.nbytes(),
    })
}

impl<B: Backend> Kernel<B> for CopyKernel<B> {
    fn run(
        &self,
        queue: &B::Queue,
        wait_for: &[B::Event],
        ret_evt: bool,
    ) -> BackendResult<Option<B::Event>> {
        self.backend
            .copy_async(queue, self.dst, self.src, self.nbytes, wait_for, ret_evt)
    }
}

/// Two-phase column reduction. `run` writes per-block partials and
/// enqueues their download; `retval` folds them once the caller has
/// synchronised.
pub struct ReductionKernel<B: Backend> {
    backend: Arc<B>,
    inner: ComputeKernel<B>,
    staging: B::Staging,
    norm: Norm,
    ncol: usize,
    nblocks: usize,
    dtype: DType,
}

pub fn reduction<B: Backend>(
    backend: &Arc<B>,
    rs: &[&Matrix],
    method: ReductionMethod,
    norm: Norm,
    dt_mat: Option<&Matrix>,
) -> BackendResult<ReductionKernel<B>> {
    if rs.len() != method.operand_count() {
        return Err(BackendError::incompatible(format!(
            "{method:?} reduction takes {} operands, got {}",
            method.operand_count(),
            rs.len()
        )));
    }
    if dt_mat.is_some() && method != ReductionMethod::Resid {
        return Err(BackendError::incompatible(
            "a timestep matrix is only valid for residual reductions",
        ));
    }
    let traits = float_traits(rs.iter().map(|m| m.traits()).chain(dt_mat.map(|m| m.traits())))?;

    let launch = LaunchConfig::for_block((BLAS_BLOCK, 1, 1), traits.rows, 1);
    let nblocks = launch.grid.0 as usize;
    let launch = LaunchConfig {
        grid: (launch.grid.0, traits.cols.max(1) as u32, 1),
        ..launch
    };

    let template = BlasTemplate::Reduction {
        method,
        norm,
        dt_matrix: dt_mat.is_some(),
        dtype: traits.dtype,
    };
    let source = backend.blas_source(&template);
    let facoff = template.factor_offset();
    let mut args = dims_args(template.arg_types(), &traits)?;
    let function = backend.build(template.name(), &source, args.types())?;

    let staging = backend.alloc_staging(traits.cols * nblocks * traits.dtype.size_bytes())?;

    let mut pointers = vec![ArgValue::Pointer(staging.device_addr())];
    pointers.extend(rs.iter().chain(dt_mat.as_ref()).map(|m| ArgValue::Pointer(m.addr())));
    args.set_from(3, &pointers);

    let slots = RuntimeSlots::suffix_of(args.types(), facoff);
    Ok(ReductionKernel {
        backend: Arc::clone(backend),
        inner: ComputeKernel::new(Arc::clone(backend), function, launch, args, slots),
        staging,
        norm,
        ncol: traits.cols,
        nblocks,
        dtype: traits.dtype,
    })
}

impl<B: Backend> ReductionKernel<B> {
    pub fn nblocks(&self) -> usize {
        self.nblocks
    }

    /// Per-column reduced values. Reads host memory filled by the download
    /// issued in `run`; the caller must synchronise first.
    pub fn retval(&self) -> BackendResult<Vec<f64>> {
        let partials = self.dtype.decode(&self.staging.read_host()?);
        if partials.len() < self.ncol * self.nblocks {
            return Err(BackendError::execution(format!(
                "reduction staging holds {} values, expected {}",
                partials.len(),
                self.ncol * self.nblocks
            )));
        }
        Ok((0..self.ncol)
            .map(|col| {
                let start = col * self.nblocks;
                self.norm.fold(&partials[start..start + self.nblocks])
            })
            .collect())
    }
}

impl<B: Backend> Kernel<B> for ReductionKernel<B> {
    fn runtime_arity(&self) -> usize {
        self.inner.runtime_arity()
    }

    fn bind(&mut self, values: &[f64]) {
        self.inner.bind(values);
    }

    fn run(
        &self,
        queue: &B::Queue,
        wait_for: &[B::Event],
        ret_evt: bool,
    ) -> BackendResult<Option<B::Event>> {
        self.inner.run(queue, wait_for, false)?;
        self.backend
            .download_staging(queue, &self.staging, &[], ret_evt)
    }
}
