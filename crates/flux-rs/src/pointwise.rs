//! Instantiation of template-rendered pointwise kernels.

use std::collections::HashMap;
use std::sync::Arc;

use crate::backend::Backend;
use crate::error::{BackendError, BackendResult};
use crate::generator::{ArgKind, FormalParam, PointwiseSpec};
use crate::kernel::{ArgValue, ComputeKernel, KernelArgs, RuntimeSlots};
use crate::matrix::{DType, Matrix, View};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Operand {
    /// A scalar fixed at construction.
    Scalar(f64),
    /// A scalar supplied later through `bind`.
    Runtime,
    Matrix(Matrix),
    View(View),
}

/// Operands and scalars matched by name to a template's declared
/// arguments.
#[derive(Debug, Clone, Default)]
pub struct KernelOperands {
    operands: HashMap<String, Operand>,
}

impl KernelOperands {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scalar(mut self, name: impl Into<String>, value: f64) -> Self {
        self.operands.insert(name.into(), Operand::Scalar(value));
        self
    }

    pub fn runtime(mut self, name: impl Into<String>) -> Self {
        self.operands.insert(name.into(), Operand::Runtime);
        self
    }

    pub fn matrix(mut self, name: impl Into<String>, matrix: Matrix) -> Self {
        self.operands.insert(name.into(), Operand::Matrix(matrix));
        self
    }

    pub fn view(mut self, name: impl Into<String>, view: View) -> Self {
        self.operands.insert(name.into(), Operand::View(view));
        self
    }

    pub fn get(&self, name: &str) -> Option<&Operand> {
        self.operands.get(name)
    }

    fn require(&self, name: &str) -> BackendResult<&Operand> {
        self.operands
            .get(name)
            .ok_or_else(|| BackendError::template(format!("no operand supplied for '{name}'")))
    }

    fn require_matrix(&self, name: &str, dtype: DType) -> BackendResult<&Matrix> {
        match self.require(name)? {
            Operand::Matrix(matrix) if matrix.dtype() == dtype => Ok(matrix),
            Operand::Matrix(matrix) => Err(BackendError::incompatible(format!(
                "operand '{name}' has element type {:?}, kernel expects {dtype:?}",
                matrix.dtype()
            ))),
            _ => Err(BackendError::template(format!(
                "operand '{name}' must be a matrix"
            ))),
        }
    }

    fn require_view(&self, name: &str, dtype: DType) -> BackendResult<&View> {
        match self.require(name)? {
            Operand::View(view) if view.dtype == dtype => Ok(view),
            Operand::View(view) => Err(BackendError::incompatible(format!(
                "view '{name}' has element type {:?}, kernel expects {dtype:?}",
                view.dtype
            ))),
            _ => Err(BackendError::template(format!("operand '{name}' must be a view"))),
        }
    }
}

fn dim_value(dims: &[usize], dim: &str) -> usize {
    match dim {
        "_nx" => dims[dims.len() - 1],
        _ => dims[0],
    }
}

pub(crate) fn to_i32(value: usize, what: &str) -> BackendResult<i32> {
    i32::try_from(value)
        .map_err(|_| BackendError::incompatible(format!("{what} {value} does not fit in 32 bits")))
}

/// Marshals `operands` into the argument buffer for `spec` and returns the
/// runtime-constant range.
pub fn marshal_args(
    spec: &PointwiseSpec,
    dims: &[usize],
    operands: &KernelOperands,
) -> BackendResult<(KernelArgs, RuntimeSlots)> {
    if dims.len() != spec.ndim {
        return Err(BackendError::template(format!(
            "kernel '{}' iterates over {} dimensions, got {dims:?}",
            spec.name, spec.ndim
        )));
    }
    for arg in &spec.args {
        let supplied = operands.require(&arg.name)?;
        match (arg.kind, supplied) {
            (ArgKind::Scalar, Operand::Scalar(_) | Operand::Runtime)
            | (ArgKind::Array, Operand::Matrix(_))
            | (ArgKind::View, Operand::View(_)) => {}
            (kind, _) => {
                return Err(BackendError::template(format!(
                    "operand '{}' does not match declared kind {kind:?}",
                    arg.name
                )))
            }
        }
        if arg.kind == ArgKind::View && supplied_ncdim(supplied) < arg.ncdim {
            return Err(BackendError::template(format!(
                "view '{}' needs stride arrays for {} component dimensions",
                arg.name, arg.ncdim
            )));
        }
    }

    let params = spec.formal_params();
    let mut args = KernelArgs::new(params.iter().map(FormalParam::arg_type).collect());
    let mut runtime = Vec::new();

    for (index, param) in params.iter().enumerate() {
        match param {
            FormalParam::Dim(dim) => {
                args.set(index, to_i32(dim_value(dims, dim), dim)?);
            }
            FormalParam::Scalar { name, .. } => match operands.require(name)? {
                Operand::Scalar(value) => args.set(index, *value),
                _ => runtime.push(index),
            },
            FormalParam::Data { name, dtype, .. } => {
                let addr = match operands.require(name)? {
                    Operand::View(_) => operands.require_view(name, *dtype)?.data,
                    _ => operands.require_matrix(name, *dtype)?.addr(),
                };
                args.set(index, ArgValue::Pointer(addr));
            }
            FormalParam::Index(name) => {
                let view = view_of(operands, name)?;
                args.set(index, ArgValue::Pointer(view.vix));
            }
            FormalParam::ColStride(name) => {
                let view = view_of(operands, name)?;
                args.set(index, ArgValue::Pointer(view.vcstri.unwrap_or(0)));
            }
            FormalParam::RowStride(name) => {
                let view = view_of(operands, name)?;
                args.set(index, ArgValue::Pointer(view.vrstri.unwrap_or(0)));
            }
            FormalParam::LeadDim(name) => {
                let matrix = match operands.require(name)? {
                    Operand::Matrix(matrix) => matrix,
                    _ => {
                        return Err(BackendError::template(format!(
                            "operand '{name}' must be a matrix"
                        )))
                    }
                };
                args.set(index, to_i32(matrix.leaddim(), "leading dimension")?);
            }
        }
    }

    let slots = match (runtime.first(), runtime.last()) {
        (Some(&first), Some(&last)) => {
            if last - first + 1 != runtime.len() {
                return Err(BackendError::template(format!(
                    "runtime scalars of kernel '{}' must be declared contiguously",
                    spec.name
                )));
            }
            RuntimeSlots::new(first, runtime.len())
        }
        _ => RuntimeSlots::none(),
    };
    Ok((args, slots))
}

fn supplied_ncdim(operand: &Operand) -> u8 {
    match operand {
        Operand::View(view) => view.ncdim(),
        _ => 0,
    }
}

fn view_of<'a>(operands: &'a KernelOperands, name: &str) -> BackendResult<&'a View> {
    match operands.require(name)? {
        Operand::View(view) => Ok(view),
        _ => Err(BackendError::template(format!("operand '{name}' must be a view"))),
    }
}

/// Generates, builds and binds one pointwise kernel.
pub fn instantiate<B: Backend>(
    backend: &Arc<B>,
    spec: &PointwiseSpec,
    dims: &[usize],
    operands: &KernelOperands,
) -> BackendResult<ComputeKernel<B>> {
    let (args, slots) = marshal_args(spec, dims, operands)?;
    let source = backend.generate(spec);
    let function = backend.build(&spec.name, &source, args.types())?;
    let launch = backend.launch_config(dims);
    Ok(ComputeKernel::new(
        Arc::clone(backend),
        function,
        launch,
        args,
        slots,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generator::{Intent, KernelArg};
    use crate::matrix::MatrixTraits;

    fn spec() -> PointwiseSpec {
        PointwiseSpec::new(
            "scale",
            2,
            vec![
                KernelArg::scalar("a", DType::F64),
                KernelArg::scalar("t", DType::F64),
                KernelArg::array("u", DType::F64, Intent::InOut),
                KernelArg::view("f", DType::F64, Intent::In, 1),
            ],
            "",
        )
    }

    fn matrix(dtype: DType) -> Matrix {
        Matrix::new(0x1000, MatrixTraits::new(4, 8, dtype).with_leaddim(10))
    }

    fn view() -> View {
        View::new(0x2000, 0x3000, DType::F64).with_col_strides(0x4000)
    }

    #[test]
    fn marshals_in_formal_order_with_runtime_suffix() {
        let operands = KernelOperands::new()
            .scalar("a", 2.0)
            .runtime("t")
            .matrix("u", matrix(DType::F64))
            .view("f", view());
        let (args, slots) = marshal_args(&spec(), &[4, 8], &operands).unwrap();

        assert_eq!(
            args.values(),
            &[
                ArgValue::Int32(4),
                ArgValue::Int32(8),
                ArgValue::F64(2.0),
                ArgValue::F64(0.0),
                ArgValue::Pointer(0x1000),
                ArgValue::Int32(10),
                ArgValue::Pointer(0x2000),
                ArgValue::Pointer(0x3000),
                ArgValue::Pointer(0x4000),
            ]
        );
        assert_eq!(slots, RuntimeSlots::new(3, 1));
    }

    #[test]
    fn scattered_runtime_scalars_are_rejected() {
        let spec = PointwiseSpec::new(
            "gap",
            1,
            vec![
                KernelArg::scalar("a", DType::F64),
                KernelArg::scalar("b", DType::F64),
                KernelArg::scalar("c", DType::F64),
            ],
            "",
        );
        let operands = KernelOperands::new()
            .runtime("a")
            .scalar("b", 1.0)
            .runtime("c");
        let err = marshal_args(&spec, &[16], &operands).unwrap_err();
        assert!(matches!(err, BackendError::Template { .. }));
    }

    #[test]
    fn element_type_mismatch_is_incompatible() {
        let operands = KernelOperands::new()
            .scalar("a", 2.0)
            .scalar("t", 1.0)
            .matrix("u", matrix(DType::F32))
            .view("f", view());
        let err = marshal_args(&spec(), &[4, 8], &operands).unwrap_err();
        assert!(err.is_incompatible());
    }

    #[test]
    fn missing_operand_and_wrong_dims_are_template_errors() {
        let operands = KernelOperands::new().scalar("a", 2.0);
        assert!(matches!(
            marshal_args(&spec(), &[4, 8], &operands),
            Err(BackendError::Template { .. })
        ));
        assert!(matches!(
            marshal_args(&spec(), &[4], &operands),
            Err(BackendError::Template { .. })
        ));
    }

    #[test]
    fn view_without_required_strides_is_rejected() {
        let operands = KernelOperands::new()
            .scalar("a", 2.0)
            .scalar("t", 1.0)
            .matrix("u", matrix(DType::F64))
            .view("f", View::new(0x2000, 0x3000, DType::F64));
        assert!(matches!(
            marshal_args(&spec(), &[4, 8], &operands),
            Err(BackendError::Template { .. })
        ));
    }
}
