//! OpenCL C dialect.
//!
//! Buffers live in `__global` memory. The launch spans a fixed number of
//! work-items along the second axis, so two-dimensional kernels stride
//! `_y` by the global size.

use flux_rs::generator::{join_params, layout_macros, FormalParam, PointwiseSpec};
use flux_rs::matrix::DType;

pub(crate) const FP64_PRAGMA: &str = "#pragma OPENCL EXTENSION cl_khr_fp64 : enable\n";

fn param_decl(param: &FormalParam) -> String {
    let ident = param.ident();
    match param {
        FormalParam::Dim(_) | FormalParam::LeadDim(_) => format!("int {ident}"),
        FormalParam::Scalar { dtype, .. } => format!("{} {ident}", dtype.c_type()),
        FormalParam::Data {
            dtype, readonly, ..
        } => {
            let qualifier = if *readonly { "const " } else { "" };
            format!("__global {qualifier}{}* restrict {ident}", dtype.c_type())
        }
        FormalParam::Index(_) | FormalParam::ColStride(_) | FormalParam::RowStride(_) => {
            format!("__global const int* restrict {ident}")
        }
    }
}

fn uses_f64(spec: &PointwiseSpec, fpdtype: DType) -> bool {
    fpdtype == DType::F64 || spec.args.iter().any(|arg| arg.dtype == DType::F64)
}

pub fn render(spec: &PointwiseSpec, fpdtype: DType, soa_size: usize) -> String {
    let params = spec.formal_params();
    let limits = if spec.ndim == 1 {
        "if (_x < _nx)"
    } else {
        "for (int _y = get_global_id(1); _y < _ny && _x < _nx; _y += get_global_size(1))"
    };

    let mut out = String::new();
    if uses_f64(spec, fpdtype) {
        out.push_str(FP64_PRAGMA);
    }
    out.push_str(&layout_macros(fpdtype, soa_size));
    out.push_str(&format!(
        "\n__kernel void {name}({params})\n{{\n    int _x = get_global_id(0);\n    {limits}\n    {{\n{body}\n    }}\n}}\n",
        name = spec.name,
        params = join_params(&params, param_decl),
        body = indent(&spec.body, 8),
    ));
    out
}

pub(crate) fn indent(text: &str, width: usize) -> String {
    let pad = " ".repeat(width);
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| format!("{pad}{}", line.trim_start()))
        .collect::<Vec<_>>()
        .join("\n")
}
