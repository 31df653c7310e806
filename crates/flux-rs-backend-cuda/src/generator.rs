//! CUDA dialect.
//!
//! Kernels take their parameters by value in marshalling order. One thread
//! handles one `_x`; two-dimensional kernels loop over `_y` in software.

use flux_rs::generator::{join_params, layout_macros, FormalParam, PointwiseSpec};
use flux_rs::matrix::DType;

pub(crate) fn param_decl(param: &FormalParam) -> String {
    let ident = param.ident();
    match param {
        FormalParam::Dim(_) | FormalParam::LeadDim(_) => format!("int {ident}"),
        FormalParam::Scalar { dtype, .. } => format!("{} {ident}", dtype.c_type()),
        FormalParam::Data {
            dtype, readonly, ..
        } => {
            let qualifier = if *readonly { "const " } else { "" };
            format!("{qualifier}{}* __restrict__ {ident}", dtype.c_type())
        }
        FormalParam::Index(_) | FormalParam::ColStride(_) | FormalParam::RowStride(_) => {
            format!("const int* __restrict__ {ident}")
        }
    }
}

pub fn render(spec: &PointwiseSpec, fpdtype: DType, soa_size: usize) -> String {
    let params = spec.formal_params();
    let limits = if spec.ndim == 1 {
        "if (_x < _nx)"
    } else {
        "for (int _y = 0; _y < _ny && _x < _nx; ++_y)"
    };

    let mut out = layout_macros(fpdtype, soa_size);
    out.push_str(&format!(
        "\nextern \"C\" __global__ void {name}({params})\n{{\n    int _x = blockIdx.x*blockDim.x + threadIdx.x;\n    {limits}\n    {{\n{body}\n    }}\n}}\n",
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
