//! CUDA sources for the BLAS-extension kernels.
//!
//! `axnpby` runs one thread per row. `reduction` runs a grid of
//! `(row blocks, columns)` and folds each block in shared memory, leaving
//! one partial per block for the host to finish.

use flux_rs::blasext::{
    axnpby_column, reduction_accumulate, reduction_combine, reduction_operands, reduction_term,
    BlasTemplate, BLAS_BLOCK,
};

use crate::generator::indent;

fn signature(name: &str, params: &[String]) -> String {
    format!(
        "extern \"C\" __global__ void {name}(int nrow, int ncol, int ldim, {})\n{{\n",
        params.join(", ")
    )
}

pub fn render(template: &BlasTemplate) -> String {
    let mut out = format!("typedef {} fpdtype_t;\n\n", template.dtype().c_type());
    match template {
        BlasTemplate::Axnpby { nv, subdims, .. } => {
            let mut params: Vec<String> = (0..*nv)
                .map(|i| format!("fpdtype_t* __restrict__ x{i}"))
                .collect();
            params.extend((0..*nv).map(|i| format!("fpdtype_t a{i}")));

            out.push_str(&signature("axnpby", &params));
            out.push_str("    int i = blockIdx.x*blockDim.x + threadIdx.x;\n");
            out.push_str("    if (i < nrow)\n    {\n");
            for col in subdims {
                out.push_str(&format!("        {{\n            const int idx = i*ldim + {col};\n"));
                out.push_str(&indent(&axnpby_column(*nv, "idx"), 12));
                out.push_str("\n        }\n");
            }
            out.push_str("    }\n}\n");
        }
        BlasTemplate::Reduction {
            method,
            norm,
            dt_matrix,
            ..
        } => {
            let (operands, factors) = reduction_operands(*method, *dt_matrix);
            let mut params = vec!["fpdtype_t* __restrict__ reduced".to_string()];
            params.extend(
                operands
                    .iter()
                    .map(|name| format!("const fpdtype_t* __restrict__ {name}")),
            );
            params.extend(factors.iter().map(|name| format!("fpdtype_t {name}")));

            out.push_str(&signature("reduction", &params));
            out.push_str(&format!("    __shared__ fpdtype_t sdata[{BLAS_BLOCK}];\n"));
            out.push_str(
                "    const int tid = threadIdx.x;\n    const int i = blockIdx.x*blockDim.x + tid;\n    const int c = blockIdx.y;\n\n    fpdtype_t acc = 0;\n",
            );
            out.push_str("    if (i < nrow && c < ncol)\n    {\n        const int idx = i*ldim + c;\n");
            out.push_str(&format!(
                "        const fpdtype_t e = {};\n        {}\n    }}\n",
                reduction_term(*method, *dt_matrix, "idx"),
                reduction_accumulate(*norm, "acc", "e")
            ));
            out.push_str("    sdata[tid] = acc;\n    __syncthreads();\n\n");
            out.push_str("    for (int s = blockDim.x / 2; s > 0; s >>= 1)\n    {\n");
            out.push_str(&format!(
                "        if (tid < s)\n            {}\n        __syncthreads();\n    }}\n\n",
                reduction_combine(*norm, "sdata[tid]", "sdata[tid + s]")
            ));
            out.push_str("    if (tid == 0)\n        reduced[c*gridDim.x + blockIdx.x] = sdata[0];\n}\n");
        }
    }
    out
}
