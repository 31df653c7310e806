//! OpenCL sources for the BLAS-extension kernels.

use flux_rs::blasext::{
    axnpby_column, reduction_accumulate, reduction_combine, reduction_operands, reduction_term,
    BlasTemplate, BLAS_BLOCK,
};
use flux_rs::matrix::DType;

use crate::generator::{indent, FP64_PRAGMA};

fn signature(name: &str, params: &[String]) -> String {
    format!(
        "__kernel void {name}(int nrow, int ncol, int ldim, {})\n{{\n",
        params.join(", ")
    )
}

pub fn render(template: &BlasTemplate) -> String {
    let dtype = template.dtype();
    let mut out = String::new();
    if dtype == DType::F64 {
        out.push_str(FP64_PRAGMA);
    }
    out.push_str(&format!("typedef {} fpdtype_t;\n\n", dtype.c_type()));

    match template {
        BlasTemplate::Axnpby { nv, subdims, .. } => {
            let mut params: Vec<String> = (0..*nv)
                .map(|i| format!("__global fpdtype_t* restrict x{i}"))
                .collect();
            params.extend((0..*nv).map(|i| format!("fpdtype_t a{i}")));

            out.push_str(&signature("axnpby", &params));
            out.push_str("    int i = get_global_id(0);\n    if (i < nrow)\n    {\n");
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
            let mut params = vec!["__global fpdtype_t* restrict reduced".to_string()];
            params.extend(
                operands
                    .iter()
                    .map(|name| format!("__global const fpdtype_t* restrict {name}")),
            );
            params.extend(factors.iter().map(|name| format!("fpdtype_t {name}")));

            out.push_str(&signature("reduction", &params));
            out.push_str(&format!("    __local fpdtype_t sdata[{BLAS_BLOCK}];\n"));
            out.push_str(
                "    const int tid = get_local_id(0);\n    const int i = get_global_id(0);\n    const int c = get_group_id(1);\n\n    fpdtype_t acc = 0;\n",
            );
            out.push_str("    if (i < nrow && c < ncol)\n    {\n        const int idx = i*ldim + c;\n");
            out.push_str(&format!(
                "        const fpdtype_t e = {};\n        {}\n    }}\n",
                reduction_term(*method, *dt_matrix, "idx"),
                reduction_accumulate(*norm, "acc", "e")
            ));
            out.push_str("    sdata[tid] = acc;\n    barrier(CLK_LOCAL_MEM_FENCE);\n\n");
            out.push_str("    for (int s = get_local_size(0) / 2; s > 0; s >>= 1)\n    {\n");
            out.push_str(&format!(
                "        if (tid < s)\n            {}\n        barrier(CLK_LOCAL_MEM_FENCE);\n    }}\n\n",
                reduction_combine(*norm, "sdata[tid]", "sdata[tid + s]")
            ));
            out.push_str(
                "    if (tid == 0)\n        reduced[c*get_num_groups(0) + get_group_id(0)] = sdata[0];\n}\n",
            );
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use flux_rs::blasext::{Norm, ReductionMethod};

    #[test]
    fn axnpby_takes_global_buffers() {
        let text = render(&BlasTemplate::Axnpby {
            nv: 1,
            subdims: vec![0, 1],
            dtype: DType::F64,
        });
        assert!(text.starts_with(FP64_PRAGMA));
        assert!(text.contains("__global fpdtype_t* restrict x0, fpdtype_t a0)"));
        assert!(text.contains("if (a0 == 0) x0[idx] = 0;"));
    }

    #[test]
    fn reduction_uses_local_memory_and_barriers() {
        let text = render(&BlasTemplate::Reduction {
            method: ReductionMethod::Resid,
            norm: Norm::L2,
            dt_matrix: true,
            dtype: DType::F32,
        });
        assert!(!text.contains("cl_khr_fp64"));
        assert!(text.contains("__local fpdtype_t sdata[128];"));
        assert!(text.contains("barrier(CLK_LOCAL_MEM_FENCE);"));
        assert!(text.contains("sdata[tid] += sdata[tid + s];"));
        assert!(text.contains("__global const fpdtype_t* restrict dt_mat, fpdtype_t dt_fac)"));
    }
}
