//! Host C dialect.
//!
//! Every kernel takes a single pointer to `struct kargs_<name>`, whose
//! fields follow the marshalling order of the pointwise spec. The body
//! sees each field as a local of the same name and runs inside a loop over
//! `_x` that stands in for the device thread grid.

use flux_rs::generator::{layout_macros, FormalParam, PointwiseSpec};
use flux_rs::matrix::DType;

fn field_decl(param: &FormalParam) -> String {
    let ident = param.ident();
    match param {
        FormalParam::Dim(_) | FormalParam::LeadDim(_) => format!("int {ident}"),
        FormalParam::Scalar { dtype, .. } => format!("{} {ident}", dtype.c_type()),
        FormalParam::Data {
            dtype, readonly, ..
        } => {
            let qualifier = if *readonly { "const " } else { "" };
            format!("{qualifier}{}* {ident}", dtype.c_type())
        }
        FormalParam::Index(_) | FormalParam::ColStride(_) | FormalParam::RowStride(_) => {
            format!("const int* {ident}")
        }
    }
}

fn local_decl(param: &FormalParam) -> String {
    let ident = param.ident();
    let decl = match param {
        FormalParam::Dim(_) | FormalParam::LeadDim(_) | FormalParam::Scalar { .. } => {
            format!("const {}", field_decl(param))
        }
        _ => field_decl(param).replacen('*', "* restrict", 1),
    };
    format!("{decl} = _args->{ident};")
}

/// Opening of a kernel: includes, layout macros, the argument struct and
/// the function signature up to its opening brace plus unpacked locals.
pub(crate) fn render_prologue(name: &str, params: &[FormalParam], fpdtype: DType, soa_size: usize) -> String {
    let mut out = String::from("#include <math.h>\n\n");
    out.push_str(&layout_macros(fpdtype, soa_size));
    out.push('\n');
    out.push_str(&format!("struct kargs_{name}\n{{\n"));
    for param in params {
        out.push_str(&format!("    {};\n", field_decl(param)));
    }
    out.push_str("};\n\n");
    out.push_str(&format!("void {name}(const struct kargs_{name}* restrict _args)\n{{\n"));
    for param in params {
        out.push_str(&format!("    {}\n", local_decl(param)));
    }
    out
}

pub fn render(spec: &PointwiseSpec, fpdtype: DType, soa_size: usize) -> String {
    let params = spec.formal_params();
    let mut out = render_prologue(&spec.name, &params, fpdtype, soa_size);

    let limits = if spec.ndim == 1 {
        "if (_x < _nx)"
    } else {
        "for (int _y = 0; _y < _ny && _x < _nx; ++_y)"
    };
    out.push_str(&format!(
        "\n    for (int _x = 0; _x < _nx; ++_x)\n    {{\n        {limits}\n        {{\n{body}\n        }}\n    }}\n}}\n",
        body = indent(&spec.body, 12)
    ));
    out
}

pub(crate) fn indent(text: &str, width: usize) -> String {
    let pad = " ".repeat(width);
    text.lines()
        .map(|line| {
            if line.trim().is_empty() {
                String::new()
            } else {
                format!("{pad}{}", line.trim_start())
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}
