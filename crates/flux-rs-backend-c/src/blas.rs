//! Host C sources for the BLAS-extension kernels.

use flux_rs::blasext::{
    axnpby_column, reduction_accumulate, reduction_operands, reduction_term, BlasTemplate,
    BLAS_BLOCK,
};

use crate::generator::indent;

fn render_head(name: &str, ctype: &str, fields: &[(String, String)]) -> String {
    let mut out = format!("#include <math.h>\n\ntypedef {ctype} fpdtype_t;\n\nstruct kargs_{name}\n{{\n");
    for (ty, ident) in fields {
        out.push_str(&format!("    {ty} {ident};\n"));
    }
    out.push_str("};\n\n");
    out.push_str(&format!("void {name}(const struct kargs_{name}* restrict _args)\n{{\n"));
    for (ty, ident) in fields {
        let local = if ty.ends_with('*') {
            format!("{ty} restrict")
        } else {
            format!("const {ty}")
        };
        out.push_str(&format!("    {local} {ident} = _args->{ident};\n"));
    }
    out
}

fn dims_fields() -> Vec<(String, String)> {
    ["nrow", "ncol", "ldim"]
        .iter()
        .map(|name| ("int".to_string(), (*name).to_string()))
        .collect()
}

pub fn render(template: &BlasTemplate) -> String {
    let ctype = template.dtype().c_type();
    match template {
        BlasTemplate::Axnpby { nv, subdims, .. } => {
            let mut fields = dims_fields();
            fields.extend((0..*nv).map(|i| ("fpdtype_t*".to_string(), format!("x{i}"))));
            fields.extend((0..*nv).map(|i| ("fpdtype_t".to_string(), format!("a{i}"))));

            let mut out = render_head("axnpby", ctype, &fields);
            out.push_str("    (void) ncol;\n\n    for (int i = 0; i < nrow; ++i)\n    {\n");
            for col in subdims {
                out.push_str(&format!("        {{\n            const int idx = i*ldim + {col};\n"));
                out.push_str(&indent(&axnpby_column(*nv, "idx"), 12));
                out.push_str("\n        }\n");
            }
            out.push_str("    }\n}\n");
            out
        }
        BlasTemplate::Reduction {
            method,
            norm,
            dt_matrix,
            ..
        } => {
            let (operands, factors) = reduction_operands(*method, *dt_matrix);
            let mut fields = dims_fields();
            fields.push(("fpdtype_t*".to_string(), "reduced".to_string()));
            fields.extend(operands.iter().map(|name| ("const fpdtype_t*".to_string(), name.to_string())));
            fields.extend(factors.iter().map(|name| ("fpdtype_t".to_string(), name.to_string())));

            let mut out = render_head("reduction", ctype, &fields);
            out.push_str(&format!(
                "\n    const int block = {BLAS_BLOCK};\n    int nblocks = (nrow + block - 1) / block;\n    if (nblocks < 1)\n        nblocks = 1;\n\n"
            ));
            out.push_str("    for (int c = 0; c < ncol; ++c)\n    {\n");
            out.push_str("        for (int b = 0; b < nblocks; ++b)\n        {\n");
            out.push_str("            fpdtype_t acc = 0;\n");
            out.push_str("            for (int i = b*block; i < nrow && i < (b + 1)*block; ++i)\n            {\n");
            out.push_str("                const int idx = i*ldim + c;\n");
            out.push_str(&format!(
                "                const fpdtype_t e = {};\n",
                reduction_term(*method, *dt_matrix, "idx")
            ));
            out.push_str(&format!("                {}\n", reduction_accumulate(*norm, "acc", "e")));
            out.push_str("            }\n            reduced[c*nblocks + b] = acc;\n        }\n    }\n}\n");
            out
        }
    }
}
