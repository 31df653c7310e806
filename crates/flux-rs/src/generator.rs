//! Backend-neutral description of a pointwise kernel.
//!
//! A [`PointwiseSpec`] fixes the host-side marshalling order once: iteration
//! sizes, then scalars in declared order, then vector operands. Each backend
//! dialect renders the same [`FormalParam`] list into its own signature, so
//! the argument buffer built by the runtime lines up with every dialect.

use crate::kernel::ArgType;
use crate::matrix::DType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Intent {
    In,
    Out,
    InOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArgKind {
    Scalar,
    Array,
    View,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KernelArg {
    pub name: String,
    pub dtype: DType,
    pub kind: ArgKind,
    pub intent: Intent,
    pub ncdim: u8,
}

impl KernelArg {
    pub fn scalar(name: impl Into<String>, dtype: DType) -> Self {
        Self {
            name: name.into(),
            dtype,
            kind: ArgKind::Scalar,
            intent: Intent::In,
            ncdim: 0,
        }
    }

    pub fn array(name: impl Into<String>, dtype: DType, intent: Intent) -> Self {
        Self {
            name: name.into(),
            dtype,
            kind: ArgKind::Array,
            intent,
            ncdim: 0,
        }
    }

    /// An array indexed by component as well as by point (`ncdim` of 1 or 2).
    pub fn array_nd(name: impl Into<String>, dtype: DType, intent: Intent, ncdim: u8) -> Self {
        assert!(ncdim <= 2, "component dimensionality must be 0, 1 or 2");
        Self {
            ncdim,
            ..Self::array(name, dtype, intent)
        }
    }

    pub fn view(name: impl Into<String>, dtype: DType, intent: Intent, ncdim: u8) -> Self {
        assert!(ncdim <= 2, "component dimensionality must be 0, 1 or 2");
        Self {
            name: name.into(),
            dtype,
            kind: ArgKind::View,
            intent,
            ncdim,
        }
    }

    pub fn is_scalar(&self) -> bool {
        self.kind == ArgKind::Scalar
    }

    pub fn is_view(&self) -> bool {
        self.kind == ArgKind::View
    }
}

/// One formal parameter of a rendered kernel, in marshalling order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FormalParam {
    Dim(&'static str),
    Scalar { name: String, dtype: DType },
    Data { name: String, dtype: DType, readonly: bool },
    Index(String),
    ColStride(String),
    RowStride(String),
    LeadDim(String),
}

impl FormalParam {
    pub fn arg_type(&self) -> ArgType {
        match self {
            FormalParam::Dim(_) | FormalParam::LeadDim(_) => ArgType::Int32,
            FormalParam::Scalar { dtype, .. } => ArgType::Scalar(*dtype),
            FormalParam::Data { .. }
            | FormalParam::Index(_)
            | FormalParam::ColStride(_)
            | FormalParam::RowStride(_) => ArgType::Pointer,
        }
    }

    /// Identifier used for this parameter inside the kernel body.
    pub fn ident(&self) -> String {
        match self {
            FormalParam::Dim(name) => (*name).to_string(),
            FormalParam::Scalar { name, .. } => name.clone(),
            FormalParam::Data { name, .. } => format!("{name}_v"),
            FormalParam::Index(name) => format!("{name}_vix"),
            FormalParam::ColStride(name) => format!("{name}_vcstri"),
            FormalParam::RowStride(name) => format!("{name}_vrstri"),
            FormalParam::LeadDim(name) => format!("ld{name}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PointwiseSpec {
    pub name: String,
    pub ndim: usize,
    pub args: Vec<KernelArg>,
    pub body: String,
}

impl PointwiseSpec {
    /// Panics unless `ndim` is 1 or 2.
    pub fn new(
        name: impl Into<String>,
        ndim: usize,
        args: Vec<KernelArg>,
        body: impl Into<String>,
    ) -> Self {
        assert!(
            ndim == 1 || ndim == 2,
            "pointwise kernels iterate over 1 or 2 dimensions, got {ndim}"
        );
        Self {
            name: name.into(),
            ndim,
            args,
            body: body.into(),
        }
    }

    pub fn dims(&self) -> &'static [&'static str] {
        if self.ndim == 1 {
            &["_nx"]
        } else {
            &["_ny", "_nx"]
        }
    }

    pub fn scalars(&self) -> impl Iterator<Item = &KernelArg> {
        self.args.iter().filter(|arg| arg.is_scalar())
    }

    pub fn vectors(&self) -> impl Iterator<Item = &KernelArg> {
        self.args.iter().filter(|arg| !arg.is_scalar())
    }

    /// A dense operand carries its leading dimension unless the stride
    /// follows from a 1-D iteration over a component-free array.
    pub fn needs_ldim(&self, arg: &KernelArg) -> bool {
        arg.kind == ArgKind::Array && (self.ndim == 2 || arg.ncdim > 0)
    }

    pub fn formal_params(&self) -> Vec<FormalParam> {
        let mut params: Vec<FormalParam> =
            self.dims().iter().copied().map(FormalParam::Dim).collect();

        params.extend(self.scalars().map(|arg| FormalParam::Scalar {
            name: arg.name.clone(),
            dtype: arg.dtype,
        }));

        for arg in self.vectors() {
            params.push(FormalParam::Data {
                name: arg.name.clone(),
                dtype: arg.dtype,
                readonly: arg.kind == ArgKind::Array && arg.intent == Intent::In,
            });
            if arg.is_view() {
                params.push(FormalParam::Index(arg.name.clone()));
                if arg.ncdim >= 1 {
                    params.push(FormalParam::ColStride(arg.name.clone()));
                }
                if arg.ncdim == 2 {
                    params.push(FormalParam::RowStride(arg.name.clone()));
                }
            } else if self.needs_ldim(arg) {
                params.push(FormalParam::LeadDim(arg.name.clone()));
            }
        }
        params
    }

    pub fn arg_types(&self) -> Vec<ArgType> {
        self.formal_params().iter().map(FormalParam::arg_type).collect()
    }
}

/// Preprocessor definitions shared by every C-family dialect.
///
/// Bodies address structure-of-arrays tiles through `SOA_IX` and the
/// current point through `X_IDX`, so the same body text works whatever the
/// tiling or dialect.
pub fn layout_macros(fpdtype: DType, soa_size: usize) -> String {
    format!(
        "#define fpdtype_t {fp}\n\
         #define SOA_SZ {soa}\n\
         #define SOA_IX(a, v, nv) ((((a) / SOA_SZ)*(nv) + (v))*SOA_SZ + (a) % SOA_SZ)\n\
         #define X_IDX (_x)\n\
         #define X_IDX_AOSOA(v, nv) SOA_IX(X_IDX, v, nv)\n",
        fp = fpdtype.c_type(),
        soa = soa_size
    )
}

/// Renders a comma separated parameter list with a dialect specific
/// formatter.
pub fn join_params<F>(params: &[FormalParam], render: F) -> String
where
    F: FnMut(&FormalParam) -> String,
{
    params
        .iter()
        .map(render)
        .collect::<Vec<_>>()
        .join(", ")
}
