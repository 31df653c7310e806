use std::sync::Arc;

use crate::backend::Backend;
use crate::blasext::{self, CopyKernel, Norm, ReductionKernel, ReductionMethod};
use crate::error::BackendResult;
use crate::kernel::{ComputeKernel, Kernel, OrderedKernel, UnorderedKernel};
use crate::matrix::Matrix;
use crate::pointwise::{self, KernelOperands};
use crate::template::{KernelTemplate, TemplateArgs, TemplateContext, TemplateRegistry};

/// Client-facing entry point: templates, pointwise kernels, BLAS-extension
/// operators and composites for one backend instance.
pub struct Runtime<B: Backend> {
    backend: Arc<B>,
    templates: TemplateRegistry,
}

impl<B: Backend> Runtime<B> {
    pub fn new(backend: Arc<B>) -> Self {
        Self {
            backend,
            templates: TemplateRegistry::new(),
        }
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    pub fn templates(&self) -> &TemplateRegistry {
        &self.templates
    }

    /// Registers a template under the last `.`-segment of `template_id` and
    /// returns that kernel name.
    pub fn register<T>(&self, template_id: &str, template: T) -> String
    where
        T: KernelTemplate + 'static,
    {
        self.templates.register(template_id, template)
    }

    pub fn kernel(
        &self,
        name: &str,
        tplargs: &TemplateArgs,
        dims: &[usize],
        operands: &KernelOperands,
    ) -> BackendResult<ComputeKernel<B>> {
        let template = self.templates.get(name)?;
        let config = self.backend.config();
        let ctx = TemplateContext {
            args: tplargs,
            fpdtype: config.precision,
            soa_size: config.soa_size,
        };
        let spec = template.render(&ctx)?;
        pointwise::instantiate(&self.backend, &spec, dims, operands)
    }

    pub fn axnpby(
        &self,
        arr: &[&Matrix],
        subdims: Option<&[usize]>,
    ) -> BackendResult<ComputeKernel<B>> {
        blasext::axnpby(&self.backend, arr, subdims)
    }

    pub fn copy(&self, dst: &Matrix, src: &Matrix) -> BackendResult<CopyKernel<B>> {
        blasext::copy(&self.backend, dst, src)
    }

    pub fn reduction(
        &self,
        rs: &[&Matrix],
        method: ReductionMethod,
        norm: Norm,
        dt_mat: Option<&Matrix>,
    ) -> BackendResult<ReductionKernel<B>> {
        blasext::reduction(&self.backend, rs, method, norm, dt_mat)
    }

    pub fn ordered(&self, kernels: Vec<Box<dyn Kernel<B> + Send>>) -> OrderedKernel<B> {
        OrderedKernel::new(kernels)
    }

    pub fn unordered(&self, kernels: Vec<Box<dyn Kernel<B> + Send>>) -> UnorderedKernel<B> {
        UnorderedKernel::new(Arc::clone(&self.backend), kernels)
    }
}
