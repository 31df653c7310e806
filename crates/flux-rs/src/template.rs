//! Named kernel templates and the arguments that parameterise them.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use serde_json::Value;

use crate::error::{BackendError, BackendResult};
use crate::generator::PointwiseSpec;
use crate::matrix::DType;

/// Generation-time parameters (counts, constants, feature flags).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TemplateArgs {
    values: BTreeMap<String, Value>,
}

impl TemplateArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json(text: &str) -> BackendResult<Self> {
        let values: BTreeMap<String, Value> = serde_json::from_str(text)
            .map_err(|err| BackendError::template(format!("invalid template arguments: {err}")))?;
        Ok(Self { values })
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    fn require(&self, key: &str) -> BackendResult<&Value> {
        self.values
            .get(key)
            .ok_or_else(|| BackendError::template(format!("missing template argument '{key}'")))
    }

    pub fn usize(&self, key: &str) -> BackendResult<usize> {
        self.require(key)?
            .as_u64()
            .map(|value| value as usize)
            .ok_or_else(|| BackendError::template(format!("template argument '{key}' is not a count")))
    }

    pub fn f64(&self, key: &str) -> BackendResult<f64> {
        self.require(key)?
            .as_f64()
            .ok_or_else(|| BackendError::template(format!("template argument '{key}' is not a number")))
    }

    pub fn str(&self, key: &str) -> BackendResult<&str> {
        self.require(key)?
            .as_str()
            .ok_or_else(|| BackendError::template(format!("template argument '{key}' is not a string")))
    }

    pub fn flag(&self, key: &str) -> bool {
        self.values
            .get(key)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn usize_or(&self, key: &str, default: usize) -> BackendResult<usize> {
        if self.values.contains_key(key) {
            self.usize(key)
        } else {
            Ok(default)
        }
    }
}

/// What a template sees when it renders.
#[derive(Debug, Clone, Copy)]
pub struct TemplateContext<'a> {
    pub args: &'a TemplateArgs,
    pub fpdtype: DType,
    pub soa_size: usize,
}

pub trait KernelTemplate: Send + Sync {
    fn render(&self, ctx: &TemplateContext<'_>) -> BackendResult<PointwiseSpec>;
}

impl<F> KernelTemplate for F
where
    F: Fn(&TemplateContext<'_>) -> BackendResult<PointwiseSpec> + Send + Sync,
{
    fn render(&self, ctx: &TemplateContext<'_>) -> BackendResult<PointwiseSpec> {
        self(ctx)
    }
}

/// Kernel name for a dotted template id: `"solver.kernels.tflux"` registers
/// the kernel `tflux`.
pub fn kernel_name(template_id: &str) -> &str {
    template_id.rsplit('.').next().unwrap_or(template_id)
}

#[derive(Default)]
pub struct TemplateRegistry {
    templates: Mutex<HashMap<String, Arc<dyn KernelTemplate>>>,
}

impl TemplateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `template` under the last segment of `template_id`.
    /// Registering a name a second time keeps the first template.
    pub fn register<T>(&self, template_id: &str, template: T) -> String
    where
        T: KernelTemplate + 'static,
    {
        let name = kernel_name(template_id).to_string();
        self.templates
            .lock()
            .expect("template registry poisoned")
            .entry(name.clone())
            .or_insert_with(|| Arc::new(template));
        name
    }

    pub fn contains(&self, name: &str) -> bool {
        self.templates
            .lock()
            .expect("template registry poisoned")
            .contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.templates
            .lock()
            .expect("template registry poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, name: &str) -> BackendResult<Arc<dyn KernelTemplate>> {
        self.templates
            .lock()
            .expect("template registry poisoned")
            .get(name)
            .cloned()
            .ok_or_else(|| BackendError::template(format!("unknown kernel template '{name}'")))
    }
}
