use std::sync::Arc;

use smallvec::SmallVec;

use crate::backend::Backend;
use crate::error::{BackendError, BackendResult};
use crate::matrix::DType;

/// Declared type of one kernel parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArgType {
    Int32,
    Pointer,
    Scalar(DType),
}

impl ArgType {
    pub fn size_bytes(self) -> usize {
        match self {
            ArgType::Int32 => 4,
            ArgType::Pointer => 8,
            ArgType::Scalar(dtype) => dtype.size_bytes(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ArgValue {
    Int32(i32),
    Pointer(u64),
    F32(f32),
    F64(f64),
}

impl ArgValue {
    pub fn to_ne_bytes(self) -> SmallVec<[u8; 8]> {
        match self {
            ArgValue::Int32(value) => SmallVec::from_slice(&value.to_ne_bytes()),
            ArgValue::Pointer(value) => SmallVec::from_slice(&value.to_ne_bytes()),
            ArgValue::F32(value) => SmallVec::from_slice(&value.to_ne_bytes()),
            ArgValue::F64(value) => SmallVec::from_slice(&value.to_ne_bytes()),
        }
    }

    fn as_f64(self) -> Option<f64> {
        match self {
            ArgValue::Int32(value) => Some(value as f64),
            ArgValue::F32(value) => Some(value as f64),
            ArgValue::F64(value) => Some(value),
            ArgValue::Pointer(_) => None,
        }
    }

    /// Converts a host value to the declared parameter type.
    ///
    /// Panics when a pointer is paired with a numeric slot or vice versa.
    pub fn coerce(self, ty: ArgType) -> ArgValue {
        match (ty, self) {
            (ArgType::Pointer, ArgValue::Pointer(addr)) => ArgValue::Pointer(addr),
            (ArgType::Pointer, other) => panic!("pointer parameter given {other:?}"),
            (ty, value) => {
                let numeric = value
                    .as_f64()
                    .unwrap_or_else(|| panic!("numeric parameter {ty:?} given a pointer"));
                ArgValue::from_f64(numeric, ty)
            }
        }
    }

    fn from_f64(value: f64, ty: ArgType) -> ArgValue {
        match ty {
            ArgType::Int32 | ArgType::Scalar(DType::I32) => ArgValue::Int32(value as i32),
            ArgType::Scalar(DType::F32) => ArgValue::F32(value as f32),
            ArgType::Scalar(DType::F64) => ArgValue::F64(value),
            ArgType::Pointer => panic!("cannot bind a numeric value to a pointer parameter"),
        }
    }

    fn placeholder(ty: ArgType) -> ArgValue {
        match ty {
            ArgType::Pointer => ArgValue::Pointer(0),
            other => ArgValue::from_f64(0.0, other),
        }
    }
}

impl From<i32> for ArgValue {
    fn from(value: i32) -> Self {
        ArgValue::Int32(value)
    }
}

impl From<f64> for ArgValue {
    fn from(value: f64) -> Self {
        ArgValue::F64(value)
    }
}

impl From<f32> for ArgValue {
    fn from(value: f32) -> Self {
        ArgValue::F32(value)
    }
}

/// Contiguous range of arguments that [`Kernel::bind`] overwrites.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RuntimeSlots {
    pub offset: usize,
    pub count: usize,
}

impl RuntimeSlots {
    pub fn new(offset: usize, count: usize) -> Self {
        Self { offset, count }
    }

    pub fn none() -> Self {
        Self::default()
    }

    pub fn suffix_of(types: &[ArgType], offset: usize) -> Self {
        assert!(offset <= types.len(), "runtime slot offset out of range");
        Self {
            offset,
            count: types.len() - offset,
        }
    }
}

/// Pending argument values for one launch, typed at construction.
#[derive(Debug, Clone, PartialEq)]
pub struct KernelArgs {
    types: Vec<ArgType>,
    values: Vec<ArgValue>,
}

impl KernelArgs {
    pub fn new(types: Vec<ArgType>) -> Self {
        let values = types.iter().map(|ty| ArgValue::placeholder(*ty)).collect();
        Self { types, values }
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    pub fn types(&self) -> &[ArgType] {
        &self.types
    }

    pub fn values(&self) -> &[ArgValue] {
        &self.values
    }

    pub fn set(&mut self, index: usize, value: impl Into<ArgValue>) {
        let ty = self.types[index];
        self.values[index] = value.into().coerce(ty);
    }

    /// Writes `values` starting at `start`.
    pub fn set_from(&mut self, start: usize, values: &[ArgValue]) {
        assert!(
            start + values.len() <= self.len(),
            "{} arguments from offset {start} overflow a {}-argument kernel",
            values.len(),
            self.len()
        );
        for (index, value) in values.iter().enumerate() {
            self.set(start + index, *value);
        }
    }

    /// Overwrites exactly the runtime slots. Panics on a count mismatch.
    pub fn bind(&mut self, slots: RuntimeSlots, values: &[f64]) {
        assert_eq!(
            values.len(),
            slots.count,
            "kernel expects {} runtime arguments, got {}",
            slots.count,
            values.len()
        );
        for (index, value) in values.iter().enumerate() {
            let slot = slots.offset + index;
            self.values[slot] = ArgValue::from_f64(*value, self.types[slot]);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchConfig {
    pub grid: (u32, u32, u32),
    pub block: (u32, u32, u32),
}

impl LaunchConfig {
    /// Enough blocks of `block` to cover an `nx` by `ny` range.
    pub fn for_block(block: (u32, u32, u32), nx: usize, ny: usize) -> Self {
        let blocks = |n: usize, b: u32| -> u32 {
            let b = b.max(1) as usize;
            (n.div_ceil(b)).max(1) as u32
        };
        Self {
            grid: (blocks(nx, block.0), blocks(ny, block.1), 1),
            block,
        }
    }

    pub fn global_size(&self) -> (usize, usize) {
        (
            self.grid.0 as usize * self.block.0 as usize,
            self.grid.1 as usize * self.block.1 as usize,
        )
    }
}

/// A unit of asynchronous device work.
///
/// `run` never blocks; when `ret_evt` is set the returned event completes
/// once the work has finished on the device.
pub trait Kernel<B: Backend> {
    /// Number of runtime constants `bind` expects.
    fn runtime_arity(&self) -> usize {
        0
    }

    /// Refreshes runtime constants. Kernels without any panic when given
    /// values.
    fn bind(&mut self, values: &[f64]) {
        assert!(
            values.is_empty(),
            "kernel takes no runtime arguments, got {}",
            values.len()
        );
    }

    fn run(
        &self,
        queue: &B::Queue,
        wait_for: &[B::Event],
        ret_evt: bool,
    ) -> BackendResult<Option<B::Event>>;
}

/// A compiled function with its launch geometry and argument buffer.
pub struct ComputeKernel<B: Backend> {
    backend: Arc<B>,
    function: Arc<B::Function>,
    launch: LaunchConfig,
    args: KernelArgs,
    slots: RuntimeSlots,
}

impl<B: Backend> ComputeKernel<B> {
    pub fn new(
        backend: Arc<B>,
        function: Arc<B::Function>,
        launch: LaunchConfig,
        args: KernelArgs,
        slots: RuntimeSlots,
    ) -> Self {
        Self {
            backend,
            function,
            launch,
            args,
            slots,
        }
    }

    pub fn launch_config(&self) -> LaunchConfig {
        self.launch
    }

    pub fn args(&self) -> &KernelArgs {
        &self.args
    }

    pub fn runtime_slots(&self) -> RuntimeSlots {
        self.slots
    }
}

impl<B: Backend> Kernel<B> for ComputeKernel<B> {
    fn runtime_arity(&self) -> usize {
        self.slots.count
    }

    fn bind(&mut self, values: &[f64]) {
        self.args.bind(self.slots, values);
    }

    fn run(
        &self,
        queue: &B::Queue,
        wait_for: &[B::Event],
        ret_evt: bool,
    ) -> BackendResult<Option<B::Event>> {
        self.backend
            .launch(queue, &self.function, &self.launch, &self.args, wait_for, ret_evt)
    }
}

fn members_arity<B: Backend>(kernels: &[Box<dyn Kernel<B> + Send>]) -> usize {
    kernels.iter().map(|kernel| kernel.runtime_arity()).sum()
}

/// Hands each member its own slice of `values`, in member order.
fn bind_members<B: Backend>(kernels: &mut [Box<dyn Kernel<B> + Send>], values: &[f64]) {
    let expected = members_arity(kernels);
    assert_eq!(
        values.len(),
        expected,
        "composite expects {expected} runtime arguments, got {}",
        values.len()
    );
    let mut rest = values;
    for kernel in kernels.iter_mut() {
        let (head, tail) = rest.split_at(kernel.runtime_arity());
        kernel.bind(head);
        rest = tail;
    }
}

fn missing_event() -> BackendError {
    BackendError::execution("kernel did not return a completion event")
}

/// Runs members one after another, each gated on its predecessor.
pub struct OrderedKernel<B: Backend> {
    kernels: Vec<Box<dyn Kernel<B> + Send>>,
}

impl<B: Backend> OrderedKernel<B> {
    pub fn new(kernels: Vec<Box<dyn Kernel<B> + Send>>) -> Self {
        assert!(!kernels.is_empty(), "ordered composite needs at least one kernel");
        Self { kernels }
    }

    pub fn len(&self) -> usize {
        self.kernels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kernels.is_empty()
    }
}

impl<B: Backend> Kernel<B> for OrderedKernel<B> {
    fn runtime_arity(&self) -> usize {
        members_arity(&self.kernels)
    }

    fn bind(&mut self, values: &[f64]) {
        bind_members(&mut self.kernels, values);
    }

    fn run(
        &self,
        queue: &B::Queue,
        wait_for: &[B::Event],
        ret_evt: bool,
    ) -> BackendResult<Option<B::Event>> {
        let Some((last, head)) = self.kernels.split_last() else {
            return Ok(None);
        };
        let mut deps: SmallVec<[B::Event; 4]> = wait_for.iter().cloned().collect();
        for kernel in head {
            let event = kernel.run(queue, &deps, true)?.ok_or_else(missing_event)?;
            deps.clear();
            deps.push(event);
        }
        last.run(queue, &deps, ret_evt)
    }
}

/// Runs members from a shared wait list with no ordering between them.
pub struct UnorderedKernel<B: Backend> {
    backend: Arc<B>,
    kernels: Vec<Box<dyn Kernel<B> + Send>>,
}

impl<B: Backend> UnorderedKernel<B> {
    pub fn new(backend: Arc<B>, kernels: Vec<Box<dyn Kernel<B> + Send>>) -> Self {
        assert!(!kernels.is_empty(), "unordered composite needs at least one kernel");
        Self { backend, kernels }
    }

    pub fn len(&self) -> usize {
        self.kernels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kernels.is_empty()
    }
}

impl<B: Backend> Kernel<B> for UnorderedKernel<B> {
    fn runtime_arity(&self) -> usize {
        members_arity(&self.kernels)
    }

    fn bind(&mut self, values: &[f64]) {
        bind_members(&mut self.kernels, values);
    }

    fn run(
        &self,
        queue: &B::Queue,
        wait_for: &[B::Event],
        ret_evt: bool,
    ) -> BackendResult<Option<B::Event>> {
        if !ret_evt {
            for kernel in &self.kernels {
                kernel.run(queue, wait_for, false)?;
            }
            return Ok(None);
        }

        let mut events: SmallVec<[B::Event; 4]> = SmallVec::new();
        for kernel in &self.kernels {
            let event = kernel.run(queue, wait_for, true)?.ok_or_else(missing_event)?;
            events.push(event);
        }
        self.backend.marker(queue, &events).map(Some)
    }
}
