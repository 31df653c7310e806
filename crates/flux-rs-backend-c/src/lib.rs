//! Host execution backend.
//!
//! Kernels are rendered as C, compiled with the system compiler into shared
//! libraries and run on worker-thread queues. Addresses are plain host
//! pointers, so [`HostBuffer`] provides operand storage.

mod args;
pub mod blas;
pub mod buffer;
pub mod compiler;
pub mod generator;
pub mod queue;

use std::ffi::c_void;
use std::process::Command;
use std::sync::{Arc, OnceLock};

use flux_rs::backend::{Backend, StagingBuffer};
use flux_rs::blasext::BlasTemplate;
use flux_rs::config::RuntimeConfig;
use flux_rs::error::{BackendError, BackendResult};
use flux_rs::generator::PointwiseSpec;
use flux_rs::kernel::{ArgType, KernelArgs, LaunchConfig};
use flux_rs::matrix::Matrix;

pub use buffer::HostBuffer;
pub use compiler::{HostCompiler, HostFunction};
pub use queue::{HostEvent, HostQueue, LaunchTrace, TraceRecord};

/// Returns true when a working C compiler is on the path.
pub fn is_available() -> bool {
    static AVAILABLE: OnceLock<bool> = OnceLock::new();
    *AVAILABLE.get_or_init(|| {
        Command::new(compiler::c_compiler())
            .arg("--version")
            .output()
            .map(|output| output.status.success())
            .unwrap_or(false)
    })
}

/// Reduction scratch: a "device" buffer written by kernels and a host
/// mirror filled by the download.
pub struct HostStaging {
    device: Arc<HostBuffer>,
    host: Arc<HostBuffer>,
}

impl StagingBuffer for HostStaging {
    fn device_addr(&self) -> u64 {
        self.device.addr()
    }

    fn nbytes(&self) -> usize {
        self.device.len()
    }

    fn read_host(&self) -> BackendResult<Vec<u8>> {
        Ok(self.host.read())
    }
}

pub struct HostBackend {
    config: RuntimeConfig,
    compiler: HostCompiler,
    trace: Option<Arc<LaunchTrace>>,
}

impl HostBackend {
    pub fn new(config: RuntimeConfig) -> Self {
        let trace = config
            .trace_launches
            .then(|| Arc::new(LaunchTrace::default()));
        Self {
            compiler: HostCompiler::new(config.cache_dir.join("c")),
            config,
            trace,
        }
    }

    pub fn from_env() -> Self {
        Self::new(RuntimeConfig::from_env())
    }

    pub fn shared(config: RuntimeConfig) -> Arc<Self> {
        Arc::new(Self::new(config))
    }

    /// Launch trace shared by every queue, when enabled in the config.
    pub fn trace(&self) -> Option<&Arc<LaunchTrace>> {
        self.trace.as_ref()
    }

    pub fn programs_built(&self) -> usize {
        self.compiler.programs_built()
    }

    fn finish_submit(event: HostEvent, ret_evt: bool) -> Option<HostEvent> {
        ret_evt.then_some(event)
    }
}

impl Backend for HostBackend {
    type Queue = HostQueue;
    type Event = HostEvent;
    type Function = HostFunction;
    type Staging = HostStaging;

    fn name(&self) -> &'static str {
        "host-c"
    }

    fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    fn generate(&self, spec: &PointwiseSpec) -> String {
        generator::render(spec, self.config.precision, self.config.soa_size)
    }

    fn blas_source(&self, template: &BlasTemplate) -> String {
        blas::render(template)
    }

    fn build(
        &self,
        name: &str,
        source: &str,
        arg_types: &[ArgType],
    ) -> BackendResult<Arc<HostFunction>> {
        self.compiler.build(name, source, arg_types)
    }

    fn launch_config(&self, dims: &[usize]) -> LaunchConfig {
        let nx = dims.last().copied().unwrap_or(0);
        LaunchConfig::for_block((64, 1, 1), nx, 1)
    }

    fn launch(
        &self,
        queue: &HostQueue,
        function: &HostFunction,
        _launch: &LaunchConfig,
        args: &KernelArgs,
        wait_for: &[HostEvent],
        ret_evt: bool,
    ) -> BackendResult<Option<HostEvent>> {
        if args.len() != function.layout().offsets.len() {
            return Err(BackendError::execution(format!(
                "kernel {} declared {} arguments, launched with {}",
                function.name(),
                function.layout().offsets.len(),
                args.len()
            )));
        }
        let words = args::pack(function.layout(), args);
        let entry = function.entry();
        let program = Arc::clone(function.program());
        let event = queue.submit(
            function.name(),
            wait_for,
            Box::new(move || {
                let _keep_loaded = program;
                // SAFETY: `words` mirrors the kernel's argument struct layout.
                unsafe { entry(words.as_ptr() as *const c_void) };
            }),
        )?;
        Ok(Self::finish_submit(event, ret_evt))
    }

    fn copy_async(
        &self,
        queue: &HostQueue,
        dst: u64,
        src: u64,
        nbytes: usize,
        wait_for: &[HostEvent],
        ret_evt: bool,
    ) -> BackendResult<Option<HostEvent>> {
        let event = queue.submit(
            "copy",
            wait_for,
            Box::new(move || {
                // SAFETY: Matrix addresses on this backend are live host allocations of
                // at least `nbytes`.
                unsafe { buffer::copy_raw(dst, src, nbytes) };
            }),
        )?;
        Ok(Self::finish_submit(event, ret_evt))
    }

    fn marker(&self, queue: &HostQueue, events: &[HostEvent]) -> BackendResult<HostEvent> {
        queue.submit("marker", events, Box::new(|| {}))
    }

    fn alloc_staging(&self, nbytes: usize) -> BackendResult<HostStaging> {
        Ok(HostStaging {
            device: Arc::new(HostBuffer::zeroed(nbytes)?),
            host: Arc::new(HostBuffer::zeroed(nbytes)?),
        })
    }

    fn download_staging(
        &self,
        queue: &HostQueue,
        staging: &HostStaging,
        wait_for: &[HostEvent],
        ret_evt: bool,
    ) -> BackendResult<Option<HostEvent>> {
        let device = Arc::clone(&staging.device);
        let host = Arc::clone(&staging.host);
        let event = queue.submit(
            "download",
            wait_for,
            Box::new(move || host.write(0, &device.read())),
        )?;
        Ok(Self::finish_submit(event, ret_evt))
    }

    fn create_queue(&self) -> BackendResult<HostQueue> {
        HostQueue::new(self.trace.clone())
    }

    fn synchronize(&self, queue: &HostQueue) -> BackendResult<()> {
        queue.finish()
    }

    fn read_matrix(&self, matrix: &Matrix) -> BackendResult<Vec<u8>> {
        // SAFETY: Matrix addresses on this backend are live host allocations of
        // `nbytes()` bytes.
        Ok(unsafe { buffer::read_raw(matrix.addr(), matrix.nbytes()) })
    }

    fn write_matrix(&self, matrix: &Matrix, bytes: &[u8]) -> BackendResult<()> {
        if bytes.len() != matrix.nbytes() {
            return Err(BackendError::execution(format!(
                "write of {} bytes into a {}-byte matrix",
                bytes.len(),
                matrix.nbytes()
            )));
        }
        // SAFETY: Lengths match and the source is a distinct host slice.
        unsafe { buffer::copy_raw(matrix.addr(), bytes.as_ptr() as u64, bytes.len()) };
        Ok(())
    }
}
