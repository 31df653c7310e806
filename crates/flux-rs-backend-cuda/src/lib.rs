//! CUDA execution backend.
//!
//! The driver API and NVRTC are loaded at runtime, so this crate builds
//! without a CUDA toolkit and reports the backend unavailable when the
//! libraries are missing. Queues are streams; events are recorded CUDA
//! events shared by reference count.

pub mod blas;
pub mod driver;
pub mod generator;
pub mod nvrtc;

use std::ffi::c_void;
use std::sync::{Arc, Mutex};

use flux_rs::backend::{Backend, StagingBuffer};
use flux_rs::blasext::BlasTemplate;
use flux_rs::config::RuntimeConfig;
use flux_rs::env;
use flux_rs::error::{BackendError, BackendResult};
use flux_rs::generator::PointwiseSpec;
use flux_rs::kernel::{ArgType, KernelArgs, LaunchConfig};
use flux_rs::matrix::{Matrix, MatrixTraits};
use flux_rs::profiling;
use flux_rs::provider::ProgramCache;
use smallvec::SmallVec;

pub use driver::{
    is_available, CudaDriver, CudaEvent, CudaFunction, CudaModule, CudaStream, DeviceBuffer,
    PinnedBuffer,
};
use nvrtc::Nvrtc;

const POINTWISE_BLOCK: (u32, u32, u32) = (128, 1, 1);

/// Reduction scratch: device partials and the pinned host copy they are
/// downloaded into. Dropping it waits for any download still in flight.
pub struct CudaStaging {
    device: Arc<DeviceBuffer>,
    host: PinnedBuffer,
    pending: Mutex<Option<CudaEvent>>,
}

impl Drop for CudaStaging {
    fn drop(&mut self) {
        let pending = self
            .pending
            .get_mut()
            .unwrap_or_else(|err| err.into_inner())
            .take();
        if let Some(event) = pending {
            let _ = event.synchronize();
        }
    }
}

impl StagingBuffer for CudaStaging {
    fn device_addr(&self) -> u64 {
        self.device.device_ptr()
    }

    fn nbytes(&self) -> usize {
        self.device.bytes()
    }

    fn read_host(&self) -> BackendResult<Vec<u8>> {
        Ok(self.host.to_vec())
    }
}

pub struct CudaBackend {
    config: RuntimeConfig,
    driver: Arc<CudaDriver>,
    nvrtc: Nvrtc,
    flags: Vec<String>,
    programs: ProgramCache<CudaModule>,
}

impl CudaBackend {
    pub fn new(config: RuntimeConfig) -> BackendResult<Self> {
        let driver = driver::driver()?;
        let nvrtc = Nvrtc::load()?;
        let (major, minor) = driver.compute_capability();
        let mut flags = vec![format!("--gpu-architecture=compute_{major}{minor}")];
        if let Some(extra) = env::var("FLUXRS_CUDA_FLAGS") {
            flags.extend(extra.split_whitespace().map(str::to_string));
        }
        Ok(Self {
            config,
            driver,
            nvrtc,
            flags,
            programs: ProgramCache::new(),
        })
    }

    pub fn from_env() -> BackendResult<Self> {
        Self::new(RuntimeConfig::from_env())
    }

    pub fn shared(config: RuntimeConfig) -> BackendResult<Arc<Self>> {
        Self::new(config).map(Arc::new)
    }

    pub fn driver(&self) -> &Arc<CudaDriver> {
        &self.driver
    }

    pub fn programs_built(&self) -> usize {
        self.programs.builds()
    }

    /// Allocates device storage for `traits` initialised from `bytes`.
    pub fn alloc_matrix(
        &self,
        traits: MatrixTraits,
        bytes: &[u8],
    ) -> BackendResult<(Arc<DeviceBuffer>, Matrix)> {
        if bytes.len() != traits.nbytes() {
            return Err(BackendError::execution(format!(
                "{} bytes supplied for a {}-byte matrix",
                bytes.len(),
                traits.nbytes()
            )));
        }
        let buffer = self.driver.alloc_and_upload(bytes)?;
        let matrix = Matrix::new(buffer.device_ptr(), traits);
        Ok((buffer, matrix))
    }

    fn finish(&self, stream: &CudaStream, ret_evt: bool) -> BackendResult<Option<CudaEvent>> {
        if ret_evt {
            stream.record().map(Some)
        } else {
            Ok(None)
        }
    }
}

impl Backend for CudaBackend {
    type Queue = CudaStream;
    type Event = CudaEvent;
    type Function = CudaFunction;
    type Staging = CudaStaging;

    fn name(&self) -> &'static str {
        "cuda"
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
        _arg_types: &[ArgType],
    ) -> BackendResult<Arc<CudaFunction>> {
        let flags_key = self.flags.join(" ");
        let module = self.programs.get_or_build(source, &flags_key, || {
            let _scope = profiling::compile_scope("cuda.nvrtc");
            let ptx = self.nvrtc.compile(source, name, &self.flags)?;
            self.driver.load_ptx_module(&ptx)
        })?;
        self.driver.get_function(&module, name).map(Arc::new)
    }

    fn launch_config(&self, dims: &[usize]) -> LaunchConfig {
        let nx = dims.last().copied().unwrap_or(0);
        LaunchConfig::for_block(POINTWISE_BLOCK, nx, 1)
    }

    fn launch(
        &self,
        queue: &CudaStream,
        function: &CudaFunction,
        launch: &LaunchConfig,
        args: &KernelArgs,
        wait_for: &[CudaEvent],
        ret_evt: bool,
    ) -> BackendResult<Option<CudaEvent>> {
        queue.wait_events(wait_for)?;
        let mut storage: Vec<SmallVec<[u8; 8]>> =
            args.values().iter().map(|value| value.to_ne_bytes()).collect();
        let mut params: SmallVec<[*mut c_void; 16]> = storage
            .iter_mut()
            .map(|bytes| bytes.as_mut_ptr() as *mut c_void)
            .collect();
        self.driver
            .launch_kernel(queue, function, launch.grid, launch.block, &mut params)?;
        self.finish(queue, ret_evt)
    }

    fn copy_async(
        &self,
        queue: &CudaStream,
        dst: u64,
        src: u64,
        nbytes: usize,
        wait_for: &[CudaEvent],
        ret_evt: bool,
    ) -> BackendResult<Option<CudaEvent>> {
        queue.wait_events(wait_for)?;
        self.driver.copy_async(queue, dst, src, nbytes)?;
        self.finish(queue, ret_evt)
    }

    fn marker(&self, queue: &CudaStream, events: &[CudaEvent]) -> BackendResult<CudaEvent> {
        queue.wait_events(events)?;
        queue.record()
    }

    fn alloc_staging(&self, nbytes: usize) -> BackendResult<CudaStaging> {
        Ok(CudaStaging {
            device: self.driver.alloc_zeroed(nbytes)?,
            host: self.driver.alloc_pinned(nbytes)?,
            pending: Mutex::new(None),
        })
    }

    fn download_staging(
        &self,
        queue: &CudaStream,
        staging: &CudaStaging,
        wait_for: &[CudaEvent],
        ret_evt: bool,
    ) -> BackendResult<Option<CudaEvent>> {
        queue.wait_events(wait_for)?;
        self.driver
            .download_async(queue, &staging.host, staging.device.device_ptr())?;
        let event = queue.record()?;
        *staging.pending.lock().expect("staging event poisoned") = Some(event.clone());
        Ok(ret_evt.then_some(event))
    }

    fn create_queue(&self) -> BackendResult<CudaStream> {
        self.driver.create_stream()
    }

    fn synchronize(&self, queue: &CudaStream) -> BackendResult<()> {
        queue.synchronize()
    }

    fn read_matrix(&self, matrix: &Matrix) -> BackendResult<Vec<u8>> {
        self.driver.download(matrix.addr(), matrix.nbytes())
    }

    fn write_matrix(&self, matrix: &Matrix, bytes: &[u8]) -> BackendResult<()> {
        if bytes.len() != matrix.nbytes() {
            return Err(BackendError::execution(format!(
                "write of {} bytes into a {}-byte matrix",
                bytes.len(),
                matrix.nbytes()
            )));
        }
        self.driver.upload(matrix.addr(), bytes)
    }
}
