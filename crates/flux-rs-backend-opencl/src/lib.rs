//! OpenCL execution backend.
//!
//! The ICD loader is opened at runtime. Matrices carry their `cl_mem`
//! handle as the address, queues are in-order command queues and the
//! matrix multiply goes through TinyTC recipes (see [`tinytc`]).

pub mod blas;
pub mod cl;
pub mod generator;
pub mod tinytc;

use std::sync::{Arc, Mutex};

use flux_rs::backend::{Backend, StagingBuffer};
use flux_rs::blasext::BlasTemplate;
use flux_rs::config::RuntimeConfig;
use flux_rs::env;
use flux_rs::error::{BackendError, BackendResult};
use flux_rs::gemm::RecipeMultiply;
use flux_rs::generator::PointwiseSpec;
use flux_rs::kernel::{ArgType, KernelArgs, LaunchConfig};
use flux_rs::matrix::{Matrix, MatrixTraits};
use flux_rs::profiling;
use flux_rs::provider::ProgramCache;
use smallvec::SmallVec;

pub use cl::{is_available, ClBuffer, ClEvent, ClKernel, ClQueue, ClRuntime, HostMirror};
pub use tinytc::TinyTc;

const DEFAULT_BUILD_FLAGS: &str = "-cl-fast-relaxed-math";
const POINTWISE_BLOCK_1D: (u32, u32, u32) = (64, 1, 1);
const POINTWISE_BLOCK_2D: (u32, u32, u32) = (64, 4, 1);

/// Reduction scratch: a device buffer of partials and the host mirror it is
/// read into. Dropping it waits for any download still writing the mirror.
pub struct ClStaging {
    device: ClBuffer,
    host: HostMirror,
    pending: Mutex<Option<ClEvent>>,
}

impl Drop for ClStaging {
    fn drop(&mut self) {
        let pending = self
            .pending
            .get_mut()
            .unwrap_or_else(|err| err.into_inner())
            .take();
        if let Some(event) = pending {
            let _ = event.wait();
        }
    }
}

impl StagingBuffer for ClStaging {
    fn device_addr(&self) -> u64 {
        self.device.handle()
    }

    fn nbytes(&self) -> usize {
        self.device.bytes()
    }

    fn read_host(&self) -> BackendResult<Vec<u8>> {
        Ok(self.host.to_vec())
    }
}

pub struct OpenClBackend {
    config: RuntimeConfig,
    cl: Arc<ClRuntime>,
    flags: String,
    programs: ProgramCache<cl::ClProgram>,
    io_queue: ClQueue,
}

impl OpenClBackend {
    pub fn new(config: RuntimeConfig) -> BackendResult<Self> {
        let cl = cl::runtime()?;
        let io_queue = cl.create_queue()?;
        let flags =
            env::var("FLUXRS_OPENCL_FLAGS").unwrap_or_else(|| DEFAULT_BUILD_FLAGS.to_string());
        Ok(Self {
            config,
            cl,
            flags,
            programs: ProgramCache::new(),
            io_queue,
        })
    }

    pub fn from_env() -> BackendResult<Self> {
        Self::new(RuntimeConfig::from_env())
    }

    pub fn shared(config: RuntimeConfig) -> BackendResult<Arc<Self>> {
        Self::new(config).map(Arc::new)
    }

    pub fn cl(&self) -> &Arc<ClRuntime> {
        &self.cl
    }

    pub fn programs_built(&self) -> usize {
        self.programs.builds()
    }

    /// Allocates a buffer for `traits` initialised from `bytes`.
    pub fn alloc_matrix(
        &self,
        traits: MatrixTraits,
        bytes: &[u8],
    ) -> BackendResult<(Arc<ClBuffer>, Matrix)> {
        if bytes.len() != traits.nbytes() {
            return Err(BackendError::execution(format!(
                "{} bytes supplied for a {}-byte matrix",
                bytes.len(),
                traits.nbytes()
            )));
        }
        let buffer = self.cl.alloc(bytes.len())?;
        self.io_queue.write_blocking(buffer.handle(), bytes)?;
        let matrix = Matrix::new(buffer.handle(), traits);
        Ok((Arc::new(buffer), matrix))
    }

    /// TinyTC-backed multiply bound to this backend.
    pub fn gemm(self: &Arc<Self>) -> BackendResult<RecipeMultiply<TinyTc>> {
        Ok(RecipeMultiply::new(TinyTc::new(Arc::clone(self))?))
    }
}

impl Backend for OpenClBackend {
    type Queue = ClQueue;
    type Event = ClEvent;
    type Function = ClKernel;
    type Staging = ClStaging;

    fn name(&self) -> &'static str {
        "opencl"
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
    ) -> BackendResult<Arc<ClKernel>> {
        let program = self.programs.get_or_build(source, &self.flags, || {
            let _scope = profiling::compile_scope("opencl.build_program");
            self.cl.build_program(source, &self.flags)
        })?;
        self.cl.create_kernel(&program, name).map(Arc::new)
    }

    fn launch_config(&self, dims: &[usize]) -> LaunchConfig {
        let nx = dims.last().copied().unwrap_or(0);
        let block = if dims.len() > 1 {
            POINTWISE_BLOCK_2D
        } else {
            POINTWISE_BLOCK_1D
        };
        LaunchConfig::for_block(block, nx, 1)
    }

    fn launch(
        &self,
        queue: &ClQueue,
        function: &ClKernel,
        launch: &LaunchConfig,
        args: &KernelArgs,
        wait_for: &[ClEvent],
        ret_evt: bool,
    ) -> BackendResult<Option<ClEvent>> {
        let values: SmallVec<[SmallVec<[u8; 8]>; 16]> =
            args.values().iter().map(|value| value.to_ne_bytes()).collect();
        let (gx, gy) = launch.global_size();
        let local = [launch.block.0 as usize, launch.block.1 as usize];
        queue.launch(function, &values, [gx, gy], local, wait_for, ret_evt)
    }

    fn copy_async(
        &self,
        queue: &ClQueue,
        dst: u64,
        src: u64,
        nbytes: usize,
        wait_for: &[ClEvent],
        ret_evt: bool,
    ) -> BackendResult<Option<ClEvent>> {
        queue.copy(dst, src, nbytes, wait_for, ret_evt)
    }

    fn marker(&self, queue: &ClQueue, events: &[ClEvent]) -> BackendResult<ClEvent> {
        queue.marker(events)
    }

    fn alloc_staging(&self, nbytes: usize) -> BackendResult<ClStaging> {
        Ok(ClStaging {
            device: self.cl.alloc(nbytes)?,
            host: HostMirror::zeroed(nbytes),
            pending: Mutex::new(None),
        })
    }

    fn download_staging(
        &self,
        queue: &ClQueue,
        staging: &ClStaging,
        wait_for: &[ClEvent],
        ret_evt: bool,
    ) -> BackendResult<Option<ClEvent>> {
        let event = queue.read_async(&staging.host, staging.device.handle(), wait_for, true)?;
        *staging.pending.lock().expect("staging event poisoned") = event.clone();
        Ok(if ret_evt { event } else { None })
    }

    fn create_queue(&self) -> BackendResult<ClQueue> {
        self.cl.create_queue()
    }

    fn synchronize(&self, queue: &ClQueue) -> BackendResult<()> {
        queue.finish()
    }

    fn read_matrix(&self, matrix: &Matrix) -> BackendResult<Vec<u8>> {
        self.io_queue.read_blocking(matrix.addr(), matrix.nbytes())
    }

    fn write_matrix(&self, matrix: &Matrix, bytes: &[u8]) -> BackendResult<()> {
        if bytes.len() != matrix.nbytes() {
            return Err(BackendError::execution(format!(
                "write of {} bytes into a {}-byte matrix",
                bytes.len(),
                matrix.nbytes()
            )));
        }
        self.io_queue.write_blocking(matrix.addr(), bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pointwise_launches_cover_rows_with_four_lanes() {
        let one = LaunchConfig::for_block(POINTWISE_BLOCK_1D, 100, 1);
        assert_eq!(one.global_size(), (128, 1));

        let two = LaunchConfig::for_block(POINTWISE_BLOCK_2D, 100, 1);
        assert_eq!(two.global_size(), (128, 4));
        assert_eq!(two.block, (64, 4, 1));
    }
}
