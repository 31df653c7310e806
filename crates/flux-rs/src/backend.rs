use std::sync::Arc;

use crate::blasext::BlasTemplate;
use crate::config::RuntimeConfig;
use crate::error::BackendResult;
use crate::generator::PointwiseSpec;
use crate::kernel::{ArgType, KernelArgs, LaunchConfig};
use crate::matrix::Matrix;

/// Device-resident scratch space paired with a host mirror.
pub trait StagingBuffer {
    fn device_addr(&self) -> u64;

    fn nbytes(&self) -> usize;

    /// Copies the host mirror. Only meaningful after the download that
    /// fills it has completed.
    fn read_host(&self) -> BackendResult<Vec<u8>>;
}

/// Capabilities every execution backend provides.
///
/// Generic runtime code (pointwise kernels, BLAS-extension operators,
/// composites) is written once against this trait and never branches on
/// the concrete backend.
pub trait Backend: Send + Sync + Sized + 'static {
    type Queue;
    type Event: Clone + Send + Sync;
    type Function: Send + Sync;
    type Staging: StagingBuffer + Send + Sync;

    fn name(&self) -> &'static str;

    fn config(&self) -> &RuntimeConfig;

    /// Renders dialect source for a pointwise kernel.
    fn generate(&self, spec: &PointwiseSpec) -> String;

    /// Renders dialect source for a canned BLAS-extension kernel.
    fn blas_source(&self, template: &BlasTemplate) -> String;

    /// Compiles `source` (memoised on source text and compile flags) and
    /// returns the entry point `name`.
    fn build(
        &self,
        name: &str,
        source: &str,
        arg_types: &[ArgType],
    ) -> BackendResult<Arc<Self::Function>>;

    /// Launch geometry for a pointwise kernel over `dims`, primary axis
    /// last.
    fn launch_config(&self, dims: &[usize]) -> LaunchConfig;

    fn launch(
        &self,
        queue: &Self::Queue,
        function: &Self::Function,
        launch: &LaunchConfig,
        args: &KernelArgs,
        wait_for: &[Self::Event],
        ret_evt: bool,
    ) -> BackendResult<Option<Self::Event>>;

    fn copy_async(
        &self,
        queue: &Self::Queue,
        dst: u64,
        src: u64,
        nbytes: usize,
        wait_for: &[Self::Event],
        ret_evt: bool,
    ) -> BackendResult<Option<Self::Event>>;

    /// An event that completes once every event in `events` has.
    fn marker(&self, queue: &Self::Queue, events: &[Self::Event]) -> BackendResult<Self::Event>;

    fn alloc_staging(&self, nbytes: usize) -> BackendResult<Self::Staging>;

    /// Enqueues the device-to-host copy of `staging`.
    fn download_staging(
        &self,
        queue: &Self::Queue,
        staging: &Self::Staging,
        wait_for: &[Self::Event],
        ret_evt: bool,
    ) -> BackendResult<Option<Self::Event>>;

    fn create_queue(&self) -> BackendResult<Self::Queue>;

    /// Blocks until all work enqueued on `queue` has completed.
    fn synchronize(&self, queue: &Self::Queue) -> BackendResult<()>;

    /// Blocking read of a matrix's storage.
    fn read_matrix(&self, matrix: &Matrix) -> BackendResult<Vec<u8>>;

    /// Blocking overwrite of a matrix's storage.
    fn write_matrix(&self, matrix: &Matrix, bytes: &[u8]) -> BackendResult<()>;
}
