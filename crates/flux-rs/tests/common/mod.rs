#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use flux_rs::backend::{Backend, StagingBuffer};
use flux_rs::blasext::BlasTemplate;
use flux_rs::config::RuntimeConfig;
use flux_rs::error::{BackendError, BackendResult};
use flux_rs::generator::PointwiseSpec;
use flux_rs::kernel::{ArgType, KernelArgs, LaunchConfig};
use flux_rs::matrix::Matrix;
use flux_rs::provider::ProgramCache;

/// One call the recording backend received.
#[derive(Debug, Clone, PartialEq)]
pub struct Submission {
    pub label: String,
    pub waited_on: Vec<u64>,
    pub event: Option<u64>,
    pub args: Option<KernelArgs>,
}

pub struct RecordingStaging {
    addr: u64,
    nbytes: usize,
}

impl StagingBuffer for RecordingStaging {
    fn device_addr(&self) -> u64 {
        self.addr
    }

    fn nbytes(&self) -> usize {
        self.nbytes
    }

    fn read_host(&self) -> BackendResult<Vec<u8>> {
        Ok(vec![0; self.nbytes])
    }
}

/// Test-only backend that records submissions instead of executing them.
/// Matrix storage is a map from address to bytes.
pub struct RecordingBackend {
    config: RuntimeConfig,
    programs: ProgramCache<String>,
    submissions: Mutex<Vec<Submission>>,
    memory: Mutex<HashMap<u64, Vec<u8>>>,
    next_event: AtomicU64,
    staging_allocs: AtomicUsize,
    queues: AtomicUsize,
}

impl Default for RecordingBackend {
    fn default() -> Self {
        Self {
            config: RuntimeConfig::default(),
            programs: ProgramCache::new(),
            submissions: Mutex::new(Vec::new()),
            memory: Mutex::new(HashMap::new()),
            next_event: AtomicU64::new(1),
            staging_allocs: AtomicUsize::new(0),
            queues: AtomicUsize::new(0),
        }
    }
}

impl RecordingBackend {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn submissions(&self) -> Vec<Submission> {
        self.submissions
            .lock()
            .expect("backend mutex poisoned")
            .clone()
    }

    pub fn clear(&self) {
        self.submissions.lock().expect("backend mutex poisoned").clear();
    }

    pub fn builds(&self) -> usize {
        self.programs.builds()
    }

    pub fn staging_allocs(&self) -> usize {
        self.staging_allocs.load(Ordering::Relaxed)
    }

    pub fn queues_created(&self) -> usize {
        self.queues.load(Ordering::Relaxed)
    }

    pub fn store(&self, addr: u64, bytes: Vec<u8>) {
        self.memory
            .lock()
            .expect("backend mutex poisoned")
            .insert(addr, bytes);
    }

    pub fn load(&self, addr: u64) -> Option<Vec<u8>> {
        self.memory
            .lock()
            .expect("backend mutex poisoned")
            .get(&addr)
            .cloned()
    }

    pub fn record(
        &self,
        label: impl Into<String>,
        wait_for: &[u64],
        ret_evt: bool,
        args: Option<KernelArgs>,
    ) -> Option<u64> {
        let event = ret_evt.then(|| self.next_event.fetch_add(1, Ordering::Relaxed));
        self.submissions
            .lock()
            .expect("backend mutex poisoned")
            .push(Submission {
                label: label.into(),
                waited_on: wait_for.to_vec(),
                event,
                args,
            });
        event
    }
}

impl Backend for RecordingBackend {
    type Queue = ();
    type Event = u64;
    type Function = String;
    type Staging = RecordingStaging;

    fn name(&self) -> &'static str {
        "recording"
    }

    fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    fn generate(&self, spec: &PointwiseSpec) -> String {
        format!("{}:{}", spec.name, spec.body)
    }

    fn blas_source(&self, template: &BlasTemplate) -> String {
        format!("{template:?}")
    }

    fn build(
        &self,
        name: &str,
        source: &str,
        _arg_types: &[ArgType],
    ) -> BackendResult<Arc<String>> {
        self.programs
            .get_or_build(source, "", || Ok(name.to_string()))
    }

    fn launch_config(&self, dims: &[usize]) -> LaunchConfig {
        LaunchConfig::for_block((64, 1, 1), dims[dims.len() - 1], 1)
    }

    fn launch(
        &self,
        _queue: &(),
        function: &String,
        _launch: &LaunchConfig,
        args: &KernelArgs,
        wait_for: &[u64],
        ret_evt: bool,
    ) -> BackendResult<Option<u64>> {
        Ok(self.record(function.clone(), wait_for, ret_evt, Some(args.clone())))
    }

    fn copy_async(
        &self,
        _queue: &(),
        dst: u64,
        src: u64,
        nbytes: usize,
        wait_for: &[u64],
        ret_evt: bool,
    ) -> BackendResult<Option<u64>> {
        let bytes = self
            .load(src)
            .ok_or_else(|| BackendError::execution(format!("no storage at {src:#x}")))?;
        self.store(dst, bytes[..nbytes].to_vec());
        Ok(self.record("copy", wait_for, ret_evt, None))
    }

    fn marker(&self, _queue: &(), events: &[u64]) -> BackendResult<u64> {
        self.record("marker", events, true, None)
            .ok_or_else(|| BackendError::execution("marker without event"))
    }

    fn alloc_staging(&self, nbytes: usize) -> BackendResult<RecordingStaging> {
        let index = self.staging_allocs.fetch_add(1, Ordering::Relaxed) as u64;
        Ok(RecordingStaging {
            addr: 0xf000_0000 + index * 0x1000,
            nbytes,
        })
    }

    fn download_staging(
        &self,
        _queue: &(),
        _staging: &RecordingStaging,
        wait_for: &[u64],
        ret_evt: bool,
    ) -> BackendResult<Option<u64>> {
        Ok(self.record("download", wait_for, ret_evt, None))
    }

    fn create_queue(&self) -> BackendResult<()> {
        self.queues.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn synchronize(&self, _queue: &()) -> BackendResult<()> {
        Ok(())
    }

    fn read_matrix(&self, matrix: &Matrix) -> BackendResult<Vec<u8>> {
        self.load(matrix.addr())
            .ok_or_else(|| BackendError::execution(format!("no storage at {:#x}", matrix.addr())))
    }

    fn write_matrix(&self, matrix: &Matrix, bytes: &[u8]) -> BackendResult<()> {
        self.store(matrix.addr(), bytes.to_vec());
        Ok(())
    }
}
