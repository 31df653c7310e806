use std::ffi::{c_void, CString};
use std::fmt;
use std::sync::{Arc, OnceLock};

use flux_rs::error::{BackendError, BackendResult};
use libloading::Library;

type CUresult = i32;
type CUdevice = i32;
type CUcontext = *mut c_void;
type CUdeviceptr = u64;
type CUmodule = *mut c_void;
type CUfunction = *mut c_void;
type CUstream = *mut c_void;
type CUevent = *mut c_void;

const CUDA_SUCCESS: CUresult = 0;
const CU_STREAM_NON_BLOCKING: u32 = 0x1;
const CU_EVENT_DISABLE_TIMING: u32 = 0x2;
const CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MAJOR: i32 = 75;
const CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MINOR: i32 = 76;

type CuInitFn = unsafe extern "C" fn(flags: u32) -> CUresult;
type CuDeviceGetFn = unsafe extern "C" fn(device: *mut CUdevice, ordinal: i32) -> CUresult;
type CuDeviceGetAttributeFn =
    unsafe extern "C" fn(value: *mut i32, attrib: i32, dev: CUdevice) -> CUresult;
type CuCtxCreateV2Fn =
    unsafe extern "C" fn(ctx: *mut CUcontext, flags: u32, dev: CUdevice) -> CUresult;
type CuCtxDestroyV2Fn = unsafe extern "C" fn(ctx: CUcontext) -> CUresult;
type CuCtxSetCurrentFn = unsafe extern "C" fn(ctx: CUcontext) -> CUresult;
type CuMemAllocV2Fn = unsafe extern "C" fn(dptr: *mut CUdeviceptr, bytesize: usize) -> CUresult;
type CuMemFreeV2Fn = unsafe extern "C" fn(dptr: CUdeviceptr) -> CUresult;
type CuMemAllocHostV2Fn = unsafe extern "C" fn(pp: *mut *mut c_void, bytesize: usize) -> CUresult;
type CuMemFreeHostFn = unsafe extern "C" fn(p: *mut c_void) -> CUresult;
type CuMemcpyHtoDV2Fn = unsafe extern "C" fn(
    dst_device: CUdeviceptr,
    src_host: *const c_void,
    byte_count: usize,
) -> CUresult;
type CuMemcpyDtoHV2Fn = unsafe extern "C" fn(
    dst_host: *mut c_void,
    src_device: CUdeviceptr,
    byte_count: usize,
) -> CUresult;
type CuMemcpyDtoDAsyncV2Fn = unsafe extern "C" fn(
    dst_device: CUdeviceptr,
    src_device: CUdeviceptr,
    byte_count: usize,
    stream: CUstream,
) -> CUresult;
type CuMemcpyDtoHAsyncV2Fn = unsafe extern "C" fn(
    dst_host: *mut c_void,
    src_device: CUdeviceptr,
    byte_count: usize,
    stream: CUstream,
) -> CUresult;
type CuMemsetD8V2Fn =
    unsafe extern "C" fn(dst_device: CUdeviceptr, value: u8, count: usize) -> CUresult;
type CuModuleLoadDataExFn = unsafe extern "C" fn(
    module: *mut CUmodule,
    image: *const c_void,
    num_options: u32,
    options: *mut u32,
    option_values: *mut *mut c_void,
) -> CUresult;
type CuModuleUnloadFn = unsafe extern "C" fn(module: CUmodule) -> CUresult;
type CuModuleGetFunctionFn =
    unsafe extern "C" fn(hfunc: *mut CUfunction, hmod: CUmodule, name: *const i8) -> CUresult;
type CuLaunchKernelFn = unsafe extern "C" fn(
    f: CUfunction,
    grid_dim_x: u32,
    grid_dim_y: u32,
    grid_dim_z: u32,
    block_dim_x: u32,
    block_dim_y: u32,
    block_dim_z: u32,
    shared_mem_bytes: u32,
    h_stream: CUstream,
    kernel_params: *mut *mut c_void,
    extra: *mut *mut c_void,
) -> CUresult;
type CuStreamCreateFn = unsafe extern "C" fn(stream: *mut CUstream, flags: u32) -> CUresult;
type CuStreamDestroyV2Fn = unsafe extern "C" fn(stream: CUstream) -> CUresult;
type CuStreamSynchronizeFn = unsafe extern "C" fn(stream: CUstream) -> CUresult;
type CuStreamWaitEventFn =
    unsafe extern "C" fn(stream: CUstream, event: CUevent, flags: u32) -> CUresult;
type CuEventCreateFn = unsafe extern "C" fn(event: *mut CUevent, flags: u32) -> CUresult;
type CuEventDestroyV2Fn = unsafe extern "C" fn(event: CUevent) -> CUresult;
type CuEventRecordFn = unsafe extern "C" fn(event: CUevent, stream: CUstream) -> CUresult;
type CuEventSynchronizeFn = unsafe extern "C" fn(event: CUevent) -> CUresult;

struct DriverFns {
    cu_init: CuInitFn,
    cu_device_get: CuDeviceGetFn,
    cu_device_get_attribute: CuDeviceGetAttributeFn,
    cu_ctx_create_v2: CuCtxCreateV2Fn,
    cu_ctx_destroy_v2: CuCtxDestroyV2Fn,
    cu_ctx_set_current: CuCtxSetCurrentFn,
    cu_mem_alloc_v2: CuMemAllocV2Fn,
    cu_mem_free_v2: CuMemFreeV2Fn,
    cu_mem_alloc_host_v2: CuMemAllocHostV2Fn,
    cu_mem_free_host: CuMemFreeHostFn,
    cu_memcpy_hto_d_v2: CuMemcpyHtoDV2Fn,
    cu_memcpy_dto_h_v2: CuMemcpyDtoHV2Fn,
    cu_memcpy_dto_d_async_v2: CuMemcpyDtoDAsyncV2Fn,
    cu_memcpy_dto_h_async_v2: CuMemcpyDtoHAsyncV2Fn,
    cu_memset_d8_v2: CuMemsetD8V2Fn,
    cu_module_load_data_ex: CuModuleLoadDataExFn,
    cu_module_unload: CuModuleUnloadFn,
    cu_module_get_function: CuModuleGetFunctionFn,
    cu_launch_kernel: CuLaunchKernelFn,
    cu_stream_create: CuStreamCreateFn,
    cu_stream_destroy_v2: CuStreamDestroyV2Fn,
    cu_stream_synchronize: CuStreamSynchronizeFn,
    cu_stream_wait_event: CuStreamWaitEventFn,
    cu_event_create: CuEventCreateFn,
    cu_event_destroy_v2: CuEventDestroyV2Fn,
    cu_event_record: CuEventRecordFn,
    cu_event_synchronize: CuEventSynchronizeFn,
}

pub struct CudaDriver {
    _lib: Library,
    fns: DriverFns,
    // Handles are stored as usize so driver objects can cross threads.
    ctx: usize,
    compute_capability: (i32, i32),
}

impl Drop for CudaDriver {
    fn drop(&mut self) {
        if self.ctx != 0 {
            // SAFETY: Context is owned by this driver instance and destroyed once on drop.
            let _ = unsafe { (self.fns.cu_ctx_destroy_v2)(self.ctx_ptr()) };
            self.ctx = 0;
        }
    }
}

/// Device allocation freed on drop.
pub struct DeviceBuffer {
    driver: Arc<CudaDriver>,
    ptr: CUdeviceptr,
    bytes: usize,
}

impl fmt::Debug for DeviceBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("ptr", &self.ptr)
            .field("bytes", &self.bytes)
            .finish()
    }
}

impl DeviceBuffer {
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    pub fn device_ptr(&self) -> u64 {
        self.ptr
    }

    pub fn read_to_vec(&self) -> BackendResult<Vec<u8>> {
        self.driver.download(self.ptr, self.bytes)
    }
}

impl Drop for DeviceBuffer {
    fn drop(&mut self) {
        // SAFETY: Device pointer was allocated by this driver and is released once on drop.
        let _ = unsafe { (self.driver.fns.cu_mem_free_v2)(self.ptr) };
    }
}

/// Page-locked host allocation, the target of asynchronous downloads.
pub struct PinnedBuffer {
    driver: Arc<CudaDriver>,
    ptr: usize,
    bytes: usize,
}

impl PinnedBuffer {
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    fn host_ptr(&self) -> *mut c_void {
        self.ptr as *mut c_void
    }

    pub fn to_vec(&self) -> Vec<u8> {
        if self.bytes == 0 {
            return Vec::new();
        }
        // SAFETY: The allocation holds `bytes` bytes and lives as long as `self`.
        unsafe { std::slice::from_raw_parts(self.ptr as *const u8, self.bytes) }.to_vec()
    }
}

impl Drop for PinnedBuffer {
    fn drop(&mut self) {
        if self.ptr != 0 {
            // SAFETY: Pointer came from cuMemAllocHost_v2 on this driver and is freed once.
            let _ = unsafe { (self.driver.fns.cu_mem_free_host)(self.host_ptr()) };
        }
    }
}

pub struct CudaStream {
    driver: Arc<CudaDriver>,
    stream: usize,
}

impl CudaStream {
    fn stream_ptr(&self) -> CUstream {
        self.stream as CUstream
    }

    /// Makes later work on this stream wait for `event`.
    pub fn wait_event(&self, event: &CudaEvent) -> BackendResult<()> {
        // SAFETY: Stream and event were created by the same driver context.
        unsafe {
            check_cuda(
                (self.driver.fns.cu_stream_wait_event)(self.stream_ptr(), event.event_ptr(), 0),
                "cuStreamWaitEvent",
            )
        }
    }

    pub fn wait_events(&self, events: &[CudaEvent]) -> BackendResult<()> {
        for event in events {
            self.wait_event(event)?;
        }
        Ok(())
    }

    /// Records a fresh event at the current tail of the stream.
    pub fn record(&self) -> BackendResult<CudaEvent> {
        let event = self.driver.create_event()?;
        // SAFETY: Event and stream belong to the current context.
        unsafe {
            check_cuda(
                (self.driver.fns.cu_event_record)(event.event_ptr(), self.stream_ptr()),
                "cuEventRecord",
            )?;
        }
        Ok(event)
    }

    pub fn synchronize(&self) -> BackendResult<()> {
        self.driver.ensure_current()?;
        // SAFETY: Stream handle is valid until drop.
        unsafe {
            check_cuda(
                (self.driver.fns.cu_stream_synchronize)(self.stream_ptr()),
                "cuStreamSynchronize",
            )
        }
    }
}

impl Drop for CudaStream {
    fn drop(&mut self) {
        // SAFETY: Stream is owned by this wrapper and destroyed once.
        let _ = unsafe { (self.driver.fns.cu_stream_destroy_v2)(self.stream_ptr()) };
    }
}

struct EventHandle {
    driver: Arc<CudaDriver>,
    event: usize,
}

impl Drop for EventHandle {
    fn drop(&mut self) {
        // SAFETY: Event is destroyed once, after the last clone is dropped.
        let _ = unsafe { (self.driver.fns.cu_event_destroy_v2)(self.event as CUevent) };
    }
}

/// Shared handle to a recorded CUDA event.
#[derive(Clone)]
pub struct CudaEvent {
    inner: Arc<EventHandle>,
}

impl fmt::Debug for CudaEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CudaEvent").field(&self.inner.event).finish()
    }
}

impl CudaEvent {
    fn event_ptr(&self) -> CUevent {
        self.inner.event as CUevent
    }

    pub fn synchronize(&self) -> BackendResult<()> {
        // SAFETY: Event handle is live while any clone exists.
        unsafe {
            check_cuda(
                (self.inner.driver.fns.cu_event_synchronize)(self.event_ptr()),
                "cuEventSynchronize",
            )
        }
    }
}

pub struct CudaModule {
    driver: Arc<CudaDriver>,
    module: usize,
}

impl Drop for CudaModule {
    fn drop(&mut self) {
        if self.module != 0 {
            // SAFETY: Module belongs to this driver and is unloaded once.
            let _ = unsafe { (self.driver.fns.cu_module_unload)(self.module_ptr()) };
            self.module = 0;
        }
    }
}

impl CudaModule {
    fn module_ptr(&self) -> CUmodule {
        self.module as CUmodule
    }
}

/// A kernel entry point; keeps its module loaded.
pub struct CudaFunction {
    _module: Arc<CudaModule>,
    name: String,
    func: usize,
}

impl CudaFunction {
    pub fn name(&self) -> &str {
        &self.name
    }

    fn func_ptr(&self) -> CUfunction {
        self.func as CUfunction
    }
}

static CUDA_DRIVER: OnceLock<Result<Arc<CudaDriver>, String>> = OnceLock::new();

pub fn is_available() -> bool {
    driver().is_ok()
}

pub fn driver() -> BackendResult<Arc<CudaDriver>> {
    let init = CUDA_DRIVER.get_or_init(|| match CudaDriver::new() {
        Ok(driver) => Ok(Arc::new(driver)),
        Err(err) => Err(err.to_string()),
    });
    match init {
        Ok(driver) => Ok(Arc::clone(driver)),
        Err(msg) => Err(BackendError::execution(format!(
            "CUDA driver unavailable: {msg}"
        ))),
    }
}

impl CudaDriver {
    fn new() -> BackendResult<Self> {
        let lib = load_cuda_library()?;
        let fns = DriverFns {
            cu_init: load_symbol(&lib, b"cuInit\0")?,
            cu_device_get: load_symbol(&lib, b"cuDeviceGet\0")?,
            cu_device_get_attribute: load_symbol(&lib, b"cuDeviceGetAttribute\0")?,
            cu_ctx_create_v2: load_symbol(&lib, b"cuCtxCreate_v2\0")?,
            cu_ctx_destroy_v2: load_symbol(&lib, b"cuCtxDestroy_v2\0")?,
            cu_ctx_set_current: load_symbol(&lib, b"cuCtxSetCurrent\0")?,
            cu_mem_alloc_v2: load_symbol(&lib, b"cuMemAlloc_v2\0")?,
            cu_mem_free_v2: load_symbol(&lib, b"cuMemFree_v2\0")?,
            cu_mem_alloc_host_v2: load_symbol(&lib, b"cuMemAllocHost_v2\0")?,
            cu_mem_free_host: load_symbol(&lib, b"cuMemFreeHost\0")?,
            cu_memcpy_hto_d_v2: load_symbol(&lib, b"cuMemcpyHtoD_v2\0")?,
            cu_memcpy_dto_h_v2: load_symbol(&lib, b"cuMemcpyDtoH_v2\0")?,
            cu_memcpy_dto_d_async_v2: load_symbol(&lib, b"cuMemcpyDtoDAsync_v2\0")?,
            cu_memcpy_dto_h_async_v2: load_symbol(&lib, b"cuMemcpyDtoHAsync_v2\0")?,
            cu_memset_d8_v2: load_symbol(&lib, b"cuMemsetD8_v2\0")?,
            cu_module_load_data_ex: load_symbol(&lib, b"cuModuleLoadDataEx\0")?,
            cu_module_unload: load_symbol(&lib, b"cuModuleUnload\0")?,
            cu_module_get_function: load_symbol(&lib, b"cuModuleGetFunction\0")?,
            cu_launch_kernel: load_symbol(&lib, b"cuLaunchKernel\0")?,
            cu_stream_create: load_symbol(&lib, b"cuStreamCreate\0")?,
            cu_stream_destroy_v2: load_symbol(&lib, b"cuStreamDestroy_v2\0")?,
            cu_stream_synchronize: load_symbol(&lib, b"cuStreamSynchronize\0")?,
            cu_stream_wait_event: load_symbol(&lib, b"cuStreamWaitEvent\0")?,
            cu_event_create: load_symbol(&lib, b"cuEventCreate\0")?,
            cu_event_destroy_v2: load_symbol(&lib, b"cuEventDestroy_v2\0")?,
            cu_event_record: load_symbol(&lib, b"cuEventRecord\0")?,
            cu_event_synchronize: load_symbol(&lib, b"cuEventSynchronize\0")?,
        };

        // SAFETY: Calls are made with valid pointers and follow CUDA driver API contract.
        unsafe {
            check_cuda((fns.cu_init)(0), "cuInit")?;
            let mut dev: CUdevice = 0;
            check_cuda(
                (fns.cu_device_get)(&mut dev as *mut CUdevice, 0),
                "cuDeviceGet",
            )?;
            let (mut major, mut minor) = (0i32, 0i32);
            check_cuda(
                (fns.cu_device_get_attribute)(
                    &mut major,
                    CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MAJOR,
                    dev,
                ),
                "cuDeviceGetAttribute",
            )?;
            check_cuda(
                (fns.cu_device_get_attribute)(
                    &mut minor,
                    CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MINOR,
                    dev,
                ),
                "cuDeviceGetAttribute",
            )?;
            let mut ctx: CUcontext = std::ptr::null_mut();
            check_cuda(
                (fns.cu_ctx_create_v2)(&mut ctx as *mut CUcontext, 0, dev),
                "cuCtxCreate_v2",
            )?;
            check_cuda((fns.cu_ctx_set_current)(ctx), "cuCtxSetCurrent")?;
            Ok(Self {
                _lib: lib,
                fns,
                ctx: ctx as usize,
                compute_capability: (major, minor),
            })
        }
    }

    pub fn compute_capability(&self) -> (i32, i32) {
        self.compute_capability
    }

    pub fn alloc_and_upload(self: &Arc<Self>, bytes: &[u8]) -> BackendResult<Arc<DeviceBuffer>> {
        let buffer = self.alloc(bytes.len())?;
        self.upload(buffer.ptr, bytes)?;
        Ok(buffer)
    }

    pub fn alloc_zeroed(self: &Arc<Self>, bytes: usize) -> BackendResult<Arc<DeviceBuffer>> {
        let buffer = self.alloc(bytes)?;
        if bytes != 0 {
            self.ensure_current()?;
            // SAFETY: Destination is a valid allocated device pointer; memset count is bounded by allocation size.
            unsafe {
                check_cuda(
                    (self.fns.cu_memset_d8_v2)(buffer.ptr, 0, bytes),
                    "cuMemsetD8_v2",
                )?;
            }
        }
        Ok(buffer)
    }

    pub fn alloc_pinned(self: &Arc<Self>, bytes: usize) -> BackendResult<PinnedBuffer> {
        self.ensure_current()?;
        let mut ptr: *mut c_void = std::ptr::null_mut();
        if bytes != 0 {
            // SAFETY: `ptr` is a valid out pointer for the pinned allocation.
            unsafe {
                check_cuda(
                    (self.fns.cu_mem_alloc_host_v2)(&mut ptr, bytes),
                    "cuMemAllocHost_v2",
                )?;
            }
        }
        Ok(PinnedBuffer {
            driver: Arc::clone(self),
            ptr: ptr as usize,
            bytes,
        })
    }

    /// Blocking host-to-device copy into `ptr`.
    pub fn upload(&self, ptr: CUdeviceptr, bytes: &[u8]) -> BackendResult<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        self.ensure_current()?;
        // SAFETY: Destination is a device allocation of at least `bytes.len()` bytes.
        unsafe {
            check_cuda(
                (self.fns.cu_memcpy_hto_d_v2)(ptr, bytes.as_ptr() as *const c_void, bytes.len()),
                "cuMemcpyHtoD_v2",
            )
        }
    }

    /// Blocking device-to-host copy out of `ptr`.
    pub fn download(&self, ptr: CUdeviceptr, bytes: usize) -> BackendResult<Vec<u8>> {
        self.ensure_current()?;
        let mut out = vec![0u8; bytes];
        if bytes != 0 {
            // SAFETY: Source device pointer is valid for `bytes`; destination host buffer is valid and writable.
            unsafe {
                check_cuda(
                    (self.fns.cu_memcpy_dto_h_v2)(out.as_mut_ptr() as *mut c_void, ptr, bytes),
                    "cuMemcpyDtoH_v2",
                )?;
            }
        }
        Ok(out)
    }

    pub fn copy_async(
        &self,
        stream: &CudaStream,
        dst: CUdeviceptr,
        src: CUdeviceptr,
        bytes: usize,
    ) -> BackendResult<()> {
        if bytes == 0 {
            return Ok(());
        }
        self.ensure_current()?;
        // SAFETY: src/dst pointers are valid CUDA allocations and byte range is provided by caller.
        unsafe {
            check_cuda(
                (self.fns.cu_memcpy_dto_d_async_v2)(dst, src, bytes, stream.stream_ptr()),
                "cuMemcpyDtoDAsync_v2",
            )
        }
    }

    pub(crate) fn download_async(
        &self,
        stream: &CudaStream,
        dst: &PinnedBuffer,
        src: CUdeviceptr,
    ) -> BackendResult<()> {
        if dst.bytes == 0 {
            return Ok(());
        }
        self.ensure_current()?;
        // SAFETY: Destination is pinned memory of `dst.bytes` bytes that outlives the copy.
        unsafe {
            check_cuda(
                (self.fns.cu_memcpy_dto_h_async_v2)(
                    dst.host_ptr(),
                    src,
                    dst.bytes,
                    stream.stream_ptr(),
                ),
                "cuMemcpyDtoHAsync_v2",
            )
        }
    }

    fn alloc(self: &Arc<Self>, bytes: usize) -> BackendResult<Arc<DeviceBuffer>> {
        self.ensure_current()?;
        let mut ptr: CUdeviceptr = 0;
        // SAFETY: `ptr` is a valid out pointer for CUDA allocation.
        unsafe {
            check_cuda(
                (self.fns.cu_mem_alloc_v2)(&mut ptr as *mut CUdeviceptr, bytes.max(1)),
                "cuMemAlloc_v2",
            )?;
        }
        Ok(Arc::new(DeviceBuffer {
            driver: Arc::clone(self),
            ptr,
            bytes,
        }))
    }

    pub fn create_stream(self: &Arc<Self>) -> BackendResult<CudaStream> {
        self.ensure_current()?;
        let mut stream: CUstream = std::ptr::null_mut();
        // SAFETY: `stream` is a valid out pointer.
        unsafe {
            check_cuda(
                (self.fns.cu_stream_create)(&mut stream, CU_STREAM_NON_BLOCKING),
                "cuStreamCreate",
            )?;
        }
        Ok(CudaStream {
            driver: Arc::clone(self),
            stream: stream as usize,
        })
    }

    fn create_event(self: &Arc<Self>) -> BackendResult<CudaEvent> {
        self.ensure_current()?;
        let mut event: CUevent = std::ptr::null_mut();
        // SAFETY: `event` is a valid out pointer.
        unsafe {
            check_cuda(
                (self.fns.cu_event_create)(&mut event, CU_EVENT_DISABLE_TIMING),
                "cuEventCreate",
            )?;
        }
        Ok(CudaEvent {
            inner: Arc::new(EventHandle {
                driver: Arc::clone(self),
                event: event as usize,
            }),
        })
    }

    pub fn load_ptx_module(self: &Arc<Self>, ptx: &str) -> BackendResult<CudaModule> {
        self.ensure_current()?;
        let c_ptx = CString::new(ptx)
            .map_err(|_| BackendError::execution("ptx source contains NUL byte"))?;
        let mut module: CUmodule = std::ptr::null_mut();
        // SAFETY: pointer arguments are valid for cuModuleLoadDataEx.
        unsafe {
            check_cuda(
                (self.fns.cu_module_load_data_ex)(
                    &mut module as *mut CUmodule,
                    c_ptx.as_ptr() as *const c_void,
                    0,
                    std::ptr::null_mut(),
                    std::ptr::null_mut(),
                ),
                "cuModuleLoadDataEx",
            )?;
        }
        Ok(CudaModule {
            driver: Arc::clone(self),
            module: module as usize,
        })
    }

    pub fn get_function(
        &self,
        module: &Arc<CudaModule>,
        symbol: &str,
    ) -> BackendResult<CudaFunction> {
        self.ensure_current()?;
        let c_symbol = CString::new(symbol)
            .map_err(|_| BackendError::execution("kernel symbol contains NUL byte"))?;
        let mut function: CUfunction = std::ptr::null_mut();
        // SAFETY: module and output pointers are valid.
        unsafe {
            check_cuda(
                (self.fns.cu_module_get_function)(
                    &mut function as *mut CUfunction,
                    module.module_ptr(),
                    c_symbol.as_ptr(),
                ),
                "cuModuleGetFunction",
            )?;
        }

        Ok(CudaFunction {
            _module: Arc::clone(module),
            name: symbol.to_string(),
            func: function as usize,
        })
    }

    pub fn launch_kernel(
        &self,
        stream: &CudaStream,
        function: &CudaFunction,
        grid: (u32, u32, u32),
        block: (u32, u32, u32),
        params: &mut [*mut c_void],
    ) -> BackendResult<()> {
        self.ensure_current()?;
        // SAFETY: function and parameter pointers are valid for kernel launch.
        unsafe {
            check_cuda(
                (self.fns.cu_launch_kernel)(
                    function.func_ptr(),
                    grid.0,
                    grid.1,
                    grid.2,
                    block.0,
                    block.1,
                    block.2,
                    0,
                    stream.stream_ptr(),
                    params.as_mut_ptr(),
                    std::ptr::null_mut(),
                ),
                "cuLaunchKernel",
            )
        }
    }

    pub fn ensure_current(&self) -> BackendResult<()> {
        // SAFETY: Context was created by this driver and remains valid until drop.
        unsafe {
            check_cuda(
                (self.fns.cu_ctx_set_current)(self.ctx_ptr()),
                "cuCtxSetCurrent",
            )
        }
    }

    fn ctx_ptr(&self) -> CUcontext {
        self.ctx as CUcontext
    }
}

fn load_cuda_library() -> BackendResult<Library> {
    let candidates = ["libcuda.so.1", "libcuda.so", "nvcuda.dll", "libcuda.dylib"];

    for candidate in candidates {
        // SAFETY: Availability check only; no symbols are invoked at this stage.
        if let Ok(lib) = unsafe { Library::new(candidate) } {
            return Ok(lib);
        }
    }

    Err(BackendError::execution(
        "failed to load CUDA driver library (tried libcuda.so.1, libcuda.so, nvcuda.dll, libcuda.dylib)",
    ))
}

pub(crate) fn load_symbol<T: Copy>(lib: &Library, name: &'static [u8]) -> BackendResult<T> {
    // SAFETY: Caller provides expected symbol type from the loaded library's API.
    let sym = unsafe { lib.get::<T>(name) }.map_err(|err| {
        BackendError::execution(format!(
            "failed to resolve symbol {}: {err}",
            String::from_utf8_lossy(name)
        ))
    })?;
    Ok(*sym)
}

fn check_cuda(code: CUresult, op: &str) -> BackendResult<()> {
    if code == CUDA_SUCCESS {
        Ok(())
    } else {
        Err(BackendError::execution(format!(
            "CUDA driver call {op} failed with code {code}"
        )))
    }
}
