use std::ffi::{c_char, c_void, CString};
use std::fmt;
use std::sync::atomic::AtomicU8;
use std::sync::{Arc, Mutex, OnceLock};

use flux_rs::env;
use flux_rs::error::{BackendError, BackendResult};
use libloading::Library;
use smallvec::SmallVec;

type ClInt = i32;
type ClUint = u32;
type Handle = *mut c_void;

const CL_SUCCESS: ClInt = 0;
const CL_DEVICE_TYPE_ALL: u64 = 0xFFFF_FFFF;
const CL_MEM_READ_WRITE: u64 = 1 << 0;
const CL_PROGRAM_BUILD_LOG: ClUint = 0x1183;
const CL_FALSE: ClUint = 0;
const CL_TRUE: ClUint = 1;

type GetPlatformIdsFn =
    unsafe extern "C" fn(num_entries: ClUint, platforms: *mut Handle, num: *mut ClUint) -> ClInt;
type GetDeviceIdsFn = unsafe extern "C" fn(
    platform: Handle,
    device_type: u64,
    num_entries: ClUint,
    devices: *mut Handle,
    num: *mut ClUint,
) -> ClInt;
type CreateContextFn = unsafe extern "C" fn(
    properties: *const isize,
    num_devices: ClUint,
    devices: *const Handle,
    notify: *const c_void,
    user_data: *mut c_void,
    errcode: *mut ClInt,
) -> Handle;
type CreateCommandQueueFn = unsafe extern "C" fn(
    context: Handle,
    device: Handle,
    properties: u64,
    errcode: *mut ClInt,
) -> Handle;
type CreateBufferFn = unsafe extern "C" fn(
    context: Handle,
    flags: u64,
    size: usize,
    host_ptr: *mut c_void,
    errcode: *mut ClInt,
) -> Handle;
type CreateProgramWithSourceFn = unsafe extern "C" fn(
    context: Handle,
    count: ClUint,
    strings: *const *const c_char,
    lengths: *const usize,
    errcode: *mut ClInt,
) -> Handle;
type BuildProgramFn = unsafe extern "C" fn(
    program: Handle,
    num_devices: ClUint,
    devices: *const Handle,
    options: *const c_char,
    notify: *const c_void,
    user_data: *mut c_void,
) -> ClInt;
type GetProgramBuildInfoFn = unsafe extern "C" fn(
    program: Handle,
    device: Handle,
    param: ClUint,
    size: usize,
    value: *mut c_void,
    size_ret: *mut usize,
) -> ClInt;
type CreateKernelFn =
    unsafe extern "C" fn(program: Handle, name: *const c_char, errcode: *mut ClInt) -> Handle;
type SetKernelArgFn =
    unsafe extern "C" fn(kernel: Handle, index: ClUint, size: usize, value: *const c_void) -> ClInt;
type EnqueueNdRangeKernelFn = unsafe extern "C" fn(
    queue: Handle,
    kernel: Handle,
    work_dim: ClUint,
    offset: *const usize,
    global: *const usize,
    local: *const usize,
    num_events: ClUint,
    wait_list: *const Handle,
    event: *mut Handle,
) -> ClInt;
type EnqueueCopyBufferFn = unsafe extern "C" fn(
    queue: Handle,
    src: Handle,
    dst: Handle,
    src_offset: usize,
    dst_offset: usize,
    size: usize,
    num_events: ClUint,
    wait_list: *const Handle,
    event: *mut Handle,
) -> ClInt;
type EnqueueReadBufferFn = unsafe extern "C" fn(
    queue: Handle,
    buffer: Handle,
    blocking: ClUint,
    offset: usize,
    size: usize,
    ptr: *mut c_void,
    num_events: ClUint,
    wait_list: *const Handle,
    event: *mut Handle,
) -> ClInt;
type EnqueueWriteBufferFn = unsafe extern "C" fn(
    queue: Handle,
    buffer: Handle,
    blocking: ClUint,
    offset: usize,
    size: usize,
    ptr: *const c_void,
    num_events: ClUint,
    wait_list: *const Handle,
    event: *mut Handle,
) -> ClInt;
type EnqueueMarkerWithWaitListFn = unsafe extern "C" fn(
    queue: Handle,
    num_events: ClUint,
    wait_list: *const Handle,
    event: *mut Handle,
) -> ClInt;
type WaitForEventsFn = unsafe extern "C" fn(num_events: ClUint, events: *const Handle) -> ClInt;
type HandleFn = unsafe extern "C" fn(handle: Handle) -> ClInt;

struct ClFns {
    get_platform_ids: GetPlatformIdsFn,
    get_device_ids: GetDeviceIdsFn,
    create_context: CreateContextFn,
    create_command_queue: CreateCommandQueueFn,
    create_buffer: CreateBufferFn,
    create_program_with_source: CreateProgramWithSourceFn,
    build_program: BuildProgramFn,
    get_program_build_info: GetProgramBuildInfoFn,
    create_kernel: CreateKernelFn,
    set_kernel_arg: SetKernelArgFn,
    enqueue_nd_range_kernel: EnqueueNdRangeKernelFn,
    enqueue_copy_buffer: EnqueueCopyBufferFn,
    enqueue_read_buffer: EnqueueReadBufferFn,
    enqueue_write_buffer: EnqueueWriteBufferFn,
    enqueue_marker_with_wait_list: EnqueueMarkerWithWaitListFn,
    wait_for_events: WaitForEventsFn,
    finish: HandleFn,
    release_mem_object: HandleFn,
    release_kernel: HandleFn,
    release_program: HandleFn,
    release_command_queue: HandleFn,
    release_context: HandleFn,
    release_event: HandleFn,
}

/// Loaded OpenCL platform with one device and context.
pub struct ClRuntime {
    _lib: Library,
    fns: ClFns,
    // Handles are stored as usize so runtime objects can cross threads.
    device: usize,
    ctx: usize,
}

impl Drop for ClRuntime {
    fn drop(&mut self) {
        // SAFETY: The context is owned by this runtime and released once.
        let _ = unsafe { (self.fns.release_context)(self.ctx as Handle) };
    }
}

static OPENCL_RUNTIME: OnceLock<Result<Arc<ClRuntime>, String>> = OnceLock::new();

pub fn is_available() -> bool {
    runtime().is_ok()
}

/// Process-wide OpenCL runtime. `FLUXRS_OPENCL_PLATFORM` and
/// `FLUXRS_OPENCL_DEVICE` pick the platform and device by index.
pub fn runtime() -> BackendResult<Arc<ClRuntime>> {
    let init = OPENCL_RUNTIME.get_or_init(|| match ClRuntime::new() {
        Ok(runtime) => Ok(Arc::new(runtime)),
        Err(err) => Err(err.to_string()),
    });
    match init {
        Ok(runtime) => Ok(Arc::clone(runtime)),
        Err(msg) => Err(BackendError::execution(format!(
            "OpenCL runtime unavailable: {msg}"
        ))),
    }
}

fn index_var(key: &str) -> BackendResult<usize> {
    match env::var(key) {
        None => Ok(0),
        Some(value) => value
            .parse()
            .map_err(|_| BackendError::execution(format!("{key}={value} is not an index"))),
    }
}

impl ClRuntime {
    fn new() -> BackendResult<Self> {
        let lib = load_opencl_library()?;
        let fns = ClFns {
            get_platform_ids: load_symbol(&lib, b"clGetPlatformIDs\0")?,
            get_device_ids: load_symbol(&lib, b"clGetDeviceIDs\0")?,
            create_context: load_symbol(&lib, b"clCreateContext\0")?,
            create_command_queue: load_symbol(&lib, b"clCreateCommandQueue\0")?,
            create_buffer: load_symbol(&lib, b"clCreateBuffer\0")?,
            create_program_with_source: load_symbol(&lib, b"clCreateProgramWithSource\0")?,
            build_program: load_symbol(&lib, b"clBuildProgram\0")?,
            get_program_build_info: load_symbol(&lib, b"clGetProgramBuildInfo\0")?,
            create_kernel: load_symbol(&lib, b"clCreateKernel\0")?,
            set_kernel_arg: load_symbol(&lib, b"clSetKernelArg\0")?,
            enqueue_nd_range_kernel: load_symbol(&lib, b"clEnqueueNDRangeKernel\0")?,
            enqueue_copy_buffer: load_symbol(&lib, b"clEnqueueCopyBuffer\0")?,
            enqueue_read_buffer: load_symbol(&lib, b"clEnqueueReadBuffer\0")?,
            enqueue_write_buffer: load_symbol(&lib, b"clEnqueueWriteBuffer\0")?,
            enqueue_marker_with_wait_list: load_symbol(&lib, b"clEnqueueMarkerWithWaitList\0")?,
            wait_for_events: load_symbol(&lib, b"clWaitForEvents\0")?,
            finish: load_symbol(&lib, b"clFinish\0")?,
            release_mem_object: load_symbol(&lib, b"clReleaseMemObject\0")?,
            release_kernel: load_symbol(&lib, b"clReleaseKernel\0")?,
            release_program: load_symbol(&lib, b"clReleaseProgram\0")?,
            release_command_queue: load_symbol(&lib, b"clReleaseCommandQueue\0")?,
            release_context: load_symbol(&lib, b"clReleaseContext\0")?,
            release_event: load_symbol(&lib, b"clReleaseEvent\0")?,
        };

        let platform_ix = index_var("FLUXRS_OPENCL_PLATFORM")?;
        let device_ix = index_var("FLUXRS_OPENCL_DEVICE")?;

        // SAFETY: Out pointers are valid and sized by the preceding count queries.
        unsafe {
            let mut count: ClUint = 0;
            check_cl(
                (fns.get_platform_ids)(0, std::ptr::null_mut(), &mut count),
                "clGetPlatformIDs",
            )?;
            let mut platforms: Vec<Handle> = vec![std::ptr::null_mut(); count as usize];
            check_cl(
                (fns.get_platform_ids)(count, platforms.as_mut_ptr(), std::ptr::null_mut()),
                "clGetPlatformIDs",
            )?;
            let platform = *platforms.get(platform_ix).ok_or_else(|| {
                BackendError::execution(format!(
                    "OpenCL platform {platform_ix} requested, {count} present"
                ))
            })?;

            let mut ndev: ClUint = 0;
            check_cl(
                (fns.get_device_ids)(
                    platform,
                    CL_DEVICE_TYPE_ALL,
                    0,
                    std::ptr::null_mut(),
                    &mut ndev,
                ),
                "clGetDeviceIDs",
            )?;
            let mut devices: Vec<Handle> = vec![std::ptr::null_mut(); ndev as usize];
            check_cl(
                (fns.get_device_ids)(
                    platform,
                    CL_DEVICE_TYPE_ALL,
                    ndev,
                    devices.as_mut_ptr(),
                    std::ptr::null_mut(),
                ),
                "clGetDeviceIDs",
            )?;
            let device = *devices.get(device_ix).ok_or_else(|| {
                BackendError::execution(format!(
                    "OpenCL device {device_ix} requested, {ndev} present"
                ))
            })?;

            let mut err: ClInt = 0;
            let ctx = (fns.create_context)(
                std::ptr::null(),
                1,
                &device,
                std::ptr::null(),
                std::ptr::null_mut(),
                &mut err,
            );
            check_cl(err, "clCreateContext")?;

            Ok(Self {
                _lib: lib,
                fns,
                device: device as usize,
                ctx: ctx as usize,
            })
        }
    }

    pub fn device_ptr(&self) -> *mut c_void {
        self.device as Handle
    }

    pub fn context_ptr(&self) -> *mut c_void {
        self.ctx as Handle
    }

    pub fn create_queue(self: &Arc<Self>) -> BackendResult<ClQueue> {
        let mut err: ClInt = 0;
        // SAFETY: Context and device are live for the runtime's lifetime.
        let queue = unsafe {
            (self.fns.create_command_queue)(self.context_ptr(), self.device_ptr(), 0, &mut err)
        };
        check_cl(err, "clCreateCommandQueue")?;
        Ok(ClQueue {
            runtime: Arc::clone(self),
            queue: queue as usize,
        })
    }

    pub fn alloc(self: &Arc<Self>, bytes: usize) -> BackendResult<ClBuffer> {
        let mut err: ClInt = 0;
        // SAFETY: No host pointer is passed; the size is non-zero.
        let mem = unsafe {
            (self.fns.create_buffer)(
                self.context_ptr(),
                CL_MEM_READ_WRITE,
                bytes.max(1),
                std::ptr::null_mut(),
                &mut err,
            )
        };
        check_cl(err, "clCreateBuffer")?;
        Ok(ClBuffer {
            runtime: Arc::clone(self),
            mem: mem as usize,
            bytes,
        })
    }

    /// Compiles `source`, returning the build log in the error on failure.
    pub fn build_program(self: &Arc<Self>, source: &str, flags: &str) -> BackendResult<ClProgram> {
        let c_source = CString::new(source)
            .map_err(|_| BackendError::execution("kernel source contains NUL byte"))?;
        let c_flags = CString::new(flags)
            .map_err(|_| BackendError::execution("build flags contain NUL byte"))?;
        let strings = [c_source.as_ptr()];
        let mut err: ClInt = 0;
        // SAFETY: One NUL-terminated source string; lengths may be null.
        let program = unsafe {
            (self.fns.create_program_with_source)(
                self.context_ptr(),
                1,
                strings.as_ptr(),
                std::ptr::null(),
                &mut err,
            )
        };
        check_cl(err, "clCreateProgramWithSource")?;
        let program = ClProgram {
            runtime: Arc::clone(self),
            program: program as usize,
        };

        let device = self.device_ptr();
        // SAFETY: Program and device are live; no callback is registered.
        let status = unsafe {
            (self.fns.build_program)(
                program.program as Handle,
                1,
                &device,
                c_flags.as_ptr(),
                std::ptr::null(),
                std::ptr::null_mut(),
            )
        };
        if status != CL_SUCCESS {
            return Err(BackendError::execution(format!(
                "OpenCL program build failed with code {status}:\n{}",
                self.build_log(&program)
            )));
        }
        Ok(program)
    }

    fn build_log(&self, program: &ClProgram) -> String {
        let mut size = 0usize;
        // SAFETY: Size query with a null value pointer.
        let status = unsafe {
            (self.fns.get_program_build_info)(
                program.program as Handle,
                self.device_ptr(),
                CL_PROGRAM_BUILD_LOG,
                0,
                std::ptr::null_mut(),
                &mut size,
            )
        };
        if status != CL_SUCCESS || size == 0 {
            return String::new();
        }
        let mut buf = vec![0u8; size];
        // SAFETY: `buf` holds the size reported above.
        let status = unsafe {
            (self.fns.get_program_build_info)(
                program.program as Handle,
                self.device_ptr(),
                CL_PROGRAM_BUILD_LOG,
                size,
                buf.as_mut_ptr() as *mut c_void,
                std::ptr::null_mut(),
            )
        };
        if status != CL_SUCCESS {
            return String::new();
        }
        String::from_utf8_lossy(&buf)
            .trim_end_matches('\0')
            .trim()
            .to_string()
    }

    pub fn create_kernel(self: &Arc<Self>, program: &Arc<ClProgram>, name: &str) -> BackendResult<ClKernel> {
        let c_name = CString::new(name)
            .map_err(|_| BackendError::execution("kernel name contains NUL byte"))?;
        let mut err: ClInt = 0;
        // SAFETY: Program is built and the name is NUL-terminated.
        let kernel = unsafe {
            (self.fns.create_kernel)(program.program as Handle, c_name.as_ptr(), &mut err)
        };
        check_cl(err, &format!("clCreateKernel({name})"))?;
        Ok(ClKernel {
            program: Arc::clone(program),
            name: name.to_string(),
            kernel: Mutex::new(kernel as usize),
        })
    }

    pub fn wait(&self, events: &[ClEvent]) -> BackendResult<()> {
        if events.is_empty() {
            return Ok(());
        }
        let handles = event_handles(events);
        // SAFETY: Every handle is a live event.
        unsafe {
            check_cl(
                (self.fns.wait_for_events)(handles.len() as ClUint, handles.as_ptr()),
                "clWaitForEvents",
            )
        }
    }
}

fn event_handles(events: &[ClEvent]) -> SmallVec<[Handle; 4]> {
    events.iter().map(ClEvent::handle).collect()
}

fn wait_list(handles: &[Handle]) -> (ClUint, *const Handle) {
    if handles.is_empty() {
        (0, std::ptr::null())
    } else {
        (handles.len() as ClUint, handles.as_ptr())
    }
}

pub struct ClBuffer {
    runtime: Arc<ClRuntime>,
    mem: usize,
    bytes: usize,
}

impl fmt::Debug for ClBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClBuffer")
            .field("mem", &self.mem)
            .field("bytes", &self.bytes)
            .finish()
    }
}

impl ClBuffer {
    /// The `cl_mem` handle, which is what matrices on this backend carry as
    /// their address.
    pub fn handle(&self) -> u64 {
        self.mem as u64
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }
}

impl Drop for ClBuffer {
    fn drop(&mut self) {
        // SAFETY: Buffer is owned by this wrapper and released once.
        let _ = unsafe { (self.runtime.fns.release_mem_object)(self.mem as Handle) };
    }
}

/// Host memory an asynchronous read targets; stays put while the read is
/// in flight.
pub struct HostMirror {
    bytes: Box<[AtomicU8]>,
}

impl HostMirror {
    pub fn zeroed(len: usize) -> Self {
        Self {
            bytes: (0..len).map(|_| AtomicU8::new(0)).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    fn as_mut_ptr(&self) -> *mut c_void {
        self.bytes
            .first()
            .map_or(std::ptr::null_mut(), |first| first.as_ptr() as *mut c_void)
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.bytes
            .iter()
            .map(|byte| byte.load(std::sync::atomic::Ordering::Acquire))
            .collect()
    }
}

pub struct ClProgram {
    runtime: Arc<ClRuntime>,
    program: usize,
}

impl Drop for ClProgram {
    fn drop(&mut self) {
        // SAFETY: Program is owned by this wrapper and released once.
        let _ = unsafe { (self.runtime.fns.release_program)(self.program as Handle) };
    }
}

/// A kernel object. Arguments are set and the launch enqueued under one
/// lock because `clSetKernelArg` mutates shared kernel state.
pub struct ClKernel {
    program: Arc<ClProgram>,
    name: String,
    kernel: Mutex<usize>,
}

impl ClKernel {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for ClKernel {
    fn drop(&mut self) {
        let kernel = *self.kernel.get_mut().unwrap_or_else(|err| err.into_inner());
        // SAFETY: Kernel is owned by this wrapper and released once.
        let _ = unsafe { (self.program.runtime.fns.release_kernel)(kernel as Handle) };
    }
}

struct EventHandle {
    runtime: Arc<ClRuntime>,
    event: usize,
}

impl Drop for EventHandle {
    fn drop(&mut self) {
        // SAFETY: Released once, after the last clone is dropped.
        let _ = unsafe { (self.runtime.fns.release_event)(self.event as Handle) };
    }
}

#[derive(Clone)]
pub struct ClEvent {
    inner: Arc<EventHandle>,
}

impl fmt::Debug for ClEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ClEvent").field(&self.inner.event).finish()
    }
}

impl ClEvent {
    /// Takes ownership of an event handle produced outside this module.
    pub fn from_raw(runtime: &Arc<ClRuntime>, event: *mut c_void) -> Self {
        Self {
            inner: Arc::new(EventHandle {
                runtime: Arc::clone(runtime),
                event: event as usize,
            }),
        }
    }

    pub fn handle(&self) -> *mut c_void {
        self.inner.event as Handle
    }

    pub fn wait(&self) -> BackendResult<()> {
        self.inner.runtime.wait(std::slice::from_ref(self))
    }
}

/// An in-order command queue.
pub struct ClQueue {
    runtime: Arc<ClRuntime>,
    queue: usize,
}

impl Drop for ClQueue {
    fn drop(&mut self) {
        // SAFETY: Queue is owned by this wrapper; pending work is flushed first.
        unsafe {
            let _ = (self.runtime.fns.finish)(self.queue as Handle);
            let _ = (self.runtime.fns.release_command_queue)(self.queue as Handle);
        }
    }
}

impl ClQueue {
    pub fn handle(&self) -> *mut c_void {
        self.queue as Handle
    }

    fn event_out(&self, ret_evt: bool, handle: &mut Handle) -> *mut Handle {
        if ret_evt {
            handle
        } else {
            std::ptr::null_mut()
        }
    }

    fn wrap(&self, ret_evt: bool, handle: Handle) -> Option<ClEvent> {
        ret_evt.then(|| ClEvent::from_raw(&self.runtime, handle))
    }

    /// Sets every argument of `kernel` and enqueues it over `global` work
    /// items in groups of `local`.
    pub fn launch(
        &self,
        kernel: &ClKernel,
        args: &[SmallVec<[u8; 8]>],
        global: [usize; 2],
        local: [usize; 2],
        wait_for: &[ClEvent],
        ret_evt: bool,
    ) -> BackendResult<Option<ClEvent>> {
        let handles = event_handles(wait_for);
        let (nwait, waits) = wait_list(&handles);
        let mut event: Handle = std::ptr::null_mut();
        let guard = kernel.kernel.lock().expect("OpenCL kernel poisoned");
        let raw = *guard as Handle;
        for (index, bytes) in args.iter().enumerate() {
            // SAFETY: `bytes` holds the argument value with the kernel's declared size.
            unsafe {
                check_cl(
                    (self.runtime.fns.set_kernel_arg)(
                        raw,
                        index as ClUint,
                        bytes.len(),
                        bytes.as_ptr() as *const c_void,
                    ),
                    "clSetKernelArg",
                )?;
            }
        }
        // SAFETY: Sizes arrays have `work_dim` entries; the wait list holds live events.
        unsafe {
            check_cl(
                (self.runtime.fns.enqueue_nd_range_kernel)(
                    self.handle(),
                    raw,
                    2,
                    std::ptr::null(),
                    global.as_ptr(),
                    local.as_ptr(),
                    nwait,
                    waits,
                    self.event_out(ret_evt, &mut event),
                ),
                "clEnqueueNDRangeKernel",
            )?;
        }
        Ok(self.wrap(ret_evt, event))
    }

    pub fn copy(
        &self,
        dst: u64,
        src: u64,
        bytes: usize,
        wait_for: &[ClEvent],
        ret_evt: bool,
    ) -> BackendResult<Option<ClEvent>> {
        if bytes == 0 {
            return self.marker_opt(wait_for, ret_evt);
        }
        let handles = event_handles(wait_for);
        let (nwait, waits) = wait_list(&handles);
        let mut event: Handle = std::ptr::null_mut();
        // SAFETY: Both handles are live buffers of at least `bytes` bytes.
        unsafe {
            check_cl(
                (self.runtime.fns.enqueue_copy_buffer)(
                    self.handle(),
                    src as usize as Handle,
                    dst as usize as Handle,
                    0,
                    0,
                    bytes,
                    nwait,
                    waits,
                    self.event_out(ret_evt, &mut event),
                ),
                "clEnqueueCopyBuffer",
            )?;
        }
        Ok(self.wrap(ret_evt, event))
    }

    /// Non-blocking read of `src` into `dst`.
    pub(crate) fn read_async(
        &self,
        dst: &HostMirror,
        src: u64,
        wait_for: &[ClEvent],
        ret_evt: bool,
    ) -> BackendResult<Option<ClEvent>> {
        if dst.is_empty() {
            return self.marker_opt(wait_for, ret_evt);
        }
        let handles = event_handles(wait_for);
        let (nwait, waits) = wait_list(&handles);
        let mut event: Handle = std::ptr::null_mut();
        // SAFETY: The mirror holds `dst.len()` bytes. Its owner keeps it alive until
        // the returned event completes (see `ClStaging`).
        unsafe {
            check_cl(
                (self.runtime.fns.enqueue_read_buffer)(
                    self.handle(),
                    src as usize as Handle,
                    CL_FALSE,
                    0,
                    dst.len(),
                    dst.as_mut_ptr(),
                    nwait,
                    waits,
                    self.event_out(ret_evt, &mut event),
                ),
                "clEnqueueReadBuffer",
            )?;
        }
        Ok(self.wrap(ret_evt, event))
    }

    pub fn read_blocking(&self, src: u64, bytes: usize) -> BackendResult<Vec<u8>> {
        let mut out = vec![0u8; bytes];
        if bytes == 0 {
            return Ok(out);
        }
        // SAFETY: `out` holds `bytes` writable bytes; the read is blocking.
        unsafe {
            check_cl(
                (self.runtime.fns.enqueue_read_buffer)(
                    self.handle(),
                    src as usize as Handle,
                    CL_TRUE,
                    0,
                    bytes,
                    out.as_mut_ptr() as *mut c_void,
                    0,
                    std::ptr::null(),
                    std::ptr::null_mut(),
                ),
                "clEnqueueReadBuffer",
            )?;
        }
        Ok(out)
    }

    pub fn write_blocking(&self, dst: u64, bytes: &[u8]) -> BackendResult<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        // SAFETY: `bytes` stays borrowed for the duration of the blocking write.
        unsafe {
            check_cl(
                (self.runtime.fns.enqueue_write_buffer)(
                    self.handle(),
                    dst as usize as Handle,
                    CL_TRUE,
                    0,
                    bytes.len(),
                    bytes.as_ptr() as *const c_void,
                    0,
                    std::ptr::null(),
                    std::ptr::null_mut(),
                ),
                "clEnqueueWriteBuffer",
            )
        }
    }

    pub fn marker(&self, events: &[ClEvent]) -> BackendResult<ClEvent> {
        let handles = event_handles(events);
        let (nwait, waits) = wait_list(&handles);
        let mut event: Handle = std::ptr::null_mut();
        // SAFETY: The wait list holds live events and `event` is a valid out pointer.
        unsafe {
            check_cl(
                (self.runtime.fns.enqueue_marker_with_wait_list)(
                    self.handle(),
                    nwait,
                    waits,
                    &mut event,
                ),
                "clEnqueueMarkerWithWaitList",
            )?;
        }
        Ok(ClEvent::from_raw(&self.runtime, event))
    }

    fn marker_opt(&self, wait_for: &[ClEvent], ret_evt: bool) -> BackendResult<Option<ClEvent>> {
        if ret_evt {
            self.marker(wait_for).map(Some)
        } else {
            Ok(None)
        }
    }

    pub fn finish(&self) -> BackendResult<()> {
        // SAFETY: Queue handle is live until drop.
        unsafe { check_cl((self.runtime.fns.finish)(self.handle()), "clFinish") }
    }
}

fn load_opencl_library() -> BackendResult<Library> {
    let candidates = [
        "libOpenCL.so.1",
        "libOpenCL.so",
        "OpenCL.dll",
        "/System/Library/Frameworks/OpenCL.framework/OpenCL",
    ];

    for candidate in candidates {
        // SAFETY: Availability check only; no symbols are invoked at this stage.
        if let Ok(lib) = unsafe { Library::new(candidate) } {
            return Ok(lib);
        }
    }

    Err(BackendError::execution(format!(
        "failed to load OpenCL ICD loader (tried {})",
        candidates.join(", ")
    )))
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

fn check_cl(code: ClInt, op: &str) -> BackendResult<()> {
    if code == CL_SUCCESS {
        Ok(())
    } else {
        Err(BackendError::execution(format!(
            "OpenCL call {op} failed with code {code}"
        )))
    }
}
