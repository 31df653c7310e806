//! Tall-and-skinny matrix multiply through the TinyTC recipe library.
//!
//! TinyTC compiles a recipe per `(scalar type, N, K)` for one device and
//! instantiates it through per-call handlers bound to concrete buffers.
//! [`flux_rs::gemm::RecipeMultiply`] owns the caching and autotuning; this
//! module only speaks the library's C ABI.

use std::ffi::c_void;
use std::sync::Arc;

use flux_rs::env;
use flux_rs::error::{BackendError, BackendResult};
use flux_rs::gemm::{GemmArgs, RecipeKey, RecipeRuntime, ScalarType};
use libloading::Library;
use smallvec::SmallVec;

use crate::cl::{load_symbol, ClEvent, ClQueue};
use crate::OpenClBackend;

type Status = i32;
type Handle = *mut c_void;

const TINYTC_SUCCESS: Status = 0;
const MEM_TYPE_BUF: i32 = 0;
const SCALAR_TYPE_F32: i32 = 10;
const SCALAR_TYPE_F64: i32 = 11;

/// Memory operand as TinyTC expects it: `value` points at a variable
/// holding the `cl_mem`.
#[repr(C)]
struct TinyTcMem {
    value: *const c_void,
    ty: i32,
}

type CoreInfoCreateFn = unsafe extern "C" fn(info: *mut Handle, device: Handle) -> Status;
type RecipeCreateFn = unsafe extern "C" fn(
    recipe: *mut Handle,
    info: Handle,
    ty: i32,
    n: u32,
    k: u32,
    m_block: u32,
    ctx: Handle,
) -> Status;
type HandlerCreateFn =
    unsafe extern "C" fn(handler: *mut Handle, context: Handle, device: Handle, recipe: Handle) -> Status;
type SetArgsFn = unsafe extern "C" fn(
    handler: Handle,
    m: u32,
    alpha_size: usize,
    alpha: *const c_void,
    a: TinyTcMem,
    lda: u32,
    b: TinyTcMem,
    ldb: u32,
    beta_size: usize,
    beta: *const c_void,
    c: TinyTcMem,
    ldc: u32,
) -> Status;
type SubmitFn = unsafe extern "C" fn(
    handler: Handle,
    queue: Handle,
    num_wait: u32,
    wait_list: *const Handle,
    event: *mut Handle,
) -> Status;
type ReleaseFn = unsafe extern "C" fn(handle: Handle) -> Status;

struct TinyTcFns {
    core_info_create: CoreInfoCreateFn,
    recipe_create: RecipeCreateFn,
    handler_create: HandlerCreateFn,
    set_args: SetArgsFn,
    submit: SubmitFn,
    handler_release: ReleaseFn,
    recipe_release: ReleaseFn,
    core_info_release: ReleaseFn,
}

/// Opaque TinyTC object handle.
#[derive(Debug)]
pub struct TinyTcHandle(usize);

impl TinyTcHandle {
    fn ptr(&self) -> Handle {
        self.0 as Handle
    }
}

pub struct TinyTc {
    backend: Arc<OpenClBackend>,
    _lib: Library,
    fns: TinyTcFns,
    core_info: usize,
}

impl Drop for TinyTc {
    fn drop(&mut self) {
        // SAFETY: Core info is owned by this wrapper and released once.
        let _ = unsafe { (self.fns.core_info_release)(self.core_info as Handle) };
    }
}

fn check(status: Status, call: &'static str) -> BackendResult<()> {
    if status == TINYTC_SUCCESS {
        Ok(())
    } else {
        Err(BackendError::recipe(call, status))
    }
}

fn to_u32(value: usize, what: &str) -> BackendResult<u32> {
    u32::try_from(value)
        .map_err(|_| BackendError::incompatible(format!("{what} {value} exceeds 32 bits")))
}

impl TinyTc {
    pub fn new(backend: Arc<OpenClBackend>) -> BackendResult<Arc<Self>> {
        let lib = load_tinytc_library()?;
        let fns = TinyTcFns {
            core_info_create: load_symbol(&lib, b"tinytc_cl_core_info_create\0")?,
            recipe_create: load_symbol(&lib, b"tinytc_recipe_tall_and_skinny_create\0")?,
            handler_create: load_symbol(&lib, b"tinytc_cl_recipe_handler_create\0")?,
            set_args: load_symbol(&lib, b"tinytc_recipe_tall_and_skinny_set_args\0")?,
            submit: load_symbol(&lib, b"tinytc_cl_recipe_handler_submit\0")?,
            handler_release: load_symbol(&lib, b"tinytc_recipe_handler_release\0")?,
            recipe_release: load_symbol(&lib, b"tinytc_recipe_release\0")?,
            core_info_release: load_symbol(&lib, b"tinytc_core_info_release\0")?,
        };

        let mut info: Handle = std::ptr::null_mut();
        // SAFETY: `info` is a valid out pointer and the device handle is live.
        let status = unsafe { (fns.core_info_create)(&mut info, backend.cl().device_ptr()) };
        check(status, "tinytc_cl_core_info_create")?;

        Ok(Arc::new(Self {
            backend,
            _lib: lib,
            fns,
            core_info: info as usize,
        }))
    }
}

impl RecipeRuntime for TinyTc {
    type Backend = OpenClBackend;
    type Recipe = TinyTcHandle;
    type Handler = TinyTcHandle;

    fn backend(&self) -> &Arc<OpenClBackend> {
        &self.backend
    }

    fn create_recipe(&self, key: RecipeKey) -> BackendResult<TinyTcHandle> {
        let ty = match key.scalar {
            ScalarType::F32 => SCALAR_TYPE_F32,
            ScalarType::F64 => SCALAR_TYPE_F64,
        };
        let n = to_u32(key.n, "recipe N")?;
        let k = to_u32(key.k, "recipe K")?;
        let mut recipe: Handle = std::ptr::null_mut();
        // SAFETY: Core info is live; a zero M block lets TinyTC choose.
        let status = unsafe {
            (self.fns.recipe_create)(
                &mut recipe,
                self.core_info as Handle,
                ty,
                n,
                k,
                0,
                std::ptr::null_mut(),
            )
        };
        check(status, "tinytc_recipe_tall_and_skinny_create")?;
        Ok(TinyTcHandle(recipe as usize))
    }

    fn release_recipe(&self, recipe: &TinyTcHandle) {
        // SAFETY: Each recipe is released once by its owner.
        let _ = unsafe { (self.fns.recipe_release)(recipe.ptr()) };
    }

    fn create_handler(&self, recipe: &TinyTcHandle) -> BackendResult<TinyTcHandle> {
        let cl = self.backend.cl();
        let mut handler: Handle = std::ptr::null_mut();
        // SAFETY: Context, device and recipe are live.
        let status = unsafe {
            (self.fns.handler_create)(
                &mut handler,
                cl.context_ptr(),
                cl.device_ptr(),
                recipe.ptr(),
            )
        };
        check(status, "tinytc_cl_recipe_handler_create")?;
        Ok(TinyTcHandle(handler as usize))
    }

    fn release_handler(&self, handler: &TinyTcHandle) {
        // SAFETY: Each handler is released once by its owner.
        let _ = unsafe { (self.fns.handler_release)(handler.ptr()) };
    }

    fn set_args(&self, handler: &TinyTcHandle, args: &GemmArgs) -> BackendResult<()> {
        let mems: [Handle; 3] = [args.a as usize as Handle, args.b as usize as Handle, args.c as usize as Handle];
        let operand = |slot: &Handle| TinyTcMem {
            value: slot as *const Handle as *const c_void,
            ty: MEM_TYPE_BUF,
        };
        let (alpha_f32, beta_f32) = (args.alpha as f32, args.beta as f32);
        let (alpha, beta): (*const c_void, *const c_void) = match args.scalar {
            ScalarType::F32 => (
                &alpha_f32 as *const f32 as *const c_void,
                &beta_f32 as *const f32 as *const c_void,
            ),
            ScalarType::F64 => (
                &args.alpha as *const f64 as *const c_void,
                &args.beta as *const f64 as *const c_void,
            ),
        };
        let size = args.scalar.size_bytes();

        // SAFETY: Scalar and buffer-slot pointers outlive the call; TinyTC copies them.
        let status = unsafe {
            (self.fns.set_args)(
                handler.ptr(),
                to_u32(args.m, "M")?,
                size,
                alpha,
                operand(&mems[0]),
                to_u32(args.lda, "lda")?,
                operand(&mems[1]),
                to_u32(args.ldb, "ldb")?,
                size,
                beta,
                operand(&mems[2]),
                to_u32(args.ldc, "ldc")?,
            )
        };
        check(status, "tinytc_recipe_tall_and_skinny_set_args")
    }

    fn submit(
        &self,
        handler: &TinyTcHandle,
        queue: &ClQueue,
        wait_for: &[ClEvent],
        ret_evt: bool,
    ) -> BackendResult<Option<ClEvent>> {
        let waits: SmallVec<[Handle; 4]> = wait_for.iter().map(ClEvent::handle).collect();
        let wait_ptr = if waits.is_empty() {
            std::ptr::null()
        } else {
            waits.as_ptr()
        };
        let mut event: Handle = std::ptr::null_mut();
        let event_ptr: *mut Handle = if ret_evt {
            &mut event
        } else {
            std::ptr::null_mut()
        };
        // SAFETY: Queue and events are live; `event_ptr` is null or a valid out pointer.
        let status = unsafe {
            (self.fns.submit)(
                handler.ptr(),
                queue.handle(),
                waits.len() as u32,
                wait_ptr,
                event_ptr,
            )
        };
        check(status, "tinytc_cl_recipe_handler_submit")?;
        Ok(ret_evt.then(|| ClEvent::from_raw(self.backend.cl(), event)))
    }
}

fn load_tinytc_library() -> BackendResult<Library> {
    let mut candidates: Vec<String> = env::var("FLUXRS_TINYTC_LIB").into_iter().collect();
    candidates.extend(
        ["libtinytc_cl.so", "libtinytc_cl.so.1", "tinytc_cl.dll", "libtinytc_cl.dylib"]
            .iter()
            .map(|name| name.to_string()),
    );

    for candidate in &candidates {
        // SAFETY: Availability check only; no symbols are invoked at this stage.
        if let Ok(lib) = unsafe { Library::new(candidate) } {
            return Ok(lib);
        }
    }

    Err(BackendError::execution(format!(
        "failed to load TinyTC (tried {})",
        candidates.join(", ")
    )))
}
