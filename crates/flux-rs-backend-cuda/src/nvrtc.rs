//! Runtime compilation of CUDA C++ to PTX through NVRTC.

use std::ffi::{c_char, c_void, CStr, CString};

use flux_rs::env;
use flux_rs::error::{BackendError, BackendResult};
use libloading::Library;

use crate::driver::load_symbol;

type NvrtcResult = i32;
type NvrtcProgram = *mut c_void;

const NVRTC_SUCCESS: NvrtcResult = 0;

type CreateProgramFn = unsafe extern "C" fn(
    prog: *mut NvrtcProgram,
    src: *const c_char,
    name: *const c_char,
    num_headers: i32,
    headers: *const *const c_char,
    include_names: *const *const c_char,
) -> NvrtcResult;
type CompileProgramFn = unsafe extern "C" fn(
    prog: NvrtcProgram,
    num_options: i32,
    options: *const *const c_char,
) -> NvrtcResult;
type GetSizeFn = unsafe extern "C" fn(prog: NvrtcProgram, size: *mut usize) -> NvrtcResult;
type GetTextFn = unsafe extern "C" fn(prog: NvrtcProgram, out: *mut c_char) -> NvrtcResult;
type DestroyProgramFn = unsafe extern "C" fn(prog: *mut NvrtcProgram) -> NvrtcResult;
type GetErrorStringFn = unsafe extern "C" fn(result: NvrtcResult) -> *const c_char;

pub struct Nvrtc {
    _lib: Library,
    create_program: CreateProgramFn,
    compile_program: CompileProgramFn,
    get_program_log_size: GetSizeFn,
    get_program_log: GetTextFn,
    get_ptx_size: GetSizeFn,
    get_ptx: GetTextFn,
    destroy_program: DestroyProgramFn,
    get_error_string: GetErrorStringFn,
}

/// Destroys the program on every exit path.
struct ProgramGuard<'a> {
    nvrtc: &'a Nvrtc,
    prog: NvrtcProgram,
}

impl Drop for ProgramGuard<'_> {
    fn drop(&mut self) {
        // SAFETY: The program was created by nvrtcCreateProgram and is destroyed once.
        let _ = unsafe { (self.nvrtc.destroy_program)(&mut self.prog) };
    }
}

impl Nvrtc {
    pub fn load() -> BackendResult<Self> {
        let lib = load_nvrtc_library()?;
        Ok(Self {
            create_program: load_symbol(&lib, b"nvrtcCreateProgram\0")?,
            compile_program: load_symbol(&lib, b"nvrtcCompileProgram\0")?,
            get_program_log_size: load_symbol(&lib, b"nvrtcGetProgramLogSize\0")?,
            get_program_log: load_symbol(&lib, b"nvrtcGetProgramLog\0")?,
            get_ptx_size: load_symbol(&lib, b"nvrtcGetPTXSize\0")?,
            get_ptx: load_symbol(&lib, b"nvrtcGetPTX\0")?,
            destroy_program: load_symbol(&lib, b"nvrtcDestroyProgram\0")?,
            get_error_string: load_symbol(&lib, b"nvrtcGetErrorString\0")?,
            _lib: lib,
        })
    }

    /// Compiles `source` and returns its PTX. A failed compile reports the
    /// NVRTC log.
    pub fn compile(&self, source: &str, name: &str, options: &[String]) -> BackendResult<String> {
        let c_source = CString::new(source)
            .map_err(|_| BackendError::execution("kernel source contains NUL byte"))?;
        let c_name = CString::new(format!("{name}.cu"))
            .map_err(|_| BackendError::execution("kernel name contains NUL byte"))?;
        let c_options = options
            .iter()
            .map(|opt| CString::new(opt.as_str()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| BackendError::execution("compile option contains NUL byte"))?;
        let option_ptrs: Vec<*const c_char> = c_options.iter().map(|opt| opt.as_ptr()).collect();

        let mut prog: NvrtcProgram = std::ptr::null_mut();
        // SAFETY: All strings are NUL-terminated and outlive the call.
        let created = unsafe {
            (self.create_program)(
                &mut prog,
                c_source.as_ptr(),
                c_name.as_ptr(),
                0,
                std::ptr::null(),
                std::ptr::null(),
            )
        };
        self.check(created, "nvrtcCreateProgram")?;
        let guard = ProgramGuard { nvrtc: self, prog };

        // SAFETY: `option_ptrs` holds `options.len()` valid C strings.
        let compiled = unsafe {
            (self.compile_program)(guard.prog, option_ptrs.len() as i32, option_ptrs.as_ptr())
        };
        if compiled != NVRTC_SUCCESS {
            let log = self.read_text(guard.prog, self.get_program_log_size, self.get_program_log)?;
            return Err(BackendError::execution(format!(
                "NVRTC failed to compile {name}: {}\n{log}",
                self.error_string(compiled)
            )));
        }
        self.read_text(guard.prog, self.get_ptx_size, self.get_ptx)
    }

    fn read_text(&self, prog: NvrtcProgram, size_fn: GetSizeFn, text_fn: GetTextFn) -> BackendResult<String> {
        let mut size = 0usize;
        // SAFETY: `size` is a valid out pointer for a live program.
        self.check(unsafe { size_fn(prog, &mut size) }, "nvrtcGetSize")?;
        let mut buf = vec![0u8; size.max(1)];
        // SAFETY: `buf` holds at least the size NVRTC reported.
        self.check(unsafe { text_fn(prog, buf.as_mut_ptr() as *mut c_char) }, "nvrtcGetText")?;
        let text = CStr::from_bytes_until_nul(&buf)
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|_| String::from_utf8_lossy(&buf).into_owned());
        Ok(text)
    }

    fn error_string(&self, code: NvrtcResult) -> String {
        // SAFETY: NVRTC returns a static string for any result code.
        let ptr = unsafe { (self.get_error_string)(code) };
        if ptr.is_null() {
            return format!("code {code}");
        }
        // SAFETY: Non-null pointers from nvrtcGetErrorString are NUL-terminated.
        unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned()
    }

    fn check(&self, code: NvrtcResult, op: &str) -> BackendResult<()> {
        if code == NVRTC_SUCCESS {
            Ok(())
        } else {
            Err(BackendError::execution(format!(
                "NVRTC call {op} failed: {}",
                self.error_string(code)
            )))
        }
    }
}

fn load_nvrtc_library() -> BackendResult<Library> {
    let mut candidates: Vec<String> = env::var("FLUXRS_NVRTC_LIB").into_iter().collect();
    candidates.extend(
        [
            "libnvrtc.so",
            "libnvrtc.so.12",
            "libnvrtc.so.11.2",
            "nvrtc64_120_0.dll",
            "libnvrtc.dylib",
        ]
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
        "failed to load NVRTC (tried {})",
        candidates.join(", ")
    )))
}
