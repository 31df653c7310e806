use std::ffi::c_void;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use flux_rs::env;
use flux_rs::error::{BackendError, BackendResult};
use flux_rs::kernel::ArgType;
use flux_rs::profiling;
use flux_rs::provider::{fingerprint, ProgramCache};
use libloading::Library;

use crate::args::StructLayout;

pub(crate) type HostEntry = unsafe extern "C" fn(args: *const c_void);

/// A generated translation unit compiled into a shared library.
pub struct HostProgram {
    lib: Library,
    path: PathBuf,
}

impl HostProgram {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// One exported kernel of a loaded program.
pub struct HostFunction {
    program: Arc<HostProgram>,
    name: String,
    entry: HostEntry,
    layout: StructLayout,
}

impl HostFunction {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn program(&self) -> &Arc<HostProgram> {
        &self.program
    }

    pub(crate) fn entry(&self) -> HostEntry {
        self.entry
    }

    pub(crate) fn layout(&self) -> &StructLayout {
        &self.layout
    }
}

pub struct HostCompiler {
    compiler: String,
    flags: Vec<String>,
    cache_dir: PathBuf,
    programs: ProgramCache<HostProgram>,
}

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

impl HostCompiler {
    pub fn new(cache_dir: PathBuf) -> Self {
        let flags = env::var("FLUXRS_CFLAGS")
            .map(|value| value.split_whitespace().map(str::to_string).collect())
            .unwrap_or_else(|| vec!["-O2".to_string()]);
        Self {
            compiler: c_compiler(),
            flags,
            cache_dir,
            programs: ProgramCache::new(),
        }
    }

    pub fn programs_built(&self) -> usize {
        self.programs.builds()
    }

    pub fn build(
        &self,
        name: &str,
        source: &str,
        arg_types: &[ArgType],
    ) -> BackendResult<Arc<HostFunction>> {
        let flags_key = format!("{} {}", self.compiler, self.flags.join(" "));
        let program = self
            .programs
            .get_or_build(source, &flags_key, || self.compile(source, &flags_key))?;

        let symbol = format!("{name}\0");
        // SAFETY: Generated kernels are exported with the HostEntry signature.
        let entry = unsafe { program.lib.get::<HostEntry>(symbol.as_bytes()) }
            .map(|sym| *sym)
            .map_err(|err| {
                BackendError::execution(format!(
                    "kernel {name} not found in {}: {err}",
                    program.path.display()
                ))
            })?;

        Ok(Arc::new(HostFunction {
            program: Arc::clone(&program),
            name: name.to_string(),
            entry,
            layout: StructLayout::of(arg_types),
        }))
    }

    fn compile(&self, source: &str, flags_key: &str) -> BackendResult<HostProgram> {
        let fp = fingerprint(&[source, flags_key]);
        std::fs::create_dir_all(&self.cache_dir)
            .map_err(|err| BackendError::execution(err.to_string()))?;

        let src_path = self.cache_dir.join(format!("kernel_{fp:016x}.c"));
        let lib_path = self
            .cache_dir
            .join(format!("libfluxrs_{fp:016x}{}", lib_ext()));

        if lib_path.exists() {
            profiling::cache_event("c_backend.program_hit_disk");
        } else {
            profiling::cache_event("c_backend.program_miss_disk");
            std::fs::write(&src_path, source)
                .map_err(|err| BackendError::execution(err.to_string()))?;
            let tmp_path = self.cache_dir.join(format!(
                "libfluxrs_{fp:016x}.{}.{}.tmp",
                std::process::id(),
                TMP_COUNTER.fetch_add(1, Ordering::Relaxed)
            ));
            let _compile_scope = profiling::compile_scope("c_backend.compile");
            self.run_compiler(&src_path, &tmp_path)?;
            std::fs::rename(&tmp_path, &lib_path)
                .map_err(|err| BackendError::execution(err.to_string()))?;
        }

        // SAFETY: The library was produced by the host compiler from generated source.
        let lib = unsafe { Library::new(&lib_path) }
            .map_err(|err| BackendError::execution(err.to_string()))?;
        Ok(HostProgram {
            lib,
            path: lib_path,
        })
    }

    fn run_compiler(&self, src: &Path, out: &Path) -> BackendResult<()> {
        let mut cmd = Command::new(&self.compiler);
        if cfg!(target_os = "macos") {
            cmd.arg("-dynamiclib");
        } else {
            cmd.arg("-shared").arg("-fPIC");
        }
        cmd.arg("-std=c99");
        cmd.args(&self.flags);
        cmd.arg("-o").arg(out).arg(src);
        if !cfg!(target_os = "windows") {
            cmd.arg("-lm");
        }

        let output = cmd.output().map_err(|err| {
            BackendError::execution(format!("failed to run {}: {err}", self.compiler))
        })?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(BackendError::execution(format!(
                "C compiler failed (status={}): {}",
                output.status,
                stderr.trim()
            )));
        }
        Ok(())
    }
}

pub(crate) fn c_compiler() -> String {
    env::var("CC").unwrap_or_else(|| "cc".to_string())
}

fn lib_ext() -> &'static str {
    if cfg!(target_os = "macos") {
        ".dylib"
    } else if cfg!(target_os = "windows") {
        ".dll"
    } else {
        ".so"
    }
}
