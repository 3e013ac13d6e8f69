//! Native engine: the Fortran RK4 routine behind the C ABI
//!
//! The Fortran source is embedded in the crate. On construction the backend
//! looks for a shared library built from exactly this source, compiler and
//! flag set in its cache directory; if none exists (or a rebuild is forced)
//! it runs the compiler, then loads the library and resolves
//! `integrate_particles`.
//!
//! Cache layout (`cache_dir`):
//! - `libdust_integrator-<hash>.so`: the loaded artifact (platform suffix)
//! - `build-XXXXXX/`: private scratch directory of one compiler run, holding
//!   the source and module files; removed when the build finishes
//!
//! `<hash>` covers source, compiler and flags, so a changed toolchain or
//! kernel never picks up a stale library.
//!
//! The default cache lives under the user's cache directory. On unix the
//! cache directory must be owned by the current user and not writable by
//! group or others, and a cached artifact must be a regular file with the
//! same owner and mode restrictions; anything else is refused before it
//! is loaded.
//!
//! Buffers cross the boundary column-major: initial (6, n) and
//! results (6, n, num_steps). That memory is byte-for-byte the row-major
//! (num_steps, n, 6) tensor every other backend returns.

use std::env;
use std::ffi::c_int;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;

use libloading::Library;
use log::{debug, info, warn};
use ndarray::{Array3, ShapeBuilder};

use crate::error::{DustError, NativeBuildError, Result};
use crate::simulation::engine::Backend;
use crate::simulation::params::{BackendKind, SimulationConfig};
use crate::simulation::result::{trajectory_len, SimulationResult};

/// Fortran source of the integrator
pub const NATIVE_SOURCE: &str = include_str!("native/dust_integrator.f90");

/// Exported entry point of the compiled routine
const ENTRY_POINT: &[u8] = b"integrate_particles\0";

/// `integrate_particles(n, steps, dt, gm, q_over_m, beta, e, b, initial, results, status)`
type IntegrateFn = unsafe extern "C" fn(
    c_int,
    c_int,
    f64,
    f64,
    *const f64,
    *const f64,
    *const f64,
    *const f64,
    *const f64,
    *mut f64,
    *mut c_int,
);

/// Where and how the native artifact is built
#[derive(Debug, Clone)]
pub struct NativeOptions {
    pub cache_dir: PathBuf,  // artifact cache, created on demand
    pub force_rebuild: bool, // ignore a cached library
    pub compiler: String,    // Fortran compiler executable
    pub flags: Vec<String>,  // compiler flags producing a shared library
    pub source: String,      // Fortran source to compile
}

impl Default for NativeOptions {
    /// Cache from [`default_cache_dir`], compiler `$DUSTSIM_FC` (or gfortran)
    fn default() -> Self {
        let compiler = env::var("DUSTSIM_FC").unwrap_or_else(|_| "gfortran".to_string());

        Self {
            cache_dir: default_cache_dir(),
            force_rebuild: false,
            compiler,
            // no FMA contraction: keeps the recurrence identical to the Rust kernel
            flags: ["-O2", "-fPIC", "-shared", "-ffp-contract=off"]
                .iter()
                .map(|f| f.to_string())
                .collect(),
            source: NATIVE_SOURCE.to_string(),
        }
    }
}

/// `$DUSTSIM_NATIVE_CACHE`, else `$XDG_CACHE_HOME/dustsim`, else
/// `$HOME/.cache/dustsim`, else `dustsim-native` in the temp dir
pub fn default_cache_dir() -> PathBuf {
    let non_empty = |name: &str| env::var_os(name).filter(|v| !v.is_empty()).map(PathBuf::from);

    if let Some(dir) = non_empty("DUSTSIM_NATIVE_CACHE") {
        return dir;
    }
    if let Some(dir) = non_empty("XDG_CACHE_HOME") {
        return dir.join("dustsim");
    }
    if let Some(home) = non_empty("HOME") {
        return home.join(".cache").join("dustsim");
    }
    env::temp_dir().join("dustsim-native")
}

impl NativeOptions {
    /// Same options with a different cache directory
    pub fn in_dir(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            ..Self::default()
        }
    }

    /// Content hash of everything that affects the produced library
    pub fn build_key(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.source.as_bytes());
        hasher.update(b"\0");
        hasher.update(self.compiler.as_bytes());
        for flag in &self.flags {
            hasher.update(b"\0");
            hasher.update(flag.as_bytes());
        }
        hasher.finalize().to_hex()[..16].to_string()
    }

    /// Path of the shared library for the current build key
    pub fn artifact_path(&self) -> PathBuf {
        self.cache_dir.join(format!(
            "{}dust_integrator-{}{}",
            env::consts::DLL_PREFIX,
            self.build_key(),
            env::consts::DLL_SUFFIX
        ))
    }
}

pub struct NativeBackend {
    integrate: IntegrateFn, // resolved from `_library`, valid while it is loaded
    artifact: PathBuf,
    _library: Library,
}

impl NativeBackend {
    /// Build (or reuse) the artifact with default options and load it
    pub fn new() -> std::result::Result<Self, NativeBuildError> {
        Self::with_options(&NativeOptions::default())
    }

    pub fn with_options(options: &NativeOptions) -> std::result::Result<Self, NativeBuildError> {
        // the compiler runs in a scratch directory, relative paths would point elsewhere
        let cache_dir = std::path::absolute(&options.cache_dir).map_err(io_error(&options.cache_dir))?;
        let options = NativeOptions {
            cache_dir,
            ..options.clone()
        };
        let artifact = options.artifact_path();

        create_cache_dir(&options.cache_dir).map_err(io_error(&options.cache_dir))?;
        check_cache_dir(&options.cache_dir)?;

        if options.force_rebuild || fs::symlink_metadata(&artifact).is_err() {
            info!(
                "Compiling native integrator with {} into {}",
                options.compiler,
                artifact.display()
            );
            if let Err(e) = build_artifact(&options, &artifact) {
                warn!("Native integrator build failed: {e}");
                return Err(e);
            }
        } else {
            check_cached_artifact(&artifact, &options.cache_dir)?;
            debug!("Reusing cached native integrator {}", artifact.display());
        }

        let load_error = |reason: String| NativeBuildError::Load {
            path: artifact.clone(),
            reason,
        };

        // Safety: the library is our own Fortran module, it has no load-time initialisers
        let library = unsafe { Library::new(&artifact) }.map_err(|e| load_error(e.to_string()))?;
        // Safety: `IntegrateFn` matches the bind(c) interface in dust_integrator.f90
        let integrate: IntegrateFn = unsafe {
            *library
                .get::<IntegrateFn>(ENTRY_POINT)
                .map_err(|e| load_error(e.to_string()))?
        };

        Ok(Self {
            integrate,
            artifact,
            _library: library,
        })
    }

    /// Location of the loaded library
    pub fn artifact(&self) -> &Path {
        &self.artifact
    }
}

impl Backend for NativeBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Native
    }

    fn run(&self, config: &SimulationConfig) -> Result<SimulationResult> {
        let particles = config.particles();
        let n = particles.count();
        let steps = config.num_steps();

        let too_large = |what: &str| {
            DustError::numeric(BackendKind::Native, format!("{what} exceeds the native integer range"))
        };
        let n_c = c_int::try_from(n).map_err(|_| too_large("particle count"))?;
        let steps_c = c_int::try_from(steps).map_err(|_| too_large("step count"))?;

        // (n, 6) row-major is (6, n) column-major
        let initial: Vec<f64> = particles.initial_state().iter().copied().collect();
        let q_over_m = config.q_over_m().to_vec();
        let betas = particles.betas();
        let e = config.electric_field();
        let b = config.magnetic_field();
        let e_field = [e.x, e.y, e.z];
        let b_field = [b.x, b.y, b.z];

        let mut results = vec![0.0_f64; trajectory_len(n, steps, BackendKind::Native)?];
        let mut status: c_int = -1;

        debug!(
            "Starting native simulation: particles={}, steps={}, dt={}",
            n,
            steps,
            config.time_step()
        );

        // Safety: every buffer has the extent the routine declares for (n, steps)
        unsafe {
            (self.integrate)(
                n_c,
                steps_c,
                config.time_step(),
                config.gm_sun(),
                q_over_m.as_ptr(),
                betas.as_ptr(),
                e_field.as_ptr(),
                b_field.as_ptr(),
                initial.as_ptr(),
                results.as_mut_ptr(),
                &mut status,
            );
        }

        if status != 0 {
            let reason = match status {
                1 => "invalid dimensions",
                2 => "workspace allocation failed",
                _ => "unknown failure",
            };
            return Err(DustError::numeric(
                BackendKind::Native,
                format!("native integrator returned non-zero status {status} ({reason})"),
            ));
        }

        // column-major (6, n, steps) -> row-major (steps, n, 6)
        let state = Array3::from_shape_vec((6, n, steps).f(), results)
            .map_err(|e| DustError::numeric(BackendKind::Native, e.to_string()))?
            .permuted_axes([2, 1, 0])
            .as_standard_layout()
            .into_owned();

        SimulationResult::new(config.times(), state, BackendKind::Native)
    }
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> NativeBuildError {
    let path = path.to_path_buf();
    move |source| NativeBuildError::Io { path, source }
}

fn create_cache_dir(dir: &Path) -> io::Result<()> {
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o700);
    }
    builder.create(dir)
}

/// The cache directory must belong to the current user and be closed to everyone else
#[cfg(unix)]
fn check_cache_dir(dir: &Path) -> std::result::Result<(), NativeBuildError> {
    use std::os::unix::fs::MetadataExt;

    let untrusted = |reason: &str| NativeBuildError::UntrustedCache {
        path: dir.to_path_buf(),
        reason: reason.to_string(),
    };

    // a file we just created carries our own uid
    let marker = tempfile::tempfile_in(dir).map_err(|_| untrusted("not writable by the current user"))?;
    let current_uid = marker.metadata().map_err(io_error(dir))?.uid();

    let meta = fs::metadata(dir).map_err(io_error(dir))?;
    if meta.uid() != current_uid {
        return Err(untrusted("owned by another user"));
    }
    if meta.mode() & 0o022 != 0 {
        return Err(untrusted("writable by group or others"));
    }
    Ok(())
}

#[cfg(not(unix))]
fn check_cache_dir(_dir: &Path) -> std::result::Result<(), NativeBuildError> {
    Ok(())
}

/// A cached library is only loaded when it is a regular file owned like `cache_dir`
#[cfg(unix)]
fn check_cached_artifact(artifact: &Path, cache_dir: &Path) -> std::result::Result<(), NativeBuildError> {
    use std::os::unix::fs::MetadataExt;

    let untrusted = |reason: &str| NativeBuildError::UntrustedCache {
        path: artifact.to_path_buf(),
        reason: reason.to_string(),
    };

    let owner = fs::metadata(cache_dir).map_err(io_error(cache_dir))?.uid();
    let meta = fs::symlink_metadata(artifact).map_err(io_error(artifact))?;
    if !meta.file_type().is_file() {
        return Err(untrusted("not a regular file"));
    }
    if meta.uid() != owner {
        return Err(untrusted("owned by another user"));
    }
    if meta.mode() & 0o022 != 0 {
        return Err(untrusted("writable by group or others"));
    }
    Ok(())
}

#[cfg(not(unix))]
fn check_cached_artifact(_artifact: &Path, _cache_dir: &Path) -> std::result::Result<(), NativeBuildError> {
    Ok(())
}

/// Compile `options.source` into `artifact`
/// Each build gets its own scratch directory under the cache, so concurrent
/// builds never share source or module files; the finished library is
/// renamed into place so a concurrent loader never sees a half-written file
fn build_artifact(options: &NativeOptions, artifact: &Path) -> std::result::Result<(), NativeBuildError> {
    let build_dir = tempfile::Builder::new()
        .prefix("build-")
        .tempdir_in(&options.cache_dir)
        .map_err(io_error(&options.cache_dir))?;

    let source_path = build_dir.path().join("dust_integrator.f90");
    fs::write(&source_path, &options.source).map_err(io_error(&source_path))?;

    let library_path = build_dir.path().join(format!(
        "{}dust_integrator{}",
        env::consts::DLL_PREFIX,
        env::consts::DLL_SUFFIX
    ));

    let output = Command::new(&options.compiler)
        .args(&options.flags)
        .arg(&source_path)
        .arg("-o")
        .arg(&library_path)
        .current_dir(build_dir.path()) // module files stay in the scratch directory
        .output();

    let output = match output {
        Ok(output) => output,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(NativeBuildError::ToolchainMissing {
                compiler: options.compiler.clone(),
            })
        }
        Err(e) => return Err(io_error(Path::new(&options.compiler))(e)),
    };

    if !output.status.success() {
        return Err(NativeBuildError::Compilation {
            status: output.status.to_string(),
            diagnostics: captured_output(&output.stdout, &output.stderr),
        });
    }
    if !library_path.is_file() {
        return Err(NativeBuildError::Compilation {
            status: output.status.to_string(),
            diagnostics: format!(
                "compiler reported success but produced no library\n{}",
                captured_output(&output.stdout, &output.stderr)
            ),
        });
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&library_path, fs::Permissions::from_mode(0o755))
            .map_err(io_error(&library_path))?;
    }

    fs::rename(&library_path, artifact).map_err(io_error(artifact))?;
    Ok(())
}

/// stdout and stderr of the compiler, trimmed and joined
fn captured_output(stdout: &[u8], stderr: &[u8]) -> String {
    let parts: Vec<String> = [stdout, stderr]
        .iter()
        .map(|bytes| String::from_utf8_lossy(bytes).trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    if parts.is_empty() {
        "(compiler produced no output)".to_string()
    } else {
        parts.join("\n")
    }
}
