//! Error types for dustsim.
//!
//! Callers at the runner boundary only need to match on [`DustError`]:
//! validation problems, a backend that cannot be brought up on this host,
//! or a failure while integrating. The backend-specific causes are kept as
//! `source` errors and keep the compiler or driver diagnostics.

use std::path::PathBuf;

use thiserror::Error;

use crate::simulation::params::BackendKind;

/// Top-level error returned by configuration builders, the registry and backends.
#[derive(Error, Debug)]
pub enum DustError {
    /// Malformed user input, raised before any numeric work starts
    #[error("invalid configuration: {0}")]
    Validation(String),

    /// The registry has no factory for this backend (programming error)
    #[error("unknown backend '{0}'")]
    UnknownBackend(String),

    /// The backend exists but cannot run on this host
    #[error("requested backend '{backend}' is unavailable: {source}")]
    BackendUnavailable {
        backend: BackendKind,
        #[source]
        source: BackendUnavailable,
    },

    /// Fatal failure during integration; no partial result is produced
    #[error("{backend} backend failed: {message}")]
    Numeric { backend: BackendKind, message: String },
}

impl DustError {
    /// Creates a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        DustError::Validation(message.into())
    }

    /// Creates a numeric runtime error for `backend`.
    pub fn numeric(backend: BackendKind, message: impl Into<String>) -> Self {
        DustError::Numeric {
            backend,
            message: message.into(),
        }
    }

    /// True when the error means "pick another backend" rather than "fix your input".
    pub fn is_unavailable(&self) -> bool {
        matches!(self, DustError::BackendUnavailable { .. })
    }
}

/// Why a backend could not be constructed.
#[derive(Error, Debug)]
pub enum BackendUnavailable {
    /// Building or loading the native integrator failed
    #[error(transparent)]
    Native(#[from] NativeBuildError),

    /// No usable GPU runtime (feature disabled, no adapter, no f64 shaders)
    #[error("GPU unavailable: {0}")]
    Gpu(String),
}

/// Failures of the native (Fortran) integrator build and load steps.
#[derive(Error, Debug)]
pub enum NativeBuildError {
    /// The compiler executable could not be spawned
    #[error(
        "Fortran compiler '{compiler}' was not found; install gfortran or point DUSTSIM_FC at a Fortran compiler"
    )]
    ToolchainMissing { compiler: String },

    /// The compiler ran and rejected the build
    #[error("native integrator failed to compile ({status}):\n{diagnostics}")]
    Compilation { status: String, diagnostics: String },

    /// The shared library exists but could not be loaded or lacks the entry point
    #[error("failed to load native integrator from {}: {reason}", .path.display())]
    Load { path: PathBuf, reason: String },

    /// The cache directory or a cached artifact could be replaced by another user
    #[error("refusing native cache at {}: {reason}", .path.display())]
    UntrustedCache { path: PathBuf, reason: String },

    /// Reading or writing the artifact cache failed
    #[error("native cache I/O error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, DustError>;
