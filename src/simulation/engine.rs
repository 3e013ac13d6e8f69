//! Backend selection and the runner
//!
//! `BackendRegistry` maps each `BackendKind` to a zero-argument factory.
//! Factories run at resolve time, so an expensive or fallible backend
//! (compiler, GPU device) is only brought up when it is actually requested.
//! `Runner` resolves the configured backend and forwards the run.

use std::collections::HashMap;

use log::{debug, info};

use crate::backends::{GpuBackend, NativeBackend, VectorizedBackend};
use crate::error::{BackendUnavailable, DustError, Result};
use crate::simulation::params::{BackendKind, SimulationConfig};
use crate::simulation::result::SimulationResult;

/// One execution engine for the RK4 kernel
pub trait Backend {
    /// Engine tag written into every result
    fn kind(&self) -> BackendKind;

    /// Integrate the whole configuration; never returns a partial result
    fn run(&self, config: &SimulationConfig) -> Result<SimulationResult>;
}

/// Builds a backend instance, probing its host requirements
pub type BackendFactory =
    Box<dyn Fn() -> std::result::Result<Box<dyn Backend>, BackendUnavailable> + Send + Sync>;

pub struct BackendRegistry {
    factories: HashMap<BackendKind, BackendFactory>,
}

impl BackendRegistry {
    /// Registry with no backends
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register (or replace) the factory for `kind`
    pub fn with<F>(mut self, kind: BackendKind, factory: F) -> Self
    where
        F: Fn() -> std::result::Result<Box<dyn Backend>, BackendUnavailable> + Send + Sync + 'static,
    {
        self.factories.insert(kind, Box::new(factory));
        self
    }

    pub fn contains(&self, kind: BackendKind) -> bool {
        self.factories.contains_key(&kind)
    }

    /// Instantiate the backend for `kind`
    /// - missing factory: `UnknownBackend` (the config enum should make this impossible)
    /// - factory failure: `BackendUnavailable` with the cause attached
    pub fn get(&self, kind: BackendKind) -> Result<Box<dyn Backend>> {
        let factory = self
            .factories
            .get(&kind)
            .ok_or_else(|| DustError::UnknownBackend(kind.to_string()))?;
        factory().map_err(|source| DustError::BackendUnavailable { backend: kind, source })
    }

    /// Try to build every registered backend and report which ones work here
    pub fn probe(&self) -> Vec<(BackendKind, std::result::Result<(), BackendUnavailable>)> {
        let mut kinds: Vec<BackendKind> = self.factories.keys().copied().collect();
        kinds.sort_by_key(|k| k.as_str());
        kinds
            .into_iter()
            .map(|kind| {
                let status = self.factories[&kind]().map(|_| ());
                (kind, status)
            })
            .collect()
    }
}

impl Default for BackendRegistry {
    /// native, vectorized and gpu with their default settings
    fn default() -> Self {
        BackendRegistry::empty()
            .with(BackendKind::Native, || {
                Ok(Box::new(NativeBackend::new()?) as Box<dyn Backend>)
            })
            .with(BackendKind::Vectorized, || {
                Ok(Box::new(VectorizedBackend::new()) as Box<dyn Backend>)
            })
            .with(BackendKind::Gpu, || {
                Ok(Box::new(GpuBackend::new()?) as Box<dyn Backend>)
            })
    }
}

/// Front door used by the CLI and any presentation layer
pub struct Runner {
    registry: BackendRegistry,
}

impl Runner {
    pub fn new(registry: BackendRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &BackendRegistry {
        &self.registry
    }

    /// Resolve the configured backend and run it; the config is consumed by the run
    pub fn run(&self, config: SimulationConfig) -> Result<SimulationResult> {
        info!(
            "Running simulation with backend={} particles={} steps={}",
            config.backend(),
            config.particles().count(),
            config.num_steps()
        );
        let backend = self.registry.get(config.backend())?;
        debug!("Resolved backend {}", backend.kind());

        let result = backend.run(&config)?;
        info!("Simulation finished: {}", result.summary());
        Ok(result)
    }
}

impl Default for Runner {
    fn default() -> Self {
        Self::new(BackendRegistry::default())
    }
}
