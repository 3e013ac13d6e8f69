//! Run configuration for a dust ensemble integration
//!
//! `SimulationConfig` holds everything one run needs:
//! - the particle ensemble (owned),
//! - step count and fixed step size,
//! - solar gravitational parameter `gm_sun`,
//! - uniform electric and magnetic field vectors,
//! - which backend executes the run.
//!
//! All checks happen in [`SimulationConfigBuilder::build`]; a built config
//! is immutable.

use std::fmt;
use std::str::FromStr;

use ndarray::Array1;

use crate::error::{DustError, Result};
use crate::simulation::states::{NVec3, ParticleEnsemble};

/// Sun's gravitational parameter (m^3 s^-2)
pub const GM_SUN: f64 = 1.32712440018e20;

/// Execution engine for the integration kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BackendKind {
    #[default]
    Native, // runtime-compiled Fortran routine
    Vectorized, // ndarray engine
    Gpu, // wgpu compute shader
}

impl BackendKind {
    pub const ALL: [BackendKind; 3] = [BackendKind::Native, BackendKind::Vectorized, BackendKind::Gpu];

    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Native => "native",
            BackendKind::Vectorized => "vectorized",
            BackendKind::Gpu => "gpu",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = DustError;

    /// Accepts the canonical names plus the legacy `fortran` / `python` spellings
    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "native" | "fortran" => Ok(BackendKind::Native),
            "vectorized" | "python" => Ok(BackendKind::Vectorized),
            "gpu" => Ok(BackendKind::Gpu),
            other => Err(DustError::validation(format!(
                "unsupported backend '{other}' (expected one of native, vectorized, gpu)"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SimulationConfig {
    particles: ParticleEnsemble, // ensemble integrated by this run
    num_steps: usize,            // recorded samples, including t = 0
    time_step: f64,              // fixed step size (s)
    gm_sun: f64,                 // gravitational parameter
    electric_field: NVec3,       // uniform E
    magnetic_field: NVec3,       // uniform B
    backend: BackendKind,        // requested engine
}

impl SimulationConfig {
    /// Start a builder around `particles` with default scalars
    pub fn builder(particles: ParticleEnsemble) -> SimulationConfigBuilder {
        SimulationConfigBuilder::new(particles)
    }

    pub fn particles(&self) -> &ParticleEnsemble {
        &self.particles
    }

    pub fn num_steps(&self) -> usize {
        self.num_steps
    }

    pub fn time_step(&self) -> f64 {
        self.time_step
    }

    pub fn gm_sun(&self) -> f64 {
        self.gm_sun
    }

    pub fn electric_field(&self) -> NVec3 {
        self.electric_field
    }

    pub fn magnetic_field(&self) -> NVec3 {
        self.magnetic_field
    }

    pub fn backend(&self) -> BackendKind {
        self.backend
    }

    /// Total integrated time: `time_step * (num_steps - 1)`
    pub fn time_span(&self) -> f64 {
        self.time_step * (self.num_steps - 1) as f64
    }

    /// Sample times from 0 to `time_span`, one per recorded step
    pub fn times(&self) -> Array1<f64> {
        Array1::linspace(0.0, self.time_span(), self.num_steps)
    }

    /// Charge-to-mass ratio per particle
    pub fn q_over_m(&self) -> Array1<f64> {
        self.particles
            .charges()
            .iter()
            .zip(self.particles.masses())
            .map(|(q, m)| q / m)
            .collect()
    }

    /// Same configuration, different engine
    pub fn with_backend(&self, backend: BackendKind) -> Self {
        Self {
            backend,
            ..self.clone()
        }
    }
}

/// Collects raw user input for a [`SimulationConfig`]; nothing is checked until `build`
#[derive(Debug, Clone)]
pub struct SimulationConfigBuilder {
    particles: ParticleEnsemble,
    num_steps: usize,
    time_step: f64,
    gm_sun: f64,
    electric_field: Vec<f64>,
    magnetic_field: Vec<f64>,
    backend: BackendKind,
}

impl SimulationConfigBuilder {
    fn new(particles: ParticleEnsemble) -> Self {
        Self {
            particles,
            num_steps: 200,
            time_step: 60.0,
            gm_sun: GM_SUN,
            electric_field: vec![0.0; 3],
            magnetic_field: vec![0.0; 3],
            backend: BackendKind::default(),
        }
    }

    pub fn num_steps(mut self, num_steps: usize) -> Self {
        self.num_steps = num_steps;
        self
    }

    pub fn time_step(mut self, time_step: f64) -> Self {
        self.time_step = time_step;
        self
    }

    pub fn gm_sun(mut self, gm_sun: f64) -> Self {
        self.gm_sun = gm_sun;
        self
    }

    pub fn electric_field(mut self, field: &[f64]) -> Self {
        self.electric_field = field.to_vec();
        self
    }

    pub fn magnetic_field(mut self, field: &[f64]) -> Self {
        self.magnetic_field = field.to_vec();
        self
    }

    pub fn backend(mut self, backend: BackendKind) -> Self {
        self.backend = backend;
        self
    }

    /// Validate everything and freeze the configuration
    pub fn build(self) -> Result<SimulationConfig> {
        if self.num_steps <= 1 {
            return Err(DustError::validation(format!(
                "num_steps must be > 1 (got {})",
                self.num_steps
            )));
        }
        if !(self.time_step > 0.0) || !self.time_step.is_finite() {
            return Err(DustError::validation(format!(
                "time_step must be positive and finite (got {})",
                self.time_step
            )));
        }
        if !self.gm_sun.is_finite() {
            return Err(DustError::validation("gm_sun must be finite"));
        }
        let electric_field = field_vector("electric_field", &self.electric_field)?;
        let magnetic_field = field_vector("magnetic_field", &self.magnetic_field)?;

        Ok(SimulationConfig {
            particles: self.particles,
            num_steps: self.num_steps,
            time_step: self.time_step,
            gm_sun: self.gm_sun,
            electric_field,
            magnetic_field,
            backend: self.backend,
        })
    }
}

fn field_vector(name: &str, values: &[f64]) -> Result<NVec3> {
    match values {
        [x, y, z] if values.iter().all(|c| c.is_finite()) => Ok(NVec3::new(*x, *y, *z)),
        [_, _, _] => Err(DustError::validation(format!("{name} components must be finite"))),
        _ => Err(DustError::validation(format!(
            "{name}: expected sequence of length 3, got {}",
            values.len()
        ))),
    }
}
