//! Configuration types for loading dust scenarios from YAML.
//!
//! A scenario is a thin `serde` mirror of what the runner needs:
//!
//! - [`SimulationSection`] – backend choice, step count/size and the uniform fields
//! - [`ParticleConfig`]    – one explicitly listed grain
//! - [`RingConfig`]        – a generated ring of identical grains on a circle
//! - [`ScenarioConfig`]    – top-level wrapper
//!
//! # YAML format
//!
//! ```yaml
//! simulation:
//!   backend: "vectorized"     # native | vectorized | gpu
//!   num_steps: 500
//!   time_step: 60.0           # s
//!   gm_sun: 1.32712440018e20  # m^3 / s^2
//!   electric_field: [0.0, 0.0, 0.0]
//!   magnetic_field: [0.0, 0.0, 5.0e-9]
//!
//! particles:
//!   - x: [1.5e11, 0.0, 0.0]
//!     v: [0.0, 2.6e4, 0.0]
//!     q: 1.6e-19
//!     m: 1.0e-16
//!     beta: 0.1
//!
//! ring:
//!   count: 8
//!   radius: 1.5e11
//!   speed: 2.6e4
//!   charge: 1.6e-19
//!   mass: 1.0e-16
//!   beta: 0.1
//! ```
//!
//! Every scalar under `simulation` is optional and falls back to the builder
//! defaults. Listed particles come first, ring particles after them; at least
//! one of the two must be present.

use std::f64::consts::TAU;

use serde::Deserialize;

use crate::error::{DustError, Result};
use crate::simulation::params::{BackendKind, SimulationConfig};
use crate::simulation::states::{NVec3, ParticleEnsemble};

/// Global run parameters
#[derive(Deserialize, Debug, Clone, Default)]
pub struct SimulationSection {
    pub backend: Option<String>,          // backend name, aliases accepted
    pub num_steps: Option<usize>,         // recorded samples including the initial one
    pub time_step: Option<f64>,           // s
    pub gm_sun: Option<f64>,              // m^3 / s^2
    pub electric_field: Option<Vec<f64>>, // V/m
    pub magnetic_field: Option<Vec<f64>>, // T
}

/// Initial state of a single grain
#[derive(Deserialize, Debug, Clone)]
pub struct ParticleConfig {
    pub x: Vec<f64>, // position (m)
    pub v: Vec<f64>, // velocity (m/s)
    pub q: f64,      // charge (C)
    pub m: f64,      // mass (kg)
    #[serde(default)]
    pub beta: f64, // radiation pressure / gravity
}

/// `count` identical grains evenly spaced on a circle in the ecliptic plane,
/// each moving tangentially (counter-clockwise) at `speed`
#[derive(Deserialize, Debug, Clone)]
pub struct RingConfig {
    pub count: usize,
    pub radius: f64, // m
    pub speed: f64,  // m/s
    pub charge: f64, // C
    pub mass: f64,   // kg
    #[serde(default)]
    pub beta: f64,
}

impl RingConfig {
    fn rows(&self) -> impl Iterator<Item = (NVec3, NVec3)> + '_ {
        (0..self.count).map(move |i| {
            let theta = TAU * i as f64 / self.count as f64;
            let (sin, cos) = theta.sin_cos();
            (
                NVec3::new(self.radius * cos, self.radius * sin, 0.0),
                NVec3::new(-self.speed * sin, self.speed * cos, 0.0),
            )
        })
    }

    /// The ring on its own as a validated ensemble
    pub fn ensemble(&self) -> Result<ParticleEnsemble> {
        let (positions, velocities): (Vec<NVec3>, Vec<NVec3>) = self.rows().unzip();
        ParticleEnsemble::new(
            positions,
            velocities,
            vec![self.charge; self.count],
            vec![self.mass; self.count],
            vec![self.beta; self.count],
        )
    }
}

/// Top-level scenario configuration loaded from YAML
#[derive(Deserialize, Debug, Clone)]
pub struct ScenarioConfig {
    #[serde(default)]
    pub simulation: SimulationSection,
    #[serde(default)]
    pub particles: Vec<ParticleConfig>,
    pub ring: Option<RingConfig>,
}

impl ScenarioConfig {
    /// Parse a scenario document
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| DustError::validation(format!("malformed scenario: {e}")))
    }

    /// All grains of the scenario, listed ones first
    pub fn ensemble(&self) -> Result<ParticleEnsemble> {
        let mut positions = Vec::new();
        let mut velocities = Vec::new();
        let mut charges = Vec::new();
        let mut masses = Vec::new();
        let mut betas = Vec::new();

        for p in &self.particles {
            positions.push(p.x.clone());
            velocities.push(p.v.clone());
            charges.push(p.q);
            masses.push(p.m);
            betas.push(p.beta);
        }
        if let Some(ring) = &self.ring {
            for (x, v) in ring.rows() {
                positions.push(vec![x.x, x.y, x.z]);
                velocities.push(vec![v.x, v.y, v.z]);
                charges.push(ring.charge);
                masses.push(ring.mass);
                betas.push(ring.beta);
            }
        }

        ParticleEnsemble::from_rows(&positions, &velocities, &charges, &masses, &betas)
    }

    /// Map the scenario onto a validated runtime configuration
    pub fn into_simulation_config(self) -> Result<SimulationConfig> {
        let particles = self.ensemble()?;
        let sim = self.simulation;

        let mut builder = SimulationConfig::builder(particles);
        if let Some(name) = &sim.backend {
            builder = builder.backend(name.parse::<BackendKind>()?);
        }
        if let Some(num_steps) = sim.num_steps {
            builder = builder.num_steps(num_steps);
        }
        if let Some(time_step) = sim.time_step {
            builder = builder.time_step(time_step);
        }
        if let Some(gm_sun) = sim.gm_sun {
            builder = builder.gm_sun(gm_sun);
        }
        if let Some(e) = &sim.electric_field {
            builder = builder.electric_field(e);
        }
        if let Some(b) = &sim.magnetic_field {
            builder = builder.magnetic_field(b);
        }
        builder.build()
    }
}

