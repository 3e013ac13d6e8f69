//! Particle ensemble: the initial state of every dust grain in a run.
//!
//! An ensemble is validated once when it is built and never changes
//! afterwards. Each particle carries:
//! - position `x` and velocity `v` as `NVec3` (m, m/s),
//! - charge `q` (C), mass `m` (kg, strictly positive),
//! - radiation-pressure ratio `beta` (dimensionless).

use nalgebra::Vector3;
use ndarray::Array2;

use crate::error::{DustError, Result};

pub type NVec3 = Vector3<f64>;

#[derive(Debug, Clone, PartialEq)]
pub struct ParticleEnsemble {
    positions: Vec<NVec3>,  // initial positions
    velocities: Vec<NVec3>, // initial velocities
    charges: Vec<f64>,      // charge per particle
    masses: Vec<f64>,       // mass per particle, > 0
    betas: Vec<f64>,        // radiation pressure / gravity ratio
}

impl ParticleEnsemble {
    /// Build an ensemble from typed 3-vectors.
    ///
    /// Fails with [`DustError::Validation`] when the five sequences disagree
    /// in length, the ensemble is empty, a mass is not strictly positive, or
    /// any value is not finite.
    pub fn new(
        positions: Vec<NVec3>,
        velocities: Vec<NVec3>,
        charges: Vec<f64>,
        masses: Vec<f64>,
        betas: Vec<f64>,
    ) -> Result<Self> {
        let n = positions.len();
        if n == 0 {
            return Err(DustError::validation("ensemble must contain at least one particle"));
        }
        if velocities.len() != n {
            return Err(DustError::validation(format!(
                "positions and velocities must share the same shape ({} vs {} rows)",
                n,
                velocities.len()
            )));
        }
        for (name, len) in [
            ("charges", charges.len()),
            ("masses", masses.len()),
            ("betas", betas.len()),
        ] {
            if len != n {
                return Err(DustError::validation(format!(
                    "{name} length {len} does not match {n} particles"
                )));
            }
        }

        // `!(m > 0.0)` also rejects NaN
        if let Some(i) = masses.iter().position(|&m| !(m > 0.0)) {
            return Err(DustError::validation(format!(
                "mass values must be strictly positive (particle {i} has {})",
                masses[i]
            )));
        }

        let vectors_finite = |rows: &[NVec3]| rows.iter().all(|r| r.iter().all(|c| c.is_finite()));
        if !vectors_finite(&positions) || !vectors_finite(&velocities) {
            return Err(DustError::validation("positions and velocities must be finite"));
        }
        for (name, values) in [("charges", &charges), ("masses", &masses), ("betas", &betas)] {
            if values.iter().any(|v| !v.is_finite()) {
                return Err(DustError::validation(format!("{name} must be finite")));
            }
        }

        Ok(Self {
            positions,
            velocities,
            charges,
            masses,
            betas,
        })
    }

    /// Build an ensemble from untyped rows, as handed over by forms, CLI
    /// flags or scenario files. Every position/velocity row must have
    /// exactly three components.
    pub fn from_rows(
        positions: &[Vec<f64>],
        velocities: &[Vec<f64>],
        charges: &[f64],
        masses: &[f64],
        betas: &[f64],
    ) -> Result<Self> {
        let to_vectors = |name: &str, rows: &[Vec<f64>]| -> Result<Vec<NVec3>> {
            rows.iter()
                .enumerate()
                .map(|(i, row)| match row.as_slice() {
                    [x, y, z] => Ok(NVec3::new(*x, *y, *z)),
                    _ => Err(DustError::validation(format!(
                        "{name} must be shaped (n_particles, 3); row {i} has {} columns",
                        row.len()
                    ))),
                })
                .collect()
        };

        Self::new(
            to_vectors("positions", positions)?,
            to_vectors("velocities", velocities)?,
            charges.to_vec(),
            masses.to_vec(),
            betas.to_vec(),
        )
    }

    /// Number of particles
    pub fn count(&self) -> usize {
        self.positions.len()
    }

    pub fn positions(&self) -> &[NVec3] {
        &self.positions
    }

    pub fn velocities(&self) -> &[NVec3] {
        &self.velocities
    }

    pub fn charges(&self) -> &[f64] {
        &self.charges
    }

    pub fn masses(&self) -> &[f64] {
        &self.masses
    }

    pub fn betas(&self) -> &[f64] {
        &self.betas
    }

    /// Concatenated `[x, v]` matrix shaped (n_particles, 6)
    pub fn initial_state(&self) -> Array2<f64> {
        let mut state = Array2::zeros((self.count(), 6));
        for (mut row, (x, v)) in state
            .rows_mut()
            .into_iter()
            .zip(self.positions.iter().zip(self.velocities.iter()))
        {
            row[0] = x.x;
            row[1] = x.y;
            row[2] = x.z;
            row[3] = v.x;
            row[4] = v.y;
            row[5] = v.z;
        }
        state
    }
}
