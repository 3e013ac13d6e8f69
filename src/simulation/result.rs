//! Simulation output: sample times plus the full trajectory tensor.
//!
//! `state` is shaped (num_steps, num_particles, 6) with columns 0..3 the
//! position and 3..6 the velocity, row-major regardless of which backend
//! produced it. The three stored fields are enough to rebuild every derived
//! view, which is what archive loaders rely on.

use ndarray::{s, Array1, Array2, Array3, ArrayView2, ArrayView3, Axis};

use crate::error::{DustError, Result};
use crate::simulation::params::BackendKind;

/// Number of f64 values in a (num_steps, num_particles, 6) trajectory,
/// or a numeric error for `backend` when that count does not fit in `usize`
pub fn trajectory_len(num_particles: usize, num_steps: usize, backend: BackendKind) -> Result<usize> {
    num_particles
        .checked_mul(num_steps)
        .and_then(|len| len.checked_mul(6))
        .ok_or_else(|| {
            DustError::numeric(
                backend,
                format!("trajectory of {num_particles} particles x {num_steps} steps overflows the address space"),
            )
        })
}

#[derive(Debug, Clone, PartialEq)]
pub struct SimulationResult {
    times: Array1<f64>,   // sample times, length num_steps
    state: Array3<f64>,   // (num_steps, num_particles, 6)
    backend: BackendKind, // engine that produced the run
}

impl SimulationResult {
    /// Wrap raw arrays, checking that they describe one consistent trajectory
    pub fn new(times: Array1<f64>, state: Array3<f64>, backend: BackendKind) -> Result<Self> {
        let (steps, _, cols) = state.dim();
        if cols != 6 {
            return Err(DustError::validation(format!(
                "state must have 6 columns per particle, got {cols}"
            )));
        }
        if steps == 0 {
            return Err(DustError::validation("state must hold at least one step"));
        }
        if times.len() != steps {
            return Err(DustError::validation(format!(
                "times has {} samples but state has {steps} steps",
                times.len()
            )));
        }
        Ok(Self { times, state, backend })
    }

    pub fn times(&self) -> &Array1<f64> {
        &self.times
    }

    pub fn state(&self) -> &Array3<f64> {
        &self.state
    }

    pub fn backend(&self) -> BackendKind {
        self.backend
    }

    /// state[:, :, 0:3]
    pub fn positions(&self) -> ArrayView3<'_, f64> {
        self.state.slice(s![.., .., 0..3])
    }

    /// state[:, :, 3:6]
    pub fn velocities(&self) -> ArrayView3<'_, f64> {
        self.state.slice(s![.., .., 3..6])
    }

    pub fn num_steps(&self) -> usize {
        self.state.len_of(Axis(0))
    }

    pub fn num_particles(&self) -> usize {
        self.state.len_of(Axis(1))
    }

    /// Last recorded row, shaped (num_particles, 6)
    pub fn final_state(&self) -> ArrayView2<'_, f64> {
        self.state.index_axis(Axis(0), self.num_steps() - 1)
    }

    /// Heliocentric distance of every particle at every step, (num_steps, num_particles)
    pub fn radial_distances(&self) -> Array2<f64> {
        self.positions()
            .map_axis(Axis(2), |p| (p[0] * p[0] + p[1] * p[1] + p[2] * p[2]).sqrt())
    }

    /// One-line human readable summary
    pub fn summary(&self) -> String {
        let radii = self.radial_distances();
        let final_radius = radii
            .index_axis(Axis(0), self.num_steps() - 1)
            .mean()
            .unwrap_or(f64::NAN);
        format!(
            "backend={}, particles={}, steps={}, span={:.3e} s, final mean radius={:.6e} m",
            self.backend,
            self.num_particles(),
            self.num_steps(),
            self.times[self.num_steps() - 1],
            final_radius
        )
    }
}
