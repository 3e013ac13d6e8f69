//! Portable ndarray engine
//!
//! Evaluates the derivative for the whole ensemble at once per RK4 stage.
//! Two evaluation paths exist and produce the same bits:
//! - `Fused`: one pass per particle through the `AccelSet` terms (default)
//! - `Broadcast`: whole-array ndarray expressions, column by column
//!
//! Picking a path only changes speed.

use log::debug;
use ndarray::{concatenate, s, stack, Array1, Array2, ArrayView2, Axis};

use crate::error::Result;
use crate::simulation::engine::Backend;
use crate::simulation::forces::{AccelSet, R_EPS};
use crate::simulation::integrator::integrate;
use crate::simulation::params::{BackendKind, SimulationConfig};
use crate::simulation::result::SimulationResult;
use crate::simulation::states::NVec3;

/// How the per-stage derivative is evaluated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DerivativePath {
    #[default]
    Fused,
    Broadcast,
}

#[derive(Debug, Clone, Default)]
pub struct VectorizedBackend {
    path: DerivativePath,
}

impl VectorizedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_path(path: DerivativePath) -> Self {
        Self { path }
    }

    pub fn path(&self) -> DerivativePath {
        self.path
    }
}

impl Backend for VectorizedBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Vectorized
    }

    fn run(&self, config: &SimulationConfig) -> Result<SimulationResult> {
        let initial = config.particles().initial_state();
        debug!(
            "Vectorized run: particles={}, steps={}, dt={}, path={:?}",
            initial.nrows(),
            config.num_steps(),
            config.time_step(),
            self.path
        );

        let state = match self.path {
            DerivativePath::Fused => {
                let forces = AccelSet::for_config(config);
                integrate(initial.view(), config.num_steps(), config.time_step(), |s| {
                    fused_derivative(&forces, s)
                })
            }
            DerivativePath::Broadcast => {
                let kernel = BroadcastKernel::new(config);
                integrate(initial.view(), config.num_steps(), config.time_step(), |s| {
                    kernel.derivative(s)
                })
            }
        };

        SimulationResult::new(config.times(), state, BackendKind::Vectorized)
    }
}

/// `[v, a]` for every row, with `a` from the acceleration set
fn fused_derivative(forces: &AccelSet, state: ArrayView2<f64>) -> Array2<f64> {
    let n = state.nrows();
    let x: Vec<NVec3> = state
        .rows()
        .into_iter()
        .map(|r| NVec3::new(r[0], r[1], r[2]))
        .collect();
    let v: Vec<NVec3> = state
        .rows()
        .into_iter()
        .map(|r| NVec3::new(r[3], r[4], r[5]))
        .collect();

    let mut acc = vec![NVec3::zeros(); n];
    forces.accumulate_accels(&x, &v, &mut acc);

    let mut out = Array2::zeros((n, 6));
    for (mut row, (vi, ai)) in out.rows_mut().into_iter().zip(v.iter().zip(acc.iter())) {
        row[0] = vi.x;
        row[1] = vi.y;
        row[2] = vi.z;
        row[3] = ai.x;
        row[4] = ai.y;
        row[5] = ai.z;
    }
    out
}

/// Per-run constants for the array form of the derivative
struct BroadcastKernel {
    gm: f64,
    q_over_m: Array2<f64>, // (n, 1) so it broadcasts across columns
    betas: Array1<f64>,
    e: Array1<f64>, // (3,) broadcast across rows
    b: [f64; 3],
}

impl BroadcastKernel {
    fn new(config: &SimulationConfig) -> Self {
        let e = config.electric_field();
        let b = config.magnetic_field();
        Self {
            gm: config.gm_sun(),
            q_over_m: config.q_over_m().insert_axis(Axis(1)),
            betas: Array1::from(config.particles().betas().to_vec()),
            e: Array1::from(vec![e.x, e.y, e.z]),
            b: [b.x, b.y, b.z],
        }
    }

    fn derivative(&self, state: ArrayView2<f64>) -> Array2<f64> {
        let pos = state.slice(s![.., 0..3]);
        let vel = state.slice(s![.., 3..6]);

        // gravity: pos * (-GM (1 - beta) / r^3)[:, None]
        let (px, py, pz) = (pos.column(0), pos.column(1), pos.column(2));
        let r = (&px * &px + &py * &py + &pz * &pz).mapv(f64::sqrt);
        let r3 = r.mapv(|r| if r > R_EPS { r * r * r } else { f64::INFINITY });
        let coeff = self.betas.mapv(|beta| -self.gm * (1.0 - beta)) / &r3;
        let grav = &pos * &coeff.insert_axis(Axis(1));

        // lorentz: (q/m)[:, None] * (E + v x B)
        let (vx, vy, vz) = (vel.column(0), vel.column(1), vel.column(2));
        let [bx, by, bz] = self.b;
        let cross = stack![
            Axis(1),
            &vy * bz - &vz * by,
            &vz * bx - &vx * bz,
            &vx * by - &vy * bx
        ];
        let lorentz = (&cross + &self.e) * &self.q_over_m;

        let acc = grav + lorentz;
        concatenate![Axis(1), vel, acc.view()]
    }
}
