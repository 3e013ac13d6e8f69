//! Acceleration contributors for charged dust grains
//!
//! Each grain feels two independent terms:
//! - solar gravity reduced by radiation pressure (`SolarGravity`),
//! - the Lorentz force of uniform E and B fields (`LorentzForce`).
//!
//! Grains do not interact with each other, so every term is a per-particle
//! map. The arithmetic here is the reference form of the kernel; the
//! broadcast, Fortran and WGSL versions repeat it operation for operation.

use crate::simulation::params::SimulationConfig;
use crate::simulation::states::NVec3;

/// Below this heliocentric distance r^3 is treated as infinite
pub const R_EPS: f64 = 1e-12;

/// Collection of acceleration terms
/// Each term implements [`Acceleration`] and their contributions are summed
/// into a single acceleration vector per particle
pub struct AccelSet {
    terms: Vec<Box<dyn Acceleration + Send + Sync>>,
}

impl AccelSet {
    /// Create an empty acceleration set
    pub fn new() -> Self {
        Self { terms: Vec::new() }
    }

    /// Add an acceleration term
    pub fn with(mut self, term: impl Acceleration + Send + Sync + 'static) -> Self {
        self.terms.push(Box::new(term));
        self
    }

    /// Gravity + radiation pressure followed by the Lorentz term, as used by every backend
    pub fn for_config(config: &SimulationConfig) -> Self {
        let particles = config.particles();
        AccelSet::new()
            .with(SolarGravity {
                gm: config.gm_sun(),
                betas: particles.betas().to_vec(),
            })
            .with(LorentzForce {
                q_over_m: config.q_over_m().to_vec(),
                e: config.electric_field(),
                b: config.magnetic_field(),
            })
    }

    /// Compute total accelerations for particles at positions `x` moving with `v`
    /// - `out[i]` will be set to the sum of contributions from all terms
    pub fn accumulate_accels(&self, x: &[NVec3], v: &[NVec3], out: &mut [NVec3]) {
        // Zero buffer
        for a in out.iter_mut() {
            *a = NVec3::zeros();
        }
        // Terms are summed in registration order
        for term in &self.terms {
            term.acceleration(x, v, out);
        }
    }
}

impl Default for AccelSet {
    fn default() -> Self {
        Self::new()
    }
}

/// Trait for acceleration sources
/// Implementations add their contribution into `out[i]` for each particle
pub trait Acceleration {
    fn acceleration(&self, x: &[NVec3], v: &[NVec3], out: &mut [NVec3]);
}

/// Central gravity scaled by (1 - beta) for radiation pressure
pub struct SolarGravity {
    pub gm: f64,         // gravitational parameter of the central body
    pub betas: Vec<f64>, // per-particle radiation pressure ratio
}

impl Acceleration for SolarGravity {
    fn acceleration(&self, x: &[NVec3], _v: &[NVec3], out: &mut [NVec3]) {
        for ((xi, beta), a) in x.iter().zip(&self.betas).zip(out.iter_mut()) {
            let coeff = gravity_coefficient(self.gm, *beta, xi);

            // a = -GM (1 - beta) / r^3 * x
            *a += xi * coeff;
        }
    }
}

/// `-GM (1 - beta) / r^3`, zero when the particle sits on the origin
#[inline]
pub fn gravity_coefficient(gm: f64, beta: f64, x: &NVec3) -> f64 {
    // |x| written out so every backend sums the squares in the same order
    let r = (x.x * x.x + x.y * x.y + x.z * x.z).sqrt();
    let r3 = if r > R_EPS { r * r * r } else { f64::INFINITY };
    (-gm * (1.0 - beta)) / r3
}

/// Lorentz acceleration (q/m)(E + v x B) in uniform fields
pub struct LorentzForce {
    pub q_over_m: Vec<f64>, // charge-to-mass ratio per particle
    pub e: NVec3,           // electric field
    pub b: NVec3,           // magnetic field
}

impl Acceleration for LorentzForce {
    fn acceleration(&self, _x: &[NVec3], v: &[NVec3], out: &mut [NVec3]) {
        for ((vi, qm), a) in v.iter().zip(&self.q_over_m).zip(out.iter_mut()) {
            let cross = NVec3::new(
                vi.y * self.b.z - vi.z * self.b.y,
                vi.z * self.b.x - vi.x * self.b.z,
                vi.x * self.b.y - vi.y * self.b.x,
            );
            *a += (self.e + cross) * *qm;
        }
    }
}
