pub mod error;
pub mod simulation;
pub mod backends;
pub mod configuration;
pub mod benchmark;

pub use error::{BackendUnavailable, DustError, NativeBuildError, Result};

pub use simulation::states::{ParticleEnsemble, NVec3};
pub use simulation::params::{BackendKind, SimulationConfig, SimulationConfigBuilder, GM_SUN};
pub use simulation::forces::{Acceleration, AccelSet, SolarGravity, LorentzForce};
pub use simulation::integrator::{integrate, rk4_step};
pub use simulation::engine::{Backend, BackendFactory, BackendRegistry, Runner};
pub use simulation::result::SimulationResult;

pub use backends::{DerivativePath, GpuBackend, NativeBackend, NativeOptions, VectorizedBackend};

pub use configuration::config::{ParticleConfig, RingConfig, ScenarioConfig, SimulationSection};

pub use benchmark::benchmark::{bench_backends, BenchRecord};
