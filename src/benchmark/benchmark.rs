use std::time::Instant;

use log::warn;

use crate::configuration::config::RingConfig;
use crate::error::Result;
use crate::simulation::engine::BackendRegistry;
use crate::simulation::params::{BackendKind, SimulationConfig};

/// One timed run
#[derive(Debug, Clone)]
pub struct BenchRecord {
    pub backend: BackendKind,
    pub particles: usize,
    pub steps: usize,
    pub seconds: f64,       // wall time of `run`, backend construction excluded
    pub max_deviation: f64, // largest |state - vectorized state| over the whole history
}

/// Helper to build a ring of `n` grains at 1 AU
fn make_ring_config(n: usize, steps: usize) -> Result<SimulationConfig> {
    let ring = RingConfig {
        count: n,
        radius: 1.5e11,
        speed: 2.6e4,
        charge: 1.6e-19,
        mass: 1.0e-16,
        beta: 0.1,
    };
    SimulationConfig::builder(ring.ensemble()?)
        .num_steps(steps)
        .time_step(60.0)
        .magnetic_field(&[0.0, 0.0, 5.0e-9])
        .build()
}

/// Time every backend the registry can bring up on rings of the given sizes.
/// The vectorized engine is the reference for the deviation column; registered
/// backends that are unavailable on this host are skipped with a warning.
pub fn bench_backends(registry: &BackendRegistry, sizes: &[usize], steps: usize) -> Result<Vec<BenchRecord>> {
    let reference = registry.get(BackendKind::Vectorized)?;

    let mut backends = Vec::new();
    for kind in BackendKind::ALL.into_iter().filter(|k| registry.contains(*k)) {
        match registry.get(kind) {
            Ok(backend) => backends.push(backend),
            Err(e) if e.is_unavailable() => warn!("Skipping {kind}: {e}"),
            Err(e) => return Err(e),
        }
    }

    let mut records = Vec::new();
    for &n in sizes {
        let config = make_ring_config(n, steps)?;
        let expected = reference.run(&config)?;

        for backend in &backends {
            // Warm up
            backend.run(&config)?;

            let t0 = Instant::now();
            let result = backend.run(&config)?;
            let seconds = t0.elapsed().as_secs_f64();

            let max_deviation = (result.state() - expected.state())
                .iter()
                .fold(0.0_f64, |acc, d| acc.max(d.abs()));

            records.push(BenchRecord {
                backend: backend.kind(),
                particles: n,
                steps,
                seconds,
                max_deviation,
            });
        }
    }
    Ok(records)
}
