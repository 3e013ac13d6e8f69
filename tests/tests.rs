use dustsim::backends::gpu::GpuBackend;
use dustsim::backends::native::{NativeBackend, NativeOptions};
use dustsim::backends::vectorized::{DerivativePath, VectorizedBackend};
use dustsim::configuration::config::{RingConfig, ScenarioConfig};
use dustsim::error::{BackendUnavailable, DustError, NativeBuildError};
use dustsim::simulation::engine::{Backend, BackendRegistry, Runner};
use dustsim::simulation::forces::{AccelSet, LorentzForce, SolarGravity};
use dustsim::simulation::params::{BackendKind, SimulationConfig, GM_SUN};
use dustsim::simulation::result::{trajectory_len, SimulationResult};
use dustsim::simulation::states::{NVec3, ParticleEnsemble};
use dustsim::bench_backends;

use ndarray::{Array1, Array3, Axis};

/// Single grain with the given state and properties
pub fn single_particle(x: [f64; 3], v: [f64; 3], q: f64, m: f64, beta: f64) -> ParticleEnsemble {
    ParticleEnsemble::new(vec![x.into()], vec![v.into()], vec![q], vec![m], vec![beta]).unwrap()
}

/// Uncharged grain on a unit circular orbit around GM = 1
pub fn circular_config(backend: BackendKind) -> SimulationConfig {
    SimulationConfig::builder(single_particle([1.0, 0.0, 0.0], [0.0, 1.0, 0.0], 0.0, 1.0, 0.0))
        .num_steps(10)
        .time_step(0.01)
        .gm_sun(1.0)
        .backend(backend)
        .build()
        .unwrap()
}

/// A few charged grains in normalised units with both fields switched on
pub fn charged_config(backend: BackendKind) -> SimulationConfig {
    let particles = ParticleEnsemble::new(
        vec![[1.0, 0.0, 0.0].into(), [0.0, 1.2, 0.1].into(), [-0.8, -0.3, 0.0].into()],
        vec![[0.0, 1.0, 0.0].into(), [-0.9, 0.0, 0.05].into(), [0.2, -1.1, 0.0].into()],
        vec![0.2, -0.1, 0.05],
        vec![1.0, 0.5, 2.0],
        vec![0.0, 0.3, 0.9],
    )
    .unwrap();
    SimulationConfig::builder(particles)
        .num_steps(50)
        .time_step(0.01)
        .gm_sun(1.0)
        .electric_field(&[0.01, 0.0, -0.02])
        .magnetic_field(&[0.0, 0.1, 0.5])
        .backend(backend)
        .build()
        .unwrap()
}

/// Registry holding only the ndarray engine
pub fn vectorized_registry() -> BackendRegistry {
    BackendRegistry::empty().with(BackendKind::Vectorized, || {
        Ok(Box::new(VectorizedBackend::new()) as Box<dyn Backend>)
    })
}

/// Largest element-wise difference relative to the magnitude of the values
pub fn max_relative_deviation(a: &Array3<f64>, b: &Array3<f64>) -> f64 {
    assert_eq!(a.dim(), b.dim());
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y).abs() / x.abs().max(y.abs()).max(1.0))
        .fold(0.0, f64::max)
}

/// Place a non-library file where the cache expects the artifact, closed to group and others
fn write_junk_artifact(path: &std::path::Path) {
    std::fs::write(path, b"not a shared library").unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o644)).unwrap();
    }
}

fn run_vectorized(config: &SimulationConfig) -> SimulationResult {
    VectorizedBackend::new().run(config).unwrap()
}

// ==================================================================================
// Ensemble and configuration validation
// ==================================================================================

#[test]
fn ensemble_rejects_mismatched_lengths() {
    let err = ParticleEnsemble::new(
        vec![NVec3::zeros(), NVec3::zeros()],
        vec![NVec3::zeros()],
        vec![0.0, 0.0],
        vec![1.0, 1.0],
        vec![0.0, 0.0],
    )
    .unwrap_err();
    assert!(matches!(err, DustError::Validation(_)), "got {err:?}");

    let err = ParticleEnsemble::new(
        vec![NVec3::zeros()],
        vec![NVec3::zeros()],
        vec![0.0, 1.0],
        vec![1.0],
        vec![0.0],
    )
    .unwrap_err();
    assert!(matches!(err, DustError::Validation(_)));
}

#[test]
fn ensemble_rejects_empty_nonpositive_mass_and_nan() {
    let empty = ParticleEnsemble::new(vec![], vec![], vec![], vec![], vec![]);
    assert!(matches!(empty, Err(DustError::Validation(_))));

    for m in [0.0, -1.0, f64::NAN] {
        let err = ParticleEnsemble::new(
            vec![[1.0, 0.0, 0.0].into()],
            vec![NVec3::zeros()],
            vec![0.0],
            vec![m],
            vec![0.0],
        );
        assert!(matches!(err, Err(DustError::Validation(_))), "mass {m} accepted");
    }

    let err = ParticleEnsemble::new(
        vec![[f64::NAN, 0.0, 0.0].into()],
        vec![NVec3::zeros()],
        vec![0.0],
        vec![1.0],
        vec![0.0],
    );
    assert!(matches!(err, Err(DustError::Validation(_))));
}

#[test]
fn ensemble_rows_must_have_three_columns() {
    let err = ParticleEnsemble::from_rows(
        &[vec![1.0, 0.0]],
        &[vec![0.0, 1.0, 0.0]],
        &[0.0],
        &[1.0],
        &[0.0],
    )
    .unwrap_err();
    assert!(matches!(err, DustError::Validation(_)));

    let ok = ParticleEnsemble::from_rows(
        &[vec![1.0, 2.0, 3.0]],
        &[vec![4.0, 5.0, 6.0]],
        &[1.0],
        &[2.0],
        &[0.5],
    )
    .unwrap();
    let state = ok.initial_state();
    assert_eq!(state.dim(), (1, 6));
    assert_eq!(state.row(0).to_vec(), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
}

#[test]
fn config_step_count_boundary() {
    let p = || single_particle([1.0, 0.0, 0.0], [0.0, 1.0, 0.0], 0.0, 1.0, 0.0);

    let one = SimulationConfig::builder(p()).num_steps(1).build();
    assert!(matches!(one, Err(DustError::Validation(_))));

    let two = SimulationConfig::builder(p()).num_steps(2).build().unwrap();
    assert_eq!(two.num_steps(), 2);
}

#[test]
fn config_rejects_bad_time_step_and_fields() {
    let p = || single_particle([1.0, 0.0, 0.0], [0.0, 1.0, 0.0], 0.0, 1.0, 0.0);

    for dt in [0.0, -60.0, f64::NAN, f64::INFINITY] {
        let err = SimulationConfig::builder(p()).time_step(dt).build();
        assert!(matches!(err, Err(DustError::Validation(_))), "time_step {dt} accepted");
    }

    let short = SimulationConfig::builder(p()).electric_field(&[1.0, 2.0]).build();
    assert!(matches!(short, Err(DustError::Validation(_))));

    let long = SimulationConfig::builder(p()).magnetic_field(&[0.0, 0.0, 1.0, 0.0]).build();
    assert!(matches!(long, Err(DustError::Validation(_))));

    let nan = SimulationConfig::builder(p()).magnetic_field(&[0.0, f64::NAN, 0.0]).build();
    assert!(matches!(nan, Err(DustError::Validation(_))));
}

#[test]
fn config_defaults_and_derived_values() {
    let config = SimulationConfig::builder(single_particle(
        [1.5e11, 0.0, 0.0],
        [0.0, 2.6e4, 0.0],
        1.6e-19,
        1.0e-16,
        0.1,
    ))
    .build()
    .unwrap();

    assert_eq!(config.num_steps(), 200);
    assert_eq!(config.time_step(), 60.0);
    assert_eq!(config.gm_sun(), GM_SUN);
    assert_eq!(config.backend(), BackendKind::Native);
    assert_eq!(config.electric_field(), NVec3::zeros());
    assert!((config.time_span() - 60.0 * 199.0).abs() < 1e-9);

    let times = config.times();
    assert_eq!(times.len(), 200);
    assert_eq!(times[0], 0.0);
    assert!((times[199] - config.time_span()).abs() < 1e-9);

    let qm = config.q_over_m();
    assert!((qm[0] - 1.6e-3).abs() < 1e-15);

    let moved = config.with_backend(BackendKind::Vectorized);
    assert_eq!(moved.backend(), BackendKind::Vectorized);
    assert_eq!(moved.particles(), config.particles());
}

#[test]
fn backend_names_and_aliases() {
    assert_eq!("native".parse::<BackendKind>().unwrap(), BackendKind::Native);
    assert_eq!("fortran".parse::<BackendKind>().unwrap(), BackendKind::Native);
    assert_eq!("Vectorized".parse::<BackendKind>().unwrap(), BackendKind::Vectorized);
    assert_eq!("python".parse::<BackendKind>().unwrap(), BackendKind::Vectorized);
    assert_eq!(" gpu ".parse::<BackendKind>().unwrap(), BackendKind::Gpu);

    let err = "cuda".parse::<BackendKind>().unwrap_err();
    assert!(matches!(err, DustError::Validation(_)));
    assert!(err.to_string().contains("cuda"));

    for kind in BackendKind::ALL {
        assert_eq!(kind.to_string().parse::<BackendKind>().unwrap(), kind);
    }
}

// ==================================================================================
// Force tests
// ==================================================================================

#[test]
fn gravity_points_to_sun_and_scales_with_beta() {
    let x = vec![NVec3::new(2.0, 0.0, 0.0)];
    let v = vec![NVec3::zeros()];

    let mut full = vec![NVec3::zeros(); 1];
    AccelSet::new()
        .with(SolarGravity { gm: 1.0, betas: vec![0.0] })
        .accumulate_accels(&x, &v, &mut full);
    assert!((full[0].x + 0.25).abs() < 1e-15, "expected -GM/r^2, got {:?}", full[0]);
    assert_eq!(full[0].y, 0.0);

    let mut reduced = vec![NVec3::zeros(); 1];
    AccelSet::new()
        .with(SolarGravity { gm: 1.0, betas: vec![0.6] })
        .accumulate_accels(&x, &v, &mut reduced);
    assert!((reduced[0].x - 0.4 * full[0].x).abs() < 1e-15);

    let mut cancelled = vec![NVec3::zeros(); 1];
    AccelSet::new()
        .with(SolarGravity { gm: 1.0, betas: vec![1.0] })
        .accumulate_accels(&x, &v, &mut cancelled);
    assert_eq!(cancelled[0].norm(), 0.0);
}

#[test]
fn gravity_at_origin_is_zero_not_nan() {
    let mut acc = vec![NVec3::new(9.0, 9.0, 9.0); 1];
    AccelSet::new()
        .with(SolarGravity { gm: GM_SUN, betas: vec![0.0] })
        .accumulate_accels(&[NVec3::zeros()], &[NVec3::zeros()], &mut acc);
    assert!(acc[0].iter().all(|c| c.is_finite()));
    assert_eq!(acc[0].norm(), 0.0);
}

#[test]
fn lorentz_force_is_perpendicular_to_velocity_in_pure_b() {
    let force = LorentzForce {
        q_over_m: vec![2.0],
        e: NVec3::zeros(),
        b: NVec3::new(0.0, 0.0, 3.0),
    };
    let v = vec![NVec3::new(1.0, 0.5, 0.0)];
    let mut acc = vec![NVec3::zeros(); 1];
    AccelSet::new().with(force).accumulate_accels(&[NVec3::zeros()], &v, &mut acc);

    // (q/m) v x B = 2 * (0.5*3, -1*3, 0)
    assert_eq!(acc[0], NVec3::new(3.0, -6.0, 0.0));
    assert!(acc[0].dot(&v[0]).abs() < 1e-12);
}

#[test]
fn accel_set_sums_terms() {
    let config = charged_config(BackendKind::Vectorized);
    let particles = config.particles();
    let n = particles.count();

    let mut total = vec![NVec3::zeros(); n];
    AccelSet::for_config(&config).accumulate_accels(particles.positions(), particles.velocities(), &mut total);

    let mut grav = vec![NVec3::zeros(); n];
    AccelSet::new()
        .with(SolarGravity { gm: config.gm_sun(), betas: particles.betas().to_vec() })
        .accumulate_accels(particles.positions(), particles.velocities(), &mut grav);

    let mut lorentz = vec![NVec3::zeros(); n];
    AccelSet::new()
        .with(LorentzForce {
            q_over_m: config.q_over_m().to_vec(),
            e: config.electric_field(),
            b: config.magnetic_field(),
        })
        .accumulate_accels(particles.positions(), particles.velocities(), &mut lorentz);

    for i in 0..n {
        assert!((total[i] - (grav[i] + lorentz[i])).norm() < 1e-15);
    }
}

// ==================================================================================
// Integrator tests (vectorized engine)
// ==================================================================================

#[test]
fn result_shape_and_initial_row() {
    let config = charged_config(BackendKind::Vectorized);
    let result = run_vectorized(&config);

    assert_eq!(result.state().dim(), (50, 3, 6));
    assert_eq!(result.times().len(), 50);
    assert_eq!(result.backend(), BackendKind::Vectorized);
    assert_eq!(result.state().index_axis(Axis(0), 0), config.particles().initial_state());
    assert!(result.state().iter().all(|v| v.is_finite()));
}

#[test]
fn circular_orbit_keeps_its_radius() {
    let result = run_vectorized(&circular_config(BackendKind::Vectorized));
    let radii = result.radial_distances();
    for r in radii.iter() {
        assert!((r - 1.0).abs() < 0.01, "radius drifted to {r}");
    }
}

#[test]
fn uniform_electric_field_gives_constant_acceleration() {
    // gm = 0: x(t) = x0 + v0 t + a t^2 / 2, which RK4 integrates exactly
    let config = SimulationConfig::builder(single_particle([0.0, 0.0, 0.0], [1.0, 0.0, 0.0], 2.0, 4.0, 0.0))
        .num_steps(21)
        .time_step(0.1)
        .gm_sun(0.0)
        .electric_field(&[0.0, 3.0, 0.0])
        .build()
        .unwrap();
    let result = run_vectorized(&config);

    let t = config.time_span();
    let last = result.final_state();
    let a = 0.5 * 3.0;
    assert!((last[[0, 0]] - t).abs() < 1e-9);
    assert!((last[[0, 1]] - 0.5 * a * t * t).abs() < 1e-9);
    assert!((last[[0, 4]] - a * t).abs() < 1e-9);
}

#[test]
fn pure_magnetic_field_preserves_speed() {
    let config = SimulationConfig::builder(single_particle([0.0, 0.0, 0.0], [1.0, 0.0, 0.2], 1.0, 1.0, 0.0))
        .num_steps(200)
        .time_step(0.01)
        .gm_sun(0.0)
        .magnetic_field(&[0.0, 0.0, 2.0])
        .build()
        .unwrap();
    let result = run_vectorized(&config);

    for step in result.velocities().outer_iter() {
        let v = step.row(0);
        let speed = (v[0] * v[0] + v[1] * v[1] + v[2] * v[2]).sqrt();
        assert!((speed - 1.04f64.sqrt()).abs() < 1e-6, "speed drifted to {speed}");
        // B along z leaves v_z alone
        assert!((v[2] - 0.2).abs() < 1e-12);
    }
}

#[test]
fn vectorized_runs_are_deterministic() {
    let config = charged_config(BackendKind::Vectorized);
    let a = run_vectorized(&config);
    let b = run_vectorized(&config);
    assert_eq!(a, b);
}

#[test]
fn fused_and_broadcast_paths_agree_bitwise() {
    let config = charged_config(BackendKind::Vectorized);
    let fused = VectorizedBackend::with_path(DerivativePath::Fused).run(&config).unwrap();
    let broadcast = VectorizedBackend::with_path(DerivativePath::Broadcast).run(&config).unwrap();
    assert_eq!(fused.state(), broadcast.state());
}

// ==================================================================================
// Result container tests
// ==================================================================================

#[test]
fn result_new_checks_consistency() {
    let ok = SimulationResult::new(Array1::linspace(0.0, 1.0, 3), Array3::zeros((3, 2, 6)), BackendKind::Gpu);
    assert!(ok.is_ok());

    let bad_cols = SimulationResult::new(Array1::zeros(3), Array3::zeros((3, 2, 5)), BackendKind::Gpu);
    assert!(matches!(bad_cols, Err(DustError::Validation(_))));

    let bad_times = SimulationResult::new(Array1::zeros(4), Array3::zeros((3, 2, 6)), BackendKind::Gpu);
    assert!(matches!(bad_times, Err(DustError::Validation(_))));
}

#[test]
fn trajectory_len_reports_overflow_as_numeric() {
    assert_eq!(trajectory_len(3, 10, BackendKind::Native).unwrap(), 180);

    let err = trajectory_len(usize::MAX / 2, 3, BackendKind::Native).err().unwrap();
    assert!(
        matches!(err, DustError::Numeric { backend: BackendKind::Native, .. }),
        "got {err:?}"
    );
    let err = trajectory_len(usize::MAX, usize::MAX, BackendKind::Gpu).err().unwrap();
    assert!(matches!(err, DustError::Numeric { backend: BackendKind::Gpu, .. }), "got {err:?}");
}

#[test]
fn result_views_and_summary() {
    let result = run_vectorized(&circular_config(BackendKind::Vectorized));

    assert_eq!(result.num_steps(), 10);
    assert_eq!(result.num_particles(), 1);
    assert_eq!(result.positions().dim(), (10, 1, 3));
    assert_eq!(result.velocities().dim(), (10, 1, 3));
    assert_eq!(result.radial_distances().dim(), (10, 1));
    assert_eq!(result.radial_distances()[[0, 0]], 1.0);

    let rebuilt = SimulationResult::new(result.times().clone(), result.state().clone(), result.backend()).unwrap();
    assert_eq!(rebuilt, result);

    let summary = result.summary();
    assert!(summary.contains("backend=vectorized"), "{summary}");
    assert!(summary.contains("particles=1"), "{summary}");
    assert!(summary.contains("steps=10"), "{summary}");
}

// ==================================================================================
// Registry and runner tests
// ==================================================================================

#[test]
fn runner_uses_configured_backend() {
    let runner = Runner::new(vectorized_registry());
    let result = runner.run(circular_config(BackendKind::Vectorized)).unwrap();
    assert_eq!(result.backend(), BackendKind::Vectorized);
}

#[test]
fn missing_factory_is_unknown_backend() {
    let runner = Runner::new(BackendRegistry::empty());
    let err = runner.run(circular_config(BackendKind::Vectorized)).unwrap_err();
    assert!(matches!(err, DustError::UnknownBackend(ref name) if name == "vectorized"), "got {err:?}");
}

#[test]
fn failing_factory_is_backend_unavailable() {
    let registry = vectorized_registry().with(BackendKind::Gpu, || {
        Err(BackendUnavailable::Gpu("no adapter in this test".to_string()))
    });
    let runner = Runner::new(registry);

    let err = runner.run(circular_config(BackendKind::Gpu)).unwrap_err();
    assert!(err.is_unavailable());
    assert!(matches!(err, DustError::BackendUnavailable { backend: BackendKind::Gpu, .. }));
    assert!(err.to_string().contains("no adapter in this test"));

    // the failure stays with the gpu backend
    let ok = runner.run(circular_config(BackendKind::Vectorized)).unwrap();
    assert_eq!(ok.backend(), BackendKind::Vectorized);

    let probe = runner.registry().probe();
    assert_eq!(probe.len(), 2);
    for (kind, status) in probe {
        match kind {
            BackendKind::Gpu => assert!(status.is_err()),
            BackendKind::Vectorized => assert!(status.is_ok()),
            BackendKind::Native => panic!("native was never registered"),
        }
    }
}

#[test]
fn default_registry_knows_every_backend() {
    let registry = BackendRegistry::default();
    for kind in BackendKind::ALL {
        assert!(registry.contains(kind));
    }
    let backend = registry.get(BackendKind::Vectorized).unwrap();
    assert_eq!(backend.kind(), BackendKind::Vectorized);
}

// ==================================================================================
// GPU backend tests
// ==================================================================================

/// Without a usable f64 adapter this only checks the unavailability report,
/// and says so on stderr
#[test]
fn gpu_matches_vectorized_or_reports_unavailable() {
    match GpuBackend::new() {
        Ok(gpu) => {
            let config = charged_config(BackendKind::Gpu);
            let result = gpu.run(&config).unwrap();
            let expected = run_vectorized(&config);
            assert_eq!(result.backend(), BackendKind::Gpu);
            assert_eq!(result.state().index_axis(Axis(0), 0), expected.state().index_axis(Axis(0), 0));
            assert!(max_relative_deviation(result.state(), expected.state()) < 1e-6);
        }
        Err(BackendUnavailable::Gpu(reason)) => {
            assert!(!reason.is_empty());
            eprintln!("GPU backend unavailable, equivalence not checked: {reason}");
        }
        Err(other) => panic!("unexpected GPU error: {other}"),
    }
}

#[cfg(not(feature = "gpu"))]
#[test]
fn gpu_without_feature_is_unavailable() {
    let err = BackendRegistry::default().get(BackendKind::Gpu).err().unwrap();
    assert!(err.is_unavailable());
    assert!(err.to_string().contains("gpu"));
}

// ==================================================================================
// Native backend tests
// ==================================================================================

#[test]
fn native_missing_compiler_is_toolchain_missing() {
    let dir = tempfile::tempdir().unwrap();
    let options = NativeOptions {
        compiler: "dustsim-no-such-fortran-compiler".to_string(),
        ..NativeOptions::in_dir(dir.path())
    };
    let err = NativeBackend::with_options(&options).err().unwrap();
    assert!(
        matches!(err, NativeBuildError::ToolchainMissing { ref compiler } if compiler == "dustsim-no-such-fortran-compiler"),
        "got {err:?}"
    );
}

#[cfg(unix)]
#[test]
fn native_failing_compiler_is_compilation_error() {
    let dir = tempfile::tempdir().unwrap();
    let options = NativeOptions {
        compiler: "false".to_string(),
        ..NativeOptions::in_dir(dir.path())
    };
    let err = NativeBackend::with_options(&options).err().unwrap();
    match err {
        NativeBuildError::Compilation { diagnostics, .. } => assert!(!diagnostics.is_empty()),
        other => panic!("expected a compilation error, got {other:?}"),
    }
    assert!(!options.artifact_path().exists());
}

#[test]
fn native_reuses_cached_artifact_without_compiling() {
    let dir = tempfile::tempdir().unwrap();
    let options = NativeOptions {
        compiler: "dustsim-no-such-fortran-compiler".to_string(),
        ..NativeOptions::in_dir(dir.path())
    };
    // a cached file short-circuits the compiler, so the load step is what fails
    write_junk_artifact(&options.artifact_path());

    let err = NativeBackend::with_options(&options).err().unwrap();
    assert!(matches!(err, NativeBuildError::Load { .. }), "got {err:?}");
}

#[test]
fn native_force_rebuild_ignores_cached_artifact() {
    let dir = tempfile::tempdir().unwrap();
    let options = NativeOptions {
        compiler: "dustsim-no-such-fortran-compiler".to_string(),
        force_rebuild: true,
        ..NativeOptions::in_dir(dir.path())
    };
    write_junk_artifact(&options.artifact_path());

    // the compiler is invoked even though a cached file exists
    let err = NativeBackend::with_options(&options).err().unwrap();
    assert!(matches!(err, NativeBuildError::ToolchainMissing { .. }), "got {err:?}");
}

#[cfg(unix)]
#[test]
fn native_refuses_group_writable_cache_dir() {
    use std::os::unix::fs::PermissionsExt;

    let dir = tempfile::tempdir().unwrap();
    let shared = dir.path().join("shared");
    std::fs::create_dir(&shared).unwrap();
    std::fs::set_permissions(&shared, std::fs::Permissions::from_mode(0o777)).unwrap();

    let options = NativeOptions {
        compiler: "dustsim-no-such-fortran-compiler".to_string(),
        ..NativeOptions::in_dir(&shared)
    };
    let err = NativeBackend::with_options(&options).err().unwrap();
    assert!(matches!(err, NativeBuildError::UntrustedCache { .. }), "got {err:?}");
}

#[cfg(unix)]
#[test]
fn native_refuses_group_writable_cached_artifact() {
    use std::os::unix::fs::PermissionsExt;

    let dir = tempfile::tempdir().unwrap();
    let options = NativeOptions {
        compiler: "dustsim-no-such-fortran-compiler".to_string(),
        ..NativeOptions::in_dir(dir.path())
    };
    let artifact = options.artifact_path();
    std::fs::write(&artifact, b"not a shared library").unwrap();
    std::fs::set_permissions(&artifact, std::fs::Permissions::from_mode(0o666)).unwrap();

    let err = NativeBackend::with_options(&options).err().unwrap();
    assert!(matches!(err, NativeBuildError::UntrustedCache { .. }), "got {err:?}");
}

#[cfg(unix)]
#[test]
fn native_relative_cache_dir_reaches_the_compiler() {
    use std::os::unix::fs::PermissionsExt;

    // stand-in compiler: needs the source it was given, writes a bogus library to `-o`
    let tools = tempfile::tempdir().unwrap();
    let compiler = tools.path().join("fake-fc");
    std::fs::write(
        &compiler,
        "#!/bin/sh\n\
         out=\n\
         src=\n\
         while [ $# -gt 0 ]; do\n\
           case \"$1\" in\n\
             -o) out=\"$2\"; shift ;;\n\
             *.f90) src=\"$1\" ;;\n\
           esac\n\
           shift\n\
         done\n\
         [ -f \"$src\" ] || { echo \"missing source $src\" >&2; exit 1; }\n\
         echo 'not a shared library' > \"$out\"\n",
    )
    .unwrap();
    std::fs::set_permissions(&compiler, std::fs::Permissions::from_mode(0o755)).unwrap();

    let base = tempfile::tempdir_in(".").unwrap();
    let absolute = base.path().join("relcache");
    let cwd = std::env::current_dir().unwrap();
    let relative = absolute.strip_prefix(&cwd).unwrap_or(&absolute).to_path_buf();
    assert!(relative.is_relative(), "{}", relative.display());

    let options = NativeOptions {
        compiler: compiler.to_string_lossy().into_owned(),
        ..NativeOptions::in_dir(&relative)
    };
    // the build succeeds, so loading the bogus library is the first failure
    let err = NativeBackend::with_options(&options).err().unwrap();
    assert!(matches!(err, NativeBuildError::Load { .. }), "got {err:?}");
    assert!(options.artifact_path().is_file());
}

#[test]
fn native_build_key_tracks_inputs() {
    let base = NativeOptions::in_dir("/tmp/dustsim-key-test");
    let mut other_flags = base.clone();
    other_flags.flags.push("-g".to_string());
    let mut other_compiler = base.clone();
    other_compiler.compiler = "flang".to_string();

    assert_eq!(base.build_key(), base.clone().build_key());
    assert_ne!(base.build_key(), other_flags.build_key());
    assert_ne!(base.build_key(), other_compiler.build_key());
    assert_ne!(base.artifact_path(), other_flags.artifact_path());
}

/// Hosts without a working Fortran compiler only get the error classification
/// checked; the skipped comparison is reported on stderr
#[test]
fn native_matches_vectorized_or_reports_unavailable() {
    let dir = tempfile::tempdir().unwrap();
    let options = NativeOptions::in_dir(dir.path());

    match NativeBackend::with_options(&options) {
        Ok(native) => {
            assert_eq!(native.artifact(), options.artifact_path().as_path());

            let config = charged_config(BackendKind::Native);
            let result = native.run(&config).unwrap();
            let expected = run_vectorized(&config);
            assert_eq!(result.backend(), BackendKind::Native);
            assert_eq!(result.state().dim(), expected.state().dim());
            assert_eq!(result.state().index_axis(Axis(0), 0), expected.state().index_axis(Axis(0), 0));
            assert!(max_relative_deviation(result.state(), expected.state()) < 1e-6);

            // second construction loads the cached library
            let again = NativeBackend::with_options(&options).unwrap();
            assert_eq!(again.artifact(), native.artifact());
            assert_eq!(again.run(&config).unwrap(), result);
        }
        Err(e @ NativeBuildError::ToolchainMissing { .. }) | Err(e @ NativeBuildError::Compilation { .. }) => {
            eprintln!("native backend unavailable, equivalence not checked: {e}");
        }
        Err(other) => panic!("unexpected native error: {other}"),
    }
}

// ==================================================================================
// Scenario and benchmark tests
// ==================================================================================

#[test]
fn scenario_yaml_builds_config() {
    let yaml = r#"
simulation:
  backend: "python"
  num_steps: 12
  time_step: 30.0
  magnetic_field: [0.0, 0.0, 5.0e-9]
particles:
  - x: [1.5e11, 0.0, 0.0]
    v: [0.0, 3.0e4, 0.0]
    q: 1.6e-18
    m: 1.0e-16
    beta: 0.3
ring:
  count: 4
  radius: 1.0e11
  speed: 2.0e4
  charge: 1.6e-19
  mass: 1.0e-16
"#;
    let config = ScenarioConfig::from_yaml_str(yaml).unwrap().into_simulation_config().unwrap();

    assert_eq!(config.backend(), BackendKind::Vectorized);
    assert_eq!(config.num_steps(), 12);
    assert_eq!(config.time_step(), 30.0);
    assert_eq!(config.gm_sun(), GM_SUN);
    assert_eq!(config.magnetic_field(), NVec3::new(0.0, 0.0, 5.0e-9));

    let particles = config.particles();
    assert_eq!(particles.count(), 5);
    assert_eq!(particles.betas(), &[0.3, 0.0, 0.0, 0.0, 0.0]);
    assert_eq!(particles.positions()[0], NVec3::new(1.5e11, 0.0, 0.0));
    for x in &particles.positions()[1..] {
        assert!((x.norm() - 1.0e11).abs() < 1.0);
    }
}

#[test]
fn scenario_errors_are_validation_errors() {
    let no_particles = ScenarioConfig::from_yaml_str("simulation:\n  num_steps: 10\n").unwrap();
    assert!(matches!(no_particles.into_simulation_config(), Err(DustError::Validation(_))));

    let bad_backend = "simulation:\n  backend: cuda\nring: {count: 2, radius: 1.0, speed: 1.0, charge: 0.0, mass: 1.0}\n";
    let err = ScenarioConfig::from_yaml_str(bad_backend).unwrap().into_simulation_config();
    assert!(matches!(err, Err(DustError::Validation(_))));

    let bad_row = "particles:\n  - {x: [1.0, 0.0], v: [0.0, 1.0, 0.0], q: 0.0, m: 1.0}\n";
    let err = ScenarioConfig::from_yaml_str(bad_row).unwrap().into_simulation_config();
    assert!(matches!(err, Err(DustError::Validation(_))));

    assert!(matches!(ScenarioConfig::from_yaml_str("particles: 3"), Err(DustError::Validation(_))));
}

#[test]
fn ring_is_circular_and_tangential() {
    let ring = RingConfig {
        count: 6,
        radius: 2.0,
        speed: 3.0,
        charge: 0.0,
        mass: 1.0,
        beta: 0.0,
    };
    let ensemble = ring.ensemble().unwrap();
    assert_eq!(ensemble.count(), 6);
    for (x, v) in ensemble.positions().iter().zip(ensemble.velocities()) {
        assert!((x.norm() - 2.0).abs() < 1e-12);
        assert!((v.norm() - 3.0).abs() < 1e-12);
        assert!(x.dot(v).abs() < 1e-9);
    }

    let empty = RingConfig { count: 0, ..ring };
    assert!(matches!(empty.ensemble(), Err(DustError::Validation(_))));
}

#[test]
fn bench_reports_vectorized_as_its_own_reference() {
    let records = bench_backends(&vectorized_registry(), &[2, 5], 5).unwrap();
    assert_eq!(records.len(), 2);
    for (record, n) in records.iter().zip([2, 5]) {
        assert_eq!(record.backend, BackendKind::Vectorized);
        assert_eq!(record.particles, n);
        assert_eq!(record.steps, 5);
        assert_eq!(record.max_deviation, 0.0);
        assert!(record.seconds >= 0.0);
    }
}
