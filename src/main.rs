use dustsim::{bench_backends, BackendKind, BackendRegistry, RingConfig, Runner, ScenarioConfig, SimulationConfig};

use anyhow::{Context, Result};
use clap::Parser;

use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "dustsim", about = "Charged dust grain trajectories around the Sun")]
struct Args {
    /// Scenario YAML; bare names are looked up in the crate's scenarios/ directory
    #[arg(long)]
    scenario: Option<String>,

    /// native | vectorized | gpu (overrides the scenario file)
    #[arg(long)]
    backend: Option<String>,

    #[arg(long, default_value_t = 4)]
    particles: usize,

    #[arg(long, default_value_t = 200)]
    steps: usize,

    /// Step size in seconds
    #[arg(long, default_value_t = 60.0)]
    dt: f64,

    #[arg(long, default_value_t = 0.1)]
    beta: f64,

    /// Grain charge in coulomb
    #[arg(long, default_value_t = 1.6e-19)]
    charge: f64,

    /// Grain mass in kg
    #[arg(long, default_value_t = 1.0e-16)]
    mass: f64,

    /// Report which backends work on this host and exit
    #[arg(long)]
    check_backends: bool,

    /// Time every available backend and exit
    #[arg(long)]
    bench: bool,
}

// load here to keep main clean
fn load_scenario_from_yaml(name: &str) -> Result<ScenarioConfig> {
    let direct = PathBuf::from(name);
    let config_path = if direct.exists() {
        direct
    } else {
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("scenarios").join(name)
    };

    let file = File::open(&config_path)
        .with_context(|| format!("failed to open scenario {}", config_path.display()))?;
    let reader = BufReader::new(file);
    let scenario_cfg: ScenarioConfig = serde_yaml::from_reader(reader)
        .with_context(|| format!("failed to parse scenario {}", config_path.display()))?;
    Ok(scenario_cfg)
}

fn build_config(args: &Args) -> Result<SimulationConfig> {
    let config = match &args.scenario {
        Some(name) => load_scenario_from_yaml(name)?.into_simulation_config()?,
        None => {
            let ring = RingConfig {
                count: args.particles,
                radius: 1.5e11,
                speed: 2.6e4,
                charge: args.charge,
                mass: args.mass,
                beta: args.beta,
            };
            SimulationConfig::builder(ring.ensemble()?)
                .num_steps(args.steps)
                .time_step(args.dt)
                .build()?
        }
    };

    match &args.backend {
        Some(name) => Ok(config.with_backend(name.parse::<BackendKind>()?)),
        None => Ok(config),
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let registry = BackendRegistry::default();

    if args.check_backends {
        for (kind, status) in registry.probe() {
            match status {
                Ok(()) => println!("{:<10} available", kind.as_str()),
                Err(e) => println!("{:<10} unavailable: {e}", kind.as_str()),
            }
        }
        return Ok(());
    }

    if args.bench {
        println!("backend,particles,steps,seconds,max_deviation");
        for r in bench_backends(&registry, &[16, 64, 256, 1024], args.steps)? {
            println!(
                "{},{},{},{:.6},{:.3e}",
                r.backend, r.particles, r.steps, r.seconds, r.max_deviation
            );
        }
        return Ok(());
    }

    let config = build_config(&args)?;
    let result = Runner::new(registry).run(config)?;
    println!("{}", result.summary());

    Ok(())
}
