use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use forcegraph::gpu::{GpuBackend, GpuContext, RadixSorter};
use forcegraph::{GraphData, HostBackend, LayoutBackend, LayoutConfig, LayoutEngine, RunOutcome};

/// Force-directed graph layout on the GPU.
#[derive(Parser)]
#[command(name = "forcegraph")]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Lay out a graph and write the final positions
    Layout {
        /// Input graph (.json)
        #[arg(short, long)]
        input: PathBuf,

        /// Output graph with positions (.json)
        #[arg(short, long, default_value = "layout.json")]
        output: PathBuf,

        /// Layout parameters (.yaml or .json)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Ideal edge length
        #[arg(long)]
        ideal_length: Option<f32>,

        /// Barnes-Hut opening angle
        #[arg(long)]
        theta: Option<f32>,

        /// Maximum number of iterations
        #[arg(long)]
        iterations: Option<u32>,

        /// Multiplicative cooling decay per iteration
        #[arg(long)]
        cooling_decay: Option<f32>,

        /// Seed for nodes without coordinates
        #[arg(long, default_value = "0")]
        seed: u64,

        /// Run on the host instead of the GPU
        #[arg(long)]
        cpu: bool,
    },
    /// Check that the device sorts correctly
    SelfTest,
}

struct Overrides {
    ideal_length: Option<f32>,
    theta: Option<f32>,
    iterations: Option<u32>,
    cooling_decay: Option<f32>,
}

fn load_config(path: Option<&Path>, overrides: Overrides) -> anyhow::Result<LayoutConfig> {
    let mut config = match path {
        Some(path) => LayoutConfig::from_path(path)
            .with_context(|| format!("failed to read config {}", path.display()))?,
        None => LayoutConfig::default(),
    };
    if let Some(ideal_length) = overrides.ideal_length {
        config.ideal_length = ideal_length;
    }
    if let Some(theta) = overrides.theta {
        config.theta = theta;
    }
    if let Some(iterations) = overrides.iterations {
        config.iteration_budget = iterations;
    }
    if let Some(cooling_decay) = overrides.cooling_decay {
        config.cooling_decay = cooling_decay;
    }
    config.validate()?;
    Ok(config)
}

fn run_engine<B: LayoutBackend>(
    backend: B,
    config: LayoutConfig,
    graph: &mut GraphData,
) -> anyhow::Result<()> {
    let mut engine = LayoutEngine::new(backend, config)?;
    engine.load(graph)?;

    match engine.run_with_progress(|progress| tracing::info!("{}", progress))? {
        RunOutcome::NoData => println!("Nothing to lay out: the graph has no nodes or no edges"),
        RunOutcome::Completed(summary) | RunOutcome::Stopped(summary) => println!("{}", summary),
    }

    graph.set_positions(&engine.positions()?);
    Ok(())
}

fn layout(
    input: &Path,
    output: &Path,
    config: LayoutConfig,
    seed: u64,
    cpu: bool,
) -> anyhow::Result<()> {
    let mut graph = GraphData::load_json(input, seed, config.ideal_length, config.domain_high)
        .with_context(|| format!("failed to read graph {}", input.display()))?;

    if cpu {
        run_engine(HostBackend::new(), config, &mut graph)?;
    } else {
        let backend = GpuBackend::new().context("failed to initialise the GPU")?;
        run_engine(backend, config, &mut graph)?;
    }

    graph
        .save_json(output)
        .with_context(|| format!("failed to write {}", output.display()))?;
    println!(
        "Wrote {} nodes and {} edges to {}",
        graph.node_count(),
        graph.edge_count(),
        output.display()
    );
    Ok(())
}

fn self_test() -> anyhow::Result<()> {
    let context = GpuContext::new().context("failed to initialise the GPU")?;
    let sorter = RadixSorter::new(context.device, context.queue);
    if sorter.self_test()? {
        println!("Radix sort self-test passed");
        Ok(())
    } else {
        anyhow::bail!("radix sort self-test produced a wrong order")
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Layout {
            input,
            output,
            config,
            ideal_length,
            theta,
            iterations,
            cooling_decay,
            seed,
            cpu,
        } => {
            let overrides = Overrides {
                ideal_length,
                theta,
                iterations,
                cooling_decay,
            };
            let config = load_config(config.as_deref(), overrides)?;
            layout(&input, &output, config, seed, cpu)?;
        }
        Commands::SelfTest => self_test()?,
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_overrides() -> Overrides {
        Overrides {
            ideal_length: None,
            theta: None,
            iterations: None,
            cooling_decay: None,
        }
    }

    #[test]
    fn cli_parses_layout_with_defaults() {
        let cli = Cli::try_parse_from(["forcegraph", "layout", "--input", "graph.json"]).unwrap();
        match cli.command {
            Commands::Layout {
                input,
                output,
                config,
                seed,
                cpu,
                ..
            } => {
                assert_eq!(input, PathBuf::from("graph.json"));
                assert_eq!(output, PathBuf::from("layout.json"));
                assert!(config.is_none());
                assert_eq!(seed, 0);
                assert!(!cpu);
            }
            _ => panic!("Expected Layout command"),
        }
    }

    #[test]
    fn cli_parses_layout_overrides() {
        let cli = Cli::try_parse_from([
            "forcegraph",
            "layout",
            "-i",
            "in.json",
            "-o",
            "out.json",
            "--theta",
            "0.5",
            "--iterations",
            "200",
            "--cpu",
        ])
        .unwrap();
        match cli.command {
            Commands::Layout {
                theta,
                iterations,
                cpu,
                ..
            } => {
                assert_eq!(theta, Some(0.5));
                assert_eq!(iterations, Some(200));
                assert!(cpu);
            }
            _ => panic!("Expected Layout command"),
        }
    }

    #[test]
    fn cli_requires_input() {
        assert!(Cli::try_parse_from(["forcegraph", "layout"]).is_err());
    }

    #[test]
    fn cli_parses_self_test() {
        let cli = Cli::try_parse_from(["forcegraph", "self-test"]).unwrap();
        assert!(matches!(cli.command, Commands::SelfTest));
    }

    #[test]
    fn overrides_replace_config_fields() {
        let overrides = Overrides {
            ideal_length: Some(0.2),
            iterations: Some(42),
            ..no_overrides()
        };
        let config = load_config(None, overrides).unwrap();
        assert_eq!(config.ideal_length, 0.2);
        assert_eq!(config.iteration_budget, 42);
        assert_eq!(config.theta, LayoutConfig::default().theta);
    }

    #[test]
    fn invalid_override_is_rejected() {
        let overrides = Overrides {
            cooling_decay: Some(1.5),
            ..no_overrides()
        };
        assert!(load_config(None, overrides).is_err());
    }
}
