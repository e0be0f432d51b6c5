use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use nnbundle::{
    BundleSnapshot, BundlingConfig, ComputeDevice, HostDevice, NetworkInput, NetworkProcessor,
    ProcessingMode,
};

/// Density-driven edge bundling for layered neural-network graphs.
#[derive(Parser)]
#[command(name = "nnbundle")]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Lay out a network, run bundling phases and write a snapshot
    Bundle(BundleArgs),
    /// Print the counters of a snapshot
    Inspect {
        /// Snapshot written by `bundle`
        snapshot: PathBuf,

        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Args, Debug)]
struct BundleArgs {
    /// Network description (JSON)
    #[arg(short, long, conflicts_with = "layers")]
    input: Option<PathBuf>,

    /// Synthetic network with these layer sizes, e.g. 4,3
    #[arg(long, value_delimiter = ',')]
    layers: Option<Vec<usize>>,

    /// Bundling configuration (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Snapshot to write
    #[arg(short, long, default_value = "bundle.json")]
    output: PathBuf,

    /// Phases to run, in order
    #[arg(
        short,
        long = "phase",
        value_enum,
        value_delimiter = ',',
        default_value = "edge-advect"
    )]
    phases: Vec<Phase>,

    /// Upper bound on iterations per phase
    #[arg(long, default_value_t = 1000)]
    max_steps: usize,

    /// Run the kernels on a GPU adapter (needs the `gpu` feature)
    #[arg(long)]
    gpu: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Phase {
    NodeAdvect,
    NodeAdvectReverse,
    NodeNoise,
    EdgeAdvect,
    EdgeAdvectReverse,
    EdgeNoise,
    /// Discard bundling and reseed straight edges
    Reset,
}

impl Phase {
    fn mode(self) -> ProcessingMode {
        match self {
            Phase::NodeAdvect => ProcessingMode::NodeAdvectForward,
            Phase::NodeAdvectReverse => ProcessingMode::NodeAdvectReverse,
            Phase::NodeNoise => ProcessingMode::NodeNoise,
            Phase::EdgeAdvect => ProcessingMode::EdgeAdvectForward,
            Phase::EdgeAdvectReverse => ProcessingMode::EdgeAdvectReverse,
            Phase::EdgeNoise => ProcessingMode::EdgeNoise,
            Phase::Reset => ProcessingMode::Idle,
        }
    }
}

#[derive(Serialize)]
struct SnapshotSummary {
    layer_sizes: Vec<usize>,
    nodes: usize,
    edges: usize,
    pruned_edges: usize,
    partitions: usize,
    points: usize,
    max_sample_points: usize,
    num_classes: usize,
}

fn bundle(args: &BundleArgs) -> anyhow::Result<()> {
    let config = match &args.config {
        Some(path) => BundlingConfig::load_from_file(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => BundlingConfig::default(),
    };
    let input = match (&args.input, &args.layers) {
        (Some(path), _) => NetworkInput::load_from_file(path)
            .with_context(|| format!("failed to load network {}", path.display()))?,
        (None, Some(sizes)) => NetworkInput::uniform(sizes),
        (None, None) => anyhow::bail!("either --input or --layers is required"),
    };

    if args.gpu {
        #[cfg(feature = "gpu")]
        return run(nnbundle::gpu::WgpuDevice::new()?, &input, config, args);
        #[cfg(not(feature = "gpu"))]
        anyhow::bail!("--gpu needs a build with the `gpu` feature");
    }
    run(HostDevice::new(), &input, config, args)
}

fn run<D: ComputeDevice>(
    device: D,
    input: &NetworkInput,
    config: BundlingConfig,
    args: &BundleArgs,
) -> anyhow::Result<()> {
    let mut processor = NetworkProcessor::from_input(device, input, config)?;
    let counters = processor.counters();
    tracing::info!(
        nodes = counters.node_count,
        edges = counters.edge_count,
        pruned = counters.pruned_edges,
        grid_cells = counters.grid_cells,
        "network ready"
    );

    for phase in &args.phases {
        let mode = phase.mode();
        let steps = processor.run(mode, args.max_steps)?;
        if !processor.action_finished() {
            tracing::warn!(%mode, steps, "phase stopped before its schedule finished");
        }
        tracing::info!(%mode, steps, points = processor.point_count(), "phase done");
    }

    let snapshot = processor.snapshot()?;
    snapshot
        .save(&args.output)
        .with_context(|| format!("failed to write {}", args.output.display()))?;
    println!(
        "Bundled {} edges ({} points) into {}",
        snapshot.edge_count(),
        snapshot.point_count(),
        args.output.display()
    );
    Ok(())
}

fn inspect(path: &Path, json: bool) -> anyhow::Result<()> {
    let snapshot = BundleSnapshot::load(path)
        .with_context(|| format!("failed to read snapshot {}", path.display()))?;
    let summary = SnapshotSummary {
        layer_sizes: snapshot.layer_sizes.clone(),
        nodes: snapshot.node_count(),
        edges: snapshot.edge_count(),
        pruned_edges: snapshot.pruned_edges,
        partitions: snapshot.edge_samples.len(),
        points: snapshot.point_count(),
        max_sample_points: snapshot.max_sample_points,
        num_classes: snapshot.num_classes,
    };
    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!("layers:            {:?}", summary.layer_sizes);
        println!("nodes:             {}", summary.nodes);
        println!("edges:             {}", summary.edges);
        println!("pruned edges:      {}", summary.pruned_edges);
        println!("partitions:        {}", summary.partitions);
        println!("points:            {}", summary.points);
        println!("max sample points: {}", summary.max_sample_points);
        println!("classes:           {}", summary.num_classes);
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,nnbundle=debug")),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Bundle(args) => bundle(&args),
        Commands::Inspect { snapshot, json } => inspect(&snapshot, json),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_bundle_with_defaults() {
        let cli = Cli::try_parse_from(["nnbundle", "bundle", "--layers", "4,3"]).unwrap();
        match cli.command {
            Commands::Bundle(args) => {
                assert_eq!(args.layers, Some(vec![4, 3]));
                assert_eq!(args.output, PathBuf::from("bundle.json"));
                assert_eq!(args.phases, vec![Phase::EdgeAdvect]);
                assert_eq!(args.max_steps, 1000);
            }
            _ => panic!("Expected Bundle command"),
        }
    }

    #[test]
    fn cli_parses_phase_list() {
        let cli = Cli::try_parse_from([
            "nnbundle",
            "bundle",
            "--input",
            "net.json",
            "--phase",
            "node-advect,edge-noise,edge-advect-reverse",
        ])
        .unwrap();
        match cli.command {
            Commands::Bundle(args) => {
                assert_eq!(args.input, Some(PathBuf::from("net.json")));
                assert_eq!(
                    args.phases,
                    vec![Phase::NodeAdvect, Phase::EdgeNoise, Phase::EdgeAdvectReverse]
                );
            }
            _ => panic!("Expected Bundle command"),
        }
    }

    #[test]
    fn input_and_layers_conflict() {
        let result = Cli::try_parse_from([
            "nnbundle", "bundle", "--input", "net.json", "--layers", "2,2",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn cli_parses_inspect() {
        let cli = Cli::try_parse_from(["nnbundle", "inspect", "out.json", "--json"]).unwrap();
        match cli.command {
            Commands::Inspect { snapshot, json } => {
                assert_eq!(snapshot, PathBuf::from("out.json"));
                assert!(json);
            }
            _ => panic!("Expected Inspect command"),
        }
    }

    #[test]
    fn phases_map_to_modes() {
        assert_eq!(Phase::Reset.mode(), ProcessingMode::Idle);
        assert_eq!(Phase::NodeNoise.mode(), ProcessingMode::NodeNoise);
        assert_eq!(Phase::EdgeAdvectReverse.mode(), ProcessingMode::EdgeAdvectReverse);
    }
}
