use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use candle_core::Device;
use clap::{Parser, Subcommand};

use supernet_common::{
    AgentConfig, BatchDataset, CsvSink, InMemoryDataset, InfoMetric, SearchSpaceConfig,
};
use supernet_core::{Architecture, ChildNet, LookupTable, Supernet};
use supernet_train::{EvaluateAgent, TrainingAgent};

#[derive(Parser, Debug)]
#[command(name = "supernet", about = "Hardware-constrained one-shot NAS over a weight-sharing supernet")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Write default search-space and agent configs.
    InitConfig(InitConfigArgs),
    /// Build a lookup table (analytic MFLOPs / M params, optional latency).
    LookupTable(LookupTableArgs),
    /// Print the cost of one architecture.
    Cost(CostArgs),
    /// Train the supernet (warmup → search) and search for the best architecture.
    Search(SearchArgs),
    /// Train the standalone network of one architecture from scratch.
    Evaluate(EvaluateArgs),
}

// ── Arguments ──────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
struct InitConfigArgs {
    #[arg(long, default_value = "search_space.json")]
    space: PathBuf,
    #[arg(long, default_value = "agent.json")]
    agent: PathBuf,
    /// Overwrite existing files.
    #[arg(long)]
    force: bool,
}

#[derive(Parser, Debug)]
struct LookupTableArgs {
    #[arg(long, default_value = "search_space.json")]
    space: PathBuf,
    #[arg(long, default_value = "lookup_table.json")]
    output: PathBuf,
    /// Also profile per-candidate latency on this machine.
    #[arg(long)]
    latency: bool,
    #[arg(long, default_value = "1")]
    batch_size: usize,
    #[arg(long, default_value = "10")]
    repeats: usize,
}

#[derive(Parser, Debug)]
struct CostArgs {
    #[arg(long, default_value = "lookup_table.json")]
    lookup_table: PathBuf,
    /// Architecture as dash-separated choices, e.g. `0-2-1-1`.
    #[arg(long)]
    architecture: String,
    #[arg(long, default_value = "flops", value_parser = ["flops", "param", "latency"])]
    metric: String,
}

#[derive(Parser, Debug)]
struct SearchArgs {
    #[arg(long, default_value = "search_space.json")]
    space: PathBuf,
    #[arg(long, default_value = "agent.json")]
    agent: PathBuf,
    /// Prebuilt lookup table; computed analytically from the space if absent.
    #[arg(long)]
    lookup_table: Option<PathBuf>,
    /// `InMemoryDataset` JSON; a synthetic dataset is generated if absent.
    #[arg(long)]
    data: Option<PathBuf>,
    #[arg(long, default_value = "512")]
    synthetic_samples: usize,
    #[arg(long, default_value = "0.2")]
    val_fraction: f64,
    /// Overrides `output_dir` from the agent config.
    #[arg(long)]
    output_dir: Option<PathBuf>,
    /// Write per-epoch scalars to `<output_dir>/metrics.csv`.
    #[arg(long)]
    csv_metrics: bool,
    /// Hide the search progress bar.
    #[arg(long)]
    quiet: bool,
}

#[derive(Parser, Debug)]
struct EvaluateArgs {
    #[arg(long, default_value = "search_space.json")]
    space: PathBuf,
    #[arg(long, default_value = "agent.json")]
    agent: PathBuf,
    /// Dash-separated choices (`0-2-1-1`) or a saved `architecture.json`.
    #[arg(long)]
    architecture: String,
    #[arg(long)]
    data: Option<PathBuf>,
    #[arg(long, default_value = "512")]
    synthetic_samples: usize,
    #[arg(long, default_value = "0.2")]
    val_fraction: f64,
    #[arg(long)]
    output_dir: Option<PathBuf>,
    /// Defaults to warmup + search epochs of the agent config.
    #[arg(long)]
    epochs: Option<usize>,
    /// Write per-epoch scalars to `<output_dir>/evaluate_metrics.csv`.
    #[arg(long)]
    csv_metrics: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::InitConfig(args) => cmd_init_config(args),
        Command::LookupTable(args) => cmd_lookup_table(args),
        Command::Cost(args) => cmd_cost(args),
        Command::Search(args) => cmd_search(args),
        Command::Evaluate(args) => cmd_evaluate(args),
    }
}

// ── Command implementations ────────────────────────────────────────────────────

fn cmd_init_config(args: InitConfigArgs) -> Result<()> {
    for path in [&args.space, &args.agent] {
        if path.exists() && !args.force {
            anyhow::bail!("{} already exists (use --force to overwrite)", path.display());
        }
    }
    SearchSpaceConfig::default().save(&args.space)?;
    AgentConfig::default().save(&args.agent)?;
    println!("Wrote {} and {}", args.space.display(), args.agent.display());
    Ok(())
}

fn load_space(path: &Path) -> Result<SearchSpaceConfig> {
    SearchSpaceConfig::load(path).with_context(|| format!("loading search space {}", path.display()))
}

fn cmd_lookup_table(args: LookupTableArgs) -> Result<()> {
    let space = load_space(&args.space)?;
    let mut table = LookupTable::from_search_space(&space)?;
    if args.latency {
        let device = Device::cuda_if_available(0)?;
        let supernet = Supernet::new(&space, &device)?;
        table.profile_latency(&supernet, args.batch_size, args.repeats)?;
    }
    table.save(&args.output)?;

    for metric in [InfoMetric::Flops, InfoMetric::Param, InfoMetric::Latency] {
        if table.has_metric(metric) {
            println!(
                "{metric:>8}: min {:.3}  max {:.3}",
                table.min_cost(metric)?,
                table.max_cost(metric)?
            );
        }
    }
    println!("Lookup table saved to: {}", args.output.display());
    Ok(())
}

fn cmd_cost(args: CostArgs) -> Result<()> {
    let table = LookupTable::load(&args.lookup_table)?;
    let metric: InfoMetric = args.metric.parse()?;
    let architecture: Architecture = args.architecture.parse()?;
    architecture.validate(table.num_stages(), table.num_choices())?;
    let cost = table.get_cost(&architecture, metric)?;
    println!("{architecture} {metric}: {cost:.4}");
    Ok(())
}

fn load_agent_config(path: &Path, output_dir: Option<PathBuf>) -> Result<AgentConfig> {
    let mut config = if path.exists() {
        AgentConfig::load(path).with_context(|| format!("loading agent config {}", path.display()))?
    } else {
        let default = AgentConfig::default();
        default.save(path)?;
        eprintln!("Created default agent config at {}", path.display());
        default
    };
    if let Some(dir) = output_dir {
        config.output_dir = dir;
    }
    Ok(config)
}

/// Train/validation split of `data`, or of a synthetic set shaped for `space`.
fn load_datasets(
    space: &SearchSpaceConfig,
    data: Option<&Path>,
    synthetic_samples: usize,
    val_fraction: f64,
    seed: u64,
) -> Result<(InMemoryDataset, InMemoryDataset)> {
    let shape = [space.input_channels, space.input_size, space.input_size];
    let dataset = match data {
        Some(path) => InMemoryDataset::load(path)?,
        None => {
            tracing::info!(samples = synthetic_samples, "No dataset given, generating synthetic data");
            InMemoryDataset::synthetic(synthetic_samples, space.classes, shape, seed)?
        }
    };
    if dataset.sample_shape() != shape {
        anyhow::bail!(
            "dataset samples are {:?}, search space expects {:?}",
            dataset.sample_shape(),
            shape
        );
    }
    let (train, val) = dataset.split(val_fraction)?;
    tracing::info!(train = train.len(), val = val.len(), "Dataset ready");
    Ok((train, val))
}

fn cmd_search(args: SearchArgs) -> Result<()> {
    let space = load_space(&args.space)?;
    let mut config = load_agent_config(&args.agent, args.output_dir)?;
    if args.quiet {
        config.show_progress = false;
    }

    let table = match &args.lookup_table {
        Some(path) => LookupTable::load(path)?,
        None => LookupTable::from_search_space(&space)?,
    };
    let (train, val) = load_datasets(
        &space,
        args.data.as_deref(),
        args.synthetic_samples,
        args.val_fraction,
        config.seed.unwrap_or(0),
    )?;

    let device = Device::cuda_if_available(0)?;
    let supernet = Supernet::new(&space, &device)?;
    std::fs::create_dir_all(&config.output_dir)?;
    let mut agent = TrainingAgent::new(config.clone(), supernet, table)?;
    if args.csv_metrics {
        let sink = CsvSink::create(&config.output_dir.join("metrics.csv"))?;
        agent = agent.with_sink(Box::new(sink));
    }
    let report = agent.run(&train, &val)?;

    let outcome = &report.outcome;
    println!("\n=== Search Complete ===");
    println!("Architecture: {}", outcome.architecture);
    println!("Top-1: {:.2}%  Top-5: {:.2}%", outcome.top1 * 100.0, outcome.top5 * 100.0);
    println!(
        "Cost: {:.3} {} (target {:.3})",
        outcome.cost, outcome.info_metric, outcome.target_hc
    );
    println!("Result saved to: {}", report.architecture_path.display());
    Ok(())
}

fn cmd_evaluate(args: EvaluateArgs) -> Result<()> {
    let space = load_space(&args.space)?;
    let config = load_agent_config(&args.agent, args.output_dir)?;
    let path = Path::new(&args.architecture);
    let architecture = if path.is_file() {
        Architecture::load(path).with_context(|| format!("loading architecture {}", path.display()))?
    } else {
        args.architecture.parse()?
    };
    let (train, val) = load_datasets(
        &space,
        args.data.as_deref(),
        args.synthetic_samples,
        args.val_fraction,
        config.seed.unwrap_or(0),
    )?;

    let device = Device::cuda_if_available(0)?;
    let (child, varmap) = ChildNet::with_varmap(&space, &architecture, &device)?;
    std::fs::create_dir_all(&config.output_dir)?;
    let mut agent = EvaluateAgent::new(config.clone(), child, &varmap)?;
    if let Some(epochs) = args.epochs {
        agent = agent.with_epochs(epochs);
    }
    if args.csv_metrics {
        let sink = CsvSink::create(&config.output_dir.join("evaluate_metrics.csv"))?;
        agent = agent.with_sink(Box::new(sink));
    }
    let report = agent.run(&train, &val)?;

    let best = &report.best_valid;
    println!("\n=== Evaluation Complete ===");
    println!("Architecture: {}", report.architecture);
    println!(
        "Best epoch {}: Top-1 {:.2}%  Top-5 {:.2}%",
        report.best_epoch + 1,
        best.top1 * 100.0,
        best.top5 * 100.0
    );
    println!("Report saved to: {}", report.report_path.display());
    Ok(())
}
