use burn::backend::NdArray;
use burn::config::Config;
use burn::tensor::backend::Backend;
use clap::Parser;
use rlcomp_algorithms::{
    AgentConfig, AgentSet, EpisodeSummary, EvaluationConfig, EvaluationReport, Evaluator,
};
use rlcomp_core::{CompressionError, Environment, Result, SplitAccuracy};
use rlcomp_engines::{SmallConvNetConfig, SyntheticDataConfig, TechniqueKind, TechniqueParams};
use rlcomp_envs::{CompressionEnvironment, EnvironmentConfig, LayerTechnique};
use serde::Serialize;
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

type B = NdArray;

#[derive(Parser)]
#[command(name = "rlcomp")]
#[command(about = "Evaluate layer compression agents on a demo network")]
#[command(version)]
struct Cli {
    /// Environment configuration (JSON). Defaults to every technique.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Checkpoint root holding `<dataset>/conv_agent.mpk` and `<dataset>/fc_agent.mpk`
    #[arg(long)]
    checkpoints: Option<PathBuf>,

    /// Dataset name used to locate checkpoints
    #[arg(short, long, default_value = "synthetic")]
    dataset: String,

    /// Number of evaluation episodes
    #[arg(short, long, default_value = "5")]
    games: usize,

    /// Seed for the demo network, the synthetic data and the agents
    #[arg(long, default_value = "7")]
    seed: u64,

    /// Evaluate randomly initialised agents instead of loading checkpoints
    #[arg(long)]
    untrained: bool,

    /// Epsilon-greedy action selection
    #[arg(long)]
    explore: bool,

    /// Write the agents to the checkpoint root after evaluating
    #[arg(long)]
    save: bool,

    /// Write the evaluation results as JSON
    #[arg(long)]
    report: Option<PathBuf>,
}

/// One results row per dataset.
#[derive(Serialize)]
struct ResultsRow<'a> {
    dataset: &'a str,
    baseline_weights: usize,
    baseline_accuracy: f32,
    baseline_splits: SplitAccuracy,
    completed: usize,
    truncated: usize,
    failed: usize,
    mean_reward: Option<f32>,
    mean_accuracy: Option<f32>,
    mean_weights: Option<f32>,
    mean_splits: Option<SplitAccuracy>,
    episodes: &'a [EpisodeSummary],
}

fn write_results(path: &Path, row: &ResultsRow<'_>) -> Result<()> {
    let missing = |reason: String| CompressionError::MissingResource {
        path: path.to_path_buf(),
        reason,
    };
    let file = File::create(path).map_err(|err| missing(err.to_string()))?;
    serde_json::to_writer_pretty(BufWriter::new(file), row)
        .map_err(|err| missing(err.to_string()))?;
    info!(path = %path.display(), "results written");
    Ok(())
}

fn log_splits(label: &str, splits: &SplitAccuracy) {
    info!(
        train = ?splits.train,
        validation = ?splits.validation,
        test = ?splits.test,
        "{label} split accuracy"
    );
}

fn results_row<'a>(
    dataset: &'a str,
    env: &CompressionEnvironment<B>,
    report: &'a EvaluationReport,
) -> ResultsRow<'a> {
    ResultsRow {
        dataset,
        baseline_weights: env.baseline_weights(),
        baseline_accuracy: env.baseline_accuracy(),
        baseline_splits: env.baseline_split_accuracy(),
        completed: report.completed,
        truncated: report.truncated,
        failed: report.failed,
        mean_reward: report.mean_reward().ok(),
        mean_accuracy: report.mean_accuracy().ok(),
        mean_weights: report.mean_weights().ok(),
        mean_splits: report.mean_split_accuracy().ok(),
        episodes: &report.episodes,
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(true);
    Registry::default().with(filter).with(fmt_layer).init();
}

/// Every technique, with explicit ranks for the factorisations.
fn default_config() -> EnvironmentConfig {
    let conv = vec![
        TechniqueKind::Identity,
        TechniqueKind::MagnitudePruning,
        TechniqueKind::ConvSvd,
        TechniqueKind::DepthwiseSeparable,
        TechniqueKind::SparseConnections,
    ];
    let fc = vec![
        TechniqueKind::Identity,
        TechniqueKind::MagnitudePruning,
        TechniqueKind::DenseSvd,
    ];
    EnvironmentConfig::new(conv, fc).with_parameters(vec![
        LayerTechnique::new("conv2d_0", TechniqueParams::ConvSvd { units: 4 }),
        LayerTechnique::new("conv2d_1", TechniqueParams::ConvSvd { units: 4 }),
        LayerTechnique::new("dense_0", TechniqueParams::DenseSvd { units: 8 }),
        LayerTechnique::new("dense_1", TechniqueParams::DenseSvd { units: 8 }),
        LayerTechnique::new("dense_softmax", TechniqueParams::DenseSvd { units: 2 }),
        LayerTechnique::new(
            "dense_0",
            TechniqueParams::MagnitudePruning { threshold: 0.05 },
        ),
    ])
}

fn run(cli: Cli) -> Result<()> {
    let device = Default::default();
    B::seed(cli.seed);

    let env_config = match &cli.config {
        Some(path) => EnvironmentConfig::load(path).map_err(|err| {
            CompressionError::MissingResource {
                path: path.clone(),
                reason: err.to_string(),
            }
        })?,
        None => default_config(),
    };

    let engine_error = |err: rlcomp_engines::EngineError| CompressionError::Config(err.to_string());
    let network = SmallConvNetConfig::new()
        .with_seed(cli.seed)
        .init::<B>(&device)
        .map_err(engine_error)?;
    let data = SyntheticDataConfig::new()
        .with_seed(cli.seed)
        .generate(&network, &device)
        .map_err(engine_error)?;
    let mut env = CompressionEnvironment::new(network, data, env_config)?;

    let agent_config = AgentConfig::new().with_seed(cli.seed);
    let agents = AgentSet::<B>::init(&env, &agent_config, &device)?;
    let mut agents = match (&cli.checkpoints, cli.untrained) {
        (_, true) => {
            info!("evaluating untrained agents");
            agents
        }
        (Some(root), false) => agents.load(root, &cli.dataset)?,
        (None, false) => {
            return Err(CompressionError::Config(
                "no --checkpoints given; pass --untrained to evaluate fresh agents".to_string(),
            ))
        }
    };

    let evaluator = Evaluator::new(
        EvaluationConfig::new()
            .with_n_games(cli.games)
            .with_explore(cli.explore),
    );
    let report = evaluator.evaluate(&mut env, &mut agents)?;

    info!(
        layers = env.layers().len(),
        baseline_weights = env.baseline_weights(),
        baseline_accuracy = env.baseline_accuracy(),
        "baseline"
    );
    log_splits("baseline", &env.baseline_split_accuracy());
    match (
        report.mean_reward(),
        report.mean_accuracy(),
        report.mean_weights(),
    ) {
        (Ok(reward), Ok(accuracy), Ok(weights)) => info!(
            completed = report.completed,
            truncated = report.truncated,
            failed = report.failed,
            mean_reward = reward,
            mean_accuracy = accuracy,
            mean_weights = weights,
            "evaluation report"
        ),
        (Err(err), _, _) | (_, Err(err), _) | (_, _, Err(err)) => error!(
            completed = report.completed,
            truncated = report.truncated,
            failed = report.failed,
            "no reward-bearing episodes: {err}"
        ),
    }
    if let Ok(splits) = report.mean_split_accuracy() {
        log_splits("compressed", &splits);
    }
    if let Some(path) = &cli.report {
        write_results(path, &results_row(&cli.dataset, &env, &report))?;
    }

    if cli.save {
        let root = cli.checkpoints.as_ref().ok_or_else(|| {
            CompressionError::Config("--save needs --checkpoints".to_string())
        })?;
        agents.save(root, &cli.dataset)?;
    }
    Ok(())
}

fn main() -> ExitCode {
    init_tracing();
    match run(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err}");
            ExitCode::FAILURE
        }
    }
}
