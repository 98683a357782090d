//! Optimize a prompt against a labeled dataset, or score a saved one.
//!
//! Reads the API key from the `OPENROUTER_KEY` environment variable.
//!
//! # Examples
//!
//! ```sh
//! # Meta-prompt only (no dataset)
//! promptopt optimize --system sys.txt --system-variables domain \
//!   --user user.txt --variables question
//!
//! # Full search with a named mode
//! promptopt optimize --user user.txt --variables question \
//!   --dataset qa.jsonl --input-columns question --output-column answer --mode lite
//!
//! # Score a saved prompt with an external scorer
//! promptopt evaluate --prompt-dir runs/20260101-120000/prompt --dataset qa.jsonl \
//!   --input-columns question --output-column answer --metric-command ./score.sh
//! ```

use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use promptopt::evaluation::Evaluator;
use promptopt::logging;
use promptopt::metric::{CommandMetric, ContainsMatch, ExactMatch, MetricAdapter};
use promptopt::optimizer::{BudgetPreset, PromptOptimizer};
use promptopt::prelude::{
    FewShotFormat, InferenceAdapter, OpenRouterClient, PromptBuilder, PromptDocument,
};
use promptopt::repository::{DirectoryRepository, RunRepository};
use promptopt_cli::RunConfig;
use promptopt_cli::data::{load_dataset, parse_columns};
use tracing::info;

#[derive(Parser)]
#[command(name = "promptopt", version)]
struct Cli {
    /// Minimum log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", global = true)]
    log_level: tracing::Level,

    /// Silence all log output
    #[arg(long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Meta-prompt, then search instructions and demos
    Optimize(OptimizeArgs),
    /// Score a saved prompt over a dataset
    Evaluate(EvaluateArgs),
}

#[derive(Args)]
struct DataArgs {
    /// JSONL (or .json array) file of records
    #[arg(long)]
    dataset: Option<PathBuf>,

    /// Comma-separated input columns
    #[arg(long, default_value = "")]
    input_columns: String,

    /// The single output column
    #[arg(long)]
    output_column: Option<String>,

    // ── Metric ─────────────────────────────────────────────────
    /// Built-in metric: exact or contains
    #[arg(long, default_value = "exact")]
    metric: String,

    /// External scorer program; overrides --metric
    #[arg(long)]
    metric_command: Option<PathBuf>,

    /// Argument passed to the scorer (repeatable)
    #[arg(long = "metric-arg")]
    metric_args: Vec<String>,
}

#[derive(Args)]
struct OptimizeArgs {
    // ── Prompt ─────────────────────────────────────────────────
    /// System prompt file
    #[arg(long)]
    system: Option<PathBuf>,

    /// User prompt file
    #[arg(long)]
    user: PathBuf,

    /// Comma-separated variables the user prompt declares
    #[arg(long, default_value = "")]
    variables: String,

    /// Comma-separated variables the system prompt declares
    #[arg(long, default_value = "")]
    system_variables: String,

    /// Few-shot examples JSON file
    #[arg(long)]
    few_shot: Option<PathBuf>,

    /// converse, append_to_user or append_to_system
    #[arg(long, default_value = "converse")]
    few_shot_format: FewShotFormat,

    #[command(flatten)]
    data: DataArgs,

    // ── Search ─────────────────────────────────────────────────
    /// Named mode (micro, lite, pro, premier); overrides model and budget flags
    #[arg(long)]
    mode: Option<String>,

    #[arg(long)]
    task_model: Option<String>,

    #[arg(long)]
    prompter_model: Option<String>,

    #[arg(long)]
    meta_prompt_model: Option<String>,

    /// Give together with --num-trials
    #[arg(long)]
    num_candidates: Option<usize>,

    /// Give together with --num-candidates
    #[arg(long)]
    num_trials: Option<usize>,

    /// light, medium or heavy; used when no budget is given
    #[arg(long)]
    preset: Option<BudgetPreset>,

    #[arg(long)]
    num_threads: Option<usize>,

    #[arg(long)]
    minibatch_size: Option<usize>,

    #[arg(long)]
    seed: Option<u64>,

    /// Share of records used for training
    #[arg(long)]
    train_fraction: Option<f64>,

    /// Split each output value separately
    #[arg(long)]
    stratified: bool,

    // ── Limits ─────────────────────────────────────────────────
    /// Requests per second (0 disables limiting)
    #[arg(long)]
    rate_limit: Option<i64>,

    /// Where run directories are created
    #[arg(long, default_value = "runs")]
    out_dir: PathBuf,
}

#[derive(Args)]
struct EvaluateArgs {
    /// Directory written by `optimize` (or `PromptDocument::save`)
    #[arg(long)]
    prompt_dir: PathBuf,

    #[command(flatten)]
    data: DataArgs,

    #[arg(long, default_value = promptopt::DEFAULT_TASK_MODEL)]
    model: String,

    /// JSONL file for per-row results
    #[arg(long)]
    output: Option<PathBuf>,

    #[arg(long, default_value_t = 2)]
    rate_limit: i64,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = logging::init(cli.log_level) {
        eprintln!("Warning: {e}");
    }
    if cli.quiet {
        logging::disable_logging();
    }

    let result = match cli.command {
        Command::Optimize(args) => run_optimize(args).await,
        Command::Evaluate(args) => run_evaluate(args).await,
    };
    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn client() -> Result<OpenRouterClient, String> {
    let api_key = std::env::var("OPENROUTER_KEY")
        .map_err(|_| "OPENROUTER_KEY environment variable is not set".to_string())?;
    OpenRouterClient::new(api_key).map_err(|e| format!("failed to create API client: {e}"))
}

async fn build_metric(data: &DataArgs) -> Result<Arc<dyn MetricAdapter>, String> {
    if let Some(program) = &data.metric_command {
        let metric = CommandMetric::new(program)
            .with_args(data.metric_args.iter())
            .validate()
            .await
            .map_err(|e| format!("metric command failed validation: {e}"))?;
        return Ok(Arc::new(metric));
    }
    match data.metric.as_str() {
        "exact" => Ok(Arc::new(ExactMatch)),
        "contains" => Ok(Arc::new(ContainsMatch)),
        other => Err(format!("unknown metric '{other}' (expected exact or contains)")),
    }
}

fn load_data(data: &DataArgs, path: &Path) -> Result<promptopt::dataset::Dataset, String> {
    let output_column = data
        .output_column
        .as_deref()
        .ok_or("--output-column is required with --dataset")?;
    let inputs = parse_columns(&data.input_columns);
    load_dataset(path, &inputs, output_column).map_err(|e| e.to_string())
}

fn run_config(args: &OptimizeArgs) -> RunConfig {
    let mut config = RunConfig {
        mode: args.mode.clone(),
        meta_prompt_model: args.meta_prompt_model.clone(),
        num_candidates: args.num_candidates,
        num_trials: args.num_trials,
        stratified: args.stratified,
        ..Default::default()
    };
    if let Some(model) = &args.task_model {
        config.task_model = model.clone();
    }
    if let Some(model) = &args.prompter_model {
        config.prompter_model = model.clone();
    }
    if let Some(preset) = args.preset {
        config.preset = preset;
    }
    if let Some(n) = args.num_threads {
        config.num_threads = n;
    }
    if let Some(n) = args.minibatch_size {
        config.minibatch_size = n;
    }
    if let Some(seed) = args.seed {
        config.seed = seed;
    }
    if let Some(fraction) = args.train_fraction {
        config.train_fraction = fraction;
    }
    if let Some(rate) = args.rate_limit {
        config.rate_limit = rate;
    }
    config
}

fn build_prompt(args: &OptimizeArgs) -> Result<PromptDocument, String> {
    let variables = parse_columns(&args.variables);
    let mut builder = PromptBuilder::new().set_user_prompt(args.user.clone(), variables);
    if let Some(system) = &args.system {
        let system_variables = parse_columns(&args.system_variables);
        builder = builder.set_system_prompt(system.clone(), system_variables);
    }
    if let Some(path) = &args.few_shot {
        builder = builder.load_few_shot(path.clone(), args.few_shot_format);
    }
    builder.adapt().map_err(|e| e.to_string())
}

async fn run_optimize(args: OptimizeArgs) -> Result<(), String> {
    let config = run_config(&args);
    let mode = config.build_mode()?;

    let prompt = build_prompt(&args)?;

    let mut optimizer = PromptOptimizer::new();
    if let Some(path) = &args.data.dataset {
        let dataset = load_data(&args.data, path)?;
        let (train, test) = if config.stratified {
            dataset.split_stratified(config.train_fraction)
        } else {
            dataset.split(config.train_fraction)
        }
        .map_err(|e| e.to_string())?;
        info!(
            "Loaded {} record(s): train={}, validation={}",
            dataset.len(),
            train.len(),
            test.len()
        );
        optimizer = optimizer
            .with_datasets(train, test)
            .with_shared_metric(build_metric(&args.data).await?);
    }

    let inference = InferenceAdapter::new(client()?, config.build_inference_config());
    let report = optimizer
        .run(&prompt, &inference, &mode)
        .await
        .map_err(|e| e.to_string())?;

    let run_id = chrono::Local::now().format("%Y%m%d-%H%M%S").to_string();
    let repository = DirectoryRepository::new(&args.out_dir);
    let run_dir = repository.run_dir(&run_id).map_err(|e| e.to_string())?;
    report
        .prompt()
        .save(run_dir.join("prompt"))
        .map_err(|e| e.to_string())?;
    let summary = serde_json::json!({
        "run_id": run_id,
        "config": config,
        "model_attempts": inference.attempts(),
        "report": report,
    });
    repository
        .save_result(&run_id, &summary)
        .map_err(|e| e.to_string())?;

    if let Some(search) = &report.search {
        println!("Best validation score: {:.4}", search.best_score);
    }
    println!("Optimized prompt written to {}", run_dir.join("prompt").display());
    Ok(())
}

async fn run_evaluate(args: EvaluateArgs) -> Result<(), String> {
    let prompt = PromptDocument::load(&args.prompt_dir).map_err(|e| e.to_string())?;
    let path = args
        .data
        .dataset
        .as_deref()
        .ok_or("--dataset is required for evaluate")?;
    let dataset = load_data(&args.data, path)?;
    let metric = build_metric(&args.data).await?;

    let config = RunConfig {
        rate_limit: args.rate_limit,
        ..Default::default()
    };
    let inference = InferenceAdapter::new(client()?, config.build_inference_config());
    let evaluator = Evaluator::new(prompt, dataset, metric, &inference);
    let score = evaluator.aggregate_score(&args.model).await;
    println!("Score: {score:.4}");

    if let Some(output) = &args.output {
        evaluator.save(output).map_err(|e| e.to_string())?;
    }
    Ok(())
}
