//! Tabprobe CLI - evaluate an LLM against a tabular dataset

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use colored::Colorize;

use tabprobe::config::{FileConfig, ProbeConfig};
use tabprobe::dataset::{load_dataset, load_metadata};
use tabprobe::error::{FixSuggestion, ProbeError};
use tabprobe::event::{RunRegistry, RunStream};
use tabprobe::llm::create_client;
use tabprobe::report::render_html;
use tabprobe::runtime::{DifficultyFilter, Orchestrator, RunOptions};
use tabprobe::server::{serve, ServerContext};

#[derive(Parser)]
#[command(name = "tabprobe")]
#[command(about = "Evaluate an LLM by having it author, repair and execute computation DAGs over a dataset")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute the full pipeline and write a report JSON
    Run {
        /// Dataset bundle (JSON object file)
        #[arg(long)]
        dataset: PathBuf,

        /// Metadata document (missing file is non-fatal)
        #[arg(long)]
        metadata: PathBuf,

        /// Output report path
        #[arg(short, long)]
        output: PathBuf,

        /// Number of questions to generate
        #[arg(short, long)]
        questions: Option<usize>,

        /// Keep only questions of this difficulty (easy|medium|hard|all)
        #[arg(short, long, default_value = "all")]
        difficulty: String,

        /// Override the LLM provider (openai, mock)
        #[arg(long)]
        provider: Option<String>,

        /// Override the model
        #[arg(short, long)]
        model: Option<String>,

        /// Verbose logging
        #[arg(short, long)]
        verbose: bool,
    },

    /// Render a stored report as HTML
    Report {
        /// Results file produced by `run`
        #[arg(long)]
        results: PathBuf,

        /// Output HTML path
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Serve the run API (POST /run, SSE events, stored results)
    Serve {
        /// Dataset bundle (JSON object file)
        #[arg(long)]
        dataset: PathBuf,

        /// Metadata document (missing file is non-fatal)
        #[arg(long)]
        metadata: PathBuf,

        /// Bind address
        #[arg(long, default_value = "127.0.0.1:8080")]
        addr: String,

        /// Directory for result files
        #[arg(long, default_value = ".")]
        results_dir: PathBuf,

        /// Override the LLM provider (openai, mock)
        #[arg(long)]
        provider: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    // Load .env file (ignore if not present)
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let verbose = matches!(&cli.command, Commands::Run { verbose: true, .. });
    init_tracing(verbose);

    let exit_code = match cli.command {
        Commands::Run {
            dataset,
            metadata,
            output,
            questions,
            difficulty,
            provider,
            model,
            ..
        } => run_command(dataset, metadata, output, questions, difficulty, provider, model).await,
        Commands::Report { results, output } => report_command(results, output),
        Commands::Serve {
            dataset,
            metadata,
            addr,
            results_dir,
            provider,
        } => serve_command(dataset, metadata, addr, results_dir, provider).await,
    };

    std::process::exit(exit_code);
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(default_level.into()),
        )
        .init();
}

fn fail(e: &ProbeError) -> i32 {
    eprintln!("{} {}", "Error:".red().bold(), e);
    if let Some(suggestion) = e.fix_suggestion() {
        eprintln!("  {} {}", "Fix:".yellow(), suggestion);
    }
    e.exit_code()
}

fn build_config(provider: Option<String>, model: Option<String>) -> Result<(FileConfig, ProbeConfig), ProbeError> {
    let file_config = FileConfig::load()?.with_env();
    let mut config = ProbeConfig::from_file_config(&file_config);
    if let Some(p) = provider {
        config.provider = p;
    }
    if let Some(m) = model {
        config.model = m;
    }
    Ok((file_config, config))
}

async fn run_command(
    dataset_path: PathBuf,
    metadata_path: PathBuf,
    output: PathBuf,
    questions: Option<usize>,
    difficulty: String,
    provider: Option<String>,
    model: Option<String>,
) -> i32 {
    let (file_config, config) = match build_config(provider, model) {
        Ok(pair) => pair,
        Err(e) => return fail(&e),
    };

    let difficulty: DifficultyFilter = match difficulty.parse() {
        Ok(d) => d,
        Err(e) => return fail(&e),
    };

    let dataset = match load_dataset(&dataset_path) {
        Ok(d) => Arc::new(d),
        Err(e) => return fail(&e),
    };
    let metadata = match load_metadata(&metadata_path) {
        Ok(m) => m.map(Arc::new),
        Err(e) => return fail(&e),
    };

    let llm = match create_client(&config.provider, &file_config) {
        Ok(c) => c,
        Err(e) => return fail(&e),
    };

    println!(
        "{} Using provider: {} | model: {}",
        "→".cyan(),
        config.provider.cyan().bold(),
        config.model.cyan()
    );

    let dataset_name = dataset_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "dataset".to_string());

    let opts = RunOptions {
        num_questions: questions.unwrap_or(config.question_count),
        difficulty,
    };

    let orchestrator = Orchestrator::new(llm, config.clone());
    let stream = RunStream::new(config.event_capacity);
    let cancelled = Arc::new(AtomicBool::new(false));

    match orchestrator
        .run_to_file(
            "cli",
            dataset,
            metadata,
            &opts,
            &stream,
            &cancelled,
            &dataset_name,
            &output,
        )
        .await
    {
        Ok(report) => {
            let s = &report.summary;
            println!(
                "{} {}/{} passed ({:.1}%), {} total iterations",
                "✓".green(),
                s.passed,
                s.total,
                s.pass_rate * 100.0,
                s.total_iterations
            );
            println!("  Report: {}", output.display());
            0
        }
        Err(e) => fail(&e),
    }
}

fn report_command(results: PathBuf, output: PathBuf) -> i32 {
    let raw = match std::fs::read_to_string(&results) {
        Ok(r) => r,
        Err(e) => return fail(&ProbeError::Io(e)),
    };
    let report: tabprobe::RunReport = match serde_json::from_str(&raw) {
        Ok(r) => r,
        Err(e) => {
            return fail(&ProbeError::InvalidReport {
                reason: e.to_string(),
            })
        }
    };

    let html = render_html(&report);
    if let Err(e) = std::fs::write(&output, html) {
        return fail(&ProbeError::Io(e));
    }
    println!("{} HTML report written to {}", "✓".green(), output.display());
    0
}

async fn serve_command(
    dataset_path: PathBuf,
    metadata_path: PathBuf,
    addr: String,
    results_dir: PathBuf,
    provider: Option<String>,
) -> i32 {
    let (file_config, config) = match build_config(provider, None) {
        Ok(pair) => pair,
        Err(e) => return fail(&e),
    };

    let dataset = match load_dataset(&dataset_path) {
        Ok(d) => Arc::new(d),
        Err(e) => return fail(&e),
    };
    let metadata = match load_metadata(&metadata_path) {
        Ok(m) => m.map(Arc::new),
        Err(e) => return fail(&e),
    };
    let llm = match create_client(&config.provider, &file_config) {
        Ok(c) => c,
        Err(e) => return fail(&e),
    };

    let dataset_name = dataset_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "dataset".to_string());

    let registry = RunRegistry::new(config.grace_period, config.event_capacity);
    let ctx = Arc::new(ServerContext {
        registry,
        llm,
        config,
        dataset,
        metadata,
        dataset_name,
        results_dir,
    });

    println!("{} Serving run API on http://{}", "→".cyan(), addr);
    match serve(ctx, &addr).await {
        Ok(()) => 0,
        Err(e) => fail(&e),
    }
}
