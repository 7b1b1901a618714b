use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use sjtagent_core::config::{AppConfig, ModelConfig};
use sjtagent_core::traits::ModelClient;
use sjtagent_pipeline::{
    ComparisonRow, EvaluationFailure, EvaluationReport, Evaluator, FileDataSource,
    GenerationRequest, Generator, PipelineError,
};

#[derive(Parser)]
#[command(name = "sjtagent", version, about = "Generate and evaluate situational judgement test items")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "sjtagent.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate one SJT item for a trait
    Generate {
        /// Target personality trait
        #[arg(long = "trait")]
        trait_name: String,
        /// Reference self-report item the situation should translate
        #[arg(long)]
        item: String,
        /// Target population (overrides [generation].population_profile)
        #[arg(long)]
        population: Option<String>,
        /// Write the item here instead of stdout
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Compare items from several methods pair by pair
    Evaluate {
        /// Item bank per method, as method=path (repeatable)
        #[arg(long = "data", required = true)]
        data: Vec<String>,
        /// Traits to evaluate (repeatable)
        #[arg(long = "trait", required = true)]
        traits: Vec<String>,
        /// Only print the projected token use and cost
        #[arg(long)]
        estimate: bool,
        /// Write the report here instead of stdout
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Show current configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("sjtagent=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    let config = if cli.config.exists() {
        AppConfig::load(&cli.config)?
    } else {
        eprintln!(
            "Warning: {} not found. Using OPENAI_API_KEY with default settings.",
            cli.config.display()
        );
        create_env_config()
    };

    match cli.command {
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::Generate {
            trait_name,
            item,
            population,
            out,
        } => {
            let client = model_client(&config.model);
            let generator = Generator::new(client, &config)?;
            let mut request = GenerationRequest::configured(trait_name, item, &config.generation);
            if let Some(population) = population {
                request.population_profile = population;
            }

            let cancel = cancel_on_ctrl_c();
            match generator.generate(&request, &cancel).await {
                Ok(generated) => write_json(out.as_deref(), &generated)?,
                Err(PipelineError::Cancelled(partial)) => {
                    warn!(
                        steps = partial.trace.len(),
                        input_tokens = partial.usage().input_tokens,
                        "Generation cancelled; writing partial state"
                    );
                    write_json(out.as_deref(), &partial)?;
                }
                Err(PipelineError::Run(failure)) => {
                    let usage = failure.cause.as_ref().map(|c| c.usage).unwrap_or_default();
                    warn!(
                        kind = %failure.kind,
                        step = %failure.step,
                        entry = failure.entry,
                        input_tokens = usage.input_tokens,
                        output_tokens = usage.output_tokens,
                        "Generation failed"
                    );
                    return Err(PipelineError::Run(failure).into());
                }
                Err(e) => return Err(e.into()),
            }
        }
        Commands::Evaluate {
            data,
            traits,
            estimate,
            out,
        } => {
            let source = FileDataSource::from_specs(&data)?;
            let methods = source.methods();
            let datasets = source.load_items(&traits, &methods)?;
            let evaluator = Evaluator::new(model_client(&config.model), &config);

            if estimate {
                let estimates: BTreeMap<_, _> = datasets
                    .iter()
                    .map(|(trait_name, items)| (trait_name, evaluator.estimate(trait_name, items)))
                    .collect();
                return write_json(out.as_deref(), &estimates);
            }

            let cancel = cancel_on_ctrl_c();
            let report = evaluator.evaluate(datasets, &methods, &cancel).await?;
            if let Some(failure) = &report.failure {
                warn!(
                    trait_name = %failure.trait_name,
                    batch = failure.batch,
                    error = %failure.error,
                    "Evaluation aborted"
                );
            }
            if !report.complete {
                warn!("Evaluation incomplete; the report covers judged batches only");
            }
            write_json(out.as_deref(), &EvaluationOutput::from(&report))?;
        }
    }

    Ok(())
}

/// Report layout written by `evaluate`.
#[derive(Serialize)]
struct EvaluationOutput<'a> {
    complete: bool,
    methods: &'a [String],
    overall_win_rates: &'a sjtagent_pipeline::WinRates,
    win_rates: BTreeMap<&'a str, &'a sjtagent_pipeline::WinRates>,
    comparisons: BTreeMap<&'a str, &'a [ComparisonRow]>,
    skipped_batches: BTreeMap<&'a str, usize>,
    failure: Option<&'a EvaluationFailure>,
    input_tokens: u64,
    output_tokens: u64,
    cost: f64,
}

impl<'a> From<&'a EvaluationReport> for EvaluationOutput<'a> {
    fn from(report: &'a EvaluationReport) -> Self {
        Self {
            complete: report.complete,
            methods: &report.methods,
            overall_win_rates: &report.overall_win_rates,
            win_rates: report
                .traits
                .iter()
                .map(|(name, t)| (name.as_str(), &t.win_rates))
                .collect(),
            comparisons: report
                .traits
                .iter()
                .map(|(name, t)| (name.as_str(), t.rows.as_slice()))
                .collect(),
            skipped_batches: report
                .traits
                .iter()
                .map(|(name, t)| (name.as_str(), t.aggregate.skipped.len()))
                .collect(),
            failure: report.failure.as_ref(),
            input_tokens: report.usage.input_tokens,
            output_tokens: report.usage.output_tokens,
            cost: report.cost,
        }
    }
}

fn model_client(config: &ModelConfig) -> Arc<dyn ModelClient> {
    Arc::from(sjtagent_llm::create_client(config))
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Cancelling run...");
        cancel_clone.cancel();
    });
    cancel
}

fn write_json<T: Serialize>(out: Option<&Path>, value: &T) -> anyhow::Result<()> {
    let text = serde_json::to_string_pretty(value)?;
    match out {
        Some(path) => {
            std::fs::write(path, text)?;
            info!(path = %path.display(), "Wrote output");
        }
        None => println!("{}", text),
    }
    Ok(())
}

fn create_env_config() -> AppConfig {
    let mut model = ModelConfig::new(
        std::env::var("SJTAGENT_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string()),
    );
    model.api_key = std::env::var("OPENAI_API_KEY").ok();
    model.base_url = std::env::var("OPENAI_BASE_URL").ok();

    AppConfig {
        model,
        engine: Default::default(),
        generation: Default::default(),
        evaluation: Default::default(),
    }
}
