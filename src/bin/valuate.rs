#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use valuate::analyst::{analyze, resolve_api_key, Dependencies};
use valuate::cache::{CachedGateway, SqliteCompletionCache};
use valuate::config::AnalystConfig;
use valuate::pipeline::{PipelineContext, PipelineRunner, PipelineStage, RunnerConfig};
use valuate::stages::PeerStage;
use valuate::trace::{JsonlTraceSink, TraceSink};

#[derive(Parser)]
#[command(name = "valuate", version, about = "Equity research pipeline CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args)]
struct RunArgs {
    /// Company name or ticker symbol
    #[arg(long)]
    company: String,
    /// TOML configuration file (defaults to $VALUATE_CONFIG, then built-in defaults)
    #[arg(long)]
    config: Option<PathBuf>,
    /// API key (defaults to $VALUATE_API_KEY, then $OPENAI_API_KEY)
    #[arg(long)]
    api_key: Option<String>,
    /// Serve repeated model calls from this SQLite completion cache
    #[arg(long)]
    cache: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full analysis and print the recommendation
    Analyze {
        #[command(flatten)]
        run: RunArgs,
        /// Write one JSON line per stage outcome
        #[arg(long)]
        trace: Option<PathBuf>,
        /// Write the final pipeline context as JSON
        #[arg(long)]
        context_out: Option<PathBuf>,
    },
    /// Run only the industry peer analysis and print its JSON result
    Peers {
        #[command(flatten)]
        run: RunArgs,
    },
    /// Export the completion cache to JSONL
    CacheExport {
        #[arg(long)]
        db: Option<PathBuf>,
        #[arg(long)]
        out: PathBuf,
    },
    /// Prune the completion cache (by age and/or size)
    CachePrune {
        #[arg(long)]
        db: Option<PathBuf>,
        #[arg(long)]
        max_age_days: Option<u64>,
        #[arg(long)]
        max_rows: Option<usize>,
    },
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "valuate=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn prepare(args: &RunArgs) -> Result<(AnalystConfig, Dependencies), Box<dyn std::error::Error>> {
    let config = AnalystConfig::load(args.config.as_deref())?;
    let api_key = resolve_api_key(args.api_key.as_deref(), |k| std::env::var(k).ok())?;
    let mut deps = Dependencies::from_config(&config, &api_key)?;
    if let Some(path) = &args.cache {
        let cache = SqliteCompletionCache::new(path)?;
        deps.gateway = Arc::new(CachedGateway::new(deps.gateway.clone(), Arc::new(cache)));
    }
    Ok((config, deps))
}

fn write_json(path: &Path, value: &serde_json::Value) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(value)?)?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_tracing();

    match cli.command {
        Commands::Analyze {
            run,
            trace,
            context_out,
        } => {
            let (config, mut deps) = prepare(&run)?;
            let trace_worker = match trace {
                Some(path) => {
                    let (sink, worker) = JsonlTraceSink::new(path)?;
                    deps = deps.with_trace(Arc::new(sink) as Arc<dyn TraceSink>);
                    Some(worker)
                }
                None => None,
            };

            let result = analyze(&run.company, &config, &deps).await;

            drop(deps);
            if let Some(worker) = trace_worker {
                worker.join()?;
            }

            let recommendation = result?;
            if let Some(path) = context_out {
                let dump = serde_json::json!({
                    "company": recommendation.company,
                    "run_id": recommendation.run.run_id,
                    "outcomes": recommendation.run.outcomes,
                    "context": recommendation.run.context,
                });
                write_json(&path, &dump)?;
            }
            println!("{}", recommendation.text);
        }
        Commands::Peers { run } => {
            let (config, deps) = prepare(&run)?;
            let stage = PeerStage::new(
                run.company.trim(),
                deps.gateway.clone(),
                deps.market.clone(),
                config.model.clone(),
                config.peers.clone(),
            );
            let stages: Vec<Box<dyn PipelineStage>> = vec![Box::new(stage)];
            let runner = PipelineRunner::new(RunnerConfig {
                stage_timeout: config.pipeline.stage_timeout(),
            });
            let context = runner
                .run(&stages, PipelineContext::new())
                .await
                .into_result()?;
            println!("{}", serde_json::to_string_pretty(&context)?);
        }
        Commands::CacheExport { db, out } => {
            let path = db.unwrap_or_else(SqliteCompletionCache::default_path);
            let cache = SqliteCompletionCache::new(path)?;
            let rows = cache.export_jsonl(out).await?;
            println!("exported {rows} rows");
        }
        Commands::CachePrune {
            db,
            max_age_days,
            max_rows,
        } => {
            if max_age_days.is_none() && max_rows.is_none() {
                return Err("cache-prune requires --max-age-days and/or --max-rows".into());
            }
            let path = db.unwrap_or_else(SqliteCompletionCache::default_path);
            let cache = SqliteCompletionCache::new(path)?;
            let _lock = cache.lock_exclusive()?;
            let stats = cache.prune(max_age_days, max_rows).await?;
            println!(
                "pruned {} rows; {} rows remain",
                stats.deleted, stats.remaining
            );
        }
    }

    Ok(())
}
