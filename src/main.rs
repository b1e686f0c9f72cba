mod cli;

use std::path::Path;

use anyhow::{Context, Result};
use cf_core::config::Config;
use cf_core::{BatchId, JobId, PipelineStep, SourceRef};
use cf_db::models::Job;
use cf_db::queries::{batches, jobs, reference_images};
use cf_pipeline::EngineContext;
use clap::Parser;
use cli::{Cli, Commands};
use tokio_util::sync::CancellationToken;

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Respect RUST_LOG env var if set, otherwise use defaults based on verbose flag
    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        if cli.verbose {
            "clipforge=debug,cf_pipeline=debug,cf_remote=debug,cf_av=debug,cf_db=debug".to_string()
        } else {
            "clipforge=info,cf_pipeline=info,cf_remote=info,cf_av=warn,cf_db=warn".to_string()
        }
    });

    tracing_subscriber::fmt()
        .with_env_filter(&env_filter)
        .init();

    let config_path = cli.config.as_deref();

    match cli.command {
        Commands::Enqueue {
            pipeline,
            source,
            staged,
            count,
            name,
        } => enqueue(config_path, &pipeline, source, staged, count, name),
        Commands::RunJob { job_id } => {
            let job_id: JobId = job_id.parse().context("invalid job ID")?;
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(run_job(config_path, job_id))
        }
        Commands::RunBatch { batch_id } => {
            let batch_id: BatchId = batch_id.parse().context("invalid batch ID")?;
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(run_batch(config_path, batch_id))
        }
        Commands::Sweep { fail } => sweep(config_path, fail),
        Commands::Worker => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(worker(config_path))
        }
        Commands::AddReferenceImage { url, label } => {
            add_reference_image(config_path, &url, label.as_deref())
        }
        Commands::CheckTools => check_tools(config_path),
        Commands::Validate {
            config: validate_path,
        } => {
            let path = validate_path.or(cli.config);
            validate_config(path.as_deref())
        }
        Commands::Version => {
            println!("clipforge {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

fn enqueue(
    config_path: Option<&Path>,
    pipeline: &Path,
    source: String,
    staged: bool,
    count: u32,
    name: Option<String>,
) -> Result<()> {
    let config = Config::load_or_default(config_path);

    let raw = std::fs::read_to_string(pipeline)
        .with_context(|| format!("failed to read pipeline file {}", pipeline.display()))?;
    let steps: Vec<PipelineStep> =
        serde_json::from_str(&raw).context("pipeline file is not a valid list of steps")?;
    if count == 0 {
        anyhow::bail!("--count must be at least 1");
    }

    let source = if staged {
        SourceRef::Staged(source)
    } else {
        SourceRef::External(source)
    };

    let pool = cf_db::init_pool(&config.engine.db_path)?;
    let conn = cf_db::get_conn(&pool)?;

    if count == 1 && name.is_none() {
        let job = jobs::create_job(
            &conn,
            &jobs::NewJob {
                steps,
                source,
                batch_id: None,
            },
        )?;
        println!("Queued job {}", job.id);
        return Ok(());
    }

    let name = name.unwrap_or_else(|| "batch".to_string());
    let (batch, children) = batches::create_batch_with_jobs(&conn, &name, &steps, &source, count)?;
    println!("Created batch {} ({}) with {} jobs", batch.id, batch.name, children.len());
    for job in &children {
        println!("  {}", job.id);
    }
    Ok(())
}

async fn run_job(config_path: Option<&Path>, job_id: JobId) -> Result<()> {
    let ctx = EngineContext::from_config(Config::load_or_default(config_path))?;
    let job = cf_pipeline::run_job(&ctx, job_id).await?;
    print_job(&job);
    Ok(())
}

async fn run_batch(config_path: Option<&Path>, batch_id: BatchId) -> Result<()> {
    let ctx = EngineContext::from_config(Config::load_or_default(config_path))?;
    let batch = cf_pipeline::run_batch(&ctx, batch_id).await?;

    println!("Batch: {} ({})", batch.id, batch.name);
    println!("Status: {}", batch.status);
    println!(
        "Jobs: {} completed, {} failed, {} total",
        batch.completed_jobs, batch.failed_jobs, batch.total_jobs
    );
    Ok(())
}

fn print_job(job: &Job) {
    println!("Job: {}", job.id);
    println!("Status: {}", job.status);
    println!("Steps: {}/{}", job.current_step, job.enabled_steps().len());
    for (i, result) in job.step_results.iter().enumerate() {
        println!("  {}. {} -> {}", i + 1, result.label, result.output_url);
    }
    if let Some(ref url) = job.output_url {
        println!("Output: {url}");
    }
    if let Some(ref error) = job.error {
        println!("Error: {error}");
    }
}

fn sweep(config_path: Option<&Path>, fail: bool) -> Result<()> {
    let ctx = EngineContext::from_config(Config::load_or_default(config_path))?;
    let report = cf_pipeline::sweep_stuck_jobs(&ctx, fail)?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn worker(config_path: Option<&Path>) -> Result<()> {
    let ctx = EngineContext::from_config(Config::load_or_default(config_path))?;
    let cancel = CancellationToken::new();

    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupt received; finishing current work");
            on_signal.cancel();
        }
    });

    cf_pipeline::run_worker(ctx, cancel).await;
    Ok(())
}

fn add_reference_image(config_path: Option<&Path>, url: &str, label: Option<&str>) -> Result<()> {
    let config = Config::load_or_default(config_path);
    let pool = cf_db::init_pool(&config.engine.db_path)?;
    let conn = cf_db::get_conn(&pool)?;
    let image = reference_images::create_reference_image(&conn, url, label)?;
    println!("{}", image.id);
    Ok(())
}

fn check_tools(config_path: Option<&Path>) -> Result<()> {
    println!("Checking external tools...\n");

    let config = Config::load_or_default(config_path);
    let tools = cf_av::ToolRegistry::discover(&config.tools).check_all();
    let mut all_ok = true;

    for tool in &tools {
        let status = if tool.available {
            "✓"
        } else {
            all_ok = false;
            "✗"
        };

        print!("{} {}", status, tool.name);
        if let Some(ref version) = tool.version {
            print!(" ({})", version.lines().next().unwrap_or(""));
        }
        if let Some(ref path) = tool.path {
            print!(" - {}", path.display());
        }
        println!();
    }

    println!();
    if all_ok {
        println!("All required tools are available!");
    } else {
        println!("Some tools are missing. Overlay, mix, clip and trim steps need ffmpeg and ffprobe.");
    }

    Ok(())
}

fn validate_config(path: Option<&Path>) -> Result<()> {
    let config = match path {
        Some(p) => {
            println!("Validating config: {}", p.display());
            let raw = std::fs::read_to_string(p)
                .with_context(|| format!("failed to read {}", p.display()))?;
            let config = Config::from_json(&raw)?;
            println!("✓ Configuration is valid");
            config
        }
        None => {
            println!("No config file specified, using defaults");
            Config::default()
        }
    };

    println!("  Database: {}", config.engine.db_path.display());
    println!("  Scratch: {}", config.engine.scratch_dir.display());
    println!("  Storage backend: {:?}", config.storage.backend);
    println!(
        "  Resolver: {} attempts, {} req/s",
        config.resolver.max_attempts, config.resolver.requests_per_second
    );

    let warnings = config.validate();
    if warnings.is_empty() {
        println!("No warnings");
    } else {
        println!("Warnings:");
        for warning in warnings {
            println!("  - {warning}");
        }
    }

    Ok(())
}
