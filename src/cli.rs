use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "clipforge")]
#[command(author, version, about = "Resumable video pipeline engine")]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create a job, or a batch of jobs sharing one source
    Enqueue {
        /// JSON file holding the list of pipeline steps
        #[arg(long)]
        pipeline: PathBuf,

        /// Source video: an external reference, or a stored URL with --staged
        #[arg(long)]
        source: String,

        /// The source is already in durable storage
        #[arg(long)]
        staged: bool,

        /// Number of jobs to create; more than one creates a batch
        #[arg(long, default_value = "1")]
        count: u32,

        /// Batch name
        #[arg(long)]
        name: Option<String>,
    },

    /// Run or resume one job
    RunJob {
        /// Job ID
        job_id: String,
    },

    /// Run a batch using its stored shared source
    RunBatch {
        /// Batch ID
        batch_id: String,
    },

    /// Report jobs stuck in processing
    Sweep {
        /// Mark stuck jobs as failed
        #[arg(long)]
        fail: bool,
    },

    /// Run the background worker until interrupted
    Worker,

    /// Store a reference image for generation steps
    AddReferenceImage {
        /// Image URL
        #[arg(long)]
        url: String,

        /// Human-readable label
        #[arg(long)]
        label: Option<String>,
    },

    /// Check that required external tools are available
    CheckTools,

    /// Validate configuration file
    Validate {
        /// Config file to validate (uses default if not specified)
        config: Option<PathBuf>,
    },

    /// Display version information
    Version,
}
