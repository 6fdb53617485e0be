use clap::{Parser, Subcommand};
use medallion_core::Layer;

mod commands;

#[derive(Parser)]
#[command(
    name = "medallion",
    about = "Medallion: bronze/silver/gold pipelines over Parquet datasets",
    version,
    propagate_version = true,
)]
struct Cli {
    /// Emit logs as JSON lines instead of human-readable text.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline jobs in bronze → silver → gold order.
    ///
    /// Each job is invoked with a generated output path of the form
    /// <output_dir>/<layer>_<job>_<timestamp>.<ext>.
    Run {
        /// Path to medallion.toml
        #[arg(short, long, default_value = "medallion.toml")]
        config: String,
        /// Only run this layer (bronze, silver, gold).
        #[arg(short, long)]
        layer: Option<Layer>,
        /// Print the planned jobs without running them.
        #[arg(long)]
        dry_run: bool,
    },
    /// Upsert a Parquet file or dataset into a target dataset.
    Merge(commands::merge::MergeArgs),
    /// Show row count, schema and files of a dataset.
    Inspect {
        /// Dataset directory
        path: String,
        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,
        /// Number of rows to preview (text format only)
        #[arg(long, default_value = "10")]
        head: usize,
    },
    /// Generate a medallion.toml scaffold
    Init {
        #[arg(short, long, default_value = ".")]
        path: String,
        /// Pipeline name (default: directory name)
        #[arg(short, long)]
        name: Option<String>,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive("medallion=info".parse()?);
    if cli.json_logs {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    match cli.command {
        Commands::Run {
            config,
            layer,
            dry_run,
        } => commands::run::run(&config, layer, dry_run),
        Commands::Merge(args) => commands::merge::merge(args),
        Commands::Inspect { path, format, head } => {
            commands::inspect::inspect(&path, &format, head)
        }
        Commands::Init { path, name } => commands::init::init(&path, name.as_deref()),
    }
}
