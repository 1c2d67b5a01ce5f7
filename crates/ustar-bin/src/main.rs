use std::path::PathBuf;

use clap::Parser;
use clap_verbosity_flag::{InfoLevel, Verbosity};
use miette::{Context, IntoDiagnostic};
use tracing_subscriber::{util::SubscriberInitExt, EnvFilter};
use ustar_unpack::read::{ExtractOptions, DEFAULT_CHUNK_SIZE};

/// Extracts a gzip compressed ustar archive and prints the name of its top-level directory.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the archive (.tar.gz or .tar)
    archive: PathBuf,

    /// Directory the archive is extracted into
    #[arg(short = 'C', long, default_value = ".")]
    directory: PathBuf,

    /// Number of decompressed bytes processed at once, must be a multiple of 512
    #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE)]
    chunk_size: usize,

    #[command(flatten)]
    verbose: Verbosity<InfoLevel>,
}

/// Entry point of the `ustar-unpack` cli.
fn main() -> miette::Result<()> {
    // Parse the command line arguments
    let cli = Cli::parse();

    // Setup logging from the verbosity flags, `RUST_LOG` takes precedence
    let env_filter = EnvFilter::builder()
        .with_default_directive(cli.verbose.tracing_level_filter().into())
        .from_env()
        .into_diagnostic()?;

    // Setup the tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .without_time()
        .finish()
        .try_init()
        .into_diagnostic()?;

    let options = ExtractOptions::new(&cli.directory).with_chunk_size(cli.chunk_size);
    let root = ustar_unpack::fs::extract_with_options(&cli.archive, &options)
        .into_diagnostic()
        .with_context(|| format!("failed to extract {}", cli.archive.display()))?;

    tracing::info!("extracted {} into {}", cli.archive.display(), cli.directory.display());
    println!("{root}");

    Ok(())
}
