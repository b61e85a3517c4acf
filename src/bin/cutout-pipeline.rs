//! Cutout pipeline CLI tool
//!
//! Command-line interface for batch background removal with the
//! cutout-pipeline library.

#[cfg(feature = "cli")]
use cutout_pipeline::cli;

#[cfg(feature = "cli")]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    cli::main().await
}

#[cfg(not(feature = "cli"))]
fn main() {
    eprintln!("CLI feature not enabled. Please rebuild with --features cli");
    std::process::exit(1);
}
