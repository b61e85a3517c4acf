//! Configuration conversion utilities for CLI arguments

use crate::cli::main_impl::Cli;
use crate::{
    config::OrchestratorConfig,
    providers::ProviderPreference,
    services::config_store::ConfigStore,
    session::ModelSelector,
};
use anyhow::{Context, Result};
use serde_json::Value;
use std::time::Duration;

/// Convert CLI arguments to an [`OrchestratorConfig`]
pub(crate) struct CliConfigBuilder;

impl CliConfigBuilder {
    /// Build the orchestrator settings from CLI arguments
    pub(crate) fn from_cli(cli: &Cli) -> Result<OrchestratorConfig> {
        let provider: ProviderPreference = cli
            .provider
            .parse()
            .with_context(|| format!("Invalid --provider '{}'", cli.provider))?;
        let model = cli
            .model
            .as_deref()
            .map_or_else(ModelSelector::default, ModelSelector::parse);

        let mut builder = OrchestratorConfig::builder()
            .model(model)
            .provider(provider)
            .inference_timeout(Duration::from_secs(cli.timeout))
            .alpha_matting(!cli.no_alpha_matting)
            .warm_up(!cli.no_warm_up);
        if let Some(output) = &cli.output {
            builder = builder.output_dir(output);
        }
        builder.build().context("Invalid pipeline configuration")
    }

    /// Validate argument combinations clap cannot express
    pub(crate) fn validate_cli(cli: &Cli) -> Result<()> {
        if cli.timeout == 0 {
            anyhow::bail!("--timeout must be at least 1 second");
        }
        if let Some(output) = &cli.output {
            if output.is_file() {
                anyhow::bail!(
                    "Output path exists and is a file, not a directory: {}",
                    output.display()
                );
            }
        }
        for assignment in &cli.set {
            parse_assignment(assignment)?;
        }
        Ok(())
    }

    /// Write every `--set key.path=value` through the store
    pub(crate) fn apply_overrides(store: &dyn ConfigStore, assignments: &[String]) -> Result<()> {
        for assignment in assignments {
            let (key, value) = parse_assignment(assignment)?;
            if !store.set(&key, value.clone()) {
                anyhow::bail!("Failed to set configuration value '{key}'");
            }
            log::info!("⚙️ {key} = {value}");
        }
        Ok(())
    }
}

/// Split `key.path=value`; the value is JSON when it parses, else a plain string
pub(crate) fn parse_assignment(assignment: &str) -> Result<(String, Value)> {
    let (key, raw) = assignment
        .split_once('=')
        .with_context(|| format!("Expected key.path=value, got '{assignment}'"))?;
    let key = key.trim();
    if key.is_empty() || key.split('.').any(str::is_empty) {
        anyhow::bail!("Invalid configuration key in '{assignment}'");
    }
    let raw = raw.trim();
    let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
    Ok((key.to_string(), value))
}
