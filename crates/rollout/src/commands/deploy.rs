//! Deploy command implementation

use camino::Utf8Path;
use clap::Args;
use miette::{IntoDiagnostic, Result};
use std::io::Write;
use std::process::ExitCode;

use crate::config::{Config, Secrets};
use crate::recipe::engine::DeployPlan;
use crate::recipe::RecipeEngine;
use crate::record::DeployRecord;
use crate::remote::ssh::SshConnector;
use crate::remote::Connector;
use crate::report::{ConsoleReporter, DeploymentOutcome, Reporter};

/// Arguments for the deploy command
#[derive(Debug, Default, Args)]
pub struct DeployArgs {
    /// Dry run - show the target and recipe without connecting
    #[arg(long)]
    pub dry_run: bool,
}

/// Run the deploy command
pub fn run(config_dir: &Utf8Path, args: DeployArgs) -> Result<ExitCode> {
    tracing::info!("Loading configuration from {}", config_dir);

    let secrets = Secrets::from_env();
    let mut reporter = ConsoleReporter::stdio();

    let plan = match prepare(config_dir, &secrets) {
        Ok(plan) => plan,
        Err(err) => {
            let outcome = DeploymentOutcome::failed(&err, 0);
            reporter.finalize(&outcome);
            return Ok(outcome.exit_status());
        }
    };

    if args.dry_run {
        let last = last_deploy(config_dir, &plan.target.host);
        print_plan(&mut std::io::stdout().lock(), &plan, last.as_ref()).into_diagnostic()?;
        return Ok(ExitCode::SUCCESS);
    }

    let outcome = deploy(config_dir, &plan, &SshConnector, &mut reporter);
    Ok(outcome.exit_status())
}

/// Load and validate everything a run needs
pub fn prepare(config_dir: &Utf8Path, secrets: &Secrets) -> crate::Result<DeployPlan> {
    let config = Config::load(config_dir)?;
    DeployPlan::from_config(&config, secrets, config_dir)
}

/// Execute `plan` and record the result under `config_dir`
pub fn deploy<C: Connector>(
    config_dir: &Utf8Path,
    plan: &DeployPlan,
    connector: &C,
    reporter: &mut dyn Reporter,
) -> DeploymentOutcome {
    let mut engine = RecipeEngine::new(plan);
    let outcome = engine.run(connector, reporter);

    let record = DeployRecord::new(&plan.target.host, &plan.artifact, &outcome);
    let path = DeployRecord::path_for(config_dir, &plan.target.host);
    match record.save(&path) {
        Ok(()) => tracing::debug!(path = %path, "Saved deploy record"),
        Err(e) => tracing::warn!("Failed to save deploy record to {}: {}", path, e),
    }

    outcome
}

/// The record of the previous run to `host`, if one can be read
fn last_deploy(config_dir: &Utf8Path, host: &str) -> Option<DeployRecord> {
    let path = DeployRecord::path_for(config_dir, host);
    match DeployRecord::load(&path) {
        Ok(record) => record,
        Err(e) => {
            tracing::warn!("Ignoring deploy record {}: {}", path, e);
            None
        }
    }
}

/// Describe what a run would do. Secret values are masked.
pub fn print_plan<W: Write>(
    out: &mut W,
    plan: &DeployPlan,
    last: Option<&DeployRecord>,
) -> std::io::Result<()> {
    writeln!(out, "Would deploy {}", plan.artifact)?;
    writeln!(out)?;
    writeln!(out, "Target: {}", plan.target.display_address())?;
    writeln!(out, "Staging: {}", plan.staging_path)?;
    writeln!(out, "Dashboard: {}", plan.dashboard_url)?;
    match last {
        Some(record) => writeln!(
            out,
            "Last deploy: {} ({}, {} step(s)): {}",
            record.timestamp.format("%Y-%m-%d %H:%M:%S UTC"),
            if record.success { "succeeded" } else { "failed" },
            record.steps_executed,
            record.message
        )?,
        None => writeln!(out, "Last deploy: none recorded")?,
    }
    writeln!(out)?;

    let total = plan.recipe.len();
    for step in plan.recipe.steps() {
        let policy = if step.is_fatal() { "" } else { " (best-effort)" };
        writeln!(out, "[{}/{}] {}{}", step.ordinal, total, step.label, policy)?;
        for line in step.display_command().lines() {
            writeln!(out, "    {}", line)?;
        }
    }

    Ok(())
}
