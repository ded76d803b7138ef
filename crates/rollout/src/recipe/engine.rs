//! Recipe execution
//!
//! The engine checks the local artifact, opens exactly one session, uploads
//! the artifact, then runs the recipe's steps strictly in order. The first
//! fatal failure aborts the run; already-applied steps are not rolled back.
//! The session is closed exactly once on every path after it was opened.

use camino::{Utf8Path, Utf8PathBuf};

use super::{EnvironmentPayload, Recipe, Step};
use crate::config::{Config, Secrets, TimingConfig};
use crate::error::ErrorCategory;
use crate::remote::{transfer, Connector, DeploymentTarget, RemoteChannel, StderrKind};
use crate::report::{DeploymentOutcome, Reporter};
use crate::{Error, Result};

/// Everything one run needs, resolved before any network activity
#[derive(Debug, Clone)]
pub struct DeployPlan {
    pub target: DeploymentTarget,
    /// Local release archive
    pub artifact: Utf8PathBuf,
    /// Upload location on the remote host
    pub staging_path: String,
    pub recipe: Recipe,
    pub timing: TimingConfig,
    pub dashboard_url: String,
}

impl DeployPlan {
    /// Validate the configuration and resolve the plan.
    ///
    /// A relative artifact path is resolved against `config_dir`.
    pub fn from_config(
        config: &Config,
        secrets: &Secrets,
        config_dir: &Utf8Path,
    ) -> Result<Self> {
        config.validate(secrets)?;

        let target = config.deployment_target(secrets)?;
        let payload = EnvironmentPayload::from_config(config, secrets)?;
        let recipe = Recipe::standard(config, &payload);

        let artifact = if config.artifact.local_path.is_absolute() {
            config.artifact.local_path.clone()
        } else {
            config_dir.join(&config.artifact.local_path)
        };

        Ok(Self {
            target,
            artifact,
            staging_path: config.artifact.staging_path.clone(),
            recipe,
            timing: config.timing.clone(),
            dashboard_url: config.dashboard_url(),
        })
    }
}

/// Where the engine is in a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    NotStarted,
    Connecting,
    Uploading,
    /// Running the step with this ordinal
    Step(usize),
    Succeeded,
    Aborted(ErrorCategory),
}

/// Executes a [`DeployPlan`] against a remote host
pub struct RecipeEngine<'a> {
    plan: &'a DeployPlan,
    state: EngineState,
    steps_executed: usize,
}

impl<'a> RecipeEngine<'a> {
    /// Create an engine for `plan`
    pub fn new(plan: &'a DeployPlan) -> Self {
        Self {
            plan,
            state: EngineState::NotStarted,
            steps_executed: 0,
        }
    }

    /// Current state
    pub fn state(&self) -> EngineState {
        self.state
    }

    /// Number of steps dispatched so far
    pub fn steps_executed(&self) -> usize {
        self.steps_executed
    }

    /// Run the plan to completion or to the first fatal failure
    pub fn run<C: Connector>(
        &mut self,
        connector: &C,
        reporter: &mut dyn Reporter,
    ) -> DeploymentOutcome {
        let outcome = match self.execute(connector, reporter) {
            Ok(()) => {
                self.state = EngineState::Succeeded;
                DeploymentOutcome::succeeded(self.steps_executed, &self.plan.dashboard_url)
            }
            Err(err) => {
                tracing::debug!(error = ?err, state = ?self.state, "Run aborted");
                self.state = EngineState::Aborted(err.category());
                DeploymentOutcome::failed(&err, self.steps_executed)
            }
        };

        reporter.finalize(&outcome);
        outcome
    }

    fn execute<C: Connector>(
        &mut self,
        connector: &C,
        reporter: &mut dyn Reporter,
    ) -> Result<()> {
        // Checked before any network activity
        transfer::ensure_artifact(&self.plan.artifact)?;

        self.state = EngineState::Connecting;
        reporter.phase(&format!(
            "Connecting to {}",
            self.plan.target.display_address()
        ));
        let mut channel = connector.open(&self.plan.target)?;

        let result = self.drive(&mut channel, reporter);

        if let Err(e) = channel.close() {
            tracing::warn!("{}", e);
        }

        result
    }

    fn drive<R: RemoteChannel>(
        &mut self,
        channel: &mut R,
        reporter: &mut dyn Reporter,
    ) -> Result<()> {
        self.state = EngineState::Uploading;
        reporter.phase(&format!(
            "Uploading {} to {}",
            self.plan.artifact, self.plan.staging_path
        ));
        transfer::upload(channel, &self.plan.artifact, &self.plan.staging_path)?;

        let total = self.plan.recipe.len();
        for step in self.plan.recipe.steps() {
            self.state = EngineState::Step(step.ordinal);
            self.run_step(channel, step, total, reporter)?;
        }

        Ok(())
    }

    fn run_step<R: RemoteChannel>(
        &mut self,
        channel: &mut R,
        step: &Step,
        total: usize,
        reporter: &mut dyn Reporter,
    ) -> Result<()> {
        reporter.step_started(step, total);

        if !step.settle.is_zero() {
            tracing::debug!(
                step = step.ordinal,
                settle_ms = step.settle.as_millis() as u64,
                "Settling"
            );
            std::thread::sleep(step.settle);
        }

        tracing::info!(step = step.ordinal, "→ {}", step.display_command());
        let executed = channel.execute(&step.command, step.wait_policy(&self.plan.timing));
        self.steps_executed += 1;

        match executed {
            Ok(result) => {
                reporter.report(step, &result);

                let fatal_stderr =
                    step.fatal_on_stderr && result.stderr_kind() == StderrKind::Error;
                if step.is_fatal() && fatal_stderr {
                    return Err(Error::step_failed(&step.label, result.stderr.trim()));
                }
                Ok(())
            }
            Err(err) if step.is_fatal() => {
                reporter.step_error(step, &err);
                Err(err)
            }
            Err(err) => {
                tracing::warn!(step = step.ordinal, "Best-effort step failed: {}", err);
                reporter.step_error(step, &err);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::{Credential, StepResult, WaitPolicy};
    use std::time::Duration;

    struct NoopChannel;

    impl RemoteChannel for NoopChannel {
        fn execute(&mut self, _command: &str, _wait: WaitPolicy) -> Result<StepResult> {
            Ok(StepResult::default())
        }

        fn upload(&mut self, local_path: &Utf8Path, _remote_path: &str) -> Result<u64> {
            Ok(std::fs::metadata(local_path)?.len())
        }

        fn close(&mut self) -> Result<()> {
            Ok(())
        }
    }

    struct NoopConnector;

    impl Connector for NoopConnector {
        type Channel = NoopChannel;

        fn open(&self, _target: &DeploymentTarget) -> Result<NoopChannel> {
            Ok(NoopChannel)
        }
    }

    struct Silent;

    impl Reporter for Silent {
        fn phase(&mut self, _message: &str) {}
        fn step_started(&mut self, _step: &Step, _total: usize) {}
        fn report(&mut self, _step: &Step, _result: &StepResult) {}
        fn step_error(&mut self, _step: &Step, _error: &Error) {}
        fn finalize(&mut self, _outcome: &DeploymentOutcome) {}
    }

    fn plan(artifact: Utf8PathBuf) -> DeployPlan {
        DeployPlan {
            target: DeploymentTarget {
                host: "203.0.113.7".to_string(),
                port: 22,
                username: "root".to_string(),
                credential: Credential::Password("pw".to_string()),
                connect_timeout: Duration::from_secs(30),
                auth_timeout: Duration::from_secs(30),
            },
            artifact,
            staging_path: "/tmp/release.tar.gz".to_string(),
            recipe: Recipe::new(vec![
                Step::fatal("First", "true", Duration::from_secs(1)),
                Step::fatal("Second", "true", Duration::from_secs(1)),
            ]),
            timing: TimingConfig::default(),
            dashboard_url: "http://203.0.113.7:5000/".to_string(),
        }
    }

    #[test]
    fn test_state_transitions_to_succeeded() {
        let temp_dir = tempfile::tempdir().unwrap();
        let artifact = Utf8Path::from_path(temp_dir.path())
            .unwrap()
            .join("release.tar.gz");
        std::fs::write(&artifact, b"tarball").unwrap();
        let plan = plan(artifact);

        let mut engine = RecipeEngine::new(&plan);
        assert_eq!(engine.state(), EngineState::NotStarted);

        let outcome = engine.run(&NoopConnector, &mut Silent);

        assert!(outcome.success);
        assert_eq!(engine.state(), EngineState::Succeeded);
        assert_eq!(engine.steps_executed(), 2);
    }

    #[test]
    fn test_missing_artifact_aborts_before_connecting() {
        let plan = plan(Utf8PathBuf::from("/nonexistent/release.tar.gz"));

        let mut engine = RecipeEngine::new(&plan);
        let outcome = engine.run(&NoopConnector, &mut Silent);

        assert!(!outcome.success);
        assert_eq!(
            engine.state(),
            EngineState::Aborted(ErrorCategory::MissingArtifact)
        );
        assert_eq!(engine.steps_executed(), 0);
    }

    #[test]
    fn test_plan_resolves_relative_artifact() {
        let mut config = Config::default();
        config.target.host = "203.0.113.7".to_string();
        let secrets = Secrets {
            ssh_password: Some("pw".to_string()),
            ssh_passphrase: None,
            database_url: Some("postgresql://db/app".to_string()),
        };

        let plan =
            DeployPlan::from_config(&config, &secrets, Utf8Path::new("/srv/build")).unwrap();

        assert_eq!(plan.artifact, "/srv/build/helix-deploy.tar.gz");
        assert_eq!(plan.recipe.len(), 12);
        assert_eq!(plan.dashboard_url, "http://203.0.113.7:5000/");
    }

    #[test]
    fn test_plan_rejects_invalid_config() {
        let secrets = Secrets::default();
        let err = DeployPlan::from_config(&Config::default(), &secrets, Utf8Path::new("."))
            .unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Config);
    }
}
