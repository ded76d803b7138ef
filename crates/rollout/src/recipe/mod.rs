//! The deployment recipe
//!
//! A recipe is a fixed, ordered list of [`Step`] values. Each step is data:
//! a label, the shell command, how long it usually takes, and what a failure
//! means for the run. The [`engine`] executes them strictly in order.

pub mod engine;
pub mod payload;

use std::borrow::Cow;
use std::time::Duration;

use crate::config::{Config, TimingConfig};
use crate::remote::WaitPolicy;

pub use engine::{EngineState, RecipeEngine};
pub use payload::EnvironmentPayload;

/// What a failing step means for the run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepPolicy {
    /// Connection-level errors abort the run
    Fatal,
    /// Errors are displayed and the run continues
    BestEffort,
}

/// One recipe step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    /// 1-based position in the recipe
    pub ordinal: usize,
    pub label: String,
    pub command: String,
    /// Command as logged, when it differs from `command`
    display: Option<String>,
    /// Typical duration of the command
    pub expected_wait: Duration,
    pub policy: StepPolicy,
    /// Abort on stderr that doesn't match the advisory marker
    pub fatal_on_stderr: bool,
    /// Delay before dispatching the command
    pub settle: Duration,
}

impl Step {
    fn new(
        label: &str,
        command: impl Into<String>,
        expected_wait: Duration,
        policy: StepPolicy,
    ) -> Self {
        Self {
            ordinal: 0,
            label: label.to_string(),
            command: command.into(),
            display: None,
            expected_wait,
            policy,
            fatal_on_stderr: false,
            settle: Duration::ZERO,
        }
    }

    /// A step whose connection-level failure aborts the run
    pub fn fatal(label: &str, command: impl Into<String>, expected_wait: Duration) -> Self {
        Self::new(label, command, expected_wait, StepPolicy::Fatal)
    }

    /// A step whose failure is displayed but never aborts the run
    pub fn best_effort(label: &str, command: impl Into<String>, expected_wait: Duration) -> Self {
        Self::new(label, command, expected_wait, StepPolicy::BestEffort)
    }

    /// Also abort on non-advisory stderr
    pub fn checking_stderr(mut self) -> Self {
        self.fatal_on_stderr = true;
        self
    }

    /// Wait before dispatching the command
    pub fn after_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    /// Log this instead of the real command
    pub fn displayed_as(mut self, display: impl Into<String>) -> Self {
        self.display = Some(display.into());
        self
    }

    /// The command as it may appear in logs
    pub fn display_command(&self) -> &str {
        self.display.as_deref().unwrap_or(&self.command)
    }

    /// Whether a failure of this step aborts the run
    pub fn is_fatal(&self) -> bool {
        self.policy == StepPolicy::Fatal
    }

    /// Completion policy for this step's command
    pub fn wait_policy(&self, timing: &TimingConfig) -> WaitPolicy {
        WaitPolicy {
            expected: self.expected_wait,
            deadline: timing.deadline_for(self.expected_wait),
        }
    }
}

/// A fixed, ordered list of steps
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipe {
    steps: Vec<Step>,
}

impl Recipe {
    /// Create a recipe; ordinals follow the order given
    pub fn new(steps: Vec<Step>) -> Self {
        let steps = steps
            .into_iter()
            .enumerate()
            .map(|(index, mut step)| {
                step.ordinal = index + 1;
                step
            })
            .collect();
        Self { steps }
    }

    /// The standard release recipe for a process-managed Node service
    pub fn standard(config: &Config, payload: &EnvironmentPayload) -> Self {
        let service = &config.service;
        let dir = quote(&service.remote_dir);
        let name = quote(&service.name);
        let staging = quote(&config.artifact.staging_path);
        let archive = archive_name(&config.artifact.staging_path);
        let env_file = quote(&format!(
            "{}/.env",
            service.remote_dir.trim_end_matches('/')
        ));
        let (write_env, write_env_display) = payload.write_command(&env_file);
        let local_url = |path: &str| quote(&format!("http://localhost:{}{}", service.port, path));

        Self::new(vec![
            Step::fatal("Install process manager", "npm install -g pm2", secs(15)),
            Step::fatal(
                "Create deployment directory",
                format!("mkdir -p {}", dir),
                secs(2),
            )
            .checking_stderr(),
            Step::fatal("Write environment file", write_env, secs(2))
                .displayed_as(write_env_display)
                .checking_stderr(),
            Step::best_effort(
                "Stop previous instance",
                format!("pm2 stop {} 2>/dev/null || true", name),
                secs(2),
            ),
            Step::fatal(
                "Remove previous build",
                format!(
                    "cd {} && rm -rf dist node_modules package*.json {}",
                    dir,
                    archive_glob(&archive)
                ),
                secs(2),
            )
            .checking_stderr(),
            Step::fatal(
                "Extract build",
                format!(
                    "cd {} && mv {} . && tar -xzf {}",
                    dir,
                    staging,
                    quote(&archive)
                ),
                secs(5),
            )
            .checking_stderr(),
            Step::fatal(
                "Install runtime dependencies",
                format!("cd {} && npm install --omit=dev", dir),
                secs(30),
            ),
            Step::fatal(
                "Start service",
                format!(
                    "cd {} && pm2 start {} --name {} --env {}",
                    dir,
                    quote(&service.entrypoint),
                    name,
                    quote(&service.env_tag)
                ),
                secs(5),
            ),
            Step::fatal("Save process table", "pm2 save", secs(2)),
            Step::best_effort(
                "Show status and logs",
                format!(
                    "pm2 status; pm2 logs {} --lines {} --nostream",
                    name, service.log_lines
                ),
                secs(2),
            ),
            Step::best_effort(
                "Trigger first import",
                format!("curl -sS -X POST {}", local_url(&service.trigger_path)),
                secs(2),
            )
            .after_settle(config.timing.trigger_settle()),
            Step::best_effort(
                "Health check",
                format!("curl -sS {}", local_url(&service.health_path)),
                secs(2),
            ),
        ])
    }

    /// Steps in execution order
    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Number of steps
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Whether the recipe has no steps
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

fn secs(n: u64) -> Duration {
    Duration::from_secs(n)
}

/// Quote a value for interpolation into a remote shell command
pub fn quote(value: &str) -> String {
    shell_escape::escape(Cow::Borrowed(value)).into_owned()
}

/// File name of the staged archive
fn archive_name(staging_path: &str) -> String {
    staging_path
        .rsplit('/')
        .next()
        .filter(|name| !name.is_empty())
        .unwrap_or("release.tar.gz")
        .to_string()
}

/// Glob matching the archive and its timestamped siblings
fn archive_glob(archive: &str) -> String {
    match archive.strip_suffix(".tar.gz") {
        Some(stem) if !stem.is_empty() => format!("{}*.tar.gz", quote(stem)),
        _ => quote(archive),
    }
}
