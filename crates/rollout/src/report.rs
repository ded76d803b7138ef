//! Progress and result reporting
//!
//! This module provides the [`Reporter`] contract the recipe engine streams
//! into, the terminal [`DeploymentOutcome`], and [`ConsoleReporter`] which
//! writes step output to stdout/stderr and shows a spinner per step through
//! the tracing-indicatif layer.

use indicatif::ProgressStyle;
use std::io::Write;
use std::process::ExitCode;
use tracing_indicatif::span_ext::IndicatifSpanExt;
use tracing_indicatif::suspend_tracing_indicatif;

use crate::error::{Error, ErrorCategory};
use crate::recipe::Step;
use crate::remote::{StderrKind, StepResult};

/// Terminal result of one run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentOutcome {
    pub success: bool,
    /// Final message shown in the banner
    pub message: String,
    /// 0 on full success, 1 on any failure
    pub exit_code: u8,
    /// Failure category, if the run failed
    pub category: Option<ErrorCategory>,
    /// Remediation text for the operator
    pub help: Option<String>,
    /// Full diagnostic chain for unexpected errors
    pub detail: Option<String>,
    /// Steps that ran before the run ended
    pub steps_executed: usize,
    /// Where the deployed service can be reached
    pub dashboard_url: Option<String>,
}

impl DeploymentOutcome {
    /// A fully successful run
    pub fn succeeded(steps_executed: usize, dashboard_url: impl Into<String>) -> Self {
        Self {
            success: true,
            message: "Deployment completed successfully".to_string(),
            exit_code: 0,
            category: None,
            help: None,
            detail: None,
            steps_executed,
            dashboard_url: Some(dashboard_url.into()),
        }
    }

    /// A run that ended with `error`
    pub fn failed(error: &Error, steps_executed: usize) -> Self {
        let category = error.category();
        let detail = (category == ErrorCategory::Unclassified).then(|| format!("{:?}", error));
        Self {
            success: false,
            message: error.to_string(),
            exit_code: 1,
            category: Some(category),
            help: error.help_text(),
            detail,
            steps_executed,
            dashboard_url: None,
        }
    }

    /// Process exit status
    pub fn exit_status(&self) -> ExitCode {
        ExitCode::from(self.exit_code)
    }
}

/// Receives progress from the recipe engine
pub trait Reporter {
    /// A phase outside the step list (connecting, uploading)
    fn phase(&mut self, message: &str);

    /// A step is about to be dispatched
    fn step_started(&mut self, step: &Step, total: usize);

    /// A step's command completed
    fn report(&mut self, step: &Step, result: &StepResult);

    /// A step's command raised an error
    fn step_error(&mut self, step: &Step, error: &Error);

    /// The run is over
    fn finalize(&mut self, outcome: &DeploymentOutcome);
}

/// Writes progress for a human operator
pub struct ConsoleReporter<O: Write, E: Write> {
    out: O,
    err: E,
    spinners: bool,
    current: Option<tracing::span::EnteredSpan>,
}

impl ConsoleReporter<std::io::Stdout, std::io::Stderr> {
    /// Report to the terminal with per-step spinners
    pub fn stdio() -> Self {
        Self {
            out: std::io::stdout(),
            err: std::io::stderr(),
            spinners: true,
            current: None,
        }
    }
}

impl<O: Write, E: Write> ConsoleReporter<O, E> {
    /// Report to arbitrary writers, without spinners
    pub fn new(out: O, err: E) -> Self {
        Self {
            out,
            err,
            spinners: false,
            current: None,
        }
    }

    /// Consume the reporter, returning its writers
    pub fn into_inner(self) -> (O, E) {
        (self.out, self.err)
    }

    fn out(&mut self, text: &str) {
        let out = &mut self.out;
        // Write failures are ignored
        suspend_tracing_indicatif(|| {
            let _ = writeln!(out, "{}", text);
        });
    }

    fn err(&mut self, text: &str) {
        let err = &mut self.err;
        suspend_tracing_indicatif(|| {
            let _ = writeln!(err, "{}", text);
        });
    }

    fn start_spinner(&mut self, step: &Step, total: usize) {
        let span = tracing::info_span!("step", ordinal = step.ordinal);
        span.pb_set_style(
            &ProgressStyle::default_spinner()
                .template("  {spinner:.yellow} {msg} [{elapsed}]")
                .expect("Invalid spinner template"),
        );
        span.pb_set_message(&format!("[{}/{}] {}", step.ordinal, total, step.label));
        self.current = Some(span.entered());
    }
}

impl<O: Write, E: Write> Reporter for ConsoleReporter<O, E> {
    fn phase(&mut self, message: &str) {
        self.out(&format!("==> {}", message));
    }

    fn step_started(&mut self, step: &Step, total: usize) {
        self.out(&format!("[{}/{}] {}", step.ordinal, total, step.label));
        if self.spinners {
            self.start_spinner(step, total);
        }
    }

    fn report(&mut self, step: &Step, result: &StepResult) {
        self.current = None;

        let stdout = result.stdout.trim_end();
        if !stdout.is_empty() {
            self.out(stdout);
        }

        let stderr = result.stderr.trim_end();
        match result.stderr_kind() {
            StderrKind::Empty => {}
            StderrKind::Advisory => self.out(&format!("note: {}", stderr)),
            StderrKind::Error => self.err(&format!("Error: {}", stderr)),
        }

        tracing::debug!(
            step = step.ordinal,
            elapsed_ms = result.elapsed.as_millis() as u64,
            exit_status = ?result.exit_status,
            "Step output reported"
        );
    }

    fn step_error(&mut self, step: &Step, error: &Error) {
        self.current = None;

        if step.is_fatal() {
            self.err(&format!("Error: {} failed: {}", step.label, error));
        } else {
            self.err(&format!(
                "Error: {} failed (ignored, best-effort step): {}",
                step.label, error
            ));
        }
    }

    fn finalize(&mut self, outcome: &DeploymentOutcome) {
        self.current = None;

        if outcome.success {
            self.out("");
            self.out(&format!("✅ {}", outcome.message));
            if let Some(url) = &outcome.dashboard_url {
                self.out(&format!("🌐 Dashboard: {}", url));
                self.out("");
                self.out("Next steps:");
                self.out(&format!("   - Open {} in a browser", url));
                self.out("   - Check the dashboard metrics");
                self.out("   - Allow about 2 minutes for the first import");
            }
            return;
        }

        let category = outcome.category.unwrap_or(ErrorCategory::Unclassified);
        self.err("");
        self.err(&format!("❌ Deployment failed ({})", category));
        self.err(&format!("   {}", outcome.message));
        if let Some(help) = &outcome.help {
            self.err(&format!("   help: {}", help));
        }
        if let Some(detail) = &outcome.detail {
            self.err(&format!("   detail: {}", detail));
        }
        self.err(&format!(
            "   {} step(s) ran before the failure; the host was not rolled back",
            outcome.steps_executed
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn step() -> Step {
        Step::fatal(
            "Install runtime dependencies",
            "npm install --omit=dev",
            Duration::from_secs(30),
        )
    }

    fn run(f: impl FnOnce(&mut ConsoleReporter<Vec<u8>, Vec<u8>>)) -> (String, String) {
        let mut reporter = ConsoleReporter::new(Vec::new(), Vec::new());
        f(&mut reporter);
        let (out, err) = reporter.into_inner();
        (
            String::from_utf8(out).unwrap(),
            String::from_utf8(err).unwrap(),
        )
    }

    #[test]
    fn test_advisory_stderr_goes_to_stdout() {
        let result = StepResult {
            stdout: "added 112 packages".to_string(),
            stderr: "npm WARN deprecated glob@7.2.3".to_string(),
            ..Default::default()
        };

        let (out, err) = run(|r| r.report(&step(), &result));

        assert!(out.contains("added 112 packages"));
        assert!(out.contains("note: npm WARN deprecated"));
        assert!(err.is_empty());
    }

    #[test]
    fn test_error_stderr_goes_to_stderr() {
        let result = StepResult {
            stderr: "npm ERR! code E404".to_string(),
            ..Default::default()
        };

        let (out, err) = run(|r| r.report(&step(), &result));

        assert!(out.is_empty());
        assert!(err.contains("Error: npm ERR! code E404"));
    }

    #[test]
    fn test_success_banner_has_dashboard() {
        let outcome = DeploymentOutcome::succeeded(12, "http://203.0.113.7:5000/");

        let (out, err) = run(|r| r.finalize(&outcome));

        assert!(out.contains("Dashboard: http://203.0.113.7:5000/"));
        assert!(err.is_empty());
        assert_eq!(outcome.exit_code, 0);
    }

    #[test]
    fn test_failure_banner_has_category_and_help() {
        let error = Error::auth(
            "root@203.0.113.7:22 rejected the credential",
            "Check ROLLOUT_SSH_PASSWORD",
        );
        let outcome = DeploymentOutcome::failed(&error, 0);

        let (out, err) = run(|r| r.finalize(&outcome));

        assert!(out.is_empty());
        assert!(err.contains("Deployment failed (authentication failure)"));
        assert!(err.contains("help: Check ROLLOUT_SSH_PASSWORD"));
        assert_eq!(outcome.exit_code, 1);
        assert!(outcome.detail.is_none());
    }

    #[test]
    fn test_unclassified_failure_carries_detail() {
        let error: Error = std::io::Error::other("disk on fire").into();
        let outcome = DeploymentOutcome::failed(&error, 3);

        assert_eq!(outcome.category, Some(ErrorCategory::Unclassified));
        assert!(outcome.detail.as_deref().unwrap().contains("disk on fire"));
    }

    #[test]
    fn test_best_effort_error_is_marked_ignored() {
        let trigger = Step::best_effort("Trigger first import", "curl", Duration::from_secs(2));
        let error = Error::channel("curl: (7) Failed to connect", "retry");

        let (_, err) = run(|r| r.step_error(&trigger, &error));

        assert!(err.contains("ignored, best-effort step"));
        assert!(err.contains("Failed to connect"));
    }
}
