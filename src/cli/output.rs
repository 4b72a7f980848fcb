//! Output formatting for CLI commands.
//!
//! Every formatter returns a string; the binary decides where it goes. Text
//! output uses colors and tables, JSON output is meant for scripts.

use colored::Colorize;
use serde::Serialize;
use std::fmt::Write;
use tabled::{Table, Tabled};

use crate::config::{PlatformConfig, ValidationResult};
use crate::pipeline::{PipelineRun, RunState, StageOutcome};
use crate::planner::{Action, DiffResult, ExecutionReport, OperationStatus, Plan};
use crate::reconciler::{AddonOutcome, CycleReport, DriftReport};
use crate::registry::{ApprovalStatus, ConvergenceStatus, Environment};
use crate::state::{LockInfo, PlatformState};

use super::commands::OutputFormat;

/// Output formatter for CLI.
#[derive(Debug)]
pub struct OutputFormatter {
    /// Output format.
    format: OutputFormat,
}

/// Plan operation row for table display.
#[derive(Tabled)]
struct OperationRow {
    #[tabled(rename = "#")]
    index: usize,
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Kind")]
    kind: String,
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "After")]
    after: String,
}

/// Execution result row for table display.
#[derive(Tabled)]
struct ResultRow {
    #[tabled(rename = "Operation")]
    operation: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Attempts")]
    attempts: u32,
    #[tabled(rename = "Detail")]
    detail: String,
}

/// Environment row for table display.
#[derive(Tabled)]
struct EnvironmentRow {
    #[tabled(rename = "#")]
    position: u32,
    #[tabled(rename = "Environment")]
    id: String,
    #[tabled(rename = "Region")]
    region: String,
    #[tabled(rename = "Version")]
    version: String,
    #[tabled(rename = "Convergence")]
    convergence: String,
    #[tabled(rename = "Approval")]
    approval: String,
}

/// Run row for table display.
#[derive(Tabled)]
struct RunRow {
    #[tabled(rename = "Run")]
    id: String,
    #[tabled(rename = "Version")]
    version: String,
    #[tabled(rename = "State")]
    state: String,
    #[tabled(rename = "At")]
    at: String,
    #[tabled(rename = "Created")]
    created: String,
}

/// Add-on result row for table display.
#[derive(Tabled)]
struct AddonRow {
    #[tabled(rename = "Cluster")]
    cluster: String,
    #[tabled(rename = "Add-on")]
    addon: String,
    #[tabled(rename = "Desired")]
    desired: String,
    #[tabled(rename = "Running")]
    running: String,
    #[tabled(rename = "Outcome")]
    outcome: String,
}

impl OutputFormatter {
    /// Creates a new output formatter.
    #[must_use]
    pub const fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Returns true for JSON output.
    #[must_use]
    pub fn is_json(&self) -> bool {
        self.format == OutputFormat::Json
    }

    fn json<T: Serialize + ?Sized>(value: &T) -> String {
        serde_json::to_string_pretty(value).unwrap_or_default()
    }

    /// Formats a plan for display, with changed fields when `diff` is given.
    #[must_use]
    pub fn format_plan(&self, plan: &Plan, diff: Option<&DiffResult>) -> String {
        match self.format {
            OutputFormat::Json => Self::json(plan),
            OutputFormat::Text => Self::format_plan_text(plan, diff),
        }
    }

    fn format_plan_text(plan: &Plan, diff: Option<&DiffResult>) -> String {
        if plan.is_empty() {
            return format!(
                "{} No changes required - {} is up to date.\n",
                "✓".green(),
                plan.environment
            );
        }

        let mut output = String::new();
        let _ = write!(output, "\nPlan for {}\n", plan.environment.bold());
        let _ = write!(output, "   Version: {}\n\n", plan.version);

        let rows: Vec<OperationRow> = plan
            .operations
            .iter()
            .enumerate()
            .map(|(i, op)| OperationRow {
                index: i,
                action: Self::format_action(op.action),
                kind: op.kind.to_string(),
                resource: Self::truncate(&op.target, 40),
                after: op
                    .depends_on
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(", "),
            })
            .collect();
        output.push_str(&Table::new(rows).to_string());
        output.push('\n');

        if let Some(diff) = diff {
            for resource in diff.actionable_diffs() {
                if resource.details.is_empty() {
                    continue;
                }
                let _ = writeln!(output, "\n   {} ({}):", resource.id, resource.diff_type);
                for detail in &resource.details {
                    let _ = writeln!(
                        output,
                        "     {}: {} -> {}",
                        detail.field,
                        detail.old_value.as_deref().unwrap_or("(none)").red(),
                        detail.new_value.as_deref().unwrap_or("(none)").green()
                    );
                }
            }
        }

        let _ = write!(
            output,
            "\nPlan: {} to create, {} to update, {} to delete\n",
            plan.count(Action::Create).to_string().green(),
            plan.count(Action::Update).to_string().yellow(),
            plan.count(Action::Delete).to_string().red()
        );
        output
    }

    /// Formats the result of applying a plan.
    #[must_use]
    pub fn format_report(&self, report: &ExecutionReport) -> String {
        match self.format {
            OutputFormat::Json => Self::json(report),
            OutputFormat::Text => {
                let status = if report.success() {
                    format!("{} {} converged", "✓".green(), report.environment)
                } else {
                    format!("{} {} did not converge", "✗".red(), report.environment)
                };
                let mut output = format!("{status}\n\n");

                if !report.results.is_empty() {
                    let rows: Vec<ResultRow> = report
                        .results
                        .iter()
                        .map(|r| ResultRow {
                            operation: format!("{}({})", r.action, r.target),
                            status: Self::format_operation_status(r.status),
                            attempts: r.attempts,
                            detail: r
                                .error
                                .as_ref()
                                .map(ToString::to_string)
                                .or_else(|| r.blocked_by.as_ref().map(|b| format!("blocked by {b}")))
                                .map(|d| Self::truncate(&d, 60))
                                .unwrap_or_default(),
                        })
                        .collect();
                    output.push_str(&Table::new(rows).to_string());
                    output.push('\n');
                }

                let _ = write!(
                    output,
                    "\n{} applied, {} no-op, {} failed, {} skipped, {} cancelled\n",
                    report.applied, report.no_op, report.failed, report.skipped, report.cancelled
                );
                output
            }
        }
    }

    /// Formats one run in detail.
    #[must_use]
    pub fn format_run(&self, run: &PipelineRun) -> String {
        match self.format {
            OutputFormat::Json => Self::json(run),
            OutputFormat::Text => {
                let mut output = String::new();
                let _ = writeln!(output, "\nRun {}", run.id.to_string().bold());
                let _ = writeln!(output, "   Version: {}", run.version);
                let _ = writeln!(output, "   State: {}", Self::format_run_state(run.state));
                let _ = writeln!(output, "   Created: {}", run.created_at.format("%Y-%m-%d %H:%M:%S"));
                output.push('\n');

                for (i, env) in run.environments.iter().enumerate() {
                    let stage = run.stages.iter().find(|s| &s.environment == env);
                    let outcome = stage.map_or_else(
                        || "not reached".dimmed().to_string(),
                        |s| Self::format_stage_outcome(s.outcome),
                    );
                    let ops = stage
                        .and_then(|s| s.plan.as_ref())
                        .map(|p| format!(" ({} operations)", p.len()))
                        .unwrap_or_default();
                    let _ = writeln!(output, "   {}. {env}: {outcome}{ops}", i + 1);
                }

                if let Some(failure) = &run.failure {
                    let _ = write!(output, "\n{} {failure}\n", "✗".red());
                }
                if run.state == RunState::AwaitingApproval
                    && let Some(env) = run.current_environment()
                {
                    let short = Self::short_id(run);
                    let _ = write!(
                        output,
                        "\n{} Waiting for approval of {env}: `converge approve {short}` or `converge reject {short}`\n",
                        "⚠".yellow()
                    );
                }
                output
            }
        }
    }

    /// Formats environments and recent runs.
    #[must_use]
    pub fn format_status(&self, environments: &[Environment], runs: &[PipelineRun]) -> String {
        match self.format {
            OutputFormat::Json => Self::json(&serde_json::json!({
                "environments": environments,
                "runs": runs.iter().map(RunSummary::from).collect::<Vec<_>>(),
            })),
            OutputFormat::Text => {
                let mut output = String::from("\nEnvironments\n");
                let rows: Vec<EnvironmentRow> = environments
                    .iter()
                    .map(|e| EnvironmentRow {
                        position: e.position,
                        id: e.id.clone(),
                        region: e.region.clone(),
                        version: e.applied_version.clone().unwrap_or_else(|| String::from("-")),
                        convergence: Self::format_convergence(e.convergence),
                        approval: if e.requires_approval {
                            Self::format_approval(e.approval)
                        } else {
                            "n/a".dimmed().to_string()
                        },
                    })
                    .collect();
                output.push_str(&Table::new(rows).to_string());
                output.push('\n');

                if runs.is_empty() {
                    output.push_str("\n   No promotion runs yet.\n");
                    return output;
                }

                output.push_str("\nRuns\n");
                let rows: Vec<RunRow> = runs
                    .iter()
                    .rev()
                    .take(10)
                    .map(|r| RunRow {
                        id: Self::short_id(r),
                        version: r.version.clone(),
                        state: Self::format_run_state(r.state),
                        at: r.current_environment().unwrap_or("-").to_string(),
                        created: r.created_at.format("%Y-%m-%d %H:%M").to_string(),
                    })
                    .collect();
                output.push_str(&Table::new(rows).to_string());
                output.push('\n');
                output
            }
        }
    }

    /// Formats add-on reconciliation cycles.
    #[must_use]
    pub fn format_cycles(&self, reports: &[CycleReport]) -> String {
        match self.format {
            OutputFormat::Json => Self::json(reports),
            OutputFormat::Text => {
                if reports.is_empty() {
                    return String::from("No clusters with add-ons to reconcile.\n");
                }

                let rows: Vec<AddonRow> = reports
                    .iter()
                    .flat_map(|report| {
                        report.results.iter().map(move |r| AddonRow {
                            cluster: format!("{}/{}", report.environment, report.cluster),
                            addon: r.addon.clone(),
                            desired: r.desired_version.clone().unwrap_or_else(|| String::from("-")),
                            running: r.observed_version.clone().unwrap_or_else(|| String::from("-")),
                            outcome: Self::format_addon_outcome(&r.outcome),
                        })
                    })
                    .collect();

                let mut output = String::from("\n");
                output.push_str(&Table::new(rows).to_string());
                output.push('\n');

                let changed: usize = reports.iter().map(CycleReport::changed).sum();
                let failed: usize = reports.iter().map(CycleReport::failed).sum();
                let skipped: usize = reports.iter().map(CycleReport::skipped).sum();
                let _ = write!(
                    output,
                    "\n{} changed, {} failed, {} skipped\n",
                    changed.to_string().green(),
                    failed.to_string().red(),
                    skipped.to_string().yellow()
                );
                output
            }
        }
    }

    /// Formats a drift report.
    #[must_use]
    pub fn format_drift(&self, report: &DriftReport) -> String {
        match self.format {
            OutputFormat::Json => Self::json(report),
            OutputFormat::Text => {
                if report.is_converged() {
                    return format!(
                        "{} No drift detected - {} is converged.\n",
                        "✓".green(),
                        report.environment
                    );
                }

                let mut output = format!("{} Drift detected in {}:\n\n", "⚠".yellow(), report.environment);
                for resource in &report.drifted_resources {
                    let _ = write!(output, "   - {} {} '{}'", resource.change, resource.kind, resource.id);
                    if !resource.fields.is_empty() {
                        let _ = write!(output, " ({})", resource.fields.join(", "));
                    }
                    output.push('\n');
                }
                let _ = write!(
                    output,
                    "\n{}/{} resources have drifted.\n",
                    report.drifted_resources.len(),
                    report.total_resources
                );
                output
            }
        }
    }

    /// Formats the outcome of validating a configuration.
    #[must_use]
    pub fn format_validation(
        &self,
        config: &PlatformConfig,
        result: &ValidationResult,
        show_warnings: bool,
    ) -> String {
        match self.format {
            OutputFormat::Json => Self::json(&serde_json::json!({
                "valid": result.is_valid(),
                "errors": result.errors.iter().map(ToString::to_string).collect::<Vec<_>>(),
                "warnings": result.warnings,
            })),
            OutputFormat::Text => {
                let mut output = String::new();
                if result.is_valid() {
                    let _ = writeln!(output, "{} Configuration is valid!", "✓".green());
                } else {
                    let _ = writeln!(output, "{} Configuration has {} errors:", "✗".red(), result.error_count());
                    for error in &result.errors {
                        let _ = writeln!(output, "   - {error}");
                    }
                }

                if show_warnings && !result.warnings.is_empty() {
                    let _ = writeln!(output, "\n{} Warnings:", "⚠".yellow());
                    for warning in &result.warnings {
                        let _ = writeln!(output, "   - {warning}");
                    }
                } else if result.warning_count() > 0 {
                    let _ = writeln!(
                        output,
                        "   {} warnings (use --warnings to show)",
                        result.warning_count()
                    );
                }

                let environments: Vec<&str> = config
                    .ordered_environments()
                    .into_iter()
                    .map(|(_, e)| e.id.as_str())
                    .collect();
                let _ = writeln!(output, "\nConfiguration summary:");
                let _ = writeln!(output, "   Project: {}", config.project.name);
                let _ = writeln!(output, "   Promotion: {}", environments.join(" -> "));
                let _ = writeln!(output, "   Resources: {}", config.resources.len());
                output
            }
        }
    }

    /// Formats persisted state.
    #[must_use]
    pub fn format_state(&self, state: &PlatformState) -> String {
        match self.format {
            OutputFormat::Json => Self::json(state),
            OutputFormat::Text => {
                let mut output = String::new();
                let _ = write!(output, "\nState: {}\n\n", state.project);
                let _ = writeln!(output, "   Version: {}", state.version);
                let _ = writeln!(output, "   Last updated: {}", state.last_updated);
                let _ = writeln!(output, "   Environments: {}", state.environments.len());
                for record in &state.environments {
                    let _ = writeln!(
                        output,
                        "     {} ({} ledger entries, {})",
                        record.environment.id,
                        record.ledger.len(),
                        record.environment.convergence
                    );
                }
                let _ = writeln!(output, "   Runs: {}", state.runs.len());

                if !state.history.is_empty() {
                    let _ = writeln!(output, "\n   Recent history ({}):", state.history.len());
                    for entry in state.history.iter().rev().take(5) {
                        let status = if entry.success { "✓" } else { "✗" };
                        let _ = writeln!(
                            output,
                            "     {status} {} - {} {}: {}",
                            entry.timestamp.format("%Y-%m-%d %H:%M"),
                            entry.kind,
                            entry.environment.as_deref().unwrap_or("-"),
                            entry.message
                        );
                    }
                }
                output
            }
        }
    }

    /// Formats lock information.
    #[must_use]
    pub fn format_lock(&self, lock: &LockInfo) -> String {
        match self.format {
            OutputFormat::Json => Self::json(lock),
            OutputFormat::Text => format!("{lock}\n"),
        }
    }

    /// Formats a success message.
    #[must_use]
    pub fn success(&self, message: &str) -> String {
        self.message("success", &"✓".green().to_string(), message)
    }

    /// Formats an error message.
    #[must_use]
    pub fn error(&self, message: &str) -> String {
        self.message("error", &"✗".red().to_string(), message)
    }

    /// Formats a warning message.
    #[must_use]
    pub fn warning(&self, message: &str) -> String {
        self.message("warning", &"⚠".yellow().to_string(), message)
    }

    fn message(&self, status: &str, symbol: &str, message: &str) -> String {
        match self.format {
            OutputFormat::Json => Self::json(&serde_json::json!({ "status": status, "message": message })),
            OutputFormat::Text => format!("{symbol} {message}"),
        }
    }

    fn short_id(run: &PipelineRun) -> String {
        run.id.to_string().chars().take(8).collect()
    }

    fn format_action(action: Action) -> String {
        match action {
            Action::Create => "+create".green().to_string(),
            Action::Update => "~update".yellow().to_string(),
            Action::Delete => "-delete".red().to_string(),
        }
    }

    fn format_operation_status(status: OperationStatus) -> String {
        match status {
            OperationStatus::Applied => "applied".green().to_string(),
            OperationStatus::NoOp => "no-op".dimmed().to_string(),
            OperationStatus::Failed => "failed".red().to_string(),
            OperationStatus::Skipped | OperationStatus::Cancelled => status.to_string().yellow().to_string(),
            OperationStatus::Pending => "pending".dimmed().to_string(),
        }
    }

    fn format_run_state(state: RunState) -> String {
        match state {
            RunState::Completed => "completed".green().to_string(),
            RunState::AwaitingApproval => "awaiting-approval".yellow().to_string(),
            RunState::Failed | RunState::Rejected => state.to_string().red().to_string(),
            RunState::Cancelled => "cancelled".dimmed().to_string(),
            RunState::Pending | RunState::Planning | RunState::Applying => state.to_string(),
        }
    }

    fn format_stage_outcome(outcome: StageOutcome) -> String {
        match outcome {
            StageOutcome::Converged => "converged".green().to_string(),
            StageOutcome::AwaitingApproval => "awaiting approval".yellow().to_string(),
            StageOutcome::Failed | StageOutcome::Rejected => outcome.to_string().red().to_string(),
            other => other.to_string(),
        }
    }

    fn format_convergence(status: ConvergenceStatus) -> String {
        match status {
            ConvergenceStatus::Converged => "converged".green().to_string(),
            ConvergenceStatus::Failed => "failed".red().to_string(),
            ConvergenceStatus::NotStarted => "not-started".dimmed().to_string(),
        }
    }

    fn format_approval(status: ApprovalStatus) -> String {
        match status {
            ApprovalStatus::Approved => "approved".green().to_string(),
            ApprovalStatus::Rejected => "rejected".red().to_string(),
            ApprovalStatus::Pending => "pending".yellow().to_string(),
        }
    }

    fn format_addon_outcome(outcome: &AddonOutcome) -> String {
        match outcome {
            AddonOutcome::InSync => "in sync".dimmed().to_string(),
            AddonOutcome::Updated { from } => format!(
                "updated from {}",
                from.as_deref().unwrap_or("unknown")
            )
            .green()
            .to_string(),
            AddonOutcome::Created => "installed".green().to_string(),
            AddonOutcome::Failed { reason } => format!("failed: {}", Self::truncate(reason, 50)).red().to_string(),
            AddonOutcome::Skipped { reason } => format!("skipped: {reason}").yellow().to_string(),
        }
    }

    /// Truncates a string to a maximum number of characters.
    fn truncate(s: &str, max_len: usize) -> String {
        if s.chars().count() <= max_len {
            s.to_string()
        } else {
            let head: String = s.chars().take(max_len.saturating_sub(3)).collect();
            format!("{head}...")
        }
    }
}

// JSON serialization helpers

#[derive(Serialize)]
struct RunSummary {
    id: String,
    version: String,
    state: RunState,
    environment: Option<String>,
    created_at: String,
}

impl From<&PipelineRun> for RunSummary {
    fn from(run: &PipelineRun) -> Self {
        Self {
            id: run.id.to_string(),
            version: run.version.clone(),
            state: run.state,
            environment: run.current_environment().map(str::to_string),
            created_at: run.created_at.to_rfc3339(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{ResourceConfig, ResourceKind};
    use crate::planner::Operation;

    fn plan() -> Plan {
        Plan::new(
            "dev",
            "abc12345",
            vec![
                Operation::new("network", ResourceKind::Network, Action::Create, ResourceConfig::new()),
                Operation::new("eks", ResourceKind::Cluster, Action::Create, ResourceConfig::new()),
            ],
        )
    }

    #[test]
    fn test_plan_json() {
        let output = OutputFormatter::new(OutputFormat::Json).format_plan(&plan(), None);
        let value: serde_json::Value = serde_json::from_str(&output).unwrap();
        assert_eq!(value["environment"], "dev");
        assert_eq!(value["operations"][1]["target"], "eks");
    }

    #[test]
    fn test_empty_plan_text() {
        let empty = Plan::new("prod", "abc12345", Vec::new());
        let output = OutputFormatter::new(OutputFormat::Text).format_plan(&empty, None);
        assert!(output.contains("No changes required"));
        assert!(output.contains("prod"));
    }

    #[test]
    fn test_message_json() {
        let output = OutputFormatter::new(OutputFormat::Json).warning("lock expired");
        let value: serde_json::Value = serde_json::from_str(&output).unwrap();
        assert_eq!(value["status"], "warning");
        assert_eq!(value["message"], "lock expired");
    }

    #[test]
    fn test_truncate() {
        assert_eq!(OutputFormatter::truncate("short", 10), "short");
        assert_eq!(OutputFormatter::truncate("aws-load-balancer-controller", 10), "aws-loa...");
    }
}
