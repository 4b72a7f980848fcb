//! Persisted platform state.
//!
//! Holds what must survive between CLI invocations: the environment records
//! with their applied-operation ledgers, the pipeline runs and a short
//! history of what happened.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{PipelineError, StateError};
use crate::pipeline::PipelineRun;
use crate::planner::AppliedLedger;
use crate::registry::{Environment, EnvironmentRecord};

/// Current version of the state format.
pub const STATE_VERSION: &str = "1.0";

/// Number of history entries kept.
const MAX_HISTORY: usize = 100;

/// The complete platform state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformState {
    /// State format version.
    pub version: String,
    /// Project name.
    pub project: String,
    /// Environment records in promotion order.
    #[serde(default)]
    pub environments: Vec<EnvironmentRecord>,
    /// Pipeline runs, oldest first.
    #[serde(default)]
    pub runs: Vec<PipelineRun>,
    /// Recent history.
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
    /// When the state was last updated.
    pub last_updated: DateTime<Utc>,
}

/// Kinds of recorded events.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HistoryKind {
    /// A single environment was applied directly.
    Apply,
    /// A promotion run was started or advanced.
    Promote,
    /// An approval decision was recorded.
    Approve,
    /// A promotion was rejected.
    Reject,
    /// A run was cancelled.
    Cancel,
    /// Add-ons were reconciled.
    Reconcile,
}

/// A single entry in the history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// When it happened.
    pub timestamp: DateTime<Utc>,
    /// What happened.
    pub kind: HistoryKind,
    /// Environment concerned.
    #[serde(default)]
    pub environment: Option<String>,
    /// Run concerned.
    #[serde(default)]
    pub run_id: Option<Uuid>,
    /// Desired-state version concerned.
    #[serde(default)]
    pub version: Option<String>,
    /// Whether it succeeded.
    pub success: bool,
    /// Short description.
    pub message: String,
}

impl PlatformState {
    /// Creates an empty state.
    #[must_use]
    pub fn new(project: &str) -> Self {
        Self {
            version: STATE_VERSION.to_string(),
            project: project.to_string(),
            environments: Vec::new(),
            runs: Vec::new(),
            history: Vec::new(),
            last_updated: Utc::now(),
        }
    }

    /// Checks that the state was written by a compatible version.
    ///
    /// # Errors
    ///
    /// Returns `StateError::VersionMismatch` otherwise.
    pub fn check_version(&self) -> Result<(), StateError> {
        if self.version == STATE_VERSION {
            Ok(())
        } else {
            Err(StateError::VersionMismatch {
                expected: STATE_VERSION.to_string(),
                found: self.version.clone(),
            })
        }
    }

    /// Gets an environment record.
    #[must_use]
    pub fn environment(&self, id: &str) -> Option<&EnvironmentRecord> {
        self.environments.iter().find(|r| r.environment.id == id)
    }

    /// Gets a run.
    #[must_use]
    pub fn run(&self, id: Uuid) -> Option<&PipelineRun> {
        self.runs.iter().find(|r| r.id == id)
    }

    /// Finds runs whose identifier starts with `prefix`.
    #[must_use]
    pub fn find_runs(&self, prefix: &str) -> Vec<&PipelineRun> {
        self.runs
            .iter()
            .filter(|r| r.id.to_string().starts_with(prefix))
            .collect()
    }

    /// Resolves a run from its identifier or a unique prefix of it.
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::RunNotFound` if nothing matches and
    /// `PipelineError::AmbiguousRunId` if several runs do.
    pub fn resolve_run(&self, prefix: &str) -> Result<&PipelineRun, PipelineError> {
        let matches = self.find_runs(prefix);
        match matches.as_slice() {
            [run] => Ok(*run),
            [] => Err(PipelineError::RunNotFound {
                id: prefix.to_string(),
            }),
            many => Err(PipelineError::AmbiguousRunId {
                prefix: prefix.to_string(),
                matches: many.len(),
            }),
        }
    }

    /// Returns the most recent run.
    #[must_use]
    pub fn latest_run(&self) -> Option<&PipelineRun> {
        self.runs.iter().max_by_key(|r| r.created_at)
    }

    /// Builds records for the declared environments.
    ///
    /// Placement and approval requirements come from `declared`; the applied
    /// version, statuses and ledger carry over from the persisted record with
    /// the same identifier. Persisted environments no longer declared are
    /// dropped.
    #[must_use]
    pub fn records_for(&self, declared: Vec<Environment>) -> Vec<EnvironmentRecord> {
        declared
            .into_iter()
            .map(|mut environment| match self.environment(&environment.id) {
                Some(persisted) => {
                    let previous = &persisted.environment;
                    environment.applied_version.clone_from(&previous.applied_version);
                    environment.approval = previous.approval;
                    environment.convergence = previous.convergence;
                    environment.updated_at = previous.updated_at;
                    EnvironmentRecord {
                        environment,
                        ledger: persisted.ledger.clone(),
                    }
                }
                None => EnvironmentRecord {
                    environment,
                    ledger: AppliedLedger::new(),
                },
            })
            .collect()
    }

    /// Replaces the environment records.
    pub fn set_environments(&mut self, records: Vec<EnvironmentRecord>) {
        self.environments = records;
        self.last_updated = Utc::now();
    }

    /// Adds or replaces runs by identifier.
    pub fn upsert_runs(&mut self, runs: impl IntoIterator<Item = PipelineRun>) {
        for run in runs {
            match self.runs.iter_mut().find(|r| r.id == run.id) {
                Some(existing) => *existing = run,
                None => self.runs.push(run),
            }
        }
        self.runs.sort_by_key(|r| r.created_at);
        self.last_updated = Utc::now();
    }

    /// Adds a history entry, dropping the oldest beyond the limit.
    pub fn add_history(&mut self, entry: HistoryEntry) {
        if self.history.len() >= MAX_HISTORY {
            self.history.remove(0);
        }
        self.history.push(entry);
        self.last_updated = Utc::now();
    }
}

impl HistoryEntry {
    /// Creates a history entry.
    #[must_use]
    pub fn new(kind: HistoryKind, success: bool, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            kind,
            environment: None,
            run_id: None,
            version: None,
            success,
            message: message.into(),
        }
    }

    /// Sets the environment.
    #[must_use]
    pub fn with_environment(mut self, environment: &str) -> Self {
        self.environment = Some(environment.to_string());
        self
    }

    /// Sets the run and its version.
    #[must_use]
    pub fn with_run(mut self, run: &PipelineRun) -> Self {
        self.run_id = Some(run.id);
        self.version = Some(run.version.clone());
        self
    }

    /// Sets the version.
    #[must_use]
    pub fn with_version(mut self, version: &str) -> Self {
        self.version = Some(version.to_string());
        self
    }
}

impl std::fmt::Display for HistoryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            Self::Apply => "apply",
            Self::Promote => "promote",
            Self::Approve => "approve",
            Self::Reject => "reject",
            Self::Cancel => "cancel",
            Self::Reconcile => "reconcile",
        };
        write!(f, "{kind}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{ResourceKind, ResourceNode};
    use crate::pipeline::DesiredState;

    fn run() -> PipelineRun {
        PipelineRun::new(
            DesiredState::uniform(&["dev"], &[ResourceNode::new(ResourceKind::Network, "network")]),
            vec!["dev".into()],
        )
    }

    #[test]
    fn test_history_is_bounded() {
        let mut state = PlatformState::new("platform");
        for i in 0..150 {
            state.add_history(HistoryEntry::new(HistoryKind::Apply, true, format!("apply {i}")));
        }
        assert_eq!(state.history.len(), MAX_HISTORY);
        assert_eq!(state.history[0].message, "apply 50");
    }

    #[test]
    fn test_upsert_runs_replaces_by_id() {
        let mut state = PlatformState::new("platform");
        let mut first = run();
        state.upsert_runs([first.clone()]);
        first.position = 1;
        state.upsert_runs([first.clone(), run()]);

        assert_eq!(state.runs.len(), 2);
        assert_eq!(state.run(first.id).unwrap().position, 1);
        let id = first.id.to_string();
        assert_eq!(state.find_runs(&id[..8]).len(), 1);
        assert_eq!(state.resolve_run(&id[..8]).unwrap().id, first.id);
        assert!(matches!(
            state.resolve_run(""),
            Err(PipelineError::AmbiguousRunId { matches: 2, .. })
        ));
        assert!(matches!(
            state.resolve_run("zzz"),
            Err(PipelineError::RunNotFound { .. })
        ));
    }

    #[test]
    fn test_records_for_keeps_progress() {
        let mut state = PlatformState::new("platform");
        let mut dev = Environment::new("dev", "eu-west-1", "111", 0);
        crate::registry::EnvironmentRegistry::set_applied_version(&mut dev, "abc123");
        state.set_environments(vec![
            EnvironmentRecord {
                environment: dev,
                ledger: AppliedLedger::new(),
            },
            EnvironmentRecord {
                environment: Environment::new("legacy", "us-east-1", "999", 5),
                ledger: AppliedLedger::new(),
            },
        ]);

        let records = state.records_for(vec![
            Environment::new("dev", "eu-central-1", "111", 0),
            Environment::new("prod", "eu-central-1", "333", 1).with_approval_required(true),
        ]);

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].environment.region, "eu-central-1");
        assert_eq!(records[0].environment.applied_version.as_deref(), Some("abc123"));
        assert!(records[1].environment.requires_approval);
        assert!(records[1].environment.applied_version.is_none());
    }

    #[test]
    fn test_version_check() {
        let mut state = PlatformState::new("platform");
        assert!(state.check_version().is_ok());
        state.version = "0.1".into();
        assert!(matches!(
            state.check_version(),
            Err(StateError::VersionMismatch { .. })
        ));
    }
}
