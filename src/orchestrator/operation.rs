use crate::models::{AppName, Choice, OperationId, RebuildId};
use crate::rebuild::RebuildTrigger;
use std::collections::{BTreeMap, BTreeSet};

/// A state-change request as accepted from a caller.
#[derive(Clone, Debug, PartialEq)]
pub struct Operation {
    pub id: OperationId,
    pub kind: OperationKind,
}

#[derive(Clone, Debug, PartialEq)]
pub enum OperationKind {
    Install {
        app: AppName,
        choices: BTreeMap<String, AppName>,
    },
    Uninstall {
        app: AppName,
    },
    Reconcile,
}

/// What a completed operation reports back to its caller.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct OperationOutcome {
    pub rebuild_id: Option<RebuildId>,
    pub apps: Vec<AppName>,
}

/// Terminal failure of an operation. Serializable so API handlers can
/// surface it as-is.
#[derive(Clone, Debug, thiserror::Error, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum OperationError {
    #[error("Install of {app} is blocked")]
    PlanBlocked {
        app: AppName,
        blockers: Vec<String>,
        choices: Vec<Choice>,
    },
    #[error("Removal of {app} is blocked")]
    RemoveBlocked { app: AppName, blockers: Vec<String> },
    #[error("Unknown app {app}")]
    UnknownApp { app: AppName },
    #[error("App {app} is not installed")]
    NotInstalled { app: AppName },
    #[error("Artifact generation failed: {err}")]
    Generation { err: String },
    #[error("Rebuild failed; the previous system generation remains live")]
    RebuildFailed { rebuild_id: RebuildId },
    #[error("Store failure: {err}")]
    Store { err: String },
    #[error("Operation was cancelled")]
    Cancelled,
    #[error("Internal failure: {err}")]
    Internal { err: String },
}

pub type OperationResult = Result<OperationOutcome, OperationError>;

impl From<crate::store::StoreError> for OperationError {
    fn from(err: crate::store::StoreError) -> Self {
        Self::Store {
            err: err.to_string(),
        }
    }
}

impl From<crate::generator::GeneratorError> for OperationError {
    fn from(err: crate::generator::GeneratorError) -> Self {
        Self::Generation {
            err: err.to_string(),
        }
    }
}

impl From<crate::planner::PlannerError> for OperationError {
    fn from(err: crate::planner::PlannerError) -> Self {
        match err {
            crate::planner::PlannerError::UnknownApp { app } => Self::UnknownApp { app },
            crate::planner::PlannerError::NotInstalled { app } => Self::NotInstalled { app },
        }
    }
}

/// A window's worth of operations, merged into one transaction. Later
/// requests for the same app win: an uninstall supersedes a pending install
/// and vice versa; two installs merge their choices key-by-key.
#[derive(Debug, Default, PartialEq)]
pub struct Batch {
    pub installs: BTreeMap<AppName, BTreeMap<String, AppName>>,
    pub uninstalls: BTreeSet<AppName>,
    pub reconcile: bool,
    pub ids: Vec<OperationId>,
}

impl Batch {
    pub fn coalesce(operations: &[Operation]) -> Self {
        let mut batch = Self::default();

        for operation in operations {
            batch.ids.push(operation.id);
            match &operation.kind {
                OperationKind::Install { app, choices } => {
                    batch.uninstalls.remove(app);
                    batch
                        .installs
                        .entry(app.clone())
                        .or_default()
                        .extend(choices.clone());
                }
                OperationKind::Uninstall { app } => {
                    batch.installs.remove(app);
                    batch.uninstalls.insert(app.clone());
                }
                OperationKind::Reconcile => {
                    batch.reconcile = true;
                }
            }
        }

        batch
    }

    pub fn is_empty(&self) -> bool {
        self.installs.is_empty() && self.uninstalls.is_empty() && !self.reconcile
    }

    pub fn has_mutations(&self) -> bool {
        !self.installs.is_empty() || !self.uninstalls.is_empty()
    }

    pub fn trigger(&self) -> RebuildTrigger {
        if !self.installs.is_empty() {
            RebuildTrigger::Install
        } else if !self.uninstalls.is_empty() {
            RebuildTrigger::Uninstall
        } else {
            RebuildTrigger::Reconcile
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn app(name: &str) -> AppName {
        AppName::from_str(name).unwrap()
    }

    fn install(name: &str) -> Operation {
        Operation {
            id: OperationId::new(),
            kind: OperationKind::Install {
                app: app(name),
                choices: BTreeMap::new(),
            },
        }
    }

    fn uninstall(name: &str) -> Operation {
        Operation {
            id: OperationId::new(),
            kind: OperationKind::Uninstall { app: app(name) },
        }
    }

    #[test]
    fn uninstall_supersedes_pending_install() {
        let batch = Batch::coalesce(&[install("app-x"), uninstall("app-x")]);

        assert!(batch.installs.is_empty());
        assert_eq!(batch.uninstalls, BTreeSet::from([app("app-x")]));
        assert_eq!(batch.ids.len(), 2);
    }

    #[test]
    fn install_supersedes_pending_uninstall() {
        let batch = Batch::coalesce(&[uninstall("app-x"), install("app-x")]);

        assert!(batch.uninstalls.is_empty());
        assert!(batch.installs.contains_key(&app("app-x")));
    }

    #[test]
    fn install_choices_merge_with_later_wins() {
        let first = Operation {
            id: OperationId::new(),
            kind: OperationKind::Install {
                app: app("media-indexer"),
                choices: BTreeMap::from([(String::from("download-client"), app("client-a"))]),
            },
        };
        let second = Operation {
            id: OperationId::new(),
            kind: OperationKind::Install {
                app: app("media-indexer"),
                choices: BTreeMap::from([(String::from("download-client"), app("client-b"))]),
            },
        };

        let batch = Batch::coalesce(&[first, second]);
        assert_eq!(
            batch.installs.get(&app("media-indexer")).unwrap().get("download-client"),
            Some(&app("client-b"))
        );
    }

    #[test]
    fn distinct_apps_stay_separate() {
        let batch = Batch::coalesce(&[install("app-x"), install("app-y"), uninstall("app-z")]);

        assert_eq!(batch.installs.len(), 2);
        assert_eq!(batch.uninstalls.len(), 1);
        assert_eq!(batch.trigger(), RebuildTrigger::Install);
    }

    #[test]
    fn reconcile_only_batch_has_no_mutations() {
        let batch = Batch::coalesce(&[Operation {
            id: OperationId::new(),
            kind: OperationKind::Reconcile,
        }]);

        assert!(!batch.is_empty());
        assert!(!batch.has_mutations());
        assert_eq!(batch.trigger(), RebuildTrigger::Reconcile);
    }
}
