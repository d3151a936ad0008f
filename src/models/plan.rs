use crate::models::AppName;
use std::collections::BTreeMap;

/// A decision the caller has to make before an install can proceed: the
/// integration has several compatible sources and none of them is a clear
/// winner.
#[derive(Clone, Debug, Eq, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Choice {
    pub integration: String,
    pub options: Vec<AppName>,
}

/// A new integration edge the install transaction will create.
#[derive(Clone, Debug, Eq, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct PlannedBinding {
    pub consumer: AppName,
    pub integration: String,
    pub source: AppName,
}

/// Result of planning an install. `can_install` is false whenever blockers
/// or open choices remain; a blocked plan is a successful planning result,
/// not an error.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct InstallPlan {
    pub target: AppName,
    pub can_install: bool,
    pub blockers: Vec<String>,
    pub choices: Vec<Choice>,
    /// Integrations of the target that resolved without user input.
    pub auto_config: BTreeMap<String, AppName>,
    /// Transitive set of apps to install, dependencies first. Includes the
    /// target itself as the last entry.
    pub to_install: Vec<AppName>,
    /// All new integration edges across the transitive set.
    pub bindings: Vec<PlannedBinding>,
    /// Already-installed apps whose integration set changes because this
    /// install provides something they consume.
    pub dependents: Vec<AppName>,
}

impl InstallPlan {
    pub fn blocked(target: AppName, blockers: Vec<String>, choices: Vec<Choice>) -> Self {
        Self {
            target,
            can_install: false,
            blockers,
            choices,
            auto_config: BTreeMap::new(),
            to_install: Vec::new(),
            bindings: Vec::new(),
            dependents: Vec::new(),
        }
    }
}

/// Result of planning a removal.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct RemovePlan {
    pub target: AppName,
    pub can_remove: bool,
    pub blockers: Vec<String>,
    /// Installed consumers whose binding to the target must be cleared (and
    /// their dynamic configuration re-run) before the rebuild removes the
    /// target.
    pub will_unconfigure: Vec<AppName>,
}
