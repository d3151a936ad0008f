use crate::models::AppName;
use chrono::{DateTime, Utc};
use std::str::FromStr;

/// Lifecycle status of an installed app. Transitions within a single
/// operation only ever move forward (see [`AppStatus::may_advance_to`]).
#[derive(Clone, Copy, Debug, Eq, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppStatus {
    Queued,
    Configuring,
    Building,
    Starting,
    Running,
    Stopping,
    Stopped,
    Error,
    Failed,
}

impl AppStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppStatus::Queued => "queued",
            AppStatus::Configuring => "configuring",
            AppStatus::Building => "building",
            AppStatus::Starting => "starting",
            AppStatus::Running => "running",
            AppStatus::Stopping => "stopping",
            AppStatus::Stopped => "stopped",
            AppStatus::Error => "error",
            AppStatus::Failed => "failed",
        }
    }

    fn rank(&self) -> u8 {
        match self {
            AppStatus::Queued => 0,
            AppStatus::Configuring => 1,
            AppStatus::Building => 2,
            AppStatus::Starting => 3,
            AppStatus::Running => 4,
            AppStatus::Stopping => 5,
            AppStatus::Stopped => 6,
            AppStatus::Error => 7,
            AppStatus::Failed => 7,
        }
    }

    /// Whether moving to `next` is a forward transition. `Error` and `Failed`
    /// are reachable from every state, and a later operation may recover
    /// from them or start the sequence over.
    pub fn may_advance_to(&self, next: AppStatus) -> bool {
        match (self, next) {
            (_, AppStatus::Error | AppStatus::Failed) => true,
            (AppStatus::Error | AppStatus::Failed, _) => true,
            // a new operation restarts the sequence
            (_, AppStatus::Queued | AppStatus::Configuring) => true,
            _ => next.rank() > self.rank(),
        }
    }
}

impl std::fmt::Display for AppStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AppStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(AppStatus::Queued),
            "configuring" => Ok(AppStatus::Configuring),
            "building" => Ok(AppStatus::Building),
            "starting" => Ok(AppStatus::Starting),
            "running" => Ok(AppStatus::Running),
            "stopping" => Ok(AppStatus::Stopping),
            "stopped" => Ok(AppStatus::Stopped),
            "error" => Ok(AppStatus::Error),
            "failed" => Ok(AppStatus::Failed),
            other => Err(format!("unknown app status {other:?}")),
        }
    }
}

/// Durable record of an installed app, owned by the store.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct InstalledApp {
    pub name: AppName,
    pub display_name: String,
    pub version: Option<String>,
    pub status: AppStatus,
    pub port: Option<u16>,
    pub is_system: bool,
    pub installed_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A concrete integration edge: `consumer_app`'s `integration` is served by
/// `source_app`. `configured_at` is the time the consumer's dynamic
/// configuration last succeeded for this edge; `None` means it still needs
/// configuration.
#[derive(Clone, Debug, Eq, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Binding {
    pub consumer_app: AppName,
    pub integration: String,
    pub source_app: AppName,
    pub configured_at: Option<DateTime<Utc>>,
}

impl Binding {
    pub fn new(consumer_app: AppName, integration: impl Into<String>, source_app: AppName) -> Self {
        Self {
            consumer_app,
            integration: integration.into(),
            source_app,
            configured_at: None,
        }
    }
}

/// Durable marker that an installed app may need its static configuration
/// re-checked. One row per app; marking twice collapses to one row.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Invalidation {
    pub app_name: AppName,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_str() {
        for status in [
            AppStatus::Queued,
            AppStatus::Configuring,
            AppStatus::Building,
            AppStatus::Starting,
            AppStatus::Running,
            AppStatus::Stopping,
            AppStatus::Stopped,
            AppStatus::Error,
            AppStatus::Failed,
        ] {
            assert_eq!(AppStatus::from_str(status.as_str()), Ok(status));
        }
    }

    #[test]
    fn status_never_moves_backwards_within_an_operation() {
        assert!(AppStatus::Queued.may_advance_to(AppStatus::Configuring));
        assert!(AppStatus::Configuring.may_advance_to(AppStatus::Building));
        assert!(AppStatus::Building.may_advance_to(AppStatus::Starting));
        assert!(AppStatus::Starting.may_advance_to(AppStatus::Running));

        assert!(!AppStatus::Running.may_advance_to(AppStatus::Building));
        assert!(!AppStatus::Starting.may_advance_to(AppStatus::Building));
    }

    #[test]
    fn failure_states_are_always_reachable() {
        assert!(AppStatus::Queued.may_advance_to(AppStatus::Failed));
        assert!(AppStatus::Running.may_advance_to(AppStatus::Error));
    }

    #[test]
    fn later_operations_recover_from_failure_states() {
        assert!(AppStatus::Error.may_advance_to(AppStatus::Running));
        assert!(AppStatus::Failed.may_advance_to(AppStatus::Queued));
    }
}
