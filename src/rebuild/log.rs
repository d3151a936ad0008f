use crate::models::{AppName, RebuildId};
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tokio::sync::broadcast;

#[derive(Clone, Copy, Debug, Eq, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RebuildTrigger {
    Install,
    Uninstall,
    Reconcile,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RebuildPhase {
    Preflight,
    NixConfig,
    Rebuild,
    PostRebuild,
}

impl RebuildPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            RebuildPhase::Preflight => "preflight",
            RebuildPhase::NixConfig => "nix_config",
            RebuildPhase::Rebuild => "rebuild",
            RebuildPhase::PostRebuild => "post_rebuild",
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RebuildStatus {
    Running,
    Success,
    Failed,
}

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct LogLine {
    pub at: DateTime<Utc>,
    pub level: String,
    pub message: String,
}

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct PhaseRecord {
    pub phase: RebuildPhase,
    pub started_at: DateTime<Utc>,
    pub entries: Vec<LogLine>,
}

/// One rebuild, start to finish: what triggered it, which apps it touched,
/// and the structured per-phase entries an operator needs to diagnose a
/// failure without digging through system journals.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct RebuildRecord {
    pub id: RebuildId,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub trigger: RebuildTrigger,
    pub apps: Vec<AppName>,
    pub phases: Vec<PhaseRecord>,
    pub status: RebuildStatus,
    pub summary: Option<String>,
}

/// Entry in `index.json`, newest first.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct RebuildIndexEntry {
    pub id: RebuildId,
    pub file: String,
    pub started_at: DateTime<Utc>,
    pub trigger: RebuildTrigger,
    pub status: RebuildStatus,
    pub apps: Vec<AppName>,
}

/// Progress event published while a rebuild is running.
#[derive(Clone, Debug)]
pub struct RebuildEvent {
    pub rebuild_id: RebuildId,
    pub phase: RebuildPhase,
    pub message: String,
}

/// Accumulates one rebuild's structured log and fans progress out to
/// subscribers. Publishing writes the JSON file under a timestamped name and
/// prepends an index entry.
pub struct RebuildLogWriter {
    record: RebuildRecord,
    events: broadcast::Sender<RebuildEvent>,
}

impl RebuildLogWriter {
    pub fn new(
        trigger: RebuildTrigger,
        apps: Vec<AppName>,
        events: broadcast::Sender<RebuildEvent>,
    ) -> Self {
        Self {
            record: RebuildRecord {
                id: RebuildId::new(),
                started_at: Utc::now(),
                finished_at: None,
                trigger,
                apps,
                phases: Vec::new(),
                status: RebuildStatus::Running,
                summary: None,
            },
            events,
        }
    }

    pub fn id(&self) -> RebuildId {
        self.record.id
    }

    pub fn begin_phase(&mut self, phase: RebuildPhase) {
        log::debug!("Rebuild {}: entering phase {}", self.record.id, phase.as_str());
        self.record.phases.push(PhaseRecord {
            phase,
            started_at: Utc::now(),
            entries: Vec::new(),
        });
    }

    pub fn log(&mut self, level: &str, message: impl Into<String>) {
        if self.record.phases.is_empty() {
            self.begin_phase(RebuildPhase::Preflight);
        }

        let message = message.into();
        let rebuild_id = self.record.id;
        if let Some(phase) = self.record.phases.last_mut() {
            phase.entries.push(LogLine {
                at: Utc::now(),
                level: level.to_string(),
                message: message.clone(),
            });

            // nobody listening is fine
            let _ = self.events.send(RebuildEvent {
                rebuild_id,
                phase: phase.phase,
                message,
            });
        }
    }

    pub fn info(&mut self, message: impl Into<String>) {
        self.log("info", message);
    }

    pub fn error(&mut self, message: impl Into<String>) {
        self.log("error", message);
    }

    pub fn finish(mut self, status: RebuildStatus, summary: impl Into<String>) -> RebuildRecord {
        self.record.finished_at = Some(Utc::now());
        self.record.status = status;
        self.record.summary = Some(summary.into());
        self.record
    }
}

pub fn publish(record: &RebuildRecord, dir: &Path) -> Result<PathBuf, std::io::Error> {
    std::fs::create_dir_all(dir)?;

    let file_name = format!(
        "{}-{}.json",
        record.started_at.format("%Y%m%dT%H%M%S"),
        record.id.simple()
    );
    let path = dir.join(&file_name);
    std::fs::write(&path, serde_json::to_vec_pretty(record)?)?;

    let index_path = dir.join("index.json");
    let mut index: Vec<RebuildIndexEntry> = match std::fs::read(&index_path) {
        Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_default(),
        Err(_) => Vec::new(),
    };
    index.insert(
        0,
        RebuildIndexEntry {
            id: record.id,
            file: file_name,
            started_at: record.started_at,
            trigger: record.trigger,
            status: record.status,
            apps: record.apps.clone(),
        },
    );
    std::fs::write(&index_path, serde_json::to_vec_pretty(&index)?)?;

    Ok(path)
}

pub fn read_index(dir: &Path) -> Vec<RebuildIndexEntry> {
    std::fs::read(dir.join("index.json"))
        .ok()
        .and_then(|bytes| serde_json::from_slice(&bytes).ok())
        .unwrap_or_default()
}

pub fn read_record(dir: &Path, id: RebuildId) -> Option<RebuildRecord> {
    let entry = read_index(dir).into_iter().find(|entry| entry.id == id)?;
    let bytes = std::fs::read(dir.join(entry.file)).ok()?;
    serde_json::from_slice(&bytes).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn writer(trigger: RebuildTrigger) -> RebuildLogWriter {
        let (events, _) = broadcast::channel(16);
        RebuildLogWriter::new(
            trigger,
            vec![AppName::from_str("rss-reader").unwrap()],
            events,
        )
    }

    #[test]
    fn phases_collect_entries_in_order() {
        let mut log = writer(RebuildTrigger::Install);
        log.begin_phase(RebuildPhase::Preflight);
        log.info("planning 2 apps");
        log.begin_phase(RebuildPhase::Rebuild);
        log.info("line 1");
        log.error("line 2");

        let record = log.finish(RebuildStatus::Success, "done");
        assert_eq!(record.phases.len(), 2);
        assert_eq!(record.phases[1].entries.len(), 2);
        assert_eq!(record.phases[1].entries[1].level, "error");
        assert_eq!(record.status, RebuildStatus::Success);
        assert!(record.finished_at.is_some());
    }

    #[test]
    fn events_reach_subscribers() {
        let (events, mut rx) = broadcast::channel(16);
        let mut log = RebuildLogWriter::new(RebuildTrigger::Reconcile, Vec::new(), events);
        log.begin_phase(RebuildPhase::Rebuild);
        log.info("building");

        let event = rx.try_recv().unwrap();
        assert_eq!(event.phase, RebuildPhase::Rebuild);
        assert_eq!(event.message, "building");
    }

    #[test]
    fn publish_writes_record_and_index() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = writer(RebuildTrigger::Install);
        log.begin_phase(RebuildPhase::Rebuild);
        log.info("ok");
        let record = log.finish(RebuildStatus::Success, "done");
        let id = record.id;

        publish(&record, dir.path()).unwrap();

        let index = read_index(dir.path());
        assert_eq!(index.len(), 1);
        assert_eq!(index[0].id, id);

        let reread = read_record(dir.path(), id).unwrap();
        assert_json_diff::assert_json_include!(
            actual: serde_json::to_value(&reread).unwrap(),
            expected: serde_json::json!({
                "trigger": "install",
                "status": "success",
                "summary": "done",
                "apps": ["rss-reader"],
                "phases": [{ "phase": "rebuild" }],
            })
        );
    }

    #[test]
    fn index_keeps_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let first = writer(RebuildTrigger::Install).finish(RebuildStatus::Success, "one");
        let second = writer(RebuildTrigger::Uninstall).finish(RebuildStatus::Failed, "two");

        publish(&first, dir.path()).unwrap();
        publish(&second, dir.path()).unwrap();

        let index = read_index(dir.path());
        assert_eq!(index.len(), 2);
        assert_eq!(index[0].id, second.id);
        assert_eq!(index[0].status, RebuildStatus::Failed);
    }
}
