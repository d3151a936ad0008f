mod log;

pub use log::{
    publish, read_index, read_record, LogLine, PhaseRecord, RebuildEvent, RebuildIndexEntry,
    RebuildLogWriter, RebuildPhase, RebuildRecord, RebuildStatus, RebuildTrigger,
};

use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};

/// Terminal classification of one rebuild-tool invocation. The external tool
/// is atomic: on any failure the previous system generation stays live.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RebuildOutcome {
    Success,
    /// The configuration did not evaluate; no service was touched.
    EvaluationFailed,
    /// The new generation built but a unit failed to start.
    ActivationFailed,
}

impl RebuildOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, RebuildOutcome::Success)
    }
}

/// Seam to the external declarative-system rebuild tool.
#[async_trait]
pub trait RebuildTool: Send + Sync {
    async fn rebuild(&self, log: &mut RebuildLogWriter) -> anyhow::Result<RebuildOutcome>;
}

/// Drives `nixos-rebuild switch` against the host flake, streaming its
/// output line-by-line into the rebuild log.
pub struct NixosRebuild {
    flake_path: PathBuf,
    flake_target: String,
}

impl NixosRebuild {
    /// Emitted by the tool right before systemd units are switched; output
    /// after this line means evaluation and build already succeeded.
    const ACTIVATION_MARKER: &'static str = "activating the configuration";

    pub fn new(flake_path: PathBuf, flake_target: String) -> Self {
        Self {
            flake_path,
            flake_target,
        }
    }

    fn expanded_path() -> String {
        // wrapper dirs the tool's activation scripts transitively need
        let inherited = std::env::var("PATH").unwrap_or_default();
        format!("/run/current-system/sw/bin:/run/wrappers/bin:{inherited}")
    }
}

#[async_trait]
impl RebuildTool for NixosRebuild {
    async fn rebuild(&self, log: &mut RebuildLogWriter) -> anyhow::Result<RebuildOutcome> {
        let flake_ref = format!("{}#{}", self.flake_path.display(), self.flake_target);
        log.info(format!("nixos-rebuild switch --flake {flake_ref}"));

        let mut child = tokio::process::Command::new("nixos-rebuild")
            .arg("switch")
            .arg("--flake")
            .arg(&flake_ref)
            // the tool re-execs itself when invoked from an unexpected
            // binary path; we are exactly that case
            .env("_NIXOS_REBUILD_REEXEC", "1")
            .env("PATH", Self::expanded_path())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow::anyhow!("rebuild tool stdout not captured"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow::anyhow!("rebuild tool stderr not captured"))?;

        let mut stdout_lines = BufReader::new(stdout).lines();
        let mut stderr_lines = BufReader::new(stderr).lines();
        let mut stdout_open = true;
        let mut stderr_open = true;
        let mut saw_activation = false;

        while stdout_open || stderr_open {
            tokio::select! {
                line = stdout_lines.next_line(), if stdout_open => match line? {
                    Some(line) => {
                        saw_activation |= line.contains(Self::ACTIVATION_MARKER);
                        log.info(line);
                    }
                    None => stdout_open = false,
                },
                line = stderr_lines.next_line(), if stderr_open => match line? {
                    Some(line) => {
                        saw_activation |= line.contains(Self::ACTIVATION_MARKER);
                        log.error(line);
                    }
                    None => stderr_open = false,
                },
            }
        }

        let status = child.wait().await?;
        if status.success() {
            Ok(RebuildOutcome::Success)
        } else if saw_activation {
            log.error(format!("rebuild tool failed during activation: {status}"));
            Ok(RebuildOutcome::ActivationFailed)
        } else {
            log.error(format!("rebuild tool failed during evaluation: {status}"));
            Ok(RebuildOutcome::EvaluationFailed)
        }
    }
}

#[cfg(test)]
pub mod dummy {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Scriptable stand-in for the rebuild tool. Records how often it ran
    /// and returns the queued outcomes in order (defaulting to success).
    pub struct DummyRebuildTool {
        outcomes: Mutex<Vec<RebuildOutcome>>,
        pub invocations: AtomicUsize,
    }

    impl DummyRebuildTool {
        pub fn new() -> Self {
            Self {
                outcomes: Mutex::new(Vec::new()),
                invocations: AtomicUsize::new(0),
            }
        }

        pub fn with_outcomes(outcomes: Vec<RebuildOutcome>) -> Self {
            Self {
                outcomes: Mutex::new(outcomes),
                invocations: AtomicUsize::new(0),
            }
        }

        pub fn invocation_count(&self) -> usize {
            self.invocations.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl RebuildTool for DummyRebuildTool {
        async fn rebuild(&self, log: &mut RebuildLogWriter) -> anyhow::Result<RebuildOutcome> {
            self.invocations.fetch_add(1, Ordering::SeqCst);
            let outcome = self
                .outcomes
                .lock()
                .map_err(|_| anyhow::anyhow!("outcome queue poisoned"))?
                .pop()
                .unwrap_or(RebuildOutcome::Success);
            log.info("dummy rebuild");
            Ok(outcome)
        }
    }
}
