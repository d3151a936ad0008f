use crate::models::AppName;
use async_trait::async_trait;

/// Unit name of an app's containerized service. Containers run as
/// supervisor units emitted by the system-config layer, so the mapping is
/// purely name-based.
pub fn unit_name(app: &AppName) -> String {
    format!("podman-{app}.service")
}

/// Seam to the service supervisor's unit-control surface.
#[async_trait]
pub trait Supervisor: Send + Sync {
    async fn restart(&self, unit: &str) -> anyhow::Result<()>;
    async fn is_active(&self, unit: &str) -> anyhow::Result<bool>;
    async fn reset_failed(&self, unit: &str) -> anyhow::Result<()>;
}

pub struct Systemctl;

impl Systemctl {
    async fn run(args: &[&str]) -> anyhow::Result<std::process::Output> {
        Ok(tokio::process::Command::new("systemctl")
            .args(args)
            .output()
            .await?)
    }
}

#[async_trait]
impl Supervisor for Systemctl {
    async fn restart(&self, unit: &str) -> anyhow::Result<()> {
        let output = Self::run(&["restart", unit]).await?;
        if output.status.success() {
            Ok(())
        } else {
            anyhow::bail!(
                "systemctl restart {unit} failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )
        }
    }

    async fn is_active(&self, unit: &str) -> anyhow::Result<bool> {
        let output = Self::run(&["is-active", "--quiet", unit]).await?;
        Ok(output.status.success())
    }

    async fn reset_failed(&self, unit: &str) -> anyhow::Result<()> {
        let output = Self::run(&["reset-failed", unit]).await?;
        if output.status.success() {
            Ok(())
        } else {
            anyhow::bail!(
                "systemctl reset-failed {unit} failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )
        }
    }
}
