use crate::models::AppName;
use secstr::SecUtf8;
use sha2::{Digest, Sha256};
use std::io::Write;
use std::path::Path;

/// The one stored secret on the host. Every per-app credential is derived
/// from it, so rotating this file rotates everything.
#[derive(Clone)]
pub struct HostSecret(SecUtf8);

impl HostSecret {
    /// Reads the seed, generating it on first use. Generation is guarded by
    /// `create_new` so concurrent first runs cannot clobber each other.
    pub fn load_or_init(path: &Path) -> std::io::Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(contents) => return Ok(Self(SecUtf8::from(contents.trim().to_string()))),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err),
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let seed = format!(
            "{}{}",
            uuid::Uuid::new_v4().simple(),
            uuid::Uuid::new_v4().simple()
        );

        let mut options = std::fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }

        match options.open(path) {
            Ok(mut file) => {
                file.write_all(seed.as_bytes())?;
                log::info!("Generated host secret at {}", path.display());
                Ok(Self(SecUtf8::from(seed)))
            }
            // lost the race against another first run; the winner's seed counts
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let contents = std::fs::read_to_string(path)?;
                Ok(Self(SecUtf8::from(contents.trim().to_string())))
            }
            Err(err) => Err(err),
        }
    }

    pub fn from_seed(seed: impl Into<String>) -> Self {
        Self(SecUtf8::from(seed.into()))
    }

    fn derive(&self, kind: &str, app: &AppName) -> String {
        let mut hasher = Sha256::new();
        hasher.update(format!("{kind}:{app}:{}", self.0.unsecure()));
        format!("{:x}", hasher.finalize())
    }

    /// Stable across runs on the same host, unique across hosts.
    pub fn oauth_client_id(&self, app: &AppName) -> String {
        let mut digest = self.derive("bloud-client-id", app);
        digest.truncate(32);
        digest
    }

    pub fn oauth_client_secret(&self, app: &AppName) -> String {
        self.derive("bloud-client-secret", app)
    }

    pub fn db_password(&self, app: &AppName) -> String {
        self.derive("bloud-db", app)
    }

    pub fn admin_password(&self, app: &AppName) -> String {
        self.derive("bloud-admin", app)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn app(name: &str) -> AppName {
        AppName::from_str(name).unwrap()
    }

    #[test]
    fn derived_credentials_are_stable_per_seed() {
        let secret = HostSecret::from_seed("seed-1");
        assert_eq!(
            secret.oauth_client_id(&app("app-x")),
            secret.oauth_client_id(&app("app-x"))
        );
        assert_eq!(secret.oauth_client_id(&app("app-x")).len(), 32);
        assert_eq!(secret.oauth_client_secret(&app("app-x")).len(), 64);
    }

    #[test]
    fn derived_credentials_differ_across_apps_and_hosts() {
        let host1 = HostSecret::from_seed("seed-1");
        let host2 = HostSecret::from_seed("seed-2");

        assert_ne!(
            host1.oauth_client_id(&app("app-x")),
            host1.oauth_client_id(&app("app-y"))
        );
        assert_ne!(
            host1.oauth_client_id(&app("app-x")),
            host2.oauth_client_id(&app("app-x"))
        );
        assert_ne!(
            host1.oauth_client_id(&app("app-x")),
            host1.oauth_client_secret(&app("app-x"))
        );
    }

    #[test]
    fn seed_is_generated_once_and_reread() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secrets/host.key");

        let first = HostSecret::load_or_init(&path).unwrap();
        let second = HostSecret::load_or_init(&path).unwrap();

        assert_eq!(
            first.db_password(&app("app-x")),
            second.db_password(&app("app-x"))
        );
    }
}
