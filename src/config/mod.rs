use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use url::Url;

/// Process-wide configuration, resolved once at startup and constant during
/// the run. Values layer as defaults < `bloud.toml` < environment.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    #[serde(default = "Config::default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "Config::default_apps_dir")]
    pub apps_dir: PathBuf,
    /// Overrides the embedded store location. Defaults to a SQLite file
    /// under `<data_dir>/state`.
    #[serde(default)]
    pub database_url: Option<String>,
    /// Where the generated `apps.nix` lands. Defaults to `<data_dir>/nix`.
    #[serde(default)]
    pub nix_config_dir: Option<PathBuf>,
    #[serde(default = "Config::default_flake_path")]
    pub flake_path: PathBuf,
    #[serde(default = "Config::default_flake_target")]
    pub flake_target: String,
    /// Public root URL of the host. OAuth callbacks are mounted here, so SSO
    /// blueprints always reference the root, never an app path.
    #[serde(default = "Config::default_base_url")]
    pub base_url: Url,
    /// Loopback port of the identity provider's embedded outpost.
    #[serde(default = "Config::default_outpost_port")]
    pub outpost_port: u16,
    /// Base URL of the identity provider's management API.
    #[serde(default = "Config::default_idp_url")]
    pub idp_url: Url,
    /// How long the orchestrator worker waits to coalesce concurrent
    /// requests into one batch.
    #[serde(default = "Config::default_batch_window_ms")]
    pub batch_window_ms: u64,
}

impl Config {
    pub fn load() -> Result<Config, ConfigError> {
        let figment = Figment::new()
            .merge(Toml::file(
                std::env::var("BLOUD_CONFIG").unwrap_or_else(|_| String::from("bloud.toml")),
            ))
            .merge(Env::prefixed("BLOUD_"))
            .merge(Env::raw().only(&[
                "DATA_DIR",
                "APPS_DIR",
                "DATABASE_URL",
                "NIX_CONFIG_DIR",
                "FLAKE_PATH",
                "FLAKE_TARGET",
            ]));

        Ok(figment.extract::<Config>()?)
    }

    fn default_data_dir() -> PathBuf {
        PathBuf::from("/var/lib/bloud")
    }

    fn default_apps_dir() -> PathBuf {
        PathBuf::from("/etc/bloud/apps")
    }

    fn default_flake_path() -> PathBuf {
        PathBuf::from("/etc/bloud/flake")
    }

    fn default_flake_target() -> String {
        String::from("bloud-host")
    }

    fn default_base_url() -> Url {
        Url::parse("http://bloud.local").unwrap()
    }

    fn default_outpost_port() -> u16 {
        9000
    }

    fn default_idp_url() -> Url {
        Url::parse("http://127.0.0.1:9000").unwrap()
    }

    fn default_batch_window_ms() -> u64 {
        100
    }

    pub fn nix_config_dir(&self) -> PathBuf {
        self.nix_config_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("nix"))
    }

    pub fn apps_nix_file(&self) -> PathBuf {
        self.nix_config_dir().join("apps.nix")
    }

    pub fn routes_file(&self) -> PathBuf {
        self.data_dir.join("traefik/dynamic/apps-routes.yml")
    }

    pub fn blueprints_dir(&self) -> PathBuf {
        self.data_dir.join("authentik/blueprints")
    }

    pub fn secrets_dir(&self) -> PathBuf {
        self.data_dir.join("secrets")
    }

    pub fn host_secret_file(&self) -> PathBuf {
        self.secrets_dir().join("host.key")
    }

    pub fn env_file(&self, app: &crate::models::AppName) -> PathBuf {
        self.secrets_dir().join(format!("{app}.env"))
    }

    pub fn state_dir(&self) -> PathBuf {
        self.data_dir.join("state")
    }

    pub fn rebuild_logs_dir(&self) -> PathBuf {
        self.data_dir.join("logs/rebuilds")
    }

    pub fn database_url(&self) -> String {
        match &self.database_url {
            Some(url) => url.clone(),
            None => format!(
                "sqlite://{}?mode=rwc",
                self.state_dir().join("bloud.db").display()
            ),
        }
    }

    /// A config rooted at a temporary directory. Only used by tests.
    pub fn for_data_dir(data_dir: &Path, apps_dir: &Path) -> Self {
        Self {
            data_dir: data_dir.to_path_buf(),
            apps_dir: apps_dir.to_path_buf(),
            database_url: Some(String::from("sqlite::memory:")),
            nix_config_dir: None,
            flake_path: Self::default_flake_path(),
            flake_target: Self::default_flake_target(),
            base_url: Self::default_base_url(),
            outpost_port: Self::default_outpost_port(),
            idp_url: Self::default_idp_url(),
            batch_window_ms: 10,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: Self::default_data_dir(),
            apps_dir: Self::default_apps_dir(),
            database_url: None,
            nix_config_dir: None,
            flake_path: Self::default_flake_path(),
            flake_target: Self::default_flake_target(),
            base_url: Self::default_base_url(),
            outpost_port: Self::default_outpost_port(),
            idp_url: Self::default_idp_url(),
            batch_window_ms: Self::default_batch_window_ms(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Cannot resolve configuration: {err}")]
    Figment { err: Box<figment::Error> },
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment { err: Box::new(err) }
    }
}
