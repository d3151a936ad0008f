mod env_file;
mod idp;
mod supervisor;

pub use env_file::{reconcile, EnvFileUpdate};
pub use idp::{IdentityProvider, IdpClient};
pub use supervisor::{unit_name, Supervisor, Systemctl};

#[cfg(test)]
pub use idp::dummy::{DummyIdentityProvider, EverythingImported};
#[cfg(test)]
pub use supervisor::dummy::DummySupervisor;

use crate::catalog::Catalog;
use crate::config::Config;
use crate::generator::{self, GeneratorContext, GeneratorError, HostSecret};
use crate::models::{AppManifest, AppName, Binding, InstalledApp};
use crate::store::{Store, StoreError};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Per-app view a configurator runs against, assembled from the store: the
/// app's record and manifest, its bindings, the env keys the platform
/// manages for it, and the operation's cancellation signal.
#[derive(Clone)]
pub struct AppState {
    pub app: InstalledApp,
    pub manifest: AppManifest,
    pub bindings: Vec<Binding>,
    pub managed_env: BTreeMap<String, String>,
    /// Every env key the platform may ever own for this app; keys in here
    /// but not in `managed_env` are removed from the file.
    pub owned_env: BTreeSet<String>,
    pub env_file: PathBuf,
    pub cancel: watch::Receiver<bool>,
}

impl AppState {
    pub fn name(&self) -> &AppName {
        &self.app.name
    }

    fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }
}

lazy_static::lazy_static! {
    static ref NEVER_CANCELLED: (watch::Sender<bool>, watch::Receiver<bool>) =
        watch::channel(false);
}

/// A watch receiver that never fires; for entry points that have no caller
/// to cancel them (CLI hooks, reconciliation).
pub fn never_cancelled() -> watch::Receiver<bool> {
    NEVER_CANCELLED.1.clone()
}

pub async fn assemble_state(
    store: &Store,
    catalog: &Catalog,
    config: &Config,
    host_secret: &HostSecret,
    app: &AppName,
    cancel: watch::Receiver<bool>,
) -> Result<AppState, ConfiguratorError> {
    let record = store
        .installed_app(app)
        .await?
        .ok_or_else(|| ConfiguratorError::NotInstalled { app: app.clone() })?;
    let manifest = catalog
        .get(app)
        .ok_or_else(|| ConfiguratorError::UnknownApp { app: app.clone() })?
        .clone();
    let bindings = store.bindings_of_consumer(app).await?;
    let managed_env = generator::managed_env(
        catalog,
        app,
        &bindings,
        host_secret,
        &GeneratorContext::from(config),
    )?;
    let owned_env = generator::owned_env_keys(&manifest);

    Ok(AppState {
        app: record,
        manifest,
        bindings,
        managed_env,
        owned_env,
        env_file: config.env_file(app),
        cancel,
    })
}

/// The per-app configuration lifecycle. All three steps are idempotent;
/// `static_config` is the only thing that ever decides a restart.
#[async_trait]
pub trait Configurator: Send + Sync {
    /// Brings the files the app reads at startup in line with the desired
    /// state. Returns whether anything changed.
    async fn static_config(&self, state: &AppState) -> Result<bool, ConfiguratorError>;

    /// Blocks until the app is ready or its health-check timeout elapses.
    async fn health_check(&self, state: &AppState) -> Result<(), ConfiguratorError>;

    /// Runtime setup through the app's own management API, after the app is
    /// healthy. Reconciles rather than appends.
    async fn dynamic_config(&self, state: &AppState) -> Result<(), ConfiguratorError>;
}

/// Default configurator, driven entirely by the app's manifest: reconciles
/// the managed env keys, polls the declared health endpoint, and verifies
/// the identity provider picked up the app's blueprint.
pub struct ManifestConfigurator {
    idp: Arc<dyn IdentityProvider>,
    http: reqwest::Client,
}

impl ManifestConfigurator {
    pub fn new(idp: Arc<dyn IdentityProvider>) -> Self {
        Self {
            idp,
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Configurator for ManifestConfigurator {
    async fn static_config(&self, state: &AppState) -> Result<bool, ConfiguratorError> {
        let io_err = |err: std::io::Error| ConfiguratorError::Io {
            path: state.env_file.clone(),
            err: err.to_string(),
        };

        let current = match std::fs::read_to_string(&state.env_file) {
            Ok(contents) => Some(contents),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
            Err(err) => return Err(io_err(err)),
        };

        if current.is_none() && state.managed_env.is_empty() {
            return Ok(false);
        }

        let update = reconcile(current.as_deref(), &state.managed_env, &state.owned_env);
        if update.changed {
            if update.content.is_empty() {
                match std::fs::remove_file(&state.env_file) {
                    Ok(()) => {}
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                    Err(err) => return Err(io_err(err)),
                }
            } else {
                if let Some(parent) = state.env_file.parent() {
                    std::fs::create_dir_all(parent).map_err(io_err)?;
                }
                let tmp = state.env_file.with_extension("env.tmp");
                std::fs::write(&tmp, &update.content).map_err(io_err)?;
                std::fs::rename(&tmp, &state.env_file).map_err(io_err)?;
            }
            log::info!("Static config of {} changed", state.name());
        }

        Ok(update.changed)
    }

    async fn health_check(&self, state: &AppState) -> Result<(), ConfiguratorError> {
        let (Some(port), Some(spec)) = (state.manifest.port, &state.manifest.health_check) else {
            return Ok(());
        };

        let url = format!("http://127.0.0.1:{port}{}", spec.path);
        let interval = Duration::from_secs(spec.interval_secs.max(1));
        let deadline = tokio::time::Instant::now() + Duration::from_secs(spec.timeout_secs);

        loop {
            if state.is_cancelled() {
                return Err(ConfiguratorError::Cancelled);
            }

            let probe = self.http.get(&url).timeout(Duration::from_secs(5)).send();
            if let Ok(response) = probe.await {
                if response.status().is_success() {
                    return Ok(());
                }
            }

            if tokio::time::Instant::now() + interval > deadline {
                return Err(ConfiguratorError::HealthCheckTimeout {
                    app: state.name().clone(),
                    timeout_secs: spec.timeout_secs,
                });
            }

            let mut cancel = state.cancel.clone();
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = cancel.changed() => {}
            }
        }
    }

    async fn dynamic_config(&self, state: &AppState) -> Result<(), ConfiguratorError> {
        use crate::models::SsoStrategy;

        // The only cross-app runtime setup the platform does itself is SSO:
        // confirm the identity provider has imported this app's blueprint.
        // Everything else is app-specific configurator code.
        let wants_sso = matches!(
            state.manifest.sso.strategy,
            SsoStrategy::ForwardAuth | SsoStrategy::NativeOidc
        );
        let has_sso_binding = state
            .bindings
            .iter()
            .any(|binding| binding.integration == "sso");
        if !wants_sso || !has_sso_binding {
            return Ok(());
        }

        let provider_name = format!("bloud-{}", state.name());
        let exists = self
            .idp
            .provider_exists(&provider_name)
            .await
            .map_err(|err| ConfiguratorError::DynamicConfig {
                app: state.name().clone(),
                err: err.to_string(),
            })?;

        if exists {
            Ok(())
        } else {
            // transient until the provider's blueprint watcher catches up
            Err(ConfiguratorError::DynamicConfig {
                app: state.name().clone(),
                err: format!("identity provider has not imported {provider_name} yet"),
            })
        }
    }
}

/// Maps apps to their configurators. Apps without registered code get the
/// manifest-driven default.
pub struct ConfiguratorRegistry {
    custom: HashMap<AppName, Arc<dyn Configurator>>,
    default: Arc<dyn Configurator>,
}

impl ConfiguratorRegistry {
    pub fn new(idp: Arc<dyn IdentityProvider>) -> Self {
        Self::with_default(Arc::new(ManifestConfigurator::new(idp)))
    }

    pub fn with_default(default: Arc<dyn Configurator>) -> Self {
        Self {
            custom: HashMap::new(),
            default,
        }
    }

    pub fn register(&mut self, app: AppName, configurator: Arc<dyn Configurator>) {
        self.custom.insert(app, configurator);
    }

    pub fn get(&self, app: &AppName) -> Arc<dyn Configurator> {
        self.custom
            .get(app)
            .cloned()
            .unwrap_or_else(|| self.default.clone())
    }
}

/// Groups a subset of apps into dependency levels: every binding source
/// comes in an earlier level than its consumer. Apps within a level are
/// independent of each other and sorted by name.
pub fn topological_levels(
    apps: &BTreeSet<AppName>,
    bindings: &[Binding],
) -> Result<Vec<Vec<AppName>>, ConfiguratorError> {
    let mut dependencies: BTreeMap<&AppName, BTreeSet<&AppName>> =
        apps.iter().map(|app| (app, BTreeSet::new())).collect();

    for binding in bindings {
        if apps.contains(&binding.consumer_app) && apps.contains(&binding.source_app) {
            if let Some(deps) = dependencies.get_mut(&binding.consumer_app) {
                deps.insert(&binding.source_app);
            }
        }
    }

    let mut levels = Vec::new();
    let mut placed: BTreeSet<&AppName> = BTreeSet::new();

    while placed.len() < apps.len() {
        let ready = dependencies
            .iter()
            .filter(|(app, deps)| {
                !placed.contains(*app) && deps.iter().all(|dep| placed.contains(dep))
            })
            .map(|(app, _)| (*app).clone())
            .collect::<Vec<_>>();

        if ready.is_empty() {
            let stuck = apps
                .iter()
                .filter(|app| !placed.contains(app))
                .map(|app| app.as_str())
                .collect::<Vec<_>>()
                .join(", ");
            return Err(ConfiguratorError::DependencyCycle { apps: stuck });
        }

        for name in &ready {
            if let Some(key) = apps.get(name) {
                placed.insert(key);
            }
        }
        levels.push(ready);
    }

    Ok(levels)
}

#[derive(Debug, thiserror::Error)]
pub enum ConfiguratorError {
    #[error("App {app} is not installed")]
    NotInstalled { app: AppName },
    #[error("App {app} has no catalog entry")]
    UnknownApp { app: AppName },
    #[error("Cannot update {path}: {err}")]
    Io { path: PathBuf, err: String },
    #[error(transparent)]
    Generator(#[from] GeneratorError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("App {app} did not become healthy within {timeout_secs}s")]
    HealthCheckTimeout { app: AppName, timeout_secs: u64 },
    #[error("Dynamic configuration of {app} failed: {err}")]
    DynamicConfig { app: AppName, err: String },
    #[error("Dependency cycle among: {apps}")]
    DependencyCycle { apps: String },
    #[error("Operation was cancelled")]
    Cancelled,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::fixtures::sample_catalog;
    use crate::models::AppStatus;
    use chrono::Utc;
    use std::str::FromStr;

    fn app(name: &str) -> AppName {
        AppName::from_str(name).unwrap()
    }

    fn state_for(name: &str, env_file: PathBuf, managed: &[(&str, &str)]) -> AppState {
        let catalog = sample_catalog();
        let manifest = catalog.get(&app(name)).unwrap().clone();
        let now = Utc::now();
        let managed_env: BTreeMap<String, String> = managed
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        let mut owned_env = generator::owned_env_keys(&manifest);
        owned_env.extend(managed_env.keys().cloned());
        AppState {
            app: InstalledApp {
                name: app(name),
                display_name: manifest.display_name.clone(),
                version: None,
                status: AppStatus::Starting,
                port: manifest.port,
                is_system: manifest.is_system,
                installed_at: now,
                updated_at: now,
            },
            manifest,
            bindings: Vec::new(),
            managed_env,
            owned_env,
            env_file,
            cancel: never_cancelled(),
        }
    }

    fn default_configurator() -> ManifestConfigurator {
        ManifestConfigurator::new(Arc::new(idp::dummy::EverythingImported))
    }

    #[tokio::test]
    async fn static_config_reports_a_change_at_most_once() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_for(
            "rss-reader",
            dir.path().join("rss-reader.env"),
            &[("DB_PASSWORD", "s3cret")],
        );
        let configurator = default_configurator();

        assert!(configurator.static_config(&state).await.unwrap());
        assert!(!configurator.static_config(&state).await.unwrap());

        let contents = std::fs::read_to_string(&state.env_file).unwrap();
        assert_eq!(contents, "DB_PASSWORD=s3cret\n");
    }

    #[tokio::test]
    async fn static_config_preserves_foreign_keys() {
        let dir = tempfile::tempdir().unwrap();
        let env_file = dir.path().join("rss-reader.env");
        std::fs::write(&env_file, "USER_TWEAK=keep\n").unwrap();

        let state = state_for("rss-reader", env_file.clone(), &[("DB_PASSWORD", "x")]);
        let configurator = default_configurator();
        assert!(configurator.static_config(&state).await.unwrap());

        let contents = std::fs::read_to_string(&env_file).unwrap();
        assert_eq!(contents, "USER_TWEAK=keep\nDB_PASSWORD=x\n");
    }

    #[tokio::test]
    async fn static_config_without_managed_keys_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_for("client-a", dir.path().join("client-a.env"), &[]);
        let configurator = default_configurator();

        assert!(!configurator.static_config(&state).await.unwrap());
        assert!(!state.env_file.exists());
    }

    #[tokio::test]
    async fn static_config_drops_owned_keys_whose_source_vanished() {
        let dir = tempfile::tempdir().unwrap();
        let env_file = dir.path().join("app-x.env");
        // app-x owns the OIDC keys through its manifest, but nothing is
        // desired anymore (the SSO provider is gone)
        std::fs::write(&env_file, "OIDC_CLIENT_ID=stale\nUSER_TWEAK=keep\n").unwrap();

        let state = state_for("app-x", env_file.clone(), &[]);
        let configurator = default_configurator();

        assert!(configurator.static_config(&state).await.unwrap());
        assert_eq!(
            std::fs::read_to_string(&env_file).unwrap(),
            "USER_TWEAK=keep\n"
        );
        assert!(!configurator.static_config(&state).await.unwrap());
    }

    #[tokio::test]
    async fn health_check_passes_for_apps_without_an_endpoint() {
        let dir = tempfile::tempdir().unwrap();
        // db-engine declares no port and no health check
        let state = state_for("db-engine", dir.path().join("db-engine.env"), &[]);
        default_configurator().health_check(&state).await.unwrap();
    }

    #[tokio::test]
    async fn health_check_times_out_against_a_dead_port() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = state_for("rss-reader", dir.path().join("rss-reader.env"), &[]);
        // nothing listens on the fixture port; shrink the budget
        if let Some(spec) = state.manifest.health_check.as_mut() {
            spec.timeout_secs = 1;
            spec.interval_secs = 1;
        }

        let result = default_configurator().health_check(&state).await;
        assert!(matches!(
            result,
            Err(ConfiguratorError::HealthCheckTimeout { timeout_secs: 1, .. })
        ));
    }

    #[tokio::test]
    async fn dynamic_config_waits_for_blueprint_import() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = state_for("app-x", dir.path().join("app-x.env"), &[]);
        state.bindings = vec![Binding::new(app("app-x"), "sso", app("auth-provider"))];

        let idp = Arc::new(DummyIdentityProvider::with_imported(Vec::<String>::new()));
        let configurator = ManifestConfigurator::new(idp.clone());

        assert!(matches!(
            configurator.dynamic_config(&state).await,
            Err(ConfiguratorError::DynamicConfig { .. })
        ));

        idp.import("bloud-app-x");
        configurator.dynamic_config(&state).await.unwrap();
    }

    #[tokio::test]
    async fn dynamic_config_ignores_apps_without_sso_binding() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_for("app-x", dir.path().join("app-x.env"), &[]);
        let idp = Arc::new(DummyIdentityProvider::with_imported(Vec::<String>::new()));

        ManifestConfigurator::new(idp)
            .dynamic_config(&state)
            .await
            .unwrap();
    }

    #[test]
    fn topological_levels_put_providers_first() {
        let apps = BTreeSet::from([app("rss-reader"), app("db-engine"), app("app-x")]);
        let bindings = vec![
            Binding::new(app("rss-reader"), "database", app("db-engine")),
            Binding::new(app("app-x"), "database", app("db-engine")),
        ];

        let levels = topological_levels(&apps, &bindings).unwrap();
        assert_eq!(
            levels,
            vec![
                vec![app("db-engine")],
                vec![app("app-x"), app("rss-reader")],
            ]
        );
    }

    #[test]
    fn topological_levels_ignore_edges_outside_the_subset() {
        let apps = BTreeSet::from([app("rss-reader")]);
        let bindings = vec![Binding::new(app("rss-reader"), "database", app("db-engine"))];

        let levels = topological_levels(&apps, &bindings).unwrap();
        assert_eq!(levels, vec![vec![app("rss-reader")]]);
    }

    #[test]
    fn binding_cycles_are_detected() {
        let apps = BTreeSet::from([app("a"), app("b")]);
        let bindings = vec![
            Binding::new(app("a"), "x", app("b")),
            Binding::new(app("b"), "y", app("a")),
        ];

        assert!(matches!(
            topological_levels(&apps, &bindings),
            Err(ConfiguratorError::DependencyCycle { .. })
        ));
    }

    #[tokio::test]
    async fn registry_falls_back_to_the_default() {
        let registry = ConfiguratorRegistry::new(Arc::new(idp::dummy::EverythingImported));
        let dir = tempfile::tempdir().unwrap();
        let state = state_for("client-a", dir.path().join("client-a.env"), &[]);

        // the default configurator is returned and behaves as a no-op here
        let configurator = registry.get(&app("client-a"));
        assert!(!configurator.static_config(&state).await.unwrap());
    }
}
