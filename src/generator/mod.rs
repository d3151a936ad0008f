mod blueprints;
mod routes;
mod secrets;

pub use secrets::HostSecret;

use crate::catalog::Catalog;
use crate::config::Config;
use crate::models::{AppName, Binding, InstalledApp, SsoStrategy};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use url::Url;

/// Host-level inputs of artifact generation that never change during a run.
#[derive(Clone, Debug)]
pub struct GeneratorContext {
    pub base_url: Url,
    pub outpost_port: u16,
}

impl From<&Config> for GeneratorContext {
    fn from(config: &Config) -> Self {
        Self {
            base_url: config.base_url.clone(),
            outpost_port: config.outpost_port,
        }
    }
}

/// Everything a rebuild consumes, as bytes. A pure function of the installed
/// set, the bindings, the catalog, and the host secret: identical inputs
/// yield identical bytes.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Artifacts {
    pub apps_nix: String,
    pub routes_yaml: String,
    pub blueprints: BTreeMap<AppName, String>,
    /// Desired env-file content per app. Applied to disk through the
    /// managed-key reconciler, never written wholesale; see the
    /// configurator module.
    pub envs: BTreeMap<AppName, String>,
}

pub fn generate(
    catalog: &Catalog,
    installed: &[InstalledApp],
    bindings: &[Binding],
    host_secret: &HostSecret,
    ctx: &GeneratorContext,
) -> Result<Artifacts, GeneratorError> {
    let mut manifests = Vec::with_capacity(installed.len());
    for app in installed {
        let manifest = catalog
            .get(&app.name)
            .ok_or_else(|| GeneratorError::UnknownApp {
                app: app.name.clone(),
            })?;
        manifests.push(manifest);
    }
    manifests.sort_by(|a, b| a.name.cmp(&b.name));

    let apps_nix = render_apps_nix(&manifests);

    let routes_yaml = serde_yaml::to_string(&routes::routes_document(&manifests, ctx))
        .map_err(|err| GeneratorError::Render {
            artifact: String::from("apps-routes.yml"),
            err: err.to_string(),
        })?;

    let mut blueprint_docs = BTreeMap::new();
    for manifest in &manifests {
        if let Some(blueprint) = blueprints::blueprint(manifest, host_secret, ctx) {
            let rendered =
                serde_yaml::to_string(&blueprint).map_err(|err| GeneratorError::Render {
                    artifact: format!("blueprints/{}.yaml", manifest.name),
                    err: err.to_string(),
                })?;
            blueprint_docs.insert(manifest.name.clone(), rendered);
        }
    }

    let mut envs = BTreeMap::new();
    for manifest in &manifests {
        let env = managed_env(catalog, &manifest.name, bindings, host_secret, ctx)?;
        if !env.is_empty() {
            envs.insert(manifest.name.clone(), render_env(&env));
        }
    }

    Ok(Artifacts {
        apps_nix,
        routes_yaml,
        blueprints: blueprint_docs,
        envs,
    })
}

fn render_apps_nix(manifests: &[&crate::models::AppManifest]) -> String {
    let mut out = String::from("# Generated by bloud. Do not edit.\n{\n");
    for manifest in manifests {
        out.push_str(&format!("  bloud.apps.{}.enable = true;\n", manifest.name));
    }
    out.push_str("}\n");
    out
}

/// The env keys the platform manages for one app: derived secrets the
/// manifest declares names for, OIDC material when an SSO binding exists,
/// and connection variables for every bound integration. This is both the
/// generator's env rendering and the managed-key set of the app's static
/// configuration.
pub fn managed_env(
    catalog: &Catalog,
    app: &AppName,
    bindings: &[Binding],
    host_secret: &HostSecret,
    ctx: &GeneratorContext,
) -> Result<BTreeMap<String, String>, GeneratorError> {
    let manifest = catalog
        .get(app)
        .ok_or_else(|| GeneratorError::UnknownApp { app: app.clone() })?;

    let mut env = BTreeMap::new();

    if let Some(key) = &manifest.env_file.db_password_env {
        env.insert(key.clone(), host_secret.db_password(app));
    }
    if let Some(key) = &manifest.env_file.admin_password_env {
        env.insert(key.clone(), host_secret.admin_password(app));
    }

    let app_bindings = bindings
        .iter()
        .filter(|binding| &binding.consumer_app == app)
        .collect::<Vec<_>>();

    if manifest.sso.strategy == SsoStrategy::NativeOidc
        && app_bindings
            .iter()
            .any(|binding| binding.integration == "sso")
    {
        let base = ctx.base_url.as_str().trim_end_matches('/');
        if let Some(key) = &manifest.sso.client_id_env {
            env.insert(key.clone(), host_secret.oauth_client_id(app));
        }
        if let Some(key) = &manifest.sso.client_secret_env {
            env.insert(key.clone(), host_secret.oauth_client_secret(app));
        }
        if let Some(key) = &manifest.sso.issuer_env {
            env.insert(key.clone(), format!("{base}/application/o/bloud-{app}/"));
        }
        if let Some(key) = &manifest.sso.redirect_env {
            env.insert(key.clone(), format!("{base}/embed/{app}/oauth/callback"));
        }
    }

    // Connection variables per consumed integration. Multi-source consumers
    // get a single URLS value with sources sorted by name so the rendering
    // stays deterministic as providers come and go.
    let mut by_integration: BTreeMap<&str, Vec<&Binding>> = BTreeMap::new();
    for binding in &app_bindings {
        by_integration
            .entry(binding.integration.as_str())
            .or_default()
            .push(*binding);
    }

    for (integration, mut edges) in by_integration {
        edges.sort_by(|a, b| a.source_app.cmp(&b.source_app));
        let multi = manifest
            .consumed(integration)
            .map(|consumed| consumed.multi)
            .unwrap_or(false);
        let prefix = integration.to_uppercase().replace('-', "_");

        if multi {
            let urls = edges
                .iter()
                .filter_map(|binding| {
                    catalog
                        .get(&binding.source_app)
                        .and_then(|source| source.port)
                        .map(|port| format!("http://127.0.0.1:{port}"))
                })
                .collect::<Vec<_>>();
            if !urls.is_empty() {
                env.insert(format!("{prefix}_URLS"), urls.join(","));
            }
        } else if let Some(binding) = edges.first() {
            if let Some(port) = catalog
                .get(&binding.source_app)
                .and_then(|source| source.port)
            {
                env.insert(format!("{prefix}_HOST"), String::from("127.0.0.1"));
                env.insert(format!("{prefix}_PORT"), port.to_string());
            }
        }
    }

    Ok(env)
}

/// The full universe of env keys the platform may ever write for an app,
/// independent of what is currently desired. The static-config reconciler
/// uses this to remove keys whose source disappeared (a dropped binding
/// must not leave stale credentials behind).
pub fn owned_env_keys(manifest: &crate::models::AppManifest) -> BTreeSet<String> {
    let mut keys = BTreeSet::new();

    for key in [
        &manifest.env_file.db_password_env,
        &manifest.env_file.admin_password_env,
        &manifest.sso.client_id_env,
        &manifest.sso.client_secret_env,
        &manifest.sso.issuer_env,
        &manifest.sso.redirect_env,
    ]
    .into_iter()
    .flatten()
    {
        keys.insert(key.clone());
    }

    for integration in manifest.consumes.keys() {
        let prefix = integration.to_uppercase().replace('-', "_");
        keys.insert(format!("{prefix}_HOST"));
        keys.insert(format!("{prefix}_PORT"));
        keys.insert(format!("{prefix}_URLS"));
    }

    keys
}

fn render_env(env: &BTreeMap<String, String>) -> String {
    let mut out = String::new();
    for (key, value) in env {
        out.push_str(&format!("{key}={value}\n"));
    }
    out
}

/// Where the whole-file artifacts land on disk.
#[derive(Clone, Debug)]
pub struct ArtifactPaths {
    pub apps_nix: PathBuf,
    pub routes: PathBuf,
    pub blueprints_dir: PathBuf,
}

impl From<&Config> for ArtifactPaths {
    fn from(config: &Config) -> Self {
        Self {
            apps_nix: config.apps_nix_file(),
            routes: config.routes_file(),
            blueprints_dir: config.blueprints_dir(),
        }
    }
}

/// Writes `apps.nix`, the routes file, and the blueprints to disk, pruning
/// blueprints of apps that are gone. Each file is written to a temp path and
/// renamed so the rebuild tool never observes a half-written file. Returns
/// whether anything on disk changed.
pub fn write_artifacts(
    artifacts: &Artifacts,
    paths: &ArtifactPaths,
) -> Result<bool, GeneratorError> {
    let mut changed = false;

    changed |= write_if_differs(&paths.apps_nix, &artifacts.apps_nix)?;
    changed |= write_if_differs(&paths.routes, &artifacts.routes_yaml)?;

    std::fs::create_dir_all(&paths.blueprints_dir).map_err(|err| GeneratorError::Io {
        path: paths.blueprints_dir.clone(),
        err: err.to_string(),
    })?;
    for (app, content) in &artifacts.blueprints {
        changed |= write_if_differs(&paths.blueprints_dir.join(format!("{app}.yaml")), content)?;
    }

    let expected = artifacts
        .blueprints
        .keys()
        .map(|app| format!("{app}.yaml"))
        .collect::<BTreeSet<_>>();
    let entries = std::fs::read_dir(&paths.blueprints_dir).map_err(|err| GeneratorError::Io {
        path: paths.blueprints_dir.clone(),
        err: err.to_string(),
    })?;
    for entry in entries.flatten() {
        let file_name = entry.file_name().to_string_lossy().to_string();
        if file_name.ends_with(".yaml") && !expected.contains(&file_name) {
            std::fs::remove_file(entry.path()).map_err(|err| GeneratorError::Io {
                path: entry.path(),
                err: err.to_string(),
            })?;
            changed = true;
        }
    }

    Ok(changed)
}

fn write_if_differs(path: &Path, content: &str) -> Result<bool, GeneratorError> {
    let io_err = |err: std::io::Error| GeneratorError::Io {
        path: path.to_path_buf(),
        err: err.to_string(),
    };

    if let Ok(current) = std::fs::read_to_string(path) {
        if current == content {
            return Ok(false);
        }
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(io_err)?;
    }
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, content).map_err(io_err)?;
    std::fs::rename(&tmp, path).map_err(io_err)?;
    Ok(true)
}

#[derive(Debug, thiserror::Error)]
pub enum GeneratorError {
    #[error("Installed app {app} has no catalog entry")]
    UnknownApp { app: AppName },
    #[error("Cannot render {artifact}: {err}")]
    Render { artifact: String, err: String },
    #[error("Cannot write {path}: {err}")]
    Io { path: PathBuf, err: String },
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

    fn installed(catalog: &Catalog, names: &[&str]) -> Vec<InstalledApp> {
        let now = Utc::now();
        names
            .iter()
            .map(|name| {
                let manifest = catalog.get(&app(name)).unwrap();
                InstalledApp {
                    name: manifest.name.clone(),
                    display_name: manifest.display_name.clone(),
                    version: None,
                    status: AppStatus::Running,
                    port: manifest.port,
                    is_system: manifest.is_system,
                    installed_at: now,
                    updated_at: now,
                }
            })
            .collect()
    }

    fn ctx() -> GeneratorContext {
        GeneratorContext {
            base_url: Url::parse("https://cloud.example.net").unwrap(),
            outpost_port: 9000,
        }
    }

    #[test]
    fn generation_is_deterministic_byte_for_byte() {
        let catalog = sample_catalog();
        let apps = installed(&catalog, &["rss-reader", "db-engine", "app-x", "auth-provider"]);
        let bindings = vec![
            Binding::new(app("rss-reader"), "database", app("db-engine")),
            Binding::new(app("app-x"), "database", app("db-engine")),
            Binding::new(app("app-x"), "sso", app("auth-provider")),
        ];
        let secret = HostSecret::from_seed("seed");

        let first = generate(&catalog, &apps, &bindings, &secret, &ctx()).unwrap();

        let mut shuffled = apps.clone();
        shuffled.reverse();
        let mut shuffled_bindings = bindings.clone();
        shuffled_bindings.reverse();
        let second = generate(&catalog, &shuffled, &shuffled_bindings, &secret, &ctx()).unwrap();

        assert_eq!(first, second);
    }

    #[test]
    fn apps_nix_lists_installed_apps_alphabetically() {
        let catalog = sample_catalog();
        let apps = installed(&catalog, &["rss-reader", "db-engine"]);
        let artifacts =
            generate(&catalog, &apps, &[], &HostSecret::from_seed("seed"), &ctx()).unwrap();

        assert_eq!(
            artifacts.apps_nix,
            "# Generated by bloud. Do not edit.\n\
             {\n\
             \x20 bloud.apps.db-engine.enable = true;\n\
             \x20 bloud.apps.rss-reader.enable = true;\n\
             }\n"
        );
    }

    #[test]
    fn routes_cover_only_apps_with_a_web_ui() {
        let catalog = sample_catalog();
        let apps = installed(&catalog, &["rss-reader", "db-engine"]);
        let artifacts =
            generate(&catalog, &apps, &[], &HostSecret::from_seed("seed"), &ctx()).unwrap();

        assert!(artifacts.routes_yaml.contains("PathPrefix(`/embed/rss-reader`)"));
        assert!(artifacts.routes_yaml.contains("http://127.0.0.1:8087"));
        assert!(artifacts.routes_yaml.contains("rss-reader-strip"));
        assert!(artifacts.routes_yaml.contains("rss-reader-headers"));
        assert!(!artifacts.routes_yaml.contains("db-engine"));
    }

    #[test]
    fn native_oidc_env_is_rendered_when_bound() {
        let catalog = sample_catalog();
        let apps = installed(&catalog, &["app-x", "auth-provider", "db-engine"]);
        let secret = HostSecret::from_seed("seed");
        let bindings = vec![
            Binding::new(app("app-x"), "sso", app("auth-provider")),
            Binding::new(app("app-x"), "database", app("db-engine")),
        ];

        let artifacts = generate(&catalog, &apps, &bindings, &secret, &ctx()).unwrap();
        let env = artifacts.envs.get(&app("app-x")).unwrap();

        assert!(env.contains(&format!(
            "OIDC_CLIENT_ID={}",
            secret.oauth_client_id(&app("app-x"))
        )));
        assert!(env.contains(
            "OIDC_ISSUER=https://cloud.example.net/application/o/bloud-app-x/"
        ));
        assert!(env
            .contains("OIDC_REDIRECT_URL=https://cloud.example.net/embed/app-x/oauth/callback"));
    }

    #[test]
    fn oidc_env_is_absent_without_an_sso_binding() {
        let catalog = sample_catalog();
        let apps = installed(&catalog, &["app-x", "db-engine"]);
        let bindings = vec![Binding::new(app("app-x"), "database", app("db-engine"))];

        let artifacts =
            generate(&catalog, &apps, &bindings, &HostSecret::from_seed("seed"), &ctx()).unwrap();

        match artifacts.envs.get(&app("app-x")) {
            Some(env) => assert!(!env.contains("OIDC_CLIENT_ID")),
            None => {}
        }
    }

    #[test]
    fn blueprints_exist_only_for_sso_apps() {
        let catalog = sample_catalog();
        let apps = installed(&catalog, &["app-x", "rss-reader", "auth-provider"]);
        let bindings = vec![Binding::new(app("app-x"), "sso", app("auth-provider"))];
        let artifacts =
            generate(&catalog, &apps, &bindings, &HostSecret::from_seed("seed"), &ctx()).unwrap();

        assert!(artifacts.blueprints.contains_key(&app("app-x")));
        assert!(!artifacts.blueprints.contains_key(&app("rss-reader")));

        let blueprint = artifacts.blueprints.get(&app("app-x")).unwrap();
        assert!(blueprint.contains("authentik_providers_oauth2.oauth2provider"));
        assert!(blueprint.contains("bloud-app-x"));
    }

    #[test]
    fn multi_source_urls_are_sorted_by_source_name() {
        let catalog = sample_catalog();
        let apps = installed(&catalog, &["media-indexer", "client-a", "client-b"]);
        let secret = HostSecret::from_seed("seed");
        // insertion order deliberately reversed
        let bindings = vec![
            Binding::new(app("media-indexer"), "download-client", app("client-b")),
            Binding::new(app("media-indexer"), "download-client", app("client-a")),
        ];

        let env = managed_env(&catalog, &app("media-indexer"), &bindings, &secret, &ctx()).unwrap();
        assert_eq!(
            env.get("DOWNLOAD_CLIENT_URLS").unwrap(),
            "http://127.0.0.1:8100,http://127.0.0.1:8101"
        );
    }

    #[test]
    fn install_then_uninstall_restores_artifact_bytes() {
        let catalog = sample_catalog();
        let secret = HostSecret::from_seed("seed");
        let before = generate(
            &catalog,
            &installed(&catalog, &["db-engine"]),
            &[],
            &secret,
            &ctx(),
        )
        .unwrap();

        let during = generate(
            &catalog,
            &installed(&catalog, &["db-engine", "rss-reader"]),
            &[Binding::new(app("rss-reader"), "database", app("db-engine"))],
            &secret,
            &ctx(),
        )
        .unwrap();
        assert_ne!(before, during);

        let after = generate(
            &catalog,
            &installed(&catalog, &["db-engine"]),
            &[],
            &secret,
            &ctx(),
        )
        .unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn write_artifacts_is_idempotent_and_prunes_stale_blueprints() {
        let catalog = sample_catalog();
        let secret = HostSecret::from_seed("seed");
        let dir = tempfile::tempdir().unwrap();
        let paths = ArtifactPaths {
            apps_nix: dir.path().join("nix/apps.nix"),
            routes: dir.path().join("traefik/dynamic/apps-routes.yml"),
            blueprints_dir: dir.path().join("authentik/blueprints"),
        };

        let with_sso = generate(
            &catalog,
            &installed(&catalog, &["app-x", "auth-provider"]),
            &[Binding::new(app("app-x"), "sso", app("auth-provider"))],
            &secret,
            &ctx(),
        )
        .unwrap();

        assert!(write_artifacts(&with_sso, &paths).unwrap());
        assert!(!write_artifacts(&with_sso, &paths).unwrap(), "second write is a no-op");
        assert!(paths.blueprints_dir.join("app-x.yaml").exists());

        let without = generate(&catalog, &[], &[], &secret, &ctx()).unwrap();
        assert!(write_artifacts(&without, &paths).unwrap());
        assert!(!paths.blueprints_dir.join("app-x.yaml").exists());
    }

    #[test]
    fn installed_app_missing_from_catalog_fails_generation() {
        let catalog = sample_catalog();
        let now = Utc::now();
        let ghost = InstalledApp {
            name: app("ghost"),
            display_name: String::from("Ghost"),
            version: None,
            status: AppStatus::Running,
            port: None,
            is_system: false,
            installed_at: now,
            updated_at: now,
        };

        assert!(matches!(
            generate(&catalog, &[ghost], &[], &HostSecret::from_seed("seed"), &ctx()),
            Err(GeneratorError::UnknownApp { .. })
        ));
    }
}
