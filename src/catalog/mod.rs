use crate::models::{AppManifest, AppName};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

/// In-memory collection of every app manifest on this host. Loaded once at
/// startup; a malformed manifest fails the whole load because the platform
/// cannot reason about metadata it does not understand.
#[derive(Clone, Debug, Default)]
pub struct Catalog {
    apps: BTreeMap<AppName, AppManifest>,
}

impl Catalog {
    pub fn load(apps_dir: &Path) -> Result<Self, CatalogError> {
        let mut apps = BTreeMap::new();

        let entries = std::fs::read_dir(apps_dir).map_err(|err| CatalogError::Io {
            path: apps_dir.to_path_buf(),
            err: err.to_string(),
        })?;

        for entry in entries {
            let entry = entry.map_err(|err| CatalogError::Io {
                path: apps_dir.to_path_buf(),
                err: err.to_string(),
            })?;
            if !entry.path().is_dir() {
                continue;
            }

            let manifest_path = entry.path().join("manifest.toml");
            let contents =
                std::fs::read_to_string(&manifest_path).map_err(|err| CatalogError::Io {
                    path: manifest_path.clone(),
                    err: err.to_string(),
                })?;

            let manifest =
                toml::from_str::<AppManifest>(&contents).map_err(|err| CatalogError::Parse {
                    path: manifest_path.clone(),
                    err: err.to_string(),
                })?;

            let dir_name = entry.file_name().to_string_lossy().to_string();
            if manifest.name.as_str() != dir_name {
                return Err(CatalogError::NameMismatch {
                    dir: dir_name,
                    name: manifest.name.to_string(),
                });
            }

            apps.insert(manifest.name.clone(), manifest);
        }

        log::info!("Loaded {} app manifests from {}", apps.len(), apps_dir.display());
        Ok(Self { apps })
    }

    pub fn from_manifests<I>(manifests: I) -> Self
    where
        I: IntoIterator<Item = AppManifest>,
    {
        Self {
            apps: manifests
                .into_iter()
                .map(|manifest| (manifest.name.clone(), manifest))
                .collect(),
        }
    }

    pub fn get(&self, name: &AppName) -> Option<&AppManifest> {
        self.apps.get(name)
    }

    pub fn list(&self) -> impl Iterator<Item = &AppManifest> {
        self.apps.values()
    }

    /// Apps a user may install directly. System apps are wiring details that
    /// only enter the system as dependencies.
    pub fn list_installable(&self) -> Vec<&AppManifest> {
        self.apps.values().filter(|app| !app.is_system).collect()
    }

    pub fn provides(&self, app: &AppName) -> BTreeSet<&str> {
        self.apps
            .get(app)
            .map(|manifest| manifest.provides.keys().map(String::as_str).collect())
            .unwrap_or_default()
    }

    /// Apps whose manifests declare that they consume the given integration.
    pub fn consumers(&self, integration: &str) -> Vec<&AppManifest> {
        self.apps
            .values()
            .filter(|manifest| manifest.consumes.contains_key(integration))
            .collect()
    }

    pub fn contains(&self, name: &AppName) -> bool {
        self.apps.contains_key(name)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("Cannot read {path}: {err}")]
    Io { path: PathBuf, err: String },
    #[error("Malformed manifest {path}: {err}")]
    Parse { path: PathBuf, err: String },
    #[error("Manifest in directory {dir:?} declares name {name:?}")]
    NameMismatch { dir: String, name: String },
}
