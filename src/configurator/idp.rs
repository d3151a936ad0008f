use async_trait::async_trait;
use url::Url;

/// Read-only client for the identity provider's management API. Blueprints
/// carry all writes; this client only reads back what the provider imported.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Whether a provider object with the given name has been imported.
    async fn provider_exists(&self, name: &str) -> anyhow::Result<bool>;
}

pub struct IdpClient {
    base_url: Url,
    http: reqwest::Client,
}

impl IdpClient {
    pub fn new(base_url: Url) -> Self {
        Self {
            base_url,
            http: reqwest::Client::new(),
        }
    }
}

#[derive(serde::Deserialize)]
struct ProviderList {
    results: Vec<ProviderEntry>,
}

#[derive(serde::Deserialize)]
struct ProviderEntry {
    name: String,
}

#[async_trait]
impl IdentityProvider for IdpClient {
    async fn provider_exists(&self, name: &str) -> anyhow::Result<bool> {
        let mut url = self.base_url.join("/api/v3/providers/all/")?;
        url.query_pairs_mut().append_pair("name", name);

        let response = self.http.get(url).send().await?;
        if !response.status().is_success() {
            anyhow::bail!(
                "identity provider API returned {} for provider lookup",
                response.status()
            );
        }

        let list = response.json::<ProviderList>().await?;
        Ok(list.results.iter().any(|entry| entry.name == name))
    }
}

#[cfg(test)]
pub mod dummy {
    use super::*;
    use std::sync::Mutex;

    /// Pretends the identity provider has imported a fixed set of
    /// blueprints.
    #[derive(Default)]
    pub struct DummyIdentityProvider {
        imported: Mutex<Vec<String>>,
    }

    impl DummyIdentityProvider {
        pub fn with_imported<I, S>(names: I) -> Self
        where
            I: IntoIterator<Item = S>,
            S: Into<String>,
        {
            Self {
                imported: Mutex::new(names.into_iter().map(Into::into).collect()),
            }
        }

        pub fn import(&self, name: impl Into<String>) {
            if let Ok(mut imported) = self.imported.lock() {
                imported.push(name.into());
            }
        }
    }

    #[async_trait]
    impl IdentityProvider for DummyIdentityProvider {
        async fn provider_exists(&self, name: &str) -> anyhow::Result<bool> {
            Ok(self
                .imported
                .lock()
                .map_err(|_| anyhow::anyhow!("import list poisoned"))?
                .iter()
                .any(|imported| imported == name))
        }
    }

    /// Every blueprint counts as imported; the common case for tests that
    /// are not about the identity provider.
    pub struct EverythingImported;

    #[async_trait]
    impl IdentityProvider for EverythingImported {
        async fn provider_exists(&self, _name: &str) -> anyhow::Result<bool> {
            Ok(true)
        }
    }
}
