use crate::models::AppName;
use serde::Deserialize;
use std::collections::BTreeMap;

/// Declarative metadata of an app, loaded from `manifest.toml` in the app's
/// catalog directory. Immutable at runtime.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct AppManifest {
    pub name: AppName,
    pub display_name: String,
    pub category: String,
    #[serde(default)]
    pub version: Option<String>,
    /// Loopback TCP port of the app's HTTP interface, if it has one.
    #[serde(default)]
    pub port: Option<u16>,
    /// Internal apps are hidden from the user-facing install list.
    #[serde(default)]
    pub is_system: bool,
    #[serde(default)]
    pub sso: SsoSpec,
    #[serde(default)]
    pub health_check: Option<HealthCheckSpec>,
    #[serde(default)]
    pub web: WebSpec,
    #[serde(default)]
    pub env_file: EnvFileSpec,
    #[serde(default)]
    pub provides: BTreeMap<String, ProvidedIntegration>,
    #[serde(default)]
    pub consumes: BTreeMap<String, ConsumedIntegration>,
}

impl AppManifest {
    /// An app gets a reverse-proxy route when it listens on a port and has
    /// not opted out of exposure.
    pub fn has_web_ui(&self) -> bool {
        self.port.is_some() && self.web.expose
    }

    pub fn consumed(&self, integration: &str) -> Option<&ConsumedIntegration> {
        self.consumes.get(integration)
    }
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SsoStrategy {
    #[default]
    None,
    ForwardAuth,
    NativeOidc,
    Ldap,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct SsoSpec {
    #[serde(default)]
    pub strategy: SsoStrategy,
    /// Env variable names the app reads its OIDC material from. Only
    /// meaningful for `native-oidc`.
    #[serde(default)]
    pub client_id_env: Option<String>,
    #[serde(default)]
    pub client_secret_env: Option<String>,
    #[serde(default)]
    pub issuer_env: Option<String>,
    #[serde(default)]
    pub redirect_env: Option<String>,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct HealthCheckSpec {
    pub path: String,
    #[serde(default = "HealthCheckSpec::default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "HealthCheckSpec::default_timeout_secs")]
    pub timeout_secs: u64,
}

impl HealthCheckSpec {
    fn default_interval_secs() -> u64 {
        2
    }

    fn default_timeout_secs() -> u64 {
        60
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct WebSpec {
    #[serde(default = "WebSpec::default_true")]
    pub expose: bool,
    /// When false, the proxy forwards the full `/embed/<app>` path to the
    /// app instead of stripping it.
    #[serde(default = "WebSpec::default_true")]
    pub strip_prefix: bool,
}

impl WebSpec {
    fn default_true() -> bool {
        true
    }
}

impl Default for WebSpec {
    fn default() -> Self {
        Self {
            expose: true,
            strip_prefix: true,
        }
    }
}

/// Env variable names for generated secrets. A secret is only rendered when
/// the app declares the corresponding key name.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct EnvFileSpec {
    #[serde(default)]
    pub db_password_env: Option<String>,
    #[serde(default)]
    pub admin_password_env: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ProvidedIntegration {
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ConsumedIntegration {
    #[serde(default)]
    pub required: bool,
    /// Whether the consumer can bind more than one source at once.
    #[serde(default)]
    pub multi: bool,
    #[serde(default)]
    pub compatible: Vec<CompatibleSource>,
}

impl ConsumedIntegration {
    pub fn default_source(&self) -> Option<&AppName> {
        self.compatible
            .iter()
            .find(|source| source.default)
            .map(|source| &source.app)
    }

    pub fn is_compatible(&self, app: &AppName) -> bool {
        self.compatible.iter().any(|source| &source.app == app)
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct CompatibleSource {
    pub app: AppName,
    #[serde(default)]
    pub default: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_full_manifest() {
        let manifest = toml::from_str::<AppManifest>(
            r#"
            name = "rss-reader"
            display_name = "RSS Reader"
            category = "news"
            port = 8087

            [sso]
            strategy = "native-oidc"
            client_id_env = "OIDC_CLIENT_ID"
            client_secret_env = "OIDC_CLIENT_SECRET"
            issuer_env = "OIDC_ISSUER"
            redirect_env = "OIDC_REDIRECT_URL"

            [health_check]
            path = "/healthz"
            timeout_secs = 30

            [env_file]
            db_password_env = "DB_PASSWORD"

            [consumes.database]
            required = true
            compatible = [ { app = "db-engine", default = true } ]

            [consumes.sso]
            compatible = [ { app = "auth-provider" } ]
            "#,
        )
        .unwrap();

        assert_eq!(manifest.name.as_str(), "rss-reader");
        assert!(manifest.has_web_ui());
        assert_eq!(manifest.sso.strategy, SsoStrategy::NativeOidc);
        assert_eq!(manifest.health_check.as_ref().unwrap().timeout_secs, 30);
        assert_eq!(manifest.health_check.as_ref().unwrap().interval_secs, 2);

        let database = manifest.consumed("database").unwrap();
        assert!(database.required);
        assert!(!database.multi);
        assert_eq!(
            database.default_source().map(|app| app.as_str()),
            Some("db-engine")
        );

        let sso = manifest.consumed("sso").unwrap();
        assert!(!sso.required);
        assert_eq!(sso.default_source(), None);
    }

    #[test]
    fn rejects_unknown_fields() {
        let result = toml::from_str::<AppManifest>(
            r#"
            name = "x"
            display_name = "X"
            category = "misc"
            unexpected = true
            "#,
        );

        assert!(result.is_err());
    }

    #[test]
    fn app_without_port_has_no_web_ui() {
        let manifest = toml::from_str::<AppManifest>(
            r#"
            name = "db-engine"
            display_name = "Database Engine"
            category = "infrastructure"
            is_system = true

            [provides.database]
            description = "PostgreSQL-compatible database"
            "#,
        )
        .unwrap();

        assert!(!manifest.has_web_ui());
        assert!(manifest.is_system);
        assert!(manifest.provides.contains_key("database"));
    }
}
