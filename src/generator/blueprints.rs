use crate::generator::{GeneratorContext, HostSecret};
use crate::models::{AppManifest, SsoStrategy};
use serde::Serialize;
use std::collections::BTreeMap;

const AUTHORIZATION_FLOW: &str = "default-provider-authorization-implicit-consent";
const INVALIDATION_FLOW: &str = "default-provider-invalidation-flow";

/// Declarative identity-provider resources for one app. The provider watches
/// its blueprint directory and applies these on change.
pub(super) fn blueprint(
    manifest: &AppManifest,
    secret: &HostSecret,
    ctx: &GeneratorContext,
) -> Option<Blueprint> {
    let app = &manifest.name;
    let provider_name = format!("bloud-{app}");

    let entries = match manifest.sso.strategy {
        SsoStrategy::None | SsoStrategy::Ldap => return None,
        SsoStrategy::ForwardAuth => vec![
            Entry {
                model: String::from("authentik_providers_proxy.proxyprovider"),
                identifiers: BTreeMap::from([(String::from("name"), provider_name.clone())]),
                attrs: BTreeMap::from([
                    // The OAuth callback is mounted at the site root, so the
                    // external host is the root URL, not the app path.
                    (
                        String::from("external_host"),
                        attr(ctx.base_url.as_str().trim_end_matches('/')),
                    ),
                    (String::from("mode"), attr("forward_single")),
                    (String::from("authorization_flow"), attr(AUTHORIZATION_FLOW)),
                    (String::from("invalidation_flow"), attr(INVALIDATION_FLOW)),
                ]),
            },
            application_entry(manifest, &provider_name),
        ],
        SsoStrategy::NativeOidc => vec![
            Entry {
                model: String::from("authentik_providers_oauth2.oauth2provider"),
                identifiers: BTreeMap::from([(String::from("name"), provider_name.clone())]),
                attrs: BTreeMap::from([
                    (String::from("client_type"), attr("confidential")),
                    (String::from("client_id"), attr(secret.oauth_client_id(app))),
                    (
                        String::from("client_secret"),
                        attr(secret.oauth_client_secret(app)),
                    ),
                    (
                        String::from("redirect_uris"),
                        attr(format!(
                            "{}/embed/{app}/oauth/callback",
                            ctx.base_url.as_str().trim_end_matches('/')
                        )),
                    ),
                    (String::from("authorization_flow"), attr(AUTHORIZATION_FLOW)),
                    (String::from("invalidation_flow"), attr(INVALIDATION_FLOW)),
                ]),
            },
            application_entry(manifest, &provider_name),
        ],
    };

    Some(Blueprint {
        version: 1,
        metadata: Metadata {
            name: provider_name,
        },
        entries,
    })
}

fn application_entry(manifest: &AppManifest, provider_name: &str) -> Entry {
    Entry {
        model: String::from("authentik_core.application"),
        identifiers: BTreeMap::from([(String::from("slug"), provider_name.to_string())]),
        attrs: BTreeMap::from([
            (String::from("name"), attr(manifest.display_name.clone())),
            (String::from("provider"), attr(provider_name)),
        ]),
    }
}

fn attr(value: impl Into<String>) -> String {
    value.into()
}

#[derive(Debug, Serialize)]
pub(super) struct Blueprint {
    version: u32,
    metadata: Metadata,
    entries: Vec<Entry>,
}

#[derive(Debug, Serialize)]
struct Metadata {
    name: String,
}

#[derive(Debug, Serialize)]
struct Entry {
    model: String,
    identifiers: BTreeMap<String, String>,
    attrs: BTreeMap<String, String>,
}
