use crate::generator::GeneratorContext;
use crate::models::{AppManifest, SsoStrategy};
use serde::Serialize;
use serde_value::Value;
use std::collections::BTreeMap;

/// Builds the reverse proxy's dynamic configuration: one router per exposed
/// app under `/embed/<app>`, targeting the app's loopback port. Map keys are
/// ordered so the emitted document is byte-stable.
pub(super) fn routes_document(
    apps: &[&AppManifest],
    ctx: &GeneratorContext,
) -> RoutesDocument {
    let mut routers = BTreeMap::new();
    let mut middlewares = BTreeMap::new();
    let mut services = BTreeMap::new();

    for manifest in apps {
        let Some(port) = manifest.port.filter(|_| manifest.has_web_ui()) else {
            continue;
        };
        let app = &manifest.name;

        let mut router_middlewares = Vec::new();

        if manifest.sso.strategy == SsoStrategy::ForwardAuth {
            // The forward-auth address bypasses the proxy and talks to the
            // outpost port directly: the outpost must see the original
            // X-Forwarded-* headers to redirect back to the right place.
            middlewares.insert(
                format!("{app}-auth"),
                map([(
                    "forwardAuth",
                    map([
                        (
                            "address",
                            string(format!(
                                "http://127.0.0.1:{}/outpost.goauthentik.io/auth/traefik",
                                ctx.outpost_port
                            )),
                        ),
                        ("trustForwardHeader", Value::Bool(true)),
                        (
                            "authResponseHeaders",
                            Value::Seq(vec![
                                string("X-authentik-username"),
                                string("X-authentik-uid"),
                                string("X-authentik-email"),
                            ]),
                        ),
                    ]),
                )]),
            );
            router_middlewares.push(format!("{app}-auth"));
        }

        if manifest.web.strip_prefix {
            middlewares.insert(
                format!("{app}-strip"),
                map([(
                    "stripPrefix",
                    map([("prefixes", Value::Seq(vec![string(format!("/embed/{app}"))]))]),
                )]),
            );
            router_middlewares.push(format!("{app}-strip"));
        }

        middlewares.insert(
            format!("{app}-headers"),
            map([(
                "headers",
                map([(
                    "customResponseHeaders",
                    map([
                        ("X-Frame-Options", string("SAMEORIGIN")),
                        ("Content-Security-Policy", string("frame-ancestors 'self'")),
                    ]),
                )]),
            )]),
        );
        router_middlewares.push(format!("{app}-headers"));

        routers.insert(
            app.to_string(),
            Router {
                rule: format!("PathPrefix(`/embed/{app}`)"),
                service: app.to_string(),
                middlewares: router_middlewares,
            },
        );

        services.insert(
            app.to_string(),
            Service {
                load_balancer: LoadBalancer {
                    servers: vec![Server {
                        url: format!("http://127.0.0.1:{port}"),
                    }],
                },
            },
        );
    }

    RoutesDocument {
        http: HttpConfig {
            routers,
            middlewares,
            services,
        },
    }
}

fn map<const N: usize>(entries: [(&str, Value); N]) -> Value {
    Value::Map(
        entries
            .into_iter()
            .map(|(key, value)| (Value::String(key.to_string()), value))
            .collect(),
    )
}

fn string(s: impl Into<String>) -> Value {
    Value::String(s.into())
}

#[derive(Debug, Serialize)]
pub(super) struct RoutesDocument {
    http: HttpConfig,
}

#[derive(Debug, Serialize)]
struct HttpConfig {
    routers: BTreeMap<String, Router>,
    middlewares: BTreeMap<String, Value>,
    services: BTreeMap<String, Service>,
}

#[derive(Debug, Serialize)]
struct Router {
    rule: String,
    service: String,
    middlewares: Vec<String>,
}

#[derive(Debug, Serialize)]
struct Service {
    #[serde(rename = "loadBalancer")]
    load_balancer: LoadBalancer,
}

#[derive(Debug, Serialize)]
struct LoadBalancer {
    servers: Vec<Server>,
}

#[derive(Debug, Serialize)]
struct Server {
    url: String,
}
