use crate::catalog::Catalog;
use crate::models::{
    AppName, Binding, Choice, ConsumedIntegration, InstallPlan, InstalledApp, PlannedBinding,
    RemovePlan,
};
use std::collections::{BTreeMap, BTreeSet};

/// Computes the transaction an install of `target` implies: transitively
/// required apps, the integration edges to create, open user choices, and
/// blockers. A plan with blockers or open choices is a successful result
/// with `can_install = false`.
pub fn plan_install(
    catalog: &Catalog,
    installed: &[InstalledApp],
    bindings: &[Binding],
    target: &AppName,
    user_choices: &BTreeMap<String, AppName>,
) -> Result<InstallPlan, PlannerError> {
    if catalog.get(target).is_none() {
        return Err(PlannerError::UnknownApp {
            app: target.clone(),
        });
    }

    let installed_names = installed
        .iter()
        .map(|app| app.name.clone())
        .collect::<BTreeSet<_>>();

    let mut resolution = Resolution {
        catalog,
        installed: &installed_names,
        target,
        user_choices,
        to_install: Vec::new(),
        in_progress: Vec::new(),
        blockers: Vec::new(),
        choices: Vec::new(),
        auto_config: BTreeMap::new(),
        bindings: Vec::new(),
    };
    resolution.visit(target);

    let Resolution {
        to_install,
        blockers,
        choices,
        auto_config,
        bindings: planned_bindings,
        ..
    } = resolution;

    if !blockers.is_empty() || !choices.is_empty() {
        return Ok(InstallPlan::blocked(target.clone(), blockers, choices));
    }

    let dependents = dependents_of(catalog, installed, bindings, &to_install);

    Ok(InstallPlan {
        target: target.clone(),
        can_install: true,
        blockers: Vec::new(),
        choices: Vec::new(),
        auto_config,
        to_install,
        bindings: planned_bindings,
        dependents,
    })
}

/// Plans the removal of `target`. Removal is blocked when an installed
/// consumer binds a required integration to the target and no other
/// installed app could serve it.
pub fn plan_remove(
    catalog: &Catalog,
    installed: &[InstalledApp],
    bindings: &[Binding],
    target: &AppName,
) -> Result<RemovePlan, PlannerError> {
    if catalog.get(target).is_none() {
        return Err(PlannerError::UnknownApp {
            app: target.clone(),
        });
    }
    if !installed.iter().any(|app| &app.name == target) {
        return Err(PlannerError::NotInstalled {
            app: target.clone(),
        });
    }

    let installed_names = installed
        .iter()
        .map(|app| app.name.clone())
        .collect::<BTreeSet<_>>();

    let mut blockers = Vec::new();
    let mut will_unconfigure = BTreeSet::new();

    for binding in bindings.iter().filter(|b| &b.source_app == target) {
        will_unconfigure.insert(binding.consumer_app.clone());

        let Some(consumer) = catalog.get(&binding.consumer_app) else {
            continue;
        };
        let Some(consumed) = consumer.consumed(&binding.integration) else {
            continue;
        };
        if !consumed.required {
            continue;
        }

        let alternative_exists = consumed
            .compatible
            .iter()
            .any(|source| &source.app != target && installed_names.contains(&source.app));
        if !alternative_exists {
            blockers.push(format!(
                "{} requires {} from {target} and no alternative source is installed",
                binding.consumer_app, binding.integration
            ));
        }
    }

    Ok(RemovePlan {
        target: target.clone(),
        can_remove: blockers.is_empty(),
        blockers,
        will_unconfigure: will_unconfigure.into_iter().collect(),
    })
}

struct Resolution<'a> {
    catalog: &'a Catalog,
    installed: &'a BTreeSet<AppName>,
    target: &'a AppName,
    user_choices: &'a BTreeMap<String, AppName>,
    /// Dependencies first; the requested target ends up last.
    to_install: Vec<AppName>,
    in_progress: Vec<AppName>,
    blockers: Vec<String>,
    choices: Vec<Choice>,
    auto_config: BTreeMap<String, AppName>,
    bindings: Vec<PlannedBinding>,
}

impl Resolution<'_> {
    fn visit(&mut self, app: &AppName) {
        if self.installed.contains(app) || self.to_install.contains(app) {
            return;
        }
        if self.in_progress.contains(app) {
            let cycle = self
                .in_progress
                .iter()
                .map(|name| name.as_str())
                .collect::<Vec<_>>()
                .join(" -> ");
            self.blockers
                .push(format!("dependency cycle: {cycle} -> {app}"));
            return;
        }

        let Some(manifest) = self.catalog.get(app) else {
            self.blockers.push(format!("unknown app {app}"));
            return;
        };

        self.in_progress.push(app.clone());
        for (integration, consumed) in &manifest.consumes {
            self.resolve_integration(app, integration, consumed);
        }
        self.in_progress.pop();

        self.to_install.push(app.clone());
    }

    fn resolve_integration(
        &mut self,
        consumer: &AppName,
        integration: &str,
        consumed: &ConsumedIntegration,
    ) {
        let available = consumed
            .compatible
            .iter()
            .map(|source| &source.app)
            .filter(|app| self.installed.contains(*app) || self.to_install.contains(*app))
            .cloned()
            .collect::<Vec<_>>();

        // User choices only apply to the requested target; transitive
        // dependencies resolve from defaults alone.
        let user_choice = if consumer == self.target {
            self.user_choices.get(integration)
        } else {
            None
        };

        if let Some(chosen) = user_choice {
            if !consumed.is_compatible(chosen) {
                self.blockers.push(format!(
                    "{chosen} is not a compatible source for {integration} of {consumer}"
                ));
                return;
            }
            self.visit(chosen);
            self.bind(consumer, integration, chosen.clone());
            return;
        }

        if consumed.multi && !available.is_empty() {
            for source in available {
                self.bind(consumer, integration, source);
            }
            return;
        }
        if !consumed.multi && available.len() == 1 {
            if let Some(source) = available.into_iter().next() {
                self.bind(consumer, integration, source);
            }
            return;
        }
        if !consumed.multi && available.len() > 1 {
            self.choices.push(Choice {
                integration: integration.to_string(),
                options: available,
            });
            return;
        }

        // Nothing suitable is installed or planned yet.
        if !consumed.required {
            return;
        }

        if let Some(default) = consumed.default_source().cloned() {
            self.visit(&default);
            self.bind(consumer, integration, default);
        } else if consumed.compatible.is_empty() {
            self.blockers.push(format!(
                "no compatible source exists for required integration {integration} of {consumer}"
            ));
        } else {
            self.choices.push(Choice {
                integration: integration.to_string(),
                options: consumed
                    .compatible
                    .iter()
                    .map(|source| source.app.clone())
                    .collect(),
            });
        }
    }

    fn bind(&mut self, consumer: &AppName, integration: &str, source: AppName) {
        if consumer == self.target {
            self.auto_config
                .insert(integration.to_string(), source.clone());
        }
        self.bindings.push(PlannedBinding {
            consumer: consumer.clone(),
            integration: integration.to_string(),
            source,
        });
    }
}

/// Integration edges that could exist but do not: unbound consumed
/// integrations with exactly one compatible installed source, and sources a
/// `multi` consumer has not picked up yet. Ambiguous single-source cases are
/// never bound here; they stay open until the user decides.
pub fn missing_bindings(
    catalog: &Catalog,
    installed: &BTreeSet<AppName>,
    bindings: &[Binding],
) -> Vec<PlannedBinding> {
    let mut missing = Vec::new();

    for name in installed {
        let Some(manifest) = catalog.get(name) else {
            continue;
        };

        for (integration, consumed) in &manifest.consumes {
            let existing = bindings
                .iter()
                .filter(|binding| {
                    &binding.consumer_app == name && &binding.integration == integration
                })
                .map(|binding| &binding.source_app)
                .collect::<BTreeSet<_>>();
            let candidates = consumed
                .compatible
                .iter()
                .map(|source| &source.app)
                .filter(|app| installed.contains(*app))
                .collect::<Vec<_>>();

            if consumed.multi {
                for candidate in candidates {
                    if !existing.contains(candidate) {
                        missing.push(PlannedBinding {
                            consumer: name.clone(),
                            integration: integration.clone(),
                            source: candidate.clone(),
                        });
                    }
                }
            } else if existing.is_empty() && candidates.len() == 1 {
                if let Some(candidate) = candidates.into_iter().next() {
                    missing.push(PlannedBinding {
                        consumer: name.clone(),
                        integration: integration.clone(),
                        source: candidate.clone(),
                    });
                }
            }
        }
    }

    missing
}

/// Installed apps whose integration set changes because the new apps provide
/// something they consume. Derived from [`missing_bindings`] against the
/// post-install app set.
fn dependents_of(
    catalog: &Catalog,
    installed: &[InstalledApp],
    bindings: &[Binding],
    to_install: &[AppName],
) -> Vec<AppName> {
    let installed_names = installed
        .iter()
        .map(|app| app.name.clone())
        .collect::<BTreeSet<_>>();
    let mut future = installed_names.clone();
    future.extend(to_install.iter().cloned());

    missing_bindings(catalog, &future, bindings)
        .into_iter()
        .filter(|binding| installed_names.contains(&binding.consumer))
        .map(|binding| binding.consumer)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

#[derive(Clone, Debug, thiserror::Error, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum PlannerError {
    #[error("Unknown app {app}")]
    UnknownApp { app: AppName },
    #[error("App {app} is not installed")]
    NotInstalled { app: AppName },
}
