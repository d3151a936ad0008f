mod operation;
mod queue;

pub use operation::{
    Batch, Operation, OperationError, OperationKind, OperationOutcome, OperationResult,
};
pub use queue::OperationQueue;

use crate::catalog::Catalog;
use crate::config::Config;
use crate::configurator::{
    assemble_state, topological_levels, unit_name, ConfiguratorRegistry, Supervisor,
};
use crate::generator::{self, ArtifactPaths, GeneratorContext, HostSecret};
use crate::models::{AppName, AppStatus, Binding, InstallPlan, InstalledApp, RemovePlan};
use crate::planner;
use crate::rebuild::{
    RebuildEvent, RebuildLogWriter, RebuildPhase, RebuildStatus, RebuildTool, RebuildTrigger,
};
use crate::store::Store;
use chrono::{TimeDelta, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};

/// The top-level state machine. A single worker owns every state change:
/// requests queue up, coalesce into batches, and run through
/// plan → generate → rebuild → configure, with invalidations drained at the
/// tail of every operation.
pub struct Orchestrator {
    config: Config,
    catalog: Arc<Catalog>,
    store: Store,
    host_secret: HostSecret,
    rebuild_tool: Arc<dyn RebuildTool>,
    supervisor: Arc<dyn Supervisor>,
    registry: Arc<ConfiguratorRegistry>,
    queue: OperationQueue,
    events: broadcast::Sender<RebuildEvent>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum ConfigureOutcome {
    Configured,
    /// Dynamic configuration failed; the service itself keeps running and
    /// reconciliation retries.
    DynamicFailed,
    HealthFailed,
    /// State could not even be assembled (e.g. the app vanished mid-run).
    Skipped,
}

type LogLines = Vec<(&'static str, String)>;

impl Orchestrator {
    pub fn new(
        config: Config,
        catalog: Arc<Catalog>,
        store: Store,
        host_secret: HostSecret,
        rebuild_tool: Arc<dyn RebuildTool>,
        supervisor: Arc<dyn Supervisor>,
        registry: Arc<ConfiguratorRegistry>,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            config,
            catalog,
            store,
            host_secret,
            rebuild_tool,
            supervisor,
            registry,
            queue: OperationQueue::new(),
            events,
        }
    }

    pub fn queue(&self) -> &OperationQueue {
        &self.queue
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<RebuildEvent> {
        self.events.subscribe()
    }

    pub async fn installed(&self) -> Result<Vec<InstalledApp>, OperationError> {
        Ok(self.store.installed_apps().await?)
    }

    /// Read-only plan preview for the API; writes nothing.
    pub async fn plan_install_preview(
        &self,
        app: &AppName,
        choices: &BTreeMap<String, AppName>,
    ) -> Result<InstallPlan, OperationError> {
        let installed = self.store.installed_apps().await?;
        let bindings = self.store.bindings().await?;
        Ok(planner::plan_install(
            &self.catalog,
            &installed,
            &bindings,
            app,
            choices,
        )?)
    }

    pub async fn plan_remove_preview(&self, app: &AppName) -> Result<RemovePlan, OperationError> {
        let installed = self.store.installed_apps().await?;
        let bindings = self.store.bindings().await?;
        Ok(planner::plan_remove(
            &self.catalog,
            &installed,
            &bindings,
            app,
        )?)
    }

    /// The worker loop. Waits for operations, coalesces everything arriving
    /// within the batch window, and processes the batch. Runs until
    /// `shutdown` resolves.
    pub async fn run_worker(
        self: Arc<Self>,
        shutdown: impl std::future::Future<Output = ()> + Send,
    ) {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = self.queue.wait_for_work() => {}
                _ = &mut shutdown => {
                    log::info!("Shutting down orchestrator worker");
                    break;
                }
            }

            tokio::time::sleep(Duration::from_millis(self.config.batch_window_ms)).await;
            self.clone().process_pending().await;

            let pruned = self.queue.prune_results(Utc::now() - TimeDelta::hours(1));
            if pruned > 0 {
                log::debug!("Pruned {pruned} finished operation results");
            }
        }
    }

    /// Snapshots the pending operations and runs them as one batch. A panic
    /// inside the batch aborts only that batch; the worker keeps serving.
    pub async fn process_pending(self: Arc<Self>) {
        let operations = self.queue.drain_pending();
        if operations.is_empty() {
            return;
        }

        let batch = Batch::coalesce(&operations);
        let ids = batch.ids.clone();

        let this = self.clone();
        let result = match tokio::spawn(async move { this.execute(batch).await }).await {
            Ok(result) => result,
            Err(err) => {
                log::error!("Batch processing aborted: {err}");
                Err(OperationError::Internal {
                    err: format!("batch processing aborted: {err}"),
                })
            }
        };

        if let Err(err) = &result {
            log::error!("Batch failed: {err}");
        }
        self.queue.record_result(&ids, &result);
    }

    async fn execute(&self, batch: Batch) -> OperationResult {
        let mut outcome = OperationOutcome {
            rebuild_id: None,
            apps: Vec::new(),
        };

        if batch.has_mutations() {
            outcome = self.execute_mutations(&batch).await?;
        }
        if batch.reconcile {
            let reconcile_outcome = self.execute_reconcile().await?;
            if outcome.rebuild_id.is_none() {
                outcome.rebuild_id = reconcile_outcome.rebuild_id;
            }
            for app in reconcile_outcome.apps {
                if !outcome.apps.contains(&app) {
                    outcome.apps.push(app);
                }
            }
        }

        Ok(outcome)
    }

    fn generator_ctx(&self) -> GeneratorContext {
        GeneratorContext::from(&self.config)
    }

    fn artifact_paths(&self) -> ArtifactPaths {
        ArtifactPaths::from(&self.config)
    }

    fn publish_log(&self, record: &crate::rebuild::RebuildRecord) {
        if let Err(err) = crate::rebuild::publish(record, &self.config.rebuild_logs_dir()) {
            log::error!("Cannot publish rebuild log {}: {err}", record.id);
        }
    }

    async fn execute_mutations(&self, batch: &Batch) -> OperationResult {
        // Kept alive for the whole batch; dropping the sender would make
        // every receiver report an immediate change.
        let (cancel_tx, cancel) = watch::channel(false);
        let _keep_cancel = cancel_tx;

        let installed = self.store.installed_apps().await?;
        let bindings = self.store.bindings().await?;
        let installed_names = installed
            .iter()
            .map(|app| app.name.clone())
            .collect::<BTreeSet<_>>();

        // Plan everything first; a single blocked plan aborts the batch
        // before any side effect. Installing an already-installed app with
        // explicit choices is a provider swap and is validated here too.
        let mut install_plans = Vec::new();
        let mut swaps: Vec<(AppName, String, AppName)> = Vec::new();
        for (app, choices) in &batch.installs {
            let plan = planner::plan_install(&self.catalog, &installed, &bindings, app, choices)?;
            if !plan.can_install {
                return Err(OperationError::PlanBlocked {
                    app: app.clone(),
                    blockers: plan.blockers,
                    choices: plan.choices,
                });
            }

            if installed_names.contains(app) {
                for (integration, source) in choices {
                    let blocked = |reason: String| OperationError::PlanBlocked {
                        app: app.clone(),
                        blockers: vec![reason],
                        choices: Vec::new(),
                    };
                    let consumed = self
                        .catalog
                        .get(app)
                        .and_then(|manifest| manifest.consumed(integration))
                        .ok_or_else(|| {
                            blocked(format!("{app} does not consume {integration}"))
                        })?;
                    if !consumed.is_compatible(source) {
                        return Err(blocked(format!(
                            "{source} is not a compatible source for {integration} of {app}"
                        )));
                    }
                    if !installed_names.contains(source) {
                        return Err(blocked(format!("{source} is not installed")));
                    }
                    let already_bound = bindings.iter().any(|binding| {
                        &binding.consumer_app == app
                            && &binding.integration == integration
                            && &binding.source_app == source
                    });
                    if !already_bound {
                        swaps.push((app.clone(), integration.clone(), source.clone()));
                    }
                }
            }

            install_plans.push(plan);
        }

        let mut remove_plans = Vec::new();
        for app in &batch.uninstalls {
            let plan = planner::plan_remove(&self.catalog, &installed, &bindings, app)?;
            if !plan.can_remove {
                return Err(OperationError::RemoveBlocked {
                    app: app.clone(),
                    blockers: plan.blockers,
                });
            }
            remove_plans.push(plan);
        }

        let mut to_install: Vec<AppName> = Vec::new();
        let mut new_bindings: Vec<Binding> = Vec::new();
        for plan in &install_plans {
            for name in &plan.to_install {
                if !installed_names.contains(name) && !to_install.contains(name) {
                    to_install.push(name.clone());
                }
            }
            for planned in &plan.bindings {
                let binding = Binding::new(
                    planned.consumer.clone(),
                    planned.integration.clone(),
                    planned.source.clone(),
                );
                if !new_bindings.contains(&binding) {
                    new_bindings.push(binding);
                }
            }
        }

        let uninstall_targets = batch.uninstalls.iter().cloned().collect::<Vec<_>>();
        let mut batch_apps = to_install.clone();
        batch_apps.extend(uninstall_targets.iter().cloned());

        let mut log =
            RebuildLogWriter::new(batch.trigger(), batch_apps.clone(), self.events.clone());
        log.begin_phase(RebuildPhase::Preflight);
        log.info(format!(
            "installing [{}], removing [{}]",
            join(&to_install),
            join(&uninstall_targets)
        ));

        // New rows commit before the rebuild; the status field carries the
        // truth if anything later fails.
        let now = Utc::now();
        let mut new_rows = Vec::new();
        for name in &to_install {
            let manifest =
                self.catalog
                    .get(name)
                    .ok_or_else(|| OperationError::UnknownApp {
                        app: name.clone(),
                    })?;
            new_rows.push(InstalledApp {
                name: manifest.name.clone(),
                display_name: manifest.display_name.clone(),
                version: manifest.version.clone(),
                status: AppStatus::Queued,
                port: manifest.port,
                is_system: manifest.is_system,
                installed_at: now,
                updated_at: now,
            });
        }
        self.store.apply_install(&new_rows, &new_bindings).await?;
        self.store
            .set_status_many(&to_install, AppStatus::Configuring)
            .await?;

        // Uninstall prep: clear the dependents' bindings and let them drop
        // their references while the target's API is still alive.
        for plan in &remove_plans {
            self.store
                .set_status(&plan.target, AppStatus::Stopping)
                .await?;

            for consumer in &plan.will_unconfigure {
                for binding in self.store.bindings_of_consumer(consumer).await? {
                    if binding.source_app == plan.target {
                        self.store
                            .delete_binding(
                                &binding.consumer_app,
                                &binding.integration,
                                &binding.source_app,
                            )
                            .await?;
                    }
                }

                match assemble_state(
                    &self.store,
                    &self.catalog,
                    &self.config,
                    &self.host_secret,
                    consumer,
                    cancel.clone(),
                )
                .await
                {
                    Ok(state) => {
                        if let Err(err) = self.registry.get(consumer).dynamic_config(&state).await
                        {
                            log.error(format!(
                                "unconfiguring {consumer} before removal of {} failed: {err}",
                                plan.target
                            ));
                        }
                    }
                    Err(err) => {
                        log.error(format!("cannot assemble state for {consumer}: {err}"));
                    }
                }

                self.store
                    .mark_invalidation(consumer, "provider removed")
                    .await?;
            }
        }

        // Apply provider swaps: drop the superseded edge (unless the
        // consumer accepts multiple sources), bind the chosen one, and mark
        // the consumer for a static-config re-check.
        for (consumer, integration, source) in &swaps {
            let multi = self
                .catalog
                .get(consumer)
                .and_then(|manifest| manifest.consumed(integration))
                .map(|consumed| consumed.multi)
                .unwrap_or(false);
            if !multi {
                for binding in self.store.bindings_of_consumer(consumer).await? {
                    if &binding.integration == integration {
                        self.store
                            .delete_binding(
                                &binding.consumer_app,
                                &binding.integration,
                                &binding.source_app,
                            )
                            .await?;
                    }
                }
            }
            self.store
                .insert_binding(&Binding::new(
                    consumer.clone(),
                    integration.clone(),
                    source.clone(),
                ))
                .await?;
            self.store
                .mark_invalidation(consumer, "binding swapped")
                .await?;
            log.info(format!("rebound {integration} of {consumer} to {source}"));
        }

        // Bind integrations that just became available (e.g. an optional
        // provider arriving for an installed consumer).
        let remaining = self
            .store
            .installed_apps()
            .await?
            .into_iter()
            .map(|app| app.name)
            .filter(|name| !batch.uninstalls.contains(name))
            .collect::<BTreeSet<_>>();
        let current_bindings = self.store.bindings().await?;
        let newly_bound =
            planner::missing_bindings(&self.catalog, &remaining, &current_bindings);
        for planned in &newly_bound {
            self.store
                .insert_binding(&Binding::new(
                    planned.consumer.clone(),
                    planned.integration.clone(),
                    planned.source.clone(),
                ))
                .await?;
        }
        for consumer in newly_bound
            .iter()
            .map(|planned| planned.consumer.clone())
            .collect::<BTreeSet<_>>()
        {
            if !to_install.contains(&consumer) {
                self.store
                    .mark_invalidation(&consumer, "provider installed")
                    .await?;
            }
        }

        // Generate artifacts. A generation error aborts before any external
        // call; nothing has been written.
        log.begin_phase(RebuildPhase::NixConfig);
        let desired = self
            .store
            .installed_apps()
            .await?
            .into_iter()
            .filter(|app| !batch.uninstalls.contains(&app.name))
            .collect::<Vec<_>>();
        let bindings_now = self.store.bindings().await?;

        let artifacts = match generator::generate(
            &self.catalog,
            &desired,
            &bindings_now,
            &self.host_secret,
            &self.generator_ctx(),
        ) {
            Ok(artifacts) => artifacts,
            Err(err) => {
                log.error(format!("{err}"));
                self.store
                    .set_status_many(&to_install, AppStatus::Failed)
                    .await?;
                let record = log.finish(RebuildStatus::Failed, format!("generation failed: {err}"));
                self.publish_log(&record);
                return Err(err.into());
            }
        };
        if let Err(err) = generator::write_artifacts(&artifacts, &self.artifact_paths()) {
            log.error(format!("{err}"));
            self.store
                .set_status_many(&to_install, AppStatus::Failed)
                .await?;
            let record = log.finish(RebuildStatus::Failed, format!("generation failed: {err}"));
            self.publish_log(&record);
            return Err(err.into());
        }
        log.info(format!(
            "generated config for {} apps ({} blueprints)",
            desired.len(),
            artifacts.blueprints.len()
        ));

        self.store
            .set_status_many(&to_install, AppStatus::Building)
            .await?;

        // Rebuild. On failure the previous generation remains live; affected
        // apps are marked and the batch ends here.
        log.begin_phase(RebuildPhase::Rebuild);
        let rebuild_ok = match self.rebuild_tool.rebuild(&mut log).await {
            Ok(outcome) => outcome.is_success(),
            Err(err) => {
                log.error(format!("cannot run rebuild tool: {err}"));
                false
            }
        };
        if !rebuild_ok {
            self.store
                .set_status_many(&batch_apps, AppStatus::Failed)
                .await?;
            let rebuild_id = log.id();
            let record = log.finish(
                RebuildStatus::Failed,
                "rebuild failed; the previous system generation remains live",
            );
            self.publish_log(&record);
            return Err(OperationError::RebuildFailed { rebuild_id });
        }

        // The rebuild removed the uninstalled services; now drop their rows
        // and their secret material.
        for target in &uninstall_targets {
            self.store.apply_uninstall(target).await?;
            match std::fs::remove_file(self.config.env_file(target)) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => log.error(format!("cannot remove env file of {target}: {err}")),
            }
        }

        self.store
            .set_status_many(&to_install, AppStatus::Starting)
            .await?;

        // Configure the new apps in dependency order, then drain whatever
        // the batch invalidated.
        log.begin_phase(RebuildPhase::PostRebuild);
        let subset = to_install.iter().cloned().collect::<BTreeSet<_>>();
        self.configure_apps(&subset, &mut log, cancel.clone()).await?;
        self.drain_invalidations(&mut log, cancel).await?;

        let rebuild_id = log.id();
        let record = log.finish(
            RebuildStatus::Success,
            format!(
                "installed {} app(s), removed {} app(s)",
                to_install.len(),
                uninstall_targets.len()
            ),
        );
        self.publish_log(&record);

        Ok(OperationOutcome {
            rebuild_id: Some(rebuild_id),
            apps: batch_apps,
        })
    }

    /// Self-healing: re-derives everything from the store, rebuilds if the
    /// artifacts diverged from disk, re-checks every app's static config,
    /// and retries apps whose configuration never finished.
    async fn execute_reconcile(&self) -> OperationResult {
        let (cancel_tx, cancel) = watch::channel(false);
        let _keep_cancel = cancel_tx;

        let installed = self.store.installed_apps().await?;
        let names = installed
            .iter()
            .map(|app| app.name.clone())
            .collect::<BTreeSet<_>>();

        // Heal missing edges first (e.g. after a restored store).
        let bindings = self.store.bindings().await?;
        for planned in planner::missing_bindings(&self.catalog, &names, &bindings) {
            self.store
                .insert_binding(&Binding::new(
                    planned.consumer.clone(),
                    planned.integration,
                    planned.source,
                ))
                .await?;
            self.store
                .mark_invalidation(&planned.consumer, "provider installed")
                .await?;
        }

        let bindings = self.store.bindings().await?;
        let artifacts = generator::generate(
            &self.catalog,
            &installed,
            &bindings,
            &self.host_secret,
            &self.generator_ctx(),
        )?;
        let changed = generator::write_artifacts(&artifacts, &self.artifact_paths())?;

        let mut log = RebuildLogWriter::new(
            RebuildTrigger::Reconcile,
            names.iter().cloned().collect(),
            self.events.clone(),
        );
        log.begin_phase(RebuildPhase::Preflight);
        log.info(if changed {
            "generated artifacts diverged from disk"
        } else {
            "generated artifacts match disk"
        });

        if changed {
            log.begin_phase(RebuildPhase::Rebuild);
            let rebuild_ok = match self.rebuild_tool.rebuild(&mut log).await {
                Ok(outcome) => outcome.is_success(),
                Err(err) => {
                    log.error(format!("cannot run rebuild tool: {err}"));
                    false
                }
            };
            if !rebuild_ok {
                let rebuild_id = log.id();
                let record = log.finish(
                    RebuildStatus::Failed,
                    "rebuild failed; the previous system generation remains live",
                );
                self.publish_log(&record);
                return Err(OperationError::RebuildFailed { rebuild_id });
            }
        }

        log.begin_phase(RebuildPhase::PostRebuild);

        // Static sweep over every installed app. Invalidation rows are
        // subsumed by it, so they are cleared alongside.
        let mut changed_apps = BTreeSet::new();
        for app in &names {
            match assemble_state(
                &self.store,
                &self.catalog,
                &self.config,
                &self.host_secret,
                app,
                cancel.clone(),
            )
            .await
            {
                Ok(state) => match self.registry.get(app).static_config(&state).await {
                    Ok(true) => {
                        changed_apps.insert(app.clone());
                        log.info(format!("static config of {app} changed"));
                    }
                    Ok(false) => {}
                    Err(err) => log.error(format!("static config of {app} failed: {err}")),
                },
                Err(err) => log.error(format!("cannot assemble state for {app}: {err}")),
            }
        }
        for invalidation in self.store.pending_invalidations().await? {
            self.store.clear_invalidation(&invalidation.app_name).await?;
        }

        self.restart_in_order(&changed_apps, &mut log, cancel.clone())
            .await?;

        // Retry everything that never finished configuring: unconfigured
        // bindings and apps stuck in a failure state.
        let mut retry = self
            .store
            .bindings()
            .await?
            .into_iter()
            .filter(|binding| binding.configured_at.is_none())
            .map(|binding| binding.consumer_app)
            .filter(|app| !changed_apps.contains(app))
            .collect::<BTreeSet<_>>();
        for app in &installed {
            if matches!(app.status, AppStatus::Error | AppStatus::Failed)
                && !changed_apps.contains(&app.name)
            {
                retry.insert(app.name.clone());
            }
        }
        self.configure_apps(&retry, &mut log, cancel).await?;

        let rebuild_id = log.id();
        if changed || !changed_apps.is_empty() || !retry.is_empty() {
            let record = log.finish(RebuildStatus::Success, "reconciled");
            self.publish_log(&record);
            Ok(OperationOutcome {
                rebuild_id: changed.then_some(rebuild_id),
                apps: names.into_iter().collect(),
            })
        } else {
            log::debug!("Reconciliation found nothing to do");
            Ok(OperationOutcome {
                rebuild_id: None,
                apps: Vec::new(),
            })
        }
    }

    /// Runs the configuration lifecycle for a set of apps in dependency
    /// order: every binding source completes before its consumers start.
    /// Apps within a level are independent and run concurrently.
    async fn configure_apps(
        &self,
        apps: &BTreeSet<AppName>,
        log: &mut RebuildLogWriter,
        cancel: watch::Receiver<bool>,
    ) -> Result<BTreeMap<AppName, ConfigureOutcome>, OperationError> {
        let mut outcomes = BTreeMap::new();
        if apps.is_empty() {
            return Ok(outcomes);
        }

        let bindings = self.store.bindings().await?;
        let levels = topological_levels(apps, &bindings).map_err(|err| {
            OperationError::Internal {
                err: err.to_string(),
            }
        })?;

        for level in levels {
            let results = futures::future::join_all(
                level
                    .into_iter()
                    .map(|app| self.configure_app(app, cancel.clone())),
            )
            .await;

            for (app, outcome, lines) in results {
                for (severity, message) in lines {
                    log.log(severity, message);
                }
                outcomes.insert(app, outcome);
            }
        }

        Ok(outcomes)
    }

    async fn configure_app(
        &self,
        app: AppName,
        cancel: watch::Receiver<bool>,
    ) -> (AppName, ConfigureOutcome, LogLines) {
        let mut lines = LogLines::new();

        let state = match assemble_state(
            &self.store,
            &self.catalog,
            &self.config,
            &self.host_secret,
            &app,
            cancel,
        )
        .await
        {
            Ok(state) => state,
            Err(err) => {
                lines.push(("error", format!("cannot assemble state for {app}: {err}")));
                return (app, ConfigureOutcome::Skipped, lines);
            }
        };
        let configurator = self.registry.get(&app);

        match configurator.static_config(&state).await {
            Ok(true) => lines.push(("info", format!("static config of {app} updated"))),
            Ok(false) => {}
            Err(err) => lines.push(("error", format!("static config of {app} failed: {err}"))),
        }

        if let Err(err) = configurator.health_check(&state).await {
            lines.push(("error", format!("{err}")));
            if let Err(err) = self.store.set_status(&app, AppStatus::Error).await {
                lines.push(("error", format!("{err}")));
            }
            return (app, ConfigureOutcome::HealthFailed, lines);
        }

        match configurator.dynamic_config(&state).await {
            Ok(()) => {
                let now = Utc::now();
                for binding in &state.bindings {
                    if let Err(err) = self
                        .store
                        .stamp_binding_configured(
                            &binding.consumer_app,
                            &binding.integration,
                            &binding.source_app,
                            now,
                        )
                        .await
                    {
                        lines.push(("error", format!("{err}")));
                    }
                }
                if let Err(err) = self.store.set_status(&app, AppStatus::Running).await {
                    lines.push(("error", format!("{err}")));
                }
                (app, ConfigureOutcome::Configured, lines)
            }
            Err(err) => {
                lines.push((
                    "error",
                    format!("{err}; will retry at next reconciliation"),
                ));
                if let Err(err) = self.store.set_status(&app, AppStatus::Running).await {
                    lines.push(("error", format!("{err}")));
                }
                (app, ConfigureOutcome::DynamicFailed, lines)
            }
        }
    }

    /// Processes the pending invalidation rows: run each app's static
    /// config, delete the row either way, then restart the changed apps in
    /// binding-dependency order.
    async fn drain_invalidations(
        &self,
        log: &mut RebuildLogWriter,
        cancel: watch::Receiver<bool>,
    ) -> Result<Vec<AppName>, OperationError> {
        let pending = self.store.pending_invalidations().await?;
        if pending.is_empty() {
            return Ok(Vec::new());
        }

        let mut changed = BTreeSet::new();
        for invalidation in pending {
            let app = invalidation.app_name.clone();
            match assemble_state(
                &self.store,
                &self.catalog,
                &self.config,
                &self.host_secret,
                &app,
                cancel.clone(),
            )
            .await
            {
                Ok(state) => match self.registry.get(&app).static_config(&state).await {
                    Ok(true) => {
                        log.info(format!(
                            "static config of {app} changed ({})",
                            invalidation.reason
                        ));
                        changed.insert(app.clone());
                    }
                    Ok(false) => {}
                    Err(err) => log.error(format!("static config of {app} failed: {err}")),
                },
                Err(err) => log.error(format!("skipping invalidation of {app}: {err}")),
            }
            self.store.clear_invalidation(&app).await?;
        }

        self.restart_in_order(&changed, log, cancel).await?;
        Ok(changed.into_iter().collect())
    }

    /// Restarts apps providers-first. A restarted provider may break an
    /// in-flight consumer, so each consumer only restarts once its providers
    /// are already back up and reconfigured.
    async fn restart_in_order(
        &self,
        apps: &BTreeSet<AppName>,
        log: &mut RebuildLogWriter,
        cancel: watch::Receiver<bool>,
    ) -> Result<(), OperationError> {
        if apps.is_empty() {
            return Ok(());
        }

        let bindings = self.store.bindings().await?;
        let levels = topological_levels(apps, &bindings).map_err(|err| {
            OperationError::Internal {
                err: err.to_string(),
            }
        })?;

        for level in levels {
            for app in level {
                let unit = unit_name(&app);
                match self.supervisor.restart(&unit).await {
                    Ok(()) => log.info(format!("restarted {unit}")),
                    Err(err) => {
                        log.error(format!("cannot restart {unit}: {err}"));
                        continue;
                    }
                }

                // what the poststart hook does when systemd drives the unit
                let (_, _, lines) = self.configure_app(app, cancel.clone()).await;
                for (severity, message) in lines {
                    log.log(severity, message);
                }
            }
        }

        Ok(())
    }
}

fn join(apps: &[AppName]) -> String {
    apps.iter()
        .map(|app| app.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}
