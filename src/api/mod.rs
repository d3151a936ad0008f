use crate::catalog::Catalog;
use crate::config::Config;
use crate::http_result::{HttpApiError, HttpResult};
use crate::models::{
    AppName, AppNameError, AppStatus, InstallPlan, InstalledApp, OperationId, OperationIdError,
    RebuildId, RebuildIdError, RemovePlan,
};
use crate::orchestrator::{OperationError, OperationOutcome, Orchestrator};
use crate::rebuild::{read_index, read_record, RebuildRecord};
use http_api_problem::{HttpApiProblem, StatusCode};
use rocket::response::stream::{Event, EventStream};
use rocket::serde::json::Json;
use rocket::{Shutdown, State};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

/// How long a mutating request waits for its operation before answering
/// with a poll handle. Fast failures (plan-blocked) surface synchronously.
const SYNC_WAIT: Duration = Duration::from_secs(1);

pub fn routes() -> Vec<rocket::Route> {
    rocket::routes![
        apps,
        plan_install,
        plan_remove,
        install,
        uninstall,
        reconcile,
        operation_status,
        status,
        events,
        latest_rebuild,
        rebuild_by_id,
    ]
}

#[derive(serde::Serialize)]
struct AppSummary {
    name: AppName,
    display_name: String,
    category: String,
    status: Option<AppStatus>,
}

#[derive(serde::Deserialize, Default)]
struct InstallPayload {
    #[serde(default)]
    choices: BTreeMap<String, AppName>,
}

#[derive(serde::Serialize)]
struct OperationResponse {
    operation_id: OperationId,
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    outcome: Option<OperationOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<OperationError>,
}

impl OperationResponse {
    fn pending(operation_id: OperationId) -> Self {
        Self {
            operation_id,
            status: "pending",
            outcome: None,
            error: None,
        }
    }

    fn done(operation_id: OperationId, outcome: OperationOutcome) -> Self {
        Self {
            operation_id,
            status: "done",
            outcome: Some(outcome),
            error: None,
        }
    }

    fn failed(operation_id: OperationId, error: OperationError) -> Self {
        Self {
            operation_id,
            status: "failed",
            outcome: None,
            error: Some(error),
        }
    }
}

#[rocket::get("/apps")]
async fn apps(
    catalog: &State<Arc<Catalog>>,
    orchestrator: &State<Arc<Orchestrator>>,
) -> HttpResult<Json<Vec<AppSummary>>> {
    let installed = orchestrator.installed().await.map_err(problem)?;

    Ok(Json(
        catalog
            .list_installable()
            .into_iter()
            .map(|manifest| AppSummary {
                name: manifest.name.clone(),
                display_name: manifest.display_name.clone(),
                category: manifest.category.clone(),
                status: installed
                    .iter()
                    .find(|app| app.name == manifest.name)
                    .map(|app| app.status),
            })
            .collect(),
    ))
}

#[rocket::get("/apps/<name>/plan-install")]
async fn plan_install(
    name: Result<AppName, AppNameError>,
    orchestrator: &State<Arc<Orchestrator>>,
) -> HttpResult<Json<InstallPlan>> {
    let name = name?;
    let plan = orchestrator
        .plan_install_preview(&name, &BTreeMap::new())
        .await
        .map_err(problem)?;
    Ok(Json(plan))
}

#[rocket::get("/apps/<name>/plan-remove")]
async fn plan_remove(
    name: Result<AppName, AppNameError>,
    orchestrator: &State<Arc<Orchestrator>>,
) -> HttpResult<Json<RemovePlan>> {
    let name = name?;
    let plan = orchestrator
        .plan_remove_preview(&name)
        .await
        .map_err(problem)?;
    Ok(Json(plan))
}

#[rocket::post("/apps/<name>/install", data = "<payload>")]
async fn install(
    name: Result<AppName, AppNameError>,
    payload: Option<Json<InstallPayload>>,
    orchestrator: &State<Arc<Orchestrator>>,
) -> HttpResult<Json<OperationResponse>> {
    let name = name?;
    let choices = payload.map(|payload| payload.into_inner().choices).unwrap_or_default();

    let id = orchestrator.queue().enqueue_install(name, choices);
    wait_briefly(orchestrator, id).await
}

#[rocket::post("/apps/<name>/uninstall")]
async fn uninstall(
    name: Result<AppName, AppNameError>,
    orchestrator: &State<Arc<Orchestrator>>,
) -> HttpResult<Json<OperationResponse>> {
    let name = name?;
    let id = orchestrator.queue().enqueue_uninstall(name);
    wait_briefly(orchestrator, id).await
}

#[rocket::post("/reconcile")]
async fn reconcile(
    orchestrator: &State<Arc<Orchestrator>>,
) -> HttpResult<Json<OperationResponse>> {
    let id = orchestrator.queue().enqueue_reconcile();
    Ok(Json(OperationResponse::pending(id)))
}

async fn wait_briefly(
    orchestrator: &State<Arc<Orchestrator>>,
    id: OperationId,
) -> HttpResult<Json<OperationResponse>> {
    match orchestrator.queue().try_wait_for_operation(&id, SYNC_WAIT).await {
        Some(Ok(outcome)) => Ok(Json(OperationResponse::done(id, outcome))),
        Some(Err(err)) => Err(problem(err)),
        None => Ok(Json(OperationResponse::pending(id))),
    }
}

#[rocket::get("/operations/<id>")]
async fn operation_status(
    id: Result<OperationId, OperationIdError>,
    orchestrator: &State<Arc<Orchestrator>>,
) -> HttpResult<Json<OperationResponse>> {
    let id = id?;
    Ok(Json(match orchestrator.queue().peek_result(&id) {
        Some(Ok(outcome)) => OperationResponse::done(id, outcome),
        Some(Err(err)) => OperationResponse::failed(id, err),
        None => OperationResponse::pending(id),
    }))
}

#[rocket::get("/status")]
async fn status(
    orchestrator: &State<Arc<Orchestrator>>,
) -> HttpResult<Json<Vec<InstalledApp>>> {
    Ok(Json(orchestrator.installed().await.map_err(problem)?))
}

/// Server-sent progress events of running rebuilds, phase by phase.
#[rocket::get("/events")]
fn events(orchestrator: &State<Arc<Orchestrator>>, mut shutdown: Shutdown) -> EventStream![] {
    let mut stream = BroadcastStream::new(orchestrator.subscribe_events());
    EventStream! {
        loop {
            tokio::select! {
                // drain buffered progress before honoring shutdown
                biased;
                event = stream.next() => match event {
                    Some(Ok(event)) => yield Event::json(&serde_json::json!({
                        "rebuild_id": event.rebuild_id,
                        "phase": event.phase,
                        "message": event.message,
                    })),
                    // a slow client only misses intermediate progress
                    Some(Err(BroadcastStreamRecvError::Lagged(_))) => continue,
                    None => break,
                },
                _ = &mut shutdown => break,
            }
        }
    }
}

#[rocket::get("/rebuilds/latest")]
async fn latest_rebuild(config: &State<Config>) -> HttpResult<Json<RebuildRecord>> {
    let dir = config.rebuild_logs_dir();
    let record = read_index(&dir)
        .first()
        .and_then(|entry| read_record(&dir, entry.id))
        .ok_or_else(|| {
            HttpApiError::from(
                HttpApiProblem::with_title(StatusCode::NOT_FOUND)
                    .detail("No rebuild has run yet"),
            )
        })?;
    Ok(Json(record))
}

#[rocket::get("/rebuilds/<id>")]
async fn rebuild_by_id(
    id: Result<RebuildId, RebuildIdError>,
    config: &State<Config>,
) -> HttpResult<Json<RebuildRecord>> {
    let id = id?;
    let record = read_record(&config.rebuild_logs_dir(), id).ok_or_else(|| {
        HttpApiError::from(
            HttpApiProblem::with_title(StatusCode::NOT_FOUND)
                .detail(format!("No rebuild {id} on record")),
        )
    })?;
    Ok(Json(record))
}

fn problem(err: OperationError) -> HttpApiError {
    let status = match &err {
        OperationError::PlanBlocked { .. } | OperationError::RemoveBlocked { .. } => {
            StatusCode::CONFLICT
        }
        OperationError::UnknownApp { .. } | OperationError::NotInstalled { .. } => {
            StatusCode::NOT_FOUND
        }
        OperationError::Cancelled => StatusCode::CONFLICT,
        OperationError::Generation { .. }
        | OperationError::RebuildFailed { .. }
        | OperationError::Store { .. }
        | OperationError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    };

    let mut problem = HttpApiProblem::with_title(status).detail(format!("{err}"));
    match &err {
        OperationError::PlanBlocked { blockers, choices, .. } => {
            problem = problem
                .value("blockers", blockers)
                .value("choices", choices);
        }
        OperationError::RemoveBlocked { blockers, .. } => {
            problem = problem.value("blockers", blockers);
        }
        _ => {}
    }

    problem.into()
}
