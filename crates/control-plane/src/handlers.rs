//! API handlers for the control plane

use axum::{
    extract::{rejection::JsonRejection, FromRequestParts, Path, Query, State},
    http::{request::Parts, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use dockyard_common::access::require_role;
use dockyard_common::{Error, RequestStatus, Role, User};
use futures::stream::{self, Stream, StreamExt};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use crate::control::{self, DeploymentAction};
use crate::hooks::{self, CommitEvent, HookOutcome};
use crate::models::{
    BuildLogResponse, CreateDeploymentRequest, CreateUserRequest, DeploymentDetail,
    DeploymentSummary, LimitQuery, LogsResponse, MetricsResponse, RequestListQuery,
    StatusUpdateRequest, DEFAULT_AUDIT_LIMIT, DEFAULT_LOG_LIMIT,
};
use crate::requests::{self, RequestForm};
use crate::storage::Store;
use crate::telemetry::{LogCursor, TelemetryStore};
use crate::users;

/// Header carrying the acting user's id
pub const USER_HEADER: &str = "x-user-id";

/// Shared application state
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub telemetry: Arc<TelemetryStore>,
    pub root_username: String,
    /// Poll cadence of the log stream
    pub stream_poll: Duration,
}

/// API Error type
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    fn unauthorized(message: impl Into<String>) -> Self {
        ApiError {
            status: StatusCode::UNAUTHORIZED,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": self.message
        });

        (self.status, Json(body)).into_response()
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        let status = match &err {
            Error::NotFound { .. } => StatusCode::NOT_FOUND,
            Error::Forbidden(_) => StatusCode::FORBIDDEN,
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::Conflict(_) => StatusCode::CONFLICT,
            Error::Store(_) | Error::Tick { .. } | Error::Json(_) => {
                error!("Request failed: {}", err);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        ApiError {
            status,
            message: err.to_string(),
        }
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

/// The authenticated, active user behind a request
pub struct Actor(pub User);

impl FromRequestParts<Arc<AppState>> for Actor {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let id: i64 = parts
            .headers
            .get(USER_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse().ok())
            .ok_or_else(|| ApiError::unauthorized(format!("missing or invalid {} header", USER_HEADER)))?;

        let user = state
            .store
            .get_user(id)
            .await?
            .ok_or_else(|| ApiError::unauthorized(format!("unknown user {}", id)))?;

        if !user.active {
            return Err(Error::forbidden(format!("user {} is blocked", user.username)).into());
        }
        Ok(Actor(user))
    }
}

/// Health check
pub async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "control-plane"
    }))
}

/// Commit webhook from the source host
pub async fn commit_hook_handler(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<CommitEvent>, JsonRejection>,
) -> ApiResult<HookOutcome> {
    let Json(event) = payload.map_err(|rejection| {
        Error::validation(format!("invalid commit payload: {}", rejection.body_text()))
    })?;
    let outcome = hooks::handle_commit(state.store.as_ref(), &state.telemetry, &event).await?;
    Ok(Json(outcome))
}

pub async fn list_users_handler(
    State(state): State<Arc<AppState>>,
    Actor(actor): Actor,
) -> ApiResult<Vec<User>> {
    Ok(Json(users::list_users(state.store.as_ref(), &actor).await?))
}

pub async fn create_user_handler(
    State(state): State<Arc<AppState>>,
    Actor(actor): Actor,
    Json(payload): Json<CreateUserRequest>,
) -> Result<(StatusCode, Json<User>), ApiError> {
    let user =
        users::create_user(state.store.as_ref(), &actor, &payload.username, payload.role).await?;
    Ok((StatusCode::CREATED, Json(user)))
}

pub async fn block_user_handler(
    State(state): State<Arc<AppState>>,
    Actor(actor): Actor,
    Path(user_id): Path<i64>,
) -> ApiResult<User> {
    let user = users::set_active(
        state.store.as_ref(),
        &actor,
        &state.root_username,
        user_id,
        false,
    )
    .await?;
    Ok(Json(user))
}

pub async fn unblock_user_handler(
    State(state): State<Arc<AppState>>,
    Actor(actor): Actor,
    Path(user_id): Path<i64>,
) -> ApiResult<User> {
    let user = users::set_active(
        state.store.as_ref(),
        &actor,
        &state.root_username,
        user_id,
        true,
    )
    .await?;
    Ok(Json(user))
}

/// Recent audit entries, newest first (admin only)
pub async fn audit_handler(
    State(state): State<Arc<AppState>>,
    Actor(actor): Actor,
    Query(query): Query<LimitQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_role(&actor, &[Role::Admin])?;
    let entries = state
        .store
        .recent_audit(query.limit.unwrap_or(DEFAULT_AUDIT_LIMIT))
        .await?;

    Ok(Json(serde_json::json!({
        "entries": entries,
        "total": entries.len()
    })))
}

/// Alerts raised by failed deployments (operators and admins)
pub async fn alerts_handler(
    State(state): State<Arc<AppState>>,
    Actor(actor): Actor,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_role(&actor, &[Role::Operator, Role::Admin])?;
    let alerts = state.store.list_alerts().await?;

    Ok(Json(serde_json::json!({
        "alerts": alerts,
        "total": alerts.len()
    })))
}

pub async fn list_requests_handler(
    State(state): State<Arc<AppState>>,
    Actor(actor): Actor,
    Query(query): Query<RequestListQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let status = query
        .status
        .as_deref()
        .filter(|s| !s.is_empty())
        .map(str::parse::<RequestStatus>)
        .transpose()?;
    let rows = requests::list_requests(state.store.as_ref(), &actor, status).await?;

    Ok(Json(serde_json::json!({
        "requests": rows,
        "total": rows.len()
    })))
}

pub async fn create_request_handler(
    State(state): State<Arc<AppState>>,
    Actor(actor): Actor,
    Json(form): Json<RequestForm>,
) -> Result<impl IntoResponse, ApiError> {
    let request = requests::create_request(state.store.as_ref(), &actor, &form).await?;
    Ok((StatusCode::CREATED, Json(request)))
}

pub async fn get_request_handler(
    State(state): State<Arc<AppState>>,
    Actor(actor): Actor,
    Path(request_id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let request = requests::view_request(state.store.as_ref(), &actor, request_id).await?;
    Ok(Json(request))
}

pub async fn edit_request_handler(
    State(state): State<Arc<AppState>>,
    Actor(actor): Actor,
    Path(request_id): Path<i64>,
    Json(form): Json<RequestForm>,
) -> Result<impl IntoResponse, ApiError> {
    let request = requests::edit_request(state.store.as_ref(), &actor, request_id, &form).await?;
    Ok(Json(request))
}

pub async fn submit_request_handler(
    State(state): State<Arc<AppState>>,
    Actor(actor): Actor,
    Path(request_id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let request = requests::submit_request(state.store.as_ref(), &actor, request_id).await?;
    Ok(Json(request))
}

pub async fn change_request_status_handler(
    State(state): State<Arc<AppState>>,
    Actor(actor): Actor,
    Path(request_id): Path<i64>,
    Json(payload): Json<StatusUpdateRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let status: RequestStatus = payload.status.parse()?;
    let request =
        requests::change_status(state.store.as_ref(), &actor, request_id, status).await?;
    Ok(Json(request))
}

/// Queue a build of an image request
pub async fn queue_build_handler(
    State(state): State<Arc<AppState>>,
    Actor(actor): Actor,
    Path(request_id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let build = requests::queue_build(state.store.as_ref(), &actor, request_id).await?;
    info!("Build {} queued for request {}", build.id, request_id);
    Ok((StatusCode::CREATED, Json(build)))
}

pub async fn build_log_handler(
    State(state): State<Arc<AppState>>,
    Actor(actor): Actor,
    Path(build_id): Path<i64>,
) -> ApiResult<BuildLogResponse> {
    let build = requests::view_build(state.store.as_ref(), &actor, build_id).await?;
    Ok(Json(build.into()))
}

pub async fn create_deployment_handler(
    State(state): State<Arc<AppState>>,
    Actor(actor): Actor,
    Path(image_id): Path<i64>,
    Json(payload): Json<CreateDeploymentRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let deployment =
        control::create_deployment(state.store.as_ref(), &actor, image_id, payload.into()).await?;
    Ok((StatusCode::CREATED, Json(deployment)))
}

pub async fn list_deployments_handler(
    State(state): State<Arc<AppState>>,
    Actor(actor): Actor,
) -> Result<Json<serde_json::Value>, ApiError> {
    let summaries: Vec<DeploymentSummary> =
        control::visible_deployments(state.store.as_ref(), &actor)
            .await?
            .into_iter()
            .map(|view| {
                let can_control = view.can_control(&actor);
                DeploymentSummary::new(view, can_control)
            })
            .collect();

    Ok(Json(serde_json::json!({
        "deployments": summaries,
        "total": summaries.len()
    })))
}

pub async fn get_deployment_handler(
    State(state): State<Arc<AppState>>,
    Actor(actor): Actor,
    Path(deployment_id): Path<i64>,
) -> ApiResult<DeploymentDetail> {
    let view = control::visible_deployment(state.store.as_ref(), &actor, deployment_id).await?;
    let can_control = view.can_control(&actor);

    Ok(Json(DeploymentDetail {
        summary: DeploymentSummary::new(view, can_control),
        recent_logs: state.telemetry.recent_logs(deployment_id, DEFAULT_LOG_LIMIT),
    }))
}

async fn run_action(
    state: &AppState,
    actor: &User,
    deployment_id: i64,
    action: DeploymentAction,
) -> Result<Response, ApiError> {
    let result = control::perform(
        state.store.as_ref(),
        &state.telemetry,
        actor,
        deployment_id,
        action,
    )
    .await?;

    Ok(match result {
        Some(deployment) => Json(deployment).into_response(),
        None => Json(serde_json::json!({
            "id": deployment_id,
            "deleted": true
        }))
        .into_response(),
    })
}

pub async fn start_deployment_handler(
    State(state): State<Arc<AppState>>,
    Actor(actor): Actor,
    Path(deployment_id): Path<i64>,
) -> Result<Response, ApiError> {
    run_action(&state, &actor, deployment_id, DeploymentAction::Start).await
}

pub async fn stop_deployment_handler(
    State(state): State<Arc<AppState>>,
    Actor(actor): Actor,
    Path(deployment_id): Path<i64>,
) -> Result<Response, ApiError> {
    run_action(&state, &actor, deployment_id, DeploymentAction::Stop).await
}

pub async fn restart_deployment_handler(
    State(state): State<Arc<AppState>>,
    Actor(actor): Actor,
    Path(deployment_id): Path<i64>,
) -> Result<Response, ApiError> {
    run_action(&state, &actor, deployment_id, DeploymentAction::Restart).await
}

pub async fn delete_deployment_handler(
    State(state): State<Arc<AppState>>,
    Actor(actor): Actor,
    Path(deployment_id): Path<i64>,
) -> Result<Response, ApiError> {
    run_action(&state, &actor, deployment_id, DeploymentAction::Delete).await
}

/// Most recent runtime log lines, oldest first
pub async fn deployment_logs_handler(
    State(state): State<Arc<AppState>>,
    Actor(actor): Actor,
    Path(deployment_id): Path<i64>,
    Query(query): Query<LimitQuery>,
) -> ApiResult<LogsResponse> {
    control::visible_deployment(state.store.as_ref(), &actor, deployment_id).await?;
    let lines = state
        .telemetry
        .recent_logs(deployment_id, query.limit.unwrap_or(DEFAULT_LOG_LIMIT));

    Ok(Json(LogsResponse {
        deployment_id,
        lines,
    }))
}

pub async fn deployment_metrics_handler(
    State(state): State<Arc<AppState>>,
    Actor(actor): Actor,
    Path(deployment_id): Path<i64>,
) -> ApiResult<MetricsResponse> {
    control::visible_deployment(state.store.as_ref(), &actor, deployment_id).await?;
    Ok(Json(state.telemetry.metrics(deployment_id).into()))
}

/// Server-sent stream of log lines appended after the client connected
/// (the lines already buffered are sent first).
pub async fn deployment_log_stream_handler(
    State(state): State<Arc<AppState>>,
    Actor(actor): Actor,
    Path(deployment_id): Path<i64>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    control::visible_deployment(state.store.as_ref(), &actor, deployment_id).await?;
    info!("{} follows logs of deployment {}", actor.username, deployment_id);

    let stream = log_stream(
        Arc::clone(&state.telemetry),
        deployment_id,
        state.stream_poll,
    );
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

/// Poll the telemetry store at a fixed cadence, yielding only new lines
fn log_stream(
    telemetry: Arc<TelemetryStore>,
    deployment_id: i64,
    poll: Duration,
) -> impl Stream<Item = Result<Event, Infallible>> {
    stream::unfold(
        (LogCursor::default(), true),
        move |(cursor, first)| {
            let telemetry = Arc::clone(&telemetry);
            async move {
                if !first {
                    tokio::time::sleep(poll).await;
                }
                let (lines, cursor) = telemetry.logs_since(deployment_id, cursor);
                Some((lines, (cursor, false)))
            }
        },
    )
    .flat_map(|lines| stream::iter(lines.into_iter().map(|line| Ok(Event::default().data(line)))))
}
