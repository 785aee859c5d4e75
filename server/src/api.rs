//! Dashboard HTTP API

use crate::command::{Command, CommandLogEntry, CommandReceipt, ORIGIN_DASHBOARD};
use crate::coordinator::Task;
use crate::error::CoreError;
use crate::packets::PacketRecord;
use crate::registry::Device;
use crate::station::BaseStation;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use fleet_shared::{Directive, DirectiveKind, Position, Role};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

const DEFAULT_LOG_LIMIT: usize = 100;

pub fn router(station: Arc<BaseStation>) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/api/overview", get(overview))
        .route("/api/current-issues", get(current_issues))
        .route("/api/tasks", get(list_tasks))
        .route("/api/tasks/:id", get(get_task))
        .route("/api/tasks/:id/assign", post(assign_task))
        .route("/api/devices-positions", get(device_positions))
        .route("/api/command-logs", get(command_logs))
        .route("/api/network-logs", get(network_logs))
        .route("/api/clear-logs", post(clear_logs))
        .route("/api/issues", post(report_issue))
        .route("/api/commands", post(send_command))
        .route("/api/broadcast", post(broadcast))
        .with_state(station)
}

/// Core errors mapped onto HTTP status codes
pub struct ApiError(CoreError);

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            CoreError::UnknownDevice(_) | CoreError::UnknownTask(_) => StatusCode::NOT_FOUND,
            CoreError::NotClaimant { .. } => StatusCode::CONFLICT,
            CoreError::UnknownIssueType(_) | CoreError::MalformedMessage(_) => StatusCode::BAD_REQUEST,
            CoreError::NoRobotsAvailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            CoreError::DeliveryFailed { .. } => StatusCode::BAD_GATEWAY,
        };
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Debug, Deserialize)]
struct LimitQuery {
    limit: Option<usize>,
}

impl LimitQuery {
    fn limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_LOG_LIMIT)
    }
}

#[derive(Serialize)]
struct Overview {
    drones: Vec<Device>,
    robots: Vec<Device>,
    tasks: Vec<Task>,
    connected: Vec<String>,
    pending_tasks: usize,
    uptime_secs: u64,
}

async fn overview(State(station): State<Arc<BaseStation>>) -> Json<Overview> {
    Json(Overview {
        drones: station.registry.list(Some(Role::Drone)).await,
        robots: station.registry.list(Some(Role::Robot)).await,
        tasks: station.coordinator.list().await,
        connected: station.sessions.connected_devices().await,
        pending_tasks: station.coordinator.pending_count().await,
        uptime_secs: station.started_at.elapsed().as_secs(),
    })
}

async fn current_issues(State(station): State<Arc<BaseStation>>) -> Json<Vec<Task>> {
    Json(station.coordinator.open_tasks().await)
}

async fn list_tasks(State(station): State<Arc<BaseStation>>) -> Json<Vec<Task>> {
    Json(station.coordinator.list().await)
}

async fn get_task(State(station): State<Arc<BaseStation>>, Path(id): Path<String>) -> ApiResult<Task> {
    Ok(Json(station.coordinator.get(&id).await?))
}

/// Retry staffing a task now instead of waiting for a robot to free up
async fn assign_task(State(station): State<Arc<BaseStation>>, Path(id): Path<String>) -> ApiResult<Task> {
    Ok(Json(station.coordinator.assign(&id).await?))
}

#[derive(Serialize)]
struct DevicePosition {
    id: String,
    role: Role,
    position: Option<Position>,
    status: String,
    battery: Option<u8>,
    stale: bool,
}

async fn device_positions(State(station): State<Arc<BaseStation>>) -> Json<Vec<DevicePosition>> {
    let positions = station
        .registry
        .list(None)
        .await
        .into_iter()
        .map(|d| DevicePosition {
            id: d.id,
            role: d.role,
            position: d.position,
            status: d.status,
            battery: d.battery,
            stale: d.stale,
        })
        .collect();
    Json(positions)
}

async fn command_logs(
    State(station): State<Arc<BaseStation>>,
    Query(query): Query<LimitQuery>,
) -> Json<Vec<CommandLogEntry>> {
    Json(station.commands.recent(query.limit()).await)
}

async fn network_logs(
    State(station): State<Arc<BaseStation>>,
    Query(query): Query<LimitQuery>,
) -> Json<Vec<PacketRecord>> {
    Json(station.packets.recent(query.limit()).await)
}

async fn clear_logs(State(station): State<Arc<BaseStation>>) -> Json<Value> {
    station.commands.clear().await;
    station.packets.clear().await;
    Json(json!({ "cleared": true }))
}

#[derive(Debug, Deserialize)]
struct IssueRequest {
    #[serde(default)]
    sender_id: Option<String>,
    issue_type: String,
    #[serde(default)]
    coordinates: Option<Position>,
}

async fn report_issue(
    State(station): State<Arc<BaseStation>>,
    Json(request): Json<IssueRequest>,
) -> Result<(StatusCode, Json<Task>), ApiError> {
    let sender = request.sender_id.as_deref().unwrap_or(ORIGIN_DASHBOARD);
    let task = station
        .coordinator
        .report_issue(sender, &request.issue_type, request.coordinates)
        .await?;
    Ok((StatusCode::CREATED, Json(task)))
}

#[derive(Debug, Deserialize)]
struct CommandRequest {
    device_id: String,
    command: String,
    #[serde(default)]
    params: Option<Value>,
}

fn parse_directive(command: &str, params: Option<Value>) -> Result<Directive, CoreError> {
    let command: DirectiveKind = command.parse().map_err(CoreError::MalformedMessage)?;
    Ok(Directive { command, params })
}

async fn send_command(
    State(station): State<Arc<BaseStation>>,
    Json(request): Json<CommandRequest>,
) -> ApiResult<CommandReceipt> {
    let directive = parse_directive(&request.command, request.params)?;
    let receipt = station
        .dispatcher
        .send(&request.device_id, Command::Directive(directive), ORIGIN_DASHBOARD)
        .await?;
    Ok(Json(receipt))
}

#[derive(Debug, Deserialize)]
struct BroadcastRequest {
    role: String,
    command: String,
    #[serde(default)]
    params: Option<Value>,
}

#[derive(Serialize)]
struct BroadcastResult {
    device_id: String,
    delivered: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

async fn broadcast(
    State(station): State<Arc<BaseStation>>,
    Json(request): Json<BroadcastRequest>,
) -> ApiResult<Vec<BroadcastResult>> {
    let role: Role = request.role.parse().map_err(CoreError::MalformedMessage)?;
    let directive = parse_directive(&request.command, request.params)?;
    let results = station
        .dispatcher
        .broadcast(role, directive, ORIGIN_DASHBOARD)
        .await
        .into_iter()
        .map(|(device_id, result)| BroadcastResult {
            device_id,
            delivered: result.is_ok(),
            error: result.err().map(|e| e.to_string()),
        })
        .collect();
    Ok(Json(results))
}
