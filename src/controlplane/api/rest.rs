//! REST API Handlers
//!
//! Thin JSON routes over the volume orchestrator. Handlers translate the
//! camelCase wire types into domain requests and map error kinds to HTTP
//! status codes; no orchestration logic lives here.

use crate::controlplane::{MigrationInfo, OrchestratorStatus, VolumeOrchestrator};
use crate::domain::model::{LocationType, ReplicaStatus, Snapshot, Volume};
use crate::domain::ports::RepairScope;
use crate::domain::requests::{
    AllocVolumeRequest, AttachVolumeRequest, ChangeOfferingRequest, CheckAndRepairRequest,
    DestroyVolumeRequest, DetachVolumeRequest, MigrateVolumeRequest, MigrationOutcome,
    ResizeVolumeRequest, TakeSnapshotRequest,
};
use crate::error::{AllocationErrorKind, Error, Result};
use axum::{
    extract::{Json, Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

// =============================================================================
// Request/Response Types
// =============================================================================

/// Volume allocation request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateVolumeBody {
    pub name: String,
    pub account_id: String,
    pub zone_id: String,
    pub disk_offering_id: String,
    /// Capacity (e.g., "100Gi", "1Ti"), required for custom offerings
    #[serde(default)]
    pub size: Option<String>,
    #[serde(default)]
    pub min_iops: Option<u64>,
    #[serde(default)]
    pub max_iops: Option<u64>,
    #[serde(default)]
    pub snapshot_id: Option<String>,
    /// Create backing storage right away
    #[serde(default)]
    pub create: bool,
    /// Explicit pool for creation
    #[serde(default)]
    pub pool_id: Option<String>,
}

/// Resize request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResizeBody {
    #[serde(default)]
    pub size: Option<String>,
    #[serde(default)]
    pub min_iops: Option<u64>,
    #[serde(default)]
    pub max_iops: Option<u64>,
    #[serde(default)]
    pub disk_offering_id: Option<String>,
    #[serde(default)]
    pub shrink_ok: bool,
}

/// Offering change request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeOfferingBody {
    pub disk_offering_id: String,
    #[serde(default)]
    pub size: Option<String>,
    #[serde(default)]
    pub min_iops: Option<u64>,
    #[serde(default)]
    pub max_iops: Option<u64>,
    #[serde(default)]
    pub auto_migrate: bool,
    #[serde(default)]
    pub shrink_ok: bool,
}

/// Migration request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrateBody {
    pub destination_pool_id: String,
    #[serde(default)]
    pub disk_offering_id: Option<String>,
}

/// Attach request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachBody {
    pub instance_id: String,
    #[serde(default)]
    pub device_id: Option<u32>,
}

/// Detach request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetachBody {
    #[serde(default)]
    pub instance_id: Option<String>,
}

/// Snapshot request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotBody {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub policy_id: Option<String>,
    #[serde(default)]
    pub quiesce_vm: bool,
    #[serde(default)]
    pub location_type: Option<LocationType>,
    #[serde(default)]
    pub async_backup: bool,
    #[serde(default)]
    pub zone_ids: Vec<String>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

/// Check-and-repair request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckBody {
    #[serde(default)]
    pub repair: Option<RepairScope>,
}

/// Query parameters for DELETE
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DestroyQuery {
    #[serde(default)]
    pub force: bool,
    #[serde(default)]
    pub expunge: bool,
}

/// Volume response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeResponse {
    pub volume_id: String,
    pub name: String,
    pub account_id: String,
    pub zone_id: String,
    pub state: String,
    pub size_bytes: u64,
    pub disk_offering_id: String,
    pub pool_id: Option<String>,
    pub instance_id: Option<String>,
    pub device_id: Option<u32>,
    pub min_iops: Option<u64>,
    pub max_iops: Option<u64>,
    pub path: Option<String>,
    pub version: u64,
    pub created_at: DateTime<Utc>,
}

impl From<Volume> for VolumeResponse {
    fn from(volume: Volume) -> Self {
        Self {
            volume_id: volume.id,
            name: volume.name,
            account_id: volume.account_id,
            zone_id: volume.zone_id,
            state: volume.state.to_string(),
            size_bytes: volume.size_bytes,
            disk_offering_id: volume.disk_offering_id,
            pool_id: volume.pool_id,
            instance_id: volume.instance_id,
            device_id: volume.device_id,
            min_iops: volume.min_iops,
            max_iops: volume.max_iops,
            path: volume.path,
            version: volume.version,
            created_at: volume.created_at,
        }
    }
}

/// Snapshot response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotResponse {
    pub snapshot_id: String,
    pub name: String,
    pub volume_id: String,
    pub state: String,
    pub location_type: String,
    pub size_bytes: u64,
    /// Zone -> "Pending" | "Replicated" | "Failed"
    pub replicas: BTreeMap<String, String>,
}

impl From<Snapshot> for SnapshotResponse {
    fn from(snapshot: Snapshot) -> Self {
        let replicas = snapshot
            .replicas
            .into_iter()
            .map(|(zone, status)| {
                let status = match status {
                    ReplicaStatus::Pending => "Pending",
                    ReplicaStatus::Replicated => "Replicated",
                    ReplicaStatus::Failed { .. } => "Failed",
                };
                (zone, status.to_string())
            })
            .collect();

        Self {
            snapshot_id: snapshot.id,
            name: snapshot.name,
            volume_id: snapshot.volume_id,
            state: format!("{:?}", snapshot.state),
            location_type: snapshot.location_type.to_string(),
            size_bytes: snapshot.size_bytes,
            replicas,
        }
    }
}

/// API error response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiErrorResponse {
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

// =============================================================================
// REST Router
// =============================================================================

/// REST API router builder
pub struct RestRouter {
    orchestrator: Arc<VolumeOrchestrator>,
}

impl RestRouter {
    /// Create a new REST router
    pub fn new(orchestrator: Arc<VolumeOrchestrator>) -> Self {
        Self { orchestrator }
    }

    /// Build the Axum router
    pub fn build(self) -> Router {
        let state = AppState {
            orchestrator: self.orchestrator,
        };

        Router::new()
            // Volume endpoints
            .route("/v1/volumes", post(create_volume).get(list_volumes))
            .route("/v1/volumes/:id", get(get_volume).delete(destroy_volume))
            .route("/v1/volumes/:id/resize", post(resize_volume))
            .route("/v1/volumes/:id/offering", post(change_offering))
            .route("/v1/volumes/:id/migrate", post(migrate_volume))
            .route("/v1/volumes/:id/attach", post(attach_volume))
            .route("/v1/volumes/:id/detach", post(detach_volume))
            .route("/v1/volumes/:id/recover", post(recover_volume))
            .route("/v1/volumes/:id/check", post(check_volume))
            .route("/v1/volumes/:id/snapshots", post(take_snapshot).get(list_snapshots))
            // Migration endpoints
            .route("/v1/migrations", get(list_migrations))
            .route("/v1/migrations/:id/complete", post(complete_migration))
            // Status and health
            .route("/v1/status", get(get_status))
            .route("/health", get(health_check))
            .route("/ready", get(readiness_check))
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }
}

/// Shared application state
#[derive(Clone)]
struct AppState {
    orchestrator: Arc<VolumeOrchestrator>,
}

// =============================================================================
// Handlers
// =============================================================================

/// Allocate (and optionally create) a volume
async fn create_volume(
    State(state): State<AppState>,
    Json(body): Json<CreateVolumeBody>,
) -> Response {
    info!("Allocating volume: {}", body.name);

    let size_bytes = match body.size.as_deref().map(parse_capacity).transpose() {
        Ok(size) => size,
        Err(e) => return error_response(e),
    };

    let request = AllocVolumeRequest {
        name: body.name,
        account_id: body.account_id,
        zone_id: body.zone_id,
        disk_offering_id: body.disk_offering_id,
        size_bytes,
        min_iops: body.min_iops,
        max_iops: body.max_iops,
        snapshot_id: body.snapshot_id,
        display: None,
    };

    let volume = match state.orchestrator.alloc_volume(request).await {
        Ok(volume) => volume,
        Err(e) => return error_response(e),
    };

    if !body.create {
        return volume_response(StatusCode::CREATED, Ok(volume));
    }

    let created = state
        .orchestrator
        .create_volume(&volume.id, body.pool_id.as_deref())
        .await;
    volume_response(StatusCode::CREATED, created)
}

/// List volumes
async fn list_volumes(State(state): State<AppState>) -> impl IntoResponse {
    let volumes: Vec<VolumeResponse> = state
        .orchestrator
        .list_volumes()
        .into_iter()
        .map(VolumeResponse::from)
        .collect();

    (StatusCode::OK, Json(volumes))
}

/// Get volume info
async fn get_volume(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    volume_response(StatusCode::OK, state.orchestrator.get_volume(&id))
}

/// Destroy (and optionally expunge) a volume
async fn destroy_volume(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<DestroyQuery>,
) -> Response {
    let result = state
        .orchestrator
        .destroy_volume(DestroyVolumeRequest {
            volume_id: id,
            expunge: query.expunge,
            force: query.force,
        })
        .await;
    volume_response(StatusCode::OK, result)
}

/// Resize a volume
async fn resize_volume(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<ResizeBody>,
) -> Response {
    let new_size_bytes = match body.size.as_deref().map(parse_capacity).transpose() {
        Ok(size) => size,
        Err(e) => return error_response(e),
    };

    let result = state
        .orchestrator
        .resize_volume(ResizeVolumeRequest {
            volume_id: id,
            new_size_bytes,
            new_min_iops: body.min_iops,
            new_max_iops: body.max_iops,
            new_offering_id: body.disk_offering_id,
            shrink_ok: body.shrink_ok,
        })
        .await;
    volume_response(StatusCode::OK, result)
}

/// Change a volume's disk offering
async fn change_offering(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<ChangeOfferingBody>,
) -> Response {
    let new_size_bytes = match body.size.as_deref().map(parse_capacity).transpose() {
        Ok(size) => size,
        Err(e) => return error_response(e),
    };

    let result = state
        .orchestrator
        .change_disk_offering_for_volume(ChangeOfferingRequest {
            volume_id: id,
            new_offering_id: body.disk_offering_id,
            new_size_bytes,
            new_min_iops: body.min_iops,
            new_max_iops: body.max_iops,
            auto_migrate: body.auto_migrate,
            shrink_ok: body.shrink_ok,
        })
        .await;

    // A migrating volume finishes the change asynchronously
    let status = match &result {
        Ok(volume) if volume.state.is_in_progress() => StatusCode::ACCEPTED,
        _ => StatusCode::OK,
    };
    volume_response(status, result)
}

/// Start a migration
async fn migrate_volume(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<MigrateBody>,
) -> Response {
    let result = state
        .orchestrator
        .migrate_volume(MigrateVolumeRequest {
            volume_id: id,
            destination_pool_id: body.destination_pool_id,
            new_offering_id: body.disk_offering_id,
        })
        .await;
    volume_response(StatusCode::ACCEPTED, result)
}

/// Attach a volume to an instance
async fn attach_volume(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<AttachBody>,
) -> Response {
    let result = state
        .orchestrator
        .attach_volume_to_vm(AttachVolumeRequest {
            volume_id: id,
            instance_id: body.instance_id,
            device_id: body.device_id,
        })
        .await;
    volume_response(StatusCode::OK, result)
}

/// Detach a volume
async fn detach_volume(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<DetachBody>,
) -> Response {
    let result = state
        .orchestrator
        .detach_volume_from_vm(DetachVolumeRequest {
            volume_id: id,
            instance_id: body.instance_id,
        })
        .await;
    volume_response(StatusCode::OK, result)
}

/// Recover a destroyed volume
async fn recover_volume(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    volume_response(StatusCode::OK, state.orchestrator.recover_volume(&id).await)
}

/// Run check-and-repair
async fn check_volume(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<CheckBody>,
) -> Response {
    match state
        .orchestrator
        .check_and_repair_volume(CheckAndRepairRequest {
            volume_id: id,
            repair: body.repair,
        })
        .await
    {
        Ok(report) => (StatusCode::OK, Json(report)).into_response(),
        Err(e) => error_response(e),
    }
}

/// Take a snapshot of a volume
async fn take_snapshot(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<SnapshotBody>,
) -> Response {
    let mut request = TakeSnapshotRequest::primary(id);
    request.name = body.name;
    request.policy_id = body.policy_id;
    request.quiesce_vm = body.quiesce_vm;
    request.async_backup = body.async_backup;
    request.zone_ids = body.zone_ids;
    request.tags = body.tags;
    if let Some(location_type) = body.location_type {
        request.location_type = location_type;
    }

    match state.orchestrator.take_snapshot(request).await {
        Ok(snapshot) => {
            (StatusCode::CREATED, Json(SnapshotResponse::from(snapshot))).into_response()
        }
        Err(e) => error_response(e),
    }
}

/// List snapshots of a volume
async fn list_snapshots(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let snapshots: Vec<SnapshotResponse> = state
        .orchestrator
        .list_snapshots(Some(id.as_str()))
        .into_iter()
        .map(SnapshotResponse::from)
        .collect();

    (StatusCode::OK, Json(snapshots))
}

/// List in-flight migrations
async fn list_migrations(State(state): State<AppState>) -> impl IntoResponse {
    let migrations: Vec<MigrationInfo> = state.orchestrator.list_migrations();
    (StatusCode::OK, Json(migrations))
}

/// Report the outcome of a migration
async fn complete_migration(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(outcome): Json<MigrationOutcome>,
) -> Response {
    debug!(volume_id = %id, outcome = ?outcome, "Migration completion reported");
    volume_response(
        StatusCode::OK,
        state.orchestrator.complete_migration(&id, outcome).await,
    )
}

/// Orchestrator status
async fn get_status(State(state): State<AppState>) -> impl IntoResponse {
    let status: OrchestratorStatus = state.orchestrator.status();
    (StatusCode::OK, Json(status))
}

/// Health check
async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// Readiness check
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    if state.orchestrator.catalog().pool_count() > 0 {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "no pools registered")
    }
}

// =============================================================================
// Error Mapping
// =============================================================================

fn volume_response(status: StatusCode, result: Result<Volume>) -> Response {
    match result {
        Ok(volume) => (status, Json(VolumeResponse::from(volume))).into_response(),
        Err(e) => error_response(e),
    }
}

/// HTTP status and error code for an error
pub fn status_for(err: &Error) -> (StatusCode, &'static str) {
    match err {
        Error::VolumeNotFound { .. }
        | Error::SnapshotNotFound { .. }
        | Error::OfferingNotFound { .. }
        | Error::PoolNotFound { .. } => (StatusCode::NOT_FOUND, "not_found"),
        Error::InvalidParameter(_) | Error::CapacityParse(_) | Error::JsonParse(_) => {
            (StatusCode::BAD_REQUEST, "invalid_parameter")
        }
        Error::ResourceAllocation { kind, .. } => match kind {
            AllocationErrorKind::Capacity => {
                (StatusCode::INSUFFICIENT_STORAGE, "insufficient_capacity")
            }
            AllocationErrorKind::Sizing => (StatusCode::BAD_REQUEST, "invalid_size"),
            AllocationErrorKind::Placement => (StatusCode::CONFLICT, "no_compatible_pool"),
            AllocationErrorKind::Limit => (StatusCode::CONFLICT, "limit_reached"),
        },
        Error::InvalidStateTransition { .. } => (StatusCode::CONFLICT, "invalid_state_transition"),
        Error::ConcurrentModification { .. } | Error::VolumeExists { .. } => {
            (StatusCode::CONFLICT, "conflict")
        }
        Error::MigrationAdmissionDeclined { .. } => {
            (StatusCode::TOO_MANY_REQUESTS, "migration_admission_declined")
        }
        Error::DestructiveOperationRejected { .. } => {
            (StatusCode::PRECONDITION_FAILED, "destructive_operation_rejected")
        }
        Error::ExternalCollaboratorFailure { .. } => {
            (StatusCode::BAD_GATEWAY, "collaborator_failure")
        }
        Error::Internal(_) | Error::Configuration(_) | Error::YamlParse(_) | Error::Io(_) => {
            (StatusCode::INTERNAL_SERVER_ERROR, "internal_error")
        }
    }
}

fn error_response(err: Error) -> Response {
    let (status, code) = status_for(&err);
    if status.is_server_error() {
        warn!(error = %err, "Request failed");
    } else {
        debug!(error = %err, "Request rejected");
    }

    let details = match &err {
        Error::ResourceAllocation { kind, .. } => Some(kind.to_string()),
        Error::ExternalCollaboratorFailure { collaborator, step, .. } => {
            Some(format!("{}:{}", collaborator, step))
        }
        _ => None,
    };

    let retry_after = match err.action() {
        crate::error::ErrorAction::RetryAfter(delay) => Some(delay.as_secs()),
        _ => None,
    };

    let body = Json(ApiErrorResponse {
        error: code.into(),
        message: err.to_string(),
        details,
    });

    match retry_after {
        Some(secs) => (status, [(header::RETRY_AFTER, secs.to_string())], body).into_response(),
        None => (status, body).into_response(),
    }
}

// =============================================================================
// Utility Functions
// =============================================================================

/// Parse capacity string (e.g., "100Gi", "1Ti") to bytes
pub fn parse_capacity(s: &str) -> Result<u64> {
    let s = s.trim();
    if s.is_empty() {
        return Err(Error::CapacityParse("empty capacity string".into()));
    }

    let num_end = s
        .char_indices()
        .find(|(_, c)| !c.is_ascii_digit() && *c != '.')
        .map_or(s.len(), |(i, _)| i);

    let num_str = &s[..num_end];
    let unit_str = s[num_end..].trim();

    let num: f64 = num_str
        .parse()
        .map_err(|_| Error::CapacityParse(format!("invalid number: {}", num_str)))?;

    let multiplier: u64 = match unit_str.to_uppercase().as_str() {
        "" | "B" => 1,
        "K" | "KB" | "KI" | "KIB" => 1024,
        "M" | "MB" | "MI" | "MIB" => 1024 * 1024,
        "G" | "GB" | "GI" | "GIB" => 1024 * 1024 * 1024,
        "T" | "TB" | "TI" | "TIB" => 1024 * 1024 * 1024 * 1024,
        _ => {
            return Err(Error::CapacityParse(format!(
                "unknown unit: {}",
                unit_str
            )))
        }
    };

    Ok((num * multiplier as f64) as u64)
}
