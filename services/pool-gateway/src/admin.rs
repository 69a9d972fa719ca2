//! Admin API for pool management
//!
//! Runs on its own listener (`server.admin_addr`) and never shares a port with
//! `/query`. Every route translates to one `AdminCommand`; the resulting
//! envelope is returned as-is with a status code derived from its failure kind.
//!
//! Endpoints:
//! - GET    /admin/pool                     pool status with per-member detail
//! - GET    /admin/members                  member ids with availability
//! - POST   /admin/members                  add a member
//! - DELETE /admin/members/{id}             remove a member
//! - POST   /admin/members/{id}/enable      enable
//! - POST   /admin/members/{id}/disable     disable
//! - POST   /admin/members/{id}/reset       clear failures and backoff
//! - POST   /admin/members/{id}/test        probe one member
//! - POST   /admin/test                     probe every member
//! - GET    /admin/export                   export all credentials
//! - GET    /admin/export/{id}              export one member's credentials
//! - POST   /admin/import                   bulk import
//! - GET    /admin/monitor, PUT /admin/monitor
//! - POST   /admin/monitor/start, POST /admin/monitor/stop
//! - GET    /admin/fallback, PUT /admin/fallback
//! - POST   /admin/reload                   re-read the credential document

use std::sync::Arc;

use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::http::header::HeaderName;
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use serde::Deserialize;
use session_pool::{
    AdminCommand, AdminFailure, Envelope, FallbackUpdate, ImportPayload, MonitorUpdate, Pool,
};
use tracing::{info, warn};

/// Shared state for admin API handlers.
#[derive(Clone)]
pub struct AdminState {
    pool: Arc<Pool>,
}

impl AdminState {
    pub fn new(pool: Arc<Pool>) -> Self {
        Self { pool }
    }
}

/// Build the admin axum router.
pub fn build_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/admin/pool", get(pool_status))
        .route("/admin/members", get(list_members).post(add_member))
        .route("/admin/members/{id}", delete(remove_member))
        .route("/admin/members/{id}/enable", post(enable_member))
        .route("/admin/members/{id}/disable", post(disable_member))
        .route("/admin/members/{id}/reset", post(reset_member))
        .route("/admin/members/{id}/test", post(test_member))
        .route("/admin/test", post(test_all))
        .route("/admin/export", get(export_all))
        .route("/admin/export/{id}", get(export_member))
        .route("/admin/import", post(import))
        .route("/admin/monitor", get(monitor_config).put(update_monitor))
        .route("/admin/monitor/start", post(start_monitor))
        .route("/admin/monitor/stop", post(stop_monitor))
        .route("/admin/fallback", get(fallback_config).put(update_fallback))
        .route("/admin/reload", post(reload_config))
        .with_state(state)
}

fn status_for(envelope: &Envelope) -> StatusCode {
    match envelope.failure {
        None => StatusCode::OK,
        Some(AdminFailure::NotFound) => StatusCode::NOT_FOUND,
        Some(AdminFailure::Conflict) => StatusCode::CONFLICT,
        Some(AdminFailure::Invalid) => StatusCode::BAD_REQUEST,
        Some(AdminFailure::Internal) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

type JsonResponse = (StatusCode, [(HeaderName, &'static str); 1], String);

/// Run one command and render its envelope.
async fn run(state: &AdminState, command: AdminCommand) -> JsonResponse {
    let label = command_label(&command);
    let envelope = state.pool.execute(command).await;
    let status = status_for(&envelope);
    if envelope.is_ok() {
        info!(command = label, "admin command completed");
    } else {
        warn!(
            command = label,
            status = status.as_u16(),
            message = envelope.message.as_deref().unwrap_or_default(),
            "admin command failed"
        );
    }

    let body = serde_json::to_string(&envelope).unwrap_or_else(|e| {
        serde_json::json!({ "status": "error", "message": e.to_string() }).to_string()
    });
    (
        status,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body,
    )
}

fn command_label(command: &AdminCommand) -> &'static str {
    match command {
        AdminCommand::Status => "status",
        AdminCommand::ListMembers => "list_members",
        AdminCommand::AddMember { .. } => "add_member",
        AdminCommand::RemoveMember { .. } => "remove_member",
        AdminCommand::EnableMember { .. } => "enable_member",
        AdminCommand::DisableMember { .. } => "disable_member",
        AdminCommand::ResetMember { .. } => "reset_member",
        AdminCommand::ExportAll => "export_all",
        AdminCommand::ExportMember { .. } => "export_member",
        AdminCommand::Import(_) => "import",
        AdminCommand::MonitorConfig => "monitor_config",
        AdminCommand::UpdateMonitor(_) => "update_monitor",
        AdminCommand::StartMonitor => "start_monitor",
        AdminCommand::StopMonitor => "stop_monitor",
        AdminCommand::FallbackConfig => "fallback_config",
        AdminCommand::UpdateFallback(_) => "update_fallback",
        AdminCommand::TestMember { .. } => "test_member",
        AdminCommand::TestAll => "test_all",
        AdminCommand::ReloadConfig => "reload_config",
    }
}

/// Request body for adding a member.
#[derive(Deserialize)]
struct AddMemberRequest {
    id: String,
    csrf_token: String,
    session_token: String,
}

async fn pool_status(State(state): State<AdminState>) -> impl IntoResponse {
    run(&state, AdminCommand::Status).await
}

async fn list_members(State(state): State<AdminState>) -> impl IntoResponse {
    run(&state, AdminCommand::ListMembers).await
}

async fn add_member(
    State(state): State<AdminState>,
    axum::Json(body): axum::Json<AddMemberRequest>,
) -> impl IntoResponse {
    let command = AdminCommand::AddMember {
        id: body.id,
        csrf_token: body.csrf_token,
        session_token: body.session_token,
    };
    run(&state, command).await
}

async fn remove_member(
    State(state): State<AdminState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    run(&state, AdminCommand::RemoveMember { id }).await
}

async fn enable_member(
    State(state): State<AdminState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    run(&state, AdminCommand::EnableMember { id }).await
}

async fn disable_member(
    State(state): State<AdminState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    run(&state, AdminCommand::DisableMember { id }).await
}

async fn reset_member(
    State(state): State<AdminState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    run(&state, AdminCommand::ResetMember { id }).await
}

async fn test_member(
    State(state): State<AdminState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    run(&state, AdminCommand::TestMember { id }).await
}

async fn test_all(State(state): State<AdminState>) -> impl IntoResponse {
    run(&state, AdminCommand::TestAll).await
}

/// GET /admin/export: full credentials. Only reachable on the admin listener.
async fn export_all(State(state): State<AdminState>) -> impl IntoResponse {
    run(&state, AdminCommand::ExportAll).await
}

async fn export_member(
    State(state): State<AdminState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    run(&state, AdminCommand::ExportMember { id }).await
}

async fn import(
    State(state): State<AdminState>,
    axum::Json(payload): axum::Json<ImportPayload>,
) -> impl IntoResponse {
    run(&state, AdminCommand::Import(payload)).await
}

async fn monitor_config(State(state): State<AdminState>) -> impl IntoResponse {
    run(&state, AdminCommand::MonitorConfig).await
}

async fn update_monitor(
    State(state): State<AdminState>,
    axum::Json(update): axum::Json<MonitorUpdate>,
) -> impl IntoResponse {
    run(&state, AdminCommand::UpdateMonitor(update)).await
}

async fn start_monitor(State(state): State<AdminState>) -> impl IntoResponse {
    run(&state, AdminCommand::StartMonitor).await
}

async fn stop_monitor(State(state): State<AdminState>) -> impl IntoResponse {
    run(&state, AdminCommand::StopMonitor).await
}

async fn fallback_config(State(state): State<AdminState>) -> impl IntoResponse {
    run(&state, AdminCommand::FallbackConfig).await
}

async fn update_fallback(
    State(state): State<AdminState>,
    axum::Json(update): axum::Json<FallbackUpdate>,
) -> impl IntoResponse {
    run(&state, AdminCommand::UpdateFallback(update)).await
}

async fn reload_config(State(state): State<AdminState>) -> impl IntoResponse {
    run(&state, AdminCommand::ReloadConfig).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeSession, pool_of};
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn two_member_router() -> (Arc<Pool>, Router) {
        let pool = pool_of(vec![
            ("a", FakeSession::answering(true, "a")),
            ("b", FakeSession::answering(true, "b")),
        ]);
        let router = build_admin_router(AdminState::new(pool.clone()));
        (pool, router)
    }

    async fn call(
        router: Router,
        method: &str,
        uri: &str,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, serde_json::Value) {
        let mut request = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(json) => {
                request = request.header("content-type", "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };
        let response = router.oneshot(request.body(body).unwrap()).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn pool_status_reports_members() {
        let (_pool, router) = two_member_router();
        let (status, json) = call(router, "GET", "/admin/pool", None).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "ok");
        assert_eq!(json["data"]["total"], 2);
        assert_eq!(json["data"]["available"], 2);
        assert_eq!(json["data"]["members"][0]["id"], "a");
    }

    #[tokio::test]
    async fn list_members_never_exposes_tokens() {
        let (_pool, router) = two_member_router();
        let (status, json) = call(router, "GET", "/admin/members", None).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["data"].as_array().unwrap().len(), 2);
        assert!(!json.to_string().contains("csrf-a"));
    }

    #[tokio::test]
    async fn add_then_duplicate_is_conflict() {
        let (pool, router) = two_member_router();
        let member = serde_json::json!({"id": "c", "csrf_token": "cc", "session_token": "sc"});

        let (status, json) = call(router.clone(), "POST", "/admin/members", Some(member.clone())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["message"], "Member 'c' added");
        assert_eq!(pool.status().await.total, 3);

        let (status, json) = call(router, "POST", "/admin/members", Some(member)).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(json["status"], "error");
    }

    #[tokio::test]
    async fn incomplete_member_is_bad_request() {
        let (_pool, router) = two_member_router();
        let member = serde_json::json!({"id": "c", "csrf_token": "  ", "session_token": "sc"});
        let (status, _) = call(router, "POST", "/admin/members", Some(member)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn removing_last_member_is_conflict() {
        let (pool, router) = two_member_router();
        let (status, _) = call(router.clone(), "DELETE", "/admin/members/a", None).await;
        assert_eq!(status, StatusCode::OK);

        let (status, json) = call(router, "DELETE", "/admin/members/b", None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(json["message"].as_str().is_some());
        assert_eq!(pool.status().await.total, 1);
    }

    #[tokio::test]
    async fn unknown_member_is_not_found() {
        let (_pool, router) = two_member_router();
        for uri in [
            "/admin/members/zz/enable",
            "/admin/members/zz/disable",
            "/admin/members/zz/reset",
            "/admin/members/zz/test",
        ] {
            let (status, json) = call(router.clone(), "POST", uri, None).await;
            assert_eq!(status, StatusCode::NOT_FOUND, "{uri}");
            assert_eq!(json["status"], "error");
        }
        let (status, _) = call(router, "GET", "/admin/export/zz", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn disable_then_enable() {
        let (pool, router) = two_member_router();
        let (status, _) = call(router.clone(), "POST", "/admin/members/a/disable", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(pool.status().await.available, 1);

        let (status, _) = call(router.clone(), "POST", "/admin/members/b/disable", None).await;
        assert_eq!(status, StatusCode::CONFLICT, "last enabled member stays enabled");

        let (status, _) = call(router, "POST", "/admin/members/a/enable", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(pool.status().await.available, 2);
    }

    #[tokio::test]
    async fn export_returns_credentials() {
        let (_pool, router) = two_member_router();
        let (status, json) = call(router.clone(), "GET", "/admin/export", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["data"]["tokens"][1]["session_token"], "sess-b");

        let (status, json) = call(router, "GET", "/admin/export/a", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["data"]["csrf_token"], "csrf-a");
    }

    #[tokio::test]
    async fn import_accepts_document_shape() {
        let (pool, router) = two_member_router();
        let body = serde_json::json!({"tokens": [
            {"id": "a", "csrf_token": "x", "session_token": "y"},
            {"id": "c", "csrf_token": "cc", "session_token": "sc"}
        ]});
        let (status, json) = call(router, "POST", "/admin/import", Some(body)).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["data"]["added"][0], "c");
        assert_eq!(json["data"]["skipped"][0], "a");
        assert_eq!(pool.status().await.total, 3);
    }

    #[tokio::test]
    async fn probe_routes_report_state() {
        let (_pool, router) = two_member_router();
        let (status, json) = call(router.clone(), "POST", "/admin/members/a/test", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["data"]["state"], "normal");
        assert_eq!(json["data"]["rate_limits"]["pro_remaining"], 10);

        let (status, json) = call(router, "POST", "/admin/test", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["data"]["succeeded"], 2);
        assert_eq!(json["data"]["failed"], 0);
    }

    #[tokio::test]
    async fn monitor_settings_round_trip() {
        let (pool, router) = two_member_router();
        let (status, json) = call(router.clone(), "GET", "/admin/monitor", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["data"]["running"], false);

        let (status, _) = call(
            router.clone(),
            "PUT",
            "/admin/monitor",
            Some(serde_json::json!({"interval": 0})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, json) = call(
            router.clone(),
            "PUT",
            "/admin/monitor",
            Some(serde_json::json!({"enable": true, "interval": 2})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["data"]["interval"], 2.0);
        assert!(pool.is_monitor_running());

        let (_, json) = call(router.clone(), "POST", "/admin/monitor/stop", None).await;
        assert_eq!(json["message"], "Monitor stopped");
        let (_, json) = call(router, "POST", "/admin/monitor/start", None).await;
        assert_eq!(json["message"], "Monitor started");
        pool.stop_monitor();
    }

    #[tokio::test]
    async fn fallback_settings_round_trip() {
        let (pool, router) = two_member_router();
        let (status, json) = call(
            router.clone(),
            "PUT",
            "/admin/fallback",
            Some(serde_json::json!({"fallback_to_auto": false})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["data"]["fallback_to_auto"], false);
        assert!(!pool.fallback_config().await.fallback_to_auto);

        let (_, json) = call(router, "GET", "/admin/fallback", None).await;
        assert_eq!(json["data"]["fallback_to_auto"], false);
    }

    #[tokio::test]
    async fn reload_without_document() {
        let (_pool, router) = two_member_router();
        let (status, json) = call(router, "POST", "/admin/reload", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["data"]["changed"], false);
    }
}
