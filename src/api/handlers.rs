//! HTTP request handlers

use super::auth::OwnerId;
use super::sse::sse_stream;
use super::types::{
    ConversationListResponse, ConversationResponse, CreateConversationRequest, ErrorResponse, HealthResponse,
    ListMessagesParams, MessageResponse, MessagesResponse, SendMessageRequest, SiblingsResponse, SwitchBranchRequest,
    SyncRequest, SyncStatusResponse, UpdateConversationRequest,
};
use super::{ws, AppState};
use crate::conversation::{ConversationUpdate, MessageQuery, SendMessage, SyncReport};
use crate::db::ConversationStatus;
use crate::error::CoreError;
use axum::{
    extract::{ws::WebSocketUpgrade, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/version", get(get_version))
        // Conversations
        .route("/api/conversations", get(list_conversations).post(create_conversation))
        .route("/api/conversations/:id", get(get_conversation).patch(update_conversation))
        .route("/api/conversations/:id/archive", post(archive_conversation))
        .route("/api/conversations/:id/unarchive", post(unarchive_conversation))
        .route("/api/conversations/:id/delete", post(delete_conversation))
        // Messages and branches
        .route("/api/conversations/:id/messages", get(list_messages).post(send_message))
        .route("/api/conversations/:id/switch-branch", post(switch_branch))
        .route("/api/messages/:id", get(get_message))
        .route("/api/messages/:id/siblings", get(get_siblings))
        // Offline sync
        .route("/api/conversations/:id/sync", post(sync_messages))
        .route("/api/conversations/:id/sync/status", get(sync_status))
        // Live transports
        .route("/api/conversations/:id/events", get(stream_events))
        .route("/api/conversations/:id/ws", get(open_socket))
        .with_state(state)
}

// ============================================================
// Service Info
// ============================================================

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

async fn get_version() -> &'static str {
    concat!("branchline ", env!("CARGO_PKG_VERSION"))
}

// ============================================================
// Conversations
// ============================================================

async fn list_conversations(
    State(state): State<AppState>,
    OwnerId(owner): OwnerId,
) -> Result<Json<ConversationListResponse>, AppError> {
    let conversations = state.service.list_conversations(&owner).await?;
    Ok(Json(ConversationListResponse { conversations }))
}

async fn create_conversation(
    State(state): State<AppState>,
    OwnerId(owner): OwnerId,
    body: Option<Json<CreateConversationRequest>>,
) -> Result<(StatusCode, Json<ConversationResponse>), AppError> {
    let Json(req) = body.unwrap_or_default();
    let conversation = state.service.create_conversation(&owner, &req.title).await?;
    Ok((StatusCode::CREATED, Json(ConversationResponse { conversation })))
}

async fn get_conversation(
    State(state): State<AppState>,
    OwnerId(owner): OwnerId,
    Path(id): Path<String>,
) -> Result<Json<ConversationResponse>, AppError> {
    let conversation = state.service.get_conversation(&owner, &id).await?;
    Ok(Json(ConversationResponse { conversation }))
}

async fn update_conversation(
    State(state): State<AppState>,
    OwnerId(owner): OwnerId,
    Path(id): Path<String>,
    Json(req): Json<UpdateConversationRequest>,
) -> Result<Json<ConversationResponse>, AppError> {
    let update = ConversationUpdate {
        title: req.title,
        status: req.status,
    };
    let conversation = state.service.update_conversation(&owner, &id, update).await?;
    Ok(Json(ConversationResponse { conversation }))
}

async fn archive_conversation(
    State(state): State<AppState>,
    OwnerId(owner): OwnerId,
    Path(id): Path<String>,
) -> Result<Json<ConversationResponse>, AppError> {
    set_status(&state, &owner, &id, ConversationStatus::Archived).await
}

async fn unarchive_conversation(
    State(state): State<AppState>,
    OwnerId(owner): OwnerId,
    Path(id): Path<String>,
) -> Result<Json<ConversationResponse>, AppError> {
    set_status(&state, &owner, &id, ConversationStatus::Active).await
}

async fn delete_conversation(
    State(state): State<AppState>,
    OwnerId(owner): OwnerId,
    Path(id): Path<String>,
) -> Result<Json<ConversationResponse>, AppError> {
    set_status(&state, &owner, &id, ConversationStatus::Deleted).await
}

async fn set_status(
    state: &AppState,
    owner: &str,
    id: &str,
    status: ConversationStatus,
) -> Result<Json<ConversationResponse>, AppError> {
    let conversation = state.service.set_status(owner, id, status).await?;
    Ok(Json(ConversationResponse { conversation }))
}

// ============================================================
// Messages and Branches
// ============================================================

async fn list_messages(
    State(state): State<AppState>,
    OwnerId(owner): OwnerId,
    Path(id): Path<String>,
    Query(params): Query<ListMessagesParams>,
) -> Result<Json<MessagesResponse>, AppError> {
    let mut query = MessageQuery {
        all: params.all,
        ..MessageQuery::default()
    };
    if let Some(limit) = params.limit {
        query.limit = limit;
    }

    let conversation = state.service.get_conversation(&owner, &id).await?;
    let messages = state.service.list_messages(&owner, &id, query).await?;
    Ok(Json(MessagesResponse {
        conversation_id: conversation.id,
        tip_message_id: conversation.tip_message_id,
        messages,
    }))
}

async fn send_message(
    State(state): State<AppState>,
    OwnerId(owner): OwnerId,
    Path(id): Path<String>,
    Json(req): Json<SendMessageRequest>,
) -> Result<(StatusCode, Json<MessageResponse>), AppError> {
    let message = state
        .service
        .send_message(
            &owner,
            &id,
            SendMessage {
                contents: req.contents,
                previous_id: req.previous_id,
                local_id: req.local_id,
            },
        )
        .await?;

    // The reply arrives later over the live transports
    Ok((StatusCode::ACCEPTED, Json(MessageResponse { message })))
}

async fn switch_branch(
    State(state): State<AppState>,
    OwnerId(owner): OwnerId,
    Path(id): Path<String>,
    Json(req): Json<SwitchBranchRequest>,
) -> Result<Json<MessagesResponse>, AppError> {
    let messages = state
        .service
        .switch_branch(&owner, &id, &req.tip_message_id)
        .await?;
    Ok(Json(MessagesResponse {
        conversation_id: id,
        tip_message_id: Some(req.tip_message_id),
        messages,
    }))
}

async fn get_message(
    State(state): State<AppState>,
    OwnerId(owner): OwnerId,
    Path(id): Path<String>,
) -> Result<Json<MessageResponse>, AppError> {
    let message = state.service.get_message(&owner, &id).await?;
    Ok(Json(MessageResponse { message }))
}

async fn get_siblings(
    State(state): State<AppState>,
    OwnerId(owner): OwnerId,
    Path(id): Path<String>,
) -> Result<Json<SiblingsResponse>, AppError> {
    let siblings = state.service.siblings(&owner, &id).await?;
    Ok(Json(SiblingsResponse {
        message_id: id,
        siblings,
    }))
}

// ============================================================
// Offline Sync
// ============================================================

async fn sync_messages(
    State(state): State<AppState>,
    OwnerId(owner): OwnerId,
    Path(id): Path<String>,
    Json(req): Json<SyncRequest>,
) -> Result<Json<SyncReport>, AppError> {
    let report = state.service.sync(&owner, &id, &req.messages).await?;
    Ok(Json(report))
}

async fn sync_status(
    State(state): State<AppState>,
    OwnerId(owner): OwnerId,
    Path(id): Path<String>,
) -> Result<Json<SyncStatusResponse>, AppError> {
    let counts = state.service.sync_status(&owner, &id).await?;
    Ok(Json(SyncStatusResponse {
        conversation_id: id,
        counts,
    }))
}

// ============================================================
// Live Transports
// ============================================================

async fn stream_events(
    State(state): State<AppState>,
    OwnerId(owner): OwnerId,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    state.service.active_conversation(&owner, &id).await?;
    tracing::debug!(conv_id = %id, "SSE stream opened");
    Ok(sse_stream(state.service.broadcaster(), &id, state.keepalive))
}

async fn open_socket(
    State(state): State<AppState>,
    OwnerId(owner): OwnerId,
    Path(id): Path<String>,
    upgrade: WebSocketUpgrade,
) -> Result<Response, AppError> {
    state.service.active_conversation(&owner, &id).await?;
    Ok(upgrade.on_upgrade(move |socket| ws::serve_socket(socket, state, owner, id)))
}

// ============================================================
// Error Handling
// ============================================================

#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    Unauthorized(String),
    NotFound(String),
    Conflict(String),
    Internal(String),
}

impl From<CoreError> for AppError {
    fn from(e: CoreError) -> Self {
        match e {
            CoreError::NotFound(msg) => AppError::NotFound(msg),
            CoreError::Validation(msg) => AppError::BadRequest(msg),
            CoreError::Conflict(msg) => AppError::Conflict(msg),
            CoreError::Internal(msg) => {
                tracing::error!(error = %msg, "Request failed");
                AppError::Internal("internal error".to_string())
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = Json(ErrorResponse::new(message));
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::Broadcaster;
    use crate::conversation::{ConversationService, DatabaseRepository, TipPolicy};
    use crate::db::Database;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use serde_json::{json, Value};
    use std::sync::Arc;
    use std::time::Duration;
    use tower::ServiceExt;

    fn app() -> Router {
        let repo = Arc::new(DatabaseRepository::new(Database::open_in_memory().unwrap()));
        let service = ConversationService::new(repo, Broadcaster::new(16), TipPolicy::ExtendTip);
        create_router(AppState::new(service, Duration::from_secs(30)))
    }

    async fn call(app: &Router, method: &str, uri: &str, owner: Option<&str>, body: Option<Value>) -> (StatusCode, Value) {
        let mut request = Request::builder().method(method).uri(uri);
        if let Some(owner) = owner {
            request = request.header("x-user-id", owner);
        }
        let request = match body {
            Some(body) => request
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => request.body(Body::empty()).unwrap(),
        };

        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    async fn new_conversation(app: &Router) -> String {
        let (status, body) = call(app, "POST", "/api/conversations", Some("alice"), Some(json!({"title": "t"}))).await;
        assert_eq!(status, StatusCode::CREATED);
        body["conversation"]["id"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn missing_owner_header_is_unauthorized() {
        let app = app();
        let (status, body) = call(&app, "GET", "/api/conversations", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(body["error"].as_str().unwrap().contains("x-user-id"));

        let (status, _) = call(&app, "GET", "/health", None, None).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn send_switch_and_siblings_over_http() {
        let app = app();
        let conv = new_conversation(&app).await;
        let messages = format!("/api/conversations/{conv}/messages");

        let (status, a) = call(&app, "POST", &messages, Some("alice"), Some(json!({"contents": "A"}))).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        let a_id = a["message"]["id"].as_str().unwrap().to_string();

        let (_, b) = call(&app, "POST", &messages, Some("alice"), Some(json!({"contents": "B"}))).await;
        let b_id = b["message"]["id"].as_str().unwrap().to_string();

        let (status, switched) = call(
            &app,
            "POST",
            &format!("/api/conversations/{conv}/switch-branch"),
            Some("alice"),
            Some(json!({"tip_message_id": a_id})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(switched["messages"].as_array().unwrap().len(), 1);

        let (_, d) = call(&app, "POST", &messages, Some("alice"), Some(json!({"contents": "D"}))).await;
        let d_id = d["message"]["id"].as_str().unwrap().to_string();
        assert_eq!(d["message"]["previous_id"], a_id.as_str());

        let (status, siblings) = call(&app, "GET", &format!("/api/messages/{d_id}/siblings"), Some("alice"), None).await;
        assert_eq!(status, StatusCode::OK);
        let ids: Vec<_> = siblings["siblings"]
            .as_array()
            .unwrap()
            .iter()
            .map(|m| m["id"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(ids, vec![b_id, d_id.clone()]);

        let (_, listed) = call(&app, "GET", &messages, Some("alice"), None).await;
        assert_eq!(listed["tip_message_id"], d_id.as_str());
        assert_eq!(listed["messages"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn error_statuses() {
        let app = app();
        let conv = new_conversation(&app).await;

        let (status, _) = call(&app, "GET", &format!("/api/conversations/{conv}"), Some("mallory"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = call(
            &app,
            "POST",
            &format!("/api/conversations/{conv}/messages"),
            Some("alice"),
            Some(json!({"contents": "  "})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let messages = format!("/api/conversations/{conv}/messages");
        call(&app, "POST", &messages, Some("alice"), Some(json!({"contents": "x", "local_id": "l1"}))).await;
        let (status, _) = call(&app, "POST", &messages, Some("alice"), Some(json!({"contents": "y", "local_id": "l1"}))).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, _) = call(&app, "POST", &format!("/api/conversations/{conv}/archive"), Some("alice"), None).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = call(&app, "GET", &format!("/api/conversations/{conv}/events"), Some("alice"), None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn sync_and_status_over_http() {
        let app = app();
        let conv = new_conversation(&app).await;
        let batch = json!({"messages": [
            {"local_id": "l1", "role": "user", "contents": "offline one"},
            {"local_id": "l2", "previous_id": "l1", "role": "user", "contents": "offline two"}
        ]});

        let (status, report) = call(&app, "POST", &format!("/api/conversations/{conv}/sync"), Some("alice"), Some(batch.clone())).await;
        assert_eq!(status, StatusCode::OK);
        let statuses: Vec<_> = report["outcomes"].as_array().unwrap().iter().map(|o| o["status"].clone()).collect();
        assert_eq!(statuses, vec![json!("created"), json!("created")]);

        let (_, again) = call(&app, "POST", &format!("/api/conversations/{conv}/sync"), Some("alice"), Some(batch)).await;
        assert!(again["outcomes"]
            .as_array()
            .unwrap()
            .iter()
            .all(|o| o["status"] == "already_synced"));

        let (status, counts) = call(&app, "GET", &format!("/api/conversations/{conv}/sync/status"), Some("alice"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(counts["synced"], 2);
        assert_eq!(counts["conflict"], 0);
    }

    #[tokio::test]
    async fn single_message_and_full_listing() {
        let app = app();
        let conv = new_conversation(&app).await;
        let messages = format!("/api/conversations/{conv}/messages");

        let (_, a) = call(&app, "POST", &messages, Some("alice"), Some(json!({"contents": "A"}))).await;
        let a_id = a["message"]["id"].as_str().unwrap().to_string();
        call(&app, "POST", &messages, Some("alice"), Some(json!({"contents": "B"}))).await;
        call(&app, "POST", &messages, Some("alice"), Some(json!({"contents": "C", "previous_id": a_id}))).await;

        let (status, fetched) = call(&app, "GET", &format!("/api/messages/{a_id}"), Some("alice"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(fetched["message"]["contents"], "A");
        let (status, _) = call(&app, "GET", &format!("/api/messages/{a_id}"), Some("mallory"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (_, chain) = call(&app, "GET", &messages, Some("alice"), None).await;
        assert_eq!(chain["messages"].as_array().unwrap().len(), 2);
        let (_, all) = call(&app, "GET", &format!("{messages}?all=true"), Some("alice"), None).await;
        assert_eq!(all["messages"].as_array().unwrap().len(), 3);
        let (_, limited) = call(&app, "GET", &format!("{messages}?all=true&limit=1"), Some("alice"), None).await;
        assert_eq!(limited["messages"][0]["id"], a_id.as_str());
        assert_eq!(limited["messages"].as_array().unwrap().len(), 1);

        let (status, _) = call(&app, "GET", &format!("{messages}?all=true&limit=0"), Some("alice"), None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn patch_updates_title_and_status() {
        let app = app();
        let conv = new_conversation(&app).await;
        let uri = format!("/api/conversations/{conv}");

        let (status, body) = call(&app, "PATCH", &uri, Some("alice"), Some(json!({"title": "renamed"}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["conversation"]["title"], "renamed");
        assert_eq!(body["conversation"]["status"], "active");

        let (_, body) = call(&app, "PATCH", &uri, Some("alice"), Some(json!({"status": "archived"}))).await;
        assert_eq!(body["conversation"]["status"], "archived");
        assert_eq!(body["conversation"]["title"], "renamed");

        let (status, _) = call(&app, "PATCH", &uri, Some("alice"), Some(json!({"status": "deleted"}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _) = call(&app, "PATCH", &uri, Some("mallory"), Some(json!({"title": "x"}))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn version_names_the_service() {
        let app = app();
        let response = app
            .oneshot(Request::builder().uri("/version").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert!(String::from_utf8_lossy(&bytes).starts_with("branchline "));
    }
}
