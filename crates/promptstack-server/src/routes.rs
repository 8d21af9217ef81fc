//! HTTP routes.

use crate::{state::AppState, ws};
use axum::{
    extract::{Path, State, WebSocketUpgrade},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use promptstack_core::CoreError;
use serde::{Deserialize, Serialize};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{debug, warn};

/// Create the router with all routes.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/api/stacks", get(stack_list))
        .route("/api/chats", post(chat_create))
        .route("/api/ws/chat/{chat_id}", get(chat_socket))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

// =============================================================================
// Response types
// =============================================================================

#[derive(Debug, Serialize)]
pub(crate) struct ApiError {
    error: String,
    code: String,
}

impl ApiError {
    fn new(error: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            code: code.into(),
        }
    }

    fn not_found(msg: impl Into<String>) -> (StatusCode, Json<Self>) {
        (StatusCode::NOT_FOUND, Json(Self::new(msg, "NOT_FOUND")))
    }

    fn bad_request(msg: impl Into<String>) -> (StatusCode, Json<Self>) {
        (StatusCode::BAD_REQUEST, Json(Self::new(msg, "BAD_REQUEST")))
    }

    fn internal(msg: impl Into<String>) -> (StatusCode, Json<Self>) {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(Self::new(msg, "INTERNAL_ERROR")),
        )
    }

    fn from_core(err: CoreError) -> (StatusCode, Json<Self>) {
        match err {
            CoreError::UnknownStack(_) => Self::bad_request(err.to_string()),
            CoreError::ProjectNotFound(_) | CoreError::ChatNotFound(_) => {
                Self::not_found(err.to_string())
            }
            other => {
                warn!(error = %other, "Request failed");
                Self::internal(other.to_string())
            }
        }
    }
}

type ApiResult<T> = Result<T, (StatusCode, Json<ApiError>)>;

// =============================================================================
// Handlers
// =============================================================================

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "healthy": true,
        "version": env!("CARGO_PKG_VERSION"),
        "projects": state.registry.len().await,
    }))
}

#[derive(Debug, Serialize)]
struct StackResponse {
    id: String,
    title: String,
    description: String,
    available: usize,
}

async fn stack_list(State(state): State<AppState>) -> impl IntoResponse {
    let pool = state.engine.pool();
    let stacks: Vec<StackResponse> = state
        .engine
        .catalog()
        .all()
        .iter()
        .map(|t| StackResponse {
            id: t.id.clone(),
            title: t.title.clone(),
            description: t.description.clone(),
            available: pool.available(&t.id),
        })
        .collect();
    Json(stacks)
}

#[derive(Debug, Deserialize)]
struct CreateChatRequest {
    stack_id: String,
    #[serde(default)]
    seed_prompt: Option<String>,
}

#[derive(Debug, Serialize)]
struct CreateChatResponse {
    project_id: String,
    project_name: String,
    chat_id: String,
    chat_name: String,
}

async fn chat_create(
    State(state): State<AppState>,
    Json(req): Json<CreateChatRequest>,
) -> ApiResult<impl IntoResponse> {
    let (project, chat) = state
        .engine
        .create_chat(&req.stack_id, req.seed_prompt.as_deref())
        .await
        .map_err(ApiError::from_core)?;
    Ok((
        StatusCode::CREATED,
        Json(CreateChatResponse {
            project_id: project.project_id,
            project_name: project.name,
            chat_id: chat.chat_id,
            chat_name: chat.name,
        }),
    ))
}

/// Resolve chat to project before upgrading so unknown chats get a plain 404.
async fn chat_socket(
    State(state): State<AppState>,
    Path(chat_id): Path<String>,
    upgrade: WebSocketUpgrade,
) -> ApiResult<Response> {
    let chat = state
        .engine
        .chats()
        .get_chat(&chat_id)
        .await
        .map_err(ApiError::from_core)?;
    let orchestrator = state
        .registry
        .get_or_create(&chat.project_id)
        .await
        .map_err(ApiError::from_core)?;
    debug!(chat_id = %chat_id, project_id = %chat.project_id, "Upgrading chat socket");
    Ok(upgrade.on_upgrade(move |socket| ws::handle_socket(socket, orchestrator, chat_id)))
}
