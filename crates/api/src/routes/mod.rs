mod realtime;

use axum::extract::{Extension, Path, State};
use axum::{
    Json, Router,
    http::{StatusCode, header},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, patch, post, put},
};
use haggle_domain::{
    chat::{ConversationSummary, MessageKind, SendMessageInput, SendOfferInput},
    conversation::{Conversation, ConversationStatus, Message},
    error::DomainError,
    identity::ActorIdentity,
    offer::{OfferResolution, OfferResponse},
};
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::middleware::AuthContext;
use crate::{
    error::ApiError, middleware as app_middleware, observability, state::AppState, validation,
};

pub fn router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/v1/chats", post(create_or_get_chat).get(list_my_chats))
        .route("/v1/chats/unread-count", get(unread_count))
        .route("/v1/chats/ws", get(realtime::chat_socket))
        .route("/v1/chats/:conversation_id", get(get_chat))
        .route("/v1/chats/:conversation_id/messages", post(send_message))
        .route("/v1/chats/:conversation_id/read", put(mark_read))
        .route("/v1/chats/:conversation_id/offer", post(send_offer))
        .route(
            "/v1/chats/:conversation_id/offer/:message_id",
            patch(respond_to_offer),
        )
        .route("/v1/chats/:conversation_id/status", patch(set_status))
        .route_layer(middleware::from_fn(app_middleware::require_auth_middleware));

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .merge(protected)
        .layer(middleware::from_fn(app_middleware::metrics_layer))
        .layer(app_middleware::timeout_layer())
        .layer(app_middleware::trace_layer())
        .layer(app_middleware::set_request_id_layer())
        .layer(app_middleware::propagate_request_id_layer())
        .layer(middleware::from_fn_with_state(
            state.clone(),
            app_middleware::auth_middleware,
        ))
        .layer(middleware::from_fn(
            app_middleware::correlation_id_middleware,
        ))
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    environment: String,
    online_users: usize,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        environment: state.config.app_env.clone(),
        online_users: state.presence.online_count().await,
    })
}

async fn metrics() -> Response {
    match observability::render_metrics() {
        Some(body) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            "metrics recorder not installed",
        )
            .into_response(),
    }
}

#[derive(Debug, Deserialize, Validate)]
struct CreateChatRequest {
    #[validate(length(min = 1, max = 128))]
    listing_id: String,
}

async fn create_or_get_chat(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Json(payload): Json<CreateChatRequest>,
) -> Result<Response, ApiError> {
    validation::validate(&payload)?;
    let actor = actor_identity(&auth)?;
    let outcome = state
        .chat
        .create_or_get_conversation(&actor, &payload.listing_id)
        .await
        .map_err(map_domain_error)?;

    let status = if outcome.created {
        tracing::info!(
            conversation_id = %outcome.conversation.conversation_id,
            listing_id = %outcome.conversation.listing_id,
            "conversation created"
        );
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(outcome.conversation)).into_response())
}

async fn list_my_chats(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
) -> Result<Json<Vec<ConversationSummary>>, ApiError> {
    let actor = actor_identity(&auth)?;
    let chats = state
        .chat
        .get_my_chats(&actor)
        .await
        .map_err(map_domain_error)?;
    Ok(Json(chats))
}

#[derive(Serialize)]
struct UnreadCountResponse {
    unread_count: u64,
}

async fn unread_count(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
) -> Result<Json<UnreadCountResponse>, ApiError> {
    let actor = actor_identity(&auth)?;
    let unread_count = state
        .chat
        .get_unread_count(&actor)
        .await
        .map_err(map_domain_error)?;
    Ok(Json(UnreadCountResponse { unread_count }))
}

async fn get_chat(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
    Extension(auth): Extension<AuthContext>,
) -> Result<Json<Conversation>, ApiError> {
    let actor = actor_identity(&auth)?;
    let conversation = state
        .chat
        .get_chat_by_id(&actor, &conversation_id)
        .await
        .map_err(map_domain_error)?;
    Ok(Json(conversation))
}

#[derive(Debug, Deserialize, Validate)]
struct SendMessageRequest {
    #[validate(length(min = 1))]
    content: String,
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    #[validate(length(max = 2048))]
    image_url: Option<String>,
    #[serde(default)]
    #[validate(length(max = 128))]
    listing_id: Option<String>,
}

async fn send_message(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
    Extension(auth): Extension<AuthContext>,
    Json(payload): Json<SendMessageRequest>,
) -> Result<Response, ApiError> {
    validation::validate(&payload)?;
    let actor = actor_identity(&auth)?;
    let kind =
        MessageKind::parse(payload.kind.as_deref(), payload.image_url).map_err(map_domain_error)?;
    let message = state
        .chat
        .send_message(
            &actor,
            SendMessageInput {
                conversation_id,
                listing_id: payload.listing_id,
                content: payload.content,
                kind,
            },
        )
        .await
        .map_err(map_domain_error)?;
    tracing::debug!(
        message_id = %message.message_id,
        message_type = message.payload.kind(),
        "message sent"
    );
    Ok((StatusCode::CREATED, Json(message)).into_response())
}

#[derive(Serialize)]
struct MarkReadResponse {
    conversation_id: String,
    unread_count: u64,
}

async fn mark_read(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
    Extension(auth): Extension<AuthContext>,
) -> Result<Json<MarkReadResponse>, ApiError> {
    let actor = actor_identity(&auth)?;
    let conversation = state
        .chat
        .mark_read(&actor, &conversation_id)
        .await
        .map_err(map_domain_error)?;
    Ok(Json(MarkReadResponse {
        unread_count: conversation.unread_for(&actor.user_id),
        conversation_id: conversation.conversation_id,
    }))
}

#[derive(Debug, Deserialize, Validate)]
struct SendOfferRequest {
    offer_price: f64,
    #[serde(default)]
    #[validate(length(max = 200))]
    message: Option<String>,
}

async fn send_offer(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
    Extension(auth): Extension<AuthContext>,
    Json(payload): Json<SendOfferRequest>,
) -> Result<(StatusCode, Json<Message>), ApiError> {
    validation::validate(&payload)?;
    let actor = actor_identity(&auth)?;
    let message = state
        .chat
        .send_offer(
            &actor,
            &conversation_id,
            SendOfferInput {
                offer_price: payload.offer_price,
                note: payload.message,
            },
        )
        .await
        .map_err(map_domain_error)?;
    Ok((StatusCode::CREATED, Json(message)))
}

#[derive(Debug, Deserialize, Validate)]
struct RespondOfferRequest {
    #[validate(length(min = 1, max = 32))]
    status: String,
    #[serde(default)]
    counter_offer: Option<f64>,
}

async fn respond_to_offer(
    State(state): State<AppState>,
    Path((conversation_id, message_id)): Path<(String, String)>,
    Extension(auth): Extension<AuthContext>,
    Json(payload): Json<RespondOfferRequest>,
) -> Result<Json<OfferResolution>, ApiError> {
    validation::validate(&payload)?;
    let actor = actor_identity(&auth)?;
    let response =
        OfferResponse::parse(&payload.status, payload.counter_offer).map_err(map_domain_error)?;
    let resolution = state
        .chat
        .respond_to_offer(&actor, &conversation_id, &message_id, response)
        .await
        .map_err(map_domain_error)?;
    tracing::info!(
        conversation_id = %conversation_id,
        offer_message_id = %message_id,
        status = payload.status.as_str(),
        "offer resolved"
    );
    Ok(Json(resolution))
}

#[derive(Debug, Deserialize, Validate)]
struct SetStatusRequest {
    #[validate(length(min = 1, max = 32))]
    status: String,
}

async fn set_status(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
    Extension(auth): Extension<AuthContext>,
    Json(payload): Json<SetStatusRequest>,
) -> Result<Json<Conversation>, ApiError> {
    validation::validate(&payload)?;
    let actor = actor_identity(&auth)?;
    let status = ConversationStatus::parse(&payload.status).ok_or_else(|| {
        ApiError::Validation("status must be active, archived or blocked".into())
    })?;
    let conversation = state
        .chat
        .set_status(&actor, &conversation_id, status)
        .await
        .map_err(map_domain_error)?;
    tracing::info!(
        conversation_id = %conversation_id,
        status = conversation.status.as_str(),
        "conversation status set"
    );
    Ok(Json(conversation))
}

fn actor_identity(auth: &AuthContext) -> Result<ActorIdentity, ApiError> {
    let user_id = auth
        .user_id
        .as_ref()
        .filter(|user_id| !user_id.trim().is_empty())
        .ok_or(ApiError::Unauthorized)?;
    Ok(ActorIdentity::with_user_id(user_id.as_str()))
}

fn map_domain_error(err: DomainError) -> ApiError {
    match err {
        DomainError::Validation(message) => ApiError::Validation(message),
        DomainError::Forbidden(message) => ApiError::Forbidden(message),
        DomainError::NotFound(message) => ApiError::NotFound(message),
        DomainError::Conflict(message) => ApiError::Conflict(message),
        DomainError::Dependency(message) => {
            tracing::warn!(error = %message, "listing dependency failure");
            ApiError::Dependency(message)
        }
    }
}
