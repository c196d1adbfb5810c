//! HTTP surface and server-sent event stream.
//! Identity comes from the `X-User-Id` header, standing in for an auth layer.

use std::convert::Infallible;
use std::sync::Arc;

use actix_web::http::header::{CACHE_CONTROL, CONTENT_TYPE};
use actix_web::http::StatusCode;
use actix_web::{web, HttpRequest, HttpResponse, ResponseError};
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;

use crate::broadcast::{ConnectionRegistry, EventReceiver};
use crate::error::SendError;
use crate::fanout::{FanoutOrchestrator, SendMessageRequest};
use crate::metrics::MetricsRegistry;
use crate::protocol::PushEvent;
use crate::store::{MessageStore, StoreError};
use crate::translate::cache::TranslationCache;

pub const USER_HEADER: &str = "X-User-Id";
const DEFAULT_HISTORY_LIMIT: usize = 50;

pub struct AppState {
    pub orchestrator: Arc<FanoutOrchestrator>,
    pub registry: Arc<ConnectionRegistry>,
    pub store: Arc<dyn MessageStore>,
    pub cache: Arc<TranslationCache>,
    pub metrics: Arc<MetricsRegistry>,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("missing X-User-Id header")]
    Unauthorized,
    #[error("{0}")]
    NotFound(String),
    #[error(transparent)]
    Send(#[from] SendError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::NotFound(_) | ApiError::Store(StoreError::ConversationNotFound(_)) => {
                StatusCode::NOT_FOUND
            }
            ApiError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Send(e) => {
                StatusCode::from_u16(e.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
            }
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(json!({ "error": self.to_string() }))
    }
}

fn user_id(req: &HttpRequest) -> Result<String, ApiError> {
    req.headers()
        .get(USER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or(ApiError::Unauthorized)
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/events", web::get().to(events))
        .route("/stats", web::get().to(stats))
        .service(
            web::resource("/conversations/{id}/messages")
                .route(web::post().to(send_message))
                .route(web::get().to(history)),
        )
        .route("/conversations/{id}/typing", web::post().to(typing))
        .service(
            web::resource("/connections/{cid}/subscriptions/{conversation_id}")
                .route(web::post().to(subscribe))
                .route(web::delete().to(unsubscribe)),
        );
}

#[derive(Deserialize)]
pub struct EventsQuery {
    /// Comma-separated conversation ids.
    pub conversations: Option<String>,
}

/// Removes the connection when the response stream is dropped.
struct ConnectionGuard {
    registry: Arc<ConnectionRegistry>,
    connection_id: String,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.registry.remove_connection(&self.connection_id);
    }
}

async fn events(
    req: HttpRequest,
    state: web::Data<AppState>,
    query: web::Query<EventsQuery>,
) -> Result<HttpResponse, ApiError> {
    let user = user_id(&req)?;
    let (connection_id, rx) = state.registry.open(&user);
    for conversation_id in query
        .conversations
        .as_deref()
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
    {
        state.registry.subscribe(conversation_id, &connection_id);
    }

    let guard = ConnectionGuard {
        registry: Arc::clone(&state.registry),
        connection_id,
    };
    let stream = futures_util::stream::unfold(
        (rx, guard),
        |(mut rx, guard): (EventReceiver, ConnectionGuard)| async move {
            let event = rx.recv().await?;
            let frame = web::Bytes::from(event.to_sse_frame());
            Some((Ok::<_, Infallible>(frame), (rx, guard)))
        },
    );

    Ok(HttpResponse::Ok()
        .insert_header((CONTENT_TYPE, "text/event-stream"))
        .insert_header((CACHE_CONTROL, "no-cache"))
        .streaming(stream))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendBody {
    pub content: String,
    pub source_language: Option<String>,
}

async fn send_message(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<String>,
    body: web::Json<SendBody>,
) -> Result<HttpResponse, ApiError> {
    let sender_id = user_id(&req)?;
    let body = body.into_inner();
    let (message, report) = state
        .orchestrator
        .send_message(SendMessageRequest {
            conversation_id: path.into_inner(),
            sender_id,
            content: body.content,
            source_language: body.source_language,
        })
        .await?;
    Ok(HttpResponse::Created().json(json!({ "message": message, "report": report })))
}

#[derive(Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<usize>,
}

async fn history(
    state: web::Data<AppState>,
    path: web::Path<String>,
    query: web::Query<HistoryQuery>,
) -> Result<HttpResponse, ApiError> {
    let limit = query.limit.unwrap_or(DEFAULT_HISTORY_LIMIT);
    let messages = state.store.history(&path.into_inner(), limit).await?;
    Ok(HttpResponse::Ok().json(messages))
}

async fn typing(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    let user = user_id(&req)?;
    let conversation_id = path.into_inner();
    let report = state
        .registry
        .send_to_conversation(&conversation_id, PushEvent::typing(&conversation_id, &user));
    Ok(HttpResponse::Accepted().json(report))
}

/// The caller must own the connection.
fn owned_connection(state: &AppState, user: &str, connection_id: &str) -> Result<(), ApiError> {
    match state.registry.owner_of(connection_id) {
        Some(owner) if owner == user => Ok(()),
        _ => Err(ApiError::NotFound(format!("connection not found: {connection_id}"))),
    }
}

async fn subscribe(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<(String, String)>,
) -> Result<HttpResponse, ApiError> {
    let user = user_id(&req)?;
    let (connection_id, conversation_id) = path.into_inner();
    owned_connection(&state, &user, &connection_id)?;
    if !state.registry.subscribe(&conversation_id, &connection_id) {
        return Err(ApiError::NotFound(format!("connection not found: {connection_id}")));
    }
    Ok(HttpResponse::NoContent().finish())
}

async fn unsubscribe(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<(String, String)>,
) -> Result<HttpResponse, ApiError> {
    let user = user_id(&req)?;
    let (connection_id, conversation_id) = path.into_inner();
    owned_connection(&state, &user, &connection_id)?;
    if !state.registry.unsubscribe(&conversation_id, &connection_id) {
        return Err(ApiError::NotFound(format!(
            "connection {connection_id} is not subscribed to {conversation_id}"
        )));
    }
    Ok(HttpResponse::NoContent().finish())
}

async fn stats(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "cache": state.cache.stats(),
        "connections": state.registry.connection_count(),
        "latency": state.metrics.summary(),
    }))
}
