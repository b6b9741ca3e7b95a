use crate::{
    auth::{self, Identity},
    config::{Config, ProviderKind},
    db::{self, DbPool},
    devices::DeviceAddress,
    dispatch::Dispatcher,
    entitlements::{DailyQuota, Entitlements, Unlimited},
    error::DispatchError,
    notify::{LogProvider, NotificationGateway, PushProvider, WebhookProvider},
    presence::PresenceRegistry,
    ws,
};
use anyhow::Result;
use axum::{
    async_trait,
    extract::{rejection::JsonRejection, Extension, FromRequest, Path, Query, State},
    http::{Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use delivery_api::{
    Conversation, ConversationSummary, CreateConversationRequest, DeregisterDeviceRequest,
    ErrorBody, ErrorCode, MarkReadRequest, MarkReadResponse, MessageRecord, RegisterDeviceRequest,
    SendRequest, SendResponse, UnreadCount,
};
use serde::Deserialize;
use std::{net::SocketAddr, sync::Arc};
use tracing::info;
use uuid::Uuid;

#[derive(Clone)]
pub struct AppState {
    pub pool: DbPool,
    pub dispatcher: Arc<Dispatcher>,
    pub config: Config,
}

impl AppState {
    /// Build state with the push provider named in the configuration.
    pub async fn new(config: Config) -> Result<Self> {
        let provider: Arc<dyn PushProvider> = match config.notifications.provider {
            ProviderKind::Log => Arc::new(LogProvider),
            ProviderKind::Webhook => {
                let endpoint = config.notifications.endpoint.clone().unwrap_or_default();
                Arc::new(WebhookProvider::new(endpoint)?)
            }
        };
        Self::with_provider(config, provider).await
    }

    pub async fn with_provider(config: Config, provider: Arc<dyn PushProvider>) -> Result<Self> {
        tokio::fs::create_dir_all(&config.data_dir).await?;
        let pool = db::open_pool(config.database_path())?;
        let gateway = Arc::new(NotificationGateway::new(
            pool.clone(),
            provider,
            config.notifications.preview_chars,
        ));
        let entitlements: Arc<dyn Entitlements> = match config.entitlements.daily_limit {
            Some(limit) => Arc::new(DailyQuota::new(
                pool.clone(),
                limit,
                config.entitlements.unlimited_users.clone(),
            )),
            None => Arc::new(Unlimited),
        };
        let dispatcher = Arc::new(Dispatcher::new(
            pool.clone(),
            Arc::new(PresenceRegistry::new()),
            gateway,
            entitlements,
        ));
        Ok(Self {
            pool,
            dispatcher,
            config,
        })
    }
}

/// Build the HTTP application router.
pub fn build_router(state: AppState) -> Router {
    let protected = Router::new()
        .route(
            "/api/conversations",
            get(list_conversations).post(open_conversation),
        )
        .route(
            "/api/conversations/:id",
            axum::routing::delete(delete_conversation),
        )
        .route("/api/conversations/:id/messages", get(history))
        .route("/api/conversations/:id/unread", get(unread))
        .route("/api/messages", post(send_message))
        .route("/api/read", post(mark_read))
        .route(
            "/api/devices",
            get(list_devices)
                .post(register_device)
                .delete(deregister_device),
        )
        .route("/ws", get(ws::ws_handler))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));
    Router::new()
        .route("/api/health", get(health))
        .merge(protected)
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(ErrorBody::new(ErrorCode::Unauthorized, "missing or invalid token")),
    )
        .into_response()
}

/// Token from the `Authorization` header, or the `token` query parameter for
/// websocket clients that cannot set headers.
fn request_token<B>(req: &Request<B>) -> Option<String> {
    if let Some(token) = auth::bearer_token(req.headers()) {
        return Some(token.to_string());
    }
    req.uri()
        .query()?
        .split('&')
        .find_map(|kv| kv.strip_prefix("token="))
        .map(str::to_string)
}

async fn auth_middleware<B>(
    State(state): State<AppState>,
    mut req: Request<B>,
    next: Next<B>,
) -> Response {
    let Some(token) = request_token(&req) else {
        return unauthorized();
    };
    match auth::verify_token(state.config.jwt_secret.as_bytes(), &token) {
        Ok(claims) => {
            req.extensions_mut().insert(Identity::from(claims));
            next.run(req).await
        }
        Err(_) => unauthorized(),
    }
}

/// JSON body extractor whose rejections use the `INVALID_REQUEST` error body.
pub struct ApiJson<T>(pub T);

#[async_trait]
impl<T, S, B> FromRequest<S, B> for ApiJson<T>
where
    Json<T>: FromRequest<S, B, Rejection = JsonRejection>,
    S: Send + Sync,
    B: Send + 'static,
{
    type Rejection = DispatchError;

    async fn from_request(req: Request<B>, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(Self(value)),
            Err(rejection) => Err(DispatchError::invalid(rejection.body_text())),
        }
    }
}

async fn open_conversation(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    ApiJson(req): ApiJson<CreateConversationRequest>,
) -> Result<Json<Conversation>, DispatchError> {
    let conversation = state.dispatcher.open_conversation(&identity, &req.peer_id)?;
    Ok(Json(conversation))
}

async fn list_conversations(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
) -> Result<Json<Vec<ConversationSummary>>, DispatchError> {
    Ok(Json(state.dispatcher.list_conversations(&identity)?))
}

async fn delete_conversation(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, DispatchError> {
    state.dispatcher.delete_conversation(&identity, &id)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
struct HistoryQuery {
    since: Option<i64>,
    limit: Option<usize>,
}

async fn history(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path(id): Path<Uuid>,
    Query(q): Query<HistoryQuery>,
) -> Result<Json<Vec<MessageRecord>>, DispatchError> {
    let messages = state
        .dispatcher
        .history(&identity, &id, q.since, q.limit.unwrap_or(50))?;
    Ok(Json(messages))
}

async fn unread(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path(id): Path<Uuid>,
) -> Result<Json<UnreadCount>, DispatchError> {
    let unread = state.dispatcher.unread_count(&identity, &id)?;
    Ok(Json(UnreadCount {
        conversation_id: id,
        unread,
    }))
}

async fn send_message(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    ApiJson(req): ApiJson<SendRequest>,
) -> Response {
    let temp_id = req.client_temp_id.clone();
    match state.dispatcher.send(&identity, req) {
        Ok(outcome) => {
            let status = if outcome.replayed {
                StatusCode::OK
            } else {
                StatusCode::CREATED
            };
            (status, Json(SendResponse::from(outcome.message))).into_response()
        }
        Err(e) => {
            if let DispatchError::Storage(inner) = &e {
                tracing::error!(error = %inner, "send failed");
            }
            (e.status(), Json(e.body().with_temp_id(temp_id))).into_response()
        }
    }
}

async fn mark_read(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    ApiJson(req): ApiJson<MarkReadRequest>,
) -> Result<Json<MarkReadResponse>, DispatchError> {
    Ok(Json(state.dispatcher.mark_read(&identity, req)?))
}

async fn list_devices(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
) -> Result<Json<Vec<DeviceAddress>>, DispatchError> {
    Ok(Json(state.dispatcher.gateway().addresses(&identity.user_id)?))
}

async fn register_device(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    ApiJson(req): ApiJson<RegisterDeviceRequest>,
) -> Result<StatusCode, DispatchError> {
    if req.address.trim().is_empty() {
        return Err(DispatchError::invalid("address is required"));
    }
    state
        .dispatcher
        .gateway()
        .register_address(&identity.user_id, req.address.trim(), req.platform)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn deregister_device(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    ApiJson(req): ApiJson<DeregisterDeviceRequest>,
) -> Result<StatusCode, DispatchError> {
    state
        .dispatcher
        .gateway()
        .deregister_address(&identity.user_id, req.address.trim())?;
    Ok(StatusCode::NO_CONTENT)
}

/// Run the HTTP server until Ctrl+C.
pub async fn run_http_server(config: Config) -> Result<()> {
    let addr: SocketAddr = config.bind.parse()?;
    let state = AppState::new(config).await?;
    info!(%addr, "courier listening");
    axum::Server::bind(&addr)
        .serve(build_router(state).into_make_service())
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}
