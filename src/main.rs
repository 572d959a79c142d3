mod eligibility;
mod http;
mod idempotency;
mod meli;
mod metrics;
mod models;
mod promotion;
mod security;
mod store;
mod sync;
#[cfg(test)]
mod testsupport;
mod token;

use axum::{
    Json, Router,
    extract::{Extension, Path, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::Utc;
use meli::{MeliClient, MeliConfig, MeliError, MeliGateway};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use models::{
    ApiError, BroadcastRequest, BroadcastResponse, ConnectionStatus, CustomerSummary,
    DirectMessageRequest, DiscountRequest, DiscountResponse, LinkRequest, LinkResponse,
    LinkStartResponse, ProductView, ProfileResponse, PromotionOutcome, PromotionRequest,
};
use promotion::{PromotionError, PromotionPipeline};
use rand::RngCore;
use security::{AuthContext, AuthState, require_session};
use serde_json::json;
use std::{
    collections::{BTreeMap, HashMap},
    net::SocketAddr,
    sync::Arc,
};
use store::{Store, StoreError};
use sync::{OrderAggregator, SyncError};
use tokio::sync::Mutex;
use token::{TokenError, TokenManager};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};
use uuid::Uuid;

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        error!(target = "pampero.api", "server crashed: {err}");
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    dotenvy::dotenv().ok();
    init_tracing();

    let auth_state = AuthState::from_env();
    let config = MeliConfig::from_env();
    let meli: Arc<dyn MeliGateway> = Arc::new(MeliClient::new(config.clone()));
    let store = store::store_from_env(&auth_state.user_ids());
    let tokens = TokenManager::new(store.clone(), meli.clone());
    let aggregator = OrderAggregator::new(store.clone(), meli.clone(), tokens.clone());
    let promotions = PromotionPipeline::new(
        store.clone(),
        meli.clone(),
        tokens.clone(),
        config.default_site_id.clone(),
    );

    let openapi_raw = include_str!("../docs/openapi.yaml");
    let openapi: serde_json::Value =
        serde_yaml::from_str(openapi_raw).unwrap_or(json!({"openapi": "3.0.3"}));
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("prom recorder");
    let redis = std::env::var("REDIS_URL")
        .ok()
        .and_then(|url| redis::Client::open(url).ok());

    let state = AppState {
        store,
        meli,
        tokens,
        aggregator,
        promotions,
        config,
        openapi: Arc::new(openapi),
        idempotency: Arc::new(Mutex::new(HashMap::new())),
        prometheus_handle,
        redis,
    };

    let cors = CorsLayer::new()
        .allow_headers(Any)
        .allow_methods(Any)
        .allow_origin(Any);

    let protected = Router::new()
        .route("/profile", get(profile))
        .route("/link/start", post(link_start))
        .route("/link", post(link_account))
        .route("/unlink", post(unlink_account))
        .route("/customers", get(sync_customers))
        .route("/customers/message-all", post(broadcast_message))
        .route("/customers/{id}/message", post(message_customer))
        .route("/products", get(list_products))
        .route("/products/{id}/discount", post(apply_discount))
        .route("/promotions", post(create_promotion))
        .route_layer(middleware::from_fn_with_state(auth_state, require_session));

    let app = Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .route("/openapi.json", get(openapi_json))
        .route("/docs", get(swagger_ui))
        .merge(protected)
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(axum::extract::DefaultBodyLimit::max(body_limit_from_env()));

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(8000);
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    info!(target = "pampero.api", "listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}

#[derive(Clone)]
struct AppState {
    store: Arc<dyn Store>,
    meli: Arc<dyn MeliGateway>,
    tokens: TokenManager,
    aggregator: OrderAggregator,
    promotions: PromotionPipeline,
    config: MeliConfig,
    openapi: Arc<serde_json::Value>,
    idempotency: Arc<Mutex<HashMap<String, PromotionOutcome>>>,
    prometheus_handle: PrometheusHandle,
    redis: Option<redis::Client>,
}

/// Health and readiness check.
///
/// - Method: `GET`
/// - Path: `/health`
/// - Auth: none
async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "pampero-api-rs",
    }))
}

async fn openapi_json(
    State(state): State<AppState>,
    headers: axum::http::HeaderMap,
) -> Result<Json<serde_json::Value>, AppError> {
    if let Ok(key) = std::env::var("OPENAPI_KEY") {
        let presented = headers
            .get("X-Docs-Key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if presented != key {
            return Err(AppError::Invalid("unauthorized".into()));
        }
    }
    Ok(Json((*state.openapi).clone()))
}

async fn swagger_ui() -> axum::http::Response<String> {
    let html = r#"<!doctype html>
<html>
<head>
  <meta charset='utf-8'/>
  <title>Pampero API Docs</title>
  <link rel="stylesheet" href="https://unpkg.com/swagger-ui-dist@5/swagger-ui.css" />
</head>
<body>
  <div id="swagger-ui"></div>
  <script src="https://unpkg.com/swagger-ui-dist@5/swagger-ui-bundle.js"></script>
  <script>
    window.onload = () => {
      window.ui = SwaggerUIBundle({ url: '/openapi.json', dom_id: '#swagger-ui' });
    };
  </script>
</body>
</html>"#;
    axum::http::Response::builder()
        .header("Content-Type", "text/html; charset=utf-8")
        .body(html.to_string())
        .unwrap()
}

async fn metrics_endpoint(
    State(state): State<AppState>,
    headers: axum::http::HeaderMap,
) -> axum::http::Response<String> {
    if let Ok(secret) = std::env::var("METRICS_KEY") {
        let presented = headers
            .get("X-Metrics-Key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if presented != secret {
            return axum::http::Response::builder()
                .status(StatusCode::UNAUTHORIZED)
                .body("unauthorized".into())
                .unwrap();
        }
    }
    let body = state.prometheus_handle.render();
    axum::http::Response::builder()
        .header("Content-Type", "text/plain; version=0.0.4")
        .body(body)
        .unwrap()
}

/// Begin linking: a fresh PKCE verifier plus the authorization URL the
/// seller must visit. The verifier comes back on `/link`.
async fn link_start(State(state): State<AppState>) -> Json<LinkStartResponse> {
    metrics::inc_requests("/link/start");
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    let verifier = URL_SAFE_NO_PAD.encode(bytes);
    Json(LinkStartResponse {
        authorization_url: state.config.authorization_url(&verifier),
        code_verifier: verifier,
    })
}

/// Complete linking: exchange the authorization code and persist the token
/// pair. An identity already owned by another user is rejected with 409.
async fn link_account(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Json(payload): Json<LinkRequest>,
) -> Result<Json<LinkResponse>, AppError> {
    metrics::inc_requests("/link");
    let linked = state
        .tokens
        .link_account(context.user_id, &payload.code, &payload.code_verifier)
        .await?;
    Ok(Json(LinkResponse {
        success: true,
        meli_user_id: linked.meli_user_id,
        expires_at: linked.expires_at,
    }))
}

async fn unlink_account(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
) -> Result<Json<serde_json::Value>, AppError> {
    metrics::inc_requests("/unlink");
    state.tokens.unlink(context.user_id).await?;
    Ok(Json(json!({ "success": true })))
}

async fn profile(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
) -> Result<Json<ProfileResponse>, AppError> {
    metrics::inc_requests("/profile");
    let user = state
        .store
        .user(context.user_id)
        .await?
        .ok_or_else(|| AppError::NotFound("user not found".into()))?;
    let creds = user.credentials();
    let connected = creds
        .as_ref()
        .map(|c| c.expires_at > Utc::now())
        .unwrap_or(false);

    let mut live_profile = None;
    if let Some(creds) = &creds {
        match state.meli.user_profile(creds.meli_user_id).await {
            Ok(profile) => live_profile = serde_json::to_value(&profile).ok(),
            Err(err) => warn!(
                target = "pampero.api",
                user_id = %context.user_id,
                error = %err,
                "live profile lookup failed"
            ),
        }
    }

    Ok(Json(ProfileResponse {
        user_id: user.id,
        name: user.name,
        email: user.email,
        mercadolibre: ConnectionStatus {
            connected,
            meli_user_id: creds.as_ref().map(|c| c.meli_user_id),
            expires_at: creds.as_ref().map(|c| c.expires_at),
            profile: live_profile,
        },
    }))
}

/// Run the order-ingestion pipeline and return the customer aggregates.
///
/// - Method: `GET`
/// - Path: `/customers`
/// - Response: list of `CustomerSummary` with derived purchase stats
async fn sync_customers(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
) -> Result<Json<Vec<CustomerSummary>>, AppError> {
    metrics::inc_requests("/customers");
    let summaries = state.aggregator.sync(context.user_id).await?;
    Ok(Json(summaries))
}

async fn message_customer(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Path(id): Path<Uuid>,
    Json(payload): Json<DirectMessageRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    metrics::inc_requests("/customers/message");
    if payload.message.trim().is_empty() || payload.order_id.trim().is_empty() {
        return Err(AppError::Invalid("message and order_id are required".into()));
    }

    let customer = state
        .store
        .customer(context.user_id, id)
        .await?
        .ok_or_else(|| AppError::NotFound("customer not found".into()))?;

    let token = state.tokens.access_token(context.user_id).await?;
    let seller_id = state.tokens.seller_id(context.user_id).await?;
    state
        .meli
        .send_message(
            &payload.order_id,
            seller_id,
            customer.meli_buyer_id,
            &payload.message,
            &token,
        )
        .await?;

    Ok(Json(json!({ "success": true })))
}

/// Same text to every customer with order history. One recipient failing
/// never blocks the rest; the response reports both tallies.
async fn broadcast_message(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Json(payload): Json<BroadcastRequest>,
) -> Result<Json<BroadcastResponse>, AppError> {
    metrics::inc_requests("/customers/message-all");
    if payload.message.trim().is_empty() {
        return Err(AppError::Invalid("message is required".into()));
    }

    let token = state.tokens.access_token(context.user_id).await?;
    let seller_id = state.tokens.seller_id(context.user_id).await?;
    let customers = state.store.customers(context.user_id).await?;

    let mut sent = 0usize;
    let mut failed = 0usize;
    for customer in customers {
        let Some(order) = state.store.latest_order(customer.id).await? else {
            continue;
        };
        match state
            .meli
            .send_message(
                &order.meli_order_id,
                seller_id,
                customer.meli_buyer_id,
                &payload.message,
                &token,
            )
            .await
        {
            Ok(()) => sent += 1,
            Err(err) => {
                warn!(
                    target = "pampero.api",
                    customer_id = %customer.id,
                    error = %err,
                    "broadcast send failed"
                );
                failed += 1;
            }
        }
    }

    Ok(Json(BroadcastResponse { sent, failed }))
}

/// Stored product/promotion rows merged with live listing data. The live
/// side is best-effort; an unreachable marketplace still returns the rows.
async fn list_products(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
) -> Result<Json<Vec<ProductView>>, AppError> {
    metrics::inc_requests("/products");
    let stored = state.store.products(context.user_id).await?;

    let mut views: BTreeMap<String, ProductView> = BTreeMap::new();
    match live_items(&state, context.user_id).await {
        Ok(items) => {
            for item in items {
                views.insert(
                    item.id.clone(),
                    ProductView {
                        id: item.id,
                        title: item.title.unwrap_or_default(),
                        price: item.price,
                        status: item.status,
                        permalink: item.permalink,
                        promotion_id: None,
                        promotion_expires_at: None,
                        promotion_link: None,
                    },
                );
            }
        }
        Err(err) => warn!(
            target = "pampero.api",
            user_id = %context.user_id,
            error = ?err,
            "live listing lookup failed; serving stored products only"
        ),
    }

    for record in stored {
        match views.get_mut(&record.id) {
            Some(view) => {
                view.promotion_id = record.promotion_id;
                view.promotion_expires_at = record.promotion_expires_at;
                view.promotion_link = record.promotion_link;
                if view.title.is_empty() {
                    view.title = record.title;
                }
            }
            None => {
                views.insert(
                    record.id.clone(),
                    ProductView {
                        id: record.id,
                        title: record.title,
                        price: Some(record.price),
                        status: None,
                        permalink: None,
                        promotion_id: record.promotion_id,
                        promotion_expires_at: record.promotion_expires_at,
                        promotion_link: record.promotion_link,
                    },
                );
            }
        }
    }

    Ok(Json(views.into_values().collect()))
}

const BATCH_CHUNK: usize = 20;

async fn live_items(
    state: &AppState,
    user_id: Uuid,
) -> Result<Vec<meli::ItemDetail>, AppError> {
    let token = state.tokens.access_token(user_id).await?;
    let seller_id = state.tokens.seller_id(user_id).await?;
    let ids = state.meli.active_item_ids(seller_id, &token).await?;
    let mut items = Vec::with_capacity(ids.len());
    for chunk in ids.chunks(BATCH_CHUNK) {
        items.extend(state.meli.items_batch(chunk, &token).await?);
    }
    Ok(items)
}

/// Straight price cut on one listing: fetch, recompute, PUT.
async fn apply_discount(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Path(id): Path<String>,
    Json(payload): Json<DiscountRequest>,
) -> Result<Json<DiscountResponse>, AppError> {
    metrics::inc_requests("/products/discount");
    if !(payload.discount_percent > 0.0 && payload.discount_percent < 100.0) {
        return Err(AppError::Invalid(
            "discount_percent must be strictly between 0 and 100".into(),
        ));
    }

    let token = state.tokens.access_token(context.user_id).await?;
    let item = state.meli.item_detail(&id, Some(&token)).await?;
    let price = item
        .price
        .ok_or_else(|| AppError::Invalid("listing has no price".into()))?;
    let new_price = (price * (1.0 - payload.discount_percent / 100.0) * 100.0).round() / 100.0;
    state.meli.update_item_price(&id, new_price, &token).await?;

    Ok(Json(DiscountResponse {
        success: true,
        new_price,
        permalink: item.permalink,
    }))
}

/// Run the promotion orchestrator.
///
/// - Method: `POST`
/// - Path: `/promotions`
/// - Body: `PromotionRequest`
/// - Honors `Idempotency-Key` (redis when configured, else in-process)
async fn create_promotion(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    headers: axum::http::HeaderMap,
    Json(payload): Json<PromotionRequest>,
) -> Result<Json<PromotionOutcome>, AppError> {
    metrics::inc_requests("/promotions");

    if let Some(key) = headers
        .get("Idempotency-Key")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
    {
        if let Some(client) = &state.redis {
            if let Some(existing) =
                idempotency::redis_get::<PromotionOutcome>(client, &key).await
            {
                return Ok(Json(existing));
            }
            let outcome = state.promotions.run(context.user_id, payload).await?;
            let ttl = std::env::var("IDEMPOTENCY_TTL_SECS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(3600);
            idempotency::redis_set(client, &key, &outcome, ttl).await;
            return Ok(Json(outcome));
        }
        if let Some(existing) = state.idempotency.lock().await.get(&key).cloned() {
            return Ok(Json(existing));
        }
        let outcome = state.promotions.run(context.user_id, payload).await?;
        state.idempotency.lock().await.insert(key, outcome.clone());
        return Ok(Json(outcome));
    }

    let outcome = state.promotions.run(context.user_id, payload).await?;
    Ok(Json(outcome))
}

#[derive(Debug)]
enum AppError {
    Token(TokenError),
    Sync(SyncError),
    Promotion(PromotionError),
    Meli(MeliError),
    Store(StoreError),
    Invalid(String),
    NotFound(String),
}

impl From<TokenError> for AppError {
    fn from(value: TokenError) -> Self {
        Self::Token(value)
    }
}

impl From<SyncError> for AppError {
    fn from(value: SyncError) -> Self {
        Self::Sync(value)
    }
}

impl From<PromotionError> for AppError {
    fn from(value: PromotionError) -> Self {
        Self::Promotion(value)
    }
}

impl From<MeliError> for AppError {
    fn from(value: MeliError) -> Self {
        Self::Meli(value)
    }
}

impl From<StoreError> for AppError {
    fn from(value: StoreError) -> Self {
        Self::Store(value)
    }
}

fn token_status(err: &TokenError) -> (StatusCode, &'static str) {
    match err {
        TokenError::NotLinked => (StatusCode::BAD_REQUEST, "not_linked"),
        TokenError::AlreadyLinked(_) => (StatusCode::CONFLICT, "already_linked"),
        TokenError::Refresh(_) => (StatusCode::BAD_GATEWAY, "token_refresh_failed"),
        TokenError::Exchange(_) => (StatusCode::BAD_GATEWAY, "code_exchange_failed"),
        TokenError::Store(_) => (StatusCode::INTERNAL_SERVER_ERROR, "storage_error"),
    }
}

impl AppError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            AppError::Token(err) => token_status(err),
            AppError::Sync(err) => match err {
                SyncError::Token(inner) => token_status(inner),
                SyncError::Upstream(_) => (StatusCode::BAD_GATEWAY, "upstream_error"),
                SyncError::Store(_) => (StatusCode::INTERNAL_SERVER_ERROR, "storage_error"),
            },
            AppError::Promotion(err) => match err {
                PromotionError::InvalidRequest(_) => {
                    (StatusCode::BAD_REQUEST, "invalid_request")
                }
                PromotionError::SellerNotEligible(_) => {
                    (StatusCode::BAD_REQUEST, "seller_not_eligible")
                }
                PromotionError::ItemNotEligible { .. } => {
                    (StatusCode::BAD_REQUEST, "item_not_eligible")
                }
                PromotionError::NotNewItem(_) => (StatusCode::BAD_REQUEST, "item_not_new"),
                PromotionError::Rejected { status, .. } => {
                    let status = StatusCode::from_u16(*status)
                        .ok()
                        .filter(|s| s.is_client_error() || s.is_server_error())
                        .unwrap_or(StatusCode::BAD_GATEWAY);
                    (status, "promotion_rejected")
                }
                PromotionError::Token(inner) => token_status(inner),
                PromotionError::Upstream(_) => (StatusCode::BAD_GATEWAY, "upstream_error"),
                PromotionError::Store(_) => {
                    (StatusCode::INTERNAL_SERVER_ERROR, "storage_error")
                }
            },
            AppError::Meli(_) => (StatusCode::BAD_GATEWAY, "upstream_error"),
            AppError::Store(_) => (StatusCode::INTERNAL_SERVER_ERROR, "storage_error"),
            AppError::Invalid(_) => (StatusCode::BAD_REQUEST, "invalid_request"),
            AppError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
        }
    }

    fn detail(&self) -> String {
        match self {
            AppError::Token(err) => err.to_string(),
            AppError::Sync(err) => err.to_string(),
            AppError::Promotion(err) => err.to_string(),
            AppError::Meli(err) => err.to_string(),
            AppError::Store(err) => err.to_string(),
            AppError::Invalid(message) | AppError::NotFound(message) => message.clone(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        let payload = ApiError {
            error: code.to_string(),
            detail: Some(self.detail()),
        };
        (status, Json(payload)).into_response()
    }
}

fn body_limit_from_env() -> usize {
    std::env::var("REQUEST_MAX_BYTES")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(256 * 1024)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));
    let _ = fmt().with_env_filter(filter).try_init();
}
