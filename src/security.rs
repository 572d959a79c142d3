use crate::models::ApiError;
use axum::{
    Json,
    body::Body,
    extract::State,
    http::{self, Request, StatusCode, header::HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::{collections::HashMap, convert::Infallible, env, sync::Arc, time::Instant};
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

/// Session issuance is out of scope here; the middleware only resolves a
/// presented key to the local user id it stands for.
#[derive(Clone)]
pub struct AuthState {
    sessions: Arc<HashMap<String, Uuid>>,
    limiter: Arc<RateLimiter>,
}

#[derive(Clone, Debug)]
pub struct AuthContext {
    pub user_id: Uuid,
}

impl AuthState {
    pub fn from_env() -> Self {
        Self {
            sessions: Arc::new(load_sessions_from_env()),
            limiter: Arc::new(RateLimiter::from_env()),
        }
    }

    pub fn user_ids(&self) -> Vec<Uuid> {
        self.sessions.values().copied().collect()
    }

    fn authenticate(&self, presented: &str) -> Option<AuthContext> {
        self.sessions
            .get(presented)
            .map(|user_id| AuthContext { user_id: *user_id })
    }
}

pub async fn require_session(
    State(state): State<AuthState>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, Infallible> {
    let Some(presented) = extract_session_key(request.headers()) else {
        return Ok(unauthorized("missing_session_key"));
    };

    let Some(context) = state.authenticate(&presented) else {
        return Ok(unauthorized("invalid_session_key"));
    };

    match state.limiter.consume(context.user_id).await {
        Ok(()) => {
            request.extensions_mut().insert(context);
            Ok(next.run(request).await)
        }
        Err(retry_after) => {
            let payload = ApiError {
                error: "rate_limited".to_string(),
                detail: Some("Too many requests".to_string()),
            };
            let mut response =
                (StatusCode::TOO_MANY_REQUESTS, Json(payload)).into_response();
            response.headers_mut().insert(
                http::header::RETRY_AFTER,
                HeaderValue::from_str(&retry_after.to_string())
                    .unwrap_or_else(|_| HeaderValue::from_static("1")),
            );
            Ok(response)
        }
    }
}

fn extract_session_key(headers: &http::HeaderMap) -> Option<String> {
    if let Some(value) = headers.get(http::header::AUTHORIZATION)
        && let Ok(raw) = value.to_str()
        && raw.len() >= 7
        && raw[..6].eq_ignore_ascii_case("bearer")
    {
        return Some(raw[6..].trim().to_string());
    }
    headers
        .get("X-Session-Key")
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn unauthorized(code: &str) -> Response {
    let payload = ApiError {
        error: code.to_string(),
        detail: Some("Provide X-Session-Key or a Bearer token".to_string()),
    };
    (StatusCode::UNAUTHORIZED, Json(payload)).into_response()
}

/// `SESSION_KEYS` is `key:user-uuid` pairs separated by commas. Without it a
/// single demo identity is issued so the service works out of the box.
fn load_sessions_from_env() -> HashMap<String, Uuid> {
    let raw = env::var("SESSION_KEYS").unwrap_or_default();
    let mut sessions = HashMap::new();
    for token in raw.split(',') {
        let trimmed = token.trim();
        if trimmed.is_empty() {
            continue;
        }
        let mut parts = trimmed.splitn(2, ':');
        let key = parts.next().map(str::trim).filter(|s| !s.is_empty());
        let user = parts
            .next()
            .map(str::trim)
            .and_then(|s| Uuid::parse_str(s).ok());
        match (key, user) {
            (Some(key), Some(user_id)) => {
                sessions.insert(key.to_string(), user_id);
            }
            _ => warn!(
                target = "pampero.api",
                "ignored malformed SESSION_KEYS entry: {trimmed}"
            ),
        }
    }

    if sessions.is_empty() {
        warn!(
            target = "pampero.api",
            "SESSION_KEYS produced no entries; issuing demo session"
        );
        sessions.insert("demo-key".to_string(), Uuid::nil());
    } else {
        info!(
            target = "pampero.api",
            session_count = sessions.len(),
            "loaded session keys from env"
        );
    }

    sessions
}

/// Token bucket per user. Sync and promotion requests multiply into many
/// marketplace calls, so inbound pacing protects the upstream quota.
struct RateLimiter {
    rate_per_sec: f64,
    capacity: f64,
    buckets: Mutex<HashMap<Uuid, Bucket>>,
}

struct Bucket {
    tokens: f64,
    refilled_at: Instant,
}

impl RateLimiter {
    fn from_env() -> Self {
        let rate_per_sec = env::var("RATE_LIMIT_PER_SEC")
            .ok()
            .and_then(|value| value.parse::<f64>().ok())
            .filter(|value| *value > 0.0)
            .unwrap_or(5.0);
        let capacity = env::var("RATE_LIMIT_CAPACITY")
            .ok()
            .and_then(|value| value.parse::<f64>().ok())
            .filter(|value| *value >= 1.0)
            .unwrap_or(10.0);
        Self {
            rate_per_sec,
            capacity,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Ok to proceed, or the whole seconds to wait before retrying.
    async fn consume(&self, user_id: Uuid) -> Result<(), u64> {
        let mut buckets = self.buckets.lock().await;
        let now = Instant::now();
        let bucket = buckets.entry(user_id).or_insert(Bucket {
            tokens: self.capacity,
            refilled_at: now,
        });

        let elapsed = now.duration_since(bucket.refilled_at).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.rate_per_sec).min(self.capacity);
        bucket.refilled_at = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            Ok(())
        } else {
            let wait = ((1.0 - bucket.tokens) / self.rate_per_sec).ceil().max(1.0);
            Err(wait as u64)
        }
    }
}
