use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_with::skip_serializing_none;
use uuid::Uuid;

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// One customer row as returned by the sync endpoint. The aggregate fields
/// (purchase count, last-order data) are recomputed from the live order feed
/// on every sync; they are never read back from storage.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomerSummary {
    pub id: Uuid,
    pub meli_buyer_id: i64,
    pub nickname: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email: Option<String>,
    pub purchase_count: u32,
    pub last_order_id: Option<String>,
    pub last_shipping_method: Option<String>,
    pub province: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PromotionRequest {
    pub customer_ids: Vec<Uuid>,
    pub product_id: String,
    pub discount_percent: f64,
    pub expires_at: DateTime<Utc>,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromotionOutcome {
    pub success: bool,
    pub promotions_sent: Vec<Uuid>,
    pub message: Option<String>,
    pub promotion: Option<PromotionSummary>,
    pub stages: Vec<StageReport>,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromotionSummary {
    pub promotion_id: String,
    pub item_id: String,
    pub link: Option<String>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StageReport {
    pub name: String,
    pub elapsed_ms: u128,
    pub timestamp: DateTime<Utc>,
    pub output: Value,
}

impl StageReport {
    pub fn new(name: &str, elapsed_ms: u128, output: Value) -> Self {
        Self {
            name: name.to_string(),
            elapsed_ms,
            timestamp: Utc::now(),
            output,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct LinkRequest {
    pub code: String,
    pub code_verifier: String,
}

#[derive(Debug, Serialize)]
pub struct LinkResponse {
    pub success: bool,
    pub meli_user_id: i64,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct LinkStartResponse {
    pub authorization_url: String,
    pub code_verifier: String,
}

#[derive(Debug, Deserialize)]
pub struct DirectMessageRequest {
    pub order_id: String,
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct BroadcastRequest {
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct BroadcastResponse {
    pub sent: usize,
    pub failed: usize,
}

#[derive(Debug, Deserialize)]
pub struct DiscountRequest {
    pub discount_percent: f64,
}

#[skip_serializing_none]
#[derive(Debug, Serialize)]
pub struct DiscountResponse {
    pub success: bool,
    pub new_price: f64,
    pub permalink: Option<String>,
}

/// Stored product row merged with whatever live listing data was reachable.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize)]
pub struct ProductView {
    pub id: String,
    pub title: String,
    pub price: Option<f64>,
    pub status: Option<String>,
    pub permalink: Option<String>,
    pub promotion_id: Option<String>,
    pub promotion_expires_at: Option<DateTime<Utc>>,
    pub promotion_link: Option<String>,
}

#[skip_serializing_none]
#[derive(Debug, Serialize)]
pub struct ProfileResponse {
    pub user_id: Uuid,
    pub name: Option<String>,
    pub email: Option<String>,
    pub mercadolibre: ConnectionStatus,
}

#[skip_serializing_none]
#[derive(Debug, Serialize)]
pub struct ConnectionStatus {
    pub connected: bool,
    pub meli_user_id: Option<i64>,
    pub expires_at: Option<DateTime<Utc>>,
    pub profile: Option<Value>,
}
