pub mod auth;
pub mod config;
pub mod items;
pub mod messages;
pub mod orders;
pub mod promotions;
pub mod users;

use crate::http::shared_client;
use async_trait::async_trait;
use reqwest::{Client, Response};
use thiserror::Error;

pub use auth::TokenGrant;
pub use config::MeliConfig;
pub use items::ItemDetail;
pub use orders::{BuyerInfo, OrderSummary, ShippingInfo};
pub use promotions::{CreatePromotionRequest, PromotionDetail};
pub use users::MeliUserProfile;

#[derive(Debug, Error)]
pub enum MeliError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("HTTP {status}: {detail}")]
    Status { status: u16, detail: String },
    #[error("invalid response: {0}")]
    Deserialize(String),
}

impl MeliError {
    pub(crate) fn request(err: reqwest::Error) -> Self {
        MeliError::Request(err.to_string())
    }

    pub(crate) fn deserialize(err: reqwest::Error) -> Self {
        MeliError::Deserialize(err.to_string())
    }
}

/// Everything the Integration Core needs from the Mercado Libre API, as one
/// seam so tests can substitute a scripted marketplace.
#[async_trait]
pub trait MeliGateway: Send + Sync {
    async fn exchange_code(&self, code: &str, verifier: &str) -> Result<TokenGrant, MeliError>;
    async fn refresh_tokens(&self, refresh_token: &str) -> Result<TokenGrant, MeliError>;

    async fn search_orders(
        &self,
        seller_id: i64,
        access_token: &str,
    ) -> Result<Vec<OrderSummary>, MeliError>;
    async fn order_detail(
        &self,
        order_id: i64,
        access_token: &str,
    ) -> Result<OrderSummary, MeliError>;
    async fn shipment_detail(
        &self,
        shipment_id: i64,
        access_token: &str,
    ) -> Result<ShippingInfo, MeliError>;

    async fn user_profile(&self, meli_user_id: i64) -> Result<MeliUserProfile, MeliError>;

    async fn item_detail(
        &self,
        item_id: &str,
        access_token: Option<&str>,
    ) -> Result<ItemDetail, MeliError>;
    async fn items_batch(
        &self,
        item_ids: &[String],
        access_token: &str,
    ) -> Result<Vec<ItemDetail>, MeliError>;
    async fn active_item_ids(
        &self,
        seller_id: i64,
        access_token: &str,
    ) -> Result<Vec<String>, MeliError>;
    async fn update_item_price(
        &self,
        item_id: &str,
        price: f64,
        access_token: &str,
    ) -> Result<(), MeliError>;

    async fn eligible_item_ids(
        &self,
        item_id: &str,
        site_id: &str,
        access_token: &str,
    ) -> Result<Vec<String>, MeliError>;
    async fn create_promotion(
        &self,
        request: &CreatePromotionRequest,
        access_token: &str,
    ) -> Result<PromotionDetail, MeliError>;
    async fn promotion_status(
        &self,
        promotion_id: &str,
        access_token: &str,
    ) -> Result<PromotionDetail, MeliError>;

    async fn send_message(
        &self,
        pack_id: &str,
        seller_meli_id: i64,
        buyer_meli_id: i64,
        text: &str,
        access_token: &str,
    ) -> Result<(), MeliError>;
}

/// Reqwest-backed gateway. Endpoint-specific request/response types and the
/// calls themselves live in the per-area modules; this impl only delegates.
#[derive(Debug, Clone)]
pub struct MeliClient {
    pub(crate) config: MeliConfig,
    pub(crate) http: Client,
}

impl MeliClient {
    pub fn new(config: MeliConfig) -> Self {
        Self {
            config,
            http: shared_client(),
        }
    }

    fn api_url(&self, path: &str) -> String {
        format!("{}{}", self.config.api_base, path)
    }
}

/// Turn a non-success response into `MeliError::Status`, capturing the body
/// as compact JSON when it parses and as lossy text otherwise.
pub(crate) async fn status_error(response: Response) -> MeliError {
    let status = response.status().as_u16();
    let detail = match response.bytes().await {
        Ok(bytes) => match serde_json::from_slice::<serde_json::Value>(&bytes) {
            Ok(json) => json.to_string(),
            Err(_) => String::from_utf8_lossy(&bytes).trim().to_string(),
        },
        Err(_) => String::new(),
    };
    MeliError::Status { status, detail }
}

#[async_trait]
impl MeliGateway for MeliClient {
    async fn exchange_code(&self, code: &str, verifier: &str) -> Result<TokenGrant, MeliError> {
        self.request_exchange_code(code, verifier).await
    }

    async fn refresh_tokens(&self, refresh_token: &str) -> Result<TokenGrant, MeliError> {
        self.request_refresh(refresh_token).await
    }

    async fn search_orders(
        &self,
        seller_id: i64,
        access_token: &str,
    ) -> Result<Vec<OrderSummary>, MeliError> {
        self.request_order_search(seller_id, access_token).await
    }

    async fn order_detail(
        &self,
        order_id: i64,
        access_token: &str,
    ) -> Result<OrderSummary, MeliError> {
        self.request_order_detail(order_id, access_token).await
    }

    async fn shipment_detail(
        &self,
        shipment_id: i64,
        access_token: &str,
    ) -> Result<ShippingInfo, MeliError> {
        self.request_shipment_detail(shipment_id, access_token)
            .await
    }

    async fn user_profile(&self, meli_user_id: i64) -> Result<MeliUserProfile, MeliError> {
        self.request_user_profile(meli_user_id).await
    }

    async fn item_detail(
        &self,
        item_id: &str,
        access_token: Option<&str>,
    ) -> Result<ItemDetail, MeliError> {
        self.request_item_detail(item_id, access_token).await
    }

    async fn items_batch(
        &self,
        item_ids: &[String],
        access_token: &str,
    ) -> Result<Vec<ItemDetail>, MeliError> {
        self.request_items_batch(item_ids, access_token).await
    }

    async fn active_item_ids(
        &self,
        seller_id: i64,
        access_token: &str,
    ) -> Result<Vec<String>, MeliError> {
        self.request_active_item_ids(seller_id, access_token).await
    }

    async fn update_item_price(
        &self,
        item_id: &str,
        price: f64,
        access_token: &str,
    ) -> Result<(), MeliError> {
        self.request_price_update(item_id, price, access_token)
            .await
    }

    async fn eligible_item_ids(
        &self,
        item_id: &str,
        site_id: &str,
        access_token: &str,
    ) -> Result<Vec<String>, MeliError> {
        self.request_eligible_items(item_id, site_id, access_token)
            .await
    }

    async fn create_promotion(
        &self,
        request: &CreatePromotionRequest,
        access_token: &str,
    ) -> Result<PromotionDetail, MeliError> {
        self.request_create_promotion(request, access_token).await
    }

    async fn promotion_status(
        &self,
        promotion_id: &str,
        access_token: &str,
    ) -> Result<PromotionDetail, MeliError> {
        self.request_promotion_status(promotion_id, access_token)
            .await
    }

    async fn send_message(
        &self,
        pack_id: &str,
        seller_meli_id: i64,
        buyer_meli_id: i64,
        text: &str,
        access_token: &str,
    ) -> Result<(), MeliError> {
        self.request_send_message(pack_id, seller_meli_id, buyer_meli_id, text, access_token)
            .await
    }
}
