use super::{MeliClient, MeliError, status_error};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use urlencoding::encode;

#[derive(Debug, Clone, Serialize)]
pub struct CreatePromotionRequest {
    pub site_id: String,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub items: Vec<PromotionItem>,
}

impl CreatePromotionRequest {
    pub fn price_discount(
        site_id: String,
        item_id: String,
        discount_percent: f64,
        end_date: DateTime<Utc>,
    ) -> Self {
        Self {
            site_id,
            kind: "PRICE_DISCOUNT",
            start_date: Utc::now(),
            end_date,
            items: vec![PromotionItem {
                item_id,
                discount_type: "PERCENTAGE",
                value: discount_percent,
            }],
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PromotionItem {
    pub item_id: String,
    pub discount_type: &'static str,
    pub value: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PromotionDetail {
    pub id: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub promotion_link: Option<String>,
    #[serde(default)]
    pub permalink: Option<String>,
    #[serde(default)]
    pub finish_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_date: Option<DateTime<Utc>>,
}

impl PromotionDetail {
    pub fn is_active(&self) -> bool {
        self.status.as_deref() == Some("active")
    }

    /// The promotion's own expiry when the provider reports one.
    pub fn resolved_expiry(&self, fallback: DateTime<Utc>) -> DateTime<Utc> {
        self.finish_date.or(self.end_date).unwrap_or(fallback)
    }

    pub fn share_link(&self) -> Option<String> {
        self.promotion_link
            .clone()
            .or_else(|| self.permalink.clone())
    }
}

#[derive(Debug, Deserialize)]
struct EligibleItemsResponse {
    #[serde(default)]
    eligible_items: Vec<EligibleItem>,
}

#[derive(Debug, Deserialize)]
struct EligibleItem {
    id: String,
}

impl MeliClient {
    pub(crate) async fn request_eligible_items(
        &self,
        item_id: &str,
        site_id: &str,
        access_token: &str,
    ) -> Result<Vec<String>, MeliError> {
        let url = self.api_url("/seller-promotions/items/eligible");
        let response = self
            .http
            .get(url)
            .query(&[("ids", item_id), ("site_id", site_id)])
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(MeliError::request)?;

        if !response.status().is_success() {
            return Err(status_error(response).await);
        }

        let payload: EligibleItemsResponse =
            response.json().await.map_err(MeliError::deserialize)?;
        Ok(payload
            .eligible_items
            .into_iter()
            .map(|item| item.id)
            .collect())
    }

    pub(crate) async fn request_create_promotion(
        &self,
        request: &CreatePromotionRequest,
        access_token: &str,
    ) -> Result<PromotionDetail, MeliError> {
        let url = self.api_url("/seller-promotions/promotions?app_version=1");
        let response = self
            .http
            .post(url)
            .bearer_auth(access_token)
            .header("Accept", "application/json")
            .json(request)
            .send()
            .await
            .map_err(MeliError::request)?;

        if !response.status().is_success() {
            // The rejection body carries the actionable detail; keep it.
            return Err(status_error(response).await);
        }

        response.json().await.map_err(MeliError::deserialize)
    }

    pub(crate) async fn request_promotion_status(
        &self,
        promotion_id: &str,
        access_token: &str,
    ) -> Result<PromotionDetail, MeliError> {
        let url = self.api_url(&format!(
            "/seller-promotions/promotions/{}",
            encode(promotion_id)
        ));
        let response = self
            .http
            .get(url)
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(MeliError::request)?;

        if !response.status().is_success() {
            return Err(status_error(response).await);
        }

        response.json().await.map_err(MeliError::deserialize)
    }
}
