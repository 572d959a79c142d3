use super::{MeliClient, MeliError, status_error};
use chrono::{DateTime, Utc};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
struct OrderSearchResponse {
    #[serde(default)]
    results: Vec<OrderSummary>,
}

/// An order as returned by both the search feed and the order-detail
/// endpoint. The detail response carries the same shape with more fields
/// populated, so one type covers both.
#[derive(Debug, Clone, Deserialize)]
pub struct OrderSummary {
    pub id: i64,
    #[serde(default)]
    pub pack_id: Option<i64>,
    pub date_created: DateTime<Utc>,
    #[serde(default)]
    pub buyer: Option<BuyerInfo>,
    #[serde(default)]
    pub shipping: Option<ShippingInfo>,
}

impl OrderSummary {
    /// Messaging is scoped to the pack when the order belongs to one.
    pub fn pack_or_order_id(&self) -> String {
        self.pack_id.unwrap_or(self.id).to_string()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BuyerInfo {
    pub id: i64,
    #[serde(default)]
    pub nickname: Option<String>,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
}

/// Shipping block embedded in orders; the standalone shipment endpoint
/// returns the same field names at the top level, so it reuses this type.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ShippingInfo {
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(default)]
    pub shipping_mode: Option<String>,
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub logistic_type: Option<String>,
    #[serde(default)]
    pub receiver_address: Option<ReceiverAddress>,
}

impl ShippingInfo {
    /// The feed is inconsistent about where the shipping method lives.
    pub fn method(&self) -> Option<String> {
        self.shipping_mode
            .clone()
            .or_else(|| self.mode.clone())
            .or_else(|| self.logistic_type.clone())
    }

    pub fn province(&self) -> Option<String> {
        self.receiver_address
            .as_ref()
            .and_then(|address| address.state.as_ref())
            .and_then(StateField::display_name)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReceiverAddress {
    #[serde(default)]
    pub state: Option<StateField>,
}

/// `receiver_address.state` arrives either as `{"id": ..., "name": ...}` or
/// as a bare string depending on the endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum StateField {
    Named {
        #[serde(default)]
        name: Option<String>,
    },
    Plain(String),
}

impl StateField {
    pub fn display_name(&self) -> Option<String> {
        match self {
            StateField::Named { name } => name.clone(),
            StateField::Plain(value) => Some(value.clone()),
        }
    }
}

impl MeliClient {
    pub(crate) async fn request_order_search(
        &self,
        seller_id: i64,
        access_token: &str,
    ) -> Result<Vec<OrderSummary>, MeliError> {
        let url = self.api_url("/orders/search");
        let response = self
            .http
            .get(url)
            .query(&[("seller", seller_id.to_string())])
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(MeliError::request)?;

        if !response.status().is_success() {
            return Err(status_error(response).await);
        }

        let payload: OrderSearchResponse = response.json().await.map_err(MeliError::deserialize)?;
        Ok(payload.results)
    }

    pub(crate) async fn request_order_detail(
        &self,
        order_id: i64,
        access_token: &str,
    ) -> Result<OrderSummary, MeliError> {
        let url = self.api_url(&format!("/orders/{order_id}"));
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

    pub(crate) async fn request_shipment_detail(
        &self,
        shipment_id: i64,
        access_token: &str,
    ) -> Result<ShippingInfo, MeliError> {
        let url = self.api_url(&format!("/shipments/{shipment_id}"));
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_parses_with_object_state() {
        let raw = r#"{
            "id": 2000001,
            "pack_id": 3000001,
            "date_created": "2025-05-01T12:30:00Z",
            "buyer": {"id": 123, "nickname": "COMPRADOR1", "first_name": "Ana"},
            "shipping": {
                "id": 555,
                "shipping_mode": "me2",
                "receiver_address": {"state": {"id": "AR-B", "name": "Buenos Aires"}}
            }
        }"#;
        let order: OrderSummary = serde_json::from_str(raw).expect("order");
        assert_eq!(order.pack_or_order_id(), "3000001");
        let shipping = order.shipping.expect("shipping");
        assert_eq!(shipping.method().as_deref(), Some("me2"));
        assert_eq!(shipping.province().as_deref(), Some("Buenos Aires"));
    }

    #[test]
    fn order_parses_with_plain_state_and_no_pack() {
        let raw = r#"{
            "id": 2000002,
            "date_created": "2025-05-02T09:00:00Z",
            "buyer": {"id": 456},
            "shipping": {"logistic_type": "fulfillment", "receiver_address": {"state": "Córdoba"}}
        }"#;
        let order: OrderSummary = serde_json::from_str(raw).expect("order");
        assert_eq!(order.pack_or_order_id(), "2000002");
        let shipping = order.shipping.expect("shipping");
        assert_eq!(shipping.method().as_deref(), Some("fulfillment"));
        assert_eq!(shipping.province().as_deref(), Some("Córdoba"));
    }

    #[test]
    fn buyerless_order_still_parses() {
        let raw = r#"{"id": 2000003, "date_created": "2025-05-03T09:00:00Z"}"#;
        let order: OrderSummary = serde_json::from_str(raw).expect("order");
        assert!(order.buyer.is_none());
        assert!(order.shipping.is_none());
    }
}
