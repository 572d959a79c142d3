//! Hand-rolled fakes shared by the component test suites. The marketplace
//! fake is scripted per test and counts calls, which the refresh-window and
//! poll-bound properties assert on.

use crate::meli::{
    BuyerInfo, CreatePromotionRequest, ItemDetail, MeliError, MeliGateway, MeliUserProfile,
    OrderSummary, PromotionDetail, ShippingInfo, TokenGrant,
};
use crate::meli::orders::{ReceiverAddress, StateField};
use crate::meli::users::{ReputationStatus, SellerReputation};
use crate::store::{CredentialUpdate, MemStore, Store};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct SentMessage {
    pub pack_id: String,
    pub seller_meli_id: i64,
    pub buyer_meli_id: i64,
    pub text: String,
}

#[derive(Default)]
struct FakeState {
    total_calls: u32,
    refresh_calls: u32,
    create_promotion_calls: u32,
    promotion_status_calls: u32,

    refresh_response: Option<TokenGrant>,
    exchange_response: Option<TokenGrant>,
    orders: Vec<OrderSummary>,
    order_details: HashMap<i64, OrderSummary>,
    shipments: HashMap<i64, ShippingInfo>,
    profiles: HashMap<i64, MeliUserProfile>,
    items: HashMap<String, ItemDetail>,
    eligible_items: Vec<String>,
    created_promotion: Option<PromotionDetail>,
    creation_failure: Option<(u16, String)>,
    poll_responses: Vec<PromotionDetail>,
    poll_cursor: usize,
    failing_buyers: Vec<i64>,
    sent_messages: Vec<SentMessage>,
}

#[derive(Default)]
pub struct FakeMeli {
    state: Mutex<FakeState>,
}

fn not_found() -> MeliError {
    MeliError::Status {
        status: 404,
        detail: "not found".into(),
    }
}

impl FakeMeli {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_refresh_response(&self, grant: TokenGrant) {
        self.state.lock().unwrap().refresh_response = Some(grant);
    }

    pub fn set_exchange_response(&self, grant: TokenGrant) {
        self.state.lock().unwrap().exchange_response = Some(grant);
    }

    pub fn set_orders(&self, orders: Vec<OrderSummary>) {
        self.state.lock().unwrap().orders = orders;
    }

    pub fn set_order_detail(&self, order_id: i64, detail: OrderSummary) {
        self.state
            .lock()
            .unwrap()
            .order_details
            .insert(order_id, detail);
    }

    pub fn set_shipment(&self, shipment_id: i64, shipment: ShippingInfo) {
        self.state
            .lock()
            .unwrap()
            .shipments
            .insert(shipment_id, shipment);
    }

    pub fn set_profile(&self, profile: MeliUserProfile) {
        self.state.lock().unwrap().profiles.insert(profile.id, profile);
    }

    pub fn set_item(&self, item: ItemDetail) {
        self.state.lock().unwrap().items.insert(item.id.clone(), item);
    }

    pub fn set_eligible_items(&self, ids: Vec<String>) {
        self.state.lock().unwrap().eligible_items = ids;
    }

    pub fn set_created_promotion(&self, detail: PromotionDetail) {
        let mut state = self.state.lock().unwrap();
        state.created_promotion = Some(detail);
        state.creation_failure = None;
    }

    pub fn fail_promotion_creation(&self, status: u16, body: &str) {
        self.state.lock().unwrap().creation_failure = Some((status, body.to_string()));
    }

    /// Scripted poll responses; once exhausted the last one repeats.
    pub fn set_poll_responses(&self, responses: Vec<PromotionDetail>) {
        let mut state = self.state.lock().unwrap();
        state.poll_responses = responses;
        state.poll_cursor = 0;
    }

    pub fn fail_sends_to(&self, buyer_meli_id: i64) {
        self.state.lock().unwrap().failing_buyers.push(buyer_meli_id);
    }

    pub fn total_calls(&self) -> u32 {
        self.state.lock().unwrap().total_calls
    }

    pub fn refresh_calls(&self) -> u32 {
        self.state.lock().unwrap().refresh_calls
    }

    pub fn create_promotion_calls(&self) -> u32 {
        self.state.lock().unwrap().create_promotion_calls
    }

    pub fn promotion_status_calls(&self) -> u32 {
        self.state.lock().unwrap().promotion_status_calls
    }

    pub fn sent_messages(&self) -> Vec<SentMessage> {
        self.state.lock().unwrap().sent_messages.clone()
    }
}

#[async_trait]
impl MeliGateway for FakeMeli {
    async fn exchange_code(&self, _code: &str, _verifier: &str) -> Result<TokenGrant, MeliError> {
        let mut state = self.state.lock().unwrap();
        state.total_calls += 1;
        state
            .exchange_response
            .clone()
            .ok_or_else(|| MeliError::Request("no exchange scripted".into()))
    }

    async fn refresh_tokens(&self, _refresh_token: &str) -> Result<TokenGrant, MeliError> {
        let mut state = self.state.lock().unwrap();
        state.total_calls += 1;
        state.refresh_calls += 1;
        state
            .refresh_response
            .clone()
            .ok_or_else(|| MeliError::Request("no refresh scripted".into()))
    }

    async fn search_orders(
        &self,
        _seller_id: i64,
        _access_token: &str,
    ) -> Result<Vec<OrderSummary>, MeliError> {
        let mut state = self.state.lock().unwrap();
        state.total_calls += 1;
        Ok(state.orders.clone())
    }

    async fn order_detail(
        &self,
        order_id: i64,
        _access_token: &str,
    ) -> Result<OrderSummary, MeliError> {
        let mut state = self.state.lock().unwrap();
        state.total_calls += 1;
        state
            .order_details
            .get(&order_id)
            .cloned()
            .ok_or_else(not_found)
    }

    async fn shipment_detail(
        &self,
        shipment_id: i64,
        _access_token: &str,
    ) -> Result<ShippingInfo, MeliError> {
        let mut state = self.state.lock().unwrap();
        state.total_calls += 1;
        state
            .shipments
            .get(&shipment_id)
            .cloned()
            .ok_or_else(not_found)
    }

    async fn user_profile(&self, meli_user_id: i64) -> Result<MeliUserProfile, MeliError> {
        let mut state = self.state.lock().unwrap();
        state.total_calls += 1;
        state
            .profiles
            .get(&meli_user_id)
            .cloned()
            .ok_or_else(not_found)
    }

    async fn item_detail(
        &self,
        item_id: &str,
        _access_token: Option<&str>,
    ) -> Result<ItemDetail, MeliError> {
        let mut state = self.state.lock().unwrap();
        state.total_calls += 1;
        state.items.get(item_id).cloned().ok_or_else(not_found)
    }

    async fn items_batch(
        &self,
        item_ids: &[String],
        _access_token: &str,
    ) -> Result<Vec<ItemDetail>, MeliError> {
        let mut state = self.state.lock().unwrap();
        state.total_calls += 1;
        Ok(item_ids
            .iter()
            .filter_map(|id| state.items.get(id).cloned())
            .collect())
    }

    async fn active_item_ids(
        &self,
        _seller_id: i64,
        _access_token: &str,
    ) -> Result<Vec<String>, MeliError> {
        let mut state = self.state.lock().unwrap();
        state.total_calls += 1;
        let mut ids: Vec<String> = state.items.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    async fn update_item_price(
        &self,
        item_id: &str,
        _price: f64,
        _access_token: &str,
    ) -> Result<(), MeliError> {
        let mut state = self.state.lock().unwrap();
        state.total_calls += 1;
        if state.items.contains_key(item_id) {
            Ok(())
        } else {
            Err(not_found())
        }
    }

    async fn eligible_item_ids(
        &self,
        _item_id: &str,
        _site_id: &str,
        _access_token: &str,
    ) -> Result<Vec<String>, MeliError> {
        let mut state = self.state.lock().unwrap();
        state.total_calls += 1;
        Ok(state.eligible_items.clone())
    }

    async fn create_promotion(
        &self,
        _request: &CreatePromotionRequest,
        _access_token: &str,
    ) -> Result<PromotionDetail, MeliError> {
        let mut state = self.state.lock().unwrap();
        state.total_calls += 1;
        state.create_promotion_calls += 1;
        if let Some((status, detail)) = state.creation_failure.clone() {
            return Err(MeliError::Status { status, detail });
        }
        state
            .created_promotion
            .clone()
            .ok_or_else(|| MeliError::Request("no promotion scripted".into()))
    }

    async fn promotion_status(
        &self,
        _promotion_id: &str,
        _access_token: &str,
    ) -> Result<PromotionDetail, MeliError> {
        let mut state = self.state.lock().unwrap();
        state.total_calls += 1;
        state.promotion_status_calls += 1;
        if state.poll_responses.is_empty() {
            return Err(MeliError::Request("no poll responses scripted".into()));
        }
        let index = state.poll_cursor.min(state.poll_responses.len() - 1);
        state.poll_cursor += 1;
        Ok(state.poll_responses[index].clone())
    }

    async fn send_message(
        &self,
        pack_id: &str,
        seller_meli_id: i64,
        buyer_meli_id: i64,
        text: &str,
        _access_token: &str,
    ) -> Result<(), MeliError> {
        let mut state = self.state.lock().unwrap();
        state.total_calls += 1;
        if state.failing_buyers.contains(&buyer_meli_id) {
            return Err(MeliError::Status {
                status: 403,
                detail: "blocked conversation".into(),
            });
        }
        state.sent_messages.push(SentMessage {
            pack_id: pack_id.to_string(),
            seller_meli_id,
            buyer_meli_id,
            text: text.to_string(),
        });
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Builders
// ---------------------------------------------------------------------------

pub fn grant(access: &str, refresh: &str, expires_in: i64, user_id: i64) -> TokenGrant {
    TokenGrant {
        access_token: access.to_string(),
        refresh_token: refresh.to_string(),
        expires_in,
        user_id,
    }
}

/// Seed a linked user into the store and return its id.
pub async fn linked_user(
    store: &MemStore,
    meli_user_id: i64,
    access_token: &str,
    expires_at: DateTime<Utc>,
) -> Uuid {
    let user_id = Uuid::new_v4();
    store
        .save_credentials(
            user_id,
            &CredentialUpdate {
                meli_user_id,
                access_token: access_token.to_string(),
                refresh_token: "refresh".to_string(),
                expires_at,
            },
        )
        .await
        .expect("seed user");
    user_id
}

pub fn order(id: i64, buyer_id: i64, date_created: DateTime<Utc>) -> OrderSummary {
    OrderSummary {
        id,
        pack_id: None,
        date_created,
        buyer: Some(BuyerInfo {
            id: buyer_id,
            nickname: None,
            first_name: None,
            last_name: None,
            email: None,
        }),
        shipping: None,
    }
}

pub fn order_with_shipping(
    id: i64,
    buyer_id: i64,
    date_created: DateTime<Utc>,
    method: &str,
    province: &str,
) -> OrderSummary {
    let mut base = order(id, buyer_id, date_created);
    base.shipping = Some(ShippingInfo {
        id: None,
        shipping_mode: Some(method.to_string()),
        mode: None,
        logistic_type: None,
        receiver_address: Some(ReceiverAddress {
            state: Some(StateField::Plain(province.to_string())),
        }),
    });
    base
}

pub fn profile_with_reputation(
    id: i64,
    level: Option<&str>,
    status: Option<&str>,
) -> MeliUserProfile {
    MeliUserProfile {
        id,
        nickname: None,
        site_id: Some("MLA".into()),
        seller_reputation: Some(SellerReputation {
            level_id: level.map(str::to_string),
            status: Some(ReputationStatus {
                status: status.map(str::to_string),
            }),
        }),
    }
}

pub fn item(id: &str, condition: &str, price: f64) -> ItemDetail {
    ItemDetail {
        id: id.to_string(),
        title: Some(format!("Listing {id}")),
        price: Some(price),
        site_id: Some("MLA".into()),
        condition: Some(condition.to_string()),
        permalink: Some(format!("https://articulo.mercadolibre.com.ar/{id}")),
        status: Some("active".into()),
    }
}

pub fn promotion_detail(id: &str, status: Option<&str>) -> PromotionDetail {
    PromotionDetail {
        id: id.to_string(),
        status: status.map(str::to_string),
        promotion_link: Some(format!("https://promos.example/{id}")),
        permalink: None,
        finish_date: None,
        end_date: None,
    }
}
