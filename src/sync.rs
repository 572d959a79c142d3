use crate::meli::{BuyerInfo, MeliError, MeliGateway, OrderSummary, ShippingInfo};
use crate::models::CustomerSummary;
use crate::store::{CustomerUpsert, OrderRecord, Store, StoreError};
use crate::token::{TokenError, TokenManager};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

const DEFAULT_NICKNAME: &str = "Usuario sin nombre";

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Token(#[from] TokenError),
    #[error("order search failed: {0}")]
    Upstream(MeliError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Running aggregate per marketplace buyer, rebuilt from the live feed on
/// every sync. Last-order fields only move forward on a strictly newer date;
/// equal dates keep the first-seen order.
#[derive(Debug)]
struct BuyerStats {
    count: u32,
    last_order_id: String,
    last_order_date: DateTime<Utc>,
    last_shipping_method: Option<String>,
    last_province: Option<String>,
}

/// Fields we try to resolve for an order beyond what the search feed carries.
#[derive(Debug, Default, Clone)]
struct Enrichment {
    first_name: Option<String>,
    last_name: Option<String>,
    email: Option<String>,
    shipping_method: Option<String>,
    province: Option<String>,
    shipment_id: Option<i64>,
}

impl Enrichment {
    fn buyer_complete(&self) -> bool {
        self.first_name.is_some() && self.last_name.is_some() && self.email.is_some()
    }

    fn shipping_complete(&self) -> bool {
        self.shipping_method.is_some() && self.province.is_some()
    }

    fn merge_buyer(&mut self, buyer: &BuyerInfo) {
        self.first_name = self.first_name.take().or_else(|| buyer.first_name.clone());
        self.last_name = self.last_name.take().or_else(|| buyer.last_name.clone());
        self.email = self.email.take().or_else(|| buyer.email.clone());
    }

    fn merge_shipping(&mut self, shipping: &ShippingInfo) {
        self.shipping_method = self.shipping_method.take().or_else(|| shipping.method());
        self.province = self.province.take().or_else(|| shipping.province());
        self.shipment_id = self.shipment_id.or(shipping.id);
    }
}

/// Pulls the seller's order feed and folds it into deduplicated customer
/// aggregates, upserting one Customer row per distinct buyer.
#[derive(Clone)]
pub struct OrderAggregator {
    store: Arc<dyn Store>,
    meli: Arc<dyn MeliGateway>,
    tokens: TokenManager,
}

impl OrderAggregator {
    pub fn new(store: Arc<dyn Store>, meli: Arc<dyn MeliGateway>, tokens: TokenManager) -> Self {
        Self {
            store,
            meli,
            tokens,
        }
    }

    pub async fn sync(&self, user_id: Uuid) -> Result<Vec<CustomerSummary>, SyncError> {
        let token = self.tokens.access_token(user_id).await?;
        let seller_id = self.tokens.seller_id(user_id).await?;

        let orders = self
            .meli
            .search_orders(seller_id, &token)
            .await
            .map_err(SyncError::Upstream)?;

        let mut stats: HashMap<i64, BuyerStats> = HashMap::new();
        // Buyer name/email lookups are cached per run so several orders from
        // the same buyer cost one detail call.
        let mut buyer_cache: HashMap<i64, BuyerInfo> = HashMap::new();

        for order in &orders {
            let Some(buyer) = order.buyer.as_ref() else {
                info!(
                    target = "pampero.sync",
                    order_id = order.id,
                    "order without buyer data, skipping"
                );
                continue;
            };

            let enriched = self
                .enrich(order, buyer, &token, &mut buyer_cache)
                .await;

            let pack_id = order.pack_or_order_id();
            match stats.get_mut(&buyer.id) {
                Some(entry) => {
                    entry.count += 1;
                    if order.date_created > entry.last_order_date {
                        entry.last_order_id = pack_id.clone();
                        entry.last_order_date = order.date_created;
                        entry.last_shipping_method = enriched.shipping_method.clone();
                        entry.last_province = enriched.province.clone();
                    }
                }
                None => {
                    stats.insert(
                        buyer.id,
                        BuyerStats {
                            count: 1,
                            last_order_id: pack_id.clone(),
                            last_order_date: order.date_created,
                            last_shipping_method: enriched.shipping_method.clone(),
                            last_province: enriched.province.clone(),
                        },
                    );
                }
            }

            // Even a buyer with zero resolvable fields gets a row; the order
            // still happened.
            let customer = self
                .store
                .upsert_customer(
                    user_id,
                    &CustomerUpsert {
                        meli_buyer_id: buyer.id,
                        nickname: buyer
                            .nickname
                            .clone()
                            .unwrap_or_else(|| DEFAULT_NICKNAME.to_string()),
                        first_name: enriched.first_name.clone(),
                        last_name: enriched.last_name.clone(),
                        email: enriched.email.clone(),
                    },
                )
                .await?;
            self.store
                .record_order(&OrderRecord {
                    meli_order_id: pack_id,
                    customer_id: customer.id,
                    order_date: order.date_created,
                })
                .await?;
        }

        crate::metrics::orders_aggregated(orders.len());

        let customers = self.store.customers(user_id).await?;
        Ok(customers
            .into_iter()
            .map(|customer| {
                let entry = stats.get(&customer.meli_buyer_id);
                CustomerSummary {
                    id: customer.id,
                    meli_buyer_id: customer.meli_buyer_id,
                    nickname: customer.nickname,
                    first_name: customer.first_name,
                    last_name: customer.last_name,
                    email: customer.email,
                    purchase_count: entry.map(|s| s.count).unwrap_or(0),
                    last_order_id: entry.map(|s| s.last_order_id.clone()),
                    last_shipping_method: entry.and_then(|s| s.last_shipping_method.clone()),
                    province: entry.and_then(|s| s.last_province.clone()),
                }
            })
            .collect())
    }

    /// Ordered enrichment: the search feed first, then the order detail, then
    /// the shipment as a last resort. Each strategy is independently fallible
    /// and only fills fields the previous ones left empty.
    async fn enrich(
        &self,
        order: &OrderSummary,
        buyer: &BuyerInfo,
        token: &str,
        buyer_cache: &mut HashMap<i64, BuyerInfo>,
    ) -> Enrichment {
        let mut enriched = Enrichment::default();
        enriched.merge_buyer(buyer);
        if let Some(cached) = buyer_cache.get(&buyer.id) {
            enriched.merge_buyer(cached);
        }
        if let Some(shipping) = order.shipping.as_ref() {
            enriched.merge_shipping(shipping);
        }

        if !enriched.buyer_complete() || !enriched.shipping_complete() {
            match self.meli.order_detail(order.id, token).await {
                Ok(detail) => {
                    if let Some(detail_buyer) = detail.buyer.as_ref() {
                        enriched.merge_buyer(detail_buyer);
                        buyer_cache.insert(buyer.id, detail_buyer.clone());
                    }
                    if let Some(detail_shipping) = detail.shipping.as_ref() {
                        enriched.merge_shipping(detail_shipping);
                    }
                }
                Err(err) => {
                    warn!(
                        target = "pampero.sync",
                        order_id = order.id,
                        error = %err,
                        "order detail fetch failed"
                    );
                }
            }
        }

        if !enriched.shipping_complete()
            && let Some(shipment_id) = enriched.shipment_id
        {
            match self.meli.shipment_detail(shipment_id, token).await {
                Ok(shipment) => enriched.merge_shipping(&shipment),
                Err(err) => {
                    warn!(
                        target = "pampero.sync",
                        order_id = order.id,
                        shipment_id,
                        error = %err,
                        "shipment detail fetch failed"
                    );
                }
            }
        }

        enriched
    }
}
