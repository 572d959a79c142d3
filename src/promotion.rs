use crate::eligibility;
use crate::meli::{CreatePromotionRequest, MeliError, MeliGateway, PromotionDetail};
use crate::models::{PromotionOutcome, PromotionRequest, PromotionSummary, StageReport};
use crate::store::{ProductRecord, Store, StoreError};
use crate::token::{TokenError, TokenManager};
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::time::{Duration, sleep};
use tracing::warn;
use uuid::Uuid;

pub const POLL_ATTEMPTS: u32 = 5;
const POLL_PAUSE: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum PromotionError {
    #[error("invalid promotion request: {0}")]
    InvalidRequest(String),
    #[error("seller {0} is not eligible for promotions")]
    SellerNotEligible(i64),
    #[error("item {item_id} is not eligible for promotions on {site_id}")]
    ItemNotEligible { item_id: String, site_id: String },
    #[error("promotions are restricted to new items; {0} is not new")]
    NotNewItem(String),
    #[error("promotion rejected upstream (HTTP {status}): {detail}")]
    Rejected { status: u16, detail: String },
    #[error(transparent)]
    Token(#[from] TokenError),
    #[error("marketplace request failed: {0}")]
    Upstream(#[from] MeliError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Drives a promotion from validation through marketplace submission,
/// activation polling, persistence and customer notification. Each phase is
/// captured into a stage transcript returned with the outcome.
#[derive(Clone)]
pub struct PromotionPipeline {
    store: Arc<dyn Store>,
    meli: Arc<dyn MeliGateway>,
    tokens: TokenManager,
    default_site_id: String,
    poll_pause: Duration,
}

impl PromotionPipeline {
    pub fn new(
        store: Arc<dyn Store>,
        meli: Arc<dyn MeliGateway>,
        tokens: TokenManager,
        default_site_id: String,
    ) -> Self {
        Self {
            store,
            meli,
            tokens,
            default_site_id,
            poll_pause: POLL_PAUSE,
        }
    }

    #[cfg(test)]
    fn with_poll_pause(mut self, pause: Duration) -> Self {
        self.poll_pause = pause;
        self
    }

    pub async fn run(
        &self,
        user_id: Uuid,
        request: PromotionRequest,
    ) -> Result<PromotionOutcome, PromotionError> {
        let mut stages = Vec::new();

        let started = Instant::now();
        validate(&request)?;
        push_stage(
            &mut stages,
            "validate",
            started,
            json!({
                "product_id": request.product_id.clone(),
                "discount_percent": request.discount_percent,
                "customer_count": request.customer_ids.len(),
            }),
        );

        // Seller gate: a linked identity in good standing.
        let started = Instant::now();
        let seller_id = self.tokens.seller_id(user_id).await?;
        if !eligibility::seller_eligible(self.meli.as_ref(), seller_id).await? {
            return Err(PromotionError::SellerNotEligible(seller_id));
        }
        let token = self.tokens.access_token(user_id).await?;
        push_stage(
            &mut stages,
            "seller_check",
            started,
            json!({ "seller_meli_id": seller_id }),
        );

        // Listing gate: promotions are restricted to new items.
        let started = Instant::now();
        let item = self
            .meli
            .item_detail(&request.product_id, Some(&token))
            .await?;
        if item.condition.as_deref() != Some("new") {
            return Err(PromotionError::NotNewItem(request.product_id.clone()));
        }
        let site_id = item
            .site_id
            .clone()
            .unwrap_or_else(|| self.default_site_id.clone());
        push_stage(
            &mut stages,
            "price_item",
            started,
            json!({
                "title": item.title.clone(),
                "price": item.price,
                "site_id": site_id.clone(),
            }),
        );

        let started = Instant::now();
        if !eligibility::item_eligible(self.meli.as_ref(), &request.product_id, &site_id, &token)
            .await?
        {
            return Err(PromotionError::ItemNotEligible {
                item_id: request.product_id.clone(),
                site_id,
            });
        }
        push_stage(&mut stages, "item_check", started, json!({ "eligible": true }));

        // Submit the asynchronous marketplace operation.
        let started = Instant::now();
        let submission = CreatePromotionRequest::price_discount(
            site_id.clone(),
            request.product_id.clone(),
            request.discount_percent,
            request.expires_at,
        );
        let created = self
            .meli
            .create_promotion(&submission, &token)
            .await
            .map_err(|err| match err {
                MeliError::Status { status, detail } => {
                    PromotionError::Rejected { status, detail }
                }
                other => PromotionError::Upstream(other),
            })?;
        push_stage(
            &mut stages,
            "submit",
            started,
            json!({ "promotion_id": created.id.clone(), "status": created.status.clone() }),
        );

        // Poll until active or the attempt budget runs out; a timeout is not
        // an error, we proceed with the best-known data.
        let started = Instant::now();
        let (promotion, attempts) = self.poll_until_active(created, &token).await;
        push_stage(
            &mut stages,
            "poll",
            started,
            json!({
                "attempts": attempts,
                "status": promotion.status.clone(),
                "active": promotion.is_active(),
            }),
        );

        let started = Instant::now();
        let expires_at = promotion.resolved_expiry(request.expires_at);
        let link = promotion.share_link().or_else(|| item.permalink.clone());
        self.store
            .upsert_product(&ProductRecord {
                id: request.product_id.clone(),
                user_id,
                title: item.title.clone().unwrap_or_default(),
                price: item.price.unwrap_or(0.0),
                promotion_id: Some(promotion.id.clone()),
                promotion_expires_at: Some(expires_at),
                promotion_link: link.clone(),
            })
            .await?;
        push_stage(
            &mut stages,
            "persist",
            started,
            json!({ "expires_at": expires_at, "link": link.clone() }),
        );

        // Fan out notifications. A failed or impossible send never aborts the
        // batch; it just drops that customer from the sent list.
        let started = Instant::now();
        let title = item
            .title
            .clone()
            .unwrap_or_else(|| "nuestro producto".to_string());
        let text = format!(
            "¡Hola! Te ofrecemos un {}% de descuento en {}. Aprovechá la oferta acá: {}",
            request.discount_percent,
            title,
            link.clone().unwrap_or_default(),
        );
        let mut sent = Vec::new();
        let mut skipped = 0usize;
        for customer_id in &request.customer_ids {
            let Some(customer) = self.store.customer(user_id, *customer_id).await? else {
                skipped += 1;
                continue;
            };
            let Some(last_order) = self.store.latest_order(customer.id).await? else {
                // No order history means no post-sale conversation to use.
                skipped += 1;
                continue;
            };
            match self
                .meli
                .send_message(
                    &last_order.meli_order_id,
                    seller_id,
                    customer.meli_buyer_id,
                    &text,
                    &token,
                )
                .await
            {
                Ok(()) => sent.push(*customer_id),
                Err(err) => {
                    warn!(
                        target = "pampero.promo",
                        customer_id = %customer_id,
                        error = %err,
                        "promotion notification failed"
                    );
                    skipped += 1;
                }
            }
        }
        push_stage(
            &mut stages,
            "notify",
            started,
            json!({ "sent": sent.len(), "skipped": skipped }),
        );

        let success = !sent.is_empty();
        Ok(PromotionOutcome {
            success,
            message: (!success).then(|| "no promotion notifications could be delivered".to_string()),
            promotions_sent: sent,
            promotion: Some(PromotionSummary {
                promotion_id: promotion.id,
                item_id: request.product_id,
                link,
                expires_at,
            }),
            stages,
        })
    }

    async fn poll_until_active(
        &self,
        created: PromotionDetail,
        token: &str,
    ) -> (PromotionDetail, u32) {
        let id = created.id.clone();
        let mut last_known = created;
        for attempt in 1..=POLL_ATTEMPTS {
            match self.meli.promotion_status(&id, token).await {
                Ok(detail) => {
                    let active = detail.is_active();
                    last_known = detail;
                    if active {
                        return (last_known, attempt);
                    }
                }
                Err(err) => {
                    warn!(
                        target = "pampero.promo",
                        promotion_id = %id,
                        attempt,
                        error = %err,
                        "promotion status poll failed"
                    );
                }
            }
            if attempt < POLL_ATTEMPTS {
                sleep(self.poll_pause).await;
            }
        }
        (last_known, POLL_ATTEMPTS)
    }
}

fn validate(request: &PromotionRequest) -> Result<(), PromotionError> {
    if request.product_id.trim().is_empty() {
        return Err(PromotionError::InvalidRequest(
            "product_id is required".into(),
        ));
    }
    if !(request.discount_percent > 0.0 && request.discount_percent < 100.0) {
        return Err(PromotionError::InvalidRequest(
            "discount_percent must be strictly between 0 and 100".into(),
        ));
    }
    if request.expires_at < Utc::now() {
        return Err(PromotionError::InvalidRequest(
            "expires_at must not be in the past".into(),
        ));
    }
    Ok(())
}

fn push_stage(
    stages: &mut Vec<StageReport>,
    name: &'static str,
    started: Instant,
    output: serde_json::Value,
) {
    let elapsed_ms = started.elapsed().as_millis();
    crate::metrics::stage_elapsed(name, elapsed_ms);
    stages.push(StageReport::new(name, elapsed_ms, output));
}
