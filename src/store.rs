use crate::http::shared_client;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage request failed: {0}")]
    Request(String),
    #[error("invalid storage response: {0}")]
    Deserialize(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: Uuid,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub meli_user_id: Option<i64>,
    #[serde(default)]
    pub meli_access_token: Option<String>,
    #[serde(default)]
    pub meli_refresh_token: Option<String>,
    #[serde(default)]
    pub meli_token_expires_at: Option<DateTime<Utc>>,
}

impl UserRecord {
    pub fn bare(id: Uuid) -> Self {
        Self {
            id,
            name: None,
            email: None,
            meli_user_id: None,
            meli_access_token: None,
            meli_refresh_token: None,
            meli_token_expires_at: None,
        }
    }

    /// A user counts as linked once a marketplace id, a refresh token and an
    /// expiry are on record. The access token may be absent (it is refreshed
    /// on demand).
    pub fn credentials(&self) -> Option<MeliCredentials> {
        Some(MeliCredentials {
            meli_user_id: self.meli_user_id?,
            access_token: self.meli_access_token.clone(),
            refresh_token: self.meli_refresh_token.clone()?,
            expires_at: self.meli_token_expires_at?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct MeliCredentials {
    pub meli_user_id: i64,
    pub access_token: Option<String>,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CredentialUpdate {
    pub meli_user_id: i64,
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomerRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub meli_buyer_id: i64,
    pub nickname: String,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CustomerUpsert {
    pub meli_buyer_id: i64,
    pub nickname: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRecord {
    pub meli_order_id: String,
    pub customer_id: Uuid,
    pub order_date: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductRecord {
    pub id: String,
    pub user_id: Uuid,
    pub title: String,
    pub price: f64,
    #[serde(default)]
    pub promotion_id: Option<String>,
    #[serde(default)]
    pub promotion_expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub promotion_link: Option<String>,
}

/// Persistence seam for the Integration Core. Every component receives this
/// as an explicitly constructed handle; nothing reaches for a process-wide
/// client.
#[async_trait]
pub trait Store: Send + Sync {
    async fn user(&self, user_id: Uuid) -> Result<Option<UserRecord>, StoreError>;
    async fn user_by_meli_id(&self, meli_user_id: i64) -> Result<Option<UserRecord>, StoreError>;
    async fn save_credentials(
        &self,
        user_id: Uuid,
        update: &CredentialUpdate,
    ) -> Result<(), StoreError>;
    async fn clear_credentials(&self, user_id: Uuid) -> Result<(), StoreError>;

    /// Create on first sight, update nickname/name/email on every run.
    /// Keyed by (user, marketplace buyer id).
    async fn upsert_customer(
        &self,
        user_id: Uuid,
        upsert: &CustomerUpsert,
    ) -> Result<CustomerRecord, StoreError>;
    async fn customers(&self, user_id: Uuid) -> Result<Vec<CustomerRecord>, StoreError>;
    async fn customer(
        &self,
        user_id: Uuid,
        customer_id: Uuid,
    ) -> Result<Option<CustomerRecord>, StoreError>;

    async fn record_order(&self, order: &OrderRecord) -> Result<(), StoreError>;
    async fn latest_order(&self, customer_id: Uuid) -> Result<Option<OrderRecord>, StoreError>;

    async fn upsert_product(&self, product: &ProductRecord) -> Result<(), StoreError>;
    async fn products(&self, user_id: Uuid) -> Result<Vec<ProductRecord>, StoreError>;
}

/// Pick the backing store from the environment: Supabase/PostgREST when
/// configured, otherwise process memory (demo mode).
pub fn store_from_env(seed_users: &[Uuid]) -> Arc<dyn Store> {
    match SupabaseStore::from_env() {
        Some(store) => Arc::new(store),
        None => {
            tracing::warn!(
                target = "pampero.store",
                "SUPABASE_URL not set; using in-memory storage"
            );
            Arc::new(MemStore::with_users(seed_users))
        }
    }
}

// ---------------------------------------------------------------------------
// Supabase/PostgREST implementation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SupabaseStore {
    base_url: String,
    service_key: String,
    http: Client,
}

impl SupabaseStore {
    pub fn from_env() -> Option<Self> {
        let base_url = std::env::var("SUPABASE_URL").ok()?;
        let service_key = std::env::var("SUPABASE_SERVICE_ROLE_KEY")
            .or_else(|_| std::env::var("SUPABASE_SERVICE_KEY"))
            .or_else(|_| std::env::var("SUPABASE_KEY"))
            .ok()?;
        Some(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            service_key,
            http: shared_client(),
        })
    }

    fn rest_url(&self, path: &str) -> String {
        format!("{}/rest/v1/{path}", self.base_url)
    }

    fn authed(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request
            .header("apikey", &self.service_key)
            .header("Authorization", format!("Bearer {}", self.service_key))
    }

    async fn fetch_rows<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
    ) -> Result<Vec<T>, StoreError> {
        let response = self
            .authed(self.http.get(self.rest_url(path)))
            .send()
            .await
            .map_err(|err| StoreError::Request(err.to_string()))?;

        if !response.status().is_success() {
            return Err(StoreError::Request(format!(
                "HTTP {}",
                response.status()
            )));
        }

        response
            .json()
            .await
            .map_err(|err| StoreError::Deserialize(err.to_string()))
    }

    async fn merge_rows(&self, path: &str, body: &serde_json::Value) -> Result<(), StoreError> {
        let response = self
            .authed(self.http.post(self.rest_url(path)))
            .header("Prefer", "resolution=merge-duplicates")
            .json(body)
            .send()
            .await
            .map_err(|err| StoreError::Request(err.to_string()))?;

        if !response.status().is_success() {
            return Err(StoreError::Request(format!(
                "HTTP {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn patch_rows(&self, path: &str, body: &serde_json::Value) -> Result<(), StoreError> {
        let response = self
            .authed(self.http.patch(self.rest_url(path)))
            .json(body)
            .send()
            .await
            .map_err(|err| StoreError::Request(err.to_string()))?;

        if !response.status().is_success() {
            return Err(StoreError::Request(format!(
                "HTTP {}",
                response.status()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Store for SupabaseStore {
    async fn user(&self, user_id: Uuid) -> Result<Option<UserRecord>, StoreError> {
        let mut rows: Vec<UserRecord> = self
            .fetch_rows(&format!("users?id=eq.{user_id}&select=*&limit=1"))
            .await?;
        Ok(rows.pop())
    }

    async fn user_by_meli_id(&self, meli_user_id: i64) -> Result<Option<UserRecord>, StoreError> {
        let mut rows: Vec<UserRecord> = self
            .fetch_rows(&format!(
                "users?meli_user_id=eq.{meli_user_id}&select=*&limit=1"
            ))
            .await?;
        Ok(rows.pop())
    }

    async fn save_credentials(
        &self,
        user_id: Uuid,
        update: &CredentialUpdate,
    ) -> Result<(), StoreError> {
        self.patch_rows(
            &format!("users?id=eq.{user_id}"),
            &serde_json::json!({
                "meli_user_id": update.meli_user_id,
                "meli_access_token": update.access_token,
                "meli_refresh_token": update.refresh_token,
                "meli_token_expires_at": update.expires_at,
            }),
        )
        .await
    }

    async fn clear_credentials(&self, user_id: Uuid) -> Result<(), StoreError> {
        self.patch_rows(
            &format!("users?id=eq.{user_id}"),
            &serde_json::json!({
                "meli_user_id": null,
                "meli_access_token": null,
                "meli_refresh_token": null,
                "meli_token_expires_at": null,
            }),
        )
        .await
    }

    async fn upsert_customer(
        &self,
        user_id: Uuid,
        upsert: &CustomerUpsert,
    ) -> Result<CustomerRecord, StoreError> {
        let existing: Vec<CustomerRecord> = self
            .fetch_rows(&format!(
                "customers?user_id=eq.{user_id}&meli_buyer_id=eq.{}&select=*&limit=1",
                upsert.meli_buyer_id
            ))
            .await?;
        let id = existing
            .first()
            .map(|row| row.id)
            .unwrap_or_else(Uuid::new_v4);
        let record = CustomerRecord {
            id,
            user_id,
            meli_buyer_id: upsert.meli_buyer_id,
            nickname: upsert.nickname.clone(),
            first_name: upsert.first_name.clone(),
            last_name: upsert.last_name.clone(),
            email: upsert.email.clone(),
        };
        self.merge_rows(
            "customers?on_conflict=user_id,meli_buyer_id",
            &serde_json::to_value(&record)
                .map_err(|err| StoreError::Deserialize(err.to_string()))?,
        )
        .await?;
        Ok(record)
    }

    async fn customers(&self, user_id: Uuid) -> Result<Vec<CustomerRecord>, StoreError> {
        self.fetch_rows(&format!("customers?user_id=eq.{user_id}&select=*"))
            .await
    }

    async fn customer(
        &self,
        user_id: Uuid,
        customer_id: Uuid,
    ) -> Result<Option<CustomerRecord>, StoreError> {
        let mut rows: Vec<CustomerRecord> = self
            .fetch_rows(&format!(
                "customers?user_id=eq.{user_id}&id=eq.{customer_id}&select=*&limit=1"
            ))
            .await?;
        Ok(rows.pop())
    }

    async fn record_order(&self, order: &OrderRecord) -> Result<(), StoreError> {
        self.merge_rows(
            "orders?on_conflict=meli_order_id",
            &serde_json::to_value(order)
                .map_err(|err| StoreError::Deserialize(err.to_string()))?,
        )
        .await
    }

    async fn latest_order(&self, customer_id: Uuid) -> Result<Option<OrderRecord>, StoreError> {
        let mut rows: Vec<OrderRecord> = self
            .fetch_rows(&format!(
                "orders?customer_id=eq.{customer_id}&select=*&order=order_date.desc&limit=1"
            ))
            .await?;
        Ok(rows.pop())
    }

    async fn upsert_product(&self, product: &ProductRecord) -> Result<(), StoreError> {
        self.merge_rows(
            "products?on_conflict=id",
            &serde_json::to_value(product)
                .map_err(|err| StoreError::Deserialize(err.to_string()))?,
        )
        .await
    }

    async fn products(&self, user_id: Uuid) -> Result<Vec<ProductRecord>, StoreError> {
        self.fetch_rows(&format!("products?user_id=eq.{user_id}&select=*"))
            .await
    }
}

// ---------------------------------------------------------------------------
// In-memory implementation (demo mode and tests)
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemState {
    users: HashMap<Uuid, UserRecord>,
    customers: Vec<CustomerRecord>,
    orders: HashMap<String, OrderRecord>,
    products: HashMap<String, ProductRecord>,
}

#[derive(Default)]
pub struct MemStore {
    state: Mutex<MemState>,
}

impl MemStore {
    pub fn with_users(user_ids: &[Uuid]) -> Self {
        let store = Self::default();
        {
            let mut state = store.state.try_lock().expect("fresh store");
            for id in user_ids {
                state.users.insert(*id, UserRecord::bare(*id));
            }
        }
        store
    }
}

#[async_trait]
impl Store for MemStore {
    async fn user(&self, user_id: Uuid) -> Result<Option<UserRecord>, StoreError> {
        Ok(self.state.lock().await.users.get(&user_id).cloned())
    }

    async fn user_by_meli_id(&self, meli_user_id: i64) -> Result<Option<UserRecord>, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .users
            .values()
            .find(|user| user.meli_user_id == Some(meli_user_id))
            .cloned())
    }

    async fn save_credentials(
        &self,
        user_id: Uuid,
        update: &CredentialUpdate,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let user = state
            .users
            .entry(user_id)
            .or_insert_with(|| UserRecord::bare(user_id));
        user.meli_user_id = Some(update.meli_user_id);
        user.meli_access_token = Some(update.access_token.clone());
        user.meli_refresh_token = Some(update.refresh_token.clone());
        user.meli_token_expires_at = Some(update.expires_at);
        Ok(())
    }

    async fn clear_credentials(&self, user_id: Uuid) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if let Some(user) = state.users.get_mut(&user_id) {
            user.meli_user_id = None;
            user.meli_access_token = None;
            user.meli_refresh_token = None;
            user.meli_token_expires_at = None;
        }
        Ok(())
    }

    async fn upsert_customer(
        &self,
        user_id: Uuid,
        upsert: &CustomerUpsert,
    ) -> Result<CustomerRecord, StoreError> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state
            .customers
            .iter_mut()
            .find(|c| c.user_id == user_id && c.meli_buyer_id == upsert.meli_buyer_id)
        {
            existing.nickname = upsert.nickname.clone();
            existing.first_name = upsert.first_name.clone();
            existing.last_name = upsert.last_name.clone();
            existing.email = upsert.email.clone();
            return Ok(existing.clone());
        }
        let record = CustomerRecord {
            id: Uuid::new_v4(),
            user_id,
            meli_buyer_id: upsert.meli_buyer_id,
            nickname: upsert.nickname.clone(),
            first_name: upsert.first_name.clone(),
            last_name: upsert.last_name.clone(),
            email: upsert.email.clone(),
        };
        state.customers.push(record.clone());
        Ok(record)
    }

    async fn customers(&self, user_id: Uuid) -> Result<Vec<CustomerRecord>, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .customers
            .iter()
            .filter(|c| c.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn customer(
        &self,
        user_id: Uuid,
        customer_id: Uuid,
    ) -> Result<Option<CustomerRecord>, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .customers
            .iter()
            .find(|c| c.user_id == user_id && c.id == customer_id)
            .cloned())
    }

    async fn record_order(&self, order: &OrderRecord) -> Result<(), StoreError> {
        self.state
            .lock()
            .await
            .orders
            .insert(order.meli_order_id.clone(), order.clone());
        Ok(())
    }

    async fn latest_order(&self, customer_id: Uuid) -> Result<Option<OrderRecord>, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .orders
            .values()
            .filter(|order| order.customer_id == customer_id)
            .max_by_key(|order| order.order_date)
            .cloned())
    }

    async fn upsert_product(&self, product: &ProductRecord) -> Result<(), StoreError> {
        self.state
            .lock()
            .await
            .products
            .insert(product.id.clone(), product.clone());
        Ok(())
    }

    async fn products(&self, user_id: Uuid) -> Result<Vec<ProductRecord>, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .products
            .values()
            .filter(|product| product.user_id == user_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn update(meli_user_id: i64) -> CredentialUpdate {
        CredentialUpdate {
            meli_user_id,
            access_token: "token".into(),
            refresh_token: "refresh".into(),
            expires_at: Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap(),
        }
    }

    #[tokio::test]
    async fn customer_upsert_is_keyed_by_user_and_buyer() {
        let store = MemStore::default();
        let user = Uuid::new_v4();
        let first = store
            .upsert_customer(
                user,
                &CustomerUpsert {
                    meli_buyer_id: 42,
                    nickname: "COMPRADOR".into(),
                    first_name: None,
                    last_name: None,
                    email: None,
                },
            )
            .await
            .unwrap();
        let second = store
            .upsert_customer(
                user,
                &CustomerUpsert {
                    meli_buyer_id: 42,
                    nickname: "COMPRADOR".into(),
                    first_name: Some("Ana".into()),
                    last_name: None,
                    email: None,
                },
            )
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        let all = store.customers(user).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].first_name.as_deref(), Some("Ana"));
    }

    #[tokio::test]
    async fn latest_order_picks_newest_date() {
        let store = MemStore::default();
        let customer_id = Uuid::new_v4();
        for (id, day) in [("100", 1), ("101", 3), ("102", 2)] {
            store
                .record_order(&OrderRecord {
                    meli_order_id: id.into(),
                    customer_id,
                    order_date: Utc.with_ymd_and_hms(2025, 5, day, 0, 0, 0).unwrap(),
                })
                .await
                .unwrap();
        }
        let latest = store.latest_order(customer_id).await.unwrap().unwrap();
        assert_eq!(latest.meli_order_id, "101");
    }

    #[tokio::test]
    async fn meli_identity_lookup_finds_owner() {
        let store = MemStore::default();
        let owner = Uuid::new_v4();
        store.save_credentials(owner, &update(900)).await.unwrap();

        let found = store.user_by_meli_id(900).await.unwrap().unwrap();
        assert_eq!(found.id, owner);
        assert!(store.user_by_meli_id(901).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn clear_credentials_unlinks() {
        let store = MemStore::default();
        let user = Uuid::new_v4();
        store.save_credentials(user, &update(900)).await.unwrap();
        store.clear_credentials(user).await.unwrap();
        let record = store.user(user).await.unwrap().unwrap();
        assert!(record.credentials().is_none());
    }

    #[tokio::test]
    async fn product_upsert_overwrites_promotion_metadata() {
        let store = MemStore::default();
        let user = Uuid::new_v4();
        let base = ProductRecord {
            id: "MLA1".into(),
            user_id: user,
            title: "Producto".into(),
            price: 100.0,
            promotion_id: Some("P1".into()),
            promotion_expires_at: None,
            promotion_link: None,
        };
        store.upsert_product(&base).await.unwrap();
        store
            .upsert_product(&ProductRecord {
                promotion_id: Some("P2".into()),
                ..base.clone()
            })
            .await
            .unwrap();

        let products = store.products(user).await.unwrap();
        assert_eq!(products.len(), 1);
        assert_eq!(products[0].promotion_id.as_deref(), Some("P2"));
    }
}
