use super::{MeliClient, MeliError, status_error};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;
use urlencoding::encode;

const SEARCH_PAGE_SIZE: usize = 50;
// Safety valve for sellers with enormous catalogs; one page covers most.
const SEARCH_MAX_PAGES: usize = 20;

#[derive(Debug, Clone, Deserialize)]
pub struct ItemDetail {
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub site_id: Option<String>,
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub permalink: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BatchEntry {
    code: u16,
    #[serde(default)]
    body: Option<ItemDetail>,
}

#[derive(Debug, Deserialize)]
struct ItemSearchPage {
    #[serde(default)]
    results: Vec<String>,
    #[serde(default)]
    paging: Paging,
}

#[derive(Debug, Default, Deserialize)]
struct Paging {
    #[serde(default)]
    total: usize,
}

impl MeliClient {
    pub(crate) async fn request_item_detail(
        &self,
        item_id: &str,
        access_token: Option<&str>,
    ) -> Result<ItemDetail, MeliError> {
        let url = self.api_url(&format!("/items/{}", encode(item_id)));
        let mut request = self.http.get(url).header("Accept", "application/json");
        if let Some(token) = access_token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await.map_err(MeliError::request)?;

        if !response.status().is_success() {
            return Err(status_error(response).await);
        }

        response.json().await.map_err(MeliError::deserialize)
    }

    /// Multiget; entries whose per-item code is not 200 are dropped.
    pub(crate) async fn request_items_batch(
        &self,
        item_ids: &[String],
        access_token: &str,
    ) -> Result<Vec<ItemDetail>, MeliError> {
        if item_ids.is_empty() {
            return Ok(Vec::new());
        }
        let url = self.api_url("/items");
        let response = self
            .http
            .get(url)
            .query(&[("ids", item_ids.join(","))])
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(MeliError::request)?;

        if !response.status().is_success() {
            return Err(status_error(response).await);
        }

        let entries: Vec<BatchEntry> = response.json().await.map_err(MeliError::deserialize)?;
        Ok(entries
            .into_iter()
            .filter(|entry| entry.code == 200)
            .filter_map(|entry| entry.body)
            .collect())
    }

    /// All active listing ids for a seller, walking offset/limit pages.
    pub(crate) async fn request_active_item_ids(
        &self,
        seller_id: i64,
        access_token: &str,
    ) -> Result<Vec<String>, MeliError> {
        let url = self.api_url(&format!("/users/{seller_id}/items/search"));
        let mut ids = Vec::new();
        let mut offset = 0usize;

        for page in 0..SEARCH_MAX_PAGES {
            let response = self
                .http
                .get(&url)
                .query(&[
                    ("status", "active".to_string()),
                    ("offset", offset.to_string()),
                    ("limit", SEARCH_PAGE_SIZE.to_string()),
                ])
                .bearer_auth(access_token)
                .send()
                .await
                .map_err(MeliError::request)?;

            if !response.status().is_success() {
                return Err(status_error(response).await);
            }

            let page_data: ItemSearchPage = response.json().await.map_err(MeliError::deserialize)?;
            if page_data.results.is_empty() {
                break;
            }
            ids.extend(page_data.results);
            offset += SEARCH_PAGE_SIZE;
            if offset >= page_data.paging.total {
                break;
            }
            if page + 1 == SEARCH_MAX_PAGES {
                debug!(
                    target = "pampero.meli",
                    seller_id,
                    fetched = ids.len(),
                    total = page_data.paging.total,
                    "active listing search truncated at page cap"
                );
            }
        }

        Ok(ids)
    }

    pub(crate) async fn request_price_update(
        &self,
        item_id: &str,
        price: f64,
        access_token: &str,
    ) -> Result<(), MeliError> {
        let url = self.api_url(&format!("/items/{}", encode(item_id)));
        let response = self
            .http
            .put(url)
            .bearer_auth(access_token)
            .header("Accept", "application/json")
            .json(&json!({ "price": price }))
            .send()
            .await
            .map_err(MeliError::request)?;

        if !response.status().is_success() {
            return Err(status_error(response).await);
        }

        Ok(())
    }
}
