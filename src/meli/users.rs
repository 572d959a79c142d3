use super::{MeliClient, MeliError, status_error};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeliUserProfile {
    pub id: i64,
    #[serde(default)]
    pub nickname: Option<String>,
    #[serde(default)]
    pub site_id: Option<String>,
    #[serde(default)]
    pub seller_reputation: Option<SellerReputation>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SellerReputation {
    #[serde(default)]
    pub level_id: Option<String>,
    #[serde(default)]
    pub status: Option<ReputationStatus>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReputationStatus {
    #[serde(default)]
    pub status: Option<String>,
}

impl MeliClient {
    // Public profile endpoint; no bearer token required.
    pub(crate) async fn request_user_profile(
        &self,
        meli_user_id: i64,
    ) -> Result<MeliUserProfile, MeliError> {
        let url = self.api_url(&format!("/users/{meli_user_id}"));
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(MeliError::request)?;

        if !response.status().is_success() {
            return Err(status_error(response).await);
        }

        response.json().await.map_err(MeliError::deserialize)
    }
}
