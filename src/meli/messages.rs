use super::{MeliClient, MeliError, status_error};
use serde_json::json;
use urlencoding::encode;

impl MeliClient {
    /// One post-sale message from the seller to a buyer, scoped to the
    /// order/pack the conversation belongs to.
    pub(crate) async fn request_send_message(
        &self,
        pack_id: &str,
        seller_meli_id: i64,
        buyer_meli_id: i64,
        text: &str,
        access_token: &str,
    ) -> Result<(), MeliError> {
        let url = self.api_url(&format!(
            "/messages/packs/{}/sellers/{seller_meli_id}?tag=post_sale",
            encode(pack_id)
        ));
        let body = json!({
            "from": { "user_id": seller_meli_id },
            "to": { "user_id": buyer_meli_id },
            "text": text,
        });
        let response = self
            .http
            .post(url)
            .bearer_auth(access_token)
            .header("Accept", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(MeliError::request)?;

        if !response.status().is_success() {
            return Err(status_error(response).await);
        }

        Ok(())
    }
}
