use super::{MeliClient, MeliError, status_error};
use serde::Deserialize;

/// Response of both OAuth grants (authorization code and refresh token).
/// Mercado Libre rotates the refresh token on every grant, so callers must
/// persist the whole pair, not just the access token.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenGrant {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_in: i64,
    pub user_id: i64,
}

impl MeliClient {
    pub(crate) async fn request_exchange_code(
        &self,
        code: &str,
        verifier: &str,
    ) -> Result<TokenGrant, MeliError> {
        let params = [
            ("grant_type", "authorization_code"),
            ("client_id", self.config.app_id.as_str()),
            ("client_secret", self.config.app_secret.as_str()),
            ("code", code),
            ("redirect_uri", self.config.redirect_uri.as_str()),
            ("code_verifier", verifier),
        ];
        self.request_grant(&params).await
    }

    pub(crate) async fn request_refresh(
        &self,
        refresh_token: &str,
    ) -> Result<TokenGrant, MeliError> {
        let params = [
            ("grant_type", "refresh_token"),
            ("client_id", self.config.app_id.as_str()),
            ("client_secret", self.config.app_secret.as_str()),
            ("refresh_token", refresh_token),
        ];
        self.request_grant(&params).await
    }

    async fn request_grant(&self, params: &[(&str, &str)]) -> Result<TokenGrant, MeliError> {
        let response = self
            .http
            .post(self.config.token_url())
            .header("Accept", "application/json")
            .form(params)
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
    fn token_grant_parses_provider_payload() {
        let raw = r#"{
            "access_token": "APP_USR-123",
            "token_type": "Bearer",
            "expires_in": 21600,
            "scope": "offline_access read write",
            "user_id": 441993659,
            "refresh_token": "TG-abc"
        }"#;
        let grant: TokenGrant = serde_json::from_str(raw).expect("grant");
        assert_eq!(grant.access_token, "APP_USR-123");
        assert_eq!(grant.refresh_token, "TG-abc");
        assert_eq!(grant.expires_in, 21600);
        assert_eq!(grant.user_id, 441993659);
    }
}
