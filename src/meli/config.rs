use std::env;

/// Runtime configuration for the Mercado Libre integration. Constructed once
/// at startup and handed to the client, so tests and alternate deployments
/// can point the gateway at a different host.
#[derive(Debug, Clone)]
pub struct MeliConfig {
    pub app_id: String,
    pub app_secret: String,
    pub redirect_uri: String,
    pub api_base: String,
    pub auth_base: String,
    pub default_site_id: String,
}

impl MeliConfig {
    pub fn from_env() -> Self {
        Self {
            app_id: env::var("MELI_APP_ID").unwrap_or_default(),
            app_secret: env::var("MELI_SECRET_KEY").unwrap_or_default(),
            redirect_uri: env::var("MELI_REDIRECT_URI").unwrap_or_default(),
            api_base: env::var("MELI_API_BASE")
                .unwrap_or_else(|_| "https://api.mercadolibre.com".to_string())
                .trim_end_matches('/')
                .to_string(),
            // The authorization host is per-country; Argentina by default.
            auth_base: env::var("MELI_AUTH_BASE")
                .unwrap_or_else(|_| "https://auth.mercadolibre.com.ar".to_string())
                .trim_end_matches('/')
                .to_string(),
            default_site_id: env::var("MELI_SITE_ID").unwrap_or_else(|_| "MLA".to_string()),
        }
    }

    /// Authorization URL the seller visits to start the code + PKCE flow.
    /// The plain challenge method keeps the verifier round-trip symmetric:
    /// the same value we hand the seller comes back on `/link`.
    pub fn authorization_url(&self, code_challenge: &str) -> String {
        format!(
            "{}/authorization?response_type=code&client_id={}&redirect_uri={}&code_challenge={}&code_challenge_method=plain",
            self.auth_base,
            urlencoding::encode(&self.app_id),
            urlencoding::encode(&self.redirect_uri),
            urlencoding::encode(code_challenge),
        )
    }

    pub fn token_url(&self) -> String {
        format!("{}/oauth/token", self.api_base)
    }
}
