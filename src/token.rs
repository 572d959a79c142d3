use crate::meli::MeliGateway;
use crate::store::{CredentialUpdate, Store, StoreError};
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

/// Refresh when the stored expiry is this close (or past), in seconds.
const REFRESH_WINDOW_SECS: i64 = 5 * 60;

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("account is not linked to Mercado Libre")]
    NotLinked,
    #[error("marketplace account {0} is already linked to another user")]
    AlreadyLinked(i64),
    #[error("token refresh failed: {0}")]
    Refresh(String),
    #[error("authorization code exchange failed: {0}")]
    Exchange(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone)]
pub struct LinkedAccount {
    pub meli_user_id: i64,
    pub expires_at: DateTime<Utc>,
}

/// Owns the credential lifecycle: silent refresh for ongoing calls, plus the
/// link/unlink flow that seeds and clears the stored pair.
#[derive(Clone)]
pub struct TokenManager {
    store: Arc<dyn Store>,
    meli: Arc<dyn MeliGateway>,
}

impl TokenManager {
    pub fn new(store: Arc<dyn Store>, meli: Arc<dyn MeliGateway>) -> Self {
        Self { store, meli }
    }

    /// A valid access token for the user, refreshing the stored pair when the
    /// expiry is within the refresh window. Concurrent callers may both
    /// refresh; the second write simply supersedes the first, which the token
    /// endpoint tolerates.
    pub async fn access_token(&self, user_id: Uuid) -> Result<String, TokenError> {
        let user = self
            .store
            .user(user_id)
            .await?
            .ok_or(TokenError::NotLinked)?;
        let creds = user.credentials().ok_or(TokenError::NotLinked)?;

        let now = Utc::now();
        if now < creds.expires_at - Duration::seconds(REFRESH_WINDOW_SECS)
            && let Some(token) = creds.access_token
        {
            return Ok(token);
        }

        info!(
            target = "pampero.token",
            %user_id,
            expires_at = %creds.expires_at,
            "access token near expiry, refreshing"
        );
        let grant = self
            .meli
            .refresh_tokens(&creds.refresh_token)
            .await
            .map_err(|err| TokenError::Refresh(err.to_string()))?;
        let expires_at = now + Duration::seconds(grant.expires_in);
        self.store
            .save_credentials(
                user_id,
                &CredentialUpdate {
                    meli_user_id: creds.meli_user_id,
                    access_token: grant.access_token.clone(),
                    refresh_token: grant.refresh_token,
                    expires_at,
                },
            )
            .await?;
        Ok(grant.access_token)
    }

    /// The seller's marketplace id, without touching the token.
    pub async fn seller_id(&self, user_id: Uuid) -> Result<i64, TokenError> {
        let user = self
            .store
            .user(user_id)
            .await?
            .ok_or(TokenError::NotLinked)?;
        user.credentials()
            .map(|creds| creds.meli_user_id)
            .ok_or(TokenError::NotLinked)
    }

    /// Authorization-code + PKCE exchange. A marketplace identity may belong
    /// to at most one local user; an identity owned elsewhere is rejected,
    /// never reassigned.
    pub async fn link_account(
        &self,
        user_id: Uuid,
        code: &str,
        verifier: &str,
    ) -> Result<LinkedAccount, TokenError> {
        let grant = self
            .meli
            .exchange_code(code, verifier)
            .await
            .map_err(|err| TokenError::Exchange(err.to_string()))?;

        if let Some(owner) = self.store.user_by_meli_id(grant.user_id).await?
            && owner.id != user_id
        {
            return Err(TokenError::AlreadyLinked(grant.user_id));
        }

        let expires_at = Utc::now() + Duration::seconds(grant.expires_in);
        self.store
            .save_credentials(
                user_id,
                &CredentialUpdate {
                    meli_user_id: grant.user_id,
                    access_token: grant.access_token,
                    refresh_token: grant.refresh_token,
                    expires_at,
                },
            )
            .await?;
        info!(
            target = "pampero.token",
            %user_id,
            meli_user_id = grant.user_id,
            "marketplace account linked"
        );
        Ok(LinkedAccount {
            meli_user_id: grant.user_id,
            expires_at,
        })
    }

    pub async fn unlink(&self, user_id: Uuid) -> Result<(), TokenError> {
        self.store.clear_credentials(user_id).await?;
        info!(target = "pampero.token", %user_id, "marketplace account unlinked");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemStore;
    use crate::testsupport::{FakeMeli, grant, linked_user};

    fn manager(store: Arc<MemStore>, meli: Arc<FakeMeli>) -> TokenManager {
        TokenManager::new(store, meli)
    }

    #[tokio::test]
    async fn fresh_token_is_returned_without_refresh() {
        let store = Arc::new(MemStore::default());
        let user_id = linked_user(&store, 900, "stored-token", Utc::now() + Duration::hours(6)).await;
        let meli = Arc::new(FakeMeli::new());

        let token = manager(store, meli.clone())
            .access_token(user_id)
            .await
            .unwrap();

        assert_eq!(token, "stored-token");
        assert_eq!(meli.refresh_calls(), 0);
    }

    #[tokio::test]
    async fn near_expiry_triggers_exactly_one_refresh() {
        let store = Arc::new(MemStore::default());
        let user_id =
            linked_user(&store, 900, "stale-token", Utc::now() + Duration::minutes(3)).await;
        let meli = Arc::new(FakeMeli::new());
        meli.set_refresh_response(grant("fresh-token", "rotated-refresh", 21600, 900));

        let token = manager(store.clone(), meli.clone())
            .access_token(user_id)
            .await
            .unwrap();

        assert_eq!(token, "fresh-token");
        assert_eq!(meli.refresh_calls(), 1);

        let stored = store.user(user_id).await.unwrap().unwrap();
        assert_eq!(stored.meli_access_token.as_deref(), Some("fresh-token"));
        assert_eq!(
            stored.meli_refresh_token.as_deref(),
            Some("rotated-refresh")
        );
        let expires_at = stored.meli_token_expires_at.unwrap();
        assert!(expires_at > Utc::now() + Duration::hours(5));
    }

    #[tokio::test]
    async fn past_expiry_also_refreshes() {
        let store = Arc::new(MemStore::default());
        let user_id = linked_user(&store, 900, "dead-token", Utc::now() - Duration::hours(1)).await;
        let meli = Arc::new(FakeMeli::new());
        meli.set_refresh_response(grant("fresh-token", "rotated-refresh", 21600, 900));

        let token = manager(store, meli.clone()).access_token(user_id).await.unwrap();
        assert_eq!(token, "fresh-token");
        assert_eq!(meli.refresh_calls(), 1);
    }

    #[tokio::test]
    async fn missing_credentials_is_not_linked() {
        let store = Arc::new(MemStore::with_users(&[Uuid::nil()]));
        let meli = Arc::new(FakeMeli::new());

        let err = manager(store, meli)
            .access_token(Uuid::nil())
            .await
            .unwrap_err();
        assert!(matches!(err, TokenError::NotLinked));
    }

    #[tokio::test]
    async fn refresh_failure_is_fatal() {
        let store = Arc::new(MemStore::default());
        let user_id = linked_user(&store, 900, "stale", Utc::now()).await;
        let meli = Arc::new(FakeMeli::new()); // no refresh response configured

        let err = manager(store, meli)
            .access_token(user_id)
            .await
            .unwrap_err();
        assert!(matches!(err, TokenError::Refresh(_)));
    }

    #[tokio::test]
    async fn linking_a_foreign_identity_is_rejected() {
        let store = Arc::new(MemStore::default());
        let owner = linked_user(&store, 900, "token", Utc::now() + Duration::hours(6)).await;
        let meli = Arc::new(FakeMeli::new());
        meli.set_exchange_response(grant("a", "r", 21600, 900));

        let intruder = Uuid::new_v4();
        let err = manager(store.clone(), meli.clone())
            .link_account(intruder, "code", "verifier")
            .await
            .unwrap_err();
        assert!(matches!(err, TokenError::AlreadyLinked(900)));

        // Relinking by the same owner is fine.
        manager(store, meli)
            .link_account(owner, "code", "verifier")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn unlink_clears_stored_pair() {
        let store = Arc::new(MemStore::default());
        let user_id = linked_user(&store, 900, "token", Utc::now() + Duration::hours(6)).await;
        let meli = Arc::new(FakeMeli::new());

        manager(store.clone(), meli).unlink(user_id).await.unwrap();
        let record = store.user(user_id).await.unwrap().unwrap();
        assert!(record.credentials().is_none());
    }
}
