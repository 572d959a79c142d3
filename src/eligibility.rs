use crate::meli::{MeliError, MeliGateway};
use tracing::debug;

/// A seller may run marketplace promotions while their reputation sits in a
/// green or yellow tier and the account is not suspended.
pub async fn seller_eligible(
    meli: &dyn MeliGateway,
    seller_meli_id: i64,
) -> Result<bool, MeliError> {
    let profile = meli.user_profile(seller_meli_id).await?;
    let reputation = profile.seller_reputation.unwrap_or_default();
    let level = reputation.level_id.unwrap_or_default();
    let status = reputation
        .status
        .and_then(|s| s.status)
        .unwrap_or_default();

    let good_level = level.contains("green") || level.contains("yellow");
    let not_suspended = status != "suspended";
    debug!(
        target = "pampero.promo",
        seller_meli_id,
        %level,
        %status,
        eligible = good_level && not_suspended,
        "seller eligibility checked"
    );
    Ok(good_level && not_suspended)
}

/// A listing may join a promotion when the marketplace reports it among the
/// eligible items for its site.
pub async fn item_eligible(
    meli: &dyn MeliGateway,
    item_id: &str,
    site_id: &str,
    access_token: &str,
) -> Result<bool, MeliError> {
    let eligible = meli
        .eligible_item_ids(item_id, site_id, access_token)
        .await?;
    Ok(eligible.iter().any(|id| id == item_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testsupport::{FakeMeli, profile_with_reputation};

    #[tokio::test]
    async fn green_and_yellow_levels_pass() {
        let meli = FakeMeli::new();
        meli.set_profile(profile_with_reputation(900, Some("5_green"), Some("active")));
        assert!(seller_eligible(&meli, 900).await.unwrap());

        meli.set_profile(profile_with_reputation(900, Some("3_yellow"), Some("active")));
        assert!(seller_eligible(&meli, 900).await.unwrap());
    }

    #[tokio::test]
    async fn red_level_fails() {
        let meli = FakeMeli::new();
        meli.set_profile(profile_with_reputation(900, Some("1_red"), Some("active")));
        assert!(!seller_eligible(&meli, 900).await.unwrap());
    }

    #[tokio::test]
    async fn suspended_account_fails_even_with_good_level() {
        let meli = FakeMeli::new();
        meli.set_profile(profile_with_reputation(
            900,
            Some("5_green"),
            Some("suspended"),
        ));
        assert!(!seller_eligible(&meli, 900).await.unwrap());
    }

    #[tokio::test]
    async fn missing_reputation_fails_closed() {
        let meli = FakeMeli::new();
        meli.set_profile(profile_with_reputation(900, None, None));
        assert!(!seller_eligible(&meli, 900).await.unwrap());
    }

    #[tokio::test]
    async fn item_must_appear_in_eligible_response() {
        let meli = FakeMeli::new();
        meli.set_eligible_items(vec!["MLA1".into(), "MLA2".into()]);
        assert!(item_eligible(&meli, "MLA1", "MLA", "token").await.unwrap());
        assert!(!item_eligible(&meli, "MLA9", "MLA", "token").await.unwrap());
    }
}
