use redis::AsyncCommands;
use serde::{Serialize, de::DeserializeOwned};

pub async fn redis_get<T: DeserializeOwned>(client: &redis::Client, key: &str) -> Option<T> {
    let mut conn = match client.get_multiplexed_async_connection().await {
        Ok(c) => c,
        Err(_) => return None,
    };
    let raw: Option<String> = conn.get(key).await.ok();
    raw.and_then(|value| serde_json::from_str(&value).ok())
}

pub async fn redis_set<T: Serialize>(
    client: &redis::Client,
    key: &str,
    value: &T,
    ttl_secs: u64,
) {
    if let Ok(mut conn) = client.get_multiplexed_async_connection().await
        && let Ok(json) = serde_json::to_string(value)
    {
        let _: Result<(), _> = conn.set_ex(key, json, ttl_secs).await;
    }
}
