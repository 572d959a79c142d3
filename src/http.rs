use once_cell::sync::Lazy;
use reqwest::Client;
use std::time::Duration;

static SHARED: Lazy<Client> = Lazy::new(build_client);

/// Process-wide HTTP client. `reqwest::Client` is an `Arc` internally, so
/// cloning is cheap and every outbound call shares one connection pool.
pub fn shared_client() -> Client {
    SHARED.clone()
}

fn build_client() -> Client {
    let timeout = env_secs("HTTP_TIMEOUT_SECS", 15);
    let connect = env_secs("HTTP_CONNECT_TIMEOUT_SECS", 5);
    Client::builder()
        .timeout(Duration::from_secs(timeout))
        .connect_timeout(Duration::from_secs(connect))
        .build()
        .unwrap_or_else(|_| Client::new())
}

fn env_secs(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(default)
}
