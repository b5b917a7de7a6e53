use std::time::Duration;

use reqwest::redirect;

use crate::config::Config;

/// The `User-Agent` sent along with all outbound asset fetches.
pub const USER_AGENT: &str = concat!("snapshotter/", env!("CARGO_PKG_VERSION"));

/// Creates the [`reqwest::Client`] used for fetching auxiliary assets.
pub fn create_client(config: &Config) -> reqwest::Client {
    reqwest::ClientBuilder::new()
        .user_agent(USER_AGENT)
        .gzip(true)
        .connect_timeout(config.connect_timeout)
        .timeout(config.fetch_timeout)
        .pool_idle_timeout(Duration::from_secs(30))
        .redirect(redirect::Policy::limited(10))
        .build()
        .unwrap()
}
