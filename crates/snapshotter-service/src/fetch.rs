//! Concurrency-limited fetching of auxiliary assets.
//!
//! A render request may reference remote assets (avatars, badges, thumbnails)
//! that have to be materialized before the markup is rendered. The fetcher
//! resolves a key→locator mapping into a key→payload mapping while keeping at
//! most `limit` fetches in flight: the window is refilled as individual fetches
//! finish, in no particular key order.
//!
//! Failures are dropped, not raised: a dead asset host or a malformed locator
//! loses that one key, never the whole render.

use std::collections::BTreeMap;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use futures::{StreamExt, future};
use reqwest::{StatusCode, Url, header};

use crate::config::Config;
use crate::utils::http::create_client;

/// A per-key fetch failure. Never surfaced to callers of [`AssetFetcher::resolve`];
/// the offending key is simply absent from the result.
#[derive(Debug, thiserror::Error)]
enum FetchError {
    #[error("malformed locator: {0}")]
    InvalidLocator(#[from] url::ParseError),

    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("unexpected status: {0}")]
    Status(StatusCode),
}

/// Fetches batches of remote assets under a fan-out cap.
#[derive(Clone, Debug)]
pub struct AssetFetcher {
    client: reqwest::Client,
}

impl AssetFetcher {
    pub fn new(config: &Config) -> Self {
        AssetFetcher {
            client: create_client(config),
        }
    }

    /// Resolves every locator into an inlinable `data:` URL.
    ///
    /// At most `limit` fetches are in flight at any instant. Keys whose fetch
    /// fails in any way are silently absent from the result; the call itself
    /// always succeeds and only returns once every key was fetched or dropped.
    pub async fn resolve(
        &self,
        locators: BTreeMap<String, String>,
        limit: usize,
    ) -> BTreeMap<String, String> {
        let limit = limit.max(1);
        let client = &self.client;

        futures::stream::iter(locators)
            .map(|(key, locator)| async move {
                match fetch_asset(client, &locator).await {
                    Ok(payload) => Some((key, payload)),
                    Err(error) => {
                        tracing::debug!(key, %error, "dropping auxiliary asset");
                        metric!(counter("fetch.dropped") += 1);
                        None
                    }
                }
            })
            .buffer_unordered(limit)
            .filter_map(future::ready)
            .collect()
            .await
    }
}

async fn fetch_asset(client: &reqwest::Client, locator: &str) -> Result<String, FetchError> {
    let url = Url::parse(locator)?;

    let response = client.get(url).send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(FetchError::Status(status));
    }

    let content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("image/png")
        .to_owned();
    let body = response.bytes().await?;

    metric!(counter("fetch.fetched") += 1);
    Ok(to_data_url(&content_type, &body))
}

/// Encodes an asset as a `data:` URL that can be inlined into markup.
fn to_data_url(content_type: &str, body: &[u8]) -> String {
    format!("data:{content_type};base64,{}", STANDARD.encode(body))
}
