//! The render coordination service.
//!
//! [`RenderService`] ties the core pieces together: inbound requests are
//! deduplicated by identity token, auxiliary assets are fetched under the
//! fan-out cap, and the render itself runs on a context checked out of the
//! bounded pool. The renderer and the templating step are external
//! collaborators, wired in through the traits in [`crate::renderer`].

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use crate::cache::{Admission, RequestCache};
use crate::config::Config;
use crate::fetch::AssetFetcher;
use crate::pool::{ContextPool, PoolError};
use crate::renderer::{ContextProvider, RenderError, Templater};
use crate::types::RenderRequest;
use crate::utils::futures::{CallOnDrop, m, measure};

/// An error produced while coordinating a render.
///
/// For deduplicated requests this is what every waiter on the shared entry
/// observes; the entry itself is purged on failure so the next request starts
/// over.
#[derive(Debug, thiserror::Error)]
pub enum RenderServiceError {
    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Render(#[from] RenderError),

    /// The task performing the shared render went away without settling.
    #[error("render was abandoned before producing a result")]
    Abandoned,
}

/// The outcome of a coordinated render.
///
/// Outcomes are shared: every request that joined the same identity token
/// receives clones of the same [`Arc`]s.
pub type RenderOutcome = Result<Arc<Bytes>, Arc<RenderServiceError>>;

struct RenderServiceInner {
    config: Config,
    pool: ContextPool,
    cache: RequestCache<Bytes, RenderServiceError>,
    fetcher: AssetFetcher,
    templater: Arc<dyn Templater>,
    current_renders: AtomicUsize,
}

/// The coordination layer of the rendering backend.
#[derive(Clone)]
pub struct RenderService {
    inner: Arc<RenderServiceInner>,
}

impl RenderService {
    /// Creates a new [`RenderService`] on top of the external renderer and
    /// templating collaborators.
    pub fn create(
        config: Config,
        provider: Arc<dyn ContextProvider>,
        templater: Arc<dyn Templater>,
    ) -> Self {
        let pool = ContextPool::new(provider, config.max_render_contexts);
        let cache = RequestCache::new(config.dedup_max_age);
        let fetcher = AssetFetcher::new(&config);

        RenderService {
            inner: Arc::new(RenderServiceInner {
                config,
                pool,
                cache,
                fetcher,
                templater,
                current_renders: AtomicUsize::new(0),
            }),
        }
    }

    /// Gives access to the [`Config`].
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// The request dedup cache, exposed for lookups and sweeping.
    pub fn cache(&self) -> &RequestCache<Bytes, RenderServiceError> {
        &self.inner.cache
    }

    /// The bounded render context pool.
    pub fn pool(&self) -> &ContextPool {
        &self.inner.pool
    }

    /// Spawns the periodic cache sweeper for the lifetime of the process.
    ///
    /// The returned task runs until `shutdown` is triggered.
    pub fn spawn_sweeper(&self, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        self.inner
            .cache
            .spawn_sweeper(self.inner.config.sweep_interval, shutdown)
    }

    /// Renders a request, deduplicating it against concurrent and recent
    /// requests carrying the same identity token.
    ///
    /// Every caller racing on the same token receives the byte-identical
    /// outcome of a single render. Requests without a token are always
    /// rendered fresh.
    pub async fn render(&self, request: RenderRequest) -> RenderOutcome {
        let Some(token) = request.identity_token.clone() else {
            // no identity token means no deduplication was requested
            return self
                .perform_render(&request)
                .await
                .map(Arc::new)
                .map_err(Arc::new);
        };

        match self.inner.cache.admit(&token) {
            Admission::Joined(handle) => match handle.wait().await {
                Ok(outcome) => outcome,
                Err(_abandoned) => Err(Arc::new(RenderServiceError::Abandoned)),
            },
            Admission::Admitted(guard) => match self.perform_render(&request).await {
                Ok(image) => Ok(guard.fulfil(image)),
                Err(err) => {
                    let error: &dyn std::error::Error = &err;
                    tracing::error!(error, token, "render failed");
                    Err(guard.reject(err))
                }
            },
        }
    }

    /// Performs one actual render: materialize auxiliary assets, substitute,
    /// acquire a context, render, release.
    async fn perform_render(&self, request: &RenderRequest) -> Result<Bytes, RenderServiceError> {
        let inner = &self.inner;

        let num_renders = inner.current_renders.fetch_add(1, Ordering::Relaxed) + 1;
        metric!(gauge("renders.in_flight") = num_renders as u64);
        let render_token = CallOnDrop::new({
            let inner = Arc::clone(inner);
            move || {
                inner.current_renders.fetch_sub(1, Ordering::Relaxed);
            }
        });

        let result = measure("render", m::result, async {
            let values = self.materialize_values(request).await;
            let markup = inner.templater.substitute(&request.markup, &values);

            let mut context = inner
                .pool
                .acquire_with_deadline(inner.config.context_acquire_timeout)
                .await?;
            let rendered = context.context_mut().render(&markup, request.viewport()).await;
            inner.pool.release(context).await;

            Ok(rendered?)
        })
        .await;

        drop(render_token);
        result
    }

    /// Replaces auxiliary-key values with their fetched payloads.
    ///
    /// Keys whose fetch was dropped keep their original locator value; a missing
    /// asset degrades the rendered output but never fails the render.
    async fn materialize_values(&self, request: &RenderRequest) -> BTreeMap<String, String> {
        let mut values = request.values.clone();

        if !request.auxiliary_keys.is_empty() {
            let locators: BTreeMap<String, String> = request
                .auxiliary_keys
                .iter()
                .filter_map(|key| {
                    let locator = values.get(key)?;
                    Some((key.clone(), locator.clone()))
                })
                .collect();

            let resolved = self
                .inner
                .fetcher
                .resolve(locators, self.inner.config.max_fetch_concurrency)
                .await;
            values.extend(resolved);
        }

        values
    }

    /// Verifies that the pool can still produce a working render context.
    pub async fn health(&self) -> Result<(), RenderServiceError> {
        let context = self
            .inner
            .pool
            .acquire_with_deadline(self.inner.config.context_acquire_timeout)
            .await?;
        self.inner.pool.release(context).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::renderer::RenderContext;
    use crate::types::Viewport;

    #[derive(Default)]
    struct StubProvider {
        renders: AtomicUsize,
        fail_next_render: AtomicBool,
        render_delay: Option<Duration>,
    }

    struct StubContext {
        provider: Arc<StubProvider>,
    }

    #[async_trait]
    impl RenderContext for StubContext {
        async fn render(&mut self, markup: &str, viewport: Viewport) -> Result<Bytes, RenderError> {
            if let Some(delay) = self.provider.render_delay {
                tokio::time::sleep(delay).await;
            }
            self.provider.renders.fetch_add(1, Ordering::SeqCst);
            if self.provider.fail_next_render.swap(false, Ordering::SeqCst) {
                return Err(RenderError::Engine("tab crashed".into()));
            }
            Ok(Bytes::from(format!(
                "image[{}x{}]:{markup}",
                viewport.width, viewport.height
            )))
        }
    }

    #[async_trait]
    impl ContextProvider for Arc<StubProvider> {
        async fn open_context(&self) -> Result<Box<dyn RenderContext>, RenderError> {
            Ok(Box::new(StubContext {
                provider: Arc::clone(self),
            }))
        }

        async fn close_context(&self, context: Box<dyn RenderContext>) -> Result<(), RenderError> {
            drop(context);
            Ok(())
        }
    }

    struct StubTemplater;

    impl Templater for StubTemplater {
        fn substitute(&self, template: &str, values: &BTreeMap<String, String>) -> String {
            let mut output = template.to_owned();
            for (key, value) in values {
                output = output.replace(&format!("{{{{{key}}}}}"), value);
            }
            output
        }
    }

    fn test_service(provider: Arc<StubProvider>, config: Config) -> RenderService {
        RenderService::create(config, Arc::new(provider), Arc::new(StubTemplater))
    }

    fn request(token: Option<&str>) -> RenderRequest {
        RenderRequest {
            markup: "<p>{{name}}</p>".to_owned(),
            identity_token: token.map(str::to_owned),
            values: BTreeMap::from([("name".to_owned(), "Jane".to_owned())]),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_identical_concurrent_requests_render_once() {
        let provider = Arc::new(StubProvider {
            render_delay: Some(Duration::from_millis(50)),
            ..Default::default()
        });
        let service = test_service(Arc::clone(&provider), Config::default());

        let first = {
            let service = service.clone();
            tokio::spawn(async move { service.render(request(Some("card-1"))).await })
        };
        let second = {
            let service = service.clone();
            tokio::spawn(async move { service.render(request(Some("card-1"))).await })
        };

        let first = first.await.unwrap().unwrap();
        let second = second.await.unwrap().unwrap();

        // one render, byte-identical output for both callers
        assert_eq!(provider.renders.load(Ordering::SeqCst), 1);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(&first[..], b"image[1700x893]:<p>Jane</p>");
    }

    #[tokio::test]
    async fn test_failed_render_is_not_replayed() {
        let provider = Arc::new(StubProvider::default());
        provider.fail_next_render.store(true, Ordering::SeqCst);
        let service = test_service(Arc::clone(&provider), Config::default());

        let error = service.render(request(Some("x"))).await.unwrap_err();
        assert!(matches!(
            *error,
            RenderServiceError::Render(RenderError::Engine(_))
        ));

        // the failure was purged, the retry renders from scratch
        let image = service.render(request(Some("x"))).await.unwrap();
        assert_eq!(provider.renders.load(Ordering::SeqCst), 2);
        assert_eq!(&image[..], b"image[1700x893]:<p>Jane</p>");
    }

    #[tokio::test]
    async fn test_requests_without_token_are_never_deduplicated() {
        let provider = Arc::new(StubProvider {
            render_delay: Some(Duration::from_millis(20)),
            ..Default::default()
        });
        let service = test_service(Arc::clone(&provider), Config::default());

        let first = {
            let service = service.clone();
            tokio::spawn(async move { service.render(request(None)).await })
        };
        let second = {
            let service = service.clone();
            tokio::spawn(async move { service.render(request(None)).await })
        };

        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();

        assert_eq!(provider.renders.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_auxiliary_assets_are_inlined() {
        snapshotter_test::setup();
        let (server, _stats) = snapshotter_test::asset_server();

        let provider = Arc::new(StubProvider::default());
        let service = test_service(Arc::clone(&provider), Config::default());

        let mut request = request(None);
        request.markup = "<img src=\"{{avatar}}\"/><img src=\"{{broken}}\"/>".to_owned();
        request.values.insert(
            "avatar".to_owned(),
            server.url("assets/avatar.png").to_string(),
        );
        request
            .values
            .insert("broken".to_owned(), "not a locator".to_owned());
        request.auxiliary_keys = vec!["avatar".to_owned(), "broken".to_owned()];

        let image = service.render(request).await.unwrap();
        let rendered = std::str::from_utf8(&image).unwrap();

        assert!(rendered.contains("src=\"data:image/png;base64,"), "{rendered}");
        // a dropped fetch leaves the original value in place
        assert!(rendered.contains("src=\"not a locator\""), "{rendered}");
    }

    #[tokio::test]
    async fn test_health_roundtrip() {
        let provider = Arc::new(StubProvider::default());
        let service = test_service(provider, Config::default());

        service.health().await.unwrap();
        assert_eq!(service.pool().outstanding(), 0);
    }
}
