//! Helpers for testing the snapshotter service.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - When using [`asset_server`], make sure that the server is held until all requests to
//!    it have been made. If the server is dropped, the ports remain open and all
//!    connections to it will time out. To avoid this, assign it to a variable:
//!    `let (_server, stats) = asset_server();`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::Router;
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::get;
use reqwest::Url;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

/// A tiny but valid 1×1 transparent PNG, served for every asset path.
pub const PNG_PIXEL: &[u8] = &[
    0x89, 0x50, 0x4e, 0x47, 0x0d, 0x0a, 0x1a, 0x0a, 0x00, 0x00, 0x00, 0x0d, 0x49, 0x48, 0x44,
    0x52, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x08, 0x06, 0x00, 0x00, 0x00, 0x1f,
    0x15, 0xc4, 0x89, 0x00, 0x00, 0x00, 0x0b, 0x49, 0x44, 0x41, 0x54, 0x78, 0x9c, 0x63, 0x60,
    0x00, 0x02, 0x00, 0x00, 0x05, 0x00, 0x01, 0x7a, 0x5e, 0xab, 0x3f, 0x00, 0x00, 0x00, 0x00,
    0x49, 0x45, 0x4e, 0x44, 0xae, 0x42, 0x60, 0x82,
];

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the service crate and mutes all
///    other logs (such as hyper or reqwest).
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("snapshotter_service=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// A test server that binds to a random port and serves a web app.
///
/// This server requires a `tokio` runtime and is supposed to be run in a `tokio::test`. It
/// automatically stops serving when dropped.
#[derive(Debug)]
pub struct Server {
    pub handle: tokio::task::JoinHandle<()>,
    pub socket: SocketAddr,
}

impl Server {
    /// Creates a new test server from the given `axum` router.
    pub fn with_router(router: Router) -> Self {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.set_nonblocking(true).unwrap();
        let socket = listener.local_addr().unwrap();

        let handle = tokio::spawn(async move {
            let listener = tokio::net::TcpListener::from_std(listener).unwrap();
            axum::serve(listener, router.into_make_service())
                .await
                .unwrap();
        });

        Self { handle, socket }
    }

    /// Returns the socket address that this server listens on.
    pub fn addr(&self) -> SocketAddr {
        self.socket
    }

    /// Returns the port that this server listens on.
    pub fn port(&self) -> u16 {
        self.addr().port()
    }

    /// Returns a full URL pointing to the given path.
    ///
    /// This URL uses `localhost` as hostname.
    pub fn url(&self, path: &str) -> Url {
        let path = path.trim_start_matches('/');
        format!("http://localhost:{}/{}", self.port(), path)
            .parse()
            .unwrap()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Request accounting for [`asset_server`].
#[derive(Debug, Default)]
pub struct ServerStats {
    hits: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ServerStats {
    /// The total number of requests served.
    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    /// The highest number of requests that were in flight at the same time.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn track(self: &Arc<Self>) -> InFlightGuard {
        self.hits.fetch_add(1, Ordering::SeqCst);
        let live = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(live, Ordering::SeqCst);
        InFlightGuard {
            stats: Arc::clone(self),
        }
    }
}

struct InFlightGuard {
    stats: Arc<ServerStats>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.stats.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Spawns a server simulating an asset host.
///
/// - `/assets/*path` serves [`PNG_PIXEL`] after a short delay, so concurrency is
///   observable through the returned [`ServerStats`].
/// - `/missing/*path` responds `404`.
/// - `/broken/*path` responds `500`.
pub fn asset_server() -> (Server, Arc<ServerStats>) {
    let stats = Arc::new(ServerStats::default());

    let router = Router::new()
        .route("/assets/*path", {
            let stats = Arc::clone(&stats);
            get(move || {
                let stats = Arc::clone(&stats);
                async move {
                    let _guard = stats.track();
                    tokio::time::sleep(Duration::from_millis(15)).await;
                    ([(header::CONTENT_TYPE, "image/png")], PNG_PIXEL).into_response()
                }
            })
        })
        .route("/missing/*path", {
            let stats = Arc::clone(&stats);
            get(move || {
                let stats = Arc::clone(&stats);
                async move {
                    let _guard = stats.track();
                    StatusCode::NOT_FOUND.into_response()
                }
            })
        })
        .route("/broken/*path", {
            let stats = Arc::clone(&stats);
            get(move || {
                let stats = Arc::clone(&stats);
                async move {
                    let _guard = stats.track();
                    StatusCode::INTERNAL_SERVER_ERROR.into_response()
                }
            })
        });

    (Server::with_router(router), stats)
}
