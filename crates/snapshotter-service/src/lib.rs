//! The coordination core of the snapshotter rendering backend.
//!
//! This crate bounds how many expensive render operations run at once, collapses
//! identical concurrent requests into a single render, and caps the fan-out of
//! outbound asset fetches. The rendering engine, templating and the HTTP
//! transport are external collaborators, consumed through narrow interfaces.

#[macro_use]
pub mod metrics;

pub mod cache;
pub mod config;
pub mod deferred;
pub mod fetch;
pub mod logging;
pub mod pool;
pub mod renderer;
pub mod service;
pub mod types;
pub mod utils;

pub use self::cache::{Admission, AdmissionGuard, RequestCache};
pub use self::config::Config;
pub use self::deferred::{Deferred, DeferredHandle};
pub use self::fetch::AssetFetcher;
pub use self::pool::{ContextPool, PoolError, PooledContext};
pub use self::renderer::{ContextProvider, RenderContext, RenderError, Templater};
pub use self::service::{RenderOutcome, RenderService, RenderServiceError};
pub use self::types::{RenderRequest, Viewport};
