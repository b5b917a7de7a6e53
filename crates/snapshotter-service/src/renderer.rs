//! Interfaces to the external rendering engine and templating step.
//!
//! The actual renderer (a browser-like engine turning markup into a raster image)
//! and the placeholder substitution logic live outside of this crate. The service
//! only coordinates them, through the traits defined here.

use std::collections::BTreeMap;

use async_trait::async_trait;
use bytes::Bytes;

use crate::types::Viewport;

/// An error reported by the external rendering engine.
#[derive(Clone, Debug, thiserror::Error)]
pub enum RenderError {
    /// The engine did not produce an image in time.
    #[error("render timed out")]
    Timeout,

    /// The engine crashed or refused the document.
    #[error("render engine failed: {0}")]
    Engine(String),
}

/// A single live render context, obtained from a [`ContextProvider`].
///
/// A context renders one document at a time. It is never reused across requests:
/// the pool closes it on release and opens a fresh one for the next acquirer.
#[async_trait]
pub trait RenderContext: Send {
    /// Renders the given markup at the given viewport into an encoded raster image.
    async fn render(&mut self, markup: &str, viewport: Viewport) -> Result<Bytes, RenderError>;
}

/// The external source of render contexts, typically backed by a headless browser.
#[async_trait]
pub trait ContextProvider: Send + Sync {
    /// Opens a fresh render context.
    async fn open_context(&self) -> Result<Box<dyn RenderContext>, RenderError>;

    /// Closes a render context, returning its resources to the engine.
    async fn close_context(&self, context: Box<dyn RenderContext>) -> Result<(), RenderError>;
}

/// The external templating step.
///
/// Implementations substitute `values` into placeholders of `template`, escaping
/// interpolated values for the target markup.
pub trait Templater: Send + Sync {
    fn substitute(&self, template: &str, values: &BTreeMap<String, String>) -> String;
}
