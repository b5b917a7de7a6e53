use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// The viewport used when no usable dimensions are sent along with a request.
pub const DEFAULT_VIEWPORT: Viewport = Viewport {
    width: 1700,
    height: 893,
};

/// The pixel dimensions a markup document is rendered at.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

impl Default for Viewport {
    fn default() -> Self {
        DEFAULT_VIEWPORT
    }
}

/// An inbound render request, as handed over by the transport layer.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct RenderRequest {
    /// The markup template to render.
    pub markup: String,

    /// An opaque token identifying "the same work" across requests.
    ///
    /// Concurrent and recent requests carrying the same token share a single render.
    /// Without a token, no deduplication is performed.
    pub identity_token: Option<String>,

    /// Requested viewport width in pixels.
    pub width: Option<u32>,

    /// Requested viewport height in pixels.
    pub height: Option<u32>,

    /// Values substituted into the markup template.
    pub values: BTreeMap<String, String>,

    /// Names of `values` entries that hold remote locators.
    ///
    /// Those entries are fetched up front and replaced with the fetched payload
    /// before substitution.
    pub auxiliary_keys: Vec<String>,
}

impl RenderRequest {
    /// The viewport to render at, falling back to [`DEFAULT_VIEWPORT`] for missing or
    /// zero dimensions.
    pub fn viewport(&self) -> Viewport {
        Viewport {
            width: self.width.filter(|w| *w > 0).unwrap_or(DEFAULT_VIEWPORT.width),
            height: self
                .height
                .filter(|h| *h > 0)
                .unwrap_or(DEFAULT_VIEWPORT.height),
        }
    }
}
