//! Content extraction
//!
//! Talks to the metadata extraction service that resolves a share link into
//! direct media URLs. The service exposes two generations of its API: the
//! primary tier (`v1`, richer legacy payload) and the secondary tier (`v2`,
//! leaner payload). Both are normalized into a [`ContentReference`] so the
//! rest of the bot never sees tier-specific shapes.

pub mod tiers;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::logging::targets;

pub use tiers::{normalize, PrimaryPayload, SecondaryPayload, TierAuthor, TierPayload};

/// Extraction API generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tier {
    /// Legacy endpoint with the richer field set.
    Primary,
    /// Newer endpoint with a single candidate-URL array.
    Secondary,
}

impl Tier {
    /// Short label used in captions and logs.
    pub fn label(&self) -> &'static str {
        match self {
            Tier::Primary => "v1",
            Tier::Secondary => "v2",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// What kind of media a link resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    Video,
    ImageSet,
}

/// Author identity as reported by the extraction service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorRef {
    pub id: String,
    pub handle: String,
    pub nickname: Option<String>,
}

/// Normalized description of one piece of content.
///
/// `media_locators` is never empty: a payload with nothing playable is
/// rejected during normalization instead.
#[derive(Debug, Clone)]
pub struct ContentReference {
    pub media_id: String,
    pub kind: ContentKind,
    /// Which tier produced this reference; surfaces in the caption.
    pub tier: Tier,
    pub author: AuthorRef,
    pub description: String,
    /// Creation time as a unix timestamp, when the service reports one.
    pub created_at: Option<i64>,
    /// Direct media URLs in preference order. For videos the first entry is
    /// the one to download; for image sets every entry is one image.
    pub media_locators: Vec<String>,
}

impl ContentReference {
    /// The preferred media URL.
    pub fn best_locator(&self) -> &str {
        self.media_locators
            .first()
            .map(String::as_str)
            .unwrap_or_default()
    }
}

/// Extraction errors
#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("extraction request timed out")]
    Timeout,

    #[error("failed to connect to extraction service: {0}")]
    Connect(String),

    #[error("extraction request failed: {0}")]
    Network(String),

    #[error("extraction service returned HTTP {status}")]
    Http { status: u16 },

    #[error("extraction rejected: {message}")]
    Rejected { message: String },

    #[error("malformed extraction payload: {0}")]
    Malformed(String),
}

/// A source of tier payloads for a share link.
///
/// The production implementation is [`HttpExtractor`]; tests substitute
/// scripted sources.
#[async_trait]
pub trait ContentSource: Send + Sync {
    async fn lookup(&self, url: &str, tier: Tier) -> Result<TierPayload, ExtractError>;
}

/// Response envelope shared by both tiers: an explicit status tag plus a
/// tier-specific `data` payload.
#[derive(Debug, Deserialize)]
pub(crate) struct Envelope {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    data: Option<Value>,
}

/// HTTP client for the extraction service.
pub struct HttpExtractor {
    client: reqwest::Client,
    base_url: String,
    attempt_timeout: Duration,
}

impl HttpExtractor {
    pub fn new(
        client: reqwest::Client,
        base_url: impl Into<String>,
        attempt_timeout: Duration,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            attempt_timeout,
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/api/download", self.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl ContentSource for HttpExtractor {
    async fn lookup(&self, url: &str, tier: Tier) -> Result<TierPayload, ExtractError> {
        debug!(target: targets::FETCH, tier = %tier, url, "extraction request");

        let response = self
            .client
            .get(self.endpoint())
            .query(&[("url", url), ("version", tier.label())])
            .timeout(self.attempt_timeout)
            .send()
            .await
            .map_err(request_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(ExtractError::Http {
                status: status.as_u16(),
            });
        }

        let envelope: Envelope = response
            .json()
            .await
            .map_err(|e| ExtractError::Malformed(format!("invalid response envelope: {e}")))?;

        parse_envelope(tier, envelope)
    }
}

fn request_error(e: reqwest::Error) -> ExtractError {
    if e.is_timeout() {
        ExtractError::Timeout
    } else if e.is_connect() {
        ExtractError::Connect(e.to_string())
    } else {
        ExtractError::Network(e.to_string())
    }
}

/// Turn a response envelope into a tier payload.
///
/// Success requires both the explicit `status: "success"` tag and a non-null
/// `data` payload; anything else is a failed attempt.
pub(crate) fn parse_envelope(tier: Tier, envelope: Envelope) -> Result<TierPayload, ExtractError> {
    if envelope.status.as_deref() != Some("success") {
        let message = envelope
            .message
            .unwrap_or_else(|| "no reason given".to_string());
        return Err(ExtractError::Rejected { message });
    }

    let data = match envelope.data {
        Some(data) if !data.is_null() => data,
        _ => {
            return Err(ExtractError::Malformed(
                "success status without a result payload".to_string(),
            ))
        }
    };

    let parsed = match tier {
        Tier::Primary => serde_json::from_value::<PrimaryPayload>(data).map(TierPayload::Primary),
        Tier::Secondary => {
            serde_json::from_value::<SecondaryPayload>(data).map(TierPayload::Secondary)
        }
    };

    parsed.map_err(|e| ExtractError::Malformed(format!("unexpected {tier} payload shape: {e}")))
}
