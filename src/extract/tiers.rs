//! Tier payload shapes and normalization
//!
//! The primary tier grew organically and names its video URL in five
//! different legacy fields; the secondary tier has a single candidate array.
//! Normalization flattens both into [`ContentReference`] with the locator
//! preference order baked in.

use serde::Deserialize;
use serde_json::Value;

use super::{AuthorRef, ContentKind, ContentReference, ExtractError, Tier};

/// Payload from either tier, still in its wire shape.
#[derive(Debug, Clone)]
pub enum TierPayload {
    Primary(PrimaryPayload),
    Secondary(SecondaryPayload),
}

/// Primary (`v1`) payload.
///
/// The video URL may live in any of `video`, `video1`, `video2`, `video_hd`,
/// or `video_wm`, in that preference order, and each field may hold either a
/// string or an array of strings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PrimaryPayload {
    #[serde(default, alias = "aweme_id")]
    pub id: Option<Value>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub create_time: Option<i64>,
    #[serde(default)]
    pub author: Option<TierAuthor>,
    #[serde(default)]
    pub video: Option<Value>,
    #[serde(default)]
    pub video1: Option<Value>,
    #[serde(default)]
    pub video2: Option<Value>,
    #[serde(default)]
    pub video_hd: Option<Value>,
    #[serde(default)]
    pub video_wm: Option<Value>,
    #[serde(default)]
    pub images: Vec<String>,
}

/// Secondary (`v2`) payload.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SecondaryPayload {
    #[serde(default, alias = "id")]
    pub aweme_id: Option<Value>,
    #[serde(default, alias = "title")]
    pub desc: Option<String>,
    #[serde(default)]
    pub create_time: Option<i64>,
    #[serde(default)]
    pub author: Option<TierAuthor>,
    #[serde(default)]
    pub play_urls: Vec<String>,
    #[serde(default)]
    pub images: Vec<String>,
}

/// Author block; field names drifted between tiers, hence the aliases.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TierAuthor {
    #[serde(default, alias = "uid")]
    pub id: Option<Value>,
    #[serde(default, rename = "unique_id", alias = "username")]
    pub handle: Option<String>,
    #[serde(default)]
    pub nickname: Option<String>,
}

/// Flatten a tier payload into a [`ContentReference`].
///
/// Guarantees the reference carries at least one media locator; a payload
/// with nothing playable is a malformed-payload error.
pub fn normalize(payload: TierPayload) -> Result<ContentReference, ExtractError> {
    match payload {
        TierPayload::Primary(p) => normalize_primary(p),
        TierPayload::Secondary(s) => normalize_secondary(s),
    }
}

fn normalize_primary(p: PrimaryPayload) -> Result<ContentReference, ExtractError> {
    let media_id = value_to_string(p.id.as_ref());
    let author = author_ref(p.author);
    let description = p.title.unwrap_or_default();

    let images = non_empty(p.images);
    if !images.is_empty() {
        return Ok(ContentReference {
            media_id,
            kind: ContentKind::ImageSet,
            tier: Tier::Primary,
            author,
            description,
            created_at: p.create_time,
            media_locators: images,
        });
    }

    // Legacy fields in preference order; absent ones are skipped.
    let candidates = [&p.video, &p.video1, &p.video2, &p.video_hd, &p.video_wm];
    let mut locators = Vec::new();
    for candidate in candidates {
        if let Some(url) = locator_from(candidate.as_ref()) {
            locators.push(url);
        }
    }

    if locators.is_empty() {
        return Err(ExtractError::Malformed(
            "v1 payload carries no playable locator".to_string(),
        ));
    }

    Ok(ContentReference {
        media_id,
        kind: ContentKind::Video,
        tier: Tier::Primary,
        author,
        description,
        created_at: p.create_time,
        media_locators: locators,
    })
}

fn normalize_secondary(s: SecondaryPayload) -> Result<ContentReference, ExtractError> {
    let media_id = value_to_string(s.aweme_id.as_ref());
    let author = author_ref(s.author);
    let description = s.desc.unwrap_or_default();

    let images = non_empty(s.images);
    if !images.is_empty() {
        return Ok(ContentReference {
            media_id,
            kind: ContentKind::ImageSet,
            tier: Tier::Secondary,
            author,
            description,
            created_at: s.create_time,
            media_locators: images,
        });
    }

    let locators = non_empty(s.play_urls);
    if locators.is_empty() {
        return Err(ExtractError::Malformed(
            "v2 payload carries no play URLs".to_string(),
        ));
    }

    Ok(ContentReference {
        media_id,
        kind: ContentKind::Video,
        tier: Tier::Secondary,
        author,
        description,
        created_at: s.create_time,
        media_locators: locators,
    })
}

/// One locator candidate: a string is taken as-is, an array contributes its
/// first string element.
fn locator_from(value: Option<&Value>) -> Option<String> {
    match value {
        Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
        Some(Value::Array(items)) => items
            .iter()
            .find_map(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(str::to_string),
        _ => None,
    }
}

fn author_ref(author: Option<TierAuthor>) -> AuthorRef {
    match author {
        Some(a) => AuthorRef {
            id: value_to_string(a.id.as_ref()),
            handle: a
                .handle
                .filter(|h| !h.is_empty())
                .unwrap_or_else(|| "unknown".to_string()),
            nickname: a.nickname.filter(|n| !n.is_empty()),
        },
        None => AuthorRef {
            id: String::new(),
            handle: "unknown".to_string(),
            nickname: None,
        },
    }
}

/// The service is inconsistent about numeric IDs: sometimes a string,
/// sometimes a bare number.
fn value_to_string(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    }
}

fn non_empty(items: Vec<String>) -> Vec<String> {
    items.into_iter().filter(|s| !s.is_empty()).collect()
}
