//! Delivery caption construction.
//!
//! Builds both the rich (HTML) and plain variants up front so the
//! degradation ladder never re-derives text mid-failure.

use chrono::{TimeZone, Utc};

use crate::extract::ContentReference;

/// Ceiling on embedded description text. Keeps the whole caption
/// comfortably under Telegram's 1024-character caption limit.
const MAX_DESCRIPTION_CHARS: usize = 200;

/// Caption text in both delivery registers.
#[derive(Debug, Clone)]
pub struct Caption {
    /// Rich variant with HTML markup.
    pub html: String,
    /// Fallback sent as a separate plain message when rich delivery fails.
    pub plain: String,
}

/// Assemble the caption for one delivery.
///
/// Contains the author handle, creation timestamp, payload size, the
/// tier that resolved the link, the original link, and a truncated
/// description. Absent fields are simply omitted.
pub fn build(reference: &ContentReference, link: &str, byte_size: Option<u64>) -> Caption {
    let mut html = format!("<b>@{}</b>", escape_html(&reference.author.handle));
    let mut plain = format!("@{}", reference.author.handle);

    let nickname = reference
        .author
        .nickname
        .as_deref()
        .filter(|n| !n.is_empty())
        .filter(|n| *n != reference.author.handle.as_str());
    if let Some(nickname) = nickname {
        html.push_str(&format!(" ({})", escape_html(nickname)));
        plain.push_str(&format!(" ({nickname})"));
    }

    let description = reference.description.trim();
    if !description.is_empty() {
        let truncated = truncate_chars(description, MAX_DESCRIPTION_CHARS);
        html.push('\n');
        html.push_str(&escape_html(&truncated));
        plain.push('\n');
        plain.push_str(&truncated);
    }

    let mut meta: Vec<String> = Vec::new();
    if let Some(timestamp) = reference.created_at.and_then(format_timestamp) {
        meta.push(timestamp);
    }
    if let Some(size) = byte_size {
        meta.push(format_size(size));
    }
    meta.push(format!("via {}", reference.tier.label()));
    let meta = meta.join(" | ");

    html.push_str("\n\n");
    html.push_str(&meta);
    plain.push_str("\n\n");
    plain.push_str(&meta);

    html.push('\n');
    html.push_str(&format!("<a href=\"{}\">source</a>", escape_html(link)));
    plain.push('\n');
    plain.push_str(link);

    Caption { html, plain }
}

/// Unix seconds to the caption's display form.
fn format_timestamp(created_at: i64) -> Option<String> {
    Utc.timestamp_opt(created_at, 0)
        .single()
        .map(|dt| dt.format("%Y-%m-%d %H:%M UTC").to_string())
}

fn format_size(bytes: u64) -> String {
    const MB: f64 = 1024.0 * 1024.0;
    format!("{:.2} MB", bytes as f64 / MB)
}

/// Character-boundary-safe truncation with an ellipsis marker.
fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut truncated: String = text.chars().take(max_chars).collect();
    truncated.push('…');
    truncated
}

/// Escape for Telegram's HTML parse mode.
fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::{AuthorRef, ContentKind, Tier};

    fn reference() -> ContentReference {
        ContentReference {
            media_id: "7312345678901234567".to_string(),
            kind: ContentKind::Video,
            tier: Tier::Primary,
            author: AuthorRef {
                id: "42".to_string(),
                handle: "dancer".to_string(),
                nickname: Some("The Dancer".to_string()),
            },
            description: "spinning <fast> & loose".to_string(),
            // 2024-01-05 13:30:00 UTC
            created_at: Some(1_704_461_400),
            media_locators: vec!["https://cdn.example/v.mp4".to_string()],
        }
    }

    #[test]
    fn test_build_full_caption() {
        let caption = build(
            &reference(),
            "https://www.tiktok.com/@dancer/video/7312345678901234567",
            Some(5 * 1024 * 1024),
        );

        assert!(caption.html.contains("<b>@dancer</b>"));
        assert!(caption.html.contains("(The Dancer)"));
        assert!(caption.html.contains("spinning &lt;fast&gt; &amp; loose"));
        assert!(caption.html.contains("2024-01-05 13:30 UTC"));
        assert!(caption.html.contains("5.00 MB"));
        assert!(caption.html.contains("via v1"));
        assert!(caption.html.contains("<a href=\"https://www.tiktok.com/@dancer/video/7312345678901234567\">source</a>"));

        assert!(caption.plain.contains("@dancer"));
        assert!(caption.plain.contains("spinning <fast> & loose"));
        assert!(caption.plain.contains("5.00 MB"));
        assert!(!caption.plain.contains("<b>"));
        assert!(!caption.plain.contains("<a href"));
    }

    #[test]
    fn test_build_omits_absent_fields() {
        let mut reference = reference();
        reference.tier = Tier::Secondary;
        reference.author.nickname = None;
        reference.description = "  ".to_string();
        reference.created_at = None;

        let caption = build(&reference, "https://vm.tiktok.com/ZMabc/", None);

        assert!(caption.html.contains("via v2"));
        assert!(!caption.html.contains(" MB"));
        assert!(!caption.html.contains("UTC"));
        assert!(!caption.html.contains('('));
        assert!(caption.plain.ends_with("https://vm.tiktok.com/ZMabc/"));
    }

    #[test]
    fn test_nickname_equal_to_handle_is_dropped() {
        let mut reference = reference();
        reference.author.nickname = Some("dancer".to_string());
        let caption = build(&reference, "https://vm.tiktok.com/x/", None);
        assert!(!caption.plain.contains("(dancer)"));
    }

    #[test]
    fn test_truncate_chars_respects_boundaries() {
        let text = "é".repeat(300);
        let truncated = truncate_chars(&text, MAX_DESCRIPTION_CHARS);
        assert_eq!(truncated.chars().count(), MAX_DESCRIPTION_CHARS + 1);
        assert!(truncated.ends_with('…'));

        assert_eq!(truncate_chars("short", 200), "short");
    }

    #[test]
    fn test_format_size_two_decimals() {
        assert_eq!(format_size(5 * 1024 * 1024), "5.00 MB");
        assert_eq!(format_size(512 * 1024), "0.50 MB");
        assert_eq!(format_size(0), "0.00 MB");
    }

    #[test]
    fn test_format_timestamp() {
        assert_eq!(
            format_timestamp(1_704_461_400).as_deref(),
            Some("2024-01-05 13:30 UTC")
        );
    }

    #[test]
    fn test_escape_html_order() {
        // Ampersand first, or the entity itself gets re-escaped.
        assert_eq!(escape_html("<a> & <b>"), "&lt;a&gt; &amp; &lt;b&gt;");
    }
}
