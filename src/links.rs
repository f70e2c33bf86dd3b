//! Link intake
//!
//! Recognizes TikTok links in free-form chat text. Handles full web links,
//! mobile links, and the short `vm.`/`vt.` redirect forms, with or without
//! an explicit scheme.

use std::sync::LazyLock;

use regex::Regex;
use url::Url;

/// Maximum number of links processed from a single message.
pub const MAX_LINKS_PER_MESSAGE: usize = 5;

/// Hostnames TikTok serves content links from.
const PLATFORM_HOSTS: [&str; 5] = [
    "tiktok.com",
    "www.tiktok.com",
    "m.tiktok.com",
    "vm.tiktok.com",
    "vt.tiktok.com",
];

static LINK_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:https?://)?(?:www\.|m\.|vm\.|vt\.)?tiktok\.com/[^\s<>]+")
        .expect("link regex is valid")
});

/// Extract platform links from message text.
///
/// Results are deduplicated preserving first-seen order, normalized to carry
/// an `https://` scheme, and capped at [`MAX_LINKS_PER_MESSAGE`].
pub fn extract_links(text: &str) -> Vec<String> {
    let mut links: Vec<String> = Vec::new();
    for mat in LINK_REGEX.find_iter(text) {
        // Reject matches that start mid-word ("nottiktok.com/...").
        if !starts_at_boundary(text, mat.start()) {
            continue;
        }

        let link = ensure_scheme(strip_trailing_punctuation(mat.as_str()));
        if !is_platform_link(&link) {
            continue;
        }
        if !links.contains(&link) {
            links.push(link);
        }
        if links.len() >= MAX_LINKS_PER_MESSAGE {
            break;
        }
    }
    links
}

/// Whether a URL points at a supported platform host.
pub fn is_platform_link(link: &str) -> bool {
    let Ok(parsed) = Url::parse(link) else {
        return false;
    };
    if parsed.scheme() != "http" && parsed.scheme() != "https" {
        return false;
    }
    match parsed.host_str() {
        Some(host) => PLATFORM_HOSTS
            .iter()
            .any(|h| host.eq_ignore_ascii_case(h)),
        None => false,
    }
}

/// True when the character before `start` cannot be part of a hostname.
fn starts_at_boundary(text: &str, start: usize) -> bool {
    match text[..start].chars().next_back() {
        None => true,
        Some(c) => !(c.is_ascii_alphanumeric() || c == '.' || c == '-'),
    }
}

fn strip_trailing_punctuation(link: &str) -> String {
    let mut s = link.to_string();
    while s.ends_with('.')
        || s.ends_with(',')
        || s.ends_with(';')
        || s.ends_with(')')
        || s.ends_with('!')
        || s.ends_with('?')
    {
        s.pop();
    }
    s
}

fn ensure_scheme(link: String) -> String {
    if link.starts_with("http://") || link.starts_with("https://") {
        link
    } else {
        format!("https://{link}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extracts_full_video_link() {
        let links = extract_links("look at this https://www.tiktok.com/@someone/video/7312345678901234567 lol");
        assert_eq!(
            links,
            vec!["https://www.tiktok.com/@someone/video/7312345678901234567"]
        );
    }

    #[test]
    fn test_extracts_short_link() {
        let links = extract_links("https://vm.tiktok.com/ZMabcdef/");
        assert_eq!(links, vec!["https://vm.tiktok.com/ZMabcdef/"]);
    }

    #[test]
    fn test_extracts_photo_link() {
        let links = extract_links("https://www.tiktok.com/@someone/photo/7312345678901234567");
        assert_eq!(links.len(), 1);
    }

    #[test]
    fn test_adds_missing_scheme() {
        let links = extract_links("vm.tiktok.com/ZMabcdef");
        assert_eq!(links, vec!["https://vm.tiktok.com/ZMabcdef"]);
    }

    #[test]
    fn test_strips_sentence_punctuation() {
        let links = extract_links("see https://vt.tiktok.com/ZSxyz/, funny right?");
        assert_eq!(links, vec!["https://vt.tiktok.com/ZSxyz/"]);
    }

    #[test]
    fn test_deduplicates_preserving_order() {
        let text = "https://vm.tiktok.com/aaa https://vm.tiktok.com/bbb https://vm.tiktok.com/aaa";
        let links = extract_links(text);
        assert_eq!(
            links,
            vec![
                "https://vm.tiktok.com/aaa",
                "https://vm.tiktok.com/bbb"
            ]
        );
    }

    #[test]
    fn test_ignores_lookalike_hosts() {
        assert!(extract_links("https://nottiktok.com/@x/video/1").is_empty());
        assert!(extract_links("https://tiktok.com.evil.example/@x/video/1").is_empty());
    }

    #[test]
    fn test_ignores_plain_text() {
        assert!(extract_links("no links here, just chatter").is_empty());
        assert!(extract_links("").is_empty());
    }

    #[test]
    fn test_caps_links_per_message() {
        let text = (0..10)
            .map(|i| format!("https://vm.tiktok.com/link{i}"))
            .collect::<Vec<_>>()
            .join(" ");
        assert_eq!(extract_links(&text).len(), MAX_LINKS_PER_MESSAGE);
    }

    #[test]
    fn test_is_platform_link() {
        assert!(is_platform_link("https://www.tiktok.com/@a/video/1"));
        assert!(is_platform_link("http://m.tiktok.com/v/1"));
        assert!(is_platform_link("https://VM.TikTok.com/abc"));
        assert!(!is_platform_link("https://example.com/"));
        assert!(!is_platform_link("ftp://tiktok.com/x"));
        assert!(!is_platform_link("not a url"));
    }
}
