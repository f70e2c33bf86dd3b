//! Inbound long-polling loop.
//!
//! Polls getUpdates and spawns one delivery job per platform link found
//! in each inbound message. Long polling is the only inbound path.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::links;
use crate::logging::targets;
use crate::pipeline::{DeliveryOrchestrator, LinkRequest};
use crate::telegram::types::{extract_inbound, TelegramUpdate};
use crate::telegram::MessageRef;

/// Long-poll timeout passed to getUpdates.
const POLL_TIMEOUT_SECS: u64 = 30;
/// Client-side request timeout (must exceed the poll timeout).
const REQUEST_TIMEOUT: Duration = Duration::from_secs(POLL_TIMEOUT_SECS + 10);
/// Backoff between failed poll attempts.
const ERROR_BACKOFF: Duration = Duration::from_secs(3);

#[derive(Debug, Deserialize)]
struct GetUpdatesResponse {
    ok: bool,
    #[serde(default)]
    result: Vec<TelegramUpdate>,
    #[serde(default)]
    description: Option<String>,
}

/// Run the long-polling receive loop until shutdown.
pub async fn receive_loop(
    base_url: String,
    bot_token: String,
    orchestrator: Arc<DeliveryOrchestrator>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let client = reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()
        .expect("failed to build long-poll HTTP client");
    let updates_url = build_get_updates_url(&base_url, &bot_token);

    info!(target: targets::BOT, "long-poll receive loop started");

    let mut offset: Option<i64> = None;
    let mut consecutive_errors: u32 = 0;

    loop {
        if *shutdown.borrow() {
            info!(target: targets::BOT, "receive loop shutting down");
            break;
        }

        let mut had_error = false;
        let request_url = build_poll_request_url(&updates_url, offset);
        match client.get(&request_url).send().await {
            Ok(resp) if resp.status().is_success() => {
                match resp.json::<GetUpdatesResponse>().await {
                    Ok(payload) if payload.ok => {
                        if consecutive_errors > 0 {
                            info!(
                                target: targets::BOT,
                                "receive loop recovered after {} errors", consecutive_errors
                            );
                            consecutive_errors = 0;
                        }
                        for update in payload.result {
                            offset = next_offset_after_update(offset, update.update_id);
                            dispatch_update(&orchestrator, &update);
                        }
                    }
                    Ok(payload) => {
                        had_error = true;
                        consecutive_errors += 1;
                        let description = payload
                            .description
                            .unwrap_or_else(|| "getUpdates returned ok=false".to_string());
                        if consecutive_errors <= 3 {
                            warn!(target: targets::BOT, "getUpdates returned error: {description}");
                        }
                    }
                    Err(err) => {
                        had_error = true;
                        consecutive_errors += 1;
                        if consecutive_errors <= 3 {
                            warn!(target: targets::BOT, "getUpdates response parse failed: {err}");
                        }
                    }
                }
            }
            Ok(resp) => {
                had_error = true;
                consecutive_errors += 1;
                if consecutive_errors <= 3 {
                    warn!(target: targets::BOT, "getUpdates HTTP {}", resp.status());
                }
            }
            Err(err) => {
                had_error = true;
                consecutive_errors += 1;
                if consecutive_errors <= 3 {
                    warn!(
                        target: targets::BOT,
                        "getUpdates request failed: {}", classify_transport_error(&err)
                    );
                } else if consecutive_errors == 4 {
                    warn!(
                        target: targets::BOT,
                        "receive errors continuing (suppressing further logs until recovery)"
                    );
                }
            }
        }

        if had_error {
            tokio::select! {
                _ = tokio::time::sleep(ERROR_BACKOFF) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!(target: targets::BOT, "receive loop shutting down");
                        break;
                    }
                }
            }
        } else {
            debug!(target: targets::BOT, "long-poll request completed");
        }
    }
}

/// Spawn one delivery job per platform link in the update.
fn dispatch_update(orchestrator: &Arc<DeliveryOrchestrator>, update: &TelegramUpdate) {
    let Some(inbound) = extract_inbound(update) else {
        return;
    };

    let found = links::extract_links(&inbound.text);
    if found.is_empty() {
        return;
    }

    debug!(
        target: targets::BOT,
        chat_id = inbound.chat_id,
        sender_id = inbound.sender_id,
        links = found.len(),
        "platform links received"
    );

    for url in found {
        let request = LinkRequest {
            url,
            chat_id: inbound.chat_id,
            user_id: inbound.sender_id,
            trigger: MessageRef {
                chat_id: inbound.chat_id,
                message_id: inbound.message_id,
            },
            chat_kind: inbound.chat_kind,
        };
        let orchestrator = Arc::clone(orchestrator);
        // Jobs run detached; the per-user slot cap bounds how many pile up.
        tokio::spawn(async move {
            orchestrator.handle_link(request).await;
        });
    }
}

fn build_get_updates_url(base_url: &str, bot_token: &str) -> String {
    let base = base_url.trim_end_matches('/');
    format!("{base}/bot{bot_token}/getUpdates")
}

fn build_poll_request_url(base_url: &str, offset: Option<i64>) -> String {
    let mut url = format!("{base_url}?timeout={POLL_TIMEOUT_SECS}");
    if let Some(offset) = offset {
        url.push_str("&offset=");
        url.push_str(&offset.to_string());
    }
    url
}

/// Acknowledge everything up to and including this update, never moving
/// backwards.
fn next_offset_after_update(current: Option<i64>, update_id: Option<i64>) -> Option<i64> {
    let Some(update_id) = update_id else {
        return current;
    };
    let next = update_id.saturating_add(1);
    Some(current.map_or(next, |current_value| current_value.max(next)))
}

fn classify_transport_error(err: &reqwest::Error) -> &'static str {
    if err.is_timeout() {
        "request timeout"
    } else if err.is_connect() {
        "connection error"
    } else {
        "request failed"
    }
}
