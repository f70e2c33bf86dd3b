//! Resource governor
//!
//! Owns every scarce resource the bot shares across links: the per-user
//! session slots, the download and upload pools, and the shared HTTP client
//! with its keep-alive connection pool. All pools are FIFO, so waiters are
//! served in arrival order and none of them can starve.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

use crate::logging::targets;

/// Idle keep-alive window for pooled connections.
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
/// TCP keepalive probe interval for pooled connections.
const TCP_KEEPALIVE: Duration = Duration::from_secs(60);
/// Redirect hop limit; short links resolve through several hops.
const MAX_REDIRECTS: usize = 10;
/// Browser-like user agent; CDN hosts reject obvious bot agents.
const USER_AGENT: &str = "Mozilla/5.0 (Linux; Android 13; Pixel 7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Mobile Safari/537.36";

/// Governor construction errors
#[derive(Debug, Error)]
pub enum GovernorError {
    #[error("failed to build shared HTTP client: {0}")]
    HttpClient(#[from] reqwest::Error),
}

/// Tuning for the governor pools.
#[derive(Debug, Clone)]
pub struct GovernorConfig {
    /// Maximum users served concurrently.
    pub user_slots: usize,
    /// Maximum concurrent media downloads.
    pub download_slots: usize,
    /// Maximum concurrent uploads.
    pub upload_slots: usize,
    /// Age after which a held user slot counts as leaked.
    pub slot_stale_after: Duration,
    /// Interval between stale-slot sweeps.
    pub sweep_interval: Duration,
    /// TCP connect timeout for the shared client.
    pub connect_timeout: Duration,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            user_slots: 5,
            download_slots: 3,
            upload_slots: 2,
            slot_stale_after: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Permit for one media download. Dropping it frees the pool slot.
#[must_use = "dropping the permit immediately releases the download slot"]
#[derive(Debug)]
pub struct DownloadPermit {
    // Held for its Drop; never read.
    _permit: OwnedSemaphorePermit,
}

/// Permit for one upload. Dropping it frees the pool slot.
#[must_use = "dropping the permit immediately releases the upload slot"]
#[derive(Debug)]
pub struct UploadPermit {
    _permit: OwnedSemaphorePermit,
}

/// One user's held session slots.
///
/// A user posting several links holds one permit per in-flight link; the
/// entry survives until every permit is released or the sweep reclaims it.
struct SessionSlot {
    permits: Vec<OwnedSemaphorePermit>,
    refreshed_at: Instant,
}

/// Shared concurrency state for the whole bot.
pub struct ResourceGovernor {
    users: Arc<Semaphore>,
    downloads: Arc<Semaphore>,
    uploads: Arc<Semaphore>,
    active: Mutex<HashMap<String, SessionSlot>>,
    http: reqwest::Client,
    config: GovernorConfig,
}

impl ResourceGovernor {
    pub fn new(config: GovernorConfig) -> Result<Self, GovernorError> {
        let http = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .pool_idle_timeout(POOL_IDLE_TIMEOUT)
            .pool_max_idle_per_host(config.download_slots.max(config.upload_slots))
            .tcp_keepalive(TCP_KEEPALIVE)
            .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
            .user_agent(USER_AGENT)
            .build()?;

        Ok(Self {
            users: Arc::new(Semaphore::new(config.user_slots)),
            downloads: Arc::new(Semaphore::new(config.download_slots)),
            uploads: Arc::new(Semaphore::new(config.upload_slots)),
            active: Mutex::new(HashMap::new()),
            http,
            config,
        })
    }

    /// Shared HTTP client. All downloads and extraction calls reuse its
    /// connection pool.
    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    /// Acquire a session slot for a user, suspending until one is free.
    ///
    /// Never fails; backpressure is expressed purely as waiting. The caller
    /// must pair this with [`release_user_slot`](Self::release_user_slot).
    pub async fn acquire_user_slot(&self, user_id: &str) {
        let permit = self
            .users
            .clone()
            .acquire_owned()
            .await
            .expect("user semaphore closed");

        let mut active = self.active.lock();
        let slot = active
            .entry(user_id.to_string())
            .or_insert_with(|| SessionSlot {
                permits: Vec::new(),
                refreshed_at: Instant::now(),
            });
        slot.permits.push(permit);
        slot.refreshed_at = Instant::now();
        debug!(
            target: targets::GOVERNOR,
            user_id,
            held = slot.permits.len(),
            "user slot acquired"
        );
    }

    /// Release one session slot for a user.
    ///
    /// Releasing a slot that is not held is a harmless no-op, so cleanup
    /// paths can call this unconditionally.
    pub fn release_user_slot(&self, user_id: &str) {
        let mut active = self.active.lock();
        match active.get_mut(user_id) {
            Some(slot) => {
                slot.permits.pop();
                let remaining = slot.permits.len();
                if remaining == 0 {
                    active.remove(user_id);
                }
                debug!(target: targets::GOVERNOR, user_id, remaining, "user slot released");
            }
            None => {
                debug!(target: targets::GOVERNOR, user_id, "release for unheld user slot ignored");
            }
        }
    }

    /// Acquire a download pool slot, suspending until one is free.
    pub async fn acquire_download_slot(&self) -> DownloadPermit {
        DownloadPermit {
            _permit: self
                .downloads
                .clone()
                .acquire_owned()
                .await
                .expect("download semaphore closed"),
        }
    }

    /// Acquire an upload pool slot, suspending until one is free.
    pub async fn acquire_upload_slot(&self) -> UploadPermit {
        UploadPermit {
            _permit: self
                .uploads
                .clone()
                .acquire_owned()
                .await
                .expect("upload semaphore closed"),
        }
    }

    /// Number of users currently holding at least one session slot.
    pub fn active_users(&self) -> usize {
        self.active.lock().len()
    }

    /// Free session slots right now.
    pub fn user_slots_available(&self) -> usize {
        self.users.available_permits()
    }

    /// Force-release slots whose holder has gone quiet.
    ///
    /// A slot not refreshed within the stale window is assumed leaked by a
    /// crashed or wedged pipeline run; all permits held under that user are
    /// returned to the pool. Returns the number of users reclaimed.
    pub fn sweep_stale(&self) -> usize {
        let threshold = self.config.slot_stale_after;
        let mut active = self.active.lock();
        let before = active.len();
        active.retain(|user_id, slot| {
            let stale = slot.refreshed_at.elapsed() >= threshold;
            if stale {
                warn!(
                    target: targets::GOVERNOR,
                    user_id = %user_id,
                    held = slot.permits.len(),
                    "force-releasing stale user slots"
                );
            }
            !stale
        });
        before - active.len()
    }
}

/// Run the periodic stale-slot sweep.
///
/// Stops when a shutdown signal is received.
pub async fn slot_sweep_loop(
    governor: Arc<ResourceGovernor>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(governor.config.sweep_interval);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => break,
        }

        if *shutdown.borrow() {
            break;
        }

        let reclaimed = governor.sweep_stale();
        if reclaimed > 0 {
            info!(target: targets::GOVERNOR, reclaimed, "stale user slots reclaimed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn governor_with(user_slots: usize, stale_after: Duration) -> Arc<ResourceGovernor> {
        Arc::new(
            ResourceGovernor::new(GovernorConfig {
                user_slots,
                slot_stale_after: stale_after,
                ..GovernorConfig::default()
            })
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_user_ceiling_enforced() {
        let gov = governor_with(1, Duration::from_secs(300));
        gov.acquire_user_slot("alice").await;
        assert_eq!(gov.user_slots_available(), 0);

        let gov2 = gov.clone();
        let waiter = tokio::spawn(async move {
            gov2.acquire_user_slot("bob").await;
        });

        // Bob must not get in while Alice holds the only slot.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        gov.release_user_slot("alice");
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should proceed after release")
            .unwrap();
        assert_eq!(gov.active_users(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiters_served_in_arrival_order() {
        let gov = governor_with(1, Duration::from_secs(300));
        gov.acquire_user_slot("holder").await;

        let order = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for name in ["first", "second", "third"] {
            let gov = gov.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                gov.acquire_user_slot(name).await;
                order.lock().push(name);
                gov.release_user_slot(name);
            }));
            // Give each waiter time to enqueue before the next arrives.
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        gov.release_user_slot("holder");
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(*order.lock(), vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn test_release_unknown_user_is_noop() {
        let gov = governor_with(2, Duration::from_secs(300));
        gov.release_user_slot("nobody");
        assert_eq!(gov.user_slots_available(), 2);
        assert_eq!(gov.active_users(), 0);
    }

    #[tokio::test]
    async fn test_release_pops_one_permit_at_a_time() {
        let gov = governor_with(3, Duration::from_secs(300));
        gov.acquire_user_slot("alice").await;
        gov.acquire_user_slot("alice").await;
        assert_eq!(gov.user_slots_available(), 1);
        assert_eq!(gov.active_users(), 1);

        gov.release_user_slot("alice");
        assert_eq!(gov.user_slots_available(), 2);
        assert_eq!(gov.active_users(), 1);

        gov.release_user_slot("alice");
        assert_eq!(gov.user_slots_available(), 3);
        assert_eq!(gov.active_users(), 0);
    }

    #[tokio::test]
    async fn test_sweep_reclaims_stale_slots() {
        let gov = governor_with(2, Duration::ZERO);
        gov.acquire_user_slot("alice").await;
        gov.acquire_user_slot("alice").await;
        assert_eq!(gov.user_slots_available(), 0);

        let reclaimed = gov.sweep_stale();
        assert_eq!(reclaimed, 1);
        assert_eq!(gov.active_users(), 0);
        // Both permits held by the stale entry must return to the pool.
        assert_eq!(gov.user_slots_available(), 2);
    }

    #[tokio::test]
    async fn test_sweep_keeps_fresh_slots() {
        let gov = governor_with(2, Duration::from_secs(60));
        gov.acquire_user_slot("alice").await;

        assert_eq!(gov.sweep_stale(), 0);
        assert_eq!(gov.active_users(), 1);
        assert_eq!(gov.user_slots_available(), 1);
    }

    #[tokio::test]
    async fn test_download_and_upload_pools_are_independent() {
        let gov = governor_with(1, Duration::from_secs(300));
        let _d1 = gov.acquire_download_slot().await;
        let _d2 = gov.acquire_download_slot().await;
        // Upload pool is untouched by download permits.
        let _u1 = gov.acquire_upload_slot().await;

        let permit = gov.acquire_download_slot().await;
        drop(permit);
        // Dropping a permit frees the slot for the next waiter.
        let _d3 = gov.acquire_download_slot().await;
    }

    #[tokio::test]
    async fn test_sweep_loop_shutdown() {
        let gov = governor_with(1, Duration::from_secs(300));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(slot_sweep_loop(gov, shutdown_rx));

        let _ = shutdown_tx.send(true);

        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("sweep loop should exit on shutdown")
            .expect("task should not panic");
    }
}
