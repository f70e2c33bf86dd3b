//! Content fetcher
//!
//! Drives the extraction tiers with per-tier retry budgets and exponential
//! backoff. Two policies exist: `sequential` exhausts the primary tier before
//! touching the secondary, `race` runs both concurrently with a grace head
//! start for the primary and cancels the loser.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinError;
use tracing::{debug, info, warn};

use crate::extract::{normalize, ContentReference, ContentSource, ExtractError, Tier};
use crate::logging::targets;

/// How the two extraction tiers are scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchPolicy {
    /// Exhaust the primary tier, then fall back to the secondary.
    #[default]
    Sequential,
    /// Run both tiers concurrently; first success wins, loser is cancelled.
    Race,
}

impl fmt::Display for FetchPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchPolicy::Sequential => f.write_str("sequential"),
            FetchPolicy::Race => f.write_str("race"),
        }
    }
}

/// Retry budget and backoff shape for one tier.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
}

impl RetryPolicy {
    /// Delay before the attempt following `failed_attempts` failures.
    ///
    /// Doubles per failure, clamped to the cap, so delays never shrink.
    pub fn delay_for(&self, failed_attempts: u32) -> Duration {
        let factor = 2u32.saturating_pow(failed_attempts.min(16));
        self.backoff_base.saturating_mul(factor).min(self.backoff_cap)
    }
}

/// Fetcher tuning.
#[derive(Debug, Clone)]
pub struct FetcherConfig {
    pub primary: RetryPolicy,
    pub secondary: RetryPolicy,
    /// When false the secondary tier is never consulted.
    pub fallback_enabled: bool,
    pub policy: FetchPolicy,
    /// Head start for the primary tier under the race policy.
    pub race_grace: Duration,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            primary: RetryPolicy {
                attempts: 3,
                backoff_base: Duration::from_millis(500),
                backoff_cap: Duration::from_secs(10),
            },
            secondary: RetryPolicy {
                attempts: 2,
                backoff_base: Duration::from_millis(500),
                backoff_cap: Duration::from_secs(10),
            },
            fallback_enabled: true,
            policy: FetchPolicy::Sequential,
            race_grace: Duration::from_millis(1500),
        }
    }
}

/// Fetch failure after every allowed attempt.
///
/// `last` is the most recent underlying error, which is also the most
/// specific one for user-facing messaging.
#[derive(Debug, Error)]
#[error("extraction failed after {attempts} attempts: {last}")]
pub struct FetchError {
    pub attempts: u32,
    pub last: ExtractError,
}

/// Resolves share links into [`ContentReference`]s.
pub struct ContentFetcher {
    source: Arc<dyn ContentSource>,
    config: FetcherConfig,
}

impl ContentFetcher {
    pub fn new(source: Arc<dyn ContentSource>, config: FetcherConfig) -> Self {
        Self { source, config }
    }

    /// Resolve a share link, consuming retry budgets per the configured
    /// policy.
    pub async fn fetch(&self, url: &str) -> Result<ContentReference, FetchError> {
        match self.config.policy {
            FetchPolicy::Sequential => self.fetch_sequential(url).await,
            FetchPolicy::Race => self.fetch_race(url).await,
        }
    }

    async fn fetch_sequential(&self, url: &str) -> Result<ContentReference, FetchError> {
        let primary = run_tier(
            self.source.clone(),
            url.to_string(),
            Tier::Primary,
            self.config.primary,
        )
        .await;

        let primary_err = match primary {
            Ok(reference) => return Ok(reference),
            Err(e) => e,
        };

        if !self.config.fallback_enabled {
            return Err(FetchError {
                attempts: self.config.primary.attempts,
                last: primary_err,
            });
        }

        info!(
            target: targets::FETCH,
            url,
            error = %primary_err,
            "primary tier exhausted, falling back to secondary"
        );

        run_tier(
            self.source.clone(),
            url.to_string(),
            Tier::Secondary,
            self.config.secondary,
        )
        .await
        .map_err(|last| FetchError {
            attempts: self.config.primary.attempts + self.config.secondary.attempts,
            last,
        })
    }

    async fn fetch_race(&self, url: &str) -> Result<ContentReference, FetchError> {
        if !self.config.fallback_enabled {
            // Nothing to race against.
            return run_tier(
                self.source.clone(),
                url.to_string(),
                Tier::Primary,
                self.config.primary,
            )
            .await
            .map_err(|last| FetchError {
                attempts: self.config.primary.attempts,
                last,
            });
        }

        let total_attempts = self.config.primary.attempts + self.config.secondary.attempts;

        let mut primary = tokio::spawn(run_tier(
            self.source.clone(),
            url.to_string(),
            Tier::Primary,
            self.config.primary,
        ));

        let grace = self.config.race_grace;
        let source = self.source.clone();
        let secondary_url = url.to_string();
        let secondary_policy = self.config.secondary;
        let mut secondary = tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            run_tier(source, secondary_url, Tier::Secondary, secondary_policy).await
        });

        let (winner_tier, first, loser) = tokio::select! {
            r = &mut primary => (Tier::Primary, flatten_join(r), secondary),
            r = &mut secondary => (Tier::Secondary, flatten_join(r), primary),
        };

        match first {
            Ok(reference) => {
                debug!(target: targets::FETCH, winner = %winner_tier, "race settled, cancelling losing tier");
                loser.abort();
                Ok(reference)
            }
            Err(first_err) => {
                debug!(
                    target: targets::FETCH,
                    loser = %winner_tier,
                    error = %first_err,
                    "first tier to finish failed, waiting on the other"
                );
                match loser.await {
                    Ok(Ok(reference)) => Ok(reference),
                    Ok(Err(last)) => Err(FetchError {
                        attempts: total_attempts,
                        last,
                    }),
                    Err(_) => Err(FetchError {
                        attempts: total_attempts,
                        last: first_err,
                    }),
                }
            }
        }
    }
}

/// Run every attempt one tier is allowed.
///
/// A malformed payload consumes an attempt exactly like a transport failure.
async fn run_tier(
    source: Arc<dyn ContentSource>,
    url: String,
    tier: Tier,
    policy: RetryPolicy,
) -> Result<ContentReference, ExtractError> {
    let mut last: Option<ExtractError> = None;

    for attempt in 0..policy.attempts {
        if attempt > 0 {
            tokio::time::sleep(policy.delay_for(attempt - 1)).await;
        }

        match attempt_once(source.as_ref(), &url, tier).await {
            Ok(reference) => {
                if attempt > 0 {
                    debug!(target: targets::FETCH, tier = %tier, attempt = attempt + 1, "tier recovered after retry");
                }
                return Ok(reference);
            }
            Err(e) => {
                warn!(
                    target: targets::FETCH,
                    tier = %tier,
                    attempt = attempt + 1,
                    budget = policy.attempts,
                    error = %e,
                    "extraction attempt failed"
                );
                last = Some(e);
            }
        }
    }

    Err(last.unwrap_or_else(|| ExtractError::Malformed("no attempts configured".to_string())))
}

async fn attempt_once(
    source: &dyn ContentSource,
    url: &str,
    tier: Tier,
) -> Result<ContentReference, ExtractError> {
    let payload = source.lookup(url, tier).await?;
    normalize(payload)
}

fn flatten_join(
    result: Result<Result<ContentReference, ExtractError>, JoinError>,
) -> Result<ContentReference, ExtractError> {
    match result {
        Ok(inner) => inner,
        Err(join) => Err(ExtractError::Malformed(format!(
            "extraction task failed: {join}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::{PrimaryPayload, SecondaryPayload, TierPayload};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::Value;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    /// Source that replays scripted responses per tier and records call
    /// counts.
    struct ScriptedSource {
        primary: Mutex<VecDeque<Result<TierPayload, ExtractError>>>,
        secondary: Mutex<VecDeque<Result<TierPayload, ExtractError>>>,
        primary_calls: AtomicU32,
        secondary_calls: AtomicU32,
        primary_delay: Duration,
        secondary_delay: Duration,
        primary_completed: AtomicBool,
    }

    impl ScriptedSource {
        fn new(
            primary: Vec<Result<TierPayload, ExtractError>>,
            secondary: Vec<Result<TierPayload, ExtractError>>,
        ) -> Arc<Self> {
            Arc::new(Self {
                primary: Mutex::new(primary.into()),
                secondary: Mutex::new(secondary.into()),
                primary_calls: AtomicU32::new(0),
                secondary_calls: AtomicU32::new(0),
                primary_delay: Duration::ZERO,
                secondary_delay: Duration::ZERO,
                primary_completed: AtomicBool::new(false),
            })
        }

        fn with_delays(self: Arc<Self>, primary: Duration, secondary: Duration) -> Arc<Self> {
            let mut inner = Arc::into_inner(self).unwrap();
            inner.primary_delay = primary;
            inner.secondary_delay = secondary;
            Arc::new(inner)
        }
    }

    #[async_trait]
    impl ContentSource for ScriptedSource {
        async fn lookup(&self, _url: &str, tier: Tier) -> Result<TierPayload, ExtractError> {
            match tier {
                Tier::Primary => {
                    self.primary_calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(self.primary_delay).await;
                    self.primary_completed.store(true, Ordering::SeqCst);
                    self.primary.lock().pop_front().unwrap_or_else(|| {
                        Err(ExtractError::Rejected {
                            message: "script exhausted".to_string(),
                        })
                    })
                }
                Tier::Secondary => {
                    self.secondary_calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(self.secondary_delay).await;
                    self.secondary.lock().pop_front().unwrap_or_else(|| {
                        Err(ExtractError::Rejected {
                            message: "script exhausted".to_string(),
                        })
                    })
                }
            }
        }
    }

    fn primary_video(url: &str) -> TierPayload {
        TierPayload::Primary(PrimaryPayload {
            video: Some(Value::String(url.to_string())),
            ..Default::default()
        })
    }

    fn secondary_video(url: &str) -> TierPayload {
        TierPayload::Secondary(SecondaryPayload {
            play_urls: vec![url.to_string()],
            ..Default::default()
        })
    }

    fn reject(message: &str) -> ExtractError {
        ExtractError::Rejected {
            message: message.to_string(),
        }
    }

    fn quick_config(policy: FetchPolicy) -> FetcherConfig {
        FetcherConfig {
            primary: RetryPolicy {
                attempts: 3,
                backoff_base: Duration::from_millis(10),
                backoff_cap: Duration::from_millis(40),
            },
            secondary: RetryPolicy {
                attempts: 2,
                backoff_base: Duration::from_millis(10),
                backoff_cap: Duration::from_millis(40),
            },
            fallback_enabled: true,
            policy,
            race_grace: Duration::from_millis(100),
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            attempts: 6,
            backoff_base: Duration::from_millis(500),
            backoff_cap: Duration::from_secs(4),
        };
        assert_eq!(policy.delay_for(0), Duration::from_millis(500));
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3), Duration::from_secs(4));
        assert_eq!(policy.delay_for(4), Duration::from_secs(4));

        // Never shrinks.
        let mut prev = Duration::ZERO;
        for i in 0..10 {
            let d = policy.delay_for(i);
            assert!(d >= prev, "delay shrank at attempt {i}");
            prev = d;
        }
    }

    #[tokio::test]
    async fn test_primary_success_skips_secondary() {
        let source = ScriptedSource::new(vec![Ok(primary_video("https://cdn.example/v.mp4"))], vec![]);
        let fetcher = ContentFetcher::new(source.clone(), quick_config(FetchPolicy::Sequential));

        let reference = fetcher.fetch("https://vm.tiktok.com/x").await.unwrap();
        assert_eq!(reference.tier, Tier::Primary);
        assert_eq!(source.primary_calls.load(Ordering::SeqCst), 1);
        assert_eq!(source.secondary_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_primary_budget_exhausted_then_fallback() {
        let source = ScriptedSource::new(
            vec![Err(reject("a")), Err(reject("b")), Err(reject("c"))],
            vec![Err(reject("d")), Ok(secondary_video("https://cdn.example/p.mp4"))],
        );
        let fetcher = ContentFetcher::new(source.clone(), quick_config(FetchPolicy::Sequential));

        let reference = fetcher.fetch("https://vm.tiktok.com/x").await.unwrap();
        assert_eq!(reference.tier, Tier::Secondary);
        // Budgets are consumed exactly, never exceeded.
        assert_eq!(source.primary_calls.load(Ordering::SeqCst), 3);
        assert_eq!(source.secondary_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fallback_disabled_never_touches_secondary() {
        let source = ScriptedSource::new(
            vec![Err(reject("a")), Err(reject("b")), Err(reject("c"))],
            vec![Ok(secondary_video("https://cdn.example/p.mp4"))],
        );
        let mut config = quick_config(FetchPolicy::Sequential);
        config.fallback_enabled = false;
        let fetcher = ContentFetcher::new(source.clone(), config);

        let err = fetcher.fetch("https://vm.tiktok.com/x").await.unwrap_err();
        assert_eq!(err.attempts, 3);
        assert_eq!(source.secondary_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_reports_most_recent_error() {
        let source = ScriptedSource::new(
            vec![
                Err(reject("primary down")),
                Err(reject("primary down")),
                Err(reject("primary down")),
            ],
            vec![Err(reject("secondary down")), Err(reject("secondary down"))],
        );
        let fetcher = ContentFetcher::new(source, quick_config(FetchPolicy::Sequential));

        let err = fetcher.fetch("https://vm.tiktok.com/x").await.unwrap_err();
        assert_eq!(err.attempts, 5);
        assert!(err.last.to_string().contains("secondary down"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_payload_consumes_an_attempt() {
        // An empty primary payload normalizes to a malformed-payload error.
        let source = ScriptedSource::new(
            vec![
                Ok(TierPayload::Primary(PrimaryPayload::default())),
                Ok(primary_video("https://cdn.example/v.mp4")),
            ],
            vec![],
        );
        let fetcher = ContentFetcher::new(source.clone(), quick_config(FetchPolicy::Sequential));

        let reference = fetcher.fetch("https://vm.tiktok.com/x").await.unwrap();
        assert_eq!(reference.tier, Tier::Primary);
        assert_eq!(source.primary_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_race_secondary_wins_and_primary_is_cancelled() {
        let source = ScriptedSource::new(
            vec![Ok(primary_video("https://cdn.example/slow.mp4"))],
            vec![Ok(secondary_video("https://cdn.example/fast.mp4"))],
        )
        .with_delays(Duration::from_secs(30), Duration::from_millis(10));
        let fetcher = ContentFetcher::new(source.clone(), quick_config(FetchPolicy::Race));

        let reference = fetcher.fetch("https://vm.tiktok.com/x").await.unwrap();
        assert_eq!(reference.tier, Tier::Secondary);

        // Give the aborted primary task every chance to run if it were alive.
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(
            !source.primary_completed.load(Ordering::SeqCst),
            "losing primary task should have been cancelled mid-flight"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_race_primary_wins_within_grace() {
        let source = ScriptedSource::new(
            vec![Ok(primary_video("https://cdn.example/fast.mp4"))],
            vec![Ok(secondary_video("https://cdn.example/other.mp4"))],
        )
        .with_delays(Duration::from_millis(10), Duration::ZERO);
        let fetcher = ContentFetcher::new(source.clone(), quick_config(FetchPolicy::Race));

        let reference = fetcher.fetch("https://vm.tiktok.com/x").await.unwrap();
        assert_eq!(reference.tier, Tier::Primary);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(
            source.secondary_calls.load(Ordering::SeqCst),
            0,
            "secondary should be cancelled during its grace sleep"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_race_settles_on_loser_after_winner_fails() {
        let source = ScriptedSource::new(
            vec![Err(reject("a")), Err(reject("b")), Err(reject("c"))],
            vec![Ok(secondary_video("https://cdn.example/p.mp4"))],
        );
        let fetcher = ContentFetcher::new(source, quick_config(FetchPolicy::Race));

        let reference = fetcher.fetch("https://vm.tiktok.com/x").await.unwrap();
        assert_eq!(reference.tier, Tier::Secondary);
    }

    #[tokio::test(start_paused = true)]
    async fn test_race_with_fallback_disabled_runs_primary_only() {
        let source = ScriptedSource::new(
            vec![Ok(primary_video("https://cdn.example/v.mp4"))],
            vec![Ok(secondary_video("https://cdn.example/p.mp4"))],
        );
        let mut config = quick_config(FetchPolicy::Race);
        config.fallback_enabled = false;
        let fetcher = ContentFetcher::new(source.clone(), config);

        let reference = fetcher.fetch("https://vm.tiktok.com/x").await.unwrap();
        assert_eq!(reference.tier, Tier::Primary);
        assert_eq!(source.secondary_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_fetch_policy_parses_from_config_strings() {
        let sequential: FetchPolicy = serde_json::from_str("\"sequential\"").unwrap();
        let race: FetchPolicy = serde_json::from_str("\"race\"").unwrap();
        assert_eq!(sequential, FetchPolicy::Sequential);
        assert_eq!(race, FetchPolicy::Race);
        assert!(serde_json::from_str::<FetchPolicy>("\"both\"").is_err());
    }
}
