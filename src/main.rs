use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};

use clipferry::cli::{self, Cli, Command, ConfigCommand};
use clipferry::config::{self, Config};
use clipferry::extract::HttpExtractor;
use clipferry::fetch::{ContentFetcher, FetcherConfig, RetryPolicy};
use clipferry::governor::{slot_sweep_loop, GovernorConfig, ResourceGovernor};
use clipferry::logging::{init_logging, targets, LogConfig};
use clipferry::pipeline::{DeliveryOrchestrator, PipelineConfig};
use clipferry::telegram::receive::receive_loop;
use clipferry::telegram::{BotIdentity, Messenger, TelegramApi};
use clipferry::transfer::{orphan_sweep_loop, EngineConfig, MediaTransferEngine};

/// How long the long-poll task gets to notice shutdown before it is aborted.
const RECEIVE_DRAIN_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        // No subcommand or explicit `start` both run the bot.
        None | Some(Command::Start) => run_bot().await,

        Some(Command::Config(sub)) => {
            match sub {
                ConfigCommand::Show => cli::handle_config_show()?,
                ConfigCommand::Path => cli::handle_config_path(),
            }
            Ok(())
        }

        Some(Command::Version) => {
            cli::handle_version();
            Ok(())
        }
    }
}

/// Run the bot until a shutdown signal arrives.
async fn run_bot() -> Result<(), Box<dyn std::error::Error>> {
    init_logging_from_env()?;

    let config = Config::load()?;
    config.validate()?;
    let cookie = config.load_cookie();

    let governor = Arc::new(ResourceGovernor::new(governor_config(&config))?);
    let engine = Arc::new(MediaTransferEngine::new(
        governor.http().clone(),
        engine_config(&config),
        cookie,
    )?);
    let extractor = Arc::new(HttpExtractor::new(
        governor.http().clone(),
        config.extractor.base_url.clone(),
        config.extractor.attempt_timeout(),
    ));
    let fetcher = ContentFetcher::new(extractor, fetcher_config(&config));
    let api = Arc::new(TelegramApi::new(
        governor.http().clone(),
        config.telegram.api_base_url.clone(),
        config.telegram.bot_token.clone(),
        config.delivery.upload_timeout(),
    ));

    // Confirm the token against getMe before any loop starts.
    let identity = api.identity().await?;

    let orchestrator = Arc::new(DeliveryOrchestrator::new(
        governor.clone(),
        fetcher,
        engine.clone(),
        api.clone(),
        pipeline_config(&config),
    ));

    log_startup_banner(&config, &identity, engine.has_cookie());

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(slot_sweep_loop(governor.clone(), shutdown_rx.clone()));
    tokio::spawn(orphan_sweep_loop(engine.clone(), shutdown_rx.clone()));
    let mut receiver = tokio::spawn(receive_loop(
        config.telegram.api_base_url.clone(),
        config.telegram.bot_token.clone(),
        orchestrator,
        shutdown_rx,
    ));

    let reason = await_shutdown_trigger().await;
    info!(target: targets::BOT, "shutdown signal received ({reason})");
    let _ = shutdown_tx.send(true);

    // The receive task may be parked inside a long poll and only notices
    // shutdown between polls.
    if tokio::time::timeout(RECEIVE_DRAIN_GRACE, &mut receiver)
        .await
        .is_err()
    {
        receiver.abort();
    }

    info!(target: targets::BOT, "bot stopped");
    Ok(())
}

/// Initialize logging based on the CLIPFERRY_DEV environment variable.
fn init_logging_from_env() -> Result<(), Box<dyn std::error::Error>> {
    let log_config = if config::dev_mode() {
        LogConfig::development()
    } else {
        LogConfig::production()
    };
    init_logging(log_config)?;
    Ok(())
}

fn governor_config(config: &Config) -> GovernorConfig {
    GovernorConfig {
        user_slots: config.governor.user_slots,
        download_slots: config.governor.download_slots,
        upload_slots: config.governor.upload_slots,
        slot_stale_after: config.governor.slot_stale_after(),
        sweep_interval: config.governor.sweep_interval(),
        connect_timeout: config.governor.connect_timeout(),
    }
}

fn engine_config(config: &Config) -> EngineConfig {
    EngineConfig {
        media_dir: config.transfer.media_dir.clone(),
        retry: RetryPolicy {
            attempts: config.transfer.attempts,
            backoff_base: config.transfer.backoff_base(),
            backoff_cap: config.transfer.backoff_cap(),
        },
        timeout: config.transfer.timeout(),
        min_payload_bytes: config.transfer.min_payload_bytes,
        max_payload_bytes: config.transfer.max_payload_bytes,
        orphan_ttl: config.transfer.orphan_ttl(),
        orphan_sweep_interval: config.transfer.orphan_sweep_interval(),
    }
}

fn fetcher_config(config: &Config) -> FetcherConfig {
    FetcherConfig {
        primary: RetryPolicy {
            attempts: config.fetch.primary_attempts,
            backoff_base: config.fetch.backoff_base(),
            backoff_cap: config.fetch.backoff_cap(),
        },
        secondary: RetryPolicy {
            attempts: config.fetch.secondary_attempts,
            backoff_base: config.fetch.backoff_base(),
            backoff_cap: config.fetch.backoff_cap(),
        },
        fallback_enabled: config.fetch.fallback_enabled,
        policy: config.fetch.policy,
        race_grace: config.fetch.race_grace(),
    }
}

fn pipeline_config(config: &Config) -> PipelineConfig {
    PipelineConfig {
        transfer_mode: config.transfer.mode,
        min_payload_bytes: config.transfer.min_payload_bytes,
        auto_delete_trigger: config.delivery.auto_delete_trigger,
        trigger_delete_delay: config.delivery.trigger_delete_delay(),
    }
}

/// Log the startup banner with version, identity, and the key knobs.
fn log_startup_banner(config: &Config, identity: &BotIdentity, cookie_loaded: bool) {
    info!(target: targets::BOT, "clipferry v{}", env!("CARGO_PKG_VERSION"));
    info!(
        target: targets::BOT,
        bot_id = identity.id,
        username = %identity.username,
        "telegram identity confirmed"
    );
    info!(
        target: targets::BOT,
        mode = %config.transfer.mode,
        media_dir = %config.transfer.media_dir.display(),
        "transfer engine ready"
    );
    info!(
        target: targets::BOT,
        users = config.governor.user_slots,
        downloads = config.governor.download_slots,
        uploads = config.governor.upload_slots,
        "concurrency ceilings"
    );
    if cookie_loaded {
        info!(target: targets::BOT, "session cookie loaded for credentialed retries");
    }
}

/// Wait for either Ctrl+C or SIGTERM (Unix only) and return a label for logging.
#[cfg(unix)]
async fn await_shutdown_trigger() -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => "ctrl-c",
                _ = sigterm.recv() => "SIGTERM",
            }
        }
        Err(e) => {
            warn!(
                target: targets::BOT,
                "failed to install SIGTERM handler: {e}; falling back to Ctrl+C only"
            );
            match tokio::signal::ctrl_c().await {
                Ok(()) => "ctrl-c",
                Err(e) => {
                    panic!("failed to install Ctrl+C handler: {e}");
                }
            }
        }
    }
}

/// On non-Unix platforms, only Ctrl+C is available.
#[cfg(not(unix))]
async fn await_shutdown_trigger() -> &'static str {
    match tokio::signal::ctrl_c().await {
        Ok(()) => "ctrl-c",
        Err(e) => {
            panic!("failed to install Ctrl+C handler: {e}");
        }
    }
}
