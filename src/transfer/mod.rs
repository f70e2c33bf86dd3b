//! Media transfer engine
//!
//! Downloads media payloads from CDN URLs under a retry budget, producing
//! the payload in one of three shapes: an on-disk temp file, an in-memory
//! buffer, or a live byte stream. Enforces both the minimum-payload
//! heuristic (tiny responses are error pages, not media) and the hard size
//! ceiling, and escalates to a credentialed request when an anonymous
//! download is rejected.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::fetch::RetryPolicy;
use crate::logging::targets;

/// Referer sent with media downloads; CDN hosts reject requests without one.
const MEDIA_REFERER: &str = "https://www.tiktok.com/";

/// How a downloaded payload is held between download and upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferMode {
    /// Write to a temp file in the media dir.
    #[default]
    File,
    /// Hand the live byte stream straight through.
    Stream,
    /// Hold the whole payload in memory.
    Buffer,
}

impl fmt::Display for TransferMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferMode::File => f.write_str("file"),
            TransferMode::Stream => f.write_str("stream"),
            TransferMode::Buffer => f.write_str("buffer"),
        }
    }
}

/// Transfer errors
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("download timed out")]
    Timeout,

    #[error("failed to connect to media host: {0}")]
    Connect(String),

    #[error("download failed: {0}")]
    Network(String),

    #[error("media host returned HTTP {status}")]
    Http { status: u16 },

    #[error("temp file I/O failed: {0}")]
    Io(String),

    #[error("payload too small: {size} bytes (minimum {min})")]
    PayloadTooSmall { size: u64, min: u64 },

    #[error("payload too large: {size} bytes (maximum {max})")]
    PayloadTooLarge { size: u64, max: u64 },

    #[error("download failed after {attempts} attempts: {last}")]
    Exhausted {
        attempts: u32,
        last: Box<TransferError>,
    },
}

impl TransferError {
    /// Whether a credentialed retry might change the outcome: the host
    /// either rejected us outright or refused the connection.
    pub fn suggests_credentials(&self) -> bool {
        matches!(
            self,
            TransferError::Http {
                status: 401 | 403
            } | TransferError::Connect(_)
        )
    }

    /// Errors that retrying cannot fix.
    pub fn is_fatal(&self) -> bool {
        matches!(self, TransferError::PayloadTooLarge { .. })
    }

    /// Innermost cause, unwrapping exhaustion wrappers.
    pub fn root(&self) -> &TransferError {
        match self {
            TransferError::Exhausted { last, .. } => last.root(),
            other => other,
        }
    }
}

/// Temp file holding a downloaded payload.
///
/// `cleanup` is idempotent and tolerates the file already being gone. A
/// drop backstop removes the file if nobody cleaned up explicitly.
#[derive(Debug)]
pub struct TempFile {
    path: PathBuf,
    cleaned: bool,
}

impl TempFile {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            cleaned: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the backing file. Safe to call any number of times.
    pub async fn cleanup(&mut self) {
        if self.cleaned {
            return;
        }
        self.cleaned = true;
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {
                debug!(target: targets::TRANSFER, path = %self.path.display(), "temp file removed")
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(target: targets::TRANSFER, path = %self.path.display(), error = %e, "failed to remove temp file")
            }
        }
    }
}

impl Drop for TempFile {
    fn drop(&mut self) {
        if !self.cleaned {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

/// Live download stream.
///
/// Consumable exactly once; a delivery retry must request the URL again
/// rather than rewind.
pub struct ByteStream {
    inner: BoxStream<'static, reqwest::Result<Bytes>>,
    declared_len: Option<u64>,
}

impl ByteStream {
    /// Content length announced by the host, when it announced one.
    pub fn declared_len(&self) -> Option<u64> {
        self.declared_len
    }

    /// Adapt into an upload request body, consuming the stream.
    pub fn into_body(self) -> reqwest::Body {
        reqwest::Body::wrap_stream(self.inner)
    }
}

impl fmt::Debug for ByteStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ByteStream")
            .field("declared_len", &self.declared_len)
            .finish_non_exhaustive()
    }
}

/// Downloaded payload in the shape the configured mode produced.
#[derive(Debug)]
pub enum TransferPayload {
    File(TempFile),
    Buffer(Bytes),
    Stream(ByteStream),
}

/// Outcome of a successful transfer.
#[derive(Debug)]
pub struct TransferResult {
    pub payload: TransferPayload,
    /// Total size when known; stream mode without a content-length reports
    /// `None`.
    pub byte_size: Option<u64>,
    pub mime_type: Option<String>,
}

/// Engine tuning.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Directory for file-mode temp files.
    pub media_dir: PathBuf,
    pub retry: RetryPolicy,
    /// Whole-attempt timeout, covering connect through last body byte.
    pub timeout: Duration,
    /// Payloads below this are treated as error pages.
    pub min_payload_bytes: u64,
    /// Hard ceiling; larger payloads are aborted mid-download.
    pub max_payload_bytes: u64,
    /// Age after which a leftover temp file counts as orphaned.
    pub orphan_ttl: Duration,
    pub orphan_sweep_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            media_dir: std::env::temp_dir().join("clipferry-media"),
            retry: RetryPolicy {
                attempts: 3,
                backoff_base: Duration::from_millis(750),
                backoff_cap: Duration::from_secs(15),
            },
            timeout: Duration::from_secs(60),
            min_payload_bytes: 1024,
            max_payload_bytes: 50 * 1024 * 1024,
            orphan_ttl: Duration::from_secs(3600),
            orphan_sweep_interval: Duration::from_secs(300),
        }
    }
}

/// Downloads media payloads over the shared HTTP client.
pub struct MediaTransferEngine {
    client: reqwest::Client,
    config: EngineConfig,
    cookie: Option<String>,
}

impl MediaTransferEngine {
    /// Build the engine, creating the media directory if needed.
    pub fn new(
        client: reqwest::Client,
        config: EngineConfig,
        cookie: Option<String>,
    ) -> Result<Self, TransferError> {
        std::fs::create_dir_all(&config.media_dir).map_err(|e| {
            TransferError::Io(format!(
                "failed to create media dir {}: {e}",
                config.media_dir.display()
            ))
        })?;

        Ok(Self {
            client,
            config,
            cookie,
        })
    }

    pub fn has_cookie(&self) -> bool {
        self.cookie.is_some()
    }

    /// Download one media URL under the retry budget.
    ///
    /// An access rejection (401/403) or connection refusal escalates the
    /// remaining attempts to include the session cookie, when one is
    /// loaded; the escalation never reverses within a call.
    pub async fn transfer(
        &self,
        url: &str,
        mode: TransferMode,
    ) -> Result<TransferResult, TransferError> {
        let mut with_cookie = false;
        let mut last: Option<TransferError> = None;

        for attempt in 0..self.config.retry.attempts {
            if attempt > 0 {
                tokio::time::sleep(self.config.retry.delay_for(attempt - 1)).await;
            }

            match self.attempt(url, mode, with_cookie).await {
                Ok(result) => {
                    debug!(
                        target: targets::TRANSFER,
                        url,
                        mode = %mode,
                        attempt = attempt + 1,
                        size = ?result.byte_size,
                        with_cookie,
                        "media transfer complete"
                    );
                    return Ok(result);
                }
                Err(err) => {
                    if err.is_fatal() {
                        warn!(target: targets::TRANSFER, url, error = %err, "download aborted");
                        return Err(err);
                    }
                    if !with_cookie && self.cookie.is_some() && err.suggests_credentials() {
                        info!(
                            target: targets::TRANSFER,
                            url,
                            "escalating to credentialed download after access failure"
                        );
                        with_cookie = true;
                    }
                    warn!(
                        target: targets::TRANSFER,
                        url,
                        attempt = attempt + 1,
                        budget = self.config.retry.attempts,
                        error = %err,
                        "download attempt failed"
                    );
                    last = Some(err);
                }
            }
        }

        Err(TransferError::Exhausted {
            attempts: self.config.retry.attempts,
            last: Box::new(
                last.unwrap_or_else(|| TransferError::Network("no attempts configured".to_string())),
            ),
        })
    }

    async fn attempt(
        &self,
        url: &str,
        mode: TransferMode,
        with_cookie: bool,
    ) -> Result<TransferResult, TransferError> {
        let mut request = self
            .client
            .get(url)
            .timeout(self.config.timeout)
            .header(reqwest::header::REFERER, MEDIA_REFERER);
        if with_cookie {
            if let Some(cookie) = &self.cookie {
                request = request.header(reqwest::header::COOKIE, cookie.as_str());
            }
        }

        let response = request.send().await.map_err(request_error)?;
        let status = response.status();
        if !status.is_success() {
            return Err(TransferError::Http {
                status: status.as_u16(),
            });
        }

        // Reject oversized payloads before moving any bytes.
        let declared = response.content_length();
        if let Some(size) = declared {
            if size > self.config.max_payload_bytes {
                return Err(TransferError::PayloadTooLarge {
                    size,
                    max: self.config.max_payload_bytes,
                });
            }
        }

        let mime_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        match mode {
            TransferMode::Stream => {
                if let Some(size) = declared {
                    if size < self.config.min_payload_bytes {
                        return Err(TransferError::PayloadTooSmall {
                            size,
                            min: self.config.min_payload_bytes,
                        });
                    }
                }
                // An unknown length cannot be validated without consuming
                // the stream; the declared-size check is all stream mode gets.
                use futures_util::StreamExt;
                Ok(TransferResult {
                    payload: TransferPayload::Stream(ByteStream {
                        inner: response.bytes_stream().boxed(),
                        declared_len: declared,
                    }),
                    byte_size: declared,
                    mime_type,
                })
            }
            TransferMode::Buffer => {
                let bytes = self.read_body_bounded(response).await?;
                let size = bytes.len() as u64;
                self.check_min(size)?;
                Ok(TransferResult {
                    payload: TransferPayload::Buffer(bytes),
                    byte_size: Some(size),
                    mime_type,
                })
            }
            TransferMode::File => {
                let (file, size) = self.stream_to_file(response, mime_type.as_deref()).await?;
                Ok(TransferResult {
                    payload: TransferPayload::File(file),
                    byte_size: Some(size),
                    mime_type,
                })
            }
        }
    }

    fn check_min(&self, size: u64) -> Result<(), TransferError> {
        if size < self.config.min_payload_bytes {
            return Err(TransferError::PayloadTooSmall {
                size,
                min: self.config.min_payload_bytes,
            });
        }
        Ok(())
    }

    /// Read the response body into memory with a streaming size limit.
    async fn read_body_bounded(&self, response: reqwest::Response) -> Result<Bytes, TransferError> {
        use futures_util::StreamExt;

        let max = self.config.max_payload_bytes;
        let hint = response.content_length().unwrap_or(0).min(max) as usize;
        let mut body: Vec<u8> = Vec::with_capacity(hint);
        let mut stream = response.bytes_stream();

        while let Some(chunk_result) = stream.next().await {
            let chunk = chunk_result.map_err(request_error)?;

            let new_size = body.len() as u64 + chunk.len() as u64;
            if new_size > max {
                return Err(TransferError::PayloadTooLarge {
                    size: new_size,
                    max,
                });
            }

            body.extend_from_slice(&chunk);
        }

        Ok(Bytes::from(body))
    }

    /// Stream the response body to a fresh temp file.
    ///
    /// Every failure path removes the partial file before returning.
    async fn stream_to_file(
        &self,
        response: reqwest::Response,
        mime_type: Option<&str>,
    ) -> Result<(TempFile, u64), TransferError> {
        use futures_util::StreamExt;

        let filename = format!("{}{}", Uuid::new_v4(), extension_for_mime(mime_type));
        let path = self.config.media_dir.join(filename);

        let mut file = tokio::fs::File::create(&path).await.map_err(|e| {
            TransferError::Io(format!("failed to create {}: {e}", path.display()))
        })?;

        let mut written: u64 = 0;
        let mut stream = response.bytes_stream();

        while let Some(chunk_result) = stream.next().await {
            let chunk = match chunk_result {
                Ok(chunk) => chunk,
                Err(e) => {
                    drop(file);
                    remove_partial(&path).await;
                    return Err(request_error(e));
                }
            };

            written += chunk.len() as u64;
            if written > self.config.max_payload_bytes {
                drop(file);
                remove_partial(&path).await;
                return Err(TransferError::PayloadTooLarge {
                    size: written,
                    max: self.config.max_payload_bytes,
                });
            }

            if let Err(e) = file.write_all(&chunk).await {
                drop(file);
                remove_partial(&path).await;
                return Err(TransferError::Io(format!(
                    "failed to write {}: {e}",
                    path.display()
                )));
            }
        }

        if let Err(e) = file.shutdown().await {
            drop(file);
            remove_partial(&path).await;
            return Err(TransferError::Io(format!(
                "failed to flush {}: {e}",
                path.display()
            )));
        }
        drop(file);

        // An undersized file is an error page, not media.
        if written < self.config.min_payload_bytes {
            remove_partial(&path).await;
            return Err(TransferError::PayloadTooSmall {
                size: written,
                min: self.config.min_payload_bytes,
            });
        }

        Ok((TempFile::new(path), written))
    }

    /// Remove temp files older than the orphan TTL.
    ///
    /// Normal runs clean up behind themselves; this only catches files left
    /// behind by crashes. Returns the number removed.
    pub async fn sweep_orphans(&self) -> usize {
        let mut entries = match tokio::fs::read_dir(&self.config.media_dir).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(target: targets::TRANSFER, dir = %self.config.media_dir.display(), error = %e, "orphan sweep cannot read media dir");
                return 0;
            }
        };

        let mut removed = 0usize;
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    warn!(target: targets::TRANSFER, error = %e, "orphan sweep read error");
                    break;
                }
            };

            let path = entry.path();
            let Ok(metadata) = entry.metadata().await else {
                continue;
            };
            if !metadata.is_file() {
                continue;
            }

            let age = metadata.modified().ok().and_then(|m| m.elapsed().ok());
            if matches!(age, Some(age) if age >= self.config.orphan_ttl) {
                match tokio::fs::remove_file(&path).await {
                    Ok(()) => {
                        removed += 1;
                        debug!(target: targets::TRANSFER, path = %path.display(), "orphaned temp file removed");
                    }
                    Err(e) => {
                        warn!(target: targets::TRANSFER, path = %path.display(), error = %e, "failed to remove orphaned temp file");
                    }
                }
            }
        }

        if removed > 0 {
            info!(target: targets::TRANSFER, removed, "orphaned temp files swept");
        }
        removed
    }
}

async fn remove_partial(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(target: targets::TRANSFER, path = %path.display(), error = %e, "failed to remove partial download");
        }
    }
}

fn request_error(e: reqwest::Error) -> TransferError {
    if e.is_timeout() {
        TransferError::Timeout
    } else if e.is_connect() {
        TransferError::Connect(e.to_string())
    } else {
        TransferError::Network(e.to_string())
    }
}

/// Convert a MIME type to a file extension for temp and upload names.
pub(crate) fn extension_for_mime(mime_type: Option<&str>) -> &'static str {
    match mime_type {
        Some(mime) => {
            // Extract the subtype and drop any parameters
            let subtype = mime.split('/').nth(1).unwrap_or("");
            let subtype = subtype.split(';').next().unwrap_or("").trim();

            match subtype {
                "mp4" => ".mp4",
                "webm" => ".webm",
                "quicktime" => ".mov",
                "jpeg" | "jpg" => ".jpg",
                "png" => ".png",
                "webp" => ".webp",
                "gif" => ".gif",
                _ => ".bin",
            }
        }
        None => ".bin",
    }
}

/// Run the periodic orphan temp-file sweep.
///
/// Stops when a shutdown signal is received.
pub async fn orphan_sweep_loop(
    engine: Arc<MediaTransferEngine>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(engine.config.orphan_sweep_interval);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => break,
        }

        if *shutdown.borrow() {
            break;
        }

        engine.sweep_orphans().await;
    }
}
