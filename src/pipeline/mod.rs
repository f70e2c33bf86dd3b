//! Delivery pipeline.
//!
//! One job per link: resolve metadata through the tiered extractor,
//! download the media under governor permits, deliver it to the chat with
//! a caption, and clean up afterwards. Cleanup (temp files, status
//! message, user slot) runs on every exit path, including failures raised
//! by the messaging client itself.

pub mod caption;

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::future::join_all;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::extract::{ContentKind, ContentReference, ExtractError};
use crate::fetch::{ContentFetcher, FetchError};
use crate::governor::ResourceGovernor;
use crate::logging::targets;
use crate::telegram::{ChatKind, MediaUpload, MessageRef, Messenger, PhotoBlob, SendError};
use crate::transfer::{
    MediaTransferEngine, TransferError, TransferMode, TransferPayload, TransferResult,
};

/// Progress stages a job moves through, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Queued,
    SlotAcquired,
    Fetching,
    Transferring,
    Validating,
    Delivering,
    Cleaning,
    Done,
    Errored,
}

impl Stage {
    /// Short status text shown in the chat while the job runs.
    fn status_text(self) -> &'static str {
        match self {
            Stage::Queued => "queued...",
            Stage::SlotAcquired => "starting...",
            Stage::Fetching => "fetching the link...",
            Stage::Transferring => "downloading media...",
            Stage::Validating => "checking media...",
            Stage::Delivering => "uploading to chat...",
            Stage::Cleaning => "finishing up...",
            Stage::Done => "done",
            Stage::Errored => "failed",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Queued => "queued",
            Stage::SlotAcquired => "slot_acquired",
            Stage::Fetching => "fetching",
            Stage::Transferring => "transferring",
            Stage::Validating => "validating",
            Stage::Delivering => "delivering",
            Stage::Cleaning => "cleaning",
            Stage::Done => "done",
            Stage::Errored => "errored",
        };
        f.write_str(name)
    }
}

/// Why a delivery job failed.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error("all {total} slideshow images failed to download")]
    AllImagesFailed { total: usize },

    #[error("delivery failed: {0}")]
    Delivery(#[from] SendError),
}

/// One link to resolve and deliver.
#[derive(Debug, Clone)]
pub struct LinkRequest {
    pub url: String,
    pub chat_id: i64,
    pub user_id: i64,
    /// The message that contained the link.
    pub trigger: MessageRef,
    pub chat_kind: ChatKind,
}

/// Orchestrator tuning.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub transfer_mode: TransferMode,
    /// Re-checked after download; the engine enforces it during transfer.
    pub min_payload_bytes: u64,
    /// Delete the triggering message in groups after a successful delivery.
    pub auto_delete_trigger: bool,
    pub trigger_delete_delay: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            transfer_mode: TransferMode::File,
            min_payload_bytes: 1024,
            auto_delete_trigger: true,
            trigger_delete_delay: Duration::from_secs(30),
        }
    }
}

/// Where a degradation retry gets its upload payload from.
enum UploadSource {
    Path(PathBuf),
    Bytes { name: String, data: Bytes },
    /// The original stream was consumed; retries re-open the URL.
    Remote { name: String, locator: String },
}

/// Drives the per-link state machine.
pub struct DeliveryOrchestrator {
    governor: Arc<ResourceGovernor>,
    fetcher: ContentFetcher,
    engine: Arc<MediaTransferEngine>,
    messenger: Arc<dyn Messenger>,
    config: PipelineConfig,
}

impl DeliveryOrchestrator {
    pub fn new(
        governor: Arc<ResourceGovernor>,
        fetcher: ContentFetcher,
        engine: Arc<MediaTransferEngine>,
        messenger: Arc<dyn Messenger>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            governor,
            fetcher,
            engine,
            messenger,
            config,
        }
    }

    /// Run one link to completion.
    ///
    /// Never propagates an error to the caller: every failure path reports
    /// to the chat and performs the same cleanup as success.
    pub async fn handle_link(&self, request: LinkRequest) {
        let user_key = request.user_id.to_string();
        info!(
            target: targets::PIPELINE,
            url = %request.url,
            chat_id = request.chat_id,
            user = %user_key,
            "delivery job started"
        );

        log_stage(Stage::Queued, &request.url);
        self.governor.acquire_user_slot(&user_key).await;
        log_stage(Stage::SlotAcquired, &request.url);

        // Transient progress message; purely best-effort.
        let status = match self
            .messenger
            .send_text(request.chat_id, Stage::Fetching.status_text())
            .await
        {
            Ok(message) => Some(message),
            Err(err) => {
                debug!(target: targets::PIPELINE, error = %err, "status message send failed");
                None
            }
        };

        let outcome = self.run_stages(&request, status.as_ref()).await;

        log_stage(Stage::Cleaning, &request.url);
        if let Some(status) = status {
            if let Err(err) = self.messenger.delete_message(status).await {
                debug!(target: targets::PIPELINE, error = %err, "status message delete failed");
            }
        }
        self.governor.release_user_slot(&user_key);

        match outcome {
            Ok(()) => {
                log_stage(Stage::Done, &request.url);
                info!(target: targets::PIPELINE, url = %request.url, "delivery job complete");
                self.maybe_delete_trigger(&request).await;
            }
            Err(err) => {
                log_stage(Stage::Errored, &request.url);
                warn!(target: targets::PIPELINE, url = %request.url, error = %err, "delivery job failed");
                // Exactly one reply per failed link.
                let text = user_message(&err);
                if let Err(send_err) = self.messenger.send_text(request.chat_id, &text).await {
                    warn!(target: targets::PIPELINE, error = %send_err, "failure notice could not be sent");
                }
            }
        }
    }

    async fn run_stages(
        &self,
        request: &LinkRequest,
        status: Option<&MessageRef>,
    ) -> Result<(), PipelineError> {
        log_stage(Stage::Fetching, &request.url);
        let reference = self.fetcher.fetch(&request.url).await?;

        info!(
            target: targets::PIPELINE,
            media_id = %reference.media_id,
            kind = ?reference.kind,
            tier = %reference.tier,
            locators = reference.media_locators.len(),
            "content resolved"
        );

        match reference.kind {
            ContentKind::Video => self.deliver_video(request, status, &reference).await,
            ContentKind::ImageSet => self.deliver_images(request, status, &reference).await,
        }
    }

    async fn deliver_video(
        &self,
        request: &LinkRequest,
        status: Option<&MessageRef>,
        reference: &ContentReference,
    ) -> Result<(), PipelineError> {
        let locator = reference.best_locator();
        if locator.is_empty() {
            return Err(PipelineError::Transfer(TransferError::Network(
                "resolved content carries no media locator".to_string(),
            )));
        }

        self.update_status(status, Stage::Transferring).await;
        let result = {
            let _permit = self.governor.acquire_download_slot().await;
            self.engine
                .transfer(locator, self.config.transfer_mode)
                .await?
        };

        self.update_status(status, Stage::Validating).await;
        if let Err(err) = self.validate_size(&result) {
            discard_payload(result.payload).await;
            return Err(err);
        }

        self.update_status(status, Stage::Delivering).await;
        let TransferResult {
            payload,
            byte_size,
            mime_type,
        } = result;
        let caption = caption::build(reference, &request.url, byte_size);

        let mut tempfile = None;
        let (first_upload, source) = match payload {
            TransferPayload::File(tmp) => {
                let path = tmp.path().to_path_buf();
                tempfile = Some(tmp);
                (MediaUpload::File(path.clone()), UploadSource::Path(path))
            }
            TransferPayload::Buffer(data) => {
                let name = video_file_name(mime_type.as_deref());
                (
                    MediaUpload::Bytes {
                        name: name.clone(),
                        data: data.clone(),
                    },
                    UploadSource::Bytes { name, data },
                )
            }
            TransferPayload::Stream(stream) => {
                let name = video_file_name(mime_type.as_deref());
                (
                    MediaUpload::Stream {
                        name: name.clone(),
                        stream,
                    },
                    UploadSource::Remote {
                        name,
                        locator: locator.to_string(),
                    },
                )
            }
        };

        let outcome = {
            let _permit = self.governor.acquire_upload_slot().await;
            self.send_video_degrading(request.chat_id, first_upload, &source, &caption)
                .await
        };

        // The temp artifact goes away on success and failure alike.
        if let Some(mut tmp) = tempfile {
            tmp.cleanup().await;
        }

        outcome
    }

    async fn deliver_images(
        &self,
        request: &LinkRequest,
        status: Option<&MessageRef>,
        reference: &ContentReference,
    ) -> Result<(), PipelineError> {
        let total = reference.media_locators.len();
        self.update_status(status, Stage::Transferring).await;

        // All images download concurrently, each under its own permit, so
        // a slideshow cannot monopolize the download pool.
        let downloads = reference.media_locators.iter().map(|url| async move {
            let _permit = self.governor.acquire_download_slot().await;
            self.engine.transfer(url, TransferMode::Buffer).await
        });
        let results = join_all(downloads).await;

        self.update_status(status, Stage::Validating).await;
        let mut photos = Vec::with_capacity(total);
        let mut failed = 0usize;
        for (index, result) in results.into_iter().enumerate() {
            match result {
                Ok(result) => match result.payload {
                    TransferPayload::Buffer(data) => photos.push(PhotoBlob {
                        name: photo_name(index, result.mime_type.as_deref()),
                        data,
                    }),
                    // Buffer mode only produces buffers.
                    _ => failed += 1,
                },
                Err(err) => {
                    warn!(
                        target: targets::PIPELINE,
                        image = index + 1,
                        total,
                        error = %err,
                        "image transfer failed"
                    );
                    failed += 1;
                }
            }
        }

        if photos.is_empty() {
            return Err(PipelineError::AllImagesFailed { total });
        }

        self.update_status(status, Stage::Delivering).await;
        let delivered_bytes: u64 = photos.iter().map(|p| p.data.len() as u64).sum();
        let caption = caption::build(reference, &request.url, Some(delivered_bytes));
        {
            let _permit = self.governor.acquire_upload_slot().await;
            self.send_album_degrading(request.chat_id, &photos, &caption)
                .await?;
        }

        if failed > 0 {
            // Exactly one shortfall notice for the whole set.
            let notice = format!("{failed} of {total} images failed to download");
            if let Err(err) = self.messenger.send_text(request.chat_id, &notice).await {
                debug!(target: targets::PIPELINE, error = %err, "shortfall notice send failed");
            }
        }

        Ok(())
    }

    /// Caption degradation ladder for a video payload: rich HTML caption,
    /// then bare media with the caption as separate text, then bare media
    /// alone. Later stages run only after a send error.
    async fn send_video_degrading(
        &self,
        chat_id: i64,
        first_upload: MediaUpload,
        source: &UploadSource,
        caption: &caption::Caption,
    ) -> Result<(), PipelineError> {
        let rich_err = match self
            .messenger
            .send_video(chat_id, first_upload, Some(&caption.html), true)
            .await
        {
            Ok(_) => return Ok(()),
            Err(err) => err,
        };
        debug!(target: targets::PIPELINE, error = %rich_err, "rich delivery failed, degrading to plain");

        let upload = self.rebuild_upload(source).await?;
        match self.messenger.send_video(chat_id, upload, None, false).await {
            Ok(_) => {
                // The separate caption is a nicety, not part of delivery.
                if let Err(err) = self.messenger.send_text(chat_id, &caption.plain).await {
                    debug!(target: targets::PIPELINE, error = %err, "separate caption send failed");
                }
                return Ok(());
            }
            Err(err) => {
                debug!(target: targets::PIPELINE, error = %err, "plain delivery failed, degrading to bare");
            }
        }

        let upload = self.rebuild_upload(source).await?;
        self.messenger
            .send_video(chat_id, upload, None, false)
            .await
            .map_err(PipelineError::Delivery)?;
        Ok(())
    }

    /// Degradation ladder for an album, same shape as the video ladder.
    async fn send_album_degrading(
        &self,
        chat_id: i64,
        photos: &[PhotoBlob],
        caption: &caption::Caption,
    ) -> Result<(), PipelineError> {
        let rich_err = match self
            .messenger
            .send_photo_album(chat_id, photos, Some(&caption.html), true)
            .await
        {
            Ok(_) => return Ok(()),
            Err(err) => err,
        };
        debug!(target: targets::PIPELINE, error = %rich_err, "rich album delivery failed, degrading to plain");

        match self
            .messenger
            .send_photo_album(chat_id, photos, None, false)
            .await
        {
            Ok(_) => {
                if let Err(err) = self.messenger.send_text(chat_id, &caption.plain).await {
                    debug!(target: targets::PIPELINE, error = %err, "separate caption send failed");
                }
                return Ok(());
            }
            Err(err) => {
                debug!(target: targets::PIPELINE, error = %err, "plain album delivery failed, degrading to bare");
            }
        }

        self.messenger
            .send_photo_album(chat_id, photos, None, false)
            .await
            .map_err(PipelineError::Delivery)?;
        Ok(())
    }

    /// Produce a fresh upload for a degradation retry.
    async fn rebuild_upload(&self, source: &UploadSource) -> Result<MediaUpload, PipelineError> {
        match source {
            UploadSource::Path(path) => Ok(MediaUpload::File(path.clone())),
            UploadSource::Bytes { name, data } => Ok(MediaUpload::Bytes {
                name: name.clone(),
                data: data.clone(),
            }),
            UploadSource::Remote { name, locator } => {
                // A consumed stream cannot rewind; take a fresh one.
                let result = self.engine.transfer(locator, TransferMode::Stream).await?;
                match result.payload {
                    TransferPayload::Stream(stream) => Ok(MediaUpload::Stream {
                        name: name.clone(),
                        stream,
                    }),
                    _ => Err(PipelineError::Transfer(TransferError::Network(
                        "stream re-open returned an unexpected payload".to_string(),
                    ))),
                }
            }
        }
    }

    /// Re-check the plausibility floor before upload; a tiny payload here
    /// is an error page, not media.
    fn validate_size(&self, result: &TransferResult) -> Result<(), PipelineError> {
        if let Some(size) = result.byte_size {
            if size < self.config.min_payload_bytes {
                return Err(PipelineError::Transfer(TransferError::PayloadTooSmall {
                    size,
                    min: self.config.min_payload_bytes,
                }));
            }
        }
        Ok(())
    }

    /// Best-effort status edit; a failure never fails the job.
    async fn update_status(&self, status: Option<&MessageRef>, stage: Stage) {
        log_stage(stage, "");
        let Some(message) = status else {
            return;
        };
        if let Err(err) = self.messenger.edit_text(*message, stage.status_text()).await {
            debug!(target: targets::PIPELINE, stage = %stage, error = %err, "status edit failed");
        }
    }

    /// After a successful group delivery, schedule deletion of the message
    /// that contained the link. Missing rights merely disable the step.
    async fn maybe_delete_trigger(&self, request: &LinkRequest) {
        if !self.config.auto_delete_trigger || !request.chat_kind.is_group() {
            return;
        }
        if !self.messenger.can_delete_messages(request.chat_id).await {
            debug!(
                target: targets::PIPELINE,
                chat_id = request.chat_id,
                "no deletion rights, keeping trigger message"
            );
            return;
        }

        let messenger = Arc::clone(&self.messenger);
        let trigger = request.trigger;
        let delay = self.config.trigger_delete_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(err) = messenger.delete_message(trigger).await {
                debug!(target: targets::PIPELINE, error = %err, "trigger message delete failed");
            }
        });
    }
}

fn log_stage(stage: Stage, url: &str) {
    if url.is_empty() {
        debug!(target: targets::PIPELINE, stage = %stage, "stage entered");
    } else {
        debug!(target: targets::PIPELINE, stage = %stage, url, "stage entered");
    }
}

async fn discard_payload(payload: TransferPayload) {
    if let TransferPayload::File(mut tmp) = payload {
        tmp.cleanup().await;
    }
    // Buffer and stream payloads clean up by being dropped.
}

fn video_file_name(mime_type: Option<&str>) -> String {
    format!("video{}", crate::transfer::extension_for_mime(mime_type))
}

/// Album slot name for the image at `index`, extension from the mime type
/// the host actually served.
fn photo_name(index: usize, mime_type: Option<&str>) -> String {
    format!(
        "photo_{:02}{}",
        index + 1,
        crate::transfer::extension_for_mime(mime_type)
    )
}

/// Translate an internal failure into the single reply the user sees.
fn user_message(err: &PipelineError) -> String {
    match err {
        PipelineError::Fetch(fetch) => categorize_extract(&fetch.last),
        PipelineError::Transfer(transfer) => categorize_transfer(transfer.root()),
        PipelineError::AllImagesFailed { total } => format!(
            "none of the {total} slideshow images could be downloaded, please try again later"
        ),
        PipelineError::Delivery(send) => {
            format!("the media was fetched but could not be delivered: {send}")
        }
    }
}

fn categorize_extract(err: &ExtractError) -> String {
    match err {
        ExtractError::Connect(_) => {
            "the extraction service is unreachable, please try again later".to_string()
        }
        ExtractError::Timeout => {
            "the request timed out, the video may be too large or the connection too slow"
                .to_string()
        }
        ExtractError::Http { status: 401 | 403 } => {
            "this content looks private or region-blocked".to_string()
        }
        ExtractError::Http { status: 404 } => "this link looks expired or deleted".to_string(),
        ExtractError::Rejected { message } if looks_access_denied(message) => {
            "this content looks private or region-blocked".to_string()
        }
        ExtractError::Rejected { message } if looks_not_found(message) => {
            "this link looks expired or deleted".to_string()
        }
        other => format!("could not fetch this link: {other}"),
    }
}

fn categorize_transfer(err: &TransferError) -> String {
    match err {
        TransferError::Connect(_) => {
            "the media host refused the connection, please try again later".to_string()
        }
        TransferError::Timeout => {
            "the download timed out, the video may be too large or the connection too slow"
                .to_string()
        }
        TransferError::Http { status: 401 | 403 } => {
            "this content looks private or region-blocked".to_string()
        }
        TransferError::Http { status: 404 } => "this link looks expired or deleted".to_string(),
        TransferError::PayloadTooSmall { .. } => {
            "the host returned something that does not look like real media, the link may be expired"
                .to_string()
        }
        TransferError::PayloadTooLarge { size, max } => {
            format!("this video is too large to deliver ({size} bytes, limit {max})")
        }
        other => format!("could not download this media: {other}"),
    }
}

fn looks_access_denied(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("private") || lower.contains("login") || lower.contains("region")
}

fn looks_not_found(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("not found") || lower.contains("deleted") || lower.contains("unavailable")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_display_and_status_text() {
        assert_eq!(Stage::SlotAcquired.to_string(), "slot_acquired");
        assert_eq!(Stage::Fetching.status_text(), "fetching the link...");
        assert_eq!(Stage::Done.to_string(), "done");
    }

    #[test]
    fn test_user_message_connection_refused() {
        let err = PipelineError::Fetch(FetchError {
            attempts: 5,
            last: ExtractError::Connect("refused".to_string()),
        });
        assert!(user_message(&err).contains("try again later"));
    }

    #[test]
    fn test_user_message_timeout() {
        let err = PipelineError::Transfer(TransferError::Exhausted {
            attempts: 3,
            last: Box::new(TransferError::Timeout),
        });
        assert!(user_message(&err).contains("too large or the connection too slow"));
    }

    #[test]
    fn test_user_message_access_denied() {
        let http = PipelineError::Transfer(TransferError::Http { status: 403 });
        assert!(user_message(&http).contains("private or region-blocked"));

        let sniffed = PipelineError::Fetch(FetchError {
            attempts: 2,
            last: ExtractError::Rejected {
                message: "Video is private, login required".to_string(),
            },
        });
        assert!(user_message(&sniffed).contains("private or region-blocked"));
    }

    #[test]
    fn test_user_message_not_found() {
        let err = PipelineError::Fetch(FetchError {
            attempts: 2,
            last: ExtractError::Http { status: 404 },
        });
        assert!(user_message(&err).contains("expired or deleted"));

        let sniffed = PipelineError::Fetch(FetchError {
            attempts: 2,
            last: ExtractError::Rejected {
                message: "content was deleted by the author".to_string(),
            },
        });
        assert!(user_message(&sniffed).contains("expired or deleted"));
    }

    #[test]
    fn test_user_message_generic_carries_raw_error() {
        let err = PipelineError::Fetch(FetchError {
            attempts: 5,
            last: ExtractError::Malformed("v1 payload carries no playable locator".to_string()),
        });
        let text = user_message(&err);
        assert!(text.contains("could not fetch"));
        assert!(text.contains("no playable locator"));
    }

    #[test]
    fn test_user_message_all_images_failed() {
        let err = PipelineError::AllImagesFailed { total: 6 };
        assert!(user_message(&err).contains("none of the 6"));
    }

    #[test]
    fn test_video_file_name() {
        assert_eq!(video_file_name(Some("video/mp4")), "video.mp4");
        assert_eq!(video_file_name(None), "video.bin");
    }

    #[test]
    fn test_photo_name_follows_served_mime_type() {
        assert_eq!(photo_name(0, Some("image/jpeg")), "photo_01.jpg");
        assert_eq!(photo_name(1, Some("image/webp")), "photo_02.webp");
        assert_eq!(photo_name(2, Some("image/png")), "photo_03.png");
        assert_eq!(photo_name(9, None), "photo_10.bin");
    }
}
