//! Download workers: bounded-concurrency transfers of Available records.

use std::path::{Path, PathBuf};
use std::time::Duration;

use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::error::{Error, Result};
use crate::retry::with_timeout;
use crate::types::{Event, ImageRecord, RecordKey};
use crate::utils::{file_name_from_url, sanitize_filename};

use super::context::PipelineContext;

/// Download every record received on `ready`, at most
/// `download.concurrency` at a time, until the sender is dropped.
pub(crate) async fn run_download_workers(ctx: &PipelineContext, ready: mpsc::Receiver<RecordKey>) {
    let concurrency = ctx.config.download.concurrency.max(1);
    ReceiverStream::new(ready)
        .map(|key| download_record(ctx, key))
        .buffer_unordered(concurrency)
        .for_each(|()| async {})
        .await;
}

/// Local file for a record: `<downloads>/<collection>/<record_id>_<order_id>_<file name>`
pub fn target_path(download_dir: &Path, record: &ImageRecord, url: &str) -> PathBuf {
    let order = record
        .order_id()
        .map(|id| id.to_string())
        .unwrap_or_else(|| "unordered".to_string());
    let file = file_name_from_url(url).unwrap_or_else(|| "image.zip".to_string());
    download_dir
        .join(sanitize_filename(&record.key.collection))
        .join(format!(
            "{}_{}_{}",
            sanitize_filename(&record.key.record_id),
            order,
            file
        ))
}

fn partial_path(target: &Path) -> PathBuf {
    let mut name = target.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".partial");
    target.with_file_name(name)
}

/// Claim, transfer and settle one record. Never fails the caller: every
/// outcome ends up in the record's status.
async fn download_record(ctx: &PipelineContext, key: RecordKey) {
    if ctx.cancel.is_cancelled() {
        tracing::debug!(record = %key, "Run cancelled, not starting download");
        return;
    }

    let record = {
        let mut store = ctx.store.lock().await;
        match store.start_download(&key) {
            Ok(record) => {
                ctx.save(&store).await;
                record
            }
            Err(e) => {
                tracing::debug!(record = %key, error = %e, "Record not claimable for download");
                return;
            }
        }
    };

    tracing::info!(record = %key, order_id = ?record.order_id(), "Starting download");
    let result = transfer(ctx, &record).await;

    let mut store = ctx.store.lock().await;
    match result {
        Ok(path) => match store.mark_downloaded(&key, path.clone()) {
            Ok(()) => {
                tracing::info!(record = %key, path = %path.display(), "Download complete");
                ctx.emit(Event::Downloaded { key, path });
            }
            Err(e) => tracing::error!(record = %key, error = %e, "Could not record download"),
        },
        Err(Error::Cancelled) => {
            // Stays Downloading; a resumed run picks it up again as Available
            tracing::info!(record = %key, "Download interrupted, partial file kept");
        }
        Err(e) => {
            let reason = e.to_string();
            tracing::error!(record = %key, error = %e, "Download failed");
            if store.mark_failed(&key, reason.clone()).is_ok() {
                ctx.emit(Event::RecordFailed { key, reason });
            }
        }
    }
    ctx.save(&store).await;
}

async fn transfer(ctx: &PipelineContext, record: &ImageRecord) -> Result<PathBuf> {
    let url = record
        .download_url()
        .ok_or_else(|| Error::Other("no download URL reported for this item".to_string()))?;
    let target = target_path(&ctx.config.paths.downloads, record, url);

    if !ctx.config.download.force && already_on_disk(&target, record.expected_size()).await {
        tracing::info!(
            record = %record.key,
            path = %target.display(),
            "File already on disk, skipping transfer"
        );
        return Ok(target);
    }

    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let partial = partial_path(&target);
    let idle = ctx.config.rapi.timeout_download;

    ctx.retrying("download", || {
        transfer_once(ctx, url, &partial, record.expected_size(), idle)
    })
    .await?;

    tokio::fs::rename(&partial, &target).await?;
    Ok(target)
}

async fn already_on_disk(target: &Path, expected: Option<u64>) -> bool {
    match tokio::fs::metadata(target).await {
        Ok(meta) => meta.len() > 0 && expected.is_none_or(|size| size == meta.len()),
        Err(_) => false,
    }
}

/// One attempt: resume into `partial` and verify the result.
///
/// `idle` bounds the wait for the response and for every chunk, so a slow
/// transfer that keeps making progress is never cut off.
async fn transfer_once(
    ctx: &PipelineContext,
    url: &str,
    partial: &Path,
    reported_size: Option<u64>,
    idle: Duration,
) -> Result<()> {
    let offset = match tokio::fs::metadata(partial).await {
        Ok(meta) => meta.len(),
        Err(_) => 0,
    };
    if offset > 0 && reported_size == Some(offset) {
        tracing::debug!(path = %partial.display(), offset, "Partial file already complete");
        return verify_partial(partial, reported_size).await;
    }

    let mut stream = match with_timeout(idle, "download", ctx.client.download(url, offset)).await {
        Ok(stream) => stream,
        // Nothing left past the offset: the previous attempt got everything
        Err(Error::Remote { status: 416, .. }) if offset > 0 => {
            tracing::debug!(path = %partial.display(), offset, "Range not satisfiable, partial file is complete");
            return verify_partial(partial, reported_size).await;
        }
        Err(e) => return Err(e),
    };
    let mut file = if stream.resumed {
        tracing::debug!(path = %partial.display(), offset, "Resuming partial download");
        tokio::fs::OpenOptions::new()
            .append(true)
            .open(partial)
            .await?
    } else {
        tokio::fs::File::create(partial).await?
    };

    loop {
        let next = tokio::time::timeout(idle, stream.body.next())
            .await
            .map_err(|_| Error::Timeout {
                operation: "download",
                seconds: idle.as_secs(),
            });
        let chunk = match next {
            Ok(Some(chunk)) => chunk,
            Ok(None) => break,
            Err(e) => {
                // Keep what arrived so the retry resumes from it
                file.flush().await?;
                return Err(e);
            }
        };
        if ctx.cancel.is_cancelled() {
            file.flush().await?;
            return Err(Error::Cancelled);
        }
        file.write_all(&chunk?).await?;
    }
    file.flush().await?;
    drop(file);

    verify_partial(partial, stream.expected_size.or(reported_size)).await
}

/// Check a finished transfer against the expected size.
async fn verify_partial(partial: &Path, expected: Option<u64>) -> Result<()> {
    let written = tokio::fs::metadata(partial).await?.len();
    if written == 0 {
        return Err(Error::Other("transfer produced an empty file".to_string()));
    }
    if let Some(expected) = expected
        && written != expected
    {
        if written > expected {
            // Overlong partial data cannot be resumed
            tokio::fs::remove_file(partial).await.ok();
        }
        return Err(Error::IncompleteTransfer {
            expected,
            actual: written,
        });
    }
    Ok(())
}
