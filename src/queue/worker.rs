//! Transfer worker - executes one download or upload against the remote endpoint

use log::{debug, info};
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use std::io::Write;
use std::path::Path;
use tokio_util::sync::CancellationToken;

use super::types::{Direction, TransferItem, TransferKind};
use crate::config::TransferConfig;
use crate::error::{TransferError, TransferResult};

const UPLOAD_CONTENT_TYPE: &str = "application/json";

pub(crate) fn build_client(config: &TransferConfig) -> TransferResult<Client> {
    Ok(Client::builder()
        .timeout(config.request_timeout())
        .user_agent(config.user_agent.clone())
        .build()?)
}

/// Write through a uniquely named sibling temp file, then rename it into
/// place. Concurrent writers of the same destination never share a temp
/// file, and a failed write never leaves a truncated payload behind.
async fn write_payload(
    destination: &Path,
    body: impl AsRef<[u8]> + Send + 'static,
) -> TransferResult<()> {
    let parent = destination
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_default();
    tokio::fs::create_dir_all(&parent)
        .await
        .map_err(|e| TransferError::io(&parent, e))?;

    let target = destination.to_path_buf();
    tokio::task::spawn_blocking(move || -> TransferResult<()> {
        let mut tmp = tempfile::Builder::new()
            .prefix(".")
            .suffix(".part")
            .tempfile_in(&parent)
            .map_err(|e| TransferError::io(&parent, e))?;
        tmp.write_all(body.as_ref())
            .map_err(|e| TransferError::io(tmp.path(), e))?;
        tmp.persist(&target)
            .map_err(|e| TransferError::io(&target, e.error))?;
        Ok(())
    })
    .await
    .map_err(|e| TransferError::io(destination, std::io::Error::other(e)))?
}

/// GET the item's URL and store the body at its local path
pub(crate) async fn download_item(
    client: &Client,
    item: &TransferItem,
    data_dir: &Path,
) -> TransferResult<()> {
    let response = client.get(&item.url).send().await?;

    let status = response.status();
    if !status.is_success() {
        return Err(TransferError::Status {
            url: item.url.clone(),
            status: status.as_u16(),
        });
    }

    let destination = data_dir.join(&item.local_file_spec);
    let body = response.bytes().await?;
    if item.kind == TransferKind::Page {
        if let Err(e) = std::str::from_utf8(&body) {
            return Err(TransferError::InvalidBody {
                url: item.url.clone(),
                reason: e.to_string(),
            });
        }
    }
    let written = body.len();
    write_payload(&destination, body).await?;

    info!(
        "download_complete: {} -> {} bytes={}",
        item.url, item.local_file_spec, written
    );
    Ok(())
}

/// POST the item's local file to its URL as `application/json`
pub(crate) async fn upload_item(
    client: &Client,
    item: &TransferItem,
    data_dir: &Path,
) -> TransferResult<()> {
    let source = data_dir.join(&item.local_file_spec);
    let body = tokio::fs::read(&source)
        .await
        .map_err(|e| TransferError::io(&source, e))?;
    let size = body.len();

    let response = client
        .post(&item.url)
        .header(CONTENT_TYPE, UPLOAD_CONTENT_TYPE)
        .body(body)
        .send()
        .await?;

    let status = response.status();
    if !status.is_success() {
        return Err(TransferError::Status {
            url: item.url.clone(),
            status: status.as_u16(),
        });
    }

    info!("upload_complete: {} bytes={}", item.url, size);
    Ok(())
}

/// Run one item, giving up early if `cancel` fires.
pub(crate) async fn run_item(
    client: &Client,
    item: &TransferItem,
    data_dir: &Path,
    cancel: &CancellationToken,
) -> TransferResult<()> {
    debug!("transfer_start: {} {}", item.direction, item.url);
    let transfer = async {
        match item.direction {
            Direction::Download => download_item(client, item, data_dir).await,
            Direction::Upload => upload_item(client, item, data_dir).await,
        }
    };
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(TransferError::Cancelled),
        result = transfer => result,
    }
}
