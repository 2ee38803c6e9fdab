//! Snapshot persistence for the transfer list
//!
//! The whole list is written on every mutation and read back wholesale at
//! startup. Writes go to a sibling temp file which then replaces the
//! snapshot, so a crash never leaves a half-written list behind.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

use super::types::TransferItem;
use crate::error::{TransferError, TransferResult};

/// Current snapshot layout version
pub const SNAPSHOT_SCHEMA_VERSION: u32 = 1;

#[derive(Serialize)]
struct SnapshotRef<'a> {
    #[serde(rename = "SchemaVersion")]
    schema_version: u32,
    #[serde(rename = "Items")]
    items: &'a [TransferItem],
}

#[derive(Deserialize)]
struct Snapshot {
    #[serde(rename = "Items", default)]
    items: Vec<TransferItem>,
}

pub fn encode_snapshot(items: &[TransferItem]) -> TransferResult<Vec<u8>> {
    let snapshot = SnapshotRef {
        schema_version: SNAPSHOT_SCHEMA_VERSION,
        items,
    };
    Ok(serde_json::to_vec_pretty(&snapshot)?)
}

/// Decode a snapshot. A bare array (the unversioned layout) is accepted.
pub fn decode_snapshot(raw: &[u8]) -> TransferResult<Vec<TransferItem>> {
    let value: Value = serde_json::from_slice(raw)?;
    if value.is_array() {
        return Ok(serde_json::from_value(value)?);
    }

    let found = value
        .get("SchemaVersion")
        .and_then(Value::as_u64)
        .unwrap_or(0);
    if found > u64::from(SNAPSHOT_SCHEMA_VERSION) {
        return Err(TransferError::SchemaVersion {
            found: u32::try_from(found).unwrap_or(u32::MAX),
            supported: SNAPSHOT_SCHEMA_VERSION,
        });
    }

    let snapshot: Snapshot = serde_json::from_value(value)?;
    Ok(snapshot.items)
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Read the snapshot; `Ok(None)` when no snapshot has been written yet.
pub async fn read_snapshot(path: &Path) -> TransferResult<Option<Vec<TransferItem>>> {
    let raw = match tokio::fs::read(path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(TransferError::io(path, e)),
    };
    decode_snapshot(&raw).map(Some)
}

/// Move a snapshot that failed to load out of the way so the next save does
/// not overwrite it. Returns the new location.
pub async fn set_aside_snapshot(path: &Path) -> TransferResult<PathBuf> {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".rejected");
    let target = path.with_file_name(name);
    tokio::fs::rename(path, &target)
        .await
        .map_err(|e| TransferError::io(path, e))?;
    Ok(target)
}

/// Write-then-replace the snapshot with `items`.
pub async fn write_snapshot(path: &Path, items: &[TransferItem]) -> TransferResult<()> {
    let body = encode_snapshot(items)?;

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| TransferError::io(parent, e))?;
    }

    let tmp = temp_path(path);
    let mut file = tokio::fs::File::create(&tmp)
        .await
        .map_err(|e| TransferError::io(&tmp, e))?;
    file.write_all(&body)
        .await
        .map_err(|e| TransferError::io(&tmp, e))?;
    file.sync_all()
        .await
        .map_err(|e| TransferError::io(&tmp, e))?;
    drop(file);

    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| TransferError::io(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::types::{Direction, TransferKind, TransferPriority, TransferStatus};

    fn sample_items() -> Vec<TransferItem> {
        let mut done = TransferItem::new(
            Direction::Upload,
            TransferKind::Page,
            "https://example.test/events",
            "upload-abc.json".to_string(),
            TransferPriority::Low,
        );
        done.status = TransferStatus::Uploaded;
        vec![
            TransferItem::new(
                Direction::Download,
                TransferKind::File,
                "https://example.test/frame.png",
                "def.png".to_string(),
                TransferPriority::Normal,
            ),
            done,
        ]
    }

    #[tokio::test]
    async fn missing_snapshot_reads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = read_snapshot(&dir.path().join("DownloadUploadlist.json"))
            .await
            .unwrap();
        assert!(loaded.is_none());
    }

    #[tokio::test]
    async fn written_snapshot_reads_back_and_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("DownloadUploadlist.json");
        let items = sample_items();

        write_snapshot(&path, &items).await.unwrap();
        assert_eq!(read_snapshot(&path).await.unwrap(), Some(items));
        assert!(!temp_path(&path).exists());

        write_snapshot(&path, &[]).await.unwrap();
        assert_eq!(read_snapshot(&path).await.unwrap(), Some(Vec::new()));
    }

    #[tokio::test]
    async fn rejected_snapshot_is_moved_aside() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("DownloadUploadlist.json");
        std::fs::write(&path, "{not json").unwrap();

        let moved = set_aside_snapshot(&path).await.unwrap();
        assert!(!path.exists());
        assert_eq!(std::fs::read_to_string(moved).unwrap(), "{not json");
    }

    #[test]
    fn snapshot_carries_schema_version() {
        let raw = encode_snapshot(&sample_items()).unwrap();
        let value: Value = serde_json::from_slice(&raw).unwrap();
        assert_eq!(value["SchemaVersion"], SNAPSHOT_SCHEMA_VERSION);
        assert_eq!(value["Items"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn bare_array_snapshot_is_accepted() {
        let raw = br#"[{"Direction":"Download","Type":"Page","URL":"https://example.test/a.json","Status":"Downloaded","LocalFileSpec":"a.json","Priority":"Normal"}]"#;
        let items = decode_snapshot(raw).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].status, TransferStatus::Downloaded);
    }

    #[test]
    fn newer_schema_is_rejected() {
        let raw = br#"{"SchemaVersion": 7, "Items": []}"#;
        assert!(matches!(
            decode_snapshot(raw),
            Err(TransferError::SchemaVersion { found: 7, supported: 1 })
        ));
    }

    #[test]
    fn malformed_snapshot_is_an_error() {
        assert!(matches!(
            decode_snapshot(b"{not json"),
            Err(TransferError::Snapshot(_))
        ));
        assert!(matches!(
            decode_snapshot(br#"[{"Direction":"Sideways"}]"#),
            Err(TransferError::Snapshot(_))
        ));
    }
}
