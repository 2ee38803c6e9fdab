//! Deterministic local file names for queued transfers
//!
//! The same URL always maps to the same name, so re-adding a URL collides
//! with the earlier entry's file unless the caller disambiguates the URL.

use reqwest::Url;
use sha2::{Digest, Sha256};

use super::types::{Direction, TransferKind};
use crate::error::{TransferError, TransferResult};

/// Page payloads are stored as JSON text
const PAGE_EXTENSION: &str = "json";

/// Longest file extension accepted from a URL path
const MAX_EXTENSION_LEN: usize = 8;

const UPLOAD_PREFIX: &str = "upload-";

/// Staged upload files whose endpoint URL carries no extension
const UPLOAD_FALLBACK_EXTENSION: &str = "bin";

/// Parse and require an absolute http(s) URL
pub fn parse_remote_url(url: &str) -> TransferResult<Url> {
    let parsed = Url::parse(url).map_err(|e| TransferError::InvalidUrl {
        url: url.to_string(),
        reason: e.to_string(),
    })?;
    match parsed.scheme() {
        "http" | "https" => Ok(parsed),
        other => Err(TransferError::InvalidUrl {
            url: url.to_string(),
            reason: format!("unsupported scheme {}", other),
        }),
    }
}

fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Extension of the last path segment, lower-cased, if it looks like one
fn url_extension(url: &Url) -> Option<String> {
    let segment = url.path_segments()?.last()?;
    let (stem, ext) = segment.rsplit_once('.')?;
    if stem.is_empty()
        || ext.is_empty()
        || ext.len() > MAX_EXTENSION_LEN
        || !ext.chars().all(|c| c.is_ascii_alphanumeric())
    {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

/// Local name (relative to the data directory) for a transfer of `url`.
///
/// Pages map to `<sha256>.json`; files keep the URL's extension. A download
/// file URL without a usable extension is rejected as an unsupported kind;
/// staged upload files fall back to `.bin` since the URL is an endpoint.
pub fn local_file_name(
    direction: Direction,
    kind: TransferKind,
    url: &str,
) -> TransferResult<String> {
    let parsed = parse_remote_url(url)?;
    let extension = match kind {
        TransferKind::Page => PAGE_EXTENSION.to_string(),
        TransferKind::File => match (url_extension(&parsed), direction) {
            (Some(ext), _) => ext,
            (None, Direction::Upload) => UPLOAD_FALLBACK_EXTENSION.to_string(),
            (None, Direction::Download) => {
                return Err(TransferError::UnsupportedKind(url.to_string()))
            }
        },
    };
    let prefix = match direction {
        Direction::Download => "",
        Direction::Upload => UPLOAD_PREFIX,
    };
    Ok(format!(
        "{}{}.{}",
        prefix,
        sha256_hex(url.as_bytes()),
        extension
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_name_is_deterministic_json() {
        let url = "https://example.test/a.json";
        let a = local_file_name(Direction::Download, TransferKind::Page, url).unwrap();
        let b = local_file_name(Direction::Download, TransferKind::Page, url).unwrap();
        assert_eq!(a, b);
        assert!(a.ends_with(".json"));
        assert_eq!(a.len(), 64 + ".json".len());
    }

    #[test]
    fn file_name_keeps_url_extension() {
        let name = local_file_name(
            Direction::Download,
            TransferKind::File,
            "https://example.test/images/Frame_0001.JPG?size=large",
        )
        .unwrap();
        assert!(name.ends_with(".jpg"));
    }

    #[test]
    fn upload_and_download_of_same_url_do_not_collide() {
        let url = "https://example.test/events";
        let down = local_file_name(Direction::Download, TransferKind::Page, url).unwrap();
        let up = local_file_name(Direction::Upload, TransferKind::Page, url).unwrap();
        assert_ne!(down, up);
        assert!(up.starts_with("upload-"));
    }

    #[test]
    fn file_without_extension_is_unsupported() {
        for url in ["https://example.test/blob", "https://example.test/.hidden"] {
            let err = local_file_name(Direction::Download, TransferKind::File, url).unwrap_err();
            assert!(matches!(err, TransferError::UnsupportedKind(_)));
        }
    }

    #[test]
    fn upload_file_to_bare_endpoint_falls_back_to_bin() {
        let url = "https://example.test/api/photos";
        let name = local_file_name(Direction::Upload, TransferKind::File, url).unwrap();
        assert!(name.starts_with("upload-"));
        assert!(name.ends_with(".bin"));
    }

    #[test]
    fn malformed_or_non_http_url_is_rejected() {
        assert!(matches!(
            local_file_name(Direction::Download, TransferKind::Page, "not a url"),
            Err(TransferError::InvalidUrl { .. })
        ));
        assert!(matches!(
            local_file_name(Direction::Download, TransferKind::Page, "file:///etc/passwd"),
            Err(TransferError::InvalidUrl { .. })
        ));
    }
}
