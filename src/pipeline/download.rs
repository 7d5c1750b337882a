//! Download stage: turn a manifest entry into bytes.
//!
//! * `local://` entries are decoded from their inline payload, no I/O.
//! * Everything else is fetched through the [`Transport`]. When the direct
//!   fetch fails and the entry carries a `proxy_url`, the proxy copy is
//!   fetched instead and re-encoded through the codec so the bytes are a
//!   clean raster regardless of what the proxy served.

use crate::error::AssetError;
use crate::manifest::ImageEntry;
use crate::pipeline::codec::{sniff_mime, Codec};
use crate::pipeline::transport::{
    send_with_retry, OutgoingRequest, RetryPolicy, Transport, TransportError,
};
use crate::strategy::canonical_mime;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct Downloaded {
    pub bytes: Vec<u8>,
    pub mime_type: String,
    /// Whether the bytes came from the proxy fallback.
    pub via_proxy: bool,
}

/// Fetch the bytes for one entry.
pub async fn download(
    entry: &ImageEntry,
    transport: &dyn Transport,
    codec: &dyn Codec,
    timeout: Duration,
    policy: &RetryPolicy,
) -> Result<Downloaded, AssetError> {
    if entry.is_local() {
        return decode_local(entry);
    }

    let direct = fetch(&entry.original_url, transport, timeout, policy).await;
    let err = match direct {
        Ok(d) => return Ok(d),
        Err(AssetError::Cancelled) => return Err(AssetError::Cancelled),
        Err(e) => e,
    };

    let Some(proxy) = entry.proxy_url.as_deref() else {
        return Err(err);
    };
    warn!("{}: direct download failed ({}), trying proxy", entry.id, err);
    let mut fetched = match fetch(proxy, transport, timeout, policy).await {
        Ok(d) => d,
        Err(AssetError::Cancelled) => return Err(AssetError::Cancelled),
        // Report the original failure; the proxy was a fallback.
        Err(proxy_err) => {
            debug!("{}: proxy download failed: {}", entry.id, proxy_err);
            return Err(err);
        }
    };
    fetched.via_proxy = true;

    if codec.is_capable() {
        let target = if fetched.mime_type == "image/jpeg" {
            "image/jpeg"
        } else {
            "image/png"
        };
        match codec.reencode(&fetched.bytes, target, 92) {
            Ok(bytes) => {
                fetched.bytes = bytes;
                fetched.mime_type = target.to_string();
            }
            Err(e) => {
                return Err(AssetError::Download {
                    url: entry.original_url.clone(),
                    reason: format!("proxy copy is not a decodable image: {e}"),
                })
            }
        }
    }
    Ok(fetched)
}

fn decode_local(entry: &ImageEntry) -> Result<Downloaded, AssetError> {
    let payload = entry.payload.as_ref().ok_or_else(|| AssetError::Download {
        url: entry.original_url.clone(),
        reason: "local reference has no payload".to_string(),
    })?;
    let bytes = payload.decode().map_err(|e| AssetError::Download {
        url: entry.original_url.clone(),
        reason: format!("invalid base64 payload: {e}"),
    })?;
    let mime_type = sniff_mime(&bytes)
        .map(str::to_string)
        .unwrap_or_else(|| canonical_mime(&payload.mime_type));
    Ok(Downloaded {
        bytes,
        mime_type,
        via_proxy: false,
    })
}

async fn fetch(
    url: &str,
    transport: &dyn Transport,
    timeout: Duration,
    policy: &RetryPolicy,
) -> Result<Downloaded, AssetError> {
    let request = OutgoingRequest::get(url);
    let response = send_with_retry(transport, &request, timeout, policy)
        .await
        .map_err(|e| match e {
            TransportError::Timeout(d) => AssetError::DownloadTimeout {
                url: url.to_string(),
                secs: d.as_secs(),
            },
            TransportError::Cancelled => AssetError::Cancelled,
            TransportError::Network(reason) => AssetError::Download {
                url: url.to_string(),
                reason,
            },
        })?;

    if !response.is_success() {
        return Err(AssetError::Download {
            url: url.to_string(),
            reason: format!("HTTP {}", response.status),
        });
    }
    if response.body.is_empty() {
        return Err(AssetError::Download {
            url: url.to_string(),
            reason: "empty response body".to_string(),
        });
    }

    // Magic bytes beat the header: servers routinely send images as
    // application/octet-stream.
    let mime_type = sniff_mime(&response.body)
        .map(str::to_string)
        .or_else(|| response.content_type.as_deref().map(canonical_mime))
        .unwrap_or_else(|| "application/octet-stream".to_string());
    debug!("Downloaded {} ({} bytes, {})", url, response.body.len(), mime_type);
    Ok(Downloaded {
        bytes: response.body,
        mime_type,
        via_proxy: false,
    })
}
