//! Response handling shared by the HTTP strategies.

use base64::Engine as _;
use serde::de::DeserializeOwned;

use crate::error::ProviderError;

const BODY_PREVIEW_LIMIT: usize = 512;

fn preview_body(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return "<empty body>".to_string();
    }
    let mut out: String = trimmed.chars().take(BODY_PREVIEW_LIMIT).collect();
    if trimmed.chars().count() > BODY_PREVIEW_LIMIT {
        out.push_str("...");
    }
    out
}

/// Reject non-2xx answers. 401/403 are credential problems, not transient.
async fn ensure_success(
    provider: &str,
    resp: reqwest::Response,
) -> Result<reqwest::Response, ProviderError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    let body = preview_body(&body);
    if matches!(status.as_u16(), 401 | 403) {
        return Err(ProviderError::Authentication {
            provider: provider.to_string(),
            message: body,
        });
    }
    Err(ProviderError::Http {
        provider: provider.to_string(),
        status: status.as_u16(),
        body,
    })
}

pub(crate) async fn read_json<T: DeserializeOwned>(
    provider: &str,
    resp: reqwest::Response,
) -> Result<T, ProviderError> {
    let resp = ensure_success(provider, resp).await?;
    let body = resp
        .text()
        .await
        .map_err(|e| ProviderError::from_reqwest(provider, e))?;
    serde_json::from_str(&body).map_err(|e| ProviderError::MalformedResponse {
        provider: provider.to_string(),
        message: format!("{e} | body={}", preview_body(&body)),
    })
}

pub(crate) async fn read_bytes(
    provider: &str,
    resp: reqwest::Response,
) -> Result<Vec<u8>, ProviderError> {
    let resp = ensure_success(provider, resp).await?;
    let bytes = resp
        .bytes()
        .await
        .map_err(|e| ProviderError::from_reqwest(provider, e))?;
    Ok(bytes.to_vec())
}

/// Accepts bare base64 as well as a `data:<mime>;base64,` URL.
pub(crate) fn decode_base64(provider: &str, encoded: &str) -> Result<Vec<u8>, ProviderError> {
    let encoded = match encoded.strip_prefix("data:") {
        Some(rest) => rest.split_once(',').map_or(rest, |(_, data)| data),
        None => encoded,
    };
    base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .map_err(|e| ProviderError::MalformedResponse {
            provider: provider.to_string(),
            message: format!("invalid base64 image: {e}"),
        })
}
