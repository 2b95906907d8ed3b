//! HTTP task execution
//!
//! Every URL passes the safety gate before the shared client touches
//! it. The response body is streamed so the size cap cuts a hostile
//! endpoint off mid-transfer instead of buffering it whole; the
//! response timeout comes from the safety configuration (already
//! applied at client construction).

use std::collections::HashMap;

use futures::StreamExt;
use tracing::{debug, instrument};

use crate::config::SafetyConfig;
use crate::error::RunnerError;
use crate::safety;

/// Fetch a URL and return its body as text, subject to the safety
/// configuration's target policy and size cap.
#[instrument(skip(client, headers, cfg), fields(url = %url))]
pub async fn fetch_url(
    client: &reqwest::Client,
    url: &str,
    headers: &HashMap<String, String>,
    cfg: &SafetyConfig,
) -> Result<String, RunnerError> {
    let verified = safety::verify(url, cfg)?;

    let mut request = client.get(verified);
    for (key, value) in headers {
        request = request.header(key, value);
    }

    let response = request
        .send()
        .await
        .map_err(|e| RunnerError::Http(format!("request failed: {}", e)))?;

    let status = response.status();
    if !status.is_success() {
        return Err(RunnerError::Http(format!("status {} from {}", status, url)));
    }

    let body = match cfg.max_response_bytes {
        Some(limit) => read_capped(response, limit).await?,
        None => response
            .bytes()
            .await
            .map_err(|e| RunnerError::Http(format!("body read failed: {}", e)))?
            .to_vec(),
    };

    debug!(bytes = body.len(), "fetched");
    String::from_utf8(body).map_err(|e| RunnerError::Http(format!("non-UTF8 body: {}", e)))
}

/// Stream the body, aborting as soon as the cap is exceeded.
async fn read_capped(response: reqwest::Response, limit: u64) -> Result<Vec<u8>, RunnerError> {
    // Trust Content-Length when present; it fails fast.
    if let Some(declared) = response.content_length() {
        if declared > limit {
            return Err(RunnerError::ResponseTooLarge { limit });
        }
    }

    let mut body = Vec::new();
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| RunnerError::Http(format!("body read failed: {}", e)))?;
        if body.len() as u64 + chunk.len() as u64 > limit {
            return Err(RunnerError::ResponseTooLarge { limit });
        }
        body.extend_from_slice(&chunk);
    }
    Ok(body)
}
