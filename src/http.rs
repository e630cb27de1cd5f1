//! Retrying HTTP helpers.
//!
//! All device-gateway and EST traffic goes through [`do_request`]: a
//! single-shot request with a fixed retry schedule for transient failures
//! (transport errors and 5xx responses). Non-2xx statuses are NOT errors
//! here - the protocol layers distinguish 200/201/204/304 themselves.

use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, CONNECTION, CONTENT_TYPE, USER_AGENT};
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Result;

/// Retry delays in seconds; the first attempt is immediate.
const RETRY_SCHEDULE: [u64; 6] = [0, 1, 2, 5, 13, 30];

/// User-Agent sent with every request.
pub const USER_AGENT_VALUE: &str = "fioconfig-client/2";

/// A fully buffered HTTP response.
#[derive(Debug)]
pub struct HttpResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response headers.
    pub headers: HeaderMap,
    /// Response body.
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// Deserialize the body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    /// The body as (lossy) UTF-8, for error messages.
    pub fn body_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    /// A response header as a string, if present and valid UTF-8.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// GET `url` with optional extra headers.
pub async fn get(
    client: &reqwest::Client,
    url: &str,
    headers: Option<HeaderMap>,
) -> Result<HttpResponse> {
    do_request(client, Method::GET, url, headers, None).await
}

/// POST a JSON-serialized body.
pub async fn post_json<T: Serialize>(
    client: &reqwest::Client,
    url: &str,
    data: &T,
) -> Result<HttpResponse> {
    let body = serde_json::to_vec(data)?;
    do_request(client, Method::POST, url, None, Some(body)).await
}

/// PATCH a JSON-serialized body.
pub async fn patch_json<T: Serialize>(
    client: &reqwest::Client,
    url: &str,
    data: &T,
) -> Result<HttpResponse> {
    let body = serde_json::to_vec(data)?;
    do_request(client, Method::PATCH, url, None, Some(body)).await
}

/// POST raw bytes with an explicit content type.
pub async fn post_raw(
    client: &reqwest::Client,
    url: &str,
    content_type: &'static str,
    body: Vec<u8>,
) -> Result<HttpResponse> {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    do_request(client, Method::POST, url, Some(headers), Some(body)).await
}

/// Perform a request with the retry schedule.
///
/// Retries on transport errors and on HTTP status >= 500; the last
/// attempt's outcome is returned either way, so a persistent 5xx surfaces
/// as an `Ok` response the caller can inspect.
pub async fn do_request(
    client: &reqwest::Client,
    method: Method,
    url: &str,
    headers: Option<HeaderMap>,
    body: Option<Vec<u8>>,
) -> Result<HttpResponse> {
    let mut last = None;
    for delay in RETRY_SCHEDULE {
        if delay != 0 {
            tracing::warn!("HTTP {} to {} failed, trying again in {}s", method, url, delay);
            tokio::time::sleep(Duration::from_secs(delay)).await;
        }
        match do_once(client, method.clone(), url, headers.clone(), body.clone()).await {
            Ok(res) if res.status < 500 => return Ok(res),
            outcome => last = Some(outcome),
        }
    }
    last.expect("retry schedule is non-empty")
}

async fn do_once(
    client: &reqwest::Client,
    method: Method,
    url: &str,
    headers: Option<HeaderMap>,
    body: Option<Vec<u8>>,
) -> Result<HttpResponse> {
    let mut req = client.request(method, url);
    let mut headers = headers.unwrap_or_default();
    if !headers.contains_key(USER_AGENT) {
        headers.insert(USER_AGENT, HeaderValue::from_static(USER_AGENT_VALUE));
    }
    if !headers.contains_key(CONTENT_TYPE) {
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    }
    headers.insert(CONNECTION, HeaderValue::from_static("close"));
    req = req.headers(headers);
    if let Some(body) = body {
        req = req.body(body);
    }

    let res = req.send().await?;
    let status = res.status().as_u16();
    let headers = res.headers().clone();
    let body = res.bytes().await?.to_vec();
    Ok(HttpResponse {
        status,
        headers,
        body,
    })
}
