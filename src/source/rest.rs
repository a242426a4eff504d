//! HTTP/REST source.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT};
use reqwest::{Method, Url};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use super::env::expand_env;
use super::json::{navigate, to_records};
use super::{Record, Source};
use crate::context::Context;
use crate::resilience::{BreakerSnapshot, Resilience};
use crate::types::{Error, Result, SourceConfig};

/// Successful bodies larger than this are rejected.
pub const MAX_RESPONSE_BYTES: usize = 10 * 1024 * 1024;
/// Body excerpt carried by non-2xx errors.
pub const ERROR_EXCERPT_BYTES: usize = 1024;
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(10);

const SENSITIVE_HEADERS: &[&str] = &[
    "authorization",
    "x-api-key",
    "x-auth-token",
    "cookie",
    "set-cookie",
];

/// Mask credential-bearing header values: first four characters, then `****`.
pub fn mask_header(name: &str, value: &str) -> String {
    if !SENSITIVE_HEADERS.contains(&name.to_ascii_lowercase().as_str()) {
        return value.to_string();
    }
    if value.chars().count() > 4 {
        let prefix: String = value.chars().take(4).collect();
        format!("{prefix}****")
    } else {
        "****".to_string()
    }
}

pub struct RestSource {
    name: String,
    url: Url,
    method: Method,
    headers: BTreeMap<String, String>,
    header_map: HeaderMap,
    result_path: Option<String>,
    client: reqwest::Client,
    policy: Resilience,
}

impl RestSource {
    pub fn new(name: &str, config: &SourceConfig, policy: Resilience) -> Result<Self> {
        let raw_url = config
            .from
            .as_deref()
            .filter(|u| !u.is_empty())
            .ok_or_else(|| Error::config(format!("source {name:?}: from is required")))?;

        let mut url = Url::parse(&expand_env(raw_url))
            .map_err(|e| Error::config(format!("source {name:?}: invalid url: {e}")))?;
        let query: BTreeMap<String, String> = config
            .query_params
            .iter()
            .map(|(k, v)| (k.clone(), expand_env(v)))
            .collect();
        merge_query(&mut url, &query);

        let method_name = config
            .method
            .as_deref()
            .or_else(|| config.option("method"))
            .unwrap_or("GET")
            .to_ascii_uppercase();
        let method = Method::from_bytes(method_name.as_bytes())
            .map_err(|_| Error::config(format!("source {name:?}: invalid method {method_name:?}")))?;

        let headers = collect_headers(config);
        let header_map = build_header_map(name, &headers)?;

        let client = reqwest::Client::builder()
            .timeout(config.timeout.unwrap_or(DEFAULT_HTTP_TIMEOUT))
            .build()
            .map_err(|e| Error::config(format!("source {name:?}: http client: {e}")))?;

        tracing::debug!(source = name, url = %url, method = %method, "rest source configured");

        Ok(Self {
            name: name.to_string(),
            url,
            method,
            headers,
            header_map,
            result_path: config.result_path.clone().filter(|p| !p.is_empty()),
            client,
            policy,
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    async fn fetch_once(&self) -> Result<Vec<Record>> {
        let mut response = self
            .client
            .request(self.method.clone(), self.url.clone())
            .headers(self.header_map.clone())
            .send()
            .await
            .map_err(|e| Error::transient(&self.name, "request", e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let (excerpt, _) = read_capped(&mut response, ERROR_EXCERPT_BYTES)
                .await
                .unwrap_or_default();
            return Err(Error::Http {
                source_name: self.name.clone(),
                status: status.as_u16(),
                body: String::from_utf8_lossy(&excerpt).trim().to_string(),
            });
        }

        let (body, truncated) = read_capped(&mut response, MAX_RESPONSE_BYTES)
            .await
            .map_err(|e| Error::transient(&self.name, "read response", e.to_string()))?;
        if truncated {
            return Err(Error::permanent(
                &self.name,
                "read response",
                format!("response exceeds {MAX_RESPONSE_BYTES} bytes"),
            ));
        }

        parse_body(&self.name, &body, self.result_path.as_deref())
    }
}

#[async_trait]
impl Source for RestSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self, ctx: &Context) -> Result<Vec<Record>> {
        self.policy.call(ctx, || self.fetch_once()).await
    }

    fn health(&self) -> Option<BreakerSnapshot> {
        Some(self.policy.breaker().snapshot())
    }
}

impl fmt::Debug for RestSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let headers: BTreeMap<&str, String> = self
            .headers
            .iter()
            .map(|(k, v)| (k.as_str(), mask_header(k, v)))
            .collect();
        f.debug_struct("RestSource")
            .field("name", &self.name)
            .field("url", &self.url.as_str())
            .field("method", &self.method.as_str())
            .field("headers", &headers)
            .field("result_path", &self.result_path)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// Explicit parameters replace same-named ones already in the URL.
fn merge_query(url: &mut Url, explicit: &BTreeMap<String, String>) {
    if explicit.is_empty() {
        return;
    }
    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| !explicit.contains_key(k.as_ref()))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    let mut pairs = url.query_pairs_mut();
    pairs.clear();
    for (k, v) in kept.iter().map(|(k, v)| (k.as_str(), v.as_str())) {
        pairs.append_pair(k, v);
    }
    for (k, v) in explicit {
        pairs.append_pair(k, v);
    }
}

/// Structured headers, then legacy `options.headers` (`k:v,k:v`), then the
/// `auth_header` / `api_key` shorthands. Values are env-expanded.
fn collect_headers(config: &SourceConfig) -> BTreeMap<String, String> {
    let mut headers: BTreeMap<String, String> = config
        .headers
        .iter()
        .map(|(k, v)| (k.clone(), expand_env(v)))
        .collect();

    if let Some(legacy) = config.option("headers") {
        for entry in legacy.split(',') {
            if let Some((key, value)) = entry.split_once(':') {
                headers.insert(key.trim().to_string(), expand_env(value.trim()));
            }
        }
    }
    if let Some(auth) = config.option("auth_header") {
        headers.insert("Authorization".to_string(), expand_env(auth));
    }
    if let Some(key) = config.option("api_key") {
        headers.insert("X-API-Key".to_string(), expand_env(key));
    }
    headers
}

fn build_header_map(source: &str, headers: &BTreeMap<String, String>) -> Result<HeaderMap> {
    let mut map = HeaderMap::new();
    map.insert(ACCEPT, HeaderValue::from_static("application/json"));
    for (key, value) in headers {
        let name = HeaderName::from_bytes(key.as_bytes())
            .map_err(|_| Error::config(format!("source {source:?}: invalid header name {key:?}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|_| Error::config(format!("source {source:?}: invalid value for header {key:?}")))?;
        map.insert(name, value);
    }
    Ok(map)
}

/// Read at most `limit` bytes. The flag reports whether more was available.
pub(crate) async fn read_capped(
    response: &mut reqwest::Response,
    limit: usize,
) -> reqwest::Result<(Bytes, bool)> {
    let mut buf = BytesMut::new();
    while let Some(chunk) = response.chunk().await? {
        let room = limit - buf.len();
        if chunk.len() > room {
            buf.extend_from_slice(&chunk[..room]);
            return Ok((buf.freeze(), true));
        }
        buf.extend_from_slice(&chunk);
    }
    Ok((buf.freeze(), false))
}

/// Decode a response body into records, optionally following `result_path`.
pub fn parse_body(source: &str, body: &[u8], result_path: Option<&str>) -> Result<Vec<Record>> {
    let text = String::from_utf8_lossy(body);
    let text = text.trim();
    if text.is_empty() {
        return Ok(Vec::new());
    }
    let parsed: Value = serde_json::from_str(text).map_err(|e| {
        Error::permanent(source, "parse", format!("could not parse response as JSON: {e}"))
    })?;
    let target = match result_path {
        Some(path) => navigate(&parsed, path)
            .map_err(|e| Error::permanent(source, "extract", e.to_string()))?
            .clone(),
        None => parsed,
    };
    to_records(target).map_err(|e| Error::permanent(source, "extract", e.to_string()))
}
