//! GraphQL source: POST `{query, variables}`, then path extraction under `data`.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE};
use reqwest::Url;
use serde_json::{json, Value};
use std::fmt;

use super::env::expand_env;
use super::json::extract_path;
use super::rest::{mask_header, read_capped, DEFAULT_HTTP_TIMEOUT, ERROR_EXCERPT_BYTES, MAX_RESPONSE_BYTES};
use super::{Record, Source};
use crate::context::Context;
use crate::resilience::{BreakerSnapshot, Resilience};
use crate::types::{Error, Result, SourceConfig};

pub struct GraphqlSource {
    name: String,
    url: Url,
    query: String,
    variables: Value,
    result_path: String,
    headers: Vec<(String, String)>,
    header_map: HeaderMap,
    client: reqwest::Client,
    policy: Resilience,
}

impl GraphqlSource {
    pub fn new(name: &str, config: &SourceConfig, policy: Resilience) -> Result<Self> {
        let raw_url = config
            .from
            .as_deref()
            .filter(|u| !u.is_empty())
            .ok_or_else(|| Error::config(format!("source {name:?}: from is required")))?;
        let url = Url::parse(&expand_env(raw_url))
            .map_err(|e| Error::config(format!("source {name:?}: invalid url: {e}")))?;

        let query = match (&config.query, &config.query_file) {
            (Some(q), _) if !q.trim().is_empty() => q.clone(),
            (_, Some(path)) => std::fs::read_to_string(path).map_err(|e| {
                Error::config(format!(
                    "source {name:?}: cannot read query_file {}: {e}",
                    path.display()
                ))
            })?,
            _ => {
                return Err(Error::config(format!(
                    "source {name:?}: query or query_file is required"
                )))
            }
        };

        let result_path = config
            .result_path
            .clone()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| Error::config(format!("source {name:?}: result_path is required")))?;

        let headers: Vec<(String, String)> = config
            .headers
            .iter()
            .map(|(k, v)| (k.clone(), expand_env(v)))
            .collect();
        let mut header_map = HeaderMap::new();
        header_map.insert(ACCEPT, HeaderValue::from_static("application/json"));
        header_map.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        for (key, value) in &headers {
            let header = HeaderName::from_bytes(key.as_bytes())
                .map_err(|_| Error::config(format!("source {name:?}: invalid header name {key:?}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|_| Error::config(format!("source {name:?}: invalid value for header {key:?}")))?;
            header_map.insert(header, value);
        }

        let client = reqwest::Client::builder()
            .timeout(config.timeout.unwrap_or(DEFAULT_HTTP_TIMEOUT))
            .build()
            .map_err(|e| Error::config(format!("source {name:?}: http client: {e}")))?;

        Ok(Self {
            name: name.to_string(),
            url,
            query,
            variables: config.variables.clone().unwrap_or_else(|| json!({})),
            result_path,
            headers,
            header_map,
            client,
            policy,
        })
    }

    async fn fetch_once(&self) -> Result<Vec<Record>> {
        let payload = json!({ "query": self.query, "variables": self.variables });
        let mut response = self
            .client
            .post(self.url.clone())
            .headers(self.header_map.clone())
            .json(&payload)
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
        self.decode(&body)
    }

    fn decode(&self, body: &[u8]) -> Result<Vec<Record>> {
        let parsed: Value = serde_json::from_slice(body).map_err(|e| {
            Error::permanent(&self.name, "parse", format!("could not parse response as JSON: {e}"))
        })?;

        if let Some(errors) = parsed.get("errors").and_then(Value::as_array) {
            if let Some(first) = errors.first() {
                let message = first
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error");
                return Err(Error::permanent(
                    &self.name,
                    "graphql",
                    format!("{message} ({} error(s))", errors.len()),
                ));
            }
        }

        let data = parsed
            .get("data")
            .filter(|d| !d.is_null())
            .ok_or_else(|| Error::permanent(&self.name, "graphql", "response has no data"))?;
        extract_path(data, &self.result_path)
            .map_err(|e| Error::permanent(&self.name, "extract", e.to_string()))
    }
}

#[async_trait]
impl Source for GraphqlSource {
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

impl fmt::Debug for GraphqlSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let headers: Vec<(&str, String)> = self
            .headers
            .iter()
            .map(|(k, v)| (k.as_str(), mask_header(k, v)))
            .collect();
        f.debug_struct("GraphqlSource")
            .field("name", &self.name)
            .field("url", &self.url.as_str())
            .field("result_path", &self.result_path)
            .field("headers", &headers)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CircuitBreakerConfig, RetryConfig, SourceType};
    use std::io::Write;

    fn policy() -> Resilience {
        Resilience::new("test", RetryConfig::default(), CircuitBreakerConfig::default())
    }

    fn config() -> SourceConfig {
        let mut cfg = SourceConfig::new(SourceType::Graphql);
        cfg.from = Some("https://countries.example.com/graphql".into());
        cfg.query = Some("{ countries { code name } }".into());
        cfg.result_path = Some("countries".into());
        cfg
    }

    #[test]
    fn test_result_path_required() {
        let mut cfg = config();
        cfg.result_path = None;
        let err = GraphqlSource::new("countries", &cfg, policy()).unwrap_err();
        assert!(err.to_string().contains("result_path is required"));
    }

    #[test]
    fn test_query_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "query {{ countries {{ code }} }}").unwrap();
        let mut cfg = config();
        cfg.query = None;
        cfg.query_file = Some(file.path().to_path_buf());
        let src = GraphqlSource::new("countries", &cfg, policy()).unwrap();
        assert!(src.query.contains("countries"));
    }

    #[test]
    fn test_missing_query() {
        let mut cfg = config();
        cfg.query = None;
        let err = GraphqlSource::new("countries", &cfg, policy()).unwrap_err();
        assert!(err.to_string().contains("query or query_file is required"));
    }

    #[test]
    fn test_decode_extracts_under_data() {
        let src = GraphqlSource::new("countries", &config(), policy()).unwrap();
        let body = br#"{"data":{"countries":[{"code":"AD"},{"code":"AE"}]}}"#;
        let records = src.decode(body).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1]["code"], "AE");
    }

    #[test]
    fn test_decode_graphql_errors_are_permanent() {
        let src = GraphqlSource::new("countries", &config(), policy()).unwrap();
        let body = br#"{"errors":[{"message":"Cannot query field \"nope\""}],"data":null}"#;
        let err = src.decode(body).unwrap_err();
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("Cannot query field"));
    }
}
