//! HTTP fetch tool for agent-driven REST lookups.
//!
//! Performs GET/POST requests on behalf of workflows (the `fetcher` step
//! of a rate-tracker pipeline, webhook pings, and similar). Outbound
//! destinations are checked against a hard-coded SSRF deny-list before any
//! request is made: loopback, link-local (cloud metadata services), and
//! RFC-1918 ranges are rejected, for both address literals and DNS names.
//! Passing `allow_private: true` bypasses the guard for deliberate
//! lab/internal use.
//!
//! Like every tool, recoverable failures come back as `{"error": ...}`
//! mappings rather than errors, so a downstream agent can branch on the
//! presence of the `error` key.

use crate::agentflow::tool_protocol::{
    error_value, Tool, ToolContext, ToolMetadata, ToolParameter, ToolParameterType,
};
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::net::IpAddr;
use std::time::Duration;

/// Upper bound on response bodies; larger responses are truncated server
/// errors waiting to happen, not data.
const MAX_RESPONSE_BYTES: usize = 10 * 1024 * 1024;

/// Default request timeout.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// The `http_fetch` tool.
pub struct HttpFetchTool {
    metadata: ToolMetadata,
    client: reqwest::Client,
}

impl HttpFetchTool {
    pub fn new() -> Self {
        let metadata = ToolMetadata::new(
            "http_fetch",
            "Fetch a URL over HTTP(S). Returns status, headers, body and parsed JSON.",
        )
        .with_parameter(
            ToolParameter::new("url", ToolParameterType::String)
                .with_description("Absolute http:// or https:// URL")
                .required(),
        )
        .with_parameter(
            ToolParameter::new("method", ToolParameterType::String)
                .with_description("GET (default) or POST"),
        )
        .with_parameter(
            ToolParameter::new("body", ToolParameterType::Object)
                .with_description("JSON payload for POST requests"),
        )
        .with_parameter(
            ToolParameter::new("headers", ToolParameterType::Object)
                .with_description("Additional request headers"),
        )
        .with_parameter(
            ToolParameter::new("timeout_secs", ToolParameterType::Integer)
                .with_description("Request timeout in seconds (default 30)"),
        )
        .with_parameter(
            ToolParameter::new("allow_private", ToolParameterType::Boolean)
                .with_description("Bypass the private/reserved destination guard"),
        );
        Self {
            metadata,
            client: reqwest::Client::new(),
        }
    }

    async fn fetch(&self, params: &Value) -> Result<Value, String> {
        let url = params
            .get("url")
            .and_then(|v| v.as_str())
            .ok_or_else(|| "missing required parameter 'url'".to_string())?;
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(format!("unsupported URL scheme in '{}'", url));
        }

        let allow_private = params
            .get("allow_private")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        if !allow_private {
            let host = extract_host(url)
                .ok_or_else(|| format!("could not extract host from '{}'", url))?;
            check_destination_blocked(&host).await?;
        }

        let method = params
            .get("method")
            .and_then(|v| v.as_str())
            .unwrap_or("GET")
            .to_ascii_uppercase();
        let timeout = Duration::from_secs(
            params
                .get("timeout_secs")
                .and_then(|v| v.as_u64())
                .unwrap_or(DEFAULT_TIMEOUT_SECS),
        );

        let mut request = match method.as_str() {
            "GET" => self.client.get(url),
            "POST" => {
                let body = params.get("body").cloned().unwrap_or(Value::Null);
                self.client.post(url).json(&body)
            }
            other => return Err(format!("unsupported method '{}'", other)),
        };

        if let Some(Value::Object(headers)) = params.get("headers") {
            for (name, value) in headers {
                if let Some(v) = value.as_str() {
                    request = request.header(name.as_str(), v);
                }
            }
        }

        let response = request
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| format!("{} request failed: {}", method, e))?;

        let status = response.status().as_u16();
        let mut headers = Map::new();
        for (name, value) in response.headers() {
            if let Ok(v) = value.to_str() {
                headers.insert(name.to_string(), Value::String(v.to_string()));
            }
        }

        // Stream the body, aborting as soon as the size cap is exceeded so
        // an oversized response is never fully buffered.
        use futures_util::StreamExt;
        let mut stream = response.bytes_stream();
        let mut body_bytes: Vec<u8> = Vec::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| format!("failed to read response body: {}", e))?;
            if body_bytes.len() + chunk.len() > MAX_RESPONSE_BYTES {
                return Err(format!(
                    "response body exceeds maximum size of {} bytes",
                    MAX_RESPONSE_BYTES
                ));
            }
            body_bytes.extend_from_slice(&chunk);
        }
        let body = String::from_utf8_lossy(&body_bytes).into_owned();
        let parsed: Value = serde_json::from_str(&body).unwrap_or(Value::Null);

        Ok(json!({
            "status": status,
            "headers": Value::Object(headers),
            "body": body,
            "json": parsed,
        }))
    }
}

impl Default for HttpFetchTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for HttpFetchTool {
    fn metadata(&self) -> &ToolMetadata {
        &self.metadata
    }

    async fn execute(&self, _ctx: &ToolContext, params: Value) -> Value {
        match self.fetch(&params).await {
            Ok(result) => result,
            Err(message) => error_value(message),
        }
    }
}

/// Returns `true` if the IP address falls into a range that must never be
/// reachable from an agent-driven request.
///
/// Blocked ranges:
/// - IPv4 loopback:       127.0.0.0/8
/// - IPv4 link-local:     169.254.0.0/16  (cloud metadata services)
/// - IPv4 RFC-1918:       10.0.0.0/8, 172.16.0.0/12, 192.168.0.0/16
/// - IPv4 unspecified:    0.0.0.0
/// - IPv6 loopback/unspecified, fe80::/10 link-local, fc00::/7 ULA
pub(crate) fn is_blocked_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            let o = v4.octets();
            if v4.is_unspecified() || o[0] == 127 {
                return true;
            }
            if o[0] == 169 && o[1] == 254 {
                return true;
            }
            if o[0] == 10 {
                return true;
            }
            if o[0] == 172 && o[1] >= 16 && o[1] <= 31 {
                return true;
            }
            if o[0] == 192 && o[1] == 168 {
                return true;
            }
            false
        }
        IpAddr::V6(v6) => {
            if v6.is_loopback() || v6.is_unspecified() {
                return true;
            }
            let segments = v6.segments();
            // fe80::/10 link-local
            if (segments[0] & 0xffc0) == 0xfe80 {
                return true;
            }
            // fc00::/7 unique local
            if (segments[0] & 0xfe00) == 0xfc00 {
                return true;
            }
            false
        }
    }
}

/// Resolve `host` and reject any address in a blocked range. DNS failures
/// are rejections too; unknown hosts are not allowed through. Resolution
/// runs on `spawn_blocking` so the executor is never stalled.
///
/// A DNS-rebinding attacker could resolve public here and private at
/// request time; the pre-flight still blocks the overwhelmingly common
/// direct-IP and single-resolution vectors.
async fn check_destination_blocked(host: &str) -> Result<(), String> {
    let host_owned = host.to_string();
    let addrs = tokio::task::spawn_blocking(move || {
        use std::net::ToSocketAddrs;
        format!("{}:80", host_owned).to_socket_addrs()
    })
    .await
    .map_err(|e| format!("DNS resolution task failed: {}", e))?
    .map_err(|e| format!("could not resolve host '{}': {}", host, e))?;

    for addr in addrs {
        if is_blocked_ip(addr.ip()) {
            return Err(format!(
                "request to '{}' blocked: target IP {} is in a reserved/private range",
                host,
                addr.ip()
            ));
        }
    }
    Ok(())
}

/// Host portion of an http(s) URL, without port or path.
fn extract_host(url: &str) -> Option<String> {
    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))?;
    let host = rest.split('/').next()?.split(':').next()?;
    if host.is_empty() {
        None
    } else {
        Some(host.to_string())
    }
}
