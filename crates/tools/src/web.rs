// Web tool for fetching external content

use crate::registry::{json_schema_boolean, json_schema_object, json_schema_string, Tool, ToolOutput, ToolSchema};
use anyhow::{Context, Result};
use serde::Deserialize;
use std::time::Duration;
use url::Url;

const DEFAULT_MAX_BYTES: usize = 1_000_000;
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Tool to fetch content from web URLs.
///
/// An empty allowlist permits every host; otherwise a host must match an
/// allowed domain exactly or be one of its subdomains.
pub struct WebFetchTool {
    client: reqwest::Client,
    allowed_domains: Vec<String>,
    max_bytes: usize,
}

impl WebFetchTool {
    pub fn new(allowed_domains: Vec<String>) -> Result<Self> {
        Self::with_limits(
            allowed_domains,
            DEFAULT_MAX_BYTES,
            Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        )
    }

    pub fn with_limits(
        allowed_domains: Vec<String>,
        max_bytes: usize,
        timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("taskloom/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            allowed_domains,
            max_bytes,
        })
    }

    fn is_domain_allowed(&self, url: &Url) -> bool {
        if self.allowed_domains.is_empty() {
            return true;
        }

        let Some(host) = url.host_str() else {
            return false;
        };

        self.allowed_domains
            .iter()
            .any(|allowed| host == allowed || host.ends_with(&format!(".{}", allowed)))
    }
}

#[derive(Debug, Deserialize)]
struct WebFetchArgs {
    url: String,
    #[serde(default)]
    include_headers: bool,
}

#[async_trait::async_trait]
impl Tool for WebFetchTool {
    fn schema(&self) -> ToolSchema {
        let description = if self.allowed_domains.is_empty() {
            "Fetch content from a web URL".to_string()
        } else {
            format!(
                "Fetch content from a web URL. Only allowed domains: {}",
                self.allowed_domains.join(", ")
            )
        };

        ToolSchema {
            name: "web_fetch".to_string(),
            description,
            input_schema: json_schema_object(
                serde_json::json!({
                    "url": json_schema_string("The URL to fetch"),
                    "include_headers": json_schema_boolean("Include HTTP response headers in output (default: false)")
                }),
                vec!["url"],
            ),
        }
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<ToolOutput> {
        let args: WebFetchArgs =
            serde_json::from_value(arguments).context("Invalid arguments for web_fetch")?;

        // Parse and validate URL
        let url = match Url::parse(&args.url) {
            Ok(url) => url,
            Err(e) => return Ok(ToolOutput::error(format!("Invalid URL: {}", e))),
        };

        // Only allow HTTP/HTTPS
        if url.scheme() != "http" && url.scheme() != "https" {
            return Ok(ToolOutput::error(format!(
                "Only HTTP/HTTPS URLs are supported, got: {}",
                url.scheme()
            )));
        }

        if !self.is_domain_allowed(&url) {
            return Ok(ToolOutput::error(format!(
                "Domain not allowed: {}. Allowed domains: {}",
                url.host_str().unwrap_or("unknown"),
                self.allowed_domains.join(", ")
            )));
        }

        let response = match self.client.get(url.as_str()).send().await {
            Ok(response) => response,
            Err(e) => return Ok(ToolOutput::error(format!("HTTP request failed: {}", e))),
        };

        let status = response.status();
        if !status.is_success() {
            return Ok(ToolOutput::error(format!("HTTP {} from {}", status, url)));
        }

        let headers: serde_json::Map<String, serde_json::Value> = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.to_string(),
                    serde_json::Value::String(value.to_str().unwrap_or("<non-utf8>").to_string()),
                )
            })
            .collect();
        let content_type = headers.get("content-type").cloned();

        // Read at most max_bytes, chunk by chunk
        let mut response = response;
        let mut buf: Vec<u8> = Vec::new();
        let mut truncated = false;
        loop {
            let chunk = match response.chunk().await {
                Ok(Some(chunk)) => chunk,
                Ok(None) => break,
                Err(e) => {
                    return Ok(ToolOutput::error(format!(
                        "Failed to read response body: {}",
                        e
                    )))
                }
            };
            let room = self.max_bytes - buf.len();
            if chunk.len() > room {
                buf.extend_from_slice(&chunk[..room]);
                truncated = true;
                break;
            }
            buf.extend_from_slice(&chunk);
        }

        // Drop a multi-byte character split by the cut
        if truncated {
            if let Err(e) = std::str::from_utf8(&buf) {
                if e.error_len().is_none() {
                    buf.truncate(e.valid_up_to());
                }
            }
        }
        let body = String::from_utf8_lossy(&buf).into_owned();

        let mut output = serde_json::json!({
            "url": url.to_string(),
            "status": status.as_u16(),
            "content_type": content_type,
            "body": body,
            "truncated": truncated,
        });
        if args.include_headers {
            output["headers"] = serde_json::Value::Object(headers);
        }

        Ok(ToolOutput::json(output))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn tool(domains: &[&str]) -> WebFetchTool {
        WebFetchTool::new(domains.iter().map(|d| d.to_string()).collect()).unwrap()
    }

    #[test]
    fn test_domain_allowlist() {
        let tool = tool(&["example.com", "data.gov.hk"]);

        assert!(tool.is_domain_allowed(&Url::parse("https://example.com/report").unwrap()));
        assert!(tool.is_domain_allowed(&Url::parse("https://www.data.gov.hk/x").unwrap()));

        assert!(!tool.is_domain_allowed(&Url::parse("https://evil.com").unwrap()));
        assert!(!tool.is_domain_allowed(&Url::parse("https://notexample.com").unwrap()));
    }

    #[test]
    fn test_empty_allowlist_permits_any_host() {
        let tool = tool(&[]);
        assert!(tool.is_domain_allowed(&Url::parse("https://anything.test").unwrap()));
    }

    #[tokio::test]
    async fn test_rejects_non_http_scheme() {
        let output = tool(&[])
            .execute(serde_json::json!({ "url": "file:///etc/passwd" }))
            .await
            .unwrap();
        assert!(output.is_error);
    }

    #[tokio::test]
    async fn test_fetches_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/table"))
            .respond_with(ResponseTemplate::new(200).set_body_string("year,revenue\n2024,10"))
            .mount(&server)
            .await;

        let output = tool(&[])
            .execute(serde_json::json!({ "url": format!("{}/table", server.uri()) }))
            .await
            .unwrap();

        assert!(!output.is_error);
        let value = output.into_value();
        assert_eq!(value["status"], 200);
        assert_eq!(value["body"], "year,revenue\n2024,10");
        assert_eq!(value["truncated"], false);
        assert!(value.get("headers").is_none());
    }

    #[tokio::test]
    async fn test_http_error_status_is_tool_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let output = tool(&[])
            .execute(serde_json::json!({ "url": format!("{}/missing", server.uri()) }))
            .await
            .unwrap();
        assert!(output.is_error);
    }

    #[tokio::test]
    async fn test_large_body_is_truncated() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("x".repeat(64)))
            .mount(&server)
            .await;

        let tool = WebFetchTool::with_limits(vec![], 16, Duration::from_secs(5)).unwrap();
        let value = tool
            .execute(serde_json::json!({ "url": server.uri(), "include_headers": true }))
            .await
            .unwrap()
            .into_value();

        assert_eq!(value["body"].as_str().unwrap().len(), 16);
        assert_eq!(value["truncated"], true);
        assert!(value["headers"].is_object());
    }

    #[tokio::test]
    async fn test_truncation_keeps_whole_characters() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("é".repeat(32)))
            .mount(&server)
            .await;

        let tool = WebFetchTool::with_limits(vec![], 15, Duration::from_secs(5)).unwrap();
        let value = tool
            .execute(serde_json::json!({ "url": server.uri() }))
            .await
            .unwrap()
            .into_value();

        assert_eq!(value["body"], "é".repeat(7));
        assert_eq!(value["truncated"], true);
    }
}
