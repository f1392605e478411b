use super::{interpolate, ToolOutcome};
use crate::error::{CoreError, CoreResult};
use std::collections::HashMap;
use std::time::Duration;

const DEFAULT_TIMEOUT_MS: u64 = 30_000;

#[derive(Debug, Clone)]
pub struct HttpTool {
    pub method: String,
    pub url_template: String,
    pub body_template: Option<String>,
    pub timeout_ms: u64,
}

impl HttpTool {
    pub fn new(method: &str, url_template: &str) -> Self {
        Self {
            method: method.to_string(),
            url_template: url_template.to_string(),
            body_template: None,
            timeout_ms: DEFAULT_TIMEOUT_MS,
        }
    }

    pub async fn invoke(&self, params: &HashMap<String, String>) -> CoreResult<ToolOutcome> {
        let url = interpolate(&self.url_template, params);
        let body = self.body_template.as_ref().map(|t| interpolate(t, params));

        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(self.timeout_ms))
            .build()
            .map_err(|e| CoreError::ToolError(e.to_string()))?;

        let method = reqwest::Method::from_bytes(self.method.as_bytes())
            .map_err(|_| CoreError::Validation(format!("unsupported http method: {}", self.method)))?;

        let mut request = client.request(method, &url);
        if let Some(body) = body {
            request = request.body(body);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() || e.is_connect() {
                CoreError::TransientUpstream(e.to_string())
            } else {
                CoreError::ToolError(e.to_string())
            }
        })?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| CoreError::ToolError(e.to_string()))?;

        if !status.is_success() {
            return Ok(ToolOutcome {
                stdout: String::new(),
                stderr: format!("http {status}: {text}"),
                truncated: false,
            });
        }
        Ok(ToolOutcome {
            stdout: text,
            stderr: String::new(),
            truncated: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_template_is_interpolated() {
        let mut params = HashMap::new();
        params.insert("id".to_string(), "42".to_string());
        let tool = HttpTool::new("GET", "https://example.test/items/{{id}}");
        assert_eq!(
            super::super::interpolate(&tool.url_template, &params),
            "https://example.test/items/42"
        );
    }
}
