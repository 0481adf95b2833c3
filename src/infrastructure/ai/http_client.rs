//! HTTP implementation of the completion port.
//!
//! Speaks the Anthropic messages API: text prompt in, text response out,
//! with token usage for cost accounting. Connection pooling and
//! compression come from the shared reqwest client.

use async_trait::async_trait;
use reqwest::Client as ReqwestClient;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::domain::ports::{
    CompletionClient, CompletionError, CompletionRequest, CompletionResponse,
};

use super::error::classify_status;

#[derive(Debug, Serialize)]
struct MessageRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: Vec<Message<'a>>,
}

#[derive(Debug, Serialize)]
struct Message<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct MessageResponse {
    content: Vec<ContentBlock>,
    model: String,
    usage: Usage,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct Usage {
    input_tokens: u64,
    output_tokens: u64,
}

pub struct HttpCompletionClient {
    http: ReqwestClient,
    api_key: String,
    base_url: String,
    model: String,
}

impl HttpCompletionClient {
    pub fn new(
        api_key: String,
        base_url: String,
        model: String,
        request_timeout: Duration,
    ) -> Result<Self, CompletionError> {
        let http = ReqwestClient::builder()
            .timeout(request_timeout)
            .pool_max_idle_per_host(10)
            .tcp_nodelay(true)
            .build()
            .map_err(|e| CompletionError::Permanent(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            api_key,
            base_url,
            model,
        })
    }
}

#[async_trait]
impl CompletionClient for HttpCompletionClient {
    async fn complete(
        &self,
        request: CompletionRequest,
    ) -> Result<CompletionResponse, CompletionError> {
        let body = MessageRequest {
            model: &self.model,
            max_tokens: request.max_tokens,
            messages: vec![Message {
                role: "user",
                content: &request.prompt,
            }],
        };

        let response = self
            .http
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    CompletionError::DeadlineExceeded
                } else {
                    CompletionError::Transient(format!("network error: {e}"))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "failed to read error response".to_string());
            return Err(classify_status(status, body));
        }

        let parsed: MessageResponse = response
            .json()
            .await
            .map_err(|e| CompletionError::Transient(format!("failed to parse response: {e}")))?;

        let text = parsed
            .content
            .iter()
            .filter(|block| block.kind == "text")
            .map(|block| block.text.as_str())
            .collect::<Vec<_>>()
            .join("");

        Ok(CompletionResponse {
            text,
            model: parsed.model,
            input_tokens: parsed.usage.input_tokens,
            output_tokens: parsed.usage.output_tokens,
        })
    }
}
