//! OpenAI-compatible HTTP client for chat completions and model listing.

use async_trait::async_trait;
use serde_json::json;

use maestro_config::LlmConfig;
use maestro_core::{Error, ErrorKind, Result};

use crate::{ChatOutcome, ChatRequest, ChatRole, LlmTransport, ModelRecord};

#[derive(Debug, Clone)]
pub struct EndpointClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl EndpointClient {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|err| Error::config(format!("build http client: {err}")))?;
        Ok(Self {
            client,
            base_url: config.endpoint.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if self.api_key.is_empty() {
            request
        } else {
            request.bearer_auth(&self.api_key)
        }
    }
}

/// Map an HTTP status to the taxonomy: 429 is "busy, retriable", anything
/// else non-2xx means the endpoint cannot serve this request right now.
fn status_error(status: reqwest::StatusCode, body: &str) -> Error {
    let snippet: String = body.chars().take(200).collect();
    if status.as_u16() == 429 {
        Error::new(ErrorKind::LlmRateLimited, format!("endpoint busy (429): {snippet}"))
    } else {
        Error::new(
            ErrorKind::LlmUnavailable,
            format!("endpoint error ({status}): {snippet}"),
        )
    }
}

#[async_trait]
impl LlmTransport for EndpointClient {
    async fn chat_completion(&self, model: &str, request: &ChatRequest) -> Result<ChatOutcome> {
        let messages: Vec<serde_json::Value> = request
            .messages
            .iter()
            .map(|message| {
                let role = match message.role {
                    ChatRole::System => "system",
                    ChatRole::User => "user",
                    ChatRole::Assistant => "assistant",
                };
                json!({ "role": role, "content": message.content })
            })
            .collect();

        let mut payload = json!({ "model": model, "messages": messages });
        if let Some(temperature) = request.temperature {
            payload["temperature"] = json!(temperature);
        }
        if let Some(max_tokens) = request.max_tokens {
            payload["max_tokens"] = json!(max_tokens);
        }
        if request.json_response {
            payload["response_format"] = json!({ "type": "json_object" });
        }

        let response = self
            .authorized(self.client.post(self.url("/v1/chat/completions")))
            .json(&payload)
            .send()
            .await
            .map_err(|err| {
                Error::new(ErrorKind::LlmUnavailable, format!("request failed: {err}"))
            })?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(status_error(status, &body));
        }

        let parsed: serde_json::Value = serde_json::from_str(&body)
            .map_err(|err| Error::new(ErrorKind::LlmParse, format!("invalid JSON body: {err}")))?;
        let choice = parsed
            .get("choices")
            .and_then(|choices| choices.get(0))
            .ok_or_else(|| Error::new(ErrorKind::LlmParse, "response has no choices"))?;
        let content = choice
            .pointer("/message/content")
            .and_then(serde_json::Value::as_str)
            .unwrap_or("")
            .to_string();
        let finish_reason = choice
            .get("finish_reason")
            .and_then(serde_json::Value::as_str)
            .unwrap_or("stop")
            .to_string();

        Ok(ChatOutcome {
            model: model.to_string(),
            content,
            finish_reason,
            fallback: false,
        })
    }

    async fn list_models(&self) -> Result<Vec<ModelRecord>> {
        let response = self
            .authorized(self.client.get(self.url("/v1/models")))
            .send()
            .await
            .map_err(|err| {
                Error::new(ErrorKind::LlmUnavailable, format!("request failed: {err}"))
            })?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(status_error(status, &body));
        }

        let parsed: serde_json::Value = serde_json::from_str(&body)
            .map_err(|err| Error::new(ErrorKind::LlmParse, format!("invalid JSON body: {err}")))?;
        let records = parsed
            .get("data")
            .and_then(serde_json::Value::as_array)
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(|entry| serde_json::from_value(entry.clone()).ok())
                    .collect()
            })
            .unwrap_or_default();
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        let busy = status_error(reqwest::StatusCode::TOO_MANY_REQUESTS, "slow down");
        assert_eq!(busy.kind(), ErrorKind::LlmRateLimited);

        let down = status_error(reqwest::StatusCode::BAD_GATEWAY, "upstream died");
        assert_eq!(down.kind(), ErrorKind::LlmUnavailable);
    }

    #[test]
    fn model_record_parses_rate_limit_block() {
        let value = json!({
            "id": "gpt-4o-mini",
            "provider": "openai",
            "rate_limit": {
                "per_minute": 60,
                "adaptive_hard_cap": false,
                "adaptive_last429_at": 1700000000.0,
                "window_seconds": 30
            }
        });
        let record: ModelRecord = serde_json::from_value(value).unwrap();
        let info = record.rate_limit_info.unwrap();
        assert_eq!(info.per_minute, Some(60));
        assert_eq!(info.window_seconds, Some(30));
    }
}
