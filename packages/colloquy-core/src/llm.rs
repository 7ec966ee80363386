//! OpenAI-compatible chat client.
//!
//! One thin wrapper over the chat-completions endpoint, used for decision
//! extraction (function calling), the dedup probe, and meeting summaries.
//! The base URL is configurable so self-hosted gateways work unchanged.

use std::time::Duration;

use serde_json::{json, Value};

use crate::config::LlmConfig;
use crate::error::{ColloquyError, ColloquyResult};

#[derive(Clone, Debug)]
pub struct LlmClient {
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: String,
}

impl LlmClient {
    pub fn new(config: &LlmConfig) -> ColloquyResult<Self> {
        if config.api_key.is_empty() {
            return Err(ColloquyError::Configuration(
                "OPENAI_API_KEY is required for the decision listener".into(),
            ));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| ColloquyError::Configuration(format!("http client: {e}")))?;
        Ok(Self {
            client,
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| "https://api.openai.com".into())
                .trim_end_matches('/')
                .to_string(),
            model: config.model.clone(),
            api_key: config.api_key.clone(),
        })
    }

    /// Raw chat-completions call. `tools`/`tool_choice` are passed through
    /// when present.
    pub async fn chat(
        &self,
        messages: Value,
        tools: Option<Value>,
        tool_choice: Option<Value>,
        temperature: f64,
        max_tokens: u32,
    ) -> ColloquyResult<Value> {
        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "temperature": temperature,
            "max_tokens": max_tokens,
        });
        if let Some(tools) = tools {
            body["tools"] = json!([tools]);
        }
        if let Some(choice) = tool_choice {
            body["tool_choice"] = choice;
        }

        let response = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| ColloquyError::Llm(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ColloquyError::Llm(format!(
                "chat completion returned {status}: {}",
                body.chars().take(200).collect::<String>()
            )));
        }

        response
            .json()
            .await
            .map_err(|e| ColloquyError::Llm(format!("bad response body: {e}")))
    }

    /// Arguments of the first tool call in the response, parsed as JSON.
    /// `None` when the model did not call a tool.
    pub fn first_tool_call_args(response: &Value) -> Option<Value> {
        let raw = response["choices"][0]["message"]["tool_calls"][0]["function"]["arguments"]
            .as_str()?;
        serde_json::from_str(raw).ok()
    }

    /// Plain text content of the first choice.
    pub fn first_content(response: &Value) -> Option<&str> {
        response["choices"][0]["message"]["content"].as_str()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(base_url: &str) -> LlmConfig {
        LlmConfig {
            base_url: Some(base_url.to_string()),
            api_key: "test-key".into(),
            ..LlmConfig::default()
        }
    }

    #[test]
    fn missing_api_key_is_a_configuration_error() {
        let err = LlmClient::new(&LlmConfig::default()).unwrap_err();
        assert_eq!(err.code(), "configuration_error");
    }

    #[test]
    fn tool_call_arguments_are_extracted() {
        let response = json!({
            "choices": [{"message": {"tool_calls": [{"function": {
                "arguments": "{\"type\":\"decision\",\"summary\":\"Ship it\"}"
            }}]}}]
        });
        let args = LlmClient::first_tool_call_args(&response).unwrap();
        assert_eq!(args["type"], "decision");
    }

    #[test]
    fn missing_tool_call_yields_none() {
        let response = json!({"choices": [{"message": {"content": "hello"}}]});
        assert!(LlmClient::first_tool_call_args(&response).is_none());
        assert_eq!(LlmClient::first_content(&response), Some("hello"));
    }

    #[tokio::test]
    async fn upstream_error_is_surfaced_as_llm_error() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("POST", "/v1/chat/completions")
            .with_status(500)
            .with_body("boom")
            .create_async()
            .await;
        let client = LlmClient::new(&config(&server.url())).unwrap();
        let err = client
            .chat(json!([]), None, None, 0.1, 16)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "llm_error");
    }
}
