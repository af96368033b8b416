//! LLM client seam.
//!
//! The engine talks to its model through the object-safe `LlmClient` trait;
//! production uses `OllamaClient` against a local Ollama instance, tests use
//! `MockLlmClient` with a scripted response queue and a call counter (the
//! zero-extra-LLM-call guarantees are asserted through that counter).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LlmError {
    #[error("LLM backend is not reachable at {0}")]
    Connection(String),

    #[error("LLM request timed out after {0}s")]
    Timeout(u64),

    #[error("LLM backend returned error (status {status}): {body}")]
    Provider { status: u16, body: String },

    #[error("HTTP client error: {0}")]
    HttpClient(String),

    #[error("Malformed LLM response: {0}")]
    MalformedResponse(String),
}

pub trait LlmClient: Send + Sync {
    /// One blocking completion call. `system` carries the taxonomy and
    /// client context, `prompt` the transaction material.
    fn complete(&self, system: &str, prompt: &str) -> Result<String, LlmError>;
}

/// Ollama HTTP client for local inference.
pub struct OllamaClient {
    base_url: String,
    model: String,
    client: reqwest::blocking::Client,
    timeout_secs: u64,
}

impl OllamaClient {
    pub fn new(base_url: &str, model: &str, timeout_secs: u64) -> Result<Self, LlmError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(std::time::Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| LlmError::HttpClient(e.to_string()))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            client,
            timeout_secs,
        })
    }

    /// Default local instance with a 5-minute timeout.
    pub fn default_local(model: &str) -> Result<Self, LlmError> {
        Self::new("http://localhost:11434", model, 300)
    }
}

/// Request body for Ollama /api/generate
#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    system: &'a str,
    stream: bool,
}

/// Response body from Ollama /api/generate
#[derive(Deserialize)]
struct GenerateResponse {
    response: String,
}

impl LlmClient for OllamaClient {
    fn complete(&self, system: &str, prompt: &str) -> Result<String, LlmError> {
        let url = format!("{}/api/generate", self.base_url);
        let body = GenerateRequest {
            model: &self.model,
            prompt,
            system,
            stream: false,
        };

        let response = self.client.post(&url).json(&body).send().map_err(|e| {
            if e.is_connect() {
                LlmError::Connection(self.base_url.clone())
            } else if e.is_timeout() {
                LlmError::Timeout(self.timeout_secs)
            } else {
                LlmError::HttpClient(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(LlmError::Provider {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: GenerateResponse = response
            .json()
            .map_err(|e| LlmError::MalformedResponse(e.to_string()))?;

        Ok(parsed.response)
    }
}

/// Scripted mock for tests. Responses are consumed front-to-back; an `Err`
/// script entry simulates a provider failure for retry-path tests.
pub struct MockLlmClient {
    script: Mutex<VecDeque<Result<String, String>>>,
    calls: AtomicUsize,
    prompts: Mutex<Vec<String>>,
}

impl MockLlmClient {
    pub fn new(responses: Vec<&str>) -> Self {
        Self {
            script: Mutex::new(responses.into_iter().map(|r| Ok(r.to_string())).collect()),
            calls: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn with_script(script: Vec<Result<String, String>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            calls: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Total `complete` calls observed so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Prompts received, in call order.
    pub fn recorded_prompts(&self) -> Vec<String> {
        self.prompts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl LlmClient for MockLlmClient {
    fn complete(&self, _system: &str, prompt: &str) -> Result<String, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(prompt.to_string());

        let next = self
            .script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();
        match next {
            Some(Ok(response)) => Ok(response),
            Some(Err(message)) => Err(LlmError::Provider {
                status: 500,
                body: message,
            }),
            None => Err(LlmError::MalformedResponse(
                "mock script exhausted".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_client_consumes_script_in_order() {
        let client = MockLlmClient::new(vec!["first", "second"]);
        assert_eq!(client.complete("s", "p1").unwrap(), "first");
        assert_eq!(client.complete("s", "p2").unwrap(), "second");
        assert_eq!(client.calls(), 2);
        assert_eq!(client.recorded_prompts(), ["p1", "p2"]);
    }

    #[test]
    fn mock_client_scripted_failure_maps_to_provider_error() {
        let client = MockLlmClient::with_script(vec![Err("boom".into())]);
        match client.complete("s", "p") {
            Err(LlmError::Provider { status, body }) => {
                assert_eq!(status, 500);
                assert_eq!(body, "boom");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn exhausted_script_is_an_error_not_a_panic() {
        let client = MockLlmClient::new(vec![]);
        assert!(client.complete("s", "p").is_err());
        assert_eq!(client.calls(), 1);
    }

    #[test]
    fn ollama_client_trims_trailing_slash() {
        let client = OllamaClient::new("http://localhost:11434/", "llama3", 60).unwrap();
        assert_eq!(client.base_url, "http://localhost:11434");
        assert_eq!(client.timeout_secs, 60);
    }
}
