//! HTTP transport to the Gemini-style upstream APIs. The core hands this a
//! canonical operation, a key, and a payload; connection details live here.

use std::time::Duration;

use futures_util::stream::BoxStream;
use reqwest::Method;
use serde_json::Value;

use crate::sse;
use crate::{RelayError, Result};

const MAX_ERROR_BODY_BYTES: usize = 4096;

/// How a credential family authenticates: the native API takes a header, the
/// vertex express API takes a `key` query parameter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyAuth {
    GoogHeader,
    QueryParam,
}

#[derive(Clone)]
pub struct GeminiClient {
    base_url: String,
    auth: KeyAuth,
    client: reqwest::Client,
}

impl GeminiClient {
    pub fn new(base_url: impl Into<String>, auth: KeyAuth, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            auth,
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: Method, path: &str, api_key: &str) -> reqwest::RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        let req = self.client.request(method, url);
        match self.auth {
            KeyAuth::GoogHeader => req.header("x-goog-api-key", api_key),
            KeyAuth::QueryParam => req.query(&[("key", api_key)]),
        }
    }

    async fn post_json(&self, path: &str, api_key: &str, payload: &Value) -> Result<Value> {
        let response = self
            .request(Method::POST, path, api_key)
            .json(payload)
            .send()
            .await?;
        into_json(response).await
    }

    pub async fn generate_content(
        &self,
        model: &str,
        api_key: &str,
        payload: &Value,
    ) -> Result<Value> {
        self.post_json(&format!("/models/{model}:generateContent"), api_key, payload)
            .await
    }

    /// Open the streaming generate endpoint and return its SSE `data` events.
    /// Non-2xx responses surface as [`RelayError::Api`] before any event is
    /// produced, so callers can still fail over to another key.
    pub async fn stream_generate_content(
        &self,
        model: &str,
        api_key: &str,
        payload: &Value,
    ) -> Result<BoxStream<'static, Result<String>>> {
        let response = self
            .request(
                Method::POST,
                &format!("/models/{model}:streamGenerateContent"),
                api_key,
            )
            .query(&[("alt", "sse")])
            .json(payload)
            .send()
            .await?;
        let response = error_for_status(response).await?;
        Ok(sse::sse_events_from_response(response))
    }

    pub async fn count_tokens(&self, model: &str, api_key: &str, payload: &Value) -> Result<Value> {
        self.post_json(&format!("/models/{model}:countTokens"), api_key, payload)
            .await
    }

    pub async fn batch_embed(&self, model: &str, api_key: &str, payload: &Value) -> Result<Value> {
        self.post_json(
            &format!("/models/{model}:batchEmbedContents"),
            api_key,
            payload,
        )
        .await
    }

    pub async fn predict(&self, model: &str, api_key: &str, payload: &Value) -> Result<Value> {
        self.post_json(&format!("/models/{model}:predict"), api_key, payload)
            .await
    }

    pub async fn list_models(&self, api_key: &str) -> Result<Value> {
        let response = self.request(Method::GET, "/models", api_key).send().await?;
        into_json(response).await
    }
}

async fn error_for_status(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(RelayError::Api {
        status,
        body: truncate_body(body),
    })
}

async fn into_json(response: reqwest::Response) -> Result<Value> {
    let response = error_for_status(response).await?;
    Ok(response.json().await?)
}

fn truncate_body(mut body: String) -> String {
    if body.len() <= MAX_ERROR_BODY_BYTES {
        return body;
    }
    let mut cut = MAX_ERROR_BODY_BYTES;
    while !body.is_char_boundary(cut) {
        cut -= 1;
    }
    body.truncate(cut);
    body
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_body_respects_char_boundaries() {
        let body = "é".repeat(MAX_ERROR_BODY_BYTES);
        let truncated = truncate_body(body);
        assert!(truncated.len() <= MAX_ERROR_BODY_BYTES);
        assert!(truncated.chars().all(|c| c == 'é'));
    }
}
