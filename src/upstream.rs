use axum::http::StatusCode;
use reqwest::Response;
use serde_json::{Value, json};
use std::time::Duration;
use uuid::Uuid;

use crate::error::{AppError, AppResult};

pub const GEMINI_PUBLIC_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const GEMINI_PA_API_BASE: &str = "https://cloudcode-pa.googleapis.com/v1internal";

/// Thin HTTP client for the two Gemini surfaces: the public
/// generativelanguage API (key accounts) and the Cloud Code PA API (OAuth
/// accounts). Base URLs are injectable so tests can point at a local server.
#[derive(Clone)]
pub struct GeminiClient {
    http: reqwest::Client,
    public_base: String,
    pa_base: String,
}

impl GeminiClient {
    pub fn new(public_base: String, pa_base: String, timeout_ms: u64) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .build()
            .unwrap_or_default();
        Self {
            http,
            public_base,
            pa_base,
        }
    }

    /// Public API call, key in the query string. `body` must already have
    /// functionResponse ids stripped (the public API rejects them).
    pub async fn generate_with_key(
        &self,
        base_url: Option<&str>,
        api_key: &str,
        model: &str,
        body: &Value,
        stream: bool,
    ) -> AppResult<Response> {
        let base = base_url.unwrap_or(&self.public_base);
        let action = if stream {
            "streamGenerateContent"
        } else {
            "generateContent"
        };
        let mut url = format!("{base}/{}:{action}", qualify_model(model));
        if stream {
            url.push_str("?alt=sse");
        }
        let response = self
            .http
            .post(&url)
            .query(&[("key", api_key)])
            .json(body)
            .send()
            .await?;
        check_status(response).await
    }

    /// PA API call: bearer token, body wrapped in a `{model, request}`
    /// envelope, model name without the `models/` prefix.
    pub async fn generate_with_oauth(
        &self,
        access_token: &str,
        model: &str,
        body: &Value,
        stream: bool,
    ) -> AppResult<Response> {
        let action = if stream {
            "streamGenerateContent"
        } else {
            "generateContent"
        };
        let mut url = format!("{}:{action}", self.pa_base);
        if stream {
            url.push_str("?alt=sse");
        }
        let envelope = json!({
            "model": bare_model(model),
            "request": body,
            "userPromptId": format!("{}########0", Uuid::new_v4())
        });
        let response = self
            .http
            .post(&url)
            .bearer_auth(access_token)
            .json(&envelope)
            .send()
            .await?;
        check_status(response).await
    }

    pub async fn count_tokens_with_key(
        &self,
        base_url: Option<&str>,
        api_key: &str,
        model: &str,
        body: &Value,
    ) -> AppResult<Value> {
        let base = base_url.unwrap_or(&self.public_base);
        let url = format!("{base}/{}:countTokens", qualify_model(model));
        let response = self
            .http
            .post(&url)
            .query(&[("key", api_key)])
            .json(body)
            .send()
            .await?;
        let response = check_status(response).await?;
        Ok(response.json().await?)
    }

    pub async fn count_tokens_with_oauth(
        &self,
        access_token: &str,
        model: &str,
        body: &Value,
    ) -> AppResult<Value> {
        let url = format!("{}:countTokens", self.pa_base);
        let envelope = json!({
            "request": {
                "model": format!("models/{}", bare_model(model)),
                "contents": body.get("contents").cloned().unwrap_or_default()
            }
        });
        let response = self
            .http
            .post(&url)
            .bearer_auth(access_token)
            .json(&envelope)
            .send()
            .await?;
        let response = check_status(response).await?;
        Ok(response.json().await?)
    }
}

async fn check_status(response: Response) -> AppResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<Value>(&body)
        .ok()
        .and_then(|v| {
            v.pointer("/error/message")
                .and_then(|m| m.as_str())
                .map(|m| m.to_string())
        })
        .unwrap_or_else(|| format!("upstream returned {status}"));
    Err(AppError::upstream(
        StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::BAD_GATEWAY),
        message,
    ))
}

/// Public API paths want a namespaced model; already-qualified names pass.
fn qualify_model(model: &str) -> String {
    if model.starts_with("models/")
        || model.starts_with("publishers/")
        || model.starts_with("projects/")
    {
        model.to_string()
    } else {
        format!("models/{model}")
    }
}

fn bare_model(model: &str) -> &str {
    model.strip_prefix("models/").unwrap_or(model)
}

/// Strips `functionResponse.id` fields, which the public API rejects.
pub fn sanitize_for_api_key(body: &Value) -> Value {
    let mut body = body.clone();
    let Some(contents) = body.get_mut("contents").and_then(|c| c.as_array_mut()) else {
        return body;
    };
    for content in contents {
        let Some(parts) = content.get_mut("parts").and_then(|p| p.as_array_mut()) else {
            continue;
        };
        for part in parts {
            if let Some(fr) = part.get_mut("functionResponse").and_then(|f| f.as_object_mut()) {
                fr.remove("id");
                if let Some(inner) = fr.get_mut("response").and_then(|r| r.as_object_mut()) {
                    inner.remove("id");
                }
            }
        }
    }
    body
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn model_qualification() {
        assert_eq!(qualify_model("gemini-2.5-pro"), "models/gemini-2.5-pro");
        assert_eq!(qualify_model("models/gemini-2.5-pro"), "models/gemini-2.5-pro");
        assert_eq!(bare_model("models/gemini-2.5-pro"), "gemini-2.5-pro");
    }

    #[test]
    fn sanitize_strips_function_response_ids() {
        let body = json!({
            "contents": [{
                "role": "user",
                "parts": [{
                    "functionResponse": {
                        "id": "call_1",
                        "name": "lookup",
                        "response": { "id": "x", "result": "ok" }
                    }
                }]
            }]
        });
        let cleaned = sanitize_for_api_key(&body);
        let fr = &cleaned["contents"][0]["parts"][0]["functionResponse"];
        assert!(fr.get("id").is_none());
        assert!(fr["response"].get("id").is_none());
        assert_eq!(fr["name"], "lookup");
    }
}
