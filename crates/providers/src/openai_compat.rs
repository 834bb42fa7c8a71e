//! OpenAI-compatible adapter.
//!
//! Works with OpenAI, Ollama, vLLM, LM Studio, Together, and any other
//! endpoint that follows the OpenAI chat completions streaming contract.

use crate::traits::{Backend, ChunkStream, TurnContext};
use crate::util::from_reqwest;
use futures_util::StreamExt;
use serde_json::{json, Value};
use tg_domain::config::BackendConfig;
use tg_domain::error::{Error, Result};
use tg_domain::message::ChatMessage;
use tg_domain::stream::BackendChunk;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Adapter struct
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct OpenAiCompatBackend {
    id: String,
    base_url: String,
    api_key: Option<String>,
    model: String,
    system_prompt: Option<String>,
    client: reqwest::Client,
}

impl OpenAiCompatBackend {
    /// Build the adapter from config.  The API key is read from
    /// `api_key_env` now; a missing key is allowed (local servers such as
    /// Ollama do not need one).
    pub fn from_config(cfg: &BackendConfig) -> Result<Self> {
        let base_url = cfg
            .base_url
            .as_deref()
            .filter(|u| !u.is_empty())
            .ok_or_else(|| Error::Config("openai_compat backend requires base_url".into()))?
            .trim_end_matches('/')
            .to_owned();

        let api_key = std::env::var(&cfg.api_key_env)
            .ok()
            .filter(|k| !k.is_empty());
        if api_key.is_none() {
            tracing::warn!(
                env = %cfg.api_key_env,
                "no API key found; sending unauthenticated requests"
            );
        }

        let client = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(10))
            .build()
            .map_err(from_reqwest)?;

        Ok(Self {
            id: format!("openai_compat/{}", cfg.model),
            base_url,
            api_key,
            model: cfg.model.clone(),
            system_prompt: cfg.system_prompt.clone(),
            client,
        })
    }

    fn build_chat_body(&self, ctx: &TurnContext) -> Value {
        let mut messages: Vec<Value> = Vec::with_capacity(ctx.history.len() + 2);
        if let Some(prompt) = &self.system_prompt {
            messages.push(json!({"role": "system", "content": prompt}));
        }
        messages.extend(ctx.history.iter().map(msg_to_openai));
        messages.push(json!({"role": "user", "content": ctx.user_message}));

        json!({
            "model": self.model,
            "messages": messages,
            "stream": true,
        })
    }
}

fn msg_to_openai(msg: &ChatMessage) -> Value {
    json!({"role": msg.role.as_str(), "content": msg.content})
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// SSE payload parsing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, PartialEq)]
enum Delta {
    Text(String),
    Finish(String),
    End,
    Skip,
}

fn parse_sse_data(data: &str) -> Result<Delta> {
    if data.trim() == "[DONE]" {
        return Ok(Delta::End);
    }

    let v: Value = serde_json::from_str(data)?;
    if let Some(err) = v.get("error") {
        let message = err
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown upstream error");
        return Err(Error::backend("openai_compat", message));
    }

    let Some(choice) = v
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|a| a.first())
    else {
        // Usage-only chunk.
        return Ok(Delta::Skip);
    };

    if let Some(fr) = choice.get("finish_reason").and_then(Value::as_str) {
        return Ok(Delta::Finish(fr.to_owned()));
    }

    match choice
        .get("delta")
        .and_then(|d| d.get("content"))
        .and_then(Value::as_str)
    {
        Some(text) if !text.is_empty() => Ok(Delta::Text(text.to_owned())),
        _ => Ok(Delta::Skip),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Trait implementation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait::async_trait]
impl Backend for OpenAiCompatBackend {
    async fn generate(&self, ctx: TurnContext) -> Result<ChunkStream> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = self.build_chat_body(&ctx);

        tracing::debug!(
            backend = %self.id,
            url = %url,
            history = ctx.history.len(),
            "openai_compat stream request"
        );

        let mut req = self.client.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let resp = req.send().await.map_err(from_reqwest)?;

        let status = resp.status();
        if !status.is_success() {
            let err_text = resp.text().await.map_err(from_reqwest)?;
            return Err(Error::backend(
                self.id.clone(),
                format!("HTTP {} - {}", status.as_u16(), err_text),
            ));
        }

        let model = self.model.clone();
        let mut data = crate::sse::sse_data_stream(resp);

        let stream = async_stream::stream! {
            let mut content = String::new();
            let mut finish_reason: Option<String> = None;

            while let Some(item) = data.next().await {
                let delta = match item.and_then(|payload| parse_sse_data(&payload)) {
                    Ok(delta) => delta,
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                };
                match delta {
                    Delta::Text(text) => {
                        content.push_str(&text);
                        yield Ok(BackendChunk::Token { text });
                    }
                    Delta::Finish(fr) => finish_reason = Some(fr),
                    Delta::End => break,
                    Delta::Skip => {}
                }
            }

            yield Ok(BackendChunk::Done {
                content,
                metadata: Some(json!({
                    "model": model,
                    "finish_reason": finish_reason,
                })),
            });
        };

        Ok(Box::pin(stream))
    }

    fn backend_id(&self) -> &str {
        &self.id
    }
}
