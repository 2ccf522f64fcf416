//! HTTP language-model adapter.
//!
//! Speaks the OpenAI-compatible chat-completions dialect, which every
//! supported provider (OpenAI, OpenRouter, local gateways) exposes. The
//! declarative [`CompletionRequest`] is rendered into a system prompt
//! describing the fields plus a user message carrying the input values;
//! the model must answer with a single JSON object holding exactly the
//! declared output fields.

use std::time::Duration;

use async_trait::async_trait;
use backoff::ExponentialBackoffBuilder;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use crate::config::Settings;
use crate::core::lm::{
    CompletionRequest, FieldKind, LmClient, LmHandle, LmUsage, StructuredOutput,
};
use crate::error::{Error, Result};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);
const MAX_RETRY_ELAPSED: Duration = Duration::from_secs(60);

/// OpenAI-compatible chat-completions client.
pub struct HttpLm {
    model: String,
    base_url: String,
    api_key: SecretString,
    client: reqwest::Client,
}

impl HttpLm {
    pub fn new(
        model: impl Into<String>,
        base_url: impl Into<String>,
        api_key: SecretString,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()?;
        let base_url: String = base_url.into();
        Ok(HttpLm {
            model: model.into(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            client,
        })
    }

    fn render_system_prompt(request: &CompletionRequest) -> String {
        let mut out = String::from(
            "You complete structured tasks. You are given named input fields and must \
             respond with a single JSON object containing exactly the declared output \
             fields, and nothing else.\n\nInput fields:\n",
        );
        for field in &request.inputs {
            out.push_str(&format!("- {}: {}\n", field.name, field.description));
        }
        out.push_str("\nOutput fields (keys of the JSON object you must produce):\n");
        for field in &request.outputs {
            let kind = match field.kind {
                FieldKind::Text => "string",
                FieldKind::Bool => "boolean",
                FieldKind::Json => "object",
            };
            out.push_str(&format!("- {} ({}): {}\n", field.name, kind, field.description));
        }
        out
    }

    fn render_messages(request: &CompletionRequest) -> Vec<Value> {
        let mut messages = vec![json!({
            "role": "system",
            "content": Self::render_system_prompt(request),
        })];
        for example in &request.examples {
            messages.push(json!({
                "role": "user",
                "content": format!("Inputs:\n{}", example.inputs),
            }));
            messages.push(json!({
                "role": "assistant",
                "content": example.outputs.to_string(),
            }));
        }
        messages.push(json!({
            "role": "user",
            "content": format!("Inputs:\n{}", request.inputs_json()),
        }));
        messages
    }

    async fn send(&self, body: &Value) -> Result<ChatResponse> {
        let url = format!("{}/chat/completions", self.base_url);
        let backoff = ExponentialBackoffBuilder::new()
            .with_max_elapsed_time(Some(MAX_RETRY_ELAPSED))
            .build();

        let response = backoff::future::retry(backoff, || async {
            let mut builder = self.client.post(&url).json(body);
            if !self.api_key.expose_secret().is_empty() {
                builder = builder.bearer_auth(self.api_key.expose_secret());
            }
            let response = builder.send().await.map_err(|e| {
                warn!("LM request failed, retrying: {}", e);
                backoff::Error::transient(Error::from(e))
            })?;

            let status = response.status();
            if status.is_server_error() || status.as_u16() == 429 {
                warn!("LM returned {}, retrying", status);
                return Err(backoff::Error::transient(Error::Lm(format!(
                    "Provider returned {}",
                    status
                ))));
            }
            if !status.is_success() {
                let detail = response.text().await.unwrap_or_default();
                return Err(backoff::Error::permanent(Error::Lm(format!(
                    "Provider returned {}: {}",
                    status, detail
                ))));
            }
            response
                .json::<ChatResponse>()
                .await
                .map_err(|e| backoff::Error::permanent(Error::from(e)))
        })
        .await?;

        Ok(response)
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessageBody,
}

#[derive(Debug, Deserialize)]
struct ChatMessageBody {
    content: String,
}

#[derive(Debug, Default, Deserialize)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    #[serde(default)]
    cost: Option<f64>,
}

#[async_trait]
impl LmClient for HttpLm {
    fn model(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<(StructuredOutput, LmUsage)> {
        let body = json!({
            "model": self.model,
            "messages": Self::render_messages(request),
            "response_format": { "type": "json_object" },
        });

        debug!(module = %request.module, model = %self.model, "Sending LM completion");
        let response = self.send(&body).await?;

        let content = response
            .choices
            .first()
            .map(|c| c.message.content.as_str())
            .ok_or_else(|| Error::Lm("Provider returned no choices".into()))?;

        let parsed: Value = serde_json::from_str(content)
            .map_err(|e| Error::Lm(format!("Model did not return valid JSON: {}", e)))?;
        let Value::Object(mut fields) = parsed else {
            return Err(Error::Lm("Model did not return a JSON object".into()));
        };
        coerce_fields(&mut fields, request);

        let mut usage = LmUsage::new(&self.model, 0, 0);
        if let Some(u) = response.usage {
            usage.prompt_tokens = u.prompt_tokens;
            usage.completion_tokens = u.completion_tokens;
            usage.cost = u.cost.unwrap_or(0.0);
        }

        Ok((StructuredOutput(fields), usage))
    }
}

/// Nudge model output toward the declared field kinds.
fn coerce_fields(fields: &mut Map<String, Value>, request: &CompletionRequest) {
    for spec in &request.outputs {
        let Some(value) = fields.get_mut(&spec.name) else {
            continue;
        };
        let replacement = match (spec.kind, &*value) {
            (FieldKind::Bool, Value::String(s)) => Some(Value::Bool(matches!(
                s.to_ascii_lowercase().as_str(),
                "true" | "yes"
            ))),
            (FieldKind::Text, other) if !other.is_string() => {
                Some(Value::String(other.to_string()))
            }
            _ => None,
        };
        if let Some(replacement) = replacement {
            *value = replacement;
        }
    }
}

/// Base URL for a named provider.
pub fn provider_base_url(provider: &str, api_base: Option<&str>) -> Result<String> {
    match provider {
        "openai" => Ok(api_base.unwrap_or("https://api.openai.com/v1").to_string()),
        "openrouter" => Ok(api_base.unwrap_or("https://openrouter.ai/api/v1").to_string()),
        "ollama" | "local" => api_base.map(str::to_string).ok_or_else(|| {
            Error::Config(format!("Provider '{}' requires model_api_base", provider))
        }),
        other => api_base.map(str::to_string).ok_or_else(|| {
            Error::Config(format!(
                "Unknown provider '{}' requires model_api_base",
                other
            ))
        }),
    }
}

fn provider_api_key(settings: &Settings, provider: &str) -> SecretString {
    let key = settings
        .api_key(&format!("{}_apikey", provider))
        .or_else(|| settings.api_key(&format!("{}_api_key", provider)))
        .unwrap_or_default();
    SecretString::from(key.to_string())
}

/// Build the base LM from a settings snapshot.
pub fn load_base_lm(settings: &Settings) -> Result<LmHandle> {
    settings.ensure_base_lm()?;
    let provider = settings.base_provider.as_deref().unwrap_or_default();
    let model = settings.base_model.clone().unwrap_or_default();
    let base_url = provider_base_url(provider, settings.model_api_base.as_deref())?;
    let client = HttpLm::new(model, base_url, provider_api_key(settings, provider))?;
    Ok(LmHandle::new(std::sync::Arc::new(client)))
}

/// Build the complex LM from a settings snapshot.
pub fn load_complex_lm(settings: &Settings) -> Result<LmHandle> {
    settings.ensure_complex_lm()?;
    let provider = settings.complex_provider.as_deref().unwrap_or_default();
    let model = settings.complex_model.clone().unwrap_or_default();
    let base_url = provider_base_url(provider, settings.model_api_base.as_deref())?;
    let client = HttpLm::new(model, base_url, provider_api_key(settings, provider))?;
    Ok(LmHandle::new(std::sync::Arc::new(client)))
}
