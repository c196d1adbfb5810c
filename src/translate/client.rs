//! Chat-completions translation backend.
//! Connection pooling via reqwest, a simple min-interval rate limiter, and
//! classification of HTTP failures into the translation error taxonomy.
//! Retries and timeouts are owned by the caller (`Translator`).

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::debug;

use super::TranslateError;
use crate::config::TranslatorConfig;

/// One translation request as sent to a backend.
#[derive(Debug, Clone)]
pub struct BackendRequest<'a> {
    pub text: &'a str,
    /// `"auto"` when unknown.
    pub source_lang: &'a str,
    pub target_lang: &'a str,
}

/// A remote translation engine. One call, no retries.
#[async_trait]
pub trait TranslationBackend: Send + Sync {
    async fn translate(&self, request: &BackendRequest<'_>) -> Result<String, TranslateError>;
}

/// Backend used when no API key is configured. Every call fails fast with a
/// non-retryable error so messages go out untranslated.
pub struct DisabledBackend;

#[async_trait]
impl TranslationBackend for DisabledBackend {
    async fn translate(&self, _request: &BackendRequest<'_>) -> Result<String, TranslateError> {
        Err(TranslateError::InvalidCredentials)
    }
}

/// OpenAI-compatible `/v1/chat/completions` client.
pub struct ChatCompletionClient {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    next_allowed: Arc<tokio::sync::Mutex<Instant>>,
    min_interval: Duration,
}

impl ChatCompletionClient {
    pub fn new(config: &TranslatorConfig) -> Result<Self, TranslateError> {
        let api_key = config
            .api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .or_else(|| std::env::var("TRANSLATOR_API_KEY").ok())
            .ok_or(TranslateError::InvalidCredentials)?;

        let http = reqwest::Client::builder()
            .pool_max_idle_per_host(8)
            .pool_idle_timeout(Duration::from_secs(90))
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| TranslateError::Network(e.to_string()))?;

        Ok(Self {
            http,
            api_key,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            next_allowed: Arc::new(tokio::sync::Mutex::new(Instant::now())),
            min_interval: Duration::from_millis(config.min_interval_ms),
        })
    }

    async fn rate_limit_wait(&self) {
        let mut next = self.next_allowed.lock().await;
        let now = Instant::now();
        if *next > now {
            tokio::time::sleep(*next - now).await;
        }
        *next = Instant::now() + self.min_interval;
    }
}

#[async_trait]
impl TranslationBackend for ChatCompletionClient {
    async fn translate(&self, request: &BackendRequest<'_>) -> Result<String, TranslateError> {
        self.rate_limit_wait().await;

        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": SYSTEM_PROMPT},
                {"role": "user", "content": build_user_prompt(request)}
            ],
            "max_tokens": estimate_max_tokens(request.text),
            "temperature": 0.1,
            "stream": false
        });

        let resp = self
            .http
            .post(format!("{}/v1/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let retry_after = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<u64>().ok());
            let text = resp.text().await.unwrap_or_default();
            return Err(classify_status(status, retry_after, &text));
        }

        let parsed: ChatResponse = resp.json().await?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|c| c.trim().to_string())
            .unwrap_or_default();
        if content.is_empty() {
            return Err(TranslateError::Unknown("empty completion".into()));
        }
        debug!(
            target_lang = request.target_lang,
            chars = content.chars().count(),
            "completion received"
        );
        Ok(content)
    }
}

/// Map a non-success HTTP status (plus body hints) to a failure class.
pub fn classify_status(status: StatusCode, retry_after_secs: Option<u64>, body: &str) -> TranslateError {
    let body_lc = body.to_ascii_lowercase();
    match status.as_u16() {
        401 | 403 => TranslateError::InvalidCredentials,
        402 => TranslateError::QuotaExceeded,
        429 if body_lc.contains("quota") => TranslateError::QuotaExceeded,
        429 => TranslateError::RateLimited {
            retry_after_ms: retry_after_secs.unwrap_or(0) * 1000,
        },
        408 => TranslateError::Timeout,
        413 => TranslateError::TextTooLong("payload rejected by translator".into()),
        400 | 422 if body_lc.contains("context_length") || body_lc.contains("too long") => {
            TranslateError::TextTooLong(body.chars().take(120).collect())
        }
        400 | 422 if body_lc.contains("language") => {
            TranslateError::UnsupportedLanguage(body.chars().take(120).collect())
        }
        s if status.is_server_error() => TranslateError::Server { status: s },
        s => TranslateError::Unknown(format!(
            "status {s}: {}",
            body.chars().take(200).collect::<String>()
        )),
    }
}

// --- Prompt construction ---

const SYSTEM_PROMPT: &str = "You are a translation engine. Reply with the translated text only: \
no commentary, no quotes, no notes. Leave <<PHn>> placeholders exactly as they are.";

fn build_user_prompt(request: &BackendRequest<'_>) -> String {
    let target = language_name(request.target_lang);
    if request.source_lang == "auto" {
        format!("Translate the following text to {target}:\n\n{}", request.text)
    } else {
        format!(
            "Translate the following text from {} to {target}:\n\n{}",
            language_name(request.source_lang),
            request.text
        )
    }
}

/// Token budget proportional to input: (chars/3 * 1.5 + 32), clamped to 64..=2048.
fn estimate_max_tokens(text: &str) -> u32 {
    let estimated_input_tokens = text.chars().count() as f64 / 3.0;
    let max = (estimated_input_tokens * 1.5 + 32.0) as u32;
    max.clamp(64, 2048)
}

fn language_name(code: &str) -> &str {
    match code {
        "en" => "English",
        "es" => "Spanish",
        "fr" => "French",
        "de" => "German",
        "pt" => "Portuguese",
        "it" => "Italian",
        "nl" => "Dutch",
        "ru" => "Russian",
        "uk" => "Ukrainian",
        "zh" => "Chinese",
        "ja" => "Japanese",
        "ko" => "Korean",
        "ar" => "Arabic",
        "hi" => "Hindi",
        "tr" => "Turkish",
        "pl" => "Polish",
        other => other,
    }
}

// --- Response types ---

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert!(matches!(
            classify_status(StatusCode::UNAUTHORIZED, None, ""),
            TranslateError::InvalidCredentials
        ));
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, Some(2), "slow down"),
            TranslateError::RateLimited { retry_after_ms: 2000 }
        ));
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, None, "You exceeded your current quota"),
            TranslateError::QuotaExceeded
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_REQUEST, None, "maximum context_length exceeded"),
            TranslateError::TextTooLong(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_REQUEST, None, "unsupported target language"),
            TranslateError::UnsupportedLanguage(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_GATEWAY, None, ""),
            TranslateError::Server { status: 502 }
        ));
        assert!(matches!(
            classify_status(StatusCode::NOT_FOUND, None, "no route"),
            TranslateError::Unknown(_)
        ));
    }

    #[test]
    fn token_budget_scales_with_input() {
        assert_eq!(estimate_max_tokens("hi"), 64);
        let long = "a".repeat(900);
        assert_eq!(estimate_max_tokens(&long), 482);
        assert_eq!(estimate_max_tokens(&"a".repeat(100_000)), 2048);
    }

    #[test]
    fn prompt_names_languages() {
        let req = BackendRequest {
            text: "Hello",
            source_lang: "en",
            target_lang: "es",
        };
        let prompt = build_user_prompt(&req);
        assert!(prompt.contains("from English to Spanish"));
        assert!(prompt.ends_with("Hello"));

        let auto = BackendRequest {
            source_lang: "auto",
            ..req
        };
        assert!(build_user_prompt(&auto).starts_with("Translate the following text to Spanish"));
    }

    #[test]
    fn completion_parsing() {
        let raw = r#"{"choices":[{"message":{"role":"assistant","content":"  Hola \n"}}]}"#;
        let parsed: ChatResponse = serde_json::from_str(raw).unwrap();
        let content = parsed.choices[0].message.content.as_deref().unwrap().trim();
        assert_eq!(content, "Hola");
    }

    #[tokio::test]
    async fn disabled_backend_fails_without_retry() {
        let req = BackendRequest {
            text: "Hello",
            source_lang: "en",
            target_lang: "es",
        };
        let err = DisabledBackend.translate(&req).await.unwrap_err();
        assert!(!err.is_retryable());
    }
}
