//! Translation pipeline: cache → language detector → remote backend.
//! The backend call is bounded by a per-call timeout and retried with backoff
//! for retryable failures. A translation never fails for backend reasons: once
//! retries are spent the original text comes back with confidence 0.

pub mod cache;
pub mod client;
pub mod detect;
pub mod error;
pub mod normalize;
pub mod sqlite_cache;

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, warn};

use crate::metrics::{metric_names, MetricsRegistry};
use crate::retry::RetryPolicy;

use cache::TranslationCache;
use client::{BackendRequest, TranslationBackend};
use detect::{same_language, LanguageDetector};
use normalize::PlaceholderProtector;

pub use error::{ErrorKind, TranslateError};

pub const AUTO: &str = "auto";
pub const UNKNOWN_LANGUAGE: &str = "unknown";
const PASS_THROUGH_CONFIDENCE: f64 = 0.95;

/// Where a translation came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TranslationOrigin {
    Cache,
    /// Text already in the target language; no backend call.
    PassThrough,
    Backend,
    /// Backend failed; text is the original.
    Fallback,
}

/// Why a fallback happened.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TranslationFailure {
    pub kind: ErrorKind,
    pub retryable: bool,
    pub fallback_available: bool,
    pub message: String,
}

impl From<&TranslateError> for TranslationFailure {
    fn from(e: &TranslateError) -> Self {
        Self {
            kind: e.kind(),
            retryable: e.is_retryable(),
            fallback_available: e.fallback_available(),
            message: e.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Translation {
    pub translated_text: String,
    pub detected_language: String,
    pub confidence: f64,
    pub origin: TranslationOrigin,
    pub failure: Option<TranslationFailure>,
}

#[derive(Debug, Clone)]
pub struct TranslatorOptions {
    pub timeout: Duration,
    pub retry: RetryPolicy,
    /// Results must score above this to be cached.
    pub min_cache_confidence: f64,
    pub max_text_chars: usize,
}

impl Default for TranslatorOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            retry: RetryPolicy::default(),
            min_cache_confidence: 0.5,
            max_text_chars: 4_000,
        }
    }
}

pub struct Translator {
    backend: Arc<dyn TranslationBackend>,
    cache: Arc<TranslationCache>,
    detector: LanguageDetector,
    protector: PlaceholderProtector,
    options: TranslatorOptions,
    metrics: Arc<MetricsRegistry>,
}

impl Translator {
    pub fn new(
        backend: Arc<dyn TranslationBackend>,
        cache: Arc<TranslationCache>,
        options: TranslatorOptions,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            backend,
            cache,
            detector: LanguageDetector::new(),
            protector: PlaceholderProtector::new(),
            options,
            metrics,
        }
    }

    pub fn cache(&self) -> &Arc<TranslationCache> {
        &self.cache
    }

    pub fn detector(&self) -> &LanguageDetector {
        &self.detector
    }

    /// Translate `text` into `target_lang`. `source_lang` of `None` or
    /// `"auto"` means unknown. Only invalid input is reported as an error.
    pub async fn translate(
        &self,
        text: &str,
        target_lang: &str,
        source_lang: Option<&str>,
    ) -> Result<Translation, TranslateError> {
        if text.trim().is_empty() {
            return Err(TranslateError::InvalidInput("text is empty".into()));
        }
        let target_lang = target_lang.trim();
        if target_lang.is_empty() {
            return Err(TranslateError::InvalidInput("target language is missing".into()));
        }
        let source_lang = source_lang
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(AUTO);

        let _timer = self.metrics.timer(metric_names::TRANSLATE_TOTAL);

        if let Some(hit) = self.cache.get(text, source_lang, target_lang).await {
            let detected_language = if source_lang == AUTO {
                self.detector.detect(text).language
            } else {
                source_lang.to_string()
            };
            return Ok(Translation {
                translated_text: hit.translated_text,
                detected_language,
                confidence: hit.confidence,
                origin: TranslationOrigin::Cache,
                failure: None,
            });
        }

        let detection = self.detector.detect(text);
        let declared_same = source_lang != AUTO && same_language(source_lang, target_lang);
        if declared_same || same_language(&detection.language, target_lang) {
            debug!(target_lang, detected = %detection.language, "already in target language");
            self.cache
                .put(text, text, source_lang, target_lang, PASS_THROUGH_CONFIDENCE);
            return Ok(Translation {
                translated_text: text.to_string(),
                detected_language: detection.language,
                confidence: PASS_THROUGH_CONFIDENCE,
                origin: TranslationOrigin::PassThrough,
                failure: None,
            });
        }

        let chars = text.chars().count();
        let outcome = if chars > self.options.max_text_chars {
            Err(TranslateError::TextTooLong(format!(
                "{chars} chars, limit {}",
                self.options.max_text_chars
            )))
        } else {
            self.call_backend(text, source_lang, target_lang).await
        };

        match outcome {
            Ok(translated_text) => {
                let confidence = score_confidence(text, &translated_text);
                if confidence > self.options.min_cache_confidence {
                    self.cache
                        .put(text, &translated_text, source_lang, target_lang, confidence);
                }
                Ok(Translation {
                    translated_text,
                    detected_language: detection.language,
                    confidence,
                    origin: TranslationOrigin::Backend,
                    failure: None,
                })
            }
            Err(e) => {
                warn!(
                    target_lang,
                    kind = ?e.kind(),
                    error = %e,
                    "translation failed, falling back to original text"
                );
                Ok(Translation {
                    translated_text: text.to_string(),
                    detected_language: UNKNOWN_LANGUAGE.to_string(),
                    confidence: 0.0,
                    origin: TranslationOrigin::Fallback,
                    failure: Some(TranslationFailure::from(&e)),
                })
            }
        }
    }

    async fn call_backend(
        &self,
        text: &str,
        source_lang: &str,
        target_lang: &str,
    ) -> Result<String, TranslateError> {
        let (protected, placeholders) = self.protector.protect(text);
        let request = BackendRequest {
            text: &protected,
            source_lang,
            target_lang,
        };
        let timeout = self.options.timeout;

        let translated = self
            .options
            .retry
            .run_with_hint(
                |attempt| {
                    let request = &request;
                    async move {
                        let start = Instant::now();
                        let result =
                            match tokio::time::timeout(timeout, self.backend.translate(request)).await {
                                Ok(result) => result,
                                Err(_) => Err(TranslateError::Timeout),
                            };
                        self.metrics
                            .record(metric_names::TRANSLATE_BACKEND, start.elapsed());
                        if let Err(e) = &result {
                            debug!(attempt, error = %e, "backend attempt failed");
                        }
                        result
                    }
                },
                TranslateError::is_retryable,
                TranslateError::retry_after,
            )
            .await?;

        Ok(self.protector.restore(&translated, &placeholders))
    }
}

/// 0.95 when the text came back unchanged, 0.5 when the length ratio is
/// implausible (below 0.3 or above 3), 0.85 otherwise.
pub fn score_confidence(original: &str, translated: &str) -> f64 {
    if original.trim() == translated.trim() {
        return 0.95;
    }
    let original_len = original.chars().count().max(1) as f64;
    let ratio = translated.chars().count() as f64 / original_len;
    if !(0.3..=3.0).contains(&ratio) {
        0.5
    } else {
        0.85
    }
}
