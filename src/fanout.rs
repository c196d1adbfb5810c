//! Message fan-out: persist, echo to the sender, then translate and push a
//! per-recipient rendering to every other member concurrently.
//!
//! Recipients are grouped by preferred language. Each group costs one
//! translation and pushes as soon as it is ready, so a slow language never
//! holds back the others.
//!
//! Stages per send: Received → Persisted → SenderNotified → Translating →
//! Delivered | PartiallyDelivered. Only validation and persistence failures
//! reach the caller; every recipient gets a message even when translation
//! fails.

use std::sync::Arc;

use futures_util::future::join_all;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::broadcast::{ConnectionRegistry, DeliveryReport};
use crate::error::SendError;
use crate::metrics::{metric_names, MetricsRegistry};
use crate::protocol::{NewMessagePayload, PushEvent};
use crate::store::{Member, MemberDirectory, Message, MessageStore};
use crate::translate::detect::same_language;
use crate::translate::{ErrorKind, Translator, AUTO};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SendStage {
    Received,
    Persisted,
    SenderNotified,
    Translating,
    Delivered,
    PartiallyDelivered,
}

impl SendStage {
    pub fn can_transition_to(self, next: SendStage) -> bool {
        matches!(
            (self, next),
            (SendStage::Received, SendStage::Persisted)
                | (SendStage::Persisted, SendStage::SenderNotified)
                | (SendStage::SenderNotified, SendStage::Translating)
                // member lookup failed after the sender was notified
                | (SendStage::SenderNotified, SendStage::PartiallyDelivered)
                | (SendStage::Translating, SendStage::Delivered)
                | (SendStage::Translating, SendStage::PartiallyDelivered)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SendStage::Delivered | SendStage::PartiallyDelivered)
    }
}

/// Stage of one send, logged on every move.
struct StageTracker {
    conversation_id: String,
    stage: SendStage,
}

impl StageTracker {
    fn new(conversation_id: &str) -> Self {
        Self {
            conversation_id: conversation_id.to_string(),
            stage: SendStage::Received,
        }
    }

    fn advance(&mut self, next: SendStage) {
        if !self.stage.can_transition_to(next) {
            warn!(
                conversation_id = %self.conversation_id,
                from = ?self.stage,
                to = ?next,
                "invalid send stage transition"
            );
            return;
        }
        debug!(conversation_id = %self.conversation_id, from = ?self.stage, to = ?next, "send stage");
        self.stage = next;
    }
}

#[derive(Debug, Clone)]
pub struct SendMessageRequest {
    pub conversation_id: String,
    pub sender_id: String,
    pub content: String,
    /// `None` or `"auto"` lets the detector decide.
    pub source_language: Option<String>,
}

/// What one recipient is shown.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Rendering {
    pub recipient_id: String,
    pub display_text: String,
    pub is_translated: bool,
    pub target_language: String,
    pub detected_language: String,
    /// `None` when no translation was needed.
    pub confidence: Option<f64>,
    pub translation_unavailable: bool,
    pub translation_error: Option<ErrorKind>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecipientOutcome {
    pub rendering: Rendering,
    pub delivery: DeliveryReport,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendReport {
    pub message_id: Uuid,
    pub final_stage: SendStage,
    /// One per `send_to_user` call: the sender plus every recipient.
    pub delivery_attempts: usize,
    pub sender: DeliveryReport,
    pub recipients: Vec<RecipientOutcome>,
}

pub struct FanoutOrchestrator {
    store: Arc<dyn MessageStore>,
    directory: Arc<dyn MemberDirectory>,
    translator: Arc<Translator>,
    registry: Arc<ConnectionRegistry>,
    metrics: Arc<MetricsRegistry>,
    /// Translations must score above this to be shown.
    min_confidence: f64,
}

impl FanoutOrchestrator {
    pub fn new(
        store: Arc<dyn MessageStore>,
        directory: Arc<dyn MemberDirectory>,
        translator: Arc<Translator>,
        registry: Arc<ConnectionRegistry>,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            store,
            directory,
            translator,
            registry,
            metrics,
            min_confidence: 0.5,
        }
    }

    pub fn with_min_confidence(mut self, min_confidence: f64) -> Self {
        self.min_confidence = min_confidence;
        self
    }

    pub async fn send_message(
        &self,
        request: SendMessageRequest,
    ) -> Result<(Message, SendReport), SendError> {
        let _timer = self.metrics.timer(metric_names::FANOUT_TOTAL);
        let mut tracker = StageTracker::new(&request.conversation_id);

        if request.conversation_id.trim().is_empty() {
            return Err(SendError::Validation("conversation id is missing".into()));
        }
        if request.content.trim().is_empty() {
            return Err(SendError::Validation("content is empty".into()));
        }

        let source_language = match request
            .source_language
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty() && !s.eq_ignore_ascii_case(AUTO))
        {
            Some(lang) => lang.to_string(),
            None => self.translator.detector().detect(&request.content).language,
        };

        let message = self
            .store
            .persist_message(
                &request.conversation_id,
                &request.sender_id,
                &request.content,
                &source_language,
            )
            .await?;
        tracker.advance(SendStage::Persisted);

        let sender_name = match self.directory.user_by_id(&message.sender_id).await {
            Ok(user) => user.display_name,
            Err(e) => {
                debug!(sender_id = %message.sender_id, error = %e, "sender profile unavailable");
                message.sender_id.clone()
            }
        };

        let echo = original_payload(&message, &sender_name);
        let sender = self
            .registry
            .send_to_user(&message.sender_id, PushEvent::new_message(&echo));
        tracker.advance(SendStage::SenderNotified);

        let members = match self
            .directory
            .conversation_members(&message.conversation_id)
            .await
        {
            Ok(members) => members,
            Err(e) => {
                warn!(
                    conversation_id = %message.conversation_id,
                    message_id = %message.id,
                    error = %e,
                    "member lookup failed, only the sender was notified"
                );
                tracker.advance(SendStage::PartiallyDelivered);
                let report = SendReport {
                    message_id: message.id,
                    final_stage: tracker.stage,
                    delivery_attempts: 1,
                    sender,
                    recipients: Vec::new(),
                };
                return Ok((message, report));
            }
        };

        tracker.advance(SendStage::Translating);
        let groups = group_by_language(
            members.iter().filter(|m| m.user_id != message.sender_id),
        );
        let units = groups
            .iter()
            .map(|group| self.deliver_to_group(group, &message, &sender_name));
        let recipients: Vec<RecipientOutcome> =
            join_all(units).await.into_iter().flatten().collect();

        let failed = sender.failed > 0 || recipients.iter().any(|r| r.delivery.failed > 0);
        tracker.advance(if failed {
            SendStage::PartiallyDelivered
        } else {
            SendStage::Delivered
        });

        let translated = recipients
            .iter()
            .filter(|r| r.rendering.is_translated)
            .count();
        info!(
            conversation_id = %message.conversation_id,
            message_id = %message.id,
            recipients = recipients.len(),
            translated,
            stage = ?tracker.stage,
            "message fanned out"
        );

        let report = SendReport {
            message_id: message.id,
            final_stage: tracker.stage,
            delivery_attempts: 1 + recipients.len(),
            sender,
            recipients,
        };
        Ok((message, report))
    }

    /// Translate once for a group of members sharing a language, then push
    /// to each. Never fails: the worst case is the original text with a
    /// translation-unavailable marker.
    async fn deliver_to_group(
        &self,
        group: &[&Member],
        message: &Message,
        sender_name: &str,
    ) -> Vec<RecipientOutcome> {
        let Some(first) = group.first() else {
            return Vec::new();
        };
        let _timer = self.metrics.timer(metric_names::RECIPIENT_UNIT);
        let shared = self.render_for(first, message).await;

        let mut payload = original_payload(message, sender_name);
        payload.content = shared.display_text.clone();
        payload.is_translated = shared.is_translated;
        payload.confidence = shared.confidence;
        payload.translation_unavailable = shared.translation_unavailable;
        payload.translation_error = shared.translation_error;
        if shared.is_translated {
            payload.translated_content = Some(shared.display_text.clone());
            payload.target_language = Some(shared.target_language.clone());
        }
        let fault = shared
            .translation_error
            .filter(|kind| !kind.fallback_available());

        group
            .iter()
            .map(|member| {
                let delivery = self
                    .registry
                    .send_to_user(&member.user_id, PushEvent::new_message(&payload));
                if let Some(kind) = fault {
                    self.registry.send_to_user(
                        &member.user_id,
                        PushEvent::translation_error(&payload.id, kind, &shared.target_language),
                    );
                }
                RecipientOutcome {
                    rendering: Rendering {
                        recipient_id: member.user_id.clone(),
                        ..shared.clone()
                    },
                    delivery,
                }
            })
            .collect()
    }

    async fn render_for(&self, member: &Member, message: &Message) -> Rendering {
        let untranslated = |confidence: Option<f64>, unavailable: bool, error: Option<ErrorKind>| Rendering {
            recipient_id: member.user_id.clone(),
            display_text: message.content.clone(),
            is_translated: false,
            target_language: member.preferred_language.clone(),
            detected_language: message.original_language.clone(),
            confidence,
            translation_unavailable: unavailable,
            translation_error: error,
        };

        if same_language(&member.preferred_language, &message.original_language) {
            return untranslated(None, false, None);
        }

        match self
            .translator
            .translate(
                &message.content,
                &member.preferred_language,
                Some(&message.original_language),
            )
            .await
        {
            Ok(t) => {
                let usable = t.failure.is_none()
                    && t.confidence > self.min_confidence
                    && t.translated_text.trim() != message.content.trim();
                if usable {
                    Rendering {
                        recipient_id: member.user_id.clone(),
                        display_text: t.translated_text,
                        is_translated: true,
                        target_language: member.preferred_language.clone(),
                        detected_language: t.detected_language,
                        confidence: Some(t.confidence),
                        translation_unavailable: false,
                        translation_error: None,
                    }
                } else {
                    // unchanged text (pass-through) is not a failure
                    let unavailable =
                        t.failure.is_some() || t.confidence <= self.min_confidence;
                    let error = t.failure.as_ref().map(|f| f.kind);
                    untranslated(Some(t.confidence), unavailable, error)
                }
            }
            Err(e) => {
                warn!(
                    recipient_id = %member.user_id,
                    target_lang = %member.preferred_language,
                    error = %e,
                    "translation rejected, delivering original"
                );
                untranslated(Some(0.0), true, Some(e.kind()))
            }
        }
    }
}

/// Members keyed by exact preferred language, in first-seen order.
fn group_by_language<'a>(members: impl Iterator<Item = &'a Member>) -> Vec<Vec<&'a Member>> {
    let mut groups: Vec<(String, Vec<&'a Member>)> = Vec::new();
    for member in members {
        let key = member.preferred_language.trim().to_ascii_lowercase();
        match groups.iter_mut().find(|(k, _)| *k == key) {
            Some((_, group)) => group.push(member),
            None => groups.push((key, vec![member])),
        }
    }
    groups.into_iter().map(|(_, group)| group).collect()
}

fn original_payload(message: &Message, sender_name: &str) -> NewMessagePayload {
    NewMessagePayload {
        id: message.id.to_string(),
        conversation_id: message.conversation_id.clone(),
        content: message.content.clone(),
        original_content: message.content.clone(),
        sender_id: message.sender_id.clone(),
        sender_name: sender_name.to_string(),
        timestamp: message.created_at.timestamp_millis(),
        original_language: message.original_language.clone(),
        translated_content: None,
        target_language: None,
        is_translated: false,
        confidence: None,
        translation_unavailable: false,
        translation_error: None,
    }
}
