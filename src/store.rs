//! Persistence and membership collaborators.
//! The relay only needs "persist a message", "list members with their
//! language" and "look up a user"; `InMemoryStore` backs all three.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: String,
    pub sender_id: String,
    pub content: String,
    /// Language tag, or `"auto"` when the sender did not declare one.
    pub original_language: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Member {
    pub user_id: String,
    pub preferred_language: String,
    pub is_admin: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub display_name: String,
    pub preferred_language: String,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("conversation not found: {0}")]
    ConversationNotFound(String),
    #[error("user not found: {0}")]
    UserNotFound(String),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn persist_message(
        &self,
        conversation_id: &str,
        sender_id: &str,
        content: &str,
        source_language: &str,
    ) -> Result<Message, StoreError>;

    /// Oldest first, at most `limit` of the newest messages.
    async fn history(&self, conversation_id: &str, limit: usize) -> Result<Vec<Message>, StoreError>;
}

#[async_trait]
pub trait MemberDirectory: Send + Sync {
    async fn conversation_members(&self, conversation_id: &str) -> Result<Vec<Member>, StoreError>;
    async fn user_by_id(&self, user_id: &str) -> Result<User, StoreError>;
}

#[derive(Default)]
struct Tables {
    users: HashMap<String, User>,
    members: HashMap<String, Vec<Member>>,
    messages: HashMap<String, Vec<Message>>,
}

/// Process-local store. `fail_writes` makes `persist_message` fail, for
/// exercising the persistence error path.
#[derive(Default)]
pub struct InMemoryStore {
    tables: RwLock<Tables>,
    fail_writes: AtomicBool,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_user(&self, id: &str, display_name: &str, preferred_language: &str) {
        self.tables.write().users.insert(
            id.to_string(),
            User {
                id: id.to_string(),
                display_name: display_name.to_string(),
                preferred_language: preferred_language.to_string(),
            },
        );
    }

    /// Members take their preferred language from the user table; unknown
    /// users default to English.
    pub fn add_conversation(&self, conversation_id: &str, member_ids: &[&str]) {
        let mut tables = self.tables.write();
        let members = member_ids
            .iter()
            .enumerate()
            .map(|(i, id)| Member {
                user_id: id.to_string(),
                preferred_language: tables
                    .users
                    .get(*id)
                    .map(|u| u.preferred_language.clone())
                    .unwrap_or_else(|| "en".into()),
                is_admin: i == 0,
            })
            .collect();
        tables.members.insert(conversation_id.to_string(), members);
        tables.messages.entry(conversation_id.to_string()).or_default();
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl MessageStore for InMemoryStore {
    async fn persist_message(
        &self,
        conversation_id: &str,
        sender_id: &str,
        content: &str,
        source_language: &str,
    ) -> Result<Message, StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("writes disabled".into()));
        }
        let mut tables = self.tables.write();
        let messages = tables
            .messages
            .get_mut(conversation_id)
            .ok_or_else(|| StoreError::ConversationNotFound(conversation_id.to_string()))?;
        let message = Message {
            id: Uuid::new_v4(),
            conversation_id: conversation_id.to_string(),
            sender_id: sender_id.to_string(),
            content: content.to_string(),
            original_language: source_language.to_string(),
            created_at: Utc::now(),
        };
        messages.push(message.clone());
        Ok(message)
    }

    async fn history(&self, conversation_id: &str, limit: usize) -> Result<Vec<Message>, StoreError> {
        let tables = self.tables.read();
        let messages = tables
            .messages
            .get(conversation_id)
            .ok_or_else(|| StoreError::ConversationNotFound(conversation_id.to_string()))?;
        let skip = messages.len().saturating_sub(limit);
        Ok(messages[skip..].to_vec())
    }
}

#[async_trait]
impl MemberDirectory for InMemoryStore {
    async fn conversation_members(&self, conversation_id: &str) -> Result<Vec<Member>, StoreError> {
        self.tables
            .read()
            .members
            .get(conversation_id)
            .cloned()
            .ok_or_else(|| StoreError::ConversationNotFound(conversation_id.to_string()))
    }

    async fn user_by_id(&self, user_id: &str) -> Result<User, StoreError> {
        self.tables
            .read()
            .users
            .get(user_id)
            .cloned()
            .ok_or_else(|| StoreError::UserNotFound(user_id.to_string()))
    }
}
