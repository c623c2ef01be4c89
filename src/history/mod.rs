pub mod jsonl;

use async_trait::async_trait;
use log::info;
use sha2::{ Digest, Sha256 };
use std::collections::BTreeSet;
use std::error::Error;
use std::sync::Arc;
use crate::cli::Args;
use crate::error::Result;
use crate::models::chat::{ ChatMessage, Conversation, Role };

pub use jsonl::JsonlHistoryStore;

/// Durable log of finished conversations.
///
/// Records are only ever appended or removed wholesale; a stored transcript is
/// never edited.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Persists one full transcript and returns its stable id.
    async fn append(&self, messages: &[ChatMessage]) -> Result<String>;

    async fn list_all(&self) -> Result<Vec<Conversation>>;

    /// Removes the records at the given positions as last listed. Returns how
    /// many were removed.
    async fn delete_by_indices(&self, indices: &BTreeSet<usize>) -> Result<usize>;

    /// Removes every record whose id is in `ids`.
    async fn delete_by_ids(&self, ids: &BTreeSet<String>) -> Result<usize>;
}

pub fn initialize_history_store(
    args: &Args
) -> std::result::Result<Arc<dyn HistoryStore>, Box<dyn Error + Send + Sync>> {
    info!("Conversations will be stored in: {}", args.history_path);
    Ok(Arc::new(JsonlHistoryStore::new(&args.history_path)))
}

/// Content-derived id: the first 16 hex chars of SHA-256 over the canonical
/// JSON of the messages.
pub fn conversation_id(messages: &[ChatMessage]) -> Result<String> {
    let canonical = serde_json::to_string(messages)?;
    let digest = Sha256::digest(canonical.as_bytes());
    Ok(hex::encode(&digest[..8]))
}

pub fn format_history_for_prompt(messages: &[ChatMessage]) -> String {
    if messages.is_empty() {
        return String::new();
    }
    let mut result = String::new();
    for msg in messages {
        let role_display = match msg.role {
            Role::User => "User",
            Role::Assistant => "Assistant",
        };

        result.push_str(&format!("{}: {}\n", role_display, msg.content));
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_depends_on_content_only() {
        let a = vec![ChatMessage::user("hi"), ChatMessage::assistant("hello")];
        let b = a.clone();
        let c = vec![ChatMessage::user("hi"), ChatMessage::assistant("hello!")];

        let id_a = conversation_id(&a).unwrap();
        assert_eq!(id_a.len(), 16);
        assert_eq!(id_a, conversation_id(&b).unwrap());
        assert_ne!(id_a, conversation_id(&c).unwrap());
    }

    #[test]
    fn history_is_rendered_one_line_per_turn() {
        let messages = vec![ChatMessage::user("What is st.cache?"), ChatMessage::assistant("A decorator.")];
        assert_eq!(
            format_history_for_prompt(&messages),
            "User: What is st.cache?\nAssistant: A decorator.\n"
        );
        assert!(format_history_for_prompt(&[]).is_empty());
    }
}
