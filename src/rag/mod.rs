pub mod chunk;
pub mod engine;

use async_trait::async_trait;
use serde::{ Deserialize, Serialize };
use std::sync::Arc;

use crate::cli::Args;
use crate::error::{ ChatError, Result };
use crate::extract::Document;
use crate::llm::LlmType;
use crate::models::chat::ChatMessage;

pub use engine::{ RagIndex, RagIndexBuilder };

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    pub response: String,
}

/// Generation and retrieval settings for an index.
#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub llm_type: LlmType,
    pub model: String,
    pub base_url: Option<String>,
    pub temperature: f32,
    pub system_prompt: String,
    pub embedding_llm_type: LlmType,
    pub embedding_model: Option<String>,
    pub embedding_base_url: Option<String>,
    pub top_k: usize,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            llm_type: LlmType::OpenAI,
            model: "gpt-3.5-turbo".to_string(),
            base_url: None,
            temperature: 0.5,
            system_prompt: String::new(),
            embedding_llm_type: LlmType::OpenAI,
            embedding_model: None,
            embedding_base_url: None,
            top_k: 2,
            chunk_size: 2048,
            chunk_overlap: 200,
        }
    }
}

impl ModelConfig {
    pub fn from_args(args: &Args, system_prompt: &str) -> Result<Self> {
        let llm_type = args.chat_llm_type
            .parse()
            .map_err(|e| ChatError::Config(format!("Invalid chat LLM type: {}", e)))?;
        let embedding_llm_type = args.embedding_llm_type
            .parse()
            .map_err(|e| ChatError::Config(format!("Invalid embedding LLM type: {}", e)))?;
        if args.chunk_size == 0 || args.chunk_overlap >= args.chunk_size {
            return Err(ChatError::Config("chunk overlap must be smaller than chunk size".into()));
        }
        Ok(Self {
            llm_type,
            model: args.chat_model.clone(),
            base_url: args.chat_base_url.clone(),
            temperature: args.chat_temperature,
            system_prompt: system_prompt.to_string(),
            embedding_llm_type,
            embedding_model: args.embedding_model.clone(),
            embedding_base_url: args.embedding_base_url.clone(),
            top_k: args.rag_top_k.max(1),
            chunk_size: args.chunk_size,
            chunk_overlap: args.chunk_overlap,
        })
    }
}

/// A built index that answers questions with the condense-question strategy:
/// the prompt is first rewritten against `history`, then used for retrieval.
#[async_trait]
pub trait ChatIndex: Send + Sync {
    async fn chat(&self, prompt: &str, history: &[ChatMessage]) -> Result<ChatResponse>;

    fn document_count(&self) -> usize;
}

#[async_trait]
pub trait IndexBuilder: Send + Sync {
    async fn build(
        &self,
        documents: Vec<Document>,
        config: &ModelConfig,
        credential: &str
    ) -> Result<Arc<dyn ChatIndex>>;
}
