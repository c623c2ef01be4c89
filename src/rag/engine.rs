use async_trait::async_trait;
use log::{ debug, info };
use std::sync::Arc;

use super::chunk::{ cosine_similarity, split_text };
use super::{ ChatIndex, ChatResponse, IndexBuilder, ModelConfig };
use crate::config::prompt::{ self as prompts, PromptConfig };
use crate::error::{ ChatError, Result };
use crate::extract::Document;
use crate::history::format_history_for_prompt;
use crate::llm::chat::{ new_client as new_chat_client, ChatClient };
use crate::llm::embedding::{ new_client as new_embedding_client, EmbeddingClient };
use crate::llm::LlmConfig;
use crate::models::chat::{ ChatMessage, Role };

const EMBED_BATCH_SIZE: usize = 64;

#[derive(Debug, Clone)]
struct IndexedChunk {
    source: String,
    text: String,
    vector: Vec<f32>,
}

/// Builds in-memory [`RagIndex`]es using hosted chat and embedding models.
pub struct RagIndexBuilder {
    prompt_config: Arc<PromptConfig>,
}

impl RagIndexBuilder {
    pub fn new(prompt_config: Arc<PromptConfig>) -> Self {
        Self { prompt_config }
    }
}

#[async_trait]
impl IndexBuilder for RagIndexBuilder {
    async fn build(
        &self,
        documents: Vec<Document>,
        config: &ModelConfig,
        credential: &str
    ) -> Result<Arc<dyn ChatIndex>> {
        if documents.is_empty() {
            return Err(ChatError::NoDocuments);
        }
        let api_key = Some(credential.to_string()).filter(|k| !k.trim().is_empty());

        let chat_config = LlmConfig {
            llm_type: config.llm_type,
            api_key: api_key.clone(),
            completion_model: Some(config.model.clone()),
            embedding_model: None,
            base_url: config.base_url.clone(),
            temperature: config.temperature,
            system_prompt: Some(config.system_prompt.clone()),
        };
        let chat_client = new_chat_client(&chat_config).map_err(|e|
            ChatError::Config(format!("Chat client: {}", e))
        )?;

        let embedding_config = LlmConfig {
            llm_type: config.embedding_llm_type,
            api_key,
            completion_model: None,
            embedding_model: config.embedding_model.clone(),
            base_url: config.embedding_base_url.clone(),
            temperature: config.temperature,
            system_prompt: None,
        };
        let embedding_client = new_embedding_client(&embedding_config).map_err(|e|
            ChatError::Config(format!("Embedding client: {}", e))
        )?;

        info!(
            "Building index over {} document(s): chat={} model={} at {}, embeddings={}",
            documents.len(),
            config.llm_type,
            chat_client.get_model(),
            chat_client.get_base_url().unwrap_or_default(),
            config.embedding_llm_type
        );

        let index = RagIndex::from_documents(
            documents,
            chat_client,
            embedding_client,
            self.prompt_config.clone(),
            config
        ).await?;
        Ok(Arc::new(index))
    }
}

pub struct RagIndex {
    chunks: Vec<IndexedChunk>,
    document_count: usize,
    chat_client: Arc<dyn ChatClient>,
    embedding_client: Arc<dyn EmbeddingClient>,
    prompt_config: Arc<PromptConfig>,
    top_k: usize,
}

impl RagIndex {
    pub async fn from_documents(
        documents: Vec<Document>,
        chat_client: Arc<dyn ChatClient>,
        embedding_client: Arc<dyn EmbeddingClient>,
        prompt_config: Arc<PromptConfig>,
        config: &ModelConfig
    ) -> Result<Self> {
        let mut pieces: Vec<(String, String)> = Vec::new();
        for doc in &documents {
            for chunk in split_text(&doc.text, config.chunk_size, config.chunk_overlap) {
                pieces.push((doc.source.clone(), chunk));
            }
        }

        let mut chunks = Vec::with_capacity(pieces.len());
        for batch in pieces.chunks(EMBED_BATCH_SIZE) {
            let texts: Vec<String> = batch
                .iter()
                .map(|(_, text)| text.clone())
                .collect();
            let vectors = embedding_client
                .embed_batch(&texts).await
                .map_err(|e| ChatError::BackendQuery(format!("Embedding failed: {}", e)))?;
            if vectors.len() != batch.len() {
                return Err(
                    ChatError::BackendQuery(
                        format!("Expected {} embeddings, got {}", batch.len(), vectors.len())
                    )
                );
            }
            for ((source, text), vector) in batch.iter().zip(vectors) {
                chunks.push(IndexedChunk {
                    source: source.clone(),
                    text: text.clone(),
                    vector,
                });
            }
        }

        info!("Indexed {} chunk(s) from {} document(s)", chunks.len(), documents.len());
        Ok(Self {
            chunks,
            document_count: documents.len(),
            chat_client,
            embedding_client,
            prompt_config,
            top_k: config.top_k.max(1),
        })
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Rewrites `prompt` into a standalone question. Without an earlier user
    /// turn there is nothing to condense against and the prompt is returned as is.
    async fn condense_question(&self, prompt: &str, history: &[ChatMessage]) -> Result<String> {
        if !history.iter().any(|m| m.role == Role::User) {
            return Ok(prompt.to_string());
        }
        let condense_prompt = prompts
            ::get_condense_prompt(
                &self.prompt_config,
                &format_history_for_prompt(history),
                prompt
            )
            .map_err(|e| ChatError::Config(e.to_string()))?;

        let resp = self.chat_client
            .complete(&condense_prompt).await
            .map_err(|e| ChatError::BackendQuery(format!("Condense step failed: {}", e)))?;
        let standalone = resp.response.trim();
        if standalone.is_empty() {
            return Ok(prompt.to_string());
        }
        debug!("Condensed '{}' into '{}'", prompt, standalone);
        Ok(standalone.to_string())
    }

    fn retrieve(&self, query_vector: &[f32]) -> Vec<(f32, &IndexedChunk)> {
        let mut scored: Vec<(f32, &IndexedChunk)> = self.chunks
            .iter()
            .map(|c| (cosine_similarity(query_vector, &c.vector), c))
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(self.top_k);
        scored
    }

    fn format_context(hits: &[(f32, &IndexedChunk)]) -> String {
        if hits.is_empty() {
            return "No relevant documents found.".to_string();
        }

        let mut context = String::new();
        for (score, chunk) in hits {
            context.push_str(&format!("Source: {} (Score: {:.4})\n", chunk.source, score));
            context.push_str(&chunk.text);
            context.push_str("\n\n");
        }
        context.trim_end().to_string()
    }
}

#[async_trait]
impl ChatIndex for RagIndex {
    async fn chat(&self, prompt: &str, history: &[ChatMessage]) -> Result<ChatResponse> {
        let question = self.condense_question(prompt, history).await?;

        let hits = if self.chunks.is_empty() {
            Vec::new()
        } else {
            let embedded = self.embedding_client
                .embed(&question).await
                .map_err(|e| ChatError::BackendQuery(format!("Embedding failed: {}", e)))?;
            self.retrieve(&embedded.embedding)
        };
        debug!("Retrieved {} chunk(s) for '{}'", hits.len(), question);

        let context = Self::format_context(&hits);
        let answer_prompt = prompts
            ::get_answer_prompt(&self.prompt_config, &context, &question)
            .map_err(|e| ChatError::Config(e.to_string()))?;

        let answer = self.chat_client
            .complete(&answer_prompt).await
            .map_err(|e| ChatError::BackendQuery(format!("Final completion failed: {}", e)))?;

        Ok(ChatResponse { response: answer.response })
    }

    fn document_count(&self) -> usize {
        self.document_count
    }
}
