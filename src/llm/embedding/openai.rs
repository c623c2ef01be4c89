use async_trait::async_trait;
use rllm::{ builder::{ LLMBackend, LLMBuilder }, LLMProvider };
use std::error::Error as StdError;
use super::super::LlmConfig;
use super::{ EmbeddingClient, EmbeddingResponse };

pub struct OpenAIEmbeddingClient {
    llm: Box<dyn LLMProvider + Send + Sync>,
}

impl OpenAIEmbeddingClient {
    pub fn new(
        api_key: String,
        model: Option<String>,
        base_url: Option<String>
    ) -> Result<Self, Box<dyn StdError + Send + Sync>> {
        let model_name = model.unwrap_or_else(|| "text-embedding-ada-002".to_string());

        let mut builder = LLMBuilder::new()
            .backend(LLMBackend::OpenAI)
            .api_key(api_key)
            .model(&model_name);

        if let Some(url) = base_url {
            builder = builder.base_url(url);
        }

        let llm = builder.build()?;

        Ok(Self { llm })
    }

    pub fn from_config(config: &LlmConfig) -> Result<Self, Box<dyn StdError + Send + Sync>> {
        let api_key = config.api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| "OpenAI API key is required for OpenAIEmbeddingClient".to_string())?;

        Self::new(api_key, config.embedding_model.clone(), config.base_url.clone())
    }
}

#[async_trait]
impl EmbeddingClient for OpenAIEmbeddingClient {
    async fn embed(
        &self,
        text: &str
    ) -> Result<EmbeddingResponse, Box<dyn StdError + Send + Sync>> {
        let mut embeddings = self.llm.embed(vec![text.to_string()]).await?;
        let embedding = embeddings
            .pop()
            .ok_or_else(|| "OpenAI embedding generation returned no results".to_string())?;

        Ok(EmbeddingResponse { embedding })
    }

    async fn embed_batch(
        &self,
        texts: &[String]
    ) -> Result<Vec<Vec<f32>>, Box<dyn StdError + Send + Sync>> {
        let embeddings = self.llm.embed(texts.to_vec()).await?;
        if embeddings.len() != texts.len() {
            return Err(
                format!(
                    "OpenAI returned {} embeddings for {} inputs",
                    embeddings.len(),
                    texts.len()
                ).into()
            );
        }
        Ok(embeddings)
    }
}
