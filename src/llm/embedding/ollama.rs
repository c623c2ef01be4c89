use async_trait::async_trait;
use reqwest::Client as HttpClient;
use serde::{ Deserialize, Serialize };
use std::error::Error as StdError;
use super::{ EmbeddingClient, EmbeddingResponse };
use crate::llm::LlmConfig;

const DEFAULT_BASE_URL: &str = "http://localhost:11434";
const DEFAULT_MODEL: &str = "nomic-embed-text";

/// Embeddings from a local Ollama server. A whole batch goes out as one
/// `/api/embed` call.
#[derive(Debug)]
pub struct OllamaEmbeddingClient {
    http: HttpClient,
    base_url: String,
    model: String,
}

#[derive(Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

impl OllamaEmbeddingClient {
    pub fn new(base_url: Option<String>, model: Option<String>) -> Self {
        Self {
            http: HttpClient::new(),
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            model: model.unwrap_or_else(|| DEFAULT_MODEL.to_string()),
        }
    }

    pub fn from_config(config: &LlmConfig) -> Result<Self, Box<dyn StdError + Send + Sync>> {
        Ok(Self::new(config.base_url.clone(), config.embedding_model.clone()))
    }
}

#[async_trait]
impl EmbeddingClient for OllamaEmbeddingClient {
    async fn embed(
        &self,
        text: &str
    ) -> Result<EmbeddingResponse, Box<dyn StdError + Send + Sync>> {
        let mut embeddings = self.embed_batch(&[text.to_string()]).await?;
        let embedding = embeddings
            .pop()
            .ok_or_else(|| "Ollama embedding generation returned no results".to_string())?;

        Ok(EmbeddingResponse { embedding })
    }

    async fn embed_batch(
        &self,
        texts: &[String]
    ) -> Result<Vec<Vec<f32>>, Box<dyn StdError + Send + Sync>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let url = format!("{}/api/embed", self.base_url.trim_end_matches('/'));
        let req = EmbedRequest { model: &self.model, input: texts };
        let resp = self.http.post(&url).json(&req).send().await?.error_for_status()?;
        let data = resp.json::<EmbedResponse>().await?;
        if data.embeddings.len() != texts.len() {
            return Err(
                format!(
                    "Ollama returned {} embeddings for {} inputs",
                    data.embeddings.len(),
                    texts.len()
                ).into()
            );
        }
        Ok(data.embeddings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{ body_partial_json, method, path };
    use wiremock::{ Mock, MockServer, ResponseTemplate };

    #[tokio::test]
    async fn batch_is_one_request_in_input_order() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/embed"))
            .and(body_partial_json(json!({"model": "nomic-embed-text", "input": ["a", "b"]})))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"embeddings": [[1.0, 0.0], [0.0, 1.0]]}))
            )
            .expect(1)
            .mount(&server).await;

        let client = OllamaEmbeddingClient::new(Some(server.uri()), None);
        let vectors = client.embed_batch(&["a".to_string(), "b".to_string()]).await.unwrap();
        assert_eq!(vectors, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
    }

    #[tokio::test]
    async fn single_embed_uses_the_batch_endpoint() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/embed"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"embeddings": [[0.5, 0.5]]})))
            .mount(&server).await;

        let client = OllamaEmbeddingClient::new(Some(format!("{}/", server.uri())), Some("mxbai".into()));
        assert_eq!(client.embed("hello").await.unwrap().embedding, vec![0.5, 0.5]);
    }

    #[tokio::test]
    async fn count_mismatch_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/embed"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"embeddings": [[1.0]]})))
            .mount(&server).await;

        let client = OllamaEmbeddingClient::new(Some(server.uri()), None);
        let err = client.embed_batch(&["a".to_string(), "b".to_string()]).await.unwrap_err();
        assert!(err.to_string().contains("1 embeddings for 2 inputs"));
    }

    #[tokio::test]
    async fn server_error_propagates() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/embed"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server).await;

        let client = OllamaEmbeddingClient::new(Some(server.uri()), None);
        assert!(client.embed("x").await.is_err());
    }
}
