use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    // --- Conversation Store Args ---
    /// Path of the JSON-lines file holding saved conversations.
    #[arg(long, env = "HISTORY_PATH", default_value = "conversations.json")]
    pub history_path: String,

    // --- Chat LLM Provider Args ---
    /// Type of LLM provider for chat completion (openai, ollama)
    #[arg(long, env = "CHAT_LLM_TYPE", default_value = "openai")]
    pub chat_llm_type: String,

    /// Base URL for the Chat LLM provider API (e.g., http://localhost:11434 for Ollama)
    #[arg(long, env = "CHAT_BASE_URL")]
    pub chat_base_url: Option<String>,

    /// Default API key for the model provider. Clients may supply their own per session.
    #[arg(long, env = "CHAT_API_KEY", default_value = "")]
    pub chat_api_key: String,

    /// Model name for chat completion.
    #[arg(long, env = "CHAT_MODEL", default_value = "gpt-3.5-turbo")]
    pub chat_model: String,

    /// Sampling temperature for answers.
    #[arg(long, env = "CHAT_TEMPERATURE", default_value = "0.5")]
    pub chat_temperature: f32,

    // --- Embedding LLM Provider Args ---
    /// Type of LLM provider for text embedding (openai, ollama)
    #[arg(long, env = "EMBEDDING_LLM_TYPE", default_value = "openai")]
    pub embedding_llm_type: String,

    /// Base URL for the Embedding LLM provider API
    #[arg(long, env = "EMBEDDING_BASE_URL")]
    pub embedding_base_url: Option<String>,

    /// Model name for text embedding (e.g., text-embedding-3-small, nomic-embed-text)
    #[arg(long, env = "EMBEDDING_MODEL")]
    pub embedding_model: Option<String>,

    // --- Retrieval Args ---
    /// Optional path to a prompt configuration file overriding the built-in prompts.
    #[arg(long, env = "PROMPTS_PATH")]
    pub prompts_path: Option<String>,

    /// Number of chunks retrieved per question.
    #[arg(long, env = "RAG_TOP_K", default_value = "2")]
    pub rag_top_k: usize,

    /// Maximum chunk size in characters.
    #[arg(long, env = "CHUNK_SIZE", default_value = "2048")]
    pub chunk_size: usize,

    /// Characters shared by consecutive chunks.
    #[arg(long, env = "CHUNK_OVERLAP", default_value = "200")]
    pub chunk_overlap: usize,

    // --- Server Args ---
    /// Host address and port for the WebSocket server to listen on.
    #[arg(long, env = "SERVER_ADDR", default_value = "127.0.0.1:4000")]
    pub server_addr: String,

    /// Optional API Key required for clients to connect to the WebSocket server. If set, clients must provide this key.
    #[arg(long, env = "SERVER_API_KEY")]
    pub server_api_key: Option<String>,

    /// Port for the HTTP conversation API. Disabled when unset.
    #[arg(long, env = "HTTP_PORT")]
    pub http_port: Option<u16>,

    /// Largest WebSocket message accepted, uploads included.
    #[arg(long, env = "MAX_MESSAGE_BYTES", default_value = "26214400")]
    pub max_message_bytes: usize,

    /// Optional path to the TLS certificate file (PEM format) for enabling WSS. Requires --tls-key.
    #[arg(long, env = "TLS_CERT_PATH")]
    pub tls_cert_path: Option<String>,

    /// Optional path to the TLS private key file (PEM format) for enabling WSS. Requires --tls-cert.
    #[arg(long, env = "TLS_KEY_PATH")]
    pub tls_key_path: Option<String>,

    #[arg(long, env = "ENABLE_TLS", default_value = "false")]
    pub enable_tls: bool,

    /// Enable debug logging/output
    #[arg(long, env = "DEBUG", default_value = "false")]
    pub debug: bool,
}
