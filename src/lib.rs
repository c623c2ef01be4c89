pub mod cli;
pub mod config;
pub mod error;
pub mod extract;
pub mod history;
pub mod llm;
pub mod models;
pub mod rag;
pub mod server;
pub mod session;

use cli::Args;
use config::prompt::load_prompts;
use history::initialize_history_store;
use log::info;
use rag::{ ModelConfig, RagIndexBuilder };
use server::{ AppContext, Server };
use std::error::Error;
use std::sync::Arc;

pub async fn run(args: Args) -> Result<(), Box<dyn Error + Send + Sync>> {
    info!("--- Core Configuration ---");
    info!("Server Address: {}", args.server_addr);
    info!("Conversation Store: {}", args.history_path);
    info!("Chat LLM Type: {}", args.chat_llm_type);
    info!("Chat Model: {}", args.chat_model);
    info!("Embedding LLM Type: {}", args.embedding_llm_type);
    info!("Prompts Path: {}", args.prompts_path.as_deref().unwrap_or("(built-in)"));
    info!("Retrieval Top K: {}", args.rag_top_k);
    info!("Chunk Size / Overlap: {} / {}", args.chunk_size, args.chunk_overlap);
    info!("Default API Key Set: {}", !args.chat_api_key.trim().is_empty());
    if let Some(port) = args.http_port {
        info!("HTTP API Port: {}", port);
    }
    info!("-------------------------");

    let history = initialize_history_store(&args)?;
    let prompts = load_prompts(args.prompts_path.as_deref())?;
    let model_config = ModelConfig::from_args(&args, &prompts.system_prompt)?;

    let default_credential = Some(args.chat_api_key.trim())
        .filter(|key| !key.is_empty())
        .map(str::to_string);

    let context = AppContext {
        history,
        index_builder: Arc::new(RagIndexBuilder::new(Arc::clone(&prompts))),
        model_config,
        greeting: Some(prompts.greeting.clone()),
        default_credential,
    };

    let addr = args.server_addr.clone();
    info!("Starting server on: {}", addr);
    let server = Server::new(addr, context, args);
    server.run().await?;

    Ok(())
}
