pub mod api;
pub mod websocket;

use crate::cli::Args;
use crate::history::HistoryStore;
use crate::rag::{ IndexBuilder, ModelConfig };
use crate::session::SessionController;
use std::error::Error;
use std::sync::Arc;

/// Everything a new session needs, shared by all connections.
#[derive(Clone)]
pub struct AppContext {
    pub history: Arc<dyn HistoryStore>,
    pub index_builder: Arc<dyn IndexBuilder>,
    pub model_config: ModelConfig,
    pub greeting: Option<String>,
    pub default_credential: Option<String>,
}

impl AppContext {
    pub fn new_session(&self) -> SessionController {
        let mut controller = SessionController::new(
            Arc::clone(&self.history),
            Arc::clone(&self.index_builder),
            self.model_config.clone(),
            self.greeting.as_deref()
        );
        if let Some(key) = &self.default_credential {
            controller.set_credential(key);
        }
        controller
    }
}

pub struct Server {
    addr: String,
    context: AppContext,
    args: Args,
}

impl Server {
    pub fn new(addr: String, context: AppContext, args: Args) -> Self {
        Self { addr, context, args }
    }

    pub async fn run(&self) -> Result<(), Box<dyn Error + Send + Sync>> {
        if let Some(http_port) = self.args.http_port {
            self.start_http_server(http_port).await?;
        }

        self.start_ws_server().await?;

        Ok(())
    }

    async fn start_http_server(&self, http_port: u16) -> Result<(), Box<dyn Error + Send + Sync>> {
        api::start_http_server(http_port, Arc::clone(&self.context.history), self.args.clone()).await
    }

    async fn start_ws_server(&self) -> Result<(), Box<dyn Error + Send + Sync>> {
        websocket::start_ws_server(
            &self.addr,
            self.context.clone(),
            self.args.server_api_key.clone(),
            self.args.clone()
        ).await
    }
}
