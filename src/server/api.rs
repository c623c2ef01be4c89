use crate::cli::Args;
use crate::error::ChatError;
use crate::history::HistoryStore;
use crate::models::chat::Conversation;
use super::websocket::verify_signature;
use std::collections::{ BTreeSet, HashMap };
use std::error::Error;
use std::net::SocketAddr;
use std::sync::Arc;
use axum::{
    routing::{ get, post },
    Router,
    extract::{ Request, State },
    middleware::{ self, Next },
    response::{ IntoResponse, Response },
    http::{ HeaderMap, StatusCode },
    Json,
};
use chrono::Utc;
use url::form_urlencoded;
use serde::{ Deserialize, Serialize };
use tower_http::cors::{ Any, CorsLayer };
use log::{ info, warn, error };

#[derive(Deserialize, Debug, Default)]
pub struct DeleteRequest {
    #[serde(default)]
    pub indices: Vec<usize>,
    #[serde(default)]
    pub ids: Vec<String>,
}

#[derive(Serialize)]
struct DeleteResponse {
    removed: usize,
}

#[derive(Serialize)]
struct ConversationsResponse {
    conversations: Vec<Conversation>,
}

#[derive(Serialize)]
struct ErrorBody {
    kind: &'static str,
    message: String,
}

struct ApiError(ChatError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        error!("HTTP API error: {}", self.0);
        let body = ErrorBody { kind: self.0.kind(), message: self.0.to_string() };
        (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response()
    }
}

#[derive(Clone)]
struct AppState {
    history: Arc<dyn HistoryStore>,
    api_key: Option<String>,
}

/// Conversation routes require the same `ts`/`sig` signature as the
/// WebSocket handshake whenever `api_key` is set. Health stays open.
pub fn router(history: Arc<dyn HistoryStore>, api_key: Option<String>) -> Router {
    let state = AppState {
        history,
        api_key: api_key.filter(|k| !k.is_empty()),
    };
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    let conversations = Router::new()
        .route("/api/conversations", get(list_handler))
        .route("/api/conversations/delete", post(delete_handler))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_signature));

    Router::new()
        .route("/api/health", get(health_handler))
        .merge(conversations)
        .layer(cors)
        .with_state(state)
}

fn signature_params(query: Option<&str>, headers: &HeaderMap) -> (Option<String>, Option<String>) {
    let params: HashMap<String, String> = form_urlencoded
        ::parse(query.unwrap_or("").as_bytes())
        .into_owned()
        .collect();
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    let ts = params.get("ts").cloned().or_else(|| header("X-Api-Ts"));
    let sig = params.get("sig").cloned().or_else(|| header("X-Api-Sign"));
    (ts, sig)
}

async fn require_signature(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let Some(secret) = state.api_key.as_deref() else {
        return next.run(req).await;
    };

    let (ts, sig) = signature_params(req.uri().query(), req.headers());
    let verdict = match (ts, sig) {
        (Some(ts), Some(sig)) => verify_signature(secret, &ts, &sig, Utc::now().timestamp()),
        _ => Err("missing ts/sig"),
    };

    match verdict {
        Ok(()) => next.run(req).await,
        Err(reason) => {
            warn!("Rejected HTTP API request to {}: {}", req.uri().path(), reason);
            let body = ErrorBody { kind: "unauthorized", message: reason.to_string() };
            (StatusCode::UNAUTHORIZED, Json(body)).into_response()
        }
    }
}

pub async fn start_http_server(
    http_port: u16,
    history: Arc<dyn HistoryStore>,
    args: Args
) -> Result<(), Box<dyn Error + Send + Sync>> {
    let addr = format!("0.0.0.0:{}", http_port).parse::<SocketAddr>()?;
    info!("Starting HTTP API server on: http://{}", addr);

    let app = router(history, args.server_api_key.clone());

    match (args.enable_tls, &args.tls_cert_path, &args.tls_key_path) {
        (true, Some(cert_path), Some(key_path)) => {
            let tls_config = axum_server::tls_rustls::RustlsConfig::from_pem_file(
                cert_path,
                key_path
            ).await?;

            tokio::spawn(async move {
                let result = axum_server
                    ::bind_rustls(addr, tls_config)
                    .serve(app.into_make_service()).await;

                if let Err(e) = result {
                    error!("HTTPS server error: {}", e);
                }
            });

            info!("HTTPS server started with TLS enabled");
        }
        _ => {
            tokio::spawn(async move {
                match tokio::net::TcpListener::bind(addr).await {
                    Ok(listener) => {
                        if let Err(e) = axum::serve(listener, app.into_make_service()).await {
                            error!("HTTP server error: {}", e);
                        }
                    }
                    Err(e) => {
                        error!("Failed to bind HTTP server to {}: {}. Try a different port.", addr, e);
                    }
                }
            });

            info!("HTTP server started");
        }
    }

    Ok(())
}

async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn list_handler(State(state): State<AppState>) -> Result<Json<ConversationsResponse>, ApiError> {
    let conversations = state.history.list_all().await.map_err(ApiError)?;
    Ok(Json(ConversationsResponse { conversations }))
}

async fn delete_handler(
    State(state): State<AppState>,
    Json(req): Json<DeleteRequest>
) -> Result<Json<DeleteResponse>, ApiError> {
    let removed = if req.ids.is_empty() {
        let indices: BTreeSet<usize> = req.indices.into_iter().collect();
        state.history.delete_by_indices(&indices).await.map_err(ApiError)?
    } else {
        let ids: BTreeSet<String> = req.ids.into_iter().collect();
        state.history.delete_by_ids(&ids).await.map_err(ApiError)?
    };
    info!("Deleted {} conversation(s) via HTTP API", removed);
    Ok(Json(DeleteResponse { removed }))
}
