use crate::cli::Args;
use crate::error::ChatError;
use crate::extract::ExtractionOutcome;
use crate::models::websocket::{ ClientMessage, ServerMessage, UploadPayload };
use crate::server::AppContext;
use crate::session::{ ConversationsPanel, SessionController };

use std::collections::{ BTreeSet, HashMap };
use std::error::Error;
use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::num::NonZeroU32;
use std::sync::Arc;

use tokio::io::{ AsyncRead, AsyncWrite };
use tokio::net::TcpListener;

use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::tungstenite::handshake::server::{ ErrorResponse, Request, Response };
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{ accept_hdr_async, WebSocketStream };

use rustls::pki_types::{ CertificateDer, PrivateKeyDer };
use rustls::ServerConfig;
use rustls_pemfile::{ certs, pkcs8_private_keys };

use governor::{ clock::DefaultClock, state::{ InMemoryState, NotKeyed }, Quota, RateLimiter };
use lazy_static::lazy_static;

use chrono::Utc;
use hmac::{ Hmac, Mac };
use sha2::Sha256;
use url::form_urlencoded;

use futures::{ SinkExt, StreamExt };
use log::{ debug, error, info, warn };
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

const MAX_CLOCK_SKEW_SECS: i64 = 300;

lazy_static! {
    static ref CONNECTION_LIMITER: RateLimiter<NotKeyed, InMemoryState, DefaultClock> =
        RateLimiter::direct(Quota::per_second(NonZeroU32::MIN.saturating_add(9)));
}

fn load_tls_config(
    cert_path: &str,
    key_path: &str
) -> Result<Arc<ServerConfig>, Box<dyn Error + Send + Sync>> {
    let cert_file = File::open(cert_path).map_err(|e|
        format!("Failed to open TLS certificate file '{}': {}", cert_path, e)
    )?;
    let key_file = File::open(key_path).map_err(|e|
        format!("Failed to open TLS key file '{}': {}", key_path, e)
    )?;

    let mut cert_reader = BufReader::new(cert_file);
    let mut key_reader = BufReader::new(key_file);
    let cert_chain: Vec<CertificateDer<'static>> = certs(&mut cert_reader)
        .collect::<Result<_, _>>()
        .map_err(|e| format!("Failed to read certificate(s): {}", e))?;

    let mut keys = pkcs8_private_keys(&mut key_reader);
    let key = match keys.next() {
        Some(Ok(k)) => PrivateKeyDer::Pkcs8(k),
        Some(Err(e)) => {
            return Err(format!("Error reading private key: {}", e).into());
        }
        None => {
            return Err("No PKCS8 private key found in key file".into());
        }
    };

    let config = ServerConfig::builder().with_no_client_auth().with_single_cert(cert_chain, key)?;
    Ok(Arc::new(config))
}

pub async fn start_ws_server(
    addr: &str,
    context: AppContext,
    api_key: Option<String>,
    args: Args
) -> Result<(), Box<dyn Error + Send + Sync>> {
    let listener = TcpListener::bind(addr).await?;

    let tls_acceptor = if args.enable_tls {
        match (&args.tls_cert_path, &args.tls_key_path) {
            (Some(cert_path), Some(key_path)) => {
                info!(
                    "TLS enabled. Loading certificate from '{}' and key from '{}'",
                    cert_path,
                    key_path
                );
                let config = load_tls_config(cert_path, key_path)?;
                Some(TlsAcceptor::from(config))
            }
            (Some(_), None) | (None, Some(_)) => {
                error!("Both --tls-cert-path and --tls-key-path must be provided to enable TLS.");
                return Err("Missing TLS certificate or key path".into());
            }
            (None, None) => {
                error!("--enable-tls was set but no certificate/key paths provided.");
                return Err("TLS enabled without cert/key".into());
            }
        }
    } else {
        info!("TLS not enabled. Running plain WebSocket (WS) server.");
        None
    };

    let protocol = if tls_acceptor.is_some() { "WSS" } else { "WS" };
    info!("{} server listening on: {}", protocol, addr);

    let max_message_bytes = args.max_message_bytes;

    loop {
        let (stream, peer) = listener.accept().await?;

        if CONNECTION_LIMITER.check().is_err() {
            warn!("Global connection rate limit exceeded for {}. Dropping connection.", peer);
            continue;
        }

        info!("Incoming connection from: {}", peer);
        let context = context.clone();
        let required_api_key = api_key.clone();
        let tls_acceptor = tls_acceptor.clone();

        tokio::spawn(async move {
            let process_result = if let Some(acceptor) = tls_acceptor {
                match acceptor.accept(stream).await {
                    Ok(tls_stream) => {
                        info!("TLS handshake successful for {}", peer);
                        process_connection(
                            peer,
                            tls_stream,
                            context,
                            required_api_key,
                            max_message_bytes
                        ).await
                    }
                    Err(e) => {
                        error!("TLS handshake error for {}: {}", peer, e);
                        Err(Box::new(e) as Box<dyn Error + Send + Sync>)
                    }
                }
            } else {
                process_connection(peer, stream, context, required_api_key, max_message_bytes).await
            };

            if let Err(e) = process_result {
                error!("Failed to process connection for {}: {}", peer, e);
            }
        });
    }
}

fn reject(reason: &str) -> ErrorResponse {
    let mut res = ErrorResponse::new(Some(reason.to_string()));
    *res.status_mut() = StatusCode::UNAUTHORIZED;
    res
}

/// Checks a handshake signature: hex HMAC-SHA256 of `ts` keyed with the
/// server secret, with `ts` within five minutes of `now`.
pub fn verify_signature(secret: &str, ts: &str, sig: &str, now: i64) -> Result<(), &'static str> {
    let ts_i: i64 = ts.parse().map_err(|_| "invalid timestamp")?;
    if (now - ts_i).abs() > MAX_CLOCK_SKEW_SECS {
        return Err("timestamp out of range");
    }
    let expected = hex::decode(sig).map_err(|_| "bad signature")?;
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| "bad server key")?;
    mac.update(ts.as_bytes());
    mac.verify_slice(&expected).map_err(|_| "bad signature")
}

async fn process_connection<S>(
    peer: SocketAddr,
    stream: S,
    context: AppContext,
    required_api_key: Option<String>,
    max_message_bytes: usize
) -> Result<(), Box<dyn Error + Send + Sync>>
    where S: AsyncRead + AsyncWrite + Unpin + Send + 'static
{
    let auth_callback = |req: &Request, response: Response| -> Result<Response, ErrorResponse> {
        let secret = match &required_api_key {
            Some(k) if !k.is_empty() => k,
            _ => {
                return Ok(response);
            }
        };

        let qs = req.uri().query().unwrap_or("");
        let params: HashMap<String, String> = form_urlencoded
            ::parse(qs.as_bytes())
            .into_owned()
            .collect();

        let ts = params.get("ts").or_else(|| params.get("X-Api-Ts"));
        let sig = params.get("sig").or_else(|| params.get("X-Api-Sign"));

        match (ts, sig) {
            (Some(ts), Some(sig)) =>
                match verify_signature(secret, ts, sig, Utc::now().timestamp()) {
                    Ok(()) => Ok(response),
                    Err(reason) => {
                        warn!("Rejected handshake from {}: {}", peer, reason);
                        Err(reject(reason))
                    }
                }
            _ => Err(reject("missing ts/sig")),
        }
    };

    match accept_hdr_async(stream, auth_callback).await {
        Ok(ws) => {
            handle_connection(peer, ws, context.new_session(), max_message_bytes).await;
            Ok(())
        }
        Err(e) => {
            error!("Handshake failed for {}: {}", peer, e);
            Err(Box::new(e) as _)
        }
    }
}

async fn send_message<S>(
    tx: &mut futures::stream::SplitSink<WebSocketStream<S>, Message>,
    message: &ServerMessage
) -> Result<(), Box<dyn Error + Send + Sync>>
    where S: AsyncRead + AsyncWrite + Unpin
{
    let json = serde_json::to_string(message)?;
    tx.send(Message::Text(json)).await?;
    Ok(())
}

pub async fn handle_connection<S>(
    peer: SocketAddr,
    websocket: WebSocketStream<S>,
    mut controller: SessionController,
    max_message_bytes: usize
)
    where S: AsyncRead + AsyncWrite + Unpin
{
    let session_id = Uuid::new_v4();
    info!("New WebSocket session {} for {}", session_id, peer);

    let (mut tx, mut rx) = websocket.split();

    let greeting = ServerMessage::State { session: controller.snapshot() };
    if let Err(e) = send_message(&mut tx, &greeting).await {
        error!("Failed to send initial state to {}: {}", peer, e);
        return;
    }

    while let Some(msg) = rx.next().await {
        let message = match msg {
            Ok(message) => message,
            Err(e) => {
                error!("Error receiving message from {}: {}", peer, e);
                break;
            }
        };

        if message.len() > max_message_bytes {
            warn!(
                "Message from {} exceeds size limit ({} > {})",
                peer,
                message.len(),
                max_message_bytes
            );
            let error_msg = ServerMessage::Error {
                kind: "message_too_large".to_string(),
                message: "Message too large".to_string(),
            };
            if let Err(e) = send_message(&mut tx, &error_msg).await {
                error!("Failed to send size limit error to {}: {}", peer, e);
            }
            break;
        }

        let text = match message {
            Message::Text(text) => text,
            Message::Close(_) => {
                info!("Client {} closed the connection", peer);
                break;
            }
            _ => {
                continue;
            }
        };

        let client_message = match serde_json::from_str::<ClientMessage>(&text) {
            Ok(m) => m,
            Err(e) => {
                warn!("Invalid message from {}: {}", peer, e);
                let error_msg = ServerMessage::Error {
                    kind: "invalid_message".to_string(),
                    message: format!("Invalid message format: {}", e),
                };
                if send_message(&mut tx, &error_msg).await.is_err() {
                    break;
                }
                continue;
            }
        };

        if is_long_running(&client_message) {
            if let Err(e) = send_message(&mut tx, &ServerMessage::processing()).await {
                error!("Error sending processing status to {}: {}", peer, e);
                break;
            }
        }

        let mut closed = false;
        for reply in handle_client_message(&mut controller, client_message).await {
            if let Err(e) = send_message(&mut tx, &reply).await {
                error!("Error sending reply to {}: {}", peer, e);
                closed = true;
                break;
            }
        }
        if closed {
            break;
        }
    }

    info!("WebSocket session {} for {} ended", session_id, peer);
}

fn is_long_running(message: &ClientMessage) -> bool {
    matches!(message, ClientMessage::Upload { .. } | ClientMessage::Chat { .. } | ClientMessage::Retry)
}

fn error_reply(err: &ChatError) -> Vec<ServerMessage> {
    warn!("Action failed: {}", err);
    vec![ServerMessage::from(err)]
}

async fn panel_reply(controller: &SessionController) -> Vec<ServerMessage> {
    match controller.conversations_panel().await {
        Ok(ConversationsPanel::Hidden) =>
            vec![ServerMessage::Conversations { visible: false, conversations: Vec::new() }],
        Ok(ConversationsPanel::Visible(conversations)) =>
            vec![ServerMessage::Conversations { visible: true, conversations }],
        Err(e) => error_reply(&e),
    }
}

async fn upload_reply(
    controller: &mut SessionController,
    files: Vec<UploadPayload>
) -> Vec<ServerMessage> {
    let mut undecodable = Vec::new();
    let mut decoded = Vec::new();
    for payload in files {
        let name = payload.name.clone();
        match payload.decode() {
            Ok(file) => decoded.push(file),
            Err(e) => undecodable.push(ExtractionOutcome::Skipped { name, reason: e.to_string() }),
        }
    }

    if decoded.is_empty() && !undecodable.is_empty() {
        return vec![ServerMessage::UploadReport {
            files: undecodable,
            indexed_documents: 0,
            reused: false,
        }];
    }

    match controller.load_documents(decoded).await {
        Ok(report) => {
            let mut files = report.files;
            files.extend(undecodable);
            vec![ServerMessage::UploadReport {
                files,
                indexed_documents: report.indexed_documents,
                reused: report.reused,
            }]
        }
        Err(e) => error_reply(&e),
    }
}

/// Applies one client action to the session and returns the replies to send.
pub async fn handle_client_message(
    controller: &mut SessionController,
    message: ClientMessage
) -> Vec<ServerMessage> {
    debug!("Handling client message: {:?}", std::mem::discriminant(&message));
    match message {
        ClientMessage::Credential { api_key } => {
            controller.set_credential(&api_key);
            vec![ServerMessage::State { session: controller.snapshot() }]
        }
        ClientMessage::Upload { files } => upload_reply(controller, files).await,
        ClientMessage::Chat { content } =>
            match controller.submit_prompt(&content).await {
                Ok(reply) =>
                    vec![ServerMessage::Response {
                        content: reply.content,
                        timestamp: Utc::now().timestamp(),
                    }],
                Err(e) => error_reply(&e),
            }
        ClientMessage::Retry =>
            match controller.respond_pending().await {
                Ok(reply) =>
                    vec![ServerMessage::Response {
                        content: reply.content,
                        timestamp: Utc::now().timestamp(),
                    }],
                Err(e) => error_reply(&e),
            }
        ClientMessage::Save => {
            if controller.request_save() {
                vec![ServerMessage::ConfirmSave]
            } else {
                vec![ServerMessage::State { session: controller.snapshot() }]
            }
        }
        ClientMessage::ConfirmSave =>
            match controller.confirm_save().await {
                Ok(id) => {
                    info!("Conversation saved with id {}", id);
                    vec![ServerMessage::Saved { id }]
                }
                Err(e) => error_reply(&e),
            }
        ClientMessage::DeclineSave => {
            controller.decline_save();
            vec![ServerMessage::SaveDeclined]
        }
        ClientMessage::EndConversation => {
            controller.end_conversation();
            vec![ServerMessage::Ended]
        }
        ClientMessage::ToggleConversations => {
            controller.toggle_conversations();
            panel_reply(controller).await
        }
        ClientMessage::Conversations => panel_reply(controller).await,
        ClientMessage::DeleteConversations { indices, ids } => {
            let result = if ids.is_empty() {
                let indices: BTreeSet<usize> = indices.into_iter().collect();
                controller.delete_conversations(&indices).await
            } else {
                let ids: BTreeSet<String> = ids.into_iter().collect();
                controller.delete_conversations_by_id(&ids).await
            };
            match result {
                Ok(removed) => {
                    let mut replies = vec![ServerMessage::Deleted { removed }];
                    replies.extend(panel_reply(controller).await);
                    replies
                }
                Err(e) => error_reply(&e),
            }
        }
        ClientMessage::State => vec![ServerMessage::State { session: controller.snapshot() }],
    }
}
