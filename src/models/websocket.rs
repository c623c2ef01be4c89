use base64::{ engine::general_purpose::STANDARD, Engine as _ };
use serde::{ Serialize, Deserialize };

use crate::error::{ ChatError, Result };
use crate::extract::{ ExtractionOutcome, UploadedFile };
use crate::models::chat::Conversation;
use crate::session::{ SessionSnapshot, SessionState };

/// One uploaded file as sent over the socket, with base64 `data`.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct UploadPayload {
    pub name: String,
    pub mime_type: String,
    pub data: String,
}

impl UploadPayload {
    pub fn decode(self) -> Result<UploadedFile> {
        let bytes = STANDARD.decode(self.data.as_bytes()).map_err(|e| ChatError::Extraction {
            name: self.name.clone(),
            reason: format!("invalid base64 data: {}", e),
        })?;
        Ok(UploadedFile {
            name: self.name,
            mime_type: self.mime_type,
            bytes,
        })
    }
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Credential {
        api_key: String,
    },
    Upload {
        #[serde(default)]
        files: Vec<UploadPayload>,
    },
    Chat {
        content: String,
    },
    Retry,
    Save,
    ConfirmSave,
    DeclineSave,
    EndConversation,
    ToggleConversations,
    Conversations,
    DeleteConversations {
        #[serde(default)]
        indices: Vec<usize>,
        #[serde(default)]
        ids: Vec<String>,
    },
    State,
}

#[derive(Serialize, Debug)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Sent before an upload or query starts. Snapshots are only taken
    /// between actions, so this is where clients see `awaiting_response`.
    Processing {
        state: SessionState,
    },
    UploadReport {
        files: Vec<ExtractionOutcome>,
        indexed_documents: usize,
        reused: bool,
    },
    Response {
        content: String,
        timestamp: i64,
    },
    ConfirmSave,
    Saved {
        id: String,
    },
    SaveDeclined,
    Ended,
    Conversations {
        visible: bool,
        conversations: Vec<Conversation>,
    },
    Deleted {
        removed: usize,
    },
    State {
        session: SessionSnapshot,
    },
    Error {
        kind: String,
        message: String,
    },
}

impl ServerMessage {
    pub fn processing() -> Self {
        ServerMessage::Processing { state: SessionState::AwaitingResponse }
    }
}

impl From<&ChatError> for ServerMessage {
    fn from(err: &ChatError) -> Self {
        ServerMessage::Error {
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_messages_parse_from_tagged_json() {
        let msg: ClientMessage = serde_json::from_str(r#"{"type":"chat","content":"hi"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::Chat { content } if content == "hi"));

        let msg: ClientMessage = serde_json::from_str(r#"{"type":"confirm_save"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::ConfirmSave));

        let msg: ClientMessage = serde_json
            ::from_str(r#"{"type":"delete_conversations","indices":[0,2]}"#)
            .unwrap();
        match msg {
            ClientMessage::DeleteConversations { indices, ids } => {
                assert_eq!(indices, vec![0, 2]);
                assert!(ids.is_empty());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn upload_payload_decodes_base64() {
        let payload = UploadPayload {
            name: "a.pdf".into(),
            mime_type: "application/pdf".into(),
            data: STANDARD.encode(b"%PDF-1.5"),
        };
        assert_eq!(payload.decode().unwrap().bytes, b"%PDF-1.5");

        let bad = UploadPayload {
            name: "b.pdf".into(),
            mime_type: "application/pdf".into(),
            data: "not base64!".into(),
        };
        assert_eq!(bad.decode().unwrap_err().kind(), "extraction");
    }

    #[test]
    fn processing_reports_awaiting_response() {
        let json = serde_json::to_value(ServerMessage::processing()).unwrap();
        assert_eq!(json["type"], "processing");
        assert_eq!(json["state"], "awaiting_response");
    }

    #[test]
    fn errors_serialize_with_kind() {
        let json = serde_json::to_value(ServerMessage::from(&ChatError::MissingCredential)).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["kind"], "missing_credential");
    }
}
