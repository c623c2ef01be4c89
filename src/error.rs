use thiserror::Error;

/// Failures of a single user action. None of them invalidates the session.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("Unsupported file type '{0}'; upload a PDF or DOCX file")]
    UnsupportedFileType(String),

    #[error("Conversation store is corrupt at line {line}: {source}")]
    CorruptStore {
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("No API key provided; enter your API key to start chatting")]
    MissingCredential,

    #[error("Model backend query failed: {0}")]
    BackendQuery(String),

    #[error("No readable documents were uploaded")]
    NoDocuments,

    #[error("Upload PDF or DOCX files before asking questions")]
    NoIndex,

    #[error("There is no save waiting for confirmation")]
    NoPendingSave,

    #[error("Prompt is empty")]
    EmptyPrompt,

    #[error("No question is waiting for an answer")]
    NothingPending,

    #[error("Failed to extract text from '{name}': {reason}")]
    Extraction { name: String, reason: String },

    #[error("Conversation store IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl ChatError {
    /// Stable tag sent to clients alongside the message.
    pub fn kind(&self) -> &'static str {
        match self {
            ChatError::UnsupportedFileType(_) => "unsupported_file_type",
            ChatError::CorruptStore { .. } => "corrupt_store",
            ChatError::MissingCredential => "missing_credential",
            ChatError::BackendQuery(_) => "backend_query",
            ChatError::NoDocuments => "no_documents",
            ChatError::NoIndex => "no_index",
            ChatError::NoPendingSave => "no_pending_save",
            ChatError::EmptyPrompt => "empty_prompt",
            ChatError::NothingPending => "nothing_pending",
            ChatError::Extraction { .. } => "extraction",
            ChatError::Io(_) => "io",
            ChatError::Serialization(_) => "serialization",
            ChatError::Config(_) => "config",
        }
    }
}

pub type Result<T> = std::result::Result<T, ChatError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn corrupt_store_reports_line_number() {
        let source = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let err = ChatError::CorruptStore { line: 3, source };
        assert_eq!(err.kind(), "corrupt_store");
        assert!(err.to_string().contains("line 3"));
    }

    #[test]
    fn io_errors_convert() {
        let err: ChatError = std::io::Error::new(std::io::ErrorKind::NotFound, "gone").into();
        assert_eq!(err.kind(), "io");
    }
}
