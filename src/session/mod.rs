//! Per-tab chat session: message history, save confirmation and the
//! previous-conversations panel, mediating between user actions, the
//! document index and the conversation store.

pub mod busy;

use log::{ info, warn };
use serde::Serialize;
use sha2::{ Digest, Sha256 };
use std::collections::BTreeSet;
use std::sync::atomic::{ AtomicBool, Ordering };
use std::sync::Arc;

use crate::error::{ ChatError, Result };
use crate::extract::{ extract_all, ExtractionOutcome, UploadedFile };
use crate::history::HistoryStore;
use crate::models::chat::{ ChatMessage, Conversation, Role };
use crate::rag::{ ChatIndex, IndexBuilder, ModelConfig };

pub use busy::BusyGuard;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    AwaitingResponse,
    ConfirmingSave,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConversationsPanel {
    Hidden,
    Visible(Vec<Conversation>),
}

#[derive(Debug, Clone, Serialize)]
pub struct UploadReport {
    pub files: Vec<ExtractionOutcome>,
    pub indexed_documents: usize,
    pub reused: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub messages: Vec<ChatMessage>,
    pub state: SessionState,
    pub confirm_save: bool,
    pub show_conversations: bool,
    pub has_credential: bool,
    pub indexed_documents: Option<usize>,
}

#[derive(Debug, Default)]
struct Session {
    messages: Vec<ChatMessage>,
    confirm_save: bool,
    show_conversations: bool,
    busy: Arc<AtomicBool>,
}

struct LoadedIndex {
    fingerprint: String,
    index: Arc<dyn ChatIndex>,
    outcomes: Vec<ExtractionOutcome>,
}

pub struct SessionController {
    session: Session,
    history: Arc<dyn HistoryStore>,
    index_builder: Arc<dyn IndexBuilder>,
    model_config: ModelConfig,
    credential: Option<String>,
    index: Option<LoadedIndex>,
}

impl SessionController {
    /// A fresh session. `greeting`, when given, is the opening assistant message.
    pub fn new(
        history: Arc<dyn HistoryStore>,
        index_builder: Arc<dyn IndexBuilder>,
        model_config: ModelConfig,
        greeting: Option<&str>
    ) -> Self {
        let mut session = Session::default();
        if let Some(text) = greeting.filter(|g| !g.trim().is_empty()) {
            session.messages.push(ChatMessage::assistant(text));
        }
        Self {
            session,
            history,
            index_builder,
            model_config,
            credential: None,
            index: None,
        }
    }

    pub fn set_credential(&mut self, api_key: &str) {
        let trimmed = api_key.trim();
        self.credential = if trimmed.is_empty() { None } else { Some(trimmed.to_string()) };
    }

    pub fn has_credential(&self) -> bool {
        self.credential.is_some()
    }

    fn require_credential(&self) -> Result<String> {
        self.credential.clone().ok_or(ChatError::MissingCredential)
    }

    fn require_index(&self) -> Result<Arc<dyn ChatIndex>> {
        self.index
            .as_ref()
            .map(|loaded| Arc::clone(&loaded.index))
            .ok_or(ChatError::NoIndex)
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.session.messages
    }

    /// Observers can poll this while a long call is in flight.
    pub fn busy_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.session.busy)
    }

    pub fn state(&self) -> SessionState {
        if self.session.busy.load(Ordering::SeqCst) {
            SessionState::AwaitingResponse
        } else if self.session.confirm_save {
            SessionState::ConfirmingSave
        } else {
            SessionState::Idle
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            messages: self.session.messages.clone(),
            state: self.state(),
            confirm_save: self.session.confirm_save,
            show_conversations: self.session.show_conversations,
            has_credential: self.has_credential(),
            indexed_documents: self.index.as_ref().map(|l| l.index.document_count()),
        }
    }

    /// Extracts the uploaded files and builds an index over them.
    ///
    /// Re-uploading the same set of files reuses the current index. When no
    /// file yields text, the report lists why and the current index is kept.
    pub async fn load_documents(&mut self, files: Vec<UploadedFile>) -> Result<UploadReport> {
        let credential = self.require_credential()?;
        if files.is_empty() {
            return Err(ChatError::NoDocuments);
        }

        let fingerprint = fingerprint(&files);
        if let Some(loaded) = self.index.as_ref().filter(|l| l.fingerprint == fingerprint) {
            info!("Uploaded files unchanged, reusing index");
            return Ok(UploadReport {
                files: loaded.outcomes.clone(),
                indexed_documents: loaded.index.document_count(),
                reused: true,
            });
        }

        let _busy = BusyGuard::acquire(&self.session.busy);
        let (documents, outcomes) = tokio::task
            ::spawn_blocking(move || extract_all(&files)).await
            .map_err(|e| ChatError::Extraction {
                name: "upload".to_string(),
                reason: e.to_string(),
            })?;

        if documents.is_empty() {
            warn!("None of the uploaded files contained readable text");
            return Ok(UploadReport {
                files: outcomes,
                indexed_documents: 0,
                reused: false,
            });
        }

        let index = self.index_builder.build(documents, &self.model_config, &credential).await?;
        let indexed_documents = index.document_count();
        self.index = Some(LoadedIndex {
            fingerprint,
            index,
            outcomes: outcomes.clone(),
        });

        Ok(UploadReport {
            files: outcomes,
            indexed_documents,
            reused: false,
        })
    }

    /// Records the user's prompt and asks the index for an answer.
    ///
    /// Without a credential or an index nothing is recorded. If the backend
    /// call fails the prompt stays in the history unanswered and
    /// [`respond_pending`](Self::respond_pending) re-triggers it.
    pub async fn submit_prompt(&mut self, prompt: &str) -> Result<ChatMessage> {
        let prompt = prompt.trim();
        if prompt.is_empty() {
            return Err(ChatError::EmptyPrompt);
        }
        self.require_credential()?;
        self.require_index()?;

        self.session.messages.push(ChatMessage::user(prompt));
        self.respond_pending().await
    }

    /// Queries the index for the trailing user message, if there is one.
    pub async fn respond_pending(&mut self) -> Result<ChatMessage> {
        self.require_credential()?;
        let index = self.require_index()?;

        let (prompt, history) = match self.session.messages.split_last() {
            Some((last, earlier)) if last.role == Role::User =>
                (last.content.clone(), earlier.to_vec()),
            _ => {
                return Err(ChatError::NothingPending);
            }
        };

        let result = {
            let _busy = BusyGuard::acquire(&self.session.busy);
            index.chat(&prompt, &history).await
        };

        match result {
            Ok(resp) => {
                let message = ChatMessage::assistant(resp.response);
                self.session.messages.push(message.clone());
                Ok(message)
            }
            Err(e) => {
                warn!("Query failed, prompt left pending: {}", e);
                Err(e)
            }
        }
    }

    /// Asks for save confirmation. Returns false when there is nothing to save.
    pub fn request_save(&mut self) -> bool {
        if self.session.messages.is_empty() {
            return false;
        }
        self.session.confirm_save = true;
        true
    }

    /// Persists the whole transcript and returns its id. On failure the
    /// confirmation stays pending and the messages are untouched.
    pub async fn confirm_save(&mut self) -> Result<String> {
        if !self.session.confirm_save {
            return Err(ChatError::NoPendingSave);
        }
        let id = self.history.append(&self.session.messages).await?;
        self.session.confirm_save = false;
        Ok(id)
    }

    pub fn decline_save(&mut self) {
        self.session.confirm_save = false;
    }

    /// Empties the history. The greeting is not restored.
    pub fn end_conversation(&mut self) {
        self.session.messages.clear();
        self.session.confirm_save = false;
    }

    pub fn toggle_conversations(&mut self) -> bool {
        self.session.show_conversations = !self.session.show_conversations;
        self.session.show_conversations
    }

    pub async fn conversations_panel(&self) -> Result<ConversationsPanel> {
        if !self.session.show_conversations {
            return Ok(ConversationsPanel::Hidden);
        }
        Ok(ConversationsPanel::Visible(self.history.list_all().await?))
    }

    /// Deletes stored conversations by listed position. A non-empty selection
    /// also starts the current conversation afresh.
    pub async fn delete_conversations(&mut self, indices: &BTreeSet<usize>) -> Result<usize> {
        if indices.is_empty() {
            return Ok(0);
        }
        let removed = self.history.delete_by_indices(indices).await?;
        self.end_conversation();
        Ok(removed)
    }

    pub async fn delete_conversations_by_id(&mut self, ids: &BTreeSet<String>) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let removed = self.history.delete_by_ids(ids).await?;
        self.end_conversation();
        Ok(removed)
    }
}

fn fingerprint(files: &[UploadedFile]) -> String {
    let mut hasher = Sha256::new();
    for file in files {
        hasher.update(file.name.as_bytes());
        hasher.update([0u8]);
        hasher.update(file.mime_type.as_bytes());
        hasher.update([0u8]);
        hasher.update((file.bytes.len() as u64).to_le_bytes());
        hasher.update(&file.bytes);
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::{ Document, DOCX_MIME, PDF_MIME };
    use crate::history::JsonlHistoryStore;
    use crate::rag::ChatResponse;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use tempfile::TempDir;

    struct EchoIndex {
        busy: Mutex<Option<Arc<AtomicBool>>>,
        saw_busy: AtomicBool,
        fail: AtomicBool,
        seen_history: Mutex<Vec<usize>>,
        documents: usize,
    }

    #[async_trait]
    impl ChatIndex for EchoIndex {
        async fn chat(&self, prompt: &str, history: &[ChatMessage]) -> Result<ChatResponse> {
            if let Some(flag) = self.busy.lock().unwrap().as_ref() {
                self.saw_busy.store(flag.load(Ordering::SeqCst), Ordering::SeqCst);
            }
            self.seen_history.lock().unwrap().push(history.len());
            if self.fail.load(Ordering::SeqCst) {
                return Err(ChatError::BackendQuery("timeout".into()));
            }
            Ok(ChatResponse { response: format!("answer to {}", prompt) })
        }

        fn document_count(&self) -> usize {
            self.documents
        }
    }

    #[derive(Default)]
    struct CountingBuilder {
        builds: AtomicUsize,
        last: Mutex<Option<Arc<EchoIndex>>>,
        last_credential: Mutex<Option<String>>,
    }

    #[async_trait]
    impl IndexBuilder for CountingBuilder {
        async fn build(
            &self,
            documents: Vec<Document>,
            _config: &ModelConfig,
            credential: &str
        ) -> Result<Arc<dyn ChatIndex>> {
            self.builds.fetch_add(1, Ordering::SeqCst);
            *self.last_credential.lock().unwrap() = Some(credential.to_string());
            let index = Arc::new(EchoIndex {
                busy: Mutex::new(None),
                saw_busy: AtomicBool::new(false),
                fail: AtomicBool::new(false),
                seen_history: Mutex::new(Vec::new()),
                documents: documents.len(),
            });
            *self.last.lock().unwrap() = Some(index.clone());
            Ok(index)
        }
    }

    struct BrokenStore;

    #[async_trait]
    impl HistoryStore for BrokenStore {
        async fn append(&self, _messages: &[ChatMessage]) -> Result<String> {
            Err(std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only").into())
        }
        async fn list_all(&self) -> Result<Vec<Conversation>> {
            Ok(Vec::new())
        }
        async fn delete_by_indices(&self, _indices: &BTreeSet<usize>) -> Result<usize> {
            Ok(0)
        }
        async fn delete_by_ids(&self, _ids: &BTreeSet<String>) -> Result<usize> {
            Ok(0)
        }
    }

    fn docx_upload(name: &str) -> UploadedFile {
        use std::io::Write;
        use zip::write::{ FileOptions, ZipWriter };

        let xml =
            "<w:document xmlns:w=\"http://schemas.openxmlformats.org/wordprocessingml/2006/main\">\
             <w:body><w:p><w:r><w:t>st.cache_data caches data.</w:t></w:r></w:p></w:body></w:document>";
        let mut writer = ZipWriter::new(std::io::Cursor::new(Vec::new()));
        writer.start_file("word/document.xml", FileOptions::default()).unwrap();
        writer.write_all(xml.as_bytes()).unwrap();
        UploadedFile {
            name: name.to_string(),
            mime_type: DOCX_MIME.to_string(),
            bytes: writer.finish().unwrap().into_inner(),
        }
    }

    fn controller_with(
        history: Arc<dyn HistoryStore>
    ) -> (SessionController, Arc<CountingBuilder>) {
        let builder = Arc::new(CountingBuilder::default());
        let controller = SessionController::new(
            history,
            builder.clone(),
            ModelConfig::default(),
            Some("Ask me a question about Streamlit!")
        );
        (controller, builder)
    }

    fn controller() -> (SessionController, Arc<CountingBuilder>, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(JsonlHistoryStore::new(dir.path().join("conversations.json")));
        let (controller, builder) = controller_with(store);
        (controller, builder, dir)
    }

    async fn ready_controller() -> (SessionController, Arc<CountingBuilder>, TempDir) {
        let (mut controller, builder, dir) = controller();
        controller.set_credential("sk-test");
        controller.load_documents(vec![docx_upload("guide.docx")]).await.unwrap();
        (controller, builder, dir)
    }

    #[test]
    fn starts_with_greeting_and_idle() {
        let (controller, _builder, _dir) = controller();
        assert_eq!(controller.messages(), &[ChatMessage::assistant("Ask me a question about Streamlit!")]);
        assert_eq!(controller.state(), SessionState::Idle);
        assert!(!controller.has_credential());
    }

    #[tokio::test]
    async fn prompt_without_credential_changes_nothing() {
        let (mut controller, _builder, _dir) = controller();
        let before = controller.messages().to_vec();

        let err = controller.submit_prompt("What is st.write?").await.unwrap_err();
        assert!(matches!(err, ChatError::MissingCredential));
        assert_eq!(controller.messages(), before.as_slice());
    }

    #[tokio::test]
    async fn blank_credential_counts_as_missing() {
        let (mut controller, _builder, _dir) = controller();
        controller.set_credential("   ");
        assert!(!controller.has_credential());
        let err = controller.load_documents(vec![docx_upload("a.docx")]).await.unwrap_err();
        assert!(matches!(err, ChatError::MissingCredential));
    }

    #[tokio::test]
    async fn prompt_before_upload_needs_index() {
        let (mut controller, _builder, _dir) = controller();
        controller.set_credential("sk-test");
        let err = controller.submit_prompt("hello").await.unwrap_err();
        assert!(matches!(err, ChatError::NoIndex));
        assert_eq!(controller.messages().len(), 1);
    }

    #[tokio::test]
    async fn upload_reports_each_file_and_builds_once() {
        let (mut controller, builder, _dir) = controller();
        controller.set_credential("sk-test");
        let files = vec![
            docx_upload("guide.docx"),
            UploadedFile { name: "notes.txt".into(), mime_type: "text/plain".into(), bytes: vec![1] }
        ];

        let report = controller.load_documents(files.clone()).await.unwrap();
        assert_eq!(report.indexed_documents, 1);
        assert!(!report.reused);
        assert!(matches!(&report.files[0], ExtractionOutcome::Extracted { name, .. } if name == "guide.docx"));
        assert!(matches!(&report.files[1], ExtractionOutcome::Skipped { name, .. } if name == "notes.txt"));
        assert_eq!(builder.last_credential.lock().unwrap().as_deref(), Some("sk-test"));

        let again = controller.load_documents(files).await.unwrap();
        assert!(again.reused);
        assert_eq!(builder.builds.load(Ordering::SeqCst), 1);
        assert_eq!(controller.snapshot().indexed_documents, Some(1));
        assert!(!controller.busy_flag().load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn unreadable_upload_keeps_no_index() {
        let (mut controller, builder, _dir) = controller();
        controller.set_credential("sk-test");
        let report = controller
            .load_documents(
                vec![UploadedFile { name: "x.pdf".into(), mime_type: PDF_MIME.into(), bytes: b"junk".to_vec() }]
            ).await
            .unwrap();
        assert_eq!(report.indexed_documents, 0);
        assert_eq!(builder.builds.load(Ordering::SeqCst), 0);
        assert!(matches!(controller.submit_prompt("hi").await, Err(ChatError::NoIndex)));
    }

    #[tokio::test]
    async fn prompt_and_answer_are_appended_in_order() {
        let (mut controller, builder, _dir) = ready_controller().await;
        let index = builder.last.lock().unwrap().clone().unwrap();
        *index.busy.lock().unwrap() = Some(controller.busy_flag());

        let reply = controller.submit_prompt("  What is st.cache_data?  ").await.unwrap();
        assert_eq!(reply, ChatMessage::assistant("answer to What is st.cache_data?"));

        let messages = controller.messages();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[1], ChatMessage::user("What is st.cache_data?"));
        assert_eq!(messages[2].role, Role::Assistant);

        assert!(index.saw_busy.load(Ordering::SeqCst));
        assert_eq!(controller.state(), SessionState::Idle);
        // History passed to the index excludes the prompt itself.
        assert_eq!(*index.seen_history.lock().unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn failed_query_appends_nothing_and_can_be_retried() {
        let (mut controller, builder, _dir) = ready_controller().await;
        let index = builder.last.lock().unwrap().clone().unwrap();
        index.fail.store(true, Ordering::SeqCst);

        let err = controller.submit_prompt("Explain st.fragment").await.unwrap_err();
        assert!(matches!(err, ChatError::BackendQuery(_)));
        assert_eq!(controller.messages().len(), 2);
        assert_eq!(controller.messages()[1].role, Role::User);
        assert_eq!(controller.state(), SessionState::Idle);

        index.fail.store(false, Ordering::SeqCst);
        let reply = controller.respond_pending().await.unwrap();
        assert_eq!(reply.content, "answer to Explain st.fragment");
        assert_eq!(controller.messages().len(), 3);

        assert!(matches!(controller.respond_pending().await, Err(ChatError::NothingPending)));
    }

    #[tokio::test]
    async fn empty_prompt_is_rejected() {
        let (mut controller, _builder, _dir) = ready_controller().await;
        assert!(matches!(controller.submit_prompt("   ").await, Err(ChatError::EmptyPrompt)));
        assert_eq!(controller.messages().len(), 1);
    }

    #[tokio::test]
    async fn save_requires_confirmation() {
        let (mut controller, _builder, _dir) = ready_controller().await;
        controller.submit_prompt("What is st.sidebar?").await.unwrap();

        assert!(matches!(controller.confirm_save().await, Err(ChatError::NoPendingSave)));
        assert!(controller.request_save());
        assert_eq!(controller.state(), SessionState::ConfirmingSave);

        let id = controller.confirm_save().await.unwrap();
        assert_eq!(controller.state(), SessionState::Idle);

        controller.toggle_conversations();
        match controller.conversations_panel().await.unwrap() {
            ConversationsPanel::Visible(list) => {
                assert_eq!(list.len(), 1);
                assert_eq!(list[0].id, id);
                assert_eq!(list[0].messages, controller.messages());
            }
            ConversationsPanel::Hidden => panic!("panel should be visible"),
        }
    }

    #[tokio::test]
    async fn declining_never_touches_the_store() {
        let (mut controller, _builder, dir) = ready_controller().await;
        assert!(controller.request_save());
        controller.decline_save();
        assert_eq!(controller.state(), SessionState::Idle);
        assert!(!dir.path().join("conversations.json").exists());
    }

    #[tokio::test]
    async fn nothing_to_save_when_empty() {
        let (mut controller, _builder, _dir) = controller();
        controller.end_conversation();
        assert!(!controller.request_save());
        assert_eq!(controller.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn failed_save_keeps_messages_and_confirmation() {
        let (mut controller, _builder) = controller_with(Arc::new(BrokenStore));
        let before = controller.messages().to_vec();
        controller.request_save();

        let err = controller.confirm_save().await.unwrap_err();
        assert!(matches!(err, ChatError::Io(_)));
        assert_eq!(controller.messages(), before.as_slice());
        assert_eq!(controller.state(), SessionState::ConfirmingSave);
    }

    #[tokio::test]
    async fn end_conversation_empties_history_and_clears_pending_save() {
        let (mut controller, _builder, _dir) = ready_controller().await;
        controller.submit_prompt("hi").await.unwrap();
        controller.request_save();

        controller.end_conversation();
        assert!(controller.messages().is_empty());
        assert_eq!(controller.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn panel_hidden_by_default_and_toggles() {
        let (mut controller, _builder, _dir) = controller();
        assert_eq!(controller.conversations_panel().await.unwrap(), ConversationsPanel::Hidden);
        assert!(controller.toggle_conversations());
        assert_eq!(controller.conversations_panel().await.unwrap(), ConversationsPanel::Visible(Vec::new()));
        assert!(!controller.toggle_conversations());
    }

    #[tokio::test]
    async fn deleting_selection_resets_current_conversation() {
        let (mut controller, _builder, _dir) = ready_controller().await;
        controller.request_save();
        controller.confirm_save().await.unwrap();
        controller.submit_prompt("still here?").await.unwrap();

        assert_eq!(controller.delete_conversations(&BTreeSet::new()).await.unwrap(), 0);
        assert_eq!(controller.messages().len(), 3);

        assert_eq!(controller.delete_conversations(&BTreeSet::from([0])).await.unwrap(), 1);
        assert!(controller.messages().is_empty());
    }
}
