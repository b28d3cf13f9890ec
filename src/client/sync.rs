//! Text document synchronization.
//!
//! `textDocument/didChange` is not written immediately. Full-text changes are
//! held per document, later edits replacing earlier ones, and reach the
//! server either after the change delay or right before the next outbound
//! message, whichever comes first. The connection pulls them through
//! [`PendingDelivery`], so a request can never overtake an edit it depends
//! on.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use lsp_types::notification::{DidChangeTextDocument, Notification};
use lsp_types::{
    DidChangeTextDocumentParams, TextDocumentContentChangeEvent, Url,
    VersionedTextDocumentIdentifier,
};

use crate::rpc::events::lock;
use crate::rpc::{MessageConnection, NotificationMessage, PendingDelivery};

#[derive(Debug)]
struct PendingChange {
    uri: Url,
    version: i32,
    text: String,
}

#[derive(Debug, Default)]
struct SyncState {
    versions: HashMap<Url, i32>,
    /// At most one entry per document, in the order each was first edited.
    pending: Vec<PendingChange>,
}

/// Open documents, their versions, and the changes not yet sent.
#[derive(Debug, Default)]
pub struct DocumentSync {
    state: Mutex<SyncState>,
    flush_scheduled: AtomicBool,
}

impl DocumentSync {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts tracking `uri` at version 0. Returns false if it was already
    /// open.
    pub fn open(&self, uri: Url) -> bool {
        let mut state = lock(&self.state);
        if state.versions.contains_key(&uri) {
            return false;
        }
        state.versions.insert(uri, 0);
        true
    }

    pub fn is_open(&self, uri: &Url) -> bool {
        lock(&self.state).versions.contains_key(uri)
    }

    pub fn version(&self, uri: &Url) -> Option<i32> {
        lock(&self.state).versions.get(uri).copied()
    }

    /// Records a full-text change and returns the new version, or `None` if
    /// the document is not open.
    pub fn change(&self, uri: &Url, text: String) -> Option<i32> {
        let mut state = lock(&self.state);
        let version = state.versions.get_mut(uri)?;
        *version += 1;
        let version = *version;

        if let Some(existing) = state.pending.iter_mut().find(|change| &change.uri == uri) {
            existing.version = version;
            existing.text = text;
        } else {
            state.pending.push(PendingChange {
                uri: uri.clone(),
                version,
                text,
            });
        }
        Some(version)
    }

    /// Stops tracking `uri`. A change still pending for it stays queued so
    /// it is written before the `didClose`.
    pub fn close(&self, uri: &Url) -> bool {
        lock(&self.state).versions.remove(uri).is_some()
    }

    pub fn has_pending(&self) -> bool {
        !lock(&self.state).pending.is_empty()
    }

    /// Flushes pending changes through `connection` after `delay`. Calls made
    /// while a flush is already scheduled share it.
    pub fn schedule_flush(self: &Arc<Self>, connection: &MessageConnection, delay: Duration) {
        if self.flush_scheduled.swap(true, Ordering::SeqCst) {
            return;
        }
        let this = Arc::clone(self);
        let connection = connection.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            this.flush_scheduled.store(false, Ordering::SeqCst);
            connection.flush_pending_deliveries().await;
        });
    }
}

impl PendingDelivery for DocumentSync {
    fn take_pending(&self) -> Vec<NotificationMessage> {
        let pending = std::mem::take(&mut lock(&self.state).pending);
        pending
            .into_iter()
            .filter_map(|change| {
                let params = DidChangeTextDocumentParams {
                    text_document: VersionedTextDocumentIdentifier {
                        uri: change.uri,
                        version: change.version,
                    },
                    content_changes: vec![TextDocumentContentChangeEvent {
                        range: None,
                        range_length: None,
                        text: change.text,
                    }],
                };
                match serde_json::to_value(params) {
                    Ok(params) => Some(NotificationMessage::new(
                        DidChangeTextDocument::METHOD,
                        Some(params),
                    )),
                    Err(e) => {
                        tracing::warn!("failed to encode didChange params: {e}");
                        None
                    }
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn uri(name: &str) -> Url {
        Url::parse(&format!("file:///workspace/{name}")).unwrap()
    }

    #[test]
    fn test_change_requires_open_document() {
        let sync = DocumentSync::new();
        assert_eq!(sync.change(&uri("a.rs"), "x".to_string()), None);
        assert!(!sync.has_pending());
    }

    #[test]
    fn test_open_twice() {
        let sync = DocumentSync::new();
        assert!(sync.open(uri("a.rs")));
        assert!(!sync.open(uri("a.rs")));
        assert_eq!(sync.version(&uri("a.rs")), Some(0));
    }

    #[test]
    fn test_changes_coalesce_per_document_in_first_edit_order() {
        let sync = DocumentSync::new();
        sync.open(uri("a.rs"));
        sync.open(uri("b.rs"));

        assert_eq!(sync.change(&uri("b.rs"), "b1".to_string()), Some(1));
        assert_eq!(sync.change(&uri("a.rs"), "a1".to_string()), Some(1));
        assert_eq!(sync.change(&uri("b.rs"), "b2".to_string()), Some(2));

        let pending = sync.take_pending();
        assert_eq!(pending.len(), 2);
        assert!(pending.iter().all(|n| n.method == "textDocument/didChange"));

        let first = pending[0].params.as_ref().unwrap();
        assert_eq!(first["textDocument"]["uri"], json!("file:///workspace/b.rs"));
        assert_eq!(first["textDocument"]["version"], json!(2));
        assert_eq!(first["contentChanges"][0]["text"], json!("b2"));

        let second = pending[1].params.as_ref().unwrap();
        assert_eq!(second["textDocument"]["version"], json!(1));

        assert!(sync.take_pending().is_empty());
    }

    #[test]
    fn test_close_keeps_pending_change() {
        let sync = DocumentSync::new();
        sync.open(uri("a.rs"));
        sync.change(&uri("a.rs"), "edit".to_string());
        assert!(sync.close(&uri("a.rs")));
        assert!(!sync.is_open(&uri("a.rs")));
        assert_eq!(sync.take_pending().len(), 1);
    }
}
