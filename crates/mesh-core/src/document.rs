//! SharedText: the replicated text document.
//!
//! A Loro document with a single `body` text container. The handle is cheap
//! to clone; the editor and the provider share one instance.
//!
//! Every state change, whether a local edit or a merge of a peer's delta that
//! brought in new operations, is published to subscribers as a delta covering
//! exactly the new operations. Merging a delta that adds nothing publishes
//! nothing, which is what stops relayed deltas from bouncing forever.

use crate::ClientId;
use loro::{ExportMode, LoroDoc, LoroText, VersionVector};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("Loro error: {0}")]
    Loro(String),

    #[error("Export failed: {0}")]
    Export(String),
}

pub type Result<T> = std::result::Result<T, DocumentError>;

const BODY: &str = "body";

struct Inner {
    doc: LoroDoc,
    /// Version covered by the last published delta. Holding this lock
    /// serializes mutate-then-export so deltas never overlap or skip.
    published: Mutex<VersionVector>,
    observers: Mutex<Vec<mpsc::UnboundedSender<Vec<u8>>>>,
}

/// Replicated text shared between the editor and the mesh provider.
#[derive(Clone)]
pub struct SharedText {
    inner: Arc<Inner>,
}

impl SharedText {
    /// Create an empty document whose operations are attributed to `client_id`.
    pub fn new(client_id: ClientId) -> Result<Self> {
        let doc = LoroDoc::new();
        doc.set_peer_id(client_id.as_u64())
            .map_err(|e| DocumentError::Loro(e.to_string()))?;
        let published = doc.oplog_vv();
        Ok(Self {
            inner: Arc::new(Inner {
                doc,
                published: Mutex::new(published),
                observers: Mutex::new(Vec::new()),
            }),
        })
    }

    /// Receive every delta produced from now on.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<Vec<u8>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .observers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(tx);
        rx
    }

    /// Current text content.
    pub fn text(&self) -> String {
        self.body().to_string()
    }

    /// Length in Unicode scalar values.
    pub fn len(&self) -> usize {
        self.body().len_unicode()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert `text` at Unicode position `pos`.
    pub fn insert(&self, pos: usize, text: &str) -> Result<()> {
        self.mutate(|body| body.insert(pos, text))
    }

    /// Delete `len` Unicode scalar values starting at `pos`.
    pub fn delete(&self, pos: usize, len: usize) -> Result<()> {
        self.mutate(|body| body.delete(pos, len))
    }

    /// Append `text` at the end.
    pub fn push_str(&self, text: &str) -> Result<()> {
        self.mutate(|body| body.insert(body.len_unicode(), text))
    }

    /// Full-state snapshot for cold-start sync.
    pub fn snapshot(&self) -> Result<Vec<u8>> {
        self.inner
            .doc
            .export(ExportMode::Snapshot)
            .map_err(|e| DocumentError::Export(e.to_string()))
    }

    /// Version of all operations known locally.
    pub fn version(&self) -> VersionVector {
        self.inner.doc.oplog_vv()
    }

    /// Merge a delta or snapshot from a peer.
    ///
    /// Idempotent and commutative. Returns true if new operations were
    /// integrated (in which case subscribers receive them as a delta).
    pub fn apply(&self, delta: &[u8]) -> Result<bool> {
        let mut published = self.published();
        self.inner
            .doc
            .import(delta)
            .map_err(|e| DocumentError::Loro(e.to_string()))?;
        self.publish_since(&mut published)
    }

    fn mutate(&self, op: impl FnOnce(&LoroText) -> loro::LoroResult<()>) -> Result<()> {
        let mut published = self.published();
        op(&self.body()).map_err(|e| DocumentError::Loro(e.to_string()))?;
        self.inner.doc.commit();
        self.publish_since(&mut published)?;
        Ok(())
    }

    /// Export everything newer than `published`, advance it, and notify.
    fn publish_since(&self, published: &mut VersionVector) -> Result<bool> {
        let current = self.inner.doc.oplog_vv();
        if current == *published {
            return Ok(false);
        }
        let delta = self
            .inner
            .doc
            .export(ExportMode::updates(published))
            .map_err(|e| DocumentError::Export(e.to_string()))?;
        *published = current;

        self.inner
            .observers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|tx| tx.send(delta.clone()).is_ok());
        Ok(true)
    }

    fn body(&self) -> LoroText {
        self.inner.doc.get_text(BODY)
    }

    fn published(&self) -> std::sync::MutexGuard<'_, VersionVector> {
        self.inner.published.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl std::fmt::Debug for SharedText {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedText")
            .field("text", &self.text())
            .finish()
    }
}
