//! One open image and everything attached to it.
//!
//! All operations on a session run under its async mutex, so they are
//! applied one at a time in arrival order. A fatal error terminates the
//! session; every later call fails with `SessionTerminated`.

use crate::history::{AnnotationHistory, EditKind, HistoryEntry, HistoryOutcome, Operation};
use crate::issues::{Comment, IssueStore, IssueThread};
use chrono::{DateTime, Utc};
use parking_lot::Mutex as SyncMutex;
use samstudio_core::{AnnotationId, AnnotationObject, Error, Geometry, PromptSet, Result, SessionId, ThreadId};
use samstudio_engine::{CallOptions, EmbeddingKey, EmbeddingLease, MaskEngine, MaskResult};
use samstudio_model::ImageSource;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Open,
    Closed,
    Terminated,
}

struct SessionState {
    status: SessionStatus,
    lease: Option<EmbeddingLease>,
    history: AnnotationHistory,
    issues: IssueStore,
    dirty: bool,
    clipboard: Option<AnnotationObject>,
}

struct SessionInner {
    id: SessionId,
    image: ImageSource,
    engine: Arc<MaskEngine>,
    opened_at: DateTime<Utc>,
    last_used: SyncMutex<Instant>,
    // Mirrors a non-Open status for callers that cannot await the state lock
    defunct: AtomicBool,
    state: Mutex<SessionState>,
}

/// Cloneable handle to an open session.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    pub(crate) fn new(image: ImageSource, engine: Arc<MaskEngine>) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                id: SessionId::new(),
                image,
                engine,
                opened_at: Utc::now(),
                last_used: SyncMutex::new(Instant::now()),
                defunct: AtomicBool::new(false),
                state: Mutex::new(SessionState {
                    status: SessionStatus::Open,
                    lease: None,
                    history: AnnotationHistory::new(),
                    issues: IssueStore::new(),
                    dirty: false,
                    clipboard: None,
                }),
            }),
        }
    }

    pub fn id(&self) -> SessionId {
        self.inner.id
    }

    pub fn image(&self) -> &ImageSource {
        &self.inner.image
    }

    pub fn opened_at(&self) -> DateTime<Utc> {
        self.inner.opened_at
    }

    pub(crate) fn last_used(&self) -> Instant {
        *self.inner.last_used.lock()
    }

    async fn lock_open(&self) -> Result<MutexGuard<'_, SessionState>> {
        let state = self.inner.state.lock().await;
        *self.inner.last_used.lock() = Instant::now();
        match state.status {
            SessionStatus::Open => Ok(state),
            SessionStatus::Closed => Err(Error::SessionClosed(self.inner.id)),
            SessionStatus::Terminated => Err(Error::SessionTerminated(self.inner.id)),
        }
    }

    /// Terminate the session if `result` carries a fatal error.
    fn check<T>(&self, state: &mut SessionState, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if e.is_fatal() {
                error!("Terminating session {}: {}", self.inner.id, e);
                state.status = SessionStatus::Terminated;
                state.lease = None;
                self.inner.defunct.store(true, Ordering::SeqCst);
            }
        }
        result
    }

    /// Closed or terminated. Readable without the state lock.
    pub(crate) fn is_defunct(&self) -> bool {
        self.inner.defunct.load(Ordering::SeqCst)
    }

    #[cfg(test)]
    pub(crate) async fn fail_with(&self, error: Error) {
        let mut state = self.inner.state.lock().await;
        let _ = self.check::<()>(&mut state, Err(error));
    }

    pub async fn status(&self) -> SessionStatus {
        self.inner.state.lock().await.status
    }

    /// Compute or fetch the image embedding ahead of the first prediction.
    pub async fn prepare(&self) -> Result<()> {
        let options = self.inner.engine.default_options();
        let mut state = self.lock_open().await?;
        let result = self
            .inner
            .engine
            .ensure_embedding(&self.inner.image, &mut state.lease, options)
            .await;
        self.check(&mut state, result)
    }

    pub async fn predict(&self, prompts: PromptSet) -> Result<Vec<MaskResult>> {
        let options = self.inner.engine.default_options();
        self.predict_with(prompts, options).await
    }

    /// Ranked mask candidates for `prompts`, most confident first.
    pub async fn predict_with(&self, prompts: PromptSet, options: CallOptions) -> Result<Vec<MaskResult>> {
        let mut state = self.lock_open().await?;
        let result = self
            .inner
            .engine
            .predict(&self.inner.image, &mut state.lease, prompts, options)
            .await;
        self.check(&mut state, result)
    }

    pub async fn apply(&self, operation: Operation) -> Result<AnnotationObject> {
        let mut state = self.lock_open().await?;
        let result = state.history.apply(operation);
        if result.is_ok() {
            state.dirty = true;
        }
        self.check(&mut state, result)
    }

    /// Commit a predicted candidate as a model-accepted annotation.
    pub async fn accept(&self, candidate: MaskResult, label: impl Into<String>) -> Result<AnnotationObject> {
        if candidate.image != self.inner.image.id {
            return Err(Error::ForeignCandidate(candidate.image.to_string()));
        }
        self.apply(Operation::AcceptMask {
            candidate,
            label: label.into(),
        })
        .await
    }

    pub async fn edit(&self, id: AnnotationId, change: EditKind) -> Result<AnnotationObject> {
        self.apply(Operation::Edit { id, change }).await
    }

    pub async fn delete(&self, id: AnnotationId) -> Result<AnnotationObject> {
        self.apply(Operation::Delete { id }).await
    }

    pub async fn restore(&self, id: AnnotationId) -> Result<AnnotationObject> {
        self.apply(Operation::Restore { id }).await
    }

    pub async fn undo(&self) -> Result<HistoryOutcome> {
        let mut state = self.lock_open().await?;
        let outcome = state.history.undo();
        if outcome != HistoryOutcome::AtBoundary {
            state.dirty = true;
        }
        Ok(outcome)
    }

    pub async fn redo(&self) -> Result<HistoryOutcome> {
        let mut state = self.lock_open().await?;
        let outcome = state.history.redo();
        if outcome != HistoryOutcome::AtBoundary {
            state.dirty = true;
        }
        Ok(outcome)
    }

    /// Snapshot a live annotation into the clipboard.
    pub async fn copy(&self, id: AnnotationId) -> Result<()> {
        let mut state = self.lock_open().await?;
        let object = state.history.get(id).cloned().ok_or(Error::UnknownAnnotation(id))?;
        debug!("Copied annotation {} in session {}", id, self.inner.id);
        state.clipboard = Some(object);
        Ok(())
    }

    /// Create a new annotation from the clipboard, moved by (dx, dy).
    pub async fn paste(&self, dx: f32, dy: f32) -> Result<AnnotationObject> {
        let mut state = self.lock_open().await?;
        let source = state.clipboard.clone().ok_or(Error::ClipboardEmpty)?;
        let result = state.history.apply(Operation::Create {
            label: source.label,
            geometry: source.geometry.translated(dx, dy),
            provenance: source.provenance,
            model_version: source.model_version,
            score: source.score,
        });
        if result.is_ok() {
            state.dirty = true;
        }
        self.check(&mut state, result)
    }

    /// Open an issue thread on a live annotation.
    pub async fn open_thread(&self, annotation_id: AnnotationId, initial: Comment) -> Result<IssueThread> {
        let mut state = self.lock_open().await?;
        if !state.history.is_live(annotation_id) {
            return Err(Error::UnknownAnnotation(annotation_id));
        }
        let thread = state.issues.open_thread(annotation_id, initial)?.clone();
        state.dirty = true;
        Ok(thread)
    }

    pub async fn add_comment(&self, thread_id: ThreadId, comment: Comment) -> Result<IssueThread> {
        let mut state = self.lock_open().await?;
        let thread = state.issues.add_comment(thread_id, comment)?.clone();
        state.dirty = true;
        Ok(thread)
    }

    pub async fn resolve_thread(&self, thread_id: ThreadId) -> Result<IssueThread> {
        let mut state = self.lock_open().await?;
        let thread = state.issues.resolve(thread_id)?.clone();
        state.dirty = true;
        Ok(thread)
    }

    pub async fn thread(&self, thread_id: ThreadId) -> Result<IssueThread> {
        let state = self.lock_open().await?;
        state
            .issues
            .get(thread_id)
            .cloned()
            .ok_or(Error::UnknownThread(thread_id))
    }

    /// Every thread ever opened on an annotation, including after deletion
    pub async fn threads_for(&self, annotation_id: AnnotationId) -> Result<Vec<IssueThread>> {
        let state = self.lock_open().await?;
        Ok(state.issues.threads_for(annotation_id).into_iter().cloned().collect())
    }

    /// Live annotations in creation order
    pub async fn annotations(&self) -> Result<Vec<AnnotationObject>> {
        let state = self.lock_open().await?;
        Ok(state.history.annotations().cloned().collect())
    }

    pub async fn annotation(&self, id: AnnotationId) -> Result<AnnotationObject> {
        let state = self.lock_open().await?;
        state.history.get(id).cloned().ok_or(Error::UnknownAnnotation(id))
    }

    /// Polygon outlines of the live annotations, masks reduced to their hull
    pub async fn outlines(&self) -> Result<Vec<(AnnotationId, Geometry)>> {
        let state = self.lock_open().await?;
        Ok(state
            .history
            .annotations()
            .map(|a| (a.id, Geometry::polygon(a.geometry.outline())))
            .collect())
    }

    pub async fn history(&self) -> Result<Vec<HistoryEntry>> {
        let state = self.lock_open().await?;
        Ok(state.history.entries().to_vec())
    }

    pub async fn cursor(&self) -> Result<usize> {
        let state = self.lock_open().await?;
        Ok(state.history.cursor())
    }

    pub async fn is_dirty(&self) -> Result<bool> {
        let state = self.lock_open().await?;
        Ok(state.dirty)
    }

    /// Called by the persistence layer after saving
    pub async fn mark_clean(&self) -> Result<()> {
        let mut state = self.lock_open().await?;
        state.dirty = false;
        Ok(())
    }

    /// Key of the embedding this session holds, if any
    pub async fn embedding_key(&self) -> Option<EmbeddingKey> {
        let state = self.inner.state.lock().await;
        state.lease.as_ref().map(|lease| lease.key().clone())
    }

    /// Close after any running operation finishes. Releases the embedding.
    pub(crate) async fn close(&self) {
        let mut state = self.inner.state.lock().await;
        Self::shut(&self.inner, &mut state);
    }

    /// Close only if no operation is running. Returns whether it closed.
    pub(crate) fn try_close_idle(&self) -> bool {
        match self.inner.state.try_lock() {
            Ok(mut state) => {
                Self::shut(&self.inner, &mut state);
                true
            }
            Err(_) => false,
        }
    }

    fn shut(inner: &SessionInner, state: &mut SessionState) {
        let id = inner.id;
        if state.status == SessionStatus::Open {
            state.status = SessionStatus::Closed;
        }
        inner.defunct.store(true, Ordering::SeqCst);
        if state.lease.take().is_some() {
            debug!("Session {} released its embedding", id);
        }
        if state.dirty {
            info!("Session {} closed with unsaved changes", id);
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("image", &self.inner.image.id)
            .finish()
    }
}
