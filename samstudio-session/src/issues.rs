//! Discussion threads attached to annotations.
//!
//! Threads are keyed by their own id and outlive the annotation they point
//! at: deleting an annotation leaves its threads in place for audit.

use chrono::{DateTime, Utc};
use samstudio_core::{AnnotationId, Error, Result, ThreadId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comment {
    pub author: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

impl Comment {
    pub fn new(author: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            author: author.into(),
            body: body.into(),
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadStatus {
    Open,
    Resolved,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IssueThread {
    pub id: ThreadId,
    pub annotation_id: AnnotationId,
    pub status: ThreadStatus,
    pub comments: Vec<Comment>,
    pub opened_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl IssueThread {
    pub fn is_open(&self) -> bool {
        self.status == ThreadStatus::Open
    }
}

#[derive(Debug, Default)]
pub struct IssueStore {
    threads: HashMap<ThreadId, IssueThread>,
    open_by_annotation: HashMap<AnnotationId, ThreadId>,
    by_annotation: HashMap<AnnotationId, Vec<ThreadId>>,
}

impl IssueStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a thread on `annotation_id`. Fails with `ThreadAlreadyOpen` while
    /// another thread on the same annotation is unresolved.
    pub fn open_thread(&mut self, annotation_id: AnnotationId, initial: Comment) -> Result<&IssueThread> {
        if self.open_by_annotation.contains_key(&annotation_id) {
            return Err(Error::ThreadAlreadyOpen(annotation_id));
        }

        let thread = IssueThread {
            id: ThreadId::new(),
            annotation_id,
            status: ThreadStatus::Open,
            comments: vec![initial],
            opened_at: Utc::now(),
            resolved_at: None,
        };
        let id = thread.id;
        debug!("Opened issue thread {} on annotation {}", id, annotation_id);

        self.open_by_annotation.insert(annotation_id, id);
        self.by_annotation.entry(annotation_id).or_default().push(id);
        Ok(self.threads.entry(id).or_insert(thread))
    }

    pub fn add_comment(&mut self, thread_id: ThreadId, comment: Comment) -> Result<&IssueThread> {
        let thread = self.threads.get_mut(&thread_id).ok_or(Error::UnknownThread(thread_id))?;
        if !thread.is_open() {
            return Err(Error::ThreadResolved(thread_id));
        }
        thread.comments.push(comment);
        Ok(thread)
    }

    /// Mark a thread resolved. Resolving a resolved thread changes nothing.
    pub fn resolve(&mut self, thread_id: ThreadId) -> Result<&IssueThread> {
        let thread = self.threads.get_mut(&thread_id).ok_or(Error::UnknownThread(thread_id))?;
        if thread.is_open() {
            thread.status = ThreadStatus::Resolved;
            thread.resolved_at = Some(Utc::now());
            self.open_by_annotation.remove(&thread.annotation_id);
            debug!("Resolved issue thread {}", thread_id);
        }
        Ok(thread)
    }

    pub fn get(&self, thread_id: ThreadId) -> Option<&IssueThread> {
        self.threads.get(&thread_id)
    }

    /// The unresolved thread on an annotation, if any
    pub fn open_thread_for(&self, annotation_id: AnnotationId) -> Option<&IssueThread> {
        self.open_by_annotation
            .get(&annotation_id)
            .and_then(|id| self.threads.get(id))
    }

    /// All threads ever opened on an annotation, oldest first
    pub fn threads_for(&self, annotation_id: AnnotationId) -> Vec<&IssueThread> {
        self.by_annotation
            .get(&annotation_id)
            .map(|ids| ids.iter().filter_map(|id| self.threads.get(id)).collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.threads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }
}
