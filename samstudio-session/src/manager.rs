//! Registry of open sessions
//!
//! At most one session per image. Terminated sessions are dropped from the
//! registry the next time `open` runs, so their image can be reopened.

use crate::session::Session;
use dashmap::DashMap;
use parking_lot::Mutex;
use samstudio_core::config::{SessionConfig, StudioConfig};
use samstudio_core::{Error, ImageId, Result, SessionId};
use samstudio_engine::{EmbeddingCache, MaskEngine};
use samstudio_model::{ImageSource, ModelBackend};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Owns every open session. Sessions run in parallel with each other;
/// operations within one session are serialized by the session itself.
pub struct SessionManager {
    engine: Arc<MaskEngine>,
    sessions: DashMap<SessionId, Session>,
    by_image: DashMap<ImageId, SessionId>,
    config: SessionConfig,
    // Serializes open/close bookkeeping; never held across an await
    registry: Mutex<()>,
}

impl SessionManager {
    pub fn new(engine: Arc<MaskEngine>, config: SessionConfig) -> Self {
        Self {
            engine,
            sessions: DashMap::new(),
            by_image: DashMap::new(),
            config,
            registry: Mutex::new(()),
        }
    }

    /// Build the cache, engine and manager described by `config`.
    pub fn from_config(backend: Arc<dyn ModelBackend>, config: &StudioConfig) -> Self {
        let cache = EmbeddingCache::new(config.cache.capacity);
        let engine = MaskEngine::new(backend, cache, config.engine.clone());
        Self::new(Arc::new(engine), config.sessions.clone())
    }

    pub fn engine(&self) -> &Arc<MaskEngine> {
        &self.engine
    }

    /// Open a session on `image`. Opening an image that already has a
    /// session returns that session.
    ///
    /// At capacity the least recently used idle session is closed to make
    /// room; when every session is busy this fails with `SessionLimit`.
    pub async fn open(&self, image: ImageSource) -> Result<Session> {
        let _registry = self.registry.lock();

        if let Some(existing) = self.by_image.get(&image.id).map(|id| *id) {
            if let Some(session) = self.sessions.get(&existing).map(|s| s.clone()) {
                if !session.is_defunct() {
                    debug!("Image {} already open in session {}", image.id, existing);
                    return Ok(session);
                }
            }
        }

        self.prune_defunct();
        if self.sessions.len() >= self.config.max_open_sessions {
            self.evict_idle()?;
        }

        let session = Session::new(image, self.engine.clone());
        self.by_image.insert(session.image().id.clone(), session.id());
        self.sessions.insert(session.id(), session.clone());
        info!(
            "Opened session {} for image {} ({} open)",
            session.id(),
            session.image().id,
            self.sessions.len()
        );
        Ok(session)
    }

    /// Drop terminated sessions from the registry. They keep failing for
    /// holders of their handle.
    fn prune_defunct(&self) {
        let defunct: Vec<Session> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().is_defunct())
            .map(|entry| entry.value().clone())
            .collect();
        for session in defunct {
            warn!(
                "Dropping defunct session {} for image {}",
                session.id(),
                session.image().id
            );
            self.forget(&session);
        }
    }

    fn evict_idle(&self) -> Result<()> {
        let mut candidates: Vec<Session> = self.sessions.iter().map(|entry| entry.value().clone()).collect();
        candidates.sort_by_key(|session| session.last_used());

        for session in candidates {
            if session.try_close_idle() {
                self.forget(&session);
                info!("Evicted idle session {} to stay within capacity", session.id());
                return Ok(());
            }
        }

        warn!(
            "All {} sessions are busy, refusing to open another",
            self.sessions.len()
        );
        Err(Error::SessionLimit(self.config.max_open_sessions))
    }

    fn forget(&self, session: &Session) {
        self.sessions.remove(&session.id());
        self.by_image
            .remove_if(&session.image().id, |_, owner| *owner == session.id());
    }

    /// Close a session, waiting for its running operation to finish, and
    /// release its embedding reference. Persistence is the caller's concern.
    pub async fn close(&self, id: SessionId) -> Result<()> {
        let session = {
            let _registry = self.registry.lock();
            let session = self
                .sessions
                .get(&id)
                .map(|s| s.clone())
                .ok_or(Error::UnknownSession(id))?;
            self.forget(&session);
            session
        };

        session.close().await;
        info!("Closed session {}", id);
        Ok(())
    }

    pub fn get(&self, id: SessionId) -> Option<Session> {
        self.sessions.get(&id).map(|s| s.clone())
    }

    pub fn find(&self, image: &ImageId) -> Option<Session> {
        let id = self.by_image.get(image).map(|id| *id)?;
        self.get(id)
    }

    pub fn list(&self) -> Vec<SessionId> {
        self.sessions.iter().map(|entry| *entry.key()).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Close every session
    pub async fn shutdown(&self) {
        for id in self.list() {
            if let Err(e) = self.close(id).await {
                debug!("Session {} already gone during shutdown: {}", id, e);
            }
        }
    }
}
