use crate::session::{PipelineSession, SessionId};
use chrono::{DateTime, Utc};
use std::{collections::HashMap, sync::Arc, time::Duration};
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

pub type SessionHandle = Arc<Mutex<PipelineSession>>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("session {0} not found")]
    NotFound(SessionId),
}

/// Registry of live sessions.
///
/// The map itself is behind one lock that is only held for insert, lookup,
/// delete and reap. Each session sits behind its own lock; holding a
/// [`checkout`](SessionStore::checkout) guard is what gives a caller
/// exclusive right to advance that session.
#[derive(Clone)]
pub struct SessionStore {
    sessions: Arc<Mutex<HashMap<SessionId, SessionHandle>>>,
    idle_ttl: chrono::Duration,
}

impl SessionStore {
    pub fn new(idle_ttl: Duration) -> Self {
        Self {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            idle_ttl: chrono::Duration::from_std(idle_ttl)
                .unwrap_or_else(|_| chrono::Duration::minutes(30)),
        }
    }

    pub async fn create(&self) -> SessionId {
        let session = PipelineSession::new(Utc::now());
        let id = session.id;
        self.sessions
            .lock()
            .await
            .insert(id, Arc::new(Mutex::new(session)));
        debug!(target = "studio.store", session_id = %id, "session_created");
        id
    }

    pub async fn get(&self, id: SessionId) -> Result<SessionHandle, StoreError> {
        self.sessions
            .lock()
            .await
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }

    /// Wait for exclusive access to the session and refresh its idle timer.
    ///
    /// The session may be deleted or reaped while the caller waits for its
    /// lock; membership is checked again once the lock is held so a detached
    /// session is never handed out.
    pub async fn checkout(
        &self,
        id: SessionId,
    ) -> Result<OwnedMutexGuard<PipelineSession>, StoreError> {
        let handle = self.get(id).await?;
        let mut guard = handle.clone().lock_owned().await;
        let registered = self
            .sessions
            .lock()
            .await
            .get(&id)
            .is_some_and(|current| Arc::ptr_eq(current, &handle));
        if !registered {
            return Err(StoreError::NotFound(id));
        }
        guard.touch(Utc::now());
        Ok(guard)
    }

    pub async fn delete(&self, id: SessionId) -> Result<(), StoreError> {
        match self.sessions.lock().await.remove(&id) {
            Some(_) => {
                debug!(target = "studio.store", session_id = %id, "session_deleted");
                Ok(())
            }
            None => Err(StoreError::NotFound(id)),
        }
    }

    /// Drop every session idle for longer than the TTL at `now`. Sessions
    /// currently checked out are in use and therefore never idle.
    pub async fn reap(&self, now: DateTime<Utc>) -> usize {
        let mut guard = self.sessions.lock().await;
        let before = guard.len();
        guard.retain(|_, handle| match handle.try_lock() {
            Ok(session) => !session.is_idle(now, self.idle_ttl),
            Err(_) => true,
        });
        before - guard.len()
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> SessionStore {
        SessionStore::new(Duration::from_secs(60))
    }

    #[tokio::test]
    async fn create_get_delete() {
        let store = store();
        let id = store.create().await;
        assert_eq!(store.len().await, 1);
        let handle = store.get(id).await.expect("present");
        assert_eq!(handle.lock().await.id, id);

        store.delete(id).await.expect("deleted");
        assert_eq!(store.get(id).await.err(), Some(StoreError::NotFound(id)));
        assert_eq!(store.delete(id).await, Err(StoreError::NotFound(id)));
    }

    #[tokio::test]
    async fn unknown_id_is_not_found() {
        let id = SessionId::new_v4();
        assert_eq!(store().checkout(id).await.err(), Some(StoreError::NotFound(id)));
    }

    #[tokio::test]
    async fn reap_evicts_only_idle_sessions() {
        let store = store();
        let stale = store.create().await;
        let fresh = store.create().await;
        let later = Utc::now() + chrono::Duration::seconds(90);
        store
            .get(fresh)
            .await
            .unwrap()
            .lock()
            .await
            .touch(later - chrono::Duration::seconds(10));

        assert_eq!(store.reap(later).await, 1);
        assert_eq!(store.get(stale).await.err(), Some(StoreError::NotFound(stale)));
        assert!(store.get(fresh).await.is_ok());
    }

    #[tokio::test]
    async fn checked_out_session_survives_reap() {
        let store = store();
        let id = store.create().await;
        let guard = store.checkout(id).await.expect("checkout");
        let far = Utc::now() + chrono::Duration::hours(2);
        assert_eq!(store.reap(far).await, 0);
        drop(guard);
        assert_eq!(store.reap(far).await, 1);
    }

    #[tokio::test]
    async fn checkout_waiting_on_removed_session_is_not_found() {
        let store = store();
        let id = store.create().await;
        let holder = store.checkout(id).await.expect("first");

        let waiter = {
            let store = store.clone();
            tokio::spawn(async move { store.checkout(id).await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        store.delete(id).await.expect("deleted");
        drop(holder);

        assert_eq!(waiter.await.expect("join"), Err(StoreError::NotFound(id)));
    }

    #[tokio::test]
    async fn checkout_is_exclusive() {
        let store = store();
        let id = store.create().await;
        let guard = store.checkout(id).await.expect("first");
        let waiting = tokio::time::timeout(Duration::from_millis(50), store.checkout(id)).await;
        assert!(waiting.is_err(), "second checkout must wait");
        drop(guard);
        assert!(store.checkout(id).await.is_ok());
    }
}
