//! Per-user session registry.
//!
//! Maps a Slack user id to that user's live session. Each user owns a slot
//! holding a [`OnceCell`]; creation runs inside the cell, outside the map
//! lock, so a slow program start for one user never blocks lookups or
//! creations for anyone else, while two near-simultaneous requests from the
//! same user still produce exactly one session.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::{OnceCell, RwLock};
use tracing::debug;

use crate::Result;

type Slot<T> = Arc<OnceCell<Arc<T>>>;

/// Outcome of [`SessionRegistry::get_or_create`].
#[derive(Debug)]
pub enum Lookup<T> {
    /// The user already had a session.
    Existing(Arc<T>),
    /// A session was created by this call.
    Created {
        /// The freshly registered session.
        session: Arc<T>,
        /// Initial output produced when the session started.
        greeting: String,
    },
}

impl<T> Lookup<T> {
    /// The session regardless of how it was obtained.
    #[must_use]
    pub fn session(&self) -> &Arc<T> {
        match self {
            Self::Existing(session) | Self::Created { session, .. } => session,
        }
    }
}

/// Concurrency-safe mapping from user id to session.
#[derive(Debug)]
pub struct SessionRegistry<T> {
    slots: RwLock<HashMap<String, Slot<T>>>,
}

impl<T> Default for SessionRegistry<T> {
    fn default() -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
        }
    }
}

impl<T> SessionRegistry<T> {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the user's session, creating it with `factory` when absent.
    ///
    /// The factory yields the new session and its greeting text. If it
    /// fails, nothing is registered and the next call tries again.
    ///
    /// # Errors
    ///
    /// Propagates the factory's error.
    pub async fn get_or_create<F, Fut>(&self, user: &str, factory: F) -> Result<Lookup<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(T, String)>>,
    {
        if let Some(session) = self.get(user).await {
            return Ok(Lookup::Existing(session));
        }

        let slot = {
            let mut slots = self.slots.write().await;
            Arc::clone(slots.entry(user.to_owned()).or_default())
        };

        let mut greeting = None;
        let created = &mut greeting;
        let init = slot
            .get_or_try_init(|| async move {
                let (session, text) = factory().await?;
                *created = Some(text);
                Ok::<_, crate::AppError>(Arc::new(session))
            })
            .await;
        let session = match init {
            Ok(session) => Arc::clone(session),
            Err(err) => {
                self.discard_empty_slot(user, &slot).await;
                return Err(err);
            }
        };

        // The slot may have been removed while the factory ran; make sure the
        // session we hand out is the registered one.
        {
            let mut slots = self.slots.write().await;
            let current = slots.entry(user.to_owned()).or_insert_with(|| Arc::clone(&slot));
            if !Arc::ptr_eq(current, &slot) && current.get().is_none() {
                *current = Arc::clone(&slot);
            }
        }

        Ok(match greeting {
            Some(greeting) => {
                debug!(user, "session registered");
                Lookup::Created { session, greeting }
            }
            None => Lookup::Existing(session),
        })
    }

    /// Drop `slot` if it is still the user's entry and was never filled.
    async fn discard_empty_slot(&self, user: &str, slot: &Slot<T>) {
        let mut slots = self.slots.write().await;
        if slots
            .get(user)
            .is_some_and(|current| Arc::ptr_eq(current, slot) && !current.initialized())
        {
            slots.remove(user);
            debug!(user, "empty session slot discarded");
        }
    }

    /// Look up the user's session.
    pub async fn get(&self, user: &str) -> Option<Arc<T>> {
        let slots = self.slots.read().await;
        slots.get(user).and_then(|slot| slot.get()).cloned()
    }

    /// `true` when the user has a registered session.
    pub async fn contains(&self, user: &str) -> bool {
        self.get(user).await.is_some()
    }

    /// Number of registered sessions.
    pub async fn len(&self) -> usize {
        let slots = self.slots.read().await;
        slots.values().filter(|slot| slot.initialized()).count()
    }

    /// Number of users with a map entry, including sessions still starting.
    pub async fn tracked_users(&self) -> usize {
        self.slots.read().await.len()
    }

    /// `true` when no sessions are registered.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Forget the user's session. Removing an absent user is a no-op.
    pub async fn remove(&self, user: &str) -> Option<Arc<T>> {
        let mut slots = self.slots.write().await;
        let removed = slots.remove(user).and_then(|slot| slot.get().cloned());
        if removed.is_some() {
            debug!(user, "session unregistered");
        }
        removed
    }

    /// Remove every session, returning them for cleanup.
    pub async fn drain(&self) -> Vec<Arc<T>> {
        let mut slots = self.slots.write().await;
        slots
            .drain()
            .filter_map(|(_, slot)| slot.get().cloned())
            .collect()
    }
}
