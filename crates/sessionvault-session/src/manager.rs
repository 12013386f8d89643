//! Session manager: in-memory working set over a persistent store.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, PoisonError, Weak,
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
    },
};

use chrono::{DateTime, Utc};
use sessionvault_core::{
    ConfigError, DocumentCollection, DocumentDriver, ManagerConfig, Session, SessionIdGenerator,
    SessionStore, StandardIdGenerator, StandardSessionFactory, StoreError, session::now,
};
use tokio::{sync::RwLock, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::store::DocumentSessionStore;

/// Session manager error.
#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Session manager already started")]
    AlreadyStarted,
}

/// Where the manager gets its document collection from.
pub enum ConnectionSource {
    /// A handle owned by the caller. Never closed by the manager.
    Shared(Arc<dyn DocumentCollection>),
    /// Open a connection of our own through this driver. Closed on stop.
    Connect(Arc<dyn DocumentDriver>),
}

/// Active session state.
struct ActiveSession {
    session: Session,
    /// Bumped on every mutation.
    version: u64,
    /// Version last written to the store.
    saved_version: Option<u64>,
}

impl ActiveSession {
    const fn new(session: Session, saved: bool) -> Self {
        Self {
            session,
            version: 0,
            saved_version: if saved { Some(0) } else { None },
        }
    }

    fn is_dirty(&self) -> bool {
        self.saved_version != Some(self.version)
    }
}

/// Point-in-time view of an active session taken by the persistence checks.
struct Snapshot {
    session: Session,
    idle: i64,
    version: u64,
    dirty: bool,
}

/// Background sweep task handle.
struct Sweeper {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Builder for [`SessionManager`].
pub struct SessionManagerBuilder {
    config: ManagerConfig,
    source: Option<ConnectionSource>,
    store: Option<Arc<dyn SessionStore>>,
    id_generator: Arc<dyn SessionIdGenerator>,
}

impl SessionManagerBuilder {
    /// Use a collection handle owned by the caller.
    #[must_use]
    pub fn collection(mut self, collection: Arc<dyn DocumentCollection>) -> Self {
        self.source = Some(ConnectionSource::Shared(collection));
        self
    }

    /// Open a connection through `driver` using the configured hosts and
    /// credentials.
    #[must_use]
    pub fn driver(mut self, driver: Arc<dyn DocumentDriver>) -> Self {
        self.source = Some(ConnectionSource::Connect(driver));
        self
    }

    /// Use a custom store implementation instead of a document collection.
    #[must_use]
    pub fn store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.store = Some(store);
        self
    }

    #[must_use]
    pub fn id_generator(mut self, generator: Arc<dyn SessionIdGenerator>) -> Self {
        self.id_generator = generator;
        self
    }

    /// Build the manager, connecting to the store if needed.
    ///
    /// # Errors
    /// Returns error if the configuration is invalid, no store was given, or
    /// the connection cannot be opened.
    pub async fn build(self) -> Result<SessionManager, ManagerError> {
        self.config.validate()?;

        let interval = self.config.default_max_inactive_interval;
        let (store, owns_connection) = match (self.store, self.source) {
            (Some(store), _) => (store, false),
            (None, Some(ConnectionSource::Shared(collection))) => {
                (document_store(collection, interval), false)
            }
            (None, Some(ConnectionSource::Connect(driver))) => {
                let settings = self.config.connection_settings()?;
                let collection = driver
                    .connect(
                        &settings,
                        &self.config.database_name,
                        &self.config.collection_name,
                    )
                    .await
                    .map_err(|e| StoreError::Connection(e.to_string()))?;
                info!(
                    namespace = %collection.namespace(),
                    hosts = ?settings.hosts,
                    "Opened document store connection"
                );
                (document_store(collection, interval), true)
            }
            (None, None) => return Err(ConfigError::Missing("collection or driver").into()),
        };

        Ok(SessionManager {
            config: self.config,
            store,
            id_generator: self.id_generator,
            owns_connection,
            started: AtomicBool::new(false),
            sessions: RwLock::new(HashMap::new()),
            session_counter: AtomicU64::new(0),
            expired_sessions: AtomicU64::new(0),
            ticks: AtomicU32::new(0),
            sweeper: Mutex::new(None),
        })
    }
}

fn document_store(
    collection: Arc<dyn DocumentCollection>,
    default_max_inactive_interval: i32,
) -> Arc<dyn SessionStore> {
    let factory = Arc::new(StandardSessionFactory::new(default_max_inactive_interval));
    Arc::new(DocumentSessionStore::new(collection, factory))
}

/// Session manager over a persistent session store.
///
/// The in-memory map is the source of truth for active sessions; the store
/// holds swapped-out and backed-up sessions and is shared with any other
/// manager pointed at the same collection.
pub struct SessionManager {
    config: ManagerConfig,
    store: Arc<dyn SessionStore>,
    id_generator: Arc<dyn SessionIdGenerator>,
    owns_connection: bool,
    started: AtomicBool,
    sessions: RwLock<HashMap<String, ActiveSession>>,
    session_counter: AtomicU64,
    expired_sessions: AtomicU64,
    ticks: AtomicU32,
    sweeper: Mutex<Option<Sweeper>>,
}

impl SessionManager {
    /// Start building a manager from configuration.
    #[must_use]
    pub fn builder(config: ManagerConfig) -> SessionManagerBuilder {
        SessionManagerBuilder {
            config,
            source: None,
            store: None,
            id_generator: Arc::new(StandardIdGenerator),
        }
    }

    #[must_use]
    pub const fn config(&self) -> &ManagerConfig {
        &self.config
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    /// Whether `stop` will close the store connection.
    #[must_use]
    pub const fn owns_connection(&self) -> bool {
        self.owns_connection
    }

    /// Number of sessions created by this manager.
    #[must_use]
    pub fn session_counter(&self) -> u64 {
        self.session_counter.load(Ordering::Relaxed)
    }

    /// Number of sessions this manager has expired.
    #[must_use]
    pub fn expired_count(&self) -> u64 {
        self.expired_sessions.load(Ordering::Relaxed)
    }

    /// Number of sessions currently held in memory.
    pub async fn active_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Create a session with a freshly generated id.
    pub async fn create_session(&self) -> Session {
        let mut sessions = self.sessions.write().await;
        let id = loop {
            let candidate = self.id_generator.generate_session_id();
            if !sessions.contains_key(&candidate) {
                break candidate;
            }
        };
        self.insert_new(&mut sessions, id)
    }

    /// Create a session with a caller-chosen id, replacing any active one.
    pub async fn create_session_with_id(&self, id: impl Into<String>) -> Session {
        let mut sessions = self.sessions.write().await;
        self.insert_new(&mut sessions, id.into())
    }

    fn insert_new(&self, sessions: &mut HashMap<String, ActiveSession>, id: String) -> Session {
        let session = Session::new(id, self.config.default_max_inactive_interval);
        sessions.insert(session.id().to_string(), ActiveSession::new(session.clone(), false));
        self.session_counter.fetch_add(1, Ordering::Relaxed);
        debug!(session_id = %session.id(), "Created session");
        session
    }

    /// Find a session, swapping it in from the store on a cache miss.
    ///
    /// Returns `Ok(None)` if no such session exists or the stored copy has
    /// expired.
    ///
    /// # Errors
    /// Returns error if the store is unreachable or the stored document
    /// cannot be decoded.
    pub async fn find_session(&self, id: &str) -> Result<Option<Session>, ManagerError> {
        if let Some(active) = self.sessions.read().await.get(id) {
            return Ok(Some(active.session.clone()));
        }
        self.swap_in(id).await
    }

    /// Mutate a session, swapping it in first if needed.
    ///
    /// The session is marked as accessed before `f` runs.
    ///
    /// # Errors
    /// Returns error if swapping in fails.
    pub async fn with_session<F, R>(&self, id: &str, f: F) -> Result<Option<R>, ManagerError>
    where
        F: FnOnce(&mut Session) -> R,
    {
        if self.find_session(id).await?.is_none() {
            return Ok(None);
        }
        let mut sessions = self.sessions.write().await;
        Ok(sessions.get_mut(id).map(|active| {
            active.session.access();
            active.session.end_access();
            active.version += 1;
            f(&mut active.session)
        }))
    }

    /// Snapshots of all active sessions, ordered by id.
    pub async fn find_sessions(&self) -> Vec<Session> {
        let mut sessions: Vec<Session> = self
            .sessions
            .read()
            .await
            .values()
            .map(|active| active.session.clone())
            .collect();
        sessions.sort_by(|a, b| a.id().cmp(b.id()));
        sessions
    }

    /// Ids of all active sessions, ascending.
    pub async fn list_session_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Remove a session from memory and from the store.
    ///
    /// # Errors
    /// Returns error if the store removal fails.
    pub async fn remove(&self, id: &str) -> Result<(), ManagerError> {
        self.sessions.write().await.remove(id);
        self.store.remove(id).await?;
        debug!(session_id = %id, "Removed session");
        Ok(())
    }

    /// Delete every persisted session and drop the in-memory working set.
    ///
    /// # Errors
    /// Returns error if the store cannot be cleared.
    pub async fn clear_store(&self) -> Result<(), ManagerError> {
        self.store.clear().await?;
        self.sessions.write().await.clear();
        Ok(())
    }

    async fn swap_in(&self, id: &str) -> Result<Option<Session>, ManagerError> {
        let mut session = match self.store.load(id).await {
            Ok(session) => session,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        if !session.is_valid() || session.has_expired_at(now()) {
            debug!(session_id = %id, "Stored session has expired");
            self.expire(id).await?;
            return Ok(None);
        }

        session.access();
        session.end_access();

        let mut sessions = self.sessions.write().await;
        let active = sessions
            .entry(id.to_string())
            .or_insert_with(|| ActiveSession::new(session, true));
        trace!(session_id = %id, "Swapped in session");
        Ok(Some(active.session.clone()))
    }

    /// Provision the store, load persisted sessions and start the background
    /// sweep task.
    ///
    /// # Errors
    /// Returns error if already started, or the store cannot be provisioned
    /// or enumerated.
    pub async fn start(self: &Arc<Self>) -> Result<(), ManagerError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(ManagerError::AlreadyStarted);
        }

        let loaded = match self.provision_and_load().await {
            Ok(loaded) => loaded,
            Err(e) => {
                self.started.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };

        if let Some(interval) = self.config.background_interval() {
            let token = CancellationToken::new();
            let handle = tokio::spawn(run_background(
                Arc::downgrade(self),
                interval,
                token.clone(),
            ));
            *self.lock_sweeper() = Some(Sweeper { token, handle });
        }

        info!(
            store = self.store.store_name(),
            loaded,
            "Session manager started"
        );
        Ok(())
    }

    async fn provision_and_load(&self) -> Result<usize, ManagerError> {
        self.store.provision().await?;
        self.load().await
    }

    fn lock_sweeper(&self) -> std::sync::MutexGuard<'_, Option<Sweeper>> {
        self.sweeper.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Swap in every persisted session.
    ///
    /// Documents that cannot be decoded are logged and skipped.
    ///
    /// # Errors
    /// Returns error if the store cannot be enumerated or is unreachable.
    pub async fn load(&self) -> Result<usize, ManagerError> {
        let keys = self.store.keys().await?;
        let mut loaded = 0;

        for id in keys {
            if self.sessions.read().await.contains_key(&id) {
                continue;
            }
            match self.swap_in(&id).await {
                Ok(Some(_)) => loaded += 1,
                Ok(None) => {}
                Err(ManagerError::Store(e)) if e.is_payload_error() => {
                    warn!(session_id = %id, error = %e, "Skipping unreadable session");
                }
                Err(e) => return Err(e),
            }
        }

        debug!(loaded, "Loaded persisted sessions");
        Ok(loaded)
    }

    /// Run one background tick.
    ///
    /// Persistence checks and the expiry sweep run every
    /// `process_expires_frequency` ticks.
    ///
    /// # Errors
    /// Returns the first error hit by either sweep.
    pub async fn background_process(&self) -> Result<(), ManagerError> {
        let frequency = self.config.process_expires_frequency.max(1);
        let tick = self.ticks.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        if tick % frequency != 0 {
            return Ok(());
        }
        self.process_persistence_checks().await?;
        self.process_expires().await?;
        Ok(())
    }

    /// Swap out or back up sessions according to the idle thresholds.
    ///
    /// # Errors
    /// Returns error if a save fails.
    pub async fn process_persistence_checks(&self) -> Result<(), ManagerError> {
        let at = now();
        self.process_max_idle_swaps(at).await?;
        self.process_max_active_swaps(at).await?;
        self.process_max_idle_backups(at).await?;
        Ok(())
    }

    /// Sessions that are still alive at `at`.
    async fn live_sessions(&self, at: DateTime<Utc>) -> Vec<Snapshot> {
        self.sessions
            .read()
            .await
            .values()
            .filter(|active| active.session.is_valid() && !active.session.has_expired_at(at))
            .map(|active| Snapshot {
                session: active.session.clone(),
                idle: active.session.idle_seconds(at),
                version: active.version,
                dirty: active.is_dirty(),
            })
            .collect()
    }

    async fn process_max_idle_swaps(&self, at: DateTime<Utc>) -> Result<(), ManagerError> {
        if self.config.max_idle_swap < 0 {
            return Ok(());
        }
        for snapshot in self.live_sessions(at).await {
            let idle = snapshot.idle;
            if idle >= self.config.max_idle_swap && idle >= self.config.min_idle_swap {
                debug!(session_id = %snapshot.session.id(), idle, "Swapping out idle session");
                self.swap_out(&snapshot).await?;
            }
        }
        Ok(())
    }

    async fn process_max_active_swaps(&self, at: DateTime<Utc>) -> Result<(), ManagerError> {
        let Ok(max) = usize::try_from(self.config.max_active_sessions) else {
            return Ok(());
        };
        let mut candidates = self.live_sessions(at).await;
        let active = self.active_count().await;
        if active <= max {
            return Ok(());
        }

        // Most idle first.
        candidates.sort_by(|a, b| b.idle.cmp(&a.idle));
        let mut to_swap = active - max;
        for snapshot in candidates {
            if to_swap == 0 {
                break;
            }
            if snapshot.idle >= self.config.min_idle_swap {
                debug!(
                    session_id = %snapshot.session.id(),
                    active,
                    max,
                    "Swapping out to make room"
                );
                if self.swap_out(&snapshot).await? {
                    to_swap -= 1;
                }
            }
        }
        Ok(())
    }

    async fn process_max_idle_backups(&self, at: DateTime<Utc>) -> Result<(), ManagerError> {
        if self.config.max_idle_backup < 0 {
            return Ok(());
        }
        for snapshot in self.live_sessions(at).await {
            if !snapshot.dirty || snapshot.idle < self.config.max_idle_backup {
                continue;
            }
            self.store.save(&snapshot.session).await?;
            if let Some(active) = self.sessions.write().await.get_mut(snapshot.session.id()) {
                active.saved_version = Some(snapshot.version);
            }
            trace!(
                session_id = %snapshot.session.id(),
                idle = snapshot.idle,
                "Backed up session"
            );
        }
        Ok(())
    }

    /// Save a snapshot and evict it, unless the session changed while the
    /// save was in flight. Returns whether the session was evicted.
    async fn swap_out(&self, snapshot: &Snapshot) -> Result<bool, ManagerError> {
        let id = snapshot.session.id();
        self.store.save(&snapshot.session).await?;

        let mut sessions = self.sessions.write().await;
        let unchanged = sessions
            .get(id)
            .map(|active| active.version == snapshot.version);
        match unchanged {
            Some(true) => {
                sessions.remove(id);
                Ok(true)
            }
            Some(false) => {
                if let Some(active) = sessions.get_mut(id) {
                    active.saved_version = Some(snapshot.version);
                }
                debug!(session_id = %id, "Session changed during swap-out, keeping it active");
                Ok(false)
            }
            None => Ok(false),
        }
    }

    /// Expire idle sessions in memory and in the store.
    ///
    /// In-memory sessions are judged by their own access time. Ids the store
    /// reports as expired are loaded and judged the same way; a stored session
    /// whose own clock says it is still alive is kept.
    ///
    /// # Errors
    /// Returns error if the store cannot be queried or a removal fails.
    pub async fn process_expires(&self) -> Result<usize, ManagerError> {
        let at = now();
        let mut expired = 0;

        let idle: Vec<String> = self
            .sessions
            .read()
            .await
            .values()
            .filter(|active| !active.session.is_valid() || active.session.has_expired_at(at))
            .map(|active| active.session.id().to_string())
            .collect();
        for id in idle {
            self.expire(&id).await?;
            expired += 1;
        }

        for id in self.store.expired_keys().await? {
            let in_memory = self
                .sessions
                .read()
                .await
                .get(&id)
                .map(|active| active.session.clone());

            let should_expire = match in_memory {
                Some(session) => session.has_expired_at(at),
                None => match self.store.load(&id).await {
                    Ok(session) => !session.is_valid() || session.has_expired_at(at),
                    Err(e) if e.is_not_found() => continue,
                    Err(e) if e.is_payload_error() => {
                        warn!(session_id = %id, error = %e, "Removing unreadable expired session");
                        true
                    }
                    Err(e) => return Err(e.into()),
                },
            };

            if should_expire {
                self.expire(&id).await?;
                expired += 1;
            } else {
                debug!(
                    session_id = %id,
                    "Store expiration disagrees with session access time, keeping"
                );
            }
        }

        if expired > 0 {
            debug!(expired, "Expired sessions");
        }
        Ok(expired)
    }

    async fn expire(&self, id: &str) -> Result<(), ManagerError> {
        self.sessions.write().await.remove(id);
        self.store.remove(id).await?;
        self.expired_sessions.fetch_add(1, Ordering::Relaxed);
        trace!(session_id = %id, "Expired session");
        Ok(())
    }

    /// Stop the background task, then unload or expire active sessions and
    /// close the connection if this manager opened it.
    ///
    /// Every session is attempted even when some fail. Sessions that could not
    /// be saved stay active so a later `stop` can retry them. The manager is
    /// left stopped whatever the outcome.
    ///
    /// # Errors
    /// Returns the first error hit while saving, removing or closing.
    pub async fn stop(&self) -> Result<(), ManagerError> {
        let sweeper = self.lock_sweeper().take();
        if let Some(sweeper) = sweeper {
            sweeper.token.cancel();
            if let Err(e) = sweeper.handle.await {
                warn!(error = %e, "Background sweep task ended abnormally");
            }
        }

        let at = now();
        let active: Vec<Session> = self
            .sessions
            .write()
            .await
            .drain()
            .map(|(_, active)| active.session)
            .collect();

        let mut first_error: Option<ManagerError> = None;
        if self.config.save_on_restart {
            let mut saved = 0;
            let mut unsaved = Vec::new();
            for session in active
                .into_iter()
                .filter(|s| s.is_valid() && !s.has_expired_at(at))
            {
                match self.store.save(&session).await {
                    Ok(()) => saved += 1,
                    Err(e) => {
                        warn!(session_id = %session.id(), error = %e, "Unable to unload session");
                        first_error.get_or_insert(e.into());
                        unsaved.push(session);
                    }
                }
            }
            debug!(saved, unsaved = unsaved.len(), "Unloaded sessions to store");

            if !unsaved.is_empty() {
                let mut sessions = self.sessions.write().await;
                for session in unsaved {
                    sessions
                        .entry(session.id().to_string())
                        .or_insert_with(|| ActiveSession::new(session, false));
                }
            }
        } else {
            let mut expired = 0;
            for session in &active {
                match self.store.remove(session.id()).await {
                    Ok(()) => expired += 1,
                    Err(e) => {
                        warn!(session_id = %session.id(), error = %e, "Unable to expire session");
                        first_error.get_or_insert(e.into());
                    }
                }
            }
            debug!(expired, "Expired sessions on stop");
        }

        if self.owns_connection {
            if let Err(e) = self.store.close().await {
                warn!(error = %e, "Unable to close store connection");
                first_error.get_or_insert(e.into());
            }
        }
        self.started.store(false, Ordering::SeqCst);

        match first_error {
            None => {
                info!(store = self.store.store_name(), "Session manager stopped");
                Ok(())
            }
            Some(e) => {
                error!(
                    store = self.store.store_name(),
                    error = %e,
                    "Session manager stopped with errors"
                );
                Err(e)
            }
        }
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        if let Some(sweeper) = self.lock_sweeper().take() {
            sweeper.token.cancel();
        }
    }
}

async fn run_background(
    manager: Weak<SessionManager>,
    interval: std::time::Duration,
    token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            () = token.cancelled() => break,
            _ = ticker.tick() => {
                let Some(manager) = manager.upgrade() else { break };
                if let Err(e) = manager.background_process().await {
                    error!(error = %e, "Background session sweep failed");
                }
            }
        }
    }
    debug!("Background sweep task stopped");
}

#[cfg(all(test, feature = "memory"))]
mod tests {
    use async_trait::async_trait;
    use sessionvault_core::{AttributeValue, StoreOperation, config::DEFAULT_COLLECTION_NAME};
    use tokio::sync::Notify;

    use super::*;
    use crate::storage::{MemoryCollection, MemoryServer};

    /// Store whose next `save` can be held until released.
    struct GatedStore {
        inner: Arc<dyn SessionStore>,
        hold_next_save: AtomicBool,
        entered: Notify,
        release: Notify,
    }

    impl GatedStore {
        fn new(inner: Arc<dyn SessionStore>) -> Self {
            Self {
                inner,
                hold_next_save: AtomicBool::new(false),
                entered: Notify::new(),
                release: Notify::new(),
            }
        }
    }

    #[async_trait]
    impl SessionStore for GatedStore {
        fn store_name(&self) -> &str {
            "GatedStore"
        }

        async fn provision(&self) -> Result<(), StoreError> {
            self.inner.provision().await
        }

        async fn size(&self) -> Result<usize, StoreError> {
            self.inner.size().await
        }

        async fn keys(&self) -> Result<Vec<String>, StoreError> {
            self.inner.keys().await
        }

        async fn expired_keys(&self) -> Result<Vec<String>, StoreError> {
            self.inner.expired_keys().await
        }

        async fn load(&self, id: &str) -> Result<Session, StoreError> {
            self.inner.load(id).await
        }

        async fn save(&self, session: &Session) -> Result<(), StoreError> {
            if self.hold_next_save.swap(false, Ordering::SeqCst) {
                self.entered.notify_one();
                self.release.notified().await;
            }
            self.inner.save(session).await
        }

        async fn remove(&self, id: &str) -> Result<(), StoreError> {
            self.inner.remove(id).await
        }

        async fn clear(&self) -> Result<(), StoreError> {
            self.inner.clear().await
        }

        async fn close(&self) -> Result<(), StoreError> {
            self.inner.close().await
        }
    }

    async fn manager_with(config: ManagerConfig) -> (Arc<SessionManager>, Arc<MemoryCollection>) {
        let collection = MemoryServer::new().collection("local", "sessions");
        let config = config.with_background_interval(std::time::Duration::ZERO);
        let manager = SessionManager::builder(config)
            .collection(collection.clone())
            .build()
            .await
            .unwrap();
        (Arc::new(manager), collection)
    }

    #[tokio::test]
    async fn test_build_requires_a_store() {
        let result = SessionManager::builder(ManagerConfig::new("local")).build().await;
        assert!(matches!(result, Err(ManagerError::Config(_))));
    }

    #[tokio::test]
    async fn test_build_requires_database_name() {
        let collection = MemoryServer::new().collection("local", "sessions");
        let result = SessionManager::builder(ManagerConfig::default())
            .collection(collection)
            .build()
            .await;
        assert!(matches!(
            result,
            Err(ManagerError::Config(ConfigError::Missing("database_name")))
        ));
    }

    #[tokio::test]
    async fn test_create_and_find() {
        let (manager, _) = manager_with(ManagerConfig::new("local")).await;
        let session = manager.create_session().await;

        assert_eq!(manager.session_counter(), 1);
        assert_eq!(manager.active_count().await, 1);
        let found = manager.find_session(session.id()).await.unwrap().unwrap();
        assert_eq!(found.id(), session.id());
        assert!(manager.find_session("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_with_session_mutates_in_place() {
        let (manager, _) = manager_with(ManagerConfig::new("local")).await;
        let session = manager.create_session().await;

        let previous = manager
            .with_session(session.id(), |s| s.set_attribute("key", "value"))
            .await
            .unwrap();
        assert_eq!(previous, Some(None));

        let found = manager.find_session(session.id()).await.unwrap().unwrap();
        assert_eq!(found.attribute("key").and_then(|v| v.as_str()), Some("value"));
        assert!(!found.is_new());
    }

    #[tokio::test]
    async fn test_idle_swap_saves_and_evicts() {
        let (manager, collection) = manager_with(ManagerConfig::new("local")).await;
        let session = manager.create_session().await;

        manager.process_persistence_checks().await.unwrap();
        assert_eq!(collection.count().await.unwrap(), 1);
        assert_eq!(manager.active_count().await, 0);

        // Swapped back in on demand.
        assert!(manager.find_session(session.id()).await.unwrap().is_some());
        assert_eq!(manager.active_count().await, 1);
    }

    #[tokio::test]
    async fn test_backup_keeps_session_active() {
        let config = ManagerConfig::new("local")
            .with_max_idle_swap(-1)
            .with_max_idle_backup(0);
        let (manager, collection) = manager_with(config).await;
        manager.create_session().await;

        manager.process_persistence_checks().await.unwrap();
        assert_eq!(collection.count().await.unwrap(), 1);
        assert_eq!(manager.active_count().await, 1);
    }

    #[tokio::test]
    async fn test_backup_skips_clean_sessions() {
        let config = ManagerConfig::new("local")
            .with_max_idle_swap(-1)
            .with_max_idle_backup(0);
        let (manager, collection) = manager_with(config).await;
        let session = manager.create_session().await;

        manager.process_persistence_checks().await.unwrap();
        collection.delete_many(&sessionvault_core::Filter::All).await.unwrap();

        // Nothing changed since the last backup.
        manager.process_persistence_checks().await.unwrap();
        assert_eq!(collection.count().await.unwrap(), 0);

        manager
            .with_session(session.id(), |s| s.set_attribute("k", 1_i64))
            .await
            .unwrap();
        manager.process_persistence_checks().await.unwrap();
        assert_eq!(collection.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_max_active_swap() {
        let config = ManagerConfig::new("local")
            .with_max_idle_swap(-1)
            .with_max_idle_backup(-1)
            .with_max_active_sessions(2);
        let (manager, collection) = manager_with(config).await;
        for _ in 0..5 {
            manager.create_session().await;
        }

        manager.process_persistence_checks().await.unwrap();
        assert_eq!(manager.active_count().await, 2);
        assert_eq!(collection.count().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_expired_in_memory_session_is_removed() {
        let config = ManagerConfig::new("local").with_max_idle_swap(-1);
        let (manager, _) = manager_with(config).await;
        let session = manager.create_session().await;
        manager
            .with_session(session.id(), |s| {
                s.set_last_accessed_time(now() - chrono::Duration::hours(5));
            })
            .await
            .unwrap();
        manager.store().save(&session).await.unwrap();

        assert_eq!(manager.process_expires().await.unwrap(), 1);
        assert_eq!(manager.active_count().await, 0);
        assert_eq!(manager.store().size().await.unwrap(), 0);
        assert_eq!(manager.expired_count(), 1);
    }

    #[tokio::test]
    async fn test_store_expiry_defers_to_session_clock() {
        let (manager, collection) = manager_with(ManagerConfig::new("local")).await;
        let mut session = Session::new("skewed", 1800);
        manager.store().save(&session).await.unwrap();

        // Rewrite only the store-side expiration into the past.
        let mut raw = collection.get_raw("skewed").unwrap().unwrap();
        raw.insert(
            sessionvault_core::document::fields::EXPIRATION_TIME,
            sessionvault_core::FieldValue::Int(0),
        );
        collection.put_raw(raw).unwrap();
        assert_eq!(manager.store().expired_keys().await.unwrap(), vec!["skewed"]);

        assert_eq!(manager.process_expires().await.unwrap(), 0);
        assert_eq!(manager.store().size().await.unwrap(), 1);

        session.set_last_accessed_time(now() - chrono::Duration::hours(5));
        manager.store().save(&session).await.unwrap();
        assert_eq!(manager.process_expires().await.unwrap(), 1);
        assert_eq!(manager.store().size().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_background_process_honours_frequency() {
        let config = ManagerConfig::new("local").with_process_expires_frequency(3);
        let (manager, collection) = manager_with(config).await;
        manager.create_session().await;

        manager.background_process().await.unwrap();
        manager.background_process().await.unwrap();
        assert_eq!(collection.count().await.unwrap(), 0);

        manager.background_process().await.unwrap();
        assert_eq!(collection.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let config = ManagerConfig::new("local");
        let collection = MemoryServer::new().collection("local", "sessions");
        let manager = Arc::new(
            SessionManager::builder(config)
                .collection(collection)
                .build()
                .await
                .unwrap(),
        );
        manager.start().await.unwrap();
        assert!(matches!(
            manager.start().await,
            Err(ManagerError::AlreadyStarted)
        ));
        manager.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_task_sweeps_until_stopped() {
        let config = ManagerConfig::new("local")
            .with_background_interval(std::time::Duration::from_secs(10))
            .with_process_expires_frequency(1)
            .with_save_on_restart(false);
        let collection = MemoryServer::new().collection("local", "sessions");
        let manager = Arc::new(
            SessionManager::builder(config)
                .collection(collection.clone())
                .build()
                .await
                .unwrap(),
        );
        manager.start().await.unwrap();
        manager.create_session().await;

        tokio::time::sleep(std::time::Duration::from_secs(11)).await;
        assert_eq!(manager.active_count().await, 0);
        assert_eq!(collection.count().await.unwrap(), 1);

        manager.stop().await.unwrap();
        assert!(!collection.is_closed());
    }

    #[tokio::test]
    async fn test_stop_without_save_on_restart_removes_sessions() {
        let config = ManagerConfig::new("local")
            .with_max_idle_swap(-1)
            .with_max_idle_backup(0)
            .with_save_on_restart(false);
        let (manager, collection) = manager_with(config).await;
        manager.create_session().await;
        manager.process_persistence_checks().await.unwrap();
        assert_eq!(collection.count().await.unwrap(), 1);

        manager.stop().await.unwrap();
        assert_eq!(collection.count().await.unwrap(), 0);
        assert_eq!(manager.active_count().await, 0);
    }

    #[tokio::test]
    async fn test_update_during_swap_out_is_kept() {
        let collection = MemoryServer::new().collection("local", "sessions");
        let store = Arc::new(GatedStore::new(document_store(collection, 1800)));
        let config = ManagerConfig::new("local")
            .with_background_interval(std::time::Duration::ZERO)
            .with_max_idle_backup(-1);
        let manager = Arc::new(
            SessionManager::builder(config)
                .store(store.clone())
                .build()
                .await
                .unwrap(),
        );
        let id = manager.create_session().await.id().to_string();

        store.hold_next_save.store(true, Ordering::SeqCst);
        let sweep = tokio::spawn({
            let manager = Arc::clone(&manager);
            async move { manager.process_persistence_checks().await }
        });
        store.entered.notified().await;

        manager
            .with_session(&id, |s| s.set_attribute("cart", 7_i64))
            .await
            .unwrap();
        store.release.notify_one();
        sweep.await.unwrap().unwrap();

        let found = manager.find_session(&id).await.unwrap().unwrap();
        assert_eq!(found.attribute("cart").and_then(AttributeValue::as_i64), Some(7));
        assert_eq!(manager.active_count().await, 1);

        // Still dirty, so the next sweep writes the newer state.
        manager.process_persistence_checks().await.unwrap();
        assert_eq!(manager.active_count().await, 0);
        let stored = store.load(&id).await.unwrap();
        assert_eq!(stored.attribute("cart").and_then(AttributeValue::as_i64), Some(7));
    }

    #[tokio::test]
    async fn test_failed_stop_keeps_sessions_and_allows_restart() {
        let config = ManagerConfig::new("local")
            .with_max_idle_swap(-1)
            .with_max_idle_backup(-1);
        let (manager, collection) = manager_with(config).await;
        manager.start().await.unwrap();
        for _ in 0..3 {
            manager.create_session().await;
        }

        collection.set_unavailable(true);
        assert!(matches!(
            manager.stop().await,
            Err(ManagerError::Store(StoreError::Mutation {
                operation: StoreOperation::Save,
                ..
            }))
        ));
        assert_eq!(manager.active_count().await, 3);

        collection.set_unavailable(false);
        manager.start().await.unwrap();
        assert_eq!(manager.active_count().await, 3);
        manager.stop().await.unwrap();
        assert_eq!(collection.count().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_failed_stop_still_closes_owned_connection() {
        let server = MemoryServer::new();
        let config = ManagerConfig::new("local")
            .with_background_interval(std::time::Duration::ZERO)
            .with_max_idle_swap(-1)
            .with_hosts(["localhost"])
            .with_credentials("app", "secret");
        let manager = SessionManager::builder(config)
            .driver(server.clone())
            .build()
            .await
            .unwrap();
        manager.create_session().await;

        let handle = server.collection("local", DEFAULT_COLLECTION_NAME);
        handle.set_unavailable(true);
        assert!(manager.stop().await.is_err());

        handle.set_unavailable(false);
        assert!(manager.store().size().await.is_err());
        assert_eq!(handle.count().await.unwrap(), 0);
    }
}
