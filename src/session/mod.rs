//! Per-application session store.
//!
//! Sessions move through `CREATED → ACTIVE → DESTROYED`. Every successful
//! lookup refreshes the last-accessed time; a session idle for longer than its
//! timeout, or explicitly invalidated, is removed and its id never resolves
//! again.
//!
//! The store is a sharded [`DashMap`]: operations on one id are serialized
//! (a single winner for concurrent invalidate/rotate) while distinct ids
//! proceed independently.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use rand::RngCore;
use rand::rngs::OsRng;
use serde::Deserialize;
use serde_json::Value;
use tokio::time::Instant;
use tracing::debug;

pub mod tracking;

pub use tracking::{CookieConfig, TrackingMode};

/// Number of random bytes in a session id (rendered as hex).
const ID_BYTES: usize = 16;

/// Session settings for one application.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Inactivity timeout in seconds; `0` disables expiry.
    pub timeout_secs: u64,
    /// Enabled tracking modes.
    pub tracking_modes: Vec<TrackingMode>,
    /// Session cookie attributes.
    pub cookie: CookieConfig,
    /// Matrix parameter name used for URL tracking.
    pub url_parameter: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30 * 60,
            tracking_modes: vec![TrackingMode::Cookie, TrackingMode::Url],
            cookie: CookieConfig::default(),
            url_parameter: "jsessionid".to_owned(),
        }
    }
}

impl SessionConfig {
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_secs > 0).then(|| Duration::from_secs(self.timeout_secs))
    }

    pub fn tracks_cookies(&self) -> bool {
        self.tracking_modes.contains(&TrackingMode::Cookie)
    }

    pub fn tracks_url(&self) -> bool {
        self.tracking_modes.contains(&TrackingMode::Url)
    }
}

#[derive(Debug, Clone)]
struct Session {
    created: Instant,
    last_accessed: Instant,
    max_inactive: Option<Duration>,
    attributes: HashMap<String, Value>,
    is_new: bool,
}

impl Session {
    fn new(max_inactive: Option<Duration>) -> Self {
        let now = Instant::now();
        Self {
            created: now,
            last_accessed: now,
            max_inactive,
            attributes: HashMap::new(),
            is_new: true,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.max_inactive
            .is_some_and(|limit| now.saturating_duration_since(self.last_accessed) > limit)
    }
}

/// Session store for one application.
#[derive(Debug)]
pub struct SessionManager {
    sessions: DashMap<String, Session>,
    config: SessionConfig,
}

impl SessionManager {
    pub fn new(config: SessionConfig) -> Arc<Self> {
        Arc::new(Self {
            sessions: DashMap::new(),
            config,
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Number of live (not yet swept) sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Creates a session under a fresh id.
    pub fn create(self: &Arc<Self>) -> SessionHandle {
        let id = self.insert_fresh(Session::new(self.config.timeout()));
        debug!(session_count = self.sessions.len(), "session created");
        SessionHandle {
            id,
            manager: Arc::clone(self),
        }
    }

    // Inserts `session` under an id not present in the live set.
    fn insert_fresh(&self, session: Session) -> String {
        loop {
            let id = generate_id();
            if let Entry::Vacant(slot) = self.sessions.entry(id.clone()) {
                slot.insert(session);
                return id;
            }
        }
    }

    /// Looks up a live session and marks it accessed.
    ///
    /// An expired session is removed and reported as missing.
    pub fn find(self: &Arc<Self>, id: &str) -> Option<SessionHandle> {
        self.access(id, |session, now| {
            session.last_accessed = now;
            session.is_new = false;
        })?;
        Some(SessionHandle {
            id: id.to_owned(),
            manager: Arc::clone(self),
        })
    }

    /// Returns `true` if `id` names a live session, without touching it.
    pub fn contains(&self, id: &str) -> bool {
        self.access(id, |_, _| ()).is_some()
    }

    // Runs `f` on a live session; expired sessions are evicted instead.
    fn access<R>(&self, id: &str, f: impl FnOnce(&mut Session, Instant) -> R) -> Option<R> {
        let now = Instant::now();
        let expired = {
            let mut session = self.sessions.get_mut(id)?;
            if !session.is_expired(now) {
                return Some(f(&mut session, now));
            }
            true
        };
        if expired {
            self.sessions.remove_if(id, |_, s| s.is_expired(now));
            debug!("expired session evicted on access");
        }
        None
    }

    /// Destroys a session. Returns `false` if it was already gone.
    pub fn invalidate(&self, id: &str) -> bool {
        self.sessions.remove(id).is_some()
    }

    /// Moves a session to a new id, keeping its attributes.
    ///
    /// Returns the new id, or `None` if `id` was not live. Exactly one of
    /// several concurrent callers for the same id succeeds.
    pub fn change_session_id(&self, id: &str) -> Option<String> {
        let (_, session) = self.sessions.remove(id)?;
        if session.is_expired(Instant::now()) {
            return None;
        }
        let new_id = self.insert_fresh(session);
        debug!("session id changed");
        Some(new_id)
    }

    /// Removes every session idle past its timeout. Returns how many were removed.
    pub fn expire_idle(&self) -> usize {
        let now = Instant::now();
        let before = self.sessions.len();
        self.sessions.retain(|_, s| !s.is_expired(now));
        before.saturating_sub(self.sessions.len())
    }

    /// Destroys every session (application shutdown).
    pub fn invalidate_all(&self) {
        self.sessions.clear();
    }
}

/// Generates a hex id from the operating system's CSPRNG.
fn generate_id() -> String {
    let mut bytes = [0u8; ID_BYTES];
    OsRng.fill_bytes(&mut bytes);
    bytes.iter().fold(String::with_capacity(ID_BYTES * 2), |mut out, b| {
        let _ = write!(out, "{b:02X}");
        out
    })
}

/// A reference to one session by id.
///
/// Every accessor goes back to the store, so a handle whose session has been
/// invalidated, expired or moved to a new id simply stops finding it.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: String,
    manager: Arc<SessionManager>,
}

impl SessionHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_valid(&self) -> bool {
        self.manager.contains(&self.id)
    }

    /// `true` until a request carrying this id has been seen.
    pub fn is_new(&self) -> bool {
        self.manager.access(&self.id, |s, _| s.is_new).unwrap_or(false)
    }

    pub fn creation_time(&self) -> Option<Instant> {
        self.manager.access(&self.id, |s, _| s.created)
    }

    pub fn last_accessed_time(&self) -> Option<Instant> {
        self.manager.access(&self.id, |s, _| s.last_accessed)
    }

    pub fn max_inactive_interval(&self) -> Option<Duration> {
        self.manager.access(&self.id, |s, _| s.max_inactive).flatten()
    }

    /// Overrides this session's timeout; `None` disables expiry.
    pub fn set_max_inactive_interval(&self, interval: Option<Duration>) {
        self.manager.access(&self.id, |s, _| s.max_inactive = interval);
    }

    pub fn attribute(&self, name: &str) -> Option<Value> {
        self.manager
            .access(&self.id, |s, _| s.attributes.get(name).cloned())
            .flatten()
    }

    /// Sets an attribute. Returns `false` if the session is no longer valid.
    pub fn set_attribute(&self, name: impl Into<String>, value: impl Into<Value>) -> bool {
        let (name, value) = (name.into(), value.into());
        self.manager
            .access(&self.id, move |s, _| {
                s.attributes.insert(name, value);
            })
            .is_some()
    }

    pub fn remove_attribute(&self, name: &str) -> Option<Value> {
        self.manager
            .access(&self.id, |s, _| s.attributes.remove(name))
            .flatten()
    }

    pub fn attribute_names(&self) -> Vec<String> {
        self.manager
            .access(&self.id, |s, _| s.attributes.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Destroys the session.
    pub fn invalidate(&self) -> bool {
        self.manager.invalidate(&self.id)
    }
}
