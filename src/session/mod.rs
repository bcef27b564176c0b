//! Server-side session storage.
//!
//! Sessions are the only state shared between exchanges. The host never keeps
//! them in a global: a [`SessionStore`] is injected into the dispatcher, and
//! each [`WebRequest`](crate::context::WebRequest) only remembers which
//! session id (if any) it is bound to. The id travels in the
//! [`SESSION_COOKIE`] cookie.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

/// Name of the cookie carrying the session id.
pub const SESSION_COOKIE: &str = "WEBBYSESSION";

/// Storage backend for session values.
///
/// Every operation must be atomic for a single session id. Operations on an
/// unknown id are no-ops (`get` returns `None`).
pub trait SessionStore: Send + Sync {
    /// Creates an empty session and returns its id.
    fn create(&self) -> String;

    /// Returns `true` if a session with this id exists.
    fn exists(&self, id: &str) -> bool;

    fn get(&self, id: &str, key: &str) -> Option<Value>;

    /// Stores `value` under `key`, overwriting any previous value.
    fn put(&self, id: &str, key: &str, value: Value);

    fn remove(&self, id: &str, key: &str);

    /// Drops the whole session.
    fn invalidate(&self, id: &str);
}

/// Idle time after which a [`MemorySessionStore`] forgets a session.
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(30 * 60);

type Sessions = HashMap<String, Session>;

#[derive(Debug)]
struct Session {
    values: HashMap<String, Value>,
    last_access: Instant,
}

impl Session {
    fn is_expired(&self, now: Instant, ttl: Duration) -> bool {
        now.saturating_duration_since(self.last_access) > ttl
    }
}

/// In-process [`SessionStore`] backed by a mutex-guarded map.
///
/// A session expires once it has not been touched for the store's TTL: it
/// then behaves exactly like an unknown id. Every access refreshes the
/// session, and creating a session sweeps out all expired ones, so the map
/// only holds sessions that were live at the last `create`.
#[derive(Debug)]
pub struct MemorySessionStore {
    sessions: Mutex<Sessions>,
    ttl: Duration,
}

impl Default for MemorySessionStore {
    fn default() -> Self {
        Self::with_ttl(DEFAULT_SESSION_TTL)
    }
}

impl MemorySessionStore {
    /// A store with the default 30 minute idle timeout.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.with_sessions(|sessions, ttl| {
            let now = Instant::now();
            sessions.values().filter(|s| !s.is_expired(now, ttl)).count()
        })
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // A panic while holding the lock cannot leave a half-written map behind,
    // so a poisoned lock is still safe to use.
    fn with_sessions<T>(&self, f: impl FnOnce(&mut Sessions, Duration) -> T) -> T {
        let mut guard = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard, self.ttl)
    }
}

/// Returns the live session for `id` and refreshes its last access.
/// An expired session is removed on the way.
fn touch<'a>(sessions: &'a mut Sessions, id: &str, ttl: Duration) -> Option<&'a mut Session> {
    let now = Instant::now();
    if sessions.get(id)?.is_expired(now, ttl) {
        sessions.remove(id);
        debug!(session = %id, "session expired");
        return None;
    }
    let session = sessions.get_mut(id)?;
    session.last_access = now;
    Some(session)
}

impl SessionStore for MemorySessionStore {
    fn create(&self) -> String {
        let id = Uuid::new_v4().simple().to_string();
        self.with_sessions(|sessions, ttl| {
            let now = Instant::now();
            let before = sessions.len();
            sessions.retain(|_, session| !session.is_expired(now, ttl));
            if sessions.len() < before {
                debug!(expired = before - sessions.len(), "expired sessions dropped");
            }
            sessions.insert(
                id.clone(),
                Session {
                    values: HashMap::new(),
                    last_access: now,
                },
            );
        });
        debug!(session = %id, "session created");
        id
    }

    fn exists(&self, id: &str) -> bool {
        self.with_sessions(|sessions, ttl| touch(sessions, id, ttl).is_some())
    }

    fn get(&self, id: &str, key: &str) -> Option<Value> {
        self.with_sessions(|sessions, ttl| touch(sessions, id, ttl)?.values.get(key).cloned())
    }

    fn put(&self, id: &str, key: &str, value: Value) {
        self.with_sessions(|sessions, ttl| {
            if let Some(session) = touch(sessions, id, ttl) {
                session.values.insert(key.to_owned(), value);
            }
        });
    }

    fn remove(&self, id: &str, key: &str) {
        self.with_sessions(|sessions, ttl| {
            if let Some(session) = touch(sessions, id, ttl) {
                session.values.remove(key);
            }
        });
    }

    fn invalidate(&self, id: &str) {
        if self.with_sessions(|sessions, _| sessions.remove(id)).is_some() {
            debug!(session = %id, "session invalidated");
        }
    }
}
