//! Visitor and session identity.
//!
//! # Identifiers
//!
//! - **Anonymous id** (`anon_<uuid>`): stored in local storage under `did`
//!   and kept until the storage is cleared or overridden.
//! - **Session id** (`sess_<uuid>`): stored in session storage under
//!   `did_session` with a last-touched timestamp. A session expires after
//!   [`SESSION_TIMEOUT_MINUTES`] of inactivity, measured from the last touch
//!   rather than from session start. Expiry is evaluated on every touch.
//!
//! Both identifiers can be forced through the `anonId` and `sessionId` query
//! string parameters (used for cross-domain handoff).
//!
//! # Degradation
//!
//! Storage errors never reach the caller. When a store is missing or fails,
//! the manager keeps an in-memory identity that is stable for the lifetime of
//! the instance but not persisted.

use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Duration, TimeZone, Utc};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::host::BrowsingContext;
use crate::storage::{KeyValueStore, StorageError};

/// Local storage key holding the anonymous id.
pub const ANONYMOUS_ID_KEY: &str = "did";

/// Session storage key holding the session id.
pub const SESSION_ID_KEY: &str = "did_session";

/// Session storage key holding the last-touched time (ms since epoch).
pub const SESSION_TIMESTAMP_KEY: &str = "did_session_timestamp";

/// Session storage key holding the session start time (ms since epoch).
pub const SESSION_START_KEY: &str = "did_session_start";

/// Query parameter overriding the anonymous id.
const ANONYMOUS_ID_PARAM: &str = "anonId";

/// Query parameter overriding the session id.
const SESSION_ID_PARAM: &str = "sessionId";

/// Minutes of inactivity after which a session expires.
pub const SESSION_TIMEOUT_MINUTES: i64 = 30;

/// Inactivity period after which a session expires.
#[must_use]
pub fn session_timeout() -> Duration {
    Duration::minutes(SESSION_TIMEOUT_MINUTES)
}

/// Generates a fresh anonymous id.
#[must_use]
pub fn generate_anonymous_id() -> String {
    format!("anon_{}", Uuid::new_v4())
}

/// Generates a fresh session id.
#[must_use]
pub fn generate_session_id() -> String {
    format!("sess_{}", Uuid::new_v4())
}

#[derive(Debug, Default)]
struct EphemeralIdentity {
    anonymous_id: Option<String>,
    session_id: Option<String>,
    last_touched: Option<DateTime<Utc>>,
    session_start: Option<DateTime<Utc>>,
}

/// Derives and persists the anonymous and session identifiers.
pub struct IdentityManager {
    host: Option<Arc<dyn BrowsingContext>>,
    ephemeral: Mutex<EphemeralIdentity>,
}

impl IdentityManager {
    /// Creates a manager for `host`. Without a host every call returns a
    /// transient identifier and nothing is persisted.
    #[must_use]
    pub fn new(host: Option<Arc<dyn BrowsingContext>>) -> Self {
        Self {
            host,
            ephemeral: Mutex::new(EphemeralIdentity::default()),
        }
    }

    /// Returns the anonymous id, creating and persisting one if needed.
    ///
    /// A query-string override wins over any stored value and replaces it.
    pub fn anonymous_id(&self) -> String {
        let Some(host) = &self.host else {
            return generate_anonymous_id();
        };

        if let Some(id) = query_param(host.as_ref(), ANONYMOUS_ID_PARAM) {
            debug!(anonymous_id = %id, "Adopting anonymous id from query string");
            self.persist_local(host.as_ref(), ANONYMOUS_ID_KEY, &id);
            self.ephemeral().anonymous_id = Some(id.clone());
            return id;
        }

        if let Some(store) = host.local_storage() {
            match store.get(ANONYMOUS_ID_KEY) {
                Ok(Some(id)) if !id.is_empty() => return id,
                Ok(_) => {
                    let id = self.ephemeral_anonymous_id();
                    if let Err(e) = store.set(ANONYMOUS_ID_KEY, &id) {
                        log_storage_error(&e, ANONYMOUS_ID_KEY);
                    }
                    return id;
                }
                Err(e) => log_storage_error(&e, ANONYMOUS_ID_KEY),
            }
        }

        self.ephemeral_anonymous_id()
    }

    /// Returns the session id, touching the session at the current time.
    pub fn session_id(&self) -> String {
        self.session_id_at(Utc::now())
    }

    /// Returns the session id, touching the session at `now`.
    ///
    /// The stored session is reused when it was last touched less than
    /// [`SESSION_TIMEOUT_MINUTES`] before `now`. At exactly the timeout it is
    /// treated as expired and a new session is minted.
    pub fn session_id_at(&self, now: DateTime<Utc>) -> String {
        let Some(host) = &self.host else {
            return generate_session_id();
        };

        if let Some(id) = query_param(host.as_ref(), SESSION_ID_PARAM) {
            debug!(session_id = %id, "Adopting session id from query string");
            self.remember_session(&id, now);
            if let Some(store) = host.session_storage() {
                let result = store
                    .set(SESSION_ID_KEY, &id)
                    .and_then(|()| store.set(SESSION_TIMESTAMP_KEY, &to_millis(now)));
                if let Err(e) = result {
                    log_storage_error(&e, SESSION_ID_KEY);
                }
            }
            return id;
        }

        match host.session_storage() {
            Some(store) => match self.persisted_session(store.as_ref(), now) {
                Ok(id) => id,
                Err(e) => {
                    log_storage_error(&e, SESSION_ID_KEY);
                    self.ephemeral_session(now)
                }
            },
            None => self.ephemeral_session(now),
        }
    }

    /// Returns when the current session started, recording `now` if unknown.
    pub fn session_start_time(&self) -> DateTime<Utc> {
        self.session_start_time_at(Utc::now())
    }

    /// Returns when the current session started, recording `now` if unknown.
    pub fn session_start_time_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        if let Some(store) = self.host.as_ref().and_then(|h| h.session_storage()) {
            match store.get(SESSION_START_KEY) {
                Ok(stored) => {
                    if let Some(start) = stored.as_deref().and_then(from_millis) {
                        return start;
                    }
                    match store.set(SESSION_START_KEY, &to_millis(now)) {
                        Ok(()) => return now,
                        Err(e) => log_storage_error(&e, SESSION_START_KEY),
                    }
                }
                Err(e) => log_storage_error(&e, SESSION_START_KEY),
            }
        }

        *self.ephemeral().session_start.get_or_insert(now)
    }

    fn persisted_session(
        &self,
        store: &dyn KeyValueStore,
        now: DateTime<Utc>,
    ) -> Result<String, StorageError> {
        let stored_id = store.get(SESSION_ID_KEY)?;
        let last_touched = store
            .get(SESSION_TIMESTAMP_KEY)?
            .as_deref()
            .and_then(from_millis);

        if let (Some(id), Some(touched)) = (stored_id, last_touched) {
            if now - touched < session_timeout() {
                store.set(SESSION_TIMESTAMP_KEY, &to_millis(now))?;
                return Ok(id);
            }

            debug!(session_id = %id, "Session expired");
            store.remove(SESSION_ID_KEY)?;
            store.remove(SESSION_TIMESTAMP_KEY)?;
            store.remove(SESSION_START_KEY)?;
        }

        let id = generate_session_id();
        store.set(SESSION_ID_KEY, &id)?;
        store.set(SESSION_TIMESTAMP_KEY, &to_millis(now))?;
        store.set(SESSION_START_KEY, &to_millis(now))?;
        debug!(session_id = %id, "Started new session");
        Ok(id)
    }

    /// In-memory session with the same expiry rule as the persisted one.
    fn ephemeral_session(&self, now: DateTime<Utc>) -> String {
        let mut state = self.ephemeral();
        if let (Some(id), Some(touched)) = (&state.session_id, state.last_touched) {
            if now - touched < session_timeout() {
                let id = id.clone();
                state.last_touched = Some(now);
                return id;
            }
        }

        let id = generate_session_id();
        state.session_id = Some(id.clone());
        state.last_touched = Some(now);
        state.session_start = Some(now);
        id
    }

    fn remember_session(&self, id: &str, now: DateTime<Utc>) {
        let mut state = self.ephemeral();
        state.session_id = Some(id.to_string());
        state.last_touched = Some(now);
    }

    fn ephemeral_anonymous_id(&self) -> String {
        self.ephemeral()
            .anonymous_id
            .get_or_insert_with(generate_anonymous_id)
            .clone()
    }

    fn persist_local(&self, host: &dyn BrowsingContext, key: &str, value: &str) {
        if let Some(store) = host.local_storage() {
            if let Err(e) = store.set(key, value) {
                log_storage_error(&e, key);
            }
        }
    }

    fn ephemeral(&self) -> std::sync::MutexGuard<'_, EphemeralIdentity> {
        self.ephemeral.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn query_param(host: &dyn BrowsingContext, name: &str) -> Option<String> {
    host.location()
        .query_pairs()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.into_owned())
        .filter(|value| !value.is_empty())
}

fn to_millis(time: DateTime<Utc>) -> String {
    time.timestamp_millis().to_string()
}

fn from_millis(raw: &str) -> Option<DateTime<Utc>> {
    let millis = raw.trim().parse::<i64>().ok()?;
    Utc.timestamp_millis_opt(millis).single()
}

fn log_storage_error(error: &StorageError, key: &str) {
    warn!(key, error = %error, "Storage unavailable, using ephemeral identity");
}
