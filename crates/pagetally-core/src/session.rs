//! Session resolution.
//!
//! A session groups the pageviews of one visitor inside a bounded window
//! without storing who that visitor is. Clients either send their own session
//! token, or the server derives a key as `sha256(salt ‖ user agent ‖ ip)`
//! where the salt rotates every [`SaltSchedule`] period. Only an opaque,
//! process-allocated session number ever reaches durable storage.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("no session and browser and/or ip are blank: not counting unique visit")]
    Underivable,
}

/// The identity signals a request offers for session grouping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionSource {
    /// Client-supplied session token, used as-is for grouping.
    Token(String),
    /// Derive a hashed key from the user agent and IP.
    Fingerprint { browser: String, ip: String },
    /// Sessions are disabled for this request; each hit is its own visit.
    Unsessioned,
}

impl SessionSource {
    /// Pick the session source for one submitted record.
    ///
    /// An explicit token wins; otherwise both browser and IP are needed. When
    /// neither is available the record is rejected unless the caller opted out
    /// of sessions altogether.
    pub fn from_signals(
        token: &str,
        browser: &str,
        ip: &str,
        no_sessions: bool,
    ) -> Result<Self, SessionError> {
        if !token.is_empty() {
            return Ok(Self::Token(token.to_string()));
        }
        if !browser.is_empty() && !ip.is_empty() {
            return Ok(Self::Fingerprint {
                browser: browser.to_string(),
                ip: ip.to_string(),
            });
        }
        if no_sessions {
            Ok(Self::Unsessioned)
        } else {
            Err(SessionError::Underivable)
        }
    }
}

/// Grouping key held only in memory.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SessionKey {
    Token(String),
    Hash([u8; 16]),
}

/// Hash a user agent and IP under the given salt.
pub fn session_key(salt: &[u8; 32], browser: &str, ip: &str) -> SessionKey {
    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(browser.as_bytes());
    hasher.update([0u8]);
    hasher.update(ip.as_bytes());
    let digest = hasher.finalize();
    let mut key = [0u8; 16];
    key.copy_from_slice(&digest[..16]);
    SessionKey::Hash(key)
}

/// Rotation policy for the session salt.
///
/// Time is cut into epochs of `period`; the salt of an epoch is derived from
/// a per-process secret, so it is stable within the epoch and unlinkable
/// across epochs and restarts.
#[derive(Clone)]
pub struct SaltSchedule {
    secret: [u8; 32],
    period_secs: i64,
}

impl SaltSchedule {
    /// Schedule with a fresh random secret.
    pub fn new(period: Duration) -> Self {
        use rand::RngCore;
        let mut secret = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut secret);
        Self::with_secret(secret, period)
    }

    pub fn with_secret(secret: [u8; 32], period: Duration) -> Self {
        Self {
            secret,
            period_secs: i64::try_from(period.as_secs()).unwrap_or(i64::MAX).max(1),
        }
    }

    pub fn epoch(&self, now: DateTime<Utc>) -> i64 {
        now.timestamp().div_euclid(self.period_secs)
    }

    pub fn salt(&self, epoch: i64) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.secret);
        hasher.update(epoch.to_be_bytes());
        hasher.finalize().into()
    }
}

impl std::fmt::Debug for SaltSchedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SaltSchedule")
            .field("period_secs", &self.period_secs)
            .finish_non_exhaustive()
    }
}

/// Outcome of resolving one record's session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedSession {
    pub session: i64,
    pub first_visit: bool,
}

/// Sessions seen during the current salt epoch.
///
/// Reset whenever the epoch changes, which bounds both memory and how long a
/// visitor can be linked.
#[derive(Debug)]
pub struct SessionTable {
    schedule: SaltSchedule,
    epoch: Option<i64>,
    salt: [u8; 32],
    known: HashMap<(String, SessionKey), i64>,
    next_session: i64,
}

impl SessionTable {
    pub fn new(schedule: SaltSchedule) -> Self {
        Self {
            schedule,
            epoch: None,
            salt: [0u8; 32],
            known: HashMap::new(),
            next_session: 1,
        }
    }

    /// Make sure newly allocated session numbers are above `max_stored`.
    pub fn reserve_after(&mut self, max_stored: i64) {
        self.next_session = self.next_session.max(max_stored.saturating_add(1));
    }

    pub fn len(&self) -> usize {
        self.known.len()
    }

    pub fn is_empty(&self) -> bool {
        self.known.is_empty()
    }

    /// Resolve the session for a record of `website_id`.
    ///
    /// `first_visit` is true exactly when the key has not been seen for this
    /// site in the current epoch. Unsessioned records always get a fresh
    /// number and count as a first visit.
    pub fn resolve(
        &mut self,
        website_id: &str,
        source: &SessionSource,
        now: DateTime<Utc>,
    ) -> ResolvedSession {
        self.roll(now);

        let key = match source {
            SessionSource::Token(token) => SessionKey::Token(token.clone()),
            SessionSource::Fingerprint { browser, ip } => session_key(&self.salt, browser, ip),
            SessionSource::Unsessioned => {
                return ResolvedSession {
                    session: self.allocate(),
                    first_visit: true,
                }
            }
        };

        match self.known.entry((website_id.to_string(), key)) {
            Entry::Occupied(entry) => ResolvedSession {
                session: *entry.get(),
                first_visit: false,
            },
            Entry::Vacant(entry) => {
                let session = self.next_session;
                self.next_session += 1;
                entry.insert(session);
                ResolvedSession {
                    session,
                    first_visit: true,
                }
            }
        }
    }

    fn allocate(&mut self) -> i64 {
        let session = self.next_session;
        self.next_session += 1;
        session
    }

    fn roll(&mut self, now: DateTime<Utc>) {
        let epoch = self.schedule.epoch(now);
        if self.epoch == Some(epoch) {
            return;
        }
        if self.epoch.is_some() {
            info!(
                epoch,
                dropped = self.known.len(),
                "Session salt rotated, session table reset"
            );
        }
        self.known.clear();
        self.salt = self.schedule.salt(epoch);
        self.epoch = Some(epoch);
    }
}
