//! Session registry.
//!
//! Owns every live session, indexed by session id and by owning user, and
//! enforces the per-user and global shell limits. Limit checks and index
//! updates happen under one lock; shell startup, shell I/O and shell teardown
//! happen after it is released.

use super::shell::ShellHandle;
use crate::config::TerminalConfig;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use tsh_core::{TshError, TshResult};

/// Spawn limits enforced by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionLimits {
    pub max_user_sessions: usize,
    pub max_shells_spawned: usize,
}

/// A live session.
pub struct Session {
    pub id: String,
    pub user_id: String,
    /// Shell command the session runs.
    pub command: String,
    pub terminal: TerminalConfig,
    pub created_at: Instant,
    /// Refreshed on every command routed to the session and every output chunk.
    pub last_active: Instant,
    shell: Arc<dyn ShellHandle>,
}

impl Session {
    fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id.clone(),
            user_id: self.user_id.clone(),
            command: self.command.clone(),
            terminal: self.terminal,
            created_at: self.created_at,
            last_active: self.last_active,
        }
    }
}

/// Snapshot of a session handed out by the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub id: String,
    pub user_id: String,
    pub command: String,
    pub terminal: TerminalConfig,
    pub created_at: Instant,
    pub last_active: Instant,
}

#[derive(Default)]
struct Inner {
    sessions: HashMap<String, Session>,
    /// user id → session ids, in creation order. Empty buckets are removed.
    by_user: HashMap<String, Vec<String>>,
    /// session id → user id for slots whose shell is still starting.
    pending: HashMap<String, String>,
    /// Shells started since the daemon came up.
    spawned_total: u64,
}

impl Inner {
    fn take(&mut self, session_id: &str) -> Option<Session> {
        let session = self.sessions.remove(session_id)?;
        if let Some(ids) = self.by_user.get_mut(&session.user_id) {
            ids.retain(|id| id != session_id);
            if ids.is_empty() {
                self.by_user.remove(&session.user_id);
            }
        }
        Some(session)
    }
}

/// The authoritative index of live sessions.
pub struct SessionRegistry {
    inner: RwLock<Inner>,
    limits: SessionLimits,
}

impl SessionRegistry {
    pub fn new(limits: SessionLimits) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            limits,
        }
    }

    /// Create a session for `user_id`, starting its shell with `spawn`.
    ///
    /// The limit check reserves a slot under the write lock, so concurrent
    /// creates can never both pass a limit. `spawn` runs with the lock
    /// released and receives the new session id. If it fails the slot is
    /// released and nothing is inserted.
    pub async fn create<F, Fut>(
        &self,
        user_id: &str,
        command: &str,
        terminal: TerminalConfig,
        spawn: F,
    ) -> TshResult<SessionInfo>
    where
        F: FnOnce(String) -> Fut,
        Fut: Future<Output = TshResult<Arc<dyn ShellHandle>>>,
    {
        let session_id = {
            let mut inner = self.inner.write().await;

            let user_count = inner.by_user.get(user_id).map_or(0, Vec::len)
                + inner.pending.values().filter(|u| *u == user_id).count();
            if user_count >= self.limits.max_user_sessions {
                return Err(TshError::LimitExceeded(format!(
                    "user {user_id} already has {user_count} sessions (max {})",
                    self.limits.max_user_sessions
                )));
            }
            if inner.sessions.len() + inner.pending.len() >= self.limits.max_shells_spawned {
                return Err(TshError::LimitExceeded(format!(
                    "max shells ({}) reached",
                    self.limits.max_shells_spawned
                )));
            }

            let session_id = loop {
                let id = generate_session_id();
                if !inner.sessions.contains_key(&id) && !inner.pending.contains_key(&id) {
                    break id;
                }
            };
            inner.pending.insert(session_id.clone(), user_id.to_string());
            session_id
        };

        let spawned = spawn(session_id.clone()).await;

        let mut inner = self.inner.write().await;
        inner.pending.remove(&session_id);
        let shell = spawned?;

        let now = Instant::now();
        let session = Session {
            id: session_id.clone(),
            user_id: user_id.to_string(),
            command: command.to_string(),
            terminal,
            created_at: now,
            last_active: now,
            shell,
        };
        let info = session.info();

        inner.sessions.insert(session_id.clone(), session);
        inner
            .by_user
            .entry(user_id.to_string())
            .or_default()
            .push(session_id.clone());
        inner.spawned_total += 1;

        info!(
            session_id = %session_id,
            user_id,
            sessions = inner.sessions.len(),
            "session created"
        );
        Ok(info)
    }

    pub async fn lookup(&self, session_id: &str) -> TshResult<SessionInfo> {
        let inner = self.inner.read().await;
        inner
            .sessions
            .get(session_id)
            .map(Session::info)
            .ok_or_else(|| TshError::SessionNotFound(session_id.to_string()))
    }

    /// Sessions owned by `user_id`, oldest first.
    pub async fn list_by_user(&self, user_id: &str) -> Vec<SessionInfo> {
        let inner = self.inner.read().await;
        inner
            .by_user
            .get(user_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| inner.sessions.get(id))
                    .map(Session::info)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Refresh a session's activity timestamp.
    pub async fn touch(&self, session_id: &str) -> TshResult<()> {
        let mut inner = self.inner.write().await;
        let session = inner
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| TshError::SessionNotFound(session_id.to_string()))?;
        session.last_active = Instant::now();
        Ok(())
    }

    /// Touch a session and hand out its shell so input can be written
    /// without holding the registry lock.
    pub async fn shell_for_input(&self, session_id: &str) -> TshResult<Arc<dyn ShellHandle>> {
        let mut inner = self.inner.write().await;
        let session = inner
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| TshError::SessionNotFound(session_id.to_string()))?;
        session.last_active = Instant::now();
        Ok(session.shell.clone())
    }

    /// Remove a session and stop its shell.
    pub async fn remove(&self, session_id: &str) -> TshResult<SessionInfo> {
        let session = {
            let mut inner = self.inner.write().await;
            inner
                .take(session_id)
                .ok_or_else(|| TshError::SessionNotFound(session_id.to_string()))?
        };
        session.shell.stop();
        info!(session_id, user_id = %session.user_id, "session removed");
        Ok(session.info())
    }

    /// Remove every session owned by `user_id`. Returns how many were removed.
    pub async fn remove_all_for_user(&self, user_id: &str) -> usize {
        let removed: Vec<Session> = {
            let mut inner = self.inner.write().await;
            let ids = inner.by_user.get(user_id).cloned().unwrap_or_default();
            ids.iter().filter_map(|id| inner.take(id)).collect()
        };
        for session in &removed {
            session.shell.stop();
        }
        if !removed.is_empty() {
            info!(user_id, count = removed.len(), "sessions removed for user");
        }
        removed.len()
    }

    /// Remove every session.
    pub async fn remove_all(&self) -> usize {
        let removed: Vec<Session> = {
            let mut inner = self.inner.write().await;
            inner.by_user.clear();
            inner.sessions.drain().map(|(_, s)| s).collect()
        };
        for session in &removed {
            session.shell.stop();
        }
        if !removed.is_empty() {
            info!(count = removed.len(), "all sessions removed");
        }
        removed.len()
    }

    /// Evict sessions older than `max_lifetime` or idle longer than `max_idle`.
    ///
    /// A zero threshold disables that criterion; with both zero nothing is
    /// ever removed. Returns the ids of removed sessions.
    pub async fn sweep(&self, now: Instant, max_lifetime: Duration, max_idle: Duration) -> Vec<String> {
        if max_lifetime.is_zero() && max_idle.is_zero() {
            return Vec::new();
        }

        let removed: Vec<Session> = {
            let mut inner = self.inner.write().await;
            let expired: Vec<String> = inner
                .sessions
                .values()
                .filter(|s| {
                    let age = now.saturating_duration_since(s.created_at);
                    let idle = now.saturating_duration_since(s.last_active);
                    if !max_lifetime.is_zero() && age > max_lifetime {
                        warn!(session_id = %s.id, age_secs = age.as_secs(), "session expired");
                        return true;
                    }
                    if !max_idle.is_zero() && idle > max_idle {
                        warn!(session_id = %s.id, idle_secs = idle.as_secs(), "session expired (idle)");
                        return true;
                    }
                    false
                })
                .map(|s| s.id.clone())
                .collect();
            expired.iter().filter_map(|id| inner.take(id)).collect()
        };

        for session in &removed {
            session.shell.stop();
        }
        if !removed.is_empty() {
            debug!(count = removed.len(), "sweep removed sessions");
        }
        removed.into_iter().map(|s| s.id).collect()
    }

    /// Number of live sessions.
    pub async fn count(&self) -> usize {
        self.inner.read().await.sessions.len()
    }

    pub async fn count_for_user(&self, user_id: &str) -> usize {
        self.inner
            .read()
            .await
            .by_user
            .get(user_id)
            .map_or(0, Vec::len)
    }

    /// Number of users with at least one session.
    pub async fn user_count(&self) -> usize {
        self.inner.read().await.by_user.len()
    }

    /// Shells started since the registry was created.
    pub async fn spawned_total(&self) -> u64 {
        self.inner.read().await.spawned_total
    }
}

/// Generate a random session ID (hex-encoded, 16 bytes = 32 hex chars).
fn generate_session_id() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let bytes: [u8; 16] = rng.gen();
    hex::encode(bytes)
}
