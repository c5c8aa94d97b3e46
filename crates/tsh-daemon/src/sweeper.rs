//! Session expiry and status reporting.
//!
//! Runs as its own task so expiry happens while the read loop is blocked.

use crate::daemon::wait_for_stop;
use crate::session::SessionRegistry;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Shortest and longest wake-up period of the sweeper task.
const MIN_TICK: Duration = Duration::from_millis(10);
const MAX_TICK: Duration = Duration::from_secs(1);

/// Snapshot of the daemon's sessions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    pub live_sessions: usize,
    pub users: usize,
    pub shells_spawned: u64,
    pub uptime: Duration,
}

impl StatusReport {
    pub async fn collect(registry: &SessionRegistry, started_at: Instant) -> Self {
        Self {
            live_sessions: registry.count().await,
            users: registry.user_count().await,
            shells_spawned: registry.spawned_total().await,
            uptime: started_at.elapsed(),
        }
    }

    /// Log the report. Never fails.
    pub fn log(&self) {
        info!(
            live_sessions = self.live_sessions,
            users = self.users,
            shells_spawned = self.shells_spawned,
            uptime_secs = self.uptime.as_secs(),
            "status"
        );
    }
}

/// Periodically evicts expired sessions.
pub struct Sweeper {
    registry: Arc<SessionRegistry>,
    expire_after: Duration,
    expire_after_idle: Duration,
    frequency: Duration,
    last_sweep: Instant,
    print_status: bool,
    started_at: Instant,
}

impl Sweeper {
    pub fn new(
        registry: Arc<SessionRegistry>,
        expire_after: Duration,
        expire_after_idle: Duration,
        frequency: Duration,
        print_status: bool,
    ) -> Self {
        let now = Instant::now();
        Self {
            registry,
            expire_after,
            expire_after_idle,
            frequency,
            last_sweep: now,
            print_status,
            started_at: now,
        }
    }

    /// Whether a sweep is due at `now`. Never due while expiry is disabled.
    pub fn time_to_sweep(&self, now: Instant) -> bool {
        if self.expire_after.is_zero() && self.expire_after_idle.is_zero() {
            return false;
        }
        now.saturating_duration_since(self.last_sweep) >= self.frequency
    }

    /// Sweep if one is due. Returns the evicted session ids, or `None` when
    /// no sweep ran.
    pub async fn tick(&mut self, now: Instant) -> Option<Vec<String>> {
        if !self.time_to_sweep(now) {
            return None;
        }
        self.last_sweep = now;
        let removed = self
            .registry
            .sweep(now, self.expire_after, self.expire_after_idle)
            .await;
        if !removed.is_empty() {
            info!(count = removed.len(), "expired sessions removed");
        }
        if self.print_status {
            StatusReport::collect(&self.registry, self.started_at)
                .await
                .log();
        }
        Some(removed)
    }

    /// Run on a timer until `stop` flips to true.
    pub fn spawn(mut self, mut stop: watch::Receiver<bool>) -> JoinHandle<()> {
        let period = self.frequency.clamp(MIN_TICK, MAX_TICK);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        self.tick(Instant::now()).await;
                    }
                    _ = wait_for_stop(&mut stop) => break,
                }
            }
            debug!("sweeper stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TerminalConfig;
    use crate::session::registry::tests::FakeShell;
    use crate::session::{SessionLimits, ShellHandle};

    fn registry() -> Arc<SessionRegistry> {
        Arc::new(SessionRegistry::new(SessionLimits {
            max_user_sessions: 4,
            max_shells_spawned: 16,
        }))
    }

    async fn add_session(registry: &SessionRegistry, user: &str) -> String {
        registry
            .create(user, "/bin/sh", TerminalConfig::default(), |_| async {
                Ok(Arc::new(FakeShell::default()) as Arc<dyn ShellHandle>)
            })
            .await
            .unwrap()
            .id
    }

    #[test]
    fn never_due_with_expiry_disabled() {
        let sweeper = Sweeper::new(
            registry(),
            Duration::ZERO,
            Duration::ZERO,
            Duration::from_secs(1),
            false,
        );
        let far_future = Instant::now() + Duration::from_secs(3600);
        assert!(!sweeper.time_to_sweep(far_future));
    }

    #[test]
    fn due_once_frequency_elapsed() {
        let sweeper = Sweeper::new(
            registry(),
            Duration::from_secs(60),
            Duration::ZERO,
            Duration::from_secs(32),
            false,
        );
        let start = sweeper.last_sweep;
        assert!(!sweeper.time_to_sweep(start + Duration::from_secs(31)));
        assert!(sweeper.time_to_sweep(start + Duration::from_secs(32)));
    }

    #[test]
    fn idle_threshold_alone_enables_sweeping() {
        let sweeper = Sweeper::new(
            registry(),
            Duration::ZERO,
            Duration::from_secs(5),
            Duration::from_secs(1),
            false,
        );
        assert!(sweeper.time_to_sweep(sweeper.last_sweep + Duration::from_secs(2)));
    }

    #[tokio::test]
    async fn tick_evicts_expired_sessions() {
        let registry = registry();
        let id = add_session(&registry, "user-1").await;
        let mut sweeper = Sweeper::new(
            registry.clone(),
            Duration::from_secs(10),
            Duration::ZERO,
            Duration::from_secs(1),
            true,
        );
        let start = sweeper.last_sweep;

        let removed = sweeper.tick(start + Duration::from_secs(2)).await.unwrap();
        assert!(removed.is_empty());
        assert_eq!(registry.count().await, 1);

        // Not due again right after a sweep.
        assert!(sweeper.tick(start + Duration::from_secs(2)).await.is_none());

        let removed = sweeper.tick(Instant::now() + Duration::from_secs(11)).await.unwrap();
        assert_eq!(removed, vec![id]);
        assert_eq!(registry.count().await, 0);
    }

    #[tokio::test]
    async fn tick_without_expiry_keeps_sessions() {
        let registry = registry();
        add_session(&registry, "user-1").await;
        let mut sweeper = Sweeper::new(
            registry.clone(),
            Duration::ZERO,
            Duration::ZERO,
            Duration::from_millis(1),
            false,
        );
        assert!(sweeper
            .tick(Instant::now() + Duration::from_secs(86_400))
            .await
            .is_none());
        assert_eq!(registry.count().await, 1);
    }

    #[tokio::test]
    async fn status_report_counts() {
        let registry = registry();
        add_session(&registry, "a").await;
        add_session(&registry, "a").await;
        let b = add_session(&registry, "b").await;
        registry.remove(&b).await.unwrap();

        let report = StatusReport::collect(&registry, Instant::now()).await;
        assert_eq!(report.live_sessions, 2);
        assert_eq!(report.users, 1);
        assert_eq!(report.shells_spawned, 3);
        report.log();
    }

    #[tokio::test]
    async fn spawned_task_sweeps_and_stops() {
        let registry = registry();
        add_session(&registry, "user-1").await;
        let (stop_tx, stop_rx) = watch::channel(false);
        let sweeper = Sweeper::new(
            registry.clone(),
            Duration::from_millis(20),
            Duration::ZERO,
            Duration::from_millis(10),
            false,
        );
        let handle = sweeper.spawn(stop_rx);

        let deadline = Instant::now() + Duration::from_secs(5);
        while registry.count().await > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(registry.count().await, 0);

        stop_tx.send_replace(true);
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
