//! Message router: maps one inbound message to registry and shell actions.
//!
//! Routing errors (unknown session, limits, malformed requests) are returned
//! to the caller and never written to the transport.

use crate::config::TerminalConfig;
use crate::session::{SessionRegistry, ShellEvent, ShellSpawner, ShellSpec};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};
use tsh_core::{MessageStatus, MessageType, ShellMessage, TshError, TshResult};

/// Settings applied to every shell the router starts.
#[derive(Debug, Clone)]
pub struct ShellSettings {
    pub command: String,
    pub user: Option<String>,
    pub terminal: TerminalConfig,
}

/// Routes inbound messages.
pub struct Router {
    registry: Arc<SessionRegistry>,
    spawner: Arc<dyn ShellSpawner>,
    settings: ShellSettings,
    /// Shell output and exit events flow back to the daemon through here.
    events: mpsc::Sender<ShellEvent>,
}

impl Router {
    pub fn new(
        registry: Arc<SessionRegistry>,
        spawner: Arc<dyn ShellSpawner>,
        settings: ShellSettings,
        events: mpsc::Sender<ShellEvent>,
    ) -> Self {
        Self {
            registry,
            spawner,
            settings,
            events,
        }
    }

    /// Route one message and return the messages to send back.
    pub async fn route(&self, message: ShellMessage) -> TshResult<Vec<ShellMessage>> {
        debug!(
            msg_type = %message.msg_type,
            session_id = %message.session_id,
            len = message.data.len(),
            "routing message"
        );
        match message.msg_type {
            MessageType::SpawnShell => self.spawn_shell(message).await,
            MessageType::ShellCommand => self.shell_command(message).await,
            MessageType::StopShell => self.stop_shell(message).await,
        }
    }

    async fn spawn_shell(&self, message: ShellMessage) -> TshResult<Vec<ShellMessage>> {
        let user_id = requesting_user(&message);
        if user_id.is_empty() {
            return Err(TshError::InvalidMessage(
                "spawn_shell without a user id".into(),
            ));
        }

        let spawner = self.spawner.clone();
        let settings = self.settings.clone();
        let events = self.events.clone();
        let session = self
            .registry
            .create(&user_id, &self.settings.command, self.settings.terminal, |id| async move {
                // Opening a PTY and forking block, keep them off the runtime.
                tokio::task::spawn_blocking(move || {
                    let spec = ShellSpec {
                        command: &settings.command,
                        user: settings.user.as_deref(),
                        terminal: settings.terminal,
                    };
                    spawner.spawn(&id, &spec, events)
                })
                .await
                .map_err(|e| TshError::Other(format!("join error: {e}")))?
            })
            .await?;

        info!(session_id = %session.id, user_id = %user_id, "shell started");
        let mut ack = ShellMessage::new(MessageType::SpawnShell).with_status(MessageStatus::Normal);
        ack.session_id = session.id;
        ack.user_id = user_id;
        Ok(vec![ack])
    }

    async fn shell_command(&self, message: ShellMessage) -> TshResult<Vec<ShellMessage>> {
        let shell = self.registry.shell_for_input(&message.session_id).await?;
        let data = message.data;
        tokio::task::spawn_blocking(move || shell.write(&data))
            .await
            .map_err(|e| TshError::Other(format!("join error: {e}")))??;
        Ok(Vec::new())
    }

    async fn stop_shell(&self, message: ShellMessage) -> TshResult<Vec<ShellMessage>> {
        if !message.session_id.is_empty() {
            let removed = self.registry.remove(&message.session_id).await?;
            info!(session_id = %removed.id, user_id = %removed.user_id, "shell stopped");
            return Ok(vec![ShellMessage::stop_shell(removed.id, removed.user_id)]);
        } else if !message.user_id.is_empty() {
            let removed = self.registry.remove_all_for_user(&message.user_id).await;
            debug!(user_id = %message.user_id, removed, "stop by user");
        } else {
            debug!("stop_shell without session or user id, ignoring");
        }
        Ok(Vec::new())
    }
}

/// The user a spawn request is for. Some servers send it as the payload
/// instead of in `user_id`.
fn requesting_user(message: &ShellMessage) -> String {
    if !message.user_id.is_empty() {
        return message.user_id.clone();
    }
    std::str::from_utf8(&message.data)
        .map(|s| s.trim().to_string())
        .unwrap_or_default()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::session::registry::tests::FakeShell;
    use crate::session::{SessionLimits, ShellHandle};
    use std::sync::atomic::Ordering;
    use std::sync::Mutex;
    use std::time::{Duration, Instant};

    /// Spawner that hands out [`FakeShell`]s and remembers them.
    #[derive(Default)]
    pub(crate) struct FakeSpawner {
        pub shells: Mutex<Vec<(String, Arc<FakeShell>)>>,
        pub fail: bool,
        /// How long each spawn blocks its thread.
        pub delay: Duration,
        events: Mutex<Option<mpsc::Sender<ShellEvent>>>,
    }

    impl FakeSpawner {
        pub fn shell(&self, session_id: &str) -> Arc<FakeShell> {
            self.shells
                .lock()
                .unwrap()
                .iter()
                .find(|(id, _)| id == session_id)
                .map(|(_, s)| s.clone())
                .unwrap()
        }

        /// The event sender handed to the most recent spawn.
        pub fn events(&self) -> mpsc::Sender<ShellEvent> {
            self.events.lock().unwrap().clone().unwrap()
        }
    }

    impl ShellSpawner for FakeSpawner {
        fn spawn(
            &self,
            session_id: &str,
            _spec: &ShellSpec<'_>,
            events: mpsc::Sender<ShellEvent>,
        ) -> TshResult<Arc<dyn ShellHandle>> {
            *self.events.lock().unwrap() = Some(events);
            std::thread::sleep(self.delay);
            if self.fail {
                return Err(TshError::Shell("spawn refused".into()));
            }
            let shell = Arc::new(FakeShell::default());
            self.shells
                .lock()
                .unwrap()
                .push((session_id.to_string(), shell.clone()));
            Ok(shell as Arc<dyn ShellHandle>)
        }
    }

    struct Fixture {
        router: Router,
        registry: Arc<SessionRegistry>,
        spawner: Arc<FakeSpawner>,
        _events: mpsc::Receiver<ShellEvent>,
    }

    fn fixture(max_user_sessions: usize, max_shells_spawned: usize) -> Fixture {
        fixture_with(FakeSpawner::default(), max_user_sessions, max_shells_spawned)
    }

    fn fixture_with(
        spawner: FakeSpawner,
        max_user_sessions: usize,
        max_shells_spawned: usize,
    ) -> Fixture {
        let registry = Arc::new(SessionRegistry::new(SessionLimits {
            max_user_sessions,
            max_shells_spawned,
        }));
        let spawner = Arc::new(spawner);
        let (tx, rx) = mpsc::channel(16);
        let router = Router::new(
            registry.clone(),
            spawner.clone(),
            ShellSettings {
                command: "/bin/sh".into(),
                user: None,
                terminal: TerminalConfig::default(),
            },
            tx,
        );
        Fixture {
            router,
            registry,
            spawner,
            _events: rx,
        }
    }

    async fn spawn(f: &Fixture, user: &str) -> TshResult<String> {
        let out = f.router.route(ShellMessage::spawn_shell(user)).await?;
        assert_eq!(out.len(), 1);
        Ok(out[0].session_id.clone())
    }

    #[tokio::test]
    async fn spawn_acknowledges_with_session_id() {
        let f = fixture(1, 4);
        let out = f
            .router
            .route(ShellMessage::spawn_shell("user-1"))
            .await
            .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].msg_type, MessageType::SpawnShell);
        assert_eq!(out[0].status, MessageStatus::Normal);
        assert_eq!(out[0].user_id, "user-1");
        let info = f.registry.lookup(&out[0].session_id).await.unwrap();
        assert_eq!(info.user_id, "user-1");
    }

    #[tokio::test]
    async fn spawn_takes_user_from_payload() {
        let f = fixture(1, 4);
        let mut msg = ShellMessage::new(MessageType::SpawnShell);
        msg.data = b"user-from-data\n".to_vec();
        let out = f.router.route(msg).await.unwrap();
        assert_eq!(out[0].user_id, "user-from-data");
        assert_eq!(f.registry.count_for_user("user-from-data").await, 1);
    }

    #[tokio::test]
    async fn spawn_without_user_is_invalid() {
        let f = fixture(1, 4);
        let err = f
            .router
            .route(ShellMessage::new(MessageType::SpawnShell))
            .await
            .unwrap_err();
        assert!(matches!(err, TshError::InvalidMessage(_)));
        assert_eq!(f.registry.count().await, 0);
    }

    #[tokio::test]
    async fn third_spawn_for_same_user_hits_limit() {
        let f = fixture(2, 16);
        spawn(&f, "user-1").await.unwrap();
        spawn(&f, "user-1").await.unwrap();
        let err = spawn(&f, "user-1").await.unwrap_err();
        assert!(matches!(err, TshError::LimitExceeded(_)));
        assert!(err.is_routing());
        assert_eq!(f.registry.list_by_user("user-1").await.len(), 2);
    }

    #[tokio::test]
    async fn global_limit_across_users() {
        let f = fixture(4, 2);
        spawn(&f, "a").await.unwrap();
        spawn(&f, "b").await.unwrap();
        let err = spawn(&f, "c").await.unwrap_err();
        assert!(matches!(err, TshError::LimitExceeded(_)));
        assert_eq!(f.registry.count().await, 2);
    }

    #[tokio::test]
    async fn spawn_failure_is_reported() {
        let spawner = FakeSpawner {
            fail: true,
            ..FakeSpawner::default()
        };
        let f = fixture_with(spawner, 1, 4);
        let err = spawn(&f, "user-1").await.unwrap_err();
        assert!(matches!(err, TshError::Shell(_)));
        assert_eq!(f.registry.count().await, 0);
    }

    #[tokio::test]
    async fn slow_spawn_does_not_block_other_work() {
        let spawner = FakeSpawner {
            delay: Duration::from_millis(500),
            ..FakeSpawner::default()
        };
        let f = fixture_with(spawner, 2, 4);

        let (spawned, seen) = tokio::join!(spawn(&f, "user-1"), async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let count = tokio::time::timeout(Duration::from_millis(200), f.registry.count())
                .await
                .expect("registry blocked by a starting shell");
            let other = tokio::time::timeout(
                Duration::from_millis(200),
                f.router.route(ShellMessage::stop_shell("", "user-2")),
            )
            .await
            .expect("router blocked by a starting shell");
            assert!(other.unwrap().is_empty());
            count
        });

        assert_eq!(seen, 0);
        let id = spawned.unwrap();
        assert_eq!(f.registry.lookup(&id).await.unwrap().user_id, "user-1");
    }

    #[tokio::test]
    async fn command_reaches_shell_and_refreshes_activity() {
        let f = fixture(1, 4);
        let id = spawn(&f, "user-1").await.unwrap();
        let before = Instant::now();

        let out = f
            .router
            .route(ShellMessage::shell_command(&id, b"echo hello\n".to_vec()))
            .await
            .unwrap();
        assert!(out.is_empty());
        assert_eq!(
            f.spawner.shell(&id).input.lock().unwrap().as_slice(),
            b"echo hello\n"
        );
        assert!(f.registry.lookup(&id).await.unwrap().last_active >= before);
    }

    #[tokio::test]
    async fn command_for_unknown_session() {
        let f = fixture(1, 4);
        spawn(&f, "user-1").await.unwrap();
        let err = f
            .router
            .route(ShellMessage::shell_command("undefined-session-id", b"rm -f x\n".to_vec()))
            .await
            .unwrap_err();
        assert!(matches!(err, TshError::SessionNotFound(_)));
        assert_eq!(f.registry.count().await, 1);
    }

    #[tokio::test]
    async fn stop_unknown_session_leaves_registry_unchanged() {
        let f = fixture(1, 4);
        spawn(&f, "user-1").await.unwrap();
        let err = f
            .router
            .route(ShellMessage::stop_shell("undefined-session-id", ""))
            .await
            .unwrap_err();
        assert!(matches!(err, TshError::SessionNotFound(_)));
        assert_eq!(f.registry.count().await, 1);
    }

    #[tokio::test]
    async fn stop_removes_exactly_one_session() {
        let f = fixture(2, 4);
        let first = spawn(&f, "user-1").await.unwrap();
        let second = spawn(&f, "user-1").await.unwrap();

        let out = f
            .router
            .route(ShellMessage::stop_shell(&first, ""))
            .await
            .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].msg_type, MessageType::StopShell);
        assert_eq!(out[0].session_id, first);
        assert_eq!(out[0].user_id, "user-1");
        assert_eq!(f.registry.count().await, 1);
        assert!(f.spawner.shell(&first).stopped.load(Ordering::SeqCst));
        assert!(!f.spawner.shell(&second).stopped.load(Ordering::SeqCst));
        assert!(f.registry.lookup(&second).await.is_ok());
    }

    #[tokio::test]
    async fn stop_by_user_then_by_old_id() {
        let f = fixture(1, 4);
        let id = spawn(&f, "user-1").await.unwrap();

        f.router
            .route(ShellMessage::stop_shell("", "user-1"))
            .await
            .unwrap();
        assert_eq!(f.registry.count().await, 0);

        let err = f
            .router
            .route(ShellMessage::stop_shell(&id, ""))
            .await
            .unwrap_err();
        assert!(matches!(err, TshError::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn stop_by_user_without_sessions_is_noop() {
        let f = fixture(1, 4);
        let out = f
            .router
            .route(ShellMessage::stop_shell("", "nobody"))
            .await
            .unwrap();
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn stop_with_no_ids_is_ignored() {
        let f = fixture(1, 4);
        spawn(&f, "user-1").await.unwrap();
        let out = f
            .router
            .route(ShellMessage::stop_shell("", ""))
            .await
            .unwrap();
        assert!(out.is_empty());
        assert_eq!(f.registry.count().await, 1);
    }
}
