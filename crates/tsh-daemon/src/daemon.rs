//! The daemon loop.
//!
//! Waits for a token, connects, then multiplexes inbound messages and shell
//! output over the connection until stopped. Lost connections are retried a
//! bounded number of times.

use crate::auth::{acquire_token, is_unauthorized, TokenProvider};
use crate::config::DaemonConfig;
use crate::connection::{Connection, ConnectionManager};
use crate::router::{Router, ShellSettings};
use crate::session::{SessionLimits, SessionRegistry, ShellEvent, ShellSpawner};
use crate::sweeper::{StatusReport, Sweeper};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};
use tsh_core::{Dialer, ShellMessage, TshError, TshResult};

/// Capacity of the channel shared by all shells for output and exit events.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Resolves once the stop flag is set (or its sender is gone).
pub(crate) async fn wait_for_stop(stop: &mut watch::Receiver<bool>) {
    loop {
        if *stop.borrow_and_update() {
            return;
        }
        if stop.changed().await.is_err() {
            return;
        }
    }
}

enum ConnState<R, W> {
    /// Waiting for the device to be authorized.
    Unauthenticated,
    /// Dialing. `attempt` 0 is the first connect, later ones are reconnects.
    Connecting { token: String, attempt: u32 },
    Running(Connection<R, W>),
    /// Connection lost, device still authorized.
    ReconnectPending,
    Stopped,
}

type State<D> = ConnState<<D as Dialer>::Reader, <D as Dialer>::Writer>;

/// The device-side shell daemon.
pub struct Daemon<D, P> {
    config: DaemonConfig,
    connections: ConnectionManager<D>,
    tokens: P,
    spawner: Arc<dyn ShellSpawner>,
    registry: Arc<SessionRegistry>,
    stop_tx: watch::Sender<bool>,
    started_at: Instant,
}

impl<D: Dialer, P: TokenProvider> Daemon<D, P> {
    pub fn new(config: DaemonConfig, dialer: D, tokens: P, spawner: Arc<dyn ShellSpawner>) -> Self {
        let connections =
            ConnectionManager::new(dialer, config.server_url.clone(), config.write_timeout);
        let registry = Arc::new(SessionRegistry::new(SessionLimits {
            max_user_sessions: config.max_user_sessions,
            max_shells_spawned: config.max_shells_spawned,
        }));
        let (stop_tx, _) = watch::channel(false);
        Self {
            config,
            connections,
            tokens,
            spawner,
            registry,
            stop_tx,
            started_at: Instant::now(),
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Ask a running daemon to shut down. [`run`](Self::run) then returns `Ok(())`.
    pub fn stop(&self) {
        self.stop_tx.send_replace(true);
    }

    pub fn should_stop(&self) -> bool {
        *self.stop_tx.borrow()
    }

    /// Log a status report. Never fails.
    pub async fn print_status(&self) {
        StatusReport::collect(&self.registry, self.started_at)
            .await
            .log();
    }

    /// Run until stopped or until the connection cannot be restored.
    ///
    /// Every session is torn down before this returns.
    pub async fn run(&self) -> TshResult<()> {
        info!(url = %self.connections.server_url(), "daemon starting");

        let (events_tx, mut events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let router = Router::new(
            self.registry.clone(),
            self.spawner.clone(),
            ShellSettings {
                command: self.config.shell_command.clone(),
                user: self.config.user.clone(),
                terminal: self.config.terminal,
            },
            events_tx,
        );
        let sweeper = Sweeper::new(
            self.registry.clone(),
            self.config.expire_sessions_after,
            self.config.expire_sessions_after_idle,
            self.config.sweep_frequency,
            self.config.print_status,
        )
        .spawn(self.stop_tx.subscribe());

        let mut stop = self.stop_tx.subscribe();
        let result = self.drive(&router, &mut events_rx, &mut stop).await;

        sweeper.abort();
        let removed = self.registry.remove_all().await;
        match &result {
            Ok(()) => info!(sessions_closed = removed, "daemon stopped"),
            Err(e) => error!(error = %e, sessions_closed = removed, "daemon failed"),
        }
        result
    }

    async fn drive(
        &self,
        router: &Router,
        events: &mut mpsc::Receiver<ShellEvent>,
        stop: &mut watch::Receiver<bool>,
    ) -> TshResult<()> {
        let max_attempts = self.config.max_reconnect_attempts;
        let mut state: State<D> = ConnState::Unauthenticated;
        loop {
            state = match state {
                ConnState::Unauthenticated => self.authenticate(stop, 0).await?,
                ConnState::ReconnectPending => {
                    if max_attempts == 0 {
                        return Err(TshError::ReconnectExhausted(0));
                    }
                    self.authenticate(stop, 1).await?
                }
                ConnState::Connecting { token, attempt } => {
                    let dialed = tokio::select! {
                        biased;
                        _ = wait_for_stop(stop) => None,
                        res = self.dial(&token, attempt) => Some(res),
                    };
                    match dialed {
                        None => ConnState::Stopped,
                        Some(Ok(conn)) => ConnState::Running(conn),
                        Some(Err(e)) if attempt >= max_attempts => {
                            error!(error = %e, attempts = attempt, "giving up on server");
                            return Err(TshError::ReconnectExhausted(max_attempts));
                        }
                        Some(Err(e)) => {
                            warn!(
                                error = %e,
                                attempt,
                                retry_in_ms = self.config.reconnect_delay.as_millis() as u64,
                                "connection failed"
                            );
                            tokio::select! {
                                biased;
                                _ = wait_for_stop(stop) => ConnState::Stopped,
                                _ = tokio::time::sleep(self.config.reconnect_delay) => {
                                    ConnState::Connecting { token, attempt: attempt + 1 }
                                }
                            }
                        }
                    }
                }
                ConnState::Running(conn) => self.serve(conn, router, events, stop).await,
                ConnState::Stopped => return Ok(()),
            };
        }
    }

    /// Wait for a token, then move on to dialing.
    async fn authenticate(
        &self,
        stop: &mut watch::Receiver<bool>,
        attempt: u32,
    ) -> TshResult<State<D>> {
        tokio::select! {
            biased;
            _ = wait_for_stop(stop) => Ok(ConnState::Stopped),
            token = acquire_token(&self.tokens, self.config.token_poll_interval) => {
                Ok(ConnState::Connecting { token: token?, attempt })
            }
        }
    }

    async fn dial(
        &self,
        token: &str,
        attempt: u32,
    ) -> TshResult<Connection<D::Reader, D::Writer>> {
        if attempt == 0 {
            self.connections.connect(token).await
        } else {
            self.connections.reconnect(token, attempt).await
        }
    }

    /// Multiplex one live connection until it fails or the daemon stops.
    ///
    /// Inbound reads and shell events are polled in random order so a busy
    /// side cannot starve the other.
    async fn serve(
        &self,
        mut conn: Connection<D::Reader, D::Writer>,
        router: &Router,
        events: &mut mpsc::Receiver<ShellEvent>,
        stop: &mut watch::Receiver<bool>,
    ) -> State<D> {
        loop {
            tokio::select! {
                _ = wait_for_stop(stop) => {
                    conn.close().await;
                    return ConnState::Stopped;
                }
                res = conn.read() => match res {
                    Ok(message) => {
                        for reply in self.dispatch(router, message).await {
                            if let Err(e) = conn.write(&reply).await {
                                return self.connection_lost(&conn, e).await;
                            }
                        }
                    }
                    Err(TshError::Codec(e)) => {
                        warn!(error = %e, "dropping malformed frame");
                    }
                    Err(e) => return self.connection_lost(&conn, e).await,
                },
                Some(event) = events.recv() => {
                    if let Some(message) = self.shell_event(event).await {
                        if let Err(e) = conn.write(&message).await {
                            return self.connection_lost(&conn, e).await;
                        }
                    }
                }
            }
        }
    }

    async fn dispatch(&self, router: &Router, message: ShellMessage) -> Vec<ShellMessage> {
        let msg_type = message.msg_type;
        match router.route(message).await {
            Ok(replies) => replies,
            Err(e) => {
                warn!(msg_type = %msg_type, error = %e, "message not routed");
                Vec::new()
            }
        }
    }

    /// Turn shell output or exit into the message to send, if any.
    async fn shell_event(&self, event: ShellEvent) -> Option<ShellMessage> {
        match event {
            ShellEvent::Output { session_id, data } => {
                if self.registry.touch(&session_id).await.is_err() {
                    debug!(session_id = %session_id, "dropping output of closed session");
                    return None;
                }
                Some(ShellMessage::shell_command(session_id, data))
            }
            ShellEvent::Exited { session_id } => match self.registry.remove(&session_id).await {
                Ok(session) => Some(ShellMessage::stop_shell(session.id, session.user_id)),
                Err(_) => None,
            },
        }
    }

    async fn connection_lost(&self, conn: &Connection<D::Reader, D::Writer>, err: TshError) -> State<D> {
        warn!(error = %err, "connection lost");
        conn.close().await;
        if is_unauthorized(&self.tokens).await {
            let closed = self.registry.remove_all().await;
            warn!(sessions_closed = closed, "device no longer authorized");
            ConnState::Unauthenticated
        } else {
            ConnState::ReconnectPending
        }
    }
}
