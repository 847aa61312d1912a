//! Session lifecycle: log in, pull feeds, log out, log in again
//!
//! [`transition`] is a pure function from a state and an event to the next
//! state and the commands to run. [`SessionRunner`] executes the commands
//! and turns their results back into events.

use anyhow::Result;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::PullerManager;
use crate::config::Config;
use crate::crawler::fetcher::FeedFetcher;
use crate::crawler::pool::FeedWorkerPool;
use crate::metrics;
use crate::models::SessionId;
use crate::scheduler::trigger::{Housekeeping, HousekeepingExit};
use crate::storage::checkpoint::StatCache;
use crate::utils::Clock;

/// Where the puller is in its session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullerState {
    LoggingIn,
    Pulling,
    LoggingOut,
    Stopped,
}

/// Something that happened to the session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    LoggedIn(SessionId),
    LoginFailed,
    /// Manager or operator asked for a logout
    LogoutRequested,
    LoggedOut,
    Shutdown,
}

/// Work for the runner
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionCommand {
    Login,
    WaitBeforeLogin,
    StartPool(SessionId),
    StopPool,
    PersistStats,
    Logout,
    Exit,
}

/// Next state and commands for `event` in `state`
pub fn transition(state: PullerState, event: SessionEvent) -> (PullerState, Vec<SessionCommand>) {
    use SessionCommand as C;
    use SessionEvent as E;
    use PullerState as S;

    match (state, event) {
        (S::Stopped, _) => (S::Stopped, vec![]),
        (_, E::Shutdown) if state != S::Pulling => (S::Stopped, vec![C::Exit]),
        (S::Pulling, E::Shutdown) => (
            S::Stopped,
            vec![C::StopPool, C::PersistStats, C::Logout, C::Exit],
        ),

        (S::LoggingIn, E::LoggedIn(session)) => (S::Pulling, vec![C::StartPool(session)]),
        (S::LoggingIn, E::LoginFailed) => (S::LoggingIn, vec![C::WaitBeforeLogin, C::Login]),

        (S::Pulling, E::LogoutRequested) => (
            S::LoggingOut,
            vec![C::StopPool, C::PersistStats, C::Logout],
        ),

        (S::LoggingOut, E::LoggedOut) => (S::LoggingIn, vec![C::Login]),

        (state, _) => (state, vec![]),
    }
}

/// Pool and logout signal of one open session
#[derive(Clone)]
struct OpenSession {
    pool: FeedWorkerPool,
    logout: Arc<Notify>,
}

/// What the control server needs to reach the running session
///
/// Each session gets its own logout signal, so a request made while no
/// session is open, or aimed at a session that already ended, is dropped.
#[derive(Clone, Default)]
pub struct SessionHandle {
    open: Arc<RwLock<Option<OpenSession>>>,
}

impl SessionHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pool of the open session, if any
    pub async fn pool(&self) -> Option<FeedWorkerPool> {
        self.open.read().await.as_ref().map(|open| open.pool.clone())
    }

    /// Ask the open session to log out; false when no session is open
    pub async fn request_logout(&self) -> bool {
        match self.open.read().await.as_ref() {
            Some(open) => {
                open.logout.notify_one();
                true
            }
            None => false,
        }
    }

    async fn set_open(&self, pool: FeedWorkerPool, logout: Arc<Notify>) {
        *self.open.write().await = Some(OpenSession { pool, logout });
    }

    async fn close(&self) {
        *self.open.write().await = None;
    }
}

struct ActiveSession {
    session: SessionId,
    pool: FeedWorkerPool,
    logout: Arc<Notify>,
    stop_tx: watch::Sender<bool>,
    housekeeping: JoinHandle<HousekeepingExit>,
}

/// Drives the session state machine
pub struct SessionRunner {
    config: Config,
    manager: Arc<dyn PullerManager>,
    fetcher: Arc<dyn FeedFetcher>,
    clock: Arc<dyn Clock>,
    cache: StatCache,
    handle: SessionHandle,
    state: PullerState,
    active: Option<ActiveSession>,
    /// Session that ended but was not logged out yet
    closing: Option<SessionId>,
}

impl SessionRunner {
    pub fn new(
        config: Config,
        manager: Arc<dyn PullerManager>,
        fetcher: Arc<dyn FeedFetcher>,
        clock: Arc<dyn Clock>,
        handle: SessionHandle,
    ) -> Self {
        let cache = StatCache::new(&config.saving_feed_stat.cache_file);
        Self {
            config,
            manager,
            fetcher,
            clock,
            cache,
            handle,
            state: PullerState::LoggingIn,
            active: None,
            closing: None,
        }
    }

    pub fn state(&self) -> PullerState {
        self.state
    }

    /// Run until `shutdown` is raised
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut commands = VecDeque::from([SessionCommand::Login]);

        loop {
            let event = match commands.pop_front() {
                Some(SessionCommand::Exit) => {
                    info!("Session runner finished");
                    return Ok(());
                }
                Some(command) => self.execute(command, &mut shutdown).await?,
                None => Some(self.wait_event(&mut shutdown).await),
            };

            if let Some(event) = event {
                let (next, more) = transition(self.state, event.clone());
                debug!(from = ?self.state, to = ?next, event = ?event, "Session transition");
                if next == PullerState::Stopped && self.state != PullerState::Stopped {
                    commands.clear();
                }
                self.state = next;
                commands.extend(more);
            }
        }
    }

    async fn execute(
        &mut self,
        command: SessionCommand,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<Option<SessionEvent>> {
        match command {
            SessionCommand::Login => match self.manager.login().await {
                Ok(session) => {
                    info!(session = %session, "Logged in");
                    Ok(Some(SessionEvent::LoggedIn(session)))
                }
                Err(e) => {
                    metrics::record_upstream_failure("login");
                    warn!(error = %e, "Login failed");
                    Ok(Some(SessionEvent::LoginFailed))
                }
            },
            SessionCommand::WaitBeforeLogin => {
                let wait = Duration::from_secs(self.config.manager.login_retry_secs.max(1));
                if *shutdown.borrow() {
                    return Ok(Some(SessionEvent::Shutdown));
                }
                tokio::select! {
                    _ = tokio::time::sleep(wait) => Ok(None),
                    _ = shutdown.changed() => Ok(Some(SessionEvent::Shutdown)),
                }
            }
            SessionCommand::StartPool(session) => {
                self.start_pool(session).await?;
                Ok(None)
            }
            SessionCommand::StopPool => {
                self.stop_pool().await;
                Ok(None)
            }
            SessionCommand::PersistStats => {
                if let Some(pool) = self.handle.pool().await {
                    let stats = pool.tables().read().await.stats.clone();
                    if let Err(e) = self.cache.save(&stats) {
                        error!(error = %e, "Failed to persist feed statistics");
                    }
                }
                self.handle.close().await;
                Ok(None)
            }
            SessionCommand::Logout => {
                if let Some(session) = self.closing.take() {
                    match self.manager.logout(&session).await {
                        Ok(()) => info!(session = %session, "Logged out"),
                        Err(e) => warn!(session = %session, error = %e, "Logout failed"),
                    }
                }
                Ok(Some(SessionEvent::LoggedOut))
            }
            SessionCommand::Exit => Ok(None),
        }
    }

    async fn start_pool(&mut self, session: SessionId) -> Result<()> {
        let pool = FeedWorkerPool::new(&self.config, Arc::clone(&self.fetcher), Arc::clone(&self.clock));
        pool.set_session(Some(session.clone())).await;

        match self.cache.load(self.config.saving_feed_stat.retained_days) {
            Ok(stats) => pool.restore_stats(stats).await,
            Err(e) => error!(error = %e, "Failed to load cached feed statistics"),
        }

        let housekeeping = Housekeeping::new(
            &self.config,
            pool.clone(),
            Arc::clone(&self.manager),
            self.cache.clone(),
        )?;
        let (stop_tx, stop_rx) = watch::channel(false);
        let logout = Arc::new(Notify::new());
        let task = tokio::spawn(housekeeping.run(stop_rx, Arc::clone(&logout)));

        pool.start().await;
        self.handle.set_open(pool.clone(), Arc::clone(&logout)).await;
        self.active = Some(ActiveSession {
            session,
            pool,
            logout,
            stop_tx,
            housekeeping: task,
        });
        Ok(())
    }

    async fn stop_pool(&mut self) {
        let Some(active) = self.active.take() else {
            return;
        };

        active.pool.stop().await;
        active.stop_tx.send_replace(true);
        match active.housekeeping.await {
            Ok(exit) => debug!(?exit, "Housekeeping finished"),
            Err(e) => error!(error = %e, "Housekeeping task failed"),
        }
        self.closing = Some(active.session);
    }

    async fn wait_event(&mut self, shutdown: &mut watch::Receiver<bool>) -> SessionEvent {
        if *shutdown.borrow() {
            return SessionEvent::Shutdown;
        }
        let logout = self.active.as_ref().map(|active| Arc::clone(&active.logout));
        let requested = async move {
            match logout {
                Some(logout) => logout.notified().await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            _ = requested => SessionEvent::LogoutRequested,
            result = shutdown.changed() => {
                if result.is_err() {
                    warn!("Shutdown channel closed");
                }
                SessionEvent::Shutdown
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_login_then_pull() {
        let (state, commands) =
            transition(PullerState::LoggingIn, SessionEvent::LoggedIn(SessionId("a".into())));
        assert_eq!(state, PullerState::Pulling);
        assert_eq!(commands, vec![SessionCommand::StartPool(SessionId("a".into()))]);
    }

    #[test]
    fn test_login_failure_retries() {
        let (state, commands) = transition(PullerState::LoggingIn, SessionEvent::LoginFailed);
        assert_eq!(state, PullerState::LoggingIn);
        assert_eq!(
            commands,
            vec![SessionCommand::WaitBeforeLogin, SessionCommand::Login]
        );
    }

    #[test]
    fn test_logout_cycle() {
        let (state, commands) = transition(PullerState::Pulling, SessionEvent::LogoutRequested);
        assert_eq!(state, PullerState::LoggingOut);
        assert_eq!(
            commands,
            vec![
                SessionCommand::StopPool,
                SessionCommand::PersistStats,
                SessionCommand::Logout
            ]
        );

        let (state, commands) = transition(state, SessionEvent::LoggedOut);
        assert_eq!(state, PullerState::LoggingIn);
        assert_eq!(commands, vec![SessionCommand::Login]);
    }

    #[test]
    fn test_shutdown_while_pulling() {
        let (state, commands) = transition(PullerState::Pulling, SessionEvent::Shutdown);
        assert_eq!(state, PullerState::Stopped);
        assert_eq!(commands.last(), Some(&SessionCommand::Exit));
        assert!(commands.contains(&SessionCommand::PersistStats));
    }

    #[test]
    fn test_shutdown_elsewhere_exits() {
        for state in [PullerState::LoggingIn, PullerState::LoggingOut] {
            assert_eq!(
                transition(state, SessionEvent::Shutdown),
                (PullerState::Stopped, vec![SessionCommand::Exit])
            );
        }
    }

    #[test]
    fn test_ignored_events() {
        assert_eq!(
            transition(PullerState::Pulling, SessionEvent::LoggedOut),
            (PullerState::Pulling, vec![])
        );
        assert_eq!(
            transition(PullerState::Stopped, SessionEvent::LogoutRequested),
            (PullerState::Stopped, vec![])
        );
    }
}
