//! Terminal session manager
//!
//! Maps client uuids to pty-backed shell sessions. The manager is the only
//! place sessions are inserted or removed: on first use of a uuid, on an
//! explicit close, and when a session's inactivity countdown fires.

pub mod countdown;
pub mod session;

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::debug;

use crate::config::Config;
use crate::error::{AgentError, Result};
use crate::state::{new_state, Shared, SharedRw};
use crate::transport::SharedPublisher;

pub use countdown::Countdown;
pub use session::{SessionSettings, TerminalSession};

/// Countdown resolution: one configured timeout unit
pub const TICK: Duration = Duration::from_secs(1);

#[derive(Clone)]
pub struct TerminalManager {
    sessions: Shared<HashMap<String, Arc<TerminalSession>>>,
    publisher: SharedPublisher,
    config: SharedRw<Config>,
    tick: Duration,
}

impl TerminalManager {
    /// `publisher` receives output on the logical `term/<uuid>` topics.
    pub fn new(publisher: SharedPublisher, config: SharedRw<Config>, tick: Duration) -> Self {
        Self {
            sessions: new_state(HashMap::new()),
            publisher,
            config,
            tick,
        }
    }

    fn settings(&self) -> SessionSettings {
        let config = self.config.read();
        SessionSettings {
            shell: config.terminal.shell.clone(),
            timeout_ticks: config.terminal.session_timeout,
            tick: self.tick,
        }
    }

    /// Returns the uuid's session, starting one if none exists.
    pub fn open(&self, uuid: &str) -> Result<Arc<TerminalSession>> {
        if let Some(existing) = self.sessions.lock().get(uuid) {
            return Ok(existing.clone());
        }

        let (session, done) = TerminalSession::start(uuid, &self.settings(), self.publisher.clone())?;

        let mut sessions = self.sessions.lock();
        if let Some(existing) = sessions.get(uuid) {
            // lost a race with a concurrent open; ours is dropped and released
            return Ok(existing.clone());
        }
        sessions.insert(uuid.to_string(), session.clone());
        drop(sessions);

        self.watch(uuid.to_string(), Arc::downgrade(&session), done);
        debug!("Opened terminal session {}", uuid);
        Ok(session)
    }

    /// Writes input to the uuid's session, opening it first if needed.
    pub async fn send(&self, uuid: &str, input: Vec<u8>) -> Result<()> {
        let session = self.open(uuid)?;
        session.send(input).await
    }

    /// Removes and releases the uuid's session.
    pub fn close(&self, uuid: &str) -> Result<()> {
        let removed = self.sessions.lock().remove(uuid);
        match removed {
            Some(session) => {
                session.shutdown();
                debug!("Closed terminal session {}", uuid);
                Ok(())
            }
            None => Err(AgentError::NoSuchSession(uuid.to_string())),
        }
    }

    pub fn contains(&self, uuid: &str) -> bool {
        self.sessions.lock().contains_key(uuid)
    }

    pub fn active(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    fn watch(&self, uuid: String, session: Weak<TerminalSession>, done: oneshot::Receiver<()>) {
        let manager = self.clone();
        tokio::spawn(async move {
            // Err means the ticker was aborted by an explicit close
            if done.await.is_ok() {
                debug!("Terminal session {} inactive, closing", uuid);
                manager.expire(&uuid, &session);
            }
        });
    }

    fn expire(&self, uuid: &str, expired: &Weak<TerminalSession>) {
        let mut sessions = self.sessions.lock();
        let is_same = match (sessions.get(uuid), expired.upgrade()) {
            (Some(current), Some(expired)) => Arc::ptr_eq(current, &expired),
            _ => false,
        };
        let removed = if is_same { sessions.remove(uuid) } else { None };
        drop(sessions);

        if let Some(session) = removed {
            session.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::senml;
    use crate::state::new_rw_state;
    use crate::transport::testing::Recorder;

    fn manager(timeout: u64, shell: &str) -> (TerminalManager, Arc<Recorder>) {
        let mut config = Config::default();
        config.terminal.session_timeout = timeout;
        config.terminal.shell = shell.to_string();
        let recorder = Arc::new(Recorder::default());
        let manager = TerminalManager::new(
            recorder.clone(),
            new_rw_state(config),
            Duration::from_millis(50),
        );
        (manager, recorder)
    }

    async fn wait_until(mut check: impl FnMut() -> bool) -> bool {
        for _ in 0..100 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    #[tokio::test]
    async fn second_open_reuses_session() {
        let (manager, _) = manager(100, "sh");
        let first = manager.open("u1").unwrap();
        let second = manager.open("u1").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(manager.active(), vec!["u1".to_string()]);
        manager.close("u1").unwrap();
    }

    #[tokio::test]
    async fn input_produces_output_on_session_topic() {
        let (manager, recorder) = manager(100, "sh");
        manager.send("u2", b"echo gateway-$((40+2))\n".to_vec()).await.unwrap();

        let seen = wait_until(|| {
            recorder.on_topic("term/u2").iter().any(|payload| {
                senml::decode(payload)
                    .map(|records| {
                        records
                            .iter()
                            .any(|r| r.string_value.as_deref().unwrap_or_default().contains("gateway-42"))
                    })
                    .unwrap_or(false)
            })
        })
        .await;
        assert!(seen);
        manager.close("u2").unwrap();
    }

    #[tokio::test]
    async fn idle_session_expires_and_is_removed() {
        let (manager, _) = manager(2, "sh");
        manager.open("u3").unwrap();
        assert!(manager.contains("u3"));
        assert!(wait_until(|| !manager.contains("u3")).await);
    }

    #[tokio::test]
    async fn close_unknown_session_is_not_found() {
        let (manager, _) = manager(5, "sh");
        assert!(matches!(manager.close("nope"), Err(AgentError::NoSuchSession(_))));
    }

    #[tokio::test]
    async fn spawn_failure_inserts_nothing() {
        let (manager, _) = manager(5, "/nonexistent/shell-binary");
        assert!(manager.open("u4").is_err());
        assert!(!manager.contains("u4"));
    }
}
