//! One pty-backed shell session
//!
//! The session owns the pty master, the shell process and two tasks: the output
//! copier (pty -> measurement record -> publish) and the countdown ticker. It
//! only signals expiry; releasing it is up to the manager.

use parking_lot::Mutex;
use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize};
use std::io::{ErrorKind, Read, Write};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error};

use super::countdown::Countdown;
use crate::error::{AgentError, Result};
use crate::senml;
use crate::transport::{terminal_topic, SharedPublisher};

/// Record name of terminal output chunks
pub const OUTPUT_RECORD_NAME: &str = "term";

/// Parameters a session is started with
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub shell: String,
    /// Number of ticks without output before the session expires
    pub timeout_ticks: u64,
    pub tick: Duration,
}

pub struct TerminalSession {
    uuid: String,
    topic: String,
    countdown: Arc<Countdown>,
    writer: Arc<Mutex<Box<dyn Write + Send>>>,
    master: Mutex<Option<Box<dyn MasterPty + Send>>>,
    child: Mutex<Option<Box<dyn Child + Send + Sync>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl TerminalSession {
    /// Spawns the shell on a fresh pty and starts the copier and ticker.
    /// The receiver resolves once, when the countdown reaches zero.
    pub fn start(
        uuid: &str,
        settings: &SessionSettings,
        publisher: SharedPublisher,
    ) -> Result<(Arc<Self>, oneshot::Receiver<()>)> {
        let pair = native_pty_system()
            .openpty(PtySize::default())
            .map_err(|e| AgentError::Resource(format!("failed to open pty for {uuid}: {e}")))?;

        let child = pair
            .slave
            .spawn_command(CommandBuilder::new(&settings.shell))
            .map_err(|e| AgentError::Resource(format!("failed to spawn {}: {e}", settings.shell)))?;
        drop(pair.slave);

        let mut child = Some(child);
        let io = pair
            .master
            .try_clone_reader()
            .and_then(|reader| Ok((reader, pair.master.take_writer()?)));
        let (reader, writer) = match io {
            Ok(io) => io,
            Err(e) => {
                if let Some(mut child) = child.take() {
                    let _ = child.kill();
                }
                return Err(AgentError::Resource(format!("failed to attach pty for {uuid}: {e}")));
            }
        };

        let session = Arc::new(Self {
            uuid: uuid.to_string(),
            topic: terminal_topic(uuid),
            countdown: Arc::new(Countdown::new(settings.timeout_ticks)),
            writer: Arc::new(Mutex::new(writer)),
            master: Mutex::new(Some(pair.master)),
            child: Mutex::new(child),
            tasks: Mutex::new(Vec::new()),
        });

        let (chunk_tx, chunk_rx) = mpsc::channel::<Vec<u8>>(64);
        tokio::task::spawn_blocking(move || read_pty(reader, chunk_tx));

        let copier = {
            let uuid = session.uuid.clone();
            let topic = session.topic.clone();
            let countdown = session.countdown.clone();
            tokio::spawn(async move {
                match copy_output(chunk_rx, &uuid, &topic, &countdown, publisher).await {
                    Ok(sent) => debug!("Terminal {} output closed after {} bytes", uuid, sent),
                    Err(e) => error!("Error sending terminal {} output: {}", uuid, e),
                }
            })
        };

        let (done_tx, done_rx) = oneshot::channel();
        let ticker = {
            let countdown = session.countdown.clone();
            let tick = settings.tick;
            let uuid = session.uuid.clone();
            tokio::spawn(async move {
                run_countdown(countdown, tick, done_tx).await;
                debug!("Exiting timer routine for terminal {}", uuid);
            })
        };

        session.tasks.lock().extend([copier, ticker]);
        Ok((session, done_rx))
    }

    /// Writes input bytes to the shell. Does not extend the session.
    pub async fn send(&self, input: Vec<u8>) -> Result<()> {
        let writer = self.writer.clone();
        let written = input.len();
        tokio::task::spawn_blocking(move || {
            let mut writer = writer.lock();
            writer.write_all(&input)?;
            writer.flush()
        })
        .await
        .map_err(|e| AgentError::Resource(format!("terminal write task failed: {e}")))?
        .map_err(|e| AgentError::Resource(format!("failed to write to terminal {}: {e}", self.uuid)))?;
        debug!("Written to terminal {}: {} bytes", self.uuid, written);
        Ok(())
    }

    /// Stops the tasks, kills the shell and closes the pty. Idempotent.
    pub fn shutdown(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        if let Some(mut child) = self.child.lock().take() {
            let _ = child.kill();
            // reap off the runtime
            std::thread::spawn(move || {
                let _ = child.wait();
            });
        }
        self.master.lock().take();
    }
}

impl Drop for TerminalSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn read_pty(mut reader: Box<dyn Read + Send>, tx: mpsc::Sender<Vec<u8>>) {
    let mut buf = [0u8; 4096];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if tx.blocking_send(buf[..n].to_vec()).is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(_) => break,
        }
    }
}

/// Publishes every output chunk on the session topic. A delivered chunk resets
/// the countdown; the first encode or publish failure ends the copy.
pub async fn copy_output(
    mut chunks: mpsc::Receiver<Vec<u8>>,
    uuid: &str,
    topic: &str,
    countdown: &Countdown,
    publisher: SharedPublisher,
) -> Result<u64> {
    let mut sent = 0u64;
    while let Some(chunk) = chunks.recv().await {
        let payload = senml::encode(uuid, OUTPUT_RECORD_NAME, &String::from_utf8_lossy(&chunk))?;
        publisher.publish(topic, payload).await?;
        countdown.reset();
        sent += chunk.len() as u64;
    }
    Ok(sent)
}

/// Ticks the countdown until it expires, then fires `done` once.
pub async fn run_countdown(countdown: Arc<Countdown>, tick: Duration, done: oneshot::Sender<()>) {
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + tick, tick);
    loop {
        interval.tick().await;
        if countdown.tick() {
            let _ = done.send(());
            return;
        }
    }
}
