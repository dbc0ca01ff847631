#![forbid(unsafe_code)]

use crate::error::Error;
use crate::manager::{Manager, SessionTable};
use crate::platform::Platform;
use crate::session::{SessionBuilder, SessionHandle};
use crate::supervisor::{RestartPolicy, Supervisor};
use crate::watcher::ProcessWatcher;
use bytes::Bytes;
use config::Config;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::info;

/// Session lifecycle notifications for the consumer of decoded traffic.
#[derive(Debug)]
pub struct AdapterEvents {
    /// A session is running; subscribe to its block streams through the
    /// handle.
    pub session_up: mpsc::Receiver<Arc<SessionHandle>>,
    /// The session of this process id has fully stopped.
    pub session_down: mpsc::Receiver<u32>,
}

/// Entry point of the ingestion pipeline.
///
/// Owns the supervision tree: the process watcher, the supervisor of all
/// sessions, and the manager connecting the two.
#[derive(Debug)]
pub struct HookAdapter {
    supervisor: Supervisor,
    sessions: SessionTable,
}

impl HookAdapter {
    /// Start watching for processes. Must be called from within a tokio
    /// runtime.
    pub fn start(config: &Config, platform: Platform) -> (Self, AdapterEvents) {
        let policy = RestartPolicy::from(&config.supervisor);
        let (up_tx, session_up) = mpsc::channel(config.hook.event_buffer);
        let (down_tx, session_down) = mpsc::channel(config.hook.event_buffer);
        let adapter = Self {
            supervisor: Supervisor::new("hook", policy),
            sessions: SessionTable::default(),
        };
        let events = AdapterEvents {
            session_up,
            session_down,
        };

        if !config.hook.enabled {
            info!("Hook adapter disabled");
            return (adapter, events);
        }

        let (watcher, process_events) = ProcessWatcher::new(&config.hook, platform.enumerator);
        let sessions = Arc::new(Supervisor::new("sessions", policy));
        let manager = Manager::new(
            SessionBuilder::new(config, platform.remote),
            sessions.clone(),
            adapter.sessions.clone(),
            process_events,
            up_tx,
            down_tx,
        );

        adapter.supervisor.add(watcher);
        adapter.supervisor.add(sessions);
        adapter.supervisor.add(manager);
        info!(process_name = %config.hook.process_name, "Hook adapter started");
        (adapter, events)
    }

    /// Live sessions by process id.
    pub fn sessions(&self) -> &SessionTable {
        &self.sessions
    }

    /// Forward a request to the session of process `id`.
    pub async fn send_request(&self, id: u32, request: &[u8]) -> Result<Bytes, Error> {
        self.sessions.send_request(id, request).await
    }

    /// Stop every service and session, waiting for all of them to exit.
    pub async fn stop(&self) {
        self.supervisor.stop().await;
        info!("Hook adapter stopped");
    }
}
