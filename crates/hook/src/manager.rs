#![forbid(unsafe_code)]

use crate::error::Error;
use crate::session::{SessionBuilder, SessionHandle};
use crate::supervisor::{Service, ServiceExit, ServiceToken, Supervisor};
use crate::watcher::ProcessEvents;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

struct Entry {
    token: ServiceToken,
    handle: Arc<SessionHandle>,
}

/// Live sessions by process id. Shared between the [`Manager`] and callers
/// of [`SessionTable::send_request`].
#[derive(Clone, Default)]
pub struct SessionTable {
    inner: Arc<Mutex<HashMap<u32, Entry>>>,
}

impl SessionTable {
    pub fn get(&self, id: u32) -> Option<Arc<SessionHandle>> {
        self.lock().get(&id).map(|entry| entry.handle.clone())
    }

    pub fn contains(&self, id: u32) -> bool {
        self.lock().contains_key(&id)
    }

    pub fn ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.lock().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forward `request` to the session of process `id`.
    pub async fn send_request(&self, id: u32, request: &[u8]) -> Result<Bytes, Error> {
        let handle = self.get(id).ok_or(Error::SessionNotFound(id))?;
        handle.send_request(request).await
    }

    fn insert(&self, id: u32, entry: Entry) {
        self.lock().insert(id, entry);
    }

    fn remove(&self, id: u32) -> Option<Entry> {
        self.lock().remove(&id)
    }

    fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u32, Entry>> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl std::fmt::Debug for SessionTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionTable")
            .field("ids", &self.ids())
            .finish()
    }
}

/// Starts a session for every process the watcher reports and tears it down
/// when the process goes away.
pub struct Manager {
    builder: SessionBuilder,
    sessions: Arc<Supervisor>,
    table: SessionTable,
    events: ProcessEvents,
    session_up: mpsc::Sender<Arc<SessionHandle>>,
    session_down: mpsc::Sender<u32>,
}

impl Manager {
    /// Sessions are started under `sessions`; `session_up` and
    /// `session_down` announce them.
    pub fn new(
        builder: SessionBuilder,
        sessions: Arc<Supervisor>,
        table: SessionTable,
        events: ProcessEvents,
        session_up: mpsc::Sender<Arc<SessionHandle>>,
        session_down: mpsc::Sender<u32>,
    ) -> Self {
        Self {
            builder,
            sessions,
            table,
            events,
            session_up,
            session_down,
        }
    }

    async fn on_added(&mut self, pid: u32) {
        if self.table.contains(pid) {
            warn!(pid, "Session already running, ignoring duplicate add");
            return;
        }

        let (session, handle) = match self.builder.build(pid).await {
            Ok(built) => built,
            Err(err) => {
                error!(pid, %err, "Failed to start session");
                return;
            }
        };

        let token = self.sessions.add(session);
        self.table.insert(
            pid,
            Entry {
                token,
                handle: handle.clone(),
            },
        );
        info!(pid, "Session up");
        if self.session_up.send(handle).await.is_err() {
            trace!(pid, "no listener for session up");
        }
    }

    async fn on_removed(&mut self, pid: u32) {
        let Some(entry) = self.table.remove(pid) else {
            debug!(pid, "No session for removed process");
            return;
        };

        if let Err(err) = self.sessions.remove(entry.token).await {
            debug!(pid, %err, "Session had already exited");
        }
        info!(pid, "Session down");
        if self.session_down.send(pid).await.is_err() {
            trace!(pid, "no listener for session down");
        }
    }
}

#[async_trait]
impl Service for Manager {
    fn name(&self) -> String {
        "manager".to_string()
    }

    async fn serve(&mut self, cancel: CancellationToken) -> ServiceExit {
        info!("Running");
        let exit = loop {
            tokio::select! {
                _ = cancel.cancelled() => break ServiceExit::Stopped,
                added = self.events.added.recv() => match added {
                    Some(pid) => tokio::select! {
                        _ = cancel.cancelled() => break ServiceExit::Stopped,
                        _ = self.on_added(pid) => {}
                    },
                    None => break ServiceExit::Complete,
                },
                removed = self.events.removed.recv() => match removed {
                    Some(pid) => tokio::select! {
                        _ = cancel.cancelled() => break ServiceExit::Stopped,
                        _ = self.on_removed(pid) => {}
                    },
                    None => break ServiceExit::Complete,
                },
            }
        };
        self.table.clear();
        info!("Stopping...");
        exit
    }
}

impl std::fmt::Debug for Manager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager")
            .field("table", &self.table)
            .field("sessions", &self.sessions)
            .finish_non_exhaustive()
    }
}
