#![forbid(unsafe_code)]

use crate::error::Error;
use async_trait::async_trait;
use config::SupervisorConfig;
use futures::FutureExt;
use futures::future::join_all;
use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, warn};

/// How a service run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceExit {
    /// The service observed its cancellation token.
    Stopped,
    /// The service finished on its own and expects no restart, e.g. its peer
    /// closed the connection.
    Complete,
    /// The service crashed. The supervisor may run it again.
    Failed(String),
}

/// A long running unit of work owned by a [`Supervisor`].
#[async_trait]
pub trait Service: Send + 'static {
    fn name(&self) -> String;

    /// Run until `cancel` fires or the service ends on its own. Must release
    /// everything it holds before returning.
    async fn serve(&mut self, cancel: CancellationToken) -> ServiceExit;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceToken(u64);

#[derive(Debug, Clone, Copy)]
pub struct RestartPolicy {
    pub failure_threshold: u32,
    pub failure_backoff: Duration,
}

impl From<&SupervisorConfig> for RestartPolicy {
    fn from(config: &SupervisorConfig) -> Self {
        Self {
            failure_threshold: config.failure_threshold,
            failure_backoff: config.failure_backoff,
        }
    }
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self::from(&SupervisorConfig::default())
    }
}

struct Child {
    name: String,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Owns a set of services, each on its own task and cancellation token.
///
/// Stopping or removing a child waits for its task to exit, so callers never
/// see a half-stopped service. A child that exits on its own drops out of the
/// set.
pub struct Supervisor {
    name: String,
    policy: RestartPolicy,
    cancel: CancellationToken,
    next_token: AtomicU64,
    children: Arc<Mutex<HashMap<ServiceToken, Child>>>,
}

impl Supervisor {
    pub fn new(name: impl Into<String>, policy: RestartPolicy) -> Self {
        Self {
            name: name.into(),
            policy,
            cancel: CancellationToken::new(),
            next_token: AtomicU64::new(0),
            children: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Start `service` under this supervisor. Must be called from within a
    /// tokio runtime. The child runs in the caller's current span.
    pub fn add<S: Service>(&self, service: S) -> ServiceToken {
        self.add_boxed(Box::new(service))
    }

    pub fn add_boxed(&self, service: Box<dyn Service>) -> ServiceToken {
        let token = ServiceToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        let name = service.name();
        let cancel = self.cancel.child_token();
        // Held across the spawn so a child that exits at once still finds
        // its own entry to remove.
        let mut children = self.lock_children();
        let handle = tokio::spawn(
            run_child(
                self.name.clone(),
                service,
                cancel.clone(),
                self.policy,
                Reaper {
                    token,
                    children: Arc::downgrade(&self.children),
                },
            )
            .in_current_span(),
        );
        debug!(supervisor = %self.name, service = %name, "service added");
        children.insert(
            token,
            Child {
                name,
                cancel,
                handle,
            },
        );
        token
    }

    /// Stop one child and wait for it to exit.
    pub async fn remove(&self, token: ServiceToken) -> Result<(), Error> {
        let child = self
            .lock_children()
            .remove(&token)
            .ok_or(Error::UnknownService(token))?;
        Self::stop_child(&self.name, child).await;
        Ok(())
    }

    /// Stop every child and wait for all of them to exit.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let children: Vec<Child> = self.lock_children().drain().map(|(_, c)| c).collect();
        join_all(
            children
                .into_iter()
                .map(|child| Self::stop_child(&self.name, child)),
        )
        .await;
    }

    pub fn len(&self) -> usize {
        self.lock_children().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    async fn stop_child(supervisor: &str, child: Child) {
        child.cancel.cancel();
        if let Err(err) = child.handle.await {
            warn!(supervisor, service = %child.name, ?err, "service task did not exit cleanly");
        }
    }

    fn lock_children(&self) -> MutexGuard<'_, HashMap<ServiceToken, Child>> {
        lock(&self.children)
    }
}

fn lock(children: &Mutex<HashMap<ServiceToken, Child>>) -> MutexGuard<'_, HashMap<ServiceToken, Child>> {
    match children.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Drops a child's entry once its task is done with the service.
struct Reaper {
    token: ServiceToken,
    children: Weak<Mutex<HashMap<ServiceToken, Child>>>,
}

impl Reaper {
    fn reap(self) {
        if let Some(children) = self.children.upgrade() {
            lock(&children).remove(&self.token);
        }
    }
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("name", &self.name)
            .field("children", &self.len())
            .field("policy", &self.policy)
            .finish()
    }
}

/// A shared supervisor runs as a child of another supervisor, which makes
/// trees of supervisors.
#[async_trait]
impl Service for Arc<Supervisor> {
    fn name(&self) -> String {
        self.name.clone()
    }

    async fn serve(&mut self, cancel: CancellationToken) -> ServiceExit {
        cancel.cancelled().await;
        self.stop().await;
        ServiceExit::Stopped
    }
}

async fn run_child(
    supervisor: String,
    service: Box<dyn Service>,
    cancel: CancellationToken,
    policy: RestartPolicy,
    reaper: Reaper,
) {
    supervise(&supervisor, service, &cancel, policy).await;
    reaper.reap();
}

async fn supervise(
    supervisor: &str,
    mut service: Box<dyn Service>,
    cancel: &CancellationToken,
    policy: RestartPolicy,
) {
    let name = service.name();
    let mut failures = 0u32;

    loop {
        let exit = AssertUnwindSafe(service.serve(cancel.clone()))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| ServiceExit::Failed(panic_message(panic.as_ref())));

        match exit {
            ServiceExit::Stopped => {
                debug!(supervisor, service = %name, "service stopped");
                return;
            }
            ServiceExit::Complete => {
                info!(supervisor, service = %name, "service completed");
                return;
            }
            ServiceExit::Failed(reason) => {
                if cancel.is_cancelled() {
                    return;
                }
                failures += 1;
                if failures > policy.failure_threshold {
                    error!(
                        supervisor,
                        service = %name,
                        %reason,
                        failures,
                        "service exceeded failure threshold, not restarting"
                    );
                    return;
                }
                warn!(supervisor, service = %name, %reason, failures, "service failed, restarting");
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(policy.failure_backoff) => {}
                }
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("panicked: {message}")
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("panicked: {message}")
    } else {
        "panicked".to_string()
    }
}
