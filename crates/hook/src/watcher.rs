#![forbid(unsafe_code)]

use crate::platform::ProcessEnumerator;
use crate::supervisor::{Service, ServiceExit};
use async_trait::async_trait;
use config::HookConfig;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Receiving ends of the watcher's add and remove queues.
#[derive(Debug)]
pub struct ProcessEvents {
    pub added: mpsc::Receiver<u32>,
    pub removed: mpsc::Receiver<u32>,
}

/// Polls the process list and reports matching processes as they appear and
/// disappear.
pub struct ProcessWatcher {
    process_name: String,
    scan_interval: Duration,
    enumerator: Arc<dyn ProcessEnumerator>,
    added_tx: mpsc::Sender<u32>,
    removed_tx: mpsc::Sender<u32>,
    known: HashSet<u32>,
}

impl ProcessWatcher {
    pub fn new(config: &HookConfig, enumerator: Arc<dyn ProcessEnumerator>) -> (Self, ProcessEvents) {
        let (added_tx, added) = mpsc::channel(config.event_buffer);
        let (removed_tx, removed) = mpsc::channel(config.event_buffer);
        let watcher = Self {
            process_name: config.process_name.to_lowercase(),
            scan_interval: config.scan_interval,
            enumerator,
            added_tx,
            removed_tx,
            known: HashSet::new(),
        };
        (watcher, ProcessEvents { added, removed })
    }

    /// Ids of the matching processes seen by the last poll.
    pub fn known(&self) -> &HashSet<u32> {
        &self.known
    }

    /// Take one snapshot and emit the difference against the previous one.
    ///
    /// Blocks while an event queue is full. A failed enumeration keeps the
    /// previous snapshot.
    pub async fn poll(&mut self) {
        let enumerator = self.enumerator.clone();
        let join = tokio::task::spawn_blocking(move || enumerator.enumerate_processes()).await;
        let processes = match join {
            Ok(Ok(processes)) => processes,
            Ok(Err(err)) => {
                warn!(?err, "Nonfatal error enumerating processes");
                return;
            }
            Err(err) => {
                warn!(%err, "Process enumeration task failed");
                return;
            }
        };

        let matching: HashSet<u32> = processes
            .into_iter()
            .filter(|(_, name)| name.to_lowercase().contains(&self.process_name))
            .map(|(pid, _)| pid)
            .collect();

        for &pid in matching.difference(&self.known) {
            debug!(pid, "process appeared");
            if self.added_tx.send(pid).await.is_err() {
                debug!(pid, "no listener for process add events");
            }
        }
        for &pid in self.known.difference(&matching) {
            debug!(pid, "process disappeared");
            if self.removed_tx.send(pid).await.is_err() {
                debug!(pid, "no listener for process remove events");
            }
        }

        self.known = matching;
    }
}

#[async_trait]
impl Service for ProcessWatcher {
    fn name(&self) -> String {
        "process-watcher".to_string()
    }

    async fn serve(&mut self, cancel: CancellationToken) -> ServiceExit {
        info!(process_name = %self.process_name, "Running");
        let mut ticker = tokio::time::interval_at(
            tokio::time::Instant::now() + self.scan_interval,
            self.scan_interval,
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.poll() => {}
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
        }

        info!("Stopping...");
        ServiceExit::Stopped
    }
}

impl std::fmt::Debug for ProcessWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessWatcher")
            .field("process_name", &self.process_name)
            .field("scan_interval", &self.scan_interval)
            .field("known", &self.known)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use proptest::prelude::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeEnumerator {
        snapshot: Mutex<HashMap<u32, String>>,
        fail: Mutex<bool>,
    }

    impl FakeEnumerator {
        fn set(&self, pids: &[u32]) {
            *self.snapshot.lock().unwrap() = pids
                .iter()
                .map(|&pid| (pid, format!("FooGame{pid}.exe")))
                .collect();
        }
    }

    impl ProcessEnumerator for FakeEnumerator {
        fn enumerate_processes(&self) -> Result<HashMap<u32, String>, Error> {
            if *self.fail.lock().unwrap() {
                return Err(Error::Enumerate("snapshot failed".into()));
            }
            Ok(self.snapshot.lock().unwrap().clone())
        }
    }

    fn config() -> HookConfig {
        HookConfig {
            process_name: "foogame".to_string(),
            event_buffer: 64,
            scan_interval: Duration::from_millis(100),
            ..HookConfig::default()
        }
    }

    fn drain(rx: &mut mpsc::Receiver<u32>) -> Vec<u32> {
        let mut out = Vec::new();
        while let Ok(pid) = rx.try_recv() {
            out.push(pid);
        }
        out.sort_unstable();
        out
    }

    #[tokio::test]
    async fn emits_the_difference_between_snapshots() {
        let enumerator = Arc::new(FakeEnumerator::default());
        let (mut watcher, mut events) = ProcessWatcher::new(&config(), enumerator.clone());

        enumerator.set(&[1, 2, 3]);
        watcher.poll().await;
        assert_eq!(drain(&mut events.added), vec![1, 2, 3]);
        assert!(drain(&mut events.removed).is_empty());

        enumerator.set(&[1, 2, 4]);
        watcher.poll().await;
        assert_eq!(drain(&mut events.added), vec![4]);
        assert_eq!(drain(&mut events.removed), vec![3]);

        watcher.poll().await;
        assert!(drain(&mut events.added).is_empty());
        assert!(drain(&mut events.removed).is_empty());
    }

    #[tokio::test]
    async fn matches_names_case_insensitively() {
        let enumerator = Arc::new(FakeEnumerator::default());
        *enumerator.snapshot.lock().unwrap() = HashMap::from([
            (10, "FOOGAME.EXE".to_string()),
            (11, "launcher.exe".to_string()),
            (12, "x-FooGame-dx11".to_string()),
        ]);
        let (mut watcher, mut events) = ProcessWatcher::new(&config(), enumerator);

        watcher.poll().await;
        assert_eq!(drain(&mut events.added), vec![10, 12]);
    }

    #[tokio::test]
    async fn enumeration_failure_keeps_the_snapshot() {
        let enumerator = Arc::new(FakeEnumerator::default());
        let (mut watcher, mut events) = ProcessWatcher::new(&config(), enumerator.clone());

        enumerator.set(&[5]);
        watcher.poll().await;
        assert_eq!(drain(&mut events.added), vec![5]);

        *enumerator.fail.lock().unwrap() = true;
        watcher.poll().await;
        assert!(drain(&mut events.removed).is_empty());
        assert!(watcher.known().contains(&5));
    }

    #[tokio::test(start_paused = true)]
    async fn polls_immediately_then_on_the_timer() {
        let enumerator = Arc::new(FakeEnumerator::default());
        enumerator.set(&[7]);
        let (watcher, mut events) = ProcessWatcher::new(&config(), enumerator.clone());

        let cancel = CancellationToken::new();
        let task = tokio::spawn({
            let cancel = cancel.clone();
            let mut watcher = watcher;
            async move { watcher.serve(cancel).await }
        });

        assert_eq!(events.added.recv().await, Some(7));

        enumerator.set(&[8]);
        assert_eq!(events.added.recv().await, Some(8));
        assert_eq!(events.removed.recv().await, Some(7));

        cancel.cancel();
        assert_eq!(task.await.unwrap(), ServiceExit::Stopped);
    }

    /// Enumerates only once the test releases it.
    struct Gated {
        release: Mutex<std::sync::mpsc::Receiver<()>>,
    }

    impl ProcessEnumerator for Gated {
        fn enumerate_processes(&self) -> Result<HashMap<u32, String>, Error> {
            self.release
                .lock()
                .unwrap()
                .recv_timeout(Duration::from_secs(5))
                .map_err(|err| Error::Enumerate(err.to_string()))?;
            Ok(HashMap::from([(3, "foogame".to_string())]))
        }
    }

    #[tokio::test]
    async fn enumeration_runs_off_the_runtime_thread() {
        let (release, gate) = std::sync::mpsc::channel();
        let enumerator = Arc::new(Gated {
            release: Mutex::new(gate),
        });
        let (mut watcher, mut events) = ProcessWatcher::new(&config(), enumerator);

        let poll = tokio::spawn(async move {
            watcher.poll().await;
            watcher
        });
        // The poll task gets the only runtime thread here; it must not hold
        // it while enumerating.
        tokio::task::yield_now().await;
        release.send(()).unwrap();

        let watcher = poll.await.unwrap();
        assert!(watcher.known().contains(&3));
        assert_eq!(drain(&mut events.added), vec![3]);
    }

    #[tokio::test]
    async fn full_queue_does_not_block_stop() {
        let enumerator = Arc::new(FakeEnumerator::default());
        enumerator.set(&[1, 2, 3]);
        let config = HookConfig {
            event_buffer: 1,
            ..config()
        };
        let (mut watcher, _events) = ProcessWatcher::new(&config, enumerator);

        let cancel = CancellationToken::new();
        cancel.cancel();
        assert_eq!(watcher.serve(cancel).await, ServiceExit::Stopped);
    }

    proptest! {
        #[test]
        fn events_follow_set_difference(
            before in proptest::collection::hash_set(1u32..40, 0..20),
            after in proptest::collection::hash_set(1u32..40, 0..20),
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
            runtime.block_on(async {
                let enumerator = Arc::new(FakeEnumerator::default());
                let (mut watcher, mut events) = ProcessWatcher::new(&config(), enumerator.clone());

                enumerator.set(&before.iter().copied().collect::<Vec<_>>());
                watcher.poll().await;
                drain(&mut events.added);

                enumerator.set(&after.iter().copied().collect::<Vec<_>>());
                watcher.poll().await;

                let mut expected_added: Vec<u32> = after.difference(&before).copied().collect();
                let mut expected_removed: Vec<u32> = before.difference(&after).copied().collect();
                expected_added.sort_unstable();
                expected_removed.sort_unstable();
                assert_eq!(drain(&mut events.added), expected_added);
                assert_eq!(drain(&mut events.removed), expected_removed);
            });
        }
    }
}
