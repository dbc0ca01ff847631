#![forbid(unsafe_code)]

use crate::error::Error;
use crate::platform::ProcessEnumerator;
use std::collections::HashMap;
use tracing::trace;

/// Lists processes by command name from `/proc/<pid>/stat`.
#[derive(Debug, Default)]
pub struct ProcfsEnumerator;

impl ProcessEnumerator for ProcfsEnumerator {
    fn enumerate_processes(&self) -> Result<HashMap<u32, String>, Error> {
        let mut processes = HashMap::new();

        for process in procfs::process::all_processes()? {
            let process = match process {
                Ok(p) => p,
                Err(err) => {
                    trace!(?err, "failed to read process entry");
                    continue;
                }
            };
            let pid = process.pid as u32;
            match process.stat() {
                Ok(stat) => {
                    processes.insert(pid, stat.comm);
                }
                // Processes routinely exit between listing and reading.
                Err(err) => trace!(pid, ?err, "failed to read process stat"),
            }
        }

        Ok(processes)
    }
}
