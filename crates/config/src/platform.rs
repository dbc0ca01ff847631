use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PlatformConfig {
    /// Directory holding the per-process channel sockets. The channel named
    /// `xivhook-1234` is expected at `{socket_dir}/xivhook-1234.sock`.
    pub socket_dir: PathBuf,

    /// External helper that loads the payload into a running process. It is
    /// invoked as `<injector_command> <pid> <payload_path>` and must exit with
    /// 0 on success and 3 when the payload is already loaded.
    ///
    /// # Note
    ///
    /// When unset, the agent is assumed to be loaded by other means and every
    /// process is treated as already injected.
    pub injector_command: Option<PathBuf>,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            socket_dir: std::env::temp_dir(),
            injector_command: None,
        }
    }
}
