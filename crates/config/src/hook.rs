use serde::{Deserialize, Serialize};
use serde_with::serde_as;
use std::path::PathBuf;
use std::time::Duration;

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HookConfig {
    /// Whether the hook adapter runs at all. When disabled, no processes are
    /// watched and no agent is ever injected.
    pub enabled: bool,

    /// Path of the agent payload on the local disk. The file must exist at
    /// the time a matching process is discovered, otherwise the process is
    /// not tracked.
    pub payload_path: PathBuf,

    /// Case-insensitive substring matched against the names of running
    /// processes. Every process whose name contains it gets its own session.
    pub process_name: String,

    /// Prefix of the per-process channel name. The agent listens on
    /// `{channel_prefix}-{pid}`.
    pub channel_prefix: String,

    /// How long to wait between attempts to open the channel after the agent
    /// has been injected. **Measured in milliseconds**.
    #[serde_as(as = "serde_with::DurationMilliSeconds<u64>")]
    pub dial_retry_interval: Duration,

    /// Number of attempts made to open the channel before the session is
    /// abandoned.
    pub dial_attempts: u32,

    /// Timeout handed to the platform for a single channel open attempt.
    /// **Measured in milliseconds**.
    #[serde_as(as = "serde_with::DurationMilliSeconds<u64>")]
    pub dial_timeout: Duration,

    /// Interval between liveness pings sent to the agent. **Measured in
    /// milliseconds**.
    #[serde_as(as = "serde_with::DurationMilliSeconds<u64>")]
    pub ping_interval: Duration,

    /// Delay before the agent is primed for ingress and egress delivery once
    /// a session is up. **Measured in milliseconds**.
    #[serde_as(as = "serde_with::DurationMilliSeconds<u64>")]
    pub handshake_delay: Duration,

    /// Interval between process list polls. **Measured in milliseconds**.
    #[serde_as(as = "serde_with::DurationMilliSeconds<u64>")]
    pub scan_interval: Duration,

    /// Capacity of the process add/remove event queues.
    ///
    /// # Note
    ///
    /// A full queue stalls process discovery until the session manager
    /// catches up.
    pub event_buffer: usize,

    /// Capacity of each per-session ingress and egress block queue. A slow
    /// consumer stalls decoding once the queue is full.
    pub block_buffer: usize,
}

impl Default for HookConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            payload_path: PathBuf::from("hook.dll"),
            process_name: "ffxiv_dx11.exe".to_string(),
            channel_prefix: "xivhook".to_string(),
            dial_retry_interval: Duration::from_millis(500),
            dial_attempts: 5,
            dial_timeout: Duration::from_secs(5),
            ping_interval: Duration::from_secs(1),
            handshake_delay: Duration::from_secs(1),
            scan_interval: Duration::from_secs(1),
            event_buffer: 10,
            block_buffer: 5000,
        }
    }
}

impl HookConfig {
    /// Name of the channel the agent injected into `pid` listens on.
    pub fn channel_name(&self, pid: u32) -> String {
        format!("{}-{}", self.channel_prefix, pid)
    }
}
