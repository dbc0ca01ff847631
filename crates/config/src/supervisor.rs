use serde::{Deserialize, Serialize};
use serde_with::serde_as;
use std::time::Duration;

#[serde_as]
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SupervisorConfig {
    /// How many times a crashed service is restarted before the supervisor
    /// gives up on it. Services that end on their own are never restarted.
    pub failure_threshold: u32,

    /// Delay before a crashed service is restarted. **Measured in
    /// milliseconds**.
    #[serde_as(as = "serde_with::DurationMilliSeconds<u64>")]
    pub failure_backoff: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_backoff: Duration::from_secs(1),
        }
    }
}
