//! Supervisor configuration.
//!
//! These types hold the concrete values that drive lifecycle behavior. All
//! durations are deadlines for bounded waits; expiry forces the next state
//! with a diagnostic log.
//!
//! # Defaults
//!
//! | Field | Default |
//! |-------|---------|
//! | `pause_timeout` | 500 ms |
//! | `stop_timeout` | 11 s |
//! | `destroy_timeout` | 10 s |
//! | `launch_wait_timeout` | 10 s |
//! | `user_switch_timeout` | 2 s |
//! | `min_crash_interval` | 60 s |
//! | `crash_count_limit` | 12 |
//! | `crash_count_reset_interval` | 12 h |
//! | `bound_service_max_crash_retry` | 16 |
//! | `max_running_users` | 3 |

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Errors loading a configuration file.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),
    /// The file did not parse as a configuration document.
    #[error("malformed config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Capability flags of the device the supervisor runs on.
///
/// Windowing-mode resolution clamps every request to these flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceCapabilities {
    /// Multi-window support in general; gates every non-fullscreen mode.
    pub multi_window: bool,
    /// Split-screen multi-window.
    pub split_screen: bool,
    /// Freeform (desktop-style) windows.
    pub freeform: bool,
    /// Picture-in-picture.
    pub picture_in_picture: bool,
}

impl Default for DeviceCapabilities {
    fn default() -> Self {
        Self {
            multi_window: true,
            split_screen: true,
            freeform: false,
            picture_in_picture: true,
        }
    }
}

/// Memory and display profile feeding the low-memory-killer table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryProfile {
    /// Total device memory in megabytes.
    pub total_mem_mb: u64,
    /// Base display width in pixels.
    pub display_width: i32,
    /// Base display height in pixels.
    pub display_height: i32,
    /// Absolute override for the minfree table's top slot in KB, scaling the
    /// rest proportionally. Negative = unset.
    pub min_free_abs_kb: i64,
    /// Additive adjustment applied proportionally across the table in KB.
    pub min_free_adjust_kb: i64,
    /// Absolute override for the extra-free reserve in KB. Negative = unset.
    pub extra_free_abs_kb: i64,
    /// Additive adjustment for the extra-free reserve in KB.
    pub extra_free_adjust_kb: i64,
}

impl Default for MemoryProfile {
    fn default() -> Self {
        Self {
            total_mem_mb: 512,
            display_width: 1080,
            display_height: 1920,
            min_free_abs_kb: -1,
            min_free_adjust_kb: 0,
            extra_free_abs_kb: -1,
            extra_free_adjust_kb: 0,
        }
    }
}

/// Supervisor configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Deadline for an activity to report pause completion.
    pub pause_timeout: Duration,
    /// Deadline for an activity to report stop completion.
    pub stop_timeout: Duration,
    /// Deadline for an activity to report destruction; expiry kills the
    /// hosting process.
    pub destroy_timeout: Duration,
    /// Deadline for a caller blocked on a launch result.
    pub launch_wait_timeout: Duration,
    /// Deadline for user-switch observers to acknowledge.
    pub user_switch_timeout: Duration,
    /// A crash within this interval of the previous one counts as a quick
    /// crash.
    pub min_crash_interval: Duration,
    /// Crashes tolerated within the rolling window before the process is
    /// considered over the limit.
    pub crash_count_limit: u32,
    /// Length of the rolling crash-count window.
    pub crash_count_reset_interval: Duration,
    /// Crash-count ceiling for restarting crashing foreground-bound services.
    pub bound_service_max_crash_retry: u32,
    /// Maximum number of users in a running state at once.
    pub max_running_users: usize,
    /// Device capability flags.
    pub capabilities: DeviceCapabilities,
    /// Memory profile for the OOM table.
    pub memory: MemoryProfile,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            pause_timeout: Duration::from_millis(500),
            stop_timeout: Duration::from_secs(11),
            destroy_timeout: Duration::from_secs(10),
            launch_wait_timeout: Duration::from_secs(10),
            user_switch_timeout: Duration::from_secs(2),
            min_crash_interval: Duration::from_secs(60),
            crash_count_limit: 12,
            crash_count_reset_interval: Duration::from_secs(12 * 60 * 60),
            bound_service_max_crash_retry: 16,
            max_running_users: 3,
            capabilities: DeviceCapabilities::default(),
            memory: MemoryProfile::default(),
        }
    }
}

impl SupervisorConfig {
    /// Loads a configuration document from a JSON file and normalizes it.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let mut config: Self = serde_json::from_str(&raw)?;
        config.normalize();
        Ok(config)
    }

    /// Normalize configuration values to safe minimums.
    pub fn normalize(&mut self) {
        if self.max_running_users == 0 {
            self.max_running_users = 1;
        }
        if self.crash_count_limit == 0 {
            self.crash_count_limit = 1;
        }
        if self.pause_timeout.is_zero() {
            self.pause_timeout = Duration::from_millis(1);
        }
        if self.memory.total_mem_mb == 0 {
            self.memory.total_mem_mb = 1;
        }
    }
}
