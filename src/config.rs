//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** — `SBDLINK_DEVICE`, `SBDLINK_DATA_DIR`
//! 2. **Config file** — path via `--config <path>`, or `sbdlink.toml` in CWD
//! 3. **Compiled defaults** — see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [serial]
//! device = "/dev/ttyS1"
//! baud = 19200
//!
//! [timing]
//! csq_poll_secs = 150
//! csq_retry_delay_secs = 25
//! csq_max_retries = 3
//! msg_max_retries = 5
//! msg_retry_delay_secs = 3
//! wait_for_calls_secs = 45
//! timeout_wait_secs = 600          # 10 minutes
//! satellite_timeout_secs = 65
//! tick_ms = 50
//!
//! [spool]
//! data_dir = "/var/lib/sbdlink"
//! keep_file_list = ""              # "" delete, "*" keep all, else match first char
//!
//! [notification]
//! mode = "none"                    # none | port2 | port3 | both | either
//!
//! [power]
//! modem_cycle_cmd = ""             # shell command; empty = no power control
//! aux_cycle_cmd = ""
//!
//! [logging]
//! level = "info"
//!
//! [supervisor]
//! max_backoff = 60
//! stable_threshold = 60
//! ```

use serde::Deserialize;
use std::path::Path;

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub serial: SerialConfig,
    #[serde(default)]
    pub timing: TimingConfig,
    #[serde(default)]
    pub spool: SpoolConfig,
    #[serde(default)]
    pub notification: NotificationConfig,
    #[serde(default)]
    pub power: PowerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
}

/// Shared UART settings.
#[derive(Debug, Clone, Deserialize)]
pub struct SerialConfig {
    /// Serial device path (default `/dev/ttyS1`). Override with
    /// `SBDLINK_DEVICE`.
    #[serde(default = "default_device")]
    pub device: String,
    /// Baud rate (default 19200).
    #[serde(default = "default_baud")]
    pub baud: u32,
}

/// Poll rates, retries, and timeouts. All runtime-settable through the API
/// layer as well; these are the boot values.
#[derive(Debug, Clone, Deserialize)]
pub struct TimingConfig {
    /// Signal-quality background poll period in seconds (default 150).
    #[serde(default = "default_csq_poll")]
    pub csq_poll_secs: u64,
    /// Re-probe interval during CSQ debounce in seconds (default 25).
    #[serde(default = "default_csq_retry_delay")]
    pub csq_retry_delay_secs: u64,
    /// CSQ failures tolerated before surfacing a fault (default 3).
    #[serde(default = "default_csq_max_retries")]
    pub csq_max_retries: u8,
    /// Outbound file retries before giving up (default 5).
    #[serde(default = "default_msg_max_retries")]
    pub msg_max_retries: u8,
    /// Delay between outbound retries in seconds (default 3).
    #[serde(default = "default_msg_retry_delay")]
    pub msg_retry_delay_secs: u64,
    /// Quiet window for incoming calls between AT commands in seconds
    /// (default 45).
    #[serde(default = "default_wait_for_calls")]
    pub wait_for_calls_secs: u64,
    /// Stuck-communications threshold before a device power cycle in seconds
    /// (default 600).
    #[serde(default = "default_timeout_wait")]
    pub timeout_wait_secs: u64,
    /// Satellite-session response timeout in seconds (default 65).
    #[serde(default = "default_satellite_timeout")]
    pub satellite_timeout_secs: u64,
    /// Driver tick period in milliseconds (default 50).
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
}

/// Message spool settings.
#[derive(Debug, Clone, Deserialize)]
pub struct SpoolConfig {
    /// Root of the spool tree (default `/var/lib/sbdlink`). Override with
    /// `SBDLINK_DATA_DIR`.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    /// Disposition of successfully sent files: empty = delete, `*` = move to
    /// sent, otherwise keep files whose name starts with a listed character.
    #[serde(default)]
    pub keep_file_list: String,
}

/// Text-message indicator policy for received MT traffic.
#[derive(Debug, Clone, Deserialize)]
pub struct NotificationConfig {
    /// Which serial-port inboxes light the indicator relay (default `none`).
    #[serde(default = "default_notification_mode")]
    pub mode: String,
}

/// Power-cycle commands (typically GPIO poke scripts).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PowerConfig {
    /// Shell command that power-cycles the modem. Empty disables.
    #[serde(default)]
    pub modem_cycle_cmd: String,
    /// Shell command that power-cycles the aux board. Empty disables.
    #[serde(default)]
    pub aux_cycle_cmd: String,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG`.
    #[serde(default = "default_log_level")]
    pub level: String,
}

/// Supervisor settings for `sbdlink supervise`.
#[derive(Debug, Clone, Deserialize)]
pub struct SupervisorConfig {
    /// Maximum seconds between restart attempts (default 60).
    #[serde(default = "default_supervisor_max_backoff")]
    pub max_backoff: u64,
    /// Seconds of uptime before resetting backoff (default 60).
    #[serde(default = "default_supervisor_stable_threshold")]
    pub stable_threshold: u64,
}

fn default_device() -> String {
    "/dev/ttyS1".to_string()
}
fn default_baud() -> u32 {
    19200
}
fn default_csq_poll() -> u64 {
    150
}
fn default_csq_retry_delay() -> u64 {
    25
}
fn default_csq_max_retries() -> u8 {
    3
}
fn default_msg_max_retries() -> u8 {
    5
}
fn default_msg_retry_delay() -> u64 {
    3
}
fn default_wait_for_calls() -> u64 {
    45
}
fn default_timeout_wait() -> u64 {
    600
}
fn default_satellite_timeout() -> u64 {
    65
}
fn default_tick_ms() -> u64 {
    50
}
fn default_data_dir() -> String {
    "/var/lib/sbdlink".to_string()
}
fn default_notification_mode() -> String {
    "none".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_supervisor_max_backoff() -> u64 {
    60
}
fn default_supervisor_stable_threshold() -> u64 {
    60
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            device: default_device(),
            baud: default_baud(),
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            csq_poll_secs: default_csq_poll(),
            csq_retry_delay_secs: default_csq_retry_delay(),
            csq_max_retries: default_csq_max_retries(),
            msg_max_retries: default_msg_max_retries(),
            msg_retry_delay_secs: default_msg_retry_delay(),
            wait_for_calls_secs: default_wait_for_calls(),
            timeout_wait_secs: default_timeout_wait(),
            satellite_timeout_secs: default_satellite_timeout(),
            tick_ms: default_tick_ms(),
        }
    }
}

impl Default for SpoolConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            keep_file_list: String::new(),
        }
    }
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            mode: default_notification_mode(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_backoff: default_supervisor_max_backoff(),
            stable_threshold: default_supervisor_stable_threshold(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            serial: SerialConfig::default(),
            timing: TimingConfig::default(),
            spool: SpoolConfig::default(),
            notification: NotificationConfig::default(),
            power: PowerConfig::default(),
            logging: LoggingConfig::default(),
            supervisor: SupervisorConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file >
    /// defaults.
    ///
    /// If `path` is `Some`, reads that file (panics on failure). Otherwise
    /// looks for `sbdlink.toml` in the current directory, falling back to
    /// compiled defaults.
    pub fn load(path: Option<&str>) -> Self {
        let mut config: Config = if let Some(p) = path {
            let content = std::fs::read_to_string(p)
                .unwrap_or_else(|e| panic!("Failed to read config file {p}: {e}"));
            toml::from_str(&content)
                .unwrap_or_else(|e| panic!("Failed to parse config file {p}: {e}"))
        } else if Path::new("sbdlink.toml").exists() {
            let content =
                std::fs::read_to_string("sbdlink.toml").expect("Failed to read sbdlink.toml");
            toml::from_str(&content).expect("Failed to parse sbdlink.toml")
        } else {
            Config::default()
        };

        // Env var overrides
        if let Ok(device) = std::env::var("SBDLINK_DEVICE") {
            config.serial.device = device;
        }
        if let Ok(dir) = std::env::var("SBDLINK_DATA_DIR") {
            config.spool.data_dir = dir;
        }

        config
    }

    /// Sanity-check values that would otherwise wedge the state machine.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.timing.tick_ms == 0 {
            errors.push("timing.tick_ms must be greater than zero".to_string());
        }
        if self.timing.satellite_timeout_secs == 0 {
            errors.push("timing.satellite_timeout_secs must be greater than zero".to_string());
        }
        if self.timing.msg_max_retries == 0 {
            errors.push("timing.msg_max_retries must be greater than zero".to_string());
        }
        match self.notification.mode.as_str() {
            "none" | "port2" | "port3" | "both" | "either" => {}
            other => errors.push(format!("notification.mode: unknown mode {other:?}")),
        }
        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let c = Config::default();
        assert_eq!(c.timing.csq_poll_secs, 150);
        assert_eq!(c.timing.msg_max_retries, 5);
        assert_eq!(c.timing.satellite_timeout_secs, 65);
        assert_eq!(c.spool.keep_file_list, "");
        assert!(c.validate().is_empty());
    }

    #[test]
    fn test_partial_toml() {
        let c: Config = toml::from_str(
            r#"
            [serial]
            device = "/dev/ttyUSB0"

            [timing]
            csq_poll_secs = 60
            "#,
        )
        .unwrap();
        assert_eq!(c.serial.device, "/dev/ttyUSB0");
        assert_eq!(c.serial.baud, 19200);
        assert_eq!(c.timing.csq_poll_secs, 60);
        assert_eq!(c.timing.msg_retry_delay_secs, 3);
    }

    #[test]
    fn test_validate_rejects_bad_mode() {
        let c = Config {
            notification: NotificationConfig {
                mode: "sideways".to_string(),
            },
            ..Config::default()
        };
        assert_eq!(c.validate().len(), 1);
    }
}
