//! Configuration sections.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Where the hub lives and who we are when talking to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HubSection {
    /// Hub host name or address.
    /// Default: localhost
    #[serde(default = "HubSection::default_host")]
    pub host: String,

    /// Hub TCP port.
    /// Default: 9877
    #[serde(default = "HubSection::default_port")]
    pub port: u16,

    /// Commander name (`program.user`) the hub echoes back in replies to
    /// our commands.
    /// Default: TU01.me
    #[serde(default = "HubSection::default_commander")]
    pub commander: String,
}

impl HubSection {
    fn default_host() -> String {
        "localhost".to_string()
    }

    fn default_port() -> u16 {
        9877
    }

    fn default_commander() -> String {
        "TU01.me".to_string()
    }

    /// `host:port` suitable for a TCP connect.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for HubSection {
    fn default() -> Self {
        Self {
            host: Self::default_host(),
            port: Self::default_port(),
            commander: Self::default_commander(),
        }
    }
}

/// Liveness checking and reconnection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// How often to look at the age of the newest hub message (seconds).
    /// Default: 5
    #[serde(default = "ConnectionConfig::default_check_interval")]
    pub check_interval: f64,

    /// Silence longer than this triggers a probe command (seconds).
    /// Default: 60
    #[serde(default = "ConnectionConfig::default_max_entry_age")]
    pub max_entry_age: f64,

    /// Time limit for the probe command (seconds).
    /// Default: 5
    #[serde(default = "ConnectionConfig::default_probe_timeout")]
    pub probe_timeout: f64,

    /// First reconnect delay, doubled per attempt (seconds).
    /// Default: 1
    #[serde(default = "ConnectionConfig::default_reconnect_initial")]
    pub reconnect_initial: f64,

    /// Cap on the reconnect delay (seconds).
    /// Default: 32
    #[serde(default = "ConnectionConfig::default_reconnect_max")]
    pub reconnect_max: f64,

    /// Longest reply line accepted before the connection is dropped.
    /// Default: 1 MiB
    #[serde(default = "ConnectionConfig::default_max_line_len")]
    pub max_line_len: usize,

    /// Granularity of command time limit checks (milliseconds).
    /// Default: 100
    #[serde(default = "ConnectionConfig::default_timeout_tick_ms")]
    pub timeout_tick_ms: u64,
}

impl ConnectionConfig {
    fn default_check_interval() -> f64 {
        5.0
    }

    fn default_max_entry_age() -> f64 {
        60.0
    }

    fn default_probe_timeout() -> f64 {
        5.0
    }

    fn default_reconnect_initial() -> f64 {
        1.0
    }

    fn default_reconnect_max() -> f64 {
        32.0
    }

    fn default_max_line_len() -> usize {
        1 << 20
    }

    fn default_timeout_tick_ms() -> u64 {
        100
    }

    pub fn check_interval(&self) -> Duration {
        secs(self.check_interval)
    }

    pub fn max_entry_age(&self) -> Duration {
        secs(self.max_entry_age)
    }

    pub fn probe_timeout(&self) -> Duration {
        secs(self.probe_timeout)
    }

    pub fn reconnect_initial(&self) -> Duration {
        secs(self.reconnect_initial)
    }

    pub fn reconnect_max(&self) -> Duration {
        secs(self.reconnect_max)
    }

    pub fn timeout_tick(&self) -> Duration {
        Duration::from_millis(self.timeout_tick_ms.max(1))
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            check_interval: Self::default_check_interval(),
            max_entry_age: Self::default_max_entry_age(),
            probe_timeout: Self::default_probe_timeout(),
            reconnect_initial: Self::default_reconnect_initial(),
            reconnect_max: Self::default_reconnect_max(),
            max_line_len: Self::default_max_line_len(),
            timeout_tick_ms: Self::default_timeout_tick_ms(),
        }
    }
}

/// Logging and optional OTLP export.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Log filter (trace, debug, info, warn, error, or an EnvFilter directive).
    /// Default: info
    #[serde(default = "TelemetryConfig::default_log_level")]
    pub log_level: String,

    /// OTLP gRPC endpoint. Logs and traces are only exported when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub otlp_endpoint: Option<String>,
}

impl TelemetryConfig {
    fn default_log_level() -> String {
        "info".to_string()
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Self::default_log_level(),
            otlp_endpoint: None,
        }
    }
}

/// Local clock sanity check against the TCC's TAI broadcast.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClockConfig {
    /// Largest tolerated clock error (seconds).
    /// Default: 10
    #[serde(default = "ClockConfig::default_max_time_err")]
    pub max_time_err: f64,
}

impl ClockConfig {
    fn default_max_time_err() -> f64 {
        10.0
    }
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            max_time_err: Self::default_max_time_err(),
        }
    }
}

fn secs(v: f64) -> Duration {
    if v.is_finite() && v > 0.0 {
        Duration::from_secs_f64(v)
    } else {
        Duration::ZERO
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations_from_seconds() {
        let conn = ConnectionConfig::default();
        assert_eq!(conn.check_interval(), Duration::from_secs(5));
        assert_eq!(conn.probe_timeout(), Duration::from_secs(5));
        assert_eq!(conn.timeout_tick(), Duration::from_millis(100));
    }

    #[test]
    fn negative_seconds_clamp_to_zero() {
        let conn = ConnectionConfig {
            max_entry_age: -3.0,
            ..Default::default()
        };
        assert_eq!(conn.max_entry_age(), Duration::ZERO);
    }

    #[test]
    fn hub_address() {
        assert_eq!(HubSection::default().address(), "localhost:9877");
    }
}
