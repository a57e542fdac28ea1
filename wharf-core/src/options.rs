//! Socket reliability profile
//!
//! Every socket the registry creates gets the same reliability settings,
//! mirroring libzmq's socket options (zmq_setsockopt). The profile is fixed
//! per socket at creation; only the two timeouts can be retuned later.

use std::time::Duration;

use crate::error::ConfigError;

/// Reliability settings applied to every socket at creation.
///
/// # Examples
///
/// ```
/// use wharf_core::options::ReliabilityProfile;
/// use std::time::Duration;
///
/// let profile = ReliabilityProfile::default()
///     .with_recv_timeout(Duration::from_secs(2))
///     .with_send_hwm(10_000);
/// assert_eq!(profile.linger, Duration::ZERO);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReliabilityProfile {
    /// Linger on close (ZMQ_LINGER)
    ///
    /// Zero discards unsent messages so closing never blocks.
    pub linger: Duration,

    /// High water mark for sending (ZMQ_SNDHWM)
    ///
    /// Messages queued beyond this block (PUSH, DEALER, REQ) or are dropped (PUB).
    pub send_hwm: usize,

    /// High water mark for receiving (ZMQ_RCVHWM)
    pub recv_hwm: usize,

    /// Receive window (ZMQ_RCVTIMEO)
    ///
    /// How long one receive attempt waits before the task counts as "not yet".
    /// Kept long enough that idle loops are cheap, short enough for liveness checks.
    pub recv_timeout: Duration,

    /// Send timeout (ZMQ_SNDTIMEO)
    pub send_timeout: Duration,

    /// Reconnect interval (ZMQ_RECONNECT_IVL)
    pub reconnect_ivl: Duration,

    /// Maximum reconnect interval (ZMQ_RECONNECT_IVL_MAX)
    ///
    /// Equal to `reconnect_ivl` by default, which makes reconnects fixed-interval.
    pub reconnect_ivl_max: Duration,

    /// Immediate mode for connect-role sockets (ZMQ_IMMEDIATE)
    ///
    /// - `false` (default): queue messages while the peer is still connecting
    /// - `true`: only queue on completed connections
    pub immediate: bool,
}

/// Default receive window.
pub const DEFAULT_RECV_TIMEOUT: Duration = Duration::from_secs(10);
/// Default send timeout.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(1);
/// Default reconnect interval, also used as its cap.
pub const DEFAULT_RECONNECT_IVL: Duration = Duration::from_millis(250);
/// Default high water mark, both directions.
pub const DEFAULT_HWM: usize = 1000;

impl Default for ReliabilityProfile {
    fn default() -> Self {
        Self {
            linger: Duration::ZERO,
            send_hwm: DEFAULT_HWM,
            recv_hwm: DEFAULT_HWM,
            recv_timeout: DEFAULT_RECV_TIMEOUT,
            send_timeout: DEFAULT_SEND_TIMEOUT,
            reconnect_ivl: DEFAULT_RECONNECT_IVL,
            reconnect_ivl_max: DEFAULT_RECONNECT_IVL,
            immediate: false,
        }
    }
}

impl ReliabilityProfile {
    /// Create a profile with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set linger on close.
    pub fn with_linger(mut self, linger: Duration) -> Self {
        self.linger = linger;
        self
    }

    /// Set send high water mark.
    pub fn with_send_hwm(mut self, hwm: usize) -> Self {
        self.send_hwm = hwm;
        self
    }

    /// Set receive high water mark.
    pub fn with_recv_hwm(mut self, hwm: usize) -> Self {
        self.recv_hwm = hwm;
        self
    }

    /// Set the receive window.
    pub fn with_recv_timeout(mut self, timeout: Duration) -> Self {
        self.recv_timeout = timeout;
        self
    }

    /// Set send timeout.
    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    /// Set reconnection interval.
    pub fn with_reconnect_ivl(mut self, ivl: Duration) -> Self {
        self.reconnect_ivl = ivl;
        self
    }

    /// Set maximum reconnection interval.
    pub fn with_reconnect_ivl_max(mut self, max: Duration) -> Self {
        self.reconnect_ivl_max = max;
        self
    }

    /// Enable or disable immediate mode.
    pub fn with_immediate(mut self, immediate: bool) -> Self {
        self.immediate = immediate;
        self
    }

    /// True when reconnects never back off beyond the first interval.
    pub fn is_fixed_backoff(&self) -> bool {
        self.reconnect_ivl_max <= self.reconnect_ivl
    }

    /// Overlay `WHARF_ZMQ_*` environment variables onto this profile.
    ///
    /// Recognised variables: `WHARF_ZMQ_LINGER_MS`, `WHARF_ZMQ_SNDHWM`,
    /// `WHARF_ZMQ_RCVHWM`, `WHARF_ZMQ_RCVTIMEO_MS`, `WHARF_ZMQ_SNDTIMEO_MS`,
    /// `WHARF_ZMQ_RECONNECT_IVL_MS`, `WHARF_ZMQ_RECONNECT_IVL_MAX_MS`,
    /// `WHARF_ZMQ_IMMEDIATE`. Unset variables leave the field untouched.
    pub fn from_env(self) -> Result<Self, ConfigError> {
        self.overlay(|name| std::env::var(name).ok())
    }

    /// Overlay settings from an arbitrary lookup (same keys as [`from_env`]).
    ///
    /// [`from_env`]: Self::from_env
    pub fn overlay<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(ms) = parse_u64(&lookup, "WHARF_ZMQ_LINGER_MS")? {
            self.linger = Duration::from_millis(ms);
        }
        if let Some(hwm) = parse_u64(&lookup, "WHARF_ZMQ_SNDHWM")? {
            self.send_hwm = hwm as usize;
        }
        if let Some(hwm) = parse_u64(&lookup, "WHARF_ZMQ_RCVHWM")? {
            self.recv_hwm = hwm as usize;
        }
        if let Some(ms) = parse_u64(&lookup, "WHARF_ZMQ_RCVTIMEO_MS")? {
            self.recv_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_u64(&lookup, "WHARF_ZMQ_SNDTIMEO_MS")? {
            self.send_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_u64(&lookup, "WHARF_ZMQ_RECONNECT_IVL_MS")? {
            self.reconnect_ivl = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_u64(&lookup, "WHARF_ZMQ_RECONNECT_IVL_MAX_MS")? {
            self.reconnect_ivl_max = Duration::from_millis(ms);
        }
        if let Some(immediate) = parse_bool(&lookup, "WHARF_ZMQ_IMMEDIATE")? {
            self.immediate = immediate;
        }
        Ok(self)
    }
}

fn parse_u64<F>(lookup: &F, name: &str) -> Result<Option<u64>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(name) else {
        return Ok(None);
    };
    raw.trim()
        .parse::<u64>()
        .map(Some)
        .map_err(|_| ConfigError::InvalidSetting {
            name: name.to_string(),
            value: raw,
        })
}

fn parse_bool<F>(lookup: &F, name: &str) -> Result<Option<bool>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(name) else {
        return Ok(None);
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(Some(true)),
        "0" | "false" | "no" | "off" => Ok(Some(false)),
        _ => Err(ConfigError::InvalidSetting {
            name: name.to_string(),
            value: raw,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_profile() {
        let profile = ReliabilityProfile::default();
        assert_eq!(profile.linger, Duration::ZERO);
        assert_eq!(profile.send_hwm, 1000);
        assert_eq!(profile.recv_hwm, 1000);
        assert_eq!(profile.recv_timeout, Duration::from_secs(10));
        assert_eq!(profile.send_timeout, Duration::from_secs(1));
        assert_eq!(profile.reconnect_ivl, Duration::from_millis(250));
        assert_eq!(profile.reconnect_ivl_max, Duration::from_millis(250));
        assert!(profile.is_fixed_backoff());
    }

    #[test]
    fn test_builder_pattern() {
        let profile = ReliabilityProfile::new()
            .with_recv_timeout(Duration::from_millis(200))
            .with_send_timeout(Duration::from_millis(50))
            .with_reconnect_ivl_max(Duration::from_secs(5))
            .with_recv_hwm(2000);

        assert_eq!(profile.recv_timeout, Duration::from_millis(200));
        assert_eq!(profile.send_timeout, Duration::from_millis(50));
        assert_eq!(profile.recv_hwm, 2000);
        assert!(!profile.is_fixed_backoff());
    }

    #[test]
    fn test_overlay() {
        let vars: HashMap<&str, &str> = [
            ("WHARF_ZMQ_RCVTIMEO_MS", "1500"),
            ("WHARF_ZMQ_SNDHWM", " 42 "),
            ("WHARF_ZMQ_IMMEDIATE", "on"),
        ]
        .into_iter()
        .collect();

        let profile = ReliabilityProfile::default()
            .overlay(|k| vars.get(k).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(profile.recv_timeout, Duration::from_millis(1500));
        assert_eq!(profile.send_hwm, 42);
        assert!(profile.immediate);
        assert_eq!(profile.send_timeout, DEFAULT_SEND_TIMEOUT);
    }

    #[test]
    fn test_overlay_rejects_garbage() {
        let err = ReliabilityProfile::default()
            .overlay(|k| (k == "WHARF_ZMQ_LINGER_MS").then(|| "soon".to_string()))
            .unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidSetting {
                name: "WHARF_ZMQ_LINGER_MS".into(),
                value: "soon".into()
            }
        );

        let err = ReliabilityProfile::default()
            .overlay(|k| (k == "WHARF_ZMQ_IMMEDIATE").then(|| "maybe".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidSetting { .. }));
    }
}
