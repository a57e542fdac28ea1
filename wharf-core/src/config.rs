//! Fabric-wide configuration.

use std::time::Duration;

use crate::error::ConfigError;
use crate::options::ReliabilityProfile;

/// Longest single blocking wait a driver thread performs before rechecking its inbox.
pub const DEFAULT_WAIT_SLICE: Duration = Duration::from_millis(100);

/// How long shutdown lets workers drain before force-stopping them.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(60);

/// Configuration for a [`Fabric`](https://docs.rs/wharf) instance.
///
/// # Examples
///
/// ```
/// use wharf_core::config::FabricConfig;
/// use std::time::Duration;
///
/// let config = FabricConfig::default()
///     .with_drain_timeout(Duration::from_secs(5))
///     .with_strict_registration(true);
/// assert_eq!(config.io_threads, 1);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FabricConfig {
    /// Socket options applied at creation
    pub profile: ReliabilityProfile,
    /// libzmq I/O threads for the shared context
    pub io_threads: i32,
    /// Upper bound on one blocking wait inside a driver thread
    pub wait_slice: Duration,
    /// Drain bound for [`shutdown`](https://docs.rs/wharf)
    pub drain_timeout: Duration,
    /// Reject re-registration with different parameters instead of warning
    pub strict_registration: bool,
}

impl Default for FabricConfig {
    fn default() -> Self {
        Self {
            profile: ReliabilityProfile::default(),
            io_threads: 1,
            wait_slice: DEFAULT_WAIT_SLICE,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            strict_registration: false,
        }
    }
}

impl FabricConfig {
    /// Create a config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the reliability profile.
    pub fn with_profile(mut self, profile: ReliabilityProfile) -> Self {
        self.profile = profile;
        self
    }

    /// Set the number of libzmq I/O threads.
    pub fn with_io_threads(mut self, threads: i32) -> Self {
        self.io_threads = threads;
        self
    }

    /// Set the wait slice.
    pub fn with_wait_slice(mut self, slice: Duration) -> Self {
        self.wait_slice = slice;
        self
    }

    /// Set the shutdown drain bound.
    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// Turn parameter drift on re-registration into an error.
    pub fn with_strict_registration(mut self, strict: bool) -> Self {
        self.strict_registration = strict;
        self
    }

    /// Default config with `WHARF_ZMQ_*` overrides applied to the profile.
    pub fn from_env() -> Result<Self, ConfigError> {
        let profile = ReliabilityProfile::default().from_env()?;
        Self::default().with_profile(profile).validate()
    }

    /// Check values libzmq or the driver threads cannot work with.
    pub fn validate(self) -> Result<Self, ConfigError> {
        if self.io_threads < 1 {
            return Err(ConfigError::InvalidSetting {
                name: "io_threads".to_string(),
                value: self.io_threads.to_string(),
            });
        }
        if self.wait_slice.is_zero() {
            return Err(ConfigError::InvalidSetting {
                name: "wait_slice".to_string(),
                value: format!("{:?}", self.wait_slice),
            });
        }
        Ok(self)
    }
}
