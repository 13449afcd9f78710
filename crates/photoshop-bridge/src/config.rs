//! Bridge configuration read from the environment.
//!
//! Durations are given in (fractional) seconds. Unparseable values fall back
//! to the default with a warning.

use std::time::Duration;

pub const ENV_HEARTBEAT_TIMEOUT: &str = "PHOTOSHOP_BRIDGE_HEARTBEAT_TIMEOUT";
pub const ENV_HEARTBEAT_INTERVAL: &str = "PHOTOSHOP_BRIDGE_HEARTBEAT_INTERVAL";
pub const ENV_HEARTBEAT_TOLERANCE: &str = "PHOTOSHOP_BRIDGE_HEARTBEAT_TOLERANCE";
pub const ENV_REQUEST_TIMEOUT: &str = "PHOTOSHOP_BRIDGE_REQUEST_TIMEOUT";
pub const ENV_WAIT_SLICE: &str = "PHOTOSHOP_BRIDGE_WAIT_SLICE";
pub const ENV_NETWORK_DEBUG: &str = "PHOTOSHOP_BRIDGE_NETWORK_DEBUG";
pub const ENV_READ_TIMEOUT: &str = "PHOTOSHOP_BRIDGE_READ_TIMEOUT";

#[derive(Debug, Clone, PartialEq)]
pub struct BridgeConfig {
    /// How long a ping may wait for its pong.
    pub heartbeat_timeout: Duration,
    /// Pause between pings.
    pub heartbeat_interval: Duration,
    /// Consecutive failed pings before the process exits.
    pub heartbeat_tolerance: u32,
    /// Overall deadline for a single request.
    pub request_timeout: Duration,
    /// Upper bound on one wait before the event pump runs again.
    pub wait_slice: Duration,
    /// Log every frame under the `photoshop_bridge::network` target.
    pub network_debug: bool,
    /// How long an inbound connection may take to deliver its message and
    /// close. Payloads run to EOF, so this bounds peers that never close.
    pub read_timeout: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout: Duration::from_millis(500),
            heartbeat_interval: Duration::from_millis(200),
            heartbeat_tolerance: 2,
            request_timeout: Duration::from_secs(300),
            wait_slice: Duration::from_millis(100),
            network_debug: false,
            read_timeout: Duration::from_secs(30),
        }
    }
}

impl BridgeConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        Self {
            heartbeat_timeout: seconds(&lookup, ENV_HEARTBEAT_TIMEOUT, defaults.heartbeat_timeout),
            heartbeat_interval: seconds(
                &lookup,
                ENV_HEARTBEAT_INTERVAL,
                defaults.heartbeat_interval,
            ),
            heartbeat_tolerance: lookup(ENV_HEARTBEAT_TOLERANCE)
                .and_then(|raw| match raw.trim().parse::<u32>() {
                    Ok(n) if n > 0 => Some(n),
                    _ => {
                        tracing::warn!(key = ENV_HEARTBEAT_TOLERANCE, value = %raw, "Ignoring invalid tolerance");
                        None
                    }
                })
                .unwrap_or(defaults.heartbeat_tolerance),
            request_timeout: seconds(&lookup, ENV_REQUEST_TIMEOUT, defaults.request_timeout),
            wait_slice: seconds(&lookup, ENV_WAIT_SLICE, defaults.wait_slice),
            network_debug: lookup(ENV_NETWORK_DEBUG)
                .map(|raw| matches!(raw.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
                .unwrap_or(defaults.network_debug),
            read_timeout: seconds(&lookup, ENV_READ_TIMEOUT, defaults.read_timeout),
        }
    }
}

fn seconds<F>(lookup: &F, key: &str, default: Duration) -> Duration
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(key) else {
        return default;
    };
    match raw.trim().parse::<f64>() {
        Ok(secs) if secs.is_finite() && secs > 0.0 => Duration::from_secs_f64(secs),
        _ => {
            tracing::warn!(key, value = %raw, "Ignoring invalid duration");
            default
        }
    }
}
