use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use crate::protocol::LIFX_PORT;

/// Shortest retry interval accepted by [`ControllerConfig::validate`].
pub const MIN_RETRY_INTERVAL_MS: u64 = 100;

/// How often an unanswered request is resent and how many times.
///
/// `max_retries` counts resends after the first transmission, so a request is put
/// on the wire at most `max_retries + 1` times.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub interval_ms: u64,
    pub max_retries: u32,
}

impl RetryPolicy {
    /// Used for ordinary commands and state queries.
    pub const COMMAND: RetryPolicy = RetryPolicy::new(1000, 10);

    /// Used when discovering a device by address, which may take a while to wake up.
    pub const ADDRESS_DISCOVERY: RetryPolicy = RetryPolicy::new(1500, 15);

    pub const fn new(interval_ms: u64, max_retries: u32) -> Self {
        RetryPolicy {
            interval_ms,
            max_retries,
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Same interval, never resent.
    pub fn without_retries(self) -> Self {
        RetryPolicy {
            max_retries: 0,
            ..self
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::COMMAND
    }
}

/**
 * Settings for a [`LightController`](crate::control_interface::controller::LightController).
 *
 * Every field has a default, so a config file only needs the values it changes:
 *
 * ```
 * use lifx_control_lib::util::config::ControllerConfig;
 *
 * let config: ControllerConfig =
 *     serde_json::from_str(r#"{ "bind_port": 0, "request_policy": { "interval_ms": 500, "max_retries": 3 } }"#)
 *     .unwrap();
 * assert_eq!(config.broadcast_port, 56700);
 * config.validate().unwrap();
 * ```
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub bind_address: IpAddr,
    /// Local port. Replies to broadcasts are sent to the port they came from, so
    /// `0` works for a controller that does not need to hear unsolicited traffic.
    pub bind_port: u16,
    pub broadcast_address: IpAddr,
    pub broadcast_port: u16,
    pub request_policy: RetryPolicy,
    pub address_discovery_policy: RetryPolicy,
    pub event_channel_capacity: usize,
    /// Decoded frames waiting for the event loop. Frames arriving while it is
    /// full are dropped.
    pub receive_queue_capacity: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        ControllerConfig {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            bind_port: LIFX_PORT,
            broadcast_address: IpAddr::V4(Ipv4Addr::BROADCAST),
            broadcast_port: LIFX_PORT,
            request_policy: RetryPolicy::COMMAND,
            address_discovery_policy: RetryPolicy::ADDRESS_DISCOVERY,
            event_channel_capacity: 256,
            receive_queue_capacity: 1024,
        }
    }
}

impl ControllerConfig {
    pub fn bind_socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.bind_port)
    }

    pub fn broadcast_socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.broadcast_address, self.broadcast_port)
    }

    pub fn validate(&self) -> Result<()> {
        if self.event_channel_capacity == 0 {
            bail!("event_channel_capacity must be greater than zero");
        }
        if self.receive_queue_capacity == 0 {
            bail!("receive_queue_capacity must be greater than zero");
        }
        for (name, policy) in [
            ("request_policy", &self.request_policy),
            ("address_discovery_policy", &self.address_discovery_policy),
        ] {
            if policy.interval_ms < MIN_RETRY_INTERVAL_MS {
                bail!(
                    "{}.interval_ms must be at least {} ms, got {}",
                    name,
                    MIN_RETRY_INTERVAL_MS,
                    policy.interval_ms
                );
            }
        }
        Ok(())
    }
}
