//! Network module - Handles UDP communication with a Z21 station
//!
//! Provides:
//! - Station session owning the socket and the receive loop
//! - Correlation of requests with their replies
//! - Broadcast classification and subscriber fan-out

mod broadcast;
mod correlation;
mod station;
#[cfg(test)]
pub(crate) mod testing;

pub use broadcast::*;
pub use correlation::*;
pub use station::*;

use std::net::SocketAddr;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;

use crate::protocol::{CodecError, ThrottleSteps};

/// Station errors
#[derive(Error, Debug)]
pub enum StationError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Timed out waiting for {0}")]
    Timeout(CorrelationKey),

    #[error("Request already in flight for {0}")]
    Conflict(CorrelationKey),

    #[error("Connection closed")]
    Closed,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Protocol error: {0}")]
    Protocol(#[from] CodecError),
}

pub type StationResult<T> = Result<T, StationError>;

/// Configuration for a station session
#[derive(Debug, Clone)]
pub struct StationConfig {
    /// Station host name or IP address
    pub host: String,
    /// UDP port of the station
    pub port: u16,
    /// Default reply timeout for requests
    pub timeout: Duration,
    /// Interval between keep-alive frames
    pub keepalive_interval: Duration,
    /// Throttle steps used by `Loco::control_default`
    pub default_steps: ThrottleSteps,
}

impl Default for StationConfig {
    fn default() -> Self {
        Self {
            host: "192.168.0.111".to_string(),
            port: crate::protocol::DEFAULT_PORT,
            timeout: Duration::from_secs(2),
            keepalive_interval: Duration::from_secs(20),
            default_steps: ThrottleSteps::default(),
        }
    }
}

impl StationConfig {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ..Default::default()
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval = interval;
        self
    }
}

/// Resolve a hostname to a socket address
pub async fn resolve_host(host: &str, port: u16) -> std::io::Result<SocketAddr> {
    use tokio::net::lookup_host;

    let addr_string = format!("{}:{}", host, port);
    let mut addrs = lookup_host(&addr_string).await?;

    addrs.next().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("Could not resolve host: {}", host),
        )
    })
}

/// Lock a mutex, recovering the data if a previous holder panicked
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
