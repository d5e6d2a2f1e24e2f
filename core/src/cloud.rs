//! Service discovery abstractions.
//!
//! A service call resolves a logical service name into one concrete address
//! in three stages, each behind a trait so strategies can be mixed freely:
//!
//! ```text
//! name ──► ServiceDiscovery ──► ServiceFilter ──► ServiceChooser ──► host:port
//!          (all instances)      (drop unwanted)   (pick exactly one)
//! ```
//!
//! Discovery is async since real registries live across the network. Filters
//! and choosers are pure and synchronous.

use crate::error::ConfigError;
use crate::exchange::Exchange;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;

/// One instance of a service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceDefinition {
    name: String,
    host: String,
    port: u16,
    #[serde(default)]
    metadata: BTreeMap<String, String>,
    #[serde(default = "healthy_by_default")]
    healthy: bool,
}

const fn healthy_by_default() -> bool {
    true
}

impl ServiceDefinition {
    /// Create a healthy instance without metadata.
    #[must_use]
    pub fn new(name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port,
            metadata: BTreeMap::new(),
            healthy: true,
        }
    }

    /// Parse `name@host:port`, or `host:port` using `default_name`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidServer`] if the host or port is missing,
    /// or no name is available.
    ///
    /// # Example
    ///
    /// ```
    /// use conduit_core::cloud::ServiceDefinition;
    ///
    /// let service = ServiceDefinition::parse("hello-service@localhost:8081", None).unwrap();
    /// assert_eq!(service.name(), "hello-service");
    /// assert_eq!(service.port(), 8081);
    ///
    /// let service = ServiceDefinition::parse("10.0.0.1:9000", Some("billing")).unwrap();
    /// assert_eq!(service.name(), "billing");
    /// ```
    pub fn parse(server: &str, default_name: Option<&str>) -> Result<Self, ConfigError> {
        let invalid = || ConfigError::InvalidServer(server.to_string());
        let server = server.trim();

        let (name, address) = match server.split_once('@') {
            Some((name, address)) => (name.trim(), address.trim()),
            None => (default_name.ok_or_else(invalid)?, server),
        };
        let (host, port) = address.rsplit_once(':').ok_or_else(invalid)?;
        let port = port.trim().parse::<u16>().map_err(|_| invalid())?;
        if name.is_empty() || host.trim().is_empty() {
            return Err(invalid());
        }

        Ok(Self::new(name, host.trim(), port))
    }

    /// Attach a metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Mark the instance healthy or not.
    #[must_use]
    pub const fn with_health(mut self, healthy: bool) -> Self {
        self.healthy = healthy;
        self
    }

    /// Logical service name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Host name or address.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Port.
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }

    /// Free-form metadata.
    #[must_use]
    pub const fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }

    /// Whether the instance reports itself healthy.
    #[must_use]
    pub const fn is_healthy(&self) -> bool {
        self.healthy
    }
}

impl fmt::Display for ServiceDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.name, self.host, self.port)
    }
}

/// Future returned by [`ServiceDiscovery::services`].
pub type DiscoveryFuture<'a> = Pin<Box<dyn Future<Output = Vec<ServiceDefinition>> + Send + 'a>>;

/// Lists the instances of a service.
pub trait ServiceDiscovery: Send + Sync + fmt::Debug {
    /// All known instances of `name`. Unknown names yield an empty list.
    fn services<'a>(&'a self, name: &'a str) -> DiscoveryFuture<'a>;
}

/// Removes unwanted instances.
pub trait ServiceFilter: Send + Sync + fmt::Debug {
    /// Filter `services` for the given exchange.
    fn apply(&self, exchange: &Exchange, services: Vec<ServiceDefinition>) -> Vec<ServiceDefinition>;
}

/// Picks one instance out of a non-empty candidate list.
pub trait ServiceChooser: Send + Sync + fmt::Debug {
    /// Choose an instance. Returns `None` only for an empty list.
    fn choose(&self, services: &[ServiceDefinition]) -> Option<ServiceDefinition>;
}
