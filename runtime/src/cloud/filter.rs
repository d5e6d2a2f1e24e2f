use conduit_core::cloud::{ServiceDefinition, ServiceFilter};
use conduit_core::{ConfigError, Exchange};
use std::sync::Arc;

/// Removes blacklisted instances.
///
/// An entry `name@host:port` matches instances with that name and address;
/// the name `*` matches any name.
///
/// # Example
///
/// ```
/// use conduit_core::Exchange;
/// use conduit_core::cloud::{ServiceDefinition, ServiceFilter};
/// use conduit_runtime::cloud::BlacklistServiceFilter;
///
/// let filter = BlacklistServiceFilter::new().with_servers("*@127.0.0.1:8080").unwrap();
/// let services = vec![
///     ServiceDefinition::new("a", "127.0.0.1", 8080),
///     ServiceDefinition::new("b", "127.0.0.1", 8081),
/// ];
///
/// let allowed = filter.apply(&Exchange::new(), services);
/// assert_eq!(allowed.len(), 1);
/// assert_eq!(allowed[0].port(), 8081);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlacklistServiceFilter {
    blacklist: Vec<ServiceDefinition>,
}

impl BlacklistServiceFilter {
    /// Create a filter with an empty blacklist.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Blacklist a comma separated list of `name@host:port` entries.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidServer`] for a malformed entry.
    pub fn with_servers(mut self, servers: &str) -> Result<Self, ConfigError> {
        for server in servers.split(',').filter(|server| !server.trim().is_empty()) {
            self.blacklist.push(ServiceDefinition::parse(server, None)?);
        }
        Ok(self)
    }

    /// Blacklist one instance.
    #[must_use]
    pub fn with_service(mut self, service: ServiceDefinition) -> Self {
        self.blacklist.push(service);
        self
    }

    /// The blacklist entries.
    #[must_use]
    pub fn blacklisted_services(&self) -> &[ServiceDefinition] {
        &self.blacklist
    }

    fn is_blacklisted(&self, service: &ServiceDefinition) -> bool {
        self.blacklist.iter().any(|entry| {
            (entry.name() == "*" || entry.name() == service.name())
                && entry.host() == service.host()
                && entry.port() == service.port()
        })
    }
}

impl ServiceFilter for BlacklistServiceFilter {
    fn apply(&self, _exchange: &Exchange, services: Vec<ServiceDefinition>) -> Vec<ServiceDefinition> {
        services.into_iter().filter(|service| !self.is_blacklisted(service)).collect()
    }
}

/// Keeps only instances flagged healthy.
#[derive(Debug, Clone, Copy, Default)]
pub struct HealthyServiceFilter;

impl ServiceFilter for HealthyServiceFilter {
    fn apply(&self, _exchange: &Exchange, services: Vec<ServiceDefinition>) -> Vec<ServiceDefinition> {
        services.into_iter().filter(ServiceDefinition::is_healthy).collect()
    }
}

/// Keeps everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassThroughServiceFilter;

impl ServiceFilter for PassThroughServiceFilter {
    fn apply(&self, _exchange: &Exchange, services: Vec<ServiceDefinition>) -> Vec<ServiceDefinition> {
        services
    }
}

/// Applies several filters in order.
#[derive(Debug, Default)]
pub struct CombinedServiceFilter {
    filters: Vec<Arc<dyn ServiceFilter>>,
}

impl CombinedServiceFilter {
    /// Chain `filters`.
    #[must_use]
    pub const fn new(filters: Vec<Arc<dyn ServiceFilter>>) -> Self {
        Self { filters }
    }
}

impl ServiceFilter for CombinedServiceFilter {
    fn apply(&self, exchange: &Exchange, services: Vec<ServiceDefinition>) -> Vec<ServiceDefinition> {
        self.filters
            .iter()
            .fold(services, |services, filter| filter.apply(exchange, services))
    }
}
