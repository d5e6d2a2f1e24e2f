use conduit_core::ConfigError;
use conduit_core::cloud::{DiscoveryFuture, ServiceDefinition, ServiceDiscovery};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Discovery backed by a manually populated registry.
///
/// Clones share the registry, so servers added after a route was built are
/// visible to it.
///
/// # Example
///
/// ```
/// use conduit_core::cloud::ServiceDiscovery;
/// use conduit_runtime::cloud::StaticServiceDiscovery;
///
/// # futures::executor::block_on(async {
/// let discovery = StaticServiceDiscovery::new();
/// discovery.add_servers("scall@127.0.0.1:8080, scall@127.0.0.1:8081").unwrap();
///
/// assert_eq!(discovery.services("scall").await.len(), 2);
/// assert!(discovery.services("unknown").await.is_empty());
/// # });
/// ```
#[derive(Debug, Clone, Default)]
pub struct StaticServiceDiscovery {
    services: Arc<DashMap<String, Vec<ServiceDefinition>>>,
}

impl StaticServiceDiscovery {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one instance. Duplicates are ignored.
    pub fn add_service(&self, service: ServiceDefinition) {
        let mut entry = self.services.entry(service.name().to_string()).or_default();
        if !entry.contains(&service) {
            entry.push(service);
        }
    }

    /// Register a `name@host:port` server.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidServer`] for a malformed server string.
    pub fn add_server(&self, server: &str) -> Result<(), ConfigError> {
        self.add_service(ServiceDefinition::parse(server, None)?);
        Ok(())
    }

    /// Register a comma separated list of `name@host:port` servers.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidServer`] for the first malformed entry;
    /// entries before it stay registered.
    pub fn add_servers(&self, servers: &str) -> Result<(), ConfigError> {
        servers
            .split(',')
            .filter(|server| !server.trim().is_empty())
            .try_for_each(|server| self.add_server(server))
    }

    /// Unregister a `name@host:port` server. Returns whether it was known.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidServer`] for a malformed server string.
    pub fn remove_server(&self, server: &str) -> Result<bool, ConfigError> {
        let target = ServiceDefinition::parse(server, None)?;
        let Some(mut entry) = self.services.get_mut(target.name()) else {
            return Ok(false);
        };
        let before = entry.len();
        entry.retain(|service| service.host() != target.host() || service.port() != target.port());
        Ok(entry.len() != before)
    }

    /// Names with at least one registered instance.
    #[must_use]
    pub fn service_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .services
            .iter()
            .filter(|entry| !entry.value().is_empty())
            .map(|entry| entry.key().clone())
            .collect();
        names.sort();
        names
    }
}

impl ServiceDiscovery for StaticServiceDiscovery {
    fn services<'a>(&'a self, name: &'a str) -> DiscoveryFuture<'a> {
        let services = self
            .services
            .get(name)
            .map(|entry| entry.value().clone())
            .unwrap_or_default();
        Box::pin(std::future::ready(services))
    }
}

/// Caches another discovery's answers for a fixed time.
#[derive(Debug)]
pub struct CachingServiceDiscovery {
    delegate: Arc<dyn ServiceDiscovery>,
    ttl: Duration,
    cache: DashMap<String, (Instant, Vec<ServiceDefinition>)>,
}

impl CachingServiceDiscovery {
    /// Cache `delegate` for `ttl`.
    #[must_use]
    pub fn new(delegate: Arc<dyn ServiceDiscovery>, ttl: Duration) -> Self {
        Self {
            delegate,
            ttl,
            cache: DashMap::new(),
        }
    }

    /// Drop every cached answer.
    pub fn invalidate(&self) {
        self.cache.clear();
    }
}

impl ServiceDiscovery for CachingServiceDiscovery {
    fn services<'a>(&'a self, name: &'a str) -> DiscoveryFuture<'a> {
        Box::pin(async move {
            if let Some(entry) = self.cache.get(name) {
                let (fetched_at, services) = entry.value();
                if fetched_at.elapsed() < self.ttl {
                    return services.clone();
                }
            }

            let services = self.delegate.services(name).await;
            tracing::debug!(service = name, count = services.len(), "Refreshed service cache");
            self.cache.insert(name.to_string(), (Instant::now(), services.clone()));
            services
        })
    }
}

/// Concatenates the answers of several discoveries, in order.
#[derive(Debug, Default)]
pub struct CombinedServiceDiscovery {
    delegates: Vec<Arc<dyn ServiceDiscovery>>,
}

impl CombinedServiceDiscovery {
    /// Combine `delegates`.
    #[must_use]
    pub const fn new(delegates: Vec<Arc<dyn ServiceDiscovery>>) -> Self {
        Self { delegates }
    }
}

impl ServiceDiscovery for CombinedServiceDiscovery {
    fn services<'a>(&'a self, name: &'a str) -> DiscoveryFuture<'a> {
        Box::pin(async move {
            let mut all = Vec::new();
            for delegate in &self.delegates {
                all.extend(delegate.services(name).await);
            }
            all
        })
    }
}
