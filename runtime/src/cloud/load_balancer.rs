use crate::cloud::{PassThroughServiceFilter, RoundRobinServiceChooser};
use crate::error::RoutingError;
use conduit_core::Exchange;
use conduit_core::cloud::{ServiceChooser, ServiceDefinition, ServiceDiscovery, ServiceFilter};
use std::sync::Arc;

/// Discovery, then filter, then chooser: resolves one target per call.
#[derive(Debug, Clone)]
pub struct ServiceLoadBalancer {
    discovery: Arc<dyn ServiceDiscovery>,
    filter: Arc<dyn ServiceFilter>,
    chooser: Arc<dyn ServiceChooser>,
}

impl ServiceLoadBalancer {
    /// Balance over `discovery` with no filtering and round-robin selection.
    #[must_use]
    pub fn new(discovery: Arc<dyn ServiceDiscovery>) -> Self {
        Self {
            discovery,
            filter: Arc::new(PassThroughServiceFilter),
            chooser: Arc::new(RoundRobinServiceChooser::new()),
        }
    }

    /// Replace the filter.
    #[must_use]
    pub fn with_filter(mut self, filter: Arc<dyn ServiceFilter>) -> Self {
        self.filter = filter;
        self
    }

    /// Replace the chooser.
    #[must_use]
    pub fn with_chooser(mut self, chooser: Arc<dyn ServiceChooser>) -> Self {
        self.chooser = chooser;
        self
    }

    /// The discovery in use.
    #[must_use]
    pub const fn discovery(&self) -> &Arc<dyn ServiceDiscovery> {
        &self.discovery
    }

    /// The filter in use.
    #[must_use]
    pub const fn filter(&self) -> &Arc<dyn ServiceFilter> {
        &self.filter
    }

    /// The chooser in use.
    #[must_use]
    pub const fn chooser(&self) -> &Arc<dyn ServiceChooser> {
        &self.chooser
    }

    /// Pick one instance of `service` for `exchange`.
    ///
    /// # Errors
    ///
    /// Returns [`RoutingError::NoAvailableService`] when discovery and
    /// filtering leave no candidate.
    pub async fn choose(&self, exchange: &Exchange, service: &str) -> Result<ServiceDefinition, RoutingError> {
        let discovered = self.discovery.services(service).await;
        let discovered_count = discovered.len();
        let candidates = self.filter.apply(exchange, discovered);

        let chosen = self.chooser.choose(&candidates).ok_or_else(|| {
            tracing::warn!(
                service,
                discovered = discovered_count,
                "No available service after filtering"
            );
            RoutingError::NoAvailableService {
                service: service.to_string(),
            }
        })?;

        metrics::counter!("conduit_load_balancer_selections_total", "service" => service.to_string()).increment(1);
        tracing::debug!(
            exchange_id = %exchange.id(),
            service,
            target = %chosen,
            candidates = candidates.len(),
            "Selected service instance"
        );
        Ok(chosen)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::{BlacklistServiceFilter, StaticServiceDiscovery};

    fn discovery() -> StaticServiceDiscovery {
        let discovery = StaticServiceDiscovery::new();
        discovery
            .add_servers("service@127.0.0.1:8080,service@127.0.0.1:8081,service@127.0.0.1:8082")
            .unwrap();
        discovery
    }

    #[tokio::test]
    async fn test_filtered_round_robin() {
        let balancer = ServiceLoadBalancer::new(Arc::new(discovery()))
            .with_filter(Arc::new(BlacklistServiceFilter::new().with_servers("*@127.0.0.1:8080").unwrap()));
        let exchange = Exchange::new();

        let mut ports = Vec::new();
        for _ in 0..4 {
            ports.push(balancer.choose(&exchange, "service").await.unwrap().port());
        }

        assert_eq!(ports, vec![8081, 8082, 8081, 8082]);
    }

    #[tokio::test]
    async fn test_empty_candidates_is_no_available_service() {
        let balancer = ServiceLoadBalancer::new(Arc::new(discovery()));

        let error = balancer.choose(&Exchange::new(), "unknown").await.unwrap_err();

        assert_eq!(
            error,
            RoutingError::NoAvailableService {
                service: "unknown".to_string()
            }
        );
        assert_eq!(error.to_string(), "No available service for: unknown");
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_rotation() {
        let balancer = Arc::new(ServiceLoadBalancer::new(Arc::new(discovery())));
        let mut handles = Vec::new();
        for _ in 0..30 {
            let balancer = Arc::clone(&balancer);
            handles.push(tokio::spawn(async move {
                balancer.choose(&Exchange::new(), "service").await.unwrap().port()
            }));
        }

        let mut counts = std::collections::BTreeMap::new();
        for handle in handles {
            *counts.entry(handle.await.unwrap()).or_insert(0) += 1;
        }

        assert_eq!(counts.values().copied().collect::<Vec<_>>(), vec![10, 10, 10]);
    }
}
