use crate::cloud::ServiceLoadBalancer;
use crate::error::RoutingError;
use crate::scheduler::capture;
use conduit_core::cloud::ServiceDefinition;
use conduit_core::environment::EndpointResolver;
use conduit_core::exchange::{header, property};
use conduit_core::expression::SimpleTemplate;
use conduit_core::processor::ProcessFuture;
use conduit_core::{Exchange, Failure, Processor};
use std::fmt;
use std::sync::Arc;

/// Scheme used when neither the call nor its configuration names one.
pub const DEFAULT_COMPONENT: &str = "http";

/// Calls a logical service through a load balancer.
///
/// Per exchange the processor renders the service name, picks an instance,
/// records it in the `ConduitServiceCallService*` headers and builds the
/// target uri:
///
/// | configured uri | target |
/// |---|---|
/// | none | `scheme:host:port` |
/// | starts with the service name | name replaced by `host:port`, prefixed with `scheme:` |
/// | anything else | used as is |
///
/// An explicit expression, when set, replaces these rules and may read the
/// service headers. The target is stored in the to-endpoint property before
/// dispatch.
pub struct ServiceCallProcessor {
    id: String,
    name: SimpleTemplate,
    scheme: String,
    uri: Option<SimpleTemplate>,
    expression: Option<SimpleTemplate>,
    load_balancer: ServiceLoadBalancer,
    endpoints: Arc<dyn EndpointResolver>,
}

impl ServiceCallProcessor {
    /// Call `name` through `load_balancer`, dispatching via `endpoints`.
    #[must_use]
    pub fn new(
        name: SimpleTemplate,
        scheme: impl Into<String>,
        load_balancer: ServiceLoadBalancer,
        endpoints: Arc<dyn EndpointResolver>,
    ) -> Self {
        Self {
            id: format!("serviceCall({name})"),
            name,
            scheme: scheme.into(),
            uri: None,
            expression: None,
            load_balancer,
            endpoints,
        }
    }

    /// Target uri template.
    #[must_use]
    pub fn with_uri(mut self, uri: SimpleTemplate) -> Self {
        self.uri = Some(uri);
        self
    }

    /// Template building the whole target uri.
    #[must_use]
    pub fn with_expression(mut self, expression: SimpleTemplate) -> Self {
        self.expression = Some(expression);
        self
    }

    /// The service name template.
    #[must_use]
    pub const fn service_name(&self) -> &SimpleTemplate {
        &self.name
    }

    /// The scheme prefixed to built uris.
    #[must_use]
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// The uri template, if any.
    #[must_use]
    pub const fn uri(&self) -> Option<&SimpleTemplate> {
        self.uri.as_ref()
    }

    /// The load balancer.
    #[must_use]
    pub const fn load_balancer(&self) -> &ServiceLoadBalancer {
        &self.load_balancer
    }

    fn target_uri(&self, exchange: &Exchange, name: &str, service: &ServiceDefinition) -> String {
        if let Some(expression) = &self.expression {
            return expression.render(exchange);
        }
        let address = format!("{}:{}", service.host(), service.port());
        match self.uri.as_ref().map(|uri| uri.render(exchange)) {
            None => format!("{}:{address}", self.scheme),
            Some(uri) => match uri.strip_prefix(name) {
                Some(rest) => format!("{}:{address}{rest}", self.scheme),
                None => uri,
            },
        }
    }
}

impl fmt::Debug for ServiceCallProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceCallProcessor")
            .field("name", &self.name)
            .field("scheme", &self.scheme)
            .field("uri", &self.uri)
            .field("load_balancer", &self.load_balancer)
            .finish_non_exhaustive()
    }
}

fn set_service_headers(exchange: &mut Exchange, service: &ServiceDefinition) {
    let message = exchange.message_mut();
    message.set_header(header::SERVICE_CALL_SERVICE_NAME, service.name());
    message.set_header(header::SERVICE_CALL_SERVICE_HOST, service.host());
    message.set_header(header::SERVICE_CALL_SERVICE_PORT, service.port());
    for (key, value) in service.metadata() {
        message.set_header(format!("{}{key}", header::SERVICE_CALL_SERVICE_META), value.as_str());
    }
}

impl Processor for ServiceCallProcessor {
    fn process<'a>(&'a self, exchange: &'a mut Exchange) -> ProcessFuture<'a> {
        Box::pin(async move {
            let name = self.name.render(exchange);
            let service = self.load_balancer.choose(exchange, &name).await?;
            set_service_headers(exchange, &service);

            let uri = self.target_uri(exchange, &name, &service);
            let endpoint = self
                .endpoints
                .resolve_endpoint(&uri)
                .ok_or_else(|| Failure::from(RoutingError::NoSuchEndpoint(uri.clone())))?;

            exchange.set_property(property::TO_ENDPOINT, uri.as_str());
            tracing::debug!(exchange_id = %exchange.id(), service = %name, uri = %uri, "Calling service");
            capture(endpoint.as_ref(), exchange).await;
            Ok(())
        })
    }

    fn name(&self) -> &str {
        &self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::StaticServiceDiscovery;
    use conduit_testing::MockEndpoints;
    use serde_json::json;

    fn processor(uri: Option<&str>, endpoints: &MockEndpoints) -> ServiceCallProcessor {
        let discovery = StaticServiceDiscovery::new();
        discovery
            .add_service(ServiceDefinition::new("scall", "127.0.0.1", 8080).with_metadata("zone", "eu"));
        let call = ServiceCallProcessor::new(
            SimpleTemplate::parse("scall").unwrap(),
            "mock",
            ServiceLoadBalancer::new(Arc::new(discovery)),
            Arc::new(endpoints.clone()),
        );
        match uri {
            Some(uri) => call.with_uri(SimpleTemplate::parse(uri).unwrap()),
            None => call,
        }
    }

    #[tokio::test]
    async fn test_uri_starting_with_service_name_is_rewritten() {
        let endpoints = MockEndpoints::new();
        let mock = endpoints.endpoint("mock:127.0.0.1:8080/api/123");
        let call = processor(Some("scall/api/${header.customerId}"), &endpoints);
        let mut exchange = Exchange::new();
        exchange.message_mut().set_header("customerId", "123");

        call.process(&mut exchange).await.unwrap();

        assert_eq!(mock.received_count(), 1);
        assert_eq!(exchange.property(property::TO_ENDPOINT), Some(&json!("mock:127.0.0.1:8080/api/123")));
        assert_eq!(exchange.header(header::SERVICE_CALL_SERVICE_HOST), Some(&json!("127.0.0.1")));
        assert_eq!(exchange.header(header::SERVICE_CALL_SERVICE_PORT), Some(&json!(8080)));
        assert_eq!(exchange.header("ConduitServiceCallServiceMeta.zone"), Some(&json!("eu")));
    }

    #[tokio::test]
    async fn test_without_uri_targets_scheme_host_port() {
        let endpoints = MockEndpoints::new();
        let mock = endpoints.endpoint("mock:127.0.0.1:8080");
        let call = processor(None, &endpoints);

        call.process(&mut Exchange::new()).await.unwrap();

        assert_eq!(mock.received_count(), 1);
    }

    #[tokio::test]
    async fn test_foreign_uri_is_used_as_is() {
        let endpoints = MockEndpoints::new();
        let mock = endpoints.endpoint("mock:audit");
        let call = processor(Some("mock:audit"), &endpoints);

        call.process(&mut Exchange::new()).await.unwrap();

        assert_eq!(mock.received_count(), 1);
    }

    #[tokio::test]
    async fn test_expression_reads_service_headers() {
        let endpoints = MockEndpoints::new();
        let mock = endpoints.endpoint("mock:host-127.0.0.1");
        let call = processor(None, &endpoints).with_expression(
            SimpleTemplate::parse("mock:host-${header.ConduitServiceCallServiceHost}").unwrap(),
        );

        call.process(&mut Exchange::new()).await.unwrap();

        assert_eq!(mock.received_count(), 1);
    }

    #[tokio::test]
    async fn test_unknown_service_fails() {
        let endpoints = MockEndpoints::new();
        let discovery = StaticServiceDiscovery::new();
        let call = ServiceCallProcessor::new(
            SimpleTemplate::parse("${header.target}").unwrap(),
            "mock",
            ServiceLoadBalancer::new(Arc::new(discovery)),
            Arc::new(endpoints),
        );
        let mut exchange = Exchange::new();
        exchange.message_mut().set_header("target", "ghost");

        let failure = call.process(&mut exchange).await.unwrap_err();

        assert!(matches!(
            failure.downcast_ref::<RoutingError>(),
            Some(RoutingError::NoAvailableService { service }) if service == "ghost"
        ));
    }
}
