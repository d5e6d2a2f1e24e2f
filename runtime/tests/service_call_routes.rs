//! Service calls driven through whole routes.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use conduit_core::prelude::*;
use conduit_runtime::RoutingError;
use conduit_runtime::cloud::{ServiceCallConfiguration, ServiceCallDefinition};
use conduit_runtime::context::RouteDefinition;
use conduit_testing::{MockEndpoints, assertions, init_tracing, test_context};
use serde_json::json;
use std::sync::Arc;

#[tokio::test]
async fn test_round_robin_spreads_calls_over_servers() {
    init_tracing();
    let endpoints = MockEndpoints::new();
    let first = endpoints.endpoint("http:localhost:8081");
    let second = endpoints.endpoint("http:localhost:8082");
    let context = test_context(&endpoints);

    let id = context
        .add_route(RouteDefinition::new("direct:start").service_call(
            ServiceCallDefinition::new("hello-service")
                .static_servers("hello-service@localhost:8081,hello-service@localhost:8082"),
        ))
        .unwrap();
    context.start().unwrap();

    for n in 0..4 {
        let exchange = context.send(&id, Exchange::with_body(json!(n))).await.unwrap();
        assertions::assert_not_failed(&exchange);
    }

    assert_eq!(first.received_count(), 2);
    assert_eq!(second.received_count(), 2);
}

#[tokio::test]
async fn test_consecutive_calls_alternate_between_servers() {
    let endpoints = MockEndpoints::new();
    endpoints.endpoint("http:localhost:8081");
    endpoints.endpoint("http:localhost:8082");
    let context = test_context(&endpoints);

    let id = context
        .add_route(RouteDefinition::new("direct:start").service_call(
            ServiceCallDefinition::new("hello-service")
                .static_servers("hello-service@localhost:8081,hello-service@localhost:8082"),
        ))
        .unwrap();
    context.start().unwrap();

    let mut ports = Vec::new();
    for _ in 0..2 {
        let exchange = context.send(&id, Exchange::new()).await.unwrap();
        ports.push(exchange.header(header::SERVICE_CALL_SERVICE_PORT).cloned().unwrap());
    }
    ports.sort_by_key(|port| port.as_u64());

    assert_eq!(ports, vec![json!(8081), json!(8082)]);
}

#[tokio::test]
async fn test_blacklisted_servers_never_receive() {
    let endpoints = MockEndpoints::new();
    let blocked = endpoints.endpoint("http:127.0.0.1:8080");
    let allowed = endpoints.endpoint("http:127.0.0.1:8081");
    let context = test_context(&endpoints);

    let id = context
        .add_route(RouteDefinition::new("direct:start").service_call(
            ServiceCallDefinition::new("scall")
                .static_servers("scall@127.0.0.1:8080,scall@127.0.0.1:8081")
                .blacklist_servers("*@127.0.0.1:8080"),
        ))
        .unwrap();
    context.start().unwrap();

    for _ in 0..3 {
        context.send(&id, Exchange::new()).await.unwrap();
    }

    assert_eq!(blocked.received_count(), 0);
    assert_eq!(allowed.received_count(), 3);
}

#[tokio::test]
async fn test_local_settings_override_named_and_default() {
    let endpoints = MockEndpoints::new();
    let first = endpoints.endpoint("http:10.0.0.1:8081");
    let second = endpoints.endpoint("http:10.0.0.2:8082");
    let unused = endpoints.endpoint("http:10.0.0.9:9999");
    let context = test_context(&endpoints);

    context.service_call_configurations().set_default(
        ServiceCallConfiguration::new()
            .static_servers("greeting@10.0.0.9:9999")
            .blacklist_servers("*@10.0.0.1:8081"),
    );
    context
        .service_call_configurations()
        .add("named", ServiceCallConfiguration::new().blacklist_servers("*@10.0.0.2:8082"));

    let id = context
        .add_route(RouteDefinition::new("direct:start").service_call(
            ServiceCallDefinition::new("greeting")
                .configuration("named")
                .static_servers("greeting@10.0.0.1:8081,greeting@10.0.0.2:8082"),
        ))
        .unwrap();
    context.start().unwrap();

    for _ in 0..2 {
        context.send(&id, Exchange::new()).await.unwrap();
    }

    assert_eq!(first.received_count(), 2);
    assert_eq!(second.received_count(), 0);
    assert_eq!(unused.received_count(), 0);
}

#[tokio::test]
async fn test_placeholders_resolve_against_context_properties() {
    let endpoints = MockEndpoints::new();
    let properties = MapPropertyResolver::new()
        .with("greeting.name", "greeting")
        .with("greeting.servers", "greeting@localhost:9090");
    let context = test_context(&endpoints).with_properties(Arc::new(properties));

    let id = context
        .add_route(RouteDefinition::new("direct:start").service_call(
            ServiceCallDefinition::new("{{greeting.name}}")
                .component("mock")
                .static_servers("{{greeting.servers}}"),
        ))
        .unwrap();
    context.start().unwrap();

    let exchange = context.send(&id, Exchange::new()).await.unwrap();

    let received = endpoints.endpoint("mock:localhost:9090").received_exchanges();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].header(header::SERVICE_CALL_SERVICE_NAME), Some(&json!("greeting")));
    assert_eq!(exchange.property(property::TO_ENDPOINT), Some(&json!("mock:localhost:9090")));
}

#[test]
fn test_unresolved_placeholder_rejects_route() {
    let endpoints = MockEndpoints::new();
    let context = test_context(&endpoints);

    let result = context.add_route(
        RouteDefinition::new("direct:start")
            .service_call(ServiceCallDefinition::new("greeting").static_servers("{{missing.servers}}")),
    );

    assert!(matches!(result, Err(ConfigError::UnresolvedPlaceholder(_))));
    assert!(context.route_ids().is_empty());
}

#[test]
fn test_service_call_without_discovery_rejects_route() {
    let endpoints = MockEndpoints::new();
    let context = test_context(&endpoints);

    let result = context.add_route(RouteDefinition::new("direct:start").service_call(ServiceCallDefinition::new("greeting")));

    assert_eq!(
        result.unwrap_err(),
        ConfigError::MissingServiceDiscovery {
            service: "greeting".to_string()
        }
    );
}

#[tokio::test]
async fn test_everything_filtered_fails_the_exchange() {
    let endpoints = MockEndpoints::new();
    let context = test_context(&endpoints);

    let id = context
        .add_route(
            RouteDefinition::new("direct:start").service_call(
                ServiceCallDefinition::new("scall")
                    .static_servers("scall@127.0.0.1:8080")
                    .blacklist_servers("*@127.0.0.1:8080"),
            ),
        )
        .unwrap();
    context.start().unwrap();

    let exchange = context.send(&id, Exchange::new()).await.unwrap();

    assertions::assert_failed_with::<RoutingError>(&exchange);
    assert_eq!(
        exchange.failure().unwrap().downcast_ref::<RoutingError>(),
        Some(&RoutingError::NoAvailableService {
            service: "scall".to_string()
        })
    );
}

#[tokio::test]
async fn test_expression_from_default_configuration_builds_uri() {
    let endpoints = MockEndpoints::new();
    let context = test_context(&endpoints);
    context.service_call_configurations().set_default(
        ServiceCallConfiguration::new()
            .expression("mock:${header.ConduitServiceCallServiceHost}/${header.ConduitServiceCallServicePort}"),
    );

    let id = context
        .add_route(
            RouteDefinition::new("direct:start")
                .service_call(ServiceCallDefinition::new("greeting").static_servers("greeting@localhost:7070"))
                .to("mock:result"),
        )
        .unwrap();
    context.start().unwrap();

    context.send(&id, Exchange::new()).await.unwrap();

    assert_eq!(endpoints.endpoint("mock:localhost/7070").received_count(), 1);
    assert_eq!(endpoints.endpoint("mock:result").received_count(), 1);
}
